mod common;

use std::sync::Arc;
use std::time::Duration;

use oracle_net::rpc::{
    HttpTransport, LocalTransport, RemoteClient, RpcCall, RpcFault, RpcTransport, SessionEvent, connect_proof, serve,
};
use oracle_net::schema::RemoteNodeRecord;

use common::{SECRET, collector, polling};

fn record(secret: &str, retry: u32) -> RemoteNodeRecord {
    RemoteNodeRecord {
        name: "L0".into(),
        description: String::new(),
        host: "127.0.0.1".into(),
        port: 0,
        secret: secret.into(),
        polling: polling(retry),
    }
}

#[tokio::test]
async fn handshake_requires_the_shared_secret() {
    let rig = collector("L0", 1).await;
    let transport = LocalTransport::new(rig.rpc.clone(), "10.0.0.9");

    let body = transport.call(RpcCall::Connect { proof: connect_proof("wrong") }).await.unwrap();
    assert_eq!(body["code"], "noconnect");
    assert!(body.get("connectionId").is_none());

    let body = transport.call(RpcCall::Connect { proof: connect_proof(SECRET) }).await.unwrap();
    let session = body["connectionId"].as_str().unwrap().to_string();

    let pong = transport.call(RpcCall::Ping { session: session.clone() }).await.unwrap();
    assert_eq!(pong["res"], "pong");

    assert_eq!(
        transport.call(RpcCall::Ping { session: "unissued".into() }).await,
        Err(RpcFault::ConnectionNotFound)
    );

    transport.call(RpcCall::Disconnect { session: session.clone() }).await.unwrap();
    assert_eq!(
        transport.call(RpcCall::Ping { session }).await,
        Err(RpcFault::ConnectionNotFound)
    );
}

#[tokio::test]
async fn client_pulls_each_batch_once() {
    let rig = collector("L0", 1).await;
    let client = RemoteClient::new(&record(SECRET, 2), Arc::new(LocalTransport::new(rig.rpc.clone(), "10.0.0.9")));
    client.connect().await.unwrap();

    assert!(client.pull_tickers().await.unwrap().is_empty());

    rig.feed.set_values(&[100.0, 101.0]);
    rig.controller.tick().await;
    assert_eq!(client.pull_tickers().await.unwrap().len(), 2);
    assert!(client.pull_tickers().await.unwrap().is_empty());

    let state = client.pull_node_state("S0").await.unwrap();
    assert_eq!(state["run"]["last_average"], 100.5);

    let (records, total) = client.pull_notifications(-1, 100).await.unwrap();
    assert_eq!(records.len(), total);
    assert!(records.iter().any(|r| r.code == "RATES_UPDATED"));
    let (records, _) = client.pull_notifications(-1, 100).await.unwrap();
    assert!(records.is_empty());

    assert_eq!(client.node_exchange_on_off(0, "off").await, Ok(()));
    assert_eq!(
        client.node_exchange_on_off(0, "sideways").await.unwrap_err().code(),
        "BAD_OPERATION"
    );
}

#[tokio::test(start_paused = true)]
async fn expired_session_forces_a_fresh_handshake() {
    let mut rig = collector("L0", 1).await;
    let client = RemoteClient::new(&record(SECRET, 5), Arc::new(LocalTransport::new(rig.rpc.clone(), "10.0.0.9")));

    let first = client.connect().await.unwrap();
    assert!(matches!(rig.session_events.recv().await, Some(SessionEvent::Connected { .. })));

    // Two silent heartbeat windows
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(matches!(rig.session_events.recv().await, Some(SessionEvent::Disconnected { .. })));

    assert_eq!(client.pull_tickers().await, Err(RpcFault::ConnectionNotFound));
    assert!(!client.is_connected().await);

    let second = client.connect().await.unwrap();
    assert_ne!(first, second);
    assert!(client.ping().await.is_ok());
}

#[tokio::test]
async fn retry_budget_then_reconnect() {
    let rig = collector("L0", 1).await;
    let client = RemoteClient::new(&record(SECRET, 1), Arc::new(LocalTransport::new(rig.rpc.clone(), "10.0.0.9")));
    client.connect().await.unwrap();

    // Remote rejections count as failures too
    assert!(client.node_on_off("sideways").await.is_err());
    assert!(client.is_connected().await);
    assert!(client.node_on_off("sideways").await.is_err());
    assert!(!client.is_connected().await);
    assert_eq!(client.ping().await, Err(RpcFault::NotConnected));

    assert!(client.connect().await.is_some());
    assert_eq!(client.status().await.fail_count, 0);
}

#[tokio::test]
async fn http_surface_serves_the_same_calls() {
    oracle_net::util::install_crypto_provider();
    let rig = collector("L0", 1).await;
    let (addr, server) = serve("127.0.0.1:0".parse().unwrap(), rig.rpc.clone()).await.unwrap();

    let transport = HttpTransport::new("127.0.0.1", addr.port(), Duration::from_secs(5)).unwrap();

    let body = transport.call(RpcCall::Connect { proof: connect_proof(SECRET) }).await.unwrap();
    let session = body["connectionId"].as_str().unwrap().to_string();
    assert_eq!(session.len(), 64);

    let pong = transport.call(RpcCall::Ping { session: session.clone() }).await.unwrap();
    assert_eq!(pong["res"], "pong");

    let body = transport
        .call(RpcCall::Notifications { session: session.clone(), index: -1, count: 10 })
        .await
        .unwrap();
    assert!(body["notifications"].is_array());

    assert_eq!(
        transport.call(RpcCall::Ping { session: "unissued".into() }).await,
        Err(RpcFault::ConnectionNotFound)
    );
    assert_eq!(
        transport
            .call(RpcCall::ExchangeOnOff { session, exchange_id: 9, mode: "on".into() })
            .await
            .unwrap_err()
            .code(),
        "BAD_EXCHANGE_ID"
    );

    server.abort();
}
