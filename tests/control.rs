mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use oracle_net::config::ControlConfig;
use oracle_net::control::{Claims, ControlBroadcaster, ControlChannel, ControlPush, OperatorSession, issue_token};
use oracle_net::supervisor::SupervisorController;

use common::{LocalFactory, supervisor};

const CONTROL_SECRET: &str = "operator-key";

fn control_config() -> ControlConfig {
    ControlConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        secret: CONTROL_SECRET.to_string(),
        auth_timeout_secs: 2,
    }
}

fn channel() -> (Arc<ControlChannel>, Arc<SupervisorController>, Arc<oracle_net::storage::MemoryStorage>) {
    let (sup, storage) = supervisor(Arc::new(LocalFactory::default()));
    let channel = ControlChannel::new(sup.clone(), ControlBroadcaster::new(64), &control_config());
    (channel, sup, storage)
}

fn operator(authenticated: bool) -> OperatorSession {
    OperatorSession {
        user: "ops".into(),
        address: "10.0.0.7".into(),
        authenticated,
    }
}

fn frame(event: &str, payload: Value) -> String {
    json!({ "event": event, "payload": payload }).to_string()
}

fn token() -> String {
    issue_token(CONTROL_SECRET, &Claims { sub: "ops".into(), exp: None }).unwrap()
}

#[tokio::test]
async fn unauthenticated_sockets_dispatch_nothing() {
    let (channel, sup, _) = channel();

    let add = frame("addNode", json!({ "name": "LA", "host": "h", "port": 1, "secret": "x" }));
    assert!(channel.dispatch(&operator(false), &add).await.is_empty());
    assert!(channel.dispatch(&operator(false), &frame("masterOn", json!({ "mode": "on" }))).await.is_empty());

    assert!(sup.light_nodes().await.is_empty());
    assert!(!sup.is_running());
}

#[tokio::test]
async fn commands_reach_the_supervisor() {
    let (channel, sup, storage) = channel();
    let ops = operator(true);

    let replies = channel.dispatch(&ops, &frame("initConnection", Value::Null)).await;
    assert!(matches!(replies.as_slice(), [ControlPush::State(_), ControlPush::LightNodes(_)]));

    let add = frame("addNode", json!({ "name": "LA", "host": "h", "port": 1, "secret": "x" }));
    assert!(channel.dispatch(&ops, &add).await.is_empty());

    let replies = channel.dispatch(&ops, &frame("getLightNodes", Value::Null)).await;
    let [ControlPush::LightNodes(nodes)] = replies.as_slice() else {
        panic!("expected lightNodes, got {replies:?}");
    };
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].name, "LA");

    // The node list never carries the handshake secret
    let raw = ControlPush::LightNodes(nodes.clone()).to_frame().unwrap();
    assert!(!raw.contains("secret"));

    channel.dispatch(&ops, &frame("removeNode", json!({ "id": nodes[0].id }))).await;
    assert!(sup.light_nodes().await.is_empty());

    let replies = channel
        .dispatch(&ops, &frame("getNotifications", json!({ "index": 0, "count": 1000 })))
        .await;
    let [ControlPush::Notifications { notifications, total }] = replies.as_slice() else {
        panic!("expected notifications, got {replies:?}");
    };
    assert!(notifications.len() <= 100);
    assert_eq!(*total, storage.notification_codes().await.len());

    let actions = sup.export_state().await.actions;
    assert!(actions.iter().any(|a| a.name == "ADD_NODE LA" && a.user == "ops"));
}

#[tokio::test]
async fn bad_requests_are_reported() {
    let (channel, _, storage) = channel();
    let ops = operator(true);

    assert!(channel.dispatch(&ops, &frame("selfDestruct", Value::Null)).await.is_empty());
    assert!(channel.dispatch(&ops, "not json").await.is_empty());
    assert!(
        channel
            .dispatch(&ops, &frame("nodeOp", json!({ "id": 0, "code": "reboot", "mode": "on" })))
            .await
            .is_empty()
    );
    channel.dispatch(&ops, &frame("removeNode", json!({ "id": 3 }))).await;

    let codes = storage.notification_codes().await;
    assert_eq!(codes.iter().filter(|c| *c == "RC_BAD_REQUEST").count(), 4);
}

#[tokio::test]
async fn master_on_drives_the_lifecycle() {
    let (channel, sup, _) = channel();
    let ops = operator(true);

    channel.dispatch(&ops, &frame("masterOn", json!({ "mode": "on" }))).await;
    assert!(sup.is_running());
    channel.dispatch(&ops, &frame("masterOn", json!({ "mode": "off" }))).await;
    assert!(!sup.is_running());
}

#[tokio::test]
async fn authenticate_checks_the_bearer_token() {
    let (channel, _, _) = channel();

    let ok = channel
        .authenticate(&frame("authenticate", json!({ "token": token() })), "10.0.0.7")
        .unwrap();
    assert_eq!(ok.user, "ops");
    assert!(ok.authenticated);

    let forged = issue_token("guess", &Claims { sub: "ops".into(), exp: None }).unwrap();
    assert!(channel.authenticate(&frame("authenticate", json!({ "token": forged })), "h").is_err());
    assert!(channel.authenticate(&frame("getState", Value::Null), "h").is_err());
    assert!(channel.authenticate(&frame("authenticate", json!({})), "h").is_err());
}

async fn next_event(ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin)) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame in time")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn websocket_session_end_to_end() {
    let (channel, _, _) = channel();
    let (addr, server) = channel.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws.send(Message::Text(frame("authenticate", json!({ "token": token() })).into()))
        .await
        .unwrap();

    assert_eq!(next_event(&mut ws).await["event"], "authenticated");
    assert_eq!(next_event(&mut ws).await["event"], "ping");

    ws.send(Message::Text(frame("getState", Value::Null).into())).await.unwrap();
    let state = next_event(&mut ws).await;
    assert_eq!(state["event"], "state");
    assert_eq!(state["payload"]["id"], "S0");

    // Fan-out reaches authenticated sockets
    channel.broadcaster().broadcast(&ControlPush::Ping { timestamp: 42 });
    let pushed = next_event(&mut ws).await;
    assert_eq!(pushed["payload"]["timestamp"], 42);

    server.abort();
}

#[tokio::test]
async fn websocket_rejects_a_bad_token() {
    let (channel, _, _) = channel();
    let (addr, server) = channel.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws.send(Message::Text(frame("authenticate", json!({ "token": "a.b.c" })).into()))
        .await
        .unwrap();

    assert_eq!(next_event(&mut ws).await["event"], "unauthorized");
    server.abort();
}
