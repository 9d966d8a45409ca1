use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use super::session::short;
use super::{RpcCall, RpcFault, RpcTransport, connect_proof};
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::schema::{NotificationRecord, PollingConfig, RemoteNodeRecord, TickerReading};

/// Snapshot of a client's connection bookkeeping.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientStatus {
    pub connected: bool,
    pub fail_count: u32,
}

#[derive(Default)]
struct ClientState {
    session: Option<String>,
    fail_count: u32,

    /// Token of the last ticker batch received
    ticker_token: String,
}

/// ============================================================
/// RemoteClient
/// ============================================================
///
/// Supervisor-side driver of the polling RPC against ONE collector.
///
/// Responsibilities:
/// - Handshake and session bookkeeping
/// - Independent heartbeat loop (ping every `ping_rate_secs`)
/// - Failure counting and forced disconnect
///
/// FAILURE CONTRACT (every remote operation):
/// - success resets the failure counter
/// - failure increments it; once it exceeds `request_retry_count`, or
///   the fault is `CONNECTION_NOT_FOUND`, the client drops its session
///   locally so the next sweep must re-handshake
///
/// LOCKING:
/// - `state` is never held across a transport call
pub struct RemoteClient {
    name: String,
    secret: String,
    polling: PollingConfig,
    transport: Arc<dyn RpcTransport>,

    state: Mutex<ClientState>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteClient {
    pub fn new(record: &RemoteNodeRecord, transport: Arc<dyn RpcTransport>) -> Arc<Self> {
        Arc::new(Self {
            name: record.name.clone(),
            secret: record.secret.clone(),
            polling: record.polling.clone(),
            transport,
            state: Mutex::new(ClientState {
                ticker_token: "0".to_string(),
                ..Default::default()
            }),
            ping_task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    pub async fn status(&self) -> ClientStatus {
        let st = self.state.lock().await;
        ClientStatus {
            connected: st.session.is_some(),
            fail_count: st.fail_count,
        }
    }

    // --------------------------------------------------------
    // Connection lifecycle
    // --------------------------------------------------------

    /// Performs the handshake. On success starts the heartbeat loop.
    ///
    /// A failed handshake is not counted as a request failure.
    pub async fn connect(self: &Arc<Self>) -> Option<String> {
        self.state.lock().await.fail_count = 0;

        let proof = connect_proof(&self.secret);
        let id = match self.transport.call(RpcCall::Connect { proof }).await {
            Ok(body) => body.get("connectionId").and_then(Value::as_str).map(str::to_string),
            Err(e) => {
                log::warn!("[{}] connect failed: {}", self.name, e);
                return None;
            }
        };

        let Some(id) = id else {
            log::warn!("[{}] connect refused", self.name);
            return None;
        };

        {
            let mut st = self.state.lock().await;
            st.session = Some(id.clone());
            st.fail_count = 0;
        }
        log::info!("[{}] connected, session {}", self.name, short(&id));

        self.start_ping_loop().await;
        Some(id)
    }

    async fn start_ping_loop(self: &Arc<Self>) {
        let client: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_secs(self.polling.ping_rate_secs.max(1));

        let task = tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            loop {
                tick.tick().await;
                let Some(client) = client.upgrade() else {
                    return;
                };
                if !client.is_connected().await {
                    return;
                }
                let _ = client.ping().await;
            }
        });

        if let Some(old) = self.ping_task.lock().await.replace(task) {
            old.abort();
        }
    }

    /// Drops the local session, stops the heartbeat and tells the
    /// collector, best effort.
    pub async fn disconnect(&self) {
        let session = {
            let mut st = self.state.lock().await;
            st.ticker_token = "0".to_string();
            st.session.take()
        };

        if let Some(task) = self.ping_task.lock().await.take() {
            task.abort();
        }

        if let Some(session) = session {
            log::info!("[{}] disconnect session {}", self.name, short(&session));
            let transport = self.transport.clone();
            tokio::spawn(async move {
                let _ = transport.call(RpcCall::Disconnect { session }).await;
            });
        }
    }

    // --------------------------------------------------------
    // Request bookkeeping
    // --------------------------------------------------------

    async fn request(&self, build: impl FnOnce(String) -> RpcCall) -> Result<Value, RpcFault> {
        self.request_decoded(build, Ok).await
    }

    /// Like `request`, but a body that does not decode counts as a failed
    /// call too.
    async fn request_decoded<T>(
        &self,
        build: impl FnOnce(String) -> RpcCall,
        decode: impl FnOnce(Value) -> Result<T, RpcFault>,
    ) -> Result<T, RpcFault> {
        let session = self.state.lock().await.session.clone();
        let Some(session) = session else {
            return Err(RpcFault::NotConnected);
        };

        let call = build(session);
        let name = call.name();

        match self.transport.call(call).await.and_then(decode) {
            Ok(out) => {
                self.state.lock().await.fail_count = 0;
                RuntimeMetrics::inc(&METRICS.rpc_successes);
                Ok(out)
            }
            Err(fault) => {
                RuntimeMetrics::inc(&METRICS.rpc_failures);
                self.fail(name, &fault).await;
                Err(fault)
            }
        }
    }

    async fn fail(&self, call: &str, fault: &RpcFault) {
        let count = {
            let mut st = self.state.lock().await;
            st.fail_count += 1;
            st.fail_count
        };
        log::debug!("[{}] {} failed ({}/{}): {}", self.name, call, count, self.polling.request_retry_count, fault);

        if count > self.polling.request_retry_count || *fault == RpcFault::ConnectionNotFound {
            log::warn!("[{}] forcing disconnect after {} ({})", self.name, call, fault.code());
            RuntimeMetrics::inc(&METRICS.forced_disconnects);
            self.disconnect().await;
        }
    }

    // --------------------------------------------------------
    // Remote operations
    // --------------------------------------------------------

    pub async fn ping(&self) -> Result<(), RpcFault> {
        self.request(|session| RpcCall::Ping { session }).await.map(|_| ())
    }

    /// New readings since the previous pull (empty if the collector has
    /// not ticked in between).
    pub async fn pull_tickers(&self) -> Result<Vec<TickerReading>, RpcFault> {
        let token = self.state.lock().await.ticker_token.clone();
        let (tickers, token) = self
            .request_decoded(
                |session| RpcCall::Tickers { session, token },
                |body| {
                    let tickers: Vec<TickerReading> =
                        serde_json::from_value(body.get("tickers").cloned().unwrap_or(Value::Null))
                            .map_err(|e| RpcFault::BadResponse(format!("tickers: {e}")))?;
                    let token = body.get("token").and_then(Value::as_str).map(str::to_string);
                    Ok((tickers, token))
                },
            )
            .await?;

        if let Some(token) = token {
            self.state.lock().await.ticker_token = token;
        }
        Ok(tickers)
    }

    pub async fn pull_node_state(&self, node_id: &str) -> Result<Value, RpcFault> {
        let node_id = node_id.to_string();
        let mut body = self.request(|session| RpcCall::NodeState { session, node_id }).await?;
        Ok(body.get_mut("state").map(Value::take).unwrap_or(Value::Null))
    }

    pub async fn pull_notifications(&self, index: i64, count: usize) -> Result<(Vec<NotificationRecord>, usize), RpcFault> {
        self.request_decoded(
            |session| RpcCall::Notifications { session, index, count },
            |body| {
                let notifications = serde_json::from_value(body.get("notifications").cloned().unwrap_or(Value::Null))
                    .map_err(|e| RpcFault::BadResponse(format!("notifications: {e}")))?;
                let total = body.get("total").and_then(Value::as_u64).unwrap_or(0) as usize;
                Ok((notifications, total))
            },
        )
        .await
    }

    pub async fn node_on_off(&self, mode: &str) -> Result<(), RpcFault> {
        let mode = mode.to_string();
        self.request(|session| RpcCall::NodeOnOff { session, mode }).await.map(|_| ())
    }

    pub async fn node_exchange_on_off(&self, exchange_id: usize, mode: &str) -> Result<(), RpcFault> {
        let mode = mode.to_string();
        self.request(|session| RpcCall::ExchangeOnOff { session, exchange_id, mode })
            .await
            .map(|_| ())
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        if let Ok(mut task) = self.ping_task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Answers connect with a fixed id and fails everything else while
    /// `failing` is set.
    #[derive(Default)]
    struct Scripted {
        failing: StdMutex<bool>,
        not_found: StdMutex<bool>,
        garbled: StdMutex<bool>,
        calls: StdMutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl RpcTransport for Scripted {
        async fn call(&self, call: RpcCall) -> Result<Value, RpcFault> {
            self.calls.lock().unwrap().push(call.name());
            match call {
                RpcCall::Connect { .. } => Ok(json!({ "connectionId": "abcdef0123" })),
                RpcCall::Disconnect { .. } => Ok(json!({})),
                _ if *self.not_found.lock().unwrap() => Err(RpcFault::ConnectionNotFound),
                _ if *self.failing.lock().unwrap() => Err(RpcFault::Timeout),
                _ if *self.garbled.lock().unwrap() => Ok(json!({ "tickers": "not-an-array", "notifications": 7 })),
                _ => Ok(json!({ "token": "1", "tickers": [] })),
            }
        }
    }

    fn record(retry: u32) -> RemoteNodeRecord {
        RemoteNodeRecord {
            name: "L0".into(),
            description: String::new(),
            host: "h".into(),
            port: 1,
            secret: "s".into(),
            polling: PollingConfig {
                ping_rate_secs: 3600,
                request_retry_count: retry,
                request_timeout_secs: 1,
            },
        }
    }

    #[tokio::test]
    async fn disconnects_after_retry_plus_one_failures() {
        let transport = Arc::new(Scripted::default());
        let client = RemoteClient::new(&record(2), transport.clone());

        assert!(client.connect().await.is_some());
        *transport.failing.lock().unwrap() = true;

        for _ in 0..2 {
            assert!(client.ping().await.is_err());
            assert!(client.is_connected().await);
        }
        assert!(client.ping().await.is_err());
        assert!(!client.is_connected().await);

        // Nothing is sent without a session
        assert_eq!(client.ping().await, Err(RpcFault::NotConnected));
    }

    #[tokio::test]
    async fn undecodable_replies_count_as_failures() {
        let transport = Arc::new(Scripted::default());
        let client = RemoteClient::new(&record(1), transport.clone());
        client.connect().await.unwrap();

        *transport.garbled.lock().unwrap() = true;
        assert!(matches!(client.pull_tickers().await, Err(RpcFault::BadResponse(_))));
        assert_eq!(client.status().await.fail_count, 1);
        assert!(client.is_connected().await);

        assert!(matches!(client.pull_notifications(-1, 10).await, Err(RpcFault::BadResponse(_))));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let transport = Arc::new(Scripted::default());
        let client = RemoteClient::new(&record(1), transport.clone());
        client.connect().await.unwrap();

        *transport.failing.lock().unwrap() = true;
        assert!(client.ping().await.is_err());
        *transport.failing.lock().unwrap() = false;
        assert!(client.ping().await.is_ok());
        assert_eq!(client.status().await.fail_count, 0);

        *transport.failing.lock().unwrap() = true;
        assert!(client.ping().await.is_err());
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn connection_not_found_disconnects_immediately() {
        let transport = Arc::new(Scripted::default());
        let client = RemoteClient::new(&record(10), transport.clone());
        client.connect().await.unwrap();

        *transport.not_found.lock().unwrap() = true;
        assert_eq!(client.pull_tickers().await, Err(RpcFault::ConnectionNotFound));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn ticker_token_follows_batches() {
        let transport = Arc::new(Scripted::default());
        let client = RemoteClient::new(&record(1), transport.clone());
        client.connect().await.unwrap();

        assert!(client.pull_tickers().await.unwrap().is_empty());
        assert_eq!(client.state.lock().await.ticker_token, "1");
    }
}
