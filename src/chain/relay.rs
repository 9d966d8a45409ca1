use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use serde_json::{Value, json};
use anyhow::{Result, anyhow, bail};

use tokio::time::{Duration, sleep};
use tokio::sync::{mpsc, Mutex, Notify};

use rand::random_range;

use super::{ChainClient, ChainEvent};
use crate::util::now_ms;

const QUEUE_CAPACITY: usize = 256;
const BACKOFF_MIN_SECS: u64 = 1;
const BACKOFF_MAX_SECS: u64 = 30;

/// ============================================================
/// ChainRelay
/// ============================================================
///
/// Represents a **single persistent WebSocket connection** to the
/// signing relay that owns the wallet and the contract.
///
/// Responsibilities:
/// - Perform login handshake (`key=<KEY>&role=collector`)
/// - Send queued push requests
/// - Send periodic JSON pings
/// - Parse inbound trigger / error events
/// - Reconnect automatically with jittered back-off
///
/// Design constraints:
/// - Must never block the update loop
/// - Must tolerate relay restarts
/// - A push while disconnected is reported, never buffered
///
/// WIRE FORMAT (text frames):
/// - out: {"op":"push","value":<f64>,"ts":<ms>}
/// - out: {"op":"ping"}
/// - in:  {"op":"trigger","name":"..."}
/// - in:  {"op":"error","code":"...","message":"..."}
pub struct ChainRelay {
    url: String,
    login_msg: String,
    ping_interval: Duration,

    /// Queue used by `push`; replaced on every reconnect.
    queue: Arc<Mutex<mpsc::Sender<Value>>>,

    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicUsize>,
    started: AtomicBool,

    events_tx: mpsc::Sender<ChainEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ChainEvent>>>,

    last_push: Mutex<Option<(f64, i64)>>,
}

impl ChainRelay {
    pub fn new(url: String, key: &str, ping_interval: Duration) -> Self {
        let (tx, _) = mpsc::channel::<Value>(QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(QUEUE_CAPACITY);

        Self {
            url,
            login_msg: format!("key={key}&role=collector"),
            ping_interval,
            queue: Arc::new(Mutex::new(tx)),
            connected: Arc::new(AtomicBool::new(false)),
            reconnects: Arc::new(AtomicUsize::new(0)),
            started: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            last_push: Mutex::new(None),
        }
    }

    /// Persistent reconnect loop.
    ///
    /// CONTRACT:
    /// - Never returns
    /// - All errors are handled internally
    async fn connect_loop(
        url: String,
        login_msg: String,
        ping_interval: Duration,
        queue: Arc<Mutex<mpsc::Sender<Value>>>,
        connected: Arc<AtomicBool>,
        reconnects: Arc<AtomicUsize>,
        events: mpsc::Sender<ChainEvent>,
    ) {
        let mut backoff = BACKOFF_MIN_SECS;

        loop {
            // Create a fresh queue per connection
            let (tx, rx) = mpsc::channel::<Value>(QUEUE_CAPACITY);
            {
                let mut q = queue.lock().await;
                *q = tx;
            }

            if let Err(e) = Self::try_connect(&url, &login_msg, ping_interval, rx, connected.clone(), events.clone()).await {
                log::warn!("Chain relay connection lost: {e:#}");
                let _ = events.try_send(ChainEvent::Error {
                    code: "RELAY_DISCONNECTED".to_string(),
                    message: e.to_string(),
                });
            }

            // A session that got past login restarts the back-off
            if connected.swap(false, Ordering::SeqCst) {
                backoff = BACKOFF_MIN_SECS;
            }
            reconnects.fetch_add(1, Ordering::Relaxed);

            // Jittered exponential back-off
            let wait = backoff * 1000 + random_range(0..500);
            sleep(Duration::from_millis(wait)).await;
            backoff = (backoff * 2).min(BACKOFF_MAX_SECS);
        }
    }

    /// Establishes a single WebSocket connection to the relay.
    ///
    /// TERMINATION:
    /// - Returns an error when the connection is closed or a send fails
    async fn try_connect(
        url: &str,
        login_msg: &str,
        ping_interval: Duration,
        mut rx: mpsc::Receiver<Value>,
        connected: Arc<AtomicBool>,
        events: mpsc::Sender<ChainEvent>,
    ) -> Result<()> {
        let (ws, _) = connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        // Used to notify the writer when the reader detects EOF
        let closed = Arc::new(Notify::new());

        // ------------------------------------------------------------
        // LOGIN HANDSHAKE
        // ------------------------------------------------------------
        write.send(Message::Text(login_msg.to_string().into())).await?;
        connected.store(true, Ordering::SeqCst);
        log::info!("Chain relay connected: {url}");

        let mut ping = tokio::time::interval(ping_interval);

        // ------------------------------------------------------------
        // READER TASK
        // ------------------------------------------------------------
        let reader = tokio::spawn({
            let closed = closed.clone();

            async move {
                while let Some(Ok(msg)) = read.next().await {
                    if let Message::Text(text) = msg {
                        match parse_relay_message(&text) {
                            Some(event) => {
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                            None => log::debug!("[relay RECV] {text}"),
                        }
                    }
                }

                log::debug!("Chain relay reader ended (EOF)");
                closed.notify_one();
            }
        });

        // ------------------------------------------------------------
        // WRITER LOOP
        // ------------------------------------------------------------
        let result = loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    let json = serde_json::to_string(&msg)?;
                    log::debug!("[relay SEND] {json}");
                    if let Err(e) = write.send(Message::Text(json.into())).await {
                        break Err(e.into());
                    }
                }

                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Text(r#"{"op":"ping"}"#.into())).await {
                        break Err(e.into());
                    }
                }

                _ = closed.notified() => {
                    break Err(anyhow!("relay closed connection"));
                }
            }
        };

        reader.abort();
        result
    }
}

/// Decodes an inbound relay frame. Pongs and unknown ops yield `None`.
pub fn parse_relay_message(raw: &str) -> Option<ChainEvent> {
    let v: Value = serde_json::from_str(raw).ok()?;

    match v.get("op")?.as_str()? {
        "trigger" => Some(ChainEvent::Trigger {
            name: v.get("name").and_then(Value::as_str).unwrap_or("trigger").to_string(),
        }),
        "error" => Some(ChainEvent::Error {
            code: v.get("code").and_then(Value::as_str).unwrap_or("RELAY_ERROR").to_string(),
            message: v.get("message").and_then(Value::as_str).unwrap_or_default().to_string(),
        }),
        _ => None,
    }
}

#[async_trait]
impl ChainClient for ChainRelay {
    async fn init(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            bail!("chain relay url must be ws:// or wss://, got {}", self.url);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tokio::spawn(Self::connect_loop(
            self.url.clone(),
            self.login_msg.clone(),
            self.ping_interval,
            self.queue.clone(),
            self.connected.clone(),
            self.reconnects.clone(),
            self.events_tx.clone(),
        ));
        Ok(())
    }

    /// Enqueues a push request.
    ///
    /// Uses non-blocking `try_send`; a full queue is an error here,
    /// unlike a dropped heartbeat.
    async fn push(&self, value: f64) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("chain relay not connected");
        }

        let ts = now_ms();
        let tx = self.queue.lock().await;
        match tx.try_send(json!({ "op": "push", "value": value, "ts": ts })) {
            Ok(()) => {
                *self.last_push.lock().await = Some((value, ts));
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => bail!("chain push queue full"),
            Err(e) => Err(anyhow!("chain push failed: {e}")),
        }
    }

    async fn state(&self) -> Value {
        let last = *self.last_push.lock().await;
        json!({
            "kind": "relay",
            "url": self.url,
            "connected": self.connected.load(Ordering::SeqCst),
            "reconnects": self.reconnects.load(Ordering::Relaxed),
            "last_push": last.map(|(value, ts)| json!({ "value": value, "timestamp": ts })),
        })
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<ChainEvent>> {
        self.events_rx.lock().await.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inbound_frames() {
        assert_eq!(
            parse_relay_message(r#"{"op":"trigger","name":"NewRound"}"#),
            Some(ChainEvent::Trigger { name: "NewRound".into() })
        );
        assert_eq!(
            parse_relay_message(r#"{"op":"error","code":"NONCE","message":"too low"}"#),
            Some(ChainEvent::Error { code: "NONCE".into(), message: "too low".into() })
        );
        assert_eq!(parse_relay_message(r#"{"op":"pong"}"#), None);
        assert_eq!(parse_relay_message("not json"), None);
    }

    #[tokio::test]
    async fn rejects_non_websocket_url() {
        let relay = ChainRelay::new("https://relay".into(), "k", Duration::from_secs(30));
        assert!(relay.init().await.is_err());
    }

    #[tokio::test]
    async fn push_before_connect_is_reported() {
        let relay = ChainRelay::new("ws://127.0.0.1:1".into(), "k", Duration::from_secs(30));
        assert!(relay.push(1.0).await.is_err());
        assert_eq!(relay.state().await["connected"], false);
        assert!(relay.take_events().await.is_some());
        assert!(relay.take_events().await.is_none());
    }
}
