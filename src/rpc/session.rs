use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use super::{RpcFault, verify_proof};
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::notification::NotificationListener;
use crate::schema::NotificationRecord;
use crate::util::{now_ms, random_token};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    HeartbeatTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("requested"),
            DisconnectReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
        }
    }
}

/// Session lifecycle, delivered to the owning collector.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { session_id: String, address: String },
    Disconnected { session_id: String, address: String, reason: DisconnectReason },
}

struct Session {
    remote_address: String,
    last_ping_at: i64,

    /// Set by the watchdog, cleared by every ping. A watchdog tick that
    /// finds it still set expires the session.
    armed: bool,

    /// Next notification index for cursor-based paging
    cursor: usize,

    watchdog: Option<JoinHandle<()>>,
}

/// Public view of one live session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub remote_address: String,
    pub last_ping_at: i64,
    pub armed: bool,
}

// ------------------------------------------------------------
// SessionServer
// ------------------------------------------------------------
//
// Collector-side session table.
//
// Responsibilities:
// - Handshake (proof check, token issue)
// - Heartbeat watchdog per session
// - Process-lifetime notification buffer with per-session cursors
//
// LOCKING:
// - `sessions` and `notifications` are separate locks
// - When both are needed, `sessions` is taken first
//
pub struct SessionServer {
    secret: String,
    ping_timeout: Duration,
    page_max: usize,

    sessions: Mutex<HashMap<String, Session>>,
    notifications: Mutex<Vec<NotificationRecord>>,

    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionServer {
    pub fn new(
        secret: impl Into<String>,
        ping_timeout: Duration,
        page_max: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            secret: secret.into(),
            ping_timeout,
            page_max,
            sessions: Mutex::new(HashMap::new()),
            notifications: Mutex::new(Vec::new()),
            events,
        });
        (server, rx)
    }

    /// Checks `proof` and opens a session.
    ///
    /// Returns `None` on any mismatch; the caller learns nothing else.
    pub async fn connect(self: &Arc<Self>, proof: &str, remote_address: &str) -> Option<String> {
        if !verify_proof(&self.secret, proof) {
            log::warn!("rejected handshake from {remote_address}");
            return None;
        }

        let id = {
            let mut sessions = self.sessions.lock().await;

            let mut id = random_token::<32>();
            while sessions.contains_key(&id) {
                id = random_token::<32>();
            }

            let watchdog = self.spawn_watchdog(id.clone());
            sessions.insert(
                id.clone(),
                Session {
                    remote_address: remote_address.to_string(),
                    last_ping_at: now_ms(),
                    armed: false,
                    cursor: 0,
                    watchdog: Some(watchdog),
                },
            );
            id
        };

        RuntimeMetrics::inc(&METRICS.sessions_active);
        let _ = self.events.send(SessionEvent::Connected {
            session_id: id.clone(),
            address: remote_address.to_string(),
        });

        Some(id)
    }

    /// Heartbeat countdown for one session.
    ///
    /// Every `ping_timeout`: expire the session if no ping arrived since the
    /// previous tick, otherwise re-arm. Holds only a weak reference so a
    /// dropped server stops its watchdogs.
    fn spawn_watchdog(self: &Arc<Self>, id: String) -> JoinHandle<()> {
        let server: Weak<Self> = Arc::downgrade(self);
        let period = self.ping_timeout;

        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            loop {
                tick.tick().await;
                let Some(server) = server.upgrade() else {
                    return;
                };
                if server.heartbeat_tick(&id).await {
                    return;
                }
            }
        })
    }

    /// Returns `true` once the session is gone.
    async fn heartbeat_tick(&self, id: &str) -> bool {
        let expired = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(id) else {
                return true;
            };

            if !session.armed {
                session.armed = true;
                return false;
            }

            // Dropping our own JoinHandle only detaches it.
            sessions.remove(id)
        };

        if let Some(session) = expired {
            log::warn!("session {} from {} expired (no ping)", short(id), session.remote_address);
            RuntimeMetrics::dec(&METRICS.sessions_active);
            RuntimeMetrics::inc(&METRICS.sessions_expired);
            let _ = self.events.send(SessionEvent::Disconnected {
                session_id: id.to_string(),
                address: session.remote_address,
                reason: DisconnectReason::HeartbeatTimeout,
            });
        }
        true
    }

    /// Refreshes the heartbeat of a live session.
    pub async fn ping(&self, id: &str) -> Result<(), RpcFault> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id).ok_or(RpcFault::ConnectionNotFound)?;
        session.armed = false;
        session.last_ping_at = now_ms();
        Ok(())
    }

    /// Ends a session. Returns `false` if it did not exist, which makes
    /// repeated calls harmless.
    pub async fn disconnect(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);

        let Some(mut session) = removed else {
            return false;
        };
        if let Some(watchdog) = session.watchdog.take() {
            watchdog.abort();
        }

        RuntimeMetrics::dec(&METRICS.sessions_active);
        let _ = self.events.send(SessionEvent::Disconnected {
            session_id: id.to_string(),
            address: session.remote_address,
            reason: DisconnectReason::Requested,
        });
        true
    }

    /// Page of buffered notifications for one session.
    ///
    /// - `index < 0` continues from the session cursor
    /// - `count` is capped at the configured page maximum
    /// - the cursor moves to the end of the returned page
    ///
    /// Returns `(page, total)`.
    pub async fn notifications_page(
        &self,
        id: &str,
        index: i64,
        count: usize,
    ) -> Result<(Vec<NotificationRecord>, usize), RpcFault> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id).ok_or(RpcFault::ConnectionNotFound)?;

        let buffer = self.notifications.lock().await;
        let start = if index < 0 { session.cursor } else { index as usize };
        let count = count.min(self.page_max);

        let page: Vec<_> = buffer.iter().skip(start).take(count).cloned().collect();
        session.cursor = start.min(buffer.len()) + page.len();

        Ok((page, buffer.len()))
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<_> = sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                id: id.clone(),
                remote_address: s.remote_address.clone(),
                last_ping_at: s.last_ping_at,
                armed: s.armed,
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn notification_total(&self) -> usize {
        self.notifications.lock().await.len()
    }
}

#[async_trait]
impl NotificationListener for SessionServer {
    async fn on_notification(&self, record: &NotificationRecord) {
        self.notifications.lock().await.push(record.clone());
    }
}

/// Log-safe session id prefix.
pub fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
