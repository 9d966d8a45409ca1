//! Control channel fan-out
//!
//! One `broadcast` channel of pre-serialized frames; every authenticated
//! socket task holds a receiver. Fire-and-forget: a lagging socket drops
//! frames, nothing is retried.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::notification::NotificationListener;
use crate::schema::{FleetState, NotificationRecord};
use crate::supervisor::LightNode;

/// Server-to-operator frame: `{ "event": ..., "payload": ... }`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum ControlPush {
    Authenticated { user: String },
    Unauthorized { reason: String },
    Ping { timestamp: i64 },
    State(FleetState),
    LightNodes(Vec<LightNode>),
    Notification(NotificationRecord),
    Notifications { notifications: Vec<NotificationRecord>, total: usize },
}

impl ControlPush {
    pub fn to_frame(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::warn!("control frame not serialized: {e}");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlBroadcaster {
    tx: broadcast::Sender<String>,
}

impl ControlBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, push: &ControlPush) {
        if let Some(frame) = push.to_frame() {
            // No receivers is fine
            let _ = self.tx.send(frame);
        }
    }

    pub fn push_notification(&self, record: NotificationRecord) {
        self.broadcast(&ControlPush::Notification(record));
    }

    pub fn update_light_nodes(&self, nodes: Vec<LightNode>) {
        self.broadcast(&ControlPush::LightNodes(nodes));
    }

    pub fn update_state(&self, state: FleetState) {
        self.broadcast(&ControlPush::State(state));
    }
}

#[async_trait]
impl NotificationListener for ControlBroadcaster {
    async fn on_notification(&self, record: &NotificationRecord) {
        self.push_notification(record.clone());
    }
}
