use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::rpc::RemoteClient;
use crate::schema::{RemoteNodeRecord, TickerReading};

/// Redacted view of a fleet member, safe to send to operator UIs.
///
/// No secret, no client handle.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LightNode {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub host: String,
    pub port: u16,
    pub connected: bool,
    pub active: bool,
    pub fail_count: u32,
    pub last_average: f64,
    pub last_error: Option<String>,
    pub readings_received: usize,
}

#[derive(Default)]
struct NodeInner {
    /// Per-node update flag; cleared on overflow, re-armed by `nodeOp onoff on`
    active: bool,

    /// Connectivity as of the last sweep
    alive: bool,

    /// Readings pulled since the last aggregation of this node
    fresh: Vec<TickerReading>,
    readings_received: usize,

    last_average: f64,
    last_error: Option<String>,

    /// Last state payload pulled from the collector
    state: Value,
}

/// Connectivity change observed by `mark_alive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connected,
    Disconnected,
    Unchanged,
}

// ------------------------------------------------------------
// RemoteNode
// ------------------------------------------------------------
//
// One fleet member: its record, its only RemoteClient and the
// supervisor-side bookkeeping the sweep needs.
//
// Mutated only by the sweep and by operator commands, both through
// `inner`. The lock is never held across an RPC call.
//
pub struct RemoteNode {
    pub id: u32,
    pub record: RemoteNodeRecord,
    pub client: Arc<RemoteClient>,
    inner: Mutex<NodeInner>,
}

impl RemoteNode {
    pub fn new(id: u32, record: RemoteNodeRecord, client: Arc<RemoteClient>) -> Self {
        Self {
            id,
            record,
            client,
            inner: Mutex::new(NodeInner {
                active: true,
                ..Default::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.active
    }

    pub async fn set_active(&self, active: bool) {
        self.inner.lock().await.active = active;
    }

    pub async fn is_alive(&self) -> bool {
        self.inner.lock().await.alive
    }

    pub async fn mark_alive(&self, alive: bool) -> Transition {
        let mut inner = self.inner.lock().await;
        let was = std::mem::replace(&mut inner.alive, alive);
        match (was, alive) {
            (false, true) => Transition::Connected,
            (true, false) => Transition::Disconnected,
            _ => Transition::Unchanged,
        }
    }

    pub async fn set_state(&self, state: Value) {
        self.inner.lock().await.state = state;
    }

    pub async fn state(&self) -> Value {
        self.inner.lock().await.state.clone()
    }

    pub async fn append_readings(&self, readings: &[TickerReading]) {
        let mut inner = self.inner.lock().await;
        inner.readings_received += readings.len();
        inner.fresh.extend_from_slice(readings);
    }

    /// Hands over the readings pulled since the previous call, with the
    /// node's running average.
    pub async fn take_fresh(&self) -> (Vec<TickerReading>, f64) {
        let mut inner = self.inner.lock().await;
        (std::mem::take(&mut inner.fresh), inner.last_average)
    }

    pub async fn accept_average(&self, average: f64) {
        let mut inner = self.inner.lock().await;
        inner.last_average = average;
        inner.last_error = None;
    }

    /// Records an overflow and parks the node until it is re-armed.
    pub async fn reject(&self, code: &str) {
        let mut inner = self.inner.lock().await;
        inner.last_error = Some(code.to_string());
        inner.active = false;
    }

    pub async fn light(&self) -> LightNode {
        let status = self.client.status().await;
        let inner = self.inner.lock().await;
        LightNode {
            id: self.id,
            name: self.record.name.clone(),
            description: self.record.description.clone(),
            host: self.record.host.clone(),
            port: self.record.port,
            connected: status.connected,
            active: inner.active,
            fail_count: status.fail_count,
            last_average: inner.last_average,
            last_error: inner.last_error.clone(),
            readings_received: inner.readings_received,
        }
    }
}
