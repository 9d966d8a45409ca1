use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::alert::Alerter;
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::schema::{NotificationRecord, TickerReading};
use crate::storage::Storage;
use crate::util::now_ms;

// ------------------------------------------------------------
// Domain events
// ------------------------------------------------------------
//
// Closed set of everything either node role can announce.
//
// Serialized adjacently tagged so `code` is the wire code and
// `payload` the variant body:
//   { "code": "RATES_UPDATED", "payload": { "average": 1.0, ... } }
//
// IMPORTANT:
// - Variant names ARE the wire codes. Renaming one breaks operator UIs
//   and stored history.
//
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "code", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeEvent {
    // Collector lifecycle
    CollectorStarted,
    CollectorStopped,
    CollectorShutdown,

    // Collector RPC sessions
    ClientConnected { session_id: String, address: String },
    ClientDisconnected { session_id: String, reason: String },

    // Collector update loop
    RatesUpdated { average: f64, accepted: usize },
    TickerDeltaOverflow { rejected: Vec<TickerReading> },
    NodeTickerMinimumLimit { accepted: usize, minimum: usize },

    // Chain collaborator
    ContractEvent { name: String, value: Option<f64> },
    ContractError { code: String, message: String },

    DbError { message: String },

    // Supervisor lifecycle
    SupervisorStarted,
    SupervisorStopped,
    SupervisorShutdown,

    // Fleet membership and connectivity
    NodeAdded { node_id: u32, name: String },
    NodeRemoved { node_id: u32, name: String },
    NodeUnableToConnect { node_id: u32, name: String, reason: String },
    NodeConnected { node_id: u32, name: String },
    NodeDisconnected { node_id: u32, name: String },

    // Fleet aggregation
    NodeTickerDeltaOverflow { node_id: u32, rejected: Vec<TickerReading> },
    NodeError { node_id: u32, code: String, message: String },

    /// Record pulled from a collector, tagged with its fleet id.
    NodeNotification { node_id: u32, record: NotificationRecord },

    /// Operator command that could not be served.
    RcBadRequest { event: String, reason: String },
}

impl NodeEvent {
    /// Codes forwarded to the alerting collaborator.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            NodeEvent::CollectorStarted
                | NodeEvent::CollectorStopped
                | NodeEvent::CollectorShutdown
                | NodeEvent::TickerDeltaOverflow { .. }
                | NodeEvent::NodeTickerMinimumLimit { .. }
                | NodeEvent::ContractError { .. }
                | NodeEvent::SupervisorStarted
                | NodeEvent::SupervisorStopped
                | NodeEvent::SupervisorShutdown
                | NodeEvent::NodeUnableToConnect { .. }
                | NodeEvent::NodeTickerDeltaOverflow { .. }
        )
    }

    fn is_error(&self) -> bool {
        matches!(
            self,
            NodeEvent::TickerDeltaOverflow { .. }
                | NodeEvent::NodeTickerMinimumLimit { .. }
                | NodeEvent::ContractError { .. }
                | NodeEvent::DbError { .. }
                | NodeEvent::NodeUnableToConnect { .. }
                | NodeEvent::NodeTickerDeltaOverflow { .. }
                | NodeEvent::NodeError { .. }
                | NodeEvent::RcBadRequest { .. }
        )
    }

    /// Flattens the event into the stored/transmitted record shape.
    pub fn into_record(self, node_id: &str, timestamp: i64) -> NotificationRecord {
        let (code, payload) = match serde_json::to_value(&self) {
            Ok(Value::Object(mut map)) => {
                let code = match map.remove("code") {
                    Some(Value::String(code)) => code,
                    _ => String::from("UNKNOWN"),
                };
                (code, map.remove("payload").unwrap_or(Value::Null))
            }
            _ => (String::from("UNKNOWN"), Value::Null),
        };

        NotificationRecord {
            node_id: node_id.to_string(),
            timestamp,
            code,
            payload,
        }
    }
}

/// In-process consumer of emitted records (RPC buffer, operator fan-out).
#[async_trait]
pub trait NotificationListener: Send + Sync {
    async fn on_notification(&self, record: &NotificationRecord);
}

// ------------------------------------------------------------
// NotificationBus
// ------------------------------------------------------------
//
// Emission pipeline, in order:
// 1. log
// 2. storage (failures are logged, never re-emitted)
// 3. alerting (spawned, fire-and-forget)
// 4. every registered listener
//
// Cheap to clone; all clones share one listener list.
//
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    node_id: String,
    storage: Arc<dyn Storage>,
    alerter: Arc<dyn Alerter>,
    listeners: RwLock<Vec<Arc<dyn NotificationListener>>>,
}

impl NotificationBus {
    pub fn new(node_id: impl Into<String>, storage: Arc<dyn Storage>, alerter: Arc<dyn Alerter>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                node_id: node_id.into(),
                storage,
                alerter,
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub async fn subscribe(&self, listener: Arc<dyn NotificationListener>) {
        self.inner.listeners.write().await.push(listener);
    }

    pub async fn emit(&self, event: NodeEvent) -> NotificationRecord {
        let alert = event.is_alert();
        let error = event.is_error();
        let record = event.into_record(&self.inner.node_id, now_ms());

        if error {
            log::warn!("[{}] {} {}", record.node_id, record.code, record.payload);
        } else {
            log::info!("[{}] {} {}", record.node_id, record.code, record.payload);
        }
        RuntimeMetrics::inc(&METRICS.notifications_emitted);

        if let Err(e) = self.inner.storage.add_notification(&record).await {
            log::warn!("notification {} not stored: {e:#}", record.code);
        }

        if alert {
            let alerter = self.inner.alerter.clone();
            let rec = record.clone();
            tokio::spawn(async move {
                if let Err(e) = alerter.notify(&rec).await {
                    log::warn!("alert {} not delivered: {e:#}", rec.code);
                }
            });
        }

        let listeners = self.inner.listeners.read().await.clone();
        for listener in listeners {
            listener.on_notification(&record).await;
        }

        record
    }
}
