use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, Notify};

use super::NodePhase;
use super::runner;
use crate::aggregation::aggregate;
use crate::chain::ChainClient;
use crate::config::CollectorConfig;
use crate::exchanges::FeedSource;
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::notification::{NodeEvent, NotificationBus};
use crate::rpc::{NodeHandle, RpcFault};
use crate::schema::{AuditAction, NodeRunState, TickerReading};
use crate::storage::Storage;
use crate::util::now_ms;

/// Audit actions included in the state export.
const EXPORTED_ACTIONS: usize = 20;

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub id: String,
    pub update_timeout: Duration,
    pub minimum_exchanges_limit: usize,
    pub delta_max_fraction: f64,
    pub shutdown_delay: Duration,
}

impl From<&CollectorConfig> for CollectorSettings {
    fn from(cfg: &CollectorConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            update_timeout: Duration::from_secs(cfg.update_timeout_secs),
            minimum_exchanges_limit: cfg.minimum_exchanges_limit,
            delta_max_fraction: cfg.delta_max_fraction,
            shutdown_delay: Duration::from_secs(cfg.shutdown_delay_secs),
        }
    }
}

/// Result of one update tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Updated,
    Overflow,
    Halted,
}

/// Last accepted reading batch, served to the supervisor.
#[derive(Default)]
struct TickerBatch {
    token: u64,
    readings: Vec<TickerReading>,
}

// ------------------------------------------------------------
// CollectorController
// ------------------------------------------------------------
//
// Owns one collector node: its phase, its run state and the last
// reading batch.
//
// OWNERSHIP:
// - Built once with `new`, shared as `Arc`
// - Keeps a weak self-reference so `start` can spawn the loop from
//   any `&self` caller (RPC handlers, control commands)
//
// LOCKING:
// - One lock per structure (`phase`, `state`, `batch`)
// - No lock is held across a feed, storage or chain call
//
pub struct CollectorController {
    me: Weak<CollectorController>,
    settings: CollectorSettings,

    pub(super) feed: Arc<dyn FeedSource>,
    pub(super) chain: Arc<dyn ChainClient>,
    pub(super) storage: Arc<dyn Storage>,
    pub(super) bus: NotificationBus,

    phase: Mutex<NodePhase>,
    state: Mutex<NodeRunState>,
    batch: Mutex<TickerBatch>,

    /// Consulted at the top of every loop iteration
    pub(super) running: AtomicBool,
    chain_initialized: AtomicBool,

    /// Cuts the inter-tick sleep short on stop
    pub(super) wake: Notify,
}

impl CollectorController {
    pub fn new(
        settings: CollectorSettings,
        feed: Arc<dyn FeedSource>,
        chain: Arc<dyn ChainClient>,
        storage: Arc<dyn Storage>,
        bus: NotificationBus,
    ) -> Arc<Self> {
        let state = NodeRunState::new(settings.id.clone(), now_ms());

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            feed,
            chain,
            storage,
            bus,
            phase: Mutex::new(NodePhase::Stopped),
            state: Mutex::new(state),
            batch: Mutex::new(TickerBatch::default()),
            running: AtomicBool::new(false),
            chain_initialized: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    pub async fn phase(&self) -> NodePhase {
        *self.phase.lock().await
    }

    pub async fn run_state(&self) -> NodeRunState {
        self.state.lock().await.clone()
    }

    pub(super) async fn set_phase(&self, phase: NodePhase) {
        *self.phase.lock().await = phase;
    }

    // --------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------

    /// Starts the update loop from `Stopped` or `Halted`.
    ///
    /// Returns `false` when the request was ignored.
    pub async fn start(&self) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };

        {
            let mut phase = self.phase.lock().await;
            if !phase.can_start() {
                log::warn!("[{}] start ignored in phase {:?}", self.settings.id, *phase);
                return false;
            }
            *phase = NodePhase::Starting;
        }

        // First start only: bring up the chain collaborator. A failure
        // leaves the node running without pushes.
        if !self.chain_initialized.swap(true, Ordering::SeqCst) {
            match self.chain.init().await {
                Ok(()) => runner::spawn_chain_listener(me.clone()).await,
                Err(e) => {
                    log::warn!("[{}] chain init failed, running without pushes: {e:#}", self.settings.id);
                    self.bus
                        .emit(NodeEvent::ContractError {
                            code: "CHAIN_INIT_FAILED".to_string(),
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }

        // A stop that arrived during chain init wins
        {
            let mut phase = self.phase.lock().await;
            if *phase != NodePhase::Starting {
                log::warn!("[{}] start abandoned, phase is now {:?}", self.settings.id, *phase);
                if *phase == NodePhase::Stopping {
                    *phase = NodePhase::Stopped;
                }
                return false;
            }
            self.running.store(true, Ordering::SeqCst);
            *phase = NodePhase::Running;

            let mut state = self.state.lock().await;
            state.running = true;
            state.last_error = None;
        }
        self.bus.emit(NodeEvent::CollectorStarted).await;

        tokio::spawn(runner::run_update_loop(me));
        true
    }

    /// Clears the running flag; the in-flight tick completes, nothing is
    /// rescheduled.
    pub async fn stop(&self) {
        {
            let mut phase = self.phase.lock().await;
            match *phase {
                NodePhase::Running | NodePhase::Starting => *phase = NodePhase::Stopping,
                NodePhase::Halted => *phase = NodePhase::Stopped,
                NodePhase::Stopped | NodePhase::Stopping => return,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
        self.state.lock().await.running = false;
        self.bus.emit(NodeEvent::CollectorStopped).await;
    }

    /// `stop` plus a delayed process exit, so the shutdown notification
    /// can still be polled.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.bus.emit(NodeEvent::CollectorShutdown).await;
        crate::util::terminate_after(self.settings.shutdown_delay);
    }

    // --------------------------------------------------------
    // Update tick
    // --------------------------------------------------------

    pub async fn tick(&self) -> TickOutcome {
        RuntimeMetrics::inc(&METRICS.ticks_run);

        let readings: Vec<TickerReading> = self
            .feed
            .fetch_all()
            .await
            .into_iter()
            .filter(|r| !r.is_faulted())
            .collect();

        if readings.len() < self.settings.minimum_exchanges_limit {
            self.halt(readings.len()).await;
            return TickOutcome::Halted;
        }

        if let Err(e) = self.storage.save_tickers(&readings).await {
            self.bus.emit(NodeEvent::DbError { message: format!("save tickers: {e:#}") }).await;
        }

        let previous = self.state.lock().await.last_average;
        let outcome = aggregate(&readings, previous, self.settings.delta_max_fraction);
        let accepted_count = readings.len() - outcome.rejected.as_ref().map_or(0, Vec::len);

        {
            let mut batch = self.batch.lock().await;
            batch.token += 1;
            batch.readings = readings;
        }

        let result = match outcome.into_average() {
            Ok(average) => {
                {
                    let mut state = self.state.lock().await;
                    state.last_average = average;
                    state.last_error = None;
                }
                self.bus
                    .emit(NodeEvent::RatesUpdated { average, accepted: accepted_count })
                    .await;
                TickOutcome::Updated
            }
            Err((_, rejected)) => {
                RuntimeMetrics::inc(&METRICS.aggregation_overflows);
                self.state.lock().await.last_error = Some("TICKER_DELTA_OVERFLOW".to_string());
                self.bus.emit(NodeEvent::TickerDeltaOverflow { rejected }).await;
                TickOutcome::Overflow
            }
        };

        self.state.lock().await.touch(now_ms());
        self.persist_state().await;
        result
    }

    async fn halt(&self, accepted: usize) {
        self.running.store(false, Ordering::SeqCst);
        self.set_phase(NodePhase::Halted).await;
        {
            let mut state = self.state.lock().await;
            state.running = false;
            state.last_error = Some("NODE_TICKER_MINIMUM_LIMIT".to_string());
            state.touch(now_ms());
        }

        self.bus
            .emit(NodeEvent::NodeTickerMinimumLimit {
                accepted,
                minimum: self.settings.minimum_exchanges_limit,
            })
            .await;
        self.persist_state().await;
    }

    async fn persist_state(&self) {
        let snapshot = self.export_state().await;
        if let Err(e) = self.storage.update_node_state(&snapshot).await {
            self.bus.emit(NodeEvent::DbError { message: format!("update node state: {e:#}") }).await;
        }
    }

    // --------------------------------------------------------
    // Chain push
    // --------------------------------------------------------

    /// Pushes the current average. Failures are reported, never fatal.
    pub async fn push_current_average(&self, trigger: &str) {
        let average = self.state.lock().await.last_average;
        if average == 0.0 {
            log::info!("[{}] chain trigger {trigger} ignored, no average yet", self.settings.id);
            return;
        }

        match self.chain.push(average).await {
            Ok(()) => {
                RuntimeMetrics::inc(&METRICS.chain_pushes);
                self.bus
                    .emit(NodeEvent::ContractEvent { name: trigger.to_string(), value: Some(average) })
                    .await;
            }
            Err(e) => {
                RuntimeMetrics::inc(&METRICS.chain_push_errors);
                self.bus
                    .emit(NodeEvent::ContractError {
                        code: "CHAIN_PUSH_FAILED".to_string(),
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    // --------------------------------------------------------
    // State export
    // --------------------------------------------------------

    pub async fn export_state(&self) -> Value {
        let state = self.state.lock().await.clone();
        let phase = self.phase().await;
        let actions = match self.storage.actions(EXPORTED_ACTIONS).await {
            Ok(actions) => actions,
            Err(e) => {
                log::warn!("[{}] loading audit actions: {e:#}", self.settings.id);
                Vec::new()
            }
        };

        json!({
            "run": state,
            "phase": phase,
            "chain": self.chain.state().await,
            "exchanges": self.feed.exchanges().await,
            "actions": actions,
        })
    }

    pub(super) async fn record_action(&self, name: &str, address: &str, user: &str) {
        let action = AuditAction {
            name: name.to_string(),
            address: address.to_string(),
            user: user.to_string(),
            timestamp: now_ms(),
        };
        if let Err(e) = self.storage.add_action(&action).await {
            log::warn!("[{}] audit action {name} not stored: {e:#}", self.settings.id);
        }
    }
}

#[async_trait]
impl NodeHandle for CollectorController {
    async fn tickers(&self) -> (u64, Vec<TickerReading>) {
        let batch = self.batch.lock().await;
        (batch.token, batch.readings.clone())
    }

    async fn export_state(&self) -> Value {
        CollectorController::export_state(self).await
    }

    async fn on_off(&self, mode: &str) -> Result<(), RpcFault> {
        match mode {
            "on" => {
                self.start().await;
            }
            "off" => self.stop().await,
            "shutdown" => self.shutdown().await,
            _ => return Err(RpcFault::from_wire("BAD_OPERATION", "mode must be on, off or shutdown")),
        }
        Ok(())
    }

    async fn exchange_on_off(&self, exchange_id: usize, mode: &str) -> Result<(), RpcFault> {
        self.feed
            .exchange_on_off(exchange_id, mode)
            .await
            .map_err(|e| RpcFault::from_wire(e.code(), &e.to_string()))
    }
}
