use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock, broadcast};
use tokio::time::sleep;

use super::history::FleetPriceHistory;
use super::node::{LightNode, RemoteNode, Transition};
use crate::aggregation::{aggregate, aggregate_fleet};
use crate::config::{RemoteNodeConfig, SupervisorConfig};
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::notification::{NodeEvent, NotificationBus};
use crate::rpc::{RemoteClient, RpcFault, TransportFactory};
use crate::schema::{AuditAction, FleetState, NodeRunState, PollingConfig, RemoteNodeRecord};
use crate::storage::Storage;
use crate::util::now_ms;

/// Records pulled from each collector per sweep.
const NOTIFICATION_PULL: usize = 100;

/// Audit actions included in the state export.
const EXPORTED_ACTIONS: usize = 20;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub id: String,
    pub update_timeout: Duration,
    pub delta_max_fraction: f64,
    pub polling: PollingConfig,
    pub shutdown_delay: Duration,
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            update_timeout: Duration::from_secs(cfg.update_timeout_secs),
            delta_max_fraction: cfg.delta_max_fraction,
            polling: cfg.polling(),
            shutdown_delay: Duration::from_secs(cfg.shutdown_delay_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown node {0}")]
    UnknownNode(u32),

    #[error("node name `{0}` is already in use")]
    DuplicateName(String),

    #[error("unknown mode `{0}`")]
    BadOperation(String),

    #[error(transparent)]
    Rpc(#[from] RpcFault),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn code(&self) -> &str {
        match self {
            SupervisorError::UnknownNode(_) => "UNKNOWN_NODE",
            SupervisorError::DuplicateName(_) => "DUPLICATE_NODE",
            SupervisorError::BadOperation(_) => "BAD_OPERATION",
            SupervisorError::Rpc(fault) => fault.code(),
            SupervisorError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Operator command forwarded to one collector.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOp {
    /// `mode`: on | off | shutdown
    OnOff { mode: String },
    ExchangeOnOff { exchange_id: usize, mode: String },
}

/// Published whenever operator UIs should refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetChange {
    State,
    Nodes,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SweepOutcome {
    /// Active nodes visited this sweep, reachable or not
    pub updated: usize,
    /// Visited nodes that answered
    pub reached: usize,
    pub fleet_average: Option<f64>,
}

// ------------------------------------------------------------
// SupervisorController
// ------------------------------------------------------------
//
// Owns the fleet: the node registry, the sweep loop, the fleet run
// state and the price history.
//
// SWEEP:
// - Visits active nodes one after another, in id order
// - Aggregates every node that delivered readings, then the fleet
// - Reschedules itself while any node is active; unreachable nodes
//   are retried with a fresh handshake on the next sweep
//
// LOCKING:
// - `nodes` is read-locked only to snapshot the registry
// - Node bookkeeping lives behind each node's own lock
//
pub struct SupervisorController {
    me: Weak<SupervisorController>,
    settings: SupervisorSettings,

    storage: Arc<dyn Storage>,
    bus: NotificationBus,
    transports: Arc<dyn TransportFactory>,

    nodes: RwLock<BTreeMap<u32, Arc<RemoteNode>>>,
    next_id: AtomicU32,

    state: Mutex<NodeRunState>,
    history: Mutex<FleetPriceHistory>,

    running: AtomicBool,

    /// Set while a sweep loop task exists
    sweeping: AtomicBool,
    wake: Notify,

    changes: broadcast::Sender<FleetChange>,
}

impl SupervisorController {
    pub fn new(
        settings: SupervisorSettings,
        storage: Arc<dyn Storage>,
        bus: NotificationBus,
        transports: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let state = NodeRunState::new(settings.id.clone(), now_ms());
        let (changes, _) = broadcast::channel(64);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            storage,
            bus,
            transports,
            nodes: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(0),
            state: Mutex::new(state),
            history: Mutex::new(FleetPriceHistory::new()),
            running: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            wake: Notify::new(),
            changes,
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<FleetChange> {
        self.changes.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn history(&self) -> FleetPriceHistory {
        self.history.lock().await.clone()
    }

    fn publish(&self, change: FleetChange) {
        // No subscriber is fine
        let _ = self.changes.send(change);
    }

    // --------------------------------------------------------
    // Node registry
    // --------------------------------------------------------

    /// Registers stored nodes, then configured nodes not stored yet.
    pub async fn load_nodes(&self, configured: Vec<RemoteNodeConfig>) -> anyhow::Result<()> {
        for record in self.storage.remote_nodes().await? {
            let name = record.name.clone();
            if let Err(e) = self.register(record).await {
                log::warn!("stored node {name} skipped: {e}");
            }
        }

        for cfg in configured {
            let record = cfg.into_record(self.settings.polling.clone());
            match self.register(record.clone()).await {
                Ok(_) => self.storage.add_remote_node(&record).await?,
                Err(SupervisorError::DuplicateName(_)) => {}
                Err(e) => log::warn!("configured node {} skipped: {e}", record.name),
            }
        }

        log::info!("[{}] fleet of {} node(s) loaded", self.settings.id, self.nodes.read().await.len());
        Ok(())
    }

    async fn register(&self, record: RemoteNodeRecord) -> Result<u32, SupervisorError> {
        let transport = self.transports.create(&record)?;

        let mut nodes = self.nodes.write().await;
        if nodes.values().any(|n| n.name() == record.name) {
            return Err(SupervisorError::DuplicateName(record.name));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let client = RemoteClient::new(&record, transport);
        nodes.insert(id, Arc::new(RemoteNode::new(id, record, client)));
        Ok(id)
    }

    pub async fn add_node(&self, cfg: RemoteNodeConfig) -> Result<u32, SupervisorError> {
        let record = cfg.into_record(self.settings.polling.clone());
        let id = self.register(record.clone()).await?;

        if let Err(e) = self.storage.add_remote_node(&record).await {
            self.bus.emit(NodeEvent::DbError { message: format!("add node: {e:#}") }).await;
        }

        self.bus.emit(NodeEvent::NodeAdded { node_id: id, name: record.name }).await;
        self.publish(FleetChange::Nodes);
        self.ensure_sweeping();
        Ok(id)
    }

    pub async fn remove_node(&self, id: u32) -> Result<(), SupervisorError> {
        let node = self
            .nodes
            .write()
            .await
            .remove(&id)
            .ok_or(SupervisorError::UnknownNode(id))?;

        node.client.disconnect().await;

        if let Err(e) = self.storage.remove_remote_node(node.name()).await {
            self.bus.emit(NodeEvent::DbError { message: format!("remove node: {e:#}") }).await;
        }

        self.bus
            .emit(NodeEvent::NodeRemoved { node_id: id, name: node.name().to_string() })
            .await;
        self.publish(FleetChange::Nodes);
        Ok(())
    }

    pub async fn node(&self, id: u32) -> Option<Arc<RemoteNode>> {
        self.nodes.read().await.get(&id).cloned()
    }

    /// Registry snapshot in id order.
    async fn snapshot(&self) -> Vec<Arc<RemoteNode>> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn light_nodes(&self) -> Vec<LightNode> {
        let mut out = Vec::new();
        for node in self.snapshot().await {
            out.push(node.light().await);
        }
        out
    }

    /// Forwards an operator command to one collector.
    ///
    /// `onoff on` also re-arms the node's update flag and restarts a
    /// parked sweep loop.
    pub async fn node_op(&self, id: u32, op: NodeOp) -> Result<(), SupervisorError> {
        let node = self.node(id).await.ok_or(SupervisorError::UnknownNode(id))?;

        match op {
            NodeOp::OnOff { mode } => {
                if !matches!(mode.as_str(), "on" | "off" | "shutdown") {
                    return Err(SupervisorError::BadOperation(mode));
                }

                if mode == "on" {
                    node.set_active(true).await;
                    self.publish(FleetChange::Nodes);
                    self.ensure_sweeping();

                    // Not reachable yet: the next sweep connects it
                    if !node.client.is_connected().await {
                        return Ok(());
                    }
                }
                node.client.node_on_off(&mode).await?;
            }
            NodeOp::ExchangeOnOff { exchange_id, mode } => {
                node.client.node_exchange_on_off(exchange_id, &mode).await?;
            }
        }
        Ok(())
    }

    // --------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------

    pub async fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("[{}] start ignored, already running", self.settings.id);
            return false;
        }

        {
            let mut state = self.state.lock().await;
            state.running = true;
            state.last_error = None;
        }
        self.bus.emit(NodeEvent::SupervisorStarted).await;
        self.publish(FleetChange::State);
        self.ensure_sweeping();
        true
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.wake.notify_waiters();
        self.state.lock().await.running = false;
        self.bus.emit(NodeEvent::SupervisorStopped).await;
        self.publish(FleetChange::State);
    }

    pub async fn shutdown(&self) {
        self.stop().await;
        for node in self.snapshot().await {
            node.client.disconnect().await;
        }
        self.bus.emit(NodeEvent::SupervisorShutdown).await;
        crate::util::terminate_after(self.settings.shutdown_delay);
    }

    /// Spawns the sweep loop unless one already exists or the supervisor
    /// is stopped.
    pub fn ensure_sweeping(&self) {
        if !self.is_running() || self.sweeping.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            self.sweeping.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(run_sweep_loop(me));
    }

    // --------------------------------------------------------
    // Sweep
    // --------------------------------------------------------

    pub async fn sweep(&self) -> SweepOutcome {
        RuntimeMetrics::inc(&METRICS.sweeps_run);
        let nodes = self.snapshot().await;

        // Unreachable nodes still count: the next sweep retries the handshake
        let (mut updated, mut reached) = (0, 0);
        for node in &nodes {
            if node.is_active().await {
                updated += 1;
                if self.visit(node).await {
                    reached += 1;
                }
            }
        }

        let mut averages = Vec::new();
        for node in &nodes {
            let (fresh, previous) = node.take_fresh().await;
            if fresh.is_empty() {
                continue;
            }

            match aggregate(&fresh, previous, self.settings.delta_max_fraction).into_average() {
                Ok(average) => {
                    node.accept_average(average).await;
                    averages.push(average);
                }
                Err((fault, rejected)) => {
                    RuntimeMetrics::inc(&METRICS.aggregation_overflows);
                    log::warn!("[{}] node {} parked: {fault}", self.settings.id, node.name());
                    node.reject("NODE_TICKER_DELTA_OVERFLOW").await;
                    self.bus
                        .emit(NodeEvent::NodeTickerDeltaOverflow { node_id: node.id, rejected })
                        .await;
                }
            }
        }

        let fleet_average = aggregate_fleet(&averages).ok();
        let now = now_ms();
        {
            let mut state = self.state.lock().await;
            if let Some(average) = fleet_average {
                state.last_average = average;
            }
            state.touch(now);
        }
        if let Some(average) = fleet_average {
            self.history.lock().await.record(average, now);
        }

        self.persist_state().await;
        self.publish(FleetChange::State);
        self.publish(FleetChange::Nodes);

        SweepOutcome { updated, reached, fleet_average }
    }

    /// Polls one node. Returns `true` if it was reached.
    async fn visit(&self, node: &RemoteNode) -> bool {
        let client = &node.client;

        if !client.is_connected().await && client.connect().await.is_none() {
            self.bus
                .emit(NodeEvent::NodeUnableToConnect {
                    node_id: node.id,
                    name: node.name().to_string(),
                    reason: "handshake failed".to_string(),
                })
                .await;
            self.note_connectivity(node, false).await;
            return false;
        }

        match client.pull_node_state(&self.settings.id).await {
            Ok(state) => {
                node.set_state(state).await;
                self.note_connectivity(node, true).await;
            }
            Err(fault) => {
                self.report_fault(node, &fault).await;
                self.note_connectivity(node, client.is_connected().await).await;
                return false;
            }
        }

        match client.pull_tickers().await {
            Ok(readings) if !readings.is_empty() => {
                node.append_readings(&readings).await;
                if let Err(e) = self.storage.save_tickers(&readings).await {
                    self.bus.emit(NodeEvent::DbError { message: format!("save tickers: {e:#}") }).await;
                }
            }
            Ok(_) => {}
            Err(fault) => {
                log::debug!("[{}] tickers not pulled: {fault}", node.name());
                self.report_fault(node, &fault).await;
            }
        }

        match client.pull_notifications(-1, NOTIFICATION_PULL).await {
            Ok((records, _)) => {
                for record in records {
                    self.bus.emit(NodeEvent::NodeNotification { node_id: node.id, record }).await;
                }
            }
            Err(fault) => {
                log::debug!("[{}] notifications not pulled: {fault}", node.name());
                self.report_fault(node, &fault).await;
            }
        }

        true
    }

    /// Faults raised by the collector itself become `NODE_ERROR`;
    /// connectivity faults are handled by the client's retry policy.
    async fn report_fault(&self, node: &RemoteNode, fault: &RpcFault) {
        if matches!(fault, RpcFault::Remote { .. } | RpcFault::BadResponse(_)) {
            self.bus
                .emit(NodeEvent::NodeError {
                    node_id: node.id,
                    code: fault.code().to_string(),
                    message: fault.to_string(),
                })
                .await;
        }
    }

    async fn has_active_nodes(&self) -> bool {
        for node in self.snapshot().await {
            if node.is_active().await {
                return true;
            }
        }
        false
    }

    async fn note_connectivity(&self, node: &RemoteNode, alive: bool) {
        let name = node.name().to_string();
        let event = match node.mark_alive(alive).await {
            Transition::Connected => NodeEvent::NodeConnected { node_id: node.id, name },
            Transition::Disconnected => NodeEvent::NodeDisconnected { node_id: node.id, name },
            Transition::Unchanged => return,
        };
        self.bus.emit(event).await;
    }

    // --------------------------------------------------------
    // State
    // --------------------------------------------------------

    async fn fleet_state(&self) -> FleetState {
        let nodes = self.snapshot().await;
        let mut nodes_alive = 0;
        for node in &nodes {
            if node.is_alive().await {
                nodes_alive += 1;
            }
        }

        FleetState {
            run: self.state.lock().await.clone(),
            nodes_total: nodes.len(),
            nodes_alive,
            last_prices: self.history.lock().await.to_vec(),
            actions: Vec::new(),
        }
    }

    pub async fn export_state(&self) -> FleetState {
        let mut state = self.fleet_state().await;
        state.actions = match self.storage.actions(EXPORTED_ACTIONS).await {
            Ok(actions) => actions,
            Err(e) => {
                log::warn!("[{}] loading audit actions: {e:#}", self.settings.id);
                Vec::new()
            }
        };
        state
    }

    async fn persist_state(&self) {
        let state = self.fleet_state().await;
        if let Err(e) = self.storage.update_fleet_state(&state).await {
            self.bus.emit(NodeEvent::DbError { message: format!("update fleet state: {e:#}") }).await;
        }
    }

    pub async fn record_action(&self, name: &str, address: &str, user: &str) {
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

/// Sweep loop. Parks itself when no node is active; `ensure_sweeping`
/// brings it back.
async fn run_sweep_loop(ctrl: Arc<SupervisorController>) {
    let id = ctrl.settings.id.clone();
    log::info!("[{id}] sweep loop started");

    while ctrl.is_running() {
        let outcome = ctrl.sweep().await;
        if outcome.updated == 0 {
            log::info!("[{id}] no active node, sweep loop parked");
            break;
        }

        let woken = ctrl.wake.notified();
        if !ctrl.is_running() {
            break;
        }
        tokio::select! {
            _ = sleep(ctrl.settings.update_timeout) => {}
            _ = woken => {}
        }
    }

    ctrl.sweeping.store(false, Ordering::SeqCst);
    log::info!("[{id}] sweep loop stopped");

    // A restart requested while this loop was winding down saw
    // `sweeping` still set and did nothing
    if ctrl.is_running() && ctrl.has_active_nodes().await {
        ctrl.ensure_sweeping();
    }
}
