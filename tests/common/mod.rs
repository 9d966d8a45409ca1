#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use oracle_net::alert::LogAlerter;
use oracle_net::chain::{ChainClient, NullChain};
use oracle_net::collector::{CollectorController, CollectorSettings};
use oracle_net::exchanges::{ExchangeOpError, FeedSource};
use oracle_net::notification::NotificationBus;
use oracle_net::rpc::{LocalTransport, RpcCall, RpcFault, RpcState, RpcTransport, SessionEvent, SessionServer, TransportFactory};
use oracle_net::schema::{ExchangeInfo, FetchFault, PollingConfig, RemoteNodeRecord, TickerReading};
use oracle_net::storage::MemoryStorage;
use oracle_net::supervisor::{SupervisorController, SupervisorSettings};

pub const SECRET: &str = "s3cret";

pub fn reading(source: &str, value: f64) -> TickerReading {
    TickerReading {
        source: source.to_string(),
        symbol: "ETH/USD".to_string(),
        value,
        observed_at: 1,
        updated_at: 1,
        fault: None,
    }
}

pub fn faulted(source: &str) -> TickerReading {
    TickerReading {
        fault: Some(FetchFault::FetcherTimeout),
        value: 0.0,
        ..reading(source, 0.0)
    }
}

/// Feed returning whatever the test last scripted.
#[derive(Default)]
pub struct ScriptedFeed {
    readings: StdMutex<Vec<TickerReading>>,
}

impl ScriptedFeed {
    pub fn set(&self, readings: Vec<TickerReading>) {
        *self.readings.lock().unwrap() = readings;
    }

    pub fn set_values(&self, values: &[f64]) {
        self.set(values.iter().enumerate().map(|(i, v)| reading(&format!("ex{i}"), *v)).collect());
    }
}

#[async_trait]
impl FeedSource for ScriptedFeed {
    async fn fetch_all(&self) -> Vec<TickerReading> {
        self.readings.lock().unwrap().clone()
    }

    async fn exchanges(&self) -> Vec<ExchangeInfo> {
        Vec::new()
    }

    async fn exchange_on_off(&self, exchange_id: usize, mode: &str) -> Result<(), ExchangeOpError> {
        match (exchange_id, mode) {
            (0, "on" | "off") => Ok(()),
            (0, _) => Err(ExchangeOpError::BadOperation),
            _ => Err(ExchangeOpError::BadExchangeId),
        }
    }
}

/// One in-process collector with its RPC state.
pub struct CollectorRig {
    pub controller: Arc<CollectorController>,
    pub sessions: Arc<SessionServer>,
    pub session_events: mpsc::UnboundedReceiver<SessionEvent>,
    pub storage: Arc<MemoryStorage>,
    pub feed: Arc<ScriptedFeed>,
    pub rpc: RpcState,
}

pub async fn collector(id: &str, minimum: usize) -> CollectorRig {
    collector_with_chain(id, minimum, Arc::new(NullChain)).await
}

pub async fn collector_with_chain(id: &str, minimum: usize, chain: Arc<dyn ChainClient>) -> CollectorRig {
    let storage = Arc::new(MemoryStorage::new());
    let bus = NotificationBus::new(id, storage.clone(), Arc::new(LogAlerter));

    let (sessions, session_events) = SessionServer::new(SECRET, Duration::from_secs(30), 500);
    bus.subscribe(sessions.clone()).await;

    let feed = Arc::new(ScriptedFeed::default());
    let settings = CollectorSettings {
        id: id.to_string(),
        update_timeout: Duration::from_secs(3600),
        minimum_exchanges_limit: minimum,
        delta_max_fraction: 0.2,
        shutdown_delay: Duration::from_secs(5),
    };
    let controller = CollectorController::new(settings, feed.clone(), chain, storage.clone(), bus);

    let rpc = RpcState {
        sessions: sessions.clone(),
        node: controller.clone(),
    };

    CollectorRig {
        controller,
        sessions,
        session_events,
        storage,
        feed,
        rpc,
    }
}

/// Transport that never reaches anything.
pub struct Unreachable;

#[async_trait]
impl RpcTransport for Unreachable {
    async fn call(&self, _call: RpcCall) -> Result<Value, RpcFault> {
        Err(RpcFault::Transport("unreachable".into()))
    }
}

/// Passes calls through only while it is up.
pub struct Gate {
    inner: Arc<dyn RpcTransport>,
    up: AtomicBool,
}

impl Gate {
    pub fn new(inner: Arc<dyn RpcTransport>, up: bool) -> Arc<Self> {
        Arc::new(Self {
            inner,
            up: AtomicBool::new(up),
        })
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl RpcTransport for Gate {
    async fn call(&self, call: RpcCall) -> Result<Value, RpcFault> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(RpcFault::Transport("connection refused".into()));
        }
        self.inner.call(call).await
    }
}

/// Routes node names to transports; unknown names are unreachable.
#[derive(Default)]
pub struct LocalFactory {
    routes: StdMutex<HashMap<String, Arc<dyn RpcTransport>>>,
}

impl LocalFactory {
    /// Routes `name` straight into an in-process collector.
    pub fn route(&self, name: &str, state: RpcState) {
        self.route_transport(name, Arc::new(LocalTransport::new(state, "10.0.0.1")));
    }

    pub fn route_transport(&self, name: &str, transport: Arc<dyn RpcTransport>) {
        self.routes.lock().unwrap().insert(name.to_string(), transport);
    }
}

impl TransportFactory for LocalFactory {
    fn create(&self, record: &RemoteNodeRecord) -> anyhow::Result<Arc<dyn RpcTransport>> {
        let transport: Arc<dyn RpcTransport> = match self.routes.lock().unwrap().get(&record.name) {
            Some(transport) => transport.clone(),
            None => Arc::new(Unreachable),
        };
        Ok(transport)
    }
}

pub fn polling(retry: u32) -> PollingConfig {
    PollingConfig {
        ping_rate_secs: 3600,
        request_retry_count: retry,
        request_timeout_secs: 1,
    }
}

pub fn supervisor(factory: Arc<LocalFactory>) -> (Arc<SupervisorController>, Arc<MemoryStorage>) {
    supervisor_every(factory, Duration::from_secs(3600))
}

pub fn supervisor_every(factory: Arc<LocalFactory>, update_timeout: Duration) -> (Arc<SupervisorController>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let bus = NotificationBus::new("S0", storage.clone(), Arc::new(LogAlerter));
    let settings = SupervisorSettings {
        id: "S0".to_string(),
        update_timeout,
        delta_max_fraction: 0.2,
        polling: polling(2),
        shutdown_delay: Duration::from_secs(5),
    };
    (SupervisorController::new(settings, storage.clone(), bus, factory), storage)
}
