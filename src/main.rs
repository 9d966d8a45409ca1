use std::sync::Arc;
use std::time::Duration;

use oracle_net::alert::{Alerter, LogAlerter, SlackAlerter};
use oracle_net::chain::{ChainClient, ChainRelay, NullChain};
use oracle_net::collector::{CollectorController, CollectorSettings, runner};
use oracle_net::config::{CollectorConfig, Config, NodeRole, SupervisorConfig, load_config};
use oracle_net::control::{ControlBroadcaster, ControlChannel};
use oracle_net::exchanges::Fetcher;
use oracle_net::metrics;
use oracle_net::notification::NotificationBus;
use oracle_net::rpc::{HttpTransportFactory, RpcState, SessionServer, serve};
use oracle_net::storage::{MemoryStorage, RedisStorage, Storage};
use oracle_net::supervisor::{SupervisorController, SupervisorSettings};
use oracle_net::util::install_crypto_provider;

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Runs one node of the oracle network. The role comes from the
// config file:
// - collector:  feed + aggregation + chain push, polled over RPC
// - supervisor: fleet sweep + operator control channel
//
// Startup order:
// config -> logging -> storage -> alerting -> bus -> role wiring
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // rustls >= 0.23 requires an explicit CryptoProvider,
    // installed once before any TLS client exists.
    // --------------------------------------------------------
    install_crypto_provider();

    let path = std::env::var("ORACLE_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = load_config(&path)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str())).init();
    log::info!("Starting {:?} node from {path}", config.role);

    metrics::spawn_reporter(Duration::from_secs(30));

    let storage = build_storage(&config).await;
    let alerter = build_alerter(&config);

    match config.role {
        NodeRole::Collector => {
            let Some(cfg) = config.collector.clone() else {
                anyhow::bail!("collector section missing");
            };
            run_collector(&config, cfg, storage, alerter).await?;
        }
        NodeRole::Supervisor => {
            let Some(cfg) = config.supervisor.clone() else {
                anyhow::bail!("supervisor section missing");
            };
            run_supervisor(cfg, storage, alerter).await?;
        }
    }

    // --------------------------------------------------------
    // Everything runs in background tasks; only the explicit
    // shutdown path ends the process.
    // --------------------------------------------------------
    futures_util::future::pending::<()>().await;
    Ok(())
}

/// Redis unless in demo mode. An unreachable Redis degrades to memory.
async fn build_storage(config: &Config) -> Arc<dyn Storage> {
    if config.is_demo() {
        log::info!("DEMO mode: in-memory storage");
        return Arc::new(MemoryStorage::new());
    }

    let Some(cfg) = &config.storage else {
        log::warn!("No storage section, falling back to in-memory storage");
        return Arc::new(MemoryStorage::new());
    };

    match RedisStorage::connect(&cfg.redis_url, &cfg.key_prefix).await {
        Ok(redis) => Arc::new(redis),
        Err(e) => {
            log::error!("Redis unavailable ({e:#}), falling back to in-memory storage");
            Arc::new(MemoryStorage::new())
        }
    }
}

fn build_alerter(config: &Config) -> Arc<dyn Alerter> {
    let webhook = config
        .alerts
        .as_ref()
        .and_then(|a| a.slack_webhook.clone())
        .filter(|_| !config.is_demo());

    match webhook.map(SlackAlerter::new) {
        Some(Ok(slack)) => Arc::new(slack),
        Some(Err(e)) => {
            log::warn!("Slack alerter disabled: {e:#}");
            Arc::new(LogAlerter)
        }
        None => Arc::new(LogAlerter),
    }
}

async fn run_collector(
    config: &Config,
    cfg: CollectorConfig,
    storage: Arc<dyn Storage>,
    alerter: Arc<dyn Alerter>,
) -> anyhow::Result<()> {
    let bus = NotificationBus::new(cfg.id.clone(), storage.clone(), alerter);

    let feed = Arc::new(Fetcher::new(&cfg.exchanges, Duration::from_secs(cfg.request_timeout_secs))?);

    let chain: Arc<dyn ChainClient> = match (&cfg.chain, config.is_demo()) {
        (Some(chain), false) => Arc::new(ChainRelay::new(
            chain.url.clone(),
            &chain.key,
            Duration::from_secs(chain.ping_interval_secs),
        )),
        _ => Arc::new(NullChain),
    };

    let (sessions, session_events) = SessionServer::new(
        cfg.secret.clone(),
        Duration::from_secs(cfg.ping_timeout_secs),
        cfg.notifications_page_max,
    );
    bus.subscribe(sessions.clone()).await;

    let controller = CollectorController::new(CollectorSettings::from(&cfg), feed, chain, storage, bus);
    runner::spawn_session_listener(controller.clone(), session_events);

    let state = RpcState {
        sessions,
        node: controller.clone(),
    };
    serve(cfg.listen, state).await?;

    controller.start().await;
    Ok(())
}

async fn run_supervisor(cfg: SupervisorConfig, storage: Arc<dyn Storage>, alerter: Arc<dyn Alerter>) -> anyhow::Result<()> {
    let bus = NotificationBus::new(cfg.id.clone(), storage.clone(), alerter);

    let broadcaster = ControlBroadcaster::new(256);
    bus.subscribe(Arc::new(broadcaster.clone())).await;

    let supervisor = SupervisorController::new(
        SupervisorSettings::from(&cfg),
        storage,
        bus,
        Arc::new(HttpTransportFactory),
    );
    supervisor.load_nodes(cfg.nodes.clone()).await?;

    let control = ControlChannel::new(supervisor.clone(), broadcaster, &cfg.control);
    control.spawn_fleet_bridge();
    control.serve(cfg.control.listen).await?;

    supervisor.start().await;
    Ok(())
}
