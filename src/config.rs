use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::schema::{PollingConfig, RemoteNodeRecord};

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// This is the top-level configuration structure loaded from
// `config.json` (or the path in `ORACLE_CONFIG`).
//
// It defines:
// - Which role this process plays
// - Shared collaborators (storage, alerting)
// - Exactly one role section
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Node role for this process
    pub role: NodeRole,

    /// Log filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Demo mode: in-memory storage, no chain relay, log-only alerts
    pub demo: Option<bool>,

    pub storage: Option<StorageConfig>,

    pub alerts: Option<AlertConfig>,

    pub collector: Option<CollectorConfig>,

    pub supervisor: Option<SupervisorConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Collector,
    Supervisor,
}

// ------------------------------------------------------------
// Storage configuration
// ------------------------------------------------------------
//
// Notes:
// - Ignored in demo mode.
// - All keys are namespaced with `key_prefix` so several nodes
//   may share one Redis instance.
//
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub redis_url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

// ------------------------------------------------------------
// Alerting configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct AlertConfig {
    /// Incoming-webhook URL for chat alerts
    ///
    /// Security-sensitive: must not be committed.
    pub slack_webhook: Option<String>,
}

// ------------------------------------------------------------
// Collector configuration
// ------------------------------------------------------------
//
// Controls the local update loop, the polling RPC server and the
// set of exchanges this node reads from.
//
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Node identifier used in notifications and state snapshots
    pub id: String,

    /// Address of the polling RPC server
    pub listen: SocketAddr,

    /// Pre-shared handshake secret
    pub secret: String,

    /// Delay between update ticks
    pub update_timeout_secs: u64,

    /// Minimum number of non-faulted readings per tick
    pub minimum_exchanges_limit: usize,

    /// Fraction of the running average beyond which a reading is an outlier
    #[serde(default = "default_delta_max_fraction")]
    pub delta_max_fraction: f64,

    /// Session heartbeat window
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Upper bound of one notification page
    #[serde(default = "default_notifications_page_max")]
    pub notifications_page_max: usize,

    /// Delay before process exit on shutdown
    #[serde(default = "default_shutdown_delay")]
    pub shutdown_delay_secs: u64,

    /// Timeout of one exchange HTTP request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    pub exchanges: Vec<ExchangeConfig>,

    pub chain: Option<ChainConfig>,
}

// ------------------------------------------------------------
// Exchange configuration
// ------------------------------------------------------------
//
// IMPORTANT:
// - Symbols may be given as BASE/QUOTE ("ETH/USD") or in the
//   exchange-native form ("XETHZUSD").
// - Position in the list is the exchange id used by the
//   exchange on/off RPC.
//
#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeConfig {
    /// Adapter name (e.g. "kraken", "bitstamp")
    pub name: String,

    pub symbol: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

// ------------------------------------------------------------
// Chain relay configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    /// WebSocket URL of the signing relay
    pub url: String,

    /// Relay login key
    pub key: String,

    #[serde(default = "default_chain_ping")]
    pub ping_interval_secs: u64,
}

// ------------------------------------------------------------
// Supervisor configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    pub id: String,

    /// Delay between fleet sweeps
    pub update_timeout_secs: u64,

    #[serde(default = "default_delta_max_fraction")]
    pub delta_max_fraction: f64,

    /// Heartbeat rate of every RemoteClient
    pub ping_rate_secs: u64,

    /// Consecutive failures tolerated before a forced disconnect
    pub request_retry_count: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_shutdown_delay")]
    pub shutdown_delay_secs: u64,

    #[serde(default)]
    pub nodes: Vec<RemoteNodeConfig>,

    pub control: ControlConfig,
}

impl SupervisorConfig {
    pub fn polling(&self) -> PollingConfig {
        PollingConfig {
            ping_rate_secs: self.ping_rate_secs,
            request_retry_count: self.request_retry_count,
            request_timeout_secs: self.request_timeout_secs,
        }
    }
}

/// Fleet member as it appears in configuration or in an `addNode` command.
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteNodeConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub host: String,
    pub port: u16,
    pub secret: String,
}

impl RemoteNodeConfig {
    pub fn into_record(self, polling: PollingConfig) -> RemoteNodeRecord {
        RemoteNodeRecord {
            name: self.name,
            description: self.description,
            host: self.host,
            port: self.port,
            secret: self.secret,
            polling,
        }
    }
}

// ------------------------------------------------------------
// Operator control channel configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    pub listen: SocketAddr,

    /// HS256 secret used to verify operator bearer tokens
    pub secret: String,

    /// Window for the authenticate message after socket open
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
}

fn default_log_level() -> String { "info".to_string() }
fn default_key_prefix() -> String { "oracle".to_string() }
fn default_delta_max_fraction() -> f64 { 0.2 }
fn default_ping_timeout() -> u64 { 30 }
fn default_notifications_page_max() -> usize { 500 }
fn default_shutdown_delay() -> u64 { 5 }
fn default_request_timeout() -> u64 { 10 }
fn default_chain_ping() -> u64 { 30 }
fn default_auth_timeout() -> u64 { 15 }
fn default_true() -> bool { true }

impl Config {
    pub fn is_demo(&self) -> bool {
        self.demo.unwrap_or(false)
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.role {
            NodeRole::Collector => {
                let Some(c) = &self.collector else {
                    bail!("role is collector but the `collector` section is missing");
                };
                check_fraction(c.delta_max_fraction)?;
                if c.minimum_exchanges_limit == 0 {
                    bail!("minimum_exchanges_limit must be at least 1");
                }
                if c.exchanges.is_empty() {
                    bail!("collector has no exchanges configured");
                }
            }
            NodeRole::Supervisor => {
                let Some(s) = &self.supervisor else {
                    bail!("role is supervisor but the `supervisor` section is missing");
                };
                check_fraction(s.delta_max_fraction)?;
                let mut seen = HashSet::new();
                for node in &s.nodes {
                    if !seen.insert(node.name.as_str()) {
                        bail!("duplicate node name `{}`", node.name);
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_fraction(f: f64) -> anyhow::Result<()> {
    if !f.is_finite() || f <= 0.0 {
        bail!("delta_max_fraction must be a positive number, got {f}");
    }
    Ok(())
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// Reads a JSON configuration file from disk, deserializes it into
// the strongly typed `Config` structure and validates it.
//
pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading config file {path}"))?;
    parse_config(&data)
}

pub fn parse_config(data: &str) -> anyhow::Result<Config> {
    let cfg: Config = serde_json::from_str(data).context("parsing config JSON")?;
    cfg.validate()?;
    Ok(cfg)
}
