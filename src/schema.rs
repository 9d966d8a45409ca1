use serde::{Serialize, Deserialize};
use serde_json::Value;

/// Shared data model for both node roles.
///
/// These structures travel:
/// - From the feed collaborator into the collector controller
/// - Over the polling RPC surface (collector → supervisor)
/// - Into storage
/// - Out through the operator control channel
///
/// DESIGN NOTES:
/// - Timestamps are milliseconds since Unix epoch (`i64`)
/// - Field names are the JSON wire names; renaming a field is a
///   protocol change between collector and supervisor versions.
///

// ------------------------------------------------------------
// Fetch faults
// ------------------------------------------------------------
//
// Attached to a reading instead of a value when the feed could not
// produce one. Serialized as the symbolic `FETCHER_*` code.
//
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchFault {
    FetcherDisabled,
    FetcherBadConfig,
    FetcherNoField,
    FetcherBadData,
    FetcherParseError,
    FetcherBadRequest,
    FetcherForbidden,
    FetcherNotFound,
    FetcherInternalServerError,
    FetcherServiceTemporarilyUnavailable,
    FetcherTimeout,
    FetcherConnectionRefused,
    FetcherError,
}

// ------------------------------------------------------------
// Ticker reading
// ------------------------------------------------------------
//
// One price observation from one external source.
// Immutable once produced by the feed collaborator.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TickerReading {
    /// Exchange identifier (e.g. "kraken")
    pub source: String,

    /// Symbol as configured for the exchange
    pub symbol: String,

    /// Last traded price; 0 when `fault` is set
    pub value: f64,

    /// Timestamp reported by the exchange (falls back to fetch time)
    pub observed_at: i64,

    /// Local fetch completion time
    pub updated_at: i64,

    /// Set instead of a usable value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FetchFault>,
}

impl TickerReading {
    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }
}

// ------------------------------------------------------------
// Node run state
// ------------------------------------------------------------
//
// Owned exclusively by one controller and mutated only on its own
// update tick.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NodeRunState {
    pub id: String,
    pub started_at: i64,
    pub uptime_ms: i64,
    pub last_updated_at: i64,
    pub running: bool,
    pub last_error: Option<String>,
    pub last_average: f64,
}

impl NodeRunState {
    pub fn new(id: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            started_at: now,
            uptime_ms: 0,
            last_updated_at: now,
            running: false,
            last_error: None,
            last_average: 0.0,
        }
    }

    /// Stamps `last_updated_at` and recomputes uptime.
    pub fn touch(&mut self, now: i64) {
        self.last_updated_at = now;
        self.uptime_ms = now - self.started_at;
    }
}

// ------------------------------------------------------------
// Fleet price history entry
// ------------------------------------------------------------
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FleetPricePoint {
    pub price: f64,
    pub observed_at: i64,

    /// Change from the previous entry in percent (0 for the first entry)
    pub delta_percent: f64,
}

// ------------------------------------------------------------
// Fleet state (supervisor)
// ------------------------------------------------------------
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FleetState {
    #[serde(flatten)]
    pub run: NodeRunState,
    pub nodes_total: usize,
    pub nodes_alive: usize,
    pub last_prices: Vec<FleetPricePoint>,

    /// Filled on export only
    #[serde(default)]
    pub actions: Vec<AuditAction>,
}

// ------------------------------------------------------------
// Notifications
// ------------------------------------------------------------
//
// Append-only, ordered by emission.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NotificationRecord {
    pub node_id: String,
    pub timestamp: i64,
    pub code: String,
    #[serde(default)]
    pub payload: Value,
}

// ------------------------------------------------------------
// Audit actions
// ------------------------------------------------------------
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuditAction {
    pub name: String,
    pub address: String,
    pub user: String,
    pub timestamp: i64,
}

// ------------------------------------------------------------
// Exchange info (collector state export)
// ------------------------------------------------------------
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExchangeInfo {
    pub id: usize,
    pub name: String,
    pub symbol: String,
    pub enabled: bool,
    pub fault: Option<FetchFault>,
}

// ------------------------------------------------------------
// Remote node record (supervisor fleet membership)
// ------------------------------------------------------------
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PollingConfig {
    pub ping_rate_secs: u64,
    pub request_retry_count: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RemoteNodeRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub host: String,
    pub port: u16,

    /// Pre-shared handshake secret; never leaves the supervisor
    pub secret: String,
    pub polling: PollingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_faults_serialize_as_codes() {
        let v = serde_json::to_value(FetchFault::FetcherServiceTemporarilyUnavailable).unwrap();
        assert_eq!(v, "FETCHER_SERVICE_TEMPORARILY_UNAVAILABLE");
    }

    #[test]
    fn fleet_state_flattens_run_state() {
        let state = FleetState {
            run: NodeRunState::new("1", 1_000),
            nodes_total: 2,
            nodes_alive: 1,
            last_prices: vec![],
            actions: vec![],
        };
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["id"], "1");
        assert_eq!(v["nodes_total"], 2);
    }

    #[test]
    fn touch_updates_uptime() {
        let mut s = NodeRunState::new("n", 1_000);
        s.touch(4_500);
        assert_eq!(s.uptime_ms, 3_500);
        assert_eq!(s.last_updated_at, 4_500);
    }
}
