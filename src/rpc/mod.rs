//! Polling RPC between supervisor and collectors
//!
//! This module groups:
//! - `session`: collector-side session table, heartbeat and notification buffer
//! - `server`:  collector-side HTTP surface (axum)
//! - `client`:  supervisor-side `RemoteClient`, one per fleet member
//!
//! Shared here: the fault taxonomy, the call set, the handshake proof
//! and the transport seam the client talks through.
//!
//! WIRE:
//! - Every call is `GET /api/v1/...` with parameters in the path
//! - Failures are `{ "error": { "code": ..., "message": ... } }`

pub mod client;
pub mod server;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::schema::RemoteNodeRecord;

pub use client::RemoteClient;
pub use server::{LocalTransport, NodeHandle, RpcState, router, serve};
pub use session::{SessionEvent, SessionServer};

type HmacSha256 = Hmac<Sha256>;

/// Label signed by the handshake proof.
const PROOF_LABEL: &[u8] = b"price-oracle-network/connect/v1";

// ------------------------------------------------------------
// Faults
// ------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcFault {
    #[error("connection not found")]
    ConnectionNotFound,

    #[error("connect failed")]
    ConnectFailed,

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("not connected")]
    NotConnected,

    #[error("bad response: {0}")]
    BadResponse(String),
}

impl RpcFault {
    pub fn code(&self) -> &str {
        match self {
            RpcFault::ConnectionNotFound => "CONNECTION_NOT_FOUND",
            RpcFault::ConnectFailed => "CONNECT_FAILED",
            RpcFault::Timeout => "REQUEST_TIMEOUT",
            RpcFault::Transport(_) => "TRANSPORT_ERROR",
            RpcFault::Remote { code, .. } => code,
            RpcFault::NotConnected => "NOT_CONNECTED",
            RpcFault::BadResponse(_) => "BAD_RESPONSE",
        }
    }

    /// Rebuilds a fault from a wire `{ error: { code, message } }` body.
    pub fn from_wire(code: &str, message: &str) -> Self {
        match code {
            "CONNECTION_NOT_FOUND" => RpcFault::ConnectionNotFound,
            _ => RpcFault::Remote {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}

/// Extracts a wire error, if the body carries one.
pub fn wire_error(body: &Value) -> Option<RpcFault> {
    let err = body.get("error")?;
    let code = err.get("code").and_then(Value::as_str).unwrap_or("UNKNOWN");
    let message = err.get("message").and_then(Value::as_str).unwrap_or_default();
    Some(RpcFault::from_wire(code, message))
}

// ------------------------------------------------------------
// Calls
// ------------------------------------------------------------
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCall {
    Ping { session: String },
    Connect { proof: String },
    Disconnect { session: String },

    /// `token` is the batch token of the last pull ("0" initially)
    Tickers { session: String, token: String },

    NodeState { session: String, node_id: String },

    /// Negative `index` continues from the session cursor
    Notifications { session: String, index: i64, count: usize },

    /// `mode`: on | off | shutdown
    NodeOnOff { session: String, mode: String },

    ExchangeOnOff { session: String, exchange_id: usize, mode: String },
}

impl RpcCall {
    pub fn path(&self) -> String {
        match self {
            RpcCall::Ping { session } => format!("/api/v1/ping/{session}"),
            RpcCall::Connect { proof } => format!("/api/v1/connect/{proof}"),
            RpcCall::Disconnect { session } => format!("/api/v1/disconnect/{session}"),
            RpcCall::Tickers { session, token } => format!("/api/v1/nodeTickers/{session}/{token}"),
            RpcCall::NodeState { session, node_id } => format!("/api/v1/nodeState/{session}/{node_id}"),
            RpcCall::Notifications { session, index, count } => {
                format!("/api/v1/poolNotifications/{session}/{index}/{count}")
            }
            RpcCall::NodeOnOff { session, mode } => format!("/api/v1/nodeOnOff/{session}/{mode}"),
            RpcCall::ExchangeOnOff { session, exchange_id, mode } => {
                format!("/api/v1/nodeExchangeOnOff/{session}/{exchange_id}/{mode}")
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RpcCall::Ping { .. } => "ping",
            RpcCall::Connect { .. } => "connect",
            RpcCall::Disconnect { .. } => "disconnect",
            RpcCall::Tickers { .. } => "nodeTickers",
            RpcCall::NodeState { .. } => "nodeState",
            RpcCall::Notifications { .. } => "poolNotifications",
            RpcCall::NodeOnOff { .. } => "nodeOnOff",
            RpcCall::ExchangeOnOff { .. } => "nodeExchangeOnOff",
        }
    }
}

// ------------------------------------------------------------
// Handshake proof
// ------------------------------------------------------------
//
// HMAC-SHA256 keyed by the pre-shared secret over a fixed label,
// hex encoded. The secret itself never travels.
//
fn proof_mac(secret: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(PROOF_LABEL);
    Some(mac)
}

pub fn connect_proof(secret: &str) -> String {
    proof_mac(secret)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Constant-time proof check.
pub fn verify_proof(secret: &str, proof: &str) -> bool {
    let Ok(raw) = hex::decode(proof) else {
        return false;
    };
    proof_mac(secret).is_some_and(|mac| mac.verify_slice(&raw).is_ok())
}

// ------------------------------------------------------------
// Transport seam
// ------------------------------------------------------------
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Performs one call. Wire errors come back as `Err`.
    async fn call(&self, call: RpcCall) -> Result<Value, RpcFault>;
}

/// Builds one transport per fleet member.
pub trait TransportFactory: Send + Sync {
    fn create(&self, record: &RemoteNodeRecord) -> anyhow::Result<Arc<dyn RpcTransport>>;
}

/// Plain HTTP transport (`http://host:port`).
pub struct HttpTransport {
    http: reqwest::Client,
    base: String,
}

impl HttpTransport {
    pub fn new(host: &str, port: u16, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base: format!("http://{host}:{port}"),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, call: RpcCall) -> Result<Value, RpcFault> {
        let url = format!("{}{}", self.base, call.path());

        let resp = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                RpcFault::Timeout
            } else {
                RpcFault::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RpcFault::BadResponse(format!("{} ({status})", e)))?;

        if let Some(fault) = wire_error(&body) {
            return Err(fault);
        }
        if !status.is_success() {
            return Err(RpcFault::Transport(format!("HTTP {status}")));
        }
        Ok(body)
    }
}

pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn create(&self, record: &RemoteNodeRecord) -> anyhow::Result<Arc<dyn RpcTransport>> {
        let timeout = Duration::from_secs(record.polling.request_timeout_secs.max(1));
        Ok(Arc::new(HttpTransport::new(&record.host, record.port, timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn proof_verifies_only_with_same_secret() {
        let proof = connect_proof("s3cret");
        assert_eq!(proof.len(), 64);
        assert!(verify_proof("s3cret", &proof));
        assert!(!verify_proof("other", &proof));
        assert!(!verify_proof("s3cret", "zz"));
        assert!(!verify_proof("s3cret", ""));
    }

    #[test]
    fn paths_follow_wire_layout() {
        let call = RpcCall::Notifications { session: "abc".into(), index: -1, count: 100 };
        assert_eq!(call.path(), "/api/v1/poolNotifications/abc/-1/100");

        let call = RpcCall::ExchangeOnOff { session: "abc".into(), exchange_id: 2, mode: "off".into() };
        assert_eq!(call.path(), "/api/v1/nodeExchangeOnOff/abc/2/off");
    }

    #[test]
    fn wire_errors_map_to_faults() {
        let body = json!({ "error": { "code": "CONNECTION_NOT_FOUND", "message": "connection not found" } });
        assert_eq!(wire_error(&body), Some(RpcFault::ConnectionNotFound));

        let body = json!({ "error": { "code": "BAD_EXCHANGE_ID", "message": "x" } });
        assert_eq!(wire_error(&body).map(|f| f.code().to_string()), Some("BAD_EXCHANGE_ID".to_string()));

        assert_eq!(wire_error(&json!({ "ok": true })), None);
    }
}
