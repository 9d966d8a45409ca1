use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::{RpcCall, RpcFault, RpcTransport, SessionServer};
use crate::schema::TickerReading;
use crate::util::now_ms;

/// What the RPC surface needs from the collector it fronts.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    /// Latest reading batch and its token.
    async fn tickers(&self) -> (u64, Vec<TickerReading>);

    async fn export_state(&self) -> Value;

    /// `mode`: on | off | shutdown
    async fn on_off(&self, mode: &str) -> Result<(), RpcFault>;

    async fn exchange_on_off(&self, exchange_id: usize, mode: &str) -> Result<(), RpcFault>;
}

#[derive(Clone)]
pub struct RpcState {
    pub sessions: Arc<SessionServer>,
    pub node: Arc<dyn NodeHandle>,
}

impl RpcFault {
    pub fn to_wire(&self) -> Value {
        json!({ "error": { "code": self.code(), "message": self.to_string() } })
    }

    fn status(&self) -> StatusCode {
        match self {
            RpcFault::ConnectionNotFound => StatusCode::NOT_FOUND,
            RpcFault::Remote { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ------------------------------------------------------------
// Call handling
// ------------------------------------------------------------
//
// Transport-independent. The axum routes below and `LocalTransport`
// both end up here.
//
// Every call bearing a session id counts as a heartbeat, so a client
// that keeps polling never expires.
//
pub async fn handle(state: &RpcState, call: RpcCall, remote_address: &str) -> Result<Value, RpcFault> {
    match call {
        RpcCall::Connect { proof } => {
            Ok(match state.sessions.connect(&proof, remote_address).await {
                Some(id) => json!({ "connectionId": id }),
                None => json!({ "code": "noconnect", "message": "unable to connect" }),
            })
        }

        RpcCall::Ping { session } => {
            state.sessions.ping(&session).await?;
            Ok(json!({
                "res": "pong",
                "status": "ok",
                "apiVersion": "1.0",
                "timestamp": now_ms(),
            }))
        }

        RpcCall::Disconnect { session } => {
            if !state.sessions.disconnect(&session).await {
                return Err(RpcFault::ConnectionNotFound);
            }
            Ok(json!({ "code": "disconnected", "message": "connection deleted" }))
        }

        RpcCall::Tickers { session, token } => {
            state.sessions.ping(&session).await?;
            let (batch, readings) = state.node.tickers().await;
            let batch_token = batch.to_string();

            // Same token: the caller already holds this batch
            let tickers = if token == batch_token { Vec::new() } else { readings };
            Ok(json!({ "token": batch_token, "tickers": tickers }))
        }

        RpcCall::NodeState { session, node_id: _ } => {
            state.sessions.ping(&session).await?;
            Ok(json!({ "state": state.node.export_state().await }))
        }

        RpcCall::Notifications { session, index, count } => {
            state.sessions.ping(&session).await?;
            let (notifications, total) = state.sessions.notifications_page(&session, index, count).await?;
            Ok(json!({ "notifications": notifications, "total": total }))
        }

        RpcCall::NodeOnOff { session, mode } => {
            state.sessions.ping(&session).await?;
            state.node.on_off(&mode).await?;
            Ok(json!({}))
        }

        RpcCall::ExchangeOnOff { session, exchange_id, mode } => {
            state.sessions.ping(&session).await?;
            state.node.exchange_on_off(exchange_id, &mode).await?;
            Ok(json!({}))
        }
    }
}

fn reply(result: Result<Value, RpcFault>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(fault) => {
            log::debug!("rpc fault {}", fault.code());
            (fault.status(), Json(fault.to_wire())).into_response()
        }
    }
}

// ------------------------------------------------------------
// HTTP routes
// ------------------------------------------------------------
pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/api/v1/ping/{session}", get(ping))
        .route("/api/v1/connect/{proof}", get(connect))
        .route("/api/v1/disconnect/{session}", get(disconnect))
        .route("/api/v1/nodeTickers/{session}/{token}", get(node_tickers))
        .route("/api/v1/nodeState/{session}/{node_id}", get(node_state))
        .route("/api/v1/poolNotifications/{session}/{index}/{count}", get(pool_notifications))
        .route("/api/v1/nodeOnOff/{session}/{mode}", get(node_on_off))
        .route("/api/v1/nodeExchangeOnOff/{session}/{exchange_id}/{mode}", get(node_exchange_on_off))
        .with_state(state)
}

async fn ping(State(st): State<RpcState>, ConnectInfo(addr): ConnectInfo<SocketAddr>, Path(session): Path<String>) -> Response {
    reply(handle(&st, RpcCall::Ping { session }, &addr.ip().to_string()).await)
}

async fn connect(State(st): State<RpcState>, ConnectInfo(addr): ConnectInfo<SocketAddr>, Path(proof): Path<String>) -> Response {
    reply(handle(&st, RpcCall::Connect { proof }, &addr.ip().to_string()).await)
}

async fn disconnect(State(st): State<RpcState>, ConnectInfo(addr): ConnectInfo<SocketAddr>, Path(session): Path<String>) -> Response {
    reply(handle(&st, RpcCall::Disconnect { session }, &addr.ip().to_string()).await)
}

async fn node_tickers(
    State(st): State<RpcState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((session, token)): Path<(String, String)>,
) -> Response {
    reply(handle(&st, RpcCall::Tickers { session, token }, &addr.ip().to_string()).await)
}

async fn node_state(
    State(st): State<RpcState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((session, node_id)): Path<(String, String)>,
) -> Response {
    reply(handle(&st, RpcCall::NodeState { session, node_id }, &addr.ip().to_string()).await)
}

async fn pool_notifications(
    State(st): State<RpcState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((session, index, count)): Path<(String, i64, usize)>,
) -> Response {
    reply(handle(&st, RpcCall::Notifications { session, index, count }, &addr.ip().to_string()).await)
}

async fn node_on_off(
    State(st): State<RpcState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((session, mode)): Path<(String, String)>,
) -> Response {
    reply(handle(&st, RpcCall::NodeOnOff { session, mode }, &addr.ip().to_string()).await)
}

async fn node_exchange_on_off(
    State(st): State<RpcState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((session, exchange_id, mode)): Path<(String, String, String)>,
) -> Response {
    // A non-numeric id is reported like an unknown one
    let Ok(exchange_id) = exchange_id.parse::<usize>() else {
        if st.sessions.ping(&session).await.is_err() {
            return reply(Err(RpcFault::ConnectionNotFound));
        }
        return reply(Err(RpcFault::from_wire("BAD_EXCHANGE_ID", "unknown exchange id")));
    };
    reply(handle(&st, RpcCall::ExchangeOnOff { session, exchange_id, mode }, &addr.ip().to_string()).await)
}

/// Binds the RPC server and serves it in the background.
///
/// Returns the bound address (useful with port 0) and the server task.
pub async fn serve(listen: SocketAddr, state: RpcState) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen).await?;
    let local = listener.local_addr()?;
    let app = router(state);

    log::info!("RPC server listening on {local}");

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await {
            log::error!("RPC server stopped: {e}");
        }
    });

    Ok((local, task))
}

// ------------------------------------------------------------
// In-process transport
// ------------------------------------------------------------
//
// Routes calls straight into `handle`, skipping HTTP. Used to run a
// supervisor against collectors inside one process.
//
pub struct LocalTransport {
    state: RpcState,
    remote_address: String,
}

impl LocalTransport {
    pub fn new(state: RpcState, remote_address: impl Into<String>) -> Self {
        Self {
            state,
            remote_address: remote_address.into(),
        }
    }
}

#[async_trait]
impl RpcTransport for LocalTransport {
    async fn call(&self, call: RpcCall) -> Result<Value, RpcFault> {
        handle(&self.state, call, &self.remote_address).await
    }
}
