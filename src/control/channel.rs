use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use super::auth::verify_token;
use super::broadcast::{ControlBroadcaster, ControlPush};
use crate::config::ControlConfig;
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::supervisor::{FleetChange, SupervisorController};
use crate::util::now_ms;

/// Client frame envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

/// One operator socket as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorSession {
    pub user: String,
    pub address: String,
    pub authenticated: bool,
}

// ------------------------------------------------------------
// ControlChannel
// ------------------------------------------------------------
//
// Owns the operator-facing side of a supervisor.
//
// Per socket:
// 1. WebSocket upgrade
// 2. `authenticate` frame within the auth window, else close
// 3. `authenticated` + `ping` push
// 4. select! over inbound commands and the broadcast receiver
//
// A socket only subscribes to the fan-out after it authenticated.
//
pub struct ControlChannel {
    pub(super) supervisor: Arc<SupervisorController>,
    pub(super) broadcaster: ControlBroadcaster,
    secret: String,
    auth_timeout: Duration,
}

impl ControlChannel {
    pub fn new(supervisor: Arc<SupervisorController>, broadcaster: ControlBroadcaster, cfg: &ControlConfig) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            broadcaster,
            secret: cfg.secret.clone(),
            auth_timeout: Duration::from_secs(cfg.auth_timeout_secs),
        })
    }

    pub fn broadcaster(&self) -> &ControlBroadcaster {
        &self.broadcaster
    }

    /// Binds the socket server and accepts in the background.
    pub async fn serve(self: &Arc<Self>, listen: SocketAddr) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(listen).await?;
        let local = listener.local_addr()?;
        log::info!("Control channel listening on {local}");

        let channel = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tokio::spawn(channel.clone().handle_socket(stream, addr));
                    }
                    Err(e) => log::warn!("control accept failed: {e}"),
                }
            }
        });

        Ok((local, task))
    }

    /// Relays supervisor change signals to the fan-out.
    pub fn spawn_fleet_bridge(self: &Arc<Self>) -> JoinHandle<()> {
        let channel = self.clone();
        let mut changes = self.supervisor.subscribe_changes();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(FleetChange::State) => {
                        channel.broadcaster.update_state(channel.supervisor.export_state().await);
                    }
                    Ok(FleetChange::Nodes) => {
                        channel.broadcaster.update_light_nodes(channel.supervisor.light_nodes().await);
                    }
                    Err(RecvError::Lagged(n)) => log::debug!("fleet bridge skipped {n} change(s)"),
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    /// Checks an `authenticate` frame.
    pub fn authenticate(&self, frame: &str, address: &str) -> Result<OperatorSession, String> {
        let envelope: Envelope = serde_json::from_str(frame).map_err(|_| "malformed frame".to_string())?;
        if envelope.event != "authenticate" {
            return Err(format!("expected authenticate, got {}", envelope.event));
        }

        let token = envelope
            .payload
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing token".to_string())?;

        let claims = verify_token(&self.secret, token, now_ms() / 1000).map_err(|e| e.to_string())?;
        Ok(OperatorSession {
            user: claims.sub,
            address: address.to_string(),
            authenticated: true,
        })
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let address = addr.ip().to_string();
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::debug!("control handshake from {address} failed: {e}");
                return;
            }
        };
        let (mut write, mut read) = ws.split();

        // --------------------------------------------------------
        // Authentication window
        // --------------------------------------------------------
        let first = match timeout(self.auth_timeout, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => Some(text.as_str().to_string()),
            _ => None,
        };

        let session = match first.as_deref().map(|frame| self.authenticate(frame, &address)) {
            Some(Ok(session)) => session,
            outcome => {
                let reason = match outcome {
                    Some(Err(reason)) => reason,
                    _ => "no authenticate frame".to_string(),
                };
                log::warn!("control socket from {address} unauthorized: {reason}");
                self.supervisor.record_action("OPERATOR_UNAUTHORIZED", &address, "").await;
                if let Some(frame) = (ControlPush::Unauthorized { reason }).to_frame() {
                    let _ = write.send(Message::Text(frame.into())).await;
                }
                let _ = write.close().await;
                return;
            }
        };

        RuntimeMetrics::inc(&METRICS.control_sockets_authenticated);
        self.supervisor.record_action("OPERATOR_AUTHENTICATED", &address, &session.user).await;
        log::info!("operator {} connected from {address}", session.user);

        let mut fanout = self.broadcaster.subscribe();
        let greeting = [
            ControlPush::Authenticated { user: session.user.clone() },
            ControlPush::Ping { timestamp: now_ms() },
        ];
        for push in greeting {
            if let Some(frame) = push.to_frame() {
                if write.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
        }

        // --------------------------------------------------------
        // Command / fan-out loop
        // --------------------------------------------------------
        'socket: loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for reply in self.dispatch(&session, text.as_str()).await {
                                let Some(frame) = reply.to_frame() else { continue };
                                if write.send(Message::Text(frame.into())).await.is_err() {
                                    break 'socket;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,

                        // Ping/pong handled by tungstenite
                        Some(Ok(_)) => {}
                    }
                }

                pushed = fanout.recv() => {
                    match pushed {
                        Ok(frame) => {
                            if write.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => log::warn!("operator {} lagged, {n} frame(s) dropped", session.user),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        self.supervisor.record_action("OPERATOR_DISCONNECTED", &address, &session.user).await;
        log::info!("operator {} from {address} disconnected", session.user);
    }
}
