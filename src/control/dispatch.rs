use serde::Deserialize;
use serde_json::Value;

use super::broadcast::ControlPush;
use super::channel::{ControlChannel, Envelope, OperatorSession};
use crate::config::RemoteNodeConfig;
use crate::notification::NodeEvent;
use crate::supervisor::NodeOp;

/// Upper bound of a `getNotifications` page.
const NOTIFICATIONS_PAGE_MAX: usize = 100;

#[derive(Debug, Deserialize)]
struct NotificationsQuery {
    #[serde(default)]
    index: usize,
    #[serde(default = "default_page")]
    count: usize,
}

fn default_page() -> usize {
    NOTIFICATIONS_PAGE_MAX
}

#[derive(Debug, Deserialize)]
struct NodeRef {
    id: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeOpRequest {
    id: u32,
    code: String,
    mode: String,
    #[serde(default)]
    exchange_id: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ModeRequest {
    mode: String,
}

/// Why a command was refused; reported as `RC_BAD_REQUEST`.
struct BadRequest(String);

impl<E: std::fmt::Display> From<E> for BadRequest {
    fn from(e: E) -> Self {
        BadRequest(e.to_string())
    }
}

fn payload<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, BadRequest> {
    serde_json::from_value(value).map_err(|e| BadRequest(format!("bad payload: {e}")))
}

impl ControlChannel {
    /// Runs one operator command and returns the direct replies.
    ///
    /// Unauthenticated sessions get nothing and change nothing. Refused
    /// commands are reported through the notification bus, so every
    /// operator sees them.
    pub async fn dispatch(&self, session: &OperatorSession, frame: &str) -> Vec<ControlPush> {
        if !session.authenticated {
            return Vec::new();
        }

        let envelope: Envelope = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.bad_request("unknown", format!("malformed frame: {e}")).await;
                return Vec::new();
            }
        };

        let event = envelope.event.clone();
        match self.run(session, envelope).await {
            Ok(replies) => replies,
            Err(BadRequest(reason)) => {
                self.bad_request(&event, reason).await;
                Vec::new()
            }
        }
    }

    async fn run(&self, session: &OperatorSession, envelope: Envelope) -> Result<Vec<ControlPush>, BadRequest> {
        let supervisor = &self.supervisor;

        let replies = match envelope.event.as_str() {
            "pong" => Vec::new(),

            "initConnection" => vec![
                ControlPush::State(supervisor.export_state().await),
                ControlPush::LightNodes(supervisor.light_nodes().await),
            ],

            "getState" => vec![ControlPush::State(supervisor.export_state().await)],

            "getLightNodes" => vec![ControlPush::LightNodes(supervisor.light_nodes().await)],

            "getNotifications" => {
                let query: NotificationsQuery = payload(envelope.payload)?;
                let count = query.count.min(NOTIFICATIONS_PAGE_MAX);
                let (notifications, total) = supervisor.storage().notifications(query.index, count).await?;
                vec![ControlPush::Notifications { notifications, total }]
            }

            "addNode" => {
                let cfg: RemoteNodeConfig = payload(envelope.payload)?;
                let name = cfg.name.clone();
                supervisor.add_node(cfg).await?;
                supervisor.record_action(&format!("ADD_NODE {name}"), &session.address, &session.user).await;
                Vec::new()
            }

            "removeNode" => {
                let node: NodeRef = payload(envelope.payload)?;
                supervisor.remove_node(node.id).await?;
                supervisor
                    .record_action(&format!("REMOVE_NODE {}", node.id), &session.address, &session.user)
                    .await;
                Vec::new()
            }

            "nodeOp" => {
                let req: NodeOpRequest = payload(envelope.payload)?;
                let op = match (req.code.as_str(), req.exchange_id) {
                    ("onoff", _) => NodeOp::OnOff { mode: req.mode },
                    ("exchange.onoff", Some(exchange_id)) => NodeOp::ExchangeOnOff { exchange_id, mode: req.mode },
                    ("exchange.onoff", None) => return Err(BadRequest("exchangeId is required".into())),
                    (code, _) => return Err(BadRequest(format!("unknown node operation `{code}`"))),
                };
                supervisor.node_op(req.id, op).await?;
                Vec::new()
            }

            "masterOn" => {
                let req: ModeRequest = payload(envelope.payload)?;
                match req.mode.as_str() {
                    "on" => {
                        supervisor.start().await;
                    }
                    "off" => supervisor.stop().await,
                    "shutdown" => supervisor.shutdown().await,
                    other => return Err(BadRequest(format!("unknown mode `{other}`"))),
                }
                supervisor
                    .record_action(&format!("MASTER_{}", req.mode.to_uppercase()), &session.address, &session.user)
                    .await;
                Vec::new()
            }

            other => return Err(BadRequest(format!("unknown event `{other}`"))),
        };

        Ok(replies)
    }

    async fn bad_request(&self, event: &str, reason: String) {
        self.supervisor
            .bus()
            .emit(NodeEvent::RcBadRequest { event: event.to_string(), reason })
            .await;
    }
}
