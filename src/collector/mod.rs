/// Collector module
///
/// This module groups all logic responsible for one collector node:
/// - Owning the node state machine (`controller`)
/// - Running the self-rescheduling update loop and the event
///   listeners that react to chain and session events (`runner`)
///
/// The collector layer is the orchestration layer between:
/// - The feed collaborator (exchange readings)
/// - The aggregation engine
/// - The chain collaborator (value pushes)
/// - The RPC surface polled by the supervisor
///
/// Design notes:
/// - Exactly one controller per process, built once in `main` and
///   handed out as `Arc<CollectorController>`
/// - Exchange-specific logic MUST NOT live here
pub mod controller;
pub mod runner;

use serde::Serialize;

pub use controller::{CollectorController, CollectorSettings};

/// Node lifecycle.
///
/// ```text
/// Stopped -> Starting -> Running -> Stopping -> Stopped
///                           |
///                           +-> Halted (until an explicit start)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Halted,
}

impl NodePhase {
    pub fn can_start(self) -> bool {
        matches!(self, NodePhase::Stopped | NodePhase::Halted)
    }
}
