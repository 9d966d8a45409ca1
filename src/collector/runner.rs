use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::time::sleep;

use super::NodePhase;
use super::controller::{CollectorController, TickOutcome};
use crate::chain::ChainEvent;
use crate::notification::NodeEvent;
use crate::rpc::SessionEvent;
use crate::rpc::session::short;

/// Runs the self-rescheduling update loop of one collector.
///
/// This loop:
/// - Runs one tick
/// - Sleeps `update_timeout` (cut short by `stop`)
/// - Repeats while the running flag is set
///
/// GUARANTEES:
/// - A tick in flight always completes; `stop` only prevents the next one
/// - The loop exits on its own after a halting tick
/// - On a requested stop the phase lands on `Stopped`
///
/// NOT RESPONSIBLE FOR:
/// - Deciding what a tick does (controller)
/// - Reconnecting the chain relay (relay's own loop)
///
pub async fn run_update_loop(ctrl: Arc<CollectorController>) {
    let id = ctrl.settings().id.clone();
    let period = ctrl.settings().update_timeout;
    log::info!("[{id}] update loop started, every {period:?}");

    while ctrl.running.load(Ordering::SeqCst) {
        if ctrl.tick().await == TickOutcome::Halted {
            log::warn!("[{id}] halted, waiting for an explicit start");
            return;
        }

        // Both futures are created before the flag is checked again, so a
        // stop issued during the tick is not missed.
        let woken = ctrl.wake.notified();
        if !ctrl.running.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = sleep(period) => {}
            _ = woken => {}
        }
    }

    if ctrl.phase().await == NodePhase::Stopping {
        ctrl.set_phase(NodePhase::Stopped).await;
    }
    log::info!("[{id}] update loop stopped");
}

/// Forwards chain events to the controller.
///
/// - `Trigger` pushes the current average
/// - `Error` becomes a `CONTRACT_ERROR` notification
///
/// Called once, after a successful chain init.
pub async fn spawn_chain_listener(ctrl: Arc<CollectorController>) {
    let Some(mut events) = ctrl.chain.take_events().await else {
        return;
    };

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChainEvent::Trigger { name } => ctrl.push_current_average(&name).await,
                ChainEvent::Error { code, message } => {
                    ctrl.bus.emit(NodeEvent::ContractError { code, message }).await;
                }
            }
        }
    });
}

/// Turns session lifecycle events into notifications and audit actions.
pub fn spawn_session_listener(ctrl: Arc<CollectorController>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Connected { session_id, address } => {
                    ctrl.record_action("CLIENT_CONNECTED", &address, short(&session_id)).await;
                    ctrl.bus
                        .emit(NodeEvent::ClientConnected {
                            session_id: short(&session_id).to_string(),
                            address,
                        })
                        .await;
                }
                SessionEvent::Disconnected { session_id, address, reason } => {
                    ctrl.record_action("CLIENT_DISCONNECTED", &address, short(&session_id)).await;
                    ctrl.bus
                        .emit(NodeEvent::ClientDisconnected {
                            session_id: short(&session_id).to_string(),
                            reason: reason.to_string(),
                        })
                        .await;
                }
            }
        }
    });
}
