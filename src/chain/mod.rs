//! Chain collaborator
//!
//! The collector only needs two things from the ledger side:
//! - push one aggregated value
//! - receive asynchronous trigger events asking for a push
//!
//! Wallets, providers and contract ABIs live behind the relay.

pub mod relay;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub use relay::ChainRelay;

/// Inbound events from the chain side.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    /// The contract asks for a fresh value.
    Trigger { name: String },

    /// Failure reported by the relay outside of a push call.
    Error { code: String, message: String },
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Starts background connectivity. A failure leaves the node running
    /// without chain pushes.
    async fn init(&self) -> anyhow::Result<()>;

    /// Queues `value` for commitment.
    async fn push(&self, value: f64) -> anyhow::Result<()>;

    /// Snapshot included in the node state export.
    async fn state(&self) -> Value;

    /// Hands out the inbound event stream. Only the first call gets it.
    async fn take_events(&self) -> Option<mpsc::Receiver<ChainEvent>>;
}

/// Chain client for demo mode and nodes without a relay.
///
/// Pushes succeed and are only logged; no events are ever produced.
pub struct NullChain;

#[async_trait]
impl ChainClient for NullChain {
    async fn init(&self) -> anyhow::Result<()> {
        log::info!("Chain relay disabled (no chain section or demo mode)");
        Ok(())
    }

    async fn push(&self, value: f64) -> anyhow::Result<()> {
        log::info!("DEMO chain push {value}");
        Ok(())
    }

    async fn state(&self) -> Value {
        json!({ "kind": "none" })
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<ChainEvent>> {
        None
    }
}
