//! Storage collaborator
//!
//! The core never defines storage schemas; it only appends and reads
//! back through this trait. Two implementations:
//! - `RedisStorage`: production, lists/hashes under a key prefix
//! - `MemoryStorage`: demo mode and tests

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use serde_json::Value;

use crate::schema::{AuditAction, FleetState, NotificationRecord, RemoteNodeRecord, TickerReading};

pub use memory::MemoryStorage;
pub use redis_store::RedisStorage;

/// Bound applied to every append-only list kept by a backend.
pub const LIST_CAP: usize = 10_000;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn save_tickers(&self, readings: &[TickerReading]) -> anyhow::Result<()>;

    async fn add_notification(&self, record: &NotificationRecord) -> anyhow::Result<()>;

    /// Page of stored notifications, oldest first.
    ///
    /// Returns `(page, total)`.
    async fn notifications(&self, index: usize, count: usize) -> anyhow::Result<(Vec<NotificationRecord>, usize)>;

    /// Latest collector state snapshot.
    async fn update_node_state(&self, state: &Value) -> anyhow::Result<()>;

    async fn update_fleet_state(&self, state: &FleetState) -> anyhow::Result<()>;

    async fn add_remote_node(&self, record: &RemoteNodeRecord) -> anyhow::Result<()>;

    /// Returns `true` if a record was removed.
    async fn remove_remote_node(&self, name: &str) -> anyhow::Result<bool>;

    async fn remote_nodes(&self) -> anyhow::Result<Vec<RemoteNodeRecord>>;

    async fn add_action(&self, action: &AuditAction) -> anyhow::Result<()>;

    /// Most recent `limit` audit actions, oldest first.
    async fn actions(&self, limit: usize) -> anyhow::Result<Vec<AuditAction>>;
}
