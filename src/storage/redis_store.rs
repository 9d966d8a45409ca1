use async_trait::async_trait;
use anyhow::Context;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{LIST_CAP, Storage};
use crate::schema::{AuditAction, FleetState, NotificationRecord, RemoteNodeRecord, TickerReading};

/// Redis-backed storage.
///
/// LAYOUT (all keys under `<prefix>:`):
/// - `tickers`        list of JSON readings
/// - `notifications`  list of JSON notification records
/// - `actions`        list of JSON audit actions
/// - `node_state`     JSON string
/// - `fleet_state`    JSON string
/// - `nodes`          hash name -> JSON remote node record
///
/// Lists are trimmed to `LIST_CAP` after every append.
///
/// NOTES:
/// - The multiplexed connection is cheap to clone; every call works
///   on its own clone so no lock is held across awaits.
pub struct RedisStorage {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisStorage {
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("connecting to redis")?;

        log::info!("Redis storage connected (prefix={prefix})");

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    async fn append<T: Serialize>(&self, list: &str, items: &[T]) -> anyhow::Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let key = self.key(list);
        let encoded = items
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.conn.clone();
        let _: () = conn.rpush(&key, encoded).await?;
        let _: () = conn.ltrim(&key, -(LIST_CAP as isize), -1).await?;
        Ok(())
    }

    async fn range<T: DeserializeOwned>(&self, list: &str, start: isize, stop: isize) -> anyhow::Result<Vec<T>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(self.key(list), start, stop).await?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(Into::into))
            .collect()
    }

    async fn put<T: Serialize>(&self, name: &str, value: &T) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.key(name), serde_json::to_string(value)?).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn save_tickers(&self, readings: &[TickerReading]) -> anyhow::Result<()> {
        self.append("tickers", readings).await
    }

    async fn add_notification(&self, record: &NotificationRecord) -> anyhow::Result<()> {
        self.append("notifications", std::slice::from_ref(record)).await
    }

    async fn notifications(&self, index: usize, count: usize) -> anyhow::Result<(Vec<NotificationRecord>, usize)> {
        let mut conn = self.conn.clone();
        let total: usize = conn.llen(self.key("notifications")).await?;
        if count == 0 || index >= total {
            return Ok((Vec::new(), total));
        }
        let stop = (index + count - 1) as isize;
        let page = self.range("notifications", index as isize, stop).await?;
        Ok((page, total))
    }

    async fn update_node_state(&self, state: &Value) -> anyhow::Result<()> {
        self.put("node_state", state).await
    }

    async fn update_fleet_state(&self, state: &FleetState) -> anyhow::Result<()> {
        self.put("fleet_state", state).await
    }

    async fn add_remote_node(&self, record: &RemoteNodeRecord) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.key("nodes"), &record.name, serde_json::to_string(record)?)
            .await?;
        Ok(())
    }

    async fn remove_remote_node(&self, name: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.hdel(self.key("nodes"), name).await?;
        Ok(removed > 0)
    }

    async fn remote_nodes(&self) -> anyhow::Result<Vec<RemoteNodeRecord>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(self.key("nodes")).await?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(Into::into))
            .collect()
    }

    async fn add_action(&self, action: &AuditAction) -> anyhow::Result<()> {
        self.append("actions", std::slice::from_ref(action)).await
    }

    async fn actions(&self, limit: usize) -> anyhow::Result<Vec<AuditAction>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.range("actions", -(limit as isize), -1).await
    }
}
