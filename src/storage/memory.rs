use std::collections::VecDeque;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{LIST_CAP, Storage};
use crate::schema::{AuditAction, FleetState, NotificationRecord, RemoteNodeRecord, TickerReading};

/// In-process storage used in demo mode and by tests.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tickers: VecDeque<TickerReading>,
    notifications: VecDeque<NotificationRecord>,
    node_state: Option<Value>,
    fleet_state: Option<FleetState>,
    nodes: Vec<RemoteNodeRecord>,
    actions: VecDeque<AuditAction>,
}

fn push_capped<T>(list: &mut VecDeque<T>, item: T) {
    list.push_back(item);
    while list.len() > LIST_CAP {
        list.pop_front();
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ticker_count(&self) -> usize {
        self.inner.lock().await.tickers.len()
    }

    pub async fn node_state(&self) -> Option<Value> {
        self.inner.lock().await.node_state.clone()
    }

    pub async fn fleet_state(&self) -> Option<FleetState> {
        self.inner.lock().await.fleet_state.clone()
    }

    /// Codes of every stored notification, in emission order.
    pub async fn notification_codes(&self) -> Vec<String> {
        self.inner.lock().await.notifications.iter().map(|n| n.code.clone()).collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_tickers(&self, readings: &[TickerReading]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        for r in readings {
            push_capped(&mut inner.tickers, r.clone());
        }
        Ok(())
    }

    async fn add_notification(&self, record: &NotificationRecord) -> anyhow::Result<()> {
        push_capped(&mut self.inner.lock().await.notifications, record.clone());
        Ok(())
    }

    async fn notifications(&self, index: usize, count: usize) -> anyhow::Result<(Vec<NotificationRecord>, usize)> {
        let inner = self.inner.lock().await;
        let page = inner.notifications.iter().skip(index).take(count).cloned().collect();
        Ok((page, inner.notifications.len()))
    }

    async fn update_node_state(&self, state: &Value) -> anyhow::Result<()> {
        self.inner.lock().await.node_state = Some(state.clone());
        Ok(())
    }

    async fn update_fleet_state(&self, state: &FleetState) -> anyhow::Result<()> {
        self.inner.lock().await.fleet_state = Some(state.clone());
        Ok(())
    }

    async fn add_remote_node(&self, record: &RemoteNodeRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.nodes.retain(|n| n.name != record.name);
        inner.nodes.push(record.clone());
        Ok(())
    }

    async fn remove_remote_node(&self, name: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.nodes.len();
        inner.nodes.retain(|n| n.name != name);
        Ok(inner.nodes.len() != before)
    }

    async fn remote_nodes(&self) -> anyhow::Result<Vec<RemoteNodeRecord>> {
        Ok(self.inner.lock().await.nodes.clone())
    }

    async fn add_action(&self, action: &AuditAction) -> anyhow::Result<()> {
        push_capped(&mut self.inner.lock().await.actions, action.clone());
        Ok(())
    }

    async fn actions(&self, limit: usize) -> anyhow::Result<Vec<AuditAction>> {
        let inner = self.inner.lock().await;
        let skip = inner.actions.len().saturating_sub(limit);
        Ok(inner.actions.iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str) -> AuditAction {
        AuditAction {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            user: "ops".to_string(),
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn actions_returns_most_recent_in_order() {
        let s = MemoryStorage::new();
        for n in ["a", "b", "c"] {
            s.add_action(&action(n)).await.unwrap();
        }
        let last: Vec<_> = s.actions(2).await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(last, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn notifications_are_paged() {
        let s = MemoryStorage::new();
        for i in 0..5 {
            let rec = NotificationRecord {
                node_id: "n".into(),
                timestamp: i,
                code: format!("C{i}"),
                payload: Value::Null,
            };
            s.add_notification(&rec).await.unwrap();
        }
        let (page, total) = s.notifications(3, 10).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].code, "C3");
    }

    #[tokio::test]
    async fn remote_node_records_replace_by_name() {
        let s = MemoryStorage::new();
        let mut rec = RemoteNodeRecord {
            name: "a".into(),
            description: String::new(),
            host: "h".into(),
            port: 1,
            secret: "x".into(),
            polling: crate::schema::PollingConfig {
                ping_rate_secs: 1,
                request_retry_count: 1,
                request_timeout_secs: 1,
            },
        };
        s.add_remote_node(&rec).await.unwrap();
        rec.port = 2;
        s.add_remote_node(&rec).await.unwrap();
        assert_eq!(s.remote_nodes().await.unwrap().len(), 1);
        assert!(s.remove_remote_node("a").await.unwrap());
        assert!(!s.remove_remote_node("a").await.unwrap());
    }
}
