mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use oracle_net::chain::{ChainClient, ChainEvent};
use oracle_net::collector::NodePhase;
use oracle_net::collector::controller::TickOutcome;
use oracle_net::rpc::NodeHandle;

use common::{collector, collector_with_chain, faulted, reading};

/// Chain whose `init` blocks until released.
#[derive(Default)]
struct HeldChain {
    release: Notify,
}

#[async_trait]
impl ChainClient for HeldChain {
    async fn init(&self) -> anyhow::Result<()> {
        self.release.notified().await;
        Ok(())
    }

    async fn push(&self, _value: f64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn state(&self) -> Value {
        Value::Null
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<ChainEvent>> {
        None
    }
}

#[tokio::test]
async fn below_minimum_halts_without_touching_the_average() {
    let rig = collector("L0", 2).await;

    rig.feed.set_values(&[100.0, 102.0]);
    assert_eq!(rig.controller.tick().await, TickOutcome::Updated);
    assert_eq!(rig.controller.run_state().await.last_average, 101.0);

    rig.feed.set(vec![reading("ex0", 500.0), faulted("ex1")]);
    assert_eq!(rig.controller.tick().await, TickOutcome::Halted);

    assert_eq!(rig.controller.phase().await, NodePhase::Halted);
    let state = rig.controller.run_state().await;
    assert_eq!(state.last_average, 101.0);
    assert!(!state.running);
    assert_eq!(state.last_error.as_deref(), Some("NODE_TICKER_MINIMUM_LIMIT"));
    assert!(rig.storage.notification_codes().await.contains(&"NODE_TICKER_MINIMUM_LIMIT".to_string()));
}

#[tokio::test]
async fn overflow_keeps_running_and_keeps_the_average() {
    let rig = collector("L0", 1).await;

    rig.feed.set_values(&[100.0, 100.0]);
    rig.controller.tick().await;

    rig.feed.set_values(&[102.0, 101.0, 150.0]);
    assert_eq!(rig.controller.tick().await, TickOutcome::Overflow);

    let state = rig.controller.run_state().await;
    assert_eq!(state.last_average, 100.0);
    assert_eq!(state.last_error.as_deref(), Some("TICKER_DELTA_OVERFLOW"));

    let codes = rig.storage.notification_codes().await;
    assert_eq!(codes.iter().filter(|c| *c == "RATES_UPDATED").count(), 1);
    assert!(codes.contains(&"TICKER_DELTA_OVERFLOW".to_string()));

    // Readings are stored either way
    assert_eq!(rig.storage.ticker_count().await, 5);
}

#[tokio::test]
async fn each_tick_publishes_a_new_batch() {
    let rig = collector("L0", 1).await;

    assert_eq!(rig.controller.tickers().await.0, 0);
    rig.feed.set_values(&[100.0]);
    rig.controller.tick().await;
    rig.controller.tick().await;

    let (token, readings) = rig.controller.tickers().await;
    assert_eq!(token, 2);
    assert_eq!(readings.len(), 1);

    let state = rig.controller.export_state().await;
    assert_eq!(state["run"]["last_average"], 100.0);
    assert_eq!(state["phase"], "stopped");
    assert!(rig.storage.node_state().await.is_some());
}

#[tokio::test]
async fn lifecycle_follows_start_and_stop() {
    let rig = collector("L0", 1).await;
    rig.feed.set_values(&[100.0]);

    assert!(rig.controller.start().await);
    assert_eq!(rig.controller.phase().await, NodePhase::Running);
    assert!(!rig.controller.start().await);

    rig.controller.stop().await;
    let phase = rig.controller.phase().await;
    assert!(matches!(phase, NodePhase::Stopping | NodePhase::Stopped));

    // the loop notices the cleared flag and settles on Stopped
    for _ in 0..50 {
        if rig.controller.phase().await == NodePhase::Stopped {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(rig.controller.phase().await, NodePhase::Stopped);
    assert!(rig.controller.start().await);
    rig.controller.stop().await;
}

#[tokio::test]
async fn halted_node_restarts_on_request() {
    let rig = collector("L0", 2).await;
    rig.feed.set_values(&[100.0]);
    rig.controller.tick().await;
    assert_eq!(rig.controller.phase().await, NodePhase::Halted);

    rig.feed.set_values(&[100.0, 101.0]);
    rig.controller.on_off("on").await.unwrap();
    assert_eq!(rig.controller.phase().await, NodePhase::Running);
    rig.controller.on_off("off").await.unwrap();

    assert_eq!(rig.controller.on_off("sideways").await.unwrap_err().code(), "BAD_OPERATION");
    assert_eq!(rig.controller.exchange_on_off(7, "on").await.unwrap_err().code(), "BAD_EXCHANGE_ID");
}

#[tokio::test]
async fn stop_during_chain_init_wins() {
    let chain = Arc::new(HeldChain::default());
    let rig = collector_with_chain("L0", 1, chain.clone()).await;
    rig.feed.set_values(&[100.0]);

    let starting = tokio::spawn({
        let controller = rig.controller.clone();
        async move { controller.start().await }
    });
    while rig.controller.phase().await != NodePhase::Starting {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    rig.controller.stop().await;
    chain.release.notify_one();

    assert!(!starting.await.unwrap());
    assert_eq!(rig.controller.phase().await, NodePhase::Stopped);
    assert!(!rig.controller.run_state().await.running);

    // A later start goes through; chain init already happened
    assert!(rig.controller.start().await);
    assert_eq!(rig.controller.phase().await, NodePhase::Running);
    rig.controller.stop().await;
}
