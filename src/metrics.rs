use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::time::sleep;

/// Global runtime metrics for both node roles.
///
/// Purpose:
/// - Track live sessions and operator sockets
/// - Track update ticks and fleet sweeps
/// - Track RPC and chain health
/// - Track notification throughput
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // Sessions (collector side)
    pub sessions_active: AtomicUsize,
    pub sessions_expired: AtomicUsize,

    // Update loop (collector side)
    pub ticks_run: AtomicUsize,
    pub readings_fetched: AtomicUsize,
    pub readings_faulted: AtomicUsize,
    pub aggregation_overflows: AtomicUsize,

    // Sweep loop (supervisor side)
    pub sweeps_run: AtomicUsize,
    pub rpc_successes: AtomicUsize,
    pub rpc_failures: AtomicUsize,
    pub forced_disconnects: AtomicUsize,

    // Chain
    pub chain_pushes: AtomicUsize,
    pub chain_push_errors: AtomicUsize,

    pub control_sockets_authenticated: AtomicUsize,
    pub notifications_emitted: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn inc(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement for gauges.
    pub fn dec(counter: &AtomicUsize) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn snapshot(&self) -> String {
        format!(
            "sess={} sess_exp={} ticks={} fetched={} faulted={} overflows={} sweeps={} rpc_ok={} rpc_err={} forced_dc={} chain={} chain_err={} ctl={} notif={}",
            self.sessions_active.load(Ordering::Relaxed),
            self.sessions_expired.load(Ordering::Relaxed),
            self.ticks_run.load(Ordering::Relaxed),
            self.readings_fetched.load(Ordering::Relaxed),
            self.readings_faulted.load(Ordering::Relaxed),
            self.aggregation_overflows.load(Ordering::Relaxed),
            self.sweeps_run.load(Ordering::Relaxed),
            self.rpc_successes.load(Ordering::Relaxed),
            self.rpc_failures.load(Ordering::Relaxed),
            self.forced_disconnects.load(Ordering::Relaxed),
            self.chain_pushes.load(Ordering::Relaxed),
            self.chain_push_errors.load(Ordering::Relaxed),
            self.control_sockets_authenticated.load(Ordering::Relaxed),
            self.notifications_emitted.load(Ordering::Relaxed),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));

/// Starts the periodic, low-noise metrics reporter.
pub fn spawn_reporter(every: Duration) {
    tokio::spawn(async move {
        loop {
            sleep(every).await;
            log::info!("[METRICS] {}", METRICS.snapshot());
        }
    });
}
