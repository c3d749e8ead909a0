use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::taskflow::ResourceRole;

/// Execution events emitted while a task flow runs.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted { leaves: usize },
    ResourceOpened { url: String, role: ResourceRole },
    ResourceReleased { url: String, role: ResourceRole },
    TableBuilt { url: String, table: String },
    BuildFailed { url: String, table: String, leaves: usize, error: String },
    LeafStarted { key: String },
    LeafFinished { key: String, rows: usize },
    LeafFailed { key: String, error: String },
    Persisted { url: String },
    PersistSkipped { url: String, reason: String },
    PersistFailed { url: String, error: String },
    RunFinished {
        elapsed: Duration,
        metrics: ExecutionMetricsSnapshot,
    },
}

/// Observer hook for execution events.
pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

/// Forwards execution events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::RunStarted { leaves } => info!(leaves, "run started"),
            ExecutionEvent::ResourceOpened { url, role } => debug!(%url, ?role, "resource opened"),
            ExecutionEvent::ResourceReleased { url, role } => debug!(%url, ?role, "resource released"),
            ExecutionEvent::TableBuilt { url, table } => info!(%url, %table, "table built"),
            ExecutionEvent::BuildFailed {
                url,
                table,
                leaves,
                error,
            } => error!(%url, %table, leaves, %error, "build failed; skipping table"),
            ExecutionEvent::LeafStarted { key } => debug!(%key, "leaf started"),
            ExecutionEvent::LeafFinished { key, rows } => info!(%key, rows, "leaf ingested"),
            ExecutionEvent::LeafFailed { key, error } => error!(%key, %error, "leaf failed"),
            ExecutionEvent::Persisted { url } => info!(%url, "target persisted"),
            ExecutionEvent::PersistSkipped { url, reason } => warn!(%url, %reason, "persist skipped"),
            ExecutionEvent::PersistFailed { url, error } => error!(%url, %error, "persist failed"),
            ExecutionEvent::RunFinished { elapsed, metrics } => info!(?elapsed, %metrics, "run finished"),
        }
    }
}

/// Fans events out to a list of observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn ExecutionObserver>>) -> Self {
        Self { observers }
    }
}

impl fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers_len", &self.observers.len())
            .finish()
    }
}

impl ExecutionObserver for CompositeObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        for o in &self.observers {
            o.on_event(event);
        }
    }
}

/// Real-time metrics for an execution run.
///
/// The executor updates these counters while it runs; callers can snapshot them at any time.
#[derive(Debug)]
pub struct ExecutionMetrics {
    run_id: AtomicU64,
    elapsed_ns: AtomicU64,

    leaves_started: AtomicU64,
    leaves_succeeded: AtomicU64,
    leaves_failed: AtomicU64,
    rows_written: AtomicU64,
    tables_built: AtomicU64,
    builds_failed: AtomicU64,
    persists: AtomicU64,

    active_leaves: AtomicUsize,
    max_active_leaves: AtomicUsize,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self {
            run_id: AtomicU64::new(0),
            elapsed_ns: AtomicU64::new(0),
            leaves_started: AtomicU64::new(0),
            leaves_succeeded: AtomicU64::new(0),
            leaves_failed: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            tables_built: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            persists: AtomicU64::new(0),
            active_leaves: AtomicUsize::new(0),
            max_active_leaves: AtomicUsize::new(0),
        }
    }

    pub fn begin_run(&self) {
        let _ = self.run_id.fetch_add(1, Ordering::SeqCst);
        for counter in [
            &self.elapsed_ns,
            &self.leaves_started,
            &self.leaves_succeeded,
            &self.leaves_failed,
            &self.rows_written,
            &self.tables_built,
            &self.builds_failed,
            &self.persists,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        self.active_leaves.store(0, Ordering::SeqCst);
        self.max_active_leaves.store(0, Ordering::SeqCst);
    }

    pub fn end_run(&self, elapsed: Duration) {
        self.elapsed_ns
            .store(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::SeqCst);
    }

    pub fn on_leaf_start(&self) {
        let _ = self.leaves_started.fetch_add(1, Ordering::SeqCst);
        let now = self.active_leaves.fetch_add(1, Ordering::SeqCst) + 1;
        update_max_usize(&self.max_active_leaves, now);
    }

    pub fn on_leaf_end(&self, rows: Option<usize>) {
        match rows {
            Some(n) => {
                let _ = self.leaves_succeeded.fetch_add(1, Ordering::SeqCst);
                let _ = self.rows_written.fetch_add(n as u64, Ordering::SeqCst);
            }
            None => {
                let _ = self.leaves_failed.fetch_add(1, Ordering::SeqCst);
            }
        }
        let _ = self.active_leaves.fetch_sub(1, Ordering::SeqCst);
    }

    /// Leaves that never ran because their table or resource failed first.
    pub fn on_leaves_skipped(&self, n: usize) {
        let _ = self.leaves_failed.fetch_add(n as u64, Ordering::SeqCst);
    }

    pub fn on_build(&self, ok: bool) {
        let counter = if ok { &self.tables_built } else { &self.builds_failed };
        let _ = counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_persist(&self) {
        let _ = self.persists.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ExecutionMetricsSnapshot {
        let elapsed_ns = self.elapsed_ns.load(Ordering::SeqCst);
        let elapsed = if elapsed_ns > 0 {
            Some(Duration::from_nanos(elapsed_ns))
        } else {
            None
        };

        ExecutionMetricsSnapshot {
            run_id: self.run_id.load(Ordering::SeqCst),
            elapsed,
            leaves_started: self.leaves_started.load(Ordering::SeqCst),
            leaves_succeeded: self.leaves_succeeded.load(Ordering::SeqCst),
            leaves_failed: self.leaves_failed.load(Ordering::SeqCst),
            rows_written: self.rows_written.load(Ordering::SeqCst),
            tables_built: self.tables_built.load(Ordering::SeqCst),
            builds_failed: self.builds_failed.load(Ordering::SeqCst),
            persists: self.persists.load(Ordering::SeqCst),
            max_active_leaves: self.max_active_leaves.load(Ordering::SeqCst),
        }
    }
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn update_max_usize(dst: &AtomicUsize, now: usize) {
    loop {
        let cur = dst.load(Ordering::SeqCst);
        if now <= cur {
            break;
        }
        if dst
            .compare_exchange(cur, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }
}

/// Immutable snapshot of [`ExecutionMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionMetricsSnapshot {
    pub run_id: u64,
    pub elapsed: Option<Duration>,
    pub leaves_started: u64,
    pub leaves_succeeded: u64,
    pub leaves_failed: u64,
    pub rows_written: u64,
    pub tables_built: u64,
    pub builds_failed: u64,
    pub persists: u64,
    pub max_active_leaves: usize,
}

impl fmt::Display for ExecutionMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_id={}, leaves={}/{} ok, failed={}, rows_written={}, tables_built={}, builds_failed={}, persists={}, max_active_leaves={}, elapsed={:?}",
            self.run_id,
            self.leaves_succeeded,
            self.leaves_started,
            self.leaves_failed,
            self.rows_written,
            self.tables_built,
            self.builds_failed,
            self.persists,
            self.max_active_leaves,
            self.elapsed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_track_leaves_and_reset_per_run() {
        let m = ExecutionMetrics::new();
        m.begin_run();
        m.on_leaf_start();
        m.on_leaf_start();
        m.on_leaf_end(Some(10));
        m.on_leaf_end(None);
        m.on_leaves_skipped(2);
        m.on_build(true);
        m.end_run(Duration::from_millis(5));

        let snap = m.snapshot();
        assert_eq!(snap.run_id, 1);
        assert_eq!(snap.leaves_started, 2);
        assert_eq!(snap.leaves_succeeded, 1);
        assert_eq!(snap.leaves_failed, 3);
        assert_eq!(snap.rows_written, 10);
        assert_eq!(snap.max_active_leaves, 2);
        assert!(snap.elapsed.is_some());

        m.begin_run();
        let snap = m.snapshot();
        assert_eq!(snap.run_id, 2);
        assert_eq!(snap.leaves_started, 0);
        assert!(snap.elapsed.is_none());
    }
}
