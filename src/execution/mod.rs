//! Planning and execution of ingest runs.
//!
//! This module sits above [`crate::config`] and [`crate::io`]:
//!
//! - [`plan`]: config tree to concrete leaf jobs (splits resolved)
//! - [`TaskFlow`]: grouping of leaves into a tree of resource, table and flow nodes
//! - [`Engine`]: runs a task flow and reports per-leaf outcomes
//! - real-time metrics and observer hooks for monitoring

pub mod ingest;
mod observer;
pub mod plan;
mod taskflow;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::info;

use crate::config::{ConfigTree, LeafJob};
use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::io::Session;

pub use ingest::SAMPLE_ROWS;
pub use observer::{
    CompositeObserver, ExecutionEvent, ExecutionMetrics, ExecutionMetricsSnapshot, ExecutionObserver,
    TracingObserver,
};
pub use plan::plan;
pub use taskflow::{ResourceRole, TaskFlow};

use taskflow::RunContext;

/// Configuration for the [`Engine`].
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Workers for parallel table groups.
    ///
    /// If `None`, uses the platform's available parallelism.
    pub num_threads: Option<usize>,
    /// Rows pulled for consistency checks and build shapes.
    pub sample_rows: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        let n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            num_threads: Some(n),
            sample_rows: SAMPLE_ROWS,
        }
    }
}

/// Result of one leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafOutcome {
    pub key: String,
    /// `url::table` the leaf writes to.
    pub target: String,
    pub rows: Option<usize>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl LeafOutcome {
    pub(crate) fn succeeded(key: String, target: String, rows: usize) -> Self {
        Self {
            key,
            target,
            rows: Some(rows),
            error: None,
            error_kind: None,
        }
    }

    pub(crate) fn failed(key: String, target: String, error: &IngestError) -> Self {
        Self {
            key,
            target,
            rows: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcomes of one run, in completion order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcomes: Vec<LeafOutcome>,
    pub metrics: ExecutionMetricsSnapshot,
}

impl RunReport {
    /// `false` when any build or consistency error occurred anywhere in the run.
    ///
    /// Other leaf failures (a missing file, a bad transform) are reported per leaf but do not
    /// flip the overall result; see [`RunReport::all_succeeded`].
    pub fn success(&self) -> bool {
        !self
            .outcomes
            .iter()
            .filter_map(|o| o.error_kind)
            .any(taskflow::is_fatal)
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(LeafOutcome::is_ok)
    }

    pub fn failed(&self) -> impl Iterator<Item = &LeafOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    pub fn outcome(&self, key: &str) -> Option<&LeafOutcome> {
        self.outcomes.iter().find(|o| o.key == key)
    }
}

/// Plans and runs config trees.
pub struct Engine {
    opts: ExecutionOptions,
    observer: Arc<dyn ExecutionObserver>,
    metrics: Arc<ExecutionMetrics>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("opts", &self.opts).finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(ExecutionOptions::default())
    }
}

impl Engine {
    /// An engine reporting through [`TracingObserver`].
    pub fn new(opts: ExecutionOptions) -> Self {
        Self {
            opts,
            observer: Arc::new(TracingObserver),
            metrics: Arc::new(ExecutionMetrics::new()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.opts
    }

    /// Shared metrics handle; may be snapshotted while a run is in progress.
    pub fn metrics(&self) -> Arc<ExecutionMetrics> {
        Arc::clone(&self.metrics)
    }

    fn num_threads(&self) -> usize {
        self.opts.num_threads.unwrap_or(1).max(1)
    }

    /// Expand the tree into concrete leaves.
    pub fn plan(&self, tree: &mut ConfigTree, session: &Session) -> IngestResult<Vec<LeafJob>> {
        plan::plan(tree, session)
    }

    pub fn build_flow(&self, leaves: Vec<LeafJob>, session: &Session) -> IngestResult<TaskFlow> {
        TaskFlow::build(leaves, session, self.num_threads())
    }

    /// Run a built flow. Leaf failures are reported, never raised.
    pub fn execute(&self, flow: &TaskFlow, session: &Session) -> RunReport {
        let started = Instant::now();
        self.metrics.begin_run();
        self.observer.on_event(&ExecutionEvent::RunStarted {
            leaves: flow.leaf_count(),
        });

        let ctx = RunContext {
            session,
            sample_rows: self.opts.sample_rows,
            observer: self.observer.as_ref(),
            metrics: self.metrics.as_ref(),
            outcomes: Mutex::new(Vec::new()),
        };
        flow.run(&ctx);
        let outcomes = ctx.outcomes.into_inner().unwrap_or_else(|e| e.into_inner());

        let elapsed = started.elapsed();
        self.metrics.end_run(elapsed);
        let metrics = self.metrics.snapshot();
        self.observer.on_event(&ExecutionEvent::RunFinished {
            elapsed,
            metrics: metrics.clone(),
        });
        RunReport { outcomes, metrics }
    }

    /// Plan, build and execute `tree` within `session`.
    pub fn run(&self, tree: &mut ConfigTree, session: &Session) -> IngestResult<RunReport> {
        let leaves = self.plan(tree, session)?;
        let flow = self.build_flow(leaves, session)?;
        Ok(self.execute(&flow, session))
    }

    /// Load the tree containing `path` and run it in a fresh session rooted at the tree root.
    pub fn run_path(&self, path: impl AsRef<Path>) -> IngestResult<RunReport> {
        let mut tree = ConfigTree::from_path(path)?;
        let session = Session::new(tree.root());
        let report = self.run(&mut tree, &session)?;
        info!(
            success = report.success(),
            failed = report.failed().count(),
            "run complete"
        );
        Ok(report)
    }
}
