//! Task-flow tree: grouping of leaf jobs and its executor.
//!
//! Shape of a built flow:
//!
//! ```text
//! Flow (serial, targets in staging order)
//! └─ Resource (target container)
//!    └─ Flow (serial, or a worker pool when every leaf allows parallel load)
//!       └─ TableGroup (build step for one target table)
//!          └─ Flow (serial)
//!             └─ Resource (source container)
//!                └─ Flow (serial)
//!                   └─ Execute (one leaf)
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Mutex;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, warn};

use crate::backend::BackendKind;
use crate::config::{IfExists, LeafJob};
use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::io::{lock, Session};

use super::ingest;
use super::observer::{ExecutionEvent, ExecutionMetrics, ExecutionObserver};
use super::LeafOutcome;

/// Which side of a leaf a resource wrapper serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRole {
    Source,
    Target,
}

/// Ingest of one leaf job.
pub struct ExecuteTask {
    key: String,
    target: String,
    leaf: Mutex<LeafJob>,
}

/// Opens a container once around its subtree, and releases it afterwards.
///
/// Target wrappers persist their container when something in the subtree was written.
pub struct ResourceTask {
    url: String,
    kind: BackendKind,
    role: ResourceRole,
    replace: bool,
    uses: usize,
    child: Box<TaskNode>,
}

/// Runs the build step of one target table before its writers.
pub struct TableGroupTask {
    url: String,
    table: String,
    first: LeafJob,
    child: Box<TaskNode>,
}

/// Ordered children, run serially or on a worker pool fixed at construction.
pub struct Flow {
    children: Vec<TaskNode>,
    pool: Option<ThreadPool>,
}

pub enum TaskNode {
    Execute(ExecuteTask),
    Resource(ResourceTask),
    TableGroup(TableGroupTask),
    Flow(Flow),
}

/// Shared state of one execution.
pub(crate) struct RunContext<'a> {
    pub session: &'a Session,
    pub sample_rows: usize,
    pub observer: &'a dyn ExecutionObserver,
    pub metrics: &'a ExecutionMetrics,
    pub outcomes: Mutex<Vec<LeafOutcome>>,
}

impl RunContext<'_> {
    fn emit(&self, event: ExecutionEvent) {
        self.observer.on_event(&event);
    }

    fn record(&self, outcome: LeafOutcome) {
        let mut outcomes = lock(&self.outcomes);
        match outcomes.iter_mut().find(|o| o.key == outcome.key) {
            Some(existing) => *existing = outcome,
            None => outcomes.push(outcome),
        }
    }

    /// Mark every leaf below `node` failed; with `keep_failures`, earlier failures stay.
    fn fail_subtree(&self, node: &TaskNode, error: &IngestError, keep_failures: bool) {
        let mut leaves = Vec::new();
        node.collect_leaves(&mut leaves);
        for (key, target) in leaves {
            if keep_failures
                && lock(&self.outcomes)
                    .iter()
                    .any(|o| o.key == key && !o.is_ok())
            {
                continue;
            }
            self.record(LeafOutcome::failed(key, target, error));
        }
    }
}

impl TaskNode {
    fn flow(children: Vec<TaskNode>, pool: Option<ThreadPool>) -> Self {
        Self::Flow(Flow { children, pool })
    }

    fn collect_leaves(&self, out: &mut Vec<(String, String)>) {
        match self {
            Self::Execute(t) => out.push((t.key.clone(), t.target.clone())),
            Self::Resource(t) => t.child.collect_leaves(out),
            Self::TableGroup(t) => t.child.collect_leaves(out),
            Self::Flow(f) => f.children.iter().for_each(|c| c.collect_leaves(out)),
        }
    }

    fn leaf_count(&self) -> usize {
        match self {
            Self::Execute(_) => 1,
            Self::Resource(t) => t.child.leaf_count(),
            Self::TableGroup(t) => t.child.leaf_count(),
            Self::Flow(f) => f.children.iter().map(TaskNode::leaf_count).sum(),
        }
    }

    fn retain(&self, session: &Session) {
        match self {
            Self::Execute(_) => {}
            Self::Resource(t) => {
                if let Err(e) = session.retain(&t.url, t.uses) {
                    warn!(url = %t.url, error = %e, "cannot register resource users");
                }
                t.child.retain(session);
            }
            Self::TableGroup(t) => t.child.retain(session),
            Self::Flow(f) => f.children.iter().for_each(|c| c.retain(session)),
        }
    }

    /// Run the subtree; returns whether any leaf below wrote successfully.
    fn run(&self, ctx: &RunContext<'_>) -> bool {
        match self {
            Self::Execute(t) => t.run(ctx),
            Self::Resource(t) => t.run(self, ctx),
            Self::TableGroup(t) => t.run(self, ctx),
            Self::Flow(f) => match &f.pool {
                None => f.children.iter().map(|c| c.run(ctx)).fold(false, |acc, w| acc | w),
                Some(pool) => pool
                    .install(|| f.children.par_iter().map(|c| c.run(ctx)).collect::<Vec<bool>>())
                    .into_iter()
                    .any(|w| w),
            },
        }
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = depth * 2;
        match self {
            Self::Execute(t) => {
                let policy = lock(&t.leaf).target.if_exists;
                writeln!(f, "{:pad$}execute {} -> {} ({policy:?})", "", t.key, t.target)
            }
            Self::Resource(t) => {
                let role = match t.role {
                    ResourceRole::Source => "source",
                    ResourceRole::Target => "target",
                };
                let replace = if t.replace { ", replace" } else { "" };
                writeln!(f, "{:pad$}{role} {} [{}{replace}, {} leaves]", "", t.url, t.kind, t.uses)?;
                t.child.fmt_node(f, depth + 1)
            }
            Self::TableGroup(t) => {
                writeln!(f, "{:pad$}table {}", "", t.table)?;
                t.child.fmt_node(f, depth + 1)
            }
            Self::Flow(flow) => {
                match &flow.pool {
                    None => writeln!(f, "{:pad$}flow (serial)", "")?,
                    Some(pool) => writeln!(f, "{:pad$}flow (parallel x{})", "", pool.current_num_threads())?,
                }
                flow.children.iter().try_for_each(|c| c.fmt_node(f, depth + 1))
            }
        }
    }
}

impl ExecuteTask {
    fn run(&self, ctx: &RunContext<'_>) -> bool {
        let mut leaf = lock(&self.leaf);
        ctx.metrics.on_leaf_start();
        ctx.emit(ExecutionEvent::LeafStarted { key: self.key.clone() });
        match ingest::ingest(&mut leaf, ctx.session, ctx.sample_rows) {
            Ok(rows) => {
                ctx.metrics.on_leaf_end(Some(rows));
                ctx.emit(ExecutionEvent::LeafFinished {
                    key: self.key.clone(),
                    rows,
                });
                ctx.record(LeafOutcome::succeeded(self.key.clone(), self.target.clone(), rows));
                true
            }
            Err(e) => {
                ctx.metrics.on_leaf_end(None);
                ctx.emit(ExecutionEvent::LeafFailed {
                    key: self.key.clone(),
                    error: e.to_string(),
                });
                ctx.record(LeafOutcome::failed(self.key.clone(), self.target.clone(), &e));
                false
            }
        }
    }
}

impl TableGroupTask {
    fn run(&self, node: &TaskNode, ctx: &RunContext<'_>) -> bool {
        match ingest::build(&self.first, ctx.session, ctx.sample_rows) {
            Ok(built) => {
                if built {
                    ctx.metrics.on_build(true);
                    ctx.emit(ExecutionEvent::TableBuilt {
                        url: self.url.clone(),
                        table: self.table.clone(),
                    });
                }
                self.child.run(ctx)
            }
            Err(e) => {
                let leaves = node.leaf_count();
                ctx.metrics.on_build(false);
                ctx.metrics.on_leaves_skipped(leaves);
                ctx.emit(ExecutionEvent::BuildFailed {
                    url: self.url.clone(),
                    table: self.table.clone(),
                    leaves,
                    error: e.to_string(),
                });
                ctx.fail_subtree(node, &e, false);
                false
            }
        }
    }
}

impl ResourceTask {
    fn run(&self, node: &TaskNode, ctx: &RunContext<'_>) -> bool {
        let wrote = match ctx.session.open(&self.url, self.kind, self.replace) {
            Err(e) => {
                ctx.metrics.on_leaves_skipped(self.uses);
                error!(url = %self.url, role = ?self.role, error = %e, "cannot open resource; skipping its leaves");
                ctx.fail_subtree(node, &e, false);
                false
            }
            Ok(container) => {
                ctx.emit(ExecutionEvent::ResourceOpened {
                    url: self.url.clone(),
                    role: self.role,
                });
                let wrote = self.child.run(ctx);
                if self.role == ResourceRole::Target {
                    if wrote {
                        match container.persist() {
                            Ok(()) => {
                                ctx.metrics.on_persist();
                                ctx.emit(ExecutionEvent::Persisted { url: self.url.clone() });
                            }
                            Err(IngestError::EmptyWrite { table }) => {
                                ctx.emit(ExecutionEvent::PersistSkipped {
                                    url: self.url.clone(),
                                    reason: format!("only build writes for '{table}'"),
                                });
                            }
                            Err(e) => {
                                ctx.emit(ExecutionEvent::PersistFailed {
                                    url: self.url.clone(),
                                    error: e.to_string(),
                                });
                                ctx.fail_subtree(node, &e, true);
                            }
                        }
                    } else {
                        ctx.emit(ExecutionEvent::PersistSkipped {
                            url: self.url.clone(),
                            reason: "nothing was written".to_string(),
                        });
                    }
                }
                wrote
            }
        };
        if let Err(e) = ctx.session.release(&self.url, self.uses) {
            warn!(url = %self.url, error = %e, "cannot release resource");
        }
        ctx.emit(ExecutionEvent::ResourceReleased {
            url: self.url.clone(),
            role: self.role,
        });
        wrote
    }
}

/// An executable plan.
pub struct TaskFlow {
    root: TaskNode,
}

/// Group items by key, keeping first-appearance order of keys and items.
fn group_by<T, K: PartialEq>(items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<(K, Vec<T>)> {
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();
    for item in items {
        let k = key(&item);
        match groups.iter_mut().find(|(g, _)| *g == k) {
            Some((_, members)) => members.push(item),
            None => groups.push((k, vec![item])),
        }
    }
    groups
}

struct TargetGroup {
    url: String,
    kind: BackendKind,
    tables: Vec<(String, Vec<LeafJob>)>,
    /// Some table reads another table of this target.
    staged: bool,
}

impl TargetGroup {
    fn leaves(&self) -> impl Iterator<Item = &LeafJob> {
        self.tables.iter().flat_map(|(_, leaves)| leaves.iter())
    }
}

type TableRef = (String, String);

/// Topological order of items where an item runs after every other item producing a table it
/// consumes. Returns the order and whether any such dependency exists, or the items caught in
/// a cycle.
fn dependency_order(
    produced: &[HashSet<TableRef>],
    consumed: &[HashSet<TableRef>],
) -> Result<(Vec<usize>, bool), Vec<usize>> {
    let n = produced.len();
    let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for (j, dep) in deps.iter_mut().enumerate() {
        for (i, out) in produced.iter().enumerate() {
            if i != j && !out.is_disjoint(&consumed[j]) {
                dep.insert(i);
            }
        }
    }
    let staged = deps.iter().any(|d| !d.is_empty());

    let mut order = Vec::with_capacity(n);
    let mut done = vec![false; n];
    while order.len() < n {
        let next = (0..n).find(|&j| !done[j] && deps[j].iter().all(|&i| done[i]));
        let Some(j) = next else {
            return Err((0..n).filter(|&j| !done[j]).collect());
        };
        done[j] = true;
        order.push(j);
    }
    Ok((order, staged))
}

fn consumed_by<'a>(leaves: impl Iterator<Item = &'a LeafJob>, resolve: &impl Fn(&str) -> String) -> HashSet<TableRef> {
    leaves.map(|l| (resolve(l.source_url()), l.name.clone())).collect()
}

/// Order target groups so that a group reading a table another group writes runs after it.
fn staging_order(groups: &[TargetGroup], session: &Session) -> IngestResult<Vec<usize>> {
    let resolve = |url: &str| session.resolve(url).unwrap_or_else(|_| url.to_string());
    let produced: Vec<HashSet<TableRef>> = groups
        .iter()
        .map(|g| g.tables.iter().map(|(t, _)| (resolve(&g.url), t.clone())).collect())
        .collect();
    let consumed: Vec<HashSet<TableRef>> = groups.iter().map(|g| consumed_by(g.leaves(), &resolve)).collect();

    dependency_order(&produced, &consumed).map(|(order, _)| order).map_err(|stuck| {
        let urls: Vec<&str> = stuck.iter().map(|&j| groups[j].url.as_str()).collect();
        IngestError::config(format!("circular staging between targets {urls:?}"))
    })
}

/// Order the tables of one target the same way, for tables staged through the target itself.
///
/// Returns whether any table reads another one of the group.
fn stage_tables(group: &mut TargetGroup, session: &Session) -> IngestResult<bool> {
    let resolve = |url: &str| session.resolve(url).unwrap_or_else(|_| url.to_string());
    let url = resolve(&group.url);
    let produced: Vec<HashSet<TableRef>> = group
        .tables
        .iter()
        .map(|(t, _)| HashSet::from([(url.clone(), t.clone())]))
        .collect();
    let consumed: Vec<HashSet<TableRef>> = group
        .tables
        .iter()
        .map(|(_, leaves)| consumed_by(leaves.iter(), &resolve))
        .collect();

    let (order, staged) = dependency_order(&produced, &consumed).map_err(|stuck| {
        let tables: Vec<&str> = stuck.iter().map(|&j| group.tables[j].0.as_str()).collect();
        IngestError::config(format!("circular staging between tables {tables:?} of {}", group.url))
    })?;
    let mut slots: Vec<Option<(String, Vec<LeafJob>)>> = group.tables.drain(..).map(Some).collect();
    group.tables = order.into_iter().filter_map(|i| slots[i].take()).collect();
    Ok(staged)
}

fn worker_pool(threads: usize, tasks: usize) -> IngestResult<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads.min(tasks).max(1))
        .thread_name(|i| format!("ingest-{i}"))
        .build()
        .map_err(|e| IngestError::config(format!("cannot build worker pool: {e}")))
}

impl TaskFlow {
    /// Group `leaves` by target container, target table and source container.
    ///
    /// Every leaf after the first of a table is forced to `append`. Table groups of a target
    /// run on a pool of `num_threads` workers when all their leaves set `load_parallel` and
    /// none of them reads another; otherwise they run serially in staging order.
    pub fn build(leaves: Vec<LeafJob>, session: &Session, num_threads: usize) -> IngestResult<Self> {
        let mut keyed = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            keyed.push((session.resolve(&leaf.target_url())?, leaf));
        }

        let mut groups = Vec::new();
        for (_, members) in group_by(keyed, |(k, _)| k.clone()) {
            let members: Vec<LeafJob> = members.into_iter().map(|(_, l)| l).collect();
            let Some(first) = members.first() else {
                continue;
            };
            let (url, kind) = (first.target_url(), first.target_kind());
            let mut tables = group_by(members, LeafJob::target_table);
            for (_, leaves) in &mut tables {
                for leaf in leaves.iter_mut().skip(1) {
                    leaf.target.if_exists = IfExists::Append;
                }
            }
            let mut group = TargetGroup {
                url,
                kind,
                tables,
                staged: false,
            };
            group.staged = stage_tables(&mut group, session)?;
            groups.push(group);
        }

        let order = staging_order(&groups, session)?;
        let mut slots: Vec<Option<TargetGroup>> = groups.into_iter().map(Some).collect();
        let mut targets = Vec::with_capacity(slots.len());
        for idx in order {
            if let Some(group) = slots[idx].take() {
                targets.push(Self::target_node(group, session, num_threads)?);
            }
        }
        Ok(Self {
            root: TaskNode::flow(targets, None),
        })
    }

    fn target_node(group: TargetGroup, session: &Session, num_threads: usize) -> IngestResult<TaskNode> {
        let replace = group
            .tables
            .iter()
            .filter_map(|(_, leaves)| leaves.first())
            .any(|l| l.target.if_exists.replaces_container());
        let parallel =
            !group.staged && group.tables.len() > 1 && group.leaves().all(|l| l.source.load_parallel);
        let table_count = group.tables.len();

        let mut tables = Vec::with_capacity(table_count);
        for (table, leaves) in group.tables {
            let Some(first) = leaves.first().cloned() else {
                continue;
            };
            let mut sources = Vec::new();
            let mut keyed = Vec::with_capacity(leaves.len());
            for leaf in leaves {
                keyed.push((session.resolve(leaf.source_url())?, leaf));
            }
            for (_, members) in group_by(keyed, |(k, _)| k.clone()) {
                let members: Vec<LeafJob> = members.into_iter().map(|(_, l)| l).collect();
                let Some(head) = members.first() else {
                    continue;
                };
                let (url, kind, uses) = (head.source_url().to_string(), head.source_kind(), members.len());
                let executes = members
                    .into_iter()
                    .map(|leaf| {
                        TaskNode::Execute(ExecuteTask {
                            key: leaf.key.clone(),
                            target: format!("{}::{}", leaf.target_url(), leaf.target_table()),
                            leaf: Mutex::new(leaf),
                        })
                    })
                    .collect();
                sources.push(TaskNode::Resource(ResourceTask {
                    url,
                    kind,
                    role: ResourceRole::Source,
                    replace: false,
                    uses,
                    child: Box::new(TaskNode::flow(executes, None)),
                }));
            }
            tables.push(TaskNode::TableGroup(TableGroupTask {
                url: group.url.clone(),
                table,
                first,
                child: Box::new(TaskNode::flow(sources, None)),
            }));
        }

        let pool = if parallel {
            Some(worker_pool(num_threads, table_count)?)
        } else {
            None
        };
        let child = TaskNode::flow(tables, pool);
        debug!(url = %group.url, leaves = child.leaf_count(), parallel, "target group");
        Ok(TaskNode::Resource(ResourceTask {
            uses: child.leaf_count(),
            url: group.url,
            kind: group.kind,
            role: ResourceRole::Target,
            replace,
            child: Box::new(child),
        }))
    }

    pub fn leaf_count(&self) -> usize {
        self.root.leaf_count()
    }

    /// Snapshot of the leaf jobs, in execution order.
    pub fn leaves(&self) -> Vec<LeafJob> {
        fn walk(node: &TaskNode, out: &mut Vec<LeafJob>) {
            match node {
                TaskNode::Execute(t) => out.push(lock(&t.leaf).clone()),
                TaskNode::Resource(t) => walk(&t.child, out),
                TaskNode::TableGroup(t) => walk(&t.child, out),
                TaskNode::Flow(f) => f.children.iter().for_each(|c| walk(c, out)),
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out
    }

    /// Run the flow; every resource is registered for all its users up front.
    pub(crate) fn run(&self, ctx: &RunContext<'_>) {
        self.root.retain(ctx.session);
        self.root.run(ctx);
    }
}

impl fmt::Display for TaskFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt_node(f, 0)
    }
}

impl fmt::Debug for TaskFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFlow")
            .field("leaves", &self.leaf_count())
            .finish()
    }
}

/// Outcome kinds that make a run unsuccessful.
pub(crate) fn is_fatal(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Build | ErrorKind::Consistency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_by_keeps_first_appearance_order() {
        let groups = group_by(vec![("b", 1), ("a", 2), ("b", 3)], |(k, _)| *k);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "b");
        assert_eq!(groups[0].1, vec![("b", 1), ("b", 3)]);
        assert_eq!(groups[1].1, vec![("a", 2)]);
    }

    fn refs(items: &[&str]) -> HashSet<TableRef> {
        items.iter().map(|t| ("memory://".to_string(), t.to_string())).collect()
    }

    #[test]
    fn readers_follow_their_producers_and_cycles_are_reported() {
        let produced = [refs(&["final"]), refs(&["stage"])];
        let consumed = [refs(&["stage"]), refs(&["data"])];
        assert_eq!(dependency_order(&produced, &consumed), Ok((vec![1, 0], true)));

        let independent = [refs(&["a"]), refs(&["b"])];
        assert_eq!(dependency_order(&independent, &independent), Ok((vec![0, 1], false)));

        let consumed = [refs(&["stage"]), refs(&["final"])];
        assert_eq!(dependency_order(&produced, &consumed), Err(vec![0, 1]));
    }
}
