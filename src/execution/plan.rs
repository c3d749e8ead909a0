//! Two-phase planning.
//!
//! Phase one expands the config tree into leaf jobs; a leaf whose pending transform chain
//! ends in `split` is a dynamic expansion marker. Phase two resolves every marker into
//! concrete leaves by reading the source, so scheduling only ever sees concrete jobs.

use tracing::{info, warn};

use crate::config::{ConfigTree, LeafJob, TransformOp, TransformStep};
use crate::error::{IngestError, IngestResult};
use crate::io::Session;
use crate::transform::{self, expr};
use crate::types::Value;

/// Expand `tree` and resolve every split into concrete leaves.
pub fn plan(tree: &mut ConfigTree, session: &Session) -> IngestResult<Vec<LeafJob>> {
    tree.expand(session)?;
    let leaves = tree.leaves()?;
    let mut out = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        if leaf.split_column().is_some() {
            out.extend(resolve_split(&leaf, session)?);
        } else {
            out.push(leaf);
        }
    }
    info!(leaves = out.len(), "plan resolved");
    Ok(out)
}

/// Text used as the target name of a split value.
fn split_name(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        v => v.to_string(),
    }
}

/// One leaf per distinct value of the split column.
///
/// Prior transforms are applied to a copy of the source to find the values; each resulting
/// leaf keeps them pending, marks the split executed and appends `column == value`.
pub fn resolve_split(leaf: &LeafJob, session: &Session) -> IngestResult<Vec<LeafJob>> {
    let Some(column) = leaf.split_column().map(str::to_string) else {
        return Ok(vec![leaf.clone()]);
    };
    let split_at = leaf
        .transform
        .iter()
        .rposition(|s| !s.executed && matches!(s.op, TransformOp::Split(_)))
        .ok_or_else(|| IngestError::transform(format!("no pending split in '{}'", leaf.key)))?;

    let source = session.open(leaf.source_url(), leaf.source_kind(), false)?;
    let data = source.read(&leaf.name, &leaf.source.options, leaf.source.limit, None)?;
    let mut prior: Vec<TransformStep> = leaf.transform[..split_at].to_vec();
    let data = transform::apply(data, &mut prior, &leaf.base_dir, false)?;

    let values = data.distinct_values(&column).ok_or_else(|| {
        IngestError::transform(format!(
            "split column '{column}' not found in '{}' (columns: {:?})",
            leaf.key,
            data.column_names()
        ))
    })?;
    if values.is_empty() {
        warn!(leaf = %leaf.key, %column, "split produced no leaves (source is empty)");
    }

    Ok(values
        .iter()
        .map(|value| {
            let name = split_name(value);
            let mut child = leaf.clone();
            child.key = format!("{}[{column}={name}]", leaf.key);
            child.target_name = name;
            child.transform[split_at].executed = true;
            child
                .transform
                .push(TransformOp::Filter(expr::equals(&column, value)).into());
            child
        })
        .collect())
}
