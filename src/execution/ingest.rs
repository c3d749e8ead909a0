//! Ingest of one leaf: consistency gate, table build and pull/transform/push.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::{Consistency, IfExists, LeafJob};
use crate::error::{IngestError, IngestResult};
use crate::io::{Container, Session};
use crate::transform;
use crate::types::{DataSet, DataType, Schema};

/// Rows pulled for consistency checks and build shapes.
pub const SAMPLE_ROWS: usize = 100;

fn source_container(leaf: &LeafJob, session: &Session) -> IngestResult<std::sync::Arc<Container>> {
    session.open(leaf.source_url(), leaf.source_kind(), false)
}

fn target_container(leaf: &LeafJob, session: &Session) -> IngestResult<std::sync::Arc<Container>> {
    session.open(&leaf.target_url(), leaf.target_kind(), false)
}

/// Source sample with the pending transforms applied to a copy.
fn transformed_sample(leaf: &LeafJob, source: &Container, sample_rows: usize) -> IngestResult<DataSet> {
    let sample = source.read(&leaf.name, &leaf.source.options, leaf.source.limit, Some(sample_rows))?;
    let mut steps = leaf.transform.clone();
    transform::apply(sample, &mut steps, &leaf.base_dir, false)
}

/// Column shape differences between a source and a target schema.
///
/// Target columns typed `null` carry no type information and are ignored for type checks; a
/// source type is compatible when it widens into the target type.
pub fn schema_differences(source: &Schema, target: &Schema) -> Vec<String> {
    let mut out = Vec::new();
    let src: BTreeMap<&str, DataType> = source.fields.iter().map(|f| (f.name.as_str(), f.data_type)).collect();
    let tgt: BTreeMap<&str, DataType> = target.fields.iter().map(|f| (f.name.as_str(), f.data_type)).collect();

    for name in src.keys().filter(|n| !tgt.contains_key(*n)) {
        out.push(format!("column '{name}' missing in target"));
    }
    for name in tgt.keys().filter(|n| !src.contains_key(*n)) {
        out.push(format!("column '{name}' missing in source"));
    }
    for (name, s) in &src {
        let Some(t) = tgt.get(name) else {
            continue;
        };
        if *s == DataType::Null || *t == DataType::Null {
            continue;
        }
        if s.unify(*t) != *t {
            out.push(format!("column '{name}' is {s} in source but {t} in target"));
        }
    }
    out
}

/// Compare a transformed source sample against the existing target table.
///
/// A missing target table passes.
pub fn check_consistency(leaf: &LeafJob, session: &Session, sample_rows: usize) -> IngestResult<()> {
    if leaf.target.consistency == Consistency::Ignore {
        return Ok(());
    }
    let target = target_container(leaf, session)?;
    let table = leaf.target_table();
    if !target.exists(&table)? {
        return Ok(());
    }
    let source = source_container(leaf, session)?;
    let sample = transformed_sample(leaf, &source, sample_rows)?;
    let existing = target.read(&table, &leaf.target.options.read_options(), None, Some(sample_rows))?;

    let diffs = schema_differences(&sample.schema, &existing.schema);
    if diffs.is_empty() {
        Ok(())
    } else {
        Err(IngestError::Consistency {
            table: format!("{}::{table}", target.url()),
            message: diffs.join("; "),
        })
    }
}

/// Create the target structure for a table before any of its writers run.
///
/// Returns whether a build write was queued. `fail` on an existing table is a
/// [`IngestError::Build`]; `append` onto an existing table needs no build; `truncate` keeps
/// the existing shape; everything else takes the shape of the transformed source sample.
pub fn build(leaf: &LeafJob, session: &Session, sample_rows: usize) -> IngestResult<bool> {
    let target = target_container(leaf, session)?;
    let table = leaf.target_table();
    let exists = target.exists(&table)?;
    let policy = leaf.target.if_exists;

    let shape = match (policy, exists) {
        (IfExists::Fail, true) => {
            return Err(IngestError::Build {
                table: format!("{}::{table}", target.url()),
                message: "table already exists and if_exists is 'fail'".to_string(),
            });
        }
        (IfExists::Append, true) => return Ok(false),
        (IfExists::Truncate, true) => target
            .read(&table, &leaf.target.options.read_options(), None, Some(sample_rows))?
            .empty_like(),
        _ => {
            let source = source_container(leaf, session)?;
            transformed_sample(leaf, &source, sample_rows)?.empty_like()
        }
    };
    debug!(url = %target.url(), %table, columns = shape.schema.len(), "building table");
    target.write(&table, shape, policy, &leaf.target.options, true)?;
    Ok(true)
}

/// Consistency check, then pull, transform (marking steps executed) and push.
///
/// Returns the number of rows queued for the target.
pub fn ingest(leaf: &mut LeafJob, session: &Session, sample_rows: usize) -> IngestResult<usize> {
    check_consistency(leaf, session, sample_rows)?;

    let source = source_container(leaf, session)?;
    let data = source.read(&leaf.name, &leaf.source.options, leaf.source.limit, None)?;
    let data = transform::apply(data, &mut leaf.transform, &leaf.base_dir, true)?;
    let rows = data.row_count();

    let target = target_container(leaf, session)?;
    target.write(
        &leaf.target_table(),
        data,
        leaf.target.if_exists,
        &leaf.target.options,
        false,
    )?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Field;

    #[test]
    fn differences_ignore_null_typed_and_widening_columns() {
        let src = Schema::new(vec![Field::new("a", DataType::Int64), Field::new("b", DataType::Utf8)]);
        let tgt = Schema::new(vec![Field::new("a", DataType::Float64), Field::new("b", DataType::Null)]);
        assert!(schema_differences(&src, &tgt).is_empty());

        let tgt = Schema::new(vec![Field::new("a", DataType::Bool), Field::new("c", DataType::Utf8)]);
        let diffs = schema_differences(&src, &tgt);
        assert_eq!(diffs.len(), 3);
    }
}
