//! Transform chain executed between source pull and target push.
//!
//! Steps run in order and each carries an `executed` marker, so a step that already ran
//! (during planning or an earlier pass) is never applied twice to the same leaf.
//!
//! - [`expr`]: row filter expressions
//! - [`reshape`]: pivot, melt, dynamic stack, cast and constant columns
//! - [`query`]: SQL scripts over the frame

pub mod expr;
pub mod query;
pub mod reshape;

use std::path::Path;

use tracing::debug;

use crate::config::{TransformOp, TransformStep};
use crate::error::{IngestError, IngestResult};
use crate::types::DataSet;

/// Apply one operation.
///
/// `split` is resolved while planning; reaching it here is an error.
pub fn apply_op(ds: DataSet, op: &TransformOp, base_dir: &Path) -> IngestResult<DataSet> {
    match op {
        TransformOp::Filter(e) => expr::filter(&ds, e),
        TransformOp::Query(q) => query::run(&ds, q, base_dir),
        TransformOp::Split(column) => Err(IngestError::transform(format!(
            "split on '{column}' must be resolved before execution"
        ))),
        TransformOp::Pivot {
            index,
            columns,
            values,
        } => reshape::pivot(&ds, &index.to_vec(), columns, values),
        TransformOp::Melt {
            id_vars,
            value_vars,
            var_name,
            value_name,
        } => {
            let value_vars = value_vars.as_ref().map(|v| v.to_vec());
            reshape::melt(&ds, &id_vars.to_vec(), value_vars.as_deref(), var_name, value_name)
        }
        TransformOp::Cast(dtypes) => reshape::cast(&ds, dtypes),
        TransformOp::DynamicStack {
            fixed_columns,
            header_level,
            name,
        } => reshape::dynamic_stack(&ds, &fixed_columns.to_vec(), *header_level, name),
        TransformOp::AddColumns(columns) => Ok(reshape::add_columns(ds, columns)),
    }
}

/// Run every pending step of `steps` on `ds`.
///
/// With `mark`, applied steps are flagged as executed; without it the chain is left untouched
/// (used for trial runs on samples).
pub fn apply(
    mut ds: DataSet,
    steps: &mut [TransformStep],
    base_dir: &Path,
    mark: bool,
) -> IngestResult<DataSet> {
    for step in steps.iter_mut().filter(|s| !s.executed) {
        debug!(op = ?step.op, rows = ds.row_count(), "applying transform");
        ds = apply_op(ds, &step.op, base_dir)?;
        if mark {
            step.executed = true;
        }
    }
    Ok(ds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Field, Schema, Value};

    fn sample() -> DataSet {
        DataSet::new(
            Schema::new(vec![Field::new("g", DataType::Utf8), Field::new("n", DataType::Int64)]),
            vec![
                vec![Value::Utf8("t1".into()), Value::Int64(1)],
                vec![Value::Utf8("t2".into()), Value::Int64(2)],
            ],
        )
    }

    #[test]
    fn steps_run_once_when_marked() {
        let mut steps: Vec<TransformStep> = vec![
            TransformOp::Filter("n > 1".into()).into(),
            TransformOp::AddColumns([("k".to_string(), serde_json::json!(1))].into_iter().collect()).into(),
        ];
        let trial = apply(sample(), &mut steps, Path::new("."), false).unwrap();
        assert_eq!(trial.row_count(), 1);
        assert!(steps.iter().all(|s| !s.executed));

        let out = apply(sample(), &mut steps, Path::new("."), true).unwrap();
        assert_eq!(out.column_names(), vec!["g", "n", "k"]);
        assert!(steps.iter().all(|s| s.executed));

        let again = apply(sample(), &mut steps, Path::new("."), true).unwrap();
        assert_eq!(again, sample());
    }

    #[test]
    fn pending_split_is_an_error() {
        let mut steps: Vec<TransformStep> = vec![TransformOp::Split("g".into()).into()];
        let err = apply(sample(), &mut steps, Path::new("."), true).unwrap_err();
        assert!(matches!(err, IngestError::Transform { .. }));
    }
}
