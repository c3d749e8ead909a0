//! SQL over a frame: the data is loaded into an in-memory SQLite database as table `df`.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::backend::{resolve_path, sql};
use crate::config::QuerySource;
use crate::error::{IngestError, IngestResult};
use crate::types::DataSet;

/// Name the frame is exposed under.
pub const FRAME_TABLE: &str = "df";

/// Script text; file paths are resolved against `base_dir`.
pub fn script(source: &QuerySource, base_dir: &Path) -> IngestResult<String> {
    match source {
        QuerySource::Text(text) => Ok(text.clone()),
        QuerySource::File { path } => {
            let path = resolve_path(base_dir, Path::new(path));
            fs::read_to_string(&path).map_err(|e| {
                IngestError::transform(format!("cannot read query '{}': {e}", path.display()))
            })
        }
    }
}

pub fn run(ds: &DataSet, source: &QuerySource, base_dir: &Path) -> IngestResult<DataSet> {
    let text = script(source, base_dir)?;
    let conn = sql::open(None)?;
    sql::load(&conn, FRAME_TABLE, ds)?;
    debug!(rows = ds.row_count(), "running query transform");
    sql::query(&conn, &text).map_err(|e| match e {
        IngestError::Sql(err) => IngestError::transform(format!("query failed: {err}")),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Field, Schema, Value};

    #[test]
    fn query_sees_the_frame_as_df() {
        let ds = DataSet::new(
            Schema::new(vec![Field::new("g", DataType::Utf8), Field::new("n", DataType::Int64)]),
            vec![
                vec![Value::Utf8("a".into()), Value::Int64(1)],
                vec![Value::Utf8("a".into()), Value::Int64(2)],
                vec![Value::Utf8("b".into()), Value::Int64(5)],
            ],
        );
        let q = QuerySource::Text("select g, sum(n) as total from df group by g order by g".into());
        let out = run(&ds, &q, Path::new(".")).unwrap();
        assert_eq!(out.column_names(), vec!["g", "total"]);
        assert_eq!(out.rows[0], vec![Value::Utf8("a".into()), Value::Int64(3)]);
        assert_eq!(out.rows[1], vec![Value::Utf8("b".into()), Value::Int64(5)]);
    }

    #[test]
    fn scripts_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("q.sql"), "select 1 as one").unwrap();
        let q = QuerySource::File { path: "q.sql".into() };
        assert_eq!(script(&q, dir.path()).unwrap(), "select 1 as one");
        let missing = QuerySource::File { path: "nope.sql".into() };
        assert!(script(&missing, dir.path()).is_err());
    }
}
