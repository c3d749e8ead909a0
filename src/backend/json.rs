//! JSON backend.
//!
//! Supported inputs:
//! - A JSON array of objects: `[{"a":1}, {"a":2}]`
//! - Newline-delimited JSON (NDJSON): `{"a":1}\n{"a":2}\n`
//!
//! Nested objects are flattened into dot-path columns (e.g. `user.name`). Output is always a
//! JSON array of flat objects.

use std::fs;
use std::path::Path;

use serde_json::Map;

use crate::config::ReadOptions;
use crate::error::{IngestError, IngestResult};
use crate::types::{DataSet, DataType, Field, Schema, Value};

pub fn read(path: &Path, options: &ReadOptions, nrows: Option<usize>) -> IngestResult<DataSet> {
    let text = fs::read_to_string(path)?;
    let mut ds = read_str(&text)?;
    if let Some(n) = nrows {
        ds.rows.truncate(n);
    }
    if !options.dtypes.is_empty() {
        ds = crate::transform::reshape::cast(&ds, &options.dtypes)?;
    }
    Ok(ds)
}

/// Parse JSON text into a [`DataSet`]; column order follows first appearance.
pub fn read_str(input: &str) -> IngestResult<DataSet> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(DataSet::default());
    }

    let values = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(v @ serde_json::Value::Object(_)) => vec![v],
        Ok(_) => {
            return Err(IngestError::SchemaMismatch {
                message: "json must be an object, an array of objects, or NDJSON".to_string(),
            });
        }
        Err(_) => {
            // Fall back to NDJSON.
            let mut values = Vec::new();
            for (i, line) in trimmed.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let v = serde_json::from_str::<serde_json::Value>(line).map_err(|e| {
                    IngestError::SchemaMismatch {
                        message: format!("invalid ndjson at line {}: {}", i + 1, e),
                    }
                })?;
                values.push(v);
            }
            values
        }
    };

    let mut flat_rows = Vec::with_capacity(values.len());
    for (idx0, v) in values.iter().enumerate() {
        let obj = v.as_object().ok_or_else(|| IngestError::SchemaMismatch {
            message: format!("row {} is not a json object", idx0 + 1),
        })?;
        let mut flat = Vec::new();
        flatten("", obj, &mut flat);
        flat_rows.push(flat);
    }

    let mut names: Vec<String> = Vec::new();
    for row in &flat_rows {
        for (k, _) in row {
            if !names.contains(k) {
                names.push(k.clone());
            }
        }
    }

    let mut types = vec![DataType::Null; names.len()];
    let rows: Vec<Vec<Value>> = flat_rows
        .into_iter()
        .map(|row| {
            let mut out = vec![Value::Null; names.len()];
            for (k, jv) in row {
                if let Some(i) = names.iter().position(|n| *n == k) {
                    let v = Value::from_json(&jv);
                    types[i] = types[i].unify(v.data_type());
                    out[i] = v;
                }
            }
            out
        })
        .collect();

    let schema = Schema::new(
        names
            .into_iter()
            .zip(types)
            .map(|(n, t)| Field::new(n, t))
            .collect(),
    );
    Ok(DataSet::new(schema.clone(), rows).align_to(&schema))
}

fn flatten(prefix: &str, obj: &Map<String, serde_json::Value>, out: &mut Vec<(String, serde_json::Value)>) {
    for (k, v) in obj {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            serde_json::Value::Object(inner) => flatten(&key, inner, out),
            other => out.push((key, other.clone())),
        }
    }
}

pub fn write(path: &Path, data: &DataSet) -> IngestResult<()> {
    let items: Vec<serde_json::Value> = data
        .rows
        .iter()
        .map(|row| {
            let obj: Map<String, serde_json::Value> = data
                .schema
                .field_names()
                .zip(row)
                .map(|(k, v)| (k.to_string(), v.to_json()))
                .collect();
            serde_json::Value::Object(obj)
        })
        .collect();
    fs::write(path, serde_json::to_string_pretty(&items)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_nested_objects_and_unifies_types() {
        let ds = read_str(r#"[{"id": 1, "user": {"name": "a"}}, {"id": 2.5, "extra": true}]"#).unwrap();
        assert_eq!(ds.column_names(), vec!["id", "user.name", "extra"]);
        assert_eq!(ds.schema.fields[0].data_type, DataType::Float64);
        assert_eq!(ds.rows[0][0], Value::Float64(1.0));
        assert_eq!(ds.rows[0][2], Value::Null);
    }

    #[test]
    fn accepts_ndjson() {
        let ds = read_str("{\"a\":1}\n\n{\"a\":2}\n").unwrap();
        assert_eq!(ds.row_count(), 2);
        assert_eq!(ds.schema.fields[0].data_type, DataType::Int64);
    }

    #[test]
    fn rejects_scalars() {
        assert!(read_str("3").is_err());
    }
}
