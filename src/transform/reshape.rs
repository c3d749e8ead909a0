//! Shape-changing transforms: pivot, melt, dynamic stack, cast and constant columns.

use std::collections::{BTreeMap, HashMap};

use crate::backend::infer::{self, HEADER_LEVEL_SEP};
use crate::error::{IngestError, IngestResult};
use crate::types::{DataSet, DataType, Field, Schema, Value};

fn column_index(ds: &DataSet, name: &str) -> IngestResult<usize> {
    ds.schema.index_of(name).ok_or_else(|| IngestError::SchemaMismatch {
        message: format!("column '{name}' not found (columns: {:?})", ds.column_names()),
    })
}

fn cell(row: &[Value], idx: usize) -> Value {
    row.get(idx).cloned().unwrap_or(Value::Null)
}

/// Long to wide: one row per distinct `index` tuple, one column per distinct `columns` value.
///
/// Duplicate (index, column) pairs are an error.
pub fn pivot(ds: &DataSet, index: &[String], columns: &str, values: &str) -> IngestResult<DataSet> {
    let index_idx: Vec<usize> = index.iter().map(|c| column_index(ds, c)).collect::<IngestResult<_>>()?;
    let col_idx = column_index(ds, columns)?;
    let val_idx = column_index(ds, values)?;

    let mut new_columns: Vec<Value> = Vec::new();
    let mut column_pos: HashMap<String, usize> = HashMap::new();
    for row in &ds.rows {
        let v = cell(row, col_idx);
        column_pos.entry(v.group_key()).or_insert_with(|| {
            new_columns.push(v.clone());
            new_columns.len() - 1
        });
    }

    let mut keys: Vec<Vec<Value>> = Vec::new();
    let mut key_pos: HashMap<Vec<String>, usize> = HashMap::new();
    let mut cells: Vec<Vec<Option<Value>>> = Vec::new();
    for row in &ds.rows {
        let key: Vec<Value> = index_idx.iter().map(|&i| cell(row, i)).collect();
        let group: Vec<String> = key.iter().map(Value::group_key).collect();
        let pos = *key_pos.entry(group).or_insert_with(|| {
            keys.push(key);
            cells.push(vec![None; new_columns.len()]);
            keys.len() - 1
        });
        let c = column_pos[&cell(row, col_idx).group_key()];
        let slot = &mut cells[pos][c];
        if slot.is_some() {
            return Err(IngestError::transform(format!(
                "pivot: duplicate entry for column '{}' at index {:?}",
                cell(row, col_idx),
                keys[pos].iter().map(Value::to_string).collect::<Vec<_>>()
            )));
        }
        *slot = Some(cell(row, val_idx));
    }

    let value_type = ds.schema.fields[val_idx].data_type;
    let mut fields: Vec<Field> = index_idx.iter().map(|&i| ds.schema.fields[i].clone()).collect();
    fields.extend(new_columns.iter().map(|v| Field::new(v.to_string(), value_type)));
    let rows = keys
        .into_iter()
        .zip(cells)
        .map(|(mut key, values)| {
            key.extend(values.into_iter().map(|v| v.unwrap_or(Value::Null)));
            key
        })
        .collect();
    Ok(DataSet::new(Schema::new(fields), rows))
}

/// Wide to long: each `value_vars` column becomes a (`var_name`, `value_name`) row pair.
///
/// Without `value_vars` every non-id column is melted. Rows are ordered by variable, then by
/// input row.
pub fn melt(
    ds: &DataSet,
    id_vars: &[String],
    value_vars: Option<&[String]>,
    var_name: &str,
    value_name: &str,
) -> IngestResult<DataSet> {
    let id_idx: Vec<usize> = id_vars.iter().map(|c| column_index(ds, c)).collect::<IngestResult<_>>()?;
    let value_idx: Vec<usize> = match value_vars {
        Some(vars) => vars.iter().map(|c| column_index(ds, c)).collect::<IngestResult<_>>()?,
        None => (0..ds.schema.len()).filter(|i| !id_idx.contains(i)).collect(),
    };

    let value_type = value_idx
        .iter()
        .fold(DataType::Null, |acc, &i| acc.unify(ds.schema.fields[i].data_type));
    let mut fields: Vec<Field> = id_idx.iter().map(|&i| ds.schema.fields[i].clone()).collect();
    fields.push(Field::new(var_name, DataType::Utf8));
    fields.push(Field::new(value_name, value_type));
    let schema = Schema::new(fields);

    let mut rows = Vec::with_capacity(ds.row_count() * value_idx.len());
    for &vi in &value_idx {
        let var = Value::Utf8(ds.schema.fields[vi].name.clone());
        for row in &ds.rows {
            let mut out: Vec<Value> = id_idx.iter().map(|&i| cell(row, i)).collect();
            out.push(var.clone());
            out.push(cell(row, vi));
            rows.push(out);
        }
    }
    Ok(DataSet::new(schema.clone(), rows).align_to(&schema))
}

/// Convert one value; `None` when it cannot be represented in `to`.
fn cast_value(v: &Value, to: DataType) -> Option<Value> {
    let out = match (v, to) {
        (Value::Null, _) | (_, DataType::Null) => Value::Null,
        (v, to) if v.data_type() == to => v.clone(),
        (v, DataType::Utf8) => Value::Utf8(v.to_string()),
        (Value::Utf8(s), to) => infer::parse_cell(s, to)?,
        (Value::Int64(i), DataType::Float64) => Value::Float64(*i as f64),
        (Value::Float64(f), DataType::Int64) if f.fract() == 0.0 => Value::Int64(*f as i64),
        (Value::Bool(b), DataType::Int64) => Value::Int64(i64::from(*b)),
        (Value::Bool(b), DataType::Float64) => Value::Float64(if *b { 1.0 } else { 0.0 }),
        (Value::Int64(0), DataType::Bool) => Value::Bool(false),
        (Value::Int64(1), DataType::Bool) => Value::Bool(true),
        _ => return None,
    };
    Some(out)
}

/// Convert columns to the given types; a value that does not convert is an error.
pub fn cast(ds: &DataSet, dtypes: &BTreeMap<String, DataType>) -> IngestResult<DataSet> {
    let mut targets: Vec<(usize, DataType)> = Vec::with_capacity(dtypes.len());
    for (name, dt) in dtypes {
        targets.push((column_index(ds, name)?, *dt));
    }

    let mut out = ds.clone();
    for &(idx, dt) in &targets {
        out.schema.fields[idx].data_type = dt;
    }
    for (r, row) in out.rows.iter_mut().enumerate() {
        for &(idx, dt) in &targets {
            let Some(slot) = row.get_mut(idx) else {
                continue;
            };
            match cast_value(slot, dt) {
                Some(v) => *slot = v,
                None => {
                    return Err(IngestError::ParseError {
                        row: r + 1,
                        column: ds.schema.fields[idx].name.clone(),
                        raw: slot.to_string(),
                        message: format!("cannot cast to {dt}"),
                    });
                }
            }
        }
    }
    Ok(out)
}

/// Move one level of a multi-level header (`a|b|c`) into a column named `name`.
///
/// Fixed columns are kept as-is (matched by full name or first header level). Every other
/// column contributes its level value to `name` and the remaining levels to its output column;
/// one output row is produced per input row and distinct level value.
pub fn dynamic_stack(
    ds: &DataSet,
    fixed_columns: &[String],
    header_level: usize,
    name: &str,
) -> IngestResult<DataSet> {
    let mut fixed: Vec<(usize, String)> = Vec::new();
    // (input column, level value, remaining name)
    let mut stacked: Vec<(usize, String, String)> = Vec::new();
    for (idx, field) in ds.schema.fields.iter().enumerate() {
        let parts: Vec<&str> = field.name.split(HEADER_LEVEL_SEP).collect();
        if let Some(f) = fixed_columns
            .iter()
            .find(|f| **f == field.name || parts.first() == Some(&f.as_str()))
        {
            fixed.push((idx, f.clone()));
            continue;
        }
        if header_level >= parts.len() {
            return Err(IngestError::transform(format!(
                "dynamic_stack: column '{}' has no header level {header_level}",
                field.name
            )));
        }
        let level = parts[header_level].to_string();
        let rest: Vec<&str> = parts
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != header_level)
            .map(|(_, p)| *p)
            .collect();
        let rest = if rest.is_empty() { name.to_string() } else { rest.join(HEADER_LEVEL_SEP) };
        stacked.push((idx, level, rest));
    }

    let mut levels: Vec<String> = Vec::new();
    let mut outputs: Vec<String> = Vec::new();
    for (_, level, rest) in &stacked {
        if !levels.contains(level) {
            levels.push(level.clone());
        }
        if !outputs.contains(rest) {
            outputs.push(rest.clone());
        }
    }

    let mut fields: Vec<Field> = fixed
        .iter()
        .map(|(i, n)| Field::new(n.clone(), ds.schema.fields[*i].data_type))
        .collect();
    fields.push(Field::new(name, DataType::Utf8));
    for out in &outputs {
        let dt = stacked
            .iter()
            .filter(|(_, _, r)| r == out)
            .fold(DataType::Null, |acc, (i, _, _)| acc.unify(ds.schema.fields[*i].data_type));
        fields.push(Field::new(out.clone(), dt));
    }
    let schema = Schema::new(fields);

    let mut rows = Vec::with_capacity(ds.row_count() * levels.len());
    for row in &ds.rows {
        for level in &levels {
            let mut out: Vec<Value> = fixed.iter().map(|(i, _)| cell(row, *i)).collect();
            out.push(Value::Utf8(level.clone()));
            for name in &outputs {
                let v = stacked
                    .iter()
                    .find(|(_, l, r)| l == level && r == name)
                    .map(|(i, _, _)| cell(row, *i))
                    .unwrap_or(Value::Null);
                out.push(v);
            }
            rows.push(out);
        }
    }
    Ok(DataSet::new(schema.clone(), rows).align_to(&schema))
}

/// Add (or overwrite) constant columns.
pub fn add_columns(ds: DataSet, columns: &BTreeMap<String, serde_json::Value>) -> DataSet {
    columns
        .iter()
        .fold(ds, |acc, (name, v)| acc.with_constant_column(name, Value::from_json(v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::Utf8(v.to_string())
    }

    fn long() -> DataSet {
        DataSet::new(
            Schema::new(vec![
                Field::new("id", DataType::Int64),
                Field::new("k", DataType::Utf8),
                Field::new("v", DataType::Float64),
            ]),
            vec![
                vec![Value::Int64(1), s("x"), Value::Float64(1.0)],
                vec![Value::Int64(1), s("y"), Value::Float64(2.0)],
                vec![Value::Int64(2), s("x"), Value::Float64(3.0)],
            ],
        )
    }

    #[test]
    fn pivot_spreads_and_fills_nulls() {
        let out = pivot(&long(), &["id".to_string()], "k", "v").unwrap();
        assert_eq!(out.column_names(), vec!["id", "x", "y"]);
        assert_eq!(out.rows[0], vec![Value::Int64(1), Value::Float64(1.0), Value::Float64(2.0)]);
        assert_eq!(out.rows[1], vec![Value::Int64(2), Value::Float64(3.0), Value::Null]);
    }

    #[test]
    fn pivot_rejects_duplicates() {
        let mut ds = long();
        ds.rows.push(vec![Value::Int64(2), s("x"), Value::Float64(9.0)]);
        assert!(pivot(&ds, &["id".to_string()], "k", "v").is_err());
    }

    #[test]
    fn melt_inverts_pivot() {
        let wide = pivot(&long(), &["id".to_string()], "k", "v").unwrap();
        let out = melt(&wide, &["id".to_string()], None, "k", "v").unwrap();
        assert_eq!(out.column_names(), vec!["id", "k", "v"]);
        assert_eq!(out.row_count(), 4);
        assert_eq!(out.rows[0], vec![Value::Int64(1), s("x"), Value::Float64(1.0)]);
        assert_eq!(out.rows[2], vec![Value::Int64(1), s("y"), Value::Float64(2.0)]);
        assert_eq!(out.rows[3], vec![Value::Int64(2), s("y"), Value::Null]);
    }

    #[test]
    fn cast_converts_or_fails() {
        let mut dtypes = BTreeMap::new();
        dtypes.insert("id".to_string(), DataType::Utf8);
        dtypes.insert("v".to_string(), DataType::Int64);
        let out = cast(&long(), &dtypes).unwrap();
        assert_eq!(out.rows[0][0], s("1"));
        assert_eq!(out.rows[0][2], Value::Int64(1));

        let mut bad = BTreeMap::new();
        bad.insert("k".to_string(), DataType::Int64);
        assert!(matches!(cast(&long(), &bad), Err(IngestError::ParseError { .. })));
        bad.clear();
        bad.insert("missing".to_string(), DataType::Int64);
        assert!(matches!(cast(&long(), &bad), Err(IngestError::SchemaMismatch { .. })));
    }

    #[test]
    fn dynamic_stack_moves_a_header_level_into_rows() {
        let ds = DataSet::new(
            Schema::new(vec![
                Field::new("id", DataType::Int64),
                Field::new("2023|q1", DataType::Int64),
                Field::new("2023|q2", DataType::Int64),
                Field::new("2024|q1", DataType::Int64),
            ]),
            vec![vec![Value::Int64(1), Value::Int64(10), Value::Int64(20), Value::Int64(30)]],
        );
        let out = dynamic_stack(&ds, &["id".to_string()], 0, "year").unwrap();
        assert_eq!(out.column_names(), vec!["id", "year", "q1", "q2"]);
        assert_eq!(
            out.rows,
            vec![
                vec![Value::Int64(1), s("2023"), Value::Int64(10), Value::Int64(20)],
                vec![Value::Int64(1), s("2024"), Value::Int64(30), Value::Null],
            ]
        );
    }

    #[test]
    fn add_columns_sets_constants() {
        let mut cols = BTreeMap::new();
        cols.insert("src".to_string(), serde_json::json!("file.csv"));
        cols.insert("v".to_string(), serde_json::json!(0));
        let out = add_columns(long(), &cols);
        assert_eq!(out.column_names(), vec!["id", "k", "v", "src"]);
        assert_eq!(out.rows[2][2], Value::Int64(0));
        assert_eq!(out.rows[2][3], s("file.csv"));
    }
}
