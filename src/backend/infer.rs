//! Type inference and typed parsing for text-based backends.
//!
//! Text formats carry no column types, so each column is inferred from its non-empty cells:
//! all integers → `int64`, all numbers → `float64`, all `true`/`false` → `bool`, otherwise
//! `utf8`. A column without any non-empty cell is typed `null`.

use std::collections::BTreeMap;

use crate::error::{IngestError, IngestResult};
use crate::types::{DataSet, DataType, Field, Schema, Value};

/// Build a typed dataset from header names and raw string rows.
///
/// Types listed in `dtypes` are parsed strictly; the rest are inferred.
pub fn dataset_from_strings(
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    dtypes: &BTreeMap<String, DataType>,
) -> IngestResult<DataSet> {
    let width = headers.len();
    let mut fields = Vec::with_capacity(width);
    for (idx, name) in headers.iter().enumerate() {
        let data_type = match dtypes.get(name) {
            Some(dt) => *dt,
            None => infer_column(rows.iter().map(|r| r.get(idx).map(String::as_str).unwrap_or(""))),
        };
        fields.push(Field::new(name.clone(), data_type));
    }

    let mut out_rows = Vec::with_capacity(rows.len());
    for (row_idx0, raw_row) in rows.iter().enumerate() {
        // 1-based, +1 for the header row.
        let user_row = row_idx0 + 2;
        let mut row = Vec::with_capacity(width);
        for (idx, field) in fields.iter().enumerate() {
            let raw = raw_row.get(idx).map(String::as_str).unwrap_or("");
            row.push(parse_typed_value(user_row, &field.name, field.data_type, raw)?);
        }
        out_rows.push(row);
    }

    Ok(DataSet::new(Schema::new(fields), out_rows))
}

/// Infer the type of a column from its raw cells.
pub fn infer_column<'a>(cells: impl Iterator<Item = &'a str>) -> DataType {
    let mut current = DataType::Null;
    for cell in cells {
        let trimmed = cell.trim();
        if trimmed.is_empty() {
            continue;
        }
        current = current.unify(infer_cell(trimmed));
        if current == DataType::Utf8 {
            break;
        }
    }
    current
}

fn infer_cell(s: &str) -> DataType {
    if s.parse::<i64>().is_ok() {
        DataType::Int64
    } else if s.parse::<f64>().is_ok() {
        DataType::Float64
    } else if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") {
        DataType::Bool
    } else {
        DataType::Utf8
    }
}

/// Parse one cell into `data_type`; `None` when it does not parse.
pub fn parse_cell(raw: &str, data_type: DataType) -> Option<Value> {
    parse_typed_value(0, "", data_type, raw).ok()
}

pub(crate) fn parse_typed_value(
    row: usize,
    column: &str,
    data_type: DataType,
    raw: &str,
) -> IngestResult<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }

    match data_type {
        DataType::Utf8 => Ok(Value::Utf8(trimmed.to_owned())),
        DataType::Null => Ok(Value::Null),
        DataType::Int64 => trimmed.parse::<i64>().map(Value::Int64).map_err(|e| {
            IngestError::ParseError {
                row,
                column: column.to_owned(),
                raw: raw.to_owned(),
                message: e.to_string(),
            }
        }),
        DataType::Float64 => trimmed.parse::<f64>().map(Value::Float64).map_err(|e| {
            IngestError::ParseError {
                row,
                column: column.to_owned(),
                raw: raw.to_owned(),
                message: e.to_string(),
            }
        }),
        DataType::Bool => parse_bool(trimmed).map(Value::Bool).map_err(|message| {
            IngestError::ParseError {
                row,
                column: column.to_owned(),
                raw: raw.to_owned(),
                message,
            }
        }),
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => Ok(true),
        "false" | "f" | "0" | "no" | "n" => Ok(false),
        _ => Err("expected bool (true/false/1/0/yes/no)".to_string()),
    }
}

/// Collapse `header_rows` raw header lines into one name per column.
///
/// Blank cells in upper levels inherit the value to their left (merged header cells), then
/// the non-empty levels are joined with `|`. Blank names become `column_<n>`.
pub fn build_header(header_rows: &[Vec<String>], width: usize) -> Vec<String> {
    let mut levels: Vec<Vec<String>> = Vec::with_capacity(header_rows.len());
    let last = header_rows.len().saturating_sub(1);
    for (level_idx, row) in header_rows.iter().enumerate() {
        let mut filled = Vec::with_capacity(width);
        let mut carry = String::new();
        for col in 0..width {
            let cell = row.get(col).map(|s| s.trim().to_string()).unwrap_or_default();
            if cell.is_empty() && level_idx < last {
                filled.push(carry.clone());
            } else {
                carry = cell.clone();
                filled.push(cell);
            }
        }
        levels.push(filled);
    }

    (0..width)
        .map(|col| {
            let parts: Vec<&str> = levels
                .iter()
                .filter_map(|l| l.get(col).map(String::as_str))
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                format!("column_{col}")
            } else {
                parts.join(HEADER_LEVEL_SEP)
            }
        })
        .collect()
}

/// Separator between header levels in a flattened column name.
pub const HEADER_LEVEL_SEP: &str = "|";

/// Split raw records into header names and data rows according to the read options.
pub fn split_records(
    records: Vec<Vec<String>>,
    header: bool,
    header_rows: usize,
    skip_rows: usize,
    skip_footer: usize,
    names: &[String],
    nrows: Option<usize>,
) -> (Vec<String>, Vec<Vec<String>>) {
    let mut records: Vec<Vec<String>> = records.into_iter().skip(skip_rows).collect();
    let footer = skip_footer.min(records.len());
    records.truncate(records.len() - footer);

    let header_count = if header { header_rows.max(1).min(records.len()) } else { 0 };
    let data: Vec<Vec<String>> = records.split_off(header_count);
    let width = data
        .iter()
        .chain(records.iter())
        .map(Vec::len)
        .max()
        .unwrap_or(0)
        .max(names.len());

    let mut headers = if header_count > 0 {
        build_header(&records, width)
    } else {
        (0..width).map(|i| format!("column_{i}")).collect()
    };
    for (slot, name) in headers.iter_mut().zip(names) {
        *slot = name.clone();
    }

    let data = match nrows {
        Some(n) => data.into_iter().take(n).collect(),
        None => data,
    };
    (headers, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn infers_column_types() {
        assert_eq!(infer_column(["1", "2", ""].into_iter()), DataType::Int64);
        assert_eq!(infer_column(["1", "2.5"].into_iter()), DataType::Float64);
        assert_eq!(infer_column(["true", "FALSE"].into_iter()), DataType::Bool);
        assert_eq!(infer_column(["1", "x"].into_iter()), DataType::Utf8);
        assert_eq!(infer_column(["", " "].into_iter()), DataType::Null);
    }

    #[test]
    fn explicit_dtypes_are_strict() {
        let mut dtypes = BTreeMap::new();
        dtypes.insert("a".to_string(), DataType::Int64);
        let err = dataset_from_strings(strs(&["a"]), vec![strs(&["x"])], &dtypes).unwrap_err();
        assert!(err.to_string().contains("column 'a'"));
    }

    #[test]
    fn multi_level_headers_forward_fill() {
        let rows = vec![strs(&["id", "2023", "", "2024"]), strs(&["", "q1", "q2", "q1"])];
        assert_eq!(
            build_header(&rows, 4),
            strs(&["id", "2023|q1", "2023|q2", "2024|q1"])
        );
    }

    #[test]
    fn split_records_applies_skips_and_limit() {
        let records = vec![
            strs(&["title"]),
            strs(&["a", "b"]),
            strs(&["1", "2"]),
            strs(&["3", "4"]),
            strs(&["total"]),
        ];
        let (headers, data) = split_records(records, true, 1, 1, 1, &[], Some(1));
        assert_eq!(headers, strs(&["a", "b"]));
        assert_eq!(data, vec![strs(&["1", "2"])]);
    }
}
