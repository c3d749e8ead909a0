//! Fixed-width text backend.
//!
//! Columns are cut by `widths` (in characters); cells are trimmed before typing.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::config::{ReadOptions, WriteOptions};
use crate::error::{IngestError, IngestResult};
use crate::types::DataSet;

use super::infer;

/// Split one line into cells of the given widths.
pub fn split_line(line: &str, widths: &[usize]) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut out = Vec::with_capacity(widths.len());
    let mut start = 0;
    for &w in widths {
        let end = (start + w).min(chars.len());
        let cell: String = chars.get(start..end).map(|c| c.iter().collect()).unwrap_or_default();
        out.push(cell.trim().to_string());
        start = end;
    }
    out
}

pub fn read(path: &Path, options: &ReadOptions, nrows: Option<usize>) -> IngestResult<DataSet> {
    if options.widths.is_empty() {
        return Err(IngestError::config(format!(
            "fixed-width source '{}' needs `options.widths`",
            path.display()
        )));
    }
    let text = fs::read_to_string(path)?;
    let records: Vec<Vec<String>> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| split_line(l, &options.widths))
        .collect();

    let (headers, rows) = infer::split_records(
        records,
        options.header,
        options.header_rows,
        options.skip_rows,
        options.skip_footer,
        &options.names,
        nrows,
    );
    infer::dataset_from_strings(headers, rows, &options.dtypes)
}

pub fn write(path: &Path, data: &DataSet, options: &WriteOptions) -> IngestResult<()> {
    let widths: Vec<usize> = if options.widths.is_empty() {
        // Widest rendered cell per column, plus one space of padding.
        (0..data.schema.len())
            .map(|i| {
                let header = data.schema.fields[i].name.chars().count();
                data.rows
                    .iter()
                    .map(|r| r.get(i).map(|v| v.to_string().chars().count()).unwrap_or(0))
                    .chain(std::iter::once(header))
                    .max()
                    .unwrap_or(0)
                    + 1
            })
            .collect()
    } else {
        options.widths.clone()
    };

    let mut out = String::new();
    if options.header {
        push_line(&mut out, data.schema.field_names().map(str::to_string), &widths);
    }
    for row in &data.rows {
        push_line(&mut out, row.iter().map(|v| v.to_string()), &widths);
    }
    fs::write(path, out)?;
    Ok(())
}

fn push_line(out: &mut String, cells: impl Iterator<Item = String>, widths: &[usize]) {
    let mut line = String::new();
    for (cell, &w) in cells.zip(widths) {
        let cell: String = cell.chars().take(w).collect();
        let _ = write!(line, "{cell:<w$}");
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn splits_by_character_widths() {
        assert_eq!(split_line("ab  12 x", &[4, 3, 5]), vec!["ab", "12", "x"]);
        assert_eq!(split_line("ab", &[4, 3]), vec!["ab", ""]);
    }

    #[test]
    fn round_trips_through_explicit_widths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, "id  name\n1   ann\n22  bob\n").unwrap();
        let opts = ReadOptions {
            widths: vec![4, 4],
            ..ReadOptions::default()
        };
        let ds = read(&path, &opts, None).unwrap();
        assert_eq!(ds.column_names(), vec!["id", "name"]);
        assert_eq!(ds.rows[1], vec![Value::Int64(22), Value::Utf8("bob".to_string())]);

        let out = dir.path().join("o.txt");
        let wopts = WriteOptions {
            widths: vec![4, 4],
            ..WriteOptions::default()
        };
        write(&out, &ds, &wopts).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "id  name\n1   ann\n22  bob\n");
    }
}
