//! CSV / TSV backend.

use std::path::Path;

use crate::config::{ReadOptions, WriteOptions};
use crate::error::IngestResult;
use crate::types::DataSet;

use super::infer;

fn delimiter(option: Option<char>, default: u8) -> u8 {
    option
        .and_then(|c| u8::try_from(u32::from(c)).ok())
        .unwrap_or(default)
}

/// Read a delimited file into a [`DataSet`].
///
/// Rules:
///
/// - `skip_rows` lines are dropped before the header, `skip_footer` lines from the end.
/// - `header_rows > 1` produces flattened `level0|level1` column names.
/// - Column types come from `dtypes` when given, otherwise they are inferred.
pub fn read(
    path: &Path,
    options: &ReadOptions,
    default_delimiter: u8,
    nrows: Option<usize>,
) -> IngestResult<DataSet> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter(options.delimiter, default_delimiter))
        .from_path(path)?;

    // Without a footer to cut, reading can stop as soon as enough rows are in.
    let header_count = if options.header { options.header_rows.max(1) } else { 0 };
    let stop_after = match (nrows, options.skip_footer) {
        (Some(n), 0) => Some(options.skip_rows + header_count + n),
        _ => None,
    };

    let mut records = Vec::new();
    for result in rdr.records() {
        if stop_after.is_some_and(|limit| records.len() >= limit) {
            break;
        }
        let record = result?;
        records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }

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

/// Rewrite `path` with the contents of `data`.
pub fn write(
    path: &Path,
    data: &DataSet,
    options: &WriteOptions,
    default_delimiter: u8,
) -> IngestResult<()> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(delimiter(options.delimiter, default_delimiter))
        .from_path(path)?;
    if options.header {
        wtr.write_record(data.schema.field_names())?;
    }
    for row in &data.rows {
        wtr.write_record(row.iter().map(|v| v.to_string()))?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Value};
    use std::io::Write;

    #[test]
    fn reads_with_inference_and_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id,name,score").unwrap();
        writeln!(file, "1,Ada,98.5").unwrap();
        writeln!(file, "2,,").unwrap();
        writeln!(file, "3,Bo,70").unwrap();

        let ds = read(file.path(), &ReadOptions::default(), b',', None).unwrap();
        assert_eq!(ds.column_names(), vec!["id", "name", "score"]);
        assert_eq!(ds.schema.fields[0].data_type, DataType::Int64);
        assert_eq!(ds.schema.fields[2].data_type, DataType::Float64);
        assert_eq!(ds.rows[1], vec![Value::Int64(2), Value::Null, Value::Null]);

        let head = read(file.path(), &ReadOptions::default(), b',', Some(2)).unwrap();
        assert_eq!(head.row_count(), 2);
    }

    #[test]
    fn write_then_read_keeps_header_only_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tsv");
        let ds = DataSet::new(
            crate::types::Schema::new(vec![crate::types::Field::new("a", DataType::Int64)]),
            vec![],
        );
        write(&path, &ds, &WriteOptions::default(), b'\t').unwrap();
        let back = read(&path, &ReadOptions::default(), b'\t', None).unwrap();
        assert_eq!(back.column_names(), vec!["a"]);
        assert_eq!(back.row_count(), 0);
        assert_eq!(back.schema.fields[0].data_type, DataType::Null);
    }
}
