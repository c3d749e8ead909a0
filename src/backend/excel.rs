#![cfg(feature = "excel")]

//! Excel backend: calamine for reading, rust_xlsxwriter for writing.
//!
//! A write rebuilds the whole workbook. Sheets without queued data are carried over cell by
//! cell (formulas with their cached results, hidden state kept), so a container persist never
//! loses a sheet it did not touch (unless it replaces the file).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Range, Reader, SheetVisible, Sheets};
use rust_xlsxwriter::{Formula, Workbook, Worksheet};

use crate::config::ReadOptions;
use crate::error::{IngestError, IngestResult};
use crate::types::{coerce_lossy, DataSet, DataType, Field, Schema, Value};

use super::{infer, TableWrite};

pub type ExcelHandle = Sheets<BufReader<File>>;

pub fn open(path: &Path) -> IngestResult<ExcelHandle> {
    Ok(open_workbook_auto(path)?)
}

/// Sheet names in workbook order; hidden sheets only when asked for.
pub fn sheet_names(wb: &ExcelHandle, include_hidden: bool) -> Vec<String> {
    wb.sheets_metadata()
        .iter()
        .filter(|s| include_hidden || matches!(s.visible, SheetVisible::Visible))
        .map(|s| s.name.clone())
        .collect()
}

fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::Int(i) => Value::Int64(*i),
        Data::Float(f) => Value::Float64(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::String(s) if s.trim().is_empty() => Value::Null,
        Data::String(s) => Value::Utf8(s.clone()),
        Data::DateTime(dt) => Value::Float64(dt.as_f64()),
        other => Value::Utf8(other.to_string()),
    }
}

/// Column type from cell values; whole-number float columns are integers.
fn column_type(values: impl Iterator<Item = Value>) -> DataType {
    let mut dt = DataType::Null;
    let mut all_whole = true;
    for v in values {
        if let Value::Float64(f) = v {
            all_whole &= f.fract() == 0.0 && f.abs() < 9.0e15;
        }
        dt = dt.unify(v.data_type());
    }
    if dt == DataType::Float64 && all_whole {
        DataType::Int64
    } else {
        dt
    }
}

pub fn read_sheet(
    wb: &mut ExcelHandle,
    sheet: &str,
    options: &ReadOptions,
    nrows: Option<usize>,
) -> IngestResult<DataSet> {
    let range = wb.worksheet_range(sheet)?;
    range_to_dataset(&range, options, nrows)
}

/// Convert a used range into a [`DataSet`].
///
/// `skip_rows` counts worksheet rows from the top of the sheet, not from the first used row.
pub fn range_to_dataset(
    range: &Range<Data>,
    options: &ReadOptions,
    nrows: Option<usize>,
) -> IngestResult<DataSet> {
    let first_row = range.start().map(|(r, _)| r as usize).unwrap_or(0);
    let mut rows: Vec<&[Data]> = range
        .rows()
        .skip(options.skip_rows.saturating_sub(first_row))
        .collect();
    let footer = options.skip_footer.min(rows.len());
    rows.truncate(rows.len() - footer);

    let header_count = if options.header {
        options.header_rows.max(1).min(rows.len())
    } else {
        0
    };
    let data_rows = rows.split_off(header_count);
    let width = rows
        .iter()
        .chain(data_rows.iter())
        .map(|r| r.len())
        .max()
        .unwrap_or(0)
        .max(options.names.len());

    let mut headers = if header_count > 0 {
        let raw: Vec<Vec<String>> = rows
            .iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect();
        infer::build_header(&raw, width)
    } else {
        (0..width).map(|i| format!("column_{i}")).collect()
    };
    for (slot, name) in headers.iter_mut().zip(&options.names) {
        *slot = name.clone();
    }

    let take = nrows.unwrap_or(usize::MAX);
    let values: Vec<Vec<Value>> = data_rows
        .iter()
        .take(take)
        .map(|r| {
            (0..width)
                .map(|i| r.get(i).map(cell_to_value).unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    let fields: Vec<Field> = headers
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let dt = match options.dtypes.get(&name) {
                Some(dt) => *dt,
                None => column_type(values.iter().map(|r| r[i].clone())),
            };
            Field::new(name, dt)
        })
        .collect();
    let rows = values
        .into_iter()
        .map(|r| {
            r.into_iter()
                .zip(&fields)
                .map(|(v, f)| coerce_lossy(v, f.data_type))
                .collect()
        })
        .collect();
    Ok(DataSet::new(Schema::new(fields), rows))
}

fn xlsx_col(col: usize) -> IngestResult<u16> {
    u16::try_from(col).map_err(|_| IngestError::SchemaMismatch {
        message: format!("column index {col} is beyond the worksheet limit"),
    })
}

fn xlsx_row(row: usize) -> IngestResult<u32> {
    u32::try_from(row).map_err(|_| IngestError::SchemaMismatch {
        message: format!("row index {row} is beyond the worksheet limit"),
    })
}

fn write_value(ws: &mut Worksheet, row: u32, col: u16, v: &Value) -> IngestResult<()> {
    match v {
        Value::Null => {}
        Value::Int64(i) => {
            ws.write_number(row, col, *i as f64)?;
        }
        Value::Float64(f) => {
            ws.write_number(row, col, *f)?;
        }
        Value::Bool(b) => {
            ws.write_boolean(row, col, *b)?;
        }
        Value::Utf8(s) => {
            ws.write_string(row, col, s)?;
        }
    }
    Ok(())
}

fn write_table(ws: &mut Worksheet, table: &TableWrite) -> IngestResult<()> {
    let mut row = table.options.start_row;
    if table.options.header {
        for (col, name) in table.data.schema.field_names().enumerate() {
            ws.write_string(row, xlsx_col(col)?, name)?;
        }
        row += 1;
    }
    for values in &table.data.rows {
        for (col, v) in values.iter().enumerate() {
            write_value(ws, row, xlsx_col(col)?, v)?;
        }
        row += 1;
    }
    Ok(())
}

fn copy_sheet(ws: &mut Worksheet, values: &Range<Data>, formulas: &Range<String>) -> IngestResult<()> {
    let (row0, col0) = values.start().unwrap_or((0, 0));
    for (r, cells) in values.rows().enumerate() {
        for (c, cell) in cells.iter().enumerate() {
            let row = row0 + xlsx_row(r)?;
            let col = xlsx_col(col0 as usize + c)?;
            write_value(ws, row, col, &cell_to_value(cell))?;
        }
    }

    let (row0, col0) = formulas.start().unwrap_or((0, 0));
    for (r, cells) in formulas.rows().enumerate() {
        for (c, text) in cells.iter().enumerate() {
            if text.is_empty() {
                continue;
            }
            let row = row0 + xlsx_row(r)?;
            let col = col0 as usize + c;
            let cached = values
                .get_value((row, col as u32))
                .map(cell_to_value)
                .unwrap_or(Value::Null);
            let formula = Formula::new(text).set_result(cached.to_string());
            ws.write_formula(row, xlsx_col(col)?, formula)?;
        }
    }
    Ok(())
}

/// A sheet of the existing workbook, with its content when no table replaces it.
struct CarriedSheet {
    name: String,
    hidden: bool,
    content: Option<(Range<Data>, Range<String>)>,
}

/// Rewrite the workbook at `path`.
///
/// Existing sheets keep their order and visibility; queued tables replace the sheet of the
/// same name, and tables for new sheets are appended. With `replace`, only the queued tables
/// are written.
pub fn write_workbook(
    path: &Path,
    existing: Option<&mut ExcelHandle>,
    tables: &[TableWrite],
    replace: bool,
) -> IngestResult<()> {
    let mut carried: Vec<CarriedSheet> = Vec::new();
    if let (false, Some(wb)) = (replace, existing) {
        let sheets: Vec<(String, bool)> = wb
            .sheets_metadata()
            .iter()
            .map(|s| (s.name.clone(), !matches!(s.visible, SheetVisible::Visible)))
            .collect();
        for (name, hidden) in sheets {
            let content = if tables.iter().any(|t| t.name == name) {
                None
            } else {
                Some((wb.worksheet_range(&name)?, wb.worksheet_formula(&name)?))
            };
            carried.push(CarriedSheet { name, hidden, content });
        }
    }

    let mut workbook = Workbook::new();
    let mut active_set = false;
    for sheet in &carried {
        let ws = workbook.add_worksheet();
        ws.set_name(&sheet.name)?;
        match (&sheet.content, tables.iter().find(|t| t.name == sheet.name)) {
            (_, Some(table)) => write_table(ws, table)?,
            (Some((values, formulas)), None) => copy_sheet(ws, values, formulas)?,
            (None, None) => {}
        }
        if sheet.hidden {
            ws.set_hidden(true);
        } else if !active_set {
            ws.set_active(true);
            active_set = true;
        }
    }
    for table in tables {
        if carried.iter().any(|sheet| sheet.name == table.name) {
            continue;
        }
        let ws = workbook.add_worksheet();
        ws.set_name(&table.name)?;
        write_table(ws, table)?;
        if !active_set {
            ws.set_active(true);
            active_set = true;
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    workbook.save(path)?;
    Ok(())
}
