//! SQLite backend.
//!
//! Tables are read with their declared column types. A container write runs inside one
//! transaction: each dirty table is dropped, recreated from the frame schema and refilled.

use std::path::Path;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};

use crate::error::{IngestError, IngestResult};
use crate::types::{DataSet, DataType, Field, Schema, Value};

use super::TableWrite;

/// Open a database file, or a private in-memory database for `None`.
pub fn open(path: Option<&Path>) -> IngestResult<Connection> {
    match path {
        Some(p) => {
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Connection::open(p)?)
        }
        None => Ok(Connection::open_in_memory()?),
    }
}

/// Quote an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn list_tables(conn: &Connection) -> IngestResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn declared_type(decl: Option<&str>) -> DataType {
    let Some(decl) = decl else {
        return DataType::Null;
    };
    let upper = decl.to_ascii_uppercase();
    if upper.contains("BOOL") {
        DataType::Bool
    } else if upper.contains("INT") {
        DataType::Int64
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        DataType::Float64
    } else {
        DataType::Utf8
    }
}

fn from_sql(v: ValueRef<'_>, data_type: DataType) -> Value {
    let raw = match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int64(i),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(t) => Value::Utf8(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Utf8(String::from_utf8_lossy(b).into_owned()),
    };
    match (raw, data_type) {
        (Value::Int64(i), DataType::Bool) => Value::Bool(i != 0),
        (v, dt) => crate::types::coerce_lossy(v, dt),
    }
}

fn to_sql(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Int64(i) => SqlValue::Integer(*i),
        Value::Float64(f) => SqlValue::Real(*f),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Utf8(s) => SqlValue::Text(s.clone()),
    }
}

/// Read a table; columns without a declared type are inferred from the values.
pub fn read_table(conn: &Connection, table: &str, nrows: Option<usize>) -> IngestResult<DataSet> {
    let mut sql = format!("SELECT * FROM {}", quote_ident(table));
    if let Some(n) = nrows {
        sql.push_str(&format!(" LIMIT {n}"));
    }
    let mut stmt = conn.prepare(&sql).map_err(|e| IngestError::Resource {
        url: format!("sql table '{table}'"),
        message: e.to_string(),
    })?;
    let declared: Vec<(String, DataType)> = stmt
        .columns()
        .iter()
        .map(|c| (c.name().to_string(), declared_type(c.decl_type())))
        .collect();

    let mut raw_rows: Vec<Vec<Value>> = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut out = Vec::with_capacity(declared.len());
        for (i, (_, dt)) in declared.iter().enumerate() {
            out.push(from_sql(row.get_ref(i)?, *dt));
        }
        raw_rows.push(out);
    }

    let fields = declared
        .iter()
        .enumerate()
        .map(|(i, (name, dt))| {
            let data_type = if *dt == DataType::Null {
                raw_rows
                    .iter()
                    .fold(DataType::Null, |acc, r| acc.unify(r[i].data_type()))
            } else {
                *dt
            };
            Field::new(name.clone(), data_type)
        })
        .collect();
    let schema = Schema::new(fields);
    Ok(DataSet::new(schema.clone(), raw_rows).align_to(&schema))
}

/// Rewrite `tables` in one transaction; with `replace`, every other table is dropped too.
pub fn write_tables(conn: &mut Connection, tables: &[TableWrite], replace: bool) -> IngestResult<()> {
    let existing = if replace { list_tables(conn)? } else { Vec::new() };
    let tx = conn.transaction()?;
    for name in existing {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)))?;
    }
    for t in tables {
        write_one(&tx, &t.name, &t.data)?;
    }
    tx.commit()?;
    Ok(())
}

fn write_one(conn: &Connection, table: &str, data: &DataSet) -> IngestResult<()> {
    let ident = quote_ident(table);
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {ident}"))?;
    let columns: Vec<String> = data
        .schema
        .fields
        .iter()
        .map(|f| format!("{} {}", quote_ident(&f.name), f.data_type.sql_type()))
        .collect();
    conn.execute_batch(&format!("CREATE TABLE {ident} ({})", columns.join(", ")))?;
    if data.schema.is_empty() {
        return Ok(());
    }

    let placeholders = vec!["?"; data.schema.len()].join(", ");
    let mut stmt = conn.prepare(&format!("INSERT INTO {ident} VALUES ({placeholders})"))?;
    for row in &data.rows {
        stmt.execute(params_from_iter(row.iter().map(to_sql)))?;
    }
    Ok(())
}

/// Load `data` into a fresh table of `conn`.
pub fn load(conn: &Connection, table: &str, data: &DataSet) -> IngestResult<()> {
    write_one(conn, table, data)
}

/// Run a query and collect its result, inferring column types from the values.
pub fn query(conn: &Connection, sql: &str) -> IngestResult<DataSet> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows_out: Vec<Vec<Value>> = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut out = Vec::with_capacity(names.len());
        for i in 0..names.len() {
            out.push(from_sql(row.get_ref(i)?, DataType::Null));
        }
        rows_out.push(out);
    }
    let fields = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let dt = rows_out
                .iter()
                .fold(DataType::Null, |acc, r| acc.unify(r[i].data_type()));
            Field::new(name, dt)
        })
        .collect();
    let schema = Schema::new(fields);
    Ok(DataSet::new(schema.clone(), rows_out).align_to(&schema))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteOptions;

    fn sample() -> DataSet {
        DataSet::new(
            Schema::new(vec![
                Field::new("id", DataType::Int64),
                Field::new("ok", DataType::Bool),
                Field::new("name", DataType::Utf8),
            ]),
            vec![
                vec![Value::Int64(1), Value::Bool(true), Value::Utf8("a".to_string())],
                vec![Value::Int64(2), Value::Bool(false), Value::Null],
            ],
        )
    }

    #[test]
    fn write_and_read_keep_declared_types() {
        let mut conn = open(None).unwrap();
        let tables = vec![TableWrite {
            name: "t".to_string(),
            data: sample(),
            options: WriteOptions::default(),
        }];
        write_tables(&mut conn, &tables, false).unwrap();
        assert_eq!(list_tables(&conn).unwrap(), vec!["t"]);
        assert_eq!(read_table(&conn, "t", None).unwrap(), sample());
        assert_eq!(read_table(&conn, "t", Some(1)).unwrap().row_count(), 1);
    }

    #[test]
    fn replace_drops_other_tables() {
        let mut conn = open(None).unwrap();
        load(&conn, "old", &sample()).unwrap();
        let tables = vec![TableWrite {
            name: "new".to_string(),
            data: sample().empty_like(),
            options: WriteOptions::default(),
        }];
        write_tables(&mut conn, &tables, true).unwrap();
        assert_eq!(list_tables(&conn).unwrap(), vec!["new"]);
        assert_eq!(read_table(&conn, "new", None).unwrap().schema, sample().schema);
    }

    #[test]
    fn missing_table_is_a_resource_error() {
        let conn = open(None).unwrap();
        let err = read_table(&conn, "nope", None).unwrap_err();
        assert!(matches!(err, IngestError::Resource { .. }));
    }
}
