//! Backend dispatch.
//!
//! Every supported format is one [`BackendKind`] variant. A container talks to its backend
//! through four capabilities, dispatched by variant:
//!
//! - [`open`]: acquire a [`Handle`] for a [`Location`]
//! - [`list_tables`]: enumerate children (sheets, tables, or the single implicit table)
//! - [`read_table`]: read one child into a [`DataSet`]
//! - [`write_tables`]: write every dirty child of a container in one physical write

pub mod csv;
#[cfg(feature = "excel")]
pub mod excel;
pub mod fixed_width;
pub mod infer;
pub mod json;
pub mod memory;
#[cfg(feature = "pdf")]
pub mod pdf;
pub mod sql;
pub mod xml;

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ReadOptions, WriteOptions};
use crate::error::{IngestError, IngestResult};
use crate::types::DataSet;

pub use memory::MemoryStore;

/// Supported backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Comma-separated values.
    Csv,
    /// Tab-separated values.
    Tsv,
    /// Spreadsheet/workbook formats (feature-gated behind `excel`).
    Excel,
    /// SQLite database.
    Sql,
    /// XML document with one element per row.
    Xml,
    /// Fixed-width text.
    FixedWidth,
    /// Positioned text boxes extracted from a PDF (feature-gated behind `pdf`, read-only).
    Pdf,
    /// JSON array-of-objects or NDJSON.
    Json,
    /// In-process named-table store.
    Memory,
}

impl BackendKind {
    /// Parse a backend from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "tsv" | "tab" => Some(Self::Tsv),
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Some(Self::Excel),
            "db" | "sqlite" | "sqlite3" => Some(Self::Sql),
            "xml" => Some(Self::Xml),
            "txt" | "fwf" | "dat" => Some(Self::FixedWidth),
            "pdf" => Some(Self::Pdf),
            "json" | "ndjson" => Some(Self::Json),
            _ => None,
        }
    }

    /// Backend for a file path, from its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// Backend for a URL: scheme first, then extension.
    pub fn from_url(url: &str) -> IngestResult<Self> {
        if let Some((scheme, rest)) = url.split_once("://") {
            return match scheme.to_ascii_lowercase().as_str() {
                "sqlite" => Ok(Self::Sql),
                "memory" => Ok(Self::Memory),
                "file" => Self::from_path(Path::new(rest)).ok_or_else(|| unsupported(url)),
                _ => Err(unsupported(url)),
            };
        }
        Self::from_path(Path::new(url)).ok_or_else(|| unsupported(url))
    }

    /// Formats whose container holds exactly one table, named after the file stem.
    pub fn is_single_table(self) -> bool {
        matches!(
            self,
            Self::Csv | Self::Tsv | Self::Xml | Self::FixedWidth | Self::Pdf | Self::Json
        )
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Csv => "csv",
            Self::Tsv => "tsv",
            Self::Excel => "excel",
            Self::Sql => "sql",
            Self::Xml => "xml",
            Self::FixedWidth => "fixed_width",
            Self::Pdf => "pdf",
            Self::Json => "json",
            Self::Memory => "memory",
        };
        f.write_str(s)
    }
}

fn unsupported(what: impl fmt::Display) -> IngestError {
    IngestError::UnsupportedType {
        kind: what.to_string(),
    }
}

/// Whether a URL carries a scheme (`sqlite://`, `memory://`, ...).
pub fn has_scheme(url: &str) -> bool {
    url.contains("://")
}

/// Table name used for `table` in a container of `kind` at `url`.
///
/// Single-table formats have one child, named after the file stem, whatever the config says.
pub fn canonical_table(kind: BackendKind, url: &str, table: &str) -> String {
    if kind.is_single_table() {
        let path = url.split_once("://").map(|(_, p)| p).unwrap_or(url);
        if let Some(stem) = Path::new(path).file_stem() {
            return stem.to_string_lossy().into_owned();
        }
    }
    table.to_string()
}

/// Where a container's data physically lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// A file on disk.
    File(PathBuf),
    /// A SQLite database; `None` is a private in-memory database.
    Sqlite(Option<PathBuf>),
    /// The session's named-table store.
    Memory,
}

impl Location {
    /// Parse a URL, resolving relative paths against `base`.
    pub fn parse(url: &str, base: &Path) -> IngestResult<Self> {
        match url.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "memory" => Ok(Self::Memory),
                "sqlite" => {
                    if rest.is_empty() || rest == ":memory:" {
                        Ok(Self::Sqlite(None))
                    } else {
                        Ok(Self::Sqlite(Some(resolve_path(base, Path::new(rest)))))
                    }
                }
                "file" => Ok(Self::File(resolve_path(base, Path::new(rest)))),
                _ => Err(unsupported(url)),
            },
            None => Ok(Self::File(resolve_path(base, Path::new(url)))),
        }
    }

    /// Registry key: equal for every URL naming the same resource.
    pub fn key(&self) -> String {
        match self {
            Self::File(p) => p.display().to_string(),
            Self::Sqlite(Some(p)) => format!("sqlite://{}", p.display()),
            Self::Sqlite(None) => "sqlite://:memory:".to_string(),
            Self::Memory => "memory://".to_string(),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(p) | Self::Sqlite(Some(p)) => Some(p),
            _ => None,
        }
    }

    /// Whether the backing store already exists.
    pub fn exists(&self) -> bool {
        match self {
            Self::File(p) | Self::Sqlite(Some(p)) => p.exists(),
            Self::Sqlite(None) | Self::Memory => true,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Join `path` onto `base` (when relative) and fold `.`/`..` lexically.
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// An open backend resource.
pub enum Handle {
    /// Text formats: the file is re-read on every read, so no state is held.
    File,
    /// Parsed workbook, or `None` while the file does not exist yet.
    #[cfg(feature = "excel")]
    Workbook(Option<calamine::Sheets<std::io::BufReader<std::fs::File>>>),
    Sql(rusqlite::Connection),
    Memory(Arc<MemoryStore>),
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::File => "File",
            #[cfg(feature = "excel")]
            Self::Workbook(Some(_)) => "Workbook(open)",
            #[cfg(feature = "excel")]
            Self::Workbook(None) => "Workbook(missing)",
            Self::Sql(_) => "Sql",
            Self::Memory(_) => "Memory",
        };
        f.write_str(name)
    }
}

/// One table queued for a container write.
#[derive(Debug, Clone)]
pub struct TableWrite {
    pub name: String,
    pub data: DataSet,
    pub options: WriteOptions,
}

/// Open `location` for `kind`.
///
/// With `replace`, the backing store is treated as empty whatever it holds.
pub fn open(
    kind: BackendKind,
    location: &Location,
    replace: bool,
    store: &Arc<MemoryStore>,
) -> IngestResult<Handle> {
    match (kind, location) {
        (BackendKind::Memory, Location::Memory) => Ok(Handle::Memory(Arc::clone(store))),
        (BackendKind::Sql, Location::Sqlite(path)) => Ok(Handle::Sql(sql::open(path.as_deref())?)),
        (BackendKind::Sql, Location::File(path)) => Ok(Handle::Sql(sql::open(Some(path))?)),
        #[cfg(feature = "excel")]
        (BackendKind::Excel, Location::File(path)) => {
            if replace || !path.exists() {
                Ok(Handle::Workbook(None))
            } else {
                Ok(Handle::Workbook(Some(excel::open(path)?)))
            }
        }
        #[cfg(not(feature = "pdf"))]
        (BackendKind::Pdf, _) => Err(unsupported("pdf (enable the `pdf` feature)")),
        #[cfg(not(feature = "excel"))]
        (BackendKind::Excel, _) => Err(unsupported("excel (enable the `excel` feature)")),
        (k, Location::File(_)) if k != BackendKind::Memory => Ok(Handle::File),
        (k, loc) => Err(IngestError::Resource {
            url: loc.key(),
            message: format!("a {k} backend cannot open this location"),
        }),
    }
}

/// Names of the tables a container holds.
pub fn list_tables(
    kind: BackendKind,
    location: &Location,
    handle: &mut Handle,
    include_hidden: bool,
) -> IngestResult<Vec<String>> {
    match handle {
        Handle::Memory(store) => Ok(store.table_names()),
        Handle::Sql(conn) => sql::list_tables(conn),
        #[cfg(feature = "excel")]
        Handle::Workbook(Some(wb)) => Ok(excel::sheet_names(wb, include_hidden)),
        #[cfg(feature = "excel")]
        Handle::Workbook(None) => Ok(Vec::new()),
        Handle::File => match location.path() {
            Some(p) if p.is_file() => Ok(vec![canonical_table(kind, &p.display().to_string(), "")]),
            _ => Ok(Vec::new()),
        },
    }
}

/// Read one table; `nrows` bounds the number of data rows returned.
pub fn read_table(
    kind: BackendKind,
    location: &Location,
    handle: &mut Handle,
    table: &str,
    options: &ReadOptions,
    nrows: Option<usize>,
) -> IngestResult<DataSet> {
    match handle {
        Handle::Memory(store) => store.get(table).map(|ds| match nrows {
            Some(n) => ds.head(n),
            None => ds,
        }),
        Handle::Sql(conn) => sql::read_table(conn, table, nrows),
        #[cfg(feature = "excel")]
        Handle::Workbook(Some(wb)) => excel::read_sheet(wb, table, options, nrows),
        #[cfg(feature = "excel")]
        Handle::Workbook(None) => Err(IngestError::Resource {
            url: location.key(),
            message: format!("workbook has no sheet '{table}'"),
        }),
        Handle::File => {
            let path = location.path().ok_or_else(|| IngestError::Resource {
                url: location.key(),
                message: "not a file location".to_string(),
            })?;
            match kind {
                BackendKind::Csv => csv::read(path, options, b',', nrows),
                BackendKind::Tsv => csv::read(path, options, b'\t', nrows),
                BackendKind::FixedWidth => fixed_width::read(path, options, nrows),
                BackendKind::Json => json::read(path, options, nrows),
                BackendKind::Xml => xml::read(path, options, nrows),
                #[cfg(feature = "pdf")]
                BackendKind::Pdf => pdf::read(path, nrows),
                other => Err(unsupported(other)),
            }
        }
    }
}

/// Write every queued table of a container in one physical write.
///
/// With `replace`, tables not listed in `tables` are dropped.
pub fn write_tables(
    kind: BackendKind,
    location: &Location,
    handle: &mut Handle,
    tables: Vec<TableWrite>,
    replace: bool,
) -> IngestResult<()> {
    match handle {
        Handle::Memory(store) => {
            store.replace_tables(tables.into_iter().map(|t| (t.name, t.data)), replace);
            Ok(())
        }
        Handle::Sql(conn) => sql::write_tables(conn, &tables, replace),
        #[cfg(feature = "excel")]
        Handle::Workbook(wb) => {
            let path = location.path().ok_or_else(|| unsupported(location))?;
            excel::write_workbook(path, wb.as_mut(), &tables, replace)?;
            *wb = Some(excel::open(path)?);
            Ok(())
        }
        Handle::File => {
            let path = location.path().ok_or_else(|| unsupported(location))?;
            let Some(table) = tables.into_iter().next_back() else {
                return Ok(());
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match kind {
                BackendKind::Csv => csv::write(path, &table.data, &table.options, b','),
                BackendKind::Tsv => csv::write(path, &table.data, &table.options, b'\t'),
                BackendKind::FixedWidth => fixed_width::write(path, &table.data, &table.options),
                BackendKind::Json => json::write(path, &table.data),
                BackendKind::Xml => xml::write(path, &table.data, &table.options),
                other => Err(IngestError::UnsupportedType {
                    kind: format!("writing {other}"),
                }),
            }
        }
    }
}
