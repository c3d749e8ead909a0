use std::path::PathBuf;

use thiserror::Error;

/// Convenience result type used across the crate.
pub type IngestResult<T> = Result<T, IngestError>;

/// Error type returned by config resolution, backend I/O, transforms and task execution.
///
/// Backend errors are wrapped unmodified so that callers can still inspect the source.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Invalid config path, YAML document, schema or merge.
    #[error("config error: {message}")]
    Config { message: String },

    /// A config file failed to parse or validate.
    #[error("config error in {path}: {message}")]
    ConfigFile { path: PathBuf, message: String },

    /// Source and target shapes differ under the `strict` consistency policy.
    #[error("consistency error for '{table}': {message}")]
    Consistency { table: String, message: String },

    /// Creating, replacing or truncating a target failed, or `fail` hit an existing table.
    #[error("build error for '{table}': {message}")]
    Build { table: String, message: String },

    /// No backend is registered for the requested type or operation.
    #[error("unsupported type: {kind}")]
    UnsupportedType { kind: String },

    /// A frame was marked dirty but only ever received build (zero-row) writes.
    #[error("refusing to persist '{table}': only build writes were buffered")]
    EmptyWrite { table: String },

    /// A URL could not be opened or a table is not available.
    #[error("resource error for '{url}': {message}")]
    Resource { url: String, message: String },

    /// A transform step could not be applied.
    #[error("transform error: {message}")]
    Transform { message: String },

    /// The data does not have the expected shape (missing columns, ragged rows, etc.).
    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// A value could not be parsed into the required [`crate::types::DataType`].
    #[error("failed to parse value at row {row} column '{column}': {message} (raw='{raw}')")]
    ParseError {
        row: usize,
        column: String,
        raw: String,
        message: String,
    },

    /// Underlying I/O error (e.g. file not found, permission denied).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "excel")]
    /// Excel read error (feature-gated behind `excel`).
    #[error("excel error: {0}")]
    Excel(#[from] calamine::Error),

    #[cfg(feature = "excel")]
    /// Excel write error (feature-gated behind `excel`).
    #[error("excel write error: {0}")]
    ExcelWrite(#[from] rust_xlsxwriter::XlsxError),

    /// SQLite error.
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// XML read/write error.
    #[error("xml error: {message}")]
    Xml { message: String },

    #[cfg(feature = "pdf")]
    /// PDF parse error (feature-gated behind `pdf`).
    #[error("pdf error: {0}")]
    Pdf(#[from] lopdf::Error),
}

/// Coarse classification of an [`IngestError`], used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Consistency,
    Build,
    UnsupportedType,
    EmptyWrite,
    Resource,
    Transform,
    Backend,
}

impl IngestError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } | Self::ConfigFile { .. } | Self::Yaml(_) => ErrorKind::Config,
            Self::Consistency { .. } => ErrorKind::Consistency,
            Self::Build { .. } => ErrorKind::Build,
            Self::UnsupportedType { .. } => ErrorKind::UnsupportedType,
            Self::EmptyWrite { .. } => ErrorKind::EmptyWrite,
            Self::Resource { .. } => ErrorKind::Resource,
            Self::Transform { .. } => ErrorKind::Transform,
            _ => ErrorKind::Backend,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn transform(message: impl Into<String>) -> Self {
        Self::Transform {
            message: message.into(),
        }
    }

    pub(crate) fn xml(err: impl std::fmt::Display) -> Self {
        Self::Xml {
            message: err.to_string(),
        }
    }
}
