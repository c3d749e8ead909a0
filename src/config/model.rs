//! Source / Target / Transform records as they appear in YAML config documents.
//!
//! Every record deserializes with `deny_unknown_fields`, so a typo in a config file is a
//! [`crate::IngestError::ConfigFile`] rather than a silently ignored key.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::{self, BackendKind};
use crate::error::IngestResult;
use crate::types::DataType;

/// Either a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    One(String),
    Many(Vec<String>),
}

impl StringList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }
}

impl Default for StringList {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

/// Per-format read options.
///
/// Unused options are ignored by backends that do not understand them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadOptions {
    /// Field delimiter for CSV-like text (defaults to `,`, or tab for TSV).
    pub delimiter: Option<char>,
    /// Whether the data starts with header row(s).
    pub header: bool,
    /// Number of header rows; more than one produces `level0|level1` column names.
    pub header_rows: usize,
    /// Rows to skip before the header.
    pub skip_rows: usize,
    /// Rows to drop from the end (footers).
    pub skip_footer: usize,
    /// Column widths for fixed-width text.
    pub widths: Vec<usize>,
    /// Explicit column names (used when `header` is false, or to rename).
    pub names: Vec<String>,
    /// Element name of a row in XML documents.
    pub row_tag: Option<String>,
    /// Explicit column types; other columns are inferred.
    pub dtypes: BTreeMap<String, DataType>,
    /// Include hidden sheets when listing Excel workbooks.
    pub include_hidden: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            header: true,
            header_rows: 1,
            skip_rows: 0,
            skip_footer: 0,
            widths: Vec::new(),
            names: Vec::new(),
            row_tag: None,
            dtypes: BTreeMap::new(),
            include_hidden: false,
        }
    }
}

/// Per-format write options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriteOptions {
    pub delimiter: Option<char>,
    pub header: bool,
    pub widths: Vec<usize>,
    pub root_tag: Option<String>,
    pub row_tag: Option<String>,
    /// Worksheet row at which the header is written (Excel).
    pub start_row: u32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            header: true,
            widths: Vec::new(),
            root_tag: None,
            row_tag: None,
            start_row: 0,
        }
    }
}

impl WriteOptions {
    /// Options for reading back what these options write.
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            delimiter: self.delimiter,
            header: self.header,
            skip_rows: self.start_row as usize,
            widths: self.widths.clone(),
            row_tag: self.row_tag.clone(),
            ..ReadOptions::default()
        }
    }
}

/// What to do when the target table already holds data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    #[default]
    Fail,
    Append,
    Replace,
    ReplaceFile,
    ReplaceDatabase,
    Truncate,
}

impl IfExists {
    /// Whether the whole backing container is recreated.
    pub fn replaces_container(self) -> bool {
        matches!(self, Self::ReplaceFile | Self::ReplaceDatabase)
    }
}

/// Whether a source/target schema mismatch blocks the ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    #[default]
    Strict,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Source {
    pub url: Option<String>,
    pub table: Option<StringList>,
    #[serde(rename = "type")]
    pub kind: Option<BackendKind>,
    pub options: ReadOptions,
    pub limit: Option<usize>,
    pub load_parallel: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Target {
    pub url: Option<String>,
    pub table: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<BackendKind>,
    pub if_exists: IfExists,
    pub consistency: Consistency,
    pub options: WriteOptions,
}

/// Script for the `query` transform: inline SQL or a path to a `.sql` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuerySource {
    Text(String),
    File { path: String },
}

fn default_var_name() -> String {
    "variable".to_string()
}

fn default_value_name() -> String {
    "value".to_string()
}

/// One transform operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOp {
    /// Keep rows matching an expression such as `a > 1 and b == "x"`.
    Filter(String),
    /// Run SQL against the frame, exposed as table `df`.
    Query(QuerySource),
    /// Fan the leaf out into one leaf per distinct value of a column.
    Split(String),
    Pivot {
        index: StringList,
        columns: String,
        values: String,
    },
    Melt {
        id_vars: StringList,
        #[serde(default)]
        value_vars: Option<StringList>,
        #[serde(default = "default_var_name")]
        var_name: String,
        #[serde(default = "default_value_name")]
        value_name: String,
    },
    Cast(BTreeMap<String, DataType>),
    /// Stack one level of a multi-level header into a column.
    DynamicStack {
        #[serde(default)]
        fixed_columns: StringList,
        header_level: usize,
        name: String,
    },
    AddColumns(BTreeMap<String, serde_json::Value>),
}

/// A transform operation plus its run-once marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TransformOp", into = "TransformOp")]
pub struct TransformStep {
    pub op: TransformOp,
    pub executed: bool,
}

impl From<TransformOp> for TransformStep {
    fn from(op: TransformOp) -> Self {
        Self {
            op,
            executed: false,
        }
    }
}

impl From<TransformStep> for TransformOp {
    fn from(step: TransformStep) -> Self {
        step.op
    }
}

/// One full config record (one YAML document after merging).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub source: Source,
    pub target: Option<Target>,
    pub transform: Vec<TransformStep>,
}

/// A fully resolved ingest job for one physical table/sheet.
#[derive(Debug, Clone, Serialize)]
pub struct LeafJob {
    /// Path-like identity, e.g. `sales/2024.xlsx::Sheet1`.
    pub key: String,
    /// Source table/sheet name.
    pub name: String,
    /// Replaces `*` in the target URL/table. Equals `name` unless the leaf came from a split.
    pub target_name: String,
    pub source: Source,
    pub target: Target,
    pub transform: Vec<TransformStep>,
    /// Directory used to resolve relative script paths.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl LeafJob {
    pub fn source_url(&self) -> &str {
        self.source.url.as_deref().unwrap_or_default()
    }

    /// Resolved source backend; set when the leaf is built.
    pub fn source_kind(&self) -> BackendKind {
        self.source.kind.unwrap_or(BackendKind::Memory)
    }

    /// Target URL with `*` replaced by the target name.
    pub fn target_url(&self) -> String {
        self.target
            .url
            .as_deref()
            .unwrap_or_default()
            .replace('*', &self.target_name)
    }

    pub fn target_kind(&self) -> BackendKind {
        self.target.kind.unwrap_or(BackendKind::Memory)
    }

    /// Target table name, canonicalized for single-table formats.
    pub fn target_table(&self) -> String {
        let raw = self.target.table.as_deref().unwrap_or("*");
        let table = raw.replace('*', &self.target_name);
        backend::canonical_table(self.target_kind(), &self.target_url(), &table)
    }

    /// Column named by a trailing, not yet executed `split` step.
    pub fn split_column(&self) -> Option<&str> {
        let pending: Vec<&TransformStep> = self.transform.iter().filter(|s| !s.executed).collect();
        match pending.last().map(|s| &s.op) {
            Some(TransformOp::Split(col)) => Some(col.as_str()),
            _ => None,
        }
    }

    /// Render the resolved job as YAML.
    pub fn to_yaml(&self) -> IngestResult<String> {
        let value = serde_json::to_value(self)?;
        Ok(serde_yaml::to_string(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_steps_parse_from_single_key_maps() {
        let cfg: JobConfig = serde_json::from_value(serde_json::json!({
            "transform": [
                {"filter": "a > 1"},
                {"cast": {"a": "float"}},
                {"melt": {"id_vars": "id"}},
                {"query": {"path": "q.sql"}},
                {"split": "g"}
            ]
        }))
        .unwrap();
        assert_eq!(cfg.transform.len(), 5);
        assert!(cfg.transform.iter().all(|s| !s.executed));
        assert_eq!(cfg.transform[0].op, TransformOp::Filter("a > 1".to_string()));
        match &cfg.transform[2].op {
            TransformOp::Melt {
                var_name,
                value_name,
                ..
            } => {
                assert_eq!(var_name, "variable");
                assert_eq!(value_name, "value");
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(
            cfg.transform[3].op,
            TransformOp::Query(QuerySource::File {
                path: "q.sql".to_string()
            })
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_json::from_value::<JobConfig>(serde_json::json!({
            "source": {"url": "a.csv", "tabel": "x"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("tabel"));
    }

    #[test]
    fn target_defaults() {
        let t: Target = serde_json::from_value(serde_json::json!({"url": "out.csv"})).unwrap();
        assert_eq!(t.if_exists, IfExists::Fail);
        assert_eq!(t.consistency, Consistency::Strict);
        assert!(t.options.header);
    }
}
