//! Placeholder tokens resolved against the node a config is attached to.

use std::path::{Path, PathBuf};

use serde_json::Value;

pub const TABLE_NAME: &str = "{table_name}";
pub const FILE_NAME: &str = "{file_name}";
pub const FILE_BASE: &str = "{file_base}";
pub const FILE_PATH: &str = "{file_path}";
pub const FILE_PATH_REL: &str = "{file_path_rel}";
pub const FOLDER_NAME: &str = "{folder_name}";
pub const FOLDER_PATH: &str = "{folder_path}";
pub const PARENT_FOLDER_NAME: &str = "{parent_folder_name}";

/// Path-derived properties of a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProps {
    pub table_name: String,
    pub file_path: PathBuf,
    pub root: PathBuf,
}

impl NodeProps {
    pub fn new(table_name: impl Into<String>, file_path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            table_name: table_name.into(),
            file_path: file_path.into(),
            root: root.into(),
        }
    }

    /// Value for a token, or `None` if `token` is not a recognized placeholder.
    pub fn lookup(&self, token: &str) -> Option<String> {
        let folder = self.file_path.parent().unwrap_or_else(|| Path::new(""));
        let value = match token {
            TABLE_NAME => self.table_name.clone(),
            FILE_NAME => file_name(&self.file_path),
            FILE_BASE => self
                .file_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            FILE_PATH => self.file_path.display().to_string(),
            FILE_PATH_REL => self
                .file_path
                .strip_prefix(&self.root)
                .unwrap_or(&self.file_path)
                .display()
                .to_string(),
            FOLDER_NAME => file_name(folder),
            FOLDER_PATH => folder.display().to_string(),
            PARENT_FOLDER_NAME => folder.parent().map(file_name).unwrap_or_default(),
            _ => return None,
        };
        Some(value)
    }
}

fn file_name(p: &Path) -> String {
    p.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Replace every string scalar equal to a token with the node property it names.
pub fn substitute(value: &mut Value, props: &NodeProps) {
    match value {
        Value::String(s) => {
            if let Some(v) = props.lookup(s) {
                *s = v;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, props)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, props)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props() -> NodeProps {
        NodeProps::new("Sheet1", "/data/sales/2024/report.xlsx", "/data")
    }

    #[test]
    fn tokens_resolve_to_path_properties() {
        let p = props();
        assert_eq!(p.lookup(TABLE_NAME).unwrap(), "Sheet1");
        assert_eq!(p.lookup(FILE_NAME).unwrap(), "report.xlsx");
        assert_eq!(p.lookup(FILE_BASE).unwrap(), "report");
        assert_eq!(p.lookup(FILE_PATH_REL).unwrap(), "sales/2024/report.xlsx");
        assert_eq!(p.lookup(FOLDER_NAME).unwrap(), "2024");
        assert_eq!(p.lookup(PARENT_FOLDER_NAME).unwrap(), "sales");
        assert!(p.lookup("{nope}").is_none());
    }

    #[test]
    fn only_whole_values_are_replaced() {
        let mut v = json!({
            "target": {"table": "{file_base}", "url": "out_{file_base}.csv"},
            "transform": [{"add_columns": {"origin": "{folder_name}"}}]
        });
        substitute(&mut v, &props());
        assert_eq!(v["target"]["table"], "report");
        assert_eq!(v["target"]["url"], "out_{file_base}.csv");
        assert_eq!(v["transform"][0]["add_columns"]["origin"], "2024");
    }
}
