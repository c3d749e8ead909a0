//! In-process named-table store.
//!
//! Used for staging between runs of the same session and for handing tables from one task
//! group to another. Reads return owned copies.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::error::{IngestError, IngestResult};
use crate::types::DataSet;

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, DataSet>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table names in sorted order.
    pub fn table_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Copy of a table.
    pub fn get(&self, name: &str) -> IngestResult<DataSet> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| IngestError::Resource {
                url: "memory://".to_string(),
                message: format!("no table named '{name}'"),
            })
    }

    pub fn insert(&self, name: impl Into<String>, data: DataSet) {
        self.lock().insert(name.into(), data);
    }

    /// Swap in `tables`; with `clear`, every other table is dropped first.
    pub fn replace_tables(&self, tables: impl IntoIterator<Item = (String, DataSet)>, clear: bool) {
        let mut guard = self.lock();
        if clear {
            guard.clear();
        }
        guard.extend(tables);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, DataSet>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_tables_can_clear_the_store() {
        let store = MemoryStore::new();
        store.insert("a", DataSet::default());
        store.replace_tables([("b".to_string(), DataSet::default())], false);
        assert_eq!(store.table_names(), vec!["a", "b"]);
        store.replace_tables([("c".to_string(), DataSet::default())], true);
        assert_eq!(store.table_names(), vec!["c"]);
        assert!(store.get("a").is_err());
    }
}
