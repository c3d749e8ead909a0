//! Per-run registry of open containers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::backend::{BackendKind, Location, MemoryStore};
use crate::error::IngestResult;

use super::container::{lock, Container};

/// Open/close counts for one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub opens: usize,
    pub closes: usize,
}

/// Everything a run shares: open containers (one per resource), their reference counts, and
/// the in-process table store.
///
/// Dropping a session closes whatever is still open.
#[derive(Debug)]
pub struct Session {
    root: PathBuf,
    store: Arc<MemoryStore>,
    containers: Mutex<HashMap<String, Arc<Container>>>,
    refs: Mutex<HashMap<String, usize>>,
    stats: Mutex<HashMap<String, ResourceStats>>,
}

impl Session {
    /// A session resolving relative URLs against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_store(root, Arc::new(MemoryStore::new()))
    }

    /// A session sharing an existing table store (e.g. staged by an earlier run).
    pub fn with_store(root: impl Into<PathBuf>, store: Arc<MemoryStore>) -> Self {
        Self {
            root: root.into(),
            store,
            containers: Mutex::new(HashMap::new()),
            refs: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Registry key for `url`.
    pub fn resolve(&self, url: &str) -> IngestResult<String> {
        Ok(Location::parse(url, &self.root)?.key())
    }

    /// Return the registered container for `url`, opening it on first use.
    ///
    /// `replace` forces an empty backing store, also on an already open container.
    pub fn open(&self, url: &str, kind: BackendKind, replace: bool) -> IngestResult<Arc<Container>> {
        let location = Location::parse(url, &self.root)?;
        let key = location.key();
        let mut containers = lock(&self.containers);
        if let Some(c) = containers.get(&key) {
            if replace {
                c.force_replace();
            }
            return Ok(Arc::clone(c));
        }
        let container = Arc::new(Container::open(kind, location, replace, &self.store)?);
        containers.insert(key.clone(), Arc::clone(&container));
        lock(&self.stats).entry(key).or_default().opens += 1;
        Ok(container)
    }

    /// Whether `url` has an open container.
    pub fn is_open(&self, url: &str) -> bool {
        self.resolve(url)
            .map(|key| lock(&self.containers).contains_key(&key))
            .unwrap_or(false)
    }

    /// Register `n` future users of `url`.
    pub fn retain(&self, url: &str, n: usize) -> IngestResult<()> {
        let key = self.resolve(url)?;
        *lock(&self.refs).entry(key).or_default() += n;
        Ok(())
    }

    /// Drop `n` users of `url`; the container is closed when none remain.
    pub fn release(&self, url: &str, n: usize) -> IngestResult<()> {
        let key = self.resolve(url)?;
        let remaining = {
            let mut refs = lock(&self.refs);
            let count = refs.entry(key.clone()).or_default();
            *count = count.saturating_sub(n);
            let remaining = *count;
            if remaining == 0 {
                refs.remove(&key);
            }
            remaining
        };
        if remaining == 0 {
            self.close(&key);
        } else {
            debug!(url = %key, remaining, "resource still in use");
        }
        Ok(())
    }

    fn close(&self, key: &str) {
        let container = lock(&self.containers).remove(key);
        if let Some(c) = container {
            c.close();
            lock(&self.stats).entry(key.to_string()).or_default().closes += 1;
        }
    }

    /// Close every open container.
    pub fn close_all(&self) {
        let keys: Vec<String> = lock(&self.containers).keys().cloned().collect();
        if !keys.is_empty() {
            debug!(count = keys.len(), "closing remaining resources");
        }
        for key in keys {
            self.close(&key);
        }
        let leaked: Vec<String> = lock(&self.refs).drain().map(|(k, _)| k).collect();
        if !leaked.is_empty() {
            warn!(urls = ?leaked, "resources closed with outstanding references");
        }
    }

    /// Open/close counts for `url`.
    pub fn stats(&self, url: &str) -> ResourceStats {
        self.resolve(url)
            .map(|key| lock(&self.stats).get(&key).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_idempotent_and_release_closes_at_zero() {
        let session = Session::new("/tmp");
        let a = session.open("memory://", BackendKind::Memory, false).unwrap();
        let b = session.open("memory://", BackendKind::Memory, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        session.retain("memory://", 2).unwrap();
        session.release("memory://", 1).unwrap();
        assert!(session.is_open("memory://"));
        session.release("memory://", 1).unwrap();
        assert!(!session.is_open("memory://"));
        assert!(a.is_closed());
        assert_eq!(session.stats("memory://"), ResourceStats { opens: 1, closes: 1 });
    }

    #[test]
    fn relative_urls_share_a_key() {
        let session = Session::new("/data/root");
        assert_eq!(
            session.resolve("out/x.csv").unwrap(),
            session.resolve("/data/root/out/../out/x.csv").unwrap()
        );
    }
}
