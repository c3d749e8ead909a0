//! One physical resource (file, database, store) and its frames.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::backend::{self, BackendKind, Handle, Location, MemoryStore, TableWrite};
use crate::config::{IfExists, ReadOptions, WriteOptions};
use crate::error::{IngestError, IngestResult};
use crate::types::DataSet;

use super::frame::Frame;

/// Derived container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerMode {
    /// Newly created, or forced to start empty.
    Overwrite,
    /// Existing resource with at least one dirty frame.
    Append,
    Read,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ContainerState {
    handle: Option<Handle>,
    replace: bool,
    created: bool,
    frames: Vec<(String, Arc<Mutex<Frame>>)>,
}

/// Owner of one physical resource and its child frames.
///
/// Locks are always taken frame first, then container state.
pub struct Container {
    url: String,
    kind: BackendKind,
    location: Location,
    state: Mutex<ContainerState>,
    persist_lock: Mutex<()>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("url", &self.url)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Container {
    /// Acquire the backend handle for `location`.
    pub fn open(
        kind: BackendKind,
        location: Location,
        replace: bool,
        store: &Arc<MemoryStore>,
    ) -> IngestResult<Self> {
        let created = !location.exists();
        let handle = backend::open(kind, &location, replace, store).map_err(|e| match e {
            IngestError::Io(io) => IngestError::Resource {
                url: location.key(),
                message: io.to_string(),
            },
            other => other,
        })?;
        info!(url = %location, %kind, replace, "opened resource");
        Ok(Self {
            url: location.key(),
            kind,
            location,
            state: Mutex::new(ContainerState {
                handle: Some(handle),
                replace,
                created,
                frames: Vec::new(),
            }),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Treat the backing store as empty from now on.
    pub fn force_replace(&self) {
        lock(&self.state).replace = true;
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).handle.is_none()
    }

    /// Fetch-or-create the frame for `name`.
    pub fn frame(&self, name: &str) -> Arc<Mutex<Frame>> {
        let mut state = lock(&self.state);
        if let Some((_, f)) = state.frames.iter().find(|(n, _)| n == name) {
            return Arc::clone(f);
        }
        let frame = Arc::new(Mutex::new(Frame::new(name, self.url.clone())));
        state.frames.push((name.to_string(), Arc::clone(&frame)));
        frame
    }

    fn frames(&self) -> Vec<Arc<Mutex<Frame>>> {
        lock(&self.state).frames.iter().map(|(_, f)| Arc::clone(f)).collect()
    }

    /// Tables present on the backend (ignoring writes of this run).
    fn stored_tables(&self, include_hidden: bool) -> IngestResult<Vec<String>> {
        let mut state = lock(&self.state);
        if state.replace {
            return Ok(Vec::new());
        }
        let handle = state.handle.as_mut().ok_or_else(|| self.closed())?;
        backend::list_tables(self.kind, &self.location, handle, include_hidden)
    }

    /// Child table names: stored tables followed by tables first written in this run.
    pub fn children(&self, include_hidden: bool) -> IngestResult<Vec<String>> {
        let mut names = self.stored_tables(include_hidden)?;
        for frame in self.frames() {
            let frame = lock(&frame);
            if frame.holds_table() && !names.iter().any(|n| n == frame.name()) {
                names.push(frame.name().to_string());
            }
        }
        Ok(names)
    }

    /// Whether `table` holds data, on the backend or written in this run.
    pub fn exists(&self, table: &str) -> IngestResult<bool> {
        let written = self
            .frames()
            .iter()
            .any(|f| {
                let f = lock(f);
                f.name() == table && f.holds_table()
            });
        if written {
            return Ok(true);
        }
        Ok(self.stored_tables(true)?.iter().any(|n| n == table))
    }

    fn closed(&self) -> IngestError {
        IngestError::Resource {
            url: self.url.clone(),
            message: "container is closed".to_string(),
        }
    }

    fn backend_read(&self, table: &str, options: &ReadOptions, nrows: Option<usize>) -> IngestResult<DataSet> {
        let mut state = lock(&self.state);
        if state.replace {
            return Err(IngestError::Resource {
                url: self.url.clone(),
                message: format!("table '{table}' does not exist (container is being replaced)"),
            });
        }
        let handle = state.handle.as_mut().ok_or_else(|| self.closed())?;
        backend::read_table(self.kind, &self.location, handle, table, options, nrows)
    }

    /// Read `table` through its frame (see [`Frame::read`]).
    pub fn read(
        &self,
        table: &str,
        options: &ReadOptions,
        limit: Option<usize>,
        sample: Option<usize>,
    ) -> IngestResult<DataSet> {
        let frame = self.frame(table);
        let mut frame = lock(&frame);
        frame.read(options, limit, sample, |opts, nrows| self.backend_read(table, opts, nrows))
    }

    /// Queue a write to `table` through its frame (see [`Frame::write`]).
    pub fn write(
        &self,
        table: &str,
        df: DataSet,
        if_exists: IfExists,
        options: &WriteOptions,
        build: bool,
    ) -> IngestResult<()> {
        if self.kind == BackendKind::Pdf {
            return Err(IngestError::UnsupportedType {
                kind: "writing pdf".to_string(),
            });
        }
        let frame = self.frame(table);
        let mut frame = lock(&frame);
        frame.write(df, if_exists, options, build, || {
            if !self.stored_tables(true)?.iter().any(|n| n == table) {
                return Ok(None);
            }
            self.backend_read(table, &options.read_options(), None).map(Some)
        })
    }

    /// Derived mode: overwrite if created or replaced, append if any frame is dirty, else read.
    pub fn mode(&self) -> ContainerMode {
        let (replace, created) = {
            let state = lock(&self.state);
            (state.replace, state.created)
        };
        if replace || created {
            ContainerMode::Overwrite
        } else if self.frames().iter().any(|f| lock(f).is_dirty()) {
            ContainerMode::Append
        } else {
            ContainerMode::Read
        }
    }

    /// Perform one physical write of every dirty frame, then commit the frames.
    ///
    /// Frames holding only build writes are dropped with a warning; if every dirty frame is
    /// build-only the first [`IngestError::EmptyWrite`] is returned and nothing is written.
    /// When the write fails, the frames keep their buffers.
    pub fn persist(&self) -> IngestResult<()> {
        let _guard = lock(&self.persist_lock);

        let frames = self.frames();
        let mut staged = Vec::new();
        let mut tables = Vec::new();
        let mut empty: Option<IngestError> = None;
        for frame in &frames {
            let mut frame = lock(frame);
            if !frame.is_dirty() {
                continue;
            }
            match frame.pending_output() {
                Ok(data) => {
                    tables.push(TableWrite {
                        name: frame.name().to_string(),
                        data,
                        options: frame.write_options(),
                    });
                    staged.push(frame);
                }
                Err(e @ IngestError::EmptyWrite { .. }) => {
                    warn!(url = %self.url, table = %frame.name(), "skipping build-only table");
                    frame.discard_buffer();
                    empty.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        let mut state = lock(&self.state);
        if tables.is_empty() {
            return match empty {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }
        let replace = state.replace;
        let handle = state.handle.as_mut().ok_or_else(|| self.closed())?;
        let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
        backend::write_tables(self.kind, &self.location, handle, tables, replace)?;
        state.replace = false;
        state.created = false;
        drop(state);

        for mut frame in staged {
            frame.persist()?;
        }
        info!(url = %self.url, tables = ?names, "persisted resource");
        Ok(())
    }

    /// Release the backend handle.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if state.handle.take().is_some() {
            debug!(url = %self.url, "closed resource");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Field, Schema, Value};

    fn ints(values: &[i64]) -> DataSet {
        DataSet::new(
            Schema::new(vec![Field::new("a", DataType::Int64)]),
            values.iter().map(|v| vec![Value::Int64(*v)]).collect(),
        )
    }

    fn memory() -> Container {
        Container::open(
            BackendKind::Memory,
            Location::Memory,
            false,
            &Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn mode_follows_dirty_frames() {
        let c = memory();
        assert_eq!(c.mode(), ContainerMode::Read);
        c.write("t", ints(&[1]), IfExists::Append, &WriteOptions::default(), false)
            .unwrap();
        assert_eq!(c.mode(), ContainerMode::Append);
        c.persist().unwrap();
        assert_eq!(c.mode(), ContainerMode::Read);
        c.force_replace();
        assert_eq!(c.mode(), ContainerMode::Overwrite);
    }

    #[test]
    fn persist_skips_build_only_frames() {
        let c = memory();
        c.write("built", ints(&[1]), IfExists::Replace, &WriteOptions::default(), true)
            .unwrap();
        assert!(matches!(c.persist(), Err(IngestError::EmptyWrite { .. })));

        c.write("built", ints(&[1]), IfExists::Replace, &WriteOptions::default(), true)
            .unwrap();
        c.write("real", ints(&[2]), IfExists::Replace, &WriteOptions::default(), false)
            .unwrap();
        c.persist().unwrap();
        assert_eq!(c.children(false).unwrap(), vec!["real"]);
        assert!(!c.exists("built").unwrap());
    }

    #[test]
    fn closed_containers_refuse_io() {
        let c = memory();
        c.close();
        assert!(c.is_closed());
        let err = c.read("t", &ReadOptions::default(), None, None).unwrap_err();
        assert!(matches!(err, IngestError::Resource { .. }));
    }
}
