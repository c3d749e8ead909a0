//! Per-table read/write state machine.
//!
//! A [`Frame`] is the in-process representative of one table/sheet inside a container. It
//! caches reads, buffers writes according to the `if_exists` policy of the first write, and
//! hands the accumulated result to its container on persist. Backend I/O is injected as
//! closures so the state machine itself never touches a handle.

use tracing::debug;

use crate::config::{IfExists, ReadOptions, WriteOptions};
use crate::error::{IngestError, IngestResult};
use crate::types::DataSet;

/// Lifecycle state of a [`Frame`].
///
/// Order: `Soft < Sampled < Read < {Appending, Overwriting}`. The two write states are terminal
/// for a run and never switch into each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameMode {
    /// Name known, nothing read.
    Soft,
    /// A bounded sample has been read.
    Sampled,
    /// A full (or limit-bounded) read has been done.
    Read,
    /// Rows queued to be appended to existing data.
    Appending,
    /// Rows queued to replace whatever the table held.
    Overwriting,
}

impl FrameMode {
    fn rank(self) -> u8 {
        match self {
            Self::Soft => 0,
            Self::Sampled => 1,
            Self::Read => 2,
            Self::Appending | Self::Overwriting => 3,
        }
    }

    /// Whether the frame holds writes for this run.
    pub fn is_write(self) -> bool {
        self.rank() == 3
    }

    /// Legal transitions: staying put, or strictly moving up the order.
    pub fn can_transition(self, to: Self) -> bool {
        self == to || to.rank() > self.rank()
    }

    /// The later of two modes; ties keep `self`.
    fn max(self, other: Self) -> Self {
        if other.rank() > self.rank() { other } else { self }
    }
}

/// Key of the cached read: options plus row limit.
#[derive(Debug, Clone, PartialEq)]
struct ReadKey {
    options: ReadOptions,
    limit: Option<usize>,
}

#[derive(Debug)]
pub struct Frame {
    name: String,
    container: String,
    mode: FrameMode,
    history: Vec<FrameMode>,
    /// Last read result.
    df: Option<DataSet>,
    read_key: Option<ReadKey>,
    /// `Some(n)` when `df` is an `n`-row sample rather than the whole read.
    cached_sample: Option<usize>,
    /// Rows written in this run and not yet persisted.
    buffer: Option<DataSet>,
    /// Persisted content (existing rows for append, then everything committed so far).
    df_target: Option<DataSet>,
    write_options: Option<WriteOptions>,
    written: bool,
    has_data_write: bool,
    backend_reads: usize,
}

impl Frame {
    pub fn new(name: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            container: container.into(),
            mode: FrameMode::Soft,
            history: vec![FrameMode::Soft],
            df: None,
            read_key: None,
            cached_sample: None,
            buffer: None,
            df_target: None,
            write_options: None,
            written: false,
            has_data_write: false,
            backend_reads: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Every mode this frame has been in, oldest first.
    pub fn history(&self) -> &[FrameMode] {
        &self.history
    }

    /// Number of reads that reached the backend.
    pub fn backend_reads(&self) -> usize {
        self.backend_reads
    }

    /// Whether any write (build or data) happened in this run.
    pub fn is_written(&self) -> bool {
        self.written
    }

    /// Whether rows are buffered and waiting for a persist.
    pub fn is_dirty(&self) -> bool {
        self.buffer.is_some()
    }

    /// Whether this run created content for the table (queued or committed).
    pub fn holds_table(&self) -> bool {
        self.buffer.is_some() || self.df_target.is_some()
    }

    /// Committed output (after [`Frame::persist`]).
    pub fn output(&self) -> Option<&DataSet> {
        self.df_target.as_ref()
    }

    pub fn write_options(&self) -> WriteOptions {
        self.write_options.clone().unwrap_or_default()
    }

    /// Move to `to`.
    ///
    /// # Panics
    ///
    /// Panics on a regression, or on a switch between `Appending` and `Overwriting`.
    fn transition(&mut self, to: FrameMode) {
        if to == self.mode {
            return;
        }
        assert!(
            self.mode.can_transition(to),
            "illegal frame transition {:?} -> {:?} for '{}' in {}",
            self.mode,
            to,
            self.name,
            self.container
        );
        debug!(frame = %self.name, container = %self.container, from = ?self.mode, to = ?to, "frame transition");
        self.mode = to;
        self.history.push(to);
    }

    /// Content as it would look after a persist: committed rows followed by buffered rows.
    fn pending_view(&self) -> DataSet {
        match (&self.df_target, &self.buffer) {
            (Some(out), Some(buf)) => {
                let mut view = out.clone();
                view.append(buf);
                view
            }
            (Some(out), None) => out.clone(),
            (None, Some(buf)) => buf.clone(),
            (None, None) => DataSet::default(),
        }
    }

    /// Read the table.
    ///
    /// `sample` bounds the rows returned. Reads with the same options and limit as the cached
    /// one are served from the cache; a cached sample only serves requests for at most as many
    /// rows. A frame written in this run returns its pending content without backend I/O.
    pub fn read<F>(
        &mut self,
        options: &ReadOptions,
        limit: Option<usize>,
        sample: Option<usize>,
        fetch: F,
    ) -> IngestResult<DataSet>
    where
        F: FnOnce(&ReadOptions, Option<usize>) -> IngestResult<DataSet>,
    {
        let bound = match (limit, sample) {
            (Some(l), Some(s)) => Some(l.min(s)),
            (l, s) => l.or(s),
        };

        if self.written {
            let view = self.pending_view();
            return Ok(match bound {
                Some(n) => view.head(n),
                None => view,
            });
        }

        let key = ReadKey {
            options: options.clone(),
            limit,
        };
        let cache_hit = self.read_key.as_ref() == Some(&key)
            && match self.cached_sample {
                None => true,
                Some(cached) => sample.is_some_and(|s| s <= cached),
            };

        if !cache_hit {
            debug!(frame = %self.name, container = %self.container, ?bound, "backend read");
            let ds = fetch(options, bound)?;
            self.backend_reads += 1;

            // A sample that came back full may be cut short; anything else is complete.
            let truncated = match sample {
                Some(s) => limit.is_none_or(|l| s < l) && ds.row_count() >= s,
                None => false,
            };
            self.cached_sample = if truncated { sample } else { None };
            let next = if truncated {
                FrameMode::Sampled
            } else {
                FrameMode::Read
            };
            self.df = Some(ds);
            self.read_key = Some(key);
            self.transition(self.mode.max(next));
        }

        let df = self.df.as_ref().map(|d| match sample {
            Some(s) => d.head(s),
            None => d.clone(),
        });
        Ok(df.unwrap_or_default())
    }

    /// Queue `df` for writing.
    ///
    /// With `build`, a zero-row frame of the same shape is queued instead and `if_exists` is
    /// not consulted. The first data write of a run applies `if_exists`; `existing` is called
    /// at most once, to fetch the current table (or `None` when it does not exist). Every
    /// later write appends to the buffer.
    pub fn write<F>(
        &mut self,
        df: DataSet,
        if_exists: IfExists,
        options: &WriteOptions,
        build: bool,
        existing: F,
    ) -> IngestResult<()>
    where
        F: FnOnce() -> IngestResult<Option<DataSet>>,
    {
        self.write_options = Some(options.clone());

        if build {
            self.buffer = Some(df.empty_like());
            self.df_target = None;
            self.written = true;
            self.transition(FrameMode::Overwriting);
            return Ok(());
        }

        if self.written {
            match &mut self.buffer {
                Some(buf) => buf.append(&df),
                None => {
                    let schema = self
                        .df_target
                        .as_ref()
                        .map(|t| t.schema.widened(&df.schema))
                        .unwrap_or_else(|| df.schema.clone());
                    self.buffer = Some(df.align_to(&schema));
                }
            }
            self.has_data_write = true;
            return Ok(());
        }

        let next = match if_exists {
            IfExists::Fail => {
                if existing()?.is_some() {
                    return Err(IngestError::Build {
                        table: self.name.clone(),
                        message: "table already exists and if_exists is 'fail'".to_string(),
                    });
                }
                self.buffer = Some(df);
                FrameMode::Overwriting
            }
            IfExists::Append => match existing()? {
                Some(mut current) => {
                    current.widen_to(&df.schema);
                    self.buffer = Some(df.align_to(&current.schema));
                    self.df_target = Some(current);
                    FrameMode::Appending
                }
                None => {
                    self.buffer = Some(df);
                    FrameMode::Overwriting
                }
            },
            IfExists::Truncate => {
                let df = match existing()? {
                    Some(current) => df.align_to(&current.schema.widened(&df.schema)),
                    None => df,
                };
                self.buffer = Some(df);
                self.df_target = None;
                FrameMode::Overwriting
            }
            IfExists::Replace | IfExists::ReplaceFile | IfExists::ReplaceDatabase => {
                self.buffer = Some(df);
                self.df_target = None;
                FrameMode::Overwriting
            }
        };
        self.written = true;
        self.has_data_write = true;
        self.transition(next);
        Ok(())
    }

    /// Output the next [`Frame::persist`] would commit, leaving the frame unchanged.
    ///
    /// Fails with [`IngestError::EmptyWrite`] when the only buffered writes were build writes.
    pub fn pending_output(&self) -> IngestResult<DataSet> {
        if self.buffer.is_some() && !self.has_data_write {
            return Err(IngestError::EmptyWrite {
                table: self.name.clone(),
            });
        }
        Ok(self.pending_view())
    }

    /// Commit the buffer into the output. Performs no I/O.
    ///
    /// Fails with [`IngestError::EmptyWrite`] when the only buffered writes were build writes.
    pub fn persist(&mut self) -> IngestResult<()> {
        let Some(buffer) = self.buffer.take() else {
            return Ok(());
        };
        if !self.has_data_write {
            self.buffer = Some(buffer);
            return Err(IngestError::EmptyWrite {
                table: self.name.clone(),
            });
        }
        let output = match self.df_target.take() {
            Some(mut out) => {
                out.append(&buffer);
                out
            }
            None => buffer,
        };
        debug!(frame = %self.name, container = %self.container, rows = output.row_count(), "frame persisted");
        self.df_target = Some(output);
        Ok(())
    }

    /// Drop a queued build-only buffer.
    pub(crate) fn discard_buffer(&mut self) {
        self.buffer = None;
    }
}
