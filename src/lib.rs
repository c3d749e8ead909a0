//! `ingestree` moves tabular data between CSV/TSV, Excel, SQLite, XML, fixed-width text, PDF
//! text boxes, JSON and an in-process table store, driven by a directory tree of layered YAML
//! configs.
//!
//! A run has three stages:
//!
//! 1. [`ConfigTree`] walks data files and configs (`_root.yml`, `_dir.yml`, adjacent and
//!    standalone `*.yml`), expands wildcards and tables, and yields one [`config::LeafJob`] per
//!    physical table.
//! 2. [`execution::plan`] resolves data-dependent `split` steps into concrete leaves and
//!    [`TaskFlow`] groups leaves by target container, target table and source container.
//! 3. [`Engine`] runs the flow: every resource opens once, each target table is built once
//!    before its writers, and each container persists with one physical write.
//!
//! ## Quick example
//!
//! ```no_run
//! use ingestree::{Engine, ExecutionOptions};
//!
//! # fn main() -> Result<(), ingestree::IngestError> {
//! let report = Engine::new(ExecutionOptions::default()).run_path("data/")?;
//! for outcome in report.failed() {
//!     eprintln!("{}: {}", outcome.key, outcome.error.as_deref().unwrap_or_default());
//! }
//! assert!(report.success());
//! # Ok(())
//! # }
//! ```
//!
//! A config document has up to three sections:
//!
//! ```yaml
//! source:
//!   table: "*"
//! target:
//!   url: out.csv
//!   if_exists: append
//! transform:
//!   - filter: amount > 0
//!   - add_columns: {origin: "{file_name}"}
//! ```
//!
//! ## Modules
//!
//! - [`config`]: config records, merging, placeholders and the resolution tree
//! - [`io`]: per-run [`Session`], containers and the frame state machine
//! - [`backend`]: per-format read/write
//! - [`transform`]: filter, query, reshape operations
//! - [`execution`]: planning, task flow, engine, metrics and observers
//! - [`types`]: schema + in-memory dataset types
//! - [`logging`]: `tracing-subscriber` setup
//! - [`error`]: error types used across the crate

pub mod backend;
pub mod config;
pub mod error;
pub mod execution;
pub mod io;
pub mod logging;
pub mod transform;
pub mod types;

pub use config::ConfigTree;
pub use error::{ErrorKind, IngestError, IngestResult};
pub use execution::{Engine, ExecutionOptions, RunReport, TaskFlow};
pub use io::Session;
