//! Container / frame I/O layer.
//!
//! - [`Session`]: one registry per run, keyed by resolved URL
//! - [`Container`]: one physical resource, its handle, and its frames
//! - [`Frame`]: one table/sheet and its read/write state machine

mod container;
mod frame;
mod session;

pub use container::{Container, ContainerMode};
pub use frame::{Frame, FrameMode};
pub use session::{ResourceStats, Session};

pub(crate) use container::lock;
