//! YAML config layer: records, merging, placeholders and the resolution tree.

pub mod merge;
pub mod model;
pub mod placeholder;
pub mod tree;

pub use model::{
    Consistency, IfExists, JobConfig, LeafJob, QuerySource, ReadOptions, Source, StringList, Target,
    TransformOp, TransformStep, WriteOptions,
};
pub use tree::{find_root, ConfigTree, NodeKind};
