//! Embedded knowledge-base engine: an atomic file store, a persistent
//! metadata index, per-file version history, a dependency graph and an
//! include-directive resolver, tied together by [`Cortex`].

pub mod api;
pub mod config;
pub mod error;
pub mod graph;
pub mod history;
pub mod index;
pub mod storage;
pub mod transclusion;
pub mod types;

pub use api::{Cortex, FileView, RollbackPreview, WriteOutcome};
pub use config::{
    CortexConfig, HistoryConfig, IndexConfig, RateLimitConfig, RetryConfig, StorageConfig,
    TransclusionConfig,
};
pub use error::{CortexError, Result};
pub use graph::{DependencyEdge, DependencyGraph, EdgeKind, GraphFormat, GraphNode, GraphSnapshot, GraphView};
pub use history::VersionHistory;
pub use index::{LoadOutcome, MetadataIndex, SyncReport, CURRENT_SCHEMA_VERSION};
pub use storage::{ContentStore, FsContentStore};
pub use transclusion::{CacheStats, ContentSource, TransclusionResolver};
pub use types::*;
