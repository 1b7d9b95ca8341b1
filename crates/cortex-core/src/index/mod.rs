//! Persistent metadata index: one `FileRecord` per knowledge file.

mod metadata;
mod schema;

pub use metadata::{LoadOutcome, MetadataIndex, SyncReport};
pub use schema::CURRENT_SCHEMA_VERSION;
