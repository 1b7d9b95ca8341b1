//! Version history: append-only full snapshots with bounded retention.

mod manifest;
mod store;

pub use store::VersionHistory;
