//! Content Store: path safety, atomic byte-level I/O, hashing and per-file
//! write serialization.

pub mod analysis;
mod atomic;
mod fs_store;
mod locks;
mod paths;
mod rate_limit;
mod retry;
mod traits;

pub use analysis::{
    compute_hash, estimate_tokens, find_merge_markers, find_section, heading_slug, parse_links,
    parse_sections, slice_lines, ContentAnalysis,
};
pub(crate) use atomic::write_atomic;
pub use fs_store::FsContentStore;
pub use locks::{LockManager, WriteLock};
pub use paths::{encode_id, PathGuard, META_DIR};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use traits::ContentStore;
