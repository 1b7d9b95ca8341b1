//! Recursive `{{include:…}}` expansion.

mod cache;
pub mod directive;
mod resolver;

pub use cache::CacheStats;
pub use directive::{parse_directives, Directive, IncludeOptions};
pub use resolver::{ContentSource, TransclusionResolver};
