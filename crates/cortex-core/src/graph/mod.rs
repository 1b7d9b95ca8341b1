mod engine;
mod export;
pub mod known;
mod types;

pub use engine::DependencyGraph;
pub use export::to_mermaid;
pub use types::*;
