use crate::types::{FileId, LinkKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where an edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Fixed by the table of well-known files.
    Static,
    /// Discovered by parsing a file's content. Replaced on every re-scan.
    Dynamic,
}

/// `from` depends on `to`; `to` loads first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: FileId,
    pub to: FileId,
    pub kind: EdgeKind,
    pub link_kind: LinkKind,
}

/// A node in an exported graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: FileId,
    pub priority: u32,
    pub category: String,
    /// False for link targets that are not (or no longer) files on disk.
    pub exists: bool,
}

/// Serializable picture of the whole graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<DependencyEdge>,
    pub cycles: Vec<Vec<FileId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphFormat {
    /// Structured nodes and edges.
    Raw,
    /// Mermaid `graph TD` text.
    Diagram,
}

impl FromStr for GraphFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "json" => Ok(GraphFormat::Raw),
            "diagram" | "mermaid" => Ok(GraphFormat::Diagram),
            other => Err(format!("unknown graph format: {}", other)),
        }
    }
}

impl fmt::Display for GraphFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphFormat::Raw => write!(f, "raw"),
            GraphFormat::Diagram => write!(f, "diagram"),
        }
    }
}

/// An exported graph in the requested format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "graph", rename_all = "snake_case")]
pub enum GraphView {
    Raw(GraphSnapshot),
    Diagram(String),
}
