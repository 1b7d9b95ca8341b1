use crate::graph::{EdgeKind, GraphSnapshot};
use crate::types::{FileId, LinkKind};
use std::collections::HashMap;
use std::fmt::Write;

/// Mermaid flowchart. Thick arrows are static edges, solid arrows are
/// transclusions, dotted arrows are references. Missing files are drawn
/// with a dashed outline.
pub fn to_mermaid(snapshot: &GraphSnapshot) -> String {
    let mut out = String::from("graph TD\n");
    let mut handles: HashMap<&FileId, String> = HashMap::new();

    for (i, node) in snapshot.nodes.iter().enumerate() {
        let handle = format!("n{}", i);
        let _ = writeln!(out, "    {}[\"{}\"]", handle, escape_label(node.id.as_str()));
        if !node.exists {
            let _ = writeln!(out, "    style {} stroke-dasharray: 5 5", handle);
        }
        handles.insert(&node.id, handle);
    }

    for edge in &snapshot.edges {
        let (Some(from), Some(to)) = (handles.get(&edge.from), handles.get(&edge.to)) else {
            continue;
        };
        let arrow = match (edge.kind, edge.link_kind) {
            (EdgeKind::Static, _) => "==>",
            (EdgeKind::Dynamic, LinkKind::Transclusion) => "-->",
            (EdgeKind::Dynamic, LinkKind::Reference) => "-.->",
        };
        let _ = writeln!(out, "    {} {} {}", from, arrow, to);
    }
    out
}

fn escape_label(label: &str) -> String {
    label.replace('"', "#quot;")
}
