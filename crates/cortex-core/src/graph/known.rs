use crate::types::FileId;

pub const DEFAULT_PRIORITY: u32 = 100;
pub const DEFAULT_CATEGORY: &str = "general";

/// Built-in knowledge of a conventional file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownFile {
    pub id: &'static str,
    /// Lower loads earlier.
    pub priority: u32,
    pub category: &'static str,
    pub depends_on: &'static [&'static str],
}

/// Well-known files and the static edges between them.
pub const KNOWN_FILES: &[KnownFile] = &[
    KnownFile { id: "README.md", priority: 0, category: "overview", depends_on: &[] },
    KnownFile { id: "ARCHITECTURE.md", priority: 10, category: "architecture", depends_on: &["README.md"] },
    KnownFile { id: "CONVENTIONS.md", priority: 20, category: "conventions", depends_on: &["ARCHITECTURE.md"] },
    KnownFile { id: "PATTERNS.md", priority: 30, category: "patterns", depends_on: &["CONVENTIONS.md"] },
    KnownFile { id: "DECISIONS.md", priority: 40, category: "decisions", depends_on: &["ARCHITECTURE.md"] },
    KnownFile { id: "TROUBLESHOOTING.md", priority: 50, category: "troubleshooting", depends_on: &["PATTERNS.md"] },
    KnownFile { id: "GLOSSARY.md", priority: 60, category: "reference", depends_on: &[] },
];

pub fn lookup(id: &FileId) -> Option<&'static KnownFile> {
    KNOWN_FILES.iter().find(|k| k.id == id.as_str())
}

pub fn priority_of(id: &FileId) -> u32 {
    lookup(id).map_or(DEFAULT_PRIORITY, |k| k.priority)
}

pub fn category_of(id: &FileId) -> &'static str {
    lookup(id).map_or(DEFAULT_CATEGORY, |k| k.category)
}

/// Static dependencies of `id`, if it is a well-known file.
pub fn static_dependencies(id: &FileId) -> impl Iterator<Item = FileId> {
    lookup(id)
        .map(|k| k.depends_on)
        .unwrap_or(&[])
        .iter()
        .filter_map(|dep| FileId::new(dep).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_acyclic_and_self_consistent() {
        for known in KNOWN_FILES {
            for dep in known.depends_on {
                let target = KNOWN_FILES.iter().find(|k| k.id == *dep).unwrap();
                assert!(target.priority < known.priority, "{} loads before {}", dep, known.id);
            }
        }
    }

    #[test]
    fn test_unknown_defaults() {
        let id = FileId::new("notes/misc.md").unwrap();
        assert_eq!(priority_of(&id), DEFAULT_PRIORITY);
        assert_eq!(category_of(&id), DEFAULT_CATEGORY);
        assert_eq!(static_dependencies(&id).count(), 0);

        let arch = FileId::new("ARCHITECTURE.md").unwrap();
        assert_eq!(static_dependencies(&arch).collect::<Vec<_>>(), vec![FileId::new("README.md").unwrap()]);
    }
}
