use crate::storage::analysis::fenced_ranges;
use regex::Regex;
use std::fmt;
use std::ops::Range;
use std::sync::OnceLock;

/// One `{{include:TARGET[#SECTION][|OPTIONS]}}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Byte span of the whole directive in the source text.
    pub span: Range<usize>,
    pub target: String,
    pub section: Option<String>,
    /// Raw, comma-separated options as written.
    pub options: Vec<String>,
}

impl Directive {
    /// `target#section`, for error markers and logs.
    pub fn label(&self) -> String {
        match &self.section {
            Some(section) => format!("{}#{}", self.target, section),
            None => self.target.clone(),
        }
    }
}

fn directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{include:\s*([^}#|]+?)\s*(?:#\s*([^}|]+?)\s*)?(?:\|([^}]*))?\}\}")
            .expect("directive regex is valid")
    })
}

/// All directives outside fenced code blocks, in source order.
pub fn parse_directives(text: &str) -> Vec<Directive> {
    let fenced = fenced_ranges(text);
    directive_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            if fenced.iter().any(|r| r.contains(&whole.start())) {
                return None;
            }
            let options = caps
                .get(3)
                .map(|m| {
                    m.as_str()
                        .split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(Directive {
                span: whole.range(),
                target: caps[1].to_string(),
                section: caps.get(2).map(|m| m.as_str().to_string()),
                options,
            })
        })
        .collect()
}

/// Parsed rendering options. Part of the cache key, so it has a canonical
/// form regardless of how the options were spelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct IncludeOptions {
    /// Drop the included section's own heading line.
    pub no_heading: bool,
    /// Demote included headings by this many levels (capped at h6).
    pub shift: u8,
    /// Insert the target verbatim without resolving its directives.
    pub raw: bool,
}

impl IncludeOptions {
    /// Parse raw option strings; the error is the first unknown option.
    pub fn parse(raw: &[String]) -> std::result::Result<Self, String> {
        let mut options = IncludeOptions::default();
        for option in raw {
            let lowered = option.to_ascii_lowercase();
            match lowered.as_str() {
                "no-heading" => options.no_heading = true,
                "raw" => options.raw = true,
                other => match other.strip_prefix("shift=").map(str::parse::<u8>) {
                    Some(Ok(n)) if n <= 5 => options.shift = n,
                    _ => return Err(option.clone()),
                },
            }
        }
        Ok(options)
    }
}

impl fmt::Display for IncludeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.no_heading {
            parts.push("no-heading".to_string());
        }
        if self.shift > 0 {
            parts.push(format!("shift={}", self.shift));
        }
        if self.raw {
            parts.push("raw".to_string());
        }
        f.write_str(&parts.join(","))
    }
}
