//! Pure content helpers: hashing, outline parsing, link discovery and merge
//! marker detection. Nothing here touches the filesystem.

use crate::transclusion::directive::parse_directives;
use crate::types::{ContentHash, FileId, Link, LinkKind, Section};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::ops::Range;
use std::sync::OnceLock;

/// Everything the index stores about a file's content.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentAnalysis {
    pub hash: ContentHash,
    pub size_bytes: u64,
    pub token_estimate: u64,
    pub sections: Vec<Section>,
    pub links: Vec<Link>,
}

impl ContentAnalysis {
    pub fn of(id: &FileId, text: &str, allowed_extensions: &[String]) -> Self {
        Self {
            hash: compute_hash(text.as_bytes()),
            size_bytes: text.len() as u64,
            token_estimate: estimate_tokens(text),
            sections: parse_sections(text),
            links: parse_links(id, text, allowed_extensions),
        }
    }
}

pub fn compute_hash(bytes: &[u8]) -> ContentHash {
    ContentHash::from_hex(hex::encode(Sha256::digest(bytes)))
}

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Split into lines, keeping each line's byte offset. Line terminators are
/// excluded from the slices.
pub(crate) fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |raw| {
        let start = offset;
        offset += raw.len();
        let line = raw.strip_suffix('\n').unwrap_or(raw);
        let line = line.strip_suffix('\r').unwrap_or(line);
        (start, line)
    })
}

/// Tracks fenced code blocks while scanning line by line.
#[derive(Default)]
pub(crate) struct FenceTracker {
    open: Option<(char, usize)>,
}

impl FenceTracker {
    /// Feed one line; returns true if the line is part of a fenced block
    /// (fence lines included).
    pub(crate) fn consume(&mut self, line: &str) -> bool {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        let fence = if indent <= 3 { fence_marker(trimmed) } else { None };

        match (self.open, fence) {
            (None, Some(marker)) => {
                self.open = Some(marker);
                true
            }
            (Some((ch, len)), Some((c, l))) if c == ch && l >= len => {
                self.open = None;
                true
            }
            (Some(_), _) => true,
            (None, None) => false,
        }
    }
}

fn fence_marker(trimmed: &str) -> Option<(char, usize)> {
    let ch = trimmed.chars().next()?;
    if ch != '`' && ch != '~' {
        return None;
    }
    let len = trimmed.chars().take_while(|&c| c == ch).count();
    (len >= 3).then_some((ch, len))
}

/// Byte ranges of fenced code blocks.
pub(crate) fn fenced_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = Vec::new();
    let mut tracker = FenceTracker::default();
    for (start, line) in lines_with_offsets(text) {
        if tracker.consume(line) {
            let end = start + line.len();
            match ranges.last_mut() {
                Some(last) if last.end + 2 >= start => last.end = end,
                _ => ranges.push(start..end),
            }
        }
    }
    ranges
}

/// Parse an ATX heading (`## Title`). Returns level and title.
pub(crate) fn parse_heading(line: &str) -> Option<(u8, &str)> {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let level = trimmed.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    let title = rest.trim();
    // Optional closing sequence: "## Title ##"
    let title = match title.trim_end_matches('#') {
        t if t.len() < title.len() && (t.is_empty() || t.ends_with([' ', '\t'])) => t.trim_end(),
        _ => title,
    };
    if title.is_empty() {
        return None;
    }
    Some((level as u8, title))
}

/// Heading outline. Each section spans to the line before the next heading of
/// the same or a higher level, so nested subsections are included.
pub fn parse_sections(text: &str) -> Vec<Section> {
    let mut headings: Vec<(String, u8, usize)> = Vec::new();
    let mut tracker = FenceTracker::default();
    let mut total_lines = 0;

    for (idx, (_, line)) in lines_with_offsets(text).enumerate() {
        total_lines = idx + 1;
        if tracker.consume(line) {
            continue;
        }
        if let Some((level, title)) = parse_heading(line) {
            headings.push((title.to_string(), level, idx + 1));
        }
    }

    let mut sections = Vec::with_capacity(headings.len());
    for (i, (title, level, start_line)) in headings.iter().enumerate() {
        let end_line = headings[i + 1..]
            .iter()
            .find(|(_, l, _)| l <= level)
            .map(|(_, _, next_start)| next_start - 1)
            .unwrap_or(total_lines);
        sections.push(Section {
            title: title.clone(),
            level: *level,
            start_line: *start_line,
            end_line,
        });
    }
    sections
}

/// Lowercase, alphanumerics and dashes. Used for `#section` lookups.
pub fn heading_slug(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else if c.is_whitespace() || c == '-' || c == '_' {
            pending_dash = true;
        }
    }
    slug
}

/// Find a section by title (case-insensitive) or by slug.
pub fn find_section<'a>(sections: &'a [Section], name: &str) -> Option<&'a Section> {
    let wanted = name.trim();
    sections
        .iter()
        .find(|s| s.title.eq_ignore_ascii_case(wanted))
        .or_else(|| {
            let slug = heading_slug(wanted);
            sections.iter().find(|s| heading_slug(&s.title) == slug)
        })
}

/// Lines `start..=end` (1-based) joined with `\n`.
pub fn slice_lines(text: &str, start: usize, end: usize) -> String {
    lines_with_offsets(text)
        .skip(start.saturating_sub(1))
        .take((end + 1).saturating_sub(start.max(1)))
        .map(|(_, line)| line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Line number of the first merge marker, if the text carries a complete
/// unresolved conflict (`<<<<<<<`, `=======` and `>>>>>>>` all present).
pub fn find_merge_markers(text: &str) -> Option<usize> {
    let mut first = None;
    let (mut ours, mut sep, mut theirs) = (false, false, false);

    for (idx, (_, line)) in lines_with_offsets(text).enumerate() {
        let hit = if line == "<<<<<<<" || line.starts_with("<<<<<<< ") {
            ours = true;
            true
        } else if line == "=======" {
            sep = true;
            true
        } else if line == ">>>>>>>" || line.starts_with(">>>>>>> ") {
            theirs = true;
            true
        } else {
            false
        };
        if hit && first.is_none() {
            first = Some(idx + 1);
        }
    }

    if ours && sep && theirs {
        first
    } else {
        None
    }
}

fn markdown_link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\[[^\]\n]*\]\(\s*<?([^)\s>]+)>?(?:\s+"[^"]*")?\s*\)"#)
            .expect("link regex is valid")
    })
}

/// Outbound links: inclusion directives plus Markdown links to other
/// knowledge files. Deduplicated in first-seen order; a target that is both
/// referenced and transcluded is reported once as a transclusion.
pub fn parse_links(source: &FileId, text: &str, allowed_extensions: &[String]) -> Vec<Link> {
    let mut links: Vec<Link> = Vec::new();
    let mut push = |target_id: FileId, kind: LinkKind| {
        match links.iter_mut().find(|l| l.target_id == target_id) {
            Some(existing) => {
                if kind == LinkKind::Transclusion {
                    existing.kind = LinkKind::Transclusion;
                }
            }
            None => links.push(Link { target_id, kind }),
        }
    };

    let fenced = fenced_ranges(text);
    let in_fence = |pos: usize| fenced.iter().any(|r| r.contains(&pos));

    let mut found: Vec<(usize, FileId, LinkKind)> = Vec::new();

    for directive in parse_directives(text) {
        if let Ok(target) = FileId::new(&directive.target) {
            found.push((directive.span.start, target, LinkKind::Transclusion));
        }
    }

    for caps in markdown_link_regex().captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if in_fence(whole.start()) {
            continue;
        }
        // Image embeds are not document links.
        if whole.start() > 0 && text.as_bytes()[whole.start() - 1] == b'!' {
            continue;
        }
        let raw = &caps[1];
        if raw.starts_with('#') || raw.contains("://") || raw.starts_with("mailto:") {
            continue;
        }
        let path = raw.split(['#', '?']).next().unwrap_or(raw);
        let Ok(target) = source.resolve_relative(path) else { continue };
        let allowed = target
            .extension()
            .map(|ext| allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)))
            .unwrap_or(false);
        if allowed {
            found.push((whole.start(), target, LinkKind::Reference));
        }
    }

    found.sort_by_key(|(pos, _, _)| *pos);
    for (_, target, kind) in found {
        push(target, kind);
    }
    links
}
