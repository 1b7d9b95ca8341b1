use super::cache::{CacheKey, CacheStats, CachedRendering, ResolutionCache};
use super::directive::{parse_directives, Directive, IncludeOptions};
use crate::error::{CortexError, Result};
use crate::storage::analysis::{find_section, parse_heading, parse_sections, slice_lines, FenceTracker};
use crate::types::{ContentHash, FileId};

/// Narrow read access the resolver needs. The facade implements it over the
/// content store and index; tests use an in-memory map.
pub trait ContentSource: Send + Sync {
    /// Current text and hash of `id`.
    fn load(&self, id: &FileId) -> Result<(String, ContentHash)>;

    /// Hash the source currently believes `id` has, without reading it.
    /// Cached renderings are only reused while every dependency matches.
    fn current_hash(&self, id: &FileId) -> Option<ContentHash>;

    /// Turn a directive target into an identifier.
    fn validate_target(&self, raw: &str) -> Result<FileId> {
        FileId::new(raw)
    }
}

/// Result of rendering one file or section.
struct Rendered {
    text: String,
    dependencies: Vec<(FileId, ContentHash)>,
    height: usize,
    /// False when any directive below was replaced by an error marker.
    complete: bool,
}

enum Failure {
    /// Cycle or depth: stops the whole resolution.
    Abort(CortexError),
    /// The file itself could not be loaded.
    Load(CortexError),
    /// Loaded, but the request could not be satisfied.
    Unsatisfied(String),
}

#[derive(Clone, Copy)]
struct Frame<'a> {
    stack: &'a [FileId],
    depth: usize,
    max_depth: usize,
}

/// Expands `{{include:…}}` directives recursively.
pub struct TransclusionResolver {
    cache: ResolutionCache,
}

impl TransclusionResolver {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: ResolutionCache::new(cache_capacity),
        }
    }

    /// Fully rendered content of `id`. Missing targets and sections become
    /// inline markers; cycles and excessive nesting fail the call.
    pub fn resolve(&self, source: &dyn ContentSource, id: &FileId, max_depth: usize) -> Result<String> {
        let frame = Frame {
            stack: &[],
            depth: 0,
            max_depth,
        };
        match self.render(source, id, None, IncludeOptions::default(), frame) {
            Ok(rendered) => Ok(rendered.text),
            Err(Failure::Abort(e)) | Err(Failure::Load(e)) => Err(e),
            Err(Failure::Unsatisfied(reason)) => Err(CortexError::Validation(reason)),
        }
    }

    /// Forget cached renderings that read `id`.
    pub fn invalidate(&self, id: &FileId) {
        let dropped = self.cache.invalidate_file(id);
        if dropped > 0 {
            log::debug!("Invalidated {} cached rendering(s) depending on {}", dropped, id);
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn render(
        &self,
        source: &dyn ContentSource,
        id: &FileId,
        section: Option<&str>,
        options: IncludeOptions,
        frame: Frame<'_>,
    ) -> std::result::Result<Rendered, Failure> {
        if frame.stack.contains(id) {
            let mut stack = frame.stack.to_vec();
            stack.push(id.clone());
            return Err(Failure::Abort(CortexError::CircularDependency { stack }));
        }
        if frame.depth > frame.max_depth {
            return Err(Failure::Abort(CortexError::DepthExceeded {
                id: id.clone(),
                max_depth: frame.max_depth,
            }));
        }

        let key = CacheKey::new(id.clone(), section, options);
        if let Some(hit) = self.cache.get(&key) {
            if self.is_reusable(source, &hit, frame) {
                log::debug!("Transclusion cache hit for {}", id);
                return Ok(Rendered {
                    text: hit.text.clone(),
                    dependencies: hit.dependencies.clone(),
                    height: hit.height,
                    complete: true,
                });
            }
            self.cache.remove(&key);
        }

        let (text, hash) = source.load(id).map_err(Failure::Load)?;
        let body = select_body(&text, section, options)?;

        let mut rendered = if options.raw {
            Rendered {
                text: body,
                dependencies: Vec::new(),
                height: 0,
                complete: true,
            }
        } else {
            let mut stack = frame.stack.to_vec();
            stack.push(id.clone());
            let child_frame = Frame {
                stack: &stack,
                depth: frame.depth + 1,
                max_depth: frame.max_depth,
            };
            self.expand(source, &body, child_frame)?
        };
        rendered.dependencies.insert(0, (id.clone(), hash));

        if options.shift > 0 {
            rendered.text = shift_headings(&rendered.text, options.shift);
        }

        if rendered.complete {
            self.cache.put(
                key,
                CachedRendering {
                    text: rendered.text.clone(),
                    dependencies: rendered.dependencies.clone(),
                    height: rendered.height,
                },
            );
        }
        Ok(rendered)
    }

    /// Substitute every directive in `body`, rendering targets one level down.
    fn expand(
        &self,
        source: &dyn ContentSource,
        body: &str,
        frame: Frame<'_>,
    ) -> std::result::Result<Rendered, Failure> {
        let mut out = Rendered {
            text: String::with_capacity(body.len()),
            dependencies: Vec::new(),
            height: 0,
            complete: true,
        };
        let mut cursor = 0;

        for directive in parse_directives(body) {
            out.text.push_str(&body[cursor..directive.span.start]);
            cursor = directive.span.end;

            match self.render_directive(source, &directive, frame) {
                Ok(child) => {
                    let text = child.text.strip_suffix('\n').unwrap_or(&child.text);
                    out.text.push_str(text);
                    out.height = out.height.max(child.height + 1);
                    out.complete &= child.complete;
                    for dep in child.dependencies {
                        if !out.dependencies.iter().any(|(d, _)| *d == dep.0) {
                            out.dependencies.push(dep);
                        }
                    }
                }
                Err(Failure::Abort(e)) => return Err(Failure::Abort(e)),
                Err(Failure::Load(e)) => {
                    out.text.push_str(&error_marker(&directive, &load_reason(&e)));
                    out.complete = false;
                }
                Err(Failure::Unsatisfied(reason)) => {
                    out.text.push_str(&error_marker(&directive, &reason));
                    out.complete = false;
                }
            }
        }
        out.text.push_str(&body[cursor..]);
        Ok(out)
    }

    fn render_directive(
        &self,
        source: &dyn ContentSource,
        directive: &Directive,
        frame: Frame<'_>,
    ) -> std::result::Result<Rendered, Failure> {
        let options = IncludeOptions::parse(&directive.options)
            .map_err(|unknown| Failure::Unsatisfied(format!("unknown option: {}", unknown)))?;
        let target = source.validate_target(&directive.target).map_err(Failure::Load)?;
        self.render(source, &target, directive.section.as_deref(), options, frame)
    }

    fn is_reusable(&self, source: &dyn ContentSource, hit: &CachedRendering, frame: Frame<'_>) -> bool {
        frame.depth + hit.height <= frame.max_depth
            && hit.dependencies.iter().all(|(dep, hash)| {
                !frame.stack.contains(dep) && source.current_hash(dep).as_ref() == Some(hash)
            })
    }
}

/// The part of `text` a directive asked for.
fn select_body(
    text: &str,
    section: Option<&str>,
    options: IncludeOptions,
) -> std::result::Result<String, Failure> {
    match section {
        Some(name) => {
            let sections = parse_sections(text);
            let found = find_section(&sections, name)
                .ok_or_else(|| Failure::Unsatisfied("section not found".to_string()))?;
            let start = if options.no_heading {
                found.start_line + 1
            } else {
                found.start_line
            };
            Ok(slice_lines(text, start, found.end_line))
        }
        None if options.no_heading => {
            let starts_with_heading = text.lines().next().and_then(parse_heading).is_some();
            if starts_with_heading {
                Ok(text.split_once('\n').map(|(_, rest)| rest).unwrap_or("").to_string())
            } else {
                Ok(text.to_string())
            }
        }
        None => Ok(text.to_string()),
    }
}

/// Demote ATX headings outside code fences by `shift` levels, capped at h6.
fn shift_headings(text: &str, shift: u8) -> String {
    let mut tracker = FenceTracker::default();
    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        if tracker.consume(line) {
            out.push(line.to_string());
            continue;
        }
        match parse_heading(line) {
            Some((level, title)) => {
                let level = level.saturating_add(shift).min(6) as usize;
                out.push(format!("{} {}", "#".repeat(level), title));
            }
            None => out.push(line.to_string()),
        }
    }
    let mut shifted = out.join("\n");
    if text.ends_with('\n') {
        shifted.push('\n');
    }
    shifted
}

fn load_reason(e: &CortexError) -> String {
    match e {
        CortexError::NotFound(_) => "file not found".to_string(),
        CortexError::PathRejected { reason, .. } => format!("path rejected: {}", reason),
        CortexError::InvalidEncoding(_) => "not valid UTF-8".to_string(),
        CortexError::FileTooLarge { .. } => "file too large".to_string(),
        other => other.to_string(),
    }
}

fn error_marker(directive: &Directive, reason: &str) -> String {
    format!("[transclusion error: {}: {}]", directive.label(), reason)
}
