//! Content sanitizer for untrusted inbound material.
//!
//! Order of operations, each step only running if the previous one let the
//! content through:
//!
//! 1. size check on the raw bytes (oversized payloads are never parsed)
//! 2. binary detection
//! 3. active content stripping (scripts, styles, handlers, comments,
//!    embeds) for any payload containing markup, whatever its declared type
//! 4. plain-text extraction, when enabled and the payload is HTML
//! 5. sensitive-data pre-check: a `block_on` pattern rejects the whole
//!    payload, a `warn_on` pattern only adds a warning
//! 6. truncation to `max_text_chars`, with a warning

pub mod html;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::policy::{Policy, PolicyStore};
use html::{HtmlFilters, StripStats};

/// Why a payload was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    TooLarge { size: usize, max: usize },
    Binary,
    SensitiveData { patterns: Vec<String> },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::TooLarge { size, max } => {
                write!(f, "content too large ({size} bytes, limit {max})")
            }
            Rejection::Binary => write!(f, "binary content is not accepted"),
            Rejection::SensitiveData { patterns } => {
                write!(f, "content contains sensitive data ({})", patterns.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizeResult {
    pub allowed: bool,
    /// Empty when rejected.
    pub text: String,
    pub warnings: Vec<String>,
    pub rejection: Option<Rejection>,
    pub truncated: bool,
}

impl SanitizeResult {
    fn rejected(rejection: Rejection, warnings: Vec<String>) -> Self {
        Self {
            allowed: false,
            text: String::new(),
            warnings,
            rejection: Some(rejection),
            truncated: false,
        }
    }
}

/// How the payload should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    /// Plain text, JSON, command output: stripping still applies, no extraction.
    Text,
    /// Decide from the bytes.
    Sniff,
}

impl ContentKind {
    /// From a `Content-Type` header value.
    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type.to_lowercase();
        if ct.contains("text/html") || ct.contains("application/xhtml") {
            ContentKind::Html
        } else if ct.contains("text/") || ct.contains("json") || ct.contains("xml") {
            ContentKind::Text
        } else {
            ContentKind::Sniff
        }
    }
}

pub struct ContentSanitizer {
    store: Arc<PolicyStore>,
    filters: HtmlFilters,
}

impl ContentSanitizer {
    pub fn new(store: Arc<PolicyStore>) -> Result<Self, regex::Error> {
        Ok(Self {
            store,
            filters: HtmlFilters::new()?,
        })
    }

    /// Sanitizes a fetched payload, sniffing whether it is HTML.
    pub fn sanitize(&self, raw: &[u8], source_url: &str) -> SanitizeResult {
        self.sanitize_as(raw, source_url, ContentKind::Sniff)
    }

    pub fn sanitize_as(&self, raw: &[u8], source_url: &str, kind: ContentKind) -> SanitizeResult {
        let policy = self.store.policy();
        let rules = &policy.content;

        if raw.len() > rules.max_raw_bytes {
            warn!(
                "Rejecting {} bytes from {source_url} (limit {})",
                raw.len(),
                rules.max_raw_bytes
            );
            return SanitizeResult::rejected(
                Rejection::TooLarge {
                    size: raw.len(),
                    max: rules.max_raw_bytes,
                },
                Vec::new(),
            );
        }

        let decoded = String::from_utf8_lossy(raw);
        if is_binary(&decoded) {
            return SanitizeResult::rejected(Rejection::Binary, Vec::new());
        }

        let mut warnings = Vec::new();
        let (stripped, stats) = if self.filters.has_markup(&decoded) {
            self.filters.strip_active(&decoded, rules)
        } else {
            (decoded.to_string(), StripStats::default())
        };
        if stats.total() > 0 {
            debug!("Stripped active content from {source_url}: {stats:?}");
            warnings.push(format!(
                "removed active content ({} script, {} style, {} embed, {} handler, {} unsafe URL, {} comment)",
                stats.scripts, stats.styles, stats.embeds, stats.handlers, stats.unsafe_urls, stats.comments
            ));
        }

        let is_html = match kind {
            ContentKind::Html => true,
            ContentKind::Text => false,
            ContentKind::Sniff => self.filters.looks_like_html(&decoded),
        };
        let text = if rules.extract_text && is_html {
            self.filters.extract_text(&stripped, rules.preserve_links)
        } else {
            stripped
        };

        self.finish(&policy, text, warnings, source_url)
    }

    /// Sanitizes command output: no markup handling, same size, binary,
    /// sensitive data and length rules.
    pub fn sanitize_text(&self, raw: &[u8], source: &str) -> SanitizeResult {
        let policy = self.store.policy();
        let rules = &policy.content;

        if raw.len() > rules.max_raw_bytes {
            return SanitizeResult::rejected(
                Rejection::TooLarge {
                    size: raw.len(),
                    max: rules.max_raw_bytes,
                },
                Vec::new(),
            );
        }
        let text = String::from_utf8_lossy(raw).into_owned();
        if is_binary(&text) {
            return SanitizeResult::rejected(Rejection::Binary, Vec::new());
        }
        self.finish(&policy, text, Vec::new(), source)
    }

    fn finish(
        &self,
        policy: &Policy,
        text: String,
        mut warnings: Vec<String>,
        source: &str,
    ) -> SanitizeResult {
        let rules = &policy.content;

        let blocking = matching_patterns(policy, &rules.block_on, &text);
        if !blocking.is_empty() {
            warn!(
                "Rejecting content from {source}: sensitive pattern(s) {}",
                blocking.join(", ")
            );
            return SanitizeResult::rejected(Rejection::SensitiveData { patterns: blocking }, warnings);
        }

        for name in matching_patterns(policy, &rules.warn_on, &text) {
            warnings.push(format!("content matches sensitive pattern '{name}'"));
        }

        let (text, truncated) = truncate_chars(text, rules.max_text_chars);
        if truncated {
            warnings.push(format!(
                "content truncated at {} characters",
                rules.max_text_chars
            ));
        }

        SanitizeResult {
            allowed: true,
            text,
            warnings,
            rejection: None,
            truncated,
        }
    }
}

/// A NUL in the first 512 characters means binary.
fn is_binary(text: &str) -> bool {
    text.chars().take(512).any(|c| c == '\0')
}

/// Names from `names` whose catalog pattern matches `text`. Unknown or
/// disabled names are skipped.
fn matching_patterns(policy: &Policy, names: &[String], text: &str) -> Vec<String> {
    names
        .iter()
        .filter(|name| {
            policy
                .catalog
                .get(name)
                .is_some_and(|p| p.enabled && !p.find_spans(text).is_empty())
        })
        .cloned()
        .collect()
}

fn truncate_chars(text: String, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut text = text;
            text.truncate(cut);
            text.push_str(&format!("\n\n[Content truncated at {max_chars} characters]"));
            (text, true)
        }
        None => (text, false),
    }
}
