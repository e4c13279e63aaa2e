//! HTML neutralisation and text extraction.
//!
//! Stripping parses the payload with an HTML5 tokenizer (`scraper`) and
//! re-serializes the resulting tree, leaving out dropped elements and
//! attributes. Nothing from the input reaches the output as markup unless
//! it was parsed as a kept element, so split or nested tags cannot
//! reassemble into a live one. Attribute values are checked after the
//! parser has decoded their entities.
//!
//! Text extraction goes through `html2text`, whose link footnotes are
//! rewritten inline as `[text](url)`.

use regex::{Captures, Regex};
use scraper::{Html, Node};
use tracing::warn;

use crate::policy::ContentRules;

/// Render width handed to html2text. Wide enough that link targets are
/// never wrapped.
const EXTRACT_WIDTH: usize = 1_000;

/// Elements whose whole subtree is removed with `strip_embeds`.
const EMBED_ELEMENTS: &[&str] = &[
    "iframe", "object", "applet", "embed", "frame", "frameset", "svg", "math", "base", "meta",
    "link", "portal", "template",
];

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Children of these are raw text and must not be escaped.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "xmp", "noembed", "noframes", "plaintext"];

/// Attributes that carry a URL.
const URL_ATTRIBUTES: &[&str] = &[
    "href", "src", "action", "formaction", "poster", "background", "data", "lowsrc", "dynsrc",
    "ping", "cite", "srcset",
];

const UNSAFE_SCHEMES: &[&str] = &["javascript:", "vbscript:", "data:"];

/// Counts of what `strip_active` removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StripStats {
    pub scripts: usize,
    pub styles: usize,
    pub comments: usize,
    pub embeds: usize,
    pub handlers: usize,
    pub unsafe_urls: usize,
}

impl StripStats {
    pub fn total(&self) -> usize {
        self.scripts + self.styles + self.comments + self.embeds + self.handlers + self.unsafe_urls
    }
}

enum ElementAction {
    Keep,
    /// Drop the tags, keep the children.
    Unwrap,
    Drop,
}

pub struct HtmlFilters {
    markup: Regex,
    sniff: Regex,
    footnote: Regex,
    link_ref: Regex,
}

impl HtmlFilters {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            markup: Regex::new(r"<[a-zA-Z!/?]")?,
            sniff: Regex::new(
                r"(?i)<(?:!doctype|html|head|body|p|div|span|a|script|style|table|br|ul|li|h[1-6])\b",
            )?,
            footnote: Regex::new(r"(?m)^\[(\d+)\]: (\S*)[ \t]*$")?,
            link_ref: Regex::new(r"\[([^\]\n]*)\]\[(\d+)\]")?,
        })
    }

    pub fn looks_like_html(&self, text: &str) -> bool {
        self.sniff.is_match(text)
    }

    /// Whether anything in `text` could be parsed as a tag or comment.
    pub fn has_markup(&self, text: &str) -> bool {
        self.markup.is_match(text)
    }

    /// Removes active content according to `rules` and returns the
    /// re-serialized markup.
    pub fn strip_active(&self, html: &str, rules: &ContentRules) -> (String, StripStats) {
        let fragment = Html::parse_fragment(html);
        let root = fragment.root_element();
        let mut stats = StripStats::default();
        let mut out = String::with_capacity(html.len());

        // (node, closing) pairs; explicit stack so nesting depth is unbounded
        let mut stack: Vec<_> = root.children().map(|n| (n, false)).collect();
        stack.reverse();

        while let Some((node, closing)) = stack.pop() {
            match node.value() {
                Node::Element(el) if closing => {
                    out.push_str("</");
                    out.push_str(el.name());
                    out.push('>');
                }
                Node::Element(el) => {
                    let name = el.name();
                    match element_action(name, rules, &mut stats) {
                        ElementAction::Drop => continue,
                        ElementAction::Unwrap => {}
                        ElementAction::Keep => {
                            out.push('<');
                            out.push_str(name);
                            for (attr, value) in el.attrs() {
                                write_attribute(&mut out, attr, value, rules, &mut stats);
                            }
                            out.push('>');
                            if VOID_ELEMENTS.contains(&name) {
                                continue;
                            }
                            stack.push((node, true));
                        }
                    }
                    let children: Vec<_> = node.children().collect();
                    stack.extend(children.into_iter().rev().map(|n| (n, false)));
                }
                Node::Text(text) => {
                    let raw = node
                        .parent()
                        .and_then(|p| p.value().as_element())
                        .is_some_and(|p| RAW_TEXT_ELEMENTS.contains(&p.name()));
                    if raw {
                        out.push_str(text);
                    } else {
                        escape_into(&mut out, text, false);
                    }
                }
                Node::Comment(comment) => {
                    if rules.strip_comments {
                        stats.comments += 1;
                    } else {
                        out.push_str("<!--");
                        out.push_str(&comment.replace("--", "- -"));
                        out.push_str("-->");
                    }
                }
                _ => {}
            }
        }

        (out, stats)
    }

    /// Plain text from (already stripped) HTML.
    pub fn extract_text(&self, html: &str, preserve_links: bool) -> String {
        let rendered = match html2text::from_read(html.as_bytes(), EXTRACT_WIDTH) {
            Ok(text) => text,
            Err(e) => {
                warn!("Text extraction failed ({e}), keeping stripped markup");
                return collapse_whitespace(html);
            }
        };
        collapse_whitespace(&self.inline_links(&rendered, preserve_links))
    }

    /// Rewrites html2text's `[label][N]` references and `[N]: url`
    /// footnotes as inline `[label](url)`, or as bare labels.
    pub fn inline_links(&self, rendered: &str, preserve_links: bool) -> String {
        let targets: Vec<(String, String)> = self
            .footnote
            .captures_iter(rendered)
            .map(|caps| (caps[1].to_string(), caps[2].to_string()))
            .collect();
        let body = self.footnote.replace_all(rendered, "");

        self.link_ref
            .replace_all(&body, |caps: &Captures| {
                let label = caps[1].trim();
                let href = targets
                    .iter()
                    .find(|(n, _)| *n == caps[2])
                    .map(|(_, url)| url.as_str())
                    .unwrap_or_default();
                if preserve_links {
                    render_link(label, href)
                } else {
                    label.to_string()
                }
            })
            .into_owned()
    }
}

fn element_action(name: &str, rules: &ContentRules, stats: &mut StripStats) -> ElementAction {
    match name {
        "script" if rules.strip_scripts => {
            stats.scripts += 1;
            ElementAction::Drop
        }
        // No scripting means noscript content is what a browser would show
        "noscript" if rules.strip_scripts => ElementAction::Unwrap,
        "style" if rules.strip_styles => {
            stats.styles += 1;
            ElementAction::Drop
        }
        _ if rules.strip_embeds && EMBED_ELEMENTS.contains(&name) => {
            stats.embeds += 1;
            ElementAction::Drop
        }
        // Names the tokenizer accepted but no serializer could round-trip
        _ if !is_plain_name(name) => ElementAction::Unwrap,
        _ => ElementAction::Keep,
    }
}

fn is_plain_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn write_attribute(out: &mut String, name: &str, value: &str, rules: &ContentRules, stats: &mut StripStats) {
    let lower = name.to_ascii_lowercase();
    if rules.strip_event_handlers && lower.starts_with("on") {
        stats.handlers += 1;
        return;
    }
    // Namespaced and malformed names (`xlink:href`, `"x`) are dropped
    if !is_plain_name(&lower) {
        return;
    }
    let unsafe_value = rules.strip_scripts
        && (lower == "srcdoc" || (URL_ATTRIBUTES.contains(&lower.as_str()) && is_unsafe_url(value)));
    let value = if unsafe_value {
        stats.unsafe_urls += 1;
        "#"
    } else {
        value
    };
    out.push(' ');
    out.push_str(&lower);
    out.push_str("=\"");
    escape_into(out, value, true);
    out.push('"');
}

/// Browsers ignore ASCII whitespace and control characters inside a
/// scheme, so `java\tscript:` is still `javascript:`.
fn is_unsafe_url(value: &str) -> bool {
    let normalized: String = value
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && !c.is_ascii_control())
        .collect::<String>()
        .to_ascii_lowercase();
    UNSAFE_SCHEMES.iter().any(|s| normalized.starts_with(s))
}

fn escape_into(out: &mut String, text: &str, attribute: bool) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            c => out.push(c),
        }
    }
}

fn render_link(label: &str, href: &str) -> String {
    if href.is_empty() || href.starts_with('#') {
        return label.to_string();
    }
    if label.is_empty() {
        return format!("[{href}]({href})");
    }
    format!("[{label}]({href})")
}

/// Collapses runs of spaces inside lines, trims lines, and keeps at most
/// one blank line between paragraphs.
pub fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line
            .split(|c: char| c.is_whitespace())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        out.push_str(&line);
        blank_run = 0;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> HtmlFilters {
        HtmlFilters::new().unwrap()
    }

    fn rules() -> ContentRules {
        ContentRules::default()
    }

    fn strip(html: &str) -> String {
        filters().strip_active(html, &rules()).0
    }

    // ── Stripping ───────────────────────────────────────

    #[test]
    fn test_strip_script_block() {
        let (out, stats) = filters().strip_active("<script>evil()</script><p>hi</p>", &rules());
        assert_eq!(out, "<p>hi</p>");
        assert_eq!(stats.scripts, 1);
    }

    #[test]
    fn test_strip_unterminated_script() {
        assert_eq!(strip("<p>ok</p><SCRIPT type=x>steal(document.cookie)"), "<p>ok</p>");
    }

    #[test]
    fn test_strip_style_comment_embed() {
        let html = "<style>body{}</style><!-- secret --><iframe src=x></iframe><embed src=y><p>t</p>";
        let (out, stats) = filters().strip_active(html, &rules());
        assert_eq!(out, "<p>t</p>");
        assert_eq!(stats.styles, 1);
        assert_eq!(stats.comments, 1);
        assert_eq!(stats.embeds, 2);
    }

    #[test]
    fn test_strip_event_handlers_inside_tags_only() {
        let html = r#"<img src="a.png" onerror="x()" ONLOAD='y()'><p>going online = fine</p>"#;
        let (out, stats) = filters().strip_active(html, &rules());
        assert_eq!(out, r#"<img src="a.png"><p>going online = fine</p>"#);
        assert_eq!(stats.handlers, 2);
    }

    #[test]
    fn test_neutralise_javascript_urls() {
        let html = r#"<a href="javascript:alert(1)">x</a><a href='https://ok'>y</a>"#;
        let (out, stats) = filters().strip_active(html, &rules());
        assert_eq!(out, r##"<a href="#">x</a><a href="https://ok">y</a>"##);
        assert_eq!(stats.unsafe_urls, 1);
    }

    #[test]
    fn test_disabled_rules_keep_content() {
        let mut rules = rules();
        rules.strip_styles = false;
        let (out, _) = filters().strip_active("<style>p > a{}</style>", &rules);
        assert_eq!(out, "<style>p > a{}</style>");
    }

    // ── Adversarial markup ──────────────────────────────

    #[test]
    fn test_nested_tags_do_not_reassemble() {
        let out = strip("<scr<script>x</script>ipt>evil()</script><p>hi</p>");
        assert!(!out.to_lowercase().contains("<script"), "{out}");
        assert!(out.ends_with("<p>hi</p>"), "{out}");
    }

    #[test]
    fn test_slash_separated_handler_is_removed() {
        let (out, stats) = filters().strip_active("<img/onerror=evil()><svg/onload=evil()>", &rules());
        assert_eq!(out, "<img>");
        assert_eq!(stats.handlers, 1);
    }

    #[test]
    fn test_quoted_gt_does_not_end_the_tag() {
        let out = strip(r#"<img alt=">" onerror="evil()">"#);
        assert_eq!(out, r#"<img alt="&gt;">"#);
    }

    #[test]
    fn test_entity_encoded_javascript_url() {
        let out = strip(r#"<a href="java&#x09;script:alert(1)">x</a><a href=" JaVaScRiPt:alert(2)">y</a>"#);
        assert_eq!(out, r##"<a href="#">x</a><a href="#">y</a>"##);
    }

    #[test]
    fn test_escaped_text_stays_text() {
        let out = strip("<p>&lt;script&gt;alert(1)&lt;/script&gt;</p>");
        assert_eq!(out, "<p>&lt;script&gt;alert(1)&lt;/script&gt;</p>");
    }

    #[test]
    fn test_deep_nesting() {
        let html = format!("{}x{}", "<div>".repeat(5_000), "</div>".repeat(5_000));
        let out = strip(&html);
        assert!(out.contains('x'));
    }

    // ── Extraction ──────────────────────────────────────

    #[test]
    fn test_extract_preserves_links() {
        let html = r#"<p>See <a href="https://docs.rs/regex">the regex docs</a>.</p>"#;
        let text = filters().extract_text(html, true);
        assert!(text.contains("https://docs.rs/regex"), "{text}");
        assert!(text.contains("the regex docs"), "{text}");
    }

    #[test]
    fn test_extract_without_links() {
        let html = r#"<p>See <a href="https://docs.rs">docs</a></p>"#;
        let text = filters().extract_text(html, false);
        assert!(text.contains("docs"));
        assert!(!text.contains("https://docs.rs"), "{text}");
    }

    #[test]
    fn test_extract_has_no_markup() {
        let html = "<h1>Title</h1><p>one   two</p><ul><li>alpha</li><li>beta</li></ul>";
        let text = filters().extract_text(html, true);
        assert!(!text.contains('<'));
        assert!(text.contains("Title"));
        assert!(text.contains("one two"));
        let alpha = text.find("alpha").unwrap();
        let beta = text.find("beta").unwrap();
        assert!(text[alpha..beta].contains('\n'));
    }

    #[test]
    fn test_extract_decodes_entities() {
        let html = "<p>Gr&ouml;&szlig;e &hearts; &Eacute;t&eacute; &amp; &#233;t&#xE9;</p>";
        assert_eq!(filters().extract_text(html, true), "Größe ♥ Été & été");
    }

    // ── Link footnotes ──────────────────────────────────

    #[test]
    fn test_inline_links_rewrites_footnotes() {
        let rendered = "Read [the book][1] and [this][2].\n\n[1]: https://doc.rust-lang.org/book/\n[2]: #top\n";
        let f = filters();
        assert_eq!(
            collapse_whitespace(&f.inline_links(rendered, true)),
            "Read [the book](https://doc.rust-lang.org/book/) and this."
        );
        assert_eq!(
            collapse_whitespace(&f.inline_links(rendered, false)),
            "Read the book and this."
        );
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a \t b \n\n\n\n c  "), "a b\n\nc");
        assert_eq!(collapse_whitespace("x\u{a0}\u{a0}y"), "x y");
    }

    #[test]
    fn test_sniffing() {
        let f = filters();
        assert!(f.looks_like_html("<!DOCTYPE html><html>"));
        assert!(f.looks_like_html("text <p>para</p>"));
        assert!(!f.looks_like_html("{\"a\": 1 < 2}"));
        assert!(f.has_markup("plain <img/onerror=x>"));
        assert!(!f.has_markup("{\"a\": 1 < 2}"));
    }
}
