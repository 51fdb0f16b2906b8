//! Body normalization: HTML to searchable plain text.
//!
//! Script and style subtrees never contribute text. Quoted reply blocks
//! (`<blockquote>`) are dropped unless the message is a forward, where the
//! quoted part is the actual content. Forward detection goes through a
//! configurable subject-prefix table because the prefixes are localized
//! and no fixed list is complete.

use once_cell::sync::Lazy;

/// Common localized forward prefixes. Hosts extend or replace this table
/// via `TextConfig`.
static DEFAULT_FORWARD_PREFIXES: Lazy<Vec<String>> = Lazy::new(|| {
    ["fw:", "fwd:", "forward:", "tr:", "wg:", "rv:", "enc:", "vs:", "vb:", "doorst:", "i:"]
        .iter()
        .map(|s| s.to_string())
        .collect()
});

#[derive(Debug, Clone)]
pub struct TextConfig {
    /// Lowercase subject prefixes that mark a message as forwarded.
    pub forward_prefixes: Vec<String>,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            forward_prefixes: DEFAULT_FORWARD_PREFIXES.clone(),
        }
    }
}

/// Subject-based forward detection.
pub fn is_forwarded(subject: &str, cfg: &TextConfig) -> bool {
    let subject = subject.trim().to_lowercase();
    cfg.forward_prefixes.iter().any(|p| subject.starts_with(p.as_str()))
}

/// Render HTML to plain text suitable for keyword search.
///
/// Block-level line breaks survive; runs of inline whitespace collapse to
/// single spaces. `keep_quotes` controls whether `<blockquote>` subtrees
/// are preserved (forwarded messages) or dropped (quoted replies).
pub fn html_to_searchable_text(html: &str, keep_quotes: bool) -> String {
    let stripped = if keep_quotes {
        strip_subtrees(html, &["script", "style"])
    } else {
        strip_subtrees(html, &["script", "style", "blockquote"])
    };
    collapse_whitespace(&nanohtml2text::html2text(&stripped))
}

/// Normalize an already-plain body the same way rendered HTML comes out.
pub fn normalize_plain_text(text: &str) -> String {
    collapse_whitespace(text)
}

/// Remove the full subtree of each listed element, nesting-aware.
/// Tag names are ASCII, so matching is byte-wise case-insensitive and
/// every cut point lands on `<` or `>`, which are valid char boundaries.
fn strip_subtrees(html: &str, tags: &[&str]) -> String {
    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len());
    let mut seg_start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'<' {
            let hit = tags
                .iter()
                .find_map(|t| opens_at(bytes, i, t).map(|end| (*t, end)));
            if let Some((tag, after_open)) = hit {
                out.push_str(&html[seg_start..i]);

                let mut depth = 1usize;
                let mut j = after_open;
                while depth > 0 {
                    match next_lt(bytes, j) {
                        None => {
                            // Unclosed element: drop the rest.
                            j = bytes.len();
                            break;
                        }
                        Some(k) => {
                            if let Some(end) = opens_at(bytes, k, tag) {
                                depth += 1;
                                j = end;
                            } else if let Some(end) = closes_at(bytes, k, tag) {
                                depth -= 1;
                                j = end;
                            } else {
                                j = k + 1;
                            }
                        }
                    }
                }

                i = j;
                seg_start = j;
                continue;
            }
        }
        i += 1;
    }

    out.push_str(&html[seg_start..]);
    out
}

/// If `bytes[i..]` starts an opening tag for `tag`, return the index just
/// past its `>`.
fn opens_at(bytes: &[u8], i: usize, tag: &str) -> Option<usize> {
    let name = tag.as_bytes();
    if bytes.len() < i + 1 + name.len() || bytes[i] != b'<' {
        return None;
    }
    let candidate = &bytes[i + 1..i + 1 + name.len()];
    if !candidate.eq_ignore_ascii_case(name) {
        return None;
    }
    // Next byte must terminate the name ("<b" must not match "<blockquote").
    match bytes.get(i + 1 + name.len()) {
        Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') | Some(b'/') => {}
        _ => return None,
    }
    Some(end_of_tag(bytes, i + 1 + name.len()))
}

/// If `bytes[i..]` starts a closing tag for `tag`, return the index just
/// past its `>`.
fn closes_at(bytes: &[u8], i: usize, tag: &str) -> Option<usize> {
    let name = tag.as_bytes();
    if bytes.len() < i + 2 + name.len() || bytes[i] != b'<' || bytes[i + 1] != b'/' {
        return None;
    }
    let candidate = &bytes[i + 2..i + 2 + name.len()];
    if !candidate.eq_ignore_ascii_case(name) {
        return None;
    }
    match bytes.get(i + 2 + name.len()) {
        Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') | None => {}
        _ => return None,
    }
    Some(end_of_tag(bytes, i + 2 + name.len()))
}

fn end_of_tag(bytes: &[u8], from: usize) -> usize {
    let mut j = from;
    while j < bytes.len() && bytes[j] != b'>' {
        j += 1;
    }
    (j + 1).min(bytes.len())
}

fn next_lt(bytes: &[u8], from: usize) -> Option<usize> {
    bytes[from..].iter().position(|&b| b == b'<').map(|p| from + p)
}

fn collapse_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            // Keep at most one blank line between blocks.
            if lines.last().map(|l| l.is_empty()).unwrap_or(true) {
                continue;
            }
            lines.push(String::new());
        } else {
            lines.push(collapsed);
        }
    }
    while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_script_and_style() {
        let html = "<p>hello</p><script>var x = 1;</script><style>p { color: red }</style><p>world</p>";
        let text = html_to_searchable_text(html, false);
        assert!(text.contains("hello"));
        assert!(text.contains("world"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("color"));
    }

    #[test]
    fn test_drops_quoted_blockquote() {
        let html = "<p>my reply</p><blockquote>older message text</blockquote>";
        let text = html_to_searchable_text(html, false);
        assert!(text.contains("my reply"));
        assert!(!text.contains("older message"));
    }

    #[test]
    fn test_keeps_blockquote_for_forwards() {
        let html = "<p>see below</p><blockquote>the forwarded content</blockquote>";
        let text = html_to_searchable_text(html, true);
        assert!(text.contains("see below"));
        assert!(text.contains("the forwarded content"));
    }

    #[test]
    fn test_nested_blockquotes_removed_entirely() {
        let html = "<p>top</p><blockquote>outer<blockquote>inner</blockquote>tail</blockquote><p>bottom</p>";
        let text = html_to_searchable_text(html, false);
        assert!(text.contains("top"));
        assert!(text.contains("bottom"));
        assert!(!text.contains("outer"));
        assert!(!text.contains("inner"));
        assert!(!text.contains("tail"));
    }

    #[test]
    fn test_blockquote_with_attributes() {
        let html = r#"<p>a</p><blockquote type="cite" class="q">quoted</blockquote>"#;
        let text = html_to_searchable_text(html, false);
        assert!(!text.contains("quoted"));
    }

    #[test]
    fn test_b_tag_does_not_match_blockquote() {
        let html = "<p><b>bold</b> stays</p>";
        let text = html_to_searchable_text(html, false);
        assert!(text.contains("bold"));
        assert!(text.contains("stays"));
    }

    #[test]
    fn test_whitespace_collapses_but_blocks_survive() {
        let html = "<div>first   line</div>\n\n\n<div>second\t \tline</div>";
        let text = html_to_searchable_text(html, false);
        assert!(text.contains("first line"));
        assert!(text.contains("second line"));
    }

    #[test]
    fn test_collapse_whitespace_exact() {
        let raw = "first   line\n\n\n\nsecond \t line\n\n";
        assert_eq!(collapse_whitespace(raw), "first line\n\nsecond line");
    }

    #[test]
    fn test_unclosed_stripped_element_drops_tail() {
        let html = "<p>kept</p><blockquote>never closed";
        let text = html_to_searchable_text(html, false);
        assert_eq!(text, "kept");
    }

    #[test]
    fn test_forward_prefix_detection() {
        let cfg = TextConfig::default();
        assert!(is_forwarded("Fwd: budget", &cfg));
        assert!(is_forwarded("  FW: budget", &cfg));
        assert!(is_forwarded("Tr: budget", &cfg));
        assert!(!is_forwarded("Re: budget", &cfg));

        let custom = TextConfig {
            forward_prefixes: vec!["vidarebefordrat:".into()],
        };
        assert!(is_forwarded("Vidarebefordrat: hej", &custom));
        assert!(!is_forwarded("Fwd: hej", &custom));
    }

    #[test]
    fn test_plain_text_normalization() {
        let text = "line  one\n\n\n\nline   two\n\n";
        assert_eq!(normalize_plain_text(text), "line one\nline two");
    }
}
