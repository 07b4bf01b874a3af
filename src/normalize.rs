//! Page body normalization.
//!
//! Converts the source's rendered export HTML into plain indexable text:
//! markup is stripped, block-level boundaries become line breaks, and
//! whitespace runs collapse to single spaces. The function is deterministic
//! and idempotent — already-plain text passes through unchanged.

/// Tags whose entire content is dropped, not just the markup.
const DROPPED_SUBTREES: [&str; 2] = ["script", "style"];

/// Tags that mark a paragraph-level boundary in the rendered output.
const BLOCK_TAGS: [&str; 16] = [
    "p", "div", "br", "li", "ul", "ol", "tr", "table", "h1", "h2", "h3", "h4", "h5", "h6",
    "blockquote", "pre",
];

/// Tags that separate inline cells; replaced by a space so adjacent cell
/// text does not run together.
const CELL_TAGS: [&str; 2] = ["td", "th"];

/// Strip markup from a rendered page body and return plain text.
///
/// Paragraph breaks survive as line breaks; within a line, whitespace runs
/// collapse to single spaces and the line is trimmed. Empty lines are
/// dropped, so the output is a newline-joined sequence of non-empty lines.
pub fn normalize(raw: &str) -> String {
    let stripped = strip_markup(raw);
    let mut lines: Vec<String> = Vec::new();
    for line in stripped.lines() {
        let collapsed = collapse_whitespace(line);
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n")
}

fn strip_markup(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'<' {
            if raw[i..].starts_with("<!--") {
                i = match raw[i..].find("-->") {
                    Some(pos) => i + pos + 3,
                    None => raw.len(),
                };
                continue;
            }
            match read_tag(raw, i) {
                Some((tag_name, is_closing, end)) => {
                    let name = tag_name.to_ascii_lowercase();
                    if !is_closing && DROPPED_SUBTREES.contains(&name.as_str()) {
                        // skip everything up to and including the close tag
                        i = skip_subtree(raw, end, &name);
                        continue;
                    }
                    if BLOCK_TAGS.contains(&name.as_str()) {
                        out.push('\n');
                    } else if CELL_TAGS.contains(&name.as_str()) {
                        out.push(' ');
                    }
                    i = end;
                }
                None => {
                    // lone '<' with no closing '>' — keep it as text
                    out.push('<');
                    i += 1;
                }
            }
        } else if bytes[i] == b'&' {
            let (decoded, end) = decode_entity(raw, i);
            out.push_str(&decoded);
            i = end;
        } else {
            let ch = raw[i..].chars().next().unwrap_or('\u{fffd}');
            out.push(ch);
            i += ch.len_utf8();
        }
    }

    out
}

/// Parse a tag starting at `start` (which points at `<`). Returns the tag
/// name, whether it is a closing tag, and the index just past the `>`.
fn read_tag(raw: &str, start: usize) -> Option<(String, bool, usize)> {
    let rest = &raw[start + 1..];
    // a tag name (or "/") must immediately follow the '<'; anything else is text
    if !rest
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '/')
    {
        return None;
    }
    let close = rest.find('>')?;
    let inner = rest[..close].trim();
    let (is_closing, inner) = match inner.strip_prefix('/') {
        Some(stripped) => (true, stripped),
        None => (false, inner),
    };
    let name: String = inner
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    Some((name, is_closing, start + 1 + close + 1))
}

fn skip_subtree(raw: &str, from: usize, tag: &str) -> usize {
    let haystack = raw[from..].to_ascii_lowercase();
    let close = format!("</{tag}");
    match haystack.find(&close) {
        Some(pos) => {
            let after = from + pos;
            match raw[after..].find('>') {
                Some(gt) => after + gt + 1,
                None => raw.len(),
            }
        }
        None => raw.len(),
    }
}

/// Decode the handful of entities the source emits in export HTML.
/// Unknown entities pass through literally.
fn decode_entity(raw: &str, start: usize) -> (String, usize) {
    let rest = &raw[start..];
    let candidates: [(&str, &str); 6] = [
        ("&amp;", "&"),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
        ("&nbsp;", " "),
    ];
    for (entity, replacement) in candidates {
        if rest.starts_with(entity) {
            return (replacement.to_string(), start + entity.len());
        }
    }
    ("&".to_string(), start + 1)
}

fn collapse_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_inline_markup() {
        let html = "<p>Hello <b>world</b></p>";
        assert_eq!(normalize(html), "Hello world");
    }

    #[test]
    fn block_tags_become_line_breaks() {
        let html = "<h1>Title</h1><p>First paragraph.</p><p>Second paragraph.</p>";
        assert_eq!(normalize(html), "Title\nFirst paragraph.\nSecond paragraph.");
    }

    #[test]
    fn whitespace_runs_collapse() {
        let html = "<p>too    many\t spaces</p>";
        assert_eq!(normalize(html), "too many spaces");
    }

    #[test]
    fn script_and_style_content_is_dropped() {
        let html = "<p>keep</p><script>var x = 1;</script><style>.a{}</style><p>this</p>";
        assert_eq!(normalize(html), "keep\nthis");
    }

    #[test]
    fn entities_are_decoded() {
        let html = "<p>a &amp; b &lt;c&gt; &quot;d&quot; e&nbsp;f</p>";
        assert_eq!(normalize(html), "a & b <c> \"d\" e f");
    }

    #[test]
    fn idempotent_on_plain_text() {
        let plain = "Line one\nLine two with words";
        assert_eq!(normalize(plain), plain);
        assert_eq!(normalize(&normalize(plain)), normalize(plain));
    }

    #[test]
    fn idempotent_on_normalized_html() {
        let html = "<div><p>alpha   beta</p>\n\n<p>gamma</p></div>";
        let once = normalize(html);
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn empty_input_is_empty() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("<p></p><div></div>"), "");
    }

    #[test]
    fn lone_angle_bracket_survives() {
        assert_eq!(normalize("a < b"), "a < b");
    }

    #[test]
    fn comments_are_dropped() {
        assert_eq!(normalize("before<!-- note: a > b -->after"), "beforeafter");
    }

    #[test]
    fn nested_table_rows_break_lines() {
        let html = "<table><tr><td>r1c1</td><td>r1c2</td></tr><tr><td>r2c1</td></tr></table>";
        assert_eq!(normalize(html), "r1c1 r1c2\nr2c1");
    }
}
