//! HTML sanitization (§4.5 "HTML sanitizer" / per-channel renderers).
//!
//! `strip_dangerous_blocks` is a loop-based pass (not a single regex
//! sweep) that repeatedly removes `<script>…</script>` and
//! `<style>…</style>` blocks until the input stabilizes, defeating
//! incomplete-multi-character bypasses such as `<scr<script>ipt>`. The
//! IN_APP/CHAT allow-list sanitizer is then layered on top via `ammonia`,
//! the same whitelist-based HTML sanitizer the closest retrieved example
//! (a native notification crate) depends on for exactly this purpose.

use std::sync::OnceLock;

use regex::Regex;

fn script_or_style_block() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"(?is)<\s*(script|style)\b[^>]*>.*?<\s*/\s*(script|style)\s*>")
            .expect("static regex is valid")
    })
}

fn dangling_tag_open() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(r"(?is)<\s*(script|style)\b[^>]*>").expect("static regex is valid"))
}

/// Repeatedly strips `<script>`/`<style>` blocks (and any dangling opening
/// tag without a matching close) until the string stops changing. Bounded
/// by the input length so a pathological input cannot loop unboundedly.
pub fn strip_dangerous_blocks(input: &str) -> String {
    let mut current = input.to_string();
    let max_iterations = current.len().max(16);
    for _ in 0..max_iterations {
        let once = script_or_style_block().replace_all(&current, "").into_owned();
        let once = dangling_tag_open().replace_all(&once, "").into_owned();
        if once == current {
            return once;
        }
        current = once;
    }
    current
}

fn ammonia_builder<'a>() -> ammonia::Builder<'a> {
    let mut builder = ammonia::Builder::default();
    builder
        .tags(
            [
                "a", "b", "strong", "i", "em", "u", "p", "br", "ul", "ol", "li", "blockquote",
                "h1", "h2", "h3", "h4", "h5", "h6", "span", "div", "code", "pre", "hr",
            ]
            .into_iter()
            .collect(),
        )
        .rm_tags(["table", "img", "iframe", "form", "style", "script"])
        .generic_attributes(["class"].into_iter().collect())
        .link_rel(Some("noopener noreferrer"))
        .url_schemes(["http", "https", "mailto"].into_iter().collect());
    builder
}

/// IN_APP / CHAT allow-list sanitizer (§4.5): no `table`, `img`, `style`
/// attributes, `iframe`, `form`, event handlers, or `javascript:` URLs.
/// External anchors get `target="_blank" rel="noopener noreferrer"
/// data-external-link="true"`.
pub fn sanitize_rich_text(html: &str) -> String {
    let pre_cleaned = strip_dangerous_blocks(html);
    let cleaned = ammonia_builder().clean(&pre_cleaned).to_string();
    annotate_external_links(&cleaned)
}

fn external_anchor_href() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r#"(?is)<a\s+([^>]*?)href="(https?://[^"]*)"([^>]*)>"#).expect("static regex is valid")
    })
}

fn annotate_external_links(html: &str) -> String {
    external_anchor_href()
        .replace_all(html, |caps: &regex::Captures| {
            let before = &caps[1];
            let href = &caps[2];
            let after = &caps[3];
            let combined = format!("{before} {after}");
            if combined.contains("data-external-link") {
                caps[0].to_string()
            } else {
                format!(
                    r#"<a {before}href="{href}"{after} target="_blank" rel="noopener noreferrer" data-external-link="true">"#
                )
            }
        })
        .into_owned()
}

/// Strips all markup, leaving plain text — used for the EMAIL text
/// fallback and as the first stage of SMS rendering.
pub fn html_to_text(html: &str) -> String {
    let stripped = strip_dangerous_blocks(html);
    let mut builder = ammonia::Builder::default();
    builder.tags(std::collections::HashSet::new());
    let text = builder.clean(&stripped).to_string();
    collapse_whitespace(&html_escape::decode_html_entities(&text))
}

fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = false;
    for c in input.trim().chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

/// SMS channel render (§4.5): strip HTML, normalize whitespace, cap at 160
/// characters with a trailing ellipsis when truncated.
pub fn render_sms_body(body_html: &str) -> String {
    let text = html_to_text(body_html);
    truncate_with_ellipsis(&text, 160)
}

fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(1);
    let truncated: String = text.chars().take(keep).collect();
    format!("{truncated}…")
}

/// Raw, pre-sanitization check used by the EMAIL validator (§4.5: "Rejects
/// body containing `<script>` as invalid before send").
pub fn contains_script_tag(raw: &str) -> bool {
    raw.to_ascii_lowercase().contains("<script")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_simple_script_tag() {
        let out = strip_dangerous_blocks("<p>Hi</p><script>alert(1)</script>");
        assert!(!out.to_ascii_lowercase().contains("<script"));
        assert!(out.contains("<p>Hi</p>"));
    }

    #[test]
    fn strips_nested_incomplete_bypass() {
        let out = strip_dangerous_blocks("<scr<script>ipt>alert(1)</script>");
        assert!(!out.to_ascii_lowercase().contains("<script"));
    }

    #[test]
    fn sanitizer_strips_table_img_iframe_form_and_events() {
        let html = r#"<table><tr><td>x</td></tr></table><img src=x onerror=alert(1)><iframe src=evil></iframe><form></form><p onclick="alert(1)">hi</p>"#;
        let out = sanitize_rich_text(html);
        assert!(!out.contains("<table"));
        assert!(!out.contains("<img"));
        assert!(!out.contains("<iframe"));
        assert!(!out.contains("<form"));
        assert!(!out.contains("onclick"));
        assert!(!out.to_ascii_lowercase().contains("<style"));
    }

    #[test]
    fn sanitizer_blocks_javascript_urls() {
        let html = r#"<a href="javascript:alert(1)">click</a>"#;
        let out = sanitize_rich_text(html);
        assert!(!out.to_ascii_lowercase().contains("javascript:"));
    }

    #[test]
    fn sanitizer_annotates_external_links() {
        let html = r#"<a href="https://example.com">ext</a>"#;
        let out = sanitize_rich_text(html);
        assert!(out.contains("target=\"_blank\""));
        assert!(out.contains("data-external-link=\"true\""));
    }

    #[test]
    fn sms_render_caps_at_160_with_ellipsis() {
        let long = "x".repeat(200);
        let rendered = render_sms_body(&long);
        assert_eq!(rendered.chars().count(), 160);
        assert!(rendered.ends_with('…'));
    }

    #[test]
    fn sms_render_strips_html_and_collapses_whitespace() {
        let html = "<p>Hello   \n\n  World</p>";
        assert_eq!(render_sms_body(html), "Hello World");
    }

    #[test]
    fn detects_raw_script_tag() {
        assert!(contains_script_tag("<p>hi</p><SCRIPT>x</script>"));
        assert!(!contains_script_tag("<p>hi</p>"));
    }
}
