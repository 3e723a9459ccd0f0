//! Per-channel renderers (§4.5). Each takes an already fully-interpolated
//! and recursively-expanded body/subject pair and produces the shape the
//! Dispatch Adapter hands to the Delivery Provider for that channel.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::model::Channel;

use super::sanitize;

const MAX_EMAIL_BODY_BYTES: usize = 100 * 1024;
const SMS_MAX_CHARS: usize = 160;

#[derive(Debug, Clone, Serialize)]
pub struct EmailRender {
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InAppRender {
    pub html_body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmsRender {
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushRender {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRender {
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "channel", rename_all = "UPPERCASE")]
pub enum ChannelRender {
    Email(EmailRender),
    InApp(InAppRender),
    Sms(SmsRender),
    Push(PushRender),
    Chat(ChatRender),
}

fn subject_line_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"(?im)^Subject:\s*(.+?)\r?\n").expect("static regex is valid")
    })
}

/// Extracts an inline `Subject: ...` line from the body when the workflow
/// has no separate subject template (§4.5 EMAIL). Returns the remaining
/// body with that line stripped, and the subject if one was found.
fn extract_inline_subject(body: &str) -> (Option<String>, String) {
    match subject_line_pattern().captures(body) {
        Some(caps) => {
            let subject = caps.get(1).map(|m| m.as_str().trim().to_string());
            let full_match = caps.get(0).expect("group 0 always present");
            let mut remaining = String::with_capacity(body.len());
            remaining.push_str(&body[..full_match.start()]);
            remaining.push_str(&body[full_match.end()..]);
            (subject, remaining)
        }
        None => (None, body.to_string()),
    }
}

pub struct EmailOptions {
    pub subject_prefix: Option<String>,
    pub include_text_version: bool,
}

impl Default for EmailOptions {
    fn default() -> Self {
        Self {
            subject_prefix: None,
            include_text_version: true,
        }
    }
}

pub fn render_email(rendered_body: &str, rendered_subject: Option<&str>, opts: &EmailOptions) -> EmailRender {
    let (subject, body) = match rendered_subject {
        Some(subject) => (subject.to_string(), rendered_body.to_string()),
        None => {
            let (inline, stripped) = extract_inline_subject(rendered_body);
            (inline.unwrap_or_default(), stripped)
        }
    };

    let subject = match &opts.subject_prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}{subject}"),
        _ => subject,
    };

    let mut html_body = sanitize::sanitize_rich_text(&body);
    if html_body.len() > MAX_EMAIL_BODY_BYTES {
        let mut boundary = MAX_EMAIL_BODY_BYTES;
        while !html_body.is_char_boundary(boundary) {
            boundary -= 1;
        }
        html_body.truncate(boundary);
    }

    let text_body = opts
        .include_text_version
        .then(|| sanitize::html_to_text(&html_body));

    EmailRender {
        subject,
        html_body,
        text_body,
    }
}

pub fn render_in_app(rendered_body: &str) -> InAppRender {
    InAppRender {
        html_body: sanitize::sanitize_rich_text(rendered_body),
    }
}

pub fn render_sms(rendered_body: &str) -> SmsRender {
    SmsRender {
        body: sanitize::render_sms_body(rendered_body),
    }
}

pub fn render_push(rendered_title: &str, rendered_body: &str) -> PushRender {
    PushRender {
        title: sanitize::html_to_text(rendered_title),
        body: sanitize::html_to_text(rendered_body),
    }
}

pub fn render_chat(rendered_body_markdown: &str) -> ChatRender {
    let mut html = String::new();
    let parser = pulldown_cmark::Parser::new(rendered_body_markdown);
    pulldown_cmark::html::push_html(&mut html, parser);
    ChatRender {
        body: sanitize::sanitize_rich_text(&html),
    }
}

/// Dispatches to the right per-channel renderer given the already
/// interpolated body/subject/title strings for that channel.
pub fn render_for_channel(
    channel: Channel,
    body: &str,
    subject: Option<&str>,
    title: Option<&str>,
    email_opts: &EmailOptions,
) -> ChannelRender {
    match channel {
        Channel::Email => ChannelRender::Email(render_email(body, subject, email_opts)),
        Channel::InApp => ChannelRender::InApp(render_in_app(body)),
        Channel::Sms => ChannelRender::Sms(render_sms(body)),
        Channel::Push => ChannelRender::Push(render_push(title.unwrap_or_default(), body)),
        Channel::Chat => ChannelRender::Chat(render_chat(body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_inline_subject_and_strips_line() {
        let body = "Subject: Welcome {{ name }}\nBody text here.";
        let (subject, remaining) = extract_inline_subject(body);
        assert_eq!(subject, Some("Welcome {{ name }}".to_string()));
        assert_eq!(remaining, "Body text here.");
    }

    #[test]
    fn no_inline_subject_leaves_body_untouched() {
        let body = "Just a body, no subject line.";
        let (subject, remaining) = extract_inline_subject(body);
        assert_eq!(subject, None);
        assert_eq!(remaining, body);
    }

    #[test]
    fn email_render_applies_prefix_and_sanitizes() {
        let opts = EmailOptions {
            subject_prefix: Some("[ACME] ".to_string()),
            include_text_version: true,
        };
        let render = render_email("<p>Hi</p><script>x</script>", Some("Hello"), &opts);
        assert_eq!(render.subject, "[ACME] Hello");
        assert!(!render.html_body.to_ascii_lowercase().contains("<script"));
        assert_eq!(render.text_body.unwrap(), "Hi");
    }

    #[test]
    fn sms_caps_at_160_chars() {
        let long = "a".repeat(300);
        let render = render_sms(&long);
        assert_eq!(render.body.chars().count(), SMS_MAX_CHARS);
    }

    #[test]
    fn chat_renders_markdown_then_sanitizes() {
        let render = render_chat("**bold** <script>alert(1)</script>");
        assert!(render.body.contains("<strong>bold</strong>"));
        assert!(!render.body.to_ascii_lowercase().contains("<script"));
    }
}
