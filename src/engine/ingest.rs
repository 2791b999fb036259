//! Text helpers shared by the mailbox and drop-folder importers.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    static ref TICKET_REF: Regex = Regex::new(r"(?i)Ticket\s*#\s*(\d+)").unwrap();
    static ref SCRIPT_BLOCK: Regex = Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap();
    static ref STYLE_BLOCK: Regex = Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap();
    static ref LINE_BREAK: Regex = Regex::new(r"(?i)<br\s*/?>|</p>").unwrap();
    static ref ANY_TAG: Regex = Regex::new(r"<[^>]+>").unwrap();
    static ref ENTITY: Regex = Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);").unwrap();
    static ref URL: Regex = Regex::new(r#"https?://[^\s<>"']+"#).unwrap();
}

/// Marker line that starts the quoted copy of our own outbound mail
const QUOTE_MARKER: &str = "from: help desk";

const NOTE_TAGS: &[&str] = &[
    "p", "br", "div", "span", "b", "strong", "i", "em", "u", "ul", "ol", "li", "h3", "h4", "h5",
    "h6", "a", "table", "thead", "tbody", "tr", "th", "td",
];

const DROP_IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".bmp"];
const MAIL_ATTACHMENT_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".pdf"];

/// Ticket id referenced in a subject such as `RE: Ticket #42 - Printer`
pub fn ticket_reference(subject: &str) -> Option<i64> {
    TICKET_REF
        .captures(subject)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Crude HTML to plain text: drops script/style, keeps line breaks
pub fn html_to_text(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    let text = SCRIPT_BLOCK.replace_all(html, "");
    let text = STYLE_BLOCK.replace_all(&text, "");
    let text = LINE_BREAK.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    unescape_html(&text).trim().to_string()
}

/// New text of a reply, cut at the first line quoting our outbound mail
pub fn reply_segment(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.to_lowercase().contains(QUOTE_MARKER) {
            break;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape_html(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            let decoded = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse().ok().and_then(char::from_u32)
            } else {
                match name {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    _ => None,
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

/// Escape plain text and turn newlines into `<br>`
pub fn text_to_html(text: &str) -> String {
    escape_html(text).replace('\n', "<br>")
}

/// Wrap bare URLs in anchors, leaving existing anchors and tag attributes alone
pub fn linkify(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut inside_anchor = false;
    let mut last = 0;
    for tag in ANY_TAG.find_iter(html) {
        let text = &html[last..tag.start()];
        if inside_anchor {
            out.push_str(text);
        } else {
            out.push_str(&link_urls(text));
        }
        let lower = tag.as_str().to_ascii_lowercase();
        if lower.starts_with("<a ") || lower == "<a>" {
            inside_anchor = true;
        } else if lower.starts_with("</a") {
            inside_anchor = false;
        }
        out.push_str(tag.as_str());
        last = tag.end();
    }
    let rest = &html[last..];
    if inside_anchor {
        out.push_str(rest);
    } else {
        out.push_str(&link_urls(rest));
    }
    out
}

fn link_urls(text: &str) -> String {
    URL.replace_all(text, |caps: &Captures| {
        let url = &caps[0];
        format!(r#"<a href="{url}" target="_blank">{url}</a>"#)
    })
    .into_owned()
}

/// Clean note HTML down to formatting tags and safe links.
/// Links get `rel="noopener noreferrer"`.
pub fn sanitize_note(html: &str) -> String {
    let mut builder = ammonia::Builder::empty();
    builder
        .add_tags(NOTE_TAGS)
        .add_tag_attributes("a", &["href", "title", "target"])
        .add_tag_attributes("td", &["colspan", "rowspan"])
        .add_tag_attributes("th", &["colspan", "rowspan"])
        .add_url_schemes(&["http", "https", "mailto"])
        .clean_content_tags(["script", "style"].into_iter().collect())
        .link_rel(Some("noopener noreferrer"));
    builder.clean(&linkify(html)).to_string()
}

/// Note body for an inbound reply
pub fn reply_note_html(text: &str) -> String {
    sanitize_note(&text_to_html(text))
}

/// Lowercased domain part of an address
pub fn sender_domain(address: &str) -> String {
    address
        .rsplit('@')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

/// Subject contains any deny phrase (phrases are stored lowercase)
pub fn is_denied(subject: &str, phrases: &[String]) -> bool {
    let subject = subject.to_lowercase();
    phrases.iter().any(|p| !p.is_empty() && subject.contains(p.as_str()))
}

/// An empty allow-list lets every domain through
pub fn domain_allowed(domain: &str, allowed: &[String]) -> bool {
    allowed.is_empty() || allowed.iter().any(|d| d == domain)
}

/// Mail attachments worth keeping: images and PDFs
pub fn wanted_mail_attachment(name: &str, content_type: &str) -> bool {
    let name = name.to_lowercase();
    content_type.starts_with("image/")
        || content_type == "application/pdf"
        || MAIL_ATTACHMENT_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Drop-folder files imported as screenshots
pub fn is_drop_image(name: &str) -> bool {
    let name = name.to_lowercase();
    DROP_IMAGE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Parsed `note.txt` from a drop folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropNote {
    pub email: Option<String>,
    pub serial: Option<String>,
    pub subject: String,
    /// Escaped HTML body
    pub body: String,
}

/// Line 1 is the requester email, line 2 the computer serial and line 3
/// the subject. Everything from line 3 on becomes the body.
pub fn parse_drop_note(content: &str, folder: &str) -> DropNote {
    let lines: Vec<&str> = content.lines().map(str::trim).collect();
    let field = |idx: usize| {
        lines
            .get(idx)
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
    };
    let rest = lines.get(2..).map(|r| r.join("\n")).unwrap_or_default();
    let rest = rest.trim();

    DropNote {
        email: field(0),
        serial: field(1),
        subject: field(2).unwrap_or_else(|| format!("HDWish submission ({})", folder)),
        body: if rest.is_empty() {
            "(no details)".to_string()
        } else {
            text_to_html(rest)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_reference() {
        assert_eq!(ticket_reference("RE: Ticket #42 - Printer"), Some(42));
        assert_eq!(ticket_reference("ticket#7"), Some(7));
        assert_eq!(ticket_reference("Ticket # 105 follow up"), Some(105));
        assert_eq!(ticket_reference("New laptop"), None);
    }

    #[test]
    fn test_html_to_text() {
        let html = "<style>p{color:red}</style><p>Hello&nbsp;there</p><script>x()</script>Line<br/>two &amp; more";
        assert_eq!(html_to_text(html), "Hello there\nLine\ntwo & more");
        assert_eq!(html_to_text(""), "");
    }

    #[test]
    fn test_reply_segment_cuts_quote() {
        let text = "Thanks, fixed!\n\n\nFrom: Help Desk <hd@example.com>\nSent: Monday";
        assert_eq!(reply_segment(text), "Thanks, fixed!");
        assert_eq!(reply_segment("only new text"), "only new text");
    }

    #[test]
    fn test_escape_and_unescape() {
        assert_eq!(escape_html("<b>\"a\" & 'b'</b>"), "&lt;b&gt;&quot;a&quot; &amp; &#x27;b&#x27;&lt;/b&gt;");
        assert_eq!(unescape_html("&lt;x&gt; &#65;&#x42; &bogus;"), "<x> AB &bogus;");
    }

    #[test]
    fn test_linkify_skips_existing_anchors() {
        let html = r#"See https://example.com/a?b=1 and <a href="https://x.test">https://x.test</a>"#;
        let out = linkify(html);
        assert!(out.contains(r#"<a href="https://example.com/a?b=1" target="_blank">https://example.com/a?b=1</a>"#));
        assert_eq!(out.matches("https://x.test").count(), 2);
    }

    #[test]
    fn test_sanitize_note() {
        let html = r#"<p onclick="x()">Hi <script>alert(1)</script><a href="javascript:alert(1)">bad</a> https://ok.test</p><img src="x">"#;
        let out = sanitize_note(html);
        assert!(!out.contains("onclick"));
        assert!(!out.contains("alert"));
        assert!(!out.contains("<img"));
        assert!(!out.contains("javascript"));
        assert!(out.contains(r#"href="https://ok.test""#));
        assert!(out.contains("noopener noreferrer"));
    }

    #[test]
    fn test_filters() {
        let phrases = vec!["out of office".to_string()];
        assert!(is_denied("Out Of Office: back Monday", &phrases));
        assert!(!is_denied("Printer", &phrases));

        assert_eq!(sender_domain("Pat@Example.COM"), "example.com");
        assert!(domain_allowed("example.com", &[]));
        assert!(domain_allowed("example.com", &["example.com".to_string()]));
        assert!(!domain_allowed("spam.test", &["example.com".to_string()]));

        assert!(wanted_mail_attachment("scan.PDF", "application/octet-stream"));
        assert!(wanted_mail_attachment("photo", "image/jpeg"));
        assert!(!wanted_mail_attachment("invoice.xlsx", "application/vnd.ms-excel"));
        assert!(is_drop_image("Screen.BMP"));
        assert!(!is_drop_image("note.txt"));
    }

    #[test]
    fn test_parse_drop_note() {
        let note = parse_drop_note(" pat@example.com \nSN123\nMonitor flickers\nStarted <today>\n", "20240501-1");
        assert_eq!(note.email.as_deref(), Some("pat@example.com"));
        assert_eq!(note.serial.as_deref(), Some("SN123"));
        assert_eq!(note.subject, "Monitor flickers");
        assert_eq!(note.body, "Monitor flickers<br>Started &lt;today&gt;");

        let bare = parse_drop_note("pat@example.com", "folder9");
        assert_eq!(bare.serial, None);
        assert_eq!(bare.subject, "HDWish submission (folder9)");
        assert_eq!(bare.body, "(no details)");
    }
}
