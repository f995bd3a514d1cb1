//! Comment stream XML codec.
//!
//! Streams are persisted in the widely supported bilibili layout:
//!
//! ```text
//! <?xml version="1.0" encoding="UTF-8"?>
//! <i>
//!   <chatid>...</chatid>
//!   <d p="time,mode,size,color,sent_at,pool,author,id">text</d>
//! </i>
//! ```

use std::fmt::Write;
use std::sync::LazyLock;

use regex::Regex;

use super::provider::{CommentItem, CommentStream};

static COMMENT_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r#"<d\s+p="([^"]*)"\s*>([^<]*)</d>"#).expect("comment element pattern")
    });

static NUMERIC_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("numeric entity pattern"));

/// Serialize a stream to the XML document written next to the media file.
pub fn to_xml(stream: &CommentStream) -> Vec<u8> {
    let mut out = String::with_capacity(128 + stream.items.len() * 96);
    out.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    out.push_str("\n<i>\n");
    out.push_str("  <chatserver>chat.bilibili.com</chatserver>\n");
    let _ = writeln!(out, "  <chatid>{}</chatid>", escape(&stream.stream_key));
    out.push_str("  <mission>0</mission>\n");
    let _ = writeln!(out, "  <maxlimit>{}</maxlimit>", stream.items.len());
    out.push_str("  <state>0</state>\n  <real_name>0</real_name>\n  <source>k-v</source>\n");

    for item in &stream.items {
        let _ = writeln!(
            out,
            r#"  <d p="{:.5},{},{},{},{},{},{},{}">{}</d>"#,
            item.time,
            item.mode,
            item.font_size,
            item.color,
            item.sent_at,
            item.pool,
            escape(&item.author_hash),
            item.id,
            escape(&item.text),
        );
    }

    out.push_str("</i>\n");
    out.into_bytes()
}

/// Parse `<d>` elements out of a bilibili-style XML document.
///
/// Elements whose attribute list cannot be read are skipped.
pub fn parse_xml(stream_key: impl Into<String>, xml: &str) -> CommentStream {
    let items = COMMENT_ELEMENT
        .captures_iter(xml)
        .filter_map(|caps| parse_item(&caps[1], &caps[2]))
        .collect();

    CommentStream {
        stream_key: stream_key.into(),
        items,
    }
}

fn parse_item(attrs: &str, text: &str) -> Option<CommentItem> {
    let fields: Vec<&str> = attrs.split(',').collect();
    if fields.len() < 4 {
        return None;
    }

    let time: f64 = fields[0].parse().ok()?;
    let mode: u8 = fields[1].parse().ok()?;
    let font_size: u32 = fields[2].parse().ok()?;
    let color: u32 = fields[3].parse().ok()?;
    let sent_at = fields.get(4).and_then(|v| v.parse().ok()).unwrap_or(0);
    let pool = fields.get(5).and_then(|v| v.parse().ok()).unwrap_or(0);
    let author_hash = fields.get(6).map(|v| unescape(v)).unwrap_or_default();
    let id = fields.get(7).and_then(|v| v.parse().ok()).unwrap_or(0);

    Some(CommentItem {
        id,
        time,
        mode,
        font_size,
        color,
        sent_at,
        pool,
        author_hash,
        text: unescape(text),
    })
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Control characters are not allowed in XML 1.0.
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let numeric = NUMERIC_ENTITY.replace_all(s, |caps: &regex::Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });

    numeric
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
