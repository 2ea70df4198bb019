//! Minimal XML support for S3 request and response bodies
//!
//! S3 documents are shallow and element-only, so a tag scanner is enough:
//! [`elements`] returns the raw inner text of every `<tag>` occurrence and
//! [`text`] decodes the first one. Request bodies are built with `format!`
//! and [`escape`].

use crate::error::{FerryError, Result};

/// S3 document namespace
pub const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Types decodable from an XML response body
pub trait FromXml: Sized {
    fn from_xml(doc: &str) -> Result<Self>;
}

/// Escape text for use as element content
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Decode the predefined and numeric character entities
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Raw inner content of every `<tag>` element, in document order.
///
/// Elements of the same name must not nest, which holds for S3 documents.
pub fn elements<'a>(doc: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut found = Vec::new();
    let mut pos = 0;

    while let Some(rel) = doc[pos..].find(&open) {
        let start = pos + rel;
        let after_name = start + open.len();
        // Reject longer names sharing the prefix, e.g. <Key> vs <KeyCount>
        match doc[after_name..].chars().next() {
            Some('>') | Some('/') => {}
            Some(c) if c.is_whitespace() => {}
            _ => {
                pos = after_name;
                continue;
            }
        }
        let Some(gt) = doc[after_name..].find('>') else {
            break;
        };
        let open_end = after_name + gt;
        if doc[..open_end].ends_with('/') {
            found.push("");
            pos = open_end + 1;
            continue;
        }
        let content_start = open_end + 1;
        let Some(end_rel) = doc[content_start..].find(&close) else {
            break;
        };
        found.push(&doc[content_start..content_start + end_rel]);
        pos = content_start + end_rel + close.len();
    }
    found
}

/// Decoded text of the first `<tag>` element
pub fn text(doc: &str, tag: &str) -> Option<String> {
    elements(doc, tag).first().map(|raw| unescape(raw.trim()))
}

/// Decoded text of the first `<tag>`, or an error naming the missing element
pub fn require_text(doc: &str, tag: &str) -> Result<String> {
    text(doc, tag).ok_or_else(|| {
        FerryError::InvalidResponse(format!("missing <{}> element in response", tag))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        let raw = r#"a&b<c>"d"'e'"#;
        assert_eq!(escape(raw), "a&amp;b&lt;c&gt;&quot;d&quot;&apos;e&apos;");
        assert_eq!(unescape(&escape(raw)), raw);
    }

    #[test]
    fn test_unescape_numeric_and_unknown() {
        assert_eq!(unescape("&#34;abc&#x22;"), "\"abc\"");
        assert_eq!(unescape("a & b"), "a & b");
        assert_eq!(unescape("&bogus;x"), "&bogus;x");
    }

    #[test]
    fn test_elements_skip_longer_names() {
        let doc = "<R><KeyCount>2</KeyCount><Key>a</Key><Key>b</Key></R>";
        assert_eq!(elements(doc, "Key"), vec!["a", "b"]);
        assert_eq!(text(doc, "KeyCount").as_deref(), Some("2"));
    }

    #[test]
    fn test_elements_with_attributes_and_self_closing() {
        let doc = r#"<Root xmlns="ns"><Empty/><Val attr="1">x</Val></Root>"#;
        assert_eq!(elements(doc, "Empty"), vec![""]);
        assert_eq!(text(doc, "Val").as_deref(), Some("x"));
        assert!(elements(doc, "Root")[0].contains("<Val"));
    }

    #[test]
    fn test_require_text() {
        assert!(require_text("<a>1</a>", "a").is_ok());
        assert!(matches!(
            require_text("<a>1</a>", "b"),
            Err(FerryError::InvalidResponse(_))
        ));
    }
}
