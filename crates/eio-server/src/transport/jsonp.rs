//! JSONP polling encoding.
//!
//! Responses are wrapped as a call to `___eio[<index>]`, which the client
//! registers before injecting the script tag. Inbound bodies arrive with
//! newlines escaped by the client and are unescaped before decoding.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// `\n` optionally preceded by one more backslash.
static ESCAPED_NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\\)?\\n").expect("valid regex"));

/// `\\n`: an escaped backslash followed by `n`.
static DOUBLE_ESCAPED_NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\\\n").expect("valid regex"));

/// Keep only the ASCII digits of a client-supplied callback index.
pub fn sanitize_callback(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Undo the client's newline escaping.
///
/// `\n` becomes a real newline, and `\\n` becomes a literal `\n`.
pub fn unescape_body(body: &str) -> String {
    let newlines = ESCAPED_NEWLINE.replace_all(body, |caps: &Captures<'_>| {
        if caps.get(1).is_some() {
            caps[0].to_string()
        } else {
            "\n".to_string()
        }
    });
    DOUBLE_ESCAPED_NEWLINE
        .replace_all(&newlines, regex::NoExpand(r"\n"))
        .into_owned()
}

/// Wrap an encoded payload as a JavaScript callback invocation.
///
/// U+2028 and U+2029 are legal in JSON strings but terminate lines in
/// JavaScript, so they are escaped.
pub fn wrap_payload(callback: &str, payload: &str) -> String {
    let literal = serde_json::Value::String(payload.to_owned()).to_string();
    let literal = literal
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029");
    format!("___eio[{callback}]({literal});")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_keeps_digits_only() {
        assert_eq!(sanitize_callback("12"), "12");
        assert_eq!(sanitize_callback("1);alert(2"), "12");
        assert_eq!(sanitize_callback("abc"), "");
    }

    #[test]
    fn unescapes_single_newline() {
        assert_eq!(unescape_body(r"4line1\nline2"), "4line1\nline2");
    }

    #[test]
    fn double_escaped_newline_becomes_literal() {
        assert_eq!(unescape_body(r"4a\\nb"), r"4a\nb");
    }

    #[test]
    fn body_without_escapes_is_untouched() {
        assert_eq!(unescape_body("6:4hello"), "6:4hello");
    }

    #[test]
    fn wraps_payload_as_js_call() {
        assert_eq!(wrap_payload("3", "6:4hello"), r#"___eio[3]("6:4hello");"#);
    }

    #[test]
    fn wrap_escapes_quotes_and_line_separators() {
        let wrapped = wrap_payload("0", "4\"a\u{2028}b\u{2029}");
        assert_eq!(wrapped, r#"___eio[0]("4\"a\u2028b\u2029");"#);
    }
}
