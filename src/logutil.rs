//! Helpers that keep user-supplied text from breaking single-line logs.

/// Longest body preview written to a log line.
pub const BODY_PREVIEW_CHARS: usize = 48;

/// Escape a string for single-line logging and cap its length at `max_chars`.
///
/// Backslash, newline, carriage return and tab get their usual escapes; any
/// other control character is written as `\xNN`. Truncation adds `…`.
pub fn escape_log(s: &str, max_chars: usize) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(s.len().min(max_chars) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max_chars {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Short, escaped preview of a message body.
pub fn preview_body(body: &str) -> String {
    escape_log(body, BODY_PREVIEW_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_characters() {
        assert_eq!(escape_log("Line1\nLine2\r\tEnd", 100), "Line1\\nLine2\\r\\tEnd");
        assert_eq!(escape_log("bell\u{7}", 100), "bell\\x07");
    }

    #[test]
    fn preview_is_truncated() {
        let long = "x".repeat(BODY_PREVIEW_CHARS + 10);
        let preview = preview_body(&long);
        assert!(preview.ends_with('…'));
        assert_eq!(preview.chars().count(), BODY_PREVIEW_CHARS + 1);
    }
}
