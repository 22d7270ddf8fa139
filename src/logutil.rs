//! Log helpers for mesh text: commands and beacons often carry newlines, which would split
//! a single event across several log lines.

use std::fmt::Write;

const MAX_PREVIEW: usize = 300;

/// Escape a string for single-line logging.
///
/// Newlines, carriage returns, tabs and backslashes are written as escapes, other control
/// characters as `\xNN`. Output stops after 300 characters with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
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

/// Escape and cut `input` to at most `max_bytes` of source text, never inside a UTF-8 sequence.
pub fn truncate_for_log(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines() {
        assert_eq!(escape_log("Recent users:\nAB\r\tC"), "Recent users:\\nAB\\r\\tC");
    }

    #[test]
    fn truncate_keeps_char_boundary() {
        let s = "Jönköping Jönköping";
        let out = truncate_for_log(s, 6);
        assert!(out.ends_with("..."));
        assert!(out.starts_with("J"));
    }

    #[test]
    fn short_input_untouched() {
        assert_eq!(truncate_for_log("/info", 40), "/info");
    }
}
