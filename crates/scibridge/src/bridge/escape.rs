//! Escaping for metadata values carried on a single wire line.
//!
//! The worker escapes every backslash as `\\` and every newline as `\n` so a
//! value never contains a raw line break, which keeps the response terminator
//! (an empty line) unambiguous.

/// Escape a value for transmission on one line.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape`].
///
/// Malformed escapes never fail: a backslash followed by anything other than
/// `\` or `n` is kept as a literal backslash plus that character, and a
/// trailing lone backslash is kept as-is. Both cases emit a warning.
pub fn unescape(wire: &str) -> String {
    let mut out = String::with_capacity(wire.len());
    let mut chars = wire.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some(other) => {
                tracing::warn!(escape = %other, value = %wire, "Unknown escape sequence in metadata value");
                out.push('\\');
                out.push(other);
            }
            None => {
                tracing::warn!(value = %wire, "Trailing backslash in metadata value");
                out.push('\\');
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_backslash_and_newline() {
        assert_eq!(escape("a\\b\nc"), "a\\\\b\\nc");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn unescapes_known_sequences() {
        assert_eq!(unescape("C:\\\\data\\nline two"), "C:\\data\nline two");
    }

    #[test]
    fn roundtrip_preserves_awkward_values() {
        for value in [
            "",
            "\\",
            "\n",
            "\\n",
            "\\\\n\n\\",
            "Acquisition\\Date\n2014-01-01",
            "µm ümlaut\ttab",
        ] {
            assert_eq!(unescape(&escape(value)), value, "value {value:?}");
        }
    }

    #[test]
    fn unknown_escape_kept_literally() {
        assert_eq!(unescape("a\\tb"), "a\\tb");
    }

    #[test]
    fn trailing_backslash_kept_literally() {
        assert_eq!(unescape("end\\"), "end\\");
    }

    #[test]
    fn escaped_value_has_no_raw_newline() {
        assert!(!escape("one\ntwo\n\n").contains('\n'));
    }
}
