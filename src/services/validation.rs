//! Input sanitizing and key validation.

use regex::Regex;
use std::sync::LazyLock;

/// Longest accepted text field, in characters, before truncation.
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Longest accepted key, in characters.
pub const MAX_KEY_CHARS: usize = 100;

/// Marker appended to truncated text.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[\w\-.]+$").unwrap()
});

/// Truncates overlong text, strips NUL characters and trims whitespace.
#[must_use]
pub fn sanitize_input(value: &str) -> String {
    let mut text: String = if value.chars().count() > MAX_TEXT_CHARS {
        let mut truncated: String = value.chars().take(MAX_TEXT_CHARS).collect();
        truncated.push_str(TRUNCATION_MARKER);
        truncated
    } else {
        value.to_string()
    };
    text.retain(|c| c != '\0');
    text.trim().to_string()
}

/// Keys are 1 to 100 word characters, hyphens or dots.
#[must_use]
pub fn validate_key(key: &str) -> bool {
    !key.is_empty() && key.chars().count() <= MAX_KEY_CHARS && KEY_PATTERN.is_match(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("project.language", true ; "dotted")]
    #[test_case("db-path_2", true ; "hyphen and underscore")]
    #[test_case("", false ; "empty")]
    #[test_case("has space", false ; "space")]
    #[test_case("semi;colon", false ; "punctuation")]
    #[test_case("../etc/passwd", false ; "path")]
    fn test_validate_key(key: &str, expected: bool) {
        assert_eq!(validate_key(key), expected);
    }

    #[test]
    fn test_validate_key_length() {
        assert!(validate_key(&"k".repeat(MAX_KEY_CHARS)));
        assert!(!validate_key(&"k".repeat(MAX_KEY_CHARS + 1)));
    }

    #[test]
    fn test_sanitize_strips_nul_and_trims() {
        assert_eq!(sanitize_input("  a\0b  "), "ab");
    }

    #[test]
    fn test_sanitize_truncates_by_chars() {
        let long = "é".repeat(MAX_TEXT_CHARS + 5);
        let out = sanitize_input(&long);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.chars().count(), MAX_TEXT_CHARS + TRUNCATION_MARKER.len());
    }
}
