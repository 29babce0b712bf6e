//! SQL helper functions.

/// Escapes SQL LIKE wildcards in a string to make them literal.
///
/// `%`, `_` and the escape character `\` are prefixed with `\`; queries must
/// use `ESCAPE '\'`.
///
/// # Examples
///
/// ```
/// use memkeep::storage::escape_like_wildcards;
///
/// assert_eq!(escape_like_wildcards("100%"), "100\\%");
/// assert_eq!(escape_like_wildcards("user_name"), "user\\_name");
/// assert_eq!(escape_like_wildcards("path\\file"), "path\\\\file");
/// ```
#[must_use]
pub fn escape_like_wildcards(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' | '_' | '\\' => {
                result.push('\\');
                result.push(c);
            },
            _ => result.push(c),
        }
    }
    result
}

/// Builds a LIKE pattern matching `needle` anywhere, with wildcards escaped.
#[must_use]
pub fn contains_pattern(needle: &str) -> String {
    format!("%{}%", escape_like_wildcards(needle))
}
