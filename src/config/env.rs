//! Environment variable lookup helpers.

/// Key lookup used when applying overrides.
///
/// The process environment is the usual source; tests pass a map instead.
pub type EnvLookup<'a> = dyn Fn(&str) -> Option<String> + 'a;

/// Reads a variable from the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Parses `true`/`1`/`yes`/`on` (case-insensitive) as true.
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

pub(crate) fn parse_usize(env: &EnvLookup<'_>, key: &str) -> Option<usize> {
    env(key).and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn parse_u64(env: &EnvLookup<'_>, key: &str) -> Option<u64> {
    env(key).and_then(|v| v.trim().parse::<u64>().ok())
}
