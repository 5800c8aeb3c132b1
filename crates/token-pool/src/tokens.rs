//! Parsing of user-entered token lists

/// Split a comma-separated token list into trimmed, non-empty tokens.
///
/// Only the ASCII comma separates tokens; the full-width comma (`，`) is kept
/// as part of the token.
pub fn parse_tokens(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}
