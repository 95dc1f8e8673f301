//! Common helper functions for avatarlink.

/// Trims whitespace and trailing slashes from a base URL.
///
/// Returns `None` when nothing is left.
pub fn normalize_base_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Joins a base URL and a path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Returns `true` when `text` has at least one non-whitespace character.
pub fn has_visible_text(text: &str) -> bool {
    !text.trim().is_empty()
}
