//! Namespace keys scope all persisted data (state, log, config) per user.

/// Namespace used when the application never picked one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Prefix applied to sanitized user namespaces.
pub const USER_PREFIX: &str = "user__";

/// Fold a raw namespace into its persisted form: lowercase, `[a-z0-9_-]`
/// charset, `user__` prefix. Empty input maps to [`DEFAULT_NAMESPACE`].
///
/// Idempotent: already-sanitized values pass through unchanged, so callers
/// may sanitize defensively at every boundary.
pub fn sanitize(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == DEFAULT_NAMESPACE {
        return DEFAULT_NAMESPACE.to_owned();
    }
    let folded: String = trimmed
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    if folded.starts_with(USER_PREFIX) {
        folded
    } else {
        format!("{USER_PREFIX}{folded}")
    }
}
