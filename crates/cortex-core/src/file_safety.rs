//! Filename sanitising for files materialized into export folders.

/// Longest filename stem produced by [`sanitize_title`].
pub const MAX_STEM_LEN: usize = 100;

/// Turn a record title into a safe filename stem.
///
/// Path separators and characters rejected by common filesystems become `_`,
/// whitespace runs collapse to a single `-`, and the result is truncated on a
/// character boundary. Empty titles fall back to `fallback`.
pub fn sanitize_title(title: &str, fallback: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_dash = false;

    for c in title.trim().chars() {
        let mapped = match c {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\0' => '_',
            c if c.is_control() => '_',
            c if c.is_whitespace() => '-',
            c => c,
        };
        if mapped == '-' {
            if last_dash {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        return fallback.to_string();
    }

    trimmed.chars().take(MAX_STEM_LEN).collect()
}
