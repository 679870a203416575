use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("path prefix not allowed: {segment}")]
pub struct AuthError {
    pub segment: String,
}

/// Check the first non-empty path segment against the configured
/// allow-list. `None` means the allow-list is the wildcard and every
/// path is permitted.
pub fn authorize_path(
    path: &str,
    allowed_prefixes: Option<&HashSet<String>>,
) -> Result<(), AuthError> {
    let Some(allowed) = allowed_prefixes else {
        return Ok(());
    };
    let segment = path
        .split('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("");
    if allowed.contains(segment) {
        Ok(())
    } else {
        Err(AuthError {
            segment: segment.to_string(),
        })
    }
}
