//! HTTP route normalization shared by the durable mapping and the route cache.

use klinik_core::error::{CoreError, CoreResult};

const METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// ## Summary
/// Upper-cases an HTTP method and checks it against the supported set.
///
/// ## Errors
/// Returns `UnsupportedMethod` for an empty or unknown method.
pub fn normalize_method(method: &str) -> CoreResult<String> {
    let upper = method.trim().to_ascii_uppercase();
    if METHODS.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(CoreError::UnsupportedMethod(method.to_string()))
    }
}

/// ## Summary
/// Collapses repeated slashes and strips the trailing slash. Case is kept.
/// The root path stays `/`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(path.len());
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

/// ## Summary
/// Normalizes a route path, rejecting paths that do not start with `/`.
///
/// ## Errors
/// Returns `InvalidInput` for relative or blank paths.
pub fn validate_path(path: &str) -> CoreResult<String> {
    let trimmed = path.trim();
    if !trimmed.starts_with('/') {
        return Err(CoreError::InvalidInput(format!(
            "route path must be absolute: {path:?}"
        )));
    }
    Ok(normalize_path(trimmed))
}

/// Returns true if the segment is a path parameter (`{id}` or `:id`).
#[must_use]
pub fn is_param_segment(segment: &str) -> bool {
    (segment.starts_with('{') && segment.ends_with('}') && segment.len() > 2)
        || (segment.starts_with(':') && segment.len() > 1)
}
