pub mod auth;
pub mod rate_limiter;

pub use auth::AuthGate;
pub use rate_limiter::{RateLimitDecision, RateLimiter};

/// Segment-aware prefix match: `/health` matches `/health` and `/health/db`
/// but not `/healthz`. A prefix of `/` matches every path.
pub fn path_matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }

    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

pub fn matches_any_prefix(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| path_matches_prefix(path, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matching_respects_segments() {
        assert!(path_matches_prefix("/health", "/health"));
        assert!(path_matches_prefix("/health/db", "/health"));
        assert!(path_matches_prefix("/health", "/health/"));
        assert!(!path_matches_prefix("/healthz", "/health"));
        assert!(!path_matches_prefix("/api/v1/leadsx", "/api/v1/leads"));
        assert!(path_matches_prefix("/anything", "/"));
    }

    #[test]
    fn test_matches_any_prefix() {
        let exempt = vec!["/health".to_string(), "/documentation".to_string()];
        assert!(matches_any_prefix("/documentation/index.html", &exempt));
        assert!(!matches_any_prefix("/api/v1/leads", &exempt));
    }
}
