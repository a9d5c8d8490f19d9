//! Crate-wide error types.

use thiserror::Error;

/// Errors surfaced by the caching core.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The upstream query service returned an error payload or was unreachable.
    #[error("backend query failed (status {status_code}): {message}")]
    BackendQueryFailure { message: String, status_code: u16 },

    /// Transport-level failure talking to the upstream service.
    #[error("upstream transport error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Backing-store failure.
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The submitted request body could not be interpreted.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl CacheError {
    /// Build a `BackendQueryFailure` from an upstream error payload.
    pub fn backend_failure(payload: &serde_json::Value) -> Self {
        let message = payload
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown upstream error")
            .to_string();
        let status_code = payload
            .get("status_code")
            .and_then(|c| c.as_u64())
            .unwrap_or(500) as u16;
        CacheError::BackendQueryFailure {
            message,
            status_code,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backend_failure_from_payload() {
        let payload = json!({"error": "query parse failed", "status_code": 400});
        match CacheError::backend_failure(&payload) {
            CacheError::BackendQueryFailure {
                message,
                status_code,
            } => {
                assert_eq!(message, "query parse failed");
                assert_eq!(status_code, 400);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_backend_failure_defaults() {
        let payload = json!({});
        match CacheError::backend_failure(&payload) {
            CacheError::BackendQueryFailure { status_code, .. } => {
                assert_eq!(status_code, 500)
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
