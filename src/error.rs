//! Error types for the execution plane.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Result type alias for execution-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the execution plane.
///
/// Validation and NotFound short-circuit before any container work and are
/// never recorded. Execution, Timeout, and Engine failures always produce an
/// invocation record; they reach callers through the invocation result, not
/// through this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Malformed request (bad JSON, wrong shape, invalid pattern).
    #[error("{0}")]
    Validation(String),

    /// Function, project, or route missing.
    #[error("{0}")]
    NotFound(String),

    /// A routed target exists but cannot serve requests (disabled function).
    #[error("{0}")]
    Unavailable(String),

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Image build failed; carries the tail of the build output so the
    /// package manager's actual message surfaces, not an exit status.
    #[error("image build failed: {message}")]
    ImageBuild { message: String },

    /// The selected runtime image is not present in the engine.
    #[error("runtime image not found: {tag}")]
    ImageMissing { tag: String },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// Container engine unreachable or refused the operation.
    #[error("engine unavailable: {reason}")]
    Engine { reason: String },

    /// No container engine could be located at startup.
    #[error("no container engine found: {0}")]
    EngineDiscovery(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Record store failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Error::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            // Image and engine failures are folded into invocation results
            // before a handler returns; anything else arriving here is an
            // internal fault and gets the generic 500.
            _ => {
                tracing::error!("internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_message_passes_through() {
        let err = Error::Validation("input must be a JSON object".to_string());
        assert_eq!(err.to_string(), "input must be a JSON object");
    }

    #[test]
    fn build_error_carries_log_tail() {
        let err = Error::ImageBuild {
            message: "ERROR: No matching distribution found for nonexistent-xyz==1.0".to_string(),
        };
        assert!(err.to_string().contains("No matching distribution"));
        assert!(!err.to_string().contains("exit code"));
    }
}
