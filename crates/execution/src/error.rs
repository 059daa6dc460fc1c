//! Error types for the execution proxy.

use thiserror::Error;

/// Result type alias for execution operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Execution errors.
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP transport failure, including timeouts.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Engine answered with a non-success status and no GraphQL errors.
    #[error("Engine returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Engine answered with a body that is not a GraphQL result.
    #[error("Invalid engine response: {0}")]
    InvalidResponse(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Root value could not be signed.
    #[error("Signing error: {0}")]
    Signing(String),
}

/// Reasons a signed root value is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Root value is missing `{0}`")]
    Missing(&'static str),

    #[error("Root value field `{0}` is malformed")]
    Malformed(&'static str),

    #[error("Signature expired")]
    Expired,

    #[error("Signature does not match")]
    Invalid,
}
