//! Error types for the event bus.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported event bus URL: {0}")]
    UnsupportedUrl(String),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Reconnect failed: {0}")]
    Reconnect(#[from] common::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
