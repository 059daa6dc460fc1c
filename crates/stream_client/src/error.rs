//! Stream client error types.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The gateway answered a handshake request with a non-success status.
    #[error("Gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Stream read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream ended")]
    StreamEnded,

    #[error("No data received for {0:?}")]
    StreamTimeout(Duration),

    #[error(transparent)]
    Reconnect(#[from] common::Error),
}

impl Error {
    /// Handshake rejections that retrying will not fix.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Status { status, .. }
            if (400..500).contains(status) && !matches!(status, 401 | 404 | 409))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
