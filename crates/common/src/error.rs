//! Error types shared across gateway crates.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
