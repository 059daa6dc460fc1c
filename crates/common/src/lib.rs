//! Common primitives shared by the subscription gateway crates.

pub mod backoff;
pub mod error;
pub mod keyed_lock;

pub use backoff::{retry, Backoff, BackoffConfig};
pub use error::{Error, Result};
pub use keyed_lock::KeyedLocks;
