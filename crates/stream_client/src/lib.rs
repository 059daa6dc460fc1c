//! Client side of the gateway's stream protocol.
//!
//! [`StreamClient`] reserves a token, registers its operations and reads
//! the event stream. When the stream breaks it runs the whole handshake
//! again with a fresh token, since tokens cannot be resumed.

pub mod client;
pub mod error;
pub mod sse;

pub use client::{ClientEvent, Operation, StreamClient, StreamClientConfig};
pub use error::{Error, Result};
pub use sse::{SseDecoder, SseEvent, SseItem};
