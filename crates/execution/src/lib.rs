//! Execution proxy.
//!
//! Re-executes a subscription document against the upstream engine for every
//! event it matches. The event payload travels as a signed root value so the
//! engine can tell it apart from anything a client could send directly.

pub mod error;
pub mod http;
pub mod proxy;
pub mod signing;
pub mod traits;
pub mod types;

pub use error::{Error, Result, SignatureError};
pub use http::HttpExecutionEngine;
pub use proxy::{interpret, ExecutionOutcome, ExecutionProxy, SubscriptionExecution};
pub use signing::{RootValueSigner, SignedRootValue};
pub use traits::ExecutionEngine;
pub use types::{ExecutionRequest, ExecutionResult};
