//! Execution engine trait.

use crate::error::Result;
use crate::types::{ExecutionRequest, ExecutionResult};
use async_trait::async_trait;

/// Upstream engine that executes a subscription document for one event.
///
/// Implementations return `Ok` for anything the engine itself answered,
/// including GraphQL errors. `Err` is reserved for transport failures.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult>;

    /// Check that the engine is reachable and answering queries.
    async fn health_check(&self) -> Result<()>;
}
