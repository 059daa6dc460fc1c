//! HTTP execution engine client.

use crate::error::{Error, Result};
use crate::traits::ExecutionEngine;
use crate::types::{ExecutionBody, ExecutionRequest, ExecutionResult};
use async_trait::async_trait;
use serde_json::{json, Map};
use std::time::Duration;
use tracing::debug;

/// Execution engine reached over HTTP with a GraphQL-over-JSON body.
#[derive(Debug, Clone)]
pub struct HttpExecutionEngine {
    http: reqwest::Client,
    url: String,
}

impl HttpExecutionEngine {
    /// Create a client for `url`. Every request is bounded by `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Interpret an engine response body.
///
/// A non-success status still counts as an engine answer when the body
/// carries GraphQL errors.
fn interpret_response(status: reqwest::StatusCode, body: &[u8]) -> Result<ExecutionResult> {
    if status.is_success() {
        return serde_json::from_slice(body).map_err(|e| Error::InvalidResponse(e.to_string()));
    }

    match serde_json::from_slice::<ExecutionResult>(body) {
        Ok(result) if result.has_errors() => Ok(result),
        _ => Err(Error::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(body).chars().take(512).collect(),
        }),
    }
}

#[async_trait]
impl ExecutionEngine for HttpExecutionEngine {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let body = ExecutionBody {
            query: &request.query,
            variables: &request.variables,
            operation_name: request.operation_name.as_deref(),
            root_value: Some(&request.root_value),
        };

        let mut builder = self.http.post(&self.url).json(&body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        debug!("Engine answered {} ({} bytes)", status, bytes.len());

        interpret_response(status, &bytes)
    }

    async fn health_check(&self) -> Result<()> {
        let variables = Map::new();
        let body = ExecutionBody {
            query: "{ __typename }",
            variables: &variables,
            operation_name: None,
            root_value: None,
        };

        let response = self.http.post(&self.url).json(&body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        let result = interpret_response(status, &bytes)?;

        if result.has_errors() {
            return Err(Error::InvalidResponse(format!(
                "health query failed: {}",
                json!(result.errors)
            )));
        }
        Ok(())
    }
}
