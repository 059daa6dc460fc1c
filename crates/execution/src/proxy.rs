//! Turns one (subscription, event) pair into a client-visible outcome.

use crate::error::Error;
use crate::signing::RootValueSigner;
use crate::traits::ExecutionEngine;
use crate::types::{ExecutionRequest, ExecutionResult};
use event_bus::BusEvent;
use metrics::counter;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything about a subscription the engine needs to re-execute it.
#[derive(Debug, Clone)]
pub struct SubscriptionExecution {
    pub subscription_id: String,
    pub event_name: String,
    pub query: String,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
    pub headers: HashMap<String, String>,
}

/// Result of executing a subscription for one event.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// Deliver as a `next` frame.
    Next(ExecutionResult),
    /// The engine judged the event irrelevant to this subscriber.
    Filtered,
    /// The engine could not be reached or answered garbage.
    Failed(Error),
}

/// Classify an engine answer.
pub fn interpret(result: ExecutionResult) -> ExecutionOutcome {
    if result.has_errors() {
        return ExecutionOutcome::Next(ExecutionResult::errors(result.errors.unwrap_or_default()));
    }
    if result.is_filtered() {
        return ExecutionOutcome::Filtered;
    }
    ExecutionOutcome::Next(result)
}

/// Signs root values and calls the execution engine.
#[derive(Clone)]
pub struct ExecutionProxy {
    engine: Arc<dyn ExecutionEngine>,
    signer: Arc<RootValueSigner>,
}

impl ExecutionProxy {
    pub fn new(engine: Arc<dyn ExecutionEngine>, signer: RootValueSigner) -> Self {
        Self {
            engine,
            signer: Arc::new(signer),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    pub fn signer(&self) -> &RootValueSigner {
        &self.signer
    }

    pub async fn execute(
        &self,
        subscription: &SubscriptionExecution,
        event: &BusEvent,
    ) -> ExecutionOutcome {
        counter!("execution_requests_total").increment(1);

        let signed = match self.signer.sign(
            &subscription.event_name,
            &subscription.subscription_id,
            event.payload.to_value(),
        ) {
            Ok(signed) => signed,
            Err(e) => {
                counter!("execution_failures_total", "error_type" => "signing").increment(1);
                return ExecutionOutcome::Failed(e);
            }
        };

        let request = ExecutionRequest {
            query: subscription.query.clone(),
            variables: subscription.variables.clone(),
            operation_name: subscription.operation_name.clone(),
            root_value: signed.into_root_value(),
            headers: subscription.headers.clone(),
        };

        match self.engine.execute(&request).await {
            Ok(result) => {
                let outcome = interpret(result);
                match &outcome {
                    ExecutionOutcome::Filtered => {
                        counter!("execution_filtered_total").increment(1);
                        debug!(
                            "Event on {} filtered for {}",
                            event.topic, subscription.subscription_id
                        );
                    }
                    ExecutionOutcome::Next(result) if result.has_errors() => {
                        counter!("execution_graphql_errors_total").increment(1);
                    }
                    _ => {}
                }
                outcome
            }
            Err(e) => {
                counter!("execution_failures_total", "error_type" => "transport").increment(1);
                warn!(
                    "Execution via {} failed for {}: {}",
                    self.engine.name(),
                    subscription.subscription_id,
                    e
                );
                ExecutionOutcome::Failed(e)
            }
        }
    }
}
