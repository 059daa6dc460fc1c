//! Request and result types exchanged with the execution engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One call to the execution engine.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub query: String,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
    pub root_value: Value,
    /// Headers forwarded verbatim, typically authorization.
    pub headers: HashMap<String, String>,
}

/// Body POSTed to the engine.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecutionBody<'a> {
    pub query: &'a str,
    pub variables: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_value: Option<&'a Value>,
}

/// GraphQL-style result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<Value>>,
}

impl ExecutionResult {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: None,
        }
    }

    /// Errors-only result; `data` serializes as `null`.
    pub fn errors(errors: Vec<Value>) -> Self {
        Self {
            data: None,
            errors: Some(errors),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// True when the engine produced no data: `data` is absent or null, or
    /// every top-level field is null.
    pub fn is_filtered(&self) -> bool {
        match &self.data {
            None | Some(Value::Null) => true,
            Some(Value::Object(fields)) => fields.values().all(Value::is_null),
            Some(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_errors_result_serializes_null_data() {
        let result = ExecutionResult::errors(vec![json!({"message": "boom"})]);
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"data": null, "errors": [{"message": "boom"}]})
        );
    }

    #[test]
    fn test_is_filtered() {
        assert!(ExecutionResult::data(json!({"itemChanged": null})).is_filtered());
        assert!(ExecutionResult::data(json!({"a": null, "b": null})).is_filtered());
        assert!(ExecutionResult::data(Value::Null).is_filtered());
        assert!(!ExecutionResult::data(json!({"a": null, "b": {"id": 1}})).is_filtered());
        assert!(!ExecutionResult::data(json!({"a": false})).is_filtered());
    }

    #[test]
    fn test_body_field_names() {
        let variables = Map::new();
        let root = json!({"x": 1});
        let body = ExecutionBody {
            query: "subscription { x }",
            variables: &variables,
            operation_name: Some("Op"),
            root_value: Some(&root),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["operationName"], "Op");
        assert_eq!(value["rootValue"], json!({"x": 1}));
    }
}
