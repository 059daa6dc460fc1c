//! Subscription document parsing.
//!
//! Finds the single root field of the selected subscription operation and
//! resolves its arguments to JSON, substituting variables from the request
//! or from the variable definitions' default values.

use graphql_parser::query::{
    parse_query, Definition, Document, OperationDefinition, Selection, Subscription,
    Value as GqlValue,
};
use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Document contains no operations")]
    NoOperation,

    #[error("Unknown operation named \"{0}\"")]
    UnknownOperation(String),

    #[error("Must provide operation name if query contains multiple operations")]
    AmbiguousOperation,

    #[error("Operation is not a subscription")]
    NotSubscription,

    #[error("Subscription must select exactly one top level field, found {0}")]
    RootFieldCount(usize),

    #[error("Subscription root selection must be a field")]
    UnsupportedRootSelection,

    #[error("Argument \"{0}\" is given more than once")]
    DuplicateArgument(String),

    #[error("Variable \"${0}\" was not provided")]
    MissingVariable(String),

    #[error("Argument value cannot be represented: {0}")]
    InvalidValue(String),
}

/// The routable part of a subscription document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSubscription {
    /// Root field name, which is also the event name.
    pub event_name: String,
    /// Root field arguments with variables resolved.
    pub arguments: Map<String, Value>,
    pub operation_name: Option<String>,
}

pub fn parse_subscription(
    query: &str,
    variables: &Map<String, Value>,
    operation_name: Option<&str>,
) -> Result<ParsedSubscription, DocumentError> {
    let document: Document<'_, String> =
        parse_query(query).map_err(|e| DocumentError::Syntax(e.to_string()))?;

    let operation = select_operation(&document, operation_name)?;
    let OperationDefinition::Subscription(subscription) = operation else {
        return Err(DocumentError::NotSubscription);
    };

    let items = &subscription.selection_set.items;
    if items.len() != 1 {
        return Err(DocumentError::RootFieldCount(items.len()));
    }
    let Selection::Field(field) = &items[0] else {
        return Err(DocumentError::UnsupportedRootSelection);
    };

    let mut arguments = Map::new();
    for (name, value) in &field.arguments {
        if arguments.contains_key(name) {
            return Err(DocumentError::DuplicateArgument(name.clone()));
        }
        arguments.insert(name.clone(), resolve(value, subscription, variables)?);
    }

    Ok(ParsedSubscription {
        event_name: field.name.clone(),
        arguments,
        operation_name: subscription.name.clone(),
    })
}

fn select_operation<'d, 'a>(
    document: &'d Document<'a, String>,
    operation_name: Option<&str>,
) -> Result<&'d OperationDefinition<'a, String>, DocumentError> {
    let operations: Vec<&OperationDefinition<'a, String>> = document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::Operation(operation) => Some(operation),
            Definition::Fragment(_) => None,
        })
        .collect();

    match operation_name {
        Some(wanted) => operations
            .into_iter()
            .find(|operation| operation_name_of(operation) == Some(wanted))
            .ok_or_else(|| DocumentError::UnknownOperation(wanted.to_string())),
        None => match operations.as_slice() {
            [] => Err(DocumentError::NoOperation),
            [only] => Ok(*only),
            _ => Err(DocumentError::AmbiguousOperation),
        },
    }
}

fn operation_name_of<'d>(operation: &'d OperationDefinition<'_, String>) -> Option<&'d str> {
    match operation {
        OperationDefinition::Subscription(s) => s.name.as_deref(),
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::SelectionSet(_) => None,
    }
}

fn resolve(
    value: &GqlValue<'_, String>,
    subscription: &Subscription<'_, String>,
    variables: &Map<String, Value>,
) -> Result<Value, DocumentError> {
    Ok(match value {
        GqlValue::Variable(name) => {
            if let Some(provided) = variables.get(name) {
                return Ok(provided.clone());
            }
            let default = subscription
                .variable_definitions
                .iter()
                .find(|definition| &definition.name == name)
                .and_then(|definition| definition.default_value.as_ref())
                .ok_or_else(|| DocumentError::MissingVariable(name.clone()))?;
            resolve(default, subscription, variables)?
        }
        GqlValue::Int(n) => match n.as_i64() {
            Some(n) => Value::from(n),
            None => return Err(DocumentError::InvalidValue("integer out of range".into())),
        },
        GqlValue::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| DocumentError::InvalidValue(f.to_string()))?,
        GqlValue::String(s) => Value::String(s.clone()),
        GqlValue::Boolean(b) => Value::Bool(*b),
        GqlValue::Null => Value::Null,
        GqlValue::Enum(e) => Value::String(e.clone()),
        GqlValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve(item, subscription, variables))
                .collect::<Result<_, _>>()?,
        ),
        GqlValue::Object(fields) => {
            let mut object = Map::new();
            for (key, field) in fields {
                object.insert(key.clone(), resolve(field, subscription, variables)?);
            }
            Value::Object(object)
        }
    })
}
