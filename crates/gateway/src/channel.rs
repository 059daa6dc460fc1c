//! Topic derivation.
//!
//! A subscription to `eventName` with no argument watches the global topic
//! `prefix + eventName`. With one argument it watches
//! `prefix + eventName + "." + value`. Strings are written verbatim,
//! numbers and booleans as their JSON literal, and anything else as RFC 8785
//! canonical JSON. Only the value is encoded, so [`ChannelRouter::parse`]
//! cannot recover the argument name.
//!
//! The encoding does not keep JSON types apart. `"42"` and `42` share the
//! topic `eventName.42`, `"null"` and `null` share `eventName.null`, and an
//! enum literal `ALL` shares a topic with the string `"ALL"`. Publishers
//! and subscribers that disagree on an argument's type still meet.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Subscription field {event_name} takes at most one argument, got {count}")]
    TooManyArguments { event_name: String, count: usize },

    #[error("Invalid event name: {0:?}")]
    InvalidEventName(String),
}

/// A topic split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub event_name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelRouter {
    prefix: String,
}

impl ChannelRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topic for a subscription to `event_name` with `args`.
    pub fn build(&self, event_name: &str, args: &Map<String, Value>) -> Result<String, ChannelError> {
        validate_event_name(event_name)?;
        match single_argument(event_name, args)? {
            None => Ok(self.global(event_name)),
            Some(value) => Ok(self.specific(event_name, value)),
        }
    }

    /// Every topic an event must be published to: the global topic first,
    /// then the specific one when an argument is present.
    pub fn build_all(
        &self,
        event_name: &str,
        args: &Map<String, Value>,
    ) -> Result<Vec<String>, ChannelError> {
        validate_event_name(event_name)?;
        let mut topics = vec![self.global(event_name)];
        if let Some(value) = single_argument(event_name, args)? {
            topics.push(self.specific(event_name, value));
        }
        Ok(topics)
    }

    /// Split a topic produced by this router. Returns `None` for topics
    /// outside the prefix.
    pub fn parse(&self, topic: &str) -> Option<ParsedTopic> {
        let rest = topic.strip_prefix(self.prefix.as_str())?;
        let (event_name, value) = match rest.split_once('.') {
            Some((event_name, value)) => (event_name, Some(value.to_string())),
            None => (rest, None),
        };
        if event_name.is_empty() {
            return None;
        }
        Some(ParsedTopic {
            event_name: event_name.to_string(),
            value,
        })
    }

    fn global(&self, event_name: &str) -> String {
        format!("{}{}", self.prefix, event_name)
    }

    fn specific(&self, event_name: &str, value: &Value) -> String {
        format!("{}{}.{}", self.prefix, event_name, serialize_argument(value))
    }
}

fn validate_event_name(event_name: &str) -> Result<(), ChannelError> {
    if event_name.is_empty() || event_name.contains('.') {
        return Err(ChannelError::InvalidEventName(event_name.to_string()));
    }
    Ok(())
}

fn single_argument<'a>(
    event_name: &str,
    args: &'a Map<String, Value>,
) -> Result<Option<&'a Value>, ChannelError> {
    if args.len() > 1 {
        return Err(ChannelError::TooManyArguments {
            event_name: event_name.to_string(),
            count: args.len(),
        });
    }
    Ok(args.values().next())
}

/// Render an argument value as it appears in a topic.
pub fn serialize_argument(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_jcs::to_string(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_global_and_specific_topics() {
        let router = ChannelRouter::new("");
        assert_eq!(router.build("itemChanged", &Map::new()).unwrap(), "itemChanged");
        assert_eq!(
            router.build("itemChanged", &args(json!({"id": "42"}))).unwrap(),
            "itemChanged.42"
        );
        assert_eq!(
            router.build("itemChanged", &args(json!({"id": 42}))).unwrap(),
            "itemChanged.42"
        );
        assert_eq!(
            router.build("flagChanged", &args(json!({"on": true}))).unwrap(),
            "flagChanged.true"
        );
    }

    #[test]
    fn test_scalar_types_share_topics() {
        let router = ChannelRouter::new("");
        let topic = |value: Value| {
            let mut map = Map::new();
            map.insert("id".into(), value);
            router.build("itemChanged", &map).unwrap()
        };
        assert_eq!(topic(json!("42")), topic(json!(42)));
        assert_eq!(topic(json!("null")), topic(Value::Null));
        assert_eq!(topic(json!("true")), topic(json!(true)));
    }

    #[test]
    fn test_structured_arguments_are_canonical() {
        let router = ChannelRouter::new("");
        let a = router
            .build("search", &args(json!({"filter": {"b": 1, "a": [1, "x"]}})))
            .unwrap();
        let b = router
            .build("search", &args(json!({"filter": {"a": [1, "x"], "b": 1}})))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, r#"search.{"a":[1,"x"],"b":1}"#);
        assert_eq!(
            router.build("search", &args(json!({"filter": null}))).unwrap(),
            "search.null"
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let router = ChannelRouter::new("app:");
        let input = args(json!({"id": {"nested": [3, 2, 1]}}));
        let first = router.build("itemChanged", &input).unwrap();
        for _ in 0..10 {
            assert_eq!(router.build("itemChanged", &input).unwrap(), first);
        }
    }

    #[test]
    fn test_too_many_arguments_is_rejected() {
        let router = ChannelRouter::new("");
        let err = router
            .build("itemChanged", &args(json!({"id": "42", "status": "A"})))
            .unwrap_err();
        assert_eq!(
            err,
            ChannelError::TooManyArguments {
                event_name: "itemChanged".into(),
                count: 2
            }
        );
        assert!(router
            .build_all("itemChanged", &args(json!({"id": "42", "status": "A"})))
            .is_err());
    }

    #[test]
    fn test_invalid_event_names() {
        let router = ChannelRouter::new("");
        assert!(matches!(
            router.build("", &Map::new()),
            Err(ChannelError::InvalidEventName(_))
        ));
        assert!(matches!(
            router.build("item.changed", &Map::new()),
            Err(ChannelError::InvalidEventName(_))
        ));
    }

    #[test]
    fn test_build_all_puts_global_first() {
        let router = ChannelRouter::new("app:");
        assert_eq!(
            router.build_all("itemChanged", &args(json!({"id": "42"}))).unwrap(),
            vec!["app:itemChanged".to_string(), "app:itemChanged.42".to_string()]
        );
        assert_eq!(
            router.build_all("itemChanged", &Map::new()).unwrap(),
            vec!["app:itemChanged".to_string()]
        );
    }

    #[test]
    fn test_parse() {
        let router = ChannelRouter::new("app:");
        assert_eq!(
            router.parse("app:itemChanged.42"),
            Some(ParsedTopic {
                event_name: "itemChanged".into(),
                value: Some("42".into())
            })
        );
        assert_eq!(
            router.parse("app:itemChanged"),
            Some(ParsedTopic {
                event_name: "itemChanged".into(),
                value: None
            })
        );
        // Values containing dots survive because only the first dot splits.
        assert_eq!(
            router.parse("app:fileChanged.a.txt").and_then(|p| p.value),
            Some("a.txt".into())
        );
        assert_eq!(router.parse("other:itemChanged"), None);
    }
}
