//! Subscription identity
//!
//! A subscription is a topic narrowed by a filter map. Two subscriptions are
//! the same when their topics match and their filters serialize to the same
//! canonical JSON (object keys sorted recursively, no whitespace).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Filter map attached to a subscription
pub type Filters = Map<String, Value>;

/// A topic plus the filters narrowing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    #[serde(default)]
    pub filters: Filters,
}

impl Subscription {
    /// Create a subscription to `topic` with the given filters
    pub fn new(topic: impl Into<String>, filters: Filters) -> Self {
        Self {
            topic: topic.into(),
            filters,
        }
    }

    /// Create an unfiltered subscription
    pub fn topic(topic: impl Into<String>) -> Self {
        Self::new(topic, Filters::new())
    }

    /// Identity key: topic followed by the canonical filter JSON
    pub fn key(&self) -> String {
        let mut key = self.topic.clone();
        write_canonical(&Value::Object(self.filters.clone()), &mut key);
        key
    }

    /// Whether `other` names the same topic with canonically equal filters
    pub fn matches(&self, other: &Subscription) -> bool {
        self.key() == other.key()
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filters.is_empty() {
            write!(f, "{}", self.topic)
        } else {
            write!(f, "{} {}", self.topic, canonical_json(&Value::Object(self.filters.clone())))
        }
    }
}

/// Serialize a JSON value with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Build a filter map from `key=value` pairs
///
/// Values that parse as JSON keep their JSON type (`limit=10` is a number),
/// anything else is taken as a string.
pub fn filters_from_pairs<I, S>(pairs: I) -> Result<Filters, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut filters = Filters::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(format!("Invalid filter '{}': expected key=value", pair));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid filter '{}': empty key", pair));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        filters.insert(key.to_string(), value);
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filters(value: Value) -> Filters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_key_ignores_filter_order() {
        let a = Subscription::new("dashboard_updated", filters(json!({"userId": "u1", "team": "t"})));
        let b = Subscription::new("dashboard_updated", filters(json!({"team": "t", "userId": "u1"})));
        assert_eq!(a.key(), b.key());
        assert!(a.matches(&b));
    }

    #[test]
    fn test_key_distinguishes_topic_and_values() {
        let a = Subscription::new("dashboard_updated", filters(json!({"userId": "u1"})));
        let b = Subscription::new("dashboard_updated", filters(json!({"userId": "u2"})));
        let c = Subscription::new("widget_updated", filters(json!({"userId": "u1"})));
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_canonical_json_nested() {
        let value = json!({"b": [ {"z": 1, "a": 2} ], "a": {"y": null, "x": true}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"x":true,"y":null},"b":[{"a":2,"z":1}]}"#
        );
    }

    #[test]
    fn test_unfiltered_key() {
        let sub = Subscription::topic("alerts_updated");
        assert_eq!(sub.key(), "alerts_updated{}");
        assert_eq!(sub.to_string(), "alerts_updated");
    }

    #[test]
    fn test_filters_from_pairs() {
        let parsed = filters_from_pairs(["userId=u1", "limit=10", "active=true"]).unwrap();
        assert_eq!(parsed["userId"], json!("u1"));
        assert_eq!(parsed["limit"], json!(10));
        assert_eq!(parsed["active"], json!(true));

        assert!(filters_from_pairs(["missing"]).is_err());
        assert!(filters_from_pairs(["=x"]).is_err());
    }
}
