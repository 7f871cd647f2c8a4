//! Runtime values for factory scripts.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A value held in runner variables and passed over the dispatch wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ScriptValue>),
    Map(HashMap<String, ScriptValue>),
}

impl ScriptValue {
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => ScriptValue::Null,
            JsonValue::Bool(b) => ScriptValue::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ScriptValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    ScriptValue::Float(f)
                } else {
                    ScriptValue::Null
                }
            }
            JsonValue::String(s) => ScriptValue::Str(s.clone()),
            JsonValue::Array(arr) => {
                ScriptValue::List(arr.iter().map(ScriptValue::from_json).collect())
            }
            JsonValue::Object(obj) => {
                let mut entries = HashMap::new();
                for (key, value) in obj {
                    entries.insert(key.clone(), ScriptValue::from_json(value));
                }
                ScriptValue::Map(entries)
            }
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            ScriptValue::Null => JsonValue::Null,
            ScriptValue::Bool(b) => JsonValue::Bool(*b),
            ScriptValue::Int(i) => JsonValue::Number((*i).into()),
            ScriptValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            ScriptValue::Str(s) => JsonValue::String(s.clone()),
            ScriptValue::List(items) => {
                JsonValue::Array(items.iter().map(ScriptValue::to_json).collect())
            }
            ScriptValue::Map(entries) => {
                let map = entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect();
                JsonValue::Object(map)
            }
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            ScriptValue::Null => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Int(i) => *i != 0,
            ScriptValue::Float(f) => *f != 0.0,
            ScriptValue::Str(s) => !s.is_empty(),
            ScriptValue::List(items) => !items.is_empty(),
            ScriptValue::Map(entries) => !entries.is_empty(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(i) => Some(*i),
            ScriptValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Int(i) => Some(*i as f64),
            ScriptValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScriptValue::Null, ScriptValue::Null) => true,
            (ScriptValue::Bool(a), ScriptValue::Bool(b)) => a == b,
            (ScriptValue::Int(a), ScriptValue::Int(b)) => a == b,
            (ScriptValue::Float(a), ScriptValue::Float(b)) => a == b,
            (ScriptValue::Int(a), ScriptValue::Float(b)) => (*a as f64) == *b,
            (ScriptValue::Float(a), ScriptValue::Int(b)) => *a == (*b as f64),
            (ScriptValue::Str(a), ScriptValue::Str(b)) => a == b,
            (ScriptValue::List(a), ScriptValue::List(b)) => a == b,
            (ScriptValue::Map(a), ScriptValue::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Null => write!(f, "none"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Int(i) => write!(f, "{}", i),
            ScriptValue::Float(v) => write!(f, "{}", v),
            ScriptValue::Str(s) => write!(f, "{}", s),
            ScriptValue::List(items) => write!(f, "[{} items]", items.len()),
            ScriptValue::Map(entries) => write!(f, "{{{} keys}}", entries.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let json = serde_json::json!({
            "rc": 0,
            "host": "mill-04",
            "steps": [1, 2.5, "align", true, null],
        });
        let value = ScriptValue::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn mixed_numeric_equality() {
        assert_eq!(ScriptValue::Int(3), ScriptValue::Float(3.0));
        assert_ne!(ScriptValue::Int(3), ScriptValue::Float(3.5));
    }

    #[test]
    fn truthiness() {
        assert!(!ScriptValue::Null.is_truthy());
        assert!(!ScriptValue::Str(String::new()).is_truthy());
        assert!(ScriptValue::Int(-1).is_truthy());
        assert!(!ScriptValue::List(vec![]).is_truthy());
    }
}
