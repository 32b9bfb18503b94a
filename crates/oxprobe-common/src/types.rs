use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single field value carried by a [`Point`].
///
/// Serialized untagged so that the wire form is the bare JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value. Booleans map to 0/1, text to `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Text(_) => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Number(v as f64)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Number(v as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// One observation destined for the time-series database.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use oxprobe_common::types::Point;
///
/// let point = Point::new("cpu.usage", Utc::now())
///     .tag("core", "0")
///     .field("user", 12.5);
/// assert_eq!(point.tags["core"], "0");
/// assert_eq!(point.fields["user"].as_f64(), Some(12.5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Dot-separated metric path, e.g. `network.interface`.
    pub name: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub fields: HashMap<String, FieldValue>,
    pub time: DateTime<Utc>,
}

impl Point {
    pub fn new(name: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            tags: HashMap::new(),
            fields: HashMap::new(),
            time,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Adds every `(key, value)` pair as a numeric field.
    pub fn fields<I, K>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        for (k, v) in values {
            self.fields.insert(k.into(), FieldValue::Number(v));
        }
        self
    }
}

/// Describes one configuration parameter of an agent or transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDoc {
    pub name: String,
    /// Value type as shown to operators (`string`, `integer`, `duration`...).
    pub kind: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ParamDoc {
    pub fn new(name: &str, kind: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            description: description.to_string(),
            default: None,
        }
    }

    pub fn with_default(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }
}

/// Introspection manifest returned by `describe` on the plugin registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doc {
    pub summary: String,
    #[serde(default)]
    pub params: Vec<ParamDoc>,
    /// Emitted measurement names mapped to a short description.
    #[serde(default)]
    pub metrics: Vec<(String, String)>,
}

impl Doc {
    pub fn new(summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    pub fn param(mut self, param: ParamDoc) -> Self {
        self.params.push(param);
        self
    }

    pub fn metric(mut self, name: &str, description: &str) -> Self {
        self.metrics.push((name.to_string(), description.to_string()));
        self
    }
}
