use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Typed field value stored on a record.
///
/// Raw client input is converted into this representation by the record
/// validator; everything downstream (conditions, actions, storage) reads the
/// typed form instead of poking at untyped JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Email(String),
    Reference(String),
    File(String),
    List(Vec<FieldValue>),
}

pub type FieldMap = BTreeMap<String, FieldValue>;

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the inner string for the string-like variants.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Email(s) | Self::Reference(s) | Self::File(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value; text is parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    /// String form used by condition comparison and placeholder rendering.
    pub fn display_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Text(s) | Self::Email(s) | Self::Reference(s) | Self::File(s) => s.clone(),
            Self::Number(n) => format_number(*n),
            Self::Bool(b) => b.to_string(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::DateTime(dt) => dt.to_rfc3339(),
            Self::List(items) => items
                .iter()
                .map(FieldValue::display_string)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Natural JSON rendering for API responses, webhooks and scripts.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Text(s) | Self::Email(s) | Self::Reference(s) | Self::File(s) => {
                serde_json::Value::String(s.clone())
            }
            Self::Number(n) => number_to_json(*n),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Self::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Self::List(items) => serde_json::Value::Array(items.iter().map(FieldValue::to_json).collect()),
        }
    }

    /// Ordering used for in-memory sorting. Values of different kinds compare
    /// by their display strings.
    pub fn sort_cmp(&self, other: &FieldValue) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _) => Ordering::Less,
            (_, Self::Null) => Ordering::Greater,
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
            _ => self.display_string().cmp(&other.display_string()),
        }
    }
}

/// Integral floats print without a fractional part so that `1500.0` and the
/// JSON literal `1500` share one string form.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// String form of an untyped JSON value, matching `FieldValue::display_string`.
pub fn json_display_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        serde_json::Value::Array(items) => items
            .iter()
            .map(json_display_string)
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::Value::Object(_) => value.to_string(),
    }
}

/// Numeric view of an untyped JSON value; strings are parsed.
pub fn json_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}
