// Placeholder rendering - `{{field}}` substitution from record values
//
// Unknown or null fields leave the placeholder text as it was.

use crm_shared::Record;
use regex::Regex;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("placeholder pattern is valid"));

/// Replace `{{field}}` markers with the record's value for `field`.
pub fn render(template: &str, record: &Record) -> String {
    render_with(template, |key| {
        record
            .field_value(key)
            .filter(|v| !v.is_null())
            .map(|v| v.display_string())
    })
}

/// Replace `{{key}}` markers using an arbitrary lookup.
pub fn render_with<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            let key = caps[1].trim();
            lookup(key).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Render every string inside a JSON value.
pub fn render_json(value: &serde_json::Value, record: &Record) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(render(s, record)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| render_json(v, record)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_json(v, record)))
                .collect(),
        ),
        other => other.clone(),
    }
}
