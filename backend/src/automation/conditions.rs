// Automation Conditions - Evaluate rule conditions and workflow criteria against a record
//
// Conditions AND-combine and stop at the first miss. A condition whose field is
// absent (or null) never matches, whatever its operator.

use crm_shared::{
    json_as_f64, json_display_string, ConditionOperator, FieldValue, Record, RuleCondition,
};

/// True when every condition holds for the record. An empty list matches.
pub fn matches(conditions: &[RuleCondition], record: &Record) -> bool {
    conditions.iter().all(|c| evaluate(c, record))
}

/// Evaluate a single condition.
pub fn evaluate(condition: &RuleCondition, record: &Record) -> bool {
    let Some(value) = record.field_value(&condition.field) else {
        return false;
    };
    if value.is_null() {
        return false;
    }

    let target = &condition.value;

    match condition.operator {
        ConditionOperator::Equals => value.display_string() == json_display_string(target),
        ConditionOperator::NotEquals => value.display_string() != json_display_string(target),
        ConditionOperator::Contains => contains(&value, target),
        ConditionOperator::Gt => compare(&value, target).is_some_and(|(v, t)| v > t),
        ConditionOperator::Lt => compare(&value, target).is_some_and(|(v, t)| v < t),
    }
}

fn contains(value: &FieldValue, target: &serde_json::Value) -> bool {
    let needle = json_display_string(target);
    match value {
        FieldValue::List(items) => items.iter().any(|item| item.display_string() == needle),
        other => match other.as_str() {
            Some(haystack) => haystack.contains(&needle),
            None => false,
        },
    }
}

fn compare(value: &FieldValue, target: &serde_json::Value) -> Option<(f64, f64)> {
    Some((value.as_f64()?, json_as_f64(target)?))
}
