//! The condition language used by `branch` steps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single comparison against instance data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Dot-separated path resolved against instance data, e.g. `"order.total"`.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
}

/// Resolve a dot-separated path against a JSON value.
///
/// Descent stops and yields `None` as soon as an intermediate segment is not
/// an object, mirroring the original connector's `resolve_field`.
pub fn resolve_field<'a>(data: &'a Value, field_path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in field_path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

impl Condition {
    /// Evaluate this condition against instance data.
    pub fn evaluate(&self, data: &Value) -> bool {
        let actual = resolve_field(data, &self.field);
        match self.operator {
            ConditionOperator::Exists => actual.is_some_and(|v| !v.is_null()),
            ConditionOperator::Neq => actual != Some(&self.value),
            _ => match actual {
                None => false,
                Some(actual) => match self.operator {
                    ConditionOperator::Eq => actual == &self.value,
                    ConditionOperator::Contains => contains(actual, &self.value),
                    ConditionOperator::Gt | ConditionOperator::Gte | ConditionOperator::Lt | ConditionOperator::Lte => {
                        compare_numbers(actual, &self.value, self.operator)
                    }
                    ConditionOperator::Exists | ConditionOperator::Neq => unreachable!(),
                },
            },
        }
    }
}

fn compare_numbers(actual: &Value, expected: &Value, op: ConditionOperator) -> bool {
    let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) else {
        return false;
    };
    match op {
        ConditionOperator::Gt => a > b,
        ConditionOperator::Gte => a >= b,
        ConditionOperator::Lt => a < b,
        ConditionOperator::Lte => a <= b,
        _ => unreachable!(),
    }
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::Array(items) => items.contains(needle),
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(field: &str, op: ConditionOperator, value: Value) -> Condition {
        Condition {
            field: field.into(),
            operator: op,
            value,
        }
    }

    #[test]
    fn resolves_nested_field() {
        let data = json!({"x": {"v": 20}});
        assert_eq!(resolve_field(&data, "x.v"), Some(&json!(20)));
    }

    #[test]
    fn resolve_stops_at_non_object_intermediate() {
        let data = json!({"x": 5});
        assert_eq!(resolve_field(&data, "x.v"), None);
    }

    #[test]
    fn gt_against_missing_field_is_false() {
        let data = json!({});
        assert!(!cond("x.v", ConditionOperator::Gt, json!(10)).evaluate(&data));
    }

    #[test]
    fn gt_true_and_false_branches() {
        assert!(cond("x.v", ConditionOperator::Gt, json!(10)).evaluate(&json!({"x": {"v": 20}})));
        assert!(!cond("x.v", ConditionOperator::Gt, json!(10)).evaluate(&json!({"x": {"v": 5}})));
    }

    #[test]
    fn exists_and_neq_treat_missing_specially() {
        let data = json!({});
        assert!(!cond("x", ConditionOperator::Exists, Value::Null).evaluate(&data));
        assert!(cond("x", ConditionOperator::Neq, json!("a")).evaluate(&data));
    }

    #[test]
    fn contains_checks_array_membership() {
        let data = json!({"tags": ["a", "b"]});
        assert!(cond("tags", ConditionOperator::Contains, json!("a")).evaluate(&data));
        assert!(!cond("tags", ConditionOperator::Contains, json!("c")).evaluate(&data));
    }

    #[test]
    fn unknown_operator_cases_covered_by_match_exhaustiveness() {
        // eq against equal value is true
        assert!(cond("x", ConditionOperator::Eq, json!(1)).evaluate(&json!({"x": 1})));
    }
}
