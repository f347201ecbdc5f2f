//! `{{dotted.path}}` template resolution for step config, evaluated against
//! instance data before a handler runs.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").unwrap())
}

/// Resolve a dot-separated path against instance data.
fn resolve_field<'a>(data: &'a Value, field_path: &str) -> Option<&'a Value> {
    let mut current = data;
    for part in field_path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn value_to_template_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{{field.path}}` placeholder in `text` with its resolved
/// value from `data`, left untouched if the path doesn't resolve.
pub fn resolve_template(text: &str, data: &Value) -> String {
    template_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            let field_path = &caps[1];
            match resolve_field(data, field_path) {
                Some(value) => value_to_template_text(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolve template placeholders through a config value: descends into
/// mappings at any depth, but walks list items only one level — a string
/// item is resolved, a nested object or array is left as-is.
pub fn resolve_config(config: &Value, data: &Value) -> Value {
    match config {
        Value::String(s) => Value::String(resolve_template(s, data)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_config(v, data)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Value::String(resolve_template(s, data)),
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_placeholder() {
        let data = json!({"order": {"amount": 42}});
        assert_eq!(resolve_template("total: {{order.amount}}", &data), "total: 42");
    }

    #[test]
    fn leaves_unresolved_placeholder_untouched() {
        let data = json!({});
        assert_eq!(resolve_template("hi {{missing.field}}", &data), "hi {{missing.field}}");
    }

    #[test]
    fn deep_resolves_nested_config() {
        let data = json!({"user": {"name": "ada"}});
        let config = json!({"greeting": "hello {{user.name}}", "nested": {"who": "{{user.name}}"}});
        let resolved = resolve_config(&config, &data);
        assert_eq!(resolved["greeting"], json!("hello ada"));
        assert_eq!(resolved["nested"]["who"], json!("ada"));
    }

    #[test]
    fn non_string_values_pass_through() {
        let data = json!({});
        let config = json!({"count": 3, "enabled": true});
        assert_eq!(resolve_config(&config, &data), config);
    }

    #[test]
    fn array_items_resolve_one_level_only() {
        let data = json!({"user": {"name": "ada"}});
        let config = json!({
            "tags": ["{{user.name}}", "static"],
            "nested": [{"who": "{{user.name}}"}, ["{{user.name}}"]],
        });
        let resolved = resolve_config(&config, &data);

        assert_eq!(resolved["tags"], json!(["ada", "static"]));
        // Nested objects/arrays inside a list are left untouched.
        assert_eq!(resolved["nested"][0], json!({"who": "{{user.name}}"}));
        assert_eq!(resolved["nested"][1], json!(["{{user.name}}"]));
    }
}
