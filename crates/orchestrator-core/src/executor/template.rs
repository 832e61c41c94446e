//! Text template rendering over step `config` (spec §4.4).
//!
//! Pure text substitution, never code execution. References look like
//! `{{ .parameters.db_name }}`, `{{ .outputs.create_db.connection_string }}`,
//! `{{ .metadata.app_name }}`. A missing key renders as the empty string and
//! logs a warning rather than failing the step — the source is lenient here
//! (spec §4.4 step 3a) and a stricter forbid-missing-keys mode was
//! considered and rejected (see DESIGN.md).

use std::collections::HashMap;

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

/// The three top-level namespaces a template may reference (spec §6
/// "Template variables"). No other top-level keys are defined.
#[derive(Debug, Clone, Default)]
pub struct ParameterScope {
    pub parameters: serde_json::Map<String, Value>,
    /// Keyed by step name; each value is that step's full outputs object.
    pub outputs: HashMap<String, Value>,
    pub metadata: serde_json::Map<String, Value>,
}

impl ParameterScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `step_name`'s outputs so later steps can reference
    /// `{{ .outputs.step_name.key }}` (spec §4.4 step 3d).
    pub fn record_step_outputs(&mut self, step_name: &str, outputs: Value) {
        self.outputs.insert(step_name.to_string(), outputs);
    }

    fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let root = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        let mut current = match root {
            "parameters" => Value::Object(self.parameters.clone()),
            "outputs" => {
                let mut map = serde_json::Map::new();
                for (k, v) in &self.outputs {
                    map.insert(k.clone(), v.clone());
                }
                Value::Object(map)
            }
            "metadata" => Value::Object(self.metadata.clone()),
            _ => return None,
        };

        for segment in rest {
            current = current.get(segment)?.clone();
        }
        Some(current)
    }
}

/// Maximum recursion depth when rendering nested config values. Cyclic
/// template references are forbidden; this bound is how that's enforced
/// lazily rather than via an explicit dependency graph (spec §4.4).
pub const MAX_TEMPLATE_DEPTH: usize = 32;

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\s*\}\}").unwrap()
    })
}

fn value_to_template_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Renders every `{{ .path }}` reference in `text` against `scope`.
fn render_string(text: &str, scope: &ParameterScope) -> String {
    template_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            let path = &caps[1];
            match scope.lookup(path) {
                Some(value) => value_to_template_string(&value),
                None => {
                    warn!(path, "template reference not found, rendering empty string");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Renders every string in `config`, recursing into nested objects/arrays up
/// to [`MAX_TEMPLATE_DEPTH`]. Values beyond the depth bound are returned
/// unrendered rather than panicking.
pub fn render_config(
    config: &HashMap<String, Value>,
    scope: &ParameterScope,
) -> HashMap<String, Value> {
    config
        .iter()
        .map(|(k, v)| (k.clone(), render_value(v, scope, 0)))
        .collect()
}

fn render_value(value: &Value, scope: &ParameterScope, depth: usize) -> Value {
    if depth >= MAX_TEMPLATE_DEPTH {
        warn!(depth, "template render depth bound reached, leaving value unrendered");
        return value.clone();
    }
    match value {
        Value::String(s) => Value::String(render_string(s, scope)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, scope, depth + 1))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, scope, depth + 1));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> ParameterScope {
        let mut scope = ParameterScope::new();
        scope.parameters.insert("db_name".into(), json!("orders"));
        scope.metadata.insert("app_name".into(), json!("checkout"));
        scope.record_step_outputs("create_db", json!({"connection_string": "postgres://x"}));
        scope
    }

    #[test]
    fn renders_parameters_outputs_and_metadata() {
        let scope = scope();
        assert_eq!(render_string("{{ .parameters.db_name }}", &scope), "orders");
        assert_eq!(
            render_string("{{ .outputs.create_db.connection_string }}", &scope),
            "postgres://x"
        );
        assert_eq!(render_string("{{ .metadata.app_name }}", &scope), "checkout");
    }

    #[test]
    fn missing_key_renders_empty_string_not_error() {
        let scope = scope();
        assert_eq!(render_string("{{ .parameters.missing }}", &scope), "");
    }

    // Regression test for spec §9: the source once omitted injecting the
    // resource configuration/overrides into the scope at all, so every
    // `{{ .parameters.X }}` rendered as the literal string "<no value>".
    // Here we pin that a populated scope renders through cleanly instead.
    #[test]
    fn parameter_injection_regression_populated_scope_renders_cleanly() {
        let scope = scope();
        let rendered = render_string(
            "db={{ .parameters.db_name }} conn={{ .outputs.create_db.connection_string }}",
            &scope,
        );
        assert_eq!(rendered, "db=orders conn=postgres://x");
        assert!(!rendered.contains("<no value>"));
    }

    #[test]
    fn renders_nested_config_values() {
        let scope = scope();
        let mut config = HashMap::new();
        config.insert(
            "manifest".to_string(),
            json!({"name": "{{ .parameters.db_name }}", "tags": ["{{ .metadata.app_name }}"]}),
        );
        let rendered = render_config(&config, &scope);
        assert_eq!(
            rendered.get("manifest").unwrap(),
            &json!({"name": "orders", "tags": ["checkout"]})
        );
    }

    #[test]
    fn depth_bound_prevents_runaway_recursion() {
        let scope = ParameterScope::new();
        let mut value = json!("leaf");
        for _ in 0..(MAX_TEMPLATE_DEPTH + 5) {
            value = json!([value]);
        }
        // Should not panic/stack-overflow; the bound just leaves the
        // deepest layers unrendered.
        let rendered = render_value(&value, &scope, 0);
        assert!(rendered.is_array());
    }
}
