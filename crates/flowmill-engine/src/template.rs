use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use flowmill_core::types::Variables;

use crate::expr::lookup;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}")
            .expect("placeholder pattern is valid")
    })
}

/// Replace `${path.to.var}` placeholders with variable values.
///
/// Unresolved placeholders are left verbatim; this never fails.
pub fn render(template: &str, vars: &Variables) -> String {
    if !template.contains("${") {
        return template.to_string();
    }
    placeholder()
        .replace_all(template, |caps: &Captures| {
            let path: Vec<&str> = caps[1].split('.').collect();
            match lookup(vars, &path) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => caps[0].to_string(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

/// Render every string leaf of a JSON value.
pub fn render_value(value: &Value, vars: &Variables) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(render_map(map, vars)),
        other => other.clone(),
    }
}

pub fn render_map(map: &Variables, vars: &Variables) -> Variables {
    map.iter()
        .map(|(k, v)| (k.clone(), render_value(v, vars)))
        .collect()
}
