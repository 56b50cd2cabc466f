//! Option layering
//!
//! Layers are applied in order (defaults, config file, CLI flags):
//! - Objects: merged by key
//! - Null or absent: keeps the lower layer (an unset CLI flag never clears
//!   a file value)
//! - Anything else: the higher layer wins

use serde_json::Value;

/// Apply `upper` on top of `lower`.
pub fn overlay(lower: Value, upper: Value) -> Value {
    match (lower, upper) {
        (lower, Value::Null) => lower,
        (Value::Object(mut lower_map), Value::Object(upper_map)) => {
            for (key, upper_value) in upper_map {
                let merged = match lower_map.remove(&key) {
                    Some(lower_value) => overlay(lower_value, upper_value),
                    None => upper_value,
                };
                if !merged.is_null() {
                    lower_map.insert(key, merged);
                }
            }
            Value::Object(lower_map)
        }
        (_, upper) => upper,
    }
}

/// Fold layers from lowest to highest precedence.
pub fn fold_layers(layers: impl IntoIterator<Item = Value>) -> Value {
    layers.into_iter().fold(Value::Null, overlay)
}

/// Convert a parsed TOML document into JSON for layering.
pub fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}
