//! Structural validation of agent output
//!
//! Agents answer in free-form text; a [`Schema`] turns that into a checked
//! JSON value. Violations are always permanent: re-validating the same output
//! cannot succeed, and whether to ask the agent again is the caller's call.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentFailure;

fn default_true() -> bool {
    true
}

/// Expected shape of a JSON value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schema {
    Any,
    Null,
    Bool,
    String {
        #[serde(default)]
        min_len: Option<usize>,
        #[serde(default)]
        max_len: Option<usize>,
        /// Allowed values; empty means unrestricted
        #[serde(default)]
        one_of: Vec<String>,
    },
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        integer: bool,
    },
    Array {
        items: Box<Schema>,
        #[serde(default)]
        min_items: Option<usize>,
        #[serde(default)]
        max_items: Option<usize>,
    },
    Object {
        #[serde(default)]
        fields: BTreeMap<String, Schema>,
        #[serde(default)]
        required: Vec<String>,
        #[serde(default = "default_true")]
        allow_extra: bool,
    },
}

impl Schema {
    pub fn string() -> Self {
        Schema::String {
            min_len: None,
            max_len: None,
            one_of: Vec::new(),
        }
    }

    pub fn number() -> Self {
        Schema::Number {
            min: None,
            max: None,
            integer: false,
        }
    }

    pub fn integer() -> Self {
        Schema::Number {
            min: None,
            max: None,
            integer: true,
        }
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array {
            items: Box::new(items),
            min_items: None,
            max_items: None,
        }
    }

    pub fn object() -> Self {
        Schema::Object {
            fields: BTreeMap::new(),
            required: Vec::new(),
            allow_extra: true,
        }
    }

    /// Add a required field (objects only)
    pub fn field(self, name: &str, schema: Schema) -> Self {
        match self {
            Schema::Object {
                mut fields,
                mut required,
                allow_extra,
            } => {
                fields.insert(name.to_string(), schema);
                required.push(name.to_string());
                Schema::Object {
                    fields,
                    required,
                    allow_extra,
                }
            }
            other => other,
        }
    }

    /// Add an optional field (objects only)
    pub fn optional(self, name: &str, schema: Schema) -> Self {
        match self {
            Schema::Object {
                mut fields,
                required,
                allow_extra,
            } => {
                fields.insert(name.to_string(), schema);
                Schema::Object {
                    fields,
                    required,
                    allow_extra,
                }
            }
            other => other,
        }
    }

    /// Reject unknown fields (objects only)
    pub fn strict(self) -> Self {
        match self {
            Schema::Object { fields, required, .. } => Schema::Object {
                fields,
                required,
                allow_extra: false,
            },
            other => other,
        }
    }

    /// Inclusive numeric range (numbers only)
    pub fn range(self, lo: f64, hi: f64) -> Self {
        match self {
            Schema::Number { integer, .. } => Schema::Number {
                min: Some(lo),
                max: Some(hi),
                integer,
            },
            other => other,
        }
    }

    /// Length bounds (strings and arrays)
    pub fn length(self, lo: usize, hi: usize) -> Self {
        match self {
            Schema::String { one_of, .. } => Schema::String {
                min_len: Some(lo),
                max_len: Some(hi),
                one_of,
            },
            Schema::Array { items, .. } => Schema::Array {
                items,
                min_items: Some(lo),
                max_items: Some(hi),
            },
            other => other,
        }
    }

    /// Restrict a string to a fixed set
    pub fn one_of(self, values: &[&str]) -> Self {
        match self {
            Schema::String { min_len, max_len, .. } => Schema::String {
                min_len,
                max_len,
                one_of: values.iter().map(|v| v.to_string()).collect(),
            },
            other => other,
        }
    }

    fn wants_text(&self) -> bool {
        matches!(self, Schema::Any | Schema::String { .. })
    }
}

/// Check `raw` against `schema`
///
/// A string payload is parsed as JSON when the schema expects structure,
/// including JSON embedded in prose or a fenced code block.
pub fn validate(raw: &Value, schema: &Schema) -> Result<Value, AgentFailure> {
    let value = match raw {
        Value::String(text) if !schema.wants_text() => extract_json(text).ok_or_else(|| {
            AgentFailure::permanent("schema violation: $: expected JSON, found plain text")
        })?,
        other => other.clone(),
    };

    let mut violations = Vec::new();
    check("$", &value, schema, &mut violations);

    if violations.is_empty() {
        Ok(value)
    } else {
        Err(AgentFailure::permanent(format!(
            "schema violation: {}",
            violations.join("; ")
        )))
    }
}

/// Validate then deserialize into `T`
pub fn validate_as<T: DeserializeOwned>(raw: &Value, schema: &Schema) -> Result<T, AgentFailure> {
    let value = validate(raw, schema)?;
    serde_json::from_value(value)
        .map_err(|e| AgentFailure::permanent(format!("schema violation: $: {}", e)))
}

/// Owned schema with the validation contract attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    schema: Schema,
}

impl Validator {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn validate(&self, raw: &Value) -> Result<Value, AgentFailure> {
        validate(raw, &self.schema)
    }

    pub fn validate_as<T: DeserializeOwned>(&self, raw: &Value) -> Result<T, AgentFailure> {
        validate_as(raw, &self.schema)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check(path: &str, value: &Value, schema: &Schema, out: &mut Vec<String>) {
    match (schema, value) {
        (Schema::Any, _) => {}
        (Schema::Null, Value::Null) => {}
        (Schema::Bool, Value::Bool(_)) => {}
        (Schema::String { min_len, max_len, one_of }, Value::String(s)) => {
            let len = s.chars().count();
            if let Some(min) = min_len {
                if len < *min {
                    out.push(format!("{}: length {} below minimum {}", path, len, min));
                }
            }
            if let Some(max) = max_len {
                if len > *max {
                    out.push(format!("{}: length {} above maximum {}", path, len, max));
                }
            }
            if !one_of.is_empty() && !one_of.iter().any(|v| v == s) {
                out.push(format!("{}: '{}' is not one of {:?}", path, s, one_of));
            }
        }
        (Schema::Number { min, max, integer }, Value::Number(n)) => {
            let Some(x) = n.as_f64() else {
                out.push(format!("{}: number out of range", path));
                return;
            };
            if *integer && x.fract() != 0.0 {
                out.push(format!("{}: expected integer, found {}", path, x));
            }
            if let Some(min) = min {
                if x < *min {
                    out.push(format!("{}: {} below minimum {}", path, x, min));
                }
            }
            if let Some(max) = max {
                if x > *max {
                    out.push(format!("{}: {} above maximum {}", path, x, max));
                }
            }
        }
        (Schema::Array { items, min_items, max_items }, Value::Array(values)) => {
            if let Some(min) = min_items {
                if values.len() < *min {
                    out.push(format!("{}: {} items, expected at least {}", path, values.len(), min));
                }
            }
            if let Some(max) = max_items {
                if values.len() > *max {
                    out.push(format!("{}: {} items, expected at most {}", path, values.len(), max));
                }
            }
            for (i, item) in values.iter().enumerate() {
                check(&format!("{}[{}]", path, i), item, items, out);
            }
        }
        (Schema::Object { fields, required, allow_extra }, Value::Object(map)) => {
            for name in required {
                if !map.contains_key(name) {
                    out.push(format!("{}.{}: missing required field", path, name));
                }
            }
            for (name, field_value) in map {
                match fields.get(name) {
                    Some(field_schema) => {
                        check(&format!("{}.{}", path, name), field_value, field_schema, out)
                    }
                    None if !allow_extra => {
                        out.push(format!("{}.{}: unexpected field", path, name));
                    }
                    None => {}
                }
            }
        }
        (expected, found) => {
            let expected = match expected {
                Schema::Any => "any",
                Schema::Null => "null",
                Schema::Bool => "bool",
                Schema::String { .. } => "string",
                Schema::Number { integer: true, .. } => "integer",
                Schema::Number { .. } => "number",
                Schema::Array { .. } => "array",
                Schema::Object { .. } => "object",
            };
            out.push(format!("{}: expected {}, found {}", path, expected, type_name(found)));
        }
    }
}

/// Pull a JSON document out of agent prose
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // ```json ... ``` fences
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map_or(0, |i| i + 1);
        if let Some(end) = after[body_start..].find("```") {
            if let Ok(value) = serde_json::from_str(after[body_start..body_start + end].trim()) {
                return Some(value);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }

    None
}
