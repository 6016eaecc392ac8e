//! Declarative parameter schemas for tools.
//!
//! Every tool declares its arguments as a flat list of typed fields. The same
//! declaration is rendered as JSON Schema for the model and used by the
//! registry to validate arguments before a handler ever sees them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamKind {
    fn json_type(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub properties: Vec<ParameterSpec>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.properties.push(ParameterSpec {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.properties.push(ParameterSpec {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: false,
        });
        self
    }

    /// Renders the schema as a JSON Schema object.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    json!({ "type": p.kind.json_type(), "description": p.description }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .properties
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Checks `args` against the schema and returns them as an object.
    ///
    /// `null` is accepted as an empty object. Optional fields may be `null`;
    /// those are dropped from the returned object.
    pub fn validate(&self, args: Value) -> Result<Map<String, Value>, String> {
        let mut object = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => return Err(format!("arguments must be an object, got {}", kind_of(&other))),
        };

        if let Some(unknown) = object
            .keys()
            .find(|key| !self.properties.iter().any(|p| &p.name == *key))
        {
            return Err(format!("unexpected argument '{unknown}'"));
        }

        let mut nulls = Vec::new();
        for spec in &self.properties {
            match object.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required argument '{}'", spec.name));
                }
                None => {}
                Some(Value::Null) => nulls.push(spec.name.as_str()),
                Some(value) if !spec.kind.matches(value) => {
                    return Err(format!(
                        "argument '{}' must be of type {}, got {}",
                        spec.name,
                        spec.kind.json_type(),
                        kind_of(value)
                    ));
                }
                Some(_) => {}
            }
        }
        for name in nulls {
            object.remove(name);
        }
        Ok(object)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
