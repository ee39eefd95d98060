// Payload schemas: the validation layer that runs before a handler sees a
// request. Only the subset the bus methods need is supported: an object
// with required, typed top-level fields. Extra fields are accepted.

use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Array,
    Object,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl JsonType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Null => value.is_null(),
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsonType::Array => "array",
            JsonType::Object => "object",
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
            JsonType::Null => "null",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    required: Vec<(String, JsonType)>,
}

impl Schema {
    /// Any JSON object.
    pub fn object() -> Self {
        Self::default()
    }

    pub fn required(mut self, field: impl Into<String>, ty: JsonType) -> Self {
        self.required.push((field.into(), ty));
        self
    }

    /// Check a payload. The error text is what the caller sees in the
    /// rejection response.
    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        let object = payload
            .as_object()
            .ok_or_else(|| "payload is not a JSON object".to_string())?;
        for (field, ty) in &self.required {
            match object.get(field) {
                None => return Err(format!("missing required field '{}'", field)),
                Some(value) if !ty.matches(value) => {
                    return Err(format!("field '{}' must be of type {}", field, ty));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
