//! Declarative tool schemas.
//!
//! Every tool publishes its parameter list as data; the registry validates
//! arguments against it before dispatch. Adding a tool is a new registry
//! entry, not a new type hierarchy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// Human-readable description of the result shape.
    pub returns: String,
}

impl ToolSchema {
    /// Validate an argument map against this schema. Unknown keys are
    /// rejected so schema drift fails loudly instead of being ignored.
    pub fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let Some(map) = args.as_object() else {
            return Err(ToolError::InvalidArguments {
                tool: self.name.clone(),
                reason: "arguments must be an object".to_string(),
            });
        };

        for spec in &self.params {
            match map.get(&spec.name) {
                Some(value) if value.is_null() && !spec.required => {}
                Some(value) if !spec.kind.matches(value) => {
                    return Err(ToolError::InvalidArguments {
                        tool: self.name.clone(),
                        reason: format!("parameter '{}' has the wrong type", spec.name),
                    });
                }
                Some(_) => {}
                None if spec.required => {
                    return Err(ToolError::InvalidArguments {
                        tool: self.name.clone(),
                        reason: format!("missing required parameter '{}'", spec.name),
                    });
                }
                None => {}
            }
        }

        for key in map.keys() {
            if !self.params.iter().any(|p| &p.name == key) {
                return Err(ToolError::InvalidArguments {
                    tool: self.name.clone(),
                    reason: format!("unknown parameter '{key}'"),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ToolSchema {
        ToolSchema {
            name: "demo".into(),
            description: "demo tool".into(),
            params: vec![
                ParamSpec::required("query", ParamKind::String, "the query"),
                ParamSpec::optional("k", ParamKind::Integer, "result count"),
            ],
            returns: "a list".into(),
        }
    }

    #[test]
    fn accepts_valid_arguments() {
        assert!(schema().validate(&json!({"query": "x", "k": 3})).is_ok());
        assert!(schema().validate(&json!({"query": "x"})).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let err = schema().validate(&json!({"k": 3})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn rejects_wrong_type_and_unknown_keys() {
        assert!(schema().validate(&json!({"query": 7})).is_err());
        assert!(schema().validate(&json!({"query": "x", "zz": 1})).is_err());
    }
}
