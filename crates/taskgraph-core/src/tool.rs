//! Tool contracts: `ToolSpec` (registry entry), `ToolCall`/`ToolResult` (the
//! protocol carried over the model channel) and `ControlEnvelope` (§3, §6).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffects {
    Read,
    Write,
    Exec,
    Network,
    None,
}

impl SideEffects {
    pub fn is_cacheable(self) -> bool {
        matches!(self, SideEffects::Read)
    }
}

/// A tool's tool-group, used by the prompt layer to decide which tools get
/// injected for the current intent (§4.6 "dynamic tool set").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolGroup {
    Minimal,
    Readonly,
    Write,
    Exec,
    Web,
    Task,
    Utility,
}

/// A recursive JSON-Schema-ish record (§3 ToolSpec.args_schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSchema {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Present when `type_name == "object"`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, ArgSchema>,
    /// Present when `type_name == "array"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ArgSchema>>,
    #[serde(default = "default_additional_properties_false")]
    pub additional_properties: bool,
}

fn default_additional_properties_false() -> bool {
    false
}

impl ArgSchema {
    pub fn string() -> Self {
        Self {
            type_name: "string".to_string(),
            required: false,
            enum_values: vec![],
            default: None,
            properties: BTreeMap::new(),
            items: None,
            additional_properties: false,
        }
    }

    pub fn object(properties: BTreeMap<String, ArgSchema>) -> Self {
        Self {
            type_name: "object".to_string(),
            required: false,
            enum_values: vec![],
            default: None,
            properties,
            items: None,
            additional_properties: false,
        }
    }

    /// An empty object schema, built up one field at a time via
    /// [`ArgSchema::with_property`].
    pub fn empty_object() -> Self {
        Self::object(BTreeMap::new())
    }

    pub fn number() -> Self {
        Self {
            type_name: "number".to_string(),
            ..Self::string()
        }
    }

    pub fn integer() -> Self {
        Self {
            type_name: "integer".to_string(),
            ..Self::string()
        }
    }

    pub fn boolean() -> Self {
        Self {
            type_name: "boolean".to_string(),
            ..Self::string()
        }
    }

    pub fn array() -> Self {
        Self {
            type_name: "array".to_string(),
            ..Self::string()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_enum(mut self, values: Vec<serde_json::Value>) -> Self {
        self.enum_values = values;
        self
    }

    /// Inserts `name` into `properties`, for building an object schema one
    /// field at a time rather than constructing the whole `BTreeMap` inline.
    pub fn with_property(mut self, name: impl Into<String>, schema: ArgSchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn with_items(mut self, schema: ArgSchema) -> Self {
        self.items = Some(Box::new(schema));
        self
    }

    pub fn with_additional_properties(mut self, allowed: bool) -> Self {
        self.additional_properties = allowed;
        self
    }
}

/// A registered tool contract (§3 ToolSpec). The registry is process-wide,
/// built once and never mutated after init (§9 "global mutable registries").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub summary: String,
    pub args_schema: ArgSchema,
    pub example_args: serde_json::Value,
    pub side_effects: SideEffects,
    pub visible_in_prompt: bool,
    pub callable_by_model: bool,
    pub group: ToolGroup,
    pub timeout_seconds: Option<u64>,
}

/// `{tool, args}`, parsed from the assistant's JSON output (§3 ToolCall).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub args: serde_json::Value,
}

/// Emitted by the dispatcher for every tool invocation (§3 ToolResult).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub from_cache: bool,
    pub truncated: bool,
}

impl ToolResult {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            ok: true,
            payload,
            error_code: None,
            from_cache: false,
            truncated: false,
        }
    }

    pub fn err(error_code: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            ok: false,
            payload,
            error_code: Some(error_code.into()),
            from_cache: false,
            truncated: false,
        }
    }

    pub fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }
}

/// The structured alternative to a tool call (§3 ControlEnvelope, §6 wire
/// forms: `{"control":"step_done"}` / `{"control":"replan","reason":"..."}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum ControlEnvelope {
    StepDone,
    Replan {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_envelope_round_trips_step_done() {
        let parsed: ControlEnvelope = serde_json::from_str(r#"{"control":"step_done"}"#).unwrap();
        assert_eq!(parsed, ControlEnvelope::StepDone);
    }

    #[test]
    fn control_envelope_round_trips_replan_with_reason() {
        let parsed: ControlEnvelope =
            serde_json::from_str(r#"{"control":"replan","reason":"blocked"}"#).unwrap();
        assert_eq!(
            parsed,
            ControlEnvelope::Replan {
                reason: Some("blocked".to_string())
            }
        );
    }

    #[test]
    fn tool_call_parses_wire_form() {
        let parsed: ToolCall =
            serde_json::from_str(r#"{"tool":"fs.read","args":{"path":"a.rs"}}"#).unwrap();
        assert_eq!(parsed.tool, "fs.read");
    }
}
