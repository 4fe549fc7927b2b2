//! Tool descriptors

use serde::{Deserialize, Serialize};

use crate::transport::RemoteToolSpec;

/// One parameter of a tool, flattened from its input schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    /// JSON-schema type name (`string`, `number`, `boolean`, ...)
    pub param_type: String,
    pub required: bool,
}

/// The metadata required to include a tool in a prompt and to call it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Fully qualified `<server>.<tool>` name
    pub name: String,
    /// Owning server
    pub server: String,
    /// Bare name on the server
    pub tool: String,
    /// One-line human description
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// Raw JSON schema for parameter validation
    pub input_schema: serde_json::Value,
    /// Whether classifier prompts list this tool
    pub prompt_included: bool,
}

impl ToolDescriptor {
    /// Build a descriptor from a server's remote spec.
    pub fn from_spec(server: &str, spec: RemoteToolSpec, prompt_included: bool) -> Self {
        let params = flatten_schema(&spec.input_schema);
        Self {
            name: format!("{}.{}", server, spec.name),
            server: server.to_string(),
            tool: spec.name,
            description: spec.description,
            params,
            input_schema: spec.input_schema,
            prompt_included,
        }
    }

    /// Render the single line used in classifier and agent prompts.
    pub fn prompt_line(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|p| {
                if p.required {
                    format!("{}: {}", p.name, p.param_type)
                } else {
                    format!("{}?: {}", p.name, p.param_type)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("- {}({}): {}", self.name, params, self.description)
    }
}

/// Flatten a JSON schema's top-level properties into param specs.
fn flatten_schema(schema: &serde_json::Value) -> Vec<ParamSpec> {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| {
            props
                .iter()
                .map(|(name, spec)| ParamSpec {
                    name: name.clone(),
                    param_type: spec
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("any")
                        .to_string(),
                    required: required.contains(&name.as_str()),
                })
                .collect()
        })
        .unwrap_or_default()
}
