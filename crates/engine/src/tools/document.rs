//! Structured-document tools – pure computation, no engine.

use super::{parse_input, Tool, ToolError};
use crate::context::ToolContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonMode {
    Pretty,
    Minify,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonFormatInput {
    pub data: String,
    pub mode: JsonMode,
}

pub fn format_json(input: &JsonFormatInput) -> Result<String, ToolError> {
    if input.data.trim().is_empty() {
        return Err(ToolError::InvalidInput("'data' must not be empty".into()));
    }
    let doc: Value = serde_json::from_str(&input.data)
        .map_err(|e| ToolError::InvalidInput(format!("invalid JSON: {}", e)))?;
    let out = match input.mode {
        JsonMode::Pretty => serde_json::to_string_pretty(&doc),
        JsonMode::Minify => serde_json::to_string(&doc),
    };
    out.map_err(|e| ToolError::Operation(e.to_string()))
}

/// `json_format` – `{ "data": "<json text>", "mode": "pretty" | "minify" }`
pub struct JsonFormatTool;

#[async_trait::async_trait]
impl Tool for JsonFormatTool {
    fn name(&self) -> &'static str {
        "json_format"
    }

    fn description(&self) -> &'static str {
        "Pretty-print or minify a JSON document"
    }

    async fn invoke(&self, args: &Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let input: JsonFormatInput = parse_input(args)?;
        let result = format_json(&input)?;
        Ok(serde_json::json!({
            "result": result,
            "mode": input.mode,
            "length": result.len(),
        }))
    }
}
