//! Tool registry and the invocation contract.
//!
//! Tools are registered by name and invoked with JSON input. Every invocation
//! returns a [`ToolResult`]; no failure escapes as a panic or a bare error.

pub mod document;
pub mod encoding;
pub mod media;

use crate::context::ToolContext;
use crate::lifecycle::EngineError;
use crate::traits::BackendError;
use crate::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Rejected before touching the engine.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The engine could not be acquired.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The engine was ready but the operation failed.
    #[error("operation failed: {0}")]
    Operation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ToolError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ToolError::InvalidInput(_) => ErrorCode::InvalidInput,
            ToolError::Engine(e) => e.error_code(),
            ToolError::Operation(_) => ErrorCode::OperationFailed,
            ToolError::Unsupported(_) => ErrorCode::Unsupported,
        }
    }
}

impl From<BackendError> for ToolError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unsupported(m) => ToolError::Unsupported(m),
            other => ToolError::Operation(other.to_string()),
        }
    }
}

/// Parse a tool's typed input from JSON args without consuming them.
pub fn parse_input<T: DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    T::deserialize(args).map_err(|e| ToolError::InvalidInput(e.to_string()))
}

/// One named conversion operation.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Whether the tool delegates to the shared engine.
    fn uses_engine(&self) -> bool {
        false
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Catalog entry for `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub uses_engine: bool,
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry with every built-in tool.
    pub fn new() -> Self {
        let mut reg = Self::empty();
        reg.register(Box::new(encoding::Base64Tool));
        reg.register(Box::new(encoding::HexTool));
        reg.register(Box::new(encoding::UrlTool));
        reg.register(Box::new(document::JsonFormatTool));
        reg.register(Box::new(media::MediaTool::new(media::MediaKind::Audio)));
        reg.register(Box::new(media::MediaTool::new(media::MediaKind::Video)));
        reg.register(Box::new(media::MediaTool::new(media::MediaKind::Image)));
        reg
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Every registered tool, sorted by name.
    pub fn catalog(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name(),
                description: t.description(),
                uses_engine: t.uses_engine(),
            })
            .collect();
        infos.sort_by_key(|i| i.name);
        infos
    }

    /// Invoke a tool by name and wrap the outcome in a [`ToolResult`].
    pub async fn execute(&self, name: &str, args: &Value, ctx: &ToolContext) -> ToolResult<Value> {
        let run_id = new_run_id();
        let start = Instant::now();

        let result = match self.tools.get(name) {
            None => ToolResult::err(format!("unknown tool: {}", name))
                .with_metadata("error_code", ErrorCode::UnknownTool.to_string()),
            Some(tool) => match tool.invoke(args, ctx).await {
                Ok(data) => ToolResult::ok(data),
                Err(e) => {
                    tracing::warn!(tool = name, run_id = %run_id, error = %e, "tool failed");
                    ToolResult::err(e.to_string())
                        .with_metadata("error_code", e.error_code().to_string())
                }
            },
        };

        result
            .with_metadata("run_id", run_id)
            .with_metadata("tool", name)
            .with_metadata("elapsed_ms", start.elapsed().as_millis() as u64)
    }

    /// [`execute`](Self::execute) bounded by `limit`. Expiry only abandons
    /// the wait; an engine load already underway keeps going.
    pub async fn execute_with_timeout(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolContext,
        limit: Duration,
    ) -> ToolResult<Value> {
        match tokio::time::timeout(limit, self.execute(name, args, ctx)).await {
            Ok(r) => r,
            Err(_) => {
                tracing::warn!(tool = name, timeout_ms = limit.as_millis() as u64, "tool timed out");
                ToolResult::err(format!(
                    "'{}' timed out after {}ms",
                    name,
                    limit.as_millis()
                ))
                .with_metadata("error_code", ErrorCode::Timeout.to_string())
                .with_metadata("tool", name)
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
