use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// ToolResult – the uniform result envelope of every tool
// ---------------------------------------------------------------------------

/// Free-form annotations attached to a result. Never used for control flow.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Outcome of one tool invocation.
///
/// Either successful with `data`, or failed with `error` – never both, never
/// neither. The fields are private so the only way to build one is through
/// [`ToolResult::ok`] / [`ToolResult::err`]; deserialization checks the same
/// rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "RawToolResult<T>",
    bound(deserialize = "T: Deserialize<'de>")
)]
pub struct ToolResult<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
}

#[derive(Deserialize)]
struct RawToolResult<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    metadata: Option<Metadata>,
}

impl<T> TryFrom<RawToolResult<T>> for ToolResult<T> {
    type Error = String;

    fn try_from(raw: RawToolResult<T>) -> Result<Self, Self::Error> {
        match (raw.success, raw.data, raw.error) {
            (true, Some(data), None) => Ok(Self {
                success: true,
                data: Some(data),
                error: None,
                metadata: raw.metadata,
            }),
            (false, None, Some(error)) => Ok(Self {
                success: false,
                data: None,
                error: Some(error),
                metadata: raw.metadata,
            }),
            (true, _, _) => Err("successful result must carry data and no error".into()),
            (false, _, _) => Err("failed result must carry an error and no data".into()),
        }
    }
}

impl<T> ToolResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ToolResult<U> {
        ToolResult {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
            metadata: self.metadata,
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(data),
            (None, Some(error)) => Err(error),
            (None, None) => Err("result carried neither data nor error".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    UnknownTool,
    EngineUnavailable,
    OperationFailed,
    Unsupported,
    Timeout,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

// ---------------------------------------------------------------------------
// Scenario types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<ScenarioStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioStep {
    Call {
        call: String,
        #[serde(default)]
        args: serde_json::Value,
        #[serde(default)]
        expect: Expectation,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Reset {
        reset: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    #[default]
    Success,
    Failure,
}

fn default_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: Option<String>,
    pub overall_status: ScenarioStatus,
    pub step_results: Vec<ToolResult<serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// Serve / daemon protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub id: String,
    pub result: ToolResult<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Generate a new run ID (UUIDv4).
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
