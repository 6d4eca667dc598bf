use serde::Serialize;
use serde_json::{Value, json};

/// Structured error envelope returned to the caller's transport.
/// Carries a stable `kind`, a readable message and optional machine-readable
/// details. Never contains credentials or stack traces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    /// Machine-readable error kind (see [`codes`])
    pub kind: String,
    /// Human/agent-readable description of what went wrong
    pub message: String,
    /// Status code, field name, attempt count or suggestion (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Error kinds surfaced by the execution engine
pub mod codes {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const UPSTREAM_API_ERROR: &str = "upstream_api_error";
    pub const TRANSPORT_ERROR: &str = "transport_error";
    pub const UNKNOWN_TOOL: &str = "unknown_tool";
}

/// Failure of a single tool invocation.
///
/// `Validation` is always raised before any network effect. `UpstreamApi` is
/// raised only after retries are exhausted (rate limiting included).
/// `Transport` means the service was never reached or did not answer in time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("invalid parameter '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("upstream API returned HTTP {status} after {attempts} attempt(s)")]
    UpstreamApi {
        status: u16,
        payload: Value,
        attempts: u32,
    },

    #[error("transport failure: {message}")]
    Transport { message: String, timed_out: bool },

    #[error("unknown tool '{name}'")]
    UnknownTool {
        name: String,
        suggestion: Option<String>,
    },
}

impl ToolError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ToolError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Validation { .. } => codes::VALIDATION_ERROR,
            ToolError::UpstreamApi { .. } => codes::UPSTREAM_API_ERROR,
            ToolError::Transport { .. } => codes::TRANSPORT_ERROR,
            ToolError::UnknownTool { .. } => codes::UNKNOWN_TOOL,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let details = match self {
            ToolError::Validation { field, .. } => Some(json!({ "field": field })),
            ToolError::UpstreamApi {
                status,
                payload,
                attempts,
            } => Some(json!({
                "status": status,
                "attempts": attempts,
                "payload": payload
            })),
            ToolError::Transport { timed_out, .. } => Some(json!({ "timedOut": timed_out })),
            ToolError::UnknownTool { suggestion, .. } => suggestion
                .as_ref()
                .map(|name| json!({ "suggestion": name })),
        };
        ErrorEnvelope {
            kind: self.kind().to_string(),
            message: self.to_string(),
            details,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.envelope()).unwrap_or_else(|_| {
            json!({
                "kind": self.kind(),
                "message": self.to_string()
            })
        })
    }
}
