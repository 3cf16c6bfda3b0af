//! Tool registry and runtime: schema-validated, policy-guarded, approval-aware
//! tool execution with uniform outcomes.

pub mod fs;
pub mod http;
pub mod process;
pub mod runtime;

pub use runtime::ToolRuntime;

use crate::errors::CodedError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Policy bundle carried into every tool execution.
#[derive(Debug, Clone)]
pub struct Policy {
    pub allowed_commands: Vec<String>,
    pub max_bytes: usize,
    pub timeout: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allowed_commands: Vec::new(),
            max_bytes: crate::safety::DEFAULT_MAX_BYTES,
            timeout: crate::safety::DEFAULT_TIMEOUT,
        }
    }
}

/// Per-invocation context. Built by the runtime from config and the session;
/// never stored by tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub workspace: PathBuf,
    pub policy: Policy,
}

/// A policy-gated operation exposed to the agent loop.
///
/// `id` is dot-namespaced (`fs.read`, `system.run`); `parameters` is a JSON
/// Schema the runtime validates inputs against before `run` is ever called.
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;

    /// Whether invocations must pass the approval flow before running.
    fn requires_approval(&self) -> bool {
        false
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, CodedError>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeMeta {
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// Uniform result of a runtime invoke.
#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    Success {
        data: Value,
        meta: InvokeMeta,
    },
    Failure {
        error: CodedError,
        meta: InvokeMeta,
    },
    /// The invocation is parked on a pending approval request; nothing ran.
    AwaitingApproval {
        invocation_id: String,
        request_id: String,
    },
}

impl InvokeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvokeOutcome::Success { .. })
    }

    /// Wire shape for the gateway. Error messages here are unscrubbed; the
    /// gateway sanitizes at serialization.
    pub fn to_json(&self) -> Value {
        match self {
            InvokeOutcome::Success { data, meta } => serde_json::json!({
                "ok": true,
                "data": data,
                "meta": meta,
            }),
            InvokeOutcome::Failure { error, meta } => serde_json::json!({
                "ok": false,
                "error": { "code": error.code, "message": error.message },
                "meta": meta,
            }),
            InvokeOutcome::AwaitingApproval {
                invocation_id,
                request_id,
            } => serde_json::json!({
                "awaitingApproval": true,
                "invocationId": invocation_id,
                "requestId": request_id,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

/// Transient record of one `invoke` call, spanning any resume after approval.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub id: String,
    pub tool_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub status: InvocationStatus,
    pub started_at: DateTime<Utc>,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CodedError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[test]
    fn meta_omits_truncated_when_false() {
        let meta = InvokeMeta {
            duration_ms: 12,
            truncated: false,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("truncated").is_none());
        assert_eq!(json["durationMs"], 12);
    }

    #[test]
    fn outcome_wire_shapes() {
        let ok = InvokeOutcome::Success {
            data: serde_json::json!({"x": 1}),
            meta: InvokeMeta {
                duration_ms: 5,
                truncated: true,
            },
        };
        let json = ok.to_json();
        assert_eq!(json["ok"], true);
        assert_eq!(json["meta"]["truncated"], true);

        let err = InvokeOutcome::Failure {
            error: CodedError::new(ErrorCode::Timeout, "tool timed out"),
            meta: InvokeMeta {
                duration_ms: 30_000,
                truncated: false,
            },
        };
        let json = err.to_json();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "TIMEOUT");

        let pending = InvokeOutcome::AwaitingApproval {
            invocation_id: "invocation-1".into(),
            request_id: "approval-1".into(),
        };
        let json = pending.to_json();
        assert_eq!(json["awaitingApproval"], true);
        assert_eq!(json["invocationId"], "invocation-1");
    }

    #[test]
    fn invocation_status_wire_form() {
        assert_eq!(
            serde_json::to_string(&InvocationStatus::AwaitingApproval).unwrap(),
            "\"awaiting_approval\""
        );
        assert_eq!(
            serde_json::to_string(&InvocationStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
