//! Planner and replanner seams. The LLM-backed planner that decomposes user
//! text into tool steps is a collaborator; the built-in implementations keep
//! the runtime usable end-to-end and give tests a deterministic hook.

use crate::errors::{CodedError, ErrorCode};
use crate::orchestrator::task::TaskMessage;
use crate::session::SessionEntry;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

pub const MAX_STEP_RETRIES: u32 = 3;
pub const MAX_ALTERNATIVE_TOOLS: u32 = 2;
pub const RECOVERY_WALL_CLOCK: Duration = Duration::from_secs(600);

/// A unit of work produced by the planner; resolves to at most one tool
/// invocation. Steps with no tool id produce their description as output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Carried for planners that emit dependency structure; the executor runs
    /// plans strictly in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Step {
    pub fn tool(id: impl Into<String>, description: impl Into<String>, tool_id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool_id: Some(tool_id.into()),
            input: Some(input),
            depends_on: Vec::new(),
        }
    }

    pub fn respond(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool_id: None,
            input: None,
            depends_on: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        message: &TaskMessage,
        history: &[SessionEntry],
    ) -> Result<Vec<Step>, CodedError>;
}

/// Fallback planner: a single no-tool step that echoes the user text.
pub struct EchoPlanner;

#[async_trait]
impl Planner for EchoPlanner {
    async fn plan(
        &self,
        message: &TaskMessage,
        _history: &[SessionEntry],
    ) -> Result<Vec<Step>, CodedError> {
        Ok(vec![Step::respond("step-1", message.text.clone())])
    }
}

/// Failure classification used by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    Permission,
    Validation,
    NotFound,
    Resource,
    Timeout,
    Unknown,
}

pub fn classify(code: ErrorCode) -> ErrorClass {
    match code {
        ErrorCode::InvalidInput
        | ErrorCode::ValidationError
        | ErrorCode::InvalidPath => ErrorClass::Validation,
        ErrorCode::AuthFailed
        | ErrorCode::Unauthorized
        | ErrorCode::ApprovalDenied
        | ErrorCode::ApprovalExpired
        | ErrorCode::CommandBlocked
        | ErrorCode::SsrfBlocked
        | ErrorCode::ProtocolNotAllowed => ErrorClass::Permission,
        ErrorCode::NotFound | ErrorCode::ToolNotFound | ErrorCode::SessionNotFound => {
            ErrorClass::NotFound
        }
        ErrorCode::QueueFull
        | ErrorCode::ResourceExhausted
        | ErrorCode::ConcurrencyLimit
        | ErrorCode::SizeLimit => ErrorClass::Resource,
        ErrorCode::Timeout => ErrorClass::Timeout,
        _ => ErrorClass::Unknown,
    }
}

/// What to do about a failing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPlan {
    Retry,
    UseAlternative(String),
    RequestApproval,
    Abort,
}

impl RecoveryPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPlan::Retry => "retry",
            RecoveryPlan::UseAlternative(_) => "use_alternative",
            RecoveryPlan::RequestApproval => "request_approval",
            RecoveryPlan::Abort => "abort",
        }
    }
}

/// Per-step recovery bookkeeping. The task-level wall clock lives in the
/// executor.
#[derive(Debug, Default)]
pub struct RecoveryState {
    pub retries: u32,
    pub alternatives: u32,
}

pub trait Replanner: Send + Sync {
    fn recover(&self, step: &Step, error: &CodedError, state: &RecoveryState) -> RecoveryPlan;
}

/// Default recovery policy: retry transient failures with backoff, swap in a
/// configured alternative tool when one exists, escalate a blocked command to
/// human approval once, abort everything else.
#[derive(Default)]
pub struct DefaultReplanner {
    /// Map of tool id to a fallback tool tried when the primary keeps failing.
    pub alternatives: std::collections::HashMap<String, String>,
}

impl Replanner for DefaultReplanner {
    fn recover(&self, step: &Step, error: &CodedError, state: &RecoveryState) -> RecoveryPlan {
        match classify(error.code) {
            ErrorClass::Timeout | ErrorClass::Network | ErrorClass::Resource
                if state.retries < MAX_STEP_RETRIES =>
            {
                RecoveryPlan::Retry
            }
            ErrorClass::NotFound | ErrorClass::Unknown => {
                let alternative = step
                    .tool_id
                    .as_ref()
                    .and_then(|id| self.alternatives.get(id));
                match alternative {
                    Some(alt) if state.alternatives < MAX_ALTERNATIVE_TOOLS => {
                        RecoveryPlan::UseAlternative(alt.clone())
                    }
                    _ => RecoveryPlan::Abort,
                }
            }
            ErrorClass::Permission
                if error.code == ErrorCode::CommandBlocked && state.retries == 0 =>
            {
                RecoveryPlan::RequestApproval
            }
            _ => RecoveryPlan::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> Step {
        Step::tool("s1", "list files", "fs.list", serde_json::json!({"path": "."}))
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify(ErrorCode::Timeout), ErrorClass::Timeout);
        assert_eq!(classify(ErrorCode::ValidationError), ErrorClass::Validation);
        assert_eq!(classify(ErrorCode::ApprovalDenied), ErrorClass::Permission);
        assert_eq!(classify(ErrorCode::ToolNotFound), ErrorClass::NotFound);
        assert_eq!(classify(ErrorCode::QueueFull), ErrorClass::Resource);
        assert_eq!(classify(ErrorCode::Unknown), ErrorClass::Unknown);
    }

    #[test]
    fn retries_transient_up_to_limit() {
        let replanner = DefaultReplanner::default();
        let error = CodedError::new(ErrorCode::Timeout, "slow");
        let mut state = RecoveryState::default();
        for _ in 0..MAX_STEP_RETRIES {
            assert_eq!(
                replanner.recover(&step(), &error, &state),
                RecoveryPlan::Retry
            );
            state.retries += 1;
        }
        assert_eq!(
            replanner.recover(&step(), &error, &state),
            RecoveryPlan::Abort
        );
    }

    #[test]
    fn validation_failures_abort_immediately() {
        let replanner = DefaultReplanner::default();
        let error = CodedError::new(ErrorCode::ValidationError, "bad input");
        assert_eq!(
            replanner.recover(&step(), &error, &RecoveryState::default()),
            RecoveryPlan::Abort
        );
    }

    #[test]
    fn alternative_tool_used_when_configured() {
        let mut replanner = DefaultReplanner::default();
        replanner
            .alternatives
            .insert("fs.list".to_string(), "system.run".to_string());
        let error = CodedError::new(ErrorCode::ToolNotFound, "gone");
        assert_eq!(
            replanner.recover(&step(), &error, &RecoveryState::default()),
            RecoveryPlan::UseAlternative("system.run".to_string())
        );

        let exhausted = RecoveryState {
            retries: 0,
            alternatives: MAX_ALTERNATIVE_TOOLS,
        };
        assert_eq!(
            replanner.recover(&step(), &error, &exhausted),
            RecoveryPlan::Abort
        );
    }

    #[test]
    fn blocked_command_escalates_to_approval_once() {
        let replanner = DefaultReplanner::default();
        let error = CodedError::new(ErrorCode::CommandBlocked, "not allowed");
        assert_eq!(
            replanner.recover(&step(), &error, &RecoveryState::default()),
            RecoveryPlan::RequestApproval
        );
        let after = RecoveryState {
            retries: 1,
            alternatives: 0,
        };
        assert_eq!(replanner.recover(&step(), &error, &after), RecoveryPlan::Abort);
    }

    #[tokio::test]
    async fn echo_planner_emits_single_respond_step() {
        let message = TaskMessage {
            agent_id: "a".into(),
            channel_id: "c".into(),
            channel_session_id: None,
            user_id: "u".into(),
            text: "hello there".into(),
        };
        let plan = EchoPlanner.plan(&message, &[]).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan[0].tool_id.is_none());
        assert_eq!(plan[0].description, "hello there");
    }
}
