use crate::errors::{CodedError, ErrorCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Task lifecycle states. Transitions follow a fixed DAG; see
/// [`TaskState::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    AwaitingApproval,
    Done,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Aborted)
    }

    /// The allowed transition DAG:
    ///
    /// ```text
    /// PENDING → RUNNING
    /// RUNNING → AWAITING_APPROVAL | DONE | FAILED | ABORTED
    /// AWAITING_APPROVAL → RUNNING | FAILED
    /// any non-terminal → ABORTED
    /// ```
    pub fn can_transition(self, to: TaskState) -> bool {
        match (self, to) {
            (TaskState::Pending, TaskState::Running) => true,
            (
                TaskState::Running,
                TaskState::AwaitingApproval | TaskState::Done | TaskState::Failed,
            ) => true,
            (TaskState::AwaitingApproval, TaskState::Running | TaskState::Failed) => true,
            (from, TaskState::Aborted) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Status word used in `chat.response` notifications.
    pub fn response_status(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::AwaitingApproval => "awaiting_approval",
            TaskState::Done => "success",
            TaskState::Failed => "failed",
            TaskState::Aborted => "aborted",
        }
    }
}

/// The originating surface message a task was admitted for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub agent_id: String,
    pub channel_id: String,
    /// Channel-scoped session id; defaults to the channel id when absent.
    #[serde(default, rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub channel_session_id: Option<String>,
    pub user_id: String,
    pub text: String,
}

/// One recovery decision taken for a failing step, kept for observability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAttempt {
    pub step_id: String,
    pub action: String,
    pub error_code: ErrorCode,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub message: TaskMessage,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff state is DONE.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Set iff state is FAILED or ABORTED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CodedError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recovery: Vec<RecoveryAttempt>,
}

impl Task {
    pub fn new(message: TaskMessage) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task-{}", Uuid::new_v4()),
            message,
            state: TaskState::Pending,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            recovery: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> TaskMessage {
        TaskMessage {
            agent_id: "a".into(),
            channel_id: "c1".into(),
            channel_session_id: None,
            user_id: "u".into(),
            text: "hello".into(),
        }
    }

    #[test]
    fn new_task_is_pending_with_prefixed_id() {
        let task = Task::new(message());
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.id.starts_with("task-"));
        assert!(task.result.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn transition_dag() {
        use TaskState::*;
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(AwaitingApproval));
        assert!(Running.can_transition(Done));
        assert!(Running.can_transition(Failed));
        assert!(AwaitingApproval.can_transition(Running));
        assert!(AwaitingApproval.can_transition(Failed));

        // Shutdown can abort anything non-terminal.
        assert!(Pending.can_transition(Aborted));
        assert!(Running.can_transition(Aborted));
        assert!(AwaitingApproval.can_transition(Aborted));

        assert!(!Pending.can_transition(Done));
        assert!(!Pending.can_transition(AwaitingApproval));
        assert!(!Done.can_transition(Running));
        assert!(!Done.can_transition(Aborted));
        assert!(!Failed.can_transition(Aborted));
        assert!(!AwaitingApproval.can_transition(Done));
    }

    #[test]
    fn state_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&TaskState::AwaitingApproval).unwrap(),
            "\"AWAITING_APPROVAL\""
        );
    }

    #[test]
    fn message_accepts_wire_form() {
        let msg: TaskMessage = serde_json::from_value(serde_json::json!({
            "agentId": "a",
            "channelId": "c1",
            "sessionId": "s9",
            "userId": "u",
            "text": "echo hi"
        }))
        .unwrap();
        assert_eq!(msg.channel_session_id.as_deref(), Some("s9"));
        assert_eq!(msg.channel_id, "c1");
    }
}
