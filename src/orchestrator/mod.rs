//! Task orchestrator: admission, the per-task agent loop
//! (plan → execute → recover), approval suspension, cancellation, and
//! terminal event fan-out.

pub mod planner;
pub mod task;

use crate::approval::{ApprovalManager, ApprovalRequest, ApprovalStatus};
use crate::bus::{CancelToken, Event, EventBus};
use crate::errors::{CodedError, ErrorCode};
use crate::orchestrator::planner::{
    Planner, RecoveryPlan, RecoveryState, Replanner, Step, RECOVERY_WALL_CLOCK,
};
use crate::orchestrator::task::{RecoveryAttempt, Task, TaskMessage, TaskState};
use crate::queue::{ChannelQueues, QueueItem, TaskRunner};
use crate::session::{EntryKind, Session, SessionEntry, SessionStore};
use crate::tools::{InvokeMeta, InvokeOutcome, ToolRuntime};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
const HISTORY_FOR_PLANNER: usize = 50;
const RETRY_BACKOFF_BASE_MS: u64 = 100;
const MAX_RETRY_BACKOFF_MS: u64 = 2_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub task_id: String,
    pub status: &'static str,
}

struct TaskEntry {
    task: Task,
    cancel: CancelToken,
    pending_request: Option<String>,
}

pub struct Orchestrator {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    queues: Arc<ChannelQueues>,
    runtime: Arc<ToolRuntime>,
    approvals: Arc<ApprovalManager>,
    sessions: Arc<SessionStore>,
    planner: Arc<dyn Planner>,
    replanner: Arc<dyn Replanner>,
    bus: EventBus,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        queues: Arc<ChannelQueues>,
        runtime: Arc<ToolRuntime>,
        approvals: Arc<ApprovalManager>,
        sessions: Arc<SessionStore>,
        planner: Arc<dyn Planner>,
        replanner: Arc<dyn Replanner>,
        bus: EventBus,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            queues: Arc::clone(&queues),
            runtime,
            approvals,
            sessions,
            planner,
            replanner,
            bus,
            shutting_down: AtomicBool::new(false),
        });
        queues.set_runner(Arc::clone(&orchestrator) as Arc<dyn TaskRunner>);
        orchestrator
    }

    /// Admit a surface message as a task: construct, enqueue on its channel,
    /// return immediately. `QUEUE_FULL` surfaces to the caller untouched.
    pub fn create_task(&self, message: TaskMessage) -> Result<TaskResponse, CodedError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CodedError::new(
                ErrorCode::AbortedByShutdown,
                "runtime is shutting down",
            ));
        }
        let task = Task::new(message);
        let task_id = task.id.clone();
        let channel_id = task.message.channel_id.clone();
        let cancel = CancelToken::new();

        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                task_id.clone(),
                TaskEntry {
                    task,
                    cancel: cancel.clone(),
                    pending_request: None,
                },
            );

        let item = QueueItem {
            task_id: task_id.clone(),
            cancel,
        };
        if let Err(err) = self.queues.enqueue(&channel_id, item) {
            self.tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&task_id);
            return Err(err);
        }
        debug!(task_id = %task_id, channel = %channel_id, "task admitted");
        Ok(TaskResponse {
            task_id,
            status: "pending",
        })
    }

    pub fn queues(&self) -> &Arc<ChannelQueues> {
        &self.queues
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .map(|e| e.task.clone())
    }

    pub fn grant_approval(
        &self,
        request_id: &str,
        approved: bool,
        responded_by: &str,
    ) -> Result<ApprovalStatus, CodedError> {
        self.approvals.handle_response(request_id, approved, responded_by)
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.approvals.list_pending()
    }

    /// Attempt to cancel a task. Queued tasks terminate immediately; running
    /// tasks observe the token at their next suspension point; parked tasks
    /// get their pending approval rejected.
    pub fn abort_task(&self, id: &str) -> Result<(), CodedError> {
        let (cancel, state, pending_request) = {
            let tasks = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = tasks
                .get(id)
                .ok_or_else(|| CodedError::new(ErrorCode::NotFound, "task not found"))?;
            if entry.task.state.is_terminal() {
                return Err(CodedError::new(
                    ErrorCode::InvalidInput,
                    "task already finished",
                ));
            }
            (
                entry.cancel.clone(),
                entry.task.state,
                entry.pending_request.clone(),
            )
        };

        cancel.cancel();
        match state {
            TaskState::Pending => {
                if self.queues.remove_queued(id) {
                    self.finalize(
                        id,
                        TaskState::Aborted,
                        None,
                        Some(CodedError::new(ErrorCode::AbortedByUser, "task aborted")),
                    );
                }
                // Otherwise the worker already claimed it and will observe
                // the token before running any step.
            }
            TaskState::AwaitingApproval => {
                if let Some(request_id) = pending_request {
                    // Reject the gate; the parked loop also wakes via the
                    // token and terminates the task.
                    let _ = self.approvals.handle_response(&request_id, false, "system:abort");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Cancel every live task, fail pending approvals, and wait for workers
    /// to drain (bounded). Late `create_task` calls fail `ABORTED_BY_SHUTDOWN`.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let live: Vec<(String, CancelToken)> = {
            let tasks = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            tasks
                .iter()
                .filter(|(_, e)| !e.task.state.is_terminal())
                .map(|(id, e)| (id.clone(), e.cancel.clone()))
                .collect()
        };
        info!("shutting down, aborting {} live task(s)", live.len());
        for (_, cancel) in &live {
            cancel.cancel();
        }
        self.approvals.reject_all_pending("system:shutdown");

        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while Instant::now() < deadline {
            let pending_tasks = {
                let tasks = self
                    .tasks
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                // Queued tasks whose worker never ran are finalized here
                // rather than waited on.
                live.iter()
                    .filter(|(id, _)| {
                        tasks.get(id).is_some_and(|e| {
                            if e.task.state == TaskState::Pending {
                                return false;
                            }
                            !e.task.state.is_terminal()
                        })
                    })
                    .count()
            };
            if pending_tasks == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for (id, _) in &live {
            let still_pending = self
                .get_task(id)
                .is_some_and(|t| !t.state.is_terminal());
            if still_pending {
                self.queues.remove_queued(id);
                self.finalize(
                    id,
                    TaskState::Aborted,
                    None,
                    Some(CodedError::new(
                        ErrorCode::AbortedByShutdown,
                        "runtime shut down",
                    )),
                );
            }
        }
    }

    fn abort_error(&self) -> CodedError {
        if self.shutting_down.load(Ordering::SeqCst) {
            CodedError::new(ErrorCode::AbortedByShutdown, "runtime shut down")
        } else {
            CodedError::new(ErrorCode::AbortedByUser, "task aborted")
        }
    }

    fn set_state(&self, task_id: &str, to: TaskState) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = tasks.get_mut(task_id) {
            if entry.task.state.can_transition(to) {
                entry.task.state = to;
                entry.task.updated_at = chrono::Utc::now();
            } else {
                warn!(
                    task_id,
                    from = ?entry.task.state,
                    to = ?to,
                    "illegal task state transition suppressed"
                );
            }
        }
    }

    fn set_pending_request(&self, task_id: &str, request_id: Option<String>) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = tasks.get_mut(task_id) {
            entry.pending_request = request_id;
        }
    }

    fn record_recovery(&self, task_id: &str, step_id: &str, action: &str, code: ErrorCode) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = tasks.get_mut(task_id) {
            entry.task.recovery.push(RecoveryAttempt {
                step_id: step_id.to_string(),
                action: action.to_string(),
                error_code: code,
                at: chrono::Utc::now(),
            });
        }
    }

    /// Move a task to a terminal state and fan the outcome out on the bus.
    fn finalize(
        &self,
        task_id: &str,
        state: TaskState,
        result: Option<Value>,
        error: Option<CodedError>,
    ) {
        debug_assert!(state.is_terminal());
        let event = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(entry) = tasks.get_mut(task_id) else {
                return;
            };
            if entry.task.state.is_terminal() {
                return;
            }
            if !entry.task.state.can_transition(state) {
                warn!(
                    task_id,
                    from = ?entry.task.state,
                    to = ?state,
                    "illegal terminal transition suppressed"
                );
                return;
            }
            entry.task.state = state;
            entry.task.result = result.clone();
            entry.task.error = error.clone();
            entry.task.updated_at = chrono::Utc::now();
            entry.pending_request = None;
            Event::TaskFinished {
                task_id: task_id.to_string(),
                channel_id: entry.task.message.channel_id.clone(),
                state,
                result,
                error,
            }
        };
        self.bus.publish(event);
    }

    async fn run_task(&self, item: QueueItem) {
        let task_id = item.task_id.clone();
        let cancel = item.cancel;

        let message = {
            let tasks = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match tasks.get(&task_id) {
                Some(entry) => entry.task.message.clone(),
                None => return,
            }
        };
        if cancel.is_cancelled() {
            self.finalize(&task_id, TaskState::Aborted, None, Some(self.abort_error()));
            return;
        }
        self.set_state(&task_id, TaskState::Running);

        let session = match self.sessions.get_or_create(
            &message.agent_id,
            &message.user_id,
            &message.channel_id,
            message.channel_session_id.as_deref(),
        ) {
            Ok(session) => session,
            Err(e) => {
                self.finalize(
                    &task_id,
                    TaskState::Failed,
                    None,
                    Some(CodedError::internal_error(format!("session: {}", e))),
                );
                return;
            }
        };
        append_entry(
            &session,
            EntryKind::User,
            Value::String(message.text.clone()),
        );

        let steps = match self
            .planner
            .plan(&message, &session.history(HISTORY_FOR_PLANNER))
            .await
        {
            Ok(steps) => steps,
            Err(error) => {
                append_entry(&session, EntryKind::Error, error_entry(&error));
                self.finalize(&task_id, TaskState::Failed, None, Some(error));
                return;
            }
        };

        let mut last_output = Value::Null;
        for mut step in steps {
            if cancel.is_cancelled() {
                let error = self.abort_error();
                append_entry(&session, EntryKind::Error, error_entry(&error));
                self.finalize(&task_id, TaskState::Aborted, None, Some(error));
                return;
            }
            self.bus.publish(Event::TaskProgress {
                task_id: task_id.clone(),
                channel_id: message.channel_id.clone(),
                description: step.description.clone(),
            });

            match self
                .run_step(&task_id, &message, &session, &mut step, &cancel)
                .await
            {
                Ok(output) => last_output = output,
                Err(error) => {
                    append_entry(&session, EntryKind::Error, error_entry(&error));
                    let terminal = if matches!(
                        error.code,
                        ErrorCode::AbortedByUser | ErrorCode::AbortedByShutdown
                    ) {
                        TaskState::Aborted
                    } else {
                        TaskState::Failed
                    };
                    self.finalize(&task_id, terminal, None, Some(error));
                    return;
                }
            }
        }

        append_entry(&session, EntryKind::Result, last_output.clone());
        self.finalize(&task_id, TaskState::Done, Some(last_output), None);
    }

    /// Execute one step, consulting the replanner on failure. Approval
    /// suspension happens in here: the task parks in AWAITING_APPROVAL until
    /// the gate resolves or the task is cancelled.
    async fn run_step(
        &self,
        task_id: &str,
        message: &TaskMessage,
        session: &Arc<Session>,
        step: &mut Step,
        cancel: &CancelToken,
    ) -> Result<Value, CodedError> {
        let mut recovery = RecoveryState::default();
        let mut force_approval = false;
        let recovery_started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(self.abort_error());
            }

            let outcome = match &step.tool_id {
                None => InvokeOutcome::Success {
                    data: serde_json::json!({ "text": step.description }),
                    meta: InvokeMeta {
                        duration_ms: 0,
                        truncated: false,
                    },
                },
                Some(tool_id) => {
                    let input = step.input.clone().unwrap_or_else(|| serde_json::json!({}));
                    if force_approval {
                        self.runtime
                            .invoke_requiring_approval(
                                tool_id,
                                &session.id,
                                input,
                                &message.agent_id,
                                &message.user_id,
                                cancel,
                            )
                            .await
                    } else {
                        self.runtime
                            .invoke(
                                tool_id,
                                &session.id,
                                input,
                                &message.agent_id,
                                &message.user_id,
                                cancel,
                            )
                            .await
                    }
                }
            };
            force_approval = false;

            let step_result = match outcome {
                InvokeOutcome::Success { data, .. } => Ok(data),
                InvokeOutcome::Failure { error, .. } => Err(error),
                InvokeOutcome::AwaitingApproval {
                    invocation_id,
                    request_id,
                } => {
                    self.await_approval(task_id, &invocation_id, &request_id, cancel)
                        .await
                }
            };

            match step_result {
                Ok(data) => {
                    if let Some(tool_id) = &step.tool_id {
                        append_entry(
                            session,
                            EntryKind::Tool,
                            serde_json::json!({ "tool": tool_id, "output": data }),
                        );
                    }
                    return Ok(data);
                }
                Err(error) => {
                    if cancel.is_cancelled() {
                        return Err(self.abort_error());
                    }
                    if recovery_started.elapsed() > RECOVERY_WALL_CLOCK {
                        warn!(task_id, step = %step.id, "recovery wall clock exhausted");
                        return Err(error);
                    }
                    let plan = self.replanner.recover(step, &error, &recovery);
                    self.record_recovery(task_id, &step.id, plan.as_str(), error.code);
                    debug!(
                        task_id,
                        step = %step.id,
                        code = error.code.as_str(),
                        action = plan.as_str(),
                        "step recovery"
                    );
                    match plan {
                        RecoveryPlan::Retry => {
                            recovery.retries += 1;
                            let backoff = (RETRY_BACKOFF_BASE_MS << recovery.retries.min(8))
                                .min(MAX_RETRY_BACKOFF_MS);
                            tokio::select! {
                                () = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                                () = cancel.cancelled() => return Err(self.abort_error()),
                            }
                        }
                        RecoveryPlan::UseAlternative(alternative) => {
                            recovery.alternatives += 1;
                            recovery.retries = 0;
                            step.tool_id = Some(alternative);
                        }
                        RecoveryPlan::RequestApproval => {
                            recovery.retries += 1;
                            force_approval = true;
                        }
                        RecoveryPlan::Abort => return Err(error),
                    }
                }
            }
        }
    }

    /// Park the task on a pending approval gate, then resume (or fail) based
    /// on the resolution.
    async fn await_approval(
        &self,
        task_id: &str,
        invocation_id: &str,
        request_id: &str,
        cancel: &CancelToken,
    ) -> Result<Value, CodedError> {
        self.set_state(task_id, TaskState::AwaitingApproval);
        self.set_pending_request(task_id, Some(request_id.to_string()));

        let receiver = self.approvals.subscribe(request_id);
        let status = tokio::select! {
            resolved = receiver => resolved.unwrap_or(ApprovalStatus::Rejected),
            () = cancel.cancelled() => {
                let _ = self.approvals.handle_response(request_id, false, "system:abort");
                self.set_pending_request(task_id, None);
                return Err(self.abort_error());
            }
        };
        self.set_pending_request(task_id, None);

        if cancel.is_cancelled() {
            return Err(self.abort_error());
        }
        if status == ApprovalStatus::Approved {
            self.set_state(task_id, TaskState::Running);
        }
        match self.runtime.resume(invocation_id, status, cancel).await {
            InvokeOutcome::Success { data, .. } => Ok(data),
            InvokeOutcome::Failure { error, .. } => Err(error),
            InvokeOutcome::AwaitingApproval { .. } => Err(CodedError::new(
                ErrorCode::Unknown,
                "invocation re-entered approval",
            )),
        }
    }
}

#[async_trait]
impl TaskRunner for Orchestrator {
    async fn run(&self, item: QueueItem) {
        self.run_task(item).await;
    }
}

fn append_entry(session: &Arc<Session>, kind: EntryKind, content: Value) {
    if let Err(e) = session.append(SessionEntry::new(kind, content)) {
        warn!(session = %session.id, "session append failed: {}", e);
    }
}

fn error_entry(error: &CodedError) -> Value {
    serde_json::json!({ "code": error.code, "message": error.message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalStore;
    use crate::config::ExecApprovals;
    use crate::orchestrator::planner::{EchoPlanner, DefaultReplanner};
    use crate::queue::{DEFAULT_QUEUE_BOUND, DEFAULT_WORKER_POOL};
    use crate::session::DEFAULT_COMPACT_KEEP;
    use crate::tools::{Policy, Tool, ToolContext};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        approvals: Arc<ApprovalManager>,
        bus: EventBus,
        _dir: tempfile::TempDir,
    }

    struct ListTool;

    #[async_trait]
    impl Tool for ListTool {
        fn id(&self) -> &str {
            "fs.list"
        }
        fn description(&self) -> &str {
            "List files"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })
        }
        async fn run(&self, _input: Value, _ctx: &ToolContext) -> Result<Value, CodedError> {
            Ok(serde_json::json!({"entries": ["a.txt"]}))
        }
    }

    struct GatedTool;

    #[async_trait]
    impl Tool for GatedTool {
        fn id(&self) -> &str {
            "system.run"
        }
        fn description(&self) -> &str {
            "Gated"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        fn requires_approval(&self) -> bool {
            true
        }
        async fn run(&self, _input: Value, _ctx: &ToolContext) -> Result<Value, CodedError> {
            Ok(serde_json::json!({"exitCode": 0}))
        }
    }

    struct FlakyTool {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn id(&self) -> &str {
            "net.flaky"
        }
        fn description(&self) -> &str {
            "Fails a few times then succeeds"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn run(&self, _input: Value, _ctx: &ToolContext) -> Result<Value, CodedError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(CodedError::new(ErrorCode::Timeout, "transient"))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn id(&self) -> &str {
            "test.slow"
        }
        fn description(&self) -> &str {
            "Sleeps"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn run(&self, _input: Value, _ctx: &ToolContext) -> Result<Value, CodedError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    struct StepPlanner {
        steps: Vec<Step>,
    }

    #[async_trait]
    impl Planner for StepPlanner {
        async fn plan(
            &self,
            _message: &TaskMessage,
            _history: &[SessionEntry],
        ) -> Result<Vec<Step>, CodedError> {
            Ok(self.steps.clone())
        }
    }

    fn fixture_with(planner: Arc<dyn Planner>, tools: Vec<Arc<dyn Tool>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let store = ApprovalStore::open(dir.path().join("pending-approvals.json")).unwrap();
        let approvals = Arc::new(ApprovalManager::new(store, Duration::from_secs(300)));
        let runtime = Arc::new(ToolRuntime::new(
            Arc::clone(&approvals),
            ExecApprovals::default(),
            dir.path().to_path_buf(),
            Policy::default(),
            10,
        ));
        for tool in tools {
            runtime.register(tool).unwrap();
        }
        let sessions = Arc::new(
            SessionStore::open(dir.path().join("sessions"), DEFAULT_COMPACT_KEEP).unwrap(),
        );
        let queues = ChannelQueues::new(DEFAULT_QUEUE_BOUND, DEFAULT_WORKER_POOL);
        let orchestrator = Orchestrator::new(
            queues,
            runtime,
            Arc::clone(&approvals),
            sessions,
            planner,
            Arc::new(DefaultReplanner::default()),
            bus.clone(),
        );
        Fixture {
            orchestrator,
            approvals,
            bus,
            _dir: dir,
        }
    }

    fn message(channel: &str, text: &str) -> TaskMessage {
        TaskMessage {
            agent_id: "a".into(),
            channel_id: channel.into(),
            channel_session_id: None,
            user_id: "u".into(),
            text: text.into(),
        }
    }

    async fn wait_terminal(fixture: &Fixture, task_id: &str) -> Task {
        for _ in 0..500 {
            if let Some(task) = fixture.orchestrator.get_task(task_id)
                && task.state.is_terminal()
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never reached a terminal state", task_id);
    }

    #[tokio::test]
    async fn echo_task_completes_with_result() {
        let fixture = fixture_with(Arc::new(EchoPlanner), vec![]);
        let mut events = fixture.bus.subscribe();

        let response = fixture
            .orchestrator
            .create_task(message("c1", "echo hi"))
            .unwrap();
        assert_eq!(response.status, "pending");

        let task = wait_terminal(&fixture, &response.task_id).await;
        assert_eq!(task.state, TaskState::Done);
        assert_eq!(task.result.unwrap()["text"], "echo hi");
        assert!(task.error.is_none());

        loop {
            match events.recv().await.unwrap() {
                Event::TaskFinished { task_id, state, .. } => {
                    assert_eq!(task_id, response.task_id);
                    assert_eq!(state, TaskState::Done);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn tool_step_runs_and_result_is_last_output() {
        let planner = StepPlanner {
            steps: vec![Step::tool(
                "s1",
                "list workspace",
                "fs.list",
                serde_json::json!({"path": "."}),
            )],
        };
        let fixture = fixture_with(Arc::new(planner), vec![Arc::new(ListTool)]);
        let response = fixture
            .orchestrator
            .create_task(message("c1", "list"))
            .unwrap();
        let task = wait_terminal(&fixture, &response.task_id).await;
        assert_eq!(task.state, TaskState::Done);
        assert_eq!(task.result.unwrap()["entries"][0], "a.txt");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let planner = StepPlanner {
            steps: vec![Step::tool("s1", "flaky call", "net.flaky", serde_json::json!({}))],
        };
        let fixture = fixture_with(
            Arc::new(planner),
            vec![Arc::new(FlakyTool {
                failures_left: AtomicUsize::new(2),
            })],
        );
        let response = fixture
            .orchestrator
            .create_task(message("c1", "go"))
            .unwrap();
        let task = wait_terminal(&fixture, &response.task_id).await;
        assert_eq!(task.state, TaskState::Done);
        assert_eq!(task.recovery.len(), 2);
        assert!(task.recovery.iter().all(|r| r.action == "retry"));
    }

    #[tokio::test]
    async fn approval_approve_resumes_to_done() {
        let planner = StepPlanner {
            steps: vec![Step::tool("s1", "run command", "system.run", serde_json::json!({}))],
        };
        let fixture = fixture_with(Arc::new(planner), vec![Arc::new(GatedTool)]);
        let response = fixture
            .orchestrator
            .create_task(message("c1", "run"))
            .unwrap();

        // Wait for the task to park.
        for _ in 0..500 {
            if fixture
                .orchestrator
                .get_task(&response.task_id)
                .is_some_and(|t| t.state == TaskState::AwaitingApproval)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let pending = fixture.orchestrator.pending_approvals();
        assert_eq!(pending.len(), 1);

        fixture
            .orchestrator
            .grant_approval(&pending[0].id, true, "alice")
            .unwrap();
        let task = wait_terminal(&fixture, &response.task_id).await;
        assert_eq!(task.state, TaskState::Done);
        assert_eq!(task.result.unwrap()["exitCode"], 0);
    }

    #[tokio::test]
    async fn approval_reject_fails_task_with_denied() {
        let planner = StepPlanner {
            steps: vec![Step::tool("s1", "run command", "system.run", serde_json::json!({}))],
        };
        let fixture = fixture_with(Arc::new(planner), vec![Arc::new(GatedTool)]);
        let response = fixture
            .orchestrator
            .create_task(message("c1", "run"))
            .unwrap();

        for _ in 0..500 {
            if !fixture.orchestrator.pending_approvals().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let pending = fixture.orchestrator.pending_approvals();
        fixture
            .orchestrator
            .grant_approval(&pending[0].id, false, "alice")
            .unwrap();

        let task = wait_terminal(&fixture, &response.task_id).await;
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.unwrap().code, ErrorCode::ApprovalDenied);
    }

    #[tokio::test]
    async fn abort_during_running_reaches_aborted() {
        let planner = StepPlanner {
            steps: vec![Step::tool("s1", "sleep", "test.slow", serde_json::json!({}))],
        };
        let fixture = fixture_with(Arc::new(planner), vec![Arc::new(SlowTool)]);
        let response = fixture
            .orchestrator
            .create_task(message("c1", "slow"))
            .unwrap();

        for _ in 0..500 {
            if fixture
                .orchestrator
                .get_task(&response.task_id)
                .is_some_and(|t| t.state == TaskState::Running)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fixture.orchestrator.abort_task(&response.task_id).unwrap();
        let task = wait_terminal(&fixture, &response.task_id).await;
        assert_eq!(task.state, TaskState::Aborted);
        assert_eq!(task.error.unwrap().code, ErrorCode::AbortedByUser);
    }

    #[tokio::test]
    async fn abort_during_awaiting_approval_rejects_request() {
        let planner = StepPlanner {
            steps: vec![Step::tool("s1", "run", "system.run", serde_json::json!({}))],
        };
        let fixture = fixture_with(Arc::new(planner), vec![Arc::new(GatedTool)]);
        let response = fixture
            .orchestrator
            .create_task(message("c1", "run"))
            .unwrap();

        for _ in 0..500 {
            if !fixture.orchestrator.pending_approvals().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let request_id = fixture.orchestrator.pending_approvals()[0].id.clone();
        fixture.orchestrator.abort_task(&response.task_id).unwrap();

        let task = wait_terminal(&fixture, &response.task_id).await;
        assert_eq!(task.state, TaskState::Aborted);
        assert_eq!(
            fixture.approvals.get(&request_id).unwrap().status,
            ApprovalStatus::Rejected
        );
    }

    #[tokio::test]
    async fn shutdown_aborts_live_tasks() {
        let planner = StepPlanner {
            steps: vec![Step::tool("s1", "sleep", "test.slow", serde_json::json!({}))],
        };
        let fixture = fixture_with(Arc::new(planner), vec![Arc::new(SlowTool)]);
        let response = fixture
            .orchestrator
            .create_task(message("c1", "slow"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        fixture.orchestrator.shutdown().await;
        let task = fixture.orchestrator.get_task(&response.task_id).unwrap();
        assert_eq!(task.state, TaskState::Aborted);
        assert_eq!(task.error.unwrap().code, ErrorCode::AbortedByShutdown);

        let err = fixture
            .orchestrator
            .create_task(message("c1", "late"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AbortedByShutdown);
    }
}
