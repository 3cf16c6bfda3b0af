use crate::approval::{ApprovalManager, ApprovalStatus};
use crate::bus::CancelToken;
use crate::config::ExecApprovals;
use crate::errors::{CodedError, ErrorCode};
use crate::tools::{
    InvocationStatus, InvokeMeta, InvokeOutcome, Policy, Tool, ToolContext, ToolInvocation,
};
use crate::utils::truncate_at_utf8_boundary;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const DEFAULT_CONCURRENCY: usize = 10;
/// Concurrent process-tool invocations allowed per user.
const PROCESS_SESSIONS_PER_USER: usize = 3;

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: Arc<jsonschema::Validator>,
}

/// Decrements the per-user process count on drop, so every exit path
/// releases the slot.
struct ProcessSlot {
    counts: Arc<Mutex<HashMap<String, usize>>>,
    user_id: String,
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(count) = counts.get_mut(&self.user_id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.user_id);
            }
        }
    }
}

/// Registry plus execution pipeline. Registration happens at startup and the
/// registry is read-mostly afterwards; invocations run under a global
/// concurrency cap with a hard per-invocation deadline.
pub struct ToolRuntime {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    invocations: Mutex<HashMap<String, ToolInvocation>>,
    semaphore: Arc<Semaphore>,
    approvals: Arc<ApprovalManager>,
    exec_ledger: ExecApprovals,
    workspace: PathBuf,
    policy: Policy,
    process_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl ToolRuntime {
    pub fn new(
        approvals: Arc<ApprovalManager>,
        exec_ledger: ExecApprovals,
        workspace: PathBuf,
        policy: Policy,
        concurrency: usize,
    ) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            invocations: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            approvals,
            exec_ledger,
            workspace,
            policy,
            process_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim a per-user process slot. Only `system.*` tools are counted;
    /// saturation fails with `RESOURCE_EXHAUSTED`.
    fn claim_process_slot(&self, tool_id: &str, user_id: &str) -> Result<Option<ProcessSlot>, CodedError> {
        if !tool_id.starts_with("system.") {
            return Ok(None);
        }
        let mut counts = self
            .process_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = counts.entry(user_id.to_string()).or_insert(0);
        if *count >= PROCESS_SESSIONS_PER_USER {
            return Err(CodedError::new(
                ErrorCode::ResourceExhausted,
                format!(
                    "at most {} concurrent process invocations per user",
                    PROCESS_SESSIONS_PER_USER
                ),
            ));
        }
        *count += 1;
        Ok(Some(ProcessSlot {
            counts: Arc::clone(&self.process_counts),
            user_id: user_id.to_string(),
        }))
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), CodedError> {
        let id = tool.id().to_string();
        if id.is_empty() || id.len() > 256 || id.chars().any(char::is_control) {
            return Err(CodedError::new(ErrorCode::InvalidInput, "invalid tool id"));
        }
        let validator = jsonschema::validator_for(&tool.parameters()).map_err(|e| {
            CodedError::internal_error(format!("invalid schema for tool '{}': {}", id, e))
        })?;
        let mut tools = self
            .tools
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if tools.contains_key(&id) {
            return Err(CodedError::new(
                ErrorCode::InvalidInput,
                format!("duplicate tool id '{}'", id),
            ));
        }
        tools.insert(
            id,
            RegisteredTool {
                tool,
                validator: Arc::new(validator),
            },
        );
        Ok(())
    }

    /// Tool definitions for surface discovery, sorted by id.
    pub fn definitions(&self) -> Vec<Value> {
        let tools = self
            .tools
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut defs: Vec<Value> = tools
            .values()
            .map(|reg| {
                serde_json::json!({
                    "id": reg.tool.id(),
                    "description": reg.tool.description(),
                    "parameters": reg.tool.parameters(),
                    "requiresApproval": reg.tool.requires_approval(),
                })
            })
            .collect();
        defs.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        defs
    }

    pub fn list_ids(&self) -> Vec<String> {
        let tools = self
            .tools
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut ids: Vec<String> = tools.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn invocation(&self, id: &str) -> Option<ToolInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn lookup(&self, tool_id: &str) -> Option<(Arc<dyn Tool>, Arc<jsonschema::Validator>)> {
        let tools = self
            .tools
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tools
            .get(tool_id)
            .map(|reg| (Arc::clone(&reg.tool), Arc::clone(&reg.validator)))
    }

    fn context(&self, session_id: &str, agent_id: &str, user_id: &str) -> ToolContext {
        ToolContext {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            workspace: self.workspace.clone(),
            policy: self.policy.clone(),
        }
    }

    fn record_invocation(&self, invocation: ToolInvocation) {
        self.invocations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(invocation.id.clone(), invocation);
    }

    fn set_invocation_result(
        &self,
        id: &str,
        status: InvocationStatus,
        output: Option<Value>,
        error: Option<CodedError>,
    ) {
        let mut invocations = self
            .invocations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(inv) = invocations.get_mut(id) {
            inv.status = status;
            inv.output = output;
            inv.error = error;
        }
    }

    pub async fn invoke(
        &self,
        tool_id: &str,
        session_id: &str,
        input: Value,
        agent_id: &str,
        user_id: &str,
        cancel: &CancelToken,
    ) -> InvokeOutcome {
        self.invoke_inner(tool_id, session_id, input, agent_id, user_id, cancel, false)
            .await
    }

    /// Invoke with the approval gate forced on, regardless of the tool's own
    /// flag. Used by recovery when a blocked step should be retried under
    /// human sign-off.
    pub async fn invoke_requiring_approval(
        &self,
        tool_id: &str,
        session_id: &str,
        input: Value,
        agent_id: &str,
        user_id: &str,
        cancel: &CancelToken,
    ) -> InvokeOutcome {
        self.invoke_inner(tool_id, session_id, input, agent_id, user_id, cancel, true)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke_inner(
        &self,
        tool_id: &str,
        session_id: &str,
        input: Value,
        agent_id: &str,
        user_id: &str,
        cancel: &CancelToken,
        force_approval: bool,
    ) -> InvokeOutcome {
        let started = Instant::now();
        let fail = |error: CodedError| InvokeOutcome::Failure {
            error,
            meta: InvokeMeta {
                duration_ms: started.elapsed().as_millis() as u64,
                truncated: false,
            },
        };

        let Some((tool, validator)) = self.lookup(tool_id) else {
            return fail(CodedError::new(
                ErrorCode::ToolNotFound,
                format!("unknown tool '{}'", tool_id),
            ));
        };

        if let Err(err) = validator.validate(&input) {
            return fail(CodedError::new(
                ErrorCode::ValidationError,
                format!("invalid input at '{}': {}", err.instance_path(), err),
            ));
        }

        let invocation_id = format!("invocation-{}", Uuid::new_v4());
        let needs_approval = force_approval
            || (tool.requires_approval()
                && !self.exec_ledger.is_pre_approved(tool_id, &input));

        if needs_approval {
            self.record_invocation(ToolInvocation {
                id: invocation_id.clone(),
                tool_id: tool_id.to_string(),
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                user_id: user_id.to_string(),
                status: InvocationStatus::AwaitingApproval,
                started_at: chrono::Utc::now(),
                input: input.clone(),
                output: None,
                error: None,
            });
            match self.approvals.request_approval(
                &invocation_id,
                tool_id,
                session_id,
                input,
                user_id,
            ) {
                Ok(request) => {
                    debug!(tool = tool_id, %invocation_id, request_id = %request.id, "invocation awaiting approval");
                    return InvokeOutcome::AwaitingApproval {
                        invocation_id,
                        request_id: request.id,
                    };
                }
                Err(error) => {
                    self.set_invocation_result(
                        &invocation_id,
                        InvocationStatus::Failed,
                        None,
                        Some(error.clone()),
                    );
                    return fail(error);
                }
            }
        }

        self.record_invocation(ToolInvocation {
            id: invocation_id.clone(),
            tool_id: tool_id.to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            status: InvocationStatus::Running,
            started_at: chrono::Utc::now(),
            input: input.clone(),
            output: None,
            error: None,
        });
        let ctx = self.context(session_id, agent_id, user_id);
        self.execute(tool, &invocation_id, input, ctx, cancel, started)
            .await
    }

    /// Re-enter execution after the bound approval request resolved. Approved
    /// requests run with the original input and invocation id; anything else
    /// synthesizes the matching failure without running.
    pub async fn resume(
        &self,
        invocation_id: &str,
        status: ApprovalStatus,
        cancel: &CancelToken,
    ) -> InvokeOutcome {
        let started = Instant::now();
        let fail = |error: CodedError| InvokeOutcome::Failure {
            error,
            meta: InvokeMeta {
                duration_ms: started.elapsed().as_millis() as u64,
                truncated: false,
            },
        };

        // Claim the invocation under the lock so a second resume finds it
        // already taken and no side effect can run twice.
        let claimed = {
            let mut invocations = self
                .invocations
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match invocations.get_mut(invocation_id) {
                None => {
                    return fail(CodedError::new(
                        ErrorCode::NotFound,
                        "invocation not found",
                    ))
                }
                Some(inv) if inv.status != InvocationStatus::AwaitingApproval => {
                    return fail(CodedError::new(
                        ErrorCode::AlreadyResolved,
                        "invocation is not awaiting approval",
                    ))
                }
                Some(inv) => {
                    inv.status = InvocationStatus::Running;
                    inv.clone()
                }
            }
        };

        let denial = match status {
            ApprovalStatus::Approved => None,
            ApprovalStatus::Rejected => Some(CodedError::new(
                ErrorCode::ApprovalDenied,
                "approval was denied",
            )),
            ApprovalStatus::Expired => Some(CodedError::new(
                ErrorCode::ApprovalExpired,
                "approval request expired",
            )),
            ApprovalStatus::Pending => Some(CodedError::new(
                ErrorCode::InvalidInput,
                "approval request is still pending",
            )),
        };
        if let Some(error) = denial {
            self.set_invocation_result(
                invocation_id,
                InvocationStatus::Failed,
                None,
                Some(error.clone()),
            );
            return fail(error);
        }

        let Some((tool, _)) = self.lookup(&claimed.tool_id) else {
            let error = CodedError::new(ErrorCode::ToolNotFound, "tool no longer registered");
            self.set_invocation_result(
                invocation_id,
                InvocationStatus::Failed,
                None,
                Some(error.clone()),
            );
            return fail(error);
        };
        let ctx = self.context(&claimed.session_id, &claimed.agent_id, &claimed.user_id);
        self.execute(tool, invocation_id, claimed.input, ctx, cancel, started)
            .await
    }

    async fn execute(
        &self,
        tool: Arc<dyn Tool>,
        invocation_id: &str,
        input: Value,
        ctx: ToolContext,
        cancel: &CancelToken,
        started: Instant,
    ) -> InvokeOutcome {
        let meta = |truncated: bool| InvokeMeta {
            duration_ms: started.elapsed().as_millis() as u64,
            truncated,
        };

        // Admission before the deadline: waiting for a slot does not burn the
        // tool's own time budget.
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    let error =
                        CodedError::new(ErrorCode::ConcurrencyLimit, "runtime is shutting down");
                    self.set_invocation_result(
                        invocation_id,
                        InvocationStatus::Failed,
                        None,
                        Some(error.clone()),
                    );
                    return InvokeOutcome::Failure { error, meta: meta(false) };
                }
            },
            () = cancel.cancelled() => {
                let error = CodedError::new(ErrorCode::AbortedByUser, "invocation cancelled");
                self.set_invocation_result(
                    invocation_id,
                    InvocationStatus::Failed,
                    None,
                    Some(error.clone()),
                );
                return InvokeOutcome::Failure { error, meta: meta(false) };
            }
        };

        let _process_slot = match self.claim_process_slot(tool.id(), &ctx.user_id) {
            Ok(slot) => slot,
            Err(error) => {
                self.set_invocation_result(
                    invocation_id,
                    InvocationStatus::Failed,
                    None,
                    Some(error.clone()),
                );
                return InvokeOutcome::Failure { error, meta: meta(false) };
            }
        };

        let timeout = ctx.policy.timeout;
        let tool_id = tool.id().to_string();
        let run_ctx = ctx.clone();
        // Spawned so a panicking tool takes down its own task, not the loop.
        let handle = tokio::task::spawn(async move {
            tokio::time::timeout(timeout, tool.run(input, &run_ctx)).await
        });

        let result = tokio::select! {
            joined = handle => match joined {
                Ok(Ok(run_result)) => run_result,
                Ok(Err(_)) => Err(CodedError::new(
                    ErrorCode::Timeout,
                    format!("tool timed out after {}s", timeout.as_secs()),
                )),
                Err(join_err) => {
                    if join_err.is_panic() {
                        error!(tool = %tool_id, "tool panicked");
                        Err(CodedError::new(ErrorCode::Unknown, "tool crashed")
                            .with_internal(format!("panic in tool '{}'", tool_id)))
                    } else {
                        Err(CodedError::new(ErrorCode::AbortedByUser, "invocation cancelled"))
                    }
                }
            },
            () = cancel.cancelled() => {
                Err(CodedError::new(ErrorCode::AbortedByUser, "invocation cancelled"))
            }
        };
        drop(permit);

        match result {
            Ok(data) => {
                let (data, truncated) = truncate_output(data, ctx.policy.max_bytes);
                if truncated {
                    warn!(tool = %tool_id, "tool output truncated at {} bytes", ctx.policy.max_bytes);
                }
                self.set_invocation_result(
                    invocation_id,
                    InvocationStatus::Completed,
                    Some(data.clone()),
                    None,
                );
                InvokeOutcome::Success {
                    data,
                    meta: meta(truncated),
                }
            }
            Err(error) => {
                self.set_invocation_result(
                    invocation_id,
                    InvocationStatus::Failed,
                    None,
                    Some(error.clone()),
                );
                InvokeOutcome::Failure {
                    error,
                    meta: meta(false),
                }
            }
        }
    }
}

/// Cap a tool result at `max_bytes` of serialized size. String results are
/// cut at a UTF-8 boundary; anything else falls back to its truncated JSON
/// serialization.
fn truncate_output(data: Value, max_bytes: usize) -> (Value, bool) {
    let serialized_len = serde_json::to_string(&data).map(|s| s.len()).unwrap_or(0);
    if serialized_len <= max_bytes {
        return (data, false);
    }
    match data {
        Value::String(s) => {
            let cut = truncate_at_utf8_boundary(s.as_bytes(), max_bytes);
            (
                Value::String(String::from_utf8_lossy(cut).into_owned()),
                true,
            )
        }
        other => {
            let serialized = serde_json::to_string(&other).unwrap_or_default();
            let cut = truncate_at_utf8_boundary(serialized.as_bytes(), max_bytes);
            (
                Value::String(String::from_utf8_lossy(cut).into_owned()),
                true,
            )
        }
    }
}
