//! Approval flow: pending request registry, fan-out to surfaces, resolve-once
//! semantics, and the periodic expiry sweep.

pub mod store;

pub use store::{ApprovalRequest, ApprovalStatus, ApprovalStore};

use crate::bus::{Event, EventBus};
use crate::errors::CodedError;
#[cfg(test)]
use crate::errors::ErrorCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// How long resolved requests are kept around so late responders get
/// `ALREADY_RESOLVED` instead of `NOT_FOUND`.
const RESOLVED_RETENTION_SECS: i64 = 600;

/// Fire-and-forget notifier for a surface (Discord embed, Slack block, CLI
/// prompt, gateway broadcast). Implementations must not block.
pub trait ApprovalNotifier: Send + Sync {
    fn requested(&self, request: &ApprovalRequest);
    fn resolved(&self, request_id: &str, status: ApprovalStatus);
}

/// Notifier that republishes approval lifecycle onto the event bus, where the
/// gateway broadcast task picks it up.
pub struct BusNotifier {
    bus: EventBus,
}

impl BusNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl ApprovalNotifier for BusNotifier {
    fn requested(&self, request: &ApprovalRequest) {
        self.bus.publish(Event::ApprovalRequested {
            request_id: request.id.clone(),
            invocation_id: request.invocation_id.clone(),
            tool_id: request.tool_id.clone(),
            session_id: request.session_id.clone(),
            input: request.input.clone(),
            expires_at: request.expires_at,
        });
    }

    fn resolved(&self, request_id: &str, status: ApprovalStatus) {
        self.bus.publish(Event::ApprovalResolved {
            request_id: request_id.to_string(),
            status,
        });
    }
}

pub struct ApprovalManager {
    store: Mutex<ApprovalStore>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<ApprovalStatus>>>>,
    handlers: RwLock<Vec<Arc<dyn ApprovalNotifier>>>,
    ttl: chrono::Duration,
}

impl ApprovalManager {
    pub fn new(store: ApprovalStore, ttl: Duration) -> Self {
        Self {
            store: Mutex::new(store),
            waiters: Mutex::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn ApprovalNotifier>) {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handler);
    }

    fn notify_requested(&self, request: &ApprovalRequest) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for handler in handlers.iter() {
            handler.requested(request);
        }
    }

    fn notify_resolved(&self, request_id: &str, status: ApprovalStatus) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for handler in handlers.iter() {
            handler.resolved(request_id, status);
        }
    }

    fn wake_waiters(&self, request_id: &str, status: ApprovalStatus) {
        let senders = self
            .waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(request_id)
            .unwrap_or_default();
        for tx in senders {
            let _ = tx.send(status);
        }
    }

    /// Persist a new pending request and notify every registered surface.
    pub fn request_approval(
        &self,
        invocation_id: &str,
        tool_id: &str,
        session_id: &str,
        input: serde_json::Value,
        requested_by: &str,
    ) -> Result<ApprovalRequest, CodedError> {
        let request = ApprovalRequest::new(
            invocation_id,
            tool_id,
            session_id,
            input,
            requested_by,
            self.ttl,
        );
        self.store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .add(request.clone())
            .map_err(|e| CodedError::internal_error(format!("approval persist: {}", e)))?;
        debug!(request_id = %request.id, tool = %tool_id, "approval requested");
        self.notify_requested(&request);
        Ok(request)
    }

    /// Wait for a request to leave the pending state. Resolves immediately if
    /// it already has.
    pub fn subscribe(&self, request_id: &str) -> oneshot::Receiver<ApprovalStatus> {
        let (tx, rx) = oneshot::channel();
        let current = self
            .store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(request_id)
            .map(|r| r.status);
        match current {
            Some(ApprovalStatus::Pending) | None => {
                self.waiters
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .entry(request_id.to_string())
                    .or_default()
                    .push(tx);
            }
            Some(status) => {
                let _ = tx.send(status);
            }
        }
        rx
    }

    /// Resolve a pending request. The first response wins; later calls fail
    /// with `ALREADY_RESOLVED` and do not mutate the request.
    pub fn handle_response(
        &self,
        request_id: &str,
        approved: bool,
        responded_by: &str,
    ) -> Result<ApprovalStatus, CodedError> {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let resolved = self
            .store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .update_status(request_id, status, Some(responded_by))?;
        debug!(request_id, status = status.as_str(), responded_by, "approval resolved");
        self.notify_resolved(request_id, resolved.status);
        self.wake_waiters(request_id, resolved.status);
        Ok(resolved.status)
    }

    pub fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(request_id)
            .cloned()
    }

    /// Resolve an id that may be either a request id or the bound invocation
    /// id (`tools.approve` accepts both).
    pub fn resolve_request_id(&self, id: &str) -> Option<String> {
        let store = self
            .store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if store.get(id).is_some() {
            return Some(id.to_string());
        }
        store.find_by_invocation(id).map(|r| r.id.clone())
    }

    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        self.store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .list_pending()
    }

    /// One sweep pass: expire overdue pending requests (waking their parked
    /// invocations with `expired`) and prune old resolved entries.
    pub fn sweep(&self) {
        let now = chrono::Utc::now();
        let expired = {
            let mut store = self
                .store
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let expired = store.expire_pending(now).unwrap_or_else(|e| {
                warn!("approval expiry persist failed: {}", e);
                Vec::new()
            });
            if let Err(e) = store.prune_resolved(now, chrono::Duration::seconds(RESOLVED_RETENTION_SECS)) {
                warn!("approval prune failed: {}", e);
            }
            expired
        };
        for id in expired {
            debug!(request_id = %id, "approval expired");
            self.notify_resolved(&id, ApprovalStatus::Expired);
            self.wake_waiters(&id, ApprovalStatus::Expired);
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DEFAULT_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                manager.sweep();
            }
        })
    }

    /// Fail every pending request (process shutdown). Waiters observe the
    /// rejected status; their tasks terminate with `ABORTED_BY_SHUTDOWN`
    /// because their cancel tokens fire in the same breath.
    pub fn reject_all_pending(&self, responded_by: &str) {
        let pending: Vec<String> = self.list_pending().into_iter().map(|r| r.id).collect();
        for id in pending {
            if let Err(e) = self.handle_response(&id, false, responded_by) {
                warn!(request_id = %id, "shutdown reject failed: {}", e);
            }
        }
    }
}
