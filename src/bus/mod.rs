//! Internal event fan-out and cooperative cancellation.
//!
//! Components publish lifecycle events on a broadcast bus instead of holding
//! callbacks into each other; the gateway, logger, and tests subscribe
//! independently. Slow subscribers lag and lose the oldest events rather than
//! blocking publishers.

use crate::approval::ApprovalStatus;
use crate::errors::CodedError;
use crate::orchestrator::task::TaskState;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

const BUS_CAPACITY: usize = 256;

/// Events published by the orchestrator and approval manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A task reached a terminal state (DONE / FAILED / ABORTED).
    TaskFinished {
        task_id: String,
        channel_id: String,
        state: TaskState,
        result: Option<Value>,
        error: Option<CodedError>,
    },
    /// A step started or finished inside a running task.
    TaskProgress {
        task_id: String,
        channel_id: String,
        description: String,
    },
    /// A new approval request is pending.
    ApprovalRequested {
        request_id: String,
        invocation_id: String,
        tool_id: String,
        session_id: String,
        input: Value,
        expires_at: chrono::DateTime<chrono::Utc>,
    },
    /// An approval request left the pending state.
    ApprovalResolved {
        request_id: String,
        status: ApprovalStatus,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation handle. Each task owns a root token; aborting the
/// task fires it and every holder (queue worker, in-flight invoke) observes
/// the cancellation at its next suspension point.
#[derive(Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    pub fn cancel(&self) {
        // send_replace stores the value even with no live receivers.
        let _ = self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve when the token is cancelled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // The sender lives inside this token, so this is unreachable while
        // the future is alive; park forever if it somehow happens.
        std::future::pending::<()>().await
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
