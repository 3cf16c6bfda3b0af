//! Per-channel task queues: strict FIFO within a channel, concurrency across
//! channels bounded by a global worker pool, explicit backpressure.

use crate::bus::CancelToken;
use crate::errors::{CodedError, ErrorCode};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_BOUND: usize = 100;
pub const DEFAULT_WORKER_POOL: usize = 8;

/// A queued task reference: the id plus its cancellation handle. The queue
/// never owns task state; it only sequences ids.
#[derive(Clone)]
pub struct QueueItem {
    pub task_id: String,
    pub cancel: CancelToken,
}

/// Executes one dequeued task to completion. Implemented by the orchestrator.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, item: QueueItem);
}

struct ChannelState {
    queue: VecDeque<QueueItem>,
    worker_active: bool,
}

pub struct ChannelQueues {
    channels: Mutex<HashMap<String, ChannelState>>,
    bound: usize,
    pool: Arc<Semaphore>,
    // Late-bound: the orchestrator owns the queues and installs itself as the
    // runner after construction.
    runner: OnceLock<Arc<dyn TaskRunner>>,
}

impl ChannelQueues {
    pub fn new(bound: usize, workers: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            bound: bound.max(1),
            pool: Arc::new(Semaphore::new(workers.max(1))),
            runner: OnceLock::new(),
        })
    }

    pub fn set_runner(&self, runner: Arc<dyn TaskRunner>) {
        if self.runner.set(runner).is_err() {
            warn!("queue runner was already installed");
        }
    }

    /// Admit an item onto a channel's FIFO. Fails with `QUEUE_FULL` at the
    /// configured depth; the caller decides whether to retry.
    pub fn enqueue(self: &Arc<Self>, channel_id: &str, item: QueueItem) -> Result<(), CodedError> {
        let spawn_worker = {
            let mut channels = self
                .channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let state = channels
                .entry(channel_id.to_string())
                .or_insert_with(|| ChannelState {
                    queue: VecDeque::new(),
                    worker_active: false,
                });
            if state.queue.len() >= self.bound {
                return Err(CodedError::new(
                    ErrorCode::QueueFull,
                    format!("channel '{}' queue is full", channel_id),
                ));
            }
            state.queue.push_back(item);
            if state.worker_active {
                false
            } else {
                state.worker_active = true;
                true
            }
        };

        if spawn_worker {
            let queues = Arc::clone(self);
            let channel = channel_id.to_string();
            tokio::spawn(async move {
                queues.channel_worker(channel).await;
            });
        }
        Ok(())
    }

    /// Exactly one of these runs per channel at a time. It drains the
    /// channel's FIFO, taking a pool permit per task so distinct channels
    /// interleave fairly, and drops the slot when the queue runs dry.
    async fn channel_worker(self: Arc<Self>, channel_id: String) {
        loop {
            let item = {
                let mut channels = self
                    .channels
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let Some(state) = channels.get_mut(&channel_id) else {
                    return;
                };
                match state.queue.pop_front() {
                    Some(item) => item,
                    None => {
                        state.worker_active = false;
                        channels.remove(&channel_id);
                        return;
                    }
                }
            };

            let Ok(permit) = Arc::clone(&self.pool).acquire_owned().await else {
                // Pool closed: shutdown in progress. The item's cancel token
                // is the task's own; the orchestrator aborts it separately.
                debug!(channel = %channel_id, "worker pool closed, dropping queue slot");
                return;
            };
            if let Some(runner) = self.runner.get() {
                runner.run(item).await;
            } else {
                warn!(channel = %channel_id, "no runner installed, dropping task {}", item.task_id);
            }
            drop(permit);
        }
    }

    /// Remove a not-yet-started task from its channel queue. Returns true if
    /// it was still queued. Running tasks are cancelled through their token
    /// by the orchestrator, not here.
    pub fn remove_queued(&self, task_id: &str) -> bool {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for state in channels.values_mut() {
            if let Some(pos) = state.queue.iter().position(|i| i.task_id == task_id) {
                state.queue.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn depth(&self, channel_id: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(channel_id)
            .map_or(0, |s| s.queue.len())
    }

    pub fn depths(&self) -> HashMap<String, usize> {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.queue.len()))
            .collect()
    }
}
