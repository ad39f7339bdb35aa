//! Per-conversation FIFO queues of pending run requests.
//!
//! Each conversation owns an independent bounded queue with exactly one
//! consumer task. The consumer liveness flag lives inside the same mutex
//! as the entries, so consumer retirement and a racing enqueue always
//! agree on who drains the queue next.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ExecError;
use crate::store::RunRequest;

/// A queued run request with its FIFO sequence number.
#[derive(Debug)]
struct QueueEntry {
    seq: u64,
    request: RunRequest,
    /// Cancelled entries are skipped on dequeue, not removed by
    /// cancellation, keeping sequence numbers stable.
    cancelled: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: VecDeque<QueueEntry>,
    next_seq: u64,
    /// Enqueue slots handed out but not yet committed (run row still
    /// being persisted). Counted against capacity.
    reserved: usize,
    consumer_alive: bool,
}

impl QueueInner {
    fn occupied(&self) -> usize {
        self.reserved + self.entries.iter().filter(|e| !e.cancelled).count()
    }
}

#[derive(Debug, Default)]
struct ConversationQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

/// Outcome of committing an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A consumer is already draining this conversation.
    ConsumerRunning,
    /// The caller must spawn the consumer task; the liveness flag has
    /// already been claimed.
    SpawnConsumer,
}

/// Result of a blocking dequeue.
#[derive(Debug)]
pub enum Dequeued {
    Entry(RunRequest),
    /// The wait elapsed with no ready entry.
    NoWork,
}

/// All per-conversation queues.
#[derive(Debug)]
pub struct ChatQueue {
    queues: DashMap<String, Arc<ConversationQueue>>,
    capacity: usize,
}

impl ChatQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            capacity,
        }
    }

    fn conversation(&self, conversation_id: &str) -> Arc<ConversationQueue> {
        self.queues
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Reserve an enqueue slot, failing with QueueFull at capacity.
    /// The slot must be completed with [`commit`] or [`release`].
    ///
    /// [`commit`]: Self::commit
    /// [`release`]: Self::release
    pub fn reserve(&self, conversation_id: &str) -> Result<(), ExecError> {
        let queue = self.conversation(conversation_id);
        let mut inner = queue.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.occupied() >= self.capacity {
            return Err(ExecError::QueueFull(conversation_id.to_string()));
        }
        inner.reserved += 1;
        Ok(())
    }

    /// Release a reservation without enqueuing (persistence failed).
    pub fn release(&self, conversation_id: &str) {
        let queue = self.conversation(conversation_id);
        let mut inner = queue.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.reserved = inner.reserved.saturating_sub(1);
    }

    /// Turn a reservation into a queue entry at the tail.
    pub fn commit(&self, request: RunRequest) -> EnqueueOutcome {
        let queue = self.conversation(&request.conversation_id);
        let outcome = {
            let mut inner = queue.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.reserved = inner.reserved.saturating_sub(1);
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.entries.push_back(QueueEntry {
                seq,
                request,
                cancelled: false,
            });
            if inner.consumer_alive {
                EnqueueOutcome::ConsumerRunning
            } else {
                inner.consumer_alive = true;
                EnqueueOutcome::SpawnConsumer
            }
        };
        queue.notify.notify_one();
        outcome
    }

    /// Block up to `wait` for the next non-cancelled entry in FIFO order.
    pub async fn dequeue(&self, conversation_id: &str, wait: Duration) -> Dequeued {
        let queue = self.conversation(conversation_id);
        let deadline = Instant::now() + wait;

        loop {
            // Arm the notification before checking, so an enqueue between
            // the check and the await is not missed.
            let notified = queue.notify.notified();

            if let Some(request) = Self::pop_ready(&queue) {
                return Dequeued::Entry(request);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Dequeued::NoWork;
            }

            if tokio::time::timeout(remaining, notified).await.is_err() {
                return match Self::pop_ready(&queue) {
                    Some(request) => Dequeued::Entry(request),
                    None => Dequeued::NoWork,
                };
            }
        }
    }

    fn pop_ready(queue: &ConversationQueue) -> Option<RunRequest> {
        let mut inner = queue.inner.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(entry) = inner.entries.pop_front() {
            if !entry.cancelled {
                return Some(entry.request);
            }
        }
        None
    }

    /// Attempt to retire the conversation's consumer. Succeeds only when
    /// no ready entry remains; otherwise the consumer must keep draining.
    pub fn try_retire(&self, conversation_id: &str) -> bool {
        let queue = self.conversation(conversation_id);
        let mut inner = queue.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.iter().any(|e| !e.cancelled) {
            return false;
        }
        inner.entries.clear();
        inner.consumer_alive = false;
        true
    }

    /// Mark every queued entry cancelled. The in-flight run is cancelled
    /// separately through the runner. Returns the affected run ids.
    pub fn cancel_all(&self, conversation_id: &str) -> Vec<i64> {
        let queue = self.conversation(conversation_id);
        let mut inner = queue.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut cancelled = Vec::new();
        for entry in inner.entries.iter_mut() {
            if !entry.cancelled {
                entry.cancelled = true;
                cancelled.push(entry.request.run_id);
            }
        }
        cancelled
    }

    /// Cancel one queued entry by run id. Returns false when the run is
    /// not waiting in this conversation's queue.
    pub fn cancel_entry(&self, conversation_id: &str, run_id: i64) -> bool {
        let queue = self.conversation(conversation_id);
        let mut inner = queue.inner.lock().unwrap_or_else(|e| e.into_inner());
        for entry in inner.entries.iter_mut() {
            if entry.request.run_id == run_id && !entry.cancelled {
                entry.cancelled = true;
                return true;
            }
        }
        false
    }

    /// Number of non-cancelled entries waiting for a conversation.
    pub fn depth(&self, conversation_id: &str) -> usize {
        let queue = self.conversation(conversation_id);
        let inner = queue.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.iter().filter(|e| !e.cancelled).count()
    }

    /// Highest sequence number assigned so far, for diagnostics.
    pub fn last_seq(&self, conversation_id: &str) -> u64 {
        let queue = self.conversation(conversation_id);
        let inner = queue.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_seq
    }
}
