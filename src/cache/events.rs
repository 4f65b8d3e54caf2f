//! Mutation settlement events.
//!
//! Every settled mutation publishes one event. Notification sinks (toasts,
//! audit logs, CLI output) drain the queue at their own pace; the queue is
//! bounded and drops its oldest events when full.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::lock::mutex_lock;

const COMPONENT: &str = "cache::events";
const METRIC_QUEUE_LEN: &str = "tidecache_event_queue_len";
const METRIC_DROPPED_TOTAL: &str = "tidecache_event_dropped_total";

/// Monotonic sequence number assigned at publish time.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct MutationEvent {
    /// Id of the mutation invocation that settled.
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: MutationEventKind,
    pub timestamp: OffsetDateTime,
}

impl MutationEvent {
    pub fn new(id: Uuid, kind: MutationEventKind, epoch: Epoch) -> Self {
        Self {
            id,
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn label(&self) -> Option<&str> {
        match &self.kind {
            MutationEventKind::Succeeded { label }
            | MutationEventKind::Failed { label, .. }
            | MutationEventKind::Cancelled { label } => label.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEventKind {
    Succeeded { label: Option<String> },
    /// `error` is the user-facing message of the failure.
    Failed { label: Option<String>, error: String },
    Cancelled { label: Option<String> },
}

impl MutationEventKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Bounded in-memory queue of settlement events.
pub struct EventQueue {
    queue: Mutex<VecDeque<MutationEvent>>,
    epoch_counter: AtomicU64,
    limit: NonZeroUsize,
}

impl EventQueue {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit,
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit.get()
    }

    /// Append an event, dropping the oldest one when the queue is full.
    pub fn publish(&self, id: Uuid, kind: MutationEventKind) -> Epoch {
        let epoch = self.next_epoch();
        let event = MutationEvent::new(id, kind, epoch);

        info!(
            mutation_id = %event.id,
            event_epoch = event.epoch,
            outcome = event.kind.name(),
            label = event.label().unwrap_or("-"),
            "Mutation settled"
        );

        let (len, dropped) = {
            let mut queue = mutex_lock(&self.queue, COMPONENT, "publish");
            let mut dropped = 0_u64;
            while queue.len() >= self.limit.get() {
                queue.pop_front();
                dropped += 1;
            }
            queue.push_back(event);
            (queue.len(), dropped)
        };

        if dropped > 0 {
            counter!(METRIC_DROPPED_TOTAL).increment(dropped);
            warn!(dropped, limit = self.limit.get(), "Event queue full; dropped oldest events");
        }
        gauge!(METRIC_QUEUE_LEN).set(len as f64);
        epoch
    }

    /// Remove up to `limit` events in publish order.
    pub fn drain(&self, limit: usize) -> Vec<MutationEvent> {
        let (events, len) = {
            let mut queue = mutex_lock(&self.queue, COMPONENT, "drain");
            let count = limit.min(queue.len());
            let events: Vec<MutationEvent> = queue.drain(..count).collect();
            (events, queue.len())
        };
        gauge!(METRIC_QUEUE_LEN).set(len as f64);
        events
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, COMPONENT, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, COMPONENT, "clear").clear();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
    }
}
