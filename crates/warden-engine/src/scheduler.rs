//! # Action Scheduling
//!
//! Turns a matched policy into claimed, enqueued jobs.
//!
//! ## Timing
//!
//! Each action is due at `now + delay_minutes`, except `immediate_alert`,
//! which is due at `now` whatever its configured delay. Jobs leave the
//! [`TimerQueue`] in `(scheduled_at, enqueue sequence)` order, so actions
//! due at the same instant run in their policy order. A job is never
//! released before its `scheduled_at`.
//!
//! ## Idempotency
//!
//! Every action is claimed in the ledger before it is enqueued. A refused
//! claim means the same `(policy, event, action)` was already scheduled;
//! the action is reported as a duplicate and not enqueued again.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SchedulingError;
use crate::event::TriggerEvent;
use crate::ledger::{Completion, ExecutionKey, ExecutionLedger, ExecutionRecord};
use crate::policy::{Action, ActionType, Policy};

// ---------------------------------------------------------------------------
// ScheduledJob
// ---------------------------------------------------------------------------

/// A claimed action waiting in the deferred queue.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    /// Ledger key of the action.
    pub key: ExecutionKey,
    /// The action as configured when it was scheduled.
    pub action: Action,
    /// The triggering event.
    pub event: Arc<TriggerEvent>,
    /// Earliest time the job may run.
    pub scheduled_at: DateTime<Utc>,
    /// Retries already used.
    pub retries: u32,
}

// ---------------------------------------------------------------------------
// DeferredQueue
// ---------------------------------------------------------------------------

/// Holds jobs until they are due.
pub trait DeferredQueue: Send + Sync {
    /// Add a job.
    fn enqueue(&self, job: ScheduledJob) -> Result<(), SchedulingError>;

    /// Remove and return every job with `scheduled_at <= now`, in
    /// `(scheduled_at, enqueue order)` order.
    fn pop_due(&self, now: DateTime<Utc>) -> Vec<ScheduledJob>;

    /// When the earliest job is due.
    fn next_due_at(&self) -> Option<DateTime<Utc>>;

    /// Number of queued jobs.
    fn len(&self) -> usize;

    /// Whether the queue is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct QueueEntry {
    seq: u64,
    job: ScheduledJob,
}

impl QueueEntry {
    fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.job.scheduled_at, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

struct QueueState {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    next_seq: u64,
    closed: bool,
}

/// Bounded in-memory min-heap of jobs keyed by due time.
pub struct TimerQueue {
    state: Mutex<QueueState>,
    capacity: usize,
}

impl TimerQueue {
    /// Create a queue holding at most `capacity` jobs.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            capacity,
        }
    }

    /// Refuse further jobs. Queued jobs can still be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }
}

impl DeferredQueue for TimerQueue {
    fn enqueue(&self, job: ScheduledJob) -> Result<(), SchedulingError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SchedulingError::QueueUnavailable("queue closed".into()));
        }
        if state.heap.len() >= self.capacity {
            return Err(SchedulingError::QueueUnavailable(format!(
                "queue full ({} jobs)",
                self.capacity
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(QueueEntry { seq, job }));
        Ok(())
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        let mut state = self.state.lock();
        let mut due = Vec::new();
        while state
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.job.scheduled_at <= now)
        {
            if let Some(Reverse(entry)) = state.heap.pop() {
                due.push(entry.job);
            }
        }
        due
    }

    fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .heap
            .peek()
            .map(|Reverse(entry)| entry.job.scheduled_at)
    }

    fn len(&self) -> usize {
        self.state.lock().heap.len()
    }
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActionScheduler
// ---------------------------------------------------------------------------

/// When one action of a policy would run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    /// The action's rank.
    pub order: u32,
    /// The action's type.
    pub action_type: ActionType,
    /// When it is due.
    pub scheduled_at: DateTime<Utc>,
}

/// Result of scheduling one policy for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    /// Records created by this call.
    pub records: Vec<ExecutionRecord>,
    /// Ranks whose claim was refused because a record already existed.
    pub duplicates: Vec<u32>,
    /// The actions enqueued for `records`, in the same order.
    pub actions: Vec<Action>,
}

/// Due time of `action` for a trigger at `now`.
pub fn due_time(action: &Action, now: DateTime<Utc>) -> DateTime<Utc> {
    if action.action_type() == ActionType::ImmediateAlert {
        now
    } else {
        now + Duration::minutes(i64::from(action.delay_minutes))
    }
}

/// Claims and enqueues the actions of matched policies.
#[derive(Clone)]
pub struct ActionScheduler {
    ledger: Arc<dyn ExecutionLedger>,
    queue: Arc<dyn DeferredQueue>,
}

impl ActionScheduler {
    /// Create a scheduler over a ledger and queue.
    pub fn new(ledger: Arc<dyn ExecutionLedger>, queue: Arc<dyn DeferredQueue>) -> Self {
        Self { ledger, queue }
    }

    /// Due times of every action of `policy`, in order. Pure.
    pub fn plan(policy: &Policy, now: DateTime<Utc>) -> Vec<PlannedAction> {
        let mut actions: Vec<&Action> = policy.actions.iter().collect();
        actions.sort_by_key(|a| a.order);
        actions
            .into_iter()
            .map(|a| PlannedAction {
                order: a.order,
                action_type: a.action_type(),
                scheduled_at: due_time(a, now),
            })
            .collect()
    }

    /// Claim and enqueue every action of `policy` for `event`.
    ///
    /// On error, records claimed by this call are completed as failed with
    /// the scheduling error; jobs already enqueued for them are skipped when
    /// popped because their record is no longer pending.
    pub fn schedule(
        &self,
        policy: &Policy,
        event: &Arc<TriggerEvent>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, SchedulingError> {
        let mut actions: Vec<&Action> = policy.actions.iter().collect();
        actions.sort_by_key(|a| a.order);

        let mut outcome = ScheduleOutcome::default();
        let mut claimed: Vec<(ExecutionKey, Action)> = Vec::new();
        for action in actions {
            let key = ExecutionKey::new(policy.id.clone(), event.event_id, action.order);
            let scheduled_at = due_time(action, now);
            let result = self
                .ledger
                .try_claim(&key, action.action_type(), scheduled_at)
                .map_err(SchedulingError::from)
                .and_then(|won| {
                    if won {
                        self.queue.enqueue(ScheduledJob {
                            key: key.clone(),
                            action: action.clone(),
                            event: Arc::clone(event),
                            scheduled_at,
                            retries: 0,
                        })?;
                    }
                    Ok(won)
                });
            match result {
                Ok(true) => {
                    tracing::debug!(key = %key, %scheduled_at, action_type = %action.action_type(), "action scheduled");
                    claimed.push((key, action.clone()));
                }
                Ok(false) => {
                    tracing::info!(key = %key, "duplicate dispatch, action already claimed");
                    outcome.duplicates.push(action.order);
                }
                Err(err) => {
                    if self.ledger.get(&key).is_some() {
                        claimed.push((key, action.clone()));
                    }
                    let keys: Vec<ExecutionKey> = claimed.into_iter().map(|(k, _)| k).collect();
                    self.fail_claimed(&keys, &err, now);
                    return Err(err);
                }
            }
        }

        for (key, action) in claimed {
            if let Some(record) = self.ledger.get(&key) {
                outcome.records.push(record);
                outcome.actions.push(action);
            }
        }
        Ok(outcome)
    }

    fn fail_claimed(&self, claimed: &[ExecutionKey], err: &SchedulingError, now: DateTime<Utc>) {
        for key in claimed {
            if let Err(e) = self
                .ledger
                .complete(key, Completion::Abandoned(err.to_string()), now)
            {
                tracing::warn!(key = %key, error = %e, "could not mark unscheduled action failed");
            }
        }
    }
}

impl std::fmt::Debug for ActionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionScheduler").finish_non_exhaustive()
    }
}
