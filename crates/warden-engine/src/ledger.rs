//! # Execution Ledger
//!
//! The ledger owns one [`ExecutionRecord`] per `(policy_id, event_id,
//! action_order)` key. [`ExecutionLedger::try_claim`] is the engine's only
//! idempotency gate: a key is claimed at most once, so a re-dispatched event
//! or a racing dispatcher never schedules the same action twice.
//!
//! ## Record Lifecycle
//!
//! ```text
//! (absent) ──try_claim──▶ Pending ──complete──▶ Executed | Failed
//!                           │  ▲
//!                           └──┘ note_retry
//! ```
//!
//! Records are never deleted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use warden_core::{EventId, PolicyId};

use crate::error::LedgerError;
use crate::policy::ActionType;

// ---------------------------------------------------------------------------
// ExecutionKey / ExecutionStatus
// ---------------------------------------------------------------------------

/// Identity of one action execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    /// The policy.
    pub policy_id: PolicyId,
    /// The triggering event.
    pub event_id: EventId,
    /// The action's rank within the policy.
    pub action_order: u32,
}

impl ExecutionKey {
    /// Construct a key.
    pub fn new(policy_id: PolicyId, event_id: EventId, action_order: u32) -> Self {
        Self {
            policy_id,
            event_id,
            action_order,
        }
    }
}

impl std::fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.policy_id, self.event_id, self.action_order)
    }
}

/// Status of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Claimed and waiting for its scheduled time, or for a retry.
    Pending,
    /// Ran successfully.
    Executed,
    /// Failed terminally, or was abandoned without running.
    Failed,
}

impl ExecutionStatus {
    /// Whether no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }

    /// Parse the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "executed" => Self::Executed,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// The ledger's record of one action execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// The policy.
    pub policy_id: PolicyId,
    /// The triggering event.
    pub event_id: EventId,
    /// The action's rank within the policy.
    pub action_order: u32,
    /// The action's type.
    pub action_type: ActionType,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the action is (or was) due.
    pub scheduled_at: DateTime<Utc>,
    /// When the record reached a terminal status.
    pub executed_at: Option<DateTime<Utc>>,
    /// Last error, if any.
    pub error: Option<String>,
    /// Number of execution attempts so far.
    pub attempts: u32,
}

impl ExecutionRecord {
    /// The record's key.
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(self.policy_id.clone(), self.event_id, self.action_order)
    }
}

/// How a pending record ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The action ran successfully.
    Executed,
    /// The action ran and failed; counts as an attempt.
    Failed(String),
    /// The action was given up without running.
    Abandoned(String),
}

// ---------------------------------------------------------------------------
// ExecutionLedger
// ---------------------------------------------------------------------------

/// Storage of execution records.
///
/// Implementations must make `try_claim` an atomic compare-and-insert:
/// under any interleaving of callers, exactly one claim per key succeeds.
pub trait ExecutionLedger: Send + Sync {
    /// Insert a pending record for `key` unless any record exists. Returns
    /// `true` when this call created the record.
    fn try_claim(
        &self,
        key: &ExecutionKey,
        action_type: ActionType,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Move a pending record to its terminal status.
    fn complete(
        &self,
        key: &ExecutionKey,
        completion: Completion,
        at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, LedgerError>;

    /// Record a failed attempt that will be retried at `retry_at`.
    fn note_retry(
        &self,
        key: &ExecutionKey,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, LedgerError>;

    /// Look up a record.
    fn get(&self, key: &ExecutionKey) -> Option<ExecutionRecord>;

    /// Records for an event, in key order.
    fn records_for_event(&self, event_id: EventId) -> Vec<ExecutionRecord>;

    /// Records for a policy, in key order.
    fn records_for_policy(&self, policy_id: &PolicyId) -> Vec<ExecutionRecord>;

    /// Number of executed records for a policy with `executed_at >= since`.
    fn recent_executions(&self, policy_id: &PolicyId, since: DateTime<Utc>) -> usize {
        self.records_for_policy(policy_id)
            .iter()
            .filter(|r| {
                r.status == ExecutionStatus::Executed && r.executed_at.is_some_and(|t| t >= since)
            })
            .count()
    }
}

// ---------------------------------------------------------------------------
// InMemoryLedger
// ---------------------------------------------------------------------------

/// Ledger held in a single mutex-guarded ordered map.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: Mutex<BTreeMap<ExecutionKey, ExecutionRecord>>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace records loaded from durable storage.
    pub fn restore(&self, records: impl IntoIterator<Item = ExecutionRecord>) {
        let mut map = self.records.lock();
        for record in records {
            map.insert(record.key(), record);
        }
    }

    /// Pending records, for re-enqueueing after a restart.
    pub fn pending(&self) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| r.status == ExecutionStatus::Pending)
            .cloned()
            .collect()
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the ledger holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl ExecutionLedger for InMemoryLedger {
    fn try_claim(
        &self,
        key: &ExecutionKey,
        action_type: ActionType,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut map = self.records.lock();
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(
            key.clone(),
            ExecutionRecord {
                policy_id: key.policy_id.clone(),
                event_id: key.event_id,
                action_order: key.action_order,
                action_type,
                status: ExecutionStatus::Pending,
                scheduled_at,
                executed_at: None,
                error: None,
                attempts: 0,
            },
        );
        Ok(true)
    }

    fn complete(
        &self,
        key: &ExecutionKey,
        completion: Completion,
        at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, LedgerError> {
        let mut map = self.records.lock();
        let record = map
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
        if record.status.is_terminal() {
            return Err(LedgerError::AlreadyTerminal {
                key: key.clone(),
                status: record.status,
            });
        }
        match completion {
            Completion::Executed => {
                record.status = ExecutionStatus::Executed;
                record.error = None;
                record.attempts += 1;
            }
            Completion::Failed(error) => {
                record.status = ExecutionStatus::Failed;
                record.error = Some(error);
                record.attempts += 1;
            }
            Completion::Abandoned(reason) => {
                record.status = ExecutionStatus::Failed;
                record.error = Some(reason);
            }
        }
        record.executed_at = Some(at);
        Ok(record.clone())
    }

    fn note_retry(
        &self,
        key: &ExecutionKey,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, LedgerError> {
        let mut map = self.records.lock();
        let record = map
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
        if record.status.is_terminal() {
            return Err(LedgerError::AlreadyTerminal {
                key: key.clone(),
                status: record.status,
            });
        }
        record.attempts += 1;
        record.error = Some(error.to_string());
        record.scheduled_at = retry_at;
        Ok(record.clone())
    }

    fn get(&self, key: &ExecutionKey) -> Option<ExecutionRecord> {
        self.records.lock().get(key).cloned()
    }

    fn records_for_event(&self, event_id: EventId) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect()
    }

    fn records_for_policy(&self, policy_id: &PolicyId) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| &r.policy_id == policy_id)
            .cloned()
            .collect()
    }
}
