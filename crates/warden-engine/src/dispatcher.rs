//! # Trigger Dispatcher
//!
//! Drives one event through the engine:
//!
//! ```text
//! Received ─▶ Resolving ─▶ Evaluating ─▶ Scheduling ─▶ Completed
//!                 │
//!                 └─▶ Rejected   (no applicable policy)
//! ```
//!
//! Policies are evaluated and scheduled independently: a scheduling
//! failure for one policy marks that policy's actions failed and leaves the
//! others untouched. Only a policy-store failure aborts dispatch.
//!
//! [`TriggerDispatcher::dispatch`] only enqueues. Execution happens in
//! [`TriggerDispatcher::run_due`], which the host calls on a tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_core::{EventId, PolicyId, SubjectId};

use crate::audit::{AuditEntry, AuditEntryType, AuditLevel, AuditSink};
use crate::condition::ConditionTreeResolver;
use crate::config::EngineConfig;
use crate::error::{DispatchError, ExecutionError, ResolutionError, SchedulingError};
use crate::event::{EvaluationContext, TriggerEvent};
use crate::executor::{ActionExecutor, Collaborators};
use crate::ledger::{Completion, ExecutionKey, ExecutionLedger, ExecutionRecord, ExecutionStatus};
use crate::policy::{Action, ActionType};
use crate::resolver::{PolicyResolver, PolicyStore};
use crate::scheduler::{ActionScheduler, DeferredQueue, ScheduledJob};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Dispatch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    /// The event was accepted.
    Received,
    /// Applicable policies are being looked up.
    Resolving,
    /// Conditions are being evaluated.
    Evaluating,
    /// Actions of matching policies are being scheduled.
    Scheduling,
    /// Every applicable policy was skipped or scheduled.
    Completed,
    /// No policy applies to the event.
    Rejected,
}

impl DispatchState {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Resolving => "resolving",
            Self::Evaluating => "evaluating",
            Self::Scheduling => "scheduling",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }
}

/// What happened to one applicable policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PolicyOutcome {
    /// Conditions did not hold.
    Skipped,
    /// Actions were claimed and enqueued.
    Scheduled {
        /// Records created for this event.
        records: Vec<ExecutionRecord>,
        /// Action ranks already claimed by an earlier dispatch.
        duplicates: Vec<u32>,
        /// The actions enqueued for `records`, as they were when scheduled.
        #[serde(skip)]
        actions: Vec<Action>,
    },
    /// Scheduling failed; claimed records were marked failed.
    SchedulingFailed {
        /// The scheduling error.
        error: String,
    },
}

/// Per-policy line of a dispatch report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReport {
    /// The policy.
    pub policy_id: PolicyId,
    /// Its priority at dispatch time.
    pub priority: i32,
    /// Whether its conditions held.
    pub matched: bool,
    /// What happened.
    #[serde(flatten)]
    pub outcome: PolicyOutcome,
}

/// Summary of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// The dispatched event.
    pub event_id: EventId,
    /// Final state: `completed` or `rejected`.
    pub state: DispatchState,
    /// One entry per applicable policy, in resolution order.
    pub policies: Vec<PolicyReport>,
}

impl DispatchReport {
    /// Every record created by this dispatch.
    pub fn records(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.policies.iter().flat_map(|p| match &p.outcome {
            PolicyOutcome::Scheduled { records, .. } => records.as_slice(),
            _ => &[][..],
        })
    }

    /// Every record created by this dispatch with the action it was
    /// scheduled from. Empty for a report that was deserialized.
    pub fn scheduled_actions(&self) -> impl Iterator<Item = (&ExecutionRecord, &Action)> {
        self.policies.iter().flat_map(|p| match &p.outcome {
            PolicyOutcome::Scheduled {
                records, actions, ..
            } => records.iter().zip(actions.iter()),
            _ => (&[][..]).iter().zip((&[][..]).iter()),
        })
    }

    /// Number of policies whose conditions held.
    pub fn matched(&self) -> usize {
        self.policies.iter().filter(|p| p.matched).count()
    }
}

/// Counts shown next to a policy in the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStats {
    /// Number of conditions.
    pub conditions: usize,
    /// Number of actions.
    pub actions: usize,
    /// Executed actions in the recent window.
    pub recent_executions: usize,
}

// ---------------------------------------------------------------------------
// TriggerDispatcher
// ---------------------------------------------------------------------------

/// Coordinates resolution, evaluation, scheduling, and deferred execution.
#[derive(Clone)]
pub struct TriggerDispatcher {
    config: EngineConfig,
    store: Arc<dyn PolicyStore>,
    resolver: PolicyResolver,
    scheduler: ActionScheduler,
    executor: ActionExecutor,
    ledger: Arc<dyn ExecutionLedger>,
    queue: Arc<dyn DeferredQueue>,
    audit: Arc<dyn AuditSink>,
}

impl TriggerDispatcher {
    /// Wire a dispatcher.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PolicyStore>,
        ledger: Arc<dyn ExecutionLedger>,
        queue: Arc<dyn DeferredQueue>,
        collaborators: Collaborators,
    ) -> Self {
        let audit = Arc::clone(&collaborators.audit);
        Self {
            resolver: PolicyResolver::new(Arc::clone(&store)),
            scheduler: ActionScheduler::new(Arc::clone(&ledger), Arc::clone(&queue)),
            executor: ActionExecutor::new(collaborators),
            config,
            store,
            ledger,
            queue,
            audit,
        }
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dispatch `event` at `now`.
    pub fn dispatch(
        &self,
        event: TriggerEvent,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, DispatchError> {
        let event = Arc::new(event);
        let subject_id = &event.subject.subject_id;
        let mut state = DispatchState::Received;
        self.audit.record(
            AuditEntry::new(AuditEntryType::TriggerReceived, now)
                .with_event(event.event_id, subject_id)
                .with_metadata(serde_json::json!({
                    "kind": event.kind,
                    "department": event.subject.department,
                    "metrics": event.metrics,
                })),
        );

        advance(&mut state, DispatchState::Resolving, event.event_id);
        let policies = self
            .resolver
            .resolve(&event.subject, event.kind)
            .map_err(|e| {
                tracing::error!(event_id = %event.event_id, error = %e, "policy resolution failed");
                e
            })?;
        if policies.is_empty() {
            advance(&mut state, DispatchState::Rejected, event.event_id);
            tracing::info!(event_id = %event.event_id, subject_id = %subject_id, "no applicable policy");
            return Ok(DispatchReport {
                event_id: event.event_id,
                state,
                policies: Vec::new(),
            });
        }

        advance(&mut state, DispatchState::Evaluating, event.event_id);
        let context = EvaluationContext::from_event(&event, &self.config.business_hours);
        let evaluated: Vec<_> = policies
            .into_iter()
            .map(|policy| {
                let matched = ConditionTreeResolver::resolve(&policy.conditions, &context);
                self.audit.record(
                    AuditEntry::new(AuditEntryType::PolicyEvaluated, now)
                        .with_policy(&policy.id)
                        .with_event(event.event_id, subject_id)
                        .with_metadata(serde_json::json!({
                            "matched": matched,
                            "priority": policy.priority,
                            "scope": policy.scope.level(),
                        })),
                );
                (policy, matched)
            })
            .collect();

        advance(&mut state, DispatchState::Scheduling, event.event_id);
        let mut reports = Vec::with_capacity(evaluated.len());
        for (policy, matched) in evaluated {
            let outcome = if !matched {
                PolicyOutcome::Skipped
            } else {
                match self.scheduler.schedule(&policy, &event, now) {
                    Ok(scheduled) => {
                        for record in &scheduled.records {
                            self.audit.record(
                                AuditEntry::new(AuditEntryType::ActionScheduled, now)
                                    .with_policy(&policy.id)
                                    .with_event(event.event_id, subject_id)
                                    .with_metadata(serde_json::json!({
                                        "action_order": record.action_order,
                                        "action_type": record.action_type,
                                        "scheduled_at": record.scheduled_at,
                                    })),
                            );
                        }
                        PolicyOutcome::Scheduled {
                            records: scheduled.records,
                            duplicates: scheduled.duplicates,
                            actions: scheduled.actions,
                        }
                    }
                    Err(err) => {
                        tracing::error!(event_id = %event.event_id, policy_id = %policy.id, error = %err, "scheduling failed");
                        self.audit.record(
                            AuditEntry::new(AuditEntryType::ActionFailed, now)
                                .with_level(AuditLevel::Warning)
                                .with_policy(&policy.id)
                                .with_event(event.event_id, subject_id)
                                .with_metadata(serde_json::json!({
                                    "stage": "scheduling",
                                    "error": err.to_string(),
                                })),
                        );
                        PolicyOutcome::SchedulingFailed {
                            error: err.to_string(),
                        }
                    }
                }
            };
            reports.push(PolicyReport {
                policy_id: policy.id.clone(),
                priority: policy.priority,
                matched,
                outcome,
            });
        }

        advance(&mut state, DispatchState::Completed, event.event_id);
        let report = DispatchReport {
            event_id: event.event_id,
            state,
            policies: reports,
        };
        tracing::info!(
            event_id = %event.event_id,
            applicable = report.policies.len(),
            matched = report.matched(),
            scheduled = report.records().count(),
            "event dispatched"
        );
        Ok(report)
    }

    /// Execute every job due at `now`. Returns the records whose state
    /// changed, including records left pending for a retry.
    pub fn run_due(&self, now: DateTime<Utc>) -> Vec<ExecutionRecord> {
        let jobs = self.queue.pop_due(now);
        let mut changed = Vec::with_capacity(jobs.len());
        for job in jobs {
            if let Some(record) = self.run_job(job, now) {
                changed.push(record);
            }
        }
        changed
    }

    fn run_job(&self, job: ScheduledJob, now: DateTime<Utc>) -> Option<ExecutionRecord> {
        match self.ledger.get(&job.key) {
            Some(record) if record.status == ExecutionStatus::Pending => {}
            _ => {
                tracing::debug!(key = %job.key, "job no longer pending, skipping");
                return None;
            }
        }
        let event = Arc::clone(&job.event);
        let subject_id = &event.subject.subject_id;
        let action_type = job.action.action_type();

        let policy = match self.store.get(&job.key.policy_id) {
            Ok(Some(policy)) if policy.is_active => policy,
            Ok(_) => {
                let reason = ExecutionError::PolicyDeactivated.to_string();
                tracing::info!(key = %job.key, "policy deactivated before execution, cancelling");
                self.audit.record(
                    AuditEntry::new(AuditEntryType::ActionCancelled, now)
                        .with_policy(&job.key.policy_id)
                        .with_event(event.event_id, subject_id)
                        .with_metadata(serde_json::json!({
                            "action_order": job.key.action_order,
                            "action_type": action_type,
                            "reason": reason,
                        })),
                );
                return self.finish(&job, Completion::Abandoned(reason), now);
            }
            Err(err) => {
                return self.retry_or_fail(job, ExecutionError::Collaborator(err.to_string()), now);
            }
        };

        match self.executor.execute(&policy, &job.action, &event, now) {
            Ok(outcome) => {
                tracing::info!(key = %job.key, action_type = %action_type, "action executed");
                let level = if outcome.is_degraded() {
                    AuditLevel::Warning.max(action_type.audit_level())
                } else {
                    action_type.audit_level()
                };
                self.audit.record(
                    AuditEntry::new(AuditEntryType::ActionExecuted, now)
                        .with_level(level)
                        .with_policy(&policy.id)
                        .with_event(event.event_id, subject_id)
                        .with_metadata(serde_json::json!({
                            "action_order": job.key.action_order,
                            "action_type": action_type,
                            "attempt": job.retries + 1,
                            "result": outcome,
                        })),
                );
                self.finish(&job, Completion::Executed, now)
            }
            Err(err) => self.retry_or_fail(job, err, now),
        }
    }

    fn retry_or_fail(
        &self,
        mut job: ScheduledJob,
        err: ExecutionError,
        now: DateTime<Utc>,
    ) -> Option<ExecutionRecord> {
        let event = Arc::clone(&job.event);
        let subject_id = &event.subject.subject_id;
        let action_type = job.action.action_type();

        let retry_at = if err.is_transient() && job.retries < self.config.max_retries {
            let at = now.checked_add_signed(self.config.backoff(job.retries));
            if at.is_none() {
                tracing::error!(key = %job.key, "retry time out of range");
            }
            at
        } else {
            None
        };
        if let Some(retry_at) = retry_at {
            tracing::warn!(key = %job.key, error = %err, retry = job.retries + 1, %retry_at, "transient failure, retrying");
            let record = match self.ledger.note_retry(&job.key, &err.to_string(), retry_at) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %job.key, error = %e, "could not record retry");
                    return None;
                }
            };
            job.retries += 1;
            job.scheduled_at = retry_at;
            let key = job.key.clone();
            match self.queue.enqueue(job) {
                Ok(()) => return Some(record),
                Err(qe) => {
                    tracing::error!(key = %key, error = %qe, "could not re-enqueue retry");
                    let reason = format!("{err}; retry not scheduled: {qe}");
                    return self.fail(&key, event.event_id, subject_id, action_type, reason, now);
                }
            }
        }

        tracing::error!(key = %job.key, error = %err, attempts = job.retries + 1, "action failed");
        self.fail(&job.key, event.event_id, subject_id, action_type, err.to_string(), now)
    }

    fn fail(
        &self,
        key: &ExecutionKey,
        event_id: EventId,
        subject_id: &SubjectId,
        action_type: ActionType,
        reason: String,
        now: DateTime<Utc>,
    ) -> Option<ExecutionRecord> {
        self.audit.record(
            AuditEntry::new(AuditEntryType::ActionFailed, now)
                .with_level(AuditLevel::Warning.max(action_type.audit_level()))
                .with_policy(&key.policy_id)
                .with_event(event_id, subject_id)
                .with_metadata(serde_json::json!({
                    "action_order": key.action_order,
                    "action_type": action_type,
                    "error": reason,
                })),
        );
        match self.ledger.complete(key, Completion::Failed(reason), now) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "could not complete record");
                None
            }
        }
    }

    fn finish(
        &self,
        job: &ScheduledJob,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Option<ExecutionRecord> {
        match self.ledger.complete(&job.key, completion, now) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key = %job.key, error = %e, "could not complete record");
                None
            }
        }
    }

    /// Re-enqueue a pending record loaded from durable storage. The event
    /// snapshot and action come from the caller.
    pub fn resume(&self, job: ScheduledJob) -> Result<(), SchedulingError> {
        self.queue.enqueue(job)
    }

    /// Condition/action counts and recent executions for a policy.
    pub fn policy_stats(
        &self,
        policy_id: &PolicyId,
        since: DateTime<Utc>,
    ) -> Result<Option<PolicyStats>, ResolutionError> {
        Ok(self.store.get(policy_id)?.map(|policy| PolicyStats {
            conditions: policy.conditions.len(),
            actions: policy.actions.len(),
            recent_executions: self.ledger.recent_executions(policy_id, since),
        }))
    }

    /// Stats using the configured recent window ending at `now`.
    pub fn policy_stats_at(
        &self,
        policy_id: &PolicyId,
        now: DateTime<Utc>,
    ) -> Result<Option<PolicyStats>, ResolutionError> {
        self.policy_stats(policy_id, now - self.config.recent_window)
    }

    /// Records for an event.
    pub fn executions_for_event(&self, event_id: EventId) -> Vec<ExecutionRecord> {
        self.ledger.records_for_event(event_id)
    }

    /// When the earliest queued job is due.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.queue.next_due_at()
    }
}

impl std::fmt::Debug for TriggerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerDispatcher")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

fn advance(state: &mut DispatchState, next: DispatchState, event_id: EventId) {
    tracing::debug!(%event_id, from = state.as_str(), to = next.as_str(), "dispatch state");
    *state = next;
}
