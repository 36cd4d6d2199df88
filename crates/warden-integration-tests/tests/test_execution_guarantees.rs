//! # Execution Guarantees
//!
//! Exactly-once claims under contention, duplicate dispatch, retry with
//! exponential backoff, scheduling failures, audit-chain integrity, and
//! save-time policy validation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use warden_core::{EventId, PolicyId, SubjectId};
use warden_engine::audit::AuditChainError;
use warden_engine::condition::{ConditionOperator, ConditionType};
use warden_engine::executor::IncidentRequest;
use warden_engine::memory::{
    InMemoryAccessControl, InMemoryIncidentStore, InMemoryMonitoringStore, InMemoryPolicyStore,
    RecordingMailTransport,
};
use warden_engine::policy::{EscalationLevel, MAX_DELAY_MINUTES};
use warden_engine::{
    Action, ActionConfig, ActionType, AuditEntryType, AuditLevel, AuditTrail, CollaboratorError,
    Collaborators, Condition, DeferredQueue, DispatchState, EngineConfig, EventKind,
    EventMetrics, ExecutionKey, ExecutionLedger, ExecutionStatus, IncidentStore, InMemoryEngine,
    InMemoryLedger, Policy, PolicyOutcome, PolicyScope, PolicyValidationError, TimerQueue,
    TriggerDispatcher, TriggerEvent,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
}

fn engine_with(config: EngineConfig) -> (InMemoryEngine, Arc<RecordingMailTransport>) {
    let mail = Arc::new(RecordingMailTransport::new());
    let engine = InMemoryEngine::with_mail(config, mail.clone());
    (engine, mail)
}

fn pid(id: &str) -> PolicyId {
    PolicyId::new(id).unwrap()
}

fn email() -> Action {
    Action::new(ActionConfig::EmailAlert {
        recipients: vec!["soc@corp.example".into()],
        subject: "Alert".into(),
        body: None,
    })
}

fn event() -> TriggerEvent {
    TriggerEvent::new(
        SubjectId::new("emp-42").unwrap(),
        "Finance",
        EventKind::RiskUpdated,
        t0(),
    )
    .with_metrics(EventMetrics {
        risk_score: Some(90.0),
        ..EventMetrics::default()
    })
}

fn mail_policy(id: &str) -> Policy {
    Policy::new(pid(id), "Mail", PolicyScope::Global).with_action(email())
}

// ---------------------------------------------------------------------------
// 1. Claims
// ---------------------------------------------------------------------------

#[test]
fn claim_succeeds_once_then_refuses() {
    let ledger = InMemoryLedger::new();
    let key = ExecutionKey::new(pid("p"), EventId::new(), 1);
    assert!(ledger.try_claim(&key, ActionType::EmailAlert, t0()).unwrap());
    assert!(!ledger.try_claim(&key, ActionType::EmailAlert, t0()).unwrap());
    assert_eq!(ledger.len(), 1);
}

#[test]
fn concurrent_claims_have_exactly_one_winner() {
    let ledger = Arc::new(InMemoryLedger::new());
    let key = ExecutionKey::new(pid("race"), EventId::new(), 1);
    let winners = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..16 {
            scope.spawn(|| {
                if ledger.try_claim(&key, ActionType::EmailAlert, t0()).unwrap() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.get(&key).unwrap().status, ExecutionStatus::Pending);
}

#[test]
fn concurrent_dispatch_of_one_event_sends_one_mail() {
    let (engine, mail) = engine_with(EngineConfig::default());
    engine.policies.create(mail_policy("once"));
    let event = event();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let event = event.clone();
            let dispatcher = &engine.dispatcher;
            scope.spawn(move || dispatcher.dispatch(event, t0()).unwrap());
        }
    });

    engine.dispatcher.run_due(t0());
    assert_eq!(engine.ledger.records_for_event(event.event_id).len(), 1);
    assert_eq!(mail.sent().len(), 1);
}

#[test]
fn redispatch_reports_duplicates_and_creates_nothing() {
    let (engine, mail) = engine_with(EngineConfig::default());
    engine.policies.create(
        mail_policy("twice").with_action(Action::new(ActionConfig::LogDetailedActivity)),
    );
    let event = event();

    let first = engine.dispatcher.dispatch(event.clone(), t0()).unwrap();
    assert_eq!(first.records().count(), 2);
    engine.dispatcher.run_due(t0());

    let second = engine
        .dispatcher
        .dispatch(event.clone(), t0() + Duration::minutes(1))
        .unwrap();
    assert_eq!(second.state, DispatchState::Completed);
    match &second.policies[0].outcome {
        PolicyOutcome::Scheduled {
            records,
            duplicates,
            ..
        } => {
            assert!(records.is_empty());
            assert_eq!(duplicates, &vec![1, 2]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(engine.queue.is_empty());
    engine.dispatcher.run_due(t0() + Duration::hours(1));
    assert_eq!(mail.sent().len(), 1);
    assert_eq!(engine.ledger.len(), 2);
}

// ---------------------------------------------------------------------------
// 2. Retries
// ---------------------------------------------------------------------------

#[test]
fn transient_failures_retry_with_backoff_then_succeed() {
    let (engine, mail) = engine_with(EngineConfig::default());
    engine.policies.create(mail_policy("flaky"));
    mail.fail_next(3);

    let report = engine.dispatcher.dispatch(event(), t0()).unwrap();
    let key = report.records().next().unwrap().key();

    // 30s, 60s, 120s after each failure.
    let expected = [
        t0() + Duration::seconds(30),
        t0() + Duration::seconds(90),
        t0() + Duration::seconds(210),
    ];
    let mut now = t0();
    for (attempt, retry_at) in expected.iter().enumerate() {
        let changed = engine.dispatcher.run_due(now);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, ExecutionStatus::Pending);
        assert_eq!(changed[0].attempts, attempt as u32 + 1);
        assert_eq!(engine.dispatcher.next_due_at(), Some(*retry_at));
        now = *retry_at;
    }

    let changed = engine.dispatcher.run_due(now);
    assert_eq!(changed[0].status, ExecutionStatus::Executed);
    assert_eq!(changed[0].attempts, 4);
    assert_eq!(mail.sent().len(), 1);
    assert_eq!(engine.ledger.get(&key).unwrap().executed_at, Some(now));
}

#[test]
fn retries_are_bounded() {
    let (engine, mail) = engine_with(EngineConfig::default());
    engine.policies.create(mail_policy("down"));
    mail.fail_next(10);

    engine.dispatcher.dispatch(event(), t0()).unwrap();
    let mut last = Vec::new();
    while let Some(due) = engine.dispatcher.next_due_at() {
        last = engine.dispatcher.run_due(due);
    }

    assert_eq!(last.len(), 1);
    assert_eq!(last[0].status, ExecutionStatus::Failed);
    assert_eq!(last[0].attempts, 4);
    assert_eq!(
        last[0].error.as_deref(),
        Some("delivery failed: mail transport unavailable")
    );
    assert!(mail.sent().is_empty());
    assert_eq!(
        engine.audit.entries_by_type(AuditEntryType::ActionFailed).len(),
        1
    );
}

#[test]
fn permanent_failure_is_not_retried() {
    let (engine, mail) = engine_with(EngineConfig::default());
    engine.policies.create(mail_policy("refused"));
    mail.reject_all(true);

    engine.dispatcher.dispatch(event(), t0()).unwrap();
    let changed = engine.dispatcher.run_due(t0());
    assert_eq!(changed[0].status, ExecutionStatus::Failed);
    assert_eq!(changed[0].attempts, 1);
    assert!(engine.dispatcher.next_due_at().is_none());
}

#[test]
fn one_failing_action_does_not_block_the_next() {
    let (engine, mail) = engine_with(EngineConfig::default());
    engine.policies.create(
        mail_policy("mixed")
            .with_action(Action::new(ActionConfig::IncreaseMonitoring { duration_hours: 4 })),
    );
    mail.reject_all(true);

    engine.dispatcher.dispatch(event(), t0()).unwrap();
    let changed = engine.dispatcher.run_due(t0());
    let statuses: Vec<_> = changed.iter().map(|r| (r.action_order, r.status)).collect();
    assert_eq!(
        statuses,
        vec![(1, ExecutionStatus::Failed), (2, ExecutionStatus::Executed)]
    );
}

/// Raises incidents normally; the first `failures` notifications time out.
struct FlakyIncidents {
    inner: InMemoryIncidentStore,
    failures: AtomicUsize,
}

impl IncidentStore for FlakyIncidents {
    fn raise(&self, request: &IncidentRequest) -> Result<String, CollaboratorError> {
        self.inner.raise(request)
    }

    fn notify_management(
        &self,
        incident_id: &str,
        subject_id: &SubjectId,
    ) -> Result<(), CollaboratorError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(CollaboratorError::Unavailable("directory timeout".into()));
        }
        self.inner.notify_management(incident_id, subject_id)
    }
}

#[test]
fn failed_management_notification_never_reopens_the_incident() {
    let config = EngineConfig::default();
    let policies = Arc::new(InMemoryPolicyStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let audit = Arc::new(AuditTrail::new(config.audit_capacity));
    let incidents = Arc::new(FlakyIncidents {
        inner: InMemoryIncidentStore::new(),
        failures: AtomicUsize::new(1),
    });
    let dispatcher = TriggerDispatcher::new(
        config.clone(),
        policies.clone(),
        ledger.clone(),
        Arc::new(TimerQueue::new(config.queue_capacity)),
        Collaborators {
            mail: Arc::new(RecordingMailTransport::new()),
            incidents: incidents.clone(),
            monitoring: Arc::new(InMemoryMonitoringStore::new()),
            access: Arc::new(InMemoryAccessControl::new()),
            audit: audit.clone(),
        },
    );
    policies.create(
        Policy::new(pid("escalate"), "Escalate", PolicyScope::Global).with_action(Action::new(
            ActionConfig::EscalateIncident {
                escalation_level: EscalationLevel::High,
                notify_management: true,
            },
        )),
    );

    dispatcher.dispatch(event(), t0()).unwrap();
    let changed = dispatcher.run_due(t0());
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].status, ExecutionStatus::Executed);
    assert_eq!(changed[0].attempts, 1);

    // Nothing is left to retry, so the incident is raised exactly once.
    assert!(dispatcher.next_due_at().is_none());
    assert!(dispatcher.run_due(t0() + Duration::seconds(30)).is_empty());
    assert_eq!(incidents.inner.incidents().len(), 1);
    assert!(incidents.inner.notifications().is_empty());

    let executed = audit.entries_by_type(AuditEntryType::ActionExecuted);
    assert_eq!(executed.len(), 1);
    assert!(executed[0].level >= AuditLevel::Warning);
    let result = &executed[0].metadata.as_ref().unwrap()["result"];
    assert_eq!(result["management_notified"], false);
    assert_eq!(result["notification_error"], "directory timeout");
}

// ---------------------------------------------------------------------------
// 3. Scheduling failures
// ---------------------------------------------------------------------------

#[test]
fn full_queue_fails_the_policy_but_completes_the_event() {
    let config = EngineConfig {
        queue_capacity: 1,
        ..EngineConfig::default()
    };
    let (engine, mail) = engine_with(config);
    engine.policies.create(
        mail_policy("too-many").with_action(Action::new(ActionConfig::LogDetailedActivity)),
    );

    let report = engine.dispatcher.dispatch(event(), t0()).unwrap();
    assert_eq!(report.state, DispatchState::Completed);
    assert!(matches!(
        report.policies[0].outcome,
        PolicyOutcome::SchedulingFailed { .. }
    ));

    let records = engine.ledger.records_for_event(report.event_id);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == ExecutionStatus::Failed));
    assert!(records
        .iter()
        .all(|r| r.error.as_deref().is_some_and(|e| e.contains("queue full"))));

    // The job that did get enqueued is skipped.
    assert!(engine.dispatcher.run_due(t0()).is_empty());
    assert!(mail.sent().is_empty());
}

#[test]
fn closed_queue_refuses_new_work() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.policies.create(mail_policy("closed"));
    engine.queue.close();

    let report = engine.dispatcher.dispatch(event(), t0()).unwrap();
    assert_eq!(report.state, DispatchState::Completed);
    match &report.policies[0].outcome {
        PolicyOutcome::SchedulingFailed { error } => assert!(error.contains("queue closed")),
        other => panic!("unexpected outcome {other:?}"),
    }
    let failed = engine.audit.entries_by_type(AuditEntryType::ActionFailed);
    assert_eq!(failed.len(), 1);
}

#[test]
fn store_outage_fails_dispatch_without_records() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.policies.create(mail_policy("unreachable"));
    engine.policies.set_unavailable(true);

    assert!(engine.dispatcher.dispatch(event(), t0()).is_err());
    assert_eq!(engine.ledger.len(), 0);
}

// ---------------------------------------------------------------------------
// 4. Audit trail
// ---------------------------------------------------------------------------

#[test]
fn dispatch_audit_sequence() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.policies.create(
        mail_policy("audited").with_action(Action::new(ActionConfig::LogDetailedActivity)),
    );

    let report = engine.dispatcher.dispatch(event(), t0()).unwrap();
    let types: Vec<AuditEntryType> = engine
        .audit
        .entries_for_event(report.event_id)
        .iter()
        .map(|e| e.entry_type)
        .collect();
    assert_eq!(
        types,
        vec![
            AuditEntryType::TriggerReceived,
            AuditEntryType::PolicyEvaluated,
            AuditEntryType::ActionScheduled,
            AuditEntryType::ActionScheduled,
        ]
    );

    engine.dispatcher.run_due(t0());
    let executed = engine.audit.entries_by_type(AuditEntryType::ActionExecuted);
    assert_eq!(executed.len(), 2);
    assert!(engine.audit.verify_chain().is_ok());
}

#[test]
fn tampered_entry_is_detected() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.policies.create(mail_policy("chain"));
    engine.dispatcher.dispatch(event(), t0()).unwrap();
    engine.dispatcher.run_due(t0());

    let mut entries = engine.audit.last_n(engine.audit.len());
    assert_eq!(entries.len(), 4);
    let target = entries[1].sequence;
    entries[1].metadata = Some(serde_json::json!({ "matched": false }));

    let copy = AuditTrail::new(100);
    copy.restore(entries);
    assert_eq!(copy.verify_chain(), Err(AuditChainError::DigestMismatch(target)));
}

#[test]
fn removed_entry_breaks_the_chain() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.policies.create(mail_policy("gap"));
    engine.dispatcher.dispatch(event(), t0()).unwrap();

    let mut entries = engine.audit.last_n(engine.audit.len());
    let removed = entries.remove(1);

    let copy = AuditTrail::new(100);
    copy.restore(entries);
    assert_eq!(
        copy.verify_chain(),
        Err(AuditChainError::BrokenLink(removed.sequence + 1))
    );
}

// ---------------------------------------------------------------------------
// 5. Save-time validation
// ---------------------------------------------------------------------------

fn validated(policy: Policy) -> Result<(), PolicyValidationError> {
    let mut policy = policy;
    policy.normalize();
    policy.validate()
}

#[test]
fn malformed_policies_are_rejected() {
    let base = || Policy::new(pid("v"), "Valid", PolicyScope::Global);

    assert_eq!(validated(base()), Err(PolicyValidationError::NoActions));
    assert_eq!(
        validated(Policy::new(pid("v"), "  ", PolicyScope::Global).with_action(email())),
        Err(PolicyValidationError::EmptyName)
    );

    let bad_recipient = base().with_action(Action::new(ActionConfig::EmailAlert {
        recipients: vec!["soc@corp".into()],
        subject: "x".into(),
        body: None,
    }));
    assert!(matches!(
        validated(bad_recipient),
        Err(PolicyValidationError::InvalidAction { order: 1, .. })
    ));

    let too_late = base().with_action(email().with_delay_minutes(MAX_DELAY_MINUTES + 1));
    assert!(matches!(
        validated(too_late),
        Err(PolicyValidationError::InvalidAction { order: 1, .. })
    ));

    let zero_hours = base()
        .with_action(email())
        .with_action(Action::new(ActionConfig::IncreaseMonitoring { duration_hours: 0 }));
    assert!(matches!(
        validated(zero_hours),
        Err(PolicyValidationError::InvalidAction { order: 2, .. })
    ));

    let non_numeric = base()
        .with_condition(Condition::new(
            ConditionType::RiskScore,
            ConditionOperator::GreaterThan,
            "high",
        ))
        .with_action(email());
    assert!(matches!(
        validated(non_numeric),
        Err(PolicyValidationError::InvalidCondition { order: 1, .. })
    ));

    let unknown_severity = base()
        .with_condition(Condition::new(
            ConditionType::ViolationSeverity,
            ConditionOperator::Equals,
            "Severe",
        ))
        .with_action(email());
    assert!(matches!(
        validated(unknown_severity),
        Err(PolicyValidationError::InvalidCondition { .. })
    ));

    assert!(validated(base().with_action(email())).is_ok());
}

// ---------------------------------------------------------------------------
// 6. Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// No job is released before its due time, and every job is released
    /// once its due time has passed.
    #[test]
    fn jobs_never_run_early(
        delays in proptest::collection::vec(0u32..240, 1..6),
        probe in 0i64..300,
    ) {
        let (engine, _) = engine_with(EngineConfig::default());
        let mut policy = Policy::new(pid("timed"), "Timed", PolicyScope::Global);
        for delay in &delays {
            policy = policy.with_action(
                Action::new(ActionConfig::LogDetailedActivity).with_delay_minutes(*delay),
            );
        }
        engine.policies.create(policy);
        engine.dispatcher.dispatch(event(), t0()).unwrap();

        let now = t0() + Duration::minutes(probe);
        let ran = engine.dispatcher.run_due(now);
        let expected = delays.iter().filter(|d| i64::from(**d) <= probe).count();
        prop_assert_eq!(ran.len(), expected);
        for record in &ran {
            prop_assert!(record.scheduled_at <= now);
            prop_assert_eq!(record.status, ExecutionStatus::Executed);
        }
        prop_assert_eq!(engine.queue.len(), delays.len() - expected);
    }

    /// Dispatching the same event any number of times yields one record
    /// per action.
    #[test]
    fn repeated_dispatch_is_idempotent(actions in 1usize..5, repeats in 1usize..5) {
        let (engine, _) = engine_with(EngineConfig::default());
        let mut policy = Policy::new(pid("idem"), "Idempotent", PolicyScope::Global);
        for _ in 0..actions {
            policy = policy.with_action(Action::new(ActionConfig::LogDetailedActivity));
        }
        engine.policies.create(policy);
        let event = event();
        for _ in 0..repeats {
            engine.dispatcher.dispatch(event.clone(), t0()).unwrap();
        }
        prop_assert_eq!(engine.ledger.records_for_event(event.event_id).len(), actions);
        prop_assert_eq!(engine.queue.len(), actions);
    }
}
