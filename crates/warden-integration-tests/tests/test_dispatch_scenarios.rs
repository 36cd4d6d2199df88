//! # Dispatch Scenarios
//!
//! End-to-end behaviour of the in-memory engine: policy ordering, due-time
//! calculation, deactivation before a deferred action runs, compound
//! conditions, delayed escalation, and monitoring-window extension.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use warden_core::{PolicyId, SubjectId};
use warden_engine::condition::{ConditionOperator, ConditionType};
use warden_engine::memory::RecordingMailTransport;
use warden_engine::policy::EscalationLevel;
use warden_engine::{
    Action, ActionConfig, ActionType, AuditEntryType, BusinessHours, Condition,
    ConditionTreeResolver, DispatchState, EngineConfig, EvaluationContext, EventKind,
    EventMetrics, ExecutionStatus, InMemoryEngine, MonitoringStore, Policy, PolicyOutcome,
    PolicyResolver, PolicyScope, Severity, Subject, TriggerEvent,
};

/// Monday 2026-03-02 10:00 UTC, inside business hours.
fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
}

fn engine() -> (InMemoryEngine, Arc<RecordingMailTransport>) {
    let mail = Arc::new(RecordingMailTransport::new());
    let engine = InMemoryEngine::with_mail(EngineConfig::default(), mail.clone());
    (engine, mail)
}

fn pid(id: &str) -> PolicyId {
    PolicyId::new(id).unwrap()
}

fn subject() -> SubjectId {
    SubjectId::new("emp-1042").unwrap()
}

fn email(subject: &str) -> Action {
    Action::new(ActionConfig::EmailAlert {
        recipients: vec!["soc@corp.example".into()],
        subject: subject.into(),
        body: None,
    })
}

fn risk_event(score: f64) -> TriggerEvent {
    TriggerEvent::new(subject(), "Finance", EventKind::RiskUpdated, t0()).with_metrics(
        EventMetrics {
            risk_score: Some(score),
            ..EventMetrics::default()
        },
    )
}

fn risk_above(threshold: &str) -> Condition {
    Condition::new(ConditionType::RiskScore, ConditionOperator::GreaterThan, threshold)
}

// ---------------------------------------------------------------------------
// 1. Resolution order
// ---------------------------------------------------------------------------

#[test]
fn higher_priority_global_precedes_lower_priority_user_policy() {
    let (engine, _) = engine();
    let p1 = Policy::new(
        pid("p1-user"),
        "User watch",
        PolicyScope::User {
            subject_id: subject(),
        },
    )
    .with_priority(80)
    .with_action(email("user"));
    let p2 = Policy::new(pid("p2-global"), "Global", PolicyScope::Global)
        .with_priority(90)
        .with_action(email("global"));
    assert!(engine.policies.create(p1));
    assert!(engine.policies.create(p2));

    let resolver = PolicyResolver::new(engine.policies.clone());
    let resolved = resolver
        .resolve(
            &Subject {
                subject_id: subject(),
                department: "Finance".into(),
            },
            EventKind::RiskUpdated,
        )
        .unwrap();
    let ids: Vec<&str> = resolved.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["p2-global", "p1-user"]);
}

#[test]
fn equal_priority_prefers_more_specific_scope() {
    let (engine, _) = engine();
    let policies = [
        Policy::new(pid("a-global"), "Global", PolicyScope::Global),
        Policy::new(
            pid("b-group"),
            "Group",
            PolicyScope::Group {
                department: "finance".into(),
            },
        ),
        Policy::new(
            pid("c-user"),
            "User",
            PolicyScope::User {
                subject_id: subject(),
            },
        ),
    ];
    for policy in policies {
        assert!(engine.policies.create(policy.with_priority(10).with_action(email("x"))));
    }

    let report = engine.dispatcher.dispatch(risk_event(10.0), t0()).unwrap();
    let ids: Vec<&str> = report.policies.iter().map(|p| p.policy_id.as_str()).collect();
    assert_eq!(ids, vec!["c-user", "b-group", "a-global"]);
}

#[test]
fn other_subjects_and_departments_are_not_applicable() {
    let (engine, _) = engine();
    engine.policies.create(
        Policy::new(
            pid("sales-only"),
            "Sales",
            PolicyScope::Group {
                department: "Sales".into(),
            },
        )
        .with_action(email("sales")),
    );
    engine.policies.create(
        Policy::new(
            pid("someone-else"),
            "Other user",
            PolicyScope::User {
                subject_id: SubjectId::new("emp-7").unwrap(),
            },
        )
        .with_action(email("other")),
    );

    let report = engine.dispatcher.dispatch(risk_event(99.0), t0()).unwrap();
    assert_eq!(report.state, DispatchState::Rejected);
    assert!(report.policies.is_empty());
    assert_eq!(engine.ledger.len(), 0);
}

// ---------------------------------------------------------------------------
// 2. Due times
// ---------------------------------------------------------------------------

#[test]
fn immediate_alert_ignores_configured_delay() {
    let (engine, mail) = engine();
    engine.policies.create(
        Policy::new(pid("now"), "Immediate", PolicyScope::Global).with_action(
            Action::new(ActionConfig::ImmediateAlert {
                recipients: vec!["ciso@corp.example".into()],
                message: None,
            })
            .with_delay_minutes(60),
        ),
    );

    let report = engine.dispatcher.dispatch(risk_event(50.0), t0()).unwrap();
    let records: Vec<_> = report.records().collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action_type, ActionType::ImmediateAlert);
    assert_eq!(records[0].scheduled_at, t0());

    let changed = engine.dispatcher.run_due(t0());
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].status, ExecutionStatus::Executed);
    assert!(mail.sent()[0].subject.contains("Immediate"));
}

#[test]
fn email_then_delayed_escalation() {
    let (engine, mail) = engine();
    engine.policies.create(
        Policy::new(pid("high-risk"), "High risk", PolicyScope::Global)
            .with_condition(risk_above("70"))
            .with_action(email("High risk"))
            .with_action(
                Action::new(ActionConfig::EscalateIncident {
                    escalation_level: EscalationLevel::High,
                    notify_management: true,
                })
                .with_delay_minutes(30),
            ),
    );

    let report = engine.dispatcher.dispatch(risk_event(85.0), t0()).unwrap();
    let event_id = report.event_id;
    assert_eq!(report.records().count(), 2);

    let first = engine.dispatcher.run_due(t0());
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].action_order, 1);
    assert_eq!(mail.sent().len(), 1);

    let records = engine.dispatcher.executions_for_event(event_id);
    let escalation = records.iter().find(|r| r.action_order == 2).unwrap();
    assert_eq!(escalation.status, ExecutionStatus::Pending);
    assert_eq!(escalation.scheduled_at, t0() + Duration::minutes(30));
    assert!(engine.incidents.incidents().is_empty());

    // Not released a second early.
    let early = engine.dispatcher.run_due(t0() + Duration::minutes(30) - Duration::seconds(1));
    assert!(early.is_empty());

    let second = engine.dispatcher.run_due(t0() + Duration::minutes(30));
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].status, ExecutionStatus::Executed);
    assert_eq!(engine.incidents.incidents().len(), 1);
    assert_eq!(engine.incidents.incidents()[0].level, EscalationLevel::High);
    assert_eq!(engine.incidents.notifications().len(), 1);
}

// ---------------------------------------------------------------------------
// 3. Deactivation before a deferred action
// ---------------------------------------------------------------------------

#[test]
fn deactivated_policy_abandons_pending_action() {
    let (engine, mail) = engine();
    let id = pid("delayed-mail");
    engine.policies.create(
        Policy::new(id.clone(), "Delayed", PolicyScope::Global)
            .with_action(email("later").with_delay_minutes(30)),
    );

    let report = engine.dispatcher.dispatch(risk_event(10.0), t0()).unwrap();
    engine
        .policies
        .set_active(&id, false, t0() + Duration::minutes(5))
        .unwrap();

    let changed = engine.dispatcher.run_due(t0() + Duration::minutes(30));
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].status, ExecutionStatus::Failed);
    assert_eq!(changed[0].error.as_deref(), Some("policy_deactivated"));
    assert_eq!(changed[0].attempts, 0);
    assert!(mail.sent().is_empty());

    let cancelled = engine.audit.entries_by_type(AuditEntryType::ActionCancelled);
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].event_id, Some(report.event_id));
}

#[test]
fn deleted_policy_abandons_pending_action() {
    let (engine, mail) = engine();
    let id = pid("delete-me");
    engine.policies.create(
        Policy::new(id.clone(), "Deleted", PolicyScope::Global)
            .with_action(email("later").with_delay_minutes(10)),
    );
    engine.dispatcher.dispatch(risk_event(10.0), t0()).unwrap();
    engine.policies.remove(&id);

    let changed = engine.dispatcher.run_due(t0() + Duration::hours(1));
    assert_eq!(changed[0].error.as_deref(), Some("policy_deactivated"));
    assert!(mail.sent().is_empty());
}

// ---------------------------------------------------------------------------
// 4. Compound conditions
// ---------------------------------------------------------------------------

#[test]
fn and_join_of_risk_and_severity() {
    let conditions = {
        let mut policy = Policy::new(pid("compound"), "Compound", PolicyScope::Global)
            .with_condition(risk_above("70"))
            .with_condition(Condition::new(
                ConditionType::ViolationSeverity,
                ConditionOperator::Equals,
                "Critical",
            ));
        policy.normalize();
        policy.conditions
    };
    let event = |score: f64| {
        TriggerEvent::new(subject(), "Finance", EventKind::ViolationCreated, t0()).with_metrics(
            EventMetrics {
                risk_score: Some(score),
                severity: Some(Severity::Critical),
                ..EventMetrics::default()
            },
        )
    };
    let hours = BusinessHours::default();

    let hit = EvaluationContext::from_event(&event(85.0), &hours);
    assert_eq!(hit.severity_rank, Some(4));
    assert!(ConditionTreeResolver::resolve(&conditions, &hit));

    let miss = EvaluationContext::from_event(&event(50.0), &hours);
    assert!(!ConditionTreeResolver::resolve(&conditions, &miss));
}

#[test]
fn or_join_matches_either_side() {
    let (engine, _) = engine();
    engine.policies.create(
        Policy::new(pid("either"), "Either", PolicyScope::Global)
            .with_condition(risk_above("90").or())
            .with_condition(Condition::new(
                ConditionType::DataAccess,
                ConditionOperator::GreaterThan,
                "10",
            ))
            .with_action(Action::new(ActionConfig::LogDetailedActivity)),
    );

    let volume = TriggerEvent::new(subject(), "Finance", EventKind::RiskUpdated, t0())
        .with_metrics(EventMetrics {
            risk_score: Some(20.0),
            data_volume_gb: Some(25.0),
            ..EventMetrics::default()
        });
    let report = engine.dispatcher.dispatch(volume, t0()).unwrap();
    assert!(report.policies[0].matched);

    let neither = TriggerEvent::new(subject(), "Finance", EventKind::RiskUpdated, t0())
        .with_metrics(EventMetrics {
            risk_score: Some(20.0),
            data_volume_gb: Some(1.0),
            ..EventMetrics::default()
        });
    let report = engine.dispatcher.dispatch(neither, t0()).unwrap();
    assert_eq!(report.policies[0].outcome, PolicyOutcome::Skipped);
}

#[test]
fn missing_metric_evaluates_false_without_aborting_dispatch() {
    let (engine, _) = engine();
    engine.policies.create(
        Policy::new(pid("needs-volume"), "Volume", PolicyScope::Global)
            .with_priority(5)
            .with_condition(Condition::new(
                ConditionType::DataAccess,
                ConditionOperator::GreaterThan,
                "10",
            ))
            .with_action(email("volume")),
    );
    engine.policies.create(
        Policy::new(pid("risk"), "Risk", PolicyScope::Global)
            .with_priority(1)
            .with_condition(risk_above("70"))
            .with_action(email("risk")),
    );

    let report = engine.dispatcher.dispatch(risk_event(85.0), t0()).unwrap();
    assert_eq!(report.state, DispatchState::Completed);
    assert!(!report.policies[0].matched);
    assert!(report.policies[1].matched);
    assert_eq!(report.records().count(), 1);
}

#[test]
fn after_hours_condition_uses_business_window() {
    let (engine, _) = engine();
    engine.policies.create(
        Policy::new(pid("after-hours"), "After hours", PolicyScope::Global)
            .with_condition(Condition::new(
                ConditionType::TimeBased,
                ConditionOperator::Equals,
                "after_hours",
            ))
            .with_action(Action::new(ActionConfig::LogDetailedActivity)),
    );

    let at_night = Utc.with_ymd_and_hms(2026, 3, 2, 22, 30, 0).unwrap();
    let night = TriggerEvent::new(subject(), "Finance", EventKind::RiskUpdated, at_night);
    assert!(engine.dispatcher.dispatch(night, at_night).unwrap().policies[0].matched);

    let saturday_noon = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
    let weekend = TriggerEvent::new(subject(), "Finance", EventKind::RiskUpdated, saturday_noon);
    assert!(engine.dispatcher.dispatch(weekend, saturday_noon).unwrap().policies[0].matched);

    let office = TriggerEvent::new(subject(), "Finance", EventKind::RiskUpdated, t0());
    assert!(!engine.dispatcher.dispatch(office, t0()).unwrap().policies[0].matched);
}

#[test]
fn manual_policy_only_applies_to_manual_events() {
    let (engine, _) = engine();
    engine.policies.create(
        Policy::new(pid("manual"), "Manual", PolicyScope::Global)
            .manual_only()
            .with_action(Action::new(ActionConfig::LogDetailedActivity)),
    );

    let automatic = engine.dispatcher.dispatch(risk_event(99.0), t0()).unwrap();
    assert_eq!(automatic.state, DispatchState::Rejected);

    let manual = TriggerEvent::new(subject(), "Finance", EventKind::Manual, t0());
    let report = engine.dispatcher.dispatch(manual, t0()).unwrap();
    assert_eq!(report.state, DispatchState::Completed);
    assert_eq!(report.records().count(), 1);
}

// ---------------------------------------------------------------------------
// 5. Monitoring windows
// ---------------------------------------------------------------------------

#[test]
fn monitoring_extends_but_never_shortens() {
    let (engine, _) = engine();
    engine.policies.create(
        Policy::new(pid("watch-24h"), "Watch 24h", PolicyScope::Global)
            .with_action(Action::new(ActionConfig::IncreaseMonitoring { duration_hours: 24 })),
    );

    engine.dispatcher.dispatch(risk_event(10.0), t0()).unwrap();
    engine.dispatcher.run_due(t0());
    assert_eq!(engine.monitoring.expiry(&subject()), Some(t0() + Duration::hours(24)));

    let later = t0() + Duration::hours(10);
    engine.dispatcher.dispatch(risk_event(10.0), later).unwrap();
    engine.dispatcher.run_due(later);
    assert_eq!(engine.monitoring.expiry(&subject()), Some(t0() + Duration::hours(34)));

    // A shorter window requested afterwards leaves the expiry alone.
    engine.policies.upsert(
        Policy::new(pid("watch-24h"), "Watch 1h", PolicyScope::Global)
            .with_action(Action::new(ActionConfig::IncreaseMonitoring { duration_hours: 1 })),
    );
    let later_still = t0() + Duration::hours(11);
    engine.dispatcher.dispatch(risk_event(10.0), later_still).unwrap();
    engine.dispatcher.run_due(later_still);
    assert_eq!(engine.monitoring.expiry(&subject()), Some(t0() + Duration::hours(34)));
}

#[test]
fn disable_access_and_detailed_logging_take_effect() {
    let (engine, _) = engine();
    engine.policies.create(
        Policy::new(pid("lockout"), "Lockout", PolicyScope::Global)
            .with_action(Action::new(ActionConfig::DisableAccess { reason: None }))
            .with_action(Action::new(ActionConfig::LogDetailedActivity)),
    );

    let report = engine.dispatcher.dispatch(risk_event(10.0), t0()).unwrap();
    let changed = engine.dispatcher.run_due(t0());
    assert_eq!(changed.len(), 2);
    assert!(changed.iter().all(|r| r.status == ExecutionStatus::Executed));
    assert!(engine.access.is_disabled(&subject()));
    assert_eq!(engine.access.disabled()[0].1, "policy lockout matched");

    let detailed = engine.audit.entries_by_type(AuditEntryType::DetailedActivity);
    assert_eq!(detailed.len(), 1);
    assert_eq!(detailed[0].event_id, Some(report.event_id));
}
