//! # Simulate Subcommand
//!
//! Loads a policy file into a throwaway in-memory engine, dispatches one
//! event, and reports which policies applied and matched and when each of
//! their actions would run. With `--execute`, the deferred queue is drained
//! up to the horizon against recording collaborators, so the report also
//! shows what every action did.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, ValueEnum};
use serde::Serialize;
use uuid::Uuid;

use warden_core::{EventId, PolicyId, SubjectId};
use warden_engine::memory::RecordingMailTransport;
use warden_engine::scheduler::PlannedAction;
use warden_engine::{
    ActionScheduler, BusinessHours, DispatchReport, EngineConfig, EventKind, EventMetrics,
    ExecutionRecord, InMemoryEngine, MailMessage, MonitoringStore, Policy, PolicyFile, PolicyStore,
    Severity, TriggerEvent,
};

/// Upper bound on queue drain iterations.
const MAX_RUNS: usize = 10_000;

/// Event kinds accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    ViolationCreated,
    RiskUpdated,
    EmailFlagged,
    Manual,
}

impl From<KindArg> for EventKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::ViolationCreated => Self::ViolationCreated,
            KindArg::RiskUpdated => Self::RiskUpdated,
            KindArg::EmailFlagged => Self::EmailFlagged,
            KindArg::Manual => Self::Manual,
        }
    }
}

/// Arguments for the `warden simulate` subcommand.
#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Policy file to load.
    #[arg(long, value_name = "PATH")]
    pub policies: PathBuf,

    /// Subject the event concerns.
    #[arg(long)]
    pub subject: String,

    /// The subject's department.
    #[arg(long, default_value = "")]
    pub department: String,

    /// What produced the event.
    #[arg(long, value_enum, default_value = "risk-updated")]
    pub kind: KindArg,

    /// Subject risk score (0-100).
    #[arg(long)]
    pub risk_score: Option<f64>,

    /// Violation severity: low, medium, high or critical.
    #[arg(long)]
    pub severity: Option<String>,

    /// Events for the subject in the recent window.
    #[arg(long)]
    pub recent_events: Option<u32>,

    /// Data volume accessed, in gigabytes.
    #[arg(long)]
    pub data_volume_gb: Option<f64>,

    /// Dispatch time (RFC 3339). Defaults to now.
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,

    /// Event id. Defaults to a fresh one.
    #[arg(long)]
    pub event_id: Option<Uuid>,

    /// Business hours for `time_based` conditions, e.g. `08-18`.
    #[arg(long)]
    pub business_hours: Option<BusinessHours>,

    /// Run deferred actions up to the horizon.
    #[arg(long)]
    pub execute: bool,

    /// How far past the dispatch time to run actions, in minutes.
    #[arg(long, default_value_t = 43_200)]
    pub horizon_minutes: u32,

    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// The actions one matched policy would run.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyPlan {
    pub policy_id: PolicyId,
    pub actions: Vec<PlannedAction>,
}

/// Side effects observed on the recording collaborators.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SideEffects {
    pub mail: Vec<MailMessage>,
    pub incidents: usize,
    pub management_notifications: usize,
    pub monitoring_until: Option<DateTime<Utc>>,
    pub access_disabled: bool,
}

/// Full result of a simulation.
#[derive(Debug, Clone, Serialize)]
pub struct Simulation {
    pub dispatched_at: DateTime<Utc>,
    pub report: DispatchReport,
    pub plans: Vec<PolicyPlan>,
    pub executions: Vec<ExecutionRecord>,
    pub side_effects: SideEffects,
}

/// Build the event described by `args`.
pub fn build_event(args: &SimulateArgs, at: DateTime<Utc>) -> Result<TriggerEvent> {
    let subject_id = SubjectId::new(args.subject.clone()).context("invalid --subject")?;
    let severity = match args.severity.as_deref() {
        Some(name) => match Severity::from_name(name) {
            Some(severity) => Some(severity),
            None => bail!("unknown severity '{name}'"),
        },
        None => None,
    };
    let metrics = EventMetrics {
        risk_score: args.risk_score,
        severity,
        recent_event_count: args.recent_events,
        data_volume_gb: args.data_volume_gb,
    };
    let mut event = TriggerEvent::new(subject_id, args.department.clone(), args.kind.into(), at)
        .with_metrics(metrics);
    if let Some(id) = args.event_id {
        event = event.with_event_id(EventId::from_uuid(id));
    }
    Ok(event)
}

/// Dispatch `event` at `at` against `policies`.
pub fn simulate(
    policies: Vec<Policy>,
    event: TriggerEvent,
    at: DateTime<Utc>,
    config: EngineConfig,
    horizon: Option<Duration>,
) -> Result<Simulation> {
    let mail = Arc::new(RecordingMailTransport::new());
    let engine = InMemoryEngine::with_mail(config, mail.clone());
    for policy in policies {
        let id = policy.id.clone();
        if !engine.policies.create(policy) {
            bail!("duplicate policy id {id}");
        }
    }

    let subject_id = event.subject.subject_id.clone();
    let event_id = event.event_id;
    let report = engine.dispatcher.dispatch(event, at)?;

    let mut plans = Vec::new();
    for line in report.policies.iter().filter(|p| p.matched) {
        if let Some(policy) = engine.policies.get(&line.policy_id)? {
            plans.push(PolicyPlan {
                policy_id: policy.id.clone(),
                actions: ActionScheduler::plan(&policy, at),
            });
        }
    }

    if let Some(horizon) = horizon {
        let end = at + horizon;
        let mut runs = 0usize;
        while let Some(due) = engine.dispatcher.next_due_at() {
            if due > end || runs >= MAX_RUNS {
                break;
            }
            engine.dispatcher.run_due(due);
            runs += 1;
        }
        tracing::debug!(runs, "drained deferred queue");
    }

    let side_effects = SideEffects {
        mail: mail.sent(),
        incidents: engine.incidents.incidents().len(),
        management_notifications: engine.incidents.notifications().len(),
        monitoring_until: engine.monitoring.expiry(&subject_id),
        access_disabled: engine.access.is_disabled(&subject_id),
    };

    Ok(Simulation {
        dispatched_at: at,
        report,
        plans,
        executions: engine.dispatcher.executions_for_event(event_id),
        side_effects,
    })
}

/// Execute the simulate subcommand.
///
/// Returns exit code 0 when the simulation ran, 1 when the policy file is
/// invalid.
pub fn run_simulate(args: &SimulateArgs) -> Result<u8> {
    let file = PolicyFile::read(&args.policies)
        .with_context(|| format!("failed to load {}", args.policies.display()))?;
    let policies = match file.into_validated() {
        Ok(policies) => policies,
        Err(e) => {
            println!("FAIL: {}: {e}", args.policies.display());
            return Ok(1);
        }
    };

    let at = args.at.unwrap_or_else(Utc::now);
    let event = build_event(args, at)?;
    let mut config = EngineConfig::default();
    if let Some(hours) = args.business_hours {
        config.business_hours = hours;
    }
    let horizon = args
        .execute
        .then(|| Duration::minutes(i64::from(args.horizon_minutes)));

    let simulation = simulate(policies, event, at, config, horizon)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&simulation)?);
    } else {
        print!("{}", render(&simulation, args.execute));
    }
    Ok(0)
}

/// Human-readable report.
pub fn render(sim: &Simulation, executed: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Event {}: {}\n",
        sim.report.event_id,
        sim.report.state.as_str()
    ));
    if sim.report.policies.is_empty() {
        out.push_str("  no applicable policy\n");
    }
    for line in &sim.report.policies {
        let verdict = if line.matched { "MATCH" } else { "SKIP " };
        out.push_str(&format!(
            "  {verdict} {} (priority {})\n",
            line.policy_id, line.priority
        ));
        if let Some(plan) = sim.plans.iter().find(|p| p.policy_id == line.policy_id) {
            for action in &plan.actions {
                let offset = (action.scheduled_at - sim.dispatched_at).num_minutes();
                out.push_str(&format!(
                    "      {}. {} at +{offset}m\n",
                    action.order, action.action_type
                ));
            }
        }
    }

    if executed {
        out.push_str("Executions:\n");
        for record in &sim.executions {
            out.push_str(&format!(
                "  {} {} {} (attempts {})",
                record.key(),
                record.action_type,
                record.status,
                record.attempts
            ));
            if let Some(error) = &record.error {
                out.push_str(&format!(": {error}"));
            }
            out.push('\n');
        }
        let effects = &sim.side_effects;
        out.push_str(&format!(
            "Side effects: {} mail, {} incidents, {} management notifications, access {}",
            effects.mail.len(),
            effects.incidents,
            effects.management_notifications,
            if effects.access_disabled { "disabled" } else { "unchanged" },
        ));
        if let Some(until) = effects.monitoring_until {
            out.push_str(&format!(", monitoring until {}", until.to_rfc3339()));
        }
        out.push('\n');
    }
    out
}
