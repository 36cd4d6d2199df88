//! # Schema Subcommand
//!
//! Prints an example policy document covering every scope level, every
//! condition type and every action type, in the format `validate` and the
//! service's `WARDEN_POLICY_FILE` accept.

use anyhow::Result;
use clap::{Args, ValueEnum};

use warden_core::{PolicyId, SubjectId};
use warden_engine::condition::{ConditionOperator, ConditionType};
use warden_engine::policy::EscalationLevel;
use warden_engine::{Action, ActionConfig, Condition, Policy, PolicyFile, PolicyScope};

/// Output formats.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Yaml,
    Json,
}

/// Arguments for the `warden schema` subcommand.
#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Output format.
    #[arg(long, value_enum, default_value_t = Format::Yaml)]
    pub format: Format,
}

/// The example policies.
pub fn example() -> Result<PolicyFile> {
    let global = Policy::new(
        PolicyId::new("high-risk-global")?,
        "High risk score",
        PolicyScope::Global,
    )
    .with_priority(10)
    .with_condition(Condition::new(
        ConditionType::RiskScore,
        ConditionOperator::GreaterThan,
        "80",
    ))
    .with_action(Action::new(ActionConfig::EmailAlert {
        recipients: vec!["soc@corp.example".into()],
        subject: "High risk score".into(),
        body: None,
    }))
    .with_action(Action::new(ActionConfig::LogDetailedActivity));

    let group = Policy::new(
        PolicyId::new("finance-after-hours")?,
        "Finance after-hours data access",
        PolicyScope::Group {
            department: "Finance".into(),
        },
    )
    .with_priority(50)
    .with_condition(
        Condition::new(ConditionType::DataAccess, ConditionOperator::GreaterThan, "10").or(),
    )
    .with_condition(Condition::new(
        ConditionType::Frequency,
        ConditionOperator::GreaterThan,
        "20",
    ))
    .with_condition(Condition::new(
        ConditionType::TimeBased,
        ConditionOperator::Equals,
        "after_hours",
    ))
    .with_action(Action::new(ActionConfig::IncreaseMonitoring { duration_hours: 72 }))
    .with_action(
        Action::new(ActionConfig::EscalateIncident {
            escalation_level: EscalationLevel::High,
            notify_management: true,
        })
        .with_delay_minutes(30),
    );

    let mut user = Policy::new(
        PolicyId::new("watchlist-emp-1042")?,
        "Watchlisted employee",
        PolicyScope::User {
            subject_id: SubjectId::new("emp-1042")?,
        },
    )
    .with_priority(90)
    .with_condition(Condition::new(
        ConditionType::ViolationSeverity,
        ConditionOperator::In,
        "High,Critical",
    ))
    .with_condition(Condition::new(
        ConditionType::AnyViolation,
        ConditionOperator::Equals,
        "true",
    ))
    .with_action(Action::new(ActionConfig::ImmediateAlert {
        recipients: vec!["ciso@corp.example".into()],
        message: None,
    }))
    .with_action(Action::new(ActionConfig::DisableAccess {
        reason: Some("Watchlisted employee triggered a severe violation".into()),
    }));
    user.description = "Any severe violation by this employee cuts access.".into();

    let manual = Policy::new(
        PolicyId::new("manual-review")?,
        "Manual review",
        PolicyScope::Global,
    )
    .manual_only()
    .with_action(Action::new(ActionConfig::LogDetailedActivity));

    Ok(PolicyFile {
        policies: vec![global, group, user, manual],
    })
}

/// Execute the schema subcommand.
pub fn run_schema(args: &SchemaArgs) -> Result<u8> {
    let file = example()?;
    match args.format {
        Format::Yaml => print!("{}", file.to_yaml()?),
        Format::Json => println!("{}", serde_json::to_string_pretty(&file)?),
    }
    Ok(0)
}
