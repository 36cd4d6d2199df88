//! # Security Policies
//!
//! A policy targets a scope, carries a priority, a condition list and an
//! ordered action list. Action configuration is a tagged union, so an
//! `email_alert` without recipients or an `increase_monitoring` without a
//! duration cannot be represented once [`Policy::validate`] has passed.
//!
//! ## Wire Shape
//!
//! ```yaml
//! id: finance-exfil
//! name: Finance exfiltration
//! level: group
//! target_id: Finance
//! priority: 80
//! conditions:
//!   - { type: risk_score, operator: greater_than, value: 70 }
//! actions:
//!   - { type: email_alert, recipients: [soc@corp.example], subject: Exfil }
//!   - { type: escalate_incident, escalation_level: high, delay_minutes: 30 }
//! ```
//!
//! `order` on conditions and actions is assigned from list position by
//! [`Policy::normalize`]; authors may omit it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_core::{PolicyId, SubjectId};

use crate::audit::AuditLevel;
use crate::condition::{Condition, ConditionType};

/// Longest supported action delay: 30 days.
pub const MAX_DELAY_MINUTES: u32 = 30 * 24 * 60;

// ---------------------------------------------------------------------------
// PolicyScope
// ---------------------------------------------------------------------------

/// Scope level as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    /// Every subject.
    Global,
    /// Subjects in one department.
    Group,
    /// One subject.
    User,
}

impl ScopeLevel {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Group => "group",
            Self::User => "user",
        }
    }
}

/// Who a policy applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ScopeParts", into = "ScopeParts")]
pub enum PolicyScope {
    /// Applies to every subject.
    Global,
    /// Applies to subjects whose department matches.
    Group {
        /// Department name, matched case-insensitively.
        department: String,
    },
    /// Applies to a single subject.
    User {
        /// The targeted subject.
        subject_id: SubjectId,
    },
}

impl PolicyScope {
    /// Build a scope from its wire parts, enforcing that a target is present
    /// exactly when the level is not global.
    pub fn from_parts(
        level: ScopeLevel,
        target_id: Option<&str>,
    ) -> Result<Self, PolicyValidationError> {
        let target = target_id.map(str::trim).filter(|t| !t.is_empty());
        match (level, target) {
            (ScopeLevel::Global, None) => Ok(Self::Global),
            (ScopeLevel::Global, Some(t)) => Err(PolicyValidationError::Scope(format!(
                "global policy must not carry target_id \"{t}\""
            ))),
            (ScopeLevel::Group, Some(t)) => Ok(Self::Group {
                department: t.to_string(),
            }),
            (ScopeLevel::User, Some(t)) => SubjectId::new(t)
                .map(|subject_id| Self::User { subject_id })
                .map_err(|e| PolicyValidationError::Scope(e.to_string())),
            (level, None) => Err(PolicyValidationError::Scope(format!(
                "{} policy requires a target_id",
                level.as_str()
            ))),
        }
    }

    /// The wire level.
    pub fn level(&self) -> ScopeLevel {
        match self {
            Self::Global => ScopeLevel::Global,
            Self::Group { .. } => ScopeLevel::Group,
            Self::User { .. } => ScopeLevel::User,
        }
    }

    /// The wire target, `None` for global.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::Group { department } => Some(department),
            Self::User { subject_id } => Some(subject_id.as_str()),
        }
    }

    /// Specificity rank for conflict ordering: user > group > global.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::Global => 0,
            Self::Group { .. } => 1,
            Self::User { .. } => 2,
        }
    }
}

/// Flat `level` + `target_id` representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeParts {
    /// Scope level.
    pub level: ScopeLevel,
    /// Department or subject, absent for global.
    #[serde(default)]
    pub target_id: Option<String>,
}

impl TryFrom<ScopeParts> for PolicyScope {
    type Error = PolicyValidationError;

    fn try_from(parts: ScopeParts) -> Result<Self, Self::Error> {
        Self::from_parts(parts.level, parts.target_id.as_deref())
    }
}

impl From<PolicyScope> for ScopeParts {
    fn from(scope: PolicyScope) -> Self {
        Self {
            level: scope.level(),
            target_id: scope.target_id().map(str::to_string),
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Incident escalation level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    /// Low.
    Low,
    /// Medium.
    Medium,
    /// High.
    #[default]
    High,
    /// Critical.
    Critical,
}

impl EscalationLevel {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Action discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Send an alert email.
    EmailAlert,
    /// Raise an incident.
    EscalateIncident,
    /// Extend the subject's monitoring window.
    IncreaseMonitoring,
    /// Disable the subject's access.
    DisableAccess,
    /// Write the full event snapshot to the audit trail.
    LogDetailedActivity,
    /// Send an alert email without delay.
    ImmediateAlert,
}

impl ActionType {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailAlert => "email_alert",
            Self::EscalateIncident => "escalate_incident",
            Self::IncreaseMonitoring => "increase_monitoring",
            Self::DisableAccess => "disable_access",
            Self::LogDetailedActivity => "log_detailed_activity",
            Self::ImmediateAlert => "immediate_alert",
        }
    }

    /// Parse the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "email_alert" => Self::EmailAlert,
            "escalate_incident" => Self::EscalateIncident,
            "increase_monitoring" => Self::IncreaseMonitoring,
            "disable_access" => Self::DisableAccess,
            "log_detailed_activity" => Self::LogDetailedActivity,
            "immediate_alert" => Self::ImmediateAlert,
            _ => return None,
        })
    }

    /// Audit level of this action's execution entries.
    pub fn audit_level(&self) -> AuditLevel {
        match self {
            Self::DisableAccess => AuditLevel::Critical,
            Self::EscalateIncident | Self::ImmediateAlert => AuditLevel::Warning,
            _ => AuditLevel::Info,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed configuration per action type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    /// Send an alert email.
    EmailAlert {
        /// At least one `local@domain` address.
        recipients: Vec<String>,
        /// Non-empty subject line.
        subject: String,
        /// Body; a summary of the event when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    /// Raise an incident.
    EscalateIncident {
        /// Incident level.
        #[serde(default)]
        escalation_level: EscalationLevel,
        /// Also notify the subject's management chain.
        #[serde(default)]
        notify_management: bool,
    },
    /// Extend monitoring of the subject.
    IncreaseMonitoring {
        /// Length of the window from execution time, in hours.
        duration_hours: u32,
    },
    /// Disable the subject's access.
    DisableAccess {
        /// Reason recorded with the access change.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Write the full event snapshot to the audit trail.
    LogDetailedActivity,
    /// Send an alert email immediately, ignoring the delay.
    ImmediateAlert {
        /// At least one `local@domain` address.
        recipients: Vec<String>,
        /// Message body; a summary of the event when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ActionConfig {
    /// The discriminant.
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::EmailAlert { .. } => ActionType::EmailAlert,
            Self::EscalateIncident { .. } => ActionType::EscalateIncident,
            Self::IncreaseMonitoring { .. } => ActionType::IncreaseMonitoring,
            Self::DisableAccess { .. } => ActionType::DisableAccess,
            Self::LogDetailedActivity => ActionType::LogDetailedActivity,
            Self::ImmediateAlert { .. } => ActionType::ImmediateAlert,
        }
    }

    /// Save-time check of the configuration.
    pub fn check(&self) -> Result<(), String> {
        match self {
            Self::EmailAlert {
                recipients,
                subject,
                ..
            } => {
                check_recipients(recipients)?;
                if subject.trim().is_empty() {
                    return Err("subject must not be empty".into());
                }
                Ok(())
            }
            Self::ImmediateAlert { recipients, .. } => check_recipients(recipients),
            Self::IncreaseMonitoring { duration_hours } => {
                if *duration_hours == 0 {
                    return Err("duration_hours must be positive".into());
                }
                Ok(())
            }
            Self::EscalateIncident { .. }
            | Self::DisableAccess { .. }
            | Self::LogDetailedActivity => Ok(()),
        }
    }
}

fn check_recipients(recipients: &[String]) -> Result<(), String> {
    if recipients.is_empty() {
        return Err("at least one recipient is required".into());
    }
    match recipients.iter().find(|r| !is_valid_email(r)) {
        Some(bad) => Err(format!("invalid recipient \"{bad}\"")),
        None => Ok(()),
    }
}

/// Minimal `local@domain` shape check: one `@`, non-empty parts, a dot in
/// the domain, no whitespace.
pub fn is_valid_email(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !address.chars().any(char::is_whitespace)
}

/// One step of a policy's response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// 1-based position, assigned at save time.
    #[serde(default)]
    pub order: u32,
    /// Minutes to wait after the trigger before executing.
    #[serde(default)]
    pub delay_minutes: u32,
    /// What to do.
    #[serde(flatten)]
    pub config: ActionConfig,
}

impl Action {
    /// Create an action with no delay.
    pub fn new(config: ActionConfig) -> Self {
        Self {
            order: 0,
            delay_minutes: 0,
            config,
        }
    }

    /// Builder: set the delay.
    pub fn with_delay_minutes(mut self, minutes: u32) -> Self {
        self.delay_minutes = minutes;
        self
    }

    /// The discriminant.
    pub fn action_type(&self) -> ActionType {
        self.config.action_type()
    }
}

// ---------------------------------------------------------------------------
// PolicyValidationError
// ---------------------------------------------------------------------------

/// Save-time validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyValidationError {
    /// Scope level and target disagree.
    #[error("invalid scope: {0}")]
    Scope(String),

    /// Policy name is blank.
    #[error("policy name must not be empty")]
    EmptyName,

    /// Policy has no actions.
    #[error("policy must declare at least one action")]
    NoActions,

    /// A condition value does not fit its type or operator.
    #[error("condition {order}: {reason}")]
    InvalidCondition {
        /// 1-based condition position.
        order: u32,
        /// What is wrong.
        reason: String,
    },

    /// An action configuration is malformed.
    #[error("action {order}: {reason}")]
    InvalidAction {
        /// 1-based action position.
        order: u32,
        /// What is wrong.
        reason: String,
    },

    /// Order ranks are not `1..=n`.
    #[error("{0} order must be contiguous from 1")]
    NonContiguousOrder(&'static str),
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

fn default_created_by() -> String {
    "system".to_string()
}

fn default_active() -> bool {
    true
}

/// A security policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique identifier.
    pub id: PolicyId,
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Who the policy applies to.
    #[serde(flatten)]
    pub scope: PolicyScope,
    /// Higher wins when several policies apply.
    #[serde(default)]
    pub priority: i32,
    /// Inactive policies never apply.
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Applies only to `manual` events.
    #[serde(default)]
    pub requires_manual_trigger: bool,
    /// Conditions in evaluation order.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Actions in execution order.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Who created the policy.
    #[serde(default = "default_created_by")]
    pub created_by: String,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Create an active policy with no conditions or actions.
    pub fn new(id: PolicyId, name: impl Into<String>, scope: PolicyScope) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            description: String::new(),
            scope,
            priority: 0,
            is_active: true,
            requires_manual_trigger: false,
            conditions: Vec::new(),
            actions: Vec::new(),
            created_by: default_created_by(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: append a condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self.normalize();
        self
    }

    /// Builder: append an action.
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self.normalize();
        self
    }

    /// Builder: mark as manual-trigger only.
    pub fn manual_only(mut self) -> Self {
        self.requires_manual_trigger = true;
        self
    }

    /// Builder: set the active flag.
    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    /// Recompute `order` ranks as `1..=n`.
    ///
    /// When every entry already carries a non-zero rank, entries are first
    /// stably sorted by it; otherwise list position is authoritative.
    pub fn normalize(&mut self) {
        if self.conditions.iter().all(|c| c.order > 0) {
            self.conditions.sort_by_key(|c| c.order);
        }
        for (i, c) in self.conditions.iter_mut().enumerate() {
            c.order = i as u32 + 1;
        }
        if self.actions.iter().all(|a| a.order > 0) {
            self.actions.sort_by_key(|a| a.order);
        }
        for (i, a) in self.actions.iter_mut().enumerate() {
            a.order = i as u32 + 1;
        }
    }

    /// Save-time validation. Call after [`Policy::normalize`].
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.name.trim().is_empty() {
            return Err(PolicyValidationError::EmptyName);
        }
        if self.actions.is_empty() {
            return Err(PolicyValidationError::NoActions);
        }
        if !is_contiguous(self.conditions.iter().map(|c| c.order)) {
            return Err(PolicyValidationError::NonContiguousOrder("condition"));
        }
        if !is_contiguous(self.actions.iter().map(|a| a.order)) {
            return Err(PolicyValidationError::NonContiguousOrder("action"));
        }
        for condition in &self.conditions {
            if condition.condition_type != ConditionType::AnyViolation
                && condition.value.trim().is_empty()
            {
                return Err(PolicyValidationError::InvalidCondition {
                    order: condition.order,
                    reason: "value must not be empty".into(),
                });
            }
            condition
                .check()
                .map_err(|e| PolicyValidationError::InvalidCondition {
                    order: condition.order,
                    reason: e.to_string(),
                })?;
        }
        for action in &self.actions {
            if action.delay_minutes > MAX_DELAY_MINUTES {
                return Err(PolicyValidationError::InvalidAction {
                    order: action.order,
                    reason: format!(
                        "delay_minutes {} exceeds {MAX_DELAY_MINUTES}",
                        action.delay_minutes
                    ),
                });
            }
            action
                .config
                .check()
                .map_err(|reason| PolicyValidationError::InvalidAction {
                    order: action.order,
                    reason,
                })?;
        }
        Ok(())
    }

    /// Find an action by its rank.
    pub fn action(&self, order: u32) -> Option<&Action> {
        self.actions.iter().find(|a| a.order == order)
    }
}

fn is_contiguous(orders: impl Iterator<Item = u32>) -> bool {
    let mut sorted: Vec<u32> = orders.collect();
    sorted.sort_unstable();
    sorted.iter().enumerate().all(|(i, o)| *o == i as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionOperator;

    fn email() -> ActionConfig {
        ActionConfig::EmailAlert {
            recipients: vec!["soc@corp.example".into()],
            subject: "Alert".into(),
            body: None,
        }
    }

    fn pid(s: &str) -> PolicyId {
        PolicyId::new(s).unwrap()
    }

    #[test]
    fn scope_from_parts() {
        assert_eq!(
            PolicyScope::from_parts(ScopeLevel::Global, None).unwrap(),
            PolicyScope::Global
        );
        assert!(PolicyScope::from_parts(ScopeLevel::Global, Some("x")).is_err());
        assert!(PolicyScope::from_parts(ScopeLevel::Group, None).is_err());
        assert!(PolicyScope::from_parts(ScopeLevel::User, Some("  ")).is_err());
        assert_eq!(
            PolicyScope::from_parts(ScopeLevel::Group, Some("Finance"))
                .unwrap()
                .target_id(),
            Some("Finance")
        );
    }

    #[test]
    fn scope_serializes_flat() {
        let p = Policy::new(
            pid("p1"),
            "P1",
            PolicyScope::Group {
                department: "Finance".into(),
            },
        )
        .with_action(Action::new(email()));
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["level"], "group");
        assert_eq!(v["target_id"], "Finance");
        assert_eq!(v["actions"][0]["type"], "email_alert");
        assert_eq!(v["actions"][0]["order"], 1);
        let back: Policy = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn global_with_target_rejected_on_deserialize() {
        let json = r#"{"id":"p1","name":"P","level":"global","target_id":"Finance"}"#;
        assert!(serde_json::from_str::<Policy>(json).is_err());
    }

    #[test]
    fn yaml_policy_document() {
        let yaml = r#"
id: finance-exfil
name: Finance exfiltration
level: group
target_id: Finance
priority: 80
conditions:
  - { type: risk_score, operator: greater_than, value: 70, logical_operator: AND }
  - { type: violation_severity, operator: equals, value: Critical }
actions:
  - { type: email_alert, recipients: [soc@corp.example], subject: Exfil }
  - { type: escalate_incident, escalation_level: critical, notify_management: true, delay_minutes: 30 }
  - { type: log_detailed_activity }
"#;
        let mut p: Policy = serde_yaml::from_str(yaml).unwrap();
        p.normalize();
        p.validate().unwrap();
        assert_eq!(p.conditions[0].value, "70");
        assert_eq!(p.actions[1].delay_minutes, 30);
        assert_eq!(
            p.actions[1].config,
            ActionConfig::EscalateIncident {
                escalation_level: EscalationLevel::Critical,
                notify_management: true,
            }
        );
        assert_eq!(p.actions[2].action_type(), ActionType::LogDetailedActivity);
        assert!(p.is_active);
    }

    #[test]
    fn normalize_renumbers_after_removal() {
        let mut p = Policy::new(pid("p1"), "P", PolicyScope::Global)
            .with_action(Action::new(email()))
            .with_action(Action::new(ActionConfig::LogDetailedActivity))
            .with_action(Action::new(ActionConfig::DisableAccess { reason: None }));
        p.actions.remove(1);
        p.normalize();
        let orders: Vec<u32> = p.actions.iter().map(|a| a.order).collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(p.actions[1].action_type(), ActionType::DisableAccess);
    }

    #[test]
    fn normalize_sorts_by_explicit_ranks() {
        let mut p = Policy::new(pid("p1"), "P", PolicyScope::Global);
        let mut a = Action::new(email());
        a.order = 5;
        let mut b = Action::new(ActionConfig::LogDetailedActivity);
        b.order = 2;
        p.actions = vec![a, b];
        p.normalize();
        assert_eq!(p.actions[0].action_type(), ActionType::LogDetailedActivity);
        assert_eq!(p.actions[1].order, 2);
    }

    #[test]
    fn validate_rejects_malformed_configs() {
        let base = Policy::new(pid("p1"), "P", PolicyScope::Global);

        assert_eq!(base.validate(), Err(PolicyValidationError::NoActions));

        let bad_email = base.clone().with_action(Action::new(ActionConfig::EmailAlert {
            recipients: vec!["not-an-address".into()],
            subject: "x".into(),
            body: None,
        }));
        assert!(matches!(
            bad_email.validate(),
            Err(PolicyValidationError::InvalidAction { order: 1, .. })
        ));

        let no_recipients = base.clone().with_action(Action::new(ActionConfig::ImmediateAlert {
            recipients: vec![],
            message: None,
        }));
        assert!(no_recipients.validate().is_err());

        let zero_hours = base.clone().with_action(Action::new(
            ActionConfig::IncreaseMonitoring { duration_hours: 0 },
        ));
        assert!(zero_hours.validate().is_err());

        let long_delay = base
            .clone()
            .with_action(Action::new(email()).with_delay_minutes(MAX_DELAY_MINUTES + 1));
        assert!(long_delay.validate().is_err());

        let bad_condition = base
            .clone()
            .with_action(Action::new(email()))
            .with_condition(Condition::new(
                ConditionType::RiskScore,
                ConditionOperator::GreaterThan,
                "very",
            ));
        assert!(matches!(
            bad_condition.validate(),
            Err(PolicyValidationError::InvalidCondition { order: 1, .. })
        ));

        let mut blank = base.with_action(Action::new(email()));
        blank.name = "  ".into();
        assert_eq!(blank.validate(), Err(PolicyValidationError::EmptyName));
    }

    #[test]
    fn email_shape() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("@b.co"));
        assert!(!is_valid_email("a b@c.co"));
        assert!(!is_valid_email("a@@b.co"));
    }

    #[test]
    fn disable_access_is_critical() {
        assert_eq!(ActionType::DisableAccess.audit_level(), AuditLevel::Critical);
        assert_eq!(ActionType::parse("immediate_alert"), Some(ActionType::ImmediateAlert));
        assert_eq!(ActionType::parse("reboot"), None);
    }
}
