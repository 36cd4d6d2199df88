//! # Action Execution
//!
//! Performs an action's side effect through collaborator traits. The
//! executor is stateless; idempotency is the ledger's job and retries are
//! the dispatcher's.
//!
//! Collaborators are synchronous `Send + Sync` traits shared as
//! `Arc<dyn ...>`. A collaborator returns [`CollaboratorError::Unavailable`]
//! for failures worth retrying and [`CollaboratorError::Rejected`] for
//! failures that will not go away.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use warden_core::SubjectId;

use crate::audit::{AuditEntry, AuditEntryType, AuditLevel, AuditSink};
use crate::error::{CollaboratorError, ExecutionError};
use crate::event::TriggerEvent;
use crate::policy::{is_valid_email, Action, ActionConfig, EscalationLevel, Policy};

/// Subject prefix of `immediate_alert` messages.
pub const IMMEDIATE_PREFIX: &str = "[IMMEDIATE]";

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// An outgoing alert email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    /// Recipient addresses.
    pub recipients: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Sends alert email.
pub trait MailTransport: Send + Sync {
    /// Deliver `message` to every recipient.
    fn send(&self, message: &MailMessage) -> Result<(), CollaboratorError>;
}

/// A request to open an incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRequest {
    /// Subject of the incident.
    pub subject_id: SubjectId,
    /// Level to open the incident at.
    pub level: EscalationLevel,
    /// Short summary.
    pub summary: String,
}

/// Incident management.
pub trait IncidentStore: Send + Sync {
    /// Open an incident, returning its identifier.
    fn raise(&self, request: &IncidentRequest) -> Result<String, CollaboratorError>;

    /// Notify the subject's management chain about an incident.
    fn notify_management(
        &self,
        incident_id: &str,
        subject_id: &SubjectId,
    ) -> Result<(), CollaboratorError>;
}

/// Enhanced-monitoring windows.
pub trait MonitoringStore: Send + Sync {
    /// Extend monitoring of `subject_id` to at least `until`. The stored
    /// expiry becomes `max(existing, until)` and is returned.
    fn extend(
        &self,
        subject_id: &SubjectId,
        until: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CollaboratorError>;

    /// Current expiry, if any.
    fn expiry(&self, subject_id: &SubjectId) -> Option<DateTime<Utc>>;
}

/// Access control. The engine only ever disables access.
pub trait AccessControl: Send + Sync {
    /// Disable the subject's access.
    fn disable(&self, subject_id: &SubjectId, reason: &str) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// ActionOutcome
// ---------------------------------------------------------------------------

/// What an executed action did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Mail handed to the transport.
    Mailed {
        /// Number of recipients.
        recipients: usize,
    },
    /// Incident opened.
    IncidentRaised {
        /// Identifier from the incident store.
        incident_id: String,
        /// Whether management was notified.
        management_notified: bool,
        /// Why the management notification failed, if it did.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notification_error: Option<String>,
    },
    /// Monitoring extended.
    MonitoringExtended {
        /// Effective expiry after the extension.
        until: DateTime<Utc>,
    },
    /// Access disabled.
    AccessDisabled,
    /// Snapshot written to the audit trail.
    ActivityLogged,
}

// ---------------------------------------------------------------------------
// ActionExecutor
// ---------------------------------------------------------------------------

/// The set of collaborators an executor drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Mail delivery.
    pub mail: Arc<dyn MailTransport>,
    /// Incident management.
    pub incidents: Arc<dyn IncidentStore>,
    /// Monitoring windows.
    pub monitoring: Arc<dyn MonitoringStore>,
    /// Access control.
    pub access: Arc<dyn AccessControl>,
    /// Audit destination.
    pub audit: Arc<dyn AuditSink>,
}

/// Executes actions against collaborators.
#[derive(Clone)]
pub struct ActionExecutor {
    collaborators: Collaborators,
}

impl ActionExecutor {
    /// Create an executor.
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    /// Perform `action` of `policy` for `event`.
    pub fn execute(
        &self,
        policy: &Policy,
        action: &Action,
        event: &TriggerEvent,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome, ExecutionError> {
        let c = &self.collaborators;
        let subject_id = &event.subject.subject_id;
        match &action.config {
            ActionConfig::EmailAlert {
                recipients,
                subject,
                body,
            } => {
                let message = MailMessage {
                    recipients: checked_recipients(recipients)?,
                    subject: non_empty(subject, "email subject")?,
                    body: body.clone().unwrap_or_else(|| summary(policy, event)),
                };
                c.mail.send(&message).map_err(delivery_error)?;
                Ok(ActionOutcome::Mailed {
                    recipients: message.recipients.len(),
                })
            }
            ActionConfig::ImmediateAlert {
                recipients,
                message,
            } => {
                let mail = MailMessage {
                    recipients: checked_recipients(recipients)?,
                    subject: format!("{IMMEDIATE_PREFIX} {}", policy.name),
                    body: message.clone().unwrap_or_else(|| summary(policy, event)),
                };
                c.mail.send(&mail).map_err(delivery_error)?;
                Ok(ActionOutcome::Mailed {
                    recipients: mail.recipients.len(),
                })
            }
            ActionConfig::EscalateIncident {
                escalation_level,
                notify_management,
            } => {
                let request = IncidentRequest {
                    subject_id: subject_id.clone(),
                    level: *escalation_level,
                    summary: summary(policy, event),
                };
                let incident_id = c.incidents.raise(&request).map_err(collaborator_error)?;
                // The incident exists from here on. A retry would open a
                // second one, so a failed notification does not fail the action.
                let notification_error = if *notify_management {
                    c.incidents
                        .notify_management(&incident_id, subject_id)
                        .err()
                        .map(|e| e.to_string())
                } else {
                    None
                };
                if let Some(error) = &notification_error {
                    tracing::warn!(%incident_id, subject_id = %subject_id, %error, "management notification failed");
                }
                Ok(ActionOutcome::IncidentRaised {
                    incident_id,
                    management_notified: *notify_management && notification_error.is_none(),
                    notification_error,
                })
            }
            ActionConfig::IncreaseMonitoring { duration_hours } => {
                if *duration_hours == 0 {
                    return Err(ExecutionError::Configuration(
                        "duration_hours must be positive".into(),
                    ));
                }
                let target = now + Duration::hours(i64::from(*duration_hours));
                let until = c
                    .monitoring
                    .extend(subject_id, target)
                    .map_err(collaborator_error)?;
                Ok(ActionOutcome::MonitoringExtended { until })
            }
            ActionConfig::DisableAccess { reason } => {
                let reason = reason
                    .clone()
                    .unwrap_or_else(|| format!("policy {} matched", policy.id));
                c.access
                    .disable(subject_id, &reason)
                    .map_err(collaborator_error)?;
                tracing::warn!(subject_id = %subject_id, policy_id = %policy.id, %reason, "access disabled");
                Ok(ActionOutcome::AccessDisabled)
            }
            ActionConfig::LogDetailedActivity => {
                let snapshot = serde_json::to_value(event)
                    .map_err(|e| ExecutionError::Configuration(e.to_string()))?;
                c.audit.record(
                    AuditEntry::new(AuditEntryType::DetailedActivity, now)
                        .with_level(AuditLevel::Info)
                        .with_policy(&policy.id)
                        .with_event(event.event_id, subject_id)
                        .with_metadata(snapshot),
                );
                Ok(ActionOutcome::ActivityLogged)
            }
        }
    }
}

impl ActionOutcome {
    /// Whether the action ran but part of it needs a human to follow up.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Self::IncidentRaised {
                notification_error: Some(_),
                ..
            }
        )
    }
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor").finish_non_exhaustive()
    }
}

fn checked_recipients(recipients: &[String]) -> Result<Vec<String>, ExecutionError> {
    if recipients.is_empty() {
        return Err(ExecutionError::Configuration("no recipients".into()));
    }
    match recipients.iter().find(|r| !is_valid_email(r)) {
        Some(bad) => Err(ExecutionError::InvalidRecipient(bad.clone())),
        None => Ok(recipients.to_vec()),
    }
}

fn non_empty(s: &str, what: &str) -> Result<String, ExecutionError> {
    if s.trim().is_empty() {
        Err(ExecutionError::Configuration(format!("{what} is empty")))
    } else {
        Ok(s.to_string())
    }
}

fn delivery_error(err: CollaboratorError) -> ExecutionError {
    match err {
        CollaboratorError::Unavailable(msg) => ExecutionError::Delivery(msg),
        CollaboratorError::Rejected(msg) => ExecutionError::InvalidRecipient(msg),
    }
}

fn collaborator_error(err: CollaboratorError) -> ExecutionError {
    match err {
        CollaboratorError::Unavailable(msg) => ExecutionError::Collaborator(msg),
        CollaboratorError::Rejected(msg) => ExecutionError::Configuration(msg),
    }
}

fn summary(policy: &Policy, event: &TriggerEvent) -> String {
    let mut text = format!(
        "Policy \"{}\" ({}) matched {} event {} for subject {} ({}).",
        policy.name,
        policy.id,
        event.kind,
        event.event_id,
        event.subject.subject_id,
        event.subject.department,
    );
    if let Some(risk) = event.metrics.risk_score {
        text.push_str(&format!(" Risk score: {risk}."));
    }
    if let Some(severity) = event.metrics.severity {
        text.push_str(&format!(" Severity: {severity}."));
    }
    text
}
