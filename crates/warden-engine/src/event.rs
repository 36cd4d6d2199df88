//! # Trigger Events
//!
//! An employee-activity event as seen by the engine: who it concerns, what
//! kind of signal produced it, and a snapshot of the metrics conditions are
//! evaluated against. Events are immutable once dispatched; the dispatcher
//! shares them behind `Arc` with every scheduled job.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use warden_core::{EventId, SubjectId};

use crate::config::BusinessHours;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Violation severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Rank 1.
    #[serde(alias = "low", alias = "LOW")]
    Low,
    /// Rank 2.
    #[serde(alias = "medium", alias = "MEDIUM")]
    Medium,
    /// Rank 3.
    #[serde(alias = "high", alias = "HIGH")]
    High,
    /// Rank 4.
    #[serde(alias = "critical", alias = "CRITICAL")]
    Critical,
}

impl Severity {
    /// Numeric rank used by `violation_severity` conditions.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    /// Parse a severity name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Canonical display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// The signal that produced a trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new violation was recorded for the subject.
    ViolationCreated,
    /// The subject's risk score changed.
    RiskUpdated,
    /// An email sent by the subject was flagged.
    EmailFlagged,
    /// An operator triggered evaluation by hand.
    Manual,
}

impl EventKind {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViolationCreated => "violation_created",
            Self::RiskUpdated => "risk_updated",
            Self::EmailFlagged => "email_flagged",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TriggerEvent
// ---------------------------------------------------------------------------

/// The employee an event concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Employee/user identifier.
    pub subject_id: SubjectId,
    /// Department used for group-scoped policies.
    pub department: String,
}

/// Metrics snapshot carried by an event. Absent fields make the conditions
/// that read them evaluate to `false`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetrics {
    /// Subject risk score, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    /// Severity of the violation behind the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Number of events for the subject in the recent window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_event_count: Option<u32>,
    /// Data volume accessed, in gigabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume_gb: Option<f64>,
}

/// An incoming employee-activity event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Unique event identifier; part of every execution key.
    pub event_id: EventId,
    /// Who the event concerns.
    pub subject: Subject,
    /// What produced the event.
    pub kind: EventKind,
    /// Metrics snapshot.
    #[serde(default)]
    pub metrics: EventMetrics,
    /// When the underlying activity happened.
    pub occurred_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// Create an event with a fresh identifier and empty metrics.
    pub fn new(
        subject_id: SubjectId,
        department: impl Into<String>,
        kind: EventKind,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            subject: Subject {
                subject_id,
                department: department.into(),
            },
            kind,
            metrics: EventMetrics::default(),
            occurred_at,
        }
    }

    /// Builder: set the metrics snapshot.
    pub fn with_metrics(mut self, metrics: EventMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builder: set the event identifier.
    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }
}

// ---------------------------------------------------------------------------
// EvaluationContext
// ---------------------------------------------------------------------------

/// The flattened view conditions are evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationContext {
    /// `risk_score` conditions.
    pub risk_score: Option<f64>,
    /// `violation_severity` conditions (Critical=4 … Low=1).
    pub severity_rank: Option<u8>,
    /// `data_access` conditions.
    pub data_volume_gb: Option<f64>,
    /// `frequency` conditions.
    pub recent_event_count: Option<u32>,
    /// Fractional UTC hour of `occurred_at` (18:30 → 18.5).
    pub hour_of_day: f64,
    /// Whether `occurred_at` is outside business hours.
    pub is_after_hours: bool,
    /// `any_violation` conditions.
    pub event_kind: EventKind,
}

impl EvaluationContext {
    /// Derive the context from an event.
    pub fn from_event(event: &TriggerEvent, business_hours: &BusinessHours) -> Self {
        let at = event.occurred_at;
        let hour_of_day =
            at.hour() as f64 + at.minute() as f64 / 60.0 + at.second() as f64 / 3600.0;
        Self {
            risk_score: event.metrics.risk_score,
            severity_rank: event.metrics.severity.map(|s| s.rank()),
            data_volume_gb: event.metrics.data_volume_gb,
            recent_event_count: event.metrics.recent_event_count,
            hour_of_day,
            is_after_hours: business_hours.is_after_hours(at),
            event_kind: event.kind,
        }
    }
}
