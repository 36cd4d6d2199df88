//! # Execution Audit Trail
//!
//! Records every trigger, policy evaluation, and action transition for
//! compliance review.
//!
//! ## Tamper Evidence
//!
//! Each appended entry is sealed with a sequence number, the digest of its
//! predecessor, and its own digest computed over `CanonicalBytes` of every
//! other field. [`AuditTrail::verify_chain`] recomputes the chain. The
//! in-memory trail keeps the newest `max_entries` entries, trimming the
//! oldest 10% on overflow; hosts that need the full history persist entries
//! as they are appended (see [`AuditTrail::entries_after`]).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use warden_core::{sha256_digest, CanonicalBytes, ContentDigest, EventId, PolicyId, SubjectId};

// ---------------------------------------------------------------------------
// AuditEntryType / AuditLevel
// ---------------------------------------------------------------------------

/// The type of audit trail event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryType {
    /// An event entered the dispatcher.
    TriggerReceived,
    /// A policy's conditions were evaluated against an event.
    PolicyEvaluated,
    /// An action was claimed and enqueued.
    ActionScheduled,
    /// An action ran successfully.
    ActionExecuted,
    /// An action failed terminally.
    ActionFailed,
    /// A pending action was abandoned without running.
    ActionCancelled,
    /// Full event snapshot written by `log_detailed_activity`.
    DetailedActivity,
}

impl AuditEntryType {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TriggerReceived => "trigger_received",
            Self::PolicyEvaluated => "policy_evaluated",
            Self::ActionScheduled => "action_scheduled",
            Self::ActionExecuted => "action_executed",
            Self::ActionFailed => "action_failed",
            Self::ActionCancelled => "action_cancelled",
            Self::DetailedActivity => "detailed_activity",
        }
    }

    /// Parse the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "trigger_received" => Self::TriggerReceived,
            "policy_evaluated" => Self::PolicyEvaluated,
            "action_scheduled" => Self::ActionScheduled,
            "action_executed" => Self::ActionExecuted,
            "action_failed" => Self::ActionFailed,
            "action_cancelled" => Self::ActionCancelled,
            "detailed_activity" => Self::DetailedActivity,
            _ => return None,
        })
    }
}

impl std::fmt::Display for AuditEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Importance of an audit entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    /// Routine.
    #[default]
    Info,
    /// Needs attention.
    Warning,
    /// Access-affecting; always reviewed.
    Critical,
}

impl AuditLevel {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// Parse the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "info" => Self::Info,
            "warning" => Self::Warning,
            "critical" => Self::Critical,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// AuditEntry
// ---------------------------------------------------------------------------

/// A single entry in the audit trail.
///
/// `sequence`, `previous_digest` and `digest` are assigned by
/// [`AuditTrail::append`]; entries built with [`AuditEntry::new`] carry
/// placeholders until then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the trail, starting at 1.
    pub sequence: u64,
    /// What happened.
    pub entry_type: AuditEntryType,
    /// Importance.
    pub level: AuditLevel,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Policy involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,
    /// Event involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    /// Subject involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<SubjectId>,
    /// Structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Hex digest of the preceding entry.
    pub previous_digest: String,
    /// Hex digest of this entry.
    pub digest: String,
}

/// The digested view: every field except `digest`.
#[derive(Serialize)]
struct DigestView<'a> {
    sequence: u64,
    entry_type: AuditEntryType,
    level: AuditLevel,
    timestamp: &'a DateTime<Utc>,
    policy_id: &'a Option<PolicyId>,
    event_id: &'a Option<EventId>,
    subject_id: &'a Option<SubjectId>,
    metadata: &'a Option<serde_json::Value>,
    previous_digest: &'a str,
}

impl AuditEntry {
    /// Create an unsealed `Info` entry.
    pub fn new(entry_type: AuditEntryType, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence: 0,
            entry_type,
            level: AuditLevel::Info,
            timestamp,
            policy_id: None,
            event_id: None,
            subject_id: None,
            metadata: None,
            previous_digest: String::new(),
            digest: String::new(),
        }
    }

    /// Builder: set the level.
    pub fn with_level(mut self, level: AuditLevel) -> Self {
        self.level = level;
        self
    }

    /// Builder: attach a policy.
    pub fn with_policy(mut self, policy_id: &PolicyId) -> Self {
        self.policy_id = Some(policy_id.clone());
        self
    }

    /// Builder: attach an event and its subject.
    pub fn with_event(mut self, event_id: EventId, subject_id: &SubjectId) -> Self {
        self.event_id = Some(event_id);
        self.subject_id = Some(subject_id.clone());
        self
    }

    /// Builder: attach structured metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Compute the digest over every field except `digest`.
    ///
    /// Returns `None` if canonicalization fails.
    pub fn compute_digest(&self) -> Option<ContentDigest> {
        let view = DigestView {
            sequence: self.sequence,
            entry_type: self.entry_type,
            level: self.level,
            timestamp: &self.timestamp,
            policy_id: &self.policy_id,
            event_id: &self.event_id,
            subject_id: &self.subject_id,
            metadata: &self.metadata,
            previous_digest: &self.previous_digest,
        };
        match CanonicalBytes::new(&view) {
            Ok(c) => Some(sha256_digest(&c)),
            Err(e) => {
                tracing::warn!(entry_type = %self.entry_type, error = %e, "audit entry canonicalization failed, digest unavailable");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AuditSink
// ---------------------------------------------------------------------------

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    /// Record an entry. Sinks seal and store it; recording never fails the
    /// caller's operation.
    fn record(&self, entry: AuditEntry);
}

// ---------------------------------------------------------------------------
// AuditTrail
// ---------------------------------------------------------------------------

/// Where a chain verification failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditChainError {
    /// The entry's digest does not match its content.
    #[error("entry {0} digest does not match its content")]
    DigestMismatch(u64),
    /// The entry does not point at its predecessor's digest.
    #[error("entry {0} is not linked to its predecessor")]
    BrokenLink(u64),
}

struct TrailState {
    entries: Vec<AuditEntry>,
    next_sequence: u64,
    head: ContentDigest,
}

/// An append-only, hash-chained audit trail with a bounded in-memory window.
pub struct AuditTrail {
    state: Mutex<TrailState>,
    max_entries: usize,
}

impl AuditTrail {
    /// Create an empty trail keeping at most `max_entries` entries in memory.
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(TrailState {
                entries: Vec::new(),
                next_sequence: 1,
                head: ContentDigest::ZERO,
            }),
            max_entries: max_entries.max(1),
        }
    }

    /// Seal and append an entry, returning the sealed copy.
    pub fn append(&self, mut entry: AuditEntry) -> AuditEntry {
        let mut state = self.state.lock();
        entry.sequence = state.next_sequence;
        entry.previous_digest = state.head.to_hex();
        let digest = entry.compute_digest().unwrap_or(ContentDigest::ZERO);
        entry.digest = digest.to_hex();
        state.next_sequence += 1;
        state.head = digest;
        state.entries.push(entry.clone());
        if state.entries.len() > self.max_entries {
            let trim_count = (self.max_entries / 10).max(1);
            state.entries.drain(..trim_count);
        }
        entry
    }

    /// Replace the in-memory window with previously persisted entries,
    /// continuing the chain from the last one.
    pub fn restore(&self, mut entries: Vec<AuditEntry>) {
        entries.sort_by_key(|e| e.sequence);
        let start = entries.len().saturating_sub(self.max_entries);
        let mut state = self.state.lock();
        if let Some(last) = entries.last() {
            state.next_sequence = last.sequence + 1;
            state.head = ContentDigest::from_hex(&last.digest).unwrap_or(ContentDigest::ZERO);
        }
        state.entries = entries.split_off(start);
    }

    /// Number of entries held in memory.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no entries are held in memory.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// The newest `n` entries, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<AuditEntry> {
        let state = self.state.lock();
        let start = state.entries.len().saturating_sub(n);
        state.entries[start..].to_vec()
    }

    /// Entries with a sequence number greater than `sequence`.
    pub fn entries_after(&self, sequence: u64) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.sequence > sequence)
            .cloned()
            .collect()
    }

    /// Sequence number of the newest entry, 0 when empty.
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().next_sequence - 1
    }

    /// Entries of a given type.
    pub fn entries_by_type(&self, entry_type: AuditEntryType) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.entry_type == entry_type)
            .cloned()
            .collect()
    }

    /// Entries concerning an event.
    pub fn entries_for_event(&self, event_id: EventId) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.event_id == Some(event_id))
            .cloned()
            .collect()
    }

    /// Recompute every digest and link held in memory.
    pub fn verify_chain(&self) -> Result<(), AuditChainError> {
        let state = self.state.lock();
        let mut previous: Option<&AuditEntry> = None;
        for entry in &state.entries {
            let recomputed = entry.compute_digest().map(|d| d.to_hex());
            if recomputed.as_deref() != Some(entry.digest.as_str()) {
                return Err(AuditChainError::DigestMismatch(entry.sequence));
            }
            if let Some(prev) = previous {
                if entry.previous_digest != prev.digest {
                    return Err(AuditChainError::BrokenLink(entry.sequence));
                }
            }
            previous = Some(entry);
        }
        Ok(())
    }
}

impl AuditSink for AuditTrail {
    fn record(&self, entry: AuditEntry) {
        self.append(entry);
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("entries", &self.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}
