//! # In-Memory Collaborators
//!
//! Process-local implementations of every engine seam: the policy store,
//! the collaborator traits, and [`InMemoryEngine`], which wires them to a
//! [`TriggerDispatcher`]. Used by the HTTP service (with write-through
//! persistence on top), the CLI dry run, and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use warden_core::{PolicyId, SubjectId};

use crate::audit::AuditTrail;
use crate::config::EngineConfig;
use crate::dispatcher::TriggerDispatcher;
use crate::error::{CollaboratorError, ResolutionError};
use crate::executor::{
    AccessControl, Collaborators, IncidentRequest, IncidentStore, MailMessage, MailTransport,
    MonitoringStore,
};
use crate::ledger::InMemoryLedger;
use crate::policy::Policy;
use crate::resolver::PolicyStore;
use crate::scheduler::TimerQueue;

// ---------------------------------------------------------------------------
// InMemoryPolicyStore
// ---------------------------------------------------------------------------

/// Policies keyed by id. `BTreeMap` keeps listings in id order.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<BTreeMap<PolicyId, Arc<Policy>>>,
    unavailable: AtomicBool,
}

impl InMemoryPolicyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new policy. Returns `false` if the id is taken.
    pub fn create(&self, policy: Policy) -> bool {
        let mut map = self.policies.write();
        if map.contains_key(&policy.id) {
            return false;
        }
        map.insert(policy.id.clone(), Arc::new(policy));
        true
    }

    /// Insert or replace a policy.
    pub fn upsert(&self, policy: Policy) -> Option<Arc<Policy>> {
        self.policies
            .write()
            .insert(policy.id.clone(), Arc::new(policy))
    }

    /// Remove a policy.
    pub fn remove(&self, id: &PolicyId) -> Option<Arc<Policy>> {
        self.policies.write().remove(id)
    }

    /// Set the active flag, returning the updated policy.
    pub fn set_active(
        &self,
        id: &PolicyId,
        active: bool,
        at: DateTime<Utc>,
    ) -> Option<Arc<Policy>> {
        let mut map = self.policies.write();
        let current = map.get(id)?;
        let mut updated = Policy::clone(current);
        updated.is_active = active;
        updated.updated_at = at;
        let updated = Arc::new(updated);
        map.insert(id.clone(), Arc::clone(&updated));
        Some(updated)
    }

    /// All policies in id order.
    pub fn list(&self) -> Vec<Arc<Policy>> {
        self.policies.read().values().cloned().collect()
    }

    /// Number of stored policies.
    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }

    /// Simulate an outage: reads fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ResolutionError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ResolutionError::StoreUnavailable(
                "policy store offline".into(),
            ))
        } else {
            Ok(())
        }
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn snapshot(&self) -> Result<Vec<Arc<Policy>>, ResolutionError> {
        self.check_available()?;
        Ok(self.list())
    }

    fn get(&self, id: &PolicyId) -> Result<Option<Arc<Policy>>, ResolutionError> {
        self.check_available()?;
        Ok(self.policies.read().get(id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Mail
// ---------------------------------------------------------------------------

/// Records sent mail. Can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingMailTransport {
    sent: Mutex<Vec<MailMessage>>,
    failures_left: AtomicU32,
    reject: AtomicBool,
}

impl RecordingMailTransport {
    /// Create a transport that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Reject every send permanently while set.
    pub fn reject_all(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Messages delivered so far.
    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().clone()
    }
}

impl MailTransport for RecordingMailTransport {
    fn send(&self, message: &MailMessage) -> Result<(), CollaboratorError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected("recipient refused".into()));
        }
        let took_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took_failure {
            return Err(CollaboratorError::Unavailable(
                "mail transport unavailable".into(),
            ));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

/// Records incidents and management notifications.
#[derive(Debug, Default)]
pub struct InMemoryIncidentStore {
    incidents: Mutex<Vec<IncidentRequest>>,
    notifications: Mutex<Vec<(String, SubjectId)>>,
    next_id: AtomicU64,
}

impl InMemoryIncidentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Incidents raised so far.
    pub fn incidents(&self) -> Vec<IncidentRequest> {
        self.incidents.lock().clone()
    }

    /// `(incident_id, subject)` pairs notified so far.
    pub fn notifications(&self) -> Vec<(String, SubjectId)> {
        self.notifications.lock().clone()
    }
}

impl IncidentStore for InMemoryIncidentStore {
    fn raise(&self, request: &IncidentRequest) -> Result<String, CollaboratorError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.incidents.lock().push(request.clone());
        Ok(format!("INC-{n:06}"))
    }

    fn notify_management(
        &self,
        incident_id: &str,
        subject_id: &SubjectId,
    ) -> Result<(), CollaboratorError> {
        self.notifications
            .lock()
            .push((incident_id.to_string(), subject_id.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

/// Monitoring expiries per subject.
#[derive(Debug, Default)]
pub struct InMemoryMonitoringStore {
    expiries: Mutex<HashMap<SubjectId, DateTime<Utc>>>,
}

impl InMemoryMonitoringStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MonitoringStore for InMemoryMonitoringStore {
    fn extend(
        &self,
        subject_id: &SubjectId,
        until: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CollaboratorError> {
        let mut map = self.expiries.lock();
        let expiry = map.entry(subject_id.clone()).or_insert(until);
        if until > *expiry {
            *expiry = until;
        }
        Ok(*expiry)
    }

    fn expiry(&self, subject_id: &SubjectId) -> Option<DateTime<Utc>> {
        self.expiries.lock().get(subject_id).copied()
    }
}

// ---------------------------------------------------------------------------
// Access control
// ---------------------------------------------------------------------------

/// Records disabled subjects.
#[derive(Debug, Default)]
pub struct InMemoryAccessControl {
    disabled: Mutex<Vec<(SubjectId, String)>>,
}

impl InMemoryAccessControl {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(subject, reason)` pairs disabled so far.
    pub fn disabled(&self) -> Vec<(SubjectId, String)> {
        self.disabled.lock().clone()
    }

    /// Whether `subject_id` has been disabled.
    pub fn is_disabled(&self, subject_id: &SubjectId) -> bool {
        self.disabled.lock().iter().any(|(s, _)| s == subject_id)
    }
}

impl AccessControl for InMemoryAccessControl {
    fn disable(&self, subject_id: &SubjectId, reason: &str) -> Result<(), CollaboratorError> {
        self.disabled
            .lock()
            .push((subject_id.clone(), reason.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryEngine
// ---------------------------------------------------------------------------

/// A dispatcher wired to in-memory components, with typed handles to each.
pub struct InMemoryEngine {
    /// Engine settings.
    pub config: EngineConfig,
    /// Policy store.
    pub policies: Arc<InMemoryPolicyStore>,
    /// Execution ledger.
    pub ledger: Arc<InMemoryLedger>,
    /// Deferred queue.
    pub queue: Arc<TimerQueue>,
    /// Audit trail.
    pub audit: Arc<AuditTrail>,
    /// Incident store.
    pub incidents: Arc<InMemoryIncidentStore>,
    /// Monitoring store.
    pub monitoring: Arc<InMemoryMonitoringStore>,
    /// Access control.
    pub access: Arc<InMemoryAccessControl>,
    /// The dispatcher over all of the above.
    pub dispatcher: TriggerDispatcher,
}

impl InMemoryEngine {
    /// Build an engine that delivers mail through `mail`.
    pub fn with_mail(config: EngineConfig, mail: Arc<dyn MailTransport>) -> Self {
        let policies = Arc::new(InMemoryPolicyStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(TimerQueue::new(config.queue_capacity));
        let audit = Arc::new(AuditTrail::new(config.audit_capacity));
        let incidents = Arc::new(InMemoryIncidentStore::new());
        let monitoring = Arc::new(InMemoryMonitoringStore::new());
        let access = Arc::new(InMemoryAccessControl::new());
        let dispatcher = TriggerDispatcher::new(
            config.clone(),
            policies.clone(),
            ledger.clone(),
            queue.clone(),
            Collaborators {
                mail,
                incidents: incidents.clone(),
                monitoring: monitoring.clone(),
                access: access.clone(),
                audit: audit.clone(),
            },
        );
        Self {
            config,
            policies,
            ledger,
            queue,
            audit,
            incidents,
            monitoring,
            access,
            dispatcher,
        }
    }
}

impl std::fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEngine")
            .field("policies", &self.policies.len())
            .field("ledger", &self.ledger.len())
            .field("queue", &self.queue)
            .field("audit", &self.audit)
            .finish()
    }
}
