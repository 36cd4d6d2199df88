//! # warden-engine: Security Policy Rule Engine
//!
//! The backend engine behind the insider-threat policy console. Policies
//! declare a scope (global, department, single user), a priority, boolean
//! conditions joined by AND/OR, and an ordered list of actions. When an
//! employee-activity event satisfies a policy's conditions, its actions are
//! scheduled, executed exactly once per `(policy, event, action)` and
//! audited.
//!
//! ## Pipeline
//!
//! ```text
//! TriggerEvent ─▶ PolicyResolver ─▶ ConditionTreeResolver ─▶ ActionScheduler
//!                                                              │ try_claim
//!                                                              ▼
//!                           ActionExecutor ◀─ run_due ─── TimerQueue
//! ```
//!
//! - [`condition`] evaluates single conditions and folds condition lists.
//! - [`resolver`] selects applicable policies in a total order.
//! - [`scheduler`] plans execution times and enqueues claimed actions.
//! - [`executor`] performs side effects through collaborator traits.
//! - [`ledger`] owns execution records; its claim is the idempotency gate.
//! - [`dispatcher`] drives one event through the state machine.
//! - [`policy_file`] loads and validates YAML policy documents.
//!
//! The engine is synchronous. Hosts that run an async runtime call
//! [`TriggerDispatcher::run_due`] from a blocking task.

pub mod audit;
pub mod condition;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod executor;
pub mod ledger;
pub mod memory;
pub mod policy;
pub mod policy_file;
pub mod resolver;
pub mod scheduler;

// Re-export primary types.
pub use audit::{AuditEntry, AuditEntryType, AuditLevel, AuditSink, AuditTrail};
pub use condition::{Condition, ConditionEvaluator, ConditionTreeResolver};
pub use config::{BusinessHours, ConfigError, EngineConfig};
pub use dispatcher::{
    DispatchReport, DispatchState, PolicyOutcome, PolicyReport, PolicyStats, TriggerDispatcher,
};
pub use error::{
    CollaboratorError, DispatchError, ExecutionError, LedgerError, ResolutionError,
    SchedulingError,
};
pub use event::{EvaluationContext, EventKind, EventMetrics, Severity, Subject, TriggerEvent};
pub use executor::{
    AccessControl, ActionExecutor, ActionOutcome, Collaborators, IncidentStore, MailMessage,
    MailTransport, MonitoringStore,
};
pub use ledger::{
    Completion, ExecutionKey, ExecutionLedger, ExecutionRecord, ExecutionStatus, InMemoryLedger,
};
pub use memory::InMemoryEngine;
pub use policy::{Action, ActionConfig, ActionType, Policy, PolicyScope, PolicyValidationError};
pub use policy_file::{PolicyFile, PolicyFileError};
pub use resolver::{PolicyResolver, PolicyStore};
pub use scheduler::{ActionScheduler, DeferredQueue, ScheduledJob, TimerQueue};
