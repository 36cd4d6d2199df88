//! # Engine Errors
//!
//! One enum per pipeline stage. Only [`ResolutionError`] escapes
//! [`TriggerDispatcher::dispatch`](crate::TriggerDispatcher::dispatch);
//! everything downstream of resolution is folded into the dispatch report
//! or the execution record.

use thiserror::Error;

use crate::ledger::{ExecutionKey, ExecutionStatus};

/// The policy store could not be read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// The backing store is unreachable or returned an error.
    #[error("policy store unavailable: {0}")]
    StoreUnavailable(String),
}

/// An execution-ledger operation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No record exists for the key.
    #[error("no execution record for {0}")]
    NotFound(ExecutionKey),

    /// The record already reached `executed` or `failed`.
    #[error("execution record {key} is already {status}")]
    AlreadyTerminal {
        /// The record's key.
        key: ExecutionKey,
        /// Its terminal status.
        status: ExecutionStatus,
    },

    /// The ledger backend is unreachable.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Actions of a policy could not be scheduled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    /// The deferred queue is full or closed.
    #[error("deferred queue unavailable: {0}")]
    QueueUnavailable(String),

    /// The ledger refused the claim for a reason other than a duplicate.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// A collaborator (mail, incidents, monitoring, access control) failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Temporary failure; the operation may succeed later.
    #[error("{0}")]
    Unavailable(String),

    /// The request was refused and will not succeed on retry.
    #[error("{0}")]
    Rejected(String),
}

/// One action failed to execute.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The mail transport failed to deliver.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// A collaborator was temporarily unavailable.
    #[error("collaborator unavailable: {0}")]
    Collaborator(String),

    /// A recipient address is malformed or was refused.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The action's configuration cannot be executed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The policy was deleted or deactivated before the action ran.
    #[error("policy_deactivated")]
    PolicyDeactivated,
}

impl ExecutionError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Delivery(_) | Self::Collaborator(_))
    }
}

/// Dispatch of an event was aborted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Applicable policies could not be resolved.
    #[error("resolution failed: {0}")]
    Resolution(#[from] ResolutionError),
}
