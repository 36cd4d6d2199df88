//! # Error Hierarchy
//!
//! Structured error types shared by every Warden crate, built with
//! `thiserror`. Subsystem crates (engine, API) define their own enums and
//! convert into these where an identifier or digest is involved.

use thiserror::Error;

/// Top-level error type for foundational operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Canonicalization failure during digest computation.
    #[error("canonicalization error: {0}")]
    Canonicalization(#[from] CanonicalizationError),

    /// Identifier validation failure.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors during canonical serialization.
#[derive(Error, Debug)]
pub enum CanonicalizationError {
    /// JSON serialization failed during canonicalization.
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Validation errors for identifier newtypes.
///
/// Each variant carries the rejected input so that operators can see
/// exactly what a producer sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Policy identifier is empty, too long, or contains disallowed characters.
    #[error("invalid policy ID: \"{0}\" (expected 1-128 characters of [A-Za-z0-9_.:-])")]
    InvalidPolicyId(String),

    /// Subject (employee/user) identifier is empty or too long.
    #[error("invalid subject ID: \"{0}\" (expected 1-255 non-blank characters)")]
    InvalidSubjectId(String),

    /// Event identifier is not a UUID.
    #[error("invalid event ID: \"{0}\" (expected a UUID)")]
    InvalidEventId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warden_error_wraps_validation() {
        let err = WardenError::from(ValidationError::InvalidPolicyId(String::new()));
        let msg = format!("{err}");
        assert!(msg.contains("validation error"));
        assert!(msg.contains("invalid policy ID"));
    }

    #[test]
    fn canonicalization_error_wraps_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = CanonicalizationError::from(json_err);
        assert!(format!("{err}").contains("serialization failed"));
    }

    #[test]
    fn subject_id_error_carries_input() {
        let err = ValidationError::InvalidSubjectId("   ".into());
        assert!(format!("{err}").contains("\"   \""));
    }
}
