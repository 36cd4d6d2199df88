//! # Request Extraction
//!
//! Maps JSON rejections to [`AppError::BadRequest`] and runs request-level
//! validation through the [`Validate`] trait.

use axum::extract::rejection::JsonRejection;
use axum::Json;

use crate::error::AppError;

/// Request types with checks serde cannot express.
pub trait Validate {
    /// Returns a message describing the first problem found.
    fn validate(&self) -> Result<(), String>;
}

/// Unwrap a JSON body, turning a rejection into a 400.
pub fn extract_json<T>(result: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    result
        .map(|Json(v)| v)
        .map_err(|err| AppError::BadRequest(err.body_text()))
}

/// Unwrap a JSON body and validate it; validation failures are a 422.
pub fn extract_validated_json<T: Validate>(
    result: Result<Json<T>, JsonRejection>,
) -> Result<T, AppError> {
    let value = extract_json(result)?;
    value.validate().map_err(AppError::Validation)?;
    Ok(value)
}
