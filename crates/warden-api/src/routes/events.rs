//! # Event Intake API
//!
//! Upstream monitors post employee-activity events here. Each event is
//! dispatched synchronously: applicable policies are resolved, their
//! conditions evaluated, and the actions of matching policies claimed and
//! queued. Execution happens later on the worker.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use warden_core::{EventId, SubjectId};
use warden_engine::{
    DispatchError, DispatchReport, EventKind, EventMetrics, ExecutionRecord, TriggerEvent,
};

use crate::error::AppError;
use crate::extractors::{extract_validated_json, Validate};
use crate::state::AppState;

/// Longest accepted subject id or department name.
const MAX_FIELD_LEN: usize = 255;

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// An employee-activity event.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitEventRequest {
    /// Caller-assigned id. Resubmitting the same id never re-runs actions.
    pub event_id: Option<Uuid>,
    pub subject_id: String,
    #[serde(default)]
    pub department: String,
    /// `violation_created`, `risk_updated`, `email_flagged` or `manual`.
    #[schema(value_type = String)]
    pub event_kind: EventKind,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metrics: EventMetrics,
    /// Defaults to the time of receipt.
    pub occurred_at: Option<DateTime<Utc>>,
}

impl Validate for SubmitEventRequest {
    fn validate(&self) -> Result<(), String> {
        if self.subject_id.trim().is_empty() {
            return Err("subject_id must not be empty".into());
        }
        if self.subject_id.len() > MAX_FIELD_LEN {
            return Err(format!("subject_id must not exceed {MAX_FIELD_LEN} characters"));
        }
        if self.department.len() > MAX_FIELD_LEN {
            return Err(format!("department must not exceed {MAX_FIELD_LEN} characters"));
        }
        if let Some(score) = self.metrics.risk_score {
            if !score.is_finite() || !(0.0..=100.0).contains(&score) {
                return Err("metrics.risk_score must be between 0 and 100".into());
            }
        }
        if let Some(volume) = self.metrics.data_volume_gb {
            if !volume.is_finite() || volume < 0.0 {
                return Err("metrics.data_volume_gb must not be negative".into());
            }
        }
        Ok(())
    }
}

/// The dispatch report for a submitted event.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct DispatchReportBody(#[schema(value_type = Object)] pub DispatchReport);

/// Execution records for one event.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EventExecutions {
    pub event_id: String,
    #[schema(value_type = Vec<Object>)]
    pub records: Vec<ExecutionRecord>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the event intake router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/events", post(submit_event))
        .route("/v1/events/:id/executions", get(event_executions))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /v1/events: Dispatch an event.
#[utoipa::path(
    post,
    path = "/v1/events",
    request_body = SubmitEventRequest,
    responses(
        (status = 200, description = "Event dispatched", body = DispatchReportBody),
        (status = 422, description = "Invalid event", body = crate::error::ErrorBody),
        (status = 503, description = "Policy store unavailable", body = crate::error::ErrorBody),
    ),
    tag = "events"
)]
async fn submit_event(
    State(state): State<AppState>,
    body: Result<Json<SubmitEventRequest>, JsonRejection>,
) -> Result<Json<DispatchReportBody>, AppError> {
    let req = extract_validated_json(body)?;
    let now = Utc::now();
    let subject_id = SubjectId::new(req.subject_id)?;
    let mut event = TriggerEvent::new(
        subject_id,
        req.department,
        req.event_kind,
        req.occurred_at.unwrap_or(now),
    )
    .with_metrics(req.metrics);
    if let Some(id) = req.event_id {
        event = event.with_event_id(EventId::from_uuid(id));
    }

    let report = state
        .engine
        .dispatcher
        .dispatch(event.clone(), now)
        .map_err(|e| match e {
            DispatchError::Resolution(e) => AppError::from(e),
        })?;

    state.metrics.record_dispatch(report.state);
    state.persist_dispatch(&report, &event).await;
    if report.records().next().is_some() {
        state.work.notify_one();
    }

    Ok(Json(DispatchReportBody(report)))
}

/// GET /v1/events/:id/executions: Execution records created for an event.
#[utoipa::path(
    get,
    path = "/v1/events/{id}/executions",
    params(("id" = String, Path, description = "Event id (UUID)")),
    responses(
        (status = 200, description = "Execution records", body = EventExecutions),
        (status = 422, description = "Malformed event id", body = crate::error::ErrorBody),
    ),
    tag = "events"
)]
async fn event_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EventExecutions>, AppError> {
    let event_id = EventId::parse(&id)?;
    let records = state.engine.dispatcher.executions_for_event(event_id);
    Ok(Json(EventExecutions {
        event_id: event_id.to_string(),
        records,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> SubmitEventRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn minimal_request_is_valid() {
        let req = request(serde_json::json!({
            "subject_id": "emp-1",
            "event_kind": "risk_updated",
        }));
        assert!(req.validate().is_ok());
        assert_eq!(req.metrics, EventMetrics::default());
        assert!(req.department.is_empty());
    }

    #[test]
    fn rejects_blank_subject() {
        let req = request(serde_json::json!({
            "subject_id": "  ",
            "event_kind": "manual",
        }));
        assert!(req.validate().unwrap_err().contains("subject_id"));
    }

    #[test]
    fn rejects_out_of_range_metrics() {
        let req = request(serde_json::json!({
            "subject_id": "emp-1",
            "event_kind": "risk_updated",
            "metrics": { "risk_score": 140.0 },
        }));
        assert!(req.validate().unwrap_err().contains("risk_score"));

        let req = request(serde_json::json!({
            "subject_id": "emp-1",
            "event_kind": "risk_updated",
            "metrics": { "data_volume_gb": -1.0 },
        }));
        assert!(req.validate().unwrap_err().contains("data_volume_gb"));
    }

    #[test]
    fn unknown_event_kind_does_not_parse() {
        let parsed = serde_json::from_value::<SubmitEventRequest>(serde_json::json!({
            "subject_id": "emp-1",
            "event_kind": "badge_swipe",
        }));
        assert!(parsed.is_err());
    }
}
