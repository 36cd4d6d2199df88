//! # Policy Management API
//!
//! CRUD over security policies as the admin console uses them. Every write
//! normalizes order ranks and runs save-time validation before the policy
//! reaches the engine; a rejected policy never becomes visible to dispatch.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use warden_core::PolicyId;
use warden_engine::{ExecutionLedger, Policy, PolicyStats, PolicyStore};

use crate::error::AppError;
use crate::extractors::extract_json;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// A policy document as submitted by the console.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct PolicyDocument(#[schema(value_type = Object)] pub Policy);

/// A policy with the counts shown next to it.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PolicyWithStats {
    #[schema(value_type = Object)]
    pub policy: Policy,
    #[schema(value_type = Object)]
    pub stats: PolicyStats,
}

/// Result of deleting a policy.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeletedPolicy {
    pub removed: bool,
    pub policy_id: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the policy management router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/policies", get(list_policies).post(create_policy))
        .route(
            "/v1/policies/:id",
            get(get_policy).put(update_policy).delete(delete_policy),
        )
        .route("/v1/policies/:id/toggle", patch(toggle_policy))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /v1/policies: List policies in id order, with stats.
#[utoipa::path(
    get,
    path = "/v1/policies",
    responses(
        (status = 200, description = "Policies with stats", body = Vec<PolicyWithStats>),
        (status = 503, description = "Policy store unavailable", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn list_policies(
    State(state): State<AppState>,
) -> Result<Json<Vec<PolicyWithStats>>, AppError> {
    let now = Utc::now();
    let mut out = Vec::new();
    for policy in state.engine.policies.snapshot()? {
        // A policy removed between the snapshot and here is simply skipped.
        if let Some(stats) = state.engine.dispatcher.policy_stats_at(&policy.id, now)? {
            out.push(PolicyWithStats {
                policy: Policy::clone(&policy),
                stats,
            });
        }
    }
    Ok(Json(out))
}

/// POST /v1/policies: Create a policy.
#[utoipa::path(
    post,
    path = "/v1/policies",
    request_body = PolicyDocument,
    responses(
        (status = 201, description = "Policy created", body = PolicyWithStats),
        (status = 409, description = "Policy id already exists", body = crate::error::ErrorBody),
        (status = 422, description = "Policy failed validation", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn create_policy(
    State(state): State<AppState>,
    body: Result<Json<PolicyDocument>, JsonRejection>,
) -> Result<(StatusCode, Json<PolicyWithStats>), AppError> {
    let PolicyDocument(mut policy) = extract_json(body)?;
    let now = Utc::now();
    policy.normalize();
    policy.validate()?;
    policy.created_at = now;
    policy.updated_at = now;

    if !state.policies().create(policy.clone()) {
        return Err(AppError::Conflict(format!(
            "policy '{}' already exists",
            policy.id
        )));
    }
    if let Err(e) = state.persist_policy(&policy).await {
        state.policies().remove(&policy.id);
        return Err(e);
    }
    tracing::info!(policy_id = %policy.id, scope = policy.scope.level().as_str(), priority = policy.priority, "policy created");

    let view = with_stats(&state, policy);
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /v1/policies/:id: One policy with stats.
#[utoipa::path(
    get,
    path = "/v1/policies/{id}",
    params(("id" = String, Path, description = "Policy id")),
    responses(
        (status = 200, description = "Policy with stats", body = PolicyWithStats),
        (status = 404, description = "No such policy", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn get_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PolicyWithStats>, AppError> {
    let id = parse_id(&id)?;
    let policy = find(&state, &id)?;
    Ok(Json(with_stats(&state, Policy::clone(&policy))))
}

/// PUT /v1/policies/:id: Replace a policy, keeping its creation fields.
#[utoipa::path(
    put,
    path = "/v1/policies/{id}",
    params(("id" = String, Path, description = "Policy id")),
    request_body = PolicyDocument,
    responses(
        (status = 200, description = "Policy replaced", body = PolicyWithStats),
        (status = 404, description = "No such policy", body = crate::error::ErrorBody),
        (status = 422, description = "Policy failed validation", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn update_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<PolicyDocument>, JsonRejection>,
) -> Result<Json<PolicyWithStats>, AppError> {
    let id = parse_id(&id)?;
    let PolicyDocument(mut policy) = extract_json(body)?;
    if policy.id != id {
        return Err(AppError::Validation(format!(
            "body id '{}' does not match path id '{id}'",
            policy.id
        )));
    }
    let current = find(&state, &id)?;
    policy.normalize();
    policy.validate()?;
    policy.created_by = current.created_by.clone();
    policy.created_at = current.created_at;
    policy.updated_at = Utc::now();

    state.persist_policy(&policy).await?;
    state.policies().upsert(policy.clone());
    tracing::info!(policy_id = %id, is_active = policy.is_active, "policy replaced");

    Ok(Json(with_stats(&state, policy)))
}

/// DELETE /v1/policies/:id: Remove a policy. Its pending actions fail
/// with `policy_deactivated` when they come due.
#[utoipa::path(
    delete,
    path = "/v1/policies/{id}",
    params(("id" = String, Path, description = "Policy id")),
    responses(
        (status = 200, description = "Policy removed", body = DeletedPolicy),
        (status = 404, description = "No such policy", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn delete_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedPolicy>, AppError> {
    let id = parse_id(&id)?;
    find(&state, &id)?;
    state.forget_policy(&id).await?;
    let removed = state.policies().remove(&id).is_some();
    tracing::info!(policy_id = %id, "policy removed");
    Ok(Json(DeletedPolicy {
        removed,
        policy_id: id.to_string(),
    }))
}

/// PATCH /v1/policies/:id/toggle: Flip `is_active`.
#[utoipa::path(
    patch,
    path = "/v1/policies/{id}/toggle",
    params(("id" = String, Path, description = "Policy id")),
    responses(
        (status = 200, description = "Policy toggled", body = PolicyWithStats),
        (status = 404, description = "No such policy", body = crate::error::ErrorBody),
    ),
    tag = "policies"
)]
async fn toggle_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PolicyWithStats>, AppError> {
    let id = parse_id(&id)?;
    let current = find(&state, &id)?;
    let updated = state
        .policies()
        .set_active(&id, !current.is_active, Utc::now())
        .ok_or_else(|| AppError::NotFound(format!("policy '{id}' not found")))?;
    if let Err(e) = state.persist_policy(&updated).await {
        state.policies().set_active(&id, current.is_active, current.updated_at);
        return Err(e);
    }
    tracing::info!(policy_id = %id, is_active = updated.is_active, "policy toggled");
    Ok(Json(with_stats(&state, Policy::clone(&updated))))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Ids that cannot exist are reported as missing.
fn parse_id(raw: &str) -> Result<PolicyId, AppError> {
    PolicyId::new(raw).map_err(|_| AppError::NotFound(format!("policy '{raw}' not found")))
}

fn find(state: &AppState, id: &PolicyId) -> Result<std::sync::Arc<Policy>, AppError> {
    state
        .engine
        .policies
        .get(id)?
        .ok_or_else(|| AppError::NotFound(format!("policy '{id}' not found")))
}

/// Stats for a policy that may not be in the store yet.
fn with_stats(state: &AppState, policy: Policy) -> PolicyWithStats {
    let since = Utc::now() - state.config.engine.recent_window;
    let stats = PolicyStats {
        conditions: policy.conditions.len(),
        actions: policy.actions.len(),
        recent_executions: state.engine.ledger.recent_executions(&policy.id, since),
    };
    PolicyWithStats { policy, stats }
}
