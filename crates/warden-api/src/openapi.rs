//! # OpenAPI Specification
//!
//! Serves the generated OpenAPI document at `/openapi.json`.

use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

/// Assembled OpenAPI spec for the service.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Warden Policy Engine API",
        version = "0.3.0",
        description = "Policy management, event intake, execution history and audit trail for insider-threat response policies.",
        license(name = "BUSL-1.1")
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development server"),
    ),
    paths(
        // ── Policies ─────────────────────────────────────────────────────
        crate::routes::policies::list_policies,
        crate::routes::policies::create_policy,
        crate::routes::policies::get_policy,
        crate::routes::policies::update_policy,
        crate::routes::policies::delete_policy,
        crate::routes::policies::toggle_policy,
        // ── Events ───────────────────────────────────────────────────────
        crate::routes::events::submit_event,
        crate::routes::events::event_executions,
        // ── Audit ────────────────────────────────────────────────────────
        crate::routes::audit::list_audit,
        crate::routes::audit::verify_audit,
    ),
    components(schemas(
        crate::error::ErrorBody,
        crate::error::ErrorDetail,
        crate::routes::policies::PolicyDocument,
        crate::routes::policies::PolicyWithStats,
        crate::routes::policies::DeletedPolicy,
        crate::routes::events::SubmitEventRequest,
        crate::routes::events::DispatchReportBody,
        crate::routes::events::EventExecutions,
        crate::routes::audit::AuditListing,
        crate::routes::audit::ChainVerification,
        crate::routes::audit::StoredChainCheck,
    )),
    tags(
        (name = "policies", description = "Security policy management"),
        (name = "events", description = "Trigger event intake and execution history"),
        (name = "audit", description = "Hash-chained audit trail"),
    )
)]
pub struct ApiDoc;

/// Build the OpenAPI router.
pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_json))
}

/// GET /openapi.json: Return the generated OpenAPI specification.
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
