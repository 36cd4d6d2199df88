//! # warden-api: Axum API Service
//!
//! HTTP surface of the Warden policy engine, built on Axum/Tower/Tokio.
//!
//! ## Routes
//!
//! - `/v1/policies/*`: policy management (create, replace, toggle, delete)
//! - `/v1/events`: trigger event intake; dispatches synchronously
//! - `/v1/events/:id/executions`: execution records for an event
//! - `/v1/audit/*`: audit trail listing and chain verification
//! - `/openapi.json`: generated OpenAPI document
//! - `/health/*`, `/metrics`: probes and Prometheus scrape, untraced
//!
//! ## Middleware Stack (Tower)
//!
//! TraceLayer → MetricsMiddleware → Handler
//!
//! ## Execution
//!
//! Deferred actions run on the [`worker`] task, which intake wakes whenever
//! a dispatch schedules new work. With `DATABASE_URL` set, policies,
//! execution records and audit entries are written through to Postgres and
//! reloaded on startup.

pub mod bootstrap;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod extractors;
pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod state;
pub mod worker;

pub use error::AppError;
pub use state::AppState;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::response::IntoResponse;
use axum::Router;
use tower_http::trace::TraceLayer;
use warden_engine::DeferredQueue;

/// Assemble the application router with all routes and middleware.
pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .merge(routes::policies::router())
        .merge(routes::events::router())
        .merge(routes::audit::router())
        .merge(openapi::router())
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(from_fn(middleware::metrics::metrics_middleware))
        .layer(axum::Extension(state.metrics.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let probes = Router::new()
        .route("/health/liveness", axum::routing::get(liveness))
        .route("/health/readiness", axum::routing::get(readiness))
        .route("/metrics", axum::routing::get(prometheus_metrics))
        .with_state(state);

    Router::new().merge(probes).merge(api)
}

/// Liveness probe: the process is up.
async fn liveness() -> &'static str {
    "ok"
}

/// Readiness probe: the policy store answers and, when configured, the
/// database is reachable.
async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    use warden_engine::PolicyStore;

    if let Err(e) = state.engine.policies.snapshot() {
        tracing::warn!("Policy store check failed: {e}");
        return (StatusCode::SERVICE_UNAVAILABLE, "policy store unavailable");
    }
    if let Some(pool) = &state.db_pool {
        if let Err(e) = sqlx::query("SELECT 1").execute(pool).await {
            tracing::warn!("Database health check failed: {e}");
            return (StatusCode::SERVICE_UNAVAILABLE, "database unreachable");
        }
    }
    (StatusCode::OK, "ready")
}

/// GET /metrics: Prometheus scrape endpoint.
///
/// Engine gauges are refreshed from state on each scrape.
async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let policies = state.engine.policies.list();
    let active = policies.iter().filter(|p| p.is_active).count();
    state.metrics.set_engine_gauges(
        active,
        policies.len() - active,
        state.engine.queue.len(),
        state.engine.ledger.pending().len(),
        state.engine.audit.len(),
    );

    match state.metrics.gather_and_encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
