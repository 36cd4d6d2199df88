//! # Audit Trail API
//!
//! Read-only view of the hash-chained audit trail held in memory, plus a
//! verification endpoint that recomputes the chain and, when Postgres is
//! configured, checks the stored links as well.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use warden_core::EventId;
use warden_engine::{AuditEntry, AuditEntryType};

use crate::db;
use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// Filters for the audit listing.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct AuditQuery {
    /// Most recent entries to return (1-1000, default 100).
    pub limit: Option<usize>,
    /// Only entries for this event.
    pub event_id: Option<String>,
    /// Only entries of this type, e.g. `action_failed`.
    pub entry_type: Option<String>,
}

/// Audit entries, oldest first.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditListing {
    #[schema(value_type = Vec<Object>)]
    pub entries: Vec<AuditEntry>,
    /// Entries held in memory.
    pub retained: usize,
    /// Sequence of the newest entry, 0 when empty.
    pub last_sequence: u64,
}

/// Stored chain check.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StoredChainCheck {
    pub total_entries: usize,
    pub broken_links: usize,
    pub chain_valid: bool,
}

/// Chain verification result.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present when a database is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored: Option<StoredChainCheck>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the audit router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/audit", get(list_audit))
        .route("/v1/audit/verify", get(verify_audit))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /v1/audit: Recent audit entries.
#[utoipa::path(
    get,
    path = "/v1/audit",
    params(AuditQuery),
    responses(
        (status = 200, description = "Audit entries, oldest first", body = AuditListing),
        (status = 422, description = "Invalid filter", body = crate::error::ErrorBody),
    ),
    tag = "audit"
)]
async fn list_audit(
    State(state): State<AppState>,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> Result<Json<AuditListing>, AppError> {
    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    let entry_type = query
        .entry_type
        .as_deref()
        .map(|raw| {
            AuditEntryType::parse(raw)
                .ok_or_else(|| AppError::Validation(format!("unknown entry_type '{raw}'")))
        })
        .transpose()?;

    let audit = &state.engine.audit;
    let mut entries = match query.event_id.as_deref() {
        Some(raw) => audit.entries_for_event(EventId::parse(raw)?),
        None => audit.last_n(audit.len()),
    };
    if let Some(entry_type) = entry_type {
        entries.retain(|e| e.entry_type == entry_type);
    }
    let skip = entries.len().saturating_sub(limit);
    entries.drain(..skip);

    Ok(Json(AuditListing {
        entries,
        retained: audit.len(),
        last_sequence: audit.last_sequence(),
    }))
}

/// GET /v1/audit/verify: Recompute the audit chain.
#[utoipa::path(
    get,
    path = "/v1/audit/verify",
    responses(
        (status = 200, description = "Verification result", body = ChainVerification),
    ),
    tag = "audit"
)]
async fn verify_audit(State(state): State<AppState>) -> Result<Json<ChainVerification>, AppError> {
    let audit = &state.engine.audit;
    let in_memory = audit.verify_chain();
    if let Err(e) = &in_memory {
        tracing::error!(error = %e, "audit chain verification failed");
    }

    let stored = match &state.db_pool {
        Some(pool) => {
            let limit = i64::try_from(state.config.engine.audit_capacity).unwrap_or(i64::MAX);
            let result = db::audit::verify_chain_integrity(pool, limit).await?;
            Some(StoredChainCheck {
                total_entries: result.total_entries,
                broken_links: result.broken_links,
                chain_valid: result.chain_valid,
            })
        }
        None => None,
    };

    let stored_valid = stored.as_ref().map_or(true, |s| s.chain_valid);
    Ok(Json(ChainVerification {
        valid: in_memory.is_ok() && stored_valid,
        entries: audit.len(),
        error: in_memory.err().map(|e| e.to_string()),
        stored,
    }))
}
