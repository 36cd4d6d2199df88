//! Execution record persistence.
//!
//! Pending records carry the event and action snapshot they were scheduled
//! from, so the worker can resume them after a restart.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;
use warden_core::{EventId, PolicyId};
use warden_engine::{Action, ActionType, ExecutionRecord, ExecutionStatus, TriggerEvent};

use super::{decode_error, encode_error};

/// A stored record and, when still held, its scheduling snapshot.
#[derive(Debug, Clone)]
pub struct StoredExecution {
    pub record: ExecutionRecord,
    pub event: Option<TriggerEvent>,
    pub action: Option<Action>,
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    policy_id: String,
    event_id: Uuid,
    action_order: i32,
    action_type: String,
    status: String,
    scheduled_at: DateTime<Utc>,
    executed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    attempts: i32,
    event: Option<serde_json::Value>,
    action: Option<serde_json::Value>,
}

impl TryFrom<ExecutionRow> for StoredExecution {
    type Error = sqlx::Error;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let record = ExecutionRecord {
            policy_id: PolicyId::new(row.policy_id).map_err(|e| decode_error("policy_id", e))?,
            event_id: EventId::from_uuid(row.event_id),
            action_order: u32::try_from(row.action_order)
                .map_err(|e| decode_error("action_order", e))?,
            action_type: ActionType::parse(&row.action_type)
                .ok_or_else(|| decode_error("action_type", &row.action_type))?,
            status: ExecutionStatus::parse(&row.status)
                .ok_or_else(|| decode_error("status", &row.status))?,
            scheduled_at: row.scheduled_at,
            executed_at: row.executed_at,
            error: row.error,
            attempts: u32::try_from(row.attempts).map_err(|e| decode_error("attempts", e))?,
        };
        let event = row
            .event
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| decode_error("event", e))?;
        let action = row
            .action
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| decode_error("action", e))?;
        Ok(Self {
            record,
            event,
            action,
        })
    }
}

/// Insert a record or update its mutable fields. A snapshot, once stored,
/// is kept when later writes pass `None`. A row that is already `executed`
/// or `failed` is never overwritten, so a late write of a stale pending
/// copy cannot make a finished action runnable again.
pub async fn upsert(
    pool: &PgPool,
    record: &ExecutionRecord,
    event: Option<&TriggerEvent>,
    action: Option<&Action>,
) -> Result<(), sqlx::Error> {
    let event = event
        .map(serde_json::to_value)
        .transpose()
        .map_err(encode_error)?;
    let action = action
        .map(serde_json::to_value)
        .transpose()
        .map_err(encode_error)?;
    sqlx::query(
        "INSERT INTO execution_records (policy_id, event_id, action_order, action_type, status,
            scheduled_at, executed_at, error, attempts, event, action)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         ON CONFLICT (policy_id, event_id, action_order) DO UPDATE SET
            status = EXCLUDED.status,
            scheduled_at = EXCLUDED.scheduled_at,
            executed_at = EXCLUDED.executed_at,
            error = EXCLUDED.error,
            attempts = EXCLUDED.attempts,
            event = COALESCE(EXCLUDED.event, execution_records.event),
            action = COALESCE(EXCLUDED.action, execution_records.action)
         WHERE execution_records.status = 'pending'",
    )
    .bind(record.policy_id.as_str())
    .bind(*record.event_id.as_uuid())
    .bind(record.action_order as i32)
    .bind(record.action_type.as_str())
    .bind(record.status.as_str())
    .bind(record.scheduled_at)
    .bind(record.executed_at)
    .bind(&record.error)
    .bind(record.attempts as i32)
    .bind(&event)
    .bind(&action)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load every stored record.
pub async fn load_all(pool: &PgPool) -> Result<Vec<StoredExecution>, sqlx::Error> {
    sqlx::query_as::<_, ExecutionRow>(
        "SELECT policy_id, event_id, action_order, action_type, status, scheduled_at,
                executed_at, error, attempts, event, action
         FROM execution_records
         ORDER BY policy_id, event_id, action_order",
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(StoredExecution::try_from)
    .collect()
}
