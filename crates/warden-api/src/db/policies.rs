//! Policy persistence. The full policy is stored as JSON; `name`,
//! `is_active`, and `priority` are copied into columns for operators.

use sqlx::PgPool;
use warden_core::PolicyId;
use warden_engine::Policy;

use super::{decode_error, encode_error};

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: String,
    document: serde_json::Value,
}

/// Insert or replace a policy.
pub async fn upsert(pool: &PgPool, policy: &Policy) -> Result<(), sqlx::Error> {
    let document = serde_json::to_value(policy).map_err(encode_error)?;
    sqlx::query(
        "INSERT INTO policies (id, name, is_active, priority, document, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            is_active = EXCLUDED.is_active,
            priority = EXCLUDED.priority,
            document = EXCLUDED.document,
            updated_at = EXCLUDED.updated_at",
    )
    .bind(policy.id.as_str())
    .bind(&policy.name)
    .bind(policy.is_active)
    .bind(policy.priority)
    .bind(&document)
    .bind(policy.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a policy. Returns whether a row was removed.
pub async fn delete(pool: &PgPool, id: &PolicyId) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM policies WHERE id = $1")
        .bind(id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Load every stored policy.
pub async fn load_all(pool: &PgPool) -> Result<Vec<Policy>, sqlx::Error> {
    let rows = sqlx::query_as::<_, PolicyRow>(
        "SELECT id, document FROM policies ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row.document).map_err(|e| {
                tracing::error!(policy_id = %row.id, error = %e, "stored policy does not decode");
                decode_error("document", e)
            })
        })
        .collect()
}
