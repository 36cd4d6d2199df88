//! Audit entry persistence.
//!
//! Entries are sealed and chained by the engine's audit trail before they
//! get here; this module stores them as-is and can re-check the chain link
//! by link over what is stored.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;
use warden_engine::AuditEntry;

use super::{decode_error, encode_error};

#[derive(sqlx::FromRow)]
struct AuditRow {
    entry: serde_json::Value,
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    sequence: i64,
    previous_digest: String,
    digest: String,
}

/// Store entries. Entries already stored (same sequence) are skipped.
pub async fn append(pool: &PgPool, entries: &[AuditEntry]) -> Result<(), sqlx::Error> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for entry in entries {
        let document = serde_json::to_value(entry).map_err(encode_error)?;
        let sequence = i64::try_from(entry.sequence).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let recorded_at: DateTime<Utc> = entry.timestamp;
        let event_id: Option<Uuid> = entry.event_id.map(|id| *id.as_uuid());
        sqlx::query(
            "INSERT INTO audit_entries (sequence, entry_type, level, recorded_at, policy_id,
                event_id, entry, previous_digest, digest)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (sequence) DO NOTHING",
        )
        .bind(sequence)
        .bind(entry.entry_type.as_str())
        .bind(entry.level.as_str())
        .bind(recorded_at)
        .bind(entry.policy_id.as_ref().map(|p| p.as_str()))
        .bind(event_id)
        .bind(&document)
        .bind(&entry.previous_digest)
        .bind(&entry.digest)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// The latest `limit` entries, oldest first.
pub async fn load_latest(pool: &PgPool, limit: i64) -> Result<Vec<AuditEntry>, sqlx::Error> {
    let rows = sqlx::query_as::<_, AuditRow>(
        "SELECT entry FROM (
            SELECT sequence, entry FROM audit_entries ORDER BY sequence DESC LIMIT $1
         ) latest ORDER BY sequence ASC",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| serde_json::from_value(row.entry).map_err(|e| decode_error("entry", e)))
        .collect()
}

/// Result of checking the stored chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainIntegrityResult {
    pub total_entries: usize,
    pub broken_links: usize,
    pub chain_valid: bool,
}

/// Check that each stored entry links to the digest of the one before it.
pub async fn verify_chain_integrity(
    pool: &PgPool,
    limit: i64,
) -> Result<ChainIntegrityResult, sqlx::Error> {
    let links = sqlx::query_as::<_, LinkRow>(
        "SELECT sequence, previous_digest, digest FROM audit_entries
         ORDER BY sequence ASC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut broken_links = 0;
    for pair in links.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.sequence == prev.sequence + 1 && next.previous_digest != prev.digest {
            tracing::warn!(sequence = next.sequence, "stored audit chain link broken");
            broken_links += 1;
        }
    }

    Ok(ChainIntegrityResult {
        total_entries: links.len(),
        broken_links,
        chain_valid: broken_links == 0,
    })
}
