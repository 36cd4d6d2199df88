//! # Database Persistence Layer
//!
//! Optional Postgres persistence via SQLx. When `DATABASE_URL` is set,
//! policies, execution records, and audit entries are written through
//! after each mutation and loaded back into the engine at startup. When
//! absent, the service runs in-memory only.

pub mod audit;
pub mod executions;
pub mod policies;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Connect and run embedded migrations.
///
/// Returns `None` when no URL is configured.
pub async fn init_pool(database_url: Option<&str>) -> Result<Option<PgPool>, sqlx::Error> {
    let Some(url) = database_url else {
        tracing::warn!("DATABASE_URL not set, running in-memory only; state will not survive restarts");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(url)
        .await?;
    tracing::info!("connected to PostgreSQL");

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("database migrations applied");

    Ok(Some(pool))
}

/// Encode failure for values that should always serialize.
pub(crate) fn encode_error(e: serde_json::Error) -> sqlx::Error {
    sqlx::Error::Encode(Box::new(e))
}

/// Decode failure for a stored column.
pub(crate) fn decode_error(column: &str, e: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            e.to_string(),
        )),
    }
}
