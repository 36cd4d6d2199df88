//! # Startup Policy Seeding
//!
//! When `WARDEN_POLICY_FILE` is set, the policies in that YAML file are
//! validated and inserted at startup. Policies already present (hydrated
//! from the database or created earlier) are left untouched, so edits made
//! through the API survive a restart.

use std::path::Path;

use thiserror::Error;
use warden_engine::{PolicyFile, PolicyFileError};

use crate::db;
use crate::state::AppState;

/// Errors during bootstrap.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The policy file could not be loaded or failed validation.
    #[error("policy file: {0}")]
    PolicyFile(#[from] PolicyFileError),

    /// A seeded policy could not be persisted.
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

/// Seed policies from the configured file. Returns how many were inserted.
pub async fn seed_policies(state: &AppState) -> Result<usize, BootstrapError> {
    let Some(path) = state.config.policy_file.clone() else {
        return Ok(0);
    };
    seed_from_path(state, &path).await
}

/// Seed policies from `path`.
pub async fn seed_from_path(state: &AppState, path: &Path) -> Result<usize, BootstrapError> {
    let policies = PolicyFile::read(path)?.into_validated()?;
    let total = policies.len();
    let mut inserted = 0usize;
    for policy in policies {
        let id = policy.id.clone();
        let snapshot = policy.clone();
        if !state.policies().create(policy) {
            tracing::debug!(policy_id = %id, "policy already present, not seeding");
            continue;
        }
        if let Some(pool) = &state.db_pool {
            db::policies::upsert(pool, &snapshot).await?;
        }
        inserted += 1;
    }
    tracing::info!(path = %path.display(), total, inserted, "seeded policies from file");
    Ok(inserted)
}
