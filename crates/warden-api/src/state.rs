//! # Application State
//!
//! [`AppState`] is cloned into every handler. It owns the in-memory engine,
//! the optional Postgres pool, metrics, and the signal the event handler
//! uses to wake the deferred-execution worker.
//!
//! ## Write-through
//!
//! Policy writes that fail to persist are surfaced to the client, since the
//! change would otherwise vanish on restart. Execution records and audit
//! entries are persisted best-effort after each dispatch and worker run;
//! failures are logged and retried on the next flush (audit) or the next
//! state change (records).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{Mutex, Notify};
use warden_core::PolicyId;
use warden_engine::memory::InMemoryPolicyStore;
use warden_engine::{
    Action, Completion, DispatchReport, ExecutionKey, ExecutionLedger, ExecutionRecord,
    ExecutionStatus, InMemoryEngine, MailTransport, Policy, ScheduledJob, TriggerEvent,
};

use crate::collaborators::LogMailTransport;
use crate::config::AppConfig;
use crate::db;
use crate::error::AppError;
use crate::middleware::metrics::ApiMetrics;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<InMemoryEngine>,
    pub db_pool: Option<PgPool>,
    pub metrics: ApiMetrics,
    /// Wakes the worker when intake schedules new work.
    pub work: Arc<Notify>,
    /// Highest audit sequence already persisted.
    audit_cursor: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .field("db_pool", &self.db_pool.is_some())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// State that delivers alert mail through [`LogMailTransport`].
    pub fn new(config: AppConfig, db_pool: Option<PgPool>) -> Result<Self, prometheus::Error> {
        Self::with_mail(config, db_pool, Arc::new(LogMailTransport::new()))
    }

    /// State with a caller-supplied mail transport.
    pub fn with_mail(
        config: AppConfig,
        db_pool: Option<PgPool>,
        mail: Arc<dyn MailTransport>,
    ) -> Result<Self, prometheus::Error> {
        let engine = InMemoryEngine::with_mail(config.engine.clone(), mail);
        Ok(Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
            db_pool,
            metrics: ApiMetrics::new()?,
            work: Arc::new(Notify::new()),
            audit_cursor: Arc::new(Mutex::new(0)),
        })
    }

    /// The policy store.
    pub fn policies(&self) -> &InMemoryPolicyStore {
        &self.engine.policies
    }

    // -- Write-through -------------------------------------------------------

    /// Persist a created or changed policy.
    pub async fn persist_policy(&self, policy: &Policy) -> Result<(), AppError> {
        if let Some(pool) = &self.db_pool {
            db::policies::upsert(pool, policy).await.map_err(|e| {
                tracing::error!(policy_id = %policy.id, error = %e, "failed to persist policy");
                AppError::from(e)
            })?;
        }
        Ok(())
    }

    /// Remove a deleted policy from storage.
    pub async fn forget_policy(&self, id: &PolicyId) -> Result<(), AppError> {
        if let Some(pool) = &self.db_pool {
            db::policies::delete(pool, id).await.map_err(|e| {
                tracing::error!(policy_id = %id, error = %e, "failed to delete stored policy");
                AppError::from(e)
            })?;
        }
        Ok(())
    }

    /// Persist the records a dispatch created, with their resume snapshot.
    pub async fn persist_dispatch(&self, report: &DispatchReport, event: &TriggerEvent) {
        let Some(pool) = &self.db_pool else {
            return;
        };
        for (record, action) in self.dispatch_snapshots(report) {
            if let Err(e) = db::executions::upsert(pool, &record, Some(event), Some(&action)).await {
                tracing::warn!(key = %record.key(), error = %e, "failed to persist execution record");
            }
        }
        // Scheduling failures complete records outside the report.
        for record in self.engine.dispatcher.executions_for_event(event.event_id) {
            if record.status == ExecutionStatus::Failed {
                if let Err(e) = db::executions::upsert(pool, &record, None, None).await {
                    tracing::warn!(key = %record.key(), error = %e, "failed to persist execution record");
                }
            }
        }
        self.flush_audit().await;
    }

    /// Records created by `report` as the ledger holds them now, each with
    /// the action it was scheduled from. The worker may already have run
    /// some of them, so the report's own copies can be stale.
    pub fn dispatch_snapshots(&self, report: &DispatchReport) -> Vec<(ExecutionRecord, Action)> {
        report
            .scheduled_actions()
            .map(|(record, action)| {
                let current = self
                    .engine
                    .ledger
                    .get(&record.key())
                    .unwrap_or_else(|| record.clone());
                (current, action.clone())
            })
            .collect()
    }

    /// Persist records changed by a worker run.
    pub async fn persist_executions(&self, records: &[ExecutionRecord]) {
        let Some(pool) = &self.db_pool else {
            return;
        };
        for record in records {
            if let Err(e) = db::executions::upsert(pool, record, None, None).await {
                tracing::warn!(key = %record.key(), error = %e, "failed to persist execution record");
            }
        }
        self.flush_audit().await;
    }

    /// Persist audit entries appended since the last flush.
    pub async fn flush_audit(&self) {
        let Some(pool) = &self.db_pool else {
            return;
        };
        let mut cursor = self.audit_cursor.lock().await;
        let pending = self.engine.audit.entries_after(*cursor);
        let Some(last) = pending.last().map(|e| e.sequence) else {
            return;
        };
        match db::audit::append(pool, &pending).await {
            Ok(()) => *cursor = last,
            Err(e) => tracing::warn!(entries = pending.len(), error = %e, "failed to persist audit entries"),
        }
    }

    // -- Hydration -----------------------------------------------------------

    /// Load persisted state into the engine. No-op without a database.
    ///
    /// Pending records are re-queued from their stored snapshot; a pending
    /// record without one cannot run and is failed.
    pub async fn hydrate_from_db(&self, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        let Some(pool) = &self.db_pool else {
            return Ok(());
        };

        let policies = db::policies::load_all(pool).await?;
        let policy_count = policies.len();
        for policy in policies {
            self.policies().upsert(policy);
        }

        let stored = db::executions::load_all(pool).await?;
        let record_count = stored.len();
        self.engine
            .ledger
            .restore(stored.iter().map(|s| s.record.clone()));
        let mut resumed = 0usize;
        for execution in stored {
            if execution.record.status != ExecutionStatus::Pending {
                continue;
            }
            let key = execution.record.key();
            match (execution.event, execution.action) {
                (Some(event), Some(action)) => {
                    let job = ScheduledJob {
                        key: key.clone(),
                        action,
                        event: Arc::new(event),
                        scheduled_at: execution.record.scheduled_at,
                        retries: execution.record.attempts,
                    };
                    match self.engine.dispatcher.resume(job) {
                        Ok(()) => resumed += 1,
                        Err(e) => {
                            tracing::error!(%key, error = %e, "could not re-queue pending record");
                            self.abandon(&key, &e.to_string(), now).await;
                        }
                    }
                }
                _ => {
                    tracing::warn!(%key, "pending record has no snapshot");
                    self.abandon(&key, "snapshot_missing", now).await;
                }
            }
        }

        let capacity = i64::try_from(self.config.engine.audit_capacity).unwrap_or(i64::MAX);
        let entries = db::audit::load_latest(pool, capacity).await?;
        let entry_count = entries.len();
        self.engine.audit.restore(entries);
        *self.audit_cursor.lock().await = self.engine.audit.last_sequence();

        tracing::info!(
            policies = policy_count,
            records = record_count,
            resumed,
            audit_entries = entry_count,
            "hydrated from database"
        );
        Ok(())
    }

    async fn abandon(&self, key: &ExecutionKey, reason: &str, now: DateTime<Utc>) {
        match self
            .engine
            .ledger
            .complete(key, Completion::Abandoned(reason.to_string()), now)
        {
            Ok(record) => self.persist_executions(std::slice::from_ref(&record)).await,
            Err(e) => tracing::warn!(%key, error = %e, "could not fail pending record"),
        }
    }
}
