//! # Deferred-Execution Worker
//!
//! A single background task drains due jobs from the engine's queue. It
//! wakes on a fixed tick and whenever event intake schedules new work, so
//! immediate actions run without waiting for the next tick. Execution runs
//! on the blocking pool since collaborators may block.

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use warden_engine::ExecutionRecord;

use crate::state::AppState;

/// Spawn the worker loop. It runs until the runtime shuts down.
pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(run(state))
}

async fn run(state: AppState) {
    let mut tick = tokio::time::interval(state.config.worker_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(tick_ms = state.config.worker_tick.as_millis() as u64, "execution worker started");
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = state.work.notified() => {}
        }
        run_once(&state, Utc::now()).await;
    }
}

/// Execute every job due at `now` and persist what changed.
pub async fn run_once(state: &AppState, now: DateTime<Utc>) -> Vec<ExecutionRecord> {
    let engine = state.engine.clone();
    let changed = match tokio::task::spawn_blocking(move || engine.dispatcher.run_due(now)).await {
        Ok(changed) => changed,
        Err(e) => {
            tracing::error!(error = %e, "execution run panicked");
            return Vec::new();
        }
    };
    if changed.is_empty() {
        return changed;
    }

    tracing::debug!(records = changed.len(), "execution run finished");
    state.metrics.record_executions(&changed);
    state.persist_executions(&changed).await;
    changed
}
