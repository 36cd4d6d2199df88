//! # Prometheus Metrics
//!
//! HTTP metrics are recorded by [`metrics_middleware`] on every request.
//! Engine counters (events dispatched, actions completed) are pushed by the
//! event handler and the worker. Gauges over engine state are refreshed on
//! each `/metrics` scrape.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use warden_engine::{DispatchState, ExecutionRecord};

/// Shared metrics state backed by a Prometheus registry.
#[derive(Clone)]
pub struct ApiMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,

    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    http_errors_total: IntCounterVec,

    events_dispatched_total: IntCounterVec,
    actions_completed_total: IntCounterVec,
    action_retries_total: IntCounterVec,

    policies: IntGaugeVec,
    queue_depth: IntGauge,
    executions_pending: IntGauge,
    audit_entries: IntGauge,
}

impl std::fmt::Debug for ApiMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiMetrics")
            .field("requests", &self.requests())
            .field("errors", &self.errors())
            .finish()
    }
}

impl ApiMetrics {
    /// Create the metric families and register them in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("warden_http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "warden_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["method", "path"],
        )?;
        let http_errors_total = IntCounterVec::new(
            Opts::new("warden_http_errors_total", "Total HTTP errors (4xx and 5xx)"),
            &["method", "path", "status"],
        )?;
        let events_dispatched_total = IntCounterVec::new(
            Opts::new(
                "warden_events_dispatched_total",
                "Trigger events dispatched, by final state",
            ),
            &["state"],
        )?;
        let actions_completed_total = IntCounterVec::new(
            Opts::new(
                "warden_actions_completed_total",
                "Actions that reached a terminal status",
            ),
            &["action_type", "status"],
        )?;
        let action_retries_total = IntCounterVec::new(
            Opts::new(
                "warden_action_retries_total",
                "Failed action attempts that were re-queued",
            ),
            &["action_type"],
        )?;
        let policies = IntGaugeVec::new(
            Opts::new("warden_policies", "Configured policies"),
            &["active"],
        )?;
        let queue_depth = IntGauge::new("warden_queue_depth", "Jobs waiting in the timer queue")?;
        let executions_pending =
            IntGauge::new("warden_executions_pending", "Execution records still pending")?;
        let audit_entries =
            IntGauge::new("warden_audit_entries", "Audit entries held in memory")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_errors_total.clone()))?;
        registry.register(Box::new(events_dispatched_total.clone()))?;
        registry.register(Box::new(actions_completed_total.clone()))?;
        registry.register(Box::new(action_retries_total.clone()))?;
        registry.register(Box::new(policies.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(executions_pending.clone()))?;
        registry.register(Box::new(audit_entries.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                http_requests_total,
                http_request_duration_seconds,
                http_errors_total,
                events_dispatched_total,
                actions_completed_total,
                action_retries_total,
                policies,
                queue_depth,
                executions_pending,
                audit_entries,
            }),
        })
    }

    /// Total request count across all labels.
    pub fn requests(&self) -> u64 {
        sum_counter(&self.inner.http_requests_total)
    }

    /// Total 4xx/5xx count across all labels.
    pub fn errors(&self) -> u64 {
        sum_counter(&self.inner.http_errors_total)
    }

    /// Total dispatched events across all states.
    pub fn events_dispatched(&self) -> u64 {
        sum_counter(&self.inner.events_dispatched_total)
    }

    fn record_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.inner
            .http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.inner
            .http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
        if status >= 400 {
            self.inner
                .http_errors_total
                .with_label_values(&[method, path, &status_str])
                .inc();
        }
    }

    /// Count a dispatched event.
    pub fn record_dispatch(&self, state: DispatchState) {
        self.inner
            .events_dispatched_total
            .with_label_values(&[state.as_str()])
            .inc();
    }

    /// Count records changed by a worker run.
    pub fn record_executions(&self, records: &[ExecutionRecord]) {
        for record in records {
            let action_type = record.action_type.as_str();
            if record.status.is_terminal() {
                self.inner
                    .actions_completed_total
                    .with_label_values(&[action_type, record.status.as_str()])
                    .inc();
            } else {
                self.inner
                    .action_retries_total
                    .with_label_values(&[action_type])
                    .inc();
            }
        }
    }

    /// Set the engine-state gauges.
    pub fn set_engine_gauges(
        &self,
        active_policies: usize,
        inactive_policies: usize,
        queue_depth: usize,
        executions_pending: usize,
        audit_entries: usize,
    ) {
        self.inner
            .policies
            .with_label_values(&["true"])
            .set(active_policies as i64);
        self.inner
            .policies
            .with_label_values(&["false"])
            .set(inactive_policies as i64);
        self.inner.queue_depth.set(queue_depth as i64);
        self.inner.executions_pending.set(executions_pending as i64);
        self.inner.audit_entries.set(audit_entries as i64);
    }

    /// Gather all metrics in Prometheus text exposition format.
    pub fn gather_and_encode(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| format!("failed to encode metrics: {e}"))?;
        String::from_utf8(buffer).map_err(|e| format!("metrics are not UTF-8: {e}"))
    }
}

fn sum_counter(counter: &IntCounterVec) -> u64 {
    counter
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|m| m.get_counter().get_value() as u64)
        .sum()
}

/// Records request count, latency, and errors, labelled by route template
/// so path parameters do not multiply series.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let metrics = request.extensions().get::<ApiMetrics>().cloned();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    if let Some(m) = metrics {
        m.record_request(
            &method,
            &path,
            response.status().as_u16(),
            start.elapsed().as_secs_f64(),
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_core::{EventId, PolicyId};
    use warden_engine::{ActionType, ExecutionStatus};

    fn record(status: ExecutionStatus) -> ExecutionRecord {
        ExecutionRecord {
            policy_id: PolicyId::new("p1").unwrap(),
            event_id: EventId::new(),
            action_order: 1,
            action_type: ActionType::EmailAlert,
            status,
            scheduled_at: Utc::now(),
            executed_at: None,
            error: None,
            attempts: 1,
        }
    }

    #[test]
    fn starts_at_zero() {
        let m = ApiMetrics::new().unwrap();
        assert_eq!(m.requests(), 0);
        assert_eq!(m.errors(), 0);
        assert_eq!(m.events_dispatched(), 0);
    }

    #[test]
    fn counts_requests_and_errors() {
        let m = ApiMetrics::new().unwrap();
        m.record_request("GET", "/v1/policies", 200, 0.01);
        m.record_request("GET", "/v1/policies/:id", 404, 0.01);
        m.record_request("POST", "/v1/events", 503, 0.02);
        assert_eq!(m.requests(), 3);
        assert_eq!(m.errors(), 2);
    }

    #[test]
    fn engine_counters_are_exposed() {
        let m = ApiMetrics::new().unwrap();
        m.record_dispatch(DispatchState::Completed);
        m.record_dispatch(DispatchState::Rejected);
        m.record_executions(&[
            record(ExecutionStatus::Executed),
            record(ExecutionStatus::Failed),
            record(ExecutionStatus::Pending),
        ]);
        m.set_engine_gauges(2, 1, 4, 4, 17);
        assert_eq!(m.events_dispatched(), 2);

        let text = m.gather_and_encode().unwrap();
        assert!(text.contains("warden_events_dispatched_total{state=\"completed\"} 1"));
        assert!(text.contains(
            "warden_actions_completed_total{action_type=\"email_alert\",status=\"executed\"} 1"
        ));
        assert!(text.contains("warden_action_retries_total{action_type=\"email_alert\"} 1"));
        assert!(text.contains("warden_queue_depth 4"));
        assert!(text.contains("warden_audit_entries 17"));
    }
}
