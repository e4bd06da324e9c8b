//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters and gauges the orchestration services update.

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    events_emitted_total: IntCounterVec,
    tasks_submitted_total: IntCounterVec,
    task_failures_total: IntCounterVec,
    uploads_total: IntCounterVec,
    active_tasks: IntGauge,
    config_reload_failures_total: IntCounter,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Tasks currently reporting progress.
    pub active_tasks: i64,
    /// Total configuration reload failures observed.
    pub config_reload_failures_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_emitted_total = IntCounterVec::new(
            Opts::new("events_emitted_total", "Domain events emitted by type"),
            &["type"],
        )?;
        let tasks_submitted_total = IntCounterVec::new(
            Opts::new("tasks_submitted_total", "Tasks accepted by a backend"),
            &["backend"],
        )?;
        let task_failures_total = IntCounterVec::new(
            Opts::new("task_failures_total", "Task failures by phase"),
            &["phase"],
        )?;
        let uploads_total = IntCounterVec::new(
            Opts::new("uploads_total", "Finished upload jobs by outcome"),
            &["status"],
        )?;
        let active_tasks =
            IntGauge::with_opts(Opts::new("active_tasks", "Tasks currently transferring"))?;
        let config_reload_failures_total = IntCounter::with_opts(Opts::new(
            "config_reload_failures_total",
            "Settings reloads that failed validation",
        ))?;

        registry.register(Box::new(events_emitted_total.clone()))?;
        registry.register(Box::new(tasks_submitted_total.clone()))?;
        registry.register(Box::new(task_failures_total.clone()))?;
        registry.register(Box::new(uploads_total.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;
        registry.register(Box::new(config_reload_failures_total.clone()))?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                events_emitted_total,
                tasks_submitted_total,
                task_failures_total,
                uploads_total,
                active_tasks,
                config_reload_failures_total,
            }),
        })
    }

    /// Increment the emitted event counter for the specific event type.
    pub fn inc_event(&self, event_type: &str) {
        self.inner
            .events_emitted_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Count a task accepted by `backend`.
    pub fn inc_submitted(&self, backend: &str) {
        self.inner
            .tasks_submitted_total
            .with_label_values(&[backend])
            .inc();
    }

    /// Count a failure in `phase` (`submit`, `download`, `upload`).
    pub fn inc_failure(&self, phase: &str) {
        self.inner
            .task_failures_total
            .with_label_values(&[phase])
            .inc();
    }

    /// Count a finished upload by outcome.
    pub fn inc_upload(&self, status: &str) {
        self.inner.uploads_total.with_label_values(&[status]).inc();
    }

    /// Set the active task gauge.
    pub fn set_active_tasks(&self, count: i64) {
        self.inner.active_tasks.set(count);
    }

    /// Count a failed settings reload.
    pub fn inc_config_reload_failure(&self) {
        self.inner.config_reload_failures_total.inc();
    }

    /// Capture a snapshot of selected gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_tasks: self.inner.active_tasks.get(),
            config_reload_failures_total: self.inner.config_reload_failures_total.get(),
        }
    }

    /// Render all metrics in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or produces invalid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.inner.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics output was not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_rendered_output() -> Result<()> {
        let metrics = Metrics::new()?;
        metrics.inc_event("task_created");
        metrics.inc_submitted("remote");
        metrics.inc_failure("upload");
        metrics.inc_upload("success");
        metrics.set_active_tasks(3);

        let rendered = metrics.render()?;
        assert!(rendered.contains("events_emitted_total{type=\"task_created\"} 1"));
        assert!(rendered.contains("tasks_submitted_total{backend=\"remote\"} 1"));
        assert!(rendered.contains("task_failures_total{phase=\"upload\"} 1"));
        assert!(rendered.contains("active_tasks 3"));
        Ok(())
    }

    #[test]
    fn snapshot_serialises() -> Result<()> {
        let metrics = Metrics::new()?;
        metrics.inc_config_reload_failure();
        let snapshot = metrics.snapshot();
        let value = serde_json::to_value(&snapshot)?;
        assert_eq!(value["config_reload_failures_total"], 1);
        Ok(())
    }
}
