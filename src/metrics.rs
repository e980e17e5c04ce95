use crate::{PipelineError, Result, Stage};
use ::metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

pub struct Metrics {
    pub images_fetched: Counter,
    pub fetch_failures: Counter,
    pub transforms_applied: Counter,
    pub transform_failures: Counter,
    pub artifacts_stored: Counter,
    pub store_failures: Counter,
    pub runs_completed: Counter,
    pub runs_aborted: Counter,
    pub stage_duration: Histogram,
    pub worker_pool_size: Gauge,
}

impl Metrics {
    /// Handles bound to whichever recorder is installed; no-ops when none is.
    pub fn new() -> Self {
        Self {
            images_fetched: register_counter!("images_fetched"),
            fetch_failures: register_counter!("fetch_failures"),
            transforms_applied: register_counter!("transforms_applied"),
            transform_failures: register_counter!("transform_failures"),
            artifacts_stored: register_counter!("artifacts_stored"),
            store_failures: register_counter!("store_failures"),
            runs_completed: register_counter!("runs_completed"),
            runs_aborted: register_counter!("runs_aborted"),
            stage_duration: register_histogram!("stage_duration_seconds"),
            worker_pool_size: register_gauge!("worker_pool_size"),
        }
    }

    pub fn noop() -> Self {
        Self {
            images_fetched: Counter::noop(),
            fetch_failures: Counter::noop(),
            transforms_applied: Counter::noop(),
            transform_failures: Counter::noop(),
            artifacts_stored: Counter::noop(),
            store_failures: Counter::noop(),
            runs_completed: Counter::noop(),
            runs_aborted: Counter::noop(),
            stage_duration: Histogram::noop(),
            worker_pool_size: Gauge::noop(),
        }
    }

    pub fn record_stage(&self, stage: Stage, duration: Duration, succeeded: usize, failed: usize) {
        let (ok, err) = match stage {
            Stage::Fetch => (&self.images_fetched, &self.fetch_failures),
            Stage::Transform => (&self.transforms_applied, &self.transform_failures),
            Stage::Store => (&self.artifacts_stored, &self.store_failures),
        };
        ok.increment(succeeded as u64);
        err.increment(failed as u64);
        self.stage_duration.record(duration.as_secs_f64());
    }

    pub fn record_run(&self, completed: bool) {
        if completed {
            self.runs_completed.increment(1);
        } else {
            self.runs_aborted.increment(1);
        }
    }

    pub fn set_pool_size(&self, size: usize) {
        self.worker_pool_size.set(size as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs a Prometheus recorder so metrics can be rendered at exit.
pub struct PrometheusExporter {
    handle: PrometheusHandle,
}

impl PrometheusExporter {
    /// Must run before [`Metrics::new`] so the handles bind to this recorder.
    pub fn install() -> Result<Self> {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        ::metrics::set_boxed_recorder(Box::new(recorder))
            .map_err(|e| PipelineError::Configuration(format!("metrics recorder: {e}")))?;

        info!("Prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}
