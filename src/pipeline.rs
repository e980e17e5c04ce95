//! Pipeline orchestrator driving fetch, transform and store stages
//!
//! A run is three sequential stages, each fanned out over the shared
//! [`WorkerPool`]:
//!
//! 1. **Fetch** one unit per source location.
//! 2. **Transform** one unit per (image, transform) pair. The cross product is
//!    flattened before submission, so no unit ever waits on a permit held by
//!    its parent.
//! 3. **Store** one unit per produced variant (plus raw images when
//!    `persist_raw` is set).
//!
//! Under [`FailurePolicy::Isolate`] every unit yields its own outcome and the
//! report lists failures alongside artifacts. Under
//! [`FailurePolicy::FailFast`] the first failing stage aborts the run and
//! nothing from that run is left in the store.
//!
//! # Examples
//!
//! ```rust,no_run
//! use image_pipeline::{
//!     FileStore, HttpFetcher, Pipeline, PipelineConfig, RunTimer, SourceLocation, WorkerPool,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let pipeline = Pipeline::new(
//!         config.clone(),
//!         config.registry()?,
//!         Arc::new(HttpFetcher::new(config.request_timeout, None)?),
//!         Arc::new(FileStore::new()),
//!         WorkerPool::new(config.pool_size())?,
//!     );
//!
//!     let sources = vec![SourceLocation::parse("https://example.com/cat.png")?];
//!     let timer = RunTimer::new();
//!     let report = pipeline.run_timed("default", &sources, &timer).await?;
//!     println!("{}", report.summary());
//!     print!("{}", timer.report());
//!     Ok(())
//! }
//! ```

use crate::{
    format_bytes, FailurePolicy, Fetcher, Image, Metrics, PipelineConfig, PipelineError, Result,
    RunTimer, SourceLocation, Stage, Store, StoredArtifact, TransformKind, TransformRegistry,
    WorkerPool,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One unit of work that did not produce its output.
#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub stage: Stage,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformKind>,
    pub error: String,
    #[serde(skip)]
    pub cause: Option<PipelineError>,
}

impl UnitFailure {
    fn new(stage: Stage, origin: &SourceLocation, transform: Option<TransformKind>, cause: PipelineError) -> Self {
        Self {
            stage: cause.stage().unwrap_or(stage),
            origin: origin.to_string(),
            transform,
            error: cause.to_string(),
            cause: Some(cause),
        }
    }
}

/// Aggregate outcome of a single run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub pool_size: usize,
    pub sources: usize,
    pub fetched: usize,
    pub transformed: usize,
    pub stored: Vec<StoredArtifact>,
    pub failures: Vec<UnitFailure>,
}

impl RunReport {
    pub fn stored_count(&self) -> usize {
        self.stored.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn stored_bytes(&self) -> usize {
        self.stored.iter().map(|a| a.bytes).sum()
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}: downloaded and stored {} images using {} threads in the pool",
            self.name,
            self.stored_count(),
            self.pool_size
        );
        if !self.failures.is_empty() {
            line.push_str(&format!(" ({} units failed)", self.failures.len()));
        }
        line
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: TransformRegistry,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn Store>,
    pool: WorkerPool,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: TransformRegistry,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn Store>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            config,
            registry,
            fetcher,
            store,
            pool,
            metrics: Arc::new(Metrics::noop()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        metrics.set_pool_size(self.pool.size());
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run all three stages over `sources`.
    pub async fn run(&self, name: &str, sources: &[SourceLocation]) -> Result<RunReport> {
        let outcome = self.run_stages(name, sources).await;
        self.metrics.record_run(outcome.is_ok());
        if let Err(e) = &outcome {
            error!("Run {} aborted: {}", name, e);
        }
        outcome
    }

    /// Run under `timer`, print the stats line, then clean up if configured.
    ///
    /// Aborted runs record no timing entry.
    pub async fn run_timed(
        &self,
        name: &str,
        sources: &[SourceLocation],
        timer: &RunTimer,
    ) -> Result<RunReport> {
        let report = timer.time_run(name, self.run(name, sources)).await?;
        println!("{}", report.summary());

        if self.config.cleanup_after_run {
            let removed = self.store.purge(&self.config.output_dir).await?;
            info!(
                "Removed {} artifacts from {}",
                removed,
                self.config.output_dir.display()
            );
        }

        Ok(report)
    }

    async fn run_stages(&self, name: &str, sources: &[SourceLocation]) -> Result<RunReport> {
        let started_at = Utc::now();
        info!(
            "Run {}: processing {} sources with {} transforms on {} workers",
            name,
            sources.len(),
            self.registry.len(),
            self.pool.size()
        );

        let mut failures = Vec::new();

        let images = self.fetch_stage(sources, &mut failures).await?;
        let fetched = images.len();

        let variants = self.transform_stage(&images, &mut failures).await?;
        let transformed = variants.len();

        let mut pending: Vec<Arc<Image>> = variants.into_iter().map(Arc::new).collect();
        if self.config.persist_raw {
            pending.extend(images);
        }
        let stored = self.store_stage(pending, &mut failures).await?;

        let report = RunReport {
            run_id: Uuid::new_v4(),
            name: name.to_string(),
            started_at,
            pool_size: self.pool.size(),
            sources: sources.len(),
            fetched,
            transformed,
            stored,
            failures,
        };

        info!(
            "Run {} finished: {} artifacts ({}), {} failures",
            name,
            report.stored_count(),
            format_bytes(report.stored_bytes()),
            report.failures.len()
        );
        Ok(report)
    }

    async fn fetch_stage(
        &self,
        sources: &[SourceLocation],
        failures: &mut Vec<UnitFailure>,
    ) -> Result<Vec<Arc<Image>>> {
        let start = Instant::now();
        let budget = self.config.fetch_timeout;

        let units: Vec<_> = sources
            .iter()
            .cloned()
            .map(|location| {
                let fetcher = self.fetcher.clone();
                async move {
                    match timeout(budget, Image::fetch(&location, fetcher.as_ref())).await {
                        Ok(result) => result,
                        Err(_) => Err(PipelineError::Timeout {
                            stage: Stage::Fetch,
                            location: location.to_string(),
                            after: budget,
                        }),
                    }
                }
            })
            .collect();

        let results = self.pool.execute(units).await;

        let mut images = Vec::with_capacity(results.len());
        let mut stage_failures = Vec::new();
        for (location, result) in sources.iter().zip(results) {
            match result {
                Ok(image) => images.push(Arc::new(image)),
                Err(e) => stage_failures.push(UnitFailure::new(Stage::Fetch, location, None, e)),
            }
        }

        self.metrics
            .record_stage(Stage::Fetch, start.elapsed(), images.len(), stage_failures.len());
        info!(
            "Fetch stage: {} of {} sources retrieved in {:?}",
            images.len(),
            sources.len(),
            start.elapsed()
        );

        self.settle(stage_failures, failures)?;
        Ok(images)
    }

    async fn transform_stage(
        &self,
        images: &[Arc<Image>],
        failures: &mut Vec<UnitFailure>,
    ) -> Result<Vec<Image>> {
        let start = Instant::now();

        let mut keys = Vec::with_capacity(images.len() * self.registry.len());
        let mut jobs = Vec::with_capacity(images.len() * self.registry.len());
        for image in images {
            for transform in self.registry.iter() {
                keys.push((image.origin().clone(), transform.kind()));

                let image = image.clone();
                let transform = transform.clone();
                jobs.push(move || image.transformed(transform.as_ref()));
            }
        }

        let results = self.pool.execute_blocking(jobs).await;

        let mut variants = Vec::with_capacity(results.len());
        let mut stage_failures = Vec::new();
        for ((origin, kind), result) in keys.into_iter().zip(results) {
            match result {
                Ok(variant) => variants.push(variant),
                Err(e) => {
                    stage_failures.push(UnitFailure::new(Stage::Transform, &origin, Some(kind), e))
                }
            }
        }

        self.metrics.record_stage(
            Stage::Transform,
            start.elapsed(),
            variants.len(),
            stage_failures.len(),
        );
        info!(
            "Transform stage: {} variants produced in {:?}",
            variants.len(),
            start.elapsed()
        );

        self.settle(stage_failures, failures)?;
        Ok(variants)
    }

    async fn store_stage(
        &self,
        images: Vec<Arc<Image>>,
        failures: &mut Vec<UnitFailure>,
    ) -> Result<Vec<StoredArtifact>> {
        let start = Instant::now();
        let root = self.config.output_dir.clone();

        let keys: Vec<_> = images
            .iter()
            .map(|image| (image.origin().clone(), image.applied_transform()))
            .collect();

        let units: Vec<_> = images
            .into_iter()
            .map(|image| {
                let store = self.store.clone();
                let root = root.clone();
                async move { image.store(store.as_ref(), &root).await }
            })
            .collect();

        let results = self.pool.execute(units).await;

        let mut stored = Vec::with_capacity(results.len());
        let mut stage_failures = Vec::new();
        for ((origin, kind), result) in keys.into_iter().zip(results) {
            match result {
                Ok(artifact) => stored.push(artifact),
                Err(e) => stage_failures.push(UnitFailure::new(Stage::Store, &origin, kind, e)),
            }
        }

        self.metrics
            .record_stage(Stage::Store, start.elapsed(), stored.len(), stage_failures.len());
        info!(
            "Store stage: {} artifacts written in {:?}",
            stored.len(),
            start.elapsed()
        );

        if self.config.failure_policy == FailurePolicy::FailFast && !stage_failures.is_empty() {
            self.roll_back(&stored).await;
        }

        self.settle(stage_failures, failures)?;
        Ok(stored)
    }

    /// Apply the failure policy to one stage's failures.
    fn settle(&self, stage_failures: Vec<UnitFailure>, failures: &mut Vec<UnitFailure>) -> Result<()> {
        if stage_failures.is_empty() {
            return Ok(());
        }

        match self.config.failure_policy {
            FailurePolicy::FailFast => {
                let first = stage_failures
                    .into_iter()
                    .next()
                    .and_then(|failure| failure.cause)
                    .unwrap_or_else(|| PipelineError::WorkerPool("unit failed".to_string()));
                Err(first)
            }
            FailurePolicy::Isolate => {
                for failure in &stage_failures {
                    warn!(
                        "{} unit failed for {}{}: {}",
                        failure.stage,
                        failure.origin,
                        failure
                            .transform
                            .map(|kind| format!(" ({kind})"))
                            .unwrap_or_default(),
                        failure.error
                    );
                }
                failures.extend(stage_failures);
                Ok(())
            }
        }
    }

    /// Remove artifacts already written by an aborted store stage.
    async fn roll_back(&self, stored: &[StoredArtifact]) {
        for artifact in stored {
            if let Err(e) = self.store.remove(&artifact.path).await {
                warn!("Could not remove {}: {}", artifact.path.display(), e);
            }
        }
    }
}
