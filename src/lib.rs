//! # Image Pipeline
//!
//! A concurrent image fan-out pipeline: every source image is fetched,
//! every registered transform is applied to every fetched image, and every
//! resulting variant is written to durable storage, with per-run timing
//! statistics.
//!
//! ## Stages
//!
//! | Stage | Units | Work |
//! |-------|-------|------|
//! | **Fetch** | one per source location | I/O via a [`Fetcher`] |
//! | **Transform** | one per (image, transform) pair | pure pixel mapping on blocking threads |
//! | **Store** | one per variant | I/O via a [`Store`] |
//!
//! All stages share one explicitly sized [`WorkerPool`]; its default size is
//! the number of hardware threads plus one.
//!
//! ## Transforms
//!
//! | Tag | Effect |
//! |-----|--------|
//! | `grayscale` | Rec.601 luminance |
//! | `tint` | 30% blend toward red |
//! | `sepia` | classic sepia tone matrix |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use image_pipeline::{MemoryStore, HttpFetcher, Pipeline, PipelineConfig, SourceLocation, WorkerPool};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let pipeline = Pipeline::new(
//!         config.clone(),
//!         config.registry()?,
//!         Arc::new(HttpFetcher::new(config.request_timeout, None)?),
//!         Arc::new(MemoryStore::new()),
//!         WorkerPool::new(4)?,
//!     );
//!
//!     let sources = vec![SourceLocation::parse("https://example.com/cat.png")?];
//!     let report = pipeline.run("quick-start", &sources).await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! image-pipeline run --input urls.txt --output images/ --transform sepia --transform tint
//! image-pipeline --threads 8 run --url https://example.com/cat.png --persist-raw --runs 3 --keep
//! ```

/// Configuration and settings for the pipeline
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Transform registry and pixel transform variants
pub mod transform;

/// Image entity, source locations and stored artifacts
pub mod entity;

/// Fetch collaborators
pub mod fetch;

/// Store and cleanup collaborators
pub mod store;

/// Bounded worker pool shared by every stage
pub mod worker;

/// Orchestrator driving the three pipeline stages
pub mod pipeline;

/// Run timing harness
pub mod timing;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use cli::*;
pub use config::*;
pub use entity::*;
pub use error::*;
pub use fetch::*;
pub use self::metrics::*;
pub use pipeline::*;
pub use store::*;
pub use timing::*;
pub use transform::*;
pub use utils::*;
pub use worker::*;
