//! Explicitly sized worker pool shared by every pipeline stage
//!
//! Each submitted unit is spawned immediately and then waits for one of
//! `size` permits, so at most `size` units make progress at a time. Results
//! come back in submission order; completion order is unspecified.

use crate::{PipelineError, Result};
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Default)]
struct PoolCounters {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

/// Marks a unit as running while it holds a permit.
struct InFlight {
    counters: Arc<PoolCounters>,
}

impl InFlight {
    fn enter(counters: Arc<PoolCounters>) -> Self {
        let current = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        Self { counters }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PipelineError::Configuration(
                "Worker pool size must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            counters: Arc::new(PoolCounters::default()),
        })
    }

    /// Available hardware parallelism plus one.
    pub fn default_size() -> usize {
        num_cpus::get() + 1
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run async units (I/O-bound work) on the pool.
    pub async fn execute<T, Fut>(&self, units: Vec<Fut>) -> Vec<Result<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let handles: Vec<JoinHandle<Result<T>>> = units
            .into_iter()
            .map(|unit| {
                let permits = self.permits.clone();
                let counters = self.counters.clone();

                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await?;
                    let _slot = InFlight::enter(counters);
                    unit.await
                })
            })
            .collect();

        self.collect(handles).await
    }

    /// Run CPU-bound jobs on blocking threads, still bounded by the pool size.
    pub async fn execute_blocking<T, F>(&self, jobs: Vec<F>) -> Vec<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let handles: Vec<JoinHandle<Result<T>>> = jobs
            .into_iter()
            .map(|job| {
                let permits = self.permits.clone();
                let counters = self.counters.clone();

                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await?;
                    let _slot = InFlight::enter(counters);
                    match tokio::task::spawn_blocking(job).await {
                        Ok(result) => result,
                        Err(e) => Err(PipelineError::WorkerPool(e.to_string())),
                    }
                })
            })
            .collect();

        self.collect(handles).await
    }

    async fn collect<T>(&self, handles: Vec<JoinHandle<Result<T>>>) -> Vec<Result<T>> {
        let submitted = handles.len();
        let results: Vec<Result<T>> = join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| Err(PipelineError::WorkerPool(e.to_string()))))
            .collect();

        let failed = results.iter().filter(|r| r.is_err()).count();
        self.counters.completed.fetch_add(submitted - failed, Ordering::Relaxed);
        self.counters.failed.fetch_add(failed, Ordering::Relaxed);

        debug!("Worker pool finished {} units ({} failed)", submitted, failed);
        results
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}
