use crate::format_duration;
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingEntry {
    pub name: String,
    pub duration: Duration,
}

impl std::fmt::Display for TimingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} executed in {}", self.name, format_duration(self.duration))
    }
}

/// Append-only record of run durations for the life of the process.
#[derive(Debug, Default)]
pub struct RunTimer {
    entries: RwLock<Vec<TimingEntry>>,
}

impl RunTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await `run`, recording its wall-clock duration under `name` if it succeeds.
    ///
    /// The outcome of `run` is returned untouched.
    pub async fn time_run<T, E, F>(&self, name: &str, run: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let outcome = run.await;
        let elapsed = start.elapsed();

        if outcome.is_ok() {
            self.record(name, elapsed);
        }
        outcome
    }

    pub fn record(&self, name: &str, duration: Duration) {
        debug!("Recorded {} in {:?}", name, duration);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TimingEntry {
                name: name.to_string(),
                duration,
            });
    }

    /// Snapshot of every entry in recording order.
    pub fn entries(&self) -> Vec<TimingEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Formatted results, fastest first. Each call reads afresh; nothing is consumed.
    pub fn timing_results(&self) -> impl Iterator<Item = String> {
        let mut entries = self.entries();
        entries.sort_by_key(|entry| entry.duration);
        entries.into_iter().map(|entry| entry.to_string())
    }

    pub fn report(&self) -> String {
        let lines: Vec<String> = self.timing_results().collect();
        let mut report = format!("Printing {} results from fastest to slowest\n", lines.len());
        for line in lines {
            report.push_str(&line);
            report.push('\n');
        }
        report
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
