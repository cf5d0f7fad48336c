use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::SyncError;

/// One unit of work that did not complete.
#[derive(Debug)]
pub struct UnitFailure {
    pub unit: String,
    pub error: SyncError,
}

impl UnitFailure {
    pub fn new(unit: impl Into<String>, error: SyncError) -> Self {
        Self {
            unit: unit.into(),
            error,
        }
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.unit, self.error)
    }
}

/// Outcome of a pooled run. `finished` counts units (or items) that completed.
#[derive(Debug, Default)]
pub struct PoolReport {
    pub total: u64,
    pub finished: u64,
    pub failures: Vec<UnitFailure>,
}

impl PoolReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Shared finished counter handed to every unit.
#[derive(Clone)]
pub struct Progress {
    label: Arc<str>,
    total: u64,
    finished: Arc<AtomicU64>,
}

impl Progress {
    fn new(label: Arc<str>, total: u64) -> Self {
        Self {
            label,
            total,
            finished: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Marks one more item finished and logs `finished/total`.
    pub fn tick(&self) -> u64 {
        let cur = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            target = "igdb",
            job = %self.label,
            finished = cur,
            total = self.total,
            "{} finished: {}/{}",
            self.label,
            cur,
            self.total
        );
        cur
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Runs independent units under a fixed-size admission semaphore and joins them all.
/// A failed unit never cancels its siblings; its failures are collected instead.
pub struct WorkerPool {
    label: Arc<str>,
    limit: usize,
}

impl WorkerPool {
    pub fn new(label: impl Into<Arc<str>>, limit: usize) -> Self {
        Self {
            label: label.into(),
            limit: limit.max(1),
        }
    }

    pub async fn run<U, F, Fut>(&self, units: Vec<U>, total: u64, work: F) -> PoolReport
    where
        U: Send + 'static,
        F: Fn(U, Progress) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<UnitFailure>> + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(self.limit));
        let progress = Progress::new(self.label.clone(), total);
        let work = Arc::new(work);
        let mut set: JoinSet<Vec<UnitFailure>> = JoinSet::new();

        for unit in units {
            let permit = match sem.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let work = work.clone();
            let progress = progress.clone();
            set.spawn(async move {
                let _permit = permit; // hold until done
                work(unit, progress).await
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(unit_failures) => {
                    for f in &unit_failures {
                        error!(target = "igdb", job = %self.label, unit = %f.unit, error = %f.error, "unit failed");
                    }
                    failures.extend(unit_failures);
                }
                Err(join_err) => {
                    error!(target = "igdb", job = %self.label, error = %join_err, "worker task aborted");
                    failures.push(UnitFailure::new(
                        self.label.to_string(),
                        SyncError::Worker(join_err.to_string()),
                    ));
                }
            }
        }

        PoolReport {
            total,
            finished: progress.finished(),
            failures,
        }
    }
}
