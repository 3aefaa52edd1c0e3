//! Bounded worker pool
//!
//! Runs a batch of independent units with at most `max_concurrency` in
//! flight. A fatal (non-retryable) failure stops units that have not started
//! yet; units already running finish and report normally.

use flowcpi_cloud::{CpiError, Result};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;
use tracing::instrument::WithSubscriber;

/// A unit of work submitted to the pool
pub type Unit<T> = BoxFuture<'static, Result<T>>;

/// What happened to one unit of a batch
#[derive(Debug)]
pub enum UnitOutcome<T> {
    Completed(T),
    Failed(CpiError),
    /// Never started because a sibling failed fatally
    Skipped,
}

impl<T> UnitOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, UnitOutcome::Completed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, UnitOutcome::Skipped)
    }

    pub fn error(&self) -> Option<&CpiError> {
        match self {
            UnitOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcomes of a batch, in submission order
#[derive(Debug)]
pub struct BatchReport<T> {
    pub outcomes: Vec<UnitOutcome<T>>,

    /// Whether a fatal failure cancelled pending units
    pub cancelled: bool,
}

impl<T> BatchReport<T> {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(UnitOutcome::is_completed)
    }

    /// Every failure, in submission order
    pub fn errors(&self) -> Vec<&CpiError> {
        self.outcomes.iter().filter_map(UnitOutcome::error).collect()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_skipped()).count()
    }
}

/// Concurrency-capped executor for independent sub-operations
#[derive(Debug, Clone)]
pub struct WorkerPool {
    max_concurrency: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}

impl WorkerPool {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run every unit, returning once all started units have finished
    pub async fn run<T: Send + 'static>(&self, units: Vec<Unit<T>>) -> BatchReport<T> {
        let total = units.len();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut outcomes: Vec<Option<UnitOutcome<T>>> = (0..total).map(|_| None).collect();
        let mut set = JoinSet::new();

        for (index, unit) in units.into_iter().enumerate() {
            let permit = if cancelled.load(Ordering::SeqCst) {
                None
            } else {
                semaphore.clone().acquire_owned().await.ok()
            };

            // re-check: a sibling may have failed while we waited for the permit
            let Some(permit) = permit.filter(|_| !cancelled.load(Ordering::SeqCst)) else {
                tracing::debug!(unit = index, "Skipping unit after fatal failure");
                if let Some(slot) = outcomes.get_mut(index) {
                    *slot = Some(UnitOutcome::Skipped);
                }
                continue;
            };

            let cancelled = cancelled.clone();
            let task = async move {
                let _permit = permit;
                let result = catch_panic("worker unit", unit).await;

                if let Err(ref e) = result {
                    if !e.ok_to_retry() {
                        cancelled.store(true, Ordering::SeqCst);
                    }
                    tracing::warn!(unit = index, error = %e, kind = %e.kind(), "Worker unit failed");
                }
                (index, result)
            };
            set.spawn(task.in_current_span().with_current_subscriber());
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Some(slot) = outcomes.get_mut(index) {
                        *slot = Some(match result {
                            Ok(v) => UnitOutcome::Completed(v),
                            Err(e) => UnitOutcome::Failed(e),
                        });
                    }
                }
                Err(e) => tracing::error!("Worker task aborted: {}", e),
            }
        }

        let outcomes = outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or_else(|| {
                    UnitOutcome::Failed(CpiError::unknown("worker unit did not report an outcome"))
                })
            })
            .collect();

        BatchReport {
            outcomes,
            cancelled: cancelled.load(Ordering::SeqCst),
        }
    }
}

/// Await `fut`, turning a panic inside it into an `Unknown` error
pub async fn catch_panic<T, F>(context: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(CpiError::unknown(format!(
            "{} panicked: {}",
            context,
            panic_message(panic.as_ref())
        ))),
    }
}

/// Text of a caught panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
