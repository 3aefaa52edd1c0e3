//! Resource lifecycle orchestration
//!
//! A [`Lifecycle`] runs the acquire → use → release pattern for one workflow.
//! Every acquisition pushes a [`CleanupTask`] bound to the id it produced;
//! when the workflow ends, the stack is unwound from the most recent
//! acquisition to the earliest, according to each task's [`CleanupPolicy`].
//!
//! ```ignore
//! let mut lifecycle = Lifecycle::new("create_vm", pool);
//! let outcome = async {
//!     let vm_id = lifecycle
//!         .acquire("create vm", ResourceKind::Vm, CleanupPolicy::OnFailure,
//!             backend.create_vm(&spec), release_vm)
//!         .await?;
//!     lifecycle.step("verify vm", backend.vm_exists(&vm_id)).await?;
//!     Ok(vm_id)
//! }
//! .await;
//! lifecycle.finish(outcome).await
//! ```

use crate::pool::{Unit, WorkerPool, catch_panic};
use flowcpi_cloud::{CpiError, ResourceKind, Result};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// When a cleanup task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Undo the acquisition only if the workflow fails (resource persists on success)
    OnFailure,
    /// Release only once the workflow has succeeded
    OnSuccess,
    /// Resource is ephemeral for this workflow
    Always,
}

impl CleanupPolicy {
    fn runs_in(&self, phase: Phase) -> bool {
        match (self, phase) {
            (_, Phase::Teardown) => true,
            (CleanupPolicy::OnFailure, Phase::Failure) => true,
            (CleanupPolicy::OnSuccess, Phase::Success) => true,
            (CleanupPolicy::Always, _) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Success,
    Failure,
    Teardown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Success => write!(f, "success"),
            Phase::Failure => write!(f, "failure"),
            Phase::Teardown => write!(f, "teardown"),
        }
    }
}

type ReleaseOne = Box<dyn FnOnce(String) -> BoxFuture<'static, Result<()>> + Send>;
type ReleaseEach = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

enum Release {
    /// One resource; `id` stays `None` until the acquisition produced it
    One { id: Option<String>, release: ReleaseOne },
    /// Independent resources released in parallel through the worker pool
    Each { ids: Vec<String>, release: ReleaseEach },
}

/// Deferred release of what one step acquired
pub struct CleanupTask {
    label: String,
    kind: ResourceKind,
    policy: CleanupPolicy,
    release: Release,
}

impl std::fmt::Debug for CleanupTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match &self.release {
            Release::One { id, .. } => format!("{:?}", id),
            Release::Each { ids, .. } => format!("{:?}", ids),
        };
        f.debug_struct("CleanupTask")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .field("target", &target)
            .finish()
    }
}

impl CleanupTask {
    /// Run the release, consuming the task so it can never run twice
    async fn execute(self, pool: &WorkerPool) -> Result<()> {
        let CleanupTask {
            label,
            kind,
            release,
            ..
        } = self;

        match release {
            Release::One { id: None, .. } => {
                tracing::info!(
                    task = %label,
                    kind = %kind,
                    "Skipping cleanup: resource id was never produced"
                );
                Ok(())
            }
            Release::One {
                id: Some(id),
                release,
            } => {
                tracing::debug!(task = %label, kind = %kind, id = %id, "Running cleanup");
                catch_panic("cleanup task", release(id)).await
            }
            Release::Each { ids, release } => {
                if ids.is_empty() {
                    return Ok(());
                }
                tracing::debug!(task = %label, kind = %kind, count = ids.len(), "Running parallel cleanup");
                let units: Vec<Unit<()>> = ids.into_iter().map(|id| release(id)).collect();
                let report = pool.run(units).await;
                if report.is_success() {
                    return Ok(());
                }
                if report.cancelled {
                    tracing::warn!(
                        task = %label,
                        skipped = report.skipped(),
                        "Parallel cleanup stopped after a fatal failure"
                    );
                }

                let mut errors = report.errors().into_iter();
                match errors.next() {
                    None => Ok(()),
                    Some(primary) => {
                        for other in errors {
                            tracing::warn!(task = %label, error = %other, "Additional cleanup failure");
                        }
                        Err(primary.clone())
                    }
                }
            }
        }
    }
}

/// The triggering error of a workflow plus everything cleanup raised
#[derive(Debug, Default)]
pub struct AggregatedFailure {
    pub trigger: Option<CpiError>,
    pub cleanup: Vec<CpiError>,
}

impl AggregatedFailure {
    pub fn is_empty(&self) -> bool {
        self.trigger.is_none() && self.cleanup.is_empty()
    }

    /// The error the caller sees: the trigger if any, else the first cleanup error
    pub fn into_result(self) -> Result<()> {
        match (self.trigger, self.cleanup.into_iter().next()) {
            (Some(trigger), _) => Err(trigger),
            (None, Some(first)) => Err(first),
            (None, None) => Ok(()),
        }
    }
}

/// Cleanup stack for a single workflow
pub struct Lifecycle {
    workflow: String,
    pool: WorkerPool,
    stack: Vec<CleanupTask>,
}

impl Lifecycle {
    pub fn new(workflow: impl Into<String>, pool: WorkerPool) -> Self {
        Self {
            workflow: workflow.into(),
            pool,
            stack: Vec::new(),
        }
    }

    /// Number of cleanup tasks currently pending
    pub fn pending(&self) -> usize {
        self.stack.len()
    }

    /// Run an acquiring step
    ///
    /// The cleanup task is pushed before the step runs and bound to the id the
    /// step returns. If the step fails, the task stays unbound and is skipped
    /// during unwinding.
    pub async fn acquire<S, F, R>(
        &mut self,
        label: &str,
        kind: ResourceKind,
        policy: CleanupPolicy,
        step: S,
        release: F,
    ) -> Result<String>
    where
        S: Future<Output = Result<String>>,
        F: FnOnce(String) -> R + Send + 'static,
        R: Future<Output = Result<()>> + Send + 'static,
    {
        let slot = self.stack.len();
        self.stack.push(CleanupTask {
            label: label.to_string(),
            kind,
            policy,
            release: Release::One {
                id: None,
                release: Box::new(move |id| release(id).boxed()),
            },
        });

        tracing::debug!(workflow = %self.workflow, step = label, "Acquiring {}", kind);
        match step.await {
            Ok(id) => {
                if let Some(CleanupTask {
                    release: Release::One { id: bound, .. },
                    ..
                }) = self.stack.get_mut(slot)
                {
                    *bound = Some(id.clone());
                }
                tracing::info!(workflow = %self.workflow, step = label, id = %id, "Acquired {}", kind);
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(workflow = %self.workflow, step = label, error = %e, "Acquisition failed");
                Err(e)
            }
        }
    }

    /// Run a step that acquires nothing
    pub async fn step<T, S>(&mut self, label: &str, step: S) -> Result<T>
    where
        S: Future<Output = Result<T>>,
    {
        tracing::debug!(workflow = %self.workflow, step = label, "Running step");
        step.await.inspect_err(|e| {
            tracing::warn!(workflow = %self.workflow, step = label, error = %e, "Step failed");
        })
    }

    /// Register the release of a resource that already exists
    pub fn defer<F, R>(
        &mut self,
        label: &str,
        kind: ResourceKind,
        id: impl Into<String>,
        policy: CleanupPolicy,
        release: F,
    ) where
        F: FnOnce(String) -> R + Send + 'static,
        R: Future<Output = Result<()>> + Send + 'static,
    {
        self.stack.push(CleanupTask {
            label: label.to_string(),
            kind,
            policy,
            release: Release::One {
                id: Some(id.into()),
                release: Box::new(move |id| release(id).boxed()),
            },
        });
    }

    /// Register the parallel release of several independent resources
    ///
    /// The batch is one entry on the stack: it is ordered against its
    /// neighbours, while its members run concurrently in the worker pool.
    pub fn defer_each<F, R>(
        &mut self,
        label: &str,
        kind: ResourceKind,
        ids: Vec<String>,
        policy: CleanupPolicy,
        release: F,
    ) where
        F: Fn(String) -> R + Send + Sync + 'static,
        R: Future<Output = Result<()>> + Send + 'static,
    {
        self.stack.push(CleanupTask {
            label: label.to_string(),
            kind,
            policy,
            release: Release::Each {
                ids,
                release: Arc::new(move |id| release(id).boxed()),
            },
        });
    }

    /// End the workflow with its forward outcome
    ///
    /// On failure every task runs in reverse order and the triggering error is
    /// returned. On success only the tasks marked for success run; their first
    /// failure is returned since there is no trigger to report instead.
    pub async fn finish<T>(self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                let failure = self.unwind(Phase::Success, None).await;
                failure.into_result().map(|()| value)
            }
            Err(trigger) => {
                let failure = self.unwind(Phase::Failure, Some(trigger)).await;
                Err(failure
                    .into_result()
                    .err()
                    .unwrap_or_else(|| CpiError::unknown("workflow failed without an error")))
            }
        }
    }

    /// Release everything on the stack, surfacing the first cleanup error
    pub async fn teardown(self) -> Result<()> {
        self.unwind(Phase::Teardown, None).await.into_result()
    }

    async fn unwind(self, phase: Phase, trigger: Option<CpiError>) -> AggregatedFailure {
        let Lifecycle {
            workflow,
            pool,
            mut stack,
        } = self;

        let mut failure = AggregatedFailure {
            trigger,
            cleanup: Vec::new(),
        };

        if let Some(ref trigger) = failure.trigger {
            tracing::warn!(
                workflow = %workflow,
                error = %trigger,
                kind = %trigger.kind(),
                pending = stack.len(),
                "Workflow failed, unwinding"
            );
        }

        while let Some(task) = stack.pop() {
            if !task.policy.runs_in(phase) {
                tracing::debug!(workflow = %workflow, task = %task.label, phase = %phase, "Keeping resource");
                continue;
            }

            let label = task.label.clone();
            if let Err(e) = task.execute(&pool).await {
                tracing::error!(
                    workflow = %workflow,
                    task = %label,
                    error = %e,
                    kind = %e.kind(),
                    "Cleanup failed"
                );
                failure.cleanup.push(e);
            }
        }

        if !failure.cleanup.is_empty() {
            tracing::warn!(
                workflow = %workflow,
                phase = %phase,
                failures = failure.cleanup.len(),
                "Cleanup finished with errors"
            );
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    fn release(journal: &Journal, fail: bool) -> impl FnOnce(String) -> BoxFuture<'static, Result<()>> + Send + 'static {
        let journal = journal.clone();
        move |id| {
            async move {
                journal.lock().unwrap().push(format!("release {}", id));
                if fail {
                    Err(CpiError::Cloud(format!("release of {} failed", id)))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_failure_unwinds_in_reverse_order() {
        let journal: Journal = Arc::default();
        let mut lifecycle = Lifecycle::new("test", WorkerPool::new(2));

        let outcome: Result<()> = async {
            for n in 1..=3 {
                lifecycle
                    .acquire(
                        &format!("step {}", n),
                        ResourceKind::Disk,
                        CleanupPolicy::OnFailure,
                        async move { Ok(format!("r{}", n)) },
                        release(&journal, false),
                    )
                    .await?;
            }
            lifecycle
                .acquire(
                    "step 4",
                    ResourceKind::Disk,
                    CleanupPolicy::OnFailure,
                    async { Err(CpiError::DiskNotFound("r4".into())) },
                    release(&journal, false),
                )
                .await?;
            Ok(())
        }
        .await;

        let err = lifecycle.finish(outcome).await.unwrap_err();
        assert_eq!(err.kind(), flowcpi_cloud::ErrorKind::DiskNotFound);
        assert_eq!(
            entries(&journal),
            vec!["release r3", "release r2", "release r1"]
        );
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_mask_trigger() {
        let journal: Journal = Arc::default();
        let mut lifecycle = Lifecycle::new("test", WorkerPool::default());

        let outcome: Result<()> = async {
            lifecycle
                .acquire("a", ResourceKind::Vm, CleanupPolicy::OnFailure, async { Ok("vm".to_string()) }, release(&journal, false))
                .await?;
            lifecycle
                .acquire("b", ResourceKind::Disk, CleanupPolicy::OnFailure, async { Ok("disk".to_string()) }, release(&journal, true))
                .await?;
            lifecycle
                .step("verify", async { Err::<(), _>(CpiError::VmCreationFailed("gone".into())) })
                .await?;
            Ok(())
        }
        .await;

        let err = lifecycle.finish(outcome).await.unwrap_err();
        assert_eq!(err.kind(), flowcpi_cloud::ErrorKind::VmCreationFailed);
        // the failing disk release did not stop the vm release
        assert_eq!(entries(&journal), vec!["release disk", "release vm"]);
    }

    #[tokio::test]
    async fn test_success_runs_only_ephemeral_tasks() {
        let journal: Journal = Arc::default();
        let mut lifecycle = Lifecycle::new("test", WorkerPool::default());

        let outcome: Result<String> = async {
            let disk = lifecycle
                .acquire("disk", ResourceKind::Disk, CleanupPolicy::OnFailure, async { Ok("disk".to_string()) }, release(&journal, false))
                .await?;
            lifecycle
                .acquire("snapshot", ResourceKind::Snapshot, CleanupPolicy::Always, async { Ok("snap".to_string()) }, release(&journal, false))
                .await?;
            lifecycle
                .acquire("lease", ResourceKind::Vm, CleanupPolicy::OnSuccess, async { Ok("lease".to_string()) }, release(&journal, false))
                .await?;
            Ok(disk)
        }
        .await;

        let disk = lifecycle.finish(outcome).await.unwrap();
        assert_eq!(disk, "disk");
        assert_eq!(entries(&journal), vec!["release lease", "release snap"]);
    }

    #[tokio::test]
    async fn test_on_success_task_kept_on_failure() {
        let journal: Journal = Arc::default();
        let mut lifecycle = Lifecycle::new("test", WorkerPool::default());

        let outcome: Result<()> = async {
            lifecycle
                .acquire("lease", ResourceKind::Vm, CleanupPolicy::OnSuccess, async { Ok("lease".to_string()) }, release(&journal, false))
                .await?;
            Err(CpiError::Cloud("boom".into()))
        }
        .await;

        assert!(lifecycle.finish(outcome).await.is_err());
        assert!(entries(&journal).is_empty());
    }

    #[tokio::test]
    async fn test_success_path_cleanup_error_is_surfaced() {
        let journal: Journal = Arc::default();
        let mut lifecycle = Lifecycle::new("test", WorkerPool::default());

        let outcome = async {
            lifecycle
                .acquire("snapshot", ResourceKind::Snapshot, CleanupPolicy::Always, async { Ok("snap".to_string()) }, release(&journal, true))
                .await
        }
        .await;

        let err = lifecycle.finish(outcome).await.unwrap_err();
        assert!(err.to_string().contains("release of snap failed"));
    }

    #[tokio::test]
    async fn test_unbound_task_is_skipped() {
        let journal: Journal = Arc::default();
        let mut lifecycle = Lifecycle::new("test", WorkerPool::default());

        let outcome = async {
            lifecycle
                .acquire("vm", ResourceKind::Vm, CleanupPolicy::OnFailure, async { Err(CpiError::Cloud("quota".into())) }, release(&journal, false))
                .await
        }
        .await;

        assert_eq!(lifecycle.pending(), 1);
        let err = lifecycle.finish(outcome).await.unwrap_err();
        assert!(err.ok_to_retry());
        assert!(entries(&journal).is_empty());
    }

    #[tokio::test]
    async fn test_teardown_runs_everything_and_surfaces_first_error() {
        let journal: Journal = Arc::default();
        let mut lifecycle = Lifecycle::new("teardown", WorkerPool::new(1));

        lifecycle.defer("vm", ResourceKind::Vm, "vm-1", CleanupPolicy::OnFailure, release(&journal, false));
        let each_journal = journal.clone();
        lifecycle.defer_each(
            "disks",
            ResourceKind::Disk,
            vec!["d1".into(), "d2".into()],
            CleanupPolicy::Always,
            move |id| {
                let journal = each_journal.clone();
                async move {
                    journal.lock().unwrap().push(format!("detach {}", id));
                    if id == "d2" {
                        Err(CpiError::Cloud("detach timed out".into()))
                    } else {
                        Ok(())
                    }
                }
            },
        );

        let err = lifecycle.teardown().await.unwrap_err();
        assert!(err.to_string().contains("detach timed out"));
        assert_eq!(
            entries(&journal),
            vec!["detach d1", "detach d2", "release vm-1"]
        );
    }

    #[tokio::test]
    async fn test_fatal_parallel_release_stops_pending_members() {
        let journal: Journal = Arc::default();
        let mut lifecycle = Lifecycle::new("teardown", WorkerPool::new(1));

        let each_journal = journal.clone();
        lifecycle.defer_each(
            "disks",
            ResourceKind::Disk,
            vec!["d1".into(), "d2".into(), "d3".into()],
            CleanupPolicy::Always,
            move |id| {
                let journal = each_journal.clone();
                async move {
                    journal.lock().unwrap().push(format!("delete {}", id));
                    Err(CpiError::DiskNotFound(id))
                }
            },
        );

        let err = lifecycle.teardown().await.unwrap_err();
        assert_eq!(err.kind(), flowcpi_cloud::ErrorKind::DiskNotFound);
        assert_eq!(entries(&journal), vec!["delete d1"]);
    }

    fn explode() -> Result<()> {
        panic!("device mapper wedged")
    }

    #[tokio::test]
    async fn test_panicking_release_is_reported_and_unwinding_continues() {
        let journal: Journal = Arc::default();
        let mut lifecycle = Lifecycle::new("test", WorkerPool::default());

        lifecycle.defer("vm", ResourceKind::Vm, "vm-1", CleanupPolicy::Always, release(&journal, false));
        lifecycle.defer("disk", ResourceKind::Disk, "disk-1", CleanupPolicy::Always, |_| async { explode() });

        let err = lifecycle.teardown().await.unwrap_err();
        assert_eq!(err.kind(), flowcpi_cloud::ErrorKind::Unknown);
        assert!(err.to_string().contains("device mapper wedged"));
        assert_eq!(entries(&journal), vec!["release vm-1"]);
    }

    #[test]
    fn test_aggregated_failure_prefers_trigger() {
        let failure = AggregatedFailure {
            trigger: Some(CpiError::VmNotFound("vm-1".into())),
            cleanup: vec![CpiError::Cloud("cleanup".into())],
        };
        assert_eq!(
            failure.into_result().unwrap_err().kind(),
            flowcpi_cloud::ErrorKind::VmNotFound
        );

        let failure = AggregatedFailure {
            trigger: None,
            cleanup: vec![CpiError::Cloud("first".into()), CpiError::Cloud("second".into())],
        };
        assert_eq!(failure.into_result().unwrap_err().to_string(), "first");

        assert!(AggregatedFailure::default().is_empty());
    }
}
