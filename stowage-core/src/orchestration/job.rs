use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use stowage_model::{JobId, RequestId, RequestKind, StorageId};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info_span, warn};

use crate::backend::{StorageBackend, WorkingSubset};
use crate::error::{Result, StorageError};
use crate::orchestration::completion::{
    CAUSE_UNREPORTED, CompletionHandler, CompletionSender, JobProgress,
};
use crate::repository::RequestRepository;

/// Identity of a scheduled backend job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: JobId,
    pub kind: RequestKind,
    pub storage_id: StorageId,
    pub label: Option<String>,
    pub request_ids: Vec<RequestId>,
}

/// A job ready to run: its members are already PENDING under `job_id`.
pub struct ScheduledJob {
    pub handle: JobHandle,
    pub backend: Arc<dyn StorageBackend>,
    pub subset: WorkingSubset,
    pub progress: JobProgress,
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("handle", &self.handle)
            .field("members", &self.subset.len())
            .finish()
    }
}

impl ScheduledJob {
    /// Runs the backend job body, then fails whatever it left unreported.
    pub async fn run(self) {
        let ScheduledJob {
            handle,
            backend,
            subset,
            progress,
        } = self;

        let result = match handle.kind {
            RequestKind::Storage => backend.store(subset, progress.clone()).await,
            RequestKind::Deletion => {
                backend.delete(subset, progress.clone()).await
            }
            RequestKind::Availability => {
                backend.make_available(subset, progress.clone()).await
            }
            RequestKind::Copy => Err(StorageError::Internal(
                "copy requests are never run as backend jobs".into(),
            )),
        };

        let cause = match result {
            Ok(()) => CAUSE_UNREPORTED.to_string(),
            Err(err) => {
                warn!(
                    job = %handle.job_id,
                    storage = %handle.storage_id,
                    error = %err,
                    "backend job failed"
                );
                err.to_string()
            }
        };
        progress.fail_unreported(&handle.request_ids, &cause).await;
        debug!(job = %handle.job_id, "backend job finished");
    }
}

/// Runs scheduled jobs asynchronously.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Hands the job off; must not wait for it to finish.
    async fn submit(&self, job: ScheduledJob) -> Result<()>;
}

/// Spawns each job as a tokio task inside its own tracing span.
#[derive(Clone, Debug, Default)]
pub struct TokioJobExecutor {
    tasks: TaskTracker,
}

impl TokioJobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops accepting jobs and waits for the running ones.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[async_trait]
impl JobExecutor for TokioJobExecutor {
    async fn submit(&self, job: ScheduledJob) -> Result<()> {
        if self.tasks.is_closed() {
            return Err(StorageError::Internal(
                "job executor is shut down".into(),
            ));
        }
        let span = info_span!(
            "backend_job",
            job = %job.handle.job_id,
            kind = %job.handle.kind,
            storage = %job.handle.storage_id,
            members = job.handle.request_ids.len(),
        );
        self.tasks.spawn(job.run().instrument(span));
        Ok(())
    }
}

/// Marks a working subset PENDING and hands it to the executor.
#[derive(Clone)]
pub struct JobScheduler {
    requests: Arc<dyn RequestRepository>,
    executor: Arc<dyn JobExecutor>,
    completions: CompletionSender,
    handler: CompletionHandler,
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("completions_closed", &self.completions.is_closed())
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        executor: Arc<dyn JobExecutor>,
        completions: CompletionSender,
        handler: CompletionHandler,
    ) -> Self {
        Self {
            requests,
            executor,
            completions,
            handler,
        }
    }

    /// Mark-then-enqueue. Members that are no longer TO_DO are dropped from
    /// the subset; returns `None` when nothing was left to run.
    pub async fn schedule(
        &self,
        kind: RequestKind,
        storage_id: &StorageId,
        mut subset: WorkingSubset,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Option<JobHandle>> {
        let job_id = JobId::new();
        let marked = self
            .requests
            .mark_pending(&subset.request_ids(), job_id)
            .await?;
        if marked.is_empty() {
            debug!(storage = %storage_id, %kind, "no schedulable members in subset");
            return Ok(None);
        }
        subset.retain_ids(&marked);

        let handle = JobHandle {
            job_id,
            kind,
            storage_id: storage_id.clone(),
            label: subset.label().map(str::to_string),
            request_ids: marked.clone(),
        };
        let job = ScheduledJob {
            handle: handle.clone(),
            backend,
            subset,
            progress: JobProgress::new(job_id, kind, self.completions.clone()),
        };

        if let Err(err) = self.executor.submit(job).await {
            warn!(job = %job_id, storage = %storage_id, error = %err, "job submission failed");
            self.handler
                .fail_requests(&marked, &err.to_string())
                .await?;
            return Ok(None);
        }
        debug!(job = %job_id, storage = %storage_id, %kind, members = marked.len(), "job scheduled");
        Ok(Some(handle))
    }
}
