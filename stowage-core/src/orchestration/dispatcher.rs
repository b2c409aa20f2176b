use std::fmt;
use std::sync::Arc;

use stowage_model::{FileRequest, RequestKind, RequestStatus, StorageId};
use tracing::{debug, info, warn};

use crate::backend::BackendRegistry;
use crate::error::Result;
use crate::orchestration::completion::CompletionHandler;
use crate::orchestration::job::{JobHandle, JobScheduler};
use crate::repository::RequestRepository;

/// Error cause for requests aimed at a storage id with no enabled backend.
pub fn unknown_destination_cause(storage_id: &StorageId) -> String {
    format!("destination storage '{storage_id}' is unknown or disabled")
}

/// Summary of one `dispatch` call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub jobs: Vec<JobHandle>,
    /// Requests failed before reaching a backend job.
    pub failed: usize,
    /// Copy requests whose source was resolved.
    pub copies_started: usize,
}

impl DispatchReport {
    fn absorb(&mut self, other: DispatchReport) {
        self.jobs.extend(other.jobs);
        self.failed += other.failed;
        self.copies_started += other.copies_started;
    }
}

/// Pages TO_DO requests per storage id into backend jobs.
#[derive(Clone)]
pub struct BackendDispatcher {
    requests: Arc<dyn RequestRepository>,
    registry: Arc<BackendRegistry>,
    scheduler: JobScheduler,
    handler: CompletionHandler,
    page_size: usize,
}

impl fmt::Debug for BackendDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDispatcher")
            .field("registry", &self.registry)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl BackendDispatcher {
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        registry: Arc<BackendRegistry>,
        scheduler: JobScheduler,
        handler: CompletionHandler,
        page_size: usize,
    ) -> Self {
        Self {
            requests,
            registry,
            scheduler,
            handler,
            page_size: page_size.max(1),
        }
    }

    /// Dispatches every `status` request of `kind` at `storage_id`.
    pub async fn dispatch(
        &self,
        kind: RequestKind,
        storage_id: &StorageId,
        status: RequestStatus,
    ) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let mut cursor = None;
        loop {
            let page = self
                .requests
                .find_page(kind, storage_id, status, cursor, self.page_size)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.id);
            let full_page = page.len() == self.page_size;

            let outcome = if kind == RequestKind::Copy {
                self.start_copies(page).await?
            } else {
                self.dispatch_page(kind, storage_id, page).await?
            };
            report.absorb(outcome);

            if !full_page {
                break;
            }
        }
        Ok(report)
    }

    /// Dispatches TO_DO requests of `kind` for every storage id holding
    /// some. A failing storage id does not stop the others.
    pub async fn dispatch_all(&self, kind: RequestKind) -> Result<DispatchReport> {
        let storages = self
            .requests
            .storages_with_status(kind, RequestStatus::ToDo)
            .await?;
        let mut report = DispatchReport::default();
        for storage_id in storages {
            match self.dispatch(kind, &storage_id, RequestStatus::ToDo).await {
                Ok(outcome) => report.absorb(outcome),
                Err(err) => {
                    warn!(
                        %kind,
                        storage = %storage_id,
                        error = %err,
                        "dispatch failed for storage"
                    );
                }
            }
        }
        if !report.jobs.is_empty() || report.failed > 0 {
            info!(
                %kind,
                jobs = report.jobs.len(),
                failed = report.failed,
                copies = report.copies_started,
                "dispatch pass complete"
            );
        }
        Ok(report)
    }

    async fn dispatch_page(
        &self,
        kind: RequestKind,
        storage_id: &StorageId,
        page: Vec<FileRequest>,
    ) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let ids: Vec<_> = page.iter().map(|r| r.id).collect();

        let Some(backend) = self.registry.enabled(storage_id) else {
            warn!(storage = %storage_id, %kind, count = ids.len(), "no enabled backend for storage");
            self.handler
                .fail_requests(&ids, &unknown_destination_cause(storage_id))
                .await?;
            report.failed = ids.len();
            return Ok(report);
        };

        let prepared = match kind {
            RequestKind::Storage => backend.prepare_for_storage(page).await,
            RequestKind::Deletion => backend.prepare_for_deletion(page).await,
            RequestKind::Availability => {
                backend.prepare_for_availability(page).await
            }
            RequestKind::Copy => Ok(Vec::new()),
        };
        let subsets = match prepared {
            Ok(subsets) => subsets,
            Err(err) => {
                warn!(storage = %storage_id, %kind, error = %err, "backend could not prepare batch");
                self.handler.fail_requests(&ids, &err.to_string()).await?;
                report.failed = ids.len();
                return Ok(report);
            }
        };

        for subset in subsets {
            if subset.is_empty() {
                continue;
            }
            if let Some(handle) = self
                .scheduler
                .schedule(kind, storage_id, subset, Arc::clone(&backend))
                .await?
            {
                report.jobs.push(handle);
            }
        }
        Ok(report)
    }

    async fn start_copies(&self, page: Vec<FileRequest>) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        for copy in page {
            self.handler.start_copy(copy.id).await?;
            report.copies_started += 1;
        }
        debug!(count = report.copies_started, "copy requests processed");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_destination_cause_names_the_storage() {
        let storage = StorageId::new("s3-eu").unwrap();
        assert_eq!(
            unknown_destination_cause(&storage),
            "destination storage 's3-eu' is unknown or disabled"
        );
    }
}
