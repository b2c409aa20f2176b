//! Result reporting from backend jobs and the completion state machine.
//!
//! Backends report per-request results through [`JobProgress`]; reports
//! travel over a bounded channel to the completion worker, which hands
//! them to [`CompletionHandler`]. Reports are idempotent: a report for a
//! request that is gone or no longer PENDING is ignored.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use stowage_model::{
    Checksum, CopyDetails, FileEvent, FileEventKind, FileReference,
    FileRequest, JobId, Outcome, RequestId, RequestKind, RequestStatus,
    StorageId,
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, StorageError};
use crate::orchestration::checksum_lock::{ChecksumGuard, ChecksumLocks};
use crate::orchestration::copy::{CAUSE_NO_COPY_SOURCE, CopyFlow, CopyPlan};
use crate::orchestration::dedup::Admission;
use crate::orchestration::events::{LifecyclePublisher, notify};
use crate::orchestration::group::GroupTracker;
use crate::repository::{ReferenceRepository, RequestRepository};

pub const CAUSE_UNREPORTED: &str = "job ended without reporting a result";

/// Where a stored file ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFile {
    pub url: Url,
    pub size: Option<u64>,
}

/// Result of one request, as reported by a backend job or an external
/// callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionReport {
    Storage {
        request_id: RequestId,
        result: std::result::Result<StoredFile, String>,
    },
    Deletion {
        request_id: RequestId,
        result: std::result::Result<(), String>,
    },
    Availability {
        request_id: RequestId,
        result: std::result::Result<Url, String>,
    },
}

impl CompletionReport {
    pub fn request_id(&self) -> RequestId {
        match self {
            CompletionReport::Storage { request_id, .. }
            | CompletionReport::Deletion { request_id, .. }
            | CompletionReport::Availability { request_id, .. } => *request_id,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            CompletionReport::Storage { .. } => RequestKind::Storage,
            CompletionReport::Deletion { .. } => RequestKind::Deletion,
            CompletionReport::Availability { .. } => RequestKind::Availability,
        }
    }

    /// A failure report of the right shape for `kind`.
    pub fn failure(
        kind: RequestKind,
        request_id: RequestId,
        cause: impl Into<String>,
    ) -> Option<Self> {
        let cause = cause.into();
        match kind {
            RequestKind::Storage => Some(CompletionReport::Storage {
                request_id,
                result: Err(cause),
            }),
            RequestKind::Deletion => Some(CompletionReport::Deletion {
                request_id,
                result: Err(cause),
            }),
            RequestKind::Availability => Some(CompletionReport::Availability {
                request_id,
                result: Err(cause),
            }),
            RequestKind::Copy => None,
        }
    }
}

pub type CompletionSender = mpsc::Sender<CompletionReport>;
pub type CompletionReceiver = mpsc::Receiver<CompletionReport>;

/// Handle a running job uses to report per-request results.
#[derive(Clone)]
pub struct JobProgress {
    job_id: JobId,
    kind: RequestKind,
    sink: CompletionSender,
    reported: Arc<Mutex<HashSet<RequestId>>>,
}

impl fmt::Debug for JobProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProgress")
            .field("job_id", &self.job_id)
            .field("kind", &self.kind)
            .field("sink_closed", &self.sink.is_closed())
            .finish()
    }
}

impl JobProgress {
    pub fn new(job_id: JobId, kind: RequestKind, sink: CompletionSender) -> Self {
        Self {
            job_id,
            kind,
            sink,
            reported: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub async fn storage_succeeded(
        &self,
        request_id: RequestId,
        url: Url,
        size: Option<u64>,
    ) -> Result<()> {
        self.report(CompletionReport::Storage {
            request_id,
            result: Ok(StoredFile { url, size }),
        })
        .await
    }

    pub async fn storage_failed(
        &self,
        request_id: RequestId,
        cause: impl Into<String>,
    ) -> Result<()> {
        self.report(CompletionReport::Storage {
            request_id,
            result: Err(cause.into()),
        })
        .await
    }

    pub async fn deletion_succeeded(&self, request_id: RequestId) -> Result<()> {
        self.report(CompletionReport::Deletion {
            request_id,
            result: Ok(()),
        })
        .await
    }

    pub async fn deletion_failed(
        &self,
        request_id: RequestId,
        cause: impl Into<String>,
    ) -> Result<()> {
        self.report(CompletionReport::Deletion {
            request_id,
            result: Err(cause.into()),
        })
        .await
    }

    pub async fn availability_succeeded(
        &self,
        request_id: RequestId,
        cached_url: Url,
    ) -> Result<()> {
        self.report(CompletionReport::Availability {
            request_id,
            result: Ok(cached_url),
        })
        .await
    }

    pub async fn availability_failed(
        &self,
        request_id: RequestId,
        cause: impl Into<String>,
    ) -> Result<()> {
        self.report(CompletionReport::Availability {
            request_id,
            result: Err(cause.into()),
        })
        .await
    }

    async fn report(&self, report: CompletionReport) -> Result<()> {
        if report.kind() != self.kind {
            return Err(StorageError::InvalidRequest(format!(
                "{} job {} cannot report a {} result",
                self.kind,
                self.job_id,
                report.kind()
            )));
        }
        self.reported.lock().await.insert(report.request_id());
        self.sink.send(report).await.map_err(|_| {
            StorageError::Internal("completion channel closed".into())
        })
    }

    /// Fails every member the job never reported on.
    pub(crate) async fn fail_unreported(
        &self,
        members: &[RequestId],
        cause: &str,
    ) {
        let missing: Vec<RequestId> = {
            let reported = self.reported.lock().await;
            members
                .iter()
                .filter(|id| !reported.contains(id))
                .copied()
                .collect()
        };
        for request_id in missing {
            let Some(report) =
                CompletionReport::failure(self.kind, request_id, cause)
            else {
                continue;
            };
            if let Err(err) = self.report(report).await {
                warn!(job = %self.job_id, request = %request_id, error = %err, "could not fail unreported request");
            }
        }
    }
}

/// Applies request results to the store, the catalog and the groups.
#[derive(Clone)]
pub struct CompletionHandler {
    requests: Arc<dyn RequestRepository>,
    references: Arc<dyn ReferenceRepository>,
    tracker: GroupTracker,
    publisher: Arc<dyn LifecyclePublisher>,
    locks: ChecksumLocks,
    copies: CopyFlow,
}

impl fmt::Debug for CompletionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandler")
            .field("locks", &self.locks)
            .field("copies", &self.copies)
            .finish_non_exhaustive()
    }
}

impl CompletionHandler {
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        references: Arc<dyn ReferenceRepository>,
        tracker: GroupTracker,
        publisher: Arc<dyn LifecyclePublisher>,
        locks: ChecksumLocks,
        copies: CopyFlow,
    ) -> Self {
        Self {
            requests,
            references,
            tracker,
            publisher,
            locks,
            copies,
        }
    }

    /// Applies one report. Duplicate and late reports are ignored.
    pub async fn handle(&self, report: CompletionReport) -> Result<()> {
        let request_id = report.request_id();
        let Some((request, _guard)) = self.locked_reread(request_id).await?
        else {
            debug!(request = %request_id, "report for unknown request ignored");
            return Ok(());
        };
        if request.status != RequestStatus::Pending {
            debug!(
                request = %request_id,
                status = %request.status,
                "report for request that is not pending ignored"
            );
            return Ok(());
        }
        if request.kind() != report.kind() {
            warn!(
                request = %request_id,
                expected = %request.kind(),
                reported = %report.kind(),
                "report kind does not match request"
            );
            return Ok(());
        }

        match report {
            CompletionReport::Storage { result: Ok(stored), .. } => {
                self.storage_succeeded_locked(request, stored).await
            }
            CompletionReport::Deletion { result: Ok(()), .. } => {
                self.deletion_succeeded_locked(request).await
            }
            CompletionReport::Availability { result: Ok(url), .. } => {
                self.availability_succeeded_locked(request, url).await
            }
            CompletionReport::Storage { result: Err(cause), .. }
            | CompletionReport::Deletion { result: Err(cause), .. }
            | CompletionReport::Availability { result: Err(cause), .. } => {
                self.fail_locked(request, &cause).await
            }
        }
    }

    /// Fails requests that never reached a backend job, or whose job could
    /// not be started. Resolved requests are left alone.
    pub async fn fail_requests(
        &self,
        request_ids: &[RequestId],
        cause: &str,
    ) -> Result<()> {
        for request_id in request_ids {
            let Some((request, _guard)) = self.locked_reread(*request_id).await?
            else {
                continue;
            };
            if request.status == RequestStatus::Error {
                continue;
            }
            self.fail_locked(request, cause).await?;
        }
        Ok(())
    }

    /// Resolves the source of a TO_DO copy and moves it to PENDING, or
    /// settles it right away.
    pub async fn start_copy(&self, request_id: RequestId) -> Result<()> {
        let Some((copy, _guard)) = self.locked_reread(request_id).await? else {
            return Ok(());
        };
        if copy.status != RequestStatus::ToDo || copy.kind() != RequestKind::Copy {
            return Ok(());
        }

        match self.copies.plan(&copy).await? {
            CopyPlan::NoSource => {
                self.fail_copy_locked(copy, CAUSE_NO_COPY_SOURCE).await
            }
            CopyPlan::Forward { source } => {
                let admission = self
                    .copies
                    .forward_locked(&copy, source.url.clone(), &source)
                    .await?;
                self.apply_forward_locked(copy, &source.storage_id, admission)
                    .await
            }
            CopyPlan::Cache { source } => {
                let (cache_group, admission) =
                    self.copies.request_cache_locked(&copy).await?;
                match admission {
                    Admission::Created(_) | Admission::Merged(_) => {
                        let mut copy = copy;
                        if let Some(details) = copy.copy_details_mut() {
                            details.source_storage_id =
                                Some(source.storage_id.clone());
                            details.cache_group_id = Some(cache_group);
                        }
                        copy.set_status(RequestStatus::Pending);
                        self.requests.update(&copy).await?;
                        debug!(
                            checksum = %copy.checksum,
                            source = %source.storage_id,
                            "copy waiting for nearline source"
                        );
                        Ok(())
                    }
                    Admission::Satisfied(Some(readable)) => {
                        let admission = self
                            .copies
                            .forward_locked(&copy, readable.url.clone(), &readable)
                            .await?;
                        self.apply_forward_locked(
                            copy,
                            &readable.storage_id,
                            admission,
                        )
                        .await
                    }
                    Admission::Satisfied(None) => {
                        self.fail_copy_locked(copy, CAUSE_NO_COPY_SOURCE).await
                    }
                    Admission::Delayed(_) => {
                        self.fail_copy_locked(
                            copy,
                            "source restore could not be scheduled",
                        )
                        .await
                    }
                    Admission::Conflict(cause) | Admission::Rejected(cause) => {
                        self.fail_copy_locked(copy, &cause).await
                    }
                }
            }
        }
    }

    /// Re-evaluates DELAYED requests once a deletion on the key resolved.
    pub async fn release_delayed(
        &self,
        checksum: &Checksum,
        storage_id: &StorageId,
    ) -> Result<()> {
        let _guard = self.locks.lock(checksum).await;
        self.release_delayed_locked(checksum, storage_id).await
    }

    async fn locked_reread(
        &self,
        request_id: RequestId,
    ) -> Result<Option<(FileRequest, ChecksumGuard)>> {
        let Some(request) = self.requests.find_by_id(request_id).await? else {
            return Ok(None);
        };
        let guard = self.locks.lock(&request.checksum).await;
        // The row may have changed while we waited for the lock.
        Ok(self
            .requests
            .find_by_id(request_id)
            .await?
            .map(|request| (request, guard)))
    }

    async fn storage_succeeded_locked(
        &self,
        request: FileRequest,
        stored: StoredFile,
    ) -> Result<()> {
        let details = request.storage_details().ok_or_else(|| {
            StorageError::Internal(format!(
                "request {} is not a storage request",
                request.id
            ))
        })?;

        let mut reference = match self
            .references
            .find(&request.checksum, &request.storage_id)
            .await?
        {
            Some(existing) => existing,
            None => {
                let mut metadata = details.metadata.clone();
                if metadata.size.is_none() {
                    metadata.size = stored.size;
                }
                FileReference::new(
                    request.checksum.clone(),
                    request.storage_id.clone(),
                    metadata,
                    stored.url.clone(),
                )
            }
        };
        reference.add_owners(&request.owners);
        self.tracker
            .append_for_request(
                &request,
                Outcome::success(
                    request.checksum.clone(),
                    request.storage_id.clone(),
                    Some(reference.clone()),
                ),
            )
            .await?;
        self.references.upsert(&reference).await?;
        self.requests.delete(request.id).await?;

        info!(
            checksum = %request.checksum,
            storage = %request.storage_id,
            url = %reference.url,
            "file stored"
        );
        notify(
            self.publisher.as_ref(),
            FileEvent::for_request(FileEventKind::StoreSuccess, &request)
                .with_url(reference.url.clone()),
        )
        .await;
        self.tracker.settle_request(&request).await?;
        self.settle_copies_locked(
            &request.checksum,
            &request.storage_id,
            Ok(&reference),
        )
        .await
    }

    async fn deletion_succeeded_locked(&self, request: FileRequest) -> Result<()> {
        self.tracker
            .append_for_request(
                &request,
                Outcome::success(
                    request.checksum.clone(),
                    request.storage_id.clone(),
                    None,
                ),
            )
            .await?;
        self.references
            .delete(&request.checksum, &request.storage_id)
            .await?;
        self.requests.delete(request.id).await?;

        info!(
            checksum = %request.checksum,
            storage = %request.storage_id,
            "file deleted"
        );
        notify(
            self.publisher.as_ref(),
            FileEvent::for_request(FileEventKind::DeletionSuccess, &request),
        )
        .await;
        self.tracker.settle_request(&request).await?;
        self.release_delayed_locked(&request.checksum, &request.storage_id)
            .await
    }

    async fn availability_succeeded_locked(
        &self,
        mut request: FileRequest,
        cached_url: Url,
    ) -> Result<()> {
        if let Some(details) = request.availability_details_mut() {
            details.cached_url = Some(cached_url.clone());
        }
        let source = self
            .references
            .find(&request.checksum, &request.storage_id)
            .await?;
        self.tracker
            .append_for_request(
                &request,
                Outcome::success(
                    request.checksum.clone(),
                    request.storage_id.clone(),
                    source.clone(),
                ),
            )
            .await?;
        self.requests.delete(request.id).await?;

        info!(
            checksum = %request.checksum,
            storage = %request.storage_id,
            url = %cached_url,
            "file available"
        );
        notify(
            self.publisher.as_ref(),
            FileEvent::for_request(FileEventKind::Available, &request)
                .with_url(cached_url.clone()),
        )
        .await;
        self.tracker.settle_request(&request).await?;

        for copy in self.copies_waiting_on(&request).await? {
            match &source {
                Some(source) => {
                    let admission = self
                        .copies
                        .forward_locked(&copy, cached_url.clone(), source)
                        .await?;
                    self.apply_forward_locked(copy, &source.storage_id, admission)
                        .await?;
                }
                None => {
                    self.fail_copy_locked(
                        copy,
                        "source reference vanished during restore",
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn fail_locked(&self, request: FileRequest, cause: &str) -> Result<()> {
        match request.kind() {
            RequestKind::Storage => self.fail_storage_locked(request, cause).await,
            RequestKind::Deletion if request.is_forced_deletion() => {
                self.force_deletion_locked(request, cause).await
            }
            RequestKind::Deletion => self.fail_deletion_locked(request, cause).await,
            RequestKind::Copy => self.fail_copy_locked(request, cause).await,
            RequestKind::Availability => {
                self.fail_availability_locked(request, cause).await
            }
        }
    }

    async fn fail_storage_locked(
        &self,
        mut request: FileRequest,
        cause: &str,
    ) -> Result<()> {
        self.persist_failure(&mut request, FileEventKind::StoreError, cause)
            .await?;
        self.settle_copies_locked(
            &request.checksum,
            &request.storage_id,
            Err(cause),
        )
        .await
    }

    async fn fail_deletion_locked(
        &self,
        mut request: FileRequest,
        cause: &str,
    ) -> Result<()> {
        self.persist_failure(&mut request, FileEventKind::DeletionError, cause)
            .await?;
        self.release_delayed_locked(&request.checksum, &request.storage_id)
            .await
    }

    /// A forced deletion that failed still drops the reference.
    async fn force_deletion_locked(
        &self,
        request: FileRequest,
        cause: &str,
    ) -> Result<()> {
        self.tracker
            .append_for_request(
                &request,
                Outcome::success(
                    request.checksum.clone(),
                    request.storage_id.clone(),
                    None,
                ),
            )
            .await?;
        self.references
            .delete(&request.checksum, &request.storage_id)
            .await?;
        self.requests.delete(request.id).await?;

        warn!(
            checksum = %request.checksum,
            storage = %request.storage_id,
            %cause,
            "forced deletion failed, reference removed anyway"
        );
        notify(
            self.publisher.as_ref(),
            FileEvent::for_request(FileEventKind::DeletionError, &request)
                .with_cause(cause),
        )
        .await;
        self.tracker.settle_request(&request).await?;
        self.release_delayed_locked(&request.checksum, &request.storage_id)
            .await
    }

    async fn fail_copy_locked(
        &self,
        mut request: FileRequest,
        cause: &str,
    ) -> Result<()> {
        self.persist_failure(&mut request, FileEventKind::CopyError, cause)
            .await
    }

    async fn fail_availability_locked(
        &self,
        mut request: FileRequest,
        cause: &str,
    ) -> Result<()> {
        self.persist_failure(&mut request, FileEventKind::AvailabilityError, cause)
            .await?;
        for copy in self.copies_waiting_on(&request).await? {
            self.fail_copy_locked(copy, &format!("source restore failed: {cause}"))
                .await?;
        }
        Ok(())
    }

    async fn persist_failure(
        &self,
        request: &mut FileRequest,
        event: FileEventKind,
        cause: &str,
    ) -> Result<()> {
        self.tracker
            .append_for_request(
                request,
                Outcome::failure(
                    request.checksum.clone(),
                    request.storage_id.clone(),
                    cause,
                ),
            )
            .await?;
        request.fail(cause);
        self.requests.update(request).await?;

        warn!(
            kind = %request.kind(),
            checksum = %request.checksum,
            storage = %request.storage_id,
            %cause,
            "request failed"
        );
        notify(
            self.publisher.as_ref(),
            FileEvent::for_request(event, request).with_cause(cause),
        )
        .await;
        self.tracker.settle_request(request).await
    }

    /// Applies the destination admission of a forwarded copy.
    async fn apply_forward_locked(
        &self,
        mut copy: FileRequest,
        source_storage_id: &StorageId,
        admission: Admission,
    ) -> Result<()> {
        match admission {
            Admission::Created(_) | Admission::Merged(_) | Admission::Delayed(_) => {
                if let Some(details) = copy.copy_details_mut() {
                    details.source_storage_id = Some(source_storage_id.clone());
                }
                copy.set_status(RequestStatus::Pending);
                self.requests.update(&copy).await?;
                debug!(
                    checksum = %copy.checksum,
                    source = %source_storage_id,
                    destination = %copy.storage_id,
                    "copy forwarded to destination storage"
                );
                Ok(())
            }
            Admission::Satisfied(reference) => {
                self.copy_succeeded_locked(copy, reference).await
            }
            Admission::Conflict(cause) | Admission::Rejected(cause) => {
                self.fail_copy_locked(copy, &cause).await
            }
        }
    }

    async fn copy_succeeded_locked(
        &self,
        request: FileRequest,
        reference: Option<FileReference>,
    ) -> Result<()> {
        let mut event = FileEvent::for_request(FileEventKind::CopySuccess, &request);
        if let Some(reference) = &reference {
            event = event.with_url(reference.url.clone());
        }
        self.tracker
            .append_for_request(
                &request,
                Outcome::success(
                    request.checksum.clone(),
                    request.storage_id.clone(),
                    reference,
                ),
            )
            .await?;
        self.requests.delete(request.id).await?;
        info!(
            checksum = %request.checksum,
            destination = %request.storage_id,
            "file copied"
        );
        notify(self.publisher.as_ref(), event).await;
        self.tracker.settle_request(&request).await
    }

    /// Completes the PENDING copies whose destination storage request just
    /// resolved.
    async fn settle_copies_locked(
        &self,
        checksum: &Checksum,
        destination: &StorageId,
        result: std::result::Result<&FileReference, &str>,
    ) -> Result<()> {
        let Some(copy) = self
            .requests
            .find_by_key(RequestKind::Copy, checksum, destination)
            .await?
            .filter(|c| c.status == RequestStatus::Pending)
        else {
            return Ok(());
        };
        match result {
            Ok(reference) => {
                self.copy_succeeded_locked(copy, Some(reference.clone())).await
            }
            Err(cause) => self.fail_copy_locked(copy, cause).await,
        }
    }

    /// PENDING copies linked to `availability` through their cache group.
    async fn copies_waiting_on(
        &self,
        availability: &FileRequest,
    ) -> Result<Vec<FileRequest>> {
        Ok(self
            .requests
            .find_by_checksum(RequestKind::Copy, &availability.checksum)
            .await?
            .into_iter()
            .filter(|copy| {
                copy.status == RequestStatus::Pending
                    && matches!(
                        copy.copy_details(),
                        Some(CopyDetails { cache_group_id: Some(group), .. })
                            if availability.group_ids.contains(group)
                    )
            })
            .collect())
    }

    async fn release_delayed_locked(
        &self,
        checksum: &Checksum,
        storage_id: &StorageId,
    ) -> Result<()> {
        let reference = self.references.find(checksum, storage_id).await?;

        if let Some(mut store) = self
            .requests
            .find_by_key(RequestKind::Storage, checksum, storage_id)
            .await?
            .filter(|r| r.status == RequestStatus::Delayed)
        {
            match &reference {
                Some(reference) => {
                    let mut reference = reference.clone();
                    reference.add_owners(&store.owners);
                    self.tracker
                        .append_for_request(
                            &store,
                            Outcome::success(
                                checksum.clone(),
                                storage_id.clone(),
                                Some(reference.clone()),
                            ),
                        )
                        .await?;
                    self.drop_idle_deletion(checksum, storage_id).await?;
                    self.references.upsert(&reference).await?;
                    self.requests.delete(store.id).await?;
                    debug!(%checksum, storage = %storage_id, "delayed store satisfied by surviving reference");
                    notify(
                        self.publisher.as_ref(),
                        FileEvent::for_request(FileEventKind::StoreSuccess, &store)
                            .with_url(reference.url.clone()),
                    )
                    .await;
                    self.tracker.settle_request(&store).await?;
                    self.settle_copies_locked(checksum, storage_id, Ok(&reference))
                        .await?;
                }
                None => {
                    store.set_status(RequestStatus::ToDo);
                    self.requests.update(&store).await?;
                    debug!(%checksum, storage = %storage_id, "delayed store released");
                }
            }
        }

        if let Some(mut copy) = self
            .requests
            .find_by_key(RequestKind::Copy, checksum, storage_id)
            .await?
            .filter(|r| r.status == RequestStatus::Delayed)
        {
            let reference = self.references.find(checksum, storage_id).await?;
            let idle_deletion = self
                .requests
                .find_by_key(RequestKind::Deletion, checksum, storage_id)
                .await?
                .is_some();
            match reference {
                Some(reference) if !idle_deletion => {
                    self.copy_succeeded_locked(copy, Some(reference)).await?;
                }
                _ => {
                    copy.set_status(RequestStatus::ToDo);
                    self.requests.update(&copy).await?;
                    debug!(%checksum, storage = %storage_id, "delayed copy released");
                }
            }
        }
        Ok(())
    }

    /// Removes a deletion that is not running because the key gained an
    /// owner again.
    async fn drop_idle_deletion(
        &self,
        checksum: &Checksum,
        storage_id: &StorageId,
    ) -> Result<()> {
        if let Some(deletion) = self
            .requests
            .find_by_key(RequestKind::Deletion, checksum, storage_id)
            .await?
            .filter(|d| d.status != RequestStatus::Pending)
        {
            self.requests.delete(deletion.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_rejects_reports_of_another_kind() {
        let (tx, _rx) = mpsc::channel(4);
        let progress = JobProgress::new(JobId::new(), RequestKind::Deletion, tx);
        let err = progress
            .storage_failed(RequestId::new(), "boom")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unreported_members_are_failed_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let progress = JobProgress::new(JobId::new(), RequestKind::Storage, tx);
        let done = RequestId::new();
        let forgotten = RequestId::new();

        progress
            .storage_succeeded(done, Url::parse("file:///a").unwrap(), Some(1))
            .await
            .unwrap();
        progress.fail_unreported(&[done, forgotten], CAUSE_UNREPORTED).await;
        drop(progress);

        let mut reports = Vec::new();
        while let Some(report) = rx.recv().await {
            reports.push(report);
        }
        assert_eq!(reports.len(), 2);
        assert_eq!(
            reports[1],
            CompletionReport::Storage {
                request_id: forgotten,
                result: Err(CAUSE_UNREPORTED.to_string()),
            }
        );
    }

    #[test]
    fn copies_have_no_failure_report() {
        assert!(
            CompletionReport::failure(RequestKind::Copy, RequestId::new(), "x")
                .is_none()
        );
    }
}
