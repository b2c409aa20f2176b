//! Facade wiring the orchestration components into one engine per tenant.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use stowage_model::{
    AvailabilityRequestItem, Checksum, CopyRequestItem, DeletionRequestItem,
    FileEvent, FileEventKind, FileReference, GroupId, OwnerId, Outcome,
    RequestBatch, RequestKind, RequestStatus, StorageId, StorageRequestItem,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::BackendRegistry;
use crate::config::EngineConfig;
use crate::error::{Result, StorageError};
use crate::orchestration::{
    Admission, AvailabilityDraft, BackendDispatcher, ChecksumLocks,
    CompletionHandler, CompletionReceiver, CompletionReport, CompletionSender,
    CopyDraft, CopyFlow, DeduplicationGate, DeletionDraft, DispatchReport,
    GroupTracker, InProcEventBus, JobExecutor, JobScheduler, LifecyclePublisher,
    StorageDraft, TokioJobExecutor, notify,
};
use crate::repository::{
    GroupRepository, InMemoryGroupRepository, InMemoryReferenceRepository,
    InMemoryRequestRepository, ReferenceRepository, RequestRepository,
    RetryFilter,
};

pub const CAUSE_EMPTY_BATCH: &str = "empty request batch";

/// Immediate answer to a batch submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupAck {
    Granted { count: usize },
    Denied { cause: String },
}

/// The three stores the engine persists to.
#[derive(Clone)]
pub struct Stores {
    pub requests: Arc<dyn RequestRepository>,
    pub references: Arc<dyn ReferenceRepository>,
    pub groups: Arc<dyn GroupRepository>,
}

impl fmt::Debug for Stores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            requests: Arc::new(InMemoryRequestRepository::new()),
            references: Arc::new(InMemoryReferenceRepository::new()),
            groups: Arc::new(InMemoryGroupRepository::new()),
        }
    }
}

/// Aggregate of one dispatch cycle across every request kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub per_kind: BTreeMap<RequestKind, DispatchReport>,
    /// Kinds whose dispatch returned an error.
    pub failed_kinds: Vec<RequestKind>,
}

impl CycleReport {
    pub fn job_count(&self) -> usize {
        self.per_kind.values().map(|r| r.jobs.len()).sum()
    }
}

/// One admission unit, derived from a batch item.
#[derive(Clone, Debug)]
enum Draft {
    Storage(StorageDraft),
    Deletion(DeletionDraft),
    Copy(CopyDraft),
    Availability(AvailabilityDraft),
}

impl Draft {
    fn checksum(&self) -> &Checksum {
        match self {
            Draft::Storage(d) => &d.checksum,
            Draft::Deletion(d) => &d.checksum,
            Draft::Copy(d) => &d.checksum,
            Draft::Availability(d) => &d.checksum,
        }
    }

    fn storage_id(&self) -> Option<&StorageId> {
        match self {
            Draft::Storage(d) => Some(&d.storage_id),
            Draft::Deletion(d) => Some(&d.storage_id),
            Draft::Copy(d) => Some(&d.storage_id),
            Draft::Availability(_) => None,
        }
    }

    fn owners(&self) -> BTreeSet<OwnerId> {
        match self {
            Draft::Storage(d) => d.owners.clone(),
            Draft::Deletion(d) => BTreeSet::from([d.owner.clone()]),
            Draft::Copy(_) | Draft::Availability(_) => BTreeSet::new(),
        }
    }
}

fn success_event(kind: RequestKind) -> FileEventKind {
    match kind {
        RequestKind::Storage => FileEventKind::StoreSuccess,
        RequestKind::Deletion => FileEventKind::DeletionSuccess,
        RequestKind::Copy => FileEventKind::CopySuccess,
        RequestKind::Availability => FileEventKind::Available,
    }
}

fn error_event(kind: RequestKind) -> FileEventKind {
    match kind {
        RequestKind::Storage => FileEventKind::StoreError,
        RequestKind::Deletion => FileEventKind::DeletionError,
        RequestKind::Copy => FileEventKind::CopyError,
        RequestKind::Availability => FileEventKind::AvailabilityError,
    }
}

/// File lifecycle engine: accepts request batches, dispatches them to
/// backends and turns backend results into catalog changes and events.
pub struct StorageEngine {
    config: EngineConfig,
    requests: Arc<dyn RequestRepository>,
    references: Arc<dyn ReferenceRepository>,
    registry: Arc<BackendRegistry>,
    publisher: Arc<dyn LifecyclePublisher>,
    event_bus: Option<Arc<InProcEventBus>>,
    locks: ChecksumLocks,
    tracker: GroupTracker,
    gate: DeduplicationGate,
    handler: CompletionHandler,
    dispatcher: BackendDispatcher,
    completions_tx: CompletionSender,
    completions_rx: Mutex<Option<CompletionReceiver>>,
}

impl fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_started = self
            .completions_rx
            .try_lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true);
        f.debug_struct("StorageEngine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("event_bus", &self.event_bus)
            .field("locks", &self.locks)
            .field("completion_worker_started", &worker_started)
            .finish()
    }
}

impl StorageEngine {
    pub fn builder(config: EngineConfig) -> StorageEngineBuilder {
        StorageEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<BackendRegistry> {
        Arc::clone(&self.registry)
    }

    /// The built-in bus, when the engine was built without a publisher.
    pub fn event_bus(&self) -> Option<Arc<InProcEventBus>> {
        self.event_bus.clone()
    }

    /// Sender for results arriving from outside a [`crate::JobProgress`],
    /// e.g. a callback from another process.
    pub fn completion_sender(&self) -> CompletionSender {
        self.completions_tx.clone()
    }

    pub async fn submit_storage(
        &self,
        batch: RequestBatch<StorageRequestItem>,
    ) -> Result<GroupAck> {
        let RequestBatch { group_id, items } = batch;
        let mut drafts = Vec::with_capacity(items.len());
        for item in items {
            if let Err(err) = item.validate() {
                return self
                    .deny(&group_id, RequestKind::Storage, err.to_string())
                    .await;
            }
            drafts.push(Draft::Storage(StorageDraft {
                metadata: item.metadata(),
                checksum: item.checksum,
                storage_id: item.storage_id,
                origin_url: item.origin_url,
                sub_directory: item.sub_directory,
                owners: BTreeSet::from([item.owner]),
                group_ids: BTreeSet::from([group_id.clone()]),
            }));
        }
        self.admit_batch(RequestKind::Storage, &group_id, drafts).await
    }

    pub async fn submit_deletion(
        &self,
        batch: RequestBatch<DeletionRequestItem>,
    ) -> Result<GroupAck> {
        let RequestBatch { group_id, items } = batch;
        let drafts = items
            .into_iter()
            .map(|item| {
                Draft::Deletion(DeletionDraft {
                    checksum: item.checksum,
                    storage_id: item.storage_id,
                    owner: item.owner,
                    force_delete: item.force_delete,
                    group_ids: BTreeSet::from([group_id.clone()]),
                })
            })
            .collect();
        self.admit_batch(RequestKind::Deletion, &group_id, drafts).await
    }

    pub async fn submit_copy(
        &self,
        batch: RequestBatch<CopyRequestItem>,
    ) -> Result<GroupAck> {
        let RequestBatch { group_id, items } = batch;
        let drafts = items
            .into_iter()
            .map(|item| {
                Draft::Copy(CopyDraft {
                    checksum: item.checksum,
                    storage_id: item.storage_id,
                    sub_directory: item.sub_directory,
                    group_ids: BTreeSet::from([group_id.clone()]),
                })
            })
            .collect();
        self.admit_batch(RequestKind::Copy, &group_id, drafts).await
    }

    pub async fn submit_availability(
        &self,
        batch: RequestBatch<AvailabilityRequestItem>,
    ) -> Result<GroupAck> {
        let RequestBatch { group_id, items } = batch;
        let mut drafts = Vec::new();
        for item in items {
            if item.availability_hours == 0 {
                return self
                    .deny(
                        &group_id,
                        RequestKind::Availability,
                        "availability window must be at least one hour",
                    )
                    .await;
            }
            for checksum in item.checksums {
                drafts.push(Draft::Availability(AvailabilityDraft {
                    checksum,
                    availability_hours: item.availability_hours,
                    group_ids: BTreeSet::from([group_id.clone()]),
                }));
            }
        }
        self.admit_batch(RequestKind::Availability, &group_id, drafts)
            .await
    }

    /// Dispatches every `status` request of `kind` at one storage id.
    pub async fn dispatch(
        &self,
        kind: RequestKind,
        storage_id: &StorageId,
        status: RequestStatus,
    ) -> Result<DispatchReport> {
        self.dispatcher.dispatch(kind, storage_id, status).await
    }

    pub async fn dispatch_all(&self, kind: RequestKind) -> Result<DispatchReport> {
        self.dispatcher.dispatch_all(kind).await
    }

    /// Dispatches every request kind in order. A failing kind is logged and
    /// does not stop the others.
    pub async fn run_dispatch_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        for kind in RequestKind::all_kinds() {
            match self.dispatcher.dispatch_all(*kind).await {
                Ok(outcome) => {
                    report.per_kind.insert(*kind, outcome);
                }
                Err(err) => {
                    error!(%kind, error = %err, "dispatch of request kind failed");
                    report.failed_kinds.push(*kind);
                }
            }
        }
        self.locks.prune();
        report
    }

    pub async fn handle_completion(&self, report: CompletionReport) -> Result<()> {
        self.handler.handle(report).await
    }

    /// Consumes completion reports until `shutdown` fires. Can be started
    /// once per engine.
    pub async fn start_completion_worker(
        &self,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mut receiver = self.completions_rx.lock().await.take().ok_or_else(|| {
            StorageError::Conflict("completion worker already started".into())
        })?;
        let handler = self.handler.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("completion worker shutting down");
                        break;
                    }
                    report = receiver.recv() => {
                        let Some(report) = report else { break };
                        let request_id = report.request_id();
                        if let Err(err) = handler.handle(report).await {
                            error!(request = %request_id, error = %err, "failed to apply completion report");
                        }
                    }
                }
            }
        }))
    }

    /// ERROR → TO_DO for the requests of `kind` in `group_id`.
    pub async fn retry_group(
        &self,
        kind: RequestKind,
        group_id: &GroupId,
    ) -> Result<usize> {
        self.retry(kind, RetryFilter::Group(group_id.clone())).await
    }

    /// ERROR → TO_DO for the requests of `kind` held by any of `owners`.
    pub async fn retry_owners(
        &self,
        kind: RequestKind,
        owners: BTreeSet<OwnerId>,
    ) -> Result<usize> {
        self.retry(kind, RetryFilter::Owners(owners)).await
    }

    /// Purges requests of `kind` in `status`. In-flight requests cannot be
    /// purged.
    pub async fn delete_requests(
        &self,
        kind: RequestKind,
        status: RequestStatus,
    ) -> Result<usize> {
        if status == RequestStatus::Pending {
            return Err(StorageError::InvalidRequest(
                "pending requests cannot be purged".into(),
            ));
        }
        let removed = self.requests.delete_by_status(kind, status).await?;
        let groups: BTreeSet<GroupId> = removed
            .iter()
            .flat_map(|r| r.group_ids.iter().cloned())
            .collect();
        if kind == RequestKind::Deletion {
            for deletion in &removed {
                self.handler
                    .release_delayed(&deletion.checksum, &deletion.storage_id)
                    .await?;
            }
        }
        for group_id in &groups {
            self.tracker.check_done(group_id, kind).await?;
        }
        info!(%kind, %status, count = removed.len(), "requests purged");
        Ok(removed.len())
    }

    pub async fn references_of(
        &self,
        checksum: &Checksum,
    ) -> Result<Vec<FileReference>> {
        self.references.find_by_checksum(checksum).await
    }

    pub async fn request_counts(
        &self,
        kind: RequestKind,
    ) -> Result<BTreeMap<RequestStatus, usize>> {
        self.requests.count_by_status(kind).await
    }

    async fn retry(&self, kind: RequestKind, filter: RetryFilter) -> Result<usize> {
        let reset = self.requests.reset_errors(kind, &filter).await?;
        let groups: BTreeSet<GroupId> = reset
            .iter()
            .flat_map(|r| r.group_ids.iter().cloned())
            .collect();
        for group_id in &groups {
            self.tracker.reopen(group_id, kind).await?;
            self.tracker.seal(group_id, kind).await?;
        }
        info!(%kind, count = reset.len(), groups = groups.len(), "errored requests reset");
        Ok(reset.len())
    }

    async fn deny(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
        cause: impl Into<String>,
    ) -> Result<GroupAck> {
        let cause = cause.into();
        self.tracker.denied(group_id, kind, cause.clone()).await?;
        Ok(GroupAck::Denied { cause })
    }

    async fn admit_batch(
        &self,
        kind: RequestKind,
        group_id: &GroupId,
        drafts: Vec<Draft>,
    ) -> Result<GroupAck> {
        if drafts.is_empty() {
            return self.deny(group_id, kind, CAUSE_EMPTY_BATCH).await;
        }
        let count = drafts.len();
        self.tracker.granted(group_id, kind, count).await?;

        for draft in drafts {
            let admitted = match draft.clone() {
                Draft::Storage(d) => self.gate.admit_storage(d).await,
                Draft::Deletion(d) => self.gate.admit_deletion(d).await,
                Draft::Copy(d) => self.gate.admit_copy(d).await,
                Draft::Availability(d) => self.gate.admit_availability(d).await,
            };
            let admission = match admitted {
                Ok(admission) => admission,
                Err(err) => {
                    error!(
                        group = %group_id,
                        checksum = %draft.checksum(),
                        error = %err,
                        "admission failed"
                    );
                    Admission::Rejected(err.to_string())
                }
            };
            self.settle_admission(kind, group_id, &draft, admission).await?;
        }

        self.tracker.seal(group_id, kind).await?;
        Ok(GroupAck::Granted { count })
    }

    /// Records the outcome of admissions that resolved without new work.
    async fn settle_admission(
        &self,
        kind: RequestKind,
        group_id: &GroupId,
        draft: &Draft,
        admission: Admission,
    ) -> Result<()> {
        let checksum = draft.checksum().clone();
        match admission {
            Admission::Created(id)
            | Admission::Merged(id)
            | Admission::Delayed(id) => {
                debug!(group = %group_id, %kind, request = %id, ?admission, "request admitted");
            }
            Admission::Satisfied(reference) => {
                let storage_id = reference
                    .as_ref()
                    .map(|r| r.storage_id.clone())
                    .or_else(|| draft.storage_id().cloned());
                let Some(storage_id) = storage_id else {
                    return Ok(());
                };
                let mut event =
                    FileEvent::new(success_event(kind), checksum.clone(), storage_id.clone())
                        .with_owners(draft.owners())
                        .with_groups([group_id.clone()]);
                if let Some(reference) = &reference {
                    event = event.with_url(reference.url.clone());
                }
                notify(self.publisher.as_ref(), event).await;
                self.tracker
                    .record_outcome(
                        group_id,
                        kind,
                        Outcome::success(checksum, storage_id, reference),
                    )
                    .await?;
            }
            Admission::Conflict(cause) | Admission::Rejected(cause) => {
                warn!(group = %group_id, %kind, %checksum, %cause, "request refused at admission");
                let outcome = match draft.storage_id() {
                    Some(storage_id) => {
                        notify(
                            self.publisher.as_ref(),
                            FileEvent::new(
                                error_event(kind),
                                checksum.clone(),
                                storage_id.clone(),
                            )
                            .with_owners(draft.owners())
                            .with_groups([group_id.clone()])
                            .with_cause(cause.clone()),
                        )
                        .await;
                        Outcome::failure(checksum, storage_id.clone(), cause)
                    }
                    None => Outcome::unplaced_failure(checksum, cause),
                };
                self.tracker.record_outcome(group_id, kind, outcome).await?;
            }
        }
        Ok(())
    }
}

/// Wires an engine from its ports; unset ports default to in-process
/// adapters.
pub struct StorageEngineBuilder {
    config: EngineConfig,
    stores: Option<Stores>,
    registry: Option<Arc<BackendRegistry>>,
    publisher: Option<Arc<dyn LifecyclePublisher>>,
    executor: Option<Arc<dyn JobExecutor>>,
}

impl fmt::Debug for StorageEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageEngineBuilder")
            .field("config", &self.config)
            .field("stores", &self.stores.is_some())
            .field("registry", &self.registry)
            .field("publisher", &self.publisher.is_some())
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

impl StorageEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            stores: None,
            registry: None,
            publisher: None,
            executor: None,
        }
    }

    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn registry(mut self, registry: Arc<BackendRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn LifecyclePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<StorageEngine> {
        self.config.validate()?;
        let Stores {
            requests,
            references,
            groups,
        } = self.stores.unwrap_or_else(Stores::in_memory);
        let registry = self.registry.unwrap_or_default();
        let (publisher, event_bus) = match self.publisher {
            Some(publisher) => (publisher, None),
            None => {
                let bus = Arc::new(InProcEventBus::new(
                    self.config.events.channel_capacity,
                ));
                (bus.clone() as Arc<dyn LifecyclePublisher>, Some(bus))
            }
        };
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(TokioJobExecutor::new()));

        let locks = ChecksumLocks::new();
        let tracker =
            GroupTracker::new(groups, Arc::clone(&requests), Arc::clone(&publisher));
        let gate = DeduplicationGate::new(
            Arc::clone(&requests),
            Arc::clone(&references),
            Arc::clone(&registry),
            tracker.clone(),
            Arc::clone(&publisher),
            locks.clone(),
        );
        let copies = CopyFlow::new(
            Arc::clone(&references),
            Arc::clone(&registry),
            gate.clone(),
        );
        let handler = CompletionHandler::new(
            Arc::clone(&requests),
            Arc::clone(&references),
            tracker.clone(),
            Arc::clone(&publisher),
            locks.clone(),
            copies,
        );
        let (completions_tx, completions_rx) =
            mpsc::channel(self.config.completion.channel_capacity.max(1));
        let scheduler = JobScheduler::new(
            Arc::clone(&requests),
            executor,
            completions_tx.clone(),
            handler.clone(),
        );
        let dispatcher = BackendDispatcher::new(
            Arc::clone(&requests),
            Arc::clone(&registry),
            scheduler,
            handler.clone(),
            self.config.dispatch.page_size,
        );

        Ok(StorageEngine {
            config: self.config,
            requests,
            references,
            registry,
            publisher,
            event_bus,
            locks,
            tracker,
            gate,
            handler,
            dispatcher,
            completions_tx,
            completions_rx: Mutex::new(Some(completions_rx)),
        })
    }
}
