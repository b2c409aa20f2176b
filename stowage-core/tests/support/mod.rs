//! Shared harness for engine integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use stowage_core::backend::{BackendKind, StorageBackend, WorkingSubset};
use stowage_core::model::{
    Checksum, CopyRequestItem, DeletionRequestItem, FileEvent, FileEventKind,
    FileRequest, GroupEvent, GroupId, JobId, LifecycleEvent, Outcome, OwnerId,
    RequestBatch, RequestId, RequestKind, RequestStatus, StorageId,
    StorageRequestItem,
};
use stowage_core::orchestration::{JobExecutor, JobProgress, ScheduledJob};
use stowage_core::repository::{
    InMemoryGroupRepository, InMemoryReferenceRepository,
    InMemoryRequestRepository, RequestRepository, RetryFilter,
};
use stowage_core::{
    BackendRegistry, EngineConfig, GroupAck, Result, StorageEngine,
    StorageError, Stores,
};
use tokio::sync::{Barrier, Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Upper bound for any single wait on asynchronous completion.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn checksum(value: &str) -> Checksum {
    Checksum::new(value).expect("checksum")
}

pub fn storage(value: &str) -> StorageId {
    StorageId::new(value).expect("storage id")
}

pub fn owner(value: &str) -> OwnerId {
    OwnerId::new(value).expect("owner")
}

pub fn group(value: &str) -> GroupId {
    GroupId::new(value).expect("group id")
}

pub fn store_item(c: &str, s: &str, o: &str) -> StorageRequestItem {
    StorageRequestItem {
        file_name: format!("{c}.bin"),
        checksum: checksum(c),
        algorithm: "sha256".into(),
        mime_type: "application/octet-stream".into(),
        size: Some(42),
        owner: owner(o),
        origin_url: Url::parse(&format!("https://origin.test/{c}"))
            .expect("origin url"),
        storage_id: storage(s),
        sub_directory: None,
    }
}

pub fn deletion_item(c: &str, s: &str, o: &str, force: bool) -> DeletionRequestItem {
    DeletionRequestItem {
        checksum: checksum(c),
        storage_id: storage(s),
        owner: owner(o),
        force_delete: force,
    }
}

pub fn copy_item(c: &str, destination: &str) -> CopyRequestItem {
    CopyRequestItem {
        checksum: checksum(c),
        storage_id: storage(destination),
        sub_directory: None,
    }
}

/// Backend whose per-checksum results are scripted by the test.
#[derive(Debug)]
pub struct ScriptedBackend {
    kind: BackendKind,
    base: Url,
    failing: StdMutex<HashSet<Checksum>>,
    jobs: StdMutex<usize>,
}

impl ScriptedBackend {
    pub fn online(name: &str) -> Arc<Self> {
        Arc::new(Self::with_kind(name, BackendKind::Online))
    }

    pub fn nearline(name: &str) -> Arc<Self> {
        Arc::new(Self::with_kind(name, BackendKind::Nearline))
    }

    pub fn with_kind(name: &str, kind: BackendKind) -> Self {
        Self {
            kind,
            base: Url::parse(&format!("mem://{name}/")).expect("base url"),
            failing: StdMutex::new(HashSet::new()),
            jobs: StdMutex::new(0),
        }
    }

    /// Every later job fails the requests for `checksum`.
    pub fn fail_on(&self, checksum: &Checksum) {
        self.failing
            .lock()
            .expect("failing set")
            .insert(checksum.clone());
    }

    pub fn recover(&self, checksum: &Checksum) {
        self.failing.lock().expect("failing set").remove(checksum);
    }

    pub fn jobs_run(&self) -> usize {
        *self.jobs.lock().expect("job counter")
    }

    pub fn url_for(&self, checksum: &Checksum) -> Url {
        self.base.join(checksum.as_str()).expect("file url")
    }

    fn fails(&self, checksum: &Checksum) -> bool {
        self.failing.lock().expect("failing set").contains(checksum)
    }

    fn job_started(&self) {
        *self.jobs.lock().expect("job counter") += 1;
    }
}

#[async_trait]
impl StorageBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn prepare_for_storage(
        &self,
        requests: Vec<FileRequest>,
    ) -> Result<Vec<WorkingSubset>> {
        Ok(vec![WorkingSubset::labelled("store", requests)])
    }

    async fn prepare_for_deletion(
        &self,
        requests: Vec<FileRequest>,
    ) -> Result<Vec<WorkingSubset>> {
        Ok(vec![WorkingSubset::labelled("delete", requests)])
    }

    async fn prepare_for_availability(
        &self,
        requests: Vec<FileRequest>,
    ) -> Result<Vec<WorkingSubset>> {
        if self.kind == BackendKind::Online {
            return Err(StorageError::Backend("online storage".into()));
        }
        Ok(vec![WorkingSubset::labelled("restore", requests)])
    }

    async fn store(&self, subset: WorkingSubset, progress: JobProgress) -> Result<()> {
        self.job_started();
        for request in subset.requests() {
            if self.fails(&request.checksum) {
                progress.storage_failed(request.id, "disk full").await?;
            } else {
                progress
                    .storage_succeeded(
                        request.id,
                        self.url_for(&request.checksum),
                        Some(42),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, subset: WorkingSubset, progress: JobProgress) -> Result<()> {
        self.job_started();
        for request in subset.requests() {
            if self.fails(&request.checksum) {
                progress.deletion_failed(request.id, "device busy").await?;
            } else {
                progress.deletion_succeeded(request.id).await?;
            }
        }
        Ok(())
    }

    async fn make_available(
        &self,
        subset: WorkingSubset,
        progress: JobProgress,
    ) -> Result<()> {
        self.job_started();
        for request in subset.requests() {
            if self.fails(&request.checksum) {
                progress.availability_failed(request.id, "tape unreadable").await?;
            } else {
                let cached = self
                    .base
                    .join(&format!("cache/{}", request.checksum))?;
                progress.availability_succeeded(request.id, cached).await?;
            }
        }
        Ok(())
    }
}

/// Executor that holds jobs until the test releases them, so requests can
/// be observed while PENDING.
#[derive(Debug, Default)]
pub struct ParkedExecutor {
    jobs: Mutex<Vec<ScheduledJob>>,
}

impl ParkedExecutor {
    pub async fn parked(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn run_all(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock().await);
        for job in jobs {
            job.run().await;
        }
    }
}

#[async_trait]
impl JobExecutor for ParkedExecutor {
    async fn submit(&self, job: ScheduledJob) -> Result<()> {
        self.jobs.lock().await.push(job);
        Ok(())
    }
}

/// In-memory request store that can stall chosen calls, so a test can pin
/// the interleaving of two concurrent callers.
#[derive(Debug)]
pub struct GatedRequests {
    inner: InMemoryRequestRepository,
    held_delete: StdMutex<Option<RequestId>>,
    delete_reached: Notify,
    delete_released: Notify,
    paired_lookups: AtomicUsize,
    lookup_barrier: Barrier,
}

impl Default for GatedRequests {
    fn default() -> Self {
        Self {
            inner: InMemoryRequestRepository::new(),
            held_delete: StdMutex::new(None),
            delete_reached: Notify::new(),
            delete_released: Notify::new(),
            paired_lookups: AtomicUsize::new(0),
            lookup_barrier: Barrier::new(2),
        }
    }
}

impl GatedRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next delete of `id` removes the row, then waits for
    /// [`GatedRequests::release_delete`] before returning.
    pub fn hold_delete_of(&self, id: RequestId) {
        *self.held_delete.lock().expect("held delete") = Some(id);
    }

    pub async fn delete_reached(&self) {
        tokio::time::timeout(EVENT_TIMEOUT, self.delete_reached.notified())
            .await
            .expect("timed out waiting for held delete");
    }

    pub fn release_delete(&self) {
        self.delete_released.notify_one();
    }

    /// The next two storage lookups by key wait for each other, so both
    /// callers observe the store before either inserts.
    pub fn pair_storage_lookups(&self) {
        self.paired_lookups.store(2, Ordering::SeqCst);
    }
}

#[async_trait]
impl RequestRepository for GatedRequests {
    async fn insert(&self, request: FileRequest) -> Result<()> {
        self.inner.insert(request).await
    }

    async fn update(&self, request: &FileRequest) -> Result<()> {
        self.inner.update(request).await
    }

    async fn delete(&self, id: RequestId) -> Result<Option<FileRequest>> {
        let removed = self.inner.delete(id).await?;
        let held = {
            let mut held = self.held_delete.lock().expect("held delete");
            if *held == Some(id) { held.take() } else { None }
        };
        if held.is_some() {
            self.delete_reached.notify_one();
            self.delete_released.notified().await;
        }
        Ok(removed)
    }

    async fn find_by_id(&self, id: RequestId) -> Result<Option<FileRequest>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_key(
        &self,
        kind: RequestKind,
        checksum: &Checksum,
        storage_id: &StorageId,
    ) -> Result<Option<FileRequest>> {
        if kind == RequestKind::Storage
            && self
                .paired_lookups
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            self.lookup_barrier.wait().await;
        }
        self.inner.find_by_key(kind, checksum, storage_id).await
    }

    async fn find_by_checksum(
        &self,
        kind: RequestKind,
        checksum: &Checksum,
    ) -> Result<Vec<FileRequest>> {
        self.inner.find_by_checksum(kind, checksum).await
    }

    async fn find_page(
        &self,
        kind: RequestKind,
        storage_id: &StorageId,
        status: RequestStatus,
        after: Option<RequestId>,
        limit: usize,
    ) -> Result<Vec<FileRequest>> {
        self.inner
            .find_page(kind, storage_id, status, after, limit)
            .await
    }

    async fn storages_with_status(
        &self,
        kind: RequestKind,
        status: RequestStatus,
    ) -> Result<Vec<StorageId>> {
        self.inner.storages_with_status(kind, status).await
    }

    async fn mark_pending(
        &self,
        ids: &[RequestId],
        job_id: JobId,
    ) -> Result<Vec<RequestId>> {
        self.inner.mark_pending(ids, job_id).await
    }

    async fn exists_by_group_and_status_not(
        &self,
        kind: RequestKind,
        group_id: &GroupId,
        status: RequestStatus,
    ) -> Result<bool> {
        self.inner
            .exists_by_group_and_status_not(kind, group_id, status)
            .await
    }

    async fn reset_errors(
        &self,
        kind: RequestKind,
        filter: &RetryFilter,
    ) -> Result<Vec<FileRequest>> {
        self.inner.reset_errors(kind, filter).await
    }

    async fn delete_by_status(
        &self,
        kind: RequestKind,
        status: RequestStatus,
    ) -> Result<Vec<FileRequest>> {
        self.inner.delete_by_status(kind, status).await
    }

    async fn count_by_status(
        &self,
        kind: RequestKind,
    ) -> Result<BTreeMap<RequestStatus, usize>> {
        self.inner.count_by_status(kind).await
    }
}

/// Stores whose request table is `requests`; references and groups stay
/// plain in-memory.
pub fn stores_over(requests: Arc<GatedRequests>) -> Stores {
    Stores {
        requests,
        references: Arc::new(InMemoryReferenceRepository::new()),
        groups: Arc::new(InMemoryGroupRepository::new()),
    }
}

/// Engine over in-memory stores with a running completion worker and a
/// subscription to its event bus.
pub struct Harness {
    pub engine: Arc<StorageEngine>,
    pub stores: Stores,
    pub registry: Arc<BackendRegistry>,
    pub parked: Option<Arc<ParkedExecutor>>,
    events: broadcast::Receiver<LifecycleEvent>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Harness {
    pub async fn new(backends: &[(&str, Arc<ScriptedBackend>)]) -> Self {
        Self::build(EngineConfig::default(), backends, false).await
    }

    /// Jobs stay parked until [`ParkedExecutor::run_all`].
    pub async fn parked(backends: &[(&str, Arc<ScriptedBackend>)]) -> Self {
        Self::build(EngineConfig::default(), backends, true).await
    }

    pub async fn build(
        config: EngineConfig,
        backends: &[(&str, Arc<ScriptedBackend>)],
        parked: bool,
    ) -> Self {
        let registry = Arc::new(BackendRegistry::new());
        for (name, backend) in backends {
            registry.register(storage(name), backend.clone());
        }
        Self::with_registry(config, registry, parked).await
    }

    pub async fn with_registry(
        config: EngineConfig,
        registry: Arc<BackendRegistry>,
        parked: bool,
    ) -> Self {
        Self::with_stores(config, registry, Stores::in_memory(), parked).await
    }

    /// Several harnesses built over clones of the same `stores` behave like
    /// engine instances sharing one database.
    pub async fn with_stores(
        config: EngineConfig,
        registry: Arc<BackendRegistry>,
        stores: Stores,
        parked: bool,
    ) -> Self {
        init_tracing();
        let mut builder = StorageEngine::builder(config)
            .stores(stores.clone())
            .registry(registry.clone());
        let parked = parked.then(|| Arc::new(ParkedExecutor::default()));
        if let Some(executor) = &parked {
            builder = builder.executor(executor.clone());
        }
        let engine = Arc::new(builder.build().expect("engine"));
        let events = engine.event_bus().expect("default event bus").subscribe();
        let shutdown = CancellationToken::new();
        let worker = engine
            .start_completion_worker(shutdown.clone())
            .await
            .expect("completion worker");

        Self {
            engine,
            stores,
            registry,
            parked,
            events,
            shutdown,
            worker: Some(worker),
        }
    }

    /// One dispatch cycle; parked jobs are run right away.
    pub async fn cycle(&self) -> stowage_core::CycleReport {
        let report = self.engine.run_dispatch_cycle().await;
        if let Some(parked) = &self.parked {
            parked.run_all().await;
        }
        report
    }

    pub async fn submit_store(
        &self,
        group_id: &str,
        items: Vec<StorageRequestItem>,
    ) -> GroupAck {
        self.engine
            .submit_storage(RequestBatch::new(group(group_id), items))
            .await
            .expect("submit storage")
    }

    pub async fn submit_delete(
        &self,
        group_id: &str,
        items: Vec<DeletionRequestItem>,
    ) -> GroupAck {
        self.engine
            .submit_deletion(RequestBatch::new(group(group_id), items))
            .await
            .expect("submit deletion")
    }

    pub async fn submit_copy(
        &self,
        group_id: &str,
        items: Vec<CopyRequestItem>,
    ) -> GroupAck {
        self.engine
            .submit_copy(RequestBatch::new(group(group_id), items))
            .await
            .expect("submit copy")
    }

    /// Stores `c` at `s` for `o` and waits for it to land.
    pub async fn seed(&mut self, c: &str, s: &str, o: &str) {
        let group_id = format!("seed-{c}-{s}-{o}");
        self.submit_store(&group_id, vec![store_item(c, s, o)]).await;
        self.cycle().await;
        let (ok, errors) = self.next_done(&group_id, RequestKind::Storage).await;
        assert_eq!((ok.len(), errors.len()), (1, 0), "seeding {c} at {s}");
    }

    /// Waits for the DONE event of a group, skipping everything else.
    pub async fn next_done(
        &mut self,
        group_id: &str,
        kind: RequestKind,
    ) -> (Vec<Outcome>, Vec<Outcome>) {
        let wanted = group(group_id);
        loop {
            if let LifecycleEvent::Group(GroupEvent::Done {
                group_id,
                kind: done_kind,
                successes,
                errors,
            }) = self.next_event().await
                && group_id == wanted
                && done_kind == kind
            {
                return (successes, errors);
            }
        }
    }

    /// Waits until every group in `group_ids` reported DONE for `kind`,
    /// returning `(successes, errors)` counts per group.
    pub async fn collect_done(
        &mut self,
        kind: RequestKind,
        group_ids: &[&str],
    ) -> BTreeMap<GroupId, (usize, usize)> {
        let wanted: HashSet<GroupId> = group_ids.iter().map(|g| group(g)).collect();
        let mut done = BTreeMap::new();
        while done.len() < wanted.len() {
            if let LifecycleEvent::Group(GroupEvent::Done {
                group_id,
                kind: done_kind,
                successes,
                errors,
            }) = self.next_event().await
                && done_kind == kind
                && wanted.contains(&group_id)
            {
                let previous =
                    done.insert(group_id.clone(), (successes.len(), errors.len()));
                assert!(previous.is_none(), "group {group_id} reported DONE twice");
            }
        }
        done
    }

    /// Waits for a per-file event of `kind` about `c`.
    pub async fn next_file_event(&mut self, kind: FileEventKind, c: &str) -> FileEvent {
        let wanted = checksum(c);
        loop {
            if let LifecycleEvent::File(event) = self.next_event().await
                && event.kind == kind
                && event.checksum == wanted
            {
                return event;
            }
        }
    }

    /// Everything published within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<LifecycleEvent> {
        let mut drained = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Ok(event)) =
            tokio::time::timeout_at(deadline, self.events.recv()).await
        {
            drained.push(event);
        }
        drained
    }

    pub async fn counts(&self, kind: RequestKind) -> BTreeMap<RequestStatus, usize> {
        self.engine.request_counts(kind).await.expect("request counts")
    }

    /// Polls until `kind` has exactly `count` requests in `status`.
    pub async fn wait_for_status(
        &self,
        kind: RequestKind,
        status: RequestStatus,
        count: usize,
    ) {
        let poll = async {
            loop {
                if self.counts(kind).await.get(&status).copied().unwrap_or(0)
                    == count
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(EVENT_TIMEOUT, poll)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {count} {kind} requests in {status}"));
    }

    pub async fn request(&self, kind: RequestKind, c: &str, s: &str) -> Option<FileRequest> {
        self.stores
            .requests
            .find_by_key(kind, &checksum(c), &storage(s))
            .await
            .expect("find request")
    }

    async fn next_event(&mut self) -> LifecycleEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for lifecycle event")
            .expect("event bus closed")
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            worker.await.expect("completion worker");
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
