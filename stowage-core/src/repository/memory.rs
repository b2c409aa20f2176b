use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use stowage_model::{
    Checksum, FileReference, FileRequest, GroupId, JobId, Outcome,
    RequestGroup, RequestId, RequestKind, RequestStatus, StorageId,
};
use tokio::sync::{Mutex, RwLock};

use super::{
    GroupRepository, ReferenceRepository, RequestRepository, RetryFilter,
};
use crate::error::{Result, StorageError};

type RequestKey = (RequestKind, Checksum, StorageId);

#[derive(Default)]
struct RequestTable {
    rows: BTreeMap<RequestId, FileRequest>,
    keys: HashMap<RequestKey, RequestId>,
}

impl RequestTable {
    fn key_of(request: &FileRequest) -> RequestKey {
        (
            request.kind(),
            request.checksum.clone(),
            request.storage_id.clone(),
        )
    }

    fn remove(&mut self, id: RequestId) -> Option<FileRequest> {
        let removed = self.rows.remove(&id)?;
        self.keys.remove(&Self::key_of(&removed));
        Some(removed)
    }
}

/// Request store backed by an id-ordered map plus a unique key index.
#[derive(Clone, Default)]
pub struct InMemoryRequestRepository {
    table: Arc<RwLock<RequestTable>>,
}

impl fmt::Debug for InMemoryRequestRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryRequestRepository");
        match self.table.try_read() {
            Ok(table) => {
                debug.field("rows", &table.rows.len());
            }
            Err(_) => {
                debug.field("rows", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryRequestRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestRepository for InMemoryRequestRepository {
    async fn insert(&self, request: FileRequest) -> Result<()> {
        let mut table = self.table.write().await;
        let key = RequestTable::key_of(&request);
        if table.keys.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "{} request already exists for {} at {}",
                key.0, key.1, key.2
            )));
        }
        table.keys.insert(key, request.id);
        table.rows.insert(request.id, request);
        Ok(())
    }

    async fn update(&self, request: &FileRequest) -> Result<()> {
        let mut table = self.table.write().await;
        match table.rows.get_mut(&request.id) {
            Some(row) => {
                *row = request.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "request {}",
                request.id
            ))),
        }
    }

    async fn delete(&self, id: RequestId) -> Result<Option<FileRequest>> {
        let mut table = self.table.write().await;
        Ok(table.remove(id))
    }

    async fn find_by_id(&self, id: RequestId) -> Result<Option<FileRequest>> {
        let table = self.table.read().await;
        Ok(table.rows.get(&id).cloned())
    }

    async fn find_by_key(
        &self,
        kind: RequestKind,
        checksum: &Checksum,
        storage_id: &StorageId,
    ) -> Result<Option<FileRequest>> {
        let table = self.table.read().await;
        let key = (kind, checksum.clone(), storage_id.clone());
        Ok(table
            .keys
            .get(&key)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn find_by_checksum(
        &self,
        kind: RequestKind,
        checksum: &Checksum,
    ) -> Result<Vec<FileRequest>> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .values()
            .filter(|r| r.kind() == kind && &r.checksum == checksum)
            .cloned()
            .collect())
    }

    async fn find_page(
        &self,
        kind: RequestKind,
        storage_id: &StorageId,
        status: RequestStatus,
        after: Option<RequestId>,
        limit: usize,
    ) -> Result<Vec<FileRequest>> {
        let table = self.table.read().await;
        let rows: Box<dyn Iterator<Item = &FileRequest>> = match after {
            Some(cursor) => Box::new(
                table
                    .rows
                    .range((
                        std::ops::Bound::Excluded(cursor),
                        std::ops::Bound::Unbounded,
                    ))
                    .map(|(_, r)| r),
            ),
            None => Box::new(table.rows.values()),
        };
        Ok(rows
            .filter(|r| {
                r.kind() == kind
                    && r.status == status
                    && &r.storage_id == storage_id
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn storages_with_status(
        &self,
        kind: RequestKind,
        status: RequestStatus,
    ) -> Result<Vec<StorageId>> {
        let table = self.table.read().await;
        let mut storages: Vec<StorageId> = table
            .rows
            .values()
            .filter(|r| r.kind() == kind && r.status == status)
            .map(|r| r.storage_id.clone())
            .collect();
        storages.sort();
        storages.dedup();
        Ok(storages)
    }

    async fn mark_pending(
        &self,
        ids: &[RequestId],
        job_id: JobId,
    ) -> Result<Vec<RequestId>> {
        let mut table = self.table.write().await;
        let mut marked = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = table.rows.get_mut(id)
                && row.status == RequestStatus::ToDo
            {
                row.set_status(RequestStatus::Pending);
                row.job_id = Some(job_id);
                marked.push(*id);
            }
        }
        Ok(marked)
    }

    async fn exists_by_group_and_status_not(
        &self,
        kind: RequestKind,
        group_id: &GroupId,
        status: RequestStatus,
    ) -> Result<bool> {
        let table = self.table.read().await;
        Ok(table.rows.values().any(|r| {
            r.kind() == kind
                && r.status != status
                && r.group_ids.contains(group_id)
        }))
    }

    async fn reset_errors(
        &self,
        kind: RequestKind,
        filter: &RetryFilter,
    ) -> Result<Vec<FileRequest>> {
        let mut table = self.table.write().await;
        let mut reset = Vec::new();
        for row in table.rows.values_mut() {
            if row.kind() == kind
                && row.status == RequestStatus::Error
                && filter.matches(row)
            {
                row.set_status(RequestStatus::ToDo);
                row.job_id = None;
                reset.push(row.clone());
            }
        }
        Ok(reset)
    }

    async fn delete_by_status(
        &self,
        kind: RequestKind,
        status: RequestStatus,
    ) -> Result<Vec<FileRequest>> {
        let mut table = self.table.write().await;
        let ids: Vec<RequestId> = table
            .rows
            .values()
            .filter(|r| r.kind() == kind && r.status == status)
            .map(|r| r.id)
            .collect();
        Ok(ids.into_iter().filter_map(|id| table.remove(id)).collect())
    }

    async fn count_by_status(
        &self,
        kind: RequestKind,
    ) -> Result<BTreeMap<RequestStatus, usize>> {
        let table = self.table.read().await;
        let mut counts = BTreeMap::new();
        for row in table.rows.values().filter(|r| r.kind() == kind) {
            *counts.entry(row.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// Reference catalog ordered by `(checksum, storage_id)`.
#[derive(Clone, Debug, Default)]
pub struct InMemoryReferenceRepository {
    references:
        Arc<RwLock<BTreeMap<(Checksum, StorageId), FileReference>>>,
}

impl InMemoryReferenceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReferenceRepository for InMemoryReferenceRepository {
    async fn find(
        &self,
        checksum: &Checksum,
        storage_id: &StorageId,
    ) -> Result<Option<FileReference>> {
        let guard = self.references.read().await;
        Ok(guard.get(&(checksum.clone(), storage_id.clone())).cloned())
    }

    async fn find_by_checksum(
        &self,
        checksum: &Checksum,
    ) -> Result<Vec<FileReference>> {
        let guard = self.references.read().await;
        Ok(guard
            .values()
            .filter(|r| &r.checksum == checksum)
            .cloned()
            .collect())
    }

    async fn upsert(&self, reference: &FileReference) -> Result<()> {
        let mut guard = self.references.write().await;
        let key = (reference.checksum.clone(), reference.storage_id.clone());
        match guard.get_mut(&key) {
            Some(existing) => {
                // Identity and creation time never change.
                existing.metadata = reference.metadata.clone();
                existing.url = reference.url.clone();
                existing.owners = reference.owners.clone();
                existing.updated_at = Utc::now();
            }
            None => {
                guard.insert(key, reference.clone());
            }
        }
        Ok(())
    }

    async fn delete(
        &self,
        checksum: &Checksum,
        storage_id: &StorageId,
    ) -> Result<Option<FileReference>> {
        let mut guard = self.references.write().await;
        Ok(guard.remove(&(checksum.clone(), storage_id.clone())))
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryGroupRepository {
    groups: Arc<Mutex<HashMap<(GroupId, RequestKind), RequestGroup>>>,
}

impl InMemoryGroupRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GroupRepository for InMemoryGroupRepository {
    async fn open(&self, group_id: &GroupId, kind: RequestKind) -> Result<()> {
        let mut guard = self.groups.lock().await;
        guard
            .entry((group_id.clone(), kind))
            .and_modify(|g| g.sealed = false)
            .or_insert_with(|| RequestGroup::open(group_id.clone(), kind));
        Ok(())
    }

    async fn seal(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
    ) -> Result<bool> {
        let mut guard = self.groups.lock().await;
        match guard.get_mut(&(group_id.clone(), kind)) {
            Some(group) => {
                group.sealed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_outcome(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
        outcome: Outcome,
    ) -> Result<bool> {
        let mut guard = self.groups.lock().await;
        match guard.get_mut(&(group_id.clone(), kind)) {
            Some(group) => {
                group.record(outcome);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
    ) -> Result<Option<RequestGroup>> {
        let guard = self.groups.lock().await;
        Ok(guard.get(&(group_id.clone(), kind)).cloned())
    }

    async fn take(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
    ) -> Result<Option<RequestGroup>> {
        let mut guard = self.groups.lock().await;
        Ok(guard.remove(&(group_id.clone(), kind)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use stowage_model::{DeletionDetails, OwnerId, RequestDetails};

    fn deletion(checksum: &str, storage: &str) -> FileRequest {
        FileRequest::new(
            Checksum::new(checksum).unwrap(),
            StorageId::new(storage).unwrap(),
            RequestStatus::ToDo,
            RequestDetails::Deletion(DeletionDetails::default()),
        )
    }

    #[tokio::test]
    async fn duplicate_key_insert_conflicts() {
        let repo = InMemoryRequestRepository::new();
        repo.insert(deletion("abc", "disk")).await.unwrap();

        let err = repo.insert(deletion("abc", "disk")).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        repo.insert(deletion("abc", "tape")).await.unwrap();
        let counts = repo.count_by_status(RequestKind::Deletion).await.unwrap();
        assert_eq!(counts.get(&RequestStatus::ToDo), Some(&2));
    }

    #[tokio::test]
    async fn keyset_pages_never_revisit_rows() {
        let repo = InMemoryRequestRepository::new();
        let storage = StorageId::new("disk").unwrap();
        for i in 0..5 {
            repo.insert(deletion(&format!("c{i}"), "disk")).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = repo
                .find_page(
                    RequestKind::Deletion,
                    &storage,
                    RequestStatus::ToDo,
                    cursor,
                    2,
                )
                .await
                .unwrap();
            let Some(last) = page.last() else { break };
            cursor = Some(last.id);
            seen.extend(page.iter().map(|r| r.id));
        }

        assert_eq!(seen.len(), 5);
        let unique: BTreeSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn mark_pending_only_moves_todo_rows() {
        let repo = InMemoryRequestRepository::new();
        let todo = deletion("a", "disk");
        let mut errored = deletion("b", "disk");
        errored.fail("boom");
        let ids = vec![todo.id, errored.id];
        repo.insert(todo).await.unwrap();
        repo.insert(errored).await.unwrap();

        let job = JobId::new();
        let marked = repo.mark_pending(&ids, job).await.unwrap();
        assert_eq!(marked, vec![ids[0]]);

        let row = repo.find_by_id(ids[0]).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Pending);
        assert_eq!(row.job_id, Some(job));
    }

    #[tokio::test]
    async fn reset_errors_respects_owner_filter() {
        let repo = InMemoryRequestRepository::new();
        let alice = OwnerId::new("alice").unwrap();
        let mut mine = deletion("a", "disk").with_owners([alice.clone()]);
        mine.fail("boom");
        let mut theirs = deletion("b", "disk")
            .with_owners([OwnerId::new("bob").unwrap()]);
        theirs.fail("boom");
        repo.insert(mine.clone()).await.unwrap();
        repo.insert(theirs.clone()).await.unwrap();

        let filter = RetryFilter::Owners(BTreeSet::from([alice]));
        let reset = repo
            .reset_errors(RequestKind::Deletion, &filter)
            .await
            .unwrap();

        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].id, mine.id);
        let untouched = repo.find_by_id(theirs.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn group_take_is_exclusive() {
        let repo = InMemoryGroupRepository::new();
        let group = GroupId::new("g").unwrap();
        repo.open(&group, RequestKind::Storage).await.unwrap();
        assert!(repo.seal(&group, RequestKind::Storage).await.unwrap());

        assert!(repo.take(&group, RequestKind::Storage).await.unwrap().is_some());
        assert!(repo.take(&group, RequestKind::Storage).await.unwrap().is_none());
        assert!(
            !repo
                .append_outcome(
                    &group,
                    RequestKind::Storage,
                    Outcome::success(
                        Checksum::new("a").unwrap(),
                        StorageId::new("disk").unwrap(),
                        None,
                    ),
                )
                .await
                .unwrap()
        );
    }
}
