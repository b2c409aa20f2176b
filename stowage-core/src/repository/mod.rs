//! Persistence ports for the three record families the engine owns.
//!
//! Each trait exposes only the query shapes the orchestration layer needs.
//! [`memory`] provides the in-process adapters used by tests and single-node
//! deployments.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use stowage_model::{
    Checksum, FileReference, FileRequest, GroupId, JobId, OwnerId, Outcome,
    RequestGroup, RequestId, RequestKind, RequestStatus, StorageId,
};

use crate::error::Result;

pub mod memory;

pub use memory::{
    InMemoryGroupRepository, InMemoryReferenceRepository,
    InMemoryRequestRepository,
};

/// Selects which errored requests an explicit retry resets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryFilter {
    Group(GroupId),
    Owners(BTreeSet<OwnerId>),
}

impl RetryFilter {
    pub fn matches(&self, request: &FileRequest) -> bool {
        match self {
            RetryFilter::Group(group) => request.group_ids.contains(group),
            RetryFilter::Owners(owners) => {
                !request.owners.is_disjoint(owners)
            }
        }
    }
}

/// Durable store of pending file requests, unique per
/// `(kind, checksum, storage_id)`.
#[async_trait]
pub trait RequestRepository: Send + Sync {
    /// Fails with `Conflict` when a request already holds the same key.
    async fn insert(&self, request: FileRequest) -> Result<()>;

    async fn update(&self, request: &FileRequest) -> Result<()>;

    async fn delete(&self, id: RequestId) -> Result<Option<FileRequest>>;

    async fn find_by_id(&self, id: RequestId) -> Result<Option<FileRequest>>;

    async fn find_by_key(
        &self,
        kind: RequestKind,
        checksum: &Checksum,
        storage_id: &StorageId,
    ) -> Result<Option<FileRequest>>;

    async fn find_by_checksum(
        &self,
        kind: RequestKind,
        checksum: &Checksum,
    ) -> Result<Vec<FileRequest>>;

    /// Keyset page ordered by request id, strictly after `after`.
    async fn find_page(
        &self,
        kind: RequestKind,
        storage_id: &StorageId,
        status: RequestStatus,
        after: Option<RequestId>,
        limit: usize,
    ) -> Result<Vec<FileRequest>>;

    async fn storages_with_status(
        &self,
        kind: RequestKind,
        status: RequestStatus,
    ) -> Result<Vec<StorageId>>;

    /// Moves the TO_DO requests among `ids` to PENDING under `job_id` and
    /// returns the ids that actually moved.
    async fn mark_pending(
        &self,
        ids: &[RequestId],
        job_id: JobId,
    ) -> Result<Vec<RequestId>>;

    /// Whether any request of `kind` carrying `group_id` is in a status other
    /// than `status`.
    async fn exists_by_group_and_status_not(
        &self,
        kind: RequestKind,
        group_id: &GroupId,
        status: RequestStatus,
    ) -> Result<bool>;

    /// ERROR → TO_DO for the matching requests; returns the reset rows.
    async fn reset_errors(
        &self,
        kind: RequestKind,
        filter: &RetryFilter,
    ) -> Result<Vec<FileRequest>>;

    async fn delete_by_status(
        &self,
        kind: RequestKind,
        status: RequestStatus,
    ) -> Result<Vec<FileRequest>>;

    async fn count_by_status(
        &self,
        kind: RequestKind,
    ) -> Result<BTreeMap<RequestStatus, usize>>;
}

/// Catalog of materialized files, unique per `(checksum, storage_id)`.
#[async_trait]
pub trait ReferenceRepository: Send + Sync {
    async fn find(
        &self,
        checksum: &Checksum,
        storage_id: &StorageId,
    ) -> Result<Option<FileReference>>;

    /// All references of a checksum ordered by storage id.
    async fn find_by_checksum(
        &self,
        checksum: &Checksum,
    ) -> Result<Vec<FileReference>>;

    async fn upsert(&self, reference: &FileReference) -> Result<()>;

    async fn delete(
        &self,
        checksum: &Checksum,
        storage_id: &StorageId,
    ) -> Result<Option<FileReference>>;
}

/// Outcome accounting per `(group_id, kind)`.
#[async_trait]
pub trait GroupRepository: Send + Sync {
    /// Creates the group or reopens an existing one (unsealed, outcomes kept).
    async fn open(&self, group_id: &GroupId, kind: RequestKind) -> Result<()>;

    /// Returns false when the group does not exist.
    async fn seal(&self, group_id: &GroupId, kind: RequestKind)
    -> Result<bool>;

    /// Returns false when the group does not exist.
    async fn append_outcome(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
        outcome: Outcome,
    ) -> Result<bool>;

    async fn get(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
    ) -> Result<Option<RequestGroup>>;

    /// Atomically removes the group; only one caller ever receives it.
    async fn take(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
    ) -> Result<Option<RequestGroup>>;
}
