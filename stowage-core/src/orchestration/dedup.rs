use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use stowage_model::{
    AvailabilityDetails, Checksum, CopyDetails, DeletionDetails, FileEvent,
    FileEventKind, FileMetadata, FileReference, FileRequest, GroupId, Outcome,
    OwnerId, RequestDetails, RequestId, RequestKind, RequestStatus,
    StorageDetails, StorageId,
};
use tracing::debug;
use url::Url;

use crate::backend::{BackendKind, BackendRegistry};
use crate::error::{Result, StorageError};
use crate::orchestration::checksum_lock::ChecksumLocks;
use crate::orchestration::events::{LifecyclePublisher, notify};
use crate::orchestration::group::GroupTracker;
use crate::repository::{ReferenceRepository, RequestRepository};

pub const CAUSE_SUPERSEDED_BY_DELETION: &str = "superseded by deletion";
pub const CAUSE_DELETION_CANCELLED: &str =
    "deletion cancelled: file referenced again";
pub const CAUSE_NOT_REFERENCED: &str = "file not referenced";

const INSERT_ATTEMPTS: usize = 3;

/// What admission did with an incoming request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// New TO_DO request persisted.
    Created(RequestId),
    /// Interest folded into an existing request; no new work.
    Merged(RequestId),
    /// Persisted behind an in-flight deletion on the same key.
    Delayed(RequestId),
    /// Nothing left to do; the reference is attached when one exists.
    Satisfied(Option<FileReference>),
    /// Transient conflict; the caller may retry later.
    Conflict(String),
    Rejected(String),
}

#[derive(Clone, Debug)]
pub struct StorageDraft {
    pub checksum: Checksum,
    pub storage_id: StorageId,
    pub metadata: FileMetadata,
    pub origin_url: Url,
    pub sub_directory: Option<String>,
    pub owners: BTreeSet<OwnerId>,
    pub group_ids: BTreeSet<GroupId>,
}

#[derive(Clone, Debug)]
pub struct DeletionDraft {
    pub checksum: Checksum,
    pub storage_id: StorageId,
    pub owner: OwnerId,
    pub force_delete: bool,
    pub group_ids: BTreeSet<GroupId>,
}

#[derive(Clone, Debug)]
pub struct CopyDraft {
    pub checksum: Checksum,
    /// Destination storage.
    pub storage_id: StorageId,
    pub sub_directory: Option<String>,
    pub group_ids: BTreeSet<GroupId>,
}

#[derive(Clone, Debug)]
pub struct AvailabilityDraft {
    pub checksum: Checksum,
    pub availability_hours: u32,
    pub group_ids: BTreeSet<GroupId>,
}

/// Decides, per incoming request, whether to create, merge, delay or
/// satisfy it against the reference catalog and the request store.
#[derive(Clone)]
pub struct DeduplicationGate {
    requests: Arc<dyn RequestRepository>,
    references: Arc<dyn ReferenceRepository>,
    registry: Arc<BackendRegistry>,
    tracker: GroupTracker,
    publisher: Arc<dyn LifecyclePublisher>,
    locks: ChecksumLocks,
}

impl fmt::Debug for DeduplicationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeduplicationGate")
            .field("registry", &self.registry)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl DeduplicationGate {
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        references: Arc<dyn ReferenceRepository>,
        registry: Arc<BackendRegistry>,
        tracker: GroupTracker,
        publisher: Arc<dyn LifecyclePublisher>,
        locks: ChecksumLocks,
    ) -> Self {
        Self {
            requests,
            references,
            registry,
            tracker,
            publisher,
            locks,
        }
    }

    pub async fn admit_storage(&self, draft: StorageDraft) -> Result<Admission> {
        let _guard = self.locks.lock(&draft.checksum).await;
        self.admit_storage_locked(draft).await
    }

    pub async fn admit_deletion(
        &self,
        draft: DeletionDraft,
    ) -> Result<Admission> {
        let _guard = self.locks.lock(&draft.checksum).await;
        self.admit_deletion_locked(draft).await
    }

    pub async fn admit_copy(&self, draft: CopyDraft) -> Result<Admission> {
        let _guard = self.locks.lock(&draft.checksum).await;
        self.admit_copy_locked(draft).await
    }

    pub async fn admit_availability(
        &self,
        draft: AvailabilityDraft,
    ) -> Result<Admission> {
        let _guard = self.locks.lock(&draft.checksum).await;
        self.admit_availability_locked(draft).await
    }

    /// Caller must hold the checksum lock.
    pub async fn admit_storage_locked(
        &self,
        draft: StorageDraft,
    ) -> Result<Admission> {
        let StorageDraft {
            checksum,
            storage_id,
            metadata,
            origin_url,
            sub_directory,
            owners,
            group_ids,
        } = draft;

        if let Some(mut reference) =
            self.references.find(&checksum, &storage_id).await?
        {
            let deletion = self
                .requests
                .find_by_key(RequestKind::Deletion, &checksum, &storage_id)
                .await?;
            match deletion {
                Some(deletion) if deletion.status == RequestStatus::Pending => {
                    let existing = self
                        .requests
                        .find_by_key(RequestKind::Storage, &checksum, &storage_id)
                        .await?;
                    if let Some(mut existing) = existing {
                        existing.merge_interest(&owners, &group_ids);
                        if existing.status == RequestStatus::ToDo {
                            existing.set_status(RequestStatus::Delayed);
                        }
                        self.requests.update(&existing).await?;
                        debug!(%checksum, storage = %storage_id, "merged store behind pending deletion");
                        return Ok(Admission::Merged(existing.id));
                    }
                    let request = FileRequest::new(
                        checksum.clone(),
                        storage_id.clone(),
                        RequestStatus::Delayed,
                        RequestDetails::Storage(StorageDetails {
                            metadata,
                            origin_url,
                            sub_directory,
                        }),
                    )
                    .with_owners(owners)
                    .with_groups(group_ids);
                    debug!(%checksum, storage = %storage_id, "store delayed behind pending deletion");
                    return self
                        .insert_or_merge(request, Admission::Delayed, |existing, new| {
                            existing.merge_interest(&new.owners, &new.group_ids);
                            if existing.status == RequestStatus::ToDo {
                                existing.set_status(RequestStatus::Delayed);
                            }
                            true
                        })
                        .await;
                }
                Some(deletion) => {
                    self.cancel_deletion(deletion).await?;
                }
                None => {}
            }

            reference.add_owners(&owners);
            self.references.upsert(&reference).await?;
            debug!(%checksum, storage = %storage_id, "owners merged onto existing reference");
            return Ok(Admission::Satisfied(Some(reference)));
        }

        if let Some(mut existing) = self
            .requests
            .find_by_key(RequestKind::Storage, &checksum, &storage_id)
            .await?
        {
            existing.merge_interest(&owners, &group_ids);
            self.requests.update(&existing).await?;
            debug!(%checksum, storage = %storage_id, status = %existing.status, "merged into existing store request");
            return Ok(Admission::Merged(existing.id));
        }

        let request = FileRequest::new(
            checksum,
            storage_id,
            RequestStatus::ToDo,
            RequestDetails::Storage(StorageDetails {
                metadata,
                origin_url,
                sub_directory,
            }),
        )
        .with_owners(owners)
        .with_groups(group_ids);
        self.insert_or_merge(request, Admission::Created, merge_store)
            .await
    }

    /// Caller must hold the checksum lock.
    pub async fn admit_deletion_locked(
        &self,
        draft: DeletionDraft,
    ) -> Result<Admission> {
        let DeletionDraft {
            checksum,
            storage_id,
            owner,
            force_delete,
            group_ids,
        } = draft;

        if let Some(mut reference) =
            self.references.find(&checksum, &storage_id).await?
        {
            let deletion = self
                .requests
                .find_by_key(RequestKind::Deletion, &checksum, &storage_id)
                .await?;
            if let Some(mut deletion) = deletion {
                if deletion.status == RequestStatus::Pending {
                    return Ok(Admission::Conflict(format!(
                        "deletion of {checksum} at {storage_id} is in progress"
                    )));
                }
                deletion.merge_interest([&owner], &group_ids);
                if let RequestDetails::Deletion(details) = &mut deletion.details {
                    details.force_delete |= force_delete;
                }
                self.requests.update(&deletion).await?;
                return Ok(Admission::Merged(deletion.id));
            }

            reference.remove_owner(&owner);
            if !reference.is_orphaned() {
                self.references.upsert(&reference).await?;
                return Ok(Admission::Satisfied(None));
            }

            if self.registry.is_configured(&storage_id) {
                self.references.upsert(&reference).await?;
                let request = FileRequest::new(
                    checksum.clone(),
                    storage_id.clone(),
                    RequestStatus::ToDo,
                    RequestDetails::Deletion(DeletionDetails { force_delete }),
                )
                .with_owners([owner])
                .with_groups(group_ids);
                debug!(%checksum, storage = %storage_id, "last owner removed, backend deletion queued");
                return self
                    .insert_or_merge(request, Admission::Created, merge_deletion)
                    .await;
            }

            self.references.delete(&checksum, &storage_id).await?;
            debug!(%checksum, storage = %storage_id, "last owner removed from unmanaged storage");
            return Ok(Admission::Satisfied(None));
        }

        let pending_store = self
            .requests
            .find_by_key(RequestKind::Storage, &checksum, &storage_id)
            .await?
            .filter(|r| r.owners.contains(&owner));
        let Some(mut store) = pending_store else {
            return Ok(Admission::Satisfied(None));
        };

        if store.status == RequestStatus::Pending {
            return Ok(Admission::Conflict(format!(
                "storage of {checksum} at {storage_id} is in progress"
            )));
        }

        store.owners.remove(&owner);
        if !store.owners.is_empty() {
            self.requests.update(&store).await?;
            return Ok(Admission::Satisfied(None));
        }

        self.tracker
            .append_for_request(
                &store,
                Outcome::failure(
                    checksum.clone(),
                    storage_id.clone(),
                    CAUSE_SUPERSEDED_BY_DELETION,
                ),
            )
            .await?;
        self.requests.delete(store.id).await?;
        debug!(%checksum, storage = %storage_id, "store request superseded by deletion");
        notify(
            self.publisher.as_ref(),
            FileEvent::for_request(FileEventKind::StoreError, &store)
                .with_cause(CAUSE_SUPERSEDED_BY_DELETION),
        )
        .await;
        self.tracker.settle_request(&store).await?;
        Ok(Admission::Satisfied(None))
    }

    /// Caller must hold the checksum lock.
    pub async fn admit_copy_locked(&self, draft: CopyDraft) -> Result<Admission> {
        let CopyDraft {
            checksum,
            storage_id,
            sub_directory,
            group_ids,
        } = draft;

        let deletion = self
            .requests
            .find_by_key(RequestKind::Deletion, &checksum, &storage_id)
            .await?;
        let deletion_pending = deletion
            .as_ref()
            .is_some_and(|d| d.status == RequestStatus::Pending);

        if deletion.is_none()
            && let Some(reference) =
                self.references.find(&checksum, &storage_id).await?
        {
            return Ok(Admission::Satisfied(Some(reference)));
        }

        if let Some(mut existing) = self
            .requests
            .find_by_key(RequestKind::Copy, &checksum, &storage_id)
            .await?
        {
            let no_owners: [&OwnerId; 0] = [];
            existing.merge_interest(no_owners, &group_ids);
            if deletion_pending && existing.status == RequestStatus::ToDo {
                existing.set_status(RequestStatus::Delayed);
            }
            self.requests.update(&existing).await?;
            return Ok(Admission::Merged(existing.id));
        }

        let status = if deletion_pending {
            RequestStatus::Delayed
        } else {
            RequestStatus::ToDo
        };
        let request = FileRequest::new(
            checksum,
            storage_id,
            status,
            RequestDetails::Copy(CopyDetails {
                source_storage_id: None,
                sub_directory,
                cache_group_id: None,
            }),
        )
        .with_groups(group_ids);
        let created: fn(RequestId) -> Admission = if deletion_pending {
            Admission::Delayed
        } else {
            Admission::Created
        };
        self.insert_or_merge(request, created, |existing, new| {
            let no_owners: [&OwnerId; 0] = [];
            existing.merge_interest(no_owners, &new.group_ids);
            if deletion_pending && existing.status == RequestStatus::ToDo {
                existing.set_status(RequestStatus::Delayed);
            }
            true
        })
        .await
    }

    /// Caller must hold the checksum lock.
    pub async fn admit_availability_locked(
        &self,
        draft: AvailabilityDraft,
    ) -> Result<Admission> {
        let AvailabilityDraft {
            checksum,
            availability_hours,
            group_ids,
        } = draft;

        let references = self.references.find_by_checksum(&checksum).await?;
        if references.is_empty() {
            return Ok(Admission::Rejected(CAUSE_NOT_REFERENCED.into()));
        }

        let mut nearline = None;
        for reference in references {
            match self.registry.kind_of(&reference.storage_id) {
                Some(BackendKind::Nearline) => {
                    nearline.get_or_insert(reference);
                }
                _ => return Ok(Admission::Satisfied(Some(reference))),
            }
        }
        let Some(target) = nearline else {
            return Ok(Admission::Rejected(CAUSE_NOT_REFERENCED.into()));
        };

        if let Some(mut existing) = self
            .requests
            .find_by_key(RequestKind::Availability, &checksum, &target.storage_id)
            .await?
        {
            let no_owners: [&OwnerId; 0] = [];
            existing.merge_interest(no_owners, &group_ids);
            if let Some(details) = existing.availability_details_mut() {
                details.availability_hours =
                    details.availability_hours.max(availability_hours);
            }
            self.requests.update(&existing).await?;
            return Ok(Admission::Merged(existing.id));
        }

        let request = FileRequest::new(
            checksum,
            target.storage_id,
            RequestStatus::ToDo,
            RequestDetails::Availability(AvailabilityDetails {
                availability_hours,
                cached_url: None,
            }),
        )
        .with_groups(group_ids);
        self.insert_or_merge(request, Admission::Created, merge_availability)
            .await
    }

    /// Drops a not-yet-running deletion because its file gained an owner.
    async fn cancel_deletion(&self, deletion: FileRequest) -> Result<()> {
        self.tracker
            .append_for_request(
                &deletion,
                Outcome::failure(
                    deletion.checksum.clone(),
                    deletion.storage_id.clone(),
                    CAUSE_DELETION_CANCELLED,
                ),
            )
            .await?;
        self.requests.delete(deletion.id).await?;
        debug!(
            checksum = %deletion.checksum,
            storage = %deletion.storage_id,
            "deletion cancelled by new owner"
        );
        self.tracker.settle_request(&deletion).await
    }

    /// Persists a new request. When another instance inserted a request under
    /// the same key first, `fold` merges the interest of `request` into that
    /// row instead; `fold` returns false when the row cannot take it.
    async fn insert_or_merge(
        &self,
        request: FileRequest,
        created: fn(RequestId) -> Admission,
        fold: impl Fn(&mut FileRequest, &FileRequest) -> bool,
    ) -> Result<Admission> {
        let kind = request.kind();
        for _ in 0..INSERT_ATTEMPTS {
            let err = match self.requests.insert(request.clone()).await {
                Ok(()) => return Ok(created(request.id)),
                Err(StorageError::Conflict(err)) => err,
                Err(err) => return Err(err),
            };
            let existing = self
                .requests
                .find_by_key(kind, &request.checksum, &request.storage_id)
                .await?;
            // Row resolved between the insert and the read: insert again.
            let Some(mut existing) = existing else {
                debug!(%kind, checksum = %request.checksum, %err, "conflicting request vanished, retrying insert");
                continue;
            };
            if !fold(&mut existing, &request) {
                return Ok(Admission::Conflict(format!(
                    "{kind} of {} at {} is in progress",
                    request.checksum, request.storage_id
                )));
            }
            self.requests.update(&existing).await?;
            debug!(
                %kind,
                checksum = %request.checksum,
                storage = %request.storage_id,
                "merged into request inserted concurrently"
            );
            return Ok(Admission::Merged(existing.id));
        }
        Ok(Admission::Conflict(format!(
            "{kind} of {} at {} keeps changing concurrently",
            request.checksum, request.storage_id
        )))
    }
}

fn merge_store(existing: &mut FileRequest, new: &FileRequest) -> bool {
    existing.merge_interest(&new.owners, &new.group_ids);
    true
}

fn merge_deletion(existing: &mut FileRequest, new: &FileRequest) -> bool {
    if existing.status == RequestStatus::Pending {
        return false;
    }
    existing.merge_interest(&new.owners, &new.group_ids);
    let force = new.is_forced_deletion();
    if let RequestDetails::Deletion(details) = &mut existing.details {
        details.force_delete |= force;
    }
    true
}

fn merge_availability(existing: &mut FileRequest, new: &FileRequest) -> bool {
    let no_owners: [&OwnerId; 0] = [];
    existing.merge_interest(no_owners, &new.group_ids);
    let RequestDetails::Availability(incoming) = &new.details else {
        return false;
    };
    let hours = incoming.availability_hours;
    if let Some(details) = existing.availability_details_mut() {
        details.availability_hours = details.availability_hours.max(hours);
    }
    true
}
