//! Source resolution for copy requests.
//!
//! A copy never reaches a backend directly. It is turned into a storage
//! request at its destination, fed either from an online source or from a
//! nearline source restored through an availability request first.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use stowage_model::{FileReference, FileRequest, GroupId};
use url::Url;

use crate::backend::{BackendKind, BackendRegistry};
use crate::error::{Result, StorageError};
use crate::orchestration::dedup::{
    Admission, AvailabilityDraft, DeduplicationGate, StorageDraft,
};
use crate::repository::ReferenceRepository;

pub const CAUSE_NO_COPY_SOURCE: &str =
    "file not referenced at any other storage";

/// Restore window requested when a copy needs a nearline source.
pub const COPY_CACHE_HOURS: u32 = 24;

/// Where a copy will read its bytes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CopyPlan {
    NoSource,
    /// Readable right away.
    Forward { source: FileReference },
    /// Must be restored before it can be read.
    Cache { source: FileReference },
}

#[derive(Clone)]
pub struct CopyFlow {
    references: Arc<dyn ReferenceRepository>,
    registry: Arc<BackendRegistry>,
    gate: DeduplicationGate,
}

impl fmt::Debug for CopyFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyFlow")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl CopyFlow {
    pub fn new(
        references: Arc<dyn ReferenceRepository>,
        registry: Arc<BackendRegistry>,
        gate: DeduplicationGate,
    ) -> Self {
        Self {
            references,
            registry,
            gate,
        }
    }

    /// Picks the first owned reference of the checksum at another storage,
    /// preferring online storages.
    pub async fn plan(&self, copy: &FileRequest) -> Result<CopyPlan> {
        let candidates: Vec<FileReference> = self
            .references
            .find_by_checksum(&copy.checksum)
            .await?
            .into_iter()
            .filter(|r| r.storage_id != copy.storage_id && !r.is_orphaned())
            .collect();

        let mut nearline = None;
        for reference in candidates {
            if self.registry.kind_of(&reference.storage_id)
                == Some(BackendKind::Nearline)
            {
                nearline.get_or_insert(reference);
            } else {
                return Ok(CopyPlan::Forward { source: reference });
            }
        }
        Ok(match nearline {
            Some(source) => CopyPlan::Cache { source },
            None => CopyPlan::NoSource,
        })
    }

    /// Admits the storage request that materializes the copy at its
    /// destination. Caller must hold the checksum lock.
    pub async fn forward_locked(
        &self,
        copy: &FileRequest,
        origin_url: Url,
        source: &FileReference,
    ) -> Result<Admission> {
        let sub_directory = copy
            .copy_details()
            .ok_or_else(|| {
                StorageError::Internal(format!(
                    "request {} is not a copy request",
                    copy.id
                ))
            })?
            .sub_directory
            .clone();
        self.gate
            .admit_storage_locked(StorageDraft {
                checksum: copy.checksum.clone(),
                storage_id: copy.storage_id.clone(),
                metadata: source.metadata.clone(),
                origin_url,
                sub_directory,
                owners: source.owners.clone(),
                group_ids: copy.group_ids.clone(),
            })
            .await
    }

    /// Asks the nearline source to restore the file under a fresh cache
    /// group. Caller must hold the checksum lock.
    pub async fn request_cache_locked(
        &self,
        copy: &FileRequest,
    ) -> Result<(GroupId, Admission)> {
        let cache_group = GroupId::generate("cache");
        let admission = self
            .gate
            .admit_availability_locked(AvailabilityDraft {
                checksum: copy.checksum.clone(),
                availability_hours: COPY_CACHE_HOURS,
                group_ids: BTreeSet::from([cache_group.clone()]),
            })
            .await?;
        Ok((cache_group, admission))
    }
}
