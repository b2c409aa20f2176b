use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use url::Url;

use crate::ids::{Checksum, OwnerId, StorageId};

/// Descriptive attributes carried from the original storage request onto the
/// catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileMetadata {
    pub algorithm: String,
    pub file_name: String,
    pub size: Option<u64>,
    pub mime_type: String,
}

/// Catalog record stating that a checksum is materialized at a storage id.
///
/// `(checksum, storage_id)` never changes once created; only `owners` does.
/// The owner set is empty only while a deletion request targets the
/// reference.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileReference {
    pub checksum: Checksum,
    pub storage_id: StorageId,
    pub metadata: FileMetadata,
    pub url: Url,
    pub owners: BTreeSet<OwnerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileReference {
    pub fn new(
        checksum: Checksum,
        storage_id: StorageId,
        metadata: FileMetadata,
        url: Url,
    ) -> Self {
        let now = Utc::now();
        Self {
            checksum,
            storage_id,
            metadata,
            url,
            owners: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Adds owners, returning how many were not already present.
    pub fn add_owners<'a>(
        &mut self,
        owners: impl IntoIterator<Item = &'a OwnerId>,
    ) -> usize {
        let before = self.owners.len();
        self.owners.extend(owners.into_iter().cloned());
        let added = self.owners.len() - before;
        if added > 0 {
            self.updated_at = Utc::now();
        }
        added
    }

    pub fn remove_owner(&mut self, owner: &OwnerId) -> bool {
        let removed = self.owners.remove(owner);
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }

    pub fn is_orphaned(&self) -> bool {
        self.owners.is_empty()
    }
}
