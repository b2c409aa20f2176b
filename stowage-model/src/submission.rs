//! Inbound request payloads, always submitted in batches sharing a group id.

use std::collections::BTreeSet;

use url::Url;

use crate::{
    error::{ModelError, Result},
    ids::{Checksum, GroupId, OwnerId, StorageId},
    reference::FileMetadata,
};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestBatch<T> {
    pub group_id: GroupId,
    pub items: Vec<T>,
}

impl<T> RequestBatch<T> {
    pub fn new(group_id: GroupId, items: Vec<T>) -> Self {
        Self { group_id, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StorageRequestItem {
    pub file_name: String,
    pub checksum: Checksum,
    pub algorithm: String,
    pub mime_type: String,
    pub size: Option<u64>,
    pub owner: OwnerId,
    pub origin_url: Url,
    pub storage_id: StorageId,
    pub sub_directory: Option<String>,
}

impl StorageRequestItem {
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            algorithm: self.algorithm.clone(),
            file_name: self.file_name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_name.trim().is_empty() {
            return Err(ModelError::InvalidRequest(format!(
                "file name missing for checksum {}",
                self.checksum
            )));
        }
        if self.algorithm.trim().is_empty() {
            return Err(ModelError::InvalidRequest(format!(
                "checksum algorithm missing for checksum {}",
                self.checksum
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeletionRequestItem {
    pub checksum: Checksum,
    pub storage_id: StorageId,
    pub owner: OwnerId,
    pub force_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CopyRequestItem {
    pub checksum: Checksum,
    /// Destination storage.
    pub storage_id: StorageId,
    pub sub_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AvailabilityRequestItem {
    pub checksums: BTreeSet<Checksum>,
    pub availability_hours: u32,
}
