use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use url::Url;

use crate::{
    ids::{Checksum, GroupId, JobId, OwnerId, RequestId, StorageId},
    reference::FileMetadata,
};

/// Distinguishes the request families. Also used as the group type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RequestKind {
    Storage,
    Deletion,
    Copy,
    Availability,
}

impl RequestKind {
    /// Order in which a dispatch cycle walks the request families.
    pub fn all_kinds() -> &'static [Self] {
        &[
            RequestKind::Storage,
            RequestKind::Deletion,
            RequestKind::Copy,
            RequestKind::Availability,
        ]
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Storage => write!(f, "storage"),
            RequestKind::Deletion => write!(f, "deletion"),
            RequestKind::Copy => write!(f, "copy"),
            RequestKind::Availability => write!(f, "availability"),
        }
    }
}

/// Lifecycle of a request row. Success is terminal and removes the row, so
/// it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum RequestStatus {
    ToDo,
    Pending,
    Delayed,
    Error,
}

impl RequestStatus {
    /// Whether a request in this status still owes its groups an outcome.
    pub fn is_unresolved(&self) -> bool {
        !matches!(self, RequestStatus::Error)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::ToDo => write!(f, "TO_DO"),
            RequestStatus::Pending => write!(f, "PENDING"),
            RequestStatus::Delayed => write!(f, "DELAYED"),
            RequestStatus::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StorageDetails {
    pub metadata: FileMetadata,
    pub origin_url: Url,
    pub sub_directory: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeletionDetails {
    pub force_delete: bool,
}

/// A copy is keyed by its destination; the source is resolved when the copy
/// is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CopyDetails {
    pub source_storage_id: Option<StorageId>,
    pub sub_directory: Option<String>,
    pub cache_group_id: Option<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AvailabilityDetails {
    pub availability_hours: u32,
    pub cached_url: Option<Url>,
}

/// Per-family payload of a [`FileRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", content = "details"))]
pub enum RequestDetails {
    Storage(StorageDetails),
    Deletion(DeletionDetails),
    Copy(CopyDetails),
    Availability(AvailabilityDetails),
}

impl RequestDetails {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestDetails::Storage(_) => RequestKind::Storage,
            RequestDetails::Deletion(_) => RequestKind::Deletion,
            RequestDetails::Copy(_) => RequestKind::Copy,
            RequestDetails::Availability(_) => RequestKind::Availability,
        }
    }
}

/// Pending work on one `(checksum, storage_id)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileRequest {
    pub id: RequestId,
    pub checksum: Checksum,
    pub storage_id: StorageId,
    pub status: RequestStatus,
    pub error_cause: Option<String>,
    pub owners: BTreeSet<OwnerId>,
    pub group_ids: BTreeSet<GroupId>,
    pub job_id: Option<JobId>,
    pub details: RequestDetails,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRequest {
    pub fn new(
        checksum: Checksum,
        storage_id: StorageId,
        status: RequestStatus,
        details: RequestDetails,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::new(),
            checksum,
            storage_id,
            status,
            error_cause: None,
            owners: BTreeSet::new(),
            group_ids: BTreeSet::new(),
            job_id: None,
            details,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_owners(
        mut self,
        owners: impl IntoIterator<Item = OwnerId>,
    ) -> Self {
        self.owners.extend(owners);
        self
    }

    pub fn with_groups(
        mut self,
        groups: impl IntoIterator<Item = GroupId>,
    ) -> Self {
        self.group_ids.extend(groups);
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.details.kind()
    }

    pub fn storage_details(&self) -> Option<&StorageDetails> {
        match &self.details {
            RequestDetails::Storage(details) => Some(details),
            _ => None,
        }
    }

    pub fn deletion_details(&self) -> Option<&DeletionDetails> {
        match &self.details {
            RequestDetails::Deletion(details) => Some(details),
            _ => None,
        }
    }

    pub fn copy_details(&self) -> Option<&CopyDetails> {
        match &self.details {
            RequestDetails::Copy(details) => Some(details),
            _ => None,
        }
    }

    pub fn copy_details_mut(&mut self) -> Option<&mut CopyDetails> {
        match &mut self.details {
            RequestDetails::Copy(details) => Some(details),
            _ => None,
        }
    }

    pub fn availability_details_mut(
        &mut self,
    ) -> Option<&mut AvailabilityDetails> {
        match &mut self.details {
            RequestDetails::Availability(details) => Some(details),
            _ => None,
        }
    }

    pub fn is_forced_deletion(&self) -> bool {
        self.deletion_details().is_some_and(|d| d.force_delete)
    }

    /// Folds another caller's interest into this request. An errored request
    /// goes back to TO_DO; in-flight or delayed requests keep their status.
    pub fn merge_interest<'a>(
        &mut self,
        owners: impl IntoIterator<Item = &'a OwnerId>,
        groups: impl IntoIterator<Item = &'a GroupId>,
    ) {
        self.owners.extend(owners.into_iter().cloned());
        self.group_ids.extend(groups.into_iter().cloned());
        if self.status == RequestStatus::Error {
            self.status = RequestStatus::ToDo;
            self.error_cause = None;
            self.job_id = None;
        }
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
        if status != RequestStatus::Error {
            self.error_cause = None;
        }
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, cause: impl Into<String>) {
        self.status = RequestStatus::Error;
        self.error_cause = Some(cause.into());
        self.updated_at = Utc::now();
    }
}
