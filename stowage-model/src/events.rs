use std::collections::BTreeSet;

use url::Url;

use crate::{
    group::Outcome,
    ids::{Checksum, GroupId, OwnerId, StorageId},
    request::{FileRequest, RequestKind},
};

/// Group lifecycle notifications consumed by the callers that submitted a
/// batch.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "state", rename_all = "UPPERCASE"))]
pub enum GroupEvent {
    Granted {
        group_id: GroupId,
        kind: RequestKind,
        count: usize,
    },
    Denied {
        group_id: GroupId,
        kind: RequestKind,
        cause: String,
    },
    Done {
        group_id: GroupId,
        kind: RequestKind,
        successes: Vec<Outcome>,
        errors: Vec<Outcome>,
    },
}

impl GroupEvent {
    pub fn group_id(&self) -> &GroupId {
        match self {
            GroupEvent::Granted { group_id, .. }
            | GroupEvent::Denied { group_id, .. }
            | GroupEvent::Done { group_id, .. } => group_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FileEventKind {
    StoreSuccess,
    StoreError,
    DeletionSuccess,
    DeletionError,
    CopySuccess,
    CopyError,
    Available,
    AvailabilityError,
}

impl FileEventKind {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            FileEventKind::StoreError
                | FileEventKind::DeletionError
                | FileEventKind::CopyError
                | FileEventKind::AvailabilityError
        )
    }
}

/// Per-file notification, not grouped. Carries enough identity for
/// downstream consumers to correlate it with their own records.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub checksum: Checksum,
    pub storage_id: StorageId,
    pub owners: BTreeSet<OwnerId>,
    pub group_ids: BTreeSet<GroupId>,
    pub url: Option<Url>,
    pub cause: Option<String>,
}

impl FileEvent {
    pub fn for_request(kind: FileEventKind, request: &FileRequest) -> Self {
        Self {
            kind,
            checksum: request.checksum.clone(),
            storage_id: request.storage_id.clone(),
            owners: request.owners.clone(),
            group_ids: request.group_ids.clone(),
            url: None,
            cause: None,
        }
    }

    /// Event for a file no request row stands for, e.g. an admission that was
    /// satisfied immediately.
    pub fn new(
        kind: FileEventKind,
        checksum: Checksum,
        storage_id: StorageId,
    ) -> Self {
        Self {
            kind,
            checksum,
            storage_id,
            owners: BTreeSet::new(),
            group_ids: BTreeSet::new(),
            url: None,
            cause: None,
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

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", content = "event"))]
pub enum LifecycleEvent {
    Group(GroupEvent),
    File(FileEvent),
}

impl From<GroupEvent> for LifecycleEvent {
    fn from(event: GroupEvent) -> Self {
        LifecycleEvent::Group(event)
    }
}

impl From<FileEvent> for LifecycleEvent {
    fn from(event: FileEvent) -> Self {
        LifecycleEvent::File(event)
    }
}
