use chrono::{DateTime, Utc};

use crate::{
    ids::{Checksum, GroupId, StorageId},
    reference::FileReference,
    request::RequestKind,
};

/// Terminal result of one request, as seen by one group.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Outcome {
    pub checksum: Checksum,
    /// `None` when the file could not be placed at any storage.
    pub storage_id: Option<StorageId>,
    pub error: bool,
    pub error_cause: Option<String>,
    pub reference: Option<FileReference>,
}

impl Outcome {
    pub fn success(
        checksum: Checksum,
        storage_id: StorageId,
        reference: Option<FileReference>,
    ) -> Self {
        Self {
            checksum,
            storage_id: Some(storage_id),
            error: false,
            error_cause: None,
            reference,
        }
    }

    pub fn failure(
        checksum: Checksum,
        storage_id: StorageId,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            checksum,
            storage_id: Some(storage_id),
            error: true,
            error_cause: Some(cause.into()),
            reference: None,
        }
    }

    /// Failure for a request that never resolved to a storage id.
    pub fn unplaced_failure(checksum: Checksum, cause: impl Into<String>) -> Self {
        Self {
            checksum,
            storage_id: None,
            error: true,
            error_cause: Some(cause.into()),
            reference: None,
        }
    }

    /// Two outcomes about the same file replace each other inside a group.
    pub fn same_file(&self, other: &Outcome) -> bool {
        self.checksum == other.checksum && self.storage_id == other.storage_id
    }
}

/// Accounting record for a caller's batch. Completion is inferred from the
/// absence of unresolved requests carrying `group_id`, once the group is
/// sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestGroup {
    pub group_id: GroupId,
    pub kind: RequestKind,
    pub sealed: bool,
    pub outcomes: Vec<Outcome>,
    pub created_at: DateTime<Utc>,
}

impl RequestGroup {
    pub fn open(group_id: GroupId, kind: RequestKind) -> Self {
        Self {
            group_id,
            kind,
            sealed: false,
            outcomes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Records an outcome; a later outcome for the same file wins.
    pub fn record(&mut self, outcome: Outcome) {
        if let Some(existing) =
            self.outcomes.iter_mut().find(|o| o.same_file(&outcome))
        {
            *existing = outcome;
        } else {
            self.outcomes.push(outcome);
        }
    }

    /// Splits the recorded outcomes into `(successes, errors)`.
    pub fn partition(self) -> (Vec<Outcome>, Vec<Outcome>) {
        self.outcomes.into_iter().partition(|o| !o.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(c: &str, s: &str) -> (Checksum, StorageId) {
        (Checksum::new(c).unwrap(), StorageId::new(s).unwrap())
    }

    #[test]
    fn later_outcome_for_same_file_replaces_earlier() {
        let mut group = RequestGroup::open(
            GroupId::new("g").unwrap(),
            RequestKind::Storage,
        );
        let (c, s) = ids("abc", "disk");
        group.record(Outcome::failure(c.clone(), s.clone(), "boom"));
        group.record(Outcome::success(c, s, None));
        let (c2, s2) = ids("def", "disk");
        group.record(Outcome::failure(c2, s2, "nope"));

        assert_eq!(group.outcomes.len(), 2);
        let (ok, errors) = group.partition();
        assert_eq!(ok.len(), 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_cause.as_deref(), Some("nope"));
    }
}
