use std::fmt;
use std::sync::Arc;

use stowage_model::{
    FileRequest, GroupEvent, GroupId, Outcome, RequestKind, RequestStatus,
};
use tracing::{debug, info};

use crate::error::Result;
use crate::orchestration::events::{LifecyclePublisher, notify};
use crate::repository::{GroupRepository, RequestRepository};

/// Accounts outcomes per caller group and emits exactly one `DONE` per
/// group.
///
/// A group is done once it is sealed and no request of its kind carrying
/// its id is still TO_DO, PENDING or DELAYED. The group record is removed
/// with an atomic `take`, so concurrent completions race for the removal
/// and only the winner publishes.
#[derive(Clone)]
pub struct GroupTracker {
    groups: Arc<dyn GroupRepository>,
    requests: Arc<dyn RequestRepository>,
    publisher: Arc<dyn LifecyclePublisher>,
}

impl fmt::Debug for GroupTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupTracker").finish_non_exhaustive()
    }
}

impl GroupTracker {
    pub fn new(
        groups: Arc<dyn GroupRepository>,
        requests: Arc<dyn RequestRepository>,
        publisher: Arc<dyn LifecyclePublisher>,
    ) -> Self {
        Self {
            groups,
            requests,
            publisher,
        }
    }

    /// Opens the group unsealed and announces the accepted batch.
    pub async fn granted(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
        count: usize,
    ) -> Result<()> {
        self.groups.open(group_id, kind).await?;
        info!(group = %group_id, %kind, count, "request group granted");
        notify(
            self.publisher.as_ref(),
            GroupEvent::Granted {
                group_id: group_id.clone(),
                kind,
                count,
            },
        )
        .await;
        Ok(())
    }

    pub async fn denied(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
        cause: impl Into<String>,
    ) -> Result<()> {
        let cause = cause.into();
        info!(group = %group_id, %kind, %cause, "request group denied");
        notify(
            self.publisher.as_ref(),
            GroupEvent::Denied {
                group_id: group_id.clone(),
                kind,
                cause,
            },
        )
        .await;
        Ok(())
    }

    /// Reopens a group without announcing it, e.g. for an explicit retry.
    pub async fn reopen(&self, group_id: &GroupId, kind: RequestKind) -> Result<()> {
        self.groups.open(group_id, kind).await
    }

    /// Marks every request of the group as admitted and checks completion.
    pub async fn seal(&self, group_id: &GroupId, kind: RequestKind) -> Result<bool> {
        if !self.groups.seal(group_id, kind).await? {
            return Ok(false);
        }
        self.check_done(group_id, kind).await
    }

    /// Appends an outcome to one group and checks it for completion.
    pub async fn record_outcome(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
        outcome: Outcome,
    ) -> Result<bool> {
        if !self.groups.append_outcome(group_id, kind, outcome).await? {
            debug!(
                group = %group_id,
                %kind,
                "dropping outcome for unknown or finished group"
            );
            return Ok(false);
        }
        self.check_done(group_id, kind).await
    }

    /// Appends `outcome` to every group `request` belongs to without checking
    /// completion. Must run while the request row is still unresolved, so
    /// that no concurrent `check_done` can take a group missing it.
    pub async fn append_for_request(
        &self,
        request: &FileRequest,
        outcome: Outcome,
    ) -> Result<()> {
        let kind = request.kind();
        for group_id in &request.group_ids {
            if !self
                .groups
                .append_outcome(group_id, kind, outcome.clone())
                .await?
            {
                debug!(
                    group = %group_id,
                    %kind,
                    request = %request.id,
                    "dropping outcome for unknown or finished group"
                );
            }
        }
        Ok(())
    }

    /// Checks every group of `request` once its row reached its final state.
    pub async fn settle_request(&self, request: &FileRequest) -> Result<()> {
        let kind = request.kind();
        for group_id in &request.group_ids {
            self.check_done(group_id, kind).await?;
        }
        Ok(())
    }

    /// Returns true when this call completed the group.
    pub async fn check_done(
        &self,
        group_id: &GroupId,
        kind: RequestKind,
    ) -> Result<bool> {
        let Some(group) = self.groups.get(group_id, kind).await? else {
            return Ok(false);
        };
        if !group.sealed {
            return Ok(false);
        }
        let unresolved = self
            .requests
            .exists_by_group_and_status_not(kind, group_id, RequestStatus::Error)
            .await?;
        if unresolved {
            return Ok(false);
        }

        let Some(group) = self.groups.take(group_id, kind).await? else {
            // Another completion won the race.
            return Ok(false);
        };
        let (successes, errors) = group.partition();
        info!(
            group = %group_id,
            %kind,
            successes = successes.len(),
            errors = errors.len(),
            "request group done"
        );
        notify(
            self.publisher.as_ref(),
            GroupEvent::Done {
                group_id: group_id.clone(),
                kind,
                successes,
                errors,
            },
        )
        .await;
        Ok(true)
    }
}
