//! Plain data records shared across Stowage crates.
//!
//! Everything here is storage-agnostic: identifiers, catalog references,
//! pending file requests, group outcomes, inbound submissions and the
//! lifecycle events the engine publishes.
#![allow(missing_docs)]

pub mod error;
pub mod events;
pub mod group;
pub mod ids;
pub mod reference;
pub mod request;
pub mod submission;

pub use error::{ModelError, Result as ModelResult};
pub use events::{FileEvent, FileEventKind, GroupEvent, LifecycleEvent};
pub use group::{Outcome, RequestGroup};
pub use ids::{Checksum, GroupId, JobId, OwnerId, RequestId, StorageId, TenantId};
pub use reference::{FileMetadata, FileReference};
pub use request::{
    AvailabilityDetails, CopyDetails, DeletionDetails, FileRequest,
    RequestDetails, RequestKind, RequestStatus, StorageDetails,
};
pub use submission::{
    AvailabilityRequestItem, CopyRequestItem, DeletionRequestItem,
    RequestBatch, StorageRequestItem,
};
