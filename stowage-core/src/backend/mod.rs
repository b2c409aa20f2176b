//! Storage backend plugin contract.
//!
//! A backend owns one storage id. The dispatcher hands it batches of
//! requests to partition into [`WorkingSubset`]s; each subset then runs as
//! one asynchronous job that reports per-request results through
//! [`JobProgress`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use stowage_model::{FileRequest, RequestId};

use crate::config::BackendConfig;
use crate::error::{Result, StorageError};
use crate::orchestration::completion::JobProgress;

pub mod registry;

pub use registry::BackendRegistry;

/// Whether a backend can serve its files directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    #[default]
    Online,
    /// Files must be restored to a cache before they can be read.
    Nearline,
}

/// Backend-defined partition of requests of one kind for one storage id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkingSubset {
    label: Option<String>,
    requests: Vec<FileRequest>,
}

impl WorkingSubset {
    pub fn new(requests: Vec<FileRequest>) -> Self {
        Self {
            label: None,
            requests,
        }
    }

    pub fn labelled(label: impl Into<String>, requests: Vec<FileRequest>) -> Self {
        Self {
            label: Some(label.into()),
            requests,
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn requests(&self) -> &[FileRequest] {
        &self.requests
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Keeps only the members whose id is in `ids`.
    pub fn retain_ids(&mut self, ids: &[RequestId]) {
        self.requests.retain(|r| ids.contains(&r.id));
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind {
        BackendKind::Online
    }

    async fn prepare_for_storage(
        &self,
        requests: Vec<FileRequest>,
    ) -> Result<Vec<WorkingSubset>>;

    async fn prepare_for_deletion(
        &self,
        requests: Vec<FileRequest>,
    ) -> Result<Vec<WorkingSubset>>;

    /// Only nearline backends restore files.
    async fn prepare_for_availability(
        &self,
        _requests: Vec<FileRequest>,
    ) -> Result<Vec<WorkingSubset>> {
        Err(StorageError::Backend(
            "backend does not support availability requests".into(),
        ))
    }

    async fn store(
        &self,
        subset: WorkingSubset,
        progress: JobProgress,
    ) -> Result<()>;

    async fn delete(
        &self,
        subset: WorkingSubset,
        progress: JobProgress,
    ) -> Result<()>;

    async fn make_available(
        &self,
        _subset: WorkingSubset,
        _progress: JobProgress,
    ) -> Result<()> {
        Err(StorageError::Backend(
            "backend does not support availability requests".into(),
        ))
    }
}

/// Named constructor for backends listed in configuration.
pub trait BackendFactory: Send + Sync {
    fn plugin(&self) -> &str;

    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn StorageBackend>>;
}

impl fmt::Debug for dyn BackendFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendFactory")
            .field("plugin", &self.plugin())
            .finish()
    }
}
