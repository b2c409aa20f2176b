use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use stowage_model::Checksum;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Single-writer partition per checksum.
///
/// Admission and completion for a checksum are serialized through its
/// mutex, which makes the merge-or-create decision and the DELAYED release
/// atomic without a global lock.
#[derive(Clone, Default)]
pub struct ChecksumLocks {
    locks: Arc<DashMap<Checksum, Arc<Mutex<()>>>>,
}

impl fmt::Debug for ChecksumLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumLocks")
            .field("tracked", &self.locks.len())
            .finish()
    }
}

/// Held for the duration of a checksum-scoped critical section.
pub type ChecksumGuard = OwnedMutexGuard<()>;

impl ChecksumLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, checksum: &Checksum) -> ChecksumGuard {
        let mutex = Arc::clone(
            self.locks
                .entry(checksum.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        mutex.lock_owned().await
    }

    /// Drops mutexes nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
