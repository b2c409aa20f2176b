use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{Result, StorageError};

/// Advisory, time-bounded lock shared by every engine instance.
///
/// Holding the lock only means no other holder acquired it within the TTL;
/// callers must stay idempotent if a lease expires mid-cycle.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Acquires or renews `name` for `holder`. Returns false when another
    /// holder owns an unexpired lease.
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Releases the lease if `holder` owns it.
    async fn release(&self, name: &str, holder: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Single-process lease table.
#[derive(Debug, Default)]
pub struct InMemoryLeaseLock {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn holder(&self, name: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(name)
            .filter(|lease| lease.expires_at > Utc::now())
            .map(|lease| lease.holder.clone())
    }
}

#[async_trait]
impl LeaseLock for InMemoryLeaseLock {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|err| {
            StorageError::Lock(format!("invalid lease ttl: {err}"))
        })?;
        let mut leases = self.leases.lock().await;
        let now = Utc::now();

        if let Some(lease) = leases.get(name)
            && lease.expires_at > now
            && lease.holder != holder
        {
            return Ok(false);
        }

        leases.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(name).is_some_and(|lease| lease.holder == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}
