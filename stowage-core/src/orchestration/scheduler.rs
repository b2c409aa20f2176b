use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use stowage_model::TenantId;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::engine::{CycleReport, StorageEngine};
use crate::orchestration::lease::LeaseLock;

/// What one tenant did during a scheduler tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenantCycle {
    /// Another instance held the dispatch lease.
    Skipped,
    Ran(CycleReport),
    /// The lease store failed; nothing was dispatched.
    Failed(String),
}

/// Triggers a dispatch cycle per tenant at a fixed period. Each tenant's
/// cycle runs only while this instance holds the tenant's dispatch lease.
#[derive(Clone)]
pub struct PeriodicScheduler {
    tenants: BTreeMap<TenantId, Arc<StorageEngine>>,
    lease: Arc<dyn LeaseLock>,
    instance_id: String,
    config: SchedulerConfig,
}

impl fmt::Debug for PeriodicScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicScheduler")
            .field("tenants", &self.tenants.keys().collect::<Vec<_>>())
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PeriodicScheduler {
    pub fn new(
        lease: Arc<dyn LeaseLock>,
        instance_id: impl Into<String>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tenants: BTreeMap::new(),
            lease,
            instance_id: instance_id.into(),
            config,
        }
    }

    pub fn with_tenant(mut self, tenant: TenantId, engine: Arc<StorageEngine>) -> Self {
        self.tenants.insert(tenant, engine);
        self
    }

    pub fn tenants(&self) -> impl Iterator<Item = &TenantId> {
        self.tenants.keys()
    }

    pub fn lease_name(&self, tenant: &TenantId) -> String {
        format!("{}:{}", self.config.lock_name, tenant)
    }

    /// Runs one tick over every tenant concurrently. A failing tenant does
    /// not stop the others.
    pub async fn run_cycle(&self) -> BTreeMap<TenantId, TenantCycle> {
        let runs = self.tenants.iter().map(|(tenant, engine)| async move {
            (tenant.clone(), self.run_tenant(tenant, engine).await)
        });
        join_all(runs).await.into_iter().collect()
    }

    async fn run_tenant(&self, tenant: &TenantId, engine: &StorageEngine) -> TenantCycle {
        let name = self.lease_name(tenant);
        match self
            .lease
            .try_acquire(&name, &self.instance_id, self.config.lock_ttl())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(%tenant, lease = %name, "dispatch lease held elsewhere");
                return TenantCycle::Skipped;
            }
            Err(err) => {
                warn!(%tenant, lease = %name, error = %err, "could not acquire dispatch lease");
                return TenantCycle::Failed(err.to_string());
            }
        }

        let report = engine.run_dispatch_cycle().await;
        if let Err(err) = self.lease.release(&name, &self.instance_id).await {
            warn!(%tenant, lease = %name, error = %err, "could not release dispatch lease");
        }
        TenantCycle::Ran(report)
    }

    /// Ticks every configured period until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.period());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                instance = %self.instance_id,
                tenants = self.tenants.len(),
                period_ms = self.config.period_ms,
                "periodic dispatch scheduler started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(instance = %self.instance_id, "periodic dispatch scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let cycles = self.run_cycle().await;
                        let jobs: usize = cycles
                            .values()
                            .map(|cycle| match cycle {
                                TenantCycle::Ran(report) => report.job_count(),
                                _ => 0,
                            })
                            .sum();
                        debug!(tenants = cycles.len(), jobs, "scheduler tick complete");
                    }
                }
            }
        })
    }
}
