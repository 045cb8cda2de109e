//! Engine — the facade the daemon and tests drive.

use std::sync::Arc;

use stepgrid_core::StepgridConfig;
use stepgrid_provider::ProviderGateway;
use stepgrid_state::{Cluster, ClusterStatus, DrainReason, NewStep, Step, Store};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::LifecycleManager;
use crate::reconcile::{AuthBackoff, ReconcileReport, Reconciler};
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    lifecycle: Arc<LifecycleManager>,
    scheduler: Arc<Scheduler>,
    reconciler: Arc<Reconciler>,
    config: Arc<StepgridConfig>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ProviderGateway>,
        config: StepgridConfig,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            provider.clone(),
            config.lifecycle.clone(),
            config.scheduler.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            provider.clone(),
            lifecycle.clone(),
            config.scheduler.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            provider,
            lifecycle.clone(),
            scheduler.clone(),
            config.lifecycle.clone(),
            config.reconcile.clone(),
        ));
        Self {
            store,
            lifecycle,
            scheduler,
            reconciler,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &StepgridConfig {
        &self.config
    }

    // ── Steps ─────────────────────────────────────────────────────

    pub async fn submit_step(&self, new: NewStep) -> EngineResult<Step> {
        self.scheduler.submit(new).await
    }

    pub async fn cancel_step(&self, id: &str) -> EngineResult<Step> {
        self.scheduler.cancel(id).await
    }

    pub fn get_step_status(&self, id: &str) -> EngineResult<Step> {
        self.store
            .get_step(id)?
            .ok_or_else(|| EngineError::StepNotFound(id.to_string()))
    }

    pub fn list_steps(&self) -> EngineResult<Vec<Step>> {
        Ok(self.store.list_steps()?)
    }

    // ── Clusters ──────────────────────────────────────────────────

    pub fn get_cluster_status(&self, id: &str) -> EngineResult<Cluster> {
        self.store
            .get_cluster(id)?
            .ok_or_else(|| EngineError::ClusterNotFound(id.to_string()))
    }

    pub fn list_clusters(&self) -> EngineResult<Vec<Cluster>> {
        Ok(self.store.list_clusters()?)
    }

    /// Ask for a cluster to be torn down at `when` (unix seconds), or now.
    ///
    /// A deadline in the future only moves `terminate_on` forward in time
    /// for placement to respect. A deadline already due drains the cluster:
    /// queued steps are re-placed elsewhere and, if nothing is running,
    /// the cluster is terminated immediately.
    pub async fn request_termination(&self, id: &str, when: Option<u64>) -> EngineResult<Cluster> {
        let at = when.unwrap_or_else(|| self.store.now());
        let cluster = self
            .lifecycle
            .schedule_termination(id, at, DrainReason::Requested)
            .await?;
        if cluster.status != ClusterStatus::Draining {
            return Ok(cluster);
        }

        let evacuation = self.scheduler.evacuate(id, false)?;
        for step_id in &evacuation.requeued {
            if let Err(e) = self.scheduler.place(step_id).await {
                debug!(%step_id, error = %e, "re-placement deferred to reconciliation");
            }
        }
        let running = self.store.queue(id)?.iter().any(|s| s.status.is_active());
        if running {
            return self.get_cluster_status(id);
        }
        self.lifecycle.terminate(id).await
    }

    // ── Background work ───────────────────────────────────────────

    pub async fn reconcile_once(&self) -> ReconcileReport {
        self.reconciler.tick().await
    }

    /// Advance every cluster's queue once. Returns how many progressed.
    pub async fn advance_all(&self) -> EngineResult<usize> {
        self.scheduler.advance_all().await
    }

    /// Run reconciliation and the serial runner until `shutdown` flips.
    ///
    /// Reconciliation runs immediately, then every `reconcile.interval`,
    /// stretched while provider credentials keep failing.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let reconcile = &self.config.reconcile;
        let mut backoff = AuthBackoff::new(reconcile.interval, reconcile.auth_backoff_max);
        let mut runner = tokio::time::interval(reconcile.runner_interval);
        runner.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let next_reconcile = tokio::time::sleep_until(Instant::now());
        tokio::pin!(next_reconcile);

        info!(
            interval = ?reconcile.interval,
            runner_interval = ?reconcile.runner_interval,
            "engine started"
        );
        loop {
            tokio::select! {
                _ = &mut next_reconcile => {
                    let report = self.reconcile_once().await;
                    let previous = backoff.current();
                    let wait = backoff.record(report.auth_failures > 0);
                    if wait != previous {
                        warn!(
                            target: "stepgrid::events",
                            auth_failures = report.auth_failures,
                            next_in = ?wait,
                            "reconciliation interval changed"
                        );
                    }
                    next_reconcile.as_mut().reset(Instant::now() + wait);
                }
                _ = runner.tick() => {
                    match self.advance_all().await {
                        Ok(0) => {}
                        Ok(progressed) => debug!(progressed, "runner tick"),
                        Err(e) => warn!(error = %e, "runner tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("engine shutting down");
                    break;
                }
            }
        }
    }
}
