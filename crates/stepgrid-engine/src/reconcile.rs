//! Reconciler — periodic repair of drift between the store and the provider.
//!
//! One [`Reconciler::tick`] runs these passes in order:
//! 1. **Clusters**: poll every live cluster, adopt the provider's status,
//!    start deadline and idle drains, and terminate drained clusters.
//! 2. **Teardown sweep**: finish teardowns the provider never confirmed.
//! 3. **Orphans**: evacuate steps whose cluster disappeared.
//! 4. **Placement**: place Pending steps.
//! 5. **Runner**: advance every cluster's queue.
//!
//! A tick never fails as a whole. Errors are logged, counted in the
//! [`ReconcileReport`], and the pass moves on to the next entity.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use stepgrid_core::config::{LifecycleConfig, ReconcileConfig};
use stepgrid_provider::{ProviderClusterStatus, ProviderGateway};
use stepgrid_state::{Cluster, ClusterStatus, DrainReason, StepStatus, Store};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::LifecycleManager;
use crate::scheduler::{Evacuation, Scheduler};

/// Reconciliation interval that doubles while provider credentials keep
/// failing and snaps back once a tick completes without an auth failure.
#[derive(Debug, Clone)]
pub struct AuthBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl AuthBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// Record a tick's outcome and return the interval until the next one.
    pub fn record(&mut self, auth_failed: bool) -> Duration {
        if auth_failed {
            self.current = (self.current * 2).min(self.max);
        } else {
            self.current = self.base;
        }
        self.current
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Counters for one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub clusters_polled: usize,
    pub transitions: usize,
    pub auth_failures: usize,
    pub transient_failures: usize,
    pub steps_placed: usize,
    pub steps_failed: usize,
    pub steps_requeued: usize,
    pub teardowns_confirmed: usize,
    pub runner_advances: usize,
    pub store_errors: usize,
}

impl ReconcileReport {
    fn absorb(&mut self, evacuation: &Evacuation) {
        self.steps_requeued += evacuation.requeued.len();
        self.steps_failed += evacuation.failed.len();
    }

    fn record_error(&mut self, error: &EngineError) {
        match error {
            EngineError::Provider(e) if e.is_auth_expired() => self.auth_failures += 1,
            EngineError::Provider(_) => self.transient_failures += 1,
            _ => self.store_errors += 1,
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    provider: Arc<dyn ProviderGateway>,
    lifecycle: Arc<LifecycleManager>,
    scheduler: Arc<Scheduler>,
    lifecycle_config: LifecycleConfig,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ProviderGateway>,
        lifecycle: Arc<LifecycleManager>,
        scheduler: Arc<Scheduler>,
        lifecycle_config: LifecycleConfig,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            provider,
            lifecycle,
            scheduler,
            lifecycle_config,
            config,
        }
    }

    /// Run one full reconciliation pass.
    pub async fn tick(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        match self.store.list_clusters_by_status(&[
            ClusterStatus::Requested,
            ClusterStatus::Provisioning,
            ClusterStatus::Ready,
            ClusterStatus::Draining,
            ClusterStatus::NoUpdate,
        ]) {
            Ok(clusters) => {
                for cluster in clusters {
                    let id = cluster.id.clone();
                    if let Err(e) = self.reconcile_cluster(cluster, &mut report).await {
                        warn!(cluster_id = %id, error = %e, "cluster reconciliation failed");
                        report.record_error(&e);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "could not list clusters");
                report.store_errors += 1;
            }
        }

        if let Err(e) = self.sweep_unconfirmed(&mut report).await {
            warn!(error = %e, "teardown sweep failed");
            report.record_error(&e);
        }
        if let Err(e) = self.evacuate_orphans(&mut report) {
            warn!(error = %e, "orphan sweep failed");
            report.record_error(&e);
        }
        match self.scheduler.place_pending().await {
            Ok(pass) => {
                report.steps_placed += pass.placed;
                report.steps_failed += pass.failed;
            }
            Err(e) => {
                warn!(error = %e, "placement pass failed");
                report.record_error(&e);
            }
        }
        match self.scheduler.advance_all().await {
            Ok(advances) => report.runner_advances += advances,
            Err(e) => {
                warn!(error = %e, "runner pass failed");
                report.record_error(&e);
            }
        }

        debug!(?report, "reconciliation tick finished");
        report
    }

    fn cluster(&self, id: &str) -> EngineResult<Cluster> {
        self.store
            .get_cluster(id)?
            .ok_or_else(|| EngineError::ClusterNotFound(id.to_string()))
    }

    // ── Clusters ──────────────────────────────────────────────────

    async fn reconcile_cluster(
        &self,
        cluster: Cluster,
        report: &mut ReconcileReport,
    ) -> EngineResult<()> {
        let id = cluster.id.clone();
        let now = self.store.now();

        match cluster.provider_handle.clone() {
            None => self.reconcile_unacknowledged(cluster, now, report).await?,
            Some(handle) => {
                let status = match self.provider.get_status(&handle).await {
                    Ok(status) => status,
                    Err(e) if e.is_not_found() => ProviderClusterStatus::Terminated,
                    Err(e) if e.is_auth_expired() => {
                        // Nothing is known; leave the record untouched.
                        report.auth_failures += 1;
                        return Ok(());
                    }
                    Err(e) => {
                        debug!(cluster_id = %id, %handle, error = %e, "cluster poll failed");
                        report.transient_failures += 1;
                        return Ok(());
                    }
                };
                report.clusters_polled += 1;
                if status == ProviderClusterStatus::Terminated {
                    return self.adopt_lost(&cluster, report);
                }
                self.adopt_status(&cluster, status, now, report)?;
            }
        }

        let cluster = self.cluster(&id)?;
        if cluster.status.is_terminal() || cluster.status == ClusterStatus::NoUpdate {
            return Ok(());
        }
        let cluster = self.enforce_deadline(cluster, now, report)?;
        let cluster = self.enforce_idle(cluster, now, report)?;
        if cluster.status == ClusterStatus::Draining {
            self.settle_drain(&cluster, now, report).await?;
        }
        Ok(())
    }

    /// A cluster the provider has not acknowledged yet.
    async fn reconcile_unacknowledged(
        &self,
        cluster: Cluster,
        now: u64,
        report: &mut ReconcileReport,
    ) -> EngineResult<()> {
        match cluster.status {
            ClusterStatus::Requested => {
                let due = cluster.updated_on.saturating_add(self.config.create_retry_after.as_secs());
                if now < due {
                    return Ok(());
                }
                let id = cluster.id.clone();
                debug!(cluster_id = %id, "re-issuing cluster creation");
                match self.lifecycle.request_creation(cluster).await {
                    Ok(updated) => {
                        if updated.status != ClusterStatus::Requested {
                            report.transitions += 1;
                        }
                    }
                    Err(e) if e.is_provider_fatal() => {
                        report.transitions += 1;
                        let evacuation = self.scheduler.evacuate(&id, true)?;
                        report.absorb(&evacuation);
                    }
                    Err(e) => return Err(e),
                }
            }
            ClusterStatus::NoUpdate => {
                // Creation may or may not have happened; the next creation
                // request is idempotent, or the drain resumes.
                let target = if cluster.drain.is_some() {
                    ClusterStatus::Draining
                } else {
                    ClusterStatus::Requested
                };
                self.store
                    .compare_and_set_cluster(&cluster.id, ClusterStatus::NoUpdate, target, &mut |_| {})?;
                info!(cluster_id = %cluster.id, status = %target, "cluster restored");
                report.transitions += 1;
            }
            _ => {}
        }
        Ok(())
    }

    /// The provider no longer has the cluster: close the record and move
    /// its steps elsewhere.
    fn adopt_lost(&self, cluster: &Cluster, report: &mut ReconcileReport) -> EngineResult<()> {
        let expected = cluster.teardown_issued_on.is_some()
            || cluster.previous_status == Some(ClusterStatus::Draining)
            || (cluster.drain.is_some() && !cluster.status.is_accepting());
        let reason = (!expected).then_some("cluster terminated outside stepgrid");
        if reason.is_some() {
            warn!(
                target: "stepgrid::events",
                cluster_id = %cluster.id,
                handle = ?cluster.provider_handle,
                "cluster lost"
            );
        }
        let closed = self.lifecycle.close(&cluster.id, true, reason)?;
        if closed.status.is_terminal() {
            report.transitions += 1;
            report.teardowns_confirmed += 1;
            let evacuation = self.scheduler.evacuate(&cluster.id, true)?;
            report.absorb(&evacuation);
        }
        Ok(())
    }

    /// Move the local status to match what the provider reports.
    fn adopt_status(
        &self,
        cluster: &Cluster,
        status: ProviderClusterStatus,
        now: u64,
        report: &mut ReconcileReport,
    ) -> EngineResult<()> {
        let target = match cluster.status {
            ClusterStatus::NoUpdate
                if cluster.drain.is_some() || cluster.teardown_issued_on.is_some() =>
            {
                ClusterStatus::Draining
            }
            ClusterStatus::NoUpdate if status.is_up() => ClusterStatus::Ready,
            ClusterStatus::NoUpdate => ClusterStatus::Provisioning,
            ClusterStatus::Requested | ClusterStatus::Provisioning if status.is_up() => {
                ClusterStatus::Ready
            }
            ClusterStatus::Requested => ClusterStatus::Provisioning,
            other => other,
        };
        if target == cluster.status {
            return Ok(());
        }
        let became_ready = target == ClusterStatus::Ready;
        self.store
            .compare_and_set_cluster(&cluster.id, cluster.status, target, &mut |c| {
                if became_ready {
                    c.last_activity_on = now;
                }
            })?;
        info!(cluster_id = %cluster.id, from = %cluster.status, to = %target, provider = ?status, "cluster status adopted");
        report.transitions += 1;
        Ok(())
    }

    /// Start draining an accepting cluster whose deadline has passed.
    fn enforce_deadline(
        &self,
        cluster: Cluster,
        now: u64,
        report: &mut ReconcileReport,
    ) -> EngineResult<Cluster> {
        let due = cluster.terminate_on.is_some_and(|t| t <= now);
        if !due || !cluster.status.is_accepting() {
            return Ok(cluster);
        }
        let drained = self.store.compare_and_set_cluster(
            &cluster.id,
            cluster.status,
            ClusterStatus::Draining,
            &mut |c| {
                c.drain = Some(DrainReason::Deadline);
                c.drain_started_on = Some(now);
            },
        )?;
        info!(cluster_id = %cluster.id, terminate_on = ?cluster.terminate_on, "cluster reached its deadline");
        report.transitions += 1;
        let evacuation = self.scheduler.evacuate(&cluster.id, false)?;
        report.absorb(&evacuation);
        Ok(drained)
    }

    /// Drain a Ready cluster whose queue has been empty for too long.
    fn enforce_idle(
        &self,
        cluster: Cluster,
        now: u64,
        report: &mut ReconcileReport,
    ) -> EngineResult<Cluster> {
        if cluster.status != ClusterStatus::Ready {
            return Ok(cluster);
        }
        let idle_for = now.saturating_sub(cluster.last_activity_on);
        if idle_for < self.lifecycle_config.idle_timeout.as_secs()
            || !self.store.queue(&cluster.id)?.is_empty()
        {
            return Ok(cluster);
        }
        debug!(cluster_id = %cluster.id, idle_for, "cluster idle");
        let drained = self.lifecycle.begin_drain(&cluster.id, DrainReason::Idle)?;
        report.transitions += 1;
        Ok(drained)
    }

    /// Terminate a draining cluster once its drain has run its course.
    async fn settle_drain(
        &self,
        cluster: &Cluster,
        now: u64,
        report: &mut ReconcileReport,
    ) -> EngineResult<()> {
        let queue = self.store.queue(&cluster.id)?;
        let active = queue.iter().any(|s| s.status.is_active());
        let forced = match cluster.drain {
            Some(DrainReason::Idle) => {
                let started = cluster.drain_started_on.unwrap_or(cluster.updated_on);
                if now < started.saturating_add(self.lifecycle_config.idle_grace.as_secs()) {
                    return Ok(());
                }
                active
            }
            _ if !active => false,
            _ => {
                let grace_over = cluster
                    .terminate_on
                    .is_some_and(|t| now >= t.saturating_add(self.lifecycle_config.drain_grace.as_secs()));
                if !grace_over {
                    return Ok(());
                }
                warn!(
                    target: "stepgrid::events",
                    cluster_id = %cluster.id,
                    "drain grace exceeded, terminating with a running step"
                );
                true
            }
        };

        let evacuation = self.scheduler.evacuate(&cluster.id, false)?;
        report.absorb(&evacuation);
        let closed = self.lifecycle.terminate(&cluster.id).await?;
        if closed.status.is_terminal() {
            report.transitions += 1;
            if closed.teardown_confirmed {
                report.teardowns_confirmed += 1;
            }
        }
        if forced {
            let evacuation = self.scheduler.evacuate(&cluster.id, true)?;
            report.absorb(&evacuation);
        }
        Ok(())
    }

    // ── Sweeps ────────────────────────────────────────────────────

    /// Re-drive teardowns of Terminated clusters the provider never
    /// confirmed. A record without a handle first has its provider cluster
    /// looked up by creation token.
    async fn sweep_unconfirmed(&self, report: &mut ReconcileReport) -> EngineResult<()> {
        let clusters = self
            .store
            .list_clusters_by_status(&[ClusterStatus::Terminated])?;
        for cluster in clusters.into_iter().filter(|c| !c.teardown_confirmed) {
            let handle = match self.lifecycle.resolve_handle(&cluster).await {
                Ok(Some(handle)) => handle,
                Ok(None) => {
                    self.lifecycle.confirm_teardown(&cluster.id)?;
                    report.teardowns_confirmed += 1;
                    continue;
                }
                Err(e) => {
                    debug!(cluster_id = %cluster.id, error = %e, "provider cluster lookup failed");
                    report.record_error(&e);
                    continue;
                }
            };
            let handle = handle.as_str();
            let gone = match self.provider.get_status(handle).await {
                Ok(ProviderClusterStatus::Terminated) => true,
                Err(e) if e.is_not_found() => true,
                Ok(_) => match self.provider.terminate_cluster(handle).await {
                    Ok(()) => true,
                    Err(e) if e.is_not_found() => true,
                    Err(e) => {
                        debug!(cluster_id = %cluster.id, %handle, error = %e, "teardown retry failed");
                        report.record_error(&EngineError::from(e));
                        false
                    }
                },
                Err(e) => {
                    debug!(cluster_id = %cluster.id, %handle, error = %e, "teardown poll failed");
                    report.record_error(&EngineError::from(e));
                    false
                }
            };
            if gone {
                self.lifecycle.confirm_teardown(&cluster.id)?;
                report.teardowns_confirmed += 1;
            }
        }
        Ok(())
    }

    /// Evacuate steps still attached to a cluster that is gone.
    fn evacuate_orphans(&self, report: &mut ReconcileReport) -> EngineResult<()> {
        let attached = self.store.list_steps_by_status(&[
            StepStatus::Assigned,
            StepStatus::Running,
            StepStatus::NoUpdate,
        ])?;
        let cluster_ids: BTreeSet<String> = attached.into_iter().filter_map(|s| s.cluster_id).collect();
        for cluster_id in cluster_ids {
            let gone = self
                .store
                .get_cluster(&cluster_id)?
                .is_none_or(|c| c.status.is_terminal());
            if gone {
                debug!(%cluster_id, "evacuating orphaned steps");
                let evacuation = self.scheduler.evacuate(&cluster_id, true)?;
                report.absorb(&evacuation);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_backoff_doubles_and_caps() {
        let mut backoff = AuthBackoff::new(Duration::from_secs(30), Duration::from_secs(100));
        assert_eq!(backoff.current(), Duration::from_secs(30));
        assert_eq!(backoff.record(true), Duration::from_secs(60));
        assert_eq!(backoff.record(true), Duration::from_secs(100));
        assert_eq!(backoff.record(true), Duration::from_secs(100));
    }

    #[test]
    fn auth_backoff_resets_on_clean_tick() {
        let mut backoff = AuthBackoff::new(Duration::from_secs(30), Duration::from_secs(600));
        backoff.record(true);
        backoff.record(true);
        assert_eq!(backoff.record(false), Duration::from_secs(30));
    }

    #[test]
    fn auth_backoff_never_drops_below_base() {
        let mut backoff = AuthBackoff::new(Duration::from_secs(30), Duration::from_secs(10));
        assert_eq!(backoff.record(true), Duration::from_secs(30));
    }

    #[test]
    fn report_classifies_errors() {
        use stepgrid_provider::{ProviderError, ProviderOp};
        use stepgrid_state::StateError;

        let mut report = ReconcileReport::default();
        report.record_error(&EngineError::from(ProviderError::auth_expired(ProviderOp::GetStatus, "expired")));
        report.record_error(&EngineError::from(ProviderError::transient(ProviderOp::GetStatus, "throttled")));
        report.record_error(&EngineError::from(StateError::Write("disk full".to_string())));
        assert_eq!(report.auth_failures, 1);
        assert_eq!(report.transient_failures, 1);
        assert_eq!(report.store_errors, 1);
    }
}
