//! LifecycleManager — acquiring, draining and tearing down clusters.
//!
//! Cluster creation is serialized per configuration fingerprint so that
//! concurrent placements of equivalent steps share one new cluster instead
//! of each requesting their own. Teardown is serialized per cluster, so the
//! provider sees one terminate request however many callers race. Everything
//! else is a compare-and-set on the store, retried against the freshly read
//! record when it loses a race.

use std::collections::HashMap;
use std::sync::Arc;

use stepgrid_core::Fingerprint;
use stepgrid_core::config::{LifecycleConfig, SchedulerConfig};
use stepgrid_provider::{ClusterSpec, ProviderGateway};
use stepgrid_state::{
    Cluster, ClusterId, ClusterStatus, DrainReason, NewCluster, StateError, Store,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::placement::{Candidate, LeadTimeModel, PlacementRequest, rank_clusters};

/// Compare-and-set attempts before a lost race is reported to the caller.
const CAS_ATTEMPTS: u32 = 5;

pub struct LifecycleManager {
    store: Arc<dyn Store>,
    provider: Arc<dyn ProviderGateway>,
    lifecycle: LifecycleConfig,
    scheduler: SchedulerConfig,
    model: LeadTimeModel,
    creation_locks: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
    teardown_locks: Mutex<HashMap<ClusterId, Arc<Mutex<()>>>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ProviderGateway>,
        lifecycle: LifecycleConfig,
        scheduler: SchedulerConfig,
    ) -> Self {
        let model = LeadTimeModel::from(&scheduler);
        Self {
            store,
            provider,
            lifecycle,
            scheduler,
            model,
            creation_locks: Mutex::new(HashMap::new()),
            teardown_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &LeadTimeModel {
        &self.model
    }

    fn cluster(&self, id: &str) -> EngineResult<Cluster> {
        self.store
            .get_cluster(id)?
            .ok_or_else(|| EngineError::ClusterNotFound(id.to_string()))
    }

    async fn creation_lock(&self, fingerprint: &Fingerprint) -> Arc<Mutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        locks.entry(fingerprint.clone()).or_default().clone()
    }

    async fn teardown_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.teardown_locks.lock().await;
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Live clusters sharing `fingerprint`, each with its current queue.
    fn candidates(&self, fingerprint: &Fingerprint) -> EngineResult<Vec<Candidate>> {
        let clusters = self.store.list_clusters_by_status(&[
            ClusterStatus::Requested,
            ClusterStatus::Provisioning,
            ClusterStatus::Ready,
            ClusterStatus::Draining,
        ])?;
        let mut candidates = Vec::new();
        for cluster in clusters {
            if &cluster.fingerprint != fingerprint {
                continue;
            }
            let queue = self.store.queue(&cluster.id)?;
            candidates.push(Candidate { cluster, queue });
        }
        Ok(candidates)
    }

    // ── Acquire ───────────────────────────────────────────────────

    /// Find or create a cluster able to take the requested step.
    ///
    /// Prefers an accepting cluster, then an idle-drained one (which is
    /// reopened), and only then records and requests a new cluster.
    pub async fn acquire(&self, req: &PlacementRequest) -> EngineResult<Cluster> {
        let lock = self.creation_lock(&req.fingerprint).await;
        let _guard = lock.lock().await;

        let now = self.store.now();
        let candidates = self.candidates(&req.fingerprint)?;
        let ranked = rank_clusters(&candidates, req, &self.scheduler.weights, &self.model, now);

        if let Some(best) = ranked.first()
            && let Some(candidate) = candidates.iter().find(|c| c.cluster.id == best.cluster_id)
        {
            debug!(
                cluster_id = %best.cluster_id,
                score = best.score,
                queue = best.breakdown.queue,
                lead_time = best.breakdown.lead_time,
                expected_finish = best.expected_finish,
                eligible = ranked.len(),
                "cluster selected"
            );
            if best.needs_reopen {
                return self.reopen(&candidate.cluster);
            }
            return Ok(candidate.cluster.clone());
        }

        self.create(req).await
    }

    /// Put an idle-drained cluster back into service.
    fn reopen(&self, cluster: &Cluster) -> EngineResult<Cluster> {
        let now = self.store.now();
        let reopened = self.store.compare_and_set_cluster(
            &cluster.id,
            ClusterStatus::Draining,
            ClusterStatus::Ready,
            &mut |c| {
                c.drain = None;
                c.drain_started_on = None;
                c.last_activity_on = now;
            },
        )?;
        info!(cluster_id = %cluster.id, "idle cluster reopened");
        Ok(reopened)
    }

    async fn create(&self, req: &PlacementRequest) -> EngineResult<Cluster> {
        let now = self.store.now();
        let terminate_on = if self.lifecycle.max_lifetime.is_zero() {
            None
        } else {
            Some(now.saturating_add(self.lifecycle.max_lifetime.as_secs()))
        };
        let cluster = self.store.insert_cluster(NewCluster {
            name: req.cluster_name.clone(),
            config: req.cluster_config.clone(),
            terminate_on,
        })?;
        info!(
            cluster_id = %cluster.id,
            fingerprint = %cluster.fingerprint,
            terminate_on = ?cluster.terminate_on,
            "cluster requested"
        );
        self.request_creation(cluster).await
    }

    /// Ask the provider to create a Requested cluster.
    ///
    /// The cluster id is the idempotency token, so re-issuing after a lost
    /// response yields the same provider cluster. A fatal rejection closes
    /// the cluster and is returned; any other failure leaves it Requested
    /// for reconciliation to retry.
    pub async fn request_creation(&self, cluster: Cluster) -> EngineResult<Cluster> {
        let spec = ClusterSpec {
            client_token: cluster.id.clone(),
            name: cluster.name.clone(),
            config: cluster.config.clone(),
        };
        match self.provider.create_cluster(&spec).await {
            Ok(handle) => {
                let result = self.store.compare_and_set_cluster(
                    &cluster.id,
                    cluster.status,
                    ClusterStatus::Provisioning,
                    &mut |c| {
                        c.provider_handle = Some(handle.clone());
                        c.last_error = None;
                    },
                );
                match result {
                    Ok(updated) => {
                        info!(cluster_id = %cluster.id, %handle, "cluster provisioning");
                        Ok(updated)
                    }
                    Err(e) if e.is_unavailable() => {
                        warn!(cluster_id = %cluster.id, %handle, error = %e, "could not record provider handle");
                        let parked = self.store.mark_cluster_no_update(&cluster.id, &e.to_string())?;
                        Ok(parked)
                    }
                    Err(e) if e.is_conflict() => self.record_late_handle(&cluster.id, &handle),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) if e.is_fatal() => {
                warn!(
                    target: "stepgrid::events",
                    cluster_id = %cluster.id,
                    error = %e,
                    "cluster creation rejected"
                );
                let message = e.to_string();
                self.store.compare_and_set_cluster(
                    &cluster.id,
                    cluster.status,
                    ClusterStatus::Terminated,
                    &mut |c| {
                        c.last_error = Some(message.clone());
                        c.teardown_confirmed = true;
                    },
                )?;
                Err(e.into())
            }
            Err(e) => {
                warn!(cluster_id = %cluster.id, error = %e, "cluster creation deferred");
                let message = e.to_string();
                let updated = self.store.compare_and_set_cluster(
                    &cluster.id,
                    cluster.status,
                    cluster.status,
                    &mut |c| c.last_error = Some(message.clone()),
                )?;
                Ok(updated)
            }
        }
    }

    /// Attach a provider handle to a record that moved on while its create
    /// call was in flight. A record that was already closed is reopened for
    /// the teardown sweep.
    pub fn record_late_handle(&self, id: &str, handle: &str) -> EngineResult<Cluster> {
        for _ in 0..CAS_ATTEMPTS {
            let current = self.cluster(id)?;
            if current.provider_handle.is_some() {
                return Ok(current);
            }
            let closed = current.status.is_terminal();
            let result = self.store.compare_and_set_cluster(
                id,
                current.status,
                current.status,
                &mut |c| {
                    c.provider_handle = Some(handle.to_string());
                    if closed {
                        c.teardown_confirmed = false;
                    }
                },
            );
            match result {
                Ok(updated) => {
                    if closed {
                        warn!(
                            target: "stepgrid::events",
                            cluster_id = %id,
                            %handle,
                            "provider cluster found for a closed record"
                        );
                    } else {
                        info!(cluster_id = %id, %handle, status = %updated.status, "late provider handle recorded");
                    }
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::Conflict(format!("cluster {id} kept changing while recording its handle")).into())
    }

    /// Find the provider cluster of a closed record whose create outcome was
    /// never learned.
    ///
    /// Re-issuing the create with the same token returns the existing
    /// cluster if there is one. Returns `None` when the provider rejects the
    /// request outright.
    pub async fn resolve_handle(&self, cluster: &Cluster) -> EngineResult<Option<String>> {
        if let Some(handle) = cluster.provider_handle.clone() {
            return Ok(Some(handle));
        }
        let spec = ClusterSpec {
            client_token: cluster.id.clone(),
            name: cluster.name.clone(),
            config: cluster.config.clone(),
        };
        match self.provider.create_cluster(&spec).await {
            Ok(handle) => {
                let updated = self.record_late_handle(&cluster.id, &handle)?;
                Ok(updated.provider_handle)
            }
            Err(e) if e.is_fatal() || e.is_not_found() => {
                debug!(cluster_id = %cluster.id, error = %e, "no provider cluster behind record");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Drain ─────────────────────────────────────────────────────

    /// Bring `terminate_on` forward to `at` (never later than it already
    /// is). If the deadline has passed, an accepting cluster starts
    /// draining for `reason`.
    pub async fn schedule_termination(
        &self,
        id: &str,
        at: u64,
        reason: DrainReason,
    ) -> EngineResult<Cluster> {
        let mut last_conflict = None;
        for _ in 0..CAS_ATTEMPTS {
            let cluster = self.cluster(id)?;
            if cluster.status.is_terminal() {
                return Ok(cluster);
            }
            let now = self.store.now();
            let deadline = cluster.terminate_on.map_or(at, |t| t.min(at));
            let due = deadline <= now;
            let starts_drain = due && cluster.status.is_accepting();
            let overrides_drain = due && cluster.status == ClusterStatus::Draining;
            let next = if starts_drain {
                ClusterStatus::Draining
            } else {
                cluster.status
            };

            let result = self.store.compare_and_set_cluster(id, cluster.status, next, &mut |c| {
                c.terminate_on = Some(deadline);
                if starts_drain || overrides_drain {
                    c.drain = Some(reason);
                }
                if starts_drain {
                    c.drain_started_on = Some(now);
                }
            });
            match result {
                Ok(updated) => {
                    if starts_drain {
                        info!(cluster_id = %id, ?reason, terminate_on = deadline, "cluster draining");
                    } else {
                        debug!(cluster_id = %id, terminate_on = deadline, "termination scheduled");
                    }
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => last_conflict = Some(e),
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_conflict
            .unwrap_or_else(|| StateError::Conflict(format!("cluster {id}")))
            .into())
    }

    /// Stop a Ready cluster from taking new work.
    pub fn begin_drain(&self, id: &str, reason: DrainReason) -> EngineResult<Cluster> {
        let now = self.store.now();
        let cluster = self.store.compare_and_set_cluster(
            id,
            ClusterStatus::Ready,
            ClusterStatus::Draining,
            &mut |c| {
                c.drain = Some(reason);
                c.drain_started_on = Some(now);
            },
        )?;
        info!(cluster_id = %id, ?reason, "cluster draining");
        Ok(cluster)
    }

    // ── Terminate ─────────────────────────────────────────────────

    /// Tear a cluster down at the provider and close its record.
    ///
    /// Calling this on a Terminated cluster returns it without touching the
    /// provider. If the provider never confirms the teardown the record is
    /// closed anyway with `teardown_confirmed = false`, for the
    /// reconciliation sweep to finish. The same holds for a cluster with no
    /// handle whose create call failed without a clear answer: the provider
    /// may have started it anyway.
    pub async fn terminate(&self, id: &str) -> EngineResult<Cluster> {
        let lock = self.teardown_lock(id).await;
        let _guard = lock.lock().await;

        let cluster = self.cluster(id)?;
        if cluster.status.is_terminal() {
            return Ok(cluster);
        }
        let confirmed = match cluster.provider_handle.as_deref() {
            Some(handle) => {
                self.mark_teardown_issued(id)?;
                self.teardown(id, handle).await
            }
            None => cluster.last_error.is_none(),
        };
        self.close(id, confirmed, None)
    }

    fn mark_teardown_issued(&self, id: &str) -> EngineResult<Cluster> {
        let now = self.store.now();
        for _ in 0..CAS_ATTEMPTS {
            let current = self.cluster(id)?;
            if current.status.is_terminal() {
                return Ok(current);
            }
            let result = self.store.compare_and_set_cluster(
                id,
                current.status,
                current.status,
                &mut |c| c.teardown_issued_on = Some(now),
            );
            match result {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::Conflict(format!("cluster {id} kept changing before teardown")).into())
    }

    async fn teardown(&self, id: &str, handle: &str) -> bool {
        let attempts = self.lifecycle.terminate_retries.max(1);
        for attempt in 1..=attempts {
            match self.provider.terminate_cluster(handle).await {
                Ok(()) => return true,
                Err(e) if e.is_not_found() => return true,
                Err(e) if e.is_retriable() => {
                    debug!(cluster_id = %id, %handle, attempt, error = %e, "teardown attempt failed");
                }
                Err(e) => {
                    warn!(cluster_id = %id, %handle, error = %e, "teardown refused");
                    return false;
                }
            }
        }
        false
    }

    /// Record a cluster as Terminated without calling the provider.
    ///
    /// A store outage parks the cluster at `NoUpdate` instead; the record
    /// is settled on the next reconciliation.
    pub fn close(&self, id: &str, confirmed: bool, reason: Option<&str>) -> EngineResult<Cluster> {
        let now = self.store.now();
        for _ in 0..CAS_ATTEMPTS {
            let current = self.cluster(id)?;
            if current.status.is_terminal() {
                return Ok(current);
            }
            let result = self.store.compare_and_set_cluster(
                id,
                current.status,
                ClusterStatus::Terminated,
                &mut |c| {
                    c.teardown_confirmed = confirmed;
                    if c.drain_started_on.is_none() {
                        c.drain_started_on = Some(now);
                    }
                    if let Some(reason) = reason {
                        c.last_error = Some(reason.to_string());
                    }
                },
            );
            match result {
                Ok(cluster) => {
                    if confirmed {
                        info!(cluster_id = %id, handle = ?cluster.provider_handle, "cluster terminated");
                    } else {
                        warn!(
                            target: "stepgrid::events",
                            cluster_id = %id,
                            handle = ?cluster.provider_handle,
                            "cluster closed without provider confirmation"
                        );
                    }
                    return Ok(cluster);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) if e.is_unavailable() => {
                    warn!(cluster_id = %id, error = %e, "could not record termination");
                    return Ok(self.store.mark_cluster_no_update(id, &e.to_string())?);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::Conflict(format!("cluster {id} kept changing while closing")).into())
    }

    /// Mark a Terminated cluster's teardown as confirmed by the provider.
    pub fn confirm_teardown(&self, id: &str) -> EngineResult<Cluster> {
        let cluster = self.store.compare_and_set_cluster(
            id,
            ClusterStatus::Terminated,
            ClusterStatus::Terminated,
            &mut |c| c.teardown_confirmed = true,
        )?;
        info!(cluster_id = %id, "cluster teardown confirmed");
        Ok(cluster)
    }
}
