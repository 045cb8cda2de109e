//! Scheduler — placing steps on clusters and running each cluster's queue
//! one step at a time.
//!
//! Placement is optimistic: a cluster is chosen from a snapshot, then the
//! step is appended with a compare-and-set that fails if the cluster stopped
//! accepting in the meantime. A lost race re-reads and chooses again.
//!
//! Execution is driven by [`Scheduler::advance`], which is serialized per
//! cluster. The store refuses to start a second step on a cluster while one
//! is active, so even two processes advancing the same cluster never submit
//! overlapping steps.

use std::collections::HashMap;
use std::sync::Arc;

use stepgrid_core::config::SchedulerConfig;
use stepgrid_provider::{ProviderGateway, ProviderStepStatus, StepSpec};
use stepgrid_state::{
    ClaimOutcome, ClusterId, ClusterStatus, NewStep, Step, StepId, StepStatus, Store,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::LifecycleManager;
use crate::placement::{LeadTimeModel, PlacementRequest};

/// Compare-and-set attempts for a cancellation racing the runner.
const CANCEL_ATTEMPTS: u32 = 5;

/// What one [`Scheduler::advance`] call did on a cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvanceOutcome {
    /// A step that reached a terminal status.
    pub finished: Option<Step>,
    /// A step handed to the provider.
    pub submitted: Option<Step>,
    /// A step still executing at the provider.
    pub running: Option<Step>,
}

impl AdvanceOutcome {
    /// Whether any step changed status.
    pub fn progressed(&self) -> bool {
        self.finished.is_some() || self.submitted.is_some()
    }
}

/// Steps moved off a cluster that can no longer run them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evacuation {
    /// Sent back to Pending for re-placement.
    pub requeued: Vec<StepId>,
    /// Out of retries, or lost with their cluster.
    pub failed: Vec<StepId>,
}

/// Result of placing every Pending step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlacementPass {
    pub placed: usize,
    pub failed: usize,
    pub deferred: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    provider: Arc<dyn ProviderGateway>,
    lifecycle: Arc<LifecycleManager>,
    config: SchedulerConfig,
    model: LeadTimeModel,
    runner_locks: Mutex<HashMap<ClusterId, Arc<Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ProviderGateway>,
        lifecycle: Arc<LifecycleManager>,
        config: SchedulerConfig,
    ) -> Self {
        let model = LeadTimeModel::from(&config);
        Self {
            store,
            provider,
            lifecycle,
            config,
            model,
            runner_locks: Mutex::new(HashMap::new()),
        }
    }

    fn step(&self, id: &str) -> EngineResult<Step> {
        self.store
            .get_step(id)?
            .ok_or_else(|| EngineError::StepNotFound(id.to_string()))
    }

    async fn runner_lock(&self, cluster_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.runner_locks.lock().await;
        locks.entry(cluster_id.to_string()).or_default().clone()
    }

    // ── Placement ─────────────────────────────────────────────────

    /// Record a new step and try to place it right away.
    ///
    /// A step that cannot be placed yet stays Pending and is picked up by
    /// the next placement pass.
    pub async fn submit(&self, new: NewStep) -> EngineResult<Step> {
        let step = self.store.insert_step(new)?;
        info!(
            step_id = %step.id,
            name = %step.name,
            owner = %step.owner,
            fingerprint = %step.fingerprint,
            "step submitted"
        );
        match self.place(&step.id).await {
            Ok(placed) => Ok(placed),
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "placement deferred");
                self.step(&step.id)
            }
        }
    }

    /// Place a Pending step on the best eligible cluster, creating one if
    /// none qualifies. Steps that are no longer Pending are returned as is.
    pub async fn place(&self, step_id: &str) -> EngineResult<Step> {
        let attempts = self.config.max_placement_attempts.max(1);
        for attempt in 1..=attempts {
            let step = self.step(step_id)?;
            if step.status != StepStatus::Pending {
                return Ok(step);
            }
            let req = PlacementRequest::for_step(&step, &self.model);
            let cluster = match self.lifecycle.acquire(&req).await {
                Ok(cluster) => cluster,
                Err(e) if e.is_provider_fatal() => {
                    return self.fail_pending(&step, &e.to_string());
                }
                Err(EngineError::State(e)) if e.is_conflict() => {
                    debug!(%step_id, attempt, error = %e, "cluster changed during acquire, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.store.append_to_queue(&cluster.id, step_id) {
                Ok(placed) => {
                    info!(
                        %step_id,
                        cluster_id = %cluster.id,
                        ordering_key = ?placed.ordering_key,
                        attempt,
                        "step placed"
                    );
                    return Ok(placed);
                }
                Err(e) if e.is_conflict() => {
                    debug!(%step_id, cluster_id = %cluster.id, attempt, error = %e, "placement lost a race, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::PlacementExhausted(step_id.to_string()))
    }

    fn fail_pending(&self, step: &Step, reason: &str) -> EngineResult<Step> {
        let failed = self.store.compare_and_set_step(
            &step.id,
            StepStatus::Pending,
            StepStatus::Failed,
            &mut |s| s.last_error = Some(reason.to_string()),
        )?;
        warn!(
            target: "stepgrid::events",
            step_id = %step.id,
            %reason,
            "step failed before placement"
        );
        Ok(failed)
    }

    /// Place every Pending step, oldest first.
    pub async fn place_pending(&self) -> EngineResult<PlacementPass> {
        let mut pass = PlacementPass::default();
        for step in self.store.list_steps_by_status(&[StepStatus::Pending])? {
            match self.place(&step.id).await {
                Ok(placed) if placed.status == StepStatus::Assigned => pass.placed += 1,
                Ok(placed) if placed.status == StepStatus::Failed => pass.failed += 1,
                Ok(_) => {}
                Err(e) => {
                    debug!(step_id = %step.id, error = %e, "step left pending");
                    pass.deferred += 1;
                }
            }
        }
        Ok(pass)
    }

    // ── Cancellation ──────────────────────────────────────────────

    /// Cancel a step. Queued steps are dropped locally; a running step is
    /// cancelled at the provider first. If the provider cannot stop it the
    /// step is still cancelled locally and left to finish remotely.
    pub async fn cancel(&self, step_id: &str) -> EngineResult<Step> {
        let mut attempted = false;
        for _ in 0..CANCEL_ATTEMPTS {
            let step = self.step(step_id)?;
            if attempted && step.status == StepStatus::Cancelled {
                return Ok(step);
            }
            if step.status.is_terminal() {
                return Err(EngineError::StepFinished {
                    id: step.id,
                    status: step.status,
                });
            }
            attempted = true;
            if step.status.is_active()
                && let Some(step_handle) = step.provider_step_handle.as_deref()
            {
                self.cancel_at_provider(&step, step_handle).await?;
            }
            let result = self.store.compare_and_set_step(
                step_id,
                step.status,
                StepStatus::Cancelled,
                &mut |s| s.last_error = Some("cancelled on request".to_string()),
            );
            match result {
                Ok(cancelled) => {
                    info!(%step_id, from = %step.status, "step cancelled");
                    return Ok(cancelled);
                }
                Err(e) if e.is_conflict() => {
                    debug!(%step_id, error = %e, "step changed during cancel, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let step = self.step(step_id)?;
        if step.status == StepStatus::Cancelled {
            return Ok(step);
        }
        Err(EngineError::StepFinished {
            id: step.id,
            status: step.status,
        })
    }

    async fn cancel_at_provider(&self, step: &Step, step_handle: &str) -> EngineResult<()> {
        let Some(cluster_id) = step.cluster_id.as_deref() else {
            return Ok(());
        };
        let Some(handle) = self
            .store
            .get_cluster(cluster_id)?
            .and_then(|c| c.provider_handle)
        else {
            return Ok(());
        };
        match self.provider.cancel_step(&handle, step_handle).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(
                target: "stepgrid::events",
                step_id = %step.id,
                %handle,
                %step_handle,
                error = %e,
                "provider did not stop step; cancelled locally"
            ),
        }
        Ok(())
    }

    // ── Serial runner ─────────────────────────────────────────────

    /// Move a cluster's queue forward by one step.
    ///
    /// Polls the active step if there is one; once it finishes (or if the
    /// cluster was idle) the lowest queued step is claimed and submitted.
    pub async fn advance(&self, cluster_id: &str) -> EngineResult<AdvanceOutcome> {
        let lock = self.runner_lock(cluster_id).await;
        let _guard = lock.lock().await;

        let mut outcome = AdvanceOutcome::default();
        let Some(handle) = self
            .store
            .get_cluster(cluster_id)?
            .ok_or_else(|| EngineError::ClusterNotFound(cluster_id.to_string()))?
            .provider_handle
        else {
            return Ok(outcome);
        };

        // One poll, then at most one claim.
        for _ in 0..2 {
            match self.store.claim_next_step(cluster_id)? {
                ClaimOutcome::Idle => break,
                ClaimOutcome::Claimed(step) => {
                    let submitted = self.submit_to_provider(&handle, step).await?;
                    outcome.submitted = Some(submitted);
                    break;
                }
                ClaimOutcome::Busy(step) if outcome.finished.is_some() => {
                    // Another active step surfaced; leave it for the next round.
                    outcome.running = Some(step);
                    break;
                }
                ClaimOutcome::Busy(step) => match step.provider_step_handle.clone() {
                    None => {
                        let submitted = self.submit_to_provider(&handle, step).await?;
                        outcome.submitted = Some(submitted);
                        break;
                    }
                    Some(step_handle) => {
                        let polled = self.poll(&handle, &step_handle, step).await?;
                        if polled.status.is_terminal() {
                            outcome.finished = Some(polled);
                        } else {
                            outcome.running = Some(polled);
                            break;
                        }
                    }
                },
            }
        }
        Ok(outcome)
    }

    /// Hand a claimed step to the provider. The step id is the idempotency
    /// token, so re-submitting a step whose response was lost is safe.
    async fn submit_to_provider(&self, handle: &str, step: Step) -> EngineResult<Step> {
        let spec = StepSpec {
            client_token: step.id.clone(),
            name: step.name.clone(),
            config: step.config.clone(),
        };
        match self.provider.add_step(handle, &spec).await {
            Ok(step_handle) => {
                let result = self.store.compare_and_set_step(
                    &step.id,
                    step.status,
                    StepStatus::Running,
                    &mut |s| {
                        s.provider_step_handle = Some(step_handle.clone());
                        s.last_error = None;
                    },
                );
                match result {
                    Ok(running) => {
                        info!(step_id = %step.id, %handle, %step_handle, "step started");
                        Ok(running)
                    }
                    Err(e) if e.is_conflict() => {
                        let current = self.step(&step.id)?;
                        if current.status == StepStatus::Cancelled {
                            debug!(step_id = %step.id, %step_handle, "step cancelled during submission");
                            if let Err(e) = self.provider.cancel_step(handle, &step_handle).await
                                && !e.is_not_found()
                            {
                                warn!(step_id = %step.id, %step_handle, error = %e, "late cancel failed");
                            }
                        }
                        Ok(current)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) if e.is_fatal() => {
                let reason = e.to_string();
                let failed = self.store.compare_and_set_step(
                    &step.id,
                    step.status,
                    StepStatus::Failed,
                    &mut |s| s.last_error = Some(reason.clone()),
                )?;
                warn!(target: "stepgrid::events", step_id = %step.id, %reason, "step rejected by provider");
                Ok(failed)
            }
            Err(e) if e.is_retriable() && step.status == StepStatus::Running => {
                let reason = e.to_string();
                let parked = self.store.compare_and_set_step(
                    &step.id,
                    StepStatus::Running,
                    StepStatus::NoUpdate,
                    &mut |s| s.last_error = Some(reason.clone()),
                )?;
                warn!(step_id = %step.id, %reason, "step submission outcome unknown");
                Ok(parked)
            }
            Err(e) => {
                debug!(step_id = %step.id, error = %e, "step submission deferred");
                Ok(step)
            }
        }
    }

    async fn poll(&self, handle: &str, step_handle: &str, step: Step) -> EngineResult<Step> {
        let (next, reason) = match self.provider.get_step_status(handle, step_handle).await {
            Ok(report) => {
                let next = match report.status {
                    ProviderStepStatus::Completed => StepStatus::Succeeded,
                    ProviderStepStatus::Failed => StepStatus::Failed,
                    ProviderStepStatus::Cancelled => StepStatus::Cancelled,
                    ProviderStepStatus::Pending | ProviderStepStatus::Running => StepStatus::Running,
                };
                let reason = match next {
                    StepStatus::Failed => {
                        Some(report.reason.unwrap_or_else(|| "step failed".to_string()))
                    }
                    StepStatus::Cancelled => report.reason,
                    _ => None,
                };
                (next, reason)
            }
            Err(e) if e.is_not_found() => (StepStatus::Failed, Some(e.to_string())),
            Err(e) => {
                debug!(step_id = %step.id, %step_handle, error = %e, "step poll failed");
                return Ok(step);
            }
        };
        if next == step.status {
            return Ok(step);
        }

        let result = self.store.compare_and_set_step(&step.id, step.status, next, &mut |s| {
            if reason.is_some() {
                s.last_error = reason.clone();
            }
        });
        match result {
            Ok(updated) => {
                if next.is_terminal() {
                    info!(step_id = %step.id, status = %next, error = ?updated.last_error, "step finished");
                }
                Ok(updated)
            }
            Err(e) if e.is_conflict() => self.step(&step.id),
            Err(e) => Err(e.into()),
        }
    }

    /// Advance every cluster that can execute steps.
    ///
    /// Returns how many clusters made progress. A failing cluster is logged
    /// and skipped.
    pub async fn advance_all(&self) -> EngineResult<usize> {
        let clusters = self
            .store
            .list_clusters_by_status(&[ClusterStatus::Ready, ClusterStatus::Draining])?;
        let mut progressed = 0;
        for cluster in clusters {
            match self.advance(&cluster.id).await {
                Ok(outcome) if outcome.progressed() => progressed += 1,
                Ok(_) => {}
                Err(e) => warn!(cluster_id = %cluster.id, error = %e, "runner step failed"),
            }
        }
        Ok(progressed)
    }

    // ── Evacuation ────────────────────────────────────────────────

    /// Move queued steps off a cluster that will not run them.
    ///
    /// Assigned steps go back to Pending with their retry count bumped, or
    /// fail once retries are exhausted. If the cluster is `lost`, its active
    /// step fails too.
    pub fn evacuate(&self, cluster_id: &str, lost: bool) -> EngineResult<Evacuation> {
        let mut evacuation = Evacuation::default();
        for step in self.store.queue(cluster_id)? {
            let result = match step.status {
                StepStatus::Assigned if step.retry_count >= self.config.max_step_retries => {
                    let reason = format!(
                        "cluster {cluster_id} stopped before the step ran; retries exhausted"
                    );
                    self.store
                        .compare_and_set_step(&step.id, StepStatus::Assigned, StepStatus::Failed, &mut |s| {
                            s.last_error = Some(reason.clone());
                        })
                        .map(|s| evacuation.failed.push(s.id))
                }
                StepStatus::Assigned => self
                    .store
                    .compare_and_set_step(&step.id, StepStatus::Assigned, StepStatus::Pending, &mut |s| {
                        s.retry_count += 1;
                    })
                    .map(|s| evacuation.requeued.push(s.id)),
                status if lost && status.is_active() => {
                    let reason = format!("cluster {cluster_id} lost");
                    self.store
                        .compare_and_set_step(&step.id, status, StepStatus::Failed, &mut |s| {
                            s.last_error = Some(reason.clone());
                        })
                        .map(|s| evacuation.failed.push(s.id))
                }
                _ => Ok(()),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    debug!(step_id = %step.id, error = %e, "step moved during evacuation");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !evacuation.requeued.is_empty() || !evacuation.failed.is_empty() {
            info!(
                %cluster_id,
                lost,
                requeued = evacuation.requeued.len(),
                failed = evacuation.failed.len(),
                "cluster evacuated"
            );
        }
        Ok(evacuation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepgrid_core::config::LifecycleConfig;
    use stepgrid_provider::{
        ProviderClusterStatus, ProviderErrorKind, ProviderOp, SimulatedBehavior, SimulatedProvider,
    };
    use stepgrid_state::{ManualClock, StateStore};

    const START: u64 = 1_000_000;

    struct Fixture {
        store: Arc<StateStore>,
        sim: Arc<SimulatedProvider>,
        scheduler: Scheduler,
    }

    fn fixture_with(config: SchedulerConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(StateStore::open_in_memory().unwrap().with_clock(clock));
        let sim = Arc::new(SimulatedProvider::new(SimulatedBehavior::manual()));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            sim.clone(),
            LifecycleConfig::default(),
            config.clone(),
        ));
        let scheduler = Scheduler::new(store.clone(), sim.clone(), lifecycle, config);
        Fixture {
            store,
            sim,
            scheduler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SchedulerConfig::default())
    }

    fn new_step(name: &str) -> NewStep {
        NewStep {
            name: name.to_string(),
            owner: "alice".to_string(),
            config: json!({"Jar": "command-runner.jar", "Args": [name]}),
            cluster_config: json!({"Name": "etl", "ReleaseLabel": "emr-6.15.0"}),
            estimated_runtime_secs: Some(300),
            custom_metadata: json!({}),
        }
    }

    /// Mark the only cluster Ready and return its id and provider handle.
    fn make_ready(f: &Fixture) -> (String, String) {
        let cluster = f.store.list_clusters().unwrap().remove(0);
        let handle = cluster.provider_handle.clone().unwrap();
        f.sim.set_cluster_status(&handle, ProviderClusterStatus::Ready);
        f.store
            .compare_and_set_cluster(
                &cluster.id,
                ClusterStatus::Provisioning,
                ClusterStatus::Ready,
                &mut |_| {},
            )
            .unwrap();
        (cluster.id, handle)
    }

    #[tokio::test]
    async fn submit_places_on_new_cluster() {
        let f = fixture();
        let step = f.scheduler.submit(new_step("a")).await.unwrap();
        assert_eq!(step.status, StepStatus::Assigned);
        assert_eq!(step.ordering_key, Some(0));
        assert_eq!(f.sim.cluster_count(), 1);
    }

    #[tokio::test]
    async fn equivalent_steps_share_a_cluster_in_order() {
        let f = fixture();
        let a = f.scheduler.submit(new_step("a")).await.unwrap();
        let b = f.scheduler.submit(new_step("b")).await.unwrap();
        assert_eq!(a.cluster_id, b.cluster_id);
        assert_eq!(b.ordering_key, Some(1));
        assert_eq!(f.sim.cluster_count(), 1);
    }

    #[tokio::test]
    async fn fatal_creation_fails_the_step() {
        let f = fixture();
        f.sim.fail_next(ProviderOp::CreateCluster, ProviderErrorKind::Fatal);
        let step = f.scheduler.submit(new_step("a")).await.unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.last_error.is_some());
    }

    #[tokio::test]
    async fn runner_executes_one_step_at_a_time() {
        let f = fixture();
        let a = f.scheduler.submit(new_step("a")).await.unwrap();
        let b = f.scheduler.submit(new_step("b")).await.unwrap();
        let (cluster_id, handle) = make_ready(&f);

        let first = f.scheduler.advance(&cluster_id).await.unwrap();
        let started = first.submitted.unwrap();
        assert_eq!(started.id, a.id);
        assert_eq!(started.status, StepStatus::Running);

        // Still running: nothing new is submitted.
        let second = f.scheduler.advance(&cluster_id).await.unwrap();
        assert_eq!(second.running.unwrap().id, a.id);
        assert!(second.submitted.is_none());
        assert_eq!(f.sim.step_names(&handle), vec!["a"]);

        let step_handle = started.provider_step_handle.as_deref().unwrap();
        f.sim.finish_step(step_handle, ProviderStepStatus::Completed, None);
        let third = f.scheduler.advance(&cluster_id).await.unwrap();
        assert_eq!(third.finished.unwrap().status, StepStatus::Succeeded);
        assert_eq!(third.submitted.unwrap().id, b.id);
        assert_eq!(f.sim.step_names(&handle), vec!["a", "b"]);
        assert_eq!(f.sim.overlapping_submissions(), 0);
    }

    #[tokio::test]
    async fn provider_failure_reason_is_kept() {
        let f = fixture();
        f.scheduler.submit(new_step("a")).await.unwrap();
        let (cluster_id, _) = make_ready(&f);
        let started = f.scheduler.advance(&cluster_id).await.unwrap().submitted.unwrap();

        f.sim.finish_step(
            started.provider_step_handle.as_deref().unwrap(),
            ProviderStepStatus::Failed,
            Some("exit code 1"),
        );
        let outcome = f.scheduler.advance(&cluster_id).await.unwrap();
        let finished = outcome.finished.unwrap();
        assert_eq!(finished.status, StepStatus::Failed);
        assert_eq!(finished.last_error.as_deref(), Some("exit code 1"));
    }

    #[tokio::test]
    async fn exhausted_submission_parks_step_then_recovers() {
        let f = fixture();
        f.scheduler.submit(new_step("a")).await.unwrap();
        let (cluster_id, handle) = make_ready(&f);

        f.sim.lose_next_response(ProviderOp::AddStep);
        let parked = f.scheduler.advance(&cluster_id).await.unwrap().submitted.unwrap();
        assert_eq!(parked.status, StepStatus::NoUpdate);

        let recovered = f.scheduler.advance(&cluster_id).await.unwrap().submitted.unwrap();
        assert_eq!(recovered.status, StepStatus::Running);
        assert!(recovered.provider_step_handle.is_some());
        assert_eq!(f.sim.step_names(&handle), vec!["a"]);
    }

    #[tokio::test]
    async fn cancel_queued_and_running_steps() {
        let f = fixture();
        let a = f.scheduler.submit(new_step("a")).await.unwrap();
        let b = f.scheduler.submit(new_step("b")).await.unwrap();
        let (cluster_id, _) = make_ready(&f);
        let running = f.scheduler.advance(&cluster_id).await.unwrap().submitted.unwrap();
        assert_eq!(running.id, a.id);

        let cancelled = f.scheduler.cancel(&b.id).await.unwrap();
        assert_eq!(cancelled.status, StepStatus::Cancelled);
        assert_eq!(f.sim.calls(ProviderOp::CancelStep), 0);

        let cancelled = f.scheduler.cancel(&a.id).await.unwrap();
        assert_eq!(cancelled.status, StepStatus::Cancelled);
        assert_eq!(f.sim.calls(ProviderOp::CancelStep), 1);
        let step_handle = running.provider_step_handle.unwrap();
        assert_eq!(f.sim.step_status(&step_handle), Some(ProviderStepStatus::Cancelled));

        let err = f.scheduler.cancel(&a.id).await.unwrap_err();
        assert!(matches!(err, EngineError::StepFinished { status: StepStatus::Cancelled, .. }));
        assert!(f.store.queue(&cluster_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_provider_cancel_still_cancels_locally() {
        let f = fixture();
        let a = f.scheduler.submit(new_step("a")).await.unwrap();
        let (cluster_id, _) = make_ready(&f);
        let running = f.scheduler.advance(&cluster_id).await.unwrap().submitted.unwrap();

        f.sim.fail_next(ProviderOp::CancelStep, ProviderErrorKind::Fatal);
        let cancelled = f.scheduler.cancel(&a.id).await.unwrap();
        assert_eq!(cancelled.status, StepStatus::Cancelled);
        assert_eq!(f.store.get_step(&a.id).unwrap().unwrap().status, StepStatus::Cancelled);
        assert!(f.store.queue(&cluster_id).unwrap().is_empty());

        // The provider still runs it; a later finish is not adopted.
        let step_handle = running.provider_step_handle.unwrap();
        assert_eq!(f.sim.step_status(&step_handle), Some(ProviderStepStatus::Running));
        f.sim.finish_step(&step_handle, ProviderStepStatus::Completed, None);
        f.scheduler.advance(&cluster_id).await.unwrap();
        assert_eq!(f.store.get_step(&a.id).unwrap().unwrap().status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn expired_credentials_on_cancel_still_cancel_locally() {
        let f = fixture();
        let a = f.scheduler.submit(new_step("a")).await.unwrap();
        let (cluster_id, _) = make_ready(&f);
        f.scheduler.advance(&cluster_id).await.unwrap();

        f.sim.fail_next(ProviderOp::CancelStep, ProviderErrorKind::AuthExpired);
        let cancelled = f.scheduler.cancel(&a.id).await.unwrap();
        assert_eq!(cancelled.status, StepStatus::Cancelled);
        assert_eq!(cancelled.last_error.as_deref(), Some("cancelled on request"));
    }

    #[tokio::test]
    async fn evacuation_requeues_until_retries_run_out() {
        let f = fixture_with(SchedulerConfig {
            max_step_retries: 1,
            ..SchedulerConfig::default()
        });
        let a = f.scheduler.submit(new_step("a")).await.unwrap();
        let first_cluster = a.cluster_id.clone().unwrap();

        let evacuation = f.scheduler.evacuate(&first_cluster, false).unwrap();
        assert_eq!(evacuation.requeued, vec![a.id.clone()]);
        let requeued = f.store.get_step(&a.id).unwrap().unwrap();
        assert_eq!(requeued.status, StepStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.cluster_id, None);

        let placed = f.scheduler.place(&a.id).await.unwrap();
        assert_eq!(placed.status, StepStatus::Assigned);
        let evacuation = f
            .scheduler
            .evacuate(placed.cluster_id.as_deref().unwrap(), false)
            .unwrap();
        assert_eq!(evacuation.failed, vec![a.id.clone()]);
    }

    #[tokio::test]
    async fn lost_cluster_fails_its_running_step() {
        let f = fixture();
        let a = f.scheduler.submit(new_step("a")).await.unwrap();
        let b = f.scheduler.submit(new_step("b")).await.unwrap();
        let (cluster_id, _) = make_ready(&f);
        f.scheduler.advance(&cluster_id).await.unwrap();

        let evacuation = f.scheduler.evacuate(&cluster_id, true).unwrap();
        assert_eq!(evacuation.failed, vec![a.id.clone()]);
        assert_eq!(evacuation.requeued, vec![b.id.clone()]);
    }

    #[tokio::test]
    async fn place_pending_counts_outcomes() {
        let f = fixture();
        f.sim.fail_next(ProviderOp::CreateCluster, ProviderErrorKind::Fatal);
        f.store.insert_step(new_step("a")).unwrap();
        f.store.insert_step(new_step("b")).unwrap();

        let pass = f.scheduler.place_pending().await.unwrap();
        assert_eq!(pass.failed, 1);
        assert_eq!(pass.placed, 1);
    }
}
