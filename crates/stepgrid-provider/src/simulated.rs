//! In-process provider used by the daemon's standalone mode and by tests.
//!
//! Clusters and steps live in memory. In automatic mode clusters become
//! Ready after a number of status polls and steps complete after a number
//! of step polls; in manual mode nothing moves until a test says so.
//! Failures can be injected per operation, either before the call takes
//! effect or after it (a lost response).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::{ProviderError, ProviderErrorKind, ProviderResult};
use crate::gateway::{
    ClusterSpec, ProviderClusterStatus, ProviderFuture, ProviderGateway, ProviderOp,
    ProviderStepStatus, StepReport, StepSpec,
};

/// How simulated clusters and steps progress on their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedBehavior {
    /// Status polls before a provisioning cluster reports Ready.
    /// `None` leaves it provisioning until told otherwise.
    pub ready_after_polls: Option<u32>,
    /// Step polls before a running step completes.
    /// `None` leaves it running until told otherwise.
    pub step_completes_after_polls: Option<u32>,
}

impl SimulatedBehavior {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn auto(ready_after_polls: u32, step_completes_after_polls: u32) -> Self {
        Self {
            ready_after_polls: Some(ready_after_polls),
            step_completes_after_polls: Some(step_completes_after_polls),
        }
    }
}

#[derive(Debug, Clone)]
struct Injection {
    kind: ProviderErrorKind,
    after_effect: bool,
}

#[derive(Debug)]
struct SimCluster {
    status: ProviderClusterStatus,
    polls: u32,
    steps: Vec<String>,
}

#[derive(Debug)]
struct SimStep {
    cluster: String,
    name: String,
    status: ProviderStepStatus,
    reason: Option<String>,
    polls: u32,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    clusters: HashMap<String, SimCluster>,
    cluster_tokens: HashMap<String, String>,
    steps: HashMap<String, SimStep>,
    step_tokens: HashMap<(String, String), String>,
    injections: HashMap<ProviderOp, VecDeque<Injection>>,
    sticky: HashMap<ProviderOp, ProviderErrorKind>,
    delays: HashMap<ProviderOp, Duration>,
    calls: HashMap<ProviderOp, u32>,
    overlapping_submissions: u32,
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// An in-memory compute provider.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    behavior: SimulatedBehavior,
    state: Mutex<SimState>,
}

impl SimulatedProvider {
    pub fn new(behavior: SimulatedBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Fault injection ────────────────────────────────────────────

    /// Fail the next call of `op` with `kind`, before it takes effect.
    pub fn fail_next(&self, op: ProviderOp, kind: ProviderErrorKind) {
        self.fail_next_times(op, kind, 1);
    }

    pub fn fail_next_times(&self, op: ProviderOp, kind: ProviderErrorKind, times: u32) {
        let mut state = self.state();
        let queue = state.injections.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(Injection {
                kind,
                after_effect: false,
            });
        }
    }

    /// Let the next call of `op` take effect, then report a timeout.
    pub fn lose_next_response(&self, op: ProviderOp) {
        self.state()
            .injections
            .entry(op)
            .or_default()
            .push_back(Injection {
                kind: ProviderErrorKind::Timeout,
                after_effect: true,
            });
    }

    /// Fail every call of `op` with `kind` until [`Self::clear_failures`].
    pub fn fail_always(&self, op: ProviderOp, kind: ProviderErrorKind) {
        self.state().sticky.insert(op, kind);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.injections.clear();
        state.sticky.clear();
    }

    /// Delay every call of `op`.
    pub fn set_delay(&self, op: ProviderOp, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    // ── Inspection and manual control ──────────────────────────────

    /// Number of calls of `op`, failed ones included.
    pub fn calls(&self, op: ProviderOp) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn cluster_count(&self) -> usize {
        self.state().clusters.len()
    }

    pub fn cluster_handles(&self) -> Vec<String> {
        let mut handles: Vec<_> = self.state().clusters.keys().cloned().collect();
        handles.sort();
        handles
    }

    pub fn cluster_status(&self, handle: &str) -> Option<ProviderClusterStatus> {
        self.state().clusters.get(handle).map(|c| c.status)
    }

    /// Force a cluster into `status`, as the provider might on its own.
    pub fn set_cluster_status(&self, handle: &str, status: ProviderClusterStatus) {
        let mut state = self.state();
        if let Some(cluster) = state.clusters.get_mut(handle) {
            cluster.status = status;
        }
        if status == ProviderClusterStatus::Terminated {
            cancel_unfinished(&mut state, handle);
        }
    }

    /// Names of the steps submitted to a cluster, in submission order.
    pub fn step_names(&self, handle: &str) -> Vec<String> {
        let state = self.state();
        state
            .clusters
            .get(handle)
            .map(|c| {
                c.steps
                    .iter()
                    .filter_map(|id| state.steps.get(id).map(|s| s.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn step_status(&self, step_handle: &str) -> Option<ProviderStepStatus> {
        self.state().steps.get(step_handle).map(|s| s.status)
    }

    /// Finish a step with the given status.
    pub fn finish_step(&self, step_handle: &str, status: ProviderStepStatus, reason: Option<&str>) {
        if let Some(step) = self.state().steps.get_mut(step_handle) {
            step.status = status;
            step.reason = reason.map(str::to_string);
        }
    }

    /// Times a step was submitted while another step on the same cluster
    /// was still running.
    pub fn overlapping_submissions(&self) -> u32 {
        self.state().overlapping_submissions
    }

    // ── Call plumbing ──────────────────────────────────────────────

    /// Count the call, apply any delay, and resolve injected failures.
    /// `Ok(Some(err))` means: perform the effect, then return `err`.
    async fn begin(&self, op: ProviderOp) -> ProviderResult<Option<ProviderError>> {
        let delay = {
            let mut state = self.state();
            *state.calls.entry(op).or_default() += 1;
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(kind) = state.sticky.get(&op).copied() {
            return Err(ProviderError::new(kind, op, "injected failure"));
        }
        match state.injections.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(injection) if injection.after_effect => Ok(Some(ProviderError::new(
                injection.kind,
                op,
                "response lost",
            ))),
            Some(injection) => Err(ProviderError::new(injection.kind, op, "injected failure")),
            None => Ok(None),
        }
    }
}

fn finish<T>(value: T, lost: Option<ProviderError>) -> ProviderResult<T> {
    match lost {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

fn cancel_unfinished(state: &mut SimState, handle: &str) {
    for step in state.steps.values_mut() {
        if step.cluster == handle && !step.status.is_finished() {
            step.status = ProviderStepStatus::Cancelled;
            step.reason = Some("cluster terminated".to_string());
        }
    }
}

impl ProviderGateway for SimulatedProvider {
    fn create_cluster<'a>(&'a self, spec: &'a ClusterSpec) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let lost = self.begin(ProviderOp::CreateCluster).await?;
            let mut state = self.state();
            if let Some(handle) = state.cluster_tokens.get(&spec.client_token) {
                return finish(handle.clone(), lost);
            }
            let handle = format!("j-{:012}", state.next_id());
            state.clusters.insert(
                handle.clone(),
                SimCluster {
                    status: ProviderClusterStatus::Provisioning,
                    polls: 0,
                    steps: Vec::new(),
                },
            );
            state
                .cluster_tokens
                .insert(spec.client_token.clone(), handle.clone());
            debug!(%handle, name = %spec.name, "simulated cluster created");
            finish(handle, lost)
        })
    }

    fn add_step<'a>(&'a self, handle: &'a str, step: &'a StepSpec) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let lost = self.begin(ProviderOp::AddStep).await?;
            let mut state = self.state();
            let token = (handle.to_string(), step.client_token.clone());
            if let Some(step_handle) = state.step_tokens.get(&token) {
                return finish(step_handle.clone(), lost);
            }
            let Some(cluster) = state.clusters.get(handle) else {
                return Err(ProviderError::not_found(
                    ProviderOp::AddStep,
                    format!("cluster {handle} does not exist"),
                ));
            };
            if cluster.status == ProviderClusterStatus::Terminated {
                return Err(ProviderError::fatal(
                    ProviderOp::AddStep,
                    format!("cluster {handle} is terminated"),
                ));
            }
            let busy = cluster.steps.iter().any(|id| {
                state
                    .steps
                    .get(id)
                    .is_some_and(|s| !s.status.is_finished())
            });
            if busy {
                state.overlapping_submissions += 1;
            }

            let step_handle = format!("s-{:012}", state.next_id());
            state.steps.insert(
                step_handle.clone(),
                SimStep {
                    cluster: handle.to_string(),
                    name: step.name.clone(),
                    status: ProviderStepStatus::Running,
                    reason: None,
                    polls: 0,
                },
            );
            if let Some(cluster) = state.clusters.get_mut(handle) {
                cluster.steps.push(step_handle.clone());
            }
            state.step_tokens.insert(token, step_handle.clone());
            debug!(%handle, %step_handle, name = %step.name, "simulated step added");
            finish(step_handle, lost)
        })
    }

    fn terminate_cluster<'a>(&'a self, handle: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let lost = self.begin(ProviderOp::TerminateCluster).await?;
            let mut state = self.state();
            let Some(cluster) = state.clusters.get_mut(handle) else {
                return Err(ProviderError::not_found(
                    ProviderOp::TerminateCluster,
                    format!("cluster {handle} does not exist"),
                ));
            };
            cluster.status = ProviderClusterStatus::Terminated;
            cancel_unfinished(&mut state, handle);
            debug!(%handle, "simulated cluster terminated");
            finish((), lost)
        })
    }

    fn get_status<'a>(&'a self, handle: &'a str) -> ProviderFuture<'a, ProviderClusterStatus> {
        Box::pin(async move {
            let lost = self.begin(ProviderOp::GetStatus).await?;
            let ready_after = self.behavior.ready_after_polls;
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(cluster) = state.clusters.get_mut(handle) else {
                return Err(ProviderError::not_found(
                    ProviderOp::GetStatus,
                    format!("cluster {handle} does not exist"),
                ));
            };
            cluster.polls += 1;
            if cluster.status == ProviderClusterStatus::Provisioning
                && ready_after.is_some_and(|n| cluster.polls >= n)
            {
                cluster.status = ProviderClusterStatus::Ready;
            }
            let status = cluster.status;
            let busy = cluster.steps.iter().any(|id| {
                state
                    .steps
                    .get(id)
                    .is_some_and(|s| s.status == ProviderStepStatus::Running)
            });
            let reported = if status == ProviderClusterStatus::Ready && busy {
                ProviderClusterStatus::Running
            } else {
                status
            };
            finish(reported, lost)
        })
    }

    fn get_step_status<'a>(
        &'a self,
        handle: &'a str,
        step_handle: &'a str,
    ) -> ProviderFuture<'a, StepReport> {
        Box::pin(async move {
            let lost = self.begin(ProviderOp::GetStepStatus).await?;
            let completes_after = self.behavior.step_completes_after_polls;
            let mut state = self.state();
            let Some(step) = state
                .steps
                .get_mut(step_handle)
                .filter(|s| s.cluster == handle)
            else {
                return Err(ProviderError::not_found(
                    ProviderOp::GetStepStatus,
                    format!("step {step_handle} does not exist on {handle}"),
                ));
            };
            step.polls += 1;
            if step.status == ProviderStepStatus::Running
                && completes_after.is_some_and(|n| step.polls >= n)
            {
                step.status = ProviderStepStatus::Completed;
            }
            let report = StepReport {
                status: step.status,
                reason: step.reason.clone(),
            };
            finish(report, lost)
        })
    }

    fn cancel_step<'a>(&'a self, handle: &'a str, step_handle: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let lost = self.begin(ProviderOp::CancelStep).await?;
            let mut state = self.state();
            let Some(step) = state
                .steps
                .get_mut(step_handle)
                .filter(|s| s.cluster == handle)
            else {
                return Err(ProviderError::not_found(
                    ProviderOp::CancelStep,
                    format!("step {step_handle} does not exist on {handle}"),
                ));
            };
            if !step.status.is_finished() {
                step.status = ProviderStepStatus::Cancelled;
                step.reason = Some("cancelled by request".to_string());
            }
            finish((), lost)
        })
    }
}
