#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use stepgrid_core::StepgridConfig;
use stepgrid_engine::Engine;
use stepgrid_provider::{ProviderClusterStatus, ProviderStepStatus, SimulatedBehavior, SimulatedProvider};
use stepgrid_state::{
    ClaimOutcome, Cluster, ClusterStatus, ManualClock, NewCluster, NewStep, StateError,
    StateResult, StateStore, Step, StepStatus, Store,
};

pub const START: u64 = 1_700_000_000;

/// A [`StateStore`] that can be told to fail its next cluster write.
pub struct FaultyStore {
    inner: StateStore,
    fail_cluster_write_to: Mutex<Option<ClusterStatus>>,
}

impl FaultyStore {
    pub fn new(inner: StateStore) -> Self {
        Self {
            inner,
            fail_cluster_write_to: Mutex::new(None),
        }
    }

    /// Fail the next compare-and-set that would move a cluster to `next`.
    pub fn fail_next_cluster_write(&self, next: ClusterStatus) {
        *self.fail_cluster_write_to.lock().unwrap() = Some(next);
    }
}

impl Store for FaultyStore {
    fn now(&self) -> u64 {
        self.inner.now()
    }

    fn insert_cluster(&self, new: NewCluster) -> StateResult<Cluster> {
        self.inner.insert_cluster(new)
    }

    fn get_cluster(&self, id: &str) -> StateResult<Option<Cluster>> {
        self.inner.get_cluster(id)
    }

    fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        self.inner.list_clusters()
    }

    fn list_clusters_by_status(&self, statuses: &[ClusterStatus]) -> StateResult<Vec<Cluster>> {
        self.inner.list_clusters_by_status(statuses)
    }

    fn compare_and_set_cluster(
        &self,
        id: &str,
        expected: ClusterStatus,
        next: ClusterStatus,
        update: &mut dyn FnMut(&mut Cluster),
    ) -> StateResult<Cluster> {
        {
            let mut fail = self.fail_cluster_write_to.lock().unwrap();
            if *fail == Some(next) {
                *fail = None;
                return Err(StateError::Write("injected write failure".to_string()));
            }
        }
        self.inner.compare_and_set_cluster(id, expected, next, update)
    }

    fn mark_cluster_no_update(&self, id: &str, reason: &str) -> StateResult<Cluster> {
        self.inner.mark_cluster_no_update(id, reason)
    }

    fn insert_step(&self, new: NewStep) -> StateResult<Step> {
        self.inner.insert_step(new)
    }

    fn get_step(&self, id: &str) -> StateResult<Option<Step>> {
        self.inner.get_step(id)
    }

    fn list_steps(&self) -> StateResult<Vec<Step>> {
        self.inner.list_steps()
    }

    fn list_steps_by_status(&self, statuses: &[StepStatus]) -> StateResult<Vec<Step>> {
        self.inner.list_steps_by_status(statuses)
    }

    fn compare_and_set_step(
        &self,
        id: &str,
        expected: StepStatus,
        next: StepStatus,
        update: &mut dyn FnMut(&mut Step),
    ) -> StateResult<Step> {
        self.inner.compare_and_set_step(id, expected, next, update)
    }

    fn append_to_queue(&self, cluster_id: &str, step_id: &str) -> StateResult<Step> {
        self.inner.append_to_queue(cluster_id, step_id)
    }

    fn queue(&self, cluster_id: &str) -> StateResult<Vec<Step>> {
        self.inner.queue(cluster_id)
    }

    fn claim_next_step(&self, cluster_id: &str) -> StateResult<ClaimOutcome> {
        self.inner.claim_next_step(cluster_id)
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<FaultyStore>,
    pub sim: Arc<SimulatedProvider>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(StepgridConfig::default())
    }

    pub fn with_config(config: StepgridConfig) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let inner = StateStore::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        let store = Arc::new(FaultyStore::new(inner));
        let sim = Arc::new(SimulatedProvider::new(SimulatedBehavior::manual()));
        let engine = Engine::new(store.clone(), sim.clone(), config);
        Self {
            clock,
            store,
            sim,
            engine,
        }
    }

    pub fn advance_clock(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    pub fn now(&self) -> u64 {
        self.store.now()
    }

    pub fn clusters(&self) -> Vec<Cluster> {
        self.store.list_clusters().unwrap()
    }

    pub fn cluster(&self, id: &str) -> Cluster {
        self.store.get_cluster(id).unwrap().unwrap()
    }

    pub fn step(&self, id: &str) -> Step {
        self.store.get_step(id).unwrap().unwrap()
    }

    /// Bring a cluster up at the provider and let reconciliation notice.
    pub async fn make_ready(&self, cluster_id: &str) {
        let handle = self.cluster(cluster_id).provider_handle.unwrap();
        self.sim.set_cluster_status(&handle, ProviderClusterStatus::Ready);
        self.engine.reconcile_once().await;
        assert_eq!(self.cluster(cluster_id).status, ClusterStatus::Ready);
    }

    /// Finish a step at the provider.
    pub fn finish_at_provider(&self, step_id: &str, status: ProviderStepStatus) {
        let step = self.step(step_id);
        let handle = step.provider_step_handle.expect("step was never submitted");
        self.sim.finish_step(&handle, status, None);
    }
}

pub fn cluster_config() -> Value {
    json!({
        "Name": "nightly-etl",
        "ReleaseLabel": "emr-6.15.0",
        "Instances": {"InstanceCount": 3, "MasterInstanceType": "m5.xlarge"}
    })
}

pub fn new_step(name: &str, runtime_secs: u64) -> NewStep {
    NewStep {
        name: name.to_string(),
        owner: "data-eng".to_string(),
        config: json!({"Jar": "command-runner.jar", "Args": ["spark-submit", name]}),
        cluster_config: cluster_config(),
        estimated_runtime_secs: Some(runtime_secs),
        custom_metadata: json!({"team": "data-eng"}),
    }
}
