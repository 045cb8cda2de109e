//! The engine keeps no state of its own: a fresh engine over the same store
//! picks up where the previous one stopped.

mod common;

use std::sync::Arc;

use common::new_step;
use stepgrid_core::StepgridConfig;
use stepgrid_engine::Engine;
use stepgrid_provider::{ProviderClusterStatus, ProviderStepStatus, SimulatedBehavior, SimulatedProvider};
use stepgrid_state::{StateStore, StepStatus};

#[tokio::test]
async fn queue_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stepgrid.redb");
    let sim = Arc::new(SimulatedProvider::new(SimulatedBehavior::manual()));

    let (first, second) = {
        let store = Arc::new(StateStore::open(&path).unwrap());
        let engine = Engine::new(store, sim.clone(), StepgridConfig::default());
        let first = engine.submit_step(new_step("first", 300)).await.unwrap();
        let second = engine.submit_step(new_step("second", 300)).await.unwrap();
        (first, second)
    };
    let handle = sim.cluster_handles().remove(0);
    sim.set_cluster_status(&handle, ProviderClusterStatus::Ready);

    let store = Arc::new(StateStore::open(&path).unwrap());
    let engine = Engine::new(store, sim.clone(), StepgridConfig::default());
    engine.reconcile_once().await;
    let running = engine.get_step_status(&first.id).unwrap();
    assert_eq!(running.status, StepStatus::Running);
    assert_eq!(engine.get_step_status(&second.id).unwrap().status, StepStatus::Assigned);

    let step_handle = running.provider_step_handle.unwrap();
    sim.finish_step(&step_handle, ProviderStepStatus::Completed, None);
    engine.advance_all().await.unwrap();

    assert_eq!(engine.get_step_status(&first.id).unwrap().status, StepStatus::Succeeded);
    assert_eq!(engine.get_step_status(&second.id).unwrap().status, StepStatus::Running);
    assert_eq!(sim.step_names(&handle), vec!["first", "second"]);
}

#[tokio::test]
async fn unknown_ids_are_reported() {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let sim = Arc::new(SimulatedProvider::new(SimulatedBehavior::manual()));
    let engine = Engine::new(store, sim, StepgridConfig::default());

    assert!(engine.get_step_status("missing").is_err());
    assert!(engine.get_cluster_status("missing").is_err());
    assert!(engine.cancel_step("missing").await.is_err());
    assert!(engine.request_termination("missing", None).await.is_err());
}
