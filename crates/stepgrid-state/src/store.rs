//! StateStore — redb-backed persistence for clusters and steps.
//!
//! Every mutating call is one write transaction: the current record is read,
//! its status compared with the caller's expectation, the transition checked
//! against the status table, and the new record written together with any
//! index rows (queue entries, handle ownership). A mismatch aborts the
//! transaction with [`StateError::Conflict`].

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// The store contract the engine is written against.
///
/// All methods are atomic. Implementations stamp every timestamp from a
/// single clock, exposed through [`Store::now`].
pub trait Store: Send + Sync {
    /// Current time of the store's clock, in unix seconds.
    fn now(&self) -> u64;

    fn insert_cluster(&self, new: NewCluster) -> StateResult<Cluster>;
    fn get_cluster(&self, id: &str) -> StateResult<Option<Cluster>>;
    fn list_clusters(&self) -> StateResult<Vec<Cluster>>;
    fn list_clusters_by_status(&self, statuses: &[ClusterStatus]) -> StateResult<Vec<Cluster>>;

    /// Move a cluster from `expected` to `next`, applying `update` to the
    /// record first. Fails with `Conflict` if the stored status differs.
    fn compare_and_set_cluster(
        &self,
        id: &str,
        expected: ClusterStatus,
        next: ClusterStatus,
        update: &mut dyn FnMut(&mut Cluster),
    ) -> StateResult<Cluster>;

    /// Park a cluster at `NoUpdate` whatever its current live status.
    fn mark_cluster_no_update(&self, id: &str, reason: &str) -> StateResult<Cluster>;

    fn insert_step(&self, new: NewStep) -> StateResult<Step>;
    fn get_step(&self, id: &str) -> StateResult<Option<Step>>;
    fn list_steps(&self) -> StateResult<Vec<Step>>;
    fn list_steps_by_status(&self, statuses: &[StepStatus]) -> StateResult<Vec<Step>>;

    /// Step counterpart of [`Store::compare_and_set_cluster`]. Terminal
    /// transitions and requeues also drop the step's queue entry.
    fn compare_and_set_step(
        &self,
        id: &str,
        expected: StepStatus,
        next: StepStatus,
        update: &mut dyn FnMut(&mut Step),
    ) -> StateResult<Step>;

    /// Attach a Pending step to the tail of a cluster's queue.
    fn append_to_queue(&self, cluster_id: &str, step_id: &str) -> StateResult<Step>;

    /// Queued and running steps of a cluster, in ordering-key order.
    fn queue(&self, cluster_id: &str) -> StateResult<Vec<Step>>;

    /// Move the lowest queued step of a Ready cluster to Running, unless a
    /// step of that cluster is already running.
    fn claim_next_step(&self, cluster_id: &str) -> StateResult<ClaimOutcome>;
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            clock: Arc::new(SystemClock),
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            clock: Arc::new(SystemClock),
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Replace the clock used to stamp records.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(STEPS).map_err(map_err!(Table))?;
        txn.open_table(QUEUE).map_err(map_err!(Table))?;
        txn.open_table(HANDLES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn list_where<T: DeserializeOwned>(
        &self,
        def: redb::TableDefinition<&str, &[u8]>,
        keep: impl Fn(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T = decode(value.value())?;
            if keep(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }
}

// ── Helpers ───────────────────────────────────────────────────────

type JsonTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn put<T: Serialize>(table: &mut JsonTable<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Step ids queued on a cluster, in ordering-key order.
fn queued_ids(
    queue: &impl ReadableTable<&'static str, &'static [u8]>,
    cluster_id: &str,
) -> StateResult<Vec<String>> {
    let prefix = queue_prefix(cluster_id);
    let mut entries = Vec::new();
    for entry in queue.range(prefix.as_str()..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(&prefix) {
            break;
        }
        entries.push(String::from_utf8_lossy(value.value()).into_owned());
    }
    Ok(entries)
}

fn invalid_cluster_transition(from: ClusterStatus, to: ClusterStatus) -> StateError {
    StateError::InvalidTransition {
        entity: "cluster",
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn invalid_step_transition(from: StepStatus, to: StepStatus) -> StateError {
    StateError::InvalidTransition {
        entity: "step",
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Record a provider handle for `cluster_id`, refusing one owned by
/// another cluster.
fn claim_handle(
    handles: &mut JsonTable<'_>,
    cluster_id: &str,
    old: Option<&str>,
    new: Option<&str>,
) -> StateResult<()> {
    if old == new {
        return Ok(());
    }
    if let Some(handle) = new {
        let owner = handles
            .get(handle)
            .map_err(map_err!(Read))?
            .map(|g| String::from_utf8_lossy(g.value()).into_owned());
        if let Some(owner) = owner
            && owner != cluster_id
        {
            return Err(StateError::Constraint(format!(
                "provider handle {handle} already belongs to cluster {owner}"
            )));
        }
        handles
            .insert(handle, cluster_id.as_bytes())
            .map_err(map_err!(Write))?;
    }
    if let Some(handle) = old {
        handles.remove(handle).map_err(map_err!(Write))?;
    }
    Ok(())
}

impl Store for StateStore {
    fn now(&self) -> u64 {
        self.clock.now()
    }

    // ── Clusters ──────────────────────────────────────────────────

    fn insert_cluster(&self, new: NewCluster) -> StateResult<Cluster> {
        let now = self.now();
        let cluster = Cluster {
            id: Uuid::new_v4().to_string(),
            fingerprint: new.fingerprint(),
            name: new.name,
            provider_handle: None,
            config: new.config,
            status: ClusterStatus::Requested,
            previous_status: None,
            terminate_on: new.terminate_on,
            next_ordering_key: 0,
            last_activity_on: now,
            drain: None,
            drain_started_on: None,
            teardown_issued_on: None,
            teardown_confirmed: false,
            last_error: None,
            inserted_on: now,
            updated_on: now,
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            put(&mut table, &cluster.id, &cluster)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster_id = %cluster.id, fingerprint = %cluster.fingerprint, "cluster recorded");
        Ok(cluster)
    }

    fn get_cluster(&self, id: &str) -> StateResult<Option<Cluster>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        load(&table, id)
    }

    fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        self.list_where(CLUSTERS, |_: &Cluster| true)
    }

    fn list_clusters_by_status(&self, statuses: &[ClusterStatus]) -> StateResult<Vec<Cluster>> {
        self.list_where(CLUSTERS, |c: &Cluster| statuses.contains(&c.status))
    }

    fn compare_and_set_cluster(
        &self,
        id: &str,
        expected: ClusterStatus,
        next: ClusterStatus,
        update: &mut dyn FnMut(&mut Cluster),
    ) -> StateResult<Cluster> {
        if !expected.can_transition_to(next) {
            return Err(invalid_cluster_transition(expected, next));
        }
        let now = self.now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let cluster = {
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let mut handles = txn.open_table(HANDLES).map_err(map_err!(Table))?;
            let current: Cluster = load(&clusters, id)?
                .ok_or_else(|| StateError::NotFound(format!("cluster {id}")))?;
            if current.status != expected {
                return Err(StateError::Conflict(format!(
                    "cluster {id} is {}, expected {expected}",
                    current.status
                )));
            }

            let mut cluster = current.clone();
            update(&mut cluster);
            cluster.id = current.id.clone();
            cluster.fingerprint = current.fingerprint.clone();
            cluster.inserted_on = current.inserted_on;
            cluster.next_ordering_key = current.next_ordering_key;
            cluster.status = next;
            cluster.updated_on = now;
            if next == ClusterStatus::NoUpdate && expected != ClusterStatus::NoUpdate {
                cluster.previous_status = Some(expected);
            } else if next != ClusterStatus::NoUpdate {
                cluster.previous_status = None;
            }

            claim_handle(
                &mut handles,
                id,
                current.provider_handle.as_deref(),
                cluster.provider_handle.as_deref(),
            )?;
            put(&mut clusters, id, &cluster)?;
            cluster
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster_id = %id, from = %expected, to = %next, "cluster updated");
        Ok(cluster)
    }

    fn mark_cluster_no_update(&self, id: &str, reason: &str) -> StateResult<Cluster> {
        let now = self.now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let cluster = {
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let mut cluster: Cluster = load(&clusters, id)?
                .ok_or_else(|| StateError::NotFound(format!("cluster {id}")))?;
            if cluster.status.is_terminal() || cluster.status == ClusterStatus::NoUpdate {
                return Ok(cluster);
            }
            cluster.previous_status = Some(cluster.status);
            cluster.status = ClusterStatus::NoUpdate;
            cluster.last_error = Some(reason.to_string());
            cluster.updated_on = now;
            put(&mut clusters, id, &cluster)?;
            cluster
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster_id = %id, %reason, "cluster marked no_update");
        Ok(cluster)
    }

    // ── Steps ─────────────────────────────────────────────────────

    fn insert_step(&self, new: NewStep) -> StateResult<Step> {
        let now = self.now();
        let step = Step {
            id: Uuid::new_v4().to_string(),
            fingerprint: new.fingerprint(),
            name: new.name,
            owner: new.owner,
            config: new.config,
            cluster_config: new.cluster_config,
            status: StepStatus::Pending,
            cluster_id: None,
            ordering_key: None,
            estimated_runtime_secs: new.estimated_runtime_secs,
            retry_count: 0,
            provider_step_handle: None,
            started_on: None,
            ended_on: None,
            last_error: None,
            custom_metadata: new.custom_metadata,
            inserted_on: now,
            updated_on: now,
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STEPS).map_err(map_err!(Table))?;
            put(&mut table, &step.id, &step)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(step_id = %step.id, fingerprint = %step.fingerprint, "step recorded");
        Ok(step)
    }

    fn get_step(&self, id: &str) -> StateResult<Option<Step>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STEPS).map_err(map_err!(Table))?;
        load(&table, id)
    }

    fn list_steps(&self) -> StateResult<Vec<Step>> {
        let mut steps = self.list_where(STEPS, |_: &Step| true)?;
        steps.sort_by(|a, b| a.inserted_on.cmp(&b.inserted_on).then_with(|| a.id.cmp(&b.id)));
        Ok(steps)
    }

    fn list_steps_by_status(&self, statuses: &[StepStatus]) -> StateResult<Vec<Step>> {
        let mut steps = self.list_where(STEPS, |s: &Step| statuses.contains(&s.status))?;
        steps.sort_by(|a, b| a.inserted_on.cmp(&b.inserted_on).then_with(|| a.id.cmp(&b.id)));
        Ok(steps)
    }

    fn compare_and_set_step(
        &self,
        id: &str,
        expected: StepStatus,
        next: StepStatus,
        update: &mut dyn FnMut(&mut Step),
    ) -> StateResult<Step> {
        if !expected.can_transition_to(next) {
            return Err(invalid_step_transition(expected, next));
        }
        if next == StepStatus::Assigned && expected != StepStatus::Assigned {
            return Err(StateError::Constraint(
                "steps are assigned through append_to_queue".to_string(),
            ));
        }
        let now = self.now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let step = {
            let mut steps = txn.open_table(STEPS).map_err(map_err!(Table))?;
            let mut queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let current: Step = load(&steps, id)?
                .ok_or_else(|| StateError::NotFound(format!("step {id}")))?;
            if current.status != expected {
                return Err(StateError::Conflict(format!(
                    "step {id} is {}, expected {expected}",
                    current.status
                )));
            }

            // At most one active step per cluster.
            if next.is_active()
                && !expected.is_active()
                && let Some(cluster_id) = current.cluster_id.as_deref()
            {
                for other_id in queued_ids(&queue, cluster_id)? {
                    if other_id == id {
                        continue;
                    }
                    let other: Option<Step> = load(&steps, &other_id)?;
                    if other.is_some_and(|o| o.status.is_active()) {
                        return Err(StateError::Conflict(format!(
                            "cluster {cluster_id} already runs step {other_id}"
                        )));
                    }
                }
            }

            let mut step = current.clone();
            update(&mut step);
            step.id = current.id.clone();
            step.fingerprint = current.fingerprint.clone();
            step.inserted_on = current.inserted_on;
            step.cluster_id = current.cluster_id.clone();
            step.ordering_key = current.ordering_key;
            step.status = next;
            step.updated_on = now;
            if next.is_active() && step.started_on.is_none() {
                step.started_on = Some(now);
            }

            let leaves_queue = next.is_terminal() || next == StepStatus::Pending;
            if leaves_queue
                && let (Some(cluster_id), Some(ordering)) =
                    (current.cluster_id.as_deref(), current.ordering_key)
            {
                queue
                    .remove(queue_key(cluster_id, ordering).as_str())
                    .map_err(map_err!(Write))?;
                let cluster: Option<Cluster> = load(&clusters, cluster_id)?;
                if let Some(mut cluster) = cluster {
                    cluster.last_activity_on = now;
                    cluster.updated_on = now;
                    put(&mut clusters, cluster_id, &cluster)?;
                }
            }
            if next == StepStatus::Pending {
                step.cluster_id = None;
                step.ordering_key = None;
                step.started_on = None;
                step.provider_step_handle = None;
            }
            if next.is_terminal() && step.ended_on.is_none() {
                step.ended_on = Some(now);
            }

            put(&mut steps, id, &step)?;
            step
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(step_id = %id, from = %expected, to = %next, "step updated");
        Ok(step)
    }

    // ── Queue ─────────────────────────────────────────────────────

    fn append_to_queue(&self, cluster_id: &str, step_id: &str) -> StateResult<Step> {
        let now = self.now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let step = {
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let mut steps = txn.open_table(STEPS).map_err(map_err!(Table))?;
            let mut queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;

            let mut cluster: Cluster = load(&clusters, cluster_id)?
                .ok_or_else(|| StateError::NotFound(format!("cluster {cluster_id}")))?;
            if !cluster.accepts_at(now) {
                return Err(StateError::Conflict(format!(
                    "cluster {cluster_id} is {} and no longer accepts steps",
                    cluster.status
                )));
            }
            let mut step: Step = load(&steps, step_id)?
                .ok_or_else(|| StateError::NotFound(format!("step {step_id}")))?;
            if step.status != StepStatus::Pending {
                return Err(StateError::Conflict(format!(
                    "step {step_id} is {}, expected pending",
                    step.status
                )));
            }
            if step.fingerprint != cluster.fingerprint {
                return Err(StateError::Constraint(format!(
                    "step {step_id} fingerprint {} does not match cluster {cluster_id}",
                    step.fingerprint
                )));
            }

            let ordering = cluster.next_ordering_key;
            cluster.next_ordering_key += 1;
            cluster.last_activity_on = now;
            cluster.updated_on = now;
            step.status = StepStatus::Assigned;
            step.cluster_id = Some(cluster_id.to_string());
            step.ordering_key = Some(ordering);
            step.updated_on = now;

            queue
                .insert(queue_key(cluster_id, ordering).as_str(), step_id.as_bytes())
                .map_err(map_err!(Write))?;
            put(&mut clusters, cluster_id, &cluster)?;
            put(&mut steps, step_id, &step)?;
            step
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%cluster_id, %step_id, ordering_key = ?step.ordering_key, "step queued");
        Ok(step)
    }

    fn queue(&self, cluster_id: &str) -> StateResult<Vec<Step>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
        let steps = txn.open_table(STEPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for step_id in queued_ids(&queue, cluster_id)? {
            if let Some(step) = load::<Step>(&steps, &step_id)? {
                results.push(step);
            }
        }
        Ok(results)
    }

    fn claim_next_step(&self, cluster_id: &str) -> StateResult<ClaimOutcome> {
        let now = self.now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let mut steps = txn.open_table(STEPS).map_err(map_err!(Table))?;
            let queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;

            let cluster: Cluster = load(&clusters, cluster_id)?
                .ok_or_else(|| StateError::NotFound(format!("cluster {cluster_id}")))?;
            let mut queued = Vec::new();
            for step_id in queued_ids(&queue, cluster_id)? {
                if let Some(step) = load::<Step>(&steps, &step_id)? {
                    queued.push(step);
                }
            }

            if let Some(active) = queued.iter().find(|s| s.status.is_active()) {
                ClaimOutcome::Busy(active.clone())
            } else if cluster.status != ClusterStatus::Ready {
                ClaimOutcome::Idle
            } else if let Some(next) = queued.into_iter().find(|s| s.status == StepStatus::Assigned)
            {
                let mut step = next;
                step.status = StepStatus::Running;
                step.started_on = Some(now);
                step.updated_on = now;
                put(&mut steps, &step.id, &step)?;
                ClaimOutcome::Claimed(step)
            } else {
                ClaimOutcome::Idle
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if let ClaimOutcome::Claimed(step) = &outcome {
            debug!(%cluster_id, step_id = %step.id, "step claimed");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn store_at(start: u64) -> (StateStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let store = StateStore::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        (store, clock)
    }

    fn new_cluster(terminate_on: Option<u64>) -> NewCluster {
        NewCluster {
            name: "etl".to_string(),
            config: json!({"Instances": {"Count": 3}}),
            terminate_on,
        }
    }

    fn new_step(name: &str) -> NewStep {
        NewStep {
            name: name.to_string(),
            owner: "alice".to_string(),
            config: json!({"Args": ["spark-submit", name]}),
            cluster_config: json!({"Instances": {"Count": 3}}),
            estimated_runtime_secs: Some(60),
            custom_metadata: json!({}),
        }
    }

    fn ready_cluster(store: &StateStore) -> Cluster {
        ready_cluster_until(store, None)
    }

    fn ready_cluster_until(store: &StateStore, terminate_on: Option<u64>) -> Cluster {
        let cluster = store.insert_cluster(new_cluster(terminate_on)).unwrap();
        store
            .compare_and_set_cluster(
                &cluster.id,
                ClusterStatus::Requested,
                ClusterStatus::Provisioning,
                &mut |c| c.provider_handle = Some(format!("j-{}", c.id)),
            )
            .unwrap();
        store
            .compare_and_set_cluster(
                &cluster.id,
                ClusterStatus::Provisioning,
                ClusterStatus::Ready,
                &mut |_| {},
            )
            .unwrap()
    }

    // ── Clusters ───────────────────────────────────────────────────

    #[test]
    fn cluster_insert_stamps_clock() {
        let (store, _) = store_at(1_000);
        let cluster = store.insert_cluster(new_cluster(Some(5_000))).unwrap();
        assert_eq!(cluster.status, ClusterStatus::Requested);
        assert_eq!(cluster.inserted_on, 1_000);
        assert_eq!(cluster.updated_on, 1_000);
        assert_eq!(store.get_cluster(&cluster.id).unwrap(), Some(cluster));
    }

    #[test]
    fn cluster_cas_updates_timestamp_and_fields() {
        let (store, clock) = store_at(1_000);
        let cluster = store.insert_cluster(new_cluster(None)).unwrap();
        clock.advance(Duration::from_secs(30));
        let updated = store
            .compare_and_set_cluster(
                &cluster.id,
                ClusterStatus::Requested,
                ClusterStatus::Provisioning,
                &mut |c| {
                    c.provider_handle = Some("j-1".into());
                    c.inserted_on = 0;
                },
            )
            .unwrap();
        assert_eq!(updated.status, ClusterStatus::Provisioning);
        assert_eq!(updated.provider_handle.as_deref(), Some("j-1"));
        assert_eq!(updated.inserted_on, 1_000);
        assert_eq!(updated.updated_on, 1_030);
    }

    #[test]
    fn cluster_cas_conflicts_on_stale_status() {
        let (store, _) = store_at(0);
        let cluster = ready_cluster(&store);
        let err = store
            .compare_and_set_cluster(
                &cluster.id,
                ClusterStatus::Provisioning,
                ClusterStatus::Ready,
                &mut |_| {},
            )
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn cluster_cas_rejects_transition_outside_table() {
        let (store, _) = store_at(0);
        let cluster = ready_cluster(&store);
        store
            .compare_and_set_cluster(
                &cluster.id,
                ClusterStatus::Ready,
                ClusterStatus::Terminated,
                &mut |_| {},
            )
            .unwrap();
        let err = store
            .compare_and_set_cluster(
                &cluster.id,
                ClusterStatus::Terminated,
                ClusterStatus::Ready,
                &mut |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn provider_handles_are_unique() {
        let (store, _) = store_at(0);
        let a = store.insert_cluster(new_cluster(None)).unwrap();
        let b = store.insert_cluster(new_cluster(None)).unwrap();
        store
            .compare_and_set_cluster(
                &a.id,
                ClusterStatus::Requested,
                ClusterStatus::Provisioning,
                &mut |c| c.provider_handle = Some("j-dup".into()),
            )
            .unwrap();
        let err = store
            .compare_and_set_cluster(
                &b.id,
                ClusterStatus::Requested,
                ClusterStatus::Provisioning,
                &mut |c| c.provider_handle = Some("j-dup".into()),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::Constraint(_)));
        let b = store.get_cluster(&b.id).unwrap().unwrap();
        assert_eq!(b.status, ClusterStatus::Requested);
    }

    #[test]
    fn no_update_remembers_previous_status() {
        let (store, _) = store_at(0);
        let cluster = ready_cluster(&store);
        let parked = store.mark_cluster_no_update(&cluster.id, "disk full").unwrap();
        assert_eq!(parked.status, ClusterStatus::NoUpdate);
        assert_eq!(parked.previous_status, Some(ClusterStatus::Ready));
        assert_eq!(parked.last_error.as_deref(), Some("disk full"));

        let restored = store
            .compare_and_set_cluster(
                &cluster.id,
                ClusterStatus::NoUpdate,
                ClusterStatus::Ready,
                &mut |_| {},
            )
            .unwrap();
        assert_eq!(restored.previous_status, None);
    }

    #[test]
    fn list_clusters_by_status_filters() {
        let (store, _) = store_at(0);
        ready_cluster(&store);
        store.insert_cluster(new_cluster(None)).unwrap();
        assert_eq!(
            store
                .list_clusters_by_status(&[ClusterStatus::Ready])
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.list_clusters().unwrap().len(), 2);
    }

    // ── Queue ──────────────────────────────────────────────────────

    #[test]
    fn append_assigns_increasing_ordering_keys() {
        let (store, _) = store_at(0);
        let cluster = ready_cluster(&store);
        for name in ["a", "b", "c"] {
            let step = store.insert_step(new_step(name)).unwrap();
            store.append_to_queue(&cluster.id, &step.id).unwrap();
        }
        let queue = store.queue(&cluster.id).unwrap();
        let names: Vec<_> = queue.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        let keys: Vec<_> = queue.iter().map(|s| s.ordering_key.unwrap()).collect();
        assert_eq!(keys, [0, 1, 2]);
        assert!(queue.iter().all(|s| s.status == StepStatus::Assigned));
    }

    #[test]
    fn append_rejects_non_accepting_cluster() {
        let (store, _) = store_at(0);
        let cluster = ready_cluster(&store);
        store
            .compare_and_set_cluster(
                &cluster.id,
                ClusterStatus::Ready,
                ClusterStatus::Draining,
                &mut |_| {},
            )
            .unwrap();
        let step = store.insert_step(new_step("a")).unwrap();
        let err = store.append_to_queue(&cluster.id, &step.id).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            store.get_step(&step.id).unwrap().unwrap().status,
            StepStatus::Pending
        );
    }

    #[test]
    fn append_rejects_past_deadline() {
        let (store, clock) = store_at(0);
        let cluster = ready_cluster_until(&store, Some(100_000));
        clock.set(100_000);
        let step = store.insert_step(new_step("a")).unwrap();
        assert!(store.append_to_queue(&cluster.id, &step.id).unwrap_err().is_conflict());
    }

    #[test]
    fn append_rejects_foreign_fingerprint() {
        let (store, _) = store_at(0);
        let cluster = ready_cluster(&store);
        let mut new = new_step("a");
        new.cluster_config = json!({"Instances": {"Count": 9}});
        let step = store.insert_step(new).unwrap();
        let err = store.append_to_queue(&cluster.id, &step.id).unwrap_err();
        assert!(matches!(err, StateError::Constraint(_)));
    }

    #[test]
    fn step_cannot_be_queued_twice() {
        let (store, _) = store_at(0);
        let first = ready_cluster(&store);
        let second = ready_cluster(&store);
        let step = store.insert_step(new_step("a")).unwrap();
        store.append_to_queue(&first.id, &step.id).unwrap();
        assert!(store.append_to_queue(&second.id, &step.id).unwrap_err().is_conflict());
        assert!(store.queue(&second.id).unwrap().is_empty());
    }

    #[test]
    fn claim_runs_one_step_at_a_time() {
        let (store, _) = store_at(0);
        let cluster = ready_cluster(&store);
        let a = store.insert_step(new_step("a")).unwrap();
        let b = store.insert_step(new_step("b")).unwrap();
        store.append_to_queue(&cluster.id, &a.id).unwrap();
        store.append_to_queue(&cluster.id, &b.id).unwrap();

        let claimed = match store.claim_next_step(&cluster.id).unwrap() {
            ClaimOutcome::Claimed(step) => step,
            other => panic!("expected claim, got {other:?}"),
        };
        assert_eq!(claimed.id, a.id);
        assert_eq!(claimed.status, StepStatus::Running);

        match store.claim_next_step(&cluster.id).unwrap() {
            ClaimOutcome::Busy(step) => assert_eq!(step.id, a.id),
            other => panic!("expected busy, got {other:?}"),
        }

        let err = store
            .compare_and_set_step(&b.id, StepStatus::Assigned, StepStatus::Running, &mut |_| {})
            .unwrap_err();
        assert!(err.is_conflict());

        store
            .compare_and_set_step(&a.id, StepStatus::Running, StepStatus::Succeeded, &mut |_| {})
            .unwrap();
        match store.claim_next_step(&cluster.id).unwrap() {
            ClaimOutcome::Claimed(step) => assert_eq!(step.id, b.id),
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[test]
    fn claim_is_idle_when_cluster_not_ready() {
        let (store, _) = store_at(0);
        let cluster = store.insert_cluster(new_cluster(None)).unwrap();
        let step = store.insert_step(new_step("a")).unwrap();
        store.append_to_queue(&cluster.id, &step.id).unwrap();
        assert_eq!(store.claim_next_step(&cluster.id).unwrap(), ClaimOutcome::Idle);
    }

    #[test]
    fn terminal_step_leaves_queue_and_touches_cluster() {
        let (store, clock) = store_at(0);
        let cluster = ready_cluster(&store);
        let step = store.insert_step(new_step("a")).unwrap();
        store.append_to_queue(&cluster.id, &step.id).unwrap();
        clock.set(500);
        let done = store
            .compare_and_set_step(&step.id, StepStatus::Assigned, StepStatus::Cancelled, &mut |_| {})
            .unwrap();
        assert_eq!(done.ended_on, Some(500));
        assert_eq!(done.cluster_id.as_deref(), Some(cluster.id.as_str()));
        assert!(store.queue(&cluster.id).unwrap().is_empty());
        let cluster = store.get_cluster(&cluster.id).unwrap().unwrap();
        assert_eq!(cluster.last_activity_on, 500);
    }

    #[test]
    fn requeue_detaches_step() {
        let (store, _) = store_at(0);
        let cluster = ready_cluster(&store);
        let step = store.insert_step(new_step("a")).unwrap();
        store.append_to_queue(&cluster.id, &step.id).unwrap();
        let back = store
            .compare_and_set_step(&step.id, StepStatus::Assigned, StepStatus::Pending, &mut |s| {
                s.retry_count += 1
            })
            .unwrap();
        assert_eq!(back.cluster_id, None);
        assert_eq!(back.ordering_key, None);
        assert_eq!(back.retry_count, 1);
        assert!(store.queue(&cluster.id).unwrap().is_empty());
    }

    #[test]
    fn assignment_only_through_queue() {
        let (store, _) = store_at(0);
        let step = store.insert_step(new_step("a")).unwrap();
        let err = store
            .compare_and_set_step(&step.id, StepStatus::Pending, StepStatus::Assigned, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, StateError::Constraint(_)));
    }

    #[test]
    fn list_steps_by_status_orders_by_insertion() {
        let (store, clock) = store_at(0);
        let first = store.insert_step(new_step("a")).unwrap();
        clock.advance(Duration::from_secs(1));
        let second = store.insert_step(new_step("b")).unwrap();
        let pending = store.list_steps_by_status(&[StepStatus::Pending]).unwrap();
        let ids: Vec<_> = pending.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, [first.id, second.id]);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        let (cluster_id, step_id) = {
            let store = StateStore::open(&db_path).unwrap();
            let cluster = ready_cluster(&store);
            let step = store.insert_step(new_step("a")).unwrap();
            store.append_to_queue(&cluster.id, &step.id).unwrap();
            (cluster.id, step.id)
        };

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let queue = store.queue(&cluster_id).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, step_id);
    }
}
