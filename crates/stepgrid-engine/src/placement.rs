//! Cluster scoring for placement decisions.
//!
//! A cluster is eligible for a step when its fingerprint matches, it still
//! accepts work, and the step is expected to finish at least `min_lead`
//! before the cluster's `terminate_on`. Eligible clusters are ranked by a
//! weighted combination of:
//! - **Queue**: fewer queued steps score higher
//! - **Lead time**: more slack before `terminate_on` scores higher
//!
//! Ties fall to the latest `terminate_on`, then the oldest cluster, then
//! the cluster id, so rankings are deterministic.

use std::cmp::Ordering;

use stepgrid_core::Fingerprint;
use stepgrid_core::config::{PlacementWeights, SchedulerConfig};
use stepgrid_state::{Cluster, ClusterStatus, DrainReason, Step};

/// Slack (in seconds) at which the lead-time component saturates.
const LEAD_TIME_SATURATION_SECS: f64 = 4.0 * 3600.0;

/// What a step needs from a cluster.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub fingerprint: Fingerprint,
    pub cluster_name: String,
    pub cluster_config: serde_json::Value,
    pub runtime_secs: u64,
}

impl PlacementRequest {
    pub fn for_step(step: &Step, model: &LeadTimeModel) -> Self {
        Self {
            fingerprint: step.fingerprint.clone(),
            cluster_name: cluster_name_for(step),
            cluster_config: step.cluster_config.clone(),
            runtime_secs: model.runtime_of(step),
        }
    }
}

/// Name given to a cluster created for `step`: the job-flow `Name` if the
/// configuration carries one, else the step's own name.
fn cluster_name_for(step: &Step) -> String {
    step.cluster_config
        .get("Name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("stepgrid-{}", step.name))
}

/// Time estimates used to predict when a step would finish on a cluster.
#[derive(Debug, Clone, Copy)]
pub struct LeadTimeModel {
    pub default_step_runtime_secs: u64,
    pub provisioning_estimate_secs: u64,
    pub min_lead_secs: u64,
}

impl LeadTimeModel {
    pub fn runtime_of(&self, step: &Step) -> u64 {
        step.estimated_runtime_secs
            .unwrap_or(self.default_step_runtime_secs)
    }

    /// Seconds of work still ahead of a new step on `cluster`.
    fn backlog_secs(&self, cluster: &Cluster, queue: &[Step], now: u64) -> u64 {
        let provisioning = if cluster.status == ClusterStatus::Ready
            || cluster.status == ClusterStatus::Draining
        {
            0
        } else {
            (cluster.inserted_on + self.provisioning_estimate_secs).saturating_sub(now)
        };
        let queued: u64 = queue
            .iter()
            .map(|s| {
                let runtime = self.runtime_of(s);
                match s.started_on {
                    Some(started) if s.status.is_active() => {
                        (started + runtime).saturating_sub(now)
                    }
                    _ => runtime,
                }
            })
            .sum();
        provisioning + queued
    }

    /// Unix time at which a step of `runtime_secs` is expected to finish
    /// if appended to `cluster` now.
    pub fn expected_finish(
        &self,
        cluster: &Cluster,
        queue: &[Step],
        runtime_secs: u64,
        now: u64,
    ) -> u64 {
        now + self.backlog_secs(cluster, queue, now) + runtime_secs
    }
}

impl From<&SchedulerConfig> for LeadTimeModel {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            default_step_runtime_secs: config.default_step_runtime.as_secs(),
            provisioning_estimate_secs: config.provisioning_estimate.as_secs(),
            min_lead_secs: config.min_lead.as_secs(),
        }
    }
}

/// A cluster under consideration, with its current queue.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub cluster: Cluster,
    pub queue: Vec<Step>,
}

/// Scored placement result for a single cluster.
#[derive(Debug, Clone)]
pub struct ClusterScore {
    pub cluster_id: String,
    /// Composite score (higher = better).
    pub score: f64,
    pub expected_finish: u64,
    /// Whether placing here first requires reopening an idle-drained cluster.
    pub needs_reopen: bool,
    pub breakdown: ScoreBreakdown,
    terminate_on: Option<u64>,
    inserted_on: u64,
}

/// Individual score components for debugging.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    /// 100 for an empty queue, halving-ish with each queued step.
    pub queue: f64,
    /// Slack before `terminate_on`, scaled to 0..=100.
    pub lead_time: f64,
}

/// Whether `cluster` can take new work at all: accepting, or drained only
/// for idleness and still reopenable.
fn is_open_for(cluster: &Cluster) -> Option<bool> {
    if cluster.status.is_accepting() {
        Some(false)
    } else if cluster.status == ClusterStatus::Draining && cluster.drain == Some(DrainReason::Idle) {
        Some(true)
    } else {
        None
    }
}

/// Score one cluster. Returns `None` if it is not eligible.
pub fn score_cluster(
    candidate: &Candidate,
    req: &PlacementRequest,
    weights: &PlacementWeights,
    model: &LeadTimeModel,
    now: u64,
) -> Option<ClusterScore> {
    let cluster = &candidate.cluster;
    if cluster.fingerprint != req.fingerprint {
        return None;
    }
    let needs_reopen = is_open_for(cluster)?;
    if cluster.terminate_on.is_some_and(|t| t <= now) {
        return None;
    }

    let expected_finish = model.expected_finish(cluster, &candidate.queue, req.runtime_secs, now);
    let slack = match cluster.terminate_on {
        Some(deadline) => {
            let needed = expected_finish + model.min_lead_secs;
            if needed > deadline {
                return None;
            }
            (deadline - needed) as f64
        }
        None => LEAD_TIME_SATURATION_SECS,
    };

    let queue = 100.0 / (1.0 + candidate.queue.len() as f64);
    let lead_time = (slack / LEAD_TIME_SATURATION_SECS).min(1.0) * 100.0;
    let score = weights.queue * queue + weights.lead_time * lead_time;

    Some(ClusterScore {
        cluster_id: cluster.id.clone(),
        score,
        expected_finish,
        needs_reopen,
        breakdown: ScoreBreakdown { queue, lead_time },
        terminate_on: cluster.terminate_on,
        inserted_on: cluster.inserted_on,
    })
}

/// Tie-break order: latest `terminate_on` (none = latest), oldest, id.
fn tie_break(a: &ClusterScore, b: &ClusterScore) -> Ordering {
    let deadline = |s: &ClusterScore| s.terminate_on.unwrap_or(u64::MAX);
    deadline(b)
        .cmp(&deadline(a))
        .then_with(|| a.inserted_on.cmp(&b.inserted_on))
        .then_with(|| a.cluster_id.cmp(&b.cluster_id))
}

/// Score all candidates and return the eligible ones, best first.
///
/// Clusters that already accept work always rank ahead of idle-drained
/// clusters that would need reopening.
pub fn rank_clusters(
    candidates: &[Candidate],
    req: &PlacementRequest,
    weights: &PlacementWeights,
    model: &LeadTimeModel,
    now: u64,
) -> Vec<ClusterScore> {
    let mut scores: Vec<ClusterScore> = candidates
        .iter()
        .filter_map(|c| score_cluster(c, req, weights, model, now))
        .collect();

    scores.sort_by(|a, b| {
        a.needs_reopen
            .cmp(&b.needs_reopen)
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
            .then_with(|| tie_break(a, b))
    });
    scores
}
