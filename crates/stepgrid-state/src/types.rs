//! Domain types for the StepGrid state store.
//!
//! Clusters and steps are persisted as JSON. Both status enums are closed
//! and carry their own transition table; the store rejects any transition
//! the table does not list.

use std::fmt;

use serde::{Deserialize, Serialize};
use stepgrid_core::Fingerprint;

/// Local identifier of a cluster.
pub type ClusterId = String;

/// Local identifier of a step.
pub type StepId = String;

// ── Cluster ───────────────────────────────────────────────────────

/// Lifecycle status of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Recorded locally, creation not yet acknowledged by the provider.
    Requested,
    Provisioning,
    Ready,
    /// No new assignments; the running step may finish.
    Draining,
    Terminated,
    /// A store write failed mid-transition; the true status is unknown
    /// until reconciliation re-polls the provider.
    NoUpdate,
}

impl ClusterStatus {
    pub const ALL: [ClusterStatus; 6] = [
        ClusterStatus::Requested,
        ClusterStatus::Provisioning,
        ClusterStatus::Ready,
        ClusterStatus::Draining,
        ClusterStatus::Terminated,
        ClusterStatus::NoUpdate,
    ];

    /// Statuses in which a cluster accepts new step assignments.
    pub const ACCEPTING: [ClusterStatus; 3] = [
        ClusterStatus::Requested,
        ClusterStatus::Provisioning,
        ClusterStatus::Ready,
    ];

    pub fn is_terminal(self) -> bool {
        self == ClusterStatus::Terminated
    }

    pub fn is_accepting(self) -> bool {
        Self::ACCEPTING.contains(&self)
    }

    /// Transition table. Re-writing the current status is always allowed
    /// so callers can update fields under a status guard.
    pub fn can_transition_to(self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;
        if self == next {
            return true;
        }
        match self {
            Requested => matches!(next, Provisioning | Draining | Terminated | NoUpdate),
            Provisioning => matches!(next, Ready | Draining | Terminated | NoUpdate),
            Ready => matches!(next, Draining | Terminated | NoUpdate),
            Draining => matches!(next, Ready | Terminated | NoUpdate),
            NoUpdate => matches!(next, Requested | Provisioning | Ready | Draining | Terminated),
            Terminated => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Requested => "requested",
            ClusterStatus::Provisioning => "provisioning",
            ClusterStatus::Ready => "ready",
            ClusterStatus::Draining => "draining",
            ClusterStatus::Terminated => "terminated",
            ClusterStatus::NoUpdate => "no_update",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cluster stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainReason {
    /// An operator asked for termination.
    Requested,
    /// `terminate_on` was reached.
    Deadline,
    /// The queue stayed empty for longer than the idle timeout.
    Idle,
}

/// A transient compute cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    /// Provider-assigned handle, set once creation was acknowledged.
    pub provider_handle: Option<String>,
    pub fingerprint: Fingerprint,
    /// Job-flow configuration handed to the provider.
    pub config: serde_json::Value,
    pub status: ClusterStatus,
    /// Status held before the record fell to `NoUpdate`.
    pub previous_status: Option<ClusterStatus>,
    /// Unix time after which the cluster must be torn down. `None` means
    /// no deadline.
    pub terminate_on: Option<u64>,
    /// Ordering key handed to the next appended step.
    pub next_ordering_key: u64,
    /// Last time a step was appended or finished.
    pub last_activity_on: u64,
    pub drain: Option<DrainReason>,
    pub drain_started_on: Option<u64>,
    /// When a teardown request was last sent to the provider.
    #[serde(default)]
    pub teardown_issued_on: Option<u64>,
    /// Whether the provider confirmed teardown of a terminated cluster.
    pub teardown_confirmed: bool,
    pub last_error: Option<String>,
    pub inserted_on: u64,
    pub updated_on: u64,
}

impl Cluster {
    /// True if the cluster may take new assignments at time `now`.
    pub fn accepts_at(&self, now: u64) -> bool {
        self.status.is_accepting() && self.terminate_on.is_none_or(|t| now < t)
    }
}

/// Fields supplied when a cluster is first recorded.
#[derive(Debug, Clone)]
pub struct NewCluster {
    pub name: String,
    pub config: serde_json::Value,
    pub terminate_on: Option<u64>,
}

impl NewCluster {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.config)
    }
}

// ── Step ──────────────────────────────────────────────────────────

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    /// Queued on a cluster, waiting for its turn.
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Submission outcome unknown; the runner re-issues it idempotently.
    NoUpdate,
}

impl StepStatus {
    pub const ALL: [StepStatus; 7] = [
        StepStatus::Pending,
        StepStatus::Assigned,
        StepStatus::Running,
        StepStatus::Succeeded,
        StepStatus::Failed,
        StepStatus::Cancelled,
        StepStatus::NoUpdate,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Cancelled
        )
    }

    /// Running, or possibly running at the provider.
    pub fn is_active(self) -> bool {
        matches!(self, StepStatus::Running | StepStatus::NoUpdate)
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Assigned | Failed | Cancelled),
            Assigned => matches!(next, Running | Pending | Failed | Cancelled),
            Running => matches!(next, Succeeded | Failed | Cancelled | NoUpdate),
            NoUpdate => matches!(next, Running | Succeeded | Failed | Cancelled),
            Succeeded | Failed | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Assigned => "assigned",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
            StepStatus::NoUpdate => "no_update",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work executed on a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub owner: String,
    /// Step definition handed to the provider.
    pub config: serde_json::Value,
    /// Job-flow configuration the step requires of its cluster.
    pub cluster_config: serde_json::Value,
    pub fingerprint: Fingerprint,
    pub status: StepStatus,
    pub cluster_id: Option<ClusterId>,
    /// Position in the owning cluster's queue.
    pub ordering_key: Option<u64>,
    pub estimated_runtime_secs: Option<u64>,
    pub retry_count: u32,
    pub provider_step_handle: Option<String>,
    pub started_on: Option<u64>,
    pub ended_on: Option<u64>,
    pub last_error: Option<String>,
    pub custom_metadata: serde_json::Value,
    pub inserted_on: u64,
    pub updated_on: u64,
}

/// Fields supplied when a step is submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    pub name: String,
    #[serde(default)]
    pub owner: String,
    pub config: serde_json::Value,
    pub cluster_config: serde_json::Value,
    #[serde(default)]
    pub estimated_runtime_secs: Option<u64>,
    #[serde(default)]
    pub custom_metadata: serde_json::Value,
}

impl NewStep {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.cluster_config)
    }
}

/// Result of asking the store for a cluster's next step.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The lowest queued step was moved to Running.
    Claimed(Step),
    /// Another step is already running (or possibly running).
    Busy(Step),
    /// Nothing is queued, or the cluster is not Ready.
    Idle,
}
