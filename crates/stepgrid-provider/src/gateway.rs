//! The provider contract.
//!
//! Methods return boxed futures so the trait stays object safe and the
//! engine can hold an `Arc<dyn ProviderGateway>`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::ProviderResult;

/// Boxed future returned by every gateway call.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = ProviderResult<T>> + Send + 'a>>;

/// Operations of the provider's control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOp {
    CreateCluster,
    AddStep,
    TerminateCluster,
    GetStatus,
    GetStepStatus,
    CancelStep,
}

impl ProviderOp {
    pub const ALL: [ProviderOp; 6] = [
        ProviderOp::CreateCluster,
        ProviderOp::AddStep,
        ProviderOp::TerminateCluster,
        ProviderOp::GetStatus,
        ProviderOp::GetStepStatus,
        ProviderOp::CancelStep,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderOp::CreateCluster => "create_cluster",
            ProviderOp::AddStep => "add_step",
            ProviderOp::TerminateCluster => "terminate_cluster",
            ProviderOp::GetStatus => "get_status",
            ProviderOp::GetStepStatus => "get_step_status",
            ProviderOp::CancelStep => "cancel_step",
        }
    }
}

impl fmt::Display for ProviderOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cluster creation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSpec {
    /// Idempotency token. Re-issuing a creation with the same token returns
    /// the handle of the cluster created the first time.
    pub client_token: String,
    pub name: String,
    pub config: serde_json::Value,
}

/// A step submission.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    /// Idempotency token, scoped to the target cluster.
    pub client_token: String,
    pub name: String,
    pub config: serde_json::Value,
}

/// Cluster status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderClusterStatus {
    Provisioning,
    /// Up and idle.
    Ready,
    /// Up and executing a step.
    Running,
    Terminated,
    Unknown,
}

impl ProviderClusterStatus {
    /// Whether the cluster can execute steps.
    pub fn is_up(self) -> bool {
        matches!(self, ProviderClusterStatus::Ready | ProviderClusterStatus::Running)
    }
}

/// Step status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ProviderStepStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ProviderStepStatus::Completed | ProviderStepStatus::Failed | ProviderStepStatus::Cancelled
        )
    }
}

/// Result of a step status poll.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub status: ProviderStepStatus,
    /// Provider-supplied failure reason, if any.
    pub reason: Option<String>,
}

/// The compute provider's control API.
pub trait ProviderGateway: Send + Sync {
    /// Request a new cluster. Returns the provider handle.
    fn create_cluster<'a>(&'a self, spec: &'a ClusterSpec) -> ProviderFuture<'a, String>;

    /// Submit a step to a cluster. Returns the provider step handle.
    fn add_step<'a>(&'a self, handle: &'a str, step: &'a StepSpec) -> ProviderFuture<'a, String>;

    fn terminate_cluster<'a>(&'a self, handle: &'a str) -> ProviderFuture<'a, ()>;

    fn get_status<'a>(&'a self, handle: &'a str) -> ProviderFuture<'a, ProviderClusterStatus>;

    fn get_step_status<'a>(
        &'a self,
        handle: &'a str,
        step_handle: &'a str,
    ) -> ProviderFuture<'a, StepReport>;

    /// Stop an in-flight step. Steps that already finished are left alone.
    fn cancel_step<'a>(&'a self, handle: &'a str, step_handle: &'a str) -> ProviderFuture<'a, ()>;
}
