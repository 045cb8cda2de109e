//! Engine error types.

use stepgrid_provider::ProviderError;
use stepgrid_state::{StateError, StepStatus};
use thiserror::Error;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("step {id} is already {status}")]
    StepFinished { id: String, status: StepStatus },

    #[error("step {0} could not be placed after repeated conflicts")]
    PlacementExhausted(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl EngineError {
    /// True for a provider rejection that retrying will not fix.
    pub fn is_provider_fatal(&self) -> bool {
        matches!(self, EngineError::Provider(e) if e.is_fatal())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
