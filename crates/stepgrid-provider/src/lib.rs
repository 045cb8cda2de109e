//! stepgrid-provider — the boundary to the external compute provider.
//!
//! # Architecture
//!
//! ```text
//! GuardedProvider              ← what the engine talks to
//!   ├── Quotas                 ← one token bucket per operation
//!   ├── call timeout           ← expiry is an unknown outcome (Timeout)
//!   ├── RetryPolicy            ← bounded backoff for Transient / Timeout
//!   └── dyn ProviderGateway    ← raw provider (SimulatedProvider, ...)
//! ```
//!
//! Every failure is classified into a closed [`ProviderErrorKind`] so the
//! engine can decide between retrying, waiting for fresh credentials, and
//! failing the entity.

pub mod error;
pub mod gateway;
pub mod guarded;
pub mod quota;
pub mod retry;
pub mod simulated;

pub use error::{ProviderError, ProviderErrorKind, ProviderResult};
pub use gateway::{
    ClusterSpec, ProviderClusterStatus, ProviderFuture, ProviderGateway, ProviderOp,
    ProviderStepStatus, StepReport, StepSpec,
};
pub use guarded::GuardedProvider;
pub use quota::{Quotas, TokenBucket};
pub use retry::RetryPolicy;
pub use simulated::{SimulatedBehavior, SimulatedProvider};
