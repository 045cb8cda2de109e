//! stepgrid-engine — cluster lifecycle and step scheduling.
//!
//! # Architecture
//!
//! ```text
//! Engine (facade)
//!   ├── Scheduler          ← submit / cancel / place, per-cluster serial runner
//!   │     └── placement    ← eligibility + weighted ranking of clusters
//!   ├── LifecycleManager   ← acquire / schedule_termination / terminate
//!   └── Reconciler         ← periodic drift repair against the provider
//!
//! all of the above ──► dyn Store (stepgrid-state)
//!                  └─► dyn ProviderGateway (stepgrid-provider)
//! ```
//!
//! Every state change goes through a compare-and-set on the store; the only
//! in-process locks are per cluster (serial runner) and per configuration
//! fingerprint (cluster creation).

pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod placement;
pub mod reconcile;
pub mod scheduler;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use lifecycle::LifecycleManager;
pub use placement::{ClusterScore, LeadTimeModel, PlacementRequest, rank_clusters, score_cluster};
pub use reconcile::{AuthBackoff, ReconcileReport, Reconciler};
pub use scheduler::{AdvanceOutcome, Evacuation, PlacementPass, Scheduler};
