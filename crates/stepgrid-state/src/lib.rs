//! stepgrid-state — durable cluster and step records for StepGrid.
//!
//! Backed by [redb](https://docs.rs/redb). Every state transition is a single
//! write transaction that checks the record's current status before applying
//! the change, so concurrent workers never need a global lock.
//!
//! # Architecture
//!
//! ```text
//! Store (trait)                 ← contract used by the engine
//!   └── StateStore (redb)
//!         ├── clusters   {cluster_id}              → Cluster (JSON)
//!         ├── steps      {step_id}                 → Step (JSON)
//!         ├── queue      {cluster_id}:{ordering}   → step_id
//!         └── handles    {provider_handle}         → cluster_id
//! ```
//!
//! Timestamps (`inserted_on`, `updated_on`, `started_on`, ...) are stamped
//! inside the store from its [`Clock`], never taken from callers.

pub mod clock;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StateError, StateResult};
pub use store::{StateStore, Store};
pub use types::*;
