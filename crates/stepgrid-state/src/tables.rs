//! redb table definitions for the StepGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values. Records are JSON, index
//! tables hold a bare id.

use redb::TableDefinition;

/// Cluster records keyed by `{cluster_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Step records keyed by `{step_id}`.
pub const STEPS: TableDefinition<&str, &[u8]> = TableDefinition::new("steps");

/// Per-cluster step queue keyed by `{cluster_id}:{ordering_key:020}`; the
/// zero padding keeps lexicographic order equal to queue order.
pub const QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("queue");

/// Provider handle ownership keyed by `{provider_handle}`.
pub const HANDLES: TableDefinition<&str, &[u8]> = TableDefinition::new("handles");

/// Build a queue key.
pub fn queue_key(cluster_id: &str, ordering_key: u64) -> String {
    format!("{cluster_id}:{ordering_key:020}")
}

/// Prefix shared by every queue entry of a cluster.
pub fn queue_prefix(cluster_id: &str) -> String {
    format!("{cluster_id}:")
}
