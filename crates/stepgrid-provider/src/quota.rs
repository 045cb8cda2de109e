//! Per-operation request quotas.
//!
//! Each provider operation draws from its own token bucket. A caller that
//! finds its bucket empty sleeps until the next token is due rather than
//! spending a request the provider would throttle.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use stepgrid_core::config::{QuotaBucket, QuotaSettings};
use tracing::debug;

use crate::gateway::ProviderOp;

/// A token bucket refilled continuously at a fixed rate.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self::starting_at(capacity, refill_per_sec, Instant::now())
    }

    fn starting_at(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
            }),
        }
    }

    /// Take one token at `now`, or report how long until one is available.
    fn take_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    /// Take one token if available right now.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.take_at(Instant::now())
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            tokio::time::sleep(wait).await;
        }
    }
}

impl From<&QuotaBucket> for TokenBucket {
    fn from(config: &QuotaBucket) -> Self {
        Self::new(config.capacity, config.refill_per_sec)
    }
}

/// One bucket per provider operation.
#[derive(Debug)]
pub struct Quotas {
    buckets: HashMap<ProviderOp, TokenBucket>,
}

impl Quotas {
    pub fn new(settings: &QuotaSettings) -> Self {
        let buckets = ProviderOp::ALL
            .into_iter()
            .map(|op| {
                let config = match op {
                    ProviderOp::CreateCluster => &settings.create_cluster,
                    ProviderOp::AddStep => &settings.add_step,
                    ProviderOp::TerminateCluster => &settings.terminate_cluster,
                    ProviderOp::GetStatus => &settings.describe_cluster,
                    ProviderOp::GetStepStatus => &settings.describe_step,
                    ProviderOp::CancelStep => &settings.cancel_step,
                };
                (op, TokenBucket::from(config))
            })
            .collect();
        Self { buckets }
    }

    /// Wait for a token for `op`.
    pub async fn acquire(&self, op: ProviderOp) {
        if let Some(bucket) = self.buckets.get(&op)
            && let Err(wait) = bucket.try_acquire()
        {
            debug!(%op, wait_ms = wait.as_millis() as u64, "provider quota exhausted, waiting");
            tokio::time::sleep(wait).await;
            bucket.acquire().await;
        }
    }
}

impl Default for Quotas {
    fn default() -> Self {
        Self::new(&QuotaSettings::default())
    }
}
