//! stepgrid.toml configuration parser.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working configuration. Durations are written as strings
//! (`"5s"`, `"15m"`); see [`crate::duration`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::duration::serde_str;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepgridConfig {
    pub store: StoreConfig,
    pub lifecycle: LifecycleConfig,
    pub scheduler: SchedulerConfig,
    pub reconcile: ReconcileConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file, relative to the daemon's data directory.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stepgrid.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Hard cap on a cluster's life, applied as the initial `terminate_on`.
    /// Zero disables the cap.
    #[serde(with = "serde_str")]
    pub max_lifetime: Duration,
    /// How long a Ready cluster may sit with an empty queue before draining.
    #[serde(with = "serde_str")]
    pub idle_timeout: Duration,
    /// How long an idle-drained cluster stays reopenable before teardown.
    #[serde(with = "serde_str")]
    pub idle_grace: Duration,
    /// How long past `terminate_on` a running step may keep a draining
    /// cluster alive before the cluster is torn down anyway.
    #[serde(with = "serde_str")]
    pub drain_grace: Duration,
    /// Teardown attempts before the record is closed without confirmation.
    pub terminate_retries: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_lifetime: Duration::from_secs(240 * 60),
            idle_timeout: Duration::from_secs(15 * 60),
            idle_grace: Duration::from_secs(60),
            drain_grace: Duration::from_secs(30 * 60),
            terminate_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Runtime assumed for steps that do not carry an estimate.
    #[serde(with = "serde_str")]
    pub default_step_runtime: Duration,
    /// Time a freshly requested cluster is expected to take to become Ready.
    #[serde(with = "serde_str")]
    pub provisioning_estimate: Duration,
    /// Safety margin a step must leave before its cluster's `terminate_on`.
    #[serde(with = "serde_str")]
    pub min_lead: Duration,
    /// Placement decisions retried after losing a compare-and-set race.
    pub max_placement_attempts: u32,
    /// Times a step may be evacuated and re-placed before it fails.
    pub max_step_retries: u32,
    pub weights: PlacementWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_step_runtime: Duration::from_secs(30 * 60),
            provisioning_estimate: Duration::from_secs(10 * 60),
            min_lead: Duration::from_secs(60),
            max_placement_attempts: 5,
            max_step_retries: 3,
            weights: PlacementWeights::default(),
        }
    }
}

/// Relative weight of each placement criterion.
///
/// The defaults rank purely by queue length; ties then fall to the cluster
/// with the latest `terminate_on`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementWeights {
    pub queue: f64,
    pub lead_time: f64,
}

impl Default for PlacementWeights {
    fn default() -> Self {
        Self {
            queue: 1.0,
            lead_time: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Base reconciliation interval.
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Interval of the serial-runner loop.
    #[serde(with = "serde_str")]
    pub runner_interval: Duration,
    /// Upper bound for the interval while credentials keep failing.
    #[serde(with = "serde_str")]
    pub auth_backoff_max: Duration,
    /// Age after which a Requested cluster without a handle gets its
    /// creation re-issued.
    #[serde(with = "serde_str")]
    pub create_retry_after: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            runner_interval: Duration::from_secs(10),
            auth_backoff_max: Duration::from_secs(600),
            create_retry_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(with = "serde_str")]
    pub call_timeout: Duration,
    pub retry: RetrySettings,
    pub quotas: QuotaSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    #[serde(with = "serde_str")]
    pub initial_delay: Duration,
    #[serde(with = "serde_str")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(16),
            multiplier: 2.0,
        }
    }
}

/// Token bucket for one provider operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaBucket {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl QuotaBucket {
    pub const fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

impl Default for QuotaBucket {
    fn default() -> Self {
        Self::new(10, 1.0)
    }
}

/// Per-operation request quotas. Defaults follow the provider's published
/// control-plane limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub create_cluster: QuotaBucket,
    pub add_step: QuotaBucket,
    pub describe_cluster: QuotaBucket,
    pub describe_step: QuotaBucket,
    pub terminate_cluster: QuotaBucket,
    pub cancel_step: QuotaBucket,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            create_cluster: QuotaBucket::new(10, 0.5),
            add_step: QuotaBucket::new(10, 0.5),
            describe_cluster: QuotaBucket::new(10, 1.0),
            describe_step: QuotaBucket::new(10, 0.5),
            terminate_cluster: QuotaBucket::new(10, 0.5),
            cancel_step: QuotaBucket::new(10, 0.2),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(20),
            retry: RetrySettings::default(),
            quotas: QuotaSettings::default(),
        }
    }
}

impl StepgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: StepgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would stall or spin the engine.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reconcile.interval.is_zero() {
            bail!("reconcile.interval must be greater than zero");
        }
        if self.reconcile.runner_interval.is_zero() {
            bail!("reconcile.runner_interval must be greater than zero");
        }
        if self.provider.call_timeout.is_zero() {
            bail!("provider.call_timeout must be greater than zero");
        }
        if self.scheduler.max_placement_attempts == 0 {
            bail!("scheduler.max_placement_attempts must be at least 1");
        }
        let w = &self.scheduler.weights;
        for (name, value) in [("queue", w.queue), ("lead_time", w.lead_time)] {
            if !value.is_finite() || value < 0.0 {
                bail!("scheduler.weights.{name} must be a non-negative number");
            }
        }
        if !(self.provider.retry.multiplier.is_finite() && self.provider.retry.multiplier >= 1.0) {
            bail!("provider.retry.multiplier must be at least 1.0");
        }
        let q = &self.provider.quotas;
        for (name, bucket) in [
            ("create_cluster", q.create_cluster.clone()),
            ("add_step", q.add_step.clone()),
            ("describe_cluster", q.describe_cluster.clone()),
            ("describe_step", q.describe_step.clone()),
            ("terminate_cluster", q.terminate_cluster.clone()),
            ("cancel_step", q.cancel_step.clone()),
        ] {
            if bucket.capacity == 0 || !(bucket.refill_per_sec > 0.0) {
                bail!("provider.quotas.{name} needs a positive capacity and refill rate");
            }
        }
        Ok(())
    }
}
