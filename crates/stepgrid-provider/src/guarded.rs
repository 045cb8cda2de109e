//! GuardedProvider — quota, timeout and retry around a raw gateway.
//!
//! A call that exceeds `call_timeout` is reported as
//! [`ProviderErrorKind::Timeout`]: the provider may or may not have acted,
//! so callers treat it as an unknown outcome. Transient failures and
//! timeouts are retried with backoff up to the policy's limit; every other
//! kind is returned immediately.

use std::sync::Arc;
use std::time::Duration;

use stepgrid_core::config::ProviderConfig;
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::gateway::{
    ClusterSpec, ProviderClusterStatus, ProviderFuture, ProviderGateway, ProviderOp, StepReport,
    StepSpec,
};
use crate::quota::Quotas;
use crate::retry::RetryPolicy;

pub struct GuardedProvider {
    inner: Arc<dyn ProviderGateway>,
    retry: RetryPolicy,
    call_timeout: Duration,
    quotas: Quotas,
}

impl GuardedProvider {
    pub fn new(inner: Arc<dyn ProviderGateway>, config: &ProviderConfig) -> Self {
        Self {
            inner,
            retry: RetryPolicy::from(&config.retry),
            call_timeout: config.call_timeout,
            quotas: Quotas::new(&config.quotas),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn call<'a, T: Send>(
        &'a self,
        op: ProviderOp,
        subject: &'a str,
        mut attempt: impl FnMut() -> ProviderFuture<'a, T> + Send + 'a,
    ) -> ProviderResult<T> {
        let mut retries = 0;
        loop {
            self.quotas.acquire(op).await;
            let result = match tokio::time::timeout(self.call_timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(op, self.call_timeout)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && retries < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(retries);
                    retries += 1;
                    warn!(
                        %op,
                        %subject,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_auth_expired() {
                        warn!(
                            target: "stepgrid::events",
                            %op,
                            %subject,
                            error = %e,
                            "provider credentials expired"
                        );
                    } else {
                        debug!(%op, %subject, retries, error = %e, "provider call failed");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl ProviderGateway for GuardedProvider {
    fn create_cluster<'a>(&'a self, spec: &'a ClusterSpec) -> ProviderFuture<'a, String> {
        Box::pin(self.call(ProviderOp::CreateCluster, &spec.client_token, move || {
            self.inner.create_cluster(spec)
        }))
    }

    fn add_step<'a>(&'a self, handle: &'a str, step: &'a StepSpec) -> ProviderFuture<'a, String> {
        Box::pin(self.call(ProviderOp::AddStep, &step.client_token, move || {
            self.inner.add_step(handle, step)
        }))
    }

    fn terminate_cluster<'a>(&'a self, handle: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.call(ProviderOp::TerminateCluster, handle, move || {
            self.inner.terminate_cluster(handle)
        }))
    }

    fn get_status<'a>(&'a self, handle: &'a str) -> ProviderFuture<'a, ProviderClusterStatus> {
        Box::pin(self.call(ProviderOp::GetStatus, handle, move || {
            self.inner.get_status(handle)
        }))
    }

    fn get_step_status<'a>(
        &'a self,
        handle: &'a str,
        step_handle: &'a str,
    ) -> ProviderFuture<'a, StepReport> {
        Box::pin(self.call(ProviderOp::GetStepStatus, step_handle, move || {
            self.inner.get_step_status(handle, step_handle)
        }))
    }

    fn cancel_step<'a>(&'a self, handle: &'a str, step_handle: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.call(ProviderOp::CancelStep, step_handle, move || {
            self.inner.cancel_step(handle, step_handle)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::simulated::{SimulatedBehavior, SimulatedProvider};
    use serde_json::json;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn guarded(sim: &Arc<SimulatedProvider>) -> GuardedProvider {
        let config = ProviderConfig {
            call_timeout: Duration::from_millis(200),
            ..ProviderConfig::default()
        };
        GuardedProvider::new(sim.clone(), &config).with_retry(fast_retry())
    }

    fn spec() -> ClusterSpec {
        ClusterSpec {
            client_token: "c1".to_string(),
            name: "etl".to_string(),
            config: json!({}),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sim = Arc::new(SimulatedProvider::new(SimulatedBehavior::manual()));
        sim.fail_next_times(ProviderOp::CreateCluster, ProviderErrorKind::Transient, 2);
        let provider = guarded(&sim);

        provider.create_cluster(&spec()).await.unwrap();
        assert_eq!(sim.calls(ProviderOp::CreateCluster), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let sim = Arc::new(SimulatedProvider::new(SimulatedBehavior::manual()));
        sim.fail_always(ProviderOp::CreateCluster, ProviderErrorKind::Transient);
        let provider = guarded(&sim);

        let err = provider.create_cluster(&spec()).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Transient);
        assert_eq!(sim.calls(ProviderOp::CreateCluster), 3);
    }

    #[tokio::test]
    async fn fatal_and_auth_are_not_retried() {
        let sim = Arc::new(SimulatedProvider::new(SimulatedBehavior::manual()));
        let provider = guarded(&sim);

        sim.fail_next(ProviderOp::CreateCluster, ProviderErrorKind::Fatal);
        assert!(provider.create_cluster(&spec()).await.unwrap_err().is_fatal());
        assert_eq!(sim.calls(ProviderOp::CreateCluster), 1);

        sim.fail_next(ProviderOp::GetStatus, ProviderErrorKind::AuthExpired);
        let err = provider.get_status("j-any").await.unwrap_err();
        assert!(err.is_auth_expired());
        assert_eq!(sim.calls(ProviderOp::GetStatus), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let sim = Arc::new(SimulatedProvider::new(SimulatedBehavior::manual()));
        sim.set_delay(ProviderOp::GetStatus, Duration::from_secs(5));
        let provider = guarded(&sim).with_retry(RetryPolicy::NONE);

        let err = provider.get_status("j-any").await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Timeout);
        assert_eq!(err.op, ProviderOp::GetStatus);
    }

    #[tokio::test]
    async fn lost_response_is_recovered_by_idempotent_retry() {
        let sim = Arc::new(SimulatedProvider::new(SimulatedBehavior::manual()));
        sim.lose_next_response(ProviderOp::CreateCluster);
        let provider = guarded(&sim);

        let handle = provider.create_cluster(&spec()).await.unwrap();
        assert_eq!(sim.cluster_handles(), vec![handle]);
        assert_eq!(sim.calls(ProviderOp::CreateCluster), 2);
    }
}
