//! Remediation executor.
//!
//! Performs one [`RemediationAction`] against the cluster and reduces the
//! result to an [`Outcome`]. Transient API failures are retried with a
//! doubling delay; permanent ones are returned immediately. The executor
//! never touches the cooldown store.

use chrono::SecondsFormat;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::config::HealerConfig;
use crate::error::ActionError;
use crate::k8s::{ClusterSource, DeleteOutcome};
use crate::types::{ActionKind, Outcome, RemediationAction};

/// Retry schedule for a single API call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn from_config(config: &HealerConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            initial_delay: config.retry_delay(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(200),
        }
    }
}

pub struct RemediationExecutor {
    cluster: Arc<dyn ClusterSource>,
    retry: RetryPolicy,
}

impl RemediationExecutor {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterSource>, retry: RetryPolicy) -> Self {
        Self { cluster, retry }
    }

    /// Execute `action` and report how it went.
    ///
    /// A pod that is already gone counts as deleted. For multi-pod deletes
    /// every pod is attempted; the outcome is a failure if any of them failed.
    #[instrument(skip(self, action), fields(workload = %action.key, action = action.kind.as_str()))]
    pub async fn execute(&self, action: &RemediationAction) -> Outcome {
        let namespace = action.key.namespace();

        match &action.kind {
            ActionKind::DeletePod { pods, grace_period } => {
                let mut failures = Vec::new();
                for pod in pods {
                    let result = self
                        .with_retry("delete_pod", || {
                            self.cluster.delete_pod(namespace, pod, *grace_period)
                        })
                        .await;
                    match result {
                        Ok(DeleteOutcome::Deleted | DeleteOutcome::NotFound) => {}
                        Err(e) => failures.push(format!("{pod}: {e}")),
                    }
                }
                if failures.is_empty() {
                    Outcome::Success
                } else {
                    Outcome::Failure(failures.join("; "))
                }
            }
            ActionKind::RolloutRestart { owner } => {
                let stamp = action
                    .requested_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true);
                match self
                    .with_retry("patch_rollout_annotation", || {
                        self.cluster
                            .patch_rollout_annotation(namespace, owner, &stamp)
                    })
                    .await
                {
                    Ok(()) => Outcome::Success,
                    Err(e) => Outcome::Failure(e.to_string()),
                }
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ActionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActionError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut delay = self.retry.initial_delay;
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(ActionError::Transient(format!(
                        "{operation} failed after {attempts} attempts: {e}"
                    )));
                }
                Err(e) => {
                    warn!(
                        operation,
                        error = %e,
                        "Transient failure, retrying in {}ms (attempt {}/{})",
                        delay.as_millis(),
                        attempt,
                        attempts
                    );
                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}
