//! Heuristic engine: observation in, at most one decision out.
//!
//! Pure and deterministic. The caller supplies `now`, so the same
//! observation evaluated at the same instant always yields the same answer.
//! Rules run in fixed priority order and the first match wins:
//!
//! 1. a waiting reason matches a crash-loop signature → `CrashLoop`
//! 2. a termination reason matches an OOM signature → `OOMKilled`
//! 3. a waiting reason matches an image-pull signature for longer than the
//!    grace period → `ImagePullBackOff`
//! 4. total restarts reach the threshold → `RestartThreshold`
//! 5. the pod has been not-ready longer than allowed → `NotReadyTooLong`

use chrono::{DateTime, TimeDelta, Utc};
use regex::RegexSet;
use std::time::Duration;

use crate::config::{HealerConfig, EXCLUDE_LABEL};
use crate::error::ConfigError;
use crate::types::{HealDecision, HealReason, PodObservation};

/// Compiled thresholds and signature sets.
#[derive(Debug, Clone)]
pub struct HeuristicEngine {
    crash_loop: RegexSet,
    oom: RegexSet,
    image_pull: RegexSet,
    image_pull_grace: TimeDelta,
    restart_threshold: u64,
    not_ready: TimeDelta,
}

impl HeuristicEngine {
    /// Compile the engine from configuration.
    ///
    /// Fails on an invalid signature pattern.
    pub fn from_config(config: &HealerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            crash_loop: RegexSet::new(&config.crash_loop_reasons)?,
            oom: RegexSet::new(&config.oom_reasons)?,
            image_pull: RegexSet::new(&config.image_pull_reasons)?,
            image_pull_grace: to_delta(config.image_pull_grace()),
            restart_threshold: config.restart_threshold,
            not_ready: to_delta(config.not_ready()),
        })
    }

    /// Evaluate one pod.
    #[must_use]
    pub fn evaluate(&self, pod: &PodObservation, now: DateTime<Utc>) -> Option<HealDecision> {
        if is_excluded(pod) || pod.phase == "Succeeded" {
            return None;
        }

        let reason = self.classify(pod, now)?;

        Some(HealDecision {
            key: pod.workload_key(),
            reason,
            pods: vec![pod.name.clone()],
            owner: pod.owner.clone(),
            severity: reason.severity(),
        })
    }

    fn classify(&self, pod: &PodObservation, now: DateTime<Utc>) -> Option<HealReason> {
        let waiting = || {
            pod.containers
                .iter()
                .filter_map(|c| c.waiting_reason.as_deref())
        };

        if waiting().any(|r| self.crash_loop.is_match(r)) {
            return Some(HealReason::CrashLoop);
        }

        if pod
            .containers
            .iter()
            .filter_map(|c| c.last_termination_reason.as_deref())
            .any(|r| self.oom.is_match(r))
        {
            return Some(HealReason::OOMKilled);
        }

        if waiting().any(|r| self.image_pull.is_match(r))
            && unhealthy_for(pod, now).is_some_and(|d| d >= self.image_pull_grace)
        {
            return Some(HealReason::ImagePullBackOff);
        }

        if pod.total_restarts() >= self.restart_threshold {
            return Some(HealReason::RestartThreshold);
        }

        if let Some(ready) = pod.ready {
            if !ready.ready {
                let since = ready.last_transition.or(pod.started_at)?;
                if now - since > self.not_ready {
                    return Some(HealReason::NotReadyTooLong);
                }
            }
        }

        None
    }
}

/// How long the pod has been in its current unhealthy stretch.
///
/// Measured from the Ready condition turning false, falling back to the pod
/// start time when the condition carries no transition timestamp.
fn unhealthy_for(pod: &PodObservation, now: DateTime<Utc>) -> Option<TimeDelta> {
    let since = match pod.ready {
        Some(ready) if ready.ready => return None,
        Some(ready) => ready.last_transition.or(pod.started_at),
        None => pod.started_at,
    }?;
    Some(now - since)
}

fn is_excluded(pod: &PodObservation) -> bool {
    pod.labels.get(EXCLUDE_LABEL).is_some_and(|v| v == "true")
}

/// Convert a config duration to a chrono delta, saturating on overflow.
pub(crate) fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
