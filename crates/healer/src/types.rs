//! Core data model shared by the heuristic engine, store, executor and loop.

use chrono::{DateTime, Utc};
use notify::Severity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Identity used for cooldown tracking.
///
/// Owner-based keys survive pod recreation: a replacement pod with a new
/// name but the same owner maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum WorkloadKey {
    Owned {
        namespace: String,
        kind: String,
        name: String,
    },
    Pod {
        namespace: String,
        name: String,
    },
}

impl WorkloadKey {
    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::Owned { namespace, .. } | Self::Pod { namespace, .. } => namespace,
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned {
                namespace,
                kind,
                name,
            } => write!(f, "{namespace}/{kind}/{name}"),
            Self::Pod { namespace, name } => write!(f, "{namespace}/Pod/{name}"),
        }
    }
}

/// Owning controller of a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// Per-container slice of a pod observation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerObservation {
    pub name: String,
    pub restart_count: u32,
    /// Reason of the current `waiting` state, e.g. `CrashLoopBackOff`
    pub waiting_reason: Option<String>,
    /// Reason of the current or most recent termination, e.g. `OOMKilled`
    pub last_termination_reason: Option<String>,
}

/// State of the pod's `Ready` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyCondition {
    pub ready: bool,
    pub last_transition: Option<DateTime<Utc>>,
}

/// Immutable snapshot of one pod, produced fresh each scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodObservation {
    pub namespace: String,
    pub name: String,
    pub owner: Option<OwnerRef>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<ContainerObservation>,
    pub phase: String,
    pub ready: Option<ReadyCondition>,
    pub started_at: Option<DateTime<Utc>>,
}

impl PodObservation {
    /// Resolve the workload this pod belongs to.
    #[must_use]
    pub fn workload_key(&self) -> WorkloadKey {
        match &self.owner {
            Some(owner) => WorkloadKey::Owned {
                namespace: self.namespace.clone(),
                kind: owner.kind.clone(),
                name: owner.name.clone(),
            },
            None => WorkloadKey::Pod {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
            },
        }
    }

    /// Sum of restart counts across all containers.
    #[must_use]
    pub fn total_restarts(&self) -> u64 {
        self.containers
            .iter()
            .map(|c| u64::from(c.restart_count))
            .sum()
    }
}

/// Why a workload was selected for remediation.
///
/// Declaration order is rule priority: earlier variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealReason {
    CrashLoop,
    OOMKilled,
    ImagePullBackOff,
    RestartThreshold,
    NotReadyTooLong,
}

impl HealReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CrashLoop => "CrashLoop",
            Self::OOMKilled => "OOMKilled",
            Self::ImagePullBackOff => "ImagePullBackOff",
            Self::RestartThreshold => "RestartThreshold",
            Self::NotReadyTooLong => "NotReadyTooLong",
        }
    }

    /// Severity is informational only; it never affects gating.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::CrashLoop | Self::OOMKilled => Severity::Critical,
            Self::ImagePullBackOff | Self::RestartThreshold | Self::NotReadyTooLong => {
                Severity::Warning
            }
        }
    }
}

impl fmt::Display for HealReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the heuristic engine for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealDecision {
    pub key: WorkloadKey,
    pub reason: HealReason,
    pub pods: Vec<String>,
    pub owner: Option<OwnerRef>,
    pub severity: Severity,
}

impl HealDecision {
    /// Fold another decision for the same workload into this one.
    ///
    /// Target pods are unioned and the higher-priority reason is kept.
    pub fn merge(&mut self, other: HealDecision) {
        debug_assert_eq!(self.key, other.key);
        if other.reason < self.reason {
            self.reason = other.reason;
            self.severity = other.severity;
        }
        for pod in other.pods {
            if !self.pods.contains(&pod) {
                self.pods.push(pod);
            }
        }
        if self.owner.is_none() {
            self.owner = other.owner;
        }
    }
}

/// Remediation strategy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    /// Delete the unhealthy pods and let their controller replace them
    Delete,
    /// Patch the owning controller so it recreates its pods
    Rollout,
}

/// Concrete action handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum ActionKind {
    DeletePod {
        pods: Vec<String>,
        grace_period: Duration,
    },
    RolloutRestart {
        owner: OwnerRef,
    },
}

impl ActionKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DeletePod { .. } => "DeletePod",
            Self::RolloutRestart { .. } => "RolloutRestart",
        }
    }
}

/// Request to the remediation executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationAction {
    pub key: WorkloadKey,
    pub kind: ActionKind,
    pub requested_at: DateTime<Utc>,
}

impl RemediationAction {
    /// Translate a decision into an action for the configured mode.
    ///
    /// Ownerless workloads cannot be rolled out and fall back to pod deletion.
    #[must_use]
    pub fn for_decision(
        decision: &HealDecision,
        mode: ActionMode,
        grace_period: Duration,
        requested_at: DateTime<Utc>,
    ) -> Self {
        let kind = match (mode, &decision.owner) {
            (ActionMode::Rollout, Some(owner)) => ActionKind::RolloutRestart {
                owner: owner.clone(),
            },
            _ => ActionKind::DeletePod {
                pods: decision.pods.clone(),
                grace_period,
            },
        };
        Self {
            key: decision.key.clone(),
            kind,
            requested_at,
        }
    }
}

/// Result of executing a remediation action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "cause")]
pub enum Outcome {
    Success,
    Failure(String),
}

impl Outcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<&Outcome> for notify::HealOutcome {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Success,
            Outcome::Failure(cause) => Self::Failure {
                cause: cause.clone(),
            },
        }
    }
}
