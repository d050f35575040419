//! Healer configuration.
//!
//! Loaded once at startup from an optional TOML file, then overridden by CLI
//! flags / environment variables in `main`. Immutable afterwards.

use notify::NotifySettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::ActionMode;

/// Label used to exclude pods from healer monitoring
pub const EXCLUDE_LABEL: &str = "healer.platform/exclude";

/// Annotation the orchestrator interprets as "recreate pods"
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Upper bound for every `*_secs` setting.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Complete runtime configuration for the healer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealerConfig {
    /// Seconds between scan cycles
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Namespaces to watch (empty = all namespaces)
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Kubernetes label selector applied to the pod list
    #[serde(default)]
    pub label_selector: Option<String>,

    /// Total container restarts that trigger `RestartThreshold`
    #[serde(default = "default_restart_threshold")]
    pub restart_threshold: u64,
    /// Waiting-reason patterns that mean crash-looping
    #[serde(default = "default_crash_loop_reasons")]
    pub crash_loop_reasons: Vec<String>,
    /// Termination-reason patterns that mean out-of-memory
    #[serde(default = "default_oom_reasons")]
    pub oom_reasons: Vec<String>,
    /// Waiting-reason patterns that mean the image cannot be pulled
    #[serde(default = "default_image_pull_reasons")]
    pub image_pull_reasons: Vec<String>,
    /// How long an image-pull failure must persist before acting
    #[serde(default = "default_image_pull_grace")]
    pub image_pull_grace_secs: u64,
    /// How long a pod may stay not-ready before acting
    #[serde(default = "default_not_ready")]
    pub not_ready_secs: u64,

    /// Remediation strategy
    #[serde(default = "default_action")]
    pub action: ActionMode,
    /// Minimum time between two actions on the same workload
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Grace period passed to pod deletion
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Upper bound on one cycle (fetch + all actions)
    #[serde(default = "default_cycle_deadline")]
    pub cycle_deadline_secs: u64,
    /// Attempts per action for transient API failures
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// First delay between attempts; doubles each retry
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Evict store entries not seen for this many cycles
    #[serde(default = "default_max_idle_cycles")]
    pub max_idle_cycles: u64,
    /// Hard cap on tracked workloads
    #[serde(default = "default_max_tracked")]
    pub max_tracked_workloads: usize,

    /// Evaluate and log decisions without acting
    #[serde(default)]
    pub dry_run: bool,
    /// Address for the health/metrics server, e.g. `0.0.0.0:8080`
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// OTLP/HTTP collector URL for metrics export, e.g. `http://otel-collector:4318`
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    #[serde(default)]
    pub notify: NotifySettings,
}

fn default_scan_interval() -> u64 {
    30
}
fn default_restart_threshold() -> u64 {
    5
}
fn default_crash_loop_reasons() -> Vec<String> {
    vec!["^CrashLoopBackOff$".to_string()]
}
fn default_oom_reasons() -> Vec<String> {
    vec!["^OOMKilled$".to_string()]
}
fn default_image_pull_reasons() -> Vec<String> {
    vec!["^ImagePullBackOff$".to_string(), "^ErrImagePull$".to_string()]
}
fn default_image_pull_grace() -> u64 {
    120
}
fn default_not_ready() -> u64 {
    600
}
fn default_action() -> ActionMode {
    ActionMode::Delete
}
fn default_cooldown() -> u64 {
    300
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    60
}
fn default_backoff_cap() -> u64 {
    3600
}
fn default_grace_period() -> u64 {
    30
}
fn default_cycle_deadline() -> u64 {
    120
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    200
}
fn default_max_idle_cycles() -> u64 {
    100
}
fn default_max_tracked() -> usize {
    10_000
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            namespaces: vec![],
            label_selector: None,
            restart_threshold: default_restart_threshold(),
            crash_loop_reasons: default_crash_loop_reasons(),
            oom_reasons: default_oom_reasons(),
            image_pull_reasons: default_image_pull_reasons(),
            image_pull_grace_secs: default_image_pull_grace(),
            not_ready_secs: default_not_ready(),
            action: default_action(),
            cooldown_secs: default_cooldown(),
            failure_threshold: default_failure_threshold(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            grace_period_secs: default_grace_period(),
            cycle_deadline_secs: default_cycle_deadline(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay(),
            max_idle_cycles: default_max_idle_cycles(),
            max_tracked_workloads: default_max_tracked(),
            dry_run: false,
            listen_addr: None,
            otlp_endpoint: None,
            notify: NotifySettings::default(),
        }
    }
}

impl HealerConfig {
    /// Load configuration from a TOML file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Reject settings the control loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.scan_interval_secs == 0 {
            return invalid("scan_interval_secs must be greater than 0");
        }
        if self.restart_threshold == 0 {
            return invalid("restart_threshold must be greater than 0");
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold must be greater than 0");
        }
        if self.retry_attempts == 0 {
            return invalid("retry_attempts must be at least 1");
        }
        if self.cycle_deadline_secs == 0 {
            return invalid("cycle_deadline_secs must be greater than 0");
        }
        for (field, secs) in self.durations() {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{field} must not exceed {MAX_DURATION_SECS} (one year)"
                )));
            }
        }
        if self.backoff_base_secs > self.backoff_cap_secs {
            return invalid("backoff_base_secs must not exceed backoff_cap_secs");
        }
        if self.max_tracked_workloads == 0 {
            return invalid("max_tracked_workloads must be greater than 0");
        }
        if self.crash_loop_reasons.is_empty()
            && self.oom_reasons.is_empty()
            && self.image_pull_reasons.is_empty()
        {
            tracing::warn!("All signature sets are empty; only threshold rules will fire");
        }
        Ok(())
    }

    fn durations(&self) -> [(&'static str, u64); 8] {
        [
            ("scan_interval_secs", self.scan_interval_secs),
            ("image_pull_grace_secs", self.image_pull_grace_secs),
            ("not_ready_secs", self.not_ready_secs),
            ("cooldown_secs", self.cooldown_secs),
            ("backoff_base_secs", self.backoff_base_secs),
            ("backoff_cap_secs", self.backoff_cap_secs),
            ("grace_period_secs", self.grace_period_secs),
            ("cycle_deadline_secs", self.cycle_deadline_secs),
        ]
    }

    #[must_use]
    pub const fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[must_use]
    pub const fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    #[must_use]
    pub const fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    #[must_use]
    pub const fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }

    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub const fn image_pull_grace(&self) -> Duration {
        Duration::from_secs(self.image_pull_grace_secs)
    }

    #[must_use]
    pub const fn not_ready(&self) -> Duration {
        Duration::from_secs(self.not_ready_secs)
    }
}
