//! Notification event types for healer remediation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for alerts and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the embed color for this severity.
    #[must_use]
    pub const fn color(&self) -> u32 {
        match self {
            Self::Info => 0x0034_98db,     // Blue
            Self::Warning => 0x00f3_9c12,  // Orange
            Self::Critical => 0x00e7_4c3c, // Red
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Result of a single remediation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealOutcome {
    Success,
    Failure { cause: String },
}

impl HealOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A remediation that the healer carried out (or tried to).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealEvent {
    /// Display form of the workload key, e.g. `payments/Deployment/api`
    pub workload: String,
    pub namespace: String,
    /// Trigger reason, e.g. `CrashLoop`
    pub reason: String,
    /// Action kind, e.g. `DeletePod`
    pub action: String,
    /// Pods the decision targeted
    #[serde(default)]
    pub pods: Vec<String>,
    pub severity: Severity,
    pub outcome: HealOutcome,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A remediation finished, successfully or not
    Heal(HealEvent),

    /// Repeated failures tripped the circuit breaker for a workload
    CircuitOpened {
        workload: String,
        namespace: String,
        consecutive_failures: u32,
        reopen_at: DateTime<Utc>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::Heal(event) => {
                let status = if event.outcome.is_success() {
                    "Healed"
                } else {
                    "Heal Failed"
                };
                format!("{status}: {} ({})", event.workload, event.reason)
            }
            Self::CircuitOpened { workload, .. } => format!("Circuit Open: {workload}"),
        }
    }

    /// Get the severity/color for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Heal(event) => match event.outcome {
                HealOutcome::Success => Severity::Info,
                HealOutcome::Failure { .. } => event.severity,
            },
            Self::CircuitOpened { .. } => Severity::Critical,
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Heal(event) => event.timestamp,
            Self::CircuitOpened { timestamp, .. } => *timestamp,
        }
    }

    /// Get the workload this event is about.
    #[must_use]
    pub fn workload(&self) -> &str {
        match self {
            Self::Heal(event) => &event.workload,
            Self::CircuitOpened { workload, .. } => workload,
        }
    }

    /// One-paragraph plain-text description, shared by the text-based channels.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::Heal(event) => {
                let pods = if event.pods.is_empty() {
                    "-".to_string()
                } else {
                    event.pods.join(", ")
                };
                match &event.outcome {
                    HealOutcome::Success => format!(
                        "{} on `{}` succeeded (pods: {pods})",
                        event.action, event.workload
                    ),
                    HealOutcome::Failure { cause } => format!(
                        "{} on `{}` failed: {cause} (pods: {pods})",
                        event.action, event.workload
                    ),
                }
            }
            Self::CircuitOpened {
                workload,
                consecutive_failures,
                reopen_at,
                ..
            } => format!(
                "Remediation of `{workload}` failed {consecutive_failures} times in a row; \
                 no further attempts before {}",
                reopen_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        }
    }
}
