//! Metrics sink.
//!
//! [`HealerMetrics`] keeps plain atomic counters, which back the `/metrics`
//! endpoint and the scan report, and mirrors every update into
//! OpenTelemetry instruments taken from the global meter. When no meter
//! provider is installed the OTel side is a no-op.

use chrono::{DateTime, Utc};
use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::{global, KeyValue};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::store::DenyReason;
use crate::types::{HealReason, Outcome};

/// Receiver for control-loop measurements. Safe to call from many tasks.
pub trait MetricsSink: Send + Sync {
    fn record_scan(&self);
    fn record_scan_failure(&self);
    fn record_heal_attempt(&self, reason: HealReason);
    fn record_heal_outcome(&self, reason: HealReason, outcome: &Outcome);
    fn record_denied(&self, reason: DenyReason);
    fn record_dry_run(&self, reason: HealReason);
    fn record_circuit_opened(&self);
    fn set_last_action(&self, at: DateTime<Utc>);
    fn set_tracked_workloads(&self, count: usize);
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub scans_total: u64,
    pub scan_failures_total: u64,
    pub heal_attempts_total: u64,
    pub heal_success_total: u64,
    pub heal_failure_total: u64,
    pub denied_circuit_open_total: u64,
    pub denied_cooling_total: u64,
    pub denied_in_flight_total: u64,
    pub dry_run_decisions_total: u64,
    pub circuit_opened_total: u64,
    /// Unix seconds of the most recent action, 0 if none yet
    pub last_action_timestamp: i64,
    pub tracked_workloads: u64,
}

struct Instruments {
    scans: Counter<u64>,
    scan_failures: Counter<u64>,
    heal_attempts: Counter<u64>,
    heal_outcomes: Counter<u64>,
    denied: Counter<u64>,
    dry_run: Counter<u64>,
    circuit_opened: Counter<u64>,
    last_action: Gauge<i64>,
    tracked: Gauge<u64>,
}

impl Instruments {
    fn new() -> Self {
        let meter = global::meter("healer");
        Self {
            scans: meter
                .u64_counter("healer_scans_total")
                .with_description("Completed scan cycles")
                .build(),
            scan_failures: meter
                .u64_counter("healer_scan_failures_total")
                .with_description("Scan cycles skipped because the fetch failed")
                .build(),
            heal_attempts: meter
                .u64_counter("healer_heal_attempts_total")
                .with_description("Remediation actions started")
                .build(),
            heal_outcomes: meter
                .u64_counter("healer_heal_outcomes_total")
                .with_description("Remediation actions finished, by result")
                .build(),
            denied: meter
                .u64_counter("healer_gate_denied_total")
                .with_description("Decisions denied by the cooldown store")
                .build(),
            dry_run: meter
                .u64_counter("healer_dry_run_decisions_total")
                .with_description("Decisions logged without acting")
                .build(),
            circuit_opened: meter
                .u64_counter("healer_circuit_opened_total")
                .with_description("Circuit breaker trips")
                .build(),
            last_action: meter
                .i64_gauge("healer_last_action_timestamp_seconds")
                .with_description("Unix time of the most recent remediation")
                .build(),
            tracked: meter
                .u64_gauge("healer_tracked_workloads")
                .with_description("Workloads held in the cooldown store")
                .build(),
        }
    }
}

pub struct HealerMetrics {
    scans: AtomicU64,
    scan_failures: AtomicU64,
    heal_attempts: AtomicU64,
    heal_success: AtomicU64,
    heal_failure: AtomicU64,
    denied_circuit_open: AtomicU64,
    denied_cooling: AtomicU64,
    denied_in_flight: AtomicU64,
    dry_run: AtomicU64,
    circuit_opened: AtomicU64,
    last_action: AtomicI64,
    tracked: AtomicU64,
    otel: Instruments,
}

impl Default for HealerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HealerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scans: AtomicU64::new(0),
            scan_failures: AtomicU64::new(0),
            heal_attempts: AtomicU64::new(0),
            heal_success: AtomicU64::new(0),
            heal_failure: AtomicU64::new(0),
            denied_circuit_open: AtomicU64::new(0),
            denied_cooling: AtomicU64::new(0),
            denied_in_flight: AtomicU64::new(0),
            dry_run: AtomicU64::new(0),
            circuit_opened: AtomicU64::new(0),
            last_action: AtomicI64::new(0),
            tracked: AtomicU64::new(0),
            otel: Instruments::new(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            scans_total: load(&self.scans),
            scan_failures_total: load(&self.scan_failures),
            heal_attempts_total: load(&self.heal_attempts),
            heal_success_total: load(&self.heal_success),
            heal_failure_total: load(&self.heal_failure),
            denied_circuit_open_total: load(&self.denied_circuit_open),
            denied_cooling_total: load(&self.denied_cooling),
            denied_in_flight_total: load(&self.denied_in_flight),
            dry_run_decisions_total: load(&self.dry_run),
            circuit_opened_total: load(&self.circuit_opened),
            last_action_timestamp: self.last_action.load(Ordering::Relaxed),
            tracked_workloads: load(&self.tracked),
        }
    }

    /// Render the counters in the Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let mut family = |name: &str, kind: &str, help: &str, samples: &[(&str, String)]| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            for (labels, value) in samples {
                if labels.is_empty() {
                    let _ = writeln!(out, "{name} {value}");
                } else {
                    let _ = writeln!(out, "{name}{{{labels}}} {value}");
                }
            }
        };

        family(
            "healer_scans_total",
            "counter",
            "Completed scan cycles",
            &[("", s.scans_total.to_string())],
        );
        family(
            "healer_scan_failures_total",
            "counter",
            "Scan cycles skipped because the fetch failed",
            &[("", s.scan_failures_total.to_string())],
        );
        family(
            "healer_heal_attempts_total",
            "counter",
            "Remediation actions started",
            &[("", s.heal_attempts_total.to_string())],
        );
        family(
            "healer_heal_outcomes_total",
            "counter",
            "Remediation actions finished, by result",
            &[
                ("result=\"success\"", s.heal_success_total.to_string()),
                ("result=\"failure\"", s.heal_failure_total.to_string()),
            ],
        );
        family(
            "healer_gate_denied_total",
            "counter",
            "Decisions denied by the cooldown store",
            &[
                ("reason=\"circuit_open\"", s.denied_circuit_open_total.to_string()),
                ("reason=\"cooling\"", s.denied_cooling_total.to_string()),
                ("reason=\"in_flight\"", s.denied_in_flight_total.to_string()),
            ],
        );
        family(
            "healer_dry_run_decisions_total",
            "counter",
            "Decisions logged without acting",
            &[("", s.dry_run_decisions_total.to_string())],
        );
        family(
            "healer_circuit_opened_total",
            "counter",
            "Circuit breaker trips",
            &[("", s.circuit_opened_total.to_string())],
        );
        family(
            "healer_last_action_timestamp_seconds",
            "gauge",
            "Unix time of the most recent remediation",
            &[("", s.last_action_timestamp.to_string())],
        );
        family(
            "healer_tracked_workloads",
            "gauge",
            "Workloads held in the cooldown store",
            &[("", s.tracked_workloads.to_string())],
        );

        out
    }
}

impl MetricsSink for HealerMetrics {
    fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.otel.scans.add(1, &[]);
    }

    fn record_scan_failure(&self) {
        self.scan_failures.fetch_add(1, Ordering::Relaxed);
        self.otel.scan_failures.add(1, &[]);
    }

    fn record_heal_attempt(&self, reason: HealReason) {
        self.heal_attempts.fetch_add(1, Ordering::Relaxed);
        self.otel
            .heal_attempts
            .add(1, &[KeyValue::new("reason", reason.as_str())]);
    }

    fn record_heal_outcome(&self, reason: HealReason, outcome: &Outcome) {
        let result = if outcome.is_success() {
            self.heal_success.fetch_add(1, Ordering::Relaxed);
            "success"
        } else {
            self.heal_failure.fetch_add(1, Ordering::Relaxed);
            "failure"
        };
        self.otel.heal_outcomes.add(
            1,
            &[
                KeyValue::new("reason", reason.as_str()),
                KeyValue::new("result", result),
            ],
        );
    }

    fn record_denied(&self, reason: DenyReason) {
        let counter = match reason {
            DenyReason::CircuitOpen => &self.denied_circuit_open,
            DenyReason::Cooling => &self.denied_cooling,
            DenyReason::InFlight => &self.denied_in_flight,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.otel
            .denied
            .add(1, &[KeyValue::new("reason", reason.as_str())]);
    }

    fn record_dry_run(&self, reason: HealReason) {
        self.dry_run.fetch_add(1, Ordering::Relaxed);
        self.otel
            .dry_run
            .add(1, &[KeyValue::new("reason", reason.as_str())]);
    }

    fn record_circuit_opened(&self) {
        self.circuit_opened.fetch_add(1, Ordering::Relaxed);
        self.otel.circuit_opened.add(1, &[]);
    }

    fn set_last_action(&self, at: DateTime<Utc>) {
        let secs = at.timestamp();
        self.last_action.fetch_max(secs, Ordering::Relaxed);
        self.otel.last_action.record(secs, &[]);
    }

    fn set_tracked_workloads(&self, count: usize) {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        self.tracked.store(count, Ordering::Relaxed);
        self.otel.tracked.record(count, &[]);
    }
}
