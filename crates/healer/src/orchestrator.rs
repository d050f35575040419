//! Scan orchestrator: the control loop.
//!
//! One cycle fetches observations, evaluates them, groups decisions per
//! workload, gates each through the cooldown store and fans the granted
//! actions out as concurrent tasks. The cycle waits for every task; each
//! action is bounded by the cycle deadline, so a slow API call cannot starve
//! the next tick.
//!
//! A failed fetch skips the cycle before any store state is touched.

use chrono::{DateTime, Utc};
use notify::{HealEvent, Notifier, NotifyEvent};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::{HealerConfig, MAX_DURATION_SECS};
use crate::error::{ConfigError, FetchError};
use crate::executor::{RemediationExecutor, RetryPolicy};
use crate::heuristics::HeuristicEngine;
use crate::k8s::{ClusterSource, Selector};
use crate::metrics::MetricsSink;
use crate::store::{CooldownStore, DenyReason, StorePolicy};
use crate::types::{
    ActionMode, HealDecision, HealReason, Outcome, RemediationAction, WorkloadKey,
};

/// Destination for heal events. Must return immediately.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: NotifyEvent);
}

impl EventSink for Notifier {
    fn emit(&self, event: NotifyEvent) {
        self.notify(event);
    }
}

/// What happened to one decision in a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    /// Logged only
    DryRun,
    /// Refused by the cooldown store
    Denied { denied_by: DenyReason },
    /// Action ran to an outcome
    Executed { action: String, outcome: Outcome },
    /// The action task panicked; the permit was released without an outcome
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionReport {
    pub workload: WorkloadKey,
    pub reason: HealReason,
    pub pods: Vec<String>,
    #[serde(flatten)]
    pub disposition: Disposition,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub pods_observed: usize,
    pub workloads_observed: usize,
    pub decisions: Vec<DecisionReport>,
    pub evicted: usize,
}

impl CycleReport {
    #[must_use]
    pub fn executed(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| matches!(d.disposition, Disposition::Executed { .. }))
            .count()
    }

    #[must_use]
    pub fn denied(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| matches!(d.disposition, Disposition::Denied { .. }))
            .count()
    }
}

#[derive(Debug, Clone)]
struct LoopSettings {
    interval: Duration,
    deadline: Duration,
    action: ActionMode,
    grace_period: Duration,
    dry_run: bool,
}

pub struct Healer {
    cluster: Arc<dyn ClusterSource>,
    engine: HeuristicEngine,
    store: CooldownStore,
    executor: Arc<RemediationExecutor>,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    selector: Selector,
    settings: LoopSettings,
    ready: Arc<AtomicBool>,
}

impl Healer {
    /// Wire the engine, store and executor from configuration.
    pub fn new(
        config: &HealerConfig,
        cluster: Arc<dyn ClusterSource>,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            engine: HeuristicEngine::from_config(config)?,
            store: CooldownStore::new(StorePolicy::from_config(config)),
            executor: Arc::new(RemediationExecutor::new(
                Arc::clone(&cluster),
                RetryPolicy::from_config(config),
            )),
            cluster,
            events,
            metrics,
            selector: Selector {
                namespaces: config.namespaces.clone(),
                label_selector: config.label_selector.clone(),
            },
            settings: LoopSettings {
                interval: config.scan_interval(),
                deadline: config.cycle_deadline(),
                action: config.action,
                grace_period: config.grace_period(),
                dry_run: config.dry_run,
            },
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub fn store(&self) -> &CooldownStore {
        &self.store
    }

    /// Flag set once a scan has completed successfully.
    #[must_use]
    pub fn readiness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// One `list_pods` call to prove the cluster is reachable.
    pub async fn probe(&self) -> Result<usize, FetchError> {
        let deadline = self.deadline();
        match timeout_at(deadline, self.cluster.list_pods(&self.selector)).await {
            Ok(result) => result.map(|pods| pods.len()),
            Err(_) => Err(FetchError::Timeout),
        }
    }

    /// Run scan cycles on the configured interval until `shutdown` fires.
    ///
    /// A cycle that has started always runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.settings.interval.as_secs(),
            action = ?self.settings.action,
            dry_run = self.settings.dry_run,
            "Control loop started"
        );

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, control loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_cycle_at(Utc::now()).await {
                        Ok(report) => info!(
                            cycle = report.cycle,
                            pods = report.pods_observed,
                            decisions = report.decisions.len(),
                            executed = report.executed(),
                            denied = report.denied(),
                            "Scan cycle complete"
                        ),
                        Err(e) => warn!(error = %e, "Scan failed, skipping cycle"),
                    }
                }
            }
        }
    }

    fn deadline(&self) -> Instant {
        let start = Instant::now();
        start
            .checked_add(self.settings.deadline)
            .unwrap_or_else(|| start + Duration::from_secs(MAX_DURATION_SECS))
    }

    /// Run a single cycle with `now` as the clock reading.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport, FetchError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("scan", %cycle_id, cycle = tracing::field::Empty);
        self.cycle(cycle_id, now).instrument(span).await
    }

    async fn cycle(&self, cycle_id: Uuid, now: DateTime<Utc>) -> Result<CycleReport, FetchError> {
        let deadline = self.deadline();

        let observations = match timeout_at(deadline, self.cluster.list_pods(&self.selector)).await
        {
            Ok(Ok(observations)) => observations,
            Ok(Err(e)) => {
                self.metrics.record_scan_failure();
                return Err(e);
            }
            Err(_) => {
                self.metrics.record_scan_failure();
                return Err(FetchError::Timeout);
            }
        };

        let cycle = self.store.begin_cycle();
        Span::current().record("cycle", cycle);

        let observed: BTreeSet<WorkloadKey> =
            observations.iter().map(|p| p.workload_key()).collect();
        self.store.mark_seen(&observed);

        let decisions = group_decisions(
            observations
                .iter()
                .filter_map(|pod| self.engine.evaluate(pod, now)),
        );
        debug!(
            pods = observations.len(),
            decisions = decisions.len(),
            "Evaluated observations"
        );

        let mut reports = Vec::with_capacity(decisions.len());
        let mut tasks = JoinSet::new();
        let mut pending: BTreeMap<WorkloadKey, (HealReason, Vec<String>)> = BTreeMap::new();

        for decision in decisions.into_values() {
            if self.settings.dry_run {
                info!(
                    workload = %decision.key,
                    reason = %decision.reason,
                    pods = ?decision.pods,
                    "Dry run: would remediate"
                );
                self.metrics.record_dry_run(decision.reason);
                reports.push(DecisionReport {
                    workload: decision.key,
                    reason: decision.reason,
                    pods: decision.pods,
                    disposition: Disposition::DryRun,
                });
                continue;
            }

            let permit = match self.store.try_acquire(&decision.key, now) {
                Ok(permit) => permit,
                Err(reason) => {
                    debug!(workload = %decision.key, %reason, "Decision denied");
                    self.metrics.record_denied(reason);
                    reports.push(DecisionReport {
                        workload: decision.key,
                        reason: decision.reason,
                        pods: decision.pods,
                        disposition: Disposition::Denied { denied_by: reason },
                    });
                    continue;
                }
            };

            let action = RemediationAction::for_decision(
                &decision,
                self.settings.action,
                self.settings.grace_period,
                now,
            );
            let executor = Arc::clone(&self.executor);
            let store = self.store.clone();
            let events = Arc::clone(&self.events);
            let metrics = Arc::clone(&self.metrics);

            pending.insert(
                decision.key.clone(),
                (decision.reason, decision.pods.clone()),
            );
            tasks.spawn(
                async move {
                    let trial = permit.is_trial();
                    info!(
                        workload = %decision.key,
                        reason = %decision.reason,
                        action = action.kind.as_str(),
                        trial,
                        "Remediating"
                    );
                    metrics.record_heal_attempt(decision.reason);

                    let outcome = match timeout_at(deadline, executor.execute(&action)).await {
                        Ok(outcome) => outcome,
                        Err(_) => Outcome::Failure("cycle deadline exceeded".to_string()),
                    };

                    let transition = store.report(permit, &outcome, now);
                    metrics.record_heal_outcome(decision.reason, &outcome);
                    metrics.set_last_action(now);

                    match &outcome {
                        Outcome::Success => info!(workload = %decision.key, "Remediation succeeded"),
                        Outcome::Failure(cause) => warn!(
                            workload = %decision.key,
                            cause = %cause,
                            failures = transition.consecutive_failures,
                            "Remediation failed"
                        ),
                    }

                    events.emit(NotifyEvent::Heal(HealEvent {
                        workload: decision.key.to_string(),
                        namespace: decision.key.namespace().to_string(),
                        reason: decision.reason.to_string(),
                        action: action.kind.as_str().to_string(),
                        pods: decision.pods.clone(),
                        severity: decision.severity,
                        outcome: (&outcome).into(),
                        timestamp: now,
                    }));

                    if transition.opened() {
                        metrics.record_circuit_opened();
                        if let Some(reopen_at) = transition.reopen_at {
                            events.emit(NotifyEvent::CircuitOpened {
                                workload: decision.key.to_string(),
                                namespace: decision.key.namespace().to_string(),
                                consecutive_failures: transition.consecutive_failures,
                                reopen_at,
                                timestamp: now,
                            });
                        }
                    }

                    DecisionReport {
                        workload: decision.key,
                        reason: decision.reason,
                        pods: decision.pods,
                        disposition: Disposition::Executed {
                            action: action.kind.as_str().to_string(),
                            outcome,
                        },
                    }
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    pending.remove(&report.workload);
                    reports.push(report);
                }
                Err(e) => error!(error = %e, "Remediation task failed"),
            }
        }

        // Tasks that never produced a report panicked; their permits were
        // released on drop without an outcome.
        for (workload, (reason, pods)) in pending {
            warn!(workload = %workload, "Remediation aborted without an outcome");
            reports.push(DecisionReport {
                workload,
                reason,
                pods,
                disposition: Disposition::Aborted,
            });
        }

        reports.sort_by(|a, b| a.workload.cmp(&b.workload));

        let evicted = self.store.sweep();
        self.metrics.set_tracked_workloads(self.store.len());
        self.metrics.record_scan();
        self.ready.store(true, Ordering::Relaxed);

        Ok(CycleReport {
            cycle,
            cycle_id,
            started_at: now,
            pods_observed: observations.len(),
            workloads_observed: observed.len(),
            decisions: reports,
            evicted,
        })
    }
}

/// Collapse per-pod decisions into one decision per workload.
fn group_decisions(
    decisions: impl Iterator<Item = HealDecision>,
) -> BTreeMap<WorkloadKey, HealDecision> {
    let mut grouped: BTreeMap<WorkloadKey, HealDecision> = BTreeMap::new();
    for decision in decisions {
        match grouped.get_mut(&decision.key) {
            Some(existing) => existing.merge(decision),
            None => {
                grouped.insert(decision.key.clone(), decision);
            }
        }
    }
    grouped
}
