//! End-to-end control loop scenarios against an in-memory cluster.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use healer::error::{ActionError, FetchError};
use healer::k8s::{ClusterSource, DeleteOutcome, Selector};
use healer::metrics::HealerMetrics;
use healer::orchestrator::{Disposition, EventSink, Healer};
use healer::types::{ActionMode, ContainerObservation, OwnerRef, ReadyCondition};
use healer::{CircuitState, DenyReason, HealReason, HealerConfig, Outcome, PodObservation};
use notify::NotifyEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeCluster {
    pods: Mutex<Vec<PodObservation>>,
    list_fails: AtomicBool,
    delete_error: Mutex<Option<ActionError>>,
    delete_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl FakeCluster {
    fn with_pods(pods: Vec<PodObservation>) -> Arc<Self> {
        let cluster = Self::default();
        *cluster.pods.lock().unwrap() = pods;
        Arc::new(cluster)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterSource for FakeCluster {
    async fn list_pods(&self, _: &Selector) -> Result<Vec<PodObservation>, FetchError> {
        if self.list_fails.load(Ordering::SeqCst) {
            return Err(FetchError::Other("apiserver unavailable".to_string()));
        }
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        _: Duration,
    ) -> Result<DeleteOutcome, ActionError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("delete {namespace}/{name}"));
        let delay = *self.delete_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.delete_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(DeleteOutcome::Deleted),
        }
    }

    async fn patch_rollout_annotation(
        &self,
        namespace: &str,
        owner: &OwnerRef,
        _: &str,
    ) -> Result<(), ActionError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("patch {namespace}/{}/{}", owner.kind, owner.name));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingEvents {
    events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingEvents {
    fn titles(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(NotifyEvent::title)
            .collect()
    }
}

impl EventSink for RecordingEvents {
    fn emit(&self, event: NotifyEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn restarting_pod(name: &str, restarts: u32) -> PodObservation {
    PodObservation {
        namespace: "shop".to_string(),
        name: name.to_string(),
        owner: Some(OwnerRef {
            kind: "Deployment".to_string(),
            name: "api".to_string(),
        }),
        containers: vec![ContainerObservation {
            name: "app".to_string(),
            restart_count: restarts,
            ..ContainerObservation::default()
        }],
        phase: "Running".to_string(),
        ready: Some(ReadyCondition {
            ready: true,
            last_transition: None,
        }),
        ..PodObservation::default()
    }
}

fn config() -> HealerConfig {
    HealerConfig {
        restart_threshold: 5,
        retry_delay_ms: 1,
        ..HealerConfig::default()
    }
}

struct Harness {
    healer: Healer,
    cluster: Arc<FakeCluster>,
    events: Arc<RecordingEvents>,
    metrics: Arc<HealerMetrics>,
}

fn harness(config: &HealerConfig, pods: Vec<PodObservation>) -> Harness {
    let cluster = FakeCluster::with_pods(pods);
    let events = Arc::new(RecordingEvents::default());
    let metrics = Arc::new(HealerMetrics::new());
    let healer = Healer::new(config, cluster.clone(), events.clone(), metrics.clone()).unwrap();
    Harness {
        healer,
        cluster,
        events,
        metrics,
    }
}

fn t0() -> DateTime<Utc> {
    Utc::now()
}

#[tokio::test]
async fn test_restart_threshold_heals_then_cools_down() {
    let h = harness(&config(), vec![restarting_pod("api-7b9f8c6d5-abc12", 6)]);
    let now = t0();

    let first = h.healer.run_cycle_at(now).await.unwrap();
    assert_eq!(first.decisions.len(), 1);
    assert_eq!(first.decisions[0].reason, HealReason::RestartThreshold);
    assert_eq!(
        first.decisions[0].disposition,
        Disposition::Executed {
            action: "DeletePod".to_string(),
            outcome: Outcome::Success
        }
    );
    assert_eq!(h.cluster.calls(), vec!["delete shop/api-7b9f8c6d5-abc12"]);
    assert_eq!(h.events.titles(), vec!["Healed: shop/Deployment/api (RestartThreshold)"]);

    // The replacement pod inherits the high restart count in this fake
    let second = h
        .healer
        .run_cycle_at(now + TimeDelta::seconds(30))
        .await
        .unwrap();
    assert_eq!(
        second.decisions[0].disposition,
        Disposition::Denied {
            denied_by: DenyReason::Cooling
        }
    );
    assert_eq!(h.cluster.calls().len(), 1);
    assert_eq!(h.events.titles().len(), 1);

    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.scans_total, 2);
    assert_eq!(metrics.heal_success_total, 1);
    assert_eq!(metrics.denied_cooling_total, 1);
    assert_eq!(metrics.last_action_timestamp, now.timestamp());
}

#[tokio::test]
async fn test_repeated_failures_open_circuit_then_single_trial() {
    let config = HealerConfig {
        cooldown_secs: 0,
        failure_threshold: 3,
        backoff_base_secs: 60,
        ..config()
    };
    let h = harness(&config, vec![restarting_pod("api-7b9f8c6d5-abc12", 9)]);
    *h.cluster.delete_error.lock().unwrap() =
        Some(ActionError::Permanent("pods is forbidden".to_string()));
    let now = t0();

    for secs in 0..3 {
        let report = h
            .healer
            .run_cycle_at(now + TimeDelta::seconds(secs))
            .await
            .unwrap();
        assert_eq!(report.executed(), 1);
    }
    let opened_at = now + TimeDelta::seconds(2);

    let key = restarting_pod("x", 0).workload_key();
    let entry = h.healer.store().snapshot(&key).unwrap();
    assert_eq!(entry.circuit, CircuitState::Open);
    assert_eq!(entry.consecutive_failures, 3);
    assert_eq!(entry.reopen_at, Some(opened_at + TimeDelta::seconds(60)));
    assert!(h
        .events
        .titles()
        .contains(&"Circuit Open: shop/Deployment/api".to_string()));

    // Any number of decisions while open are denied
    for secs in [5, 20, 40, 59] {
        let report = h
            .healer
            .run_cycle_at(opened_at + TimeDelta::seconds(secs))
            .await
            .unwrap();
        assert_eq!(
            report.decisions[0].disposition,
            Disposition::Denied {
                denied_by: DenyReason::CircuitOpen
            }
        );
    }
    assert_eq!(h.cluster.calls().len(), 3);

    // Past the deadline exactly one trial runs; its failure re-opens the circuit
    let trial = h
        .healer
        .run_cycle_at(opened_at + TimeDelta::seconds(60))
        .await
        .unwrap();
    assert_eq!(trial.executed(), 1);
    assert_eq!(h.cluster.calls().len(), 4);

    let after = h
        .healer
        .run_cycle_at(opened_at + TimeDelta::seconds(61))
        .await
        .unwrap();
    assert_eq!(after.executed(), 0);
    assert_eq!(after.denied(), 1);

    let entry = h.healer.store().snapshot(&key).unwrap();
    assert_eq!(entry.circuit, CircuitState::Open);
    assert_eq!(entry.backoff, Duration::from_secs(240));
    assert_eq!(h.metrics.snapshot().circuit_opened_total, 2);
}

#[tokio::test]
async fn test_trial_success_closes_circuit() {
    let config = HealerConfig {
        cooldown_secs: 0,
        failure_threshold: 1,
        ..config()
    };
    let h = harness(&config, vec![restarting_pod("api-1", 9)]);
    *h.cluster.delete_error.lock().unwrap() = Some(ActionError::Permanent("denied".into()));
    let now = t0();
    h.healer.run_cycle_at(now).await.unwrap();

    *h.cluster.delete_error.lock().unwrap() = None;
    let report = h
        .healer
        .run_cycle_at(now + TimeDelta::seconds(61))
        .await
        .unwrap();
    assert_eq!(report.executed(), 1);

    let entry = h
        .healer
        .store()
        .snapshot(&restarting_pod("api-1", 0).workload_key())
        .unwrap();
    assert_eq!(entry.circuit, CircuitState::Closed);
    assert_eq!(entry.consecutive_failures, 0);
    assert_eq!(entry.backoff, Duration::from_secs(60));
}

#[tokio::test]
async fn test_fetch_failure_leaves_store_untouched() {
    let h = harness(&config(), vec![restarting_pod("api-1", 6)]);
    let now = t0();
    h.healer.run_cycle_at(now).await.unwrap();

    let before = h.healer.store().snapshot_all();
    let cycle_before = h.healer.store().current_cycle();

    h.cluster.list_fails.store(true, Ordering::SeqCst);
    let result = h.healer.run_cycle_at(now + TimeDelta::seconds(10)).await;
    assert!(matches!(result, Err(FetchError::Other(_))));
    assert_eq!(h.healer.store().snapshot_all(), before);
    assert_eq!(h.healer.store().current_cycle(), cycle_before);
    assert_eq!(h.metrics.snapshot().scan_failures_total, 1);

    // The next cycle sees the same state and is still cooling
    h.cluster.list_fails.store(false, Ordering::SeqCst);
    let report = h
        .healer
        .run_cycle_at(now + TimeDelta::seconds(20))
        .await
        .unwrap();
    assert_eq!(report.denied(), 1);
}

#[tokio::test]
async fn test_pods_of_one_workload_share_one_action() {
    let mut crashing = restarting_pod("api-2", 1);
    crashing.containers[0].waiting_reason = Some("CrashLoopBackOff".to_string());
    let h = harness(&config(), vec![restarting_pod("api-1", 7), crashing]);

    let report = h.healer.run_cycle_at(t0()).await.unwrap();
    assert_eq!(report.decisions.len(), 1);
    assert_eq!(report.decisions[0].reason, HealReason::CrashLoop);
    assert_eq!(
        h.cluster.calls(),
        vec!["delete shop/api-1", "delete shop/api-2"]
    );
}

#[tokio::test]
async fn test_distinct_workloads_are_gated_independently() {
    let mut other = restarting_pod("web-1", 8);
    other.owner = Some(OwnerRef {
        kind: "StatefulSet".to_string(),
        name: "web".to_string(),
    });
    let h = harness(&config(), vec![restarting_pod("api-1", 8), other]);

    let report = h.healer.run_cycle_at(t0()).await.unwrap();
    assert_eq!(report.executed(), 2);
    assert_eq!(h.healer.store().len(), 2);
}

#[tokio::test]
async fn test_rollout_mode_patches_owner() {
    let config = HealerConfig {
        action: ActionMode::Rollout,
        ..config()
    };
    let h = harness(&config, vec![restarting_pod("api-1", 6)]);

    let report = h.healer.run_cycle_at(t0()).await.unwrap();
    assert_eq!(report.executed(), 1);
    assert_eq!(h.cluster.calls(), vec!["patch shop/Deployment/api"]);
}

#[tokio::test]
async fn test_dry_run_never_acts() {
    let config = HealerConfig {
        dry_run: true,
        ..config()
    };
    let h = harness(&config, vec![restarting_pod("api-1", 6)]);

    let report = h.healer.run_cycle_at(t0()).await.unwrap();
    assert_eq!(report.decisions[0].disposition, Disposition::DryRun);
    assert!(h.cluster.calls().is_empty());
    assert!(h.events.titles().is_empty());
    assert!(h.healer.store().is_empty());
    assert_eq!(h.metrics.snapshot().dry_run_decisions_total, 1);
}

#[tokio::test]
async fn test_slow_action_is_bounded_by_cycle_deadline() {
    let config = HealerConfig {
        cycle_deadline_secs: 1,
        ..config()
    };
    let h = harness(&config, vec![restarting_pod("api-1", 6)]);
    *h.cluster.delete_delay.lock().unwrap() = Some(Duration::from_secs(30));

    let report = h.healer.run_cycle_at(t0()).await.unwrap();
    assert!(matches!(
        &report.decisions[0].disposition,
        Disposition::Executed { outcome: Outcome::Failure(cause), .. } if cause.contains("deadline")
    ));

    let entry = h
        .healer
        .store()
        .snapshot(&restarting_pod("api-1", 0).workload_key())
        .unwrap();
    assert!(!entry.in_flight);
    assert_eq!(entry.consecutive_failures, 1);
}

#[tokio::test]
async fn test_healthy_cluster_yields_no_decisions() {
    let h = harness(&config(), vec![restarting_pod("api-1", 0)]);
    let report = h.healer.run_cycle_at(t0()).await.unwrap();
    assert!(report.decisions.is_empty());
    assert_eq!(report.pods_observed, 1);
    assert_eq!(report.workloads_observed, 1);
    assert!(h.healer.store().is_empty());
    assert!(h.healer.readiness().load(Ordering::Relaxed));
}

#[test]
fn test_unbounded_cycle_deadline_is_rejected_before_the_loop() {
    let config = HealerConfig {
        cycle_deadline_secs: u64::MAX,
        ..config()
    };
    let result = Healer::new(
        &config,
        FakeCluster::with_pods(vec![]),
        Arc::new(RecordingEvents::default()),
        Arc::new(HealerMetrics::new()),
    );
    assert!(matches!(result, Err(healer::ConfigError::Invalid(_))));
}
