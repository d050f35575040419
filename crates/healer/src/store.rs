//! Cooldown / circuit-breaker store.
//!
//! The store is the only gate between a heal decision and a remediation
//! action, and the only place outcomes are recorded. Entries live in a
//! [`DashMap`], so every `try_acquire`/`report` runs under the shard lock of
//! its own key: distinct workloads do not contend on a global lock, and a
//! single workload can never hold two permits at once.
//!
//! Per-key state machine:
//!
//! ```text
//! Closed   --permit, success-------------------> Closed
//! Closed   --failure, failures <  threshold----> Closed (retry after cooldown)
//! Closed   --failure, failures >= threshold----> Open   (reopen_at = now + backoff)
//! Open     --reopen_at elapsed, permit---------> HalfOpen (single trial)
//! HalfOpen --success---------------------------> Closed
//! HalfOpen --failure---------------------------> Open   (backoff doubled, capped)
//! ```
//!
//! State is volatile and resets when the process restarts.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::HealerConfig;
use crate::heuristics::to_delta;
use crate::types::{Outcome, WorkloadKey};

/// Circuit breaker position for one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Why a decision was not allowed to become an action.
///
/// This is flow control, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    CircuitOpen,
    Cooling,
    InFlight,
}

impl DenyReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::Cooling => "cooling",
            Self::InFlight => "in_flight",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remediation history of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CooldownEntry {
    pub last_action: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub circuit: CircuitState,
    pub reopen_at: Option<DateTime<Utc>>,
    /// Backoff applied the next time the circuit opens
    pub backoff: Duration,
    pub in_flight: bool,
    /// Scan cycle in which the workload was last observed
    pub last_seen_cycle: u64,
}

impl CooldownEntry {
    fn new(base_backoff: Duration, cycle: u64) -> Self {
        Self {
            last_action: None,
            consecutive_failures: 0,
            circuit: CircuitState::Closed,
            reopen_at: None,
            backoff: base_backoff,
            in_flight: false,
            last_seen_cycle: cycle,
        }
    }
}

/// Gate parameters, fixed at startup.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    pub cooldown: Duration,
    pub failure_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_idle_cycles: u64,
    pub max_entries: usize,
}

impl StorePolicy {
    #[must_use]
    pub fn from_config(config: &HealerConfig) -> Self {
        Self {
            cooldown: config.cooldown(),
            failure_threshold: config.failure_threshold,
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
            max_idle_cycles: config.max_idle_cycles,
            max_entries: config.max_tracked_workloads,
        }
    }

    fn initial_backoff(&self) -> Duration {
        self.backoff_base.min(self.backoff_cap)
    }
}

/// What a `report` changed, so the caller can log and notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
    pub reopen_at: Option<DateTime<Utc>>,
}

impl Transition {
    /// True when this report tripped the breaker.
    #[must_use]
    pub fn opened(&self) -> bool {
        self.to == CircuitState::Open && self.from != CircuitState::Open
    }
}

struct Inner {
    entries: DashMap<WorkloadKey, CooldownEntry>,
    policy: StorePolicy,
    cycle: AtomicU64,
}

/// Shared, cloneable handle to the store.
#[derive(Clone)]
pub struct CooldownStore {
    inner: Arc<Inner>,
}

/// Exclusive right to remediate one workload.
///
/// Hand it back through [`CooldownStore::report`]. Dropping it unreported
/// (panic, abort) releases the in-flight flag without recording an outcome.
pub struct Permit {
    key: WorkloadKey,
    trial: bool,
    store: Arc<Inner>,
    settled: bool,
}

impl Permit {
    #[must_use]
    pub fn key(&self) -> &WorkloadKey {
        &self.key
    }

    /// True for the single half-open trial after a circuit reopens.
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.trial
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("key", &self.key)
            .field("trial", &self.trial)
            .finish_non_exhaustive()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(mut entry) = self.store.entries.get_mut(&self.key) {
            entry.in_flight = false;
        }
        warn!(workload = %self.key, "Permit dropped without an outcome; released");
    }
}

impl CooldownStore {
    #[must_use]
    pub fn new(policy: StorePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                policy,
                cycle: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &StorePolicy {
        &self.inner.policy
    }

    /// Ask to remediate `key` at `now`.
    ///
    /// On success the key is marked in-flight, and an `Open` circuit whose
    /// deadline has passed moves to `HalfOpen`, all under the key's lock.
    pub fn try_acquire(&self, key: &WorkloadKey, now: DateTime<Utc>) -> Result<Permit, DenyReason> {
        let policy = &self.inner.policy;
        let cycle = self.inner.cycle.load(Ordering::Relaxed);

        let mut entry = self
            .inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| CooldownEntry::new(policy.initial_backoff(), cycle));
        entry.last_seen_cycle = entry.last_seen_cycle.max(cycle);

        if entry.in_flight {
            return Err(DenyReason::InFlight);
        }

        if entry.circuit == CircuitState::Open {
            if let Some(reopen_at) = entry.reopen_at {
                if now < reopen_at {
                    return Err(DenyReason::CircuitOpen);
                }
            }
        }

        if let Some(last) = entry.last_action {
            if now - last < to_delta(policy.cooldown) {
                return Err(DenyReason::Cooling);
            }
        }

        let trial = entry.circuit != CircuitState::Closed;
        if trial {
            entry.circuit = CircuitState::HalfOpen;
            debug!(workload = %key, "Circuit half-open, granting trial permit");
        }
        entry.in_flight = true;

        Ok(Permit {
            key: key.clone(),
            trial,
            store: Arc::clone(&self.inner),
            settled: false,
        })
    }

    /// Record the outcome of the action a permit was granted for.
    pub fn report(&self, mut permit: Permit, outcome: &Outcome, now: DateTime<Utc>) -> Transition {
        let policy = &self.inner.policy;
        let cycle = self.inner.cycle.load(Ordering::Relaxed);

        let transition = {
            let mut entry = self
                .inner
                .entries
                .entry(permit.key.clone())
                .or_insert_with(|| CooldownEntry::new(policy.initial_backoff(), cycle));
            let from = entry.circuit;

            entry.in_flight = false;
            entry.last_action = Some(now);

            match outcome {
                Outcome::Success => {
                    entry.consecutive_failures = 0;
                    entry.circuit = CircuitState::Closed;
                    entry.reopen_at = None;
                    entry.backoff = policy.initial_backoff();
                }
                Outcome::Failure(_) => {
                    entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                    if entry.consecutive_failures >= policy.failure_threshold {
                        let reopen_at = saturating_add(now, entry.backoff);
                        entry.circuit = CircuitState::Open;
                        entry.reopen_at = Some(reopen_at);
                        entry.backoff = entry.backoff.saturating_mul(2).min(policy.backoff_cap);
                    }
                }
            }

            Transition {
                from,
                to: entry.circuit,
                consecutive_failures: entry.consecutive_failures,
                reopen_at: entry.reopen_at,
            }
        };

        permit.settled = true;

        if transition.opened() {
            info!(
                workload = %permit.key,
                failures = transition.consecutive_failures,
                reopen_at = ?transition.reopen_at,
                "Circuit opened"
            );
        }

        transition
    }

    /// Start a new scan cycle and return its number.
    pub fn begin_cycle(&self) -> u64 {
        self.inner.cycle.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current scan cycle number.
    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.inner.cycle.load(Ordering::Relaxed)
    }

    /// Mark tracked workloads as observed in the current cycle.
    ///
    /// Never creates entries; those appear lazily on the first decision.
    pub fn mark_seen<'a>(&self, keys: impl IntoIterator<Item = &'a WorkloadKey>) {
        let cycle = self.current_cycle();
        for key in keys {
            if let Some(mut entry) = self.inner.entries.get_mut(key) {
                entry.last_seen_cycle = cycle;
            }
        }
    }

    /// Evict entries for workloads that have gone away.
    ///
    /// Removes entries unseen for more than `max_idle_cycles`, then trims the
    /// least recently seen ones while the store exceeds `max_entries`.
    /// In-flight entries are never evicted. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let policy = &self.inner.policy;
        let cycle = self.current_cycle();
        let before = self.inner.entries.len();

        self.inner.entries.retain(|_, entry| {
            entry.in_flight || cycle.saturating_sub(entry.last_seen_cycle) <= policy.max_idle_cycles
        });

        let excess = self.inner.entries.len().saturating_sub(policy.max_entries);
        if excess > 0 {
            let mut idle: Vec<(u64, WorkloadKey)> = self
                .inner
                .entries
                .iter()
                .filter(|e| !e.value().in_flight)
                .map(|e| (e.value().last_seen_cycle, e.key().clone()))
                .collect();
            idle.sort();
            for (_, key) in idle.into_iter().take(excess) {
                self.inner.entries.remove_if(&key, |_, entry| !entry.in_flight);
            }
        }

        let removed = before.saturating_sub(self.inner.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.inner.entries.len(), "Evicted stale workload entries");
        }
        removed
    }

    /// Copy of one workload's entry.
    #[must_use]
    pub fn snapshot(&self, key: &WorkloadKey) -> Option<CooldownEntry> {
        self.inner.entries.get(key).map(|e| e.value().clone())
    }

    /// Copy of every entry, ordered by key.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<(WorkloadKey, CooldownEntry)> {
        let mut all: Vec<_> = self
            .inner
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

fn saturating_add(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time until `entry` could next be granted a permit, if it is gated.
#[must_use]
pub fn time_until_eligible(
    entry: &CooldownEntry,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> Option<TimeDelta> {
    let cooling_until = entry.last_action.map(|t| saturating_add(t, cooldown));
    let open_until = match entry.circuit {
        CircuitState::Open => entry.reopen_at,
        _ => None,
    };
    let until = cooling_until.into_iter().chain(open_until).max()?;
    (until > now).then(|| until - now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StorePolicy {
        StorePolicy {
            cooldown: Duration::ZERO,
            failure_threshold: 3,
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(300),
            max_idle_cycles: 2,
            max_entries: 100,
        }
    }

    fn key(name: &str) -> WorkloadKey {
        WorkloadKey::Owned {
            namespace: "shop".to_string(),
            kind: "Deployment".to_string(),
            name: name.to_string(),
        }
    }

    fn fail(store: &CooldownStore, key: &WorkloadKey, now: DateTime<Utc>) -> Transition {
        let permit = store.try_acquire(key, now).expect("permit");
        store.report(permit, &Outcome::Failure("boom".to_string()), now)
    }

    #[test]
    fn test_new_workload_starts_closed() {
        let store = CooldownStore::new(policy());
        let permit = store.try_acquire(&key("api"), Utc::now()).unwrap();
        assert!(!permit.is_trial());

        let entry = store.snapshot(&key("api")).unwrap();
        assert_eq!(entry.circuit, CircuitState::Closed);
        assert_eq!(entry.consecutive_failures, 0);
        assert_eq!(entry.backoff, Duration::from_secs(60));
        assert!(entry.in_flight);
        drop(permit);
    }

    #[test]
    fn test_second_acquire_is_in_flight() {
        let store = CooldownStore::new(policy());
        let now = Utc::now();
        let _permit = store.try_acquire(&key("api"), now).unwrap();
        assert_eq!(
            store.try_acquire(&key("api"), now).unwrap_err(),
            DenyReason::InFlight
        );
        // Other workloads are unaffected
        assert!(store.try_acquire(&key("web"), now).is_ok());
    }

    #[test]
    fn test_cooldown_after_success() {
        let store = CooldownStore::new(StorePolicy {
            cooldown: Duration::from_secs(300),
            ..policy()
        });
        let now = Utc::now();
        let permit = store.try_acquire(&key("api"), now).unwrap();
        store.report(permit, &Outcome::Success, now);

        assert_eq!(
            store
                .try_acquire(&key("api"), now + TimeDelta::seconds(10))
                .unwrap_err(),
            DenyReason::Cooling
        );
        assert!(store
            .try_acquire(&key("api"), now + TimeDelta::seconds(301))
            .is_ok());
    }

    #[test]
    fn test_failures_below_threshold_keep_circuit_closed() {
        let store = CooldownStore::new(policy());
        let now = Utc::now();
        fail(&store, &key("api"), now);
        let transition = fail(&store, &key("api"), now);
        assert_eq!(transition.to, CircuitState::Closed);
        assert_eq!(transition.consecutive_failures, 2);
        assert!(!transition.opened());
    }

    #[test]
    fn test_threshold_opens_circuit() {
        let store = CooldownStore::new(policy());
        let now = Utc::now();
        fail(&store, &key("api"), now);
        fail(&store, &key("api"), now);
        let transition = fail(&store, &key("api"), now);

        assert!(transition.opened());
        assert_eq!(transition.reopen_at, Some(now + TimeDelta::seconds(60)));

        let entry = store.snapshot(&key("api")).unwrap();
        assert_eq!(entry.circuit, CircuitState::Open);
        assert_eq!(entry.backoff, Duration::from_secs(120));
        assert_eq!(
            store
                .try_acquire(&key("api"), now + TimeDelta::seconds(59))
                .unwrap_err(),
            DenyReason::CircuitOpen
        );
    }

    #[test]
    fn test_half_open_grants_exactly_one_trial() {
        let store = CooldownStore::new(policy());
        let now = Utc::now();
        for _ in 0..3 {
            fail(&store, &key("api"), now);
        }

        // Any number of decisions during Open are denied
        for secs in [1, 10, 30, 59] {
            assert_eq!(
                store
                    .try_acquire(&key("api"), now + TimeDelta::seconds(secs))
                    .unwrap_err(),
                DenyReason::CircuitOpen
            );
        }

        let later = now + TimeDelta::seconds(61);
        let trial = store.try_acquire(&key("api"), later).unwrap();
        assert!(trial.is_trial());
        assert_eq!(
            store.snapshot(&key("api")).unwrap().circuit,
            CircuitState::HalfOpen
        );
        assert_eq!(
            store.try_acquire(&key("api"), later).unwrap_err(),
            DenyReason::InFlight
        );

        // Trial failure re-opens with the doubled backoff
        let transition = store.report(trial, &Outcome::Failure("still broken".into()), later);
        assert_eq!(transition.from, CircuitState::HalfOpen);
        assert_eq!(transition.to, CircuitState::Open);
        assert_eq!(transition.reopen_at, Some(later + TimeDelta::seconds(120)));
    }

    #[test]
    fn test_success_resets_failures_and_backoff() {
        let store = CooldownStore::new(policy());
        let now = Utc::now();
        for _ in 0..3 {
            fail(&store, &key("api"), now);
        }
        let later = now + TimeDelta::seconds(61);
        let trial = store.try_acquire(&key("api"), later).unwrap();
        let transition = store.report(trial, &Outcome::Success, later);
        assert_eq!(transition.to, CircuitState::Closed);

        let entry = store.snapshot(&key("api")).unwrap();
        assert_eq!(entry.consecutive_failures, 0);
        assert_eq!(entry.backoff, Duration::from_secs(60));
        assert_eq!(entry.reopen_at, None);
        assert!(!entry.in_flight);
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let store = CooldownStore::new(policy());
        let mut now = Utc::now();
        let mut previous = Duration::ZERO;

        for _ in 0..12 {
            let permit = loop {
                match store.try_acquire(&key("api"), now) {
                    Ok(permit) => break permit,
                    Err(DenyReason::CircuitOpen) => now += TimeDelta::seconds(30),
                    Err(other) => panic!("unexpected denial: {other}"),
                }
            };
            store.report(permit, &Outcome::Failure("boom".into()), now);

            let backoff = store.snapshot(&key("api")).unwrap().backoff;
            assert!(backoff >= previous);
            assert!(backoff <= Duration::from_secs(300));
            previous = backoff;
        }
        assert_eq!(previous, Duration::from_secs(300));
    }

    #[test]
    fn test_cooldown_still_applies_after_reopen_deadline() {
        let store = CooldownStore::new(StorePolicy {
            cooldown: Duration::from_secs(600),
            ..policy()
        });
        let mut now = Utc::now();
        for _ in 0..3 {
            fail(&store, &key("api"), now);
            now += TimeDelta::seconds(601);
        }
        // Circuit opened at the third failure; reopen deadline is 60s away
        // but the cooldown window is longer
        let last_failure = now - TimeDelta::seconds(601);
        assert_eq!(
            store
                .try_acquire(&key("api"), last_failure + TimeDelta::seconds(120))
                .unwrap_err(),
            DenyReason::Cooling
        );
    }

    #[test]
    fn test_dropped_permit_releases_in_flight() {
        let store = CooldownStore::new(policy());
        let now = Utc::now();
        drop(store.try_acquire(&key("api"), now).unwrap());

        let entry = store.snapshot(&key("api")).unwrap();
        assert!(!entry.in_flight);
        assert_eq!(entry.last_action, None);
        assert!(store.try_acquire(&key("api"), now).is_ok());
    }

    #[test]
    fn test_sweep_evicts_idle_entries_but_not_in_flight() {
        let store = CooldownStore::new(policy());
        let now = Utc::now();
        store.begin_cycle();
        fail(&store, &key("gone"), now);
        let _busy = store.try_acquire(&key("busy"), now).unwrap();

        for _ in 0..5 {
            store.begin_cycle();
        }
        assert_eq!(store.sweep(), 1);
        assert!(store.snapshot(&key("gone")).is_none());
        assert!(store.snapshot(&key("busy")).is_some());
    }

    #[test]
    fn test_mark_seen_keeps_entries_alive() {
        let store = CooldownStore::new(policy());
        let now = Utc::now();
        store.begin_cycle();
        fail(&store, &key("api"), now);

        for _ in 0..5 {
            store.begin_cycle();
            store.mark_seen([&key("api"), &key("never-tracked")]);
        }
        assert_eq!(store.sweep(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sweep_enforces_capacity() {
        let store = CooldownStore::new(StorePolicy {
            max_entries: 2,
            max_idle_cycles: 1000,
            ..policy()
        });
        let now = Utc::now();
        for name in ["a", "b", "c"] {
            store.begin_cycle();
            fail(&store, &key(name), now);
        }
        assert_eq!(store.sweep(), 1);
        assert!(store.snapshot(&key("a")).is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_time_until_eligible() {
        let cooldown = Duration::from_secs(100);
        let now = Utc::now();
        let mut entry = CooldownEntry::new(Duration::from_secs(60), 0);
        assert_eq!(time_until_eligible(&entry, cooldown, now), None);

        entry.last_action = Some(now - TimeDelta::seconds(40));
        assert_eq!(
            time_until_eligible(&entry, cooldown, now),
            Some(TimeDelta::seconds(60))
        );

        entry.circuit = CircuitState::Open;
        entry.reopen_at = Some(now + TimeDelta::seconds(500));
        assert_eq!(
            time_until_eligible(&entry, cooldown, now),
            Some(TimeDelta::seconds(500))
        );
    }

    #[test]
    fn test_concurrent_acquire_grants_single_permit() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Barrier;

        const THREADS: usize = 16;
        const ROUNDS: usize = 200;

        let store = CooldownStore::new(policy());
        let now = Utc::now();

        for round in 0..ROUNDS {
            let workload = key(&format!("api-{round}"));
            let granted = AtomicUsize::new(0);
            let start = Barrier::new(THREADS);
            let attempted = Barrier::new(THREADS);

            std::thread::scope(|scope| {
                for _ in 0..THREADS {
                    scope.spawn(|| {
                        start.wait();
                        let permit = store.try_acquire(&workload, now);
                        if permit.is_ok() {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                        // Hold the permit until every thread has tried.
                        attempted.wait();
                        drop(permit);
                    });
                }
            });

            assert_eq!(granted.load(Ordering::SeqCst), 1, "round {round}");
        }
    }

    #[test]
    fn test_huge_backoff_saturates_reopen_time() {
        let store = CooldownStore::new(StorePolicy {
            failure_threshold: 1,
            backoff_base: Duration::from_secs(10_000_000_000_000),
            backoff_cap: Duration::from_secs(10_000_000_000_000),
            ..policy()
        });
        let now = Utc::now();

        let transition = fail(&store, &key("api"), now);
        assert!(transition.opened());
        assert_eq!(transition.reopen_at, Some(DateTime::<Utc>::MAX_UTC));
        assert_eq!(
            store.try_acquire(&key("api"), now).unwrap_err(),
            DenyReason::CircuitOpen
        );

        let entry = store.snapshot(&key("api")).unwrap();
        let remaining = time_until_eligible(&entry, Duration::from_secs(u64::MAX), now);
        assert!(remaining.is_some_and(|d| d > TimeDelta::zero()));
    }
}
