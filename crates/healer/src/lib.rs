//! Healer: a self-healing control loop for Kubernetes workloads.
//!
//! Each scan cycle lists pods, classifies unhealthy ones with a pure
//! [`heuristics::HeuristicEngine`], gates every decision through the
//! [`store::CooldownStore`] (cooldown window plus per-workload circuit
//! breaker) and hands granted actions to the
//! [`executor::RemediationExecutor`]. The [`orchestrator::Healer`] drives the
//! cycle on a fixed interval.

pub mod config;
pub mod error;
pub mod executor;
pub mod heuristics;
pub mod k8s;
pub mod metrics;
pub mod orchestrator;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::HealerConfig;
pub use error::{ActionError, ConfigError, FetchError};
pub use orchestrator::{CycleReport, EventSink, Healer};
pub use store::{CircuitState, CooldownStore, DenyReason};
pub use types::{HealDecision, HealReason, Outcome, PodObservation, WorkloadKey};
