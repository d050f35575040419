//! Cluster access: pod listing and the two mutating calls the healer makes.
//!
//! Everything above this module works on [`PodObservation`] and never sees a
//! raw Kubernetes object, so the control loop can be driven by a fake
//! [`ClusterSource`] in tests.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::RESTARTED_AT_ANNOTATION;
use crate::error::{ActionError, FetchError};
use crate::types::{ContainerObservation, OwnerRef, PodObservation, ReadyCondition};

/// Which pods a scan covers.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    /// Empty means every namespace
    pub namespaces: Vec<String>,
    pub label_selector: Option<String>,
}

/// Result of a pod deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The pod was already gone
    NotFound,
}

/// Read and write access to the cluster.
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// List pods matching the selector.
    async fn list_pods(&self, selector: &Selector) -> Result<Vec<PodObservation>, FetchError>;

    /// Delete one pod with the given grace period.
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period: Duration,
    ) -> Result<DeleteOutcome, ActionError>;

    /// Set the restart annotation on a controller's pod template.
    async fn patch_rollout_annotation(
        &self,
        namespace: &str,
        owner: &OwnerRef,
        value: &str,
    ) -> Result<(), ActionError>;
}

/// [`ClusterSource`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterSource {
    client: Client,
}

impl KubeClusterSource {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, kube::Error> {
        Ok(Self::new(Client::try_default().await?))
    }

    async fn patch_template<K>(&self, namespace: &str, name: &str, value: &str) -> Result<(), ActionError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let mut annotations = serde_json::Map::new();
        annotations.insert(RESTARTED_AT_ANNOTATION.to_string(), json!(value));
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": annotations } } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterSource for KubeClusterSource {
    async fn list_pods(&self, selector: &Selector) -> Result<Vec<PodObservation>, FetchError> {
        let mut params = ListParams::default();
        if let Some(labels) = &selector.label_selector {
            params = params.labels(labels);
        }

        let apis: Vec<Api<Pod>> = if selector.namespaces.is_empty() {
            vec![Api::all(self.client.clone())]
        } else {
            selector
                .namespaces
                .iter()
                .map(|ns| Api::namespaced(self.client.clone(), ns))
                .collect()
        };

        let mut observations = Vec::new();
        for api in apis {
            let pods = api.list(&params).await?;
            observations.extend(pods.items.iter().filter_map(observation_from_pod));
        }

        debug!(count = observations.len(), "Listed pods");
        Ok(observations)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period: Duration,
    ) -> Result<DeleteOutcome, ActionError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(u32::try_from(grace_period.as_secs()).unwrap_or(u32::MAX)),
            ..Default::default()
        };

        match api.delete(name, &params).await {
            Ok(_) => {
                info!(namespace, pod = name, "Deleted pod");
                Ok(DeleteOutcome::Deleted)
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(namespace, pod = name, "Pod already gone");
                Ok(DeleteOutcome::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_rollout_annotation(
        &self,
        namespace: &str,
        owner: &OwnerRef,
        value: &str,
    ) -> Result<(), ActionError> {
        match owner.kind.as_str() {
            "Deployment" => self.patch_template::<Deployment>(namespace, &owner.name, value).await?,
            "StatefulSet" => self.patch_template::<StatefulSet>(namespace, &owner.name, value).await?,
            "DaemonSet" => self.patch_template::<DaemonSet>(namespace, &owner.name, value).await?,
            other => {
                return Err(ActionError::Permanent(format!(
                    "cannot roll out owner kind {other}"
                )))
            }
        }
        info!(namespace, kind = %owner.kind, name = %owner.name, "Patched rollout annotation");
        Ok(())
    }
}

/// Convert an API pod into an observation.
///
/// Returns `None` for pods without a name or namespace.
#[must_use]
pub fn observation_from_pod(pod: &Pod) -> Option<PodObservation> {
    let meta = &pod.metadata;
    let name = meta.name.clone()?;
    let namespace = meta.namespace.clone()?;
    let labels: BTreeMap<String, String> = meta.labels.clone().unwrap_or_default();

    let owner = meta
        .owner_references
        .as_deref()
        .and_then(controller_of)
        .map(|owner| resolve_owner(owner, &labels));

    let status = pod.status.as_ref();
    let containers = status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default()
        .iter()
        .map(container_observation)
        .collect();

    let ready = status
        .and_then(|s| s.conditions.as_deref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .map(|c| ReadyCondition {
            ready: c.status == "True",
            last_transition: c.last_transition_time.as_ref().map(|t| t.0),
        });

    Some(PodObservation {
        namespace,
        name,
        owner,
        labels,
        containers,
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        ready,
        started_at: status
            .and_then(|s| s.start_time.as_ref())
            .map(|t| t.0),
    })
}

fn controller_of(refs: &[OwnerReference]) -> Option<&OwnerReference> {
    refs.iter()
        .find(|r| r.controller == Some(true))
        .or_else(|| refs.first())
}

/// Map a ReplicaSet created by a Deployment back to the Deployment.
///
/// The ReplicaSet name is `<deployment>-<pod-template-hash>`, so stripping the
/// hash suffix yields the Deployment name.
fn resolve_owner(owner: &OwnerReference, labels: &BTreeMap<String, String>) -> OwnerRef {
    if owner.kind == "ReplicaSet" {
        if let Some(hash) = labels.get("pod-template-hash") {
            if let Some(deployment) = owner.name.strip_suffix(&format!("-{hash}")) {
                return OwnerRef {
                    kind: "Deployment".to_string(),
                    name: deployment.to_string(),
                };
            }
        }
    }
    OwnerRef {
        kind: owner.kind.clone(),
        name: owner.name.clone(),
    }
}

fn container_observation(status: &ContainerStatus) -> ContainerObservation {
    let waiting_reason = status
        .state
        .as_ref()
        .and_then(|s| s.waiting.as_ref())
        .and_then(|w| w.reason.clone());

    let current_termination = status
        .state
        .as_ref()
        .and_then(|s| s.terminated.as_ref())
        .and_then(|t| t.reason.clone());
    let last_termination = status
        .last_state
        .as_ref()
        .and_then(|s| s.terminated.as_ref())
        .and_then(|t| t.reason.clone());

    ContainerObservation {
        name: status.name.clone(),
        restart_count: u32::try_from(status.restart_count).unwrap_or(0),
        waiting_reason,
        last_termination_reason: current_termination.or(last_termination),
    }
}
