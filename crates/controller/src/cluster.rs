//! Kubernetes implementation of the reconciler's cluster seams

use crate::crd::{PodResourcePolicy, PodResourcePolicyStatus};
use anyhow::{Context, Result};
use controller_lib::models::{Instance, InstancePhase, InstanceRef, PolicyKey, TransportError};
use controller_lib::reconcile::{async_trait, ClusterClient, ReplacementSpec, StatusSink};
use controller_lib::resources::{ResourceRequirements, ResourceSpec};
use controller_lib::PolicyStatus;
use k8s_openapi::api::core::v1::{Pod, PodSpec, ResourceRequirements as ContainerResources};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Pods in `namespace`; every namespace when empty
    fn pods(&self, namespace: &str) -> Api<Pod> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn delete_instance(&self, target: &InstanceRef) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        match self.pods(&target.namespace).delete(&target.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %target, "Pod already gone");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("failed to delete pod {}", target)),
        }
    }

    async fn instance_exists(&self, target: &InstanceRef) -> Result<bool> {
        let pod = self
            .pods(&target.namespace)
            .get_opt(&target.name)
            .await
            .with_context(|| format!("failed to look up pod {}", target))?;
        Ok(pod.is_some())
    }

    async fn create_instance(&self, spec: &ReplacementSpec) -> Result<()> {
        let pod = pod_from_replacement(spec)?;
        self.pods(&spec.namespace)
            .create(&PostParams::default(), &pod)
            .await
            .with_context(|| format!("failed to create pod {}", spec.reference()))?;
        Ok(())
    }

    async fn list_instances(&self, namespace: &str) -> Result<Vec<Instance>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("failed to list pods in namespace {:?}", namespace))?;

        let mut instances = Vec::with_capacity(pods.items.len());
        for pod in &pods.items {
            match instance_from_pod(pod) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!(error = %e, "Skipping undecodable pod"),
            }
        }
        Ok(instances)
    }
}

#[async_trait]
impl StatusSink for KubeCluster {
    async fn write_status(&self, key: &PolicyKey, status: &PolicyStatus) -> Result<()> {
        let api: Api<PodResourcePolicy> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = json!({ "status": PodResourcePolicyStatus::from(status) });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("failed to patch status of policy {}", key))?;
        Ok(())
    }
}

fn undecodable(pod: &Pod, reason: impl ToString) -> TransportError {
    TransportError::Undecodable {
        kind: "pod",
        object: format!(
            "{}/{}",
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default()
        ),
        reason: reason.to_string(),
    }
}

fn quantities(list: Option<&BTreeMap<String, Quantity>>) -> BTreeMap<String, String> {
    list.map(|l| l.iter().map(|(k, q)| (k.clone(), q.0.clone())).collect())
        .unwrap_or_default()
}

/// Snapshot a pod for the reconciler. Resources are read from the first
/// container.
pub fn instance_from_pod(pod: &Pod) -> Result<Instance, TransportError> {
    let name = pod
        .metadata
        .name
        .clone()
        .ok_or(TransportError::MissingField("metadata.name"))?;
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .ok_or(TransportError::MissingField("metadata.namespace"))?;
    let spec = pod.spec.as_ref().ok_or(TransportError::MissingField("spec"))?;

    let raw = spec
        .containers
        .first()
        .and_then(|c| c.resources.as_ref())
        .map(|r| ResourceRequirements {
            requests: quantities(r.requests.as_ref()),
            limits: quantities(r.limits.as_ref()),
        })
        .unwrap_or_default();
    let resources = ResourceSpec::parse(&raw).map_err(|e| undecodable(pod, e))?;
    let template = serde_json::to_value(spec).map_err(|e| undecodable(pod, e))?;

    let mut instance = Instance::new(namespace, name)
        .with_resources(resources)
        .with_phase(InstancePhase::parse(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        ))
        .with_deleting(pod.metadata.deletion_timestamp.is_some())
        .with_template(template);
    instance.uid = pod.metadata.uid.clone();
    instance.labels = pod.metadata.labels.clone().unwrap_or_default();
    instance.annotations = pod.metadata.annotations.clone().unwrap_or_default();
    Ok(instance)
}

fn apply_quantities(
    target: &mut Option<BTreeMap<String, Quantity>>,
    raw: BTreeMap<String, String>,
) {
    if raw.is_empty() {
        return;
    }
    let list = target.get_or_insert_with(BTreeMap::new);
    for (name, value) in raw {
        list.insert(name, Quantity(value));
    }
}

/// Build the pod to create for a replacement.
///
/// The pod spec is the old pod's, with the replacement resources set on
/// every container. Only the identity, labels and annotations of the old
/// metadata are kept, and the node binding is dropped so the scheduler can
/// place the resized pod.
pub fn pod_from_replacement(spec: &ReplacementSpec) -> Result<Pod> {
    let mut pod_spec: PodSpec = serde_json::from_value(spec.template.clone())
        .with_context(|| format!("template of pod {} is not a pod spec", spec.reference()))?;
    pod_spec.node_name = None;
    pod_spec.ephemeral_containers = None;

    let raw = spec.resources.to_requirements();
    for container in &mut pod_spec.containers {
        let resources = container
            .resources
            .get_or_insert_with(ContainerResources::default);
        apply_quantities(&mut resources.requests, raw.requests.clone());
        apply_quantities(&mut resources.limits, raw.limits.clone());
    }

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(spec.labels.clone()).filter(|l| !l.is_empty()),
            annotations: Some(spec.annotations.clone()).filter(|a| !a.is_empty()),
            ..ObjectMeta::default()
        },
        spec: Some(pod_spec),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use controller_lib::reconcile::{build_replacement, MANAGED_BY_ANNOTATION};
    use controller_lib::resources::ResourceField;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    fn pending_demo() -> Pod {
        pod(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "pending-demo",
                "namespace": "default",
                "uid": "0b4e-11",
                "resourceVersion": "4711",
                "labels": {"app": "web"},
                "annotations": {"team": "payments"}
            },
            "spec": {
                "nodeName": "worker-1",
                "containers": [
                    {
                        "name": "app",
                        "image": "nginx",
                        "resources": {
                            "requests": {"cpu": "1", "memory": "64Mi", "ephemeral-storage": "1Gi"},
                            "limits": {"cpu": "2"}
                        }
                    },
                    {"name": "sidecar", "image": "busybox"}
                ]
            },
            "status": {"phase": "Pending"}
        }))
    }

    #[test]
    fn test_instance_from_pod() {
        let instance = instance_from_pod(&pending_demo()).unwrap();

        assert_eq!(instance.key(), "default/pending-demo");
        assert_eq!(instance.uid.as_deref(), Some("0b4e-11"));
        assert_eq!(instance.phase, InstancePhase::Pending);
        assert!(!instance.deleting);
        assert_eq!(instance.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(
            instance.resources.get(ResourceField::RequestsCpu).map(|q| q.base_value()),
            Some(1000)
        );
        assert_eq!(
            instance.resources.get(ResourceField::RequestsMemory).map(|q| q.base_value()),
            Some(64 * 1024 * 1024)
        );
        assert!(instance.resources.get(ResourceField::LimitsMemory).is_none());
        assert_eq!(instance.template["nodeName"], "worker-1");
    }

    #[test]
    fn test_terminating_pod_is_deleting() {
        let mut p = pending_demo();
        p.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            Utc::now(),
        ));
        assert!(instance_from_pod(&p).unwrap().deleting);
    }

    #[test]
    fn test_pod_without_spec_is_rejected() {
        let mut p = pending_demo();
        p.spec = None;
        assert!(matches!(
            instance_from_pod(&p),
            Err(TransportError::MissingField("spec"))
        ));
    }

    #[test]
    fn test_pod_without_resources_has_empty_spec() {
        let p = pod(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "bare", "namespace": "default"},
            "spec": {"containers": [{"name": "app", "image": "nginx"}]}
        }));
        assert!(instance_from_pod(&p).unwrap().resources.is_empty());
    }

    #[test]
    fn test_replacement_pod() {
        let instance = instance_from_pod(&pending_demo()).unwrap();
        let desired = ResourceSpec::parse(&ResourceRequirements {
            requests: [("cpu", "100m"), ("memory", "128Mi")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            limits: BTreeMap::new(),
        })
        .unwrap();
        let replacement =
            build_replacement(&instance, &desired, &PolicyKey::new("default", "fix"), Utc::now());

        let created = pod_from_replacement(&replacement).unwrap();

        assert_eq!(created.metadata.name.as_deref(), Some("pending-demo"));
        assert_eq!(created.metadata.namespace.as_deref(), Some("default"));
        assert!(created.metadata.uid.is_none());
        assert!(created.metadata.resource_version.is_none());
        assert!(created.status.is_none());
        let annotations = created.metadata.annotations.unwrap();
        assert_eq!(annotations.get(MANAGED_BY_ANNOTATION).map(String::as_str), Some("default/fix"));
        assert_eq!(annotations.get("team").map(String::as_str), Some("payments"));

        let spec = created.spec.unwrap();
        assert!(spec.node_name.is_none());
        for container in &spec.containers {
            let resources = container.resources.as_ref().unwrap();
            let requests = resources.requests.as_ref().unwrap();
            assert_eq!(requests["cpu"], Quantity("100m".to_string()));
            assert_eq!(requests["memory"], Quantity("128Mi".to_string()));
            assert_eq!(resources.limits.as_ref().unwrap()["cpu"], Quantity("2".to_string()));
        }
        let first = spec.containers[0].resources.as_ref().unwrap();
        assert_eq!(
            first.requests.as_ref().unwrap()["ephemeral-storage"],
            Quantity("1Gi".to_string())
        );
    }

    #[test]
    fn test_replacement_requires_pod_template() {
        let instance = Instance::new("default", "orphan");
        let replacement = build_replacement(
            &instance,
            &ResourceSpec::default(),
            &PolicyKey::new("default", "fix"),
            Utc::now(),
        );
        assert!(pod_from_replacement(&replacement).is_err());
    }
}
