use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, Node, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, Patch, PatchParams, PostParams};
use std::collections::BTreeMap;

pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

pub fn pod_uid(pod: &Pod) -> &str {
    pod.metadata.uid.as_deref().unwrap_or("")
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("")
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref())
}

pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("")
}

pub fn scheduler_name(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.scheduler_name.as_deref())
        .unwrap_or("")
}

pub fn owner_kind(pod: &Pod) -> &str {
    pod.metadata
        .owner_references
        .as_ref()
        .and_then(|owners| owners.first())
        .map(|owner| owner.kind.as_str())
        .unwrap_or("Pod")
}

/// Whether the pod declares a GPU request or limit on any container.
pub fn requests_gpu(pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    spec.containers.iter().any(|container| {
        container
            .resources
            .as_ref()
            .map(|resources| {
                quantity_positive(resources.limits.as_ref())
                    || quantity_positive(resources.requests.as_ref())
            })
            .unwrap_or(false)
    })
}

fn quantity_positive(map: Option<&BTreeMap<String, Quantity>>) -> bool {
    map.and_then(|map| map.get(GPU_RESOURCE))
        .map(|quantity| parse_cpu_quantity(quantity) > 0.0)
        .unwrap_or(false)
}

/// Terminal from the telemetry pipeline's point of view: nothing further
/// will be sampled for this pod.
pub fn is_terminal(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    match pod_phase(pod) {
        "Succeeded" | "Failed" => return true,
        _ => {}
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if let Some(statuses) = status.container_statuses.as_ref() {
        if !statuses.is_empty()
            && statuses.iter().all(|container| {
                container
                    .state
                    .as_ref()
                    .map(|state| state.terminated.is_some())
                    .unwrap_or(false)
            })
        {
            return true;
        }
    }
    if let Some(conditions) = status.conditions.as_ref() {
        for condition in conditions {
            if condition.type_ == "Ready"
                && condition.status == "False"
                && matches!(
                    condition.reason.as_deref(),
                    Some("PodCompleted") | Some("PodFailed")
                )
            {
                return true;
            }
        }
    }
    false
}

/// Parses the cpu flavor of a resource quantity ("4", "250m", "12345n")
/// into cores.
pub fn parse_cpu_quantity(quantity: &Quantity) -> f64 {
    let raw = quantity.0.trim();
    if raw.is_empty() {
        return 0.0;
    }
    let (value, scale) = match raw.as_bytes().last() {
        Some(b'n') => (&raw[..raw.len() - 1], 1e-9),
        Some(b'u') => (&raw[..raw.len() - 1], 1e-6),
        Some(b'm') => (&raw[..raw.len() - 1], 1e-3),
        _ => (raw, 1.0),
    };
    value.parse::<f64>().map(|v| v * scale).unwrap_or(0.0)
}

/// Parses the memory flavor of a resource quantity ("128974848", "100Ki",
/// "2Gi", "1G") into bytes.
pub fn parse_memory_quantity(quantity: &Quantity) -> f64 {
    let raw = quantity.0.trim();
    if raw.is_empty() {
        return 0.0;
    }
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];
    for (suffix, scale) in SUFFIXES {
        if let Some(value) = raw.strip_suffix(suffix) {
            return value.parse::<f64>().map(|v| v * scale).unwrap_or(0.0);
        }
    }
    raw.parse::<f64>().unwrap_or(0.0)
}

pub fn node_capacity_cores(node: &Node) -> f64 {
    node.status
        .as_ref()
        .and_then(|status| status.capacity.as_ref())
        .and_then(|capacity| capacity.get("cpu"))
        .map(parse_cpu_quantity)
        .unwrap_or(0.0)
}

pub fn node_memory_gb(node: &Node) -> f64 {
    node.status
        .as_ref()
        .and_then(|status| status.capacity.as_ref())
        .and_then(|capacity| capacity.get("memory"))
        .map(parse_memory_quantity)
        .unwrap_or(0.0)
        / (1024.0 * 1024.0 * 1024.0)
}

pub fn node_gpu_count(node: &Node) -> u32 {
    node.status
        .as_ref()
        .and_then(|status| status.capacity.as_ref())
        .and_then(|capacity| capacity.get(GPU_RESOURCE))
        .map(|quantity| parse_cpu_quantity(quantity) as u32)
        .unwrap_or(0)
}

pub fn node_label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

pub fn node_annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Writes back to the cluster. Admission and completion share one seam so
/// tests can capture patches without an apiserver.
#[async_trait]
pub trait ClusterPatcher: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    async fn patch_pod_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<()>;

    async fn create_warning_event(&self, pod: &Pod, reason: &str, message: &str) -> Result<()>;
}

pub struct KubeClusterPatcher {
    client: kube::Client,
}

impl KubeClusterPatcher {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterPatcher for KubeClusterPatcher {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await {
            Ok(pod) => Ok(pod),
            Err(err) => Err(err).with_context(|| format!("failed to read pod {namespace}/{name}")),
        }
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("failed to annotate pod {namespace}/{name}"))?;
        Ok(())
    }

    async fn patch_pod_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("failed to label pod {namespace}/{name}"))?;
        Ok(())
    }

    async fn create_warning_event(&self, pod: &Pod, reason: &str, message: &str) -> Result<()> {
        let namespace = pod_namespace(pod);
        let name = pod_name(pod);
        let now = Time(Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{name}-")),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: pod.metadata.uid.clone(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some("Warning".to_string()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        };
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), &event)
            .await
            .with_context(|| format!("failed to create event for pod {namespace}/{name}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus, PodCondition, PodStatus};

    fn quantity(raw: &str) -> Quantity {
        Quantity(raw.to_string())
    }

    #[test]
    fn cpu_quantities() {
        assert_eq!(parse_cpu_quantity(&quantity("4")), 4.0);
        assert_eq!(parse_cpu_quantity(&quantity("250m")), 0.25);
        assert!((parse_cpu_quantity(&quantity("1500000n")) - 0.0015).abs() < 1e-12);
        assert_eq!(parse_cpu_quantity(&quantity("junk")), 0.0);
    }

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory_quantity(&quantity("1024")), 1024.0);
        assert_eq!(parse_memory_quantity(&quantity("100Ki")), 102400.0);
        assert_eq!(parse_memory_quantity(&quantity("2Gi")), 2.0 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(parse_memory_quantity(&quantity("1G")), 1e9);
    }

    #[test]
    fn succeeded_pod_is_terminal() {
        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(is_terminal(&pod));
    }

    #[test]
    fn running_pod_is_not_terminal() {
        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        assert!(!is_terminal(&pod));
    }

    #[test]
    fn all_containers_terminated_is_terminal() {
        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "main".to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 0,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(is_terminal(&pod));
    }

    #[test]
    fn ready_false_pod_completed_is_terminal() {
        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "False".to_string(),
                reason: Some("PodCompleted".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(is_terminal(&pod));
    }
}
