use crate::timeseries::TimeSeriesClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct PodResourceUsage {
    pub cpu_cores: f64,
    pub memory_bytes: f64,
}

/// Pod CPU/memory usage, keyed `namespace/name`.
#[async_trait]
pub trait CoreMetricsClient: Send + Sync {
    async fn pod_usage(&self) -> Result<HashMap<String, PodResourceUsage>>;
}

#[derive(Debug, Deserialize)]
struct PodMetricsList {
    #[serde(default)]
    items: Vec<PodMetricsItem>,
}

#[derive(Debug, Deserialize)]
struct PodMetricsItem {
    metadata: PodMetricsMeta,
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct PodMetricsMeta {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    #[serde(default)]
    usage: ContainerUsage,
}

#[derive(Debug, Deserialize, Default)]
struct ContainerUsage {
    #[serde(default)]
    cpu: Option<Quantity>,
    #[serde(default)]
    memory: Option<Quantity>,
}

/// Reads the metrics.k8s.io aggregated API through the cluster client.
pub struct MetricsApiClient {
    client: kube::Client,
}

impl MetricsApiClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CoreMetricsClient for MetricsApiClient {
    async fn pod_usage(&self) -> Result<HashMap<String, PodResourceUsage>> {
        let request = http::Request::get("/apis/metrics.k8s.io/v1beta1/pods")
            .body(Vec::new())
            .context("failed to build pod metrics request")?;
        let list: PodMetricsList = self
            .client
            .request(request)
            .await
            .context("pod metrics query failed")?;

        let mut usage = HashMap::with_capacity(list.items.len());
        for item in list.items {
            let namespace = item.metadata.namespace.as_deref().unwrap_or("default");
            let mut total = PodResourceUsage::default();
            for container in &item.containers {
                if let Some(cpu) = container.usage.cpu.as_ref() {
                    total.cpu_cores += crate::kubeutil::parse_cpu_quantity(cpu);
                }
                if let Some(memory) = container.usage.memory.as_ref() {
                    total.memory_bytes += crate::kubeutil::parse_memory_quantity(memory);
                }
            }
            usage.insert(format!("{namespace}/{}", item.metadata.name), total);
        }
        Ok(usage)
    }
}

/// One scrape of GPU power. Keys are either `namespace/pod` (direct
/// attribution) or `gpu/<uuid>` with a UUID -> node mapping built from the
/// exporter's instance labels.
#[derive(Debug, Clone, Default)]
pub struct GpuPowerSample {
    pub powers: HashMap<String, f64>,
    pub uuid_nodes: HashMap<String, String>,
}

#[async_trait]
pub trait GpuMetricsClient: Send + Sync {
    /// None means no exporter answered this tick.
    async fn sample(&self) -> Result<Option<GpuPowerSample>>;
}

/// Scrapes a DCGM-style exporter through the time-series store.
pub struct PrometheusGpuClient {
    timeseries: Arc<dyn TimeSeriesClient>,
    metric: String,
}

impl PrometheusGpuClient {
    pub fn new(timeseries: Arc<dyn TimeSeriesClient>, metric: String) -> Self {
        Self { timeseries, metric }
    }
}

#[async_trait]
impl GpuMetricsClient for PrometheusGpuClient {
    async fn sample(&self) -> Result<Option<GpuPowerSample>> {
        let samples = self.timeseries.query_instant(&self.metric).await?;
        if samples.is_empty() {
            return Ok(None);
        }

        let mut out = GpuPowerSample::default();
        for sample in samples {
            let namespace = sample
                .labels
                .get("exported_namespace")
                .or_else(|| sample.labels.get("namespace"));
            let pod = sample
                .labels
                .get("exported_pod")
                .or_else(|| sample.labels.get("pod"));
            if let (Some(namespace), Some(pod)) = (namespace, pod) {
                if !pod.is_empty() {
                    *out.powers.entry(format!("{namespace}/{pod}")).or_insert(0.0) +=
                        sample.value;
                    continue;
                }
            }

            let Some(uuid) = sample
                .labels
                .get("UUID")
                .or_else(|| sample.labels.get("uuid"))
                .or_else(|| sample.labels.get("gpu"))
            else {
                continue;
            };
            out.powers.insert(format!("gpu/{uuid}"), sample.value);
            if let Some(instance) = sample.labels.get("instance") {
                let host = instance.split(':').next().unwrap_or(instance);
                out.uuid_nodes.insert(uuid.clone(), host.to_string());
            }
        }
        Ok(Some(out))
    }
}

/// Sums GPU power attributable to a pod.
///
/// Direct `namespace/pod` keys win. Otherwise every `gpu/<uuid>` entry whose
/// exporter instance resolves to this pod's node contributes. Node matching
/// is a bidirectional substring test to tolerate FQDN vs short-name
/// differences; "node-1" therefore also matches "node-10", which is
/// acceptable in typical deployments.
pub fn attribute_gpu_power(
    sample: &GpuPowerSample,
    namespace: &str,
    pod: &str,
    node_name: &str,
) -> f64 {
    if let Some(direct) = sample.powers.get(&format!("{namespace}/{pod}")) {
        return *direct;
    }
    if node_name.is_empty() {
        return 0.0;
    }
    sample
        .powers
        .iter()
        .filter_map(|(key, watts)| {
            let uuid = key.strip_prefix("gpu/")?;
            let host = sample.uuid_nodes.get(uuid)?;
            if host.contains(node_name) || node_name.contains(host.as_str()) {
                Some(*watts)
            } else {
                None
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_with(
        powers: &[(&str, f64)],
        uuid_nodes: &[(&str, &str)],
    ) -> GpuPowerSample {
        GpuPowerSample {
            powers: powers
                .iter()
                .map(|(key, value)| (key.to_string(), *value))
                .collect(),
            uuid_nodes: uuid_nodes
                .iter()
                .map(|(uuid, node)| (uuid.to_string(), node.to_string()))
                .collect(),
        }
    }

    #[test]
    fn direct_pod_key_wins() {
        let sample = sample_with(
            &[("default/train-1", 215.0), ("gpu/GPU-aaa", 90.0)],
            &[("GPU-aaa", "node-1")],
        );
        let watts = attribute_gpu_power(&sample, "default", "train-1", "node-1");
        assert_eq!(watts, 215.0);
    }

    #[test]
    fn uuid_entries_sum_per_node() {
        let sample = sample_with(
            &[("gpu/GPU-aaa", 90.0), ("gpu/GPU-bbb", 110.0), ("gpu/GPU-ccc", 40.0)],
            &[
                ("GPU-aaa", "node-1"),
                ("GPU-bbb", "node-1.cluster.local"),
                ("GPU-ccc", "node-2"),
            ],
        );
        let watts = attribute_gpu_power(&sample, "default", "train-1", "node-1");
        assert_eq!(watts, 200.0);
    }

    #[test]
    fn fqdn_matches_short_name() {
        let sample = sample_with(&[("gpu/GPU-aaa", 75.0)], &[("GPU-aaa", "node-7")]);
        let watts = attribute_gpu_power(&sample, "ml", "job", "node-7.cluster.local");
        assert_eq!(watts, 75.0);
    }

    #[test]
    fn unrelated_nodes_contribute_nothing() {
        let sample = sample_with(&[("gpu/GPU-aaa", 75.0)], &[("GPU-aaa", "node-2")]);
        let watts = attribute_gpu_power(&sample, "ml", "job", "node-1");
        assert_eq!(watts, 0.0);
    }
}
