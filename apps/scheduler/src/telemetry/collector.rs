use crate::carbon::cache::{CarbonCache, Freshness};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::hardware::{self, HardwareProfiler, NodePowerProfile};
use crate::kubeutil;
use crate::metrics;
use crate::pricing::PriceOracle;
use crate::telemetry::clients::{
    attribute_gpu_power, CoreMetricsClient, GpuMetricsClient, GpuPowerSample, PodResourceUsage,
};
use crate::telemetry::completion::CompletionHandler;
use crate::telemetry::{PodIdentity, PodMetricsRecord, PodMetricsStorage};
use anyhow::Result;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// CPU draw grows sublinearly with utilization on real parts; the exponent
/// keeps the estimate honest at mid-range loads.
const CPU_UTILIZATION_EXPONENT: f64 = 1.4;

/// Periodic sampler: one record per live pod per tick, plus heartbeat-based
/// completion detection for pods whose terminal event was missed.
pub struct CollectorService {
    config: Arc<SchedulerConfig>,
    clock: Arc<dyn Clock>,
    client: kube::Client,
    cache: Arc<CarbonCache>,
    oracle: Option<Arc<dyn PriceOracle>>,
    profiler: Option<Arc<HardwareProfiler>>,
    store: Arc<dyn PodMetricsStorage>,
    core_metrics: Arc<dyn CoreMetricsClient>,
    gpu_metrics: Option<Arc<dyn GpuMetricsClient>>,
    completion: Arc<CompletionHandler>,
}

impl CollectorService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<SchedulerConfig>,
        clock: Arc<dyn Clock>,
        client: kube::Client,
        cache: Arc<CarbonCache>,
        oracle: Option<Arc<dyn PriceOracle>>,
        profiler: Option<Arc<HardwareProfiler>>,
        store: Arc<dyn PodMetricsStorage>,
        core_metrics: Arc<dyn CoreMetricsClient>,
        gpu_metrics: Option<Arc<dyn GpuMetricsClient>>,
        completion: Arc<CompletionHandler>,
    ) -> Self {
        Self {
            config,
            clock,
            client,
            cache,
            oracle,
            profiler,
            store,
            core_metrics,
            gpu_metrics,
            completion,
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.telemetry.sampling_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.collect_once().await {
                            warn!("telemetry tick failed: {err:#}");
                        }
                    }
                }
            }
        });
    }

    async fn collect_once(&self) -> Result<()> {
        let now = self.clock.now();

        // Stale cache entries are fine here; the collector is an observer,
        // not a gatekeeper.
        let region = self.config.carbon.region.as_str();
        let intensity = match self.cache.get(region) {
            (Some(record), Freshness::Fresh) | (Some(record), Freshness::Stale) => {
                metrics::CARBON_INTENSITY
                    .with_label_values(&[region])
                    .set(record.intensity);
                record.intensity
            }
            _ => 0.0,
        };

        let rate = match self.oracle.as_ref() {
            Some(oracle) => {
                let rate = oracle.current_rate(now);
                let period = if oracle.is_peak(now) { "peak" } else { "off-peak" };
                metrics::ELECTRICITY_RATE
                    .with_label_values(&[&self.config.pricing.location, period])
                    .set(rate);
                rate
            }
            None => 0.0,
        };

        let pods: Api<Pod> = Api::all(self.client.clone());
        let pod_list = pods.list(&ListParams::default()).await?;
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_list = nodes.list(&ListParams::default()).await?;
        let nodes_by_name: HashMap<String, &Node> = node_list
            .items
            .iter()
            .filter_map(|node| node.metadata.name.clone().map(|name| (name, node)))
            .collect();

        let usage = match self.core_metrics.pod_usage().await {
            Ok(usage) => usage,
            Err(err) => {
                metrics::METRICS_COLLECTION_ERRORS_TOTAL
                    .with_label_values(&["metrics_api"])
                    .inc();
                warn!("metrics api unavailable this tick: {err:#}");
                HashMap::new()
            }
        };

        let gpu_sample = match self.gpu_metrics.as_ref() {
            Some(client) => match client.sample().await {
                Ok(sample) => sample,
                Err(err) => {
                    metrics::METRICS_COLLECTION_ERRORS_TOTAL
                        .with_label_values(&["gpu_exporter"])
                        .inc();
                    debug!("gpu exporter unavailable this tick: {err:#}");
                    None
                }
            },
            None => None,
        };

        let mut live_uids = HashSet::new();
        for pod in &pod_list.items {
            if kubeutil::scheduler_name(pod) != self.config.scheduler_name {
                continue;
            }
            live_uids.insert(kubeutil::pod_uid(pod).to_string());
            if kubeutil::pod_phase(pod) != "Running" {
                continue;
            }
            let Some(node_name) = kubeutil::pod_node_name(pod) else {
                continue;
            };
            let node = nodes_by_name.get(node_name).copied();
            if let Err(err) = self
                .sample_pod(pod, node, &usage, gpu_sample.as_ref(), intensity, rate)
                .await
            {
                metrics::METRICS_COLLECTION_ERRORS_TOTAL
                    .with_label_values(&["pod_sample"])
                    .inc();
                debug!(pod = kubeutil::pod_name(pod), "sample skipped: {err:#}");
            }
        }

        self.detect_missed_completions(&pod_list.items, &live_uids)
            .await;
        metrics::METRICS_CACHE_SIZE.set(self.store.size() as f64);
        Ok(())
    }

    async fn sample_pod(
        &self,
        pod: &Pod,
        node: Option<&Node>,
        usage: &HashMap<String, PodResourceUsage>,
        gpu_sample: Option<&GpuPowerSample>,
        intensity: f64,
        rate: f64,
    ) -> Result<()> {
        let namespace = kubeutil::pod_namespace(pod);
        let name = kubeutil::pod_name(pod);
        let node_name = kubeutil::pod_node_name(pod).unwrap_or_default();

        let Some(used) = usage.get(&format!("{namespace}/{name}")) else {
            anyhow::bail!("no usage sample from the metrics api");
        };

        let gpu_power = gpu_sample
            .map(|sample| attribute_gpu_power(sample, namespace, name, node_name))
            .unwrap_or(0.0);

        let (cpu_power, profile) = match (self.profiler.as_ref(), node) {
            (Some(profiler), Some(node)) => match profiler.get_profile(node) {
                Ok(profile) => {
                    let capacity = kubeutil::node_capacity_cores(node);
                    let mut power = estimate_cpu_power(&profile, used.cpu_cores, capacity);
                    if let Some(current) = profiler.current_frequency_ghz(node_name).await {
                        if let Some(ratio) = hardware::frequency_ratio(&profile, current) {
                            power =
                                hardware::adjust_for_frequency(power, ratio, profile.power_scaling);
                        }
                    }
                    (power, Some(profile))
                }
                Err(err) => {
                    warn!(node = node_name, "profile lookup failed, using defaults: {err}");
                    (default_cpu_power(used.cpu_cores), None)
                }
            },
            _ => (default_cpu_power(used.cpu_cores), None),
        };

        let (pue, gpu_pue) = profile
            .as_ref()
            .map(|profile| (profile.pue, profile.gpu_pue))
            .unwrap_or((
                self.config.hardware.default_pue,
                self.config.hardware.default_gpu_pue,
            ));
        let total_power = cpu_power * pue + gpu_power * gpu_pue;

        let record = PodMetricsRecord {
            timestamp: self.clock.now(),
            cpu_cores: used.cpu_cores,
            memory_bytes: used.memory_bytes,
            gpu_power_watts: gpu_power,
            total_power_watts: total_power,
            carbon_intensity: intensity,
            electricity_rate: rate,
        };
        let identity = PodIdentity {
            uid: kubeutil::pod_uid(pod).to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            node: node_name.to_string(),
        };
        self.store.add_record(&identity, record);

        metrics::set_pod_phase_gauges(
            node_name,
            name,
            "current",
            used.cpu_cores,
            used.memory_bytes,
            gpu_power,
            total_power,
        );
        if let Some(history) = self.store.get(&identity.uid) {
            metrics::METRICS_SAMPLES_STORED
                .with_label_values(&[name, namespace])
                .set(history.records.len() as f64);
        }
        Ok(())
    }

    /// Recovery from missed informer events: any tracked, non-completed pod
    /// that is gone from the cluster or already terminal gets settled here.
    /// Idempotent through the store's completed flag.
    async fn detect_missed_completions(&self, pods: &[Pod], live_uids: &HashSet<String>) {
        let mut candidates: Vec<String> = Vec::new();
        self.store.for_each(&mut |history| {
            if !history.completed {
                candidates.push(history.pod_uid.clone());
            }
        });

        for uid in candidates {
            let pod = pods
                .iter()
                .find(|pod| kubeutil::pod_uid(pod) == uid);
            let settle = match pod {
                Some(pod) => kubeutil::is_terminal(pod),
                None => !live_uids.contains(&uid),
            };
            if settle {
                debug!(uid, "heartbeat detected completion");
                self.completion.process(&uid, pod).await;
            }
        }
    }
}

/// `idle + (max - idle) * u^1.4` with utilization clipped at node capacity.
pub fn estimate_cpu_power(profile: &NodePowerProfile, cpu_used: f64, capacity_cores: f64) -> f64 {
    let normalized = if capacity_cores > 0.0 {
        (cpu_used / capacity_cores).clamp(0.0, 1.0)
    } else {
        0.0
    };
    profile.idle_watts
        + (profile.max_watts - profile.idle_watts) * normalized.powf(CPU_UTILIZATION_EXPONENT)
}

/// Used when no node profile can be resolved at all.
fn default_cpu_power(cpu_used: f64) -> f64 {
    10.0 + 30.0 * cpu_used
}
