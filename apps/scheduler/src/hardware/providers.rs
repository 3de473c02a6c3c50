use crate::annotations;
use crate::config::{HardwareConfig, PowerRange};
use crate::hardware::{
    HardwareInfo, NodePowerProfile, ProfileError, ProviderType, ARCH_LABEL, INSTANCE_TYPE_LABEL,
    MEMORY_BASE_WATTS, MEMORY_IDLE_WATTS_PER_GB, MEMORY_MAX_WATTS_PER_GB, NFD_CPU_FAMILY_LABEL,
    NFD_CPU_ID_LABEL, NFD_CPU_VENDOR_LABEL, NFD_GPU_PRODUCT_LABEL,
};
use crate::kubeutil;
use crate::timeseries::TimeSeriesClient;
use k8s_openapi::api::core::v1::Node;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One link of the profiler's priority chain.
pub trait PowerInfoProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32;
    fn provider_type(&self) -> ProviderType;
    fn is_available(&self, node: &Node) -> bool;
    fn get_profile(
        &self,
        node: &Node,
        config: &HardwareConfig,
    ) -> Result<NodePowerProfile, ProfileError>;

    fn get_hardware_info(&self, node: &Node) -> HardwareInfo {
        hardware_info(node)
    }
}

pub fn hardware_info(node: &Node) -> HardwareInfo {
    HardwareInfo {
        cpu_model: kubeutil::node_annotation(node, annotations::NODE_CPU_MODEL)
            .map(str::to_string),
        gpu_model: kubeutil::node_label(node, NFD_GPU_PRODUCT_LABEL)
            .or_else(|| kubeutil::node_annotation(node, annotations::NODE_GPU_MODEL))
            .map(str::to_string),
        architecture: kubeutil::node_label(node, ARCH_LABEL)
            .map(str::to_string)
            .or_else(|| {
                node.status
                    .as_ref()
                    .and_then(|status| status.node_info.as_ref())
                    .map(|info| info.architecture.clone())
            }),
        cores: kubeutil::node_capacity_cores(node),
        memory_gb: kubeutil::node_memory_gb(node),
        gpu_count: kubeutil::node_gpu_count(node),
    }
}

fn annotation_f64(node: &Node, key: &str) -> Result<Option<f64>, ProfileError> {
    match kubeutil::node_annotation(node, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ProfileError::InvalidAnnotation {
                key: key.to_string(),
                value: raw.to_string(),
            }),
    }
}

fn pue_overrides(node: &Node, config: &HardwareConfig) -> Result<(f64, f64), ProfileError> {
    let pue = annotation_f64(node, annotations::NODE_PUE)?.unwrap_or(config.default_pue);
    let gpu_pue =
        annotation_f64(node, annotations::NODE_GPU_PUE)?.unwrap_or(config.default_gpu_pue);
    Ok((pue, gpu_pue))
}

fn base_frequency(node: &Node) -> Result<Option<f64>, ProfileError> {
    annotation_f64(node, annotations::NODE_CPU_BASE_FREQUENCY)
}

fn memory_watts(node: &Node, config: &HardwareConfig) -> (f64, f64) {
    let gb = kubeutil::node_memory_gb(node);
    match config.memory_profile {
        Some(profile) => (
            profile.base_watts + profile.idle_watts_per_gb * gb,
            profile.base_watts + profile.max_watts_per_gb * gb,
        ),
        None => (
            MEMORY_BASE_WATTS + MEMORY_IDLE_WATTS_PER_GB * gb,
            MEMORY_BASE_WATTS + MEMORY_MAX_WATTS_PER_GB * gb,
        ),
    }
}

fn gpu_watts(node: &Node, config: &HardwareConfig) -> (f64, f64) {
    let mut count = kubeutil::node_gpu_count(node);
    if count == 0 {
        count = kubeutil::node_annotation(node, annotations::NODE_GPU_COUNT)
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0);
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    let per_gpu = kubeutil::node_label(node, NFD_GPU_PRODUCT_LABEL)
        .or_else(|| kubeutil::node_annotation(node, annotations::NODE_GPU_MODEL))
        .and_then(|product| config.gpu_profiles.get(product))
        .copied()
        .unwrap_or(GENERIC_GPU);
    (
        per_gpu.idle_watts * count as f64,
        per_gpu.max_watts * count as f64,
    )
}

const GENERIC_GPU: PowerRange = PowerRange {
    idle_watts: 30.0,
    max_watts: 250.0,
};

/// Live readings published per node by a measured-power exporter. When this
/// feed knows a node, measurement outranks every estimate.
#[derive(Default)]
pub struct MeasuredPowerFeed {
    readings: RwLock<HashMap<String, PowerRange>>,
}

impl MeasuredPowerFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, node: String, range: PowerRange) {
        self.readings
            .write()
            .expect("measured feed poisoned")
            .insert(node, range);
    }

    pub fn get(&self, node: &str) -> Option<PowerRange> {
        self.readings
            .read()
            .expect("measured feed poisoned")
            .get(node)
            .copied()
    }
}

/// Refreshes the measured feed from the time-series store.
pub struct MeasuredPowerService {
    feed: Arc<MeasuredPowerFeed>,
    timeseries: Arc<dyn TimeSeriesClient>,
    metric: String,
    interval: Duration,
}

impl MeasuredPowerService {
    pub fn new(
        feed: Arc<MeasuredPowerFeed>,
        timeseries: Arc<dyn TimeSeriesClient>,
        metric: String,
        interval: Duration,
    ) -> Self {
        Self {
            feed,
            timeseries,
            metric,
            interval,
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh().await {
                            warn!(error = %err, "measured power refresh failed");
                        }
                    }
                }
            }
        });
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        let idle_query = format!("min_over_time({}[1h])", self.metric);
        let max_query = format!("max_over_time({}[1h])", self.metric);
        let idle = self.timeseries.query_instant(&idle_query).await?;
        let max = self.timeseries.query_instant(&max_query).await?;

        let mut idle_by_node = HashMap::new();
        for sample in idle {
            if let Some(node) = sample.labels.get("node") {
                idle_by_node.insert(node.clone(), sample.value);
            }
        }
        for sample in max {
            let Some(node) = sample.labels.get("node") else {
                continue;
            };
            let Some(idle_watts) = idle_by_node.get(node).copied() else {
                continue;
            };
            self.feed.update(
                node.clone(),
                PowerRange {
                    idle_watts,
                    max_watts: sample.value,
                },
            );
        }
        Ok(())
    }
}

pub struct MeasuredProvider {
    feed: Arc<MeasuredPowerFeed>,
}

impl MeasuredProvider {
    pub fn new(feed: Arc<MeasuredPowerFeed>) -> Self {
        Self { feed }
    }
}

impl PowerInfoProvider for MeasuredProvider {
    fn name(&self) -> &'static str {
        "measured"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Measured
    }

    fn is_available(&self, node: &Node) -> bool {
        node.metadata
            .name
            .as_deref()
            .map(|name| self.feed.get(name).is_some())
            .unwrap_or(false)
    }

    fn get_profile(
        &self,
        node: &Node,
        config: &HardwareConfig,
    ) -> Result<NodePowerProfile, ProfileError> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let range = self
            .feed
            .get(name)
            .ok_or_else(|| ProfileError::NoProvider(name.to_string()))?;
        let (pue, gpu_pue) = pue_overrides(node, config)?;
        let (idle_gpu, max_gpu) = gpu_watts(node, config);
        Ok(NodePowerProfile {
            idle_watts: range.idle_watts,
            max_watts: range.max_watts,
            idle_gpu_watts: idle_gpu,
            max_gpu_watts: max_gpu,
            pue,
            gpu_pue,
            base_frequency_ghz: base_frequency(node)?,
            power_scaling: config.power_scaling,
            provider: "measured",
            provider_type: ProviderType::Measured,
        })
    }
}

/// Vendor-supplied watt annotations on the node object.
pub struct AnnotationProvider;

impl PowerInfoProvider for AnnotationProvider {
    fn name(&self) -> &'static str {
        "annotation"
    }

    fn priority(&self) -> i32 {
        80
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Estimated
    }

    fn is_available(&self, node: &Node) -> bool {
        kubeutil::node_annotation(node, annotations::NODE_IDLE_WATTS).is_some()
            && kubeutil::node_annotation(node, annotations::NODE_MAX_WATTS).is_some()
    }

    fn get_profile(
        &self,
        node: &Node,
        config: &HardwareConfig,
    ) -> Result<NodePowerProfile, ProfileError> {
        let idle_watts = annotation_f64(node, annotations::NODE_IDLE_WATTS)?.unwrap_or(0.0);
        let max_watts = annotation_f64(node, annotations::NODE_MAX_WATTS)?.unwrap_or(0.0);
        let idle_gpu = annotation_f64(node, annotations::NODE_IDLE_GPU_WATTS)?;
        let max_gpu = annotation_f64(node, annotations::NODE_MAX_GPU_WATTS)?;
        let (fallback_idle_gpu, fallback_max_gpu) = gpu_watts(node, config);
        let (pue, gpu_pue) = pue_overrides(node, config)?;
        Ok(NodePowerProfile {
            idle_watts,
            max_watts,
            idle_gpu_watts: idle_gpu.unwrap_or(fallback_idle_gpu),
            max_gpu_watts: max_gpu.unwrap_or(fallback_max_gpu),
            pue,
            gpu_pue,
            base_frequency_ghz: base_frequency(node)?,
            power_scaling: config.power_scaling,
            provider: "annotation",
            provider_type: ProviderType::Estimated,
        })
    }
}

/// Joins node-feature-discovery CPU labels against the configured vendor ->
/// family-model -> CPU model mapping, then looks the model up in the CPU
/// power table.
pub struct NfdLabelProvider;

impl PowerInfoProvider for NfdLabelProvider {
    fn name(&self) -> &'static str {
        "nfd-label"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Estimated
    }

    fn is_available(&self, node: &Node) -> bool {
        kubeutil::node_label(node, NFD_CPU_VENDOR_LABEL).is_some()
            && kubeutil::node_label(node, NFD_CPU_FAMILY_LABEL).is_some()
            && kubeutil::node_label(node, NFD_CPU_ID_LABEL).is_some()
    }

    fn get_profile(
        &self,
        node: &Node,
        config: &HardwareConfig,
    ) -> Result<NodePowerProfile, ProfileError> {
        let vendor = kubeutil::node_label(node, NFD_CPU_VENDOR_LABEL).unwrap_or_default();
        let family = kubeutil::node_label(node, NFD_CPU_FAMILY_LABEL).unwrap_or_default();
        let id = kubeutil::node_label(node, NFD_CPU_ID_LABEL).unwrap_or_default();
        let family_model = format!("{family}-{id}");

        let model = config
            .nfd_cpu_models
            .get(vendor)
            .and_then(|models| models.get(&family_model))
            .cloned()
            .ok_or_else(|| ProfileError::UnknownCpuModel {
                model: format!("{vendor} {family_model}"),
                configured: config.cpu_profiles.len(),
                known: false,
            })?;

        let range = config.cpu_profiles.get(&model).copied().ok_or_else(|| {
            ProfileError::UnknownCpuModel {
                model: model.clone(),
                configured: config.cpu_profiles.len(),
                known: config.cpu_profiles.contains_key(&model),
            }
        })?;

        let (memory_idle, memory_max) = memory_watts(node, config);
        let (idle_gpu, max_gpu) = gpu_watts(node, config);
        let (pue, gpu_pue) = pue_overrides(node, config)?;
        debug!(model = %model, vendor, family_model, "nfd cpu model resolved");
        Ok(NodePowerProfile {
            idle_watts: range.idle_watts + memory_idle,
            max_watts: range.max_watts + memory_max,
            idle_gpu_watts: idle_gpu,
            max_gpu_watts: max_gpu,
            pue,
            gpu_pue,
            base_frequency_ghz: base_frequency(node)?,
            power_scaling: config.power_scaling,
            provider: "nfd-label",
            provider_type: ProviderType::Estimated,
        })
    }
}

/// Last link of the chain: cloud instance table first, then a generic
/// architecture/core-count heuristic. Always available.
pub struct FallbackProvider;

struct ArchHeuristic {
    idle_base: f64,
    idle_per_core: f64,
    max_base: f64,
    max_per_core: f64,
}

fn arch_heuristic(architecture: Option<&str>) -> ArchHeuristic {
    match architecture {
        Some("arm64") | Some("aarch64") => ArchHeuristic {
            idle_base: 5.0,
            idle_per_core: 1.0,
            max_base: 5.0,
            max_per_core: 8.0,
        },
        _ => ArchHeuristic {
            idle_base: 10.0,
            idle_per_core: 2.0,
            max_base: 10.0,
            max_per_core: 12.0,
        },
    }
}

impl PowerInfoProvider for FallbackProvider {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Estimated
    }

    fn is_available(&self, _node: &Node) -> bool {
        true
    }

    fn get_profile(
        &self,
        node: &Node,
        config: &HardwareConfig,
    ) -> Result<NodePowerProfile, ProfileError> {
        let (pue, gpu_pue) = pue_overrides(node, config)?;
        let (idle_gpu, max_gpu) = gpu_watts(node, config);
        let base_frequency = base_frequency(node)?;

        if let Some(instance) = kubeutil::node_label(node, INSTANCE_TYPE_LABEL) {
            if let Some(profile) = config.instance_profiles.get(instance) {
                return Ok(NodePowerProfile {
                    idle_watts: profile.idle_watts,
                    max_watts: profile.max_watts,
                    idle_gpu_watts: if profile.max_gpu_watts > 0.0 {
                        profile.idle_gpu_watts
                    } else {
                        idle_gpu
                    },
                    max_gpu_watts: if profile.max_gpu_watts > 0.0 {
                        profile.max_gpu_watts
                    } else {
                        max_gpu
                    },
                    pue: profile.pue.unwrap_or(pue),
                    gpu_pue,
                    base_frequency_ghz: base_frequency,
                    power_scaling: config.power_scaling,
                    provider: "fallback",
                    provider_type: ProviderType::Estimated,
                });
            }
        }

        let info = hardware_info(node);
        let heuristic = arch_heuristic(info.architecture.as_deref());
        let cores = info.cores.max(1.0);
        let (memory_idle, memory_max) = memory_watts(node, config);
        Ok(NodePowerProfile {
            idle_watts: heuristic.idle_base + heuristic.idle_per_core * cores + memory_idle,
            max_watts: heuristic.max_base + heuristic.max_per_core * cores + memory_max,
            idle_gpu_watts: idle_gpu,
            max_gpu_watts: max_gpu,
            pue,
            gpu_pue,
            base_frequency_ghz: base_frequency,
            power_scaling: config.power_scaling,
            provider: "fallback",
            provider_type: ProviderType::Estimated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstancePowerProfile;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn node_with_labels(labels: &[(&str, &str)]) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some("node-1".to_string());
        node.metadata.uid = Some("uid-1".to_string());
        node.metadata.labels = Some(
            labels
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        );
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_string(), Quantity("16".to_string()));
        capacity.insert("memory".to_string(), Quantity("64Gi".to_string()));
        node.status = Some(NodeStatus {
            capacity: Some(capacity),
            ..Default::default()
        });
        node
    }

    #[test]
    fn instance_profile_wins_over_heuristic() {
        let mut config = HardwareConfig::default();
        config.instance_profiles.insert(
            "m5.2xlarge".to_string(),
            InstancePowerProfile {
                idle_watts: 35.0,
                max_watts: 170.0,
                idle_gpu_watts: 0.0,
                max_gpu_watts: 0.0,
                pue: None,
            },
        );
        let node = node_with_labels(&[(INSTANCE_TYPE_LABEL, "m5.2xlarge")]);
        let profile = FallbackProvider
            .get_profile(&node, &config)
            .expect("profile");
        assert_eq!(profile.idle_watts, 35.0);
        assert_eq!(profile.max_watts, 170.0);
    }

    #[test]
    fn heuristic_scales_with_cores() {
        let config = HardwareConfig::default();
        let node = node_with_labels(&[(ARCH_LABEL, "amd64")]);
        let profile = FallbackProvider
            .get_profile(&node, &config)
            .expect("profile");
        // 16 cores plus memory contribution on top of the base.
        assert!(profile.idle_watts > 10.0 + 2.0 * 16.0);
        assert!(profile.max_watts > profile.idle_watts);
    }

    #[test]
    fn nfd_unknown_model_reports_table_size() {
        let config = HardwareConfig::default();
        let node = node_with_labels(&[
            (NFD_CPU_VENDOR_LABEL, "GenuineIntel"),
            (NFD_CPU_FAMILY_LABEL, "6"),
            (NFD_CPU_ID_LABEL, "85"),
        ]);
        let err = NfdLabelProvider
            .get_profile(&node, &config)
            .expect_err("must fail");
        match err {
            ProfileError::UnknownCpuModel {
                configured, known, ..
            } => {
                assert_eq!(configured, 0);
                assert!(!known);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn measured_provider_reads_feed() {
        let feed = Arc::new(MeasuredPowerFeed::new());
        feed.update(
            "node-1".to_string(),
            PowerRange {
                idle_watts: 42.0,
                max_watts: 199.0,
            },
        );
        let provider = MeasuredProvider::new(feed);
        let node = node_with_labels(&[]);
        assert!(provider.is_available(&node));
        let profile = provider
            .get_profile(&node, &HardwareConfig::default())
            .expect("profile");
        assert_eq!(profile.idle_watts, 42.0);
        assert_eq!(profile.provider_type, ProviderType::Measured);
    }

    #[test]
    fn invalid_pue_annotation_is_an_error() {
        let mut node = node_with_labels(&[]);
        node.metadata.annotations = Some(BTreeMap::from([
            (annotations::NODE_IDLE_WATTS.to_string(), "50".to_string()),
            (annotations::NODE_MAX_WATTS.to_string(), "250".to_string()),
            (annotations::NODE_PUE.to_string(), "high".to_string()),
        ]));
        let err = AnnotationProvider
            .get_profile(&node, &HardwareConfig::default())
            .expect_err("must fail");
        assert!(matches!(err, ProfileError::InvalidAnnotation { .. }));
    }
}
