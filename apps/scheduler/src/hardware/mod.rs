pub mod providers;

use crate::config::{HardwareConfig, PowerScaling};
use crate::timeseries::TimeSeriesClient;
use k8s_openapi::api::core::v1::Node;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

pub use providers::{
    AnnotationProvider, FallbackProvider, MeasuredPowerFeed, MeasuredPowerService,
    MeasuredProvider, NfdLabelProvider, PowerInfoProvider,
};

pub const NFD_CPU_VENDOR_LABEL: &str = "feature.node.kubernetes.io/cpu-model.vendor_id";
pub const NFD_CPU_FAMILY_LABEL: &str = "feature.node.kubernetes.io/cpu-model.family";
pub const NFD_CPU_ID_LABEL: &str = "feature.node.kubernetes.io/cpu-model.id";
pub const NFD_GPU_PRODUCT_LABEL: &str = "nvidia.com/gpu.product";
pub const NFD_PSTATE_GOVERNOR_LABEL: &str =
    "feature.node.kubernetes.io/cpu-pstate.scaling_governor";
pub const NFD_PSTATE_STATUS_LABEL: &str = "feature.node.kubernetes.io/cpu-pstate.status";
pub const NFD_PSTATE_TURBO_LABEL: &str = "feature.node.kubernetes.io/cpu-pstate.turbo";
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
pub const ARCH_LABEL: &str = "kubernetes.io/arch";

// Memory contribution defaults when no explicit memory profile is
// configured: watts = base + per_gb * gb, added to both idle and max.
pub const MEMORY_BASE_WATTS: f64 = 1.0;
pub const MEMORY_IDLE_WATTS_PER_GB: f64 = 0.125;
pub const MEMORY_MAX_WATTS_PER_GB: f64 = 0.35;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Measured,
    Estimated,
}

impl ProviderType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderType::Measured => "measured",
            ProviderType::Estimated => "estimated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodePowerProfile {
    pub idle_watts: f64,
    pub max_watts: f64,
    pub idle_gpu_watts: f64,
    pub max_gpu_watts: f64,
    pub pue: f64,
    pub gpu_pue: f64,
    pub base_frequency_ghz: Option<f64>,
    pub power_scaling: PowerScaling,
    pub provider: &'static str,
    pub provider_type: ProviderType,
}

#[derive(Debug, Clone, Default)]
pub struct HardwareInfo {
    pub cpu_model: Option<String>,
    pub gpu_model: Option<String>,
    pub architecture: Option<String>,
    pub cores: f64,
    pub memory_gb: f64,
    pub gpu_count: u32,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error(
        "no power profile for cpu model {model:?} \
         ({configured} cpu profiles configured, model present in table: {known})"
    )]
    UnknownCpuModel {
        model: String,
        configured: usize,
        known: bool,
    },
    #[error("node {0:?} carries no usable hardware signal")]
    NoProvider(String),
    #[error("invalid node annotation {key}: {value:?}")]
    InvalidAnnotation { key: String, value: String },
}

struct CachedProfile {
    fingerprint: String,
    profile: NodePowerProfile,
}

/// Resolves a node to a power profile through the provider chain, cached by
/// node UID. The fingerprint covers every label and annotation the
/// resolution depends on, so relevant changes invalidate on the next call.
pub struct HardwareProfiler {
    config: HardwareConfig,
    providers: Vec<Box<dyn PowerInfoProvider>>,
    cache: RwLock<HashMap<String, CachedProfile>>,
    timeseries: Option<Arc<dyn TimeSeriesClient>>,
    frequency_metric: String,
}

impl HardwareProfiler {
    pub fn new(
        config: HardwareConfig,
        mut providers: Vec<Box<dyn PowerInfoProvider>>,
        timeseries: Option<Arc<dyn TimeSeriesClient>>,
        frequency_metric: String,
    ) -> Self {
        providers.sort_by_key(|provider| std::cmp::Reverse(provider.priority()));
        Self {
            config,
            providers,
            cache: RwLock::new(HashMap::new()),
            timeseries,
            frequency_metric,
        }
    }

    pub fn with_default_providers(
        config: HardwareConfig,
        measured_feed: Option<Arc<MeasuredPowerFeed>>,
        timeseries: Option<Arc<dyn TimeSeriesClient>>,
        frequency_metric: String,
    ) -> Self {
        let mut providers: Vec<Box<dyn PowerInfoProvider>> = vec![
            Box::new(AnnotationProvider),
            Box::new(NfdLabelProvider),
            Box::new(FallbackProvider),
        ];
        if let Some(feed) = measured_feed {
            providers.push(Box::new(MeasuredProvider::new(feed)));
        }
        Self::new(config, providers, timeseries, frequency_metric)
    }

    pub fn get_profile(&self, node: &Node) -> Result<NodePowerProfile, ProfileError> {
        let uid = node.metadata.uid.clone().unwrap_or_default();
        let fingerprint = Self::fingerprint(node);
        {
            let cache = self.cache.read().expect("profile cache poisoned");
            if let Some(cached) = cache.get(&uid) {
                if cached.fingerprint == fingerprint {
                    return Ok(cached.profile.clone());
                }
            }
        }

        let profile = self.resolve(node)?;
        debug!(
            node = node.metadata.name.as_deref().unwrap_or(""),
            provider = profile.provider,
            idle_watts = profile.idle_watts,
            max_watts = profile.max_watts,
            "resolved node power profile"
        );
        let mut cache = self.cache.write().expect("profile cache poisoned");
        cache.insert(
            uid,
            CachedProfile {
                fingerprint,
                profile: profile.clone(),
            },
        );
        Ok(profile)
    }

    pub fn invalidate(&self, node_uid: &str) {
        let mut cache = self.cache.write().expect("profile cache poisoned");
        cache.remove(node_uid);
    }

    fn resolve(&self, node: &Node) -> Result<NodePowerProfile, ProfileError> {
        let mut last_error = None;
        for provider in &self.providers {
            if !provider.is_available(node) {
                continue;
            }
            match provider.get_profile(node, &self.config) {
                Ok(profile) => return Ok(profile),
                Err(err) => {
                    warn!(
                        provider = provider.name(),
                        node = node.metadata.name.as_deref().unwrap_or(""),
                        error = %err,
                        "power provider failed; trying next"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ProfileError::NoProvider(node.metadata.name.clone().unwrap_or_default())
        }))
    }

    /// Everything profile resolution reads. Any change here must retire the
    /// cached profile.
    fn fingerprint(node: &Node) -> String {
        let label = |key: &str| crate::kubeutil::node_label(node, key).unwrap_or("");
        let annotation = |key: &str| crate::kubeutil::node_annotation(node, key).unwrap_or("");
        let capacity_cores = crate::kubeutil::node_capacity_cores(node);
        let memory_gb = crate::kubeutil::node_memory_gb(node);
        let gpu_count = crate::kubeutil::node_gpu_count(node);
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            label(INSTANCE_TYPE_LABEL),
            label(ARCH_LABEL),
            capacity_cores,
            memory_gb,
            gpu_count,
            label(NFD_CPU_VENDOR_LABEL),
            label(NFD_CPU_FAMILY_LABEL),
            label(NFD_CPU_ID_LABEL),
            label(NFD_PSTATE_GOVERNOR_LABEL),
            label(NFD_PSTATE_STATUS_LABEL),
            label(NFD_PSTATE_TURBO_LABEL),
            annotation(crate::annotations::NODE_IDLE_WATTS),
            annotation(crate::annotations::NODE_MAX_WATTS),
        )
    }

    /// Effective node power under PUE overheads. The GPU term contributes
    /// only for GPU workloads, optionally scaled by a workload coefficient.
    pub fn effective_power(
        &self,
        profile: &NodePowerProfile,
        idle: bool,
        include_gpu: bool,
        workload_type: Option<&str>,
    ) -> f64 {
        let cpu_mem = if idle {
            profile.idle_watts
        } else {
            profile.max_watts
        };
        let mut total = cpu_mem * profile.pue;
        if include_gpu {
            let gpu = if idle {
                profile.idle_gpu_watts
            } else {
                profile.max_gpu_watts
            };
            let coefficient = workload_type
                .and_then(|tag| self.config.workload_coefficients.get(tag))
                .copied()
                .unwrap_or(1.0);
            total += gpu * coefficient * profile.gpu_pue;
        }
        total
    }

    /// Cores per effective max watt; higher is better.
    pub fn efficiency(
        &self,
        cores: f64,
        profile: &NodePowerProfile,
        include_gpu: bool,
        workload_type: Option<&str>,
    ) -> f64 {
        let effective = self.effective_power(profile, false, include_gpu, workload_type);
        if effective <= 0.0 {
            return 0.0;
        }
        cores / effective
    }

    /// Live CPU frequency for a node, if the time-series store tracks one.
    pub async fn current_frequency_ghz(&self, node_name: &str) -> Option<f64> {
        let client = self.timeseries.as_ref()?;
        let query = format!(
            "avg({}{{node=\"{}\"}})",
            self.frequency_metric, node_name
        );
        match client.query_instant(&query).await {
            Ok(samples) => samples.first().map(|sample| sample.value),
            Err(err) => {
                debug!(node = node_name, error = %err, "frequency query failed");
                None
            }
        }
    }
}

/// Scales a power figure by the frequency ratio per the configured scaling
/// law.
pub fn adjust_for_frequency(power: f64, ratio: f64, scaling: PowerScaling) -> f64 {
    if ratio <= 0.0 {
        return power;
    }
    let factor = match scaling {
        PowerScaling::Linear => ratio,
        PowerScaling::Quadratic => ratio * ratio,
        PowerScaling::Cubic => ratio * ratio * ratio,
    };
    power * factor
}

pub fn frequency_ratio(profile: &NodePowerProfile, current_ghz: f64) -> Option<f64> {
    let base = profile.base_frequency_ghz?;
    if base <= 0.0 || current_ghz <= 0.0 {
        return None;
    }
    Some(current_ghz / base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PowerRange;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    pub(crate) fn test_node(name: &str, uid: &str, cores: &str, memory: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.metadata.uid = Some(uid.to_string());
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_string(), Quantity(cores.to_string()));
        capacity.insert("memory".to_string(), Quantity(memory.to_string()));
        node.status = Some(NodeStatus {
            capacity: Some(capacity),
            ..Default::default()
        });
        node
    }

    fn annotated_node() -> Node {
        let mut node = test_node("node-1", "uid-1", "8", "32Gi");
        let mut annotations = BTreeMap::new();
        annotations.insert(
            crate::annotations::NODE_IDLE_WATTS.to_string(),
            "50".to_string(),
        );
        annotations.insert(
            crate::annotations::NODE_MAX_WATTS.to_string(),
            "250".to_string(),
        );
        node.metadata.annotations = Some(annotations);
        node
    }

    fn profiler(config: HardwareConfig) -> HardwareProfiler {
        HardwareProfiler::with_default_providers(
            config,
            None,
            None,
            "node_cpu_frequency_ghz".to_string(),
        )
    }

    #[test]
    fn annotation_provider_outranks_fallback() {
        let profiler = profiler(HardwareConfig::default());
        let profile = profiler.get_profile(&annotated_node()).expect("profile");
        assert_eq!(profile.provider, "annotation");
        assert_eq!(profile.idle_watts, 50.0);
        assert_eq!(profile.max_watts, 250.0);
    }

    #[test]
    fn cache_hit_until_labels_change() {
        let profiler = profiler(HardwareConfig::default());
        let mut node = annotated_node();
        profiler.get_profile(&node).expect("profile");

        // Same fingerprint: cached.
        let cached = profiler.get_profile(&node).expect("profile");
        assert_eq!(cached.max_watts, 250.0);

        // Annotation change invalidates.
        node.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(crate::annotations::NODE_MAX_WATTS.to_string(), "300".to_string());
        let refreshed = profiler.get_profile(&node).expect("profile");
        assert_eq!(refreshed.max_watts, 300.0);
    }

    #[test]
    fn fallback_always_produces_a_profile() {
        let profiler = profiler(HardwareConfig::default());
        let node = test_node("node-2", "uid-2", "4", "16Gi");
        let profile = profiler.get_profile(&node).expect("profile");
        assert_eq!(profile.provider, "fallback");
        assert!(profile.max_watts > profile.idle_watts);
        assert!(profile.idle_watts > 0.0);
    }

    #[test]
    fn effective_power_applies_pue_and_workload() {
        let mut config = HardwareConfig::default();
        config
            .workload_coefficients
            .insert("inference".to_string(), 0.5);
        let profiler = profiler(config);
        let profile = NodePowerProfile {
            idle_watts: 50.0,
            max_watts: 200.0,
            idle_gpu_watts: 30.0,
            max_gpu_watts: 300.0,
            pue: 1.15,
            gpu_pue: 1.2,
            base_frequency_ghz: None,
            power_scaling: PowerScaling::Quadratic,
            provider: "test",
            provider_type: ProviderType::Estimated,
        };

        let cpu_only = profiler.effective_power(&profile, false, false, None);
        assert!((cpu_only - 230.0).abs() < 1e-9);

        let with_gpu = profiler.effective_power(&profile, false, true, None);
        assert!((with_gpu - (230.0 + 360.0)).abs() < 1e-9);

        let inference = profiler.effective_power(&profile, false, true, Some("inference"));
        assert!((inference - (230.0 + 180.0)).abs() < 1e-9);
    }

    #[test]
    fn frequency_scaling_laws() {
        assert_eq!(adjust_for_frequency(100.0, 0.5, PowerScaling::Linear), 50.0);
        assert_eq!(adjust_for_frequency(100.0, 0.5, PowerScaling::Quadratic), 25.0);
        assert_eq!(adjust_for_frequency(100.0, 0.5, PowerScaling::Cubic), 12.5);
        // Unusable ratio leaves power untouched.
        assert_eq!(adjust_for_frequency(100.0, 0.0, PowerScaling::Cubic), 100.0);
    }

    #[test]
    fn nfd_labels_join_against_cpu_table() {
        let mut config = HardwareConfig::default();
        config.cpu_profiles.insert(
            "Intel Xeon Platinum 8275CL".to_string(),
            PowerRange {
                idle_watts: 85.0,
                max_watts: 340.0,
            },
        );
        config.nfd_cpu_models.insert(
            "GenuineIntel".to_string(),
            HashMap::from([(
                "6-85".to_string(),
                "Intel Xeon Platinum 8275CL".to_string(),
            )]),
        );
        let profiler = profiler(config);

        let mut node = test_node("node-3", "uid-3", "48", "192Gi");
        let mut labels = BTreeMap::new();
        labels.insert(NFD_CPU_VENDOR_LABEL.to_string(), "GenuineIntel".to_string());
        labels.insert(NFD_CPU_FAMILY_LABEL.to_string(), "6".to_string());
        labels.insert(NFD_CPU_ID_LABEL.to_string(), "85".to_string());
        node.metadata.labels = Some(labels);

        let profile = profiler.get_profile(&node).expect("profile");
        assert_eq!(profile.provider, "nfd-label");
        // Table watts plus the memory contribution.
        let memory_idle = MEMORY_BASE_WATTS + MEMORY_IDLE_WATTS_PER_GB * 192.0;
        assert!((profile.idle_watts - (85.0 + memory_idle)).abs() < 1e-9);
    }
}
