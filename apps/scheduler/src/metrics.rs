use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_gauge_vec, register_histogram_vec, register_int_counter_vec, Encoder,
    Gauge, GaugeVec, HistogramVec, IntCounterVec, TextEncoder,
};

/// Fixed metric catalog. Registered once into the process-global registry;
/// everything here is safe for concurrent use.

pub static CARBON_INTENSITY: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "carbon_intensity",
        "Current carbon intensity (gCO2/kWh) by region",
        &["region"]
    )
    .expect("register carbon_intensity")
});

pub static ELECTRICITY_RATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "electricity_rate",
        "Current electricity rate ($/kWh)",
        &["location", "period"]
    )
    .expect("register electricity_rate")
});

pub static NODE_CPU_USAGE_CORES: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "node_cpu_usage_cores",
        "Sampled pod CPU usage in cores",
        &["node", "pod", "phase"]
    )
    .expect("register node_cpu_usage_cores")
});

pub static NODE_MEMORY_USAGE_BYTES: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "node_memory_usage_bytes",
        "Sampled pod memory usage in bytes",
        &["node", "pod", "phase"]
    )
    .expect("register node_memory_usage_bytes")
});

pub static NODE_GPU_POWER_WATTS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "node_gpu_power_watts",
        "Attributed pod GPU power in watts",
        &["node", "pod", "phase"]
    )
    .expect("register node_gpu_power_watts")
});

pub static NODE_POWER_ESTIMATE_WATTS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "node_power_estimate_watts",
        "Estimated total pod power draw in watts",
        &["node", "pod", "phase"]
    )
    .expect("register node_power_estimate_watts")
});

pub static METRICS_SAMPLES_STORED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "metrics_samples_stored",
        "Samples currently held for a pod",
        &["pod", "namespace"]
    )
    .expect("register metrics_samples_stored")
});

pub static METRICS_CACHE_SIZE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "metrics_cache_size",
        "Pod histories currently held in memory"
    )
    .expect("register metrics_cache_size")
});

pub static JOB_ENERGY_USAGE_KWH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "job_energy_usage_kwh",
        "Integrated job energy in kWh",
        &["pod", "namespace"]
    )
    .expect("register job_energy_usage_kwh")
});

pub static JOB_GPU_ENERGY_USAGE_KWH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "job_gpu_energy_usage_kwh",
        "Integrated job GPU energy in kWh",
        &["pod", "namespace"]
    )
    .expect("register job_gpu_energy_usage_kwh")
});

pub static JOB_CARBON_EMISSIONS_GRAMS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "job_carbon_emissions_grams",
        "Integrated job emissions in gCO2",
        &["pod", "namespace"]
    )
    .expect("register job_carbon_emissions_grams")
});

pub static JOB_COUNTERFACTUAL_EMISSIONS_GRAMS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "job_counterfactual_carbon_emissions_grams",
        "Emissions had the job started when first deferred, in gCO2",
        &["pod", "namespace"]
    )
    .expect("register job_counterfactual_carbon_emissions_grams")
});

pub static ESTIMATED_SAVINGS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "estimated_savings",
        "Estimated savings from deferral; may be negative",
        &["type", "unit", "method", "pod", "namespace"]
    )
    .expect("register estimated_savings")
});

pub static SCHEDULING_EFFICIENCY: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "scheduling_efficiency",
        "Per-pod scheduling outcome deltas",
        &["metric", "pod"]
    )
    .expect("register scheduling_efficiency")
});

pub static NODE_PUE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!("node_pue", "Effective PUE used for a node", &["node"])
        .expect("register node_pue")
});

pub static NODE_EFFICIENCY: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "node_efficiency",
        "Cores per effective watt for a node",
        &["node"]
    )
    .expect("register node_efficiency")
});

pub static ENERGY_BUDGET_USAGE_PERCENT: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "energy_budget_usage_percent",
        "Energy consumed as a percentage of the pod budget",
        &["pod", "namespace"]
    )
    .expect("register energy_budget_usage_percent")
});

pub static SCHEDULING_ATTEMPT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "scheduling_attempt_total",
        "PreFilter outcomes by result",
        &["result"]
    )
    .expect("register scheduling_attempt_total")
});

pub static PRICE_DELAY_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "price_delay_total",
        "Pods deferred because of the electricity rate",
        &["period"]
    )
    .expect("register price_delay_total")
});

pub static CARBON_DELAY_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "carbon_delay_total",
        "Pods deferred because of carbon intensity",
        &["region"]
    )
    .expect("register carbon_delay_total")
});

pub static ENERGY_BUDGET_EXCEEDED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "energy_budget_exceeded_total",
        "Energy budget breaches by consequence",
        &["namespace", "owner_kind", "action"]
    )
    .expect("register energy_budget_exceeded_total")
});

pub static POWER_FILTERED_NODES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "power_filtered_nodes_total",
        "Nodes rejected by power or efficiency filters",
        &["reason"]
    )
    .expect("register power_filtered_nodes_total")
});

pub static METRICS_COLLECTION_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "metrics_collection_errors_total",
        "Collector ticks that skipped a pod or source",
        &["reason"]
    )
    .expect("register metrics_collection_errors_total")
});

pub static POD_SCHEDULING_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "pod_scheduling_duration_seconds",
        "PreFilter evaluation latency",
        &["result"]
    )
    .expect("register pod_scheduling_duration_seconds")
});

/// Sets the four per-pod sampling gauges for one phase.
pub fn set_pod_phase_gauges(
    node: &str,
    pod: &str,
    phase: &str,
    cpu_cores: f64,
    memory_bytes: f64,
    gpu_power_w: f64,
    total_power_w: f64,
) {
    NODE_CPU_USAGE_CORES
        .with_label_values(&[node, pod, phase])
        .set(cpu_cores);
    NODE_MEMORY_USAGE_BYTES
        .with_label_values(&[node, pod, phase])
        .set(memory_bytes);
    NODE_GPU_POWER_WATTS
        .with_label_values(&[node, pod, phase])
        .set(gpu_power_w);
    NODE_POWER_ESTIMATE_WATTS
        .with_label_values(&[node, pod, phase])
        .set(total_power_w);
}

/// Renders the whole registry in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_registers_once() {
        CARBON_INTENSITY.with_label_values(&["DE"]).set(250.0);
        SCHEDULING_ATTEMPT_TOTAL.with_label_values(&["success"]).inc();
        POD_SCHEDULING_DURATION_SECONDS
            .with_label_values(&["success"])
            .observe(0.002);

        let rendered = render();
        assert!(rendered.contains("carbon_intensity"));
        assert!(rendered.contains("scheduling_attempt_total"));
    }

    #[test]
    fn phase_gauges_can_be_zeroed() {
        set_pod_phase_gauges("node-1", "job-a", "current", 1.5, 1024.0, 50.0, 120.0);
        set_pod_phase_gauges("node-1", "job-a", "current", 0.0, 0.0, 0.0, 0.0);
        let value = NODE_POWER_ESTIMATE_WATTS
            .with_label_values(&["node-1", "job-a", "current"])
            .get();
        assert_eq!(value, 0.0);
    }
}
