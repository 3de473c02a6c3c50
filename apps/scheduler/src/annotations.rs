use k8s_openapi::api::core::v1::Pod;
use std::time::Duration;
use thiserror::Error;

/// Pod and node annotation surface. All keys live under one prefix so a
/// `kubectl get pod -o yaml` groups them together.
pub const PREFIX: &str = "compute-gardener-scheduler.kubernetes.io/";

pub const SKIP: &str = "compute-gardener-scheduler.kubernetes.io/skip";
pub const MAX_SCHEDULING_DELAY: &str =
    "compute-gardener-scheduler.kubernetes.io/max-scheduling-delay";
pub const CARBON_ENABLED: &str = "compute-gardener-scheduler.kubernetes.io/carbon-enabled";
pub const CARBON_INTENSITY_THRESHOLD: &str =
    "compute-gardener-scheduler.kubernetes.io/carbon-intensity-threshold";
pub const PRICE_THRESHOLD: &str = "compute-gardener-scheduler.kubernetes.io/price-threshold";
pub const MAX_POWER_WATTS: &str = "compute-gardener-scheduler.kubernetes.io/max-power-watts";
pub const MIN_EFFICIENCY: &str = "compute-gardener-scheduler.kubernetes.io/min-efficiency";
pub const GPU_WORKLOAD_TYPE: &str = "compute-gardener-scheduler.kubernetes.io/gpu-workload-type";
pub const ENERGY_BUDGET_KWH: &str = "compute-gardener-scheduler.kubernetes.io/energy-budget-kwh";
pub const ENERGY_BUDGET_ACTION: &str =
    "compute-gardener-scheduler.kubernetes.io/energy-budget-action";

pub const INITIAL_CARBON_INTENSITY: &str =
    "compute-gardener-scheduler.kubernetes.io/initial-carbon-intensity";
pub const INITIAL_ELECTRICITY_RATE: &str =
    "compute-gardener-scheduler.kubernetes.io/initial-electricity-rate";
pub const INITIAL_TIMESTAMP: &str = "compute-gardener-scheduler.kubernetes.io/initial-timestamp";
pub const BIND_CARBON_INTENSITY: &str =
    "compute-gardener-scheduler.kubernetes.io/bind-carbon-intensity";
pub const BIND_ELECTRICITY_RATE: &str =
    "compute-gardener-scheduler.kubernetes.io/bind-electricity-rate";
pub const BIND_TIMESTAMP: &str = "compute-gardener-scheduler.kubernetes.io/bind-timestamp";

pub const ENERGY_USAGE_KWH: &str = "compute-gardener-scheduler.kubernetes.io/energy-usage-kwh";
pub const ENERGY_BUDGET_EXCEEDED: &str =
    "compute-gardener-scheduler.kubernetes.io/energy-budget-exceeded";
pub const ENERGY_BUDGET_EXCEEDED_BY: &str =
    "compute-gardener-scheduler.kubernetes.io/energy-budget-exceeded-by";

// Node annotation surface written by the node exporter / cluster operators.
pub const NODE_CPU_MODEL: &str = "compute-gardener-scheduler.kubernetes.io/cpu-model";
pub const NODE_CPU_BASE_FREQUENCY: &str =
    "compute-gardener-scheduler.kubernetes.io/cpu-base-frequency";
pub const NODE_CPU_MIN_FREQUENCY: &str =
    "compute-gardener-scheduler.kubernetes.io/cpu-min-frequency";
pub const NODE_CPU_MAX_FREQUENCY: &str =
    "compute-gardener-scheduler.kubernetes.io/cpu-max-frequency";
pub const NODE_GPU_MODEL: &str = "compute-gardener-scheduler.kubernetes.io/gpu-model";
pub const NODE_GPU_COUNT: &str = "compute-gardener-scheduler.kubernetes.io/gpu-count";
pub const NODE_IDLE_WATTS: &str = "compute-gardener-scheduler.kubernetes.io/idle-watts";
pub const NODE_MAX_WATTS: &str = "compute-gardener-scheduler.kubernetes.io/max-watts";
pub const NODE_IDLE_GPU_WATTS: &str = "compute-gardener-scheduler.kubernetes.io/idle-gpu-watts";
pub const NODE_MAX_GPU_WATTS: &str = "compute-gardener-scheduler.kubernetes.io/max-gpu-watts";
pub const NODE_PUE: &str = "compute-gardener-scheduler.kubernetes.io/pue";
pub const NODE_GPU_PUE: &str = "compute-gardener-scheduler.kubernetes.io/gpu-pue";

/// Operator mistakes in threshold annotations surface as scheduling errors,
/// not silent deferrals.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid value {value:?} for annotation {key}: {reason}")]
pub struct AnnotationError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

pub fn get<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

pub fn has(pod: &Pod, key: &str) -> bool {
    get(pod, key).is_some()
}

pub fn parse_f64(pod: &Pod, key: &str) -> Result<Option<f64>, AnnotationError> {
    match get(pod, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| AnnotationError {
                key: key.to_string(),
                value: raw.to_string(),
                reason: "expected a number".to_string(),
            }),
    }
}

pub fn parse_bool(pod: &Pod, key: &str) -> Result<Option<bool>, AnnotationError> {
    match get(pod, key) {
        None => Ok(None),
        Some(raw) => match raw.trim() {
            "true" | "True" | "1" => Ok(Some(true)),
            "false" | "False" | "0" => Ok(Some(false)),
            _ => Err(AnnotationError {
                key: key.to_string(),
                value: raw.to_string(),
                reason: "expected true or false".to_string(),
            }),
        },
    }
}

pub fn parse_duration(pod: &Pod, key: &str) -> Result<Option<Duration>, AnnotationError> {
    match get(pod, key) {
        None => Ok(None),
        Some(raw) => humantime::parse_duration(raw.trim())
            .map(Some)
            .map_err(|err| AnnotationError {
                key: key.to_string(),
                value: raw.to_string(),
                reason: err.to_string(),
            }),
    }
}

#[cfg(test)]
pub(crate) fn pod_with_annotations(pairs: &[(&str, &str)]) -> Pod {
    use std::collections::BTreeMap;

    let mut pod = Pod::default();
    let annotations: BTreeMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    pod.metadata.annotations = Some(annotations);
    pod
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thresholds() {
        let pod = pod_with_annotations(&[(PRICE_THRESHOLD, "0.25")]);
        assert_eq!(parse_f64(&pod, PRICE_THRESHOLD).unwrap(), Some(0.25));
        assert_eq!(parse_f64(&pod, CARBON_INTENSITY_THRESHOLD).unwrap(), None);
    }

    #[test]
    fn bad_float_is_an_error() {
        let pod = pod_with_annotations(&[(PRICE_THRESHOLD, "cheap")]);
        let err = parse_f64(&pod, PRICE_THRESHOLD).expect_err("must fail");
        assert_eq!(err.key, PRICE_THRESHOLD);
        assert_eq!(err.value, "cheap");
    }

    #[test]
    fn parses_durations() {
        let pod = pod_with_annotations(&[(MAX_SCHEDULING_DELAY, "2h")]);
        assert_eq!(
            parse_duration(&pod, MAX_SCHEDULING_DELAY).unwrap(),
            Some(Duration::from_secs(7200))
        );
    }

    #[test]
    fn parses_bools() {
        let pod = pod_with_annotations(&[(SKIP, "true"), (CARBON_ENABLED, "maybe")]);
        assert_eq!(parse_bool(&pod, SKIP).unwrap(), Some(true));
        assert!(parse_bool(&pod, CARBON_ENABLED).is_err());
    }
}
