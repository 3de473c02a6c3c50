use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("time-of-use window {index}: {reason}")]
    InvalidWindow { index: usize, reason: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Deadline after which a pending pod is admitted regardless of carbon
    /// or price. Overridable per pod via annotation.
    #[serde(default = "default_max_delay_seconds")]
    pub max_scheduling_delay_seconds: u64,
    #[serde(default)]
    pub carbon: CarbonConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub timeseries: Option<TimeSeriesConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CarbonConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_carbon_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub region: String,
    /// gCO2/kWh above which pods are deferred (strict greater-than).
    #[serde(default = "default_carbon_threshold")]
    pub intensity_threshold: f64,
    #[serde(default = "default_api_timeout_seconds")]
    pub api_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound on API calls per second, shared across all callers.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: f64,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_cache_max_age_seconds")]
    pub cache_max_age_seconds: u64,
    #[serde(default = "default_cache_cleanup_seconds")]
    pub cache_cleanup_seconds: u64,
    #[serde(default = "default_health_check_seconds")]
    pub health_check_seconds: u64,
}

impl Default for CarbonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_carbon_base_url(),
            api_key: String::new(),
            region: String::new(),
            intensity_threshold: default_carbon_threshold(),
            api_timeout_seconds: default_api_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            rate_limit_per_second: default_rate_limit(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            cache_max_age_seconds: default_cache_max_age_seconds(),
            cache_cleanup_seconds: default_cache_cleanup_seconds(),
            health_check_seconds: default_health_check_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub schedules: Vec<TouWindowConfig>,
}

/// One time-of-use window. `day_of_week` is a comma list of 0..6 with
/// Sunday = 0; times are `HH:MM` local to the cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TouWindowConfig {
    pub day_of_week: String,
    pub start_time: String,
    pub end_time: String,
    pub peak_rate: f64,
    pub off_peak_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_pue")]
    pub default_pue: f64,
    #[serde(default = "default_gpu_pue")]
    pub default_gpu_pue: f64,
    #[serde(default = "default_power_scaling")]
    pub power_scaling: PowerScaling,
    /// CPU model string -> idle/max watts.
    #[serde(default)]
    pub cpu_profiles: HashMap<String, PowerRange>,
    /// GPU product string -> idle/max watts.
    #[serde(default)]
    pub gpu_profiles: HashMap<String, PowerRange>,
    #[serde(default)]
    pub memory_profile: Option<MemoryPowerProfile>,
    /// Cloud instance type -> full power description.
    #[serde(default)]
    pub instance_profiles: HashMap<String, InstancePowerProfile>,
    /// NFD vendor id -> "family-model" -> CPU model string, used to join
    /// node labels against `cpu_profiles`.
    #[serde(default)]
    pub nfd_cpu_models: HashMap<String, HashMap<String, String>>,
    /// Workload tag -> GPU power coefficient.
    #[serde(default)]
    pub workload_coefficients: HashMap<String, f64>,
    /// Metric published by a measured-power exporter, keyed by node. When
    /// set, measured readings outrank every estimate.
    #[serde(default)]
    pub measured_power_metric: Option<String>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_pue: default_pue(),
            default_gpu_pue: default_gpu_pue(),
            power_scaling: default_power_scaling(),
            cpu_profiles: HashMap::new(),
            gpu_profiles: HashMap::new(),
            memory_profile: None,
            instance_profiles: HashMap::new(),
            nfd_cpu_models: HashMap::new(),
            workload_coefficients: HashMap::new(),
            measured_power_metric: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PowerRange {
    pub idle_watts: f64,
    pub max_watts: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MemoryPowerProfile {
    pub base_watts: f64,
    pub idle_watts_per_gb: f64,
    pub max_watts_per_gb: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstancePowerProfile {
    pub idle_watts: f64,
    pub max_watts: f64,
    #[serde(default)]
    pub idle_gpu_watts: f64,
    #[serde(default)]
    pub max_gpu_watts: f64,
    #[serde(default)]
    pub pue: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerScaling {
    Linear,
    #[default]
    Quadratic,
    Cubic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DownsamplingKind {
    #[default]
    Lttb,
    RecencyWeighted,
    MinMax,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default = "default_sampling_seconds")]
    pub sampling_interval_seconds: u64,
    #[serde(default = "default_max_records")]
    pub max_records_per_pod: usize,
    #[serde(default)]
    pub downsampling: DownsamplingKind,
    #[serde(default = "default_retention_seconds")]
    pub completed_retention_seconds: u64,
    #[serde(default = "default_cleanup_seconds")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_budget_seconds")]
    pub budget_check_seconds: u64,
    /// Optional delay before completion processing, to let backing metric
    /// systems flush.
    #[serde(default)]
    pub completion_delay_seconds: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sampling_interval_seconds: default_sampling_seconds(),
            max_records_per_pod: default_max_records(),
            downsampling: DownsamplingKind::default(),
            completed_retention_seconds: default_retention_seconds(),
            cleanup_interval_seconds: default_cleanup_seconds(),
            budget_check_seconds: default_budget_seconds(),
            completion_delay_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeSeriesConfig {
    pub prometheus_url: String,
    #[serde(default = "default_ts_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_intensity_metric")]
    pub carbon_intensity_metric: String,
    #[serde(default = "default_frequency_metric")]
    pub cpu_frequency_metric: String,
    #[serde(default = "default_gpu_power_metric")]
    pub gpu_power_metric: String,
}

fn default_scheduler_name() -> String {
    "compute-gardener-scheduler".to_string()
}
fn default_listen_addr() -> String {
    "0.0.0.0:8444".to_string()
}
fn default_max_delay_seconds() -> u64 {
    24 * 3600
}
fn default_carbon_base_url() -> String {
    "https://api.electricitymap.org/v3/carbon-intensity/latest?zone=".to_string()
}
fn default_carbon_threshold() -> f64 {
    200.0
}
fn default_api_timeout_seconds() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_rate_limit() -> f64 {
    2.0
}
fn default_cache_ttl_seconds() -> u64 {
    300
}
fn default_cache_max_age_seconds() -> u64 {
    1800
}
fn default_cache_cleanup_seconds() -> u64 {
    600
}
fn default_health_check_seconds() -> u64 {
    60
}
fn default_pue() -> f64 {
    1.15
}
fn default_gpu_pue() -> f64 {
    1.2
}
fn default_power_scaling() -> PowerScaling {
    PowerScaling::Quadratic
}
fn default_sampling_seconds() -> u64 {
    15
}
fn default_max_records() -> usize {
    500
}
fn default_retention_seconds() -> u64 {
    3600
}
fn default_cleanup_seconds() -> u64 {
    300
}
fn default_budget_seconds() -> u64 {
    300
}
fn default_ts_timeout_seconds() -> u64 {
    60
}
fn default_intensity_metric() -> String {
    "carbon_intensity".to_string()
}
fn default_frequency_metric() -> String {
    "node_cpu_frequency_ghz".to_string()
}
fn default_gpu_power_metric() -> String {
    "DCGM_FI_DEV_POWER_USAGE".to_string()
}

impl SchedulerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: SchedulerConfig = match path {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.display().to_string(),
                        source,
                    })?;
                serde_yaml::from_str(&contents)?
            }
            None => serde_yaml::from_str("{}")?,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment always wins over the file, mirroring how the rest of the
    /// fleet layers env on top of setup configs.
    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_string("CGS_LISTEN_ADDR") {
            self.listen_addr = value;
        }
        if let Some(value) = env_string("CGS_SCHEDULER_NAME") {
            self.scheduler_name = value;
        }
        if let Some(value) = env_string("CGS_CARBON_API_KEY") {
            self.carbon.api_key = value;
        }
        if let Some(value) = env_string("CGS_CARBON_API_URL") {
            self.carbon.base_url = value;
        }
        if let Some(value) = env_string("CGS_CARBON_REGION") {
            self.carbon.region = value;
        }
        if let Some(value) = env_parse::<f64>("CGS_CARBON_INTENSITY_THRESHOLD") {
            self.carbon.intensity_threshold = value;
        }
        if let Some(value) = env_parse::<u64>("CGS_MAX_SCHEDULING_DELAY_SECONDS") {
            self.max_scheduling_delay_seconds = value;
        }
        if let Some(value) = env_string("CGS_PROMETHEUS_URL") {
            match self.timeseries.as_mut() {
                Some(ts) => ts.prometheus_url = value,
                None => {
                    self.timeseries = Some(TimeSeriesConfig {
                        prometheus_url: value,
                        timeout_seconds: default_ts_timeout_seconds(),
                        carbon_intensity_metric: default_intensity_metric(),
                        cpu_frequency_metric: default_frequency_metric(),
                        gpu_power_metric: default_gpu_power_metric(),
                    });
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.carbon.enabled {
            if self.carbon.api_key.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "carbon.api_key is required when the carbon check is enabled".to_string(),
                ));
            }
            if self.carbon.region.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "carbon.region is required when the carbon check is enabled".to_string(),
                ));
            }
            if self.carbon.intensity_threshold < 0.0 {
                return Err(ConfigError::Invalid(
                    "carbon.intensity_threshold must be >= 0".to_string(),
                ));
            }
            if self.carbon.cache_max_age_seconds < self.carbon.cache_ttl_seconds {
                return Err(ConfigError::Invalid(
                    "carbon.cache_max_age_seconds must be >= cache_ttl_seconds".to_string(),
                ));
            }
            if self.carbon.rate_limit_per_second <= 0.0 {
                return Err(ConfigError::Invalid(
                    "carbon.rate_limit_per_second must be > 0".to_string(),
                ));
            }
        }
        if self.pricing.enabled && self.pricing.schedules.is_empty() {
            return Err(ConfigError::Invalid(
                "pricing.schedules must not be empty when pricing is enabled".to_string(),
            ));
        }
        for (index, window) in self.pricing.schedules.iter().enumerate() {
            validate_window(index, window)?;
        }
        if self.telemetry.max_records_per_pod < 2 {
            return Err(ConfigError::Invalid(
                "telemetry.max_records_per_pod must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_scheduling_delay(&self) -> Duration {
        Duration::from_secs(self.max_scheduling_delay_seconds)
    }
}

fn validate_window(index: usize, window: &TouWindowConfig) -> Result<(), ConfigError> {
    let days = parse_days(&window.day_of_week)
        .map_err(|reason| ConfigError::InvalidWindow { index, reason })?;
    if days.is_empty() {
        return Err(ConfigError::InvalidWindow {
            index,
            reason: "day_of_week selects no days".to_string(),
        });
    }
    let start = parse_minute_of_day(&window.start_time)
        .map_err(|reason| ConfigError::InvalidWindow { index, reason })?;
    let end = parse_minute_of_day(&window.end_time)
        .map_err(|reason| ConfigError::InvalidWindow { index, reason })?;
    if start >= end {
        return Err(ConfigError::InvalidWindow {
            index,
            reason: format!("start_time {} must precede end_time {}", window.start_time, window.end_time),
        });
    }
    if window.peak_rate < 0.0 || window.off_peak_rate < 0.0 {
        return Err(ConfigError::InvalidWindow {
            index,
            reason: "rates must be >= 0".to_string(),
        });
    }
    Ok(())
}

pub(crate) fn parse_days(spec: &str) -> Result<Vec<u8>, String> {
    let mut days = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let day: u8 = part
            .parse()
            .map_err(|_| format!("invalid day {part:?} (expected 0..6, Sunday=0)"))?;
        if day > 6 {
            return Err(format!("day {day} out of range 0..6"));
        }
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Ok(days)
}

pub(crate) fn parse_minute_of_day(spec: &str) -> Result<u32, String> {
    let (hours, minutes) = spec
        .split_once(':')
        .ok_or_else(|| format!("invalid time {spec:?} (expected HH:MM)"))?;
    let hours: u32 = hours
        .trim()
        .parse()
        .map_err(|_| format!("invalid hour in {spec:?}"))?;
    let minutes: u32 = minutes
        .trim()
        .parse()
        .map_err(|_| format!("invalid minute in {spec:?}"))?;
    if hours > 24 || minutes > 59 || (hours == 24 && minutes != 0) {
        return Err(format!("time {spec:?} out of range"));
    }
    Ok(hours * 60 + minutes)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse().ok())
}
