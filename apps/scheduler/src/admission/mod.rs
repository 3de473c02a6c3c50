use crate::annotations;
use crate::carbon::CarbonDataSource;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::deferral::DeferralSets;
use crate::hardware::{self, HardwareProfiler};
use crate::kubeutil::{self, ClusterPatcher};
use crate::metrics;
use crate::pricing::PriceOracle;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Hook outcome handed back to the host scheduler. `Error` is distinct from
/// `Unschedulable`: it surfaces operator mistakes instead of deferring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Success(Option<String>),
    Unschedulable(String),
    Error(String),
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success(_))
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Status::Success(message) => message.as_deref(),
            Status::Unschedulable(message) | Status::Error(message) => Some(message),
        }
    }
}

/// Per-scheduling-cycle scratch state, keyed by pod UID. Entries expire so
/// abandoned cycles do not accumulate.
#[derive(Debug, Clone)]
struct CycleState {
    passed_prefilter: bool,
    touched: DateTime<Utc>,
}

const CYCLE_STATE_TTL_MINUTES: i64 = 10;

/// The deferral decision engine behind the PreFilter and Filter hooks.
pub struct AdmissionEngine {
    config: Arc<SchedulerConfig>,
    clock: Arc<dyn Clock>,
    carbon: Option<Arc<dyn CarbonDataSource>>,
    oracle: Option<Arc<dyn PriceOracle>>,
    profiler: Option<Arc<HardwareProfiler>>,
    patcher: Arc<dyn ClusterPatcher>,
    deferral: Arc<DeferralSets>,
    cycle_state: Mutex<HashMap<String, CycleState>>,
}

impl AdmissionEngine {
    pub fn new(
        config: Arc<SchedulerConfig>,
        clock: Arc<dyn Clock>,
        carbon: Option<Arc<dyn CarbonDataSource>>,
        oracle: Option<Arc<dyn PriceOracle>>,
        profiler: Option<Arc<HardwareProfiler>>,
        patcher: Arc<dyn ClusterPatcher>,
        deferral: Arc<DeferralSets>,
    ) -> Self {
        Self {
            config,
            clock,
            carbon,
            oracle,
            profiler,
            patcher,
            deferral,
            cycle_state: Mutex::new(HashMap::new()),
        }
    }

    pub async fn pre_filter(&self, pod: &Pod) -> Status {
        let started = std::time::Instant::now();
        let (status, result) = self.pre_filter_inner(pod).await;
        metrics::SCHEDULING_ATTEMPT_TOTAL
            .with_label_values(&[result])
            .inc();
        metrics::POD_SCHEDULING_DURATION_SECONDS
            .with_label_values(&[result])
            .observe(started.elapsed().as_secs_f64());
        status
    }

    async fn pre_filter_inner(&self, pod: &Pod) -> (Status, &'static str) {
        let now = self.clock.now();
        let uid = kubeutil::pod_uid(pod);

        // Deadline first: a pod that has waited out its maximum delay is
        // admitted no matter what the grid looks like.
        let max_delay = match annotations::parse_duration(pod, annotations::MAX_SCHEDULING_DELAY) {
            Ok(Some(override_delay)) => override_delay,
            Ok(None) => self.config.max_scheduling_delay(),
            Err(err) => return (Status::Error(err.to_string()), "error"),
        };
        if let Some(created) = pod.metadata.creation_timestamp.as_ref() {
            let waited = now - created.0;
            if waited > Duration::from_std(max_delay).unwrap_or_else(|_| Duration::hours(24)) {
                info!(
                    pod = kubeutil::pod_name(pod),
                    waited_seconds = waited.num_seconds(),
                    "maximum scheduling delay exceeded; admitting"
                );
                self.mark_passed(uid, now);
                return (
                    Status::Success(Some("maximum scheduling delay exceeded".to_string())),
                    "max_delay_exceeded",
                );
            }
        }

        match annotations::parse_bool(pod, annotations::SKIP) {
            Ok(Some(true)) => {
                self.mark_passed(uid, now);
                return (Status::Success(None), "skipped");
            }
            Ok(_) => {}
            Err(err) => return (Status::Error(err.to_string()), "error"),
        }

        // Whatever this evaluation observes is stamped as the initial
        // condition, whether the pod is deferred or admitted outright.
        let mut observed_rate = None;
        let mut observed_intensity = None;

        if let Some(oracle) = self.oracle.as_ref() {
            let check = match oracle.check_constraints(pod, now) {
                Ok(check) => check,
                Err(err) => return (Status::Error(err.to_string()), "error"),
            };
            metrics::ELECTRICITY_RATE
                .with_label_values(&[&self.config.pricing.location, check.period.as_str()])
                .set(check.rate);
            observed_rate = Some(check.rate);
            if check.exceeds {
                metrics::PRICE_DELAY_TOTAL
                    .with_label_values(&[check.period.as_str()])
                    .inc();
                self.deferral.defer_price(uid);
                self.stamp_initial(pod, observed_intensity, observed_rate, now)
                    .await;
                return (
                    Status::Unschedulable(format!(
                        "Current electricity rate (${:.4}/kWh) exceeds threshold (${:.4}/kWh)",
                        check.rate, check.threshold
                    )),
                    "price_deferred",
                );
            }
        }

        if let Some(carbon) = self.carbon.as_ref() {
            let enabled = match annotations::parse_bool(pod, annotations::CARBON_ENABLED) {
                Ok(Some(enabled)) => enabled,
                Ok(None) => true,
                Err(err) => return (Status::Error(err.to_string()), "error"),
            };
            if enabled {
                let threshold = match annotations::parse_f64(
                    pod,
                    annotations::CARBON_INTENSITY_THRESHOLD,
                ) {
                    Ok(Some(threshold)) => threshold,
                    Ok(None) => self.config.carbon.intensity_threshold,
                    Err(err) => return (Status::Error(err.to_string()), "error"),
                };
                let region = self.config.carbon.region.as_str();
                match carbon.get_intensity(region).await {
                    Ok(record) => {
                        metrics::CARBON_INTENSITY
                            .with_label_values(&[region])
                            .set(record.intensity);
                        observed_intensity = Some(record.intensity);
                        if record.intensity > threshold {
                            metrics::CARBON_DELAY_TOTAL
                                .with_label_values(&[region])
                                .inc();
                            self.deferral.defer_carbon(uid);
                            self.stamp_initial(pod, observed_intensity, observed_rate, now)
                                .await;
                            return (
                                Status::Unschedulable(format!(
                                    "Current carbon intensity ({:.2}) exceeds threshold ({:.2})",
                                    record.intensity, threshold
                                )),
                                "carbon_deferred",
                            );
                        }
                    }
                    Err(err) => {
                        // An unavailable signal never blocks scheduling; the
                        // health check keeps failing until the source heals.
                        warn!(region, "carbon check skipped: {err}");
                        metrics::SCHEDULING_ATTEMPT_TOTAL
                            .with_label_values(&["carbon_unavailable"])
                            .inc();
                    }
                }
            }
        }

        self.stamp_initial(pod, observed_intensity, observed_rate, now)
            .await;
        self.mark_passed(uid, now);
        (Status::Success(None), "success")
    }

    pub async fn filter(&self, pod: &Pod, node: &Node) -> Status {
        let uid = kubeutil::pod_uid(pod);
        if !self.passed_prefilter(uid) {
            // Test harnesses call Filter in isolation; tolerated.
            debug!(pod = kubeutil::pod_name(pod), "no prefilter cycle state");
        }

        let Some(profiler) = self.profiler.as_ref() else {
            return Status::Success(None);
        };
        let node_name = node.metadata.name.as_deref().unwrap_or("");

        let profile = match profiler.get_profile(node) {
            Ok(profile) => profile,
            Err(err) => {
                // Fail open: a node we cannot profile is not a node we veto.
                warn!(node = node_name, "hardware profile unavailable: {err}");
                return Status::Success(None);
            }
        };

        let cores = kubeutil::node_capacity_cores(node);
        let include_gpu = kubeutil::requests_gpu(pod);
        let workload = annotations::get(pod, annotations::GPU_WORKLOAD_TYPE);
        metrics::NODE_PUE.with_label_values(&[node_name]).set(profile.pue);
        metrics::NODE_EFFICIENCY
            .with_label_values(&[node_name])
            .set(profiler.efficiency(cores, &profile, include_gpu, workload));

        let max_power = match annotations::parse_f64(pod, annotations::MAX_POWER_WATTS) {
            Ok(value) => value,
            Err(err) => return Status::Error(err.to_string()),
        };
        if let Some(max_power) = max_power {
            let mut effective = profiler.effective_power(&profile, false, include_gpu, workload);
            if let Some(current) = profiler.current_frequency_ghz(node_name).await {
                if let Some(ratio) = hardware::frequency_ratio(&profile, current) {
                    effective =
                        hardware::adjust_for_frequency(effective, ratio, profile.power_scaling);
                }
            }
            if effective > max_power {
                metrics::POWER_FILTERED_NODES_TOTAL
                    .with_label_values(&["max_power"])
                    .inc();
                return Status::Unschedulable(format!(
                    "node {node_name} effective power ({effective:.1} W) exceeds limit ({max_power:.1} W)"
                ));
            }
        }

        let min_efficiency = match annotations::parse_f64(pod, annotations::MIN_EFFICIENCY) {
            Ok(value) => value,
            Err(err) => return Status::Error(err.to_string()),
        };
        if let Some(min_efficiency) = min_efficiency {
            let efficiency = profiler.efficiency(cores, &profile, include_gpu, workload);
            if efficiency < min_efficiency {
                metrics::POWER_FILTERED_NODES_TOTAL
                    .with_label_values(&["efficiency"])
                    .inc();
                return Status::Unschedulable(format!(
                    "node {node_name} efficiency ({efficiency:.4} cores/W) below minimum ({min_efficiency:.4})"
                ));
            }
        }

        Status::Success(None)
    }

    /// Post-bind observation: stamps the bind-time conditions once the host
    /// scheduler has placed the pod.
    pub async fn post_bind(&self, pod: &Pod) {
        let now = self.clock.now();
        let mut stamp = BTreeMap::new();
        if annotations::get(pod, annotations::BIND_TIMESTAMP).is_none() {
            stamp.insert(annotations::BIND_TIMESTAMP.to_string(), now.to_rfc3339());
        }
        if annotations::get(pod, annotations::BIND_CARBON_INTENSITY).is_none() {
            if let Some(carbon) = self.carbon.as_ref() {
                if let Ok(record) = carbon.get_intensity(&self.config.carbon.region).await {
                    stamp.insert(
                        annotations::BIND_CARBON_INTENSITY.to_string(),
                        format!("{:.2}", record.intensity),
                    );
                }
            }
        }
        if annotations::get(pod, annotations::BIND_ELECTRICITY_RATE).is_none() {
            if let Some(oracle) = self.oracle.as_ref() {
                stamp.insert(
                    annotations::BIND_ELECTRICITY_RATE.to_string(),
                    format!("{:.4}", oracle.current_rate(now)),
                );
            }
        }
        if stamp.is_empty() {
            return;
        }
        if let Err(err) = self
            .patcher
            .patch_pod_annotations(kubeutil::pod_namespace(pod), kubeutil::pod_name(pod), stamp)
            .await
        {
            warn!(pod = kubeutil::pod_name(pod), "bind stamping failed: {err:#}");
        }
        self.clear_cycle(kubeutil::pod_uid(pod));
    }

    /// Writes the initial-condition fingerprint exactly once. Keys already
    /// on the pod are never overwritten.
    async fn stamp_initial(
        &self,
        pod: &Pod,
        intensity: Option<f64>,
        rate: Option<f64>,
        now: DateTime<Utc>,
    ) {
        let mut stamp = BTreeMap::new();
        if annotations::get(pod, annotations::INITIAL_TIMESTAMP).is_none() {
            stamp.insert(annotations::INITIAL_TIMESTAMP.to_string(), now.to_rfc3339());
        }
        if let Some(intensity) = intensity {
            if annotations::get(pod, annotations::INITIAL_CARBON_INTENSITY).is_none() {
                stamp.insert(
                    annotations::INITIAL_CARBON_INTENSITY.to_string(),
                    format!("{intensity:.2}"),
                );
            }
        }
        if let Some(rate) = rate {
            if annotations::get(pod, annotations::INITIAL_ELECTRICITY_RATE).is_none() {
                stamp.insert(
                    annotations::INITIAL_ELECTRICITY_RATE.to_string(),
                    format!("{rate:.4}"),
                );
            }
        }
        if stamp.is_empty() {
            return;
        }
        if let Err(err) = self
            .patcher
            .patch_pod_annotations(kubeutil::pod_namespace(pod), kubeutil::pod_name(pod), stamp)
            .await
        {
            warn!(pod = kubeutil::pod_name(pod), "initial stamping failed: {err:#}");
        }
    }

    fn mark_passed(&self, uid: &str, now: DateTime<Utc>) {
        let mut state = self.cycle_state.lock().expect("cycle state poisoned");
        if state.len() > 1024 {
            let horizon = now - Duration::minutes(CYCLE_STATE_TTL_MINUTES);
            state.retain(|_, entry| entry.touched > horizon);
        }
        state.insert(
            uid.to_string(),
            CycleState {
                passed_prefilter: true,
                touched: now,
            },
        );
    }

    fn passed_prefilter(&self, uid: &str) -> bool {
        self.cycle_state
            .lock()
            .expect("cycle state poisoned")
            .get(uid)
            .map(|entry| entry.passed_prefilter)
            .unwrap_or(false)
    }

    fn clear_cycle(&self, uid: &str) {
        self.cycle_state
            .lock()
            .expect("cycle state poisoned")
            .remove(uid);
    }
}
