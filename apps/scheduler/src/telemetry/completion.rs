use crate::annotations;
use crate::deferral::DeferralSets;
use crate::kubeutil::{self, ClusterPatcher};
use crate::metrics;
use crate::telemetry::budget::enforce_budget;
use crate::telemetry::counterfactual::CounterfactualEstimator;
use crate::telemetry::energy::{gpu_energy_kwh, total_emissions_grams, total_energy_kwh};
use crate::telemetry::{PodMetricsHistory, PodMetricsStorage};
use anyhow::Result;
use chrono::DateTime;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settles a finished pod: integrates its history, emits job metrics and
/// savings, enforces the energy budget, and retires the live gauges.
/// Idempotent through the store's completed flag.
pub struct CompletionHandler {
    store: Arc<dyn PodMetricsStorage>,
    deferral: Arc<DeferralSets>,
    patcher: Arc<dyn ClusterPatcher>,
    estimator: Option<Arc<CounterfactualEstimator>>,
    carbon_enabled: bool,
    /// Optional grace period so backing metric systems can flush.
    delay: Duration,
}

impl CompletionHandler {
    pub fn new(
        store: Arc<dyn PodMetricsStorage>,
        deferral: Arc<DeferralSets>,
        patcher: Arc<dyn ClusterPatcher>,
        estimator: Option<Arc<CounterfactualEstimator>>,
        carbon_enabled: bool,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            deferral,
            patcher,
            estimator,
            carbon_enabled,
            delay,
        }
    }

    pub async fn process(self: &Arc<Self>, uid: &str, pod: Option<&Pod>) {
        if self.delay.is_zero() {
            self.process_now(uid, pod).await;
            return;
        }
        let this = self.clone();
        let uid = uid.to_string();
        let pod = pod.cloned();
        tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;
            this.process_now(&uid, pod.as_ref()).await;
        });
    }

    pub async fn process_now(&self, uid: &str, pod: Option<&Pod>) {
        if !self.store.mark_completed(uid) {
            debug!(uid, "completion already processed");
            return;
        }
        let (was_carbon_deferred, was_price_deferred) = self.deferral.take(uid);
        let Some(history) = self.store.get(uid) else {
            return;
        };

        let energy_kwh = total_energy_kwh(&history.records);
        let gpu_kwh = gpu_energy_kwh(&history.records);
        let emissions_g = total_emissions_grams(&history.records);

        let pod_label = history.pod_name.as_str();
        let namespace = history.namespace.as_str();
        metrics::JOB_ENERGY_USAGE_KWH
            .with_label_values(&[pod_label, namespace])
            .set(energy_kwh);
        metrics::JOB_GPU_ENERGY_USAGE_KWH
            .with_label_values(&[pod_label, namespace])
            .set(gpu_kwh);
        metrics::JOB_CARBON_EMISSIONS_GRAMS
            .with_label_values(&[pod_label, namespace])
            .set(emissions_g);

        info!(
            pod = pod_label,
            namespace,
            energy_kwh,
            emissions_g,
            was_carbon_deferred,
            was_price_deferred,
            "pod completed"
        );

        if let Some(pod) = pod {
            if was_carbon_deferred {
                if let Err(err) = self
                    .record_carbon_savings(pod, &history, energy_kwh, emissions_g)
                    .await
                {
                    warn!(pod = pod_label, "carbon savings skipped: {err:#}");
                }
            }
            if let Err(err) = self.record_cost_savings(pod, &history, energy_kwh) {
                warn!(pod = pod_label, "cost savings skipped: {err:#}");
            }
            if let Err(err) = self.settle_energy_budget(pod, energy_kwh).await {
                warn!(pod = pod_label, "energy budget settlement failed: {err:#}");
            }
        }

        // Final-phase gauges freeze the last observation; current-phase
        // gauges are zeroed so dashboards do not keep reporting a dead pod.
        if let Some(last) = history.records.last() {
            metrics::set_pod_phase_gauges(
                &history.node_name,
                pod_label,
                "final",
                last.cpu_cores,
                last.memory_bytes,
                last.gpu_power_watts,
                last.total_power_watts,
            );
        }
        metrics::set_pod_phase_gauges(&history.node_name, pod_label, "current", 0.0, 0.0, 0.0, 0.0);
    }

    async fn record_carbon_savings(
        &self,
        pod: &Pod,
        history: &PodMetricsHistory,
        energy_kwh: f64,
        emissions_g: f64,
    ) -> Result<()> {
        let Some(initial_intensity) =
            annotations::parse_f64(pod, annotations::INITIAL_CARBON_INTENSITY)?
        else {
            debug!(pod = %history.pod_name, "no initial carbon annotation; skipping savings");
            return Ok(());
        };

        let counterfactual = self.counterfactual_emissions(pod, history).await;
        let (savings, method) = match counterfactual {
            Some(counterfactual) if counterfactual > 0.0 => {
                metrics::JOB_COUNTERFACTUAL_EMISSIONS_GRAMS
                    .with_label_values(&[&history.pod_name, &history.namespace])
                    .set(counterfactual);
                (counterfactual - emissions_g, "timeseries")
            }
            _ => {
                let bind_intensity =
                    annotations::parse_f64(pod, annotations::BIND_CARBON_INTENSITY)?
                        .or_else(|| history.records.first().map(|record| record.carbon_intensity))
                        .unwrap_or(initial_intensity);
                ((initial_intensity - bind_intensity) * energy_kwh, "simple")
            }
        };

        // Savings may be negative when the grid got dirtier; recorded
        // faithfully either way.
        metrics::ESTIMATED_SAVINGS
            .with_label_values(&[
                "carbon",
                "grams_co2",
                method,
                &history.pod_name,
                &history.namespace,
            ])
            .set(savings);
        metrics::SCHEDULING_EFFICIENCY
            .with_label_values(&["carbon_emissions_delta", &history.pod_name])
            .set(savings);
        Ok(())
    }

    /// All preconditions for the time-series replay; any missing piece falls
    /// back to the simple estimate.
    async fn counterfactual_emissions(
        &self,
        pod: &Pod,
        history: &PodMetricsHistory,
    ) -> Option<f64> {
        let estimator = self.estimator.as_ref()?;
        if !self.carbon_enabled || history.records.len() < 2 {
            return None;
        }
        let initial = annotations::get(pod, annotations::INITIAL_TIMESTAMP)?;
        let initial = DateTime::parse_from_rfc3339(initial).ok()?.with_timezone(&chrono::Utc);
        annotations::get(pod, annotations::BIND_TIMESTAMP)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?;

        match estimator.estimate(initial, &history.records).await {
            Ok(counterfactual) => Some(counterfactual),
            Err(err) => {
                warn!(pod = %history.pod_name, "counterfactual estimate failed: {err:#}");
                None
            }
        }
    }

    fn record_cost_savings(
        &self,
        pod: &Pod,
        history: &PodMetricsHistory,
        energy_kwh: f64,
    ) -> Result<()> {
        let Some(initial_rate) =
            annotations::parse_f64(pod, annotations::INITIAL_ELECTRICITY_RATE)?
        else {
            return Ok(());
        };
        // A zero first-record rate means pricing was off at sampling time,
        // not a free tariff.
        let bind_rate = annotations::parse_f64(pod, annotations::BIND_ELECTRICITY_RATE)?
            .or_else(|| {
                history
                    .records
                    .first()
                    .map(|record| record.electricity_rate)
                    .filter(|rate| *rate != 0.0)
            });
        let Some(bind_rate) = bind_rate else {
            debug!(pod = %history.pod_name, "no usable bind rate; skipping cost savings");
            return Ok(());
        };

        let savings = (initial_rate - bind_rate) * energy_kwh;
        metrics::ESTIMATED_SAVINGS
            .with_label_values(&[
                "cost",
                "dollars",
                "simple",
                &history.pod_name,
                &history.namespace,
            ])
            .set(savings);
        Ok(())
    }

    async fn settle_energy_budget(&self, pod: &Pod, energy_kwh: f64) -> Result<()> {
        let Some(budget) = annotations::parse_f64(pod, annotations::ENERGY_BUDGET_KWH)? else {
            return Ok(());
        };
        if budget <= 0.0 {
            return Ok(());
        }
        metrics::ENERGY_BUDGET_USAGE_PERCENT
            .with_label_values(&[kubeutil::pod_name(pod), kubeutil::pod_namespace(pod)])
            .set(100.0 * energy_kwh / budget);
        if energy_kwh > budget {
            enforce_budget(self.patcher.as_ref(), pod, energy_kwh, budget).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::pod_with_annotations;
    use crate::clock::ManualClock;
    use crate::telemetry::downsample::Lttb;
    use crate::telemetry::store::InMemoryStore;
    use crate::telemetry::{PodIdentity, PodMetricsRecord};
    use crate::testutil::{RecordingPatcher, StubTimeSeries};
    use crate::timeseries::TimeSeriesClient;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn record(offset_minutes: i64, watts: f64, intensity: f64, rate: f64) -> PodMetricsRecord {
        PodMetricsRecord {
            timestamp: base_time() + ChronoDuration::minutes(30 + offset_minutes),
            cpu_cores: 1.0,
            memory_bytes: 1024.0,
            gpu_power_watts: watts / 4.0,
            total_power_watts: watts,
            carbon_intensity: intensity,
            electricity_rate: rate,
        }
    }

    struct Fixture {
        handler: Arc<CompletionHandler>,
        store: Arc<InMemoryStore>,
        deferral: Arc<DeferralSets>,
        patcher: Arc<RecordingPatcher>,
    }

    fn fixture(timeseries: Option<Arc<StubTimeSeries>>) -> Fixture {
        let clock = Arc::new(ManualClock::new(base_time()));
        let store = Arc::new(InMemoryStore::new(
            500,
            Duration::from_secs(3600),
            Box::new(Lttb),
            clock,
        ));
        let deferral = Arc::new(DeferralSets::new());
        let patcher = Arc::new(RecordingPatcher::new());
        let estimator = timeseries.map(|ts| {
            Arc::new(CounterfactualEstimator::new(
                ts as Arc<dyn TimeSeriesClient>,
                "carbon_intensity".to_string(),
                "DE".to_string(),
            ))
        });
        let handler = Arc::new(CompletionHandler::new(
            store.clone(),
            deferral.clone(),
            patcher.clone(),
            estimator,
            true,
            Duration::ZERO,
        ));
        Fixture {
            handler,
            store,
            deferral,
            patcher,
        }
    }

    fn seed_history(store: &InMemoryStore, uid: &str, name: &str, records: &[PodMetricsRecord]) {
        let identity = PodIdentity {
            uid: uid.to_string(),
            name: name.to_string(),
            namespace: "default".to_string(),
            node: "node-1".to_string(),
        };
        for record in records {
            store.add_record(&identity, *record);
        }
    }

    #[tokio::test]
    async fn counterfactual_savings_use_timeseries_method() {
        // S5 shape: deferred at t0 under a 300 g/kWh grid, bound 30 minutes
        // later at 150 g/kWh, 10 minutes of execution at 100 W.
        let ts = Arc::new(StubTimeSeries::default());
        *ts.range.lock().unwrap() = (0..=10)
            .map(|minute| (base_time() + ChronoDuration::minutes(minute), 300.0))
            .collect();
        let fx = fixture(Some(ts));

        seed_history(
            &fx.store,
            "uid-s5",
            "job-s5",
            &[
                record(0, 100.0, 150.0, 0.0),
                record(5, 100.0, 150.0, 0.0),
                record(10, 100.0, 150.0, 0.0),
            ],
        );
        fx.deferral.defer_carbon("uid-s5");

        let mut pod = pod_with_annotations(&[
            (annotations::INITIAL_CARBON_INTENSITY, "300"),
            (annotations::INITIAL_TIMESTAMP, "2025-03-01T00:00:00Z"),
            (annotations::BIND_TIMESTAMP, "2025-03-01T00:30:00Z"),
            (annotations::BIND_CARBON_INTENSITY, "150"),
        ]);
        pod.metadata.name = Some("job-s5".to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.uid = Some("uid-s5".to_string());

        fx.handler.process("uid-s5", Some(&pod)).await;

        let savings = metrics::ESTIMATED_SAVINGS
            .with_label_values(&["carbon", "grams_co2", "timeseries", "job-s5", "default"])
            .get();
        // Counterfactual 5 g minus actual 2.5 g.
        assert!((savings - 2.5).abs() < 0.05, "savings {savings}");
        assert_eq!(fx.deferral.take("uid-s5"), (false, false));
    }

    #[tokio::test]
    async fn empty_history_falls_back_to_simple_method() {
        let ts = Arc::new(StubTimeSeries::default());
        let fx = fixture(Some(ts));

        seed_history(
            &fx.store,
            "uid-simple",
            "job-simple",
            &[record(0, 100.0, 150.0, 0.0), record(10, 100.0, 150.0, 0.0)],
        );
        fx.deferral.defer_carbon("uid-simple");

        let mut pod = pod_with_annotations(&[
            (annotations::INITIAL_CARBON_INTENSITY, "300"),
            (annotations::INITIAL_TIMESTAMP, "2025-03-01T00:00:00Z"),
            (annotations::BIND_TIMESTAMP, "2025-03-01T00:30:00Z"),
            (annotations::BIND_CARBON_INTENSITY, "150"),
        ]);
        pod.metadata.name = Some("job-simple".to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.uid = Some("uid-simple".to_string());

        fx.handler.process("uid-simple", Some(&pod)).await;

        let savings = metrics::ESTIMATED_SAVINGS
            .with_label_values(&["carbon", "grams_co2", "simple", "job-simple", "default"])
            .get();
        // (300 - 150) * 0.016667 kWh = 2.5 g.
        assert!((savings - 2.5).abs() < 0.01, "savings {savings}");
    }

    #[tokio::test]
    async fn processing_is_idempotent() {
        let fx = fixture(None);
        seed_history(
            &fx.store,
            "uid-idem",
            "job-idem",
            &[record(0, 100.0, 200.0, 0.0), record(5, 100.0, 200.0, 0.0)],
        );
        let mut pod = pod_with_annotations(&[
            (annotations::ENERGY_BUDGET_KWH, "0.001"),
            (annotations::ENERGY_BUDGET_ACTION, "notify"),
        ]);
        pod.metadata.name = Some("job-idem".to_string());
        pod.metadata.uid = Some("uid-idem".to_string());

        fx.handler.process("uid-idem", Some(&pod)).await;
        fx.handler.process("uid-idem", Some(&pod)).await;
        fx.handler.process("uid-idem", Some(&pod)).await;

        // The budget event fired exactly once.
        assert_eq!(fx.patcher.events().len(), 1);
    }

    #[tokio::test]
    async fn budget_breach_emits_percent_and_action() {
        let fx = fixture(None);
        // 100 W for 24 minutes is 0.04 kWh against a 0.02 kWh budget.
        seed_history(
            &fx.store,
            "uid-s6",
            "job-s6",
            &[record(0, 100.0, 200.0, 0.0), record(24, 100.0, 200.0, 0.0)],
        );
        let mut pod = pod_with_annotations(&[
            (annotations::ENERGY_BUDGET_KWH, "0.02"),
            (annotations::ENERGY_BUDGET_ACTION, "label"),
        ]);
        pod.metadata.name = Some("job-s6".to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.uid = Some("uid-s6".to_string());
        fx.patcher.put_pod(pod.clone());

        fx.handler.process("uid-s6", Some(&pod)).await;

        let percent = metrics::ENERGY_BUDGET_USAGE_PERCENT
            .with_label_values(&["job-s6", "default"])
            .get();
        assert!((percent - 200.0).abs() < 1.0, "percent {percent}");
        assert_eq!(fx.patcher.label_patches().len(), 1);
    }

    #[tokio::test]
    async fn current_gauges_are_zeroed() {
        let fx = fixture(None);
        seed_history(
            &fx.store,
            "uid-z",
            "job-z",
            &[record(0, 120.0, 200.0, 0.0), record(5, 120.0, 200.0, 0.0)],
        );
        metrics::set_pod_phase_gauges("node-1", "job-z", "current", 1.0, 1.0, 1.0, 120.0);

        fx.handler.process("uid-z", None).await;

        let current = metrics::NODE_POWER_ESTIMATE_WATTS
            .with_label_values(&["node-1", "job-z", "current"])
            .get();
        assert_eq!(current, 0.0);
        let final_watts = metrics::NODE_POWER_ESTIMATE_WATTS
            .with_label_values(&["node-1", "job-z", "final"])
            .get();
        assert_eq!(final_watts, 120.0);
    }

    #[tokio::test]
    async fn cost_savings_prefer_bind_annotation() {
        let fx = fixture(None);
        seed_history(
            &fx.store,
            "uid-cost",
            "job-cost",
            &[record(0, 100.0, 200.0, 0.0), record(60, 100.0, 200.0, 0.0)],
        );
        let mut pod = pod_with_annotations(&[
            (annotations::INITIAL_ELECTRICITY_RATE, "0.30"),
            (annotations::BIND_ELECTRICITY_RATE, "0.10"),
        ]);
        pod.metadata.name = Some("job-cost".to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.uid = Some("uid-cost".to_string());

        fx.handler.process("uid-cost", Some(&pod)).await;

        let savings = metrics::ESTIMATED_SAVINGS
            .with_label_values(&["cost", "dollars", "simple", "job-cost", "default"])
            .get();
        // (0.30 - 0.10) * 0.1 kWh.
        assert!((savings - 0.02).abs() < 1e-6, "savings {savings}");
    }
}
