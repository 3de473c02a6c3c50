use crate::annotations;
use crate::kubeutil::{self, ClusterPatcher};
use crate::metrics;
use crate::telemetry::energy::total_energy_kwh;
use crate::telemetry::PodMetricsStorage;
use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetAction {
    Log,
    Annotate,
    Label,
    Notify,
}

impl BudgetAction {
    pub fn from_pod(pod: &Pod) -> Self {
        match annotations::get(pod, annotations::ENERGY_BUDGET_ACTION).map(str::trim) {
            Some("annotate") => BudgetAction::Annotate,
            Some("label") => BudgetAction::Label,
            Some("notify") => BudgetAction::Notify,
            _ => BudgetAction::Log,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BudgetAction::Log => "log",
            BudgetAction::Annotate => "annotate",
            BudgetAction::Label => "label",
            BudgetAction::Notify => "notify",
        }
    }
}

/// Applies the configured consequence of an energy-budget breach and counts
/// it.
pub async fn enforce_budget(
    patcher: &dyn ClusterPatcher,
    pod: &Pod,
    energy_kwh: f64,
    budget_kwh: f64,
) -> Result<()> {
    let namespace = kubeutil::pod_namespace(pod);
    let name = kubeutil::pod_name(pod);
    let action = BudgetAction::from_pod(pod);
    let exceeded_by = energy_kwh - budget_kwh;

    metrics::ENERGY_BUDGET_EXCEEDED_TOTAL
        .with_label_values(&[namespace, kubeutil::owner_kind(pod), action.as_str()])
        .inc();

    match action {
        BudgetAction::Log => {
            warn!(
                pod = name,
                namespace,
                energy_kwh,
                budget_kwh,
                "pod exceeded its energy budget"
            );
        }
        BudgetAction::Annotate => {
            let mut patch = BTreeMap::new();
            patch.insert(
                annotations::ENERGY_USAGE_KWH.to_string(),
                format!("{energy_kwh:.6}"),
            );
            patch.insert(
                annotations::ENERGY_BUDGET_EXCEEDED.to_string(),
                "true".to_string(),
            );
            patch.insert(
                annotations::ENERGY_BUDGET_EXCEEDED_BY.to_string(),
                format!("{exceeded_by:.6}"),
            );
            patcher.patch_pod_annotations(namespace, name, patch).await?;
        }
        BudgetAction::Label => {
            let mut labels = BTreeMap::new();
            labels.insert(
                annotations::ENERGY_BUDGET_EXCEEDED.to_string(),
                "true".to_string(),
            );
            patcher.patch_pod_labels(namespace, name, labels).await?;
        }
        BudgetAction::Notify => {
            patcher
                .create_warning_event(
                    pod,
                    "EnergyBudgetExceeded",
                    &format!(
                        "pod used {energy_kwh:.4} kWh against a budget of {budget_kwh:.4} kWh"
                    ),
                )
                .await?;
        }
    }
    Ok(())
}

/// Low-frequency walk over budgeted pods: emits percent-of-budget and fires
/// the configured action once per pod while it is still running. Completed
/// pods are settled by the completion handler instead.
pub struct EnergyBudgetService {
    client: kube::Client,
    store: Arc<dyn PodMetricsStorage>,
    patcher: Arc<dyn ClusterPatcher>,
    scheduler_name: String,
    interval: Duration,
    fired: Mutex<HashSet<String>>,
}

impl EnergyBudgetService {
    pub fn new(
        client: kube::Client,
        store: Arc<dyn PodMetricsStorage>,
        patcher: Arc<dyn ClusterPatcher>,
        scheduler_name: String,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            patcher,
            scheduler_name,
            interval,
            fired: Mutex::new(HashSet::new()),
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.check_budgets().await {
                            warn!("energy budget sweep failed: {err:#}");
                        }
                    }
                }
            }
        });
    }

    async fn check_budgets(&self) -> Result<()> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default()).await?;

        for pod in &list.items {
            if kubeutil::scheduler_name(pod) != self.scheduler_name {
                continue;
            }
            let budget = match annotations::parse_f64(pod, annotations::ENERGY_BUDGET_KWH) {
                Ok(Some(budget)) if budget > 0.0 => budget,
                Ok(_) => continue,
                Err(err) => {
                    warn!(pod = kubeutil::pod_name(pod), error = %err, "bad energy budget");
                    continue;
                }
            };

            let uid = kubeutil::pod_uid(pod);
            let Some(history) = self.store.get(uid) else {
                continue;
            };
            if history.completed {
                continue;
            }

            let energy = total_energy_kwh(&history.records);
            let percent = 100.0 * energy / budget;
            metrics::ENERGY_BUDGET_USAGE_PERCENT
                .with_label_values(&[kubeutil::pod_name(pod), kubeutil::pod_namespace(pod)])
                .set(percent);

            if energy > budget {
                let newly_fired = self.fired.lock().expect("fired set poisoned").insert(uid.to_string());
                if newly_fired {
                    info!(
                        pod = kubeutil::pod_name(pod),
                        energy_kwh = energy,
                        budget_kwh = budget,
                        "energy budget exceeded mid-flight"
                    );
                    enforce_budget(self.patcher.as_ref(), pod, energy, budget).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::pod_with_annotations;
    use crate::testutil::RecordingPatcher;

    #[tokio::test]
    async fn label_action_sets_label() {
        let patcher = RecordingPatcher::new();
        let mut pod = pod_with_annotations(&[
            (annotations::ENERGY_BUDGET_KWH, "0.02"),
            (annotations::ENERGY_BUDGET_ACTION, "label"),
        ]);
        pod.metadata.name = Some("job-a".to_string());
        pod.metadata.namespace = Some("default".to_string());
        patcher.put_pod(pod.clone());

        enforce_budget(&patcher, &pod, 0.04, 0.02).await.expect("enforce");

        let labels = patcher.label_patches();
        assert_eq!(labels.len(), 1);
        assert_eq!(
            labels[0].get(annotations::ENERGY_BUDGET_EXCEEDED).unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn annotate_action_records_usage() {
        let patcher = RecordingPatcher::new();
        let mut pod = pod_with_annotations(&[
            (annotations::ENERGY_BUDGET_KWH, "0.5"),
            (annotations::ENERGY_BUDGET_ACTION, "annotate"),
        ]);
        pod.metadata.name = Some("job-b".to_string());
        pod.metadata.namespace = Some("default".to_string());
        patcher.put_pod(pod.clone());

        enforce_budget(&patcher, &pod, 0.75, 0.5).await.expect("enforce");

        let patches = patcher.annotation_patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0].get(annotations::ENERGY_BUDGET_EXCEEDED).unwrap(),
            "true"
        );
        assert!(patches[0]
            .get(annotations::ENERGY_BUDGET_EXCEEDED_BY)
            .unwrap()
            .starts_with("0.25"));
    }

    #[tokio::test]
    async fn notify_action_emits_warning_event() {
        let patcher = RecordingPatcher::new();
        let mut pod = pod_with_annotations(&[(annotations::ENERGY_BUDGET_ACTION, "notify")]);
        pod.metadata.name = Some("job-c".to_string());

        enforce_budget(&patcher, &pod, 1.0, 0.5).await.expect("enforce");

        let events = patcher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "EnergyBudgetExceeded");
    }

    #[test]
    fn unknown_action_defaults_to_log() {
        let pod = pod_with_annotations(&[(annotations::ENERGY_BUDGET_ACTION, "page-everyone")]);
        assert_eq!(BudgetAction::from_pod(&pod), BudgetAction::Log);
    }
}
