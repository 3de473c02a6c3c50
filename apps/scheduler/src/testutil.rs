//! Shared fakes for engine and telemetry tests.

use crate::carbon::{CarbonDataSource, CarbonError, CarbonRecord};
use crate::kubeutil::ClusterPatcher;
use crate::timeseries::{InstantSample, TimeSeriesClient};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Carbon source with a settable reading; `None` simulates an outage.
pub struct StaticCarbonSource {
    pub reading: Mutex<Option<(f64, DateTime<Utc>)>>,
}

impl StaticCarbonSource {
    pub fn new(intensity: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            reading: Mutex::new(Some((intensity, observed_at))),
        }
    }

    pub fn set(&self, intensity: f64, observed_at: DateTime<Utc>) {
        *self.reading.lock().unwrap() = Some((intensity, observed_at));
    }

    pub fn fail(&self) {
        *self.reading.lock().unwrap() = None;
    }
}

#[async_trait]
impl CarbonDataSource for StaticCarbonSource {
    async fn get_intensity(&self, region: &str) -> Result<CarbonRecord, CarbonError> {
        match *self.reading.lock().unwrap() {
            Some((intensity, observed_at)) => Ok(CarbonRecord {
                region: region.to_string(),
                intensity,
                observed_at,
            }),
            None => Err(CarbonError::Transient("simulated outage".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchCall {
    Annotations(String, BTreeMap<String, String>),
    Labels(String, BTreeMap<String, String>),
    Event(String, String),
}

/// Captures cluster writes and serves pod reads from an in-memory map,
/// folding annotation patches back in the way the apiserver would.
#[derive(Default)]
pub struct RecordingPatcher {
    pub calls: Mutex<Vec<PatchCall>>,
    pub pods: Mutex<BTreeMap<String, Pod>>,
}

impl RecordingPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_pod(&self, pod: Pod) {
        let key = format!(
            "{}/{}",
            pod.metadata.namespace.as_deref().unwrap_or("default"),
            pod.metadata.name.as_deref().unwrap_or("")
        );
        self.pods.lock().unwrap().insert(key, pod);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }

    pub fn annotation_patches(&self) -> Vec<BTreeMap<String, String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                PatchCall::Annotations(_, map) => Some(map.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                PatchCall::Event(reason, message) => Some((reason.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn label_patches(&self) -> Vec<BTreeMap<String, String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                PatchCall::Labels(_, map) => Some(map.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ClusterPatcher for RecordingPatcher {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pod(namespace, name))
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let key = format!("{namespace}/{name}");
        self.calls
            .lock()
            .unwrap()
            .push(PatchCall::Annotations(key.clone(), annotations.clone()));
        let mut pods = self.pods.lock().unwrap();
        if let Some(pod) = pods.get_mut(&key) {
            pod.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(annotations);
        }
        Ok(())
    }

    async fn patch_pod_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        let key = format!("{namespace}/{name}");
        self.calls
            .lock()
            .unwrap()
            .push(PatchCall::Labels(key.clone(), labels.clone()));
        let mut pods = self.pods.lock().unwrap();
        if let Some(pod) = pods.get_mut(&key) {
            pod.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(labels);
        }
        Ok(())
    }

    async fn create_warning_event(&self, _pod: &Pod, reason: &str, message: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(PatchCall::Event(reason.to_string(), message.to_string()));
        Ok(())
    }
}

/// Time-series stub with canned answers.
#[derive(Default)]
pub struct StubTimeSeries {
    pub range: Mutex<Vec<(DateTime<Utc>, f64)>>,
    pub instant: Mutex<Vec<InstantSample>>,
}

#[async_trait]
impl TimeSeriesClient for StubTimeSeries {
    async fn query_range(
        &self,
        _query: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _step: std::time::Duration,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        Ok(self.range.lock().unwrap().clone())
    }

    async fn query_instant(&self, _query: &str) -> Result<Vec<InstantSample>> {
        Ok(self.instant.lock().unwrap().clone())
    }
}
