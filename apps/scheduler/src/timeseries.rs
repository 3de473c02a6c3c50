use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// One labelled sample from an instant query.
#[derive(Debug, Clone)]
pub struct InstantSample {
    pub labels: HashMap<String, String>,
    pub value: f64,
}

/// Range-query façade over the metric store. `query_range` returns the
/// first matching series as `(timestamp, value)` pairs ordered by time.
#[async_trait]
pub trait TimeSeriesClient: Send + Sync {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<(DateTime<Utc>, f64)>>;

    async fn query_instant(&self, query: &str) -> Result<Vec<InstantSample>>;
}

#[derive(Debug, Deserialize)]
struct PromEnvelope<T> {
    status: String,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct PromMatrix {
    #[serde(rename = "result")]
    result: Vec<PromMatrixSeries>,
}

#[derive(Debug, Deserialize)]
struct PromMatrixSeries {
    #[serde(default)]
    values: Vec<(f64, String)>,
}

#[derive(Debug, Default, Deserialize)]
struct PromVector {
    #[serde(rename = "result")]
    result: Vec<PromVectorSample>,
}

#[derive(Debug, Deserialize)]
struct PromVectorSample {
    #[serde(default)]
    metric: HashMap<String, String>,
    value: (f64, String),
}

pub struct PrometheusClient {
    http: reqwest::Client,
    base_url: String,
}

impl PrometheusClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build prometheus client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn parse_epoch(seconds: f64) -> DateTime<Utc> {
        let millis = (seconds * 1000.0).round() as i64;
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[async_trait]
impl TimeSeriesClient for PrometheusClient {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("query", query.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", step.as_secs().max(1).to_string()),
            ])
            .send()
            .await
            .context("prometheus range query failed")?
            .error_for_status()
            .context("prometheus range query returned an error status")?;

        let envelope: PromEnvelope<PromMatrix> = response
            .json()
            .await
            .context("failed to parse prometheus range response")?;
        if envelope.status != "success" {
            anyhow::bail!("prometheus range query status {}", envelope.status);
        }

        let mut points = Vec::new();
        if let Some(series) = envelope.data.and_then(|data| data.result.into_iter().next()) {
            points.reserve(series.values.len());
            for (epoch, value) in series.values {
                let value: f64 = value
                    .parse()
                    .with_context(|| format!("non-numeric sample {value:?}"))?;
                points.push((Self::parse_epoch(epoch), value));
            }
        }
        points.sort_by_key(|(t, _)| *t);
        Ok(points)
    }

    async fn query_instant(&self, query: &str) -> Result<Vec<InstantSample>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .context("prometheus instant query failed")?
            .error_for_status()
            .context("prometheus instant query returned an error status")?;

        let envelope: PromEnvelope<PromVector> = response
            .json()
            .await
            .context("failed to parse prometheus instant response")?;
        if envelope.status != "success" {
            anyhow::bail!("prometheus instant query status {}", envelope.status);
        }

        let mut samples = Vec::new();
        for sample in envelope.data.map(|data| data.result).unwrap_or_default() {
            let value: f64 = sample
                .value
                .1
                .parse()
                .with_context(|| format!("non-numeric sample {:?}", sample.value.1))?;
            samples.push(InstantSample {
                labels: sample.metric,
                value,
            });
        }
        Ok(samples)
    }
}
