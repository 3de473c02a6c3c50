use crate::telemetry::energy::median_sample_interval;
use crate::telemetry::PodMetricsRecord;
use crate::timeseries::TimeSeriesClient;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Replays a job's actual power profile against the historical intensity
/// curve covering the window in which it would have run had it not been
/// deferred.
pub struct CounterfactualEstimator {
    timeseries: Arc<dyn TimeSeriesClient>,
    metric: String,
    region: String,
}

impl CounterfactualEstimator {
    pub fn new(timeseries: Arc<dyn TimeSeriesClient>, metric: String, region: String) -> Self {
        Self {
            timeseries,
            metric,
            region,
        }
    }

    /// Total counterfactual emissions in gCO2, or 0 when no history covers
    /// the window (callers fall back to the simple estimate).
    pub async fn estimate(
        &self,
        initial: DateTime<Utc>,
        records: &[PodMetricsRecord],
    ) -> Result<f64> {
        if records.len() < 2 {
            return Ok(0.0);
        }
        let first = records[0].timestamp;
        let last = records[records.len() - 1].timestamp;
        let execution_duration = last - first;
        let window_end = initial + execution_duration;

        let step = median_sample_interval(records)
            .and_then(|duration| duration.to_std().ok())
            .unwrap_or_else(|| std::time::Duration::from_secs(60));

        let query = format!("{}{{region=\"{}\"}}", self.metric, self.region);
        let history = self
            .timeseries
            .query_range(&query, initial, window_end, step)
            .await?;
        if history.is_empty() {
            debug!(
                region = %self.region,
                "no historical intensity for counterfactual window"
            );
            return Ok(0.0);
        }

        let mut emissions = 0.0;
        for pair in records.windows(2) {
            let cf_prev = initial + (pair[0].timestamp - first);
            let cf_cur = initial + (pair[1].timestamp - first);
            let intensity_prev = forward_fill(&history, cf_prev);
            let intensity_cur = forward_fill(&history, cf_cur);

            let dt_hours = (pair[1].timestamp - pair[0].timestamp).num_milliseconds() as f64
                / 3_600_000.0;
            let energy =
                (pair[0].total_power_watts + pair[1].total_power_watts) / 2.0 * dt_hours / 1000.0;
            emissions += energy * (intensity_prev + intensity_cur) / 2.0;
        }
        Ok(emissions)
    }
}

/// Value in effect at `t`: the latest sample at or before it, or the first
/// sample when `t` precedes the series.
fn forward_fill(history: &[(DateTime<Utc>, f64)], t: DateTime<Utc>) -> f64 {
    let mut value = history[0].1;
    for (timestamp, sample) in history {
        if *timestamp > t {
            break;
        }
        value = *sample;
    }
    value
}
