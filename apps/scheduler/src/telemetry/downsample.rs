use crate::telemetry::PodMetricsRecord;

/// Shrinks a series to at most `target` points. Strategies are chosen by
/// configuration; all of them return the input unchanged when it already
/// fits.
pub trait DownsamplingStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn downsample(&self, records: &[PodMetricsRecord], target: usize) -> Vec<PodMetricsRecord>;
}

fn x_of(record: &PodMetricsRecord) -> f64 {
    record.timestamp.timestamp_millis() as f64 / 1000.0
}

fn y_of(record: &PodMetricsRecord) -> f64 {
    record.cpu_cores
}

/// Largest-Triangle-Three-Buckets. Keeps first and last points; in each
/// interior bucket keeps the point with the largest triangle area against
/// the previously kept point and the next bucket's centroid.
pub struct Lttb;

impl DownsamplingStrategy for Lttb {
    fn name(&self) -> &'static str {
        "lttb"
    }

    fn downsample(&self, records: &[PodMetricsRecord], target: usize) -> Vec<PodMetricsRecord> {
        if target >= records.len() {
            return records.to_vec();
        }
        if target <= 2 {
            let mut kept = Vec::with_capacity(2);
            if let Some(first) = records.first() {
                kept.push(*first);
            }
            if records.len() > 1 {
                kept.push(records[records.len() - 1]);
            }
            return kept;
        }

        let len = records.len();
        let bucket_size = (len - 2) as f64 / (target - 2) as f64;
        let mut kept = Vec::with_capacity(target);
        kept.push(records[0]);
        let mut anchor = 0usize;

        for bucket in 0..target - 2 {
            let range_start = (bucket as f64 * bucket_size) as usize + 1;
            let range_end = (((bucket + 1) as f64) * bucket_size) as usize + 1;
            let range_end = range_end.min(len - 1);

            // Centroid of the following bucket; the final bucket's successor
            // is the last point itself.
            let next_start = range_end;
            let next_end = ((((bucket + 2) as f64) * bucket_size) as usize + 1).min(len);
            let (avg_x, avg_y) = if next_start < next_end {
                let span = (next_end - next_start) as f64;
                let sum_x: f64 = records[next_start..next_end].iter().map(x_of).sum();
                let sum_y: f64 = records[next_start..next_end].iter().map(y_of).sum();
                (sum_x / span, sum_y / span)
            } else {
                (x_of(&records[len - 1]), y_of(&records[len - 1]))
            };

            let ax = x_of(&records[anchor]);
            let ay = y_of(&records[anchor]);
            let mut best_index = range_start;
            let mut best_area = -1.0f64;
            for index in range_start..range_end.max(range_start + 1) {
                let point = &records[index.min(len - 1)];
                let area = ((ax * (y_of(point) - avg_y)
                    + x_of(point) * (avg_y - ay)
                    + avg_x * (ay - y_of(point)))
                    / 2.0)
                    .abs();
                if area > best_area {
                    best_area = area;
                    best_index = index.min(len - 1);
                }
            }
            kept.push(records[best_index]);
            anchor = best_index;
        }

        kept.push(records[len - 1]);
        kept
    }
}

/// Keeps the first point, the newest 60% of the target at full resolution,
/// and a uniform stride through the older prefix.
pub struct RecencyWeighted;

impl DownsamplingStrategy for RecencyWeighted {
    fn name(&self) -> &'static str {
        "recency-weighted"
    }

    fn downsample(&self, records: &[PodMetricsRecord], target: usize) -> Vec<PodMetricsRecord> {
        if target >= records.len() {
            return records.to_vec();
        }
        if target == 0 {
            return Vec::new();
        }
        if target == 1 {
            return vec![records[0]];
        }

        let len = records.len();
        let recent_count = ((target as f64) * 0.6).round() as usize;
        let recent_count = recent_count.clamp(1, target - 1);
        let recent_start = len - recent_count;

        // First point plus a sparse walk through everything older.
        let older_budget = target - recent_count;
        let mut kept = Vec::with_capacity(target);
        kept.push(records[0]);
        if older_budget > 1 && recent_start > 1 {
            let older = &records[1..recent_start];
            let stride = (older.len() as f64 / (older_budget - 1) as f64).max(1.0);
            let mut cursor = 0.0f64;
            for _ in 0..older_budget - 1 {
                let index = (cursor as usize).min(older.len() - 1);
                kept.push(older[index]);
                cursor += stride;
            }
        }
        kept.extend_from_slice(&records[recent_start..]);
        kept.truncate(target);
        kept
    }
}

/// Per-bucket extremes of the primary metric (CPU), preserving spikes that
/// trend-preserving strategies would smooth away.
pub struct MinMax;

impl DownsamplingStrategy for MinMax {
    fn name(&self) -> &'static str {
        "min-max"
    }

    fn downsample(&self, records: &[PodMetricsRecord], target: usize) -> Vec<PodMetricsRecord> {
        if target >= records.len() {
            return records.to_vec();
        }
        if target <= 2 {
            return Lttb.downsample(records, target);
        }

        let len = records.len();
        let buckets = ((target - 2) / 2).max(1);
        let interior = &records[1..len - 1];
        let bucket_size = (interior.len() as f64 / buckets as f64).max(1.0);

        let mut keep = std::collections::BTreeSet::new();
        keep.insert(0usize);
        keep.insert(len - 1);
        for bucket in 0..buckets {
            let start = (bucket as f64 * bucket_size) as usize;
            let end = (((bucket + 1) as f64) * bucket_size) as usize;
            let end = end.min(interior.len());
            if start >= end {
                continue;
            }
            let mut min_index = start;
            let mut max_index = start;
            for index in start..end {
                if y_of(&interior[index]) < y_of(&interior[min_index]) {
                    min_index = index;
                }
                if y_of(&interior[index]) > y_of(&interior[max_index]) {
                    max_index = index;
                }
            }
            keep.insert(min_index + 1);
            keep.insert(max_index + 1);
        }

        keep.into_iter().map(|index| records[index]).collect()
    }
}

pub fn strategy_for(kind: crate::config::DownsamplingKind) -> Box<dyn DownsamplingStrategy> {
    match kind {
        crate::config::DownsamplingKind::Lttb => Box::new(Lttb),
        crate::config::DownsamplingKind::RecencyWeighted => Box::new(RecencyWeighted),
        crate::config::DownsamplingKind::MinMax => Box::new(MinMax),
    }
}

#[cfg(test)]
pub(crate) fn make_records(count: usize) -> Vec<PodMetricsRecord> {
    use chrono::{Duration, TimeZone, Utc};

    let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
    (0..count)
        .map(|index| PodMetricsRecord {
            timestamp: start + Duration::seconds(15 * index as i64),
            cpu_cores: (index as f64 * 0.7).sin().abs() * 4.0,
            memory_bytes: 1024.0 * 1024.0 * index as f64,
            gpu_power_watts: 0.0,
            total_power_watts: 100.0 + index as f64,
            carbon_intensity: 200.0,
            electricity_rate: 0.1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_strategies_are_identity_when_target_fits() {
        let records = make_records(10);
        for strategy in [
            Box::new(Lttb) as Box<dyn DownsamplingStrategy>,
            Box::new(RecencyWeighted),
            Box::new(MinMax),
        ] {
            let out = strategy.downsample(&records, 10);
            assert_eq!(out.len(), 10, "{} not identity", strategy.name());
            let out = strategy.downsample(&records, 50);
            assert_eq!(out.len(), 10, "{} not identity", strategy.name());
        }
    }

    #[test]
    fn lttb_keeps_endpoints_and_respects_target() {
        let records = make_records(200);
        let out = Lttb.downsample(&records, 40);
        assert_eq!(out.len(), 40);
        assert_eq!(out[0], records[0]);
        assert_eq!(out[39], records[199]);
        for pair in out.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn minmax_keeps_endpoints_and_extremes() {
        let mut records = make_records(100);
        records[57].cpu_cores = 1000.0;
        let out = MinMax.downsample(&records, 20);
        assert!(out.len() <= 20);
        assert_eq!(out[0], records[0]);
        assert_eq!(*out.last().unwrap(), records[99]);
        assert!(out.iter().any(|record| record.cpu_cores == 1000.0));
    }

    #[test]
    fn recency_weighted_keeps_first_and_dense_tail() {
        let records = make_records(100);
        let out = RecencyWeighted.downsample(&records, 20);
        assert_eq!(out.len(), 20);
        assert_eq!(out[0], records[0]);
        // The newest 60% of the target arrives untouched.
        let tail = &out[out.len() - 12..];
        assert_eq!(tail, &records[100 - 12..]);
    }

    #[test]
    fn tiny_targets_degrade_to_endpoints() {
        let records = make_records(10);
        let out = Lttb.downsample(&records, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], records[0]);
        assert_eq!(out[1], records[9]);
    }
}
