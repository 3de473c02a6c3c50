use crate::telemetry::PodMetricsRecord;

fn interval_hours(prev: &PodMetricsRecord, cur: &PodMetricsRecord) -> f64 {
    (cur.timestamp - prev.timestamp).num_milliseconds() as f64 / 3_600_000.0
}

/// Trapezoid integral of total power over the series, in kWh. A single
/// sample integrates to zero.
pub fn total_energy_kwh(records: &[PodMetricsRecord]) -> f64 {
    records
        .windows(2)
        .map(|pair| {
            let dt = interval_hours(&pair[0], &pair[1]);
            (pair[0].total_power_watts + pair[1].total_power_watts) / 2.0 * dt / 1000.0
        })
        .sum()
}

pub fn gpu_energy_kwh(records: &[PodMetricsRecord]) -> f64 {
    records
        .windows(2)
        .map(|pair| {
            let dt = interval_hours(&pair[0], &pair[1]);
            (pair[0].gpu_power_watts + pair[1].gpu_power_watts) / 2.0 * dt / 1000.0
        })
        .sum()
}

/// Per-interval emissions: each interval's energy multiplied by the average
/// of the intensities observed at its endpoints, summed. This weights every
/// interval by the intensity in effect at the time, not by a single final
/// value.
pub fn total_emissions_grams(records: &[PodMetricsRecord]) -> f64 {
    records
        .windows(2)
        .map(|pair| {
            let dt = interval_hours(&pair[0], &pair[1]);
            let energy = (pair[0].total_power_watts + pair[1].total_power_watts) / 2.0 * dt / 1000.0;
            energy * (pair[0].carbon_intensity + pair[1].carbon_intensity) / 2.0
        })
        .sum()
}

/// Median spacing between consecutive samples, used as the historical query
/// step in the counterfactual replay.
pub fn median_sample_interval(records: &[PodMetricsRecord]) -> Option<chrono::Duration> {
    if records.len() < 2 {
        return None;
    }
    let mut gaps: Vec<i64> = records
        .windows(2)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp).num_milliseconds())
        .collect();
    gaps.sort_unstable();
    let median = gaps[gaps.len() / 2];
    Some(chrono::Duration::milliseconds(median))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn record(offset_minutes: i64, watts: f64, intensity: f64) -> PodMetricsRecord {
        PodMetricsRecord {
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
                + Duration::minutes(offset_minutes),
            cpu_cores: 1.0,
            memory_bytes: 0.0,
            gpu_power_watts: watts / 2.0,
            total_power_watts: watts,
            carbon_intensity: intensity,
            electricity_rate: 0.1,
        }
    }

    #[test]
    fn trapezoid_matches_hand_computation() {
        let records = vec![
            record(0, 100.0, 200.0),
            record(5, 100.0, 200.0),
            record(10, 50.0, 150.0),
        ];

        let energy = total_energy_kwh(&records);
        assert!((energy - 0.01458).abs() < 1e-4, "energy {energy}");

        let emissions = total_emissions_grams(&records);
        assert!((emissions - 2.76).abs() < 0.01, "emissions {emissions}");
    }

    #[test]
    fn single_record_integrates_to_zero() {
        let records = vec![record(0, 100.0, 200.0)];
        assert_eq!(total_energy_kwh(&records), 0.0);
        assert_eq!(total_emissions_grams(&records), 0.0);
    }

    #[test]
    fn zero_power_yields_zero_energy() {
        let records = vec![record(0, 0.0, 200.0), record(5, 0.0, 200.0)];
        assert_eq!(total_energy_kwh(&records), 0.0);
        assert_eq!(total_emissions_grams(&records), 0.0);
        assert_eq!(gpu_energy_kwh(&records), 0.0);
    }

    #[test]
    fn median_interval_resists_outliers() {
        let records = vec![record(0, 1.0, 0.0), record(1, 1.0, 0.0), record(2, 1.0, 0.0), record(60, 1.0, 0.0)];
        let median = median_sample_interval(&records).expect("median");
        assert_eq!(median, Duration::minutes(1));
    }

    #[test]
    fn median_needs_two_records() {
        assert!(median_sample_interval(&[record(0, 1.0, 0.0)]).is_none());
    }
}
