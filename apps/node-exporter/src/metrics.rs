use crate::cpuinfo::CpuFrequency;
use once_cell::sync::Lazy;
use prometheus::{register_gauge_vec, Encoder, GaugeVec, TextEncoder};

pub static CPU_FREQUENCY_GHZ: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "node_cpu_frequency_ghz",
        "Current per-cpu frequency in GHz",
        &["cpu", "node"]
    )
    .expect("register node_cpu_frequency_ghz")
});

pub static CPU_FREQUENCY_STATIC_GHZ: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "node_cpu_frequency_static_ghz",
        "Base/min/max per-cpu frequency endpoints in GHz",
        &["cpu", "node", "type"]
    )
    .expect("register node_cpu_frequency_static_ghz")
});

pub fn publish(node: &str, cpus: &[CpuFrequency]) {
    for cpu in cpus {
        let index = cpu.index.to_string();
        if let Some(current) = cpu.current_ghz {
            CPU_FREQUENCY_GHZ
                .with_label_values(&[&index, node])
                .set(current);
        }
        for (kind, value) in [
            ("base", cpu.base_ghz),
            ("min", cpu.min_ghz),
            ("max", cpu.max_ghz),
        ] {
            if let Some(value) = value {
                CPU_FREQUENCY_STATIC_GHZ
                    .with_label_values(&[&index, node, kind])
                    .set(value);
            }
        }
    }
}

pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_dynamic_and_static_gauges() {
        publish(
            "node-1",
            &[CpuFrequency {
                index: 0,
                current_ghz: Some(2.8),
                base_ghz: Some(3.0),
                min_ghz: Some(1.2),
                max_ghz: Some(3.6),
            }],
        );
        let rendered = render();
        assert!(rendered.contains("node_cpu_frequency_ghz"));
        assert!(rendered.contains("node_cpu_frequency_static_ghz"));
    }
}
