use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct CpuFrequency {
    pub index: u32,
    pub current_ghz: Option<f64>,
    pub base_ghz: Option<f64>,
    pub min_ghz: Option<f64>,
    pub max_ghz: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CpuInventory {
    pub model: Option<String>,
    pub cpus: Vec<CpuFrequency>,
}

/// Reads CPU model and frequency endpoints from the operating system.
/// `cpuinfo_path` is normally /proc/cpuinfo and `sysfs_cpu_root` is
/// /sys/devices/system/cpu; both are parameters so tests can point at a
/// fixture tree.
pub fn collect(cpuinfo_path: &Path, sysfs_cpu_root: &Path) -> Result<CpuInventory> {
    let cpuinfo = fs::read_to_string(cpuinfo_path)
        .with_context(|| format!("failed to read {}", cpuinfo_path.display()))?;
    let model = parse_model_name(&cpuinfo);

    let mut cpus = Vec::new();
    let mut index = 0u32;
    loop {
        let cpu_dir = sysfs_cpu_root.join(format!("cpu{index}/cpufreq"));
        if !cpu_dir.is_dir() {
            break;
        }
        cpus.push(CpuFrequency {
            index,
            current_ghz: read_khz_file(&cpu_dir.join("scaling_cur_freq")),
            base_ghz: read_khz_file(&cpu_dir.join("base_frequency")),
            min_ghz: read_khz_file(&cpu_dir.join("cpuinfo_min_freq")),
            max_ghz: read_khz_file(&cpu_dir.join("cpuinfo_max_freq")),
        });
        index += 1;
    }

    Ok(CpuInventory { model, cpus })
}

/// Rereads only the dynamic per-cpu frequencies.
pub fn refresh_current(sysfs_cpu_root: &Path, cpus: &mut [CpuFrequency]) {
    for cpu in cpus.iter_mut() {
        let path = sysfs_cpu_root.join(format!("cpu{}/cpufreq/scaling_cur_freq", cpu.index));
        cpu.current_ghz = read_khz_file(&path);
    }
}

pub fn parse_model_name(cpuinfo: &str) -> Option<String> {
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() == "model name" {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Sysfs cpufreq files hold kHz.
fn read_khz_file(path: &Path) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    let khz: f64 = raw.trim().parse().ok()?;
    if khz <= 0.0 {
        return None;
    }
    Some(khz / 1_000_000.0)
}
