//! Resource collector — the worker's periodic `ResourceReport`.
//!
//! Linux only: CPU from `/proc/stat` deltas, memory from `/proc/meminfo`,
//! disk from `statvfs`, battery from `/sys/class/power_supply`. The GPU
//! probe runs once at startup.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hive_core::message::{BatteryState, ResourceReport};

const ACCELERATOR_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Samples local resources. Keeps the previous CPU reading so each sample
/// reports usage since the last one.
#[derive(Debug)]
pub struct ResourceCollector {
    disk_path: PathBuf,
    hostname: String,
    accelerator: Option<String>,
    core_count: u32,
    physical_cores: u32,
    prev_cpu: Option<CpuTimes>,
}

impl ResourceCollector {
    pub async fn new(disk_path: impl Into<PathBuf>) -> Self {
        let core_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let physical_cores = std::fs::read_to_string("/proc/cpuinfo")
            .ok()
            .and_then(|s| parse_physical_cores(&s))
            .unwrap_or(core_count);
        let accelerator = probe_accelerator().await;
        if let Some(name) = &accelerator {
            tracing::info!(accelerator = %name, "accelerator detected");
        }

        Self {
            disk_path: disk_path.into(),
            hostname: local_hostname(),
            accelerator,
            core_count,
            physical_cores,
            prev_cpu: read_cpu_times(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn sample(&mut self) -> ResourceReport {
        let now = read_cpu_times();
        let cpu_percent = match (self.prev_cpu, now) {
            (Some(prev), Some(now)) => cpu_usage(prev, now),
            _ => 0.0,
        };
        if now.is_some() {
            self.prev_cpu = now;
        }

        let (mem_percent, memory_total_mb) = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo(&s))
            .map(|(total_kb, avail_kb)| {
                let used = total_kb.saturating_sub(avail_kb) as f64;
                let pct = if total_kb == 0 { 0.0 } else { 100.0 * used / total_kb as f64 };
                (pct, total_kb / 1024)
            })
            .unwrap_or((0.0, 0));

        ResourceReport {
            cpu_percent,
            mem_percent,
            disk_free_gb: disk_free_gb(&self.disk_path).unwrap_or(0.0),
            has_accelerator: self.accelerator.is_some(),
            accelerator: self.accelerator.clone(),
            core_count: self.core_count,
            physical_cores: self.physical_cores,
            memory_total_mb,
            hostname: self.hostname.clone(),
            platform: std::env::consts::OS.to_string(),
            battery: read_battery(Path::new(POWER_SUPPLY_DIR)),
        }
    }
}

// ── Probes ────────────────────────────────────────────────────────────────────

pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

async fn probe_accelerator() -> Option<String> {
    let run = tokio::process::Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(ACCELERATOR_PROBE_TIMEOUT, run)
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn read_cpu_times() -> Option<CpuTimes> {
    parse_cpu_times(&std::fs::read_to_string("/proc/stat").ok()?)
}

fn disk_free_gb(path: &Path) -> Option<f64> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let bytes = stat.f_bavail as u64 * stat.f_frsize as u64;
    Some(bytes as f64 / 1_000_000_000.0)
}

fn read_battery(dir: &Path) -> Option<BatteryState> {
    for entry in std::fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        let kind = std::fs::read_to_string(path.join("type")).unwrap_or_default();
        if kind.trim() != "Battery" {
            continue;
        }
        let percent: f64 = std::fs::read_to_string(path.join("capacity"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let status = std::fs::read_to_string(path.join("status")).unwrap_or_default();
        return Some(BatteryState {
            percent,
            plugged: status.trim() != "Discharging",
        });
    }
    None
}

// ── Parsers ───────────────────────────────────────────────────────────────────

/// Aggregate `cpu` line of `/proc/stat`. Idle includes iowait.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    // guest/guest_nice are already counted in user/nice
    let total = fields.iter().take(8).sum();
    Some(CpuTimes { idle, total })
}

fn cpu_usage(prev: CpuTimes, now: CpuTimes) -> f64 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let idle = now.idle.saturating_sub(prev.idle).min(total);
    100.0 * (total - idle) as f64 / total as f64
}

/// `(MemTotal, MemAvailable)` in kB.
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some((total, available))
}

/// Distinct `(physical id, core id)` pairs in `/proc/cpuinfo`.
fn parse_physical_cores(cpuinfo: &str) -> Option<u32> {
    let mut cores = std::collections::HashSet::new();
    let mut physical = None;
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "physical id" => physical = Some(value.trim().to_string()),
            "core id" => {
                cores.insert((physical.clone(), value.trim().to_string()));
            }
            _ => {}
        }
    }
    if cores.is_empty() {
        None
    } else {
        Some(cores.len() as u32)
    }
}
