//! Linux `/proc` pressure source.

use std::fs;
use std::path::{Path, PathBuf};

use super::{PressureSource, RawPressure};
use crate::error::{StrataError, StrataResult};

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Host pressure read from `/proc/stat` and `/proc/meminfo`.
///
/// CPU utilization is the busy share of jiffies since the previous read; the
/// first read measures since boot.
#[derive(Debug, Clone)]
pub struct ProcPressureSource {
    stat_path: PathBuf,
    meminfo_path: PathBuf,
    previous_cpu: Option<CpuTimes>,
}

impl Default for ProcPressureSource {
    fn default() -> Self {
        Self::new("/proc/stat", "/proc/meminfo")
    }
}

impl ProcPressureSource {
    /// Read from custom paths.
    pub fn new(stat_path: impl Into<PathBuf>, meminfo_path: impl Into<PathBuf>) -> Self {
        Self {
            stat_path: stat_path.into(),
            meminfo_path: meminfo_path.into(),
            previous_cpu: None,
        }
    }
}

impl PressureSource for ProcPressureSource {
    fn read(&mut self) -> StrataResult<RawPressure> {
        let cpu_now = parse_proc_stat(&read_file(&self.stat_path)?)?;
        let cpu = cpu_utilization(self.previous_cpu, cpu_now);
        self.previous_cpu = Some(cpu_now);

        let memory = parse_meminfo_utilization(&read_file(&self.meminfo_path)?)?;

        Ok(RawPressure { cpu, memory })
    }

    fn name(&self) -> &str {
        "proc"
    }
}

fn read_file(path: &Path) -> StrataResult<String> {
    Ok(fs::read_to_string(path)?)
}

fn cpu_utilization(previous: Option<CpuTimes>, current: CpuTimes) -> f64 {
    let (busy, total) = match previous {
        Some(prev) => (
            current.busy.saturating_sub(prev.busy),
            current.total.saturating_sub(prev.total),
        ),
        None => (current.busy, current.total),
    };
    if total == 0 {
        return 0.0;
    }
    busy as f64 / total as f64
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
pub fn parse_proc_stat(contents: &str) -> StrataResult<CpuTimes> {
    let line = contents
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| StrataError::parse("aggregate cpu line missing in /proc/stat"))?;

    // user nice system idle iowait irq softirq steal; guest time is already
    // counted in user.
    let fields = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| parse_u64_field("proc_stat.cpu", v))
        .collect::<StrataResult<Vec<_>>>()?;
    if fields.len() < 4 {
        return Err(StrataError::parse("cpu line in /proc/stat has too few fields"));
    }

    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Memory utilization (`1 - MemAvailable / MemTotal`) from `/proc/meminfo`.
pub fn parse_meminfo_utilization(contents: &str) -> StrataResult<f64> {
    let mut total_kb = None;
    let mut available_kb = None;

    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let key = fields.next().unwrap_or_default();
        let value = fields.next().unwrap_or_default();
        match key {
            "MemTotal:" => total_kb = Some(parse_u64_field("meminfo.MemTotal", value)?),
            "MemAvailable:" => {
                available_kb = Some(parse_u64_field("meminfo.MemAvailable", value)?)
            }
            _ => {}
        }
    }

    let total_kb =
        total_kb.ok_or_else(|| StrataError::parse("MemTotal field missing in /proc/meminfo"))?;
    let available_kb = available_kb
        .ok_or_else(|| StrataError::parse("MemAvailable field missing in /proc/meminfo"))?;
    if total_kb == 0 {
        return Err(StrataError::parse("MemTotal is zero in /proc/meminfo"));
    }

    Ok(1.0 - (available_kb.min(total_kb) as f64 / total_kb as f64))
}

fn parse_u64_field(field: &str, value: &str) -> StrataResult<u64> {
    value
        .parse::<u64>()
        .map_err(|err| StrataError::parse(format!("invalid integer for {}: {}", field, err)))
}
