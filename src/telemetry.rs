//! Metrics collector
//!
//! Samples OS-level counters for inclusion in heartbeats. Values that
//! cannot be read on the current platform are simply absent; a partial
//! snapshot is never an error.

use outpost_proto::now_ms;
use serde::Serialize;
use std::path::Path;

const LOADAVG: &str = "/proc/loadavg";
const MEMINFO: &str = "/proc/meminfo";
const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Point-in-time snapshot handed to the connection manager
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub load_1m: Option<f64>,
    pub mem_available_kb: Option<u64>,
    pub cpu_temp_c: Option<f64>,
    pub sampled_at_ms: u64,
}

/// Collaborator contract: `sample() -> snapshot`
pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> TelemetrySnapshot;
}

/// Reads counters from procfs/sysfs
pub struct SystemMetrics;

impl MetricsSource for SystemMetrics {
    fn sample(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            load_1m: read(LOADAVG).as_deref().and_then(parse_loadavg),
            mem_available_kb: read(MEMINFO).as_deref().and_then(parse_meminfo),
            cpu_temp_c: read(THERMAL_ZONE).as_deref().and_then(parse_thermal),
            sampled_at_ms: now_ms(),
        }
    }
}

fn read(path: impl AsRef<Path>) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// First field of /proc/loadavg: 1-minute load average
fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

/// MemAvailable line of /proc/meminfo, in kB
fn parse_meminfo(raw: &str) -> Option<u64> {
    raw.lines()
        .find(|line| line.starts_with("MemAvailable:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Thermal zone reports millidegrees Celsius
fn parse_thermal(raw: &str) -> Option<f64> {
    let millis: i64 = raw.trim().parse().ok()?;
    Some(millis as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 12345\n"), Some(0.52));
        assert_eq!(parse_loadavg(""), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let raw = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\nMemAvailable:    8192000 kB\n";
        assert_eq!(parse_meminfo(raw), Some(8_192_000));
        assert_eq!(parse_meminfo("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_parse_thermal() {
        assert_eq!(parse_thermal("45216\n"), Some(45.216));
        assert_eq!(parse_thermal("garbage"), None);
    }

    #[test]
    fn test_sample_never_panics() {
        let snapshot = SystemMetrics.sample();
        assert!(snapshot.sampled_at_ms > 0);
    }
}
