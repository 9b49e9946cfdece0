//! Point-in-time readings of process resource usage.
//!
//! Two styles are available. [`ProcessCpuTime`] reads the cumulative user and
//! system CPU time of this process, so deltas between two readings are exact
//! and never negative. [`SystemCpuPercent`] samples the OS-wide busy
//! percentage since its previous reading, matching the older collector
//! dashboards; its deltas are noisy and must be clamped by the caller.

use crate::error::TelemetryError;
use std::sync::{Mutex, PoisonError};

/// A single reading of CPU and resident memory.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Snapshot {
    pub cpu_seconds: f64,
    pub resident_bytes: u64,
}

/// Source of [`Snapshot`]s.
///
/// Implementations must be cheap and must not block on anything but a local
/// read, since they run on both sides of every instrumented call.
pub trait ProcessProbe: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

/// Cumulative process CPU time (user + system) and current RSS.
#[derive(Debug, Clone, Copy)]
pub struct ProcessCpuTime {
    _probed: (),
}

impl ProcessCpuTime {
    /// Creates the probe after checking that the OS counters are readable.
    ///
    /// # Errors
    /// Returns [`TelemetryError::ProbeUnavailable`] if CPU time or RSS cannot be read on this host.
    pub fn new() -> Result<Self, TelemetryError> {
        read_cpu_seconds()?;
        read_resident_bytes()?;
        Ok(Self { _probed: () })
    }
}

impl ProcessProbe for ProcessCpuTime {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            cpu_seconds: read_cpu_seconds().unwrap_or_else(|e| {
                log::trace!("cpu time read failed: {e}");
                0.0
            }),
            resident_bytes: read_resident_memory(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTicks {
    busy: u64,
    total: u64,
}

/// OS-wide CPU busy percentage since the previous reading.
///
/// The first reading has no reference point and reports `0.0`.
#[derive(Debug)]
pub struct SystemCpuPercent {
    last: Mutex<Option<CpuTicks>>,
}

impl SystemCpuPercent {
    /// # Errors
    /// Returns [`TelemetryError::ProbeUnavailable`] if `/proc/stat` or RSS cannot be read.
    pub fn new() -> Result<Self, TelemetryError> {
        read_cpu_ticks()?;
        read_resident_bytes()?;
        Ok(Self {
            last: Mutex::new(None),
        })
    }

    fn sample(&self) -> f64 {
        let Ok(now) = read_cpu_ticks() else {
            return 0.0;
        };
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = last.replace(now);
        previous.map_or(0.0, |prev| busy_percent(prev, now))
    }
}

impl ProcessProbe for SystemCpuPercent {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            cpu_seconds: self.sample(),
            resident_bytes: read_resident_memory(),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn busy_percent(prev: CpuTicks, now: CpuTicks) -> f64 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let busy = now.busy.saturating_sub(prev.busy);
    (busy as f64 / total as f64 * 1000.0).round() / 10.0
}

fn read_resident_memory() -> u64 {
    read_resident_bytes().unwrap_or_else(|e| {
        log::trace!("rss read failed: {e}");
        0
    })
}

#[cfg(unix)]
#[allow(clippy::cast_precision_loss)]
fn read_cpu_seconds() -> Result<f64, TelemetryError> {
    use nix::sys::{
        resource::{UsageWho, getrusage},
        time::TimeVal,
    };

    let seconds = |tv: TimeVal| tv.tv_sec() as f64 + tv.tv_usec() as f64 / 1_000_000.0;
    let usage = getrusage(UsageWho::RUSAGE_SELF)
        .map_err(|e| TelemetryError::ProbeUnavailable(format!("getrusage: {e}")))?;
    Ok(seconds(usage.user_time()) + seconds(usage.system_time()))
}

#[cfg(not(unix))]
fn read_cpu_seconds() -> Result<f64, TelemetryError> {
    Err(TelemetryError::ProbeUnavailable(
        "process cpu time is only supported on unix".into(),
    ))
}

#[cfg(target_os = "linux")]
fn read_resident_bytes() -> Result<u64, TelemetryError> {
    let status = std::fs::read_to_string("/proc/self/status")
        .map_err(|e| TelemetryError::ProbeUnavailable(format!("/proc/self/status: {e}")))?;
    parse_vm_rss(&status).ok_or_else(|| {
        TelemetryError::ProbeUnavailable("VmRSS missing from /proc/self/status".into())
    })
}

// Outside Linux the peak RSS is the closest counter getrusage offers.
#[cfg(all(unix, not(target_os = "linux")))]
fn read_resident_bytes() -> Result<u64, TelemetryError> {
    use nix::sys::resource::{UsageWho, getrusage};

    let usage = getrusage(UsageWho::RUSAGE_SELF)
        .map_err(|e| TelemetryError::ProbeUnavailable(format!("getrusage: {e}")))?;
    let max_rss = u64::try_from(usage.max_rss()).unwrap_or(0);
    if cfg!(target_os = "macos") {
        Ok(max_rss)
    } else {
        Ok(max_rss * 1024)
    }
}

#[cfg(not(unix))]
fn read_resident_bytes() -> Result<u64, TelemetryError> {
    Err(TelemetryError::ProbeUnavailable(
        "resident memory is only supported on unix".into(),
    ))
}

#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Result<CpuTicks, TelemetryError> {
    let stat = std::fs::read_to_string("/proc/stat")
        .map_err(|e| TelemetryError::ProbeUnavailable(format!("/proc/stat: {e}")))?;
    stat.lines()
        .next()
        .and_then(parse_cpu_line)
        .ok_or_else(|| TelemetryError::ProbeUnavailable("malformed /proc/stat".into()))
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks() -> Result<CpuTicks, TelemetryError> {
    Err(TelemetryError::ProbeUnavailable(
        "system cpu percentage requires /proc/stat".into(),
    ))
}

/// Parses the `VmRSS:  1234 kB` line of `/proc/<pid>/status` into bytes.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
///
/// Idle and iowait jiffies count as not busy; guest time is already folded
/// into user time by the kernel and is skipped.
fn parse_cpu_line(line: &str) -> Option<CpuTicks> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields
        .take(8)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTicks {
        busy: total - idle,
        total,
    })
}
