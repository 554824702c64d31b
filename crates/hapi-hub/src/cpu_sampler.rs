//! Periodic process CPU/memory sampler, one of the background loops
//! `daemon.rs` runs alongside the inactive-session sweep, bead poll,
//! and team-expiry timers.
//!
//! Grounded on `hapi-telemetry`'s `MetricsCollector` gauge API: each
//! tick records `process_cpu_percent` and `process_rss_bytes` so the
//! hub exposes its own resource footprint the same way it exposes
//! request metrics. Reads `/proc/self/stat`/`/proc/self/status`
//! directly — Linux-only, best-effort; a read failure just skips that
//! tick rather than failing the loop.

use std::time::Instant;

use hapi_telemetry::metrics::MetricsCollector;

/// `/proc/[pid]/stat` reports ticks in `sysconf(_SC_CLK_TCK)` units.
/// 100 is the near-universal default on Linux and a constant lets us
/// avoid a `libc` dependency for the one value this loop needs.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

struct ProcessTimes {
    utime_ticks: u64,
    stime_ticks: u64,
}

fn read_process_times() -> Option<ProcessTimes> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields after the `(comm)` parenthesized group are space-separated
    // and fixed-position; comm itself may contain spaces/parens, so
    // split on the last ')' rather than whitespace from the start.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // utime is field 14, stime is field 15 overall (1-indexed); after
    // stripping "pid (comm) state" (fields 1-3) the remaining fields
    // are indexed from 0 starting at field 4 ("ppid"), so utime is at
    // offset 14 - 4 = 10, stime at 11.
    let utime_ticks = fields.get(10)?.parse().ok()?;
    let stime_ticks = fields.get(11)?.parse().ok()?;
    Some(ProcessTimes { utime_ticks, stime_ticks })
}

fn read_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Tracks enough state between ticks to turn cumulative CPU-tick
/// counters into a percentage of one core over the sampling window.
pub struct CpuSampler {
    last_sample: Instant,
    last_cpu_ticks: u64,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self { last_sample: Instant::now(), last_cpu_ticks: read_process_times().map(total_ticks).unwrap_or(0) }
    }

    /// Samples current CPU/RSS and records both into `metrics`.
    /// Silently skips the tick if `/proc` is unavailable (non-Linux).
    pub fn tick(&mut self, metrics: &MetricsCollector) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample).as_secs_f64();
        self.last_sample = now;

        if let Some(times) = read_process_times() {
            let ticks = total_ticks(times);
            let delta_ticks = ticks.saturating_sub(self.last_cpu_ticks);
            self.last_cpu_ticks = ticks;
            if elapsed > 0.0 {
                let cpu_seconds = delta_ticks as f64 / CLOCK_TICKS_PER_SEC;
                let percent = (cpu_seconds / elapsed) * 100.0;
                metrics.set_gauge("process_cpu_percent", percent.round() as i64);
            }
        }

        if let Some(rss) = read_rss_bytes() {
            metrics.set_gauge("process_rss_bytes", rss as i64);
        }
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn total_ticks(times: ProcessTimes) -> u64 {
    times.utime_ticks + times.stime_ticks
}
