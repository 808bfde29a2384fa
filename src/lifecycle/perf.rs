use std::sync::Mutex;

use serde::Serialize;
use sysinfo::{Pid, ProcessExt, System, SystemExt};

use crate::task::TaskTracker;
use crate::worker::{ExecutorPools, PoolOccupancy};

#[derive(Debug, Clone, Serialize)]
pub struct PerfCounters {
    pub pools: Vec<PoolOccupancy>,
    /// Highest concurrent counts since the previous sample
    pub peak_validating: usize,
    pub peak_executing: usize,
    pub cpu_percent: Option<f64>,
    pub rss_bytes: Option<u64>,
}

struct ProcessStats {
    system: System,
    /// Set once a first refresh has given `cpu_usage` a baseline
    primed: bool,
}

/// Samples pool occupancy, peak counts and process CPU/memory.
pub struct PerfSampler {
    pid: Option<Pid>,
    stats: Mutex<ProcessStats>,
}

impl Default for PerfSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PerfSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfSampler").field("pid", &self.pid).finish()
    }
}

impl PerfSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::debug!(error = %e, "Process metrics unavailable");
                None
            }
        };
        Self {
            pid,
            stats: Mutex::new(ProcessStats {
                system: System::new(),
                primed: false,
            }),
        }
    }

    /// Take a sample. Resets the peak counters.
    pub fn sample(&self, tracker: &TaskTracker, pools: &ExecutorPools) -> PerfCounters {
        let (peak_validating, peak_executing) = tracker.take_peaks();
        let (cpu_percent, rss_bytes) = self.process_usage();
        PerfCounters {
            pools: pools.occupancy(),
            peak_validating,
            peak_executing,
            cpu_percent,
            rss_bytes,
        }
    }

    /// CPU use since the previous call (`None` on the first) and resident memory in bytes.
    fn process_usage(&self) -> (Option<f64>, Option<u64>) {
        let Some(pid) = self.pid else {
            return (None, None);
        };
        let mut guard = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stats = &mut *guard;
        stats.system.refresh_cpu();
        if !stats.system.refresh_process(pid) {
            return (None, None);
        }
        let Some((cpu, rss)) = stats
            .system
            .process(pid)
            .map(|process| (f64::from(process.cpu_usage()), process.memory()))
        else {
            return (None, None);
        };
        let primed = std::mem::replace(&mut stats.primed, true);
        (primed.then_some(cpu), Some(rss))
    }
}
