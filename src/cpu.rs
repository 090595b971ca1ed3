use std::collections::VecDeque;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

pub const CPU_HISTORY_SIZE: usize = 300;

/// Fixed-capacity ring of CPU samples, newest last.
#[derive(Debug, Clone)]
pub struct CpuHistory {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl Default for CpuHistory {
    fn default() -> Self {
        Self::with_capacity(CPU_HISTORY_SIZE)
    }
}

impl CpuHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<f32> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.samples.iter().copied().collect()
    }
}

/// Incremental per-process CPU usage.
///
/// `sysinfo` computes usage as the delta since the previous refresh of the
/// same pid, so keeping one `System` alive across ticks yields the usage over
/// the last tick without blocking. The first sample for a new pid is 0.
pub struct CpuSampler {
    system: System,
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Refreshes all `pids` in one pass. Pids that vanished are dropped from
    /// the sampler's table.
    pub fn refresh(&mut self, pids: &[u32]) {
        let pids: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&pids), true);
    }

    /// Usage (percent of one core) observed at the last refresh, or `None`
    /// if the process is gone.
    pub fn usage(&self, pid: u32) -> Option<f32> {
        self.system
            .process(Pid::from_u32(pid))
            .filter(|process| process.status() != ProcessStatus::Zombie)
            .map(|process| process.cpu_usage())
    }
}
