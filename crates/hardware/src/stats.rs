//! Run-level diagnostics.
//!
//! This module tracks the handful of aggregate counters the reference model
//! reports at the end of a run. It provides:
//! 1. **Tick accounting:** total ticks elapsed, for the `"Ticks - N"` line.
//! 2. **Pipeline counters:** instructions retired and branch mispredictions,
//!    summed across cores.
//! 3. **Memory counters:** completed cache requests.

use std::time::{Duration, Instant};

/// Aggregate counters for one simulation run.
#[derive(Debug, Clone)]
pub struct SimStats {
    start_time: Instant,
    /// Total ticks elapsed.
    pub ticks: u64,
    /// Instructions retired, summed across all cores.
    pub instructions_retired: u64,
    /// Branch mispredictions, summed across all cores.
    pub branch_mispredictions: u64,
    /// Cache memory requests that completed (popped off a pending queue).
    pub mem_completions: u64,
}

impl SimStats {
    /// Starts a fresh counter set with the clock running.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ticks: 0,
            instructions_retired: 0,
            branch_mispredictions: 0,
            mem_completions: 0,
        }
    }

    /// Wall-clock time elapsed since this counter set was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Instructions retired per tick, or `0.0` if no ticks have elapsed.
    #[must_use]
    pub fn ipc(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.instructions_retired as f64 / self.ticks as f64
        }
    }
}

impl Default for SimStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SimStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Ticks - {}", self.ticks)?;
        writeln!(f, "Instructions retired - {}", self.instructions_retired)?;
        writeln!(f, "IPC - {:.4}", self.ipc())?;
        writeln!(f, "Branch mispredictions - {}", self.branch_mispredictions)?;
        write!(f, "Memory completions - {}", self.mem_completions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_is_zero_before_any_ticks() {
        let stats = SimStats::new();
        assert_eq!(stats.ipc(), 0.0);
    }

    #[test]
    fn ipc_divides_instructions_by_ticks() {
        let mut stats = SimStats::new();
        stats.ticks = 4;
        stats.instructions_retired = 2;
        assert!((stats.ipc() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn display_includes_the_reference_ticks_line() {
        let mut stats = SimStats::new();
        stats.ticks = 42;
        let rendered = stats.to_string();
        assert!(rendered.starts_with("Ticks - 42"));
    }
}
