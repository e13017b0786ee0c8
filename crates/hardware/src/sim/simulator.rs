//! Top-level simulator: wires branch, cache, coherence, and processor
//! together and drives the per-tick loop.

use crate::branch::BranchPredictor;
use crate::cache::Cache;
use crate::coherence::Coherence;
use crate::common::error::SimError;
use crate::common::trace::TraceReader;
use crate::config::SimConfig;
use crate::processor::Processor;
use crate::stats::SimStats;

/// Owns every subsystem for one run and advances them tick by tick.
///
/// Per tick: cache's pending queue is advanced first (resolving coherence
/// for requests issued on a prior tick and reporting completions), then
/// each core's processor pipeline ticks in turn, issuing new cache requests
/// as its schedule stage fires memory ops.
#[derive(Debug)]
pub struct Simulator {
    branch: BranchPredictor,
    cache: Cache,
    coherence: Coherence,
    processor: Processor,
    trace: Box<dyn TraceReader>,
    stats: SimStats,
    core_count: usize,
}

impl Simulator {
    /// Builds a simulator from a validated configuration and a trace source.
    ///
    /// # Errors
    ///
    /// Returns [`SimError`] if `config` fails validation.
    pub fn new(config: SimConfig, trace: Box<dyn TraceReader>) -> Result<Self, SimError> {
        config.validate()?;
        let branch = BranchPredictor::new(config.branch)?;
        let cache = Cache::new(config.cache, config.core_count)?;
        let coherence = Coherence::new(config.protocol, config.core_count);
        let processor = Processor::new(config.processor, config.core_count, config.stall_ticks);
        Ok(Self {
            branch,
            cache,
            coherence,
            processor,
            trace,
            stats: SimStats::new(),
            core_count: config.core_count,
        })
    }

    /// Advances every core by one tick. Returns whether anything progressed.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Invariant`] if the cache's pending queue observes
    /// an inconsistent state while resolving coherence.
    pub fn tick(&mut self) -> Result<bool, SimError> {
        #[cfg(feature = "always-trace")]
        tracing::trace!(tick = self.stats.ticks, "tick start");

        let mut progress = false;

        let completions = self.cache.advance_pending_queue(&mut self.coherence)?;
        for (core_id, request_tag) in completions {
            self.processor.mem_op_callback(core_id, request_tag);
            self.stats.mem_completions += 1;
            progress = true;
        }

        for core_id in 0..self.core_count {
            let core_progress =
                self.processor
                    .tick(core_id, &mut *self.trace, &mut self.branch, &mut self.cache);
            progress |= core_progress;
        }

        self.stats.ticks += 1;
        Ok(progress)
    }

    /// Runs until no tick makes progress and every core has drained its
    /// trace, returning the final diagnostic counters.
    ///
    /// # Errors
    ///
    /// Returns [`SimError`] if a tick observes an invariant violation.
    pub fn run(&mut self) -> Result<&SimStats, SimError> {
        tracing::info!(core_count = self.core_count, "simulation starting");
        loop {
            let progress = self.tick()?;
            if !progress && self.processor.is_finished() {
                break;
            }
        }

        let (instructions_retired, branch_mispredictions) = self.processor.totals();
        self.stats.instructions_retired = instructions_retired;
        self.stats.branch_mispredictions = branch_mispredictions;
        tracing::info!(ticks = self.stats.ticks, "simulation finished");
        Ok(&self.stats)
    }

    /// The diagnostic counters accumulated so far.
    #[must_use]
    pub fn stats(&self) -> &SimStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::trace::VecTraceReader;

    #[test]
    fn an_empty_trace_finishes_after_one_tick() {
        let config = SimConfig::default();
        let trace = Box::new(VecTraceReader::new(vec![vec![]]));
        let mut sim = Simulator::new(config, trace).unwrap();
        let stats = sim.run().unwrap();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.instructions_retired, 0);
    }

    #[test]
    fn yeh_patt_is_rejected_at_construction() {
        let mut config = SimConfig::default();
        config.branch.mode = crate::config::BranchMode::YehPatt;
        let trace = Box::new(VecTraceReader::new(vec![vec![]]));
        assert!(Simulator::new(config, trace).is_err());
    }
}
