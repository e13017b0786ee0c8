//! Branch predictor: two-bit saturating counters, a BTB, and a BHR.
//!
//! The predictor's `predict` call is both prediction and training: the
//! caller supplies the actual outcome, the predictor reports what it would
//! have predicted, then updates its state before the next call.

use crate::common::addr::Addr;
use crate::common::error::ConfigError;
use crate::common::trace::TraceOp;
use crate::config::{BranchConfig, BranchMode};

/// A branch target buffer entry: valid only at indices the counter predicts taken.
#[derive(Clone, Copy, Debug, Default)]
struct BtbEntry {
    tag: u64,
    target: Addr,
    valid: bool,
}

/// The branch predictor: PHT of 2-bit counters, BTB, and branch history register.
#[derive(Debug)]
pub struct BranchPredictor {
    config: BranchConfig,
    pht: Vec<u8>,
    btb: Vec<BtbEntry>,
    bhr: u64,
    bhr_mask: u64,
    index_mask: u64,
}

impl BranchPredictor {
    /// Builds a predictor from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnimplementedMode`] if `config.mode` is
    /// [`BranchMode::YehPatt`].
    pub fn new(config: BranchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let size = 1usize << config.s;
        Ok(Self {
            config,
            pht: vec![1; size], // weakly-not-taken
            btb: vec![BtbEntry::default(); size],
            bhr: 0,
            bhr_mask: (1u64 << config.b) - 1,
            index_mask: (size as u64) - 1,
        })
    }

    fn index(&self, pc: Addr) -> usize {
        let pc_bits = pc.0 >> 3;
        let tag = match self.config.mode {
            BranchMode::Default => pc_bits,
            BranchMode::Gshare => pc_bits ^ self.bhr,
            BranchMode::Gselect => pc_bits | (self.bhr << self.config.s),
            BranchMode::YehPatt => unreachable!("rejected at construction"),
        };
        (tag & self.index_mask) as usize
    }

    /// Predicts and trains on one branch op, returning the predicted next PC.
    ///
    /// `op.next_pc` carries the actual outcome: the caller is expected to
    /// compare the returned prediction against it to detect a misprediction.
    pub fn predict(&mut self, op: &TraceOp) -> Addr {
        let idx = self.index(op.pc);
        let counter = self.pht[idx];
        let entry = self.btb[idx];

        let predicted = if counter >= 2 && entry.valid {
            entry.target
        } else {
            Addr(op.pc.0 + 4)
        };

        self.update(idx, op.pc, op.next_pc);
        predicted
    }

    fn update(&mut self, idx: usize, pc: Addr, actual_next_pc: Addr) {
        let not_taken = actual_next_pc.0 == pc.0 + 4;
        if not_taken {
            if self.pht[idx] > 0 {
                self.pht[idx] -= 1;
            }
        } else {
            if self.pht[idx] < 3 {
                self.pht[idx] += 1;
            }
            self.btb[idx] = BtbEntry {
                tag: pc.0,
                target: actual_next_pc,
                valid: true,
            };
        }

        if matches!(self.config.mode, BranchMode::Gshare | BranchMode::Gselect) {
            let taken_bit = u64::from(!not_taken);
            self.bhr = ((self.bhr << 1) | taken_bit) & self.bhr_mask;
        }

        if !not_taken {
            tracing::debug!(pc = %pc, predicted_taken = true, "branch resolved taken");
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::common::trace::OpKind;

    fn branch_op(pc: u64, next_pc: u64) -> TraceOp {
        TraceOp {
            op_kind: OpKind::Branch,
            pc: Addr(pc),
            next_pc: Addr(next_pc),
            addr: Addr(0),
            size: 0,
            dest_reg: -1,
            src_reg: [-1, -1],
        }
    }

    /// (S1) Branch-predictor warmup: default mode, s=2.
    #[test]
    fn warms_up_to_saturated_taken_prediction() {
        let config = BranchConfig {
            s: 2,
            b: 2,
            mode: BranchMode::Default,
        };
        let mut bp = BranchPredictor::new(config).unwrap();

        for _ in 0..4 {
            bp.predict(&branch_op(0x40, 0x80));
        }
        let idx = bp.index(Addr(0x40));
        assert_eq!(bp.pht[idx], 3);

        let prediction = bp.predict(&branch_op(0x40, 0x80));
        assert_eq!(prediction, Addr(0x80));
    }

    #[test]
    fn not_taken_decrements_with_floor_zero() {
        let config = BranchConfig {
            s: 2,
            b: 2,
            mode: BranchMode::Default,
        };
        let mut bp = BranchPredictor::new(config).unwrap();
        for _ in 0..5 {
            bp.predict(&branch_op(0x40, 0x44));
        }
        let idx = bp.index(Addr(0x40));
        assert_eq!(bp.pht[idx], 0);
    }

    #[test]
    fn yeh_patt_is_rejected_at_construction() {
        let config = BranchConfig {
            s: 2,
            b: 2,
            mode: BranchMode::YehPatt,
        };
        assert!(BranchPredictor::new(config).is_err());
    }

    #[test]
    fn gshare_folds_history_into_the_index() {
        let config = BranchConfig {
            s: 4,
            b: 4,
            mode: BranchMode::Gshare,
        };
        let mut bp = BranchPredictor::new(config).unwrap();
        let idx_before = bp.index(Addr(0x100));
        bp.predict(&branch_op(0x200, 0x300)); // trains BHR via an unrelated branch
        let idx_after = bp.index(Addr(0x100));
        assert_ne!(idx_before, idx_after);
    }

    #[rstest]
    #[case(BranchMode::Default)]
    #[case(BranchMode::Gshare)]
    #[case(BranchMode::Gselect)]
    fn every_implemented_mode_indexes_within_table_bounds(#[case] mode: BranchMode) {
        let config = BranchConfig { s: 5, b: 3, mode };
        let bp = BranchPredictor::new(config).unwrap();
        for pc in [0x0, 0x40, 0x1000, 0xFFFF_FFFF] {
            assert!(bp.index(Addr(pc)) < bp.pht.len());
        }
    }
}
