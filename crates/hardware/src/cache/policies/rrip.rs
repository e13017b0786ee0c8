//! Re-reference interval prediction replacement.

use super::ReplacementPolicy;
use crate::cache::CacheLine;

/// Repeatedly scans for a line at the maximum re-reference value; if none is
/// found, ages the whole set by one and rescans. `0 ≤ rrpv ≤ max` is
/// maintained as an invariant by every mutation.
#[derive(Debug, Clone, Copy)]
pub struct RripPolicy {
    /// `R`, the maximum re-reference prediction value (`2^rrip_bits - 1`).
    pub max: u8,
}

impl ReplacementPolicy for RripPolicy {
    fn on_hit(&self, line: &mut CacheLine, _iteration: u64) {
        line.rrpv = 0;
    }

    fn on_install(&self, line: &mut CacheLine, _iteration: u64) {
        line.rrpv = self.max.saturating_sub(1);
    }

    fn select_victim(&self, ways: &mut [CacheLine]) -> usize {
        loop {
            if let Some(way) = ways.iter().position(|line| line.rrpv == self.max) {
                return way;
            }
            for line in ways.iter_mut() {
                line.rrpv = (line.rrpv + 1).min(self.max);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_the_set_until_a_line_saturates() {
        let policy = RripPolicy { max: 3 };
        let mut ways = [
            CacheLine { valid: true, rrpv: 1, ..CacheLine::default() },
            CacheLine { valid: true, rrpv: 2, ..CacheLine::default() },
        ];
        let victim = policy.select_victim(&mut ways);
        assert_eq!(victim, 1);
        assert_eq!(ways[0].rrpv, 2);
    }

    #[test]
    fn k_equals_one_is_bimodal() {
        let policy = RripPolicy { max: 1 };
        let mut ways = [
            CacheLine { valid: true, rrpv: 0, ..CacheLine::default() },
            CacheLine { valid: true, rrpv: 1, ..CacheLine::default() },
        ];
        assert_eq!(policy.select_victim(&mut ways), 1);
    }

    #[test]
    fn install_sets_rrpv_to_max_minus_one() {
        let policy = RripPolicy { max: 3 };
        let mut line = CacheLine::default();
        policy.on_install(&mut line, 0);
        assert_eq!(line.rrpv, 2);
    }
}
