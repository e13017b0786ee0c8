//! Least-recently-used replacement, keyed on the cache's monotonic iteration stamp.

use super::ReplacementPolicy;
use crate::cache::CacheLine;

/// Evicts the line with the smallest `lru_stamp` in the set.
#[derive(Debug, Default, Clone, Copy)]
pub struct LruPolicy;

impl ReplacementPolicy for LruPolicy {
    fn on_hit(&self, line: &mut CacheLine, iteration: u64) {
        line.lru_stamp = iteration;
    }

    fn on_install(&self, line: &mut CacheLine, iteration: u64) {
        line.lru_stamp = iteration;
    }

    fn select_victim(&self, ways: &mut [CacheLine]) -> usize {
        let Some((way, _)) = ways.iter().enumerate().min_by_key(|(_, line)| line.lru_stamp) else {
            unreachable!("a set always has at least one way; `CacheConfig::validate` rejects ways == 0");
        };
        way
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_the_smallest_stamp() {
        let policy = LruPolicy;
        let mut ways = [
            CacheLine { valid: true, lru_stamp: 5, ..CacheLine::default() },
            CacheLine { valid: true, lru_stamp: 1, ..CacheLine::default() },
            CacheLine { valid: true, lru_stamp: 9, ..CacheLine::default() },
        ];
        assert_eq!(policy.select_victim(&mut ways), 1);
    }

    #[test]
    fn hit_and_install_both_refresh_the_stamp() {
        let policy = LruPolicy;
        let mut line = CacheLine::default();
        policy.on_install(&mut line, 3);
        assert_eq!(line.lru_stamp, 3);
        policy.on_hit(&mut line, 7);
        assert_eq!(line.lru_stamp, 7);
    }
}
