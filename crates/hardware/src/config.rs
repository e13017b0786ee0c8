//! Configuration system for the simulator.
//!
//! This module defines all configuration structures and enums used to
//! parameterize the four core subsystems plus run-level settings. It
//! provides:
//! 1. **Defaults:** Baseline per-component constants.
//! 2. **Structures:** `BranchConfig`, `CacheConfig`, `ProcessorConfig`, `SimConfig`.
//! 3. **Enums:** `BranchMode`, `Protocol`, `ReplacementPolicy`.
//!
//! Configuration is supplied as JSON (for scripted/batch runs) or built up
//! from parsed CLI flags; `SimConfig::default()` gives a small-but-functional
//! simulation suitable for unit tests.

use serde::Deserialize;

use crate::common::error::ConfigError;

/// Default configuration constants for the simulator.
mod defaults {
    /// Default number of simulated cores.
    pub const CORE_COUNT: usize = 1;

    /// Default log2 of the branch predictor's PHT/BTB size.
    pub const BRANCH_S: u32 = 8;

    /// Default branch history register width in bits.
    pub const BRANCH_B: u32 = 8;

    /// Default cache associativity (ways per set).
    pub const CACHE_WAYS: usize = 4;

    /// Default log2 of the cache's set count.
    pub const CACHE_S: u32 = 6;

    /// Default log2 of the cache's block size.
    pub const CACHE_B: u32 = 6;

    /// Default victim buffer entry count (0 disables it).
    pub const CACHE_VICTIM: usize = 0;

    /// Default RRIP bits (0 disables RRIP, falling back to LRU).
    pub const CACHE_RRIP_BITS: u32 = 0;

    /// Default fetch width, in ops per tick.
    pub const FETCH_WIDTH: usize = 4;

    /// Default dispatch-queue capacity multiplier.
    pub const DISPATCH_MULTIPLIER: usize = 2;

    /// Default schedule-queue capacity multiplier.
    pub const SCHEDULE_MULTIPLIER: usize = 2;

    /// Default number of fast (1-stage) functional units.
    pub const FAST_FUS: usize = 2;

    /// Default number of long (3-stage) functional units.
    pub const LONG_FUS: usize = 1;

    /// Default number of common data buses.
    pub const CDB_COUNT: usize = 2;

    /// Default watchdog period, in ticks with no progress, before a stall diagnostic.
    pub const STALL_TICKS: u64 = 100_000;
}

/// Cache replacement policy selector.
///
/// `k = 0` means LRU; `k > 0` means RRIP with `R = 2^k - 1`. This enum is
/// the config-facing mirror of that rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplacementPolicy {
    /// Least-recently-used, keyed on the cache's monotonic iteration stamp.
    #[default]
    Lru,
    /// Re-reference interval prediction, with `R` saturating counters per line.
    Rrip,
}

/// Cache-coherence protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Two stable states: Invalid, Modified.
    Mi,
    /// Adds Shared.
    #[default]
    Msi,
    /// Adds Exclusive.
    Mesi,
    /// Adds Forward (one designated responder among sharers).
    Mesif,
}

/// Branch prediction indexing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchMode {
    /// `tag = (pc >> 3) & (2^s - 1)`, no history folding.
    #[default]
    Default,
    /// `tag = ((pc >> 3) & (2^s - 1)) XOR bhr`.
    Gshare,
    /// `tag = (pc >> 3) | (bhr << s)`, truncated to `2^s` entries.
    Gselect,
    /// Two-level adaptive predictor. Not implemented; selecting it is a
    /// `ConfigError::UnimplementedMode`.
    YehPatt,
}

/// Branch predictor configuration: the reference model's `p, s, b, g` flags.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BranchConfig {
    /// Log2 of the PHT/BTB entry count.
    #[serde(default = "BranchConfig::default_s")]
    pub s: u32,
    /// Branch history register width, in bits.
    #[serde(default = "BranchConfig::default_b")]
    pub b: u32,
    /// Prediction indexing mode.
    #[serde(default)]
    pub mode: BranchMode,
}

impl BranchConfig {
    fn default_s() -> u32 {
        defaults::BRANCH_S
    }

    fn default_b() -> u32 {
        defaults::BRANCH_B
    }

    /// Validates this configuration, rejecting unimplemented modes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnimplementedMode`] for [`BranchMode::YehPatt`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == BranchMode::YehPatt {
            return Err(ConfigError::UnimplementedMode(self.mode));
        }
        Ok(())
    }
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            s: defaults::BRANCH_S,
            b: defaults::BRANCH_B,
            mode: BranchMode::default(),
        }
    }
}

/// Per-core cache configuration: the reference model's `E, s, b, i, R` flags.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CacheConfig {
    /// Associativity (ways per set).
    #[serde(default = "CacheConfig::default_ways")]
    pub ways: usize,
    /// Log2 of the set count. `s = 0` collapses to one fully-associative set.
    #[serde(default = "CacheConfig::default_s")]
    pub s: u32,
    /// Log2 of the block size. `b = 0` makes every access its own block.
    #[serde(default = "CacheConfig::default_b")]
    pub b: u32,
    /// Victim buffer entry count; 0 disables the victim buffer.
    #[serde(default = "CacheConfig::default_victim")]
    pub victim_entries: usize,
    /// RRIP counter width in bits; 0 disables RRIP (falls back to LRU).
    #[serde(default = "CacheConfig::default_rrip_bits")]
    pub rrip_bits: u32,
}

impl CacheConfig {
    fn default_ways() -> usize {
        defaults::CACHE_WAYS
    }

    fn default_s() -> u32 {
        defaults::CACHE_S
    }

    fn default_b() -> u32 {
        defaults::CACHE_B
    }

    fn default_victim() -> usize {
        defaults::CACHE_VICTIM
    }

    fn default_rrip_bits() -> u32 {
        defaults::CACHE_RRIP_BITS
    }

    /// The replacement policy implied by `rrip_bits`.
    #[must_use]
    pub fn policy(&self) -> ReplacementPolicy {
        if self.rrip_bits == 0 {
            ReplacementPolicy::Lru
        } else {
            ReplacementPolicy::Rrip
        }
    }

    /// `R = 2^rrip_bits - 1`, the maximum RRPV value.
    #[must_use]
    pub fn rrip_max(&self) -> u8 {
        ((1u32 << self.rrip_bits) - 1) as u8
    }

    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroWays`] if `ways == 0`, or
    /// [`ConfigError::AddressBitsOverflow`] if `s + b > 64`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ways == 0 {
            return Err(ConfigError::ZeroWays);
        }
        if self.s + self.b > 64 {
            return Err(ConfigError::AddressBitsOverflow {
                s: self.s,
                b: self.b,
            });
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ways: defaults::CACHE_WAYS,
            s: defaults::CACHE_S,
            b: defaults::CACHE_B,
            victim_entries: defaults::CACHE_VICTIM,
            rrip_bits: defaults::CACHE_RRIP_BITS,
        }
    }
}

/// Processor pipeline configuration: the reference model's `f, d, m, j, k, c` flags.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProcessorConfig {
    /// Fetch width: ops pulled from the trace per tick.
    #[serde(default = "ProcessorConfig::default_fetch")]
    pub fetch_width: usize,
    /// Dispatch-queue capacity multiplier (`D`).
    #[serde(default = "ProcessorConfig::default_dispatch_mult")]
    pub dispatch_multiplier: usize,
    /// Schedule-queue capacity multiplier (`M`).
    #[serde(default = "ProcessorConfig::default_schedule_mult")]
    pub schedule_multiplier: usize,
    /// Number of fast, single-stage functional units (`J`).
    pub fast_fus: usize,
    /// Number of long, three-stage functional units (`K`).
    pub long_fus: usize,
    /// Number of common data buses (`C`).
    pub cdb_count: usize,
}

impl ProcessorConfig {
    fn default_fetch() -> usize {
        defaults::FETCH_WIDTH
    }

    fn default_dispatch_mult() -> usize {
        defaults::DISPATCH_MULTIPLIER
    }

    fn default_schedule_mult() -> usize {
        defaults::SCHEDULE_MULTIPLIER
    }

    /// Capacity of the dispatch queue: `D * (M*J + M*K)`.
    #[must_use]
    pub fn dispatch_capacity(&self) -> usize {
        self.dispatch_multiplier * (self.schedule_multiplier * self.fast_fus + self.schedule_multiplier * self.long_fus)
    }

    /// Capacity of the fast schedule queue: `M * J`.
    #[must_use]
    pub fn fast_schedule_capacity(&self) -> usize {
        self.schedule_multiplier * self.fast_fus
    }

    /// Capacity of the long schedule queue: `M * K`.
    #[must_use]
    pub fn long_schedule_capacity(&self) -> usize {
        self.schedule_multiplier * self.long_fus
    }

    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NonPositiveCount`] if any width/count field is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields: [(&'static str, usize); 6] = [
            ("fetch_width", self.fetch_width),
            ("dispatch_multiplier", self.dispatch_multiplier),
            ("schedule_multiplier", self.schedule_multiplier),
            ("fast_fus", self.fast_fus),
            ("long_fus", self.long_fus),
            ("cdb_count", self.cdb_count),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(ConfigError::NonPositiveCount {
                    field,
                    value: value as i64,
                });
            }
        }
        Ok(())
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            fetch_width: defaults::FETCH_WIDTH,
            dispatch_multiplier: defaults::DISPATCH_MULTIPLIER,
            schedule_multiplier: defaults::SCHEDULE_MULTIPLIER,
            fast_fus: defaults::FAST_FUS,
            long_fus: defaults::LONG_FUS,
            cdb_count: defaults::CDB_COUNT,
        }
    }
}

/// Root configuration aggregating all per-component settings plus run-level fields.
///
/// # Examples
///
/// ```
/// use cadss_core::config::SimConfig;
///
/// let config = SimConfig::default();
/// assert_eq!(config.core_count, 1);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    /// Number of simulated cores.
    #[serde(default = "SimConfig::default_core_count")]
    pub core_count: usize,
    /// Coherence protocol in use across all per-core caches.
    #[serde(default)]
    pub protocol: Protocol,
    /// Branch predictor settings.
    #[serde(default)]
    pub branch: BranchConfig,
    /// Per-core cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Processor pipeline settings.
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Ticks with no progress before the stall watchdog emits a diagnostic.
    #[serde(default = "SimConfig::default_stall_ticks")]
    pub stall_ticks: u64,
}

impl SimConfig {
    fn default_core_count() -> usize {
        defaults::CORE_COUNT
    }

    fn default_stall_ticks() -> u64 {
        defaults::STALL_TICKS
    }

    /// Validates every component's configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] encountered across branch, cache,
    /// and processor validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.branch.validate()?;
        self.cache.validate()?;
        self.processor.validate()?;
        if self.core_count == 0 {
            return Err(ConfigError::NonPositiveCount {
                field: "core_count",
                value: 0,
            });
        }
        Ok(())
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            core_count: defaults::CORE_COUNT,
            protocol: Protocol::default(),
            branch: BranchConfig::default(),
            cache: CacheConfig::default(),
            processor: ProcessorConfig::default(),
            stall_ticks: defaults::STALL_TICKS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn yeh_patt_is_rejected() {
        let mut config = SimConfig::default();
        config.branch.mode = BranchMode::YehPatt;
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnimplementedMode(BranchMode::YehPatt))
        );
    }

    #[test]
    fn zero_ways_is_rejected() {
        let mut config = SimConfig::default();
        config.cache.ways = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroWays));
    }

    #[test]
    fn oversized_address_bits_are_rejected() {
        let mut config = SimConfig::default();
        config.cache.s = 40;
        config.cache.b = 30;
        assert_eq!(
            config.validate(),
            Err(ConfigError::AddressBitsOverflow { s: 40, b: 30 })
        );
    }

    #[test]
    fn rrip_policy_selection_follows_bit_width() {
        let mut cache = CacheConfig::default();
        assert_eq!(cache.policy(), ReplacementPolicy::Lru);
        cache.rrip_bits = 2;
        assert_eq!(cache.policy(), ReplacementPolicy::Rrip);
        assert_eq!(cache.rrip_max(), 3);
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"{
            "core_count": 2,
            "protocol": "MESI",
            "branch": {"s": 4, "b": 4, "mode": "gshare"},
            "cache": {"ways": 2, "s": 1, "b": 4, "victim_entries": 0, "rrip_bits": 0},
            "processor": {"fetch_width": 2, "dispatch_multiplier": 2, "schedule_multiplier": 2, "fast_fus": 1, "long_fus": 1, "cdb_count": 1}
        }"#;
        let config: SimConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.core_count, 2);
        assert_eq!(config.protocol, Protocol::Mesi);
        assert_eq!(config.branch.mode, BranchMode::Gshare);
    }
}
