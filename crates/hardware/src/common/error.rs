//! Error taxonomy for the simulator.
//!
//! This module defines the error types surfaced to callers. It provides:
//! 1. **Configuration errors:** invalid or unimplemented component settings, rejected at startup.
//! 2. **Trace format errors:** malformed input lines, rejected at startup.
//! 3. **Invariant violations:** internal consistency failures, fatal and intentional.

use thiserror::Error;

/// Errors raised while validating a [`crate::config::SimConfig`].
///
/// All of these are refuse-to-start errors: the simulator never attempts to
/// recover from a bad configuration mid-run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A branch predictor mode was selected that has no implementation.
    ///
    /// The reference model leaves Yeh-Patt as an unfinished student
    /// exercise; this simulator refuses to silently substitute another mode.
    #[error("branch predictor mode {0:?} is not implemented")]
    UnimplementedMode(crate::config::BranchMode),

    /// Cache associativity of zero: a set with no ways cannot hold a line.
    #[error("cache associativity E must be nonzero")]
    ZeroWays,

    /// Index bits plus block bits exceed the address width.
    #[error("cache index bits (s={s}) + block bits (b={b}) exceed 64")]
    AddressBitsOverflow {
        /// Configured log2 set count.
        s: u32,
        /// Configured log2 block size.
        b: u32,
    },

    /// A processor or cache count field that must be positive was zero or negative.
    #[error("{field} must be positive, got {value}")]
    NonPositiveCount {
        /// Name of the offending configuration field.
        field: &'static str,
        /// The rejected value.
        value: i64,
    },
}

/// Errors raised while parsing a trace file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceFormatError {
    /// A line did not match the expected whitespace-separated op grammar.
    #[error("malformed trace line {line_no}: {text:?}")]
    MalformedLine {
        /// 1-based line number within the trace file.
        line_no: usize,
        /// The offending line's raw text.
        text: String,
    },

    /// A field that should have parsed as an integer did not.
    #[error("trace line {line_no}: invalid integer field {field:?}")]
    InvalidField {
        /// 1-based line number within the trace file.
        line_no: usize,
        /// The offending field's raw text.
        field: String,
    },

    /// An unrecognized op-kind token appeared in a trace line.
    #[error("trace line {line_no}: unknown op kind {kind:?}")]
    UnknownOpKind {
        /// 1-based line number within the trace file.
        line_no: usize,
        /// The offending token.
        kind: String,
    },
}

/// A fatal internal consistency failure.
///
/// These indicate a simulator bug, not a workload problem: a transient
/// coherence state received a processor request, a priority-queue pop
/// could not find its entry in the owning schedule queue, or a secondary
/// line-crossing access reported a `miss_evict` that was never enqueued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invariant violation in {component}: {detail}")]
pub struct InvariantViolation {
    /// Which subsystem detected the violation (`"cache"`, `"coherence"`, `"processor"`, ...).
    pub component: &'static str,
    /// Actionable detail: the state, address, or tag involved.
    pub detail: String,
}

impl InvariantViolation {
    /// Builds a violation report for the named component.
    pub fn new(component: &'static str, detail: impl Into<String>) -> Self {
        Self {
            component,
            detail: detail.into(),
        }
    }
}

/// Top-level error type returned from every fallible public entry point.
#[derive(Error, Debug)]
pub enum SimError {
    /// Configuration failed validation before the first tick.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The trace file could not be parsed.
    #[error(transparent)]
    Trace(#[from] TraceFormatError),

    /// An internal invariant was violated during simulation.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    /// The trace file or config JSON could not be read from disk.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The config JSON did not deserialize.
    #[error("config deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}
