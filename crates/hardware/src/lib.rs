//! A discrete-event simulator of an out-of-order multiprocessor memory
//! hierarchy.
//!
//! This crate implements, tick by tick, in `coherence -> cache -> branch ->
//! processor` order:
//! 1. **Branch prediction:** 2-bit saturating counters, a BTB, and a BHR,
//!    with default/gshare/gselect indexing.
//! 2. **Cache:** set-associative, LRU or RRIP replacement, an optional
//!    victim buffer, and split handling of line-crossing accesses.
//! 3. **Coherence:** MI/MSI/MESI/MESIF over a single global bus order.
//! 4. **Processor:** a Tomasulo-style pipeline — renaming, tag-ordered
//!    scheduling, fast and long functional units, and CDB broadcast.
//!
//! [`sim::simulator::Simulator`] wires all four together; [`config::SimConfig`]
//! configures them.

/// Branch prediction: PHT, BTB, BHR, and the indexing-mode variants.
pub mod branch;
/// Set-associative cache: replacement policies, victim buffer, pending-request queue.
pub mod cache;
/// Cache-coherence protocols (MI/MSI/MESI/MESIF) as one transition-table unit.
pub mod coherence;
/// Common types: addresses, tags, errors, and the trace format.
pub mod common;
/// Simulator configuration (defaults, enums, hierarchical config structures).
pub mod config;
/// The bus interconnect: a single global order for coherence requests.
pub mod interconnect;
/// The out-of-order processor pipeline.
pub mod processor;
/// Simulation harness: wires every subsystem into one tick loop.
pub mod sim;
/// Run-level diagnostic counters.
pub mod stats;

/// Root configuration type; use `SimConfig::default()` or deserialize from JSON.
pub use crate::config::SimConfig;
/// Unified error type returned from every fallible public entry point.
pub use crate::common::error::SimError;
/// Top-level simulator; owns every subsystem and drives the tick loop.
pub use crate::sim::simulator::Simulator;
