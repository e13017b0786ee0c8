//! Cache-coherence unit: per-line state machines for MI, MSI, MESI, and MESIF.
//!
//! 1. **States**: one state enum spans every protocol's stable and
//!    transient states; a configured protocol only ever visits its subset.
//! 2. **Cache-initiated transitions**: `perm_req`/`invl_req`, driven by a
//!    cache's own access.
//! 3. **Snoop transitions**: driven by another core's bus request. Because
//!    the interconnect broadcasts synchronously within one tick (§6), both
//!    families are resolved inside one `perm_req`/`invl_req` call rather
//!    than split across a later callback.

use std::collections::HashMap;

use crate::common::addr::Addr;
use crate::common::error::InvariantViolation;
use crate::config::Protocol;
use crate::interconnect::{BusReqKind, Interconnect, FifoInterconnect};

/// Stable and transient coherence states across all four protocols.
///
/// A given `Protocol` only ever produces a subset of these: MI never visits
/// anything but `Invalid`/`Modified`/`IssuedWrite`, MSI adds `Shared` and the
/// `IssuedRead`/`SharedToModified` transients, MESI adds `Exclusive` and
/// `IssuedReadExclusive`, MESIF adds `Forward` and `ForwardToModified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// No valid copy.
    Invalid,
    /// Valid, clean, possibly shared with other cores.
    Shared,
    /// Valid, clean, the sole cached copy (MESI, MESIF).
    Exclusive,
    /// Valid, clean, the designated responder among several sharers (MESIF).
    Forward,
    /// Valid, dirty, the sole cached copy.
    Modified,
    /// `I + read` in MSI: waiting on `BusRd`'s resolution into `Shared`.
    IssuedRead,
    /// `I + read` in MESI/MESIF: waiting to learn `Exclusive` vs `Shared`.
    IssuedReadExclusive,
    /// `I + write` in any protocol: waiting on `BusWr`'s resolution into `Modified`.
    IssuedWrite,
    /// `Shared + write`: waiting on an upgrade `BusWr` into `Modified`.
    SharedToModified,
    /// `Forward + write` (MESIF only): waiting on an upgrade `BusWr` into `Modified`.
    ForwardToModified,
}

fn is_transient(state: LineState) -> bool {
    matches!(
        state,
        LineState::IssuedRead
            | LineState::IssuedReadExclusive
            | LineState::IssuedWrite
            | LineState::SharedToModified
            | LineState::ForwardToModified
    )
}

/// What a cache's pending node should do once a coherence action lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCallbackKind {
    /// The action completed; nothing about the cache's stored data changes.
    NoAction,
    /// The line's data is now present and valid in this core's cache.
    DataRecv,
    /// This core's copy of the line must be invalidated.
    Invalidate,
}

/// One effect a coherence call produces against a specific core's cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheEffect {
    /// Which core's cache this effect targets.
    pub core_id: usize,
    /// What the cache should do.
    pub kind: CacheCallbackKind,
    /// Block address the effect concerns.
    pub addr: Addr,
}

/// Result of one `perm_req`/`invl_req` call.
#[derive(Debug, Default)]
pub struct ReqOutcome {
    /// Whether the requesting core's cache must wait for a later callback.
    pub wait: bool,
    /// Effects to apply, including exactly one directed at the requester
    /// once `wait` resolves.
    pub effects: Vec<CacheEffect>,
}

#[derive(Debug, Clone)]
struct LineEntry {
    states: Vec<LineState>,
    sharers: u64,
}

impl LineEntry {
    fn new(core_count: usize) -> Self {
        Self {
            states: vec![LineState::Invalid; core_count],
            sharers: 0,
        }
    }

    fn mark_sharer(&mut self, core_id: usize) {
        self.sharers |= 1 << core_id;
    }

    fn clear_sharer(&mut self, core_id: usize) {
        self.sharers &= !(1 << core_id);
    }
}

/// The coherence unit: per-line state machines plus the bus those machines
/// drive their traffic through.
#[derive(Debug)]
pub struct Coherence {
    protocol: Protocol,
    core_count: usize,
    lines: HashMap<u64, LineEntry>,
    bus: Box<dyn Interconnect + Send + Sync>,
}

impl Coherence {
    /// Builds a coherence unit for `core_count` cores under `protocol`,
    /// driving the default FIFO interconnect.
    #[must_use]
    pub fn new(protocol: Protocol, core_count: usize) -> Self {
        Self::with_interconnect(protocol, core_count, Box::new(FifoInterconnect::new()))
    }

    /// Builds a coherence unit driving a caller-supplied interconnect
    /// (tests inject a mock to assert on bus traffic).
    #[must_use]
    pub fn with_interconnect(
        protocol: Protocol,
        core_count: usize,
        bus: Box<dyn Interconnect + Send + Sync>,
    ) -> Self {
        Self {
            protocol,
            core_count,
            lines: HashMap::new(),
            bus,
        }
    }

    /// The state this core currently holds for `addr`, for tests and diagnostics.
    #[must_use]
    pub fn state_of(&self, addr: Addr, core_id: usize) -> LineState {
        self.lines
            .get(&addr.0)
            .map_or(LineState::Invalid, |entry| entry.states[core_id])
    }

    fn entry(&mut self, addr: Addr) -> &mut LineEntry {
        let core_count = self.core_count;
        self.lines
            .entry(addr.0)
            .or_insert_with(|| LineEntry::new(core_count))
    }

    /// A cache requests permission to read (`is_load`) or write `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation`] if `core_id` already holds `addr` in a
    /// transient state: a processor never issues a second request for a line
    /// it is already waiting on.
    pub fn perm_req(
        &mut self,
        is_load: bool,
        addr: Addr,
        core_id: usize,
    ) -> Result<ReqOutcome, InvariantViolation> {
        let protocol = self.protocol;
        let core_count = self.core_count;
        let entry = self.entry(addr);
        let current = entry.states[core_id];

        if is_transient(current) {
            return Err(InvariantViolation::new(
                "coherence",
                format!("core {core_id} re-requested {addr} while it was in transient state {current:?}"),
            ));
        }

        if let Some(outcome) = Self::granted_without_bus_traffic(protocol, entry, core_id, current, is_load) {
            return Ok(outcome);
        }

        let (transient, bus_kind) = Self::next_transient(protocol, current, is_load);
        entry.states[core_id] = transient;
        self.bus.bus_req(bus_kind, addr, core_id);

        let mut effects = Vec::new();
        let mut any_sharer = false;
        let entry = self.entry(addr);
        for other in 0..core_count {
            if other == core_id {
                continue;
            }
            let other_state = entry.states[other];
            if other_state == LineState::Invalid {
                continue;
            }
            any_sharer = true;
            let (new_state, invalidated) = react_to_bus(protocol, other_state, bus_kind);
            entry.states[other] = new_state;
            if new_state == LineState::Invalid {
                entry.clear_sharer(other);
            }
            if invalidated {
                effects.push(CacheEffect {
                    core_id: other,
                    kind: CacheCallbackKind::Invalidate,
                    addr,
                });
            }
        }

        let final_state = match transient {
            LineState::IssuedRead => LineState::Shared,
            LineState::IssuedReadExclusive => {
                if any_sharer {
                    LineState::Shared
                } else {
                    LineState::Exclusive
                }
            }
            LineState::IssuedWrite | LineState::SharedToModified | LineState::ForwardToModified => LineState::Modified,
            other => unreachable!("{other:?} is not a transient state"),
        };
        entry.states[core_id] = final_state;
        if final_state == LineState::Modified {
            entry.sharers = 0;
        }
        entry.mark_sharer(core_id);

        if protocol == Protocol::Mesif && final_state != LineState::Modified {
            reassign_forward_owner(entry);
        }

        effects.push(CacheEffect {
            core_id,
            kind: CacheCallbackKind::DataRecv,
            addr,
        });

        Ok(ReqOutcome { wait: true, effects })
    }

    /// A cache invalidates its own copy of `addr`, typically a writeback of
    /// a line its own replacement policy just evicted.
    ///
    /// Always waits: the reference model never completes an invalidate
    /// synchronously.
    pub fn invl_req(&mut self, addr: Addr, core_id: usize) -> ReqOutcome {
        let entry = self.entry(addr);
        entry.states[core_id] = LineState::Invalid;
        entry.clear_sharer(core_id);

        ReqOutcome {
            wait: true,
            effects: vec![CacheEffect {
                core_id,
                kind: CacheCallbackKind::NoAction,
                addr,
            }],
        }
    }

    fn granted_without_bus_traffic(
        protocol: Protocol,
        entry: &mut LineEntry,
        core_id: usize,
        current: LineState,
        is_load: bool,
    ) -> Option<ReqOutcome> {
        match (current, is_load) {
            (LineState::Modified, _) => Some(ReqOutcome::default()),
            (LineState::Shared, true) => Some(ReqOutcome::default()),
            (LineState::Exclusive, true) if matches!(protocol, Protocol::Mesi | Protocol::Mesif) => {
                Some(ReqOutcome::default())
            }
            (LineState::Forward, true) if protocol == Protocol::Mesif => Some(ReqOutcome::default()),
            (LineState::Exclusive, false) if matches!(protocol, Protocol::Mesi | Protocol::Mesif) => {
                entry.states[core_id] = LineState::Modified;
                entry.sharers = 1 << core_id;
                Some(ReqOutcome::default())
            }
            (LineState::Forward, false) if protocol == Protocol::Mesif => {
                entry.states[core_id] = LineState::Modified;
                entry.sharers = 1 << core_id;
                Some(ReqOutcome::default())
            }
            _ => None,
        }
    }

    fn next_transient(protocol: Protocol, current: LineState, is_load: bool) -> (LineState, BusReqKind) {
        match protocol {
            Protocol::Mi => (LineState::IssuedWrite, BusReqKind::BusWr),
            Protocol::Msi => {
                if is_load {
                    (LineState::IssuedRead, BusReqKind::BusRd)
                } else if current == LineState::Shared {
                    (LineState::SharedToModified, BusReqKind::BusWr)
                } else {
                    (LineState::IssuedWrite, BusReqKind::BusWr)
                }
            }
            Protocol::Mesi => {
                if is_load {
                    (LineState::IssuedReadExclusive, BusReqKind::BusRd)
                } else if current == LineState::Shared {
                    (LineState::SharedToModified, BusReqKind::BusWr)
                } else {
                    (LineState::IssuedWrite, BusReqKind::BusWr)
                }
            }
            Protocol::Mesif => {
                if is_load {
                    (LineState::IssuedReadExclusive, BusReqKind::BusRd)
                } else if current == LineState::Shared {
                    (LineState::SharedToModified, BusReqKind::BusWr)
                } else if current == LineState::Forward {
                    (LineState::ForwardToModified, BusReqKind::BusWr)
                } else {
                    (LineState::IssuedWrite, BusReqKind::BusWr)
                }
            }
        }
    }
}

/// How a stable-state sharer reacts to a snooped bus request.
///
/// Returns the sharer's new state and whether its cache must invalidate its
/// stored data (as opposed to a state-only change, e.g. `E -> S` on a
/// `BusRd`, which keeps the data valid). Protocol-dependent: under MESIF a
/// `Modified` holder demotes to `Forward` on a snooped `BusRd` and keeps its
/// data (the new Forward owner is picked afterwards, see
/// `reassign_forward_owner`); every other protocol has no Forward state to
/// fall back to, so a `BusRd` on `Modified` still forces invalidation.
fn react_to_bus(protocol: Protocol, state: LineState, bus_kind: BusReqKind) -> (LineState, bool) {
    match (state, bus_kind) {
        (LineState::Modified, BusReqKind::BusRd) if protocol == Protocol::Mesif => (LineState::Forward, false),
        (LineState::Modified, BusReqKind::BusRd | BusReqKind::BusWr) => (LineState::Invalid, true),
        (LineState::Shared, BusReqKind::BusWr) => (LineState::Invalid, true),
        (LineState::Shared, BusReqKind::BusRd) => (LineState::Shared, false),
        (LineState::Exclusive | LineState::Forward, BusReqKind::BusRd) => (LineState::Shared, false),
        (LineState::Exclusive | LineState::Forward, BusReqKind::BusWr) => (LineState::Invalid, true),
        (other, _) => (other, false),
    }
}

/// MESIF owner selection: the lowest-numbered currently-sharing core becomes
/// the Forward owner; every other sharer in `Exclusive`/`Forward` downgrades
/// to `Shared` (two cores never hold `Exclusive`/`Forward` simultaneously
/// once this runs).
fn reassign_forward_owner(entry: &mut LineEntry) {
    if entry.sharers.count_ones() < 2 {
        return;
    }
    let Some(owner) = (0..64).find(|bit| entry.sharers & (1 << bit) != 0) else {
        return;
    };
    for (core_id, state) in entry.states.iter_mut().enumerate() {
        if entry.sharers & (1 << core_id) == 0 {
            continue;
        }
        if core_id == owner {
            *state = LineState::Forward;
        } else if matches!(*state, LineState::Exclusive | LineState::Forward) {
            *state = LineState::Shared;
        }
    }
}

#[cfg(test)]
mod tests {
    use mockall::mock;
    use mockall::Sequence;

    use super::*;

    mock! {
        Bus {}
        impl Interconnect for Bus {
            fn bus_req(&mut self, kind: BusReqKind, addr: Addr, core_id: usize);
        }
    }

    /// A write's `BusWr` must reach the interconnect strictly before the
    /// read that follows it asks for its own `BusRd`.
    #[test]
    fn perm_req_issues_bus_traffic_in_request_order() {
        let addr = Addr(0x40);
        let mut bus = MockBus::new();
        let mut seq = Sequence::new();
        bus.expect_bus_req()
            .times(1)
            .in_sequence(&mut seq)
            .withf(move |kind, a, core_id| *kind == BusReqKind::BusWr && *a == addr && *core_id == 0)
            .return_const(());
        bus.expect_bus_req()
            .times(1)
            .in_sequence(&mut seq)
            .withf(move |kind, a, core_id| *kind == BusReqKind::BusRd && *a == addr && *core_id == 1)
            .return_const(());

        let mut coherence = Coherence::with_interconnect(Protocol::Msi, 2, Box::new(bus));
        coherence.perm_req(false, addr, 0).unwrap();
        coherence.perm_req(true, addr, 1).unwrap();
    }

    /// (S3) MSI coherence handshake.
    #[test]
    fn msi_handshake_reaches_modified_then_shared() {
        let mut coherence = Coherence::new(Protocol::Msi, 2);
        let addr = Addr(0x40);

        let outcome = coherence.perm_req(false, addr, 0).unwrap();
        assert!(outcome.wait);
        assert_eq!(coherence.state_of(addr, 0), LineState::Modified);

        let outcome = coherence.perm_req(true, addr, 1).unwrap();
        assert!(outcome.wait);
        assert_eq!(coherence.state_of(addr, 0), LineState::Invalid);
        assert_eq!(coherence.state_of(addr, 1), LineState::Shared);

        let targets_core0_invalidate = outcome
            .effects
            .iter()
            .any(|e| e.core_id == 0 && e.kind == CacheCallbackKind::Invalidate);
        assert!(targets_core0_invalidate);
    }

    #[test]
    fn mesi_exclusive_read_stays_silent_on_a_lone_core() {
        let mut coherence = Coherence::new(Protocol::Mesi, 2);
        let addr = Addr(0x80);
        let outcome = coherence.perm_req(true, addr, 0).unwrap();
        assert!(outcome.wait);
        assert_eq!(coherence.state_of(addr, 0), LineState::Exclusive);

        let outcome = coherence.perm_req(false, addr, 0).unwrap();
        assert!(!outcome.wait);
        assert_eq!(coherence.state_of(addr, 0), LineState::Modified);
    }

    #[test]
    fn mesif_forward_owner_is_the_lowest_numbered_sharer() {
        let mut coherence = Coherence::new(Protocol::Mesif, 3);
        let addr = Addr(0x100);

        coherence.perm_req(true, addr, 2).unwrap();
        assert_eq!(coherence.state_of(addr, 2), LineState::Exclusive);

        coherence.perm_req(true, addr, 1).unwrap();
        assert_eq!(coherence.state_of(addr, 1), LineState::Forward);
        assert_eq!(coherence.state_of(addr, 2), LineState::Shared);

        coherence.perm_req(true, addr, 0).unwrap();
        assert_eq!(coherence.state_of(addr, 0), LineState::Forward);
        assert_eq!(coherence.state_of(addr, 1), LineState::Shared);
    }

    /// Under MESIF, a snooped `BusRd` against a `Modified` line must not
    /// discard the holder's data: the holder demotes to `Forward` and the
    /// reader becomes `Shared`.
    #[test]
    fn mesif_write_then_read_demotes_the_writer_to_forward() {
        let mut coherence = Coherence::new(Protocol::Mesif, 2);
        let addr = Addr(0x40);

        coherence.perm_req(false, addr, 0).unwrap();
        assert_eq!(coherence.state_of(addr, 0), LineState::Modified);

        let outcome = coherence.perm_req(true, addr, 1).unwrap();
        assert!(outcome.wait);
        assert_eq!(coherence.state_of(addr, 0), LineState::Forward);
        assert_eq!(coherence.state_of(addr, 1), LineState::Shared);

        let targets_core0_invalidate =
            outcome.effects.iter().any(|e| e.core_id == 0 && e.kind == CacheCallbackKind::Invalidate);
        assert!(!targets_core0_invalidate);
    }

    #[test]
    fn requesting_into_a_transient_line_is_an_invariant_violation() {
        let mut coherence = Coherence::new(Protocol::Msi, 2);
        let addr = Addr(0x40);
        coherence.entry(addr).states[0] = LineState::IssuedWrite;
        assert!(coherence.perm_req(true, addr, 0).is_err());
    }

    #[test]
    fn invl_req_always_waits_and_clears_the_line() {
        let mut coherence = Coherence::new(Protocol::Mi, 1);
        let addr = Addr(0x40);
        coherence.perm_req(false, addr, 0).unwrap();
        let outcome = coherence.invl_req(addr, 0);
        assert!(outcome.wait);
        assert_eq!(coherence.state_of(addr, 0), LineState::Invalid);
    }
}
