//! The bus interconnect: a single global order for coherence requests.
//!
//! The reference model's bus has no arbitration delay: a request is visible
//! to every other core's coherence unit within the same tick it was issued.
//! This module's job is only to fix that arrival order and make it
//! inspectable, not to introduce latency.

use std::collections::VecDeque;

use crate::common::addr::Addr;

/// Wire-level bus event kinds the coherence unit emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusReqKind {
    /// A read miss: requests a shared or exclusive copy.
    BusRd,
    /// A write miss or upgrade: requests an exclusive copy.
    BusWr,
    /// A snooping cache's data response to a `BusRd`/`BusWr`.
    Data,
    /// A snooping cache indicating it is also sharing the line.
    Shared,
}

/// One bus event, in arrival order.
#[derive(Debug, Clone, Copy)]
pub struct BusEvent {
    /// What kind of event this is.
    pub kind: BusReqKind,
    /// Block address the event concerns.
    pub addr: Addr,
    /// Core that issued the event.
    pub core_id: usize,
    /// Monotonic arrival order, assigned at issue time.
    pub order: u64,
}

/// Something the coherence unit can serialize `bus_req` calls through.
pub trait Interconnect: std::fmt::Debug {
    /// Records one bus event and assigns it its place in the global order.
    fn bus_req(&mut self, kind: BusReqKind, addr: Addr, core_id: usize);
}

/// The one concrete interconnect this codebase ships: a FIFO log of every
/// bus event observed, in arrival order.
#[derive(Debug, Default)]
pub struct FifoInterconnect {
    log: VecDeque<BusEvent>,
    next_order: u64,
}

impl FifoInterconnect {
    /// Builds an empty interconnect.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains the recorded event log, oldest first.
    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, BusEvent> {
        self.log.drain(..)
    }

    /// Number of events recorded since the last `drain`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Whether any events are recorded since the last `drain`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

impl Interconnect for FifoInterconnect {
    fn bus_req(&mut self, kind: BusReqKind, addr: Addr, core_id: usize) {
        let order = self.next_order;
        self.next_order += 1;
        tracing::debug!(?kind, %addr, core_id, order, "bus request");
        self.log.push_back(BusEvent { kind, addr, core_id, order });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_increasing_arrival_order() {
        let mut bus = FifoInterconnect::new();
        bus.bus_req(BusReqKind::BusRd, Addr(0x40), 0);
        bus.bus_req(BusReqKind::BusWr, Addr(0x40), 1);
        let events: Vec<_> = bus.drain().collect();
        assert_eq!(events[0].order, 0);
        assert_eq!(events[1].order, 1);
        assert_eq!(events[1].core_id, 1);
    }

    #[test]
    fn drain_empties_the_log() {
        let mut bus = FifoInterconnect::new();
        bus.bus_req(BusReqKind::BusRd, Addr(0x40), 0);
        assert!(!bus.is_empty());
        let _: Vec<_> = bus.drain().collect();
        assert!(bus.is_empty());
    }
}
