//! Cache controller: set-associative lookup, replacement, an optional
//! victim buffer, and the pending-request queue bridging cache misses to
//! coherence completions.
//!
//! 1. **Lookup**: classify a block-aligned address as hit, miss, or
//!    miss-with-eviction.
//! 2. **Line-crossing**: a request straddling a block boundary becomes two
//!    full accesses, both of which update cache state.
//! 3. **Pending queue**: each `memory_request` call enqueues a per-core
//!    sub-FIFO of coherence actions; the cache's owning simulator drives it
//!    one step per tick and the request's callback fires once it drains.

pub mod policies;

use std::collections::VecDeque;

use crate::coherence::{CacheCallbackKind, CacheEffect, Coherence};
use crate::common::addr::Addr;
use crate::common::error::ConfigError;
use crate::common::trace::TraceOp;
use crate::config::{CacheConfig, ReplacementPolicy as PolicyKind};
use policies::{LruPolicy, ReplacementPolicy, RripPolicy};

/// Outcome of one set lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The tag was already present.
    Hit,
    /// The tag was absent and an invalid line took it; nothing evicted.
    Miss,
    /// The tag was absent and a valid line had to be evicted to make room.
    MissEvict {
        /// Block address of the evicted line.
        evict_addr: Addr,
    },
}

/// One cache line's stored metadata.
///
/// Replacement bookkeeping (`lru_stamp`, `rrpv`) lives directly on the line
/// rather than in a side table, so a [`policies::ReplacementPolicy`] scans
/// and mutates the set in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheLine {
    /// Whether this line holds a live block.
    pub valid: bool,
    /// Whether this line has been written since it was installed.
    pub dirty: bool,
    /// Tag bits identifying which block this line holds.
    pub tag: u64,
    /// Cache-wide iteration stamp as of this line's last access (LRU).
    pub lru_stamp: u64,
    /// Re-reference prediction value (RRIP).
    pub rrpv: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    /// Permission request (read or write).
    Perm { is_store: bool },
    /// Writeback/invalidate of an evicted block. Always waits.
    Inv,
}

#[derive(Debug, Clone, Copy)]
struct PendingNode {
    kind: PendingKind,
    addr: Addr,
    started: bool,
}

#[derive(Debug)]
struct MemRequest {
    request_tag: u64,
    nodes: VecDeque<PendingNode>,
}

fn enqueue_access(nodes: &mut VecDeque<PendingNode>, access: Access, addr: Addr, is_store: bool) {
    if let Access::MissEvict { evict_addr } = access {
        nodes.push_back(PendingNode {
            kind: PendingKind::Inv,
            addr: evict_addr,
            started: false,
        });
    }
    nodes.push_back(PendingNode {
        kind: PendingKind::Perm { is_store },
        addr,
        started: false,
    });
}

#[derive(Debug)]
struct CoreCache {
    sets: Vec<Vec<CacheLine>>,
    victim: Vec<CacheLine>,
    queue: VecDeque<MemRequest>,
}

impl CoreCache {
    fn new(set_count: usize, ways: usize, victim_capacity: usize) -> Self {
        Self {
            sets: vec![vec![CacheLine::default(); ways]; set_count],
            victim: Vec::with_capacity(victim_capacity),
            queue: VecDeque::new(),
        }
    }
}

/// The cache controller: one set-associative array (plus optional victim
/// buffer) per core, and the sub-FIFO pending queues their misses drive.
pub struct Cache {
    config: CacheConfig,
    policy: Box<dyn ReplacementPolicy + Send + Sync>,
    cores: Vec<CoreCache>,
    iteration: u64,
    callback: Option<Box<dyn FnMut(usize, u64)>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("cores", &self.cores)
            .field("iteration", &self.iteration)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl Cache {
    /// Builds a cache for `core_count` private, identically configured caches.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(config: CacheConfig, core_count: usize) -> Result<Self, ConfigError> {
        config.validate()?;
        let set_count = 1usize << config.s;
        let policy: Box<dyn ReplacementPolicy + Send + Sync> = match config.policy() {
            PolicyKind::Lru => Box::new(LruPolicy),
            PolicyKind::Rrip => Box::new(RripPolicy { max: config.rrip_max() }),
        };
        let cores = (0..core_count)
            .map(|_| CoreCache::new(set_count, config.ways, config.victim_entries))
            .collect();
        Ok(Self {
            config,
            policy,
            cores,
            iteration: 0,
            callback: None,
        })
    }

    /// Registers the callback the pending queue fires once a request's
    /// sub-FIFO fully drains. Replaces any previously registered callback.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(usize, u64) + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Looks up a line for `core_id`/`addr`, for tests and diagnostics.
    #[must_use]
    pub fn line_at(&self, core_id: usize, addr: Addr) -> Option<CacheLine> {
        let idx = self.set_index(addr);
        let tag = self.tag_of(addr);
        self.cores[core_id].sets[idx]
            .iter()
            .find(|line| line.valid && line.tag == tag)
            .copied()
    }

    /// Looks up a victim-buffer entry for `core_id`/`addr`, for tests.
    #[must_use]
    pub fn victim_at(&self, core_id: usize, addr: Addr) -> Option<CacheLine> {
        let full_tag = addr.0 >> self.config.b;
        self.cores[core_id]
            .victim
            .iter()
            .find(|line| line.valid && line.tag == full_tag)
            .copied()
    }

    fn set_index(&self, addr: Addr) -> usize {
        let set_count = 1usize << self.config.s;
        ((addr.0 >> self.config.b) as usize) & (set_count - 1)
    }

    fn tag_of(&self, addr: Addr) -> u64 {
        addr.0 >> (self.config.s + self.config.b)
    }

    /// Issues one memory request, block-aligning and splitting a
    /// line-crossing access into two, and enqueues it behind any request
    /// already in flight for `core_id`.
    pub fn memory_request(&mut self, op: &TraceOp, core_id: usize, request_tag: u64) {
        self.iteration += 1;
        let block = 1u64 << self.config.b;
        let primary_addr = op.addr.block_align(self.config.b);

        let mut nodes = VecDeque::new();
        let primary_access = self.classify(core_id, primary_addr, op.is_store());
        enqueue_access(&mut nodes, primary_access, primary_addr, op.is_store());

        let offset_in_block = op.addr.block_offset(self.config.b);
        if offset_in_block + u64::from(op.size) > block {
            let next_addr = Addr(primary_addr.0 + block);
            let secondary_access = self.classify(core_id, next_addr, op.is_store());
            enqueue_access(&mut nodes, secondary_access, next_addr, op.is_store());
        }

        self.cores[core_id].queue.push_back(MemRequest { request_tag, nodes });
    }

    /// Classifies and applies one block-aligned access against `core_id`'s
    /// main array (and victim buffer, if present), mutating cache state
    /// immediately. Coherence permission is resolved later by the pending
    /// queue; this only updates *this cache's* tag/replacement state.
    fn classify(&mut self, core_id: usize, addr: Addr, is_store: bool) -> Access {
        let idx = self.set_index(addr);
        let tag = self.tag_of(addr);
        let full_tag = addr.0 >> self.config.b;
        let block_bits = self.config.b;
        let set_bits = self.config.s;
        let victim_capacity = self.config.victim_entries;

        let policy = self.policy.as_ref();
        let iteration = self.iteration;
        let core = &mut self.cores[core_id];

        if let Some(line) = core.sets[idx].iter_mut().find(|l| l.valid && l.tag == tag) {
            line.dirty |= is_store;
            policy.on_hit(line, iteration);
            return Access::Hit;
        }

        if victim_capacity > 0 {
            if let Some(pos) = core.victim.iter().position(|v| v.valid && v.tag == full_tag) {
                let mut incoming = core.victim.remove(pos);
                incoming.tag = tag;
                incoming.dirty |= is_store;
                policy.on_hit(&mut incoming, iteration);

                if let Some(free) = core.sets[idx].iter().position(|l| !l.valid) {
                    core.sets[idx][free] = incoming;
                } else {
                    let victim_way = policy.select_victim(&mut core.sets[idx]);
                    let evicted = core.sets[idx][victim_way];
                    core.sets[idx][victim_way] = incoming;
                    let _ = install_victim(core, evicted, idx, set_bits, victim_capacity);
                }
                return Access::Hit;
            }
        }

        if let Some(way) = core.sets[idx].iter().position(|l| !l.valid) {
            core.sets[idx][way] = CacheLine {
                valid: true,
                dirty: is_store,
                tag,
                lru_stamp: iteration,
                rrpv: 0,
            };
            policy.on_install(&mut core.sets[idx][way], iteration);
            return Access::Miss;
        }

        let victim_way = policy.select_victim(&mut core.sets[idx]);
        let evicted = core.sets[idx][victim_way];

        core.sets[idx][victim_way] = CacheLine {
            valid: true,
            dirty: is_store,
            tag,
            lru_stamp: iteration,
            rrpv: 0,
        };
        policy.on_install(&mut core.sets[idx][victim_way], iteration);

        if victim_capacity > 0 {
            // A free victim slot absorbs the evicted main-array line with no
            // coherence action; only a full victim buffer forces a genuine
            // evict, and it is the victim's own displaced entry that is
            // reported, not the main-array line that just moved sideways.
            return match install_victim(core, evicted, idx, set_bits, victim_capacity) {
                None => Access::Miss,
                Some(displaced) => Access::MissEvict { evict_addr: Addr(displaced.tag << block_bits) },
            };
        }

        let evict_addr = Addr((evicted.tag << (set_bits + block_bits)) | ((idx as u64) << block_bits));
        Access::MissEvict { evict_addr }
    }

    /// Advances every core's pending queue by one step: issues the head
    /// node's coherence request if unstarted, or completes the request and
    /// moves to the next one once its sub-FIFO drains.
    ///
    /// Returns `(core_id, request_tag)` for every request that completed
    /// this tick, in addition to invoking any callback registered via
    /// [`Self::set_callback`].
    pub fn advance_pending_queue(
        &mut self,
        coherence: &mut Coherence,
    ) -> Result<Vec<(usize, u64)>, crate::common::error::InvariantViolation> {
        let mut completions = Vec::new();
        for core_id in 0..self.cores.len() {
            if let Some(completion) = self.advance_core(core_id, coherence)? {
                completions.push(completion);
            }
        }
        Ok(completions)
    }

    fn advance_core(
        &mut self,
        core_id: usize,
        coherence: &mut Coherence,
    ) -> Result<Option<(usize, u64)>, crate::common::error::InvariantViolation> {
        let Some(request) = self.cores[core_id].queue.front() else {
            return Ok(None);
        };

        if request.nodes.is_empty() {
            let request_tag = request.request_tag;
            if let Some(callback) = &mut self.callback {
                callback(core_id, request_tag);
            }
            self.cores[core_id].queue.pop_front();
            return Ok(Some((core_id, request_tag)));
        }

        let Some(&node) = request.nodes.front() else {
            unreachable!("just checked `request.nodes` is non-empty");
        };
        if node.started {
            if let Some(request) = self.cores[core_id].queue.front_mut() {
                request.nodes.pop_front();
            }
            return Ok(None);
        }

        let outcome = match node.kind {
            PendingKind::Perm { is_store } => coherence.perm_req(!is_store, node.addr, core_id)?,
            PendingKind::Inv => coherence.invl_req(node.addr, core_id),
        };

        self.apply_effects(outcome.effects);

        let Some(request) = self.cores[core_id].queue.front_mut() else {
            unreachable!("the request this node belongs to cannot have been dequeued mid-call");
        };
        if outcome.wait {
            if let Some(front) = request.nodes.front_mut() {
                front.started = true;
            }
        } else {
            request.nodes.pop_front();
        }
        Ok(None)
    }

    fn apply_effects(&mut self, effects: Vec<CacheEffect>) {
        for effect in effects {
            self.apply_effect(effect);
        }
    }

    fn apply_effect(&mut self, effect: CacheEffect) {
        match effect.kind {
            CacheCallbackKind::NoAction | CacheCallbackKind::DataRecv => {
                if let Some(request) = self.cores[effect.core_id].queue.front_mut() {
                    let should_pop = request.nodes.front().is_some_and(|front| front.started);
                    if should_pop {
                        request.nodes.pop_front();
                    }
                }
            }
            CacheCallbackKind::Invalidate => self.invalidate_line(effect.core_id, effect.addr),
        }
    }

    fn invalidate_line(&mut self, core_id: usize, addr: Addr) {
        let idx = self.set_index(addr);
        let tag = self.tag_of(addr);
        let core = &mut self.cores[core_id];
        if let Some(line) = core.sets[idx].iter_mut().find(|l| l.valid && l.tag == tag) {
            line.valid = false;
            line.dirty = false;
        }
    }
}

/// Installs `evicted` into the victim buffer. Returns `None` if it landed in
/// a free slot; returns the victim buffer's own displaced LRU entry if the
/// buffer was already full and had to make room.
fn install_victim(
    core: &mut CoreCache,
    mut evicted: CacheLine,
    set_idx: usize,
    set_bits: u32,
    capacity: usize,
) -> Option<CacheLine> {
    evicted.tag = (evicted.tag << set_bits) | (set_idx as u64);
    if core.victim.len() < capacity {
        core.victim.push(evicted);
        return None;
    }
    let lru_pos = core
        .victim
        .iter()
        .enumerate()
        .min_by_key(|(_, v)| v.lru_stamp)
        .map(|(pos, _)| pos)
        .unwrap_or(0);
    let displaced = core.victim[lru_pos];
    core.victim[lru_pos] = evicted;
    Some(displaced)
}
