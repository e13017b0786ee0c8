//! The out-of-order processor pipeline.
//!
//! This module implements the Tomasulo-style engine described for this
//! codebase: register renaming via monotonic tags, tag-ordered schedule
//! queues, a fixed set of fast (single-stage) and long (three-stage)
//! functional units, and a handful of common data buses used to broadcast
//! results. One [`Processor`] instance owns every core's pipeline state;
//! [`Processor::tick`] advances one core by one cycle.
//!
//! Stages run in reverse-pipeline order within a tick — writeback first,
//! fetch/decode last — so that producers only ever observe the latched
//! outputs of consumers, never a same-cycle forward.

use std::collections::{BTreeMap, VecDeque};

use crate::branch::BranchPredictor;
use crate::cache::Cache;
use crate::common::addr::{Tag, TagCounter};
use crate::common::trace::{OpKind, TraceOp, TraceReader};
use crate::config::ProcessorConfig;

/// Number of architectural registers: trace ops address registers 0..=32
/// ([`crate::common::trace::NO_REG`] marks "no register" out of band).
const REGISTER_COUNT: usize = 33;

/// Combines a core id and a rename tag into the value handed to
/// [`Cache::memory_request`], matching the reference model's tag wire
/// format: the low byte is the core id, the rest is the rename tag.
fn make_tag(core_id: usize, tag: Tag) -> u64 {
    (core_id as u64) | (tag.0 << 8)
}

/// One architectural register: either holding a committed value, or
/// renamed onto the tag of an in-flight producer.
#[derive(Debug, Clone, Copy)]
struct Register {
    ready: bool,
    tag: Tag,
}

impl Register {
    fn committed() -> Self {
        Self { ready: true, tag: Tag(0) }
    }
}

/// One source operand as captured at dispatch time: either already ready,
/// or waiting on a producer's tag to appear on a CDB.
#[derive(Debug, Clone, Copy)]
enum Operand {
    /// No such operand (the reference model's `NO_REG` sentinel).
    None,
    /// Value already available at dispatch time.
    Ready,
    /// Waiting for `Tag` to be broadcast on a CDB.
    Waiting(Tag),
}

impl Operand {
    fn from_register(reg_id: i32, regs: &[Register; REGISTER_COUNT]) -> Self {
        if reg_id < 0 {
            return Self::None;
        }
        let reg = regs[reg_id as usize];
        if reg.ready {
            Self::Ready
        } else {
            Self::Waiting(reg.tag)
        }
    }

    fn is_ready(&self) -> bool {
        !matches!(self, Self::Waiting(_))
    }

    /// Marks this operand ready if `bus_tag` is what it is waiting for.
    fn snoop(&mut self, bus_tag: Tag) {
        if let Self::Waiting(tag) = *self {
            if tag == bus_tag {
                *self = Self::Ready;
            }
        }
    }
}

/// An instruction in flight, from dispatch through state-update.
#[derive(Debug, Clone)]
struct Instr {
    tag: Tag,
    op: TraceOp,
    dest_reg: i32,
    src: [Operand; 2],
    is_long: bool,
    is_memory: bool,
    is_branch: bool,
    fu: Option<usize>,
}

impl Instr {
    /// Whether this entry is eligible to fire: not already launched into a
    /// functional unit, every source ready, and (for a memory op) no other
    /// memory op already in flight on this core.
    fn fires(&self, pending_mem: bool) -> bool {
        let operands_ready = self.src.iter().all(Operand::is_ready);
        self.fu.is_none() && operands_ready && !(self.is_memory && pending_mem)
    }
}

/// One common data bus: in flight for exactly one tick between a producer's
/// state-update and its writeback.
#[derive(Debug, Clone, Copy)]
struct Cdb {
    busy: bool,
    tag: Tag,
    reg_id: i32,
}

impl Default for Cdb {
    fn default() -> Self {
        Self { busy: false, tag: Tag(0), reg_id: crate::common::trace::NO_REG }
    }
}

/// A functional unit's pipeline slots, oldest stage last.
///
/// Fast units use only `slots[0]`; long units use all three.
#[derive(Debug, Clone)]
struct FuPipeline {
    slots: Vec<Option<Instr>>,
}

impl FuPipeline {
    fn new(stages: usize) -> Self {
        Self { slots: vec![None; stages] }
    }

    fn head_free(&self) -> bool {
        self.slots[0].is_none()
    }
}

/// Per-core pipeline state.
#[derive(Debug)]
struct CoreState {
    regs: [Register; REGISTER_COUNT],
    dispatch_queue: VecDeque<Instr>,
    fast_schedule: BTreeMap<Tag, Instr>,
    long_schedule: BTreeMap<Tag, Instr>,
    state_update_queue: BTreeMap<Tag, Instr>,
    fast_fus: Vec<FuPipeline>,
    long_fus: Vec<FuPipeline>,
    cdbs: Vec<Cdb>,
    pending_branch: bool,
    pending_mem: bool,
    mem_op_tag: Option<u64>,
    exhausted: bool,
    ticks_since_progress: u64,
    instructions_retired: u64,
    mispredictions: u64,
}

impl CoreState {
    fn new(config: &ProcessorConfig) -> Self {
        Self {
            regs: [Register::committed(); REGISTER_COUNT],
            dispatch_queue: VecDeque::with_capacity(config.dispatch_capacity()),
            fast_schedule: BTreeMap::new(),
            long_schedule: BTreeMap::new(),
            state_update_queue: BTreeMap::new(),
            fast_fus: (0..config.fast_fus).map(|_| FuPipeline::new(1)).collect(),
            long_fus: (0..config.long_fus).map(|_| FuPipeline::new(3)).collect(),
            cdbs: vec![Cdb::default(); config.cdb_count],
            pending_branch: false,
            pending_mem: false,
            mem_op_tag: None,
            exhausted: false,
            ticks_since_progress: 0,
            instructions_retired: 0,
            mispredictions: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.exhausted
            && self.dispatch_queue.is_empty()
            && self.fast_schedule.is_empty()
            && self.long_schedule.is_empty()
            && self.state_update_queue.is_empty()
            && !self.pending_mem
            && !self.pending_branch
            && self.fast_fus.iter().all(FuPipeline::head_free)
            && self.long_fus.iter().all(|fu| fu.slots.iter().all(Option::is_none))
    }
}

/// The multi-core out-of-order pipeline.
///
/// Owns every core's register file, queues, and functional units, plus the
/// single tag counter shared across all cores (see `make_tag`).
#[derive(Debug)]
pub struct Processor {
    config: ProcessorConfig,
    cores: Vec<CoreState>,
    tags: TagCounter,
    stall_ticks: u64,
}

impl Processor {
    /// Builds a processor with `core_count` idle cores.
    #[must_use]
    pub fn new(config: ProcessorConfig, core_count: usize, stall_ticks: u64) -> Self {
        let cores = (0..core_count).map(|_| CoreState::new(&config)).collect();
        Self { config, cores, tags: TagCounter::new(), stall_ticks }
    }

    /// Whether every core has drained its trace and every queue is empty.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cores.iter().all(CoreState::is_idle)
    }

    /// Total instructions retired and branch mispredictions across all cores.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        self.cores.iter().fold((0, 0), |(instr, mispred), core| {
            (instr + core.instructions_retired, mispred + core.mispredictions)
        })
    }

    /// Delivers a cache completion to the core that issued it, clearing its
    /// memory stall if the tags match.
    pub fn mem_op_callback(&mut self, core_id: usize, request_tag: u64) {
        let Some(core) = self.cores.get_mut(core_id) else { return };
        if core.mem_op_tag == Some(request_tag) {
            core.pending_mem = false;
            core.mem_op_tag = None;
        }
    }

    /// Advances `core_id` by one tick. Returns whether any stage made
    /// progress, for stall detection and termination.
    pub fn tick(
        &mut self,
        core_id: usize,
        trace: &mut dyn TraceReader,
        branch: &mut BranchPredictor,
        cache: &mut Cache,
    ) -> bool {
        let mut progress = false;
        progress |= self.writeback(core_id);
        progress |= self.state_update(core_id);
        progress |= self.execute_advance(core_id);
        progress |= self.schedule(core_id, cache);
        progress |= self.dispatch(core_id);
        progress |= self.fetch_decode(core_id, trace, branch);

        let core = &mut self.cores[core_id];
        if progress {
            core.ticks_since_progress = 0;
        } else {
            core.ticks_since_progress += 1;
            if core.ticks_since_progress == self.stall_ticks {
                tracing::warn!(
                    core_id,
                    pending_mem = core.pending_mem,
                    pending_branch = core.pending_branch,
                    dispatch_len = core.dispatch_queue.len(),
                    "processor stalled with no progress"
                );
            }
        }
        progress
    }

    /// Stage (1): result-bus writeback into registers.
    fn writeback(&mut self, core_id: usize) -> bool {
        let core = &mut self.cores[core_id];
        let mut progress = false;
        for bus in &mut core.cdbs {
            if !bus.busy {
                continue;
            }
            if bus.reg_id >= 0 {
                let reg = &mut core.regs[bus.reg_id as usize];
                if reg.tag == bus.tag {
                    reg.ready = true;
                }
            }
            bus.busy = false;
            progress = true;
        }
        progress
    }

    /// Stage (2): pop up to `C` instructions from `state_update_queue`,
    /// claim a CDB each, and retire them from bookkeeping.
    fn state_update(&mut self, core_id: usize) -> bool {
        let core = &mut self.cores[core_id];
        let mut progress = false;
        let cdb_count = core.cdbs.len();
        let mut popped = 0;
        let mut claimed = 0;
        while popped < cdb_count {
            let Some((tag, instr)) = core.state_update_queue.pop_first() else { break };
            progress = true;
            popped += 1;

            if instr.is_branch {
                core.pending_branch = false;
            } else {
                core.cdbs[claimed] = Cdb { busy: true, tag: instr.tag, reg_id: instr.dest_reg };
                claimed += 1;
            }
            core.instructions_retired += 1;

            if instr.is_long {
                let _ = core.long_schedule.remove(&tag);
            } else {
                let _ = core.fast_schedule.remove(&tag);
            }
        }
        progress
    }

    /// Stage (3): shift functional-unit pipelines, feeding the completed
    /// stage into next tick's `state_update_queue`.
    fn execute_advance(&mut self, core_id: usize) -> bool {
        let core = &mut self.cores[core_id];
        let mut progress = false;

        for fu in &mut core.fast_fus {
            let stalled = matches!(&fu.slots[0], Some(instr) if instr.is_memory) && core.pending_mem;
            if stalled {
                continue;
            }
            if let Some(instr) = fu.slots[0].take() {
                let _ = core.state_update_queue.insert(instr.tag, instr);
                progress = true;
            }
        }

        for fu in &mut core.long_fus {
            if let Some(instr) = fu.slots[2].take() {
                let _ = core.state_update_queue.insert(instr.tag, instr);
                progress = true;
            }
            fu.slots[2] = fu.slots[1].take();
            fu.slots[1] = fu.slots[0].take();
            if fu.slots[1].is_some() || fu.slots[2].is_some() {
                progress = true;
            }
        }
        progress
    }

    /// Stage (4a): scan both schedule queues in tag order and fire every
    /// entry whose operands and functional unit are ready.
    fn schedule(&mut self, core_id: usize, cache: &mut Cache) -> bool {
        let mut progress = false;
        progress |= self.schedule_queue(core_id, false, cache);
        progress |= self.schedule_queue(core_id, true, cache);
        progress
    }

    fn schedule_queue(&mut self, core_id: usize, is_long: bool, cache: &mut Cache) -> bool {
        let core = &mut self.cores[core_id];
        let pending_mem = core.pending_mem;
        let tags: Vec<Tag> = if is_long {
            core.long_schedule.keys().copied().collect()
        } else {
            core.fast_schedule.keys().copied().collect()
        };

        let mut progress = false;
        for tag in tags {
            let fu_count = if is_long { core.long_fus.len() } else { core.fast_fus.len() };
            let fu_free = |core: &CoreState, fu: usize| {
                if is_long { core.long_fus[fu].head_free() } else { core.fast_fus[fu].head_free() }
            };

            let entry = if is_long { core.long_schedule.get(&tag) } else { core.fast_schedule.get(&tag) };
            let Some(entry) = entry else { continue };
            if !entry.fires(pending_mem) {
                continue;
            }
            let Some(fu) = (0..fu_count).find(|&fu| fu_free(core, fu)) else { continue };

            let removed = if is_long { core.long_schedule.remove(&tag) } else { core.fast_schedule.remove(&tag) };
            let Some(mut instr) = removed else {
                unreachable!("tag came from this schedule queue's own key snapshot");
            };
            instr.fu = Some(fu);

            if instr.is_memory {
                let request_tag = make_tag(core_id, instr.tag);
                cache.memory_request(&instr.op, core_id, request_tag);
                core.pending_mem = true;
                core.mem_op_tag = Some(request_tag);
            }

            if is_long {
                core.long_fus[fu].slots[0] = Some(instr.clone());
                let _ = core.long_schedule.insert(tag, instr);
            } else {
                core.fast_fus[fu].slots[0] = Some(instr.clone());
                let _ = core.fast_schedule.insert(tag, instr);
            }
            progress = true;
        }
        progress
    }

    /// Stage (4b): drain `dispatch_queue` into schedule queues, renaming
    /// destinations and capturing or recording source operands.
    fn dispatch(&mut self, core_id: usize) -> bool {
        let core = &mut self.cores[core_id];
        let mut progress = false;

        let fast_cap = self.config.fast_schedule_capacity();
        let long_cap = self.config.long_schedule_capacity();

        while let Some(front) = core.dispatch_queue.front() {
            let cap = if front.is_long { long_cap } else { fast_cap };
            let len = if front.is_long { core.long_schedule.len() } else { core.fast_schedule.len() };
            if len >= cap {
                break;
            }
            let Some(mut instr) = core.dispatch_queue.pop_front() else {
                unreachable!("just matched `front` above");
            };
            progress = true;

            instr.src = [
                Operand::from_register(instr.op.src_reg[0], &core.regs),
                Operand::from_register(instr.op.src_reg[1], &core.regs),
            ];

            if instr.dest_reg >= 0 {
                core.regs[instr.dest_reg as usize] = Register { ready: false, tag: instr.tag };
            }

            if instr.is_long {
                let _ = core.long_schedule.insert(instr.tag, instr);
            } else {
                let _ = core.fast_schedule.insert(instr.tag, instr);
            }
        }

        for bus in core.cdbs.iter().filter(|bus| bus.busy) {
            let bus_tag = bus.tag;
            for entry in core.fast_schedule.values_mut().chain(core.long_schedule.values_mut()) {
                entry.src[0].snoop(bus_tag);
                entry.src[1].snoop(bus_tag);
            }
        }
        progress
    }

    /// Stage (5): pull up to `F` ops from the trace, predicting branches
    /// inline and pushing everything else onto `dispatch_queue`.
    fn fetch_decode(
        &mut self,
        core_id: usize,
        trace: &mut dyn TraceReader,
        branch: &mut BranchPredictor,
    ) -> bool {
        let mut progress = false;
        for _ in 0..self.config.fetch_width {
            let core = &mut self.cores[core_id];
            if core.pending_branch || core.dispatch_queue.len() >= self.config.dispatch_capacity() {
                break;
            }
            let Some(op) = trace.next_op(core_id) else {
                core.exhausted = true;
                break;
            };
            progress = true;

            match op.op_kind {
                OpKind::None => {}
                OpKind::End => core.exhausted = true,
                OpKind::Branch => {
                    let predicted = branch.predict(&op);
                    core.pending_branch = predicted != op.next_pc;
                    if core.pending_branch {
                        core.mispredictions += 1;
                        tracing::debug!(core_id, pc = %op.pc, "branch misprediction");
                    }
                }
                OpKind::MemLoad | OpKind::MemStore | OpKind::Alu | OpKind::AluLong => {
                    let tag = self.tags.next();
                    let instr = Instr {
                        tag,
                        op,
                        dest_reg: op.dest_reg,
                        src: [Operand::None, Operand::None],
                        is_long: matches!(op.op_kind, OpKind::AluLong),
                        is_memory: op.is_memory(),
                        is_branch: false,
                        fu: None,
                    };
                    self.cores[core_id].dispatch_queue.push_back(instr);
                }
            }
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::addr::Addr;
    use crate::common::trace::{VecTraceReader, NO_REG};
    use crate::config::{BranchConfig, CacheConfig};

    fn alu_op(dest: i32, src0: i32, src1: i32) -> TraceOp {
        TraceOp {
            op_kind: OpKind::Alu,
            pc: Addr(0),
            next_pc: Addr(4),
            addr: Addr(0),
            size: 0,
            dest_reg: dest,
            src_reg: [src0, src1],
        }
    }

    fn harness(config: ProcessorConfig, ops: Vec<TraceOp>) -> (Processor, VecTraceReader, BranchPredictor, Cache) {
        let processor = Processor::new(config, 1, 100_000);
        let trace = VecTraceReader::new(vec![ops]);
        let branch = BranchPredictor::new(BranchConfig::default()).unwrap();
        let cache = Cache::new(CacheConfig::default(), 1).unwrap();
        (processor, trace, branch, cache)
    }

    /// I1: r1 <- r2 + r3; I2: r4 <- r1 + r5. I2's source tag must track I1
    /// through dispatch, then resolve once I1 reaches the CDB.
    #[test]
    fn dispatch_renames_and_a_later_consumer_snoops_the_producer() {
        let config = ProcessorConfig { fetch_width: 2, ..ProcessorConfig::default() };
        let (mut processor, mut trace, mut branch, mut cache) =
            harness(config, vec![alu_op(1, 2, 3), alu_op(4, 1, 5)]);

        // Tick 1 fetches both ops into the dispatch queue; dispatch runs
        // before fetch/decode within a tick, so a second tick is needed to
        // actually move them into the schedule queue.
        processor.tick(0, &mut trace, &mut branch, &mut cache);
        processor.tick(0, &mut trace, &mut branch, &mut cache);

        let core = &processor.cores[0];
        assert_eq!(core.fast_schedule.len(), 2);
        let i1_tag = *core.fast_schedule.keys().next().unwrap();
        let i2 = core.fast_schedule.values().nth(1).unwrap();
        assert!(matches!(i2.src[0], Operand::Waiting(tag) if tag == i1_tag));
        assert!(!core.regs[1].ready);
        assert_eq!(core.regs[1].tag, i1_tag);
    }

    #[test]
    fn idle_processor_with_exhausted_trace_reports_finished() {
        let config = ProcessorConfig::default();
        let (mut processor, mut trace, mut branch, mut cache) = harness(config, vec![]);
        assert!(!processor.tick(0, &mut trace, &mut branch, &mut cache));
        assert!(processor.is_finished());
    }

    #[test]
    fn make_tag_packs_core_id_in_the_low_byte() {
        let tag = make_tag(3, Tag(7));
        assert_eq!(tag & 0xFF, 3);
        assert_eq!(tag >> 8, 7);
    }

    #[test]
    fn mem_op_callback_only_clears_matching_tag() {
        let config = ProcessorConfig::default();
        let mut processor = Processor::new(config, 1, 100_000);
        processor.cores[0].pending_mem = true;
        processor.cores[0].mem_op_tag = Some(42);

        processor.mem_op_callback(0, 7);
        assert!(processor.cores[0].pending_mem);

        processor.mem_op_callback(0, 42);
        assert!(!processor.cores[0].pending_mem);
    }

    /// A correctly-predicted branch reaching `state_update_queue` must still
    /// count against the per-tick `C` pop cap, not retire "for free" on top
    /// of `C` non-branch instructions.
    #[test]
    fn state_update_caps_total_pops_at_cdb_count_including_branches() {
        let config = ProcessorConfig { cdb_count: 1, ..ProcessorConfig::default() };
        let mut processor = Processor::new(config, 1, 100_000);

        let make = |tag: u64, is_branch: bool| Instr {
            tag: Tag(tag),
            op: alu_op(NO_REG, NO_REG, NO_REG),
            dest_reg: NO_REG,
            src: [Operand::None, Operand::None],
            is_long: false,
            is_memory: false,
            is_branch,
            fu: None,
        };

        let core = &mut processor.cores[0];
        core.state_update_queue.insert(Tag(1), make(1, true));
        core.state_update_queue.insert(Tag(2), make(2, false));

        processor.state_update(0);

        let core = &processor.cores[0];
        assert_eq!(core.instructions_retired, 1);
        assert_eq!(core.state_update_queue.len(), 1);
        assert!(core.state_update_queue.contains_key(&Tag(2)));
    }

    #[test]
    fn branch_misprediction_sets_pending_branch() {
        let config = ProcessorConfig::default();
        let branch_op = TraceOp {
            op_kind: OpKind::Branch,
            pc: Addr(0x40),
            next_pc: Addr(0x80),
            addr: Addr(0),
            size: 0,
            dest_reg: NO_REG,
            src_reg: [NO_REG, NO_REG],
        };
        let (mut processor, mut trace, mut branch, mut cache) = harness(config, vec![branch_op]);
        processor.tick(0, &mut trace, &mut branch, &mut cache);
        assert!(processor.cores[0].pending_branch);
    }
}
