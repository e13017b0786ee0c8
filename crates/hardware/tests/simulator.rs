//! End-to-end scenarios driving a full `Simulator`, not just one subsystem.

use cadss_core::common::{Addr, OpKind, TraceOp, TraceReader, VecTraceReader, NO_REG};
use cadss_core::config::{CacheConfig, ProcessorConfig, Protocol, SimConfig};
use cadss_core::Simulator;
use mockall::mock;
use pretty_assertions::assert_eq;

mock! {
    Trace {}
    impl TraceReader for Trace {
        fn next_op(&mut self, core_id: usize) -> Option<TraceOp>;
    }
}

fn alu(pc: u64, dest: i32, src0: i32, src1: i32) -> TraceOp {
    TraceOp {
        op_kind: OpKind::Alu,
        pc: Addr(pc),
        next_pc: Addr(pc + 4),
        addr: Addr(0),
        size: 0,
        dest_reg: dest,
        src_reg: [src0, src1],
    }
}

fn load(pc: u64, addr: u64, dest: i32) -> TraceOp {
    TraceOp {
        op_kind: OpKind::MemLoad,
        pc: Addr(pc),
        next_pc: Addr(pc + 4),
        addr: Addr(addr),
        size: 4,
        dest_reg: dest,
        src_reg: [NO_REG, NO_REG],
    }
}

/// Routes `tracing` output (stall warnings, branch/bus debug events) through
/// the test harness's own writer, so `cargo test -- --nocapture` shows it.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn store(pc: u64, addr: u64) -> TraceOp {
    TraceOp {
        op_kind: OpKind::MemStore,
        pc: Addr(pc),
        next_pc: Addr(pc + 4),
        addr: Addr(addr),
        size: 4,
        dest_reg: NO_REG,
        src_reg: [NO_REG, NO_REG],
    }
}

/// I1: r1 <- r2 + r3; I2: r4 <- r1 + r5. Both must retire even though I2's
/// source operand is renamed onto I1's tag at dispatch time.
#[test]
fn a_dependent_alu_chain_retires_both_instructions() {
    init_tracing();
    let config = SimConfig::default();
    let trace = Box::new(VecTraceReader::new(vec![vec![
        alu(0x0, 1, 2, 3),
        alu(0x4, 4, 1, 5),
    ]]));
    let mut sim = Simulator::new(config, trace).unwrap();
    let stats = sim.run().unwrap();
    assert_eq!(stats.instructions_retired, 2);
}

/// A single load must complete through the cache's pending-request queue
/// and report exactly one memory completion.
#[test]
fn a_single_load_completes_and_retires() {
    init_tracing();
    let config = SimConfig::default();
    let trace = Box::new(VecTraceReader::new(vec![vec![load(0x0, 0x100, 1)]]));
    let mut sim = Simulator::new(config, trace).unwrap();
    let stats = sim.run().unwrap();
    assert_eq!(stats.instructions_retired, 1);
    assert_eq!(stats.mem_completions, 1);
}

/// Two cores touching the same line under MSI: core 0 stores, core 1 loads.
/// Both requests must resolve without an invariant violation aborting the run.
#[test]
fn two_cores_sharing_a_line_under_msi_both_complete() {
    init_tracing();
    let config = SimConfig {
        core_count: 2,
        protocol: Protocol::Msi,
        cache: CacheConfig { ways: 2, s: 1, b: 4, victim_entries: 0, rrip_bits: 0 },
        processor: ProcessorConfig { fast_fus: 1, long_fus: 1, cdb_count: 1, ..ProcessorConfig::default() },
        ..SimConfig::default()
    };
    let trace = Box::new(VecTraceReader::new(vec![
        vec![store(0x0, 0x40)],
        vec![load(0x0, 0x40, 1)],
    ]));
    let mut sim = Simulator::new(config, trace).unwrap();
    let stats = sim.run().unwrap();
    assert_eq!(stats.instructions_retired, 2);
    assert_eq!(stats.mem_completions, 2);
}

/// A mocked trace reader lets a test pin down exactly how many times (and
/// with what core id) the simulator pulls from its trace source, rather
/// than inferring it indirectly through retirement counts.
#[test]
fn simulator_pulls_from_the_trace_reader_once_per_core_until_exhausted() {
    init_tracing();
    let mut trace = MockTrace::new();
    let mut calls = 0;
    trace.expect_next_op().withf(|&core_id| core_id == 0).returning(move |_| {
        calls += 1;
        match calls {
            1 => Some(alu(0x0, 1, 2, 3)),
            _ => None,
        }
    });

    let config = SimConfig::default();
    let mut sim = Simulator::new(config, Box::new(trace)).unwrap();
    let stats = sim.run().unwrap();
    assert_eq!(stats.instructions_retired, 1);
}

/// A line-crossing load must still retire: both halves of the split access
/// resolve through the pending queue before the instruction state-updates.
#[test]
fn a_line_crossing_load_still_retires() {
    init_tracing();
    let config = SimConfig {
        cache: CacheConfig { ways: 2, s: 1, b: 4, victim_entries: 0, rrip_bits: 0 },
        ..SimConfig::default()
    };
    // b = 4 => 16-byte blocks; addr 0x1E + size 4 crosses into the next block.
    let trace = Box::new(VecTraceReader::new(vec![vec![load(0x0, 0x1E, 1)]]));
    let mut sim = Simulator::new(config, trace).unwrap();
    let stats = sim.run().unwrap();
    assert_eq!(stats.instructions_retired, 1);
}
