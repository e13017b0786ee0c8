//! CLI front end for the out-of-order multiprocessor memory-hierarchy simulator.
//!
//! Configuration is JSON-first (`--config`): CLI flags below override
//! individual fields of whatever `SimConfig` was loaded (or the default, if
//! `--config` is absent). Flag letters mirror the reference tool's
//! per-component option letters (`p,s,b,g` / `E,s,b,i,R` / `f,d,m,j,k,c`)
//! except where two components reuse the same letter (`branch.s`/`cache.s`,
//! `branch.b`/`cache.b`); those are long-flag-only to stay unambiguous in a
//! single flat namespace.

use std::fs;
use std::path::PathBuf;
use std::process;

use cadss_core::common::FileTraceReader;
use cadss_core::config::{BranchMode, Protocol, SimConfig};
use cadss_core::{SimError, Simulator};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "cadss",
    author,
    version,
    about = "Out-of-order multiprocessor memory-hierarchy simulator",
    long_about = "Runs a trace through branch prediction, set-associative caching, bus \
        coherence, and a Tomasulo-style processor pipeline.\n\n\
        Configuration is JSON-first; CLI flags override individual fields.\n\n\
        Example:\n  cadss --trace trace.txt --config sim.json --cache-e 8 --protocol mesi"
)]
struct Cli {
    /// Trace file to run (whitespace-separated op lines; see the trace grammar).
    #[arg(long, short = 't')]
    trace: PathBuf,

    /// JSON configuration file; CLI flags override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of simulated cores.
    #[arg(long)]
    core_count: Option<usize>,

    /// Cache-coherence protocol.
    #[arg(long, value_enum)]
    protocol: Option<ProtocolArg>,

    /// Ticks with no progress before the stall watchdog warns.
    #[arg(long)]
    stall_ticks: Option<u64>,

    /// Branch: log2 of the PHT/BTB entry count.
    #[arg(long = "branch-s")]
    branch_s: Option<u32>,

    /// Branch: branch history register width, in bits.
    #[arg(long = "branch-b")]
    branch_b: Option<u32>,

    /// Branch: prediction indexing mode.
    #[arg(short = 'g', long = "branch-mode", value_enum)]
    branch_mode: Option<BranchModeArg>,

    /// Cache: associativity (ways per set).
    #[arg(short = 'E', long = "cache-e")]
    cache_e: Option<usize>,

    /// Cache: log2 of the set count.
    #[arg(long = "cache-s")]
    cache_s: Option<u32>,

    /// Cache: log2 of the block size.
    #[arg(long = "cache-b")]
    cache_b: Option<u32>,

    /// Cache: victim buffer entry count (0 disables it).
    #[arg(short = 'i', long = "cache-i")]
    cache_i: Option<usize>,

    /// Cache: RRIP counter width in bits (0 falls back to LRU).
    #[arg(short = 'R', long = "cache-r")]
    cache_r: Option<u32>,

    /// Processor: fetch width, ops per tick.
    #[arg(short = 'f', long = "fetch-width")]
    fetch_width: Option<usize>,

    /// Processor: dispatch-queue capacity multiplier.
    #[arg(short = 'd', long = "dispatch-mult")]
    dispatch_mult: Option<usize>,

    /// Processor: schedule-queue capacity multiplier.
    #[arg(short = 'm', long = "schedule-mult")]
    schedule_mult: Option<usize>,

    /// Processor: number of fast (1-stage) functional units.
    #[arg(short = 'j', long = "fast-fus")]
    fast_fus: Option<usize>,

    /// Processor: number of long (3-stage) functional units.
    #[arg(short = 'k', long = "long-fus")]
    long_fus: Option<usize>,

    /// Processor: number of common data buses.
    #[arg(short = 'c', long = "cdb-count")]
    cdb_count: Option<usize>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ProtocolArg {
    Mi,
    Msi,
    Mesi,
    Mesif,
}

impl From<ProtocolArg> for Protocol {
    fn from(value: ProtocolArg) -> Self {
        match value {
            ProtocolArg::Mi => Self::Mi,
            ProtocolArg::Msi => Self::Msi,
            ProtocolArg::Mesi => Self::Mesi,
            ProtocolArg::Mesif => Self::Mesif,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BranchModeArg {
    Default,
    Gshare,
    Gselect,
    YehPatt,
}

impl From<BranchModeArg> for BranchMode {
    fn from(value: BranchModeArg) -> Self {
        match value {
            BranchModeArg::Default => Self::Default,
            BranchModeArg::Gshare => Self::Gshare,
            BranchModeArg::Gselect => Self::Gselect,
            BranchModeArg::YehPatt => Self::YehPatt,
        }
    }
}

/// Merges CLI overrides onto a base config, CLI taking precedence.
fn apply_overrides(mut config: SimConfig, cli: &Cli) -> SimConfig {
    if let Some(core_count) = cli.core_count {
        config.core_count = core_count;
    }
    if let Some(protocol) = cli.protocol {
        config.protocol = protocol.into();
    }
    if let Some(stall_ticks) = cli.stall_ticks {
        config.stall_ticks = stall_ticks;
    }

    if let Some(s) = cli.branch_s {
        config.branch.s = s;
    }
    if let Some(b) = cli.branch_b {
        config.branch.b = b;
    }
    if let Some(mode) = cli.branch_mode {
        config.branch.mode = mode.into();
    }

    if let Some(ways) = cli.cache_e {
        config.cache.ways = ways;
    }
    if let Some(s) = cli.cache_s {
        config.cache.s = s;
    }
    if let Some(b) = cli.cache_b {
        config.cache.b = b;
    }
    if let Some(victim) = cli.cache_i {
        config.cache.victim_entries = victim;
    }
    if let Some(rrip_bits) = cli.cache_r {
        config.cache.rrip_bits = rrip_bits;
    }

    if let Some(fetch_width) = cli.fetch_width {
        config.processor.fetch_width = fetch_width;
    }
    if let Some(mult) = cli.dispatch_mult {
        config.processor.dispatch_multiplier = mult;
    }
    if let Some(mult) = cli.schedule_mult {
        config.processor.schedule_multiplier = mult;
    }
    if let Some(fast_fus) = cli.fast_fus {
        config.processor.fast_fus = fast_fus;
    }
    if let Some(long_fus) = cli.long_fus {
        config.processor.long_fus = long_fus;
    }
    if let Some(cdb_count) = cli.cdb_count {
        config.processor.cdb_count = cdb_count;
    }

    config
}

fn load_config(cli: &Cli) -> Result<SimConfig, SimError> {
    let base = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        }
        None => SimConfig::default(),
    };
    Ok(apply_overrides(base, cli))
}

fn run(cli: Cli) -> Result<(), SimError> {
    let config = load_config(&cli)?;

    let trace_text = fs::read_to_string(&cli.trace)?;
    let trace = Box::new(FileTraceReader::from_str(&trace_text)?);
    let mut sim = Simulator::new(config, trace)?;

    let stats = sim.run()?;
    println!("{stats}");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
