//! Trace operations and trace readers.
//!
//! This module defines the external trace format the processor pipeline
//! consumes. It provides:
//! 1. **`TraceOp`**: one architectural operation (load, store, branch, ALU).
//! 2. **`TraceReader`**: the `get_next_op(core_id)` contract, with a
//!    file-backed and an in-memory implementation.

use std::fs;
use std::path::Path;

use crate::common::addr::Addr;
use crate::common::error::TraceFormatError;

/// The kind of architectural operation a trace line describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Placeholder op carrying no work (padding between real ops).
    None,
    /// A memory load.
    MemLoad,
    /// A memory store.
    MemStore,
    /// A conditional or unconditional branch.
    Branch,
    /// A single-cycle ALU operation.
    Alu,
    /// A multi-cycle ("long") ALU operation.
    AluLong,
    /// End of this core's trace.
    End,
}

impl OpKind {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "NONE" => Self::None,
            "MEM_LOAD" => Self::MemLoad,
            "MEM_STORE" => Self::MemStore,
            "BRANCH" => Self::Branch,
            "ALU" => Self::Alu,
            "ALU_LONG" => Self::AluLong,
            "END" => Self::End,
            _ => return None,
        })
    }
}

/// "No register" sentinel for `dest_reg`/`src_reg` fields.
pub const NO_REG: i32 = -1;

/// One architectural operation pulled from a trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceOp {
    /// What kind of operation this is.
    pub op_kind: OpKind,
    /// Program counter of this operation.
    pub pc: Addr,
    /// The actual next-PC outcome (branch target if taken, `pc + 4` otherwise).
    pub next_pc: Addr,
    /// Byte address touched by a memory op; unused otherwise.
    pub addr: Addr,
    /// Size in bytes of a memory access; unused otherwise.
    pub size: u32,
    /// Destination register, or [`NO_REG`].
    pub dest_reg: i32,
    /// Source registers, each either a valid index or [`NO_REG`].
    pub src_reg: [i32; 2],
}

impl TraceOp {
    /// Whether this op touches memory (load or store).
    #[must_use]
    pub fn is_memory(&self) -> bool {
        matches!(self.op_kind, OpKind::MemLoad | OpKind::MemStore)
    }

    /// Whether this op is a store (as opposed to a load).
    #[must_use]
    pub fn is_store(&self) -> bool {
        matches!(self.op_kind, OpKind::MemStore)
    }
}

/// Source of per-core trace operations.
///
/// Mirrors the reference model's `get_next_op(core_id) -> op | none`
/// contract: each call advances that core's cursor by one operation.
pub trait TraceReader {
    /// Returns the next operation for `core_id`, or `None` once that core's
    /// trace is exhausted.
    fn next_op(&mut self, core_id: usize) -> Option<TraceOp>;
}

/// Trace line grammar: one op per line, `#`-prefixed lines are comments.
///
/// Fields are whitespace-separated in `TraceOp` field order:
/// `op_kind pc next_pc addr size dest_reg src_reg0 src_reg1`, with `pc`,
/// `next_pc`, and `addr` in hex (`0x`-prefixed) and the rest in decimal.
fn parse_line(line: &str, line_no: usize) -> Result<Option<TraceOp>, TraceFormatError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 8 {
        return Err(TraceFormatError::MalformedLine {
            line_no,
            text: line.to_string(),
        });
    }

    let op_kind = OpKind::parse(fields[0]).ok_or_else(|| TraceFormatError::UnknownOpKind {
        line_no,
        kind: fields[0].to_string(),
    })?;

    let parse_hex = |field: &str| -> Result<u64, TraceFormatError> {
        let stripped = field.strip_prefix("0x").unwrap_or(field);
        u64::from_str_radix(stripped, 16).map_err(|_| TraceFormatError::InvalidField {
            line_no,
            field: field.to_string(),
        })
    };
    let parse_int = |field: &str| -> Result<i32, TraceFormatError> {
        field.parse::<i32>().map_err(|_| TraceFormatError::InvalidField {
            line_no,
            field: field.to_string(),
        })
    };

    Ok(Some(TraceOp {
        op_kind,
        pc: Addr(parse_hex(fields[1])?),
        next_pc: Addr(parse_hex(fields[2])?),
        addr: Addr(parse_hex(fields[3])?),
        size: parse_int(fields[4])?.max(0) as u32,
        dest_reg: parse_int(fields[5])?,
        src_reg: [parse_int(fields[6])?, parse_int(fields[7])?],
    }))
}

/// A single flat trace file shared by all cores, round-robin distributed.
///
/// Suitable for traces that interleave core ids implicitly by position;
/// when every op belongs to one core, construct one `FileTraceReader` per
/// core instead.
#[derive(Debug)]
pub struct FileTraceReader {
    ops: Vec<TraceOp>,
    cursor: usize,
}

impl FileTraceReader {
    /// Reads and fully parses `path`, eagerly validating the whole file.
    ///
    /// # Errors
    ///
    /// Returns [`TraceFormatError`] if any non-comment line fails to parse.
    pub fn open(path: &Path) -> Result<Self, TraceFormatError> {
        let text = fs::read_to_string(path)
            .map_err(|_| TraceFormatError::MalformedLine {
                line_no: 0,
                text: path.display().to_string(),
            })?;
        Self::from_str(&text)
    }

    /// Parses trace text already held in memory.
    ///
    /// # Errors
    ///
    /// Returns [`TraceFormatError`] if any non-comment line fails to parse.
    pub fn from_str(text: &str) -> Result<Self, TraceFormatError> {
        let mut ops = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if let Some(op) = parse_line(line, idx + 1)? {
                ops.push(op);
            }
        }
        Ok(Self { ops, cursor: 0 })
    }
}

impl TraceReader for FileTraceReader {
    fn next_op(&mut self, _core_id: usize) -> Option<TraceOp> {
        let op = self.ops.get(self.cursor).copied();
        if op.is_some() {
            self.cursor += 1;
        }
        op
    }
}

/// An in-memory, per-core trace reader for tests.
#[derive(Debug, Default, Clone)]
pub struct VecTraceReader {
    per_core: Vec<Vec<TraceOp>>,
    cursors: Vec<usize>,
}

impl VecTraceReader {
    /// Builds a reader from one op sequence per core.
    #[must_use]
    pub fn new(per_core: Vec<Vec<TraceOp>>) -> Self {
        let cursors = vec![0; per_core.len()];
        Self { per_core, cursors }
    }
}

impl TraceReader for VecTraceReader {
    fn next_op(&mut self, core_id: usize) -> Option<TraceOp> {
        let ops = self.per_core.get(core_id)?;
        let cursor = self.cursors.get_mut(core_id)?;
        let op = ops.get(*cursor).copied();
        if op.is_some() {
            *cursor += 1;
        }
        op
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_basic_line() {
        let op = parse_line("MEM_LOAD 0x100 0x104 0x40 4 1 -1 -1", 1)
            .unwrap()
            .unwrap();
        assert_eq!(op.op_kind, OpKind::MemLoad);
        assert_eq!(op.pc, Addr(0x100));
        assert_eq!(op.addr, Addr(0x40));
        assert_eq!(op.dest_reg, 1);
        assert_eq!(op.src_reg, [NO_REG, NO_REG]);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        assert_eq!(parse_line("# a comment", 1).unwrap(), None);
        assert_eq!(parse_line("   ", 2).unwrap(), None);
    }

    #[test]
    fn rejects_unknown_op_kind() {
        let err = parse_line("WEIRD 0x0 0x0 0x0 0 -1 -1 -1", 3).unwrap_err();
        assert!(matches!(err, TraceFormatError::UnknownOpKind { line_no: 3, .. }));
    }

    #[test]
    fn file_reader_opens_and_parses_a_trace_on_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(file, "# header comment").unwrap();
        writeln!(file, "ALU 0x0 0x4 0x0 0 1 2 3").unwrap();
        writeln!(file, "MEM_LOAD 0x4 0x8 0x40 4 2 -1 -1").unwrap();

        let mut reader = FileTraceReader::open(file.path()).unwrap();
        assert_eq!(reader.next_op(0).unwrap().op_kind, OpKind::Alu);
        assert_eq!(reader.next_op(0).unwrap().op_kind, OpKind::MemLoad);
        assert!(reader.next_op(0).is_none());
    }

    #[test]
    fn vec_reader_is_per_core_independent() {
        let mut reader = VecTraceReader::new(vec![
            vec![TraceOp {
                op_kind: OpKind::Alu,
                pc: Addr(0),
                next_pc: Addr(4),
                addr: Addr(0),
                size: 0,
                dest_reg: 1,
                src_reg: [NO_REG, NO_REG],
            }],
            vec![],
        ]);
        assert!(reader.next_op(0).is_some());
        assert!(reader.next_op(0).is_none());
        assert!(reader.next_op(1).is_none());
    }
}
