// isa.rs — Instruction model for the three kernel queues
//
// Each queue has a closed set of operations. Rewrite sites match on these
// enums exhaustively, so adding an operation forces every site to decide
// what to do with it.
//
// Line grammar (fields as produced by `lexer::tokenize_line`):
//   memory/control:  <line>, <op>, <operand>...
//   compute:         F<bundle>, <info>, <op>, <operand>...
//
// Operand slots that may reference a variable hold a `MemRef`: the variable
// name as written by the assembler, or a resolved numeric address.

use std::fmt;

use crate::error::Queue;

/// Word address in HBM (or in the scratchpad when there is no HBM).
pub type Address = u32;

// ── Variable references ──────────────────────────────────────────────────

/// Whether `name` is a legal variable identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// An operand that names a polynomial in memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemRef {
    /// Symbolic variable, not yet resolved.
    Var(String),
    /// Concrete word address.
    Addr(Address),
}

impl MemRef {
    pub fn parse(field: &str) -> Result<Self, String> {
        if !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit()) {
            return field
                .parse()
                .map(MemRef::Addr)
                .map_err(|_| format!("address '{field}' out of range"));
        }
        if is_valid_variable_name(field) {
            Ok(MemRef::Var(field.to_string()))
        } else {
            Err(format!("invalid variable name '{field}'"))
        }
    }

    pub fn var_name(&self) -> Option<&str> {
        match self {
            MemRef::Var(name) => Some(name),
            MemRef::Addr(_) => None,
        }
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemRef::Var(name) => write!(f, "{name}"),
            MemRef::Addr(addr) => write!(f, "{addr}"),
        }
    }
}

// ── Field helpers ────────────────────────────────────────────────────────

fn expect_operands(op: &str, operands: &[String], count: usize) -> Result<(), String> {
    if operands.len() != count {
        return Err(format!(
            "`{op}` expects {count} operand(s), found {}",
            operands.len()
        ));
    }
    Ok(())
}

fn parse_u32(field: &str, what: &str) -> Result<u32, String> {
    field
        .parse()
        .map_err(|_| format!("expected unsigned integer for {what}, found '{field}'"))
}

// ── Queue operation trait ────────────────────────────────────────────────

/// Operations of the memory and control queues, which share the
/// `<line>, <op>, <operand>...` layout.
pub trait LineOp: Sized + fmt::Display {
    const QUEUE: Queue;

    /// Parse from the op name and its operands.
    fn parse(op: &str, operands: &[String]) -> Result<Self, String>;

    /// Whether this is the queue's kernel-local terminator.
    fn is_terminator(&self) -> bool;

    /// Mnemonic of the terminator, for diagnostics.
    fn terminator_name() -> &'static str;
}

/// A memory- or control-queue instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr<Op> {
    /// Line number as written by the assembler (kernel-local).
    pub line: u32,
    pub op: Op,
    pub comment: Option<String>,
}

impl<Op: LineOp> Instr<Op> {
    pub fn new(line: u32, op: Op) -> Self {
        Instr {
            line,
            op,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Parse from tokenized fields: `<line>, <op>, <operand>...`.
    pub fn from_fields(fields: &[String], comment: Option<String>) -> Result<Self, String> {
        if fields.len() < 2 {
            return Err(format!(
                "expected at least 2 fields (line, op), found {}",
                fields.len()
            ));
        }
        let line = parse_u32(&fields[0], "line number")?;
        let op = Op::parse(&fields[1], &fields[2..])?;
        Ok(Instr { line, op, comment })
    }

    /// Prepend `note` to the existing comment, separated by `; `.
    pub fn annotate(&mut self, note: String) {
        self.comment = Some(match self.comment.take() {
            Some(existing) => format!("{note}; {existing}"),
            None => note,
        });
    }
}

// ── Memory queue ─────────────────────────────────────────────────────────

/// Memory-queue (HBM ↔ scratchpad) operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MOp {
    /// `mload, <spad>, <src>`: HBM → scratchpad.
    Load { spad: u32, src: MemRef },
    /// `mstore, <dst>, <spad>`: scratchpad → HBM.
    Store { dst: MemRef, spad: u32 },
    /// `msyncc, <target>`: wait for control-queue line `target` to retire.
    Sync { target: u32 },
}

impl MOp {
    pub fn name(&self) -> &'static str {
        match self {
            MOp::Load { .. } => "mload",
            MOp::Store { .. } => "mstore",
            MOp::Sync { .. } => "msyncc",
        }
    }

    /// The variable operand of a load/store.
    pub fn mem_ref(&self) -> Option<&MemRef> {
        match self {
            MOp::Load { src, .. } => Some(src),
            MOp::Store { dst, .. } => Some(dst),
            MOp::Sync { .. } => None,
        }
    }

    pub fn mem_ref_mut(&mut self) -> Option<&mut MemRef> {
        match self {
            MOp::Load { src, .. } => Some(src),
            MOp::Store { dst, .. } => Some(dst),
            MOp::Sync { .. } => None,
        }
    }
}

impl LineOp for MOp {
    const QUEUE: Queue = Queue::Memory;

    fn parse(op: &str, operands: &[String]) -> Result<Self, String> {
        match op {
            "mload" => {
                expect_operands(op, operands, 2)?;
                Ok(MOp::Load {
                    spad: parse_u32(&operands[0], "scratchpad address")?,
                    src: MemRef::parse(&operands[1])?,
                })
            }
            "mstore" => {
                expect_operands(op, operands, 2)?;
                Ok(MOp::Store {
                    dst: MemRef::parse(&operands[0])?,
                    spad: parse_u32(&operands[1], "scratchpad address")?,
                })
            }
            "msyncc" => {
                expect_operands(op, operands, 1)?;
                Ok(MOp::Sync {
                    target: parse_u32(&operands[0], "sync target")?,
                })
            }
            other => Err(format!("unknown memory-queue instruction '{other}'")),
        }
    }

    fn is_terminator(&self) -> bool {
        matches!(self, MOp::Sync { .. })
    }

    fn terminator_name() -> &'static str {
        "msyncc"
    }
}

impl fmt::Display for MOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MOp::Load { spad, src } => write!(f, "mload, {spad}, {src}"),
            MOp::Store { dst, spad } => write!(f, "mstore, {dst}, {spad}"),
            MOp::Sync { target } => write!(f, "msyncc, {target}"),
        }
    }
}

pub type MInstr = Instr<MOp>;

// ── Control queue ────────────────────────────────────────────────────────

/// Control-queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum COp {
    /// `bload, <meta_target>, <src>, <col>`: scratchpad metadata → special registers.
    BLoad { meta_target: u32, src: MemRef, col: u32 },
    /// `bones, <src>, <col>`: identity metadata → register file.
    BOnes { src: MemRef, col: u32 },
    /// `cexit`: end of program.
    Exit,
    /// `cload, <dst>, <src>`: scratchpad residue → register.
    CLoad { dst: String, src: MemRef },
    /// `cnop, <cycles>`: idle for `cycles + 1` cycles.
    Nop { cycles: u32 },
    /// `cstore, <dst>`: intermediate buffer → scratchpad.
    CStore { dst: MemRef },
    /// `csyncm, <target>`: wait for memory-queue line `target` to retire.
    Sync { target: u32 },
    /// `ifetch, <bundle>`: fetch a compute bundle.
    IFetch { bundle: u32 },
    /// `kg_load, <dst>`
    KgLoad { dst: String },
    /// `kg_seed, <spad>, <block>`
    KgSeed { spad: u32, block: u32 },
    /// `kg_start`
    KgStart,
    /// `nload, <table>, <src>`: scratchpad → NTT routing table.
    NLoad { table: u32, src: MemRef },
    /// `xinstfetch, <xq_dst>, <hbm_src>`
    XInstFetch { xq_dst: u32, hbm_src: u32 },
}

impl COp {
    pub fn name(&self) -> &'static str {
        match self {
            COp::BLoad { .. } => "bload",
            COp::BOnes { .. } => "bones",
            COp::Exit => "cexit",
            COp::CLoad { .. } => "cload",
            COp::Nop { .. } => "cnop",
            COp::CStore { .. } => "cstore",
            COp::Sync { .. } => "csyncm",
            COp::IFetch { .. } => "ifetch",
            COp::KgLoad { .. } => "kg_load",
            COp::KgSeed { .. } => "kg_seed",
            COp::KgStart => "kg_start",
            COp::NLoad { .. } => "nload",
            COp::XInstFetch { .. } => "xinstfetch",
        }
    }

    /// The scratchpad operand that names a variable (load/store-like ops).
    pub fn spad_ref(&self) -> Option<&MemRef> {
        match self {
            COp::BLoad { src, .. }
            | COp::BOnes { src, .. }
            | COp::CLoad { src, .. }
            | COp::NLoad { src, .. } => Some(src),
            COp::CStore { dst } => Some(dst),
            COp::Exit
            | COp::Nop { .. }
            | COp::Sync { .. }
            | COp::IFetch { .. }
            | COp::KgLoad { .. }
            | COp::KgSeed { .. }
            | COp::KgStart
            | COp::XInstFetch { .. } => None,
        }
    }

    pub fn spad_ref_mut(&mut self) -> Option<&mut MemRef> {
        match self {
            COp::BLoad { src, .. }
            | COp::BOnes { src, .. }
            | COp::CLoad { src, .. }
            | COp::NLoad { src, .. } => Some(src),
            COp::CStore { dst } => Some(dst),
            COp::Exit
            | COp::Nop { .. }
            | COp::Sync { .. }
            | COp::IFetch { .. }
            | COp::KgLoad { .. }
            | COp::KgSeed { .. }
            | COp::KgStart
            | COp::XInstFetch { .. } => None,
        }
    }

    /// Instructions that start a new fetch from the scratchpad: a bundle
    /// fetch or a scratchpad table load. Idle time owed to elided syncs is
    /// paid before these.
    pub fn starts_fetch(&self) -> bool {
        matches!(
            self,
            COp::IFetch { .. } | COp::NLoad { .. } | COp::BLoad { .. }
        )
    }
}

impl LineOp for COp {
    const QUEUE: Queue = Queue::Control;

    fn parse(op: &str, operands: &[String]) -> Result<Self, String> {
        match op {
            "bload" => {
                expect_operands(op, operands, 3)?;
                Ok(COp::BLoad {
                    meta_target: parse_u32(&operands[0], "metadata target")?,
                    src: MemRef::parse(&operands[1])?,
                    col: parse_u32(&operands[2], "column")?,
                })
            }
            "bones" => {
                expect_operands(op, operands, 2)?;
                Ok(COp::BOnes {
                    src: MemRef::parse(&operands[0])?,
                    col: parse_u32(&operands[1], "column")?,
                })
            }
            "cexit" => {
                expect_operands(op, operands, 0)?;
                Ok(COp::Exit)
            }
            "cload" => {
                expect_operands(op, operands, 2)?;
                Ok(COp::CLoad {
                    dst: operands[0].clone(),
                    src: MemRef::parse(&operands[1])?,
                })
            }
            "cnop" => {
                expect_operands(op, operands, 1)?;
                Ok(COp::Nop {
                    cycles: parse_u32(&operands[0], "cycle count")?,
                })
            }
            "cstore" => {
                expect_operands(op, operands, 1)?;
                Ok(COp::CStore {
                    dst: MemRef::parse(&operands[0])?,
                })
            }
            "csyncm" => {
                expect_operands(op, operands, 1)?;
                Ok(COp::Sync {
                    target: parse_u32(&operands[0], "sync target")?,
                })
            }
            "ifetch" => {
                expect_operands(op, operands, 1)?;
                Ok(COp::IFetch {
                    bundle: parse_u32(&operands[0], "bundle index")?,
                })
            }
            "kg_load" => {
                expect_operands(op, operands, 1)?;
                Ok(COp::KgLoad {
                    dst: operands[0].clone(),
                })
            }
            "kg_seed" => {
                expect_operands(op, operands, 2)?;
                Ok(COp::KgSeed {
                    spad: parse_u32(&operands[0], "scratchpad address")?,
                    block: parse_u32(&operands[1], "block number")?,
                })
            }
            "kg_start" => {
                expect_operands(op, operands, 0)?;
                Ok(COp::KgStart)
            }
            "nload" => {
                expect_operands(op, operands, 2)?;
                Ok(COp::NLoad {
                    table: parse_u32(&operands[0], "table index")?,
                    src: MemRef::parse(&operands[1])?,
                })
            }
            "xinstfetch" => {
                expect_operands(op, operands, 2)?;
                Ok(COp::XInstFetch {
                    xq_dst: parse_u32(&operands[0], "queue destination")?,
                    hbm_src: parse_u32(&operands[1], "HBM source")?,
                })
            }
            other => Err(format!("unknown control-queue instruction '{other}'")),
        }
    }

    fn is_terminator(&self) -> bool {
        matches!(self, COp::Exit)
    }

    fn terminator_name() -> &'static str {
        "cexit"
    }
}

impl fmt::Display for COp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self {
            COp::BLoad {
                meta_target,
                src,
                col,
            } => write!(f, "{name}, {meta_target}, {src}, {col}"),
            COp::BOnes { src, col } => write!(f, "{name}, {src}, {col}"),
            COp::Exit | COp::KgStart => write!(f, "{name}"),
            COp::CLoad { dst, src } => write!(f, "{name}, {dst}, {src}"),
            COp::Nop { cycles } => write!(f, "{name}, {cycles}"),
            COp::CStore { dst } => write!(f, "{name}, {dst}"),
            COp::Sync { target } => write!(f, "{name}, {target}"),
            COp::IFetch { bundle } => write!(f, "{name}, {bundle}"),
            COp::KgLoad { dst } => write!(f, "{name}, {dst}"),
            COp::KgSeed { spad, block } => write!(f, "{name}, {spad}, {block}"),
            COp::NLoad { table, src } => write!(f, "{name}, {table}, {src}"),
            COp::XInstFetch { xq_dst, hbm_src } => write!(f, "{name}, {xq_dst}, {hbm_src}"),
        }
    }
}

pub type CInstr = Instr<COp>;

// ── Compute queue ────────────────────────────────────────────────────────

/// Compute-queue operations. Operands are register names and immediates,
/// which the linker never rewrites, so only their count is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XOp {
    Add,
    Sub,
    Mul,
    Muli,
    Mac,
    Maci,
    Ntt,
    Intt,
    TwNtt,
    TwiNtt,
    RShuffle,
    Move,
    XStore,
    Exit,
    Nop,
}

impl XOp {
    pub const ALL: [XOp; 15] = [
        XOp::Add,
        XOp::Sub,
        XOp::Mul,
        XOp::Muli,
        XOp::Mac,
        XOp::Maci,
        XOp::Ntt,
        XOp::Intt,
        XOp::TwNtt,
        XOp::TwiNtt,
        XOp::RShuffle,
        XOp::Move,
        XOp::XStore,
        XOp::Exit,
        XOp::Nop,
    ];

    pub fn name(self) -> &'static str {
        match self {
            XOp::Add => "add",
            XOp::Sub => "sub",
            XOp::Mul => "mul",
            XOp::Muli => "muli",
            XOp::Mac => "mac",
            XOp::Maci => "maci",
            XOp::Ntt => "ntt",
            XOp::Intt => "intt",
            XOp::TwNtt => "twntt",
            XOp::TwiNtt => "twintt",
            XOp::RShuffle => "rshuffle",
            XOp::Move => "move",
            XOp::XStore => "xstore",
            XOp::Exit => "bexit",
            XOp::Nop => "nop",
        }
    }

    pub fn from_name(name: &str) -> Option<XOp> {
        XOp::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Operand count after the `F<bundle>, <info>, <op>` prefix.
    pub fn operand_count(self) -> usize {
        match self {
            XOp::Add | XOp::Sub | XOp::Mul | XOp::Muli => 4,
            XOp::Mac | XOp::Maci => 5,
            XOp::Ntt | XOp::Intt | XOp::TwNtt | XOp::TwiNtt => 7,
            XOp::RShuffle => 6,
            XOp::Move => 2,
            XOp::XStore | XOp::Nop => 1,
            XOp::Exit => 0,
        }
    }

    /// Whether the last operand is the ring-size residual.
    pub fn has_residual(self) -> bool {
        match self {
            XOp::Add
            | XOp::Sub
            | XOp::Mul
            | XOp::Muli
            | XOp::Mac
            | XOp::Maci
            | XOp::Ntt
            | XOp::Intt
            | XOp::TwNtt
            | XOp::TwiNtt => true,
            XOp::RShuffle | XOp::Move | XOp::XStore | XOp::Exit | XOp::Nop => false,
        }
    }
}

impl fmt::Display for XOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A compute-queue instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XInstr {
    pub bundle: u32,
    /// Second field, carried through verbatim.
    pub info: String,
    pub op: XOp,
    pub operands: Vec<String>,
    pub comment: Option<String>,
}

impl XInstr {
    /// Parse from tokenized fields: `F<bundle>, <info>, <op>, <operand>...`.
    pub fn from_fields(fields: &[String], comment: Option<String>) -> Result<Self, String> {
        if fields.len() < 3 {
            return Err(format!(
                "expected at least 3 fields (bundle, info, op), found {}",
                fields.len()
            ));
        }
        let bundle = parse_bundle_tag(&fields[0])?;
        let op = XOp::from_name(&fields[2])
            .ok_or_else(|| format!("unknown compute-queue instruction '{}'", fields[2]))?;
        let operands = &fields[3..];
        expect_operands(op.name(), operands, op.operand_count())?;
        if op.has_residual() {
            if let Some(last) = operands.last() {
                parse_u32(last, "residual")?;
            }
        }
        Ok(XInstr {
            bundle,
            info: fields[1].clone(),
            op,
            operands: operands.to_vec(),
            comment,
        })
    }

    /// The residual operand, for ops whose encoding carries one.
    pub fn residual(&self) -> Option<u32> {
        if !self.op.has_residual() {
            return None;
        }
        self.operands.last().and_then(|r| r.parse().ok())
    }
}

fn parse_bundle_tag(field: &str) -> Result<u32, String> {
    field
        .strip_prefix('F')
        .filter(|digits| !digits.is_empty())
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| format!("invalid bundle tag '{field}', expected F<index>"))
}

impl fmt::Display for XInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}, {}, {}", self.bundle, self.info, self.op)?;
        for operand in &self.operands {
            write!(f, ", {operand}")?;
        }
        Ok(())
    }
}
