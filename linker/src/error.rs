// error.rs — Linker error taxonomy and stable diagnostic codes
//
// Every failure in the linker is fatal for the whole link: nothing here is
// caught and retried. Each variant carries enough context (variable, kernel,
// expected vs. actual value) to diagnose a mis-assembled kernel without
// re-running the assembler.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::id::KernelId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `L0101`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // L00xx — input text and I/O
    pub const L0001: DiagCode = DiagCode("L0001"); // malformed line
    pub const L0002: DiagCode = DiagCode("L0002"); // file I/O
    pub const L0003: DiagCode = DiagCode("L0003"); // output stream write
    pub const L0004: DiagCode = DiagCode("L0004"); // build-info serialization

    // L01xx — configuration
    pub const L0101: DiagCode = DiagCode("L0101"); // declared/allocated address mismatch
    pub const L0102: DiagCode = DiagCode("L0102"); // declared variable never referenced
    pub const L0103: DiagCode = DiagCode("L0103"); // duplicate declaration
    pub const L0104: DiagCode = DiagCode("L0104"); // invalid hardware spec
    pub const L0105: DiagCode = DiagCode("L0105"); // unsupported instruction
    pub const L0106: DiagCode = DiagCode("L0106"); // output would overwrite input
    pub const L0107: DiagCode = DiagCode("L0107"); // invalid variable name

    // L02xx — allocation
    pub const L0201: DiagCode = DiagCode("L0201"); // no eligible slot

    // L03xx — integrity
    pub const L0301: DiagCode = DiagCode("L0301"); // address out of range
    pub const L0302: DiagCode = DiagCode("L0302"); // variable already bound elsewhere
    pub const L0303: DiagCode = DiagCode("L0303"); // slot held by live variable
    pub const L0304: DiagCode = DiagCode("L0304"); // bundle index regression
    pub const L0305: DiagCode = DiagCode("L0305"); // missing kernel terminator
    pub const L0306: DiagCode = DiagCode("L0306"); // link after close
    pub const L0307: DiagCode = DiagCode("L0307"); // double close
    pub const L0308: DiagCode = DiagCode("L0308"); // line, bundle or cycle count overflow

    // L04xx — programmer preconditions
    pub const L0401: DiagCode = DiagCode("L0401"); // use count exhausted
    pub const L0402: DiagCode = DiagCode("L0402"); // unregistered variable
}

// ── Error kind ───────────────────────────────────────────────────────────

/// Broad failure category. All kinds are unrecoverable at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Inputs disagree with each other (memory map vs. kernels, bad spec).
    Configuration,
    /// No eligible slot left in the address space.
    AllocationExhausted,
    /// A structural invariant of the program or allocator was broken.
    Integrity,
    /// The registry and the instruction streams are out of sync.
    Precondition,
    /// Input text does not follow the line grammar.
    Parse,
    /// Reading inputs or writing outputs failed.
    Io,
}

// ── Instruction queue names (error context) ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Memory,
    Control,
    Compute,
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Queue::Memory => write!(f, "memory"),
            Queue::Control => write!(f, "control"),
            Queue::Compute => write!(f, "compute"),
        }
    }
}

// ── LinkError ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LinkError {
    // Configuration
    #[error(
        "declared address ({declared}) of variable '{name}' differs from allocated address ({allocated}) in kernel {kernel}"
    )]
    AddressMismatch {
        name: String,
        declared: u32,
        allocated: u32,
        kernel: KernelId,
    },
    #[error("declared variable '{name}' is not referenced by any kernel")]
    MissingFixedVariable { name: String },
    #[error("variable '{name}' declared at address {first}, redeclared at address {second}")]
    DuplicateDeclaration { name: String, first: u32, second: u32 },
    #[error("invalid hardware spec: {message}")]
    InvalidHardwareSpec { message: String },
    #[error("kernel {kernel}: `{op}` at control line {line} is not supported by the linker")]
    UnsupportedInstruction {
        op: &'static str,
        kernel: KernelId,
        line: u32,
    },
    #[error("output file '{}' would overwrite an input file", path.display())]
    OutputCollision { path: PathBuf },
    #[error("invalid variable name '{name}'")]
    InvalidVariableName { name: String },

    // Allocation
    #[error(
        "out of memory: no eligible slot among {capacity} words for variable '{name}' (kernel {kernel})"
    )]
    AllocationExhausted {
        name: String,
        capacity: usize,
        kernel: KernelId,
    },

    // Integrity
    #[error("address {address} for variable '{name}' is out of range [0, {capacity})")]
    AddressOutOfRange {
        name: String,
        address: u32,
        capacity: usize,
    },
    #[error("variable '{name}' already bound to address {bound}, cannot bind to {requested}")]
    AlreadyBound {
        name: String,
        bound: u32,
        requested: u32,
    },
    #[error("address {address} already occupied by variable '{occupant}' when binding '{name}'")]
    SlotOccupied {
        address: u32,
        occupant: String,
        name: String,
    },
    #[error(
        "kernel {kernel}: instruction bundle {bundle} is less than previous bundle {previous}: \"{line}\""
    )]
    BundleRegression {
        kernel: KernelId,
        bundle: u32,
        previous: u32,
        line: String,
    },
    #[error("kernel {kernel}: {queue} queue does not end with `{expected}`")]
    MissingTerminator {
        kernel: KernelId,
        queue: Queue,
        expected: &'static str,
    },
    #[error("program is closed and does not accept new kernels")]
    ProgramClosed,
    #[error("program is already closed")]
    AlreadyClosed,
    #[error("kernel {kernel}: {what} overflows at {queue} line {line}")]
    Overflow {
        kernel: KernelId,
        queue: Queue,
        line: u32,
        what: &'static str,
    },

    // Preconditions
    #[error("variable '{name}' consumed in kernel {kernel} with no remaining uses")]
    UsesExhausted { name: String, kernel: KernelId },
    #[error("variable '{name}' consumed in kernel {kernel} but never registered")]
    UnregisteredVariable { name: String, kernel: KernelId },

    // Ambient
    #[error("{source_name}:{line}: {message}")]
    Parse {
        source_name: String,
        line: usize,
        message: String,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {queue} queue: {source}")]
    Write {
        queue: Queue,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize build info: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::AddressMismatch { .. }
            | LinkError::MissingFixedVariable { .. }
            | LinkError::DuplicateDeclaration { .. }
            | LinkError::InvalidHardwareSpec { .. }
            | LinkError::UnsupportedInstruction { .. }
            | LinkError::OutputCollision { .. }
            | LinkError::InvalidVariableName { .. } => ErrorKind::Configuration,
            LinkError::AllocationExhausted { .. } => ErrorKind::AllocationExhausted,
            LinkError::AddressOutOfRange { .. }
            | LinkError::AlreadyBound { .. }
            | LinkError::SlotOccupied { .. }
            | LinkError::BundleRegression { .. }
            | LinkError::MissingTerminator { .. }
            | LinkError::ProgramClosed
            | LinkError::AlreadyClosed
            | LinkError::Overflow { .. } => ErrorKind::Integrity,
            LinkError::UsesExhausted { .. } | LinkError::UnregisteredVariable { .. } => {
                ErrorKind::Precondition
            }
            LinkError::Parse { .. } => ErrorKind::Parse,
            LinkError::Io { .. } | LinkError::Write { .. } | LinkError::Serialize(_) => {
                ErrorKind::Io
            }
        }
    }

    pub fn code(&self) -> DiagCode {
        match self {
            LinkError::Parse { .. } => codes::L0001,
            LinkError::Io { .. } => codes::L0002,
            LinkError::Write { .. } => codes::L0003,
            LinkError::Serialize(_) => codes::L0004,
            LinkError::AddressMismatch { .. } => codes::L0101,
            LinkError::MissingFixedVariable { .. } => codes::L0102,
            LinkError::DuplicateDeclaration { .. } => codes::L0103,
            LinkError::InvalidHardwareSpec { .. } => codes::L0104,
            LinkError::UnsupportedInstruction { .. } => codes::L0105,
            LinkError::OutputCollision { .. } => codes::L0106,
            LinkError::InvalidVariableName { .. } => codes::L0107,
            LinkError::AllocationExhausted { .. } => codes::L0201,
            LinkError::AddressOutOfRange { .. } => codes::L0301,
            LinkError::AlreadyBound { .. } => codes::L0302,
            LinkError::SlotOccupied { .. } => codes::L0303,
            LinkError::BundleRegression { .. } => codes::L0304,
            LinkError::MissingTerminator { .. } => codes::L0305,
            LinkError::ProgramClosed => codes::L0306,
            LinkError::AlreadyClosed => codes::L0307,
            LinkError::Overflow { .. } => codes::L0308,
            LinkError::UsesExhausted { .. } => codes::L0401,
            LinkError::UnregisteredVariable { .. } => codes::L0402,
        }
    }

    /// Process exit code used by the CLI host: 2 for I/O, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Io => 2,
            _ => 1,
        }
    }

    /// Render as `error[CODE]: message`.
    pub fn render(&self) -> String {
        format!("error[{}]: {}", self.code(), self)
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
