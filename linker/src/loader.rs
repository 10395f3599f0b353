// loader.rs — Kernel loading from assembler output
//
// An assembled kernel is three files sharing a prefix:
// `<prefix>.minst`, `<prefix>.cinst`, `<prefix>.xinst`. Each line is
// tokenized by `lexer` and decoded into the closed instruction enums of
// `isa`. Line numbers in diagnostics are 1-based file lines.
//
// Preconditions: none.
// Postconditions: a `KernelDescriptor` holds fully decoded queues.
// Failure modes: unreadable file → `LinkError::Io`; malformed line →
//   `LinkError::Parse`.
// Side effects: reads three files per kernel.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{LinkError, Result};
use crate::isa::{Address, CInstr, MInstr, XInstr};
use crate::lexer::{tokenize_line, TokenizedLine};

/// One independently assembled kernel, ready to be linked.
#[derive(Debug, Clone, Default)]
pub struct KernelDescriptor {
    /// Label used in logs (usually the file prefix).
    pub name: String,
    pub minstrs: Vec<MInstr>,
    pub cinstrs: Vec<CInstr>,
    pub xinstrs: Vec<XInstr>,
    /// Per-kernel address pins, checked against the allocator when the
    /// kernel is linked. Only in-memory callers set this, through
    /// `with_fixed`; `load_kernel` and `from_text` leave it empty, and the
    /// program's memory map (see `MemoryModel::declared_address`) covers
    /// fixed addresses for kernels read from disk.
    pub fixed: Option<HashMap<String, Address>>,
}

impl KernelDescriptor {
    /// Decode a kernel from the text of its three queue files.
    pub fn from_text(name: &str, minst: &str, cinst: &str, xinst: &str) -> Result<Self> {
        Ok(KernelDescriptor {
            name: name.to_string(),
            minstrs: parse_minst(minst, &format!("{name}.minst"))?,
            cinstrs: parse_cinst(cinst, &format!("{name}.cinst"))?,
            xinstrs: parse_xinst(xinst, &format!("{name}.xinst"))?,
            fixed: None,
        })
    }

    /// Pin variables of this kernel to addresses.
    pub fn with_fixed(mut self, fixed: HashMap<String, Address>) -> Self {
        self.fixed = Some(fixed);
        self
    }
}

// ── Queue parsers ────────────────────────────────────────────────────────

fn parse_lines<T>(
    text: &str,
    source_name: &str,
    decode: impl Fn(TokenizedLine) -> std::result::Result<T, String>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let parse_err = |message: String| LinkError::Parse {
            source_name: source_name.to_string(),
            line: idx + 1,
            message,
        };
        let Some(line) = tokenize_line(raw).map_err(|e| parse_err(e.to_string()))? else {
            continue;
        };
        out.push(decode(line).map_err(parse_err)?);
    }
    Ok(out)
}

pub fn parse_minst(text: &str, source_name: &str) -> Result<Vec<MInstr>> {
    parse_lines(text, source_name, |l| MInstr::from_fields(&l.fields, l.comment))
}

pub fn parse_cinst(text: &str, source_name: &str) -> Result<Vec<CInstr>> {
    parse_lines(text, source_name, |l| CInstr::from_fields(&l.fields, l.comment))
}

pub fn parse_xinst(text: &str, source_name: &str) -> Result<Vec<XInstr>> {
    parse_lines(text, source_name, |l| XInstr::from_fields(&l.fields, l.comment))
}

// ── Files ────────────────────────────────────────────────────────────────

/// The three queue files of one kernel (or of the linked program).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelFiles {
    pub prefix: PathBuf,
    pub minst: PathBuf,
    pub cinst: PathBuf,
    pub xinst: PathBuf,
}

impl KernelFiles {
    /// Paths for `<dir>/<prefix>.{minst,cinst,xinst}`.
    pub fn new(dir: &Path, prefix: &str) -> Self {
        let prefix = dir.join(prefix);
        let with_ext = |ext: &str| {
            let mut os: OsString = prefix.clone().into_os_string();
            os.push(".");
            os.push(ext);
            PathBuf::from(os)
        };
        KernelFiles {
            minst: with_ext("minst"),
            cinst: with_ext("cinst"),
            xinst: with_ext("xinst"),
            prefix,
        }
    }

    pub fn paths(&self) -> [&Path; 3] {
        [&self.minst, &self.cinst, &self.xinst]
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| LinkError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Load and decode one kernel from disk.
pub fn load_kernel(files: &KernelFiles) -> Result<KernelDescriptor> {
    let name = files.prefix.display().to_string();
    let kernel = KernelDescriptor {
        minstrs: parse_minst(&read(&files.minst)?, &files.minst.display().to_string())?,
        cinstrs: parse_cinst(&read(&files.cinst)?, &files.cinst.display().to_string())?,
        xinstrs: parse_xinst(&read(&files.xinst)?, &files.xinst.display().to_string())?,
        name,
        fixed: None,
    };
    debug!(
        kernel = %kernel.name,
        minstrs = kernel.minstrs.len(),
        cinstrs = kernel.cinstrs.len(),
        xinstrs = kernel.xinstrs.len(),
        "loaded kernel"
    );
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{COp, MOp, MemRef, XOp};

    #[test]
    fn decodes_all_three_queues() {
        let k = KernelDescriptor::from_text(
            "k0",
            "0, mload, 0, ct_a # fetch input\n1, msyncc, 2\n",
            "0, csyncm, 0\n1, ifetch, 0\n2, cexit\n",
            "F0, 0, move, r0b0, r1b0\n",
        )
        .unwrap();
        assert_eq!(k.minstrs.len(), 2);
        assert_eq!(
            k.minstrs[0].op,
            MOp::Load {
                spad: 0,
                src: MemRef::Var("ct_a".into())
            }
        );
        assert_eq!(k.minstrs[0].comment.as_deref(), Some("fetch input"));
        assert_eq!(k.cinstrs[2].op, COp::Exit);
        assert_eq!(k.xinstrs[0].op, XOp::Move);
        assert!(k.fixed.is_none());
    }

    #[test]
    fn blank_lines_are_skipped_but_counted() {
        let err = parse_cinst("0, cnop, 1\n\n2, bogus\n", "k.cinst").unwrap_err();
        match err {
            LinkError::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn kernel_files_append_extensions() {
        let files = KernelFiles::new(Path::new("out"), "fhe.add");
        assert_eq!(files.minst, PathBuf::from("out/fhe.add.minst"));
        assert_eq!(files.xinst, PathBuf::from("out/fhe.add.xinst"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let files = KernelFiles::new(Path::new("/nonexistent-helink-dir"), "k");
        let err = load_kernel(&files).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn loaded_kernels_carry_no_pins_until_given() {
        let dir = std::env::temp_dir().join(format!("helink_loader_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let files = KernelFiles::new(&dir, "k");
        std::fs::write(&files.minst, "0, mload, 0, a\n1, msyncc, 2\n").unwrap();
        std::fs::write(&files.cinst, "0, csyncm, 0\n1, ifetch, 0\n2, cexit\n").unwrap();
        std::fs::write(&files.xinst, "F0, 0, move, r0b0, r1b0\n").unwrap();

        let k = load_kernel(&files).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
        assert!(k.fixed.is_none());
        let k = k.with_fixed(HashMap::from([("a".to_string(), 3)]));
        assert_eq!(k.fixed.as_ref().and_then(|f| f.get("a")), Some(&3));
    }
}
