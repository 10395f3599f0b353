// config.rs — Hardware description and link options
//
// `HardwareSpec` is built once (from defaults, CLI flags, or a JSON file),
// validated, and then passed by value into the memory model and the linked
// program. Nothing in the linker mutates it afterwards.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Bytes in a kibibyte.
pub const KIB: u64 = 1024;

/// Size of one addressable memory word: one polynomial residue, 32 KiB.
pub const WORD_SIZE_BYTES: u64 = 32 * KIB;

/// Default HBM size in KiB (32 GiB).
pub const DEFAULT_HBM_SIZE_KB: u64 = 32 * 1024 * 1024;

/// Default scratchpad size in KiB (64 MiB).
pub const DEFAULT_SPAD_SIZE_KB: u64 = 64 * 1024;

/// Default idle cycles a `csyncm` costs the control queue.
pub const DEFAULT_SYNC_THROUGHPUT: u32 = 1;

/// Largest address space the linker allocates from, in words.
pub const MAX_CAPACITY_WORDS: u64 = 1 << 32;

/// Convert a size in KiB into whole memory words.
pub fn words_from_kb(kb: u64) -> usize {
    usize::try_from(kb.saturating_mul(KIB) / WORD_SIZE_BYTES).unwrap_or(usize::MAX)
}

/// Immutable description of the target accelerator's memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareSpec {
    /// Whether the target has off-chip HBM. When false, the scratchpad is
    /// the only address space and the memory queue is unused.
    #[serde(default = "default_has_hbm")]
    pub has_hbm: bool,
    #[serde(default = "default_hbm_words")]
    pub hbm_capacity_words: usize,
    #[serde(default = "default_spad_words")]
    pub spad_capacity_words: usize,
    /// Cycles a control-queue sync instruction occupies the queue.
    #[serde(default = "default_sync_throughput")]
    pub sync_throughput: u32,
}

fn default_has_hbm() -> bool {
    true
}

fn default_hbm_words() -> usize {
    words_from_kb(DEFAULT_HBM_SIZE_KB)
}

fn default_spad_words() -> usize {
    words_from_kb(DEFAULT_SPAD_SIZE_KB)
}

fn default_sync_throughput() -> u32 {
    DEFAULT_SYNC_THROUGHPUT
}

impl Default for HardwareSpec {
    fn default() -> Self {
        HardwareSpec {
            has_hbm: default_has_hbm(),
            hbm_capacity_words: default_hbm_words(),
            spad_capacity_words: default_spad_words(),
            sync_throughput: default_sync_throughput(),
        }
    }
}

impl HardwareSpec {
    /// A target with HBM of the given capacity (in words).
    pub fn with_hbm(hbm_capacity_words: usize) -> Self {
        HardwareSpec {
            has_hbm: true,
            hbm_capacity_words,
            ..Self::default()
        }
    }

    /// A target without HBM; the scratchpad (in words) is the sole space.
    pub fn without_hbm(spad_capacity_words: usize) -> Self {
        HardwareSpec {
            has_hbm: false,
            spad_capacity_words,
            ..Self::default()
        }
    }

    pub fn sync_throughput(mut self, cycles: u32) -> Self {
        self.sync_throughput = cycles;
        self
    }

    /// Number of words in the address space the linker allocates from.
    pub fn memory_capacity(&self) -> usize {
        if self.has_hbm {
            self.hbm_capacity_words
        } else {
            self.spad_capacity_words
        }
    }

    /// Reject specs the linker cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.memory_capacity() == 0 {
            return Err(LinkError::InvalidHardwareSpec {
                message: format!(
                    "{} capacity must be at least one word",
                    if self.has_hbm { "HBM" } else { "scratchpad" }
                ),
            });
        }
        // Addresses are u32 on the wire.
        if self.memory_capacity() as u64 > MAX_CAPACITY_WORDS {
            return Err(LinkError::InvalidHardwareSpec {
                message: format!(
                    "{} capacity of {} words exceeds the 2^32-word address space",
                    if self.has_hbm { "HBM" } else { "scratchpad" },
                    self.memory_capacity()
                ),
            });
        }
        if self.sync_throughput == 0 {
            return Err(LinkError::InvalidHardwareSpec {
                message: "sync throughput must be at least one cycle".to_string(),
            });
        }
        Ok(())
    }

    /// Parse and validate a JSON hardware description. Missing fields take
    /// their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let spec: HardwareSpec =
            serde_json::from_str(text).map_err(|e| LinkError::InvalidHardwareSpec {
                message: e.to_string(),
            })?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| LinkError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&text)
    }
}

/// Output-shaping options that do not affect linking semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOptions {
    /// Omit `# comment` suffixes on every emitted line.
    pub suppress_comments: bool,
}
