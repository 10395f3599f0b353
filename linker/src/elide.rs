// elide.rs — Control-queue sync elision for targets without HBM
//
// Without HBM the memory queue is never emitted, so every `csyncm` in the
// control queue waits on nothing. The syncs are removed, and the cycles
// they used to occupy are paid as idle time so that the queue's elapsed
// cycle count is unchanged.
//
// Two passes, each building a new sequence:
//   1. drop syncs, charging their cycles to the next `cnop`, or to a new
//      `cnop` inserted before the next fetch (`ifetch`, `nload`, `bload`);
//   2. merge runs of adjacent `cnop`s and renumber lines from 0.
//
// A `cnop, n` idles for n + 1 cycles, hence the -1 on inserted idles and the
// +1 per merge.
//
// Preconditions: input lines are kernel-local (bundles not yet offset).
// Postconditions: no `csyncm` remains; no two `cnop`s are adjacent;
//   `elapsed_idle_cycles(out) == elapsed_idle_cycles(in) + charged cycles`.
// Failure modes: `LinkError::Overflow` when a charged idle or a bundle index
//   exceeds u32.
// Side effects: none.

use crate::error::{LinkError, Queue, Result};
use crate::id::KernelId;
use crate::isa::{CInstr, COp};

/// What the pass did to one kernel's control queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElisionStats {
    pub syncs_removed: usize,
    /// Syncs whose cycles were paid as idle time. Syncs before the first
    /// bundle fetch cost nothing, and syncs after the last idle or fetch
    /// have nothing to be charged to.
    pub syncs_charged: usize,
    pub idles_inserted: usize,
    pub idles_merged: usize,
}

impl ElisionStats {
    /// Idle cycles added to the queue.
    pub fn charged_cycles(&self, sync_throughput: u32) -> u64 {
        self.syncs_charged as u64 * u64::from(sync_throughput)
    }
}

/// Total cycles the queue spends idling: every `cnop, n` counts n + 1.
pub fn elapsed_idle_cycles(cinstrs: &[CInstr]) -> u64 {
    cinstrs
        .iter()
        .map(|c| match c.op {
            COp::Nop { cycles } => u64::from(cycles) + 1,
            _ => 0,
        })
        .sum()
}

/// Remove every `csyncm` from `kernel`'s control queue, preserving its
/// elapsed cycle count.
///
/// Fails with `LinkError::Overflow` when an idle count or a bundle index
/// no longer fits in 32 bits.
pub fn elide_syncs(
    cinstrs: Vec<CInstr>,
    sync_throughput: u32,
    kernel: KernelId,
) -> Result<(Vec<CInstr>, ElisionStats)> {
    let mut stats = ElisionStats::default();
    let charged = charge_syncs(cinstrs, sync_throughput, kernel, &mut stats)?;
    let mut merged = merge_idles(charged, kernel, &mut stats)?;
    for (line, instr) in merged.iter_mut().enumerate() {
        instr.line = line as u32;
    }
    Ok((merged, stats))
}

fn overflow(kernel: KernelId, line: u32, what: &'static str) -> LinkError {
    LinkError::Overflow {
        kernel,
        queue: Queue::Control,
        line,
        what,
    }
}

// ── Pass 1 ──

fn charge_syncs(
    cinstrs: Vec<CInstr>,
    throughput: u32,
    kernel: KernelId,
    stats: &mut ElisionStats,
) -> Result<Vec<CInstr>> {
    let mut out = Vec::with_capacity(cinstrs.len());
    let mut pending: u32 = 0;
    let mut current_bundle: u32 = 0;

    for mut instr in cinstrs {
        let line = instr.line;
        match &mut instr.op {
            COp::Sync { .. } => {
                stats.syncs_removed += 1;
                if current_bundle > 0 {
                    pending += 1;
                }
                continue;
            }
            COp::Nop { cycles } => {
                let own = *cycles;
                *cycles = pending
                    .checked_mul(throughput)
                    .and_then(|charge| own.checked_add(charge))
                    .ok_or_else(|| overflow(kernel, line, "idle cycle count"))?;
                stats.syncs_charged += pending as usize;
                pending = 0;
            }
            op if op.starts_fetch() => {
                if pending > 0 {
                    let cycles = pending
                        .checked_mul(throughput)
                        .and_then(|charge| charge.checked_sub(1))
                        .ok_or_else(|| overflow(kernel, line, "idle cycle count"))?;
                    out.push(CInstr::new(line, COp::Nop { cycles }));
                    stats.idles_inserted += 1;
                    stats.syncs_charged += pending as usize;
                    pending = 0;
                }
                if let COp::IFetch { bundle } = op {
                    current_bundle = bundle
                        .checked_add(1)
                        .ok_or_else(|| overflow(kernel, line, "bundle index"))?;
                }
            }
            _ => {}
        }
        out.push(instr);
    }
    Ok(out)
}

// ── Pass 2 ──

fn merge_idles(
    cinstrs: Vec<CInstr>,
    kernel: KernelId,
    stats: &mut ElisionStats,
) -> Result<Vec<CInstr>> {
    let mut out: Vec<CInstr> = Vec::with_capacity(cinstrs.len());
    for mut instr in cinstrs {
        let line = instr.line;
        if let COp::Nop { cycles } = &mut instr.op {
            if let Some(&COp::Nop { cycles: prev }) = out.last().map(|p| &p.op) {
                // the later idle survives, carrying its own comment
                let own = *cycles;
                *cycles = prev
                    .checked_add(1)
                    .and_then(|carried| own.checked_add(carried))
                    .ok_or_else(|| overflow(kernel, line, "merged idle cycle count"))?;
                out.pop();
                stats.idles_merged += 1;
            }
        }
        out.push(instr);
    }
    Ok(out)
}
