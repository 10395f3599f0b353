// program.rs — LinkedProgram: kernel-by-kernel stitching of the three queues
//
// Each kernel is assembled as if it were the whole program: its control and
// memory queues start at line 0, its compute queue at bundle 0, and every
// variable is still a name. `link_kernel` rewrites one kernel into the
// program's coordinates and appends it to the output streams; `close`
// writes the program terminator.
//
// Preconditions: every kernel's variables were registered with the memory
//   model (see `discover`), in the same order kernels are linked.
// Postconditions: after `close`, the streams hold one continuous program
//   whose line numbers, sync targets and bundles are consistent.
// Failure modes: any `LinkError` is fatal; the streams hold partial output
//   that the caller must discard.
// Side effects: writes to the three output streams.

use std::collections::HashMap;
use std::fmt::Display;
use std::io::Write;

use serde::Serialize;
use tracing::debug;

use crate::config::LinkOptions;
use crate::elide::{elide_syncs, ElisionStats};
use crate::error::{LinkError, Queue, Result};
use crate::id::{IdAllocator, KernelId};
use crate::isa::{Address, CInstr, COp, Instr, LineOp, MInstr, MOp, MemRef, XInstr};
use crate::loader::KernelDescriptor;
use crate::memory::MemoryModel;

/// The program's three output streams.
#[derive(Debug, Default)]
pub struct OutputStreams<W> {
    pub minst: W,
    pub cinst: W,
    pub xinst: W,
}

/// Lines written so far, per queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LineCounts {
    pub minst: u64,
    pub cinst: u64,
    pub xinst: u64,
}

/// Summary of one `link_kernel` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelReport {
    pub kernel: KernelId,
    /// Control-queue line of the kernel's first emitted instruction.
    pub first_cinst_line: u32,
    /// Memory-queue line of the kernel's first emitted instruction.
    pub first_minst_line: u32,
    pub emitted: LineCounts,
    /// Highest bundle the kernel's compute queue reached, after offsetting.
    pub last_bundle: u32,
    /// Present when sync elision ran (no HBM).
    pub elision: Option<ElisionStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closed,
}

/// A program under construction.
pub struct LinkedProgram<W: Write> {
    out: OutputStreams<W>,
    model: MemoryModel,
    options: LinkOptions,
    state: State,
    ids: IdAllocator,
    bundle_offset: u32,
    minst_line_offset: u32,
    cinst_line_offset: u32,
    lines: LineCounts,
}

impl<W: Write> LinkedProgram<W> {
    pub fn new(out: OutputStreams<W>, model: MemoryModel, options: LinkOptions) -> Self {
        LinkedProgram {
            out,
            model,
            options,
            state: State::Open,
            ids: IdAllocator::new(),
            bundle_offset: 0,
            minst_line_offset: 0,
            cinst_line_offset: 0,
            lines: LineCounts::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    pub fn bundle_offset(&self) -> u32 {
        self.bundle_offset
    }

    pub fn minst_line_offset(&self) -> u32 {
        self.minst_line_offset
    }

    pub fn cinst_line_offset(&self) -> u32 {
        self.cinst_line_offset
    }

    /// Number of kernels linked so far.
    pub fn kernel_count(&self) -> u32 {
        self.ids.kernels_allocated()
    }

    pub fn lines_emitted(&self) -> LineCounts {
        self.lines
    }

    pub fn memory_model(&self) -> &MemoryModel {
        &self.model
    }

    /// Give back the streams and the memory model.
    pub fn into_parts(self) -> (OutputStreams<W>, MemoryModel) {
        (self.out, self.model)
    }

    // ── Linking ──

    /// Rewrite `kernel` into program coordinates and append it.
    pub fn link_kernel(&mut self, kernel: KernelDescriptor) -> Result<KernelReport> {
        if self.state == State::Closed {
            return Err(LinkError::ProgramClosed);
        }
        let kernel_id = self.ids.peek_kernel();
        let has_hbm = self.model.spec().has_hbm;
        let KernelDescriptor {
            name,
            minstrs,
            cinstrs,
            mut xinstrs,
            fixed,
        } = kernel;
        let fixed = fixed.unwrap_or_default();

        check_terminator(&cinstrs, kernel_id, false)?;
        if has_hbm {
            check_terminator(&minstrs, kernel_id, true)?;
        }
        if let Some(c) = cinstrs
            .iter()
            .find(|c| matches!(c.op, COp::XInstFetch { .. }))
        {
            return Err(LinkError::UnsupportedInstruction {
                op: c.op.name(),
                kernel: kernel_id,
                line: c.line,
            });
        }

        // Memory queue: never emitted without HBM.
        let minstrs = if has_hbm {
            self.rewrite_minstrs(minstrs, &fixed, kernel_id)?
        } else {
            Vec::new()
        };

        let (cinstrs, elision) = if has_hbm {
            (self.rewrite_cinstrs_hbm(cinstrs, kernel_id)?, None)
        } else {
            let (cinstrs, stats) =
                elide_syncs(cinstrs, self.model.spec().sync_throughput, kernel_id)?;
            (self.rewrite_cinstrs_spad(cinstrs, &fixed, kernel_id)?, Some(stats))
        };

        let last_bundle = self.rewrite_xinstrs(&mut xinstrs, kernel_id)?;

        // Next offsets, checked before anything is written.
        let last_x = u32::try_from(xinstrs.len().saturating_sub(1)).unwrap_or(u32::MAX);
        let next_bundle = offset(
            last_bundle,
            1,
            kernel_id,
            Queue::Compute,
            last_x,
            "bundle index",
        )?;
        let next_minst = advance(self.minst_line_offset, &minstrs, kernel_id, Queue::Memory)?;
        let next_cinst = advance(self.cinst_line_offset, &cinstrs, kernel_id, Queue::Control)?;

        // Emission, dropping each line queue's kernel-local terminator.
        let first_cinst_line = self.cinst_line_offset;
        let first_minst_line = self.minst_line_offset;
        let mut emitted = LineCounts::default();
        for x in &xinstrs {
            write_line(&mut self.out.xinst, Queue::Compute, x, x.comment.as_deref(), self.options)?;
            emitted.xinst += 1;
        }
        let c_body = &cinstrs[..cinstrs.len().saturating_sub(1)];
        for (idx, c) in c_body.iter().enumerate() {
            let line = LineNumbered(self.cinst_line_offset + idx as u32, &c.op);
            write_line(&mut self.out.cinst, Queue::Control, line, c.comment.as_deref(), self.options)?;
            emitted.cinst += 1;
        }
        let m_body = &minstrs[..minstrs.len().saturating_sub(1)];
        for (idx, m) in m_body.iter().enumerate() {
            let line = LineNumbered(self.minst_line_offset + idx as u32, &m.op);
            write_line(&mut self.out.minst, Queue::Memory, line, m.comment.as_deref(), self.options)?;
            emitted.minst += 1;
        }

        self.bundle_offset = next_bundle;
        self.minst_line_offset = next_minst;
        self.cinst_line_offset = next_cinst;
        self.lines.minst += emitted.minst;
        self.lines.cinst += emitted.cinst;
        self.lines.xinst += emitted.xinst;
        self.ids.alloc_kernel();

        debug!(
            kernel = %kernel_id,
            name = %name,
            cinst_lines = emitted.cinst,
            minst_lines = emitted.minst,
            xinst_lines = emitted.xinst,
            next_bundle = self.bundle_offset,
            "linked kernel"
        );

        Ok(KernelReport {
            kernel: kernel_id,
            first_cinst_line,
            first_minst_line,
            emitted,
            last_bundle,
            elision,
        })
    }

    /// Write the program terminator and stop accepting kernels.
    pub fn close(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Err(LinkError::AlreadyClosed);
        }
        let exit_line = self.cinst_line_offset;
        let last_kernel = KernelId(self.kernel_count().saturating_sub(1));
        let target = offset(
            exit_line,
            1,
            last_kernel,
            Queue::Control,
            exit_line,
            "program exit line",
        )?;
        let exit = LineNumbered(exit_line, &COp::Exit);
        write_line(&mut self.out.cinst, Queue::Control, exit, None, self.options)?;
        let sync = MOp::Sync { target };
        let sync = LineNumbered(self.minst_line_offset, &sync);
        write_line(
            &mut self.out.minst,
            Queue::Memory,
            sync,
            Some("terminating MInstQ"),
            self.options,
        )?;
        for (stream, queue) in [
            (&mut self.out.minst, Queue::Memory),
            (&mut self.out.cinst, Queue::Control),
            (&mut self.out.xinst, Queue::Compute),
        ] {
            stream
                .flush()
                .map_err(|source| LinkError::Write { queue, source })?;
        }
        self.lines.cinst += 1;
        self.lines.minst += 1;
        self.state = State::Closed;
        debug!(
            kernels = self.kernel_count(),
            cinst_lines = self.lines.cinst,
            minst_lines = self.lines.minst,
            "program closed"
        );
        Ok(())
    }

    // ── Per-queue rewrites ──

    /// Resolve one variable occurrence and check it against any declared
    /// address.
    fn resolve(
        &mut self,
        name: &str,
        fixed: &HashMap<String, Address>,
        kernel: KernelId,
    ) -> Result<Address> {
        let allocated = self.model.consume(name, kernel)?;
        let declared = fixed
            .get(name)
            .copied()
            .or_else(|| self.model.declared_address(name));
        match declared {
            Some(declared) if declared != allocated => Err(LinkError::AddressMismatch {
                name: name.to_string(),
                declared,
                allocated,
                kernel,
            }),
            _ => Ok(allocated),
        }
    }

    fn rewrite_minstrs(
        &mut self,
        mut minstrs: Vec<MInstr>,
        fixed: &HashMap<String, Address>,
        kernel: KernelId,
    ) -> Result<Vec<MInstr>> {
        let by = self.cinst_line_offset;
        for m in &mut minstrs {
            let line = m.line;
            if let MOp::Sync { target } = &mut m.op {
                *target = offset(*target, by, kernel, Queue::Memory, line, "sync target")?;
                continue;
            }
            let Some(MemRef::Var(name)) = m.op.mem_ref().cloned() else {
                continue;
            };
            let address = self.resolve(&name, fixed, kernel)?;
            if let Some(slot) = m.op.mem_ref_mut() {
                *slot = MemRef::Addr(address);
            }
            m.annotate(format!("var: {name} - HBM({address})"));
        }
        Ok(minstrs)
    }

    fn rewrite_cinstrs_hbm(
        &self,
        mut cinstrs: Vec<CInstr>,
        kernel: KernelId,
    ) -> Result<Vec<CInstr>> {
        let (bundles, lines) = (self.bundle_offset, self.minst_line_offset);
        for c in &mut cinstrs {
            let line = c.line;
            match &mut c.op {
                COp::IFetch { bundle } => {
                    let what = "bundle index";
                    *bundle = offset(*bundle, bundles, kernel, Queue::Control, line, what)?;
                }
                COp::Sync { target } => {
                    let what = "sync target";
                    *target = offset(*target, lines, kernel, Queue::Control, line, what)?;
                }
                _ => {}
            }
        }
        Ok(cinstrs)
    }

    fn rewrite_cinstrs_spad(
        &mut self,
        mut cinstrs: Vec<CInstr>,
        fixed: &HashMap<String, Address>,
        kernel: KernelId,
    ) -> Result<Vec<CInstr>> {
        for c in &mut cinstrs {
            let line = c.line;
            if let COp::IFetch { bundle } = &mut c.op {
                let by = self.bundle_offset;
                *bundle = offset(*bundle, by, kernel, Queue::Control, line, "bundle index")?;
                continue;
            }
            let Some(MemRef::Var(name)) = c.op.spad_ref().cloned() else {
                continue;
            };
            let address = self.resolve(&name, fixed, kernel)?;
            if let Some(slot) = c.op.spad_ref_mut() {
                *slot = MemRef::Addr(address);
            }
            c.annotate(format!("var: {name} - SPAD({address})"));
        }
        Ok(cinstrs)
    }

    /// Offset bundles; returns the last bundle (the current offset if the
    /// queue is empty).
    fn rewrite_xinstrs(&self, xinstrs: &mut [XInstr], kernel: KernelId) -> Result<u32> {
        let mut last = self.bundle_offset;
        let by = self.bundle_offset;
        for (idx, x) in xinstrs.iter_mut().enumerate() {
            let line = u32::try_from(idx).unwrap_or(u32::MAX);
            x.bundle = offset(x.bundle, by, kernel, Queue::Compute, line, "bundle index")?;
            if x.bundle < last {
                return Err(LinkError::BundleRegression {
                    kernel,
                    bundle: x.bundle,
                    previous: last,
                    line: x.to_string(),
                });
            }
            last = x.bundle;
        }
        Ok(last)
    }
}

// ── Offset arithmetic ──

fn offset(
    value: u32,
    by: u32,
    kernel: KernelId,
    queue: Queue,
    line: u32,
    what: &'static str,
) -> Result<u32> {
    value.checked_add(by).ok_or(LinkError::Overflow {
        kernel,
        queue,
        line,
        what,
    })
}

/// Line offset after emitting `instrs` without their terminator.
fn advance<Op>(
    current: u32,
    instrs: &[Instr<Op>],
    kernel: KernelId,
    queue: Queue,
) -> Result<u32> {
    let emitted = instrs.len().saturating_sub(1);
    u32::try_from(emitted)
        .ok()
        .and_then(|n| current.checked_add(n))
        .ok_or(LinkError::Overflow {
            kernel,
            queue,
            line: current,
            what: "line number",
        })
}

// ── Emission helpers ──

/// `<line>, <op>` rendering for the line-numbered queues.
struct LineNumbered<'a, Op>(u32, &'a Op);

impl<Op: Display> Display for LineNumbered<'_, Op> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, {}", self.0, self.1)
    }
}

fn write_line<W: Write>(
    out: &mut W,
    queue: Queue,
    body: impl Display,
    comment: Option<&str>,
    options: LinkOptions,
) -> Result<()> {
    let result = match comment {
        Some(c) if !options.suppress_comments => writeln!(out, "{body} # {c}"),
        _ => writeln!(out, "{body}"),
    };
    result.map_err(|source| LinkError::Write { queue, source })
}

/// A line queue must end with its kernel-local terminator. An empty memory
/// queue is allowed; an empty control queue is not.
fn check_terminator<Op: LineOp>(
    instrs: &[Instr<Op>],
    kernel: KernelId,
    allow_empty: bool,
) -> Result<()> {
    match instrs.last() {
        None if allow_empty => Ok(()),
        Some(last) if last.op.is_terminator() => Ok(()),
        _ => Err(LinkError::MissingTerminator {
            kernel,
            queue: Op::QUEUE,
            expected: Op::terminator_name(),
        }),
    }
}
