// session.rs — End-to-end link orchestration and provenance
//
// Runs the link as a fixed sequence of steps:
//   load memory map → load kernels → discover variables → link → close
// logging each step's elapsed time, and records a `BuildInfo` describing
// exactly which inputs produced the outputs.
//
// Preconditions: `LinkJob::spec` is valid (checked again by `MemoryModel`).
// Postconditions: on success the three output files hold the linked program.
// Failure modes: any `LinkError`; output files may then hold partial
//   content and must be discarded.
// Side effects: reads inputs, creates `output_dir`, writes three files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::{HardwareSpec, LinkOptions};
use crate::discover::discover_variables;
use crate::error::{LinkError, Result};
use crate::loader::{load_kernel, KernelDescriptor, KernelFiles};
use crate::mem_map::MemoryMap;
use crate::memory::MemoryModel;
use crate::program::{KernelReport, LineCounts, LinkedProgram, OutputStreams};

// ── Job description ──────────────────────────────────────────────────────

/// Everything needed to link a set of kernel files.
#[derive(Debug, Clone)]
pub struct LinkJob {
    /// Kernel file prefixes, in link order. Each names three files
    /// `<input_dir>/<prefix>.{minst,cinst,xinst}`.
    pub input_prefixes: Vec<String>,
    pub input_dir: PathBuf,
    /// Memory map declaring whole-program variables.
    pub input_mem_file: Option<PathBuf>,
    pub output_prefix: String,
    pub output_dir: PathBuf,
    pub spec: HardwareSpec,
    pub options: LinkOptions,
}

// ── Steps ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    LoadMemoryMap,
    LoadKernels,
    Discover,
    Link,
    Close,
}

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Step::LoadMemoryMap => "load-memory-map",
            Step::LoadKernels => "load-kernels",
            Step::Discover => "discover",
            Step::Link => "link",
            Step::Close => "close",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StepTiming {
    pub step: Step,
    pub elapsed: Duration,
}

fn finish_step(timings: &mut Vec<StepTiming>, step: Step, start: Instant) {
    let elapsed = start.elapsed();
    info!(
        step = step.name(),
        elapsed_ms = format_args!("{:.1}", elapsed.as_secs_f64() * 1000.0),
        "step complete"
    );
    timings.push(StepTiming { step, elapsed });
}

/// Result of linking a kernel list into a set of streams.
#[derive(Debug)]
pub struct Linked<W> {
    pub streams: OutputStreams<W>,
    pub reports: Vec<KernelReport>,
    pub variables: usize,
    pub lines: LineCounts,
    pub timings: Vec<StepTiming>,
}

/// Discover, link and close `kernels` into `streams`.
pub fn link<W: Write>(
    streams: OutputStreams<W>,
    spec: HardwareSpec,
    options: LinkOptions,
    mem_map: MemoryMap,
    kernels: Vec<KernelDescriptor>,
) -> Result<Linked<W>> {
    let mut timings = Vec::new();

    let start = Instant::now();
    let mut model = MemoryModel::new(spec, mem_map)?;
    discover_variables(&mut model, &kernels)?;
    finish_step(&mut timings, Step::Discover, start);

    let start = Instant::now();
    let mut program = LinkedProgram::new(streams, model, options);
    let mut reports = Vec::with_capacity(kernels.len());
    for kernel in kernels {
        reports.push(program.link_kernel(kernel)?);
    }
    finish_step(&mut timings, Step::Link, start);

    let start = Instant::now();
    program.close()?;
    finish_step(&mut timings, Step::Close, start);

    let lines = program.lines_emitted();
    let (streams, model) = program.into_parts();
    Ok(Linked {
        streams,
        reports,
        variables: model.len(),
        lines,
        timings,
    })
}

// ── Provenance ───────────────────────────────────────────────────────────

/// SHA-256 digest of one input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputDigest {
    pub path: String,
    pub sha256: String,
}

/// Provenance of a linked program.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub linker_version: &'static str,
    pub hardware: HardwareSpec,
    pub inputs: Vec<InputDigest>,
    pub kernels: usize,
    pub variables: usize,
    pub lines: LineCounts,
}

impl BuildInfo {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn digest_file(path: &Path) -> Result<InputDigest> {
    let bytes = std::fs::read(path).map_err(|e| LinkError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(InputDigest {
        path: path.display().to_string(),
        sha256: bytes_to_hex(&Sha256::digest(&bytes)),
    })
}

// ── File-level driver ────────────────────────────────────────────────────

/// Outcome of `link_files`.
#[derive(Debug)]
pub struct LinkSummary {
    pub outputs: KernelFiles,
    pub reports: Vec<KernelReport>,
    pub timings: Vec<StepTiming>,
    pub build_info: BuildInfo,
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Output paths must not coincide with any input path.
fn check_output_collisions(outputs: &KernelFiles, inputs: &[PathBuf]) -> Result<()> {
    for out in outputs.paths() {
        if inputs.iter().any(|input| same_file(out, input)) {
            return Err(LinkError::OutputCollision {
                path: out.to_path_buf(),
            });
        }
    }
    Ok(())
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| LinkError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Link the kernels named by `job` and write the program to disk.
pub fn link_files(job: &LinkJob) -> Result<LinkSummary> {
    let outputs = KernelFiles::new(&job.output_dir, &job.output_prefix);
    let kernel_files: Vec<KernelFiles> = job
        .input_prefixes
        .iter()
        .map(|prefix| KernelFiles::new(&job.input_dir, prefix))
        .collect();

    let mut input_paths: Vec<PathBuf> = job.input_mem_file.iter().cloned().collect();
    for files in &kernel_files {
        input_paths.extend(files.paths().iter().map(|p| p.to_path_buf()));
    }
    check_output_collisions(&outputs, &input_paths)?;

    let mut timings = Vec::new();

    let start = Instant::now();
    let mem_map = match &job.input_mem_file {
        Some(path) => MemoryMap::load(path)?,
        None => MemoryMap::new(),
    };
    finish_step(&mut timings, Step::LoadMemoryMap, start);

    let start = Instant::now();
    let kernels = kernel_files
        .iter()
        .map(load_kernel)
        .collect::<Result<Vec<_>>>()?;
    let inputs = input_paths
        .iter()
        .map(|p| digest_file(p))
        .collect::<Result<Vec<_>>>()?;
    finish_step(&mut timings, Step::LoadKernels, start);
    info!(
        kernels = kernels.len(),
        declared = mem_map.len(),
        "inputs loaded"
    );

    std::fs::create_dir_all(&job.output_dir).map_err(|e| LinkError::Io {
        path: job.output_dir.clone(),
        source: e,
    })?;
    let streams = OutputStreams {
        minst: create(&outputs.minst)?,
        cinst: create(&outputs.cinst)?,
        xinst: create(&outputs.xinst)?,
    };

    let kernel_count = kernels.len();
    let linked = link(streams, job.spec, job.options, mem_map, kernels)?;
    timings.extend(linked.timings);

    let build_info = BuildInfo {
        linker_version: env!("CARGO_PKG_VERSION"),
        hardware: job.spec,
        inputs,
        kernels: kernel_count,
        variables: linked.variables,
        lines: linked.lines,
    };
    info!(
        cinst_lines = linked.lines.cinst,
        minst_lines = linked.lines.minst,
        xinst_lines = linked.lines.xinst,
        output = %outputs.prefix.display(),
        "program written"
    );

    Ok(LinkSummary {
        outputs,
        reports: linked.reports,
        timings,
        build_info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(bytes_to_hex(&[0x00, 0xab, 0x7f]), "00ab7f");
    }

    #[test]
    fn outputs_may_not_overwrite_inputs() {
        let outputs = KernelFiles::new(Path::new("dir"), "k");
        let inputs = vec![PathBuf::from("dir/k.cinst")];
        let err = check_output_collisions(&outputs, &inputs).unwrap_err();
        assert_eq!(err.code(), codes::L0106);
    }

    #[test]
    fn distinct_paths_do_not_collide() {
        let outputs = KernelFiles::new(Path::new("out"), "prog");
        let inputs = vec![PathBuf::from("in/k.cinst"), PathBuf::from("in/k.mem")];
        check_output_collisions(&outputs, &inputs).unwrap();
    }

    #[test]
    fn in_memory_link_reports_every_step() {
        let k = KernelDescriptor::from_text(
            "k",
            "0, mstore, ct, 0\n1, msyncc, 1\n",
            "0, ifetch, 0\n1, cexit\n",
            "F0, 0, xstore, r0b0\n",
        )
        .unwrap();
        let streams = OutputStreams::<Vec<u8>>::default();
        let linked = link(
            streams,
            HardwareSpec::with_hbm(4),
            LinkOptions::default(),
            MemoryMap::new(),
            vec![k],
        )
        .unwrap();
        let steps: Vec<Step> = linked.timings.iter().map(|t| t.step).collect();
        assert_eq!(steps, vec![Step::Discover, Step::Link, Step::Close]);
        assert_eq!(linked.variables, 1);
        assert_eq!(linked.lines.xinst, 1);
        assert_eq!(linked.lines.cinst, 2);
    }

    #[test]
    fn build_info_serializes_as_json() {
        let info = BuildInfo {
            linker_version: "0.0.0",
            hardware: HardwareSpec::without_hbm(2),
            inputs: vec![InputDigest {
                path: "k.cinst".into(),
                sha256: "00".into(),
            }],
            kernels: 1,
            variables: 3,
            lines: LineCounts::default(),
        };
        let json: serde_json::Value = serde_json::from_str(&info.to_json().unwrap()).unwrap();
        assert_eq!(json["hardware"]["has_hbm"], false);
        assert_eq!(json["inputs"][0]["path"], "k.cinst");
        assert_eq!(json["variables"], 3);
    }
}
