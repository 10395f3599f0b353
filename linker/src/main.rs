use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use helink::config::{words_from_kb, HardwareSpec, LinkOptions, DEFAULT_HBM_SIZE_KB, DEFAULT_SPAD_SIZE_KB};
use helink::session::{link_files, LinkJob};
use helink::LinkError;

#[derive(Parser, Debug)]
#[command(
    name = "helink",
    version,
    about = "HE program linker — resolves kernel variables to memory addresses and stitches kernels into one program"
)]
struct Cli {
    /// Kernel file prefixes, in link order (each names .minst/.cinst/.xinst files)
    #[arg(required = true)]
    input_prefixes: Vec<String>,

    /// Memory map declaring program inputs, outputs and metadata
    #[arg(short = 'm', long)]
    input_mem_file: Option<PathBuf>,

    /// Directory holding the kernel files
    #[arg(long, default_value = ".")]
    input_dir: PathBuf,

    /// Prefix for the three output files
    #[arg(short = 'o', long)]
    output_prefix: String,

    /// Directory for the output files (created if missing)
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// HBM size in KiB
    #[arg(long, default_value_t = DEFAULT_HBM_SIZE_KB)]
    hbm_size: u64,

    /// Scratchpad size in KiB
    #[arg(long, default_value_t = DEFAULT_SPAD_SIZE_KB)]
    spad_size: u64,

    /// Target has no HBM: the scratchpad is the only memory
    #[arg(long)]
    no_hbm: bool,

    /// Idle cycles charged per elided control-queue sync
    #[arg(long)]
    sync_throughput: Option<u32>,

    /// JSON hardware description (overrides the size flags)
    #[arg(long)]
    hw_spec: Option<PathBuf>,

    /// Omit comments from the emitted queues
    #[arg(long, alias = "no-comments")]
    suppress_comments: bool,

    /// Print build provenance as JSON to stdout
    #[arg(long)]
    build_info: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "helink=warn",
        1 => "helink=debug",
        _ => "helink=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn hardware_spec(cli: &Cli) -> Result<HardwareSpec, LinkError> {
    let mut spec = match &cli.hw_spec {
        Some(path) => HardwareSpec::load_json(path)?,
        None => HardwareSpec {
            has_hbm: !cli.no_hbm,
            hbm_capacity_words: words_from_kb(cli.hbm_size),
            spad_capacity_words: words_from_kb(cli.spad_size),
            ..HardwareSpec::default()
        },
    };
    if let Some(cycles) = cli.sync_throughput {
        spec = spec.sync_throughput(cycles);
    }
    spec.validate()?;
    Ok(spec)
}

fn run(cli: &Cli) -> Result<(), LinkError> {
    let job = LinkJob {
        input_prefixes: cli.input_prefixes.clone(),
        input_dir: cli.input_dir.clone(),
        input_mem_file: cli.input_mem_file.clone(),
        output_prefix: cli.output_prefix.clone(),
        output_dir: cli.output_dir.clone(),
        spec: hardware_spec(cli)?,
        options: LinkOptions {
            suppress_comments: cli.suppress_comments,
        },
    };
    let summary = link_files(&job)?;
    if cli.build_info {
        println!("{}", summary.build_info.to_json()?);
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli) {
        eprintln!("helink: {}", e.render());
        std::process::exit(e.exit_code());
    }
}
