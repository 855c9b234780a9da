//! kernscope: list processes, regions and ELF mappings in a physical memory
//! capture, and extract images and regions from it.
//!
//! Rows are printed to stdout as JSON lines; logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kernscope::config::Config;
use kernscope::diagnostics::Diagnostics;
use kernscope::kernel::KernelSpace;
use kernscope::memory::open_capture;
use kernscope::memory::translators::ArchProfile;
use kernscope::plugins::dump::{dump_processes, DumpArtifact, RegionDump};
use kernscope::plugins::elfs::mapped_elfs;
use kernscope::plugins::pslist::{pslist, walk_processes, ProcessFilter};
use kernscope::plugins::regions::{vadinfo, RegionOptions, RegionSink};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kernscope")]
#[command(about = "Walk kernel structures in a physical memory capture", long_about = None)]
struct Cli {
    /// Raw physical capture (path or file:// URL)
    #[arg(short = 'f', long, env = "KERNSCOPE_CAPTURE")]
    capture: String,

    /// ISF symbol table (.json or .json.xz)
    #[arg(short, long, env = "KERNSCOPE_SYMBOLS")]
    symbols: PathBuf,

    /// Physical address of the kernel's top-level page table
    #[arg(long, value_parser = parse_address)]
    dtb: u64,

    /// Load address added to every symbol
    #[arg(long, value_parser = parse_address, default_value = "0")]
    kernel_base: u64,

    /// Paging mode: intel32, intel_pae or intel64
    #[arg(long, default_value = "intel64")]
    arch: String,

    /// Structure layout preset
    #[arg(long, default_value = "windows")]
    os: String,

    /// JSON configuration file; overrides --os
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for dumped files
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List processes from the kernel process list
    Pslist {
        /// Only these pids (repeatable)
        #[arg(short, long)]
        pid: Vec<u64>,

        /// Only these process names (repeatable)
        #[arg(short, long)]
        name: Vec<String>,

        /// Report physical offsets of the process structures
        #[arg(long)]
        physical: bool,

        /// Reconstruct each process's main executable
        #[arg(long)]
        dump: bool,

        /// Print timeline events instead of rows
        #[arg(long)]
        timeline: bool,
    },

    /// List mapped regions per process
    Vadinfo {
        #[arg(short, long)]
        pid: Vec<u64>,

        /// Only the region starting at this address
        #[arg(short, long, value_parser = parse_address)]
        address: Option<u64>,

        /// Extract each listed region
        #[arg(long)]
        dump: bool,
    },

    /// List mapped regions that start with an ELF header
    Elfs {
        #[arg(short, long)]
        pid: Vec<u64>,
    },
}

/// Parse a hex (`0x` prefixed) or decimal address.
fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn print_rows<T: Serialize>(rows: &[T]) -> Result<()> {
    for row in rows {
        println!("{}", serde_json::to_string(row)?);
    }
    Ok(())
}

fn write_artifact(dir: &Path, artifact: &DumpArtifact) -> Result<PathBuf> {
    let path = dir.join(&artifact.name);
    let mut file =
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
    artifact
        .write_to(&mut file)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    if !artifact.is_complete() {
        tracing::warn!(file = %path.display(), omitted = ?artifact.omitted, "dump is incomplete");
    }
    Ok(path)
}

fn write_region(dir: &Path, region: RegionDump<'_>) -> std::io::Result<()> {
    let path = dir.join(region.name());
    let mut file = File::create(&path)?;
    let written = region.write_to(&mut file)?;
    tracing::debug!(file = %path.display(), bytes = written, "region dumped");
    Ok(())
}

fn load_kernel(cli: &Cli) -> Result<KernelSpace> {
    let config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => match Config::preset(&cli.os) {
            Some(config) => config,
            None => bail!("Unknown OS preset '{}' (expected windows or linux)", cli.os),
        },
    };
    let Some(profile) = ArchProfile::by_name(&cli.arch) else {
        bail!("Unknown paging mode '{}'", cli.arch);
    };

    let physical = open_capture(&cli.capture)
        .with_context(|| format!("Failed to open capture {}", cli.capture))?;
    let catalog = isf::parse_isf_file(&cli.symbols)
        .with_context(|| format!("Failed to load symbols {}", cli.symbols.display()))?;

    let kernel = KernelSpace::new(
        physical,
        Arc::new(catalog),
        cli.dtb,
        cli.kernel_base,
        profile,
        config,
    )
    .context("Failed to build the kernel address space")?;
    Ok(kernel)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let kernel = load_kernel(&cli)?;
    let diagnostics = Diagnostics::new();
    tracing::info!(run = %diagnostics.run_id(), arch = %kernel.profile().name, "kernel space ready");

    match &cli.command {
        Commands::Pslist {
            pid,
            name,
            physical,
            dump,
            timeline,
        } => {
            let filter = ProcessFilter::all()
                .with_pids(pid.iter().copied())
                .with_names(name.iter().cloned());
            let rows = pslist(&kernel, filter.clone(), *physical, &diagnostics)?;
            if *timeline {
                let events: Vec<_> = rows.iter().flat_map(|r| r.timeline()).collect();
                print_rows(&events)?;
            } else {
                print_rows(&rows)?;
            }

            if *dump {
                let processes: Vec<_> = walk_processes(&kernel, filter, &diagnostics)?
                    .map_while(|process| process.ok())
                    .collect();
                for artifact in dump_processes(&kernel, &processes, &diagnostics)
                    .into_iter()
                    .flatten()
                {
                    let path = write_artifact(&cli.output_dir, &artifact)?;
                    tracing::info!(file = %path.display(), "process dumped");
                }
            }
        }

        Commands::Vadinfo { pid, address, dump } => {
            let options = RegionOptions {
                filter: ProcessFilter::all().with_pids(pid.iter().copied()),
                address: *address,
            };
            let mut write = |region: RegionDump<'_>| write_region(&cli.output_dir, region);
            let sink: Option<&mut RegionSink<'_>> = if *dump { Some(&mut write) } else { None };
            let rows = vadinfo(&kernel, &options, &diagnostics, sink)?;
            print_rows(&rows)?;
        }

        Commands::Elfs { pid } => {
            let filter = ProcessFilter::all().with_pids(pid.iter().copied());
            print_rows(&mapped_elfs(&kernel, filter, &diagnostics)?)?;
        }
    }

    if !diagnostics.is_empty() {
        tracing::info!(
            run = %diagnostics.run_id(),
            events = diagnostics.len(),
            "completed with diagnostics"
        );
    }
    Ok(())
}
