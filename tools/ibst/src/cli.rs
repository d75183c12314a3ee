//! Command-line interface definitions for ibst.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

/// Upload machine code, run it on the target CPU, and collect IBS samples.
#[derive(Parser, Debug)]
#[command(name = "ibst", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Raise log verbosity (repeat for more). `RUST_LOG` takes precedence.
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a program, trigger it once, and drain the samples.
    Run(RunArgs),
    /// Decode a raw sample dump written by `run --output`.
    Parse(ParseArgs),
    /// Measure an `rdmsr` loop per MSR and compare the accesses each makes.
    Msr(MsrArgs),
    /// Measure a `cpuid` loop per leaf and compare the accesses each makes.
    Cpuid(CpuidArgs),
    /// Dump the IBS register bank of one CPU through the msr driver.
    Regs(RegsArgs),
    /// Report whether this processor has IBS.
    Features,
}

/// Where uploaded code runs.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Simulated IBS unit; the program is treated as an op stream.
    Sim,
    /// Native execution on a pinned thread, without sampling.
    Native,
}

/// Coordinator and backend options shared by every measuring subcommand.
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Execution backend.
    #[arg(long, short = 'b', value_enum, default_value_t = Backend::Sim)]
    pub backend: Backend,

    /// TOML file with `[coordinator]` and `[sim]` tables.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Target CPU (overrides the config file).
    #[arg(long)]
    pub cpu: Option<u32>,

    /// Sampling period in ops, a multiple of 16.
    #[arg(long, value_parser = parse_u32)]
    pub period: Option<u32>,

    /// Sample buffer capacity in records, a power of two.
    #[arg(long, value_parser = parse_usize)]
    pub capacity: Option<usize>,

    /// Run the program without arming the sampling register.
    #[arg(long)]
    pub no_sampling: bool,

    /// Bounded wait for the target CPU, in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Passes over the op stream (sim backend only).
    #[arg(long, value_parser = parse_u64)]
    pub iterations: Option<u64>,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Raw machine code to upload.
    pub file: PathBuf,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Precise mode with this target offset into the code buffer.
    #[arg(long, value_parser = parse_u64)]
    pub offset: Option<u64>,

    /// Opaque argument passed to the program in precise mode.
    #[arg(long, value_parser = parse_u64, default_value = "0", requires = "offset")]
    pub arg: u64,

    /// Write the drained records to this file instead of summarizing them.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Print the outcome, diagnostics, and records as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Loop count every generated payload uses unless told otherwise.
pub const DEFAULT_LOOPS: u32 = 0x1_0000;

/// Arguments for the `msr` subcommand.
#[derive(Parser, Debug)]
pub struct MsrArgs {
    /// MSRs to read, in hex, e.g. `--msr c0000080,000000e7`.
    #[arg(long, value_delimiter = ',', value_parser = parse_hex_u32)]
    pub msr: Vec<u32>,

    /// File with one hex MSR number per line.
    #[arg(long)]
    pub list_file: Option<PathBuf>,

    /// `rdmsr` executions per MSR.
    #[arg(long, value_parser = parse_loops, default_value_t = DEFAULT_LOOPS)]
    pub loops: u32,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Print the trials and the comparison as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `cpuid` subcommand.
#[derive(Parser, Debug)]
pub struct CpuidArgs {
    /// Leaves to query, in hex, e.g. `--leaf 0,1,8000001b`.
    #[arg(long = "leaf", value_delimiter = ',', value_parser = parse_hex_u32)]
    pub leaves: Vec<u32>,

    /// File with one hex leaf number per line.
    #[arg(long)]
    pub list_file: Option<PathBuf>,

    /// `cpuid` executions per leaf.
    #[arg(long, value_parser = parse_loops, default_value_t = DEFAULT_LOOPS)]
    pub loops: u32,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Print the trials and the comparison as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `parse` subcommand.
#[derive(Parser, Debug)]
pub struct ParseArgs {
    /// Raw dump of packed 64-byte records.
    pub dump: PathBuf,

    /// Code buffer base address; instruction pointers print as offsets.
    #[arg(long, value_parser = parse_u64)]
    pub base: Option<u64>,

    /// Print records as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `regs` subcommand.
#[derive(Parser, Debug)]
pub struct RegsArgs {
    /// CPU whose registers to read.
    #[arg(long, default_value_t = 4)]
    pub cpu: u32,
}

/// Parses a decimal, `0x` hex, or `0b` binary integer. Underscores are
/// ignored.
pub fn parse_u64(s: &str) -> Result<u64, String> {
    let digits: String = s.chars().filter(|&c| c != '_').collect();
    let (radix, body) = if let Some(hex) = digits.strip_prefix("0x").or(digits.strip_prefix("0X"))
    {
        (16, hex)
    } else if let Some(bin) = digits.strip_prefix("0b") {
        (2, bin)
    } else {
        (10, digits.as_str())
    };
    u64::from_str_radix(body, radix).map_err(|e| format!("invalid number `{s}`: {e}"))
}

/// Parses a hex number with or without a `0x` prefix. Underscores are
/// ignored.
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let digits: String = s.trim().chars().filter(|&c| c != '_').collect();
    let body = digits.strip_prefix("0x").or(digits.strip_prefix("0X")).unwrap_or(&digits);
    u32::from_str_radix(body, 16).map_err(|e| format!("invalid hex number `{s}`: {e}"))
}

fn parse_loops(s: &str) -> Result<u32, String> {
    match parse_u32(s)? {
        0 => Err("the loop count must be at least 1".to_owned()),
        n => Ok(n),
    }
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let value = parse_u64(s)?;
    u32::try_from(value).map_err(|_| format!("`{s}` does not fit in 32 bits"))
}

fn parse_usize(s: &str) -> Result<usize, String> {
    let value = parse_u64(s)?;
    usize::try_from(value).map_err(|_| format!("`{s}` is too large"))
}
