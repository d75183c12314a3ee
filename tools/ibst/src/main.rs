//! ibstrace uploader.
//!
//! Reads a raw machine-code file, uploads it to a coordinator, runs it once
//! on the target CPU, and drains the IBS samples it produced. Also runs the
//! generated `rdmsr`/`cpuid` experiments, decodes raw dumps, and inspects
//! the local processor's IBS support.

mod analysis;
mod cli;
mod experiment;
mod payload;
mod report;
mod settings;

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use ibstrace_core::msr::{self, IbsControl, IbsOpCtl};
use ibstrace_core::platform::Platform;
use ibstrace_core::{Coordinator, Sample, TriggerMode};
use ibstrace_host::DevMsr;

use cli::{Backend, Cli, Command, CpuidArgs, MsrArgs, ParseArgs, RegsArgs, RunArgs, TargetArgs};
use settings::Settings;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Run(ref args) => cmd_run(args),
        Command::Parse(ref args) => cmd_parse(args),
        Command::Msr(ref args) => cmd_msr(args),
        Command::Cpuid(ref args) => cmd_cpuid(args),
        Command::Regs(ref args) => cmd_regs(args),
        Command::Features => cmd_features(),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

// ===========================================================================
// run
// ===========================================================================

fn build_platform(backend: Backend, settings: &Settings) -> Result<Platform> {
    match backend {
        Backend::Sim => {
            let (platform, unit) =
                ibstrace_host::simulated_platform(&settings.coordinator, &settings.sim)
                    .context("failed to start the simulated unit")?;
            log::debug!("ibst: {unit:?}");
            Ok(platform)
        }
        Backend::Native => {
            if settings.coordinator.sampling {
                bail!("the native backend cannot sample from user space; pass --no-sampling");
            }
            ibstrace_host::native_platform(&settings.coordinator)
                .context("failed to start the native platform")
        }
    }
}

/// Loads settings, applies `args`, and starts a coordinator on the chosen
/// backend.
fn start(args: &TargetArgs) -> Result<Coordinator> {
    let mut settings = Settings::load(args.config.as_deref())?;
    settings.apply(args);
    let platform = build_platform(args.backend, &settings)?;
    Coordinator::new(settings.coordinator, platform).context("failed to start the coordinator")
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let program = std::fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let coord = start(&args.target)?;

    coord.upload(&program).context("upload failed")?;
    log::info!("ibst: uploaded {} bytes from {}", program.len(), args.file.display());

    let mode = match args.offset {
        Some(offset) => TriggerMode::Precise { arg: args.arg, offset },
        None => TriggerMode::Measure,
    };
    let outcome = coord.trigger(mode).context("trigger failed")?;
    let diagnostics = coord.diagnostics();
    let samples = coord.drain_samples().context("drain failed")?;

    if let Some(path) = &args.output {
        write_dump(path, &samples)?;
        log::info!("ibst: wrote {} records to {}", samples.len(), path.display());
    }

    if args.json {
        return report::print_json(&report::RunReport {
            outcome: &outcome,
            diagnostics: &diagnostics,
            samples: &samples,
        });
    }

    println!(
        "Returned {:#x}; collected {} samples ({:?}).",
        outcome.return_value,
        samples.len(),
        mode
    );
    report::print_diagnostics(&diagnostics);
    if args.output.is_none() {
        println!();
        report::print_histogram(&samples, Some(diagnostics.code_addr as u64));
    }
    Ok(())
}

fn write_dump(path: &Path, samples: &[Sample]) -> Result<()> {
    let bytes: Vec<u8> = samples.iter().flat_map(Sample::to_bytes).collect();
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

// ===========================================================================
// parse
// ===========================================================================

fn cmd_parse(args: &ParseArgs) -> Result<()> {
    let bytes = std::fs::read(&args.dump)
        .with_context(|| format!("failed to read {}", args.dump.display()))?;
    let samples = report::decode_dump(&bytes)
        .with_context(|| format!("malformed dump {}", args.dump.display()))?;

    if args.json {
        return report::print_json(&samples);
    }
    report::print_samples(&samples, args.base);
    println!();
    report::print_histogram(&samples, args.base);
    Ok(())
}

// ===========================================================================
// msr / cpuid experiments
// ===========================================================================

fn cmd_msr(args: &MsrArgs) -> Result<()> {
    if args.target.backend == Backend::Native {
        bail!("rdmsr faults outside ring 0; run the msr experiment on the sim backend");
    }
    let msrs = experiment::collect_keys(&args.msr, args.list_file.as_deref(), "MSR")?;
    let coord = start(&args.target)?;
    let exp = experiment::run(&coord, &msrs, |msr| payload::rdmsr_loop(msr, args.loops))?;

    if args.json {
        return report::print_json(&exp);
    }
    report::print_experiment(&exp, "MSR", report::msr_name);
    Ok(())
}

fn cmd_cpuid(args: &CpuidArgs) -> Result<()> {
    let leaves = experiment::collect_keys(&args.leaves, args.list_file.as_deref(), "leaf")?;
    let coord = start(&args.target)?;
    let exp = experiment::run(&coord, &leaves, |leaf| payload::cpuid_loop(leaf, args.loops))?;
    if args.target.backend == Backend::Native {
        for (leaf, trial) in &exp.trials {
            if trial.return_value != payload::PAYLOAD_RETURN {
                log::warn!("ibst: leaf {leaf:#x} returned {:#x}", trial.return_value);
            }
        }
    }

    if args.json {
        return report::print_json(&exp);
    }
    report::print_experiment(&exp, "leaf", |_| None);
    Ok(())
}

// ===========================================================================
// regs / features
// ===========================================================================

fn cmd_regs(args: &RegsArgs) -> Result<()> {
    let dev = DevMsr::open(args.cpu)
        .with_context(|| format!("failed to open {}", DevMsr::path(args.cpu).display()))?;

    println!("IBS registers on cpu #{}:", dev.cpu());
    for (reg, name, value) in dev.read_ibs_bank() {
        match value {
            Ok(value) => println!("  {:#010x}  {name:<16} {value:#018x}", reg.addr()),
            Err(e) => println!("  {:#010x}  {name:<16} <{e}>", reg.addr()),
        }
    }

    if let Ok(ctl) = dev.read(msr::IBS_OP_CTL) {
        let ctl = IbsOpCtl(ctl);
        println!();
        println!(
            "  op ctl: period {:#x} ops, enabled {}, valid {}, cur_cnt {:#x}",
            ctl.period(),
            ctl.is_enabled(),
            ctl.is_valid(),
            ctl.cur_cnt()
        );
    }
    if let Ok(control) = dev.read(msr::IBS_CONTROL) {
        match IbsControl(control).lvt_offset() {
            Some(offset) => println!("  lvt offset: {offset}"),
            None => println!("  lvt offset: not assigned by firmware"),
        }
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn cmd_features() -> Result<()> {
    use ibstrace_core::arch::x86_64::CpuInfo;

    let info = CpuInfo::read();
    println!("vendor          {}", info.vendor_str());
    println!("max ext leaf    {:#x}", info.max_extended_leaf);
    println!("ibs             {}", if info.ibs_supported() { "yes" } else { "no" });
    if let Some(features) = info.ibs {
        println!("ibs features    {features:?}");
    }
    Ok(())
}

#[cfg(not(target_arch = "x86_64"))]
fn cmd_features() -> Result<()> {
    bail!("CPUID is only available on x86_64");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn dump_written_by_run_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.raw");
        let samples = [
            Sample { rip: 0x1000, data: 0x90, ..Sample::default() },
            Sample { rip: 0x1001, tgt_rip: 0x1008, ..Sample::default() },
        ];
        write_dump(&path, &samples).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 2 * ibstrace_core::sample::SAMPLE_SIZE);
        assert_eq!(report::decode_dump(&bytes).unwrap(), samples);
    }

    #[test]
    fn parse_rejects_truncated_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.raw");
        std::fs::write(&path, [0u8; 70]).unwrap();
        let args = ParseArgs { dump: path, base: None, json: true };
        let err = cmd_parse(&args).unwrap_err();
        assert!(format!("{err:#}").contains("partial"));
    }

    #[test]
    fn run_on_the_simulator_writes_a_dump() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("prog.bin");
        let output = dir.path().join("out.raw");
        let mut code = vec![0x90; 31];
        code.push(0xc3);
        std::fs::write(&program, &code).unwrap();

        let mut argv: Vec<OsString> = vec!["ibst".into(), "run".into(), program.into_os_string()];
        for arg in ["--cpu", "0", "--period", "0x100", "--capacity", "1024", "--iterations", "64"] {
            argv.push(arg.into());
        }
        argv.push("--output".into());
        argv.push(output.clone().into_os_string());

        let cli = Cli::try_parse_from(argv).unwrap();
        let Command::Run(args) = cli.command else { panic!("expected run") };
        cmd_run(&args).unwrap();

        let samples = report::decode_dump(&std::fs::read(&output).unwrap()).unwrap();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.data == 0x90 || s.data == 0xc3));
    }

    #[test]
    fn msr_experiment_runs_on_the_simulator() {
        let argv = [
            "ibst", "msr", "--msr", "c0000080,e7", "--loops", "8", "--cpu", "0", "--iterations",
            "16", "--json",
        ];
        let Command::Msr(args) = Cli::try_parse_from(argv).unwrap().command else {
            panic!("expected msr")
        };
        cmd_msr(&args).unwrap();
    }

    #[test]
    fn msr_experiment_refuses_native_execution() {
        let argv = ["ibst", "msr", "--msr", "10", "--backend", "native", "--no-sampling"];
        let Command::Msr(args) = Cli::try_parse_from(argv).unwrap().command else {
            panic!("expected msr")
        };
        let err = cmd_msr(&args).unwrap_err();
        assert!(err.to_string().contains("ring 0"));
    }

    #[test]
    fn cpuid_experiment_needs_a_leaf() {
        let Command::Cpuid(args) = Cli::try_parse_from(["ibst", "cpuid"]).unwrap().command else {
            panic!("expected cpuid")
        };
        let err = cmd_cpuid(&args).unwrap_err();
        assert!(err.to_string().contains("at least one leaf"));
    }

    #[test]
    fn native_backend_refuses_sampling() {
        let settings = Settings::default();
        let err = build_platform(Backend::Native, &settings).unwrap_err();
        assert!(err.to_string().contains("--no-sampling"));
    }
}
