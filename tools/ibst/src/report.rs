//! Terminal and JSON output for runs and dumps.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use ibstrace_core::msr::{self, IbsOpCtl, Msr};
use ibstrace_core::sample::SAMPLE_SIZE;
use ibstrace_core::{Diagnostics, Sample, TriggerOutcome};
use serde::Serialize;

use crate::analysis::{AccessKind, MemoryAccess};
use crate::experiment::Experiment;

/// Everything `run --json` prints.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    /// Trigger result.
    pub outcome: &'a TriggerOutcome,
    /// Coordinator state after the trigger, before the drain.
    pub diagnostics: &'a Diagnostics,
    /// The drained records.
    pub samples: &'a [Sample],
}

/// Decodes a raw dump, rejecting a trailing partial record.
pub fn decode_dump(bytes: &[u8]) -> Result<Vec<Sample>> {
    let tail = bytes.len() % SAMPLE_SIZE;
    if tail != 0 {
        anyhow::bail!(
            "dump is {} bytes, which leaves a partial {tail}-byte record",
            bytes.len()
        );
    }
    Ok(Sample::parse_all(bytes))
}

/// Sample counts per instruction pointer, most frequent first.
pub fn rip_histogram(samples: &[Sample]) -> Vec<(u64, usize)> {
    let mut counts = BTreeMap::<u64, usize>::new();
    for sample in samples {
        *counts.entry(sample.rip).or_default() += 1;
    }
    let mut entries: Vec<_> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    entries
}

fn fmt_rip(rip: u64, base: Option<u64>) -> String {
    match base {
        Some(base) if rip >= base => format!("+{:#x}", rip - base),
        _ => format!("{rip:#018x}"),
    }
}

/// Print every record as one table row.
pub fn print_samples(samples: &[Sample], base: Option<u64>) {
    if samples.is_empty() {
        println!("  No samples.");
        return;
    }
    println!(
        "  {:>6}  {:>18}  {:>18}  {:>18}  {:>8}",
        "#", "rip", "data", "tgt_rip", "cur_cnt"
    );
    println!("  {:->6}  {:->18}  {:->18}  {:->18}  {:->8}", "", "", "", "", "");
    for (i, s) in samples.iter().enumerate() {
        println!(
            "  {:>6}  {:>18}  {:#018x}  {:#018x}  {:>8}",
            i,
            fmt_rip(s.rip, base),
            s.data,
            s.tgt_rip,
            IbsOpCtl(s.ctl).cur_cnt()
        );
    }
}

/// Print a flat per-address profile.
#[allow(clippy::cast_precision_loss)]
pub fn print_histogram(samples: &[Sample], base: Option<u64>) {
    let entries = rip_histogram(samples);
    if entries.is_empty() {
        println!("  No samples.");
        return;
    }
    let total = samples.len();
    println!("  {:>18}  {:>8}  {:>7}", "rip", "samples", "%");
    println!("  {:->18}  {:->8}  {:->7}", "", "", "");
    for (rip, count) in entries {
        let pct = count as f64 * 100.0 / total as f64;
        println!("  {:>18}  {count:>8}  {pct:>6.2}%", fmt_rip(rip, base));
    }
    println!();
    println!("  Total: {total} samples");
}

/// Print the coordinator's addresses and counters.
pub fn print_diagnostics(diag: &Diagnostics) {
    println!("  target cpu     #{}", diag.target_cpu);
    println!(
        "  code           {:#x} ({} / {} bytes)",
        diag.code_addr, diag.code_len, diag.code_capacity
    );
    println!(
        "  samples        {:#x} ({} / {} records)",
        diag.sample_addr, diag.sample_count, diag.sample_capacity
    );
    match diag.scratch_phys {
        Some(phys) => println!("  scratch        {:#x} (phys {phys:#x})", diag.scratch_addr),
        None => println!("  scratch        {:#x}", diag.scratch_addr),
    }
    let stats = &diag.collector;
    println!(
        "  collector      {} handled, {} spurious, {} degenerate, {} dropped",
        stats.handled, stats.spurious, stats.degenerate, stats.dropped
    );
}

/// Name of an MSR in the IBS bank, if it is one.
pub fn msr_name(addr: u32) -> Option<&'static str> {
    msr::IBS_MSRS.iter().find(|(reg, _)| *reg == Msr::new(addr)).map(|(_, name)| *name)
}

fn fmt_access(access: &MemoryAccess) -> String {
    let kind = match access.kind {
        AccessKind::Load => "LD",
        AccessKind::Store => "ST",
    };
    format!("{:016x} {:>3} {kind}", access.phys, access.width.bits())
}

/// Print per-key trial counts, then the shared and distinguishing accesses.
///
/// `what` names a key ("MSR", "leaf"); `name` labels a key when it can.
pub fn print_experiment(exp: &Experiment, what: &str, name: impl Fn(u32) -> Option<&'static str>) {
    println!("  {:>10}  {:>8}  {:>9}  {:>8}", what, "samples", "at target", "accesses");
    println!("  {:->10}  {:->8}  {:->9}  {:->8}", "", "", "", "");
    for (key, trial) in &exp.trials {
        println!(
            "  {key:>#10x}  {:>8}  {:>9}  {:>8}",
            trial.samples,
            trial.at_target,
            trial.accesses.len()
        );
    }

    println!();
    println!("Accesses common to every {what}:");
    if exp.comparison.common.is_empty() {
        println!("  None.");
    }
    for access in &exp.comparison.common {
        println!("  {}", fmt_access(access));
    }

    println!();
    println!("Accesses unique to a single {what}:");
    if exp.comparison.unique.is_empty() {
        println!("  None.");
    }
    for (key, accesses) in &exp.comparison.unique {
        let label = name(*key).unwrap_or("unknown");
        for access in accesses {
            println!("  {} => {key:08x} ({label})", fmt_access(access));
        }
    }
}

/// Serialize `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode JSON")?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rip: u64) -> Sample {
        Sample { rip, ..Sample::default() }
    }

    #[test]
    fn histogram_orders_by_count_then_address() {
        let samples = [at(0x20), at(0x10), at(0x20), at(0x30), at(0x10), at(0x20)];
        assert_eq!(rip_histogram(&samples), vec![(0x20, 3), (0x10, 2), (0x30, 1)]);
        assert!(rip_histogram(&[]).is_empty());
    }

    #[test]
    fn dump_must_hold_whole_records() {
        let mut bytes = at(0x1234).to_bytes().to_vec();
        bytes.extend_from_slice(&at(0x5678).to_bytes());
        let samples = decode_dump(&bytes).unwrap();
        assert_eq!(samples.iter().map(|s| s.rip).collect::<Vec<_>>(), [0x1234, 0x5678]);

        bytes.push(0);
        assert!(decode_dump(&bytes).is_err());
        assert!(decode_dump(&[]).unwrap().is_empty());
    }

    #[test]
    fn rips_print_relative_to_base() {
        assert_eq!(fmt_rip(0x1010, Some(0x1000)), "+0x10");
        assert_eq!(fmt_rip(0x10, Some(0x1000)), "0x0000000000000010");
        assert_eq!(fmt_rip(0x10, None), "0x0000000000000010");
    }

    #[test]
    fn ibs_registers_have_names() {
        assert_eq!(msr_name(0xc001_1033), Some("IBS_OP_CTL"));
        assert_eq!(msr_name(0xc001_103b), Some("BP_IBSTGT_RIP"));
        assert_eq!(msr_name(0xc000_0080), None);
    }

    #[test]
    fn accesses_print_address_width_and_kind() {
        use ibstrace_core::msr::MemWidth;

        let access =
            MemoryAccess { phys: 0xfee0_0300, width: MemWidth::Dword, kind: AccessKind::Store };
        assert_eq!(fmt_access(&access), "00000000fee00300  32 ST");
    }

    #[test]
    fn samples_encode_as_json_objects() {
        let json = serde_json::to_value([at(7)]).unwrap();
        assert_eq!(json[0]["rip"], 7);
        assert_eq!(json[0]["tgt_rip"], 0);
    }
}
