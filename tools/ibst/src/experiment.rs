//! Keyed experiments: one generated payload per key (an MSR number, a CPUID
//! leaf), each measured on its own, then compared by the accesses tagged at
//! the instruction under study.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use ibstrace_core::{Coordinator, TriggerMode};
use serde::Serialize;

use crate::analysis::{self, Comparison, MemoryAccess};
use crate::cli::parse_hex_u32;
use crate::payload::Payload;

/// One measured payload.
#[derive(Debug, Serialize)]
pub struct Trial {
    /// Address of the instruction under study.
    pub target_rip: u64,
    /// Value the payload returned.
    pub return_value: u64,
    /// Records drained after the run.
    pub samples: usize,
    /// Records tagged at `target_rip`.
    pub at_target: usize,
    /// Distinct accesses tagged at `target_rip`.
    pub accesses: BTreeSet<MemoryAccess>,
}

/// Every trial of one experiment and how their accesses overlap.
#[derive(Debug, Serialize)]
pub struct Experiment {
    /// Trials by key.
    pub trials: BTreeMap<u32, Trial>,
    /// Shared and distinguishing accesses.
    pub comparison: Comparison<u32>,
}

/// Uploads `payload`, runs it once in measure mode, and drains the records.
pub fn measure(coord: &Coordinator, payload: &Payload) -> Result<Trial> {
    coord.upload(&payload.code).context("upload failed")?;
    let outcome = coord.trigger(TriggerMode::Measure).context("trigger failed")?;
    let samples = coord.drain_samples().context("drain failed")?;

    let target_rip = payload.target_rip(coord.diagnostics().code_addr as u64);
    Ok(Trial {
        target_rip,
        return_value: outcome.return_value,
        samples: samples.len(),
        at_target: analysis::at_rip(&samples, target_rip).count(),
        accesses: analysis::unique_accesses(&samples, target_rip),
    })
}

/// Measures `generate(key)` for every key, in ascending order.
pub fn run(
    coord: &Coordinator,
    keys: &BTreeSet<u32>,
    generate: impl Fn(u32) -> Payload,
) -> Result<Experiment> {
    let mut trials = BTreeMap::new();
    for &key in keys {
        let trial = measure(coord, &generate(key)).with_context(|| format!("key {key:#010x}"))?;
        log::info!(
            "ibst: {key:#010x}: {} samples, {} at target, {} distinct accesses",
            trial.samples,
            trial.at_target,
            trial.accesses.len()
        );
        trials.insert(key, trial);
    }

    let per_key: BTreeMap<u32, BTreeSet<MemoryAccess>> =
        trials.iter().map(|(key, trial)| (*key, trial.accesses.clone())).collect();
    let comparison = analysis::compare(&per_key);
    Ok(Experiment { trials, comparison })
}

/// Parses one hex number per line. Blank lines and `#` comments are
/// skipped.
pub fn parse_key_list(text: &str) -> Result<Vec<u32>> {
    let mut keys = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let key = parse_hex_u32(line).map_err(anyhow::Error::msg).with_context(|| {
            format!("line {}", i + 1)
        })?;
        keys.push(key);
    }
    Ok(keys)
}

/// Merges keys given on the command line with those in `list_file`.
pub fn collect_keys(given: &[u32], list_file: Option<&Path>, what: &str) -> Result<BTreeSet<u32>> {
    let mut keys: BTreeSet<u32> = given.iter().copied().collect();
    if let Some(path) = list_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let listed = parse_key_list(&text).with_context(|| format!("in {}", path.display()))?;
        log::info!("ibst: {} {what} values from {}", listed.len(), path.display());
        keys.extend(listed);
    }
    if keys.is_empty() {
        bail!("nothing to measure; give at least one {what}");
    }
    Ok(keys)
}
