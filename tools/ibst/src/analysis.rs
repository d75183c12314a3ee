//! Memory accesses tagged at one instruction, and how they differ across
//! experiments.

use std::collections::{BTreeMap, BTreeSet};

use ibstrace_core::Sample;
use ibstrace_core::msr::MemWidth;
use serde::Serialize;

/// Direction of a sampled access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    /// Load op.
    Load,
    /// Store op.
    Store,
}

/// One distinct access: where, how wide, which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MemoryAccess {
    /// Physical address from `IBS_DC_PHYS_AD`.
    pub phys: u64,
    /// Access width.
    pub width: MemWidth,
    /// Load or store.
    pub kind: AccessKind,
}

impl MemoryAccess {
    /// The access tagged in `sample`.
    ///
    /// Ops that are neither a plain load nor a plain store, and reserved
    /// width encodings, yield `None`.
    pub fn from_sample(sample: &Sample) -> Option<Self> {
        let data3 = sample.op_data3();
        let kind = match (data3.is_load(), data3.is_store()) {
            (true, false) => AccessKind::Load,
            (false, true) => AccessKind::Store,
            _ => return None,
        };
        let width = data3.mem_width()?;
        Some(Self { phys: sample.phyad, width, kind })
    }
}

/// Samples whose latched instruction pointer is `rip` and is valid.
pub fn at_rip(samples: &[Sample], rip: u64) -> impl Iterator<Item = &Sample> {
    samples.iter().filter(move |s| s.rip == rip && !s.op_data().rip_invalid())
}

/// The distinct accesses tagged at `rip`.
pub fn unique_accesses(samples: &[Sample], rip: u64) -> BTreeSet<MemoryAccess> {
    at_rip(samples, rip).filter_map(MemoryAccess::from_sample).collect()
}

/// How the access sets of several experiments overlap.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct Comparison<K: Ord> {
    /// Accesses seen in every experiment.
    pub common: BTreeSet<MemoryAccess>,
    /// Accesses seen in exactly one experiment, keyed by it. Keys with no
    /// such access are absent.
    pub unique: BTreeMap<K, BTreeSet<MemoryAccess>>,
}

/// Splits the per-experiment access sets into shared and distinguishing
/// accesses.
pub fn compare<K: Ord + Clone>(per_key: &BTreeMap<K, BTreeSet<MemoryAccess>>) -> Comparison<K> {
    let mut seen_by = BTreeMap::<MemoryAccess, Vec<&K>>::new();
    for (key, accesses) in per_key {
        for access in accesses {
            seen_by.entry(*access).or_default().push(key);
        }
    }

    let mut common = BTreeSet::new();
    let mut unique = BTreeMap::<K, BTreeSet<MemoryAccess>>::new();
    for (access, keys) in seen_by {
        if keys.len() == per_key.len() {
            common.insert(access);
        }
        if let [only] = keys.as_slice() {
            unique.entry((*only).clone()).or_default().insert(access);
        }
    }
    Comparison { common, unique }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibstrace_core::msr::OpData3Flags;

    const RIP: u64 = 0x7000_0010;

    fn access(rip: u64, phys: u64, data3: u64) -> Sample {
        Sample { rip, phyad: phys, data3, ..Sample::default() }
    }

    fn load(phys: u64) -> Sample {
        access(RIP, phys, (4 << 22) | OpData3Flags::LD_OP.bits())
    }

    fn store(phys: u64) -> Sample {
        access(RIP, phys, (3 << 22) | OpData3Flags::ST_OP.bits())
    }

    fn acc(phys: u64, width: MemWidth, kind: AccessKind) -> MemoryAccess {
        MemoryAccess { phys, width, kind }
    }

    #[test]
    fn only_plain_loads_and_stores_count() {
        let both = (OpData3Flags::LD_OP | OpData3Flags::ST_OP).bits();
        assert_eq!(MemoryAccess::from_sample(&access(RIP, 0x10, both)), None);
        assert_eq!(MemoryAccess::from_sample(&access(RIP, 0x10, 0)), None);
        assert_eq!(
            MemoryAccess::from_sample(&access(RIP, 0x10, (0xf << 22) | 1)),
            None,
            "reserved width"
        );
        assert_eq!(
            MemoryAccess::from_sample(&store(0x20)),
            Some(acc(0x20, MemWidth::Dword, AccessKind::Store))
        );
    }

    #[test]
    fn accesses_are_filtered_by_rip_and_deduplicated() {
        let mut invalid = load(0x30);
        invalid.data = 1 << 38;
        let samples = [
            load(0x10),
            load(0x10),
            store(0x20),
            access(RIP + 1, 0x40, OpData3Flags::LD_OP.bits()),
            invalid,
        ];

        let accesses = unique_accesses(&samples, RIP);
        assert_eq!(
            accesses.into_iter().collect::<Vec<_>>(),
            [
                acc(0x10, MemWidth::Qword, AccessKind::Load),
                acc(0x20, MemWidth::Dword, AccessKind::Store),
            ]
        );
        assert_eq!(at_rip(&samples, RIP).count(), 3);
    }

    #[test]
    fn comparison_separates_shared_from_distinguishing() {
        let shared = acc(0x1000, MemWidth::Qword, AccessKind::Load);
        let only_a = acc(0x2000, MemWidth::Qword, AccessKind::Load);
        let only_c = acc(0x3000, MemWidth::Byte, AccessKind::Store);
        let a_and_b = acc(0x4000, MemWidth::Word, AccessKind::Load);

        let per_key = BTreeMap::from([
            (0xa_u32, BTreeSet::from([shared, only_a, a_and_b])),
            (0xb, BTreeSet::from([shared, a_and_b])),
            (0xc, BTreeSet::from([shared, only_c])),
        ]);
        let cmp = compare(&per_key);
        assert_eq!(cmp.common, BTreeSet::from([shared]));
        assert_eq!(
            cmp.unique,
            BTreeMap::from([(0xa, BTreeSet::from([only_a])), (0xc, BTreeSet::from([only_c]))])
        );
    }

    #[test]
    fn comparing_nothing_is_empty() {
        let cmp = compare(&BTreeMap::<u32, BTreeSet<MemoryAccess>>::new());
        assert!(cmp.common.is_empty());
        assert!(cmp.unique.is_empty());
    }
}
