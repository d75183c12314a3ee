//! Fixed-layout sample records.
//!
//! Format (all little-endian, 64 bytes per record):
//!
//! ```text
//!   ctl:u64  rip:u64  data:u64  data2:u64
//!   data3:u64  linad:u64  phyad:u64  tgt_rip:u64
//! ```
//!
//! `tgt_rip` is only latched in precise mode and reads as zero otherwise.

use serde::{Deserialize, Serialize};

use crate::msr::{IbsOpCtl, IbsOpData, IbsOpData3};

/// Number of 64-bit words in a record.
pub const SAMPLE_WORDS: usize = 8;

/// Size of one packed record in bytes.
pub const SAMPLE_SIZE: usize = SAMPLE_WORDS * 8;

/// One hardware-observed op sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(C)]
pub struct Sample {
    /// `IBS_OP_CTL` at the time of the sample.
    pub ctl: u64,
    /// Sampled instruction pointer (`IBS_OP_RIP`).
    pub rip: u64,
    /// `IBS_OP_DATA`.
    pub data: u64,
    /// `IBS_OP_DATA2`.
    pub data2: u64,
    /// `IBS_OP_DATA3`.
    pub data3: u64,
    /// Linear address of a tagged memory access (`IBS_DC_LINADDR`).
    pub linad: u64,
    /// Physical address of a tagged memory access (`IBS_DC_PHYSADDR`).
    pub phyad: u64,
    /// Branch target address (`BP_IBSTGT_RIP`), precise mode only.
    pub tgt_rip: u64,
}

const _: () = assert!(core::mem::size_of::<Sample>() == SAMPLE_SIZE);

impl Sample {
    /// Typed view of [`ctl`](Self::ctl).
    pub fn op_ctl(&self) -> IbsOpCtl {
        IbsOpCtl(self.ctl)
    }

    /// Typed view of [`data`](Self::data).
    pub fn op_data(&self) -> IbsOpData {
        IbsOpData(self.data)
    }

    /// Typed view of [`data3`](Self::data3).
    pub fn op_data3(&self) -> IbsOpData3 {
        IbsOpData3(self.data3)
    }

    /// Returns the record as words in wire order.
    pub fn to_words(&self) -> [u64; SAMPLE_WORDS] {
        [
            self.ctl, self.rip, self.data, self.data2, self.data3, self.linad, self.phyad,
            self.tgt_rip,
        ]
    }

    /// Builds a record from words in wire order.
    pub fn from_words(w: [u64; SAMPLE_WORDS]) -> Self {
        Self {
            ctl: w[0],
            rip: w[1],
            data: w[2],
            data2: w[3],
            data3: w[4],
            linad: w[5],
            phyad: w[6],
            tgt_rip: w[7],
        }
    }

    /// Packs the record into its wire encoding.
    pub fn to_bytes(&self) -> [u8; SAMPLE_SIZE] {
        let mut out = [0u8; SAMPLE_SIZE];
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Decodes one record from exactly [`SAMPLE_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8; SAMPLE_SIZE]) -> Self {
        let mut words = [0u64; SAMPLE_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *word = u64::from_le_bytes(buf);
        }
        Self::from_words(words)
    }

    /// Decodes every complete record in `bytes`.
    ///
    /// Trailing bytes that do not form a complete record are ignored.
    pub fn parse_all(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(SAMPLE_SIZE)
            .map(|chunk| {
                let mut buf = [0u8; SAMPLE_SIZE];
                buf.copy_from_slice(chunk);
                Self::from_bytes(&buf)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_order_matches_field_order() {
        let sample = Sample { ctl: 1, rip: 2, tgt_rip: 8, ..Sample::default() };
        let bytes = sample.to_bytes();
        assert_eq!(&bytes[0..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &2u64.to_le_bytes());
        assert_eq!(&bytes[56..64], &8u64.to_le_bytes());
    }

    #[test]
    fn parse_all_skips_trailing_partial_record() {
        let a = Sample { rip: 0x4000, ..Sample::default() };
        let b = Sample { rip: 0x4010, data3: 1, ..Sample::default() };
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&a.to_bytes());
        bytes.extend_from_slice(&b.to_bytes());
        bytes.extend_from_slice(&[0xff; 10]);
        assert_eq!(Sample::parse_all(&bytes), vec![a, b]);
    }
}
