//! Coordinator configuration.
//!
//! Every field has a default matching the reference deployment (target CPU
//! #4, 2^18 sample slots, 32 code pages, sampling period 0x1000 ops). Hosts
//! load overrides from TOML; see the `ibst` tool.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::msr::{Lfsr4, MAX_SAMPLE_PERIOD};

/// Size of one page of code or scratch memory.
pub const PAGE_SIZE: usize = 4096;

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Logical CPU that runs uploaded code and takes samples.
    pub target_cpu: u32,
    /// Number of sample slots. Must be a power of two.
    pub sample_capacity: usize,
    /// Number of pages in the code buffer.
    pub code_pages: usize,
    /// Sampling period in ops. Non-zero multiple of 16.
    pub sample_period: u32,
    /// Arm and disarm the sampling register around each trigger.
    ///
    /// `false` models environments without the sampling facility: code
    /// still runs but no samples are taken and no support check is made.
    pub sampling: bool,
    /// Initial state of the restart-randomization LFSR (4 bits, non-zero).
    pub lfsr_seed: u8,
    /// Bounded wait for the target unit, in milliseconds. `None` blocks
    /// until the remote task signals.
    pub dispatch_timeout_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_cpu: 4,
            sample_capacity: 1 << 18,
            code_pages: 32,
            sample_period: 0x1000,
            sampling: true,
            lfsr_seed: 0b1011,
            dispatch_timeout_ms: None,
        }
    }
}

impl Config {
    /// Checks every field against its documented range.
    pub fn validate(&self) -> Result<()> {
        if self.sample_capacity == 0 || !self.sample_capacity.is_power_of_two() {
            return Err(Error::InvalidConfig("sample_capacity must be a non-zero power of two"));
        }
        if self.code_pages == 0 {
            return Err(Error::InvalidConfig("code_pages must be non-zero"));
        }
        if self.sample_period == 0
            || self.sample_period % 16 != 0
            || self.sample_period > MAX_SAMPLE_PERIOD
        {
            return Err(Error::InvalidConfig(
                "sample_period must be a non-zero multiple of 16 within the MaxCnt field",
            ));
        }
        if Lfsr4::new(self.lfsr_seed).is_none() {
            return Err(Error::InvalidConfig("lfsr_seed must be a non-zero 4-bit value"));
        }
        Ok(())
    }

    /// Code buffer capacity in bytes.
    pub fn code_capacity(&self) -> usize {
        self.code_pages * PAGE_SIZE
    }

    /// The rendezvous bound as a [`Duration`].
    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.code_capacity(), 32 * 4096);
        assert_eq!(config.dispatch_timeout(), None);
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let config = Config { sample_capacity: 1000, ..Config::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_unaligned_period() {
        let config = Config { sample_period: 0x1001, ..Config::default() };
        assert!(config.validate().is_err());
        let config = Config { sample_period: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_seed() {
        assert!(Config { lfsr_seed: 0, ..Config::default() }.validate().is_err());
        assert!(Config { lfsr_seed: 0x1f, ..Config::default() }.validate().is_err());
    }

    #[test]
    fn rejects_zero_code_pages() {
        assert!(Config { code_pages: 0, ..Config::default() }.validate().is_err());
    }
}
