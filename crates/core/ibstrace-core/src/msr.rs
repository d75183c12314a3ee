//! IBS op-sampling register model.
//!
//! Pure bit manipulation for `IBS_OP_CTL` plus the three register sequences
//! the coordinator performs: arm, disarm, and rearm-after-sample.
//!
//! ```text
//! IBS_OP_CTL
//!   63       55       47       39
//!   .....ccc cccccccc cccccccc cccccccc
//!   31       23       15       07
//!   .....mmm mmmmtve. mmmmmmmm mmmmmmmm
//!
//!   c: IbsOpCurCnt   m: IbsOpMaxCnt   t: IbsOpCntCtl
//!   v: IbsOpVal      e: IbsOpEn       .: reserved
//! ```
//!
//! See "PPR for AMD Family 17h Model 71h B0".

use core::sync::atomic::{AtomicU8, Ordering};
use core::time::Duration;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::platform::SamplingRegisters;

/// A Model Specific Register, identified by its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msr(u32);

impl Msr {
    /// Creates a new MSR from its address.
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Returns the MSR address.
    pub const fn addr(self) -> u32 {
        self.0
    }
}

/// IBS Execution Control.
pub const IBS_OP_CTL: Msr = Msr(0xC001_1033);
/// IBS Op Linear Address (sampled RIP).
pub const IBS_OP_RIP: Msr = Msr(0xC001_1034);
/// IBS Op Data.
pub const IBS_OP_DATA: Msr = Msr(0xC001_1035);
/// IBS Op Data 2.
pub const IBS_OP_DATA2: Msr = Msr(0xC001_1036);
/// IBS Op Data 3.
pub const IBS_OP_DATA3: Msr = Msr(0xC001_1037);
/// IBS DC Linear Address.
pub const IBS_DC_LIN_AD: Msr = Msr(0xC001_1038);
/// IBS DC Physical Address.
pub const IBS_DC_PHYS_AD: Msr = Msr(0xC001_1039);
/// IBS Control (LVT offset).
pub const IBS_CONTROL: Msr = Msr(0xC001_103A);
/// IBS Branch Target Address.
pub const BP_IBSTGT_RIP: Msr = Msr(0xC001_103B);

/// The whole IBS op bank, in address order.
pub const IBS_MSRS: [(Msr, &str); 9] = [
    (IBS_OP_CTL, "IBS_OP_CTL"),
    (IBS_OP_RIP, "IBS_OP_RIP"),
    (IBS_OP_DATA, "IBS_OP_DATA"),
    (IBS_OP_DATA2, "IBS_OP_DATA2"),
    (IBS_OP_DATA3, "IBS_OP_DATA3"),
    (IBS_DC_LIN_AD, "IBS_DC_LIN_AD"),
    (IBS_DC_PHYS_AD, "IBS_DC_PHYS_AD"),
    (IBS_CONTROL, "IBS_CONTROL"),
    (BP_IBSTGT_RIP, "BP_IBSTGT_RIP"),
];

/// Largest sampling period the MaxCnt field can encode, in ops.
pub const MAX_SAMPLE_PERIOD: u32 = ((1 << 23) - 1) << 4;

/// Delay between clearing `IbsOpVal` and zeroing the register on disarm.
pub const DISARM_SETTLE: Duration = Duration::from_micros(1);

bitflags::bitflags! {
    /// Single-bit controls in `IBS_OP_CTL`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpCtlFlags: u64 {
        /// IbsOpEn: op sampling enabled.
        const ENABLE    = 1 << 17;
        /// IbsOpVal: a sample is latched in the data registers.
        const VALID     = 1 << 18;
        /// IbsOpCntCtl: count dispatched ops instead of cycles.
        const COUNT_OPS = 1 << 19;
    }
}

/// A value of the `IBS_OP_CTL` register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct IbsOpCtl(pub u64);

impl IbsOpCtl {
    /// Both halves of IbsOpMaxCnt (bits 26:20 and 15:0).
    pub const MAX_CNT_MASK: u64 = 0x0000_0000_07f0_ffff;
    /// IbsOpCurCnt (bits 58:32).
    pub const CUR_CNT_MASK: u64 = 0x07ff_ffff_0000_0000;
    /// Low four bits of IbsOpCurCnt, replaced on every rearm.
    pub const CUR_CNT_RAND_MASK: u64 = 0x0000_000f_0000_0000;

    /// Returns the single-bit controls that are set.
    pub fn flags(self) -> OpCtlFlags {
        OpCtlFlags::from_bits_truncate(self.0)
    }

    /// Whether op sampling is enabled.
    pub fn is_enabled(self) -> bool {
        self.flags().contains(OpCtlFlags::ENABLE)
    }

    /// Whether a sample is latched.
    pub fn is_valid(self) -> bool {
        self.flags().contains(OpCtlFlags::VALID)
    }

    /// Raw MaxCnt field, in units of 16 ops.
    #[allow(clippy::cast_possible_truncation)]
    pub fn max_cnt(self) -> u32 {
        let lo = self.0 & 0xffff;
        let hi = (self.0 >> 20) & 0x7f;
        (lo | (hi << 16)) as u32
    }

    /// Sampling period in ops.
    pub fn period(self) -> u32 {
        self.max_cnt() << 4
    }

    /// IbsOpCurCnt.
    #[allow(clippy::cast_possible_truncation)]
    pub fn cur_cnt(self) -> u32 {
        ((self.0 & Self::CUR_CNT_MASK) >> 32) as u32
    }

    /// A latched sample with an empty MaxCnt field is a degenerate overflow.
    pub fn is_degenerate(self) -> bool {
        self.is_valid() && self.max_cnt() == 0
    }

    /// Encodes `period` (in ops) into the MaxCnt field layout.
    pub fn encode_period(period: u32) -> u64 {
        let field = u64::from(period >> 4);
        (field & 0xffff) | (((field >> 16) & 0x7f) << 20)
    }

    /// Replaces the MaxCnt field, leaving every other bit alone.
    #[must_use]
    pub fn with_period(self, period: u32) -> Self {
        Self((self.0 & !Self::MAX_CNT_MASK) | Self::encode_period(period))
    }

    /// Replaces IbsOpCurCnt, leaving every other bit alone.
    #[must_use]
    pub fn with_cur_cnt(self, cur: u32) -> Self {
        Self((self.0 & !Self::CUR_CNT_MASK) | ((u64::from(cur) << 32) & Self::CUR_CNT_MASK))
    }

    /// The armed form: op counting, `period`, enabled.
    ///
    /// Reserved bits and IbsOpCurCnt are preserved.
    #[must_use]
    pub fn armed(self, period: u32) -> Self {
        let ctl = self.with_period(period);
        Self(ctl.0 | (OpCtlFlags::COUNT_OPS | OpCtlFlags::ENABLE).bits())
    }

    /// The acknowledged form: `IbsOpVal` cleared, nothing else touched.
    #[must_use]
    pub fn acknowledged(self) -> Self {
        Self(self.0 & !OpCtlFlags::VALID.bits())
    }

    /// The rearmed form: acknowledged, with the low four bits of
    /// IbsOpCurCnt replaced by `rand`.
    #[must_use]
    pub fn rearmed(self, rand: u8) -> Self {
        let ctl = self.acknowledged().0 & !Self::CUR_CNT_RAND_MASK;
        Self(ctl | ((u64::from(rand & 0xf) << 32) & Self::CUR_CNT_RAND_MASK))
    }
}

/// A value of the `IBS_CONTROL` register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct IbsControl(pub u64);

impl IbsControl {
    const LVT_OFFSET_VALID: u64 = 1 << 8;
    const LVT_OFFSET_MASK: u64 = 0xf;

    /// The APIC extended LVT entry used for IBS, if firmware set one.
    #[allow(clippy::cast_possible_truncation)]
    pub fn lvt_offset(self) -> Option<u8> {
        if self.0 & Self::LVT_OFFSET_VALID == 0 {
            return None;
        }
        Some((self.0 & Self::LVT_OFFSET_MASK) as u8)
    }
}

bitflags::bitflags! {
    /// Single-bit fields of `IBS_OP_DATA`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpDataFlags: u64 {
        /// The tagged op was a return.
        const RETURN      = 1 << 34;
        /// The tagged branch was taken.
        const BRN_TAKEN   = 1 << 35;
        /// The tagged branch was mispredicted.
        const BRN_MISP    = 1 << 36;
        /// The tagged op was a retired branch.
        const BRN_RET     = 1 << 37;
        /// The latched RIP does not belong to the tagged op.
        const RIP_INVALID = 1 << 38;
        /// The tagged op was a fused branch.
        const BRN_FUSE    = 1 << 39;
        /// The tagged op came from microcode.
        const MICROCODE   = 1 << 40;
    }
}

/// A value of the `IBS_OP_DATA` register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct IbsOpData(pub u64);

impl IbsOpData {
    /// Returns the single-bit fields that are set.
    pub fn flags(self) -> OpDataFlags {
        OpDataFlags::from_bits_truncate(self.0)
    }

    /// Whether the latched RIP must be ignored.
    pub fn rip_invalid(self) -> bool {
        self.flags().contains(OpDataFlags::RIP_INVALID)
    }

    /// Whether the tagged op came from microcode.
    pub fn is_microcode(self) -> bool {
        self.flags().contains(OpDataFlags::MICROCODE)
    }

    /// Cycles from tagging to retirement.
    #[allow(clippy::cast_possible_truncation)]
    pub fn tag_to_ret_ctr(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Cycles from completion to retirement.
    #[allow(clippy::cast_possible_truncation)]
    pub fn comp_to_ret_ctr(self) -> u16 {
        self.0 as u16
    }
}

bitflags::bitflags! {
    /// Single-bit fields of `IBS_OP_DATA3`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpData3Flags: u64 {
        /// Load op.
        const LD_OP                = 1 << 0;
        /// Store op.
        const ST_OP                = 1 << 1;
        /// Missed the L1 data TLB.
        const DC_L1TLB_MISS        = 1 << 2;
        /// Missed the L2 data TLB.
        const DC_L2TLB_MISS        = 1 << 3;
        /// Hit a 2M page in the L1 data TLB.
        const DC_L1TLB_HIT_2M      = 1 << 4;
        /// Hit a 1G page in the L1 data TLB.
        const DC_L1TLB_HIT_1G      = 1 << 5;
        /// Hit a 2M page in the L2 data TLB.
        const DC_L2TLB_HIT_2M      = 1 << 6;
        /// Missed the data cache.
        const DC_MISS              = 1 << 7;
        /// Misaligned access.
        const DC_MIS_ACC           = 1 << 8;
        /// Write-combining memory access.
        const DC_WC_MEM_ACC        = 1 << 13;
        /// Uncacheable memory access.
        const DC_UC_MEM_ACC        = 1 << 14;
        /// Locked operation.
        const DC_LOCKED_OP         = 1 << 15;
        /// Data cache miss with no miss buffer allocated.
        const DC_MISS_NO_MAB_ALLOC = 1 << 16;
        /// `IBS_DC_LIN_AD` holds the access's linear address.
        const DC_LIN_ADDR_VALID    = 1 << 17;
        /// `IBS_DC_PHYS_AD` holds the access's physical address.
        const DC_PHY_ADDR_VALID    = 1 << 18;
        /// Hit a 1G page in the L2 data TLB.
        const DC_L2TLB_HIT_1G      = 1 << 19;
        /// Missed the L2 cache.
        const DC_L2_MISS           = 1 << 20;
        /// Software prefetch.
        const SW_PF                = 1 << 21;
    }
}

/// Width of a sampled load or store (`IBS_OP_DATA3` OpMemWidth).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemWidth {
    /// No memory access.
    None,
    /// 8 bits.
    Byte,
    /// 16 bits.
    Word,
    /// 32 bits.
    Dword,
    /// 64 bits.
    Qword,
    /// 128 bits.
    Oword,
    /// 256 bits.
    Yword,
}

impl MemWidth {
    /// Decodes the 4-bit field. Codes above 6 are reserved.
    pub fn from_field(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            1 => Self::Byte,
            2 => Self::Word,
            3 => Self::Dword,
            4 => Self::Qword,
            5 => Self::Oword,
            6 => Self::Yword,
            _ => return None,
        })
    }

    /// Access width in bits.
    pub fn bits(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Byte => 8,
            Self::Word => 16,
            Self::Dword => 32,
            Self::Qword => 64,
            Self::Oword => 128,
            Self::Yword => 256,
        }
    }
}

/// A value of the `IBS_OP_DATA3` register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct IbsOpData3(pub u64);

impl IbsOpData3 {
    /// OpMemWidth (bits 25:22).
    pub const MEM_WIDTH_MASK: u64 = 0x0000_0000_03c0_0000;

    /// Returns the single-bit fields that are set.
    pub fn flags(self) -> OpData3Flags {
        OpData3Flags::from_bits_truncate(self.0)
    }

    /// Whether the tagged op loaded from memory.
    pub fn is_load(self) -> bool {
        self.flags().contains(OpData3Flags::LD_OP)
    }

    /// Whether the tagged op stored to memory.
    pub fn is_store(self) -> bool {
        self.flags().contains(OpData3Flags::ST_OP)
    }

    /// Width of the access, or `None` for a reserved encoding.
    #[allow(clippy::cast_possible_truncation)]
    pub fn mem_width(self) -> Option<MemWidth> {
        MemWidth::from_field(((self.0 & Self::MEM_WIDTH_MASK) >> 22) as u8)
    }

    /// Data cache miss latency in cycles (bits 47:32).
    #[allow(clippy::cast_possible_truncation)]
    pub fn dc_miss_lat(self) -> u16 {
        (self.0 >> 32) as u16
    }

    /// TLB refill latency in cycles (bits 63:48).
    #[allow(clippy::cast_possible_truncation)]
    pub fn tlb_refill_lat(self) -> u16 {
        (self.0 >> 48) as u16
    }
}

/// A 4-bit Fibonacci LFSR (x^4 + x^3 + 1), period 15, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lfsr4(u8);

impl Lfsr4 {
    /// Creates an LFSR from a non-zero 4-bit seed.
    pub fn new(seed: u8) -> Option<Self> {
        (seed != 0 && seed <= 0xf).then_some(Self(seed))
    }

    /// Current state.
    pub fn state(self) -> u8 {
        self.0
    }

    /// Returns the successor state.
    #[must_use]
    pub fn step(self) -> Self {
        let bit = ((self.0 >> 3) ^ (self.0 >> 2)) & 1;
        Self(((self.0 << 1) | bit) & 0xf)
    }
}

/// An [`Lfsr4`] whose state persists across collector invocations.
#[derive(Debug)]
pub struct RestartRandomizer {
    state: AtomicU8,
}

impl RestartRandomizer {
    /// Creates a randomizer seeded with `seed`.
    pub fn new(seed: Lfsr4) -> Self {
        Self { state: AtomicU8::new(seed.state()) }
    }

    /// Advances the sequence and returns the new 4-bit value.
    pub fn next_value(&self) -> u8 {
        let step = |s: u8| Lfsr4::new(s).map_or(Lfsr4(1), Lfsr4::step).state();
        let prev = self
            .state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(step(s)))
            .unwrap_or_else(|s| s);
        step(prev)
    }
}

/// Arms op sampling with the given period.
pub fn arm(regs: &dyn SamplingRegisters, period: u32) {
    let ctl = IbsOpCtl(regs.read(IBS_OP_CTL));
    regs.write(IBS_OP_CTL, ctl.armed(period).0);
}

/// Disarms op sampling.
///
/// Writes `IbsOpVal` alone first and waits [`DISARM_SETTLE`] so a sample
/// already in flight resolves before the register is cleared.
pub fn disarm(regs: &dyn SamplingRegisters) {
    regs.write(IBS_OP_CTL, OpCtlFlags::VALID.bits());
    let start = Instant::now();
    while start.elapsed() < DISARM_SETTLE {
        core::hint::spin_loop();
    }
    regs.write(IBS_OP_CTL, 0);
}

/// Rearms after a consumed sample with a decorrelated restart count.
pub fn rearm(regs: &dyn SamplingRegisters, ctl: IbsOpCtl, randomizer: &RestartRandomizer) {
    regs.write(IBS_OP_CTL, ctl.rearmed(randomizer.next_value()).0);
}
