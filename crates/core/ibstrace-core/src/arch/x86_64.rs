//! x86_64 call glue and CPUID feature detection.

use raw_cpuid::{CpuId, CpuIdResult};

use crate::platform::{EntryArgs, EntryGlue};

/// Vendor string of AMD processors.
pub const AMD_VENDOR: &[u8; 12] = b"AuthenticAMD";

/// CPUID 0x8000_0001 ECX: instruction-based sampling.
const EXT_FEATURE_IBS: u32 = 1 << 10;

/// Extended leaf with the IBS feature flags.
const IBS_LEAF: u32 = 0x8000_001b;

bitflags::bitflags! {
    /// IBS capabilities (CPUID 0x8000_001B EAX).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IbsFeatures: u32 {
        /// Feature flags valid.
        const FFV            = 1 << 0;
        /// Fetch sampling.
        const FETCH_SAM      = 1 << 1;
        /// Op sampling.
        const OP_SAM         = 1 << 2;
        /// Read/write of op counter.
        const RD_WR_OP_CNT   = 1 << 3;
        /// Op counting mode.
        const OP_CNT         = 1 << 4;
        /// Branch target address reporting.
        const BRN_TRGT       = 1 << 5;
        /// Extended op counter.
        const OP_CNT_EXT     = 1 << 6;
        /// Invalid RIP indication.
        const RIP_INVALID_CHK = 1 << 7;
    }
}

/// The CPUID leaves relevant to IBS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    /// 12-byte vendor identification string.
    pub vendor: [u8; 12],
    /// Highest supported extended leaf.
    pub max_extended_leaf: u32,
    /// CPUID 0x8000_0001 ECX.
    pub ext_features_ecx: u32,
    /// IBS capabilities, if the leaf exists.
    pub ibs: Option<IbsFeatures>,
}

impl CpuInfo {
    /// Queries the current processor.
    pub fn read() -> Self {
        let mut vendor = [0u8; 12];
        if let Some(info) = CpuId::new().get_vendor_info() {
            let name = info.as_str().as_bytes();
            let len = name.len().min(vendor.len());
            vendor[..len].copy_from_slice(&name[..len]);
        }
        Self::from_leaves(vendor, |leaf| raw_cpuid::cpuid!(leaf))
    }

    /// Builds the report from `query`, which answers one extended leaf.
    ///
    /// Leaves above the reported maximum are never queried.
    pub fn from_leaves(vendor: [u8; 12], query: impl Fn(u32) -> CpuIdResult) -> Self {
        let max_extended_leaf = query(0x8000_0000).eax;
        let ext_features_ecx =
            if max_extended_leaf >= 0x8000_0001 { query(0x8000_0001).ecx } else { 0 };
        let ibs = (max_extended_leaf >= IBS_LEAF)
            .then(|| IbsFeatures::from_bits_truncate(query(IBS_LEAF).eax));

        Self { vendor, max_extended_leaf, ext_features_ecx, ibs }
    }

    /// Vendor string, lossily decoded.
    pub fn vendor_str(&self) -> String {
        String::from_utf8_lossy(&self.vendor).into_owned()
    }

    /// AMD vendor and the IBS extended feature bit are both present.
    pub fn ibs_supported(&self) -> bool {
        &self.vendor == AMD_VENDOR && self.ext_features_ecx & EXT_FEATURE_IBS != 0
    }
}

/// Calls into the code buffer with a full callee-saved register frame.
///
/// Saves rbx, rbp, r12-r15 and RFLAGS, aligns the stack to 16 bytes for
/// the call, and restores everything afterwards, so the uploaded program is
/// free to clobber any of them as long as it returns with a balanced stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeEntry;

impl EntryGlue for NativeEntry {
    unsafe fn call(&self, code: &[u8], args: EntryArgs) -> u64 {
        let ret: u64;
        // SAFETY: the caller guarantees `code` is executable. Every
        // callee-saved register is preserved by the push/pop frame, and the
        // original stack pointer is restored from the aligned slot.
        unsafe {
            core::arch::asm!(
                "push rbx",
                "push rbp",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "pushfq",
                "mov r11, rsp",
                "and rsp, -16",
                "push r11",
                "sub rsp, 8",
                "call rcx",
                "add rsp, 8",
                "pop rsp",
                "popfq",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop rbp",
                "pop rbx",
                in("rdi") args.scratch,
                in("rsi") args.arg,
                in("rdx") args.offset,
                in("rcx") code.as_ptr(),
                lateout("rax") ret,
                clobber_abi("sysv64"),
            );
        }
        ret
    }
}
