//! Page permissions and address translation for the current process.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use ibstrace_core::config::PAGE_SIZE;
use ibstrace_core::platform::MemoryServices;
use ibstrace_core::{Error, Result};
use rustix::mm::{MprotectFlags, mprotect};

/// One `/proc/self/pagemap` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapEntry(pub u64);

impl PageMapEntry {
    const PRESENT: u64 = 1 << 63;
    const PFN_MASK: u64 = (1 << 55) - 1;

    /// Page is resident.
    pub fn present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    /// Page frame number. Reads as zero without `CAP_SYS_ADMIN`.
    pub fn pfn(self) -> u64 {
        self.0 & Self::PFN_MASK
    }

    /// Physical address of `vaddr`, if the entry resolves it.
    pub fn physical_address(self, vaddr: usize) -> Option<u64> {
        if !self.present() || self.pfn() == 0 {
            return None;
        }
        Some(self.pfn() * PAGE_SIZE as u64 + (vaddr % PAGE_SIZE) as u64)
    }
}

/// Looks up the pagemap entry for `vaddr` in the current process.
pub fn pagemap_entry(vaddr: usize) -> io::Result<PageMapEntry> {
    let file = File::open("/proc/self/pagemap")?;
    let mut buf = [0u8; 8];
    let offset = (vaddr / PAGE_SIZE) as u64 * 8;
    file.read_exact_at(&mut buf, offset)?;
    Ok(PageMapEntry(u64::from_le_bytes(buf)))
}

/// `mprotect`-backed page permissions for heap allocations of this process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemory {
    _priv: (),
}

impl ProcessMemory {
    /// Checks that the system page size matches the coordinator's.
    pub fn new() -> Result<Self> {
        let page_size = rustix::param::page_size();
        if page_size != PAGE_SIZE {
            log::error!("ibstrace: system page size {page_size} is not {PAGE_SIZE}");
            return Err(Error::Unsupported("system page size is not 4 KiB"));
        }
        Ok(Self { _priv: () })
    }

    unsafe fn protect(addr: usize, pages: usize, flags: MprotectFlags) -> Result<()> {
        let len = pages * PAGE_SIZE;
        // SAFETY: the caller owns the page-aligned range.
        unsafe { mprotect(addr as *mut core::ffi::c_void, len, flags) }
            .map_err(|e| Error::platform("mprotect", e.into()))
    }
}

impl MemoryServices for ProcessMemory {
    unsafe fn set_executable(&self, addr: usize, pages: usize) -> Result<()> {
        let flags = MprotectFlags::READ | MprotectFlags::WRITE | MprotectFlags::EXEC;
        // SAFETY: forwarded from the caller.
        unsafe { Self::protect(addr, pages, flags) }
    }

    unsafe fn set_non_executable(&self, addr: usize, pages: usize) -> Result<()> {
        // SAFETY: forwarded from the caller.
        unsafe { Self::protect(addr, pages, MprotectFlags::READ | MprotectFlags::WRITE) }
    }

    fn physical_address(&self, addr: usize) -> Option<u64> {
        match pagemap_entry(addr) {
            Ok(entry) => entry.physical_address(addr),
            Err(e) => {
                log::debug!("ibstrace: pagemap lookup for {addr:#x} failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_decodes_pfn_and_offset() {
        let entry = PageMapEntry((1 << 63) | 0x1234);
        assert!(entry.present());
        assert_eq!(entry.pfn(), 0x1234);
        assert_eq!(entry.physical_address(0x7fff_0000_0abc), Some(0x1234_abc));
    }

    #[test]
    fn absent_or_hidden_frames_do_not_resolve() {
        assert_eq!(PageMapEntry(0x1234).physical_address(0), None);
        assert_eq!(PageMapEntry(1 << 63).physical_address(0), None);
    }

    #[test]
    fn pagemap_is_readable_for_own_pages() {
        let value = Box::new(0u64);
        let addr = &*value as *const u64 as usize;
        // Unprivileged readers see a zero PFN, but the entry is still there.
        if let Ok(entry) = pagemap_entry(addr) {
            assert!(entry.present());
        }
    }
}
