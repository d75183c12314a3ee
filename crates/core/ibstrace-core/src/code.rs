//! Page-granular memory owned by the coordinator.
//!
//! [`CodeBuffer`] holds the uploaded program and stays executable for its
//! whole life. [`ScratchRegion`] is one page handed to the program in
//! precise mode so it can report results through memory.

use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::platform::MemoryServices;
use crate::protocol::UserSource;

/// A zeroed, page-aligned heap allocation.
pub struct PageRegion {
    ptr: NonNull<u8>,
    pages: usize,
}

// SAFETY: the region is a plain allocation with no thread affinity. All
// mutation goes through `&mut self` or through code running while the
// coordinator lock is held.
unsafe impl Send for PageRegion {}
// SAFETY: see above.
unsafe impl Sync for PageRegion {}

impl PageRegion {
    /// Allocates `pages` zeroed pages.
    pub fn new(pages: usize) -> Result<Self> {
        let layout = Self::layout(pages)?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::platform("allocate pages", io::Error::from(io::ErrorKind::OutOfMemory))
        })?;
        Ok(Self { ptr, pages })
    }

    fn layout(pages: usize) -> Result<Layout> {
        let size = pages
            .checked_mul(PAGE_SIZE)
            .filter(|&size| size != 0)
            .ok_or(Error::InvalidConfig("page count out of range"))?;
        Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| Error::InvalidConfig("page count out of range"))
    }

    /// Base address.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Number of pages.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// Always `false`; regions hold at least one page.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Raw base pointer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Views the region as bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is `len()` initialized bytes.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    /// Views the region as mutable bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for PageRegion {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.pages) {
            // SAFETY: allocated in `new` with the same layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl core::fmt::Debug for PageRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("pages", &self.pages)
            .finish()
    }
}

/// The executable buffer holding the uploaded program.
pub struct CodeBuffer {
    region: PageRegion,
    len: usize,
    memory: Arc<dyn MemoryServices>,
}

impl CodeBuffer {
    /// Allocates `pages` pages and marks them executable.
    pub fn new(pages: usize, memory: Arc<dyn MemoryServices>) -> Result<Self> {
        let region = PageRegion::new(pages)?;
        // SAFETY: `region` is a page-aligned allocation we own.
        unsafe { memory.set_executable(region.addr(), region.pages())? };
        log::debug!(
            "ibstrace: code buffer at {:#x} ({} pages) marked executable",
            region.addr(),
            pages
        );
        Ok(Self { region, len: 0, memory })
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Length of the committed program.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no program is committed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address.
    pub fn addr(&self) -> usize {
        self.region.addr()
    }

    /// The committed program bytes.
    pub fn code(&self) -> &[u8] {
        &self.region.as_slice()[..self.len]
    }

    /// Replaces the program with `bytes`.
    pub fn reset_code(&mut self, bytes: &[u8]) -> Result<()> {
        self.load(&bytes).map(|_| ())
    }

    /// Replaces the program with the contents of `src`.
    ///
    /// Empty or oversized sources are rejected without touching the buffer.
    /// If the copy itself faults the buffer is left with no committed
    /// program, since its contents are then partially overwritten.
    pub fn load(&mut self, src: &dyn UserSource) -> Result<usize> {
        let len = src.len();
        if len == 0 {
            return Err(Error::EmptyUpload);
        }
        let capacity = self.capacity();
        if len > capacity {
            return Err(Error::UploadTooLarge { len, capacity });
        }

        self.len = 0;
        src.copy_to(&mut self.region.as_mut_slice()[..len])?;
        self.len = len;
        Ok(len)
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        // SAFETY: the same range was marked executable in `new`.
        let revoked =
            unsafe { self.memory.set_non_executable(self.region.addr(), self.region.pages()) };
        if let Err(e) = revoked {
            log::warn!("ibstrace: failed to revoke execute permission on code buffer: {e}");
        }
    }
}

impl core::fmt::Debug for CodeBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodeBuffer")
            .field("region", &self.region)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// One page with a known physical address, written by uploaded code.
#[derive(Debug)]
pub struct ScratchRegion {
    region: PageRegion,
    phys: Option<u64>,
}

impl ScratchRegion {
    /// Number of 64-bit words in the page.
    pub const WORDS: usize = PAGE_SIZE / 8;

    /// Allocates the page and resolves its physical address.
    pub fn new(memory: &dyn MemoryServices) -> Result<Self> {
        let region = PageRegion::new(1)?;
        // Fault the page in so it is backed by a frame before resolving it.
        // SAFETY: the first word of a fresh page is in bounds and unaliased.
        unsafe { region.as_ptr().cast::<u64>().write_volatile(0) };
        let phys = memory.physical_address(region.addr());
        match phys {
            Some(phys) => log::debug!(
                "ibstrace: scratch page at {:#x} (phys {phys:#x})",
                region.addr()
            ),
            None => log::debug!(
                "ibstrace: scratch page at {:#x} (phys unavailable)",
                region.addr()
            ),
        }
        Ok(Self { region, phys })
    }

    /// Virtual address handed to uploaded code.
    pub fn addr(&self) -> usize {
        self.region.addr()
    }

    /// Physical address, if the host could resolve it.
    pub fn physical_address(&self) -> Option<u64> {
        self.phys
    }

    /// Reads word `index` as last written by uploaded code.
    pub fn read_word(&self, index: usize) -> Option<u64> {
        if index >= Self::WORDS {
            return None;
        }
        // SAFETY: in bounds and 8-byte aligned within a page-aligned
        // allocation. Volatile because the page is written behind the
        // compiler's back by foreign code.
        Some(unsafe { self.region.as_ptr().cast::<u64>().add(index).read_volatile() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeMemory, FaultingSource};

    fn buffer(pages: usize) -> (CodeBuffer, Arc<FakeMemory>) {
        let memory = Arc::new(FakeMemory::default());
        let code = CodeBuffer::new(pages, memory.clone()).unwrap();
        (code, memory)
    }

    #[test]
    fn region_is_page_aligned_and_zeroed() {
        let region = PageRegion::new(2).unwrap();
        assert_eq!(region.addr() % PAGE_SIZE, 0);
        assert_eq!(region.len(), 2 * PAGE_SIZE);
        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn code_buffer_is_executable_for_its_lifetime() {
        let (code, memory) = buffer(2);
        let addr = code.addr();
        assert!(memory.is_executable(addr));
        drop(code);
        assert!(!memory.is_executable(addr));
    }

    #[test]
    fn upload_replaces_contents_exactly() {
        let (mut code, _) = buffer(1);
        code.reset_code(&[0x90; 100]).unwrap();
        code.reset_code(&[0xb8, 0x2a, 0, 0, 0, 0xc3]).unwrap();
        assert_eq!(code.len(), 6);
        assert_eq!(code.code(), &[0xb8, 0x2a, 0, 0, 0, 0xc3]);
    }

    #[test]
    fn full_capacity_upload_is_accepted() {
        let (mut code, _) = buffer(1);
        code.reset_code(&[0xc3; PAGE_SIZE]).unwrap();
        assert_eq!(code.len(), PAGE_SIZE);
    }

    #[test]
    fn invalid_uploads_leave_buffer_unchanged() {
        let (mut code, _) = buffer(1);
        code.reset_code(&[1, 2, 3]).unwrap();

        assert!(matches!(code.reset_code(&[]), Err(Error::EmptyUpload)));
        let too_big = vec![0u8; PAGE_SIZE + 1];
        assert!(matches!(
            code.reset_code(&too_big),
            Err(Error::UploadTooLarge { len, capacity }) if len == PAGE_SIZE + 1 && capacity == PAGE_SIZE
        ));
        assert_eq!(code.code(), &[1, 2, 3]);
    }

    #[test]
    fn faulting_upload_uncommits_program() {
        let (mut code, _) = buffer(1);
        code.reset_code(&[1, 2, 3]).unwrap();
        let err = code.load(&FaultingSource(32)).unwrap_err();
        assert!(matches!(err, Error::Fault));
        assert!(code.is_empty());
    }

    #[test]
    fn scratch_words_are_readable() {
        let memory = FakeMemory::default();
        let scratch = ScratchRegion::new(&memory).unwrap();
        assert_eq!(scratch.physical_address(), Some(scratch.addr() as u64));
        assert_eq!(scratch.read_word(0), Some(0));
        assert_eq!(scratch.read_word(ScratchRegion::WORDS), None);
        // SAFETY: word 3 is inside the page.
        unsafe { (scratch.addr() as *mut u64).add(3).write_volatile(0xfeed) };
        assert_eq!(scratch.read_word(3), Some(0xfeed));
    }
}
