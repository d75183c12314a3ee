//! Architecture-specific glue and a uniform facade.

use std::sync::Arc;

use crate::platform::EntryGlue;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Reports whether this processor has the IBS op-sampling facility.
pub fn ibs_supported() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::CpuInfo::read().ibs_supported()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// Entry glue that really calls into the code buffer, where one exists.
pub fn native_entry() -> Option<Arc<dyn EntryGlue>> {
    #[cfg(target_arch = "x86_64")]
    {
        Some(Arc::new(x86_64::NativeEntry))
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        None
    }
}
