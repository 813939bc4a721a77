//! Hugepage-backed DMA memory and virtual-to-physical translation.
//!
//! The NIC sees bus addresses, not process addresses. Every region handed to
//! the hardware is pinned (mlock), hugepage-backed, and translated once
//! through `/proc/self/pagemap`. A heap-backed variant exists for software
//! devices and tests; it uses the virtual address as its "bus" address and
//! must never reach real hardware.

use std::alloc::{self, Layout};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::ptr;

use nix::libc;
use tracing::debug;

use crate::error::{DriverError, Result};

const HUGE_PAGE_BITS: u32 = 21;

/// Default hugepage size (2 MiB).
pub fn hugepage_size() -> usize {
    1 << HUGE_PAGE_BITS
}

/// Base page size of the running system.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Width of a process address in bytes.
pub fn addr_size() -> usize {
    std::mem::size_of::<usize>()
}

/// Translate a virtual address of the calling process into a physical one.
///
/// Reads the page frame number out of `/proc/self/pagemap`. The kernel
/// zeroes PFNs for unprivileged readers, which we report as
/// [`DriverError::NotPrivileged`] rather than returning a bogus address.
pub fn virt_to_phys(virt: usize) -> Result<usize> {
    let page = page_size();
    let file = OpenOptions::new().read(true).open("/proc/self/pagemap")?;

    let mut entry = [0u8; 8];
    file.read_exact_at(&mut entry, (virt / page * 8) as u64)?;

    // Bits 0-54 hold the PFN, the rest are flags.
    let pfn = u64::from_ne_bytes(entry) & 0x007f_ffff_ffff_ffff;
    if pfn == 0 {
        return Err(DriverError::NotPrivileged);
    }

    Ok(pfn as usize * page + virt % page)
}

enum Backing {
    Hugetlb,
    Host { layout: Layout },
}

/// A pinned memory region with a fixed physical address.
pub struct DmaRegion {
    virt: *mut u8,
    phys: usize,
    size: usize,
    backing: Backing,
}

// Safety: the pointer is only dereferenced through owners that hand out
// exclusive access per buffer or per ring slot.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocate pinned, zero-filled DMA memory from hugepages.
    ///
    /// `size` is rounded up to a hugepage multiple. With
    /// `require_contiguous`, allocations beyond a single hugepage are
    /// rejected, since the kernel gives no contiguity guarantee across
    /// hugepage boundaries.
    pub fn hugetlb(size: usize, require_contiguous: bool) -> Result<Self> {
        let size = if size % hugepage_size() != 0 {
            ((size >> HUGE_PAGE_BITS) + 1) << HUGE_PAGE_BITS
        } else {
            size
        };

        if require_contiguous && size > hugepage_size() {
            return Err(DriverError::AllocationNotContiguous);
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EPERM) | Some(libc::EACCES) => DriverError::NotPrivileged,
                _ => DriverError::HugepagesExhausted(size),
            });
        }

        if unsafe { libc::mlock(ptr, size) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(ptr, size) };
            return Err(err.into());
        }

        let virt = ptr as *mut u8;
        let phys = match virt_to_phys(virt as usize) {
            Ok(phys) => phys,
            Err(e) => {
                unsafe { libc::munmap(ptr, size) };
                return Err(e);
            }
        };

        debug!(virt = ?virt, phys = %format_args!("{phys:#x}"), size, "allocated dma region");

        Ok(DmaRegion {
            virt,
            phys,
            size,
            backing: Backing::Hugetlb,
        })
    }

    /// Allocate a heap-backed stand-in region for software devices and
    /// tests. The physical address is the virtual address; nothing here may
    /// be handed to real hardware.
    pub fn host(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, page_size())
            .map_err(|e| std::io::Error::other(format!("bad layout: {e}")))?;

        let virt = unsafe { alloc::alloc_zeroed(layout) };
        if virt.is_null() {
            return Err(DriverError::HugepagesExhausted(size));
        }

        Ok(DmaRegion {
            virt,
            phys: virt as usize,
            size,
            backing: Backing::Host { layout },
        })
    }

    pub fn virt(&self) -> *mut u8 {
        self.virt
    }

    pub fn phys(&self) -> usize {
        self.phys
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        match self.backing {
            Backing::Hugetlb => unsafe {
                libc::munmap(self.virt as *mut libc::c_void, self.size);
            },
            Backing::Host { layout } => unsafe {
                alloc::dealloc(self.virt, layout);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_sizes() {
        assert!(page_size().is_power_of_two());
        assert_eq!(hugepage_size(), 2 * 1024 * 1024);
        assert_eq!(addr_size(), 8);
    }

    #[test]
    fn test_host_region_is_zeroed() {
        let region = DmaRegion::host(4096).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(region.virt(), region.size()) };
        assert!(slice.iter().all(|&b| b == 0));
        assert_eq!(region.phys(), region.virt() as usize);
    }

    #[test]
    fn test_contiguity_limit() {
        // More than one hugepage cannot be physically contiguous.
        let res = DmaRegion::hugetlb(4 * 1024 * 1024, true);
        assert!(matches!(res, Err(DriverError::AllocationNotContiguous)));
    }
}
