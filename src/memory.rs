use crate::common::MmapHeader;
use crate::error::PerfBufError;
use core::ptr::NonNull;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::num::NonZero;
use std::os::fd::AsFd;

/// Total mapping size for a requested per-cpu capacity: one metadata page
/// plus the smallest power-of-two number of data pages covering the request.
/// A request of zero still gets one data page.
///
/// The power-of-two data region is what makes `index & mask` a valid
/// wraparound projection everywhere else in the crate.
pub(crate) fn mmap_size(per_cpu_buffer: usize, page_size: usize) -> usize {
    let pages = per_cpu_buffer
        .div_ceil(page_size)
        .max(1)
        .next_power_of_two();
    (1 + pages) * page_size
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Owner of one shared ring mapping: a metadata page followed by the data
/// region. Unmapped on drop.
pub(crate) struct Memory {
    ptr: NonNull<u8>,
    size: usize,
}

impl Memory {
    pub(crate) fn map<F: AsFd>(fd: F, size: usize, prot: ProtFlags) -> Result<Self, PerfBufError> {
        let len = NonZero::new(size).ok_or(PerfBufError::MmapFailed(nix::errno::Errno::EINVAL))?;
        let ptr = unsafe { mmap(None, len, prot, MapFlags::MAP_SHARED, fd, 0)? };
        Ok(Memory {
            ptr: ptr.cast(),
            size,
        })
    }

    /// The kernel metadata page at the front of the mapping.
    ///
    /// The mapping is page aligned and at least one page long, so this cast
    /// is the one place raw mapped bytes become a typed header.
    pub(crate) fn header(&self) -> &MmapHeader {
        unsafe { &*(self.ptr.as_ptr() as *const MmapHeader) }
    }

    pub(crate) fn header_ptr(&self) -> NonNull<MmapHeader> {
        self.ptr.cast()
    }

    /// Resolve the data region described by the header's offset/size fields,
    /// bounds checked against the mapping before anything dereferences it.
    pub(crate) fn data_region(&self) -> Result<(NonNull<u8>, usize), PerfBufError> {
        let offset = self.header().data_offset;
        let size = self.header().data_size;

        let out_of_bounds = PerfBufError::DataRegionBounds {
            offset,
            size,
            mapped: self.size,
        };
        let end = offset.checked_add(size).ok_or(out_of_bounds)?;
        if end > self.size as u64 {
            return Err(PerfBufError::DataRegionBounds {
                offset,
                size,
                mapped: self.size,
            });
        }
        if size == 0 || !size.is_power_of_two() {
            return Err(PerfBufError::DataRegionSize(size));
        }

        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset as usize)) };
        Ok((ptr, size as usize))
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
    }
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use nix::sys::memfd::{memfd_create, MFdFlags};
    use nix::unistd::ftruncate;
    use rstest::rstest;
    use std::os::fd::OwnedFd;

    #[rstest]
    #[case(0, 4096, 2 * 4096)]
    #[case(1, 4096, 2 * 4096)]
    #[case(4096, 4096, 2 * 4096)]
    #[case(4097, 4096, 3 * 4096)]
    #[case(8000, 4096, 3 * 4096)]
    #[case(9000, 4096, 5 * 4096)]
    #[case(64 * 1024, 4096, 17 * 4096)]
    fn mmap_size_rounds_to_pow2_pages(
        #[case] requested: usize,
        #[case] page: usize,
        #[case] expected: usize,
    ) {
        assert_eq!(mmap_size(requested, page), expected);
    }

    #[test]
    fn data_region_is_always_a_pow2_page_multiple() {
        for requested in [0, 1, 100, 4095, 4096, 10_000, 123_456, 1 << 20] {
            let total = mmap_size(requested, 4096);
            let data = total - 4096;
            assert!(data >= requested);
            assert!((data / 4096).is_power_of_two());
            assert_eq!(data % 4096, 0);
        }
    }

    fn backing_fd(size: usize) -> Result<OwnedFd> {
        let fd = memfd_create(c"perfbuf-test", MFdFlags::MFD_CLOEXEC)?;
        ftruncate(&fd, size as i64)?;
        Ok(fd)
    }

    fn fake_kernel_fields(memory: &Memory, data_offset: u64, data_size: u64) {
        // Fill in what the kernel would have set before mmap returned.
        unsafe {
            let header = memory.header_ptr().as_ptr();
            (*header).data_offset = data_offset;
            (*header).data_size = data_size;
        }
    }

    #[test]
    fn maps_and_resolves_the_data_region() -> Result<()> {
        let page = page_size();
        let total = mmap_size(page, page);
        let fd = backing_fd(total)?;

        let memory = Memory::map(&fd, total, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)?;
        fake_kernel_fields(&memory, page as u64, page as u64);

        let (_, len) = memory.data_region()?;
        assert_eq!(len, page);
        Ok(())
    }

    #[test]
    fn rejects_a_data_region_past_the_mapping() -> Result<()> {
        let page = page_size();
        let total = mmap_size(page, page);
        let fd = backing_fd(total)?;

        let memory = Memory::map(&fd, total, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)?;
        fake_kernel_fields(&memory, page as u64, 4 * page as u64);

        assert!(matches!(
            memory.data_region(),
            Err(PerfBufError::DataRegionBounds { .. })
        ));
        Ok(())
    }

    #[test]
    fn rejects_a_non_pow2_data_region() -> Result<()> {
        let page = page_size();
        let total = mmap_size(3 * page, page);
        let fd = backing_fd(total)?;

        let memory = Memory::map(&fd, total, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)?;
        fake_kernel_fields(&memory, page as u64, 3 * page as u64);

        assert!(matches!(
            memory.data_region(),
            Err(PerfBufError::DataRegionSize(_))
        ));
        Ok(())
    }
}
