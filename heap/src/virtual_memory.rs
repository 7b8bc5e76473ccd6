use std::ptr::NonNull;

use crate::{
    Address, HeapError, HeapResult,
    system::{self, Access, OS_PAGE_SIZE},
    value::round_up,
};

/// A half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    start: Address,
    size: usize,
}

impl MemoryRegion {
    pub const fn new(start: Address, size: usize) -> Self {
        Self { start, size }
    }

    #[inline(always)]
    pub const fn start(&self) -> Address {
        self.start
    }

    #[inline(always)]
    pub const fn end(&self) -> Address {
        self.start + self.size
    }

    #[inline(always)]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub const fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// A view of `size` bytes starting `offset` bytes into this region.
    pub fn subregion(&self, offset: usize, size: usize) -> Self {
        assert!(offset + size <= self.size, "subregion out of bounds");
        Self::new(self.start + offset, size)
    }
}

/// An owned, aligned mapping of anonymous memory.
///
/// The mapping is released when the value is dropped; every address handed
/// out from it becomes invalid at that point.
#[derive(Debug)]
pub struct VirtualMemory {
    region: MemoryRegion,
    executable: bool,
}

impl VirtualMemory {
    /// Reserves `size` bytes whose start is a multiple of `alignment`.
    ///
    /// `size` is rounded up to whole OS pages. Over-reserves by `alignment`
    /// and unmaps the unaligned head and tail.
    pub fn reserve(
        size: usize,
        alignment: usize,
        executable: bool,
    ) -> HeapResult<Self> {
        debug_assert!(alignment.is_power_of_two());
        let alignment = alignment.max(OS_PAGE_SIZE);
        let size = round_up(size, OS_PAGE_SIZE);
        let raw_size = size + alignment;

        let raw = system::map_memory(raw_size, Access::new(executable))
            .ok_or(HeapError::ReservationFailed { size: raw_size })?;
        let raw_start = raw.as_ptr() as Address;
        let start = round_up(raw_start, alignment);

        let head = start - raw_start;
        if head > 0 {
            system::unmap_memory(raw, head);
        }
        let tail = raw_size - head - size;
        if tail > 0 {
            // SAFETY: start + size is inside the raw mapping
            let tail_ptr = unsafe { NonNull::new_unchecked((start + size) as *mut u8) };
            system::unmap_memory(tail_ptr, tail);
        }

        Ok(Self {
            region: MemoryRegion::new(start, size),
            executable,
        })
    }

    #[inline(always)]
    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        self.region.start()
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.region.end()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.region.size()
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.region.contains(addr)
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        // SAFETY: start is the non-null start of our own mapping
        let ptr = unsafe { NonNull::new_unchecked(self.start() as *mut u8) };
        system::unmap_memory(ptr, self.size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_is_aligned_and_page_rounded() {
        let alignment = 64 * 1024;
        let memory = VirtualMemory::reserve(10_000, alignment, false)
            .expect("reserve memory");
        assert!(memory.start().is_multiple_of(alignment));
        assert_eq!(memory.size(), round_up(10_000, OS_PAGE_SIZE));
        assert!(memory.contains(memory.start()));
        assert!(!memory.contains(memory.end()));
    }

    #[test]
    fn reserved_memory_is_zeroed_and_writable() {
        let memory = VirtualMemory::reserve(OS_PAGE_SIZE, OS_PAGE_SIZE, false)
            .expect("reserve memory");
        let ptr = memory.start() as *mut u64;
        // SAFETY: inside the fresh mapping
        unsafe {
            assert_eq!(*ptr, 0);
            *ptr = 0xdead_beef;
            assert_eq!(*ptr, 0xdead_beef);
        }
    }

    #[test]
    fn subregions_split_a_region() {
        let region = MemoryRegion::new(0x10000, 0x2000);
        let low = region.subregion(0, 0x1000);
        let high = region.subregion(0x1000, 0x1000);
        assert_eq!(low.end(), high.start());
        assert!(low.contains(0x10fff));
        assert!(!low.contains(0x11000));
        assert!(high.contains(0x11000));
    }
}
