//! Old-generation page space.
//!
//! Normal pages are `page_size` bytes and bump-allocate many objects. Requests
//! that do not fit a normal page's data area get a dedicated large page sized
//! to the request. Pages are never swept individually; the whole space is
//! released at once by [`PageSpace::free_pages`].

use bitflags::bitflags;

use crate::{
    Address, HeapResult, ObjectPointerVisitor,
    object,
    system::OS_PAGE_SIZE,
    value::checked_round_up,
    virtual_memory::VirtualMemory,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const LARGE      = 1 << 0;
        const EXECUTABLE = 1 << 1;
    }
}

/// One aligned chunk of old-generation memory.
///
/// The first [`HeapPage::HEADER_SIZE`] bytes are kept free so no object ever
/// starts at a page boundary; objects follow back to back up to `top`.
#[derive(Debug)]
pub struct HeapPage {
    memory: VirtualMemory,
    top: Address,
    used: usize,
    flags: PageFlags,
}

impl HeapPage {
    pub const HEADER_SIZE: usize = 64;

    fn allocate(size: usize, alignment: usize, flags: PageFlags) -> HeapResult<Self> {
        let memory = VirtualMemory::reserve(
            size,
            alignment,
            flags.contains(PageFlags::EXECUTABLE),
        )?;
        let top = memory.start() + Self::HEADER_SIZE;
        Ok(Self {
            memory,
            top,
            used: 0,
            flags,
        })
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.memory.contains(addr)
    }

    #[inline(always)]
    pub fn first_object_start(&self) -> Address {
        self.memory.start() + Self::HEADER_SIZE
    }

    /// One past the last allocated object.
    #[inline(always)]
    pub fn top(&self) -> Address {
        self.top
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.memory.end()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.memory.size()
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn add_used(&mut self, size: usize) {
        self.used += size;
    }

    #[inline(always)]
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    #[inline(always)]
    pub fn is_large(&self) -> bool {
        self.flags.contains(PageFlags::LARGE)
    }

    #[inline(always)]
    fn try_bump(&mut self, size: usize) -> Option<Address> {
        let result = self.top;
        let new_top = result.checked_add(size)?;
        if new_top > self.end() {
            return None;
        }
        self.top = new_top;
        self.add_used(size);
        Some(result)
    }

    /// Walks every object in `[first_object_start, top)`.
    pub fn visit_object_pointers(
        &mut self,
        alignment: usize,
        visitor: &mut dyn ObjectPointerVisitor,
    ) {
        // SAFETY: the page only holds objects its space handed out
        unsafe {
            object::visit_range(self.first_object_start(), self.top, alignment, visitor)
        };
    }
}

/// A growable set of old-generation pages with a hard capacity limit.
#[derive(Debug)]
pub struct PageSpace {
    pages: Vec<HeapPage>,
    large_pages: Vec<HeapPage>,
    page_size: usize,
    object_alignment: usize,
    max_capacity: usize,
    capacity: usize,
    in_use: usize,
    executable: bool,
}

impl PageSpace {
    pub fn new(
        page_size: usize,
        max_capacity: usize,
        object_alignment: usize,
        executable: bool,
    ) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(page_size.is_multiple_of(OS_PAGE_SIZE));
        Self {
            pages: Vec::new(),
            large_pages: Vec::new(),
            page_size,
            object_alignment,
            max_capacity,
            capacity: 0,
            in_use: 0,
            executable,
        }
    }

    /// Pure size classification: does `size` fit a normal page's data area?
    #[inline(always)]
    pub fn is_page_allocatable_size(&self, size: usize) -> bool {
        size <= self.page_size - HeapPage::HEADER_SIZE
    }

    /// Returns the start of `size` fresh bytes, or `None` once the space is at
    /// `max_capacity`.
    pub fn try_allocate(&mut self, size: usize) -> Option<Address> {
        debug_assert!(
            size.is_multiple_of(self.object_alignment),
            "unaligned request of {size} bytes"
        );
        if !self.is_page_allocatable_size(size) {
            return self.allocate_large(size);
        }
        if let Some(addr) = self.pages.last_mut().and_then(|page| page.try_bump(size)) {
            self.in_use += size;
            return Some(addr);
        }
        self.allocate_slow(size)
    }

    #[cold]
    fn allocate_slow(&mut self, size: usize) -> Option<Address> {
        let page_size = self.page_size;
        let mut page = self.acquire_page(page_size, PageFlags::empty())?;
        let addr = page.try_bump(size)?;
        self.pages.push(page);
        self.in_use += size;
        Some(addr)
    }

    #[cold]
    fn allocate_large(&mut self, size: usize) -> Option<Address> {
        let bytes = HeapPage::HEADER_SIZE
            .checked_add(size)
            .and_then(|bytes| checked_round_up(bytes, OS_PAGE_SIZE))?;
        let mut page = self.acquire_page(bytes, PageFlags::LARGE)?;
        let addr = page.try_bump(size)?;
        self.large_pages.push(page);
        self.in_use += size;
        Some(addr)
    }

    fn acquire_page(&mut self, bytes: usize, mut flags: PageFlags) -> Option<HeapPage> {
        if bytes > self.max_capacity - self.capacity {
            log::debug!(
                "page space exhausted: capacity {} + {} exceeds {}",
                self.capacity,
                bytes,
                self.max_capacity
            );
            return None;
        }
        if self.executable {
            flags |= PageFlags::EXECUTABLE;
        }
        match HeapPage::allocate(bytes, self.page_size, flags) {
            Ok(page) => {
                self.capacity += page.size();
                log::trace!(
                    "acquired {:?} page at 0x{:x} ({} bytes, capacity {})",
                    flags,
                    page.first_object_start() - HeapPage::HEADER_SIZE,
                    page.size(),
                    self.capacity
                );
                Some(page)
            }
            Err(err) => {
                log::warn!("page acquisition failed: {err}");
                None
            }
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.pages
            .iter()
            .chain(self.large_pages.iter())
            .any(|page| page.contains(addr))
    }

    /// Walks normal pages, then large pages.
    pub fn visit_object_pointers(&mut self, visitor: &mut dyn ObjectPointerVisitor) {
        let alignment = self.object_alignment;
        for page in self.pages.iter_mut().chain(self.large_pages.iter_mut()) {
            page.visit_object_pointers(alignment, visitor);
        }
    }

    /// The allocated range of every page at this moment.
    ///
    /// Page memory never moves, so the ranges stay walkable while further
    /// objects are bump-allocated past them.
    pub fn object_ranges(&self) -> Vec<(Address, Address)> {
        self.pages
            .iter()
            .chain(self.large_pages.iter())
            .map(|page| (page.first_object_start(), page.top()))
            .collect()
    }

    /// Releases every page. All addresses handed out become invalid.
    pub fn free_pages(&mut self) {
        log::debug!(
            "freeing {} pages and {} large pages",
            self.pages.len(),
            self.large_pages.len()
        );
        self.pages.clear();
        self.large_pages.clear();
        self.capacity = 0;
        self.in_use = 0;
    }

    pub fn pages(&self) -> impl Iterator<Item = &HeapPage> {
        self.pages.iter()
    }

    pub fn large_pages(&self) -> impl Iterator<Item = &HeapPage> {
        self.large_pages.iter()
    }

    #[inline(always)]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    #[inline(always)]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline(always)]
    pub fn object_alignment(&self) -> usize {
        self.object_alignment
    }

    #[inline(always)]
    pub fn is_executable(&self) -> bool {
        self.executable
    }
}
