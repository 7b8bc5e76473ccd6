//! Semispace copying collector for the young generation.
//!
//! # Phases
//!
//! 1. **Prologue**: flip the halves. The previous from-space becomes the copy
//!    target and the new to-space; the allocation cursor is reset to its start.
//! 2. **Roots**: every root slot, and every pointer field of objects already in
//!    the old generation, that refers into from-space is forwarded.
//! 3. **Closure**: a scan cursor walks to-space behind `top`, and a worklist
//!    drains objects promoted during this cycle, until both are exhausted.
//! 4. **Epilogue**: clear the scavenging guard and count the cycle.
//!
//! The first copy of an object overwrites its from-space header with a
//! forwarding marker, so later discoveries resolve to that copy.

use std::{
    cell::Cell,
    mem::offset_of,
    ptr,
    time::{Duration, Instant},
};

use crate::{
    Address, HeapError, HeapResult, ObjectPointerVisitor, RootProvider, Value,
    object::{self, HeaderState, RawObject},
    pages::PageSpace,
    system::OS_PAGE_SIZE,
    value::round_up,
    virtual_memory::{MemoryRegion, VirtualMemory},
};

/// The `top`/`end` pair read and written by inline allocation code.
///
/// Lives in its own heap cell so its address is stable for the lifetime of
/// the scavenger; the single mutator is its only writer.
#[repr(C)]
#[derive(Debug, Default)]
pub struct BumpCursor {
    top: Cell<Address>,
    end: Cell<Address>,
}

impl BumpCursor {
    pub const TOP_OFFSET: usize = offset_of!(BumpCursor, top);
    pub const END_OFFSET: usize = offset_of!(BumpCursor, end);

    #[inline(always)]
    pub fn top(&self) -> Address {
        self.top.get()
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.end.get()
    }

    #[inline(always)]
    pub fn top_ptr(&self) -> *mut Address {
        self.top.as_ptr()
    }

    #[inline(always)]
    pub fn end_ptr(&self) -> *mut Address {
        self.end.as_ptr()
    }

    fn reset(&self, region: MemoryRegion) {
        self.top.set(region.start());
        self.end.set(region.end());
    }
}

/// Outcome of one scavenge cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScavengeStats {
    pub cycle: u64,
    /// Objects moved out of from-space, copied or promoted.
    pub survivors: usize,
    pub copied_bytes: usize,
    pub promoted_bytes: usize,
    /// Objects whose pointer fields were visited, old-generation roots
    /// included.
    pub scanned: usize,
    pub elapsed: Duration,
}

pub struct Scavenger {
    // keeps both halves mapped
    _memory: VirtualMemory,
    to: MemoryRegion,
    from: MemoryRegion,
    cursor: Box<BumpCursor>,
    object_alignment: usize,
    promotion_age: u8,
    scavenging: bool,
    collections: u64,
}

impl Scavenger {
    /// Reserves `max_capacity` bytes split into two equal halves.
    pub fn new(
        max_capacity: usize,
        object_alignment: usize,
        promotion_age: u8,
    ) -> HeapResult<Self> {
        if !object_alignment.is_power_of_two() {
            return Err(HeapError::InvalidSettings(
                "object_alignment must be a power of two",
            ));
        }
        let semi_size = round_up(max_capacity / 2, OS_PAGE_SIZE);
        if semi_size == 0 {
            return Err(HeapError::InvalidSettings("new space is empty"));
        }
        let memory = VirtualMemory::reserve(2 * semi_size, OS_PAGE_SIZE, false)?;
        let whole = memory.region();
        let to = whole.subregion(0, semi_size);
        let from = whole.subregion(semi_size, semi_size);

        let cursor = Box::new(BumpCursor::default());
        cursor.reset(to);
        log::debug!(
            "new space: 2 x {} bytes at 0x{:x}",
            semi_size,
            whole.start()
        );

        Ok(Self {
            _memory: memory,
            to,
            from,
            cursor,
            object_alignment,
            promotion_age,
            scavenging: false,
            collections: 0,
        })
    }

    /// True iff `addr` lies in to-space.
    ///
    /// Outside a scavenge, from-space holds only garbage; asking about it is
    /// a bug and trips a debug assertion.
    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        debug_assert!(
            self.scavenging || !self.from.contains(addr),
            "from-space address 0x{addr:x} used outside a scavenge"
        );
        self.to.contains(addr)
    }

    /// Bumps `top` by `size` (already aligned), or returns `None` without side
    /// effects when to-space is full.
    #[inline(always)]
    pub fn try_allocate(&mut self, size: usize) -> Option<Address> {
        debug_assert!(
            size.is_multiple_of(self.object_alignment),
            "unaligned request of {size} bytes"
        );
        let result = self.cursor.top();
        if self.cursor.end() - result < size {
            return None;
        }
        self.cursor.top.set(result + size);
        Some(result)
    }

    /// Runs one full copying cycle.
    ///
    /// Objects in `old_space` and `code_space` are scanned as roots, and
    /// survivors that reached the promotion age move into `old_space`.
    pub fn scavenge(
        &mut self,
        roots: &mut dyn RootProvider,
        old_space: &mut PageSpace,
        code_space: &PageSpace,
    ) -> ScavengeStats {
        let started = Instant::now();
        let mut cycle = ScavengeCycle {
            scan: self.prologue(),
            promoted: Vec::new(),
            stats: ScavengeStats {
                cycle: self.collections + 1,
                ..Default::default()
            },
        };

        self.iterate_roots(&mut cycle, roots, old_space, code_space);
        self.process_to_space(&mut cycle, old_space);
        self.epilogue();

        let mut stats = cycle.stats;
        stats.elapsed = started.elapsed();
        log::debug!(
            "scavenge #{}: {} survivors, {} bytes copied, {} bytes promoted in {:?}",
            stats.cycle,
            stats.survivors,
            stats.copied_bytes,
            stats.promoted_bytes,
            stats.elapsed
        );
        stats
    }

    fn prologue(&mut self) -> Address {
        debug_assert!(!self.scavenging, "nested scavenge");
        self.scavenging = true;
        std::mem::swap(&mut self.to, &mut self.from);
        self.cursor.reset(self.to);
        log::trace!(
            "scavenge #{} begins: copying into 0x{:x}..0x{:x}",
            self.collections + 1,
            self.to.start(),
            self.to.end()
        );
        self.to.start()
    }

    fn iterate_roots(
        &mut self,
        cycle: &mut ScavengeCycle,
        roots: &mut dyn RootProvider,
        old_space: &mut PageSpace,
        code_space: &PageSpace,
    ) {
        // objects promoted from here on are scanned from the worklist
        let mut ranges = old_space.object_ranges();
        ranges.extend(code_space.object_ranges());

        roots.visit_roots(&mut |slot| self.forward(slot, cycle, old_space));

        let alignment = self.object_alignment;
        for (start, end) in ranges {
            let mut cursor = start;
            while cursor < end {
                // SAFETY: snapshot ranges of initialized old objects; page
                // memory stays mapped while promotions append past them
                let obj = unsafe { RawObject::from_addr(cursor) };
                let mut visitor = |slot: &mut Value| self.forward(slot, cycle, old_space);
                cursor += obj.visit_pointers(alignment, &mut visitor);
                cycle.stats.scanned += 1;
            }
        }
    }

    fn process_to_space(&mut self, cycle: &mut ScavengeCycle, old_space: &mut PageSpace) {
        let alignment = self.object_alignment;
        loop {
            while cycle.scan < self.cursor.top() {
                // SAFETY: everything below top was copied this cycle
                let obj = unsafe { RawObject::from_addr(cycle.scan) };
                let mut visitor = |slot: &mut Value| self.forward(slot, cycle, old_space);
                let size = obj.visit_pointers(alignment, &mut visitor);
                cycle.scan += size;
                cycle.stats.scanned += 1;
            }
            let Some(addr) = cycle.promoted.pop() else {
                break;
            };
            // SAFETY: promoted objects were fully copied into old space
            let obj = unsafe { RawObject::from_addr(addr) };
            let mut visitor = |slot: &mut Value| self.forward(slot, cycle, old_space);
            obj.visit_pointers(alignment, &mut visitor);
            cycle.stats.scanned += 1;
        }
        debug_assert_eq!(cycle.scan, self.cursor.top());
    }

    fn epilogue(&mut self) {
        if cfg!(debug_assertions) {
            // SAFETY: from-space is ours and holds only garbage now
            unsafe { ptr::write_bytes(self.from.start() as *mut u8, 0xf3, self.from.size()) };
        }
        self.scavenging = false;
        self.collections += 1;
    }

    fn forward(&mut self, slot: &mut Value, cycle: &mut ScavengeCycle, old_space: &mut PageSpace) {
        if !slot.is_heap_object() || !self.from.contains(slot.addr()) {
            return;
        }
        // SAFETY: from-space references point at objects or forwarding markers
        let obj = unsafe { RawObject::from_value(*slot) };
        let new_addr = match obj.header_state() {
            HeaderState::Forwarded(to) => to,
            HeaderState::Live(header) => {
                let size = header.size(self.object_alignment);
                let promoted = if header.age() >= self.promotion_age {
                    old_space.try_allocate(size)
                } else {
                    None
                };
                let new_addr = match promoted {
                    Some(addr) => {
                        cycle.promoted.push(addr);
                        cycle.stats.promoted_bytes += size;
                        addr
                    }
                    None => {
                        if header.age() >= self.promotion_age {
                            log::trace!("promotion of {size} bytes failed, copying instead");
                        }
                        cycle.stats.copied_bytes += size;
                        // to-space is as large as from-space, so every
                        // survivor fits
                        self.try_allocate(size).unwrap_or_else(|| {
                            panic!("to-space overflow copying {size} bytes")
                        })
                    }
                };
                // SAFETY: both ranges are `size` bytes and in different spaces
                unsafe {
                    ptr::copy_nonoverlapping(
                        obj.addr() as *const u8,
                        new_addr as *mut u8,
                        size,
                    );
                    RawObject::from_addr(new_addr).set_header_state(HeaderState::Live(
                        header.with_age(header.age().saturating_add(1)),
                    ));
                }
                obj.set_header_state(HeaderState::Forwarded(new_addr));
                cycle.stats.survivors += 1;
                new_addr
            }
        };
        *slot = Value::from_addr(new_addr);
    }

    /// Walks to-space between its start and `top`.
    pub fn visit_object_pointers(&mut self, visitor: &mut dyn ObjectPointerVisitor) {
        // SAFETY: to-space below top holds only initialized objects
        unsafe {
            object::visit_range(
                self.first_object_start(),
                self.cursor.top(),
                self.object_alignment,
                visitor,
            )
        };
    }

    #[inline(always)]
    pub fn first_object_start(&self) -> Address {
        self.to.start()
    }

    #[inline(always)]
    pub fn top(&self) -> Address {
        self.cursor.top()
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.cursor.end()
    }

    /// The cursor inline allocation code bumps.
    #[inline(always)]
    pub fn cursor(&self) -> &BumpCursor {
        &self.cursor
    }

    pub fn to_space(&self) -> MemoryRegion {
        self.to
    }

    pub fn from_space(&self) -> MemoryRegion {
        self.from
    }

    /// Bytes in one half.
    pub fn capacity(&self) -> usize {
        self.to.size()
    }

    pub fn in_use(&self) -> usize {
        self.cursor.top() - self.to.start()
    }

    pub fn object_alignment(&self) -> usize {
        self.object_alignment
    }

    pub fn collections(&self) -> u64 {
        self.collections
    }

    pub fn is_scavenging(&self) -> bool {
        self.scavenging
    }
}

impl core::fmt::Debug for Scavenger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scavenger")
            .field("to", &self.to)
            .field("from", &self.from)
            .field("top", &self.cursor.top())
            .field("collections", &self.collections)
            .finish()
    }
}

struct ScavengeCycle {
    scan: Address,
    promoted: Vec<Address>,
    stats: ScavengeStats,
}
