//! The two-generation heap.
//!
//! Owns the young generation ([`Scavenger`]), the old generation and an
//! executable code space (both [`PageSpace`]s), and implements the
//! allocation escalation policy between them.

use crate::{
    Address, HeapError, HeapResult, ObjectPointerVisitor, RootProvider, WORD_SIZE,
    object::{Header, ObjectKind, RawObject, initialize_object},
    pages::{HeapPage, PageSpace},
    scavenger::{BumpCursor, ScavengeStats, Scavenger},
    system::OS_PAGE_SIZE,
    value::checked_round_up,
    verifier,
};

// ── Spaces ────────────────────────────────────────────────────────────

/// Where an allocation should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    /// Young generation, collected by scavenging.
    New,
    /// Old generation pages.
    Old,
    /// Executable old-generation pages.
    Code,
}

// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration for the heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total young-generation reservation covering both halves.
    pub new_space_size: usize,
    /// Upper bound for the old generation, large pages included.
    pub old_space_max: usize,
    /// Upper bound for the executable code space.
    pub code_space_max: usize,
    /// Size of a normal old-generation page. Power of two, OS page multiple.
    pub page_size: usize,
    /// Every object size is rounded to this. Power of two, at least a word.
    pub object_alignment: usize,
    /// Scavenges an object survives in new space before it is promoted.
    pub promotion_age: u8,
    /// Scavenge before every young allocation. Stress testing only.
    pub gc_at_alloc: bool,
    /// Lets allocation stubs take their inline fast path.
    pub inline_alloc: bool,
    /// Run the verifier after every scavenge.
    pub verify_after_gc: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            new_space_size: 1_048_576,  // 2 x 512 KB
            old_space_max: 67_108_864,  // 64 MB
            code_space_max: 4_194_304,  // 4 MB
            page_size: 262_144,         // 256 KB
            object_alignment: 16,
            promotion_age: 2,
            gc_at_alloc: false,
            inline_alloc: true,
            verify_after_gc: false,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> HeapResult<()> {
        let invalid = |reason| Err(HeapError::InvalidSettings(reason));
        if self.new_space_size == 0 || self.old_space_max == 0 || self.page_size == 0 {
            return invalid("sizes must be > 0");
        }
        if !self.new_space_size.is_multiple_of(2 * OS_PAGE_SIZE) {
            return invalid("new_space_size must split into two OS-page aligned halves");
        }
        if !self.page_size.is_power_of_two() || !self.page_size.is_multiple_of(OS_PAGE_SIZE) {
            return invalid("page_size must be a power of two and match OS page alignment");
        }
        if self.page_size <= HeapPage::HEADER_SIZE {
            return invalid("page_size leaves no room after the page header");
        }
        if !self.object_alignment.is_power_of_two() || self.object_alignment < WORD_SIZE {
            return invalid("object_alignment must be a power of two of at least one word");
        }
        if self.object_alignment > OS_PAGE_SIZE {
            return invalid("object_alignment must not exceed the OS page size");
        }
        if self.old_space_max < self.page_size || self.code_space_max < self.page_size {
            return invalid("page spaces must hold at least one page");
        }
        Ok(())
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Heap {
    settings: HeapSettings,
    new_space: Scavenger,
    old_space: PageSpace,
    code_space: PageSpace,
    last_scavenge: Option<ScavengeStats>,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> HeapResult<Self> {
        settings.validate()?;
        let new_space = Scavenger::new(
            settings.new_space_size,
            settings.object_alignment,
            settings.promotion_age,
        )?;
        let old_space = PageSpace::new(
            settings.page_size,
            settings.old_space_max,
            settings.object_alignment,
            false,
        );
        let code_space = PageSpace::new(
            settings.page_size,
            settings.code_space_max,
            settings.object_alignment,
            true,
        );
        log::info!(
            "heap created: new {} bytes, old max {} bytes, code max {} bytes",
            settings.new_space_size,
            settings.old_space_max,
            settings.code_space_max
        );
        Ok(Self {
            settings,
            new_space,
            old_space,
            code_space,
            last_scavenge: None,
        })
    }

    /// Allocates `size` bytes (rounded up to the object alignment) in `space`.
    ///
    /// New-space requests escalate: young bump, scavenge, young bump again,
    /// then old space. Requests too large for a normal page skip the young
    /// generation entirely. `roots` must cover every live reference the
    /// caller holds, since a scavenge may move objects.
    ///
    /// The memory is zeroed but holds no object yet. The caller must write a
    /// header (see [`initialize_object`]) before the next allocation or
    /// collection, or the next heap walk will trip over it.
    pub fn allocate(
        &mut self,
        size: usize,
        space: Space,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Address> {
        let out_of_memory = |requested| {
            log::warn!("out of memory: {requested} bytes in {space:?} space");
            HeapError::OutOfMemory { space, requested }
        };
        let Some(rounded) = checked_round_up(size.max(WORD_SIZE), self.settings.object_alignment)
        else {
            return Err(out_of_memory(size));
        };
        let result = match space {
            Space::New => self.allocate_new(rounded, roots),
            Space::Old => self.old_space.try_allocate(rounded),
            Space::Code => self.code_space.try_allocate(rounded),
        };
        result.ok_or_else(|| out_of_memory(rounded))
    }

    fn allocate_new(&mut self, size: usize, roots: &mut dyn RootProvider) -> Option<Address> {
        if !self.old_space.is_page_allocatable_size(size) {
            log::trace!("{size} bytes bypass new space");
            return self.old_space.try_allocate(size);
        }
        if self.settings.gc_at_alloc {
            self.collect_garbage(roots);
        }
        if let Some(addr) = self.new_space.try_allocate(size) {
            return Some(addr);
        }
        self.allocate_new_slow(size, roots)
    }

    #[cold]
    fn allocate_new_slow(&mut self, size: usize, roots: &mut dyn RootProvider) -> Option<Address> {
        self.collect_garbage(roots);
        if let Some(addr) = self.new_space.try_allocate(size) {
            return Some(addr);
        }
        log::debug!("new space full after scavenge, allocating {size} bytes in old space");
        self.old_space.try_allocate(size)
    }

    /// Allocates and initializes an object with nulled fields.
    pub fn allocate_object(
        &mut self,
        kind: ObjectKind,
        class_id: u16,
        length: usize,
        space: Space,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<RawObject> {
        let length = u32::try_from(length)
            .map_err(|_| HeapError::InvalidArgument("object length exceeds 32 bits"))?;
        let header = Header::new(kind, class_id, length);
        let size = header.size(self.settings.object_alignment);
        let addr = self.allocate(size, space, roots)?;
        // SAFETY: fresh allocation of `size` bytes
        Ok(unsafe { initialize_object(addr, header, size) })
    }

    /// Runs one scavenge of the young generation.
    pub fn collect_garbage(&mut self, roots: &mut dyn RootProvider) -> ScavengeStats {
        let stats = self
            .new_space
            .scavenge(roots, &mut self.old_space, &self.code_space);
        self.last_scavenge = Some(stats);
        if self.settings.verify_after_gc
            && let Err(err) = verifier::verify(self)
        {
            panic!("heap verification failed after scavenge #{}: {err}", stats.cycle);
        }
        stats
    }

    /// True iff `addr` lies in to-space or any old or code page.
    pub fn contains(&self, addr: Address) -> bool {
        self.space_of(addr).is_some()
    }

    pub fn space_of(&self, addr: Address) -> Option<Space> {
        if self.new_space.contains(addr) {
            Some(Space::New)
        } else if self.old_space.contains(addr) {
            Some(Space::Old)
        } else if self.code_space.contains(addr) {
            Some(Space::Code)
        } else {
            None
        }
    }

    /// Walks every live region: to-space, old pages, code pages.
    pub fn visit_object_pointers(&mut self, visitor: &mut dyn ObjectPointerVisitor) {
        self.new_space.visit_object_pointers(visitor);
        self.old_space.visit_object_pointers(visitor);
        self.code_space.visit_object_pointers(visitor);
    }

    pub fn in_use(&self, space: Space) -> usize {
        match space {
            Space::New => self.new_space.in_use(),
            Space::Old => self.old_space.in_use(),
            Space::Code => self.code_space.in_use(),
        }
    }

    pub fn capacity(&self, space: Space) -> usize {
        match space {
            Space::New => self.new_space.capacity(),
            Space::Old => self.old_space.capacity(),
            Space::Code => self.code_space.capacity(),
        }
    }

    /// Address of the young `top` word for generated code.
    pub fn top_address(&self) -> *mut Address {
        self.new_space.cursor().top_ptr()
    }

    /// Address of the young `end` word for generated code.
    pub fn end_address(&self) -> *mut Address {
        self.new_space.cursor().end_ptr()
    }

    pub fn cursor(&self) -> &BumpCursor {
        self.new_space.cursor()
    }

    pub fn new_space(&self) -> &Scavenger {
        &self.new_space
    }

    pub fn old_space(&self) -> &PageSpace {
        &self.old_space
    }

    pub fn code_space(&self) -> &PageSpace {
        &self.code_space
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn last_scavenge(&self) -> Option<ScavengeStats> {
        self.last_scavenge
    }

    #[inline(always)]
    pub fn object_alignment(&self) -> usize {
        self.settings.object_alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Value, fields, visitor::NoRoots};

    const KB: usize = 1024;

    fn small_settings() -> HeapSettings {
        HeapSettings {
            new_space_size: 128 * KB,
            old_space_max: 1024 * KB,
            code_space_max: 128 * KB,
            page_size: 64 * KB,
            ..Default::default()
        }
    }

    #[test]
    fn default_settings_are_valid() {
        assert_eq!(HeapSettings::default().validate(), Ok(()));
    }

    #[test]
    fn bad_settings_are_rejected() {
        let cases = [
            HeapSettings { page_size: 3 * OS_PAGE_SIZE, ..Default::default() },
            HeapSettings { object_alignment: 4, ..Default::default() },
            HeapSettings { new_space_size: OS_PAGE_SIZE, ..Default::default() },
            HeapSettings { old_space_max: OS_PAGE_SIZE, ..Default::default() },
        ];
        for settings in cases {
            assert!(
                matches!(settings.validate(), Err(HeapError::InvalidSettings(_))),
                "{settings:?} should be invalid"
            );
            assert!(Heap::new(settings).is_err());
        }
    }

    #[test]
    fn new_allocations_land_in_new_space() {
        let mut heap = Heap::new(small_settings()).expect("heap");
        let addr = heap.allocate(24, Space::New, &mut NoRoots).expect("allocate");
        assert_eq!(heap.space_of(addr), Some(Space::New));
        assert_eq!(heap.in_use(Space::New), 32, "rounded to alignment");
    }

    #[test]
    fn oversized_new_requests_go_to_old_space() {
        let mut heap = Heap::new(small_settings()).expect("heap");
        let addr = heap
            .allocate(64 * KB, Space::New, &mut NoRoots)
            .expect("large allocation");
        assert_eq!(heap.space_of(addr), Some(Space::Old));
        assert_eq!(heap.old_space().large_pages().count(), 1);
    }

    #[test]
    fn full_new_space_triggers_a_scavenge() {
        let mut heap = Heap::new(small_settings()).expect("heap");
        let mut roots: Vec<Value> = vec![];
        while heap.new_space().top() + 16 <= heap.new_space().end() {
            heap.allocate(16, Space::New, &mut roots).expect("fill");
        }
        assert_eq!(heap.new_space().collections(), 0);
        let addr = heap.allocate(16, Space::New, &mut roots).expect("after scavenge");
        assert_eq!(heap.new_space().collections(), 1);
        assert_eq!(addr, heap.new_space().first_object_start());
    }

    #[test]
    fn live_young_data_overflows_into_old_space() {
        let mut heap = Heap::new(small_settings()).expect("heap");
        let mut roots: Vec<Value> = vec![];
        // keep everything alive so scavenging frees nothing
        while heap.new_space().top() + 32 <= heap.new_space().end() {
            let obj = heap
                .allocate_object(ObjectKind::Array, 0, 1, Space::New, &mut roots)
                .expect("fill");
            roots.push(obj.to_value());
        }
        let obj = heap
            .allocate_object(ObjectKind::Array, 0, 1, Space::New, &mut roots)
            .expect("overflow");
        assert_eq!(heap.space_of(obj.addr()), Some(Space::Old));
        assert!(roots.iter().all(|root| heap.contains(root.addr())));
    }

    #[test]
    fn exhausted_old_space_reports_out_of_memory() {
        let mut heap = Heap::new(small_settings()).expect("heap");
        let page_data = 64 * KB - HeapPage::HEADER_SIZE;
        for _ in 0..16 {
            heap.allocate(page_data, Space::Old, &mut NoRoots).expect("page");
        }
        let err = heap.allocate(16, Space::Old, &mut NoRoots).unwrap_err();
        assert_eq!(
            err,
            HeapError::OutOfMemory {
                space: Space::Old,
                requested: 16
            }
        );
    }

    #[test]
    fn unrepresentable_sizes_are_out_of_memory() {
        let mut heap = Heap::new(small_settings()).expect("heap");
        for space in [Space::New, Space::Old, Space::Code] {
            let err = heap.allocate(usize::MAX - 8, space, &mut NoRoots).unwrap_err();
            assert_eq!(
                err,
                HeapError::OutOfMemory {
                    space,
                    requested: usize::MAX - 8
                }
            );
        }
        assert_eq!(heap.in_use(Space::New), 0);
        assert_eq!(heap.capacity(Space::Old), 0);
    }

    #[test]
    fn exhausted_generations_report_the_young_space() {
        let settings = HeapSettings {
            old_space_max: 64 * KB,
            ..small_settings()
        };
        let mut heap = Heap::new(settings).expect("heap");
        let mut roots: Vec<Value> = vec![];
        let err = loop {
            assert!(roots.len() < 100_000, "both generations should fill up");
            match heap.allocate_object(ObjectKind::Array, 0, 1, Space::New, &mut roots) {
                Ok(obj) => roots.push(obj.to_value()),
                Err(err) => break err,
            }
        };
        assert_eq!(
            err,
            HeapError::OutOfMemory {
                space: Space::New,
                requested: 32
            }
        );
        assert!(heap.old_space().in_use() > 0, "survivors were promoted first");
        assert!(roots.iter().all(|root| heap.contains(root.addr())));
    }

    #[test]
    fn code_allocations_are_executable() {
        let mut heap = Heap::new(small_settings()).expect("heap");
        let addr = heap.allocate(100, Space::Code, &mut NoRoots).expect("code");
        assert_eq!(heap.space_of(addr), Some(Space::Code));
        assert!(heap.code_space().is_executable());
    }

    #[test]
    fn gc_at_alloc_scavenges_every_time() {
        let settings = HeapSettings {
            gc_at_alloc: true,
            ..small_settings()
        };
        let mut heap = Heap::new(settings).expect("heap");
        let mut roots: Vec<Value> = vec![];
        let first = heap
            .allocate_object(ObjectKind::Array, 0, 1, Space::New, &mut roots)
            .expect("first");
        first.set_field(fields::ARRAY_DATA, Value::from_i64(1));
        roots.push(first.to_value());
        heap.allocate(16, Space::New, &mut roots).expect("second");
        assert_eq!(heap.new_space().collections(), 2);
        // SAFETY: the root was updated by the scavenge
        let moved = unsafe { RawObject::from_value(roots[0]) };
        assert_eq!(moved.field(fields::ARRAY_DATA), Value::from_i64(1));
    }

    #[test]
    fn verification_runs_after_each_scavenge() {
        let settings = HeapSettings {
            verify_after_gc: true,
            ..small_settings()
        };
        let mut heap = Heap::new(settings).expect("heap");
        let mut roots: Vec<Value> = vec![];
        let obj = heap
            .allocate_object(ObjectKind::Context, 0, 2, Space::New, &mut roots)
            .expect("context");
        roots.push(obj.to_value());
        let stats = heap.collect_garbage(&mut roots);
        assert_eq!(stats.survivors, 1);
        assert_eq!(heap.last_scavenge(), Some(stats));
    }

    #[test]
    fn top_and_end_addresses_track_the_cursor() {
        let mut heap = Heap::new(small_settings()).expect("heap");
        heap.allocate(48, Space::New, &mut NoRoots).expect("allocate");
        // SAFETY: addresses of the live cursor
        unsafe {
            assert_eq!(*heap.top_address(), heap.new_space().top());
            assert_eq!(*heap.end_address(), heap.new_space().end());
        }
    }
}
