//! Heap verification.
//!
//! Walks to-space and every old and code page, checking that each object
//! header is live and that every reference lands on a live object inside a
//! live space.

use thiserror::Error;

use crate::{
    Address, Value,
    heap::Heap,
    object::{self, HeaderState, RawObject},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("object at 0x{0:x} still carries a forwarding header")]
    Forwarded(Address),

    #[error("object at 0x{object:x} references from-space address 0x{target:x}")]
    FromSpaceReference { object: Address, target: Address },

    #[error("object at 0x{object:x} references 0x{target:x} outside every space")]
    DanglingReference { object: Address, target: Address },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyStats {
    pub objects: usize,
    pub references: usize,
}

pub fn verify(heap: &Heap) -> Result<VerifyStats, VerifyError> {
    let new_space = heap.new_space();
    let alignment = heap.object_alignment();
    let mut ranges = vec![(new_space.first_object_start(), new_space.top())];
    ranges.extend(heap.old_space().object_ranges());
    ranges.extend(heap.code_space().object_ranges());

    let mut stats = VerifyStats::default();
    for (start, end) in ranges {
        let mut cursor = start;
        while cursor < end {
            // SAFETY: ranges cover only allocated objects
            let obj = unsafe { RawObject::from_addr(cursor) };
            if let HeaderState::Forwarded(_) = obj.header_state() {
                return Err(VerifyError::Forwarded(cursor));
            }
            let mut failure = None;
            let mut check = |slot: &mut Value| {
                if failure.is_some() || !slot.is_heap_object() {
                    return;
                }
                stats.references += 1;
                failure = check_reference(heap, cursor, slot.addr()).err();
            };
            let size = obj.visit_pointers(alignment, &mut check);
            if let Some(err) = failure {
                return Err(err);
            }
            stats.objects += 1;
            cursor += size;
        }
    }
    log::trace!(
        "verified {} objects, {} references",
        stats.objects,
        stats.references
    );
    Ok(stats)
}

fn check_reference(heap: &Heap, object: Address, target: Address) -> Result<(), VerifyError> {
    let new_space = heap.new_space();
    let live_young = new_space.to_space().contains(target) && target < new_space.top();
    if new_space.from_space().contains(target) {
        return Err(VerifyError::FromSpaceReference { object, target });
    }
    if !live_young && !heap.old_space().contains(target) && !heap.code_space().contains(target)
    {
        return Err(VerifyError::DanglingReference { object, target });
    }
    // SAFETY: target lies in a live space
    let state = unsafe { RawObject::from_addr(target) }.header_state();
    match state {
        HeaderState::Live(_) => Ok(()),
        HeaderState::Forwarded(_) => Err(VerifyError::Forwarded(target)),
    }
}

/// Counts objects per kind in the live spaces.
pub fn census(heap: &Heap) -> [usize; object::ObjectKind::COUNT] {
    let mut counts = [0; object::ObjectKind::COUNT];
    let new_space = heap.new_space();
    let alignment = heap.object_alignment();
    let mut ranges = vec![(new_space.first_object_start(), new_space.top())];
    ranges.extend(heap.old_space().object_ranges());
    ranges.extend(heap.code_space().object_ranges());
    for (start, end) in ranges {
        let mut cursor = start;
        while cursor < end {
            // SAFETY: ranges cover only allocated objects
            let header = unsafe { RawObject::from_addr(cursor) }.header();
            counts[header.kind() as usize] += 1;
            cursor += header.size(alignment);
        }
    }
    counts
}
