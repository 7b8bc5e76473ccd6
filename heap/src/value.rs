/// A raw machine address inside (or outside) the managed heap.
pub type Address = usize;

pub const WORD_SIZE: usize = size_of::<u64>();

/// Tag constants.
const FIXNUM_MASK: u64 = 0b1;
const TAG_MASK: u64 = 0b11;
const REF_TAG: u64 = 0b01;

/// A tagged 64-bit value as stored in roots and object fields.
///
/// Encoding:
/// - **Fixnum**:    `...XXXXX0` 63-bit signed integer (low bit 0).
/// - **Reference**: `...XXXX01` heap pointer (mask low 2 bits).
/// - **Null**:      the reference to address 0. No space ever contains it,
///   so the collector leaves it alone like any immediate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    pub const NULL: Self = Self(REF_TAG);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // ── Fixnum ─────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_MASK == 0
    }

    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        debug_assert!(
            (-(1i64 << 62)..(1i64 << 62)).contains(&n),
            "fixnum overflow: {n}"
        );
        Self((n << 1) as u64)
    }

    /// Returns the integer if this is a fixnum.
    #[inline(always)]
    pub const fn as_i64(self) -> Option<i64> {
        if self.is_fixnum() {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    // ── Reference ──────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.0 & TAG_MASK == REF_TAG
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == REF_TAG
    }

    /// True for references that point at an actual object.
    #[inline(always)]
    pub const fn is_heap_object(self) -> bool {
        self.is_ref() && !self.is_null()
    }

    #[inline(always)]
    pub fn from_addr(addr: Address) -> Self {
        debug_assert!(addr as u64 & TAG_MASK == 0, "address not aligned");
        Self(addr as u64 | REF_TAG)
    }

    /// Untagged address of a reference.
    #[inline(always)]
    pub const fn addr(self) -> Address {
        (self.0 & !TAG_MASK) as Address
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::NULL
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(n) = self.as_i64() {
            write!(f, "Fixnum({n})")
        } else if self.is_null() {
            write!(f, "Null")
        } else if self.is_ref() {
            write!(f, "Ref(0x{:x})", self.addr())
        } else {
            write!(f, "Raw(0x{:016x})", self.0)
        }
    }
}

/// Rounds `size` up to the next multiple of `alignment` (a power of two).
#[inline(always)]
pub const fn round_up(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

/// Like [`round_up`], but `None` when the result does not fit a `usize`.
#[inline(always)]
pub const fn checked_round_up(size: usize, alignment: usize) -> Option<usize> {
    match size.checked_add(alignment - 1) {
        Some(padded) => Some(padded & !(alignment - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixnums_round_trip_through_the_tag() {
        for n in [0i64, 1, -1, 42, -(1 << 61), (1 << 61) - 1] {
            let v = Value::from_i64(n);
            assert!(v.is_fixnum());
            assert!(!v.is_ref());
            assert_eq!(v.as_i64(), Some(n));
        }
    }

    #[test]
    fn null_is_a_reference_without_an_object() {
        assert!(Value::NULL.is_ref());
        assert!(Value::NULL.is_null());
        assert!(!Value::NULL.is_heap_object());
        assert_eq!(Value::NULL.addr(), 0);
        assert_eq!(Value::default(), Value::NULL);
    }

    #[test]
    fn references_keep_their_address() {
        let v = Value::from_addr(0x1000);
        assert!(v.is_heap_object());
        assert_eq!(v.addr(), 0x1000);
        assert_eq!(v.as_i64(), None);
    }

    #[test]
    fn round_up_aligns_sizes() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 16), 32);
    }

    #[test]
    fn checked_round_up_detects_overflow() {
        assert_eq!(checked_round_up(17, 16), Some(32));
        assert_eq!(checked_round_up(usize::MAX - 15, 16), Some(usize::MAX - 15));
        assert_eq!(checked_round_up(usize::MAX - 8, 16), None);
    }
}
