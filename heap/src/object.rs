//! Object header and layout descriptors.
//!
//! Every heap object starts with one header word:
//!
//! ```text
//! bits 0..2:   tag   0b11 live header, 0b10 forwarded
//! bits 2..8:   kind  ObjectKind
//! bits 8..16:  age   scavenges survived
//! bits 16..32: class id
//! bits 32..64: length (elements, variables, fields or bytes)
//! ```
//!
//! A forwarded header holds the address of the new copy instead. Decoding a
//! header therefore yields a [`HeaderState`] rather than a plain [`Header`].

use std::ptr;

use crate::{Address, ObjectPointerVisitor, Value, WORD_SIZE, value::round_up};

const TAG_MASK: u64 = 0b11;
const LIVE_TAG: u64 = 0b11;
const FORWARDED_TAG: u64 = 0b10;

const KIND_SHIFT: u32 = 2;
const KIND_MASK: u64 = 0x3f;
const AGE_SHIFT: u32 = 8;
const AGE_MASK: u64 = 0xff;
const CLASS_SHIFT: u32 = 16;
const CLASS_MASK: u64 = 0xffff;
const LENGTH_SHIFT: u32 = 32;

/// Field indices, counted in words after the header.
pub mod fields {
    pub const ARRAY_TYPE_ARGUMENTS: usize = 0;
    pub const ARRAY_DATA: usize = 1;

    pub const CONTEXT_PARENT: usize = 0;
    pub const CONTEXT_VARIABLES: usize = 1;

    pub const TYPE_ARGUMENTS_UNINSTANTIATED: usize = 0;
    pub const TYPE_ARGUMENTS_INSTANTIATOR: usize = 1;

    pub const CLOSURE_FUNCTION: usize = 0;
    pub const CLOSURE_CONTEXT: usize = 1;
    pub const CLOSURE_TYPE_ARGUMENTS: usize = 2;
}

/// The closed set of object shapes the heap knows how to size and walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Array = 0,
    Context,
    Instance,
    TypeArguments,
    Closure,
    Bytes,
}

impl ObjectKind {
    pub const COUNT: usize = Self::Bytes as usize + 1;

    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::Array,
            1 => Self::Context,
            2 => Self::Instance,
            3 => Self::TypeArguments,
            4 => Self::Closure,
            5 => Self::Bytes,
            _ => return None,
        })
    }

    #[inline]
    pub const fn layout(self) -> ObjectLayout {
        match self {
            Self::Array => ObjectLayout::new(1, Variable::Pointers),
            Self::Context => ObjectLayout::new(1, Variable::Pointers),
            Self::Instance => ObjectLayout::new(0, Variable::Pointers),
            Self::TypeArguments => ObjectLayout::new(2, Variable::None),
            Self::Closure => ObjectLayout::new(3, Variable::None),
            Self::Bytes => ObjectLayout::new(0, Variable::Bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    None,
    Pointers,
    Bytes,
}

/// Size and pointer map of one object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout {
    /// Pointer words that every instance carries after the header.
    pub fixed_pointers: usize,
    /// What the header's length counts.
    pub variable: Variable,
}

impl ObjectLayout {
    const fn new(fixed_pointers: usize, variable: Variable) -> Self {
        Self {
            fixed_pointers,
            variable,
        }
    }

    #[inline]
    pub const fn pointer_count(&self, length: usize) -> usize {
        match self.variable {
            Variable::Pointers => self.fixed_pointers + length,
            Variable::None | Variable::Bytes => self.fixed_pointers,
        }
    }

    /// Unrounded byte size of an object with `length`.
    #[inline]
    pub const fn raw_size(&self, length: usize) -> usize {
        let bytes = match self.variable {
            Variable::Bytes => length,
            Variable::None | Variable::Pointers => 0,
        };
        WORD_SIZE + self.pointer_count(length) * WORD_SIZE + bytes
    }

    #[inline]
    pub const fn instance_size(&self, length: usize, alignment: usize) -> usize {
        round_up(self.raw_size(length), alignment)
    }
}

/// A decoded live header word.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(u64);

impl Header {
    pub fn new(kind: ObjectKind, class_id: u16, length: u32) -> Self {
        Self(
            LIVE_TAG
                | ((kind as u64) << KIND_SHIFT)
                | ((class_id as u64) << CLASS_SHIFT)
                | ((length as u64) << LENGTH_SHIFT),
        )
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn kind(self) -> ObjectKind {
        let bits = ((self.0 >> KIND_SHIFT) & KIND_MASK) as u8;
        ObjectKind::from_bits(bits).unwrap_or_else(|| {
            panic!("corrupt header 0x{:016x}", self.0)
        })
    }

    #[inline(always)]
    pub const fn age(self) -> u8 {
        ((self.0 >> AGE_SHIFT) & AGE_MASK) as u8
    }

    #[inline(always)]
    pub const fn with_age(self, age: u8) -> Self {
        Self((self.0 & !(AGE_MASK << AGE_SHIFT)) | ((age as u64) << AGE_SHIFT))
    }

    #[inline(always)]
    pub const fn class_id(self) -> u16 {
        ((self.0 >> CLASS_SHIFT) & CLASS_MASK) as u16
    }

    #[inline(always)]
    pub const fn length(self) -> usize {
        (self.0 >> LENGTH_SHIFT) as usize
    }

    #[inline]
    pub fn size(self, alignment: usize) -> usize {
        self.kind().layout().instance_size(self.length(), alignment)
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("kind", &self.kind())
            .field("class_id", &self.class_id())
            .field("length", &self.length())
            .field("age", &self.age())
            .finish()
    }
}

/// What the first word of an object currently says about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    Live(Header),
    Forwarded(Address),
}

impl HeaderState {
    #[inline(always)]
    pub fn decode(word: u64) -> Self {
        match word & TAG_MASK {
            LIVE_TAG => Self::Live(Header(word)),
            FORWARDED_TAG => Self::Forwarded((word & !TAG_MASK) as Address),
            _ => panic!("not a header word: 0x{word:016x}"),
        }
    }

    #[inline(always)]
    pub fn encode(self) -> u64 {
        match self {
            Self::Live(header) => header.raw(),
            Self::Forwarded(addr) => {
                debug_assert!(addr as u64 & TAG_MASK == 0);
                addr as u64 | FORWARDED_TAG
            }
        }
    }
}

/// An untagged view of an object in managed memory.
///
/// Constructing one is unsafe; once constructed, accessors trust that the
/// address points at an initialized object inside a live space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawObject(Address);

impl RawObject {
    /// # Safety
    /// `addr` must point at an object whose header word has been written and
    /// whose memory stays mapped while the view is used.
    #[inline(always)]
    pub unsafe fn from_addr(addr: Address) -> Self {
        debug_assert!(addr != 0 && addr.is_multiple_of(WORD_SIZE));
        Self(addr)
    }

    /// # Safety
    /// see [`RawObject::from_addr`]; `value` must be a heap reference.
    #[inline(always)]
    pub unsafe fn from_value(value: Value) -> Self {
        debug_assert!(value.is_heap_object());
        // SAFETY: forwarded to caller
        unsafe { Self::from_addr(value.addr()) }
    }

    #[inline(always)]
    pub fn addr(self) -> Address {
        self.0
    }

    #[inline(always)]
    pub fn to_value(self) -> Value {
        Value::from_addr(self.0)
    }

    #[inline(always)]
    pub fn header_state(self) -> HeaderState {
        // SAFETY: contract of from_addr
        HeaderState::decode(unsafe { ptr::read(self.0 as *const u64) })
    }

    #[inline(always)]
    pub fn set_header_state(self, state: HeaderState) {
        // SAFETY: contract of from_addr
        unsafe { ptr::write(self.0 as *mut u64, state.encode()) }
    }

    /// The live header. Panics on a forwarded object.
    #[inline]
    pub fn header(self) -> Header {
        match self.header_state() {
            HeaderState::Live(header) => header,
            HeaderState::Forwarded(to) => {
                panic!("object 0x{:x} was forwarded to 0x{to:x}", self.0)
            }
        }
    }

    #[inline]
    pub fn size(self, alignment: usize) -> usize {
        self.header().size(alignment)
    }

    #[inline]
    fn pointer_count(self) -> usize {
        let header = self.header();
        header.kind().layout().pointer_count(header.length())
    }

    #[inline]
    pub fn field(self, index: usize) -> Value {
        debug_assert!(index < self.pointer_count(), "field {index} out of range");
        // SAFETY: index is inside the object's pointer area
        unsafe { ptr::read(self.slot(index)) }
    }

    #[inline]
    pub fn set_field(self, index: usize, value: Value) {
        debug_assert!(index < self.pointer_count(), "field {index} out of range");
        // SAFETY: index is inside the object's pointer area
        unsafe { ptr::write(self.slot(index), value) }
    }

    #[inline(always)]
    fn slot(self, index: usize) -> *mut Value {
        (self.0 + WORD_SIZE + index * WORD_SIZE) as *mut Value
    }

    /// The raw payload of a `Bytes` object.
    pub fn bytes(&self) -> &[u8] {
        let header = self.header();
        debug_assert_eq!(header.kind(), ObjectKind::Bytes);
        // SAFETY: bytes follow the header for Bytes objects
        unsafe {
            std::slice::from_raw_parts(
                (self.0 + WORD_SIZE) as *const u8,
                header.length(),
            )
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let header = self.header();
        debug_assert_eq!(header.kind(), ObjectKind::Bytes);
        // SAFETY: bytes follow the header for Bytes objects
        unsafe {
            std::slice::from_raw_parts_mut(
                (self.0 + WORD_SIZE) as *mut u8,
                header.length(),
            )
        }
    }

    /// Offers every pointer field to `visitor` and returns the object size.
    pub fn visit_pointers(
        self,
        alignment: usize,
        visitor: &mut dyn ObjectPointerVisitor,
    ) -> usize {
        let header = self.header();
        let count = header.kind().layout().pointer_count(header.length());
        if count > 0 {
            // SAFETY: the pointer area is `count` initialized words
            let slots = unsafe {
                std::slice::from_raw_parts_mut(self.slot(0), count)
            };
            visitor.visit_pointers(slots);
        }
        header.size(alignment)
    }
}

/// Writes `header` at `addr` and fills the rest of `size` bytes with nulls
/// (pointer kinds) or zero bytes (`Bytes`).
///
/// # Safety
/// `[addr, addr + size)` must be freshly allocated memory owned by the caller.
pub unsafe fn initialize_object(addr: Address, header: Header, size: usize) -> RawObject {
    debug_assert!(size >= header.size(WORD_SIZE));
    // SAFETY: caller owns the range
    unsafe {
        ptr::write(addr as *mut u64, header.raw());
        let body = (addr + WORD_SIZE) as *mut u8;
        let body_len = size - WORD_SIZE;
        match header.kind().layout().variable {
            Variable::Bytes => ptr::write_bytes(body, 0, body_len),
            Variable::None | Variable::Pointers => {
                let words = body as *mut Value;
                for index in 0..body_len / WORD_SIZE {
                    ptr::write(words.add(index), Value::NULL);
                }
            }
        }
        RawObject::from_addr(addr)
    }
}

/// Walks the objects laid out back to back in `[start, end)`.
///
/// # Safety
/// The range must contain only initialized live objects.
pub unsafe fn visit_range(
    start: Address,
    end: Address,
    alignment: usize,
    visitor: &mut dyn ObjectPointerVisitor,
) {
    let mut cursor = start;
    while cursor < end {
        // SAFETY: forwarded to caller
        let obj = unsafe { RawObject::from_addr(cursor) };
        cursor += obj.visit_pointers(alignment, visitor);
    }
    debug_assert_eq!(cursor, end, "object walk overran its range");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_survive_encoding() {
        let header = Header::new(ObjectKind::Instance, 513, 7);
        assert_eq!(header.kind(), ObjectKind::Instance);
        assert_eq!(header.class_id(), 513);
        assert_eq!(header.length(), 7);
        assert_eq!(header.age(), 0);

        let older = header.with_age(3);
        assert_eq!(older.age(), 3);
        assert_eq!(older.class_id(), 513);
        assert_eq!(older.length(), 7);
    }

    #[test]
    fn forwarding_is_distinct_from_live_headers() {
        let live = HeaderState::Live(Header::new(ObjectKind::Array, 0, 2));
        let forwarded = HeaderState::Forwarded(0x7f00_0040);
        assert_eq!(HeaderState::decode(live.encode()), live);
        assert_eq!(HeaderState::decode(forwarded.encode()), forwarded);
        assert_ne!(live.encode() & 0b11, forwarded.encode() & 0b11);
    }

    #[test]
    fn sizes_are_rounded_to_alignment() {
        let array = ObjectKind::Array.layout();
        // header + type arguments + 3 elements = 5 words
        assert_eq!(array.raw_size(3), 40);
        assert_eq!(array.instance_size(3, 16), 48);

        let closure = ObjectKind::Closure.layout();
        assert_eq!(closure.instance_size(0, 16), 32);

        let bytes = ObjectKind::Bytes.layout();
        assert_eq!(bytes.pointer_count(100), 0);
        assert_eq!(bytes.instance_size(9, 16), 32);
    }

    #[test]
    fn initialized_objects_are_null_filled() {
        let mut memory = vec![0xffu64; 8];
        let addr = memory.as_mut_ptr() as Address;
        let header = Header::new(ObjectKind::Context, 0, 2);
        let size = header.size(16);
        // SAFETY: the vector backs the whole object
        let obj = unsafe { initialize_object(addr, header, size) };

        assert_eq!(obj.header(), header);
        assert_eq!(obj.field(fields::CONTEXT_PARENT), Value::NULL);
        assert_eq!(obj.field(fields::CONTEXT_VARIABLES + 1), Value::NULL);
        obj.set_field(fields::CONTEXT_VARIABLES, Value::from_i64(9));
        assert_eq!(obj.field(fields::CONTEXT_VARIABLES), Value::from_i64(9));
    }

    #[test]
    fn visiting_offers_only_pointer_fields() {
        let mut memory = vec![0u64; 16];
        let base = memory.as_mut_ptr() as Address;
        let array = Header::new(ObjectKind::Array, 0, 2);
        let bytes = Header::new(ObjectKind::Bytes, 0, 16);
        let array_size = array.size(16);
        let bytes_size = bytes.size(16);
        // SAFETY: the vector backs both objects
        unsafe {
            initialize_object(base, array, array_size);
            initialize_object(base + array_size, bytes, bytes_size);
        }

        let mut seen = 0;
        let mut count = |_: &mut Value| seen += 1;
        // SAFETY: the range holds exactly the two objects above
        unsafe { visit_range(base, base + array_size + bytes_size, 16, &mut count) };
        assert_eq!(seen, 3, "type arguments and two elements");
    }

    #[test]
    #[should_panic(expected = "was forwarded")]
    fn reading_a_forwarded_header_panics() {
        let mut memory = vec![0u64; 4];
        let addr = memory.as_mut_ptr() as Address;
        // SAFETY: the vector backs the object
        let obj = unsafe {
            initialize_object(addr, Header::new(ObjectKind::Closure, 0, 0), 32)
        };
        obj.set_header_state(HeaderState::Forwarded(0x1000));
        let _ = obj.header();
    }
}
