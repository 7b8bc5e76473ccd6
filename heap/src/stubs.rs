//! Inline allocation fast paths.
//!
//! An [`AllocationStub`] is the allocation sequence a compiler would emit at
//! one site: read `top`, add the rounded size, compare against `end`, commit
//! and initialize. It talks to the heap only through an
//! [`InlineAllocationInterface`]. Whenever the capacity check fails, the size
//! is not young-allocatable, or inline allocation is switched off, the stub
//! calls its [`RuntimeEntry`] instead, which produces the same result shape.

use std::{cell::Cell, ptr};

use crate::{
    Address, HeapError, HeapResult, ObjectKind, Value, WORD_SIZE,
    fields,
    heap::Heap,
    isolate::Isolate,
    object::Header,
    object_store::{ARRAY_CID, CLOSURE_CID, CONTEXT_CID, ClassId, TYPE_ARGUMENTS_CID},
    pages::HeapPage,
    runtime::RuntimeEntry,
};

/// Instances below this many words are initialized with one straight-line
/// copy; larger ones with a loop.
pub const INLINE_INSTANCE_WORDS: usize = 12;

static NULL_WORDS: [Value; INLINE_INSTANCE_WORDS] = [Value::NULL; INLINE_INSTANCE_WORDS];

/// What generated code may know about the young generation.
#[derive(Debug, Clone, Copy)]
pub struct InlineAllocationInterface {
    top: *mut Address,
    end: *const Address,
    object_alignment: usize,
    /// Largest size the old generation accepts on a normal page; anything
    /// bigger must not be bump-allocated young.
    max_object_size: usize,
    slow_path: RuntimeEntry,
}

impl InlineAllocationInterface {
    pub fn new(heap: &Heap, slow_path: RuntimeEntry) -> Self {
        Self {
            top: heap.top_address(),
            end: heap.end_address(),
            object_alignment: heap.object_alignment(),
            max_object_size: heap.old_space().page_size() - HeapPage::HEADER_SIZE,
            slow_path,
        }
    }

    #[inline(always)]
    pub fn top_address(&self) -> *mut Address {
        self.top
    }

    #[inline(always)]
    pub fn end_address(&self) -> *const Address {
        self.end
    }

    #[inline(always)]
    pub fn object_alignment(&self) -> usize {
        self.object_alignment
    }

    #[inline(always)]
    pub fn slow_path(&self) -> RuntimeEntry {
        self.slow_path
    }

    #[inline(always)]
    pub fn round(&self, size: usize) -> usize {
        (size + self.object_alignment - 1) & !(self.object_alignment - 1)
    }

    /// Compare-and-bump against the cached `top`/`end`.
    ///
    /// # Safety
    /// The heap this interface was created from must still be alive, and no
    /// scavenge may be running.
    #[inline(always)]
    unsafe fn try_bump(&self, size: usize) -> Option<Address> {
        // SAFETY: caller guarantees the cursor is live
        unsafe {
            let top = *self.top;
            if *self.end - top < size {
                return None;
            }
            *self.top = top + size;
            Some(top)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureKind {
    /// Closes over the current context.
    Regular,
    /// Closes over the shared empty context.
    StaticImplicit,
    /// Closes over a fresh one-variable context holding the receiver.
    Implicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StubKind {
    Array,
    Context,
    Instance {
        class_id: ClassId,
        num_fields: usize,
        type_arguments_field: Option<usize>,
    },
    Closure(ClosureKind),
}

/// One allocation site.
///
/// Arguments by kind:
/// - array: `(length, element_type)`
/// - context: `(num_variables)`
/// - instance: `(type_arguments, instantiator)` if generic, else `()`
/// - closure: `(function)`, or `(function, receiver)` for implicit closures
#[derive(Debug)]
pub struct AllocationStub {
    kind: StubKind,
    interface: InlineAllocationInterface,
    inline: bool,
    fast_hits: Cell<usize>,
    slow_calls: Cell<usize>,
}

impl AllocationStub {
    fn generate(kind: StubKind, heap: &Heap, slow_path: RuntimeEntry, fits: bool) -> Self {
        let settings = heap.settings();
        Self {
            kind,
            interface: InlineAllocationInterface::new(heap, slow_path),
            // forced scavenges only happen on the slow path
            inline: settings.inline_alloc && !settings.gc_at_alloc && fits,
            fast_hits: Cell::new(0),
            slow_calls: Cell::new(0),
        }
    }

    pub fn array(heap: &Heap) -> Self {
        Self::generate(StubKind::Array, heap, RuntimeEntry::AllocateArray, true)
    }

    pub fn context(heap: &Heap) -> Self {
        Self::generate(StubKind::Context, heap, RuntimeEntry::AllocateContext, true)
    }

    /// A stub for instances of `class_id`. The fast path is only generated
    /// when the instance plus its type-arguments record fits a normal page.
    pub fn instance(isolate: &Isolate, class_id: ClassId) -> HeapResult<Self> {
        let class = isolate
            .object_store()
            .class_table
            .get(class_id)
            .ok_or(HeapError::InvalidArgument("unknown class"))?;
        let heap = isolate.heap();
        let alignment = heap.object_alignment();
        let total = class.instance_size(alignment) + type_arguments_size(alignment);
        let fits = heap.old_space().is_page_allocatable_size(total);
        let kind = StubKind::Instance {
            class_id,
            num_fields: class.num_fields,
            type_arguments_field: class.type_arguments_field,
        };
        Ok(Self::generate(kind, heap, RuntimeEntry::AllocateObject, fits))
    }

    pub fn closure(heap: &Heap, kind: ClosureKind) -> Self {
        let slow_path = match kind {
            ClosureKind::Regular => RuntimeEntry::AllocateClosure,
            ClosureKind::StaticImplicit => RuntimeEntry::AllocateStaticImplicitClosure,
            ClosureKind::Implicit => RuntimeEntry::AllocateImplicitClosure,
        };
        Self::generate(StubKind::Closure(kind), heap, slow_path, true)
    }

    pub fn argument_count(&self) -> usize {
        match self.kind {
            StubKind::Array => 2,
            StubKind::Context => 1,
            StubKind::Instance {
                type_arguments_field,
                ..
            } => {
                if type_arguments_field.is_some() {
                    2
                } else {
                    0
                }
            }
            StubKind::Closure(ClosureKind::Implicit) => 2,
            StubKind::Closure(_) => 1,
        }
    }

    pub fn interface(&self) -> &InlineAllocationInterface {
        &self.interface
    }

    pub fn has_fast_path(&self) -> bool {
        self.inline
    }

    /// Allocations served without calling the runtime.
    pub fn fast_hits(&self) -> usize {
        self.fast_hits.get()
    }

    pub fn slow_calls(&self) -> usize {
        self.slow_calls.get()
    }

    pub fn invoke(&self, isolate: &mut Isolate, args: &[Value]) -> HeapResult<Value> {
        if args.len() != self.argument_count() {
            return Err(HeapError::InvalidArgument("wrong stub argument count"));
        }
        if self.interface.top != isolate.heap().top_address() {
            return Err(HeapError::InvalidArgument("stub invoked against a different heap"));
        }
        if self.inline
            && let Some(result) = self.try_fast_path(isolate, args)
        {
            self.fast_hits.set(self.fast_hits.get() + 1);
            return Ok(result);
        }
        self.slow_calls.set(self.slow_calls.get() + 1);
        let args = self.slow_path_arguments(args);
        self.interface.slow_path.call(isolate, &args)
    }

    fn slow_path_arguments(&self, args: &[Value]) -> Vec<Value> {
        match self.kind {
            StubKind::Array => vec![args[0], args[1], Value::NULL],
            StubKind::Instance {
                class_id,
                type_arguments_field,
                ..
            } => {
                let class_id = Value::from_i64(class_id as i64);
                match type_arguments_field {
                    Some(_) => vec![class_id, args[0], args[1]],
                    None => vec![class_id, Value::NULL, Value::NULL],
                }
            }
            StubKind::Context | StubKind::Closure(_) => args.to_vec(),
        }
    }

    fn try_fast_path(&self, isolate: &Isolate, args: &[Value]) -> Option<Value> {
        match self.kind {
            StubKind::Array => self.allocate_array(args[0], args[1]),
            StubKind::Context => self.allocate_context(args[0]),
            StubKind::Instance {
                class_id,
                num_fields,
                type_arguments_field,
            } => {
                let (type_arguments, instantiator) = match type_arguments_field {
                    Some(_) => (args[0], args[1]),
                    None => (Value::NULL, Value::NULL),
                };
                self.allocate_instance(
                    class_id,
                    num_fields,
                    type_arguments_field,
                    type_arguments,
                    instantiator,
                )
            }
            StubKind::Closure(ClosureKind::Regular) => {
                self.allocate_closure(args[0], isolate.current_context())
            }
            StubKind::Closure(ClosureKind::StaticImplicit) => {
                self.allocate_closure(args[0], isolate.object_store().empty_context())
            }
            StubKind::Closure(ClosureKind::Implicit) => {
                self.allocate_implicit_closure(args[0], args[1])
            }
        }
    }

    fn variable_size(&self, kind: ObjectKind, length: Value) -> Option<(u32, usize)> {
        let length = u32::try_from(length.as_i64()?).ok()?;
        let size = self.interface.round(kind.layout().raw_size(length as usize));
        (size <= self.interface.max_object_size).then_some((length, size))
    }

    fn allocate_array(&self, length: Value, element_type: Value) -> Option<Value> {
        let (length, size) = self.variable_size(ObjectKind::Array, length)?;
        // SAFETY: the stub's heap is borrowed through the isolate
        let addr = unsafe { self.interface.try_bump(size)? };
        // SAFETY: `[addr, addr + size)` was just bumped
        unsafe {
            write_header(addr, Header::new(ObjectKind::Array, ARRAY_CID, length));
            write_field(addr, fields::ARRAY_TYPE_ARGUMENTS, element_type);
            fill_nulls(slot(addr, fields::ARRAY_DATA), addr + size);
        }
        Some(Value::from_addr(addr))
    }

    fn allocate_context(&self, num_variables: Value) -> Option<Value> {
        let (length, size) = self.variable_size(ObjectKind::Context, num_variables)?;
        // SAFETY: the stub's heap is borrowed through the isolate
        let addr = unsafe { self.interface.try_bump(size)? };
        // SAFETY: `[addr, addr + size)` was just bumped
        unsafe {
            write_header(addr, Header::new(ObjectKind::Context, CONTEXT_CID, length));
            fill_nulls(slot(addr, fields::CONTEXT_PARENT), addr + size);
        }
        Some(Value::from_addr(addr))
    }

    fn allocate_instance(
        &self,
        class_id: ClassId,
        num_fields: usize,
        type_arguments_field: Option<usize>,
        type_arguments: Value,
        instantiator: Value,
    ) -> Option<Value> {
        let alignment = self.interface.object_alignment;
        let size = ObjectKind::Instance
            .layout()
            .instance_size(num_fields, alignment);
        // a record is only needed when there is something to instantiate with
        let record = type_arguments_field.is_some() && !instantiator.is_null();
        let total = if record {
            size + type_arguments_size(alignment)
        } else {
            size
        };
        // SAFETY: the stub's heap is borrowed through the isolate
        let addr = unsafe { self.interface.try_bump(total)? };

        // SAFETY: `[addr, addr + total)` was just bumped
        unsafe {
            write_header(
                addr,
                Header::new(ObjectKind::Instance, class_id, num_fields as u32),
            );
            let words = size / WORD_SIZE - 1;
            if words < INLINE_INSTANCE_WORDS {
                ptr::copy_nonoverlapping(NULL_WORDS.as_ptr(), slot(addr, 0) as *mut Value, words);
            } else {
                fill_nulls(slot(addr, 0), addr + size);
            }

            if let Some(field) = type_arguments_field {
                let type_arguments = if record {
                    let record = addr + size;
                    write_header(
                        record,
                        Header::new(ObjectKind::TypeArguments, TYPE_ARGUMENTS_CID, 0),
                    );
                    write_field(record, fields::TYPE_ARGUMENTS_UNINSTANTIATED, type_arguments);
                    write_field(record, fields::TYPE_ARGUMENTS_INSTANTIATOR, instantiator);
                    fill_nulls(slot(record, 2), addr + total);
                    Value::from_addr(record)
                } else {
                    type_arguments
                };
                write_field(addr, field, type_arguments);
            }
        }
        Some(Value::from_addr(addr))
    }

    fn allocate_closure(&self, function: Value, context: Value) -> Option<Value> {
        let size = closure_size(self.interface.object_alignment);
        // SAFETY: the stub's heap is borrowed through the isolate
        let addr = unsafe { self.interface.try_bump(size)? };
        // SAFETY: `[addr, addr + size)` was just bumped
        unsafe { write_closure(addr, size, function, context) };
        Some(Value::from_addr(addr))
    }

    fn allocate_implicit_closure(&self, function: Value, receiver: Value) -> Option<Value> {
        let alignment = self.interface.object_alignment;
        let size = closure_size(alignment);
        let context_size = ObjectKind::Context.layout().instance_size(1, alignment);
        // SAFETY: the stub's heap is borrowed through the isolate
        let addr = unsafe { self.interface.try_bump(size + context_size)? };
        let context = addr + size;
        // SAFETY: both objects lie in the range just bumped
        unsafe {
            write_header(context, Header::new(ObjectKind::Context, CONTEXT_CID, 1));
            fill_nulls(slot(context, fields::CONTEXT_PARENT), context + context_size);
            write_field(context, fields::CONTEXT_VARIABLES, receiver);
            write_closure(addr, size, function, Value::from_addr(context));
        }
        Some(Value::from_addr(addr))
    }
}

fn type_arguments_size(alignment: usize) -> usize {
    ObjectKind::TypeArguments.layout().instance_size(0, alignment)
}

fn closure_size(alignment: usize) -> usize {
    ObjectKind::Closure.layout().instance_size(0, alignment)
}

#[inline(always)]
fn slot(addr: Address, index: usize) -> Address {
    addr + WORD_SIZE + index * WORD_SIZE
}

#[inline(always)]
unsafe fn write_header(addr: Address, header: Header) {
    // SAFETY: forwarded to caller
    unsafe { ptr::write(addr as *mut u64, header.raw()) }
}

#[inline(always)]
unsafe fn write_field(addr: Address, index: usize, value: Value) {
    // SAFETY: forwarded to caller
    unsafe { ptr::write(slot(addr, index) as *mut Value, value) }
}

#[inline(always)]
unsafe fn fill_nulls(mut cursor: Address, end: Address) {
    while cursor < end {
        // SAFETY: forwarded to caller
        unsafe { ptr::write(cursor as *mut Value, Value::NULL) };
        cursor += WORD_SIZE;
    }
}

unsafe fn write_closure(addr: Address, size: usize, function: Value, context: Value) {
    // SAFETY: forwarded to caller
    unsafe {
        write_header(addr, Header::new(ObjectKind::Closure, CLOSURE_CID, 0));
        fill_nulls(slot(addr, 0), addr + size);
        write_field(addr, fields::CLOSURE_FUNCTION, function);
        write_field(addr, fields::CLOSURE_CONTEXT, context);
    }
}
