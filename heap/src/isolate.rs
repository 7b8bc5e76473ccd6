use std::sync::Arc;

use crate::{
    Address, HeapResult, ObjectKind, RawObject, RootProvider, Value,
    handles::{HandleScope, PersistentHandles},
    heap::{Heap, HeapSettings, Space},
    object_store::{ClassId, ObjectStore},
    scavenger::ScavengeStats,
};

/// Everything outside the heap that can hold a reference.
#[derive(Debug)]
pub struct IsolateRoots {
    pub object_store: ObjectStore,
    pub handles: HandleScope,
    pub persistent: Arc<PersistentHandles>,
    /// Context of the running function.
    pub current_context: Value,
    /// Slots of suspended mutator frames.
    pub stack: Vec<Value>,
}

impl RootProvider for IsolateRoots {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.object_store.visit_roots(visitor);
        self.handles.visit_roots(visitor);
        self.persistent.visit_handles(visitor);
        visitor(&mut self.current_context);
        self.stack.visit_roots(visitor);
    }
}

/// A heap together with the roots of its single mutator.
#[derive(Debug)]
pub struct Isolate {
    heap: Heap,
    pub roots: IsolateRoots,
}

impl Isolate {
    pub fn new(settings: HeapSettings) -> HeapResult<Self> {
        let mut heap = Heap::new(settings)?;
        let object_store = ObjectStore::new(&mut heap)?;
        let current_context = object_store.empty_context();
        Ok(Self {
            heap,
            roots: IsolateRoots {
                object_store,
                handles: HandleScope::new(),
                persistent: Arc::new(PersistentHandles::new()),
                current_context,
                stack: Vec::new(),
            },
        })
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    #[inline]
    pub fn object_store(&self) -> &ObjectStore {
        &self.roots.object_store
    }

    #[inline]
    pub fn object_store_mut(&mut self) -> &mut ObjectStore {
        &mut self.roots.object_store
    }

    #[inline]
    pub fn handles(&mut self) -> &mut HandleScope {
        &mut self.roots.handles
    }

    pub fn persistent_handles(&self) -> Arc<PersistentHandles> {
        self.roots.persistent.clone()
    }

    #[inline]
    pub fn current_context(&self) -> Value {
        self.roots.current_context
    }

    pub fn set_current_context(&mut self, context: Value) {
        self.roots.current_context = context;
    }

    pub fn stack(&mut self) -> &mut Vec<Value> {
        &mut self.roots.stack
    }

    /// Allocates raw bytes, scavenging with this isolate's roots if needed.
    ///
    /// The memory is zeroed and has no header; initialize it before the next
    /// allocation or collection.
    pub fn allocate(&mut self, size: usize, space: Space) -> HeapResult<Address> {
        self.heap.allocate(size, space, &mut self.roots)
    }

    /// Allocates an initialized object, scavenging with this isolate's roots
    /// if needed. Callers must hold every other live reference in a handle.
    pub fn allocate_object(
        &mut self,
        kind: ObjectKind,
        class_id: ClassId,
        length: usize,
        space: Space,
    ) -> HeapResult<RawObject> {
        self.heap
            .allocate_object(kind, class_id, length, space, &mut self.roots)
    }

    pub fn collect_garbage(&mut self) -> ScavengeStats {
        self.heap.collect_garbage(&mut self.roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Header, fields,
        object::initialize_object,
        object_store::{ARRAY_CID, CONTEXT_CID},
    };

    fn isolate() -> Isolate {
        Isolate::new(HeapSettings::default()).expect("isolate")
    }

    fn new_array(isolate: &mut Isolate, n: i64) -> Value {
        let obj = isolate
            .allocate_object(ObjectKind::Array, ARRAY_CID, 1, Space::New)
            .expect("array");
        obj.set_field(fields::ARRAY_DATA, Value::from_i64(n));
        obj.to_value()
    }

    #[test]
    fn fresh_isolates_run_in_the_empty_context() {
        let isolate = isolate();
        assert_eq!(
            isolate.current_context(),
            isolate.object_store().empty_context()
        );
    }

    #[test]
    fn raw_allocations_survive_once_initialized() {
        let mut isolate = isolate();
        let header = Header::new(ObjectKind::Array, ARRAY_CID, 2);
        let size = header.size(isolate.heap().settings().object_alignment);
        let addr = isolate.allocate(size, Space::New).expect("raw bytes");
        // SAFETY: fresh allocation of `size` bytes, initialized before the
        // next allocation
        let obj = unsafe { initialize_object(addr, header, size) };
        obj.set_field(fields::ARRAY_DATA + 1, Value::from_i64(9));
        isolate.stack().push(obj.to_value());

        let stats = isolate.collect_garbage();
        assert_eq!(stats.survivors, 1);
        let moved = isolate.stack()[0];
        assert_ne!(moved, obj.to_value());
        // SAFETY: the stack slot was updated by the scavenge
        let moved = unsafe { RawObject::from_value(moved) };
        assert_eq!(moved.header().length(), 2);
        assert_eq!(moved.field(fields::ARRAY_DATA + 1), Value::from_i64(9));
    }

    #[test]
    fn every_root_kind_survives_a_scavenge() {
        let mut isolate = isolate();
        let on_stack = new_array(&mut isolate, 1);
        isolate.stack().push(on_stack);

        let scoped = new_array(&mut isolate, 2);
        let mark = isolate.handles().open();
        let handle = isolate.handles().create(scoped);

        let persistent = new_array(&mut isolate, 3);
        let persistent = isolate.persistent_handles().allocate(persistent);

        let context = isolate
            .allocate_object(ObjectKind::Context, CONTEXT_CID, 0, Space::New)
            .expect("context")
            .to_value();
        isolate.set_current_context(context);

        let stats = isolate.collect_garbage();
        assert_eq!(stats.survivors, 4);

        let read = |value: Value| {
            // SAFETY: roots were updated by the scavenge
            unsafe { RawObject::from_value(value) }.field(fields::ARRAY_DATA)
        };
        assert_eq!(read(isolate.stack()[0]), Value::from_i64(1));
        assert_eq!(read(isolate.handles().get(handle)), Value::from_i64(2));
        let persistent = isolate
            .persistent_handles()
            .get(persistent)
            .expect("allocated");
        assert_eq!(read(persistent), Value::from_i64(3));
        assert_ne!(isolate.current_context(), context);
        assert!(isolate.heap().contains(isolate.current_context().addr()));
        isolate.handles().close(mark);
    }
}
