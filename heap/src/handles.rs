//! Handles: root slots owned by the runtime rather than by objects.
//!
//! A [`HandleScope`] is a LIFO stack of local roots; runtime entries use it to
//! keep their arguments alive across allocations that may scavenge.
//! [`PersistentHandles`] is a slot table whose entries live until freed.

use parking_lot::Mutex;

use crate::{RootProvider, Value};

/// Index of a slot in a [`HandleScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

/// Saved stack height, returned by [`HandleScope::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a scope that is never closed leaks its handles"]
pub struct ScopeMark(usize);

#[derive(Debug, Default)]
pub struct HandleScope {
    handles: Vec<Value>,
    depth: usize,
}

impl HandleScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self) -> ScopeMark {
        self.depth += 1;
        ScopeMark(self.handles.len())
    }

    /// Releases every handle created since `mark`.
    pub fn close(&mut self, mark: ScopeMark) {
        assert!(self.depth > 0, "Handle scope closed more often than opened");
        assert!(mark.0 <= self.handles.len(), "Handle scopes closed out of order");
        self.handles.truncate(mark.0);
        self.depth -= 1;
    }

    pub fn create(&mut self, value: Value) -> Handle {
        debug_assert!(self.depth > 0, "handle created outside a scope");
        self.handles.push(value);
        Handle(self.handles.len() - 1)
    }

    /// Current value, updated if the collector moved the object.
    #[inline]
    pub fn get(&self, handle: Handle) -> Value {
        self.handles[handle.0]
    }

    #[inline]
    pub fn set(&mut self, handle: Handle, value: Value) {
        self.handles[handle.0] = value;
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl RootProvider for HandleScope {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.handles.iter_mut().for_each(visitor);
    }
}

/// Index of a slot in [`PersistentHandles`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersistentHandle(usize);

#[derive(Debug, Default)]
struct PersistentTable {
    slots: Vec<Option<Value>>,
    free: Vec<usize>,
}

/// Long-lived roots that embedder threads may create and drop.
///
/// Freed slots are reused before the table grows.
#[derive(Debug, Default)]
pub struct PersistentHandles {
    table: Mutex<PersistentTable>,
}

impl PersistentHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, value: Value) -> PersistentHandle {
        let mut table = self.table.lock();
        if let Some(index) = table.free.pop() {
            table.slots[index] = Some(value);
            return PersistentHandle(index);
        }
        table.slots.push(Some(value));
        PersistentHandle(table.slots.len() - 1)
    }

    pub fn free(&self, handle: PersistentHandle) {
        let mut table = self.table.lock();
        let slot = table
            .slots
            .get_mut(handle.0)
            .and_then(Option::take);
        assert!(slot.is_some(), "Persistent handle {} freed twice", handle.0);
        table.free.push(handle.0);
    }

    pub fn get(&self, handle: PersistentHandle) -> Option<Value> {
        self.table.lock().slots.get(handle.0).copied().flatten()
    }

    pub fn set(&self, handle: PersistentHandle, value: Value) {
        let mut table = self.table.lock();
        match table.slots.get_mut(handle.0) {
            Some(Some(slot)) => *slot = value,
            _ => panic!("Persistent handle {} is not allocated", handle.0),
        }
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        let table = self.table.lock();
        table.slots.len() - table.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers every live slot to `visitor` under the table lock.
    pub fn visit_handles(&self, visitor: &mut dyn FnMut(&mut Value)) {
        let mut table = self.table.lock();
        table.slots.iter_mut().flatten().for_each(visitor);
    }
}

impl RootProvider for PersistentHandles {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.visit_handles(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_release_their_handles() {
        let mut scope = HandleScope::new();
        let outer = scope.open();
        let a = scope.create(Value::from_i64(1));
        let inner = scope.open();
        scope.create(Value::from_i64(2));
        assert_eq!(scope.len(), 2);
        scope.close(inner);
        assert_eq!(scope.len(), 1);
        assert_eq!(scope.get(a), Value::from_i64(1));
        scope.close(outer);
        assert!(scope.is_empty());
    }

    #[test]
    fn scope_handles_are_roots() {
        let mut scope = HandleScope::new();
        let mark = scope.open();
        let h = scope.create(Value::from_i64(4));
        scope.visit_roots(&mut |slot| *slot = Value::from_i64(5));
        assert_eq!(scope.get(h), Value::from_i64(5));
        scope.close(mark);
    }

    #[test]
    #[should_panic(expected = "closed more often than opened")]
    fn unbalanced_close_panics() {
        let mut scope = HandleScope::new();
        let mark = scope.open();
        scope.close(mark);
        scope.close(mark);
    }

    #[test]
    fn persistent_slots_are_reused() {
        let handles = PersistentHandles::new();
        let a = handles.allocate(Value::from_i64(1));
        let b = handles.allocate(Value::from_i64(2));
        handles.free(a);
        assert_eq!(handles.get(a), None);
        assert_eq!(handles.len(), 1);

        let c = handles.allocate(Value::from_i64(3));
        assert_eq!(c, a, "freed slot reused");
        assert_eq!(handles.get(b), Some(Value::from_i64(2)));
        assert_eq!(handles.get(c), Some(Value::from_i64(3)));
    }

    #[test]
    fn persistent_roots_skip_free_slots() {
        let mut handles = PersistentHandles::new();
        let a = handles.allocate(Value::from_i64(1));
        handles.allocate(Value::from_i64(2));
        handles.free(a);

        let mut seen = Vec::new();
        handles.visit_roots(&mut |slot| seen.push(*slot));
        assert_eq!(seen, vec![Value::from_i64(2)]);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_panics() {
        let handles = PersistentHandles::new();
        let a = handles.allocate(Value::NULL);
        handles.free(a);
        handles.free(a);
    }

    #[test]
    fn persistent_handles_are_shared_across_threads() {
        let handles = std::sync::Arc::new(PersistentHandles::new());
        let worker = {
            let handles = handles.clone();
            std::thread::spawn(move || handles.allocate(Value::from_i64(9)))
        };
        let h = worker.join().expect("worker");
        assert_eq!(handles.get(h), Some(Value::from_i64(9)));
    }
}
