use crate::Value;

/// Receives pointer slots during a heap walk.
///
/// Implementors may rewrite every slot in place; the collector uses this to
/// forward references, the verifier only reads them.
pub trait ObjectPointerVisitor {
    fn visit_pointers(&mut self, slots: &mut [Value]);

    #[inline]
    fn visit_pointer(&mut self, slot: &mut Value) {
        self.visit_pointers(std::slice::from_mut(slot));
    }
}

impl<F: FnMut(&mut Value)> ObjectPointerVisitor for F {
    #[inline]
    fn visit_pointers(&mut self, slots: &mut [Value]) {
        for slot in slots {
            self(slot);
        }
    }
}

/// Consumers implement this to provide GC roots.
///
/// Called at the start of every scavenge. The visitor receives `&mut Value`
/// so the collector can update roots in place when objects move. Omitting a
/// slot here lets a live object be collected.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

impl RootProvider for [Value] {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for root in self.iter_mut() {
            visitor(root);
        }
    }
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.as_mut_slice().visit_roots(visitor);
    }
}

/// A root provider with no roots.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_visit_each_slot() {
        let mut slots = [Value::from_i64(1), Value::NULL, Value::from_i64(3)];
        let mut bump = |slot: &mut Value| {
            if let Some(n) = slot.as_i64() {
                *slot = Value::from_i64(n + 10);
            }
        };
        bump.visit_pointers(&mut slots);
        assert_eq!(slots[0], Value::from_i64(11));
        assert_eq!(slots[1], Value::NULL);
        assert_eq!(slots[2], Value::from_i64(13));
    }

    #[test]
    fn vectors_provide_their_elements_as_roots() {
        let mut roots = vec![Value::from_i64(1), Value::from_i64(2)];
        let mut seen = Vec::new();
        roots.visit_roots(&mut |slot| seen.push(*slot));
        assert_eq!(seen, roots);

        let mut count = 0;
        NoRoots.visit_roots(&mut |_| count += 1);
        assert_eq!(count, 0);
    }
}
