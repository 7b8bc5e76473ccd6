//! Class metadata and well-known objects.

use crate::{
    HeapError, HeapResult, ObjectKind, RootProvider, Value,
    heap::{Heap, Space},
    visitor::NoRoots,
};

pub type ClassId = u16;

pub const ILLEGAL_CID: ClassId = 0;
pub const ARRAY_CID: ClassId = 1;
pub const CONTEXT_CID: ClassId = 2;
pub const TYPE_ARGUMENTS_CID: ClassId = 3;
pub const CLOSURE_CID: ClassId = 4;
pub const BYTES_CID: ClassId = 5;
pub const FIRST_USER_CID: ClassId = 16;

/// Layout facts the allocator needs about an instance class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    pub name: String,
    /// Pointer fields per instance, the type-arguments field included.
    pub num_fields: usize,
    /// Field holding the instance's type arguments, if the class is generic.
    pub type_arguments_field: Option<usize>,
}

impl ClassDescriptor {
    pub fn new(name: impl Into<String>, num_fields: usize) -> Self {
        Self {
            name: name.into(),
            num_fields,
            type_arguments_field: None,
        }
    }

    /// A generic class whose type arguments live in `field`.
    pub fn parameterized(name: impl Into<String>, num_fields: usize, field: usize) -> Self {
        debug_assert!(field < num_fields);
        Self {
            name: name.into(),
            num_fields,
            type_arguments_field: Some(field),
        }
    }

    #[inline]
    pub fn is_parameterized(&self) -> bool {
        self.type_arguments_field.is_some()
    }

    /// Rounded instance size for this class.
    pub fn instance_size(&self, alignment: usize) -> usize {
        ObjectKind::Instance
            .layout()
            .instance_size(self.num_fields, alignment)
    }
}

#[derive(Debug, Default)]
pub struct ClassTable {
    classes: Vec<ClassDescriptor>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: ClassDescriptor) -> HeapResult<ClassId> {
        if class.num_fields > u32::MAX as usize {
            return Err(HeapError::InvalidArgument("class has too many fields"));
        }
        if class
            .type_arguments_field
            .is_some_and(|field| field >= class.num_fields)
        {
            return Err(HeapError::InvalidArgument(
                "type arguments field lies outside the instance",
            ));
        }
        let cid = ClassId::try_from(self.classes.len() + FIRST_USER_CID as usize)
            .map_err(|_| HeapError::InvalidArgument("class table is full"))?;
        log::trace!("registered class {} as cid {cid}", class.name);
        self.classes.push(class);
        Ok(cid)
    }

    pub fn get(&self, cid: ClassId) -> Option<&ClassDescriptor> {
        let index = cid.checked_sub(FIRST_USER_CID)?;
        self.classes.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Per-isolate registry of classes and canonical objects.
#[derive(Debug)]
pub struct ObjectStore {
    pub class_table: ClassTable,
    empty_context: Value,
}

impl ObjectStore {
    /// Creates the store and its canonical objects in old space.
    pub fn new(heap: &mut Heap) -> HeapResult<Self> {
        let empty_context = heap
            .allocate_object(ObjectKind::Context, CONTEXT_CID, 0, Space::Old, &mut NoRoots)?
            .to_value();
        Ok(Self {
            class_table: ClassTable::new(),
            empty_context,
        })
    }

    /// The shared zero-variable context used by static closures.
    #[inline]
    pub fn empty_context(&self) -> Value {
        self.empty_context
    }
}

impl RootProvider for ObjectStore {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.empty_context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeapSettings, RawObject};

    #[test]
    fn user_classes_start_after_predefined_ids() {
        let mut table = ClassTable::new();
        let point = table
            .register(ClassDescriptor::new("Point", 2))
            .expect("register");
        let list = table
            .register(ClassDescriptor::parameterized("List", 3, 0))
            .expect("register");
        assert_eq!(point, FIRST_USER_CID);
        assert_eq!(list, FIRST_USER_CID + 1);
        assert_eq!(table.get(point).map(|c| c.name.as_str()), Some("Point"));
        assert!(table.get(list).is_some_and(ClassDescriptor::is_parameterized));
        assert_eq!(table.get(ARRAY_CID), None);
        assert_eq!(table.get(FIRST_USER_CID + 2), None);
    }

    #[test]
    fn type_arguments_field_must_be_an_instance_field() {
        let mut table = ClassTable::new();
        let class = ClassDescriptor {
            name: "Broken".into(),
            num_fields: 1,
            type_arguments_field: Some(1),
        };
        assert_eq!(
            table.register(class),
            Err(HeapError::InvalidArgument(
                "type arguments field lies outside the instance"
            ))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn instance_sizes_follow_field_count() {
        assert_eq!(ClassDescriptor::new("Empty", 0).instance_size(16), 16);
        assert_eq!(ClassDescriptor::new("Pair", 2).instance_size(16), 32);
        assert_eq!(ClassDescriptor::new("Triple", 3).instance_size(16), 32);
    }

    #[test]
    fn empty_context_lives_in_old_space() {
        let mut heap = Heap::new(HeapSettings::default()).expect("heap");
        let store = ObjectStore::new(&mut heap).expect("store");
        let context = store.empty_context();
        assert_eq!(heap.space_of(context.addr()), Some(Space::Old));
        // SAFETY: just allocated
        let header = unsafe { RawObject::from_value(context) }.header();
        assert_eq!(header.kind(), ObjectKind::Context);
        assert_eq!(header.length(), 0);
    }
}
