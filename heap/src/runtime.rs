//! Runtime entries: the general allocation routines behind every stub.
//!
//! Each entry protects its arguments in the isolate's [`HandleScope`] before
//! allocating, so a scavenge in the middle of a multi-object allocation
//! updates them in place. Results have exactly the shape the inline fast
//! paths produce.
//!
//! [`HandleScope`]: crate::handles::HandleScope

use crate::{
    HeapError, HeapResult, ObjectKind, RawObject, Value,
    fields,
    handles::Handle,
    heap::Space,
    isolate::Isolate,
    object_store::{ARRAY_CID, CLOSURE_CID, CONTEXT_CID, ClassId, TYPE_ARGUMENTS_CID},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeEntry {
    /// `(length, element_type, instantiator)`
    AllocateArray,
    /// `(num_variables)`
    AllocateContext,
    /// `(class_id, type_arguments, instantiator)`
    AllocateObject,
    /// `(type_arguments, instantiator)`
    InstantiateTypeArguments,
    /// `(function)`, closing over the current context
    AllocateClosure,
    /// `(function)`, closing over the empty context
    AllocateStaticImplicitClosure,
    /// `(function, receiver)`
    AllocateImplicitClosure,
}

impl RuntimeEntry {
    pub const fn name(self) -> &'static str {
        match self {
            Self::AllocateArray => "AllocateArray",
            Self::AllocateContext => "AllocateContext",
            Self::AllocateObject => "AllocateObject",
            Self::InstantiateTypeArguments => "InstantiateTypeArguments",
            Self::AllocateClosure => "AllocateClosure",
            Self::AllocateStaticImplicitClosure => "AllocateStaticImplicitClosure",
            Self::AllocateImplicitClosure => "AllocateImplicitClosure",
        }
    }

    pub const fn argument_count(self) -> usize {
        match self {
            Self::AllocateArray | Self::AllocateObject => 3,
            Self::InstantiateTypeArguments | Self::AllocateImplicitClosure => 2,
            Self::AllocateContext
            | Self::AllocateClosure
            | Self::AllocateStaticImplicitClosure => 1,
        }
    }

    /// Calls the entry with arguments in declaration order.
    pub fn call(self, isolate: &mut Isolate, args: &[Value]) -> HeapResult<Value> {
        if args.len() != self.argument_count() {
            return Err(HeapError::InvalidArgument("wrong runtime entry argument count"));
        }
        log::trace!("runtime entry {}", self.name());
        match self {
            Self::AllocateArray => allocate_array(isolate, args[0], args[1], args[2]),
            Self::AllocateContext => allocate_context(isolate, args[0]),
            Self::AllocateObject => {
                let class_id = class_id_argument(args[0])?;
                allocate_object(isolate, class_id, args[1], args[2])
            }
            Self::InstantiateTypeArguments => {
                instantiate_type_arguments(isolate, args[0], args[1])
            }
            Self::AllocateClosure => allocate_closure(isolate, args[0]),
            Self::AllocateStaticImplicitClosure => {
                allocate_static_implicit_closure(isolate, args[0])
            }
            Self::AllocateImplicitClosure => {
                allocate_implicit_closure(isolate, args[0], args[1])
            }
        }
    }
}

#[inline]
fn object(value: Value) -> RawObject {
    // SAFETY: only called on references this module just allocated or read
    // back from a handle
    unsafe { RawObject::from_value(value) }
}

fn length_argument(value: Value) -> HeapResult<usize> {
    value
        .as_i64()
        .and_then(|n| u32::try_from(n).ok())
        .map(|n| n as usize)
        .ok_or(HeapError::InvalidArgument("length must be a non-negative fixnum"))
}

fn class_id_argument(value: Value) -> HeapResult<ClassId> {
    value
        .as_i64()
        .and_then(|n| ClassId::try_from(n).ok())
        .ok_or(HeapError::InvalidArgument("class id must be a fixnum"))
}

/// Runs `f` inside a fresh handle scope.
fn scoped<T>(
    isolate: &mut Isolate,
    f: impl FnOnce(&mut Isolate) -> HeapResult<T>,
) -> HeapResult<T> {
    let mark = isolate.handles().open();
    let result = f(isolate);
    isolate.handles().close(mark);
    result
}

/// Stores `type_arguments` as is when there is no instantiator, otherwise
/// wraps both in a fresh `TypeArguments` record.
fn instantiate(
    isolate: &mut Isolate,
    type_arguments: Handle,
    instantiator: Handle,
) -> HeapResult<Value> {
    if isolate.handles().get(instantiator).is_null() {
        return Ok(isolate.handles().get(type_arguments));
    }
    let record =
        isolate.allocate_object(ObjectKind::TypeArguments, TYPE_ARGUMENTS_CID, 0, Space::New)?;
    record.set_field(
        fields::TYPE_ARGUMENTS_UNINSTANTIATED,
        isolate.handles().get(type_arguments),
    );
    record.set_field(
        fields::TYPE_ARGUMENTS_INSTANTIATOR,
        isolate.handles().get(instantiator),
    );
    Ok(record.to_value())
}

pub fn allocate_array(
    isolate: &mut Isolate,
    length: Value,
    element_type: Value,
    instantiator: Value,
) -> HeapResult<Value> {
    let length = length_argument(length)?;
    scoped(isolate, |isolate| {
        let element_type = isolate.handles().create(element_type);
        let instantiator = isolate.handles().create(instantiator);
        let array = isolate
            .allocate_object(ObjectKind::Array, ARRAY_CID, length, Space::New)?
            .to_value();
        let array = isolate.handles().create(array);
        let type_arguments = instantiate(isolate, element_type, instantiator)?;
        let array = object(isolate.handles().get(array));
        array.set_field(fields::ARRAY_TYPE_ARGUMENTS, type_arguments);
        Ok(array.to_value())
    })
}

pub fn allocate_context(isolate: &mut Isolate, num_variables: Value) -> HeapResult<Value> {
    let num_variables = length_argument(num_variables)?;
    let context =
        isolate.allocate_object(ObjectKind::Context, CONTEXT_CID, num_variables, Space::New)?;
    Ok(context.to_value())
}

pub fn allocate_object(
    isolate: &mut Isolate,
    class_id: ClassId,
    type_arguments: Value,
    instantiator: Value,
) -> HeapResult<Value> {
    let class = isolate
        .object_store()
        .class_table
        .get(class_id)
        .ok_or(HeapError::InvalidArgument("unknown class"))?;
    let num_fields = class.num_fields;
    let type_arguments_field = class.type_arguments_field;

    scoped(isolate, |isolate| {
        let type_arguments = isolate.handles().create(type_arguments);
        let instantiator = isolate.handles().create(instantiator);
        let instance = isolate
            .allocate_object(ObjectKind::Instance, class_id, num_fields, Space::New)?
            .to_value();
        let Some(field) = type_arguments_field else {
            return Ok(instance);
        };
        let instance = isolate.handles().create(instance);
        let type_arguments = instantiate(isolate, type_arguments, instantiator)?;
        let instance = object(isolate.handles().get(instance));
        instance.set_field(field, type_arguments);
        Ok(instance.to_value())
    })
}

pub fn instantiate_type_arguments(
    isolate: &mut Isolate,
    type_arguments: Value,
    instantiator: Value,
) -> HeapResult<Value> {
    scoped(isolate, |isolate| {
        let type_arguments = isolate.handles().create(type_arguments);
        let instantiator = isolate.handles().create(instantiator);
        instantiate(isolate, type_arguments, instantiator)
    })
}

/// Allocates a closure over whatever context `context` yields after the
/// allocation, so a moved context is picked up.
fn new_closure(
    isolate: &mut Isolate,
    function: Handle,
    context: impl FnOnce(&mut Isolate) -> Value,
) -> HeapResult<Value> {
    let closure = isolate.allocate_object(ObjectKind::Closure, CLOSURE_CID, 0, Space::New)?;
    closure.set_field(fields::CLOSURE_FUNCTION, isolate.handles().get(function));
    closure.set_field(fields::CLOSURE_CONTEXT, context(isolate));
    Ok(closure.to_value())
}

pub fn allocate_closure(isolate: &mut Isolate, function: Value) -> HeapResult<Value> {
    scoped(isolate, |isolate| {
        let function = isolate.handles().create(function);
        new_closure(isolate, function, |isolate| isolate.current_context())
    })
}

pub fn allocate_static_implicit_closure(
    isolate: &mut Isolate,
    function: Value,
) -> HeapResult<Value> {
    scoped(isolate, |isolate| {
        let function = isolate.handles().create(function);
        new_closure(isolate, function, |isolate| {
            isolate.object_store().empty_context()
        })
    })
}

pub fn allocate_implicit_closure(
    isolate: &mut Isolate,
    function: Value,
    receiver: Value,
) -> HeapResult<Value> {
    scoped(isolate, |isolate| {
        let function = isolate.handles().create(function);
        let receiver = isolate.handles().create(receiver);
        let context = isolate
            .allocate_object(ObjectKind::Context, CONTEXT_CID, 1, Space::New)?
            .to_value();
        let context = isolate.handles().create(context);
        object(isolate.handles().get(context))
            .set_field(fields::CONTEXT_VARIABLES, isolate.handles().get(receiver));
        new_closure(isolate, function, |isolate| isolate.handles().get(context))
    })
}
