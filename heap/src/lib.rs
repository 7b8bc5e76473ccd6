//! Two-generation managed heap.
//!
//! Young objects are bump-allocated in a semispace [`Scavenger`] and copied
//! on collection; survivors are promoted into a paged old generation
//! ([`PageSpace`]). [`AllocationStub`]s provide the inline fast paths that
//! generated code would take, backed by [`RuntimeEntry`] slow paths.

mod error;
mod heap;
mod object;
mod system;
mod value;
mod visitor;

pub mod handles;
pub mod isolate;
pub mod object_store;
pub mod pages;
pub mod runtime;
pub mod scavenger;
pub mod stubs;
pub mod verifier;
pub mod virtual_memory;

pub use error::{HeapError, HeapResult};
pub use heap::{Heap, HeapSettings, Space};
pub use isolate::Isolate;
pub use object::{
    Header, HeaderState, ObjectKind, ObjectLayout, RawObject, Variable, fields,
    initialize_object, visit_range,
};
pub use pages::{HeapPage, PageFlags, PageSpace};
pub use runtime::RuntimeEntry;
pub use scavenger::{BumpCursor, ScavengeStats, Scavenger};
pub use stubs::{AllocationStub, ClosureKind, InlineAllocationInterface};
pub use system::OS_PAGE_SIZE;
pub use value::{Address, Value, WORD_SIZE, checked_round_up, round_up};
pub use visitor::{NoRoots, ObjectPointerVisitor, RootProvider};
