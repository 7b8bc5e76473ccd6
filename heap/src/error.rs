//! Error types for the heap.

use thiserror::Error;

use crate::Space;

/// All errors that can be produced by the heap and its runtime entries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    /// Every escalation step failed to find room for the request.
    #[error("out of memory: {requested} bytes in {space:?} space")]
    OutOfMemory { space: Space, requested: usize },

    /// The operating system refused to map memory.
    #[error("failed to reserve {size} bytes of virtual memory")]
    ReservationFailed { size: usize },

    /// A [`HeapSettings`](crate::HeapSettings) combination was rejected.
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),

    /// A runtime entry received a malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Convenient `Result` alias for fallible heap operations.
pub type HeapResult<T> = Result<T, HeapError>;
