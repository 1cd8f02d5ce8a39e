#![forbid(unsafe_code)]
//! bytepool-mem: a TLSF allocator that lives inside a caller-owned byte buffer.
//!
//! The pool never touches the system allocator for payload memory. Callers
//! hand over a buffer (`Vec<u8>`, a boxed slice, a `&mut [u8]` into shared
//! memory) and get back [`Pointer`](bytepool_core::Pointer) offsets into it.
//!
//! - `block`: bit-exact block header codec
//! - `mapping`: size to free-list class arithmetic
//! - `allocator`: the pool itself
//! - `registry`: optional parent/child ownership tracking
//! - `stats`: running counters (feature `stats`)

pub mod allocator;
pub mod block;
pub mod error;
pub mod mapping;
pub mod registry;
pub mod stats;

pub use allocator::{Allocator, BlockInfo, PoolWalk};
pub use error::{Error, Result};
pub use registry::{AllocationNode, AllocationRegistry};
pub use stats::{AllocatorStats, OpCounters, ReallocOutcomes};
