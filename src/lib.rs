#![forbid(unsafe_code)]
//! bytepool: umbrella crate re-exporting the allocator and its vocabulary.

pub use bytepool_core as core;
pub use bytepool_mem as mem;

pub use bytepool_core::{OwnerId, Pointer, PoolConfig};
pub use bytepool_mem::{AllocationRegistry, Allocator, BlockInfo, Error, Result};
