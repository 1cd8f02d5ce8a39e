#![forbid(unsafe_code)]
//! bytepool-core: shared vocabulary for the bytepool allocator.
//!
//! Holds the handle types (`Pointer`, `OwnerId`), the pool configuration and
//! the core error type. The allocator itself lives in `bytepool-mem`; keep this
//! crate free of allocation logic so views and stores can depend on it cheaply.

pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod prelude;

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use id::{OwnerId, Pointer};
