use thiserror::Error;

/// Result type local to bytepool-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("pool region [{start}, {end}) lies outside buffer of {buffer_len} bytes")]
    RegionOutOfBounds {
        start: usize,
        end: usize,
        buffer_len: usize,
    },

    #[error("pool region too small: {size} bytes, at least {required} required")]
    RegionTooSmall { size: usize, required: usize },

    #[error("pool region too large: {size} bytes (limit {limit})")]
    RegionTooLarge { size: usize, limit: usize },

    #[error("out of memory: no free block for {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("safety violation: {0}")]
    Safety(String),

    #[error("pool corrupted: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Core(#[from] bytepool_core::Error),
}

impl Error {
    /// Out-of-memory is the only failure a caller can recover from; everything
    /// else means the pool or the caller's bookkeeping is already broken.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}
