//! Size-class mapping: byte sizes to `(fl, sl)` free-list coordinates.
//!
//! Sizes below `SMALL_BLOCK_SIZE` are spread linearly over the slots of class
//! 0. Above that, the first-level index is the position of the highest set bit
//! and the second level splits each power-of-two range into
//! `SL_INDEX_COUNT` equal slots.
//!
//! ```text
//!   fl = 0 : [0, 256) in steps of 8
//!   fl = 1 : [256, 512) in steps of 8
//!   fl = 2 : [512, 1024) in steps of 16
//!   fl = k : [2^(k+7), 2^(k+8)) in steps of 2^(k+2)
//! ```

use crate::block::{ALIGN_SIZE, ALIGN_SIZE_LOG2, BLOCK_PAYLOAD_MIN_SIZE};

pub const SL_INDEX_COUNT_LOG2: u32 = 5;
pub const SL_INDEX_COUNT: usize = 1 << SL_INDEX_COUNT_LOG2;

pub const FL_INDEX_MAX: u32 = 31;
pub const FL_INDEX_SHIFT: u32 = SL_INDEX_COUNT_LOG2 + ALIGN_SIZE_LOG2;
pub const FL_INDEX_COUNT: usize = (FL_INDEX_MAX - FL_INDEX_SHIFT + 1) as usize;

pub const SMALL_BLOCK_SIZE: usize = 1 << FL_INDEX_SHIFT;

/// Every block payload is strictly smaller than this.
pub const BLOCK_SIZE_MAX: usize = 1 << FL_INDEX_MAX;

// The bitmaps are single u32 words.
const _: () = assert!(SL_INDEX_COUNT <= u32::BITS as usize);
const _: () = assert!(FL_INDEX_COUNT <= u32::BITS as usize);
const _: () = assert!(SMALL_BLOCK_SIZE / SL_INDEX_COUNT == ALIGN_SIZE);

/// Free-list bucket coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass {
    pub fl: usize,
    pub sl: usize,
}

/// Index of the most significant set bit. `size` must be non-zero.
#[inline]
fn fls(size: usize) -> u32 {
    debug_assert!(size != 0);
    usize::BITS - 1 - size.leading_zeros()
}

/// Bucket that a free block of `size` bytes is filed under.
pub fn mapping_insert(size: usize) -> SizeClass {
    if size < SMALL_BLOCK_SIZE {
        SizeClass {
            fl: 0,
            sl: size / (SMALL_BLOCK_SIZE / SL_INDEX_COUNT),
        }
    } else {
        let fl = fls(size);
        let sl = (size >> (fl - SL_INDEX_COUNT_LOG2)) ^ SL_INDEX_COUNT;
        SizeClass {
            fl: (fl - (FL_INDEX_SHIFT - 1)) as usize,
            sl,
        }
    }
}

/// First bucket whose every block can hold `size` bytes.
///
/// Rounds up to the next second-level boundary so the search never lands in a
/// bucket that also holds smaller blocks. The result may lie past the last
/// first-level class, which callers treat as out-of-memory.
pub fn mapping_search(size: usize) -> SizeClass {
    let size = if size >= SMALL_BLOCK_SIZE {
        size + (1usize << (fls(size) - SL_INDEX_COUNT_LOG2)) - 1
    } else {
        size
    };
    mapping_insert(size)
}

/// Smallest size that maps to `class`.
pub fn class_lower_bound(class: SizeClass) -> usize {
    if class.fl == 0 {
        class.sl * (SMALL_BLOCK_SIZE / SL_INDEX_COUNT)
    } else {
        let base = 1usize << (class.fl as u32 + FL_INDEX_SHIFT - 1);
        base + class.sl * (base >> SL_INDEX_COUNT_LOG2)
    }
}

#[inline]
pub const fn align_up(x: usize, align: usize) -> usize {
    (x + (align - 1)) & !(align - 1)
}

#[inline]
pub const fn align_down(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

/// Round a request up to the allocation granularity and minimum payload.
/// `None` if no block could ever be that large.
pub fn adjust_request_size(size: usize) -> Option<usize> {
    let aligned = size.checked_add(ALIGN_SIZE - 1)? & !(ALIGN_SIZE - 1);
    if aligned >= BLOCK_SIZE_MAX {
        return None;
    }
    Some(aligned.max(BLOCK_PAYLOAD_MIN_SIZE))
}
