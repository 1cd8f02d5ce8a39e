//! Block codec: bit-exact access to block headers inside the pool buffer.
//!
//! Layout of a block whose header starts at offset `h`:
//! [ prev_phys_block: u32 ][ size | flags: u32 ][ payload … ]
//!
//! While the block is free its payload starts with the free-list links:
//! [ next_free: u32 ][ prev_free: u32 ]
//!
//! `prev_phys_block` is only meaningful while the block's `is_prev_free` bit is
//! set. All functions here are stateless and operate on `(buffer, offset)`;
//! the allocator owns every decision about *when* to call them.

pub const ALIGN_SIZE_LOG2: u32 = 3;
pub const ALIGN_SIZE: usize = 1 << ALIGN_SIZE_LOG2;

/// `prev_phys_block` + size word.
pub const BLOCK_HEADER_SIZE: usize = 8;

/// `next_free` + `prev_free`, overlapping the start of a free payload.
pub const FREE_LINKS_SIZE: usize = 8;

pub const BLOCK_PAYLOAD_MIN_SIZE: usize = 2 * ALIGN_SIZE;

/// First block header plus the sentinel header.
pub const POOL_OVERHEAD: usize = 2 * BLOCK_HEADER_SIZE;

/// Encodes "no block" in a free-list link field.
pub const NULL_LINK: u32 = u32::MAX;

/// Written over freed payloads in debug builds.
pub const FREED_PATTERN: u8 = 0xDD;

const PREV_PHYS_FIELD: usize = 0;
const SIZE_FIELD: usize = 4;
const NEXT_FREE_FIELD: usize = BLOCK_HEADER_SIZE;
const PREV_FREE_FIELD: usize = BLOCK_HEADER_SIZE + 4;

/// Payload size with the two status flags packed into its low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeWord(u32);

impl SizeWord {
    const FREE_BIT: u32 = 1 << 0;
    const PREV_FREE_BIT: u32 = 1 << 1;
    const FLAG_MASK: u32 = Self::FREE_BIT | Self::PREV_FREE_BIT;

    /// A used block of `size` bytes whose predecessor is used.
    pub fn new(size: usize) -> Self {
        Self(0).with_size(size)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn size(self) -> usize {
        (self.0 & !Self::FLAG_MASK) as usize
    }

    pub fn with_size(self, size: usize) -> Self {
        debug_assert!(size <= u32::MAX as usize, "block size {size} overflows the size word");
        debug_assert_eq!(size as u32 & Self::FLAG_MASK, 0, "block size {size} is misaligned");
        Self((size as u32 & !Self::FLAG_MASK) | (self.0 & Self::FLAG_MASK))
    }

    pub const fn is_free(self) -> bool {
        self.0 & Self::FREE_BIT != 0
    }

    pub const fn with_free(self, free: bool) -> Self {
        if free {
            Self(self.0 | Self::FREE_BIT)
        } else {
            Self(self.0 & !Self::FREE_BIT)
        }
    }

    pub const fn is_prev_free(self) -> bool {
        self.0 & Self::PREV_FREE_BIT != 0
    }

    pub const fn with_prev_free(self, prev_free: bool) -> Self {
        if prev_free {
            Self(self.0 | Self::PREV_FREE_BIT)
        } else {
            Self(self.0 & !Self::PREV_FREE_BIT)
        }
    }
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}

#[inline]
fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn decode_link(raw: u32) -> Option<usize> {
    (raw != NULL_LINK).then_some(raw as usize)
}

#[inline]
fn encode_link(link: Option<usize>) -> u32 {
    link.map_or(NULL_LINK, |offset| offset as u32)
}

// ----- size word -----

#[inline]
pub fn block_word(buf: &[u8], h: usize) -> SizeWord {
    SizeWord::from_raw(read_u32(buf, h + SIZE_FIELD))
}

#[inline]
pub fn block_set_word(buf: &mut [u8], h: usize, word: SizeWord) {
    write_u32(buf, h + SIZE_FIELD, word.raw());
}

#[inline]
pub fn block_size(buf: &[u8], h: usize) -> usize {
    block_word(buf, h).size()
}

/// Replace the size, keeping both status flags.
#[inline]
pub fn block_set_size(buf: &mut [u8], h: usize, size: usize) {
    let word = block_word(buf, h).with_size(size);
    block_set_word(buf, h, word);
}

/// Only the sentinel has an empty payload.
#[inline]
pub fn block_is_last(buf: &[u8], h: usize) -> bool {
    block_size(buf, h) == 0
}

#[inline]
pub fn block_is_free(buf: &[u8], h: usize) -> bool {
    block_word(buf, h).is_free()
}

#[inline]
pub fn block_set_free(buf: &mut [u8], h: usize) {
    let word = block_word(buf, h).with_free(true);
    block_set_word(buf, h, word);
}

#[inline]
pub fn block_set_used(buf: &mut [u8], h: usize) {
    let word = block_word(buf, h).with_free(false);
    block_set_word(buf, h, word);
}

#[inline]
pub fn block_is_prev_free(buf: &[u8], h: usize) -> bool {
    block_word(buf, h).is_prev_free()
}

#[inline]
pub fn block_set_prev_free(buf: &mut [u8], h: usize) {
    let word = block_word(buf, h).with_prev_free(true);
    block_set_word(buf, h, word);
}

#[inline]
pub fn block_set_prev_used(buf: &mut [u8], h: usize) {
    let word = block_word(buf, h).with_prev_free(false);
    block_set_word(buf, h, word);
}

// ----- pointer conversion -----

#[inline]
pub const fn block_to_ptr(h: usize) -> usize {
    h + BLOCK_HEADER_SIZE
}

#[inline]
pub const fn block_from_ptr(ptr: usize) -> usize {
    ptr - BLOCK_HEADER_SIZE
}

// ----- physical neighbours -----

/// Header of the physically preceding block. Valid only if `is_prev_free`.
#[inline]
pub fn block_prev_phys(buf: &[u8], h: usize) -> usize {
    debug_assert!(block_is_prev_free(buf, h), "previous block of {h} is not free");
    read_u32(buf, h + PREV_PHYS_FIELD) as usize
}

#[inline]
pub fn block_next_phys(buf: &[u8], h: usize) -> usize {
    debug_assert!(!block_is_last(buf, h), "sentinel at {h} has no successor");
    block_to_ptr(h) + block_size(buf, h)
}

/// Point the next block's `prev_phys_block` back at `h`; returns the next header.
#[inline]
pub fn block_link_next(buf: &mut [u8], h: usize) -> usize {
    let next = block_next_phys(buf, h);
    write_u32(buf, next + PREV_PHYS_FIELD, h as u32);
    next
}

pub fn block_mark_as_free(buf: &mut [u8], h: usize) {
    let next = block_link_next(buf, h);
    block_set_prev_free(buf, next);
    block_set_free(buf, h);
}

pub fn block_mark_as_used(buf: &mut [u8], h: usize) {
    let next = block_next_phys(buf, h);
    block_set_prev_used(buf, next);
    block_set_used(buf, h);
}

// ----- free-list links -----

#[inline]
pub fn block_next_free_link(buf: &[u8], h: usize) -> Option<usize> {
    decode_link(read_u32(buf, h + NEXT_FREE_FIELD))
}

#[inline]
pub fn block_prev_free_link(buf: &[u8], h: usize) -> Option<usize> {
    decode_link(read_u32(buf, h + PREV_FREE_FIELD))
}

#[inline]
pub fn block_set_next_free_link(buf: &mut [u8], h: usize, next: Option<usize>) {
    write_u32(buf, h + NEXT_FREE_FIELD, encode_link(next));
}

#[inline]
pub fn block_set_prev_free_link(buf: &mut [u8], h: usize, prev: Option<usize>) {
    write_u32(buf, h + PREV_FREE_FIELD, encode_link(prev));
}

// ----- split / absorb -----

/// True if carving `size` bytes off `h` leaves a remainder that can stand as
/// its own block.
#[inline]
pub fn block_can_split(buf: &[u8], h: usize, size: usize) -> bool {
    block_size(buf, h) >= size + BLOCK_HEADER_SIZE + BLOCK_PAYLOAD_MIN_SIZE
}

/// Shrink `h` to exactly `size` bytes and turn the tail into a free block.
///
/// The remainder's `is_prev_free` mirrors `h`'s free bit and the block after
/// the remainder is told its predecessor is free. The remainder is *not*
/// inserted into any free list.
pub fn block_split(buf: &mut [u8], h: usize, size: usize) -> usize {
    debug_assert!(block_can_split(buf, h, size));

    let remaining = block_to_ptr(h) + size;
    let remain_size = block_size(buf, h) - (size + BLOCK_HEADER_SIZE);
    let h_is_free = block_is_free(buf, h);

    block_set_size(buf, h, size);
    write_u32(buf, remaining + PREV_PHYS_FIELD, h as u32);
    block_set_word(
        buf,
        remaining,
        SizeWord::new(remain_size).with_prev_free(h_is_free),
    );
    block_mark_as_free(buf, remaining);

    remaining
}

/// Merge `block` into its physical predecessor `prev`, reclaiming one header.
pub fn block_absorb(buf: &mut [u8], prev: usize, block: usize) -> usize {
    debug_assert!(!block_is_last(buf, prev), "cannot absorb past the sentinel");
    debug_assert_eq!(block_next_phys(buf, prev), block);

    let size = block_size(buf, prev) + block_size(buf, block) + BLOCK_HEADER_SIZE;
    block_set_size(buf, prev, size);
    block_link_next(buf, prev);
    prev
}

/// Overwrite the payload past the free-list links with `pattern`.
pub fn block_stomp(buf: &mut [u8], h: usize, pattern: u8) {
    let start = block_to_ptr(h) + FREE_LINKS_SIZE;
    let end = block_to_ptr(h) + block_size(buf, h);
    if start < end {
        buf[start..end].fill(pattern);
    }
}
