//! Two-Level Segregated Fit allocator over a caller-owned byte buffer.
//!
//! The pool is a contiguous region of the buffer tiled by blocks (see
//! [`crate::block`]) and terminated by a zero-sized, always-used sentinel.
//! Free blocks are filed in `FL_INDEX_COUNT x SL_INDEX_COUNT` doubly-linked
//! lists whose non-emptiness is mirrored by a first-level bitmap and one
//! second-level bitmap per first-level class, so finding a good-fit block is a
//! couple of `trailing_zeros` instead of a list scan.
//!
//! `allocate`, `free` and the in-place paths of `reallocate` run in bounded
//! time. Only the moving path of `reallocate` is proportional to the payload
//! it copies.
//!
//! Handles are [`Pointer`]s: byte offsets of payloads inside the buffer.

#[cfg(debug_assertions)]
use std::collections::HashSet;
use std::fmt;

use bytepool_core::{OwnerId, Pointer, PoolConfig};
use serde::{Deserialize, Serialize};

use crate::block::{
    block_absorb, block_can_split, block_from_ptr, block_is_free, block_is_last,
    block_is_prev_free, block_mark_as_free, block_mark_as_used, block_next_free_link,
    block_next_phys, block_prev_free_link, block_prev_phys, block_set_next_free_link,
    block_set_prev_free_link, block_set_word, block_size, block_split, block_to_ptr,
    block_word, SizeWord, ALIGN_SIZE, BLOCK_HEADER_SIZE, BLOCK_PAYLOAD_MIN_SIZE,
    POOL_OVERHEAD,
};
#[cfg(debug_assertions)]
use crate::block::{block_stomp, FREED_PATTERN};
use crate::error::{Error, Result};
use crate::mapping::{
    adjust_request_size, align_down, align_up, mapping_insert, mapping_search, SizeClass,
    BLOCK_SIZE_MAX, FL_INDEX_COUNT, SL_INDEX_COUNT,
};
use crate::registry::AllocationRegistry;
use crate::stats::ReallocOutcome;
#[cfg(feature = "stats")]
use crate::stats::{AllocatorStats, StatsRecorder};

/// One physical block as seen by [`Allocator::walk_pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub ptr: Pointer,
    pub size: usize,
    pub is_free: bool,
}

pub struct Allocator<B> {
    buffer: B,
    region_start: usize,
    region_end: usize,
    /// Header of the first physical block.
    first_block: usize,
    /// Header of the end-of-pool marker.
    sentinel: usize,
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_INDEX_COUNT],
    blocks: [[Option<u32>; SL_INDEX_COUNT]; FL_INDEX_COUNT],
    registry: Option<AllocationRegistry>,
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    stomp_freed: bool,
    /// Headers of used blocks; lets pointer checks reject interior offsets.
    #[cfg(debug_assertions)]
    live_headers: HashSet<usize>,
    #[cfg(feature = "stats")]
    stats: StatsRecorder,
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Allocator<B> {
    /// Manage the whole buffer, without an ownership registry.
    pub fn new(buffer: B) -> Result<Self> {
        Self::with_region(buffer, 0, None, None)
    }

    pub fn from_config(buffer: B, config: &PoolConfig) -> Result<Self> {
        let (start, size) = config.resolve_region(buffer.as_ref().len())?;
        let registry = config.track_ownership.then(AllocationRegistry::new);
        let mut allocator = Self::with_region(buffer, start, Some(size), registry)?;
        allocator.stomp_freed = config.stomp_freed;
        Ok(allocator)
    }

    /// Manage `[region_start, region_start + region_size)` of `buffer`.
    /// `region_size = None` extends the region to the end of the buffer.
    ///
    /// The whole region becomes a single free block followed by the sentinel.
    pub fn with_region(
        mut buffer: B,
        region_start: usize,
        region_size: Option<usize>,
        registry: Option<AllocationRegistry>,
    ) -> Result<Self> {
        let buffer_len = buffer.as_ref().len();
        let size = region_size.unwrap_or_else(|| buffer_len.saturating_sub(region_start));
        let region_end = region_start
            .checked_add(size)
            .filter(|end| region_start <= buffer_len && *end <= buffer_len)
            .ok_or(Error::RegionOutOfBounds {
                start: region_start,
                end: region_start.saturating_add(size),
                buffer_len,
            })?;
        if region_end > u32::MAX as usize {
            return Err(Error::RegionTooLarge {
                size,
                limit: u32::MAX as usize - region_start,
            });
        }

        let first_block = align_up(region_start, ALIGN_SIZE);
        let span = region_end.saturating_sub(first_block);
        let payload = align_down(span.saturating_sub(POOL_OVERHEAD), ALIGN_SIZE);
        if span < POOL_OVERHEAD + BLOCK_PAYLOAD_MIN_SIZE || payload < BLOCK_PAYLOAD_MIN_SIZE {
            return Err(Error::RegionTooSmall {
                size,
                required: (first_block - region_start) + POOL_OVERHEAD + BLOCK_PAYLOAD_MIN_SIZE,
            });
        }
        if payload >= BLOCK_SIZE_MAX {
            return Err(Error::RegionTooLarge {
                size,
                limit: BLOCK_SIZE_MAX - ALIGN_SIZE + POOL_OVERHEAD,
            });
        }

        let buf = buffer.as_mut();
        block_set_word(buf, first_block, SizeWord::new(payload));
        let sentinel = block_next_phys(buf, first_block);
        block_set_word(buf, sentinel, SizeWord::new(0));
        block_mark_as_free(buf, first_block);

        let mut allocator = Self {
            buffer,
            region_start,
            region_end,
            first_block,
            sentinel,
            fl_bitmap: 0,
            sl_bitmap: [0; FL_INDEX_COUNT],
            blocks: [[None; SL_INDEX_COUNT]; FL_INDEX_COUNT],
            registry,
            stomp_freed: true,
            #[cfg(debug_assertions)]
            live_headers: HashSet::new(),
            #[cfg(feature = "stats")]
            stats: StatsRecorder::default(),
        };
        allocator.insert_free_block(first_block);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            region_start,
            region_end,
            usable = payload,
            "pool initialized"
        );

        Ok(allocator)
    }

    // ----- public API -----

    /// Allocate `size` bytes. Zero bytes yields [`Pointer::NULL`].
    ///
    /// Fails with [`Error::OutOfMemory`] when no free block is large enough;
    /// the pool is untouched in that case.
    pub fn allocate(&mut self, size: usize) -> Result<Pointer> {
        self.allocate_with(size, None, None)
    }

    /// Like [`allocate`](Self::allocate), and records the new pointer in the
    /// registry under `owner`, as a child of `parent` when that is tracked.
    pub fn allocate_owned(
        &mut self,
        size: usize,
        owner: OwnerId,
        parent: Option<Pointer>,
    ) -> Result<Pointer> {
        self.allocate_with(size, Some(owner), parent)
    }

    /// Allocate and zero the whole payload (which may exceed `size`).
    pub fn allocate_zeroed(&mut self, size: usize) -> Result<Pointer> {
        let ptr = self.allocate(size)?;
        self.payload_mut(ptr)?.fill(0);
        Ok(ptr)
    }

    /// Release `ptr`. Returns `Ok(false)` for the null pointer.
    ///
    /// In debug builds a pointer that is not a live allocation is rejected with
    /// [`Error::Safety`] and the freed payload is overwritten past the
    /// free-list links.
    pub fn free(&mut self, ptr: Pointer) -> Result<bool> {
        if ptr.is_null() {
            #[cfg(feature = "stats")]
            self.stats.record_free(None);
            return Ok(false);
        }

        let h = match self.checked_header(ptr) {
            Ok(h) => h,
            Err(e) => {
                #[cfg(feature = "stats")]
                self.stats.record_free_failed();
                return Err(e);
            }
        };
        let _size = block_size(self.buffer.as_ref(), h);
        self.free_block(h);
        if let Some(registry) = self.registry.as_mut() {
            registry.unregister(ptr);
        }

        #[cfg(feature = "stats")]
        self.stats.record_free(Some(_size));
        #[cfg(feature = "tracing")]
        tracing::trace!(ptr = ptr.get(), size = _size, "free");

        Ok(true)
    }

    /// Free `ptr` and every registered descendant, children before parents.
    /// Returns the number of blocks released.
    ///
    /// In debug builds every pointer in the subtree is checked before anything
    /// is released, so a stale descendant fails the call without freeing the
    /// rest.
    pub fn free_recursive(&mut self, ptr: Pointer) -> Result<usize> {
        if ptr.is_null() {
            return Ok(0);
        }
        let descendants = self
            .registry
            .as_ref()
            .map(|r| r.descendants(ptr))
            .unwrap_or_default();
        for p in descendants.iter().chain(std::iter::once(&ptr)) {
            if let Err(e) = self.checked_header(*p) {
                #[cfg(feature = "stats")]
                self.stats.record_free_failed();
                return Err(e);
            }
        }

        let mut freed = 0;
        for child in descendants {
            if self.free(child)? {
                freed += 1;
            }
        }
        if self.free(ptr)? {
            freed += 1;
        }
        Ok(freed)
    }

    /// Resize the allocation at `ptr`.
    ///
    /// - null `ptr` behaves as [`allocate`](Self::allocate);
    /// - `new_size == 0` frees `ptr` and returns null;
    /// - shrinking splits off the tail only if it can form a block of its own;
    /// - growing absorbs a free physical successor when that is enough;
    /// - otherwise the payload moves to a new block. The old block is released
    ///   only after the new one exists and the bytes are copied, so a failed
    ///   move leaves `ptr` intact.
    pub fn reallocate(&mut self, ptr: Pointer, new_size: usize) -> Result<Pointer> {
        self.reallocate_with(ptr, new_size, None, None)
    }

    /// Like [`reallocate`](Self::reallocate). A moved pointer that is
    /// registered keeps its owner, parent and children; an untracked one is
    /// registered under `owner`.
    pub fn reallocate_owned(
        &mut self,
        ptr: Pointer,
        new_size: usize,
        owner: OwnerId,
        parent: Option<Pointer>,
    ) -> Result<Pointer> {
        self.reallocate_with(ptr, new_size, Some(owner), parent)
    }

    /// Payload size of the block at `ptr`; 0 for null.
    pub fn get_allocation_size(&self, ptr: Pointer) -> Result<usize> {
        if ptr.is_null() {
            return Ok(0);
        }
        let h = self.checked_header(ptr)?;
        Ok(block_size(self.buffer.as_ref(), h))
    }

    /// True if `[ptr, ptr + len)` lies inside the live allocation at `ptr`.
    /// The null pointer is only valid for an empty range.
    pub fn is_valid_memory_range(&self, ptr: Pointer, len: usize) -> bool {
        if ptr.is_null() {
            return len == 0;
        }
        self.validate_live(ptr).is_ok()
            && len <= block_size(self.buffer.as_ref(), block_from_ptr(ptr.offset()))
    }

    pub fn payload(&self, ptr: Pointer) -> Result<&[u8]> {
        if ptr.is_null() {
            return Ok(&[]);
        }
        let h = self.checked_header(ptr)?;
        let buf = self.buffer.as_ref();
        let start = ptr.offset();
        Ok(&buf[start..start + block_size(buf, h)])
    }

    pub fn payload_mut(&mut self, ptr: Pointer) -> Result<&mut [u8]> {
        if ptr.is_null() {
            return Ok(&mut []);
        }
        let h = self.checked_header(ptr)?;
        let buf = self.buffer.as_mut();
        let start = ptr.offset();
        let size = block_size(buf, h);
        Ok(&mut buf[start..start + size])
    }

    /// The whole host buffer, including block headers.
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_ref()
    }

    /// Mutable access to the host buffer. Writing outside live payloads
    /// corrupts the pool.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut()
    }

    pub fn into_inner(self) -> B {
        self.buffer
    }

    /// `(region_start, region_end)` as given at construction.
    pub fn region(&self) -> (usize, usize) {
        (self.region_start, self.region_end)
    }

    /// Payload of the single free block the pool started with.
    pub fn usable_size(&self) -> usize {
        self.sentinel - block_to_ptr(self.first_block)
    }

    pub fn registry(&self) -> Option<&AllocationRegistry> {
        self.registry.as_ref()
    }

    pub fn registry_mut(&mut self) -> Option<&mut AllocationRegistry> {
        self.registry.as_mut()
    }

    /// Physical blocks in address order, sentinel excluded.
    pub fn walk_pool(&self) -> PoolWalk<'_> {
        PoolWalk {
            buf: self.buffer.as_ref(),
            next: Some(self.first_block),
        }
    }

    /// Full consistency check of block tiling, boundary tags, free lists and
    /// bitmaps. Linear in the number of blocks.
    pub fn check_integrity(&self) -> Result<()> {
        let buf = self.buffer.as_ref();

        let mut h = self.first_block;
        let mut prev: Option<(usize, bool)> = None;
        let mut free_blocks = 0usize;
        #[cfg(debug_assertions)]
        let mut used_blocks = 0usize;
        loop {
            if h + BLOCK_HEADER_SIZE > self.region_end {
                return Err(corrupted(format!("block at {h} runs past the region end")));
            }
            let word = block_word(buf, h);
            let prev_free = prev.is_some_and(|(_, free)| free);
            if word.is_prev_free() != prev_free {
                return Err(corrupted(format!(
                    "block at {h}: prev_free tag {} disagrees with predecessor",
                    word.is_prev_free()
                )));
            }
            if let Some((prev_h, true)) = prev {
                if block_prev_phys(buf, h) != prev_h {
                    return Err(corrupted(format!(
                        "block at {h}: prev_phys_block does not point at {prev_h}"
                    )));
                }
            }

            let size = word.size();
            if size == 0 {
                if h != self.sentinel {
                    return Err(corrupted(format!("empty block at {h} before the sentinel")));
                }
                if word.is_free() {
                    return Err(corrupted("sentinel is marked free".into()));
                }
                break;
            }
            if size < BLOCK_PAYLOAD_MIN_SIZE || size % ALIGN_SIZE != 0 {
                return Err(corrupted(format!("block at {h} has invalid size {size}")));
            }
            if word.is_free() {
                if prev_free {
                    return Err(corrupted(format!("adjacent free blocks ending at {h}")));
                }
                free_blocks += 1;
            }
            #[cfg(debug_assertions)]
            if !word.is_free() {
                if !self.live_headers.contains(&h) {
                    return Err(corrupted(format!("used block at {h} was never handed out")));
                }
                used_blocks += 1;
            }

            prev = Some((h, word.is_free()));
            h = block_next_phys(buf, h);
        }

        #[cfg(debug_assertions)]
        if used_blocks != self.live_headers.len() {
            return Err(corrupted(format!(
                "{used_blocks} used blocks in the pool but {} handed out",
                self.live_headers.len()
            )));
        }

        let mut listed = 0usize;
        for fl in 0..FL_INDEX_COUNT {
            let fl_bit = self.fl_bitmap & (1u32 << fl) != 0;
            if fl_bit != (self.sl_bitmap[fl] != 0) {
                return Err(corrupted(format!(
                    "first-level bit {fl} disagrees with its second level"
                )));
            }
            for sl in 0..SL_INDEX_COUNT {
                let sl_bit = self.sl_bitmap[fl] & (1u32 << sl) != 0;
                let head = self.blocks[fl][sl];
                if sl_bit != head.is_some() {
                    return Err(corrupted(format!(
                        "bitmap bit ({fl}, {sl}) disagrees with its list"
                    )));
                }

                let mut link_prev = None;
                let mut cur = head.map(|o| o as usize);
                while let Some(b) = cur {
                    let end = b + BLOCK_HEADER_SIZE + BLOCK_PAYLOAD_MIN_SIZE;
                    if b < self.first_block || end > self.sentinel {
                        return Err(corrupted(format!("free link {b} points outside the pool")));
                    }
                    listed += 1;
                    if listed > free_blocks {
                        return Err(corrupted("free lists hold more blocks than the pool".into()));
                    }
                    if !block_is_free(buf, b) {
                        return Err(corrupted(format!("used block at {b} on a free list")));
                    }
                    let class = mapping_insert(block_size(buf, b));
                    if class != (SizeClass { fl, sl }) {
                        return Err(corrupted(format!("block at {b} filed under ({fl}, {sl})")));
                    }
                    if block_prev_free_link(buf, b) != link_prev {
                        return Err(corrupted(format!("broken back link at {b}")));
                    }
                    link_prev = Some(b);
                    cur = block_next_free_link(buf, b);
                }
            }
        }
        if listed != free_blocks {
            return Err(corrupted(format!(
                "{free_blocks} free blocks in the pool but {listed} on free lists"
            )));
        }
        Ok(())
    }

    #[cfg(feature = "stats")]
    pub fn statistics(&self) -> AllocatorStats {
        let mut stats = self.stats.snapshot();
        stats.used_overhead_bytes = stats.active_allocations * BLOCK_HEADER_SIZE;
        for info in self.walk_pool().filter(|b| b.is_free) {
            stats.free_blocks += 1;
            stats.free_payload_bytes += info.size;
            stats.free_overhead_bytes += BLOCK_HEADER_SIZE;
            stats.largest_free_block = stats.largest_free_block.max(info.size);
        }
        stats
    }

    // ----- operation bodies -----

    fn allocate_with(
        &mut self,
        size: usize,
        owner: Option<OwnerId>,
        parent: Option<Pointer>,
    ) -> Result<Pointer> {
        if size == 0 {
            #[cfg(feature = "stats")]
            self.stats.record_allocate(None);
            return Ok(Pointer::NULL);
        }

        let h = match self.alloc_block(size) {
            Ok(h) => h,
            Err(e) => {
                #[cfg(feature = "stats")]
                self.stats.record_allocate_failed();
                #[cfg(feature = "tracing")]
                tracing::warn!(size, "allocation failed: out of memory");
                return Err(e);
            }
        };
        let ptr = pointer_at(h);
        if let (Some(registry), Some(owner)) = (self.registry.as_mut(), owner) {
            registry.register(ptr, owner, parent);
        }

        #[cfg(feature = "stats")]
        self.stats
            .record_allocate(Some(block_size(self.buffer.as_ref(), h)));
        #[cfg(feature = "tracing")]
        tracing::trace!(ptr = ptr.get(), size, "allocate");

        Ok(ptr)
    }

    fn reallocate_with(
        &mut self,
        ptr: Pointer,
        new_size: usize,
        owner: Option<OwnerId>,
        parent: Option<Pointer>,
    ) -> Result<Pointer> {
        if ptr.is_null() {
            return self.allocate_with(new_size, owner, parent);
        }
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(Pointer::NULL);
        }

        let result = self.resize_block(ptr, new_size);
        let (new_ptr, _outcome, _old_size) = match result {
            Ok(done) => done,
            Err(e) => {
                #[cfg(feature = "stats")]
                self.stats.record_reallocate_failed();
                #[cfg(feature = "tracing")]
                tracing::warn!(ptr = ptr.get(), new_size, error = %e, "reallocation failed");
                return Err(e);
            }
        };

        if let Some(registry) = self.registry.as_mut() {
            let tracked =
                (new_ptr != ptr && registry.repoint(ptr, new_ptr)) || registry.contains(new_ptr);
            if let (false, Some(owner)) = (tracked, owner) {
                registry.register(new_ptr, owner, parent);
            }
        }

        #[cfg(feature = "stats")]
        {
            let new_size = block_size(self.buffer.as_ref(), block_from_ptr(new_ptr.offset()));
            self.stats.record_reallocate(_outcome, _old_size, new_size);
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(
            ptr = ptr.get(),
            new_ptr = new_ptr.get(),
            new_size,
            "reallocate"
        );

        Ok(new_ptr)
    }

    /// Resize without touching the registry. Returns the (possibly new)
    /// pointer, how it was satisfied and the old payload size.
    fn resize_block(
        &mut self,
        ptr: Pointer,
        new_size: usize,
    ) -> Result<(Pointer, ReallocOutcome, usize)> {
        let h = self.checked_header(ptr)?;
        let adjusted =
            adjust_request_size(new_size).ok_or(Error::OutOfMemory { requested: new_size })?;
        let current = block_size(self.buffer.as_ref(), h);

        if adjusted <= current {
            if adjusted < current && block_can_split(self.buffer.as_ref(), h, adjusted) {
                self.trim_used(h, adjusted);
                return Ok((ptr, ReallocOutcome::ShrunkInPlace, current));
            }
            return Ok((ptr, ReallocOutcome::Unchanged, current));
        }

        let next = block_next_phys(self.buffer.as_ref(), h);
        let combined = current + block_size(self.buffer.as_ref(), next) + BLOCK_HEADER_SIZE;
        if block_is_free(self.buffer.as_ref(), next) && combined >= adjusted {
            self.remove_free_block_mapped(next);
            let buf = self.buffer.as_mut();
            block_absorb(buf, h, next);
            block_mark_as_used(buf, h);
            self.trim_used(h, adjusted);
            return Ok((ptr, ReallocOutcome::GrownInPlace, current));
        }

        let new_h = self.alloc_block(new_size)?;
        let new_ptr = pointer_at(new_h);
        let buf = self.buffer.as_mut();
        let count = current.min(block_size(buf, new_h));
        buf.copy_within(ptr.offset()..ptr.offset() + count, new_ptr.offset());
        self.free_block(h);
        Ok((new_ptr, ReallocOutcome::Moved, current))
    }

    // ----- block-level engine -----

    /// Find, unlink, trim and mark a block for `size` requested bytes.
    fn alloc_block(&mut self, size: usize) -> Result<usize> {
        let oom = Error::OutOfMemory { requested: size };
        let adjusted = adjust_request_size(size).ok_or(oom)?;
        let h = self
            .locate_free_block(adjusted)
            .ok_or(Error::OutOfMemory { requested: size })?;
        self.trim_free(h, adjusted);
        block_mark_as_used(self.buffer.as_mut(), h);
        #[cfg(debug_assertions)]
        self.live_headers.insert(h);
        Ok(h)
    }

    /// Release a used block, coalescing with free neighbours.
    fn free_block(&mut self, h: usize) {
        #[cfg(debug_assertions)]
        self.live_headers.remove(&h);
        let buf = self.buffer.as_mut();
        #[cfg(debug_assertions)]
        if self.stomp_freed {
            block_stomp(buf, h, FREED_PATTERN);
        }
        block_mark_as_free(buf, h);
        let h = self.merge_prev(h);
        let h = self.merge_next(h);
        self.insert_free_block(h);
    }

    fn locate_free_block(&mut self, size: usize) -> Option<usize> {
        let class = self.find_suitable_class(mapping_search(size))?;
        let h = self.blocks[class.fl][class.sl]? as usize;
        debug_assert!(block_size(self.buffer.as_ref(), h) >= size);
        self.remove_free_block(h, class);
        Some(h)
    }

    /// First non-empty bucket at or above `class`.
    fn find_suitable_class(&self, class: SizeClass) -> Option<SizeClass> {
        if class.fl >= FL_INDEX_COUNT {
            return None;
        }

        let sl_map = self.sl_bitmap[class.fl] & (!0u32 << class.sl);
        if sl_map != 0 {
            return Some(SizeClass {
                fl: class.fl,
                sl: sl_map.trailing_zeros() as usize,
            });
        }

        let fl_map = self.fl_bitmap & (!0u32).checked_shl(class.fl as u32 + 1).unwrap_or(0);
        if fl_map == 0 {
            return None;
        }
        let fl = fl_map.trailing_zeros() as usize;
        let sl = self.sl_bitmap[fl].trailing_zeros() as usize;
        Some(SizeClass { fl, sl })
    }

    fn insert_free_block(&mut self, h: usize) {
        let buf = self.buffer.as_mut();
        let class = mapping_insert(block_size(buf, h));
        let head = self.blocks[class.fl][class.sl].map(|o| o as usize);

        block_set_next_free_link(buf, h, head);
        block_set_prev_free_link(buf, h, None);
        if let Some(head) = head {
            block_set_prev_free_link(buf, head, Some(h));
        }

        self.blocks[class.fl][class.sl] = Some(h as u32);
        self.fl_bitmap |= 1u32 << class.fl;
        self.sl_bitmap[class.fl] |= 1u32 << class.sl;
    }

    fn remove_free_block(&mut self, h: usize, class: SizeClass) {
        let buf = self.buffer.as_mut();
        let next = block_next_free_link(buf, h);
        let prev = block_prev_free_link(buf, h);
        if let Some(next) = next {
            block_set_prev_free_link(buf, next, prev);
        }
        if let Some(prev) = prev {
            block_set_next_free_link(buf, prev, next);
        }

        if self.blocks[class.fl][class.sl] == Some(h as u32) {
            self.blocks[class.fl][class.sl] = next.map(|n| n as u32);
            if next.is_none() {
                self.sl_bitmap[class.fl] &= !(1u32 << class.sl);
                if self.sl_bitmap[class.fl] == 0 {
                    self.fl_bitmap &= !(1u32 << class.fl);
                }
            }
        }
    }

    fn remove_free_block_mapped(&mut self, h: usize) {
        let class = mapping_insert(block_size(self.buffer.as_ref(), h));
        self.remove_free_block(h, class);
    }

    /// Split the tail off a free block before handing it out.
    fn trim_free(&mut self, h: usize, size: usize) {
        debug_assert!(block_is_free(self.buffer.as_ref(), h));
        if block_can_split(self.buffer.as_ref(), h, size) {
            let remaining = block_split(self.buffer.as_mut(), h, size);
            self.insert_free_block(remaining);
        }
    }

    /// Split the tail off a used block and give it back.
    fn trim_used(&mut self, h: usize, size: usize) {
        debug_assert!(!block_is_free(self.buffer.as_ref(), h));
        if block_can_split(self.buffer.as_ref(), h, size) {
            let remaining = block_split(self.buffer.as_mut(), h, size);
            let remaining = self.merge_next(remaining);
            self.insert_free_block(remaining);
        }
    }

    fn merge_prev(&mut self, h: usize) -> usize {
        if !block_is_prev_free(self.buffer.as_ref(), h) {
            return h;
        }
        let prev = block_prev_phys(self.buffer.as_ref(), h);
        debug_assert!(block_is_free(self.buffer.as_ref(), prev));
        self.remove_free_block_mapped(prev);
        block_absorb(self.buffer.as_mut(), prev, h)
    }

    fn merge_next(&mut self, h: usize) -> usize {
        let next = block_next_phys(self.buffer.as_ref(), h);
        let buf = self.buffer.as_ref();
        if block_is_last(buf, next) || !block_is_free(buf, next) {
            return h;
        }
        self.remove_free_block_mapped(next);
        block_absorb(self.buffer.as_mut(), h, next)
    }

    // ----- safety checks -----

    fn checked_header(&self, ptr: Pointer) -> Result<usize> {
        #[cfg(debug_assertions)]
        if let Err(reason) = self.validate_live(ptr) {
            #[cfg(feature = "tracing")]
            tracing::warn!(ptr = ptr.get(), %reason, "safety violation");
            return Err(Error::Safety(reason));
        }
        Ok(block_from_ptr(ptr.offset()))
    }

    /// Cheap structural checks that `ptr` addresses a live allocation.
    fn validate_live(&self, ptr: Pointer) -> std::result::Result<(), String> {
        let p = ptr.offset();
        if p < block_to_ptr(self.first_block) || p >= self.sentinel {
            return Err(format!("{ptr} lies outside the pool"));
        }
        if p % ALIGN_SIZE != 0 {
            return Err(format!("{ptr} is misaligned"));
        }

        let buf = self.buffer.as_ref();
        let h = block_from_ptr(p);
        if !self.is_live_header(h) {
            return Err(format!("{ptr} does not start a live allocation"));
        }
        let word = block_word(buf, h);
        let size = word.size();
        if size < BLOCK_PAYLOAD_MIN_SIZE || size % ALIGN_SIZE != 0 || p + size > self.sentinel {
            return Err(format!("{ptr} has an implausible header (size {size})"));
        }
        if word.is_free() {
            return Err(format!("{ptr} is not allocated (double free or use after free)"));
        }
        if block_is_prev_free(buf, block_next_phys(buf, h)) {
            return Err(format!("{ptr}: boundary tag of the next block disagrees"));
        }
        Ok(())
    }

    /// Whether a used block starts at `h`. Payload bytes can mimic a header,
    /// so decoding the word at `h` alone proves nothing.
    #[cfg(debug_assertions)]
    fn is_live_header(&self, h: usize) -> bool {
        self.live_headers.contains(&h)
    }

    /// Release builds keep no side table: walk the pool up to `h`.
    #[cfg(not(debug_assertions))]
    fn is_live_header(&self, h: usize) -> bool {
        let target = block_to_ptr(h);
        self.walk_pool()
            .take_while(|b| b.ptr.offset() <= target)
            .any(|b| b.ptr.offset() == target && !b.is_free)
    }
}

#[inline]
fn pointer_at(h: usize) -> Pointer {
    Pointer::new(block_to_ptr(h) as u32)
}

fn corrupted(reason: String) -> Error {
    #[cfg(feature = "tracing")]
    tracing::warn!(%reason, "pool integrity check failed");
    Error::Corrupted(reason)
}

/// Iterator over physical blocks, see [`Allocator::walk_pool`].
pub struct PoolWalk<'a> {
    buf: &'a [u8],
    next: Option<usize>,
}

impl Iterator for PoolWalk<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let h = self.next?;
        if block_is_last(self.buf, h) {
            self.next = None;
            return None;
        }
        let word = block_word(self.buf, h);
        self.next = Some(block_next_phys(self.buf, h));
        Some(BlockInfo {
            ptr: pointer_at(h),
            size: word.size(),
            is_free: word.is_free(),
        })
    }
}

impl<B> fmt::Debug for Allocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("region_start", &self.region_start)
            .field("region_end", &self.region_end)
            .field("fl_bitmap", &format_args!("{:#034b}", self.fl_bitmap))
            .field("tracks_ownership", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(len: usize) -> Allocator<Vec<u8>> {
        Allocator::new(vec![0u8; len]).unwrap()
    }

    fn free_sizes(a: &Allocator<Vec<u8>>) -> Vec<usize> {
        a.walk_pool().filter(|b| b.is_free).map(|b| b.size).collect()
    }

    #[test]
    fn fresh_pool_is_one_free_block() {
        let a = pool(1024);
        assert_eq!(a.usable_size(), 1024 - POOL_OVERHEAD);
        let blocks: Vec<_> = a.walk_pool().collect();
        assert_eq!(
            blocks,
            vec![BlockInfo {
                ptr: Pointer::new(BLOCK_HEADER_SIZE as u32),
                size: 1008,
                is_free: true,
            }]
        );
        a.check_integrity().unwrap();
    }

    #[test]
    fn region_is_aligned_inside_buffer() {
        let a = Allocator::with_region(vec![0u8; 600], 3, Some(500), None).unwrap();
        assert_eq!(a.region(), (3, 503));
        let first = a.walk_pool().next().unwrap();
        assert_eq!(first.ptr.offset(), 8 + BLOCK_HEADER_SIZE);
        assert_eq!(first.ptr.offset() % ALIGN_SIZE, 0);
        // 503 - 8 = 495 span, minus two headers, rounded down to 8
        assert_eq!(first.size, 472);
        a.check_integrity().unwrap();
    }

    #[test]
    fn region_errors() {
        assert!(matches!(
            Allocator::with_region(vec![0u8; 64], 32, Some(64), None),
            Err(Error::RegionOutOfBounds { buffer_len: 64, .. })
        ));
        assert!(matches!(
            Allocator::with_region(vec![0u8; 64], 80, None, None),
            Err(Error::RegionOutOfBounds { .. })
        ));
        assert!(matches!(
            Allocator::new(vec![0u8; 31]),
            Err(Error::RegionTooSmall { size: 31, required: 32 })
        ));
        assert!(Allocator::new(vec![0u8; 32]).is_ok());
    }

    #[test]
    fn zero_and_null_are_noops() {
        let mut a = pool(256);
        assert_eq!(a.allocate(0).unwrap(), Pointer::NULL);
        assert!(!a.free(Pointer::NULL).unwrap());
        assert_eq!(a.get_allocation_size(Pointer::NULL).unwrap(), 0);
        assert!(a.payload(Pointer::NULL).unwrap().is_empty());
        assert_eq!(free_sizes(&a), vec![a.usable_size()]);
    }

    #[test]
    fn small_request_is_rounded_up() {
        let mut a = pool(256);
        let p = a.allocate(1).unwrap();
        assert_eq!(a.get_allocation_size(p).unwrap(), BLOCK_PAYLOAD_MIN_SIZE);
        let q = a.allocate(17).unwrap();
        assert_eq!(a.get_allocation_size(q).unwrap(), 24);
        assert_eq!(q.offset(), p.offset() + BLOCK_PAYLOAD_MIN_SIZE + BLOCK_HEADER_SIZE);
        a.check_integrity().unwrap();
    }

    #[test]
    fn whole_pool_request_then_oom() {
        let mut a = pool(1024);
        let p = a.allocate(992).unwrap();
        // 1008 < 992 + 8 + 16, so the tail is not split off
        assert_eq!(a.get_allocation_size(p).unwrap(), 1008);
        assert!(matches!(
            a.allocate(16),
            Err(Error::OutOfMemory { requested: 16 })
        ));
        a.free(p).unwrap();
        assert_eq!(free_sizes(&a), vec![1008]);
    }

    #[test]
    fn oom_leaves_pool_untouched() {
        let mut a = pool(512);
        let p = a.allocate(100).unwrap();
        let before: Vec<_> = a.walk_pool().collect();
        assert!(a.allocate(10_000).unwrap_err().is_recoverable());
        assert!(a.allocate(usize::MAX).is_err());
        assert_eq!(a.walk_pool().collect::<Vec<_>>(), before);
        a.free(p).unwrap();
        a.check_integrity().unwrap();
    }

    #[test]
    fn freeing_coalesces_both_sides() {
        let mut a = pool(1024);
        let p1 = a.allocate(64).unwrap();
        let p2 = a.allocate(64).unwrap();
        let p3 = a.allocate(64).unwrap();
        let guard = a.allocate(64).unwrap();

        a.free(p1).unwrap();
        a.free(p3).unwrap();
        assert_eq!(free_sizes(&a).len(), 3);
        a.check_integrity().unwrap();

        a.free(p2).unwrap();
        let sizes = free_sizes(&a);
        assert_eq!(sizes[0], 3 * 64 + 2 * BLOCK_HEADER_SIZE);
        assert_eq!(sizes.len(), 2);
        a.check_integrity().unwrap();

        a.free(guard).unwrap();
        assert_eq!(free_sizes(&a), vec![a.usable_size()]);
    }

    #[test]
    fn shrink_in_place_returns_tail() {
        let mut a = pool(1024);
        let p = a.allocate(256).unwrap();
        let q = a.reallocate(p, 64).unwrap();
        assert_eq!(q, p);
        assert_eq!(a.get_allocation_size(q).unwrap(), 64);
        // tail merged with the free rest of the pool
        assert_eq!(free_sizes(&a), vec![a.usable_size() - 64 - BLOCK_HEADER_SIZE]);

        // too small a remainder to split: nothing changes
        let r = a.reallocate(q, 56).unwrap();
        assert_eq!(r, q);
        assert_eq!(a.get_allocation_size(r).unwrap(), 64);
        a.check_integrity().unwrap();
    }

    #[test]
    fn grow_in_place_absorbs_free_neighbour() {
        let mut a = pool(1024);
        let p = a.allocate(64).unwrap();
        a.payload_mut(p).unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
        let q = a.reallocate(p, 200).unwrap();
        assert_eq!(q, p);
        assert_eq!(a.get_allocation_size(q).unwrap(), 200);
        assert_eq!(&a.payload(q).unwrap()[..4], &[1, 2, 3, 4]);
        a.check_integrity().unwrap();
    }

    #[test]
    fn grow_moves_when_neighbour_is_used() {
        let mut a = pool(1024);
        let p = a.allocate(32).unwrap();
        let _blocker = a.allocate(32).unwrap();
        a.payload_mut(p).unwrap()[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());

        let q = a.reallocate(p, 128).unwrap();
        assert_ne!(q, p);
        assert_eq!(&a.payload(q).unwrap()[..4], &0xDEAD_BEEFu32.to_le_bytes());
        assert!(a.walk_pool().any(|b| b.ptr == p && b.is_free));
        a.check_integrity().unwrap();
    }

    #[test]
    fn failed_move_keeps_the_original() {
        let mut a = pool(256);
        let p = a.allocate(32).unwrap();
        let _blocker = a.allocate(32).unwrap();
        a.payload_mut(p).unwrap()[0] = 42;
        assert!(matches!(
            a.reallocate(p, 4096),
            Err(Error::OutOfMemory { .. })
        ));
        assert_eq!(a.payload(p).unwrap()[0], 42);
        a.check_integrity().unwrap();
    }

    #[test]
    fn reallocate_null_and_zero() {
        let mut a = pool(512);
        let p = a.reallocate(Pointer::NULL, 40).unwrap();
        assert_eq!(a.get_allocation_size(p).unwrap(), 40);
        assert_eq!(a.reallocate(p, 0).unwrap(), Pointer::NULL);
        assert_eq!(free_sizes(&a), vec![a.usable_size()]);
    }

    #[test]
    fn zeroed_allocation_clears_reused_bytes() {
        let mut a = pool(512);
        let p = a.allocate(64).unwrap();
        a.payload_mut(p).unwrap().fill(0xAB);
        a.free(p).unwrap();
        let q = a.allocate_zeroed(64).unwrap();
        assert!(a.payload(q).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn memory_range_checks() {
        let mut a = pool(512);
        let p = a.allocate(40).unwrap();
        assert!(a.is_valid_memory_range(p, 40));
        assert!(!a.is_valid_memory_range(p, 41));
        assert!(a.is_valid_memory_range(Pointer::NULL, 0));
        assert!(!a.is_valid_memory_range(Pointer::NULL, 1));
        assert!(!a.is_valid_memory_range(Pointer::new(p.get() + 4), 1));
        assert!(!a.is_valid_memory_range(Pointer::new(100_000), 1));
        a.free(p).unwrap();
        assert!(!a.is_valid_memory_range(p, 1));
    }

    #[test]
    fn ownership_is_tracked_through_moves() {
        let owner = OwnerId::from_name("record");
        let mut a = Allocator::with_region(
            vec![0u8; 1024],
            0,
            None,
            Some(AllocationRegistry::new()),
        )
        .unwrap();
        let parent = a.allocate_owned(32, owner, None).unwrap();
        let child = a.allocate_owned(32, owner, Some(parent)).unwrap();

        let moved = a.reallocate(parent, 256).unwrap();
        assert_ne!(moved, parent);
        let reg = a.registry().unwrap();
        assert!(!reg.contains(parent));
        assert_eq!(reg.get_node(child).unwrap().parent, Some(moved));

        assert_eq!(a.free_recursive(moved).unwrap(), 2);
        assert!(a.registry().unwrap().is_empty());
        assert_eq!(free_sizes(&a), vec![a.usable_size()]);
    }

    #[test]
    fn untracked_pool_ignores_owners() {
        let mut a = pool(512);
        let p = a.allocate_owned(32, OwnerId::new(1), None).unwrap();
        assert!(a.registry().is_none());
        assert_eq!(a.free_recursive(p).unwrap(), 1);
    }

    #[test]
    fn from_config_applies_region_and_registry() {
        let config = PoolConfig {
            region_start: 64,
            region_size: Some(512),
            track_ownership: true,
            ..PoolConfig::default()
        };
        let a = Allocator::from_config(vec![0u8; 1024], &config).unwrap();
        assert_eq!(a.region(), (64, 576));
        assert!(a.registry().is_some());
    }

    #[test]
    fn corruption_is_detected() {
        let mut a = pool(512);
        let p = a.allocate(32).unwrap();
        let h = block_from_ptr(p.offset());
        // pretend the block is free without filing it anywhere
        let word = block_word(a.buffer(), h).with_free(true);
        block_set_word(a.buffer_mut(), h, word);
        assert!(matches!(a.check_integrity(), Err(Error::Corrupted(_))));
    }

    #[test]
    fn alloc_free_round_trip_restores_free_lists() {
        for size in [1, 16, 100, 255, 256, 700, 2000] {
            let mut a = pool(8192);
            let held = a.allocate(48).unwrap();
            let fl_bitmap = a.fl_bitmap;
            let sl_bitmap = a.sl_bitmap;
            let blocks = a.blocks;

            let p = a.allocate(size).unwrap();
            a.free(p).unwrap();

            assert_eq!(a.fl_bitmap, fl_bitmap, "size {size}");
            assert_eq!(a.sl_bitmap, sl_bitmap, "size {size}");
            assert_eq!(a.blocks, blocks, "size {size}");
            a.free(held).unwrap();
        }
    }

    #[test]
    fn interior_pointer_is_not_a_valid_range() {
        let mut a = pool(1024);
        let p = a.allocate(128).unwrap();
        // a used, 32-byte block header as payload bytes
        a.payload_mut(p).unwrap()[..8].copy_from_slice(&[0, 0, 0, 0, 32, 0, 0, 0]);
        let interior = Pointer::new(p.get() + 8);
        assert!(!a.is_valid_memory_range(interior, 32));
        assert!(a.is_valid_memory_range(p, 128));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn double_free_is_rejected() {
        let mut a = pool(512);
        let p = a.allocate(32).unwrap();
        let _keep = a.allocate(32).unwrap();
        a.free(p).unwrap();
        assert!(matches!(a.free(p), Err(Error::Safety(_))));
        assert!(matches!(a.free(Pointer::new(3)), Err(Error::Safety(_))));
        a.check_integrity().unwrap();
    }

    #[cfg(debug_assertions)]
    #[test]
    fn freed_payload_is_stomped() {
        let mut a = pool(512);
        let p = a.allocate(64).unwrap();
        let _keep = a.allocate(32).unwrap();
        a.payload_mut(p).unwrap().fill(0x11);
        a.free(p).unwrap();
        let start = p.offset() + crate::block::FREE_LINKS_SIZE;
        assert!(a.buffer()[start..p.offset() + 64]
            .iter()
            .all(|&b| b == FREED_PATTERN));
    }

    #[cfg(feature = "stats")]
    #[test]
    fn statistics_account_for_every_byte() {
        let mut a = pool(4096);
        let p = a.allocate(100).unwrap();
        let q = a.allocate(300).unwrap();
        let _r = a.allocate(50).unwrap();
        a.free(p).unwrap();
        a.reallocate(q, 40).unwrap();
        a.allocate(usize::MAX).unwrap_err();

        let s = a.statistics();
        assert_eq!(
            s.used_payload_bytes
                + s.used_overhead_bytes
                + s.free_payload_bytes
                + s.free_overhead_bytes,
            a.usable_size() + BLOCK_HEADER_SIZE
        );
        assert_eq!(s.active_allocations, 2);
        assert_eq!(s.peak_active_allocations, 3);
        assert_eq!(s.allocate.failed, 1);
        assert_eq!(s.realloc_outcomes.shrunk_in_place, 1);
        assert_eq!(s.free_blocks, a.walk_pool().filter(|b| b.is_free).count());
    }
}
