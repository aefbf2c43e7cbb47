//! The allocation policy engine.
//!
//! [`Heap`] ties the pieces together: it owns the [`Region`], the
//! [`SegIndex`], and the placement state, and implements the public
//! operations (allocate, free, reallocate) plus the consistency check.
//!
//! The region is laid out as a classic boundary-tag heap:
//!
//! ```text
//! [pad | prologue hdr | prologue ftr | block | block | ... | epilogue hdr]
//! ```
//!
//! The prologue and epilogue are permanently-allocated sentinels. They mean
//! a neighbour lookup always lands on a valid tag with the allocation bit
//! set at either end of the region, so coalescing needs no edge branches.
//!
//! Placement, splitting, search depth, and reallocation behaviour are all
//! governed by a [`Policy`], fixed when the heap is created.

use core::ptr::NonNull;

use log::debug;

use crate::blocks::{round_up, BlockPtr, DSIZE, MIN_BLOCK, WSIZE};
use crate::region::{GrowError, Region, RegionGrower};
use crate::seglist::{class_of, SegIndex, NUM_CLASSES};

/// Build-time tuning knobs. None of these affect correctness; they shape
/// fragmentation and search cost.
pub struct Policy {
    /// Minimum region extension, in bytes. Growth requests are
    /// `max(needed, chunk_size)`.
    pub chunk_size: usize,
    /// How many further nodes a fit search examines per list once it has a
    /// candidate. `0` degenerates to first fit, `usize::MAX` to best fit.
    pub fit_depth: usize,
    /// Alternate the side of the split an allocation takes, flipping on
    /// every region extension.
    pub alternate_placement: bool,
    /// Minimum remainder worth splitting off during a reallocation. Larger
    /// than the allocation split minimum to discourage churn.
    pub realloc_split_threshold: usize,
    /// Multiplier applied to the requested size when a reallocation must
    /// relocate, pre-sizing the new block to dampen future moves. `1`
    /// disables buffering.
    pub realloc_reserve: usize,
    /// Number of small blocks carved out of the initial free block at init.
    /// `0` disables pre-partitioning.
    pub init_partition: usize,
    /// Payload size of the carved blocks.
    pub init_partition_size: usize,
}

impl Policy {
    pub const DEFAULT: Policy = Policy {
        chunk_size: 4096,
        fit_depth: usize::MAX,
        alternate_placement: false,
        realloc_split_threshold: 4096,
        realloc_reserve: 1,
        init_partition: 0,
        init_partition_size: 64,
    };
}

impl Default for Policy {
    fn default() -> Policy {
        Policy::DEFAULT
    }
}

/// Total block size a request for `size` payload bytes occupies: header and
/// footer overhead added, rounded to [`DSIZE`], and at least [`MIN_BLOCK`]
/// so the block can hold free-list links once it is freed.
///
/// `None` when the adjusted size overflows, which the caller reports as
/// allocation failure.
pub fn block_size(size: usize) -> Option<usize> {
    if size <= DSIZE {
        return Some(MIN_BLOCK);
    }
    let total = size.checked_add(DSIZE + (DSIZE - 1))?;
    Some((total / DSIZE * DSIZE).max(MIN_BLOCK))
}

/// A single-threaded heap over one contiguous, growable region.
///
/// Created by [`Heap::init`]; lives until dropped, and never returns memory
/// to its grower. All pointers it hands out are aligned to [`DSIZE`] and
/// stay valid until freed.
pub struct Heap<G: RegionGrower> {
    region: Region<G>,
    index: SegIndex,
    /// Payload pointer of the prologue sentinel; heap walks start at its
    /// physical successor.
    prologue: BlockPtr,
    /// Placement side toggle, flipped on every extension when
    /// `alternate_placement` is on.
    alt: bool,
    policy: Policy,
}

impl<G: RegionGrower> Heap<G> {
    /// Create a heap with the default [`Policy`].
    pub fn init(grower: G) -> Result<Heap<G>, GrowError<G::Err>> {
        Heap::with_policy(grower, Policy::DEFAULT)
    }

    /// Create a heap with an explicit policy.
    ///
    /// Performs one growth covering the sentinels plus `chunk_size` bytes of
    /// initial free space. Anything extra the grower hands back (page
    /// rounding) is folded into the initial free block.
    pub fn with_policy(grower: G, policy: Policy) -> Result<Heap<G>, GrowError<G::Err>> {
        let mut region = Region::new(grower);
        let initial = 4 * WSIZE + policy.chunk_size.max(MIN_BLOCK);
        let (base, got) = unsafe { region.grow(initial)? };
        let base = base.as_ptr();

        unsafe {
            // Alignment pad, then the prologue: a DSIZE block that is only
            // ever header and footer.
            base.cast::<u32>().write(0);
            let prologue = BlockPtr::from_payload(NonNull::new_unchecked(base.add(DSIZE)));
            prologue.set_tags(DSIZE, true);

            // Everything up to the epilogue is one free block.
            let first = prologue.next();
            first.set_tags(got - 4 * WSIZE, false);
            first.next().set_header(0, true);

            let mut heap = Heap {
                region,
                index: SegIndex::new(),
                prologue,
                alt: false,
                policy,
            };
            heap.index.insert(first);

            if heap.policy.init_partition > 0 {
                heap.prepartition(first);
            }

            Ok(heap)
        }
    }

    /// Carve the initial free block into `init_partition` small blocks plus
    /// a remainder, all free and indexed. The carved blocks are adjacent by
    /// construction; the consistency check reports them under
    /// [`Validity::adjacents`] until they are allocated or coalesce away.
    unsafe fn prepartition(&mut self, initial: BlockPtr) {
        let carve = match block_size(self.policy.init_partition_size) {
            Some(carve) => carve,
            None => return,
        };

        self.index.unlink(initial);

        let mut bp = initial;
        let mut remaining = initial.size();
        let mut carved = 0;
        while carved < self.policy.init_partition && remaining >= carve + MIN_BLOCK {
            bp.set_tags(carve, false);
            self.index.insert(bp);
            bp = bp.next();
            remaining -= carve;
            carved += 1;
        }

        bp.set_tags(remaining, false);
        self.index.insert(bp);
    }

    /// Allocate `size` bytes. The returned pointer is aligned to [`DSIZE`].
    ///
    /// Returns `None` for `size == 0`, on adjusted-size overflow, and when
    /// the region cannot be extended far enough.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let asize = block_size(size)?;

        unsafe {
            if let Some(bp) = self.find_fit(asize) {
                return Some(self.place(bp, asize));
            }

            // No fit; grab a fresh chunk and place there.
            let bp = self.extend(asize.max(self.policy.chunk_size))?;
            Some(self.place(bp, asize))
        }
    }

    /// Free an allocation. `ptr` may be null, in which case nothing happens.
    /// The block is merged with any free neighbour and is immediately
    /// reusable.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have come from this heap's [`Heap::alloc`] or
    /// [`Heap::realloc`] and not have been freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let payload = match NonNull::new(ptr) {
            Some(payload) => payload,
            None => return,
        };

        let bp = BlockPtr::from_payload(payload);
        let size = bp.size();
        bp.set_tags(size, false);
        self.coalesce(bp);
    }

    /// Resize an allocation to `size` payload bytes, preserving the common
    /// prefix of the payload.
    ///
    /// `realloc(null, size)` behaves as `alloc(size)`; `realloc(ptr, 0)`
    /// behaves as `free(ptr)` and returns `None`. The block is grown or
    /// shrunk in place whenever a free neighbour allows it; only as a last
    /// resort is it relocated, and the old block is freed only after the new
    /// one is populated. On failure the old block is left untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::free`] for non-null `ptr`.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        let payload = match NonNull::new(ptr) {
            Some(payload) => payload,
            None => return self.alloc(size),
        };
        if size == 0 {
            self.free(ptr);
            return None;
        }

        let bp = BlockPtr::from_payload(payload);
        let asize = block_size(size)?;
        let old_size = bp.size();

        // Shrink (or already big enough): stay in place, splitting only a
        // remainder worth keeping.
        if asize <= old_size {
            self.retag_in_place(bp, old_size, asize);
            return Some(bp.payload());
        }

        let next = bp.next();
        let next_free = !next.is_allocated();
        let next_size = next.size();

        // Grow into the free successor: the payload does not move.
        if next_free && old_size + next_size >= asize {
            self.index.unlink(next);
            self.retag_in_place(bp, old_size + next_size, asize);
            return Some(bp.payload());
        }

        if !bp.prev_allocated() {
            let prev = bp.prev();
            let prev_size = prev.size();
            let copy_len = (old_size - DSIZE).min(size);

            // Grow into the free predecessor. The predecessor must be
            // unlinked before the copy lands on its link words.
            if prev_size + old_size >= asize {
                self.index.unlink(prev);
                core::ptr::copy(bp.as_ptr(), prev.as_ptr(), copy_len);
                self.retag_in_place(prev, prev_size + old_size, asize);
                return Some(prev.payload());
            }

            // Both neighbours together reach the target.
            if next_free && prev_size + old_size + next_size >= asize {
                self.index.unlink(prev);
                self.index.unlink(next);
                core::ptr::copy(bp.as_ptr(), prev.as_ptr(), copy_len);
                self.retag_in_place(prev, prev_size + old_size + next_size, asize);
                return Some(prev.payload());
            }
        }

        // Relocate, pre-sized by the reserve multiplier.
        let reserve = size
            .checked_mul(self.policy.realloc_reserve)
            .unwrap_or(size);
        let new = self.alloc(reserve)?;
        debug!("realloc relocating {:?} -> {:?}", ptr, new.as_ptr());
        core::ptr::copy_nonoverlapping(ptr, new.as_ptr(), (old_size - DSIZE).min(size));
        self.free(ptr);
        Some(new)
    }

    /// Retag `bp` as an allocated block of `total` bytes, splitting off the
    /// tail as a new free block when it clears the reallocation threshold.
    ///
    /// The remainder goes through the coalescer, not a bare insert: after a
    /// shrink its physical successor may itself be free.
    unsafe fn retag_in_place(&mut self, bp: BlockPtr, total: usize, asize: usize) {
        let threshold = self.policy.realloc_split_threshold.max(MIN_BLOCK);
        if total - asize >= threshold {
            bp.set_tags(asize, true);
            let remainder = bp.next();
            remainder.set_tags(total - asize, false);
            self.coalesce(remainder);
        } else {
            bp.set_tags(total, true);
        }
    }

    /// Bounded best-fit search. Starts at the class for `asize` and moves
    /// upward; within a list, tracks the smallest block that fits, returns
    /// immediately on an exact match, and once a candidate exists gives up
    /// on the list after `fit_depth` further nodes.
    unsafe fn find_fit(&self, asize: usize) -> Option<BlockPtr> {
        for class in class_of(asize)..NUM_CLASSES {
            let mut best: Option<(BlockPtr, usize)> = None;
            let mut depth = 0;

            let mut cursor = self.index.head(class);
            while let Some(bp) = cursor {
                if best.is_some() && depth >= self.policy.fit_depth {
                    break;
                }

                let size = bp.size();
                if size >= asize {
                    if size == asize {
                        return Some(bp);
                    }
                    if best.map_or(true, |(_, best_size)| size < best_size) {
                        best = Some((bp, size));
                    }
                }

                cursor = bp.next_free();
                depth += 1;
            }

            if let Some((bp, _)) = best {
                return Some(bp);
            }
        }

        None
    }

    /// Commit a free block to a request: unlink it, split off the surplus if
    /// it can stand alone as a free block, and return the payload.
    ///
    /// The allocated piece normally sits at the low address. Under the
    /// alternating policy, extensions flip which side it takes, so
    /// successive chunks fill from opposite ends.
    unsafe fn place(&mut self, bp: BlockPtr, asize: usize) -> NonNull<u8> {
        let csize = bp.size();
        self.index.unlink(bp);

        if csize - asize < MIN_BLOCK {
            // Too little left over to stand alone; hand out the whole block.
            bp.set_tags(csize, true);
            return bp.payload();
        }

        if self.policy.alternate_placement && self.alt {
            // Free remainder low, allocated piece high.
            bp.set_tags(csize - asize, false);
            let allocated = bp.next();
            allocated.set_tags(asize, true);
            self.index.insert(bp);
            allocated.payload()
        } else {
            bp.set_tags(asize, true);
            let remainder = bp.next();
            remainder.set_tags(csize - asize, false);
            self.index.insert(remainder);
            bp.payload()
        }
    }

    /// Merge a free block with its free physical neighbours, insert the
    /// result into the index, and return it. The sentinels guarantee both
    /// neighbour tags exist.
    unsafe fn coalesce(&mut self, bp: BlockPtr) -> BlockPtr {
        let prev_allocated = bp.prev_allocated();
        let next = bp.next();
        let next_allocated = next.is_allocated();

        let mut bp = bp;
        let mut size = bp.size();

        match (prev_allocated, next_allocated) {
            (true, true) => {}
            (true, false) => {
                self.index.unlink(next);
                size += next.size();
                bp.set_tags(size, false);
            }
            (false, true) => {
                let prev = bp.prev();
                self.index.unlink(prev);
                size += prev.size();
                bp = prev;
                bp.set_tags(size, false);
            }
            (false, false) => {
                let prev = bp.prev();
                self.index.unlink(prev);
                self.index.unlink(next);
                size += prev.size() + next.size();
                bp = prev;
                bp.set_tags(size, false);
            }
        }

        self.index.insert(bp);
        bp
    }

    /// Extend the region by at least `bytes`, form the fresh memory into one
    /// free block, and merge it with a trailing free block if there is one.
    ///
    /// The new block's header lands where the old epilogue was; a new
    /// epilogue is written at the far end.
    unsafe fn extend(&mut self, bytes: usize) -> Option<BlockPtr> {
        let size = round_up(bytes.max(MIN_BLOCK), DSIZE);
        let (base, got) = match self.region.grow(size) {
            Ok(growth) => growth,
            Err(_) => {
                debug!("region growth of {} bytes refused", size);
                return None;
            }
        };

        let bp = BlockPtr::from_payload(base);
        bp.set_tags(got, false);
        bp.next().set_header(0, true);

        if self.policy.alternate_placement {
            self.alt = !self.alt;
        }

        Some(self.coalesce(bp))
    }

    pub fn region(&self) -> &Region<G> {
        &self.region
    }

    pub fn index(&self) -> &SegIndex {
        &self.index
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Run the consistency check. See [`Validity`].
    pub fn check(&self) -> Validity {
        self.stats().0
    }

    /// Walk the heap and the index, cross-checking them, and report both the
    /// violations found and summary statistics.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats {
            region_bytes: self.region.hi() as usize - self.region.lo() as usize,
            ..Stats::default()
        };

        unsafe {
            // Physical walk, prologue to epilogue.
            let mut bp = self.prologue.next();
            let mut prev_was_free = false;
            while self.region.contains(bp.as_ptr()) && bp.size() > 0 {
                let size = bp.size();

                if bp.header() != bp.footer() {
                    validity.tag_mismatches += 1;
                }
                if size % DSIZE != 0 || bp.as_ptr() as usize % DSIZE != 0 {
                    validity.misaligned += 1;
                }

                let free = !bp.is_allocated();
                if free {
                    stats.free_blocks += 1;
                    stats.free_bytes += size;
                    if prev_was_free {
                        validity.adjacents += 1;
                    }
                    if !self.index.blocks(class_of(size)).any(|listed| listed == bp) {
                        validity.unindexed_frees += 1;
                    }
                }

                stats.blocks += 1;
                prev_was_free = free;
                bp = bp.next();
            }

            // Index walk: every entry must be a free, in-bounds block filed
            // under the right class, with in-bounds links.
            for class in 0..NUM_CLASSES {
                for listed in self.index.blocks(class) {
                    if !self.region.contains(listed.as_ptr()) {
                        validity.misfiled += 1;
                        break;
                    }
                    if listed.is_allocated() || class_of(listed.size()) != class {
                        validity.misfiled += 1;
                    }
                    for link in [listed.next_free(), listed.prev_free()].into_iter().flatten() {
                        if !self.region.contains(link.as_ptr()) {
                            validity.misfiled += 1;
                        }
                    }
                }
            }
        }

        (validity, stats)
    }
}

/// A tally of every invalid state found by a heap walk. All-zero means the
/// heap and index are consistent.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks whose header and footer tags disagree. Corruption.
    pub tag_mismatches: usize,
    /// Blocks with a misaligned size or payload address.
    pub misaligned: usize,
    /// Adjacent free pairs that escaped coalescing. Not corrupt, but should
    /// only ever be seen with init pre-partitioning enabled.
    pub adjacents: usize,
    /// Free blocks missing from their size-class list.
    pub unindexed_frees: usize,
    /// Index entries that are allocated, filed under the wrong class, or
    /// pointing outside the region.
    pub misfiled: usize,
}

impl Validity {
    /// Simple check that every tally is zero.
    pub fn is_valid(&self) -> bool {
        self.tag_mismatches == 0
            && self.misaligned == 0
            && self.adjacents == 0
            && self.unindexed_frees == 0
            && self.misfiled == 0
    }
}

impl From<Validity> for bool {
    fn from(validity: Validity) -> bool {
        validity.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct Stats {
    /// Blocks in the region, allocated or free, sentinels excluded.
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    /// Total bytes obtained from the grower, sentinels included.
    pub region_bytes: usize,
}
