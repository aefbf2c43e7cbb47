#![no_std]

//! A dynamic storage allocator built on segregated free lists and boundary
//! tags.
//!
//! The allocator manages a single contiguous region of memory obtained from
//! an sbrk-style growth primitive, and hands out eight-byte-aligned payloads
//! through the classic triad: allocate, free, reallocate.
//!
//! ```text
//!  region:  [pad|prologue| block | block | block | ... |epilogue]
//!                            |               |
//!  index:   class lists ->  free  <------>  free   (per size class)
//! ```
//!
//! Every block carries a header/footer tag pair packing its size with an
//! allocation bit, so a block can find both physical neighbours in O(1) and
//! freed blocks merge with free neighbours immediately. Free blocks are
//! additionally threaded onto one of sixteen doubly linked size-class lists,
//! which is what keeps the fit search near constant time.
//!
//! The pieces, bottom up:
//!
//! - [`region`]: the growable `[lo, hi)` range and the
//!   [`RegionGrower`] collaborator that extends it.
//! - [`blocks`]: the boundary-tag layout, the one module that touches raw
//!   memory.
//! - [`seglist`]: the segregated free index.
//! - [`heap`]: the policy engine: placement, splitting, coalescing,
//!   reallocation, and the consistency check.
//! - [`allocators`]: lock-fronted wrappers implementing
//!   [`core::alloc::GlobalAlloc`].
//!
//! A [`Heap`] can be driven directly for single-threaded use, or installed
//! globally through [`UnixAllocator`]:
//!
//! ```rust,ignore
//! use seg_allocator::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//! ```

#[cfg(test)]
extern crate std;

pub mod allocators;
pub mod blocks;
pub mod heap;
pub mod region;
pub mod seglist;

pub use allocators::GenericAllocator;
#[cfg(feature = "use_libc")]
pub use allocators::UnixAllocator;
pub use heap::{Heap, Policy, Stats, Validity};
#[cfg(feature = "use_libc")]
pub use region::SbrkGrower;
pub use region::{RegionGrower, ToyRegion, ToyStorage};
