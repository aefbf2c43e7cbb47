//! Ready-made allocator wrappers around [`Heap`].
//!
//! ## Types
//!
//! ### [`GenericAllocator`]
//!
//! A `GenericAllocator` lazily builds a [`Heap`] over any
//! [`RegionGrower`](crate::region::RegionGrower) behind a spin lock, giving
//! it a `const` constructor and a `Sync` bound, the two things
//! `core::alloc::GlobalAlloc` demands that the heap itself does not provide.
//! The heap stays single-threaded; the lock serialises callers in front of
//! it.
//!
//! ### [`UnixAllocator`]
//!
//! A `GenericAllocator` over the sbrk-backed [`SbrkGrower`], suitable as a
//! `#[global_allocator]` on Unix.
//!
//! Payloads are aligned to [`DSIZE`]; layouts demanding more report
//! allocation failure rather than hand back a lie.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::MaybeUninit;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::{Mutex, MutexGuard};

use crate::blocks::DSIZE;
use crate::heap::{Heap, Stats, Validity};
#[cfg(feature = "use_libc")]
use crate::region::SbrkGrower;
use crate::region::RegionGrower;

/// A lazily-initialised, lock-fronted [`Heap`].
pub struct GenericAllocator<G: RegionGrower> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    // - 3: Initialization failed; the grower refused the first growth
    init: AtomicU8,
    heap: MaybeUninit<Mutex<Heap<G>>>,
}

impl<G: RegionGrower> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            heap: MaybeUninit::uninit(),
        }
    }
}

impl<G: RegionGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: RegionGrower + Default> GenericAllocator<G> {
    /// Get a handle on the underlying heap, initialising it on first use.
    ///
    /// Returns `None` if initialisation failed (the grower would not supply
    /// the initial chunk), in which case every allocation request reports
    /// failure.
    ///
    /// # Safety
    ///
    /// Allocation is blocked while the returned guard is held.
    pub unsafe fn get_heap(&self) -> Option<MutexGuard<Heap<G>>> {
        // The plan:
        // - Check if initialization hasn't started (0)
        // - If it hasn't (0): mark it in progress (1), build the heap, then
        //   mark it done (2) or failed (3)
        // - If it has started but not completed (1): spin until it settles
        // - If it settled (2 or 3): use or refuse accordingly
        //
        // The ordering here is SeqCst because that's the safest, if not the
        // most efficient.
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {
                // Fully initialized, nothing to do
            }
            Err(3) => return None,
            Ok(0) => {
                // We haven't initialized, so we do that now.
                let heap_loc = self.heap.as_ptr() as *mut Mutex<Heap<G>>;
                return match Heap::init(G::default()) {
                    Ok(heap) => {
                        heap_loc.write(Mutex::new(heap));
                        // Let other threads know the heap is ready for use
                        self.init.store(2, Ordering::SeqCst);
                        Some(heap_loc.as_ref().unwrap().lock())
                    }
                    Err(_) => {
                        self.init.store(3, Ordering::SeqCst);
                        None
                    }
                };
            }
            Err(1) => {
                // Some other thread is currently initializing. Wait for it.
                loop {
                    core::hint::spin_loop();
                    match self.init.load(Ordering::SeqCst) {
                        1 => continue,
                        2 => break,
                        3 => return None,
                        state => panic!("Unexpected state {}", state),
                    }
                }
            }
            Ok(v) => panic!("Unexpected OK state loaded: {}", v),
            Err(v) => panic!("Unexpected Err state loaded: {}", v),
        }

        Some(self.heap.as_ptr().as_ref().unwrap().lock())
    }

    /// Run the heap's consistency check and return it with usage statistics.
    pub fn stats(&self) -> Option<(Validity, Stats)> {
        unsafe { self.get_heap().map(|heap| heap.stats()) }
    }
}

unsafe impl<G: RegionGrower + Default + Send> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > DSIZE {
            // Stricter alignment than the heap guarantees.
            return null_mut();
        }
        match self.get_heap() {
            Some(mut heap) => heap
                .alloc(layout.size())
                .map_or(null_mut(), |payload| payload.as_ptr()),
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(mut heap) = self.get_heap() {
            heap.free(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > DSIZE {
            return null_mut();
        }
        match self.get_heap() {
            Some(mut heap) => heap
                .realloc(ptr, new_size)
                .map_or(null_mut(), |payload| payload.as_ptr()),
            None => null_mut(),
        }
    }
}

/// The global-allocator-ready configuration: a [`Heap`] growing through
/// `sbrk`, behind the [`GenericAllocator`] lock.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<SbrkGrower>,
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> Option<(Validity, Stats)> {
        self.alloc.stats()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}
