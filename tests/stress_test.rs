use core::ptr::{null_mut, NonNull};

use seg_allocator::blocks::{BlockPtr, WSIZE};
use seg_allocator::heap::Heap;
use seg_allocator::region::{ToyRegion, ToyStorage};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

/// One caller-held allocation: where it is, how much was asked for, and the
/// byte pattern written over the requested payload.
#[derive(Copy, Clone)]
struct Slot {
    ptr: *mut u8,
    requested: usize,
    fill: u8,
}

const EMPTY: Slot = Slot {
    ptr: null_mut(),
    requested: 0,
    fill: 0,
};

/// Sum of the actual block sizes behind every live slot, read back through
/// the headers.
fn live_block_bytes(slots: &[Slot]) -> usize {
    slots
        .iter()
        .filter(|slot| !slot.ptr.is_null())
        .map(|slot| unsafe {
            BlockPtr::from_payload(NonNull::new_unchecked(slot.ptr)).size()
        })
        .sum()
}

fn validate(heap: &Heap<ToyRegion<'_>>, slots: &[Slot]) {
    let (validity, stats) = heap.stats();
    log::info!("stats: {:?}, index: {}", stats, heap.index());
    assert!(validity.is_valid(), "invalid heap: {:?}", validity);

    // Every byte the grower handed over is either sentinel overhead, a live
    // block, or on a free list.
    let live = live_block_bytes(slots);
    assert_eq!(live + stats.free_bytes, stats.region_bytes - 4 * WSIZE);

    // Caller payloads are untouched by allocator bookkeeping.
    for slot in slots.iter().filter(|slot| !slot.ptr.is_null()) {
        for offset in 0..slot.requested {
            let byte = unsafe { slot.ptr.add(offset).read() };
            assert_eq!(byte, slot.fill, "payload corrupted at offset {}", offset);
        }
    }
}

fn fill(slot: &Slot) {
    for offset in 0..slot.requested {
        unsafe { slot.ptr.add(offset).write(slot.fill) };
    }
}

#[test]
fn test_stress() {
    let mut storage = ToyStorage::new();
    let mut heap = Heap::init(ToyRegion::new(&mut storage)).unwrap();

    let mut slots: [Slot; 128] = [EMPTY; 128];

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 24);

    for step in 0..1024 * 10 {
        let index = rng.gen_range(0..slots.len());
        let slot = slots[index];

        if slot.ptr.is_null() {
            // Allocate into the empty slot and pattern the payload.
            let size = range.sample(&mut rng) * range.sample(&mut rng);
            let ptr = heap.alloc(size).expect("toy region exhausted");
            log::info!("[{}] alloc({}) -> {:?}", step, size, ptr);

            let new_slot = Slot {
                ptr: ptr.as_ptr(),
                requested: size,
                fill: rng.gen(),
            };
            fill(&new_slot);
            slots[index] = new_slot;
        } else if rng.gen_bool(0.5) {
            log::info!("[{}] free({:?})", step, slot.ptr);
            unsafe { heap.free(slot.ptr) };
            slots[index] = EMPTY;
        } else {
            // Reallocate: the common prefix must survive the move, whichever
            // of the in-place or relocation paths gets taken.
            let new_size = range.sample(&mut rng) * range.sample(&mut rng);
            let ptr = unsafe { heap.realloc(slot.ptr, new_size) }
                .expect("toy region exhausted");
            log::info!(
                "[{}] realloc({:?}, {} -> {}) -> {:?}",
                step,
                slot.ptr,
                slot.requested,
                new_size,
                ptr
            );

            let preserved = slot.requested.min(new_size);
            for offset in 0..preserved {
                let byte = unsafe { ptr.as_ptr().add(offset).read() };
                assert_eq!(byte, slot.fill, "realloc lost byte {}", offset);
            }

            let new_slot = Slot {
                ptr: ptr.as_ptr(),
                requested: new_size,
                fill: rng.gen(),
            };
            fill(&new_slot);
            slots[index] = new_slot;
        }

        validate(&heap, &slots);
    }

    // Drain every slot, in random order; the region must coalesce back into
    // a single free block.
    let mut order: [usize; 128] = core::array::from_fn(|i| i);
    order.shuffle(&mut rng);
    for &index in order.iter() {
        if !slots[index].ptr.is_null() {
            unsafe { heap.free(slots[index].ptr) };
            slots[index] = EMPTY;
            validate(&heap, &slots);
        }
    }

    let (validity, stats) = heap.stats();
    assert!(validity.is_valid());
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, stats.region_bytes - 4 * WSIZE);
}
