//! An example program that installs the allocator globally, builds and
//! destroys a pile of ordinary collections on top of it, and checks heap
//! consistency at the end.

use seg_allocator::UnixAllocator;

// This is the magic line that routes every heap allocation in the program
// through the segregated-list allocator.
#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

fn main() {
    env_logger::init();
    println!("Hello from the segregated heap!");

    let s: String = "abc".to_owned();
    println!("Got a string {}", s);

    let mut v = vec![0u64, 1, 2, 3];
    for n in 10..2048 {
        v.push(n);
    }
    println!("Got a vec of {} elements", v.len());

    let mut words: Vec<String> = Vec::new();
    for n in 0..512 {
        words.push(format!("word-{}", n));
    }
    words.truncate(16);
    words.shrink_to_fit();
    println!("Kept {} words", words.len());

    let (validity, stats) = ALLOCATOR.stats().expect("allocator initialised");
    println!("Heap stats: {:?}", stats);
    assert!(validity.is_valid(), "inconsistent heap: {:?}", validity);
    println!("Heap checks out.");
}
