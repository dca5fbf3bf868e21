//! This is a very minimal example to show using the HeapGrower functions.

use bestfit_alloc::allocators::{BrkHeapGrower, HeapGrower};

fn main() {
    // BrkHeapGrower moves the program break with sbrk, a page at a time
    let mut grower = BrkHeapGrower::default();
    for &size in &[64usize, 4096, 64] {
        let p = unsafe { grower.grow_heap(size).unwrap() };
        println!("Returned: ({:p}={}, {})", p, p.as_ptr() as usize, size);
    }
    println!(
        "Moved the break {} times, by {} pages",
        grower.growths(),
        grower.pages()
    );
}
