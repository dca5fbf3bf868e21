use bestfit_alloc::UnixAllocator;

#[global_allocator]
static A: UnixAllocator = UnixAllocator::new();

fn main() {
    let greeting = String::from("Hello, World!");
    println!("{}", greeting);
    println!("Heap: {:?}", A.heap_stats());
}
