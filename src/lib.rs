#![cfg_attr(not(test), no_std)]

//! A best-fit, free-list memory allocator in pure Rust.
//!
//! This is a general-purpose dynamic memory allocator offering the four
//! classic operations: allocate, zero-allocate, resize, and release. It grows
//! a single heap on demand and recycles freed memory through an explicit,
//! doubly linked free list kept in address order.
//!
//! Every block in the heap is laid out as a fixed-size header followed by the
//! payload handed to the caller:
//!
//! ```text
//!   heap start                                                  heap end
//!   |                                                                  |
//!   +--------+-----------+--------+-------+--------+------------------+
//!   | header | payload A | header | free  | header |    payload C     |
//!   +--------+-----------+--------+-------+--------+------------------+
//!              ^                    ^
//!              |                    +-- linked into the free list
//!              +-- pointer returned to the caller
//! ```
//!
//! Allocation picks the smallest free block that fits (ties go to the lowest
//! address), splitting off the remainder when there is room for another
//! header. Release puts the block back into the free list and merges it with
//! free neighbours on either side, so no two adjacent blocks are ever free at
//! the same time.
//!
//! ## Usage
//!
//! As a global allocator:
//!
//! ```no_run
//! use bestfit_alloc::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//!
//! fn main() {
//!     let v: Vec<u64> = (0..1024).collect();
//!     assert_eq!(v.len(), 1024);
//! }
//! ```
//!
//! Or as an explicit context over a fixed buffer, which is handy for tests:
//!
//! ```
//! use bestfit_alloc::allocators::{RawAlloc, ToyHeap};
//!
//! let mut allocator = RawAlloc::new(ToyHeap::default());
//! let ptr = allocator.allocate(64).unwrap();
//! unsafe { allocator.release(ptr.as_ptr()) };
//! assert_eq!(allocator.allocate(64).unwrap(), ptr);
//! ```
//!
//! ## Features
//!
//! - `logging`: emit `log` records from inside the allocator. The logger
//!   must not allocate if this allocator is installed globally, or every log
//!   call will try to re-enter it.

#[macro_use]
mod macros;

pub mod allocators;
pub mod blocklist;
pub mod error;
#[cfg(unix)]
pub mod unix;

pub use allocators::{GenericAllocator, HeapGrower, RawAlloc, ToyHeap};
pub use error::AllocError;
#[cfg(unix)]
pub use allocators::UnixAllocator;
