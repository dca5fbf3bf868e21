//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded, non-thread-safe allocator context: it
//! owns a heap grower, tracks the heap it has grown, and recycles freed
//! blocks through a best-fit free list. It offers allocate, zero-allocate,
//! resize and release, plus C-style `malloc`/`calloc`/`realloc`/`free`
//! wrappers that report failure as a null pointer.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` lazily creates a `RawAlloc` on first use and wraps it
//! with a spin lock, so that it can live in a `static`.
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` is a `GenericAllocator` growing the heap with `sbrk`, and
//! implements `GlobalAlloc` so it can be used as the global allocator.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls to
//! the OS to expand the heap.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a static array that can pretend to be a heap, and implements
//! `HeapGrower` for such a purpose. It is mainly useful for testing.

#[cfg(unix)]
use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::{null_mut, NonNull};

#[cfg(unix)]
use errno::Errno;
use spin::{Mutex, MutexGuard, Once};

use crate::blocklist::{Block, BlockList, Relation, Stats, Validity, ALIGNMENT, HEADER_SIZE};
use crate::error::AllocError;
#[cfg(unix)]
use crate::unix;

// Round up value to the nearest multiple of increment, or None if that does
// not fit in a usize.
fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    let steps = (value - 1) / increment + 1;
    steps.checked_mul(increment)
}

/// A source of fresh memory for the heap.
///
/// # Safety
///
/// Implementors promise that every successful `grow_heap(size)` returns a
/// pointer aligned to `ALIGNMENT`, to `size` bytes of readable and writable
/// memory that nothing else in the program uses, and that stays valid for as
/// long as the grower lives.
///
/// Each region is expected to start where the previous one ended. The
/// allocator stays correct when that doesn't hold (it only ever merges blocks
/// that touch), but a gap cannot be reused.
pub unsafe trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the heap by exactly `size` bytes, returning the start of the new
    /// region.
    ///
    /// # Safety
    ///
    /// `size` must be a multiple of `ALIGNMENT`.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;
}

/// BrkHeapGrower moves the program break to grow the heap upon request.
///
/// The break is moved in whole pages, and the pages are then handed out in
/// exactly the slices asked for, so consecutive growths are adjacent for as
/// long as nothing else in the process moves the break.
#[cfg(unix)]
#[derive(Default)]
pub struct BrkHeapGrower {
    // Start of the part of the reservation not yet handed out
    next: usize,
    // End of the reservation; the program break, last we moved it
    limit: usize,
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

#[cfg(unix)]
impl BrkHeapGrower {
    /// Number of pages the break has been moved by.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Number of times the break has been moved.
    pub fn growths(&self) -> usize {
        self.growths
    }
}

#[cfg(unix)]
unsafe impl HeapGrower for BrkHeapGrower {
    type Err = Errno;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        while self.limit - self.next < size {
            let pagesize = unix::page_size();
            let brk = unix::sbrk(0)?.as_ptr() as usize;

            // If the break is where we left it, the reservation can simply be
            // extended. Otherwise (first call, or someone else moved the
            // break) we start a new one, leaving room to align its start.
            let extends = brk == self.limit;
            let wanted = if extends {
                Some(size - (self.limit - self.next))
            } else {
                size.checked_add(ALIGNMENT)
            };
            let request = wanted
                .and_then(|w| round_up(w, pagesize))
                .ok_or(Errno(libc::ENOMEM))?;

            let start = unix::sbrk(request)?.as_ptr() as usize;
            if start != self.limit {
                // Whatever was left of the old reservation is abandoned.
                self.next = round_up(start, ALIGNMENT).ok_or(Errno(libc::ENOMEM))?;
            }
            self.limit = start + request;
            self.pages += request / pagesize;
            self.growths += 1;
        }

        let start = self.next;
        self.next += size;
        Ok(NonNull::new_unchecked(start as *mut u8))
    }
}

/// Heap-level statistics for a `RawAlloc`.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Total bytes obtained from the grower, headers included.
    pub heap_size: usize,
    /// Number of successful growth requests.
    pub growths: usize,
    /// Number of release calls that were ignored because the pointer was not
    /// a live allocation.
    pub rejected_releases: usize,
}

/// A raw allocator, capable of growing the heap, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// This is the explicit allocator context: construct one around a grower, and
/// everything it hands out stays valid until it is released or the context
/// (and its grower) is dropped. It is not thread-safe; see
/// [`GenericAllocator`](struct.GenericAllocator.html) for that.
///
/// Note: It never returns memory to the OS; that is not implemented.
pub struct RawAlloc<G> {
    pub grower: G,
    pub blocks: BlockList,
    // Start and end of everything obtained from the grower so far
    heap: Option<Range<NonNull<u8>>>,
    stats: HeapStats,
}

// The raw pointers in a RawAlloc all point into memory owned by its grower, so
// it can be sent wherever the grower can.
unsafe impl<G: Send> Send for RawAlloc<G> {}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Create a new `RawAlloc`
    pub fn new(grower: G) -> Self {
        RawAlloc {
            grower,
            blocks: BlockList::default(),
            heap: None,
            stats: HeapStats::default(),
        }
    }

    /// Get statistics on this allocator, and verify validity of the BlockList
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.stats
    }

    /// The address range from the first byte ever obtained from the grower to
    /// the end of the most recent growth, or `None` before the first
    /// allocation.
    pub fn heap_range(&self) -> Option<Range<*const u8>> {
        self.heap
            .as_ref()
            .map(|r| (r.start.as_ptr() as *const u8)..(r.end.as_ptr() as *const u8))
    }

    /// The usable size of a live allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live pointer returned by this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        Block::from_payload(ptr).size()
    }

    /// Calculate the payload size of a block that can hold `size` bytes.
    pub fn block_size(size: usize) -> Option<usize> {
        // Everything is kept in multiples of 16 bytes, so that every header
        // and every payload stays aligned.
        round_up(size, ALIGNMENT)
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// Allocate a block with room for at least `size` bytes.
    ///
    /// The smallest free block that fits is reused, split if it has room to
    /// spare for another block; if nothing fits, the heap is grown.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let needed_size = Self::block_size(size).ok_or(AllocError::OutOfMemory)?;

        if let Some(block) = self.blocks.best_fit(needed_size) {
            let ptr = unsafe { self.take_block(block, needed_size) };
            trace!("allocate({}) -> {:?} (reused)", size, ptr);
            return Ok(ptr);
        }

        let ptr = self.grow(needed_size)?;
        trace!("allocate({}) -> {:?} (grown)", size, ptr);
        Ok(ptr)
    }

    /// Allocate room for `count` elements of `size` bytes each, with every
    /// byte set to zero.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError::Overflow)?;
        let ptr = self.allocate(total)?;

        unsafe {
            let capacity = self.usable_size(ptr);
            ptr.as_ptr().write_bytes(0, capacity);
        }

        Ok(ptr)
    }

    // Hand out a block from the free list that has at least `size` bytes of
    // payload.
    unsafe fn take_block(&mut self, mut block: Block, size: usize) -> NonNull<u8> {
        if block.size() - size > HEADER_SIZE {
            let remainder = block.split(size);
            self.blocks.replace(block, remainder);
            trace!(
                "  Split {:?} to leave {} free bytes at {:?}",
                block,
                remainder.size(),
                remainder,
            );
        } else {
            // Too small to split, so the slack goes with the block
            self.blocks.remove(block);
        }

        block.set_used(true);
        block.payload()
    }

    // Append a new used block of `size` bytes to the end of the heap.
    fn grow(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = size
            .checked_add(HEADER_SIZE)
            .ok_or(AllocError::OutOfMemory)?;

        let ptr = match unsafe { self.grower.grow_heap(total) } {
            Ok(ptr) => ptr,
            Err(err) => {
                warn!("Growing the heap by {} bytes failed: {:?}", total, err);
                return Err(AllocError::OutOfMemory);
            }
        };

        let block = unsafe { Block::init(ptr, size, true) };
        let end = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(total)) };

        self.heap = Some(match self.heap.take() {
            None => ptr..end,
            Some(heap) => {
                if heap.end != ptr {
                    debug!(
                        "Heap growth at {:?} is not adjacent to the heap end {:?}",
                        ptr, heap.end,
                    );
                }
                heap.start..end
            }
        });
        self.stats.heap_size += total;
        self.stats.growths += 1;

        Ok(block.payload())
    }

    ////////////////////////////////////////////////////////////
    // Release

    // Whether a payload pointer could belong to a block in this heap.
    fn owns(&self, ptr: NonNull<u8>) -> bool {
        let heap = match self.heap {
            None => return false,
            Some(ref heap) => heap,
        };

        let addr = ptr.as_ptr() as usize;
        let start = heap.start.as_ptr() as usize;
        let end = heap.end.as_ptr() as usize;
        addr >= start + HEADER_SIZE && addr <= end && addr % ALIGNMENT == 0
    }

    /// Release (or "free") a memory block, making it available for reuse.
    ///
    /// Releasing a null pointer does nothing. The block is merged with free
    /// blocks directly before and after it.
    ///
    /// Pointers that are obviously not live allocations (outside the heap, or
    /// whose header is not marked as a used block) are logged and ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, or a pointer returned by this allocator that has not
    /// been released since. Anything else is undefined behavior; the checks
    /// above only catch the common cases.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let ptr = match NonNull::new(ptr) {
            None => return,
            Some(ptr) => ptr,
        };

        if !self.owns(ptr) {
            warn!("Ignoring release of {:?}, which is outside the heap", ptr);
            self.stats.rejected_releases += 1;
            return;
        }

        let mut block = Block::from_payload(ptr);
        if !block.is_live() || !block.is_used() {
            warn!("Ignoring release of {:?}, which is not a live allocation", ptr);
            self.stats.rejected_releases += 1;
            return;
        }

        trace!("release({:?}) of {} bytes", ptr, block.size());
        block.set_used(false);
        self.blocks.insert(block);

        // Merge with the block after, if it's free and touching
        if let Some(next) = block.next() {
            if block.relation(&next) == Relation::AdjacentBefore {
                self.blocks.remove(next);
                block.absorb(next);
                trace!("  Merged with next, now {} bytes", block.size());
            }
        }

        // Merge into the block before, if it's free and touching
        if let Some(mut prev) = block.prev() {
            if prev.relation(&block) == Relation::AdjacentBefore {
                self.blocks.remove(block);
                prev.absorb(block);
                trace!("  Merged into previous, now {} bytes", prev.size());
            }
        }
    }

    ////////////////////////////////////////////////////////////
    // Resize

    /// Resize an allocation to hold at least `new_size` bytes.
    ///
    /// - A null `ptr` allocates `new_size` bytes.
    /// - A `new_size` of 0 releases `ptr` and returns `Ok(None)`.
    /// - If the block already holds `new_size` bytes, `ptr` is returned as is.
    /// - Otherwise a new block is allocated, the old contents copied over, and
    ///   the old block released.
    ///
    /// On failure, `ptr` is left untouched and still valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, or a live pointer returned by this allocator.
    pub unsafe fn resize(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let old = match NonNull::new(ptr) {
            None => return self.allocate(new_size).map(Some),
            Some(old) => old,
        };

        if new_size == 0 {
            self.release(ptr);
            return Ok(None);
        }

        let old_size = self.usable_size(old);
        if old_size >= new_size {
            return Ok(Some(old));
        }

        let new = self.allocate(new_size)?;
        core::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
        self.release(ptr);
        trace!("resize({:?}, {}) moved to {:?}", old, new_size, new);

        Ok(Some(new))
    }

    ////////////////////////////////////////////////////////////
    // C-style interface

    /// Like `allocate`, but returns null on failure.
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        self.allocate(size).map_or(null_mut(), NonNull::as_ptr)
    }

    /// Like `zero_allocate`, but returns null on failure.
    pub fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        self.zero_allocate(count, size)
            .map_or(null_mut(), NonNull::as_ptr)
    }

    /// Like `resize`, but returns null on failure or when `size` is zero.
    ///
    /// # Safety
    ///
    /// See [`resize`](#method.resize).
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        match self.resize(ptr, size) {
            Ok(Some(new)) => new.as_ptr(),
            Ok(None) | Err(_) => null_mut(),
        }
    }

    /// The same as `release`.
    ///
    /// # Safety
    ///
    /// See [`release`](#method.release).
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        self.release(ptr)
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// The `RawAlloc` is created on first use, so a `GenericAllocator` can be
/// built in a `const` context and placed in a `static`. Every operation holds
/// the lock for its whole duration.
pub struct GenericAllocator<G> {
    raw: Once<Mutex<RawAlloc<G>>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator { raw: Once::new() }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Get a reference to the underlying RawAlloc, creating it if this is the
    /// first use.
    ///
    /// Allocation through this allocator blocks while the guard is held.
    pub fn get_raw(&self) -> MutexGuard<'_, RawAlloc<G>> {
        self.raw
            .call_once(|| Mutex::new(RawAlloc::default()))
            .lock()
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.get_raw().allocate(size)
    }

    pub fn zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.get_raw().zero_allocate(count, size)
    }

    /// # Safety
    ///
    /// See [`RawAlloc::release`](struct.RawAlloc.html#method.release).
    pub unsafe fn release(&self, ptr: *mut u8) {
        self.get_raw().release(ptr)
    }

    /// # Safety
    ///
    /// See [`RawAlloc::resize`](struct.RawAlloc.html#method.resize).
    pub unsafe fn resize(
        &self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        self.get_raw().resize(ptr, new_size)
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.get_raw().stats()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.get_raw().heap_stats()
    }
}

/// The process-wide allocator: a lazily created, spin-locked `RawAlloc`
/// growing the heap with `sbrk`.
#[cfg(unix)]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<BrkHeapGrower>,
}

#[cfg(unix)]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.alloc.heap_stats()
    }

    pub fn malloc(&self, size: usize) -> *mut u8 {
        self.alloc.get_raw().malloc(size)
    }

    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        self.alloc.get_raw().calloc(count, size)
    }

    /// C-style resize: null on failure, or when `size` is zero.
    ///
    /// This inherent method shadows `GlobalAlloc::realloc` in method-call
    /// syntax; reach the layout-taking one with
    /// `GlobalAlloc::realloc(&allocator, ptr, layout, new_size)`.
    ///
    /// # Safety
    ///
    /// See [`RawAlloc::resize`](struct.RawAlloc.html#method.resize).
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        self.alloc.get_raw().realloc(ptr, size)
    }

    /// # Safety
    ///
    /// See [`RawAlloc::release`](struct.RawAlloc.html#method.release).
    pub unsafe fn free(&self, ptr: *mut u8) {
        self.alloc.release(ptr)
    }
}

// Alignments above ALIGNMENT are not supported, and are reported as allocation
// failures.
#[cfg(unix)]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.malloc(layout.size())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.calloc(1, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        UnixAllocator::realloc(self, ptr, new_size)
    }
}

/// Size of the buffer backing a `ToyHeap`.
pub const TOY_HEAP_SIZE: usize = 64 * 1024;

/// A fixed buffer posing as a heap.
///
/// Growth hands out the buffer front to back, always contiguously, and fails
/// once `capacity` bytes have been handed out.
#[repr(C, align(16))]
pub struct ToyHeap {
    // First, so that it starts on the struct's alignment
    pub heap: [u8; TOY_HEAP_SIZE],
    pub capacity: usize,
    pub size: usize,
    pub growths: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap::with_capacity(TOY_HEAP_SIZE)
    }
}

impl ToyHeap {
    /// A toy heap that refuses to grow past `capacity` bytes (at most
    /// `TOY_HEAP_SIZE`).
    pub fn with_capacity(capacity: usize) -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            capacity: capacity.min(TOY_HEAP_SIZE),
            size: 0,
            growths: 0,
        }
    }
}

#[derive(Debug)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

unsafe impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        let available = self.capacity - self.size;
        if size > available {
            return Err(ToyHeapOverflowError {
                requested: size,
                available,
            });
        }

        let ptr = self.heap.as_mut_ptr().add(self.size);
        self.size += size;
        self.growths += 1;
        Ok(NonNull::new_unchecked(ptr))
    }
}

/// Walks every block of a contiguous heap, in address order.
pub struct HeapBlocks<'heap> {
    next: *const u8,
    end: *const u8,
    _heap: PhantomData<&'heap ()>,
}

impl<'heap> Iterator for HeapBlocks<'heap> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.next >= self.end {
            return None;
        }

        let block = unsafe { Block::from_header(NonNull::new_unchecked(self.next as *mut u8)) };
        self.next = block.as_range().end;
        Some(block)
    }
}

/// Problems found by walking the whole heap.
#[derive(Default, Debug)]
pub struct HeapValidity {
    /// Number of blocks walked.
    pub blocks: usize,
    /// Number of free blocks walked.
    pub free_blocks: usize,
    /// Number of pairs of neighbouring blocks that are both free.
    pub adjacent_free: usize,
    /// Number of headers that were not written by the allocator.
    pub dead_headers: usize,
    /// Difference between the free blocks walked and the free list length.
    pub unlisted_free: usize,
    /// Whether the last block ended somewhere other than the heap end.
    pub overrun: bool,
}

impl HeapValidity {
    pub fn is_valid(&self) -> bool {
        self.adjacent_free == 0 && self.dead_headers == 0 && self.unlisted_free == 0 && !self.overrun
    }
}

// A ToyHeap always grows contiguously, so its heap can be walked block by
// block.
impl RawAlloc<ToyHeap> {
    /// Iterate over every block in the heap, used and free.
    pub fn heap_blocks(&self) -> HeapBlocks<'_> {
        let (next, end) = match self.heap_range() {
            None => (core::ptr::null(), core::ptr::null()),
            Some(range) => (range.start, range.end),
        };

        HeapBlocks {
            next,
            end,
            _heap: PhantomData,
        }
    }

    /// Walk the heap and check it against the free list.
    pub fn check_heap(&self) -> HeapValidity {
        let mut validity = HeapValidity::default();
        let mut previous_free = false;
        let mut last_end = self.heap_range().map(|r| r.start);

        for block in self.heap_blocks() {
            validity.blocks += 1;
            if !block.is_live() {
                validity.dead_headers += 1;
                // Sizes can't be trusted past this point
                break;
            }

            let free = !block.is_used();
            if free {
                validity.free_blocks += 1;
                if previous_free {
                    validity.adjacent_free += 1;
                }
            }
            previous_free = free;
            last_end = Some(block.as_range().end);
        }

        let listed = self.blocks.len();
        validity.unlisted_free = if listed > validity.free_blocks {
            listed - validity.free_blocks
        } else {
            validity.free_blocks - listed
        };
        validity.overrun = last_end != self.heap_range().map(|r| r.end);

        validity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn assert_valid(allocator: &RawAlloc<ToyHeap>) {
        let (validity, _stats) = allocator.stats();
        assert!(validity.is_valid(), "{:?}: {}", validity, allocator.blocks);
        let heap_validity = allocator.check_heap();
        assert!(heap_validity.is_valid(), "{:?}", heap_validity);
    }

    fn free_sizes(allocator: &RawAlloc<ToyHeap>) -> Vec<usize> {
        allocator.blocks.iter().map(|b| b.size()).collect()
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 16), Some(0));
        assert_eq!(round_up(1, 16), Some(16));
        assert_eq!(round_up(16, 16), Some(16));
        assert_eq!(round_up(17, 16), Some(32));
        assert_eq!(round_up(usize::MAX, 16), None);
    }

    #[test]
    fn test_first_allocation_is_single_growth() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        assert!(allocator.heap_range().is_none());

        let ptr = allocator.allocate(48).unwrap();
        let heap = allocator.heap_range().unwrap();

        assert_eq!(heap.start, allocator.grower.heap.as_ptr());
        assert_eq!(ptr.as_ptr() as *const u8, unsafe { heap.start.add(HEADER_SIZE) });
        assert_eq!(allocator.grower.growths, 1);
        assert_eq!(allocator.grower.size, HEADER_SIZE + 48);
        assert_eq!(allocator.heap_stats().heap_size, HEADER_SIZE + 48);
        assert!(allocator.blocks.is_empty());
        assert_valid(&allocator);
    }

    #[test]
    fn test_allocations_are_aligned_and_adjacent() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        let sizes = [1usize, 16, 33, 0, 100];
        let pointers: Vec<NonNull<u8>> = sizes
            .iter()
            .map(|&s| allocator.allocate(s).unwrap())
            .collect();

        for (&size, window) in sizes.iter().zip(pointers.windows(2)) {
            let block_size = RawAlloc::<ToyHeap>::block_size(size).unwrap();
            let expected = unsafe { window[0].as_ptr().add(block_size + HEADER_SIZE) };
            assert_eq!(window[1].as_ptr(), expected);
        }
        for (&size, &ptr) in sizes.iter().zip(&pointers) {
            assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
            assert!(unsafe { allocator.usable_size(ptr) } >= size);
        }
        assert_valid(&allocator);
    }

    #[test]
    fn test_write_and_read_back() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let a = allocator.allocate(40).unwrap();
        let b = allocator.allocate(40).unwrap();

        unsafe {
            for i in 0..40 {
                a.as_ptr().add(i).write(i as u8);
                b.as_ptr().add(i).write(0xFF - i as u8);
            }
            for i in 0..40 {
                assert_eq!(a.as_ptr().add(i).read(), i as u8);
                assert_eq!(b.as_ptr().add(i).read(), 0xFF - i as u8);
            }
        }
        assert_valid(&allocator);
    }

    #[test]
    fn test_release_null_is_noop() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        unsafe { allocator.release(null_mut()) };
        assert!(allocator.heap_range().is_none());

        let _a = allocator.allocate(16).unwrap();
        unsafe { allocator.release(null_mut()) };
        assert!(allocator.blocks.is_empty());
        assert_eq!(allocator.heap_stats().rejected_releases, 0);
        assert_valid(&allocator);
    }

    #[test]
    fn test_reuse_before_growth() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let a = allocator.allocate(16).unwrap();
        unsafe { allocator.release(a.as_ptr()) };
        assert_eq!(free_sizes(&allocator), [16]);

        let b = allocator.allocate(16).unwrap();
        assert_eq!(a, b);
        assert_eq!(allocator.grower.growths, 1);
        assert!(allocator.blocks.is_empty());
        assert_valid(&allocator);
    }

    #[test]
    fn test_coalescing_is_order_independent() {
        for &order in &[[1usize, 0], [0, 1]] {
            let mut allocator = RawAlloc::new(ToyHeap::default());
            let blocks = [
                allocator.allocate(64).unwrap(),
                allocator.allocate(64).unwrap(),
                allocator.allocate(64).unwrap(),
            ];

            for &i in &order {
                unsafe { allocator.release(blocks[i].as_ptr()) };
                assert_valid(&allocator);
            }
            assert_eq!(free_sizes(&allocator), [64 + HEADER_SIZE + 64]);

            let growths = allocator.grower.growths;
            let merged = allocator.allocate(64 + HEADER_SIZE + 64).unwrap();
            assert_eq!(merged, blocks[0]);
            assert_eq!(allocator.grower.growths, growths);
            assert!(allocator.blocks.is_empty());
            assert_valid(&allocator);
        }
    }

    #[test]
    fn test_coalescing_both_sides() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let blocks: Vec<NonNull<u8>> = (0..5).map(|_| allocator.allocate(32).unwrap()).collect();

        unsafe {
            allocator.release(blocks[1].as_ptr());
            allocator.release(blocks[3].as_ptr());
            assert_eq!(free_sizes(&allocator), [32, 32]);

            // Bridges the two free neighbours into one block
            allocator.release(blocks[2].as_ptr());
        }
        assert_eq!(free_sizes(&allocator), [3 * 32 + 2 * HEADER_SIZE]);
        assert_eq!(allocator.blocks.first().unwrap().payload(), blocks[1]);
        assert_valid(&allocator);
    }

    #[test]
    fn test_best_fit_selection() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let mut pointers = Vec::new();
        for &size in &[64usize, 128, 256] {
            pointers.push(allocator.allocate(size).unwrap());
            // A used separator keeps the free blocks from merging
            allocator.allocate(16).unwrap();
        }
        for &p in &pointers {
            unsafe { allocator.release(p.as_ptr()) };
        }
        assert_eq!(free_sizes(&allocator), [64, 128, 256]);

        let p = allocator.allocate(100).unwrap();
        assert_eq!(p, pointers[1]);
        // 128 - 112 is too little to split off another block
        assert_eq!(unsafe { allocator.usable_size(p) }, 128);
        assert_eq!(free_sizes(&allocator), [64, 256]);
        assert_eq!(allocator.blocks.first().unwrap().payload(), pointers[0]);
        assert_eq!(allocator.blocks.last().unwrap().payload(), pointers[2]);
        assert_valid(&allocator);
    }

    #[test]
    fn test_best_fit_ties_go_to_lowest_address() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let mut pointers = Vec::new();
        for _ in 0..3 {
            pointers.push(allocator.allocate(96).unwrap());
            allocator.allocate(16).unwrap();
        }
        unsafe {
            allocator.release(pointers[2].as_ptr());
            allocator.release(pointers[0].as_ptr());
            allocator.release(pointers[1].as_ptr());
        }

        assert_eq!(allocator.allocate(80).unwrap(), pointers[0]);
        assert_eq!(allocator.allocate(80).unwrap(), pointers[1]);
        assert_eq!(allocator.allocate(80).unwrap(), pointers[2]);
        assert_valid(&allocator);
    }

    #[test]
    fn test_splitting_leaves_remainder() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let big = allocator.allocate(1008).unwrap();
        unsafe { allocator.release(big.as_ptr()) };

        let small = allocator.allocate(10).unwrap();
        assert_eq!(small, big);
        assert_eq!(unsafe { allocator.usable_size(small) }, 16);
        assert_eq!(free_sizes(&allocator), [1008 - 16 - HEADER_SIZE]);

        let remainder = allocator.blocks.first().unwrap();
        assert_eq!(remainder.payload().as_ptr(), unsafe {
            small.as_ptr().add(16 + HEADER_SIZE)
        });
        assert_eq!(allocator.grower.growths, 1);
        assert_valid(&allocator);
    }

    #[test]
    fn test_split_remainder_takes_list_position() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let a = allocator.allocate(32).unwrap();
        allocator.allocate(16).unwrap();
        let b = allocator.allocate(512).unwrap();
        allocator.allocate(16).unwrap();
        let c = allocator.allocate(32).unwrap();
        allocator.allocate(16).unwrap();

        unsafe {
            allocator.release(a.as_ptr());
            allocator.release(b.as_ptr());
            allocator.release(c.as_ptr());
        }

        let p = allocator.allocate(64).unwrap();
        assert_eq!(p, b);
        assert_eq!(free_sizes(&allocator), [32, 512 - 64 - HEADER_SIZE, 32]);
        assert_valid(&allocator);
    }

    #[test]
    fn test_exact_slack_is_not_split() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let a = allocator.allocate(64 + HEADER_SIZE).unwrap();
        unsafe { allocator.release(a.as_ptr()) };

        // The leftover would be a header with no payload, so the whole block
        // is handed out.
        let b = allocator.allocate(64).unwrap();
        assert_eq!(a, b);
        assert_eq!(unsafe { allocator.usable_size(b) }, 64 + HEADER_SIZE);
        assert!(allocator.blocks.is_empty());
        assert_valid(&allocator);
    }

    #[test]
    fn test_zero_size_allocation() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let a = allocator.allocate(0).unwrap();
        let b = allocator.allocate(0).unwrap();
        assert_ne!(a, b);
        assert_eq!(unsafe { allocator.usable_size(a) }, 0);

        unsafe {
            allocator.release(a.as_ptr());
            allocator.release(b.as_ptr());
        }
        assert_eq!(free_sizes(&allocator), [HEADER_SIZE]);
        assert_valid(&allocator);
    }

    #[test]
    fn test_zero_allocate() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        // Dirty some memory, then free it so calloc gets it back.
        let dirty = allocator.allocate(256).unwrap();
        unsafe {
            dirty.as_ptr().write_bytes(0xAB, 256);
            allocator.release(dirty.as_ptr());
        }

        let zeroed = allocator.zero_allocate(12, 20).unwrap();
        assert_eq!(zeroed, dirty);
        let capacity = unsafe { allocator.usable_size(zeroed) };
        assert!(capacity >= 240);
        let bytes = unsafe { core::slice::from_raw_parts(zeroed.as_ptr(), capacity) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_valid(&allocator);
    }

    #[test]
    fn test_zero_allocate_overflow() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        assert_eq!(
            allocator.zero_allocate(usize::MAX, 2),
            Err(AllocError::Overflow)
        );
        assert_eq!(allocator.calloc(usize::MAX / 2, 3), null_mut());
        assert!(allocator.heap_range().is_none());
        assert_eq!(allocator.grower.growths, 0);
    }

    #[test]
    fn test_out_of_memory_leaves_state_untouched() {
        let mut allocator = RawAlloc::new(ToyHeap::with_capacity(1024));
        let a = allocator.allocate(256).unwrap();
        let b = allocator.allocate(256).unwrap();
        unsafe { allocator.release(a.as_ptr()) };

        let before = free_sizes(&allocator);
        let heap_before = allocator.heap_range();
        let stats_before = allocator.heap_stats();

        assert_eq!(allocator.allocate(1024), Err(AllocError::OutOfMemory));
        assert_eq!(allocator.malloc(1024), null_mut());
        assert_eq!(allocator.allocate(usize::MAX), Err(AllocError::OutOfMemory));

        assert_eq!(free_sizes(&allocator), before);
        assert_eq!(allocator.heap_range(), heap_before);
        assert_eq!(allocator.heap_stats(), stats_before);

        // Still usable afterwards
        let c = allocator.allocate(256).unwrap();
        assert_eq!(c, a);
        unsafe { allocator.release(b.as_ptr()) };
        assert_valid(&allocator);
    }

    #[test]
    fn test_resize_null_allocates() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let p = unsafe { allocator.resize(null_mut(), 24) }.unwrap().unwrap();
        assert!(unsafe { allocator.usable_size(p) } >= 24);
        assert_valid(&allocator);
    }

    #[test]
    fn test_resize_to_zero_releases() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let p = allocator.allocate(64).unwrap();
        allocator.allocate(16).unwrap();

        assert_eq!(unsafe { allocator.resize(p.as_ptr(), 0) }, Ok(None));
        assert_eq!(free_sizes(&allocator), [64]);
        assert_eq!(allocator.allocate(64).unwrap(), p);
        assert_valid(&allocator);
    }

    #[test]
    fn test_resize_in_place() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let p = allocator.allocate(64).unwrap();
        unsafe { p.as_ptr().write_bytes(7, 64) };

        for &size in &[64usize, 63, 1] {
            let q = unsafe { allocator.resize(p.as_ptr(), size) }.unwrap().unwrap();
            assert_eq!(q, p);
            assert_eq!(unsafe { allocator.usable_size(q) }, 64);
        }
        assert!(allocator.blocks.is_empty());
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 7));
        assert_valid(&allocator);
    }

    #[test]
    fn test_resize_grows_by_moving() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let p = allocator.allocate(8).unwrap();
        let pattern = [1u8, 2, 3, 4, 5, 6, 7, 8];
        unsafe { core::ptr::copy_nonoverlapping(pattern.as_ptr(), p.as_ptr(), 8) };

        let q = unsafe { allocator.resize(p.as_ptr(), 64) }.unwrap().unwrap();
        assert_ne!(q, p);
        assert!(unsafe { allocator.usable_size(q) } >= 64);
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 8) };
        assert_eq!(bytes, pattern);

        // The old block went back on the free list
        assert_eq!(free_sizes(&allocator), [16]);
        assert_valid(&allocator);
    }

    #[test]
    fn test_resize_failure_keeps_original() {
        let mut allocator = RawAlloc::new(ToyHeap::with_capacity(256));
        let p = allocator.allocate(64).unwrap();
        unsafe { p.as_ptr().write_bytes(9, 64) };

        assert_eq!(
            unsafe { allocator.resize(p.as_ptr(), 512) },
            Err(AllocError::OutOfMemory)
        );
        assert_eq!(unsafe { allocator.realloc(p.as_ptr(), 512) }, null_mut());

        let block = unsafe { Block::from_payload(p) };
        assert!(block.is_used());
        assert_eq!(block.size(), 64);
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 9));
        assert_valid(&allocator);
    }

    #[test]
    fn test_double_release_is_rejected() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let a = allocator.allocate(32).unwrap();
        let b = allocator.allocate(32).unwrap();
        allocator.allocate(32).unwrap();

        unsafe {
            allocator.release(b.as_ptr());
            allocator.release(b.as_ptr());
        }
        assert_eq!(allocator.heap_stats().rejected_releases, 1);
        assert_eq!(free_sizes(&allocator), [32]);

        // b's header is swallowed when a merges with it; releasing b again
        // must still be caught.
        unsafe {
            allocator.release(a.as_ptr());
            allocator.release(b.as_ptr());
        }
        assert_eq!(allocator.heap_stats().rejected_releases, 2);
        assert_eq!(free_sizes(&allocator), [32 + HEADER_SIZE + 32]);
        assert_valid(&allocator);
    }

    #[test]
    fn test_foreign_release_is_rejected() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        allocator.allocate(32).unwrap();

        let mut local = [0u8; 64];
        unsafe { allocator.release(local.as_mut_ptr().add(HEADER_SIZE)) };
        assert_eq!(allocator.heap_stats().rejected_releases, 1);
        assert!(allocator.blocks.is_empty());
        assert_valid(&allocator);
    }

    #[test]
    fn test_c_style_interface() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let p = allocator.malloc(10);
        assert!(!p.is_null());

        let q = allocator.calloc(4, 4);
        let bytes = unsafe { core::slice::from_raw_parts(q, 16) };
        assert!(bytes.iter().all(|&b| b == 0));

        let r = unsafe { allocator.realloc(p, 100) };
        assert!(!r.is_null());
        assert_eq!(unsafe { allocator.realloc(r, 0) }, null_mut());

        unsafe {
            allocator.free(q);
            allocator.free(null_mut());
        }
        assert_eq!(allocator.heap_stats().rejected_releases, 0);
        assert_valid(&allocator);
    }

    #[test]
    fn test_generic_allocator_initializes_lazily() {
        let allocator: GenericAllocator<ToyHeap> = GenericAllocator::new();
        let p = allocator.allocate(32).unwrap();
        let z = allocator.zero_allocate(2, 8).unwrap();
        unsafe {
            allocator.release(p.as_ptr());
            let q = allocator.resize(z.as_ptr(), 0).unwrap();
            assert!(q.is_none());
        }

        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.length, 1);
        assert_eq!(allocator.heap_stats().growths, 2);
        assert!(allocator.get_raw().check_heap().is_valid());
    }
}
