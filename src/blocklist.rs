use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

use static_assertions::const_assert_eq;

/// Every header and payload starts on a multiple of this many bytes, and every
/// payload size is rounded up to a multiple of it.
pub const ALIGNMENT: usize = 16;

/// Bytes taken by a [`BlockHeader`](struct.BlockHeader.html) in front of every
/// payload.
pub const HEADER_SIZE: usize = 32;

// Written into every header this allocator creates, and cleared when a header
// is swallowed by a merge. A release of anything without it is rejected.
const LIVE_TAG: u32 = 0xB10C_4EAD;

/// The header in front of every block, free or used.
///
/// `size` is the payload size only; it never includes the header itself.
/// `next` and `prev` link free blocks together and are cleared while the
/// block is in use.
///
/// We use C representation and align to 16 bytes, so that a payload directly
/// after a header is aligned as strongly as the header is.
#[repr(C, align(16))]
pub struct BlockHeader {
    size: usize,
    next: Option<Block>,
    prev: Option<Block>,
    tag: u32,
    used: bool,
}

const_assert_eq!(HEADER_SIZE, core::mem::size_of::<BlockHeader>());
const_assert_eq!(ALIGNMENT, core::mem::align_of::<BlockHeader>());
const_assert_eq!(HEADER_SIZE % ALIGNMENT, 0);

/// An enum for easy comparison of blocks and their order
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A `Block` is a wrapper around a pointer to a block header somewhere in the
/// heap.
///
/// It is `Copy`: it does not own the memory it points to, the heap does. Two
/// `Block`s are equal when they point at the same header, and order by
/// address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// Blocks are only ever touched while the allocator that owns them is borrowed
// mutably, so they can move between threads along with it.
unsafe impl Send for Block {}

impl Block {
    /// Write a fresh, unlinked header at `ptr` for a payload of `size` bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to `ALIGNMENT` and point to at least
    /// `HEADER_SIZE + size` bytes owned by the allocator and not reachable by
    /// any other program logic.
    #[must_use]
    pub unsafe fn init(ptr: NonNull<u8>, size: usize, used: bool) -> Block {
        let header = BlockHeader {
            size,
            next: None,
            prev: None,
            tag: LIVE_TAG,
            used,
        };
        let raw_ptr: NonNull<BlockHeader> = ptr.cast();
        core::ptr::write(raw_ptr.as_ptr(), header);
        Block { header: raw_ptr }
    }

    /// Recover the block from a header address.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a header previously written by `Block::init`.
    pub unsafe fn from_header(ptr: NonNull<u8>) -> Block {
        Block { header: ptr.cast() }
    }

    /// Recover the block from the payload pointer handed out to a caller.
    ///
    /// # Safety
    ///
    /// `ptr` must be exactly `HEADER_SIZE` bytes past a header previously
    /// written by `Block::init`.
    pub unsafe fn from_payload(ptr: NonNull<u8>) -> Block {
        let header = ptr.as_ptr().sub(HEADER_SIZE);
        Block {
            header: NonNull::new_unchecked(header).cast(),
        }
    }

    /// The pointer handed to callers: the first byte after the header.
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// Get the pointer range covered by this block, header included.
    pub fn as_range(&self) -> Range<*const u8> {
        let start = self.header.as_ptr() as *const u8;
        unsafe { start..start.add(HEADER_SIZE + self.size()) }
    }

    /// Compare two blocks to see how they are ordered.
    pub fn relation(&self, other: &Self) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    /// The payload size of the block, in bytes.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    pub fn is_used(&self) -> bool {
        self.header_view().used
    }

    /// Whether this header was written by the allocator and has not since been
    /// merged away.
    pub fn is_live(&self) -> bool {
        self.header_view().tag == LIVE_TAG
    }

    /// The next free block in the list, if this block is free.
    pub fn next(&self) -> Option<Block> {
        self.header_view().next
    }

    /// The previous free block in the list, if this block is free.
    pub fn prev(&self) -> Option<Block> {
        self.header_view().prev
    }

    /// An immutable view of the header
    pub fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    /// Get a mutable view of the header.
    ///
    /// # Safety
    ///
    /// This method is unsafe because it allows modifying the size or links of
    /// a block in safe code, which could lead to corruption.
    pub unsafe fn header_mut(&mut self) -> &mut BlockHeader {
        self.header.as_mut()
    }

    /// Mark the block used or free.
    ///
    /// # Safety
    ///
    /// The caller keeps the free list consistent with the flag.
    pub unsafe fn set_used(&mut self, used: bool) {
        self.header_mut().used = used;
    }

    /// Split this block in two, keeping the first `size` bytes of payload and
    /// writing a new free header directly after them for the rest.
    ///
    /// The remainder is returned unlinked; this block keeps its links, so the
    /// caller can put the remainder in its place with
    /// [`BlockList::replace`](struct.BlockList.html#method.replace).
    ///
    /// # Safety
    ///
    /// `size` must be a multiple of `ALIGNMENT`, and the block must be larger
    /// than `size + HEADER_SIZE`.
    #[must_use]
    pub unsafe fn split(&mut self, size: usize) -> Block {
        let self_size = self.size();
        debug_assert!(
            self_size > size + HEADER_SIZE,
            "Can't split a block of size {} off of a block of size {} - need {} for header",
            size,
            self_size,
            HEADER_SIZE,
        );

        let remainder_ptr = NonNull::new_unchecked(self.payload().as_ptr().add(size));
        let remainder = Block::init(remainder_ptr, self_size - size - HEADER_SIZE, false);
        self.header_mut().size = size;
        remainder
    }

    /// Grow this block to cover `other`, which must start right where this one
    /// ends. The header of `other` is scrubbed so a stale pointer to it can be
    /// recognized.
    ///
    /// # Safety
    ///
    /// `other` must be directly adjacent after this block and already unlinked
    /// from the free list.
    pub unsafe fn absorb(&mut self, mut other: Block) {
        debug_assert_eq!(self.relation(&other), Relation::AdjacentBefore);
        let other_size = other.size();
        {
            let header = other.header_mut();
            header.tag = 0;
            header.used = false;
            header.next = None;
            header.prev = None;
        }
        self.header_mut().size += HEADER_SIZE + other_size;
    }
}

/// A `BlockList` is a doubly linked list of free blocks, kept in strictly
/// increasing address order.
///
/// The blocks are not owned by the list; they live in the heap, and the list
/// threads through their headers. A block is on the list exactly when its
/// `used` flag is clear.
///
/// It maintains a few internal invariants:
///
/// - Each block's `next` is the following block in the list, and that block's
///   `prev` points back; `first` has no `prev` and `last` has no `next`.
/// - Each block has an address < its next.
///
/// Merging adjacent blocks is the allocator's job, not the list's.
#[derive(Default)]
pub struct BlockList {
    first: Option<Block>,
    last: Option<Block>,
}

pub struct BlockIter {
    next: Option<Block>,
}

impl Iterator for BlockIter {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = block.next();
        Some(block)
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "Block({:?}, {})", block.header, block.size())?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of blocks overlapping other blocks.
    ///
    /// This likely indicates corruption.
    ///
    /// If there are also out of order blocks, this might undercount.
    pub overlaps: usize,

    /// Number of blocks that are directly adjacent to each other, and not
    /// merged. This shouldn't happen, but isn't totally corrupt.
    pub adjacents: usize,
    /// Number of blocks that do not have an address less than their next.
    ///
    /// This shouldn't occur.
    pub out_of_orders: usize,
    /// Number of `prev` links (including the list's own `last`) that do not
    /// point back at the block before.
    pub broken_links: usize,
    /// Number of blocks on the list that are marked used, or whose header was
    /// never written by the allocator.
    pub used_in_list: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.adjacents == 0
            && self.out_of_orders == 0
            && self.broken_links == 0
            && self.used_in_list == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct Stats {
    /// Number of free blocks.
    pub length: usize,
    /// Total free payload bytes, headers excluded.
    pub size: usize,
}

impl BlockList {
    pub fn iter(&self) -> BlockIter {
        BlockIter { next: self.first }
    }

    pub fn first(&self) -> Option<Block> {
        self.first
    }

    pub fn last(&self) -> Option<Block> {
        self.last
    }

    /// Check current size of the list, and whether its valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<Block> = None;
        for next in self.iter() {
            match previous.map(|p| p.relation(&next)) {
                Some(Relation::Before) => {
                    // This is valid, do nothing.
                }
                Some(Relation::AdjacentBefore) => {
                    // Right order, but these should be merged.
                    validity.adjacents += 1;
                }
                Some(Relation::Overlapping) => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) => {
                    // Wrong order, and these should be merged.
                    validity.out_of_orders += 1;
                    validity.adjacents += 1;
                }
                Some(Relation::After) => {
                    // Wrong order.
                    validity.out_of_orders += 1;
                }
                None => {
                    // This is the first in the list. Valid, do nothing.
                }
            }

            if next.prev() != previous {
                validity.broken_links += 1;
            }
            if next.is_used() || !next.is_live() {
                validity.used_in_list += 1;
            }

            stats.length += 1;
            stats.size += next.size();
            previous = Some(next);
        }

        if self.last != previous {
            validity.broken_links += 1;
        }

        (validity, stats)
    }

    /// Find the smallest block with at least `size` bytes of payload.
    ///
    /// Among blocks of the same size, the one with the lowest address wins.
    /// The block is left on the list.
    pub fn best_fit(&self, size: usize) -> Option<Block> {
        let mut best: Option<Block> = None;
        for block in self.iter() {
            let block_size = block.size();
            if block_size < size {
                continue;
            }

            match best {
                Some(b) if b.size() <= block_size => {}
                _ => best = Some(block),
            }

            if block_size == size {
                // Nothing later can beat an exact fit at a lower address
                break;
            }
        }

        best
    }

    /// Add a free block to the list, keeping address order.
    ///
    /// # Safety
    ///
    /// `block` must be a live, free block that is not already on the list.
    pub unsafe fn insert(&mut self, mut block: Block) {
        let (first, last) = match (self.first, self.last) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                // There are no blocks in this list, so this one becomes the
                // whole list
                block.header_mut().next = None;
                block.header_mut().prev = None;
                self.first = Some(block);
                self.last = Some(block);
                return;
            }
        };

        if block < first {
            self.link_between(None, block, Some(first));
        } else if block > last {
            self.link_between(Some(last), block, None);
        } else {
            // first < block < last, so there is always a later block to find,
            // and it always has a previous block.
            let after = self.iter().find(|b| *b > block);
            debug_assert!(after.is_some(), "Block {:?} is already listed", block);
            if let Some(after) = after {
                self.link_between(after.prev(), block, Some(after));
            }
        }
    }

    /// Remove a block from the list, clearing its links.
    ///
    /// # Safety
    ///
    /// `block` must currently be on this list.
    pub unsafe fn remove(&mut self, mut block: Block) {
        let prev = block.prev();
        let next = block.next();

        match prev {
            Some(mut p) => p.header_mut().next = next,
            None => self.first = next,
        }
        match next {
            Some(mut n) => n.header_mut().prev = prev,
            None => self.last = prev,
        }

        let header = block.header_mut();
        header.next = None;
        header.prev = None;
    }

    /// Put `new` in the list position held by `old`, which is unlinked.
    ///
    /// # Safety
    ///
    /// `old` must be on the list, `new` must not be, and `new` must fall
    /// between `old`'s neighbours in address order.
    pub unsafe fn replace(&mut self, mut old: Block, new: Block) {
        let prev = old.prev();
        let next = old.next();

        let header = old.header_mut();
        header.next = None;
        header.prev = None;

        self.link_between(prev, new, next);
    }

    // Splice `block` in between two neighbours, either of which may be the end
    // of the list.
    unsafe fn link_between(&mut self, prev: Option<Block>, mut block: Block, next: Option<Block>) {
        {
            let header = block.header_mut();
            header.prev = prev;
            header.next = next;
        }

        match prev {
            Some(mut p) => p.header_mut().next = Some(block),
            None => self.first = Some(block),
        }
        match next {
            Some(mut n) => n.header_mut().prev = Some(block),
            None => self.last = Some(block),
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}
