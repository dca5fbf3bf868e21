//! Thin wrappers around the libc calls used to grow the heap.

use core::convert::TryInto;
use core::ptr::NonNull;

use errno::Errno;

/// Move the program break up by `increment` bytes, returning the old break,
/// which is the start of the newly available memory.
///
/// `sbrk(0)` returns the current break without moving it.
///
/// # Safety
///
/// Anything else in the process that manages the break (such as libc's own
/// malloc) may hand out the same memory if the break is later moved back; this
/// crate never moves it back.
pub unsafe fn sbrk(increment: usize) -> Result<NonNull<u8>, Errno> {
    // sbrk takes a signed increment, of a width that varies by platform
    let increment = match increment.try_into() {
        Ok(increment) => increment,
        Err(_) => return Err(Errno(libc::ENOMEM)),
    };
    let ptr = libc::sbrk(increment);

    if ptr as isize == -1 {
        return Err(errno::errno());
    }

    NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))
}

/// The size of a virtual memory page.
pub fn page_size() -> usize {
    sysconf::page::pagesize()
}
