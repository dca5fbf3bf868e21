use core::fmt;

/// The ways an allocation request can fail.
///
/// Release never fails: releasing a null pointer does nothing, and releasing
/// anything that is not a live allocation is undefined behavior.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The heap could not be grown far enough to satisfy the request, or the
    /// request was too large to describe at all.
    OutOfMemory,
    /// `count * size` does not fit in a `usize`.
    Overflow,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of memory"),
            AllocError::Overflow => write!(f, "allocation size overflows usize"),
        }
    }
}
