// Logging from inside an allocator is only safe when the logger itself never
// allocates, so these forward to `log` only with the `logging` feature (or
// under test, where the allocator is never the global one).

#[cfg(any(test, feature = "logging"))]
macro_rules! trace {
    ($($arg:tt)+) => {
        log::trace!($($arg)+)
    };
}

#[cfg(not(any(test, feature = "logging")))]
macro_rules! trace {
    ($($arg:tt)+) => {
        if false {
            let _ = core::format_args!($($arg)+);
        }
    };
}

#[cfg(any(test, feature = "logging"))]
macro_rules! debug {
    ($($arg:tt)+) => {
        log::debug!($($arg)+)
    };
}

#[cfg(not(any(test, feature = "logging")))]
macro_rules! debug {
    ($($arg:tt)+) => {
        if false {
            let _ = core::format_args!($($arg)+);
        }
    };
}

#[cfg(any(test, feature = "logging"))]
macro_rules! warn {
    ($($arg:tt)+) => {
        log::warn!($($arg)+)
    };
}

#[cfg(not(any(test, feature = "logging")))]
macro_rules! warn {
    ($($arg:tt)+) => {
        if false {
            let _ = core::format_args!($($arg)+);
        }
    };
}
