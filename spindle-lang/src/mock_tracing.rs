//! No-op stand-ins for the `tracing` macros used when the `tracing` feature is
//! disabled.
//!
//! The arguments are never evaluated, matching what `tracing` does when an
//! event is filtered out.

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {};
}

#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}

#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {};
}

#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => {};
}
