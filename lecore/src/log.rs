//! Logging shim.
//!
//! With the `log` feature enabled, these macros forward to the `log` facade. Without it, the
//! arguments are still type-checked through `format_args!`, but nothing is emitted and no code is
//! generated.

#[cfg(feature = "log")]
macro_rules! __ll_log {
    ($level:ident, $($t:tt)*) => {{ log::$level!($($t)*); }};
}

#[cfg(not(feature = "log"))]
macro_rules! __ll_log {
    ($level:ident, $($t:tt)*) => {{ format_args!($($t)*); }};
}

macro_rules! error {
    ($($t:tt)*) => { __ll_log!(error, $($t)*) };
}

macro_rules! warn {
    ($($t:tt)*) => { __ll_log!(warn, $($t)*) };
}

macro_rules! info {
    ($($t:tt)*) => { __ll_log!(info, $($t)*) };
}

macro_rules! debug {
    ($($t:tt)*) => { __ll_log!(debug, $($t)*) };
}

macro_rules! trace {
    ($($t:tt)*) => { __ll_log!(trace, $($t)*) };
}
