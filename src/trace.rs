//! Filepath: src/trace.rs
//!
//! Zero-cost tracing shims.
//!
//! With the `tracing` feature enabled these forward to the `tracing`
//! crate; without it they expand to nothing, so hot paths carry no
//! logging overhead in default builds.
//!
//! ```bash
//! cargo test --features tracing
//! RUST_LOG=massmap=trace cargo test --features tracing split
//! ```

#![allow(unused_macros, unused_imports)]

/// Trace-level logging for per-operation events (descent retries,
/// sibling walks). No-op without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

/// Debug-level logging for structural events (splits, promotions, root
/// growth, layer creation). No-op without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use trace_log;
