//! Shared test utilities.
//!
//! `init_tracing` installs a subscriber honoring `RUST_LOG`; combined
//! with `--features tracing` it surfaces the crate's structural events
//! (splits, promotions, layer creation) while a test runs.

#![allow(dead_code)]

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a global tracing subscriber once per test binary.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
