// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[cfg(not(loom))]
use tracing_subscriber::EnvFilter;
#[cfg(not(loom))]
use tracing_subscriber::util::SubscriberInitExt;

/// Install a per-test subscriber honoring `RUST_LOG`; hold the returned
/// guard for the duration of the test.
#[cfg(not(loom))]
pub(crate) fn trace_init() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_thread_names(true)
        .set_default()
}
