// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `#[test]` replacement that routes `tracing` output of the code under test
//! to the libtest capture buffer.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Filter used when `RUST_LOG` is unset or cannot be parsed.
///
/// The execution core logs every exit at trace level, which drowns the
/// interesting events in long scripted runs, so the default stops at debug.
fn default_targets() -> Targets {
    Targets::new().with_default(LevelFilter::DEBUG)
}

#[doc(hidden)]
/// Installs the global test subscriber. Called by every generated test; only
/// the first call has an effect.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = match std::env::var("RUST_LOG") {
            Ok(var) => var.parse().unwrap_or_else(|err| {
                eprintln!("ignoring invalid RUST_LOG {var:?}: {err}");
                default_targets()
            }),
            Err(_) => default_targets(),
        };
        // Interrupt tests kick the executing thread from a helper thread, so
        // thread names are needed to make sense of interleaved output.
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_thread_names(true)
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}
