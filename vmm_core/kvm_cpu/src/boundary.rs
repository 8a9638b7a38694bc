// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-thread call boundary around host-reachable entry points.
//!
//! Each entry point pushes a frame, runs, and pops it. A host abort travels
//! back as an `Err` through `?`; a panic inside a host callback is caught at
//! the innermost frame and turned into [`Error::CallbackPanic`], so unwinding
//! never leaves through a frame the host does not expect. The interrupted
//! computation is never resumed.

use crate::Error;
use std::any::Any;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;

/// Maximum nesting of entry points on one thread (entry point, host callback,
/// re-entrant entry point, ...).
pub const MAX_DEPTH: usize = 32;

thread_local! {
    static FRAMES: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
}

/// Number of boundary frames live on the calling thread.
pub fn depth() -> usize {
    FRAMES.with(|frames| frames.borrow().len())
}

/// Name of the innermost live entry point on the calling thread.
pub fn current() -> Option<&'static str> {
    FRAMES.with(|frames| frames.borrow().last().copied())
}

fn push(entry: &'static str) {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        if frames.len() == MAX_DEPTH {
            tracing::error!(entry, outer = ?*frames, "call boundary nested too deeply");
            std::process::abort();
        }
        frames.push(entry);
    })
}

fn pop(entry: &'static str) {
    FRAMES.with(|frames| {
        if frames.borrow_mut().pop().is_none() {
            tracing::error!(entry, "call boundary popped with no live frame");
            std::process::abort();
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Runs `f` inside a boundary frame named `entry`.
pub fn guarded<T>(entry: &'static str, f: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
    push(entry);
    let result = std::panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(&*payload);
        tracing::error!(entry, panic = %message, "panic unwound to the call boundary");
        Err(Error::CallbackPanic(message))
    });
    pop(entry);
    result
}
