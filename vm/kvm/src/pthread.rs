// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A copyable pthread handle that can be kicked with a signal from any
//! thread.

use nix::sys::signal::Signal;
use std::io;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Pthread(libc::pthread_t);

// SAFETY: pthread_t is an opaque handle and is safe to share/send between
// threads. But it's a pointer type on musl so does not default to Send+Sync.
unsafe impl Send for Pthread {}
// SAFETY: see above comment.
unsafe impl Sync for Pthread {}

impl Pthread {
    /// Gets a Pthread object initialized with the caller thread.
    pub fn current() -> Self {
        // SAFETY: calling C API as documented, with no special requirements.
        Self(unsafe { libc::pthread_self() })
    }

    /// Sends `signal` to the thread.
    ///
    /// Fails with `ESRCH` if the thread has already exited.
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        // SAFETY: calling as documented, with no special requirements.
        let ret = unsafe { libc::pthread_kill(self.0, signal as i32) };
        // pthread_kill reports the error as its return value, not via errno.
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(())
    }
}
