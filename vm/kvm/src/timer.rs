// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One-shot execution quantum timer.

use crate::Error;
use crate::PREEMPTION_SIGNAL;
use nix::sys::signal::SigEvent;
use nix::sys::signal::SigevNotify;
use nix::sys::time::TimeSpec;
use nix::sys::timer::Expiration;
use nix::sys::timer::Timer;
use nix::sys::timer::TimerSetTimeFlags;
use nix::time::ClockId;
use std::time::Duration;

/// A one-shot timer that delivers [`PREEMPTION_SIGNAL`] to the thread that
/// armed it once the quantum elapses.
///
/// The timer is disarmed and destroyed when dropped. Unlike `setitimer`, the
/// signal is directed at the arming thread only, so several processors can
/// run on different threads without stealing each other's quanta.
#[derive(Debug)]
pub struct PreemptionTimer {
    _timer: Timer,
}

// SAFETY: a POSIX timer id is a process-wide handle; deleting or re-arming it
// from another thread is allowed. The notification target was fixed at
// creation time.
unsafe impl Send for PreemptionTimer {}

impl PreemptionTimer {
    /// Arms a timer for `after` targeting the calling thread.
    ///
    /// A zero duration would disarm the timer instead of firing it, so it is
    /// rounded up to one microsecond.
    pub fn arm(after: Duration) -> Result<Self, Error> {
        let after = after.max(Duration::from_micros(1));
        let event = SigEvent::new(SigevNotify::SigevThreadId {
            signal: PREEMPTION_SIGNAL,
            thread_id: nix::unistd::gettid().as_raw(),
            si_value: 0,
        });
        let mut timer = Timer::new(ClockId::CLOCK_MONOTONIC, event).map_err(Error::ArmTimer)?;
        timer
            .set(
                Expiration::OneShot(TimeSpec::from_duration(after)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(Error::ArmTimer)?;
        Ok(Self { _timer: timer })
    }
}
