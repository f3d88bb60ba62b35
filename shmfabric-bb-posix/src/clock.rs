// Copyright (c) 2023 Contributors to the Eclipse Foundation
//
// See the NOTICE file(s) distributed with this work for additional
// information regarding copyright ownership.
//
// This program and the accompanying materials are made available under the
// terms of the Apache Software License 2.0 which is available at
// https://www.apache.org/licenses/LICENSE-2.0, or the MIT license
// which is available at https://opensource.org/licenses/MIT.
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Timing primitives: [`ClockType`] selects between a monotonic and a wall clock, [`Time`] is a
//! point in time on one of them, and [`nanosleep_with_clock`] suspends the thread on a chosen
//! clock.

use serde::{Deserialize, Serialize};

use shmfabric_bb_elementary::duration::Duration;
use shmfabric_log::fail;

use crate::syscall::Errno;

/// Failures from [`Time::now_with_clock`] and [`Time::elapsed`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum TimeError {
    ClockTypeNotSupported,
    UnknownError(i32),
}

/// Failures from [`nanosleep_with_clock`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum NanosleepError {
    InterruptedBySignal(Duration),
    DurationOutOfRange,
    ClockTypeNotSupported,
    UnknownError(i32),
}

impl From<TimeError> for NanosleepError {
    fn from(e: TimeError) -> Self {
        match e {
            TimeError::ClockTypeNotSupported => NanosleepError::ClockTypeNotSupported,
            TimeError::UnknownError(v) => NanosleepError::UnknownError(v),
        }
    }
}

/// Selects which underlying POSIX clock a [`Time`] measurement is taken from.
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ClockType {
    /// `CLOCK_MONOTONIC`: unaffected by wall-clock adjustments, suitable for timeouts.
    Monotonic,
    /// `CLOCK_REALTIME`: wall-clock time.
    Realtime,
}

impl Default for ClockType {
    fn default() -> Self {
        ClockType::Monotonic
    }
}

impl ClockType {
    fn as_raw(self) -> libc::clockid_t {
        match self {
            ClockType::Monotonic => libc::CLOCK_MONOTONIC,
            ClockType::Realtime => libc::CLOCK_REALTIME,
        }
    }
}

/// A point in time measured on a particular [`ClockType`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Time {
    clock_type: ClockType,
    seconds: u64,
    nanoseconds: u32,
}

impl Time {
    /// Reads the current time from `clock_type`.
    pub fn now_with_clock(clock_type: ClockType) -> Result<Self, TimeError> {
        let msg = "Unable to read current time";
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(clock_type.as_raw(), &mut ts) };
        if rc == 0 {
            return Ok(Time {
                clock_type,
                seconds: ts.tv_sec as u64,
                nanoseconds: ts.tv_nsec as u32,
            });
        }

        match Errno::get() {
            Errno::EINVAL => fail!(from "Time::now_with_clock", with TimeError::ClockTypeNotSupported,
                "{} since {:?} is not supported on this platform.", msg, clock_type),
            e => fail!(from "Time::now_with_clock", with TimeError::UnknownError(e.value()),
                "{} since an unknown error occurred ({:?}).", msg, e),
        }
    }

    /// Reads the current time from [`ClockType::default`].
    pub fn now() -> Result<Self, TimeError> {
        Self::now_with_clock(ClockType::default())
    }

    /// Time elapsed between this point and now, on the same clock.
    pub fn elapsed(&self) -> Result<Duration, TimeError> {
        let now = fail!(from self, when Time::now_with_clock(self.clock_type),
            "Unable to compute elapsed time");
        Ok(now.as_duration().saturating_sub(self.as_duration()))
    }

    pub const fn clock_type(&self) -> ClockType {
        self.clock_type
    }

    pub const fn seconds(&self) -> u64 {
        self.seconds
    }

    pub const fn nanoseconds(&self) -> u32 {
        self.nanoseconds
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds) + Duration::from_nanos(self.nanoseconds as u64)
    }

    pub(crate) fn as_timespec(&self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.seconds as libc::time_t,
            tv_nsec: self.nanoseconds as i64,
        }
    }
}

/// Suspends the calling thread for `duration` on [`ClockType::default`].
pub fn nanosleep(duration: Duration) -> Result<(), NanosleepError> {
    nanosleep_with_clock(duration, ClockType::default())
}

/// Suspends the calling thread for `duration`, measured on `clock_type`, using an absolute
/// deadline so that spurious wakeups from signals resume waiting for the remaining time.
pub fn nanosleep_with_clock(
    duration: Duration,
    clock_type: ClockType,
) -> Result<(), NanosleepError> {
    let msg = "Unable to sleep";
    if duration.is_zero() {
        return Ok(());
    }

    let deadline = fail!(from "nanosleep_with_clock", when Time::now_with_clock(clock_type),
        "{} since the current time could not be read.", msg)
    .as_duration()
        + duration;

    let timeout = libc::timespec {
        tv_sec: deadline.as_secs() as libc::time_t,
        tv_nsec: deadline.subsec_nanos() as i64,
    };

    loop {
        let rc = unsafe { libc::clock_nanosleep(clock_type.as_raw(), libc::TIMER_ABSTIME, &timeout, core::ptr::null_mut()) };
        if rc == 0 {
            return Ok(());
        }
        match Errno(rc) {
            Errno::EINTR => continue,
            Errno::EINVAL => fail!(from "nanosleep_with_clock", with NanosleepError::DurationOutOfRange,
                "{} since the duration {:?} or clock {:?} is invalid.", msg, duration, clock_type),
            e => fail!(from "nanosleep_with_clock", with NanosleepError::UnknownError(e.value()),
                "{} due to an unknown error ({:?}).", msg, e),
        }
    }
}
