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

//! An unnamed, inter-process capable POSIX semaphore (`sem_init` with `pshared = 1`).
//!
//! `sem_timedwait` only ever accepts an absolute `CLOCK_REALTIME` deadline, so
//! [`UnnamedSemaphore::timed_wait`] always measures its timeout against the real-time clock,
//! unlike [`crate::mutex::Mutex::timed_lock`] which can be configured for either clock.

use core::mem::MaybeUninit;

use shmfabric_bb_elementary::duration::Duration;
use shmfabric_log::{fail, warn};

use crate::clock::{ClockType, Time};
use crate::syscall::Errno;

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum SemaphoreCreationError {
    InitialValueExceedsMaximum,
    InsufficientResources,
    UnknownError(i32),
}

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum SemaphoreWaitError {
    InterruptedBySignal,
    UnknownError(i32),
}

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum SemaphorePostError {
    WouldExceedMaximumValue,
    UnknownError(i32),
}

/// Builder for [`UnnamedSemaphore`].
#[derive(Debug)]
pub struct UnnamedSemaphoreBuilder {
    initial_value: u32,
}

impl Default for UnnamedSemaphoreBuilder {
    fn default() -> Self {
        Self { initial_value: 0 }
    }
}

impl UnnamedSemaphoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_value(mut self, value: u32) -> Self {
        self.initial_value = value;
        self
    }

    /// Initializes `uninit` in place as a process-shared semaphore.
    pub fn create(
        self,
        uninit: &mut MaybeUninit<UnnamedSemaphore>,
    ) -> Result<(), SemaphoreCreationError> {
        let msg = "Unable to create semaphore";
        unsafe {
            let sem_ptr = uninit.as_mut_ptr();
            let handle_ptr = core::ptr::addr_of_mut!((*sem_ptr).handle);
            let rc = libc::sem_init(handle_ptr as *mut libc::sem_t, 1, self.initial_value);
            if rc == 0 {
                return Ok(());
            }

            match Errno::get() {
                Errno::EINVAL => fail!(from self, with SemaphoreCreationError::InitialValueExceedsMaximum,
                    "{} since the initial value {} exceeds SEM_VALUE_MAX.", msg, self.initial_value),
                Errno::ENOMEM | Errno::EAGAIN => fail!(from self, with SemaphoreCreationError::InsufficientResources,
                    "{} due to insufficient resources.", msg),
                e => fail!(from self, with SemaphoreCreationError::UnknownError(e.value()),
                    "{} due to an unknown error ({:?}).", msg, e),
            }
        }
    }
}

/// An unnamed POSIX semaphore constructed in place, typically embedded in a shared-memory
/// segment alongside the data it guards.
#[repr(C)]
pub struct UnnamedSemaphore {
    handle: libc::sem_t,
}

unsafe impl Send for UnnamedSemaphore {}
unsafe impl Sync for UnnamedSemaphore {}

impl UnnamedSemaphore {
    fn raw(&self) -> *mut libc::sem_t {
        &self.handle as *const libc::sem_t as *mut libc::sem_t
    }

    /// Blocks until the semaphore's value is greater than zero, then decrements it.
    pub fn wait(&self) -> Result<(), SemaphoreWaitError> {
        let msg = "Unable to wait on semaphore";
        loop {
            let rc = unsafe { libc::sem_wait(self.raw()) };
            if rc == 0 {
                return Ok(());
            }
            match Errno::get() {
                Errno::EINTR => continue,
                e => fail!(from self, with SemaphoreWaitError::UnknownError(e.value()),
                    "{} due to an unknown error ({:?}).", msg, e),
            }
        }
    }

    /// Decrements the semaphore without blocking if its value is greater than zero.
    pub fn try_wait(&self) -> Result<bool, SemaphoreWaitError> {
        let msg = "Unable to try-wait on semaphore";
        let rc = unsafe { libc::sem_trywait(self.raw()) };
        if rc == 0 {
            return Ok(true);
        }
        match Errno::get() {
            Errno::EAGAIN => Ok(false),
            Errno::EINTR => Ok(false),
            e => fail!(from self, with SemaphoreWaitError::UnknownError(e.value()),
                "{} due to an unknown error ({:?}).", msg, e),
        }
    }

    /// Waits up to `timeout`, measured against `CLOCK_REALTIME` (the only clock
    /// `sem_timedwait` accepts an absolute deadline on).
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool, SemaphoreWaitError> {
        let msg = "Unable to timed-wait on semaphore";
        let deadline = match Time::now_with_clock(ClockType::Realtime) {
            Ok(now) => now.as_duration() + timeout,
            Err(e) => fail!(from self, with SemaphoreWaitError::UnknownError(0),
                "{} since the current time could not be read ({:?}).", msg, e),
        };
        let ts = libc::timespec {
            tv_sec: deadline.as_secs() as libc::time_t,
            tv_nsec: deadline.subsec_nanos() as i64,
        };

        loop {
            let rc = unsafe { libc::sem_timedwait(self.raw(), &ts) };
            if rc == 0 {
                return Ok(true);
            }
            match Errno::get() {
                Errno::EINTR => continue,
                Errno::ETIMEDOUT => return Ok(false),
                e => fail!(from self, with SemaphoreWaitError::UnknownError(e.value()),
                    "{} due to an unknown error ({:?}).", msg, e),
            }
        }
    }

    /// Increments the semaphore's value, waking one waiter if any are blocked.
    pub fn post(&self) -> Result<(), SemaphorePostError> {
        let msg = "Unable to post semaphore";
        let rc = unsafe { libc::sem_post(self.raw()) };
        if rc == 0 {
            return Ok(());
        }
        match Errno::get() {
            Errno::EOVERFLOW => fail!(from self, with SemaphorePostError::WouldExceedMaximumValue,
                "{} since the maximum value would be exceeded.", msg),
            e => fail!(from self, with SemaphorePostError::UnknownError(e.value()),
                "{} due to an unknown error ({:?}).", msg, e),
        }
    }
}

impl Drop for UnnamedSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_destroy(self.raw()) } != 0 {
            warn!(from self, "Failed to destroy semaphore while dropping it; the resource may leak.");
        }
    }
}

impl core::fmt::Debug for UnnamedSemaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnnamedSemaphore").finish()
    }
}
