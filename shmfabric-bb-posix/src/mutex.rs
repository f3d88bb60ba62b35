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

//! An inter-process capable, robust `pthread_mutex_t` wrapper.
//!
//! The mutex is constructed with `PTHREAD_PROCESS_SHARED` so it works when placed in shared
//! memory, and with `PTHREAD_MUTEX_ROBUST` so that a lock held by a process that dies while
//! holding it is recoverable by the next locker instead of deadlocking the fabric forever.
//!
//! # Example
//!
//! ```
//! use shmfabric_bb_posix::mutex::*;
//! use core::mem::MaybeUninit;
//!
//! let mut storage = MaybeUninit::<Mutex>::uninit();
//! MutexBuilder::new().create(&mut storage).unwrap();
//! let mutex = unsafe { storage.assume_init() };
//!
//! {
//!     let _guard = mutex.lock().unwrap();
//!     // critical section
//! }
//! ```

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use shmfabric_bb_elementary::duration::Duration;
use shmfabric_log::{fail, warn};

use crate::clock::{ClockType, Time};
use crate::syscall::Errno;

/// Failures while constructing a [`Mutex`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum MutexCreationError {
    InsufficientResources,
    InsufficientMemory,
    UnknownError(i32),
}

/// Failures while locking, trying to lock, or unlocking a [`Mutex`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum MutexLockError {
    LockAcquiredButOwnerDied,
    Poisoned,
    MaximumNumberOfRecursiveLocksReached,
    DeadlockDetected,
    UnknownError(i32),
}

/// Failures specific to [`Mutex::try_lock`] and [`Mutex::timed_lock`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum MutexTryLockError {
    LockAcquiredButOwnerDied,
    Poisoned,
    WouldBlock,
    UnknownError(i32),
}

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum MutexUnlockError {
    OwnerDiedButLockCouldNotBeMarkedConsistent,
    NotOwnerOfLock,
    UnknownError(i32),
}

/// Builder for [`Mutex`]. There are no configurable properties today — the builder exists so
/// that future knobs (priority inheritance protocols, clock selection) can be added without
/// breaking callers, matching the rest of this workspace's construction idiom.
#[derive(Debug, Default)]
pub struct MutexBuilder {
    clock_type: ClockType,
}

impl MutexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock used by [`Mutex::timed_lock`] to interpret its timeout.
    pub fn clock_type(mut self, clock_type: ClockType) -> Self {
        self.clock_type = clock_type;
        self
    }

    /// Initializes `uninit` in place as a process-shared, robust mutex.
    pub fn create(self, uninit: &mut MaybeUninit<Mutex>) -> Result<(), MutexCreationError> {
        let msg = "Unable to create mutex";
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();

        unsafe {
            if libc::pthread_mutexattr_init(attr.as_mut_ptr()) != 0 {
                fail!(from self, with MutexCreationError::InsufficientMemory,
                    "{} since the mutex attributes could not be initialized.", msg);
            }
            libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST);
            libc::pthread_mutexattr_settype(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_NORMAL);

            let mutex_ptr = uninit.as_mut_ptr();
            core::ptr::write(
                core::ptr::addr_of_mut!((*mutex_ptr).handle),
                UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
            );
            core::ptr::write(
                core::ptr::addr_of_mut!((*mutex_ptr).clock_type),
                self.clock_type,
            );

            let handle_ptr = UnsafeCell::raw_get(core::ptr::addr_of!((*mutex_ptr).handle));
            let rc = libc::pthread_mutex_init(handle_ptr, attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());

            if rc == 0 {
                return Ok(());
            }

            match Errno(rc) {
                Errno::EAGAIN => fail!(from self, with MutexCreationError::InsufficientResources,
                    "{} due to insufficient resources (other than memory).", msg),
                Errno::ENOMEM => fail!(from self, with MutexCreationError::InsufficientMemory,
                    "{} due to insufficient memory.", msg),
                e => fail!(from self, with MutexCreationError::UnknownError(e.value()),
                    "{} due to an unknown error ({:?}).", msg, e),
            }
        }
    }
}

/// A robust, inter-process `pthread_mutex_t`. Always constructed in place via [`MutexBuilder`]
/// since it must never move once another process has mapped it.
#[repr(C)]
pub struct Mutex {
    handle: UnsafeCell<libc::pthread_mutex_t>,
    clock_type: ClockType,
}

// SAFETY: the underlying pthread_mutex_t is explicitly configured PTHREAD_PROCESS_SHARED and
// guards its own access; sharing `&Mutex` across threads is exactly what it is designed for.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.handle.get()
    }

    /// Recovers a lock left inconsistent by a dead owner, marking it usable again. Every lock
    /// path in this module calls this automatically on `EOWNERDEAD`; exposed for callers that
    /// want to inspect shared state before deciding to trust it.
    fn make_consistent(&self) -> Result<(), i32> {
        let rc = unsafe { libc::pthread_mutex_consistent(self.raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(rc)
        }
    }

    fn recover_from_owner_death(&self, origin: &str) -> Result<(), MutexLockError> {
        warn!(from origin, "The previous lock owner died while holding the mutex; marking it consistent.");
        if let Err(rc) = self.make_consistent() {
            fail!(from origin, with MutexLockError::Poisoned,
                "Unable to mark the mutex consistent after the previous owner died ({:?}).", Errno(rc));
        }
        Ok(())
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) -> Result<MutexGuard<'_>, MutexLockError> {
        let msg = "Unable to lock mutex";
        let rc = unsafe { libc::pthread_mutex_lock(self.raw()) };
        match rc {
            0 => Ok(MutexGuard { mutex: self }),
            libc::EOWNERDEAD => {
                self.recover_from_owner_death("Mutex::lock")?;
                Ok(MutexGuard { mutex: self })
            }
            libc::ENOTRECOVERABLE => fail!(from self, with MutexLockError::Poisoned,
                "{} since it is in an unrecoverable, poisoned state.", msg),
            libc::EDEADLK => fail!(from self, with MutexLockError::DeadlockDetected,
                "{} since the calling thread already owns it.", msg),
            e => fail!(from self, with MutexLockError::UnknownError(e),
                "{} due to an unknown error ({}).", msg, e),
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Result<Option<MutexGuard<'_>>, MutexTryLockError> {
        let msg = "Unable to try-lock mutex";
        let rc = unsafe { libc::pthread_mutex_trylock(self.raw()) };
        match rc {
            0 => Ok(Some(MutexGuard { mutex: self })),
            libc::EBUSY => Ok(None),
            libc::EOWNERDEAD => {
                warn!(from "Mutex::try_lock", "The previous lock owner died while holding the mutex; marking it consistent.");
                if let Err(rc) = self.make_consistent() {
                    fail!(from self, with MutexTryLockError::Poisoned,
                        "{} since the mutex could not be marked consistent after the previous owner died ({:?}).", msg, Errno(rc));
                }
                Ok(Some(MutexGuard { mutex: self }))
            }
            libc::ENOTRECOVERABLE => fail!(from self, with MutexTryLockError::Poisoned,
                "{} since it is in an unrecoverable, poisoned state.", msg),
            e => fail!(from self, with MutexTryLockError::UnknownError(e),
                "{} due to an unknown error ({}).", msg, e),
        }
    }

    /// Attempts to acquire the lock, waiting up to `timeout` on this mutex's configured clock.
    pub fn timed_lock(&self, timeout: Duration) -> Result<Option<MutexGuard<'_>>, MutexTryLockError> {
        let msg = "Unable to timed-lock mutex";
        let deadline = match Time::now_with_clock(self.clock_type) {
            Ok(now) => now.as_duration() + timeout,
            Err(e) => fail!(from self, with MutexTryLockError::UnknownError(0),
                "{} since the current time could not be read ({:?}).", msg, e),
        };
        let ts = libc::timespec {
            tv_sec: deadline.as_secs() as libc::time_t,
            tv_nsec: deadline.subsec_nanos() as i64,
        };

        let rc = unsafe { libc::pthread_mutex_timedlock(self.raw(), &ts) };
        match rc {
            0 => Ok(Some(MutexGuard { mutex: self })),
            libc::ETIMEDOUT => Ok(None),
            libc::EOWNERDEAD => {
                warn!(from "Mutex::timed_lock", "The previous lock owner died while holding the mutex; marking it consistent.");
                if let Err(rc) = self.make_consistent() {
                    fail!(from self, with MutexTryLockError::Poisoned,
                        "{} since the mutex could not be marked consistent after the previous owner died ({:?}).", msg, Errno(rc));
                }
                Ok(Some(MutexGuard { mutex: self }))
            }
            libc::ENOTRECOVERABLE => fail!(from self, with MutexTryLockError::Poisoned,
                "{} since it is in an unrecoverable, poisoned state.", msg),
            e => fail!(from self, with MutexTryLockError::UnknownError(e),
                "{} due to an unknown error ({}).", msg, e),
        }
    }

    fn unlock(&self) -> Result<(), MutexUnlockError> {
        let msg = "Unable to unlock mutex";
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        match rc {
            0 => Ok(()),
            libc::EPERM => fail!(from self, with MutexUnlockError::NotOwnerOfLock,
                "{} since the calling thread does not own it.", msg),
            e => fail!(from self, with MutexUnlockError::UnknownError(e),
                "{} due to an unknown error ({}).", msg, e),
        }
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_mutex_destroy(self.raw()) };
        if rc != 0 {
            warn!(from self, "Failed to destroy mutex while dropping it ({:?}); the resource may leak.", Errno(rc));
        }
    }
}

impl core::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex").field("clock_type", &self.clock_type).finish()
    }
}

/// RAII guard releasing the mutex on drop.
#[must_use = "the lock is released when the guard is dropped"]
pub struct MutexGuard<'mtx> {
    mutex: &'mtx Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            warn!(from self.mutex, "Failed to unlock mutex from guard drop: {:?}.", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn new_mutex() -> Box<Mutex> {
        let mut storage = Box::new(MaybeUninit::<Mutex>::uninit());
        MutexBuilder::new().create(&mut storage).unwrap();
        unsafe { Box::from_raw(Box::into_raw(storage) as *mut Mutex) }
    }

    #[test]
    fn lock_and_unlock_round_trips() {
        let mutex = new_mutex();
        {
            let _guard = mutex.lock().unwrap();
        }
        assert!(mutex.try_lock().unwrap().is_some());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = new_mutex();
        let _guard = mutex.lock().unwrap();
        assert!(mutex.try_lock().unwrap().is_none());
    }

    #[test]
    fn timed_lock_times_out_while_held() {
        let mutex = new_mutex();
        let _guard = mutex.lock().unwrap();
        let result = mutex.timed_lock(Duration::from_millis(10)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn serializes_access_across_threads() {
        let mutex = new_mutex();
        let counter = std::sync::atomic::AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        let _guard = mutex.lock().unwrap();
                        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 8000);
    }
}
