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

//! A scoped override of the `SIGBUS` disposition, used to turn a fatal signal raised mid-`memset`
//! (an exhausted tmpfs backing a shared-memory mapping) into a structured [`SignalGuardError`]
//! instead of letting the process abort.
//!
//! [`SigBusGuard::install`] saves whatever `sigaction` was previously registered for `SIGBUS` and
//! installs one that escapes back to [`SigBusGuard::guarded`] via `siglongjmp` the moment the
//! signal arrives. Dropping the guard restores the previous `sigaction`; guards dropped in the
//! reverse of their acquisition order (ordinary Rust scoping) restore correctly layered, one
//! previous state per guard.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use shmfabric_log::warn;

use crate::syscall::Errno;

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum SignalGuardError {
    /// `sigaction` failed while installing the override.
    UnableToInstallHandler,
    /// `SIGBUS` was raised during the guarded call and the call was abandoned.
    SignalRaised,
}

/// Opaque storage for a `sigjmp_buf`. Only ever touched by `__sigsetjmp`/`siglongjmp`; sized
/// generously since its real layout is platform- and libc-specific and never inspected from Rust.
#[repr(C, align(16))]
struct JumpBuffer([u8; 256]);

impl JumpBuffer {
    const fn zeroed() -> Self {
        Self([0; 256])
    }
}

extern "C" {
    #[link_name = "__sigsetjmp"]
    fn raw_sigsetjmp(env: *mut JumpBuffer, savesigs: libc::c_int) -> libc::c_int;
    fn siglongjmp(env: *mut JumpBuffer, val: libc::c_int) -> !;
}

const MESSAGE_CAPACITY: usize = 1024;

/// The buffer a guarded call's handler writes to `stderr` if `SIGBUS` fires. Written only while
/// [`INSTALL_LOCK`] is held (before the handler is armed), read only from the handler itself —
/// never both at once, so the lack of interior synchronization on the byte array is sound.
struct MessageSlot(MaybeUninit<[u8; MESSAGE_CAPACITY]>);
unsafe impl Sync for MessageSlot {}

static MESSAGE: MessageSlot = MessageSlot(MaybeUninit::uninit());
static MESSAGE_LEN: AtomicUsize = AtomicUsize::new(0);
static JUMP_TARGET: AtomicPtr<JumpBuffer> = AtomicPtr::new(core::ptr::null_mut());

fn install_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Signal-safe: reads the pre-filled message length, writes it to `stderr` with the raw `write`
/// syscall, then jumps back to the armed [`JumpBuffer`] if one is set. Never allocates, never
/// takes a lock.
extern "C" fn handle_sigbus(_signal: libc::c_int) {
    let len = MESSAGE_LEN.load(Ordering::Acquire);
    if len > 0 {
        let ptr = MESSAGE.0.as_ptr() as *const libc::c_void;
        unsafe {
            libc::write(libc::STDERR_FILENO, ptr, len);
        }
    }
    let target = JUMP_TARGET.load(Ordering::Acquire);
    if !target.is_null() {
        unsafe { siglongjmp(target, 1) }
    }
}

/// A scoped `SIGBUS` override. See the module documentation.
pub struct SigBusGuard {
    previous: libc::sigaction,
    _lock: MutexGuard<'static, ()>,
}

impl SigBusGuard {
    /// Installs the override, saving the previously registered `sigaction` for `SIGBUS` so
    /// [`Drop`] can restore it. `message` is copied into the pre-filled buffer the handler writes
    /// verbatim if the signal fires; it is truncated to [`MESSAGE_CAPACITY`] bytes.
    pub fn install(message: &str) -> Result<Self, SignalGuardError> {
        let lock = install_lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let bytes = message.as_bytes();
        let copy_len = bytes.len().min(MESSAGE_CAPACITY);
        unsafe {
            let dst = MESSAGE.0.as_ptr() as *mut u8;
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, copy_len);
        }
        MESSAGE_LEN.store(copy_len, Ordering::Release);

        let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
        action.sa_sigaction = handle_sigbus as usize;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        action.sa_flags = 0;

        let mut previous: libc::sigaction = unsafe { core::mem::zeroed() };
        let rc = unsafe { libc::sigaction(libc::SIGBUS, &action, &mut previous) };
        if rc != 0 {
            MESSAGE_LEN.store(0, Ordering::Release);
            return Err(SignalGuardError::UnableToInstallHandler);
        }

        Ok(SigBusGuard { previous, _lock: lock })
    }

    /// Runs `f`, catching a `SIGBUS` raised during the call. On a normal return, `Ok(())`. If the
    /// signal fires, `f` is abandoned mid-execution (its state past that point is never observed)
    /// and this returns `Err(SignalGuardError::SignalRaised)`.
    pub fn guarded<F: FnOnce()>(&self, f: F) -> Result<(), SignalGuardError> {
        let mut buf = JumpBuffer::zeroed();
        JUMP_TARGET.store(&mut buf, Ordering::Release);
        let rc = unsafe { raw_sigsetjmp(&mut buf, 1) };
        let result = if rc == 0 {
            f();
            Ok(())
        } else {
            Err(SignalGuardError::SignalRaised)
        };
        JUMP_TARGET.store(core::ptr::null_mut(), Ordering::Release);
        result
    }
}

impl Drop for SigBusGuard {
    fn drop(&mut self) {
        MESSAGE_LEN.store(0, Ordering::Release);
        if unsafe { libc::sigaction(libc::SIGBUS, &self.previous, core::ptr::null_mut()) } != 0 {
            warn!(from "SigBusGuard::drop", "Failed to restore the previous SIGBUS handler ({:?}); it stays overridden.", Errno::get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_call_that_never_raises_sigbus_returns_ok() {
        let guard = SigBusGuard::install("should never be written").unwrap();
        let mut touched = false;
        guard.guarded(|| touched = true).unwrap();
        assert!(touched);
    }

    #[test]
    fn raising_sigbus_mid_call_is_reported_as_signal_raised() {
        let guard = SigBusGuard::install("synthetic SIGBUS for a test\n").unwrap();
        let result = guard.guarded(|| unsafe {
            libc::raise(libc::SIGBUS);
            unreachable!("siglongjmp escapes before this is reached");
        });
        assert_eq!(result, Err(SignalGuardError::SignalRaised));
    }

    #[test]
    fn dropping_the_guard_restores_the_previous_disposition() {
        let mut before: libc::sigaction = unsafe { core::mem::zeroed() };
        unsafe { libc::sigaction(libc::SIGBUS, core::ptr::null(), &mut before) };

        {
            let _guard = SigBusGuard::install("unused").unwrap();
        }

        let mut after: libc::sigaction = unsafe { core::mem::zeroed() };
        unsafe { libc::sigaction(libc::SIGBUS, core::ptr::null(), &mut after) };
        assert_eq!(before.sa_sigaction, after.sa_sigaction);
    }
}
