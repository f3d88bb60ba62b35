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

//! A POSIX shared-memory object (`shm_open` + `ftruncate` + `mmap`).
//!
//! # Important
//!
//! Anything placed into the mapped region must be `#[repr(C)]` and relocatable — every process
//! mapping the same segment may see it at a different base address.

use core::ptr::NonNull;

use shmfabric_log::{fail, warn};

use crate::permission::Permission;
use crate::syscall::Errno;

/// Whether a segment is being freshly created, only opened if it already exists, or purged and
/// recreated regardless of prior state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CreationMode {
    CreateExclusive,
    OpenOrCreate,
    PurgeAndCreate,
}

/// Access requested when opening an already-existing segment.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AccessMode {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum SharedMemoryCreationError {
    InvalidName,
    NameTooLong,
    AlreadyExists,
    DoesNotExist,
    InsufficientPermissions,
    UnsupportedSizeOfZero,
    SizeDoesNotFit,
    InsufficientMemory,
    PerProcessFileHandleLimitReached,
    SystemWideFileHandleLimitReached,
    UnableToZeroMemory,
    UnknownError(i32),
}

impl From<crate::signal_guard::SignalGuardError> for SharedMemoryCreationError {
    fn from(_: crate::signal_guard::SignalGuardError) -> Self {
        SharedMemoryCreationError::UnableToZeroMemory
    }
}

/// Validates the `SharedMemoryName` grammar from the external interface spec: a non-empty
/// printable-ASCII string of letters, digits, `-._:`, not `.` or `..`, and without a trailing
/// dot. The leading `/` `shm_open` requires is added internally and is not part of this name.
pub fn validate_shared_memory_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    if name.ends_with('.') {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b':'))
}

/// Builder for [`SharedMemoryObject`].
#[derive(Debug)]
pub struct SharedMemoryObjectBuilder<'a> {
    name: &'a str,
    size: usize,
    permission: Permission,
    creation_mode: CreationMode,
    access_mode: AccessMode,
    group: Option<libc::gid_t>,
}

impl<'a> SharedMemoryObjectBuilder<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            size: 0,
            permission: Permission::OWNER_ALL,
            creation_mode: CreationMode::OpenOrCreate,
            access_mode: AccessMode::ReadWrite,
            group: None,
        }
    }

    /// Changes the owning group of a freshly created segment so that a reader/writer group
    /// permission split (the substitute this workspace uses in place of POSIX ACLs, see
    /// [`crate::group`]) can be enforced through plain file-mode group bits.
    pub fn group(mut self, gid: libc::gid_t) -> Self {
        self.group = Some(gid);
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    pub fn creation_mode(mut self, creation_mode: CreationMode) -> Self {
        self.creation_mode = creation_mode;
        self
    }

    /// Opens an existing segment, mapping it read-only or read-write per `access_mode`. The
    /// segment's actual size (as reported by the OS) is used, not `self.size`.
    pub fn open_existing(
        mut self,
        access_mode: AccessMode,
    ) -> Result<SharedMemoryObject, SharedMemoryCreationError> {
        self.access_mode = access_mode;
        self.open()
    }

    /// Creates (or purges-and-creates, or opens-or-creates, per `creation_mode`) the segment at
    /// `self.size` bytes.
    pub fn create(self) -> Result<SharedMemoryObject, SharedMemoryCreationError> {
        let msg = "Unable to create shared memory object";
        if !validate_shared_memory_name(self.name) {
            fail!(from self, with SharedMemoryCreationError::InvalidName,
                "{} since \"{}\" does not satisfy the shared memory name grammar.", msg, self.name);
        }
        if self.name.len() > libc::PATH_MAX as usize - 1 {
            fail!(from self, with SharedMemoryCreationError::NameTooLong,
                "{} since the name exceeds the platform's path length limit.", msg);
        }
        if self.size == 0 {
            fail!(from self, with SharedMemoryCreationError::UnsupportedSizeOfZero,
                "{} since a zero-sized shared memory object is not supported.", msg);
        }

        let cname = to_shm_path(self.name);

        if self.creation_mode == CreationMode::PurgeAndCreate {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }

        let mut oflag = libc::O_RDWR;
        oflag |= match self.creation_mode {
            CreationMode::CreateExclusive => libc::O_CREAT | libc::O_EXCL,
            CreationMode::OpenOrCreate => libc::O_CREAT,
            CreationMode::PurgeAndCreate => libc::O_CREAT | libc::O_EXCL,
        };

        let fd = unsafe { libc::shm_open(cname.as_ptr(), oflag, self.permission.bits() as libc::c_uint) };
        if fd < 0 {
            return Err(translate_shm_open_errno(&self, msg));
        }

        if unsafe { libc::ftruncate(fd, self.size as libc::off_t) } != 0 {
            let e = Errno::get();
            unsafe { libc::close(fd) };
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            fail!(from self, with translate_ftruncate_errno(e), "{} since the segment could not be sized.", msg);
        }

        if let Some(gid) = self.group {
            if unsafe { libc::fchown(fd, libc::uid_t::MAX, gid) } != 0 {
                warn!(from self, "Failed to change the owning group of the shared memory object ({:?}); group permission bits will not take effect.", Errno::get());
            } else if unsafe { libc::fchmod(fd, self.permission.bits()) } != 0 {
                warn!(from self, "Failed to reapply permission bits after changing group ownership ({:?}).", Errno::get());
            }
        }

        let shm = map_and_wrap(fd, self.size, self.access_mode, self.name, true, &self)?;
        zero_freshly_mapped_memory(&shm, msg, &self)?;
        Ok(shm)
    }

    fn open(self) -> Result<SharedMemoryObject, SharedMemoryCreationError> {
        let msg = "Unable to open shared memory object";
        if !validate_shared_memory_name(self.name) {
            fail!(from self, with SharedMemoryCreationError::InvalidName,
                "{} since \"{}\" does not satisfy the shared memory name grammar.", msg, self.name);
        }

        let cname = to_shm_path(self.name);
        let oflag = match self.access_mode {
            AccessMode::Read => libc::O_RDONLY,
            AccessMode::ReadWrite => libc::O_RDWR,
        };
        let fd = unsafe { libc::shm_open(cname.as_ptr(), oflag, 0) };
        if fd < 0 {
            return Err(translate_shm_open_errno(&self, msg));
        }

        let mut stat: libc::stat = unsafe { core::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let e = Errno::get();
            unsafe { libc::close(fd) };
            fail!(from self, with SharedMemoryCreationError::UnknownError(e.value()),
                "{} since the segment's size could not be determined ({:?}).", msg, e);
        }

        map_and_wrap(fd, stat.st_size as usize, self.access_mode, self.name, false, &self)
    }
}

fn to_shm_path(name: &str) -> std::ffi::CString {
    std::ffi::CString::new(format!("/{name}")).expect("validated name contains no NUL byte")
}

fn translate_shm_open_errno(
    origin: &SharedMemoryObjectBuilder<'_>,
    msg: &str,
) -> SharedMemoryCreationError {
    let e = Errno::get();
    let value = match e {
        Errno::EEXIST => SharedMemoryCreationError::AlreadyExists,
        Errno::ENOENT => SharedMemoryCreationError::DoesNotExist,
        Errno::EACCES => SharedMemoryCreationError::InsufficientPermissions,
        Errno::ENAMETOOLONG => SharedMemoryCreationError::NameTooLong,
        Errno::EMFILE => SharedMemoryCreationError::PerProcessFileHandleLimitReached,
        Errno::ENFILE => SharedMemoryCreationError::SystemWideFileHandleLimitReached,
        e => SharedMemoryCreationError::UnknownError(e.value()),
    };
    warn!(from origin, "{} ({:?}).", msg, value);
    value
}

/// Zeroes `shm`'s whole mapping under a scoped `SIGBUS` override, so that an exhausted backing
/// store (e.g. a tmpfs over quota) surfaces as [`SharedMemoryCreationError::UnableToZeroMemory`]
/// instead of aborting the process.
fn zero_freshly_mapped_memory(
    shm: &SharedMemoryObject,
    msg: &str,
    origin: &SharedMemoryObjectBuilder<'_>,
) -> Result<(), SharedMemoryCreationError> {
    let message = format!(
        "While zeroing the shared memory object \"{}\" ({} bytes) a SIGBUS signal was raised; \
the backing store is likely out of space.\n",
        shm.name(),
        shm.size(),
    );
    let guard = fail!(from origin, when crate::signal_guard::SigBusGuard::install(&message),
        "{} since the SIGBUS override could not be installed to safely zero the mapping.", msg);

    let base = shm.base_address();
    let size = shm.size();
    fail!(from origin, when guard.guarded(|| unsafe { core::ptr::write_bytes(base.as_ptr(), 0, size) }),
        "{} since a SIGBUS signal was raised while zeroing the freshly mapped memory.", msg);
    Ok(())
}

fn translate_ftruncate_errno(e: Errno) -> SharedMemoryCreationError {
    match e {
        Errno::ENOSPC => SharedMemoryCreationError::InsufficientMemory,
        e => SharedMemoryCreationError::UnknownError(e.value()),
    }
}

fn map_and_wrap(
    fd: libc::c_int,
    size: usize,
    access_mode: AccessMode,
    name: &str,
    has_ownership: bool,
    origin: &SharedMemoryObjectBuilder<'_>,
) -> Result<SharedMemoryObject, SharedMemoryCreationError> {
    let msg = "Unable to map shared memory object";
    let prot = match access_mode {
        AccessMode::Read => libc::PROT_READ,
        AccessMode::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };

    let addr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            prot,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    unsafe { libc::close(fd) };

    if addr == libc::MAP_FAILED {
        let e = Errno::get();
        fail!(from origin, with SharedMemoryCreationError::UnknownError(e.value()),
            "{} since mmap failed ({:?}).", msg, e);
    }

    Ok(SharedMemoryObject {
        base: NonNull::new(addr as *mut u8).expect("mmap succeeded"),
        size,
        name: name.to_string(),
        has_ownership,
    })
}

/// A mapped POSIX shared-memory segment. Move-only: dropping it unmaps the region, and (if this
/// handle has ownership, i.e. it created the segment) unlinks the underlying shm object.
pub struct SharedMemoryObject {
    base: NonNull<u8>,
    size: usize,
    name: String,
    has_ownership: bool,
}

unsafe impl Send for SharedMemoryObject {}
unsafe impl Sync for SharedMemoryObject {}

impl SharedMemoryObject {
    pub fn base_address(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_ownership(&self) -> bool {
        self.has_ownership
    }

    /// Relinquishes ownership so dropping this handle no longer unlinks the shm object — used
    /// when another process is meant to outlive this one's view of the segment.
    pub fn release_ownership(&mut self) {
        self.has_ownership = false;
    }

    /// # Safety
    ///
    /// The caller must not read or write past `size()` bytes from the returned pointer.
    pub unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.base.as_ptr(), self.size)
    }

    /// # Safety
    ///
    /// The caller must not read or write past `size()` bytes from the returned pointer, and must
    /// ensure exclusive access for the duration of the borrow.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.base.as_ptr(), self.size)
    }
}

impl core::fmt::Debug for SharedMemoryObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedMemoryObject")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("has_ownership", &self.has_ownership)
            .finish()
    }
}

impl Drop for SharedMemoryObject {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.size) } != 0 {
            warn!(from self, "Failed to unmap shared memory object while dropping it; the mapping may leak.");
        }
        if self.has_ownership {
            let cname = to_shm_path(&self.name);
            if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
                warn!(from self, "Failed to unlink shared memory object while dropping it.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("shmfabric-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn validates_name_grammar() {
        assert!(validate_shared_memory_name("valid-name_1.2:3"));
        assert!(!validate_shared_memory_name(""));
        assert!(!validate_shared_memory_name("."));
        assert!(!validate_shared_memory_name(".."));
        assert!(!validate_shared_memory_name("trailing-dot."));
        assert!(!validate_shared_memory_name("has/slash"));
    }

    #[test]
    fn create_exclusive_then_open_existing_round_trips() {
        let name = unique_name("create-open");
        let mut shm = SharedMemoryObjectBuilder::new(&name)
            .size(4096)
            .creation_mode(CreationMode::CreateExclusive)
            .create()
            .unwrap();

        unsafe { shm.as_mut_slice()[0] = 0xAB };

        let opened = SharedMemoryObjectBuilder::new(&name)
            .open_existing(AccessMode::Read)
            .unwrap();
        assert_eq!(opened.size(), 4096);
        assert_eq!(unsafe { opened.as_slice()[0] }, 0xAB);

        shm.release_ownership();
        let cname = to_shm_path(&name);
        unsafe { libc::shm_unlink(cname.as_ptr()) };
    }

    #[test]
    fn create_exclusive_twice_fails_with_already_exists() {
        let name = unique_name("exclusive-twice");
        let shm = SharedMemoryObjectBuilder::new(&name)
            .size(4096)
            .creation_mode(CreationMode::CreateExclusive)
            .create()
            .unwrap();

        let result = SharedMemoryObjectBuilder::new(&name)
            .size(4096)
            .creation_mode(CreationMode::CreateExclusive)
            .create();
        assert_eq!(result.unwrap_err(), SharedMemoryCreationError::AlreadyExists);
        drop(shm);
    }

    #[test]
    fn zero_size_is_rejected() {
        let name = unique_name("zero-size");
        let result = SharedMemoryObjectBuilder::new(&name)
            .size(0)
            .creation_mode(CreationMode::CreateExclusive)
            .create();
        assert_eq!(result.unwrap_err(), SharedMemoryCreationError::UnsupportedSizeOfZero);
    }

    #[test]
    fn invalid_name_is_rejected_before_any_syscall() {
        let result = SharedMemoryObjectBuilder::new("..")
            .size(4096)
            .creation_mode(CreationMode::CreateExclusive)
            .create();
        assert_eq!(result.unwrap_err(), SharedMemoryCreationError::InvalidName);
    }
}
