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

//! Resolves POSIX group ids to and from group names (`getgrnam_r` / `getgrgid_r`).

use std::ffi::{CStr, CString};

use shmfabric_log::fail;

use crate::syscall::Errno;

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum GroupError {
    GroupDoesNotExist,
    UnknownError(i32),
}

/// A resolved POSIX group.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Group {
    gid: libc::gid_t,
    name: String,
}

impl Group {
    /// Resolves the currently running process's effective group.
    pub fn from_self() -> Result<Self, GroupError> {
        Self::from_gid(unsafe { libc::getegid() })
    }

    pub fn from_gid(gid: libc::gid_t) -> Result<Self, GroupError> {
        let msg = "Unable to resolve group";
        let mut group: libc::group = unsafe { core::mem::zeroed() };
        let mut buf = vec![0_i8; 16 * 1024];
        let mut result: *mut libc::group = core::ptr::null_mut();

        let rc = unsafe {
            libc::getgrgid_r(gid, &mut group, buf.as_mut_ptr(), buf.len(), &mut result)
        };

        if rc != 0 {
            fail!(from "Group::from_gid", with GroupError::UnknownError(rc),
                "{} {} since an unknown error occurred ({:?}).", msg, gid, Errno(rc));
        }
        if result.is_null() {
            fail!(from "Group::from_gid", with GroupError::GroupDoesNotExist,
                "{} {} since no such group exists.", msg, gid);
        }

        let name = unsafe { CStr::from_ptr(group.gr_name) }
            .to_string_lossy()
            .into_owned();
        Ok(Group { gid, name })
    }

    pub fn from_name(name: &str) -> Result<Self, GroupError> {
        let msg = "Unable to resolve group";
        let cname = CString::new(name).map_err(|_| GroupError::GroupDoesNotExist)?;
        let mut group: libc::group = unsafe { core::mem::zeroed() };
        let mut buf = vec![0_i8; 16 * 1024];
        let mut result: *mut libc::group = core::ptr::null_mut();

        let rc = unsafe {
            libc::getgrnam_r(cname.as_ptr(), &mut group, buf.as_mut_ptr(), buf.len(), &mut result)
        };

        if rc != 0 {
            fail!(from "Group::from_name", with GroupError::UnknownError(rc),
                "{} \"{}\" since an unknown error occurred ({:?}).", msg, name, Errno(rc));
        }
        if result.is_null() {
            fail!(from "Group::from_name", with GroupError::GroupDoesNotExist,
                "{} \"{}\" since no such group exists.", msg, name);
        }

        Ok(Group {
            gid: group.gr_gid,
            name: name.to_string(),
        })
    }

    pub fn gid(&self) -> libc::gid_t {
        self.gid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_current_group() {
        let group = Group::from_self().unwrap();
        assert_eq!(group.gid(), unsafe { libc::getegid() });
    }
}
