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

//! Resolves POSIX user ids to and from user names (`getpwnam_r` / `getpwuid_r`).

use std::ffi::{CStr, CString};

use shmfabric_log::fail;

use crate::syscall::Errno;

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum UserError {
    UserDoesNotExist,
    InsufficientBufferSize,
    UnknownError(i32),
}

/// A resolved POSIX user.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct User {
    uid: libc::uid_t,
    gid: libc::gid_t,
    name: String,
    groups: Vec<libc::gid_t>,
}

/// Resolves `name`'s full supplementary group list (primary group included) via `getgrouplist`.
/// Falls back to just `gid` if the user name cannot be represented as a C string, or if the
/// kernel's answer keeps growing past a sane bound.
fn resolve_groups(name: &str, gid: libc::gid_t) -> Vec<libc::gid_t> {
    let cname = match CString::new(name) {
        Ok(c) => c,
        Err(_) => return vec![gid],
    };

    let mut ngroups: libc::c_int = 16;
    loop {
        let mut groups = vec![0 as libc::gid_t; ngroups as usize];
        let rc = unsafe { libc::getgrouplist(cname.as_ptr(), gid, groups.as_mut_ptr(), &mut ngroups) };
        if rc >= 0 {
            groups.truncate(ngroups as usize);
            groups.sort_unstable();
            groups.dedup();
            return groups;
        }
        // rc == -1: `ngroups` was too small and has been updated to the required count. Bail out
        // rather than loop forever against a pathological NSS backend.
        if ngroups as usize > 4096 {
            return vec![gid];
        }
    }
}

impl User {
    /// Resolves the currently running process's effective user.
    pub fn from_self() -> Result<Self, UserError> {
        Self::from_uid(unsafe { libc::geteuid() })
    }

    /// Resolves a user by numeric id.
    pub fn from_uid(uid: libc::uid_t) -> Result<Self, UserError> {
        let msg = "Unable to resolve user";
        let mut passwd: libc::passwd = unsafe { core::mem::zeroed() };
        let mut buf = vec![0_i8; 16 * 1024];
        let mut result: *mut libc::passwd = core::ptr::null_mut();

        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut passwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };

        if rc != 0 {
            fail!(from "User::from_uid", with UserError::UnknownError(rc),
                "{} {} since an unknown error occurred ({:?}).", msg, uid, Errno(rc));
        }
        if result.is_null() {
            fail!(from "User::from_uid", with UserError::UserDoesNotExist,
                "{} {} since no such user exists.", msg, uid);
        }

        let name = unsafe { CStr::from_ptr(passwd.pw_name) }
            .to_string_lossy()
            .into_owned();
        let groups = resolve_groups(&name, passwd.pw_gid);
        Ok(User { uid, gid: passwd.pw_gid, name, groups })
    }

    /// Resolves a user by name.
    pub fn from_name(name: &str) -> Result<Self, UserError> {
        let msg = "Unable to resolve user";
        let cname = CString::new(name).map_err(|_| UserError::UserDoesNotExist)?;
        let mut passwd: libc::passwd = unsafe { core::mem::zeroed() };
        let mut buf = vec![0_i8; 16 * 1024];
        let mut result: *mut libc::passwd = core::ptr::null_mut();

        let rc = unsafe {
            libc::getpwnam_r(
                cname.as_ptr(),
                &mut passwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };

        if rc != 0 {
            fail!(from "User::from_name", with UserError::UnknownError(rc),
                "{} \"{}\" since an unknown error occurred ({:?}).", msg, name, Errno(rc));
        }
        if result.is_null() {
            fail!(from "User::from_name", with UserError::UserDoesNotExist,
                "{} \"{}\" since no such user exists.", msg, name);
        }

        let groups = resolve_groups(name, passwd.pw_gid);
        Ok(User {
            uid: passwd.pw_uid,
            gid: passwd.pw_gid,
            name: name.to_string(),
            groups,
        })
    }

    pub fn uid(&self) -> libc::uid_t {
        self.uid
    }

    /// The user's primary group id.
    pub fn gid(&self) -> libc::gid_t {
        self.gid
    }

    /// The user's full group membership (primary group included), resolved once via
    /// `getgrouplist` at construction time.
    pub fn groups(&self) -> &[libc::gid_t] {
        &self.groups
    }

    /// Whether `gid` is the user's primary group or one of their supplementary groups.
    pub fn is_in_group(&self, gid: libc::gid_t) -> bool {
        self.groups.contains(&gid)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_current_user() {
        let user = User::from_self().unwrap();
        assert_eq!(user.uid(), unsafe { libc::geteuid() });
    }

    #[test]
    fn round_trips_uid_and_name() {
        let user = User::from_self().unwrap();
        let by_name = User::from_name(user.name()).unwrap();
        assert_eq!(by_name.uid(), user.uid());
    }

    #[test]
    fn resolved_groups_always_include_the_primary_group() {
        let user = User::from_self().unwrap();
        assert!(user.is_in_group(user.gid()));
        assert!(user.groups().contains(&user.gid()));
    }
}
