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

//! Owns the set of [`Segment`]s a process has created, in creation order, so access queries for
//! a given user ("which segments can they see, which one can they write to") have a
//! deterministic, documented tie-break.

use shmfabric_bb_elementary::relative_pointer::SegmentId;
use shmfabric_bb_posix::user::User;

use crate::memory_manager::{MemoryManager, MempoolConfig};
use crate::segment::{Segment, SegmentCreationError, SegmentMapping};

/// Failures from [`SegmentManager::create_segment`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum SegmentManagerError {
    SegmentAlreadyExists,
    SegmentCreationFailed(SegmentCreationError),
}

impl From<SegmentCreationError> for SegmentManagerError {
    fn from(e: SegmentCreationError) -> Self {
        SegmentManagerError::SegmentCreationFailed(e)
    }
}

/// A process-local, creation-ordered table of owned [`Segment`]s.
#[derive(Default)]
pub struct SegmentManager {
    segments: Vec<Segment>,
}

impl SegmentManager {
    pub fn new() -> Self {
        SegmentManager { segments: Vec::new() }
    }

    /// Creates and tracks a new segment named `name`. Fails if this manager already tracks a
    /// segment under that name.
    pub fn create_segment(
        &mut self,
        name: &str,
        mempool_config: &[MempoolConfig],
        reader_group: Option<libc::gid_t>,
        writer_group: Option<libc::gid_t>,
    ) -> Result<&Segment, SegmentManagerError> {
        if self.segments.iter().any(|s| s.name() == name) {
            return Err(SegmentManagerError::SegmentAlreadyExists);
        }
        let segment = Segment::create(name, mempool_config, reader_group, writer_group)?;
        self.segments.push(segment);
        Ok(self.segments.last().expect("just pushed"))
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Drops and unregisters a tracked segment, returning `true` if one was found.
    pub fn remove_segment(&mut self, name: &str) -> bool {
        let Some(index) = self.segments.iter().position(|s| s.name() == name) else {
            return false;
        };
        self.segments.remove(index);
        true
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// All segment mappings `user` may reach, in the order the segments were created.
    pub fn segment_mappings_for(&self, user: &User) -> Vec<SegmentMapping> {
        self.segments.iter().filter_map(|s| s.mapping_for(user)).collect()
    }

    /// The first segment (in creation order) `user` may write to, along with its
    /// [`MemoryManager`]. At most one result, by policy: a user should belong to at most one
    /// writer group among tracked segments, but if more than one matches, creation order wins.
    pub fn segment_with_write_access_for(&self, user: &User) -> Option<(&MemoryManager, SegmentId)> {
        self.segments
            .iter()
            .find(|s| s.is_writable_by(user))
            .map(|s| (s.memory_manager(), s.id()))
    }

    /// Bytes of pure bookkeeping a [`SegmentManager`] with these tiers across `segment_count`
    /// identically-configured segments would need.
    pub fn required_management_memory_size(config: &[MempoolConfig], segment_count: usize) -> usize {
        MemoryManager::required_management_memory_size(config) * segment_count
    }

    /// Bytes of chunk storage a [`SegmentManager`] with these tiers across `segment_count`
    /// identically-configured segments would need.
    pub fn required_chunk_memory_size(config: &[MempoolConfig], segment_count: usize) -> usize {
        MemoryManager::required_chunk_memory_size(config) * segment_count
    }

    /// Total bytes, management plus chunk storage.
    pub fn required_full_memory_size(config: &[MempoolConfig], segment_count: usize) -> usize {
        Self::required_management_memory_size(config, segment_count)
            + Self::required_chunk_memory_size(config, segment_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmfabric_bb_posix::user::User;

    fn unique_name(tag: &str) -> String {
        format!("shmfabric-segment-manager-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn tracks_created_segments_by_name() {
        let mut manager = SegmentManager::new();
        let name = unique_name("tracked");
        let config = [MempoolConfig::new(32, 4)];
        manager.create_segment(&name, &config, None, None).unwrap();
        assert_eq!(manager.segment_count(), 1);
        assert!(manager.segment(&name).is_some());
    }

    #[test]
    fn rejects_duplicate_segment_names() {
        let mut manager = SegmentManager::new();
        let name = unique_name("duplicate");
        let config = [MempoolConfig::new(32, 4)];
        manager.create_segment(&name, &config, None, None).unwrap();
        assert_eq!(
            manager.create_segment(&name, &config, None, None).unwrap_err(),
            SegmentManagerError::SegmentAlreadyExists
        );
    }

    #[test]
    fn remove_segment_drops_and_forgets_it() {
        let mut manager = SegmentManager::new();
        let name = unique_name("removable");
        let config = [MempoolConfig::new(32, 4)];
        manager.create_segment(&name, &config, None, None).unwrap();
        assert!(manager.remove_segment(&name));
        assert_eq!(manager.segment_count(), 0);
        assert!(!manager.remove_segment(&name));
    }

    #[test]
    fn grants_write_access_only_to_the_writer_group() {
        let mut manager = SegmentManager::new();
        let name = unique_name("writable");
        let config = [MempoolConfig::new(32, 4)];
        let me = User::from_self().unwrap();
        manager
            .create_segment(&name, &config, None, Some(me.gid()))
            .unwrap();

        let (_manager, _id) = manager
            .segment_with_write_access_for(&me)
            .expect("current user's primary group was configured as the writer group");
        let mappings = manager.segment_mappings_for(&me);
        assert_eq!(mappings.len(), 1);
        assert!(mappings[0].is_writable);
    }

    #[test]
    fn no_mapping_for_unrelated_user_group() {
        let mut manager = SegmentManager::new();
        let name = unique_name("unrelated");
        let config = [MempoolConfig::new(32, 4)];
        manager.create_segment(&name, &config, Some(999_999), Some(999_998)).unwrap();

        let me = User::from_self().unwrap();
        assert!(manager.segment_mappings_for(&me).is_empty());
        assert!(manager.segment_with_write_access_for(&me).is_none());
    }
}
