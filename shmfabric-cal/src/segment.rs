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

//! A [`Segment`] is one mapped shared-memory object sized to hold a [`MemoryManager`] worth of
//! chunk pools, registered with the process-wide [`shmfabric_bb_elementary::relative_pointer`]
//! registry so any [`shmfabric_bb_elementary::relative_pointer::RelativePointer`] encoded against
//! its memory decodes correctly in every process that opens the same segment.

use shmfabric_bb_elementary::bump_allocator::RawBumpAllocator;
use shmfabric_bb_elementary::relative_pointer::{self, SegmentId};
use shmfabric_bb_posix::permission::Permission;
use shmfabric_bb_posix::shared_memory::{
    AccessMode, CreationMode, SharedMemoryCreationError, SharedMemoryObject, SharedMemoryObjectBuilder,
};

use crate::chunk::ChunkHeader;
use crate::memory_manager::{MemoryManager, MemoryManagerCreationError, MempoolConfig};

/// Failures from [`Segment::create`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum SegmentCreationError {
    SharedMemoryCreationFailed(SharedMemoryCreationError),
    InvalidMempoolConfiguration(MemoryManagerCreationError),
    NoFreeSegmentId,
}

impl From<SharedMemoryCreationError> for SegmentCreationError {
    fn from(e: SharedMemoryCreationError) -> Self {
        SegmentCreationError::SharedMemoryCreationFailed(e)
    }
}

impl From<MemoryManagerCreationError> for SegmentCreationError {
    fn from(e: MemoryManagerCreationError) -> Self {
        SegmentCreationError::InvalidMempoolConfiguration(e)
    }
}

/// One shared-memory-backed pool-of-pools. Owns the mapping for as long as it lives; dropping it
/// unregisters the segment and (if this handle created it) unlinks the backing shm object.
pub struct Segment {
    shm: SharedMemoryObject,
    segment_id: SegmentId,
    manager: MemoryManager,
    reader_group: Option<libc::gid_t>,
    writer_group: Option<libc::gid_t>,
}

/// Everything a [`crate::segment_manager::SegmentManager`] needs to decide whether a given user
/// may map a segment, and with what access — the logical reader/writer-group split this
/// workspace's [`Segment::create`] enforces physically via a single owning group plus file-mode
/// bits (see the module-level note on the POSIX-ACL substitution in `DESIGN.md`).
#[derive(Debug, Clone)]
pub struct SegmentMapping {
    pub shm_name: String,
    pub size: usize,
    pub is_writable: bool,
    pub segment_id: SegmentId,
}

impl Segment {
    /// Creates a fresh segment named `name`, sized to hold one [`MemoryManager`] configured with
    /// `mempool_config`. `reader_group`/`writer_group` are the logical groups allowed to map this
    /// segment read-only / read-write; only `writer_group` is physically enforced (as the file's
    /// owning group with group-write bits) since plain POSIX permissions cannot express two
    /// independent groups the way the original's ACL entries could.
    pub fn create(
        name: &str,
        mempool_config: &[MempoolConfig],
        reader_group: Option<libc::gid_t>,
        writer_group: Option<libc::gid_t>,
    ) -> Result<Self, SegmentCreationError> {
        let bump_allocator_reserve = core::mem::size_of::<usize>();
        let size = bump_allocator_reserve + MemoryManager::required_full_memory_size(mempool_config);

        let mut builder = SharedMemoryObjectBuilder::new(name)
            .size(size)
            .creation_mode(CreationMode::CreateExclusive)
            .permission(Permission::OWNER_ALL | Permission::GROUP_READ | Permission::GROUP_WRITE);
        if let Some(gid) = writer_group {
            builder = builder.group(gid);
        }
        let shm = builder.create()?;

        let base = shm.base_address();
        let allocator = RawBumpAllocator::new(base, shm.size());

        // Two distinct regions carved from the same mapping: `management_memory` holds every
        // pool's free-list head, next-links and counters (structural invariants every process
        // mapping this segment must see identically), `chunk_memory` holds only raw payload
        // bytes. Keeping them apart means a pool's bookkeeping is never mistaken for user data.
        let management_memory_size = MemoryManager::required_management_memory_size(mempool_config);
        let management_memory = allocator
            .allocate(
                management_memory_size.max(1),
                crate::mempool::MemPool::required_management_memory_align(),
            )
            .expect("segment sized to fit its own mempool configuration");

        let chunk_memory_size = MemoryManager::required_chunk_memory_size(mempool_config);
        let chunk_memory = allocator
            .allocate(chunk_memory_size.max(1), core::mem::align_of::<ChunkHeader>())
            .expect("segment sized to fit its own mempool configuration");

        let manager = unsafe { MemoryManager::new(mempool_config, management_memory, chunk_memory)? };

        let segment_id = relative_pointer::registry::register(base.as_ptr() as usize, shm.size() as u64)
            .map_err(|_| SegmentCreationError::NoFreeSegmentId)?;

        Ok(Segment {
            shm,
            segment_id,
            manager,
            reader_group,
            writer_group,
        })
    }

    /// Whether `user` belongs to either the reader or writer group, checking the user's full
    /// resolved group membership (primary plus supplementary groups via `getgrouplist`), not just
    /// their primary group.
    pub fn is_reachable_by(&self, user: &shmfabric_bb_posix::user::User) -> bool {
        self.reader_group.is_some_and(|gid| user.is_in_group(gid)) || self.is_writable_by(user)
    }

    /// Whether `user` belongs to the writer group, checking their full resolved group membership.
    pub fn is_writable_by(&self, user: &shmfabric_bb_posix::user::User) -> bool {
        self.writer_group.is_some_and(|gid| user.is_in_group(gid))
    }

    pub fn mapping_for(&self, user: &shmfabric_bb_posix::user::User) -> Option<SegmentMapping> {
        if !self.is_reachable_by(user) {
            return None;
        }
        Some(SegmentMapping {
            shm_name: self.shm.name().to_string(),
            size: self.shm.size(),
            is_writable: self.is_writable_by(user),
            segment_id: self.segment_id,
        })
    }

    /// Opens a segment another process already created, without attempting to reconstruct its
    /// [`MemoryManager`] — used by this workspace's publish-only scope purely to validate that a
    /// segment a `SegmentManager` is tracking is still reachable.
    pub fn open_existing(name: &str) -> Result<SharedMemoryObject, SharedMemoryCreationError> {
        SharedMemoryObjectBuilder::new(name).open_existing(AccessMode::ReadWrite)
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn memory_manager(&self) -> &MemoryManager {
        &self.manager
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        relative_pointer::registry::unregister(self.segment_id);
    }
}

impl core::fmt::Debug for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.shm.name())
            .field("segment_id", &self.segment_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("shmfabric-segment-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn creates_a_segment_and_hands_out_chunks() {
        let config = [MempoolConfig::new(64, 4), MempoolConfig::new(256, 2)];
        let segment = Segment::create(&unique_name("basic"), &config, None, None).unwrap();

        let settings = crate::chunk::ChunkSettings::new(32, 1, 0, 1).unwrap();
        let chunk = segment.memory_manager().get_chunk(&settings).unwrap();
        assert_eq!(chunk.header().payload_size(), 32);
    }

    #[test]
    fn registers_itself_with_the_relative_pointer_registry() {
        let config = [MempoolConfig::new(32, 2)];
        let segment = Segment::create(&unique_name("registers"), &config, None, None).unwrap();
        let id = segment.id();
        drop(segment);
        // Unregistered on drop: re-registering the same id from scratch must succeed.
        assert!(relative_pointer::registry::register_with_id(id, 0, 0));
        relative_pointer::registry::unregister(id);
    }

    #[test]
    fn rejects_unordered_mempool_configuration() {
        let config = [MempoolConfig::new(64, 2), MempoolConfig::new(32, 2)];
        let result = Segment::create(&unique_name("unordered"), &config, None, None);
        assert!(matches!(
            result,
            Err(SegmentCreationError::InvalidMempoolConfiguration(
                MemoryManagerCreationError::MempoolsNotOrderedByChunkSize
            ))
        ));
    }
}
