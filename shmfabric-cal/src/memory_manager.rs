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

//! Owns an ordered set of [`MemPool`]s, one per chunk-size tier, and routes `get_chunk` requests
//! to the smallest tier that can hold the request. A chunk is never promoted to a larger tier
//! when its own tier is exhausted — callers that need that behaviour configure multiple tiers of
//! the same practical size instead.

use core::ptr::NonNull;

use shmfabric_bb_elementary::math::align_up;
use shmfabric_log::fail;

use crate::chunk::{ChunkHeader, ChunkSettings};
use crate::mempool::{MemPool, MemPoolGetChunkError};

/// One chunk-size tier: `chunk_count` chunks of `chunk_size` bytes each.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MempoolConfig {
    pub chunk_size: u32,
    pub chunk_count: u32,
}

impl MempoolConfig {
    pub const fn new(chunk_size: u32, chunk_count: u32) -> Self {
        MempoolConfig { chunk_size, chunk_count }
    }
}

/// Failures from [`MemoryManager::new`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum MemoryManagerCreationError {
    /// The tier list was empty.
    NoMempoolsConfigured,
    /// Tiers must be listed in strictly increasing `chunk_size` order, with no duplicates.
    MempoolsNotOrderedByChunkSize,
}

/// Failures from [`MemoryManager::get_chunk`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum GetChunkError {
    /// This `MemoryManager` has no tiers at all.
    NoMempoolsAvailable,
    /// Every configured tier's `chunk_size` is smaller than the request.
    NoMempoolForRequestedChunkSize,
    /// The smallest tier that fits the request has no free chunks; the request is not promoted
    /// to a larger tier.
    MempoolOutOfChunks,
}

/// A reference-counted handle to a claimed chunk, loaned out of a [`MemoryManager`]. Cloning a
/// `SharedChunk` adds another holder of the same underlying chunk (e.g. one copy retained in a
/// publisher's history while another is pushed to a subscriber queue); the chunk is only returned
/// to its originating pool's free list once every clone has been dropped.
#[derive(Debug)]
pub struct SharedChunk<'mgr> {
    header: NonNull<ChunkHeader>,
    pool: &'mgr MemPool,
}

impl<'mgr> SharedChunk<'mgr> {
    fn new(header: NonNull<ChunkHeader>, pool: &'mgr MemPool) -> Self {
        SharedChunk { header, pool }
    }

    /// The chunk's header.
    pub fn header(&self) -> &ChunkHeader {
        unsafe { self.header.as_ref() }
    }

    /// Raw pointer to the chunk header, for encoding into a [`shmfabric_bb_elementary::relative_pointer::RelativePointer`].
    pub fn header_ptr(&self) -> NonNull<ChunkHeader> {
        self.header
    }

    /// The user payload, as bytes.
    pub fn payload(&self) -> &[u8] {
        let header = self.header();
        unsafe { core::slice::from_raw_parts(header.payload_ptr().as_ptr(), header.payload_size() as usize) }
    }

    /// The user payload, as mutable bytes.
    ///
    /// Only sound to call while this is the only outstanding holder of the chunk (i.e. before any
    /// [`Clone`] of it has been made, such as while a chunk is still being filled in by the
    /// publisher that loaned it) — once a chunk has been retained by more than one holder its
    /// payload must be treated as shared and immutable.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header = self.header();
        let ptr = header.payload_ptr();
        let len = header.payload_size() as usize;
        unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), len) }
    }

    /// The user header, as bytes, or `None` if this chunk was not configured with one.
    pub fn user_header(&self) -> Option<&[u8]> {
        let header = self.header();
        let ptr = header.user_header_ptr()?;
        Some(unsafe { core::slice::from_raw_parts(ptr.as_ptr(), header.user_header_size() as usize) })
    }

    /// The user header, as mutable bytes, or `None` if this chunk was not configured with one.
    pub fn user_header_mut(&mut self) -> Option<&mut [u8]> {
        let header = self.header();
        let ptr = header.user_header_ptr()?;
        let len = header.user_header_size() as usize;
        Some(unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }
}

impl Clone for SharedChunk<'_> {
    /// Adds another holder of the same underlying chunk; the chunk is returned to its pool only
    /// once every clone (the original included) has been dropped.
    fn clone(&self) -> Self {
        let raw = self.header.as_ptr() as *mut u8;
        self.pool
            .retain_chunk(unsafe { NonNull::new_unchecked(raw) })
            .expect("a SharedChunk always addresses a chunk its own pool handed out");
        SharedChunk { header: self.header, pool: self.pool }
    }
}

impl Drop for SharedChunk<'_> {
    fn drop(&mut self) {
        let raw = self.header.as_ptr() as *mut u8;
        let _ = self.pool.free_chunk(unsafe { NonNull::new_unchecked(raw) });
    }
}

/// Ordered collection of fixed-chunk-size pools backing a [`crate::segment::Segment`].
#[derive(Debug)]
pub struct MemoryManager {
    pools: Vec<MemPool>,
}

impl MemoryManager {
    /// Bytes of management-region bookkeeping (each tier's free-list head, next-links and
    /// counters) a [`MemoryManager`] configured with `config` will need. This is memory that must
    /// live inside the same shared mapping as the chunk memory itself — every process that maps
    /// the segment shares one copy of these structural invariants, rather than each process
    /// reconstructing its own.
    pub fn required_management_memory_size(config: &[MempoolConfig]) -> usize {
        config
            .iter()
            .map(|c| align_up(MemPool::required_management_memory_size(c.chunk_count), MemPool::required_management_memory_align()))
            .sum()
    }

    /// Bytes of raw chunk storage a [`MemoryManager`] configured with `config` will need.
    pub fn required_chunk_memory_size(config: &[MempoolConfig]) -> usize {
        config
            .iter()
            .map(|c| {
                align_up(
                    MemPool::required_chunk_memory_size(c.chunk_size, c.chunk_count),
                    core::mem::align_of::<ChunkHeader>(),
                )
            })
            .sum()
    }

    /// Total bytes a [`MemoryManager`] configured with `config` will need: management plus
    /// chunk memory.
    pub fn required_full_memory_size(config: &[MempoolConfig]) -> usize {
        Self::required_management_memory_size(config) + Self::required_chunk_memory_size(config)
    }

    fn validate(config: &[MempoolConfig]) -> Result<(), MemoryManagerCreationError> {
        let msg = "Unable to create memory manager";
        if config.is_empty() {
            fail!(from "MemoryManager::new", with MemoryManagerCreationError::NoMempoolsConfigured,
                "{} since no mempool tiers were configured.", msg);
        }
        for window in config.windows(2) {
            if window[0].chunk_size >= window[1].chunk_size {
                fail!(from "MemoryManager::new", with MemoryManagerCreationError::MempoolsNotOrderedByChunkSize,
                    "{} since tier chunk sizes must be strictly increasing ({} is not less than {}).",
                    msg, window[1].chunk_size, window[0].chunk_size);
            }
        }
        Ok(())
    }

    /// Builds a `MemoryManager` with one [`MemPool`] per entry of `config`, each pool's chunk
    /// storage carved in order out of `chunk_memory` and its free-list bookkeeping carved in order
    /// out of `management_memory` — two distinct regions, since the former holds user payload
    /// bytes and the latter holds structural invariants (free lists, reference counts) that must
    /// be visible to every process mapping the segment.
    ///
    /// # Safety
    ///
    /// `management_memory` must point to at least
    /// [`Self::required_management_memory_size`]`(config)` writable bytes, aligned to at least
    /// [`MemPool::required_management_memory_align`]. `chunk_memory` must point to at least
    /// [`Self::required_chunk_memory_size`]`(config)` writable, exclusively-owned bytes, aligned
    /// to at least `align_of::<ChunkHeader>()`.
    pub unsafe fn new(
        config: &[MempoolConfig],
        management_memory: NonNull<u8>,
        chunk_memory: NonNull<u8>,
    ) -> Result<Self, MemoryManagerCreationError> {
        Self::validate(config)?;

        let mut pools = Vec::with_capacity(config.len());
        let mut management_cursor = 0usize;
        let mut chunk_cursor = 0usize;
        for tier in config {
            let tier_management =
                unsafe { NonNull::new_unchecked(management_memory.as_ptr().add(management_cursor)) };
            let tier_chunks = unsafe { NonNull::new_unchecked(chunk_memory.as_ptr().add(chunk_cursor)) };
            pools.push(unsafe { MemPool::new(tier_management, tier_chunks, tier.chunk_size, tier.chunk_count) });

            management_cursor += align_up(
                MemPool::required_management_memory_size(tier.chunk_count),
                MemPool::required_management_memory_align(),
            );
            chunk_cursor += align_up(
                MemPool::required_chunk_memory_size(tier.chunk_size, tier.chunk_count),
                core::mem::align_of::<ChunkHeader>(),
            );
        }

        Ok(MemoryManager { pools })
    }

    /// Loans a chunk from the smallest tier whose `chunk_size` is at least
    /// `settings.required_chunk_size()`, and writes the chunk's header in place.
    pub fn get_chunk(&self, settings: &ChunkSettings) -> Result<SharedChunk<'_>, GetChunkError> {
        if self.pools.is_empty() {
            return Err(GetChunkError::NoMempoolsAvailable);
        }

        let required = settings.required_chunk_size();
        let pool = self
            .pools
            .iter()
            .find(|pool| pool.chunk_size() >= required)
            .ok_or(GetChunkError::NoMempoolForRequestedChunkSize)?;

        let raw = pool
            .get_chunk()
            .map_err(|MemPoolGetChunkError::MempoolOutOfChunks| GetChunkError::MempoolOutOfChunks)?;

        let header = unsafe { ChunkHeader::write_at(raw, settings) };
        Ok(SharedChunk::new(header, pool))
    }

    /// Number of configured tiers.
    pub fn mempool_count(&self) -> usize {
        self.pools.len()
    }

    /// Read-only access to a tier by index, for diagnostics and tests.
    pub fn mempool(&self, index: usize) -> Option<&MemPool> {
        self.pools.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_manager(config: &[MempoolConfig]) -> (Vec<u8>, Vec<u8>, MemoryManager) {
        let mut management = vec![0u8; MemoryManager::required_management_memory_size(config)];
        let mut chunks = vec![0u8; MemoryManager::required_chunk_memory_size(config)];
        let management_start = NonNull::new(management.as_mut_ptr()).unwrap();
        let chunk_start = NonNull::new(chunks.as_mut_ptr()).unwrap();
        let manager = unsafe { MemoryManager::new(config, management_start, chunk_start) }.unwrap();
        (management, chunks, manager)
    }

    #[test]
    fn rejects_empty_configuration() {
        assert_eq!(
            unsafe { MemoryManager::new(&[], NonNull::dangling(), NonNull::dangling()) },
            Err(MemoryManagerCreationError::NoMempoolsConfigured)
        );
    }

    #[test]
    fn rejects_tiers_not_strictly_increasing() {
        let config = [MempoolConfig::new(64, 4), MempoolConfig::new(64, 4)];
        assert_eq!(
            unsafe { MemoryManager::new(&config, NonNull::dangling(), NonNull::dangling()) },
            Err(MemoryManagerCreationError::MempoolsNotOrderedByChunkSize)
        );
    }

    #[test]
    fn routes_to_smallest_fitting_tier_without_spilling() {
        // spec scenario 4: {32x100, 64x100, 128x100, 256x100}; draining the 64-byte pool must
        // not spill into the 128-byte pool.
        let config = [
            MempoolConfig::new(32, 100),
            MempoolConfig::new(64, 100),
            MempoolConfig::new(128, 100),
            MempoolConfig::new(256, 100),
        ];
        let (_management, _chunks, manager) = new_manager(&config);
        let settings = ChunkSettings::new(40, 1, 0, 1).unwrap();
        assert_eq!(
            settings.required_chunk_size() as usize,
            core::mem::size_of::<ChunkHeader>() + 40
        );

        let mut held = Vec::new();
        for _ in 0..100 {
            held.push(manager.get_chunk(&settings).expect("64-byte tier has room"));
        }
        assert_eq!(
            manager.get_chunk(&settings).err(),
            Some(GetChunkError::MempoolOutOfChunks)
        );
        assert_eq!(manager.mempool(2).unwrap().used_count(), 0);
    }

    #[test]
    fn cloning_a_shared_chunk_keeps_it_alive_until_every_clone_is_dropped() {
        let config = [MempoolConfig::new(64, 1)];
        let (_management, _chunks, manager) = new_manager(&config);
        let settings = ChunkSettings::new(16, 1, 0, 1).unwrap();

        let first = manager.get_chunk(&settings).unwrap();
        let second = first.clone();
        assert_eq!(manager.mempool(0).unwrap().used_count(), 1);

        drop(first);
        assert_eq!(manager.mempool(0).unwrap().used_count(), 1);
        assert_eq!(
            manager.get_chunk(&settings).err(),
            Some(GetChunkError::MempoolOutOfChunks)
        );

        drop(second);
        assert_eq!(manager.mempool(0).unwrap().used_count(), 0);
        assert!(manager.get_chunk(&settings).is_ok());
    }

    #[test]
    fn rejects_requests_too_large_for_any_tier() {
        let config = [MempoolConfig::new(32, 4)];
        let (_management, _chunks, manager) = new_manager(&config);
        let settings = ChunkSettings::new(1024, 1, 0, 1).unwrap();
        assert_eq!(
            manager.get_chunk(&settings).err(),
            Some(GetChunkError::NoMempoolForRequestedChunkSize)
        );
    }

    #[test]
    fn dropping_a_shared_chunk_returns_it_to_its_pool() {
        let config = [MempoolConfig::new(64, 2)];
        let (_management, _chunks, manager) = new_manager(&config);
        let settings = ChunkSettings::new(16, 1, 0, 1).unwrap();
        {
            let _chunk = manager.get_chunk(&settings).unwrap();
            assert_eq!(manager.mempool(0).unwrap().used_count(), 1);
        }
        assert_eq!(manager.mempool(0).unwrap().used_count(), 0);
    }
}
