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

//! A pool of fixed-size chunks carved out of a single contiguous memory block, with a lock-free
//! LIFO free list: the stack head is a tagged `(generation, index)` pair in one `AtomicU64`,
//! guarding against the ABA problem across concurrent `free_chunk` callers, and each free slot's
//! "next" link is stored in the slot's own bookkeeping array rather than in the chunk memory
//! itself so a freed chunk's bytes are never touched by pool bookkeeping.
//!
//! The free-list head, the next-link array and the use/min-free counters all live in a
//! caller-supplied *management* memory region rather than process-local heap memory: every
//! structural invariant a second process sharing the same segment must observe (who holds which
//! chunk, how many are free) is stored inside the shared mapping itself, so every process that
//! maps the segment sees the same free list instead of independently reconstructing its own.
//!
//! `get_chunk` is documented (spec-unchanged) as single-producer-per-pool: the owning port
//! serialises its own allocations. `free_chunk` is safe to call concurrently from any thread,
//! since a chunk's last holder may run on a different thread than the one that allocated it.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use shmfabric_log::fail;

const SENTINEL: u32 = u32::MAX;

fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

fn unpack(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// Failures from [`MemPool::get_chunk`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum MemPoolGetChunkError {
    /// Every chunk in this pool is currently on loan.
    MempoolOutOfChunks,
}

/// Failures from [`MemPool::free_chunk`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum MemPoolFreeChunkError {
    /// The pointer does not fall within this pool's backing memory, or is not aligned to a
    /// chunk boundary.
    ChunkDoesNotBelongToThisMempool,
}

/// Layout of a pool's management region: `free_list_head: AtomicU64`, `used_count: AtomicU32`,
/// `min_free_count: AtomicU32`, `chunk_count` `AtomicU32` next-links, then `chunk_count`
/// `AtomicU32` reference counts — one per chunk slot, so a chunk loaned out more than once (a
/// `SharedChunk` handed to more than one holder) is only returned to the free list once every
/// holder has released it.
struct ManagementLayout {
    free_list_head: NonNull<AtomicU64>,
    used_count: NonNull<AtomicU32>,
    min_free_count: NonNull<AtomicU32>,
    next_free: NonNull<AtomicU32>,
    ref_counts: NonNull<AtomicU32>,
}

impl ManagementLayout {
    const USED_COUNT_OFFSET: usize = size_of::<AtomicU64>();
    const MIN_FREE_COUNT_OFFSET: usize = Self::USED_COUNT_OFFSET + size_of::<AtomicU32>();
    const NEXT_FREE_OFFSET: usize = Self::MIN_FREE_COUNT_OFFSET + size_of::<AtomicU32>();

    fn ref_counts_offset(chunk_count: u32) -> usize {
        Self::NEXT_FREE_OFFSET + chunk_count as usize * size_of::<AtomicU32>()
    }

    unsafe fn at(management_memory: NonNull<u8>, chunk_count: u32) -> Self {
        let base = management_memory.as_ptr();
        ManagementLayout {
            free_list_head: NonNull::new_unchecked(base as *mut AtomicU64),
            used_count: NonNull::new_unchecked(base.add(Self::USED_COUNT_OFFSET) as *mut AtomicU32),
            min_free_count: NonNull::new_unchecked(base.add(Self::MIN_FREE_COUNT_OFFSET) as *mut AtomicU32),
            next_free: NonNull::new_unchecked(base.add(Self::NEXT_FREE_OFFSET) as *mut AtomicU32),
            ref_counts: NonNull::new_unchecked(base.add(Self::ref_counts_offset(chunk_count)) as *mut AtomicU32),
        }
    }

    fn size_for(chunk_count: u32) -> usize {
        Self::ref_counts_offset(chunk_count) + chunk_count as usize * size_of::<AtomicU32>()
    }

    fn next_free_slot(&self, index: u32) -> &AtomicU32 {
        unsafe { &*self.next_free.as_ptr().add(index as usize) }
    }

    fn ref_count_slot(&self, index: u32) -> &AtomicU32 {
        unsafe { &*self.ref_counts.as_ptr().add(index as usize) }
    }

    fn head(&self) -> &AtomicU64 {
        unsafe { self.free_list_head.as_ref() }
    }

    fn used(&self) -> &AtomicU32 {
        unsafe { self.used_count.as_ref() }
    }

    fn min_free(&self) -> &AtomicU32 {
        unsafe { self.min_free_count.as_ref() }
    }
}

/// A fixed-size-chunk pool. Every chunk handed out by [`MemPool::get_chunk`] is exactly
/// `chunk_size()` bytes, aligned to at least `align_of::<crate::chunk::ChunkHeader>()`.
#[derive(Debug)]
pub struct MemPool {
    start: NonNull<u8>,
    chunk_size: u32,
    chunk_count: u32,
    management: ManagementLayoutHandle,
}

// The management region is opaque to Debug; render it as its address for diagnostics.
#[derive(Debug)]
struct ManagementLayoutHandle(NonNull<u8>);

// SAFETY: `MemPool` only ever touches its own atomics (addressed through `management`) and the raw
// `start` pointer via disjoint, index-addressed slots; the backing memory it was constructed over
// is expected to already be `Send`/`Sync` (it lives in a shared-memory segment).
unsafe impl Send for MemPool {}
unsafe impl Sync for MemPool {}

impl MemPool {
    /// Bytes of management-region bookkeeping (free-list head, next-links, counters) a pool of
    /// `chunk_count` chunks needs. Must be carved from the shared mapping alongside
    /// [`Self::required_chunk_memory_size`] — this pool's structural invariants live there, not in
    /// process-local heap memory.
    pub fn required_management_memory_size(chunk_count: u32) -> usize {
        ManagementLayout::size_for(chunk_count)
    }

    /// Alignment the management region passed to [`Self::new`] must satisfy.
    pub fn required_management_memory_align() -> usize {
        align_of::<AtomicU64>()
    }

    /// Carves a pool of `chunk_count` chunks of `chunk_size` bytes each out of the chunk memory
    /// starting at `chunk_memory`, with its free-list bookkeeping placed in `management_memory`.
    /// Both regions must remain valid and exclusively owned by this pool for its entire lifetime
    /// (though, being inside a shared-memory segment, other processes may concurrently operate on
    /// the same bytes through their own `MemPool` bound to the same segment).
    ///
    /// # Safety
    ///
    /// `management_memory` must point to at least
    /// [`Self::required_management_memory_size`]`(chunk_count)` writable bytes, aligned to at
    /// least [`Self::required_management_memory_align`]. `chunk_memory` must point to at least
    /// `chunk_size as usize * chunk_count as usize` writable, exclusively-owned bytes, aligned to
    /// at least `align_of::<crate::chunk::ChunkHeader>()`.
    pub unsafe fn new(
        management_memory: NonNull<u8>,
        chunk_memory: NonNull<u8>,
        chunk_size: u32,
        chunk_count: u32,
    ) -> Self {
        let layout = ManagementLayout::at(management_memory, chunk_count);

        for i in 0..chunk_count {
            let next = if i + 1 == chunk_count { SENTINEL } else { i + 1 };
            layout.next_free.as_ptr().add(i as usize).write(AtomicU32::new(next));
            layout.ref_counts.as_ptr().add(i as usize).write(AtomicU32::new(0));
        }
        let head = if chunk_count == 0 { SENTINEL } else { 0 };
        layout.free_list_head.as_ptr().write(AtomicU64::new(pack(0, head)));
        layout.used_count.as_ptr().write(AtomicU32::new(0));
        layout.min_free_count.as_ptr().write(AtomicU32::new(chunk_count));

        MemPool {
            start: chunk_memory,
            chunk_size,
            chunk_count,
            management: ManagementLayoutHandle(management_memory),
        }
    }

    fn layout(&self) -> ManagementLayout {
        unsafe { ManagementLayout::at(self.management.0, self.chunk_count) }
    }

    /// Size, in bytes, of every chunk handed out by this pool.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Total number of chunks this pool was constructed with.
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Number of chunks currently on loan.
    pub fn used_count(&self) -> u32 {
        self.layout().used().load(Ordering::Relaxed)
    }

    /// Low-water mark: the fewest free chunks this pool has ever had, observed so far.
    pub fn min_free_count(&self) -> u32 {
        self.layout().min_free().load(Ordering::Relaxed)
    }

    fn slot_ptr(&self, index: u32) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(index as usize * self.chunk_size as usize)) }
    }

    fn index_of(&self, chunk: NonNull<u8>) -> Result<u32, MemPoolFreeChunkError> {
        let base = self.start.as_ptr() as usize;
        let addr = chunk.as_ptr() as usize;
        if addr < base {
            fail!(from self, with MemPoolFreeChunkError::ChunkDoesNotBelongToThisMempool,
                "Unable to look up chunk since its address precedes this mempool's backing memory.");
        }
        let byte_offset = addr - base;
        let stride = self.chunk_size as usize;
        if stride == 0 || byte_offset % stride != 0 {
            fail!(from self, with MemPoolFreeChunkError::ChunkDoesNotBelongToThisMempool,
                "Unable to look up chunk since its offset is not aligned to this mempool's chunk stride.");
        }
        let index = (byte_offset / stride) as u32;
        if index >= self.chunk_count {
            fail!(from self, with MemPoolFreeChunkError::ChunkDoesNotBelongToThisMempool,
                "Unable to look up chunk since its index {} is out of range for {} chunks.",
                index, self.chunk_count);
        }
        Ok(index)
    }

    fn return_to_free_list(&self, index: u32) {
        let layout = self.layout();
        loop {
            let current = layout.head().load(Ordering::Acquire);
            let (tag, top) = unpack(current);
            layout.next_free_slot(index).store(top, Ordering::Relaxed);
            let updated = pack(tag.wrapping_add(1), index);
            if layout
                .head()
                .compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                layout.used().fetch_sub(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Pops a free chunk off the pool, returning a pointer to its first byte. The chunk starts
    /// with a reference count of one held.
    pub fn get_chunk(&self) -> Result<NonNull<u8>, MemPoolGetChunkError> {
        let layout = self.layout();
        loop {
            let current = layout.head().load(Ordering::Acquire);
            let (tag, top) = unpack(current);
            if top == SENTINEL {
                fail!(from self, with MemPoolGetChunkError::MempoolOutOfChunks,
                    "Unable to get a chunk from the mempool since all {} chunks are in use.",
                    self.chunk_count);
            }
            let next = layout.next_free_slot(top).load(Ordering::Relaxed);
            let updated = pack(tag.wrapping_add(1), next);
            if layout
                .head()
                .compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let used = layout.used().fetch_add(1, Ordering::Relaxed) + 1;
                let free_now = self.chunk_count - used;
                layout.min_free().fetch_min(free_now, Ordering::Relaxed);
                layout.ref_count_slot(top).store(1, Ordering::Release);
                return Ok(self.slot_ptr(top));
            }
        }
    }

    /// Adds one more reference to a chunk currently on loan, for a second holder of the same
    /// [`crate::memory_manager::SharedChunk`] (e.g. a clone pushed onto a publisher's history in
    /// addition to the one delivered to a subscriber queue).
    pub fn retain_chunk(&self, chunk: NonNull<u8>) -> Result<(), MemPoolFreeChunkError> {
        let index = self.index_of(chunk)?;
        self.layout().ref_count_slot(index).fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Releases one reference to a chunk previously handed out by [`Self::get_chunk`] or retained
    /// via [`Self::retain_chunk`]. Only once every holder has released it is the chunk returned to
    /// the pool's free list.
    pub fn free_chunk(&self, chunk: NonNull<u8>) -> Result<(), MemPoolFreeChunkError> {
        let index = self.index_of(chunk)?;
        let previous = self.layout().ref_count_slot(index).fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.return_to_free_list(index);
        }
        Ok(())
    }

    /// Bytes of backing memory this pool manages, including bookkeeping-free raw chunk storage.
    pub fn required_chunk_memory_size(chunk_size: u32, chunk_count: u32) -> usize {
        chunk_size as usize * chunk_count as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn new_pool(chunk_size: u32, chunk_count: u32) -> (Vec<u8>, Vec<u8>, MemPool) {
        let mut management = vec![0u8; MemPool::required_management_memory_size(chunk_count)];
        let mut chunks = vec![0u8; chunk_size as usize * chunk_count as usize];
        let management_ptr = NonNull::new(management.as_mut_ptr()).unwrap();
        let chunk_ptr = NonNull::new(chunks.as_mut_ptr()).unwrap();
        let pool = unsafe { MemPool::new(management_ptr, chunk_ptr, chunk_size, chunk_count) };
        (management, chunks, pool)
    }

    #[test]
    fn exhausts_after_chunk_count_allocations() {
        // spec scenario 3: one pool of 128 x 100, 100 succeed, 101st fails.
        let (_management, _chunks, pool) = new_pool(128, 100);
        let mut chunks = Vec::new();
        for _ in 0..100 {
            chunks.push(pool.get_chunk().expect("should have room"));
        }
        assert_eq!(
            pool.get_chunk(),
            Err(MemPoolGetChunkError::MempoolOutOfChunks)
        );
        assert_eq!(pool.used_count(), 100);

        pool.free_chunk(chunks.pop().unwrap()).unwrap();
        assert_eq!(pool.used_count(), 99);
        assert!(pool.get_chunk().is_ok());
    }

    #[test]
    fn min_free_count_tracks_low_water_mark() {
        let (_management, _chunks, pool) = new_pool(64, 4);
        assert_eq!(pool.min_free_count(), 4);
        let a = pool.get_chunk().unwrap();
        let b = pool.get_chunk().unwrap();
        assert_eq!(pool.min_free_count(), 2);
        pool.free_chunk(a).unwrap();
        pool.free_chunk(b).unwrap();
        // min_free_count never recovers once it has dropped.
        assert_eq!(pool.min_free_count(), 2);
    }

    #[test]
    fn free_chunk_rejects_pointer_outside_pool() {
        let (_management, _chunks, pool) = new_pool(32, 4);
        let mut other = vec![0u8; 32];
        let foreign = NonNull::new(other.as_mut_ptr()).unwrap();
        assert_eq!(
            pool.free_chunk(foreign),
            Err(MemPoolFreeChunkError::ChunkDoesNotBelongToThisMempool)
        );
    }

    #[test]
    fn concurrent_free_chunk_never_loses_or_duplicates_a_slot() {
        let (_management, _chunks, pool) = new_pool(16, 64);
        let mut chunks = Vec::new();
        for _ in 0..64 {
            chunks.push(pool.get_chunk().unwrap().as_ptr() as usize);
        }
        let pool = Arc::new(pool);

        thread::scope(|scope| {
            for chunk in chunks {
                let pool = Arc::clone(&pool);
                scope.spawn(move || {
                    pool.free_chunk(NonNull::new(chunk as *mut u8).unwrap()).unwrap();
                });
            }
        });

        assert_eq!(pool.used_count(), 0);
        for _ in 0..64 {
            pool.get_chunk().expect("every slot should be free exactly once");
        }
        assert_eq!(
            pool.get_chunk(),
            Err(MemPoolGetChunkError::MempoolOutOfChunks)
        );
    }

    #[test]
    fn a_chunk_retained_twice_is_not_freed_until_both_releases_happen() {
        let (_management, _chunks, pool) = new_pool(32, 1);
        let chunk = pool.get_chunk().unwrap();
        pool.retain_chunk(chunk).unwrap();
        assert_eq!(pool.used_count(), 1);

        pool.free_chunk(chunk).unwrap();
        // still retained once more: must not have gone back to the free list yet.
        assert_eq!(pool.used_count(), 1);
        assert_eq!(
            pool.get_chunk(),
            Err(MemPoolGetChunkError::MempoolOutOfChunks)
        );

        pool.free_chunk(chunk).unwrap();
        assert_eq!(pool.used_count(), 0);
        assert!(pool.get_chunk().is_ok());
    }

    #[test]
    fn two_handles_over_the_same_management_bytes_share_one_free_list() {
        // Simulates two processes mapping the same segment: each builds its own `MemPool` value
        // over the same underlying management/chunk bytes and must observe the other's claims.
        let chunk_count = 4;
        let mut management = vec![0u8; MemPool::required_management_memory_size(chunk_count)];
        let mut chunks = vec![0u8; 32 * chunk_count as usize];
        let management_ptr = NonNull::new(management.as_mut_ptr()).unwrap();
        let chunk_ptr = NonNull::new(chunks.as_mut_ptr()).unwrap();

        let first = unsafe { MemPool::new(management_ptr, chunk_ptr, 32, chunk_count) };
        let second = unsafe {
            MemPool {
                start: chunk_ptr,
                chunk_size: 32,
                chunk_count,
                management: ManagementLayoutHandle(management_ptr),
            }
        };

        let a = first.get_chunk().unwrap();
        assert_eq!(second.used_count(), 1);
        let b = second.get_chunk().unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(first.used_count(), 2);
    }
}
