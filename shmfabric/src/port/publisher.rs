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

//! A [`PublisherPort`] loans chunks out of a segment's [`MemoryManager`], delivers them to every
//! connected subscriber's queue while offered, and retains a bounded history regardless of offer
//! state so a late consumer can still be given the most recent values.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use shmfabric_bb_elementary::relative_pointer::RelativePointer;
use shmfabric_cal::chunk::{ChunkHeader, ChunkSettings, ChunkSettingsError};
use shmfabric_cal::memory_manager::{GetChunkError, MemoryManager, SharedChunk};

use crate::port::subscriber_queue::SubscriberQueue;

/// Failures from [`PublisherPort::try_allocate_chunk`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum AllocationError {
    InvalidChunkSettings(ChunkSettingsError),
    OutOfMemory(GetChunkError),
}

impl From<ChunkSettingsError> for AllocationError {
    fn from(e: ChunkSettingsError) -> Self {
        AllocationError::InvalidChunkSettings(e)
    }
}

impl From<GetChunkError> for AllocationError {
    fn from(e: GetChunkError) -> Self {
        AllocationError::OutOfMemory(e)
    }
}

/// A publish-only port bound to one segment's [`MemoryManager`] for the lifetime of `'seg`.
///
/// `offering_requested` follows the same relaxed-ordering rationale as the original: it is a
/// liveness hint other processes poll, not a value anything synchronizes around.
pub struct PublisherPort<'seg> {
    memory: &'seg MemoryManager,
    offering_requested: AtomicBool,
    subscriber_queues: Mutex<Vec<Arc<SubscriberQueue<'seg>>>>,
    history: Mutex<VecDeque<SharedChunk<'seg>>>,
    history_capacity: usize,
}

impl<'seg> PublisherPort<'seg> {
    /// Builds a port over `memory`, retaining up to `history_capacity` previously sent chunks
    /// (0 is treated as 1: a port always keeps at least the most recent chunk it has sent).
    pub fn new(memory: &'seg MemoryManager, history_capacity: usize) -> Self {
        PublisherPort {
            memory,
            offering_requested: AtomicBool::new(false),
            subscriber_queues: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity.max(1))),
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn offer(&self) {
        self.offering_requested.store(true, Ordering::Relaxed);
    }

    pub fn stop_offer(&self) {
        self.offering_requested.store(false, Ordering::Relaxed);
    }

    pub fn is_offered(&self) -> bool {
        self.offering_requested.load(Ordering::Relaxed)
    }

    /// Whether any subscriber queue is currently connected.
    pub fn has_subscribers(&self) -> bool {
        !self.queues().is_empty()
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, Vec<Arc<SubscriberQueue<'seg>>>> {
        self.subscriber_queues.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Connects a new subscriber, returning the bounded queue this port will push every chunk it
    /// sends while offered into. The caller (a subscriber-side reader, out of this workspace's
    /// scope) decodes entries via [`RelativePointer::decode`] against its own mapping of the
    /// segment.
    pub fn connect_subscriber(&self, queue_capacity: usize) -> Arc<SubscriberQueue<'seg>> {
        let queue = Arc::new(SubscriberQueue::new(queue_capacity));
        self.queues().push(Arc::clone(&queue));
        queue
    }

    /// Disconnects a previously connected subscriber queue, identified by pointer identity.
    pub fn disconnect_subscriber(&self, queue: &Arc<SubscriberQueue<'seg>>) {
        self.queues().retain(|candidate| !Arc::ptr_eq(candidate, queue));
    }

    /// Loans a chunk sized and aligned per the given payload/user-header recipe. The caller owns
    /// the returned chunk until it either [`Self::send_chunk`]s or drops it.
    pub fn try_allocate_chunk(
        &self,
        payload_size: u32,
        payload_align: u32,
        user_header_size: u32,
        user_header_align: u32,
    ) -> Result<SharedChunk<'seg>, AllocationError> {
        let settings = ChunkSettings::new(payload_size, payload_align, user_header_size, user_header_align)?;
        Ok(self.memory.get_chunk(&settings)?)
    }

    /// Releases a chunk that was allocated but never sent. Equivalent to dropping it, spelled out
    /// for callers that want the release to read as an explicit port operation.
    pub fn release_chunk(&self, chunk: SharedChunk<'seg>) {
        drop(chunk);
    }

    /// Hands a chunk to the port for sending. While offered, a clone is pushed into every
    /// connected subscriber's queue, addressed via [`RelativePointer`]; regardless of offer state,
    /// the chunk itself is retained in the bounded history, evicting the oldest entry once full.
    /// Delivery never fails on a full subscriber queue: a slow subscriber loses samples rather
    /// than blocking the send path.
    pub fn send_chunk(&self, chunk: SharedChunk<'seg>) {
        if self.is_offered() {
            let queues = self.queues();
            for queue in queues.iter() {
                let pointer = RelativePointer::encode(chunk.header_ptr().as_ptr())
                    .expect("a chunk handed out through this port's segment is always registered");
                queue.push(pointer, chunk.clone());
            }
        }

        let mut history = self.history.lock().unwrap_or_else(|poison| poison.into_inner());
        if history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(chunk);
    }

    /// A copy of the most recently sent chunk's header, if any chunk has been sent yet.
    pub fn try_get_previous_chunk(&self) -> Option<ChunkHeader> {
        let history = self.history.lock().unwrap_or_else(|poison| poison.into_inner());
        history.back().map(|chunk| *chunk.header())
    }

    /// Number of chunks currently retained in the history.
    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap_or_else(|poison| poison.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use shmfabric_bb_elementary::relative_pointer::registry;
    use shmfabric_cal::memory_manager::MempoolConfig;

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
    fn offer_state_toggles_independently_of_subscriber_count() {
        let config = [MempoolConfig::new(64, 4)];
        let (_management, _chunks, manager) = new_manager(&config);
        let port = PublisherPort::new(&manager, 2);

        assert!(!port.is_offered());
        port.offer();
        assert!(port.is_offered());
        assert!(!port.has_subscribers());
        let queue = port.connect_subscriber(4);
        assert!(port.has_subscribers());
        port.disconnect_subscriber(&queue);
        assert!(!port.has_subscribers());
        port.stop_offer();
        assert!(!port.is_offered());
    }

    #[test]
    fn send_chunk_retains_bounded_history_and_evicts_oldest() {
        let config = [MempoolConfig::new(64, 8)];
        let (_management, _chunks, manager) = new_manager(&config);
        let port = PublisherPort::new(&manager, 2);

        for i in 0..3u32 {
            let mut chunk = port.try_allocate_chunk(4, 1, 0, 1).unwrap();
            chunk.payload_mut()[0..4].copy_from_slice(&i.to_ne_bytes());
            port.send_chunk(chunk);
        }

        assert_eq!(port.history_len(), 2);
        let previous = port.try_get_previous_chunk().unwrap();
        assert_eq!(previous.payload_size(), 4);
    }

    #[test]
    fn try_get_previous_chunk_is_none_before_anything_is_sent() {
        let config = [MempoolConfig::new(32, 2)];
        let (_management, _chunks, manager) = new_manager(&config);
        let port = PublisherPort::new(&manager, 4);
        assert!(port.try_get_previous_chunk().is_none());
    }

    #[test]
    fn release_chunk_returns_it_to_the_pool_without_sending() {
        let config = [MempoolConfig::new(32, 1)];
        let (_management, _chunks, manager) = new_manager(&config);
        let port = PublisherPort::new(&manager, 1);
        let chunk = port.try_allocate_chunk(8, 1, 0, 1).unwrap();
        assert_eq!(manager.mempool(0).unwrap().used_count(), 1);
        port.release_chunk(chunk);
        assert_eq!(manager.mempool(0).unwrap().used_count(), 0);
    }

    #[test]
    fn send_while_not_offered_leaves_subscriber_queues_untouched_but_updates_history() {
        // spec property P11.
        let config = [MempoolConfig::new(32, 2)];
        let (_management, chunks, manager) = new_manager(&config);
        let segment_id = registry::register(chunks.as_ptr() as usize, chunks.len() as u64).unwrap();

        let port = PublisherPort::new(&manager, 1);
        let queue = port.connect_subscriber(4);

        let chunk = port.try_allocate_chunk(8, 1, 0, 1).unwrap();
        port.send_chunk(chunk);

        assert_eq!(port.history_len(), 1);
        assert_eq!(queue.len(), 0);

        registry::unregister(segment_id);
    }

    #[test]
    fn send_while_offered_delivers_to_every_connected_subscriber_queue() {
        let config = [MempoolConfig::new(32, 2)];
        let (_management, chunks, manager) = new_manager(&config);
        let segment_id = registry::register(chunks.as_ptr() as usize, chunks.len() as u64).unwrap();

        let port = PublisherPort::new(&manager, 1);
        port.offer();
        let first = port.connect_subscriber(4);
        let second = port.connect_subscriber(4);

        let chunk = port.try_allocate_chunk(8, 1, 0, 1).unwrap();
        port.send_chunk(chunk);

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(port.history_len(), 1);

        registry::unregister(segment_id);
    }
}
