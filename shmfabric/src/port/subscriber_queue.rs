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

//! A bounded delivery queue a [`crate::port::publisher::PublisherPort`] pushes published chunks
//! into on behalf of one connected subscriber. Entries are addressed via
//! [`RelativePointer`] so a subscriber mapping the same segment can decode and read them without
//! touching this crate's bookkeeping; this workspace only implements the publish side, so nothing
//! here ever pops from the consumer end except tests standing in for one.

use std::collections::VecDeque;
use std::sync::Mutex;

use shmfabric_bb_elementary::relative_pointer::RelativePointer;
use shmfabric_cal::chunk::ChunkHeader;
use shmfabric_cal::memory_manager::SharedChunk;

/// One subscriber's delivery queue, bounded to `capacity` outstanding chunks. Pushing past
/// capacity evicts the oldest entry (releasing its reference) rather than blocking the publisher
/// or failing: a slow subscriber loses samples, it never stalls the send path.
pub struct SubscriberQueue<'seg> {
    capacity: usize,
    // Each entry keeps its own `SharedChunk` clone alive until popped or evicted; the chunk's
    // pool only frees it once every such reference (history's, every queue's) has gone.
    slots: Mutex<VecDeque<(RelativePointer<ChunkHeader>, SharedChunk<'seg>)>>,
}

impl<'seg> SubscriberQueue<'seg> {
    pub fn new(capacity: usize) -> Self {
        SubscriberQueue {
            capacity: capacity.max(1),
            slots: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of chunks currently queued for this subscriber.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|poison| poison.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn push(&self, pointer: RelativePointer<ChunkHeader>, chunk: SharedChunk<'seg>) {
        let mut slots = self.slots.lock().unwrap_or_else(|poison| poison.into_inner());
        if slots.len() == self.capacity {
            slots.pop_front();
        }
        slots.push_back((pointer, chunk));
    }

    /// Pops the oldest queued chunk's relative pointer, if any. A real subscriber-side port would
    /// decode this via [`RelativePointer::decode`] against its own mapping of the segment.
    pub fn try_pop(&self) -> Option<RelativePointer<ChunkHeader>> {
        self.slots
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .pop_front()
            .map(|(pointer, _chunk)| pointer)
    }
}
