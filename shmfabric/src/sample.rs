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

//! A [`Sample`] is a unique owner of one loaned chunk, plus (on the producer side) a back
//! reference to the port it will publish through. Dropping a sample that was never published
//! releases the chunk straight back to its pool, since [`SharedChunk`] already does that on drop.

use shmfabric_cal::chunk::ChunkHeader;
use shmfabric_cal::memory_manager::SharedChunk;
use shmfabric_log::fail;

use crate::port::publisher::PublisherPort;

/// Failures from [`Sample::publish`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum PublishError {
    /// The sample was already published, or constructed consumer-side with no port to publish
    /// through.
    NothingToPublish,
}

/// A loaned chunk plus, for a producer-side sample, the port it will send through on
/// [`Sample::publish`]. Must not outlive the port it was constructed against; the `'port` lifetime
/// enforces that.
pub struct Sample<'seg, 'port> {
    chunk: Option<SharedChunk<'seg>>,
    port: Option<&'port PublisherPort<'seg>>,
}

impl<'seg, 'port> Sample<'seg, 'port> {
    /// A sample that, once published, sends `chunk` through `port`.
    pub fn for_publishing(chunk: SharedChunk<'seg>, port: &'port PublisherPort<'seg>) -> Self {
        Sample { chunk: Some(chunk), port: Some(port) }
    }

    /// A sample with no port to publish through — read-only access to a loaned chunk.
    pub fn for_reading(chunk: SharedChunk<'seg>) -> Self {
        Sample { chunk: Some(chunk), port: None }
    }

    /// The payload, or `None` if this sample has already been published.
    pub fn get(&self) -> Option<&[u8]> {
        self.chunk.as_ref().map(|c| c.payload())
    }

    /// The payload, mutably.
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        self.chunk.as_mut().map(|c| c.payload_mut())
    }

    /// The user header, if this chunk was configured with one.
    pub fn get_user_header(&self) -> Option<&[u8]> {
        self.chunk.as_ref().and_then(|c| c.user_header())
    }

    /// The backing chunk header.
    pub fn get_chunk_header(&self) -> Option<&ChunkHeader> {
        self.chunk.as_ref().map(|c| c.header())
    }

    /// Whether this sample still owns a chunk (has not yet been published).
    pub fn is_empty(&self) -> bool {
        self.chunk.is_none()
    }

    /// Hands the owned chunk to the port for sending. Requires a non-empty, producer-side sample;
    /// after a successful publish the sample is empty.
    pub fn publish(mut self) -> Result<(), PublishError> {
        let msg = "Unable to publish sample";
        if self.chunk.is_none() {
            fail!(from "Sample::publish", with PublishError::NothingToPublish,
                "{} since it is empty.", msg);
        }
        let Some(port) = self.port else {
            fail!(from "Sample::publish", with PublishError::NothingToPublish,
                "{} since it was constructed without a port to publish through.", msg);
        };
        let chunk = self.chunk.take().expect("checked above");
        port.send_chunk(chunk);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use shmfabric_cal::memory_manager::{MemoryManager, MempoolConfig};

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
    fn publish_sends_the_chunk_through_the_port_and_empties_the_sample() {
        let config = [MempoolConfig::new(32, 2)];
        let (_management, _chunks, manager) = new_manager(&config);
        let port = PublisherPort::new(&manager, 1);
        let chunk = port.try_allocate_chunk(8, 1, 0, 1).unwrap();
        let sample = Sample::for_publishing(chunk, &port);

        assert!(!sample.is_empty());
        sample.publish().unwrap();
        assert_eq!(port.history_len(), 1);
    }

    #[test]
    fn publishing_a_consumer_side_sample_fails() {
        let config = [MempoolConfig::new(32, 2)];
        let (_management, _chunks, manager) = new_manager(&config);
        let port = PublisherPort::new(&manager, 1);
        let chunk = port.try_allocate_chunk(8, 1, 0, 1).unwrap();
        let sample = Sample::for_reading(chunk);
        assert_eq!(sample.publish().unwrap_err(), PublishError::NothingToPublish);
    }

    #[test]
    fn dropping_an_unpublished_sample_returns_its_chunk_to_the_pool() {
        let config = [MempoolConfig::new(32, 1)];
        let (_management, _chunks, manager) = new_manager(&config);
        let port = PublisherPort::new(&manager, 1);
        let chunk = port.try_allocate_chunk(8, 1, 0, 1).unwrap();
        assert_eq!(manager.mempool(0).unwrap().used_count(), 1);
        {
            let _sample = Sample::for_publishing(chunk, &port);
        }
        assert_eq!(manager.mempool(0).unwrap().used_count(), 0);
    }
}
