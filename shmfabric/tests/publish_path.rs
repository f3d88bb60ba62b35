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

//! End-to-end exercise of the publish path: segment creation, chunk allocation through a
//! publisher port, and the bounded history a late reader could still observe.

use shmfabric::port::publisher::PublisherPort;
use shmfabric::sample::Sample;
use shmfabric_bb_posix::user::User;
use shmfabric_cal::memory_manager::MempoolConfig;
use shmfabric_cal::segment::Segment;
use shmfabric_cal::segment_manager::SegmentManager;

fn unique_name(tag: &str) -> String {
    format!("shmfabric-publish-path-test-{tag}-{}", std::process::id())
}

#[test]
fn loan_fill_publish_round_trip() {
    let config = [MempoolConfig::new(64, 4), MempoolConfig::new(256, 2)];
    let segment = Segment::create(&unique_name("roundtrip"), &config, None, None).unwrap();
    let port = PublisherPort::new(segment.memory_manager(), 2);
    port.offer();
    assert!(port.is_offered());

    let payload = b"hello from the fabric";
    let mut chunk = port.try_allocate_chunk(payload.len() as u32, 1, 0, 1).unwrap();
    chunk.payload_mut().copy_from_slice(payload);

    let sample = Sample::for_publishing(chunk, &port);
    assert_eq!(sample.get().unwrap(), payload);
    sample.publish().unwrap();

    let previous = port.try_get_previous_chunk().unwrap();
    assert_eq!(previous.payload_size() as usize, payload.len());
}

#[test]
fn exhausting_a_tier_does_not_spill_into_a_larger_one() {
    // spec scenario 4, driven through the publisher port instead of the MemoryManager directly.
    let config = [
        MempoolConfig::new(32, 2),
        MempoolConfig::new(64, 2),
        MempoolConfig::new(128, 2),
    ];
    let segment = Segment::create(&unique_name("exhaustion"), &config, None, None).unwrap();
    let port = PublisherPort::new(segment.memory_manager(), 1);

    let mut held = Vec::new();
    for _ in 0..2 {
        held.push(port.try_allocate_chunk(48, 1, 0, 1).unwrap());
    }
    assert!(port.try_allocate_chunk(48, 1, 0, 1).is_err());
    assert_eq!(segment.memory_manager().mempool(2).unwrap().used_count(), 0);
}

#[test]
fn segment_manager_reports_write_access_and_mappings_by_group() {
    let mut manager = SegmentManager::new();
    let name = unique_name("segment-manager");
    let config = [MempoolConfig::new(64, 4)];
    let me = User::from_self().unwrap();
    manager
        .create_segment(&name, &config, Some(me.gid()), Some(me.gid()))
        .unwrap();

    let mappings = manager.segment_mappings_for(&me);
    assert_eq!(mappings.len(), 1);
    assert!(mappings[0].is_writable);

    let (memory, _segment_id) = manager
        .segment_with_write_access_for(&me)
        .expect("writer group matches the current user");
    let port = PublisherPort::new(memory, 1);
    let chunk = port.try_allocate_chunk(16, 1, 0, 1).unwrap();
    port.send_chunk(chunk);
    assert_eq!(port.history_len(), 1);
}

#[test]
fn unpublished_samples_release_their_chunk_back_to_the_pool_on_drop() {
    let config = [MempoolConfig::new(32, 1)];
    let segment = Segment::create(&unique_name("release-on-drop"), &config, None, None).unwrap();
    let port = PublisherPort::new(segment.memory_manager(), 1);

    {
        let chunk = port.try_allocate_chunk(8, 1, 0, 1).unwrap();
        let _sample = Sample::for_publishing(chunk, &port);
        assert_eq!(segment.memory_manager().mempool(0).unwrap().used_count(), 1);
    }
    assert_eq!(segment.memory_manager().mempool(0).unwrap().used_count(), 0);
}
