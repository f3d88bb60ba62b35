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

//! Static, in-process configuration: the mempool tiers and segment names a process sets up once
//! at startup, plus how much publish history each port should retain.

use serde::{Deserialize, Serialize};

use shmfabric_cal::memory_manager::MempoolConfig;

/// One segment's worth of configuration: its name and the mempool tiers it should be created
/// with.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub name: String,
    pub mempool_config: Vec<MempoolConfig>,
}

/// The full static configuration for one process's view of the fabric: the segments it owns or
/// maps, and the default history capacity new publisher ports are created with.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub segments: Vec<SegmentConfig>,
    pub default_history_capacity: usize,
}

impl Config {
    pub fn new(segments: Vec<SegmentConfig>, default_history_capacity: usize) -> Self {
        Config { segments, default_history_capacity }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config { segments: Vec::new(), default_history_capacity: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let config = Config::new(
            vec![SegmentConfig {
                name: "demo".to_string(),
                mempool_config: vec![MempoolConfig::new(64, 4), MempoolConfig::new(256, 2)],
            }],
            4,
        );
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: Config = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn default_has_no_segments_and_keeps_at_least_one_chunk_of_history() {
        let config = Config::default();
        assert!(config.segments.is_empty());
        assert_eq!(config.default_history_capacity, 1);
    }
}
