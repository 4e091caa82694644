// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Configuration enumerated in spec §6.

use serde::{Deserialize, Serialize};

/// Tunables for a shuffle run. One `ShuffleConfig` is shared by every run
/// on a worker; a run value-copies the fields it needs at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleConfig {
    /// Cap on in-flight memory buffer (Comm Buffer + receive staging) per run.
    pub memory_limit_bytes_per_run: u64,

    /// Cap on per-run disk usage; beyond this, `append` fails with `DiskFull`.
    pub disk_limit_bytes_per_run: u64,

    /// Accumulated bytes in a Comm Buffer that trigger a send.
    pub send_flush_bytes: u64,

    /// Maximum age, in milliseconds, before a Comm Buffer flushes regardless
    /// of size.
    pub send_flush_ms: u64,

    /// Interval, in milliseconds, between heartbeat reports to the scheduler.
    pub heartbeat_interval_ms: u64,

    /// Opaque codec identifier; implementations agree on it at creation.
    pub codec: String,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes_per_run: 128 * 1024 * 1024,
            disk_limit_bytes_per_run: 4 * 1024 * 1024 * 1024,
            send_flush_bytes: 2 * 1024 * 1024,
            send_flush_ms: 50,
            heartbeat_interval_ms: 1000,
            codec: "arrow-ipc-stream-v1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ShuffleConfig::default();
        assert_eq!(cfg.memory_limit_bytes_per_run, 128 * 1024 * 1024);
        assert_eq!(cfg.send_flush_bytes, 2 * 1024 * 1024);
        assert_eq!(cfg.send_flush_ms, 50);
    }

    #[test]
    fn deserializes_partial_overrides() {
        let cfg: ShuffleConfig = serde_json::from_str(r#"{"send_flush_ms": 10}"#).unwrap();
        assert_eq!(cfg.send_flush_ms, 10);
        assert_eq!(cfg.memory_limit_bytes_per_run, 128 * 1024 * 1024);
    }
}
