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

//! Per-run counters (spec §3 Heartbeat) and the wire-level snapshot sent
//! to the Scheduler Plugin.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time snapshot of a run's counters, sent to the scheduler for
/// observability only — heartbeats never drive correctness (spec §4.7).
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub bytes_written: u64,
    pub bytes_sent: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub disk_bytes: u64,
    pub memory_bytes: u64,
    pub errors: u64,
    pub elapsed: Duration,
    pub observed_at: DateTime<Utc>,
}

/// Atomics-backed counter bundle a `ShuffleRun` updates as bytes move
/// through it, sampled into a [`Heartbeat`] on request.
pub struct RunMetrics {
    bytes_written: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_acked: AtomicU64,
    bytes_received: AtomicU64,
    disk_bytes: AtomicU64,
    memory_bytes: AtomicU64,
    errors: AtomicU64,
    started_at: Instant,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            bytes_written: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_acked: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            disk_bytes: AtomicU64::new(0),
            memory_bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_acked(&self, n: u64) {
        self.bytes_acked.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_disk(&self, n: u64) {
        self.disk_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_memory(&self, n: u64) {
        self.memory_bytes.store(n, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Heartbeat {
        Heartbeat {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_acked: self.bytes_acked.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            disk_bytes: self.disk_bytes.load(Ordering::Relaxed),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            elapsed: self.started_at.elapsed(),
            observed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates() {
        let m = RunMetrics::new();
        m.add_written(100);
        m.add_sent(80);
        m.add_error();
        let hb = m.snapshot();
        assert_eq!(hb.bytes_written, 100);
        assert_eq!(hb.bytes_sent, 80);
        assert_eq!(hb.errors, 1);
    }
}
