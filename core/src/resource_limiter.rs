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

//! Resource Limiter (C1): a bounded, byte-counted semaphore used for both
//! the memory and disk budgets of a shuffle run.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Which limit a [`ResourceLimiter`] enforces, purely for error messages
/// and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterKind {
    Memory,
    Disk,
}

/// A counting semaphore over a byte budget. Acquisitions are FIFO and
/// all-or-nothing: a request for more bytes than the total capacity can
/// never succeed and is rejected immediately rather than queued forever.
/// `close()` wakes every current and future waiter with an error, which is
/// how `ShuffleRun::close`/`fail` cancel pending permit waits (spec §5).
pub struct ResourceLimiter {
    kind: LimiterKind,
    capacity: u64,
    semaphore: Arc<Semaphore>,
}

/// RAII guard for bytes acquired from a [`ResourceLimiter`]. Owned, so it
/// can be moved into a struct and held across await points (e.g. a Comm
/// Buffer holding memory permits for its pending bytes). Releases the
/// permits when dropped.
pub struct BytesPermit {
    _permit: OwnedSemaphorePermit,
}

impl ResourceLimiter {
    pub fn new(kind: LimiterKind, capacity_bytes: u64) -> Self {
        Self {
            kind,
            capacity: capacity_bytes,
            semaphore: Arc::new(Semaphore::new(capacity_bytes as usize)),
        }
    }

    pub fn kind(&self) -> LimiterKind {
        self.kind
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently available without suspending.
    pub fn available(&self) -> u64 {
        self.semaphore.available_permits() as u64
    }

    /// Acquire `bytes` permits, suspending (FIFO) until they're available.
    /// Fails immediately, without suspending, if `bytes` exceeds the total
    /// capacity (it could never succeed) or the limiter has been closed.
    pub async fn acquire(&self, bytes: u64) -> crate::error::Result<BytesPermit> {
        if bytes > self.capacity {
            return Err(self.refusal(bytes));
        }
        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(bytes as u32)
            .await
            .map_err(|_| self.refusal(bytes))?;
        Ok(BytesPermit { _permit: permit })
    }

    /// Cancels every pending and future acquire with the limiter's error
    /// kind. Idempotent.
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn refusal(&self, requested: u64) -> crate::error::ShuffleError {
        match self.kind {
            LimiterKind::Memory => crate::error::ShuffleError::MemoryExhausted {
                requested,
                capacity: self.capacity,
            },
            LimiterKind::Disk => crate::error::ShuffleError::DiskFull {
                requested,
                capacity: self.capacity,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_release_round_trip() {
        let limiter = ResourceLimiter::new(LimiterKind::Memory, 100);
        {
            let _p = limiter.acquire(60).await.unwrap();
            assert_eq!(limiter.available(), 40);
        }
        assert_eq!(limiter.available(), 100);
    }

    #[tokio::test]
    async fn oversized_request_fails_immediately() {
        let limiter = ResourceLimiter::new(LimiterKind::Disk, 10);
        let err = limiter.acquire(11).await.unwrap_err();
        assert!(matches!(err, crate::error::ShuffleError::DiskFull { .. }));
    }

    #[tokio::test]
    async fn second_acquirer_suspends_until_release() {
        let limiter = Arc::new(ResourceLimiter::new(LimiterKind::Memory, 10));
        let first = limiter.acquire(10).await.unwrap();

        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move {
            let _p = limiter2.acquire(5).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_error() {
        let limiter = Arc::new(ResourceLimiter::new(LimiterKind::Memory, 10));
        let _held = limiter.acquire(10).await.unwrap();

        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire(5).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.close();

        let result = waiter.await.unwrap();
        assert!(result.is_err());
    }
}
