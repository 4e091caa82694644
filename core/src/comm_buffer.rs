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

//! Comm Buffer (C4): per-peer send-side batching buffer. Accumulates
//! bytes, flushes on size/age, and allows only one outstanding RPC per
//! peer at a time (spec §4.4).

use crate::error::{FailureReason, Result};
use crate::heartbeat::RunMetrics;
use crate::ids::{RunId, ShuffleId, WorkerAddress};
use crate::resource_limiter::{BytesPermit, ResourceLimiter};
use crate::rpc::{PeerTransport, ShardBatch};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Pending {
    shards: BTreeMap<u32, Vec<Vec<u8>>>,
    bytes: u64,
    permits: Vec<BytesPermit>,
    oldest_write: Option<Instant>,
}

impl Pending {
    fn take(&mut self) -> Pending {
        std::mem::take(self)
    }
}

struct Inner {
    peer: WorkerAddress,
    shuffle_id: ShuffleId,
    run_id: RunId,
    transport: Arc<dyn PeerTransport>,
    memory_limiter: Arc<ResourceLimiter>,
    metrics: Arc<RunMetrics>,
    flush_bytes_threshold: u64,
    pending: Mutex<Pending>,
    /// One permit = "no send in flight"; `flush` holds it for the
    /// duration of the RPC, so a second writer's `flush` suspends.
    inflight: Semaphore,
    stop: Notify,
    stopped: AtomicBool,
    /// Invoked when a *background* (age-triggered) flush fails, since
    /// there is no caller around to propagate the error to. Mirrors the
    /// `on_error` callback of the worker-side event loop.
    on_background_failure: Arc<dyn Fn(FailureReason) + Send + Sync>,
    background: SyncMutex<Option<JoinHandle<()>>>,
}

/// Per-peer send-side buffer. One instance per peer a run talks to. Kept
/// behind an `Arc` by owners (a Shuffle Run holds one per peer), so every
/// method other than `new` takes `&self`.
pub struct CommBuffer {
    inner: Arc<Inner>,
}

impl CommBuffer {
    pub fn new(
        peer: WorkerAddress,
        shuffle_id: ShuffleId,
        run_id: RunId,
        transport: Arc<dyn PeerTransport>,
        memory_limiter: Arc<ResourceLimiter>,
        metrics: Arc<RunMetrics>,
        flush_bytes_threshold: u64,
        flush_age: Duration,
        on_background_failure: Arc<dyn Fn(FailureReason) + Send + Sync>,
    ) -> Self {
        let inner = Arc::new(Inner {
            peer,
            shuffle_id,
            run_id,
            transport,
            memory_limiter,
            metrics,
            flush_bytes_threshold,
            pending: Mutex::new(Pending::default()),
            inflight: Semaphore::new(1),
            stop: Notify::new(),
            stopped: AtomicBool::new(false),
            on_background_failure,
            background: SyncMutex::new(None),
        });

        let bg_inner = inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(flush_age) => {
                        if bg_inner.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        let is_aged = {
                            let pending = bg_inner.pending.lock().await;
                            pending
                                .oldest_write
                                .map(|t| t.elapsed() >= flush_age)
                                .unwrap_or(false)
                        };
                        if is_aged {
                            if let Err(e) = Self::flush_inner(&bg_inner).await {
                                log::error!(
                                    "comm buffer to {}: age-triggered flush failed: {e}",
                                    bg_inner.peer
                                );
                                (bg_inner.on_background_failure)(FailureReason::Peer(e.to_string()));
                            }
                        }
                    }
                    _ = bg_inner.stop.notified() => break,
                }
            }
        });
        *inner.background.lock() = Some(handle);

        Self { inner }
    }

    pub fn peer(&self) -> &WorkerAddress {
        &self.inner.peer
    }

    /// Acquires memory permits for `bytes` and appends it under
    /// `output_partition`, flushing immediately if the size threshold is
    /// reached.
    pub async fn write(&self, output_partition: u32, bytes: Vec<u8>) -> Result<()> {
        let permit = self.inner.memory_limiter.acquire(bytes.len() as u64).await?;
        let should_flush = {
            let mut pending = self.inner.pending.lock().await;
            pending.bytes += bytes.len() as u64;
            pending.oldest_write.get_or_insert_with(Instant::now);
            pending.shards.entry(output_partition).or_default().push(bytes);
            pending.permits.push(permit);
            pending.bytes >= self.inner.flush_bytes_threshold
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Waits until no send is in flight, then moves the current contents
    /// to an in-flight slot and sends them. On success the permits are
    /// dropped (bytes released); on failure the caller is expected to
    /// call `fail()` on the owning shuffle run (spec §4.4 step 4).
    pub async fn flush(&self) -> Result<()> {
        Self::flush_inner(&self.inner).await
    }

    async fn flush_inner(inner: &Arc<Inner>) -> Result<()> {
        let _inflight = inner.inflight.acquire().await.expect("inflight semaphore never closes");

        let mut to_send = {
            let mut pending = inner.pending.lock().await;
            pending.take()
        };
        if to_send.shards.is_empty() {
            return Ok(());
        }

        let mut payload: ShardBatch = Vec::new();
        let mut total_bytes = 0u64;
        for (partition, blobs) in to_send.shards.drain() {
            for blob in blobs {
                total_bytes += blob.len() as u64;
                payload.push((partition, blob));
            }
        }

        let result = inner
            .transport
            .shuffle_receive(&inner.peer, &inner.shuffle_id, inner.run_id, payload)
            .await;

        // The permits backing `to_send` are dropped here either way,
        // releasing the memory regardless of send outcome — a failed
        // send still fails the whole run (spec §4.4), so there is no
        // value in holding the bytes hostage.
        drop(to_send.permits);

        match result {
            Ok(()) => {
                inner.metrics.add_sent(total_bytes);
                inner.metrics.add_acked(total_bytes);
                log::debug!("comm buffer to {}: flushed {total_bytes} bytes", inner.peer);
                Ok(())
            }
            Err(e) => {
                inner.metrics.add_error();
                Err(e)
            }
        }
    }

    /// Awaits both the current buffer and any in-flight send draining.
    pub async fn flush_all(&self) -> Result<()> {
        self.flush().await
    }

    /// Cancels the background flush timer. Does not itself drain
    /// anything — callers that need a final flush should call
    /// `flush_all` first (the Shuffle Run's `close`/`fail` do this for
    /// every peer before calling `close_background`).
    pub fn close_background(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.stop.notify_one();
        }
        if let Some(handle) = self.inner.background.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for CommBuffer {
    fn drop(&mut self) {
        self.close_background();
    }
}
