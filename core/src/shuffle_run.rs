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

//! Shuffle Run (C5): the per-shuffle, per-worker state machine (spec §4.5).
//! Owns a [`PartitionStore`] and one [`CommBuffer`] per peer this run talks
//! to, and exposes the six public operations the Worker Plugin and the
//! task graph drive it with.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::codec;
use crate::comm_buffer::CommBuffer;
use crate::config::ShuffleConfig;
use crate::error::{FailureReason, Result, ShuffleError};
use crate::heartbeat::{Heartbeat, RunMetrics};
use crate::ids::{RunId, ShuffleId, WorkerAddress};
use crate::partition_store::PartitionStore;
use crate::resource_limiter::{LimiterKind, ResourceLimiter};
use crate::rpc::{PeerTransport, SchedulerTransport, ShuffleSpec};

/// One slot of the receive-quiescence barrier (see [`ShuffleRun::inputs_done`]).
/// Comfortably above any realistic number of concurrent in-flight `receive`
/// calls for a single run.
const RECEIVE_GATE_PERMITS: u32 = 1 << 16;

/// Bounds `fut` by `deadline` when set (spec §5, "every externally visible
/// blocking operation accepts an optional deadline"). An elapsed deadline
/// drops `fut` in place and yields `ShuffleError::Timeout`; any partial
/// work it had in flight (e.g. a permit acquisition) is cancelled along
/// with it, same as `close`/`fail`.
async fn with_deadline<T>(deadline: Option<Duration>, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ShuffleError::Timeout(d)),
        },
        None => fut.await,
    }
}

/// States of §4.5. `Failed` carries the reason every participant that
/// later observes this run must see.
#[derive(Debug, Clone, PartialEq)]
pub enum ShuffleRunState {
    Created,
    Ingesting,
    InputsDone,
    Flushed,
    Closed,
    Failed(FailureReason),
}

/// The per-shuffle, per-worker coordinator (spec §4.5). Always held behind
/// an `Arc` — background tasks (heartbeat, Comm Buffer flush timers) hold
/// weak references back into it, so there is no ownership cycle with the
/// Worker Plugin that created it (spec §9, "cyclic references").
pub struct ShuffleRun {
    shuffle_id: ShuffleId,
    run_id: RunId,
    self_address: WorkerAddress,
    spec: ShuffleSpec,
    config: ShuffleConfig,

    state: SyncMutex<ShuffleRunState>,
    ingested: SyncMutex<HashSet<u32>>,

    partition_store: PartitionStore,
    comm_buffers: HashMap<WorkerAddress, Arc<CommBuffer>>,
    memory_limiter: Arc<ResourceLimiter>,
    disk_limiter: Arc<ResourceLimiter>,
    metrics: Arc<RunMetrics>,

    scheduler_transport: Arc<dyn SchedulerTransport>,

    /// Barrier used by `inputs_done` to wait out any `receive` calls still
    /// in flight before declaring disk quiescence (spec §4.5, §4.4 "await
    /// disk quiescence").
    receive_gate: Semaphore,

    heartbeat_stop: Notify,
    heartbeat_stopped: AtomicBool,
    heartbeat_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl ShuffleRun {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shuffle_id: ShuffleId,
        run_id: RunId,
        self_address: WorkerAddress,
        spec: ShuffleSpec,
        config: ShuffleConfig,
        run_dir: impl Into<PathBuf>,
        peer_transport: Arc<dyn PeerTransport>,
        scheduler_transport: Arc<dyn SchedulerTransport>,
    ) -> Arc<Self> {
        let memory_limiter = Arc::new(ResourceLimiter::new(
            LimiterKind::Memory,
            config.memory_limit_bytes_per_run,
        ));
        let disk_limiter = Arc::new(ResourceLimiter::new(
            LimiterKind::Disk,
            config.disk_limit_bytes_per_run,
        ));
        let metrics = Arc::new(RunMetrics::new());
        let partition_store = PartitionStore::new(run_dir.into(), disk_limiter.clone());

        let peers: BTreeSet<WorkerAddress> = spec
            .worker_for
            .values()
            .filter(|w| **w != self_address)
            .cloned()
            .collect();

        Arc::new_cyclic(|weak: &Weak<ShuffleRun>| {
            let comm_buffers = peers
                .into_iter()
                .map(|peer| {
                    let weak = weak.clone();
                    let on_background_failure: Arc<dyn Fn(FailureReason) + Send + Sync> =
                        Arc::new(move |reason| {
                            if let Some(run) = weak.upgrade() {
                                tokio::spawn(async move { run.fail(reason).await });
                            }
                        });
                    let buffer = CommBuffer::new(
                        peer.clone(),
                        shuffle_id.clone(),
                        run_id,
                        peer_transport.clone(),
                        memory_limiter.clone(),
                        metrics.clone(),
                        config.send_flush_bytes,
                        Duration::from_millis(config.send_flush_ms),
                        on_background_failure,
                    );
                    (peer, Arc::new(buffer))
                })
                .collect();

            let run = ShuffleRun {
                shuffle_id,
                run_id,
                self_address,
                spec,
                config,
                state: SyncMutex::new(ShuffleRunState::Created),
                ingested: SyncMutex::new(HashSet::new()),
                partition_store,
                comm_buffers,
                memory_limiter,
                disk_limiter,
                metrics,
                scheduler_transport,
                receive_gate: Semaphore::new(RECEIVE_GATE_PERMITS as usize),
                heartbeat_stop: Notify::new(),
                heartbeat_stopped: AtomicBool::new(false),
                heartbeat_task: SyncMutex::new(None),
            };

            run
        })
        .start_heartbeat()
    }

    /// Spawns the periodic `shuffle_heartbeat` reporter and returns `self`
    /// so `new` can chain it. Split out of `new` only because the task
    /// needs a fully-constructed `Arc<Self>` to upgrade its weak reference.
    fn start_heartbeat(self: Arc<Self>) -> Arc<Self> {
        let weak = Arc::downgrade(&self);
        let interval_ms = self.config.heartbeat_interval_ms.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await; // first tick is immediate; nothing to report yet
            loop {
                // Re-upgrade every iteration so the run (and its `Notify`) stay
                // alive for the duration of the `select!` below.
                let Some(run) = weak.upgrade() else { return };
                if run.heartbeat_stopped.load(Ordering::SeqCst) {
                    return;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        match run.state() {
                            ShuffleRunState::Flushed
                            | ShuffleRunState::Closed
                            | ShuffleRunState::Failed(_) => return,
                            _ => {
                                let in_use = run
                                    .config
                                    .memory_limit_bytes_per_run
                                    .saturating_sub(run.memory_limiter.available());
                                run.metrics.set_memory(in_use);
                                let hb = run.metrics.snapshot();
                                run.scheduler_transport
                                    .heartbeat(&run.shuffle_id, run.run_id, hb)
                                    .await;
                            }
                        }
                    }
                    _ = run.heartbeat_stop.notified() => return,
                }
            }
        });
        self
    }

    fn stop_heartbeat(&self) {
        if !self.heartbeat_stopped.swap(true, Ordering::SeqCst) {
            self.heartbeat_stop.notify_waiters();
        }
        if let Some(handle) = self.heartbeat_task.lock().take() {
            handle.abort();
        }
    }

    pub fn shuffle_id(&self) -> &ShuffleId {
        &self.shuffle_id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> ShuffleRunState {
        self.state.lock().clone()
    }

    pub fn metrics_snapshot(&self) -> Heartbeat {
        self.metrics.snapshot()
    }

    fn err_closed(&self) -> ShuffleError {
        ShuffleError::Closed {
            shuffle_id: self.shuffle_id.clone(),
            run_id: self.run_id,
        }
    }

    fn err_failed(&self, reason: FailureReason) -> ShuffleError {
        ShuffleError::Failed {
            shuffle_id: self.shuffle_id.clone(),
            run_id: self.run_id,
            reason,
        }
    }

    fn ensure_ingestable(&self) -> Result<()> {
        let mut state = self.state.lock();
        match &*state {
            ShuffleRunState::Created => {
                *state = ShuffleRunState::Ingesting;
                Ok(())
            }
            ShuffleRunState::Ingesting => Ok(()),
            ShuffleRunState::Closed => Err(self.err_closed()),
            ShuffleRunState::Failed(r) => Err(self.err_failed(r.clone())),
            other => Err(ShuffleError::Invalid(format!(
                "add_partition is invalid once a run has reached {other:?}"
            ))),
        }
    }

    fn ensure_receivable(&self) -> Result<()> {
        match &*self.state.lock() {
            ShuffleRunState::Closed => Err(self.err_closed()),
            ShuffleRunState::Failed(r) => Err(self.err_failed(r.clone())),
            _ => Ok(()),
        }
    }

    fn ensure_flushed(&self) -> Result<()> {
        match &*self.state.lock() {
            ShuffleRunState::Flushed => Ok(()),
            ShuffleRunState::Closed => Err(self.err_closed()),
            ShuffleRunState::Failed(r) => Err(self.err_failed(r.clone())),
            other => Err(ShuffleError::Invalid(format!(
                "get_output_partition requires a Flushed run, found {other:?}"
            ))),
        }
    }

    /// Awaits `fut`; on a local fatal error (spec §7: corrupt data, a disk
    /// or memory limit refusal, an unreachable peer), transitions this run
    /// to `Failed` — which also notifies the scheduler — before handing the
    /// error back to the caller. A non-fatal error (e.g. the run is already
    /// `Closed`/`Failed`/`Stale`) passes through untouched.
    async fn or_fail<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match fut.await {
            Ok(v) => Ok(v),
            Err(e) => {
                if let Some(reason) = e.as_fatal_reason() {
                    self.fail(reason).await;
                }
                Err(e)
            }
        }
    }

    async fn offload_split(&self, batch: RecordBatch) -> Result<std::collections::BTreeMap<i32, RecordBatch>> {
        tokio::task::spawn_blocking(move || codec::split_by_partition(&batch, codec::PARTITION_COLUMN))
            .await
            .expect("split_by_partition task panicked")
    }

    async fn offload_serialize(&self, batch: RecordBatch) -> Result<Vec<u8>> {
        tokio::task::spawn_blocking(move || codec::serialize(&batch))
            .await
            .expect("serialize task panicked")
    }

    async fn offload_deserialize(&self, blobs: Vec<Vec<u8>>) -> Result<RecordBatch> {
        let schema = self.spec.schema.clone();
        tokio::task::spawn_blocking(move || codec::deserialize(&blobs, &schema))
            .await
            .expect("deserialize task panicked")
    }

    /// Splits `batch` by its `_partitions` column, routes each sub-batch to
    /// the Partition Store (if this worker owns the destination) or to the
    /// owning peer's Comm Buffer, and records `input_partition_index` as
    /// ingested. A repeated `input_partition_index` is a no-op (spec §4.5).
    /// `deadline`, if set, bounds the whole call (spec §5); elapsing it
    /// yields `ShuffleError::Timeout` without otherwise touching state.
    pub async fn add_partition(
        &self,
        batch: &RecordBatch,
        input_partition_index: u32,
        deadline: Option<Duration>,
    ) -> Result<()> {
        with_deadline(deadline, self.add_partition_inner(batch, input_partition_index)).await
    }

    async fn add_partition_inner(&self, batch: &RecordBatch, input_partition_index: u32) -> Result<()> {
        self.ensure_ingestable()?;
        {
            let mut ingested = self.ingested.lock();
            if !ingested.insert(input_partition_index) {
                return Ok(());
            }
        }

        let groups = self.or_fail(self.offload_split(batch.clone())).await?;
        for (key, sub_batch) in groups {
            let partition = key as u32;
            let owner = self.spec.worker_for.get(&partition).ok_or_else(|| {
                ShuffleError::Invalid(format!("no worker assigned for output partition {partition}"))
            })?;
            let bytes = self.or_fail(self.offload_serialize(sub_batch)).await?;
            self.metrics.add_written(bytes.len() as u64);

            if *owner == self.self_address {
                self.metrics.add_disk(bytes.len() as u64);
                self.or_fail(self.partition_store.append(partition, bytes)).await?;
            } else {
                let comm_buffer = self.comm_buffers.get(owner).ok_or_else(|| {
                    ShuffleError::Invalid(format!("no comm buffer for peer {owner}"))
                })?;
                self.or_fail(comm_buffer.write(partition, bytes)).await?;
            }
        }
        Ok(())
    }

    /// Inbound `shuffle_receive` handler: deserializes each blob, re-splits
    /// by `_partitions` (a sender may batch more than one destination
    /// partition into one blob), and appends every resulting sub-batch to
    /// the local Partition Store (spec §4.5).
    pub async fn receive(&self, payload: Vec<(u32, Vec<u8>)>) -> Result<()> {
        self.ensure_receivable()?;
        let _gate = self
            .receive_gate
            .acquire()
            .await
            .expect("receive gate semaphore never closes");

        for (_hint_partition, bytes) in payload {
            self.metrics.add_received(bytes.len() as u64);
            let batch = self.or_fail(self.offload_deserialize(vec![bytes])).await?;
            let groups = self.or_fail(self.offload_split(batch)).await?;
            for (key, sub_batch) in groups {
                let partition = key as u32;
                let bytes = self.or_fail(self.offload_serialize(sub_batch)).await?;
                self.metrics.add_disk(bytes.len() as u64);
                self.or_fail(self.partition_store.append(partition, bytes)).await?;
            }
        }
        Ok(())
    }

    /// Forwards to the Scheduler Plugin's barrier RPC; invoked on exactly
    /// one worker per shuffle (spec §4.5, §4.7). `deadline`, if set,
    /// propagates to the scheduler's per-participant fan-out timeout
    /// (spec §5, "Deadlines on barrier() propagate to participants via
    /// the scheduler") instead of the scheduler's own configured default.
    pub async fn barrier(&self, deadline: Option<Duration>) -> Result<()> {
        self.scheduler_transport
            .barrier(&self.shuffle_id, self.run_id, deadline)
            .await
    }

    /// Flushes every Comm Buffer, waits out any `receive` calls still in
    /// flight, and transitions `InputsDone -> Flushed`. Idempotent (spec
    /// §4.5, §9 "repeated close").
    pub async fn inputs_done(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match &*state {
                ShuffleRunState::Closed => return Err(self.err_closed()),
                ShuffleRunState::Failed(r) => return Err(self.err_failed(r.clone())),
                ShuffleRunState::InputsDone | ShuffleRunState::Flushed => return Ok(()),
                _ => *state = ShuffleRunState::InputsDone,
            }
        }

        if let Err(e) = futures::future::try_join_all(self.comm_buffers.values().map(|b| b.flush_all())).await {
            self.fail(FailureReason::Peer(e.to_string())).await;
            return Err(e);
        }

        // "await disk quiescence": take the receive gate wholesale so any
        // `receive` call still mid-flight must finish first.
        let gate = self
            .receive_gate
            .acquire_many(RECEIVE_GATE_PERMITS)
            .await
            .expect("receive gate semaphore never closes");
        drop(gate);

        {
            let mut state = self.state.lock();
            if matches!(*state, ShuffleRunState::InputsDone) {
                *state = ShuffleRunState::Flushed;
            }
        }
        log::debug!("shuffle run {}/{} flushed", self.shuffle_id, self.run_id);
        Ok(())
    }

    /// Reads, deserializes, and concatenates every batch ever appended to
    /// `output_partition`. `key` identifies the calling downstream task for
    /// tracing only (spec §4.5).
    pub async fn get_output_partition(
        &self,
        output_partition: u32,
        key: &str,
        deadline: Option<Duration>,
    ) -> Result<RecordBatch> {
        with_deadline(deadline, self.get_output_partition_inner(output_partition, key)).await
    }

    async fn get_output_partition_inner(&self, output_partition: u32, key: &str) -> Result<RecordBatch> {
        self.ensure_flushed()?;
        let owner = self.spec.worker_for.get(&output_partition).ok_or_else(|| {
            ShuffleError::Invalid(format!("no worker assigned for output partition {output_partition}"))
        })?;
        if *owner != self.self_address {
            return Err(ShuffleError::Invalid(format!(
                "output partition {output_partition} is owned by {owner}, not {}",
                self.self_address
            )));
        }
        log::debug!(
            "shuffle run {}/{}: fetching output partition {output_partition} for {key}",
            self.shuffle_id,
            self.run_id
        );
        let blobs = self.or_fail(self.partition_store.read(output_partition)).await?;
        self.or_fail(async { codec::deserialize(&blobs, &self.spec.schema) }).await
    }

    /// Normal teardown: cancels pending sends, releases permits, deletes
    /// the Partition Store directory, transitions to `Closed`. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ShuffleRunState::Closed) {
                return;
            }
            *state = ShuffleRunState::Closed;
        }
        self.teardown().await;
    }

    /// Unrecoverable failure: transitions to `Failed(reason)`; every
    /// pending and future caller observes the same reason. Idempotent —
    /// a run that is already `Closed`/`Failed` ignores a later `fail`.
    /// Eagerly notifies the scheduler of the failure (spec §7), which in
    /// turn instructs every other participant to fail with the same
    /// reason — so one worker's local fatal error can't leave the run
    /// half-failed across the cluster.
    pub async fn fail(&self, reason: FailureReason) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ShuffleRunState::Closed | ShuffleRunState::Failed(_)) {
                return;
            }
            log::error!(
                "shuffle run {}/{} failed: {reason}",
                self.shuffle_id,
                self.run_id
            );
            *state = ShuffleRunState::Failed(reason.clone());
        }
        self.teardown().await;
        if let Err(e) = self
            .scheduler_transport
            .report_failure(&self.shuffle_id, self.run_id, reason)
            .await
        {
            log::warn!(
                "shuffle run {}/{}: failed to notify scheduler of local failure: {e}",
                self.shuffle_id,
                self.run_id
            );
        }
    }

    async fn teardown(&self) {
        self.stop_heartbeat();
        for buffer in self.comm_buffers.values() {
            buffer.close_background();
        }
        self.memory_limiter.close();
        self.disk_limiter.close();
        self.partition_store.delete_all().await;
    }
}

impl Drop for ShuffleRun {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShuffleError;
    use crate::rpc::local::LocalNetwork;
    use crate::rpc::ShuffleAssignment;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex as AsyncMutex;

    fn schema() -> arrow::datatypes::SchemaRef {
        std::sync::Arc::new(Schema::new(vec![
            Field::new("x", DataType::Int32, true),
            Field::new(codec::PARTITION_COLUMN, DataType::Int32, true),
        ]))
    }

    fn batch(xs: &[i32], parts: &[Option<i32>]) -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                std::sync::Arc::new(Int32Array::from(xs.to_vec())),
                std::sync::Arc::new(Int32Array::from(parts.to_vec())),
            ],
        )
        .unwrap()
    }

    struct StubScheduler {
        heartbeats: AsyncMutex<Vec<Heartbeat>>,
        barrier_calls: std::sync::atomic::AtomicUsize,
        reported_failures: AsyncMutex<Vec<FailureReason>>,
    }

    impl StubScheduler {
        fn new() -> Self {
            Self {
                heartbeats: AsyncMutex::new(Vec::new()),
                barrier_calls: std::sync::atomic::AtomicUsize::new(0),
                reported_failures: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SchedulerTransport for StubScheduler {
        async fn get(&self, _shuffle_id: &ShuffleId, _worker: &WorkerAddress) -> Result<ShuffleAssignment> {
            Ok(ShuffleAssignment::NotParticipating)
        }

        async fn barrier(&self, _shuffle_id: &ShuffleId, _run_id: RunId, _deadline: Option<Duration>) -> Result<()> {
            self.barrier_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn heartbeat(&self, _shuffle_id: &ShuffleId, _run_id: RunId, heartbeat: Heartbeat) {
            self.heartbeats.lock().await.push(heartbeat);
        }

        async fn report_failure(
            &self,
            _shuffle_id: &ShuffleId,
            _run_id: RunId,
            reason: FailureReason,
        ) -> Result<()> {
            self.reported_failures.lock().await.push(reason);
            Ok(())
        }
    }

    fn one_worker_spec() -> ShuffleSpec {
        let mut worker_for = BTreeMap::new();
        worker_for.insert(0, WorkerAddress::new("w1"));
        worker_for.insert(1, WorkerAddress::new("w1"));
        ShuffleSpec {
            column: "x".into(),
            npartitions: 2,
            worker_for,
            schema: schema(),
        }
    }

    fn make_run(spec: ShuffleSpec, dir: &std::path::Path, network: Arc<LocalNetwork>) -> Arc<ShuffleRun> {
        ShuffleRun::new(
            ShuffleId::new("s1"),
            RunId::INITIAL,
            WorkerAddress::new("w1"),
            spec,
            ShuffleConfig::default(),
            dir.to_path_buf(),
            network.clone(),
            Arc::new(StubScheduler::new()),
        )
    }

    #[tokio::test]
    async fn add_partition_transitions_created_to_ingesting_and_routes_locally() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(LocalNetwork::new());
        let run = make_run(one_worker_spec(), dir.path(), network);

        assert_eq!(run.state(), ShuffleRunState::Created);
        run.add_partition(&batch(&[1, 2, 3, 4], &[Some(0), Some(1), Some(0), Some(1)]), 0, None)
            .await
            .unwrap();
        assert_eq!(run.state(), ShuffleRunState::Ingesting);

        run.inputs_done().await.unwrap();
        assert_eq!(run.state(), ShuffleRunState::Flushed);

        let p0 = run.get_output_partition(0, "task-a", None).await.unwrap();
        assert_eq!(p0.num_rows(), 2);
        let p1 = run.get_output_partition(1, "task-b", None).await.unwrap();
        assert_eq!(p1.num_rows(), 2);
    }

    #[tokio::test]
    async fn add_partition_is_idempotent_for_repeated_input_index() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(LocalNetwork::new());
        let run = make_run(one_worker_spec(), dir.path(), network);

        let b = batch(&[1, 2], &[Some(0), Some(0)]);
        run.add_partition(&b, 7, None).await.unwrap();
        run.add_partition(&b, 7, None).await.unwrap();
        run.inputs_done().await.unwrap();

        let p0 = run.get_output_partition(0, "k", None).await.unwrap();
        assert_eq!(p0.num_rows(), 2, "repeated input_partition_index must not duplicate rows");
    }

    #[tokio::test]
    async fn get_output_partition_before_flushed_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(LocalNetwork::new());
        let run = make_run(one_worker_spec(), dir.path(), network);
        let err = run.get_output_partition(0, "k", None).await.unwrap_err();
        assert!(matches!(err, ShuffleError::Invalid(_)));
    }

    #[tokio::test]
    async fn close_deletes_run_directory_and_transitions_closed() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(LocalNetwork::new());
        let run = make_run(one_worker_spec(), dir.path(), network);
        run.add_partition(&batch(&[1], &[Some(0)]), 0, None).await.unwrap();

        run.close().await;
        assert_eq!(run.state(), ShuffleRunState::Closed);

        let err = run.add_partition(&batch(&[2], &[Some(0)]), 1, None).await.unwrap_err();
        assert!(matches!(err, ShuffleError::Closed { .. }));
    }

    #[tokio::test]
    async fn fail_rejects_future_operations_with_same_reason() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(LocalNetwork::new());
        let run = make_run(one_worker_spec(), dir.path(), network);

        run.fail(FailureReason::Corrupt).await;
        assert!(matches!(run.state(), ShuffleRunState::Failed(FailureReason::Corrupt)));

        let err = run.add_partition(&batch(&[1], &[Some(0)]), 0, None).await.unwrap_err();
        match err {
            ShuffleError::Failed { reason, .. } => assert_eq!(reason, FailureReason::Corrupt),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_disk_exhaustion_fails_run_and_notifies_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(LocalNetwork::new());
        let scheduler = Arc::new(StubScheduler::new());
        let mut config = ShuffleConfig::default();
        config.disk_limit_bytes_per_run = 4; // smaller than any serialized batch

        let run = ShuffleRun::new(
            ShuffleId::new("s1"),
            RunId::INITIAL,
            WorkerAddress::new("w1"),
            one_worker_spec(),
            config,
            dir.path(),
            network,
            scheduler.clone(),
        );

        let err = run
            .add_partition(&batch(&[1, 2], &[Some(0), Some(1)]), 0, None)
            .await
            .unwrap_err();
        match err {
            ShuffleError::DiskFull { .. } => {}
            other => panic!("expected DiskFull, got {other:?}"),
        }

        assert!(
            matches!(run.state(), ShuffleRunState::Failed(FailureReason::DiskFull)),
            "a local disk-limit error must fail the whole run, not just the one call"
        );
        assert_eq!(
            scheduler.reported_failures.lock().await.as_slice(),
            &[FailureReason::DiskFull],
            "fail() must eagerly notify the scheduler (spec §7)"
        );

        // Every subsequent caller on this worker observes the same reason.
        let second = run.add_partition(&batch(&[3], &[Some(0)]), 1, None).await.unwrap_err();
        match second {
            ShuffleError::Failed { reason, .. } => assert_eq!(reason, FailureReason::DiskFull),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inputs_done_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(LocalNetwork::new());
        let run = make_run(one_worker_spec(), dir.path(), network);
        run.add_partition(&batch(&[1], &[Some(0)]), 0, None).await.unwrap();
        run.inputs_done().await.unwrap();
        run.inputs_done().await.unwrap();
        assert_eq!(run.state(), ShuffleRunState::Flushed);
    }

    #[tokio::test]
    async fn empty_shuffle_still_reaches_flushed_with_zero_row_output() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(LocalNetwork::new());
        let run = make_run(one_worker_spec(), dir.path(), network);
        run.inputs_done().await.unwrap();
        let out = run.get_output_partition(0, "k", None).await.unwrap();
        assert_eq!(out.num_rows(), 0);
        assert_eq!(out.schema(), schema());
    }

    #[tokio::test]
    async fn null_keyed_rows_bucket_into_partition_zero() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(LocalNetwork::new());
        let run = make_run(one_worker_spec(), dir.path(), network);
        run.add_partition(&batch(&[1, 2, 3], &[None, Some(1), None]), 0, None)
            .await
            .unwrap();
        run.inputs_done().await.unwrap();

        let p0 = run.get_output_partition(0, "k", None).await.unwrap();
        assert_eq!(p0.num_rows(), 2, "null-keyed rows must land in partition 0");
        let p1 = run.get_output_partition(1, "k", None).await.unwrap();
        assert_eq!(p1.num_rows(), 1);
    }

    #[tokio::test]
    async fn remote_shard_crosses_to_peer_via_comm_buffer_and_receive() {
        let network = Arc::new(LocalNetwork::new());
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let mut worker_for = BTreeMap::new();
        worker_for.insert(0, WorkerAddress::new("a"));
        worker_for.insert(1, WorkerAddress::new("b"));
        let spec = ShuffleSpec {
            column: "x".into(),
            npartitions: 2,
            worker_for,
            schema: schema(),
        };

        let run_a = ShuffleRun::new(
            ShuffleId::new("s1"),
            RunId::INITIAL,
            WorkerAddress::new("a"),
            spec.clone(),
            ShuffleConfig::default(),
            dir_a.path(),
            network.clone(),
            Arc::new(StubScheduler::new()),
        );
        let run_b = ShuffleRun::new(
            ShuffleId::new("s1"),
            RunId::INITIAL,
            WorkerAddress::new("b"),
            spec,
            ShuffleConfig::default(),
            dir_b.path(),
            network.clone(),
            Arc::new(StubScheduler::new()),
        );

        struct ProxyB {
            run: Arc<ShuffleRun>,
        }
        #[async_trait]
        impl crate::rpc::local::LocalWorker for ProxyB {
            async fn shuffle_receive(
                &self,
                _shuffle_id: &ShuffleId,
                _run_id: RunId,
                payload: Vec<(u32, Vec<u8>)>,
            ) -> Result<()> {
                self.run.receive(payload).await
            }
            async fn shuffle_inputs_done(&self, _shuffle_id: &ShuffleId, _run_id: RunId) -> Result<()> {
                self.run.inputs_done().await
            }
            async fn shuffle_fail(
                &self,
                _shuffle_id: &ShuffleId,
                _run_id: RunId,
                reason: FailureReason,
            ) -> Result<()> {
                self.run.fail(reason).await;
                Ok(())
            }
        }
        network.register(
            WorkerAddress::new("b"),
            Arc::new(ProxyB { run: run_b.clone() }),
        );

        run_a
            .add_partition(&batch(&[10, 11, 20, 21], &[Some(0), Some(0), Some(1), Some(1)]), 0, None)
            .await
            .unwrap();
        run_a.inputs_done().await.unwrap();
        run_b.inputs_done().await.unwrap();

        let p0 = run_a.get_output_partition(0, "k", None).await.unwrap();
        assert_eq!(p0.num_rows(), 2);
        let p1 = run_b.get_output_partition(1, "k", None).await.unwrap();
        assert_eq!(p1.num_rows(), 2);
    }
}
