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

//! Worker Plugin (C6): hosts every Shuffle Run on one worker, resolves
//! `(shuffle_id, run_id)` to a live run, and implements stale-run
//! detection and replacement (spec §4.6).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parking_lot::Mutex;

use shuffle_core::error::{FailureReason, Result, ShuffleError};
use shuffle_core::ids::{RunId, ShuffleId, WorkerAddress};
use shuffle_core::rpc::local::LocalWorker;
use shuffle_core::rpc::{PeerTransport, SchedulerTransport, ShardBatch, ShuffleAssignment};
use shuffle_core::{ShuffleConfig, ShuffleRun};

/// Hosts every Shuffle Run running on one worker. Exclusively owns the
/// `(ShuffleId -> ShuffleRun)` map; removing a run both closes it and
/// deletes its disk directory (spec §3 ownership, §4.6).
pub struct WorkerPlugin {
    address: WorkerAddress,
    local_dir: PathBuf,
    config: ShuffleConfig,
    scheduler: Arc<dyn SchedulerTransport>,
    peer_transport: Arc<dyn PeerTransport>,

    shuffles: Mutex<HashMap<ShuffleId, Arc<ShuffleRun>>>,
    /// Highest `RunId` this worker has ever observed per `ShuffleId`,
    /// retained even after the run it named is closed/replaced so a
    /// late, stale message can still be recognized as such.
    known_run_ids: Mutex<HashMap<ShuffleId, RunId>>,
}

impl WorkerPlugin {
    pub fn new(
        address: WorkerAddress,
        local_dir: impl Into<PathBuf>,
        config: ShuffleConfig,
        scheduler: Arc<dyn SchedulerTransport>,
        peer_transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            address,
            local_dir: local_dir.into(),
            config,
            scheduler,
            peer_transport,
            shuffles: Mutex::new(HashMap::new()),
            known_run_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    fn live_run(&self, shuffle_id: &ShuffleId) -> Option<Arc<ShuffleRun>> {
        self.shuffles.lock().get(shuffle_id).cloned()
    }

    fn run_dir(&self, shuffle_id: &ShuffleId, run_id: RunId) -> PathBuf {
        self.local_dir.join(format!("shuffle-{shuffle_id}-{run_id}"))
    }

    /// Returns the live run for `shuffle_id`, querying the Scheduler Plugin
    /// and instantiating one if none is cached yet. A `RunId` strictly
    /// newer than anything previously seen fails the old run with
    /// `Failed(Stale)` and replaces it (spec §4.6, scenario S4); a `RunId`
    /// equal to a previously-closed run is itself `Stale`.
    pub async fn get_or_create_shuffle(&self, shuffle_id: &ShuffleId) -> Result<Arc<ShuffleRun>> {
        if let Some(run) = self.live_run(shuffle_id) {
            return Ok(run);
        }

        let assignment = self.scheduler.get(shuffle_id, &self.address).await?;
        let (run_id, spec) = match assignment {
            ShuffleAssignment::Participating { run_id, spec } => (run_id, spec),
            ShuffleAssignment::NotParticipating => {
                return Err(ShuffleError::Invalid(format!(
                    "worker {} does not participate in shuffle {shuffle_id}",
                    self.address
                )));
            }
        };

        let previously_known = self.known_run_ids.lock().get(shuffle_id).copied();
        if let Some(known) = previously_known {
            if run_id <= known {
                return Err(ShuffleError::Stale {
                    shuffle_id: shuffle_id.clone(),
                    expected: known,
                    actual: run_id,
                });
            }
        }

        if let Some(old) = self.shuffles.lock().remove(shuffle_id) {
            log::warn!(
                "shuffle {shuffle_id}: replacing run {} with newer run {run_id}",
                old.run_id()
            );
            old.fail(FailureReason::Stale).await;
        }

        let run = ShuffleRun::new(
            shuffle_id.clone(),
            run_id,
            self.address.clone(),
            spec,
            self.config.clone(),
            self.run_dir(shuffle_id, run_id),
            self.peer_transport.clone(),
            self.scheduler.clone(),
        );

        self.shuffles.lock().insert(shuffle_id.clone(), run.clone());
        self.known_run_ids.lock().insert(shuffle_id.clone(), run_id);
        log::info!("shuffle {shuffle_id}: created run {run_id} on {}", self.address);
        Ok(run)
    }

    /// Looks up an already-cached run by its exact expected `RunId`.
    /// `Stale` if a different run id is cached or was last known; `Invalid`
    /// if `expected_run_id` exceeds any run id the scheduler has assigned
    /// (spec §4.6).
    pub fn get_shuffle_run(&self, shuffle_id: &ShuffleId, expected_run_id: RunId) -> Result<Arc<ShuffleRun>> {
        if let Some(run) = self.shuffles.lock().get(shuffle_id) {
            if run.run_id() == expected_run_id {
                return Ok(run.clone());
            }
            return Err(ShuffleError::Stale {
                shuffle_id: shuffle_id.clone(),
                expected: run.run_id(),
                actual: expected_run_id,
            });
        }

        match self.known_run_ids.lock().get(shuffle_id).copied() {
            Some(known) if expected_run_id > known => Err(ShuffleError::Invalid(format!(
                "run {expected_run_id} for shuffle {shuffle_id} exceeds any run this worker has observed (known {known})"
            ))),
            Some(known) => Err(ShuffleError::Stale {
                shuffle_id: shuffle_id.clone(),
                expected: known,
                actual: expected_run_id,
            }),
            None => Err(ShuffleError::Invalid(format!("unknown shuffle {shuffle_id}"))),
        }
    }

    /// `shuffle-transfer(input_idx, table)` (spec §6). `deadline` bounds
    /// the call (spec §5).
    pub async fn add_partition(
        &self,
        shuffle_id: &ShuffleId,
        table: &RecordBatch,
        input_partition_index: u32,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let run = self.get_or_create_shuffle(shuffle_id).await?;
        run.add_partition(table, input_partition_index, deadline).await
    }

    /// `shuffle-p2p(output_idx, ...)` (spec §6). `deadline` bounds the call
    /// (spec §5).
    pub async fn get_output_partition(
        &self,
        shuffle_id: &ShuffleId,
        output_partition: u32,
        key: &str,
        deadline: Option<Duration>,
    ) -> Result<RecordBatch> {
        let run = self.get_or_create_shuffle(shuffle_id).await?;
        run.get_output_partition(output_partition, key, deadline).await
    }

    /// Inbound `shuffle_receive` RPC. Resolves the current run for
    /// `shuffle_id`, then rejects with `Stale` if the message's `run_id`
    /// does not match it — out-of-date messages for a superseded run are
    /// discarded, not retried (spec §4.6).
    pub async fn shuffle_receive(&self, shuffle_id: &ShuffleId, run_id: RunId, payload: ShardBatch) -> Result<()> {
        let run = self.get_or_create_shuffle(shuffle_id).await?;
        if run.run_id() != run_id {
            log::debug!(
                "shuffle {shuffle_id}: discarding shuffle_receive for stale run {run_id} (current {})",
                run.run_id()
            );
            return Err(ShuffleError::Stale {
                shuffle_id: shuffle_id.clone(),
                expected: run.run_id(),
                actual: run_id,
            });
        }
        run.receive(payload).await
    }

    /// Inbound `shuffle_inputs_done` RPC, driven by the Scheduler Plugin's
    /// barrier fan-out.
    pub async fn shuffle_inputs_done(&self, shuffle_id: &ShuffleId, run_id: RunId) -> Result<()> {
        self.get_shuffle_run(shuffle_id, run_id)?.inputs_done().await
    }

    /// Inbound `shuffle_fail` RPC. Best-effort: a run already gone is not
    /// an error from the caller's perspective, there is simply nothing left
    /// to fail.
    pub async fn shuffle_fail(&self, shuffle_id: &ShuffleId, run_id: RunId, reason: FailureReason) -> Result<()> {
        if let Ok(run) = self.get_shuffle_run(shuffle_id, run_id) {
            run.fail(reason).await;
        }
        Ok(())
    }

    /// Worker lifecycle hook: closes every hosted run (spec §4.6).
    pub async fn shutdown(&self) {
        let runs: Vec<Arc<ShuffleRun>> = self.shuffles.lock().drain().map(|(_, run)| run).collect();
        for run in runs {
            run.close().await;
        }
    }
}

#[async_trait]
impl LocalWorker for WorkerPlugin {
    async fn shuffle_receive(&self, shuffle_id: &ShuffleId, run_id: RunId, payload: ShardBatch) -> Result<()> {
        WorkerPlugin::shuffle_receive(self, shuffle_id, run_id, payload).await
    }

    async fn shuffle_inputs_done(&self, shuffle_id: &ShuffleId, run_id: RunId) -> Result<()> {
        WorkerPlugin::shuffle_inputs_done(self, shuffle_id, run_id).await
    }

    async fn shuffle_fail(&self, shuffle_id: &ShuffleId, run_id: RunId, reason: FailureReason) -> Result<()> {
        WorkerPlugin::shuffle_fail(self, shuffle_id, run_id, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
    use shuffle_core::codec::PARTITION_COLUMN;
    use shuffle_core::rpc::local::LocalNetwork;
    use shuffle_core::rpc::ShuffleSpec;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("x", DataType::Int32, true),
            Field::new(PARTITION_COLUMN, DataType::Int32, true),
        ]))
    }

    fn batch(xs: &[i32], parts: &[Option<i32>]) -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int32Array::from(xs.to_vec())),
                Arc::new(Int32Array::from(parts.to_vec())),
            ],
        )
        .unwrap()
    }

    /// A scheduler double that hands out a strictly increasing run id each
    /// time `bump()` is called, modeling re-submission of the same
    /// logical shuffle (scenario S4).
    struct FakeScheduler {
        self_address: WorkerAddress,
        current_run_id: AtomicU64,
        heartbeats: AsyncMutex<usize>,
    }

    impl FakeScheduler {
        fn new(self_address: WorkerAddress) -> Self {
            Self {
                self_address,
                current_run_id: AtomicU64::new(1),
                heartbeats: AsyncMutex::new(0),
            }
        }

        fn bump(&self) -> RunId {
            RunId(self.current_run_id.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[async_trait]
    impl SchedulerTransport for FakeScheduler {
        async fn get(&self, _shuffle_id: &ShuffleId, worker: &WorkerAddress) -> Result<ShuffleAssignment> {
            if *worker != self.self_address {
                return Ok(ShuffleAssignment::NotParticipating);
            }
            let mut worker_for = BTreeMap::new();
            worker_for.insert(0, self.self_address.clone());
            worker_for.insert(1, self.self_address.clone());
            Ok(ShuffleAssignment::Participating {
                run_id: RunId(self.current_run_id.load(Ordering::SeqCst)),
                spec: ShuffleSpec {
                    column: "x".into(),
                    npartitions: 2,
                    worker_for,
                    schema: schema(),
                },
            })
        }

        async fn barrier(&self, _shuffle_id: &ShuffleId, _run_id: RunId, _deadline: Option<Duration>) -> Result<()> {
            Ok(())
        }

        async fn heartbeat(&self, _shuffle_id: &ShuffleId, _run_id: RunId, _heartbeat: shuffle_core::Heartbeat) {
            *self.heartbeats.lock().await += 1;
        }

        async fn report_failure(
            &self,
            _shuffle_id: &ShuffleId,
            _run_id: RunId,
            _reason: FailureReason,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn make_plugin(dir: &std::path::Path) -> (WorkerPlugin, Arc<FakeScheduler>) {
        let address = WorkerAddress::new("w1");
        let scheduler = Arc::new(FakeScheduler::new(address.clone()));
        let network = Arc::new(LocalNetwork::new());
        let plugin = WorkerPlugin::new(
            address,
            dir.to_path_buf(),
            ShuffleConfig::default(),
            scheduler.clone(),
            network,
        );
        (plugin, scheduler)
    }

    #[tokio::test]
    async fn get_or_create_shuffle_caches_the_live_run() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, _sched) = make_plugin(dir.path());
        let shuffle_id = ShuffleId::new("s1");

        let a = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();
        let b = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();
        assert_eq!(a.run_id(), b.run_id());
        assert_eq!(a.run_id(), RunId(1));
    }

    #[tokio::test]
    async fn newer_run_id_fails_old_run_as_stale_and_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, sched) = make_plugin(dir.path());
        let shuffle_id = ShuffleId::new("s1");

        let run1 = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();
        run1.add_partition(&batch(&[1], &[Some(0)]), 0, None).await.unwrap();

        sched.bump();
        let run2 = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();

        assert!(run2.run_id() > run1.run_id());
        assert!(matches!(
            run1.state(),
            shuffle_core::ShuffleRunState::Failed(shuffle_core::FailureReason::Stale)
        ));
    }

    #[tokio::test]
    async fn get_shuffle_run_rejects_stale_expected_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, sched) = make_plugin(dir.path());
        let shuffle_id = ShuffleId::new("s1");

        let run1 = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();
        sched.bump();
        let _run2 = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();

        let err = plugin.get_shuffle_run(&shuffle_id, run1.run_id()).unwrap_err();
        assert!(matches!(err, ShuffleError::Stale { .. }));
    }

    #[tokio::test]
    async fn get_shuffle_run_rejects_run_id_the_scheduler_never_assigned() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, _sched) = make_plugin(dir.path());
        let shuffle_id = ShuffleId::new("s1");
        let _run1 = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();

        let err = plugin.get_shuffle_run(&shuffle_id, RunId(99)).unwrap_err();
        assert!(matches!(err, ShuffleError::Invalid(_)));
    }

    #[tokio::test]
    async fn shuffle_receive_for_stale_run_id_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, sched) = make_plugin(dir.path());
        let shuffle_id = ShuffleId::new("s1");
        let run1 = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();
        sched.bump();
        let _run2 = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();

        let err = plugin
            .shuffle_receive(&shuffle_id, run1.run_id(), vec![(0, vec![1, 2, 3])])
            .await
            .unwrap_err();
        assert!(matches!(err, ShuffleError::Stale { .. }));
    }

    #[tokio::test]
    async fn single_worker_end_to_end_matches_scenario_s1() {
        // S1: one worker, 10 rows split across 2 output partitions.
        let dir = tempfile::tempdir().unwrap();
        let (plugin, _sched) = make_plugin(dir.path());
        let shuffle_id = ShuffleId::new("s1");

        let xs: Vec<i32> = (0..10).collect();
        let parts: Vec<Option<i32>> = xs.iter().map(|x| Some(x % 2)).collect();
        plugin.add_partition(&shuffle_id, &batch(&xs, &parts), 0, None).await.unwrap();

        let run = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();
        run.inputs_done().await.unwrap();

        let p0 = plugin.get_output_partition(&shuffle_id, 0, "k", None).await.unwrap();
        let p1 = plugin.get_output_partition(&shuffle_id, 1, "k", None).await.unwrap();
        assert_eq!(p0.num_rows(), 5);
        assert_eq!(p1.num_rows(), 5);
    }

    #[tokio::test]
    async fn shutdown_closes_every_hosted_run() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, _sched) = make_plugin(dir.path());
        let shuffle_id = ShuffleId::new("s1");
        let run = plugin.get_or_create_shuffle(&shuffle_id).await.unwrap();
        run.add_partition(&batch(&[1], &[Some(0)]), 0, None).await.unwrap();

        plugin.shutdown().await;
        assert_eq!(run.state(), shuffle_core::ShuffleRunState::Closed);
        assert!(plugin.get_shuffle_run(&shuffle_id, run.run_id()).is_err());
    }
}
