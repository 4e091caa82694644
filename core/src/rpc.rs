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

//! RPC seams. The cluster's message transport (retries, connections,
//! ordering) is an external collaborator (spec §1); these traits are the
//! interface it plugs into. Every method corresponds to one RPC listed in
//! spec §6.

use crate::error::Result;
use crate::heartbeat::Heartbeat;
use crate::ids::{RunId, ShuffleId, WorkerAddress};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use arrow::datatypes::SchemaRef;

/// One batch of shards destined for a single peer's shuffle run, as handed
/// to the peer's `shuffle_receive`. The `u32` is the sender's best guess at
/// destination output partition; the receiver re-derives the authoritative
/// routing from the `_partitions` column (spec §4.5).
pub type ShardBatch = Vec<(u32, Vec<u8>)>;

/// Immutable parameters of a run, as handed out by the Scheduler Plugin
/// (spec §3 ShuffleSpec, §4.7 `get`).
#[derive(Debug, Clone)]
pub struct ShuffleSpec {
    pub column: String,
    pub npartitions: u32,
    pub worker_for: BTreeMap<u32, WorkerAddress>,
    pub schema: SchemaRef,
}

/// What the Scheduler Plugin's `get` returns to a worker resolving a
/// shuffle lazily (spec §4.7).
#[derive(Debug, Clone)]
pub enum ShuffleAssignment {
    Participating { run_id: RunId, spec: ShuffleSpec },
    NotParticipating,
}

/// Comm Buffer → peer worker. One outstanding call per peer at a time
/// (spec §4.4).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn shuffle_receive(
        &self,
        peer: &WorkerAddress,
        shuffle_id: &ShuffleId,
        run_id: RunId,
        payload: ShardBatch,
    ) -> Result<()>;
}

/// Scheduler Plugin → participating worker, used to drive the barrier and
/// to propagate worker-loss failures (spec §4.7).
#[async_trait]
pub trait WorkerControl: Send + Sync {
    async fn inputs_done(
        &self,
        worker: &WorkerAddress,
        shuffle_id: &ShuffleId,
        run_id: RunId,
    ) -> Result<()>;

    async fn fail_run(
        &self,
        worker: &WorkerAddress,
        shuffle_id: &ShuffleId,
        run_id: RunId,
        reason: crate::error::FailureReason,
    ) -> Result<()>;
}

/// Worker → Scheduler Plugin (spec §4.6, §6).
#[async_trait]
pub trait SchedulerTransport: Send + Sync {
    async fn get(&self, shuffle_id: &ShuffleId, worker: &WorkerAddress) -> Result<ShuffleAssignment>;

    /// `deadline`, if set, overrides the scheduler's own configured
    /// per-participant fan-out timeout for this call only (spec §5).
    async fn barrier(&self, shuffle_id: &ShuffleId, run_id: RunId, deadline: Option<Duration>) -> Result<()>;

    async fn heartbeat(&self, shuffle_id: &ShuffleId, run_id: RunId, heartbeat: Heartbeat);

    /// Eagerly notifies the scheduler of a local fatal error so it can fail
    /// every other participant with the same reason (spec §7). Called from
    /// `ShuffleRun::fail`, never awaited on the hot ingest path.
    async fn report_failure(
        &self,
        shuffle_id: &ShuffleId,
        run_id: RunId,
        reason: crate::error::FailureReason,
    ) -> Result<()>;
}

/// In-process implementations of the three transports above, good enough
/// to exercise every worker/scheduler interaction in tests without a real
/// network. Lives behind `local` so production wiring (a real RPC client)
/// is a drop-in replacement.
pub mod local {
    use super::*;
    use crate::ids::WorkerAddress as Addr;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// A worker, as seen by the in-process network: something that can
    /// receive shards and be told to finish or fail a run.
    #[async_trait]
    pub trait LocalWorker: Send + Sync {
        async fn shuffle_receive(
            &self,
            shuffle_id: &ShuffleId,
            run_id: RunId,
            payload: ShardBatch,
        ) -> Result<()>;

        async fn shuffle_inputs_done(&self, shuffle_id: &ShuffleId, run_id: RunId) -> Result<()>;

        async fn shuffle_fail(
            &self,
            shuffle_id: &ShuffleId,
            run_id: RunId,
            reason: crate::error::FailureReason,
        ) -> Result<()>;
    }

    /// In-process registry of live workers, addressable by [`WorkerAddress`].
    /// Doubles as the `PeerTransport` and `WorkerControl` implementation used
    /// by tests: a `remove_worker`-style call just drops the entry, after
    /// which any further call to that address returns an error, modeling an
    /// unreachable peer.
    #[derive(Default, Clone)]
    pub struct LocalNetwork {
        workers: Arc<RwLock<HashMap<Addr, Arc<dyn LocalWorker>>>>,
    }

    impl LocalNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register(&self, address: WorkerAddress, worker: Arc<dyn LocalWorker>) {
            self.workers.write().insert(address, worker);
        }

        pub fn remove(&self, address: &WorkerAddress) {
            self.workers.write().remove(address);
        }

        fn lookup(&self, address: &WorkerAddress) -> Result<Arc<dyn LocalWorker>> {
            self.workers
                .read()
                .get(address)
                .cloned()
                .ok_or_else(|| crate::error::ShuffleError::Invalid(format!("no such worker: {address}")))
        }
    }

    #[async_trait]
    impl PeerTransport for LocalNetwork {
        async fn shuffle_receive(
            &self,
            peer: &WorkerAddress,
            shuffle_id: &ShuffleId,
            run_id: RunId,
            payload: ShardBatch,
        ) -> Result<()> {
            self.lookup(peer)?
                .shuffle_receive(shuffle_id, run_id, payload)
                .await
        }
    }

    #[async_trait]
    impl WorkerControl for LocalNetwork {
        async fn inputs_done(
            &self,
            worker: &WorkerAddress,
            shuffle_id: &ShuffleId,
            run_id: RunId,
        ) -> Result<()> {
            self.lookup(worker)?
                .shuffle_inputs_done(shuffle_id, run_id)
                .await
        }

        async fn fail_run(
            &self,
            worker: &WorkerAddress,
            shuffle_id: &ShuffleId,
            run_id: RunId,
            reason: crate::error::FailureReason,
        ) -> Result<()> {
            self.lookup(worker)?
                .shuffle_fail(shuffle_id, run_id, reason)
                .await
        }
    }
}
