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

//! Scheduler Plugin (C7): assigns run ids, maintains the output-worker
//! mapping, drives the barrier, and reacts to worker loss (spec §4.7).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use parking_lot::Mutex;

use shuffle_core::error::{FailureReason, Result, ShuffleError};
use shuffle_core::ids::{RunId, ShuffleId, WorkerAddress};
use shuffle_core::rpc::{SchedulerTransport, ShuffleAssignment, ShuffleSpec, WorkerControl};
use shuffle_core::sharding;
use shuffle_core::Heartbeat;

/// Scheduler-side bookkeeping for one shuffle (spec §4.7).
#[derive(Debug, Clone)]
pub struct ShuffleState {
    pub run_id: RunId,
    pub column: String,
    pub participating_workers: BTreeSet<WorkerAddress>,
    pub worker_for: BTreeMap<u32, WorkerAddress>,
    pub schema: SchemaRef,
    pub status: ShuffleStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShuffleStatus {
    Running,
    Failed(FailureReason),
}

/// Tunables for the Scheduler Plugin. Not part of the per-run
/// `ShuffleConfig` (spec §6) — these govern scheduler-side coordination,
/// not a single run's data path.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Deadline for each participant's `inputs_done` call during a
    /// barrier fan-out. A participant that doesn't respond in time is
    /// treated exactly like one that's known to be gone (spec §5
    /// "every externally visible blocking operation accepts a deadline";
    /// SPEC_FULL §9 restart-tolerance).
    pub barrier_timeout: Duration,
    /// Number of most-recent heartbeats retained per shuffle.
    pub heartbeat_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            barrier_timeout: Duration::from_secs(30),
            heartbeat_history: 32,
        }
    }
}

/// The scheduler-side coordinator. One instance serves every shuffle in
/// the cluster.
pub struct SchedulerPlugin {
    config: SchedulerConfig,
    worker_control: Arc<dyn WorkerControl>,
    states: Mutex<HashMap<ShuffleId, ShuffleState>>,
    heartbeats: Mutex<HashMap<ShuffleId, VecDeque<Heartbeat>>>,
}

impl SchedulerPlugin {
    pub fn new(worker_control: Arc<dyn WorkerControl>, config: SchedulerConfig) -> Self {
        Self {
            config,
            worker_control,
            states: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a `run_id` for `shuffle_id` (1 if new, else one greater
    /// than the last run of the same logical shuffle) and computes
    /// `worker_for` over `live_workers` via the Sharding Policy (spec §4.7).
    /// Re-executing the same `ShuffleId` later always yields a strictly
    /// larger `run_id`, even if `live_workers` is unchanged.
    pub fn assign(
        &self,
        shuffle_id: &ShuffleId,
        column: String,
        npartitions: u32,
        schema: SchemaRef,
        live_workers: &[WorkerAddress],
    ) -> RunId {
        let mut states = self.states.lock();
        let run_id = match states.get(shuffle_id) {
            Some(existing) => existing.run_id.next(),
            None => RunId::INITIAL,
        };
        let worker_for = sharding::build_worker_for_map(npartitions, live_workers);
        let participating_workers: BTreeSet<WorkerAddress> = worker_for.values().cloned().collect();

        log::info!("shuffle {shuffle_id}: assigned run {run_id} across {} workers", participating_workers.len());
        states.insert(
            shuffle_id.clone(),
            ShuffleState {
                run_id,
                column,
                participating_workers,
                worker_for,
                schema,
                status: ShuffleStatus::Running,
            },
        );
        run_id
    }

    /// Current state of a shuffle, if the scheduler still has one (spec §8
    /// property 5 relies on this being empty after worker loss clears it).
    pub fn state_of(&self, shuffle_id: &ShuffleId) -> Option<ShuffleState> {
        self.states.lock().get(shuffle_id).cloned()
    }

    pub fn heartbeats_of(&self, shuffle_id: &ShuffleId) -> Vec<Heartbeat> {
        self.heartbeats
            .lock()
            .get(shuffle_id)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Marks `shuffle_id` `Failed(reason)` and instructs every
    /// participant to fail its run with the same reason. Best-effort: a
    /// participant that can't be reached (it may be the one that's gone)
    /// is simply skipped.
    async fn fail_shuffle(&self, shuffle_id: &ShuffleId, reason: FailureReason) {
        let (run_id, participants) = {
            let mut states = self.states.lock();
            match states.get_mut(shuffle_id) {
                Some(state) => {
                    state.status = ShuffleStatus::Failed(reason.clone());
                    (state.run_id, state.participating_workers.clone())
                }
                None => return,
            }
        };

        log::warn!("shuffle {shuffle_id}: failing run {run_id}: {reason}");
        for worker in &participants {
            let _ = self
                .worker_control
                .fail_run(worker, shuffle_id, run_id, reason.clone())
                .await;
        }
    }

    /// Worker-removal hook (spec §4.7): fails every shuffle the departed
    /// worker participates in and clears the scheduler's state for it. Any
    /// barrier concurrently in flight for one of those shuffles observes
    /// the failure independently when its own fan-out call to `address`
    /// errors out.
    pub async fn remove_worker(&self, address: &WorkerAddress) {
        let affected: Vec<ShuffleId> = {
            let states = self.states.lock();
            states
                .iter()
                .filter(|(_, state)| state.participating_workers.contains(address))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for shuffle_id in affected {
            self.fail_shuffle(&shuffle_id, FailureReason::WorkerGone(address.clone())).await;
            self.states.lock().remove(&shuffle_id);
        }
    }
}

#[async_trait]
impl SchedulerTransport for SchedulerPlugin {
    async fn get(&self, shuffle_id: &ShuffleId, worker: &WorkerAddress) -> Result<ShuffleAssignment> {
        let state = self.states.lock().get(shuffle_id).cloned();
        match state {
            Some(state) if state.participating_workers.contains(worker) => {
                if let ShuffleStatus::Failed(reason) = state.status {
                    return Err(ShuffleError::Failed {
                        shuffle_id: shuffle_id.clone(),
                        run_id: state.run_id,
                        reason,
                    });
                }
                Ok(ShuffleAssignment::Participating {
                    run_id: state.run_id,
                    spec: ShuffleSpec {
                        column: state.column,
                        npartitions: state.worker_for.len() as u32,
                        worker_for: state.worker_for,
                        schema: state.schema,
                    },
                })
            }
            _ => Ok(ShuffleAssignment::NotParticipating),
        }
    }

    /// Verifies `run_id` matches the current assignment, then fans the
    /// barrier out to every participant's `inputs_done`, with a deadline
    /// per participant. Any participant erroring or timing out fails the
    /// whole shuffle with `WorkerGone` and fails every other participant
    /// in turn (spec §4.7; SPEC_FULL §9 restart tolerance). `deadline`, if
    /// set, overrides `SchedulerConfig::barrier_timeout` for this call.
    async fn barrier(&self, shuffle_id: &ShuffleId, run_id: RunId, deadline: Option<Duration>) -> Result<()> {
        let (current_run, participants) = {
            let states = self.states.lock();
            match states.get(shuffle_id) {
                Some(state) => (state.run_id, state.participating_workers.clone()),
                None => return Err(ShuffleError::Invalid(format!("unknown shuffle {shuffle_id}"))),
            }
        };
        if run_id != current_run {
            return Err(ShuffleError::Stale {
                shuffle_id: shuffle_id.clone(),
                expected: current_run,
                actual: run_id,
            });
        }

        let outcomes = futures::future::join_all(participants.iter().map(|worker| {
            let worker = worker.clone();
            let control = self.worker_control.clone();
            let timeout = deadline.unwrap_or(self.config.barrier_timeout);
            let shuffle_id = shuffle_id.clone();
            async move {
                let outcome = tokio::time::timeout(timeout, control.inputs_done(&worker, &shuffle_id, run_id)).await;
                (worker, outcome)
            }
        }))
        .await;

        let mut gone: Option<WorkerAddress> = None;
        for (worker, outcome) in outcomes {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("shuffle {shuffle_id}: barrier participant {worker} failed: {e}");
                    gone = Some(worker);
                    break;
                }
                Err(_elapsed) => {
                    log::warn!("shuffle {shuffle_id}: barrier participant {worker} timed out");
                    gone = Some(worker);
                    break;
                }
            }
        }

        if let Some(worker) = gone {
            let reason = FailureReason::WorkerGone(worker);
            self.fail_shuffle(shuffle_id, reason.clone()).await;
            self.states.lock().remove(shuffle_id);
            return Err(ShuffleError::Failed {
                shuffle_id: shuffle_id.clone(),
                run_id,
                reason,
            });
        }

        log::debug!("shuffle {shuffle_id}: barrier for run {run_id} succeeded");
        Ok(())
    }

    async fn heartbeat(&self, shuffle_id: &ShuffleId, _run_id: RunId, heartbeat: Heartbeat) {
        let mut heartbeats = self.heartbeats.lock();
        let history = heartbeats.entry(shuffle_id.clone()).or_default();
        history.push_back(heartbeat);
        while history.len() > self.config.heartbeat_history {
            history.pop_front();
        }
    }

    /// A participant is eagerly reporting its own local fatal error (spec
    /// §7) rather than waiting for the next barrier or heartbeat to surface
    /// it. Fails the whole shuffle with the same reason, exactly like a
    /// barrier-detected failure. Ignored if this shuffle has already moved
    /// past `run_id` (the report raced a newer assignment) or the scheduler
    /// has no record of it at all (e.g. it already failed independently).
    async fn report_failure(&self, shuffle_id: &ShuffleId, run_id: RunId, reason: FailureReason) -> Result<()> {
        let current_run = self.states.lock().get(shuffle_id).map(|state| state.run_id);
        if current_run != Some(run_id) {
            return Ok(());
        }
        self.fail_shuffle(shuffle_id, reason).await;
        self.states.lock().remove(shuffle_id);
        Ok(())
    }
}
