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

//! Core of the P2P dataframe shuffle engine: the per-run state machine and
//! its data path (sharding, codec, spill-to-disk, per-peer send batching),
//! plus the RPC seams the Worker Plugin and Scheduler Plugin wire up.
//!
//! This crate has no notion of a worker fleet or a scheduler; it is the
//! leaf components of the spec (C1-C5, C8) plus the trait interfaces (C6,
//! C7 are implemented in `shuffle-worker` and `shuffle-scheduler`).

pub mod codec;
pub mod comm_buffer;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod ids;
pub mod partition_store;
pub mod resource_limiter;
pub mod rpc;
pub mod sharding;
pub mod shuffle_run;

pub use config::ShuffleConfig;
pub use error::{FailureReason, Result, ShuffleError};
pub use heartbeat::{Heartbeat, RunMetrics};
pub use ids::{RunId, ShuffleId, WorkerAddress};
pub use rpc::{PeerTransport, SchedulerTransport, ShuffleAssignment, ShuffleSpec, WorkerControl};
pub use shuffle_run::{ShuffleRun, ShuffleRunState};
