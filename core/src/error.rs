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

//! Error taxonomy for the shuffle engine (spec §7).

use crate::ids::WorkerAddress;
use std::fmt;

/// The reason a shuffle run transitioned to `Failed`. Every participant
/// that observes the failure gets the same reason, not just the fact of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The scheduler observed a participating worker disappear.
    WorkerGone(WorkerAddress),
    /// The codec rejected an inbound or on-disk batch.
    Corrupt,
    /// The per-run disk limiter refused permanently.
    DiskFull,
    /// The per-run memory limiter refused permanently.
    MemoryExhausted,
    /// A peer RPC failed for a reason opaque to this run.
    Peer(String),
    /// The Worker Plugin observed a strictly newer `RunId` for this
    /// `ShuffleId` and is replacing this run (spec §4.6, scenario S4).
    Stale,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::WorkerGone(addr) => write!(f, "worker gone: {addr}"),
            FailureReason::Corrupt => write!(f, "corrupt shuffle data"),
            FailureReason::DiskFull => write!(f, "disk limit exceeded"),
            FailureReason::MemoryExhausted => write!(f, "memory limit exceeded"),
            FailureReason::Peer(msg) => write!(f, "peer error: {msg}"),
            FailureReason::Stale => write!(f, "superseded by a newer run"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShuffleError {
    /// The operation addressed a run superseded by a newer `RunId`.
    #[error("stale run for shuffle {shuffle_id}: expected run >= {expected:?}, saw {actual:?}")]
    Stale {
        shuffle_id: crate::ids::ShuffleId,
        expected: crate::ids::RunId,
        actual: crate::ids::RunId,
    },

    /// The run was closed normally; callers should re-initialize.
    #[error("shuffle run {shuffle_id}/{run_id} is closed")]
    Closed {
        shuffle_id: crate::ids::ShuffleId,
        run_id: crate::ids::RunId,
    },

    /// The run failed; every participant observes the same reason.
    #[error("shuffle run {shuffle_id}/{run_id} failed: {reason}")]
    Failed {
        shuffle_id: crate::ids::ShuffleId,
        run_id: crate::ids::RunId,
        reason: FailureReason,
    },

    /// The codec rejected the input outright (not tied to a specific run).
    #[error("corrupt shuffle data: {0}")]
    CorruptData(String),

    /// A limiter refused a disk byte request it can never satisfy.
    #[error("disk limit exceeded: requested {requested} bytes, capacity {capacity} bytes")]
    DiskFull { requested: u64, capacity: u64 },

    /// A limiter refused a memory byte request it can never satisfy.
    #[error("memory limit exceeded: requested {requested} bytes, capacity {capacity} bytes")]
    MemoryExhausted { requested: u64, capacity: u64 },

    /// A request named a run id the scheduler has never assigned, or a
    /// protocol precondition was otherwise violated.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Caller-supplied deadline elapsed before the operation completed.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

pub type Result<T> = std::result::Result<T, ShuffleError>;

impl ShuffleError {
    pub fn is_stale(&self) -> bool {
        matches!(self, ShuffleError::Stale { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ShuffleError::Closed { .. })
    }

    /// The `FailureReason` a `ShuffleRun` should transition to and report
    /// to the scheduler (spec §7) when this error surfaces from its own
    /// local work, or `None` when the error already reflects a state the
    /// run (or the caller) is otherwise handling — a repeat observation of
    /// an already-`Failed`/`Closed`/`Stale` run, or a caller deadline that
    /// elapsed without anything actually going wrong locally.
    pub fn as_fatal_reason(&self) -> Option<FailureReason> {
        match self {
            ShuffleError::CorruptData(_) | ShuffleError::Arrow(_) => Some(FailureReason::Corrupt),
            ShuffleError::DiskFull { .. } => Some(FailureReason::DiskFull),
            ShuffleError::MemoryExhausted { .. } => Some(FailureReason::MemoryExhausted),
            ShuffleError::Io(e) => Some(FailureReason::Peer(e.to_string())),
            ShuffleError::Invalid(msg) => Some(FailureReason::Peer(msg.clone())),
            ShuffleError::Stale { .. }
            | ShuffleError::Closed { .. }
            | ShuffleError::Failed { .. }
            | ShuffleError::Timeout(_) => None,
        }
    }
}
