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

//! Sharding Policy (C8): pure, deterministic mapping from output
//! partition to the worker that owns it.

use crate::ids::WorkerAddress;

/// Maps an output partition to the worker that owns it by dividing the
/// partition space into contiguous ranges of `ceil(npartitions / len(workers))`,
/// in order over the lexicographically-sorted worker list. Every worker
/// that runs this function over the same `workers_sorted` gets the same
/// answer.
///
/// `workers_sorted` must be sorted and non-empty; `partition` must be
/// `< npartitions`.
pub fn get_worker_for_range_sharding(
    npartitions: u32,
    partition: u32,
    workers_sorted: &[WorkerAddress],
) -> &WorkerAddress {
    assert!(!workers_sorted.is_empty(), "no workers to shard across");
    assert!(
        partition < npartitions,
        "partition {partition} out of range for {npartitions} partitions"
    );
    debug_assert!(
        workers_sorted.windows(2).all(|w| w[0] <= w[1]),
        "workers_sorted must be sorted"
    );

    let range_size = npartitions.div_ceil(workers_sorted.len() as u32).max(1);
    let idx = (partition / range_size) as usize;
    // npartitions may not divide evenly; clamp the final range to the last worker.
    &workers_sorted[idx.min(workers_sorted.len() - 1)]
}

/// Builds the full `output_partition -> worker` mapping for a shuffle,
/// sorting the worker list first so every caller's mapping is identical.
pub fn build_worker_for_map(
    npartitions: u32,
    workers: &[WorkerAddress],
) -> std::collections::BTreeMap<u32, WorkerAddress> {
    let mut sorted: Vec<WorkerAddress> = workers.to_vec();
    sorted.sort();
    (0..npartitions)
        .map(|p| (p, get_worker_for_range_sharding(npartitions, p, &sorted).clone()))
        .collect()
}
