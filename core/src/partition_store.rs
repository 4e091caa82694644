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

//! Partition Store (C3): per-output-partition append-only on-disk
//! accumulator, one directory per run, one file per partition.
//!
//! Each `append` writes an 8-byte little-endian length prefix followed by
//! the batch bytes, so `read` can hand back the original list of byte
//! blobs a caller handed to `append` (the Codec's `deserialize` takes a
//! `list<bytes>`, not one concatenated blob).

use crate::error::Result;
use crate::resource_limiter::{LimiterKind, ResourceLimiter};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One run's worth of on-disk partition files, exclusive to that run —
/// no cross-run directory sharing (spec §5).
pub struct PartitionStore {
    run_dir: PathBuf,
    disk_limiter: Arc<ResourceLimiter>,
    /// One lock per partition file so concurrent appends to *different*
    /// partitions don't contend, while appends to the *same* partition
    /// are serialized (spec §4.3).
    files: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl PartitionStore {
    pub fn new(run_dir: impl Into<PathBuf>, disk_limiter: Arc<ResourceLimiter>) -> Self {
        Self {
            run_dir: run_dir.into(),
            disk_limiter,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn partition_path(&self, output_partition: u32) -> PathBuf {
        self.run_dir.join(output_partition.to_string())
    }

    async fn partition_lock(&self, output_partition: u32) -> Arc<Mutex<()>> {
        let mut files = self.files.lock().await;
        files
            .entry(output_partition)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires `len(bytes)` disk permits, then appends one length-framed
    /// record to the partition's file, creating the run directory and
    /// file lazily. Fails with `DiskFull` if the limiter refuses
    /// permanently (spec §4.3).
    pub async fn append(&self, output_partition: u32, bytes: Vec<u8>) -> Result<()> {
        let _permit = self.disk_limiter.acquire(bytes.len() as u64).await?;
        let lock = self.partition_lock(output_partition).await;
        let _guard = lock.lock().await;

        let path = self.partition_path(output_partition);
        let run_dir = self.run_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&run_dir)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(&(bytes.len() as u64).to_le_bytes())?;
            file.write_all(&bytes)?;
            Ok(())
        })
        .await
        .expect("partition store append task panicked")?;

        log::debug!(
            "partition store: appended {} bytes to partition {output_partition} in {:?}",
            bytes.len(),
            self.run_dir
        );
        Ok(())
    }

    /// Returns every batch previously appended to `output_partition`, in
    /// write order. Idempotent and may be called repeatedly; an absent
    /// file (nothing ever appended) is an empty list, not an error.
    pub async fn read(&self, output_partition: u32) -> Result<Vec<Vec<u8>>> {
        let path = self.partition_path(output_partition);
        tokio::task::spawn_blocking(move || -> Result<Vec<Vec<u8>>> {
            let mut file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut out = Vec::new();
            loop {
                let mut len_buf = [0u8; 8];
                match file.read_exact(&mut len_buf) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
                let len = u64::from_le_bytes(len_buf) as usize;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)?;
                out.push(buf);
            }
            Ok(out)
        })
        .await
        .expect("partition store read task panicked")
    }

    /// Best-effort removal of the whole run directory. Never fails the
    /// caller: a run is ephemeral, and by the time this runs the run has
    /// already transitioned to `Closed`/`Failed`.
    pub async fn delete_all(&self) {
        let run_dir = self.run_dir.clone();
        let result = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&run_dir)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Ok(Err(e)) => log::warn!("partition store: best-effort delete failed: {e}"),
            Err(e) => log::warn!("partition store: delete task panicked: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> Arc<ResourceLimiter> {
        Arc::new(ResourceLimiter::new(LimiterKind::Disk, 1024 * 1024))
    }

    #[tokio::test]
    async fn append_then_read_preserves_order_and_framing() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::new(dir.path(), limiter());

        store.append(0, b"first".to_vec()).await.unwrap();
        store.append(0, b"second".to_vec()).await.unwrap();
        store.append(1, b"other-partition".to_vec()).await.unwrap();

        let p0 = store.read(0).await.unwrap();
        assert_eq!(p0, vec![b"first".to_vec(), b"second".to_vec()]);

        let p1 = store.read(1).await.unwrap();
        assert_eq!(p1, vec![b"other-partition".to_vec()]);
    }

    #[tokio::test]
    async fn read_of_never_appended_partition_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::new(dir.path(), limiter());
        assert!(store.read(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::new(dir.path(), limiter());
        store.append(0, b"x".to_vec()).await.unwrap();
        let first = store.read(0).await.unwrap();
        let second = store.read(0).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn delete_all_removes_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("shuffle-1-1");
        let store = PartitionStore::new(&run_dir, limiter());
        store.append(0, b"x".to_vec()).await.unwrap();
        assert!(run_dir.exists());

        store.delete_all().await;
        assert!(!run_dir.exists());
    }

    #[tokio::test]
    async fn delete_all_on_nonexistent_dir_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("never-created");
        let store = PartitionStore::new(&run_dir, limiter());
        store.delete_all().await; // must not panic
    }

    #[tokio::test]
    async fn append_beyond_disk_limit_fails() {
        let small_limiter = Arc::new(ResourceLimiter::new(LimiterKind::Disk, 4));
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::new(dir.path(), small_limiter);
        let err = store.append(0, b"too many bytes".to_vec()).await.unwrap_err();
        assert!(matches!(err, crate::error::ShuffleError::DiskFull { .. }));
    }
}
