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

//! Codec (C2): serialize/deserialize tabular shards and split a table by
//! its `_partitions` column, adapted from the `take`-kernel hash
//! partitioning in Ballista's `ShuffleWriterExec::execute_shuffle_write`.

use crate::error::{Result, ShuffleError};
use arrow::array::{Array, ArrayRef, Int32Array};
use arrow::compute::{concat_batches, take};
use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use std::collections::BTreeMap;
use std::io::Cursor;

/// Name of the precomputed output-partition column every input batch
/// carries (spec §3, ShuffleSpec.column is the *key* column; this is the
/// separate, already-bucketed partition id column).
pub const PARTITION_COLUMN: &str = "_partitions";

/// Serializes one batch as a self-contained Arrow IPC stream (schema
/// header, one record batch message, end-of-stream marker).
pub fn serialize(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, &batch.schema())?;
        writer.write(batch)?;
        writer.finish()?;
    }
    Ok(buf)
}

/// Reconstructs one table from a list of independently-framed byte blobs,
/// validating each one's schema against `schema` and concatenating the
/// results. Any parse failure or schema mismatch is `CorruptData` and
/// aborts the whole call — partial success is not offered.
pub fn deserialize(batches: &[Vec<u8>], schema: &SchemaRef) -> Result<RecordBatch> {
    let mut decoded = Vec::new();
    for (i, blob) in batches.iter().enumerate() {
        let cursor = Cursor::new(blob.as_slice());
        let reader = StreamReader::try_new(cursor, None)
            .map_err(|e| ShuffleError::CorruptData(format!("batch {i}: {e}")))?;
        for msg in reader {
            let batch =
                msg.map_err(|e| ShuffleError::CorruptData(format!("batch {i}: {e}")))?;
            if batch.schema().fields() != schema.fields() {
                return Err(ShuffleError::CorruptData(format!(
                    "batch {i}: schema mismatch: expected {:?}, got {:?}",
                    schema.fields(),
                    batch.schema().fields()
                )));
            }
            decoded.push(batch);
        }
    }
    if decoded.is_empty() {
        return Ok(RecordBatch::new_empty(schema.clone()));
    }
    concat_batches(schema, &decoded).map_err(ShuffleError::Arrow)
}

/// Splits `batch` by the integer values of `column`, preserving per-group
/// row order. Null keys are bucketed into partition `0` (spec §9, resolved).
pub fn split_by_partition(batch: &RecordBatch, column: &str) -> Result<BTreeMap<i32, RecordBatch>> {
    let col_idx = batch
        .schema()
        .index_of(column)
        .map_err(|_| ShuffleError::CorruptData(format!("missing partition column {column}")))?;
    let keys = batch
        .column(col_idx)
        .as_any()
        .downcast_ref::<Int32Array>()
        .ok_or_else(|| {
            ShuffleError::CorruptData(format!("partition column {column} is not Int32"))
        })?;

    let mut indices_by_key: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let key = if keys.is_null(row) { 0 } else { keys.value(row) };
        indices_by_key.entry(key).or_default().push(row as i32);
    }

    let schema = batch.schema();
    let mut out = BTreeMap::new();
    for (key, rows) in indices_by_key {
        let idx_array = Int32Array::from(rows);
        let columns: Vec<ArrayRef> = batch
            .columns()
            .iter()
            .map(|c| take(c.as_ref(), &idx_array, None).map_err(ShuffleError::Arrow))
            .collect::<Result<_>>()?;
        let sub_batch = RecordBatch::try_new(schema.clone(), columns)?;
        out.insert(key, sub_batch);
    }
    Ok(out)
}

/// Vertical concatenation of batches, preserving schema.
pub fn concat(batches: &[RecordBatch], schema: &SchemaRef) -> Result<RecordBatch> {
    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(schema.clone()));
    }
    concat_batches(schema, batches).map_err(ShuffleError::Arrow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn sample_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("x", DataType::Int32, true),
            Field::new("label", DataType::Utf8, true),
            Field::new(PARTITION_COLUMN, DataType::Int32, true),
        ]))
    }

    fn sample_batch(xs: &[i32], parts: &[Option<i32>]) -> RecordBatch {
        let schema = sample_schema();
        let labels: Vec<String> = xs.iter().map(|x| format!("row-{x}")).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(xs.to_vec())),
                Arc::new(StringArray::from(labels)),
                Arc::new(Int32Array::from(parts.to_vec())),
            ],
        )
        .unwrap()
    }

    #[test]
    fn serialize_deserialize_round_trip() {
        let batch = sample_batch(&[1, 2, 3], &[Some(0), Some(1), Some(0)]);
        let bytes = serialize(&batch).unwrap();
        let back = deserialize(&[bytes], &sample_schema()).unwrap();
        assert_eq!(back.num_rows(), 3);
        assert_eq!(back.schema(), batch.schema());
    }

    #[test]
    fn deserialize_concatenates_multiple_blobs() {
        let a = sample_batch(&[1], &[Some(0)]);
        let b = sample_batch(&[2, 3], &[Some(1), Some(0)]);
        let blobs = vec![serialize(&a).unwrap(), serialize(&b).unwrap()];
        let back = deserialize(&blobs, &sample_schema()).unwrap();
        assert_eq!(back.num_rows(), 3);
    }

    #[test]
    fn deserialize_rejects_truncated_bytes() {
        let batch = sample_batch(&[1], &[Some(0)]);
        let mut bytes = serialize(&batch).unwrap();
        bytes.truncate(bytes.len() / 2);
        let err = deserialize(&[bytes], &sample_schema()).unwrap_err();
        assert!(matches!(err, ShuffleError::CorruptData(_)));
    }

    #[test]
    fn split_by_partition_groups_rows_and_buckets_nulls_to_zero() {
        let batch = sample_batch(&[10, 20, 30, 40], &[Some(1), None, Some(0), Some(1)]);
        let groups = split_by_partition(&batch, PARTITION_COLUMN).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&0].num_rows(), 2); // 30 and the null (20)
        assert_eq!(groups[&1].num_rows(), 2); // 10 and 40

        let zero_xs = groups[&0]
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        let values: Vec<i32> = zero_xs.iter().flatten().collect();
        assert!(values.contains(&20));
        assert!(values.contains(&30));
    }

    #[test]
    fn concat_preserves_row_multiset() {
        let a = sample_batch(&[1, 2], &[Some(0), Some(0)]);
        let b = sample_batch(&[3], &[Some(0)]);
        let combined = concat(&[a, b], &sample_schema()).unwrap();
        assert_eq!(combined.num_rows(), 3);
    }
}
