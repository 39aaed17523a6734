// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Partition selection for published messages.

use crate::errors::PartitionError;

const FNV_OFFSET_BASIS_32: u32 = 0x811c_9dc5;
const FNV_PRIME_32: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash.
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS_32, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME_32)
    })
}

/// Picks the partition a record is sent to.
pub trait Partitioner: Send + Sync {
    fn partition(&self, key: Option<&[u8]>, partition_count: i32) -> Result<i32, PartitionError>;

    /// Whether the same key must always land on the same partition, even while some
    /// partitions are unavailable. When false the client is free to buffer and batch.
    fn requires_consistency(&self) -> bool;
}

/// Hashes keyed records with FNV-1a and spreads unkeyed records randomly.
#[derive(Debug, Default, Clone, Copy)]
pub struct InconsistentHashPartitioner;

impl Partitioner for InconsistentHashPartitioner {
    fn partition(&self, key: Option<&[u8]>, partition_count: i32) -> Result<i32, PartitionError> {
        if partition_count <= 0 {
            return Err(PartitionError::InvalidPartitionCount(partition_count));
        }
        match key {
            None => Ok(fastrand::i32(0..partition_count)),
            Some(key) => Ok(hash_to_partition(fnv1a_32(key), partition_count)),
        }
    }

    fn requires_consistency(&self) -> bool {
        false
    }
}

/// Reduces a hash to a partition index by taking the absolute value of its signed reading.
/// `i32::MIN` has no positive counterpart, so the magnitude is computed in `u32`.
fn hash_to_partition(hash: u32, partition_count: i32) -> i32 {
    let magnitude = (hash as i32).unsigned_abs();
    // the remainder is below partition_count, so it always fits
    (magnitude % partition_count.unsigned_abs()) as i32
}
