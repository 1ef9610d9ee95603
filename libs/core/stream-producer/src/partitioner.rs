//! Partition assignment
//!
//! A partitioner is a pure function of (record, sequence number) into
//! `[0, shard_count)`. The only shared state is the [`SequenceCursor`] the
//! queue uses to number records as they are taken.

use crate::config::{PartitionStrategy, ShardCount};
use crate::record::Record;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable identifier of a partition as the log service sees it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    index: usize,
    key: String,
}

impl PartitionKey {
    pub fn new(index: usize, key: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Maps records to partitions.
pub trait Partitioner: Send + Sync {
    /// Partition index in `[0, shard_count)`; same inputs, same answer.
    fn assign(&self, record: &Record, sequence: u64) -> usize;

    fn shard_count(&self) -> usize;

    /// Key the log service uses for partition `index`.
    fn partition_key(&self, index: usize) -> PartitionKey {
        PartitionKey::new(index, format!("shard-{:04}", index))
    }

    fn name(&self) -> &'static str;
}

/// `sequence mod shard_count`; ignores content
#[derive(Debug, Clone)]
pub struct RoundRobinPartitioner {
    shards: ShardCount,
}

impl RoundRobinPartitioner {
    pub fn new(shards: ShardCount) -> Self {
        Self { shards }
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn assign(&self, _record: &Record, sequence: u64) -> usize {
        (sequence % self.shards.get() as u64) as usize
    }

    fn shard_count(&self) -> usize {
        self.shards.get()
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// murmur2 of the payload; identical payloads share a partition
#[derive(Debug, Clone)]
pub struct KeyHashPartitioner {
    shards: ShardCount,
}

impl KeyHashPartitioner {
    pub fn new(shards: ShardCount) -> Self {
        Self { shards }
    }
}

impl Partitioner for KeyHashPartitioner {
    fn assign(&self, record: &Record, _sequence: u64) -> usize {
        let positive = murmur2(record.payload()) & 0x7fff_ffff;
        (positive as usize) % self.shards.get()
    }

    fn shard_count(&self) -> usize {
        self.shards.get()
    }

    fn name(&self) -> &'static str {
        "key_hash"
    }
}

/// Build the partitioner for a configured strategy
pub fn build_partitioner(strategy: PartitionStrategy, shards: ShardCount) -> Arc<dyn Partitioner> {
    match strategy {
        PartitionStrategy::RoundRobin => Arc::new(RoundRobinPartitioner::new(shards)),
        PartitionStrategy::KeyHash => Arc::new(KeyHashPartitioner::new(shards)),
    }
}

/// Global publish sequence; one number per record taken by a worker
#[derive(Debug, Default)]
pub struct SequenceCursor(AtomicU64);

impl SequenceCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// murmur2, 32-bit, Kafka seed and mixing constants
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ (data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M) ^ k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if let Some(&first) = tail.first() {
        h ^= first as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(n: i64) -> ShardCount {
        ShardCount::new(n).unwrap()
    }

    #[test]
    fn test_round_robin_rotation() {
        let partitioner = RoundRobinPartitioner::new(shards(3));
        let record = Record::from("x");

        let assigned: Vec<usize> = (0..9).map(|seq| partitioner.assign(&record, seq)).collect();
        assert_eq!(assigned, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_is_idempotent() {
        let partitioner = RoundRobinPartitioner::new(shards(7));
        let a = Record::from("a");
        let b = Record::from("b");
        for seq in [0, 1, 13, u64::MAX] {
            assert_eq!(partitioner.assign(&a, seq), partitioner.assign(&b, seq));
            assert!(partitioner.assign(&a, seq) < 7);
        }
    }

    #[test]
    fn test_single_shard() {
        let partitioner = RoundRobinPartitioner::new(shards(1));
        let record = Record::from("x");
        assert!((0..100).all(|seq| partitioner.assign(&record, seq) == 0));
    }

    #[test]
    fn test_key_hash_is_content_affine() {
        let partitioner = KeyHashPartitioner::new(shards(16));
        let record = Record::from("{\"id\":42}");
        let first = partitioner.assign(&record, 0);
        assert!(first < 16);
        assert!((1..50).all(|seq| partitioner.assign(&record, seq) == first));
    }

    #[test]
    fn test_partition_key_format() {
        let partitioner = RoundRobinPartitioner::new(shards(2));
        let key = partitioner.partition_key(7);
        assert_eq!(key.as_str(), "shard-0007");
        assert_eq!(key.index(), 7);
        assert_eq!(key.to_string(), "shard-0007");
    }

    #[test]
    fn test_build_partitioner() {
        assert_eq!(
            build_partitioner(PartitionStrategy::RoundRobin, shards(2)).name(),
            "round_robin"
        );
        let hashed = build_partitioner(PartitionStrategy::KeyHash, shards(5));
        assert_eq!(hashed.name(), "key_hash");
        assert_eq!(hashed.shard_count(), 5);
    }

    #[test]
    fn test_sequence_cursor() {
        let cursor = SequenceCursor::new();
        assert_eq!(cursor.next(), 0);
        assert_eq!(cursor.next(), 1);
        assert_eq!(cursor.current(), 2);
    }

    #[test]
    fn test_murmur2_reference_values() {
        assert_eq!(murmur2(b""), 275646681);
        assert_eq!(murmur2(b"hello"), 1682149141);
    }
}
