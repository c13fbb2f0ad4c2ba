use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RecordCollectorError;
use crate::record::TopicPartition;

/// The downstream collaborator a `RecordCollector` sends produced records to (spec §6
/// "Downstream producer contract"). Modeled on `capture`'s `rdkafka`-backed sink, but the send
/// itself is async and fire-and-forget: the returned offset is only observed once the caller
/// awaits the handle, which `RecordCollector::flush` does on the caller's behalf.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Sends one record to `partition`, returning the offset the backend acknowledged it at.
    async fn send(
        &self,
        partition: &TopicPartition,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<i64, RecordCollectorError>;

    /// Blocks until the backend's own internal buffers are durable, mirroring
    /// `KafkaSink::flush`'s wrap of `FutureProducer::flush`. Called by
    /// `RecordCollector::flush` after all outstanding sends have been awaited.
    async fn flush(&self) -> Result<(), RecordCollectorError>;
}

/// Chooses the output partition for a record when a sink node does not pin one explicitly.
pub trait Partitioner: Send + Sync {
    fn partition(&self, topic: &str, key: Option<&[u8]>, num_partitions: i32) -> i32;
}

/// Hashes the key to a partition, falling back to partition 0 for keyless records. Adequate as
/// a default for tests and topologies that don't care about output partitioning.
#[derive(Default)]
pub struct KeyHashPartitioner;

impl Partitioner for KeyHashPartitioner {
    fn partition(&self, _topic: &str, key: Option<&[u8]>, num_partitions: i32) -> i32 {
        if num_partitions <= 0 {
            return 0;
        }
        match key {
            Some(bytes) => {
                let hash = bytes.iter().fold(0u64, |acc, b| {
                    acc.wrapping_mul(31).wrapping_add(*b as u64)
                });
                (hash % num_partitions as u64) as i32
            }
            None => 0,
        }
    }
}
