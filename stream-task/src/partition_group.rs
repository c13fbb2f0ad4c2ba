use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::DeserializationError;
use crate::extractor::{Deserializer, DeserializationPolicy, TimestampExtractor};
use crate::record::{RawRecord, StampedRecord, TopicPartition};
use crate::record_queue::RecordQueue;

/// Outcome of admitting a batch of raw records: the queue's new size, and the offsets of any
/// poison records dropped under `DeserializationPolicy::Skip`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AddRecordsOutcome {
    pub queue_size: usize,
    pub skipped_offsets: Vec<i64>,
}

/// A per-topic codec pair used by `PartitionGroup::add_raw_records` to deserialize a raw record
/// before timestamp extraction and admission.
pub struct TopicCodec {
    pub key_deserializer: Arc<dyn Deserializer>,
    pub value_deserializer: Arc<dyn Deserializer>,
}

/// Merges the per-partition `RecordQueue`s assigned to a task into a single time-ordered
/// logical stream (spec §4.3). The set of partitions is fixed at construction and never
/// changes during the task's lifetime.
pub struct PartitionGroup {
    queues: HashMap<TopicPartition, RecordQueue>,
    codecs: HashMap<String, TopicCodec>,
    extractor: Arc<dyn TimestampExtractor>,
    policy: DeserializationPolicy,
    stream_time: i64,
}

impl PartitionGroup {
    pub fn new(
        queues: HashMap<TopicPartition, RecordQueue>,
        codecs: HashMap<String, TopicCodec>,
        extractor: Arc<dyn TimestampExtractor>,
        policy: DeserializationPolicy,
    ) -> Self {
        Self {
            queues,
            codecs,
            extractor,
            policy,
            stream_time: -1,
        }
    }

    pub fn partitions(&self) -> impl Iterator<Item = &TopicPartition> {
        self.queues.keys()
    }

    pub fn contains(&self, partition: &TopicPartition) -> bool {
        self.queues.contains_key(partition)
    }

    /// Deserializes and admits each raw record into `partition`'s queue, returning the queue's
    /// new size and any offsets skipped under `DeserializationPolicy::Skip`. Timestamps are
    /// extracted from the deserialized key/value; a negative result is clamped to -1 so the
    /// record is processed but cannot advance stream time (spec §7).
    ///
    /// Under `DeserializationPolicy::Fail` (the default), the first key or value that fails to
    /// deserialize aborts the whole batch: none of its remaining records are admitted. Under
    /// `DeserializationPolicy::Skip`, a poison record is dropped and its offset is returned in
    /// `AddRecordsOutcome::skipped_offsets` instead, so the caller can still mark it consumed.
    pub fn add_raw_records(
        &mut self,
        partition: &TopicPartition,
        raw: impl IntoIterator<Item = RawRecord>,
    ) -> Result<AddRecordsOutcome, DeserializationError> {
        let codec = self
            .codecs
            .get(&partition.topic)
            .expect("partition topic must have a registered codec");
        let key_deserializer = codec.key_deserializer.clone();
        let value_deserializer = codec.value_deserializer.clone();
        let extractor = self.extractor.clone();
        let policy = self.policy;

        let queue = self
            .queues
            .get_mut(partition)
            .expect("partition must be assigned to this group");

        let mut outcome = AddRecordsOutcome {
            queue_size: queue.size(),
            skipped_offsets: Vec::new(),
        };
        for record in raw {
            let key = match key_deserializer.deserialize(&partition.topic, record.key.as_deref())
            {
                Ok(key) => key,
                Err(e) => match policy {
                    DeserializationPolicy::Fail => {
                        return Err(DeserializationError::Key(partition.clone(), e))
                    }
                    DeserializationPolicy::Skip => {
                        warn!(
                            partition = %partition,
                            offset = record.offset,
                            error = %e,
                            "dropping record with an undeserializable key"
                        );
                        outcome.skipped_offsets.push(record.offset);
                        continue;
                    }
                },
            };
            let value = match value_deserializer
                .deserialize(&partition.topic, record.value.as_deref())
            {
                Ok(value) => value,
                Err(e) => match policy {
                    DeserializationPolicy::Fail => {
                        return Err(DeserializationError::Value(partition.clone(), e))
                    }
                    DeserializationPolicy::Skip => {
                        warn!(
                            partition = %partition,
                            offset = record.offset,
                            error = %e,
                            "dropping record with an undeserializable value"
                        );
                        outcome.skipped_offsets.push(record.offset);
                        continue;
                    }
                },
            };

            let mut timestamp = extractor.extract(
                &partition.topic,
                key.as_ref(),
                value.as_ref(),
                queue.tracked_timestamp(),
            );
            if timestamp < 0 {
                warn!(
                    partition = %partition,
                    offset = record.offset,
                    "timestamp extractor returned a negative timestamp, clamping to -1"
                );
                timestamp = -1;
            }

            queue.add(StampedRecord {
                partition: partition.clone(),
                offset: record.offset,
                timestamp,
                key,
                value,
            });
            outcome.queue_size = queue.size();
        }

        Ok(outcome)
    }

    /// Returns the partition whose head record has the lowest timestamp, ties broken by the
    /// lowest partition id (spec §4.3 selection policy). Returns `None` iff every queue is
    /// empty.
    pub fn next_partition(&self) -> Option<TopicPartition> {
        self.queues
            .values()
            .filter_map(|q| q.peek().map(|r| (q.partition().clone(), r.timestamp)))
            .min_by(|(pa, ta), (pb, tb)| ta.cmp(tb).then_with(|| pa.partition.cmp(&pb.partition)))
            .map(|(p, _)| p)
    }

    /// Pops the head record of `partition`'s queue. Panics if the queue is empty or unknown;
    /// callers must have just obtained `partition` via `next_partition`.
    pub fn poll_record(&mut self, partition: &TopicPartition) -> StampedRecord {
        self.queues
            .get_mut(partition)
            .and_then(RecordQueue::poll)
            .expect("poll_record called on an empty or unknown partition")
    }

    pub fn source_node(&self, partition: &TopicPartition) -> usize {
        self.queues
            .get(partition)
            .expect("unknown partition")
            .source_node()
    }

    /// The minimum of `tracked_timestamp()` across all non-empty queues, clamped so it never
    /// regresses even if a late record lowers some queue's tracked minimum (spec §4.3
    /// monotonicity invariant). Held at its last value while every queue is empty.
    pub fn stream_time(&mut self) -> i64 {
        let current_min = self
            .queues
            .values()
            .filter(|q| !q.is_empty())
            .map(RecordQueue::tracked_timestamp)
            .min();

        if let Some(min) = current_min {
            self.stream_time = self.stream_time.max(min);
        }
        self.stream_time
    }

    pub fn num_buffered(&self, partition: &TopicPartition) -> usize {
        self.queues.get(partition).map(RecordQueue::size).unwrap_or(0)
    }

    pub fn num_buffered_total(&self) -> usize {
        self.queues.values().map(RecordQueue::size).sum()
    }

    /// Drops all buffered records from every queue, used by `StreamTask::close`.
    pub fn clear(&mut self) {
        for queue in self.queues.values_mut() {
            while queue.poll().is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{BytesPassthroughDeserializer, FnTimestampExtractor};
    use crate::record::DynValue;
    use bytes::Bytes;

    fn codec() -> TopicCodec {
        TopicCodec {
            key_deserializer: Arc::new(BytesPassthroughDeserializer),
            value_deserializer: Arc::new(BytesPassthroughDeserializer),
        }
    }

    fn extractor_from_timestamp_header() -> Arc<dyn TimestampExtractor> {
        // Tests encode the intended timestamp as the value bytes, parsed back out here.
        Arc::new(FnTimestampExtractor(|_topic, _key, value, _hint| {
            value
                .and_then(|v| v.downcast_ref::<Vec<u8>>())
                .and_then(|bytes| std::str::from_utf8(bytes).ok())
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(-1)
        }))
    }

    fn raw(offset: i64, timestamp: i64) -> RawRecord {
        RawRecord {
            offset,
            key: None,
            value: Some(Bytes::from(timestamp.to_string())),
        }
    }

    fn two_partition_group() -> PartitionGroup {
        let a = TopicPartition::new("topic", 0);
        let b = TopicPartition::new("topic", 1);
        let mut queues = HashMap::new();
        queues.insert(a.clone(), RecordQueue::new(a, 0));
        queues.insert(b.clone(), RecordQueue::new(b, 0));
        let mut codecs = HashMap::new();
        codecs.insert("topic".to_string(), codec());
        PartitionGroup::new(
            queues,
            codecs,
            extractor_from_timestamp_header(),
            DeserializationPolicy::Fail,
        )
    }

    /// Fails to deserialize any value whose single byte is `0xFF`, a stand-in for a poison
    /// record.
    struct PoisonValueDeserializer;

    impl Deserializer for PoisonValueDeserializer {
        fn deserialize(
            &self,
            _topic: &str,
            bytes: Option<&[u8]>,
        ) -> Result<Option<DynValue>, String> {
            match bytes {
                Some([0xFF]) => Err("poison byte".to_string()),
                other => BytesPassthroughDeserializer.deserialize(_topic, other),
            }
        }
    }

    fn poison_raw(offset: i64) -> RawRecord {
        RawRecord {
            offset,
            key: None,
            value: Some(Bytes::from_static(&[0xFF])),
        }
    }

    #[test]
    fn selects_lowest_head_timestamp_with_partition_tiebreak() {
        // Mirrors spec scenario S1's ordering expectation.
        let mut group = two_partition_group();
        let a = TopicPartition::new("topic", 0);
        let b = TopicPartition::new("topic", 1);

        group
            .add_raw_records(&a, vec![raw(0, 10), raw(1, 20), raw(2, 30)])
            .unwrap();
        group
            .add_raw_records(&b, vec![raw(0, 15), raw(1, 25)])
            .unwrap();

        let mut order = Vec::new();
        while let Some(p) = group.next_partition() {
            let record = group.poll_record(&p);
            order.push((p.partition, record.offset));
        }

        assert_eq!(order, vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2)]);
    }

    #[test]
    fn stream_time_never_regresses() {
        let mut group = two_partition_group();
        let a = TopicPartition::new("topic", 0);

        group.add_raw_records(&a, vec![raw(0, 100)]).unwrap();
        assert_eq!(group.stream_time(), 100);

        // A late record with a lower timestamp is accepted but must not move time backwards.
        group.add_raw_records(&a, vec![raw(1, 10)]).unwrap();
        assert_eq!(group.stream_time(), 100);
    }

    #[test]
    fn stream_time_holds_last_value_when_all_queues_drain() {
        let mut group = two_partition_group();
        let a = TopicPartition::new("topic", 0);

        group.add_raw_records(&a, vec![raw(0, 42)]).unwrap();
        assert_eq!(group.stream_time(), 42);
        group.poll_record(&a);
        assert_eq!(group.stream_time(), 42);
    }

    #[test]
    fn negative_extracted_timestamp_is_clamped() {
        let mut group = two_partition_group();
        let a = TopicPartition::new("topic", 0);
        group
            .add_raw_records(
                &a,
                vec![RawRecord {
                    offset: 0,
                    key: None,
                    value: None, // extractor falls back to -1 when there's no value
                }],
            )
            .unwrap();
        assert_eq!(group.num_buffered(&a), 1);
        assert_eq!(group.stream_time(), -1);
    }

    #[test]
    fn fail_policy_propagates_on_poison_record() {
        let a = TopicPartition::new("topic", 0);
        let mut queues = HashMap::new();
        queues.insert(a.clone(), RecordQueue::new(a.clone(), 0));
        let mut codecs = HashMap::new();
        codecs.insert(
            "topic".to_string(),
            TopicCodec {
                key_deserializer: Arc::new(BytesPassthroughDeserializer),
                value_deserializer: Arc::new(PoisonValueDeserializer),
            },
        );
        let mut group = PartitionGroup::new(
            queues,
            codecs,
            extractor_from_timestamp_header(),
            DeserializationPolicy::Fail,
        );

        let err = group.add_raw_records(&a, vec![poison_raw(0)]).unwrap_err();
        assert!(matches!(err, DeserializationError::Value(_, _)));
        assert_eq!(group.num_buffered(&a), 0);
    }

    #[test]
    fn skip_policy_drops_poison_record_and_reports_its_offset() {
        let a = TopicPartition::new("topic", 0);
        let mut queues = HashMap::new();
        queues.insert(a.clone(), RecordQueue::new(a.clone(), 0));
        let mut codecs = HashMap::new();
        codecs.insert(
            "topic".to_string(),
            TopicCodec {
                key_deserializer: Arc::new(BytesPassthroughDeserializer),
                value_deserializer: Arc::new(PoisonValueDeserializer),
            },
        );
        let mut group = PartitionGroup::new(
            queues,
            codecs,
            extractor_from_timestamp_header(),
            DeserializationPolicy::Skip,
        );

        let outcome = group
            .add_raw_records(&a, vec![poison_raw(0), raw(1, 10), poison_raw(2)])
            .unwrap();

        assert_eq!(outcome.skipped_offsets, vec![0, 2]);
        assert_eq!(outcome.queue_size, 1);
        assert_eq!(group.num_buffered(&a), 1);
        let record = group.poll_record(&a);
        assert_eq!(record.offset, 1);
    }
}
