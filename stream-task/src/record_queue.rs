use std::collections::VecDeque;

use crate::record::{StampedRecord, TopicPartition};
use crate::timestamp_tracker::TimestampTracker;

/// A per-partition FIFO of `StampedRecord`s, with O(1) access to the lowest timestamp currently
/// buffered. Insertion order is never reordered by timestamp; cross-partition reordering is the
/// `PartitionGroup`'s job (spec §4.2).
pub struct RecordQueue {
    partition: TopicPartition,
    source_node: usize,
    records: VecDeque<StampedRecord>,
    tracker: TimestampTracker,
    highest_offset: i64,
}

impl RecordQueue {
    /// `source_node` is the topology node index that deserialized records for this partition's
    /// topic are dispatched to.
    pub fn new(partition: TopicPartition, source_node: usize) -> Self {
        Self {
            partition,
            source_node,
            records: VecDeque::new(),
            tracker: TimestampTracker::new(),
            highest_offset: -1,
        }
    }

    pub fn add(&mut self, record: StampedRecord) {
        self.tracker.add(record.offset, record.timestamp);
        self.highest_offset = self.highest_offset.max(record.offset);
        self.records.push_back(record);
    }

    pub fn poll(&mut self) -> Option<StampedRecord> {
        let popped = self.records.pop_front()?;
        self.tracker.remove(popped.offset);
        Some(popped)
    }

    /// Peek at the head record without removing it, used by `PartitionGroup::next_queue` to
    /// compare timestamps across partitions.
    pub fn peek(&self) -> Option<&StampedRecord> {
        self.records.front()
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn source_node(&self) -> usize {
        self.source_node
    }

    pub fn highest_offset(&self) -> i64 {
        self.highest_offset
    }

    pub fn tracked_timestamp(&self) -> i64 {
        self.tracker.get()
    }
}
