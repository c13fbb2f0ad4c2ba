use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// A type-erased, cheaply-cloneable deserialized key or value. Forwarding a record to several
/// downstream children only needs to clone the `Arc`, not the underlying payload.
pub type DynValue = Arc<dyn Any + Send + Sync>;

/// Identifies one input or output partition: a topic name plus a partition index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A raw record as handed to us by the fetcher, before timestamp extraction. Key and value are
/// the wire-format bytes; `add_raw_records` deserializes them via the owning `RecordQueue`'s
/// source node before a `StampedRecord` is constructed.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

/// A raw record paired with a deserialized key/value and a millisecond timestamp. Immutable
/// once constructed. `timestamp` is the value produced by the task's `TimestampExtractor`,
/// already clamped to `-1` if negative (spec §7 "timestamp extractor returns negative").
#[derive(Clone)]
pub struct StampedRecord {
    pub partition: TopicPartition,
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<DynValue>,
    pub value: Option<DynValue>,
}

impl fmt::Debug for StampedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StampedRecord")
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
