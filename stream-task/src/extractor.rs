use crate::record::DynValue;

/// Deserializes the raw wire-format bytes of a key or value into a type-erased object, as a
/// source node's registered codec would.
pub trait Deserializer: Send + Sync {
    fn deserialize(&self, topic: &str, bytes: Option<&[u8]>) -> Result<Option<DynValue>, String>;
}

/// Passes raw bytes through unchanged, wrapped as `DynValue`. Useful as a default for topics
/// whose processor nodes work directly on bytes.
pub struct BytesPassthroughDeserializer;

impl Deserializer for BytesPassthroughDeserializer {
    fn deserialize(&self, _topic: &str, bytes: Option<&[u8]>) -> Result<Option<DynValue>, String> {
        Ok(bytes.map(|b| {
            let owned: std::sync::Arc<dyn std::any::Any + Send + Sync> =
                std::sync::Arc::new(b.to_vec());
            owned
        }))
    }
}

/// Governs how `PartitionGroup::add_raw_records` reacts to a record whose key or value fails to
/// deserialize (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeserializationPolicy {
    /// Propagate the deserialization error, rejecting the whole batch passed to `add_records`.
    #[default]
    Fail,
    /// Drop the poison record instead of admitting it, recording its offset so the caller can
    /// mark it consumed without ever handing it to a node's `process`.
    Skip,
}

/// Extracts the logical timestamp used for stream-time advancement from a deserialized record.
/// A negative return value is clamped to `-1` by the caller (spec §7): the record is still
/// processed, but does not advance stream time.
pub trait TimestampExtractor: Send + Sync {
    fn extract(
        &self,
        topic: &str,
        key: Option<&DynValue>,
        value: Option<&DynValue>,
        partition_time_hint: i64,
    ) -> i64;
}

/// Adapts a plain closure into a `TimestampExtractor`, for tests and simple topologies.
pub struct FnTimestampExtractor<F>(pub F)
where
    F: Fn(&str, Option<&DynValue>, Option<&DynValue>, i64) -> i64 + Send + Sync;

impl<F> TimestampExtractor for FnTimestampExtractor<F>
where
    F: Fn(&str, Option<&DynValue>, Option<&DynValue>, i64) -> i64 + Send + Sync,
{
    fn extract(
        &self,
        topic: &str,
        key: Option<&DynValue>,
        value: Option<&DynValue>,
        partition_time_hint: i64,
    ) -> i64 {
        (self.0)(topic, key, value, partition_time_hint)
    }
}
