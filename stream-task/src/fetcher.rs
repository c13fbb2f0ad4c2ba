use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::FetcherError;
use crate::record::TopicPartition;

/// The upstream collaborator that delivers raw records to a `StreamTask` and accepts its
/// backpressure and offset-commit signals (spec §6 "Upstream fetcher contract"). Implemented
/// by the owning thread's consumer client; only the contract used by the task loop is modeled
/// here.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Signals that `partition` should stop being delivered to `add_records` until `resume` is
    /// called. Idempotent; issued at most once per crossing of the pause watermark (spec §4.7).
    async fn pause(&self, partition: &TopicPartition);

    /// Signals that `partition` may resume delivery. Idempotent.
    async fn resume(&self, partition: &TopicPartition);

    /// Synchronously commits `offsets`, blocking until durable. The offset committed for a
    /// partition is the offset of the last fully processed record for it, per spec §6; callers
    /// reading offsets back are expected to add 1 to get the next offset to fetch.
    async fn commit(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<(), FetcherError>;
}
