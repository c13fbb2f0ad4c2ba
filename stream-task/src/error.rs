use thiserror::Error;

use crate::record::TopicPartition;

/// Errors a `TimestampExtractor` or `Deserializer` can raise while admitting a raw record
/// into a `RecordQueue`.
#[derive(Error, Debug)]
pub enum DeserializationError {
    #[error("failed to deserialize key for {0}: {1}")]
    Key(TopicPartition, String),
    #[error("failed to deserialize value for {0}: {1}")]
    Value(TopicPartition, String),
}

/// Errors surfaced by the upstream `Fetcher` collaborator.
#[derive(Error, Debug)]
pub enum FetcherError {
    #[error("commit of consumed offsets timed out")]
    CommitTimeout,
    #[error("fetcher commit failed: {0}")]
    CommitFailed(String),
}

/// Errors surfaced by the `RecordCollector` / downstream `Producer` collaborator.
#[derive(Error, Debug)]
pub enum RecordCollectorError {
    #[error("failed to send record to {0}: {1}")]
    SendFailed(TopicPartition, String),
    #[error("flush of produced records failed: {0}")]
    FlushFailed(String),
}

/// Errors surfaced by the local `StateManager` collaborator.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to flush local state: {0}")]
    FlushFailed(String),
}

/// Top-level error taxonomy for `StreamTask` operations. A task that returns any of these
/// from `process`, `commit`, or `add_records` is considered failed by its owning thread,
/// which is expected to close the task (see spec §7).
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("unknown partition {0}, not assigned to this task")]
    UnknownPartition(TopicPartition),
    #[error("failed to deserialize record: {0}")]
    Deserialization(#[from] DeserializationError),
    #[error("user processor node {node} failed while processing: {message}")]
    Processing { node: String, message: String },
    #[error("fetcher error: {0}")]
    Fetcher(#[from] FetcherError),
    #[error("record collector error: {0}")]
    RecordCollector(#[from] RecordCollectorError),
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("topology error: {0}")]
    Topology(String),
}
