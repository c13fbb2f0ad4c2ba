//! In-memory test doubles for the external collaborators `StreamTask` depends on (spec §2
//! "External-collaborator traits ... with an in-memory mock implementation of each for tests").
//! Not `#[cfg(test)]`-gated so integration tests outside this crate can build a full task
//! against them, the way `feature-flags::test_utils` is used from its own `tests/` directory.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{FetcherError, RecordCollectorError, StateError};
use crate::fetcher::Fetcher;
use crate::producer::Producer;
use crate::record::TopicPartition;
use crate::state::{InMemoryStateManager, StateManager};

/// A single observed call against one of the in-memory collaborators, used by tests to assert
/// on cross-collaborator ordering (spec scenario S4: state flush, then offset commit, then
/// producer flush, in that order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallLogEntry {
    StateFlush,
    FetcherCommit,
    ProducerFlush,
    Pause(TopicPartition),
    Resume(TopicPartition),
}

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<CallLogEntry>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: CallLogEntry) {
        self.0.lock().expect("call log lock poisoned").push(entry);
    }

    pub fn entries(&self) -> Vec<CallLogEntry> {
        self.0.lock().expect("call log lock poisoned").clone()
    }
}

/// An in-memory `Fetcher` that records pause/resume/commit calls for assertions instead of
/// talking to a real consumer.
pub struct InMemoryFetcher {
    log: CallLog,
    pauses: Mutex<HashMap<TopicPartition, usize>>,
    resumes: Mutex<HashMap<TopicPartition, usize>>,
    committed: Mutex<HashMap<TopicPartition, i64>>,
}

impl InMemoryFetcher {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            pauses: Mutex::new(HashMap::new()),
            resumes: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
        }
    }

    pub fn pause_count(&self, partition: &TopicPartition) -> usize {
        *self.pauses.lock().expect("lock poisoned").get(partition).unwrap_or(&0)
    }

    pub fn resume_count(&self, partition: &TopicPartition) -> usize {
        *self.resumes.lock().expect("lock poisoned").get(partition).unwrap_or(&0)
    }

    pub fn committed_offset(&self, partition: &TopicPartition) -> Option<i64> {
        self.committed.lock().expect("lock poisoned").get(partition).copied()
    }
}

#[async_trait]
impl Fetcher for InMemoryFetcher {
    async fn pause(&self, partition: &TopicPartition) {
        self.log.push(CallLogEntry::Pause(partition.clone()));
        *self.pauses.lock().expect("lock poisoned").entry(partition.clone()).or_insert(0) += 1;
    }

    async fn resume(&self, partition: &TopicPartition) {
        self.log.push(CallLogEntry::Resume(partition.clone()));
        *self.resumes.lock().expect("lock poisoned").entry(partition.clone()).or_insert(0) += 1;
    }

    async fn commit(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<(), FetcherError> {
        self.log.push(CallLogEntry::FetcherCommit);
        let mut committed = self.committed.lock().expect("lock poisoned");
        for (partition, offset) in offsets {
            committed.insert(partition.clone(), *offset);
        }
        Ok(())
    }
}

/// An in-memory `Producer` that always "acknowledges" sends with a per-partition incrementing
/// offset, for tests that only care about the collector's bookkeeping.
pub struct InMemoryProducer {
    log: CallLog,
    next_offset: Mutex<HashMap<TopicPartition, i64>>,
}

impl InMemoryProducer {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            next_offset: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Producer for InMemoryProducer {
    async fn send(
        &self,
        partition: &TopicPartition,
        _key: Option<Bytes>,
        _value: Option<Bytes>,
    ) -> Result<i64, RecordCollectorError> {
        let mut next = self.next_offset.lock().expect("lock poisoned");
        let offset = next.entry(partition.clone()).or_insert(0);
        let acked = *offset;
        *offset += 1;
        Ok(acked)
    }

    async fn flush(&self) -> Result<(), RecordCollectorError> {
        self.log.push(CallLogEntry::ProducerFlush);
        Ok(())
    }
}

/// Wraps `InMemoryStateManager` to record `flush()` calls in a shared `CallLog`, so tests can
/// assert on commit ordering across all three collaborators (spec scenario S4).
pub struct LoggingStateManager {
    log: CallLog,
    inner: InMemoryStateManager,
}

impl LoggingStateManager {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            inner: InMemoryStateManager::new(),
        }
    }
}

#[async_trait]
impl StateManager for LoggingStateManager {
    async fn flush(&self) -> Result<(), StateError> {
        self.log.push(CallLogEntry::StateFlush);
        self.inner.flush().await
    }

    fn register_store(&self, name: &str, store: Arc<dyn Any + Send + Sync>) {
        self.inner.register_store(name, store);
    }

    fn get_store(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.get_store(name)
    }
}
