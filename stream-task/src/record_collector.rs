use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use metrics::{counter, gauge};
use tokio::task::JoinSet;
use tracing::{error, instrument};

use crate::error::RecordCollectorError;
use crate::producer::{Partitioner, Producer};
use crate::record::TopicPartition;

/// Buffers produced records on behalf of sink nodes and tracks the highest offset the
/// `Producer` has acknowledged per output partition (spec §4.5). `send` is synchronous and
/// fire-and-forget from a sink node's point of view: it spawns the actual `Producer::send` call
/// and stashes the `JoinHandle` so `flush` can await every outstanding send, mirroring
/// `KafkaSink::send_batch`'s `JoinSet` of `DeliveryFuture`s.
pub struct RecordCollector {
    producer: Arc<dyn Producer>,
    partitioner: Arc<dyn Partitioner>,
    num_partitions: HashMap<String, i32>,
    highest_offsets: Mutex<HashMap<TopicPartition, i64>>,
    pending: Mutex<JoinSet<Result<(TopicPartition, i64), RecordCollectorError>>>,
}

impl RecordCollector {
    pub fn new(
        producer: Arc<dyn Producer>,
        partitioner: Arc<dyn Partitioner>,
        num_partitions: HashMap<String, i32>,
    ) -> Self {
        Self {
            producer,
            partitioner,
            num_partitions,
            highest_offsets: Mutex::new(HashMap::new()),
            pending: Mutex::new(JoinSet::new()),
        }
    }

    /// Sends one record to `topic`, routing to an explicit `partition` if given or else to
    /// whatever `Partitioner` picks from `key`. Returns as soon as the send is queued; the
    /// record is not guaranteed durable until a subsequent `flush()` returns.
    #[instrument(skip(self, key, value))]
    pub fn send(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) {
        let num_partitions = *self.num_partitions.get(topic).unwrap_or(&1);
        let partition = partition
            .unwrap_or_else(|| self.partitioner.partition(topic, key.as_deref(), num_partitions));
        let target = TopicPartition::new(topic.to_string(), partition);

        let producer = self.producer.clone();
        let spawn_target = target.clone();
        self.pending.lock().expect("record collector lock poisoned").spawn(async move {
            let offset = producer.send(&spawn_target, key, value).await?;
            Ok::<_, RecordCollectorError>((spawn_target, offset))
        });
        counter!("stream_task_records_sent_total", "topic" => topic.to_string()).increment(1);
    }

    /// Blocks until every record sent before this call is durable, recording the highest
    /// acknowledged offset per output partition as each send completes. Returns the first
    /// failure encountered, if any, after having awaited the remaining sends.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<(), RecordCollectorError> {
        let mut join_set = {
            let mut guard = self.pending.lock().expect("record collector lock poisoned");
            std::mem::replace(&mut *guard, JoinSet::new())
        };

        let mut first_error = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok((partition, offset))) => {
                    let mut offsets = self.highest_offsets.lock().expect("record collector lock poisoned");
                    let entry = offsets.entry(partition).or_insert(-1);
                    *entry = (*entry).max(offset);
                }
                Ok(Err(err)) => {
                    error!("record collector send failed: {}", err);
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    error!("record collector task panicked: {}", join_err);
                    first_error.get_or_insert(RecordCollectorError::FlushFailed(join_err.to_string()));
                }
            }
        }

        gauge!("stream_task_record_collector_tracked_partitions")
            .set(self.highest_offsets.lock().expect("record collector lock poisoned").len() as f64);

        if let Some(err) = first_error {
            return Err(err);
        }

        self.producer.flush().await
    }

    pub fn highest_offset(&self, partition: &TopicPartition) -> Option<i64> {
        self.highest_offsets
            .lock()
            .expect("record collector lock poisoned")
            .get(partition)
            .copied()
    }
}
