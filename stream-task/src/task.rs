use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::{counter, gauge};
use tracing::instrument;

use crate::context::{CurrentRecord, ProcessorContext};
use crate::error::TaskError;
use crate::fetcher::Fetcher;
use crate::partition_group::PartitionGroup;
use crate::punctuation::PunctuationQueue;
use crate::record::{RawRecord, TopicPartition};
use crate::record_collector::RecordCollector;
use crate::state::StateManager;
use crate::topology::{NodeId, ProcessorTopology};

/// The mutable state a `StreamTask` serializes behind its single async monitor (spec §4.2
/// "StreamTask is single-threaded cooperative": exactly one caller holds `inner` for the
/// duration of `add_records`, `process`, or `commit`, mirroring the source's single lock shared
/// by the task and its `PartitionGroup`).
struct StreamTaskInner {
    partition_group: PartitionGroup,
    consumed_offsets: HashMap<TopicPartition, i64>,
    commit_requested: bool,
    commit_offset_needed: bool,
    /// Partitions currently under a pause signalled to the fetcher. Tracked here (rather than
    /// trusting `Fetcher::pause`/`resume` to be simply idempotent) so repeated `add_records`
    /// calls while a partition stays over `max_buffered_size` issue `pause` only once, keeping
    /// `pauses(p) - resumes(p)` in `{0, 1}` as required by spec invariant P2.
    paused: HashSet<TopicPartition>,
}

/// Owns a fixed set of partitions and drives them through a `ProcessorTopology` one record at a
/// time (spec §4.2, §4.7). The only public surface is `add_records`/`process`/`commit`/`close`;
/// everything else is an internal collaborator wired together by `new`.
pub struct StreamTask {
    task_id: i64,
    max_buffered_size: usize,
    fetcher: Arc<dyn Fetcher>,
    record_collector: Arc<RecordCollector>,
    state_manager: Arc<dyn StateManager>,
    topology: Arc<ProcessorTopology>,
    context: Arc<ProcessorContext>,
    punctuation: Arc<std::sync::Mutex<PunctuationQueue>>,
    inner: tokio::sync::Mutex<StreamTaskInner>,
    liveness: Option<health::HealthHandle>,
}

impl StreamTask {
    /// Builds a task over `partition_group`'s fixed partition set and initializes every distinct
    /// source node referenced by it (spec §4.2 lifecycle: "initializes each source node" before
    /// the task runs). `liveness`, if given, is reported to on every successful `process` call.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: i64,
        max_buffered_size: usize,
        partition_group: PartitionGroup,
        topology: Arc<ProcessorTopology>,
        fetcher: Arc<dyn Fetcher>,
        record_collector: Arc<RecordCollector>,
        state_manager: Arc<dyn StateManager>,
        liveness: Option<health::HealthHandle>,
    ) -> Result<Self, TaskError> {
        let punctuation = Arc::new(std::sync::Mutex::new(PunctuationQueue::new()));
        let context = Arc::new(ProcessorContext::new(
            task_id,
            topology.clone(),
            punctuation.clone(),
            state_manager.clone(),
        ));

        let mut source_nodes: Vec<NodeId> = partition_group
            .partitions()
            .map(|p| partition_group.source_node(p))
            .collect();
        source_nodes.sort_unstable();
        source_nodes.dedup();
        for node in source_nodes {
            context.enter_node(node);
            let result = topology.with_node(node, |n| n.init(&context));
            context.exit_node();
            result?;
        }

        Ok(Self {
            task_id,
            max_buffered_size,
            fetcher,
            record_collector,
            state_manager,
            topology,
            context,
            punctuation,
            inner: tokio::sync::Mutex::new(StreamTaskInner {
                partition_group,
                consumed_offsets: HashMap::new(),
                commit_requested: false,
                commit_offset_needed: false,
                paused: HashSet::new(),
            }),
            liveness,
        })
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// Admits `raw` into `partition`'s queue (spec §4.7 `add_records`). Ingestion is immediate,
    /// not buffered until the next `process` call (spec §9 resolved open question), so the pause
    /// decision below always sees the queue's true post-admission size. This is the only place a
    /// pause is issued.
    ///
    /// Under `DeserializationPolicy::Skip` (spec §7), a poison record is dropped before it ever
    /// reaches a node's `process`; its offset is still folded into `consumed_offsets` here so a
    /// later commit doesn't re-fetch it.
    #[instrument(skip(self, raw))]
    pub async fn add_records(
        &self,
        partition: &TopicPartition,
        raw: impl IntoIterator<Item = RawRecord>,
    ) -> Result<usize, TaskError> {
        let mut inner = self.inner.lock().await;

        if !inner.partition_group.contains(partition) {
            return Err(TaskError::UnknownPartition(partition.clone()));
        }

        let outcome = inner.partition_group.add_raw_records(partition, raw)?;

        if let Some(&highest_skipped) = outcome.skipped_offsets.iter().max() {
            let entry = inner
                .consumed_offsets
                .entry(partition.clone())
                .or_insert(highest_skipped);
            *entry = (*entry).max(highest_skipped);
            inner.commit_offset_needed = true;
        }

        let size = outcome.queue_size;
        if size > self.max_buffered_size && inner.paused.insert(partition.clone()) {
            self.fetcher.pause(partition).await;
        }

        gauge!("stream_task_buffered_records", "partition" => partition.to_string()).set(size as f64);
        Ok(size)
    }

    /// Requests that the next call to `process` run a commit after it finishes processing its
    /// record, honored at the next record boundary rather than immediately (spec §4.7
    /// `needs_commit`). Typically driven by the owning thread at `commit_interval_ms` cadence.
    pub async fn needs_commit(&self) {
        self.inner.lock().await.commit_requested = true;
    }

    /// Processes exactly one record, the head of whichever buffered partition has the lowest
    /// timestamp (spec §4.7). Returns `false` with no effect if every partition queue is empty.
    ///
    /// On a processing error, `ProcessorContext::record()` and the current-node stack are left
    /// as they were when the error occurred rather than cleared, so the error's caller can log
    /// what was being processed before closing the task (spec §7 propagation policy).
    #[instrument(skip(self))]
    pub async fn process(&self) -> Result<bool, TaskError> {
        let mut inner = self.inner.lock().await;

        let Some(partition) = inner.partition_group.next_partition() else {
            return Ok(false);
        };

        let record = inner.partition_group.poll_record(&partition);
        let source_node = inner.partition_group.source_node(&partition);

        // `ProcessorContext`'s stream time is deliberately left at whatever the previous
        // `process` call's step 7 set it to; a node that calls `ctx.schedule` during step 3
        // below computes `next_fire` against that carried-over value, not one freshly derived
        // from the record just popped (spec §4.7 steps 2-3 vs. step 7).
        self.context.set_record(CurrentRecord {
            partition: partition.clone(),
            offset: record.offset,
            timestamp: record.timestamp,
        });
        self.context.enter_node(source_node);

        let result = self.topology.with_node(source_node, |node| {
            node.process(&self.context, record.key.as_ref(), record.value.as_ref())
        });

        if let Err(err) = result {
            return Err(err);
        }
        self.context.exit_node();
        self.context.clear_record();

        inner.consumed_offsets.insert(partition.clone(), record.offset);
        inner.commit_offset_needed = true;
        counter!("stream_task_records_processed_total", "partition" => partition.to_string())
            .increment(1);

        if inner.commit_requested {
            self.commit_locked(&mut inner).await?;
            inner.commit_requested = false;
        }

        // Equality, not `<=`, so exactly one resume is issued per pause (spec §4.7 step 6).
        if inner.partition_group.num_buffered(&partition) == self.max_buffered_size
            && inner.paused.remove(&partition)
        {
            self.fetcher.resume(&partition).await;
        }

        let stream_time = inner.partition_group.stream_time();
        self.context.set_stream_time(stream_time);
        let topology = &self.topology;
        let context = &self.context;
        self.punctuation
            .lock()
            .expect("punctuation queue lock poisoned")
            .punctuate(stream_time, |node, fire_time| {
                context.enter_node(node);
                let result = topology.with_node(node, |n| n.punctuate(context, fire_time));
                context.exit_node();
                result
            })?;

        if let Some(handle) = &self.liveness {
            handle.report_healthy().await;
        }

        Ok(true)
    }

    /// Runs the commit protocol: state flush, then (if any record has been processed since the
    /// last commit) offset commit, then producer flush, in exactly that order (spec §4.7
    /// `commit()`). Each step's failure is fatal to the task (spec §7).
    #[instrument(skip(self))]
    pub async fn commit(&self) -> Result<(), TaskError> {
        let mut inner = self.inner.lock().await;
        self.commit_locked(&mut inner).await
    }

    async fn commit_locked(&self, inner: &mut StreamTaskInner) -> Result<(), TaskError> {
        self.state_manager.flush().await?;

        if inner.commit_offset_needed {
            self.fetcher.commit(&inner.consumed_offsets).await?;
            inner.commit_offset_needed = false;
        }

        self.record_collector.flush().await?;
        Ok(())
    }

    /// Drops all buffered records and closes the topology in reverse registration order (spec
    /// §4.2 lifecycle, §4.7). Only legal once the caller's own `process` loop has returned;
    /// there is no in-process cancellation of a call in flight (spec §7).
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), TaskError> {
        let mut inner = self.inner.lock().await;
        inner.partition_group.clear();
        inner.consumed_offsets.clear();
        self.topology.close_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{
        BytesPassthroughDeserializer, DeserializationPolicy, FnTimestampExtractor,
        TimestampExtractor,
    };
    use crate::partition_group::TopicCodec;
    use crate::producer::KeyHashPartitioner;
    use crate::record::DynValue;
    use crate::record_queue::RecordQueue;
    use crate::testing::{CallLogEntry, CallLog, InMemoryFetcher, InMemoryProducer, LoggingStateManager};
    use crate::topology::{Node, ProcessorTopologyBuilder};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ForwardingSourceNode {
        name: String,
    }

    impl Node for ForwardingSourceNode {
        fn name(&self) -> &str {
            &self.name
        }

        fn process(
            &mut self,
            ctx: &ProcessorContext,
            key: Option<&DynValue>,
            value: Option<&DynValue>,
        ) -> Result<(), TaskError> {
            ctx.forward(key, value)
        }
    }

    struct SinkNode {
        name: String,
        collector: Arc<RecordCollector>,
        seen: Arc<AtomicUsize>,
    }

    impl Node for SinkNode {
        fn name(&self) -> &str {
            &self.name
        }

        fn process(
            &mut self,
            _ctx: &ProcessorContext,
            _key: Option<&DynValue>,
            value: Option<&DynValue>,
        ) -> Result<(), TaskError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            let bytes = value
                .and_then(|v| v.downcast_ref::<Vec<u8>>())
                .cloned()
                .map(Bytes::from);
            self.collector.send("out", Some(0), None, bytes);
            Ok(())
        }
    }

    // Tests encode the intended timestamp as the value bytes, parsed back out here, same
    // convention as `partition_group`'s own tests.
    fn timestamp_extractor() -> Arc<dyn TimestampExtractor> {
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

    struct Harness {
        task: StreamTask,
        fetcher: Arc<InMemoryFetcher>,
        log: CallLog,
        seen: Arc<AtomicUsize>,
        partition: TopicPartition,
    }

    fn build_harness(max_buffered_size: usize) -> Harness {
        let partition = TopicPartition::new("topic", 0);
        let seen = Arc::new(AtomicUsize::new(0));

        let mut num_partitions = HashMap::new();
        num_partitions.insert("out".to_string(), 1);

        let log = CallLog::new();
        let fetcher = Arc::new(InMemoryFetcher::new(log.clone()));
        let producer = Arc::new(InMemoryProducer::new(log.clone()));
        let record_collector = Arc::new(RecordCollector::new(
            producer,
            Arc::new(KeyHashPartitioner),
            num_partitions,
        ));
        let state_manager: Arc<dyn StateManager> = Arc::new(LoggingStateManager::new(log.clone()));

        let mut builder = ProcessorTopology::builder();
        let sink_id = builder.add_node(SinkNode {
            name: "sink".into(),
            collector: record_collector.clone(),
            seen: seen.clone(),
        });
        let source_id = builder.add_node(ForwardingSourceNode {
            name: "source".into(),
        });
        builder.add_child(source_id, sink_id);
        let topology = Arc::new(builder.build());

        let mut queues = HashMap::new();
        queues.insert(partition.clone(), RecordQueue::new(partition.clone(), source_id));
        let mut codecs = HashMap::new();
        codecs.insert(
            "topic".to_string(),
            TopicCodec {
                key_deserializer: Arc::new(BytesPassthroughDeserializer),
                value_deserializer: Arc::new(BytesPassthroughDeserializer),
            },
        );
        let partition_group = PartitionGroup::new(
            queues,
            codecs,
            timestamp_extractor(),
            DeserializationPolicy::Fail,
        );

        let task = StreamTask::new(
            1,
            max_buffered_size,
            partition_group,
            topology,
            fetcher.clone(),
            record_collector,
            state_manager,
            None,
        )
        .expect("task construction should not fail");

        Harness {
            task,
            fetcher,
            log,
            seen,
            partition,
        }
    }

    #[tokio::test]
    async fn process_returns_false_when_nothing_buffered() {
        let harness = build_harness(10);
        assert!(!harness.task.process().await.unwrap());
    }

    #[tokio::test]
    async fn process_drains_one_record_and_forwards_to_sink() {
        let harness = build_harness(10);
        harness
            .task
            .add_records(&harness.partition, vec![raw(0, 100)])
            .await
            .unwrap();

        assert!(harness.task.process().await.unwrap());
        assert_eq!(harness.seen.load(Ordering::SeqCst), 1);
        assert!(!harness.task.process().await.unwrap());
    }

    #[tokio::test]
    async fn pause_and_resume_bracket_exactly_once() {
        // Mirrors spec scenario S1: max_buffered_size = 2, three records pushes the queue to 3
        // (pause), processing the first drops it back to 2 (resume).
        let harness = build_harness(2);
        harness
            .task
            .add_records(&harness.partition, vec![raw(0, 10), raw(1, 20), raw(2, 30)])
            .await
            .unwrap();
        assert_eq!(harness.fetcher.pause_count(&harness.partition), 1);
        assert_eq!(harness.fetcher.resume_count(&harness.partition), 0);

        harness.task.process().await.unwrap();
        assert_eq!(harness.fetcher.resume_count(&harness.partition), 1);

        // Further draining does not issue another resume; the pair is already balanced.
        harness.task.process().await.unwrap();
        harness.task.process().await.unwrap();
        assert_eq!(harness.fetcher.pause_count(&harness.partition), 1);
        assert_eq!(harness.fetcher.resume_count(&harness.partition), 1);
    }

    #[tokio::test]
    async fn empty_add_records_does_not_unpause() {
        // Spec scenario S5.
        let harness = build_harness(1);
        harness
            .task
            .add_records(&harness.partition, vec![raw(0, 10), raw(1, 20)])
            .await
            .unwrap();
        assert_eq!(harness.fetcher.pause_count(&harness.partition), 1);

        harness
            .task
            .add_records(&harness.partition, Vec::new())
            .await
            .unwrap();
        assert_eq!(harness.fetcher.resume_count(&harness.partition), 0);
    }

    #[tokio::test]
    async fn needs_commit_runs_state_then_offsets_then_producer_in_order() {
        // Spec scenario S4.
        let harness = build_harness(10);
        harness
            .task
            .add_records(&harness.partition, vec![raw(7, 100)])
            .await
            .unwrap();
        harness.task.needs_commit().await;
        harness.task.process().await.unwrap();

        assert_eq!(
            harness.fetcher.committed_offset(&harness.partition),
            Some(7)
        );
        let entries = harness.log.entries();
        let positions: Vec<_> = [
            CallLogEntry::StateFlush,
            CallLogEntry::FetcherCommit,
            CallLogEntry::ProducerFlush,
        ]
        .iter()
        .map(|wanted| entries.iter().position(|e| e == wanted).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn commit_without_any_processed_record_skips_offset_commit() {
        let harness = build_harness(10);
        harness.task.commit().await.unwrap();
        assert_eq!(harness.fetcher.committed_offset(&harness.partition), None);
        assert!(harness.log.entries().contains(&CallLogEntry::StateFlush));
        assert!(harness.log.entries().contains(&CallLogEntry::ProducerFlush));
    }

    #[tokio::test]
    async fn close_drops_buffered_records_and_closes_topology() {
        let harness = build_harness(10);
        harness
            .task
            .add_records(&harness.partition, vec![raw(0, 10)])
            .await
            .unwrap();
        harness.task.close().await.unwrap();
        assert!(!harness.task.process().await.unwrap());
    }
}
