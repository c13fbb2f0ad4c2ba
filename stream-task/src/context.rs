use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::TaskError;
use crate::punctuation::{PunctuationCancellable, PunctuationQueue};
use crate::record::{DynValue, TopicPartition};
use crate::state::StateManager;
use crate::topology::{NodeId, ProcessorTopology};

/// The `(topic, partition, offset, timestamp)` of the record currently being processed, as
/// exposed by `ProcessorContext::record()` (spec §4.6).
#[derive(Debug, Clone)]
pub struct CurrentRecord {
    pub partition: TopicPartition,
    pub offset: i64,
    pub timestamp: i64,
}

/// The per-task facade handed to user processor nodes (spec §4.6). Holds `Arc`s to the
/// collaborators it delegates to rather than borrowing `StreamTask` directly, so the
/// context/task/topology containment tree never needs a borrow-checked back-reference (spec §9
/// "cyclic references ... expressed as a containment tree ... non-owning").
///
/// `record` and `node_stack` change for the duration of a single `process`/`punctuate` call;
/// `StreamTask` pushes/clears them via `enter_node`/`exit_node`/`set_record` around each
/// dispatch, and `forward`/`forward_to` push/pop nested frames the same way (spec §9 "current
/// node re-entrancy": explicit save/restore, not a mutable global).
pub struct ProcessorContext {
    task_id: i64,
    topology: Arc<ProcessorTopology>,
    punctuation: Arc<Mutex<PunctuationQueue>>,
    state_manager: Arc<dyn StateManager>,
    record: Mutex<Option<CurrentRecord>>,
    node_stack: Mutex<Vec<NodeId>>,
    stream_time: AtomicI64,
}

impl ProcessorContext {
    pub fn new(
        task_id: i64,
        topology: Arc<ProcessorTopology>,
        punctuation: Arc<Mutex<PunctuationQueue>>,
        state_manager: Arc<dyn StateManager>,
    ) -> Self {
        Self {
            task_id,
            topology,
            punctuation,
            state_manager,
            record: Mutex::new(None),
            node_stack: Mutex::new(Vec::new()),
            stream_time: AtomicI64::new(-1),
        }
    }

    /// Builds a context suitable for exercising a single node in isolation, with a throwaway
    /// punctuation queue and in-memory state manager.
    #[cfg(test)]
    pub fn for_test(topology: &Arc<ProcessorTopology>, node: NodeId) -> Self {
        let ctx = Self::new(
            0,
            topology.clone(),
            Arc::new(Mutex::new(PunctuationQueue::new())),
            Arc::new(crate::state::InMemoryStateManager::new()),
        );
        ctx.enter_node(node);
        ctx
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// The current record's `(topic, partition, offset, timestamp)`, or `None` outside of a
    /// `process`/`punctuate` call (spec §4.6).
    pub fn record(&self) -> Option<CurrentRecord> {
        self.record.lock().expect("context lock poisoned").clone()
    }

    pub fn state_manager(&self) -> &Arc<dyn StateManager> {
        &self.state_manager
    }

    /// Dispatches `(key, value)` to every child of the currently-executing node, in
    /// registration order (spec §4.6, §6).
    pub fn forward(&self, key: Option<&DynValue>, value: Option<&DynValue>) -> Result<(), TaskError> {
        let current = self.current_node()?;
        let children = self.topology.children(current).to_vec();
        for child in children {
            self.dispatch_to(child, key, value)?;
        }
        Ok(())
    }

    /// Dispatches `(key, value)` to a single named child of the currently-executing node (spec
    /// §4.6 selective propagation).
    pub fn forward_to(
        &self,
        child_name: &str,
        key: Option<&DynValue>,
        value: Option<&DynValue>,
    ) -> Result<(), TaskError> {
        let current = self.current_node()?;
        let child = self
            .topology
            .children(current)
            .iter()
            .copied()
            .find(|&id| self.topology.node_name(id) == child_name)
            .ok_or_else(|| {
                TaskError::Topology(format!(
                    "node {} has no child named {child_name}",
                    self.topology.node_name(current)
                ))
            })?;
        self.dispatch_to(child, key, value)
    }

    /// Schedules the currently-executing node to be punctuated every `interval_ms`, starting at
    /// the stream time in effect when this call is made (spec §4.6, §4.4).
    pub fn schedule(&self, interval_ms: i64) -> Result<PunctuationCancellable, TaskError> {
        let current = self.current_node()?;
        let start_time = self.stream_time.load(Ordering::SeqCst);
        Ok(self
            .punctuation
            .lock()
            .expect("punctuation queue lock poisoned")
            .schedule(current, start_time, interval_ms))
    }

    fn dispatch_to(
        &self,
        node: NodeId,
        key: Option<&DynValue>,
        value: Option<&DynValue>,
    ) -> Result<(), TaskError> {
        self.enter_node(node);
        let result = self.topology.with_node(node, |n| n.process(self, key, value));
        self.exit_node();
        result
    }

    fn current_node(&self) -> Result<NodeId, TaskError> {
        self.node_stack
            .lock()
            .expect("context lock poisoned")
            .last()
            .copied()
            .ok_or_else(|| {
                TaskError::Topology(
                    "forward/forward_to/schedule called outside of a process/punctuate call"
                        .to_string(),
                )
            })
    }

    pub(crate) fn enter_node(&self, node: NodeId) {
        self.node_stack.lock().expect("context lock poisoned").push(node);
    }

    pub(crate) fn exit_node(&self) {
        self.node_stack.lock().expect("context lock poisoned").pop();
    }

    pub(crate) fn set_record(&self, record: CurrentRecord) {
        *self.record.lock().expect("context lock poisoned") = Some(record);
    }

    pub(crate) fn clear_record(&self) {
        *self.record.lock().expect("context lock poisoned") = None;
    }

    pub(crate) fn set_stream_time(&self, t: i64) {
        self.stream_time.store(t, Ordering::SeqCst);
    }
}

/// Type-erased helper for downcasting a store fetched from `state_manager().get_store(..)`.
pub fn downcast_store<T: Any + Send + Sync>(store: Arc<dyn Any + Send + Sync>) -> Option<Arc<T>> {
    store.downcast::<T>().ok()
}
