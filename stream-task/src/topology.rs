use crate::context::ProcessorContext;
use crate::error::TaskError;

/// A user-supplied processing step. Source nodes are invoked by the task loop with the record
/// deserialized for their partition; processor and sink nodes are invoked only via
/// `ProcessorContext::forward`/`forward_to` from an upstream node (spec §5).
pub trait Node: Send {
    /// A short, stable identifier used in error messages and tracing spans. Not required to be
    /// unique across the whole topology, only meaningful to a human reading logs.
    fn name(&self) -> &str;

    fn process(&mut self, ctx: &ProcessorContext, key: Option<&crate::record::DynValue>, value: Option<&crate::record::DynValue>) -> Result<(), TaskError>;

    /// Invoked once per source node when a `StreamTask` is constructed, before any record is
    /// processed. The default implementation does nothing; nodes with no setup to perform never
    /// need to override it.
    fn init(&mut self, _ctx: &ProcessorContext) -> Result<(), TaskError> {
        Ok(())
    }

    /// Invoked by the task's step loop when this node has an active punctuation schedule and
    /// its fire time has come. The default implementation does nothing; nodes that never call
    /// `ProcessorContext::schedule` never need to override it.
    fn punctuate(&mut self, _ctx: &ProcessorContext, _timestamp: i64) -> Result<(), TaskError> {
        Ok(())
    }

    /// Invoked once when the owning `StreamTask` closes, in reverse registration order across
    /// the topology (spec §4.7). The default implementation does nothing.
    fn close(&mut self) -> Result<(), TaskError> {
        Ok(())
    }
}

pub type NodeId = usize;

struct NodeSlot {
    name: String,
    node: std::sync::Mutex<Box<dyn Node>>,
    children: Vec<NodeId>,
}

/// The fixed processing graph a `StreamTask` executes. Built once via `ProcessorTopologyBuilder`
/// and shared read-only (aside from each node's own interior `Mutex`) across the task's
/// lifetime. Each node's `Mutex` is locked only for the duration of a single `process`/
/// `punctuate` call, never held across a nested `forward` (spec §9 reentrant dispatch note).
pub struct ProcessorTopology {
    nodes: Vec<NodeSlot>,
}

impl ProcessorTopology {
    pub fn builder() -> ProcessorTopologyBuilder {
        ProcessorTopologyBuilder::new()
    }

    pub fn node_name(&self, id: NodeId) -> &str {
        &self.nodes[id].name
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Closes every node in reverse registration order, collecting and logging each failure but
    /// continuing to close the rest; returns the first error encountered, if any (spec §4.7
    /// "closes the topology, which closes user nodes in reverse topological order"). Builders
    /// conventionally register a node's children before the node itself (see
    /// `ProcessorTopologyBuilder::add_child`'s usage), so reverse registration order closes
    /// downstream nodes before the upstream nodes that feed them.
    pub fn close_all(&self) -> Result<(), TaskError> {
        let mut first_error = None;
        for id in (0..self.nodes.len()).rev() {
            if let Err(err) = self.with_node(id, |node| node.close()) {
                tracing::error!(node = self.node_name(id), "node close failed: {}", err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Locks node `id` and runs `f` against it. Panics (via a poisoned-lock propagation) only
    /// if a previous call panicked while holding the lock, matching the teacher's treatment of
    /// mutex poisoning elsewhere as an unrecoverable bug rather than a recoverable error.
    pub(crate) fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&mut dyn Node) -> R) -> R {
        let mut guard = self.nodes[id].node.lock().expect("topology node lock poisoned");
        f(guard.as_mut())
    }
}

pub struct ProcessorTopologyBuilder {
    nodes: Vec<NodeSlot>,
}

impl ProcessorTopologyBuilder {
    fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Registers `node` with no children and returns its id. Callers wire up the graph by
    /// passing already-registered ids to `add_child`.
    pub fn add_node(&mut self, node: impl Node + 'static) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(NodeSlot {
            name: node.name().to_string(),
            node: std::sync::Mutex::new(Box::new(node)),
            children: Vec::new(),
        });
        id
    }

    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> &mut Self {
        self.nodes[parent].children.push(child);
        self
    }

    pub fn build(self) -> ProcessorTopology {
        ProcessorTopology { nodes: self.nodes }
    }
}
