//! Autograd tape for reverse-mode automatic differentiation.
//!
//! The tape is thread-local. Each differentiable operation that sees a
//! tracked input appends one [`Node`]; its output tensor is stamped with the
//! node id. Node ids are never reused, so a stale id on a tensor can always
//! be told apart from a live node.
//!
//! A node lives while its output tensor or a later node consuming that output
//! is alive. Dropping the last handle of an output releases the node, and
//! with it the saved tensors (and storage pins) of every node only it kept
//! alive.

use super::grad_mode::is_grad_enabled;
use crate::dispatch::OpKind;
use crate::error::TensorError;
use crate::tensor::{Tensor, TensorId, TensorImpl};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};
use std::rc::Weak;

/// Unique identifier for a node on the tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Get the creation index.
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Backward function trait.
///
/// Computes gradients with respect to inputs given the gradient of the
/// output. Each differentiable operation implements this trait on a struct
/// holding the state it saved during the forward pass.
pub trait GradFn: Debug {
    /// Compute the vector-Jacobian product.
    ///
    /// Returns one entry per recorded input, in input order. Entries for
    /// inputs that do not require grad may be `None`.
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError>;
}

/// Lifecycle of a node during backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Unvisited,
    /// Waiting for this many consumer gradients.
    Pending(usize),
    Ready,
    Executed,
}

/// Edge from a node to one of its inputs.
///
/// Holds the input weakly: the tape never keeps tensors alive. The producer
/// id is enough to continue the traversal once the tensor itself is gone.
#[derive(Debug, Clone)]
pub(crate) struct Edge {
    pub(crate) tensor: Weak<TensorImpl>,
    pub(crate) tensor_id: TensorId,
    pub(crate) producer: Option<NodeId>,
    pub(crate) shape: Vec<usize>,
}

impl Edge {
    fn to(tensor: &Tensor) -> Self {
        Self {
            tensor: tensor.downgrade(),
            tensor_id: tensor.id(),
            producer: tensor.grad_fn(),
            shape: tensor.shape().to_vec(),
        }
    }
}

/// A recorded operation.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    op: OpKind,
    pub(crate) grad_fn: Option<Box<dyn GradFn>>,
    pub(crate) inputs: Vec<Option<Edge>>,
    output: TensorId,
    output_shape: Vec<usize>,
    fan_out: usize,
    /// Live output handle plus live consumer edges.
    holders: usize,
    pub(crate) state: NodeState,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Identity of the tensor this node produced.
    pub fn output(&self) -> TensorId {
        self.output
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    /// Number of recorded edges from later nodes into this node's output.
    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Number of recorded inputs (tracked or not).
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Producing nodes of the tracked inputs.
    pub fn input_nodes(&self) -> Vec<NodeId> {
        self.inputs
            .iter()
            .flatten()
            .filter_map(|edge| edge.producer)
            .collect()
    }

    /// Check if the backward function and its saved state are still held.
    pub fn is_retained(&self) -> bool {
        self.grad_fn.is_some()
    }
}

/// Thread-local operation record.
pub struct Tape {
    nodes: BTreeMap<NodeId, Node>,
    next_id: u64,
}

impl Tape {
    /// Create a new empty tape.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn push(
        &mut self,
        op: OpKind,
        inputs: Vec<Option<Edge>>,
        output: &Tensor,
        grad_fn: Box<dyn GradFn>,
    ) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        for producer in inputs.iter().flatten().filter_map(|edge| edge.producer) {
            if let Some(node) = self.get_mut(producer) {
                node.fan_out += 1;
                node.holders += 1;
            }
        }
        self.nodes.insert(
            id,
            Node {
                id,
                op,
                grad_fn: Some(grad_fn),
                inputs,
                output: output.id(),
                output_shape: output.shape().to_vec(),
                fan_out: 0,
                holders: 1,
                state: NodeState::Unvisited,
            },
        );
        id
    }

    /// Get node by ID.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Live nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Remove every node. Ids issued later continue after the removed ones.
    ///
    /// The removed nodes are returned so that their saved tensors can be
    /// dropped after the tape borrow ends.
    pub fn clear(&mut self) -> Vec<Node> {
        std::mem::take(&mut self.nodes).into_values().collect()
    }

    /// Drop one holder of `id`. Nodes left without holders are removed, and
    /// their producers lose the holder their edges provided.
    pub(crate) fn release(&mut self, id: NodeId) -> Vec<Node> {
        let mut freed = Vec::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            node.holders = node.holders.saturating_sub(1);
            if node.holders > 0 {
                continue;
            }
            if let Some(node) = self.nodes.remove(&id) {
                stack.extend(node.input_nodes());
                freed.push(node);
            }
        }
        freed
    }

    /// Mark `id` executed and cut it from its inputs.
    ///
    /// The node stays on the tape while its output is alive, so a second
    /// backward through it is reported instead of silently finding nothing.
    pub(crate) fn retire(&mut self, id: NodeId) -> Vec<Node> {
        let Some(node) = self.nodes.get_mut(&id) else {
            return Vec::new();
        };
        node.state = NodeState::Executed;
        node.grad_fn = None;
        let producers: Vec<NodeId> = std::mem::take(&mut node.inputs)
            .into_iter()
            .flatten()
            .filter_map(|edge| edge.producer)
            .collect();
        producers.into_iter().flat_map(|p| self.release(p)).collect()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if tape is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Tape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tape")
            .field("num_nodes", &self.nodes.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

thread_local! {
    static TAPE: RefCell<Tape> = RefCell::new(Tape::new());
}

/// Access the thread-local tape.
pub fn with_tape<R>(f: impl FnOnce(&mut Tape) -> R) -> R {
    TAPE.with(|t| f(&mut t.borrow_mut()))
}

/// Clear the thread-local tape.
///
/// Tensors produced by cleared nodes keep their (now dangling) node ids;
/// backward through them fails with `MissingProducer`.
pub fn clear_tape() {
    let removed = with_tape(|t| t.clear());
    drop(removed);
}

/// Number of nodes on the thread-local tape.
pub fn tape_len() -> usize {
    with_tape(|t| t.len())
}

/// Give up the output handle's hold on `node`.
///
/// Called when the last handle of a recorded output is dropped. Freed nodes
/// are dropped after the tape borrow ends.
pub(crate) fn release_output(node: NodeId) {
    let freed = TAPE
        .try_with(|tape| match tape.try_borrow_mut() {
            Ok(mut tape) => tape.release(node),
            Err(_) => {
                log::warn!("tape is busy; node {node} is kept until the tape is cleared");
                Vec::new()
            }
        })
        .unwrap_or_default();
    if !freed.is_empty() {
        log::trace!("released {} node(s) with the output of {node}", freed.len());
    }
    drop(freed);
}

/// Record `op` if grad mode is on and any input tracks gradients.
///
/// `make_grad_fn` runs only when a node is actually created, so saving
/// tensors costs nothing for untracked computations. Returns the new node id.
pub(crate) fn record<F>(
    op: OpKind,
    inputs: &[&Tensor],
    output: &Tensor,
    make_grad_fn: F,
) -> Option<NodeId>
where
    F: FnOnce() -> Box<dyn GradFn>,
{
    if !is_grad_enabled() || !inputs.iter().any(|t| t.requires_grad()) {
        return None;
    }
    let edges: Vec<Option<Edge>> = inputs
        .iter()
        .map(|t| t.requires_grad().then(|| Edge::to(t)))
        .collect();
    let grad_fn = make_grad_fn();
    let id = with_tape(|tape| tape.push(op, edges, output, grad_fn));
    output.set_grad_fn(id);
    log::debug!("recorded {op} as node {id} -> {}", output.id());
    Some(id)
}

/// Export the tape as a dependency graph (edges point from an input's
/// producer to its consumer).
pub fn tape_graph() -> DiGraph<NodeId, ()> {
    with_tape(|tape| {
        let mut graph = DiGraph::new();
        let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
        for node in tape.nodes() {
            index.insert(node.id(), graph.add_node(node.id()));
        }
        for node in tape.nodes() {
            for producer in node.input_nodes() {
                if let (Some(&from), Some(&to)) = (index.get(&producer), index.get(&node.id())) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        graph
    })
}

/// Check the tape for cycles.
///
/// # Errors
/// `CycleDetected` naming a node on the cycle.
pub fn validate_tape() -> Result<(), TensorError> {
    let graph = tape_graph();
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| TensorError::CycleDetected {
            node: graph[cycle.node_id()],
        })
}
