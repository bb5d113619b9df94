//! Backward pass execution for reverse-mode automatic differentiation.
//!
//! Two passes over the tape:
//!
//! 1. **Discovery**: iterative DFS from the root's producing node. Counts,
//!    for every reachable node, how many edges from other reachable nodes
//!    consume its output. Fails on cycles, on edges to nodes that are no
//!    longer on the tape and on nodes whose saved state was already freed.
//! 2. **Execution**: a node runs once all of its consumers have delivered
//!    their gradients. Among ready nodes the most recently created runs
//!    first. Gradients are summed per tensor identity.
//!
//! Leaf gradients only become visible after the whole pass succeeded.

use super::gradients::{Gradients, sum_gradients};
use super::grad_mode::NoGradGuard;
use super::graph::{Edge, GradFn, Node, NodeId, NodeState, Tape, with_tape};
use crate::dispatch::OpKind;
use crate::error::TensorError;
use crate::tensor::{Tensor, TensorId, TensorImpl};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Weak;

/// Options for a backward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardOptions {
    /// Keep backward functions and saved tensors so the graph can be
    /// traversed again.
    pub retain_graph: bool,
}

impl BackwardOptions {
    pub fn retain_graph(mut self, retain: bool) -> Self {
        self.retain_graph = retain;
        self
    }
}

/// Execute backward pass from `root`.
///
/// Accumulates gradients into the gradient slots of all reachable leaves
/// that require grad. The graph is freed afterwards.
///
/// # Arguments
/// * `root` - Tensor to differentiate
/// * `seed` - Gradient of `root`; defaults to ones for single-element roots
///
/// # Errors
/// - `ShapeMismatch` if `seed` is omitted for a root with several elements.
/// - `IncompatibleShapes` / `UnsupportedOperation` if `seed` does not match
///   the root's shape / dtype.
/// - Graph errors (see module docs). Nothing is written on error.
///
/// Backward from a root that does not track gradients is a no-op.
///
/// # Example
///
/// ```
/// use ndgrad::Tensor;
/// use ndgrad::autodiff::backward;
/// use ndgrad::operations::{mul, sum};
///
/// let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap()
///     .requires_grad_(true).unwrap();
/// let loss = sum(&mul(&x, &x).unwrap()).unwrap();
/// backward(&loss, None).unwrap();
///
/// let grad = x.grad().unwrap();
/// assert_eq!(grad.to_vec::<f64>().unwrap(), vec![2.0, 4.0, 6.0]);
/// ```
pub fn backward(root: &Tensor, seed: Option<&Tensor>) -> Result<(), TensorError> {
    backward_with(root, seed, BackwardOptions::default())
}

/// [`backward`] with explicit options.
pub fn backward_with(
    root: &Tensor,
    seed: Option<&Tensor>,
    options: BackwardOptions,
) -> Result<(), TensorError> {
    run(root, seed, options, &HashSet::new(), true).map(|_| ())
}

/// Gradients of `root` with respect to `inputs`, without touching any
/// gradient slot.
///
/// Returns `None` for inputs that `root` does not depend on.
pub fn grad(
    root: &Tensor,
    inputs: &[&Tensor],
    seed: Option<&Tensor>,
    options: BackwardOptions,
) -> Result<Vec<Option<Tensor>>, TensorError> {
    let wanted: HashSet<TensorId> = inputs.iter().map(|t| t.id()).collect();
    let captured = run(root, seed, options, &wanted, false)?;
    Ok(inputs
        .iter()
        .map(|t| captured.get(&t.id()).cloned())
        .collect())
}

/// Result of the discovery pass.
#[derive(Debug, Default)]
struct Plan {
    /// Reachable nodes in discovery order.
    nodes: Vec<NodeId>,
    /// Consumer edges per node.
    pending: HashMap<NodeId, usize>,
    outputs: HashMap<NodeId, TensorId>,
}

/// State gathered while executing.
struct Pass {
    leaves: HashMap<TensorId, Weak<TensorImpl>>,
    captured: HashMap<TensorId, Tensor>,
    grads: Gradients,
}

fn run(
    root: &Tensor,
    seed: Option<&Tensor>,
    options: BackwardOptions,
    wanted: &HashSet<TensorId>,
    commit: bool,
) -> Result<HashMap<TensorId, Tensor>, TensorError> {
    let _guard = NoGradGuard::new();

    if !root.requires_grad() {
        log::debug!("backward from untracked {} is a no-op", root.id());
        return Ok(HashMap::new());
    }
    let seed = make_seed(root, seed)?;

    let Some(root_node) = root.grad_fn() else {
        // Leaf root: the seed is its gradient.
        let mut captured = HashMap::new();
        if wanted.contains(&root.id()) {
            captured.insert(root.id(), seed.clone());
        }
        if commit {
            let updated = merged_grad(root, seed)?;
            root.set_grad(Some(updated));
        }
        return Ok(captured);
    };

    let plan = with_tape(|tape| discover(tape, root.id(), root_node))?;
    log::debug!(
        "backward from node {root_node} over {} node(s)",
        plan.nodes.len()
    );
    with_tape(|tape| {
        for &id in &plan.nodes {
            if let Some(node) = tape.get_mut(id) {
                node.state = match plan.pending.get(&id).copied().unwrap_or(0) {
                    0 => NodeState::Ready,
                    n => NodeState::Pending(n),
                };
            }
        }
    });

    let mut taken: Vec<(NodeId, Box<dyn GradFn>)> = Vec::with_capacity(plan.nodes.len());
    let result = execute(root, seed, root_node, &plan, wanted, &mut taken).and_then(|pass| {
        let updates = if commit {
            stage_leaf_grads(pass.leaves, &pass.grads)?
        } else {
            Vec::new()
        };
        let mut captured = pass.captured;
        for (id, grad) in pass.grads.iter() {
            if wanted.contains(id) {
                captured.entry(*id).or_insert_with(|| grad.clone());
            }
        }
        Ok((updates, captured))
    });

    let release = result.is_ok() && !options.retain_graph;
    let freed = with_tape(|tape| finalize(tape, &plan, taken, result.is_ok(), release));
    drop(freed);

    let (updates, captured) = result?;
    for (tensor, grad) in updates {
        tensor.set_grad(Some(grad));
    }
    Ok(captured)
}

fn make_seed(root: &Tensor, seed: Option<&Tensor>) -> Result<Tensor, TensorError> {
    let Some(seed) = seed else {
        if root.numel() != 1 {
            return Err(TensorError::ShapeMismatch {
                expected: 1,
                actual: root.numel(),
            });
        }
        return Tensor::ones(root.shape(), root.dtype(), root.device());
    };
    if seed.shape() != root.shape() {
        return Err(TensorError::IncompatibleShapes {
            op: "backward seed".to_string(),
            lhs: root.shape().to_vec(),
            rhs: seed.shape().to_vec(),
        });
    }
    if seed.dtype() != root.dtype() || seed.device() != root.device() {
        return Err(TensorError::UnsupportedOperation {
            op: "backward seed".to_string(),
            dtypes: vec![root.dtype(), seed.dtype()],
            devices: vec![root.device(), seed.device()],
        });
    }
    Ok(seed.detach())
}

fn discover(tape: &Tape, root: TensorId, root_node: NodeId) -> Result<Plan, TensorError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        OnStack,
        Done,
    }

    let check = |id: NodeId, tensor: TensorId| -> Result<TensorId, TensorError> {
        let node = tape
            .get(id)
            .ok_or(TensorError::MissingProducer { tensor, node: id })?;
        if node.state() == NodeState::Executed || !node.is_retained() {
            return Err(TensorError::NodeAlreadyExecuted {
                node: id,
                op: node.op().to_string(),
            });
        }
        Ok(node.output())
    };

    let mut plan = Plan::default();
    let mut marks: HashMap<NodeId, Mark> = HashMap::new();
    // (node, index of the next input edge to follow)
    let mut stack: Vec<(NodeId, usize)> = Vec::new();

    plan.outputs.insert(root_node, check(root_node, root)?);
    plan.nodes.push(root_node);
    plan.pending.insert(root_node, 0);
    marks.insert(root_node, Mark::OnStack);
    stack.push((root_node, 0));

    while let Some(&(id, next)) = stack.last() {
        let node = tape.get(id).ok_or(TensorError::MissingProducer {
            tensor: plan.outputs.get(&id).copied().unwrap_or(root),
            node: id,
        })?;
        if next >= node.inputs.len() {
            marks.insert(id, Mark::Done);
            stack.pop();
            continue;
        }
        if let Some(top) = stack.last_mut() {
            top.1 += 1;
        }

        let Some(Edge {
            producer: Some(producer),
            tensor_id,
            ..
        }) = &node.inputs[next]
        else {
            continue;
        };
        let (producer, tensor_id) = (*producer, *tensor_id);

        match marks.get(&producer) {
            Some(Mark::OnStack) => return Err(TensorError::CycleDetected { node: producer }),
            Some(Mark::Done) => {}
            None => {
                plan.outputs.insert(producer, check(producer, tensor_id)?);
                plan.nodes.push(producer);
                marks.insert(producer, Mark::OnStack);
                stack.push((producer, 0));
            }
        }
        *plan.pending.entry(producer).or_insert(0) += 1;
    }

    Ok(plan)
}

fn execute(
    root: &Tensor,
    seed: Tensor,
    root_node: NodeId,
    plan: &Plan,
    wanted: &HashSet<TensorId>,
    taken: &mut Vec<(NodeId, Box<dyn GradFn>)>,
) -> Result<Pass, TensorError> {
    let mut pass = Pass {
        leaves: HashMap::new(),
        captured: HashMap::new(),
        grads: Gradients::new(),
    };
    pass.grads.accumulate(root.id(), seed)?;

    let mut pending = plan.pending.clone();
    let mut ready = BinaryHeap::from([root_node]);

    while let Some(id) = ready.pop() {
        let (grad_fn, edges, output, op) = with_tape(|tape| take_node(tape, plan, id))?;
        taken.push((id, grad_fn));

        if let Some(grad_output) = pass.grads.remove(output) {
            if wanted.contains(&output) {
                pass.captured.insert(output, grad_output.clone());
            }
            let input_grads = match taken.last() {
                Some((_, grad_fn)) => grad_fn.backward(&grad_output)?,
                None => Vec::new(),
            };
            if input_grads.len() != edges.len() {
                return Err(TensorError::GradientArity {
                    node: id,
                    expected: edges.len(),
                    actual: input_grads.len(),
                });
            }
            for (edge, grad) in edges.iter().zip(input_grads) {
                let (Some(edge), Some(grad)) = (edge, grad) else {
                    continue;
                };
                if grad.shape() != edge.shape.as_slice() {
                    return Err(TensorError::IncompatibleShapes {
                        op: format!("backward of {op}"),
                        lhs: edge.shape.clone(),
                        rhs: grad.shape().to_vec(),
                    });
                }
                pass.grads.accumulate(edge.tensor_id, grad)?;
                if edge.producer.is_none() {
                    pass.leaves
                        .entry(edge.tensor_id)
                        .or_insert_with(|| edge.tensor.clone());
                }
            }
        }

        for producer in edges.iter().flatten().filter_map(|edge| edge.producer) {
            let Some(count) = pending.get_mut(&producer) else {
                continue;
            };
            *count = count.saturating_sub(1);
            let state = if *count == 0 {
                ready.push(producer);
                NodeState::Ready
            } else {
                NodeState::Pending(*count)
            };
            with_tape(|tape| {
                if let Some(node) = tape.get_mut(producer) {
                    node.state = state;
                }
            });
        }
    }

    if let Some(&stuck) = plan
        .nodes
        .iter()
        .find(|id| pending.get(id).copied().unwrap_or(0) > 0)
    {
        return Err(TensorError::CycleDetected { node: stuck });
    }
    Ok(pass)
}

type TakenNode = (Box<dyn GradFn>, Vec<Option<Edge>>, TensorId, OpKind);

fn take_node(tape: &mut Tape, plan: &Plan, id: NodeId) -> Result<TakenNode, TensorError> {
    let Some(node) = tape.get_mut(id) else {
        return Err(match plan.outputs.get(&id) {
            Some(&tensor) => TensorError::MissingProducer { tensor, node: id },
            None => TensorError::invalid_argument(format!("node {id} was not discovered")),
        });
    };
    let op = node.op();
    if node.state == NodeState::Executed {
        return Err(TensorError::NodeAlreadyExecuted {
            node: id,
            op: op.to_string(),
        });
    }
    let grad_fn = node
        .grad_fn
        .take()
        .ok_or(TensorError::NodeAlreadyExecuted {
            node: id,
            op: op.to_string(),
        })?;
    node.state = NodeState::Executed;
    Ok((grad_fn, node.inputs.clone(), node.output(), op))
}

/// Reset node states after a pass, or retire the executed nodes when the
/// graph is released. Returns what must be dropped once the tape is no
/// longer borrowed.
fn finalize(
    tape: &mut Tape,
    plan: &Plan,
    taken: Vec<(NodeId, Box<dyn GradFn>)>,
    success: bool,
    release: bool,
) -> (Vec<Box<dyn GradFn>>, Vec<Node>) {
    let mut freed = Vec::new();
    for (id, grad_fn) in taken {
        match tape.get_mut(id) {
            Some(node) if !release => node.grad_fn = Some(grad_fn),
            _ => freed.push(grad_fn),
        }
    }
    let mut removed = Vec::new();
    for &id in &plan.nodes {
        if release {
            removed.extend(tape.retire(id));
        } else if let Some(node) = tape.get_mut(id) {
            node.state = NodeState::Unvisited;
        }
    }
    if !success {
        log::debug!("backward failed; restored {} node(s)", plan.nodes.len());
    }
    (freed, removed)
}

/// Sum new leaf gradients into the existing slots without writing them yet.
fn stage_leaf_grads(
    leaves: HashMap<TensorId, Weak<TensorImpl>>,
    grads: &Gradients,
) -> Result<Vec<(Tensor, Tensor)>, TensorError> {
    let mut updates = Vec::with_capacity(leaves.len());
    for (id, weak) in leaves {
        // A leaf dropped by the caller has no slot to fill.
        let (Some(tensor), Some(grad)) = (Tensor::upgrade(&weak), grads.get(id)) else {
            continue;
        };
        let merged = merged_grad(&tensor, grad.clone())?;
        updates.push((tensor, merged));
    }
    Ok(updates)
}

fn merged_grad(leaf: &Tensor, grad: Tensor) -> Result<Tensor, TensorError> {
    match leaf.grad() {
        Some(existing) => sum_gradients(&existing, &grad),
        None => Ok(grad),
    }
}
