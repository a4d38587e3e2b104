//! Captured computation graphs.
//!
//! A [`Graph`] is a flat list of nodes in topological order. Placeholders come
//! first in call order; every other node refers to earlier nodes or to inline
//! scalars. Each node carries [`TensorMeta`], inferred when the node is added by
//! running the operation on stand-in tensors of the right dtype and shape, so
//! shape errors surface while tracing rather than when the graph first runs.
//!
//! [`Graph::run`] is the reference interpreter used by the `eager` backend,
//! by correctness verification and by the tracer's own metadata inference.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

use crate::{
    bytecode::{BinOp, CmpOp},
    tensor::{DType, Scalar, Shape, Tensor, TensorError},
};

/// Index of a node in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A graph operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Input `index` of the graph, read from `source` by the calling code.
    Placeholder { index: usize, source: String },
    Binary(BinOp),
    Compare(CmpOp),
    Neg,
    Abs,
    Relu,
    Sum,
    Mean,
    /// Selects along the first dimension.
    Select(i64),
    /// Extracts the value of a single-element tensor as a 0-d tensor standing
    /// for a host scalar.
    Item,
    Full { shape: Vec<usize>, fill: Scalar },
    Arange(usize),
    Constant(Tensor),
}

impl Op {
    fn base_name(&self) -> &'static str {
        match self {
            Self::Placeholder { .. } => "arg",
            Self::Binary(op) => op.into(),
            Self::Compare(op) => op.into(),
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Relu => "relu",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Select(_) => "select",
            Self::Item => "item",
            Self::Full { .. } => "full",
            Self::Arange(_) => "arange",
            Self::Constant(_) => "constant",
        }
    }

    /// Applies the operation to evaluated arguments.
    pub fn eval(&self, args: &[Tensor]) -> Result<Tensor, TensorError> {
        let arg = |i: usize| {
            args.get(i)
                .ok_or_else(|| TensorError::invalid(format!("{} expects {} argument(s)", self.base_name(), i + 1)))
        };
        match self {
            Self::Placeholder { index, .. } => Err(TensorError::invalid(format!("placeholder {index} has no value"))),
            Self::Binary(op) => arg(0)?.binary(*op, arg(1)?),
            Self::Compare(op) => arg(0)?.compare(*op, arg(1)?),
            Self::Neg => arg(0)?.neg(),
            Self::Abs => Ok(arg(0)?.abs()),
            Self::Relu => Ok(arg(0)?.relu()),
            Self::Sum => Ok(arg(0)?.sum()),
            Self::Mean => arg(0)?.mean(),
            Self::Select(index) => arg(0)?.select(*index),
            Self::Item => Ok(Tensor::scalar(arg(0)?.item()?)),
            Self::Full { shape, fill } => Ok(Tensor::full(shape, fill.as_f64(), fill.dtype())),
            Self::Arange(n) => Ok(Tensor::arange(*n)),
            Self::Constant(t) => Ok(t.clone()),
        }
    }
}

/// An operand: another node or an inline scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Node(NodeId),
    Scalar(Scalar),
}

/// Static description of a node's value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorMeta {
    pub dtype: DType,
    pub shape: Shape,
    /// The value stands for a host scalar (the result of `item()`).
    pub scalar: bool,
}

impl TensorMeta {
    #[must_use]
    pub fn of(tensor: &Tensor) -> Self {
        Self {
            dtype: tensor.dtype(),
            shape: tensor.shape().into(),
            scalar: false,
        }
    }

    /// A tensor with this metadata, filled with ones.
    #[must_use]
    pub fn stand_in(&self) -> Tensor {
        Tensor::full(&self.shape, 1.0, self.dtype)
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scalar {
            return write!(f, "{} scalar", self.dtype);
        }
        write!(f, "{}{:?}", self.dtype, self.shape.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub args: Vec<Arg>,
    pub meta: TensorMeta,
}

/// A computation graph with its outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
    outputs: Vec<NodeId>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    #[must_use]
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Input nodes in call order.
    pub fn placeholders(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| matches!(node.op, Op::Placeholder { .. }))
            .map(|(index, node)| (node_id(index), node))
    }

    /// Number of nodes that are not placeholders.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| !matches!(node.op, Op::Placeholder { .. }))
            .count()
    }

    /// Adds an input read from `source`. `hint` names the node.
    pub fn add_placeholder(&mut self, hint: &str, source: &str, meta: TensorMeta) -> NodeId {
        let index = self.placeholders().count();
        let name = self.unique_name(hint);
        self.push(Node {
            name,
            op: Op::Placeholder {
                index,
                source: source.to_owned(),
            },
            args: Vec::new(),
            meta,
        })
    }

    /// Adds an operation, inferring its metadata from its arguments.
    ///
    /// Fails, leaving the graph unchanged, when the operation would fail on
    /// values of the argument shapes and dtypes.
    pub fn add_node(&mut self, op: Op, args: Vec<Arg>) -> Result<NodeId, TensorError> {
        let inputs: Vec<Tensor> = args
            .iter()
            .map(|arg| match arg {
                Arg::Node(id) => self.node(*id).meta.stand_in(),
                Arg::Scalar(s) => Tensor::scalar(*s),
            })
            .collect();
        let value = op.eval(&inputs)?;
        let mut meta = TensorMeta::of(&value);
        // arithmetic between host scalars stays a host scalar
        meta.scalar = match op {
            Op::Item => true,
            Op::Binary(_) | Op::Compare(_) | Op::Neg | Op::Abs => {
                let mut nodes = args.iter().filter_map(|arg| match arg {
                    Arg::Node(id) => Some(*id),
                    Arg::Scalar(_) => None,
                });
                nodes.clone().next().is_some() && nodes.all(|id| self.node(id).meta.scalar)
            }
            _ => false,
        };
        let name = self.unique_name(op.base_name());
        Ok(self.push(Node { name, op, args, meta }))
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    /// Drops every node added after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
        self.outputs.retain(|id| id.index() < len);
    }

    /// Removes nodes the outputs do not depend on, placeholders included.
    ///
    /// Returns the pruned graph and, for each of its placeholders in order, the
    /// id the placeholder had in `self`.
    #[must_use]
    pub fn prune(&self) -> (Self, Vec<NodeId>) {
        let mut used = vec![false; self.nodes.len()];
        for id in &self.outputs {
            used[id.index()] = true;
        }
        for index in (0..self.nodes.len()).rev() {
            if used[index] {
                for arg in &self.nodes[index].args {
                    if let Arg::Node(id) = arg {
                        used[id.index()] = true;
                    }
                }
            }
        }
        let mut remap = vec![None; self.nodes.len()];
        let mut pruned = Self::new();
        let mut kept_inputs = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if !used[index] {
                continue;
            }
            let mut node = node.clone();
            if let Op::Placeholder { index: input, .. } = &mut node.op {
                *input = kept_inputs.len();
                kept_inputs.push(node_id(index));
            }
            for arg in &mut node.args {
                if let Arg::Node(id) = arg {
                    *id = remap[id.index()].unwrap_or(*id);
                }
            }
            remap[index] = Some(pruned.push(node));
        }
        pruned.outputs = self.outputs.iter().filter_map(|id| remap[id.index()]).collect();
        (pruned, kept_inputs)
    }

    /// Runs the graph on concrete inputs, one per placeholder.
    pub fn run(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, TensorError> {
        let expected = self.placeholders().count();
        if inputs.len() != expected {
            return Err(TensorError::invalid(format!(
                "graph expects {expected} input(s), got {}",
                inputs.len()
            )));
        }
        let mut values: Vec<Tensor> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let value = match &node.op {
                Op::Placeholder { index, .. } => inputs[*index].clone(),
                op => {
                    let args: Vec<Tensor> = node
                        .args
                        .iter()
                        .map(|arg| match arg {
                            Arg::Node(id) => values[id.index()].clone(),
                            Arg::Scalar(s) => Tensor::scalar(*s),
                        })
                        .collect();
                    op.eval(&args)?
                }
            };
            values.push(value);
        }
        Ok(self.outputs.iter().map(|id| values[id.index()].clone()).collect())
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        node_id(self.nodes.len() - 1)
    }

    fn unique_name(&self, hint: &str) -> String {
        let base: String = hint
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let base = if base.is_empty() { "arg".to_owned() } else { base };
        let taken = |name: &str| self.nodes.iter().any(|node| node.name == name);
        if !taken(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{base}_{n}"))
            .find(|name| !taken(name))
            .unwrap_or(base)
    }
}

fn node_id(index: usize) -> NodeId {
    NodeId(u32::try_from(index).unwrap_or(u32::MAX))
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params = String::new();
        for (i, (_, node)) in self.placeholders().enumerate() {
            if i > 0 {
                params.push_str(", ");
            }
            let _ = write!(params, "%{}: {}", node.name, node.meta);
        }
        writeln!(f, "graph({params}):")?;
        for node in &self.nodes {
            match &node.op {
                Op::Placeholder { source, .. } => writeln!(f, "    # %{} <- {source}", node.name)?,
                op => {
                    let mut args = Vec::with_capacity(node.args.len());
                    for arg in &node.args {
                        args.push(match arg {
                            Arg::Node(id) => format!("%{}", self.node(*id).name),
                            Arg::Scalar(s) => s.to_string(),
                        });
                    }
                    match op {
                        Op::Select(index) => args.push(index.to_string()),
                        Op::Full { shape, fill } => {
                            args.push(format!("{shape:?}"));
                            args.push(fill.to_string());
                        }
                        Op::Arange(n) => args.push(n.to_string()),
                        _ => {}
                    }
                    writeln!(
                        f,
                        "    %{} = {}({}) : {}",
                        node.name,
                        op.base_name(),
                        args.join(", "),
                        node.meta
                    )?;
                }
            }
        }
        let outputs: Vec<String> = self.outputs.iter().map(|id| format!("%{}", self.node(*id).name)).collect();
        if outputs.len() == 1 {
            write!(f, "    return ({},)", outputs[0])
        } else {
            write!(f, "    return ({})", outputs.join(", "))
        }
    }
}
