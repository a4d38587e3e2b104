//! The graph under construction, the frame values it reads and the guards
//! that pin them.

use std::{rc::Rc, sync::Arc};

use ahash::AHashMap;

use super::variables::{Var, VarKind};
use crate::{
    backend::{Backend, CompiledGraph, compile_graph},
    error::{TraceError, TraceResult},
    graph::{Arg, Graph, NodeId, Op, TensorMeta},
    guards::{Guard, GuardKind, GuardSet, Literal, Source},
    state::TracerState,
    tensor::Tensor,
    value::Value,
};

/// A graph placeholder and the frame value it was created from.
#[derive(Debug, Clone)]
pub(crate) struct GraphInput {
    pub node: NodeId,
    pub source: Source,
    pub example: Tensor,
    /// Some size of this input was read by host code while tracing, so the
    /// conversion is only valid for its exact shape.
    pub size_read: bool,
}

/// Where a finished graph goes.
pub(crate) struct CompileContext<'a> {
    pub state: &'a TracerState,
    pub backend: &'a dyn Backend,
    pub verify: bool,
    /// Every tensor in the result becomes a graph output, inputs included.
    pub export: bool,
}

#[derive(Debug)]
pub(crate) struct OutputGraph {
    graph: Graph,
    inputs: Vec<GraphInput>,
    guards: Vec<Guard>,
    wrapped: AHashMap<Source, Var>,
    dynamic_shapes: bool,
}

impl OutputGraph {
    pub fn new(dynamic_shapes: bool) -> Self {
        Self {
            graph: Graph::new(),
            inputs: Vec::new(),
            guards: Vec::new(),
            wrapped: AHashMap::new(),
            dynamic_shapes,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn inputs(&self) -> &[GraphInput] {
        &self.inputs
    }

    pub fn input(&self, node: NodeId) -> Option<&GraphInput> {
        self.inputs.iter().find(|input| input.node == node)
    }

    pub fn is_input(&self, node: NodeId) -> bool {
        self.input(node).is_some()
    }

    pub fn meta(&self, node: NodeId) -> &TensorMeta {
        &self.graph.node(node).meta
    }

    pub fn guard(&mut self, source: Source, kind: GuardKind) {
        self.guards.push(Guard::new(source, kind));
    }

    /// Turns a value read from the frame into a symbolic value, recording the
    /// guards that make the conversion valid for it. Reading the same source
    /// twice gives the same symbolic value.
    pub fn wrap(&mut self, value: &Value, source: Source) -> TraceResult<Var> {
        if let Some(var) = self.wrapped.get(&source) {
            return Ok(var.clone());
        }
        if let Some(id) = value.identity() {
            self.guard(source.clone(), GuardKind::Identity(id));
        }
        let kind = match value {
            Value::Tensor(tensor) => {
                let node = self
                    .graph
                    .add_placeholder(&source.name_hint(), &source.to_string(), TensorMeta::of(tensor));
                self.inputs.push(GraphInput {
                    node,
                    source: source.clone(),
                    example: tensor.clone(),
                    size_read: false,
                });
                VarKind::Tensor(node)
            }
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) | Value::Range(_) => {
                if let Some(literal) = Literal::of(value) {
                    self.guard(source.clone(), GuardKind::ValueMatch(literal));
                }
                VarKind::Const(value.clone())
            }
            Value::Tuple(items) => {
                self.guard(
                    source.clone(),
                    GuardKind::TypeMatch {
                        type_name: value.type_name().to_owned(),
                        len: Some(items.len()),
                    },
                );
                let items = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.wrap(item, source.index(i)))
                    .collect::<TraceResult<Vec<_>>>()?;
                VarKind::Tuple(items.into())
            }
            Value::Function(func) => VarKind::Function(Rc::clone(func)),
            Value::Builtin(builtin) => VarKind::Builtin(*builtin),
            Value::ExcClass(exc) => VarKind::ExcClass(*exc),
            Value::Object(obj) => VarKind::Object(Rc::clone(obj)),
            Value::Dict(dict) => VarKind::Dict(Rc::clone(dict)),
            other => {
                return Err(TraceError::Unsupported(format!(
                    "cannot trace a {} read from {source}",
                    other.type_name()
                )));
            }
        };
        let var = Var::sourced(kind, source.clone());
        self.wrapped.insert(source, var.clone());
        Ok(var)
    }

    /// The graph operand for a tensor or a number.
    pub fn operand(var: &Var) -> Option<Arg> {
        match &var.kind {
            VarKind::Tensor(node) => Some(Arg::Node(*node)),
            VarKind::Const(value) => value.as_scalar().map(Arg::Scalar),
            _ => None,
        }
    }

    /// Adds an operation. Failures are errors the host code would raise, so
    /// they leave the frame to the interpreter.
    pub fn add_op(&mut self, op: Op, args: Vec<Arg>) -> TraceResult<Var> {
        let node = self
            .graph
            .add_node(op, args)
            .map_err(|err| TraceError::DataDependent(format!("operation fails while tracing: {err}")))?;
        Ok(Var::tensor(node))
    }

    /// Records that host code depends on the sizes of `node`, which pins the
    /// shapes of every input it derives from.
    pub fn mark_size_read(&mut self, node: NodeId) {
        let mut pending = vec![node];
        let mut seen = vec![false; self.graph.len()];
        while let Some(id) = pending.pop() {
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            if let Some(input) = self.inputs.iter_mut().find(|input| input.node == id) {
                input.size_read = true;
            }
            pending.extend(self.graph.node(id).args.iter().filter_map(|arg| match arg {
                Arg::Node(id) => Some(*id),
                Arg::Scalar(_) => None,
            }));
        }
    }

    /// Every guard recorded so far plus one shape guard per input.
    pub fn guard_set(&self) -> GuardSet {
        let tensors = self.inputs.iter().map(|input| {
            let kind = if self.dynamic_shapes && !input.size_read {
                GuardKind::tensor_dynamic(&input.example)
            } else {
                GuardKind::tensor_exact(&input.example)
            };
            Guard::new(input.source.clone(), kind)
        });
        GuardSet::build(self.guards.iter().cloned().chain(tensors))
    }

    /// Compiles the part of the graph `outputs` depend on.
    ///
    /// Returns the compiled graph and the sources of its inputs in call order.
    pub fn compile(
        &self,
        ctx: &CompileContext<'_>,
        outputs: Vec<NodeId>,
    ) -> TraceResult<(Arc<CompiledGraph>, Vec<Source>)> {
        let mut graph = self.graph.clone();
        graph.set_outputs(outputs);
        let (pruned, kept) = graph.prune();
        let mut sources = Vec::with_capacity(kept.len());
        let mut examples = Vec::with_capacity(kept.len());
        for node in kept {
            let input = self
                .input(node)
                .ok_or_else(|| TraceError::Internal(format!("placeholder {} has no source", node.index())))?;
            sources.push(input.source.clone());
            examples.push(input.example.clone());
        }
        let name = ctx.state.next_graph_name();
        log::info!(target: "frametrace", "GRAPH {name}\n{pruned}");
        let compiled = compile_graph(ctx.backend, &name, pruned, &examples, ctx.verify)?;
        ctx.state.register_graph(Arc::clone(&compiled));
        Ok((compiled, sources))
    }
}
