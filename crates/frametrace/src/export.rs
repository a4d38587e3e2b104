//! Whole-function capture.
//!
//! [`export`] traces a function once, without running it, in one-graph mode:
//! any graph break is an error. The result is an [`ExportedProgram`] holding
//! the graph, the guards it was captured under and the structure connecting
//! it to the function's arguments and result. Programs serialize to JSON and
//! to postcard.

use std::{collections::BTreeSet, rc::Rc, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    backend::CapturingBackend,
    error::{ExcType, RunResult, TraceError, TraceResult},
    eval_frame::CapturedFrame,
    graph::Graph,
    guards::{GuardSet, Literal, Source},
    state::TracerState,
    symbolic::{TraceRequest, trace_frame},
    tensor::Tensor,
    value::{Dict, Range, Value, new_globals},
    vm::tensor_error,
};

/// Position of each graph output in the function's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeSpec {
    /// The graph output at this index.
    Tensor(usize),
    /// The graph output at this index, converted to a number.
    Number(usize),
    Const(Literal),
    Tuple(Vec<TreeSpec>),
    Dict(Vec<(String, TreeSpec)>),
}

impl TreeSpec {
    /// Rebuilds a result from graph outputs.
    pub fn unflatten(&self, outputs: &[Tensor]) -> RunResult<Value> {
        let output = |index: usize| match outputs.get(index) {
            Some(tensor) => Ok(tensor),
            None => ExcType::ValueError.raise(format!("graph produced no output {index}")),
        };
        Ok(match self {
            Self::Tensor(index) => Value::Tensor(output(*index)?.clone()),
            Self::Number(index) => output(*index)?.item().map_err(tensor_error)?.into(),
            Self::Const(literal) => literal_value(literal),
            Self::Tuple(items) => Value::tuple(
                items
                    .iter()
                    .map(|item| item.unflatten(outputs))
                    .collect::<RunResult<_>>()?,
            ),
            Self::Dict(items) => {
                let items = items
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), item.unflatten(outputs)?)))
                    .collect::<RunResult<IndexMap<_, _>>>()?;
                Value::Dict(Rc::new(Dict::new(items)))
            }
        })
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::None => Value::None,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(bits) => Value::Float(f64::from_bits(*bits)),
        Literal::Str(s) => Value::str(s),
        Literal::Range { start, stop, step } => Value::Range(Range {
            start: *start,
            stop: *stop,
            step: *step,
        }),
    }
}

/// A captured function: one graph plus how to feed it and read its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedProgram {
    pub graph: Graph,
    pub guards: GuardSet,
    /// Where each graph input is read from, in call order. Paths are rooted at
    /// the function's arguments.
    pub in_spec: Vec<Source>,
    pub out_spec: TreeSpec,
}

impl ExportedProgram {
    /// Runs the graph on arguments laid out like the exported function's.
    ///
    /// Arguments must pass the guards the program was captured under.
    pub fn run(&self, args: &[Value]) -> RunResult<Value> {
        let locals: Vec<Option<Value>> = args.iter().cloned().map(Some).collect();
        let globals = new_globals();
        if let Some(failed) = self
            .guards
            .guards()
            .iter()
            .find(|guard| is_argument(&guard.source) && !guard.check(&locals, &globals))
        {
            return ExcType::ValueError.raise(format!("arguments do not match the exported program: {failed}"));
        }
        let inputs = self
            .in_spec
            .iter()
            .map(|source| match source.resolve(&locals, &globals) {
                Some(Value::Tensor(tensor)) => Ok(tensor),
                _ => ExcType::TypeError.raise(format!("exported program expects a tensor at {source}")),
            })
            .collect::<RunResult<Vec<_>>>()?;
        let outputs = self.graph.run(&inputs).map_err(tensor_error)?;
        self.out_spec.unflatten(&outputs)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

fn is_argument(source: &Source) -> bool {
    match source {
        Source::Local { .. } => true,
        Source::Global(_) => false,
        Source::Attr(base, _) | Source::Index(base, _) | Source::DictItem(base, _) => is_argument(base),
    }
}

/// Captures `f` called with `args` as a single graph.
///
/// Fails with [`TraceError::Export`] when `f` is not a plain function, when it
/// reads tensors from globals, or when tracing does not produce exactly one
/// graph. Graph breaks surface as [`TraceError::Unsupported`].
pub fn export(state: &Arc<TracerState>, f: &Value, args: &[Value]) -> TraceResult<ExportedProgram> {
    let Value::Function(func) = f else {
        return Err(TraceError::Export(format!("cannot export a {}", f.type_name())));
    };
    let code = func.code();
    if args.len() != code.arg_count() {
        return Err(TraceError::Export(format!(
            "{} takes {} arguments ({} given)",
            code.describe(),
            code.arg_count(),
            args.len()
        )));
    }
    let mut locals: Vec<Option<Value>> = args.iter().cloned().map(Some).collect();
    locals.resize(code.varnames().len(), None);
    let config = state.config();
    let backend = CapturingBackend::new();
    let req = TraceRequest {
        state,
        backend: &backend,
        config: &config,
        frame: CapturedFrame::new(code, &locals, func.globals()),
        one_graph: true,
        export: true,
    };
    let _compiling = state.compile_lock();
    let traced = trace_frame(&req, &mut BTreeSet::new())?;
    let Some(capture) = traced.export else {
        return Err(TraceError::Internal("export trace returned no capture".to_owned()));
    };
    let mut graphs = backend.take();
    if graphs.len() != 1 {
        return Err(TraceError::Export(format!(
            "expected one graph from {}, captured {}",
            code.describe(),
            graphs.len()
        )));
    }
    if let Some(global) = capture.inputs.iter().find(|source| !is_argument(source)) {
        return Err(TraceError::Export(format!("graph reads a tensor from {global}")));
    }
    let program = ExportedProgram {
        graph: graphs.remove(0),
        guards: traced.guards,
        in_spec: capture.inputs,
        out_spec: capture.out_spec,
    };
    log::info!(target: "frametrace", "exported {}\n{}", code.describe(), program.graph);
    Ok(program)
}
