//! The symbolic tracer.
//!
//! [`trace_frame`] runs one tracing attempt over an intercepted frame and
//! returns the rewritten code, the guards under which it is valid and the
//! graphs it calls. The attempt stops at the first return or graph break;
//! everything after a break is left to a continuation that is traced on its
//! own next call.

use std::{collections::BTreeSet, sync::Arc};

use self::{
    output::OutputGraph,
    translator::Translator,
    variables::{Var, VarKind},
};
use crate::{
    backend::{Backend, CompiledGraph},
    bytecode::CodeUnit,
    config::Config,
    error::{TraceError, TraceResult},
    eval_frame::CapturedFrame,
    export::TreeSpec,
    graph::NodeId,
    guards::{GuardSet, Literal, Source},
    state::TracerState,
};

mod codegen;
mod output;
mod resume;
mod translator;
mod variables;

/// Everything one tracing attempt needs.
pub(crate) struct TraceRequest<'a> {
    pub state: &'a Arc<TracerState>,
    pub backend: &'a dyn Backend,
    pub config: &'a Config,
    pub frame: CapturedFrame<'a>,
    /// Graph breaks are errors.
    pub one_graph: bool,
    /// Return inputs through the graph and describe the result's structure.
    pub export: bool,
}

/// A finished conversion.
#[derive(Debug)]
pub(crate) struct Traced {
    pub code: Arc<CodeUnit>,
    pub guards: GuardSet,
    pub graphs: Vec<Arc<CompiledGraph>>,
    pub export: Option<ExportCapture>,
}

/// How the exported graph connects to the function's arguments and result.
#[derive(Debug)]
pub(crate) struct ExportCapture {
    /// Sources of the graph inputs in call order.
    pub inputs: Vec<Source>,
    pub out_spec: TreeSpec,
}

/// One tracing attempt. Offsets in `hints` are calls to break at instead of
/// inlining; a failed inline adds one and returns `RestartAnalysis`.
pub(crate) fn trace_frame(req: &TraceRequest<'_>, hints: &mut BTreeSet<usize>) -> TraceResult<Traced> {
    Translator::new(req, hints).run()
}

/// The structure of a returned value in terms of graph outputs.
fn tree_spec(var: &Var, outputs: &[NodeId], output: &OutputGraph) -> TraceResult<TreeSpec> {
    Ok(match &var.kind {
        VarKind::Tensor(node) => {
            let index = outputs
                .iter()
                .position(|out| out == node)
                .ok_or_else(|| TraceError::Internal(format!("node {} is not a graph output", node.index())))?;
            if output.meta(*node).scalar {
                TreeSpec::Number(index)
            } else {
                TreeSpec::Tensor(index)
            }
        }
        VarKind::Const(value) => TreeSpec::Const(
            Literal::of(value).ok_or_else(|| TraceError::Export(format!("cannot export a {}", value.type_name())))?,
        ),
        VarKind::Tuple(items) => TreeSpec::Tuple(
            items
                .iter()
                .map(|item| tree_spec(item, outputs, output))
                .collect::<TraceResult<_>>()?,
        ),
        VarKind::ConstDict(items) => TreeSpec::Dict(
            items
                .iter()
                .map(|(key, item)| Ok((key.clone(), tree_spec(item, outputs, output)?)))
                .collect::<TraceResult<_>>()?,
        ),
        _ => return Err(TraceError::Export(format!("cannot export a {} result", var.type_name()))),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        backend::CompileCounter,
        bytecode::{CodeKind, Const, compile},
        io::NoPrint,
        tensor::{DType, Tensor},
        tracer::NoopTracer,
        value::{Globals, Value},
        vm::Vm,
    };

    const SOURCE: &str = "
def simple(x):
    return x * 2 + 1

def shapes(x):
    return x.shape

def breaks(x):
    y = x + 1
    print(y)
    return y * 2

def helper(x):
    print(x)
    return x + 1

def indirect(x):
    return helper(x + 1) * 2
";

    struct Harness {
        state: Arc<TracerState>,
        counter: CompileCounter,
        globals: Globals,
    }

    impl Harness {
        fn new() -> Self {
            let program = compile(SOURCE, "model.py").unwrap();
            let globals = Vm::new(&mut NoPrint, NoopTracer).run_program(&program).unwrap();
            Self {
                state: TracerState::new(Config::default()),
                counter: CompileCounter::new(),
                globals,
            }
        }

        fn trace(&self, name: &str, hints: &mut BTreeSet<usize>) -> TraceResult<Traced> {
            let code = match &self.globals.borrow()[name] {
                Value::Function(f) => Arc::clone(f.code()),
                other => panic!("{name} is {other:?}"),
            };
            let mut locals = vec![Some(Value::Tensor(Tensor::full(&[3], 1.0, DType::Float32)))];
            locals.resize(code.varnames().len(), None);
            let config = self.state.config();
            let req = TraceRequest {
                state: &self.state,
                backend: &self.counter,
                config: &config,
                frame: CapturedFrame::new(&code, &locals, &self.globals),
                one_graph: false,
                export: false,
            };
            trace_frame(&req, hints)
        }
    }

    #[test]
    fn straight_line_code_becomes_one_graph() {
        let harness = Harness::new();
        let traced = harness.trace("simple", &mut BTreeSet::new()).unwrap();
        assert_eq!(traced.code.kind(), CodeKind::Rewritten);
        assert_eq!(traced.graphs.len(), 1);
        assert_eq!(harness.counter.op_count(), 2);
        assert_eq!(traced.guards.to_string(), "L['x'] TENSOR_MATCH float32[3]");
    }

    #[test]
    fn frames_without_operations_are_skipped() {
        let harness = Harness::new();
        let err = harness.trace("shapes", &mut BTreeSet::new()).unwrap_err();
        assert!(matches!(err, TraceError::SkipFrame(_)));
    }

    #[test]
    fn breaks_call_a_continuation() {
        let harness = Harness::new();
        let traced = harness.trace("breaks", &mut BTreeSet::new()).unwrap();
        assert_eq!(harness.counter.op_count(), 1);
        let resumes = traced
            .code
            .consts()
            .iter()
            .filter(|c| matches!(c, Const::Code(code) if code.kind() == CodeKind::Resume))
            .count();
        assert_eq!(resumes, 1);
        assert_eq!(harness.state.resume_count(), 1);
    }

    #[test]
    fn failed_inlining_restarts_with_a_hint() {
        let harness = Harness::new();
        let mut hints = BTreeSet::new();
        let err = harness.trace("indirect", &mut hints).unwrap_err();
        assert!(matches!(err, TraceError::RestartAnalysis(_)));
        assert_eq!(hints.len(), 1);
        let traced = harness.trace("indirect", &mut hints).unwrap();
        assert_eq!(traced.graphs.len(), 1);
    }
}
