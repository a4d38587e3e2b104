//! Pluggable graph compilers.
//!
//! A [`Backend`] receives every finished graph together with example inputs and
//! returns a callable, or `None` to have the graph run by the interpreter in
//! [`crate::graph`]. Backends are shared across threads and conversions.

use std::{
    any::Any,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    error::{BackendError, TraceError, TraceResult},
    graph::Graph,
    tensor::{Tensor, TensorError},
};

/// Relative and absolute tolerance of correctness verification.
const VERIFY_RTOL: f64 = 1e-4;
const VERIFY_ATOL: f64 = 1e-5;

/// A compiled graph: takes one tensor per graph input, returns the outputs.
pub type CompiledFn = Arc<dyn Fn(&[Tensor]) -> Result<Vec<Tensor>, TensorError> + Send + Sync>;

/// A graph bound to the callable a backend produced for it.
///
/// Referenced from the constant table of rewritten code and called like a
/// host function with the graph inputs as arguments.
pub struct CompiledGraph {
    name: String,
    graph: Arc<Graph>,
    func: CompiledFn,
}

impl CompiledGraph {
    #[must_use]
    pub fn new(name: impl Into<String>, graph: Arc<Graph>, func: CompiledFn) -> Self {
        Self {
            name: name.into(),
            graph,
            func,
        }
    }

    /// A graph run by the graph interpreter.
    #[must_use]
    pub fn eager(name: impl Into<String>, graph: Arc<Graph>) -> Self {
        let func = interpreter(Arc::clone(&graph));
        Self::new(name, graph, func)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn call(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, TensorError> {
        (self.func)(inputs)
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.name)
            .field("nodes", &self.graph.len())
            .finish_non_exhaustive()
    }
}

fn interpreter(graph: Arc<Graph>) -> CompiledFn {
    Arc::new(move |inputs: &[Tensor]| graph.run(inputs))
}

/// A graph compiler.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Name used in logs and in `BackendCompilerFailed`.
    fn name(&self) -> &str;

    /// Compiles `graph`. `example_inputs` hold one real value per input.
    ///
    /// `Ok(None)` declines; the graph is then interpreted.
    fn compile(&self, graph: &Graph, example_inputs: &[Tensor]) -> Result<Option<CompiledFn>, BackendError>;

    /// Value held for the lifetime of an optimize scope that uses this backend.
    fn context(&self) -> Option<Box<dyn Any>> {
        None
    }
}

/// Runs graphs with the graph interpreter.
#[derive(Debug, Default, Clone, Copy)]
pub struct Eager;

impl Backend for Eager {
    fn name(&self) -> &str {
        "eager"
    }

    fn compile(&self, graph: &Graph, _example_inputs: &[Tensor]) -> Result<Option<CompiledFn>, BackendError> {
        Ok(Some(interpreter(Arc::new(graph.clone()))))
    }
}

/// Counts compiled frames and captured operations. Declines every graph.
#[derive(Debug, Default)]
pub struct CompileCounter {
    frame_count: AtomicUsize,
    op_count: AtomicUsize,
    context_entries: Arc<AtomicUsize>,
}

impl CompileCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of graphs compiled.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Total operations across all compiled graphs.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.op_count.load(Ordering::SeqCst)
    }

    /// Number of optimize scopes entered with this backend.
    #[must_use]
    pub fn context_entries(&self) -> usize {
        self.context_entries.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.frame_count.store(0, Ordering::SeqCst);
        self.op_count.store(0, Ordering::SeqCst);
    }
}

impl Backend for CompileCounter {
    fn name(&self) -> &str {
        "compile_counter"
    }

    fn compile(&self, graph: &Graph, _example_inputs: &[Tensor]) -> Result<Option<CompiledFn>, BackendError> {
        self.frame_count.fetch_add(1, Ordering::SeqCst);
        self.op_count.fetch_add(graph.op_count(), Ordering::SeqCst);
        Ok(None)
    }

    fn context(&self) -> Option<Box<dyn Any>> {
        self.context_entries.fetch_add(1, Ordering::SeqCst);
        None
    }
}

/// Keeps a copy of every graph it is given. Declines every graph.
#[derive(Debug, Default)]
pub struct CapturingBackend {
    graphs: Mutex<Vec<Graph>>,
}

impl CapturingBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn graphs(&self) -> Vec<Graph> {
        self.graphs.lock().clone()
    }

    pub fn take(&self) -> Vec<Graph> {
        std::mem::take(&mut *self.graphs.lock())
    }
}

impl Backend for CapturingBackend {
    fn name(&self) -> &str {
        "capture"
    }

    fn compile(&self, graph: &Graph, _example_inputs: &[Tensor]) -> Result<Option<CompiledFn>, BackendError> {
        self.graphs.lock().push(graph.clone());
        Ok(None)
    }
}

/// Compiles `graph` through `backend`, falling back to the interpreter when the
/// backend declines. With `verify`, the compiled callable is run once on the
/// example inputs and compared with the interpreter.
pub(crate) fn compile_graph(
    backend: &dyn Backend,
    name: &str,
    graph: Graph,
    example_inputs: &[Tensor],
    verify: bool,
) -> TraceResult<Arc<CompiledGraph>> {
    let failed = |source: BackendError| TraceError::BackendCompilerFailed {
        backend: backend.name().to_owned(),
        source,
    };
    let compiled = backend.compile(&graph, example_inputs).map_err(failed)?;
    let graph = Arc::new(graph);
    let Some(func) = compiled else {
        return Ok(Arc::new(CompiledGraph::eager(name, graph)));
    };
    if verify {
        let expected = graph.run(example_inputs).map_err(|e| failed(e.into()))?;
        let actual = func(example_inputs).map_err(|e| failed(e.into()))?;
        let matches = expected.len() == actual.len()
            && expected
                .iter()
                .zip(&actual)
                .all(|(e, a)| e.shape() == a.shape() && e.allclose(a, VERIFY_RTOL, VERIFY_ATOL));
        if !matches {
            return Err(failed(format!("{name}: compiled outputs differ from the graph interpreter").into()));
        }
        log::debug!(target: "frametrace", "verified {name} against the graph interpreter");
    }
    Ok(Arc::new(CompiledGraph::new(name, graph, func)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        bytecode::BinOp,
        graph::{Arg, Op, TensorMeta},
        tensor::{DType, Scalar},
    };

    fn double() -> (Graph, Tensor) {
        let x = Tensor::full(&[2], 3.0, DType::Float32);
        let mut graph = Graph::new();
        let input = graph.add_placeholder("x", "L['x']", TensorMeta::of(&x));
        let out = graph
            .add_node(Op::Binary(BinOp::Mul), vec![Arg::Node(input), Arg::Scalar(Scalar::Int(2))])
            .unwrap();
        graph.set_outputs(vec![out]);
        (graph, x)
    }

    #[derive(Debug)]
    struct Wrong;

    impl Backend for Wrong {
        fn name(&self) -> &str {
            "wrong"
        }

        fn compile(&self, _graph: &Graph, _inputs: &[Tensor]) -> Result<Option<CompiledFn>, BackendError> {
            Ok(Some(Arc::new(|inputs: &[Tensor]| Ok(inputs.to_vec()))))
        }
    }

    #[derive(Debug)]
    struct Broken;

    impl Backend for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn compile(&self, _graph: &Graph, _inputs: &[Tensor]) -> Result<Option<CompiledFn>, BackendError> {
            Err("no codegen for mul".into())
        }
    }

    #[test]
    fn declining_backend_gets_interpreter() {
        let (graph, x) = double();
        let counter = CompileCounter::new();
        let compiled = compile_graph(&counter, "__compiled_fn_0", graph, &[x.clone()], true).unwrap();
        assert_eq!(counter.frame_count(), 1);
        assert_eq!(counter.op_count(), 1);
        assert_eq!(compiled.call(&[x]).unwrap()[0].data(), &[6.0, 6.0]);
    }

    #[test]
    fn verification_catches_wrong_results() {
        let (graph, x) = double();
        assert!(compile_graph(&Wrong, "g", graph.clone(), &[x.clone()], false).is_ok());
        let err = compile_graph(&Wrong, "g", graph, &[x], true).unwrap_err();
        assert!(matches!(err, TraceError::BackendCompilerFailed { ref backend, .. } if backend == "wrong"));
    }

    #[test]
    fn backend_errors_are_wrapped() {
        let (graph, x) = double();
        let err = compile_graph(&Broken, "g", graph, &[x], false).unwrap_err();
        assert_eq!(err.to_string(), "backend compiler `broken` failed: no codegen for mul");
    }

    #[test]
    fn capturing_keeps_graphs() {
        let (graph, x) = double();
        let capture = CapturingBackend::new();
        compile_graph(&capture, "g", graph.clone(), &[x], false).unwrap();
        assert_eq!(capture.take(), vec![graph]);
        assert!(capture.graphs().is_empty());
    }
}
