//! Pluggable compilers seen from the host program, and the configuration
//! options that govern how their failures are handled.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use frametrace::{
    Backend, BackendError, CompiledFn, Config, ConfigError, DType, Globals, Graph, NoPrint, NoopTracer, RunError,
    Tensor, TraceError, TracerState, Value, Vm, compile, optimize,
};
use pretty_assertions::assert_eq;

const SOURCE: &str = "
def f(x):
    return (x + 1) * 3
";

fn load() -> Globals {
    let program = compile(SOURCE, "backends.py").unwrap();
    Vm::new(&mut NoPrint, NoopTracer).run_program(&program).unwrap()
}

fn ones() -> Value {
    Value::Tensor(Tensor::full(&[2], 1.0, DType::Float32))
}

fn call_f(state: &Arc<TracerState>, backend: Arc<dyn Backend>) -> Result<Value, RunError> {
    let globals = load();
    let f = globals.borrow()["f"].clone();
    let ctx = optimize(state, backend);
    let _scope = ctx.enter();
    Vm::new(&mut NoPrint, NoopTracer).call(&f, vec![ones()])
}

/// Runs graphs through the interpreter and counts calls.
#[derive(Debug, Default)]
struct Counting {
    calls: Arc<AtomicUsize>,
}

impl Backend for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn compile(&self, graph: &Graph, _inputs: &[Tensor]) -> Result<Option<CompiledFn>, BackendError> {
        let graph = graph.clone();
        let calls = Arc::clone(&self.calls);
        Ok(Some(Arc::new(move |inputs: &[Tensor]| {
            calls.fetch_add(1, Ordering::SeqCst);
            graph.run(inputs)
        })))
    }
}

#[derive(Debug)]
struct Failing;

impl Backend for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn compile(&self, _graph: &Graph, _inputs: &[Tensor]) -> Result<Option<CompiledFn>, BackendError> {
        Err("out of registers".into())
    }
}

/// Returns its inputs unchanged instead of computing the graph.
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

#[test]
fn compiled_callables_replace_the_frame() {
    let globals = load();
    let f = globals.borrow()["f"].clone();
    let state = TracerState::new(Config::default());
    let backend = Counting::default();
    let calls = Arc::clone(&backend.calls);
    let ctx = optimize(&state, Arc::new(backend));
    let _scope = ctx.enter();
    for _ in 0..3 {
        let Value::Tensor(out) = Vm::new(&mut NoPrint, NoopTracer).call(&f, vec![ones()]).unwrap() else {
            panic!("expected a tensor");
        };
        assert_eq!(out.data(), &[6.0, 6.0]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn backend_failures_propagate_by_default() {
    let state = TracerState::new(Config::default());
    let err = call_f(&state, Arc::new(Failing)).unwrap_err();
    match err {
        RunError::Trace(TraceError::BackendCompilerFailed { backend, source }) => {
            assert_eq!(backend, "failing");
            assert_eq!(source.to_string(), "out of registers");
        }
        other => panic!("expected a backend failure, got {other}"),
    }
}

#[test]
fn backend_failures_can_fall_back() {
    let mut config = Config::default();
    config.raise_on_backend_error = false;
    let state = TracerState::new(config);
    let Value::Tensor(out) = call_f(&state, Arc::new(Failing)).unwrap() else {
        panic!("expected a tensor");
    };
    assert_eq!(out.data(), &[6.0, 6.0]);
    assert!(state.graphs().is_empty());
}

#[test]
fn verification_rejects_wrong_results() {
    let state = TracerState::new(Config::default());
    // without verification the wrong callable is trusted
    let Value::Tensor(out) = call_f(&state, Arc::new(Wrong)).unwrap() else {
        panic!("expected a tensor");
    };
    assert_eq!(out.data(), &[1.0, 1.0]);

    let mut config = Config::default();
    config.verify_correctness = true;
    let state = TracerState::new(config);
    let err = call_f(&state, Arc::new(Wrong)).unwrap_err();
    assert!(
        matches!(err, RunError::Trace(TraceError::BackendCompilerFailed { ref backend, .. }) if backend == "wrong"),
        "{err}"
    );
}

#[test]
fn options_are_set_by_name() {
    let state = TracerState::new(Config::default());
    state.set_option("cache_size_limit", "3").unwrap();
    state.set_option("dynamic_shapes", "true").unwrap();
    assert_eq!(state.config().cache_size_limit, 3);
    assert!(state.config().dynamic_shapes);

    let err = state.set_option("cache_limit", "3").unwrap_err();
    assert!(matches!(err, ConfigError::UnknownOption(ref name) if name == "cache_limit"));
    let err = state.set_option("verbose", "sometimes").unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { .. }));
}

#[test]
fn environment_and_documents_configure_the_tracer() {
    let mut config = Config::from_json(r#"{"cache_size_limit": 4, "skip_filenames": ["site-packages"]}"#).unwrap();
    config
        .apply_env([
            ("FRAMETRACE_DYNAMIC_SHAPES".to_owned(), "1".to_owned()),
            ("FRAMETRACE_CACHE_SIZE_LIMIT".to_owned(), "9".to_owned()),
            ("PATH".to_owned(), "/usr/bin".to_owned()),
        ])
        .unwrap();
    assert_eq!(config.cache_size_limit, 9);
    assert!(config.dynamic_shapes);
    assert_eq!(config.skip_filenames, vec!["site-packages".to_owned()]);

    assert!(Config::from_json(r#"{"no_such_option": true}"#).is_err());
}
