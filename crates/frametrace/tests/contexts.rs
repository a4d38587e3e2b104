//! The interception modes and the contexts that switch between them.

use std::sync::Arc;

use frametrace::{
    CompileCounter, Config, DType, EvalMode, Globals, NoPrint, NoopTracer, RunError, Tensor, TraceError, TracerState,
    Value, Vm, compile, current_mode, disable, optimize, optimize_assert, run, skip,
};
use pretty_assertions::assert_eq;

const SOURCE: &str = "
def f(x):
    return x * 2 + 1

def g(x):
    return x - 1

def build(n):
    return ones(n)

def make(n):
    return build(n) * 2

def noisy(x):
    print(x)
    return x + 1
";

fn load(filename: &str) -> Globals {
    let program = compile(SOURCE, filename).unwrap();
    Vm::new(&mut NoPrint, NoopTracer).run_program(&program).unwrap()
}

fn ones(size: usize) -> Value {
    Value::Tensor(Tensor::full(&[size], 1.0, DType::Float32))
}

fn call(f: &Value, args: Vec<Value>) -> Result<Value, RunError> {
    Vm::new(&mut NoPrint, NoopTracer).call(f, args)
}

fn data(value: &Value) -> Vec<f64> {
    match value {
        Value::Tensor(t) => t.data().to_vec(),
        other => panic!("expected a tensor, got {other}"),
    }
}

#[test]
fn run_only_reuses_entries_without_converting() {
    let globals = load("contexts.py");
    let f = globals.borrow()["f"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    {
        let ctx = optimize(&state, counter.clone());
        let _scope = ctx.enter();
        call(&f, vec![ones(3)]).unwrap();
    }
    let converted = state.stats().frames_converted;

    let _scope = run(&state).enter();
    assert_eq!(data(&call(&f, vec![ones(3)]).unwrap()), vec![3.0; 3]);
    assert_eq!(data(&call(&f, vec![ones(5)]).unwrap()), vec![3.0; 5]);
    assert_eq!(counter.frame_count(), 1);
    assert_eq!(state.stats().frames_converted, converted);
    assert!(state.stats().cache_hits >= 1);
}

#[test]
fn disabled_code_runs_plainly() {
    let globals = load("contexts.py");
    let f = globals.borrow()["f"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();
    {
        let _off = disable().enter();
        call(&f, vec![ones(3)]).unwrap();
    }
    assert_eq!(counter.frame_count(), 0);

    let plain = disable().wrap(&f);
    assert_eq!(data(&call(&plain, vec![ones(3)]).unwrap()), vec![3.0; 3]);
    assert_eq!(counter.frame_count(), 0);

    call(&f, vec![ones(3)]).unwrap();
    assert_eq!(counter.frame_count(), 1);
}

#[test]
fn scopes_restore_the_previous_mode() {
    let state = TracerState::new(Config::default());
    let ctx = optimize(&state, Arc::new(CompileCounter::new()));
    assert!(matches!(current_mode(), EvalMode::Disabled));
    {
        let _outer = ctx.enter();
        {
            let _inner = run(&state).enter();
            assert!(matches!(current_mode(), EvalMode::RunOnly(_)));
        }
        assert!(matches!(current_mode(), EvalMode::Optimize(_)));
    }
    assert!(matches!(current_mode(), EvalMode::Disabled));
}

#[test]
fn wrapped_functions_switch_modes_per_call() {
    let globals = load("contexts.py");
    let f = globals.borrow()["f"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let traced = optimize(&state, counter.clone()).wrap(&f);

    assert_eq!(data(&call(&traced, vec![ones(2)]).unwrap()), vec![3.0; 2]);
    assert_eq!(counter.frame_count(), 1);
    // the wrapper leaves the thread's mode as it found it
    assert!(matches!(current_mode(), EvalMode::Disabled));
    call(&f, vec![ones(4)]).unwrap();
    assert_eq!(counter.frame_count(), 1);
}

#[test]
fn wrapping_traces_frames_without_tensors() {
    let globals = load("contexts.py");
    let make = globals.borrow()["make"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    {
        let ctx = optimize(&state, counter.clone());
        let _scope = ctx.enter();
        assert_eq!(data(&call(&make, vec![Value::Int(3)]).unwrap()), vec![2.0; 3]);
    }
    // only `build` was traced: it names a tensor-creating builtin
    assert_eq!((counter.frame_count(), counter.op_count()), (1, 1));

    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let traced = optimize(&state, counter.clone()).wrap(&make);
    let Value::Function(func) = &make else {
        panic!("make is not a function");
    };
    assert!(state.is_always_trace(func.code()));
    assert_eq!(data(&call(&traced, vec![Value::Int(3)]).unwrap()), vec![2.0; 3]);
    assert_eq!((counter.frame_count(), counter.op_count()), (1, 2));
}

#[test]
fn skipped_functions_are_never_traced() {
    let globals = load("contexts.py");
    let f = globals.borrow()["f"].clone();
    let g = globals.borrow()["g"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let f = skip(&state, &f);

    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();
    assert_eq!(data(&call(&f, vec![ones(2)]).unwrap()), vec![3.0; 2]);
    assert_eq!(counter.frame_count(), 0);
    call(&g, vec![ones(2)]).unwrap();
    assert_eq!(counter.frame_count(), 1);
}

#[test]
fn the_backend_sees_every_optimize_scope() {
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    for _ in 0..3 {
        let _scope = ctx.enter();
    }
    assert_eq!(counter.context_entries(), 3);
}

#[test]
fn assert_mode_propagates_graph_breaks() {
    let globals = load("contexts.py");
    let noisy = globals.borrow()["noisy"].clone();
    let state = TracerState::new(Config::default());
    let ctx = optimize_assert(&state, Arc::new(CompileCounter::new()));
    let _scope = ctx.enter();
    let err = call(&noisy, vec![ones(2)]).unwrap_err();
    assert!(matches!(err, RunError::Trace(TraceError::Unsupported(_))), "{err}");
    assert!(err.as_exception().is_none());
}

#[test]
fn assert_mode_accepts_single_graph_frames() {
    let globals = load("contexts.py");
    let f = globals.borrow()["f"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize_assert(&state, counter.clone());
    let _scope = ctx.enter();
    call(&f, vec![ones(2)]).unwrap();
    assert_eq!(counter.frame_count(), 1);
}

#[test]
fn debug_function_limits_tracing_to_one_name() {
    let globals = load("contexts.py");
    let f = globals.borrow()["f"].clone();
    let g = globals.borrow()["g"].clone();
    let mut config = Config::default();
    config.debug_function = Some("g".to_owned());
    let state = TracerState::new(config);
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();
    call(&f, vec![ones(2)]).unwrap();
    assert_eq!(counter.frame_count(), 0);
    call(&g, vec![ones(2)]).unwrap();
    assert_eq!(counter.frame_count(), 1);
}

#[test]
fn skipped_filenames_are_not_traced() {
    let globals = load("vendored/lib.py");
    let f = globals.borrow()["f"].clone();
    let mut config = Config::default();
    config.skip_filenames = vec!["vendored/".to_owned()];
    let state = TracerState::new(config);
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();
    assert_eq!(data(&call(&f, vec![ones(2)]).unwrap()), vec![3.0; 2]);
    assert_eq!(counter.frame_count(), 0);
}
