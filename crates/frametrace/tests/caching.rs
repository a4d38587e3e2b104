//! Cache reuse, recompilation on guard failure, the per-call-site limit and
//! resetting the tracer state.

use std::sync::Arc;

use frametrace::{
    CompileCounter, Config, DType, ExcType, Globals, NoPrint, NoopTracer, Tensor, TracerState, Value, Vm, compile,
    optimize,
};
use pretty_assertions::assert_eq;

const SOURCE: &str = "
def f(x):
    return x * 2 + 1

def g(x, n):
    return x + n

def add(x, y):
    return x + y
";

fn load() -> Globals {
    let program = compile(SOURCE, "caching.py").unwrap();
    Vm::new(&mut NoPrint, NoopTracer).run_program(&program).unwrap()
}

fn ones(shape: &[usize]) -> Value {
    Value::Tensor(Tensor::full(shape, 1.0, DType::Float32))
}

fn call(f: &Value, args: Vec<Value>) -> Value {
    Vm::new(&mut NoPrint, NoopTracer).call(f, args).unwrap()
}

fn code_of(f: &Value) -> Arc<frametrace::CodeUnit> {
    match f {
        Value::Function(func) => Arc::clone(func.code()),
        other => panic!("not a function: {other}"),
    }
}

#[test]
fn identical_calls_reuse_one_entry() {
    let globals = load();
    let f = globals.borrow()["f"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();

    for _ in 0..5 {
        call(&f, vec![ones(&[3])]);
    }
    assert_eq!(counter.frame_count(), 1);
    assert_eq!(counter.op_count(), 2);
    assert_eq!(state.cache_size(&code_of(&f)), 1);
    let stats = state.stats();
    assert_eq!(stats.frames_converted, 1);
    assert_eq!(stats.cache_hits, 4);
}

#[test]
fn a_new_shape_adds_an_entry() {
    let globals = load();
    let f = globals.borrow()["f"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();

    call(&f, vec![ones(&[3])]);
    call(&f, vec![ones(&[4])]);
    call(&f, vec![ones(&[3])]);
    call(&f, vec![ones(&[4])]);
    assert_eq!(counter.frame_count(), 2);
    assert_eq!(state.cache_size(&code_of(&f)), 2);
    assert_eq!(
        state.last_guard_failure(&code_of(&f)).as_deref(),
        Some("L['x'] TENSOR_MATCH float32[3]")
    );
}

#[test]
fn constants_are_specialized() {
    let globals = load();
    let g = globals.borrow()["g"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();

    for n in [1, 2, 1, 2, 3] {
        let Value::Tensor(out) = call(&g, vec![ones(&[2]), Value::Int(n)]) else {
            panic!("expected a tensor");
        };
        assert_eq!(out.data(), &[1.0 + n as f64; 2]);
    }
    assert_eq!(counter.frame_count(), 3);
}

#[test]
fn the_cache_limit_disables_the_call_site() {
    let globals = load();
    let f = globals.borrow()["f"].clone();
    let mut config = Config::default();
    config.cache_size_limit = 2;
    let state = TracerState::new(config);
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();

    for size in 1..=4 {
        let Value::Tensor(out) = call(&f, vec![ones(&[size])]) else {
            panic!("expected a tensor");
        };
        assert_eq!(out.shape(), &[size]);
    }
    let code = code_of(&f);
    assert_eq!(counter.frame_count(), 2);
    assert_eq!(state.cache_size(&code), 2);
    assert!(state.is_skipped(&code));

    // entries made before the limit still serve their shapes
    call(&f, vec![ones(&[1])]);
    assert_eq!(counter.frame_count(), 2);
}

#[test]
fn reset_forgets_everything() {
    let globals = load();
    let f = globals.borrow()["f"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();

    call(&f, vec![ones(&[3])]);
    assert_eq!(state.graphs().len(), 1);
    state.reset();
    assert_eq!(state.cache_size(&code_of(&f)), 0);
    assert!(state.graphs().is_empty());
    assert_eq!(state.stats(), frametrace::Stats::default());

    call(&f, vec![ones(&[3])]);
    assert_eq!(counter.frame_count(), 2);
}

#[test]
fn clearing_one_call_site_keeps_the_others() {
    let globals = load();
    let f = globals.borrow()["f"].clone();
    let g = globals.borrow()["g"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();

    call(&f, vec![ones(&[3])]);
    call(&g, vec![ones(&[3]), Value::Int(1)]);
    state.clear_code(&code_of(&f));
    assert_eq!(state.cache_size(&code_of(&f)), 0);
    assert_eq!(state.cache_size(&code_of(&g)), 1);
    assert_eq!(state.graphs().len(), 1);
}

#[test]
fn failing_on_some_inputs_keeps_the_call_site_traceable() {
    let globals = load();
    let add = globals.borrow()["add"].clone();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    let ctx = optimize(&state, counter.clone());
    let _scope = ctx.enter();

    // shapes that do not broadcast raise the interpreter's own error
    let err = Vm::new(&mut NoPrint, NoopTracer)
        .call(&add, vec![ones(&[2]), ones(&[3])])
        .unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::RuntimeError));
    let code = code_of(&add);
    assert!(!state.is_skipped(&code));
    assert_eq!(state.stats().unsupported, 1);
    assert_eq!(counter.frame_count(), 0);

    let Value::Tensor(out) = call(&add, vec![ones(&[2]), ones(&[2])]) else {
        panic!("expected a tensor");
    };
    assert_eq!(out.data(), &[2.0, 2.0]);
    assert_eq!(counter.frame_count(), 1);
    assert_eq!(state.cache_size(&code), 1);
}

#[test]
fn threads_sharing_a_state_convert_a_call_site_once() {
    let program = compile(SOURCE, "caching.py").unwrap();
    let state = TracerState::new(Config::default());
    let counter = Arc::new(CompileCounter::new());
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                // each thread has its own globals over the same code units
                let globals = Vm::new(&mut NoPrint, NoopTracer).run_program(&program).unwrap();
                let f = globals.borrow()["f"].clone();
                let ctx = optimize(&state, counter.clone());
                let _scope = ctx.enter();
                for _ in 0..3 {
                    let Value::Tensor(out) = call(&f, vec![ones(&[3])]) else {
                        panic!("expected a tensor");
                    };
                    assert_eq!(out.data(), &[3.0, 3.0, 3.0]);
                }
            });
        }
    });
    assert_eq!(counter.frame_count(), 1);
    assert_eq!(state.stats().frames_converted, 1);
    assert_eq!(state.stats().cache_hits, 11);
}
