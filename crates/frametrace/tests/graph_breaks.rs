//! How unsupported calls split a function into graph fragments.

use std::sync::Arc;

use frametrace::{
    CodeKind, CompileCounter, Config, DType, Eager, Globals, NoPrint, NoopTracer, RecordingTracer, Tensor, TraceEvent,
    TracerState, Value, Vm, compile, optimize,
};
use pretty_assertions::assert_eq;

const SOURCE: &str = "
def unsupported_at_return(a, b):
    x = a + b
    y = x * 2
    return unsupported(x, y)

def unsupported_first(a, b):
    x = unsupported(a, b)
    y = x + b
    z = y * 2
    return z - a

def helper(x):
    unsupported(x)
    return x

def indirect(a, b):
    x = a + b
    y = helper(x)
    return y * 2 + b

def print_in_middle(a, b):
    x = a + b
    y = x * a
    z = y - b
    print(z)
    w = z + 1
    v = w * w
    return v - a

def two_prints(a):
    a = a + 1
    print(a)
    a = a * 2
    print(a)
    return a - 3

def item_leaves_the_graph(a):
    s = (a * 2).sum()
    n = s.item()
    return a + n

def indirectly_unsupported(a, b):
    c = a + b
    return unsupported(a, c)

def call_inside_an_expression(a, b):
    c1 = a - b
    c2 = b - a
    return a - (b - unsupported(c1, c2))

def constants_under_the_call(a, b):
    local_const1 = 7
    local_const2 = 22
    c1 = a - b
    c2 = b - a
    return local_const1 / (local_const2 - indirectly_unsupported(c1, c2))

def stack_across_a_call(a, b):
    t1 = 1.23 * a
    t2 = 4.56 * a
    c1 = a - b
    c2 = b - a
    return t1 / (t2 - unsupported(c1, c2))

def stack_across_an_inlined_call(a, b):
    t1 = 1.23 * a
    t2 = 4.56 * a
    c1 = a - b
    c2 = b - a
    return t1 / (t2 - indirectly_unsupported(c1, c2))

def range_across_a_call(a, b):
    x = a + b
    rng = range(3, 8, 2)
    x = unsupported(x, x)
    for i in rng:
        x = x + i
    return x

def iterator_across_a_call(a, b):
    x = a + b
    rng = iter(range(3, 8, 2))
    x = unsupported(x, x)
    x += next(rng)
    return x, tuple(rng)
";

struct Setup {
    globals: Globals,
    state: Arc<TracerState>,
    counter: Arc<CompileCounter>,
}

fn setup(config: Config) -> Setup {
    let program = compile(SOURCE, "breaks.py").unwrap();
    let globals = Vm::new(&mut NoPrint, NoopTracer).run_program(&program).unwrap();
    Setup {
        globals,
        state: TracerState::new(config),
        counter: Arc::new(CompileCounter::new()),
    }
}

fn tensor() -> Value {
    Value::Tensor(Tensor::full(&[4], 1.5, DType::Float32))
}

impl Setup {
    /// Calls `name` twice inside an optimize scope; returns the second result.
    fn run(&self, name: &str, args: &[Value]) -> Value {
        let f = self.globals.borrow()[name].clone();
        let ctx = optimize(&self.state, self.counter.clone());
        let _scope = ctx.enter();
        let mut print = NoPrint;
        let mut vm = Vm::new(&mut print, NoopTracer);
        vm.call(&f, args.to_vec()).unwrap();
        vm.call(&f, args.to_vec()).unwrap()
    }

    fn counts(&self) -> (usize, usize) {
        (self.counter.frame_count(), self.counter.op_count())
    }

    /// Calls `name(ones, -2 * ones)` and then with the arguments swapped,
    /// checking both traced results against plain interpretation.
    fn run_swapped(&self, name: &str) {
        let f = self.globals.borrow()[name].clone();
        let v1 = Value::Tensor(Tensor::full(&[10], 1.0, DType::Float32));
        let v2 = Value::Tensor(Tensor::full(&[10], -2.0, DType::Float32));
        let calls = [vec![v1.clone(), v2.clone()], vec![v2, v1]];
        let expected: Vec<Value> = calls
            .iter()
            .map(|args| Vm::new(&mut NoPrint, NoopTracer).call(&f, args.clone()).unwrap())
            .collect();

        let ctx = optimize(&self.state, self.counter.clone());
        let _scope = ctx.enter();
        for (args, expected) in calls.into_iter().zip(&expected) {
            let actual = Vm::new(&mut NoPrint, NoopTracer).call(&f, args).unwrap();
            assert_same(expected, &actual);
        }
    }
}

fn assert_same(expected: &Value, actual: &Value) {
    match (expected, actual) {
        (Value::Tensor(e), Value::Tensor(a)) => assert!(e.allclose(a, 1e-9, 1e-9), "expected {e}, got {a}"),
        (Value::Tuple(e), Value::Tuple(a)) => {
            assert_eq!(e.len(), a.len());
            for (e, a) in e.iter().zip(a.iter()) {
                assert_same(e, a);
            }
        }
        _ => assert!(expected.equals(actual), "expected {expected}, got {actual}"),
    }
}

#[test]
fn unsupported_call_at_the_return() {
    let s = setup(Config::default());
    s.run("unsupported_at_return", &[tensor(), tensor()]);
    assert_eq!(s.counts(), (1, 2));
    assert_eq!(s.state.stats().graph_breaks, 1);
}

#[test]
fn unsupported_call_before_any_operation() {
    let s = setup(Config::default());
    s.run("unsupported_first", &[tensor(), tensor()]);
    assert_eq!(s.counts(), (1, 3));
}

#[test]
fn indirect_unsupported_call_splits_at_the_call() {
    let s = setup(Config::default());
    let Value::Tensor(out) = s.run("indirect", &[tensor(), tensor()]) else {
        panic!("expected a tensor");
    };
    assert_eq!(out.data(), &[7.5; 4]);
    assert_eq!(s.counts(), (2, 3));
    assert_eq!(s.state.stats().restarts, 1);
}

#[test]
fn print_in_the_middle_makes_two_graphs() {
    let s = setup(Config::default());
    s.run("print_in_middle", &[tensor(), tensor()]);
    assert_eq!(s.counts(), (2, 6));
    assert_eq!(s.state.resume_count(), 1);
}

#[test]
fn every_break_gets_its_own_continuation() {
    let s = setup(Config::default());
    let Value::Tensor(out) = s.run("two_prints", &[tensor()]) else {
        panic!("expected a tensor");
    };
    assert_eq!(out.data(), &[2.0; 4]);
    assert_eq!(s.counts(), (3, 3));
    assert_eq!(s.state.resume_count(), 2);
    assert_eq!(s.state.stats().graph_breaks, 2);
}

#[test]
fn continuations_are_cached_like_any_function() {
    let s = setup(Config::default());
    s.run("print_in_middle", &[tensor(), tensor()]);
    assert_eq!(s.state.graphs().len(), 2);
    let f = s.globals.borrow()["print_in_middle"].clone();
    let Value::Function(func) = f else {
        panic!("expected a function");
    };
    let entries = s.state.cache_entries(func.code());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].code().kind(), CodeKind::Rewritten);
    // the second call reused the entry and the continuation's entry
    assert_eq!(s.state.stats().frames_converted, 2);
}

#[test]
fn item_breaks_unless_scalars_are_captured() {
    let s = setup(Config::default());
    let Value::Tensor(out) = s.run("item_leaves_the_graph", &[tensor()]) else {
        panic!("expected a tensor");
    };
    assert_eq!(out.data(), &[13.5; 4]);
    assert_eq!(s.counts(), (2, 3));

    let mut config = Config::default();
    config.capture_scalar_outputs = true;
    let s = setup(config);
    let Value::Tensor(out) = s.run("item_leaves_the_graph", &[tensor()]) else {
        panic!("expected a tensor");
    };
    assert_eq!(out.data(), &[13.5; 4]);
    assert_eq!(s.counts(), (1, 4));
}

#[test]
fn frames_without_tensors_are_left_alone() {
    let s = setup(Config::default());
    let out = s.run("unsupported_first", &[Value::Int(1), Value::Int(2)]);
    assert!(out.equals(&Value::Int(5)));
    assert_eq!(s.counts(), (0, 0));
    assert_eq!(s.state.stats().frames_converted, 0);
}

#[test]
fn rewritten_code_calls_one_graph_per_fragment() {
    let s = setup(Config::default());
    let f = s.globals.borrow()["print_in_middle"].clone();
    let ctx = optimize(&s.state, Arc::new(Eager));
    let _scope = ctx.enter();
    let mut print = NoPrint;
    let mut vm = Vm::new(&mut print, RecordingTracer::new());
    vm.call(&f, vec![tensor(), tensor()]).unwrap();

    let tracer = vm.tracer();
    assert_eq!(tracer.graph_calls().len(), 2);
    let frames: Vec<(&str, CodeKind)> = tracer
        .events()
        .iter()
        .filter_map(|event| match event {
            TraceEvent::FrameEnter { name, kind, .. } => Some((name.as_str(), *kind)),
            _ => None,
        })
        .collect();
    // the continuation is converted on its first call like any other function
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], ("print_in_middle", CodeKind::Rewritten));
    assert!(frames[1].0.starts_with("__resume_at_"), "{frames:?}");
    assert_eq!(frames[1].1, CodeKind::Rewritten);
}

#[test]
fn call_nested_in_an_expression_resumes_with_its_operands() {
    let s = setup(Config::default());
    s.run_swapped("call_inside_an_expression");
    assert_eq!(s.counts(), (2, 4));
}

#[test]
fn constants_below_an_indirect_break_are_restored_inline() {
    let s = setup(Config::default());
    s.run_swapped("constants_under_the_call");
    // caller prefix, the callee up to its own break, and the caller's rest
    assert_eq!(s.counts(), (3, 5));
}

#[test]
fn stack_values_become_continuation_arguments() {
    let s = setup(Config::default());
    s.run_swapped("stack_across_a_call");
    assert_eq!(s.counts(), (2, 6));
    assert_eq!(s.state.resume_count(), 1);
}

#[test]
fn stack_values_survive_an_indirect_break() {
    let s = setup(Config::default());
    s.run_swapped("stack_across_an_inlined_call");
    assert_eq!(s.counts(), (3, 7));
    assert_eq!(s.state.stats().restarts, 1);
}

#[test]
fn ranges_are_passed_to_the_continuation() {
    let s = setup(Config::default());
    s.run_swapped("range_across_a_call");
    // the loop over the range unrolls inside the continuation
    assert_eq!(s.counts(), (2, 4));
}

#[test]
fn iterators_are_rebuilt_in_the_continuation() {
    let s = setup(Config::default());
    s.run_swapped("iterator_across_a_call");
    assert_eq!(s.counts(), (2, 2));
}
