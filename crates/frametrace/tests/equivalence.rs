//! Traced execution must produce the same results as plain interpretation,
//! whatever mix of graphs, breaks and continuations a function turns into.

use std::sync::Arc;

use frametrace::{
    CollectStringPrint, Config, DType, Eager, Globals, NoPrint, NoopTracer, Tensor, TracerState, Value, Vm, compile,
    optimize,
};

const SOURCE: &str = "
def arith(a, b):
    return (a + b) * 2 - a / 4

def with_print(a, b):
    x = a * b
    print(x)
    return x + b

def with_loop(a, b):
    for i in range(3):
        a = a + i * b
    return a

def branching(a, b):
    if a.sum() > 0:
        return a - b
    return a + b

def helper(x):
    return x.relu() * 3

def inlined(a, b):
    return helper(a - b) + helper(b)

def breaker(x):
    print(x)
    return x - 1

def indirect(a, b):
    return breaker(a + 1) * b

def tuple_result(a, b):
    s = a + b
    return s, s.sum(), a.shape

def unpacking(a, b):
    x, y = a * 2, b * 3
    return y - x

def loop_with_break(a, b):
    for i in range(3):
        a = a + b
        print(i)
    return a * 2

def guarded_try(a, b):
    try:
        c = a * b
    except ValueError:
        c = a
    return c + 1

def repeat_pair(x):
    return (x, 1) * 2

def repeat_by_float(x):
    return (x,) * 2.5

def repeat_by_tuple(x, y):
    return (x,) * (y,)
";

fn load() -> Globals {
    let program = compile(SOURCE, "equivalence.py").unwrap();
    Vm::new(&mut NoPrint, NoopTracer).run_program(&program).unwrap()
}

fn tensor(data: &[f64]) -> Value {
    Value::Tensor(Tensor::new(DType::Float32, &[data.len()], data.to_vec()).unwrap())
}

fn assert_same(expected: &Value, actual: &Value) {
    match (expected, actual) {
        (Value::Tensor(e), Value::Tensor(a)) => {
            assert_eq!(e.shape(), a.shape());
            assert_eq!(e.dtype(), a.dtype());
            assert!(e.allclose(a, 1e-9, 1e-9), "expected {e}, got {a}");
        }
        (Value::Tuple(e), Value::Tuple(a)) => {
            assert_eq!(e.len(), a.len());
            for (e, a) in e.iter().zip(a.iter()) {
                assert_same(e, a);
            }
        }
        _ => assert!(expected.equals(actual), "expected {expected}, got {actual}"),
    }
}

/// Runs `name` plainly and then traced, twice, comparing results and output.
fn check(name: &str, args: &[Value]) {
    let globals = load();
    let f = globals.borrow()[name].clone();

    let mut plain_out = CollectStringPrint::new();
    let expected = Vm::new(&mut plain_out, NoopTracer).call(&f, args.to_vec()).unwrap();

    let state = TracerState::new(Config::default());
    let ctx = optimize(&state, Arc::new(Eager));
    let _scope = ctx.enter();
    for _ in 0..2 {
        let mut traced_out = CollectStringPrint::new();
        let actual = Vm::new(&mut traced_out, NoopTracer).call(&f, args.to_vec()).unwrap();
        assert_same(&expected, &actual);
        assert_eq!(plain_out.output(), traced_out.output(), "{name} printed differently");
    }
}

/// Like [`check`] for calls that raise: the traced call raises the same error.
fn check_error(name: &str, args: &[Value]) {
    let globals = load();
    let f = globals.borrow()[name].clone();
    let expected = Vm::new(&mut NoPrint, NoopTracer).call(&f, args.to_vec()).unwrap_err();
    assert!(expected.as_exception().is_some(), "{expected}");

    let state = TracerState::new(Config::default());
    let ctx = optimize(&state, Arc::new(Eager));
    let _scope = ctx.enter();
    for _ in 0..2 {
        let actual = Vm::new(&mut NoPrint, NoopTracer).call(&f, args.to_vec()).unwrap_err();
        assert_eq!(expected.to_string(), actual.to_string(), "{name} raised differently");
    }
}

fn pair() -> [Value; 2] {
    [tensor(&[1.0, -2.0, 3.0]), tensor(&[0.5, 0.25, -4.0])]
}

#[test]
fn straight_line_arithmetic() {
    check("arith", &pair());
}

#[test]
fn print_in_the_middle() {
    check("with_print", &pair());
}

#[test]
fn unrolled_loop() {
    check("with_loop", &pair());
}

#[test]
fn both_sides_of_a_tensor_branch() {
    check("branching", &pair());
    check("branching", &[tensor(&[-1.0, -2.0, -3.0]), tensor(&[1.0, 1.0, 1.0])]);
}

#[test]
fn inlined_calls() {
    check("inlined", &pair());
}

#[test]
fn break_inside_a_called_function() {
    check("indirect", &pair());
}

#[test]
fn structured_results() {
    check("tuple_result", &pair());
}

#[test]
fn tuple_unpacking() {
    check("unpacking", &pair());
}

#[test]
fn break_inside_a_loop() {
    check("loop_with_break", &pair());
}

#[test]
fn code_with_a_try_block() {
    check("guarded_try", &pair());
}

#[test]
fn repeating_a_tuple_of_tensors() {
    check("repeat_pair", &[tensor(&[1.0, 2.0])]);
}

#[test]
fn repeating_a_tuple_by_a_non_int_raises() {
    check_error("repeat_by_float", &[tensor(&[1.0, 2.0])]);
    check_error("repeat_by_tuple", &pair());
}
