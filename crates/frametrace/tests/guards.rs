//! Guard precision: each kind of value a trace reads recompiles exactly when
//! the value it depends on changes.

use std::sync::Arc;

use frametrace::{
    CompileCounter, Config, DType, Globals, NoPrint, NoopTracer, Tensor, TracerState, Value, Vm, compile, optimize,
};
use pretty_assertions::assert_eq;

const SOURCE: &str = "
cfg = namespace({'scale': 2, 'bias': ones(3)})
offset = 1.5

def uses_attrs(x):
    return x * cfg.scale + cfg.bias

def uses_global(x):
    return x + offset

def double(x):
    return x * 2

def triple(x):
    return x * 3

def calls_global(x):
    return op(x) + 1

def uses_tuple(pair):
    a, n = pair
    return a * n

def uses_dict(d):
    return d['w'] - d['k']

op = double
";

struct Harness {
    globals: Globals,
    state: Arc<TracerState>,
    counter: Arc<CompileCounter>,
}

impl Harness {
    fn new() -> Self {
        let program = compile(SOURCE, "guards.py").unwrap();
        let globals = Vm::new(&mut NoPrint, NoopTracer).run_program(&program).unwrap();
        Self {
            globals,
            state: TracerState::new(Config::default()),
            counter: Arc::new(CompileCounter::new()),
        }
    }

    fn global(&self, name: &str) -> Value {
        self.globals.borrow()[name].clone()
    }

    fn set_global(&self, name: &str, value: Value) {
        self.globals.borrow_mut().insert(name.to_owned(), value);
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Vec<f64> {
        let f = self.global(name);
        let ctx = optimize(&self.state, self.counter.clone());
        let _scope = ctx.enter();
        match Vm::new(&mut NoPrint, NoopTracer).call(&f, args).unwrap() {
            Value::Tensor(t) => t.data().to_vec(),
            other => panic!("expected a tensor, got {other}"),
        }
    }

    fn guards(&self, name: &str) -> Vec<String> {
        let Value::Function(f) = self.global(name) else {
            panic!("{name} is not a function");
        };
        let entries = self.state.cache_entries(f.code());
        entries[0].guards().guards().iter().map(ToString::to_string).collect()
    }

    fn frames(&self) -> usize {
        self.counter.frame_count()
    }
}

fn ones(shape: &[usize]) -> Value {
    Value::Tensor(Tensor::full(shape, 1.0, DType::Float32))
}

#[test]
fn tensor_dtype_and_shape() {
    let h = Harness::new();
    h.call("double", vec![ones(&[3])]);
    h.call("double", vec![ones(&[3])]);
    assert_eq!(h.frames(), 1);
    h.call("double", vec![Value::Tensor(Tensor::full(&[3], 1.0, DType::Int64))]);
    assert_eq!(h.frames(), 2);
    h.call("double", vec![ones(&[3, 1])]);
    assert_eq!(h.frames(), 3);
    assert_eq!(h.guards("double"), vec!["L['x'] TENSOR_MATCH float32[3, 1]"]);
}

#[test]
fn attribute_chains_of_host_objects() {
    let h = Harness::new();
    assert_eq!(h.call("uses_attrs", vec![ones(&[3])]), vec![3.0; 3]);
    let guards = h.guards("uses_attrs");
    assert!(guards.contains(&"G['cfg'] HASATTR scale".to_owned()), "{guards:?}");
    assert!(guards.contains(&"G['cfg'].scale VALUE_MATCH 2".to_owned()), "{guards:?}");
    assert!(guards.contains(&"G['cfg'].bias TENSOR_MATCH float32[3]".to_owned()), "{guards:?}");

    let Value::Object(cfg) = h.global("cfg") else {
        panic!("cfg is not a namespace");
    };
    // same value, no recompilation
    cfg.set_attr("scale", Value::Int(2));
    h.call("uses_attrs", vec![ones(&[3])]);
    assert_eq!(h.frames(), 1);

    cfg.set_attr("scale", Value::Int(5));
    assert_eq!(h.call("uses_attrs", vec![ones(&[3])]), vec![6.0; 3]);
    assert_eq!(h.frames(), 2);

    // a new bias tensor of the same shape is read fresh, not recompiled
    cfg.set_attr("bias", Value::Tensor(Tensor::full(&[3], 10.0, DType::Float32)));
    assert_eq!(h.call("uses_attrs", vec![ones(&[3])]), vec![15.0; 3]);
    assert_eq!(h.frames(), 2);
}

#[test]
fn replacing_the_namespace_object_recompiles() {
    let h = Harness::new();
    h.call("uses_attrs", vec![ones(&[3])]);
    let replacement = Value::namespace([("scale", Value::Int(2)), ("bias", ones(&[3]))]);
    h.set_global("cfg", replacement);
    assert_eq!(h.call("uses_attrs", vec![ones(&[3])]), vec![3.0; 3]);
    assert_eq!(h.frames(), 2);
}

#[test]
fn global_constants() {
    let h = Harness::new();
    assert_eq!(h.call("uses_global", vec![ones(&[2])]), vec![2.5; 2]);
    h.set_global("offset", Value::Float(1.5));
    h.call("uses_global", vec![ones(&[2])]);
    assert_eq!(h.frames(), 1);
    h.set_global("offset", Value::Int(1));
    assert_eq!(h.call("uses_global", vec![ones(&[2])]), vec![2.0; 2]);
    assert_eq!(h.frames(), 2);
}

#[test]
fn rebinding_an_inlined_function() {
    let h = Harness::new();
    assert_eq!(h.call("calls_global", vec![ones(&[2])]), vec![3.0; 2]);
    let triple = h.global("triple");
    h.set_global("op", triple);
    assert_eq!(h.call("calls_global", vec![ones(&[2])]), vec![4.0; 2]);
    assert_eq!(h.frames(), 2);
}

#[test]
fn tuple_items() {
    let h = Harness::new();
    let pair = |n: i64| Value::tuple(vec![ones(&[2]), Value::Int(n)]);
    assert_eq!(h.call("uses_tuple", vec![pair(3)]), vec![3.0; 2]);
    h.call("uses_tuple", vec![pair(3)]);
    assert_eq!(h.frames(), 1);
    assert_eq!(h.call("uses_tuple", vec![pair(4)]), vec![4.0; 2]);
    assert_eq!(h.frames(), 2);
    let guards = h.guards("uses_tuple");
    assert_eq!(guards[0], "L['pair'] TYPE_MATCH tuple len=2");
    assert!(guards.contains(&"L['pair'][1] VALUE_MATCH 4".to_owned()), "{guards:?}");
}

#[test]
fn dicts_are_guarded_by_identity_and_items() {
    let h = Harness::new();
    let d = Value::dict([("w", ones(&[2])), ("k", Value::Float(0.5))]);
    assert_eq!(h.call("uses_dict", vec![d.clone()]), vec![0.5; 2]);
    h.call("uses_dict", vec![d]);
    assert_eq!(h.frames(), 1);
    let guards = h.guards("uses_dict");
    assert!(guards.iter().any(|g| g.starts_with("L['d'] ID_MATCH")), "{guards:?}");
    assert!(guards.contains(&"L['d']['k'] VALUE_MATCH 0.5".to_owned()), "{guards:?}");

    // an equal but distinct dict is a different object
    let other = Value::dict([("w", ones(&[2])), ("k", Value::Float(0.25))]);
    assert_eq!(h.call("uses_dict", vec![other]), vec![0.75; 2]);
    assert_eq!(h.frames(), 2);
}
