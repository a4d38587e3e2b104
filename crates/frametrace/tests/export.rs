//! Whole-function capture into a serializable program.

use frametrace::{
    Config, DType, ExportedProgram, Globals, NoPrint, NoopTracer, Source, Tensor, TraceError, TracerState, TreeSpec,
    Value, Vm, compile, export,
};
use pretty_assertions::assert_eq;

const SOURCE: &str = "
weight = ones(3)

def model(x, y):
    h = (x * 2 + y).relu()
    return h, h.sum()

def with_config(x, cfg):
    return x * cfg['scale']

def breaks(x):
    print(x)
    return x + 1

def uses_weight(x):
    return x * weight
";

fn load() -> Globals {
    let program = compile(SOURCE, "export.py").unwrap();
    Vm::new(&mut NoPrint, NoopTracer).run_program(&program).unwrap()
}

fn tensor(data: &[f64]) -> Value {
    Value::Tensor(Tensor::new(DType::Float32, &[data.len()], data.to_vec()).unwrap())
}

fn capture(name: &str, args: &[Value]) -> Result<ExportedProgram, TraceError> {
    let globals = load();
    let f = globals.borrow()[name].clone();
    export(&TracerState::new(Config::default()), &f, args)
}

fn tensors(value: &Value) -> Vec<Vec<f64>> {
    match value {
        Value::Tensor(t) => vec![t.data().to_vec()],
        Value::Tuple(items) => items.iter().flat_map(tensors).collect(),
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn captures_one_graph_with_its_structure() {
    let args = [tensor(&[1.0, -2.0, 3.0]), tensor(&[0.5, 0.5, 0.5])];
    let program = capture("model", &args).unwrap();
    assert_eq!(program.graph.op_count(), 4);
    assert_eq!(program.in_spec, vec![Source::local("x", 0), Source::local("y", 1)]);
    assert_eq!(program.out_spec, TreeSpec::Tuple(vec![TreeSpec::Tensor(0), TreeSpec::Tensor(1)]));

    let out = program.run(&args).unwrap();
    assert_eq!(tensors(&out), vec![vec![2.5, 0.0, 6.5], vec![9.0]]);
}

#[test]
fn running_matches_a_direct_call() {
    let globals = load();
    let model = globals.borrow()["model"].clone();
    let program = export(
        &TracerState::new(Config::default()),
        &model,
        &[tensor(&[0.0; 3]), tensor(&[0.0; 3])],
    )
    .unwrap();

    let args = [tensor(&[-1.0, 4.0, 0.25]), tensor(&[3.0, -9.0, 1.0])];
    let direct = Vm::new(&mut NoPrint, NoopTracer).call(&model, args.to_vec()).unwrap();
    assert_eq!(tensors(&program.run(&args).unwrap()), tensors(&direct));
}

#[test]
fn constants_are_baked_in_and_checked() {
    let cfg = Value::dict([("scale", Value::Int(3))]);
    let program = capture("with_config", &[tensor(&[1.0, 2.0]), cfg]).unwrap();
    assert_eq!(program.in_spec, vec![Source::local("x", 0)]);

    let same = Value::dict([("scale", Value::Int(3))]);
    // a different dict object is rejected by its identity guard
    let err = program.run(&[tensor(&[1.0, 2.0]), same]).unwrap_err();
    assert!(err.to_string().contains("do not match"), "{err}");
}

#[test]
fn mismatched_arguments_are_rejected() {
    let args = [tensor(&[1.0, 2.0, 3.0]), tensor(&[1.0, 2.0, 3.0])];
    let program = capture("model", &args).unwrap();
    let err = program.run(&[tensor(&[1.0, 2.0]), tensor(&[1.0, 2.0])]).unwrap_err();
    assert!(err.to_string().contains("TENSOR_MATCH"), "{err}");
}

#[test]
fn programs_survive_serialization() {
    let args = [tensor(&[1.0, -2.0, 3.0]), tensor(&[0.5, 0.5, 0.5])];
    let program = capture("model", &args).unwrap();

    let json = program.to_json().unwrap();
    let from_json = ExportedProgram::from_json(&json).unwrap();
    assert_eq!(from_json, program);

    let bytes = program.to_bytes().unwrap();
    let from_bytes = ExportedProgram::from_bytes(&bytes).unwrap();
    assert_eq!(tensors(&from_bytes.run(&args).unwrap()), tensors(&program.run(&args).unwrap()));
}

#[test]
fn graph_breaks_fail_the_export() {
    let err = capture("breaks", &[tensor(&[1.0])]).unwrap_err();
    assert!(matches!(err, TraceError::Unsupported(_)), "{err}");
}

#[test]
fn global_tensors_fail_the_export() {
    let err = capture("uses_weight", &[tensor(&[1.0, 2.0, 3.0])]).unwrap_err();
    match err {
        TraceError::Export(message) => assert!(message.contains("G['weight']"), "{message}"),
        other => panic!("expected an export error, got {other}"),
    }
}

#[test]
fn only_functions_with_matching_arity_export() {
    let state = TracerState::new(Config::default());
    let err = export(&state, &Value::Int(1), &[]).unwrap_err();
    assert!(matches!(err, TraceError::Export(_)), "{err}");

    let err = capture("model", &[tensor(&[1.0])]).unwrap_err();
    match err {
        TraceError::Export(message) => assert!(message.contains("takes 2 arguments (1 given)"), "{message}"),
        other => panic!("expected an export error, got {other}"),
    }
}
