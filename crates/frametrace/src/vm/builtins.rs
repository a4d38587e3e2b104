//! Native builtins and tensor methods.

use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use super::{Vm, ops::tensor_error};
use crate::{
    error::{ExcType, RunResult},
    eval_frame,
    random,
    tensor::{DType, Scalar, Tensor},
    tracer::{RecordingTracer, VmTracer},
    value::{Object, Range, Value},
};

/// Native functions available in every module without a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum Builtin {
    Print,
    Len,
    Range,
    Iter,
    Next,
    Tuple,
    Abs,
    Ones,
    Zeros,
    Full,
    Arange,
    Randn,
    Tensor,
    Relu,
    /// `namespace()` or `namespace(dict)`: a host object with mutable attributes.
    Namespace,
    /// Returns its first argument. The tracer never models it, so it forces a graph break.
    Unsupported,
    /// `trace_calls(f, *args)` runs `f` under a recording tracer and returns
    /// `(result, instructions_executed)`.
    TraceCalls,
    ManualSeed,
}

impl Builtin {
    /// Builtins whose result is a fresh tensor.
    #[must_use]
    pub fn creates_tensor(self) -> bool {
        matches!(
            self,
            Self::Ones | Self::Zeros | Self::Full | Self::Arange | Self::Randn | Self::Tensor
        )
    }
}

/// Methods callable on tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum TensorMethod {
    Sum,
    Mean,
    Relu,
    Abs,
    Item,
    Tolist,
}

/// Resolves a name that is not defined in the module's globals.
#[must_use]
pub fn lookup_builtin(name: &str) -> Option<Value> {
    if let Ok(builtin) = name.parse::<Builtin>() {
        return Some(Value::Builtin(builtin));
    }
    name.parse::<ExcType>().ok().map(Value::ExcClass)
}

impl<Tr: VmTracer> Vm<'_, Tr> {
    pub(crate) fn call_builtin(&mut self, builtin: Builtin, args: Vec<Value>) -> RunResult<Value> {
        match builtin {
            Builtin::Print => {
                let line = args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
                self.print.print_line(&line)?;
                Ok(Value::None)
            }
            Builtin::Len => {
                let [value] = exact_args::<1>(builtin, args)?;
                let len = match &value {
                    Value::Tuple(items) => items.len(),
                    Value::Str(s) => s.chars().count(),
                    Value::Range(r) => r.len(),
                    Value::Dict(d) => d.items().len(),
                    Value::Tensor(t) => match t.shape().first() {
                        Some(len) => *len,
                        None => return ExcType::TypeError.raise("len() of a 0-d tensor"),
                    },
                    other => {
                        return ExcType::TypeError.raise(format!("object of type '{}' has no len()", other.type_name()));
                    }
                };
                Ok(Value::Int(to_i64(len)))
            }
            Builtin::Range => Ok(Value::Range(range_args(&args)?)),
            Builtin::Iter => {
                let [value] = exact_args::<1>(builtin, args)?;
                self.get_iter(value)
            }
            Builtin::Next => {
                let [iterator] = exact_args::<1>(builtin, args)?;
                match self.next_value(&iterator)? {
                    Some(value) => Ok(value),
                    None => ExcType::StopIteration.raise(""),
                }
            }
            Builtin::Tuple => match args.len() {
                0 => Ok(Value::tuple(Vec::new())),
                _ => {
                    let [value] = exact_args::<1>(builtin, args)?;
                    Ok(Value::tuple(self.collect_iterable(value)?))
                }
            },
            Builtin::Abs => {
                let [value] = exact_args::<1>(builtin, args)?;
                match value {
                    Value::Int(i) => Ok(Value::Int(i.abs())),
                    Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    Value::Tensor(t) => Ok(Value::Tensor(t.abs())),
                    other => ExcType::TypeError.raise(format!("bad operand type for abs(): '{}'", other.type_name())),
                }
            }
            Builtin::Ones => Ok(Value::Tensor(Tensor::full(&shape_args(&args)?, 1.0, DType::Float32))),
            Builtin::Zeros => Ok(Value::Tensor(Tensor::full(&shape_args(&args)?, 0.0, DType::Float32))),
            Builtin::Full => {
                let [shape, fill] = exact_args::<2>(builtin, args)?;
                let shape = shape_args(std::slice::from_ref(&shape))?;
                let Some(fill) = fill.as_scalar() else {
                    return ExcType::TypeError.raise(format!("full(): fill value must be a number, not {}", fill.type_name()));
                };
                Ok(Value::Tensor(Tensor::full(&shape, fill.as_f64(), fill.dtype())))
            }
            Builtin::Arange => {
                let [end] = exact_args::<1>(builtin, args)?;
                match end.as_int() {
                    Some(n) if n >= 0 => Ok(Value::Tensor(Tensor::arange(usize::try_from(n).unwrap_or(0)))),
                    _ => ExcType::ValueError.raise("arange(): end must be a non-negative integer"),
                }
            }
            Builtin::Randn => Ok(Value::Tensor(random::randn(&shape_args(&args)?))),
            Builtin::Tensor => {
                let [data] = exact_args::<1>(builtin, args)?;
                Ok(Value::Tensor(tensor_from_value(&data)?))
            }
            Builtin::Relu => {
                let [value] = exact_args::<1>(builtin, args)?;
                match value {
                    Value::Tensor(t) => Ok(Value::Tensor(t.relu())),
                    other => ExcType::TypeError.raise(format!("relu(): expected a Tensor, got {}", other.type_name())),
                }
            }
            Builtin::Namespace => match args.as_slice() {
                [] => Ok(Value::Object(Rc::new(Object::new(IndexMap::new())))),
                [Value::Dict(dict)] => Ok(Value::Object(Rc::new(Object::new(dict.items().clone())))),
                _ => ExcType::TypeError.raise("namespace() takes no arguments or a single dict"),
            },
            Builtin::Unsupported => Ok(args.into_iter().next().unwrap_or(Value::None)),
            Builtin::TraceCalls => {
                let mut args = args.into_iter();
                let Some(callee) = args.next() else {
                    return ExcType::TypeError.raise("trace_calls() missing required argument 'f'");
                };
                let _scope = eval_frame::introspection_scope();
                let mut inner = Vm::with_depth(&mut *self.print, RecordingTracer::new(), self.depth, self.max_depth);
                let result = inner.call_value(&callee, args.collect())?;
                let count = inner.tracer().instruction_count();
                Ok(Value::tuple(vec![result, Value::Int(to_i64(count))]))
            }
            Builtin::ManualSeed => {
                let [seed] = exact_args::<1>(builtin, args)?;
                let Some(seed) = seed.as_int() else {
                    return ExcType::TypeError.raise("manual_seed() expects an int");
                };
                random::manual_seed(seed.unsigned_abs());
                Ok(Value::None)
            }
        }
    }
}

/// Calls a tensor method bound to its receiver.
pub(crate) fn call_method(receiver: &Tensor, method: TensorMethod, args: &[Value]) -> RunResult<Value> {
    if !args.is_empty() {
        return ExcType::TypeError.raise(format!("{method}() takes no arguments ({} given)", args.len()));
    }
    Ok(match method {
        TensorMethod::Sum => Value::Tensor(receiver.sum()),
        TensorMethod::Mean => Value::Tensor(receiver.mean().map_err(tensor_error)?),
        TensorMethod::Relu => Value::Tensor(receiver.relu()),
        TensorMethod::Abs => Value::Tensor(receiver.abs()),
        TensorMethod::Item => Value::from(receiver.item().map_err(tensor_error)?),
        TensorMethod::Tolist => tolist(receiver),
    })
}

fn tolist(tensor: &Tensor) -> Value {
    match tensor.rows() {
        Some(rows) => Value::tuple(rows.iter().map(tolist).collect()),
        None => tensor.item().map_or(Value::None, Value::from),
    }
}

fn exact_args<const N: usize>(builtin: Builtin, args: Vec<Value>) -> RunResult<[Value; N]> {
    let given = args.len();
    args.try_into().or_else(|_| {
        ExcType::TypeError.raise(format!(
            "{builtin}() takes exactly {N} argument{} ({given} given)",
            if N == 1 { "" } else { "s" }
        ))
    })
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn range_args(args: &[Value]) -> RunResult<Range> {
    let ints: Option<Vec<i64>> = args.iter().map(Value::as_int).collect();
    let Some(ints) = ints else {
        return ExcType::TypeError.raise("range() arguments must be integers");
    };
    let range = match ints.as_slice() {
        [stop] => Range {
            start: 0,
            stop: *stop,
            step: 1,
        },
        [start, stop] => Range {
            start: *start,
            stop: *stop,
            step: 1,
        },
        [start, stop, step] => Range {
            start: *start,
            stop: *stop,
            step: *step,
        },
        _ => return ExcType::TypeError.raise(format!("range expected 1 to 3 arguments, got {}", ints.len())),
    };
    if range.step == 0 {
        return ExcType::ValueError.raise("range() arg 3 must not be zero");
    }
    Ok(range)
}

/// Shape from `f(2, 3)` or `f((2, 3))`.
pub(crate) fn shape_args(args: &[Value]) -> RunResult<Vec<usize>> {
    let dims: &[Value] = match args {
        [Value::Tuple(items)] => items,
        other => other,
    };
    dims.iter()
        .map(|dim| match dim.as_int() {
            Some(n) if n >= 0 => Ok(usize::try_from(n).unwrap_or(0)),
            Some(n) => ExcType::ValueError.raise(format!("negative dimension {n}")),
            None => ExcType::TypeError.raise(format!("shape must be integers, not {}", dim.type_name())),
        })
        .collect()
}

/// Builds a tensor from a number or nested tuples of numbers.
pub(crate) fn tensor_from_value(data: &Value) -> RunResult<Tensor> {
    fn walk(value: &Value, depth: usize, shape: &mut Vec<usize>, out: &mut Vec<Scalar>) -> RunResult<()> {
        match value {
            Value::Tuple(items) => {
                if shape.len() == depth {
                    shape.push(items.len());
                } else if shape.get(depth) != Some(&items.len()) {
                    return ExcType::ValueError.raise("tensor(): nested sequences must have equal lengths");
                }
                items.iter().try_for_each(|item| walk(item, depth + 1, shape, out))
            }
            Value::Tensor(t) => {
                t.data().iter().for_each(|v| out.push(Scalar::Float(*v)));
                if shape.len() == depth {
                    shape.extend_from_slice(t.shape());
                }
                Ok(())
            }
            other => match other.as_scalar() {
                Some(scalar) if shape.len() == depth => {
                    out.push(scalar);
                    Ok(())
                }
                Some(_) => ExcType::ValueError.raise("tensor(): nested sequences must have equal depth"),
                None => ExcType::TypeError.raise(format!("tensor(): cannot convert {}", other.type_name())),
            },
        }
    }

    let mut shape = Vec::new();
    let mut scalars = Vec::new();
    walk(data, 0, &mut shape, &mut scalars)?;
    let dtype = match data {
        Value::Tensor(t) => t.dtype(),
        _ => scalars
            .iter()
            .map(|s| s.dtype())
            .max()
            .unwrap_or(DType::Float32),
    };
    Tensor::new(dtype, &shape, scalars.iter().map(|s| s.as_f64()).collect()).map_err(|e| tensor_error(e).into())
}
