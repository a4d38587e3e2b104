//! Operator semantics on host values.
//!
//! Shared by the interpreter and by the symbolic tracer, which folds operations
//! on constants with exactly these rules.

use std::rc::Rc;

use super::builtins::TensorMethod;
use crate::{
    bytecode::{BinOp, CmpOp},
    error::{ExcType, Exception, RunResult},
    tensor::{Tensor, TensorError},
    value::{Method, Value},
};

/// Converts a tensor failure into the host exception the eager library raises.
pub(crate) fn tensor_error(err: TensorError) -> Exception {
    let exc_type = match err {
        TensorError::ZeroDivision => ExcType::ZeroDivisionError,
        TensorError::Broadcast { .. } | TensorError::Invalid(_) => ExcType::RuntimeError,
    };
    Exception::new(exc_type, err.to_string())
}

fn operand_error<T>(op: &str, lhs: &Value, rhs: &Value) -> RunResult<T> {
    ExcType::TypeError.raise(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        lhs.type_name(),
        rhs.type_name()
    ))
}

/// The tensor form of a tensor or number operand.
fn tensor_operand(value: &Value) -> Option<Tensor> {
    match value {
        Value::Tensor(t) => Some(t.clone()),
        other => other.as_scalar().map(Tensor::scalar),
    }
}

/// Longest tuple or string that `*` may build.
pub(crate) const MAX_REPEAT_LEN: usize = 1 << 24;

/// Length of a sequence of `len` items repeated `count` times; negative counts give empty.
pub(crate) fn repeated_len(len: usize, count: i64) -> RunResult<usize> {
    let count = usize::try_from(count).unwrap_or(0);
    len.checked_mul(count)
        .filter(|&total| total <= MAX_REPEAT_LEN)
        .ok_or_else(|| Exception::new(ExcType::ValueError, "repeated sequence is too long").into())
}

pub(crate) fn binary_op(op: BinOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
    if matches!(lhs, Value::Tensor(_)) || matches!(rhs, Value::Tensor(_)) {
        let (Some(a), Some(b)) = (tensor_operand(lhs), tensor_operand(rhs)) else {
            return operand_error(op.symbol(), lhs, rhs);
        };
        return a.binary(op, &b).map(Value::Tensor).map_err(|e| tensor_error(e).into());
    }
    match (op, lhs, rhs) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}").into())),
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect())),
        (BinOp::Mul, Value::Tuple(items), count) | (BinOp::Mul, count, Value::Tuple(items)) if count.as_int().is_some() => {
            let len = repeated_len(items.len(), count.as_int().unwrap_or(0))?;
            Ok(Value::tuple(items.iter().cloned().cycle().take(len).collect()))
        }
        (BinOp::Mul, Value::Str(s), count) | (BinOp::Mul, count, Value::Str(s)) if count.as_int().is_some() => {
            let count = count.as_int().unwrap_or(0);
            repeated_len(s.len(), count)?;
            Ok(Value::Str(s.repeat(usize::try_from(count).unwrap_or(0)).into()))
        }
        _ => match (lhs.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) if op != BinOp::Div => int_op(op, a, b, lhs, rhs),
            _ => match (lhs.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => float_op(op, a, b, lhs, rhs),
                _ => operand_error(op.symbol(), lhs, rhs),
            },
        },
    }
}

fn int_op(op: BinOp, a: i64, b: i64, lhs: &Value, rhs: &Value) -> RunResult<Value> {
    let overflow = || Exception::new(ExcType::ValueError, "integer overflow");
    let zero = || Exception::new(ExcType::ZeroDivisionError, "integer division or modulo by zero");
    let result = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(zero().into());
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero().into());
            }
            let r = a.checked_rem(b).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }
        }
        BinOp::Pow => {
            if b < 0 {
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).ok_or_else(overflow)?
        }
        BinOp::Div | BinOp::MatMul => return operand_error(op.symbol(), lhs, rhs),
    };
    Ok(Value::Int(result))
}

fn float_op(op: BinOp, a: f64, b: f64, lhs: &Value, rhs: &Value) -> RunResult<Value> {
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return ExcType::ZeroDivisionError.raise("division by zero");
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return ExcType::ZeroDivisionError.raise("float floor division by zero");
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return ExcType::ZeroDivisionError.raise("float modulo");
            }
            a - b * (a / b).floor()
        }
        BinOp::Pow => a.powf(b),
        BinOp::MatMul => return operand_error(op.symbol(), lhs, rhs),
    };
    Ok(Value::Float(result))
}

pub(crate) fn compare_op(op: CmpOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
    match op {
        CmpOp::Is => return Ok(Value::Bool(lhs.is(rhs))),
        CmpOp::IsNot => return Ok(Value::Bool(!lhs.is(rhs))),
        CmpOp::In => return contains(rhs, lhs).map(Value::Bool),
        CmpOp::NotIn => return contains(rhs, lhs).map(|found| Value::Bool(!found)),
        CmpOp::ExcMatch => return exception_matches(lhs, rhs).map(Value::Bool),
        _ => {}
    }
    if matches!(lhs, Value::Tensor(_)) || matches!(rhs, Value::Tensor(_)) {
        if let (Some(a), Some(b)) = (tensor_operand(lhs), tensor_operand(rhs)) {
            return a.compare(op, &b).map(Value::Tensor).map_err(|e| tensor_error(e).into());
        }
    }
    match op {
        CmpOp::Eq => Ok(Value::Bool(lhs.equals(rhs))),
        CmpOp::Ne => Ok(Value::Bool(!lhs.equals(rhs))),
        _ => {
            let Some(ordering) = order(lhs, rhs) else {
                return ExcType::TypeError.raise(format!(
                    "'{}' not supported between instances of '{}' and '{}'",
                    op.symbol(),
                    lhs.type_name(),
                    rhs.type_name()
                ));
            };
            Ok(Value::Bool(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
    }
}

fn order(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Tuple(a), Value::Tuple(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                if !x.equals(y) {
                    return order(x, y);
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => match (lhs.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => lhs.as_f64()?.partial_cmp(&rhs.as_f64()?),
        },
    }
}

fn contains(container: &Value, item: &Value) -> RunResult<bool> {
    match container {
        Value::Tuple(items) => Ok(items.iter().any(|x| x.equals(item))),
        Value::Dict(dict) => Ok(matches!(item, Value::Str(key) if dict.get(key).is_some())),
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(needle.as_ref())),
            other => ExcType::TypeError.raise(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            )),
        },
        Value::Range(range) => Ok(item.as_int().is_some_and(|i| range.contains(i))),
        other => ExcType::TypeError.raise(format!("argument of type '{}' is not iterable", other.type_name())),
    }
}

fn exception_matches(raised: &Value, class: &Value) -> RunResult<bool> {
    let Value::Exception(exc) = raised else {
        return Ok(false);
    };
    match class {
        Value::ExcClass(t) => Ok(t.catches(exc.exc_type())),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if exception_matches(raised, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => ExcType::TypeError.raise("catching classes that do not inherit from BaseException is not allowed"),
    }
}

pub(crate) fn unary_negative(value: &Value) -> RunResult<Value> {
    match value {
        Value::Int(i) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| Exception::new(ExcType::ValueError, "integer overflow").into()),
        Value::Bool(b) => Ok(Value::Int(-i64::from(*b))),
        Value::Float(f) => Ok(Value::Float(-f)),
        Value::Tensor(t) => t.neg().map(Value::Tensor).map_err(|e| tensor_error(e).into()),
        other => ExcType::TypeError.raise(format!("bad operand type for unary -: '{}'", other.type_name())),
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { index + len } else { index };
    (0..len).contains(&resolved).then(|| usize::try_from(resolved).ok()).flatten()
}

pub(crate) fn subscript(container: &Value, index: &Value) -> RunResult<Value> {
    match (container, index) {
        (Value::Dict(dict), Value::Str(key)) => match dict.get(key) {
            Some(value) => Ok(value.clone()),
            None => ExcType::KeyError.raise(format!("'{key}'")),
        },
        (Value::Tensor(t), index) if index.as_int().is_some() => t
            .select(index.as_int().unwrap_or(0))
            .map(Value::Tensor)
            .map_err(|e| Exception::new(ExcType::IndexError, e.to_string()).into()),
        (Value::Tuple(items), index) if index.as_int().is_some() => {
            match resolve_index(index.as_int().unwrap_or(0), items.len()) {
                Some(i) => Ok(items[i].clone()),
                None => ExcType::IndexError.raise("tuple index out of range"),
            }
        }
        (Value::Range(range), index) if index.as_int().is_some() => {
            match resolve_index(index.as_int().unwrap_or(0), range.len()).and_then(|i| range.get(i)) {
                Some(v) => Ok(Value::Int(v)),
                None => ExcType::IndexError.raise("range object index out of range"),
            }
        }
        (Value::Str(s), index) if index.as_int().is_some() => {
            let chars: Vec<char> = s.chars().collect();
            match resolve_index(index.as_int().unwrap_or(0), chars.len()) {
                Some(i) => Ok(Value::Str(chars[i].to_string().into())),
                None => ExcType::IndexError.raise("string index out of range"),
            }
        }
        (Value::Tuple(_) | Value::Range(_) | Value::Str(_) | Value::Tensor(_), other) => ExcType::TypeError.raise(
            format!("{} indices must be integers, not {}", container.type_name(), other.type_name()),
        ),
        (other, _) => ExcType::TypeError.raise(format!("'{}' object is not subscriptable", other.type_name())),
    }
}

pub(crate) fn get_attr(value: &Value, name: &str) -> RunResult<Value> {
    let found = match value {
        Value::Object(obj) => obj.get_attr(name),
        Value::Tensor(t) => tensor_attr(t, name),
        Value::Function(f) if name == "__name__" => Some(Value::str(f.name())),
        Value::Exception(exc) if name == "args" => Some(Value::tuple(vec![Value::str(exc.message())])),
        _ => None,
    };
    found.map_or_else(
        || {
            ExcType::AttributeError.raise(format!(
                "'{}' object has no attribute '{name}'",
                value.type_name()
            ))
        },
        Ok,
    )
}

/// Data attributes and bound methods of tensors.
pub(crate) fn tensor_attr(tensor: &Tensor, name: &str) -> Option<Value> {
    match name {
        "shape" => Some(Value::tuple(
            tensor
                .shape()
                .iter()
                .map(|d| Value::Int(i64::try_from(*d).unwrap_or(i64::MAX)))
                .collect(),
        )),
        "ndim" => Some(Value::Int(i64::try_from(tensor.ndim()).unwrap_or(i64::MAX))),
        "dtype" => Some(Value::str(&tensor.dtype().to_string())),
        other => other.parse::<TensorMethod>().ok().map(|method| {
            Value::Method(Rc::new(Method {
                receiver: tensor.clone(),
                method,
            }))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    #[test]
    fn integer_division_floors() {
        let q = binary_op(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap();
        assert!(q.equals(&Value::Int(-4)));
        let r = binary_op(BinOp::Mod, &Value::Int(-7), &Value::Int(2)).unwrap();
        assert!(r.equals(&Value::Int(1)));
        let err = binary_op(BinOp::FloorDiv, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.exc_type(), Some(ExcType::ZeroDivisionError));
    }

    #[test]
    fn mixed_tensor_scalar_arithmetic() {
        let t = Value::Tensor(Tensor::full(&[2], 1.0, DType::Int64));
        let Value::Tensor(out) = binary_op(BinOp::Add, &t, &Value::Float(0.5)).unwrap() else {
            panic!("expected a tensor");
        };
        assert_eq!(out.dtype(), DType::Float32);
        assert_eq!(out.data(), &[1.5, 1.5]);
    }

    #[test]
    fn comparisons_and_membership() {
        let tuple = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        assert!(compare_op(CmpOp::In, &Value::Int(2), &tuple).unwrap().truthy().unwrap());
        assert!(compare_op(CmpOp::Lt, &Value::str("a"), &Value::str("b")).unwrap().truthy().unwrap());
        assert!(compare_op(CmpOp::Lt, &Value::None, &Value::Int(1)).is_err());
    }

    #[test]
    fn subscripts_check_bounds() {
        let tuple = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        assert!(subscript(&tuple, &Value::Int(-1)).unwrap().equals(&Value::Int(2)));
        let err = subscript(&tuple, &Value::Int(2)).unwrap_err();
        assert_eq!(err.exc_type(), Some(ExcType::IndexError));
        let dict = Value::dict([("a", Value::Int(1))]);
        assert_eq!(subscript(&dict, &Value::str("b")).unwrap_err().exc_type(), Some(ExcType::KeyError));
    }
}
