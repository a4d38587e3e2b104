//! Dense n-dimensional tensors, the value domain the tracer extracts graphs for.
//!
//! Storage is always `f64`; the [`DType`] tag decides how results are rounded
//! and printed. Binary operations broadcast with numpy rules and promote
//! `bool < int64 < float32`.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strum::{Display, EnumString, IntoStaticStr};

use crate::bytecode::{BinOp, CmpOp};

/// Tensor shape. Most tensors have rank four or less.
pub type Shape = SmallVec<[usize; 4]>;

/// Element type tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    Bool,
    Int64,
    Float32,
}

impl DType {
    #[must_use]
    pub fn promote(self, other: Self) -> Self {
        self.max(other)
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        self == Self::Float32
    }
}

/// Errors raised by tensor operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TensorError {
    #[error("shapes {lhs:?} and {rhs:?} cannot be broadcast together")]
    Broadcast { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("integer division or modulo by zero")]
    ZeroDivision,
    #[error("{0}")]
    Invalid(String),
}

impl TensorError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// A scalar extracted from a single-element tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Bool(b) => f64::from(u8::from(b)),
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Int(_) => DType::Int64,
            Self::Float(_) => DType::Float32,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => f.write_str(if *b { "True" } else { "False" }),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => f.write_str(&format_float(*v)),
        }
    }
}

/// Immutable dense tensor. Cloning shares storage.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    dtype: DType,
    shape: Shape,
    data: Arc<[f64]>,
}

impl Tensor {
    /// Builds a tensor, checking that `data` matches `shape`.
    pub fn new(dtype: DType, shape: &[usize], data: Vec<f64>) -> Result<Self, TensorError> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(TensorError::invalid(format!(
                "shape {shape:?} is invalid for input of size {}",
                data.len()
            )));
        }
        Ok(Self::from_parts(dtype, shape.into(), data))
    }

    /// Builds a tensor from data already known to match `shape`.
    pub(crate) fn from_data(dtype: DType, shape: &[usize], data: Vec<f64>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self::from_parts(dtype, shape.into(), data)
    }

    fn from_parts(dtype: DType, shape: Shape, data: Vec<f64>) -> Self {
        let data = data.into_iter().map(|v| normalize(dtype, v)).collect();
        Self { dtype, shape, data }
    }

    #[must_use]
    pub fn scalar(value: Scalar) -> Self {
        Self::from_parts(value.dtype(), Shape::new(), vec![value.as_f64()])
    }

    #[must_use]
    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        Self::from_parts(dtype, shape.into(), vec![value; numel])
    }

    #[must_use]
    pub fn arange(n: usize) -> Self {
        Self::from_parts(DType::Int64, smallvec::smallvec![n], (0..n).map(|i| i as f64).collect())
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Elementwise arithmetic with broadcasting.
    pub fn binary(&self, op: BinOp, other: &Self) -> Result<Self, TensorError> {
        if op == BinOp::MatMul {
            return self.matmul(other);
        }
        let mut dtype = self.dtype.promote(other.dtype);
        if dtype == DType::Bool {
            dtype = DType::Int64;
        }
        if op == BinOp::Div {
            dtype = DType::Float32;
        }
        let int_math = dtype == DType::Int64;
        let shape = broadcast_shapes(&self.shape, &other.shape)?;
        let data = zip_broadcast(self, other, &shape, |a, b| apply_binary(op, a, b, int_math))?;
        Ok(Self::from_parts(dtype, shape, data))
    }

    /// Elementwise comparison, producing a bool tensor.
    pub fn compare(&self, op: CmpOp, other: &Self) -> Result<Self, TensorError> {
        let shape = broadcast_shapes(&self.shape, &other.shape)?;
        let data = zip_broadcast(self, other, &shape, |a, b| {
            let result = match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                other => {
                    return Err(TensorError::invalid(format!(
                        "'{}' is not supported between tensors",
                        other.symbol()
                    )));
                }
            };
            Ok(f64::from(u8::from(result)))
        })?;
        Ok(Self::from_parts(DType::Bool, shape, data))
    }

    pub fn neg(&self) -> Result<Self, TensorError> {
        if self.dtype == DType::Bool {
            return Err(TensorError::invalid(
                "negation, the `-` operator, on a bool tensor is not supported",
            ));
        }
        Ok(self.map(self.dtype, |v| -v))
    }

    #[must_use]
    pub fn abs(&self) -> Self {
        self.map(self.dtype, f64::abs)
    }

    #[must_use]
    pub fn relu(&self) -> Self {
        self.map(self.dtype, |v| v.max(0.0))
    }

    #[must_use]
    pub fn sum(&self) -> Self {
        let dtype = if self.dtype == DType::Bool { DType::Int64 } else { self.dtype };
        Self::from_parts(dtype, Shape::new(), vec![self.data.iter().sum()])
    }

    pub fn mean(&self) -> Result<Self, TensorError> {
        if !self.dtype.is_float() {
            return Err(TensorError::invalid(format!(
                "mean(): could not infer output dtype. Input dtype must be floating point, got {}",
                self.dtype
            )));
        }
        let total: f64 = self.data.iter().sum();
        Ok(Self::from_parts(
            DType::Float32,
            Shape::new(),
            vec![total / self.numel() as f64],
        ))
    }

    /// Selects `index` along the first dimension. Negative indices count from the end.
    pub fn select(&self, index: i64) -> Result<Self, TensorError> {
        let Some((&len, rest)) = self.shape.split_first() else {
            return Err(TensorError::invalid("invalid index of a 0-dim tensor"));
        };
        let resolved = if index < 0 { index + len as i64 } else { index };
        if resolved < 0 || resolved >= len as i64 {
            return Err(TensorError::invalid(format!(
                "index {index} is out of bounds for dimension 0 with size {len}"
            )));
        }
        let stride: usize = rest.iter().product();
        let start = resolved as usize * stride;
        Ok(Self::from_parts(
            self.dtype,
            rest.into(),
            self.data[start..start + stride].to_vec(),
        ))
    }

    /// Value of a single-element tensor.
    pub fn item(&self) -> Result<Scalar, TensorError> {
        if self.numel() != 1 {
            return Err(TensorError::invalid(format!(
                "a Tensor with {} elements cannot be converted to Scalar",
                self.numel()
            )));
        }
        let value = self.data[0];
        Ok(match self.dtype {
            DType::Bool => Scalar::Bool(value != 0.0),
            DType::Int64 => Scalar::Int(value as i64),
            DType::Float32 => Scalar::Float(value),
        })
    }

    /// Truthiness, defined only for single-element tensors.
    pub fn truthy(&self) -> Result<bool, TensorError> {
        match self.numel() {
            1 => Ok(self.data[0] != 0.0),
            0 => Err(TensorError::invalid("Boolean value of Tensor with no values is ambiguous")),
            _ => Err(TensorError::invalid(
                "Boolean value of Tensor with more than one value is ambiguous",
            )),
        }
    }

    /// Compares shape, dtype and values within a tolerance.
    #[must_use]
    pub fn allclose(&self, other: &Self, rtol: f64, atol: f64) -> bool {
        self.dtype == other.dtype
            && self.shape == other.shape
            && self.data.iter().zip(other.data.iter()).all(|(a, b)| {
                if a.is_nan() || b.is_nan() {
                    a.is_nan() && b.is_nan()
                } else {
                    a == b || (a - b).abs() <= atol + rtol * b.abs()
                }
            })
    }

    fn map(&self, dtype: DType, f: impl Fn(f64) -> f64) -> Self {
        Self::from_parts(dtype, self.shape.clone(), self.data.iter().copied().map(f).collect())
    }

    fn matmul(&self, other: &Self) -> Result<Self, TensorError> {
        let mut dtype = self.dtype.promote(other.dtype);
        if dtype == DType::Bool {
            dtype = DType::Int64;
        }
        let mismatch = || TensorError::Invalid(format!(
            "mat1 and mat2 shapes cannot be multiplied ({:?} and {:?})",
            self.shape.as_slice(),
            other.shape.as_slice()
        ));
        // promote vectors to matrices, then squeeze the added dimensions
        let (m, k, lhs_vec) = match self.shape.as_slice() {
            [k] => (1, *k, true),
            [m, k] => (*m, *k, false),
            _ => return Err(mismatch()),
        };
        let (k2, n, rhs_vec) = match other.shape.as_slice() {
            [k2] => (*k2, 1, true),
            [k2, n] => (*k2, *n, false),
            _ => return Err(mismatch()),
        };
        if k != k2 {
            return Err(mismatch());
        }
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                out[i * n + j] = (0..k).map(|p| self.data[i * k + p] * other.data[p * n + j]).sum();
            }
        }
        let shape: Shape = match (lhs_vec, rhs_vec) {
            (true, true) => Shape::new(),
            (true, false) => smallvec::smallvec![n],
            (false, true) => smallvec::smallvec![m],
            (false, false) => smallvec::smallvec![m, n],
        };
        Ok(Self::from_parts(dtype, shape, out))
    }

    /// Nested rows, for `tolist()`.
    #[must_use]
    pub fn rows(&self) -> Option<Vec<Self>> {
        let len = *self.shape.first()?;
        Some((0..len).filter_map(|i| self.select(i as i64).ok()).collect())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({}, {:?})", self.dtype, self.shape.as_slice())
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("tensor(")?;
        write_nested(f, self.dtype, &self.shape, &self.data)?;
        if self.dtype == DType::Bool || self.numel() == 0 {
            write!(f, ", dtype={}", self.dtype)?;
        }
        f.write_str(")")
    }
}

fn write_nested(f: &mut fmt::Formatter<'_>, dtype: DType, shape: &[usize], data: &[f64]) -> fmt::Result {
    let Some((&len, rest)) = shape.split_first() else {
        return write_element(f, dtype, data[0]);
    };
    let stride: usize = rest.iter().product();
    f.write_str("[")?;
    for i in 0..len {
        if i > 0 {
            f.write_str(", ")?;
        }
        write_nested(f, dtype, rest, &data[i * stride..(i + 1) * stride])?;
    }
    f.write_str("]")
}

fn write_element(f: &mut fmt::Formatter<'_>, dtype: DType, value: f64) -> fmt::Result {
    match dtype {
        DType::Bool => f.write_str(if value != 0.0 { "True" } else { "False" }),
        DType::Int64 => write!(f, "{}", value as i64),
        DType::Float32 => f.write_str(&format_float(value)),
    }
}

/// Formats a float the way the host language prints it.
#[must_use]
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_owned()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_owned()
    } else if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn normalize(dtype: DType, value: f64) -> f64 {
    match dtype {
        DType::Bool => f64::from(u8::from(value != 0.0)),
        DType::Int64 => value.trunc(),
        DType::Float32 => value,
    }
}

fn apply_binary(op: BinOp, a: f64, b: f64, int_math: bool) -> Result<f64, TensorError> {
    Ok(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::FloorDiv => {
            if int_math && b == 0.0 {
                return Err(TensorError::ZeroDivision);
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if int_math && b == 0.0 {
                return Err(TensorError::ZeroDivision);
            }
            a - b * (a / b).floor()
        }
        BinOp::Pow => a.powf(b),
        BinOp::MatMul => unreachable!("matmul is not elementwise"),
    })
}

/// Broadcasts two shapes with numpy rules.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Shape, TensorError> {
    let rank = lhs.len().max(rhs.len());
    let mut out = Shape::with_capacity(rank);
    for i in 0..rank {
        let l = dim_from_end(lhs, rank - 1 - i);
        let r = dim_from_end(rhs, rank - 1 - i);
        out.push(match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(TensorError::Broadcast {
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                });
            }
        });
    }
    Ok(out)
}

fn dim_from_end(shape: &[usize], from_end: usize) -> usize {
    if from_end < shape.len() {
        shape[shape.len() - 1 - from_end]
    } else {
        1
    }
}

fn zip_broadcast(
    lhs: &Tensor,
    rhs: &Tensor,
    shape: &[usize],
    f: impl Fn(f64, f64) -> Result<f64, TensorError>,
) -> Result<Vec<f64>, TensorError> {
    let numel: usize = shape.iter().product();
    let lhs_strides = broadcast_strides(&lhs.shape, shape);
    let rhs_strides = broadcast_strides(&rhs.shape, shape);
    let mut index = vec![0usize; shape.len()];
    let mut out = Vec::with_capacity(numel);
    for _ in 0..numel {
        let l: usize = index.iter().zip(&lhs_strides).map(|(i, s)| i * s).sum();
        let r: usize = index.iter().zip(&rhs_strides).map(|(i, s)| i * s).sum();
        out.push(f(lhs.data[l], rhs.data[r])?);
        for dim in (0..shape.len()).rev() {
            index[dim] += 1;
            if index[dim] < shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
    Ok(out)
}

/// Strides of `shape` viewed as `target`, zero along broadcast dimensions.
fn broadcast_strides(shape: &[usize], target: &[usize]) -> Vec<usize> {
    let offset = target.len() - shape.len();
    let mut strides = vec![0; target.len()];
    let mut stride = 1;
    for (i, &dim) in shape.iter().enumerate().rev() {
        strides[offset + i] = if dim == 1 { 0 } else { stride };
        stride *= dim;
    }
    strides
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn vector(values: &[f64]) -> Tensor {
        Tensor::new(DType::Float32, &[values.len()], values.to_vec()).unwrap()
    }

    #[test]
    fn broadcasting_add() {
        let a = Tensor::new(DType::Float32, &[2, 1], vec![1.0, 2.0]).unwrap();
        let b = vector(&[10.0, 20.0, 30.0]);
        let c = a.binary(BinOp::Add, &b).unwrap();
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.data(), &[11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);
    }

    #[test]
    fn broadcast_mismatch() {
        let err = vector(&[1.0, 2.0]).binary(BinOp::Add, &vector(&[1.0, 2.0, 3.0])).unwrap_err();
        assert!(matches!(err, TensorError::Broadcast { .. }));
    }

    #[test]
    fn int_promotion_and_division() {
        let ints = Tensor::arange(4);
        let halves = ints.binary(BinOp::Div, &Tensor::scalar(Scalar::Int(2))).unwrap();
        assert_eq!(halves.dtype(), DType::Float32);
        assert_eq!(halves.data(), &[0.0, 0.5, 1.0, 1.5]);
        let floored = ints.binary(BinOp::FloorDiv, &Tensor::scalar(Scalar::Int(2))).unwrap();
        assert_eq!(floored.dtype(), DType::Int64);
        assert_eq!(floored.data(), &[0.0, 0.0, 1.0, 1.0]);
        assert_eq!(
            ints.binary(BinOp::Mod, &Tensor::scalar(Scalar::Int(0))).unwrap_err(),
            TensorError::ZeroDivision
        );
    }

    #[test]
    fn reductions_and_item() {
        let t = vector(&[1.0, -2.0, 4.0]);
        assert_eq!(t.sum().item().unwrap(), Scalar::Float(3.0));
        assert_eq!(t.relu().data(), &[1.0, 0.0, 4.0]);
        assert!(Tensor::arange(3).mean().is_err());
        assert!(t.item().is_err());
        assert!(t.truthy().is_err());
    }

    #[test]
    fn matmul_shapes() {
        let m = Tensor::new(DType::Float32, &[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let v = vector(&[1.0, 1.0]);
        assert_eq!(m.binary(BinOp::MatMul, &v).unwrap().data(), &[3.0, 7.0]);
        assert_eq!(v.binary(BinOp::MatMul, &v).unwrap().shape(), &[] as &[usize]);
        assert!(m.binary(BinOp::MatMul, &vector(&[1.0, 2.0, 3.0])).is_err());
    }

    #[test]
    fn select_and_display() {
        let m = Tensor::new(DType::Int64, &[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(m.select(-1).unwrap().data(), &[3.0, 4.0]);
        assert!(m.select(2).is_err());
        assert_eq!(m.to_string(), "tensor([[1, 2], [3, 4]])");
        assert_eq!(vector(&[0.5, 1.0]).to_string(), "tensor([0.5, 1.0])");
        let mask = vector(&[1.0, 3.0]).compare(CmpOp::Gt, &Tensor::scalar(Scalar::Float(2.0))).unwrap();
        assert_eq!(mask.to_string(), "tensor([False, True], dtype=bool)");
    }
}
