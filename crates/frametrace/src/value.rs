//! Runtime values of the host language.
//!
//! Values are reference counted with `Rc` and live on one thread. Mutable
//! containers (host objects, iterators, generators) use `RefCell`. Objects,
//! dicts and functions carry a process-unique identity used by identity guards.

use std::{
    cell::RefCell,
    fmt::{self, Write as _},
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use indexmap::IndexMap;

use crate::{
    backend::CompiledGraph,
    bytecode::{CodeUnit, Const},
    error::{ExcType, Exception, RunResult},
    eval_frame::EvalMode,
    tensor::{Scalar, Tensor, format_float},
    vm::{Builtin, Frame, TensorMethod},
};

/// Module-level namespace shared by every function defined in it.
pub type Globals = Rc<RefCell<IndexMap<String, Value>>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

const BUILTIN_ID_BASE: u64 = 1 << 62;
const EXC_CLASS_ID_BASE: u64 = 1 << 61;

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Creates an empty globals namespace.
#[must_use]
pub fn new_globals() -> Globals {
    Rc::new(RefCell::new(IndexMap::new()))
}

/// A host-language value.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Tuple(Rc<[Value]>),
    Range(Range),
    Iter(Rc<RefCell<Iter>>),
    Generator(Rc<Generator>),
    /// Read-only string-keyed mapping.
    Dict(Rc<Dict>),
    /// Host object with mutable attributes, created by `namespace()`.
    Object(Rc<Object>),
    Function(Rc<Function>),
    Builtin(Builtin),
    /// A tensor method bound to its receiver, e.g. `x.sum`.
    Method(Rc<Method>),
    /// A function body that `MakeFunction` has not yet bound to globals.
    Code(Arc<CodeUnit>),
    Compiled(Arc<CompiledGraph>),
    Tensor(Tensor),
    ExcClass(ExcType),
    Exception(Rc<Exception>),
    /// A function wrapped by an execution context.
    Wrapped(Rc<Wrapped>),
}

/// `range(start, stop, step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    #[must_use]
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            self.stop - self.start
        } else {
            self.start - self.stop
        };
        if span <= 0 {
            0
        } else {
            let step = self.step.unsigned_abs();
            usize::try_from((span.unsigned_abs() + step - 1) / step).unwrap_or(usize::MAX)
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<i64> {
        (index < self.len()).then(|| self.start + self.step * index as i64)
    }

    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        if self.step > 0 && (value < self.start || value >= self.stop) {
            return false;
        }
        if self.step < 0 && (value > self.start || value <= self.stop) {
            return false;
        }
        (value - self.start) % self.step == 0
    }
}

/// State of an iterator over a sequence or a range.
#[derive(Debug, Clone)]
pub enum Iter {
    Seq { items: Rc<[Value]>, pos: usize },
    Range { range: Range, pos: usize },
}

impl Iter {
    pub fn next_item(&mut self) -> Option<Value> {
        match self {
            Self::Seq { items, pos } => {
                let item = items.get(*pos).cloned();
                *pos += usize::from(item.is_some());
                item
            }
            Self::Range { range, pos } => {
                let item = range.get(*pos).map(Value::Int);
                *pos += usize::from(item.is_some());
                item
            }
        }
    }

    /// Items not yet produced, without advancing.
    #[must_use]
    pub fn remaining(&self) -> Vec<Value> {
        match self {
            Self::Seq { items, pos } => items[*pos..].to_vec(),
            Self::Range { range, pos } => (*pos..range.len()).filter_map(|i| range.get(i)).map(Value::Int).collect(),
        }
    }
}

/// A suspended generator frame. `None` once exhausted or while running.
#[derive(Debug)]
pub struct Generator {
    pub(crate) name: String,
    pub(crate) frame: RefCell<Option<Box<Frame>>>,
}

#[derive(Debug)]
pub struct Dict {
    id: u64,
    items: IndexMap<String, Value>,
}

impl Dict {
    #[must_use]
    pub fn new(items: IndexMap<String, Value>) -> Self {
        Self { id: next_id(), items }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }

    #[must_use]
    pub fn items(&self) -> &IndexMap<String, Value> {
        &self.items
    }
}

#[derive(Debug)]
pub struct Object {
    id: u64,
    attrs: RefCell<IndexMap<String, Value>>,
}

impl Object {
    #[must_use]
    pub fn new(attrs: IndexMap<String, Value>) -> Self {
        Self {
            id: next_id(),
            attrs: RefCell::new(attrs),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.attrs.borrow().get(name).cloned()
    }

    #[must_use]
    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.borrow().contains_key(name)
    }

    pub fn set_attr(&self, name: &str, value: Value) {
        self.attrs.borrow_mut().insert(name.to_owned(), value);
    }

    /// Snapshot of the current attributes.
    #[must_use]
    pub fn attrs(&self) -> Vec<(String, Value)> {
        self.attrs.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// A user-defined function bound to the globals of its module.
#[derive(Debug)]
pub struct Function {
    id: u64,
    code: Arc<CodeUnit>,
    globals: Globals,
}

impl Function {
    #[must_use]
    pub fn new(code: Arc<CodeUnit>, globals: Globals) -> Self {
        Self {
            id: next_id(),
            code,
            globals,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn code(&self) -> &Arc<CodeUnit> {
        &self.code
    }

    #[must_use]
    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.code.name()
    }
}

#[derive(Debug, Clone)]
pub struct Method {
    pub receiver: Tensor,
    pub method: TensorMethod,
}

/// A callable that runs `inner` with an execution mode active.
#[derive(Debug)]
pub struct Wrapped {
    pub(crate) mode: EvalMode,
    pub(crate) inner: Value,
}

impl Value {
    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(items.into())
    }

    #[must_use]
    pub fn str(s: &str) -> Self {
        Self::Str(s.into())
    }

    /// Builds a host object with the given attributes.
    #[must_use]
    pub fn namespace<'a>(attrs: impl IntoIterator<Item = (&'a str, Self)>) -> Self {
        Self::Object(Rc::new(Object::new(
            attrs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
        )))
    }

    #[must_use]
    pub fn dict<'a>(items: impl IntoIterator<Item = (&'a str, Self)>) -> Self {
        Self::Dict(Rc::new(Dict::new(
            items.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
        )))
    }

    #[must_use]
    pub fn from_const(constant: &Const) -> Self {
        match constant {
            Const::None => Self::None,
            Const::Bool(b) => Self::Bool(*b),
            Const::Int(i) => Self::Int(*i),
            Const::Float(f) => Self::Float(*f),
            Const::Str(s) => Self::Str(s.as_ref().into()),
            Const::Code(code) => Self::Code(Arc::clone(code)),
            Const::Compiled(graph) => Self::Compiled(Arc::clone(graph)),
            Const::Builtin(builtin) => Self::Builtin(*builtin),
        }
    }

    /// The constant-table form of a literal value.
    #[must_use]
    pub fn to_const(&self) -> Option<Const> {
        Some(match self {
            Self::None => Const::None,
            Self::Bool(b) => Const::Bool(*b),
            Self::Int(i) => Const::Int(*i),
            Self::Float(f) => Const::Float(*f),
            Self::Str(s) => Const::Str(s.as_ref().into()),
            Self::Builtin(b) => Const::Builtin(*b),
            _ => return None,
        })
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Tuple(_) => "tuple",
            Self::Range(_) => "range",
            Self::Iter(_) => "iterator",
            Self::Generator(_) => "generator",
            Self::Dict(_) => "dict",
            Self::Object(_) => "namespace",
            Self::Function(_) | Self::Wrapped(_) => "function",
            Self::Builtin(_) => "builtin_function_or_method",
            Self::Method(_) => "method",
            Self::Code(_) => "code",
            Self::Compiled(_) => "compiled_function",
            Self::Tensor(_) => "Tensor",
            Self::ExcClass(_) => "type",
            Self::Exception(exc) => exc.exc_type().into(),
        }
    }

    /// Identity for values compared with `is` and guarded by identity.
    #[must_use]
    pub fn identity(&self) -> Option<u64> {
        match self {
            Self::Function(f) => Some(f.id()),
            Self::Object(o) => Some(o.id()),
            Self::Dict(d) => Some(d.id()),
            Self::Builtin(b) => Some(BUILTIN_ID_BASE | *b as u64),
            Self::ExcClass(t) => Some(EXC_CLASS_ID_BASE | *t as u64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Integer value of ints and bools.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Numeric value of ints, bools and floats.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    /// The tensor-operand form of a number.
    #[must_use]
    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Self::Bool(b) => Some(Scalar::Bool(*b)),
            Self::Int(i) => Some(Scalar::Int(*i)),
            Self::Float(f) => Some(Scalar::Float(*f)),
            _ => None,
        }
    }

    pub fn truthy(&self) -> RunResult<bool> {
        Ok(match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::Range(range) => !range.is_empty(),
            Self::Dict(dict) => !dict.items().is_empty(),
            Self::Tensor(t) => t
                .truthy()
                .map_err(|e| Exception::new(ExcType::RuntimeError, e.to_string()))?,
            _ => true,
        })
    }

    /// `a is b`.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => Rc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b),
            (Self::Iter(a), Self::Iter(b)) => Rc::ptr_eq(a, b),
            (Self::Generator(a), Self::Generator(b)) => Rc::ptr_eq(a, b),
            (Self::Tensor(a), Self::Tensor(b)) => std::ptr::eq(a.data(), b.data()) && a.shape() == b.shape(),
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Host equality for non-tensor values; tensors compare by identity.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y)),
            (Self::Range(a), Self::Range(b)) => a == b,
            (Self::Float(_), _) | (_, Self::Float(_)) => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            (Self::Int(_) | Self::Bool(_), Self::Int(_) | Self::Bool(_)) => self.as_int() == other.as_int(),
            (Self::Exception(a), Self::Exception(b)) => Rc::ptr_eq(a, b),
            _ => self.is(other),
        }
    }

    /// The `repr()` form: strings are quoted.
    #[must_use]
    pub fn repr(&self) -> String {
        match self {
            Self::Str(s) => format!("'{s}'"),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(b) => f.write_str(if *b { "True" } else { "False" }),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => f.write_str(&format_float(*v)),
            Self::Str(s) => f.write_str(s),
            Self::Tuple(items) => {
                f.write_char('(')?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(&item.repr())?;
                }
                if items.len() == 1 {
                    f.write_char(',')?;
                }
                f.write_char(')')
            }
            Self::Range(r) => {
                if r.step == 1 {
                    write!(f, "range({}, {})", r.start, r.stop)
                } else {
                    write!(f, "range({}, {}, {})", r.start, r.stop, r.step)
                }
            }
            Self::Iter(_) => f.write_str("<iterator>"),
            Self::Generator(g) => write!(f, "<generator object {}>", g.name),
            Self::Dict(d) => {
                f.write_char('{')?;
                for (i, (k, v)) in d.items().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{k}': {}", v.repr())?;
                }
                f.write_char('}')
            }
            Self::Object(o) => {
                f.write_str("namespace(")?;
                for (i, (k, v)) in o.attrs().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}={}", v.repr())?;
                }
                f.write_char(')')
            }
            Self::Function(func) => write!(f, "<function {}>", func.name()),
            Self::Builtin(b) => write!(f, "<built-in function {b}>"),
            Self::Method(m) => write!(f, "<built-in method {} of Tensor>", m.method),
            Self::Code(code) => write!(f, "{code}"),
            Self::Compiled(graph) => write!(f, "<compiled function {}>", graph.name()),
            Self::Tensor(t) => write!(f, "{t}"),
            Self::ExcClass(t) => write!(f, "<class '{t}'>"),
            Self::Exception(exc) => f.write_str(exc.message()),
            Self::Wrapped(w) => write!(f, "<wrapped {}>", w.inner),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensor(t) => write!(f, "{t:?}"),
            other => f.write_str(&other.repr()),
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        match s {
            Scalar::Bool(b) => Self::Bool(b),
            Scalar::Int(i) => Self::Int(i),
            Scalar::Float(f) => Self::Float(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_length_and_membership() {
        let r = Range {
            start: 10,
            stop: 0,
            step: -3,
        };
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(3), Some(1));
        assert!(r.contains(4));
        assert!(!r.contains(5));
    }

    #[test]
    fn display_matches_host_printing() {
        let value = Value::tuple(vec![Value::Int(1), Value::str("a"), Value::Float(2.0)]);
        assert_eq!(value.to_string(), "(1, 'a', 2.0)");
        assert_eq!(Value::tuple(vec![Value::None]).to_string(), "(None,)");
        assert_eq!(Value::namespace([("w", Value::Int(3))]).to_string(), "namespace(w=3)");
    }

    #[test]
    fn identity_is_stable_per_object() {
        let obj = Value::namespace([]);
        assert!(obj.is(&obj.clone()));
        assert!(!obj.is(&Value::namespace([])));
        assert!(Value::Int(1).equals(&Value::Float(1.0)));
        assert!(Value::Builtin(Builtin::Len).is(&Value::Builtin(Builtin::Len)));
    }
}
