//! Symbolic values on the tracer's stack and in its locals.

use std::{cell::RefCell, fmt, rc::Rc};

use indexmap::IndexMap;

use crate::{
    error::ExcType,
    graph::NodeId,
    guards::Source,
    value::{Dict, Function, Object, Value},
    vm::{Builtin, TensorMethod},
};

/// A symbolic value plus where it was read from, if it came from the frame.
#[derive(Debug, Clone)]
pub(crate) struct Var {
    pub kind: VarKind,
    /// Rewritten code reloads sourced values instead of rebuilding them.
    pub source: Option<Source>,
}

#[derive(Clone)]
pub(crate) enum VarKind {
    /// A graph node.
    Tensor(NodeId),
    /// None, bools, numbers, strings and ranges, known while tracing.
    Const(Value),
    Builtin(Builtin),
    ExcClass(ExcType),
    Function(Rc<Function>),
    Object(Rc<Object>),
    /// A dict read from the frame. Dicts are immutable, so its items are known.
    Dict(Rc<Dict>),
    Tuple(Rc<[Var]>),
    /// A dict built while tracing.
    ConstDict(Rc<IndexMap<String, Var>>),
    /// An iterator created while tracing; shared by every reference to it.
    Iter(Rc<RefCell<IterState>>),
    /// `x.sum` before it is called.
    TensorMethod { receiver: Box<Var>, method: TensorMethod },
}

impl fmt::Debug for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensor(node) => write!(f, "Tensor({})", node.index()),
            Self::Const(value) => write!(f, "Const({value:?})"),
            Self::Builtin(builtin) => write!(f, "Builtin({builtin})"),
            Self::ExcClass(exc) => write!(f, "ExcClass({exc})"),
            Self::Function(func) => write!(f, "Function({})", func.name()),
            Self::Object(obj) => write!(f, "Object({})", obj.id()),
            Self::Dict(dict) => write!(f, "Dict({})", dict.id()),
            Self::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Self::ConstDict(items) => f.debug_tuple("ConstDict").field(items).finish(),
            Self::Iter(iter) => {
                let iter = iter.borrow();
                write!(f, "Iter({}/{})", iter.pos, iter.items.len())
            }
            Self::TensorMethod { receiver, method } => write!(f, "TensorMethod({receiver:?}.{method})"),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct IterState {
    pub items: Vec<Var>,
    pub pos: usize,
}

impl IterState {
    pub fn next_item(&mut self) -> Option<Var> {
        let item = self.items.get(self.pos).cloned()?;
        self.pos += 1;
        Some(item)
    }

    pub fn remaining(&self) -> &[Var] {
        &self.items[self.pos.min(self.items.len())..]
    }

    /// Takes everything not yet produced, exhausting the iterator.
    pub fn drain(&mut self) -> Vec<Var> {
        let rest = self.remaining().to_vec();
        self.pos = self.items.len();
        rest
    }
}

impl Var {
    pub fn new(kind: VarKind) -> Self {
        Self { kind, source: None }
    }

    pub fn sourced(kind: VarKind, source: Source) -> Self {
        Self {
            kind,
            source: Some(source),
        }
    }

    pub fn constant(value: Value) -> Self {
        Self::new(VarKind::Const(value))
    }

    pub fn tensor(node: NodeId) -> Self {
        Self::new(VarKind::Tensor(node))
    }

    pub fn tuple(items: Vec<Self>) -> Self {
        Self::new(VarKind::Tuple(items.into()))
    }

    pub fn iter(items: Vec<Self>) -> Self {
        Self::new(VarKind::Iter(Rc::new(RefCell::new(IterState { items, pos: 0 }))))
    }

    /// The result of an operation on known values, if the tracer can hold it.
    pub fn from_value(value: Value) -> Option<Self> {
        Some(Self::new(match value {
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) | Value::Range(_) => {
                VarKind::Const(value)
            }
            Value::Builtin(builtin) => VarKind::Builtin(builtin),
            Value::ExcClass(exc) => VarKind::ExcClass(exc),
            Value::Tuple(items) => {
                let items: Option<Vec<Self>> = items.iter().cloned().map(Self::from_value).collect();
                VarKind::Tuple(items?.into())
            }
            _ => return None,
        }))
    }

    /// The host value, when nothing about it depends on graph results.
    pub fn as_value(&self) -> Option<Value> {
        Some(match &self.kind {
            VarKind::Const(value) => value.clone(),
            VarKind::Builtin(builtin) => Value::Builtin(*builtin),
            VarKind::ExcClass(exc) => Value::ExcClass(*exc),
            VarKind::Function(func) => Value::Function(Rc::clone(func)),
            VarKind::Object(obj) => Value::Object(Rc::clone(obj)),
            VarKind::Dict(dict) => Value::Dict(Rc::clone(dict)),
            VarKind::Tuple(items) => {
                let items: Option<Vec<Value>> = items.iter().map(Self::as_value).collect();
                Value::tuple(items?)
            }
            VarKind::Tensor(_) | VarKind::ConstDict(_) | VarKind::Iter(_) | VarKind::TensorMethod { .. } => {
                return None;
            }
        })
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self.kind {
            VarKind::Tensor(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.kind {
            VarKind::Const(value) => value.as_int(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            VarKind::Const(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Truthiness of values that are known while tracing. `None` for tensors.
    pub fn truthy(&self) -> Option<bool> {
        match &self.kind {
            VarKind::Tensor(_) => None,
            VarKind::Const(value) => value.truthy().ok(),
            VarKind::Tuple(items) => Some(!items.is_empty()),
            VarKind::ConstDict(items) => Some(!items.is_empty()),
            VarKind::Dict(dict) => Some(!dict.items().is_empty()),
            VarKind::Builtin(_)
            | VarKind::ExcClass(_)
            | VarKind::Function(_)
            | VarKind::Object(_)
            | VarKind::Iter(_)
            | VarKind::TensorMethod { .. } => Some(true),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            VarKind::Tensor(_) => "Tensor",
            VarKind::Const(value) => value.type_name(),
            VarKind::Builtin(_) => "builtin_function_or_method",
            VarKind::ExcClass(_) => "type",
            VarKind::Function(_) => "function",
            VarKind::Object(_) => "namespace",
            VarKind::Dict(_) | VarKind::ConstDict(_) => "dict",
            VarKind::Tuple(_) => "tuple",
            VarKind::Iter(_) => "iterator",
            VarKind::TensorMethod { .. } => "method",
        }
    }

    /// Calls `f` on every graph node reachable from this value.
    pub fn for_each_node(&self, f: &mut impl FnMut(NodeId)) {
        match &self.kind {
            VarKind::Tensor(node) => f(*node),
            VarKind::Tuple(items) => items.iter().for_each(|item| item.for_each_node(f)),
            VarKind::ConstDict(items) => items.values().for_each(|item| item.for_each_node(f)),
            VarKind::Iter(iter) => iter.borrow().remaining().iter().for_each(|item| item.for_each_node(f)),
            VarKind::TensorMethod { receiver, .. } => receiver.for_each_node(f),
            _ => {}
        }
    }

    /// Whether an iterator is nested somewhere inside this value.
    pub fn contains_iter(&self) -> bool {
        match &self.kind {
            VarKind::Iter(_) => true,
            VarKind::Tuple(items) => items.iter().any(Self::contains_iter),
            VarKind::ConstDict(items) => items.values().any(Self::contains_iter),
            _ => false,
        }
    }
}
