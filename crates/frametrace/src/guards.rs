//! Guards: predicates over the values a cached conversion depends on.
//!
//! Every value the tracer reads from a frame is reached through a [`Source`]
//! (a local, a global, or an attribute, index or dict item of another source)
//! and pinned by a [`Guard`]. A [`GuardSet`] is the conjunction of the guards of
//! one cache entry; it must pass before the entry's code runs.
//!
//! Checks never fail loudly: a source that cannot be resolved, or a value of the
//! wrong type, makes the guard false, which only forces a new conversion.

use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::{
    tensor::{DType, Tensor},
    value::{Globals, Value},
    vm::lookup_global,
};

/// Where a guarded value is read from when a frame starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Source {
    Local { name: String, slot: u16 },
    Global(String),
    Attr(Box<Source>, String),
    Index(Box<Source>, usize),
    DictItem(Box<Source>, String),
}

impl Source {
    #[must_use]
    pub fn local(name: &str, slot: u16) -> Self {
        Self::Local {
            name: name.to_owned(),
            slot,
        }
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Self {
        Self::Attr(Box::new(self.clone()), name.to_owned())
    }

    #[must_use]
    pub fn index(&self, index: usize) -> Self {
        Self::Index(Box::new(self.clone()), index)
    }

    #[must_use]
    pub fn dict_item(&self, key: &str) -> Self {
        Self::DictItem(Box::new(self.clone()), key.to_owned())
    }

    /// Reads the value at this source, or `None` if the path no longer exists.
    #[must_use]
    pub fn resolve(&self, locals: &[Option<Value>], globals: &Globals) -> Option<Value> {
        match self {
            Self::Local { slot, .. } => locals.get(usize::from(*slot)).cloned().flatten(),
            Self::Global(name) => lookup_global(globals, name),
            Self::Attr(base, name) => match base.resolve(locals, globals)? {
                Value::Object(obj) => obj.get_attr(name),
                _ => None,
            },
            Self::Index(base, index) => match base.resolve(locals, globals)? {
                Value::Tuple(items) => items.get(*index).cloned(),
                _ => None,
            },
            Self::DictItem(base, key) => match base.resolve(locals, globals)? {
                Value::Dict(dict) => dict.get(key).cloned(),
                _ => None,
            },
        }
    }

    /// Identifier-friendly name for graph placeholders.
    #[must_use]
    pub fn name_hint(&self) -> String {
        match self {
            Self::Local { name, .. } | Self::Global(name) => name.clone(),
            Self::Attr(base, name) | Self::DictItem(base, name) => format!("{}_{name}", base.name_hint()),
            Self::Index(base, index) => format!("{}_{index}", base.name_hint()),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { name, .. } => write!(f, "L['{name}']"),
            Self::Global(name) => write!(f, "G['{name}']"),
            Self::Attr(base, name) => write!(f, "{base}.{name}"),
            Self::Index(base, index) => write!(f, "{base}[{index}]"),
            Self::DictItem(base, key) => write!(f, "{base}['{key}']"),
        }
    }
}

/// A hashable snapshot of a literal value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    /// Bit pattern of the float, so equality is total.
    Float(u64),
    Str(String),
    Range { start: i64, stop: i64, step: i64 },
}

impl Literal {
    /// The literal form of `value`, for values guarded by equality.
    #[must_use]
    pub fn of(value: &Value) -> Option<Self> {
        Some(match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) => Self::Float(f.to_bits()),
            Value::Str(s) => Self::Str(s.to_string()),
            Value::Range(r) => Self::Range {
                start: r.start,
                stop: r.stop,
                step: r.step,
            },
            _ => return None,
        })
    }

    /// Same type and same value. `1`, `1.0` and `True` are all different.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        Self::of(value).as_ref() == Some(self)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(b) => f.write_str(if *b { "True" } else { "False" }),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(bits) => f.write_str(&crate::tensor::format_float(f64::from_bits(*bits))),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Range { start, stop, step } => write!(f, "range({start}, {stop}, {step})"),
        }
    }
}

/// What a guard checks about the value at its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardKind {
    /// Type name, plus the length for tuples.
    TypeMatch { type_name: String, len: Option<usize> },
    /// Object identity of functions, builtins, exception classes, objects and dicts.
    Identity(u64),
    ValueMatch(Literal),
    /// The host object at the source has this attribute.
    HasAttr(String),
    /// A tensor with this dtype and rank; `None` sizes match any size.
    TensorMatch { dtype: DType, sizes: Vec<Option<usize>> },
}

impl GuardKind {
    /// Relative evaluation cost, cheapest first.
    #[must_use]
    pub fn cost(&self) -> u8 {
        match self {
            Self::TypeMatch { .. } => 0,
            Self::Identity(_) => 1,
            Self::ValueMatch(_) => 2,
            Self::HasAttr(_) => 3,
            Self::TensorMatch { .. } => 4,
        }
    }

    /// Guard on the exact dtype and sizes of `tensor`.
    #[must_use]
    pub fn tensor_exact(tensor: &Tensor) -> Self {
        Self::TensorMatch {
            dtype: tensor.dtype(),
            sizes: tensor.shape().iter().copied().map(Some).collect(),
        }
    }

    /// Guard on dtype and rank only. Sizes 0 and 1 stay specialized because
    /// broadcasting treats them differently.
    #[must_use]
    pub fn tensor_dynamic(tensor: &Tensor) -> Self {
        Self::TensorMatch {
            dtype: tensor.dtype(),
            sizes: tensor
                .shape()
                .iter()
                .map(|&size| (size <= 1).then_some(size))
                .collect(),
        }
    }

    fn check(&self, value: &Value) -> bool {
        match self {
            Self::TypeMatch { type_name, len } => {
                value.type_name() == type_name
                    && match (len, value) {
                        (Some(len), Value::Tuple(items)) => items.len() == *len,
                        (Some(_), _) => false,
                        (None, _) => true,
                    }
            }
            Self::Identity(id) => value.identity() == Some(*id),
            Self::ValueMatch(literal) => literal.matches(value),
            Self::HasAttr(name) => matches!(value, Value::Object(obj) if obj.has_attr(name)),
            Self::TensorMatch { dtype, sizes } => match value {
                Value::Tensor(t) => {
                    t.dtype() == *dtype
                        && t.ndim() == sizes.len()
                        && t
                            .shape()
                            .iter()
                            .zip(sizes)
                            .all(|(actual, expected)| expected.is_none_or(|e| e == *actual))
                }
                _ => false,
            },
        }
    }
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMatch { type_name, len: Some(len) } => write!(f, "TYPE_MATCH {type_name} len={len}"),
            Self::TypeMatch { type_name, len: None } => write!(f, "TYPE_MATCH {type_name}"),
            Self::Identity(id) => write!(f, "ID_MATCH {id}"),
            Self::ValueMatch(literal) => write!(f, "VALUE_MATCH {literal}"),
            Self::HasAttr(name) => write!(f, "HASATTR {name}"),
            Self::TensorMatch { dtype, sizes } => {
                let sizes: Vec<String> = sizes
                    .iter()
                    .map(|s| s.map_or_else(|| "?".to_owned(), |s| s.to_string()))
                    .collect();
                write!(f, "TENSOR_MATCH {dtype}[{}]", sizes.join(", "))
            }
        }
    }
}

/// One predicate: `kind` holds for the value at `source`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guard {
    pub source: Source,
    pub kind: GuardKind,
}

impl Guard {
    #[must_use]
    pub fn new(source: Source, kind: GuardKind) -> Self {
        Self { source, kind }
    }

    #[must_use]
    pub fn check(&self, locals: &[Option<Value>], globals: &Globals) -> bool {
        self.source
            .resolve(locals, globals)
            .is_some_and(|value| self.kind.check(&value))
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.source, self.kind)
    }
}

/// The deduplicated, cost-ordered guards of one cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSet {
    guards: Vec<Guard>,
}

impl GuardSet {
    /// Deduplicates and orders guards cheapest first. Guards on a shorter
    /// source path come first within a cost class, so an object is checked
    /// before its attributes.
    #[must_use]
    pub fn build(guards: impl IntoIterator<Item = Guard>) -> Self {
        let unique: IndexSet<Guard> = guards.into_iter().collect();
        let mut guards: Vec<Guard> = unique.into_iter().collect();
        guards.sort_by_cached_key(|guard| (guard.kind.cost(), path_len(&guard.source), guard.source.to_string()));
        Self { guards }
    }

    /// Whether every guard passes for a frame with these locals and globals.
    #[must_use]
    pub fn check(&self, locals: &[Option<Value>], globals: &Globals) -> bool {
        self.guards.iter().all(|guard| guard.check(locals, globals))
    }

    /// The first failing guard, printed.
    #[must_use]
    pub fn failure(&self, locals: &[Option<Value>], globals: &Globals) -> Option<String> {
        self.guards
            .iter()
            .find(|guard| !guard.check(locals, globals))
            .map(ToString::to_string)
    }

    #[must_use]
    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

fn path_len(source: &Source) -> usize {
    match source {
        Source::Local { .. } | Source::Global(_) => 1,
        Source::Attr(base, _) | Source::Index(base, _) | Source::DictItem(base, _) => 1 + path_len(base),
    }
}

impl fmt::Display for GuardSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, guard) in self.guards.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{guard}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::value::new_globals;

    fn tensor(shape: &[usize]) -> Value {
        Value::Tensor(Tensor::full(shape, 0.0, DType::Float32))
    }

    #[test]
    fn tensor_guards_exact_and_dynamic() {
        let x = Source::local("x", 0);
        let globals = new_globals();
        let Value::Tensor(t) = tensor(&[3, 1]) else { unreachable!() };
        let exact = Guard::new(x.clone(), GuardKind::tensor_exact(&t));
        let dynamic = Guard::new(x, GuardKind::tensor_dynamic(&t));
        assert_eq!(exact.to_string(), "L['x'] TENSOR_MATCH float32[3, 1]");
        assert_eq!(dynamic.to_string(), "L['x'] TENSOR_MATCH float32[?, 1]");

        let wider = [Some(tensor(&[5, 1]))];
        assert!(!exact.check(&wider, &globals));
        assert!(dynamic.check(&wider, &globals));
        let broadcast = [Some(tensor(&[5, 2]))];
        assert!(!dynamic.check(&broadcast, &globals));
        let ints = [Some(Value::Tensor(Tensor::full(&[3, 1], 0.0, DType::Int64)))];
        assert!(!exact.check(&ints, &globals));
    }

    #[test]
    fn value_guards_distinguish_types() {
        let guard = Guard::new(Source::local("n", 0), GuardKind::ValueMatch(Literal::Int(1)));
        let globals = new_globals();
        assert!(guard.check(&[Some(Value::Int(1))], &globals));
        assert!(!guard.check(&[Some(Value::Bool(true))], &globals));
        assert!(!guard.check(&[Some(Value::Float(1.0))], &globals));
        assert!(!guard.check(&[None], &globals));
        assert!(!guard.check(&[], &globals));
    }

    #[test]
    fn attribute_chains_resolve() {
        let globals = new_globals();
        let module = Value::namespace([("w", tensor(&[2]))]);
        globals.borrow_mut().insert("m".to_owned(), module.clone());
        let m = Source::Global("m".to_owned());
        let has_w = Guard::new(m.clone(), GuardKind::HasAttr("w".to_owned()));
        let w_shape = Guard::new(m.attr("w"), GuardKind::TensorMatch {
            dtype: DType::Float32,
            sizes: vec![Some(2)],
        });
        assert!(has_w.check(&[], &globals));
        assert!(w_shape.check(&[], &globals));
        assert_eq!(w_shape.to_string(), "G['m'].w TENSOR_MATCH float32[2]");

        let Value::Object(obj) = &module else { unreachable!() };
        obj.set_attr("w", tensor(&[4]));
        assert!(!w_shape.check(&[], &globals));
    }

    #[test]
    fn identity_and_containers() {
        let globals = new_globals();
        let obj = Value::namespace([]);
        let other = Value::namespace([]);
        let guard = Guard::new(Source::local("o", 0), GuardKind::Identity(obj.identity().unwrap()));
        assert!(guard.check(&[Some(obj)], &globals));
        assert!(!guard.check(&[Some(other)], &globals));

        let pair = Value::tuple(vec![Value::Int(1), tensor(&[2])]);
        let t = Source::local("t", 0);
        let type_guard = Guard::new(t.clone(), GuardKind::TypeMatch {
            type_name: "tuple".to_owned(),
            len: Some(2),
        });
        let first = Guard::new(t.index(0), GuardKind::ValueMatch(Literal::Int(1)));
        assert!(type_guard.check(&[Some(pair.clone())], &globals));
        assert!(first.check(&[Some(pair)], &globals));
        assert!(!type_guard.check(&[Some(Value::tuple(vec![Value::Int(1)]))], &globals));

        let d = Value::dict([("k", Value::str("v"))]);
        let item = Guard::new(Source::local("d", 0).dict_item("k"), GuardKind::ValueMatch(Literal::Str("v".into())));
        assert!(item.check(&[Some(d)], &globals));
        assert_eq!(item.to_string(), "L['d']['k'] VALUE_MATCH 'v'");
    }

    #[test]
    fn sets_deduplicate_and_order() {
        let x = Source::local("x", 0);
        let set = GuardSet::build([
            Guard::new(x.clone(), GuardKind::TensorMatch {
                dtype: DType::Float32,
                sizes: vec![Some(2)],
            }),
            Guard::new(x.clone(), GuardKind::ValueMatch(Literal::None)),
            Guard::new(x.clone(), GuardKind::ValueMatch(Literal::None)),
            Guard::new(Source::Global("len".into()), GuardKind::Identity(7)),
        ]);
        assert_eq!(set.len(), 3);
        let kinds: Vec<u8> = set.guards().iter().map(|g| g.kind.cost()).collect();
        assert_eq!(kinds, vec![1, 2, 4]);
        let globals = new_globals();
        assert_eq!(
            set.failure(&[Some(Value::None)], &globals).as_deref(),
            Some("G['len'] ID_MATCH 7")
        );
    }
}
