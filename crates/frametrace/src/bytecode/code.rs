//! Code units: immutable instruction sequences plus their tables.

use std::{
    fmt::{self, Write as _},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use super::op::{Instruction, Opcode};
use crate::{backend::CompiledGraph, vm::Builtin};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// A constant in a code unit's constant table.
#[derive(Debug, Clone)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// A nested function body, turned into a function by `MakeFunction`.
    Code(Arc<CodeUnit>),
    /// A backend-compiled graph, called by rewritten code.
    Compiled(Arc<CompiledGraph>),
    /// A native builtin, referenced by rewritten code without a global lookup.
    Builtin(Builtin),
}

impl Const {
    /// Identity-aware equality used to deduplicate constant tables.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Code(a), Self::Code(b)) => Arc::ptr_eq(a, b),
            (Self::Compiled(a), Self::Compiled(b)) => Arc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(b) => f.write_str(if *b { "True" } else { "False" }),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => f.write_str(&crate::tensor::format_float(*v)),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Code(code) => write!(f, "<code {}>", code.qualname()),
            Self::Compiled(graph) => write!(f, "<compiled {}>", graph.name()),
            Self::Builtin(builtin) => write!(f, "<builtin {builtin}>"),
        }
    }
}

/// How a code unit came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CodeKind {
    /// Compiled from user source.
    Original,
    /// Output of a frame conversion; installed in place of its input.
    Rewritten,
    /// A continuation synthesized at a graph break.
    Resume,
}

/// The mutable tables of a code unit under construction.
///
/// Rewriting copies the tables of the input code and only ever appends, so
/// operands of copied instructions stay valid.
#[derive(Debug, Clone, Default)]
pub struct CodeTables {
    pub varnames: Vec<String>,
    pub names: Vec<String>,
    pub consts: Vec<Const>,
}

impl CodeTables {
    pub fn add_const(&mut self, value: Const) -> u16 {
        if let Some(index) = self.consts.iter().position(|c| c.same(&value)) {
            return to_operand(index);
        }
        self.consts.push(value);
        to_operand(self.consts.len() - 1)
    }

    pub fn add_name(&mut self, name: &str) -> u16 {
        if let Some(index) = self.names.iter().position(|n| n == name) {
            return to_operand(index);
        }
        self.names.push(name.to_owned());
        to_operand(self.names.len() - 1)
    }

    pub fn add_varname(&mut self, name: &str) -> u16 {
        if let Some(index) = self.varnames.iter().position(|n| n == name) {
            return to_operand(index);
        }
        self.varnames.push(name.to_owned());
        to_operand(self.varnames.len() - 1)
    }

    #[must_use]
    pub fn varname_slot(&self, name: &str) -> Option<u16> {
        self.varnames.iter().position(|n| n == name).map(to_operand)
    }
}

pub(crate) fn to_operand(index: usize) -> u16 {
    u16::try_from(index).expect("code tables are limited to u16::MAX entries")
}

/// Everything needed to construct a [`CodeUnit`].
#[derive(Debug, Clone)]
pub struct CodeParts {
    pub name: String,
    pub qualname: String,
    pub filename: String,
    pub first_line: u32,
    pub arg_count: usize,
    pub tables: CodeTables,
    pub instructions: Vec<Instruction>,
    pub is_generator: bool,
    pub kind: CodeKind,
    pub root: Option<Arc<CodeUnit>>,
}

/// An immutable unit of interpretable instructions.
///
/// Identified for caching purposes by its process-unique `serial`. Rewritten
/// and resume code units remember the original code unit they derive from.
#[derive(Debug)]
pub struct CodeUnit {
    serial: u64,
    name: String,
    qualname: String,
    filename: String,
    first_line: u32,
    arg_count: usize,
    tables: CodeTables,
    instructions: Vec<Instruction>,
    is_generator: bool,
    kind: CodeKind,
    root: Option<Arc<CodeUnit>>,
}

impl CodeUnit {
    #[must_use]
    pub fn new(parts: CodeParts) -> Self {
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            name: parts.name,
            qualname: parts.qualname,
            filename: parts.filename,
            first_line: parts.first_line,
            arg_count: parts.arg_count,
            tables: parts.tables,
            instructions: parts.instructions,
            is_generator: parts.is_generator,
            kind: parts.kind,
            root: parts.root,
        }
    }

    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    #[must_use]
    pub fn varnames(&self) -> &[String] {
        &self.tables.varnames
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.tables.names
    }

    #[must_use]
    pub fn consts(&self) -> &[Const] {
        &self.tables.consts
    }

    #[must_use]
    pub fn tables(&self) -> &CodeTables {
        &self.tables
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.is_generator
    }

    #[must_use]
    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    /// The user-written code unit this one was derived from, if synthesized.
    #[must_use]
    pub fn origin(&self) -> Option<&Arc<Self>> {
        self.root.as_ref()
    }

    /// The user-written code unit at the root of this one's derivation chain.
    #[must_use]
    pub fn root(self: &Arc<Self>) -> Arc<Self> {
        self.root.clone().unwrap_or_else(|| Arc::clone(self))
    }

    /// Short human-readable identification: `'name' (file:line)`.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("'{}' ({}:{})", self.name, self.filename, self.first_line)
    }

    /// Renders the instruction listing with resolved operands.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let targets: Vec<u32> = self.instructions.iter().filter_map(|i| i.opcode.target()).collect();
        for (index, instruction) in self.instructions.iter().enumerate() {
            let marker = if targets.contains(&(index as u32)) { ">>" } else { "  " };
            let line = if instruction.line == 0 {
                "    ".to_owned()
            } else {
                format!("{:>4}", instruction.line)
            };
            let _ = write!(out, "{line} {marker} {index:>4} {:<24}", instruction.opcode.to_string());
            if let Some(detail) = self.operand_detail(instruction.opcode) {
                let _ = write!(out, " ({detail})");
            }
            out.push('\n');
        }
        out
    }

    fn operand_detail(&self, opcode: Opcode) -> Option<String> {
        let index = |n: u16| usize::from(n);
        match opcode {
            Opcode::LoadConst(n) => self.consts().get(index(n)).map(ToString::to_string),
            Opcode::LoadFast(n) | Opcode::StoreFast(n) => self.varnames().get(index(n)).cloned(),
            Opcode::LoadGlobal(n) | Opcode::StoreGlobal(n) | Opcode::LoadAttr(n) | Opcode::StoreAttr(n) => {
                self.names().get(index(n)).cloned()
            }
            _ => None,
        }
    }
}

impl fmt::Display for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<code {} {}>", self.qualname, self.describe())
    }
}
