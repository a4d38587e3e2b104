//! Opcode definitions.
//!
//! Instructions are kept decoded (an enum with inline operands) rather than as
//! raw bytes: the tracer rewrites instruction sequences, splices prologues into
//! continuations and runs cleanup passes over them, all of which need to move
//! whole instructions and retarget jumps.
//!
//! Jump operands are instruction indices into the owning sequence.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

/// Arithmetic operators shared by the interpreter and the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    MatMul,
}

impl BinOp {
    /// Source-level symbol, used in error messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::MatMul => "@",
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    Is,
    IsNot,
    In,
    NotIn,
    /// `except` clause matching: TOS1 is the raised exception, TOS the class (or tuple of classes).
    ExcMatch,
}

impl CmpOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::ExcMatch => "exception match",
        }
    }

    /// Whether the operator is an elementwise ordering/equality comparison.
    #[must_use]
    pub fn is_rich(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Eq | Self::Ne | Self::Gt | Self::Ge)
    }
}

/// A single VM instruction with its operands.
///
/// `u16` operands index the owning code unit's tables (`consts`, `names` or
/// `varnames`, depending on the opcode). `u32` operands are jump targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, Serialize, Deserialize)]
pub enum Opcode {
    Nop,

    // Loads and stores
    LoadConst(u16),
    LoadFast(u16),
    StoreFast(u16),
    LoadGlobal(u16),
    StoreGlobal(u16),
    LoadAttr(u16),
    StoreAttr(u16),
    BinarySubscr,

    // Operators
    BinaryOp(BinOp),
    UnaryNegative,
    UnaryNot,
    CompareOp(CmpOp),

    // Containers
    BuildTuple(u16),
    /// Builds a dict from `n` key/value pairs (key pushed first).
    BuildMap(u16),
    UnpackSequence(u16),

    // Calls
    CallFunction(u16),
    /// `f(a, b, *rest)`: pops `rest`, then `n` positional args, then the callee.
    CallFunctionEx(u16),
    /// Pops a code constant and pushes a function bound to the current globals.
    MakeFunction,
    ReturnValue,
    YieldValue,

    // Stack manipulation
    PopTop,
    DupTop,
    RotTwo,
    RotThree,
    /// Moves TOS down to position `n` (1 is a no-op).
    RotN(u16),

    // Control flow
    Jump(u32),
    PopJumpIfFalse(u32),
    PopJumpIfTrue(u32),
    JumpIfFalseOrPop(u32),
    JumpIfTrueOrPop(u32),
    GetIter,
    /// Pushes the next item of the iterator at TOS, or pops it and jumps when exhausted.
    ForIter(u32),

    // Exceptions
    SetupExcept(u32),
    PopBlock,
    /// Raises TOS (an exception instance or class).
    Raise,
    /// Re-raises the exception at TOS from an unmatched handler.
    Reraise,
}

impl Opcode {
    /// The jump target, for opcodes that have one.
    #[must_use]
    pub fn target(self) -> Option<u32> {
        match self {
            Self::Jump(t)
            | Self::PopJumpIfFalse(t)
            | Self::PopJumpIfTrue(t)
            | Self::JumpIfFalseOrPop(t)
            | Self::JumpIfTrueOrPop(t)
            | Self::ForIter(t)
            | Self::SetupExcept(t) => Some(t),
            _ => None,
        }
    }

    /// Returns a copy of this opcode pointing at `target`.
    ///
    /// Opcodes without a target are returned unchanged.
    #[must_use]
    pub fn with_target(self, target: u32) -> Self {
        match self {
            Self::Jump(_) => Self::Jump(target),
            Self::PopJumpIfFalse(_) => Self::PopJumpIfFalse(target),
            Self::PopJumpIfTrue(_) => Self::PopJumpIfTrue(target),
            Self::JumpIfFalseOrPop(_) => Self::JumpIfFalseOrPop(target),
            Self::JumpIfTrueOrPop(_) => Self::JumpIfTrueOrPop(target),
            Self::ForIter(_) => Self::ForIter(target),
            Self::SetupExcept(_) => Self::SetupExcept(target),
            other => other,
        }
    }

    /// Control never falls through to the next instruction.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ReturnValue | Self::Jump(_) | Self::Raise | Self::Reraise)
    }

    /// Local slot read by this opcode.
    #[must_use]
    pub fn reads_local(self) -> Option<u16> {
        match self {
            Self::LoadFast(slot) => Some(slot),
            _ => None,
        }
    }

    /// Local slot written by this opcode.
    #[must_use]
    pub fn writes_local(self) -> Option<u16> {
        match self {
            Self::StoreFast(slot) => Some(slot),
            _ => None,
        }
    }

    /// Net stack effect of the opcode when control falls through.
    ///
    /// `ForIter` reports the effect of the non-exhausted path.
    #[must_use]
    pub fn stack_effect(self) -> i32 {
        match self {
            Self::Nop
            | Self::Jump(_)
            | Self::RotTwo
            | Self::RotThree
            | Self::RotN(_)
            | Self::UnaryNegative
            | Self::UnaryNot
            | Self::GetIter
            | Self::LoadAttr(_)
            | Self::MakeFunction
            | Self::SetupExcept(_)
            | Self::PopBlock
            | Self::YieldValue => 0,
            Self::LoadConst(_) | Self::LoadFast(_) | Self::LoadGlobal(_) | Self::DupTop | Self::ForIter(_) => 1,
            Self::StoreFast(_)
            | Self::StoreGlobal(_)
            | Self::BinarySubscr
            | Self::BinaryOp(_)
            | Self::CompareOp(_)
            | Self::PopTop
            | Self::PopJumpIfFalse(_)
            | Self::PopJumpIfTrue(_)
            | Self::JumpIfFalseOrPop(_)
            | Self::JumpIfTrueOrPop(_)
            | Self::ReturnValue
            | Self::Raise
            | Self::Reraise => -1,
            Self::StoreAttr(_) => -2,
            Self::BuildTuple(n) => 1 - i32::from(n),
            Self::BuildMap(n) => 1 - 2 * i32::from(n),
            Self::UnpackSequence(n) => i32::from(n) - 1,
            Self::CallFunction(n) => -i32::from(n),
            Self::CallFunctionEx(n) => -i32::from(n) - 1,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &'static str = self.into();
        match self {
            Self::LoadConst(n)
            | Self::LoadFast(n)
            | Self::StoreFast(n)
            | Self::LoadGlobal(n)
            | Self::StoreGlobal(n)
            | Self::LoadAttr(n)
            | Self::StoreAttr(n)
            | Self::BuildTuple(n)
            | Self::BuildMap(n)
            | Self::UnpackSequence(n)
            | Self::CallFunction(n)
            | Self::CallFunctionEx(n)
            | Self::RotN(n) => write!(f, "{name} {n}"),
            Self::BinaryOp(op) => write!(f, "{name} {op}"),
            Self::CompareOp(op) => write!(f, "{name} {op}"),
            other => match other.target() {
                Some(target) => write!(f, "{name} -> {target}"),
                None => f.write_str(name),
            },
        }
    }
}

/// An instruction plus the metadata the tracer needs to relate rewritten code
/// back to the user's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    /// Source line, 0 for generated instructions.
    pub line: u32,
    /// Offset of the instruction in the root (user-written) code unit this one
    /// was copied from. `None` for instructions synthesized by the tracer.
    pub origin: Option<u32>,
}

impl Instruction {
    #[must_use]
    pub fn new(opcode: Opcode, line: u32) -> Self {
        Self {
            opcode,
            line,
            origin: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retarget_only_touches_jumps() {
        assert_eq!(Opcode::Jump(3).with_target(9), Opcode::Jump(9));
        assert_eq!(Opcode::ForIter(1).with_target(4).target(), Some(4));
        assert_eq!(Opcode::PopTop.with_target(4), Opcode::PopTop);
    }

    #[test]
    fn display_forms() {
        assert_eq!(Opcode::LoadFast(2).to_string(), "LoadFast 2");
        assert_eq!(Opcode::BinaryOp(BinOp::FloorDiv).to_string(), "BinaryOp floor_div");
        assert_eq!(Opcode::PopJumpIfFalse(7).to_string(), "PopJumpIfFalse -> 7");
        assert_eq!(Opcode::ReturnValue.to_string(), "ReturnValue");
    }

    #[test]
    fn stack_effects() {
        assert_eq!(Opcode::CallFunction(2).stack_effect(), -2);
        assert_eq!(Opcode::CallFunctionEx(1).stack_effect(), -2);
        assert_eq!(Opcode::UnpackSequence(3).stack_effect(), 2);
        assert_eq!(Opcode::BuildMap(2).stack_effect(), -3);
    }
}
