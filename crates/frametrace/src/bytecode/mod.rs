//! Bytecode representation and compiler for the host language.
//!
//! # Module Structure
//!
//! - `op` - Opcode and instruction definitions
//! - `code` - Code units and their tables
//! - `builder` - CodeBuilder for emitting instructions
//! - `compiler` - source to code unit compiler
//! - `analysis` - dead-code elimination, jump cleanup and liveness

pub use analysis::{live_locals, remove_dead_code, remove_load_pop_pairs, remove_pointless_jumps};
pub use builder::{CodeBuilder, JumpLabel};
pub use code::{CodeKind, CodeParts, CodeTables, CodeUnit, Const};
pub use compiler::{Program, compile};
pub use op::{BinOp, CmpOp, Instruction, Opcode};

mod analysis;
mod builder;
mod code;
mod compiler;
mod op;

pub(crate) use code::to_operand;
