//! Builder for emitting instruction sequences.
//!
//! `CodeBuilder` is used both by the source compiler and by the tracer when it
//! generates rewritten code and continuations. It handles forward jumps with
//! patching, tracks the current source line and the maximum stack depth.

use std::sync::Arc;

use super::{
    code::{CodeKind, CodeParts, CodeTables, CodeUnit, Const},
    op::{Instruction, Opcode},
};

/// A forward jump waiting for its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "forward jumps must be patched"]
pub struct JumpLabel(usize);

/// Builder for instruction sequences.
///
/// # Usage
///
/// ```ignore
/// let mut builder = CodeBuilder::new(tables);
/// builder.set_line(3);
/// builder.emit(Opcode::LoadFast(0));
/// let jump = builder.emit_jump(Opcode::PopJumpIfFalse(0));
/// // ... emit more code ...
/// builder.patch_jump(jump);
/// ```
#[derive(Debug, Default)]
pub struct CodeBuilder {
    instructions: Vec<Instruction>,
    tables: CodeTables,
    current_line: u32,
    current_stack_depth: i32,
    max_stack_depth: i32,
}

impl CodeBuilder {
    #[must_use]
    pub fn new(tables: CodeTables) -> Self {
        Self {
            tables,
            ..Self::default()
        }
    }

    /// Sets the source line recorded for subsequently emitted instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Emits an instruction and updates stack depth tracking.
    pub fn emit(&mut self, op: Opcode) {
        self.instructions.push(Instruction::new(op, self.current_line));
        self.adjust_stack(op.stack_effect());
    }

    /// Emits an already-built instruction, keeping its line and origin.
    pub fn emit_instruction(&mut self, instruction: Instruction) {
        self.adjust_stack(instruction.opcode.stack_effect());
        self.instructions.push(instruction);
    }

    /// Emits a forward jump, returning a label to patch later.
    ///
    /// The target operand of `op` is ignored until [`patch_jump`](Self::patch_jump).
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        let label = JumpLabel(self.instructions.len());
        self.emit(op.with_target(0));
        label
    }

    /// Points a forward jump at the next instruction to be emitted.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.current_offset();
        self.patch_jump_to(label, target);
    }

    /// Points a forward jump at an explicit target.
    pub fn patch_jump_to(&mut self, label: JumpLabel, target: u32) {
        let instruction = &mut self.instructions[label.0];
        instruction.opcode = instruction.opcode.with_target(target);
    }

    /// Emits a jump to an already-known target.
    pub fn emit_jump_to(&mut self, op: Opcode, target: u32) {
        self.emit(op.with_target(target));
    }

    /// Index of the next instruction to be emitted.
    #[must_use]
    pub fn current_offset(&self) -> u32 {
        u32::try_from(self.instructions.len()).expect("instruction count exceeds u32")
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Overrides the tracked stack depth, used after unconditional jumps where
    /// the next instruction is reached with a different depth.
    pub fn set_stack_depth(&mut self, depth: i32) {
        self.current_stack_depth = depth;
    }

    #[must_use]
    pub fn stack_depth(&self) -> i32 {
        self.current_stack_depth
    }

    #[must_use]
    pub fn max_stack_depth(&self) -> i32 {
        self.max_stack_depth
    }

    pub fn tables_mut(&mut self) -> &mut CodeTables {
        &mut self.tables
    }

    #[must_use]
    pub fn tables(&self) -> &CodeTables {
        &self.tables
    }

    pub fn add_const(&mut self, value: Const) -> u16 {
        self.tables.add_const(value)
    }

    pub fn add_name(&mut self, name: &str) -> u16 {
        self.tables.add_name(name)
    }

    pub fn add_varname(&mut self, name: &str) -> u16 {
        self.tables.add_varname(name)
    }

    /// Splits the builder into its instructions and tables.
    #[must_use]
    pub fn finish(self) -> (Vec<Instruction>, CodeTables) {
        (self.instructions, self.tables)
    }

    /// Builds an original (user-written) code unit.
    #[must_use]
    pub fn build(self, name: &str, filename: &str, first_line: u32, arg_count: usize, is_generator: bool) -> Arc<CodeUnit> {
        let mut instructions = self.instructions;
        for (offset, instruction) in instructions.iter_mut().enumerate() {
            instruction.origin = Some(u32::try_from(offset).expect("instruction count exceeds u32"));
        }
        Arc::new(CodeUnit::new(CodeParts {
            name: name.to_owned(),
            qualname: name.to_owned(),
            filename: filename.to_owned(),
            first_line,
            arg_count,
            tables: self.tables,
            instructions,
            is_generator,
            kind: CodeKind::Original,
            root: None,
        }))
    }

    fn adjust_stack(&mut self, effect: i32) {
        self.current_stack_depth += effect;
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }
}
