//! Continuations of user functions after a graph break.
//!
//! A continuation is a new code unit that takes the operand stack and the live
//! locals of the interrupted function as positional arguments, pushes the stack
//! back, and jumps into a copy of the original instructions at the resume
//! offset. Continuations are ordinary functions to the interpreter, so they are
//! intercepted and traced like any other frame.
//!
//! Arguments are laid out as `___stack0 .. ___stackN`, then the live locals
//! under their original names. Iterators cannot be passed by value; they
//! arrive as tuples of their remaining items and are turned back into
//! iterators by the prologue.

use std::sync::Arc;

use crate::{
    bytecode::{
        CodeBuilder, CodeKind, CodeParts, CodeTables, CodeUnit, Opcode, remove_dead_code, remove_pointless_jumps,
        to_operand,
    },
    error::{TraceError, TraceResult},
    state::{ResumeKey, TracerState},
};

/// Where and how a continuation picks up.
#[derive(Debug, Clone)]
pub(crate) struct ResumePoint {
    pub root: Arc<CodeUnit>,
    /// Offset into the root's instructions.
    pub offset: u32,
    pub stack_depth: usize,
    /// Live locals passed after the stack values.
    pub argnames: Vec<String>,
    /// Argument positions that hold iterators passed as tuples.
    pub iter_slots: Vec<usize>,
}

/// The continuation for `point`, synthesized once per distinct point.
pub(crate) fn continuation(state: &TracerState, point: ResumePoint) -> TraceResult<Arc<CodeUnit>> {
    let key = ResumeKey {
        root: point.root.serial(),
        offset: point.offset,
        stack_depth: point.stack_depth,
        argnames: point.argnames.clone(),
        iter_slots: point.iter_slots.clone(),
    };
    if let Some(code) = state.resume(&key) {
        return Ok(code);
    }
    let code = Arc::new(synthesize(state, &point)?);
    log::debug!(
        target: "frametrace",
        "synthesized {} resuming {} at {}\n{}",
        code.name(),
        point.root.describe(),
        point.offset,
        code.disassemble()
    );
    Ok(state.insert_resume(key, code))
}

fn synthesize(state: &TracerState, point: &ResumePoint) -> TraceResult<CodeUnit> {
    let root = &point.root;
    let offset = point.offset as usize;
    let Some(resume_at) = root.instructions().get(offset) else {
        return Err(TraceError::Internal(format!(
            "resume offset {offset} is outside {}",
            root.describe()
        )));
    };

    let mut varnames: Vec<String> = (0..point.stack_depth).map(|i| format!("___stack{i}")).collect();
    varnames.extend(point.argnames.iter().cloned());
    for name in root.varnames() {
        if !varnames.contains(name) {
            varnames.push(name.clone());
        }
    }
    let tables = CodeTables {
        varnames,
        names: root.names().to_vec(),
        consts: root.consts().to_vec(),
    };
    let remap = |slot: u16| -> TraceResult<u16> {
        root.varnames()
            .get(usize::from(slot))
            .and_then(|name| tables.varname_slot(name))
            .ok_or_else(|| TraceError::Internal(format!("local slot {slot} of {} has no name", root.describe())))
    };
    let remapped: Vec<_> = root
        .instructions()
        .iter()
        .map(|instruction| {
            let mut instruction = *instruction;
            instruction.opcode = match instruction.opcode {
                Opcode::LoadFast(slot) => Opcode::LoadFast(remap(slot)?),
                Opcode::StoreFast(slot) => Opcode::StoreFast(remap(slot)?),
                other => other,
            };
            Ok(instruction)
        })
        .collect::<TraceResult<_>>()?;

    let mut builder = CodeBuilder::new(tables);
    builder.set_line(resume_at.line);
    for i in 0..point.stack_depth {
        builder.emit(Opcode::LoadFast(to_operand(i)));
        if point.iter_slots.contains(&i) {
            builder.emit(Opcode::GetIter);
        }
    }
    for position in (point.stack_depth..point.stack_depth + point.argnames.len()).filter(|p| point.iter_slots.contains(p)) {
        let slot = to_operand(position);
        builder.emit(Opcode::LoadFast(slot));
        builder.emit(Opcode::GetIter);
        builder.emit(Opcode::StoreFast(slot));
    }
    let body_start = builder.current_offset() + 1;
    builder.emit_jump_to(Opcode::Jump(0), body_start + point.offset);
    for mut instruction in remapped {
        if let Some(target) = instruction.opcode.target() {
            instruction.opcode = instruction.opcode.with_target(target + body_start);
        }
        builder.emit_instruction(instruction);
    }
    let (instructions, tables) = builder.finish();
    let instructions = remove_pointless_jumps(remove_dead_code(instructions));

    let name = state.next_resume_name(point.offset);
    Ok(CodeUnit::new(CodeParts {
        qualname: format!("{}.{name}", root.qualname()),
        name,
        filename: root.filename().to_owned(),
        first_line: if resume_at.line == 0 { root.first_line() } else { resume_at.line },
        arg_count: point.stack_depth + point.argnames.len(),
        tables,
        instructions,
        is_generator: false,
        kind: CodeKind::Resume,
        root: Some(Arc::clone(root)),
    }))
}
