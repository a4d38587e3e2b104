//! Passes over instruction sequences: dead-code elimination, jump cleanup and
//! local-variable liveness.

use std::collections::BTreeSet;

use super::op::{Instruction, Opcode};

/// Removes instructions that cannot be reached from the entry point.
#[must_use]
pub fn remove_dead_code(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let mut reachable = vec![false; instructions.len()];
    let mut pending = vec![0usize];
    while let Some(start) = pending.pop() {
        let mut index = start;
        while index < instructions.len() && !reachable[index] {
            reachable[index] = true;
            let opcode = instructions[index].opcode;
            if let Some(target) = opcode.target() {
                pending.push(target as usize);
            }
            if opcode.is_terminal() {
                break;
            }
            index += 1;
        }
    }
    retain(instructions, &reachable)
}

/// Removes unconditional jumps to the instruction that follows them.
#[must_use]
pub fn remove_pointless_jumps(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let keep: Vec<bool> = instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| instruction.opcode != Opcode::Jump(index as u32 + 1))
        .collect();
    retain(instructions, &keep)
}

/// Removes pushes that are immediately discarded.
#[must_use]
pub fn remove_load_pop_pairs(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let targets: BTreeSet<u32> = instructions.iter().filter_map(|i| i.opcode.target()).collect();
    let mut keep = vec![true; instructions.len()];
    let mut index = 0;
    while index + 1 < instructions.len() {
        let pushes_only = matches!(instructions[index].opcode, Opcode::LoadConst(_) | Opcode::DupTop);
        let next = index as u32 + 1;
        if pushes_only && instructions[index + 1].opcode == Opcode::PopTop && !targets.contains(&next) {
            keep[index] = false;
            keep[index + 1] = false;
            index += 2;
        } else {
            index += 1;
        }
    }
    retain(instructions, &keep)
}

/// Drops instructions whose `keep` flag is false and retargets jumps.
///
/// A jump to a removed instruction lands on the next kept one.
fn retain(instructions: Vec<Instruction>, keep: &[bool]) -> Vec<Instruction> {
    let mut next_kept = vec![0u32; instructions.len() + 1];
    let kept_total = keep.iter().filter(|k| **k).count() as u32;
    next_kept[instructions.len()] = kept_total;
    let mut position = kept_total;
    for index in (0..instructions.len()).rev() {
        if keep[index] {
            position -= 1;
        }
        next_kept[index] = position;
    }
    instructions
        .into_iter()
        .zip(keep)
        .filter(|(_, keep)| **keep)
        .map(|(mut instruction, _)| {
            if let Some(target) = instruction.opcode.target() {
                instruction.opcode = instruction.opcode.with_target(next_kept[target as usize]);
            }
            instruction
        })
        .collect()
}

/// Local slots that may be read before being written on some path starting at `start`.
///
/// Reads on the first straight-line path are only counted when not preceded by
/// a write on that path; once control branches the analysis becomes
/// conservative and every read counts unless it is preceded by a write on the
/// straight-line prefix.
#[must_use]
pub fn live_locals(instructions: &[Instruction], start: usize) -> BTreeSet<u16> {
    struct Walk {
        reads: BTreeSet<u16>,
        writes: BTreeSet<u16>,
        visited: BTreeSet<usize>,
    }

    fn walk(instructions: &[Instruction], must: &mut Walk, may: &mut Walk, start: usize, on_must: bool) {
        let state = if on_must { &mut *must } else { &mut *may };
        if !state.visited.insert(start) {
            return;
        }
        let mut index = start;
        let mut on_must = on_must;
        while index < instructions.len() {
            let opcode = instructions[index].opcode;
            let must_writes = must.writes.clone();
            let state = if on_must { &mut *must } else { &mut *may };
            if let Some(slot) = opcode.reads_local()
                && !must_writes.contains(&slot)
            {
                state.reads.insert(slot);
            }
            if let Some(slot) = opcode.writes_local() {
                state.writes.insert(slot);
            }
            if let Some(target) = opcode.target() {
                walk(instructions, must, may, target as usize, false);
                on_must = false;
            }
            if opcode.is_terminal() {
                return;
            }
            index += 1;
        }
    }

    let mut must = Walk {
        reads: BTreeSet::new(),
        writes: BTreeSet::new(),
        visited: BTreeSet::new(),
    };
    let mut may = Walk {
        reads: BTreeSet::new(),
        writes: BTreeSet::new(),
        visited: BTreeSet::new(),
    };
    walk(instructions, &mut must, &mut may, start, true);
    must.reads.union(&may.reads).copied().collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn seq(ops: &[Opcode]) -> Vec<Instruction> {
        ops.iter().map(|op| Instruction::new(*op, 1)).collect()
    }

    fn ops(instructions: &[Instruction]) -> Vec<Opcode> {
        instructions.iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn dead_code_after_return_is_removed() {
        let code = seq(&[
            Opcode::Jump(3),
            Opcode::LoadConst(0),
            Opcode::PopTop,
            Opcode::LoadFast(0),
            Opcode::ReturnValue,
            Opcode::LoadConst(1),
        ]);
        assert_eq!(
            ops(&remove_dead_code(code)),
            vec![Opcode::Jump(1), Opcode::LoadFast(0), Opcode::ReturnValue]
        );
    }

    #[test]
    fn branches_keep_both_targets() {
        let code = seq(&[
            Opcode::LoadFast(0),
            Opcode::PopJumpIfFalse(4),
            Opcode::LoadConst(0),
            Opcode::ReturnValue,
            Opcode::LoadConst(1),
            Opcode::ReturnValue,
        ]);
        assert_eq!(remove_dead_code(code.clone()), code);
    }

    #[test]
    fn pointless_jumps_and_pairs() {
        let code = seq(&[
            Opcode::LoadConst(0),
            Opcode::PopTop,
            Opcode::Jump(3),
            Opcode::LoadFast(0),
            Opcode::ReturnValue,
        ]);
        let cleaned = remove_pointless_jumps(remove_load_pop_pairs(code));
        assert_eq!(ops(&cleaned), vec![Opcode::LoadFast(0), Opcode::ReturnValue]);
    }

    #[test]
    fn liveness_respects_writes() {
        // x = a; return x + b
        let code = seq(&[
            Opcode::LoadFast(0),
            Opcode::StoreFast(2),
            Opcode::LoadFast(2),
            Opcode::LoadFast(1),
            Opcode::BinaryOp(crate::bytecode::BinOp::Add),
            Opcode::ReturnValue,
        ]);
        assert_eq!(live_locals(&code, 0), BTreeSet::from([0, 1]));
        assert_eq!(live_locals(&code, 2), BTreeSet::from([1, 2]));
    }

    #[test]
    fn liveness_follows_branches() {
        // if c: return a  else: return b
        let code = seq(&[
            Opcode::LoadFast(0),
            Opcode::PopJumpIfFalse(4),
            Opcode::LoadFast(1),
            Opcode::ReturnValue,
            Opcode::LoadFast(2),
            Opcode::ReturnValue,
        ]);
        assert_eq!(live_locals(&code, 0), BTreeSet::from([0, 1, 2]));
    }
}
