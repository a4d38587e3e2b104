//! Emits the code that replaces a traced region: one call to the compiled
//! graph, then instructions that rebuild the interpreter state the region
//! would have left behind.

use std::{rc::Rc, sync::Arc};

use ahash::{AHashMap, AHashSet};
use indexmap::IndexSet;

use super::{
    output::{CompileContext, OutputGraph},
    variables::{Var, VarKind},
};
use crate::{
    backend::CompiledGraph,
    bytecode::{CodeBuilder, Const, Opcode, to_operand},
    error::{TraceError, TraceResult},
    graph::NodeId,
    guards::Source,
    value::Value,
    vm::Builtin,
};

/// Local that holds the graph's output tuple while state is rebuilt.
const GRAPH_OUT: &str = "___graph_out";

/// What [`compile_and_restore`] produced.
#[derive(Debug, Default)]
pub(crate) struct Restored {
    pub compiled: Option<Arc<CompiledGraph>>,
    /// Graph outputs in order.
    pub outputs: Vec<NodeId>,
    /// Sources of the graph inputs in call order.
    pub inputs: Vec<Source>,
}

/// Compiles the graph and emits code that leaves `stack` on the operand stack
/// and stores each of `stores` into its local slot.
///
/// With `returning`, iterators are rebuilt as iterators; otherwise they are
/// passed on as tuples of their remaining items.
pub(crate) fn compile_and_restore(
    output: &OutputGraph,
    ctx: &CompileContext<'_>,
    builder: &mut CodeBuilder,
    stack: &[Var],
    stores: &[(u16, Var)],
    returning: bool,
) -> TraceResult<Restored> {
    let values: Vec<&Var> = stack.iter().chain(stores.iter().map(|(_, var)| var)).collect();
    check_iterator_aliases(&values)?;

    if !ctx.export
        && let Some(nodes) = direct_outputs(output, &values)
    {
        // the unpacked tuple leaves its first item on top
        let outputs: Vec<NodeId> = nodes.into_iter().rev().collect();
        let restored = emit_graph_call(output, ctx, builder, outputs)?;
        builder.emit(Opcode::UnpackSequence(to_operand(values.len())));
        for (slot, _) in stores.iter().rev() {
            builder.emit(Opcode::StoreFast(*slot));
        }
        return Ok(restored);
    }

    let mut outputs: IndexSet<NodeId> = IndexSet::new();
    for var in &values {
        var.for_each_node(&mut |node| {
            if ctx.export || !output.is_input(node) {
                outputs.insert(node);
            }
        });
    }
    let mut restored = Restored::default();
    let mut rebuild = Rebuild {
        builder,
        output,
        graph_out: None,
        out_index: AHashMap::new(),
    };
    if !outputs.is_empty() {
        let outputs: Vec<NodeId> = outputs.into_iter().collect();
        restored = emit_graph_call(output, ctx, rebuild.builder, outputs)?;
        let slot = rebuild.builder.add_varname(GRAPH_OUT);
        rebuild.builder.emit(Opcode::StoreFast(slot));
        rebuild.graph_out = Some(slot);
        rebuild.out_index = restored.outputs.iter().enumerate().map(|(i, node)| (*node, i)).collect();
    }
    for var in &values {
        rebuild.reconstruct(var, returning)?;
    }
    for (slot, _) in stores.iter().rev() {
        rebuild.builder.emit(Opcode::StoreFast(*slot));
    }
    Ok(restored)
}

/// The graph nodes of `values` when every value is a distinct non-input tensor,
/// so the output tuple can be unpacked straight onto the stack.
fn direct_outputs(output: &OutputGraph, values: &[&Var]) -> Option<Vec<NodeId>> {
    if values.is_empty() {
        return None;
    }
    let mut seen = AHashSet::new();
    values
        .iter()
        .map(|var| {
            var.as_node()
                .filter(|node| !output.is_input(*node) && !output.meta(*node).scalar && seen.insert(*node))
        })
        .collect()
}

fn check_iterator_aliases(values: &[&Var]) -> TraceResult<()> {
    fn walk(var: &Var, seen: &mut AHashSet<usize>) -> TraceResult<()> {
        match &var.kind {
            VarKind::Iter(iter) => {
                if !seen.insert(Rc::as_ptr(iter) as usize) {
                    return Err(TraceError::Unsupported("iterator referenced more than once".into()));
                }
                Ok(())
            }
            VarKind::Tuple(items) => items.iter().try_for_each(|item| walk(item, seen)),
            VarKind::ConstDict(items) => items.values().try_for_each(|item| walk(item, seen)),
            _ => Ok(()),
        }
    }
    let mut seen = AHashSet::new();
    values.iter().try_for_each(|var| walk(var, &mut seen))
}

fn emit_graph_call(
    output: &OutputGraph,
    ctx: &CompileContext<'_>,
    builder: &mut CodeBuilder,
    outputs: Vec<NodeId>,
) -> TraceResult<Restored> {
    let (compiled, inputs) = output.compile(ctx, outputs.clone())?;
    let index = builder.add_const(Const::Compiled(Arc::clone(&compiled)));
    builder.emit(Opcode::LoadConst(index));
    for source in &inputs {
        reload(builder, source);
    }
    builder.emit(Opcode::CallFunction(to_operand(inputs.len())));
    Ok(Restored {
        compiled: Some(compiled),
        outputs,
        inputs,
    })
}

/// Emits code that reads `source` from the frame as it was when it started.
pub(crate) fn reload(builder: &mut CodeBuilder, source: &Source) {
    match source {
        Source::Local { slot, .. } => builder.emit(Opcode::LoadFast(*slot)),
        Source::Global(name) => {
            let index = builder.add_name(name);
            builder.emit(Opcode::LoadGlobal(index));
        }
        Source::Attr(base, name) => {
            reload(builder, base);
            let index = builder.add_name(name);
            builder.emit(Opcode::LoadAttr(index));
        }
        Source::Index(base, index) => {
            reload(builder, base);
            load_const(builder, Const::Int(i64::try_from(*index).unwrap_or(i64::MAX)));
            builder.emit(Opcode::BinarySubscr);
        }
        Source::DictItem(base, key) => {
            reload(builder, base);
            load_const(builder, Const::Str(key.as_str().into()));
            builder.emit(Opcode::BinarySubscr);
        }
    }
}

fn load_const(builder: &mut CodeBuilder, value: Const) {
    let index = builder.add_const(value);
    builder.emit(Opcode::LoadConst(index));
}

struct Rebuild<'b, 'o> {
    builder: &'b mut CodeBuilder,
    output: &'o OutputGraph,
    graph_out: Option<u16>,
    out_index: AHashMap<NodeId, usize>,
}

impl Rebuild<'_, '_> {
    fn reconstruct(&mut self, var: &Var, returning: bool) -> TraceResult<()> {
        match &var.kind {
            VarKind::Tensor(node) => self.tensor(*node),
            VarKind::Const(Value::Range(range)) => {
                load_const(self.builder, Const::Builtin(Builtin::Range));
                for bound in [range.start, range.stop, range.step] {
                    load_const(self.builder, Const::Int(bound));
                }
                self.builder.emit(Opcode::CallFunction(3));
                Ok(())
            }
            VarKind::Const(value) => {
                let constant = value
                    .to_const()
                    .ok_or_else(|| TraceError::Internal(format!("no constant form for {}", value.type_name())))?;
                load_const(self.builder, constant);
                Ok(())
            }
            VarKind::Builtin(builtin) => {
                load_const(self.builder, Const::Builtin(*builtin));
                Ok(())
            }
            VarKind::Tuple(items) => {
                if let Some(source) = &var.source {
                    reload(self.builder, source);
                    return Ok(());
                }
                for item in items.iter() {
                    self.reconstruct(item, returning)?;
                }
                self.builder.emit(Opcode::BuildTuple(to_operand(items.len())));
                Ok(())
            }
            VarKind::ConstDict(items) => {
                for (key, item) in items.iter() {
                    load_const(self.builder, Const::Str(key.as_str().into()));
                    self.reconstruct(item, returning)?;
                }
                self.builder.emit(Opcode::BuildMap(to_operand(items.len())));
                Ok(())
            }
            VarKind::Iter(iter) => {
                let items = iter.borrow().remaining().to_vec();
                for item in &items {
                    self.reconstruct(item, returning)?;
                }
                self.builder.emit(Opcode::BuildTuple(to_operand(items.len())));
                if returning {
                    self.builder.emit(Opcode::GetIter);
                }
                Ok(())
            }
            VarKind::TensorMethod { receiver, method } => {
                self.reconstruct(receiver, returning)?;
                let index = self.builder.add_name(&method.to_string());
                self.builder.emit(Opcode::LoadAttr(index));
                Ok(())
            }
            VarKind::ExcClass(exc) => {
                match &var.source {
                    Some(source) => reload(self.builder, source),
                    None => {
                        let name: &'static str = (*exc).into();
                        let index = self.builder.add_name(name);
                        self.builder.emit(Opcode::LoadGlobal(index));
                    }
                }
                Ok(())
            }
            VarKind::Function(_) | VarKind::Object(_) | VarKind::Dict(_) => match &var.source {
                Some(source) => {
                    reload(self.builder, source);
                    Ok(())
                }
                None => Err(TraceError::Internal(format!("{} without a source", var.type_name()))),
            },
        }
    }

    fn tensor(&mut self, node: NodeId) -> TraceResult<()> {
        if let (Some(&index), Some(slot)) = (self.out_index.get(&node), self.graph_out) {
            self.builder.emit(Opcode::LoadFast(slot));
            load_const(self.builder, Const::Int(i64::try_from(index).unwrap_or(i64::MAX)));
            self.builder.emit(Opcode::BinarySubscr);
            if self.output.meta(node).scalar {
                let item = self.builder.add_name("item");
                self.builder.emit(Opcode::LoadAttr(item));
                self.builder.emit(Opcode::CallFunction(0));
            }
            return Ok(());
        }
        let input = self
            .output
            .input(node)
            .ok_or_else(|| TraceError::Internal(format!("tensor {} is neither an input nor an output", node.index())))?;
        reload(self.builder, &input.source);
        Ok(())
    }
}
