//! Symbolic execution of one frame.
//!
//! The translator steps through a code unit the way the interpreter would, but
//! over [`Var`]s: tensor operations become graph nodes, known values are
//! folded and user functions are inlined. It stops at the first return or at
//! the first instruction it cannot model, and emits the code that replaces the
//! traced region.

use std::{collections::BTreeSet, rc::Rc, slice, sync::Arc};

use indexmap::IndexMap;

use super::{
    ExportCapture, TraceRequest, Traced,
    codegen::compile_and_restore,
    output::{CompileContext, OutputGraph},
    resume::{ResumePoint, continuation},
    tree_spec,
    variables::{Var, VarKind},
};
use crate::{
    backend::CompiledGraph,
    bytecode::{
        BinOp, CmpOp, CodeBuilder, CodeKind, CodeParts, CodeUnit, Const, Instruction, Opcode, live_locals,
        remove_dead_code, remove_pointless_jumps, to_operand,
    },
    error::{RunError, TraceError, TraceResult},
    graph::{Arg, NodeId, Op},
    guards::{GuardKind, Source},
    io::NoPrint,
    state::Event,
    tensor::Scalar,
    tracer::NoopTracer,
    value::{Function, Value},
    vm::{
        Builtin, TensorMethod, Vm, binary_op, compare_op, get_attr, lookup_global, repeated_len, shape_args,
        subscript, tensor_from_value, unary_negative,
    },
};

/// Why tracing stopped before a return.
#[derive(Debug)]
struct GraphBreak {
    reason: String,
    kind: BreakKind,
    /// The operand stack before the breaking instruction.
    stack: Vec<Var>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakKind {
    /// The instruction itself runs in the interpreter.
    Generic,
    /// A conditional jump on a tensor. Both targets get a continuation.
    Jump,
}

#[derive(Debug)]
enum Flow {
    Return(Var),
    Break(GraphBreak),
}

#[derive(Debug)]
enum Slot {
    Unbound,
    /// A frame argument not read yet.
    Input(Value),
    Var {
        var: Var,
        /// Assigned while tracing, so the interpreter does not hold it.
        changed: bool,
    },
}

#[derive(Debug)]
struct SymFrame {
    code: Arc<CodeUnit>,
    locals: Vec<Slot>,
    stack: Vec<Var>,
    /// Open `try` blocks.
    blocks: usize,
    ip: usize,
    /// 0 for the frame being converted, +1 per inlined call.
    depth: usize,
}

impl SymFrame {
    fn underflow(&self) -> TraceError {
        TraceError::Internal(format!("stack underflow in {}", self.code.describe()))
    }

    fn pop(&mut self) -> TraceResult<Var> {
        self.stack.pop().ok_or_else(|| self.underflow())
    }

    fn pop_n(&mut self, n: usize) -> TraceResult<Vec<Var>> {
        let at = self.stack.len().checked_sub(n).ok_or_else(|| self.underflow())?;
        Ok(self.stack.split_off(at))
    }

    /// The value `n` slots below the top.
    fn peek(&self, n: usize) -> TraceResult<&Var> {
        self.stack
            .len()
            .checked_sub(n + 1)
            .and_then(|i| self.stack.get(i))
            .ok_or_else(|| self.underflow())
    }

    /// Moves the top of the stack down to position `n`.
    fn rotate(&mut self, n: usize) -> TraceResult<()> {
        if n <= 1 {
            return Ok(());
        }
        let len = self.stack.len();
        if len < n {
            return Err(self.underflow());
        }
        let top = self.pop()?;
        self.stack.insert(len - n, top);
        Ok(())
    }

    fn current(&self) -> TraceResult<Instruction> {
        self.code.instructions().get(self.ip).copied().ok_or_else(|| {
            TraceError::Internal(format!("offset {} is outside {}", self.ip, self.code.describe()))
        })
    }
}

/// Outcome of a call the translator looked at.
enum Called {
    Value(Var),
    /// The call must run in the interpreter.
    Break(String),
}

/// A local the continuation reads, and its value when the interpreter does
/// not already hold it.
#[derive(Debug)]
struct LiveLocal {
    name: String,
    slot: u16,
    changed: Option<Var>,
}

fn generic_break(frame: &SymFrame, reason: impl Into<String>) -> Flow {
    Flow::Break(GraphBreak {
        reason: reason.into(),
        kind: BreakKind::Generic,
        stack: frame.stack.clone(),
    })
}

fn unsupported<T>(reason: impl Into<String>) -> TraceResult<T> {
    Err(TraceError::Unsupported(reason.into()))
}

/// `items * count` for a tuple holding graph values. Anything but a known int
/// count breaks, so the interpreter raises the real error.
fn repeat_tuple(items: &[Var], count: &Var) -> TraceResult<Var> {
    let Some(count) = count.as_int() else {
        return unsupported(format!("can't multiply a tuple by '{}'", count.type_name()));
    };
    let len = repeated_len(items.len(), count).map_err(host_error)?;
    Ok(Var::tuple(items.iter().cloned().cycle().take(len).collect()))
}

/// A host error raised while folding known values.
fn host_error(err: RunError) -> TraceError {
    match err {
        RunError::Exc(exc) => TraceError::DataDependent(format!("raises {exc}")),
        RunError::Trace(err) => err,
    }
}

fn known(value: Value) -> TraceResult<Var> {
    let type_name = value.type_name();
    Var::from_value(value).ok_or_else(|| TraceError::Unsupported(format!("cannot trace a {type_name} result")))
}

fn exact_args<const N: usize>(builtin: Builtin, args: Vec<Var>) -> TraceResult<[Var; N]> {
    let count = args.len();
    args.try_into()
        .map_err(|_| TraceError::Unsupported(format!("{builtin}() takes {N} arguments ({count} given)")))
}

fn known_values(args: &[Var]) -> TraceResult<Vec<Value>> {
    args.iter()
        .map(|arg| {
            arg.as_value()
                .ok_or_else(|| TraceError::Unsupported(format!("argument of type {} is not known", arg.type_name())))
        })
        .collect()
}

/// Operands `opcode` takes off the stack before it runs.
fn operand_count(opcode: Opcode) -> usize {
    match opcode {
        Opcode::CallFunction(n) => usize::from(n) + 1,
        Opcode::CallFunctionEx(n) => usize::from(n) + 2,
        Opcode::StoreAttr(_) | Opcode::CompareOp(_) => 2,
        Opcode::UnaryNot => 1,
        _ => 0,
    }
}

fn code_at(code: &CodeUnit, index: u16) -> TraceResult<&str> {
    code.names()
        .get(usize::from(index))
        .map(String::as_str)
        .ok_or_else(|| TraceError::Internal(format!("name {index} is outside {}", code.describe())))
}

pub(super) struct Translator<'t, 'r> {
    req: &'t TraceRequest<'r>,
    /// Offsets of calls that must break instead of being inlined. Filled by
    /// failed attempts and kept across restarts.
    hints: &'t mut BTreeSet<usize>,
    output: OutputGraph,
    steps: usize,
}

impl<'t, 'r> Translator<'t, 'r> {
    pub fn new(req: &'t TraceRequest<'r>, hints: &'t mut BTreeSet<usize>) -> Self {
        Self {
            output: OutputGraph::new(req.config.dynamic_shapes),
            req,
            hints,
            steps: 0,
        }
    }

    /// Traces the captured frame to its end.
    pub fn run(mut self) -> TraceResult<Traced> {
        let frame = self.req.frame;
        let code = Arc::clone(frame.code());
        let mut locals: Vec<Slot> = frame
            .locals()
            .iter()
            .map(|value| value.as_ref().map_or(Slot::Unbound, |value| Slot::Input(value.clone())))
            .collect();
        locals.resize_with(code.varnames().len(), || Slot::Unbound);
        let mut root = SymFrame {
            code,
            locals,
            stack: Vec::new(),
            blocks: 0,
            ip: 0,
            depth: 0,
        };
        loop {
            match self.step(&mut root)? {
                None => {}
                Some(Flow::Return(var)) => return self.finish_return(&root, var),
                Some(Flow::Break(brk)) => return self.finish_break(&root, brk),
            }
        }
    }

    fn can_break(&self, frame: &SymFrame) -> bool {
        frame.depth == 0 && frame.blocks == 0 && !self.req.one_graph
    }

    fn compile_context(&self) -> CompileContext<'_> {
        CompileContext {
            state: self.req.state,
            backend: self.req.backend,
            verify: self.req.config.verify_correctness,
            export: self.req.export,
        }
    }

    fn step(&mut self, frame: &mut SymFrame) -> TraceResult<Option<Flow>> {
        self.steps += 1;
        if self.steps > self.req.config.max_trace_instructions {
            return unsupported(format!(
                "more than {} instructions traced",
                self.req.config.max_trace_instructions
            ));
        }
        let code = Arc::clone(&frame.code);
        let instruction = frame.current()?;
        log::trace!(
            target: "frametrace",
            "{}{:>4} {:?} stack={}",
            "  ".repeat(frame.depth),
            frame.ip,
            instruction.opcode,
            frame.stack.len()
        );
        let mut next = frame.ip + 1;
        match instruction.opcode {
            Opcode::Nop => {}
            Opcode::LoadConst(index) => {
                let var = load_const(&code, index)?;
                frame.stack.push(var);
            }
            Opcode::LoadFast(slot) => {
                let var = self.load_local(frame, slot)?;
                frame.stack.push(var);
            }
            Opcode::StoreFast(slot) => {
                let var = frame.pop()?;
                let Some(entry) = frame.locals.get_mut(usize::from(slot)) else {
                    return Err(TraceError::Internal(format!("local slot {slot} is outside {}", code.describe())));
                };
                *entry = Slot::Var { var, changed: true };
            }
            Opcode::LoadGlobal(index) => {
                let var = self.load_global(code_at(&code, index)?)?;
                frame.stack.push(var);
            }
            Opcode::StoreGlobal(_) => return unsupported("assignment to a global"),
            Opcode::LoadAttr(index) => {
                let object = frame.pop()?;
                let var = self.load_attr(&object, code_at(&code, index)?)?;
                frame.stack.push(var);
            }
            Opcode::StoreAttr(_) => return Ok(Some(generic_break(frame, "attribute assignment"))),
            Opcode::BinarySubscr => {
                let index = frame.pop()?;
                let container = frame.pop()?;
                let var = self.subscript(&container, &index)?;
                frame.stack.push(var);
            }
            Opcode::BinaryOp(op) => {
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                let var = self.binary(op, &lhs, &rhs)?;
                frame.stack.push(var);
            }
            Opcode::UnaryNegative => {
                let operand = frame.pop()?;
                let var = match operand.as_node() {
                    Some(node) => self.output.add_op(Op::Neg, vec![Arg::Node(node)])?,
                    None => self.fold(&operand, unary_negative)?,
                };
                frame.stack.push(var);
            }
            Opcode::UnaryNot => match frame.peek(0)?.truthy() {
                Some(truth) => {
                    frame.pop()?;
                    frame.stack.push(Var::constant(Value::Bool(!truth)));
                }
                None => return Ok(Some(generic_break(frame, "truth value of a tensor"))),
            },
            Opcode::CompareOp(op) => {
                let lhs = frame.peek(1)?.clone();
                let rhs = frame.peek(0)?.clone();
                match self.compare(op, &lhs, &rhs)? {
                    Some(var) => {
                        frame.pop_n(2)?;
                        frame.stack.push(var);
                    }
                    None => {
                        return Ok(Some(generic_break(frame, format!("`{}` between tensors", op.symbol()))));
                    }
                }
            }
            Opcode::BuildTuple(n) => {
                let items = frame.pop_n(usize::from(n))?;
                frame.stack.push(Var::tuple(items));
            }
            Opcode::BuildMap(n) => {
                let flat = frame.pop_n(2 * usize::from(n))?;
                let mut items = IndexMap::with_capacity(flat.len() / 2);
                for pair in flat.chunks_exact(2) {
                    let Some(key) = pair[0].as_str() else {
                        return unsupported("dict keys must be strings");
                    };
                    items.insert(key.to_owned(), pair[1].clone());
                }
                frame.stack.push(Var::new(VarKind::ConstDict(Rc::new(items))));
            }
            Opcode::UnpackSequence(n) => {
                let sequence = frame.pop()?;
                let items = self.unpack(&sequence)?;
                if items.len() != usize::from(n) {
                    return unsupported(format!("cannot unpack {} values into {n}", items.len()));
                }
                frame.stack.extend(items.into_iter().rev());
            }
            Opcode::CallFunction(argc) => return self.call_instruction(frame, usize::from(argc), false),
            Opcode::CallFunctionEx(argc) => return self.call_instruction(frame, usize::from(argc), true),
            Opcode::MakeFunction => return unsupported("nested function definition"),
            Opcode::ReturnValue => {
                let value = frame.pop()?;
                return Ok(Some(Flow::Return(value)));
            }
            Opcode::YieldValue => return unsupported("yield"),
            Opcode::PopTop => {
                frame.pop()?;
            }
            Opcode::DupTop => {
                let top = frame.peek(0)?.clone();
                frame.stack.push(top);
            }
            Opcode::RotTwo => frame.rotate(2)?,
            Opcode::RotThree => frame.rotate(3)?,
            Opcode::RotN(n) => frame.rotate(usize::from(n))?,
            Opcode::Jump(target) => next = target as usize,
            Opcode::PopJumpIfFalse(target) | Opcode::PopJumpIfTrue(target) => {
                let Some(truth) = frame.peek(0)?.truthy() else {
                    return Ok(Some(jump_break(frame)));
                };
                frame.pop()?;
                if truth == matches!(instruction.opcode, Opcode::PopJumpIfTrue(_)) {
                    next = target as usize;
                }
            }
            Opcode::JumpIfFalseOrPop(target) | Opcode::JumpIfTrueOrPop(target) => {
                let Some(truth) = frame.peek(0)?.truthy() else {
                    return Ok(Some(jump_break(frame)));
                };
                if truth == matches!(instruction.opcode, Opcode::JumpIfTrueOrPop(_)) {
                    next = target as usize;
                } else {
                    frame.pop()?;
                }
            }
            Opcode::GetIter => {
                let iterable = frame.pop()?;
                let var = self.get_iter(&iterable)?;
                frame.stack.push(var);
            }
            Opcode::ForIter(target) => {
                let VarKind::Iter(iter) = &frame.peek(0)?.kind else {
                    return unsupported("for loop over a value that is not an iterator");
                };
                let iter = Rc::clone(iter);
                let item = iter.borrow_mut().next_item();
                match item {
                    Some(item) => frame.stack.push(item),
                    None => {
                        frame.pop()?;
                        next = target as usize;
                    }
                }
            }
            Opcode::SetupExcept(_) => frame.blocks += 1,
            Opcode::PopBlock => frame.blocks = frame.blocks.saturating_sub(1),
            Opcode::Raise | Opcode::Reraise => return unsupported("raise"),
        }
        frame.ip = next;
        Ok(None)
    }

    // loads

    fn load_local(&mut self, frame: &mut SymFrame, slot: u16) -> TraceResult<Var> {
        let index = usize::from(slot);
        let name = frame.code.varnames().get(index).cloned().unwrap_or_default();
        match frame.locals.get(index) {
            Some(Slot::Var { var, .. }) => Ok(var.clone()),
            Some(Slot::Input(value)) => {
                let value = value.clone();
                let var = self.output.wrap(&value, Source::local(&name, slot))?;
                frame.locals[index] = Slot::Var {
                    var: var.clone(),
                    changed: false,
                };
                Ok(var)
            }
            Some(Slot::Unbound) | None => unsupported(format!("local '{name}' referenced before assignment")),
        }
    }

    fn load_global(&mut self, name: &str) -> TraceResult<Var> {
        let Some(value) = lookup_global(self.req.frame.globals(), name) else {
            return unsupported(format!("name '{name}' is not defined"));
        };
        self.output.wrap(&value, Source::Global(name.to_owned()))
    }

    fn load_attr(&mut self, object: &Var, name: &str) -> TraceResult<Var> {
        match &object.kind {
            VarKind::Object(obj) => {
                let Some(source) = &object.source else {
                    return unsupported(format!("attribute '{name}' of a namespace created while tracing"));
                };
                let Some(value) = obj.get_attr(name) else {
                    return unsupported(format!("namespace has no attribute '{name}'"));
                };
                self.output.guard(source.clone(), GuardKind::HasAttr(name.to_owned()));
                self.output.wrap(&value, source.attr(name))
            }
            VarKind::Tensor(node) => self.tensor_attr(object, *node, name),
            _ => self.fold(object, |value| get_attr(value, name)),
        }
    }

    fn tensor_attr(&mut self, tensor: &Var, node: NodeId, name: &str) -> TraceResult<Var> {
        let meta = self.output.meta(node).clone();
        if meta.scalar {
            return unsupported(format!("attribute '{name}' of a number produced by the graph"));
        }
        let int = |n: usize| Var::constant(Value::Int(i64::try_from(n).unwrap_or(i64::MAX)));
        match name {
            "shape" => {
                self.output.mark_size_read(node);
                Ok(Var::tuple(meta.shape.iter().map(|dim| int(*dim)).collect()))
            }
            "ndim" => Ok(int(meta.shape.len())),
            "dtype" => Ok(Var::constant(Value::str(&meta.dtype.to_string()))),
            other => match other.parse::<TensorMethod>() {
                Ok(method) => Ok(Var::new(VarKind::TensorMethod {
                    receiver: Box::new(tensor.clone()),
                    method,
                })),
                Err(_) => unsupported(format!("'Tensor' object has no attribute '{other}'")),
            },
        }
    }

    // operators

    /// Applies a host operation to a value known while tracing.
    fn fold(&self, operand: &Var, op: impl FnOnce(&Value) -> Result<Value, RunError>) -> TraceResult<Var> {
        let Some(value) = operand.as_value() else {
            return unsupported(format!("operation on a {} that depends on the graph", operand.type_name()));
        };
        known(op(&value).map_err(host_error)?)
    }

    fn fold2(
        &self,
        lhs: &Var,
        rhs: &Var,
        op: impl FnOnce(&Value, &Value) -> Result<Value, RunError>,
    ) -> TraceResult<Var> {
        let (Some(a), Some(b)) = (lhs.as_value(), rhs.as_value()) else {
            return unsupported(format!(
                "operation between {} and {} that depends on the graph",
                lhs.type_name(),
                rhs.type_name()
            ));
        };
        known(op(&a, &b).map_err(host_error)?)
    }

    fn subscript(&mut self, container: &Var, index: &Var) -> TraceResult<Var> {
        match &container.kind {
            VarKind::Tuple(items) => match index.as_int() {
                Some(i) => {
                    let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                    let at = if i < 0 { i + len } else { i };
                    usize::try_from(at)
                        .ok()
                        .and_then(|at| items.get(at))
                        .cloned()
                        .ok_or_else(|| TraceError::DataDependent("tuple index out of range".to_owned()))
                }
                None => self.fold2(container, index, subscript),
            },
            VarKind::Tensor(node) => {
                let Some(i) = index.as_int() else {
                    return unsupported(format!("tensor indexed by a {}", index.type_name()));
                };
                if self.output.meta(*node).scalar {
                    return unsupported("indexing a number produced by the graph");
                }
                self.output.mark_size_read(*node);
                self.output.add_op(Op::Select(i), vec![Arg::Node(*node)])
            }
            VarKind::Dict(dict) => {
                let Some(key) = index.as_str() else {
                    return unsupported("dict keys must be strings");
                };
                let (Some(value), Some(source)) = (dict.get(key), &container.source) else {
                    return unsupported(format!("dict item '{key}'"));
                };
                let value = value.clone();
                self.output.wrap(&value, source.dict_item(key))
            }
            VarKind::ConstDict(items) => index
                .as_str()
                .and_then(|key| items.get(key))
                .cloned()
                .ok_or_else(|| TraceError::Unsupported("dict item lookup".to_owned())),
            _ => self.fold2(container, index, subscript),
        }
    }

    fn binary(&mut self, op: BinOp, lhs: &Var, rhs: &Var) -> TraceResult<Var> {
        if lhs.as_node().is_some() || rhs.as_node().is_some() {
            let (Some(a), Some(b)) = (OutputGraph::operand(lhs), OutputGraph::operand(rhs)) else {
                return unsupported(format!(
                    "unsupported operand types for {}: '{}' and '{}'",
                    op.symbol(),
                    lhs.type_name(),
                    rhs.type_name()
                ));
            };
            return self.output.add_op(Op::Binary(op), vec![a, b]);
        }
        match (op, &lhs.kind, &rhs.kind) {
            (BinOp::Add, VarKind::Tuple(a), VarKind::Tuple(b)) => Ok(Var::tuple(a.iter().chain(b.iter()).cloned().collect())),
            (BinOp::Mul, VarKind::Tuple(items), _) if lhs.as_value().is_none() => repeat_tuple(items, rhs),
            (BinOp::Mul, _, VarKind::Tuple(items)) if rhs.as_value().is_none() => repeat_tuple(items, lhs),
            _ => self.fold2(lhs, rhs, |a, b| binary_op(op, a, b)),
        }
    }

    /// `None` when the result depends on tensor identity the tracer cannot see.
    fn compare(&mut self, op: CmpOp, lhs: &Var, rhs: &Var) -> TraceResult<Option<Var>> {
        if op == CmpOp::ExcMatch {
            return unsupported("exception matching");
        }
        if lhs.as_node().is_some() || rhs.as_node().is_some() {
            if op.is_rich() {
                let (Some(a), Some(b)) = (OutputGraph::operand(lhs), OutputGraph::operand(rhs)) else {
                    return unsupported(format!(
                        "'{}' not supported between '{}' and '{}'",
                        op.symbol(),
                        lhs.type_name(),
                        rhs.type_name()
                    ));
                };
                return self.output.add_op(Op::Compare(op), vec![a, b]).map(Some);
            }
            let same = match (lhs.as_node(), rhs.as_node()) {
                (Some(a), Some(b)) if a == b => Some(true),
                // two frame inputs may be the same tensor
                (Some(a), Some(b)) if self.output.is_input(a) && self.output.is_input(b) => None,
                _ => Some(false),
            };
            return Ok(match (op, same) {
                (CmpOp::Is, Some(same)) => Some(Var::constant(Value::Bool(same))),
                (CmpOp::IsNot, Some(same)) => Some(Var::constant(Value::Bool(!same))),
                _ => None,
            });
        }
        if matches!(op, CmpOp::Is | CmpOp::IsNot) && (lhs.as_value().is_none() || rhs.as_value().is_none()) {
            // a container built while tracing is never identical to a known value
            let one_known = matches!(lhs.kind, VarKind::Const(_)) || matches!(rhs.kind, VarKind::Const(_));
            if one_known {
                return Ok(Some(Var::constant(Value::Bool(op == CmpOp::IsNot))));
            }
        }
        self.fold2(lhs, rhs, |a, b| compare_op(op, a, b)).map(Some)
    }

    // iteration

    /// Every item of an iterable, consuming it if it is an iterator.
    fn unpack(&mut self, iterable: &Var) -> TraceResult<Vec<Var>> {
        match &iterable.kind {
            VarKind::Tuple(items) => Ok(items.to_vec()),
            VarKind::Iter(iter) => Ok(iter.borrow_mut().drain()),
            VarKind::Tensor(node) => self.tensor_rows(*node),
            VarKind::ConstDict(items) => Ok(items.keys().map(|key| Var::constant(Value::str(key))).collect()),
            VarKind::Dict(dict) => Ok(dict.items().keys().map(|key| Var::constant(Value::str(key))).collect()),
            VarKind::Const(Value::Range(range)) => Ok((0..range.len())
                .filter_map(|i| range.get(i))
                .map(|i| Var::constant(Value::Int(i)))
                .collect()),
            VarKind::Const(Value::Str(s)) => Ok(s
                .chars()
                .map(|c| Var::constant(Value::str(c.encode_utf8(&mut [0; 4]))))
                .collect()),
            _ => unsupported(format!("'{}' object is not iterable", iterable.type_name())),
        }
    }

    fn tensor_rows(&mut self, node: NodeId) -> TraceResult<Vec<Var>> {
        let meta = self.output.meta(node).clone();
        let Some(&rows) = meta.shape.first().filter(|_| !meta.scalar) else {
            return unsupported("iteration over a 0-d tensor");
        };
        self.output.mark_size_read(node);
        (0..rows)
            .map(|row| {
                let row = i64::try_from(row).unwrap_or(i64::MAX);
                self.output.add_op(Op::Select(row), vec![Arg::Node(node)])
            })
            .collect()
    }

    fn get_iter(&mut self, iterable: &Var) -> TraceResult<Var> {
        if matches!(iterable.kind, VarKind::Iter(_)) {
            return Ok(iterable.clone());
        }
        Ok(Var::iter(self.unpack(iterable)?))
    }

    // calls

    fn call_instruction(&mut self, frame: &mut SymFrame, argc: usize, splat: bool) -> TraceResult<Option<Flow>> {
        let operands = argc + 1 + usize::from(splat);
        let base = frame.stack.len().checked_sub(operands).ok_or_else(|| frame.underflow())?;
        let callee = frame.stack[base].clone();
        let mut args = frame.stack[base + 1..base + 1 + argc].to_vec();
        if splat {
            let rest = frame.stack[base + 1 + argc].clone();
            if rest.contains_iter() {
                return unsupported("iterator unpacked into call arguments");
            }
            args.extend(self.unpack(&rest)?);
        }
        if frame.depth == 0 && self.hints.contains(&frame.ip) {
            return Ok(Some(generic_break(frame, format!("call to {} cannot be inlined", describe(&callee)))));
        }
        match self.call(frame.depth, &callee, args) {
            Ok(Called::Value(result)) => {
                frame.stack.truncate(base);
                frame.stack.push(result);
                frame.ip += 1;
                Ok(None)
            }
            Ok(Called::Break(reason)) => Ok(Some(generic_break(frame, reason))),
            Err(TraceError::Unsupported(reason) | TraceError::DataDependent(reason))
                if self.can_break(frame) && matches!(callee.kind, VarKind::Function(_)) =>
            {
                self.hints.insert(frame.ip);
                Err(TraceError::RestartAnalysis(format!(
                    "inlining {} failed ({reason}), breaking at offset {} instead",
                    describe(&callee),
                    frame.ip
                )))
            }
            Err(err) => Err(err),
        }
    }

    fn call(&mut self, depth: usize, callee: &Var, args: Vec<Var>) -> TraceResult<Called> {
        match &callee.kind {
            VarKind::Function(func) => self.inline(depth, func, args),
            VarKind::Builtin(builtin) => self.call_builtin(*builtin, args),
            VarKind::TensorMethod { receiver, method } => self.call_tensor_method(receiver, *method, &args),
            VarKind::ExcClass(exc) => Ok(Called::Break(format!("construction of {exc}"))),
            _ => unsupported(format!("'{}' object is not callable", callee.type_name())),
        }
    }

    fn inline(&mut self, depth: usize, func: &Rc<Function>, args: Vec<Var>) -> TraceResult<Called> {
        let code = Arc::clone(func.code());
        if code.is_generator() {
            return Ok(Called::Break(format!("call to generator {}", code.describe())));
        }
        if self.req.state.is_skipped(&code) {
            return Ok(Called::Break(format!("call to skipped {}", code.describe())));
        }
        if !Rc::ptr_eq(func.globals(), self.req.frame.globals()) {
            return unsupported(format!("{} belongs to another module", code.describe()));
        }
        if depth >= self.req.config.max_inline_depth {
            return unsupported(format!("inlining deeper than {} calls", self.req.config.max_inline_depth));
        }
        if args.len() != code.arg_count() {
            return unsupported(format!(
                "{}() takes {} arguments ({} given)",
                code.name(),
                code.arg_count(),
                args.len()
            ));
        }
        log::debug!(target: "frametrace", "inlining {} at depth {}", code.describe(), depth + 1);
        let mut locals: Vec<Slot> = args.into_iter().map(|var| Slot::Var { var, changed: true }).collect();
        locals.resize_with(code.varnames().len(), || Slot::Unbound);
        let mut callee = SymFrame {
            code,
            locals,
            stack: Vec::new(),
            blocks: 0,
            ip: 0,
            depth: depth + 1,
        };
        loop {
            match self.step(&mut callee)? {
                None => {}
                Some(Flow::Return(var)) => return Ok(Called::Value(var)),
                Some(Flow::Break(brk)) => {
                    return unsupported(format!("{} inside {}", brk.reason, callee.code.describe()));
                }
            }
        }
    }

    fn call_builtin(&mut self, builtin: Builtin, args: Vec<Var>) -> TraceResult<Called> {
        let var = match builtin {
            Builtin::Len => {
                let [arg] = exact_args(builtin, args)?;
                match &arg.kind {
                    VarKind::Tensor(node) => {
                        let meta = self.output.meta(*node).clone();
                        let Some(&len) = meta.shape.first().filter(|_| !meta.scalar) else {
                            return unsupported("len() of a 0-d tensor");
                        };
                        self.output.mark_size_read(*node);
                        Var::constant(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
                    }
                    VarKind::Tuple(items) => Var::constant(Value::Int(i64::try_from(items.len()).unwrap_or(i64::MAX))),
                    VarKind::ConstDict(items) => {
                        Var::constant(Value::Int(i64::try_from(items.len()).unwrap_or(i64::MAX)))
                    }
                    _ => self.fold_builtin(builtin, slice::from_ref(&arg))?,
                }
            }
            Builtin::Range => self.fold_builtin(builtin, &args)?,
            Builtin::Iter => {
                let [arg] = exact_args(builtin, args)?;
                self.get_iter(&arg)?
            }
            Builtin::Next => {
                let [arg] = exact_args(builtin, args)?;
                let VarKind::Iter(iter) = &arg.kind else {
                    return unsupported(format!("'{}' object is not an iterator", arg.type_name()));
                };
                let item = iter.borrow_mut().next_item();
                match item {
                    Some(item) => item,
                    None => return unsupported("next() on an exhausted iterator"),
                }
            }
            Builtin::Tuple => {
                if args.is_empty() {
                    Var::tuple(Vec::new())
                } else {
                    let [arg] = exact_args(builtin, args)?;
                    match arg.kind {
                        VarKind::Tuple(_) => arg,
                        _ => Var::tuple(self.unpack(&arg)?),
                    }
                }
            }
            Builtin::Abs | Builtin::Relu => {
                let [arg] = exact_args(builtin, args)?;
                match arg.as_node() {
                    Some(node) if builtin == Builtin::Abs => self.output.add_op(Op::Abs, vec![Arg::Node(node)])?,
                    Some(node) if !self.output.meta(node).scalar => {
                        self.output.add_op(Op::Relu, vec![Arg::Node(node)])?
                    }
                    _ => self.fold_builtin(builtin, slice::from_ref(&arg))?,
                }
            }
            Builtin::Ones | Builtin::Zeros => {
                let shape = shape_args(&known_values(&args)?).map_err(host_error)?;
                let fill = Scalar::Float(if builtin == Builtin::Ones { 1.0 } else { 0.0 });
                self.output.add_op(Op::Full { shape, fill }, Vec::new())?
            }
            Builtin::Full => {
                let [shape, fill] = exact_args(builtin, args)?;
                let shape = shape_args(&known_values(slice::from_ref(&shape))?).map_err(host_error)?;
                let Some(fill) = fill.as_value().and_then(|value| value.as_scalar()) else {
                    return unsupported("full() fill value must be a known number");
                };
                self.output.add_op(Op::Full { shape, fill }, Vec::new())?
            }
            Builtin::Arange => {
                let [end] = exact_args(builtin, args)?;
                let Some(end) = end.as_int().and_then(|n| usize::try_from(n).ok()) else {
                    return unsupported("arange() end must be a known non-negative integer");
                };
                self.output.add_op(Op::Arange(end), Vec::new())?
            }
            Builtin::Tensor => {
                let [data] = exact_args(builtin, args)?;
                let Some(data) = data.as_value() else {
                    return Ok(Called::Break("tensor() of values computed by the graph".to_owned()));
                };
                let tensor = tensor_from_value(&data).map_err(host_error)?;
                self.output.add_op(Op::Constant(tensor), Vec::new())?
            }
            Builtin::Print
            | Builtin::Unsupported
            | Builtin::Randn
            | Builtin::ManualSeed
            | Builtin::TraceCalls
            | Builtin::Namespace => return Ok(Called::Break(format!("call to {builtin}()"))),
        };
        Ok(Called::Value(var))
    }

    /// Runs a side-effect free builtin on known arguments.
    fn fold_builtin(&self, builtin: Builtin, args: &[Var]) -> TraceResult<Var> {
        let values = known_values(args)?;
        let mut print = NoPrint;
        let result = Vm::new(&mut print, NoopTracer)
            .call(&Value::Builtin(builtin), values)
            .map_err(host_error)?;
        known(result)
    }

    fn call_tensor_method(&mut self, receiver: &Var, method: TensorMethod, args: &[Var]) -> TraceResult<Called> {
        if !args.is_empty() {
            return unsupported(format!("Tensor.{method}() takes no arguments"));
        }
        let Some(node) = receiver.as_node() else {
            return Err(TraceError::Internal("tensor method bound to a non-tensor".to_owned()));
        };
        let op = match method {
            TensorMethod::Sum => Op::Sum,
            TensorMethod::Mean => Op::Mean,
            TensorMethod::Relu => Op::Relu,
            TensorMethod::Abs => Op::Abs,
            TensorMethod::Item if self.req.config.capture_scalar_outputs => Op::Item,
            TensorMethod::Item | TensorMethod::Tolist => {
                return Ok(Called::Break(format!("Tensor.{method}() leaves the graph")));
            }
        };
        Ok(Called::Value(self.output.add_op(op, vec![Arg::Node(node)])?))
    }

    // finishing

    fn finish_return(&self, frame: &SymFrame, value: Var) -> TraceResult<Traced> {
        if self.output.graph().op_count() == 0 && !self.req.export {
            return Err(TraceError::SkipFrame(format!(
                "{} performs no tensor operations",
                frame.code.describe()
            )));
        }
        let instruction = frame.current()?;
        let mut builder = CodeBuilder::new(frame.code.tables().clone());
        builder.set_line(instruction.line);
        let restored = compile_and_restore(
            &self.output,
            &self.compile_context(),
            &mut builder,
            slice::from_ref(&value),
            &[],
            true,
        )?;
        builder.emit(Opcode::ReturnValue);
        let export = if self.req.export {
            Some(ExportCapture {
                inputs: restored.inputs.clone(),
                out_spec: tree_spec(&value, &restored.outputs, &self.output)?,
            })
        } else {
            None
        };
        self.finish(frame, builder, restored.compiled, export)
    }

    fn finish_break(&self, frame: &SymFrame, brk: GraphBreak) -> TraceResult<Traced> {
        if !self.can_break(frame) {
            let context = if self.req.one_graph {
                "a single graph was required"
            } else {
                "inside a try block"
            };
            return unsupported(format!("{} ({context})", brk.reason));
        }
        let code = &frame.code;
        let root = code.root();
        let instruction = frame.current()?;
        let Some(origin) = instruction.origin else {
            return Err(TraceError::Internal(format!(
                "graph break on a generated instruction of {}",
                code.describe()
            )));
        };
        self.req.state.record(Event::GraphBreak);
        log::warn!(
            target: "frametrace",
            "graph break in {} at line {}: {}",
            code.describe(),
            instruction.line,
            brk.reason
        );

        let ctx = self.compile_context();
        let mut builder = CodeBuilder::new(code.tables().clone());
        builder.set_line(instruction.line);
        let depth = brk.stack.len();
        let compiled = match brk.kind {
            BreakKind::Generic => {
                let kept = depth.checked_sub(operand_count(instruction.opcode)).ok_or_else(|| frame.underflow())?;
                if brk.stack[kept..].iter().any(Var::contains_iter) {
                    return unsupported(format!("{} with an iterator operand", brk.reason));
                }
                let after = i32::try_from(depth).unwrap_or(i32::MAX) + instruction.opcode.stack_effect();
                let after = usize::try_from(after).map_err(|_| frame.underflow())?;
                let iter_stack = stack_iterators(&brk.stack[..kept])?;
                let live = live_args(frame, &root, origin + 1)?;
                let stores = stores_of([live.as_slice()]);
                let restored = compile_and_restore(&self.output, &ctx, &mut builder, &brk.stack, &stores, false)?;
                builder.emit_instruction(instruction);
                self.emit_resume_call(&mut builder, &root, origin + 1, after, &iter_stack, &live)?;
                restored.compiled
            }
            BreakKind::Jump => {
                let keeps_condition = matches!(
                    instruction.opcode,
                    Opcode::JumpIfFalseOrPop(_) | Opcode::JumpIfTrueOrPop(_)
                );
                let Some(target) = root.instructions().get(origin as usize).and_then(|i| i.opcode.target()) else {
                    return Err(TraceError::Internal(format!("jump at {origin} has no target")));
                };
                let below = depth.checked_sub(1).ok_or_else(|| frame.underflow())?;
                let iter_stack = stack_iterators(&brk.stack[..below])?;
                let fallthrough = live_args(frame, &root, origin + 1)?;
                let taken = live_args(frame, &root, target)?;
                let stores = stores_of([fallthrough.as_slice(), taken.as_slice()]);
                let restored = compile_and_restore(&self.output, &ctx, &mut builder, &brk.stack, &stores, false)?;
                let jump = builder.emit_jump(instruction.opcode);
                self.emit_resume_call(&mut builder, &root, origin + 1, below, &iter_stack, &fallthrough)?;
                builder.patch_jump(jump);
                let taken_depth = if keeps_condition { depth } else { below };
                self.emit_resume_call(&mut builder, &root, target, taken_depth, &iter_stack, &taken)?;
                restored.compiled
            }
        };
        self.finish(frame, builder, compiled, None)
    }

    /// Emits `return resume(*stack, *live)` for the continuation at `offset`.
    fn emit_resume_call(
        &self,
        builder: &mut CodeBuilder,
        root: &Arc<CodeUnit>,
        offset: u32,
        depth: usize,
        iter_stack: &[usize],
        live: &[LiveLocal],
    ) -> TraceResult<()> {
        let mut iter_slots = iter_stack.to_vec();
        iter_slots.extend(
            live.iter()
                .enumerate()
                .filter(|(_, local)| {
                    local
                        .changed
                        .as_ref()
                        .is_some_and(|var| matches!(var.kind, VarKind::Iter(_)))
                })
                .map(|(j, _)| depth + j),
        );
        let resume = continuation(
            self.req.state,
            ResumePoint {
                root: Arc::clone(root),
                offset,
                stack_depth: depth,
                argnames: live.iter().map(|local| local.name.clone()).collect(),
                iter_slots,
            },
        )?;
        let index = builder.add_const(Const::Code(resume));
        builder.emit(Opcode::LoadConst(index));
        builder.emit(Opcode::MakeFunction);
        if depth > 0 {
            builder.emit(Opcode::RotN(to_operand(depth + 1)));
        }
        for local in live {
            builder.emit(Opcode::LoadFast(local.slot));
        }
        builder.emit(Opcode::CallFunction(to_operand(depth + live.len())));
        builder.emit(Opcode::ReturnValue);
        Ok(())
    }

    fn finish(
        &self,
        frame: &SymFrame,
        builder: CodeBuilder,
        compiled: Option<Arc<CompiledGraph>>,
        export: Option<ExportCapture>,
    ) -> TraceResult<Traced> {
        let code = &frame.code;
        let (mut instructions, tables) = builder.finish();
        if self.req.config.dead_code_elimination {
            instructions = remove_pointless_jumps(remove_dead_code(instructions));
        }
        let rewritten = CodeUnit::new(CodeParts {
            name: code.name().to_owned(),
            qualname: code.qualname().to_owned(),
            filename: code.filename().to_owned(),
            first_line: code.first_line(),
            arg_count: code.arg_count(),
            tables,
            instructions,
            is_generator: false,
            kind: CodeKind::Rewritten,
            root: Some(code.root()),
        });
        Ok(Traced {
            code: Arc::new(rewritten),
            guards: self.output.guard_set(),
            graphs: compiled.into_iter().collect(),
            export,
        })
    }
}

fn jump_break(frame: &SymFrame) -> Flow {
    Flow::Break(GraphBreak {
        reason: "branch on a tensor value".to_owned(),
        kind: BreakKind::Jump,
        stack: frame.stack.clone(),
    })
}

fn load_const(code: &CodeUnit, index: u16) -> TraceResult<Var> {
    let Some(constant) = code.consts().get(usize::from(index)) else {
        return Err(TraceError::Internal(format!("constant {index} is outside {}", code.describe())));
    };
    match constant {
        Const::Code(_) => unsupported("nested function definition"),
        Const::Compiled(_) => unsupported("call into an already compiled graph"),
        Const::Builtin(builtin) => Ok(Var::new(VarKind::Builtin(*builtin))),
        other => Ok(Var::constant(Value::from_const(other))),
    }
}

fn describe(callee: &Var) -> String {
    match &callee.kind {
        VarKind::Function(func) => func.code().describe(),
        VarKind::Builtin(builtin) => format!("{builtin}()"),
        _ => callee.type_name().to_owned(),
    }
}

/// Stack positions holding iterators, which continuations receive as tuples.
fn stack_iterators(stack: &[Var]) -> TraceResult<Vec<usize>> {
    let mut positions = Vec::new();
    for (i, var) in stack.iter().enumerate() {
        if matches!(var.kind, VarKind::Iter(_)) {
            positions.push(i);
        } else if var.contains_iter() {
            return unsupported("iterator nested in a value live across a graph break");
        }
    }
    Ok(positions)
}

/// The bound locals of `frame` that the root code reads from `offset` on.
fn live_args(frame: &SymFrame, root: &CodeUnit, offset: u32) -> TraceResult<Vec<LiveLocal>> {
    let mut live = Vec::new();
    for root_slot in live_locals(root.instructions(), offset as usize) {
        let Some(name) = root.varnames().get(usize::from(root_slot)) else {
            continue;
        };
        let Some(slot) = frame.code.tables().varname_slot(name) else {
            return Err(TraceError::Internal(format!("{} has no local '{name}'", frame.code.describe())));
        };
        let changed = match frame.locals.get(usize::from(slot)) {
            None | Some(Slot::Unbound) => continue,
            Some(Slot::Input(_)) => None,
            Some(Slot::Var { var, changed }) => changed.then(|| var.clone()),
        };
        if changed
            .as_ref()
            .is_some_and(|var| var.contains_iter() && !matches!(var.kind, VarKind::Iter(_)))
        {
            return unsupported(format!("local '{name}' holds a nested iterator at a graph break"));
        }
        live.push(LiveLocal {
            name: name.clone(),
            slot,
            changed,
        });
    }
    Ok(live)
}

/// Changed locals to write back before the continuations run, once per slot.
fn stores_of<const N: usize>(lists: [&[LiveLocal]; N]) -> Vec<(u16, Var)> {
    let mut stores: Vec<(u16, Var)> = Vec::new();
    for local in lists.into_iter().flatten() {
        if let Some(var) = &local.changed
            && !stores.iter().any(|(slot, _)| *slot == local.slot)
        {
            stores.push((local.slot, var.clone()));
        }
    }
    stores
}
