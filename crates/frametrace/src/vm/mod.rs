//! Stack interpreter for compiled code units.
//!
//! Every call to a host function passes through the frame interception hook
//! ([`eval_frame::intercept`]) before its frame starts, which is how the
//! tracer replaces code. Module-level code is never intercepted.

mod builtins;
mod ops;

use std::{cell::RefCell, rc::Rc, sync::Arc};

pub use builtins::{Builtin, TensorMethod, lookup_builtin};
pub(crate) use builtins::{call_method, shape_args, tensor_from_value};
pub(crate) use ops::{
    binary_op, compare_op, get_attr, repeated_len, subscript, tensor_attr, tensor_error, unary_negative,
};

use crate::{
    bytecode::{CodeKind, CodeUnit, Opcode, Program},
    error::{ExcType, Exception, RunError, RunResult, TraceError},
    eval_frame::{self, CapturedFrame, ModeScope},
    io::PrintWriter,
    tracer::{NoopTracer, VmTracer},
    value::{Function, Generator, Globals, Iter, Value, new_globals},
};

/// Maximum depth of nested host calls.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// A `try` region: where to jump and how deep the stack was on entry.
#[derive(Debug, Clone, Copy)]
struct Block {
    handler: usize,
    stack_depth: usize,
}

/// Execution state of one function activation.
#[derive(Debug)]
pub(crate) struct Frame {
    code: Arc<CodeUnit>,
    globals: Globals,
    locals: Vec<Option<Value>>,
    stack: Vec<Value>,
    blocks: Vec<Block>,
    ip: usize,
}

impl Frame {
    fn new(code: Arc<CodeUnit>, globals: Globals, mut locals: Vec<Option<Value>>) -> Self {
        locals.resize(code.varnames().len(), None);
        Self {
            code,
            globals,
            locals,
            stack: Vec::new(),
            blocks: Vec::new(),
            ip: 0,
        }
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| TraceError::Internal(format!("stack underflow in {}", self.code.describe())).into())
    }

    fn top(&self) -> RunResult<&Value> {
        self.stack
            .last()
            .ok_or_else(|| TraceError::Internal(format!("stack underflow in {}", self.code.describe())).into())
    }

    fn pop_n(&mut self, n: usize) -> RunResult<Vec<Value>> {
        if self.stack.len() < n {
            return Err(TraceError::Internal(format!("stack underflow in {}", self.code.describe())).into());
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn malformed(&self, what: &str, index: u16) -> RunError {
        TraceError::Internal(format!("{what} {index} is outside {}", self.code.describe())).into()
    }

    fn constant(&self, index: u16) -> RunResult<Value> {
        self.code
            .consts()
            .get(usize::from(index))
            .map(Value::from_const)
            .ok_or_else(|| self.malformed("constant", index))
    }

    fn name(&self, index: u16) -> RunResult<&str> {
        self.code
            .names()
            .get(usize::from(index))
            .map(String::as_str)
            .ok_or_else(|| self.malformed("name", index))
    }

    fn local(&mut self, slot: u16) -> RunResult<&mut Option<Value>> {
        self.locals
            .get_mut(usize::from(slot))
            .ok_or_else(|| TraceError::Internal(format!("local {slot} is outside {}", self.code.describe())).into())
    }
}

/// How a frame stopped running.
#[derive(Debug)]
pub(crate) enum FrameExit {
    Return(Value),
    Yield(Value),
}

/// The interpreter.
///
/// # Usage
///
/// ```ignore
/// let program = compile(source, "model.py")?;
/// let mut print = StdPrint::new();
/// let mut vm = Vm::new(&mut print, NoopTracer);
/// let globals = vm.run_program(&program)?;
/// let f = globals.borrow()["f"].clone();
/// let out = vm.call(&f, vec![Value::Tensor(x)])?;
/// ```
pub struct Vm<'p, Tr: VmTracer = NoopTracer> {
    print: &'p mut dyn PrintWriter,
    tracer: Tr,
    depth: usize,
    max_depth: usize,
}

impl<'p, Tr: VmTracer> Vm<'p, Tr> {
    pub fn new(print: &'p mut dyn PrintWriter, tracer: Tr) -> Self {
        Self::with_depth(print, tracer, 0, DEFAULT_MAX_RECURSION_DEPTH)
    }

    pub(crate) fn with_depth(print: &'p mut dyn PrintWriter, tracer: Tr, depth: usize, max_depth: usize) -> Self {
        Self {
            print,
            tracer,
            depth,
            max_depth,
        }
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    pub fn set_max_recursion_depth(&mut self, depth: usize) {
        self.max_depth = depth;
    }

    /// Runs module-level code and returns the resulting globals.
    pub fn run_program(&mut self, program: &Program) -> RunResult<Globals> {
        let globals = new_globals();
        let mut frame = Frame::new(Arc::clone(program.module()), Rc::clone(&globals), Vec::new());
        match self.run_frame(&mut frame)? {
            FrameExit::Return(_) => Ok(globals),
            FrameExit::Yield(_) => Err(TraceError::Internal("yield at module level".into()).into()),
        }
    }

    /// Calls any callable value.
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> RunResult<Value> {
        self.call_value(callee, args)
    }

    pub(crate) fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> RunResult<Value> {
        match callee {
            Value::Function(func) => self.call_function(func, args),
            Value::Builtin(builtin) => self.call_builtin(*builtin, args),
            Value::Method(method) => call_method(&method.receiver, method.method, &args),
            Value::Compiled(graph) => {
                let inputs = args
                    .iter()
                    .map(|arg| match arg {
                        Value::Tensor(t) => Ok(t.clone()),
                        other => ExcType::TypeError.raise(format!(
                            "{}() expected Tensor arguments, got {}",
                            graph.name(),
                            other.type_name()
                        )),
                    })
                    .collect::<RunResult<Vec<_>>>()?;
                self.tracer.on_graph_call(graph.name(), inputs.len());
                let outputs = graph.call(&inputs).map_err(tensor_error)?;
                Ok(Value::tuple(outputs.into_iter().map(Value::Tensor).collect()))
            }
            Value::ExcClass(exc_type) => {
                let message = args.first().map(ToString::to_string).unwrap_or_default();
                Ok(Value::Exception(Rc::new(Exception::new(*exc_type, message))))
            }
            Value::Wrapped(wrapped) => {
                let _scope = ModeScope::enter(wrapped.mode.clone());
                self.call_value(&wrapped.inner, args)
            }
            other => ExcType::TypeError.raise(format!("'{}' object is not callable", other.type_name())),
        }
    }

    fn call_function(&mut self, func: &Rc<Function>, args: Vec<Value>) -> RunResult<Value> {
        let code = func.code();
        if args.len() != code.arg_count() {
            return ExcType::TypeError.raise(format!(
                "{}() takes {} positional argument{} but {} were given",
                code.name(),
                code.arg_count(),
                if code.arg_count() == 1 { "" } else { "s" },
                args.len()
            ));
        }
        let mut locals: Vec<Option<Value>> = args.into_iter().map(Some).collect();
        locals.resize(code.varnames().len(), None);
        let replacement = eval_frame::intercept(&CapturedFrame::new(code, &locals, func.globals()))?;
        let run_code = replacement.unwrap_or_else(|| Arc::clone(code));
        let mut frame = Frame::new(run_code, Rc::clone(func.globals()), locals);

        if frame.code.is_generator() {
            return Ok(Value::Generator(Rc::new(Generator {
                name: code.name().to_owned(),
                frame: RefCell::new(Some(Box::new(frame))),
            })));
        }

        self.enter_frame(code.name(), frame.code.kind())?;
        let result = self.run_frame(&mut frame);
        self.exit_frame();
        match result? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(_) => Err(TraceError::Internal(format!("{} yielded without being a generator", code.describe())).into()),
        }
    }

    fn enter_frame(&mut self, name: &str, kind: CodeKind) -> RunResult<()> {
        if self.depth >= self.max_depth {
            return ExcType::RecursionError.raise("maximum recursion depth exceeded");
        }
        self.depth += 1;
        self.tracer.on_frame_enter(name, kind, self.depth);
        Ok(())
    }

    fn exit_frame(&mut self) {
        self.depth -= 1;
        self.tracer.on_frame_exit(self.depth);
    }

    /// Makes an iterator for `for` loops, `iter()` and unpacking.
    pub(crate) fn get_iter(&mut self, value: Value) -> RunResult<Value> {
        let iter = match value {
            Value::Iter(_) | Value::Generator(_) => return Ok(value),
            Value::Tuple(items) => Iter::Seq { items, pos: 0 },
            Value::Range(range) => Iter::Range { range, pos: 0 },
            Value::Dict(dict) => Iter::Seq {
                items: dict.items().keys().map(|k| Value::str(k)).collect(),
                pos: 0,
            },
            Value::Str(s) => Iter::Seq {
                items: s.chars().map(|c| Value::Str(c.to_string().into())).collect(),
                pos: 0,
            },
            Value::Tensor(t) => match t.rows() {
                Some(rows) => Iter::Seq {
                    items: rows.into_iter().map(Value::Tensor).collect(),
                    pos: 0,
                },
                None => return ExcType::TypeError.raise("iteration over a 0-d tensor"),
            },
            other => return ExcType::TypeError.raise(format!("'{}' object is not iterable", other.type_name())),
        };
        Ok(Value::Iter(Rc::new(RefCell::new(iter))))
    }

    /// Advances an iterator or generator; `None` when exhausted.
    pub(crate) fn next_value(&mut self, iterator: &Value) -> RunResult<Option<Value>> {
        match iterator {
            Value::Iter(iter) => Ok(iter.borrow_mut().next_item()),
            Value::Generator(generator) => {
                let Some(mut frame) = generator.frame.borrow_mut().take() else {
                    return Ok(None);
                };
                self.enter_frame(&generator.name, frame.code.kind())?;
                let result = self.run_frame(&mut frame);
                self.exit_frame();
                match result? {
                    FrameExit::Yield(value) => {
                        *generator.frame.borrow_mut() = Some(frame);
                        Ok(Some(value))
                    }
                    FrameExit::Return(_) => Ok(None),
                }
            }
            other => ExcType::TypeError.raise(format!("'{}' object is not an iterator", other.type_name())),
        }
    }

    pub(crate) fn collect_iterable(&mut self, value: Value) -> RunResult<Vec<Value>> {
        if let Value::Tuple(items) = &value {
            return Ok(items.to_vec());
        }
        let iterator = self.get_iter(value)?;
        let mut items = Vec::new();
        while let Some(item) = self.next_value(&iterator)? {
            items.push(item);
        }
        Ok(items)
    }

    fn run_frame(&mut self, frame: &mut Frame) -> RunResult<FrameExit> {
        loop {
            match self.step(frame) {
                Ok(None) => {}
                Ok(Some(exit)) => return Ok(exit),
                Err(RunError::Exc(exc)) => {
                    let Some(block) = frame.blocks.pop() else {
                        return Err(exc.into());
                    };
                    frame.stack.truncate(block.stack_depth);
                    frame.stack.push(Value::Exception(Rc::new(exc)));
                    frame.ip = block.handler;
                    self.tracer.on_handler(self.depth);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Executes one instruction.
    fn step(&mut self, frame: &mut Frame) -> RunResult<Option<FrameExit>> {
        let Some(instruction) = frame.code.instructions().get(frame.ip) else {
            return Err(TraceError::Internal(format!("fell off the end of {}", frame.code.describe())).into());
        };
        let opcode = instruction.opcode;
        self.tracer.on_instruction(frame.ip, opcode, frame.stack.len());
        frame.ip += 1;

        match opcode {
            Opcode::Nop => {}
            Opcode::LoadConst(index) => {
                let value = frame.constant(index)?;
                frame.stack.push(value);
            }
            Opcode::LoadFast(slot) => match frame.local(slot)?.clone() {
                Some(value) => frame.stack.push(value),
                None => {
                    let name = frame.code.varnames().get(usize::from(slot)).map_or("?", String::as_str);
                    return ExcType::UnboundLocalError.raise(format!("local variable '{name}' referenced before assignment"));
                }
            },
            Opcode::StoreFast(slot) => {
                let value = frame.pop()?;
                *frame.local(slot)? = Some(value);
            }
            Opcode::LoadGlobal(index) => {
                let name = frame.name(index)?;
                match lookup_global(&frame.globals, name) {
                    Some(value) => frame.stack.push(value),
                    None => return ExcType::NameError.raise(format!("name '{name}' is not defined")),
                }
            }
            Opcode::StoreGlobal(index) => {
                let value = frame.pop()?;
                let name = frame.name(index)?.to_owned();
                frame.globals.borrow_mut().insert(name, value);
            }
            Opcode::LoadAttr(index) => {
                let object = frame.pop()?;
                let value = get_attr(&object, frame.name(index)?)?;
                frame.stack.push(value);
            }
            Opcode::StoreAttr(index) => {
                let object = frame.pop()?;
                let value = frame.pop()?;
                let name = frame.name(index)?;
                match object {
                    Value::Object(obj) => obj.set_attr(name, value),
                    other => {
                        return ExcType::AttributeError.raise(format!(
                            "'{}' object attribute '{name}' is read-only",
                            other.type_name()
                        ));
                    }
                }
            }
            Opcode::BinarySubscr => {
                let index = frame.pop()?;
                let container = frame.pop()?;
                frame.stack.push(subscript(&container, &index)?);
            }
            Opcode::BinaryOp(op) => {
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                frame.stack.push(binary_op(op, &lhs, &rhs)?);
            }
            Opcode::UnaryNegative => {
                let value = frame.pop()?;
                frame.stack.push(unary_negative(&value)?);
            }
            Opcode::UnaryNot => {
                let value = frame.pop()?;
                frame.stack.push(Value::Bool(!value.truthy()?));
            }
            Opcode::CompareOp(op) => {
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                frame.stack.push(compare_op(op, &lhs, &rhs)?);
            }
            Opcode::BuildTuple(n) => {
                let items = frame.pop_n(usize::from(n))?;
                frame.stack.push(Value::tuple(items));
            }
            Opcode::BuildMap(n) => {
                let flat = frame.pop_n(2 * usize::from(n))?;
                let mut items = indexmap::IndexMap::new();
                for pair in flat.chunks_exact(2) {
                    let Value::Str(key) = &pair[0] else {
                        return ExcType::TypeError.raise("dict keys must be strings");
                    };
                    items.insert(key.to_string(), pair[1].clone());
                }
                frame.stack.push(Value::Dict(Rc::new(crate::value::Dict::new(items))));
            }
            Opcode::UnpackSequence(n) => {
                let sequence = frame.pop()?;
                let items = self.collect_iterable(sequence)?;
                let expected = usize::from(n);
                if items.len() < expected {
                    return ExcType::ValueError.raise(format!(
                        "not enough values to unpack (expected {expected}, got {})",
                        items.len()
                    ));
                }
                if items.len() > expected {
                    return ExcType::ValueError.raise(format!("too many values to unpack (expected {expected})"));
                }
                frame.stack.extend(items.into_iter().rev());
            }
            Opcode::CallFunction(n) => {
                let args = frame.pop_n(usize::from(n))?;
                let callee = frame.pop()?;
                let result = self.call_value(&callee, args)?;
                frame.stack.push(result);
            }
            Opcode::CallFunctionEx(n) => {
                let rest = frame.pop()?;
                let mut args = frame.pop_n(usize::from(n))?;
                args.extend(self.collect_iterable(rest)?);
                let callee = frame.pop()?;
                let result = self.call_value(&callee, args)?;
                frame.stack.push(result);
            }
            Opcode::MakeFunction => match frame.pop()? {
                Value::Code(code) => {
                    let function = Function::new(code, Rc::clone(&frame.globals));
                    frame.stack.push(Value::Function(Rc::new(function)));
                }
                other => {
                    return Err(TraceError::Internal(format!("MakeFunction on {}", other.type_name())).into());
                }
            },
            Opcode::ReturnValue => return Ok(Some(FrameExit::Return(frame.pop()?))),
            Opcode::YieldValue => {
                let value = frame.pop()?;
                // value of the yield expression once resumed
                frame.stack.push(Value::None);
                return Ok(Some(FrameExit::Yield(value)));
            }
            Opcode::PopTop => {
                frame.pop()?;
            }
            Opcode::DupTop => {
                let top = frame.top()?.clone();
                frame.stack.push(top);
            }
            Opcode::RotTwo => rotate(frame, 2)?,
            Opcode::RotThree => rotate(frame, 3)?,
            Opcode::RotN(n) => rotate(frame, usize::from(n))?,
            Opcode::Jump(target) => frame.ip = target as usize,
            Opcode::PopJumpIfFalse(target) => {
                if !frame.pop()?.truthy()? {
                    frame.ip = target as usize;
                }
            }
            Opcode::PopJumpIfTrue(target) => {
                if frame.pop()?.truthy()? {
                    frame.ip = target as usize;
                }
            }
            Opcode::JumpIfFalseOrPop(target) => {
                if frame.top()?.truthy()? {
                    frame.pop()?;
                } else {
                    frame.ip = target as usize;
                }
            }
            Opcode::JumpIfTrueOrPop(target) => {
                if frame.top()?.truthy()? {
                    frame.ip = target as usize;
                } else {
                    frame.pop()?;
                }
            }
            Opcode::GetIter => {
                let value = frame.pop()?;
                let iterator = self.get_iter(value)?;
                frame.stack.push(iterator);
            }
            Opcode::ForIter(target) => {
                let iterator = frame.top()?.clone();
                match self.next_value(&iterator)? {
                    Some(item) => frame.stack.push(item),
                    None => {
                        frame.pop()?;
                        frame.ip = target as usize;
                    }
                }
            }
            Opcode::SetupExcept(target) => frame.blocks.push(Block {
                handler: target as usize,
                stack_depth: frame.stack.len(),
            }),
            Opcode::PopBlock => {
                frame.blocks.pop();
            }
            Opcode::Raise => {
                return Err(match frame.pop()? {
                    Value::ExcClass(exc_type) => Exception::new(exc_type, "").into(),
                    Value::Exception(exc) => (*exc).clone().into(),
                    _ => Exception::new(ExcType::TypeError, "exceptions must derive from BaseException").into(),
                });
            }
            Opcode::Reraise => {
                return Err(match frame.pop()? {
                    Value::Exception(exc) => (*exc).clone().into(),
                    other => TraceError::Internal(format!("re-raise of {}", other.type_name())).into(),
                });
            }
        }
        Ok(None)
    }
}

/// Moves the top of the stack down to position `n`.
fn rotate(frame: &mut Frame, n: usize) -> RunResult<()> {
    if n <= 1 {
        return Ok(());
    }
    let top = frame.pop()?;
    let Some(at) = frame.stack.len().checked_sub(n - 1) else {
        return Err(TraceError::Internal(format!("rotate past the bottom of the stack in {}", frame.code.describe())).into());
    };
    frame.stack.insert(at, top);
    Ok(())
}

/// Resolves a global name, falling back to builtins.
#[must_use]
pub fn lookup_global(globals: &Globals, name: &str) -> Option<Value> {
    globals.borrow().get(name).cloned().or_else(|| lookup_builtin(name))
}
