//! Compiles host-language source into code units.
//!
//! Source is parsed with `ruff_python_parser`; the supported subset covers
//! top-level function definitions with positional parameters and the
//! statements and expressions the tracer models. Anything else is reported as
//! a [`CompileError::NotSupported`].

use std::sync::Arc;

use indexmap::IndexSet;
use ruff_python_ast::{self as ast, BoolOp, CmpOp as AstCmpOp, Expr, Number, Operator, Stmt, UnaryOp};
use ruff_python_parser::parse_module;
use ruff_text_size::{Ranged, TextRange};

use super::{
    builder::{CodeBuilder, JumpLabel},
    code::{CodeTables, CodeUnit, Const},
    op::{BinOp, CmpOp, Opcode},
};
use crate::error::CompileError;

/// A compiled source file.
#[derive(Debug, Clone)]
pub struct Program {
    filename: String,
    module: Arc<CodeUnit>,
}

impl Program {
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Module-level code; running it defines the program's globals.
    #[must_use]
    pub fn module(&self) -> &Arc<CodeUnit> {
        &self.module
    }
}

/// Parses and compiles `source`.
pub fn compile(source: &str, filename: &str) -> Result<Program, CompileError> {
    let lines = LineIndex::new(source);
    let parsed = parse_module(source).map_err(|e| CompileError::Syntax {
        message: e.to_string(),
        line: lines.line(e.range()),
    })?;
    let module = parsed.into_syntax();
    let mut unit = Unit::new(Scope::Module, filename, &lines);
    unit.compile_body(module.body)?;
    let none = unit.builder.add_const(Const::None);
    unit.builder.emit(Opcode::LoadConst(none));
    unit.builder.emit(Opcode::ReturnValue);
    let module = unit.builder.build("<module>", filename, 1, 0, false);
    Ok(Program {
        filename: filename.to_owned(),
        module,
    })
}

/// Maps byte offsets to 1-based line numbers.
struct LineIndex {
    starts: Vec<u32>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| u32::try_from(i + 1).expect("source exceeds u32")),
        );
        Self { starts }
    }

    fn line(&self, range: TextRange) -> u32 {
        let offset = u32::from(range.start());
        let index = self.starts.partition_point(|start| *start <= offset);
        u32::try_from(index).expect("line count exceeds u32")
    }
}

#[derive(Debug)]
enum Scope {
    Module,
    Function { locals: IndexSet<String> },
}

struct LoopContext {
    continue_target: u32,
    breaks: Vec<JumpLabel>,
    is_for: bool,
    try_depth: usize,
}

/// Compilation state for one code unit.
struct Unit<'a> {
    builder: CodeBuilder,
    scope: Scope,
    filename: &'a str,
    lines: &'a LineIndex,
    loops: Vec<LoopContext>,
    try_depth: usize,
    is_generator: bool,
}

impl<'a> Unit<'a> {
    fn new(scope: Scope, filename: &'a str, lines: &'a LineIndex) -> Self {
        let mut tables = CodeTables::default();
        if let Scope::Function { locals } = &scope {
            tables.varnames = locals.iter().cloned().collect();
        }
        Self {
            builder: CodeBuilder::new(tables),
            scope,
            filename,
            lines,
            loops: Vec::new(),
            try_depth: 0,
            is_generator: false,
        }
    }

    fn unsupported<T>(&self, what: &str, range: TextRange) -> Result<T, CompileError> {
        Err(CompileError::not_supported(what, self.lines.line(range)))
    }

    fn compile_body(&mut self, body: impl IntoIterator<Item = Stmt>) -> Result<(), CompileError> {
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: Stmt) -> Result<(), CompileError> {
        let range = stmt.range();
        self.builder.set_line(self.lines.line(range));
        match stmt {
            Stmt::FunctionDef(function) => self.compile_function_def(function),
            Stmt::Return(ast::StmtReturn { value, .. }) => {
                if matches!(self.scope, Scope::Module) {
                    return self.unsupported("'return' outside function", range);
                }
                match value {
                    Some(value) => self.compile_expr(*value)?,
                    None => self.load_const(Const::None),
                }
                self.builder.emit(Opcode::ReturnValue);
                Ok(())
            }
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.compile_expr(*value)?;
                let count = targets.len();
                for (i, target) in targets.into_iter().enumerate() {
                    if i + 1 < count {
                        self.builder.emit(Opcode::DupTop);
                    }
                    self.compile_store(target)?;
                }
                Ok(())
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, op, value, .. }) => {
                let op = self.binary_operator(op, range)?;
                match *target {
                    Expr::Name(ast::ExprName { id, .. }) => {
                        self.load_name(id.as_str());
                        self.compile_expr(*value)?;
                        self.builder.emit(Opcode::BinaryOp(op));
                        self.store_name(id.as_str());
                    }
                    Expr::Attribute(ast::ExprAttribute { value: object, attr, .. }) => {
                        self.compile_expr(*object)?;
                        self.builder.emit(Opcode::DupTop);
                        let name = self.builder.add_name(attr.as_str());
                        self.builder.emit(Opcode::LoadAttr(name));
                        self.compile_expr(*value)?;
                        self.builder.emit(Opcode::BinaryOp(op));
                        self.builder.emit(Opcode::RotTwo);
                        self.builder.emit(Opcode::StoreAttr(name));
                    }
                    _ => return self.unsupported("augmented assignment target", range),
                }
                Ok(())
            }
            Stmt::Expr(ast::StmtExpr { value, .. }) => {
                self.compile_expr(*value)?;
                self.builder.emit(Opcode::PopTop);
                Ok(())
            }
            Stmt::Pass(_) => Ok(()),
            Stmt::If(ast::StmtIf {
                test,
                body,
                elif_else_clauses,
                ..
            }) => self.compile_if(*test, body, elif_else_clauses),
            Stmt::While(ast::StmtWhile { test, body, orelse, .. }) => {
                let start = self.builder.current_offset();
                self.compile_expr(*test)?;
                let exit = self.builder.emit_jump(Opcode::PopJumpIfFalse(0));
                self.loops.push(LoopContext {
                    continue_target: start,
                    breaks: Vec::new(),
                    is_for: false,
                    try_depth: self.try_depth,
                });
                self.compile_body(body)?;
                self.builder.emit_jump_to(Opcode::Jump(0), start);
                let context = self.loops.pop().expect("loop context pushed above");
                self.builder.patch_jump(exit);
                self.compile_body(orelse)?;
                for label in context.breaks {
                    self.builder.patch_jump(label);
                }
                Ok(())
            }
            Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                is_async,
                ..
            }) => {
                if is_async {
                    return self.unsupported("async for", range);
                }
                self.compile_expr(*iter)?;
                self.builder.emit(Opcode::GetIter);
                let start = self.builder.current_offset();
                let exit = self.builder.emit_jump(Opcode::ForIter(0));
                self.compile_store(*target)?;
                self.loops.push(LoopContext {
                    continue_target: start,
                    breaks: Vec::new(),
                    is_for: true,
                    try_depth: self.try_depth,
                });
                self.compile_body(body)?;
                self.builder.emit_jump_to(Opcode::Jump(0), start);
                let context = self.loops.pop().expect("loop context pushed above");
                self.builder.patch_jump(exit);
                // the iterator was popped by the exhausted ForIter
                self.builder.set_stack_depth(self.builder.stack_depth() - 1);
                self.compile_body(orelse)?;
                for label in context.breaks {
                    self.builder.patch_jump(label);
                }
                Ok(())
            }
            Stmt::Break(_) => {
                let Some(context) = self.loops.last() else {
                    return self.unsupported("'break' outside loop", range);
                };
                let (pops, is_for) = (self.try_depth - context.try_depth, context.is_for);
                for _ in 0..pops {
                    self.builder.emit(Opcode::PopBlock);
                }
                if is_for {
                    self.builder.emit(Opcode::PopTop);
                }
                let label = self.builder.emit_jump(Opcode::Jump(0));
                if is_for {
                    self.builder.set_stack_depth(self.builder.stack_depth() + 1);
                }
                self.loops.last_mut().expect("checked above").breaks.push(label);
                Ok(())
            }
            Stmt::Continue(_) => {
                let Some(context) = self.loops.last() else {
                    return self.unsupported("'continue' not properly in loop", range);
                };
                let (pops, target) = (self.try_depth - context.try_depth, context.continue_target);
                for _ in 0..pops {
                    self.builder.emit(Opcode::PopBlock);
                }
                self.builder.emit_jump_to(Opcode::Jump(0), target);
                Ok(())
            }
            Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                is_star,
                ..
            }) => {
                if is_star || !finalbody.is_empty() {
                    return self.unsupported("try/finally and except*", range);
                }
                self.compile_try(body, handlers, orelse)
            }
            Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                let (Some(exc), None) = (exc, cause) else {
                    return self.unsupported("bare raise and raise ... from", range);
                };
                self.compile_expr(*exc)?;
                self.builder.emit(Opcode::Raise);
                Ok(())
            }
            _ => self.unsupported("this statement", range),
        }
    }

    fn compile_function_def(&mut self, function: ast::StmtFunctionDef) -> Result<(), CompileError> {
        let range = function.range;
        if !matches!(self.scope, Scope::Module) {
            return self.unsupported("nested function definitions", range);
        }
        if function.is_async || !function.decorator_list.is_empty() {
            return self.unsupported("async or decorated functions", range);
        }
        let params = &function.parameters;
        if params.vararg.is_some() || params.kwarg.is_some() || !params.kwonlyargs.is_empty() {
            return self.unsupported("*args, **kwargs and keyword-only parameters", range);
        }
        let mut locals = IndexSet::new();
        for param in params.posonlyargs.iter().chain(&params.args) {
            if param.default.is_some() {
                return self.unsupported("default parameter values", range);
            }
            locals.insert(param.parameter.name.as_str().to_owned());
        }
        let arg_count = locals.len();
        collect_assigned(&function.body, &mut locals);

        let name = function.name.as_str().to_owned();
        let first_line = self.lines.line(range);
        let mut unit = Unit::new(Scope::Function { locals }, self.filename, self.lines);
        unit.builder.set_line(first_line);
        unit.compile_body(function.body)?;
        unit.load_const(Const::None);
        unit.builder.emit(Opcode::ReturnValue);
        let is_generator = unit.is_generator;
        let code = unit.builder.build(&name, self.filename, first_line, arg_count, is_generator);

        self.load_const(Const::Code(code));
        self.builder.emit(Opcode::MakeFunction);
        self.store_name(&name);
        Ok(())
    }

    fn compile_if(
        &mut self,
        test: Expr,
        body: impl IntoIterator<Item = Stmt>,
        clauses: Vec<ast::ElifElseClause>,
    ) -> Result<(), CompileError> {
        let mut ends = Vec::new();
        self.compile_expr(test)?;
        let mut next = self.builder.emit_jump(Opcode::PopJumpIfFalse(0));
        self.compile_body(body)?;
        for clause in clauses {
            ends.push(self.builder.emit_jump(Opcode::Jump(0)));
            self.builder.patch_jump(next);
            match clause.test {
                Some(test) => {
                    self.compile_expr(test)?;
                    next = self.builder.emit_jump(Opcode::PopJumpIfFalse(0));
                    self.compile_body(clause.body)?;
                }
                None => {
                    self.compile_body(clause.body)?;
                    // an `else` clause: nothing left to skip
                    next = self.builder.emit_jump(Opcode::Jump(0));
                }
            }
        }
        self.builder.patch_jump(next);
        for label in ends {
            self.builder.patch_jump(label);
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: impl IntoIterator<Item = Stmt>,
        handlers: Vec<ast::ExceptHandler>,
        orelse: impl IntoIterator<Item = Stmt>,
    ) -> Result<(), CompileError> {
        let depth = self.builder.stack_depth();
        let setup = self.builder.emit_jump(Opcode::SetupExcept(0));
        self.try_depth += 1;
        self.compile_body(body)?;
        self.try_depth -= 1;
        self.builder.emit(Opcode::PopBlock);
        let to_else = self.builder.emit_jump(Opcode::Jump(0));

        self.builder.patch_jump(setup);
        self.builder.set_stack_depth(depth + 1);
        let mut ends = Vec::new();
        let mut caught_all = false;
        for handler in handlers {
            let ast::ExceptHandler::ExceptHandler(handler) = handler;
            self.builder.set_line(self.lines.line(handler.range));
            let next = match handler.type_ {
                Some(type_) => {
                    self.builder.emit(Opcode::DupTop);
                    self.compile_expr(*type_)?;
                    self.builder.emit(Opcode::CompareOp(CmpOp::ExcMatch));
                    Some(self.builder.emit_jump(Opcode::PopJumpIfFalse(0)))
                }
                None => {
                    caught_all = true;
                    None
                }
            };
            match handler.name {
                Some(name) => self.store_name(name.as_str()),
                None => self.builder.emit(Opcode::PopTop),
            }
            self.compile_body(handler.body)?;
            ends.push(self.builder.emit_jump(Opcode::Jump(0)));
            self.builder.set_stack_depth(depth + 1);
            if let Some(next) = next {
                self.builder.patch_jump(next);
            }
            if caught_all {
                break;
            }
        }
        if !caught_all {
            self.builder.emit(Opcode::Reraise);
        }
        self.builder.set_stack_depth(depth);
        self.builder.patch_jump(to_else);
        self.compile_body(orelse)?;
        for label in ends {
            self.builder.patch_jump(label);
        }
        Ok(())
    }

    fn compile_store(&mut self, target: Expr) -> Result<(), CompileError> {
        let range = target.range();
        match target {
            Expr::Name(ast::ExprName { id, .. }) => {
                self.store_name(id.as_str());
                Ok(())
            }
            Expr::Tuple(ast::ExprTuple { elts, .. }) => {
                let count = u16::try_from(elts.len()).expect("tuple target too long");
                self.builder.emit(Opcode::UnpackSequence(count));
                for element in elts {
                    self.compile_store(element)?;
                }
                Ok(())
            }
            Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.compile_expr(*value)?;
                let name = self.builder.add_name(attr.as_str());
                self.builder.emit(Opcode::StoreAttr(name));
                Ok(())
            }
            _ => self.unsupported("assignment target", range),
        }
    }

    fn compile_expr(&mut self, expr: Expr) -> Result<(), CompileError> {
        let range = expr.range();
        match expr {
            Expr::Name(ast::ExprName { id, .. }) => {
                self.load_name(id.as_str());
                Ok(())
            }
            Expr::NumberLiteral(ast::ExprNumberLiteral { value, .. }) => {
                let constant = match value {
                    Number::Int(i) => match i.as_i64() {
                        Some(i) => Const::Int(i),
                        None => return self.unsupported("integers beyond 64 bits", range),
                    },
                    Number::Float(f) => Const::Float(f),
                    Number::Complex { .. } => return self.unsupported("complex literals", range),
                };
                self.load_const(constant);
                Ok(())
            }
            Expr::StringLiteral(ast::ExprStringLiteral { value, .. }) => {
                self.load_const(Const::Str(value.to_str().into()));
                Ok(())
            }
            Expr::BooleanLiteral(ast::ExprBooleanLiteral { value, .. }) => {
                self.load_const(Const::Bool(value));
                Ok(())
            }
            Expr::NoneLiteral(_) => {
                self.load_const(Const::None);
                Ok(())
            }
            Expr::Tuple(ast::ExprTuple { elts, .. }) => {
                let count = u16::try_from(elts.len()).expect("tuple literal too long");
                for element in elts {
                    if element.is_starred_expr() {
                        return self.unsupported("starred tuple elements", range);
                    }
                    self.compile_expr(element)?;
                }
                self.builder.emit(Opcode::BuildTuple(count));
                Ok(())
            }
            Expr::Dict(ast::ExprDict { items, .. }) => {
                let count = u16::try_from(items.len()).expect("dict literal too long");
                for item in items {
                    match item.key {
                        Some(Expr::StringLiteral(ast::ExprStringLiteral { value, .. })) => {
                            self.load_const(Const::Str(value.to_str().into()));
                        }
                        _ => return self.unsupported("dict keys other than string literals", range),
                    }
                    self.compile_expr(item.value)?;
                }
                self.builder.emit(Opcode::BuildMap(count));
                Ok(())
            }
            Expr::BinOp(ast::ExprBinOp { left, op, right, .. }) => {
                let op = self.binary_operator(op, range)?;
                self.compile_expr(*left)?;
                self.compile_expr(*right)?;
                self.builder.emit(Opcode::BinaryOp(op));
                Ok(())
            }
            Expr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => {
                self.compile_expr(*operand)?;
                match op {
                    UnaryOp::USub => self.builder.emit(Opcode::UnaryNegative),
                    UnaryOp::Not => self.builder.emit(Opcode::UnaryNot),
                    UnaryOp::UAdd => {}
                    UnaryOp::Invert => return self.unsupported("the ~ operator", range),
                }
                Ok(())
            }
            Expr::BoolOp(ast::ExprBoolOp { op, values, .. }) => {
                let count = values.len();
                let mut ends = Vec::new();
                for (i, value) in values.into_iter().enumerate() {
                    self.compile_expr(value)?;
                    if i + 1 < count {
                        let jump = match op {
                            BoolOp::And => Opcode::JumpIfFalseOrPop(0),
                            BoolOp::Or => Opcode::JumpIfTrueOrPop(0),
                        };
                        ends.push(self.builder.emit_jump(jump));
                    }
                }
                for label in ends {
                    self.builder.patch_jump(label);
                }
                Ok(())
            }
            Expr::Compare(ast::ExprCompare {
                left,
                ops,
                comparators,
                ..
            }) => self.compile_compare(*left, ops.into_vec(), comparators.into_vec()),
            Expr::If(ast::ExprIf { test, body, orelse, .. }) => {
                self.compile_expr(*test)?;
                let to_else = self.builder.emit_jump(Opcode::PopJumpIfFalse(0));
                self.compile_expr(*body)?;
                let to_end = self.builder.emit_jump(Opcode::Jump(0));
                self.builder.set_stack_depth(self.builder.stack_depth() - 1);
                self.builder.patch_jump(to_else);
                self.compile_expr(*orelse)?;
                self.builder.patch_jump(to_end);
                Ok(())
            }
            Expr::Call(ast::ExprCall { func, arguments, .. }) => {
                let ast::Arguments { args, keywords, .. } = arguments;
                if !keywords.is_empty() {
                    return self.unsupported("keyword arguments", range);
                }
                self.compile_expr(*func)?;
                let args = args.into_vec();
                let count = args.len();
                let mut splat = false;
                for (i, arg) in args.into_iter().enumerate() {
                    match arg {
                        Expr::Starred(ast::ExprStarred { value, .. }) => {
                            if i + 1 != count {
                                return self.unsupported("*args before other arguments", range);
                            }
                            self.compile_expr(*value)?;
                            splat = true;
                        }
                        other => self.compile_expr(other)?,
                    }
                }
                if splat {
                    self.builder.emit(Opcode::CallFunctionEx(to_u16(count - 1)));
                } else {
                    self.builder.emit(Opcode::CallFunction(to_u16(count)));
                }
                Ok(())
            }
            Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.compile_expr(*value)?;
                let name = self.builder.add_name(attr.as_str());
                self.builder.emit(Opcode::LoadAttr(name));
                Ok(())
            }
            Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                if slice.is_slice_expr() {
                    return self.unsupported("slices", range);
                }
                self.compile_expr(*value)?;
                self.compile_expr(*slice)?;
                self.builder.emit(Opcode::BinarySubscr);
                Ok(())
            }
            Expr::Yield(ast::ExprYield { value, .. }) => {
                if matches!(self.scope, Scope::Module) {
                    return self.unsupported("'yield' outside function", range);
                }
                self.is_generator = true;
                match value {
                    Some(value) => self.compile_expr(*value)?,
                    None => self.load_const(Const::None),
                }
                self.builder.emit(Opcode::YieldValue);
                Ok(())
            }
            _ => self.unsupported("this expression", range),
        }
    }

    /// `a < b < c` evaluates `b` once and short-circuits like `a < b and b < c`.
    fn compile_compare(&mut self, left: Expr, ops: Vec<AstCmpOp>, comparators: Vec<Expr>) -> Result<(), CompileError> {
        self.compile_expr(left)?;
        let count = ops.len();
        let mut cleanups = Vec::new();
        for (i, (op, right)) in ops.into_iter().zip(comparators).enumerate() {
            self.compile_expr(right)?;
            let op = convert_compare_op(op);
            if i + 1 < count {
                self.builder.emit(Opcode::DupTop);
                self.builder.emit(Opcode::RotThree);
                self.builder.emit(Opcode::CompareOp(op));
                cleanups.push(self.builder.emit_jump(Opcode::JumpIfFalseOrPop(0)));
            } else {
                self.builder.emit(Opcode::CompareOp(op));
            }
        }
        if !cleanups.is_empty() {
            let end = self.builder.emit_jump(Opcode::Jump(0));
            for label in cleanups {
                self.builder.patch_jump(label);
            }
            self.builder.set_stack_depth(self.builder.stack_depth() + 1);
            self.builder.emit(Opcode::RotTwo);
            self.builder.emit(Opcode::PopTop);
            self.builder.patch_jump(end);
        }
        Ok(())
    }

    fn binary_operator(&self, op: Operator, range: TextRange) -> Result<BinOp, CompileError> {
        Ok(match op {
            Operator::Add => BinOp::Add,
            Operator::Sub => BinOp::Sub,
            Operator::Mult => BinOp::Mul,
            Operator::Div => BinOp::Div,
            Operator::FloorDiv => BinOp::FloorDiv,
            Operator::Mod => BinOp::Mod,
            Operator::Pow => BinOp::Pow,
            Operator::MatMult => BinOp::MatMul,
            _ => return self.unsupported("bitwise operators", range),
        })
    }

    fn load_const(&mut self, value: Const) {
        let index = self.builder.add_const(value);
        self.builder.emit(Opcode::LoadConst(index));
    }

    fn load_name(&mut self, name: &str) {
        match self.local_slot(name) {
            Some(slot) => self.builder.emit(Opcode::LoadFast(slot)),
            None => {
                let index = self.builder.add_name(name);
                self.builder.emit(Opcode::LoadGlobal(index));
            }
        }
    }

    fn store_name(&mut self, name: &str) {
        match self.local_slot(name) {
            Some(slot) => self.builder.emit(Opcode::StoreFast(slot)),
            None => {
                let index = self.builder.add_name(name);
                self.builder.emit(Opcode::StoreGlobal(index));
            }
        }
    }

    fn local_slot(&self, name: &str) -> Option<u16> {
        match &self.scope {
            Scope::Module => None,
            Scope::Function { locals } => locals.get_index_of(name).map(to_u16),
        }
    }
}

fn to_u16(n: usize) -> u16 {
    u16::try_from(n).expect("operand exceeds u16")
}

fn convert_compare_op(op: AstCmpOp) -> CmpOp {
    match op {
        AstCmpOp::Eq => CmpOp::Eq,
        AstCmpOp::NotEq => CmpOp::Ne,
        AstCmpOp::Lt => CmpOp::Lt,
        AstCmpOp::LtE => CmpOp::Le,
        AstCmpOp::Gt => CmpOp::Gt,
        AstCmpOp::GtE => CmpOp::Ge,
        AstCmpOp::Is => CmpOp::Is,
        AstCmpOp::IsNot => CmpOp::IsNot,
        AstCmpOp::In => CmpOp::In,
        AstCmpOp::NotIn => CmpOp::NotIn,
    }
}

/// Collects every name bound in a function body, in first-binding order.
fn collect_assigned(body: &[Stmt], locals: &mut IndexSet<String>) {
    fn target(expr: &Expr, locals: &mut IndexSet<String>) {
        match expr {
            Expr::Name(name) => {
                locals.insert(name.id.as_str().to_owned());
            }
            Expr::Tuple(tuple) => tuple.elts.iter().for_each(|e| target(e, locals)),
            _ => {}
        }
    }

    for stmt in body {
        match stmt {
            Stmt::Assign(assign) => assign.targets.iter().for_each(|t| target(t, locals)),
            Stmt::AugAssign(assign) => target(&assign.target, locals),
            Stmt::For(for_stmt) => {
                target(&for_stmt.target, locals);
                collect_assigned(&for_stmt.body, locals);
                collect_assigned(&for_stmt.orelse, locals);
            }
            Stmt::While(while_stmt) => {
                collect_assigned(&while_stmt.body, locals);
                collect_assigned(&while_stmt.orelse, locals);
            }
            Stmt::If(if_stmt) => {
                collect_assigned(&if_stmt.body, locals);
                for clause in &if_stmt.elif_else_clauses {
                    collect_assigned(&clause.body, locals);
                }
            }
            Stmt::Try(try_stmt) => {
                collect_assigned(&try_stmt.body, locals);
                for handler in &try_stmt.handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    if let Some(name) = &handler.name {
                        locals.insert(name.as_str().to_owned());
                    }
                    collect_assigned(&handler.body, locals);
                }
                collect_assigned(&try_stmt.orelse, locals);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function_code(program: &Program, name: &str) -> Arc<CodeUnit> {
        program
            .module()
            .consts()
            .iter()
            .find_map(|c| match c {
                Const::Code(code) if code.name() == name => Some(Arc::clone(code)),
                _ => None,
            })
            .expect("function not found")
    }

    #[test]
    fn locals_and_globals_are_resolved() {
        let program = compile("def f(a, b):\n    c = a + b\n    return g(c)\n", "test.py").unwrap();
        let code = function_code(&program, "f");
        assert_eq!(code.varnames(), &["a", "b", "c"]);
        assert_eq!(code.arg_count(), 2);
        assert_eq!(code.names(), &["g"]);
        assert!(!code.is_generator());
        assert_eq!(code.first_line(), 1);
    }

    #[test]
    fn generators_are_flagged() {
        let program = compile("def gen(n):\n    yield n\n", "test.py").unwrap();
        assert!(function_code(&program, "gen").is_generator());
    }

    #[test]
    fn unsupported_constructs_report_lines() {
        let err = compile("x = 1\ny = [x]\n", "test.py").unwrap_err();
        assert_eq!(err, CompileError::not_supported("this expression", 2));
        assert!(matches!(compile("def f(:\n", "test.py"), Err(CompileError::Syntax { .. })));
        assert!(compile("def f(a=1):\n    return a\n", "test.py").is_err());
    }

    #[test]
    fn jumps_are_patched() {
        let program = compile("def f(x):\n    if x:\n        return 1\n    return 2\n", "test.py").unwrap();
        let code = function_code(&program, "f");
        let jump = code.instructions()[1].opcode;
        assert_eq!(jump, Opcode::PopJumpIfFalse(4));
    }
}
