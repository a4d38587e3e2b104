//! Execution observers for the interpreter.
//!
//! `Vm` is generic over a [`VmTracer`], so the default [`NoopTracer`] costs
//! nothing. Observers see what actually runs: after a frame is converted they
//! see the rewritten code, its compiled graph calls and its continuations, not
//! the original instructions. They cannot change execution; substituting code
//! is the job of the interception hook in [`crate::eval_frame`].

use std::fmt;

use crate::bytecode::{CodeKind, Opcode};

/// One observed execution step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Instruction { ip: usize, opcode: Opcode, stack_depth: usize },
    /// A host function frame started running `kind` code.
    FrameEnter { name: String, kind: CodeKind, depth: usize },
    FrameExit { depth: usize },
    /// A raised exception landed in a `try` handler.
    Handler { depth: usize },
    /// Rewritten code called a compiled graph.
    GraphCall { graph: String, inputs: usize },
}

/// Observer hooks. Every hook defaults to doing nothing.
pub trait VmTracer: fmt::Debug {
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize) {}

    #[inline(always)]
    fn on_frame_enter(&mut self, _name: &str, _kind: CodeKind, _depth: usize) {}

    #[inline(always)]
    fn on_frame_exit(&mut self, _depth: usize) {}

    #[inline(always)]
    fn on_handler(&mut self, _depth: usize) {}

    #[inline(always)]
    fn on_graph_call(&mut self, _graph: &str, _inputs: usize) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Prints an indented execution log to stderr, up to an instruction budget.
///
/// ```text
/// -> f [rewritten]
///    0 LoadFast 0                 stack 0
///    1 LoadConst 2                stack 1
///   => __compiled_fn_0(1)
/// <-
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Instructions left to print; `None` is unlimited.
    budget: Option<usize>,
    depth: usize,
}

impl StderrTracer {
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            budget: Some(limit),
            depth: 0,
        }
    }

    fn exhausted(&self) -> bool {
        self.budget == Some(0)
    }

    fn indent(&self) -> usize {
        self.depth.saturating_sub(1) * 2
    }
}

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize) {
        if self.exhausted() {
            return;
        }
        let opcode = opcode.to_string();
        eprintln!("{:indent$}{ip:>4} {opcode:<28} stack {stack_depth}", "", indent = self.indent());
        if let Some(budget) = &mut self.budget {
            *budget -= 1;
            if *budget == 0 {
                eprintln!("(instruction log limit reached)");
            }
        }
    }

    fn on_frame_enter(&mut self, name: &str, kind: CodeKind, depth: usize) {
        self.depth = depth;
        if !self.exhausted() {
            let kind = match kind {
                CodeKind::Original => "",
                CodeKind::Rewritten => " [rewritten]",
                CodeKind::Resume => " [resume]",
            };
            eprintln!("{:indent$}-> {name}{kind}", "", indent = self.indent());
        }
    }

    fn on_frame_exit(&mut self, depth: usize) {
        if !self.exhausted() {
            eprintln!("{:indent$}<-", "", indent = self.indent());
        }
        self.depth = depth;
    }

    fn on_handler(&mut self, _depth: usize) {
        if !self.exhausted() {
            eprintln!("{:indent$}  !! handler", "", indent = self.indent());
        }
    }

    fn on_graph_call(&mut self, graph: &str, inputs: usize) {
        if !self.exhausted() {
            eprintln!("{:indent$}  => {graph}({inputs})", "", indent = self.indent());
        }
    }
}

/// Keeps every event. Backs the `trace_calls` builtin.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, TraceEvent::Instruction { .. }))
            .count()
    }

    /// Names of the compiled graphs called, in order.
    #[must_use]
    pub fn graph_calls(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TraceEvent::GraphCall { graph, .. } => Some(graph.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize) {
        self.events.push(TraceEvent::Instruction { ip, opcode, stack_depth });
    }

    fn on_frame_enter(&mut self, name: &str, kind: CodeKind, depth: usize) {
        self.events.push(TraceEvent::FrameEnter {
            name: name.to_owned(),
            kind,
            depth,
        });
    }

    fn on_frame_exit(&mut self, depth: usize) {
        self.events.push(TraceEvent::FrameExit { depth });
    }

    fn on_handler(&mut self, depth: usize) {
        self.events.push(TraceEvent::Handler { depth });
    }

    fn on_graph_call(&mut self, graph: &str, inputs: usize) {
        self.events.push(TraceEvent::GraphCall {
            graph: graph.to_owned(),
            inputs,
        });
    }
}
