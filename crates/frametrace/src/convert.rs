//! The frame converter: classify, trace, retry, install.
//!
//! [`ConvertFrame`] is the [`FrameCallback`] behind the optimize contexts. For a
//! frame that missed the cache it classifies the frame, traces it (restarting
//! with accumulated hints when an inlined call fails), and publishes the result
//! as a new cache entry. Failures the tracer can recover from leave the frame
//! to the interpreter; backend and internal failures propagate.

use std::{any::Any, collections::BTreeSet, sync::Arc};

use crate::{
    backend::{Backend, CompiledGraph},
    bytecode::CodeUnit,
    classify::{Classification, classify},
    config::Config,
    error::{RunResult, TraceError, TraceResult},
    eval_frame::{CapturedFrame, FrameCallback, FrameDecision},
    random::PreserveRngState,
    state::{CacheEntry, Cleanup, Event, TracerState},
    symbolic::{TraceRequest, Traced, trace_frame},
};

/// Attempts per conversion before giving up on a frame.
pub const MAX_RESTARTS: usize = 100;

/// Converts frames for an optimize context.
#[derive(Debug)]
pub struct ConvertFrame {
    state: Arc<TracerState>,
    backend: Arc<dyn Backend>,
    /// Every frame must become exactly one graph and every failure propagates.
    one_graph: bool,
}

impl ConvertFrame {
    /// Falls back to the original code on anything except backend and
    /// internal failures.
    #[must_use]
    pub fn new(state: Arc<TracerState>, backend: Arc<dyn Backend>) -> Self {
        Self {
            state,
            backend,
            one_graph: false,
        }
    }

    /// Requires one graph per frame and propagates every failure.
    #[must_use]
    pub fn new_assert(state: Arc<TracerState>, backend: Arc<dyn Backend>) -> Self {
        Self {
            state,
            backend,
            one_graph: true,
        }
    }

    /// The code to run for `frame`, or `None` for its own code.
    pub fn convert(&self, frame: &CapturedFrame<'_>) -> TraceResult<Option<Arc<CodeUnit>>> {
        let state = &self.state;
        state.record(Event::FrameSeen);
        let config = state.config();
        let code = frame.code();
        let err = match self.try_convert(&config, frame) {
            Ok(converted) => return Ok(converted),
            Err(err) => err,
        };
        match err {
            TraceError::SkipFrame(reason) => {
                log::debug!(target: "frametrace", "skipping {} this time: {reason}", code.describe());
                state.record(Event::Skipped);
                Ok(None)
            }
            err if self.one_graph => {
                report_failure(&config, code, &err);
                Err(err)
            }
            TraceError::CacheLimitExceeded { limit, .. } => {
                let reason = state
                    .last_guard_failure(code)
                    .unwrap_or_else(|| "no guard failure recorded".to_owned());
                log::warn!(
                    target: "frametrace",
                    "{} hit the cache size limit ({limit}); last guard failure: {reason}. Running it uncompiled",
                    code.describe()
                );
                state.mark_skip(code);
                Ok(None)
            }
            err @ TraceError::DataDependent(_) => {
                report_failure(&config, code, &err);
                state.record(Event::Unsupported);
                Ok(None)
            }
            err @ (TraceError::Unsupported(_) | TraceError::RestartAnalysis(_)) => {
                report_failure(&config, code, &err);
                state.record(Event::Unsupported);
                state.mark_skip(code);
                Ok(None)
            }
            err @ TraceError::BackendCompilerFailed { .. } if !config.raise_on_backend_error => {
                report_failure(&config, code, &err);
                Ok(None)
            }
            err => {
                report_failure(&config, code, &err);
                Err(err)
            }
        }
    }

    fn try_convert(&self, config: &Config, frame: &CapturedFrame<'_>) -> TraceResult<Option<Arc<CodeUnit>>> {
        let state = &self.state;
        let code = frame.code();
        let classification = classify(state, config, frame)?;
        match classification {
            Classification::Trace => {}
            Classification::Fail(err) => return Err(err),
            skip => {
                log::debug!(target: "frametrace", "not tracing {}: {skip:?}", code.describe());
                return Ok(None);
            }
        }

        let _compiling = state.compile_lock();
        // another thread may have converted the same call site meanwhile
        if let Some(converted) = state.recheck(frame) {
            return Ok(Some(converted));
        }
        state.mark_input(code);
        let _rng = PreserveRngState::new();
        log::info!(
            target: "frametrace",
            "ORIGINAL BYTECODE {}\n{}",
            code.describe(),
            code.disassemble()
        );

        let traced = self.trace_with_restarts(config, frame)?;
        log::info!(
            target: "frametrace",
            "MODIFIED BYTECODE {}\n{}",
            code.describe(),
            traced.code.disassemble()
        );
        log::info!(target: "frametrace", "GUARDS\n{}", traced.guards);

        let Traced {
            code: rewritten,
            guards,
            graphs,
            ..
        } = traced;
        let cleanup = unregister_graphs(state, &graphs);
        let entry = CacheEntry::new(Arc::clone(&rewritten), guards, graphs).with_cleanup(cleanup);
        state.mark_output(&rewritten);
        state.install(code, entry);
        state.record(Event::FrameConverted);
        Ok(Some(rewritten))
    }

    fn trace_with_restarts(&self, config: &Config, frame: &CapturedFrame<'_>) -> TraceResult<Traced> {
        let req = TraceRequest {
            state: &self.state,
            backend: self.backend.as_ref(),
            config,
            frame: *frame,
            one_graph: self.one_graph,
            export: false,
        };
        let mut hints = BTreeSet::new();
        for attempt in 1..=MAX_RESTARTS {
            match trace_frame(&req, &mut hints) {
                Err(TraceError::RestartAnalysis(reason)) => {
                    self.state.record(Event::Restart);
                    log::debug!(
                        target: "frametrace",
                        "restarting analysis of {} (attempt {attempt}): {reason}",
                        frame.code().describe()
                    );
                }
                done => return done,
            }
        }
        Err(TraceError::Unsupported(format!("too many restarts ({MAX_RESTARTS})")))
    }
}

impl FrameCallback for ConvertFrame {
    fn state(&self) -> &Arc<TracerState> {
        &self.state
    }

    fn on_frame(&self, frame: &CapturedFrame<'_>) -> RunResult<FrameDecision> {
        Ok(match self.convert(frame)? {
            Some(code) => FrameDecision::Replace(code),
            None => FrameDecision::Default,
        })
    }

    fn context(&self) -> Option<Box<dyn Any>> {
        self.backend.context()
    }
}

/// Drops the entry's graphs from the registry when the entry is discarded.
fn unregister_graphs(state: &Arc<TracerState>, graphs: &[Arc<CompiledGraph>]) -> Cleanup {
    let state = Arc::downgrade(state);
    let names: Vec<String> = graphs.iter().map(|graph| graph.name().to_owned()).collect();
    Box::new(move || {
        if let Some(state) = state.upgrade() {
            for name in &names {
                state.unregister_graph(name);
            }
        }
    })
}

fn report_failure(config: &Config, code: &CodeUnit, err: &TraceError) {
    if config.verbose {
        log::error!(
            target: "frametrace",
            "WON'T CONVERT {} {} line {}\n{err:?}\n{}",
            code.name(),
            code.filename(),
            code.first_line(),
            code.disassemble()
        );
    } else {
        log::error!(
            target: "frametrace",
            "WON'T CONVERT {} {} line {}: {err}",
            code.name(),
            code.filename(),
            code.first_line()
        );
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        backend::CompileCounter,
        bytecode::compile,
        io::NoPrint,
        tensor::{DType, Tensor},
        tracer::NoopTracer,
        value::{Globals, Value},
        vm::Vm,
    };

    fn setup(source: &str, config: Config) -> (Arc<TracerState>, Arc<CompileCounter>, Globals) {
        let program = compile(source, "model.py").unwrap();
        let globals = Vm::new(&mut NoPrint, NoopTracer).run_program(&program).unwrap();
        (TracerState::new(config), Arc::new(CompileCounter::new()), globals)
    }

    fn convert(converter: &ConvertFrame, globals: &Globals, name: &str, x: Tensor) -> TraceResult<Option<Arc<CodeUnit>>> {
        let code = match &globals.borrow()[name] {
            Value::Function(f) => Arc::clone(f.code()),
            other => panic!("{name} is {other:?}"),
        };
        let mut locals = vec![Some(Value::Tensor(x))];
        locals.resize(code.varnames().len(), None);
        converter.convert(&CapturedFrame::new(&code, &locals, globals))
    }

    fn x() -> Tensor {
        Tensor::full(&[4], 2.0, DType::Float32)
    }

    #[test]
    fn installs_an_entry_and_marks_its_code() {
        let (state, counter, globals) = setup("def f(x):\n    return x.relu() + 1\n", Config::default());
        let converter = ConvertFrame::new(Arc::clone(&state), counter.clone());
        let code = convert(&converter, &globals, "f", x()).unwrap().unwrap();
        assert!(state.is_output(&code));
        assert_eq!(state.stats().frames_converted, 1);
        assert_eq!(counter.frame_count(), 1);
        assert_eq!(state.graphs().len(), 1);

        state.reset();
        assert!(state.graphs().is_empty());
    }

    #[test]
    fn unsupported_frames_fall_back_and_are_skipped() {
        let source = "def f(x):\n    try:\n        print(x)\n    except ValueError:\n        pass\n    return x + 1\n";
        let (state, counter, globals) = setup(source, Config::default());
        let converter = ConvertFrame::new(Arc::clone(&state), counter.clone());
        assert!(convert(&converter, &globals, "f", x()).unwrap().is_none());
        assert_eq!(state.stats().unsupported, 1);
        let code = match &globals.borrow()["f"] {
            Value::Function(f) => Arc::clone(f.code()),
            other => panic!("f is {other:?}"),
        };
        assert!(state.is_skipped(&code));
        assert_eq!(counter.frame_count(), 0);
    }

    #[test]
    fn assert_mode_propagates_breaks() {
        let (state, counter, globals) = setup("def f(x):\n    print(x)\n    return x + 1\n", Config::default());
        let converter = ConvertFrame::new_assert(Arc::clone(&state), counter);
        let err = convert(&converter, &globals, "f", x()).unwrap_err();
        assert!(matches!(err, TraceError::Unsupported(_)), "{err}");
    }

    #[test]
    fn restarts_are_counted() {
        let source = "def g(x):\n    print(x)\n    return x\n\ndef f(x):\n    return g(x * 2) + 1\n";
        let (state, counter, globals) = setup(source, Config::default());
        let converter = ConvertFrame::new(Arc::clone(&state), counter.clone());
        assert!(convert(&converter, &globals, "f", x()).unwrap().is_some());
        assert_eq!(state.stats().restarts, 1);
        assert_eq!(counter.op_count(), 1);
    }
}
