#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "offsets and slots are bounded by code size")]
#![expect(clippy::cast_sign_loss, reason = "indices are normalized before narrowing")]
#![expect(clippy::cast_possible_wrap, reason = "lengths fit in host ints")]

mod backend;
pub mod bytecode;
mod classify;
mod config;
mod convert;
mod error;
mod eval_frame;
mod export;
pub mod graph;
mod guards;
mod io;
mod logging;
mod random;
mod state;
mod symbolic;
mod tensor;
pub mod tracer;
mod value;
mod vm;

pub use crate::{
    backend::{Backend, CapturingBackend, CompileCounter, CompiledFn, CompiledGraph, Eager},
    bytecode::{CodeKind, CodeUnit, Program, compile},
    classify::{Classification, classify},
    config::{Config, ConfigError, ENV_PREFIX, LogLevel, OPTION_NAMES},
    convert::{ConvertFrame, MAX_RESTARTS},
    error::{BackendError, CompileError, ExcType, Exception, RunError, RunResult, TraceError, TraceResult},
    eval_frame::{
        CapturedFrame, DisableContext, EvalMode, FrameCallback, FrameDecision, ModeScope, OptimizeContext,
        RunOnlyContext, current_mode, disable, intercept, optimize, optimize_assert, run, skip,
    },
    export::{ExportedProgram, TreeSpec, export},
    graph::Graph,
    guards::{Guard, GuardKind, GuardSet, Literal, Source},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    logging::init_logging,
    random::{PreserveRngState, RngState, get_rng_state, manual_seed, randn, set_rng_state},
    state::{CacheEntry, Cleanup, CodeFlags, CodeHandle, Event, Stats, TracerState},
    tensor::{DType, Scalar, Shape, Tensor, TensorError},
    tracer::{NoopTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    value::{Dict, Function, Globals, Object, Range, Value, new_globals},
    vm::{Builtin, DEFAULT_MAX_RECURSION_DEPTH, TensorMethod, Vm, lookup_builtin, lookup_global},
};
