//! Frame interception and execution contexts.
//!
//! Every host function call passes its frame to [`intercept`] before the frame
//! starts running. What happens then depends on the mode active on the calling
//! thread:
//!
//! | Mode | Behavior |
//! |------|----------|
//! | [`EvalMode::Disabled`] | run the code unmodified |
//! | [`EvalMode::RunOnly`] | reuse a cached conversion when its guards pass, never convert |
//! | [`EvalMode::Optimize`] | reuse a cached conversion, otherwise ask the callback to convert |
//!
//! Modes are switched with RAII scopes ([`ModeScope`]) that restore the previous
//! mode when dropped, and with function wrappers created by the contexts below.
//! The callback itself always runs with interception disabled.

use std::{
    any::Any,
    cell::RefCell,
    fmt,
    rc::Rc,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    backend::Backend,
    bytecode::CodeUnit,
    convert::ConvertFrame,
    error::RunResult,
    logging::init_logging,
    state::TracerState,
    value::{Globals, Value, Wrapped},
};

thread_local! {
    static MODE: RefCell<EvalMode> = RefCell::new(EvalMode::Disabled);
}

static SETUP: Once = Once::new();
static INTROSPECTION_DISABLED: AtomicBool = AtomicBool::new(false);

/// The interception mode of a thread.
#[derive(Clone, Default)]
pub enum EvalMode {
    #[default]
    Disabled,
    RunOnly(Arc<TracerState>),
    Optimize(Arc<dyn FrameCallback>),
}

impl fmt::Debug for EvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::RunOnly(_) => f.write_str("RunOnly"),
            Self::Optimize(_) => f.write_str("Optimize"),
        }
    }
}

/// The mode active on the current thread.
#[must_use]
pub fn current_mode() -> EvalMode {
    MODE.with(|mode| mode.borrow().clone())
}

/// Activates a mode until dropped, then restores the previous one.
#[must_use = "the mode is only active while the scope is held"]
pub struct ModeScope {
    previous: Option<EvalMode>,
    _context: Option<Box<dyn Any>>,
}

impl ModeScope {
    pub fn enter(mode: EvalMode) -> Self {
        let context = match &mode {
            EvalMode::Optimize(callback) => callback.context(),
            EvalMode::Disabled | EvalMode::RunOnly(_) => None,
        };
        let previous = MODE.with(|current| current.replace(mode));
        Self {
            previous: Some(previous),
            _context: context,
        }
    }
}

impl Drop for ModeScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            MODE.with(|current| *current.borrow_mut() = previous);
        }
    }
}

impl fmt::Debug for ModeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeScope").field("previous", &self.previous).finish_non_exhaustive()
    }
}

/// A frame about to run, valid for one interception.
#[derive(Debug, Clone, Copy)]
pub struct CapturedFrame<'a> {
    code: &'a Arc<CodeUnit>,
    locals: &'a [Option<Value>],
    globals: &'a Globals,
}

impl<'a> CapturedFrame<'a> {
    #[must_use]
    pub fn new(code: &'a Arc<CodeUnit>, locals: &'a [Option<Value>], globals: &'a Globals) -> Self {
        Self { code, locals, globals }
    }

    #[must_use]
    pub fn code(&self) -> &'a Arc<CodeUnit> {
        self.code
    }

    /// One slot per varname; arguments first, the rest unbound.
    #[must_use]
    pub fn locals(&self) -> &'a [Option<Value>] {
        self.locals
    }

    #[must_use]
    pub fn globals(&self) -> &'a Globals {
        self.globals
    }

    /// The value of a bound local by name.
    #[must_use]
    pub fn local(&self, name: &str) -> Option<&'a Value> {
        let slot = self.code.tables().varname_slot(name)?;
        self.locals.get(usize::from(slot))?.as_ref()
    }
}

/// What to run for an intercepted frame.
#[derive(Debug, Clone)]
pub enum FrameDecision {
    /// The frame's own code.
    Default,
    Replace(Arc<CodeUnit>),
}

/// Handles frames that missed the cache in optimize mode.
pub trait FrameCallback: Send + Sync {
    fn state(&self) -> &Arc<TracerState>;

    /// Decides what to run. Errors cross the interception boundary as is.
    fn on_frame(&self, frame: &CapturedFrame<'_>) -> RunResult<FrameDecision>;

    /// Value held for the lifetime of an optimize scope.
    fn context(&self) -> Option<Box<dyn Any>> {
        None
    }
}

/// The interception hook, called by the interpreter before every host
/// function frame. `None` runs the frame's own code.
pub fn intercept(frame: &CapturedFrame<'_>) -> RunResult<Option<Arc<CodeUnit>>> {
    match current_mode() {
        EvalMode::Disabled => Ok(None),
        EvalMode::RunOnly(state) => Ok(state.lookup(frame)),
        EvalMode::Optimize(callback) => {
            if let Some(code) = callback.state().lookup(frame) {
                return Ok(Some(code));
            }
            let _scope = ModeScope::enter(EvalMode::Disabled);
            match callback.on_frame(frame)? {
                FrameDecision::Default => Ok(None),
                FrameDecision::Replace(code) => Ok(Some(code)),
            }
        }
    }
}

/// Disables interception while held, once an optimize context has been
/// entered in this process. Used by introspection builtins.
pub(crate) fn introspection_scope() -> Option<ModeScope> {
    INTROSPECTION_DISABLED
        .load(Ordering::Acquire)
        .then(|| ModeScope::enter(EvalMode::Disabled))
}

/// One-time process setup performed by the first optimize context.
fn setup_once(state: &TracerState) {
    SETUP.call_once(|| {
        init_logging(state.config().log_level);
        INTROSPECTION_DISABLED.store(true, Ordering::Release);
        log::debug!(target: "frametrace", "frame interception initialized");
    });
}

fn wrap_value(mode: EvalMode, f: &Value) -> Value {
    Value::Wrapped(Rc::new(Wrapped {
        mode,
        inner: f.clone(),
    }))
}

/// The user-written code behind a callable, looking through wrappers.
fn function_code(f: &Value) -> Option<Arc<CodeUnit>> {
    match f {
        Value::Function(func) => Some(Arc::clone(func.code())),
        Value::Wrapped(wrapped) => function_code(&wrapped.inner),
        _ => None,
    }
}

/// Converts and caches frames while entered.
#[derive(Clone)]
pub struct OptimizeContext {
    callback: Arc<dyn FrameCallback>,
}

impl OptimizeContext {
    #[must_use]
    pub fn new(callback: Arc<dyn FrameCallback>) -> Self {
        Self { callback }
    }

    pub fn enter(&self) -> ModeScope {
        setup_once(self.callback.state());
        ModeScope::enter(EvalMode::Optimize(Arc::clone(&self.callback)))
    }

    /// Wraps `f` so that calling it runs in this context. `f`'s code is
    /// traced even when no tensor reaches it.
    #[must_use]
    pub fn wrap(&self, f: &Value) -> Value {
        setup_once(self.callback.state());
        if let Some(code) = function_code(f) {
            self.callback.state().mark_always_trace(&code);
        }
        wrap_value(EvalMode::Optimize(Arc::clone(&self.callback)), f)
    }
}

impl fmt::Debug for OptimizeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizeContext").finish_non_exhaustive()
    }
}

/// Reuses cached conversions without creating new ones.
#[derive(Debug, Clone)]
pub struct RunOnlyContext {
    state: Arc<TracerState>,
}

impl RunOnlyContext {
    pub fn enter(&self) -> ModeScope {
        ModeScope::enter(EvalMode::RunOnly(Arc::clone(&self.state)))
    }

    #[must_use]
    pub fn wrap(&self, f: &Value) -> Value {
        wrap_value(EvalMode::RunOnly(Arc::clone(&self.state)), f)
    }
}

/// Runs everything unmodified.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisableContext;

impl DisableContext {
    pub fn enter(self) -> ModeScope {
        ModeScope::enter(EvalMode::Disabled)
    }

    #[must_use]
    pub fn wrap(self, f: &Value) -> Value {
        wrap_value(EvalMode::Disabled, f)
    }
}

/// Optimize with `backend`, falling back to the original code on anything
/// the tracer cannot handle.
#[must_use]
pub fn optimize(state: &Arc<TracerState>, backend: Arc<dyn Backend>) -> OptimizeContext {
    OptimizeContext::new(Arc::new(ConvertFrame::new(Arc::clone(state), backend)))
}

/// Optimize with `backend`, requiring every converted frame to become exactly
/// one graph. Any failure propagates to the caller.
#[must_use]
pub fn optimize_assert(state: &Arc<TracerState>, backend: Arc<dyn Backend>) -> OptimizeContext {
    OptimizeContext::new(Arc::new(ConvertFrame::new_assert(Arc::clone(state), backend)))
}

#[must_use]
pub fn run(state: &Arc<TracerState>) -> RunOnlyContext {
    RunOnlyContext {
        state: Arc::clone(state),
    }
}

#[must_use]
pub fn disable() -> DisableContext {
    DisableContext
}

/// Never traces `f`'s code. Returns `f` for chaining.
pub fn skip(state: &TracerState, f: &Value) -> Value {
    if let Some(code) = function_code(f) {
        state.mark_skip(&code);
    }
    f.clone()
}
