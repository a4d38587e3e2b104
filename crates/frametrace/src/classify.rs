//! Decides whether an intercepted frame is worth tracing.

use std::sync::Arc;

use ahash::AHashSet;

use crate::{
    bytecode::{CodeKind, CodeUnit},
    config::Config,
    error::{TraceError, TraceResult},
    eval_frame::CapturedFrame,
    state::TracerState,
    value::Value,
    vm::lookup_global,
};

/// How deep the tensor scan looks into containers and host objects.
const SCAN_DEPTH: usize = 8;

/// Outcome of classifying a frame.
#[derive(Debug)]
pub enum Classification {
    Trace,
    /// The code is the output of an earlier conversion.
    SkipAlreadyCompiled,
    /// Explicitly skipped, filtered by configuration, or disabled after a failure.
    SkipDenylisted,
    /// Nothing in the frame could end up in a graph.
    SkipNoCapturedValue,
    /// Tracing must not be attempted again until the state is reset.
    Fail(TraceError),
}

/// Applies the classification rules in order. Generators are `Unsupported`.
pub fn classify(state: &TracerState, config: &Config, frame: &CapturedFrame<'_>) -> TraceResult<Classification> {
    let code = frame.code();
    let flags = state.flags(code);
    if flags.output || code.kind() == CodeKind::Rewritten {
        return Ok(Classification::SkipAlreadyCompiled);
    }
    if flags.skip || is_filtered(config, code) {
        return Ok(Classification::SkipDenylisted);
    }
    if !flags.always_trace && !has_captured_value(frame) {
        return Ok(Classification::SkipNoCapturedValue);
    }
    if code.is_generator() {
        return Err(TraceError::Unsupported(format!("generator {}", code.describe())));
    }
    let limit = config.cache_size_limit;
    if state.cache_size(code) >= limit {
        return Ok(Classification::Fail(TraceError::CacheLimitExceeded {
            code: code.describe(),
            limit,
        }));
    }
    Ok(Classification::Trace)
}

fn is_filtered(config: &Config, code: &Arc<CodeUnit>) -> bool {
    if config
        .skip_filenames
        .iter()
        .any(|pattern| code.filename().contains(pattern.as_str()))
    {
        return true;
    }
    // continuations are filtered by the function they continue
    config
        .debug_function
        .as_ref()
        .is_some_and(|name| code.root().name() != name)
}

/// Whether a tensor is reachable from the locals, or the code reads a tensor
/// global or calls a builtin that creates one.
fn has_captured_value(frame: &CapturedFrame<'_>) -> bool {
    let mut scan = Scan::default();
    if frame.locals().iter().flatten().any(|value| scan.contains_tensor(value, 0)) {
        return true;
    }
    frame.code().names().iter().any(|name| match lookup_global(frame.globals(), name) {
        Some(Value::Builtin(builtin)) => builtin.creates_tensor(),
        Some(value) => scan.contains_tensor(&value, 0),
        None => false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Visited {
    Tuple(usize),
    Id(u64),
}

#[derive(Default)]
struct Scan {
    seen: AHashSet<Visited>,
}

impl Scan {
    fn contains_tensor(&mut self, value: &Value, depth: usize) -> bool {
        if depth > SCAN_DEPTH {
            return false;
        }
        match value {
            Value::Tensor(_) => true,
            Value::Tuple(items) => {
                self.first_visit(Visited::Tuple(items.as_ptr() as usize))
                    && items.iter().any(|item| self.contains_tensor(item, depth + 1))
            }
            Value::Dict(dict) => {
                self.first_visit(Visited::Id(dict.id()))
                    && dict.items().values().any(|item| self.contains_tensor(item, depth + 1))
            }
            Value::Object(obj) => {
                self.first_visit(Visited::Id(obj.id()))
                    && obj.attrs().iter().any(|(_, item)| self.contains_tensor(item, depth + 1))
            }
            _ => false,
        }
    }

    fn first_visit(&mut self, key: Visited) -> bool {
        self.seen.insert(key)
    }
}
