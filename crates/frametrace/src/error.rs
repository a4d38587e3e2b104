//! Error taxonomy for the host runtime and the tracing engine.
//!
//! Host-language failures are [`Exception`]s and can be caught by `try`
//! blocks. Engine failures are [`TraceError`]s. Most of them are handled
//! inside the frame converter by falling back to the original code; only
//! [`TraceError::BackendCompilerFailed`], [`TraceError::Internal`] and
//! [`TraceError::Export`] ever reach a caller, wrapped in [`RunError::Trace`].

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Result type alias for tracing-engine operations.
pub type TraceResult<T> = Result<T, TraceError>;

/// Error produced by a backend while compiling a graph.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Host exception types supported by the interpreter.
///
/// Uses strum derives for `Display`, `FromStr` and `Into<&'static str>`; the
/// string form matches the variant name, which is also the name `except`
/// clauses use in source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcType {
    /// Base class, matches every exception in `except` clauses.
    Exception,
    AttributeError,
    IndexError,
    KeyError,
    NameError,
    /// Subclass of NameError - for reading a local before assignment.
    UnboundLocalError,
    NotImplementedError,
    RecursionError,
    RuntimeError,
    StopIteration,
    TypeError,
    ValueError,
    ZeroDivisionError,
}

impl ExcType {
    /// Returns true if an `except self:` clause catches an exception of type `raised`.
    #[must_use]
    pub fn catches(self, raised: Self) -> bool {
        match self {
            Self::Exception => true,
            Self::NameError => matches!(raised, Self::NameError | Self::UnboundLocalError),
            Self::RuntimeError => matches!(
                raised,
                Self::RuntimeError | Self::RecursionError | Self::NotImplementedError
            ),
            other => other == raised,
        }
    }

    /// Builds an `Err` carrying a new exception of this type.
    pub(crate) fn raise<T>(self, message: impl Into<String>) -> RunResult<T> {
        Err(Exception::new(self, message).into())
    }
}

/// A host-language exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    exc_type: ExcType,
    message: String,
}

impl Exception {
    #[must_use]
    pub fn new(exc_type: ExcType, message: impl Into<String>) -> Self {
        Self {
            exc_type,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.exc_type)
        } else {
            write!(f, "{}: {}", self.exc_type, self.message)
        }
    }
}

impl std::error::Error for Exception {}

/// Failure categories of the tracing engine.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// The tracer cannot represent a construct. Drives graph breaks or a frame skip.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Tracing must start over from the first instruction.
    #[error("restart analysis: {0}")]
    RestartAnalysis(String),
    /// The values of this call make tracing fail, such as a host error while
    /// folding or an operation that fails on these shapes. The original code
    /// runs and raises the real error; other inputs may still trace.
    #[error("unsupported for these inputs: {0}")]
    DataDependent(String),
    /// Tracing of this one call was abandoned; the original code runs.
    #[error("skip frame: {0}")]
    SkipFrame(String),
    /// The pluggable compiler raised or produced wrong results.
    #[error("backend compiler `{backend}` failed: {source}")]
    BackendCompilerFailed {
        backend: String,
        #[source]
        source: BackendError,
    },
    /// A call site reached `cache_size_limit` entries.
    #[error("cache size limit ({limit}) reached for {code}")]
    CacheLimitExceeded { code: String, limit: usize },
    /// Whole-program capture did not produce exactly one graph.
    #[error("export failed: {0}")]
    Export(String),
    /// Unexpected failure inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TraceError {
    /// Whether the converter handles this failure by running the original code.
    #[must_use]
    pub fn falls_back(&self) -> bool {
        matches!(
            self,
            Self::Unsupported(_)
                | Self::DataDependent(_)
                | Self::RestartAnalysis(_)
                | Self::SkipFrame(_)
                | Self::CacheLimitExceeded { .. }
        )
    }
}

/// Error that can cross an interpreter call boundary.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A host exception, catchable by `try`.
    #[error("{0}")]
    Exc(Exception),
    /// An engine failure surfaced through the interception hook. Not catchable.
    #[error(transparent)]
    Trace(#[from] TraceError),
}

impl RunError {
    /// Returns the host exception if this error is catchable by host code.
    #[must_use]
    pub fn as_exception(&self) -> Option<&Exception> {
        match self {
            Self::Exc(exc) => Some(exc),
            Self::Trace(_) => None,
        }
    }

    /// Returns the host exception type, if any.
    #[must_use]
    pub fn exc_type(&self) -> Option<ExcType> {
        self.as_exception().map(Exception::exc_type)
    }
}

impl From<Exception> for RunError {
    fn from(exc: Exception) -> Self {
        Self::Exc(exc)
    }
}

/// Error raised while compiling source into code units.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// The source could not be parsed.
    #[error("SyntaxError: {message} (line {line})")]
    Syntax { message: String, line: u32 },
    /// The source parsed but uses a construct the compiler does not handle.
    #[error("NotImplementedError: {message} (line {line})")]
    NotSupported { message: String, line: u32 },
}

impl CompileError {
    pub(crate) fn not_supported(message: impl Into<String>, line: u32) -> Self {
        Self::NotSupported {
            message: message.into(),
            line,
        }
    }
}
