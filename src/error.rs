//! Error handling.
//!
//! Compile errors carry a message and the offending source line. Runtime
//! errors carry a message, an optional value attached by `die()` and the
//! source positions of the frames that were live when the error was raised.
//!
//! Errors are ordinary `Result` values; the interpreter propagates them with
//! `?` up to the nearest call boundary where the host observes them.
use std::fmt;

use crate::runtime::value::Value;

/// Builds a [`RuntimeError`] with a formatted message and returns it from the
/// current function.
#[macro_export]
macro_rules! throw {
    ($msg:literal $(,)? $($arg:expr),*) => {
        return Err($crate::error::RuntimeError::new(format!($msg, $($arg),*)))
    };
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileError {
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            file: String::new(),
            line,
            message: message.into(),
        }
    }

    pub(crate) fn in_file(mut self, file: &str) -> Self {
        self.file = file.to_owned();
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "parse error: {} at line {}", self.message, self.line)
        } else {
            write!(
                f,
                "parse error: {} in {}, line {}",
                self.message, self.file, self.line
            )
        }
    }
}

impl std::error::Error for CompileError {}

/// One entry of a runtime error's trace, innermost frame first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceFrame {
    pub file: String,
    pub line: u32,
}

#[derive(Clone, Debug)]
pub struct RuntimeError {
    pub message: String,
    /// Argument passed to `die()`, nil otherwise.
    pub value: Value,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            value: Value::Nil,
            trace: Vec::new(),
        }
    }

    pub fn with_value(message: impl Into<String>, value: Value) -> Self {
        Self {
            message: message.into(),
            value,
            trace: Vec::new(),
        }
    }

    /// Source position of the innermost frame, if any frame was live.
    pub fn location(&self) -> Option<&TraceFrame> {
        self.trace.first()
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location() {
            Some(at) => write!(f, "{} at {}, line {}", self.message, at.file, at.line),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[derive(Clone, Debug)]
pub enum Error {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Self {
        Error::Compile(e)
    }
}

impl From<RuntimeError> for Error {
    fn from(e: RuntimeError) -> Self {
        Error::Runtime(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Compile(e) => e.fmt(f),
            Error::Runtime(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

pub type RtResult<T = Value> = Result<T, RuntimeError>;
