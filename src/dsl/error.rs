use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::value::ElementType;

/// A compilation error with source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("[line {line}] Error{location}: {message}")]
pub struct CompileError {
    pub message: String,
    pub line: usize,
    /// Pre-rendered location suffix: `" at 'tok'"`, `" at end"`, or empty.
    pub location: String,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Lexer,
    Parser,
    Compiler,
}

impl CompileError {
    pub fn lexer(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
            location: String::new(),
            kind: ErrorKind::Lexer,
        }
    }

    pub fn parser(message: impl Into<String>, line: usize, location: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line,
            location: location.into(),
            kind: ErrorKind::Parser,
        }
    }

    pub fn compiler(message: impl Into<String>, line: usize, location: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line,
            location: location.into(),
            kind: ErrorKind::Compiler,
        }
    }
}

/// One line of a runtime stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceFrame {
    pub line: usize,
    /// `None` for the top-level script.
    pub function: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime failure, with the call stack captured at the point of failure
/// (innermost frame first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    /// The source line of the innermost frame, if any frame was active.
    pub fn line(&self) -> Option<usize> {
        self.trace.first().map(|frame| frame.line)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Failures raised by array operations. The VM wraps these into
/// [`RuntimeError`]s carrying the call stack.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("Shape mismatch: {left:?} and {right:?}.")]
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },
    #[error("Cannot store {found} element in {expected} array.")]
    TypeMismatch { expected: ElementType, found: ElementType },
    #[error("Operands must be numeric, got {0} array.")]
    NotNumeric(ElementType),
    #[error("Operator '{op}' is not supported on {ty} arrays.")]
    Unsupported { op: &'static str, ty: ElementType },
    #[error("Cannot compare {left} array with {right} array.")]
    Incomparable { left: ElementType, right: ElementType },
    #[error("Index {index} out of range for array of {count} elements.")]
    IndexOutOfRange { index: i64, count: usize },
    #[error("Index must be a whole number, got {0}.")]
    FractionalIndex(f64),
    #[error("Condition must have exactly one element, got {0}.")]
    NotSingle(usize),
    #[error("Array has no element type.")]
    Untyped,
}

/// Everything `Vm::interpret` can fail with.
#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("{}", render_compile_errors(.0))]
    Compile(Vec<CompileError>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<Vec<CompileError>> for InterpretError {
    fn from(errors: Vec<CompileError>) -> Self {
        InterpretError::Compile(errors)
    }
}

fn render_compile_errors(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Coarse outcome of one interpretation, as reported to a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl From<&Result<(), InterpretError>> for InterpretResult {
    fn from(result: &Result<(), InterpretError>) -> Self {
        match result {
            Ok(()) => InterpretResult::Ok,
            Err(InterpretError::Compile(_)) => InterpretResult::CompileError,
            Err(InterpretError::Runtime(_)) => InterpretResult::RuntimeError,
        }
    }
}
