use std::fmt;

use serde::Serialize;

use crate::dsl::error::{CompileError, InterpretError, RuntimeError};

/// Structured error type for the host. Serialises with a `code` tag so
/// `--json` output can be matched on mechanically.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "code", content = "detail")]
pub enum AppError {
    IoError { message: String },
    SettingsError { path: String, message: String },
    CompileError { errors: Vec<CompileError> },
    RuntimeError { error: RuntimeError },
}

impl AppError {
    /// Process exit status for this failure, following sysexits.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::CompileError { .. } => 65,
            AppError::RuntimeError { .. } => 70,
            AppError::IoError { .. } | AppError::SettingsError { .. } => 74,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::IoError { message } => write!(f, "I/O error: {message}"),
            AppError::SettingsError { path, message } => {
                write!(f, "Invalid settings file {path}: {message}")
            }
            AppError::CompileError { errors } => {
                let lines: Vec<String> = errors.iter().map(ToString::to_string).collect();
                write!(f, "{}", lines.join("\n"))
            }
            AppError::RuntimeError { error } => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::IoError {
            message: e.to_string(),
        }
    }
}

impl From<InterpretError> for AppError {
    fn from(e: InterpretError) -> Self {
        match e {
            InterpretError::Compile(errors) => AppError::CompileError { errors },
            InterpretError::Runtime(error) => AppError::RuntimeError { error },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::error::TraceFrame;

    #[test]
    fn json_is_tagged_by_code() {
        let err = AppError::IoError { message: "gone".into() };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "IoError");
        assert_eq!(json["detail"]["message"], "gone");
    }

    #[test]
    fn exit_codes() {
        let compile: AppError = InterpretError::Compile(vec![CompileError::lexer("bad", 1)]).into();
        assert_eq!(compile.exit_code(), 65);
        let runtime: AppError = InterpretError::Runtime(RuntimeError {
            message: "Stack overflow.".into(),
            trace: vec![TraceFrame { line: 1, function: None }],
        })
        .into();
        assert_eq!(runtime.exit_code(), 70);
        assert_eq!(runtime.to_string(), "Stack overflow.\n[line 1] in script");
        let io: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "nope").into();
        assert_eq!(io.exit_code(), 74);
    }
}
