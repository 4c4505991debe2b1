//=====================================================
// File: interpreter/errors.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Runtime error taxonomy of the interpreter
// Objective: Runtime errors, control-flow signals and their stable error codes
//=====================================================

use super::Value;
use crate::outcome::ViolationRule;
use crate::parser::ParseError;
use serde::Serialize;
use thiserror::Error;

/// Errors and control-flow signals raised while evaluating a script.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("Variable '{0}' not found")]
    VariableNotFound(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("Argument error: {0}")]
    ArgumentError(String),
    #[error("Index error: {0}")]
    IndexError(String),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Integer overflow")]
    Overflow,
    #[error("Stack overflow")]
    StackOverflow,
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("{0}")]
    Custom(String),
    /// A hook refused the operation.
    #[error("security violation: {0}")]
    Security(ViolationRule),
    /// The session's interrupt flag was observed.
    #[error("execution interrupted")]
    Interrupted,
    #[error("Return: {0}")]
    Return(Value),
    #[error("Break statement outside loop")]
    Break,
    #[error("Continue statement outside loop")]
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    Syntax,
    NameResolution,
    TypeMismatch,
    InvalidOperation,
    RuntimePanic,
    Security,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Syntax => "E001",
            ErrorCode::NameResolution => "E002",
            ErrorCode::TypeMismatch => "E003",
            ErrorCode::InvalidOperation => "E004",
            ErrorCode::RuntimePanic => "E005",
            ErrorCode::Security => "E006",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptError {
    pub code: ErrorCode,
    pub message: String,
}

impl ScriptError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }
}

impl From<ParseError> for ScriptError {
    fn from(value: ParseError) -> Self {
        ScriptError::new(ErrorCode::Syntax, value.to_string())
    }
}

impl From<RuntimeError> for ScriptError {
    fn from(value: RuntimeError) -> Self {
        ScriptError::new(runtime_error_code(&value), value.to_string())
    }
}

pub fn runtime_error_code(error: &RuntimeError) -> ErrorCode {
    match error {
        RuntimeError::VariableNotFound(_) => ErrorCode::NameResolution,
        RuntimeError::TypeError(_) => ErrorCode::TypeMismatch,
        RuntimeError::ArgumentError(_)
        | RuntimeError::IndexError(_)
        | RuntimeError::DivisionByZero
        | RuntimeError::Overflow
        | RuntimeError::InvalidOperation(_) => ErrorCode::InvalidOperation,
        RuntimeError::Security(_) => ErrorCode::Security,
        RuntimeError::StackOverflow
        | RuntimeError::Custom(_)
        | RuntimeError::Interrupted
        | RuntimeError::Return(_)
        | RuntimeError::Break
        | RuntimeError::Continue => ErrorCode::RuntimePanic,
    }
}


//=====================================================
// End of file
//=====================================================
