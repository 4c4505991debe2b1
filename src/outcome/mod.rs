//=====================================================
// File: outcome/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Classify how a batch ended
// Objective: Turn interpreter results, compile errors and scheduler failures
//            into exactly one caller-facing outcome per batch
//=====================================================

use crate::interpreter::{ErrorCode, RuntimeError, Value, runtime_error_code};
use crate::parser::ParseError;
use crate::session::UsageSnapshot;
use crate::whitelist::MemberKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Which rule a script broke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ViolationRule {
    UndeclaredOperation {
        owner: String,
        member: String,
        kind: MemberKind,
    },
    CapExceeded {
        owner: String,
        member: String,
        cap: u64,
    },
    TotalOperationCap {
        cap: u64,
    },
    LoopCap {
        cap: u64,
    },
    UnauthorizedPrivilegedSession {
        identity: String,
    },
}

impl fmt::Display for ViolationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationRule::UndeclaredOperation { owner, member, .. } => {
                write!(f, "undeclared operation {}.{}", owner, member)
            }
            ViolationRule::CapExceeded { owner, member, cap } => {
                write!(f, "{}.{} called more than {} times", owner, member, cap)
            }
            ViolationRule::TotalOperationCap { cap } => {
                write!(f, "more than {} operations", cap)
            }
            ViolationRule::LoopCap { cap } => write!(f, "more than {} loop iterations", cap),
            ViolationRule::UnauthorizedPrivilegedSession { identity } => {
                write!(f, "'{}' may not run privileged scripts", identity)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub rule: ViolationRule,
    pub message: String,
    pub unit: Option<String>,
}

impl Violation {
    pub fn new(rule: ViolationRule, unit: Option<&str>) -> Self {
        Self {
            message: rule.to_string(),
            rule,
            unit: unit.map(str::to_string),
        }
    }
}

/// One positioned compiler message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl From<&ParseError> for CompileError {
    fn from(error: &ParseError) -> Self {
        let position = error.position();
        Self {
            diagnostics: vec![Diagnostic {
                line: position.line,
                column: position.column,
                message: error.message(),
            }],
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{}:{}: {}",
                diagnostic.line, diagnostic.column, diagnostic.message
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    Compile(CompileError),
    Runtime { code: ErrorCode, message: String },
    /// A condition script produced something other than a boolean.
    NotBoolean { type_name: String },
    PoolSaturated,
    WorkerPanicked { message: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Compile(error) => write!(f, "compile error: {}", error),
            FailureCause::Runtime { code, message } => write!(f, "[{}] {}", code.as_str(), message),
            FailureCause::NotBoolean { type_name } => {
                write!(f, "condition returned {} instead of Bool", type_name)
            }
            FailureCause::PoolSaturated => write!(f, "no script worker available"),
            FailureCause::WorkerPanicked { message } => write!(f, "script worker crashed: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub cause: FailureCause,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeoutNotice {
    pub unit: Option<String>,
    /// Stopped by an operator rather than the deadline.
    pub aborted: bool,
}

/// Result of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success(Value),
    SecurityViolation(Violation),
    Timeout(TimeoutNotice),
    RuntimeFailure(Failure),
}

impl ExecutionOutcome {
    pub fn violation(rule: ViolationRule, unit: Option<&str>) -> Self {
        ExecutionOutcome::SecurityViolation(Violation::new(rule, unit))
    }

    pub fn failure(cause: FailureCause, unit: Option<&str>) -> Self {
        ExecutionOutcome::RuntimeFailure(Failure {
            cause,
            unit: unit.map(str::to_string),
        })
    }

    pub fn compile_error(error: &ParseError, unit: Option<&str>) -> Self {
        Self::failure(FailureCause::Compile(CompileError::from(error)), unit)
    }

    pub fn timeout(unit: Option<&str>, aborted: bool) -> Self {
        ExecutionOutcome::Timeout(TimeoutNotice {
            unit: unit.map(str::to_string),
            aborted,
        })
    }

    /// Classify the result of running one unit.
    pub fn from_run(
        result: Result<Value, RuntimeError>,
        unit: Option<&str>,
        aborted: bool,
    ) -> Self {
        match result {
            Ok(value) => ExecutionOutcome::Success(value),
            Err(RuntimeError::Security(rule)) => Self::violation(rule, unit),
            Err(RuntimeError::Interrupted) => Self::timeout(unit, aborted),
            Err(err) => Self::failure(
                FailureCause::Runtime {
                    code: runtime_error_code(&err),
                    message: err.to_string(),
                },
                unit,
            ),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success(_) => "success",
            ExecutionOutcome::SecurityViolation(_) => "security_violation",
            ExecutionOutcome::Timeout(_) => "timeout",
            ExecutionOutcome::RuntimeFailure(_) => "runtime_failure",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            ExecutionOutcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            ExecutionOutcome::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Text safe to show the script's author.
    pub fn describe(&self) -> String {
        fn located(text: String, unit: &Option<String>) -> String {
            match unit {
                Some(unit) => format!("{} (in {})", text, unit),
                None => text,
            }
        }

        match self {
            ExecutionOutcome::Success(value) => value.to_string(),
            ExecutionOutcome::SecurityViolation(violation) => located(
                format!("Script rejected: {}", violation.message),
                &violation.unit,
            ),
            ExecutionOutcome::Timeout(notice) if notice.aborted => {
                located("Script was aborted".to_string(), &notice.unit)
            }
            ExecutionOutcome::Timeout(notice) => {
                located("Script ran out of time".to_string(), &notice.unit)
            }
            ExecutionOutcome::RuntimeFailure(failure) => {
                located(format!("Script failed: {}", failure.cause), &failure.unit)
            }
        }
    }
}

/// Outcome plus what the batch consumed.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub id: u64,
    pub outcome: ExecutionOutcome,
    pub usage: UsageSnapshot,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    #[test]
    fn runtime_errors_are_classified() {
        let rule = ViolationRule::LoopCap { cap: 3 };
        let outcome = ExecutionOutcome::from_run(Err(RuntimeError::Security(rule.clone())), None, false);
        assert_eq!(
            outcome,
            ExecutionOutcome::SecurityViolation(Violation::new(rule, None))
        );

        let outcome = ExecutionOutcome::from_run(Err(RuntimeError::Interrupted), Some("a"), true);
        assert_eq!(outcome.kind(), "timeout");
        assert_eq!(outcome.describe(), "Script was aborted (in a)");

        let outcome = ExecutionOutcome::from_run(Err(RuntimeError::DivisionByZero), None, false);
        let ExecutionOutcome::RuntimeFailure(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(
            failure.cause,
            FailureCause::Runtime {
                code: ErrorCode::InvalidOperation,
                message: "Division by zero".to_string()
            }
        );
    }

    #[test]
    fn compile_errors_carry_positions() {
        let err = parse_source("let = 1").expect_err("parse error");
        let outcome = ExecutionOutcome::compile_error(&err, Some("rule"));
        let ExecutionOutcome::RuntimeFailure(Failure {
            cause: FailureCause::Compile(compile),
            unit,
        }) = outcome
        else {
            panic!("expected compile failure");
        };
        assert_eq!(unit.as_deref(), Some("rule"));
        assert_eq!(compile.diagnostics[0].line, 1);
        assert_eq!(compile.diagnostics[0].column, 5);
    }

    #[test]
    fn violation_text_names_the_rule() {
        let outcome = ExecutionOutcome::violation(
            ViolationRule::UndeclaredOperation {
                owner: "Queue".into(),
                member: "clear".into(),
                kind: MemberKind::Method,
            },
            None,
        );
        assert_eq!(outcome.describe(), "Script rejected: undeclared operation Queue.clear");
    }

    #[test]
    fn outcomes_serialize_with_a_tag() {
        let json = serde_json::to_value(ExecutionOutcome::Success(Value::Int(3))).expect("json");
        assert_eq!(json, serde_json::json!({ "outcome": "success", "detail": 3 }));
    }
}

//=====================================================
// End of file
//=====================================================
