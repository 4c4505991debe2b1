//=====================================================
// File: interpreter/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Tree-walking evaluator for instrumented scripts
// Objective: Execute programs against a global scope shared by the units of
//            a batch, reporting every hook to an execution monitor
//=====================================================

mod errors;
mod intrinsics;
mod value;

pub use errors::{ErrorCode, RuntimeError, ScriptError, runtime_error_code};
pub use intrinsics::{MAX_RANGE_LEN, is_global_function};
pub use value::{FunctionBody, HostObject, ScriptFunction, Value};

use crate::ast::{BinaryOp, Expr, Hook, Literal, Program, Stmt, UnaryOp};
use crate::whitelist::{EntryId, GLOBAL_TYPE, MemberKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Nested script calls allowed before the run fails with a stack overflow.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Receives the hooks spliced in by the instrumenter.
///
/// Every method returns `Err` to stop the script: either
/// [`RuntimeError::Security`] when a rule is broken or
/// [`RuntimeError::Interrupted`] once cancellation was requested.
pub trait ExecutionMonitor: Send + Sync {
    /// A statically resolved operation is about to run on a receiver whose
    /// runtime type is `owner`.
    fn on_operation(&self, entry: EntryId, owner: &str) -> Result<(), RuntimeError>;

    /// An operation whose owner type was only known at runtime.
    fn on_dynamic(&self, owner: &str, member: &str, kind: MemberKind)
    -> Result<(), RuntimeError>;

    /// Top of a loop body.
    fn on_loop(&self) -> Result<(), RuntimeError>;

    fn check_interrupt(&self) -> Result<(), RuntimeError>;
}

/// Monitor that permits everything; used when scripts run outside a session.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unmonitored;

impl ExecutionMonitor for Unmonitored {
    fn on_operation(&self, _entry: EntryId, _owner: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn on_dynamic(
        &self,
        _owner: &str,
        _member: &str,
        _kind: MemberKind,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn on_loop(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn check_interrupt(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct VariableEntry {
    value: Value,
    mutable: bool,
}

type Environment = HashMap<String, VariableEntry>;

pub struct Interpreter {
    globals: Environment,
    locals: Vec<Environment>,
    call_stack: Vec<String>,
    max_call_depth: usize,
    monitor: Arc<dyn ExecutionMonitor>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_monitor(Arc::new(Unmonitored), DEFAULT_MAX_CALL_DEPTH)
    }

    pub fn with_monitor(monitor: Arc<dyn ExecutionMonitor>, max_call_depth: usize) -> Self {
        Self {
            globals: HashMap::new(),
            locals: Vec::new(),
            call_stack: Vec::new(),
            max_call_depth,
            monitor,
        }
    }

    /// Bind a host value as a global, replacing any previous value.
    pub fn define_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(
            name.into(),
            VariableEntry {
                value,
                mutable: true,
            },
        );
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name).map(|entry| &entry.value)
    }

    /// Run `program` and return the value of its last statement, or the
    /// value of a top-level `return`.
    pub fn execute(&mut self, program: &Program) -> Result<Value, RuntimeError> {
        self.locals.clear();
        self.call_stack.clear();

        let mut last = Value::Null;
        for stmt in &program.statements {
            match self.eval_stmt(stmt) {
                Ok(value) => last = value,
                Err(RuntimeError::Return(value)) => return Ok(value),
                Err(err) => return Err(err),
            }
        }
        Ok(last)
    }

    //=====================================================
    // Statements
    //=====================================================

    fn eval_stmt(&mut self, stmt: &Stmt) -> Result<Value, RuntimeError> {
        match stmt {
            Stmt::VariableDecl { decl } => {
                let value = match &decl.initializer {
                    Some(expr) => self.eval_expr(expr)?,
                    None => Value::Null,
                };
                self.define_variable(decl.name.clone(), value, decl.is_mutable);
                Ok(Value::Null)
            }
            Stmt::FunctionDecl { decl } => {
                let function = ScriptFunction {
                    name: decl.name.clone(),
                    params: decl.params.clone(),
                    body: FunctionBody::Block(decl.body.clone()),
                    closure: self.capture(),
                };
                self.define_variable(decl.name.clone(), Value::Function(Arc::new(function)), false);
                Ok(Value::Null)
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                if self.eval_expr(condition)?.is_truthy() {
                    self.eval_stmt(then_branch)
                } else if let Some(else_branch) = else_branch {
                    self.eval_stmt(else_branch)
                } else {
                    Ok(Value::Null)
                }
            }
            Stmt::While {
                condition, body, ..
            } => {
                while self.eval_expr(condition)?.is_truthy() {
                    match self.eval_stmt(body) {
                        Ok(_) | Err(RuntimeError::Continue) => {}
                        Err(RuntimeError::Break) => break,
                        Err(err) => return Err(err),
                    }
                }
                Ok(Value::Null)
            }
            Stmt::For {
                variable,
                iterable,
                body,
                ..
            } => {
                let items = match self.eval_expr(iterable)? {
                    Value::Array(items) => items,
                    Value::Map(map) => map.into_keys().map(Value::String).collect(),
                    Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
                    other => {
                        return Err(RuntimeError::TypeError(format!(
                            "cannot iterate over {}",
                            other.type_name()
                        )));
                    }
                };

                for item in items {
                    self.push_scope();
                    self.define_variable(variable.clone(), item, true);
                    let result = self.eval_stmt(body);
                    self.pop_scope();
                    match result {
                        Ok(_) | Err(RuntimeError::Continue) => {}
                        Err(RuntimeError::Break) => break,
                        Err(err) => return Err(err),
                    }
                }
                Ok(Value::Null)
            }
            Stmt::Return { value, .. } => {
                let value = match value {
                    Some(expr) => self.eval_expr(expr)?,
                    None => Value::Null,
                };
                Err(RuntimeError::Return(value))
            }
            Stmt::Break { .. } => Err(RuntimeError::Break),
            Stmt::Continue { .. } => Err(RuntimeError::Continue),
            Stmt::Block { statements, .. } => {
                self.push_scope();
                let result = self.eval_statements(statements);
                self.pop_scope();
                result
            }
            Stmt::Expression { expr, .. } => self.eval_expr(expr),
            Stmt::Hook { hook, .. } => {
                self.run_hook(hook)?;
                Ok(Value::Null)
            }
        }
    }

    fn eval_statements(&mut self, statements: &[Stmt]) -> Result<Value, RuntimeError> {
        let mut last = Value::Null;
        for stmt in statements {
            last = self.eval_stmt(stmt)?;
        }
        Ok(last)
    }

    //=====================================================
    // Hooks
    //=====================================================

    fn run_hook(&self, hook: &Hook) -> Result<(), RuntimeError> {
        match hook {
            Hook::Loop => self.monitor.on_loop(),
            Hook::Interrupt
            | Hook::Call(_)
            | Hook::DynamicCall { .. }
            | Hook::DynamicProperty { .. } => self.monitor.check_interrupt(),
        }
    }

    fn apply_member_hook(
        &self,
        hook: Option<&Hook>,
        receiver: &Value,
        member: &str,
        kind: MemberKind,
    ) -> Result<(), RuntimeError> {
        let Some(hook) = hook else {
            return Ok(());
        };

        // Map fields are script data, not host operations.
        if kind == MemberKind::Property && matches!(receiver, Value::Map(_)) {
            return self.monitor.check_interrupt();
        }

        let owner = receiver.type_name();
        match hook {
            Hook::Call(entry) => self.monitor.on_operation(*entry, owner),
            Hook::DynamicCall { .. } | Hook::DynamicProperty { .. } => {
                self.monitor.on_dynamic(owner, member, kind)
            }
            Hook::Loop | Hook::Interrupt => self.run_hook(hook),
        }
    }

    //=====================================================
    // Expressions
    //=====================================================

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, RuntimeError> {
        self.eval_hooked(expr, None)
    }

    fn eval_hooked(&mut self, expr: &Expr, hook: Option<&Hook>) -> Result<Value, RuntimeError> {
        match expr {
            Expr::Hooked { hook: inner, expr } => {
                if let Some(outer) = hook {
                    self.run_hook(outer)?;
                }
                self.eval_hooked(expr, Some(inner))
            }
            Expr::MethodCall {
                receiver,
                method,
                args,
                ..
            } => self.eval_method_call(receiver, method, args, hook),
            Expr::Member {
                object, property, ..
            } => {
                let target = self.eval_expr(object)?;
                self.apply_member_hook(hook, &target, property, MemberKind::Property)?;
                intrinsics::get_property(&target, property)
            }
            Expr::Call { callee, args, .. } => self.eval_call(callee, args, hook),
            other => {
                if let Some(hook) = hook {
                    self.run_hook(hook)?;
                }
                self.eval_plain(other)
            }
        }
    }

    fn eval_plain(&mut self, expr: &Expr) -> Result<Value, RuntimeError> {
        match expr {
            Expr::Literal { value, .. } => Ok(match value {
                Literal::Integer(n) => Value::Int(*n),
                Literal::Float(f) => Value::Float(*f),
                Literal::String(s) => Value::String(s.clone()),
                Literal::Boolean(b) => Value::Bool(*b),
                Literal::Null => Value::Null,
            }),
            Expr::Array { elements, .. } => Ok(Value::Array(self.eval_args(elements)?)),
            Expr::Object { fields, .. } => {
                let mut map = BTreeMap::new();
                for (key, value) in fields {
                    let value = self.eval_expr(value)?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::Map(map))
            }
            Expr::Identifier { name, .. } => self
                .lookup_variable(name)
                .cloned()
                .ok_or_else(|| RuntimeError::VariableNotFound(name.clone())),
            Expr::Binary {
                left,
                operator,
                right,
                ..
            } => match operator {
                BinaryOp::And => {
                    let left = self.eval_expr(left)?;
                    if !left.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(self.eval_expr(right)?.is_truthy()))
                }
                BinaryOp::Or => {
                    let left = self.eval_expr(left)?;
                    if left.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(self.eval_expr(right)?.is_truthy()))
                }
                op => {
                    let left = self.eval_expr(left)?;
                    let right = self.eval_expr(right)?;
                    eval_binary_op(*op, left, right)
                }
            },
            Expr::Unary {
                operator, operand, ..
            } => {
                let value = self.eval_expr(operand)?;
                match (operator, value) {
                    (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
                    (UnaryOp::Minus, Value::Int(n)) => {
                        n.checked_neg().map(Value::Int).ok_or(RuntimeError::Overflow)
                    }
                    (UnaryOp::Minus, Value::Float(f)) => Ok(Value::Float(-f)),
                    (UnaryOp::Minus, other) => Err(RuntimeError::TypeError(format!(
                        "cannot negate {}",
                        other.type_name()
                    ))),
                }
            }
            Expr::Assignment { target, value, .. } => {
                let value = self.eval_expr(value)?;
                self.assign_place(target, value.clone(), true)?;
                Ok(value)
            }
            Expr::Index { object, index, .. } => {
                let container = self.eval_expr(object)?;
                let index = self.eval_expr(index)?;
                match (&container, &index) {
                    (Value::Array(items), Value::Int(i)) => {
                        intrinsics::index_array(items, *i).cloned()
                    }
                    (Value::Map(map), Value::String(key)) => {
                        Ok(map.get(key).cloned().unwrap_or(Value::Null))
                    }
                    (Value::String(s), Value::Int(i)) => usize::try_from(*i)
                        .ok()
                        .and_then(|i| s.chars().nth(i))
                        .map(|c| Value::String(c.to_string()))
                        .ok_or_else(|| {
                            RuntimeError::IndexError(format!("index {} out of bounds", i))
                        }),
                    (container, index) => Err(RuntimeError::TypeError(format!(
                        "cannot index {} with {}",
                        container.type_name(),
                        index.type_name()
                    ))),
                }
            }
            Expr::Lambda { params, body, .. } => {
                let function = ScriptFunction {
                    name: "<lambda>".to_string(),
                    params: params.clone(),
                    body: FunctionBody::Expr((**body).clone()),
                    closure: self.capture(),
                };
                Ok(Value::Function(Arc::new(function)))
            }
            Expr::If {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                if self.eval_expr(condition)?.is_truthy() {
                    self.eval_expr(then_expr)
                } else {
                    self.eval_expr(else_expr)
                }
            }
            Expr::Hooked { .. }
            | Expr::MethodCall { .. }
            | Expr::Member { .. }
            | Expr::Call { .. } => self.eval_expr(expr),
        }
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>, RuntimeError> {
        args.iter().map(|arg| self.eval_expr(arg)).collect()
    }

    fn eval_method_call(
        &mut self,
        receiver_expr: &Expr,
        method: &str,
        args: &[Expr],
        hook: Option<&Hook>,
    ) -> Result<Value, RuntimeError> {
        let mut receiver = self.eval_expr(receiver_expr)?;
        let args = self.eval_args(args)?;
        self.apply_member_hook(hook, &receiver, method, MemberKind::Method)?;

        let mutating = intrinsics::is_mutating(receiver.type_name(), method);
        let result = intrinsics::call_method(&mut receiver, method, args)?;
        if mutating && is_place(receiver_expr) {
            self.assign_place(receiver_expr, receiver, false)?;
        }
        Ok(result)
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        hook: Option<&Hook>,
    ) -> Result<Value, RuntimeError> {
        if let Expr::Identifier { name, .. } = callee
            && self.lookup_variable(name).is_none()
            && intrinsics::is_global_function(name)
        {
            let args = self.eval_args(args)?;
            match hook {
                Some(Hook::Call(entry)) => self.monitor.on_operation(*entry, GLOBAL_TYPE)?,
                Some(other) => {
                    self.run_hook(other)?;
                    self.monitor
                        .on_dynamic(GLOBAL_TYPE, name, MemberKind::Method)?;
                }
                None => self
                    .monitor
                    .on_dynamic(GLOBAL_TYPE, name, MemberKind::Method)?,
            }
            return intrinsics::call_global(name, args);
        }

        let function = self.eval_expr(callee)?;
        let args = self.eval_args(args)?;
        if hook.is_some() {
            self.monitor.check_interrupt()?;
        }
        self.call_function(function, args)
    }

    fn call_function(&mut self, function: Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let Value::Function(function) = function else {
            return Err(RuntimeError::TypeError(format!(
                "Value of type '{}' is not callable",
                function.type_name()
            )));
        };

        if self.call_stack.len() >= self.max_call_depth {
            return Err(RuntimeError::StackOverflow);
        }
        if args.len() != function.params.len() {
            return Err(RuntimeError::ArgumentError(format!(
                "Function '{}' expects {} arguments, got {}",
                function.name,
                function.params.len(),
                args.len()
            )));
        }

        let mut scope: Environment = function
            .closure
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    VariableEntry {
                        value: value.clone(),
                        mutable: true,
                    },
                )
            })
            .collect();
        if matches!(function.body, FunctionBody::Block(_)) {
            scope
                .entry(function.name.clone())
                .or_insert_with(|| VariableEntry {
                    value: Value::Function(Arc::clone(&function)),
                    mutable: false,
                });
        }
        for (param, arg) in function.params.iter().zip(args) {
            scope.insert(
                param.clone(),
                VariableEntry {
                    value: arg,
                    mutable: true,
                },
            );
        }

        let saved = std::mem::replace(&mut self.locals, vec![scope]);
        self.call_stack.push(function.name.clone());

        let result = match &function.body {
            FunctionBody::Block(statements) => match self.eval_statements(statements) {
                Ok(value) | Err(RuntimeError::Return(value)) => Ok(value),
                Err(err) => Err(err),
            },
            FunctionBody::Expr(expr) => self.eval_expr(expr),
        };

        self.call_stack.pop();
        self.locals = saved;
        result
    }

    //=====================================================
    // Scopes
    //=====================================================

    fn push_scope(&mut self) {
        self.locals.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.locals.pop();
    }

    fn define_variable(&mut self, name: String, value: Value, mutable: bool) {
        let entry = VariableEntry { value, mutable };
        match self.locals.last_mut() {
            Some(scope) => {
                scope.insert(name, entry);
            }
            None => {
                self.globals.insert(name, entry);
            }
        }
    }

    fn lookup_variable(&self, name: &str) -> Option<&Value> {
        self.locals
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .or_else(|| self.globals.get(name))
            .map(|entry| &entry.value)
    }

    /// Assign to an existing variable; unknown names become globals.
    fn set_variable(
        &mut self,
        name: &str,
        value: Value,
        enforce_mutability: bool,
    ) -> Result<(), RuntimeError> {
        let entry = match self
            .locals
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
        {
            Some(entry) => Some(entry),
            None => self.globals.get_mut(name),
        };

        match entry {
            Some(entry) if enforce_mutability && !entry.mutable => Err(
                RuntimeError::InvalidOperation(format!(
                    "cannot assign to immutable variable '{}'",
                    name
                )),
            ),
            Some(entry) => {
                entry.value = value;
                Ok(())
            }
            None => {
                self.define_global(name, value);
                Ok(())
            }
        }
    }

    fn assign_place(
        &mut self,
        target: &Expr,
        value: Value,
        enforce_mutability: bool,
    ) -> Result<(), RuntimeError> {
        match target {
            Expr::Identifier { name, .. } => self.set_variable(name, value, enforce_mutability),
            Expr::Member {
                object, property, ..
            } => {
                let mut container = self.eval_expr(object)?;
                match &mut container {
                    Value::Map(map) => {
                        map.insert(property.clone(), value);
                    }
                    other => {
                        return Err(RuntimeError::InvalidOperation(format!(
                            "cannot assign property '{}' of {}",
                            property,
                            other.type_name()
                        )));
                    }
                }
                self.assign_place(object, container, enforce_mutability)
            }
            Expr::Index { object, index, .. } => {
                let mut container = self.eval_expr(object)?;
                let index = self.eval_expr(index)?;
                match (&mut container, index) {
                    (Value::Array(items), Value::Int(i)) => {
                        let len = items.len();
                        let slot = usize::try_from(i)
                            .ok()
                            .and_then(|i| items.get_mut(i))
                            .ok_or_else(|| {
                                RuntimeError::IndexError(format!(
                                    "index {} out of bounds for length {}",
                                    i, len
                                ))
                            })?;
                        *slot = value;
                    }
                    (Value::Map(map), Value::String(key)) => {
                        map.insert(key, value);
                    }
                    (container, index) => {
                        return Err(RuntimeError::TypeError(format!(
                            "cannot index {} with {}",
                            container.type_name(),
                            index.type_name()
                        )));
                    }
                }
                self.assign_place(object, container, enforce_mutability)
            }
            Expr::Hooked { expr, .. } => self.assign_place(expr, value, enforce_mutability),
            _ => Err(RuntimeError::InvalidOperation(
                "invalid assignment target".to_string(),
            )),
        }
    }

    /// Snapshot of the local scopes for a closure; globals stay live.
    fn capture(&self) -> HashMap<String, Value> {
        let mut captured = HashMap::new();
        for scope in &self.locals {
            for (name, entry) in scope {
                captured.insert(name.clone(), entry.value.clone());
            }
        }
        captured
    }
}

fn is_place(expr: &Expr) -> bool {
    match expr {
        Expr::Identifier { .. } | Expr::Member { .. } | Expr::Index { .. } => true,
        Expr::Hooked { expr, .. } => is_place(expr),
        _ => false,
    }
}

fn type_error(op: BinaryOp, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::TypeError(format!(
        "'{}' not supported for {} and {}",
        op,
        left.type_name(),
        right.type_name()
    ))
}

fn eval_binary_op(op: BinaryOp, left: Value, right: Value) -> Result<Value, RuntimeError> {
    use Value::*;

    let arithmetic = |checked: fn(i64, i64) -> Option<i64>, float: fn(f64, f64) -> f64| match (
        &left, &right,
    ) {
        (Int(a), Int(b)) => checked(*a, *b).map(Int).ok_or(RuntimeError::Overflow),
        (Float(a), Float(b)) => Ok(Float(float(*a, *b))),
        (Int(a), Float(b)) => Ok(Float(float(*a as f64, *b))),
        (Float(a), Int(b)) => Ok(Float(float(*a, *b as f64))),
        _ => Err(type_error(op, &left, &right)),
    };

    match op {
        BinaryOp::Add => match (&left, &right) {
            (String(a), b) => Ok(String(format!("{}{}", a, b))),
            (a, String(b)) => Ok(String(format!("{}{}", a, b))),
            (Array(a), Array(b)) => Ok(Array(a.iter().chain(b).cloned().collect())),
            _ => arithmetic(i64::checked_add, |a, b| a + b),
        },
        BinaryOp::Subtract => arithmetic(i64::checked_sub, |a, b| a - b),
        BinaryOp::Multiply => arithmetic(i64::checked_mul, |a, b| a * b),
        BinaryOp::Divide => match (&left, &right) {
            (Int(_), Int(0)) => Err(RuntimeError::DivisionByZero),
            (Float(_) | Int(_), Float(b)) if *b == 0.0 => Err(RuntimeError::DivisionByZero),
            (Float(_), Int(0)) => Err(RuntimeError::DivisionByZero),
            _ => arithmetic(i64::checked_div, |a, b| a / b),
        },
        BinaryOp::Modulo => match (&left, &right) {
            (Int(_), Int(0)) => Err(RuntimeError::DivisionByZero),
            (Int(a), Int(b)) => a.checked_rem(*b).map(Int).ok_or(RuntimeError::Overflow),
            _ => Err(type_error(op, &left, &right)),
        },
        BinaryOp::Equal => Ok(Bool(left == right)),
        BinaryOp::NotEqual => Ok(Bool(left != right)),
        BinaryOp::Less | BinaryOp::Greater | BinaryOp::LessEqual | BinaryOp::GreaterEqual => {
            let ordering = match (&left, &right) {
                (Int(a), Int(b)) => a.partial_cmp(b),
                (Float(a), Float(b)) => a.partial_cmp(b),
                (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
                (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
                (String(a), String(b)) => a.partial_cmp(b),
                _ => return Err(type_error(op, &left, &right)),
            };
            let Some(ordering) = ordering else {
                return Ok(Bool(false));
            };
            Ok(Bool(match op {
                BinaryOp::Less => ordering.is_lt(),
                BinaryOp::Greater => ordering.is_gt(),
                BinaryOp::LessEqual => ordering.is_le(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::And | BinaryOp::Or => Ok(Bool(left.is_truthy() && right.is_truthy())),
    }
}


//=====================================================
// End of file
//=====================================================
