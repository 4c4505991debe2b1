//=====================================================
// File: instrument/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Static validation and hook insertion
// Objective: Reject scripts that reference undeclared operations before they
//            run, and splice counting/interrupt hooks into the ones that pass
//=====================================================

use crate::ast::{BinaryOp, Expr, FunctionDecl, Hook, Literal, Program, Stmt, UnaryOp, VariableDecl};
use crate::interpreter::{Value, is_global_function};
use crate::outcome::{ExecutionOutcome, ViolationRule};
use crate::parser::{ParseError, parse_source};
use crate::session::TrustLevel;
use crate::whitelist::{GLOBAL_TYPE, MemberKind, TypeCatalog, WhitelistPolicy};
use std::collections::HashMap;

/// A script that passed validation and carries its hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedScript {
    pub owner: String,
    pub trust: TrustLevel,
    pub program: Program,
    /// Globals rebound right before this unit runs.
    pub bindings: Vec<(String, Value)>,
}

/// Why a script never started.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Compile(ParseError),
    Violation(ViolationRule),
}

impl Rejection {
    pub fn into_outcome(self, unit: Option<&str>) -> ExecutionOutcome {
        match self {
            Rejection::Compile(error) => ExecutionOutcome::compile_error(&error, unit),
            Rejection::Violation(rule) => ExecutionOutcome::violation(rule, unit),
        }
    }
}

/// Static type per visible name; `None` when only known at runtime.
type TypeScope = HashMap<String, Option<String>>;

/// Validates and instruments the units of one batch.
///
/// The global scope survives between [`Instrumenter::prepare`] calls so a unit
/// sees the names declared by the units before it.
pub struct Instrumenter<'a> {
    whitelist: &'a WhitelistPolicy,
    catalog: &'a TypeCatalog,
    trust: TrustLevel,
    scopes: Vec<TypeScope>,
}

impl<'a> Instrumenter<'a> {
    pub fn new(
        whitelist: &'a WhitelistPolicy,
        catalog: &'a TypeCatalog,
        trust: TrustLevel,
        bindings: HashMap<String, String>,
    ) -> Self {
        let globals = bindings
            .into_iter()
            .map(|(name, ty)| (name, Some(ty)))
            .collect();
        Self {
            whitelist,
            catalog,
            trust,
            scopes: vec![globals],
        }
    }

    /// Parse, validate and instrument one unit.
    pub fn prepare(&mut self, source: &str, owner: &str) -> Result<PreparedScript, Rejection> {
        let program = parse_source(source).map_err(Rejection::Compile)?;
        let program = self.instrument(program).map_err(|rule| {
            tracing::debug!(owner, %rule, "script rejected before execution");
            Rejection::Violation(rule)
        })?;

        Ok(PreparedScript {
            owner: owner.to_string(),
            trust: self.trust,
            program,
            bindings: Vec::new(),
        })
    }

    /// Record the type of a global bound between units.
    pub fn bind_global(&mut self, name: &str, ty: Option<String>) {
        if let Some(globals) = self.scopes.first_mut() {
            globals.insert(name.to_string(), ty);
        }
    }

    pub fn instrument(&mut self, program: Program) -> Result<Program, ViolationRule> {
        self.scopes.truncate(1);
        let statements = self.statements(program.statements)?;
        Ok(Program::new(statements, program.position))
    }

    fn sandboxed(&self) -> bool {
        self.trust == TrustLevel::Sandboxed
    }

    //=====================================================
    // Scopes
    //=====================================================

    fn declare(&mut self, name: &str, ty: Option<String>) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), ty);
        }
    }

    fn lookup(&self, name: &str) -> Option<&Option<String>> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    /// After an assignment the name's type is no longer known statically.
    fn forget(&mut self, name: &str) {
        match self
            .scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
        {
            Some(ty) => *ty = None,
            None => {
                if let Some(globals) = self.scopes.first_mut() {
                    globals.insert(name.to_string(), None);
                }
            }
        }
    }

    fn scoped<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, ViolationRule>,
    ) -> Result<T, ViolationRule> {
        self.scopes.push(TypeScope::new());
        let result = body(self);
        self.scopes.pop();
        result
    }

    //=====================================================
    // Statements
    //=====================================================

    fn statements(&mut self, statements: Vec<Stmt>) -> Result<Vec<Stmt>, ViolationRule> {
        statements
            .into_iter()
            .map(|stmt| self.statement(stmt))
            .collect()
    }

    fn statement(&mut self, stmt: Stmt) -> Result<Stmt, ViolationRule> {
        match stmt {
            Stmt::VariableDecl { decl } => {
                let (initializer, ty) = match decl.initializer {
                    Some(expr) => {
                        let (expr, ty) = self.expr(expr)?;
                        (Some(expr), ty)
                    }
                    None => (None, Some("Null".to_string())),
                };
                self.declare(&decl.name, if decl.is_mutable { None } else { ty });
                Ok(Stmt::VariableDecl {
                    decl: VariableDecl {
                        initializer,
                        ..decl
                    },
                })
            }
            Stmt::FunctionDecl { decl } => {
                self.declare(&decl.name, Some("Function".to_string()));
                let params = decl.params.clone();
                let body = self.scoped(|this| {
                    for param in &params {
                        this.declare(param, None);
                    }
                    this.statements(decl.body)
                })?;
                Ok(Stmt::FunctionDecl {
                    decl: FunctionDecl { body, ..decl },
                })
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                position,
            } => {
                let (condition, _) = self.expr(condition)?;
                let then_branch = Box::new(self.statement(*then_branch)?);
                let else_branch = match else_branch {
                    Some(branch) => Some(Box::new(self.statement(*branch)?)),
                    None => None,
                };
                Ok(Stmt::If {
                    condition,
                    then_branch,
                    else_branch,
                    position,
                })
            }
            Stmt::While {
                condition,
                body,
                position,
            } => {
                let (condition, _) = self.expr(condition)?;
                let body = self.loop_body(*body)?;
                Ok(Stmt::While {
                    condition,
                    body: Box::new(body),
                    position,
                })
            }
            Stmt::For {
                variable,
                iterable,
                body,
                position,
            } => {
                let (iterable, _) = self.expr(iterable)?;
                let body = self.scoped(|this| {
                    this.declare(&variable, None);
                    this.loop_body(*body)
                })?;
                Ok(Stmt::For {
                    variable,
                    iterable,
                    body: Box::new(body),
                    position,
                })
            }
            Stmt::Return { value, position } => {
                let value = match value {
                    Some(expr) => Some(self.expr(expr)?.0),
                    None => None,
                };
                Ok(Stmt::Return { value, position })
            }
            Stmt::Block {
                statements,
                position,
            } => {
                let statements = self.scoped(|this| this.statements(statements))?;
                Ok(Stmt::Block {
                    statements,
                    position,
                })
            }
            Stmt::Expression { expr, position } => Ok(Stmt::Expression {
                expr: self.expr(expr)?.0,
                position,
            }),
            stmt @ (Stmt::Break { .. } | Stmt::Continue { .. } | Stmt::Hook { .. }) => Ok(stmt),
        }
    }

    /// Instrument a loop body and put a checkpoint at its top.
    fn loop_body(&mut self, body: Stmt) -> Result<Stmt, ViolationRule> {
        let position = body.position();
        let hook = Stmt::Hook {
            hook: if self.sandboxed() {
                Hook::Loop
            } else {
                Hook::Interrupt
            },
            position,
        };

        let statements = match self.statement(body)? {
            Stmt::Block { mut statements, .. } => {
                statements.insert(0, hook);
                statements
            }
            other => vec![hook, other],
        };
        Ok(Stmt::Block {
            statements,
            position,
        })
    }

    //=====================================================
    // Expressions
    //=====================================================

    fn exprs(&mut self, exprs: Vec<Expr>) -> Result<Vec<Expr>, ViolationRule> {
        exprs
            .into_iter()
            .map(|expr| self.expr(expr).map(|(expr, _)| expr))
            .collect()
    }

    /// Operation hook for a statically known owner, or a violation.
    fn resolve(
        &self,
        owner: &str,
        member: &str,
        kind: MemberKind,
    ) -> Result<(Hook, Option<String>), ViolationRule> {
        match self.whitelist.lookup(owner, member, kind) {
            Some(entry) => Ok((
                Hook::Call(entry),
                self.catalog
                    .result_type(owner, member, kind)
                    .map(str::to_string),
            )),
            None => Err(ViolationRule::UndeclaredOperation {
                owner: owner.to_string(),
                member: member.to_string(),
                kind,
            }),
        }
    }

    fn expr(&mut self, expr: Expr) -> Result<(Expr, Option<String>), ViolationRule> {
        match expr {
            Expr::Literal { ref value, .. } => {
                let ty = match value {
                    Literal::Integer(_) => "Int",
                    Literal::Float(_) => "Float",
                    Literal::String(_) => "String",
                    Literal::Boolean(_) => "Bool",
                    Literal::Null => "Null",
                };
                Ok((expr, Some(ty.to_string())))
            }
            Expr::Array { elements, position } => Ok((
                Expr::Array {
                    elements: self.exprs(elements)?,
                    position,
                },
                Some("Array".to_string()),
            )),
            Expr::Object { fields, position } => {
                let fields = fields
                    .into_iter()
                    .map(|(key, value)| Ok((key, self.expr(value)?.0)))
                    .collect::<Result<Vec<_>, ViolationRule>>()?;
                Ok((Expr::Object { fields, position }, Some("Map".to_string())))
            }
            Expr::Identifier { ref name, .. } => {
                let ty = self.lookup(name).cloned().flatten();
                Ok((expr, ty))
            }
            Expr::Binary {
                left,
                operator,
                right,
                position,
            } => {
                let (left, left_ty) = self.expr(*left)?;
                let (right, right_ty) = self.expr(*right)?;
                let ty = binary_type(operator, left_ty.as_deref(), right_ty.as_deref());
                Ok((
                    Expr::Binary {
                        left: Box::new(left),
                        operator,
                        right: Box::new(right),
                        position,
                    },
                    ty,
                ))
            }
            Expr::Unary {
                operator,
                operand,
                position,
            } => {
                let (operand, operand_ty) = self.expr(*operand)?;
                let ty = match operator {
                    UnaryOp::Not => Some("Bool".to_string()),
                    UnaryOp::Minus => operand_ty,
                };
                Ok((
                    Expr::Unary {
                        operator,
                        operand: Box::new(operand),
                        position,
                    },
                    ty,
                ))
            }
            Expr::Assignment {
                target,
                value,
                position,
            } => {
                let (value, ty) = self.expr(*value)?;
                let target = self.place(*target)?;
                Ok((
                    Expr::Assignment {
                        target: Box::new(target),
                        value: Box::new(value),
                        position,
                    },
                    ty,
                ))
            }
            Expr::Call {
                callee,
                args,
                position,
            } => self.call(*callee, args, position),
            Expr::MethodCall {
                receiver,
                method,
                args,
                position,
            } => {
                let (receiver, owner) = self.expr(*receiver)?;
                let args = self.exprs(args)?;
                let (hook, ty) = match (self.trust, owner) {
                    (TrustLevel::Privileged, _) => (Hook::Interrupt, None),
                    (TrustLevel::Sandboxed, Some(owner)) => {
                        self.resolve(&owner, &method, MemberKind::Method)?
                    }
                    (TrustLevel::Sandboxed, None) => (
                        Hook::DynamicCall {
                            member: method.clone(),
                        },
                        None,
                    ),
                };
                let call = Expr::MethodCall {
                    receiver: Box::new(receiver),
                    method,
                    args,
                    position,
                };
                Ok((Expr::hooked(hook, call), ty))
            }
            Expr::Member {
                object,
                property,
                position,
            } => {
                let (object, owner) = self.expr(*object)?;
                // A name typed as a map here may hold a host object when the
                // read runs, so map reads keep a runtime check.
                let hook = match (self.trust, owner.as_deref()) {
                    (TrustLevel::Privileged, _) => None,
                    (TrustLevel::Sandboxed, Some(owner)) if owner != "Map" => {
                        Some(self.resolve(owner, &property, MemberKind::Property)?)
                    }
                    (TrustLevel::Sandboxed, _) => Some((
                        Hook::DynamicProperty {
                            member: property.clone(),
                        },
                        None,
                    )),
                };
                let member = Expr::Member {
                    object: Box::new(object),
                    property,
                    position,
                };
                Ok(match hook {
                    Some((hook, ty)) => (Expr::hooked(hook, member), ty),
                    None => (member, None),
                })
            }
            Expr::Index {
                object,
                index,
                position,
            } => {
                let (object, object_ty) = self.expr(*object)?;
                let (index, _) = self.expr(*index)?;
                let ty = (object_ty.as_deref() == Some("String")).then(|| "String".to_string());
                Ok((
                    Expr::Index {
                        object: Box::new(object),
                        index: Box::new(index),
                        position,
                    },
                    ty,
                ))
            }
            Expr::Lambda {
                params,
                body,
                position,
            } => {
                let body = self.scoped(|this| {
                    for param in &params {
                        this.declare(param, None);
                    }
                    this.expr(*body).map(|(body, _)| body)
                })?;
                Ok((
                    Expr::Lambda {
                        params,
                        body: Box::new(body),
                        position,
                    },
                    Some("Function".to_string()),
                ))
            }
            Expr::If {
                condition,
                then_expr,
                else_expr,
                position,
            } => {
                let (condition, _) = self.expr(*condition)?;
                let (then_expr, then_ty) = self.expr(*then_expr)?;
                let (else_expr, else_ty) = self.expr(*else_expr)?;
                let ty = if then_ty == else_ty { then_ty } else { None };
                Ok((
                    Expr::If {
                        condition: Box::new(condition),
                        then_expr: Box::new(then_expr),
                        else_expr: Box::new(else_expr),
                        position,
                    },
                    ty,
                ))
            }
            hooked @ Expr::Hooked { .. } => Ok((hooked, None)),
        }
    }

    fn call(
        &mut self,
        callee: Expr,
        args: Vec<Expr>,
        position: crate::tokenizer::Position,
    ) -> Result<(Expr, Option<String>), ViolationRule> {
        let args = self.exprs(args)?;

        let global = match &callee {
            Expr::Identifier { name, .. }
                if self.lookup(name).is_none() && is_global_function(name) =>
            {
                Some(name.clone())
            }
            _ => None,
        };

        let (callee, hook, ty) = match global {
            Some(name) if self.sandboxed() => {
                let (hook, ty) = self.resolve(GLOBAL_TYPE, &name, MemberKind::Method)?;
                (callee, hook, ty)
            }
            Some(name) => {
                let ty = self
                    .catalog
                    .result_type(GLOBAL_TYPE, &name, MemberKind::Method)
                    .map(str::to_string);
                (callee, Hook::Interrupt, ty)
            }
            None => {
                let (callee, _) = self.expr(callee)?;
                (callee, Hook::Interrupt, None)
            }
        };

        let call = Expr::Call {
            callee: Box::new(callee),
            args,
            position,
        };
        Ok((Expr::hooked(hook, call), ty))
    }

    /// Instrument an assignment target: its sub-expressions are reads, the
    /// target itself is a write.
    fn place(&mut self, target: Expr) -> Result<Expr, ViolationRule> {
        match target {
            Expr::Identifier { ref name, .. } => {
                let name = name.clone();
                self.forget(&name);
                Ok(target)
            }
            Expr::Member {
                object,
                property,
                position,
            } => Ok(Expr::Member {
                object: Box::new(self.place_container(*object)?),
                property,
                position,
            }),
            Expr::Index {
                object,
                index,
                position,
            } => {
                let (index, _) = self.expr(*index)?;
                Ok(Expr::Index {
                    object: Box::new(self.place_container(*object)?),
                    index: Box::new(index),
                    position,
                })
            }
            other => Ok(self.expr(other)?.0),
        }
    }

    /// The container of a written field is read and then written back.
    fn place_container(&mut self, object: Expr) -> Result<Expr, ViolationRule> {
        let (object, _) = self.expr(object)?;
        if let Expr::Identifier { name, .. } = &object {
            let name = name.clone();
            self.forget(&name);
        }
        Ok(object)
    }
}

fn binary_type(op: BinaryOp, left: Option<&str>, right: Option<&str>) -> Option<String> {
    let ty = match op {
        BinaryOp::Equal
        | BinaryOp::NotEqual
        | BinaryOp::Less
        | BinaryOp::Greater
        | BinaryOp::LessEqual
        | BinaryOp::GreaterEqual
        | BinaryOp::And
        | BinaryOp::Or => "Bool",
        BinaryOp::Add if left == Some("String") || right == Some("String") => "String",
        BinaryOp::Add if left == Some("Array") && right == Some("Array") => "Array",
        BinaryOp::Modulo if left == Some("Int") && right == Some("Int") => "Int",
        BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide => {
            match (left?, right?) {
                ("Int", "Int") => "Int",
                ("Int" | "Float", "Int" | "Float") => "Float",
                _ => return None,
            }
        }
        BinaryOp::Modulo => return None,
    };
    Some(ty.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whitelist::WhitelistEntry;

    fn whitelist() -> WhitelistPolicy {
        WhitelistPolicy::new(
            vec![
                WhitelistEntry::method("String", "upper"),
                WhitelistEntry::method("Array", "size"),
                WhitelistEntry::method(GLOBAL_TYPE, "range"),
            ],
            &TypeCatalog::builtin(),
        )
        .expect("whitelist")
    }

    fn prepare(source: &str, trust: TrustLevel) -> Result<PreparedScript, Rejection> {
        let whitelist = whitelist();
        let catalog = TypeCatalog::builtin();
        let mut instrumenter = Instrumenter::new(&whitelist, &catalog, trust, HashMap::new());
        instrumenter.prepare(source, "test")
    }

    fn count_hooks(program: &Program) -> (usize, usize, usize) {
        let text = format!("{:?}", program);
        (
            text.matches("Call(EntryId").count(),
            text.matches("Hook { hook: Loop").count(),
            text.matches("DynamicCall").count(),
        )
    }

    #[test]
    fn rejects_undeclared_operation_on_known_type() {
        let rejection = prepare("let s = \"x\"\ns.lower()", TrustLevel::Sandboxed)
            .expect_err("should be rejected");
        assert_eq!(
            rejection,
            Rejection::Violation(ViolationRule::UndeclaredOperation {
                owner: "String".into(),
                member: "lower".into(),
                kind: MemberKind::Method,
            })
        );
    }

    #[test]
    fn rejects_undeclared_global_function() {
        let rejection = prepare("len([1, 2])", TrustLevel::Sandboxed).expect_err("rejected");
        assert!(matches!(
            rejection,
            Rejection::Violation(ViolationRule::UndeclaredOperation { ref owner, .. }) if owner == GLOBAL_TYPE
        ));
    }

    #[test]
    fn hooks_calls_and_loops() {
        let prepared = prepare(
            "let xs = range(3)\nfor x in xs {\n  \"a\".upper()\n}\nwhile false { }\nxs.size()",
            TrustLevel::Sandboxed,
        )
        .expect("prepared");
        let (calls, loops, dynamic) = count_hooks(&prepared.program);
        assert_eq!(calls, 3);
        assert_eq!(loops, 2);
        assert_eq!(dynamic, 0);
    }

    #[test]
    fn unknown_receivers_get_runtime_checks() {
        let prepared = prepare(
            "fn shout(v) { return v.lower() }\nshout(\"x\")",
            TrustLevel::Sandboxed,
        )
        .expect("prepared");
        let (_, _, dynamic) = count_hooks(&prepared.program);
        assert_eq!(dynamic, 1);
    }

    #[test]
    fn mutable_and_reassigned_names_lose_their_type() {
        let prepared = prepare("let mut s = \"x\"\ns.lower()", TrustLevel::Sandboxed)
            .expect("mutable binding is dynamic");
        assert_eq!(count_hooks(&prepared.program).2, 1);
    }

    #[test]
    fn map_field_reads_keep_a_runtime_check() {
        let prepared = prepare("let m = { a: 1 }\nm.a", TrustLevel::Sandboxed).expect("prepared");
        let text = format!("{:?}", prepared.program);
        assert!(text.contains("DynamicProperty"));
        assert!(!text.contains("EntryId"));
    }

    #[test]
    fn privileged_scripts_only_get_interrupt_checks() {
        let prepared = prepare("let s = \"x\"\nwhile true { s.lower() }", TrustLevel::Privileged)
            .expect("privileged scripts are not rejected");
        let text = format!("{:?}", prepared.program);
        assert!(text.contains("Interrupt"));
        assert!(!text.contains("Loop"));
        assert!(!text.contains("EntryId"));
    }

    #[test]
    fn later_units_see_earlier_declarations() {
        let whitelist = whitelist();
        let catalog = TypeCatalog::builtin();
        let mut bindings = HashMap::new();
        bindings.insert("name".to_string(), "String".to_string());
        let mut instrumenter =
            Instrumenter::new(&whitelist, &catalog, TrustLevel::Sandboxed, bindings);

        instrumenter
            .prepare("let shared = name.upper()", "first")
            .expect("first");
        let rejection = instrumenter
            .prepare("shared.trim()", "second")
            .expect_err("typed from the first unit");
        assert!(matches!(rejection, Rejection::Violation(_)));
    }

    #[test]
    fn parse_errors_are_compile_rejections() {
        assert!(matches!(
            prepare("let = 2", TrustLevel::Sandboxed),
            Err(Rejection::Compile(_))
        ));
    }
}

//=====================================================
// End of file
//=====================================================
