//=====================================================
// File: ast/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Abstract syntax tree for sandboxed scripts
// Objective: Define program, statement and expression nodes, including the
//            hook nodes the instrumenter splices in before execution
//=====================================================

use crate::tokenizer::Position;
use crate::whitelist::EntryId;
use std::fmt;

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::Greater => ">",
            BinaryOp::LessEqual => "<=",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        f.write_str(symbol)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Minus,
}

/// Literal values
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
}

/// Counting / interrupt checkpoints inserted by the instrumenter.
///
/// Scripts never contain hooks when they come out of the parser; only
/// [`crate::instrument::Instrumenter`] creates them.
#[derive(Debug, Clone, PartialEq)]
pub enum Hook {
    /// Statically resolved whitelisted operation: count against its cap.
    Call(EntryId),
    /// Method call whose owner type is only known at runtime.
    DynamicCall { member: String },
    /// Property read whose owner type is only known at runtime.
    DynamicProperty { member: String },
    /// Top of a loop body: count one iteration.
    Loop,
    /// Interrupt check only (privileged scripts).
    Interrupt,
}

/// Expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal {
        value: Literal,
        position: Position,
    },
    Array {
        elements: Vec<Expr>,
        position: Position,
    },
    Object {
        fields: Vec<(String, Expr)>,
        position: Position,
    },
    Identifier {
        name: String,
        position: Position,
    },
    Binary {
        left: Box<Expr>,
        operator: BinaryOp,
        right: Box<Expr>,
        position: Position,
    },
    Unary {
        operator: UnaryOp,
        operand: Box<Expr>,
        position: Position,
    },
    Assignment {
        target: Box<Expr>,
        value: Box<Expr>,
        position: Position,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        position: Position,
    },
    MethodCall {
        receiver: Box<Expr>,
        method: String,
        args: Vec<Expr>,
        position: Position,
    },
    Member {
        object: Box<Expr>,
        property: String,
        position: Position,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        position: Position,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
        position: Position,
    },
    If {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
        position: Position,
    },
    /// `expr` guarded by a hook that runs immediately before it.
    Hooked { hook: Hook, expr: Box<Expr> },
}

impl Expr {
    pub fn position(&self) -> Position {
        match self {
            Expr::Literal { position, .. }
            | Expr::Array { position, .. }
            | Expr::Object { position, .. }
            | Expr::Identifier { position, .. }
            | Expr::Binary { position, .. }
            | Expr::Unary { position, .. }
            | Expr::Assignment { position, .. }
            | Expr::Call { position, .. }
            | Expr::MethodCall { position, .. }
            | Expr::Member { position, .. }
            | Expr::Index { position, .. }
            | Expr::Lambda { position, .. }
            | Expr::If { position, .. } => *position,
            Expr::Hooked { expr, .. } => expr.position(),
        }
    }

    pub fn hooked(hook: Hook, expr: Expr) -> Self {
        Expr::Hooked {
            hook,
            expr: Box::new(expr),
        }
    }
}

/// Variable declarations
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDecl {
    pub name: String,
    pub is_mutable: bool,
    pub initializer: Option<Expr>,
    pub position: Position,
}

/// Function declarations
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub position: Position,
}

/// Statements
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    VariableDecl {
        decl: VariableDecl,
    },
    FunctionDecl {
        decl: FunctionDecl,
    },
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        position: Position,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
        position: Position,
    },
    For {
        variable: String,
        iterable: Expr,
        body: Box<Stmt>,
        position: Position,
    },
    Return {
        value: Option<Expr>,
        position: Position,
    },
    Break {
        position: Position,
    },
    Continue {
        position: Position,
    },
    Block {
        statements: Vec<Stmt>,
        position: Position,
    },
    Expression {
        expr: Expr,
        position: Position,
    },
    /// Standalone checkpoint, used at the top of loop bodies.
    Hook {
        hook: Hook,
        position: Position,
    },
}

impl Stmt {
    pub fn position(&self) -> Position {
        match self {
            Stmt::VariableDecl { decl } => decl.position,
            Stmt::FunctionDecl { decl } => decl.position,
            Stmt::If { position, .. }
            | Stmt::While { position, .. }
            | Stmt::For { position, .. }
            | Stmt::Return { position, .. }
            | Stmt::Break { position }
            | Stmt::Continue { position }
            | Stmt::Block { position, .. }
            | Stmt::Expression { position, .. }
            | Stmt::Hook { position, .. } => *position,
        }
    }
}

/// A parsed script
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
    pub position: Position,
}

impl Program {
    pub fn new(statements: Vec<Stmt>, position: Position) -> Self {
        Self {
            statements,
            position,
        }
    }
}

//=====================================================
// End of file
//=====================================================
