//=====================================================
// File: parser/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Recursive descent parser for sandboxed scripts
// Objective: Build the AST consumed by the instrumenter and interpreter,
//            with positioned errors that become compile diagnostics
//=====================================================

use crate::ast::{
    BinaryOp, Expr, FunctionDecl, Literal, Program, Stmt, UnaryOp, VariableDecl,
};
use crate::tokenizer::{LexError, Position, Token, TokenKind, Tokenizer};

/// Parser error types
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    UnexpectedToken {
        expected: String,
        found: TokenKind,
        position: Position,
    },
    UnexpectedEndOfInput {
        expected: String,
        position: Position,
    },
    InvalidSyntax {
        message: String,
        position: Position,
    },
    InvalidToken {
        message: String,
        position: Position,
    },
}

impl ParseError {
    pub fn position(&self) -> Position {
        match self {
            ParseError::UnexpectedToken { position, .. }
            | ParseError::UnexpectedEndOfInput { position, .. }
            | ParseError::InvalidSyntax { position, .. }
            | ParseError::InvalidToken { position, .. } => *position,
        }
    }

    /// Message without the trailing location, for structured diagnostics.
    pub fn message(&self) -> String {
        match self {
            ParseError::UnexpectedToken {
                expected, found, ..
            } => format!("Expected {} but found {}", expected, found),
            ParseError::UnexpectedEndOfInput { expected, .. } => {
                format!("Unexpected end of input, expected {}", expected)
            }
            ParseError::InvalidSyntax { message, .. } => format!("Invalid syntax: {}", message),
            ParseError::InvalidToken { message, .. } => message.clone(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let position = self.position();
        write!(
            f,
            "{} at line {}, column {}",
            self.message(),
            position.line,
            position.column
        )
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(value: LexError) -> Self {
        ParseError::InvalidToken {
            message: value.message,
            position: value.position,
        }
    }
}

/// Tokenize and parse `source` in one step.
pub fn parse_source(source: &str) -> Result<Program, ParseError> {
    let tokens = Tokenizer::new(source).tokenize()?;
    Parser::new(tokens).parse()
}

/// Deepest nesting of statements and expressions a script may use.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Recursive descent parser
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    depth: usize,
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if !matches!(tokens.last(), Some(token) if token.kind == TokenKind::Eof) {
            let position = tokens.last().map(|t| t.position).unwrap_or_default();
            tokens.push(Token::new(TokenKind::Eof, position));
        }
        Self {
            tokens,
            current: 0,
            depth: 0,
        }
    }

    /// Parse a complete program
    pub fn parse(&mut self) -> Result<Program, ParseError> {
        let position = self.current_position();
        let mut statements = Vec::new();

        loop {
            self.skip_separators();
            if self.is_at_end() {
                break;
            }
            statements.push(self.parse_statement()?);
        }

        Ok(Program::new(statements, position))
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        self.enter()?;
        let stmt = self.parse_statement_kind();
        self.leave(1);
        stmt
    }

    fn parse_statement_kind(&mut self) -> Result<Stmt, ParseError> {
        match &self.peek().kind {
            TokenKind::Let => self.parse_variable_declaration(),
            TokenKind::Fn if matches!(self.peek_next().kind, TokenKind::Identifier(_)) => {
                self.parse_function_declaration()
            }
            TokenKind::If => self.parse_if_statement(),
            TokenKind::While => self.parse_while_statement(),
            TokenKind::For => self.parse_for_statement(),
            TokenKind::Return => self.parse_return_statement(),
            TokenKind::Break => {
                let position = self.current_position();
                self.advance();
                self.consume_statement_terminator()?;
                Ok(Stmt::Break { position })
            }
            TokenKind::Continue => {
                let position = self.current_position();
                self.advance();
                self.consume_statement_terminator()?;
                Ok(Stmt::Continue { position })
            }
            TokenKind::LeftBrace => self.parse_block_statement(),
            _ => self.parse_expression_statement(),
        }
    }

    /// `let [mut] name [= value];`
    fn parse_variable_declaration(&mut self) -> Result<Stmt, ParseError> {
        let position = self.current_position();
        self.consume(&TokenKind::Let, "'let'")?;

        let is_mutable = self.match_token(&TokenKind::Mut);
        let name = self.consume_identifier("variable name")?;

        let initializer = if self.match_token(&TokenKind::Equal) {
            Some(self.parse_expression()?)
        } else {
            None
        };

        self.consume_statement_terminator()?;

        Ok(Stmt::VariableDecl {
            decl: VariableDecl {
                name,
                is_mutable,
                initializer,
                position,
            },
        })
    }

    /// `fn name(params) { body }`
    fn parse_function_declaration(&mut self) -> Result<Stmt, ParseError> {
        let position = self.current_position();
        self.consume(&TokenKind::Fn, "'fn'")?;
        let name = self.consume_identifier("function name")?;

        self.consume(&TokenKind::LeftParen, "'(' after function name")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                params.push(self.consume_identifier("parameter name")?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "')' after parameters")?;

        self.skip_newlines();
        self.consume(&TokenKind::LeftBrace, "'{' before function body")?;
        let body = self.parse_block_body()?;

        Ok(Stmt::FunctionDecl {
            decl: FunctionDecl {
                name,
                params,
                body,
                position,
            },
        })
    }

    /// `if condition stmt [else stmt]`, or an `if .. then .. else ..` expression statement
    fn parse_if_statement(&mut self) -> Result<Stmt, ParseError> {
        let position = self.current_position();
        self.consume(&TokenKind::If, "'if'")?;
        let condition = self.parse_expression()?;

        if self.check(&TokenKind::Then) {
            let expr = self.finish_if_expression(condition, position)?;
            self.consume_statement_terminator()?;
            return Ok(Stmt::Expression { expr, position });
        }

        self.skip_newlines();
        let then_branch = Box::new(self.parse_statement()?);

        let checkpoint = self.current;
        self.skip_newlines();
        let else_branch = if self.match_token(&TokenKind::Else) {
            self.skip_newlines();
            Some(Box::new(self.parse_statement()?))
        } else {
            self.current = checkpoint;
            None
        };

        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
            position,
        })
    }

    /// `while condition stmt`
    fn parse_while_statement(&mut self) -> Result<Stmt, ParseError> {
        let position = self.current_position();
        self.consume(&TokenKind::While, "'while'")?;

        let condition = self.parse_expression()?;
        self.skip_newlines();
        let body = Box::new(self.parse_statement()?);

        Ok(Stmt::While {
            condition,
            body,
            position,
        })
    }

    /// `for variable in iterable stmt`
    fn parse_for_statement(&mut self) -> Result<Stmt, ParseError> {
        let position = self.current_position();
        self.consume(&TokenKind::For, "'for'")?;

        let variable = self.consume_identifier("loop variable")?;
        self.consume(&TokenKind::In, "'in' after loop variable")?;

        let iterable = self.parse_expression()?;
        self.skip_newlines();
        let body = Box::new(self.parse_statement()?);

        Ok(Stmt::For {
            variable,
            iterable,
            body,
            position,
        })
    }

    /// `return [expression];`
    fn parse_return_statement(&mut self) -> Result<Stmt, ParseError> {
        let position = self.current_position();
        self.consume(&TokenKind::Return, "'return'")?;

        let value = if self.at_statement_end() {
            None
        } else {
            Some(self.parse_expression()?)
        };

        self.consume_statement_terminator()?;
        Ok(Stmt::Return { value, position })
    }

    fn parse_block_statement(&mut self) -> Result<Stmt, ParseError> {
        let position = self.current_position();
        self.consume(&TokenKind::LeftBrace, "'{'")?;
        let statements = self.parse_block_body()?;
        Ok(Stmt::Block {
            statements,
            position,
        })
    }

    /// Statements up to and including the closing brace
    fn parse_block_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut statements = Vec::new();

        loop {
            self.skip_separators();
            if self.check(&TokenKind::RightBrace) {
                break;
            }
            if self.is_at_end() {
                return Err(ParseError::UnexpectedEndOfInput {
                    expected: "'}'".to_string(),
                    position: self.current_position(),
                });
            }
            statements.push(self.parse_statement()?);
        }

        self.consume(&TokenKind::RightBrace, "'}'")?;
        Ok(statements)
    }

    fn parse_expression_statement(&mut self) -> Result<Stmt, ParseError> {
        let expr = self.parse_expression()?;
        let position = expr.position();
        self.consume_statement_terminator()?;
        Ok(Stmt::Expression { expr, position })
    }

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let expr = self.parse_assignment();
        self.leave(1);
        expr
    }

    /// `target = value`, right associative
    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_logical_or()?;

        if self.check(&TokenKind::Equal) {
            let position = self.current_position();
            self.advance();
            let value = self.parse_assignment()?;

            return match expr {
                Expr::Identifier { .. } | Expr::Member { .. } | Expr::Index { .. } => {
                    Ok(Expr::Assignment {
                        target: Box::new(expr),
                        value: Box::new(value),
                        position,
                    })
                }
                _ => Err(ParseError::InvalidSyntax {
                    message: "invalid assignment target".to_string(),
                    position,
                }),
            };
        }

        Ok(expr)
    }

    fn parse_logical_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_logical_and()?;
        let mut nested = 0;
        while self.check(&TokenKind::Or) {
            self.enter()?;
            nested += 1;
            let position = self.current_position();
            self.advance();
            let right = self.parse_logical_and()?;
            expr = binary(expr, BinaryOp::Or, right, position);
        }
        self.leave(nested);
        Ok(expr)
    }

    fn parse_logical_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_equality()?;
        let mut nested = 0;
        while self.check(&TokenKind::And) {
            self.enter()?;
            nested += 1;
            let position = self.current_position();
            self.advance();
            let right = self.parse_equality()?;
            expr = binary(expr, BinaryOp::And, right, position);
        }
        self.leave(nested);
        Ok(expr)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_comparison()?;
        let mut nested = 0;
        while let Some((op, position)) =
            self.match_binary_op(&[TokenKind::EqualEqual, TokenKind::NotEqual])
        {
            self.enter()?;
            nested += 1;
            let right = self.parse_comparison()?;
            expr = binary(expr, op, right, position);
        }
        self.leave(nested);
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_term()?;
        let mut nested = 0;
        while let Some((op, position)) = self.match_binary_op(&[
            TokenKind::Less,
            TokenKind::Greater,
            TokenKind::LessEqual,
            TokenKind::GreaterEqual,
        ]) {
            self.enter()?;
            nested += 1;
            let right = self.parse_term()?;
            expr = binary(expr, op, right, position);
        }
        self.leave(nested);
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_factor()?;
        let mut nested = 0;
        while let Some((op, position)) = self.match_binary_op(&[TokenKind::Plus, TokenKind::Minus])
        {
            self.enter()?;
            nested += 1;
            let right = self.parse_factor()?;
            expr = binary(expr, op, right, position);
        }
        self.leave(nested);
        Ok(expr)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_unary()?;
        let mut nested = 0;
        while let Some((op, position)) =
            self.match_binary_op(&[TokenKind::Star, TokenKind::Slash, TokenKind::Percent])
        {
            self.enter()?;
            nested += 1;
            let right = self.parse_unary()?;
            expr = binary(expr, op, right, position);
        }
        self.leave(nested);
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let operator = match self.peek().kind {
            TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Minus),
            _ => None,
        };

        if let Some(operator) = operator {
            let position = self.current_position();
            self.advance();
            self.enter()?;
            let operand = self.parse_unary()?;
            self.leave(1);
            return Ok(Expr::Unary {
                operator,
                operand: Box::new(operand),
                position,
            });
        }

        self.parse_postfix()
    }

    /// Calls, member access, method calls and indexing
    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        let mut nested = 0;

        loop {
            if matches!(
                self.peek().kind,
                TokenKind::LeftParen | TokenKind::Dot | TokenKind::LeftBracket
            ) {
                self.enter()?;
                nested += 1;
            }
            let position = self.current_position();
            if self.match_token(&TokenKind::LeftParen) {
                let args = self.parse_arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    position,
                };
            } else if self.match_token(&TokenKind::Dot) {
                let member = self.consume_identifier("member name after '.'")?;
                if self.match_token(&TokenKind::LeftParen) {
                    let args = self.parse_arguments()?;
                    expr = Expr::MethodCall {
                        receiver: Box::new(expr),
                        method: member,
                        args,
                        position,
                    };
                } else {
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: member,
                        position,
                    };
                }
            } else if self.match_token(&TokenKind::LeftBracket) {
                let index = self.parse_expression()?;
                self.consume(&TokenKind::RightBracket, "']' after index")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    position,
                };
            } else {
                break;
            }
        }

        self.leave(nested);
        Ok(expr)
    }

    /// Arguments after an opening parenthesis, including the closing one
    fn parse_arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "')' after arguments")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.peek().clone();
        let position = token.position;

        let literal = match &token.kind {
            TokenKind::Integer(n) => Some(Literal::Integer(*n)),
            TokenKind::Float(f) => Some(Literal::Float(*f)),
            TokenKind::String(s) => Some(Literal::String(s.clone())),
            TokenKind::Boolean(b) => Some(Literal::Boolean(*b)),
            TokenKind::Null => Some(Literal::Null),
            _ => None,
        };
        if let Some(value) = literal {
            self.advance();
            return Ok(Expr::Literal { value, position });
        }

        match &token.kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(Expr::Identifier { name, position })
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.consume(&TokenKind::RightParen, "')' after expression")?;
                Ok(expr)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check(&TokenKind::RightBracket) {
                    loop {
                        elements.push(self.parse_expression()?);
                        if !self.match_token(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(&TokenKind::RightBracket, "']' after array elements")?;
                Ok(Expr::Array { elements, position })
            }
            TokenKind::LeftBrace => self.parse_object_literal(),
            TokenKind::If => {
                self.advance();
                let condition = self.parse_expression()?;
                self.finish_if_expression(condition, position)
            }
            TokenKind::Lambda => self.parse_lambda_expression(),
            TokenKind::Eof => Err(ParseError::UnexpectedEndOfInput {
                expected: "expression".to_string(),
                position,
            }),
            _ => Err(ParseError::UnexpectedToken {
                expected: "expression".to_string(),
                found: token.kind.clone(),
                position,
            }),
        }
    }

    /// `{ key: value, ... }`
    fn parse_object_literal(&mut self) -> Result<Expr, ParseError> {
        let position = self.current_position();
        self.consume(&TokenKind::LeftBrace, "'{'")?;

        let mut fields = Vec::new();
        self.skip_newlines();
        if !self.check(&TokenKind::RightBrace) {
            loop {
                self.skip_newlines();
                let key = match &self.peek().kind {
                    TokenKind::Identifier(name) => name.clone(),
                    TokenKind::String(s) => s.clone(),
                    other => {
                        return Err(ParseError::UnexpectedToken {
                            expected: "property name".to_string(),
                            found: other.clone(),
                            position: self.current_position(),
                        });
                    }
                };
                self.advance();

                self.consume(&TokenKind::Colon, "':' after property name")?;
                let value = self.parse_expression()?;
                fields.push((key, value));

                self.skip_newlines();
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(&TokenKind::RightBrace) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(&TokenKind::RightBrace, "'}' after object literal")?;

        Ok(Expr::Object { fields, position })
    }

    /// Remainder of `if condition then expr else expr`
    fn finish_if_expression(
        &mut self,
        condition: Expr,
        position: Position,
    ) -> Result<Expr, ParseError> {
        self.consume(&TokenKind::Then, "'then' after if condition")?;
        let then_expr = self.parse_expression()?;
        self.consume(&TokenKind::Else, "'else' after then expression")?;
        let else_expr = self.parse_expression()?;

        Ok(Expr::If {
            condition: Box::new(condition),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
            position,
        })
    }

    /// `lambda |a, b| -> expr`
    fn parse_lambda_expression(&mut self) -> Result<Expr, ParseError> {
        let position = self.current_position();
        self.consume(&TokenKind::Lambda, "'lambda'")?;

        let mut params = Vec::new();
        if !self.match_token(&TokenKind::Or) {
            self.consume(&TokenKind::Pipe, "'|' before lambda parameters")?;
            if !self.check(&TokenKind::Pipe) {
                loop {
                    params.push(self.consume_identifier("parameter name")?);
                    if !self.match_token(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(&TokenKind::Pipe, "'|' after lambda parameters")?;
        }
        self.consume(&TokenKind::Arrow, "'->' after lambda parameters")?;

        let body = self.parse_expression()?;
        Ok(Expr::Lambda {
            params,
            body: Box::new(body),
            position,
        })
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::InvalidSyntax {
                message: format!("nesting deeper than {} levels", MAX_NESTING_DEPTH),
                position: self.current_position(),
            });
        }
        Ok(())
    }

    fn leave(&mut self, levels: usize) {
        self.depth = self.depth.saturating_sub(levels);
    }

    fn peek(&self) -> &Token {
        let index = self.current.min(self.tokens.len() - 1);
        &self.tokens[index]
    }

    fn peek_next(&self) -> &Token {
        let index = (self.current + 1).min(self.tokens.len() - 1);
        &self.tokens[index]
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.current += 1;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, expected: &str) -> Result<(), ParseError> {
        if self.match_token(kind) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn consume_identifier(&mut self, expected: &str) -> Result<String, ParseError> {
        if let TokenKind::Identifier(name) = &self.peek().kind {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let token = self.peek();
        if token.kind == TokenKind::Eof {
            ParseError::UnexpectedEndOfInput {
                expected: expected.to_string(),
                position: token.position,
            }
        } else {
            ParseError::UnexpectedToken {
                expected: expected.to_string(),
                found: token.kind.clone(),
                position: token.position,
            }
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Semicolon | TokenKind::Newline | TokenKind::RightBrace | TokenKind::Eof
        )
    }

    /// Semicolon or newline; a closing brace or end of input also ends a statement.
    fn consume_statement_terminator(&mut self) -> Result<(), ParseError> {
        match self.peek().kind {
            TokenKind::Semicolon | TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::RightBrace | TokenKind::Eof => Ok(()),
            _ => Err(self.unexpected("statement terminator")),
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek().kind, TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn current_position(&self) -> Position {
        self.peek().position
    }

    fn match_binary_op(&mut self, kinds: &[TokenKind]) -> Option<(BinaryOp, Position)> {
        let position = self.current_position();
        let kind = kinds.iter().find(|kind| self.check(kind))?;
        let op = match kind {
            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus => BinaryOp::Subtract,
            TokenKind::Star => BinaryOp::Multiply,
            TokenKind::Slash => BinaryOp::Divide,
            TokenKind::Percent => BinaryOp::Modulo,
            TokenKind::EqualEqual => BinaryOp::Equal,
            TokenKind::NotEqual => BinaryOp::NotEqual,
            TokenKind::Less => BinaryOp::Less,
            TokenKind::Greater => BinaryOp::Greater,
            TokenKind::LessEqual => BinaryOp::LessEqual,
            TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
            _ => return None,
        };
        self.advance();
        Some((op, position))
    }
}

fn binary(left: Expr, operator: BinaryOp, right: Expr, position: Position) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        operator,
        right: Box::new(right),
        position,
    }
}


//=====================================================
// End of file
//=====================================================
