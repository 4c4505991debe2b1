//=====================================================
// File: tokenizer/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Lexical analysis for sandboxed scripts
// Objective: Turn script source into positioned tokens for the parser,
//            reporting malformed input with line/column information
//=====================================================

use std::collections::HashMap;
use std::fmt;

/// Represents the position of a token in the source code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }
}

/// All token kinds understood by the script language
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,

    Identifier(String),

    // Keywords
    Let,
    Mut,
    Fn,
    If,
    Then,
    Else,
    While,
    For,
    In,
    Return,
    Break,
    Continue,
    Lambda,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Equal,
    EqualEqual,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    And,
    Or,
    Not,
    Pipe,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Semicolon,
    Colon,
    Arrow,
    Dot,

    Newline,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Integer(n) => write!(f, "{}", n),
            TokenKind::Float(n) => write!(f, "{}", n),
            TokenKind::String(s) => write!(f, "\"{}\"", s),
            TokenKind::Boolean(b) => write!(f, "{}", b),
            TokenKind::Null => write!(f, "null"),
            TokenKind::Identifier(s) => write!(f, "{}", s),
            TokenKind::Newline => write!(f, "newline"),
            TokenKind::Eof => write!(f, "end of input"),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// A token with its kind and position information
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: Position,
}

impl Token {
    pub fn new(kind: TokenKind, position: Position) -> Self {
        Self { kind, position }
    }
}

/// Malformed input detected while tokenizing.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub position: Position,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at line {}, column {}",
            self.message, self.position.line, self.position.column
        )
    }
}

impl std::error::Error for LexError {}

/// Tokenizer for script source text
pub struct Tokenizer {
    input: Vec<char>,
    position: usize,
    line: usize,
    column: usize,
    keywords: HashMap<&'static str, TokenKind>,
    tokens: Vec<Token>,
    // Newlines inside () and [] never terminate a statement.
    nesting: usize,
}

impl Tokenizer {
    pub fn new(input: &str) -> Self {
        let keywords = HashMap::from([
            ("let", TokenKind::Let),
            ("mut", TokenKind::Mut),
            ("fn", TokenKind::Fn),
            ("if", TokenKind::If),
            ("then", TokenKind::Then),
            ("else", TokenKind::Else),
            ("while", TokenKind::While),
            ("for", TokenKind::For),
            ("in", TokenKind::In),
            ("return", TokenKind::Return),
            ("break", TokenKind::Break),
            ("continue", TokenKind::Continue),
            ("lambda", TokenKind::Lambda),
            ("null", TokenKind::Null),
            ("true", TokenKind::Boolean(true)),
            ("false", TokenKind::Boolean(false)),
        ]);

        Self {
            input: input.chars().collect(),
            position: 0,
            line: 1,
            column: 1,
            keywords,
            tokens: Vec::new(),
            nesting: 0,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        loop {
            self.skip_whitespace();
            if self.is_at_end() {
                break;
            }

            let start = self.current_position();
            let ch = self.current_char();

            if ch == '\n' {
                self.advance();
                if self.nesting == 0 {
                    self.push_token(TokenKind::Newline, start);
                }
                continue;
            }

            if ch == '/' && self.peek_char() == Some('/') {
                self.skip_comment();
                continue;
            }

            if ch == '"' {
                self.handle_string(start)?;
            } else if ch.is_ascii_digit() {
                self.handle_number(start)?;
            } else if ch.is_alphabetic() || ch == '_' {
                self.handle_identifier(start);
            } else {
                self.handle_operator_or_delimiter(start)?;
            }
        }

        let end = self.current_position();
        self.push_token(TokenKind::Eof, end);
        Ok(std::mem::take(&mut self.tokens))
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }

    fn current_char(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.input[self.position]
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    fn advance(&mut self) -> char {
        let ch = self.current_char();
        self.position += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        ch
    }

    fn current_position(&self) -> Position {
        Position::new(self.line, self.column, self.position)
    }

    fn push_token(&mut self, kind: TokenKind, position: Position) {
        self.tokens.push(Token::new(kind, position));
    }

    fn error(&self, message: impl Into<String>, position: Position) -> LexError {
        LexError {
            message: message.into(),
            position,
        }
    }

    fn skip_whitespace(&mut self) {
        while !self.is_at_end()
            && self.current_char().is_whitespace()
            && self.current_char() != '\n'
        {
            self.advance();
        }
    }

    fn skip_comment(&mut self) {
        while !self.is_at_end() && self.current_char() != '\n' {
            self.advance();
        }
    }

    fn handle_string(&mut self, start: Position) -> Result<(), LexError> {
        self.advance(); // opening quote

        let mut value = String::new();
        while !self.is_at_end() && self.current_char() != '"' {
            if self.current_char() == '\\' {
                self.advance();
                if self.is_at_end() {
                    return Err(self.error("Unterminated string literal", start));
                }
                match self.advance() {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
            } else {
                value.push(self.advance());
            }
        }

        if self.is_at_end() {
            return Err(self.error("Unterminated string literal", start));
        }

        self.advance(); // closing quote
        self.push_token(TokenKind::String(value), start);
        Ok(())
    }

    fn handle_number(&mut self, start: Position) -> Result<(), LexError> {
        let mut number = String::new();
        let mut is_float = false;

        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_ascii_digit() {
                number.push(self.advance());
            } else if ch == '.'
                && !is_float
                && self.peek_char().is_some_and(|next| next.is_ascii_digit())
            {
                // `1.abs()` stays a method call on an integer
                is_float = true;
                number.push(self.advance());
            } else {
                break;
            }
        }

        let kind = if is_float {
            number
                .parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error(format!("Invalid float literal: {}", number), start))?
        } else {
            number
                .parse::<i64>()
                .map(TokenKind::Integer)
                .map_err(|_| self.error(format!("Invalid integer literal: {}", number), start))?
        };
        self.push_token(kind, start);
        Ok(())
    }

    fn handle_identifier(&mut self, start: Position) {
        let mut identifier = String::new();
        while !self.is_at_end()
            && (self.current_char().is_alphanumeric() || self.current_char() == '_')
        {
            identifier.push(self.advance());
        }
        let kind = self
            .keywords
            .get(identifier.as_str())
            .cloned()
            .unwrap_or(TokenKind::Identifier(identifier));
        self.push_token(kind, start);
    }

    fn handle_operator_or_delimiter(&mut self, start: Position) -> Result<(), LexError> {
        let ch = self.advance();

        let kind = match ch {
            '+' => TokenKind::Plus,
            '-' => {
                if self.current_char() == '>' {
                    self.advance();
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '=' => {
                if self.current_char() == '=' {
                    self.advance();
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                }
            }
            '!' => {
                if self.current_char() == '=' {
                    self.advance();
                    TokenKind::NotEqual
                } else {
                    TokenKind::Not
                }
            }
            '<' => {
                if self.current_char() == '=' {
                    self.advance();
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                if self.current_char() == '=' {
                    self.advance();
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                }
            }
            '&' => {
                if self.current_char() == '&' {
                    self.advance();
                    TokenKind::And
                } else {
                    return Err(self.error(format!("Unexpected character: {}", ch), start));
                }
            }
            '|' => {
                if self.current_char() == '|' {
                    self.advance();
                    TokenKind::Or
                } else {
                    TokenKind::Pipe
                }
            }
            '(' => {
                self.nesting += 1;
                TokenKind::LeftParen
            }
            ')' => {
                self.nesting = self.nesting.saturating_sub(1);
                TokenKind::RightParen
            }
            '[' => {
                self.nesting += 1;
                TokenKind::LeftBracket
            }
            ']' => {
                self.nesting = self.nesting.saturating_sub(1);
                TokenKind::RightBracket
            }
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            ':' => TokenKind::Colon,
            '.' => TokenKind::Dot,
            _ => return Err(self.error(format!("Unexpected character: {}", ch), start)),
        };

        self.push_token(kind, start);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        let mut tokenizer = Tokenizer::new(input);
        tokenizer
            .tokenize()
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_basic_tokenization() {
        let expected = vec![
            TokenKind::Let,
            TokenKind::Identifier("x".to_string()),
            TokenKind::Equal,
            TokenKind::Integer(5),
            TokenKind::Plus,
            TokenKind::Integer(3),
            TokenKind::Star,
            TokenKind::LeftParen,
            TokenKind::Integer(2),
            TokenKind::Minus,
            TokenKind::Integer(1),
            TokenKind::RightParen,
            TokenKind::Semicolon,
            TokenKind::Eof,
        ];
        assert_eq!(kinds("let x = 5 + 3 * (2 - 1);"), expected);
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let expected = vec![
            TokenKind::Let,
            TokenKind::Mut,
            TokenKind::Fn,
            TokenKind::If,
            TokenKind::Else,
            TokenKind::Identifier("identifier".to_string()),
            TokenKind::Null,
            TokenKind::Lambda,
            TokenKind::Eof,
        ];
        assert_eq!(kinds("let mut fn if else identifier null lambda"), expected);
    }

    #[test]
    fn test_numbers_and_method_on_integer() {
        assert_eq!(
            kinds("42 0 123.456"),
            vec![
                TokenKind::Integer(42),
                TokenKind::Integer(0),
                TokenKind::Float(123.456),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("1.abs()"),
            vec![
                TokenKind::Integer(1),
                TokenKind::Dot,
                TokenKind::Identifier("abs".to_string()),
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("+ - * / == != <= >= && || -> = ! |"),
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::EqualEqual,
                TokenKind::NotEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::And,
                TokenKind::Or,
                TokenKind::Arrow,
                TokenKind::Equal,
                TokenKind::Not,
                TokenKind::Pipe,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""hello" "world\n""#),
            vec![
                TokenKind::String("hello".to_string()),
                TokenKind::String("world\n".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("// header\nlet x = 5 // trailing"),
            vec![
                TokenKind::Newline,
                TokenKind::Let,
                TokenKind::Identifier("x".to_string()),
                TokenKind::Equal,
                TokenKind::Integer(5),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_inside_brackets_are_dropped() {
        let tokens = kinds("f(1,\n2)\n[3,\n4]");
        let newlines = tokens
            .iter()
            .filter(|kind| matches!(kind, TokenKind::Newline))
            .count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_position_tracking() {
        let mut tokenizer = Tokenizer::new("let\n  x = 5");
        let tokens = tokenizer.tokenize().expect("tokenize");
        let x_token = tokens
            .iter()
            .find(|t| matches!(t.kind, TokenKind::Identifier(ref name) if name == "x"))
            .expect("identifier x");
        assert_eq!(x_token.position.line, 2);
        assert_eq!(x_token.position.column, 3);
    }

    #[test]
    fn test_unterminated_string_reports_start() {
        let mut tokenizer = Tokenizer::new("let s = \"abc");
        let err = tokenizer.tokenize().expect_err("should fail");
        assert_eq!(err.position.line, 1);
        assert_eq!(err.position.column, 9);
    }
}

//=====================================================
// End of file
//=====================================================
