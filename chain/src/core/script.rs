//! Scriptlet mini-language: lexer, parser and syntax tree.
//!
//! A scriptlet is a short sequence of statements separated by newlines or
//! `;`. A statement is either `name = expr` or a bare expression. Expressions
//! are literals (strings, integers, floats, `True`/`False`/`None` and their
//! lowercase JSON spellings), variable names, lists, `+`, and calls
//! `name(arg, key=value)`. Newlines inside brackets are ignored and `#` starts
//! a comment.
//!
//! Values are represented as [`serde_json::Value`] so tool arguments can be
//! packed without conversion.

use std::fmt;

use serde_json::{Number, Value};

/// Deepest bracket nesting the lexer accepts.
pub const MAX_NESTING: usize = 100;

/// Most operands a single `+` chain may have.
pub const MAX_OPERANDS: usize = 1_000;

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Call(Call),
}

impl Expr {
    /// Constant value of a literal, including negative numbers and lists of literals.
    pub fn as_literal(&self) -> Option<Value> {
        match self {
            Expr::Literal(value) => Some(value.clone()),
            Expr::List(items) => items
                .iter()
                .map(Expr::as_literal)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            _ => None,
        }
    }
}

/// Call expression `callee(args, key=value)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub callee: String,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { target: String, value: Expr },
    Expr(Expr),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

impl Program {
    /// The program's only statement when it is a single call expression.
    pub fn single_call(&self) -> Option<&Call> {
        match self.stmts.as_slice() {
            [Stmt::Expr(Expr::Call(call))] => Some(call),
            _ => None,
        }
    }
}

/// Parse failure with a 1-based source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (line {}, column {})",
            self.message, self.line, self.column
        )
    }
}

impl std::error::Error for SyntaxError {}

/// Parse scriptlet source into a [`Program`].
pub fn parse_program(source: &str) -> Result<Program, SyntaxError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser { tokens, pos: 0 }.program()
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Assign,
    Plus,
    Minus,
    Newline,
    Eof,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(name) => format!("name '{name}'"),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Int(_) | Tok::Float(_) => "number".to_string(),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::LBracket => "'['".to_string(),
            Tok::RBracket => "']'".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Assign => "'='".to_string(),
            Tok::Plus => "'+'".to_string(),
            Tok::Minus => "'-'".to_string(),
            Tok::Newline => "end of statement".to_string(),
            Tok::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    tok: Tok,
    line: usize,
    column: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    depth: usize,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>, line: usize, column: usize) -> SyntaxError {
        SyntaxError {
            message: message.into(),
            line,
            column,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            let (line, column) = (self.line, self.column);
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    tok: Tok::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };

            let tok = match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                    continue;
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                    continue;
                }
                '\n' | ';' => {
                    self.bump();
                    if self.depth > 0 {
                        if c == ';' {
                            return Err(self.error("unexpected ';' inside brackets", line, column));
                        }
                        continue;
                    }
                    Tok::Newline
                }
                '(' | '[' => {
                    self.bump();
                    if self.depth >= MAX_NESTING {
                        return Err(self.error("too many nested brackets", line, column));
                    }
                    self.depth += 1;
                    if c == '(' { Tok::LParen } else { Tok::LBracket }
                }
                ')' | ']' => {
                    self.bump();
                    if self.depth == 0 {
                        return Err(self.error(format!("unmatched '{c}'"), line, column));
                    }
                    self.depth -= 1;
                    if c == ')' { Tok::RParen } else { Tok::RBracket }
                }
                ',' => {
                    self.bump();
                    Tok::Comma
                }
                '=' => {
                    self.bump();
                    if self.peek() == Some('=') {
                        return Err(self.error("comparison is not supported", line, column));
                    }
                    Tok::Assign
                }
                '+' => {
                    self.bump();
                    Tok::Plus
                }
                '-' => {
                    self.bump();
                    Tok::Minus
                }
                '"' | '\'' => self.string(c, line, column)?,
                c if c.is_ascii_digit() => self.number(line, column)?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                    self.number(line, column)?
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(c) = self.peek() {
                        if c.is_alphanumeric() || c == '_' {
                            ident.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Tok::Ident(ident)
                }
                other => {
                    return Err(self.error(format!("invalid character '{other}'"), line, column));
                }
            };
            tokens.push(Token { tok, line, column });
        }
    }

    fn string(&mut self, quote: char, line: usize, column: usize) -> Result<Tok, SyntaxError> {
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        let opening = if triple { 3 } else { 1 };
        for _ in 0..opening {
            self.bump();
        }

        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated string literal", line, column));
            };
            match c {
                '\\' => {
                    let Some(escaped) = self.bump() else {
                        return Err(self.error("unterminated string literal", line, column));
                    };
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        '\\' | '\'' | '"' => out.push(escaped),
                        '\n' => {}
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                '\n' if !triple => {
                    return Err(self.error("unterminated string literal", line, column));
                }
                c if c == quote => {
                    if !triple {
                        return Ok(Tok::Str(out));
                    }
                    if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                        self.bump();
                        self.bump();
                        return Ok(Tok::Str(out));
                    }
                    out.push(c);
                }
                c => out.push(c),
            }
        }
    }

    fn number(&mut self, line: usize, column: usize) -> Result<Tok, SyntaxError> {
        let mut raw = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => raw.push(c),
                '_' => {}
                '.' if !is_float => {
                    is_float = true;
                    raw.push(c);
                }
                'e' | 'E' => {
                    is_float = true;
                    raw.push(c);
                    self.bump();
                    if let Some(sign @ ('+' | '-')) = self.peek() {
                        raw.push(sign);
                    } else {
                        continue;
                    }
                }
                _ => break,
            }
            self.bump();
        }
        if self
            .peek()
            .is_some_and(|c| c.is_alphabetic() || c == '_')
        {
            return Err(self.error("invalid numeric literal", line, column));
        }
        if is_float {
            raw.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.error(format!("invalid float literal '{raw}'"), line, column))
        } else {
            raw.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.error(format!("integer literal '{raw}' out of range"), line, column))
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_tok_at(&self, offset: usize) -> &Tok {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].tok
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.tok != Tok::Eof {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self, expected: &str) -> SyntaxError {
        let token = self.peek();
        SyntaxError {
            message: format!("expected {expected}, found {}", token.tok.describe()),
            line: token.line,
            column: token.column,
        }
    }

    fn expect(&mut self, tok: &Tok, expected: &str) -> Result<(), SyntaxError> {
        if &self.peek().tok == tok {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek().tok == Tok::Newline {
            self.advance();
        }
    }

    fn program(mut self) -> Result<Program, SyntaxError> {
        let mut stmts = Vec::new();
        self.skip_newlines();
        while self.peek().tok != Tok::Eof {
            stmts.push(self.statement()?);
            match self.peek().tok {
                Tok::Newline => self.skip_newlines(),
                Tok::Eof => {}
                _ => return Err(self.unexpected("end of statement")),
            }
        }
        Ok(Program { stmts })
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        if let (Tok::Ident(name), Tok::Assign) = (&self.peek().tok, self.peek_tok_at(1)) {
            if is_keyword(name) {
                return Err(self.unexpected("assignable name"));
            }
            let target = name.clone();
            self.advance();
            self.advance();
            let value = self.expr()?;
            return Ok(Stmt::Assign { target, value });
        }
        Ok(Stmt::Expr(self.expr()?))
    }

    fn expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.term()?;
        let mut operands = 1;
        while self.peek().tok == Tok::Plus {
            let plus = self.advance();
            operands += 1;
            if operands > MAX_OPERANDS {
                return Err(SyntaxError {
                    message: "expression has too many operands".to_string(),
                    line: plus.line,
                    column: plus.column,
                });
            }
            let rhs = self.term()?;
            lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.advance();
        match token.tok {
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::Int(i) => Ok(Expr::Literal(Value::from(i))),
            Tok::Float(f) => float_literal(f, &token),
            Tok::Minus => {
                let operand = self.advance();
                match operand.tok {
                    Tok::Int(i) => Ok(Expr::Literal(Value::from(-i))),
                    Tok::Float(f) => float_literal(-f, &operand),
                    _ => Err(SyntaxError {
                        message: "unary '-' is only supported on numbers".to_string(),
                        line: token.line,
                        column: token.column,
                    }),
                }
            }
            Tok::LBracket => {
                let items = self.sequence(&Tok::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::Ident(name) => match name.as_str() {
                "True" | "true" => Ok(Expr::Literal(Value::Bool(true))),
                "False" | "false" => Ok(Expr::Literal(Value::Bool(false))),
                "None" | "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek().tok == Tok::LParen => {
                    self.advance();
                    self.call(name)
                }
                _ => Ok(Expr::Name(name)),
            },
            other => Err(SyntaxError {
                message: format!("expected expression, found {}", other.describe()),
                line: token.line,
                column: token.column,
            }),
        }
    }

    fn sequence(&mut self, close: &Tok, expected: &str) -> Result<Vec<Expr>, SyntaxError> {
        let mut items = Vec::new();
        loop {
            if &self.peek().tok == close {
                self.advance();
                return Ok(items);
            }
            items.push(self.expr()?);
            if self.peek().tok == Tok::Comma {
                self.advance();
            } else {
                self.expect(close, expected)?;
                return Ok(items);
            }
        }
    }

    fn call(&mut self, callee: String) -> Result<Expr, SyntaxError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        loop {
            if self.peek().tok == Tok::RParen {
                self.advance();
                break;
            }
            if let (Tok::Ident(key), Tok::Assign) = (&self.peek().tok, self.peek_tok_at(1)) {
                let key = key.clone();
                self.advance();
                self.advance();
                kwargs.push((key, self.expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.unexpected("keyword argument after keyword arguments"));
                }
                args.push(self.expr()?);
            }
            if self.peek().tok == Tok::Comma {
                self.advance();
            } else {
                self.expect(&Tok::RParen, "')'")?;
                break;
            }
        }
        Ok(Expr::Call(Call {
            callee,
            args,
            kwargs,
        }))
    }
}

fn is_keyword(name: &str) -> bool {
    matches!(name, "True" | "False" | "None" | "true" | "false" | "null")
}

fn float_literal(f: f64, token: &Token) -> Result<Expr, SyntaxError> {
    Number::from_f64(f)
        .map(|n| Expr::Literal(Value::Number(n)))
        .ok_or_else(|| SyntaxError {
            message: "float literal is not finite".to_string(),
            line: token.line,
            column: token.column,
        })
}
