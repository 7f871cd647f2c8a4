//! Recursive descent parser for the factory script language.
//!
//! Parses a token stream from the lexer into a block-structured AST.
//! Handles assignment, external invocations (`module.function(...)`),
//! runner builtins, `if`/`else`, `while`, labels and `goto`, and
//! expressions with standard operator precedence.

use std::fmt;

use super::ast::{ArgList, BinaryOp, Builtin, Expression, Literal, Statement, UnaryOp};
use super::lexer::{Lexer, LexerError, Span, SpannedToken, Token};

/// Parse error with location information
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at {:?}: {}", self.span, self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<LexerError> for ParseError {
    fn from(err: LexerError) -> Self {
        ParseError {
            message: err.message,
            span: err.span,
        }
    }
}

/// Parser state
pub struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl Parser {
    /// Create a new parser from source code
    pub fn new(source: &str) -> Result<Self, ParseError> {
        let tokens: Vec<SpannedToken> = Lexer::new(source).collect::<Result<Vec<_>, _>>()?;

        Ok(Self { tokens, pos: 0 })
    }

    // -------------------------------------------------------------------------
    // Token navigation
    // -------------------------------------------------------------------------

    fn current(&self) -> &SpannedToken {
        static EOF_TOKEN: std::sync::OnceLock<SpannedToken> = std::sync::OnceLock::new();
        self.tokens.get(self.pos).unwrap_or_else(|| {
            EOF_TOKEN.get_or_init(|| SpannedToken {
                token: Token::Eof,
                span: Span::new(0, 0),
            })
        })
    }

    fn peek(&self) -> Token {
        self.current().token.clone()
    }

    fn peek_at(&self, offset: usize) -> Token {
        self.tokens
            .get(self.pos + offset)
            .map(|st| st.token.clone())
            .unwrap_or(Token::Eof)
    }

    fn peek_span(&self) -> Span {
        self.current().span
    }

    fn advance(&mut self) -> SpannedToken {
        let token = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(&self.peek()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, expected: &Token) -> Result<SpannedToken, ParseError> {
        if self.check(expected) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {}, found {}", expected, self.peek())))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(format!("expected identifier, found {}", self.peek()))),
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            message,
            span: self.peek_span(),
        }
    }

    /// Convert a byte offset to 1-based line/column
    pub fn offset_to_line_col(source: &str, offset: usize) -> (u32, u32) {
        let mut line = 1u32;
        let mut col = 1u32;
        for (i, ch) in source.char_indices() {
            if i >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }

    // -------------------------------------------------------------------------
    // Top-level parsing
    // -------------------------------------------------------------------------

    /// Parse a complete script body
    pub fn parse_script(&mut self) -> Result<Vec<Statement>, ParseError> {
        let mut statements = Vec::new();

        while !self.at_end() {
            statements.push(self.parse_statement()?);
        }

        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        match self.peek() {
            Token::DoubleColon => {
                self.advance();
                let name = self.expect_ident()?;
                Ok(Statement::Label(name))
            }
            Token::Goto => {
                self.advance();
                let name = self.expect_ident()?;
                Ok(Statement::Goto(name))
            }
            Token::If => self.parse_if(),
            Token::While => self.parse_while(),
            Token::Ident(_) => self.parse_simple_statement(),
            other => Err(self.error(format!("unexpected token at statement start: {}", other))),
        }
    }

    /// Assignment, invocation, or builtin call starting with an identifier
    fn parse_simple_statement(&mut self) -> Result<Statement, ParseError> {
        // module.function( ... ) with no assignment target
        if matches!(self.peek_at(1), Token::Dot)
            && matches!(self.peek_at(2), Token::Ident(_))
            && matches!(self.peek_at(3), Token::LParen)
        {
            let (module, function, args) = self.parse_invocation()?;
            return Ok(Statement::Invoke {
                target: None,
                module,
                function,
                args,
            });
        }

        // builtin( ... )
        if matches!(self.peek_at(1), Token::LParen) {
            return self.parse_builtin();
        }

        let target = self.expect_ident()?;
        self.expect(&Token::Eq)?;

        // target = module.function( ... )
        if matches!(self.peek(), Token::Ident(_))
            && matches!(self.peek_at(1), Token::Dot)
            && matches!(self.peek_at(2), Token::Ident(_))
            && matches!(self.peek_at(3), Token::LParen)
        {
            let (module, function, args) = self.parse_invocation()?;
            return Ok(Statement::Invoke {
                target: Some(target),
                module,
                function,
                args,
            });
        }

        let expr = self.parse_expression()?;
        Ok(Statement::Assign { target, expr })
    }

    fn parse_invocation(&mut self) -> Result<(String, String, ArgList), ParseError> {
        let module = self.expect_ident()?;
        self.expect(&Token::Dot)?;
        let function = self.expect_ident()?;
        let args = self.parse_arg_list()?;
        Ok((module, function, args))
    }

    fn parse_builtin(&mut self) -> Result<Statement, ParseError> {
        let name = self.expect_ident()?;
        let builtin = Builtin::from_name(&name)
            .ok_or_else(|| self.error(format!("unknown builtin function: {}", name)))?;
        let args = self.parse_arg_list()?;

        let mut msg = Expression::Literal(Literal::Str(String::new()));
        for (key, value) in args {
            if key == "msg" {
                msg = value;
            } else {
                return Err(self.error(format!(
                    "builtin {} takes only a msg argument, found {}",
                    name, key
                )));
            }
        }

        Ok(Statement::Builtin { builtin, msg })
    }

    /// Parse `( key=expr, ... )`
    fn parse_arg_list(&mut self) -> Result<ArgList, ParseError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();

        while !self.check(&Token::RParen) {
            let key = self.expect_ident()?;
            self.expect(&Token::Eq)?;
            let value = self.parse_expression()?;
            args.push((key, value));

            if self.check(&Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }

        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_if(&mut self) -> Result<Statement, ParseError> {
        self.expect(&Token::If)?;
        let cond = self.parse_expression()?;
        self.expect(&Token::Colon)?;
        let then_block = self.parse_block()?;

        let else_block = if self.check(&Token::Else) {
            self.advance();
            self.expect(&Token::Colon)?;
            self.parse_block()?
        } else {
            Vec::new()
        };

        Ok(Statement::If {
            cond,
            then_block,
            else_block,
        })
    }

    fn parse_while(&mut self) -> Result<Statement, ParseError> {
        self.expect(&Token::While)?;
        let cond = self.parse_expression()?;
        self.expect(&Token::Colon)?;
        let body = self.parse_block()?;
        Ok(Statement::While { cond, body })
    }

    /// Parse a block (INDENT statements+ DEDENT)
    fn parse_block(&mut self) -> Result<Vec<Statement>, ParseError> {
        self.expect(&Token::Indent)?;

        let mut statements = Vec::new();
        while !self.check(&Token::Dedent) && !self.at_end() {
            statements.push(self.parse_statement()?);
        }

        self.expect(&Token::Dedent)?;

        if statements.is_empty() {
            return Err(self.error("block may not be empty".to_string()));
        }

        Ok(statements)
    }

    // -------------------------------------------------------------------------
    // Expressions (precedence climbing)
    // -------------------------------------------------------------------------

    fn parse_expression(&mut self) -> Result<Expression, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_and()?;
        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expression::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_not()?;
        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Expression::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expression, ParseError> {
        if self.check(&Token::Not) {
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expression::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression, ParseError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_additive(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expression::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expression::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ParseError> {
        if self.check(&Token::Minus) {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expression::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        match self.peek() {
            Token::Int(i) => {
                self.advance();
                Ok(Expression::Literal(Literal::Int(i)))
            }
            Token::Float(f) => {
                self.advance();
                Ok(Expression::Literal(Literal::Float(f)))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expression::Literal(Literal::Str(s)))
            }
            Token::True => {
                self.advance();
                Ok(Expression::Literal(Literal::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(Expression::Literal(Literal::Bool(false)))
            }
            Token::None_ => {
                self.advance();
                Ok(Expression::Literal(Literal::Null))
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&Token::RBracket) {
                    items.push(self.parse_expression()?);
                    if self.check(&Token::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expression::List(items))
            }
            Token::Ident(_) => {
                let name = self.expect_ident()?;
                if self.check(&Token::Dot) {
                    self.advance();
                    let attr = self.expect_ident()?;
                    Ok(Expression::ModuleValue {
                        module: name,
                        name: attr,
                    })
                } else {
                    Ok(Expression::Variable(name))
                }
            }
            other => Err(self.error(format!("unexpected token in expression: {}", other))),
        }
    }
}
