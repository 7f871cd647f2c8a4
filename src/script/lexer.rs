//! Lexer for the factory script language.
//!
//! Uses logos for tokenization with custom handling for indentation
//! (INDENT/DEDENT tokens). The lexer tracks indentation levels with a
//! stack; at the start of each non-blank line it emits INDENT when the
//! level rises and one DEDENT per level dropped. Blank and comment-only
//! lines are skipped, and no INDENT/DEDENT is produced inside brackets.

use std::fmt;

use logos::{Logos, SpannedIter};

/// Source span (byte offsets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// A token with its span
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Token types for the factory script language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t]+")] // Skip horizontal whitespace (not newlines)
pub enum Token {
    // Keywords
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("goto")]
    Goto,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("True")]
    True,
    #[token("False")]
    False,
    #[token("None")]
    None_,

    // Identifiers
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Literals
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"[0-9]+", priority = 2, callback = |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""[^"]*""#, |lex| {
        let s = lex.slice();
        s[1..s.len()-1].to_string()
    })]
    Str(String),

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("=")]
    Eq,

    // Delimiters
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token("::")]
    DoubleColon,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,

    // Newline (tracked for indentation)
    #[regex(r"\n")]
    Newline,

    // Comment (skipped)
    #[regex(r"#[^\n]*")]
    Comment,

    // Synthetic tokens for indentation (not matched by logos directly)
    Indent,
    Dedent,

    // End of file
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::If => write!(f, "if"),
            Token::Else => write!(f, "else"),
            Token::While => write!(f, "while"),
            Token::Goto => write!(f, "goto"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Not => write!(f, "not"),
            Token::True => write!(f, "True"),
            Token::False => write!(f, "False"),
            Token::None_ => write!(f, "None"),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Float(n) => write!(f, "{}", n),
            Token::Int(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Le => write!(f, "<="),
            Token::Ge => write!(f, ">="),
            Token::Eq => write!(f, "="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::DoubleColon => write!(f, "::"),
            Token::Colon => write!(f, ":"),
            Token::Dot => write!(f, "."),
            Token::Newline => write!(f, "\\n"),
            Token::Comment => write!(f, "# comment"),
            Token::Indent => write!(f, "INDENT"),
            Token::Dedent => write!(f, "DEDENT"),
            Token::Eof => write!(f, "EOF"),
        }
    }
}

/// Lexer error
#[derive(Debug, Clone, PartialEq)]
pub struct LexerError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for LexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {:?}", self.message, self.span)
    }
}

impl std::error::Error for LexerError {}

/// Lexer wrapper that handles indentation
pub struct Lexer<'source> {
    source: &'source str,
    inner: SpannedIter<'source, Token>,
    indent_stack: Vec<usize>,
    pending_tokens: Vec<SpannedToken>,
    at_line_start: bool,
    done: bool,
    /// Bracket nesting depth - no INDENT/DEDENT inside brackets
    bracket_depth: usize,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            source,
            inner: Token::lexer(source).spanned(),
            indent_stack: vec![0],
            pending_tokens: Vec::new(),
            at_line_start: true,
            done: false,
            bracket_depth: 0,
        }
    }

    /// Measure the indentation at a given position (start of line)
    fn measure_indent(&self, pos: usize) -> usize {
        let mut indent = 0;
        for ch in self.source[pos..].chars() {
            match ch {
                ' ' => indent += 1,
                '\t' => indent += 4, // Treat tabs as 4 spaces
                _ => break,
            }
        }
        indent
    }

    /// Find the start of the current line
    fn line_start(&self, pos: usize) -> usize {
        self.source[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0)
    }

    /// Check if a line is blank or comment-only
    fn is_blank_line(&self, line_start: usize) -> bool {
        for ch in self.source[line_start..].chars() {
            match ch {
                ' ' | '\t' => continue,
                '\n' => return true,
                '#' => return true,
                _ => return false,
            }
        }
        true // End of file
    }

    /// Process indentation at the start of a line
    fn process_indentation(&mut self, line_start: usize, token_start: usize) {
        let indent = self.measure_indent(line_start);
        let current = *self.indent_stack.last().unwrap();

        if indent > current {
            self.indent_stack.push(indent);
            self.pending_tokens.push(SpannedToken {
                token: Token::Indent,
                span: Span::new(line_start, token_start),
            });
        } else if indent < current {
            while let Some(&top) = self.indent_stack.last() {
                if top <= indent {
                    break;
                }
                self.indent_stack.pop();
                self.pending_tokens.push(SpannedToken {
                    token: Token::Dedent,
                    span: Span::new(line_start, token_start),
                });
            }
        }
    }

    /// Emit remaining dedents at end of file
    fn emit_final_dedents(&mut self) {
        let pos = self.source.len();
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.pending_tokens.push(SpannedToken {
                token: Token::Dedent,
                span: Span::new(pos, pos),
            });
        }
        self.pending_tokens.push(SpannedToken {
            token: Token::Eof,
            span: Span::new(pos, pos),
        });
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Result<SpannedToken, LexerError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Return any pending tokens first
        if let Some(token) = self.pending_tokens.pop() {
            return Some(Ok(token));
        }

        if self.done {
            return None;
        }

        loop {
            match self.inner.next() {
                Some((Ok(token), span)) => {
                    let span = Span::new(span.start, span.end);

                    match &token {
                        Token::LParen | Token::LBracket => {
                            self.bracket_depth += 1;
                        }
                        Token::RParen | Token::RBracket => {
                            self.bracket_depth = self.bracket_depth.saturating_sub(1);
                        }
                        _ => {}
                    }

                    // Handle indentation at line start (only outside brackets)
                    if self.at_line_start && self.bracket_depth == 0 {
                        let line_start = self.line_start(span.start);
                        if !self.is_blank_line(line_start) {
                            self.process_indentation(line_start, span.start);
                        }
                        self.at_line_start = false;
                    } else if self.at_line_start {
                        self.at_line_start = false;
                    }

                    match token {
                        Token::Newline => {
                            self.at_line_start = true;
                            continue;
                        }
                        Token::Comment => {
                            continue;
                        }
                        _ => {
                            // Return pending indent/dedent tokens first
                            if !self.pending_tokens.is_empty() {
                                self.pending_tokens.reverse();
                                self.pending_tokens.push(SpannedToken { token, span });
                                self.pending_tokens.reverse();
                                return self.pending_tokens.pop().map(Ok);
                            }

                            return Some(Ok(SpannedToken { token, span }));
                        }
                    }
                }
                Some((Err(_), span)) => {
                    return Some(Err(LexerError {
                        message: format!(
                            "unexpected character: '{}'",
                            &self.source[span.start..span.end]
                        ),
                        span: Span::new(span.start, span.end),
                    }));
                }
                None => {
                    self.done = true;
                    self.emit_final_dedents();
                    self.pending_tokens.reverse();
                    return self.pending_tokens.pop().map(Ok);
                }
            }
        }
    }
}

/// Convenience function to lex a source string into a vector of tokens
pub fn lex(source: &str) -> Result<Vec<SpannedToken>, LexerError> {
    Lexer::new(source).collect()
}
