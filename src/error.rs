use std::fmt;
use thiserror::Error;

use crate::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexer,
    Parser,
    Compile,
    Type,
    Runtime,
}

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            ErrorKind::Lexer => "lexer error",
            ErrorKind::Parser => "parse error",
            ErrorKind::Compile => "compilation error",
            ErrorKind::Type => "type error",
            ErrorKind::Runtime => "runtime error",
        }
    }
}

/// A positioned error with enough context to render a source window.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub filename: String,
    pub line: usize,
    pub column: usize,
    pub source: String,
    pub snippet: String,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        filename: impl Into<String>,
        line: usize,
        column: usize,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            filename: filename.into(),
            line,
            column,
            source: String::new(),
            snippet: String::new(),
            help: None,
        }
    }

    pub fn from_token(
        kind: ErrorKind,
        message: impl Into<String>,
        filename: impl Into<String>,
        token: &Token,
    ) -> Self {
        let mut diag = Self::new(kind, message, filename, token.line, token.column);
        diag.snippet = token.value.clone();
        diag
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}: {}", self.kind.label(), self.message)?;

        let lines: Vec<&str> = self.source.lines().collect();
        if self.line > 0 && self.line <= lines.len() {
            writeln!(f, "  --> {}:{}:{}", self.filename, self.line, self.column)?;

            if self.line > 1 {
                writeln!(f, "{:4} | {}", self.line - 1, lines[self.line - 2])?;
            }
            writeln!(f, "{:4} | {}", self.line, lines[self.line - 1])?;

            let mut pointer = " ".repeat(self.column.saturating_sub(1));
            pointer.push('^');
            let squiggle = self.snippet.chars().count().saturating_sub(1);
            pointer.push_str(&"~".repeat(squiggle));
            writeln!(f, "     | {}", pointer)?;

            if self.line < lines.len() {
                writeln!(f, "{:4} | {}", self.line + 1, lines[self.line])?;
            }
        } else if !self.filename.is_empty() {
            writeln!(f, "  --> {}:{}:{}", self.filename, self.line, self.column)?;
        }

        if let Some(help) = &self.help {
            writeln!(f)?;
            writeln!(f, "help: {}", help)?;
        }

        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

/// Fatal executor conditions. Any of these ends the current run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("call stack underflow")]
    CallStackUnderflow,
    #[error("program counter out of bounds")]
    PcOutOfBounds,
    #[error("unknown instruction: {0}")]
    UnknownInstruction(u8),
    #[error("variable index out of bounds: {0}")]
    LocalOutOfRange(u8),
    #[error("string index out of bounds: {0}")]
    StringOutOfRange(u32),
    #[error("invalid jump address: {0}")]
    InvalidJump(usize),
    #[error("unknown function index: {0}")]
    UnknownFunction(u8),
    #[error("invalid operand types for {0}")]
    TypeMismatch(&'static str),
    #[error("division by zero")]
    DivisionByZero,
    #[error("host function failed: {0}")]
    Host(String),
}

/// Top-level driver error.
#[derive(Debug, Error)]
pub enum RetraceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{}", format_diagnostics(.0))]
    Parse(Vec<Diagnostic>),
    #[error(transparent)]
    Compile(#[from] Diagnostic),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Readline(#[from] rustyline::error::ReadlineError),
    #[error("{0}")]
    Unsupported(String),
}

fn format_diagnostics(diags: &[Diagnostic]) -> String {
    diags
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
