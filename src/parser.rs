use crate::error::{Diagnostic, ErrorKind};
use crate::lexer::Lexer;
use crate::token::{Kind, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Assignment {
        pos: Pos,
        name: String,
        expr: Expr,
    },
    If {
        pos: Pos,
        condition: Expr,
        then_body: Vec<Statement>,
        else_body: Vec<Statement>,
    },
    While {
        pos: Pos,
        condition: Expr,
        body: Vec<Statement>,
    },
    Call(Call),
}

impl Statement {
    pub fn pos(&self) -> Pos {
        match self {
            Statement::Assignment { pos, .. } => *pos,
            Statement::If { pos, .. } => *pos,
            Statement::While { pos, .. } => *pos,
            Statement::Call(call) => call.pos,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub pos: Pos,
    pub function: String,
    pub args: Vec<Expr>,
}

/// A term optionally followed by an infix operator and another expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub left: Term,
    pub op: Option<String>,
    pub right: Option<Box<Expr>>,
}

impl Expr {
    pub fn term(left: Term) -> Self {
        Self {
            left,
            op: None,
            right: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Int(i64),
    Float { pos: Pos, value: f64 },
    Str(String), // raw literal, quotes included
    Variable(String),
    Call(Call),
    SubExpr(Box<Expr>),
}

/// Binding strength; higher binds tighter.
pub(crate) fn precedence(op: &str) -> Option<u8> {
    match op {
        "==" | "!=" | "<" | "<=" | ">" | ">=" => Some(1),
        "+" | "-" => Some(2),
        "*" | "/" | "%" => Some(3),
        _ => None,
    }
}

/// Parses a whole source file, aggregating statement-level errors.
///
/// Scanner failures abort immediately with a single lexer-kind diagnostic;
/// parse errors resynchronise to the next statement and keep going.
pub fn parse(filename: &str, source: &str) -> Result<Program, Vec<Diagnostic>> {
    let tokens = Lexer::new(source).tokenize();
    Parser::new(tokens, filename, source).parse()
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    filename: String,
    source: String,
}

impl Parser {
    pub fn new(tokens: Vec<Token>, filename: &str, source: &str) -> Self {
        Self {
            tokens,
            pos: 0,
            filename: filename.to_string(),
            source: source.to_string(),
        }
    }

    fn at(&self) -> &Token {
        // The scanner always terminates the stream with an Eof token.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next_token(&mut self) -> Token {
        let token = self.at().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn is_eof(&self) -> bool {
        self.at().kind == Kind::Eof
    }

    fn at_keyword(&self, kw: &str) -> bool {
        self.at().kind == Kind::Keyword && self.at().value == kw
    }

    fn at_punct(&self, p: &str) -> bool {
        self.at().kind == Kind::Punct && self.at().value == p
    }

    fn error(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::from_token(ErrorKind::Parser, message, self.filename.clone(), self.at())
            .with_source(self.source.clone())
    }

    fn lexer_error(&self) -> Diagnostic {
        // The scanner stores its message in the token value.
        Diagnostic::new(
            ErrorKind::Lexer,
            self.at().value.clone(),
            self.filename.clone(),
            self.at().line,
            self.at().column,
        )
        .with_source(self.source.clone())
    }

    fn expect_punct(&mut self, p: &str) -> Result<Token, Diagnostic> {
        if !self.at_punct(p) {
            return Err(self.error(format!("expected '{}' but found '{}'", p, self.at().value)));
        }
        Ok(self.next_token())
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<Token, Diagnostic> {
        if !self.at_keyword(kw) {
            return Err(self.error(format!("expected '{}' but found '{}'", kw, self.at().value)));
        }
        Ok(self.next_token())
    }

    pub fn parse(&mut self) -> Result<Program, Vec<Diagnostic>> {
        let mut statements = Vec::new();
        let mut errors = Vec::new();

        while !self.is_eof() {
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(diag) => {
                    let fatal = diag.kind == ErrorKind::Lexer;
                    errors.push(diag);
                    if fatal {
                        return Err(errors);
                    }
                    self.synchronize();
                }
            }
        }

        if errors.is_empty() {
            Ok(Program { statements })
        } else {
            Err(errors)
        }
    }

    /// Skips ahead to the next plausible statement start after an error.
    fn synchronize(&mut self) {
        self.next_token();
        while !self.is_eof() {
            if self.at_keyword("val") || self.at_keyword("if") || self.at_keyword("while") {
                return;
            }
            if self.at().kind == Kind::Identifier {
                return;
            }
            self.next_token();
        }
    }

    fn parse_statement(&mut self) -> Result<Statement, Diagnostic> {
        match self.at().kind {
            Kind::Error => Err(self.lexer_error()),
            Kind::Keyword => match self.at().value.as_str() {
                "val" => self.parse_assignment(),
                "if" => self.parse_if(),
                "while" => self.parse_while(),
                other => Err(self.error(format!("unexpected keyword '{}'", other))),
            },
            Kind::Identifier => {
                let call = self.parse_call()?;
                Ok(Statement::Call(call))
            }
            _ => Err(self
                .error(format!("unexpected token '{}'", self.at().value))
                .with_help("a statement is 'val NAME = EXPR', 'if', 'while' or a function call")),
        }
    }

    fn parse_assignment(&mut self) -> Result<Statement, Diagnostic> {
        let val = self.expect_keyword("val")?;
        let pos = Pos {
            line: val.line,
            column: val.column,
        };

        if self.at().kind != Kind::Identifier {
            return Err(self.error("expected a variable name after 'val'"));
        }
        let name = self.next_token().value;

        self.expect_punct("=")?;
        let expr = self.parse_expr()?;
        Ok(Statement::Assignment { pos, name, expr })
    }

    fn parse_if(&mut self) -> Result<Statement, Diagnostic> {
        let kw = self.expect_keyword("if")?;
        let pos = Pos {
            line: kw.line,
            column: kw.column,
        };

        let condition = self.parse_expr()?;
        if self.at_keyword("then") {
            self.next_token();
        }

        let then_body = self.parse_body(&["else", "end"])?;
        let mut else_body = Vec::new();
        if self.at_keyword("else") {
            self.next_token();
            else_body = self.parse_body(&["end"])?;
        }
        self.expect_keyword("end")?;

        Ok(Statement::If {
            pos,
            condition,
            then_body,
            else_body,
        })
    }

    fn parse_while(&mut self) -> Result<Statement, Diagnostic> {
        let kw = self.expect_keyword("while")?;
        let pos = Pos {
            line: kw.line,
            column: kw.column,
        };

        let condition = self.parse_expr()?;
        self.expect_keyword("do")?;
        let body = self.parse_body(&["end"])?;
        self.expect_keyword("end")?;

        Ok(Statement::While {
            pos,
            condition,
            body,
        })
    }

    /// One or more statements terminated by any of `stops` (not consumed).
    fn parse_body(&mut self, stops: &[&str]) -> Result<Vec<Statement>, Diagnostic> {
        let mut body = Vec::new();
        while !self.is_eof() && !stops.iter().any(|s| self.at_keyword(s)) {
            body.push(self.parse_statement()?);
        }
        if body.is_empty() {
            return Err(self.error("expected at least one statement in block"));
        }
        Ok(body)
    }

    fn parse_call(&mut self) -> Result<Call, Diagnostic> {
        let name = self.next_token();
        let pos = Pos {
            line: name.line,
            column: name.column,
        };

        self.expect_punct("(")?;
        let mut args = Vec::new();
        loop {
            if self.is_eof() {
                return Err(self.error("unexpected end of input in function call"));
            }
            if self.at_punct(")") {
                self.next_token();
                break;
            }
            if !args.is_empty() {
                self.expect_punct(",")
                    .map_err(|d| d.with_help("separate call arguments with ','"))?;
            }
            args.push(self.parse_expr()?);
        }

        Ok(Call {
            pos,
            function: name.value,
            args,
        })
    }

    /// Parses a term and, if an infix operator follows, the rest of the
    /// expression recursively. When the right-hand side's own operator binds
    /// tighter, the tree is restructured so the current node keeps the
    /// looser operator and the tighter subtree stays on its right.
    fn parse_expr(&mut self) -> Result<Expr, Diagnostic> {
        let left = self.parse_term()?;
        let mut expr = Expr::term(left);

        if self.at().kind == Kind::Punct {
            if let Some(prec) = precedence(&self.at().value) {
                let op = self.next_token().value;
                let right = self.parse_expr()?;

                if let Some(right_op) = &right.op {
                    if precedence(right_op).unwrap_or(0) > prec {
                        expr.op = Some(op);
                        expr.right = Some(Box::new(Expr {
                            left: right.left,
                            op: right.op,
                            right: right.right,
                        }));
                        return Ok(expr);
                    }
                }

                expr.op = Some(op);
                expr.right = Some(Box::new(right));
            }
        }

        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<Term, Diagnostic> {
        match self.at().kind {
            Kind::Error => Err(self.lexer_error()),
            Kind::Int => {
                let token = self.next_token();
                let value = token.value.parse::<i64>().map_err(|_| {
                    Diagnostic::from_token(
                        ErrorKind::Parser,
                        format!("integer literal '{}' is out of range", token.value),
                        self.filename.clone(),
                        &token,
                    )
                    .with_source(self.source.clone())
                })?;
                Ok(Term::Int(value))
            }
            Kind::Float => {
                let token = self.next_token();
                let value = token.value.parse::<f64>().map_err(|_| {
                    Diagnostic::from_token(
                        ErrorKind::Parser,
                        format!("malformed float literal '{}'", token.value),
                        self.filename.clone(),
                        &token,
                    )
                    .with_source(self.source.clone())
                })?;
                Ok(Term::Float {
                    pos: Pos {
                        line: token.line,
                        column: token.column,
                    },
                    value,
                })
            }
            Kind::Str => {
                let token = self.next_token();
                Ok(Term::Str(token.value))
            }
            Kind::Identifier => {
                if self.tokens.get(self.pos + 1).is_some_and(|t| t.kind == Kind::Punct && t.value == "(") {
                    return Ok(Term::Call(self.parse_call()?));
                }
                let token = self.next_token();
                Ok(Term::Variable(token.value))
            }
            Kind::Punct if self.at().value == "(" => {
                self.next_token();
                let inner = self.parse_expr()?;
                self.expect_punct(")")
                    .map_err(|d| d.with_help("close the parenthesized expression"))?;
                Ok(Term::SubExpr(Box::new(inner)))
            }
            _ => Err(self.error(format!(
                "unexpected token '{}' in expression",
                self.at().value
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(source: &str) -> Statement {
        let program = parse("test.rtc", source).expect("parse failed");
        assert_eq!(program.statements.len(), 1);
        program.statements.into_iter().next().unwrap()
    }

    fn expr_of(source: &str) -> Expr {
        match parse_one(&format!("val x = {}", source)) {
            Statement::Assignment { expr, .. } => expr,
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn assignment() {
        match parse_one("val answer = 42") {
            Statement::Assignment { name, expr, pos } => {
                assert_eq!(name, "answer");
                assert_eq!(pos.line, 1);
                assert!(matches!(expr.left, Term::Int(42)));
                assert!(expr.op.is_none());
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn tighter_operator_stays_on_the_right() {
        let expr = expr_of("1 + 2 * 3");
        assert_eq!(expr.op.as_deref(), Some("+"));
        let right = expr.right.unwrap();
        assert_eq!(right.op.as_deref(), Some("*"));
        assert!(matches!(right.left, Term::Int(2)));
    }

    #[test]
    fn comparison_binds_loosest() {
        let expr = expr_of("i < 10 + 1");
        assert_eq!(expr.op.as_deref(), Some("<"));
        let right = expr.right.unwrap();
        assert_eq!(right.op.as_deref(), Some("+"));
    }

    #[test]
    fn parenthesized_subexpression() {
        let expr = expr_of("(1 + 2) * 3");
        assert_eq!(expr.op.as_deref(), Some("*"));
        assert!(matches!(expr.left, Term::SubExpr(_)));
    }

    #[test]
    fn call_statement_with_args() {
        match parse_one("print(1, \"two\", x)") {
            Statement::Call(call) => {
                assert_eq!(call.function, "print");
                assert_eq!(call.args.len(), 3);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn call_with_no_args() {
        match parse_one("print()") {
            Statement::Call(call) => assert!(call.args.is_empty()),
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn nested_call_in_expression() {
        let expr = expr_of("f(1) + 2");
        assert!(matches!(expr.left, Term::Call(_)));
    }

    #[test]
    fn if_with_optional_then_and_else() {
        match parse_one("if x == 1 then print(\"a\") else print(\"b\") end") {
            Statement::If {
                then_body,
                else_body,
                ..
            } => {
                assert_eq!(then_body.len(), 1);
                assert_eq!(else_body.len(), 1);
            }
            other => panic!("unexpected statement {:?}", other),
        }

        // `then` is optional
        match parse_one("if x print(\"a\") end") {
            Statement::If { else_body, .. } => assert!(else_body.is_empty()),
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn while_loop() {
        let source = "while i < 10 do\n  val i = i + 1\n  print(i)\nend";
        match parse_one(source) {
            Statement::While { body, pos, .. } => {
                assert_eq!(body.len(), 2);
                assert_eq!(pos.line, 1);
                assert_eq!(body[0].pos().line, 2);
                assert_eq!(body[1].pos().line, 3);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn missing_end_is_an_error() {
        let errs = parse("t", "while 1 do print(1)").unwrap_err();
        assert!(errs.iter().any(|d| d.message.contains("expected 'end'")));
    }

    #[test]
    fn empty_block_is_an_error() {
        let errs = parse("t", "if 1 then end").unwrap_err();
        assert_eq!(errs[0].kind, ErrorKind::Parser);
    }

    #[test]
    fn errors_are_aggregated_across_statements() {
        let errs = parse("t", "val = 1\nprint(2)\nval = 3").unwrap_err();
        assert_eq!(errs.len(), 2);
        assert!(errs.iter().all(|d| d.kind == ErrorKind::Parser));
        assert_eq!(errs[0].line, 1);
        assert_eq!(errs[1].line, 3);
    }

    #[test]
    fn lexer_failure_stops_immediately() {
        let errs = parse("t", "val x = @\nval = oops").unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, ErrorKind::Lexer);
    }

    #[test]
    fn float_term_is_parsed() {
        let expr = expr_of("1.5");
        assert!(matches!(expr.left, Term::Float { .. }));
    }

    #[test]
    fn error_carries_position_and_source() {
        let errs = parse("prog.rtc", "val x 1").unwrap_err();
        let diag = &errs[0];
        assert_eq!(diag.filename, "prog.rtc");
        assert_eq!(diag.line, 1);
        assert!(diag.column >= 7);
        assert_eq!(diag.source, "val x 1");
    }
}
