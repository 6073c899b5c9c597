use std::collections::HashMap;

use tracing::debug;

use crate::builtins;
use crate::bytecode::{disassemble, Instr};
use crate::error::{Diagnostic, ErrorKind};
use crate::parser::{Call, Expr, Pos, Program, Statement, Term};

/// Lowers a parsed program to a linear byte stream plus the side tables the
/// VM and the debugger need: interned strings, variable and function
/// indices, and the sparse pc→line source map.
pub struct Compiler {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    vars: HashMap<String, usize>,
    funcs: HashMap<String, usize>,
    strings: HashMap<String, usize>,
    next_var: usize,
    next_label: usize,
    next_func: usize,
    next_string: usize,
    current_pos: usize,
    current_line: usize,
    source_map: HashMap<usize, usize>,
    filename: String,
    source: String,
}

impl Compiler {
    pub fn new(filename: &str, source: &str) -> Self {
        let funcs: HashMap<String, usize> = builtins::indices()
            .iter()
            .map(|(name, idx)| (name.to_string(), *idx))
            .collect();
        let next_func = funcs.values().max().map_or(0, |max| max + 1);

        Self {
            code: Vec::new(),
            labels: HashMap::new(),
            vars: HashMap::new(),
            funcs,
            strings: HashMap::new(),
            next_var: 0,
            next_label: 0,
            next_func,
            next_string: 0,
            current_pos: 0,
            current_line: 1,
            source_map: HashMap::new(),
            filename: filename.to_string(),
            source: source.to_string(),
        }
    }

    pub fn compile_program(&mut self, program: &Program) -> Result<Vec<u8>, Diagnostic> {
        debug!(statements = program.statements.len(), "compilation started");
        for stmt in &program.statements {
            self.compile_statement(stmt)?;
        }
        self.emit(Instr::Halt, &[]);
        debug!(bytes = self.code.len(), "compilation finished");
        Ok(self.code.clone())
    }

    pub fn strings(&self) -> &HashMap<String, usize> {
        &self.strings
    }

    pub fn source_map(&self) -> &HashMap<usize, usize> {
        &self.source_map
    }

    pub fn vars(&self) -> &HashMap<String, usize> {
        &self.vars
    }

    pub fn funcs(&self) -> &HashMap<String, usize> {
        &self.funcs
    }

    pub fn disassemble(&self) -> String {
        disassemble(&self.code, &self.vars, &self.funcs, &self.strings)
    }

    fn emit(&mut self, op: Instr, operands: &[u8]) {
        self.code.push(op as u8);
        self.current_pos += 1;
        self.code.extend_from_slice(operands);
        self.current_pos += operands.len();
    }

    /// Emits a jump opcode and reserves two zero bytes for the address.
    /// Returns the position to patch once the target label is placed.
    fn emit_jump(&mut self, op: Instr) -> usize {
        self.emit(op, &[]);
        let patch_pos = self.current_pos;
        self.code.extend_from_slice(&[0, 0]);
        self.current_pos += 2;
        patch_pos
    }

    fn patch_jump(&mut self, patch_pos: usize, target: usize) {
        self.code[patch_pos] = (target >> 8) as u8;
        self.code[patch_pos + 1] = (target & 0xff) as u8;
    }

    fn get_var_idx(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.vars.get(name) {
            return idx;
        }
        let idx = self.next_var;
        self.vars.insert(name.to_string(), idx);
        self.next_var += 1;
        idx
    }

    fn get_func_idx(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.funcs.get(name) {
            return idx;
        }
        let idx = self.next_func;
        self.funcs.insert(name.to_string(), idx);
        self.next_func += 1;
        idx
    }

    fn create_label(&mut self) -> String {
        let label = format!("L{}", self.next_label);
        self.next_label += 1;
        label
    }

    fn set_label(&mut self, label: &str) {
        self.labels.insert(label.to_string(), self.current_pos);
    }

    /// Interns the processed contents of a raw quoted literal. Identical
    /// contents share an index no matter how the literal spelled them.
    pub(crate) fn intern_string(&mut self, raw: &str) -> usize {
        let unescaped = unescape_string(raw);
        if let Some(&idx) = self.strings.get(&unescaped) {
            return idx;
        }
        let idx = self.next_string;
        self.strings.insert(unescaped, idx);
        self.next_string += 1;
        idx
    }

    /// Records a source-map entry only when the line changes.
    fn register_line(&mut self, line: usize) {
        if line != self.current_line {
            self.current_line = line;
            self.source_map.insert(self.current_pos, line);
        }
    }

    fn compile_statement(&mut self, stmt: &Statement) -> Result<(), Diagnostic> {
        self.register_line(stmt.pos().line);

        match stmt {
            Statement::Assignment { name, expr, .. } => {
                self.compile_expr(expr)?;
                let var_idx = self.get_var_idx(name);
                self.emit(Instr::Store, &[var_idx as u8]);
            }
            Statement::If {
                condition,
                then_body,
                else_body,
                ..
            } => {
                let else_label = self.create_label();
                let end_label = self.create_label();

                self.compile_expr(condition)?;
                let else_patch = self.emit_jump(Instr::JmpIfZero);

                for s in then_body {
                    self.compile_statement(s)?;
                }
                let end_patch = self.emit_jump(Instr::Jmp);

                self.set_label(&else_label);
                for s in else_body {
                    self.compile_statement(s)?;
                }
                self.set_label(&end_label);

                let else_addr = self.labels[&else_label];
                self.patch_jump(else_patch, else_addr);
                let end_addr = self.labels[&end_label];
                self.patch_jump(end_patch, end_addr);
            }
            Statement::While {
                condition, body, ..
            } => {
                let start_label = self.create_label();
                let end_label = self.create_label();

                self.set_label(&start_label);
                self.compile_expr(condition)?;
                let end_patch = self.emit_jump(Instr::JmpIfZero);

                for s in body {
                    self.compile_statement(s)?;
                }

                let start_addr = self.labels[&start_label];
                self.emit(
                    Instr::Jmp,
                    &[(start_addr >> 8) as u8, (start_addr & 0xff) as u8],
                );

                self.set_label(&end_label);
                let end_addr = self.labels[&end_label];
                self.patch_jump(end_patch, end_addr);
            }
            Statement::Call(call) => self.compile_call(call)?,
        }

        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), Diagnostic> {
        self.compile_term(&expr.left)?;

        if let (Some(op), Some(right)) = (&expr.op, &expr.right) {
            self.compile_expr(right)?;
            let instr = match op.as_str() {
                "+" => Instr::Add,
                "-" => Instr::Sub,
                "*" => Instr::Mul,
                "/" => Instr::Div,
                "%" => Instr::Mod,
                "==" => Instr::Eq,
                "!=" => Instr::Neq,
                "<" => Instr::Lt,
                "<=" => Instr::Lte,
                ">" => Instr::Gt,
                ">=" => Instr::Gte,
                other => {
                    return Err(self.error(
                        ErrorKind::Compile,
                        format!("unknown operator '{}'", other),
                        None,
                    ))
                }
            };
            self.emit(instr, &[]);
        }

        Ok(())
    }

    fn compile_term(&mut self, term: &Term) -> Result<(), Diagnostic> {
        match term {
            Term::Int(value) => {
                // One-byte immediate; larger literals truncate.
                self.emit(Instr::Push, &[*value as u8]);
            }
            Term::Float { pos, .. } => {
                return Err(self
                    .error_at(
                        ErrorKind::Type,
                        "float literals are not supported by the bytecode target",
                        *pos,
                    )
                    .with_help("use an integer literal instead"));
            }
            Term::Str(raw) => {
                let str_idx = self.intern_string(raw);
                self.emit(Instr::PushStr, &[str_idx as u8]);
            }
            Term::Variable(name) => {
                let var_idx = self.get_var_idx(name);
                self.emit(Instr::Load, &[var_idx as u8]);
            }
            Term::Call(call) => self.compile_call(call)?,
            Term::SubExpr(inner) => self.compile_expr(inner)?,
        }
        Ok(())
    }

    fn compile_call(&mut self, call: &Call) -> Result<(), Diagnostic> {
        for arg in &call.args {
            self.compile_expr(arg)?;
        }
        let func_idx = self.get_func_idx(&call.function);
        self.emit(Instr::Call, &[func_idx as u8, call.args.len() as u8]);
        Ok(())
    }

    fn error(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        help: Option<&str>,
    ) -> Diagnostic {
        let mut diag = Diagnostic::new(kind, message, self.filename.clone(), self.current_line, 1)
            .with_source(self.source.clone());
        if let Some(help) = help {
            diag = diag.with_help(help);
        }
        diag
    }

    fn error_at(&self, kind: ErrorKind, message: impl Into<String>, pos: Pos) -> Diagnostic {
        Diagnostic::new(kind, message, self.filename.clone(), pos.line, pos.column)
            .with_source(self.source.clone())
    }
}

/// Strips the surrounding quotes and decodes escape sequences. Unknown
/// escapes keep the backslash and the character verbatim.
fn unescape_string(raw: &str) -> String {
    let inner: Vec<char> = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw)
        .chars()
        .collect();

    let mut result = String::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        if inner[i] == '\\' && i + 1 < inner.len() {
            i += 1;
            match inner[i] {
                'n' => result.push('\n'),
                't' => result.push('\t'),
                'r' => result.push('\r'),
                '"' => result.push('"'),
                '\\' => result.push('\\'),
                other => {
                    result.push('\\');
                    result.push(other);
                }
            }
        } else {
            result.push(inner[i]);
        }
        i += 1;
    }
    result
}
