use std::collections::HashMap;

use tracing::debug;

use crate::bytecode::Instr;
use crate::error::RuntimeError;

/// A runtime value. Strings live in the VM's table and are referenced by
/// index; comparing values of different tags is a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(u32),
}

/// The complete, snapshottable machine state. `Clone` performs the deep
/// copy the time-travel history relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct VmState {
    pub pc: usize,
    pub stack: Vec<Value>,
    pub locals: Vec<Value>,
    pub call_stack: Vec<usize>,
    pub strings: Vec<String>,
    pub source_line: usize,
}

impl VmState {
    pub fn new(stack_capacity: usize, locals_capacity: usize) -> Self {
        Self {
            pc: 0,
            stack: Vec::with_capacity(stack_capacity),
            locals: Vec::with_capacity(locals_capacity),
            call_stack: Vec::new(),
            strings: Vec::new(),
            source_line: 1,
        }
    }
}

/// A registered host function. Receives the current state (read-only) and
/// the argument vector in left-to-right order.
pub type HostFn = Box<dyn FnMut(&VmState, &[Value]) -> Result<Value, RuntimeError> + Send>;

pub struct Vm {
    bytecode: Vec<u8>,
    state: VmState,
    functions: HashMap<usize, HostFn>,
    source_map: HashMap<usize, usize>,
    running: bool,
    stack_capacity: usize,
    locals_capacity: usize,
}

impl Vm {
    pub fn new(bytecode: Vec<u8>, stack_capacity: usize, locals_capacity: usize) -> Self {
        Self {
            bytecode,
            state: VmState::new(stack_capacity, locals_capacity),
            functions: HashMap::new(),
            source_map: HashMap::new(),
            running: true,
            stack_capacity,
            locals_capacity,
        }
    }

    pub fn state(&self) -> &VmState {
        &self.state
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// True once nothing more can execute: HALT was reached, a fatal error
    /// cleared the running flag, or the pc ran off the end of the code.
    pub fn finished(&self) -> bool {
        !self.running || self.state.pc >= self.bytecode.len()
    }

    pub fn register_function(&mut self, idx: usize, function: HostFn) {
        self.functions.insert(idx, function);
    }

    /// Bulk-imports the compiler's interned strings at their exact indices.
    pub fn register_strings(&mut self, strings: &HashMap<String, usize>) {
        let len = strings.values().max().map_or(0, |max| max + 1);
        if len > self.state.strings.len() {
            self.state.strings.resize(len, String::new());
        }
        for (string, &idx) in strings {
            self.state.strings[idx] = string.clone();
        }
    }

    pub fn register_source_map(&mut self, pc: usize, line: usize) {
        self.source_map.insert(pc, line);
    }

    /// Direct source-map lookup; `None` for positions between entries.
    pub fn line_for_pc(&self, pc: usize) -> Option<usize> {
        self.source_map.get(&pc).copied()
    }

    /// Replaces the live state with a historical snapshot.
    pub fn restore(&mut self, snapshot: VmState) {
        self.state = snapshot;
    }

    /// Fresh state for a re-run. The string table, registered host
    /// functions and the source map all survive.
    pub fn reset(&mut self) {
        let strings = std::mem::take(&mut self.state.strings);
        self.state = VmState::new(self.stack_capacity, self.locals_capacity);
        self.state.strings = strings;
        self.running = true;
    }

    /// Runs straight to completion; used outside the debugger.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        while self.running && self.state.pc < self.bytecode.len() {
            self.execute_instruction()?;
        }
        Ok(())
    }

    /// Decodes and executes exactly one instruction. The pc points at the
    /// opcode on entry and at the next opcode on successful return.
    pub fn execute_instruction(&mut self) -> Result<(), RuntimeError> {
        let byte = *self
            .bytecode
            .get(self.state.pc)
            .ok_or(RuntimeError::PcOutOfBounds)?;
        let instr = Instr::from_byte(byte).ok_or(RuntimeError::UnknownInstruction(byte))?;
        self.state.pc += 1;

        match instr {
            Instr::Push => {
                let value = self.fetch_byte()?;
                self.state.stack.push(Value::Int(value as i64));
            }
            Instr::PushStr => {
                let idx = self.fetch_byte()? as u32;
                if idx as usize >= self.state.strings.len() {
                    return Err(RuntimeError::StringOutOfRange(idx));
                }
                self.state.stack.push(Value::Str(idx));
            }
            Instr::Pop => {
                let value = self.pop()?;
                let idx = self.fetch_byte()?;
                let slot = idx as usize;
                if slot >= self.state.locals.len() {
                    return Err(RuntimeError::LocalOutOfRange(idx));
                }
                self.state.locals[slot] = value;
            }
            Instr::Add => self.execute_add()?,
            Instr::Sub => self.execute_arith("sub", |a, b| Ok(a.wrapping_sub(b)))?,
            Instr::Mul => self.execute_arith("mul", |a, b| Ok(a.wrapping_mul(b)))?,
            Instr::Div => self.execute_arith("div", |a, b| {
                if b == 0 {
                    Err(RuntimeError::DivisionByZero)
                } else {
                    Ok(a.wrapping_div(b))
                }
            })?,
            Instr::Mod => self.execute_arith("mod", |a, b| {
                if b == 0 {
                    Err(RuntimeError::DivisionByZero)
                } else {
                    Ok(a.wrapping_rem(b))
                }
            })?,
            Instr::Eq => self.execute_eq(false)?,
            Instr::Neq => self.execute_eq(true)?,
            Instr::Lt => self.execute_compare("less than", |a, b| a < b)?,
            Instr::Gt => self.execute_compare("greater than", |a, b| a > b)?,
            Instr::Lte => self.execute_compare("less than or equal", |a, b| a <= b)?,
            Instr::Gte => self.execute_compare("greater than or equal", |a, b| a >= b)?,
            Instr::Load => {
                let idx = self.fetch_byte()?;
                let slot = idx as usize;
                let value = *self
                    .state
                    .locals
                    .get(slot)
                    .ok_or(RuntimeError::LocalOutOfRange(idx))?;
                self.state.stack.push(value);
            }
            Instr::Store => {
                let idx = self.fetch_byte()?;
                let value = self.pop()?;
                let slot = idx as usize;
                if slot < self.state.locals.len() {
                    self.state.locals[slot] = value;
                } else if slot == self.state.locals.len() {
                    self.state.locals.push(value);
                } else {
                    return Err(RuntimeError::LocalOutOfRange(idx));
                }
            }
            Instr::Jmp => {
                let addr = self.read_addr()?;
                self.state.pc = addr;
            }
            Instr::JmpIfZero => {
                let addr = self.read_addr()?;
                let condition = self.pop()?;
                if condition == Value::Int(0) {
                    self.state.pc = addr;
                } else {
                    self.state.pc += 2;
                }
            }
            Instr::Call => {
                if self.state.pc + 1 >= self.bytecode.len() {
                    return Err(RuntimeError::PcOutOfBounds);
                }
                let func_idx = self.bytecode[self.state.pc];
                let argc = self.bytecode[self.state.pc + 1] as usize;

                // Arguments were pushed left to right; pop them back into order.
                let mut args = vec![Value::Int(0); argc];
                for slot in args.iter_mut().rev() {
                    *slot = self
                        .state
                        .stack
                        .pop()
                        .ok_or(RuntimeError::StackUnderflow)?;
                }

                let Self {
                    functions, state, ..
                } = self;
                let function = functions
                    .get_mut(&(func_idx as usize))
                    .ok_or(RuntimeError::UnknownFunction(func_idx))?;
                let result = function(state, &args)?;
                state.stack.push(result);
                state.pc += 2;
            }
            Instr::Ret => {
                let addr = self
                    .state
                    .call_stack
                    .pop()
                    .ok_or(RuntimeError::CallStackUnderflow)?;
                self.state.pc = addr;
            }
            Instr::Halt => {
                debug!(pc = self.state.pc, "halt");
                self.running = false;
            }
        }

        self.sync_source_line();
        Ok(())
    }

    /// Keeps `source_line` tracking the closest-preceding source-map entry.
    fn sync_source_line(&mut self) {
        if let Some(&line) = self.source_map.get(&self.state.pc) {
            self.state.source_line = line;
        }
    }

    fn fetch_byte(&mut self) -> Result<u8, RuntimeError> {
        let byte = *self
            .bytecode
            .get(self.state.pc)
            .ok_or(RuntimeError::PcOutOfBounds)?;
        self.state.pc += 1;
        Ok(byte)
    }

    /// Reads a big-endian jump target at the pc without advancing.
    fn read_addr(&self) -> Result<usize, RuntimeError> {
        if self.state.pc + 1 >= self.bytecode.len() {
            return Err(RuntimeError::PcOutOfBounds);
        }
        let high = self.bytecode[self.state.pc] as usize;
        let low = self.bytecode[self.state.pc + 1] as usize;
        let addr = (high << 8) | low;
        if addr > self.bytecode.len() {
            return Err(RuntimeError::InvalidJump(addr));
        }
        Ok(addr)
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.state.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn pop_pair(&mut self) -> Result<(Value, Value), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    fn string(&self, idx: u32) -> Result<&str, RuntimeError> {
        self.state
            .strings
            .get(idx as usize)
            .map(String::as_str)
            .ok_or(RuntimeError::StringOutOfRange(idx))
    }

    /// Interns a string produced at run time. Existing entries keep their
    /// index; the table only ever grows.
    fn intern(&mut self, string: String) -> u32 {
        if let Some(idx) = self.state.strings.iter().position(|s| *s == string) {
            return idx as u32;
        }
        self.state.strings.push(string);
        (self.state.strings.len() - 1) as u32
    }

    fn execute_add(&mut self) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_pair()?;
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                self.state.stack.push(Value::Int(x.wrapping_add(y)));
                Ok(())
            }
            (Value::Str(x), Value::Str(y)) => {
                let combined = format!("{}{}", self.string(x)?, self.string(y)?);
                let idx = self.intern(combined);
                self.state.stack.push(Value::Str(idx));
                Ok(())
            }
            _ => Err(RuntimeError::TypeMismatch("add")),
        }
    }

    fn execute_arith(
        &mut self,
        name: &'static str,
        op: impl Fn(i64, i64) -> Result<i64, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_pair()?;
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                self.state.stack.push(Value::Int(op(x, y)?));
                Ok(())
            }
            _ => Err(RuntimeError::TypeMismatch(name)),
        }
    }

    fn execute_eq(&mut self, negate: bool) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_pair()?;
        let equal = match (a, b) {
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => self.string(x)? == self.string(y)?,
            _ => {
                return Err(RuntimeError::TypeMismatch(if negate {
                    "inequality"
                } else {
                    "equality"
                }))
            }
        };
        self.state.stack.push(Value::Int((equal != negate) as i64));
        Ok(())
    }

    fn execute_compare(
        &mut self,
        name: &'static str,
        op: impl Fn(i64, i64) -> bool,
    ) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_pair()?;
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                self.state.stack.push(Value::Int(op(x, y) as i64));
                Ok(())
            }
            _ => Err(RuntimeError::TypeMismatch(name)),
        }
    }
}
