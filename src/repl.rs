use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::bytecode::Instr;
use crate::debugger::{DebugSession, DebugStatus, SessionClosed, Snapshot};
use crate::vm::Value;

const HELP: &str = "Available commands:
  step, s, n     Execute until the next source line
  back, b        Step back to the previous source line
  continue, c    Continue to the next breakpoint or to the end
  pause          Republish the current state
  break <line>   Set a breakpoint at a source line
  stack          Show the current stack
  locals         Show the local variables
  pc             Show the current program counter
  restart, r     Restart program execution
  help           Show this help
  quit, q        Exit the debugger";

/// Interactive front-end over a debug session. Every command maps onto one
/// session command; the returned snapshot is what gets printed.
pub struct Repl {
    session: DebugSession,
    bytecode: Vec<u8>,
    last: Snapshot,
}

impl Repl {
    pub fn new(session: DebugSession, initial: Snapshot, bytecode: Vec<u8>) -> Self {
        Self {
            session,
            bytecode,
            last: initial,
        }
    }

    pub fn run(mut self) -> rustyline::Result<()> {
        println!("retrace debugger");
        println!("{}", HELP);
        println!();
        self.print_snapshot();

        let mut editor = DefaultEditor::new()?;
        loop {
            match editor.readline("(rtc) ") {
                Ok(line) => {
                    let input = line.trim().to_string();
                    if input.is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(&input);
                    match self.dispatch(&input) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(SessionClosed) => {
                            println!("debugger session disconnected");
                            break;
                        }
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err),
            }
        }

        self.session.stop();
        Ok(())
    }

    /// Returns `Ok(false)` when the loop should exit.
    fn dispatch(&mut self, input: &str) -> Result<bool, SessionClosed> {
        let args: Vec<&str> = input.split_whitespace().collect();

        match args[0] {
            "step" | "s" | "n" => {
                if self.last.status == DebugStatus::Finished {
                    println!("Program has finished execution; restarting");
                    self.last = self.session.restart()?;
                } else {
                    self.last = self.session.step_next()?;
                }
                self.print_snapshot();
            }
            "back" | "b" => {
                self.last = self.session.step_back()?;
                self.print_snapshot();
            }
            "continue" | "c" => {
                self.last = self.session.continue_run()?;
                self.print_snapshot();
            }
            "pause" => {
                self.last = self.session.pause()?;
                self.print_snapshot();
            }
            "break" => {
                let Some(line) = args.get(1).and_then(|s| s.parse::<usize>().ok()) else {
                    println!("Usage: break <line>");
                    return Ok(true);
                };
                self.last = self.session.set_line_breakpoint(line, true)?;
                println!("Breakpoint set at line {}", line);
            }
            "stack" => println!("Stack: {}", self.format_values(&self.last.state.stack)),
            "locals" => println!("Locals: {}", self.format_values(&self.last.state.locals)),
            "pc" => {
                println!(
                    "PC: {} (Instruction: {})",
                    self.last.state.pc,
                    self.instruction_at(self.last.state.pc)
                );
            }
            "restart" | "r" => {
                self.last = self.session.restart()?;
                println!("Program restarted");
                self.print_snapshot();
            }
            "help" => println!("{}", HELP),
            "quit" | "q" => return Ok(false),
            other => println!("Unknown command: {}", other),
        }

        Ok(true)
    }

    fn print_snapshot(&self) {
        match self.last.status {
            DebugStatus::Finished => {
                println!("Program finished execution");
            }
            DebugStatus::Error => {
                if let Some(err) = &self.last.error {
                    println!("Execution error: {}", err);
                } else {
                    println!("Execution stopped on an error");
                }
            }
            DebugStatus::Idle | DebugStatus::Running | DebugStatus::Waiting => {
                println!(
                    "Line {}, PC: {} (Instruction: {})",
                    self.last.state.source_line,
                    self.last.state.pc,
                    self.instruction_at(self.last.state.pc)
                );
                println!("Stack: {}", self.format_values(&self.last.state.stack));
                println!("Locals: {}", self.format_values(&self.last.state.locals));
            }
        }
    }

    fn instruction_at(&self, pc: usize) -> String {
        match self.bytecode.get(pc).copied().and_then(Instr::from_byte) {
            Some(instr) => instr.to_string(),
            None => "-".to_string(),
        }
    }

    fn format_values(&self, values: &[Value]) -> String {
        let rendered: Vec<String> = values
            .iter()
            .map(|v| match v {
                Value::Int(n) => n.to_string(),
                Value::Str(idx) => match self.last.state.strings.get(*idx as usize) {
                    Some(s) => format!("{:?}", s),
                    None => format!("str_{}", idx),
                },
            })
            .collect();
        format!("[{}]", rendered.join(", "))
    }
}
