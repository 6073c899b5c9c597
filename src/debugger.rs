use std::collections::HashMap;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;
use tracing::debug;

use crate::error::RuntimeError;
use crate::vm::{Vm, VmState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerCmd {
    StepNext,
    StepBack,
    Continue,
    Pause,
    Restart,
    SetBreakpoint { line: usize, enabled: bool },
    Stop,
}

/// Debugger-visible execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugStatus {
    /// Before the first run, or after stop/restart.
    Idle,
    /// The executor owns the state; only seen mid-command.
    Running,
    /// A snapshot is published and the executor awaits the next command.
    Waiting,
    /// HALT executed or the pc ran off the end of the code.
    Finished,
    /// A fatal executor error produced the last snapshot.
    Error,
}

/// What the debugger publishes after every command: a deep copy of the
/// machine state plus where the state machine settled.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: VmState,
    pub status: DebugStatus,
    pub error: Option<RuntimeError>,
}

/// Couples the VM with a full-history log and line breakpoints.
///
/// History holds a pre-instruction snapshot for every instruction executed
/// in step or continue mode, unbounded; `step_back` restores one of them
/// exactly. The run is dead after a fatal error or HALT until `restart`.
pub struct Debugger {
    vm: Vm,
    history: Vec<VmState>,
    breakpoints: HashMap<usize, bool>,
    last_error: Option<RuntimeError>,
    status: DebugStatus,
}

impl Debugger {
    pub fn new(vm: Vm) -> Self {
        Self {
            vm,
            history: Vec::new(),
            breakpoints: HashMap::new(),
            last_error: None,
            status: DebugStatus::Idle,
        }
    }

    pub fn set_line_breakpoint(&mut self, line: usize, enabled: bool) {
        if enabled {
            self.breakpoints.insert(line, true);
        } else {
            self.breakpoints.remove(&line);
        }
    }

    pub fn status(&self) -> DebugStatus {
        self.status
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.vm.state().clone(),
            status: self.status(),
            error: self.last_error.clone(),
        }
    }

    /// Marks the Idle → Waiting transition when a session begins.
    pub(crate) fn mark_started(&mut self) {
        self.settle();
    }

    fn settle(&mut self) {
        self.status = if self.last_error.is_some() {
            DebugStatus::Error
        } else if self.vm.finished() {
            DebugStatus::Finished
        } else {
            DebugStatus::Waiting
        };
    }

    fn fail(&mut self, err: RuntimeError) {
        debug!(error = %err, pc = self.vm.state().pc, "executor fault");
        self.vm.set_running(false);
        self.last_error = Some(err);
    }

    fn line_at(&self, pc: usize) -> usize {
        // Zero stands for "no recorded line" in the step conditions.
        self.vm.line_for_pc(pc).unwrap_or(0)
    }

    /// Advances one source line: executes instructions, recording each
    /// pre-instruction state, until the pc maps to a different line.
    pub fn step_next(&mut self) {
        self.status = DebugStatus::Running;
        let current_line = self.line_at(self.vm.state().pc);

        while self.vm.is_running() && self.vm.state().pc < self.vm.bytecode().len() {
            self.history.push(self.vm.state().clone());
            if let Err(err) = self.vm.execute_instruction() {
                self.fail(err);
                break;
            }
            let new_line = self.line_at(self.vm.state().pc);
            if new_line != current_line && new_line != 0 {
                break;
            }
        }

        self.settle();
    }

    /// Pops history until a state from a different source line turns up and
    /// restores it. With no such state the current state is kept unchanged.
    pub fn step_back(&mut self) {
        self.status = DebugStatus::Running;
        let current_line = self.line_at(self.vm.state().pc);

        while let Some(previous) = self.history.pop() {
            let line = self.line_at(previous.pc);
            if line != current_line && line != 0 {
                self.vm.restore(previous);
                break;
            }
        }

        self.settle();
    }

    /// Runs until execution ends or an executed instruction lands on a pc
    /// whose source line has a breakpoint.
    pub fn continue_run(&mut self) {
        self.status = DebugStatus::Running;

        while self.vm.is_running() && self.vm.state().pc < self.vm.bytecode().len() {
            self.history.push(self.vm.state().clone());
            if let Err(err) = self.vm.execute_instruction() {
                self.fail(err);
                break;
            }
            let line = self.line_at(self.vm.state().pc);
            if line != 0 && self.breakpoints.get(&line).copied().unwrap_or(false) {
                break;
            }
        }

        self.settle();
    }

    /// Back to a fresh state: history gone, strings, breakpoints and host
    /// functions kept.
    pub fn restart(&mut self) {
        self.vm.reset();
        self.history.clear();
        self.last_error = None;
        self.status = DebugStatus::Idle;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("debugger session disconnected")]
pub struct SessionClosed;

/// The command-channel coupling around a [`Debugger`].
///
/// One executor thread owns the debugger. Commands go in over a rendezvous
/// channel, exactly one snapshot comes back per command, and every API call
/// is send-then-receive, so commands are serialised by construction: the
/// N-th snapshot reflects the first N commands in order.
pub struct DebugSession {
    commands: Sender<DebuggerCmd>,
    snapshots: Receiver<Snapshot>,
    handle: Option<JoinHandle<()>>,
}

impl DebugSession {
    /// Spawns the executor and returns it together with the initial
    /// snapshot the debugger publishes before reading any command.
    pub fn start(mut debugger: Debugger) -> Result<(Self, Snapshot), SessionClosed> {
        let (cmd_tx, cmd_rx) = bounded::<DebuggerCmd>(0);
        let (snap_tx, snap_rx) = bounded::<Snapshot>(0);

        let handle = thread::spawn(move || {
            debugger.mark_started();
            if snap_tx.send(debugger.snapshot()).is_err() {
                return;
            }
            while let Ok(cmd) = cmd_rx.recv() {
                debug!(?cmd, "debugger command");
                match cmd {
                    DebuggerCmd::StepNext => debugger.step_next(),
                    DebuggerCmd::StepBack => debugger.step_back(),
                    DebuggerCmd::Continue => debugger.continue_run(),
                    // Nothing is in flight between commands; pause just
                    // republishes the current state.
                    DebuggerCmd::Pause => {}
                    DebuggerCmd::Restart => debugger.restart(),
                    DebuggerCmd::SetBreakpoint { line, enabled } => {
                        debugger.set_line_breakpoint(line, enabled)
                    }
                    DebuggerCmd::Stop => return,
                }
                if snap_tx.send(debugger.snapshot()).is_err() {
                    return;
                }
            }
        });

        let initial = snap_rx.recv().map_err(|_| SessionClosed)?;
        let session = Self {
            commands: cmd_tx,
            snapshots: snap_rx,
            handle: Some(handle),
        };
        Ok((session, initial))
    }

    fn command(&self, cmd: DebuggerCmd) -> Result<Snapshot, SessionClosed> {
        self.commands.send(cmd).map_err(|_| SessionClosed)?;
        self.snapshots.recv().map_err(|_| SessionClosed)
    }

    pub fn step_next(&self) -> Result<Snapshot, SessionClosed> {
        self.command(DebuggerCmd::StepNext)
    }

    pub fn step_back(&self) -> Result<Snapshot, SessionClosed> {
        self.command(DebuggerCmd::StepBack)
    }

    pub fn continue_run(&self) -> Result<Snapshot, SessionClosed> {
        self.command(DebuggerCmd::Continue)
    }

    pub fn pause(&self) -> Result<Snapshot, SessionClosed> {
        self.command(DebuggerCmd::Pause)
    }

    pub fn restart(&self) -> Result<Snapshot, SessionClosed> {
        self.command(DebuggerCmd::Restart)
    }

    pub fn set_line_breakpoint(&self, line: usize, enabled: bool) -> Result<Snapshot, SessionClosed> {
        self.command(DebuggerCmd::SetBreakpoint { line, enabled })
    }

    /// Ends the session: the executor thread exits without publishing and
    /// any unconsumed snapshot is drained.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.commands.send(DebuggerCmd::Stop);
            while self.snapshots.try_recv().is_ok() {}
            let _ = handle.join();
        }
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::{self, capture::SharedBuffer};
    use crate::compiler::Compiler;
    use crate::parser::parse;
    use crate::vm::Value;

    const COUNTER: &str = "val i = 0\nwhile i < 10 do\n  val i = i + 1\n  print(i)\nend";

    fn build_debugger(source: &str) -> (Debugger, SharedBuffer) {
        let program = parse("test.rtc", source).expect("parse failed");
        let mut compiler = Compiler::new("test.rtc", source);
        let code = compiler.compile_program(&program).expect("compile failed");
        let mut vm = Vm::new(code, 1024, 1024);
        vm.register_strings(compiler.strings());
        for (&pc, &line) in compiler.source_map() {
            vm.register_source_map(pc, line);
        }
        let buffer = SharedBuffer::default();
        vm.register_function(builtins::PRINT, builtins::print_fn(buffer.clone()));
        (Debugger::new(vm), buffer)
    }

    #[test]
    fn step_next_advances_one_source_line() {
        let (mut debugger, _) = build_debugger(COUNTER);
        debugger.step_next();
        // Line 1 executed; now sitting on the while condition of line 2.
        assert_eq!(debugger.vm.state().source_line, 2);
        assert_eq!(debugger.vm.state().locals, vec![Value::Int(0)]);
        assert_eq!(debugger.status(), DebugStatus::Waiting);
    }

    #[test]
    fn history_records_pre_instruction_states() {
        let (mut debugger, _) = build_debugger(COUNTER);
        debugger.step_next();
        // Line 1 is PUSH + STORE: two instructions, two snapshots.
        assert_eq!(debugger.history.len(), 2);
        assert_eq!(debugger.history[0].pc, 0);
        assert!(debugger.history[0].stack.is_empty());
        assert_eq!(debugger.history[1].stack, vec![Value::Int(0)]);
    }

    #[test]
    fn step_back_restores_an_exact_historical_snapshot() {
        let (mut debugger, _) = build_debugger(COUNTER);
        debugger.step_next();
        debugger.step_next();
        let before = debugger.vm.state().clone();
        let history_copy = debugger.history.clone();

        debugger.step_back();
        let restored = debugger.vm.state();
        assert!(restored.pc < before.pc);
        assert!(history_copy.iter().any(|s| s == restored));
    }

    #[test]
    fn step_back_with_empty_history_keeps_the_state() {
        let (mut debugger, _) = build_debugger(COUNTER);
        let before = debugger.vm.state().clone();
        debugger.step_back();
        assert_eq!(*debugger.vm.state(), before);
    }

    #[test]
    fn continue_stops_at_a_line_breakpoint_with_an_empty_stack() {
        let (mut debugger, _) = build_debugger(COUNTER);
        debugger.set_line_breakpoint(3, true);
        debugger.continue_run();

        let state = debugger.vm.state();
        assert_eq!(state.source_line, 3);
        assert!(state.stack.is_empty());
        assert_eq!(debugger.status(), DebugStatus::Waiting);

        debugger.step_back();
        assert_eq!(debugger.vm.state().source_line, 2);
    }

    #[test]
    fn continue_from_a_breakpoint_makes_progress() {
        let (mut debugger, _) = build_debugger(COUNTER);
        debugger.set_line_breakpoint(3, true);

        for expected in 0..3 {
            debugger.continue_run();
            assert_eq!(debugger.vm.state().source_line, 3);
            assert_eq!(debugger.vm.state().locals[0], Value::Int(expected));
        }
    }

    #[test]
    fn disabled_breakpoint_is_ignored() {
        let (mut debugger, output) = build_debugger(COUNTER);
        debugger.set_line_breakpoint(3, true);
        debugger.set_line_breakpoint(3, false);
        debugger.continue_run();
        assert_eq!(debugger.status(), DebugStatus::Finished);
        assert_eq!(output.contents(), "1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n");
    }

    #[test]
    fn continue_without_breakpoints_finishes() {
        let (mut debugger, output) = build_debugger("print(1 + 2 * 3)");
        debugger.continue_run();
        assert_eq!(debugger.status(), DebugStatus::Finished);
        assert_eq!(output.contents(), "7\n");
    }

    #[test]
    fn fatal_error_settles_in_error_state() {
        let (mut debugger, _) = build_debugger("val a = 1\nval b = a / 0");
        debugger.continue_run();
        assert_eq!(debugger.status(), DebugStatus::Error);
        let snapshot = debugger.snapshot();
        assert_eq!(snapshot.error, Some(RuntimeError::DivisionByZero));
        // The faulting pre-instruction state is retained in history.
        assert!(!debugger.history.is_empty());
    }

    #[test]
    fn restart_clears_history_and_error() {
        let (mut debugger, _) = build_debugger("val a = 1\nval b = a / 0");
        debugger.continue_run();
        assert_eq!(debugger.status(), DebugStatus::Error);

        debugger.restart();
        assert_eq!(debugger.status(), DebugStatus::Idle);
        assert!(debugger.history.is_empty());
        assert_eq!(debugger.vm.state().pc, 0);
        assert!(debugger.snapshot().error.is_none());

        // The program runs again from scratch.
        debugger.continue_run();
        assert_eq!(debugger.status(), DebugStatus::Error);
    }

    #[test]
    fn stepping_an_empty_program_finishes() {
        let (mut debugger, _) = build_debugger("");
        assert_eq!(debugger.status(), DebugStatus::Idle);
        debugger.step_next();
        assert_eq!(debugger.status(), DebugStatus::Finished);
    }

    // -- session / channel layer ------------------------------------------

    fn start_session(source: &str) -> (DebugSession, Snapshot, SharedBuffer) {
        let (debugger, buffer) = build_debugger(source);
        let (session, initial) = DebugSession::start(debugger).expect("session start");
        (session, initial, buffer)
    }

    #[test]
    fn session_publishes_the_initial_snapshot() {
        let (_session, initial, _) = start_session(COUNTER);
        assert_eq!(initial.state.pc, 0);
        assert_eq!(initial.status, DebugStatus::Waiting);
        assert!(initial.error.is_none());
    }

    #[test]
    fn session_serialises_commands() {
        let (session, _, _) = start_session(COUNTER);
        let after_one = session.step_next().expect("step");
        assert_eq!(after_one.state.source_line, 2);
        let after_two = session.step_next().expect("step");
        assert_eq!(after_two.state.source_line, 3);
        let back = session.step_back().expect("back");
        assert_eq!(back.state.source_line, 2);
        assert!(back.state.pc < after_two.state.pc);
    }

    #[test]
    fn session_breakpoint_flow() {
        let (session, _, _) = start_session(COUNTER);
        session.set_line_breakpoint(3, true).expect("break");

        let stopped = session.continue_run().expect("continue");
        assert_eq!(stopped.state.source_line, 3);
        assert!(stopped.state.stack.is_empty());
        assert_eq!(stopped.status, DebugStatus::Waiting);

        let back = session.step_back().expect("back");
        assert_eq!(back.state.source_line, 2);
    }

    #[test]
    fn session_continue_runs_to_completion() {
        let (session, _, output) = start_session(COUNTER);
        let done = session.continue_run().expect("continue");
        assert_eq!(done.status, DebugStatus::Finished);
        assert_eq!(output.contents(), "1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n");
    }

    #[test]
    fn pause_then_continue_matches_a_single_continue() {
        let (paused, _, _) = start_session(COUNTER);
        paused.pause().expect("pause");
        let final_paused = paused.continue_run().expect("continue");

        let (direct, _, _) = start_session(COUNTER);
        let final_direct = direct.continue_run().expect("continue");

        assert_eq!(final_paused.state, final_direct.state);
        assert_eq!(final_paused.status, final_direct.status);
    }

    #[test]
    fn pause_republishes_the_current_state() {
        let (session, initial, _) = start_session(COUNTER);
        let paused = session.pause().expect("pause");
        assert_eq!(paused.state, initial.state);
    }

    #[test]
    fn session_restart_returns_to_idle() {
        let (session, _, _) = start_session(COUNTER);
        session.continue_run().expect("continue");
        let restarted = session.restart().expect("restart");
        assert_eq!(restarted.status, DebugStatus::Idle);
        assert_eq!(restarted.state.pc, 0);

        // And the program is runnable again.
        let done = session.continue_run().expect("continue");
        assert_eq!(done.status, DebugStatus::Finished);
    }

    #[test]
    fn session_error_snapshot_is_annotated() {
        let (session, _, _) = start_session("print(1 / 0)");
        let snapshot = session.continue_run().expect("continue");
        assert_eq!(snapshot.status, DebugStatus::Error);
        assert_eq!(snapshot.error, Some(RuntimeError::DivisionByZero));
    }

    #[test]
    fn stop_terminates_the_executor() {
        let (session, _, _) = start_session(COUNTER);
        session.step_next().expect("step");
        session.stop();
    }

    #[test]
    fn dropping_a_session_joins_the_executor() {
        let (session, _, _) = start_session(COUNTER);
        drop(session);
    }
}
