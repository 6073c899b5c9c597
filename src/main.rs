use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser as ClapParser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::builtins::register_builtins;
use crate::compiler::Compiler;
use crate::config::Config;
use crate::debugger::{DebugSession, Debugger};
use crate::error::{Diagnostic, ErrorKind, RetraceError};
use crate::repl::Repl;
use crate::vm::Vm;

mod builtins;
mod bytecode;
mod compiler;
mod config;
mod debugger;
mod error;
mod lexer;
mod parser;
mod repl;
mod token;
mod vm;

#[derive(ClapParser)]
#[command(author, version, about = "Bytecode compiler and time-travelling debugger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file to a bytecode file
    Compile {
        /// Source file to compile
        file: PathBuf,
        /// Output path for the compiled bytecode (defaults to FILE.bc)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print a disassembly of the compiled bytecode
        #[arg(short, long)]
        dump: bool,
        /// Run the program after compiling it
        #[arg(short, long)]
        run: bool,
    },
    /// Compile and run a source file
    Run {
        /// Source file to run
        file: PathBuf,
    },
    /// Debug a source file in the interactive time-travel debugger
    Debug {
        /// Source file to debug
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let config = Config::load();
    init_tracing(&config);

    if let Err(err) = run_command(cli, &config) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_env("RETRACE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(cli: Cli, config: &Config) -> Result<(), RetraceError> {
    match cli.command {
        Commands::Compile {
            file,
            output,
            dump,
            run,
        } => compile_file(&file, output, dump, run, config),
        Commands::Run { file } => run_file(&file, config),
        Commands::Debug { file } => debug_file(&file, config),
    }
}

fn compile_source(filename: &str, source: &str) -> Result<(Vec<u8>, Compiler), RetraceError> {
    let program = parser::parse(filename, source).map_err(RetraceError::Parse)?;
    let mut compiler = Compiler::new(filename, source);
    let code = compiler.compile_program(&program)?;
    Ok((code, compiler))
}

/// Wires a VM up with the builtins and the compiler's side tables.
fn build_vm(code: Vec<u8>, compiler: &Compiler, config: &Config) -> Vm {
    let mut vm = Vm::new(code, config.stack_capacity, config.locals_capacity);
    register_builtins(&mut vm);
    vm.register_strings(compiler.strings());
    for (&pc, &line) in compiler.source_map() {
        vm.register_source_map(pc, line);
    }
    vm
}

fn compile_file(
    file: &Path,
    output: Option<PathBuf>,
    dump: bool,
    run: bool,
    config: &Config,
) -> Result<(), RetraceError> {
    let filename = file.display().to_string();
    let source = fs::read_to_string(file)?;
    info!(file = %filename, "compiling");

    let (code, compiler) = compile_source(&filename, &source)?;
    let output = output.unwrap_or_else(|| file.with_extension("bc"));
    fs::write(&output, &code)?;
    info!(file = %filename, output = %output.display(), "compiled");

    if dump {
        print!("{}", compiler.disassemble());
    }
    if run {
        let mut vm = build_vm(code, &compiler, config);
        vm.run()?;
    }
    Ok(())
}

fn run_file(file: &Path, config: &Config) -> Result<(), RetraceError> {
    if file.extension().and_then(|e| e.to_str()) == Some("bc") {
        // The byte stream is not self-describing: the string table and the
        // source map only exist in compiler memory.
        return Err(RetraceError::Unsupported(String::from(
            "running a compiled bytecode file directly is not supported; \
             run the source file instead",
        )));
    }

    let filename = file.display().to_string();
    let source = fs::read_to_string(file)?;
    let (code, compiler) = compile_source(&filename, &source)?;
    let mut vm = build_vm(code, &compiler, config);
    if let Err(err) = vm.run() {
        let line = vm.state().source_line;
        return Err(Diagnostic::new(ErrorKind::Runtime, err.to_string(), filename, line, 1)
            .with_source(source)
            .into());
    }
    Ok(())
}

fn debug_file(file: &Path, config: &Config) -> Result<(), RetraceError> {
    let filename = file.display().to_string();
    let source = fs::read_to_string(file)?;
    let (code, compiler) = compile_source(&filename, &source)?;

    let vm = build_vm(code.clone(), &compiler, config);
    let mut debugger = Debugger::new(vm);
    debugger.set_line_breakpoint(1, true);

    let (session, initial) = DebugSession::start(debugger)
        .map_err(|e| RetraceError::Unsupported(e.to_string()))?;
    Repl::new(session, initial, code).run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_refuses_bare_bytecode_files() {
        let err = run_file(Path::new("program.bc"), &Config::default()).unwrap_err();
        assert!(matches!(err, RetraceError::Unsupported(_)));
        assert!(err.to_string().contains("not supported"));
    }
}
