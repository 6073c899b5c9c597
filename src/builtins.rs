use std::io::{self, Write};

use crate::error::RuntimeError;
use crate::vm::{HostFn, Value, Vm, VmState};

/// Builtin function indices are fixed; the compiler pre-populates its
/// function table from this list.
pub const PRINT: usize = 0;

pub fn indices() -> &'static [(&'static str, usize)] {
    &[("print", PRINT)]
}

fn format_args(state: &VmState, args: &[Value]) -> Result<String, RuntimeError> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::Int(n) => parts.push(n.to_string()),
            Value::Str(idx) => {
                let string = state
                    .strings
                    .get(*idx as usize)
                    .ok_or(RuntimeError::StringOutOfRange(*idx))?;
                parts.push(string.clone());
            }
        }
    }
    Ok(parts.join(" "))
}

/// `print` writes its arguments space-separated followed by a newline.
/// The sink is pluggable so callers can capture output.
pub fn print_fn<W: Write + Send + 'static>(mut sink: W) -> HostFn {
    Box::new(move |state, args| {
        let line = format_args(state, args)?;
        writeln!(sink, "{}", line).map_err(|e| RuntimeError::Host(e.to_string()))?;
        Ok(Value::Int(0))
    })
}

/// Registers every builtin against its fixed index.
pub fn register_builtins(vm: &mut Vm) {
    vm.register_function(PRINT, print_fn(io::stdout()));
}

#[cfg(test)]
pub(crate) mod capture {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// A cloneable in-memory sink for asserting on printed output.
    #[derive(Clone, Default)]
    pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
