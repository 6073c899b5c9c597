use std::collections::HashMap;
use std::fmt;

/// One opcode of the stack machine. Discriminants are the wire encoding and
/// must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Instr {
    Push = 0,       // 1-byte immediate: integer literal 0..=255
    PushStr = 1,    // 1-byte immediate: string table index
    Pop = 2,        // 1-byte immediate: local index (slot must exist)
    Add = 3,
    Sub = 4,
    Mul = 5,
    Div = 6,
    Mod = 7,
    Eq = 8,
    Neq = 9,
    Lt = 10,
    Gt = 11,
    Lte = 12,
    Gte = 13,
    Load = 14,      // 1-byte immediate: local index
    Store = 15,     // 1-byte immediate: local index, may append one slot
    Jmp = 16,       // 2-byte immediate: absolute address, big-endian
    JmpIfZero = 17, // 2-byte immediate: absolute address, big-endian
    Call = 18,      // 2 immediates: function index, argument count
    Ret = 19,
    Halt = 20,
}

impl Instr {
    pub fn from_byte(byte: u8) -> Option<Instr> {
        match byte {
            0 => Some(Instr::Push),
            1 => Some(Instr::PushStr),
            2 => Some(Instr::Pop),
            3 => Some(Instr::Add),
            4 => Some(Instr::Sub),
            5 => Some(Instr::Mul),
            6 => Some(Instr::Div),
            7 => Some(Instr::Mod),
            8 => Some(Instr::Eq),
            9 => Some(Instr::Neq),
            10 => Some(Instr::Lt),
            11 => Some(Instr::Gt),
            12 => Some(Instr::Lte),
            13 => Some(Instr::Gte),
            14 => Some(Instr::Load),
            15 => Some(Instr::Store),
            16 => Some(Instr::Jmp),
            17 => Some(Instr::JmpIfZero),
            18 => Some(Instr::Call),
            19 => Some(Instr::Ret),
            20 => Some(Instr::Halt),
            _ => None,
        }
    }

    /// Number of immediate operand bytes following the opcode.
    pub fn operand_len(self) -> usize {
        match self {
            Instr::Push | Instr::PushStr | Instr::Pop | Instr::Load | Instr::Store => 1,
            Instr::Jmp | Instr::JmpIfZero | Instr::Call => 2,
            _ => 0,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Instr::Push => "PUSH",
            Instr::PushStr => "PUSH_STR",
            Instr::Pop => "POP",
            Instr::Add => "ADD",
            Instr::Sub => "SUB",
            Instr::Mul => "MUL",
            Instr::Div => "DIV",
            Instr::Mod => "MOD",
            Instr::Eq => "EQ",
            Instr::Neq => "NEQ",
            Instr::Lt => "LT",
            Instr::Gt => "GT",
            Instr::Lte => "LTE",
            Instr::Gte => "GTE",
            Instr::Load => "LOAD",
            Instr::Store => "STORE",
            Instr::Jmp => "JMP",
            Instr::JmpIfZero => "JMP_IF_ZERO",
            Instr::Call => "CALL",
            Instr::Ret => "RET",
            Instr::Halt => "HALT",
        };
        f.write_str(name)
    }
}

fn reverse_lookup(table: &HashMap<String, usize>, idx: usize) -> Option<&str> {
    table
        .iter()
        .find(|(_, &i)| i == idx)
        .map(|(name, _)| name.as_str())
}

/// Renders a byte stream with symbolic operand annotations. The symbol
/// tables come from the compiler; unknown indices print as `?`.
pub fn disassemble(
    code: &[u8],
    vars: &HashMap<String, usize>,
    funcs: &HashMap<String, usize>,
    strings: &HashMap<String, usize>,
) -> String {
    let mut out = String::new();
    let mut i = 0;

    while i < code.len() {
        let Some(instr) = Instr::from_byte(code[i]) else {
            out.push_str(&format!("{:04}: ??({})\n", i, code[i]));
            i += 1;
            continue;
        };

        out.push_str(&format!("{:04}: {:<12}", i, instr.to_string()));

        match instr {
            Instr::Push => {
                if i + 1 < code.len() {
                    out.push_str(&format!(" value: {}", code[i + 1]));
                }
            }
            Instr::PushStr => {
                if i + 1 < code.len() {
                    let idx = code[i + 1] as usize;
                    let name = reverse_lookup(strings, idx).unwrap_or("?");
                    out.push_str(&format!(" string: {:?} (str_{})", name, idx));
                }
            }
            Instr::Pop | Instr::Load | Instr::Store => {
                if i + 1 < code.len() {
                    let idx = code[i + 1] as usize;
                    let name = reverse_lookup(vars, idx).unwrap_or("?");
                    out.push_str(&format!(" var: {} (var_{})", name, idx));
                }
            }
            Instr::Jmp | Instr::JmpIfZero => {
                if i + 2 < code.len() {
                    let addr = ((code[i + 1] as usize) << 8) | code[i + 2] as usize;
                    out.push_str(&format!(" addr: {}", addr));
                }
            }
            Instr::Call => {
                if i + 2 < code.len() {
                    let idx = code[i + 1] as usize;
                    let name = reverse_lookup(funcs, idx).unwrap_or("?");
                    out.push_str(&format!(" func: {} (func_{}, args={})", name, idx, code[i + 2]));
                }
            }
            _ => {}
        }

        out.push('\n');
        i += 1 + instr.operand_len();
    }

    out
}
