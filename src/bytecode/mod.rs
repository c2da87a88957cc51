//! Bytecode format shared by the code generator, the interpreter and the
//! disassembler.
pub mod disassembler;
pub mod opcodes;

pub use disassembler::{disassemble, disassemble_value};
