//! Decompiler for CPython bytecode modules.
//!
//! `depyc_lib` reads a marshalled `.pyc` container, simulates the evaluation
//! stack over the instruction stream of every code record, and prints the
//! reconstructed syntax tree back as Python source. Bytecode format versions
//! from roughly 1.0 through 3.12 are normalized onto one canonical opcode
//! set before reconstruction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod ast;
pub mod dispatch;
pub mod engine;
pub mod marshal;
pub mod printer;
pub mod tables;

pub use engine::BuildCtx;
pub use marshal::{read_module, CodeFlags, CodeObject, PycModule, Value};
pub use tables::{Opcode, OperandClass, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    /// Reconstructed Python source.
    Source,
    /// Instruction listing, one paragraph per code record.
    Disasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: OutputMode,
    /// Prefix the output with a warning banner when soft decode errors made
    /// the reconstruction incomplete.
    pub warn_banner: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: OutputMode::Source,
            warn_banner: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum DepycError {
    #[error("unexpected end of input")]
    Eof,

    #[error("bad pyc magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("module root is a {0}, expected a code object")]
    BadRoot(&'static str),

    #[error("unknown marshal type code: 0x{0:02x}")]
    UnknownTypeCode(u8),

    #[error("invalid back-reference: {0}")]
    BadRef(u32),

    #[error("unexpected null in marshal stream")]
    UnexpectedNull,

    #[error("unknown opcode 0x{opcode:02x} at offset {pos} for version {version}")]
    UnknownOpcode {
        opcode: u8,
        pos: u32,
        version: Version,
    },

    #[error("truncated instruction at offset {pos}")]
    TruncatedInstruction { pos: u32 },

    #[error("constant pool index {index} out of range at offset {pos}")]
    BadConstIndex { index: u32, pos: u32 },

    #[error("name index {index} out of range at offset {pos}")]
    BadNameIndex { index: u32, pos: u32 },

    #[error("block stack underflow at offset {pos}")]
    BlockUnderflow { pos: u32 },
}

/// Decompile a whole `.pyc` file to source text.
pub fn decompile(data: &[u8]) -> Result<String, DepycError> {
    decompile_with_options(data, DecompileOptions::default())
}

pub fn decompile_with_options(
    data: &[u8],
    options: DecompileOptions,
) -> Result<String, DepycError> {
    let module = marshal::read_module(data)?;
    decompile_module(&module, options)
}

/// Decompile an already-parsed module.
pub fn decompile_module(
    module: &PycModule,
    options: DecompileOptions,
) -> Result<String, DepycError> {
    match options.mode {
        OutputMode::Disasm => printer::disassemble_module(module),
        OutputMode::Source => {
            let mut ctx = BuildCtx::new(module.version);
            let out = printer::print_module(module, &mut ctx)?;
            if !ctx.clean && options.warn_banner {
                Ok(format!(
                    "# WARNING: decompile incomplete, output may be missing statements\n{out}"
                ))
            } else {
                Ok(out)
            }
        }
    }
}
