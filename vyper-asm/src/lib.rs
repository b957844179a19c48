//! EVM assembly primitives: the opcode table with fork gating, the
//! symbolic assembly-item stream, the two-pass assembler with
//! compile-time constant arithmetic, source maps, assembly-level dead-code
//! elimination, and the CBOR metadata trailer.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod assembler;
mod dce;
mod error;
mod item;
mod metadata;
mod opcode;
mod source_map;

pub use assembler::{
    assemble, data_segment_lengths, disassemble, push_width, render_assembly,
    resolve_symbols, AssembledProgram, SymbolMap, CODE_END, SYMBOL_SIZE,
};
pub use dce::{eliminate_dead_code, peephole};
pub use error::AsmError;
pub use item::{
    byte_length, jump_to, jumpi_to, push_int, AssemblyItem, AstRef,
    ConstOperand, DataItem, Label, SymbolRef,
};
pub use metadata::metadata_trailer;
pub use opcode::{
    immediate_len, mnemonic_for, opcode_info, EvmVersion, OpcodeInfo,
    DUP_OFFSET, PUSH_OFFSET, SWAP_OFFSET,
};
pub use source_map::{compress, expand, JumpType, PcMapEntry, SourceMap};
