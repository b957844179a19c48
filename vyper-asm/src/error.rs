//! Assembler error variants.

use crate::item::Label;
use crate::opcode::EvmVersion;

/// Errors raised while resolving symbols or emitting bytecode.
///
/// Most of these indicate a bug in the codegen layer rather than bad user
/// input; the compiler crate surfaces them as internal panics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AsmError {
    /// The same label was defined twice in one program.
    #[error("duplicate label: {0}")]
    DuplicateLabel(Label),
    /// A referenced label was never defined.
    #[error("undefined label: {0}")]
    UndefinedLabel(Label),
    /// A referenced constant was never defined or never resolved.
    #[error("undefined constant: {0}")]
    UndefinedConst(String),
    /// The same constant name was declared twice.
    #[error("duplicate constant: {0}")]
    DuplicateConst(String),
    /// An instruction mnemonic is not in the opcode table.
    #[error("unknown opcode: {0}")]
    UnknownOpcode(String),
    /// An opcode is not available under the active fork ruleset.
    #[error("opcode {mnemonic} requires a newer fork than {version}")]
    OpcodeNotAvailable {
        /// The gated mnemonic.
        mnemonic: String,
        /// The active ruleset.
        version: EvmVersion,
    },
    /// A label address plus offset does not fit the fixed symbol width.
    #[error("symbol overflow for {label}: {value} exceeds the symbol width")]
    SymbolOverflow {
        /// The overflowing label.
        label: Label,
        /// The resolved value.
        value: u64,
    },
    /// A compressed source map could not be parsed.
    #[error("malformed compressed source map: {0}")]
    SourceMapFormat(String),
}
