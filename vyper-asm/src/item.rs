//! Assembly items: the symbolic instruction stream produced by codegen and
//! consumed by the assembler.

use core::fmt;

use ethereum_types::U256;

use crate::opcode::EvmVersion;

/// A jump destination or data-section name, unique within one program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(String);

impl Label {
    /// Create a label from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Label(name.into())
    }

    /// The label name.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a position in the originating source, carried on tagged
/// instructions for the source map. `start`/`length` are byte offsets into
/// the source identified by `source_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct AstRef {
    /// Stable id of the AST node this code was generated from.
    pub node_id: u32,
    /// Byte offset of the node in its source file.
    pub start: u32,
    /// Byte length of the node in its source file.
    pub length: u32,
    /// Source id of the file the node came from.
    pub source_id: u32,
}

/// Operand of compile-time constant arithmetic: either a named constant or
/// a ground integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstOperand {
    /// A named constant, resolved against the constant table.
    Name(String),
    /// A literal value.
    Value(U256),
}

impl fmt::Display for ConstOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstOperand::Name(n) => f.write_str(n),
            ConstOperand::Value(v) => write!(f, "{v}"),
        }
    }
}

/// The target of a [`AssemblyItem::PushOffset`]: a code label (fixed-width
/// push) or a named constant (minimal-width push).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolRef {
    /// A code or data label.
    Label(Label),
    /// A named compile-time constant.
    Const(String),
}

/// One entry of a data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataItem {
    /// Raw bytes, emitted verbatim.
    Bytes(Vec<u8>),
    /// A 2-byte big-endian reference to a label.
    Label(Label),
}

/// A single symbolic assembly item.
///
/// The item stream is flat; control structure only exists through labels
/// and references to them. Pseudo items (`Const*`, `DataHeader`, `Tagged`
/// metadata) occupy no bytes in the final bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyItem {
    /// A concrete EVM opcode by mnemonic.
    Op(String),
    /// An opcode annotated with AST provenance and an optional revert-reason
    /// tag for the error map.
    Tagged {
        /// The opcode mnemonic.
        op: String,
        /// Source position of the originating AST node.
        src: Option<AstRef>,
        /// Revert-reason tag recorded into the error map at this PC.
        error_msg: Option<String>,
    },
    /// A single literal byte of PUSH immediate data.
    Immediate(u8),
    /// A jump destination; emits one `JUMPDEST` byte.
    Label(Label),
    /// Fixed-width (`PUSH2`) push of a label address.
    PushLabel(Label),
    /// Push of `target + offset`. Label targets use the fixed symbol width;
    /// constant targets resolve during pass 1 and use the minimal width.
    PushOffset(SymbolRef, U256),
    /// Declare a named compile-time constant. Emits nothing.
    Const {
        /// Constant name.
        name: String,
        /// Constant value.
        value: U256,
    },
    /// Declare `name = op1 + op2` over the constant table. Emits nothing.
    ConstAdd {
        /// Constant name.
        name: String,
        /// Left operand.
        op1: ConstOperand,
        /// Right operand.
        op2: ConstOperand,
    },
    /// Declare `name = max(op1, op2)` over the constant table. Emits nothing.
    ConstMax {
        /// Constant name.
        name: String,
        /// Left operand.
        op1: ConstOperand,
        /// Right operand.
        op2: ConstOperand,
    },
    /// Minimal-width push of a named constant's value.
    ConstRef(String),
    /// Begin a data section. The label resolves to the section's PC but the
    /// header itself emits nothing.
    DataHeader(Label),
    /// One data-section entry.
    Data(DataItem),
}

impl AssemblyItem {
    /// Plain opcode item.
    pub fn op(mnemonic: impl Into<String>) -> Self {
        AssemblyItem::Op(mnemonic.into())
    }

    /// The opcode mnemonic if this item is a plain or tagged instruction.
    pub fn mnemonic(&self) -> Option<&str> {
        match self {
            AssemblyItem::Op(op) | AssemblyItem::Tagged { op, .. } => {
                Some(op.as_str())
            }
            _ => None,
        }
    }

    /// Whether this item terminates straight-line control flow.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.mnemonic(),
            Some("JUMP" | "RETURN" | "REVERT" | "STOP" | "INVALID" | "SELFDESTRUCT")
        )
    }
}

impl fmt::Display for AssemblyItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyItem::Op(op) => f.write_str(op),
            AssemblyItem::Tagged { op, .. } => f.write_str(op),
            AssemblyItem::Immediate(b) => write!(f, "{b:#04x}"),
            AssemblyItem::Label(l) => write!(f, "LABEL {l}"),
            AssemblyItem::PushLabel(l) => write!(f, "PUSHLABEL {l}"),
            AssemblyItem::PushOffset(SymbolRef::Label(l), ofst) => {
                write!(f, "PUSH_OFST({l}, {ofst})")
            }
            AssemblyItem::PushOffset(SymbolRef::Const(c), ofst) => {
                write!(f, "PUSH_OFST({c}, {ofst})")
            }
            AssemblyItem::Const { name, value } => {
                write!(f, "CONST {name} {value}")
            }
            AssemblyItem::ConstAdd { name, op1, op2 } => {
                write!(f, "CONST_ADD {name} {op1} {op2}")
            }
            AssemblyItem::ConstMax { name, op1, op2 } => {
                write!(f, "CONST_MAX {name} {op1} {op2}")
            }
            AssemblyItem::ConstRef(name) => write!(f, "CONSTREF {name}"),
            AssemblyItem::DataHeader(l) => write!(f, "DATA {l}"),
            AssemblyItem::Data(DataItem::Bytes(bytes)) => {
                write!(f, "DATABYTES {}", hex::encode(bytes))
            }
            AssemblyItem::Data(DataItem::Label(l)) => {
                write!(f, "DATALABEL {l}")
            }
        }
    }
}

/// Number of bytes in the big-endian representation of `x`, zero for zero.
pub fn byte_length(x: U256) -> usize {
    (x.bits() + 7) / 8
}

/// Assembly items for a minimal-width push of `x`. Zero pushes `PUSH0`
/// starting from shanghai and `PUSH1 0x00` before.
pub fn push_int(x: U256, version: EvmVersion) -> Vec<AssemblyItem> {
    let n = byte_length(x);
    if n == 0 && version.since(EvmVersion::Shanghai) {
        return vec![AssemblyItem::op("PUSH0")];
    }
    let n = n.max(1);
    let mut out = Vec::with_capacity(n + 1);
    out.push(AssemblyItem::op(format!("PUSH{n}")));
    let mut be = [0u8; 32];
    x.to_big_endian(&mut be);
    out.extend(be[32 - n..].iter().copied().map(AssemblyItem::Immediate));
    out
}

/// `PUSHLABEL l; JUMP`.
pub fn jump_to(label: Label) -> [AssemblyItem; 2] {
    [AssemblyItem::PushLabel(label), AssemblyItem::op("JUMP")]
}

/// `PUSHLABEL l; JUMPI`.
pub fn jumpi_to(label: Label) -> [AssemblyItem; 2] {
    [AssemblyItem::PushLabel(label), AssemblyItem::op("JUMPI")]
}
