//! The tree IR: a closed set of opcode-like node kinds over 256-bit words.

use core::fmt;

use ethereum_types::U256;
use vyper_asm::AstRef;

/// Where a value lives, when the IR node denotes a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    /// Not a pointer.
    #[default]
    None,
    /// Byte-addressable execution memory.
    Memory,
    /// Word-addressable persistent storage.
    Storage,
    /// Word-addressable transient storage.
    Transient,
    /// Call data.
    Calldata,
    /// Deployed code (immutables).
    Code,
}

/// Minimal semantic type carried on IR nodes; the optimizer uses it to
/// justify boolean rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrType {
    /// Guaranteed 0 or 1.
    Bool,
    /// Unsigned word.
    Uint256,
    /// Signed word, two's complement.
    Int256,
}

/// The closed IR opcode set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrOp {
    /// Literal word.
    Num(U256),
    /// Reference to a `with`-bound stack variable.
    Var(String),
    /// Push the address of a label.
    Symbol(String),

    // arithmetic & comparison, mirroring the EVM
    /// Wrapping addition.
    Add,
    /// Wrapping multiplication.
    Mul,
    /// Wrapping subtraction.
    Sub,
    /// Unsigned division; division by zero yields zero.
    Div,
    /// Signed division.
    Sdiv,
    /// Unsigned modulo; modulo zero yields zero.
    Mod,
    /// Signed modulo.
    Smod,
    /// Exponentiation.
    Exp,
    /// Unsigned less-than.
    Lt,
    /// Unsigned greater-than.
    Gt,
    /// Signed less-than.
    Slt,
    /// Signed greater-than.
    Sgt,
    /// Equality.
    Eq,
    /// Logical / bitwise zero test.
    Iszero,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Bitwise complement.
    Not,
    /// Byte extraction.
    Byte,
    /// Shift left.
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,

    // memory, storage & data environment
    /// Load a memory word.
    Mload,
    /// Store a memory word.
    Mstore,
    /// Store a single byte.
    Mstore8,
    /// Memory-to-memory copy (cancun+).
    Mcopy,
    /// Load a storage word.
    Sload,
    /// Store a storage word.
    Sstore,
    /// Load a transient-storage word (cancun+).
    Tload,
    /// Store a transient-storage word (cancun+).
    Tstore,
    /// Load a calldata word.
    Calldataload,
    /// Copy calldata to memory.
    Calldatacopy,
    /// Calldata length.
    Calldatasize,
    /// Copy own code to memory.
    Codecopy,
    /// Copy external code to memory.
    Extcodecopy,
    /// Copy return data to memory.
    Returndatacopy,
    /// Return-data length.
    Returndatasize,
    /// Keccak-256 over a memory range.
    Keccak256,
    /// Load a code word through scratch memory.
    Codeload,

    // environment
    /// Own address.
    Address,
    /// Message sender.
    Caller,
    /// Message value.
    Callvalue,
    /// Remaining gas.
    Gas,
    /// Transaction gas price.
    Gasprice,
    /// Transaction origin.
    Origin,
    /// Block timestamp.
    Timestamp,
    /// Block number.
    Number,
    /// Chain id.
    Chainid,
    /// Own balance.
    Selfbalance,
    /// Balance of an address.
    Balance,

    // control
    /// Two- or three-arm conditional.
    If,
    /// Sequential evaluation; intermediate single-word results are popped.
    Seq,
    /// Let-binding of a stack slot, scoped to the body.
    With(String),
    /// Counted loop binding a fresh loop variable.
    Repeat(String),
    /// Static jump to a label, optionally pushing arguments first.
    Goto(String),
    /// Pop an address off the stack and jump to it (or evaluate the single
    /// argument and jump).
    Jump,
    /// Define a jump destination.
    Label(String),
    /// Jump to the shared failure block unless the condition holds.
    Assert,
    /// Halt with `INVALID` unless the condition holds.
    AssertUnreachable,
    /// Constructor epilogue: copy a data section holding the runtime
    /// program to memory and return it. The payload is the section label.
    Deploy(String),

    // calls & termination
    /// Message call.
    Call,
    /// Static message call.
    Staticcall,
    /// Delegate call.
    Delegatecall,
    /// Contract creation.
    Create,
    /// Salted contract creation.
    Create2,
    /// Return a memory range.
    Return,
    /// Revert with a memory range.
    Revert,
    /// Halt successfully.
    Stop,
    /// Halt with an invalid instruction.
    Invalid,
    /// Destroy the contract.
    Selfdestruct,
    /// Log with 0 topics.
    Log0,
    /// Log with 1 topic.
    Log1,
    /// Log with 2 topics.
    Log2,
    /// Log with 3 topics.
    Log3,
    /// Log with 4 topics.
    Log4,

    // pseudo ops, expanded during lowering
    /// Signed two-sided bounds check, yields the checked value.
    Clamp,
    /// Unsigned two-sided bounds check.
    Uclamp,
    /// Signed strict upper bound.
    ClampLt,
    /// Signed upper bound.
    ClampLe,
    /// Signed strict lower bound.
    ClampGt,
    /// Signed lower bound.
    ClampGe,
    /// Unsigned strict upper bound.
    UclampLt,
    /// Unsigned upper bound.
    UclampLe,
    /// Unsigned strict lower bound.
    UclampGt,
    /// Unsigned lower bound.
    UclampGe,
    /// Nonzero check, yields the checked value.
    ClampNonzero,
    /// Round up to a multiple of 32.
    Ceil32,
    /// Keccak-256 of one word.
    Sha3_32,
    /// Keccak-256 of two words.
    Sha3_64,
    /// Inequality.
    Ne,
    /// Unsigned less-or-equal.
    Le,
    /// Unsigned greater-or-equal.
    Ge,
    /// Signed less-or-equal.
    Sle,
    /// Signed greater-or-equal.
    Sge,
    /// Discard one stack item.
    Pop,
    /// No-op, no stack effect.
    Pass,
    /// No-op that claims one stack item already present.
    Dummy,
    /// Exit the innermost loop.
    Break,
    /// Jump to the innermost loop's latch.
    Continue,
    /// Pop the innermost loop frame without transferring control.
    CleanupRepeat,
    /// Pop every enclosing loop frame (used before returning from inside
    /// loops).
    ExitRepeater,
    /// Assign to a `with`-bound variable.
    Set,
}

/// How many children an op takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly this many.
    Exact(usize),
    /// Any number.
    Variadic,
    /// Between the two bounds, inclusive.
    Between(usize, usize),
}

impl IrOp {
    /// The EVM mnemonic, for ops that lower to a single opcode.
    pub fn mnemonic(&self) -> Option<&'static str> {
        use IrOp::*;
        Some(match self {
            Add => "ADD",
            Mul => "MUL",
            Sub => "SUB",
            Div => "DIV",
            Sdiv => "SDIV",
            Mod => "MOD",
            Smod => "SMOD",
            Exp => "EXP",
            Lt => "LT",
            Gt => "GT",
            Slt => "SLT",
            Sgt => "SGT",
            Eq => "EQ",
            Iszero => "ISZERO",
            And => "AND",
            Or => "OR",
            Xor => "XOR",
            Not => "NOT",
            Byte => "BYTE",
            Shl => "SHL",
            Shr => "SHR",
            Sar => "SAR",
            Mload => "MLOAD",
            Mstore => "MSTORE",
            Mstore8 => "MSTORE8",
            Mcopy => "MCOPY",
            Sload => "SLOAD",
            Sstore => "SSTORE",
            Tload => "TLOAD",
            Tstore => "TSTORE",
            Calldataload => "CALLDATALOAD",
            Calldatacopy => "CALLDATACOPY",
            Calldatasize => "CALLDATASIZE",
            Codecopy => "CODECOPY",
            Extcodecopy => "EXTCODECOPY",
            Returndatacopy => "RETURNDATACOPY",
            Returndatasize => "RETURNDATASIZE",
            Keccak256 => "SHA3",
            Address => "ADDRESS",
            Caller => "CALLER",
            Callvalue => "CALLVALUE",
            Gas => "GAS",
            Gasprice => "GASPRICE",
            Origin => "ORIGIN",
            Timestamp => "TIMESTAMP",
            Number => "NUMBER",
            Chainid => "CHAINID",
            Selfbalance => "SELFBALANCE",
            Balance => "BALANCE",
            Call => "CALL",
            Staticcall => "STATICCALL",
            Delegatecall => "DELEGATECALL",
            Create => "CREATE",
            Create2 => "CREATE2",
            Return => "RETURN",
            Revert => "REVERT",
            Stop => "STOP",
            Invalid => "INVALID",
            Selfdestruct => "SELFDESTRUCT",
            Log0 => "LOG0",
            Log1 => "LOG1",
            Log2 => "LOG2",
            Log3 => "LOG3",
            Log4 => "LOG4",
            Pop => "POP",
            _ => return None,
        })
    }

    /// Child count accepted by the op.
    pub fn arity(&self) -> Arity {
        use IrOp::*;
        match self {
            Num(_) | Var(_) | Symbol(_) | Label(_) | Pass | Dummy | Break
            | Continue | CleanupRepeat | ExitRepeater | Calldatasize
            | Returndatasize | Address | Caller | Callvalue | Gas | Gasprice
            | Origin | Timestamp | Number | Chainid | Selfbalance | Stop
            | Invalid => Arity::Exact(0),
            Iszero | Not | Mload | Sload | Tload | Calldataload | Balance
            | Selfdestruct | Ceil32 | Sha3_32 | ClampNonzero | Codeload
            | Pop => Arity::Exact(1),
            Add | Mul | Sub | Div | Sdiv | Mod | Smod | Exp | Lt | Gt | Slt
            | Sgt | Eq | And | Or | Xor | Byte | Shl | Shr | Sar | Mstore
            | Mstore8 | Sstore | Tstore | Keccak256 | Return | Revert
            | Sha3_64 | Ne | Le | Ge | Sle | Sge | ClampLt | ClampLe
            | ClampGt | ClampGe | UclampLt | UclampLe | UclampGt | UclampGe
            | Set | Log0 | Deploy(_) => Arity::Exact(2),
            Mcopy | Calldatacopy | Codecopy | Returndatacopy | Create
            | Clamp | Uclamp | Log1 => Arity::Exact(3),
            Extcodecopy | Create2 | Log2 => Arity::Exact(4),
            Log3 => Arity::Exact(5),
            Call => Arity::Exact(7),
            Staticcall | Delegatecall | Log4 => Arity::Exact(6),
            If => Arity::Between(2, 3),
            Seq | Goto(_) => Arity::Variadic,
            With(_) => Arity::Exact(2),
            Repeat(_) => Arity::Exact(4),
            Jump => Arity::Between(0, 1),
            Assert | AssertUnreachable => Arity::Exact(1),
        }
    }
}

/// A node of the tree IR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrNode {
    /// The op tag.
    pub op: IrOp,
    /// Ordered children.
    pub args: Vec<IrNode>,
    /// Optional semantic type.
    pub typ: Option<IrType>,
    /// Pointer location class.
    pub location: Location,
    /// Source provenance for the source map.
    pub src: Option<AstRef>,
    /// Revert-reason tag attached to failure jumps lowered from this node.
    pub error_msg: Option<String>,
    /// Free-form diagnostic note.
    pub annotation: Option<String>,
}

impl IrNode {
    /// Construct a node, panicking on arity or valency violations. These
    /// indicate a codegen bug, never bad user input.
    pub fn new(op: IrOp, args: Vec<IrNode>) -> Self {
        match Self::try_new(op, args) {
            Ok(node) => node,
            Err(e) => panic!("malformed IR: {e}"),
        }
    }

    /// Construct a node, checking the op's arity and that every child in a
    /// value position has valency 1.
    pub fn try_new(op: IrOp, args: Vec<IrNode>) -> Result<Self, IrStructureError> {
        let ok = match op.arity() {
            Arity::Exact(n) => args.len() == n,
            Arity::Variadic => true,
            Arity::Between(lo, hi) => (lo..=hi).contains(&args.len()),
        };
        if !ok {
            return Err(IrStructureError::BadArity {
                op: format!("{op:?}"),
                got: args.len(),
            });
        }

        // children in value positions must each leave one word
        let value_args: &[&IrNode] = &match &op {
            IrOp::Seq => vec![],
            IrOp::If => vec![&args[0]],
            IrOp::With(_) => vec![&args[0]],
            IrOp::Repeat(_) => vec![&args[0], &args[1]],
            IrOp::Set => vec![&args[1]],
            _ => args.iter().collect(),
        }[..];
        for arg in value_args {
            if arg.valency() != 1 {
                return Err(IrStructureError::ZeroValentArgument {
                    op: format!("{op:?}"),
                    arg: format!("{:?}", arg.op),
                });
            }
        }

        Ok(IrNode {
            op,
            args,
            typ: None,
            location: Location::None,
            src: None,
            error_msg: None,
            annotation: None,
        })
    }

    /// Literal word.
    pub fn num(value: impl Into<U256>) -> Self {
        Self::new(IrOp::Num(value.into()), vec![])
    }

    /// `with`-bound variable reference.
    pub fn var(name: impl Into<String>) -> Self {
        Self::new(IrOp::Var(name.into()), vec![])
    }

    /// Label-address push.
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::new(IrOp::Symbol(name.into()), vec![])
    }

    /// Sequential block.
    pub fn seq(args: Vec<IrNode>) -> Self {
        Self::new(IrOp::Seq, args)
    }

    /// Let-binding.
    pub fn with(name: impl Into<String>, init: IrNode, body: IrNode) -> Self {
        Self::new(IrOp::With(name.into()), vec![init, body])
    }

    /// Static jump without arguments.
    pub fn goto(target: impl Into<String>) -> Self {
        Self::new(IrOp::Goto(target.into()), vec![])
    }

    /// Jump destination.
    pub fn label(name: impl Into<String>) -> Self {
        Self::new(IrOp::Label(name.into()), vec![])
    }

    /// Attach a source reference.
    pub fn with_src(mut self, src: AstRef) -> Self {
        self.src = Some(src);
        self
    }

    /// Attach a revert-reason tag.
    pub fn with_error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Attach a diagnostic note.
    pub fn with_annotation(mut self, note: impl Into<String>) -> Self {
        self.annotation = Some(note.into());
        self
    }

    /// Attach a semantic type.
    pub fn with_typ(mut self, typ: IrType) -> Self {
        self.typ = Some(typ);
        self
    }

    /// Number of words this node leaves on the stack: 0 or 1.
    pub fn valency(&self) -> usize {
        use IrOp::*;
        match &self.op {
            Num(_) | Var(_) | Symbol(_) | Dummy => 1,
            Seq => self.args.last().map_or(0, IrNode::valency),
            With(_) => self.args[1].valency(),
            If => {
                // both arms must agree; a two-armed if is statement-like
                if self.args.len() == 3 {
                    self.args[1].valency()
                } else {
                    0
                }
            }
            Repeat(_) | Goto(_) | Jump | Label(_) | Assert
            | AssertUnreachable | Deploy(_) | Pass | Break | Continue
            | CleanupRepeat | ExitRepeater | Set => 0,
            Clamp | Uclamp | ClampLt | ClampLe | ClampGt | ClampGe
            | UclampLt | UclampLe | UclampGt | UclampGe | ClampNonzero
            | Ceil32 | Sha3_32 | Sha3_64 | Ne | Le | Ge | Sle | Sge
            | Codeload => 1,
            op => {
                let mnemonic = op.mnemonic().expect("op lowers to an opcode");
                let info = vyper_asm::opcode_info(
                    mnemonic,
                    vyper_asm::EvmVersion::Cancun,
                )
                .expect("mnemonic in table");
                info.pushes as usize
            }
        }
    }

    /// Whether evaluating this node can observe or mutate machine state.
    /// Used by the optimizer before discarding subtrees.
    pub fn is_pure(&self) -> bool {
        use IrOp::*;
        let op_pure = matches!(
            &self.op,
            Num(_)
                | Var(_)
                | Add
                | Mul
                | Sub
                | Div
                | Sdiv
                | Mod
                | Smod
                | Exp
                | Lt
                | Gt
                | Slt
                | Sgt
                | Eq
                | Iszero
                | And
                | Or
                | Xor
                | Not
                | Byte
                | Shl
                | Shr
                | Sar
                | Calldataload
                | Calldatasize
                | Address
                | Caller
                | Callvalue
                | Gasprice
                | Origin
                | Timestamp
                | Number
                | Chainid
                | Pass
        );
        op_pure && self.args.iter().all(IrNode::is_pure)
    }

    /// Total node count, the optimizer's termination measure.
    pub fn size(&self) -> usize {
        1 + self.args.iter().map(IrNode::size).sum::<usize>()
    }

    /// Literal value if this node is a `Num`.
    pub fn as_num(&self) -> Option<U256> {
        match self.op {
            IrOp::Num(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this node is boolean-valued (guaranteed 0 or 1).
    pub fn is_boolean(&self) -> bool {
        use IrOp::*;
        self.typ == Some(IrType::Bool)
            || matches!(
                self.op,
                Lt | Gt | Slt | Sgt | Eq | Iszero | Ne | Le | Ge | Sle | Sge
            )
    }
}

impl fmt::Display for IrNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            IrOp::Num(v) => write!(f, "{v}"),
            IrOp::Var(n) => write!(f, "{n}"),
            IrOp::Symbol(n) => write!(f, "(symbol {n})"),
            op => {
                let name = match op {
                    IrOp::With(n) => format!("with {n}"),
                    IrOp::Repeat(n) => format!("repeat {n}"),
                    IrOp::Goto(n) => format!("goto {n}"),
                    IrOp::Label(n) => format!("label {n}"),
                    IrOp::Deploy(n) => format!("deploy {n}"),
                    other => format!("{other:?}").to_lowercase(),
                };
                write!(f, "({name}")?;
                for arg in &self.args {
                    write!(f, " {arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Structural IR violations caught at construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IrStructureError {
    /// Wrong number of children for the op.
    #[error("op {op} got {got} arguments")]
    BadArity {
        /// The op.
        op: String,
        /// The child count supplied.
        got: usize,
    },
    /// A value-position child does not leave a word on the stack.
    #[error("op {op} consumes a value but argument {arg} has valency 0")]
    ZeroValentArgument {
        /// The op.
        op: String,
        /// The offending child.
        arg: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valency_of_composites() {
        let n = IrNode::seq(vec![
            IrNode::new(IrOp::Pass, vec![]),
            IrNode::num(1u64),
        ]);
        assert_eq!(n.valency(), 1);

        let n = IrNode::seq(vec![IrNode::num(1u64), IrNode::new(IrOp::Pass, vec![])]);
        assert_eq!(n.valency(), 0);

        let n = IrNode::with(
            "x",
            IrNode::num(1u64),
            IrNode::new(IrOp::Iszero, vec![IrNode::var("x")]),
        );
        assert_eq!(n.valency(), 1);
    }

    #[test]
    fn arity_is_enforced() {
        let err = IrNode::try_new(IrOp::Add, vec![IrNode::num(1u64)]);
        assert!(matches!(err, Err(IrStructureError::BadArity { .. })));
    }

    #[test]
    fn zero_valent_value_argument_rejected() {
        let err = IrNode::try_new(
            IrOp::Iszero,
            vec![IrNode::new(IrOp::Pass, vec![])],
        );
        assert!(matches!(
            err,
            Err(IrStructureError::ZeroValentArgument { .. })
        ));
    }

    #[test]
    fn purity() {
        let pure = IrNode::new(
            IrOp::Add,
            vec![IrNode::num(1u64), IrNode::num(2u64)],
        );
        assert!(pure.is_pure());

        let impure = IrNode::new(IrOp::Sload, vec![IrNode::num(0u64)]);
        assert!(!impure.is_pure());
        let wrapped = IrNode::new(IrOp::Iszero, vec![impure]);
        assert!(!wrapped.is_pure());
    }

    #[test]
    fn display_is_lispy() {
        let n = IrNode::seq(vec![IrNode::new(
            IrOp::Mstore,
            vec![IrNode::num(64u64), IrNode::num(42u64)],
        )]);
        assert_eq!(n.to_string(), "(seq (mstore 64 42))");
    }
}
