//! The annotated AST the core consumes.
//!
//! The external front-end (parser plus semantic analyzer) produces this
//! tree; the core never re-checks types. Annotations that the original
//! design threaded through dynamic attributes are plain typed fields here.

use core::fmt;
use std::rc::Rc;

use ethereum_types::U256;
use sha3::{Digest, Keccak256};
use vyper_asm::AstRef;

/// Stable node id, unique within one compilation.
pub type AstId = u32;

/// Position and identity shared by every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeInfo {
    /// Stable id.
    pub node_id: AstId,
    /// 1-based start line.
    pub lineno: u32,
    /// 0-based start column.
    pub col_offset: u32,
    /// 1-based end line.
    pub end_lineno: u32,
    /// 0-based end column.
    pub end_col_offset: u32,
    /// Byte offset of the node in its source.
    pub src_start: u32,
    /// Byte length of the node.
    pub src_length: u32,
    /// Source id of the owning file.
    pub source_id: u32,
}

impl NodeInfo {
    /// The `"<start>:<length>:<source_id>"` interchange form.
    pub fn src(&self) -> String {
        format!("{}:{}:{}", self.src_start, self.src_length, self.source_id)
    }

    /// Reference carried into the assembly stream.
    pub fn ast_ref(&self) -> AstRef {
        AstRef {
            node_id: self.node_id,
            start: self.src_start,
            length: self.src_length,
            source_id: self.source_id,
        }
    }
}

/// Value types of the supported surface language subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VyType {
    /// Unsigned 256-bit integer.
    Uint256,
    /// Signed 256-bit integer.
    Int256,
    /// Boolean.
    Bool,
    /// 20-byte address.
    Address,
    /// Fixed 32 bytes.
    Bytes32,
    /// Storage-only mapping.
    HashMap(Box<VyType>, Box<VyType>),
}

impl VyType {
    /// The canonical ABI type name.
    pub fn abi_type(&self) -> String {
        match self {
            VyType::Uint256 => "uint256".into(),
            VyType::Int256 => "int256".into(),
            VyType::Bool => "bool".into(),
            VyType::Address => "address".into(),
            VyType::Bytes32 => "bytes32".into(),
            VyType::HashMap(k, v) => {
                format!("HashMap[{},{}]", k.abi_type(), v.abi_type())
            }
        }
    }

    /// Size of one value in bytes (ABI word for all scalar types).
    pub fn size_in_bytes(&self) -> usize {
        32
    }

    /// Words of storage one value occupies. A hash map takes one slot,
    /// which acts as the hashing salt for its elements.
    pub fn storage_size_in_words(&self) -> usize {
        1
    }

    /// Whether this is a signed integer type.
    pub fn is_signed(&self) -> bool {
        matches!(self, VyType::Int256)
    }

    /// Upper bound for calldata clamping, when the type does not span the
    /// full word.
    pub fn calldata_bound(&self) -> Option<U256> {
        match self {
            VyType::Bool => Some(U256::one()),
            VyType::Address => {
                Some((U256::one() << 160) - U256::one())
            }
            _ => None,
        }
    }
}

impl fmt::Display for VyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.abi_type())
    }
}

/// Where a state variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataLocation {
    /// Persistent storage.
    Storage,
    /// Transient storage (EIP-1153).
    Transient,
    /// Code immutables.
    Code,
}

/// Function visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Callable through the dispatcher.
    External,
    /// Callable only through the internal-call protocol.
    Internal,
}

/// Function state mutability, as in the ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMutability {
    /// No state reads or writes.
    Pure,
    /// State reads only.
    View,
    /// State writes, no ether accepted.
    Nonpayable,
    /// State writes, ether accepted.
    Payable,
}

impl StateMutability {
    /// The ABI string.
    pub fn as_abi(&self) -> &'static str {
        match self {
            StateMutability::Pure => "pure",
            StateMutability::View => "view",
            StateMutability::Nonpayable => "nonpayable",
            StateMutability::Payable => "payable",
        }
    }
}

/// One module (compilation unit).
#[derive(Debug, Clone)]
pub struct Module {
    /// Shared node fields.
    pub node: NodeInfo,
    /// Source id assigned by the input bundle.
    pub source_id: i32,
    /// Path as imported.
    pub path: String,
    /// Path as resolved on disk (or in the bundle).
    pub resolved_path: String,
    /// Whether this is a `.vyi` interface file.
    pub is_interface: bool,
    /// Full source text, used by the integrity hash.
    pub source: String,
    /// Top-level declarations in source order.
    pub body: Vec<TopLevel>,
}

impl Module {
    /// All import statements in source order.
    pub fn imports(&self) -> impl Iterator<Item = &ImportStmt> {
        self.body.iter().filter_map(|t| match t {
            TopLevel::Import(i) => Some(i),
            _ => None,
        })
    }

    /// All function definitions in source order.
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.body.iter().filter_map(|t| match t {
            TopLevel::FunctionDef(f) => Some(f),
            _ => None,
        })
    }

    /// All variable declarations in source order.
    pub fn variables(&self) -> impl Iterator<Item = &VariableDecl> {
        self.body.iter().filter_map(|t| match t {
            TopLevel::VariableDecl(v) => Some(v),
            _ => None,
        })
    }

    /// All event definitions in source order.
    pub fn events(&self) -> impl Iterator<Item = &EventDef> {
        self.body.iter().filter_map(|t| match t {
            TopLevel::EventDef(e) => Some(e),
            _ => None,
        })
    }
}

/// Shared handle for modules in the import graph.
pub type ModuleRc = Rc<Module>;

/// Top-level declarations.
#[derive(Debug, Clone)]
pub enum TopLevel {
    /// `import` / `from ... import`.
    Import(ImportStmt),
    /// State variable, constant or immutable declaration.
    VariableDecl(VariableDecl),
    /// Function definition.
    FunctionDef(FunctionDef),
    /// Event definition.
    EventDef(EventDef),
    /// `initializes: module` declaration.
    InitializesDecl(InitializesDecl),
    /// Struct definition (layout-inert in this subset).
    StructDef(StructDef),
    /// Interface definition (layout-inert).
    InterfaceDef(InterfaceDef),
    /// Flag definition (layout-inert).
    FlagDef(FlagDef),
}

/// Kind of import statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import a.b as c`.
    Plain,
    /// `from a import b [as c]`, with a relative level.
    From,
}

/// An import statement.
#[derive(Debug, Clone)]
pub struct ImportStmt {
    /// Shared node fields.
    pub node: NodeInfo,
    /// Plain or from-import.
    pub kind: ImportKind,
    /// Qualified module name (`a.b.c`).
    pub qualified_name: String,
    /// Relative level: 0 absolute, `n >= 1` means `n - 1` parent hops.
    pub level: u32,
    /// Alias, if any.
    pub alias: Option<String>,
}

/// A state variable, constant or immutable declaration.
#[derive(Debug, Clone)]
pub struct VariableDecl {
    /// Shared node fields.
    pub node: NodeInfo,
    /// Variable name.
    pub name: String,
    /// Declared type.
    pub typ: VyType,
    /// `public(...)` wrapper present.
    pub is_public: bool,
    /// `constant(...)`: folded at compile time, no storage.
    pub is_constant: bool,
    /// `immutable(...)`: lives in code.
    pub is_immutable: bool,
    /// `transient(...)`: lives in transient storage.
    pub is_transient: bool,
    /// Initializer (constants only, in this subset).
    pub value: Option<Expr>,
}

impl VariableDecl {
    /// Whether the declaration occupies a data location at all.
    pub fn is_state_variable(&self) -> bool {
        !self.is_constant
    }

    /// Which region the variable allocates in.
    pub fn location(&self) -> DataLocation {
        if self.is_immutable {
            DataLocation::Code
        } else if self.is_transient {
            DataLocation::Transient
        } else {
            DataLocation::Storage
        }
    }
}

/// `initializes: alias`.
#[derive(Debug, Clone)]
pub struct InitializesDecl {
    /// Shared node fields.
    pub node: NodeInfo,
    /// The imported module alias being initialized here.
    pub module_alias: String,
}

/// A function argument.
#[derive(Debug, Clone)]
pub struct FuncArg {
    /// Argument name.
    pub name: String,
    /// Argument type.
    pub typ: VyType,
}

/// A function definition, fully annotated.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    /// Shared node fields.
    pub node: NodeInfo,
    /// Function name. `__init__` is the constructor, `__default__` the
    /// fallback.
    pub name: String,
    /// Arguments in order.
    pub args: Vec<FuncArg>,
    /// Return type, if any.
    pub returns: Option<VyType>,
    /// Body statements.
    pub body: Vec<Stmt>,
    /// External or internal.
    pub visibility: Visibility,
    /// Mutability class.
    pub mutability: StateMutability,
    /// `@nonreentrant` marker.
    pub nonreentrant: bool,
}

impl FunctionDef {
    /// Canonical signature, e.g. `transfer(address,uint256)`.
    pub fn signature(&self) -> String {
        let args = self
            .args
            .iter()
            .map(|a| a.typ.abi_type())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}({args})", self.name)
    }

    /// The 4-byte selector as a big-endian integer.
    pub fn selector(&self) -> u32 {
        method_id(&self.signature())
    }

    /// Whether this is the constructor.
    pub fn is_constructor(&self) -> bool {
        self.name == "__init__"
    }

    /// Whether this is the fallback handler.
    pub fn is_fallback(&self) -> bool {
        self.name == "__default__"
    }
}

/// One event field.
#[derive(Debug, Clone)]
pub struct EventArg {
    /// Field name.
    pub name: String,
    /// Field type.
    pub typ: VyType,
    /// `indexed(...)` wrapper present.
    pub indexed: bool,
}

/// An event definition.
#[derive(Debug, Clone)]
pub struct EventDef {
    /// Shared node fields.
    pub node: NodeInfo,
    /// Event name.
    pub name: String,
    /// Fields in order.
    pub args: Vec<EventArg>,
}

impl EventDef {
    /// Canonical signature for topic 0.
    pub fn signature(&self) -> String {
        let args = self
            .args
            .iter()
            .map(|a| a.typ.abi_type())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}({args})", self.name)
    }

    /// `keccak256` of the signature.
    pub fn topic0(&self) -> U256 {
        let digest = Keccak256::digest(self.signature().as_bytes());
        U256::from_big_endian(&digest)
    }
}

/// Struct definition (no layout in this subset; structs are not storable).
#[derive(Debug, Clone)]
pub struct StructDef {
    /// Shared node fields.
    pub node: NodeInfo,
    /// Struct name.
    pub name: String,
    /// Fields in order.
    pub fields: Vec<(String, VyType)>,
}

/// Interface definition.
#[derive(Debug, Clone)]
pub struct InterfaceDef {
    /// Shared node fields.
    pub node: NodeInfo,
    /// Interface name.
    pub name: String,
}

/// Flag definition.
#[derive(Debug, Clone)]
pub struct FlagDef {
    /// Shared node fields.
    pub node: NodeInfo,
    /// Flag name.
    pub name: String,
    /// Member names in order.
    pub members: Vec<String>,
}

/// Statements.
#[derive(Debug, Clone)]
pub enum Stmt {
    /// Expression statement.
    Expr(Expr),
    /// Local variable declaration with initializer.
    LocalDecl {
        /// Shared node fields.
        node: NodeInfo,
        /// Name.
        name: String,
        /// Declared type.
        typ: VyType,
        /// Initializer.
        value: Expr,
    },
    /// Assignment.
    Assign {
        /// Shared node fields.
        node: NodeInfo,
        /// Target.
        target: Target,
        /// Value.
        value: Expr,
    },
    /// Augmented assignment (`+=` and friends).
    AugAssign {
        /// Shared node fields.
        node: NodeInfo,
        /// The binary op applied.
        op: BinOpKind,
        /// Target.
        target: Target,
        /// Right-hand side.
        value: Expr,
    },
    /// `return [expr]`.
    Return {
        /// Shared node fields.
        node: NodeInfo,
        /// Returned value, if any.
        value: Option<Expr>,
    },
    /// `assert expr`.
    Assert {
        /// Shared node fields.
        node: NodeInfo,
        /// Condition.
        cond: Expr,
    },
    /// `raise`.
    Raise {
        /// Shared node fields.
        node: NodeInfo,
    },
    /// `if cond: ... else: ...`.
    If {
        /// Shared node fields.
        node: NodeInfo,
        /// Condition.
        cond: Expr,
        /// Then-branch.
        then: Vec<Stmt>,
        /// Else-branch (possibly empty).
        orelse: Vec<Stmt>,
    },
    /// `for i in range(...)`.
    For {
        /// Shared node fields.
        node: NodeInfo,
        /// Loop variable.
        var: String,
        /// Loop variable type (from the pre-parser side table).
        typ: VyType,
        /// Range start (defaults to zero).
        start: Option<Expr>,
        /// Range stop; must be a literal in this subset.
        stop: Expr,
        /// Body.
        body: Vec<Stmt>,
    },
    /// `pass`.
    Pass {
        /// Shared node fields.
        node: NodeInfo,
    },
    /// `break`.
    Break {
        /// Shared node fields.
        node: NodeInfo,
    },
    /// `continue`.
    Continue {
        /// Shared node fields.
        node: NodeInfo,
    },
    /// `log Event(args...)`.
    Log {
        /// Shared node fields.
        node: NodeInfo,
        /// Event name.
        event: String,
        /// Arguments in field order.
        args: Vec<Expr>,
    },
}

impl Stmt {
    /// The node info of any statement.
    pub fn node(&self) -> &NodeInfo {
        match self {
            Stmt::Expr(e) => e.node(),
            Stmt::LocalDecl { node, .. }
            | Stmt::Assign { node, .. }
            | Stmt::AugAssign { node, .. }
            | Stmt::Return { node, .. }
            | Stmt::Assert { node, .. }
            | Stmt::Raise { node }
            | Stmt::If { node, .. }
            | Stmt::For { node, .. }
            | Stmt::Pass { node }
            | Stmt::Break { node }
            | Stmt::Continue { node }
            | Stmt::Log { node, .. } => node,
        }
    }
}

/// Assignment targets.
#[derive(Debug, Clone)]
pub enum Target {
    /// Local variable.
    Name(String),
    /// `self.x`.
    SelfAttr(String),
    /// `self.m[key]`.
    SelfSubscript {
        /// The mapping variable.
        attr: String,
        /// The key expression.
        key: Box<Expr>,
    },
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `//`
    Div,
    /// `%`
    Mod,
    /// `**`
    Pow,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOpKind {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Expressions, annotated with their type where it matters for lowering.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Integer literal.
    Int {
        /// Shared node fields.
        node: NodeInfo,
        /// Value.
        value: U256,
        /// Inferred type.
        typ: VyType,
    },
    /// Boolean literal.
    Bool {
        /// Shared node fields.
        node: NodeInfo,
        /// Value.
        value: bool,
    },
    /// Local variable or argument reference.
    Name {
        /// Shared node fields.
        node: NodeInfo,
        /// Name.
        name: String,
    },
    /// `self.x`.
    SelfAttr {
        /// Shared node fields.
        node: NodeInfo,
        /// Attribute name.
        attr: String,
    },
    /// `self.m[key]`.
    SelfSubscript {
        /// Shared node fields.
        node: NodeInfo,
        /// Mapping name.
        attr: String,
        /// Key.
        key: Box<Expr>,
    },
    /// Environment attribute (`msg.sender`, `block.timestamp`, ...).
    EnvAttr {
        /// Shared node fields.
        node: NodeInfo,
        /// Base (`msg`, `block`, `tx`, `chain`, `self`).
        base: String,
        /// Attribute.
        attr: String,
    },
    /// Binary arithmetic.
    BinOp {
        /// Shared node fields.
        node: NodeInfo,
        /// Operator.
        op: BinOpKind,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
        /// Operand/result type.
        typ: VyType,
    },
    /// Comparison.
    Compare {
        /// Shared node fields.
        node: NodeInfo,
        /// Operator.
        op: CmpOpKind,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
        /// Operand type (signedness drives opcode choice).
        operand_typ: VyType,
    },
    /// `and` / `or` over booleans.
    BoolOp {
        /// Shared node fields.
        node: NodeInfo,
        /// True for `and`, false for `or`.
        is_and: bool,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// `not x`.
    Not {
        /// Shared node fields.
        node: NodeInfo,
        /// Operand.
        operand: Box<Expr>,
    },
    /// Unary minus.
    Neg {
        /// Shared node fields.
        node: NodeInfo,
        /// Operand.
        operand: Box<Expr>,
    },
    /// `self.f(args...)`: internal call.
    SelfCall {
        /// Shared node fields.
        node: NodeInfo,
        /// Method name.
        method: String,
        /// Arguments.
        args: Vec<Expr>,
    },
}

impl Expr {
    /// The node info of any expression.
    pub fn node(&self) -> &NodeInfo {
        match self {
            Expr::Int { node, .. }
            | Expr::Bool { node, .. }
            | Expr::Name { node, .. }
            | Expr::SelfAttr { node, .. }
            | Expr::SelfSubscript { node, .. }
            | Expr::EnvAttr { node, .. }
            | Expr::BinOp { node, .. }
            | Expr::Compare { node, .. }
            | Expr::BoolOp { node, .. }
            | Expr::Not { node, .. }
            | Expr::Neg { node, .. }
            | Expr::SelfCall { node, .. } => node,
        }
    }
}

/// First 4 bytes of `keccak256(signature)` as a big-endian integer.
pub fn method_id(signature: &str) -> u32 {
    let digest = Keccak256::digest(signature.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_selectors() {
        // well-known reference values
        assert_eq!(method_id("foo()"), 0xc2985578);
        assert_eq!(method_id("transfer(address,uint256)"), 0xa9059cbb);
    }

    #[test]
    fn signatures() {
        let f = FunctionDef {
            node: NodeInfo::default(),
            name: "transfer".into(),
            args: vec![
                FuncArg {
                    name: "to".into(),
                    typ: VyType::Address,
                },
                FuncArg {
                    name: "amount".into(),
                    typ: VyType::Uint256,
                },
            ],
            returns: Some(VyType::Bool),
            body: vec![],
            visibility: Visibility::External,
            mutability: StateMutability::Nonpayable,
            nonreentrant: false,
        };
        assert_eq!(f.signature(), "transfer(address,uint256)");
        assert_eq!(f.selector(), 0xa9059cbb);
    }

    #[test]
    fn variable_locations() {
        let mut v = VariableDecl {
            node: NodeInfo::default(),
            name: "x".into(),
            typ: VyType::Uint256,
            is_public: false,
            is_constant: false,
            is_immutable: false,
            is_transient: false,
            value: None,
        };
        assert_eq!(v.location(), DataLocation::Storage);
        v.is_transient = true;
        assert_eq!(v.location(), DataLocation::Transient);
        v.is_transient = false;
        v.is_immutable = true;
        assert_eq!(v.location(), DataLocation::Code);
    }

    #[test]
    fn calldata_bounds() {
        assert_eq!(VyType::Bool.calldata_bound(), Some(U256::one()));
        let addr_bound = VyType::Address.calldata_bound().unwrap();
        assert_eq!(addr_bound, (U256::one() << 160) - U256::one());
        assert_eq!(VyType::Uint256.calldata_bound(), None);
    }
}
