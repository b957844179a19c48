//! Lowering of the tree IR to a flat assembly-item stream.
//!
//! Stack discipline: the compiler tracks the absolute stack height at every
//! point. A `with` binding owns the stack slot at the height it was pushed;
//! variable reads `DUP` from that depth, `set` writes `SWAP`+`POP` into it.
//! Loop frames occupy two slots (`i`, `limit`); `break`/`continue` pop any
//! extra items their scope pushed before transferring control.

use std::collections::HashSet;

use ethereum_types::U256;

use vyper_asm::{
    push_int, AssemblyItem, EvmVersion, Label,
};

use crate::arith::signed_lt;
use crate::node::{IrNode, IrOp};

/// First scratch word, used by `sha3_32`/`sha3_64`/`codeload`.
pub const FREE_VAR_SPACE: u64 = 0;
/// Second scratch word.
pub const FREE_VAR_SPACE2: u64 = 32;
/// Start of allocatable memory; everything below is compiler scratch.
pub const RESERVED_MEMORY: u64 = 64;

/// Name of the shared failure block each program carries at most once.
pub const REVERT0: &str = "revert0";

/// Deterministic fresh-label supply, seeded at zero per compilation and
/// shared between the deploy and runtime programs.
#[derive(Debug, Default)]
pub struct LabelSupply {
    counter: u64,
}

impl LabelSupply {
    /// A supply starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next fresh label.
    pub fn fresh(&mut self) -> Label {
        self.counter += 1;
        vyper_asm::Label::new(format!("_sym_{}", self.counter))
    }
}

/// Errors raised while lowering IR.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IrError {
    /// A `with` binding is more than 16 slots below the stack top.
    #[error("with statement too deep: {0}")]
    StackTooDeep(String),
    /// Reference to a name with no enclosing `with`.
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),
    /// `break`/`continue`/`cleanup_repeat` outside a loop.
    #[error("loop control op outside a loop")]
    OutsideLoop,
    /// The same IR label was defined twice.
    #[error("label with name {0} already exists")]
    DuplicateLabel(String),
    /// A clamp over two literals that can never hold.
    #[error("clamp always fails: {0}")]
    StaticClampViolation(String),
    /// Anything else that indicates malformed IR.
    #[error("invalid IR: {0}")]
    Invalid(String),
}

#[derive(Debug)]
struct Frame {
    exit: Label,
    latch: Label,
    // stack height just below the loop's [i, limit] frame
    base: usize,
}

struct AsmCompiler<'a> {
    version: EvmVersion,
    supply: &'a mut LabelSupply,
    existing_labels: HashSet<String>,
    revert_used: bool,
}

type Bindings = Vec<(String, usize)>;

/// Lower one program to assembly items, appending the shared failure block
/// iff anything referenced it.
pub fn compile_to_assembly(
    node: &IrNode,
    version: EvmVersion,
    supply: &mut LabelSupply,
) -> Result<Vec<AssemblyItem>, IrError> {
    let mut compiler = AsmCompiler {
        version,
        supply,
        existing_labels: HashSet::new(),
        revert_used: false,
    };
    let mut bindings = Bindings::new();
    let mut frames = Vec::new();
    let mut items = compiler.compile_node(node, &mut bindings, &mut frames, 0)?;

    if compiler.revert_used {
        if !items.last().map_or(false, AssemblyItem::is_terminator) {
            items.push(AssemblyItem::op("STOP"));
        }
        items.push(AssemblyItem::Label(vyper_asm::Label::new(REVERT0)));
        items.extend(push_int(U256::zero(), version));
        items.push(AssemblyItem::op("DUP1"));
        items.push(AssemblyItem::op("REVERT"));
    }

    Ok(items)
}

// error tags only make sense on the instructions that can transfer control
// to a failure block
fn takes_error_tag(mnemonic: &str) -> bool {
    matches!(mnemonic, "JUMP" | "JUMPI" | "REVERT" | "INVALID")
}

impl AsmCompiler<'_> {
    fn compile_node(
        &mut self,
        node: &IrNode,
        bindings: &mut Bindings,
        frames: &mut Vec<Frame>,
        height: usize,
    ) -> Result<Vec<AssemblyItem>, IrError> {
        let mut items = self.compile_r(node, bindings, frames, height)?;

        if node.src.is_some() || node.error_msg.is_some() {
            for item in items.iter_mut() {
                if let AssemblyItem::Op(op) = item {
                    let error_msg = node
                        .error_msg
                        .clone()
                        .filter(|_| takes_error_tag(op));
                    *item = AssemblyItem::Tagged {
                        op: std::mem::take(op),
                        src: node.src,
                        error_msg,
                    };
                }
            }
        }
        Ok(items)
    }

    fn fail_unless_zero(&mut self) -> Vec<AssemblyItem> {
        // shared failure block for the common assert shape
        self.revert_used = true;
        vec![
            AssemblyItem::PushLabel(vyper_asm::Label::new(REVERT0)),
            AssemblyItem::op("JUMPI"),
        ]
    }

    fn compile_r(
        &mut self,
        node: &IrNode,
        bindings: &mut Bindings,
        frames: &mut Vec<Frame>,
        height: usize,
    ) -> Result<Vec<AssemblyItem>, IrError> {
        use IrOp::*;

        // plain EVM ops: children in reverse, then the opcode
        if let Some(mnemonic) = node.op.mnemonic() {
            let mut o = Vec::new();
            for (i, child) in node.args.iter().rev().enumerate() {
                o.extend(self.compile_node(child, bindings, frames, height + i)?);
            }
            o.push(AssemblyItem::op(mnemonic));
            return Ok(o);
        }

        match &node.op {
            Num(value) => Ok(push_int(*value, self.version)),

            Var(name) => {
                let slot = lookup(bindings, name)
                    .ok_or_else(|| IrError::UndefinedVariable(name.clone()))?;
                let depth = height - slot;
                if depth > 16 {
                    return Err(IrError::StackTooDeep(name.clone()));
                }
                Ok(vec![AssemblyItem::op(format!("DUP{depth}"))])
            }

            Symbol(name) => Ok(vec![AssemblyItem::PushLabel(vyper_asm::Label::new(name))]),

            Set => {
                let IrOp::Var(name) = &node.args[0].op else {
                    return Err(IrError::Invalid(
                        "set expects a stack variable target".into(),
                    ));
                };
                let slot = lookup(bindings, name)
                    .ok_or_else(|| IrError::UndefinedVariable(name.clone()))?;
                let mut o =
                    self.compile_node(&node.args[1], bindings, frames, height)?;
                let depth = height + 1 - slot;
                if depth > 16 {
                    return Err(IrError::StackTooDeep(name.clone()));
                }
                o.push(AssemblyItem::op(format!("SWAP{}", depth - 1)));
                o.push(AssemblyItem::op("POP"));
                Ok(o)
            }

            Pass | Dummy => Ok(vec![]),

            Seq => {
                let mut o = Vec::new();
                for (i, child) in node.args.iter().enumerate() {
                    o.extend(self.compile_node(child, bindings, frames, height)?);
                    if child.valency() == 1 && i != node.args.len() - 1 {
                        o.push(AssemblyItem::op("POP"));
                    }
                }
                Ok(o)
            }

            With(name) => {
                let mut o =
                    self.compile_node(&node.args[0], bindings, frames, height)?;
                bindings.push((name.clone(), height));
                let body =
                    self.compile_node(&node.args[1], bindings, frames, height + 1);
                bindings.pop();
                o.extend(body?);

                if node.args[1].valency() == 1 {
                    o.push(AssemblyItem::op("SWAP1"));
                }
                o.push(AssemblyItem::op("POP"));
                Ok(o)
            }

            If => {
                let mut o =
                    self.compile_node(&node.args[0], bindings, frames, height)?;
                o.push(AssemblyItem::op("ISZERO"));
                if node.args.len() == 2 {
                    let end = self.supply.fresh();
                    o.push(AssemblyItem::PushLabel(end.clone()));
                    o.push(AssemblyItem::op("JUMPI"));
                    o.extend(self.compile_node(
                        &node.args[1],
                        bindings,
                        frames,
                        height,
                    )?);
                    o.push(AssemblyItem::Label(end));
                } else {
                    let else_ = self.supply.fresh();
                    let end = self.supply.fresh();
                    o.push(AssemblyItem::PushLabel(else_.clone()));
                    o.push(AssemblyItem::op("JUMPI"));
                    o.extend(self.compile_node(
                        &node.args[1],
                        bindings,
                        frames,
                        height,
                    )?);
                    o.push(AssemblyItem::PushLabel(end.clone()));
                    o.push(AssemblyItem::op("JUMP"));
                    o.push(AssemblyItem::Label(else_));
                    o.extend(self.compile_node(
                        &node.args[2],
                        bindings,
                        frames,
                        height,
                    )?);
                    o.push(AssemblyItem::Label(end));
                }
                Ok(o)
            }

            Repeat(name) => {
                self.compile_repeat(node, name, bindings, frames, height)
            }

            Break => {
                let frame = frames.last().ok_or(IrError::OutsideLoop)?;
                let mut o = pops(height - (frame.base + 2));
                o.push(AssemblyItem::PushLabel(frame.exit.clone()));
                o.push(AssemblyItem::op("JUMP"));
                Ok(o)
            }

            Continue => {
                let frame = frames.last().ok_or(IrError::OutsideLoop)?;
                let mut o = pops(height - (frame.base + 2));
                o.push(AssemblyItem::PushLabel(frame.latch.clone()));
                o.push(AssemblyItem::op("JUMP"));
                Ok(o)
            }

            CleanupRepeat => {
                let frame = frames.last().ok_or(IrError::OutsideLoop)?;
                Ok(pops(height - frame.base))
            }

            ExitRepeater => {
                let frame = frames.first().ok_or(IrError::OutsideLoop)?;
                Ok(pops(height - frame.base))
            }

            Goto(target) => {
                let mut o = Vec::new();
                for (i, child) in node.args.iter().enumerate() {
                    o.extend(self.compile_node(
                        child,
                        bindings,
                        frames,
                        height + i,
                    )?);
                }
                o.push(AssemblyItem::PushLabel(vyper_asm::Label::new(target)));
                o.push(AssemblyItem::op("JUMP"));
                Ok(o)
            }

            Jump => {
                let mut o = Vec::new();
                if let Some(child) = node.args.first() {
                    o.extend(self.compile_node(child, bindings, frames, height)?);
                }
                o.push(AssemblyItem::op("JUMP"));
                Ok(o)
            }

            Label(name) => {
                if !self.existing_labels.insert(name.clone()) {
                    return Err(IrError::DuplicateLabel(name.clone()));
                }
                Ok(vec![AssemblyItem::Label(vyper_asm::Label::new(name))])
            }

            Assert => {
                let mut o =
                    self.compile_node(&node.args[0], bindings, frames, height)?;
                o.push(AssemblyItem::op("ISZERO"));
                o.extend(self.fail_unless_zero());
                Ok(o)
            }

            AssertUnreachable => {
                let mut o =
                    self.compile_node(&node.args[0], bindings, frames, height)?;
                let end = self.supply.fresh();
                o.push(AssemblyItem::PushLabel(end.clone()));
                o.push(AssemblyItem::op("JUMPI"));
                o.push(AssemblyItem::op("INVALID"));
                o.push(AssemblyItem::Label(end));
                Ok(o)
            }

            ClampLt | ClampLe | ClampGt | ClampGe | UclampLt | UclampLe
            | UclampGt | UclampGe => {
                self.compile_clamp2(node, bindings, frames, height)
            }

            Clamp | Uclamp => {
                let signed = node.op == Clamp;
                let (comp_hi, comp_lo) = if signed {
                    ("SGT", "SLT")
                } else {
                    ("GT", "LT")
                };
                let mut o =
                    self.compile_node(&node.args[0], bindings, frames, height)?;
                o.extend(self.compile_node(
                    &node.args[1],
                    bindings,
                    frames,
                    height + 1,
                )?);
                o.push(AssemblyItem::op("DUP1"));
                o.extend(self.compile_node(
                    &node.args[2],
                    bindings,
                    frames,
                    height + 3,
                )?);
                o.push(AssemblyItem::op("SWAP1"));
                o.push(AssemblyItem::op(comp_hi));
                o.extend(self.fail_unless_zero());
                o.push(AssemblyItem::op("DUP1"));
                o.push(AssemblyItem::op("SWAP2"));
                o.push(AssemblyItem::op("SWAP1"));
                o.push(AssemblyItem::op(comp_lo));
                o.extend(self.fail_unless_zero());
                Ok(o)
            }

            ClampNonzero => {
                let mut o =
                    self.compile_node(&node.args[0], bindings, frames, height)?;
                o.push(AssemblyItem::op("DUP1"));
                o.push(AssemblyItem::op("ISZERO"));
                o.extend(self.fail_unless_zero());
                Ok(o)
            }

            Sha3_32 => {
                let mut o =
                    self.compile_node(&node.args[0], bindings, frames, height)?;
                o.extend(push_int(FREE_VAR_SPACE.into(), self.version));
                o.push(AssemblyItem::op("MSTORE"));
                o.extend(push_int(32u64.into(), self.version));
                o.extend(push_int(FREE_VAR_SPACE.into(), self.version));
                o.push(AssemblyItem::op("SHA3"));
                Ok(o)
            }

            Sha3_64 => {
                let mut o =
                    self.compile_node(&node.args[0], bindings, frames, height)?;
                o.extend(self.compile_node(
                    &node.args[1],
                    bindings,
                    frames,
                    height + 1,
                )?);
                o.extend(push_int(FREE_VAR_SPACE2.into(), self.version));
                o.push(AssemblyItem::op("MSTORE"));
                o.extend(push_int(FREE_VAR_SPACE.into(), self.version));
                o.push(AssemblyItem::op("MSTORE"));
                o.extend(push_int(64u64.into(), self.version));
                o.extend(push_int(FREE_VAR_SPACE.into(), self.version));
                o.push(AssemblyItem::op("SHA3"));
                Ok(o)
            }

            Ne => self.compile_via_rewrite(node, IrOp::Eq, bindings, frames, height),
            Le => self.compile_via_rewrite(node, IrOp::Gt, bindings, frames, height),
            Ge => self.compile_via_rewrite(node, IrOp::Lt, bindings, frames, height),
            Sle => self.compile_via_rewrite(node, IrOp::Sgt, bindings, frames, height),
            Sge => self.compile_via_rewrite(node, IrOp::Slt, bindings, frames, height),

            Ceil32 => {
                // x -> (x + 31) - ((x - 1) mod 32)
                let x = || IrNode::var("_ceil32");
                let rewritten = IrNode::with(
                    "_ceil32",
                    node.args[0].clone(),
                    IrNode::new(
                        IrOp::Sub,
                        vec![
                            IrNode::new(
                                IrOp::Add,
                                vec![x(), IrNode::num(31u64)],
                            ),
                            IrNode::new(
                                IrOp::Mod,
                                vec![
                                    IrNode::new(
                                        IrOp::Sub,
                                        vec![x(), IrNode::num(1u64)],
                                    ),
                                    IrNode::num(32u64),
                                ],
                            ),
                        ],
                    ),
                );
                self.compile_node(&rewritten, bindings, frames, height)
            }

            Codeload => {
                let rewritten = IrNode::seq(vec![
                    IrNode::new(
                        IrOp::Codecopy,
                        vec![
                            IrNode::num(FREE_VAR_SPACE),
                            node.args[0].clone(),
                            IrNode::num(32u64),
                        ],
                    ),
                    IrNode::new(IrOp::Mload, vec![IrNode::num(FREE_VAR_SPACE)]),
                ]);
                self.compile_node(&rewritten, bindings, frames, height)
            }

            Deploy(section) => {
                let section = vyper_asm::Label::new(section);
                let mut o = vec![
                    AssemblyItem::PushLabel(vyper_asm::Label::new(vyper_asm::CODE_END)),
                    AssemblyItem::PushLabel(section.clone()),
                    AssemblyItem::op("SUB"),
                    AssemblyItem::op("DUP1"),
                    AssemblyItem::PushLabel(section),
                ];
                o.extend(self.compile_node(
                    &node.args[0],
                    bindings,
                    frames,
                    height + 3,
                )?);
                o.push(AssemblyItem::op("CODECOPY"));
                o.extend(self.compile_node(
                    &node.args[1],
                    bindings,
                    frames,
                    height + 1,
                )?);
                o.push(AssemblyItem::op("ADD"));
                o.extend(self.compile_node(
                    &node.args[0],
                    bindings,
                    frames,
                    height + 1,
                )?);
                o.push(AssemblyItem::op("RETURN"));
                Ok(o)
            }

            op => Err(IrError::Invalid(format!("cannot lower {op:?}"))),
        }
    }

    // (repeat i start rounds bound body)
    fn compile_repeat(
        &mut self,
        node: &IrNode,
        name: &str,
        bindings: &mut Bindings,
        frames: &mut Vec<Frame>,
        height: usize,
    ) -> Result<Vec<AssemblyItem>, IrError> {
        let [start, rounds, bound, body] = &node.args[..] else {
            return Err(IrError::Invalid("repeat expects 4 arguments".into()));
        };
        let bound = bound
            .as_num()
            .ok_or_else(|| IrError::Invalid("repeat bound must be a literal".into()))?;

        let mut o = self.compile_node(start, bindings, frames, height)?;
        o.extend(self.compile_node(rounds, bindings, frames, height + 1)?);

        match rounds.as_num() {
            Some(r) => {
                if r > bound {
                    return Err(IrError::StaticClampViolation(format!(
                        "rounds {r} exceeds bound {bound}"
                    )));
                }
            }
            None => {
                // runtime check: rounds <= bound
                o.extend(push_int(bound, self.version));
                o.push(AssemblyItem::op("DUP2"));
                o.push(AssemblyItem::op("GT"));
                o.extend(self.fail_unless_zero());
            }
        }

        let head = self.supply.fresh();
        let latch = self.supply.fresh();
        let exit = self.supply.fresh();

        // stack: [i, rounds] -> [i, limit]
        o.push(AssemblyItem::op("DUP2"));
        o.push(AssemblyItem::op("ADD"));

        o.push(AssemblyItem::Label(head.clone()));
        o.push(AssemblyItem::op("DUP2"));
        o.push(AssemblyItem::op("DUP2"));
        o.push(AssemblyItem::op("EQ"));
        o.push(AssemblyItem::PushLabel(exit.clone()));
        o.push(AssemblyItem::op("JUMPI"));

        bindings.push((name.to_string(), height));
        frames.push(Frame {
            exit: exit.clone(),
            latch: latch.clone(),
            base: height,
        });
        let body_items = self.compile_node(body, bindings, frames, height + 2);
        frames.pop();
        bindings.pop();
        o.extend(body_items?);

        o.push(AssemblyItem::Label(latch));
        o.push(AssemblyItem::op("SWAP1"));
        o.extend(push_int(U256::one(), self.version));
        o.push(AssemblyItem::op("ADD"));
        o.push(AssemblyItem::op("SWAP1"));
        o.push(AssemblyItem::PushLabel(head));
        o.push(AssemblyItem::op("JUMP"));

        o.push(AssemblyItem::Label(exit));
        o.push(AssemblyItem::op("POP"));
        o.push(AssemblyItem::op("POP"));
        Ok(o)
    }

    // two-operand clamps: evaluate x and the bound, compare, keep x
    fn compile_clamp2(
        &mut self,
        node: &IrNode,
        bindings: &mut Bindings,
        frames: &mut Vec<Frame>,
        height: usize,
    ) -> Result<Vec<AssemblyItem>, IrError> {
        use IrOp::*;

        if let (Some(x), Some(bound)) =
            (node.args[0].as_num(), node.args[1].as_num())
        {
            let holds = match node.op {
                UclampLt => x < bound,
                UclampLe => x <= bound,
                UclampGt => x > bound,
                UclampGe => x >= bound,
                ClampLt => signed_lt(x, bound),
                ClampLe => !signed_lt(bound, x),
                ClampGt => signed_lt(bound, x),
                ClampGe => !signed_lt(x, bound),
                _ => unreachable!("checked by caller"),
            };
            if holds {
                return self.compile_node(&node.args[0], bindings, frames, height);
            }
            return Err(IrError::StaticClampViolation(format!(
                "{:?} with values {x} and {bound}",
                node.op
            )));
        }

        let mut o = self.compile_node(&node.args[0], bindings, frames, height)?;
        o.extend(self.compile_node(&node.args[1], bindings, frames, height + 1)?);
        o.push(AssemblyItem::op("DUP2"));
        let comparison: &[&str] = match node.op {
            UclampLt => &["LT", "ISZERO"],
            ClampLt => &["SLT", "ISZERO"],
            UclampLe => &["GT"],
            ClampLe => &["SGT"],
            UclampGt => &["GT", "ISZERO"],
            ClampGt => &["SGT", "ISZERO"],
            UclampGe => &["LT"],
            ClampGe => &["SLT"],
            _ => unreachable!("checked by caller"),
        };
        // the comparison consumes the duplicate and the bound, leaving the
        // checked value
        o.extend(comparison.iter().map(|op| AssemblyItem::op(*op)));
        o.extend(self.fail_unless_zero());
        Ok(o)
    }

    fn compile_via_rewrite(
        &mut self,
        node: &IrNode,
        inner: IrOp,
        bindings: &mut Bindings,
        frames: &mut Vec<Frame>,
        height: usize,
    ) -> Result<Vec<AssemblyItem>, IrError> {
        let rewritten = IrNode::new(
            IrOp::Iszero,
            vec![IrNode::new(inner, node.args.clone())],
        );
        self.compile_node(&rewritten, bindings, frames, height)
    }
}

fn lookup(bindings: &Bindings, name: &str) -> Option<usize> {
    bindings
        .iter()
        .rev()
        .find(|(n, _)| n == name)
        .map(|&(_, h)| h)
}

fn pops(n: usize) -> Vec<AssemblyItem> {
    (0..n).map(|_| AssemblyItem::op("POP")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vyper_asm::assemble;

    const SHANGHAI: EvmVersion = EvmVersion::Shanghai;

    fn compile(node: &IrNode) -> Vec<AssemblyItem> {
        let mut supply = LabelSupply::new();
        compile_to_assembly(node, SHANGHAI, &mut supply).unwrap()
    }

    fn assemble_ir(node: &IrNode) -> Vec<u8> {
        assemble(&compile(node), SHANGHAI).unwrap().bytecode
    }

    fn mnemonics(items: &[AssemblyItem]) -> Vec<String> {
        items
            .iter()
            .filter_map(|i| i.mnemonic().map(str::to_string))
            .collect()
    }

    #[test]
    fn return_literal() {
        // (seq (mstore 64 42) (return 64 32))
        let node = IrNode::seq(vec![
            IrNode::new(
                IrOp::Mstore,
                vec![IrNode::num(64u64), IrNode::num(42u64)],
            ),
            IrNode::new(
                IrOp::Return,
                vec![IrNode::num(64u64), IrNode::num(32u64)],
            ),
        ]);
        let bytecode = assemble_ir(&node);
        // PUSH1 2a PUSH1 40 MSTORE PUSH1 20 PUSH1 40 RETURN
        assert_eq!(
            bytecode,
            vec![0x60, 0x2a, 0x60, 0x40, 0x52, 0x60, 0x20, 0x60, 0x40, 0xf3]
        );
    }

    #[test]
    fn with_binding_and_read() {
        // (with x 7 (add x x))
        let node = IrNode::with(
            "x",
            IrNode::num(7u64),
            IrNode::new(IrOp::Add, vec![IrNode::var("x"), IrNode::var("x")]),
        );
        let items = compile(&node);
        assert_eq!(
            mnemonics(&items),
            vec!["PUSH1", "DUP1", "DUP2", "ADD", "SWAP1", "POP"]
        );
    }

    #[test]
    fn with_shadowing() {
        // (with x 1 (with x 2 x))
        let node = IrNode::with(
            "x",
            IrNode::num(1u64),
            IrNode::with("x", IrNode::num(2u64), IrNode::var("x")),
        );
        let items = compile(&node);
        // inner read refers to the inner binding: DUP1 right above it
        assert!(mnemonics(&items).contains(&"DUP1".to_string()));
    }

    #[test]
    fn set_writes_back() {
        let node = IrNode::with(
            "x",
            IrNode::num(1u64),
            IrNode::seq(vec![
                IrNode::new(
                    IrOp::Set,
                    vec![IrNode::var("x"), IrNode::num(5u64)],
                ),
                IrNode::var("x"),
            ]),
        );
        let items = compile(&node);
        assert_eq!(
            mnemonics(&items),
            vec![
                "PUSH1", "PUSH1", "SWAP1", "POP", "DUP1", "SWAP1", "POP"
            ]
        );
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let node = IrNode::var("nope");
        let mut supply = LabelSupply::new();
        assert_eq!(
            compile_to_assembly(&node, SHANGHAI, &mut supply).unwrap_err(),
            IrError::UndefinedVariable("nope".into())
        );
    }

    #[test]
    fn assert_routes_to_shared_revert_block() {
        let node = IrNode::seq(vec![
            IrNode::new(
                IrOp::Assert,
                vec![IrNode::new(
                    IrOp::Iszero,
                    vec![IrNode::new(
                        IrOp::Calldataload,
                        vec![IrNode::num(0u64)],
                    )],
                )],
            )
            .with_error_msg("safediv"),
            IrNode::new(IrOp::Stop, vec![]),
        ]);
        let items = compile(&node);
        let revert_label = vyper_asm::Label::new(REVERT0);
        // exactly one shared block
        let block_defs = items
            .iter()
            .filter(|i| **i == AssemblyItem::Label(revert_label.clone()))
            .count();
        assert_eq!(block_defs, 1);

        // the failure jump carries the error tag
        let tagged: Vec<_> = items
            .iter()
            .filter_map(|i| match i {
                AssemblyItem::Tagged {
                    op,
                    error_msg: Some(msg),
                    ..
                } => Some((op.clone(), msg.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(tagged, vec![("JUMPI".to_string(), "safediv".to_string())]);

        let program = assemble(&items, SHANGHAI).unwrap();
        let errors: Vec<_> =
            program.source_map.error_map.values().cloned().collect();
        assert_eq!(errors, vec!["safediv".to_string()]);
    }

    #[test]
    fn revert_block_absent_when_unused() {
        let node = IrNode::new(IrOp::Stop, vec![]);
        let items = compile(&node);
        assert!(!items.contains(&AssemblyItem::Label(vyper_asm::Label::new(REVERT0))));
    }

    #[test]
    fn clamp_static_checks() {
        // uclamplt(1, 5) is statically fine and reduces to its operand
        let node = IrNode::new(
            IrOp::UclampLt,
            vec![IrNode::num(1u64), IrNode::num(5u64)],
        );
        let items = compile(&node);
        assert_eq!(mnemonics(&items), vec!["PUSH1"]);

        // uclamplt(5, 5) can never hold
        let node = IrNode::new(
            IrOp::UclampLt,
            vec![IrNode::num(5u64), IrNode::num(5u64)],
        );
        let mut supply = LabelSupply::new();
        assert!(matches!(
            compile_to_assembly(&node, SHANGHAI, &mut supply),
            Err(IrError::StaticClampViolation(_))
        ));
    }

    #[test]
    fn dynamic_clamp_keeps_value() {
        // uclample(calldataload(4), 100): value survives on the stack
        let node = IrNode::new(
            IrOp::UclampLe,
            vec![
                IrNode::new(IrOp::Calldataload, vec![IrNode::num(4u64)]),
                IrNode::num(100u64),
            ],
        );
        assert_eq!(node.valency(), 1);
        let items = compile(&node);
        let ops = mnemonics(&items);
        assert!(ops.contains(&"GT".to_string()));
        assert!(ops.ends_with(&[
            "JUMPI".to_string(),
            "STOP".to_string(),
            "PUSH0".to_string(),
            "DUP1".to_string(),
            "REVERT".to_string()
        ]));
    }

    #[test]
    fn repeat_loops_and_breaks() {
        // (repeat i 0 10 10 (seq (if (eq i 5) break) pass))
        let body = IrNode::seq(vec![
            IrNode::new(
                IrOp::If,
                vec![
                    IrNode::new(
                        IrOp::Eq,
                        vec![IrNode::var("i"), IrNode::num(5u64)],
                    ),
                    IrNode::new(IrOp::Break, vec![]),
                ],
            ),
            IrNode::new(IrOp::Pass, vec![]),
        ]);
        let node = IrNode::new(
            IrOp::Repeat("i".into()),
            vec![
                IrNode::num(0u64),
                IrNode::num(10u64),
                IrNode::num(10u64),
                body,
            ],
        );
        let items = compile(&node);
        let ops = mnemonics(&items);
        // loop scaffolding: head test and latch increment both present
        assert!(ops.contains(&"EQ".to_string()));
        assert!(ops.iter().filter(|op| *op == "JUMP").count() >= 2);
        // frame is dropped at exit
        let tail: Vec<&str> =
            ops.iter().rev().take(2).map(String::as_str).collect();
        assert_eq!(tail, ["POP", "POP"]);
        // and the whole thing assembles with resolved labels
        assert!(assemble(&items, SHANGHAI).is_ok());
    }

    #[test]
    fn repeat_bound_violation_is_static_error() {
        let node = IrNode::new(
            IrOp::Repeat("i".into()),
            vec![
                IrNode::num(0u64),
                IrNode::num(11u64),
                IrNode::num(10u64),
                IrNode::new(IrOp::Pass, vec![]),
            ],
        );
        let mut supply = LabelSupply::new();
        assert!(matches!(
            compile_to_assembly(&node, SHANGHAI, &mut supply),
            Err(IrError::StaticClampViolation(_))
        ));
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let node = IrNode::new(IrOp::Break, vec![]);
        let mut supply = LabelSupply::new();
        assert_eq!(
            compile_to_assembly(&node, SHANGHAI, &mut supply).unwrap_err(),
            IrError::OutsideLoop
        );
    }

    #[test]
    fn duplicate_ir_label_rejected() {
        let node = IrNode::seq(vec![
            IrNode::label("twice"),
            IrNode::label("twice"),
        ]);
        let mut supply = LabelSupply::new();
        assert_eq!(
            compile_to_assembly(&node, SHANGHAI, &mut supply).unwrap_err(),
            IrError::DuplicateLabel("twice".into())
        );
    }

    #[test]
    fn goto_pushes_arguments_then_jumps() {
        let node = IrNode::seq(vec![
            IrNode::new(
                IrOp::Goto("internal_foo".into()),
                vec![IrNode::symbol("ret")],
            ),
            IrNode::label("ret"),
            IrNode::new(IrOp::Stop, vec![]),
            IrNode::label("internal_foo"),
            IrNode::new(IrOp::Jump, vec![]),
        ]);
        let items = compile(&node);
        let program = assemble(&items, SHANGHAI).unwrap();
        // the goto into internal_foo classifies as an "i" jump
        assert!(program
            .source_map
            .pc_jump_map
            .values()
            .any(|j| *j == vyper_asm::JumpType::In));
    }

    #[test]
    fn seq_pops_intermediate_values() {
        let node = IrNode::seq(vec![
            IrNode::num(1u64),
            IrNode::num(2u64),
        ]);
        let items = compile(&node);
        assert_eq!(mnemonics(&items), vec!["PUSH1", "POP", "PUSH1"]);
    }

    #[test]
    fn sha3_64_uses_scratch_memory() {
        let node = IrNode::new(
            IrOp::Sha3_64,
            vec![IrNode::num(1u64), IrNode::num(2u64)],
        );
        let bytecode = assemble_ir(&node);
        // PUSH1 1, PUSH1 2, PUSH1 32 MSTORE, PUSH0 MSTORE, PUSH1 64, PUSH0, SHA3
        assert_eq!(
            bytecode,
            vec![
                0x60, 0x01, 0x60, 0x02, 0x60, 0x20, 0x52, 0x5f, 0x52, 0x60,
                0x40, 0x5f, 0x20
            ]
        );
    }

    #[test]
    fn deploy_copies_and_returns_runtime() {
        let runtime = vec![0xaa, 0xbb, 0xcc];
        let mut items = compile(&IrNode::new(
            IrOp::Deploy("runtime_code".into()),
            vec![IrNode::num(0u64), IrNode::num(0u64)],
        ));
        items.push(AssemblyItem::DataHeader(vyper_asm::Label::new("runtime_code")));
        items.push(AssemblyItem::Data(vyper_asm::DataItem::Bytes(
            runtime.clone(),
        )));
        let program = assemble(&items, SHANGHAI).unwrap();
        assert!(program.bytecode.ends_with(&runtime));

        let section = program
            .symbol_map
            .label(&vyper_asm::Label::new("runtime_code"))
            .unwrap();
        let end = program
            .symbol_map
            .label(&vyper_asm::Label::new(vyper_asm::CODE_END))
            .unwrap();
        assert_eq!(end - section, runtime.len());
    }

    #[test]
    fn stack_too_deep_detection() {
        // bury the outer binding under 17 nested bindings; reading it
        // would need DUP18
        let mut body: IrNode = IrNode::var("x");
        for k in 0..17 {
            body = IrNode::with(format!("y{k}"), IrNode::num(0u64), body);
        }
        let node = IrNode::with("x", IrNode::num(1u64), body);
        let mut supply = LabelSupply::new();
        assert_eq!(
            compile_to_assembly(&node, SHANGHAI, &mut supply).unwrap_err(),
            IrError::StackTooDeep("x".into())
        );
    }
}
