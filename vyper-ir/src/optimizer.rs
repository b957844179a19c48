//! Local IR rewrites, run to fixpoint.
//!
//! Every rule preserves observable semantics and strictly shrinks the tree
//! (node count, then depth), so the fixpoint terminates.

use ethereum_types::U256;

use crate::arith::{bool_word, from_signed, signed_lt, to_signed};
use crate::node::{IrNode, IrOp};

/// Rewrite the tree until no rule fires.
pub fn optimize(mut node: IrNode) -> IrNode {
    loop {
        let before = node.size();
        node = optimize_r(node);
        if node.size() == before {
            return node;
        }
    }
}

fn optimize_r(mut node: IrNode) -> IrNode {
    node.args = node.args.into_iter().map(optimize_r).collect();

    let node = flatten_seq(node);
    let node = fold_if(node);
    let node = match fold_constants(&node) {
        Some(value) => replace_value(node, value),
        None => node,
    };
    algebraic(node)
}

// keep provenance when replacing a node with a literal
fn replace_value(node: IrNode, value: U256) -> IrNode {
    let mut out = IrNode::num(value);
    out.typ = node.typ;
    out.src = node.src;
    out
}

fn flatten_seq(mut node: IrNode) -> IrNode {
    if node.op != IrOp::Seq {
        return node;
    }

    if node.args.iter().any(|a| a.op == IrOp::Seq) {
        let mut flat = Vec::with_capacity(node.args.len());
        for arg in node.args {
            if arg.op == IrOp::Seq {
                flat.extend(arg.args);
            } else {
                flat.push(arg);
            }
        }
        node.args = flat;
    }

    // drop no-ops that cannot change the block's value
    let last = node.args.len().saturating_sub(1);
    node.args = node
        .args
        .into_iter()
        .enumerate()
        .filter(|(i, a)| !(a.op == IrOp::Pass && *i != last))
        .map(|(_, a)| a)
        .collect();

    if node.args.len() == 1 {
        return node.args.pop().expect("length checked");
    }
    node
}

fn fold_if(mut node: IrNode) -> IrNode {
    if node.op != IrOp::If {
        return node;
    }
    let Some(cond) = node.args[0].as_num() else {
        return node;
    };

    if !cond.is_zero() {
        node.args.swap_remove(1)
    } else if node.args.len() == 3 {
        node.args.pop().expect("three arms")
    } else {
        IrNode::seq(vec![])
    }
}

fn fold_constants(node: &IrNode) -> Option<U256> {
    use IrOp::*;

    let unary = |f: fn(U256) -> U256| node.args[0].as_num().map(f);
    let binary = |f: &dyn Fn(U256, U256) -> U256| {
        match (node.args.first()?.as_num(), node.args.get(1)?.as_num()) {
            (Some(a), Some(b)) => Some(f(a, b)),
            _ => None,
        }
    };

    match node.op {
        Add => binary(&|a, b| a.overflowing_add(b).0),
        Sub => binary(&|a, b| a.overflowing_sub(b).0),
        Mul => binary(&|a, b| a.overflowing_mul(b).0),
        Div => binary(&|a, b| {
            if b.is_zero() {
                U256::zero()
            } else {
                a / b
            }
        }),
        Mod => binary(&|a, b| {
            if b.is_zero() {
                U256::zero()
            } else {
                a % b
            }
        }),
        Sdiv => binary(&|a, b| {
            if b.is_zero() {
                return U256::zero();
            }
            let (an, am) = to_signed(a);
            let (bn, bm) = to_signed(b);
            from_signed(an != bn, am / bm)
        }),
        Smod => binary(&|a, b| {
            if b.is_zero() {
                return U256::zero();
            }
            let (an, am) = to_signed(a);
            let (_, bm) = to_signed(b);
            from_signed(an, am % bm)
        }),
        Exp => binary(&|a, b| a.overflowing_pow(b).0),
        Lt => binary(&|a, b| bool_word(a < b)),
        Gt => binary(&|a, b| bool_word(a > b)),
        Slt => binary(&|a, b| bool_word(signed_lt(a, b))),
        Sgt => binary(&|a, b| bool_word(signed_lt(b, a))),
        Eq => binary(&|a, b| bool_word(a == b)),
        Ne => binary(&|a, b| bool_word(a != b)),
        Le => binary(&|a, b| bool_word(a <= b)),
        Ge => binary(&|a, b| bool_word(a >= b)),
        Sle => binary(&|a, b| bool_word(!signed_lt(b, a))),
        Sge => binary(&|a, b| bool_word(!signed_lt(a, b))),
        And => binary(&|a, b| a & b),
        Or => binary(&|a, b| a | b),
        Xor => binary(&|a, b| a ^ b),
        Byte => binary(&|i, x| {
            if i >= U256::from(32) {
                U256::zero()
            } else {
                U256::from(x.byte(31 - i.as_usize()))
            }
        }),
        Shl => binary(&|shift, x| {
            if shift >= U256::from(256) {
                U256::zero()
            } else {
                x << shift.as_usize()
            }
        }),
        Shr => binary(&|shift, x| {
            if shift >= U256::from(256) {
                U256::zero()
            } else {
                x >> shift.as_usize()
            }
        }),
        Sar => binary(&|shift, x| {
            let (neg, _) = to_signed(x);
            if shift >= U256::from(256) {
                return if neg { !U256::zero() } else { U256::zero() };
            }
            let shifted = x >> shift.as_usize();
            if neg {
                // sign-extend the vacated bits
                let mask = !(!U256::zero() >> shift.as_usize());
                shifted | mask
            } else {
                shifted
            }
        }),
        Iszero => unary(|a| bool_word(a.is_zero())),
        Not => unary(|a| !a),
        Ceil32 => unary(|a| {
            let rem = a % U256::from(32);
            if rem.is_zero() {
                a
            } else {
                a.overflowing_add(U256::from(32) - rem).0
            }
        }),
        _ => None,
    }
}

fn algebraic(mut node: IrNode) -> IrNode {
    use IrOp::*;

    let lhs_num = node.args.first().and_then(IrNode::as_num);
    let rhs_num = node.args.get(1).and_then(IrNode::as_num);

    match node.op {
        Add | Or | Xor => {
            // x + 0, 0 + x (same for or/xor)
            if rhs_num == Some(U256::zero()) {
                return node.args.swap_remove(0);
            }
            if lhs_num == Some(U256::zero()) {
                return node.args.swap_remove(1);
            }
        }
        Sub | Shl | Shr => {
            if node.op == Sub && rhs_num == Some(U256::zero()) {
                return node.args.swap_remove(0);
            }
            // shift amount is the first argument
            if node.op != Sub && lhs_num == Some(U256::zero()) {
                return node.args.swap_remove(1);
            }
        }
        Mul | Div => {
            if rhs_num == Some(U256::one()) {
                return node.args.swap_remove(0);
            }
            if node.op == Mul && lhs_num == Some(U256::one()) {
                return node.args.swap_remove(1);
            }
            if node.op == Mul
                && (lhs_num == Some(U256::zero()) || rhs_num == Some(U256::zero()))
                && node.args.iter().all(IrNode::is_pure)
            {
                return replace_value(node, U256::zero());
            }
        }
        And => {
            // (and x mask) where x provably fits the mask
            let all_ones = !U256::zero();
            if rhs_num == Some(all_ones) {
                return node.args.swap_remove(0);
            }
            if lhs_num == Some(all_ones) {
                return node.args.swap_remove(1);
            }
            if rhs_num == Some(U256::one()) && node.args[0].is_boolean() {
                return node.args.swap_remove(0);
            }
        }
        Iszero => {
            // (iszero (iszero x)) -> x for 0/1-valued x
            if node.args[0].op == Iszero && node.args[0].args[0].is_boolean() {
                return node.args.swap_remove(0).args.swap_remove(0);
            }
        }
        _ => {}
    }

    node
}
