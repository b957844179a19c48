//! Tree-structured EVM IR: the closed node model, a fixpoint local
//! optimizer, and the lowering pass that turns IR into symbolic assembly.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod arith;
mod compile;
mod node;
mod optimizer;

pub use compile::{
    compile_to_assembly, IrError, LabelSupply, FREE_VAR_SPACE,
    FREE_VAR_SPACE2, RESERVED_MEMORY, REVERT0,
};
pub use node::{Arity, IrNode, IrOp, IrStructureError, IrType, Location};
pub use optimizer::optimize;
