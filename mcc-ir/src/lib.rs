//! MiniC Compiler - Linear IR, Builder and Optimizer
//!
//! This crate defines the first intermediate representation: a three-address
//! control-flow graph over an unbounded set of named and temporary
//! variables, close to the source tree's structure. It also hosts the
//! AST-to-IR builder and the two fixpoint optimization passes that run on
//! the linear IR before register lowering.

pub mod build;
pub mod dump;
pub mod ir;
pub mod opt;

pub use build::build_module;
pub use ir::{
    BasicBlock, BinOp, BlockId, CondOp, FuncId, Function, Inst, Label, Module, Operand, UnOp,
    VarId, VarKind, Variable,
};
pub use opt::optimize;
