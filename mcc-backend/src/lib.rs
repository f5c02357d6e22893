//! MiniC Compiler - Register IR, Allocation and RISC-V Emission
//!
//! The back half of the pipeline: lowering the optimized linear IR onto a
//! register IR with calling-convention pseudo-ops, per-block liveness,
//! greedy register allocation with spilling, and textual RISC-V assembly
//! output.

pub mod emit;
pub mod liveness;
pub mod lower;
pub mod regalloc;
pub mod rir;

pub use regalloc::{EvictionPolicy, LowestIndex};
pub use rir::{BasicBlock, Function, Global, Module, Op, Opr, VReg};

use log::debug;
use mcc_common::{CompileResult, Program};

/// Compile a checked program to RISC-V assembly text.
///
/// Runs the whole middle/back end: IR construction, the optimization
/// fixpoint, register lowering, liveness, allocation and emission.
pub fn compile(program: &Program) -> CompileResult<String> {
    let mut linear = mcc_ir::build_module(program)?;
    mcc_ir::optimize(&mut linear);
    debug!("optimized linear IR:\n{}", linear);

    let mut module = lower::lower_module(&linear)?;
    debug!("register IR before allocation:\n{}", module);

    liveness::analyze(&mut module);
    regalloc::allocate(&mut module)?;
    debug!("register IR after allocation:\n{}", module);

    emit::emit_module(&module)
}
