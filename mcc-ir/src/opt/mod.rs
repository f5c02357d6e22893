//! Linear-IR optimizer
//!
//! Two fixpoint data-flow passes over the CFG: forward constant
//! propagation/folding and backward dead-assignment elimination. The passes
//! alternate at module level until a full cycle changes nothing in either.

pub mod const_fold;
pub mod simplify;

use crate::ir::Module;
use log::debug;

/// Optimize a module in place until both passes reach a fixpoint.
pub fn optimize(module: &mut Module) {
    let mut cycle = 0u32;
    loop {
        cycle += 1;
        let mut changed = false;
        while const_fold::run(module) {
            changed = true;
        }
        while simplify::run(module) {
            changed = true;
        }
        debug!("optimizer cycle {} changed={}", cycle, changed);
        if !changed {
            break;
        }
    }
}
