//! Backward liveness over the register IR
//!
//! Per block: `gen` holds the virtual registers read before any
//! redefinition inside the block, `kill` the ones defined. The global
//! fixpoint sweeps all blocks until no live-in set changes; live-out is
//! the union of the successors' live-in. Runs strictly before register
//! allocation and independently per function.

use crate::rir::{Function, Module, VReg};
use log::debug;
use std::collections::BTreeSet;

pub fn analyze(module: &mut Module) {
    for func in &mut module.funcs {
        analyze_function(func);
    }
}

fn analyze_function(func: &mut Function) {
    for blk in &mut func.blocks {
        let mut gen: BTreeSet<VReg> = BTreeSet::new();
        let mut kill: BTreeSet<VReg> = BTreeSet::new();
        for op in &blk.ops {
            for use_ in op.uses() {
                if !kill.contains(&use_) {
                    gen.insert(use_);
                }
            }
            if let Some(def) = op.def() {
                kill.insert(def);
            }
        }
        blk.live_gen = gen;
        blk.live_kill = kill;
        blk.live_in.clear();
        blk.live_out.clear();
    }

    let mut rounds = 0u32;
    loop {
        rounds += 1;
        let mut stable = true;
        for b in 0..func.blocks.len() {
            let mut out = func.blocks[b].live_out.clone();
            for s in func.succs(b as u32) {
                out.extend(func.block(s).live_in.iter().copied());
            }
            let blk = &mut func.blocks[b];
            blk.live_out = out.clone();
            let mut inp: BTreeSet<VReg> = &out - &blk.live_kill;
            inp.extend(blk.live_gen.iter().copied());
            if inp != blk.live_in {
                blk.live_in = inp;
                stable = false;
            }
        }
        if stable {
            break;
        }
    }
    debug!("liveness for f_{} converged after {} rounds", func.name, rounds);
}
