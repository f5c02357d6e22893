//! Dead-assignment elimination
//!
//! Backward liveness over the CFG, then a reverse walk through each block
//! deleting assignments to named locals that nothing downstream reads.
//! Temporaries and globals are left alone: a temp always has exactly one
//! nearby use (or its producer gets deleted along with the use in a later
//! pass cycle), and a global is observable after the function returns.
//! Calls and stores are never deleted regardless of their result's
//! liveness.

use crate::ir::{BlockId, Function, Inst, Module, VarId, Variable};
use log::debug;
use std::collections::{BTreeSet, HashMap};

type VarSet = BTreeSet<VarId>;

/// Run one elimination pass over the whole module. Returns true when any
/// instruction was deleted.
pub fn run(module: &mut Module) -> bool {
    let vars = &module.vars;
    let mut changed = false;
    for func in module.funcs.iter_mut() {
        changed |= run_on_function(vars, func);
    }
    changed
}

fn run_on_function(vars: &[Variable], func: &mut Function) -> bool {
    let mut gen: HashMap<BlockId, VarSet> = HashMap::new();
    let mut kill: HashMap<BlockId, VarSet> = HashMap::new();
    for &b in &func.layout {
        let mut g = VarSet::new();
        let mut k = VarSet::new();
        for inst in &func.block(b).insts {
            for u in inst.uses() {
                if !k.contains(&u) {
                    g.insert(u);
                }
            }
            if let Some(d) = inst.def() {
                k.insert(d);
            }
        }
        gen.insert(b, g);
        kill.insert(b, k);
    }

    let mut live_in: HashMap<BlockId, VarSet> = HashMap::new();
    let mut live_out: HashMap<BlockId, VarSet> = HashMap::new();
    let mut worklist: BTreeSet<BlockId> = func.layout.iter().copied().collect();
    while let Some(b) = worklist.pop_first() {
        let mut out = VarSet::new();
        for s in func.succs(b) {
            if let Some(succ_in) = live_in.get(&s) {
                out.extend(succ_in.iter().copied());
            }
        }
        live_out.insert(b, out.clone());
        let mut inp = &out - &kill[&b];
        inp.extend(gen[&b].iter().copied());
        if live_in.get(&b) != Some(&inp) {
            live_in.insert(b, inp);
            for p in func.preds(b) {
                worklist.insert(p);
            }
        }
    }

    let mut deleted = 0usize;
    for b in func.layout.clone() {
        let mut live = live_out.remove(&b).unwrap_or_default();
        let insts = &mut func.block_mut(b).insts;
        for i in (0..insts.len()).rev() {
            let dst = match insts[i] {
                Inst::Binary { dst, .. }
                | Inst::Unary { dst, .. }
                | Inst::Move { dst, .. }
                | Inst::Load { dst, .. } => Some(dst),
                _ => None,
            };
            if let Some(dst) = dst {
                if vars[dst as usize].is_named_local() && !live.contains(&dst) {
                    insts.remove(i);
                    deleted += 1;
                    continue;
                }
            }
            if let Some(d) = insts[i].def() {
                live.remove(&d);
            }
            live.extend(insts[i].uses());
        }
    }
    if deleted > 0 {
        debug!("deleted {} dead assignments in f_{}", deleted, func.name);
    }
    deleted > 0
}
