//! Greedy register allocation
//!
//! A single deterministic forward pass per function, block by block in
//! layout order. Within a block the allocator threads a binding state
//! (virtual register to physical registers, plus the set of virtual
//! registers with a valid stack copy) through every operation, evicting and
//! spilling on demand. The state is NOT carried across block boundaries:
//! every virtual register in a block's live-out set is flushed to its frame
//! slot at the block end, and the next block starts from its live-in set
//! with empty bindings. Calling-convention pseudo-ops are resolved here and
//! removed; a synthesized exit block holds the one copy of the epilogue,
//! and every `set-return` jumps to it.

use crate::rir::{BlockId, Function, Global, Label, Module, Op, Opr, VReg};
use log::{debug, trace};
use mcc_codegen::{Reg, ALLOCATABLE, CALLER_SAVED};
use mcc_common::{CompileResult, CompilerError};
use std::collections::{BTreeSet, HashMap};

/// Tie-break among evictable registers. Every candidate handed to `pick`
/// is occupied but safe to evict for the current operation.
pub trait EvictionPolicy {
    fn pick(&mut self, candidates: &[Reg]) -> Reg;
}

/// Default policy: the lowest-indexed eligible register. Deterministic, so
/// golden tests reproduce.
pub struct LowestIndex;

impl EvictionPolicy for LowestIndex {
    fn pick(&mut self, candidates: &[Reg]) -> Reg {
        candidates[0]
    }
}

/// Allocate every function in the module with the default eviction policy.
pub fn allocate(module: &mut Module) -> CompileResult<()> {
    allocate_with(module, &mut LowestIndex)
}

pub fn allocate_with(
    module: &mut Module,
    policy: &mut dyn EvictionPolicy,
) -> CompileResult<()> {
    let globals = module.globals.clone();
    for fi in 0..module.funcs.len() {
        let exit_label = module.alloc_label();
        run_on_function(&mut module.funcs[fi], exit_label, &globals, policy)?;
    }
    Ok(())
}

fn run_on_function(
    func: &mut Function,
    exit_label: Label,
    globals: &[Global],
    policy: &mut dyn EvictionPolicy,
) -> CompileResult<()> {
    debug!("allocating f_{}", func.name);
    let nblocks = func.blocks.len() as BlockId;
    let exit = func.add_block(exit_label);
    let mut st = AllocState {
        policy,
        globals,
        exit,
        frame: func.frame_size,
        taint: BTreeSet::new(),
        vr2slt: HashMap::new(),
        vr2pr: HashMap::new(),
        pr2vr: HashMap::new(),
        in_frame: BTreeSet::new(),
        live: BTreeSet::new(),
        out: Vec::new(),
        exit_jump: false,
    };

    for b in 0..nblocks {
        // fresh bindings; everything live into the block is stack-resident
        // thanks to the predecessors' block-end flushes
        st.vr2pr.clear();
        st.pr2vr.clear();
        st.in_frame = func.block(b).live_in.clone();

        let ops = std::mem::take(&mut func.block_mut(b).ops);
        // live-before set per incoming operation; operations the allocator
        // inserts never consult liveness
        let mut live_before = vec![BTreeSet::new(); ops.len()];
        let mut cur = func.block(b).live_out.clone();
        for (i, op) in ops.iter().enumerate().rev() {
            if let Some(def) = op.def() {
                cur.remove(&def);
            }
            cur.extend(op.uses());
            live_before[i] = cur.clone();
        }

        for (i, op) in ops.into_iter().enumerate() {
            st.live = std::mem::take(&mut live_before[i]);
            st.run_op(op)?;
        }
        let live_out = func.block(b).live_out.clone();
        st.flush_block_end(&live_out)?;
        func.block_mut(b).ops = std::mem::take(&mut st.out);
        if std::mem::take(&mut st.exit_jump) {
            func.jump(b, exit);
        }
    }

    // the last laid-out block reaches the exit by fall-through unless it
    // already jumps there
    let end = nblocks - 1;
    if func.block(end).fall_out.is_some() {
        return Err(CompilerError::internal(format!(
            "f_{} ends in a fall-through block",
            func.name
        )));
    }
    if func.block(end).jump_out.is_none() {
        func.fall(end, exit);
    }

    // save every written callee-saved register at entry, restore at exit
    let mut saves = Vec::new();
    let mut restores = Vec::new();
    for &pr in &st.taint {
        if pr.is_callee_saved() {
            let slot = st.frame;
            st.frame += 1;
            saves.push(Op::Store { src: Opr::Phys(pr), slot });
            restores.push(Op::Load { src: Opr::Slot(slot), dst: Opr::Phys(pr) });
        }
    }
    let entry_ops = &mut func.block_mut(0).ops;
    saves.append(entry_ops);
    *entry_ops = saves;
    let exit_blk = func.block_mut(exit);
    exit_blk.ops = restores;
    exit_blk.ops.push(Op::Ret);
    func.frame_size = st.frame;
    Ok(())
}

struct AllocState<'a> {
    policy: &'a mut dyn EvictionPolicy,
    globals: &'a [Global],
    exit: BlockId,
    frame: u32,
    /// Physical registers written at least once in this function.
    taint: BTreeSet<Reg>,
    /// Frame slot per spilled virtual register, function-wide.
    vr2slt: HashMap<VReg, u32>,
    vr2pr: HashMap<VReg, BTreeSet<Reg>>,
    pr2vr: HashMap<Reg, BTreeSet<VReg>>,
    /// Virtual registers whose frame slot currently holds their value.
    in_frame: BTreeSet<VReg>,
    /// Live-before set of the operation being processed.
    live: BTreeSet<VReg>,
    out: Vec<Op>,
    exit_jump: bool,
}

impl AllocState<'_> {
    fn run_op(&mut self, op: Op) -> CompileResult<()> {
        trace!("allocating for {:?}", op);
        match op {
            // a register-to-register move is a pure rebind, no code
            Op::Mov { dst: Opr::Virt(r1), src: Opr::Virt(r2) } => self.rebind_mov(r1, r2),
            Op::BeginParams => {
                for pr in CALLER_SAVED {
                    self.unlink_reg(pr);
                }
                Ok(())
            }
            Op::SetParam { src, index } => {
                let ai = arg_reg(index)?;
                self.unlink_reg(ai);
                self.move_to_phys(src, ai)
            }
            Op::GetParam { index, dst } => {
                let ai = arg_reg(index)?;
                self.link(expect_virt(dst)?, ai);
                Ok(())
            }
            Op::GetRet { dst } => {
                let vr = expect_virt(dst)?;
                self.unlink_vr(vr);
                self.link(vr, Reg::A0);
                Ok(())
            }
            Op::SetRet { src } => {
                self.unlink_reg(Reg::A0);
                self.move_to_phys(src, Reg::A0)?;
                self.out.push(Op::Jump { target: self.exit });
                self.exit_jump = true;
                Ok(())
            }
            mut other => {
                self.alloc_regs_for(&mut other)?;
                self.out.push(other);
                Ok(())
            }
        }
    }

    fn link(&mut self, vr: VReg, pr: Reg) {
        self.vr2pr.entry(vr).or_default().insert(pr);
        self.pr2vr.entry(pr).or_default().insert(vr);
    }

    /// Detach `vr` from every physical register and invalidate its stack
    /// copy (it is about to be redefined).
    fn unlink_vr(&mut self, vr: VReg) {
        self.in_frame.remove(&vr);
        for pr in self.vr2pr.remove(&vr).unwrap_or_default() {
            if let Some(vrs) = self.pr2vr.get_mut(&pr) {
                vrs.remove(&vr);
            }
        }
    }

    /// Evict every virtual register bound to `pr`, spilling any that loses
    /// its last physical copy while still live.
    fn unlink_reg(&mut self, pr: Reg) {
        for vr in self.pr2vr.remove(&pr).unwrap_or_default() {
            if let Some(prs) = self.vr2pr.get_mut(&vr) {
                prs.remove(&pr);
                if prs.is_empty() {
                    self.spill(vr, pr);
                }
            }
        }
    }

    fn spill(&mut self, vr: VReg, pr: Reg) {
        if !self.in_frame.contains(&vr) && self.live.contains(&vr) {
            let slot = self.slot_of(vr);
            self.out.push(Op::Store { src: Opr::Phys(pr), slot });
            self.in_frame.insert(vr);
        }
    }

    fn slot_of(&mut self, vr: VReg) -> u32 {
        if let Some(&slot) = self.vr2slt.get(&vr) {
            return slot;
        }
        let slot = self.frame;
        self.frame += 1;
        self.vr2slt.insert(vr, slot);
        slot
    }

    fn in_phys(&self, vr: VReg) -> bool {
        self.vr2pr.get(&vr).is_some_and(|s| !s.is_empty())
    }

    fn phys_of(&self, vr: VReg) -> CompileResult<Reg> {
        self.vr2pr
            .get(&vr)
            .and_then(|s| s.iter().next().copied())
            .ok_or_else(|| {
                CompilerError::internal(format!("r{} has no physical register", vr))
            })
    }

    fn occupied(&self, pr: Reg) -> bool {
        self.pr2vr
            .get(&pr)
            .is_some_and(|vrs| vrs.iter().any(|vr| self.live.contains(vr)))
    }

    /// A physical register safe to take for this operation: a free one if
    /// any exists, else an occupied one holding none of `avoid` (the
    /// operation's own operands), tie broken by the policy.
    fn find_phys_beyond(&mut self, avoid: &BTreeSet<VReg>) -> CompileResult<Reg> {
        let mut candidates = Vec::new();
        for pr in ALLOCATABLE {
            if !self.occupied(pr) {
                return Ok(pr);
            }
            let clash = self
                .pr2vr
                .get(&pr)
                .is_some_and(|vrs| vrs.iter().any(|vr| avoid.contains(vr)));
            if !clash {
                candidates.push(pr);
            }
        }
        if candidates.is_empty() {
            // cannot happen: an operation touches at most three registers
            return Err(CompilerError::internal("no evictable register"));
        }
        Ok(self.policy.pick(&candidates))
    }

    fn alloc_regs_for(&mut self, op: &mut Op) -> CompileResult<()> {
        let uses = op.uses();
        let def = op.def();
        for &vr in &uses {
            if self.in_phys(vr) {
                let pr = self.phys_of(vr)?;
                op.rewrite(vr, pr);
            } else {
                if !self.in_frame.contains(&vr) {
                    return Err(CompilerError::internal(format!(
                        "r{} used with no register and no stack copy",
                        vr
                    )));
                }
                let pr = self.find_phys_beyond(&uses)?;
                let slot = self.slot_of(vr);
                self.unlink_reg(pr);
                self.out.push(Op::Load { src: Opr::Slot(slot), dst: Opr::Phys(pr) });
                self.taint.insert(pr);
                self.link(vr, pr);
                op.rewrite(vr, pr);
            }
        }
        if let Some(vr) = def {
            let pr = if self.in_phys(vr) {
                self.phys_of(vr)?
            } else {
                self.find_phys_beyond(&BTreeSet::from([vr]))?
            };
            self.unlink_vr(vr);
            self.unlink_reg(pr);
            self.link(vr, pr);
            op.rewrite(vr, pr);
            self.taint.insert(pr);
        }
        Ok(())
    }

    fn rebind_mov(&mut self, dst: VReg, src: VReg) -> CompileResult<()> {
        if self.in_phys(src) {
            let p2 = self.phys_of(src)?;
            if !(self.in_phys(dst) && self.phys_of(dst)? == p2) {
                self.unlink_vr(dst);
                self.link(dst, p2);
            }
        } else {
            if !self.in_frame.contains(&src) {
                return Err(CompilerError::internal(format!(
                    "move source r{} has no register and no stack copy",
                    src
                )));
            }
            let p2 = self.find_phys_beyond(&BTreeSet::from([src]))?;
            let slot = self.slot_of(src);
            self.unlink_reg(p2);
            self.out.push(Op::Load { src: Opr::Slot(slot), dst: Opr::Phys(p2) });
            self.taint.insert(p2);
            self.link(src, p2);
            self.unlink_vr(dst);
            self.link(dst, p2);
        }
        Ok(())
    }

    /// Materialize `src` into the fixed register `ai` (argument passing and
    /// return values).
    fn move_to_phys(&mut self, src: Opr, ai: Reg) -> CompileResult<()> {
        self.taint.insert(ai);
        match src {
            Opr::Virt(vr) => {
                if self.in_phys(vr) {
                    let pr = self.phys_of(vr)?;
                    self.out.push(Op::Mov { dst: Opr::Phys(ai), src: Opr::Phys(pr) });
                } else if self.in_frame.contains(&vr) {
                    let slot = self.slot_of(vr);
                    self.out.push(Op::Load { src: Opr::Slot(slot), dst: Opr::Phys(ai) });
                } else {
                    return Err(CompilerError::internal(format!(
                        "r{} has no register and no stack copy",
                        vr
                    )));
                }
            }
            Opr::Imm(v) => {
                self.out.push(Op::Mov { dst: Opr::Phys(ai), src: Opr::Imm(v) });
            }
            Opr::Global(g) => {
                // an array global is passed by address, a scalar by value
                let op = if self.globals[g as usize].width > 0 {
                    Op::LoadAddr { src: Opr::Global(g), dst: Opr::Phys(ai) }
                } else {
                    Op::Load { src: Opr::Global(g), dst: Opr::Phys(ai) }
                };
                self.out.push(op);
            }
            Opr::Slot(s) => {
                self.out.push(Op::LoadAddr { src: Opr::Slot(s), dst: Opr::Phys(ai) });
            }
            Opr::Phys(_) => {
                return Err(CompilerError::internal(
                    "physical register reached a calling-convention pseudo-op",
                ));
            }
        }
        Ok(())
    }

    /// Store every live-out virtual register without a valid stack copy,
    /// keeping any trailing jump/branch last.
    fn flush_block_end(&mut self, live_out: &BTreeSet<VReg>) -> CompileResult<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        if matches!(self.out.last(), Some(Op::Jump { target }) if *target == self.exit) {
            return Ok(());
        }
        let mut stores = Vec::new();
        for &vr in live_out {
            if !self.in_frame.contains(&vr) {
                let pr = self.phys_of(vr)?;
                let slot = self.slot_of(vr);
                stores.push(Op::Store { src: Opr::Phys(pr), slot });
            }
        }
        if stores.is_empty() {
            return Ok(());
        }
        let at = match self.out.last() {
            Some(Op::Jump { .. } | Op::Branch { .. }) => self.out.len() - 1,
            _ => self.out.len(),
        };
        self.out.splice(at..at, stores);
        Ok(())
    }
}

fn arg_reg(index: u32) -> CompileResult<Reg> {
    Reg::arg(index)
        .ok_or_else(|| CompilerError::internal(format!("argument index {} out of range", index)))
}

fn expect_virt(opr: Opr) -> CompileResult<VReg> {
    opr.as_virt()
        .ok_or_else(|| CompilerError::internal(format!("expected virtual register, got {}", opr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness;
    use crate::lower::lower_module;
    use mcc_common::{BinOp as AstBinOp, Decl, Expr, FuncDef, Param, Stmt, Type};
    use mcc_ir::build_module;
    use pretty_assertions::assert_eq;

    fn compile_to_rir(program: Vec<Decl>) -> Module {
        let linear = build_module(&program).unwrap();
        let mut module = lower_module(&linear).unwrap();
        liveness::analyze(&mut module);
        allocate(&mut module).unwrap();
        module
    }

    fn int_func(name: &str, params: Vec<&str>, body: Vec<Stmt>) -> Decl {
        Decl::Func(FuncDef {
            name: name.into(),
            ret: Type::Int,
            params: params
                .into_iter()
                .map(|p| Param { name: p.into(), ty: Type::Int })
                .collect(),
            body,
        })
    }

    fn assert_no_virtual_operands(module: &Module) {
        for func in &module.funcs {
            for blk in &func.blocks {
                for op in &blk.ops {
                    for opr in op.oprs() {
                        assert!(
                            !matches!(opr, Opr::Virt(_)),
                            "unresolved {:?} in f_{}",
                            op,
                            func.name
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn simple_function_allocates_fully() {
        let module = compile_to_rir(vec![int_func(
            "add",
            vec!["a", "b"],
            vec![Stmt::Return(Expr::binary(
                AstBinOp::Add,
                Expr::var("a"),
                Expr::var("b"),
            ))],
        )]);
        assert_no_virtual_operands(&module);
        let func = &module.funcs[0];
        // the synthesized exit block comes last and returns exactly once
        let exit = func.blocks.last().unwrap();
        assert_eq!(exit.ops.last(), Some(&Op::Ret));
        assert_eq!(
            func.blocks
                .iter()
                .flat_map(|b| &b.ops)
                .filter(|op| matches!(op, Op::Ret))
                .count(),
            1
        );
    }

    #[test]
    fn callee_saved_registers_are_saved_and_restored() {
        let module = compile_to_rir(vec![int_func(
            "add",
            vec!["a", "b"],
            vec![Stmt::Return(Expr::binary(
                AstBinOp::Add,
                Expr::var("a"),
                Expr::var("b"),
            ))],
        )]);
        let func = &module.funcs[0];
        // the default policy hands the result s0, which must be bracketed
        let entry = &func.blocks[0];
        let Some(Op::Store { src: Opr::Phys(saved), slot }) = entry.ops.first() else {
            panic!("entry must start with a callee-saved save");
        };
        assert!(saved.is_callee_saved());
        let exit = func.blocks.last().unwrap();
        assert_eq!(
            exit.ops.first(),
            Some(&Op::Load { src: Opr::Slot(*slot), dst: Opr::Phys(*saved) })
        );
    }

    #[test]
    fn both_returns_share_one_exit() {
        let module = compile_to_rir(vec![int_func(
            "max",
            vec!["a", "b"],
            vec![Stmt::If {
                cond: Expr::binary(AstBinOp::Gt, Expr::var("a"), Expr::var("b")),
                then: Box::new(Stmt::Return(Expr::var("a"))),
                alt: Some(Box::new(Stmt::Return(Expr::var("b")))),
            }],
        )]);
        assert_no_virtual_operands(&module);
        let func = &module.funcs[0];
        let exit = (func.blocks.len() - 1) as BlockId;
        // two distinct blocks jump to the shared exit, each after moving
        // its value into a0
        let mut ret_blocks = 0;
        for blk in &func.blocks[..func.blocks.len() - 1] {
            if blk.ops.last() == Some(&Op::Jump { target: exit }) {
                ret_blocks += 1;
                let prev = &blk.ops[blk.ops.len() - 2];
                assert!(
                    matches!(prev, Op::Mov { dst: Opr::Phys(Reg::A0), .. }),
                    "{:?}",
                    prev
                );
            }
        }
        assert_eq!(ret_blocks, 2);
        assert_eq!(func.block(exit).jump_in.len(), 2);
    }

    #[test]
    fn register_pressure_forces_spill_and_reload() {
        // 28 locals all live until the final sum exceed the 27 allocatable
        // registers
        let n = 28;
        let mut body = vec![];
        for i in 0..n {
            body.push(Stmt::Decl { name: format!("x{}", i), ty: Type::Int });
            body.push(Stmt::Expr(Expr::assign(
                Expr::var(format!("x{}", i)),
                Expr::binary(AstBinOp::Add, Expr::var("a"), Expr::num(i)),
            )));
        }
        let mut sum = Expr::var("x0");
        for i in 1..n {
            sum = Expr::binary(AstBinOp::Add, sum, Expr::var(format!("x{}", i)));
        }
        body.push(Stmt::Return(sum));
        let module = compile_to_rir(vec![int_func("f", vec!["a"], body)]);
        assert_no_virtual_operands(&module);

        let func = &module.funcs[0];
        let ops: Vec<&Op> = func.blocks.iter().flat_map(|b| &b.ops).collect();
        let spill_slots: Vec<u32> = ops
            .iter()
            .filter_map(|op| match op {
                Op::Store { slot, .. } => Some(*slot),
                _ => None,
            })
            .collect();
        assert!(!spill_slots.is_empty(), "expected at least one spill");
        // some spilled slot is reloaded later
        let reloaded = ops.iter().any(|op| {
            matches!(op, Op::Load { src: Opr::Slot(s), .. } if spill_slots.contains(s))
        });
        assert!(reloaded, "expected a reload of a spilled slot");
        assert!(func.frame_size > 0);
    }

    #[test]
    fn call_boundary_spills_live_caller_saved_values() {
        // `a` lives across the call in a0, a caller-saved register
        let module = compile_to_rir(vec![int_func(
            "f",
            vec!["a"],
            vec![Stmt::Return(Expr::binary(
                AstBinOp::Add,
                Expr::call("h", vec![Expr::var("a")]),
                Expr::var("a"),
            ))],
        )]);
        assert_no_virtual_operands(&module);
        let ops: Vec<&Op> = module.funcs[0].blocks.iter().flat_map(|b| &b.ops).collect();
        let call_at = ops
            .iter()
            .position(|op| matches!(op, Op::Call { .. }))
            .expect("call survives");
        assert!(
            ops[..call_at]
                .iter()
                .any(|op| matches!(op, Op::Store { .. })),
            "live value must be spilled before the call"
        );
        assert!(
            ops[call_at..]
                .iter()
                .any(|op| matches!(op, Op::Load { src: Opr::Slot(_), .. })),
            "spilled value must be reloaded after the call"
        );
    }

    #[test]
    fn pseudo_ops_never_survive_allocation() {
        let module = compile_to_rir(vec![int_func(
            "f",
            vec!["a"],
            vec![Stmt::Return(Expr::call("h", vec![Expr::var("a")]))],
        )]);
        for func in &module.funcs {
            for blk in &func.blocks {
                for op in &blk.ops {
                    assert!(!matches!(
                        op,
                        Op::BeginParams
                            | Op::SetParam { .. }
                            | Op::GetParam { .. }
                            | Op::SetRet { .. }
                            | Op::GetRet { .. }
                    ));
                }
            }
        }
    }
}
