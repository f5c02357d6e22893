//! Linear-IR to register-IR lowering
//!
//! Every function-owned variable (named locals and temporaries alike) gets
//! a virtual register lazily, on first use. Globals get permanent static
//! storage records; reading or writing one goes through an explicit
//! load/load-address sequence rather than a direct register reference.
//! Calls are bracketed by the calling-convention pseudo-ops; parameters are
//! retrieved at function entry with `get-param`. Address-like locals (array
//! storage) get frame slots sized by their width; an address-like parameter
//! is already an address in its incoming register.
//!
//! The RISC-V branch templates only cover eq/ne/lt/gt, so `||`/`&&`
//! conditional branches are legalized here: the boolean is materialized
//! into a fresh virtual register and branched against `x0`.

use crate::rir::{BlockId, Function, Module, Op, Opr, VReg};
use log::debug;
use mcc_codegen::{Reg, MAX_ARG_REGS, WORD_SIZE};
use mcc_common::{CompileResult, CompilerError};
use mcc_ir::ir::Item;
use mcc_ir::{CondOp, Inst, Operand, VarId, VarKind};
use std::collections::HashMap;

/// Lower an optimized linear-IR module into an unallocated register-IR
/// module.
pub fn lower_module(src: &mcc_ir::Module) -> CompileResult<Module> {
    let mut lo = Lowerer {
        src,
        out: Module::new(),
        globals: HashMap::new(),
    };
    for item in &src.items {
        if let Item::Global(var) = *item {
            let id = lo.out.alloc_global(src.var(var).width.unwrap_or(0));
            lo.globals.insert(var, id);
        }
    }
    for func in &src.funcs {
        lo.lower_function(func)?;
    }
    Ok(lo.out)
}

struct Lowerer<'a> {
    src: &'a mcc_ir::Module,
    out: Module,
    globals: HashMap<VarId, u32>,
}

/// Per-function lowering state; discarded when the function is done.
struct FuncCx {
    func: Function,
    cur: BlockId,
    var2reg: HashMap<VarId, VReg>,
    slots: HashMap<VarId, u32>,
}

impl Lowerer<'_> {
    fn lower_function(&mut self, src_func: &mcc_ir::Function) -> CompileResult<()> {
        let argc = src_func.params.len() as u32;
        if argc > MAX_ARG_REGS {
            return Err(CompilerError::codegen(format!(
                "f_{} takes {} arguments, the ABI allows {}",
                src_func.name, argc, MAX_ARG_REGS
            )));
        }
        debug!("lowering f_{} ({} blocks)", src_func.name, src_func.layout.len());

        let mut cx = FuncCx {
            func: Function::new(&src_func.name, argc),
            cur: 0,
            var2reg: HashMap::new(),
            slots: HashMap::new(),
        };
        for _ in &src_func.layout {
            let label = self.out.alloc_label();
            cx.func.add_block(label);
        }
        // edges carry over by layout position
        for (i, &lb) in src_func.layout.iter().enumerate() {
            let blk = src_func.block(lb);
            if let Some(fo) = blk.fall_out {
                cx.func.fall(i as BlockId, src_func.block(fo).pos as BlockId);
            }
            if let Some(jo) = blk.jump_out {
                cx.func.jump(i as BlockId, src_func.block(jo).pos as BlockId);
            }
        }

        // retrieve arguments at function entry
        for (i, &p) in src_func.params.iter().enumerate() {
            let rp = self.load_var(&mut cx, p);
            self.gen(&mut cx, Op::GetParam { index: i as u32, dst: Opr::Virt(rp) });
        }

        for (i, &lb) in src_func.layout.iter().enumerate() {
            cx.cur = i as BlockId;
            for inst in &src_func.block(lb).insts {
                self.lower_inst(&mut cx, src_func, inst)?;
            }
        }
        self.out.funcs.push(cx.func);
        Ok(())
    }

    fn lower_inst(
        &mut self,
        cx: &mut FuncCx,
        src_func: &mcc_ir::Function,
        inst: &Inst,
    ) -> CompileResult<()> {
        let target_of = |b| src_func.block(b).pos as BlockId;
        match inst {
            Inst::Binary { dst, op, lhs, rhs } => {
                let oy = Opr::Virt(self.load_opr(cx, *lhs));
                // only add/less-than have an immediate instruction form
                let oz = match *rhs {
                    Operand::Imm(v)
                        if matches!(op, mcc_ir::BinOp::Add | mcc_ir::BinOp::Lt) =>
                    {
                        Opr::Imm(v)
                    }
                    _ => Opr::Virt(self.load_opr(cx, *rhs)),
                };
                if self.src.var(*dst).is_global() {
                    let r1 = self.out.alloc_vreg();
                    self.gen(cx, Op::Binary { op: *op, dst: Opr::Virt(r1), lhs: oy, rhs: oz });
                    self.store_var(cx, Opr::Virt(r1), *dst)?;
                } else {
                    let rx = self.load_var(cx, *dst);
                    self.gen(cx, Op::Binary { op: *op, dst: Opr::Virt(rx), lhs: oy, rhs: oz });
                }
            }
            Inst::Unary { dst, op, src } => {
                let ry = self.load_opr(cx, *src);
                if self.src.var(*dst).is_global() {
                    let r1 = self.out.alloc_vreg();
                    self.gen(cx, Op::Unary { op: *op, dst: Opr::Virt(r1), src: Opr::Virt(ry) });
                    self.store_var(cx, Opr::Virt(r1), *dst)?;
                } else {
                    let rx = self.load_var(cx, *dst);
                    self.gen(cx, Op::Unary { op: *op, dst: Opr::Virt(rx), src: Opr::Virt(ry) });
                }
            }
            Inst::Call { dst, callee, args } => {
                if args.len() as u32 > MAX_ARG_REGS {
                    return Err(CompilerError::codegen(format!(
                        "call to f_{} passes {} arguments, the ABI allows {}",
                        callee,
                        args.len(),
                        MAX_ARG_REGS
                    )));
                }
                self.gen(cx, Op::BeginParams);
                for (i, arg) in args.iter().enumerate() {
                    let index = i as u32;
                    let src = match *arg {
                        Operand::Imm(v) => Opr::Imm(v),
                        Operand::Var(x) => {
                            let var = self.src.var(x);
                            if var.is_global() {
                                Opr::Global(self.globals[&x])
                            } else if var.is_addr && var.kind == VarKind::Param {
                                Opr::Virt(self.load_var(cx, x))
                            } else if var.is_addr {
                                Opr::Slot(self.slot_of(cx, x)?)
                            } else {
                                Opr::Virt(self.load_var(cx, x))
                            }
                        }
                    };
                    self.gen(cx, Op::SetParam { src, index });
                }
                self.gen(cx, Op::Call { callee: callee.clone() });
                let rx = self.load_var(cx, *dst);
                self.gen(cx, Op::GetRet { dst: Opr::Virt(rx) });
            }
            Inst::Move { dst, src } => match *src {
                Operand::Imm(v) => self.store_var(cx, Opr::Imm(v), *dst)?,
                Operand::Var(y) => {
                    if !self.src.var(y).is_global() {
                        let ry = self.load_var(cx, y);
                        self.store_var(cx, Opr::Virt(ry), *dst)?;
                    } else if !self.src.var(*dst).is_global() {
                        let rx = self.load_var(cx, *dst);
                        let g = self.globals[&y];
                        self.gen(cx, Op::Load { src: Opr::Global(g), dst: Opr::Virt(rx) });
                    } else {
                        let ry = self.load_var(cx, y);
                        self.store_var(cx, Opr::Virt(ry), *dst)?;
                    }
                }
            },
            Inst::Store { base, index, src } => {
                let rx = self.load_addr(cx, *base)?;
                let ry = self.load_opr(cx, *index);
                let rz = self.load_opr(cx, *src);
                self.gen_add(cx, rx, ry);
                self.gen(cx, Op::IdxStore {
                    base: Opr::Virt(rx),
                    offset: Opr::Imm(0),
                    src: Opr::Virt(rz),
                });
            }
            Inst::Load { dst, base, index } => {
                let ry = self.load_addr(cx, *base)?;
                let rz = self.load_opr(cx, *index);
                self.gen_add(cx, ry, rz);
                if !self.src.var(*dst).is_global() {
                    let rx = self.load_var(cx, *dst);
                    self.gen(cx, Op::IdxLoad {
                        dst: Opr::Virt(rx),
                        base: Opr::Virt(ry),
                        offset: Opr::Imm(0),
                    });
                } else {
                    let rx = self.out.alloc_vreg();
                    self.gen(cx, Op::IdxLoad {
                        dst: Opr::Virt(rx),
                        base: Opr::Virt(ry),
                        offset: Opr::Imm(0),
                    });
                    self.store_var(cx, Opr::Virt(rx), *dst)?;
                }
            }
            Inst::Branch { op, lhs, rhs, target } => {
                let target = target_of(*target);
                match op {
                    CondOp::Or | CondOp::And => {
                        let bool_op = match op {
                            CondOp::Or => mcc_ir::BinOp::Or,
                            _ => mcc_ir::BinOp::And,
                        };
                        let rl = self.load_opr(cx, *lhs);
                        let rr = self.load_opr(cx, *rhs);
                        let rt = self.out.alloc_vreg();
                        self.gen(cx, Op::Binary {
                            op: bool_op,
                            dst: Opr::Virt(rt),
                            lhs: Opr::Virt(rl),
                            rhs: Opr::Virt(rr),
                        });
                        self.gen(cx, Op::Branch {
                            op: CondOp::Ne,
                            lhs: Opr::Virt(rt),
                            rhs: Opr::Phys(Reg::X0),
                            target,
                        });
                    }
                    _ => {
                        let ol = self.branch_opr(cx, *lhs);
                        let or = self.branch_opr(cx, *rhs);
                        self.gen(cx, Op::Branch { op: *op, lhs: ol, rhs: or, target });
                    }
                }
            }
            Inst::Jump { target } => {
                let target = target_of(*target);
                self.gen(cx, Op::Jump { target });
            }
            Inst::Return { value } => {
                let src = match *value {
                    Operand::Imm(v) => Opr::Imm(v),
                    Operand::Var(x) => {
                        let var = self.src.var(x);
                        if var.is_global() {
                            Opr::Global(self.globals[&x])
                        } else if var.is_addr {
                            Opr::Virt(self.load_addr(cx, x)?)
                        } else {
                            Opr::Virt(self.load_var(cx, x))
                        }
                    }
                };
                self.gen(cx, Op::SetRet { src });
            }
        }
        Ok(())
    }

    fn gen(&mut self, cx: &mut FuncCx, op: Op) {
        cx.func.block_mut(cx.cur).ops.push(op);
    }

    /// `dst += addend`, both virtual registers.
    fn gen_add(&mut self, cx: &mut FuncCx, dst: VReg, addend: VReg) {
        self.gen(cx, Op::Binary {
            op: mcc_ir::BinOp::Add,
            dst: Opr::Virt(dst),
            lhs: Opr::Virt(dst),
            rhs: Opr::Virt(addend),
        });
    }

    /// The virtual register holding `x`'s value. A global is read through
    /// its storage into a fresh register every time; a function-owned
    /// variable keeps one register for its whole lifetime, assigned on
    /// first use.
    fn load_var(&mut self, cx: &mut FuncCx, x: VarId) -> VReg {
        if self.src.var(x).is_global() {
            let rx = self.out.alloc_vreg();
            let g = self.globals[&x];
            self.gen(cx, Op::Load { src: Opr::Global(g), dst: Opr::Virt(rx) });
            rx
        } else {
            match cx.var2reg.get(&x) {
                Some(&r) => r,
                None => {
                    let r = self.out.alloc_vreg();
                    cx.var2reg.insert(x, r);
                    r
                }
            }
        }
    }

    /// Materialize an operand into a virtual register (an immediate becomes
    /// a move).
    fn load_opr(&mut self, cx: &mut FuncCx, opr: Operand) -> VReg {
        match opr {
            Operand::Imm(v) => {
                let rt = self.out.alloc_vreg();
                self.gen(cx, Op::Mov { dst: Opr::Virt(rt), src: Opr::Imm(v) });
                rt
            }
            Operand::Var(x) => self.load_var(cx, x),
        }
    }

    /// A branch operand: zero compares directly against `x0`.
    fn branch_opr(&mut self, cx: &mut FuncCx, opr: Operand) -> Opr {
        match opr {
            Operand::Imm(0) => Opr::Phys(Reg::X0),
            _ => Opr::Virt(self.load_opr(cx, opr)),
        }
    }

    /// The frame slot backing an address-like local, allocated on first
    /// need and sized by the array's byte width.
    fn slot_of(&mut self, cx: &mut FuncCx, x: VarId) -> CompileResult<u32> {
        if let Some(&slot) = cx.slots.get(&x) {
            return Ok(slot);
        }
        let width = self.src.var(x).width.ok_or_else(|| {
            CompilerError::internal(format!(
                "address-like local {} has no width",
                self.src.var(x).name
            ))
        })?;
        let slot = cx.func.extend_frame(width / WORD_SIZE);
        cx.slots.insert(x, slot);
        Ok(slot)
    }

    /// A virtual register holding the address of `x`'s storage.
    fn load_addr(&mut self, cx: &mut FuncCx, x: VarId) -> CompileResult<VReg> {
        let var = self.src.var(x);
        if var.is_global() {
            let rx = self.out.alloc_vreg();
            let g = self.globals[&x];
            self.gen(cx, Op::LoadAddr { src: Opr::Global(g), dst: Opr::Virt(rx) });
            Ok(rx)
        } else if var.kind == VarKind::Param {
            // an array parameter already carries an address
            let rx = self.load_var(cx, x);
            let rt = self.out.alloc_vreg();
            self.gen(cx, Op::Mov { dst: Opr::Virt(rt), src: Opr::Virt(rx) });
            Ok(rt)
        } else {
            let slot = self.slot_of(cx, x)?;
            let rx = self.out.alloc_vreg();
            self.gen(cx, Op::LoadAddr { src: Opr::Slot(slot), dst: Opr::Virt(rx) });
            Ok(rx)
        }
    }

    /// Write `opr` into `x`: a register move for locals, a store through
    /// the materialized address for globals.
    fn store_var(&mut self, cx: &mut FuncCx, opr: Opr, x: VarId) -> CompileResult<()> {
        if self.src.var(x).is_global() {
            let rx = self.out.alloc_vreg();
            let g = self.globals[&x];
            self.gen(cx, Op::LoadAddr { src: Opr::Global(g), dst: Opr::Virt(rx) });
            let src = match opr {
                Opr::Imm(v) => {
                    let ri = self.out.alloc_vreg();
                    self.gen(cx, Op::Mov { dst: Opr::Virt(ri), src: Opr::Imm(v) });
                    Opr::Virt(ri)
                }
                Opr::Virt(_) => opr,
                other => {
                    return Err(CompilerError::internal(format!(
                        "unexpected store operand {:?}",
                        other
                    )))
                }
            };
            self.gen(cx, Op::IdxStore { base: Opr::Virt(rx), offset: Opr::Imm(0), src });
        } else {
            let rx = self.load_var(cx, x);
            self.gen(cx, Op::Mov { dst: Opr::Virt(rx), src: opr });
        }
        Ok(())
    }
}
