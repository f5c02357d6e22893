//! Register IR data model
//!
//! The second intermediate representation: operations over an unbounded set
//! of virtual registers plus explicit calling-convention pseudo-ops, still
//! one step above the target. The lowering introduces virtual registers and
//! pseudo-ops; the allocator rewrites every virtual register to a physical
//! one, resolves the pseudo-ops and introduces the spill forms (`Store`,
//! `Load` from a frame slot); the emitter accepts only the fully resolved
//! subset.

use mcc_codegen::Reg;
use mcc_ir::{BinOp, CondOp, UnOp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Virtual register id, module-scoped and never reused.
pub type VReg = u32;
/// Index into [`Module::globals`].
pub type GlobalId = u32;
/// Index into [`Function::blocks`].
pub type BlockId = u32;
/// Module-global block label.
pub type Label = u32;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Module {
    pub globals: Vec<Global>,
    pub funcs: Vec<Function>,
    next_vreg: u32,
    next_label: u32,
}

/// Static storage for one global: a 4-byte scalar word when `width` is 0,
/// otherwise a zero-initialized array of `width` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Global {
    pub width: u32,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn alloc_vreg(&mut self) -> VReg {
        let r = self.next_vreg;
        self.next_vreg += 1;
        r
    }

    pub fn alloc_label(&mut self) -> Label {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    pub fn alloc_global(&mut self, width: u32) -> GlobalId {
        let id = self.globals.len() as GlobalId;
        self.globals.push(Global { width });
        id
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub argc: u32,
    /// Frame slots (4-byte words) reserved so far; never reclaimed within
    /// the function.
    pub frame_size: u32,
    /// Blocks in program order; the allocator appends the shared exit block
    /// last.
    pub blocks: Vec<BasicBlock>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BasicBlock {
    pub label: Label,
    pub ops: Vec<Op>,
    pub fall_out: Option<BlockId>,
    pub jump_out: Option<BlockId>,
    pub fall_in: Option<BlockId>,
    pub jump_in: BTreeSet<BlockId>,
    pub live_gen: BTreeSet<VReg>,
    pub live_kill: BTreeSet<VReg>,
    pub live_in: BTreeSet<VReg>,
    pub live_out: BTreeSet<VReg>,
}

impl BasicBlock {
    pub fn new(label: Label) -> Self {
        BasicBlock { label, ..BasicBlock::default() }
    }
}

impl Function {
    pub fn new(name: impl Into<String>, argc: u32) -> Self {
        Function {
            name: name.into(),
            argc,
            frame_size: 0,
            blocks: Vec::new(),
        }
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id as usize]
    }

    pub fn add_block(&mut self, label: Label) -> BlockId {
        let id = self.blocks.len() as BlockId;
        self.blocks.push(BasicBlock::new(label));
        id
    }

    /// Reserve `slots` more frame words, returning the first new slot index.
    pub fn extend_frame(&mut self, slots: u32) -> u32 {
        let first = self.frame_size;
        self.frame_size += slots;
        first
    }

    pub fn fall(&mut self, from: BlockId, to: BlockId) {
        self.block_mut(from).fall_out = Some(to);
        self.block_mut(to).fall_in = Some(from);
    }

    pub fn jump(&mut self, from: BlockId, to: BlockId) {
        self.block_mut(from).jump_out = Some(to);
        self.block_mut(to).jump_in.insert(from);
    }

    pub fn succs(&self, b: BlockId) -> Vec<BlockId> {
        let blk = self.block(b);
        blk.fall_out.into_iter().chain(blk.jump_out).collect()
    }

    pub fn preds(&self, b: BlockId) -> Vec<BlockId> {
        let blk = self.block(b);
        blk.fall_in
            .into_iter()
            .chain(blk.jump_in.iter().copied())
            .collect()
    }
}

/// A value-carrying operand. Jump targets, callees and parameter positions
/// are typed fields on their operations instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opr {
    Phys(Reg),
    Virt(VReg),
    Imm(i32),
    /// A frame slot index (word offset from the stack pointer).
    Slot(u32),
    Global(GlobalId),
}

impl Opr {
    pub fn as_virt(self) -> Option<VReg> {
        match self {
            Opr::Virt(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Binary { op: BinOp, dst: Opr, lhs: Opr, rhs: Opr },
    Unary { op: UnOp, dst: Opr, src: Opr },
    Mov { dst: Opr, src: Opr },
    /// `dst = base[offset]`, offset in bytes
    IdxLoad { dst: Opr, base: Opr, offset: Opr },
    /// `base[offset] = src`
    IdxStore { base: Opr, offset: Opr, src: Opr },
    Branch { op: CondOp, lhs: Opr, rhs: Opr, target: BlockId },
    Jump { target: BlockId },
    Call { callee: String },
    /// Spill: write `src` to frame slot `slot`.
    Store { src: Opr, slot: u32 },
    /// Read a frame slot or a global scalar into `dst`.
    Load { src: Opr, dst: Opr },
    /// Materialize the address of a frame slot or a global into `dst`.
    LoadAddr { src: Opr, dst: Opr },
    Ret,
    /// Start of a call's argument group; evicts caller-saved registers.
    BeginParams,
    SetParam { src: Opr, index: u32 },
    GetParam { index: u32, dst: Opr },
    SetRet { src: Opr },
    GetRet { dst: Opr },
}

impl Op {
    /// The virtual register defined by this operation, if any.
    pub fn def(&self) -> Option<VReg> {
        match self {
            Op::Binary { dst, .. }
            | Op::Unary { dst, .. }
            | Op::Mov { dst, .. }
            | Op::IdxLoad { dst, .. }
            | Op::Load { dst, .. }
            | Op::LoadAddr { dst, .. }
            | Op::GetParam { dst, .. }
            | Op::GetRet { dst } => dst.as_virt(),
            _ => None,
        }
    }

    /// The virtual registers read by this operation.
    pub fn uses(&self) -> BTreeSet<VReg> {
        let mut out = BTreeSet::new();
        let mut add = |opr: &Opr| {
            if let Opr::Virt(r) = opr {
                out.insert(*r);
            }
        };
        match self {
            Op::Binary { lhs, rhs, .. } => {
                add(lhs);
                add(rhs);
            }
            Op::Unary { src, .. } | Op::Mov { src, .. } => add(src),
            Op::IdxLoad { base, offset, .. } => {
                add(base);
                add(offset);
            }
            Op::IdxStore { base, offset, src } => {
                add(base);
                add(offset);
                add(src);
            }
            Op::Branch { lhs, rhs, .. } => {
                add(lhs);
                add(rhs);
            }
            Op::Store { src, .. } | Op::SetParam { src, .. } | Op::SetRet { src } => add(src),
            Op::Load { .. }
            | Op::LoadAddr { .. }
            | Op::Jump { .. }
            | Op::Call { .. }
            | Op::Ret
            | Op::BeginParams
            | Op::GetParam { .. }
            | Op::GetRet { .. } => {}
        }
        out
    }

    /// Replace every occurrence of virtual register `vr` (in use and def
    /// positions alike) by physical register `pr`.
    pub fn rewrite(&mut self, vr: VReg, pr: Reg) {
        for opr in self.oprs_mut() {
            if *opr == Opr::Virt(vr) {
                *opr = Opr::Phys(pr);
            }
        }
    }

    /// All value operands of this operation, for rewriting and for the
    /// post-allocation totality check.
    pub fn oprs_mut(&mut self) -> Vec<&mut Opr> {
        match self {
            Op::Binary { dst, lhs, rhs, .. } => vec![dst, lhs, rhs],
            Op::Unary { dst, src, .. } | Op::Mov { dst, src } => vec![dst, src],
            Op::IdxLoad { dst, base, offset } => vec![dst, base, offset],
            Op::IdxStore { base, offset, src } => vec![base, offset, src],
            Op::Branch { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Store { src, .. } => vec![src],
            Op::Load { src, dst } | Op::LoadAddr { src, dst } => vec![src, dst],
            Op::SetParam { src, .. } | Op::SetRet { src } => vec![src],
            Op::GetParam { dst, .. } | Op::GetRet { dst } => vec![dst],
            Op::Jump { .. } | Op::Call { .. } | Op::Ret | Op::BeginParams => vec![],
        }
    }

    pub fn oprs(&self) -> Vec<&Opr> {
        match self {
            Op::Binary { dst, lhs, rhs, .. } => vec![dst, lhs, rhs],
            Op::Unary { dst, src, .. } | Op::Mov { dst, src } => vec![dst, src],
            Op::IdxLoad { dst, base, offset } => vec![dst, base, offset],
            Op::IdxStore { base, offset, src } => vec![base, offset, src],
            Op::Branch { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Store { src, .. } => vec![src],
            Op::Load { src, dst } | Op::LoadAddr { src, dst } => vec![src, dst],
            Op::SetParam { src, .. } | Op::SetRet { src } => vec![src],
            Op::GetParam { dst, .. } | Op::GetRet { dst } => vec![dst],
            Op::Jump { .. } | Op::Call { .. } | Op::Ret | Op::BeginParams => vec![],
        }
    }
}

impl fmt::Display for Opr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opr::Phys(r) => write!(f, "{}", r),
            Opr::Virt(r) => write!(f, "r{}", r),
            Opr::Imm(v) => write!(f, "{}", v),
            Opr::Slot(s) => write!(f, "{}", s),
            Opr::Global(g) => write!(f, "v{}", g),
        }
    }
}

fn bin_op_str(op: BinOp) -> &'static str {
    match op {
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Gt => ">",
        BinOp::Or => "||",
        BinOp::And => "&&",
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
    }
}

fn cond_op_str(op: CondOp) -> &'static str {
    match op {
        CondOp::Eq => "==",
        CondOp::Ne => "!=",
        CondOp::Lt => "<",
        CondOp::Gt => ">",
        CondOp::Or => "||",
        CondOp::And => "&&",
    }
}

fn write_op(f: &mut fmt::Formatter<'_>, func: &Function, op: &Op) -> fmt::Result {
    match op {
        Op::Binary { op, dst, lhs, rhs } => {
            writeln!(f, "\t{} = {} {} {}", dst, lhs, bin_op_str(*op), rhs)
        }
        Op::Unary { op, dst, src } => {
            let s = match op {
                UnOp::Neg => "-",
                UnOp::Not => "!",
            };
            writeln!(f, "\t{} = {}{}", dst, s, src)
        }
        Op::Mov { dst, src } => writeln!(f, "\t{} = {}", dst, src),
        Op::IdxLoad { dst, base, offset } => writeln!(f, "\t{} = {}[{}]", dst, base, offset),
        Op::IdxStore { base, offset, src } => writeln!(f, "\t{}[{}] = {}", base, offset, src),
        Op::Branch { op, lhs, rhs, target } => writeln!(
            f,
            "\tif {} {} {} goto l{}",
            lhs,
            cond_op_str(*op),
            rhs,
            func.block(*target).label
        ),
        Op::Jump { target } => writeln!(f, "\tgoto l{}", func.block(*target).label),
        Op::Call { callee } => writeln!(f, "\tcall f_{}", callee),
        Op::Store { src, slot } => writeln!(f, "\tstore {} {}", src, slot),
        Op::Load { src, dst } => writeln!(f, "\tload {} {}", src, dst),
        Op::LoadAddr { src, dst } => writeln!(f, "\tloadaddr {} {}", src, dst),
        Op::Ret => writeln!(f, "\treturn"),
        Op::BeginParams => writeln!(f, "\t__begin_param"),
        Op::SetParam { src, index } => writeln!(f, "\t__set_param {} {}", src, index),
        Op::GetParam { index, dst } => writeln!(f, "\t__get_param {} {}", index, dst),
        Op::SetRet { src } => writeln!(f, "\t__set_ret {}", src),
        Op::GetRet { dst } => writeln!(f, "\t__get_ret {}", dst),
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, global) in self.globals.iter().enumerate() {
            if global.width > 0 {
                writeln!(f, "v{} = malloc {}", id, global.width)?;
            } else {
                writeln!(f, "v{} = 0", id)?;
            }
        }
        for func in &self.funcs {
            writeln!(f, "f_{} [{}] [{}]", func.name, func.argc, func.frame_size)?;
            for blk in &func.blocks {
                writeln!(f, "l{}:", blk.label)?;
                for op in &blk.ops {
                    write_op(f, func, op)?;
                }
            }
            writeln!(f, "end f_{}", func.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn uses_and_defs_follow_opcode() {
        let add = Op::Binary {
            op: BinOp::Add,
            dst: Opr::Virt(3),
            lhs: Opr::Virt(3),
            rhs: Opr::Virt(4),
        };
        assert_eq!(add.def(), Some(3));
        // the destination also appearing as a source still counts as a use
        assert_eq!(add.uses(), BTreeSet::from([3, 4]));

        let st = Op::IdxStore {
            base: Opr::Virt(1),
            offset: Opr::Imm(0),
            src: Opr::Virt(2),
        };
        assert_eq!(st.def(), None);
        assert_eq!(st.uses(), BTreeSet::from([1, 2]));

        let get = Op::GetParam { index: 0, dst: Opr::Virt(7) };
        assert_eq!(get.def(), Some(7));
        assert!(get.uses().is_empty());
    }

    #[test]
    fn rewrite_hits_every_position() {
        let mut op = Op::Binary {
            op: BinOp::Add,
            dst: Opr::Virt(3),
            lhs: Opr::Virt(3),
            rhs: Opr::Imm(1),
        };
        op.rewrite(3, Reg::S0);
        assert_eq!(
            op,
            Op::Binary {
                op: BinOp::Add,
                dst: Opr::Phys(Reg::S0),
                lhs: Opr::Phys(Reg::S0),
                rhs: Opr::Imm(1),
            }
        );
    }

    #[test]
    fn dump_renders_globals_and_pseudo_ops() {
        let mut module = Module::new();
        module.alloc_global(0);
        module.alloc_global(16);
        let mut func = Function::new("main", 0);
        let label = module.alloc_label();
        let b = func.add_block(label);
        func.block_mut(b).ops.push(Op::SetRet { src: Opr::Imm(0) });
        module.funcs.push(func);

        let text = module.to_string();
        assert_eq!(
            text,
            "v0 = 0\n\
             v1 = malloc 16\n\
             f_main [0] [0]\n\
             l0:\n\
             \t__set_ret 0\n\
             end f_main\n"
        );
    }

    #[test]
    fn dump_is_stable_across_serde() {
        let mut module = Module::new();
        module.alloc_global(8);
        let mut func = Function::new("f", 1);
        let b0 = func.add_block(module.alloc_label());
        let b1 = func.add_block(module.alloc_label());
        func.fall(b0, b1);
        let r = module.alloc_vreg();
        func.block_mut(b0).ops = vec![
            Op::GetParam { index: 0, dst: Opr::Virt(r) },
            Op::Branch { op: CondOp::Ne, lhs: Opr::Virt(r), rhs: Opr::Phys(Reg::X0), target: b1 },
        ];
        func.block_mut(b1).ops = vec![Op::SetRet { src: Opr::Virt(r) }];
        module.funcs.push(func);

        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_string(), module.to_string());
        assert_eq!(back.funcs[0].block(b1).fall_in, Some(b0));
    }

    #[test]
    fn frame_extension_is_monotonic() {
        let mut func = Function::new("f", 0);
        assert_eq!(func.extend_frame(4), 0);
        assert_eq!(func.extend_frame(1), 4);
        assert_eq!(func.frame_size, 5);
    }
}
