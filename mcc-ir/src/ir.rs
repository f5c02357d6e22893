//! Linear IR data model and CFG utilities
//!
//! Blocks live in a per-function arena addressed by stable [`BlockId`]
//! indices; the deterministic program order is a separate `layout` vector,
//! so deleting an unreachable block never invalidates an index. Edges are
//! kept bidirectionally consistent at all times: a block has at most one
//! fall-through successor, at most one jump successor, at most one
//! fall-through predecessor, and a set of jump predecessors.

use mcc_common::{CompileResult, CompilerError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Index into [`Module::vars`].
pub type VarId = u32;
/// Index into [`Module::funcs`].
pub type FuncId = u32;
/// Index into [`Function::blocks`].
pub type BlockId = u32;
/// Module-global block label, monotonically assigned and never reused.
pub type Label = u32;

/// Owner of all global variables and functions, and of the fresh-name
/// counters shared by every function.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Module {
    /// Arena of every variable in the module: globals, named locals,
    /// parameters and temporaries.
    pub vars: Vec<Variable>,
    pub funcs: Vec<Function>,
    /// Globals and functions in declaration order, for the textual dump.
    pub items: Vec<Item>,
    next_named: u32,
    next_temp: u32,
    next_label: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Item {
    Global(VarId),
    Func(FuncId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    /// Dump name: `T<n>` for globals and named locals, `t<n>` for
    /// temporaries, `p<n>` for parameters.
    pub name: String,
    /// Owning function, `None` for globals.
    pub func: Option<FuncId>,
    pub kind: VarKind,
    /// Byte width for arrays, `None` for scalars.
    pub width: Option<u32>,
    /// Address-like: the value is a memory address (array storage or a
    /// decayed array parameter) and is never copied by value.
    pub is_addr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarKind {
    Global,
    Local,
    Param,
    Temp,
}

impl Variable {
    pub fn is_global(&self) -> bool {
        self.kind == VarKind::Global
    }

    pub fn is_temp(&self) -> bool {
        self.kind == VarKind::Temp
    }

    /// A named (non-temporary) function-owned variable: a local or a
    /// parameter. Dead assignments are only ever deleted for these.
    pub fn is_named_local(&self) -> bool {
        matches!(self.kind, VarKind::Local | VarKind::Param)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<VarId>,
    pub locals: Vec<VarId>,
    /// Block arena; detached (pruned) blocks stay in place but leave
    /// `layout`.
    pub blocks: Vec<BasicBlock>,
    /// Program order over the reachable blocks, entry first.
    pub layout: Vec<BlockId>,
    pub entry: BlockId,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BasicBlock {
    pub label: Label,
    pub insts: Vec<Inst>,
    pub fall_out: Option<BlockId>,
    pub jump_out: Option<BlockId>,
    pub fall_in: Option<BlockId>,
    pub jump_in: BTreeSet<BlockId>,
    /// Position in `layout` as of the last [`Function::arrange_blocks`].
    pub pos: usize,
}

/// Either an immediate integer or a reference to a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Imm(i32),
    Var(VarId),
}

impl Operand {
    pub fn as_var(self) -> Option<VarId> {
        match self {
            Operand::Var(v) => Some(v),
            Operand::Imm(_) => None,
        }
    }
}

/// Arithmetic/comparison operators of the three-address `Binary`
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Or,
    And,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    pub fn as_cond(self) -> Option<CondOp> {
        match self {
            BinOp::Eq => Some(CondOp::Eq),
            BinOp::Ne => Some(CondOp::Ne),
            BinOp::Lt => Some(CondOp::Lt),
            BinOp::Gt => Some(CondOp::Gt),
            BinOp::Or => Some(CondOp::Or),
            BinOp::And => Some(CondOp::And),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

/// Comparison/logical operators a conditional branch can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CondOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Or,
    And,
}

impl CondOp {
    pub fn eval(self, lhs: i32, rhs: i32) -> bool {
        match self {
            CondOp::Eq => lhs == rhs,
            CondOp::Ne => lhs != rhs,
            CondOp::Lt => lhs < rhs,
            CondOp::Gt => lhs > rhs,
            CondOp::Or => lhs != 0 || rhs != 0,
            CondOp::And => lhs != 0 && rhs != 0,
        }
    }
}

/// A three-address instruction. Uses and defs are derived mechanically from
/// the kind and operands ([`Inst::uses`], [`Inst::def`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Inst {
    Binary {
        dst: VarId,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    Unary {
        dst: VarId,
        op: UnOp,
        src: Operand,
    },
    Call {
        dst: VarId,
        callee: String,
        args: Vec<Operand>,
    },
    Move {
        dst: VarId,
        src: Operand,
    },
    /// `dst = base[index]`, `index` in bytes
    Load {
        dst: VarId,
        base: VarId,
        index: Operand,
    },
    /// `base[index] = src`, `index` in bytes
    Store {
        base: VarId,
        index: Operand,
        src: Operand,
    },
    Jump {
        target: BlockId,
    },
    /// Taken when `lhs op rhs` holds; falls through otherwise. Always the
    /// last instruction of its block.
    Branch {
        op: CondOp,
        lhs: Operand,
        rhs: Operand,
        target: BlockId,
    },
    Return {
        value: Operand,
    },
}

impl Inst {
    /// The variable written by this instruction, if any.
    pub fn def(&self) -> Option<VarId> {
        match self {
            Inst::Binary { dst, .. }
            | Inst::Unary { dst, .. }
            | Inst::Call { dst, .. }
            | Inst::Move { dst, .. }
            | Inst::Load { dst, .. } => Some(*dst),
            Inst::Store { .. } | Inst::Jump { .. } | Inst::Branch { .. } | Inst::Return { .. } => {
                None
            }
        }
    }

    /// The variables read by this instruction. An array base is an address,
    /// not a value read, so it is not a use.
    pub fn uses(&self) -> Vec<VarId> {
        let mut out = Vec::new();
        let mut add = |opr: &Operand| {
            if let Operand::Var(v) = opr {
                out.push(*v);
            }
        };
        match self {
            Inst::Binary { lhs, rhs, .. } => {
                add(lhs);
                add(rhs);
            }
            Inst::Unary { src, .. } => add(src),
            Inst::Call { args, .. } => args.iter().for_each(add),
            Inst::Move { src, .. } => add(src),
            Inst::Load { index, .. } => add(index),
            Inst::Store { index, src, .. } => {
                add(index);
                add(src);
            }
            Inst::Jump { .. } => {}
            Inst::Branch { lhs, rhs, .. } => {
                add(lhs);
                add(rhs);
            }
            Inst::Return { value } => add(value),
        }
        out
    }
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn var(&self, id: VarId) -> &Variable {
        &self.vars[id as usize]
    }

    fn push_var(&mut self, var: Variable) -> VarId {
        let id = self.vars.len() as VarId;
        self.vars.push(var);
        id
    }

    /// Allocate a global variable (`T<n>` namespace, shared with named
    /// locals so dump names stay unique module-wide).
    pub fn alloc_global(&mut self, width: Option<u32>, is_addr: bool) -> VarId {
        let name = format!("T{}", self.next_named);
        self.next_named += 1;
        let id = self.push_var(Variable {
            name,
            func: None,
            kind: VarKind::Global,
            width,
            is_addr,
        });
        self.items.push(Item::Global(id));
        id
    }

    /// Allocate a function-owned variable: a fresh temporary or a named
    /// local.
    pub fn alloc_local(
        &mut self,
        func: FuncId,
        temp: bool,
        width: Option<u32>,
        is_addr: bool,
    ) -> VarId {
        let (name, kind) = if temp {
            let name = format!("t{}", self.next_temp);
            self.next_temp += 1;
            (name, VarKind::Temp)
        } else {
            let name = format!("T{}", self.next_named);
            self.next_named += 1;
            (name, VarKind::Local)
        };
        let id = self.push_var(Variable {
            name,
            func: Some(func),
            kind,
            width,
            is_addr,
        });
        self.funcs[func as usize].locals.push(id);
        id
    }

    /// Create a function with one parameter variable per element of
    /// `param_addr` (`true` marks an address-like array parameter) and an
    /// empty entry block.
    pub fn alloc_func(&mut self, name: impl Into<String>, param_addr: &[bool]) -> FuncId {
        let id = self.funcs.len() as FuncId;
        self.funcs.push(Function {
            name: name.into(),
            params: Vec::new(),
            locals: Vec::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
            entry: 0,
        });
        self.items.push(Item::Func(id));
        for (i, &is_addr) in param_addr.iter().enumerate() {
            let var = self.push_var(Variable {
                name: format!("p{}", i),
                func: Some(id),
                kind: VarKind::Param,
                width: None,
                is_addr,
            });
            self.funcs[id as usize].params.push(var);
        }
        let entry = self.alloc_block(id);
        self.funcs[id as usize].entry = entry;
        id
    }

    /// Create a block in `func`, assign it the next global label and append
    /// it to the function's arena and layout.
    pub fn alloc_block(&mut self, func: FuncId) -> BlockId {
        let label = self.next_label;
        self.next_label += 1;
        let f = &mut self.funcs[func as usize];
        let id = f.blocks.len() as BlockId;
        f.blocks.push(BasicBlock {
            label,
            pos: f.layout.len(),
            ..BasicBlock::default()
        });
        f.layout.push(id);
        id
    }
}

impl Function {
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id as usize]
    }

    pub fn push_inst(&mut self, block: BlockId, inst: Inst) {
        self.block_mut(block).insts.push(inst);
    }

    /// Link `from` to `to` by a fall-through edge.
    pub fn fall(&mut self, from: BlockId, to: BlockId) {
        self.block_mut(from).fall_out = Some(to);
        self.block_mut(to).fall_in = Some(from);
    }

    /// Link `from` to `to` by an explicit-jump edge.
    pub fn jump(&mut self, from: BlockId, to: BlockId) {
        self.block_mut(from).jump_out = Some(to);
        self.block_mut(to).jump_in.insert(from);
    }

    /// Remove the fall-through edge out of `from`, if any.
    pub fn unfall(&mut self, from: BlockId) {
        if let Some(to) = self.block_mut(from).fall_out.take() {
            self.block_mut(to).fall_in = None;
        }
    }

    /// Remove the jump edge out of `from`, if any.
    pub fn unjump(&mut self, from: BlockId) {
        if let Some(to) = self.block_mut(from).jump_out.take() {
            self.block_mut(to).jump_in.remove(&from);
        }
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

    /// Prune unreachable blocks and lay the survivors out deterministically.
    ///
    /// Runs a breadth-first reachability sweep from the entry block, safely
    /// unlinks every unreachable block (clearing both edge directions before
    /// detaching, so no dangling edge survives), then rebuilds `layout` by
    /// walking fall-through chains: each chain is followed to its end, and
    /// the next chain starts from the remaining reachable block with no
    /// fall-through predecessor, lowest id first. Block positions are
    /// reassigned to match.
    pub fn arrange_blocks(&mut self) {
        // breadth-first reachability from the entry
        let mut reachable = BTreeSet::new();
        let mut queue = VecDeque::new();
        reachable.insert(self.entry);
        queue.push_back(self.entry);
        while let Some(b) = queue.pop_front() {
            for s in self.succs(b) {
                if reachable.insert(s) {
                    queue.push_back(s);
                }
            }
        }

        // safe unlink of every unreachable block, both edge directions
        let all: Vec<BlockId> = (0..self.blocks.len() as BlockId).collect();
        for b in all {
            if reachable.contains(&b) {
                continue;
            }
            self.unfall(b);
            self.unjump(b);
            if let Some(p) = self.block_mut(b).fall_in.take() {
                self.block_mut(p).fall_out = None;
            }
            let preds: Vec<BlockId> = self.block(b).jump_in.iter().copied().collect();
            for p in preds {
                self.block_mut(p).jump_out = None;
            }
            self.block_mut(b).jump_in.clear();
        }

        // deterministic layout maximizing fall-through chains
        let mut remaining = reachable;
        let mut layout = Vec::with_capacity(remaining.len());
        let mut chain = Some(self.entry);
        loop {
            while let Some(b) = chain {
                if !remaining.remove(&b) {
                    break;
                }
                layout.push(b);
                chain = self.block(b).fall_out;
            }
            if remaining.is_empty() {
                break;
            }
            chain = remaining
                .iter()
                .copied()
                .min_by_key(|&b| (self.block(b).fall_in.is_some(), b));
        }

        for (pos, &b) in layout.iter().enumerate() {
            self.block_mut(b).pos = pos;
        }
        self.layout = layout;
    }

    /// Verify edge symmetry in both directions. Used by tests and debug
    /// assertions.
    pub fn check_edges(&self) -> CompileResult<()> {
        for (i, blk) in self.blocks.iter().enumerate() {
            let b = i as BlockId;
            if let Some(to) = blk.fall_out {
                if self.block(to).fall_in != Some(b) {
                    return Err(CompilerError::internal(format!(
                        "asymmetric fall edge l{} -> l{}",
                        blk.label,
                        self.block(to).label
                    )));
                }
            }
            if let Some(to) = blk.jump_out {
                if !self.block(to).jump_in.contains(&b) {
                    return Err(CompilerError::internal(format!(
                        "asymmetric jump edge l{} -> l{}",
                        blk.label,
                        self.block(to).label
                    )));
                }
            }
            if let Some(p) = blk.fall_in {
                if self.block(p).fall_out != Some(b) {
                    return Err(CompilerError::internal("dangling fall-in edge"));
                }
            }
            for &p in &blk.jump_in {
                if self.block(p).jump_out != Some(b) {
                    return Err(CompilerError::internal("dangling jump-in edge"));
                }
            }
        }
        Ok(())
    }
}
