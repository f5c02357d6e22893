//! AST to linear-IR builder
//!
//! Consumes one validated top-level declaration at a time and emits it into
//! the module. Identifier resolution uses a stack of lexical scopes,
//! innermost first; the tree has already been type-checked, so a failed
//! lookup or a malformed assignment target is an internal error, not a
//! user-facing diagnostic.

use crate::ir::{BinOp as IrBinOp, BlockId, CondOp, FuncId, Inst, Module, Operand, UnOp as IrUnOp, VarId};
use log::debug;
use mcc_common::{BinOp, CompileResult, CompilerError, Decl, Expr, FuncDef, Stmt, Type, UnOp};
use std::collections::HashMap;

/// Build a linear-IR module from a fully type-resolved program.
pub fn build_module(program: &[Decl]) -> CompileResult<Module> {
    let mut builder = IrBuilder::new();
    builder.enter_scope();
    for decl in program {
        builder.emit_decl(decl)?;
    }
    builder.leave_scope();
    Ok(builder.module)
}

struct IrBuilder {
    module: Module,
    scopes: Vec<HashMap<String, VarId>>,
    cur_func: FuncId,
    cur_blk: BlockId,
}

impl IrBuilder {
    fn new() -> Self {
        IrBuilder {
            module: Module::new(),
            scopes: Vec::new(),
            cur_func: 0,
            cur_blk: 0,
        }
    }

    fn enter_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn leave_scope(&mut self) {
        self.scopes.pop();
    }

    fn define(&mut self, name: &str, var: VarId) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), var);
        }
    }

    fn lookup(&self, name: &str) -> CompileResult<VarId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&var) = scope.get(name) {
                return Ok(var);
            }
        }
        Err(CompilerError::internal(format!(
            "unresolved identifier `{}` in a validated tree",
            name
        )))
    }

    fn push(&mut self, inst: Inst) {
        self.module.funcs[self.cur_func as usize].push_inst(self.cur_blk, inst);
    }

    fn alloc_temp(&mut self) -> VarId {
        self.module.alloc_local(self.cur_func, true, None, false)
    }

    fn decl_width(ty: &Type) -> CompileResult<Option<u32>> {
        if !ty.is_array() {
            return Ok(None);
        }
        match ty.byte_size() {
            Some(width) => Ok(Some(width)),
            None => Err(CompilerError::internal(
                "declared array without a static byte size",
            )),
        }
    }

    fn emit_decl(&mut self, decl: &Decl) -> CompileResult<()> {
        match decl {
            Decl::Var { name, ty } => {
                let width = Self::decl_width(ty)?;
                let var = self.module.alloc_global(width, ty.is_array());
                self.define(name, var);
                Ok(())
            }
            Decl::Func(def) => self.emit_func(def),
        }
    }

    fn emit_func(&mut self, def: &FuncDef) -> CompileResult<()> {
        debug!("building function {}", def.name);
        let param_addr: Vec<bool> = def.params.iter().map(|p| p.ty.is_array()).collect();
        let func = self.module.alloc_func(&def.name, &param_addr);
        self.enter_scope();
        let params = self.module.funcs[func as usize].params.clone();
        for (param, var) in def.params.iter().zip(params) {
            self.define(&param.name, var);
        }
        self.cur_func = func;
        self.cur_blk = self.module.funcs[func as usize].entry;
        for stmt in &def.body {
            self.emit_stmt(stmt)?;
        }
        self.leave_scope();
        self.module.funcs[func as usize].arrange_blocks();
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Decl { name, ty } => {
                let width = Self::decl_width(ty)?;
                let var = self
                    .module
                    .alloc_local(self.cur_func, false, width, ty.is_array());
                self.define(name, var);
                Ok(())
            }
            Stmt::Block(stmts) => {
                self.enter_scope();
                for s in stmts {
                    self.emit_stmt(s)?;
                }
                self.leave_scope();
                Ok(())
            }
            Stmt::If { cond, then, alt } => self.emit_if(cond, then, alt.as_deref()),
            Stmt::While { test, body } => self.emit_while(test, body),
            Stmt::Return(value) => {
                let value = self.emit_expr(value)?;
                self.push(Inst::Return { value });
                // fresh follow-on block for any trailing code; pruned later
                // if nothing reaches it
                self.cur_blk = self.module.alloc_block(self.cur_func);
                Ok(())
            }
            Stmt::Expr(expr) => self.emit_expr(expr).map(|_| ()),
        }
    }

    fn emit_if(&mut self, cond: &Expr, then: &Stmt, alt: Option<&Stmt>) -> CompileResult<()> {
        let then_blk = self.module.alloc_block(self.cur_func);
        let else_blk = self.module.alloc_block(self.cur_func);
        let merge_blk = self.module.alloc_block(self.cur_func);
        let func = self.cur_func as usize;
        let head = self.cur_blk;
        self.module.funcs[func].fall(head, else_blk);
        self.module.funcs[func].jump(head, then_blk);
        self.emit_cond_branch(cond, then_blk)?;

        self.cur_blk = else_blk;
        if let Some(alt) = alt {
            self.emit_stmt(alt)?;
        }
        self.push(Inst::Jump { target: merge_blk });
        self.module.funcs[func].jump(self.cur_blk, merge_blk);

        self.cur_blk = then_blk;
        self.emit_stmt(then)?;
        self.module.funcs[func].fall(self.cur_blk, merge_blk);

        self.cur_blk = merge_blk;
        Ok(())
    }

    fn emit_while(&mut self, test: &Expr, body: &Stmt) -> CompileResult<()> {
        let loop_blk = self.module.alloc_block(self.cur_func);
        let test_blk = self.module.alloc_block(self.cur_func);
        let break_blk = self.module.alloc_block(self.cur_func);
        let func = self.cur_func as usize;

        self.push(Inst::Jump { target: test_blk });
        self.module.funcs[func].jump(self.cur_blk, test_blk);

        self.cur_blk = test_blk;
        self.emit_cond_branch(test, loop_blk)?;
        self.module.funcs[func].jump(test_blk, loop_blk);
        self.module.funcs[func].fall(test_blk, break_blk);

        self.cur_blk = loop_blk;
        self.emit_stmt(body)?;
        self.module.funcs[func].fall(self.cur_blk, test_blk);

        self.cur_blk = break_blk;
        Ok(())
    }

    /// Emit the condition and a branch to `target` taken when it holds. A
    /// top-level comparison/logical operator is carried on the branch
    /// directly; anything else is tested against zero.
    fn emit_cond_branch(&mut self, cond: &Expr, target: BlockId) -> CompileResult<()> {
        if let Expr::Binary { op, lhs, rhs } = cond {
            if let Some(cond_op) = op.as_ir_cond() {
                let lhs = self.emit_expr(lhs)?;
                let rhs = self.emit_expr(rhs)?;
                self.push(Inst::Branch { op: cond_op, lhs, rhs, target });
                return Ok(());
            }
        }
        let value = self.emit_expr(cond)?;
        self.push(Inst::Branch {
            op: CondOp::Ne,
            lhs: value,
            rhs: Operand::Imm(0),
            target,
        });
        Ok(())
    }

    fn emit_expr(&mut self, expr: &Expr) -> CompileResult<Operand> {
        match expr {
            Expr::Num(n) => Ok(Operand::Imm(*n)),
            Expr::Unary { op, arg } => {
                let src = self.emit_expr(arg)?;
                let dst = self.alloc_temp();
                self.push(Inst::Unary { dst, op: op.to_ir(), src });
                Ok(Operand::Var(dst))
            }
            Expr::Binary { op: BinOp::Comma, lhs, rhs } => {
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)
            }
            Expr::Binary { op: BinOp::Assign, lhs, rhs } => {
                let value = self.emit_expr(rhs)?;
                match lhs.as_ref() {
                    Expr::Ref { name, indices, decl_ty } => {
                        self.emit_store(name, indices, decl_ty, value)
                    }
                    _ => Err(CompilerError::internal(
                        "assignment target is not a reference in a validated tree",
                    )),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.emit_expr(lhs)?;
                let rhs = self.emit_expr(rhs)?;
                let dst = self.alloc_temp();
                self.push(Inst::Binary { dst, op: op.to_ir()?, lhs, rhs });
                Ok(Operand::Var(dst))
            }
            Expr::Call { callee, args } => self.emit_call(callee, args),
            Expr::Ref { name, indices, decl_ty } => self.emit_ref(name, indices, decl_ty),
        }
    }

    fn emit_call(&mut self, callee: &str, args: &[Expr]) -> CompileResult<Operand> {
        let mut arg_oprs = Vec::with_capacity(args.len());
        for arg in args {
            let opr = self.emit_expr(arg)?;
            let opr = match opr {
                Operand::Imm(_) => opr,
                Operand::Var(v) => {
                    let var = self.module.var(v);
                    if var.is_temp() || var.is_addr {
                        opr
                    } else {
                        // copy a live named variable so it cannot alias
                        // across the call boundary
                        let tmp = self.alloc_temp();
                        self.push(Inst::Move { dst: tmp, src: opr });
                        Operand::Var(tmp)
                    }
                }
            };
            arg_oprs.push(opr);
        }
        let dst = self.alloc_temp();
        self.push(Inst::Call {
            dst,
            callee: callee.to_string(),
            args: arg_oprs,
        });
        Ok(Operand::Var(dst))
    }

    fn emit_ref(&mut self, name: &str, indices: &[Expr], decl_ty: &Type) -> CompileResult<Operand> {
        if decl_ty.is_array() && !indices.is_empty() {
            let base = self.lookup(name)?;
            let (index, off) = self.emit_offset_walk(indices, decl_ty)?;
            self.push(Inst::Load {
                dst: off,
                base,
                index: Operand::Var(index),
            });
            Ok(Operand::Var(off))
        } else {
            Ok(Operand::Var(self.lookup(name)?))
        }
    }

    fn emit_store(
        &mut self,
        name: &str,
        indices: &[Expr],
        decl_ty: &Type,
        value: Operand,
    ) -> CompileResult<Operand> {
        let dst = self.lookup(name)?;
        if decl_ty.is_array() && !indices.is_empty() {
            let (index, _) = self.emit_offset_walk(indices, decl_ty)?;
            self.push(Inst::Store {
                base: dst,
                index: Operand::Var(index),
                src: value,
            });
        } else {
            self.push(Inst::Move { dst, src: value });
        }
        Ok(Operand::Var(dst))
    }

    /// Walk the declared dimensions of an indexed reference, multiplying
    /// each index by the byte size of the corresponding sub-array type and
    /// accumulating the byte offset. Returns the accumulator variable and a
    /// scratch temporary reusable as a load destination.
    fn emit_offset_walk(
        &mut self,
        indices: &[Expr],
        decl_ty: &Type,
    ) -> CompileResult<(VarId, VarId)> {
        let index = self.alloc_temp();
        let scratch = self.alloc_temp();
        self.push(Inst::Move {
            dst: index,
            src: Operand::Imm(0),
        });
        let mut ty = decl_ty;
        for e in indices {
            ty = ty.elem().ok_or_else(|| {
                CompilerError::internal("indexed reference walks past the declared dimensions")
            })?;
            let size = ty.byte_size().ok_or_else(|| {
                CompilerError::internal("sub-array type without a static byte size")
            })?;
            let value = self.emit_expr(e)?;
            self.push(Inst::Binary {
                dst: scratch,
                op: IrBinOp::Mul,
                lhs: value,
                rhs: Operand::Imm(size as i32),
            });
            self.push(Inst::Binary {
                dst: index,
                op: IrBinOp::Add,
                lhs: Operand::Var(index),
                rhs: Operand::Var(scratch),
            });
        }
        Ok((index, scratch))
    }
}

trait ToIr {
    fn to_ir(&self) -> IrUnOp;
}

impl ToIr for UnOp {
    fn to_ir(&self) -> IrUnOp {
        match self {
            UnOp::Neg => IrUnOp::Neg,
            UnOp::Not => IrUnOp::Not,
        }
    }
}

trait BinOpExt {
    fn to_ir(&self) -> CompileResult<IrBinOp>;
    fn as_ir_cond(&self) -> Option<CondOp>;
}

impl BinOpExt for BinOp {
    fn to_ir(&self) -> CompileResult<IrBinOp> {
        match self {
            BinOp::Eq => Ok(IrBinOp::Eq),
            BinOp::Ne => Ok(IrBinOp::Ne),
            BinOp::Lt => Ok(IrBinOp::Lt),
            BinOp::Gt => Ok(IrBinOp::Gt),
            BinOp::Or => Ok(IrBinOp::Or),
            BinOp::And => Ok(IrBinOp::And),
            BinOp::Add => Ok(IrBinOp::Add),
            BinOp::Sub => Ok(IrBinOp::Sub),
            BinOp::Mul => Ok(IrBinOp::Mul),
            BinOp::Div => Ok(IrBinOp::Div),
            BinOp::Rem => Ok(IrBinOp::Rem),
            BinOp::Comma | BinOp::Assign => Err(CompilerError::internal(
                "sequencing operator reached three-address emission",
            )),
        }
    }

    fn as_ir_cond(&self) -> Option<CondOp> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::VarKind;
    use mcc_common::Param;
    use pretty_assertions::assert_eq;

    fn max_func() -> FuncDef {
        // int f(int a, int b) { if (a > b) return a; else return b; }
        FuncDef {
            name: "f".into(),
            ret: Type::Int,
            params: vec![
                Param { name: "a".into(), ty: Type::Int },
                Param { name: "b".into(), ty: Type::Int },
            ],
            body: vec![Stmt::If {
                cond: Expr::binary(BinOp::Gt, Expr::var("a"), Expr::var("b")),
                then: Box::new(Stmt::Return(Expr::var("a"))),
                alt: Some(Box::new(Stmt::Return(Expr::var("b")))),
            }],
        }
    }

    #[test]
    fn if_else_with_returns_keeps_three_blocks() {
        let module = build_module(&vec![Decl::Func(max_func())]).unwrap();
        let func = &module.funcs[0];
        func.check_edges().unwrap();
        // the merge block and both post-return filler blocks are
        // unreachable and pruned; entry, then and else survive
        assert_eq!(func.layout.len(), 3);
        let entry = func.block(func.entry);
        assert!(matches!(entry.insts.last(), Some(Inst::Branch { op: CondOp::Gt, .. })));
        for &b in &func.layout[1..] {
            assert!(matches!(func.block(b).insts.last(), Some(Inst::Return { .. })));
        }
    }

    #[test]
    fn while_reevaluates_condition_in_test_block() {
        // int f(int n) { while (n > 0) n = n - 1; return n; }
        let f = FuncDef {
            name: "f".into(),
            ret: Type::Int,
            params: vec![Param { name: "n".into(), ty: Type::Int }],
            body: vec![
                Stmt::While {
                    test: Expr::binary(BinOp::Gt, Expr::var("n"), Expr::num(0)),
                    body: Box::new(Stmt::Expr(Expr::assign(
                        Expr::var("n"),
                        Expr::binary(BinOp::Sub, Expr::var("n"), Expr::num(1)),
                    ))),
                },
                Stmt::Return(Expr::var("n")),
            ],
        };
        let module = build_module(&vec![Decl::Func(f)]).unwrap();
        let func = &module.funcs[0];
        func.check_edges().unwrap();
        // entry jumps to the test block, which branches into the loop and
        // falls through to the break block
        let entry = func.block(func.entry);
        let test_blk = match entry.insts.last() {
            Some(Inst::Jump { target }) => *target,
            other => panic!("entry should end in a jump, got {:?}", other),
        };
        let test = func.block(test_blk);
        assert!(matches!(test.insts.last(), Some(Inst::Branch { .. })));
        let loop_blk = test.jump_out.unwrap();
        let break_blk = test.fall_out.unwrap();
        // the loop body falls back into the test block
        assert_eq!(func.block(loop_blk).fall_out, Some(test_blk));
        assert!(matches!(
            func.block(break_blk).insts.last(),
            Some(Inst::Return { .. })
        ));
    }

    #[test]
    fn named_call_arguments_are_copied_into_temporaries() {
        // int g(int x) { return h(x, 1); }
        let f = FuncDef {
            name: "g".into(),
            ret: Type::Int,
            params: vec![Param { name: "x".into(), ty: Type::Int }],
            body: vec![Stmt::Return(Expr::call(
                "h",
                vec![Expr::var("x"), Expr::num(1)],
            ))],
        };
        let module = build_module(&vec![Decl::Func(f)]).unwrap();
        let func = &module.funcs[0];
        let insts = &func.block(func.entry).insts;
        // move of x into a temp, then the call, then the return
        match &insts[0] {
            Inst::Move { dst, src } => {
                assert!(module.var(*dst).is_temp());
                assert_eq!(*src, Operand::Var(func.params[0]));
            }
            other => panic!("expected copy of named argument, got {:?}", other),
        }
        match &insts[1] {
            Inst::Call { args, .. } => {
                assert!(matches!(args[0], Operand::Var(v) if module.var(v).is_temp()));
                assert_eq!(args[1], Operand::Imm(1));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn array_argument_passes_base_address_uncopied() {
        // int g(int a[10]) { return h(a); } with a decayed to an open array
        let f = FuncDef {
            name: "g".into(),
            ret: Type::Int,
            params: vec![Param {
                name: "a".into(),
                ty: Type::open_array(Type::Int),
            }],
            body: vec![Stmt::Return(Expr::call(
                "h",
                vec![Expr::index("a", Type::open_array(Type::Int), vec![])],
            ))],
        };
        let module = build_module(&vec![Decl::Func(f)]).unwrap();
        let func = &module.funcs[0];
        let insts = &func.block(func.entry).insts;
        assert!(matches!(&insts[0], Inst::Call { args, .. }
            if args[0] == Operand::Var(func.params[0])));
    }

    #[test]
    fn multi_dimensional_index_accumulates_byte_offset() {
        // int m[3][4]; int f() { return m[1][2]; }
        let m_ty = Type::array(3, Type::array(4, Type::Int));
        let program = vec![
            Decl::Var { name: "m".into(), ty: m_ty.clone() },
            Decl::Func(FuncDef {
                name: "f".into(),
                ret: Type::Int,
                params: vec![],
                body: vec![Stmt::Return(Expr::index(
                    "m",
                    m_ty,
                    vec![Expr::num(1), Expr::num(2)],
                ))],
            }),
        ];
        let module = build_module(&program).unwrap();
        let func = &module.funcs[0];
        let insts = &func.block(func.entry).insts;
        // move 0; mul by 16 (row size); add; mul by 4; add; load
        let muls: Vec<i32> = insts
            .iter()
            .filter_map(|i| match i {
                Inst::Binary { op: IrBinOp::Mul, rhs: Operand::Imm(s), .. } => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(muls, vec![16, 4]);
        assert!(matches!(insts.last(), Some(Inst::Return { .. })));
        assert!(insts.iter().any(|i| matches!(i, Inst::Load { base, .. }
            if module.var(*base).kind == VarKind::Global)));
    }

    #[test]
    fn scopes_shadow_outward() {
        // int x; int f() { int x; x = 1; { int x; x = 2; } return x; }
        let program = vec![
            Decl::Var { name: "x".into(), ty: Type::Int },
            Decl::Func(FuncDef {
                name: "f".into(),
                ret: Type::Int,
                params: vec![],
                body: vec![
                    Stmt::Decl { name: "x".into(), ty: Type::Int },
                    Stmt::Expr(Expr::assign(Expr::var("x"), Expr::num(1))),
                    Stmt::Block(vec![
                        Stmt::Decl { name: "x".into(), ty: Type::Int },
                        Stmt::Expr(Expr::assign(Expr::var("x"), Expr::num(2))),
                    ]),
                    Stmt::Return(Expr::var("x")),
                ],
            }),
        ];
        let module = build_module(&program).unwrap();
        let func = &module.funcs[0];
        let insts = &func.block(func.entry).insts;
        let (outer, inner) = match (&insts[0], &insts[1]) {
            (Inst::Move { dst: a, .. }, Inst::Move { dst: b, .. }) => (*a, *b),
            other => panic!("expected two moves, got {:?}", other),
        };
        assert_ne!(outer, inner);
        // the return refers to the function-level x, not the block-level one
        assert!(matches!(insts.last(), Some(Inst::Return { value: Operand::Var(v) }) if *v == outer));
        assert_eq!(module.var(outer).kind, VarKind::Local);
    }

    #[test]
    fn unresolved_identifier_is_an_internal_error() {
        let f = FuncDef {
            name: "f".into(),
            ret: Type::Int,
            params: vec![],
            body: vec![Stmt::Return(Expr::var("nope"))],
        };
        let err = build_module(&vec![Decl::Func(f)]).unwrap_err();
        assert!(matches!(err, CompilerError::Internal { .. }));
    }
}
