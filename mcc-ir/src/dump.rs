//! Textual dump of the linear IR
//!
//! One global or function per paragraph, in declaration order, intended for
//! golden-file regression tests. Labels are printed only for blocks that are
//! jump targets; fall-through structure is implicit in the layout order.

use crate::ir::{BinOp, CondOp, Function, Inst, Item, Module, Operand, UnOp, VarId};
use std::fmt;

pub(crate) fn bin_op_str(op: BinOp) -> &'static str {
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

pub(crate) fn cond_op_str(op: CondOp) -> &'static str {
    match op {
        CondOp::Eq => "==",
        CondOp::Ne => "!=",
        CondOp::Lt => "<",
        CondOp::Gt => ">",
        CondOp::Or => "||",
        CondOp::And => "&&",
    }
}

pub(crate) fn un_op_str(op: UnOp) -> &'static str {
    match op {
        UnOp::Neg => "-",
        UnOp::Not => "!",
    }
}

struct VarName<'a>(&'a Module, VarId);

impl fmt::Display for VarName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.var(self.1).name)
    }
}

struct Opr<'a>(&'a Module, Operand);

impl fmt::Display for Opr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.1 {
            Operand::Imm(v) => write!(f, "{}", v),
            Operand::Var(v) => write!(f, "{}", VarName(self.0, v)),
        }
    }
}

fn write_decl(f: &mut fmt::Formatter<'_>, module: &Module, var: VarId, indent: bool) -> fmt::Result {
    if indent {
        write!(f, "\t")?;
    }
    write!(f, "var ")?;
    if let Some(width) = module.var(var).width {
        write!(f, "{} ", width)?;
    }
    writeln!(f, "{}", VarName(module, var))
}

fn write_inst(
    f: &mut fmt::Formatter<'_>,
    module: &Module,
    func: &Function,
    inst: &Inst,
) -> fmt::Result {
    match inst {
        Inst::Binary { dst, op, lhs, rhs } => writeln!(
            f,
            "\t{} = {} {} {}",
            VarName(module, *dst),
            Opr(module, *lhs),
            bin_op_str(*op),
            Opr(module, *rhs)
        ),
        Inst::Unary { dst, op, src } => writeln!(
            f,
            "\t{} = {} {}",
            VarName(module, *dst),
            un_op_str(*op),
            Opr(module, *src)
        ),
        Inst::Call { dst, callee, args } => {
            for arg in args {
                writeln!(f, "\tparam {}", Opr(module, *arg))?;
            }
            writeln!(f, "\t{} = f_{}", VarName(module, *dst), callee)
        }
        Inst::Move { dst, src } => {
            writeln!(f, "\t{} = {}", VarName(module, *dst), Opr(module, *src))
        }
        Inst::Load { dst, base, index } => writeln!(
            f,
            "\t{} = {}[{}]",
            VarName(module, *dst),
            VarName(module, *base),
            Opr(module, *index)
        ),
        Inst::Store { base, index, src } => writeln!(
            f,
            "\t{}[{}] = {}",
            VarName(module, *base),
            Opr(module, *index),
            Opr(module, *src)
        ),
        Inst::Jump { target } => writeln!(f, "\tgoto l{}", func.block(*target).label),
        Inst::Branch { op, lhs, rhs, target } => writeln!(
            f,
            "\tif ( {} {} {} ) goto l{}",
            Opr(module, *lhs),
            cond_op_str(*op),
            Opr(module, *rhs),
            func.block(*target).label
        ),
        Inst::Return { value } => writeln!(f, "\treturn {}", Opr(module, *value)),
    }
}

fn write_func(f: &mut fmt::Formatter<'_>, module: &Module, func: &Function) -> fmt::Result {
    writeln!(f, "f_{} [{}]", func.name, func.params.len())?;
    for &var in &func.locals {
        write_decl(f, module, var, true)?;
    }
    for &b in &func.layout {
        let blk = func.block(b);
        if !blk.jump_in.is_empty() {
            writeln!(f, "l{}:", blk.label)?;
        }
        for inst in &blk.insts {
            write_inst(f, module, func, inst)?;
        }
    }
    writeln!(f, "end f_{}", func.name)
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            match *item {
                Item::Global(var) => write_decl(f, self, var, false)?,
                Item::Func(func) => write_func(f, self, &self.funcs[func as usize])?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::build::build_module;
    use crate::ir::Module;
    use mcc_common::{BinOp, Decl, Expr, FuncDef, Param, Stmt, Type};
    use pretty_assertions::assert_eq;

    #[test]
    fn dump_is_stable_across_serde() {
        // the whole module (variables, blocks, edges, layout) survives a
        // serialization round trip with its dump text unchanged
        let program = vec![
            Decl::Var { name: "g".into(), ty: Type::Int },
            Decl::Func(FuncDef {
                name: "f".into(),
                ret: Type::Int,
                params: vec![Param { name: "a".into(), ty: Type::Int }],
                body: vec![
                    Stmt::If {
                        cond: Expr::binary(BinOp::Lt, Expr::var("a"), Expr::var("g")),
                        then: Box::new(Stmt::Return(Expr::var("a"))),
                        alt: None,
                    },
                    Stmt::Return(Expr::var("g")),
                ],
            }),
        ];
        let module = build_module(&program).unwrap();
        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_string(), module.to_string());
        back.funcs[0].check_edges().unwrap();
    }
}
