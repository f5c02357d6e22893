//! Constant propagation and folding
//!
//! Forward data flow over a per-variable lattice of unknown /
//! constant(v) / varying. Each function is processed in two phases: an
//! analysis phase propagates per-block fact tables over a worklist seeded
//! with the entry block until they stabilize, then a rewrite phase walks
//! every block once with the stable input facts, substituting known
//! operands, folding fully-constant operations into moves, and resolving
//! statically decided branches into jumps. A call invalidates every global
//! variable's constant-ness, never a local's.

use crate::ir::{BinOp, BlockId, Function, Inst, Module, Operand, UnOp, VarId, Variable};
use log::{debug, trace};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fact {
    Const(i32),
    Varying,
}

/// Variables absent from the table are unknown (never yet assigned on any
/// analyzed path).
type FactTable = HashMap<VarId, Fact>;

/// Run one folding pass over the whole module. Returns true when control
/// flow changed (a branch was statically resolved), in which case another
/// pass may fold further.
pub fn run(module: &mut Module) -> bool {
    let vars = &module.vars;
    let mut flow_changed = false;
    for func in module.funcs.iter_mut() {
        flow_changed |= run_on_function(vars, func);
    }
    flow_changed
}

fn run_on_function(vars: &[Variable], func: &mut Function) -> bool {
    // analysis phase: no mutation, propagate until output tables stabilize
    let mut in_facts: HashMap<BlockId, FactTable> = HashMap::new();
    let mut out_facts: HashMap<BlockId, FactTable> = HashMap::new();
    let mut worklist: BTreeSet<BlockId> = BTreeSet::new();
    worklist.insert(func.entry);
    while let Some(b) = worklist.pop_first() {
        let mut cur = FactTable::new();
        for p in func.preds(b) {
            let Some(out) = out_facts.get(&p) else { continue };
            for (&v, &fact) in out {
                match cur.get(&v) {
                    None => {
                        cur.insert(v, fact);
                    }
                    Some(&existing) if existing != fact => {
                        cur.insert(v, Fact::Varying);
                    }
                    Some(_) => {}
                }
            }
        }
        in_facts.insert(b, cur.clone());
        for inst in &func.block(b).insts {
            simulate(vars, inst, &mut cur);
        }
        if out_facts.get(&b) != Some(&cur) {
            out_facts.insert(b, cur);
            for s in func.succs(b) {
                worklist.insert(s);
            }
        }
    }

    // rewrite phase: one walk per block with the stable input facts
    let mut flow_changed = false;
    for b in func.layout.clone() {
        let mut facts = in_facts.remove(&b).unwrap_or_default();
        flow_changed |= rewrite_block(vars, func, b, &mut facts);
    }
    if flow_changed {
        debug!("constant folder changed control flow in f_{}", func.name);
    }
    func.arrange_blocks();
    flow_changed
}

fn fact_of(facts: &FactTable, opr: Operand) -> Option<i32> {
    match opr {
        Operand::Imm(v) => Some(v),
        Operand::Var(v) => match facts.get(&v) {
            Some(Fact::Const(c)) => Some(*c),
            _ => None,
        },
    }
}

/// Substitute a statically known operand with its immediate value.
fn subst(facts: &FactTable, opr: Operand) -> Operand {
    match fact_of(facts, opr) {
        Some(c) => Operand::Imm(c),
        None => opr,
    }
}

fn eval_bin(op: BinOp, lhs: i32, rhs: i32) -> Option<i32> {
    let val = match op {
        BinOp::Eq => (lhs == rhs) as i32,
        BinOp::Ne => (lhs != rhs) as i32,
        BinOp::Lt => (lhs < rhs) as i32,
        BinOp::Gt => (lhs > rhs) as i32,
        BinOp::Or => (lhs != 0 || rhs != 0) as i32,
        BinOp::And => (lhs != 0 && rhs != 0) as i32,
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        // division by zero cannot be folded; the operation keeps its
        // (undefined) runtime behavior
        BinOp::Div => return (rhs != 0).then(|| lhs.wrapping_div(rhs)),
        BinOp::Rem => return (rhs != 0).then(|| lhs.wrapping_rem(rhs)),
    };
    Some(val)
}

fn eval_un(op: UnOp, src: i32) -> i32 {
    match op {
        UnOp::Neg => src.wrapping_neg(),
        UnOp::Not => (src == 0) as i32,
    }
}

/// Mirror of the rewrite handlers without mutation, used by the analysis
/// phase.
fn simulate(vars: &[Variable], inst: &Inst, facts: &mut FactTable) {
    match inst {
        Inst::Binary { dst, op, lhs, rhs } => {
            let folded = fact_of(facts, *lhs)
                .zip(fact_of(facts, *rhs))
                .and_then(|(l, r)| eval_bin(*op, l, r));
            facts.insert(*dst, folded.map_or(Fact::Varying, Fact::Const));
        }
        Inst::Unary { dst, op, src } => {
            let folded = fact_of(facts, *src).map(|v| eval_un(*op, v));
            facts.insert(*dst, folded.map_or(Fact::Varying, Fact::Const));
        }
        Inst::Move { dst, src } => {
            let fact = fact_of(facts, *src).map_or(Fact::Varying, Fact::Const);
            facts.insert(*dst, fact);
        }
        Inst::Load { dst, .. } => {
            facts.insert(*dst, Fact::Varying);
        }
        Inst::Call { dst, .. } => {
            facts.insert(*dst, Fact::Varying);
            invalidate_globals(vars, facts);
        }
        Inst::Store { .. } | Inst::Jump { .. } | Inst::Branch { .. } | Inst::Return { .. } => {}
    }
}

/// Unknown call side effects: every global the table knows about becomes
/// varying.
fn invalidate_globals(vars: &[Variable], facts: &mut FactTable) {
    for (&v, fact) in facts.iter_mut() {
        if vars[v as usize].is_global() {
            *fact = Fact::Varying;
        }
    }
}

fn rewrite_block(
    vars: &[Variable],
    func: &mut Function,
    b: BlockId,
    facts: &mut FactTable,
) -> bool {
    let mut flow_changed = false;
    let mut i = 0;
    // the cursor advances only past surviving instructions; a removal
    // shifts the successor into the current slot
    while i < func.block(b).insts.len() {
        let inst = func.block(b).insts[i].clone();
        let rewritten = match inst {
            Inst::Binary { dst, op, lhs, rhs } => {
                if let Some(c) = fact_of(facts, lhs)
                    .zip(fact_of(facts, rhs))
                    .and_then(|(l, r)| eval_bin(op, l, r))
                {
                    trace!("folding {:?} to {}", op, c);
                    facts.insert(dst, Fact::Const(c));
                    Inst::Move { dst, src: Operand::Imm(c) }
                } else {
                    facts.insert(dst, Fact::Varying);
                    Inst::Binary {
                        dst,
                        op,
                        lhs: subst(facts, lhs),
                        rhs: subst(facts, rhs),
                    }
                }
            }
            Inst::Unary { dst, op, src } => match fact_of(facts, src) {
                Some(v) => {
                    let c = eval_un(op, v);
                    facts.insert(dst, Fact::Const(c));
                    Inst::Move { dst, src: Operand::Imm(c) }
                }
                None => {
                    facts.insert(dst, Fact::Varying);
                    Inst::Unary { dst, op, src }
                }
            },
            Inst::Move { dst, src } => {
                let src = subst(facts, src);
                let fact = match src {
                    Operand::Imm(c) => Fact::Const(c),
                    Operand::Var(_) => Fact::Varying,
                };
                facts.insert(dst, fact);
                Inst::Move { dst, src }
            }
            Inst::Load { dst, base, index } => {
                facts.insert(dst, Fact::Varying);
                Inst::Load { dst, base, index: subst(facts, index) }
            }
            Inst::Store { base, index, src } => Inst::Store {
                base,
                index: subst(facts, index),
                src: subst(facts, src),
            },
            Inst::Call { dst, callee, args } => {
                let args = args.iter().map(|&a| subst(facts, a)).collect();
                facts.insert(dst, Fact::Varying);
                invalidate_globals(vars, facts);
                Inst::Call { dst, callee, args }
            }
            Inst::Branch { op, lhs, rhs, target } => {
                let lhs = subst(facts, lhs);
                let rhs = subst(facts, rhs);
                if let (Operand::Imm(l), Operand::Imm(r)) = (lhs, rhs) {
                    flow_changed = true;
                    if op.eval(l, r) {
                        // always taken: drop the fall-through edge and
                        // turn the branch into a jump
                        func.unfall(b);
                        func.block_mut(b).insts[i] = Inst::Jump { target };
                        i += 1;
                    } else {
                        // never taken: drop the jump edge and the branch
                        func.unjump(b);
                        func.block_mut(b).insts.remove(i);
                    }
                    continue;
                }
                Inst::Branch { op, lhs, rhs, target }
            }
            Inst::Jump { target } => Inst::Jump { target },
            Inst::Return { value } => Inst::Return { value: subst(facts, value) },
        };
        func.block_mut(b).insts[i] = rewritten;
        i += 1;
    }
    flow_changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::build_module;
    use mcc_common::{BinOp as AstBinOp, Decl, Expr, FuncDef, Param, Stmt, Type};
    use pretty_assertions::assert_eq;

    fn func_of(body: Vec<Stmt>) -> Vec<Decl> {
        vec![Decl::Func(FuncDef {
            name: "f".into(),
            ret: Type::Int,
            params: vec![],
            body,
        })]
    }

    #[test]
    fn folds_constant_addition_into_a_move() {
        // int x; x = 1 + 2; return 0;
        let program = func_of(vec![
            Stmt::Decl { name: "x".into(), ty: Type::Int },
            Stmt::Expr(Expr::assign(
                Expr::var("x"),
                Expr::binary(AstBinOp::Add, Expr::num(1), Expr::num(2)),
            )),
            Stmt::Return(Expr::num(0)),
        ]);
        let mut module = build_module(&program).unwrap();
        run(&mut module);
        let func = &module.funcs[0];
        let insts = &func.block(func.entry).insts;
        assert_eq!(
            insts
                .iter()
                .filter(|i| matches!(i, Inst::Binary { .. }))
                .count(),
            0
        );
        // both the temp and x now receive the folded value
        assert!(insts
            .iter()
            .all(|i| !matches!(i, Inst::Move { src: Operand::Var(_), .. })));
        assert!(insts.iter().any(|i| matches!(i, Inst::Move { src: Operand::Imm(3), .. })));
    }

    #[test]
    fn resolves_static_branch_and_prunes_untaken_arm() {
        // if (1 < 2) return 1; else return 2;
        let program = func_of(vec![Stmt::If {
            cond: Expr::binary(AstBinOp::Lt, Expr::num(1), Expr::num(2)),
            then: Box::new(Stmt::Return(Expr::num(1))),
            alt: Some(Box::new(Stmt::Return(Expr::num(2)))),
        }]);
        let mut module = build_module(&program).unwrap();
        let changed = run(&mut module);
        assert!(changed);
        let func = &module.funcs[0];
        func.check_edges().unwrap();
        // only the entry (now ending in a jump) and the taken arm survive
        assert_eq!(func.layout.len(), 2);
        assert!(matches!(
            func.block(func.entry).insts.last(),
            Some(Inst::Jump { .. })
        ));
        let taken = func.layout[1];
        assert_eq!(
            func.block(taken).insts,
            vec![Inst::Return { value: Operand::Imm(1) }]
        );
        // a second pass over the stable output changes nothing
        assert!(!run(&mut module));
    }

    #[test]
    fn merge_keeps_agreeing_constants_and_poisons_disagreeing_ones() {
        // int a; int b;
        // if (c) { a = 1; b = 1; } else { a = 1; b = 2; }
        // return a + b;
        let program = vec![Decl::Func(FuncDef {
            name: "f".into(),
            ret: Type::Int,
            params: vec![Param { name: "c".into(), ty: Type::Int }],
            body: vec![
                Stmt::Decl { name: "a".into(), ty: Type::Int },
                Stmt::Decl { name: "b".into(), ty: Type::Int },
                Stmt::If {
                    cond: Expr::var("c"),
                    then: Box::new(Stmt::Block(vec![
                        Stmt::Expr(Expr::assign(Expr::var("a"), Expr::num(1))),
                        Stmt::Expr(Expr::assign(Expr::var("b"), Expr::num(1))),
                    ])),
                    alt: Some(Box::new(Stmt::Block(vec![
                        Stmt::Expr(Expr::assign(Expr::var("a"), Expr::num(1))),
                        Stmt::Expr(Expr::assign(Expr::var("b"), Expr::num(2))),
                    ]))),
                },
                Stmt::Return(Expr::binary(AstBinOp::Add, Expr::var("a"), Expr::var("b"))),
            ],
        })];
        let mut module = build_module(&program).unwrap();
        run(&mut module);
        let func = &module.funcs[0];
        // the merge block adds a (known 1) to b (conflicting): the addition
        // survives with its left operand substituted
        let merge_add = func
            .layout
            .iter()
            .flat_map(|&b| &func.block(b).insts)
            .find_map(|i| match i {
                Inst::Binary { op: BinOp::Add, lhs, rhs, .. } => Some((*lhs, *rhs)),
                _ => None,
            })
            .expect("merge addition should survive");
        assert_eq!(merge_add.0, Operand::Imm(1));
        assert!(matches!(merge_add.1, Operand::Var(_)));
    }

    #[test]
    fn call_invalidates_globals_but_not_locals() {
        // int g; int f() { int x; g = 1; x = 2; h(); return g + x; }
        let program = vec![
            Decl::Var { name: "g".into(), ty: Type::Int },
            Decl::Func(FuncDef {
                name: "f".into(),
                ret: Type::Int,
                params: vec![],
                body: vec![
                    Stmt::Decl { name: "x".into(), ty: Type::Int },
                    Stmt::Expr(Expr::assign(Expr::var("g"), Expr::num(1))),
                    Stmt::Expr(Expr::assign(Expr::var("x"), Expr::num(2))),
                    Stmt::Expr(Expr::call("h", vec![])),
                    Stmt::Return(Expr::binary(AstBinOp::Add, Expr::var("g"), Expr::var("x"))),
                ],
            }),
        ];
        let mut module = build_module(&program).unwrap();
        run(&mut module);
        let func = &module.funcs[0];
        let add = func
            .layout
            .iter()
            .flat_map(|&b| &func.block(b).insts)
            .find_map(|i| match i {
                Inst::Binary { op: BinOp::Add, lhs, rhs, .. } => Some((*lhs, *rhs)),
                _ => None,
            })
            .expect("addition should survive");
        // the global read stays a variable reference, the local folds to 2
        assert!(matches!(add.0, Operand::Var(_)));
        assert_eq!(add.1, Operand::Imm(2));
    }

    #[test]
    fn division_by_zero_is_never_folded() {
        let program = func_of(vec![Stmt::Return(Expr::binary(
            AstBinOp::Div,
            Expr::num(1),
            Expr::num(0),
        ))]);
        let mut module = build_module(&program).unwrap();
        run(&mut module);
        let func = &module.funcs[0];
        assert!(func
            .block(func.entry)
            .insts
            .iter()
            .any(|i| matches!(i, Inst::Binary { op: BinOp::Div, .. })));
    }

    #[test]
    fn while_false_loop_folds_away() {
        // while (0) x = 1; return 7;
        let program = func_of(vec![
            Stmt::Decl { name: "x".into(), ty: Type::Int },
            Stmt::While {
                test: Expr::num(0),
                body: Box::new(Stmt::Expr(Expr::assign(Expr::var("x"), Expr::num(1)))),
            },
            Stmt::Return(Expr::num(7)),
        ]);
        let mut module = build_module(&program).unwrap();
        while run(&mut module) {}
        let func = &module.funcs[0];
        func.check_edges().unwrap();
        // the loop body is unreachable and pruned
        assert!(func.layout.iter().all(|&b| {
            func.block(b)
                .insts
                .iter()
                .all(|i| !matches!(i, Inst::Move { src: Operand::Imm(1), .. }))
        }));
        assert!(func.layout.iter().any(|&b| {
            func.block(b)
                .insts
                .iter()
                .any(|i| matches!(i, Inst::Return { value: Operand::Imm(7) }))
        }));
    }
}
