//! RISC-V assembly printing
//!
//! Accepts only the fully allocated subset of the register IR: every value
//! operand is a physical register, an immediate where the instruction set
//! has an immediate form, or a frame slot / global on the spill and address
//! operations. Anything else left over is a compiler fault and reported as
//! an internal error rather than printed.

use crate::rir::{Function, Global, Module, Op, Opr};
use mcc_codegen::{frame_bytes, Reg};
use mcc_common::{CompileResult, CompilerError};
use mcc_ir::{BinOp, CondOp, UnOp};

pub fn emit_module(module: &Module) -> CompileResult<String> {
    let mut out = String::new();
    for (id, global) in module.globals.iter().enumerate() {
        emit_global(&mut out, id, global);
    }
    for func in &module.funcs {
        emit_function(&mut out, func)?;
    }
    Ok(out)
}

fn emit_global(out: &mut String, id: usize, global: &Global) {
    let v = format!("v{}", id);
    if global.width > 0 {
        out.push_str(&format!("\t.comm\t{}, {}, 4\n", v, global.width));
    } else {
        out.push_str(&format!("\t.global\t{}\n", v));
        out.push_str("\t.section\t.sdata\n");
        out.push_str("\t.align\t2\n");
        out.push_str(&format!("\t.type\t{}, @object\n", v));
        out.push_str(&format!("\t.size\t{}, 4\n", v));
        out.push_str(&format!("{}:\n", v));
        out.push_str("\t.word\t0\n");
    }
    out.push('\n');
}

fn emit_function(out: &mut String, func: &Function) -> CompileResult<()> {
    let stk = frame_bytes(func.frame_size);
    out.push_str("\t.text\n");
    out.push_str("\t.align\t2\n");
    out.push_str(&format!("\t.global\t{}\n", func.name));
    out.push_str(&format!("\t.type\t{}, @function\n", func.name));
    out.push_str(&format!("{}:\n", func.name));
    out.push_str(&format!("\taddi\tsp, sp, -{}\n", stk));
    out.push_str(&format!("\tsw\tra, {}(sp)\n", stk - 4));
    for blk in &func.blocks {
        out.push_str(&format!(".l{}:\n", blk.label));
        for op in &blk.ops {
            emit_op(out, func, op, stk)?;
        }
    }
    out.push_str(&format!("\t.size\t{}, .-{}\n", func.name, func.name));
    out.push('\n');
    Ok(())
}

fn emit_op(out: &mut String, func: &Function, op: &Op, stk: u32) -> CompileResult<()> {
    match op {
        Op::Binary { op, dst, lhs, rhs } => emit_binary(out, *op, *dst, *lhs, *rhs),
        Op::Unary { op, dst, src } => {
            let (d, s) = (reg(*dst)?, reg(*src)?);
            let mnemonic = match op {
                UnOp::Neg => "neg",
                UnOp::Not => "seqz",
            };
            out.push_str(&format!("\t{}\t{}, {}\n", mnemonic, d, s));
            Ok(())
        }
        Op::Mov { dst, src } => {
            let d = reg(*dst)?;
            match src {
                Opr::Imm(v) => out.push_str(&format!("\tli\t{}, {}\n", d, v)),
                _ => out.push_str(&format!("\tmv\t{}, {}\n", d, reg(*src)?)),
            }
            Ok(())
        }
        Op::IdxLoad { dst, base, offset } => {
            let (d, b, off) = (reg(*dst)?, reg(*base)?, imm(*offset)?);
            out.push_str(&format!("\tlw\t{}, {}({})\n", d, off, b));
            Ok(())
        }
        Op::IdxStore { base, offset, src } => {
            let (b, off, s) = (reg(*base)?, imm(*offset)?, reg(*src)?);
            out.push_str(&format!("\tsw\t{}, {}({})\n", s, off, b));
            Ok(())
        }
        Op::Branch { op, lhs, rhs, target } => {
            let mnemonic = match op {
                CondOp::Eq => "beq",
                CondOp::Ne => "bne",
                CondOp::Lt => "blt",
                CondOp::Gt => "bgt",
                CondOp::Or | CondOp::And => {
                    return Err(CompilerError::internal(
                        "logical branch survived lowering",
                    ))
                }
            };
            let (l, r) = (reg(*lhs)?, reg(*rhs)?);
            let label = func.block(*target).label;
            out.push_str(&format!("\t{}\t{}, {}, .l{}\n", mnemonic, l, r, label));
            Ok(())
        }
        Op::Jump { target } => {
            out.push_str(&format!("\tj\t.l{}\n", func.block(*target).label));
            Ok(())
        }
        Op::Call { callee } => {
            out.push_str(&format!("\tcall\t{}\n", callee));
            Ok(())
        }
        Op::Store { src, slot } => {
            out.push_str(&format!("\tsw\t{}, {}(sp)\n", reg(*src)?, slot * 4));
            Ok(())
        }
        Op::Load { src, dst } => {
            let d = reg(*dst)?;
            match src {
                Opr::Global(g) => {
                    out.push_str(&format!("\tlui\t{}, %hi(v{})\n", d, g));
                    out.push_str(&format!("\tlw\t{}, %lo(v{})({})\n", d, g, d));
                }
                Opr::Slot(slot) => {
                    out.push_str(&format!("\tlw\t{}, {}(sp)\n", d, slot * 4));
                }
                _ => {
                    return Err(CompilerError::internal(format!(
                        "load from non-memory operand {}",
                        src
                    )))
                }
            }
            Ok(())
        }
        Op::LoadAddr { src, dst } => {
            let d = reg(*dst)?;
            match src {
                Opr::Global(g) => {
                    out.push_str(&format!("\tlui\t{}, %hi(v{})\n", d, g));
                    out.push_str(&format!("\taddi\t{}, {}, %lo(v{})\n", d, d, g));
                }
                Opr::Slot(slot) => {
                    out.push_str(&format!("\taddi\t{}, sp, {}\n", d, slot * 4));
                }
                _ => {
                    return Err(CompilerError::internal(format!(
                        "address of non-memory operand {}",
                        src
                    )))
                }
            }
            Ok(())
        }
        Op::Ret => {
            out.push_str(&format!("\tlw\tra, {}(sp)\n", stk - 4));
            out.push_str(&format!("\taddi\tsp, sp, {}\n", stk));
            out.push_str("\tjr\tra\n");
            Ok(())
        }
        Op::BeginParams
        | Op::SetParam { .. }
        | Op::GetParam { .. }
        | Op::SetRet { .. }
        | Op::GetRet { .. } => Err(CompilerError::internal(format!(
            "calling-convention pseudo-op {:?} survived allocation",
            op
        ))),
    }
}

fn emit_binary(out: &mut String, op: BinOp, dst: Opr, lhs: Opr, rhs: Opr) -> CompileResult<()> {
    let d = reg(dst)?;
    let l = reg(lhs)?;
    match op {
        // no set-equal instruction; xor then test against zero
        BinOp::Eq => {
            out.push_str(&format!("\txor\t{}, {}, {}\n", d, l, reg(rhs)?));
            out.push_str(&format!("\tseqz\t{}, {}\n", d, d));
        }
        BinOp::Ne => {
            out.push_str(&format!("\txor\t{}, {}, {}\n", d, l, reg(rhs)?));
            out.push_str(&format!("\tsnez\t{}, {}\n", d, d));
        }
        BinOp::Lt => match rhs {
            Opr::Imm(v) => out.push_str(&format!("\tslti\t{}, {}, {}\n", d, l, v)),
            _ => out.push_str(&format!("\tslt\t{}, {}, {}\n", d, l, reg(rhs)?)),
        },
        BinOp::Gt => out.push_str(&format!("\tsgt\t{}, {}, {}\n", d, l, reg(rhs)?)),
        BinOp::Or => {
            out.push_str(&format!("\tor\t{}, {}, {}\n", d, l, reg(rhs)?));
            out.push_str(&format!("\tsnez\t{}, {}\n", d, d));
        }
        // both operands are already booleans here, so a product is a
        // conjunction
        BinOp::And => {
            out.push_str(&format!("\tmul\t{}, {}, {}\n", d, l, reg(rhs)?));
            out.push_str(&format!("\tsnez\t{}, {}\n", d, d));
        }
        BinOp::Add => match rhs {
            Opr::Imm(v) => out.push_str(&format!("\taddi\t{}, {}, {}\n", d, l, v)),
            _ => out.push_str(&format!("\tadd\t{}, {}, {}\n", d, l, reg(rhs)?)),
        },
        BinOp::Sub => out.push_str(&format!("\tsub\t{}, {}, {}\n", d, l, reg(rhs)?)),
        BinOp::Mul => out.push_str(&format!("\tmul\t{}, {}, {}\n", d, l, reg(rhs)?)),
        BinOp::Div => out.push_str(&format!("\tdiv\t{}, {}, {}\n", d, l, reg(rhs)?)),
        BinOp::Rem => out.push_str(&format!("\trem\t{}, {}, {}\n", d, l, reg(rhs)?)),
    }
    Ok(())
}

fn reg(opr: Opr) -> CompileResult<Reg> {
    match opr {
        Opr::Phys(r) => Ok(r),
        _ => Err(CompilerError::internal(format!(
            "unallocated operand {} reached assembly emission",
            opr
        ))),
    }
}

fn imm(opr: Opr) -> CompileResult<i32> {
    match opr {
        Opr::Imm(v) => Ok(v),
        _ => Err(CompilerError::internal(format!(
            "expected an immediate, got {}",
            opr
        ))),
    }
}
