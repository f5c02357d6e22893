//! Typed syntax tree handed to the middle end
//!
//! This is the contract with the excluded front end: parsing and type
//! checking have already run, every lvalue/indexing rule has been validated,
//! and every reference carries the declared type of the variable it names.
//! In MiniC every scalar expression is `int`, so the declared type on
//! references is the only annotation the IR builder ever consults.

use crate::types::Type;
use serde::{Deserialize, Serialize};

/// A whole translation unit, in declaration order.
pub type Program = Vec<Decl>;

/// Top-level declaration: a global variable or a function definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decl {
    Var { name: String, ty: Type },
    Func(FuncDef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDef {
    pub name: String,
    pub ret: Type,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

/// A function parameter. Array parameters arrive already decayed to
/// [`Type::OpenArray`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Local variable declaration, binding in the innermost scope
    Decl { name: String, ty: Type },
    If {
        cond: Expr,
        then: Box<Stmt>,
        alt: Option<Box<Stmt>>,
    },
    While { test: Expr, body: Box<Stmt> },
    Return(Expr),
    Block(Vec<Stmt>),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnOp, arg: Box<Expr> },
    Call { callee: String, args: Vec<Expr> },
    /// A (possibly indexed) reference to a named variable. `decl_ty` is the
    /// declared type of the variable, resolved by the front end; the
    /// dimension walk of indexed accesses reads element sizes from it.
    Ref {
        name: String,
        indices: Vec<Expr>,
        decl_ty: Type,
    },
    Num(i32),
}

impl Expr {
    pub fn num(n: i32) -> Self {
        Expr::Num(n)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Ref {
            name: name.into(),
            indices: Vec::new(),
            decl_ty: Type::Int,
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnOp, arg: Expr) -> Self {
        Expr::Unary { op, arg: Box::new(arg) }
    }

    pub fn assign(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinOp::Assign, lhs, rhs)
    }

    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call { callee: callee.into(), args }
    }

    pub fn index(name: impl Into<String>, decl_ty: Type, indices: Vec<Expr>) -> Self {
        Expr::Ref { name: name.into(), indices, decl_ty }
    }
}

/// Binary operators, including the sequencing/assignment forms the
/// expression grammar folds into binary nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Comma,
    Assign,
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
    /// Comparison and logical operators: the forms a conditional branch can
    /// carry directly.
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Or | BinOp::And
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}
