//! MiniC Compiler - Common Types and Front-End Contract
//!
//! This crate contains the types shared between the (external) front end and
//! the middle/back end of the compiler: the resolved type model, the typed
//! syntax tree, and the error type used across all phases.

pub mod ast;
pub mod error;
pub mod types;

pub use ast::{BinOp, Decl, Expr, FuncDef, Param, Program, Stmt, UnOp};
pub use error::{CompileResult, CompilerError};
pub use types::Type;
