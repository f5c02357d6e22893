//! Error handling for the MiniC compiler core
//!
//! The middle/back end is fail-fast: any malformed input or broken internal
//! invariant indicates a defect in an earlier phase and aborts compilation.
//! Source-level diagnostics belong to the excluded front end.

use thiserror::Error;

/// Error type shared by every stage of the compiler core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompilerError {
    /// A broken internal invariant: a malformed CFG edge, an operand of an
    /// unexpected kind, an unresolved identifier in a validated tree.
    #[error("internal compiler error: {message}")]
    Internal { message: String },

    /// A back-end contract violation, e.g. a call with more integer
    /// arguments than the calling convention carries in registers.
    #[error("code generation error: {message}")]
    Codegen { message: String },
}

impl CompilerError {
    pub fn internal(message: impl Into<String>) -> Self {
        CompilerError::Internal { message: message.into() }
    }

    pub fn codegen(message: impl Into<String>) -> Self {
        CompilerError::Codegen { message: message.into() }
    }
}

/// Result alias used throughout the core
pub type CompileResult<T> = Result<T, CompilerError>;
