//! Resolved types attached to the syntax tree by the front end
//!
//! The core never re-validates types; it only consults them for storage
//! widths and for the dimension walk of indexed array references.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully resolved MiniC type.
///
/// `OpenArray` is the decayed form of an array parameter: its length is
/// unknown at the callee, so it has no byte size and is always handled as a
/// base address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    /// 32-bit signed integer
    Int,

    /// Fixed-length array `[len x elem]`
    Array { len: u32, elem: Box<Type> },

    /// Array of statically unknown length (decayed array parameter)
    OpenArray { elem: Box<Type> },

    /// Function type, kept on definitions for completeness
    Func { ret: Box<Type>, params: Vec<Type> },
}

impl Type {
    pub fn array(len: u32, elem: Type) -> Self {
        Type::Array { len, elem: Box::new(elem) }
    }

    pub fn open_array(elem: Type) -> Self {
        Type::OpenArray { elem: Box::new(elem) }
    }

    /// Size of a value of this type in bytes. `None` for types without a
    /// static size (open arrays, functions).
    pub fn byte_size(&self) -> Option<u32> {
        match self {
            Type::Int => Some(4),
            Type::Array { len, elem } => elem.byte_size().map(|s| s * len),
            Type::OpenArray { .. } => None,
            Type::Func { .. } => None,
        }
    }

    /// Element type of an array type, `None` otherwise.
    pub fn elem(&self) -> Option<&Type> {
        match self {
            Type::Array { elem, .. } | Type::OpenArray { elem } => Some(elem),
            _ => None,
        }
    }

    /// True for both fixed and open arrays. Array-typed variables are always
    /// materialized as base addresses, never copied by value.
    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. } | Type::OpenArray { .. })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Array { len, elem } => write!(f, "[{} x {}]", len, elem),
            Type::OpenArray { elem } => write!(f, "[? x {}]", elem),
            Type::Func { ret, params } => {
                write!(f, "{} (", ret)?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
        }
    }
}
