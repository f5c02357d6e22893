//! MiniC Compiler - RISC-V Register Model and ABI
//!
//! This crate defines the physical register file the allocator works against
//! and the few calling-convention constants shared between the register-IR
//! lowering, the allocator, and the assembly emitter.

pub mod abi;
pub mod asm;

pub use abi::{frame_bytes, MAX_ARG_REGS, WORD_SIZE};
pub use asm::{Reg, ALLOCATABLE, CALLER_SAVED};
