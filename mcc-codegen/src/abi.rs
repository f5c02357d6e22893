//! Calling-convention constants
//!
//! The MiniC ABI is the integer subset of the standard RISC-V convention:
//! up to eight arguments in `a0..a7`, result in `a0`, 16-byte-aligned stack
//! frames addressed through `sp` only (no frame pointer).

/// Hard limit on register-passed integer arguments. Exceeding it is a
/// contract violation of the source language, not a spill site.
pub const MAX_ARG_REGS: u32 = 8;

/// Bytes per frame slot / stack word.
pub const WORD_SIZE: u32 = 4;

/// Total frame size in bytes for a function with `slots` allocated frame
/// slots: room for the slots plus the saved return address, rounded up to
/// the 16-byte stack alignment.
pub fn frame_bytes(slots: u32) -> u32 {
    (slots / 4 + 1) * 16
}
