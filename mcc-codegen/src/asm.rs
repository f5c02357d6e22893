//! RISC-V integer register file
//!
//! The enum order is the allocator's preference order: callee-saved `s`
//! registers first, then caller-saved temporaries and argument registers.
//! `Ord` on `Reg` follows this order, which the allocator's deterministic
//! eviction policy and the ordered register sets rely on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A physical RISC-V integer register visible to the allocator.
///
/// `ra`, `sp` and the other platform registers are managed entirely by the
/// prologue/epilogue templates in the emitter and never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[rustfmt::skip]
pub enum Reg {
    X0,
    S0, S1, S2, S3, S4, S5, S6, S7, S8, S9, S10, S11,
    T0, T1, T2, T3, T4, T5, T6,
    A0, A1, A2, A3, A4, A5, A6, A7,
}

/// Every allocatable register, in eviction-preference order. `x0` is not
/// allocatable; it only appears as an explicit zero operand.
#[rustfmt::skip]
pub const ALLOCATABLE: [Reg; 27] = [
    Reg::S0, Reg::S1, Reg::S2, Reg::S3, Reg::S4, Reg::S5, Reg::S6, Reg::S7,
    Reg::S8, Reg::S9, Reg::S10, Reg::S11,
    Reg::T0, Reg::T1, Reg::T2, Reg::T3, Reg::T4, Reg::T5, Reg::T6,
    Reg::A0, Reg::A1, Reg::A2, Reg::A3, Reg::A4, Reg::A5, Reg::A6, Reg::A7,
];

/// Caller-saved registers: clobbered by any call, flushed before one.
#[rustfmt::skip]
pub const CALLER_SAVED: [Reg; 15] = [
    Reg::T0, Reg::T1, Reg::T2, Reg::T3, Reg::T4, Reg::T5, Reg::T6,
    Reg::A0, Reg::A1, Reg::A2, Reg::A3, Reg::A4, Reg::A5, Reg::A6, Reg::A7,
];

impl Reg {
    pub fn is_callee_saved(self) -> bool {
        self >= Reg::S0 && self <= Reg::S11
    }

    pub fn is_caller_saved(self) -> bool {
        self >= Reg::T0 && self <= Reg::A7
    }

    /// The register carrying integer argument `index` (a0..a7).
    pub fn arg(index: u32) -> Option<Reg> {
        match index {
            0 => Some(Reg::A0),
            1 => Some(Reg::A1),
            2 => Some(Reg::A2),
            3 => Some(Reg::A3),
            4 => Some(Reg::A4),
            5 => Some(Reg::A5),
            6 => Some(Reg::A6),
            7 => Some(Reg::A7),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::X0 => "x0",
            Reg::S0 => "s0",
            Reg::S1 => "s1",
            Reg::S2 => "s2",
            Reg::S3 => "s3",
            Reg::S4 => "s4",
            Reg::S5 => "s5",
            Reg::S6 => "s6",
            Reg::S7 => "s7",
            Reg::S8 => "s8",
            Reg::S9 => "s9",
            Reg::S10 => "s10",
            Reg::S11 => "s11",
            Reg::T0 => "t0",
            Reg::T1 => "t1",
            Reg::T2 => "t2",
            Reg::T3 => "t3",
            Reg::T4 => "t4",
            Reg::T5 => "t5",
            Reg::T6 => "t6",
            Reg::A0 => "a0",
            Reg::A1 => "a1",
            Reg::A2 => "a2",
            Reg::A3 => "a3",
            Reg::A4 => "a4",
            Reg::A5 => "a5",
            Reg::A6 => "a6",
            Reg::A7 => "a7",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
