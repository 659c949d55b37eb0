//! Lazily evaluated EFLAGS
//!
//! Arithmetic instructions record the operation, width, inputs and result
//! instead of computing CF/PF/AF/ZF/SF/OF immediately. A flag is derived
//! only when something reads it (a conditional branch, SETcc, PUSHF, ...).
//! Bits not covered by the last operation's dirty mask live in `raw`.

use serde::{Deserialize, Serialize};

use crate::instruction::Condition;
use crate::operand::OperandSize;

// Flag bit positions in EFLAGS
pub const FLAG_CF: u32 = 0x0001; // Carry Flag
pub const FLAG_PF: u32 = 0x0004; // Parity Flag
pub const FLAG_AF: u32 = 0x0010; // Auxiliary Carry Flag
pub const FLAG_ZF: u32 = 0x0040; // Zero Flag
pub const FLAG_SF: u32 = 0x0080; // Sign Flag
pub const FLAG_TF: u32 = 0x0100; // Trap Flag
pub const FLAG_IF: u32 = 0x0200; // Interrupt Enable Flag
pub const FLAG_DF: u32 = 0x0400; // Direction Flag
pub const FLAG_OF: u32 = 0x0800; // Overflow Flag
pub const FLAG_IOPL: u32 = 0x3000; // I/O Privilege Level
pub const FLAG_NT: u32 = 0x4000; // Nested Task
pub const FLAG_RF: u32 = 0x0001_0000; // Resume Flag
pub const FLAG_VM: u32 = 0x0002_0000; // Virtual-8086 Mode
pub const FLAG_AC: u32 = 0x0004_0000; // Alignment Check
pub const FLAG_ID: u32 = 0x0020_0000; // CPUID available

/// Bit 1 always reads as one
pub const FLAGS_FIXED: u32 = 0x0002;

/// The six status flags produced by the ALU
pub const ARITH_FLAGS: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

/// Which identity derives CF/OF/AF from the recorded triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagOp {
    Add,
    Adc,
    Sub,
    Sbb,
    Neg,
    Logic,
    /// INC leaves CF untouched
    Inc,
    /// DEC leaves CF untouched
    Dec,
    /// Only SF/ZF/PF come from the result; the instruction sets the rest
    Result,
}

impl FlagOp {
    /// Flags this operation defers to the lazy state
    pub const fn dirty_mask(self) -> u32 {
        match self {
            FlagOp::Inc | FlagOp::Dec => ARITH_FLAGS & !FLAG_CF,
            FlagOp::Result => FLAG_SF | FLAG_ZF | FLAG_PF,
            _ => ARITH_FLAGS,
        }
    }
}

/// Inputs of the last flag-affecting operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyFlags {
    pub op: FlagOp,
    pub size: OperandSize,
    pub val1: u32,
    pub val2: u32,
    pub result: u32,
    /// CF as it was when ADC/SBB started
    pub carry_in: bool,
}

impl Default for LazyFlags {
    fn default() -> Self {
        Self {
            op: FlagOp::Logic,
            size: OperandSize::Byte,
            val1: 0,
            val2: 0,
            result: 0,
            carry_in: false,
        }
    }
}

/// Calculate parity (true if even number of 1 bits in low byte)
#[inline]
pub fn parity(value: u32) -> bool {
    (value as u8).count_ones() & 1 == 0
}

/// EFLAGS with deferred status-flag computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagsState {
    /// Materialised bits; status bits here are stale where `dirty` is set
    raw: u32,
    /// Status bits that must be derived from `lazy`
    dirty: u32,
    lazy: LazyFlags,
}

impl Default for FlagsState {
    fn default() -> Self {
        Self::new()
    }
}

impl FlagsState {
    pub const fn new() -> Self {
        Self {
            raw: FLAGS_FIXED,
            dirty: 0,
            lazy: LazyFlags {
                op: FlagOp::Logic,
                size: OperandSize::Byte,
                val1: 0,
                val2: 0,
                result: 0,
                carry_in: false,
            },
        }
    }

    /// Record a two-input operation
    pub fn set_flags(&mut self, op: FlagOp, size: OperandSize, val1: u32, val2: u32, result: u32) {
        self.record(op, size, val1, val2, result, false);
    }

    /// Record ADC/SBB along with the carry they consumed
    pub fn set_flags_with_carry(
        &mut self,
        op: FlagOp,
        size: OperandSize,
        val1: u32,
        val2: u32,
        result: u32,
        carry_in: bool,
    ) {
        self.record(op, size, val1, val2, result, carry_in);
    }

    /// Record a single-input operation (INC/DEC/NEG)
    pub fn set_flags_op1(&mut self, op: FlagOp, size: OperandSize, val1: u32, result: u32) {
        let val2 = match op {
            FlagOp::Inc | FlagOp::Dec => 1,
            _ => 0,
        };
        self.record(op, size, val1, val2, result, false);
    }

    /// Record an operation whose flags depend on the result only
    pub fn set_flags_result(&mut self, op: FlagOp, size: OperandSize, result: u32) {
        self.record(op, size, 0, 0, result, false);
    }

    fn record(
        &mut self,
        op: FlagOp,
        size: OperandSize,
        val1: u32,
        val2: u32,
        result: u32,
        carry_in: bool,
    ) {
        let dirty = op.dirty_mask();
        // Bits the new op leaves alone must survive the overwrite
        self.materialize(ARITH_FLAGS & !dirty);
        let mask = size.mask();
        self.lazy = LazyFlags {
            op,
            size,
            val1: val1 & mask,
            val2: val2 & mask,
            result: result & mask,
            carry_in,
        };
        self.dirty = dirty;
    }

    /// Fold pending bits in `mask` into `raw`
    fn materialize(&mut self, mask: u32) {
        let pending = self.dirty & mask;
        if pending == 0 {
            return;
        }
        let computed = self.compute(pending);
        self.raw = (self.raw & !pending) | computed;
        self.dirty &= !pending;
    }

    /// Derive the requested status bits from the lazy record
    fn compute(&self, wanted: u32) -> u32 {
        let LazyFlags {
            op,
            size,
            val1,
            val2,
            result,
            carry_in,
        } = self.lazy;
        let sign = size.sign_bit();
        let mut out = 0;

        if wanted & FLAG_ZF != 0 && result == 0 {
            out |= FLAG_ZF;
        }
        if wanted & FLAG_SF != 0 && result & sign != 0 {
            out |= FLAG_SF;
        }
        if wanted & FLAG_PF != 0 && parity(result) {
            out |= FLAG_PF;
        }
        if wanted & FLAG_CF != 0 {
            let cf = match op {
                FlagOp::Add => result < val1,
                FlagOp::Adc => {
                    if carry_in {
                        result <= val1
                    } else {
                        result < val1
                    }
                }
                FlagOp::Sub => val1 < val2,
                FlagOp::Sbb => {
                    if carry_in {
                        val1 <= val2
                    } else {
                        val1 < val2
                    }
                }
                FlagOp::Neg => val1 != 0,
                FlagOp::Logic | FlagOp::Inc | FlagOp::Dec | FlagOp::Result => false,
            };
            if cf {
                out |= FLAG_CF;
            }
        }
        if wanted & FLAG_OF != 0 {
            let of = match op {
                FlagOp::Add | FlagOp::Adc => (val1 ^ result) & (val2 ^ result) & sign != 0,
                FlagOp::Sub | FlagOp::Sbb => (val1 ^ val2) & (val1 ^ result) & sign != 0,
                FlagOp::Neg => val1 == sign,
                FlagOp::Inc => result == sign,
                FlagOp::Dec => result == sign - 1,
                FlagOp::Logic | FlagOp::Result => false,
            };
            if of {
                out |= FLAG_OF;
            }
        }
        if wanted & FLAG_AF != 0 {
            let af = match op {
                FlagOp::Add | FlagOp::Adc | FlagOp::Sub | FlagOp::Sbb => {
                    (val1 ^ val2 ^ result) & 0x10 != 0
                }
                FlagOp::Neg => val1 & 0x0F != 0,
                FlagOp::Inc => result & 0x0F == 0,
                FlagOp::Dec => result & 0x0F == 0x0F,
                FlagOp::Logic | FlagOp::Result => false,
            };
            if af {
                out |= FLAG_AF;
            }
        }
        out
    }

    /// Get flag
    #[inline]
    pub fn get(&self, flag: u32) -> bool {
        if self.dirty & flag != 0 {
            self.compute(flag) != 0
        } else {
            self.raw & flag != 0
        }
    }

    /// Set flag
    #[inline]
    pub fn set(&mut self, flag: u32, value: bool) {
        // Other pending bits keep their lazy derivation
        self.dirty &= !flag;
        if value {
            self.raw |= flag;
        } else {
            self.raw &= !flag;
        }
    }

    /// Full EFLAGS value with every pending bit derived
    pub fn value(&self) -> u32 {
        let pending = self.dirty;
        ((self.raw & !pending) | self.compute(pending)) | FLAGS_FIXED
    }

    /// Replace the bits selected by `writable` with `value`
    pub fn load(&mut self, value: u32, writable: u32) {
        let current = self.value();
        self.raw = ((current & !writable) | (value & writable)) | FLAGS_FIXED;
        self.dirty = 0;
    }

    /// The last recorded operation, for debuggers
    pub fn last_operation(&self) -> &LazyFlags {
        &self.lazy
    }

    /// Status bits still waiting to be derived
    pub fn dirty_mask(&self) -> u32 {
        self.dirty
    }

    /// Check condition code for conditional instructions
    pub fn condition(&self, condition: Condition) -> bool {
        match condition {
            Condition::O => self.get(FLAG_OF),
            Condition::NO => !self.get(FLAG_OF),
            Condition::B => self.get(FLAG_CF),
            Condition::NB => !self.get(FLAG_CF),
            Condition::E => self.get(FLAG_ZF),
            Condition::NE => !self.get(FLAG_ZF),
            Condition::BE => self.get(FLAG_CF) || self.get(FLAG_ZF),
            Condition::NBE => !self.get(FLAG_CF) && !self.get(FLAG_ZF),
            Condition::S => self.get(FLAG_SF),
            Condition::NS => !self.get(FLAG_SF),
            Condition::P => self.get(FLAG_PF),
            Condition::NP => !self.get(FLAG_PF),
            Condition::L => self.get(FLAG_SF) != self.get(FLAG_OF),
            Condition::NL => self.get(FLAG_SF) == self.get(FLAG_OF),
            Condition::LE => self.get(FLAG_ZF) || (self.get(FLAG_SF) != self.get(FLAG_OF)),
            Condition::NLE => !self.get(FLAG_ZF) && (self.get(FLAG_SF) == self.get(FLAG_OF)),
        }
    }
}
