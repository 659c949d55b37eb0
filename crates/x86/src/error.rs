//! Error taxonomy
//!
//! Two kinds of failure leave `execute`:
//! - [`Fault`]: an architectural exception the guest can handle itself
//! - [`ExecError`]: conditions the host has to decide about (unsupported
//!   instructions, decoder contract violations, triple fault)

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instruction::Mnemonic;

/// Architectural exceptions raised by instruction semantics
///
/// Selector-carrying variants hold the error code pushed in protected mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Fault {
    #[error("#DE divide error")]
    DivideError,
    #[error("#DB debug")]
    Debug,
    #[error("#BP breakpoint")]
    Breakpoint,
    #[error("#OF overflow")]
    Overflow,
    #[error("#BR bound range exceeded")]
    BoundRange,
    #[error("#UD invalid opcode")]
    InvalidOpcode,
    #[error("#NM device not available")]
    DeviceNotAvailable,
    #[error("#DF double fault")]
    DoubleFault,
    #[error("#TS invalid TSS (selector {0:#06X})")]
    InvalidTss(u16),
    #[error("#NP segment not present (selector {0:#06X})")]
    SegmentNotPresent(u16),
    #[error("#SS stack fault (selector {0:#06X})")]
    StackFault(u16),
    #[error("#GP general protection (selector {0:#06X})")]
    GeneralProtection(u16),
}

impl Fault {
    /// Interrupt vector the fault is delivered through
    pub const fn vector(self) -> u8 {
        match self {
            Fault::DivideError => 0,
            Fault::Debug => 1,
            Fault::Breakpoint => 3,
            Fault::Overflow => 4,
            Fault::BoundRange => 5,
            Fault::InvalidOpcode => 6,
            Fault::DeviceNotAvailable => 7,
            Fault::DoubleFault => 8,
            Fault::InvalidTss(_) => 10,
            Fault::SegmentNotPresent(_) => 11,
            Fault::StackFault(_) => 12,
            Fault::GeneralProtection(_) => 13,
        }
    }

    /// Error code pushed after the return frame (protected mode only)
    pub const fn error_code(self) -> Option<u16> {
        match self {
            Fault::DoubleFault => Some(0),
            Fault::InvalidTss(code)
            | Fault::SegmentNotPresent(code)
            | Fault::StackFault(code)
            | Fault::GeneralProtection(code) => Some(code),
            _ => None,
        }
    }

    /// Traps report the address of the next instruction, faults their own
    pub const fn is_trap(self) -> bool {
        matches!(self, Fault::Breakpoint | Fault::Overflow)
    }

    /// Build a fault from a vector and error code, for `Cpu::exception`
    pub const fn from_vector(vector: u8, error_code: u16) -> Option<Self> {
        Some(match vector {
            0 => Fault::DivideError,
            1 => Fault::Debug,
            3 => Fault::Breakpoint,
            4 => Fault::Overflow,
            5 => Fault::BoundRange,
            6 => Fault::InvalidOpcode,
            7 => Fault::DeviceNotAvailable,
            8 => Fault::DoubleFault,
            10 => Fault::InvalidTss(error_code),
            11 => Fault::SegmentNotPresent(error_code),
            12 => Fault::StackFault(error_code),
            13 => Fault::GeneralProtection(error_code),
            _ => return None,
        })
    }
}

/// Engine errors that are not guest-visible exceptions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// The instruction is recognised but not modelled
    #[error("unsupported instruction: {mnemonic:?}")]
    Unsupported { mnemonic: Mnemonic },

    /// Repeat prefix combined with an instruction that cannot take it
    #[error("invalid repeat prefix for {mnemonic:?}")]
    InvalidPrefix { mnemonic: Mnemonic },

    /// Operand arity or kind does not match the mnemonic
    #[error("operand mismatch for {mnemonic:?}: {detail}")]
    OperandMismatch {
        mnemonic: Mnemonic,
        detail: &'static str,
    },

    /// A fault occurred while delivering a double fault
    #[error("triple fault")]
    TripleFault,

    /// Architectural fault raised inside a semantic function; `execute`
    /// converts it into delivery or `StepOutcome::Faulted`
    #[error("{0}")]
    Fault(#[from] Fault),
}
