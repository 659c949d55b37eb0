//! x86 instruction execution engine (8086 through 80486).
//!
//! The host decodes instructions into [`Instruction`] values and hands them
//! to [`Cpu::execute`]. Memory, I/O ports and descriptor lookup go through
//! the host's [`Bus`].

pub mod bus;
pub mod config;
pub mod cpu;
pub mod error;
pub mod flags;
pub mod instruction;
pub mod logging;
pub mod operand;
pub mod protected;
pub mod registers;

pub use bus::{ArrayBus, Bus};
pub use config::{CpuConfig, CpuModel, FaultDelivery};
pub use cpu::{Cpu, InterruptKind, StepOutcome, TaskSwitchReason};
pub use error::{ExecError, Fault};
pub use flags::FlagsState;
pub use instruction::{Condition, Instruction, Mnemonic, Operands, RepeatPrefix};
pub use operand::{Address, Operand, OperandKind, OperandSize, RegId, SegmentId};
pub use registers::RegisterFile;
