//! x86 instruction execution engine
//!
//! The host decodes an instruction and hands it to [`Cpu::execute`], which
//! runs its semantics against the register file and the host's [`Bus`].
//! Instruction families live in submodules, each adding methods to `Cpu`:
//!
//! - `arith`: ADD/SUB/logic/NEG/INC/DEC
//! - `muldiv`: MUL/IMUL/DIV/IDIV
//! - `shift`: shifts, rotates, SHLD/SHRD
//! - `bcd`: decimal adjust
//! - `bits`: BT family, BSF/BSR
//! - `data`: moves, exchanges, conversions, SETcc
//! - `string`: the REP iterator
//! - `stack`: push/pop, PUSHA/POPA, PUSHF/POPF, ENTER/LEAVE
//! - `control`: jumps, calls, returns, loops
//! - `interrupt`: the single delivery point for interrupts and exceptions
//! - `segment`: selector loads and descriptor bookkeeping
//! - `task`: hardware task switching
//! - `system`: descriptor-table registers, CR0, CPUID, I/O, HLT

mod arith;
mod bcd;
mod bits;
mod control;
mod data;
mod interrupt;
mod muldiv;
mod segment;
mod shift;
mod stack;
mod string;
mod system;
mod task;

#[cfg(test)]
mod tests;

pub use interrupt::InterruptKind;
pub use task::TaskSwitchReason;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::Bus;
use crate::config::{CpuConfig, CpuModel, FaultDelivery};
use crate::error::{ExecError, Fault};
use crate::flags::{FLAG_RF, FLAG_VM};
use crate::instruction::{Instruction, Mnemonic, Operands, RepeatPrefix};
use crate::logging::{log, LogCategory, LogConfig, LogLevel};
use crate::operand::{Address, Operand, OperandKind, OperandSize, RegId, SegmentId};
use crate::registers::{RegisterFile, ESP};

/// Result of executing one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// The instruction completed
    Retired,
    /// The instruction completed and the CPU is now halted (or was already)
    Halted,
    /// A repeated string instruction hit the iteration budget; (E)IP still
    /// points at it and the next call resumes it
    Suspended,
    /// The instruction raised an architectural fault. With
    /// `FaultDelivery::Dispatch` the handler has already been entered.
    Faulted(Fault),
}

/// Serializable part of the CPU (everything except the bus and config)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CpuState {
    regs: RegisterFile,
    halted: bool,
    instructions_retired: u64,
    interrupt_shadow: bool,
    nmi_blocked: bool,
}

/// x86 CPU state and execution engine
///
/// Generic over the host bus, the way a system embeds it with its own
/// memory map and port decoder.
#[derive(Debug)]
pub struct Cpu<B: Bus> {
    /// Architectural registers
    pub regs: RegisterFile,
    /// Host memory, I/O and descriptor lookup
    pub bus: B,
    config: CpuConfig,
    halted: bool,
    instructions_retired: u64,
    /// MOV/POP SS and STI hold off external interrupts for one instruction
    interrupt_shadow: bool,
    /// Set while an NMI handler runs, cleared by IRET
    nmi_blocked: bool,
    /// (E)IP of the instruction being executed
    instruction_start: u32,
    /// Mnemonic of the instruction being executed, for error reports
    mnemonic: Mnemonic,
    /// Set by the string iterator when the REP budget runs out
    suspended: bool,
}

impl<B: Bus> Cpu<B> {
    /// Create a CPU with the default configuration (80386, engine-delivered faults)
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, CpuConfig::default())
    }

    /// Create a CPU with a specific model and default policies
    pub fn with_model(bus: B, model: CpuModel) -> Self {
        Self::with_config(bus, CpuConfig::for_model(model))
    }

    pub fn with_config(bus: B, config: CpuConfig) -> Self {
        Self {
            regs: RegisterFile::new(),
            bus,
            config,
            halted: false,
            instructions_retired: 0,
            interrupt_shadow: false,
            nmi_blocked: false,
            instruction_start: 0,
            mnemonic: Mnemonic::Invalid,
            suspended: false,
        }
    }

    /// Reset the CPU to its power-on state (preserves bus and config)
    pub fn reset(&mut self) {
        self.regs = RegisterFile::new();
        self.halted = false;
        self.instructions_retired = 0;
        self.interrupt_shadow = false;
        self.nmi_blocked = false;
        self.suspended = false;
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: CpuConfig) {
        self.config = config;
    }

    pub fn model(&self) -> CpuModel {
        self.config.model
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// When halted, `execute` does nothing until an interrupt arrives
    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    /// Number of instructions completed since reset
    pub fn instructions_retired(&self) -> u64 {
        self.instructions_retired
    }

    /// Full EFLAGS value with all lazy bits derived
    pub fn eflags(&self) -> u32 {
        self.regs.flags.value()
    }

    /// Replace the EFLAGS bits selected by `writable`
    pub fn load_eflags(&mut self, value: u32, writable: u32) {
        self.regs.flags.load(value, writable);
    }

    /// Execute one decoded instruction
    ///
    /// (E)IP is advanced past the instruction before its semantics run, so
    /// relative branches and pushed return addresses see the next
    /// instruction. Faults rewind (E)IP and (E)SP to their values at entry.
    pub fn execute(&mut self, insn: &Instruction) -> Result<StepOutcome, ExecError> {
        if self.halted {
            return Ok(StepOutcome::Halted);
        }

        let start_eip = self.regs.eip;
        let start_esp = self.regs.gpr32(ESP);
        self.instruction_start = start_eip;
        self.mnemonic = insn.mnemonic;
        self.interrupt_shadow = false;
        self.suspended = false;
        self.regs
            .set_eip(start_eip.wrapping_add(insn.length as u32));

        if LogConfig::global().should_log(LogCategory::Cpu, LogLevel::Trace) {
            log(LogCategory::Cpu, LogLevel::Trace, || {
                format!(
                    "{:04X}:{:08X} {:?} {:?}",
                    self.regs.selector(SegmentId::CS),
                    start_eip,
                    insn.mnemonic,
                    insn.operands
                )
            });
        }

        match self.dispatch(insn) {
            Ok(()) if self.suspended => Ok(StepOutcome::Suspended),
            Ok(()) => {
                self.instructions_retired += 1;
                if self.halted {
                    Ok(StepOutcome::Halted)
                } else {
                    Ok(StepOutcome::Retired)
                }
            }
            Err(ExecError::Fault(fault)) => {
                if !fault.is_trap() {
                    self.regs.eip = start_eip;
                }
                self.regs.set_gpr32(ESP, start_esp);
                if self.config.fault_delivery == FaultDelivery::Dispatch {
                    self.deliver_fault(fault)?;
                }
                Ok(StepOutcome::Faulted(fault))
            }
            Err(err) => {
                self.regs.eip = start_eip;
                self.regs.set_gpr32(ESP, start_esp);
                Err(err)
            }
        }
    }

    /// Exhaustive mnemonic dispatch
    fn dispatch(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        use Mnemonic::*;

        if !self.config.model.supports(insn.mnemonic.min_model()) {
            return Err(Fault::InvalidOpcode.into());
        }
        if insn.repeat == RepeatPrefix::RepNE
            && matches!(insn.mnemonic, Movs | Stos | Lods | Ins | Outs)
        {
            return Err(ExecError::InvalidPrefix {
                mnemonic: insn.mnemonic,
            });
        }

        match insn.mnemonic {
            Add | Adc | Sub | Sbb | Cmp | And | Or | Xor | Test => self.exec_alu(insn),
            Neg => self.exec_neg(insn),
            Not => self.exec_not(insn),
            Inc | Dec => self.exec_inc_dec(insn),
            Mul => self.exec_mul(insn),
            Imul => self.exec_imul(insn),
            Div => self.exec_div(insn),
            Idiv => self.exec_idiv(insn),
            Shl | Shr | Sar => self.exec_shift(insn),
            Rol | Ror | Rcl | Rcr => self.exec_rotate(insn),
            Shld | Shrd => self.exec_double_shift(insn),
            Daa => self.exec_daa(),
            Das => self.exec_das(),
            Aaa => self.exec_aaa(),
            Aas => self.exec_aas(),
            Aam => self.exec_aam(insn),
            Aad => self.exec_aad(insn),
            Bt | Bts | Btr | Btc => self.exec_bit_test(insn),
            Bsf | Bsr => self.exec_bit_scan(insn),
            Mov => self.exec_mov(insn),
            Movsx | Movzx => self.exec_mov_extend(insn),
            Xchg => self.exec_xchg(insn),
            Xadd => self.exec_xadd(insn),
            Cmpxchg => self.exec_cmpxchg(insn),
            Bswap => self.exec_bswap(insn),
            Lea => self.exec_lea(insn),
            Lds | Les | Lfs | Lgs | Lss => self.exec_load_far_pointer(insn),
            Xlat => self.exec_xlat(insn),
            Cbw => self.exec_cbw(insn),
            Cwd => self.exec_cwd(insn),
            Lahf => self.exec_lahf(),
            Sahf => self.exec_sahf(),
            Salc => self.exec_salc(),
            Setcc(condition) => self.exec_setcc(insn, condition),
            Push => self.exec_push(insn),
            Pop => self.exec_pop(insn),
            Pusha => self.exec_pusha(insn),
            Popa => self.exec_popa(insn),
            Pushf => self.exec_pushf(insn),
            Popf => self.exec_popf(insn),
            Enter => self.exec_enter(insn),
            Leave => self.exec_leave(insn),
            Movs | Cmps | Scas | Lods | Stos | Ins | Outs => self.exec_string(insn),
            Calln => self.exec_call_near(insn),
            Callf => self.exec_far(insn, control::FarKind::Call),
            Retn => self.exec_ret_near(insn),
            Retf => self.exec_ret_far(insn),
            Jmpn => self.exec_jmp_near(insn),
            Jmpf => self.exec_far(insn, control::FarKind::Jump),
            Jcc(condition) => self.exec_jcc(insn, condition),
            Loop | Loope | Loopne => self.exec_loop(insn),
            Jcxz => self.exec_jcxz(insn),
            Int => self.exec_int(insn),
            Int3 => self.interrupt(3, InterruptKind::Software, None),
            Into => self.exec_into(),
            Iret => self.exec_iret(insn),
            Bound => self.exec_bound(insn),
            Clc | Stc | Cmc | Cld | Std | Cli | Sti => self.exec_flag_control(insn.mnemonic),
            In => self.exec_in(insn),
            Out => self.exec_out(insn),
            Hlt => self.exec_hlt(),
            Nop => Ok(()),
            Wait => self.exec_wait(),
            Cpuid => self.exec_cpuid(),
            Lgdt | Lidt => self.exec_load_table(insn),
            Sgdt | Sidt => self.exec_store_table(insn),
            Lldt => self.exec_lldt(insn),
            Sldt => self.exec_store_selector(insn, self.regs.ldtr.selector),
            Ltr => self.exec_ltr(insn),
            Str => self.exec_store_selector(insn, self.regs.tr.selector),
            Lmsw => self.exec_lmsw(insn),
            Smsw => self.exec_smsw(insn),
            Clts => self.exec_clts(),
            Esc => self.exec_escape(insn),
            Arpl | Lar | Lsl | Verr | Verw | Invd | Wbinvd | Invlpg => {
                self.unsupported(insn.mnemonic)
            }
            Invalid => Err(Fault::InvalidOpcode.into()),
        }
    }

    /// Report a recognised instruction the engine does not model
    fn unsupported(&self, mnemonic: Mnemonic) -> Result<(), ExecError> {
        log(LogCategory::Stubs, LogLevel::Warn, || {
            format!(
                "unsupported instruction {:?} at {:04X}:{:08X}",
                mnemonic,
                self.regs.selector(SegmentId::CS),
                self.instruction_start
            )
        });
        Err(ExecError::Unsupported { mnemonic })
    }

    // ----- operand arity -----

    fn mismatch(insn: &Instruction, detail: &'static str) -> ExecError {
        ExecError::OperandMismatch {
            mnemonic: insn.mnemonic,
            detail,
        }
    }

    pub(crate) fn unary(insn: &Instruction) -> Result<Operand, ExecError> {
        match insn.operands {
            Operands::Unary(a) => Ok(a),
            _ => Err(Self::mismatch(insn, "expected one operand")),
        }
    }

    pub(crate) fn binary(insn: &Instruction) -> Result<(Operand, Operand), ExecError> {
        match insn.operands {
            Operands::Binary(a, b) => Ok((a, b)),
            _ => Err(Self::mismatch(insn, "expected two operands")),
        }
    }

    // ----- operand access -----

    /// Linear address of a segment:offset pair
    #[inline]
    pub(crate) fn linear(&self, addr: Address) -> u32 {
        self.regs
            .segment_base(addr.segment)
            .wrapping_add(addr.offset)
    }

    /// Read an operand, masked to its size
    pub(crate) fn read_operand(&self, op: &Operand) -> u32 {
        match op.kind {
            OperandKind::Register(reg) => self.regs.read(reg) & op.mask(),
            OperandKind::Memory(addr) => self.bus.read_linear(self.linear(addr), op.size),
            OperandKind::Immediate(value) => value & op.mask(),
        }
    }

    /// Write an operand, masked to its size
    ///
    /// Segment register destinations go through a full selector load.
    pub(crate) fn write_operand(&mut self, op: &Operand, value: u32) -> Result<(), ExecError> {
        let value = value & op.mask();
        match op.kind {
            OperandKind::Register(RegId::Seg(seg)) => self.load_segment(seg, value as u16),
            OperandKind::Register(reg) => {
                self.regs.write(reg, value);
                Ok(())
            }
            OperandKind::Memory(addr) => {
                let linear = self.linear(addr);
                self.bus.write_linear(linear, value, op.size);
                Ok(())
            }
            OperandKind::Immediate(_) => Err(ExecError::OperandMismatch {
                mnemonic: self.mnemonic,
                detail: "immediate destination",
            }),
        }
    }

    /// Memory operand's address, for forms that need the location itself
    pub(crate) fn memory_address(insn: &Instruction, op: &Operand) -> Result<Address, ExecError> {
        match op.kind {
            OperandKind::Memory(addr) => Ok(addr),
            _ => Err(Self::mismatch(insn, "expected a memory operand")),
        }
    }

    /// Read `size` bytes at `addr + delta`
    pub(crate) fn read_at(&self, addr: Address, delta: u32, size: OperandSize) -> u32 {
        self.bus.read_linear(self.linear(addr.offset_by(delta)), size)
    }

    /// Current privilege level; SS's DPL tracks it in protected mode
    pub(crate) fn cpl(&self) -> u8 {
        if self.regs.is_protected_mode() {
            (self.regs.segment(SegmentId::SS).cache.access >> 5) & 0x03
        } else {
            0
        }
    }

    /// EFLAGS as pushed by PUSHF, interrupts and task switches
    pub(crate) fn eflags_image(&self) -> u32 {
        let value = self.regs.flags.value();
        if self.config.model.supports_80286_instructions() {
            value & !(FLAG_VM | FLAG_RF)
        } else {
            // 8086/80186 read bits 12-15 as ones
            (value | 0xF000) & 0xFFFF
        }
    }

    // ----- save states -----

    /// Serialize the architectural state (bus contents are the host's)
    pub fn save_state(&self) -> Value {
        let state = CpuState {
            regs: self.regs.clone(),
            halted: self.halted,
            instructions_retired: self.instructions_retired,
            interrupt_shadow: self.interrupt_shadow,
            nmi_blocked: self.nmi_blocked,
        };
        serde_json::json!({
            "version": 1,
            "model": self.config.model,
            "cpu": state,
        })
    }

    /// Restore a state produced by `save_state`
    pub fn load_state(&mut self, state: &Value) -> Result<(), serde_json::Error> {
        if let Some(cpu) = state.get("cpu") {
            let cpu: CpuState = serde_json::from_value(cpu.clone())?;
            self.regs = cpu.regs;
            self.halted = cpu.halted;
            self.instructions_retired = cpu.instructions_retired;
            self.interrupt_shadow = cpu.interrupt_shadow;
            self.nmi_blocked = cpu.nmi_blocked;
        }
        if let Some(model) = state.get("model") {
            self.config.model = serde_json::from_value(model.clone())?;
        }
        Ok(())
    }
}
