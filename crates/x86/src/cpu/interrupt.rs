//! Interrupt and exception delivery
//!
//! Every transfer through the IVT or IDT goes through [`Cpu::interrupt`]:
//! INT n, INT3, exceptions raised by instructions and interrupts injected by
//! the host. The gate or vector is validated before anything is pushed, so a
//! delivery fault leaves the stack as it was.

use serde::{Deserialize, Serialize};

use super::task::TaskSwitchReason;
use super::Cpu;
use crate::bus::Bus;
use crate::error::{ExecError, Fault};
use crate::flags::{FLAG_IF, FLAG_NT, FLAG_RF, FLAG_TF, FLAG_VM};
use crate::instruction::Instruction;
use crate::logging::{log, LogCategory, LogLevel};
use crate::operand::{OperandSize, SegmentId};
use crate::protected::{selector, GateDescriptor, SystemType};

/// Vector of the non-maskable interrupt
const NMI_VECTOR: u8 = 2;

/// Source of an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterruptKind {
    /// INT n, INT3; subject to the gate DPL check
    Software,
    /// External interrupt or NMI
    Hardware,
    /// Processor exception
    Exception,
}

impl<B: Bus> Cpu<B> {
    /// Transfer control through `vector`
    ///
    /// `error_code` is pushed after the return frame in protected mode and
    /// ignored in real mode. Returns the fault that prevented delivery, if
    /// any.
    pub fn interrupt(
        &mut self,
        vector: u8,
        kind: InterruptKind,
        error_code: Option<u16>,
    ) -> Result<(), ExecError> {
        if self.regs.is_protected_mode() {
            self.interrupt_protected(vector, kind, error_code)?;
        } else {
            self.interrupt_real(vector)?;
        }
        self.halted = false;
        Ok(())
    }

    /// Real mode: 4-byte IVT entries of offset:segment
    fn interrupt_real(&mut self, vector: u8) -> Result<(), ExecError> {
        let entry = vector as u32 * 4;
        if entry + 3 > self.regs.idtr.limit as u32 {
            return Err(Fault::GeneralProtection(0).into());
        }
        let base = self.regs.idtr.base.wrapping_add(entry);
        let offset = self.bus.read_linear(base, OperandSize::Word);
        let segment = self.bus.read_linear(base.wrapping_add(2), OperandSize::Word) as u16;

        let image = self.eflags_image();
        let cs = self.regs.selector(SegmentId::CS) as u32;
        let ip = self.regs.eip;
        self.push(image, OperandSize::Word);
        self.push(cs, OperandSize::Word);
        self.push(ip, OperandSize::Word);

        self.regs.flags.set(FLAG_IF, false);
        self.regs.flags.set(FLAG_TF, false);
        self.regs.set_segment_real(SegmentId::CS, segment);
        self.regs.set_eip(offset);
        Ok(())
    }

    /// Protected mode: 8-byte IDT gates
    fn interrupt_protected(
        &mut self,
        vector: u8,
        kind: InterruptKind,
        error_code: Option<u16>,
    ) -> Result<(), ExecError> {
        let external = (kind != InterruptKind::Software) as u16;
        let gate_code = ((vector as u16) << 3) | 2 | external;
        let entry = vector as u32 * 8;
        if entry + 7 > self.regs.idtr.limit as u32 {
            return Err(Fault::GeneralProtection(gate_code).into());
        }
        let bytes = self
            .bus
            .read_descriptor_bytes(self.regs.idtr.base.wrapping_add(entry));
        let gate = GateDescriptor::from_bytes(&bytes);
        let ty = match gate.gate_type() {
            Some(
                ty @ (SystemType::TaskGate
                | SystemType::InterruptGate16
                | SystemType::InterruptGate32
                | SystemType::TrapGate16
                | SystemType::TrapGate32),
            ) => ty,
            _ => return Err(Fault::GeneralProtection(gate_code).into()),
        };
        let gate_dpl = (gate.access >> 5) & 0x03;
        if kind == InterruptKind::Software && gate_dpl < self.cpl() {
            return Err(Fault::GeneralProtection(gate_code).into());
        }
        if !gate.is_present() {
            return Err(Fault::SegmentNotPresent(gate_code).into());
        }

        if ty == SystemType::TaskGate {
            let tss = self.descriptor(gate.selector)?;
            self.task_switch(gate.selector, &tss, TaskSwitchReason::Interrupt)?;
            if let Some(code) = error_code {
                let width = self.current_tss_layout()?.width;
                self.push(code as u32, width);
            }
            return Ok(());
        }

        let target = gate.selector;
        if selector::is_null(target) {
            return Err(Fault::GeneralProtection(external).into());
        }
        let width = OperandSize::word_or_dword(ty.is_32bit());
        let image = self.eflags_image();
        let cs = self.regs.selector(SegmentId::CS) as u32;
        let eip = self.regs.eip;
        self.enter_code_segment(target, gate.offset & width.mask())?;

        self.push(image, width);
        self.push(cs, width);
        self.push(eip, width);
        if let Some(code) = error_code {
            self.push(code as u32, width);
        }

        let flags = &mut self.regs.flags;
        flags.set(FLAG_TF, false);
        flags.set(FLAG_NT, false);
        flags.set(FLAG_RF, false);
        flags.set(FLAG_VM, false);
        if matches!(ty, SystemType::InterruptGate16 | SystemType::InterruptGate32) {
            flags.set(FLAG_IF, false);
        }
        Ok(())
    }

    /// Deliver an exception, escalating faults raised during delivery
    ///
    /// A fault while delivering a fault becomes #DF; a fault while
    /// delivering #DF shuts the processor down.
    pub(crate) fn deliver_fault(&mut self, fault: Fault) -> Result<(), ExecError> {
        log(LogCategory::Interrupts, LogLevel::Debug, || {
            format!(
                "{} at {:04X}:{:08X}",
                fault,
                self.regs.selector(SegmentId::CS),
                self.regs.eip
            )
        });
        match self.interrupt(fault.vector(), InterruptKind::Exception, fault.error_code()) {
            Ok(()) => Ok(()),
            Err(ExecError::Fault(_)) if fault == Fault::DoubleFault => {
                log(LogCategory::Interrupts, LogLevel::Error, || {
                    "triple fault".to_string()
                });
                Err(ExecError::TripleFault)
            }
            Err(ExecError::Fault(nested)) => {
                log(LogCategory::Interrupts, LogLevel::Warn, || {
                    format!("{} while delivering {}", nested, fault)
                });
                self.deliver_fault(Fault::DoubleFault)
            }
            Err(err) => Err(err),
        }
    }

    /// Deliver an exception the host decided to raise
    ///
    /// Used with `FaultDelivery::Host` after `execute` reported a fault, or
    /// to inject one from a device model.
    pub fn exception(&mut self, fault: Fault) -> Result<(), ExecError> {
        self.deliver_fault(fault)
    }

    /// Maskable external interrupt at an instruction boundary
    ///
    /// Returns `false` when IF is clear or an interrupt shadow is active; the
    /// host should retry after the next instruction. Delivery wakes a halted
    /// CPU.
    pub fn raise_interrupt(&mut self, vector: u8) -> Result<bool, ExecError> {
        if !self.regs.flags.get(FLAG_IF) || self.interrupt_shadow {
            return Ok(false);
        }
        self.external_interrupt(vector)?;
        Ok(true)
    }

    /// Non-maskable interrupt; further NMIs are held off until IRET
    pub fn raise_nmi(&mut self) -> Result<bool, ExecError> {
        if self.nmi_blocked {
            return Ok(false);
        }
        self.external_interrupt(NMI_VECTOR)?;
        self.nmi_blocked = true;
        Ok(true)
    }

    fn external_interrupt(&mut self, vector: u8) -> Result<(), ExecError> {
        log(LogCategory::Interrupts, LogLevel::Debug, || {
            format!("external interrupt {:#04X}", vector)
        });
        match self.interrupt(vector, InterruptKind::Hardware, None) {
            Err(ExecError::Fault(fault)) => self.deliver_fault(fault),
            other => other,
        }
    }

    /// IRET/IRETD
    ///
    /// With NT set in protected mode this returns to the task named by the
    /// back-link of the current TSS. Otherwise pops (E)IP, CS and (E)FLAGS
    /// at the operand size, returning to the same privilege level.
    pub(super) fn exec_iret(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        if self.regs.is_protected_mode() && self.regs.flags.get(FLAG_NT) {
            let layout = self.current_tss_layout()?;
            let link = layout.read_link(&self.bus, self.regs.tr.cache.base);
            let desc = self.descriptor(link).map_err(|_| Fault::InvalidTss(link & !3))?;
            self.task_switch(link, &desc, TaskSwitchReason::Iret)?;
            self.nmi_blocked = false;
            return Ok(());
        }

        let size = insn.op_size();
        let eip = self.peek(0, size);
        let cs = self.peek(size.bytes(), size) as u16;
        let image = self.peek(size.bytes() * 2, size);
        if self.regs.is_protected_mode() && (cs & selector::RPL_MASK) as u8 != self.cpl() {
            return Err(Fault::GeneralProtection(cs & !selector::RPL_MASK).into());
        }
        self.enter_code_segment(cs, eip)?;
        for _ in 0..3 {
            self.pop(size);
        }
        let writable = self.popf_mask(size);
        self.regs.flags.load(image, writable);
        self.nmi_blocked = false;
        Ok(())
    }
}
