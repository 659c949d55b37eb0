//! Jumps, calls, returns and loops
//!
//! Near targets come either as an immediate displacement, added to the
//! already-advanced (E)IP, or as a register/memory operand holding an
//! absolute offset. Far targets are a `Binary(selector, offset)` pair of
//! immediates or a memory operand holding `offset:selector`.

use super::task::TaskSwitchReason;
use super::{Cpu, InterruptKind};
use crate::bus::Bus;
use crate::error::{ExecError, Fault};
use crate::flags::{FLAG_OF, FLAG_ZF};
use crate::instruction::{Condition, Instruction, Mnemonic, Operands};
use crate::logging::{log, LogCategory, LogLevel};
use crate::operand::{Operand, OperandKind, OperandSize, SegmentId};
use crate::protected::{selector, GateDescriptor, SystemType};
use crate::registers::ECX;

use super::segment::error_code;

/// Far CALL or far JMP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FarKind {
    Call,
    Jump,
}

impl<B: Bus> Cpu<B> {
    /// Resolve a near branch target at the instruction's operand size
    fn near_target(&self, insn: &Instruction, target: &Operand) -> u32 {
        let raw = self.read_operand(target);
        let value = match target.kind {
            OperandKind::Immediate(_) => self.regs.eip.wrapping_add(target.sign_extend(raw)),
            _ => raw,
        };
        value & insn.op_size().mask()
    }

    pub(super) fn exec_call_near(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let target = Self::unary(insn)?;
        let target = self.near_target(insn, &target);
        let ret = self.regs.eip;
        self.push(ret, insn.op_size());
        self.regs.set_eip(target);
        Ok(())
    }

    pub(super) fn exec_jmp_near(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let target = Self::unary(insn)?;
        let target = self.near_target(insn, &target);
        self.regs.set_eip(target);
        Ok(())
    }

    pub(super) fn exec_jcc(
        &mut self,
        insn: &Instruction,
        condition: Condition,
    ) -> Result<(), ExecError> {
        let target = Self::unary(insn)?;
        if self.regs.flags.condition(condition) {
            let target = self.near_target(insn, &target);
            self.regs.set_eip(target);
        }
        Ok(())
    }

    /// RETN with an optional imm16 of extra bytes to release
    pub(super) fn exec_ret_near(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let ret = self.pop(insn.op_size());
        self.release_stack(insn)?;
        self.regs.set_eip(ret);
        Ok(())
    }

    fn release_stack(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let extra = match insn.operands {
            Operands::None => 0,
            Operands::Unary(imm) => self.read_operand(&imm) & 0xFFFF,
            _ => return Err(Self::mismatch(insn, "expected an optional imm16")),
        };
        let sp = self.regs.stack_pointer().wrapping_add(extra);
        self.regs.set_stack_pointer(sp & self.regs.stack_size().mask());
        Ok(())
    }

    /// LOOP/LOOPE/LOOPNE: the counter is CX or ECX by address size
    pub(super) fn exec_loop(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let target = Self::unary(insn)?;
        let size = insn.addr_size();
        let count = self.regs.gpr(ECX, size).wrapping_sub(1) & size.mask();
        self.regs.set_gpr(ECX, size, count);
        let taken = count != 0
            && match insn.mnemonic {
                Mnemonic::Loope => self.regs.flags.get(FLAG_ZF),
                Mnemonic::Loopne => !self.regs.flags.get(FLAG_ZF),
                _ => true,
            };
        if taken {
            let target = self.near_target(insn, &target);
            self.regs.set_eip(target);
        }
        Ok(())
    }

    /// JCXZ/JECXZ
    pub(super) fn exec_jcxz(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let target = Self::unary(insn)?;
        if self.regs.gpr(ECX, insn.addr_size()) == 0 {
            let target = self.near_target(insn, &target);
            self.regs.set_eip(target);
        }
        Ok(())
    }

    pub(super) fn exec_int(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let vector = Self::unary(insn)?;
        let vector = self.read_operand(&vector) as u8;
        self.interrupt(vector, InterruptKind::Software, None)
    }

    /// INTO traps through vector 4 when OF is set
    pub(super) fn exec_into(&mut self) -> Result<(), ExecError> {
        if self.regs.flags.get(FLAG_OF) {
            return Err(Fault::Overflow.into());
        }
        Ok(())
    }

    /// BOUND reg, m: signed index must lie in [lower, upper]
    pub(super) fn exec_bound(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (index, bounds) = Self::binary(insn)?;
        let addr = Self::memory_address(insn, &bounds)?;
        let size = index.size;
        let value = size.signed(self.read_operand(&index));
        let lower = size.signed(self.read_at(addr, 0, size));
        let upper = size.signed(self.read_at(addr, size.bytes(), size));
        if value < lower || value > upper {
            return Err(Fault::BoundRange.into());
        }
        Ok(())
    }

    /// Selector and offset of a far branch target
    fn far_pointer(&self, insn: &Instruction) -> Result<(u16, u32), ExecError> {
        let size = insn.op_size();
        match insn.operands {
            Operands::Binary(sel, offset) if sel.is_immediate() && offset.is_immediate() => {
                Ok((self.read_operand(&sel) as u16, self.read_operand(&offset) & size.mask()))
            }
            Operands::Unary(ptr) => {
                let addr = Self::memory_address(insn, &ptr)?;
                let offset = self.read_at(addr, 0, size);
                let sel = self.read_at(addr, size.bytes(), OperandSize::Word) as u16;
                Ok((sel, offset))
            }
            _ => Err(Self::mismatch(insn, "expected a far pointer")),
        }
    }

    /// Far CALL/JMP
    ///
    /// Protected mode dispatches on the target descriptor: code segments are
    /// entered directly, TSSs and task gates switch tasks, call gates enter
    /// their target at the current privilege level.
    pub(super) fn exec_far(&mut self, insn: &Instruction, kind: FarKind) -> Result<(), ExecError> {
        let (sel, offset) = self.far_pointer(insn)?;
        let size = insn.op_size();

        log(LogCategory::Stack, LogLevel::Trace, || {
            format!("far {:?} to {:04X}:{:08X}", kind, sel, offset)
        });

        if !self.regs.is_protected_mode() {
            return self.far_to_code(kind, sel, offset, size);
        }

        let desc = self.descriptor(sel)?;
        if desc.is_code_or_data() {
            return self.far_to_code(kind, sel, offset, size);
        }

        let reason = match kind {
            FarKind::Call => TaskSwitchReason::Call,
            FarKind::Jump => TaskSwitchReason::Jump,
        };
        let gate_rpl = (sel & selector::RPL_MASK) as u8;

        match desc.system_type() {
            Some(ty) if ty.is_tss() => {
                if desc.dpl() < self.cpl().max(gate_rpl) {
                    return Err(Fault::GeneralProtection(error_code(sel)).into());
                }
                self.task_switch(sel, &desc, reason)
            }
            Some(SystemType::TaskGate) => {
                let gate = GateDescriptor::from_descriptor(&desc);
                if desc.dpl() < self.cpl().max(gate_rpl) {
                    return Err(Fault::GeneralProtection(error_code(sel)).into());
                }
                if !gate.is_present() {
                    return Err(Fault::SegmentNotPresent(error_code(sel)).into());
                }
                let tss = self.descriptor(gate.selector)?;
                self.task_switch(gate.selector, &tss, reason)
            }
            Some(ty @ (SystemType::CallGate16 | SystemType::CallGate32)) => {
                let gate = GateDescriptor::from_descriptor(&desc);
                if desc.dpl() < self.cpl().max(gate_rpl) {
                    return Err(Fault::GeneralProtection(error_code(sel)).into());
                }
                if !gate.is_present() {
                    return Err(Fault::SegmentNotPresent(error_code(sel)).into());
                }
                let width = OperandSize::word_or_dword(ty.is_32bit());
                self.far_to_code(kind, gate.selector, gate.offset, width)
            }
            _ => Err(Fault::GeneralProtection(error_code(sel)).into()),
        }
    }

    /// Enter the target code segment, then push the return address for calls
    fn far_to_code(
        &mut self,
        kind: FarKind,
        sel: u16,
        offset: u32,
        size: OperandSize,
    ) -> Result<(), ExecError> {
        let return_cs = self.regs.selector(SegmentId::CS) as u32;
        let return_eip = self.regs.eip;
        self.enter_code_segment(sel, offset & size.mask())?;
        if kind == FarKind::Call {
            self.push(return_cs, size);
            self.push(return_eip, size);
        }
        Ok(())
    }

    /// RETF with an optional imm16; returns to the same privilege level only
    pub(super) fn exec_ret_far(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let size = insn.op_size();
        let offset = self.peek(0, size);
        let sel = self.peek(size.bytes(), size) as u16;
        if self.regs.is_protected_mode() && (sel & selector::RPL_MASK) as u8 != self.cpl() {
            return Err(Fault::GeneralProtection(error_code(sel)).into());
        }
        self.enter_code_segment(sel, offset)?;
        self.pop(size);
        self.pop(size);
        self.release_stack(insn)
    }
}
