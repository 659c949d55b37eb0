//! Stack primitives and the stack instructions
//!
//! SP or ESP is chosen by SS's cached B bit; the pushed width comes from the
//! instruction.

use super::Cpu;
use crate::bus::Bus;
use crate::error::ExecError;
use crate::flags::{FLAG_IF, FLAG_IOPL, FLAG_RF, FLAG_VM};
use crate::instruction::Instruction;
use crate::logging::{log, LogCategory, LogLevel};
use crate::operand::{Address, Operand, OperandKind, OperandSize, RegId, SegmentId};
use crate::registers::{EAX, EBP, EBX, ECX, EDI, EDX, ESI, ESP};

impl<B: Bus> Cpu<B> {
    /// Push `value` truncated to `size`
    pub(crate) fn push(&mut self, value: u32, size: OperandSize) {
        let sp = self.regs.stack_pointer().wrapping_sub(size.bytes()) & self.regs.stack_size().mask();
        self.regs.set_stack_pointer(sp);
        let linear = self.linear(Address::new(SegmentId::SS, sp));
        self.bus.write_linear(linear, value & size.mask(), size);
    }

    /// Pop a value of `size`
    pub(crate) fn pop(&mut self, size: OperandSize) -> u32 {
        let value = self.peek(0, size);
        let sp = self.regs.stack_pointer().wrapping_add(size.bytes()) & self.regs.stack_size().mask();
        self.regs.set_stack_pointer(sp);
        value
    }

    /// Read `size` bytes at SS:(E)SP + `delta` without popping
    pub(crate) fn peek(&self, delta: u32, size: OperandSize) -> u32 {
        let sp = self.regs.stack_pointer().wrapping_add(delta) & self.regs.stack_size().mask();
        self.read_at(Address::new(SegmentId::SS, sp), 0, size)
    }

    /// Pushed width: segment registers and immediates take the operand size
    fn stack_operand_size(insn: &Instruction, op: &Operand) -> OperandSize {
        match op.kind {
            OperandKind::Register(RegId::Seg(_)) | OperandKind::Immediate(_) => insn.op_size(),
            _ => op.size,
        }
    }

    pub(super) fn exec_push(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let src = Self::unary(insn)?;
        let size = Self::stack_operand_size(insn, &src);
        let raw = self.read_operand(&src);
        let value = match src.kind {
            OperandKind::Immediate(_) => src.sign_extend(raw),
            // The 8086 pushes SP after decrementing it
            OperandKind::Register(RegId::SP)
                if !self.config.model.supports_80286_instructions() =>
            {
                raw.wrapping_sub(2)
            }
            _ => raw,
        };
        self.push(value, size);
        Ok(())
    }

    pub(super) fn exec_pop(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let dst = Self::unary(insn)?;
        let size = Self::stack_operand_size(insn, &dst);
        let value = self.pop(size);
        self.write_operand(&dst, value)?;
        self.note_stack_segment_write(&dst);
        Ok(())
    }

    /// Push AX, CX, DX, BX, original SP, BP, SI, DI
    pub(super) fn exec_pusha(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let size = insn.op_size();
        let original_sp = self.regs.gpr(ESP, size);
        for index in [EAX, ECX, EDX, EBX] {
            let value = self.regs.gpr(index, size);
            self.push(value, size);
        }
        self.push(original_sp, size);
        for index in [EBP, ESI, EDI] {
            let value = self.regs.gpr(index, size);
            self.push(value, size);
        }
        Ok(())
    }

    /// Reverse of PUSHA; the stored SP is discarded
    pub(super) fn exec_popa(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let size = insn.op_size();
        for index in [EDI, ESI, EBP] {
            let value = self.pop(size);
            self.regs.set_gpr(index, size, value);
        }
        self.pop(size);
        for index in [EBX, EDX, ECX, EAX] {
            let value = self.pop(size);
            self.regs.set_gpr(index, size, value);
        }
        Ok(())
    }

    pub(super) fn exec_pushf(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let image = self.eflags_image();
        self.push(image, insn.op_size());
        Ok(())
    }

    pub(super) fn exec_popf(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let size = insn.op_size();
        let value = self.pop(size);
        let writable = self.popf_mask(size);
        self.regs.flags.load(value, writable);
        log(LogCategory::Flags, LogLevel::Trace, || {
            format!(
                "POPF {:08X} (writable {:08X}) -> {:08X}",
                value,
                writable,
                self.regs.flags.value()
            )
        });
        Ok(())
    }

    /// EFLAGS bits POPF may change at the current privilege level
    ///
    /// VM and RF are never loaded by POPF. IOPL needs CPL 0 and IF needs
    /// CPL <= IOPL.
    pub(crate) fn popf_mask(&self, size: OperandSize) -> u32 {
        let mut mask = self.config.model.writable_flags() & !(FLAG_VM | FLAG_RF);
        if self.regs.is_protected_mode() {
            let cpl = self.cpl() as u32;
            let iopl = (self.regs.flags.value() & FLAG_IOPL) >> 12;
            if cpl > 0 {
                mask &= !FLAG_IOPL;
            }
            if cpl > iopl {
                mask &= !FLAG_IF;
            }
        }
        mask & size.mask()
    }

    /// ENTER alloc, level
    ///
    /// Levels above zero copy `level - 1` outer frame pointers from the old
    /// frame and then push the new frame pointer.
    pub(super) fn exec_enter(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (alloc, level) = Self::binary(insn)?;
        let alloc = self.read_operand(&alloc) & 0xFFFF;
        let level = self.read_operand(&level) & 0x1F;
        let size = insn.op_size();
        let stack = self.regs.stack_size();

        let bp = self.regs.gpr(EBP, size);
        self.push(bp, size);
        let frame = self.regs.stack_pointer();

        if level > 0 {
            let mut outer = self.regs.gpr(EBP, stack);
            for _ in 1..level {
                outer = outer.wrapping_sub(size.bytes()) & stack.mask();
                let link = self.read_at(Address::new(SegmentId::SS, outer), 0, size);
                self.push(link, size);
            }
            self.push(frame, size);
        }

        self.regs.set_gpr(EBP, size, frame);
        let sp = self.regs.stack_pointer().wrapping_sub(alloc) & stack.mask();
        self.regs.set_stack_pointer(sp);
        Ok(())
    }

    /// (E)SP <- (E)BP, then pop (E)BP
    pub(super) fn exec_leave(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let stack = self.regs.stack_size();
        let bp = self.regs.gpr(EBP, stack);
        self.regs.set_stack_pointer(bp);
        let value = self.pop(insn.op_size());
        self.regs.set_gpr(EBP, insn.op_size(), value);
        Ok(())
    }
}
