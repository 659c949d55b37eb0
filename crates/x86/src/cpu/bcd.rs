//! Decimal adjust: DAA, DAS, AAA, AAS, AAM, AAD

use super::Cpu;
use crate::bus::Bus;
use crate::error::{ExecError, Fault};
use crate::flags::{FlagOp, FLAG_AF, FLAG_CF, FLAG_OF};
use crate::instruction::{Instruction, Operands};
use crate::operand::{OperandSize, RegId};

impl<B: Bus> Cpu<B> {
    /// Commit SF/ZF/PF from AL plus explicit AF/CF; OF is undefined and cleared
    fn set_bcd_flags(&mut self, al: u32, af: bool, cf: bool) {
        let flags = &mut self.regs.flags;
        flags.set_flags_result(FlagOp::Result, OperandSize::Byte, al);
        flags.set(FLAG_AF, af);
        flags.set(FLAG_CF, cf);
        flags.set(FLAG_OF, false);
    }

    /// Immediate base for AAM/AAD, 10 when the decoder omits it
    fn bcd_base(&self, insn: &Instruction) -> Result<u32, ExecError> {
        match insn.operands {
            Operands::None => Ok(10),
            Operands::Unary(imm) => Ok(self.read_operand(&imm) & 0xFF),
            _ => Err(Self::mismatch(insn, "expected an optional base")),
        }
    }

    pub(super) fn exec_daa(&mut self) -> Result<(), ExecError> {
        let old_al = self.regs.read(RegId::AL);
        let old_cf = self.regs.flags.get(FLAG_CF);
        let mut al = old_al;
        let mut cf = false;
        let af = (al & 0x0F) > 9 || self.regs.flags.get(FLAG_AF);
        if af {
            cf = old_cf || al > 0xF9;
            al = (al + 0x06) & 0xFF;
        }
        if old_al > 0x99 || old_cf {
            al = (al + 0x60) & 0xFF;
            cf = true;
        }
        self.regs.write(RegId::AL, al);
        self.set_bcd_flags(al, af, cf);
        Ok(())
    }

    pub(super) fn exec_das(&mut self) -> Result<(), ExecError> {
        let old_al = self.regs.read(RegId::AL);
        let old_cf = self.regs.flags.get(FLAG_CF);
        let mut al = old_al;
        let mut cf = false;
        let af = (al & 0x0F) > 9 || self.regs.flags.get(FLAG_AF);
        if af {
            cf = old_cf || al < 0x06;
            al = al.wrapping_sub(0x06) & 0xFF;
        }
        if old_al > 0x99 || old_cf {
            al = al.wrapping_sub(0x60) & 0xFF;
            cf = true;
        }
        self.regs.write(RegId::AL, al);
        self.set_bcd_flags(al, af, cf);
        Ok(())
    }

    /// ASCII adjust after addition
    ///
    /// The 8086 adds 6 to AL alone; later parts add 0x106 to AX so a carry
    /// out of AL reaches AH.
    pub(super) fn exec_aaa(&mut self) -> Result<(), ExecError> {
        let ax = self.regs.read(RegId::AX);
        let adjust = (ax & 0x0F) > 9 || self.regs.flags.get(FLAG_AF);
        let ax = if !adjust {
            ax
        } else if self.config.model.supports_80286_instructions() {
            ax.wrapping_add(0x106)
        } else {
            let al = (ax + 6) & 0xFF;
            let ah = ((ax >> 8) + 1) & 0xFF;
            (ah << 8) | al
        };
        let ax = ax & 0xFF0F;
        self.regs.write(RegId::AX, ax);
        self.set_bcd_flags(ax & 0xFF, adjust, adjust);
        Ok(())
    }

    /// ASCII adjust after subtraction
    pub(super) fn exec_aas(&mut self) -> Result<(), ExecError> {
        let ax = self.regs.read(RegId::AX);
        let adjust = (ax & 0x0F) > 9 || self.regs.flags.get(FLAG_AF);
        let ax = if !adjust {
            ax
        } else if self.config.model.supports_80286_instructions() {
            ax.wrapping_sub(6).wrapping_sub(0x100)
        } else {
            let al = ax.wrapping_sub(6) & 0xFF;
            let ah = (ax >> 8).wrapping_sub(1) & 0xFF;
            (ah << 8) | al
        };
        let ax = ax & 0xFF0F;
        self.regs.write(RegId::AX, ax);
        self.set_bcd_flags(ax & 0xFF, adjust, adjust);
        Ok(())
    }

    /// AH = AL / base, AL = AL % base; base 0 raises #DE
    pub(super) fn exec_aam(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let base = self.bcd_base(insn)?;
        if base == 0 {
            return Err(Fault::DivideError.into());
        }
        let al = self.regs.read(RegId::AL);
        let result_al = al % base;
        self.regs.write(RegId::AX, ((al / base) << 8) | result_al);
        self.set_bcd_flags(result_al, false, false);
        Ok(())
    }

    /// AL = AL + AH * base, AH = 0
    pub(super) fn exec_aad(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let base = self.bcd_base(insn)?;
        let al = self.regs.read(RegId::AL);
        let ah = self.regs.read(RegId::AH);
        let result = (al + ah * base) & 0xFF;
        self.regs.write(RegId::AX, result);
        self.set_bcd_flags(result, false, false);
        Ok(())
    }
}
