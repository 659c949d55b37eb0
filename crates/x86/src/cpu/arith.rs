//! Integer ALU: ADD/ADC/SUB/SBB/CMP, AND/OR/XOR/TEST, NEG, NOT, INC, DEC

use super::Cpu;
use crate::bus::Bus;
use crate::error::ExecError;
use crate::flags::{FlagOp, FLAG_CF};
use crate::instruction::{Instruction, Mnemonic};

impl<B: Bus> Cpu<B> {
    /// Two-operand ALU group
    ///
    /// The source is sign-extended from its own width for the arithmetic
    /// forms and read unsigned for the logical ones. CMP and TEST only
    /// update flags.
    pub(super) fn exec_alu(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, src) = Self::binary(insn)?;
        let size = dst.size;
        let mask = size.mask();
        let a = self.read_operand(&dst);
        let raw = self.read_operand(&src);
        let logical = matches!(
            insn.mnemonic,
            Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test
        );
        let b = if logical { raw } else { src.sign_extend(raw) } & mask;
        let carry = self.regs.flags.get(FLAG_CF);

        let result = match insn.mnemonic {
            Mnemonic::Add => a.wrapping_add(b),
            Mnemonic::Adc => a.wrapping_add(b).wrapping_add(carry as u32),
            Mnemonic::Sub | Mnemonic::Cmp => a.wrapping_sub(b),
            Mnemonic::Sbb => a.wrapping_sub(b).wrapping_sub(carry as u32),
            Mnemonic::And | Mnemonic::Test => a & b,
            Mnemonic::Or => a | b,
            _ => a ^ b,
        } & mask;

        if !matches!(insn.mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
            self.write_operand(&dst, result)?;
        }

        let flags = &mut self.regs.flags;
        match insn.mnemonic {
            Mnemonic::Add => flags.set_flags(FlagOp::Add, size, a, b, result),
            Mnemonic::Sub | Mnemonic::Cmp => flags.set_flags(FlagOp::Sub, size, a, b, result),
            Mnemonic::Adc => flags.set_flags_with_carry(FlagOp::Adc, size, a, b, result, carry),
            Mnemonic::Sbb => flags.set_flags_with_carry(FlagOp::Sbb, size, a, b, result, carry),
            _ => flags.set_flags_result(FlagOp::Logic, size, result),
        }
        Ok(())
    }

    pub(super) fn exec_neg(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let dst = Self::unary(insn)?;
        let value = self.read_operand(&dst);
        let result = 0u32.wrapping_sub(value) & dst.mask();
        self.write_operand(&dst, result)?;
        self.regs
            .flags
            .set_flags_op1(FlagOp::Neg, dst.size, value, result);
        Ok(())
    }

    /// NOT affects no flags
    pub(super) fn exec_not(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let dst = Self::unary(insn)?;
        let value = self.read_operand(&dst);
        self.write_operand(&dst, !value)
    }

    /// INC/DEC leave CF as the previous instruction left it
    pub(super) fn exec_inc_dec(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let dst = Self::unary(insn)?;
        let value = self.read_operand(&dst);
        let (op, result) = if insn.mnemonic == Mnemonic::Inc {
            (FlagOp::Inc, value.wrapping_add(1))
        } else {
            (FlagOp::Dec, value.wrapping_sub(1))
        };
        let result = result & dst.mask();
        self.write_operand(&dst, result)?;
        self.regs.flags.set_flags_op1(op, dst.size, value, result);
        Ok(())
    }
}
