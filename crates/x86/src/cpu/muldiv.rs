//! MUL/IMUL/DIV/IDIV
//!
//! Widening forms use the accumulator pair for the operand width:
//! AX <- AL*r/m8, DX:AX <- AX*r/m16, EDX:EAX <- EAX*r/m32. Divides check
//! for a zero divisor and an unrepresentable quotient before writing
//! anything.

use super::Cpu;
use crate::bus::Bus;
use crate::error::{ExecError, Fault};
use crate::flags::{FlagOp, FLAG_AF, FLAG_CF, FLAG_OF};
use crate::instruction::{Instruction, Operands};
use crate::operand::{Operand, OperandSize};
use crate::registers::{EAX, EDX};

impl<B: Bus> Cpu<B> {
    /// Double-width accumulator value used as a dividend
    fn accumulator_pair(&self, size: OperandSize) -> u64 {
        match size {
            OperandSize::Byte => self.regs.gpr(EAX, OperandSize::Word) as u64,
            OperandSize::Word => {
                ((self.regs.gpr(EDX, OperandSize::Word) as u64) << 16)
                    | self.regs.gpr(EAX, OperandSize::Word) as u64
            }
            OperandSize::Dword => {
                ((self.regs.gpr32(EDX) as u64) << 32) | self.regs.gpr32(EAX) as u64
            }
        }
    }

    /// Store a double-width product
    fn set_accumulator_pair(&mut self, size: OperandSize, value: u64) {
        match size {
            OperandSize::Byte => self.regs.set_gpr(EAX, OperandSize::Word, value as u32),
            _ => {
                self.regs.set_gpr(EAX, size, value as u32);
                self.regs.set_gpr(EDX, size, (value >> size.bits()) as u32);
            }
        }
    }

    /// Store quotient and remainder
    fn set_quotient(&mut self, size: OperandSize, quotient: u32, remainder: u32) {
        match size {
            OperandSize::Byte => {
                let ax = (quotient & 0xFF) | ((remainder & 0xFF) << 8);
                self.regs.set_gpr(EAX, OperandSize::Word, ax);
            }
            _ => {
                self.regs.set_gpr(EAX, size, quotient);
                self.regs.set_gpr(EDX, size, remainder);
            }
        }
    }

    /// CF = OF = overflow; SF/ZF/PF follow the low half
    fn set_multiply_flags(&mut self, size: OperandSize, low: u32, overflow: bool) {
        let flags = &mut self.regs.flags;
        flags.set_flags_result(FlagOp::Result, size, low);
        flags.set(FLAG_CF, overflow);
        flags.set(FLAG_OF, overflow);
        flags.set(FLAG_AF, false);
    }

    pub(super) fn exec_mul(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let src = Self::unary(insn)?;
        let size = src.size;
        let a = self.regs.gpr(EAX, size) as u64;
        let b = self.read_operand(&src) as u64;
        let product = a * b;
        self.set_accumulator_pair(size, product);
        let high = product >> size.bits();
        self.set_multiply_flags(size, product as u32 & size.mask(), high != 0);
        Ok(())
    }

    /// IMUL in its one, two and three operand forms
    pub(super) fn exec_imul(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        match insn.operands {
            Operands::Unary(src) => {
                let size = src.size;
                let a = size.signed(self.regs.gpr(EAX, size));
                let b = size.signed(self.read_operand(&src));
                let product = a * b;
                self.set_accumulator_pair(size, product as u64);
                let low = product as u32 & size.mask();
                self.set_multiply_flags(size, low, size.signed(low) != product);
                Ok(())
            }
            Operands::Binary(dst, src) => {
                let a = dst.size.signed(self.read_operand(&dst));
                let b = src.size.signed(self.read_operand(&src));
                self.imul_truncated(&dst, a, b)
            }
            Operands::Ternary(dst, src, imm) => {
                let a = src.size.signed(self.read_operand(&src));
                let b = imm.size.signed(self.read_operand(&imm));
                self.imul_truncated(&dst, a, b)
            }
            Operands::None => Err(Self::mismatch(insn, "IMUL needs operands")),
        }
    }

    fn imul_truncated(&mut self, dst: &Operand, a: i64, b: i64) -> Result<(), ExecError> {
        let size = dst.size;
        let product = a * b;
        let low = product as u32 & size.mask();
        self.write_operand(dst, low)?;
        self.set_multiply_flags(size, low, size.signed(low) != product);
        Ok(())
    }

    /// Unsigned divide; flags are left as they were
    pub(super) fn exec_div(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let src = Self::unary(insn)?;
        let size = src.size;
        let divisor = self.read_operand(&src) as u64;
        if divisor == 0 {
            return Err(Fault::DivideError.into());
        }
        let dividend = self.accumulator_pair(size);
        let quotient = dividend / divisor;
        if quotient > size.mask() as u64 {
            return Err(Fault::DivideError.into());
        }
        let remainder = dividend % divisor;
        self.set_quotient(size, quotient as u32, remainder as u32);
        Ok(())
    }

    /// Signed divide; quotient truncates toward zero, remainder takes the
    /// dividend's sign
    pub(super) fn exec_idiv(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let src = Self::unary(insn)?;
        let size = src.size;
        let divisor = size.signed(self.read_operand(&src)) as i128;
        if divisor == 0 {
            return Err(Fault::DivideError.into());
        }
        let wide = size.widened().unwrap_or(OperandSize::Dword);
        let raw = self.accumulator_pair(size);
        let dividend = match size {
            OperandSize::Dword => raw as i64 as i128,
            _ => wide.signed(raw as u32) as i128,
        };
        let quotient = dividend / divisor;
        let max = (size.sign_bit() - 1) as i128;
        let min = -(size.sign_bit() as i128);
        if quotient > max || quotient < min {
            return Err(Fault::DivideError.into());
        }
        let remainder = dividend % divisor;
        self.set_quotient(
            size,
            quotient as u32 & size.mask(),
            remainder as u32 & size.mask(),
        );
        Ok(())
    }
}
