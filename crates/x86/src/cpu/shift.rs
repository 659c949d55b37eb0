//! Shifts and rotates
//!
//! The count is masked to 5 bits. A zero count changes nothing, flags
//! included. CF takes the last bit shifted out; OF follows the documented
//! single-bit formulas and is computed the same way for larger counts.
//! Rotates touch only CF and OF.

use super::Cpu;
use crate::bus::Bus;
use crate::error::ExecError;
use crate::flags::{FlagOp, FLAG_AF, FLAG_CF, FLAG_OF};
use crate::instruction::{Instruction, Mnemonic, Operands};
use crate::operand::{Operand, OperandSize};

/// SHL/SHR/SAR on a value of `size`; returns (result, CF, OF)
pub(crate) fn shift(op: Mnemonic, size: OperandSize, value: u32, count: u32) -> (u32, bool, bool) {
    let bits = size.bits();
    let mask = size.mask();
    let sign = size.sign_bit();
    match op {
        Mnemonic::Shl => {
            let result = if count < bits { (value << count) & mask } else { 0 };
            let cf = count <= bits && (value >> (bits - count)) & 1 != 0;
            let of = (result & sign != 0) != cf;
            (result, cf, of)
        }
        Mnemonic::Shr => {
            let result = if count < bits { value >> count } else { 0 };
            let cf = count <= bits && (value >> (count - 1)) & 1 != 0;
            (result, cf, value & sign != 0)
        }
        _ => {
            // Arithmetic shift replicates the sign bit for every count
            let signed = size.signed(value);
            let result = (signed >> count.min(bits - 1)) as u32 & mask;
            let cf = (signed >> (count - 1).min(bits - 1)) & 1 != 0;
            (result, cf, false)
        }
    }
}

/// ROL/ROR/RCL/RCR; returns (result, CF, OF)
pub(crate) fn rotate(
    op: Mnemonic,
    size: OperandSize,
    value: u32,
    count: u32,
    carry: bool,
) -> (u32, bool, bool) {
    let bits = size.bits();
    let mask = size.mask();
    let sign = size.sign_bit();
    match op {
        Mnemonic::Rol => {
            let n = count % bits;
            let result = if n == 0 { value } else { ((value << n) | (value >> (bits - n))) & mask };
            let cf = result & 1 != 0;
            (result, cf, (result & sign != 0) != cf)
        }
        Mnemonic::Ror => {
            let n = count % bits;
            let result = if n == 0 { value } else { ((value >> n) | (value << (bits - n))) & mask };
            let cf = result & sign != 0;
            (result, cf, ((result ^ (result << 1)) & sign) != 0)
        }
        Mnemonic::Rcl => {
            // Rotate through a bits+1 wide value with CF on top
            let width = bits + 1;
            let n = count % width;
            let wide = ((carry as u64) << bits) | value as u64;
            let full = (1u64 << width) - 1;
            let rotated = ((wide << n) | (wide >> (width - n))) & full;
            let result = rotated as u32 & mask;
            let cf = (rotated >> bits) & 1 != 0;
            (result, cf, (result & sign != 0) != cf)
        }
        _ => {
            let width = bits + 1;
            let n = count % width;
            let wide = ((carry as u64) << bits) | value as u64;
            let full = (1u64 << width) - 1;
            let rotated = ((wide >> n) | (wide << (width - n))) & full;
            let result = rotated as u32 & mask;
            let cf = (rotated >> bits) & 1 != 0;
            (result, cf, ((result ^ (result << 1)) & sign) != 0)
        }
    }
}

impl<B: Bus> Cpu<B> {
    /// Destination and 5-bit count; a missing count means 1
    fn shift_operands(insn: &Instruction) -> Result<(Operand, Option<Operand>), ExecError> {
        match insn.operands {
            Operands::Unary(dst) => Ok((dst, None)),
            Operands::Binary(dst, count) => Ok((dst, Some(count))),
            _ => Err(Self::mismatch(insn, "expected destination and count")),
        }
    }

    fn shift_count(&self, count: Option<Operand>) -> u32 {
        count.map_or(1, |op| self.read_operand(&op)) & 0x1F
    }

    pub(super) fn exec_shift(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, count) = Self::shift_operands(insn)?;
        let count = self.shift_count(count);
        if count == 0 {
            return Ok(());
        }
        let value = self.read_operand(&dst);
        let (result, cf, of) = shift(insn.mnemonic, dst.size, value, count);
        self.write_operand(&dst, result)?;
        let flags = &mut self.regs.flags;
        flags.set_flags_result(FlagOp::Result, dst.size, result);
        flags.set(FLAG_CF, cf);
        flags.set(FLAG_OF, of);
        flags.set(FLAG_AF, false);
        Ok(())
    }

    pub(super) fn exec_rotate(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, count) = Self::shift_operands(insn)?;
        let count = self.shift_count(count);
        if count == 0 {
            return Ok(());
        }
        let value = self.read_operand(&dst);
        let carry = self.regs.flags.get(FLAG_CF);
        let (result, cf, of) = rotate(insn.mnemonic, dst.size, value, count, carry);
        self.write_operand(&dst, result)?;
        self.regs.flags.set(FLAG_CF, cf);
        self.regs.flags.set(FLAG_OF, of);
        Ok(())
    }

    /// SHLD/SHRD dst, src, count
    pub(super) fn exec_double_shift(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let Operands::Ternary(dst, src, count) = insn.operands else {
            return Err(Self::mismatch(insn, "expected destination, source and count"));
        };
        let count = self.read_operand(&count) & 0x1F;
        if count == 0 {
            return Ok(());
        }
        let size = dst.size;
        let bits = size.bits();
        let value = self.read_operand(&dst);
        let fill = self.read_operand(&src);

        let (result, cf) = if insn.mnemonic == Mnemonic::Shld {
            let wide = ((value as u64) << bits) | fill as u64;
            let result = ((wide << count) >> bits) as u32 & size.mask();
            (result, (wide >> (2 * bits - count)) & 1 != 0)
        } else {
            let wide = ((fill as u64) << bits) | value as u64;
            let result = (wide >> count) as u32 & size.mask();
            (result, (wide >> (count - 1)) & 1 != 0)
        };

        self.write_operand(&dst, result)?;
        let sign = size.sign_bit();
        let flags = &mut self.regs.flags;
        flags.set_flags_result(FlagOp::Result, size, result);
        flags.set(FLAG_CF, cf);
        flags.set(FLAG_OF, (result ^ value) & sign != 0);
        flags.set(FLAG_AF, false);
        Ok(())
    }
}
