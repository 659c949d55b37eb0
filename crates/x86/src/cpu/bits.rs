//! Bit test and scan: BT, BTS, BTR, BTC, BSF, BSR

use super::Cpu;
use crate::bus::Bus;
use crate::error::ExecError;
use crate::flags::{FLAG_CF, FLAG_ZF};
use crate::instruction::{Instruction, Mnemonic};
use crate::operand::{Operand, OperandKind};

impl<B: Bus> Cpu<B> {
    /// BT family
    ///
    /// With a register bit offset and a memory base the offset is signed and
    /// may select a unit outside the addressed operand.
    pub(super) fn exec_bit_test(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (base, offset) = Self::binary(insn)?;
        let size = base.size;
        let bits = size.bits() as i64;
        let raw = self.read_operand(&offset);

        let (target, bit) = match base.kind {
            OperandKind::Memory(addr) if !offset.is_immediate() => {
                let signed = offset.size.signed(raw);
                let unit = signed.div_euclid(bits);
                let delta = (unit * size.bytes() as i64) as u32;
                let moved = Operand {
                    kind: OperandKind::Memory(addr.offset_by(delta)),
                    size,
                };
                (moved, signed.rem_euclid(bits) as u32)
            }
            _ => (base, raw & (size.bits() - 1)),
        };

        let value = self.read_operand(&target);
        let mask = 1u32 << bit;
        self.regs.flags.set(FLAG_CF, value & mask != 0);
        let updated = match insn.mnemonic {
            Mnemonic::Bts => value | mask,
            Mnemonic::Btr => value & !mask,
            Mnemonic::Btc => value ^ mask,
            _ => return Ok(()),
        };
        self.write_operand(&target, updated)
    }

    /// BSF/BSR: ZF=1 and destination untouched when the source is zero
    pub(super) fn exec_bit_scan(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, src) = Self::binary(insn)?;
        let value = self.read_operand(&src);
        if value == 0 {
            self.regs.flags.set(FLAG_ZF, true);
            return Ok(());
        }
        let index = if insn.mnemonic == Mnemonic::Bsf {
            value.trailing_zeros()
        } else {
            31 - value.leading_zeros()
        };
        self.write_operand(&dst, index)?;
        self.regs.flags.set(FLAG_ZF, false);
        Ok(())
    }
}
