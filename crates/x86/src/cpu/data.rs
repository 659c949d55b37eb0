//! Data movement: MOV family, exchanges, far pointer loads, conversions,
//! flag transfers and SETcc

use super::Cpu;
use crate::bus::Bus;
use crate::error::ExecError;
use crate::flags::{FlagOp, FLAG_AF, FLAG_CF, FLAG_PF, FLAG_SF, FLAG_ZF};
use crate::instruction::{Condition, Instruction, Mnemonic, Operands};
use crate::operand::{Operand, OperandSize, RegId, SegmentId};
use crate::registers::{EAX, EBX, EDX};

/// Flags copied by LAHF/SAHF
const AH_FLAGS: u32 = FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF;

impl<B: Bus> Cpu<B> {
    pub(super) fn exec_mov(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, src) = Self::binary(insn)?;
        let value = self.read_operand(&src);
        self.write_operand(&dst, value)?;
        self.note_stack_segment_write(&dst);
        Ok(())
    }

    pub(super) fn exec_mov_extend(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, src) = Self::binary(insn)?;
        let raw = self.read_operand(&src);
        let value = if insn.mnemonic == Mnemonic::Movsx {
            src.sign_extend(raw)
        } else {
            raw
        };
        self.write_operand(&dst, value)
    }

    pub(super) fn exec_xchg(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (a, b) = Self::binary(insn)?;
        let va = self.read_operand(&a);
        let vb = self.read_operand(&b);
        self.write_operand(&a, vb)?;
        self.write_operand(&b, va)
    }

    /// XADD dst, src: src <- dst, dst <- dst + src
    pub(super) fn exec_xadd(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, src) = Self::binary(insn)?;
        let a = self.read_operand(&dst);
        let b = self.read_operand(&src);
        let sum = a.wrapping_add(b) & dst.mask();
        self.write_operand(&src, a)?;
        self.write_operand(&dst, sum)?;
        self.regs.flags.set_flags(FlagOp::Add, dst.size, a, b, sum);
        Ok(())
    }

    /// CMPXCHG dst, src: compare the accumulator with dst
    pub(super) fn exec_cmpxchg(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, src) = Self::binary(insn)?;
        let size = dst.size;
        let acc = self.regs.gpr(EAX, size);
        let current = self.read_operand(&dst);
        let result = acc.wrapping_sub(current) & size.mask();
        if acc == current {
            let value = self.read_operand(&src);
            self.write_operand(&dst, value)?;
        } else {
            self.regs.set_gpr(EAX, size, current);
        }
        self.regs
            .flags
            .set_flags(FlagOp::Sub, size, acc, current, result);
        Ok(())
    }

    pub(super) fn exec_bswap(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let reg = Self::unary(insn)?;
        if reg.size != OperandSize::Dword {
            return Err(Self::mismatch(insn, "BSWAP needs a 32-bit register"));
        }
        let value = self.read_operand(&reg);
        self.write_operand(&reg, value.swap_bytes())
    }

    /// LEA stores the effective address itself, truncated to the destination
    pub(super) fn exec_lea(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, src) = Self::binary(insn)?;
        let addr = Self::memory_address(insn, &src)?;
        self.write_operand(&dst, addr.offset)
    }

    /// LDS/LES/LFS/LGS/LSS reg, m16:16 or m16:32
    ///
    /// The segment is loaded first so a bad selector leaves the register
    /// untouched.
    pub(super) fn exec_load_far_pointer(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, src) = Self::binary(insn)?;
        let addr = Self::memory_address(insn, &src)?;
        let seg = match insn.mnemonic {
            Mnemonic::Lds => SegmentId::DS,
            Mnemonic::Les => SegmentId::ES,
            Mnemonic::Lfs => SegmentId::FS,
            Mnemonic::Lgs => SegmentId::GS,
            _ => SegmentId::SS,
        };
        let offset = self.read_at(addr, 0, dst.size);
        let selector = self.read_at(addr, dst.size.bytes(), OperandSize::Word) as u16;
        self.load_segment(seg, selector)?;
        self.write_operand(&dst, offset)
    }

    /// AL <- [seg:(E)BX + AL]
    pub(super) fn exec_xlat(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let addr_size = insn.addr_size();
        let segment = insn.segment_override.unwrap_or(SegmentId::DS);
        let offset = self
            .regs
            .gpr(EBX, addr_size)
            .wrapping_add(self.regs.read(RegId::AL))
            & addr_size.mask();
        let table = Operand::mem(segment, offset, OperandSize::Byte);
        let value = self.read_operand(&table);
        self.regs.write(RegId::AL, value);
        Ok(())
    }

    /// CBW / CWDE
    pub(super) fn exec_cbw(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        if insn.operand_size_32 {
            let ax = self.regs.read(RegId::AX);
            self.regs.write(RegId::EAX, OperandSize::Word.sign_extend(ax));
        } else {
            let al = self.regs.read(RegId::AL);
            self.regs.write(RegId::AX, OperandSize::Byte.sign_extend(al));
        }
        Ok(())
    }

    /// CWD / CDQ
    pub(super) fn exec_cwd(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let size = insn.op_size();
        let acc = self.regs.gpr(EAX, size);
        let fill = if acc & size.sign_bit() != 0 { size.mask() } else { 0 };
        self.regs.set_gpr(EDX, size, fill);
        Ok(())
    }

    pub(super) fn exec_lahf(&mut self) -> Result<(), ExecError> {
        let flags = self.regs.flags.value() & (AH_FLAGS | 0x02);
        self.regs.write(RegId::AH, flags);
        Ok(())
    }

    pub(super) fn exec_sahf(&mut self) -> Result<(), ExecError> {
        let ah = self.regs.read(RegId::AH);
        self.regs.flags.load(ah, AH_FLAGS);
        Ok(())
    }

    /// Undocumented: AL = CF ? 0xFF : 0x00
    pub(super) fn exec_salc(&mut self) -> Result<(), ExecError> {
        let value = if self.regs.flags.get(FLAG_CF) { 0xFF } else { 0x00 };
        self.regs.write(RegId::AL, value);
        Ok(())
    }

    pub(super) fn exec_setcc(
        &mut self,
        insn: &Instruction,
        condition: Condition,
    ) -> Result<(), ExecError> {
        let dst = Self::unary(insn)?;
        let value = self.regs.flags.condition(condition) as u32;
        self.write_operand(&dst, value)
    }

    /// IN acc, port
    pub(super) fn exec_in(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (dst, port) = Self::binary(insn)?;
        let port = self.read_operand(&port) as u16;
        let value = self.bus.io_read(port, dst.size);
        self.write_operand(&dst, value)
    }

    /// OUT port, acc
    pub(super) fn exec_out(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let (port, src) = Self::binary(insn)?;
        let port = self.read_operand(&port) as u16;
        let value = self.read_operand(&src);
        self.bus.io_write(port, value, src.size);
        Ok(())
    }

    /// SLDT/STR: 16-bit selector into r/m16, zero-extended into r32
    pub(super) fn exec_store_selector(
        &mut self,
        insn: &Instruction,
        selector: u16,
    ) -> Result<(), ExecError> {
        let dst = Self::unary(insn)?;
        self.require_protected_mode()?;
        self.write_operand(&dst, selector as u32)
    }

    /// Form check shared by the table-register loads
    pub(crate) fn memory_only(insn: &Instruction) -> Result<Operand, ExecError> {
        match insn.operands {
            Operands::Unary(op) if op.is_memory() => Ok(op),
            _ => Err(Self::mismatch(insn, "expected a memory operand")),
        }
    }
}
