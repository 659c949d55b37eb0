//! String instructions and the repeat iterator
//!
//! A repeat prefix runs the element operation while the count register is
//! non-zero, decrementing it after each element and checking the ZF
//! condition after CMPS/SCAS. The count left in (E)CX is exactly the number
//! of elements not processed. CMPS/SCAS commit flags once, from the last
//! comparison.

use super::Cpu;
use crate::bus::Bus;
use crate::error::ExecError;
use crate::flags::{FlagOp, FLAG_DF};
use crate::instruction::{Instruction, Mnemonic, Operands, RepeatPrefix};
use crate::logging::{log, LogCategory, LogLevel};
use crate::operand::{Address, OperandSize, SegmentId};
use crate::registers::{EAX, ECX, EDI, EDX, ESI};

/// Operands of the last CMPS/SCAS comparison
#[derive(Debug, Clone, Copy)]
struct Comparison {
    left: u32,
    right: u32,
}

impl<B: Bus> Cpu<B> {
    /// Element width: the first memory operand, else the first operand,
    /// else the operand-size attribute
    fn string_element_size(insn: &Instruction) -> OperandSize {
        let ops = match insn.operands {
            Operands::None => return insn.op_size(),
            Operands::Unary(a) => [Some(a), None, None],
            Operands::Binary(a, b) => [Some(a), Some(b), None],
            Operands::Ternary(a, b, c) => [Some(a), Some(b), Some(c)],
        };
        ops.iter()
            .flatten()
            .find(|op| op.is_memory())
            .or_else(|| ops[0].as_ref())
            .map_or(insn.op_size(), |op| op.size)
    }

    /// Advance (E)SI or (E)DI by one element in the DF direction
    fn step_index(&mut self, index: usize, addr_size: OperandSize, size: OperandSize) {
        let delta = if self.regs.flags.get(FLAG_DF) {
            size.bytes().wrapping_neg()
        } else {
            size.bytes()
        };
        let value = self.regs.gpr(index, addr_size).wrapping_add(delta);
        self.regs.set_gpr(index, addr_size, value);
    }

    /// One element of the string operation; returns the comparison for
    /// CMPS/SCAS
    fn string_element(
        &mut self,
        insn: &Instruction,
        size: OperandSize,
    ) -> Option<Comparison> {
        let addr_size = insn.addr_size();
        let source = Address::new(
            insn.segment_override.unwrap_or(SegmentId::DS),
            self.regs.gpr(ESI, addr_size),
        );
        let dest = Address::new(SegmentId::ES, self.regs.gpr(EDI, addr_size));
        let port = self.regs.gpr(EDX, OperandSize::Word) as u16;

        match insn.mnemonic {
            Mnemonic::Movs => {
                let value = self.read_at(source, 0, size);
                let linear = self.linear(dest);
                self.bus.write_linear(linear, value, size);
                self.step_index(ESI, addr_size, size);
                self.step_index(EDI, addr_size, size);
                None
            }
            Mnemonic::Cmps => {
                let left = self.read_at(source, 0, size);
                let right = self.read_at(dest, 0, size);
                self.step_index(ESI, addr_size, size);
                self.step_index(EDI, addr_size, size);
                Some(Comparison { left, right })
            }
            Mnemonic::Scas => {
                let left = self.regs.gpr(EAX, size);
                let right = self.read_at(dest, 0, size);
                self.step_index(EDI, addr_size, size);
                Some(Comparison { left, right })
            }
            Mnemonic::Lods => {
                let value = self.read_at(source, 0, size);
                self.regs.set_gpr(EAX, size, value);
                self.step_index(ESI, addr_size, size);
                None
            }
            Mnemonic::Stos => {
                let value = self.regs.gpr(EAX, size);
                let linear = self.linear(dest);
                self.bus.write_linear(linear, value, size);
                self.step_index(EDI, addr_size, size);
                None
            }
            Mnemonic::Ins => {
                let value = self.bus.io_read(port, size) & size.mask();
                let linear = self.linear(dest);
                self.bus.write_linear(linear, value, size);
                self.step_index(EDI, addr_size, size);
                None
            }
            _ => {
                let value = self.read_at(source, 0, size);
                self.bus.io_write(port, value, size);
                self.step_index(ESI, addr_size, size);
                None
            }
        }
    }

    pub(super) fn exec_string(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let size = Self::string_element_size(insn);

        if insn.repeat == RepeatPrefix::None {
            if let Some(cmp) = self.string_element(insn, size) {
                self.commit_comparison(size, cmp);
            }
            return Ok(());
        }

        let addr_size = insn.addr_size();
        let budget = self.config.rep_iteration_limit.map(|limit| limit.max(1));
        let mut count = self.regs.gpr(ECX, addr_size);
        let mut iterations = 0u32;
        let mut last = None;

        while count != 0 {
            if budget == Some(iterations) {
                self.suspend_string(insn, count);
                break;
            }
            let cmp = self.string_element(insn, size);
            count = count.wrapping_sub(1) & addr_size.mask();
            iterations += 1;
            if let Some(cmp) = cmp {
                last = Some(cmp);
                let equal = cmp.left == cmp.right;
                let stop = match insn.repeat {
                    RepeatPrefix::RepE => !equal,
                    _ => equal,
                };
                if stop {
                    break;
                }
            }
        }

        self.regs.set_gpr(ECX, addr_size, count);
        if let Some(cmp) = last {
            self.commit_comparison(size, cmp);
        }
        Ok(())
    }

    fn commit_comparison(&mut self, size: OperandSize, cmp: Comparison) {
        let result = cmp.left.wrapping_sub(cmp.right) & size.mask();
        self.regs
            .flags
            .set_flags(FlagOp::Sub, size, cmp.left, cmp.right, result);
    }

    /// Budget exhausted: rewind to the instruction so the next call resumes
    fn suspend_string(&mut self, insn: &Instruction, remaining: u32) {
        self.regs.eip = self.instruction_start;
        self.suspended = true;
        log(LogCategory::Strings, LogLevel::Debug, || {
            format!(
                "{:?} suspended at {:04X}:{:08X} with {} elements left",
                insn.mnemonic,
                self.regs.selector(SegmentId::CS),
                self.instruction_start,
                remaining
            )
        });
    }
}
