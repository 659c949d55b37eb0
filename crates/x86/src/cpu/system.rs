//! Flag control, HLT, WAIT/ESC, CPUID and the system registers
//!
//! Privileged instructions require CPL 0 in protected mode. LLDT and LTR
//! are undefined outside protected mode.

use super::Cpu;
use crate::bus::Bus;
use crate::config::CpuModel;
use crate::error::{ExecError, Fault};
use crate::flags::{FLAG_CF, FLAG_DF, FLAG_IF, FLAG_IOPL};
use crate::instruction::{Instruction, Mnemonic};
use crate::logging::{log, LogCategory, LogLevel};
use crate::operand::OperandSize;
use crate::protected::{access_rights, selector, SystemType};
use crate::registers::{
    DescriptorCache, SegmentRegister, TableRegister, CR0_EM, CR0_MP, CR0_PE, CR0_TS, EAX, EBX,
    ECX, EDX,
};

use super::segment::error_code;

/// CPUID leaf 1 signature: family 4, model 1, stepping 0
const CPUID_SIGNATURE: u32 = 0x0410;

/// CR0 bits visible to LMSW/SMSW
const MSW_BITS: u32 = 0x000F;

impl<B: Bus> Cpu<B> {
    /// #UD unless PE is set
    pub(crate) fn require_protected_mode(&self) -> Result<(), ExecError> {
        if self.regs.is_protected_mode() {
            Ok(())
        } else {
            Err(Fault::InvalidOpcode.into())
        }
    }

    /// #GP(0) for privileged instructions above CPL 0
    fn require_cpl0(&self) -> Result<(), ExecError> {
        if self.cpl() == 0 {
            Ok(())
        } else {
            Err(Fault::GeneralProtection(0).into())
        }
    }

    fn iopl(&self) -> u8 {
        ((self.regs.flags.value() & FLAG_IOPL) >> 12) as u8
    }

    pub(super) fn exec_flag_control(&mut self, mnemonic: Mnemonic) -> Result<(), ExecError> {
        let flags = &mut self.regs.flags;
        match mnemonic {
            Mnemonic::Clc => flags.set(FLAG_CF, false),
            Mnemonic::Stc => flags.set(FLAG_CF, true),
            Mnemonic::Cmc => {
                let carry = flags.get(FLAG_CF);
                flags.set(FLAG_CF, !carry);
            }
            Mnemonic::Cld => flags.set(FLAG_DF, false),
            Mnemonic::Std => flags.set(FLAG_DF, true),
            Mnemonic::Cli | Mnemonic::Sti => {
                if self.regs.is_protected_mode() && self.cpl() > self.iopl() {
                    return Err(Fault::GeneralProtection(0).into());
                }
                let enable = mnemonic == Mnemonic::Sti;
                // STI delays recognition until after the next instruction
                if enable && !self.regs.flags.get(FLAG_IF) {
                    self.interrupt_shadow = true;
                }
                self.regs.flags.set(FLAG_IF, enable);
            }
            _ => {
                return Err(ExecError::OperandMismatch {
                    mnemonic,
                    detail: "not a flag control instruction",
                })
            }
        }
        Ok(())
    }

    pub(super) fn exec_hlt(&mut self) -> Result<(), ExecError> {
        self.require_cpl0()?;
        self.halted = true;
        Ok(())
    }

    /// WAIT faults with #NM when both MP and TS are set
    pub(super) fn exec_wait(&mut self) -> Result<(), ExecError> {
        if self.regs.cr0 & (CR0_MP | CR0_TS) == (CR0_MP | CR0_TS) {
            return Err(Fault::DeviceNotAvailable.into());
        }
        Ok(())
    }

    /// x87 escape: #NM when EM or TS is set, otherwise there is no FPU model
    pub(super) fn exec_escape(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        if self.regs.cr0 & (CR0_EM | CR0_TS) != 0 {
            return Err(Fault::DeviceNotAvailable.into());
        }
        self.unsupported(insn.mnemonic)
    }

    /// CPUID leaf 0 (vendor) and leaf 1 (signature); other leaves read zero
    pub(super) fn exec_cpuid(&mut self) -> Result<(), ExecError> {
        let (a, b, c, d) = match self.regs.gpr32(EAX) {
            0 => (
                1,
                u32::from_le_bytes(*b"Genu"),
                u32::from_le_bytes(*b"ntel"),
                u32::from_le_bytes(*b"ineI"),
            ),
            1 => (CPUID_SIGNATURE, 0, 0, 0),
            _ => (0, 0, 0, 0),
        };
        self.regs.set_gpr32(EAX, a);
        self.regs.set_gpr32(EBX, b);
        self.regs.set_gpr32(ECX, c);
        self.regs.set_gpr32(EDX, d);
        Ok(())
    }

    /// LGDT/LIDT m16&32; a 16-bit operand size keeps 24 bits of base
    pub(super) fn exec_load_table(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let src = Self::memory_only(insn)?;
        self.require_cpl0()?;
        let addr = Self::memory_address(insn, &src)?;
        let limit = self.read_at(addr, 0, OperandSize::Word) as u16;
        let mut base = self.read_at(addr, 2, OperandSize::Dword);
        if !insn.operand_size_32 {
            base &= 0x00FF_FFFF;
        }
        let table = TableRegister { base, limit };
        if insn.mnemonic == Mnemonic::Lgdt {
            self.regs.gdtr = table;
        } else {
            self.regs.idtr = table;
        }
        Ok(())
    }

    /// SGDT/SIDT m16&32; the 80286 stores 0xFF in the unused base byte
    pub(super) fn exec_store_table(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let dst = Self::memory_only(insn)?;
        let addr = Self::memory_address(insn, &dst)?;
        let table = if insn.mnemonic == Mnemonic::Sgdt {
            self.regs.gdtr
        } else {
            self.regs.idtr
        };
        let base = if self.config.model == CpuModel::Intel80286 {
            table.base | 0xFF00_0000
        } else if !insn.operand_size_32 {
            table.base & 0x00FF_FFFF
        } else {
            table.base
        };
        let limit_at = self.linear(addr);
        self.bus
            .write_linear(limit_at, table.limit as u32, OperandSize::Word);
        let base_at = self.linear(addr.offset_by(2));
        self.bus.write_linear(base_at, base, OperandSize::Dword);
        Ok(())
    }

    /// LLDT r/m16: GDT selector of an LDT descriptor, or null
    pub(super) fn exec_lldt(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let src = Self::unary(insn)?;
        self.require_protected_mode()?;
        self.require_cpl0()?;
        let sel = self.read_operand(&src) as u16;
        if selector::is_null(sel) {
            self.regs.ldtr = SegmentRegister {
                selector: sel,
                cache: DescriptorCache::unusable(),
            };
            return Ok(());
        }
        if sel & selector::TI != 0 {
            return Err(Fault::GeneralProtection(error_code(sel)).into());
        }
        let desc = self.descriptor(sel)?;
        if desc.system_type() != Some(SystemType::Ldt) {
            return Err(Fault::GeneralProtection(error_code(sel)).into());
        }
        if !desc.is_present() {
            return Err(Fault::SegmentNotPresent(error_code(sel)).into());
        }
        self.regs.ldtr = SegmentRegister {
            selector: sel,
            cache: DescriptorCache::from_descriptor(&desc),
        };
        Ok(())
    }

    /// LTR r/m16: load an available TSS and mark it busy
    pub(super) fn exec_ltr(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let src = Self::unary(insn)?;
        self.require_protected_mode()?;
        self.require_cpl0()?;
        let sel = self.read_operand(&src) as u16;
        if selector::is_null(sel) || sel & selector::TI != 0 {
            return Err(Fault::GeneralProtection(error_code(sel)).into());
        }
        let desc = self.descriptor(sel)?;
        match desc.system_type() {
            Some(ty) if ty.is_tss() && !ty.is_busy_tss() => {}
            _ => return Err(Fault::GeneralProtection(error_code(sel)).into()),
        }
        if !desc.is_present() {
            return Err(Fault::SegmentNotPresent(error_code(sel)).into());
        }
        self.set_tss_busy(sel, true);
        let mut cache = DescriptorCache::from_descriptor(&desc);
        cache.access |= access_rights::TSS_BUSY;
        self.regs.tr = SegmentRegister {
            selector: sel,
            cache,
        };
        log(LogCategory::TaskSwitch, LogLevel::Debug, || {
            format!("task register loaded with {:04X}", sel)
        });
        Ok(())
    }

    /// LMSW: loads MP/EM/TS and can set, but never clear, PE
    pub(super) fn exec_lmsw(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let src = Self::unary(insn)?;
        self.require_cpl0()?;
        let msw = self.read_operand(&src) & MSW_BITS;
        let pe = (self.regs.cr0 | msw) & CR0_PE;
        self.regs.cr0 = (self.regs.cr0 & !MSW_BITS) | (msw & !CR0_PE) | pe;
        Ok(())
    }

    /// SMSW: low word of CR0 (the whole register into a 32-bit register)
    pub(super) fn exec_smsw(&mut self, insn: &Instruction) -> Result<(), ExecError> {
        let dst = Self::unary(insn)?;
        let value = self.regs.cr0;
        self.write_operand(&dst, value)
    }

    pub(super) fn exec_clts(&mut self) -> Result<(), ExecError> {
        self.require_cpl0()?;
        self.regs.cr0 &= !CR0_TS;
        Ok(())
    }
}
