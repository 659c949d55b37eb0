//! Segment register loads and descriptor bookkeeping
//!
//! Real mode only rebases the segment. Protected mode resolves the selector
//! through the bus, checks type, privilege and presence, then fills the
//! descriptor cache. Only same-privilege transfers are modelled, so CPL
//! never changes here.

use super::Cpu;
use crate::bus::Bus;
use crate::error::{ExecError, Fault};
use crate::operand::{Operand, OperandKind, OperandSize, RegId, SegmentId};
use crate::protected::{access_rights, selector, SegmentDescriptor};
use crate::registers::DescriptorCache;

/// Error-code form of a selector: index and TI with RPL dropped
#[inline]
pub(crate) const fn error_code(sel: u16) -> u16 {
    sel & !selector::RPL_MASK
}

impl<B: Bus> Cpu<B> {
    /// Look up a selector, #GP(selector) when it does not resolve
    pub(crate) fn descriptor(&self, sel: u16) -> Result<SegmentDescriptor, Fault> {
        self.bus
            .resolve_selector(sel, &self.regs.gdtr, &self.regs.ldtr)
            .ok_or(Fault::GeneralProtection(error_code(sel)))
    }

    /// Load a segment register as MOV, POP and the far pointer loads do
    pub(crate) fn load_segment(&mut self, seg: SegmentId, sel: u16) -> Result<(), ExecError> {
        if seg == SegmentId::CS {
            return Err(Fault::InvalidOpcode.into());
        }
        if !self.regs.is_protected_mode() {
            self.regs.set_segment_real(seg, sel);
            return Ok(());
        }
        let cache = self.check_segment(seg, sel, self.cpl())?;
        self.regs.set_segment_cached(seg, sel, cache);
        Ok(())
    }

    /// Validate `sel` for `seg` at privilege `cpl` and build its cache
    ///
    /// A null selector is accepted for the data registers and leaves an
    /// unusable cache with no access rights.
    pub(crate) fn check_segment(
        &self,
        seg: SegmentId,
        sel: u16,
        cpl: u8,
    ) -> Result<DescriptorCache, Fault> {
        if selector::is_null(sel) {
            return match seg {
                SegmentId::CS | SegmentId::SS => Err(Fault::GeneralProtection(0)),
                _ => Ok(DescriptorCache::unusable()),
            };
        }

        let desc = self.descriptor(sel)?;
        let code = error_code(sel);
        let rpl = (sel & selector::RPL_MASK) as u8;
        let dpl = desc.dpl();
        let conforming = desc.access & access_rights::EXPAND_DOWN_CONFORMING != 0;
        let rw = desc.access & access_rights::WRITABLE_READABLE != 0;

        match seg {
            SegmentId::CS => {
                let allowed = desc.is_code_segment()
                    && if conforming { dpl <= cpl } else { dpl == cpl };
                if !allowed {
                    return Err(Fault::GeneralProtection(code));
                }
            }
            SegmentId::SS => {
                if !desc.is_data_segment() || !rw || rpl != cpl || dpl != cpl {
                    return Err(Fault::GeneralProtection(code));
                }
                if !desc.is_present() {
                    return Err(Fault::StackFault(code));
                }
            }
            _ => {
                let readable = desc.is_data_segment() || (desc.is_code_segment() && rw);
                let privileged = desc.is_code_segment() && conforming;
                if !readable || (!privileged && dpl < cpl.max(rpl)) {
                    return Err(Fault::GeneralProtection(code));
                }
            }
        }
        if !desc.is_present() {
            return Err(Fault::SegmentNotPresent(code));
        }
        Ok(DescriptorCache::from_descriptor(&desc))
    }

    /// Far transfer into a code segment at the current privilege level
    ///
    /// The new CS selector carries the current CPL as its RPL. Real mode just
    /// rebases CS.
    pub(crate) fn enter_code_segment(&mut self, sel: u16, offset: u32) -> Result<(), ExecError> {
        if !self.regs.is_protected_mode() {
            self.regs.set_segment_real(SegmentId::CS, sel);
            self.regs.set_eip(offset);
            return Ok(());
        }
        let cpl = self.cpl();
        let rpl = (sel & selector::RPL_MASK) as u8;
        if rpl > cpl {
            return Err(Fault::GeneralProtection(error_code(sel)).into());
        }
        let cache = self.check_segment(SegmentId::CS, sel, cpl)?;
        if offset > cache.limit {
            return Err(Fault::GeneralProtection(0).into());
        }
        let sel = error_code(sel) | cpl as u16;
        self.regs.set_segment_cached(SegmentId::CS, sel, cache);
        self.regs.set_eip(offset);
        Ok(())
    }

    /// Set or clear the busy bit of the TSS descriptor named by `sel`
    pub(crate) fn set_tss_busy(&mut self, sel: u16, busy: bool) {
        let addr = self
            .regs
            .gdtr
            .base
            .wrapping_add(selector::table_offset(sel))
            .wrapping_add(5);
        let access = self.bus.read_linear(addr, OperandSize::Byte);
        let access = if busy {
            access | access_rights::TSS_BUSY as u32
        } else {
            access & !(access_rights::TSS_BUSY as u32)
        };
        self.bus.write_linear(addr, access, OperandSize::Byte);
    }

    /// MOV SS and POP SS inhibit interrupts until the next instruction ends
    pub(crate) fn note_stack_segment_write(&mut self, dst: &Operand) {
        if dst.kind == OperandKind::Register(RegId::Seg(SegmentId::SS)) {
            self.interrupt_shadow = true;
        }
    }
}
