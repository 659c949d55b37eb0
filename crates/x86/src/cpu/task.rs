//! Hardware task switching
//!
//! The outgoing task's registers go into its TSS, the incoming task's come
//! out of the new one. The incoming segment selectors are validated against
//! the new task's LDT before anything is committed, so a bad TSS faults with
//! the old task still intact.

use serde::{Deserialize, Serialize};

use super::segment::error_code;
use super::Cpu;
use crate::bus::Bus;
use crate::error::{ExecError, Fault};
use crate::flags::FLAG_NT;
use crate::logging::{log, LogCategory, LogLevel};
use crate::operand::SegmentId;
use crate::protected::{
    access_rights, selector, SegmentDescriptor, SystemType, TaskSnapshot, TssLayout,
};
use crate::registers::{DescriptorCache, SegmentRegister, CR0_TS};

/// What started a task switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskSwitchReason {
    Jump,
    Call,
    /// Interrupt or exception through a task gate
    Interrupt,
    /// IRET with NT set
    Iret,
}

impl TaskSwitchReason {
    /// CALL and interrupts nest: they link back and set NT
    const fn nests(self) -> bool {
        matches!(self, TaskSwitchReason::Call | TaskSwitchReason::Interrupt)
    }

    /// JMP and IRET leave the outgoing task
    const fn releases_old(self) -> bool {
        matches!(self, TaskSwitchReason::Jump | TaskSwitchReason::Iret)
    }
}

impl<B: Bus> Cpu<B> {
    /// Layout of the TSS the task register points at
    pub(crate) fn current_tss_layout(&self) -> Result<TssLayout, Fault> {
        SystemType::from_bits(self.regs.tr.cache.access)
            .filter(|ty| ty.is_tss())
            .map(TssLayout::for_type)
            .ok_or(Fault::InvalidTss(error_code(self.regs.tr.selector)))
    }

    /// Switch to the task whose TSS descriptor is `desc`
    pub fn task_switch(
        &mut self,
        sel: u16,
        desc: &SegmentDescriptor,
        reason: TaskSwitchReason,
    ) -> Result<(), ExecError> {
        let code = error_code(sel);
        let ty = desc
            .system_type()
            .filter(|ty| ty.is_tss())
            .ok_or(Fault::GeneralProtection(code))?;
        if sel & selector::TI != 0 {
            return Err(Fault::GeneralProtection(code).into());
        }
        match (reason, ty.is_busy_tss()) {
            (TaskSwitchReason::Iret, false) => return Err(Fault::InvalidTss(code).into()),
            (TaskSwitchReason::Iret, true) | (_, false) => {}
            (_, true) => return Err(Fault::GeneralProtection(code).into()),
        }
        if !desc.is_present() {
            return Err(Fault::SegmentNotPresent(code).into());
        }
        let new_layout = TssLayout::for_type(ty);
        if desc.byte_limit() < new_layout.min_limit {
            return Err(Fault::InvalidTss(code).into());
        }
        let old_layout = self.current_tss_layout()?;
        let old_sel = self.regs.tr.selector;
        let old_base = self.regs.tr.cache.base;
        let new_base = desc.base;

        // Validate the incoming image before touching any state
        let incoming = new_layout.read_snapshot(&self.bus, new_base);
        let ldtr = self.task_ldt(incoming.ldt)?;
        let saved_ldtr = std::mem::replace(&mut self.regs.ldtr, ldtr);
        let caches = self.task_segment_caches(&incoming);
        self.regs.ldtr = saved_ldtr;
        let caches = caches?;

        let mut outgoing = self.capture_snapshot();
        if reason == TaskSwitchReason::Iret {
            outgoing.eflags &= !FLAG_NT;
        }
        old_layout.write_snapshot(&mut self.bus, old_base, &outgoing);

        if reason.releases_old() {
            self.set_tss_busy(old_sel, false);
        }

        self.regs.tr = SegmentRegister {
            selector: sel,
            cache: DescriptorCache::from_descriptor(desc),
        };
        if reason.nests() {
            new_layout.write_link(&mut self.bus, new_base, old_sel);
        }
        self.set_tss_busy(sel, true);
        self.regs.tr.cache.access |= access_rights::TSS_BUSY;

        self.regs.ldtr = ldtr;
        self.load_snapshot(&new_layout, &incoming, caches);
        if reason.nests() {
            self.regs.flags.set(FLAG_NT, true);
        }
        self.regs.cr0 |= CR0_TS;

        log(LogCategory::TaskSwitch, LogLevel::Info, || {
            format!(
                "{:?} task switch {:04X} -> {:04X} at {:04X}:{:08X}",
                reason,
                old_sel,
                sel,
                self.regs.selector(SegmentId::CS),
                self.regs.eip
            )
        });
        Ok(())
    }

    /// Registers of the running task as stored in its TSS
    fn capture_snapshot(&self) -> TaskSnapshot {
        let mut snap = TaskSnapshot {
            eip: self.regs.eip,
            eflags: self.eflags_image(),
            ldt: self.regs.ldtr.selector,
            ..TaskSnapshot::default()
        };
        for (index, slot) in snap.gpr.iter_mut().enumerate() {
            *slot = self.regs.gpr32(index);
        }
        for (seg, slot) in SegmentId::ALL.iter().zip(snap.segments.iter_mut()) {
            *slot = self.regs.selector(*seg);
        }
        snap
    }

    /// LDT register for an incoming task; the selector must name a present
    /// LDT descriptor in the GDT
    fn task_ldt(&self, sel: u16) -> Result<SegmentRegister, Fault> {
        if selector::is_null(sel) {
            return Ok(SegmentRegister {
                selector: sel,
                cache: DescriptorCache::unusable(),
            });
        }
        let invalid = Fault::InvalidTss(error_code(sel));
        if sel & selector::TI != 0 {
            return Err(invalid);
        }
        let desc = self.descriptor(sel).map_err(|_| invalid)?;
        if desc.system_type() != Some(SystemType::Ldt) {
            return Err(invalid);
        }
        if !desc.is_present() {
            return Err(Fault::SegmentNotPresent(error_code(sel)));
        }
        Ok(SegmentRegister {
            selector: sel,
            cache: DescriptorCache::from_descriptor(&desc),
        })
    }

    /// Descriptor caches for the incoming selectors, checked at the new CPL
    fn task_segment_caches(&self, snap: &TaskSnapshot) -> Result<[DescriptorCache; 6], Fault> {
        let cpl = (snap.segments[SegmentId::CS.index()] & selector::RPL_MASK) as u8;
        let mut caches = [DescriptorCache::real_mode(0); 6];
        for (seg, cache) in SegmentId::ALL.iter().zip(caches.iter_mut()) {
            let sel = snap.segments[seg.index()];
            *cache = self.check_segment(*seg, sel, cpl).map_err(|fault| match fault {
                Fault::SegmentNotPresent(_) => fault,
                _ => Fault::InvalidTss(error_code(sel)),
            })?;
        }
        Ok(caches)
    }

    /// Commit an incoming image; the segment caches were validated already
    fn load_snapshot(
        &mut self,
        layout: &TssLayout,
        snap: &TaskSnapshot,
        caches: [DescriptorCache; 6],
    ) {
        for (index, value) in snap.gpr.iter().enumerate() {
            self.regs.set_gpr(index, layout.width, *value);
        }
        for (seg, cache) in SegmentId::ALL.iter().zip(caches) {
            self.regs
                .set_segment_cached(*seg, snap.segments[seg.index()], cache);
        }
        let writable = self.config.model.writable_flags() & layout.width.mask();
        self.regs.flags.load(snap.eflags, writable);
        self.regs.set_eip(snap.eip);
    }
}
