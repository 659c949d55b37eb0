//! Architectural register file
//!
//! General registers are kept as eight 32-bit cells; the 16-bit and 8-bit
//! views are aliases that only touch their own bits. Segment registers carry
//! a cached descriptor (base, limit, access, default size) the way the
//! hardware's hidden part does.

use serde::{Deserialize, Serialize};

use crate::flags::FlagsState;
use crate::operand::{OperandSize, RegId, SegmentId};
use crate::protected::{access_rights, SegmentDescriptor};

// CR0 bits
pub const CR0_PE: u32 = 0x0000_0001; // Protection Enable
pub const CR0_MP: u32 = 0x0000_0002; // Monitor Coprocessor
pub const CR0_EM: u32 = 0x0000_0004; // Emulation
pub const CR0_TS: u32 = 0x0000_0008; // Task Switched
pub const CR0_ET: u32 = 0x0000_0010; // Extension Type
pub const CR0_PG: u32 = 0x8000_0000; // Paging

// General register cells in encoding order
pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;

/// Hidden part of a segment register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorCache {
    pub base: u32,
    /// Byte-granular limit
    pub limit: u32,
    pub access: u8,
    /// D/B bit: 32-bit default operand size (code) or ESP stack (SS)
    pub big: bool,
}

impl DescriptorCache {
    /// Cache contents after a real-mode selector load
    pub const fn real_mode(selector: u16) -> Self {
        Self {
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            access: access_rights::PRESENT
                | access_rights::DESCRIPTOR_TYPE
                | access_rights::WRITABLE_READABLE
                | access_rights::ACCESSED,
            big: false,
        }
    }

    /// Cache left by a null selector: no access rights, unusable
    pub const fn unusable() -> Self {
        Self {
            base: 0,
            limit: 0,
            access: 0,
            big: false,
        }
    }

    /// Cache contents after a protected-mode selector load
    pub fn from_descriptor(desc: &SegmentDescriptor) -> Self {
        Self {
            base: desc.base,
            limit: desc.byte_limit(),
            access: desc.access,
            big: desc.is_big(),
        }
    }
}

/// Visible selector plus its cached descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRegister {
    pub selector: u16,
    pub cache: DescriptorCache,
}

impl SegmentRegister {
    pub const fn real_mode(selector: u16) -> Self {
        Self {
            selector,
            cache: DescriptorCache::real_mode(selector),
        }
    }
}

/// GDTR / IDTR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableRegister {
    pub base: u32,
    pub limit: u16,
}

/// Complete architectural register state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFile {
    gpr: [u32; 8],
    pub eip: u32,
    pub flags: FlagsState,
    segments: [SegmentRegister; 6],
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub gdtr: TableRegister,
    pub idtr: TableRegister,
    pub ldtr: SegmentRegister,
    pub tr: SegmentRegister,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    /// Power-on state: CS:IP = F000:FFF0 with the CS base at the top of memory
    pub fn new() -> Self {
        let mut cs = SegmentRegister::real_mode(0xF000);
        cs.cache.base = 0xFFFF_0000;
        cs.cache.access |= access_rights::CODE_SEGMENT;
        let mut segments = [SegmentRegister::real_mode(0); 6];
        segments[SegmentId::CS.index()] = cs;
        Self {
            gpr: [0; 8],
            eip: 0xFFF0,
            flags: FlagsState::new(),
            segments,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            gdtr: TableRegister::default(),
            idtr: TableRegister {
                base: 0,
                limit: 0x03FF,
            },
            ldtr: SegmentRegister::real_mode(0),
            tr: SegmentRegister::real_mode(0),
        }
    }

    /// Read a 32-bit general register cell
    #[inline]
    pub fn gpr32(&self, index: usize) -> u32 {
        self.gpr[index & 7]
    }

    /// Write a 32-bit general register cell
    #[inline]
    pub fn set_gpr32(&mut self, index: usize, value: u32) {
        self.gpr[index & 7] = value;
    }

    /// Read a general register cell at `size`, low bits only
    #[inline]
    pub fn gpr(&self, index: usize, size: OperandSize) -> u32 {
        self.gpr[index & 7] & size.mask()
    }

    /// Write the low `size` bits of a general register cell
    #[inline]
    pub fn set_gpr(&mut self, index: usize, size: OperandSize, value: u32) {
        let mask = size.mask();
        let cell = &mut self.gpr[index & 7];
        *cell = (*cell & !mask) | (value & mask);
    }

    /// Read any register operand, masked to its width
    pub fn read(&self, reg: RegId) -> u32 {
        match reg {
            RegId::AL => self.gpr[EAX] & 0xFF,
            RegId::CL => self.gpr[ECX] & 0xFF,
            RegId::DL => self.gpr[EDX] & 0xFF,
            RegId::BL => self.gpr[EBX] & 0xFF,
            RegId::AH => (self.gpr[EAX] >> 8) & 0xFF,
            RegId::CH => (self.gpr[ECX] >> 8) & 0xFF,
            RegId::DH => (self.gpr[EDX] >> 8) & 0xFF,
            RegId::BH => (self.gpr[EBX] >> 8) & 0xFF,
            RegId::AX => self.gpr(EAX, OperandSize::Word),
            RegId::CX => self.gpr(ECX, OperandSize::Word),
            RegId::DX => self.gpr(EDX, OperandSize::Word),
            RegId::BX => self.gpr(EBX, OperandSize::Word),
            RegId::SP => self.gpr(ESP, OperandSize::Word),
            RegId::BP => self.gpr(EBP, OperandSize::Word),
            RegId::SI => self.gpr(ESI, OperandSize::Word),
            RegId::DI => self.gpr(EDI, OperandSize::Word),
            RegId::EAX => self.gpr[EAX],
            RegId::ECX => self.gpr[ECX],
            RegId::EDX => self.gpr[EDX],
            RegId::EBX => self.gpr[EBX],
            RegId::ESP => self.gpr[ESP],
            RegId::EBP => self.gpr[EBP],
            RegId::ESI => self.gpr[ESI],
            RegId::EDI => self.gpr[EDI],
            RegId::Seg(seg) => self.segments[seg.index()].selector as u32,
            RegId::CR0 => self.cr0,
            RegId::CR2 => self.cr2,
            RegId::CR3 => self.cr3,
        }
    }

    /// Write any register operand; only the register's own bits change
    ///
    /// Segment registers take a real-mode style load here. Protected-mode
    /// loads go through the CPU, which has access to the descriptor tables.
    pub fn write(&mut self, reg: RegId, value: u32) {
        match reg {
            RegId::AL => self.set_gpr(EAX, OperandSize::Byte, value),
            RegId::CL => self.set_gpr(ECX, OperandSize::Byte, value),
            RegId::DL => self.set_gpr(EDX, OperandSize::Byte, value),
            RegId::BL => self.set_gpr(EBX, OperandSize::Byte, value),
            RegId::AH => self.set_high_byte(EAX, value),
            RegId::CH => self.set_high_byte(ECX, value),
            RegId::DH => self.set_high_byte(EDX, value),
            RegId::BH => self.set_high_byte(EBX, value),
            RegId::AX => self.set_gpr(EAX, OperandSize::Word, value),
            RegId::CX => self.set_gpr(ECX, OperandSize::Word, value),
            RegId::DX => self.set_gpr(EDX, OperandSize::Word, value),
            RegId::BX => self.set_gpr(EBX, OperandSize::Word, value),
            RegId::SP => self.set_gpr(ESP, OperandSize::Word, value),
            RegId::BP => self.set_gpr(EBP, OperandSize::Word, value),
            RegId::SI => self.set_gpr(ESI, OperandSize::Word, value),
            RegId::DI => self.set_gpr(EDI, OperandSize::Word, value),
            RegId::EAX => self.gpr[EAX] = value,
            RegId::ECX => self.gpr[ECX] = value,
            RegId::EDX => self.gpr[EDX] = value,
            RegId::EBX => self.gpr[EBX] = value,
            RegId::ESP => self.gpr[ESP] = value,
            RegId::EBP => self.gpr[EBP] = value,
            RegId::ESI => self.gpr[ESI] = value,
            RegId::EDI => self.gpr[EDI] = value,
            RegId::Seg(seg) => self.set_segment_real(seg, value as u16),
            RegId::CR0 => self.cr0 = value,
            RegId::CR2 => self.cr2 = value,
            RegId::CR3 => self.cr3 = value,
        }
    }

    #[inline]
    fn set_high_byte(&mut self, index: usize, value: u32) {
        let cell = &mut self.gpr[index];
        *cell = (*cell & !0xFF00) | ((value & 0xFF) << 8);
    }

    #[inline]
    pub fn segment(&self, seg: SegmentId) -> &SegmentRegister {
        &self.segments[seg.index()]
    }

    #[inline]
    pub fn segment_mut(&mut self, seg: SegmentId) -> &mut SegmentRegister {
        &mut self.segments[seg.index()]
    }

    #[inline]
    pub fn selector(&self, seg: SegmentId) -> u16 {
        self.segments[seg.index()].selector
    }

    /// Real-mode segment load: base = selector * 16, limit and size unchanged
    pub fn set_segment_real(&mut self, seg: SegmentId, selector: u16) {
        let reg = &mut self.segments[seg.index()];
        reg.selector = selector;
        reg.cache.base = (selector as u32) << 4;
    }

    /// Protected-mode segment load from a resolved descriptor
    pub fn set_segment_cached(&mut self, seg: SegmentId, selector: u16, cache: DescriptorCache) {
        self.segments[seg.index()] = SegmentRegister { selector, cache };
    }

    /// Base of a segment as cached
    #[inline]
    pub fn segment_base(&self, seg: SegmentId) -> u32 {
        self.segments[seg.index()].cache.base
    }

    /// True when PE is set in CR0
    #[inline]
    pub fn is_protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    /// Width of the stack pointer, decided by SS's cached B bit
    #[inline]
    pub fn stack_size(&self) -> OperandSize {
        OperandSize::word_or_dword(self.segments[SegmentId::SS.index()].cache.big)
    }

    /// SP or ESP depending on the stack segment
    #[inline]
    pub fn stack_pointer(&self) -> u32 {
        self.gpr(ESP, self.stack_size())
    }

    /// Update SP (upper half of ESP untouched) or ESP
    #[inline]
    pub fn set_stack_pointer(&mut self, value: u32) {
        let size = self.stack_size();
        self.set_gpr(ESP, size, value);
    }

    /// Width of (E)IP, decided by CS's cached D bit
    #[inline]
    pub fn code_size(&self) -> OperandSize {
        OperandSize::word_or_dword(self.segments[SegmentId::CS.index()].cache.big)
    }

    /// Store a new instruction pointer, truncated to the code segment width
    #[inline]
    pub fn set_eip(&mut self, value: u32) {
        self.eip = value & self.code_size().mask();
    }
}
