//! Protected mode structures
//!
//! Descriptor formats as they appear in guest memory, and the Task State
//! Segment layouts used by hardware task switching.
//!
//! Key pieces:
//! - Segment descriptors (code/data) with base, limit, access rights, flags
//! - System descriptors: TSS, LDT, call/task/interrupt/trap gates
//! - 16-bit (80286) and 32-bit (80386) TSS layouts as offset tables
//! - Register snapshot read/write at those offsets

use serde::{Deserialize, Serialize};

use crate::bus::Bus;
use crate::operand::OperandSize;

/// Segment Descriptor (8 bytes)
///
/// Format:
/// - Bytes 0-1: Segment Limit (bits 0-15)
/// - Bytes 2-3: Base Address (bits 0-15)
/// - Byte 4: Base Address (bits 16-23)
/// - Byte 5: Access Rights
/// - Byte 6: Limit (bits 16-19) + Flags
/// - Byte 7: Base Address (bits 24-31) [80386 only]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Base address of the segment
    pub base: u32,

    /// Raw 20-bit segment limit (see `byte_limit`)
    pub limit: u32,

    /// Access rights byte
    pub access: u8,

    /// Flags nibble: G (bit 3), D/B (bit 2), AVL (bit 0)
    pub flags: u8,
}

/// Access Rights Byte flags
pub mod access_rights {
    /// Accessed bit (code/data) / busy bit (TSS)
    pub const ACCESSED: u8 = 0x01;

    /// For data segments: Writable
    /// For code segments: Readable
    pub const WRITABLE_READABLE: u8 = 0x02;

    /// For data segments: Expand down
    /// For code segments: Conforming
    pub const EXPAND_DOWN_CONFORMING: u8 = 0x04;

    /// Code segment (1) vs Data segment (0)
    pub const CODE_SEGMENT: u8 = 0x08;

    /// Descriptor type: System (0) or Code/Data (1)
    pub const DESCRIPTOR_TYPE: u8 = 0x10;

    /// Descriptor Privilege Level (2 bits)
    pub const DPL_MASK: u8 = 0x60;

    /// Present bit
    pub const PRESENT: u8 = 0x80;

    /// Busy bit in a TSS descriptor's type field
    pub const TSS_BUSY: u8 = 0x02;
}

/// Descriptor flag nibble bits
pub mod descriptor_flags {
    /// Limit is in 4 KiB units
    pub const GRANULARITY: u8 = 0x08;
    /// 32-bit default size (code) / ESP stack (data)
    pub const BIG: u8 = 0x04;
}

/// Type field of a system descriptor (S = 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemType {
    Tss16Available,
    Ldt,
    Tss16Busy,
    CallGate16,
    TaskGate,
    InterruptGate16,
    TrapGate16,
    Tss32Available,
    Tss32Busy,
    CallGate32,
    InterruptGate32,
    TrapGate32,
}

impl SystemType {
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x0F {
            0x1 => Some(SystemType::Tss16Available),
            0x2 => Some(SystemType::Ldt),
            0x3 => Some(SystemType::Tss16Busy),
            0x4 => Some(SystemType::CallGate16),
            0x5 => Some(SystemType::TaskGate),
            0x6 => Some(SystemType::InterruptGate16),
            0x7 => Some(SystemType::TrapGate16),
            0x9 => Some(SystemType::Tss32Available),
            0xB => Some(SystemType::Tss32Busy),
            0xC => Some(SystemType::CallGate32),
            0xE => Some(SystemType::InterruptGate32),
            0xF => Some(SystemType::TrapGate32),
            _ => None,
        }
    }

    /// Any TSS type, busy or not
    pub const fn is_tss(self) -> bool {
        matches!(
            self,
            SystemType::Tss16Available
                | SystemType::Tss16Busy
                | SystemType::Tss32Available
                | SystemType::Tss32Busy
        )
    }

    pub const fn is_busy_tss(self) -> bool {
        matches!(self, SystemType::Tss16Busy | SystemType::Tss32Busy)
    }

    /// Gates and TSSs of the 80386 flavour push/hold 32-bit values
    pub const fn is_32bit(self) -> bool {
        matches!(
            self,
            SystemType::Tss32Available
                | SystemType::Tss32Busy
                | SystemType::CallGate32
                | SystemType::InterruptGate32
                | SystemType::TrapGate32
        )
    }
}

impl SegmentDescriptor {
    /// Parse a segment descriptor from 8 bytes in memory
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        let limit_low = u16::from_le_bytes([bytes[0], bytes[1]]);
        let base_low = u16::from_le_bytes([bytes[2], bytes[3]]);
        let base_mid = bytes[4];
        let access = bytes[5];
        let limit_high_and_flags = bytes[6];
        let base_high = bytes[7];

        let limit = (limit_low as u32) | (((limit_high_and_flags & 0x0F) as u32) << 16);
        let base = (base_low as u32) | ((base_mid as u32) << 16) | ((base_high as u32) << 24);
        let flags = (limit_high_and_flags >> 4) & 0x0F;

        Self {
            base,
            limit,
            access,
            flags,
        }
    }

    /// Encode back to the 8-byte memory format
    pub fn to_bytes(&self) -> [u8; 8] {
        [
            self.limit as u8,
            (self.limit >> 8) as u8,
            self.base as u8,
            (self.base >> 8) as u8,
            (self.base >> 16) as u8,
            self.access,
            ((self.flags & 0x0F) << 4) | ((self.limit >> 16) as u8 & 0x0F),
            (self.base >> 24) as u8,
        ]
    }

    /// Check if this descriptor is present
    #[inline]
    pub fn is_present(&self) -> bool {
        (self.access & access_rights::PRESENT) != 0
    }

    /// Get the descriptor privilege level (DPL)
    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 0x03
    }

    /// Code or data (S = 1) rather than a system descriptor
    #[inline]
    pub fn is_code_or_data(&self) -> bool {
        (self.access & access_rights::DESCRIPTOR_TYPE) != 0
    }

    /// Check if this is a code segment
    #[inline]
    pub fn is_code_segment(&self) -> bool {
        self.is_code_or_data() && (self.access & access_rights::CODE_SEGMENT) != 0
    }

    /// Check if this is a data segment
    #[inline]
    pub fn is_data_segment(&self) -> bool {
        self.is_code_or_data() && (self.access & access_rights::CODE_SEGMENT) == 0
    }

    /// Type of a system descriptor, `None` for code/data or reserved types
    pub fn system_type(&self) -> Option<SystemType> {
        if self.is_code_or_data() {
            None
        } else {
            SystemType::from_bits(self.access)
        }
    }

    /// D/B bit
    #[inline]
    pub fn is_big(&self) -> bool {
        (self.flags & descriptor_flags::BIG) != 0
    }

    /// Limit in bytes after applying granularity
    pub fn byte_limit(&self) -> u32 {
        if (self.flags & descriptor_flags::GRANULARITY) != 0 {
            (self.limit << 12) | 0xFFF
        } else {
            self.limit
        }
    }
}

/// Call, task, interrupt or trap gate (8 bytes)
///
/// Format:
/// - Bytes 0-1: Offset (bits 0-15)
/// - Bytes 2-3: Target selector (TSS selector for task gates)
/// - Byte 4: Parameter count (call gates)
/// - Byte 5: Access Rights
/// - Bytes 6-7: Offset (bits 16-31) [32-bit gates only]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDescriptor {
    pub offset: u32,
    pub selector: u16,
    pub param_count: u8,
    pub access: u8,
}

impl GateDescriptor {
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        let low = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
        let high = u16::from_le_bytes([bytes[6], bytes[7]]) as u32;
        let access = bytes[5];
        let wide = SystemType::from_bits(access).is_some_and(SystemType::is_32bit);
        Self {
            offset: if wide { low | (high << 16) } else { low },
            selector: u16::from_le_bytes([bytes[2], bytes[3]]),
            param_count: bytes[4] & 0x1F,
            access,
        }
    }

    /// Reinterpret a descriptor already parsed as a segment descriptor
    pub fn from_descriptor(desc: &SegmentDescriptor) -> Self {
        Self::from_bytes(&desc.to_bytes())
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        (self.access & access_rights::PRESENT) != 0
    }

    /// Gate type; `None` when the S bit is set or the type is reserved
    pub fn gate_type(&self) -> Option<SystemType> {
        if (self.access & access_rights::DESCRIPTOR_TYPE) != 0 {
            None
        } else {
            SystemType::from_bits(self.access)
        }
    }
}

/// Selector fields
pub mod selector {
    /// Table indicator: 1 = LDT
    pub const TI: u16 = 0x0004;
    /// Requested privilege level
    pub const RPL_MASK: u16 = 0x0003;

    /// Byte offset of the descriptor inside its table
    #[inline]
    pub const fn table_offset(selector: u16) -> u32 {
        (selector & !0x0007) as u32
    }

    /// Null selectors (index 0 in the GDT)
    #[inline]
    pub const fn is_null(selector: u16) -> bool {
        (selector & !RPL_MASK) == 0
    }
}

/// Register image stored in a TSS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    /// ES, CS, SS, DS, FS, GS selectors
    pub segments: [u16; 6],
    pub ldt: u16,
}

/// Field offsets of a TSS variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TssLayout {
    /// Width of the EIP/EFLAGS/GPR slots
    pub width: OperandSize,
    /// Previous task link
    pub link: u32,
    pub eip: u32,
    pub eflags: u32,
    /// EAX .. EDI
    pub gpr: [u32; 8],
    /// ES, CS, SS, DS, FS, GS; the 16-bit TSS has no FS/GS slots
    pub segments: [Option<u32>; 6],
    pub ldt: u32,
    /// Smallest descriptor limit that covers every field
    pub min_limit: u32,
}

/// 80386 TSS
pub const TSS32: TssLayout = TssLayout {
    width: OperandSize::Dword,
    link: 0x00,
    eip: 0x20,
    eflags: 0x24,
    gpr: [0x28, 0x2C, 0x30, 0x34, 0x38, 0x3C, 0x40, 0x44],
    segments: [
        Some(0x48),
        Some(0x4C),
        Some(0x50),
        Some(0x54),
        Some(0x58),
        Some(0x5C),
    ],
    ldt: 0x60,
    min_limit: 0x67,
};

/// 80286 TSS
pub const TSS16: TssLayout = TssLayout {
    width: OperandSize::Word,
    link: 0x00,
    eip: 0x0E,
    eflags: 0x10,
    gpr: [0x12, 0x14, 0x16, 0x18, 0x1A, 0x1C, 0x1E, 0x20],
    segments: [Some(0x22), Some(0x24), Some(0x26), Some(0x28), None, None],
    ldt: 0x2A,
    min_limit: 0x2B,
};

impl TssLayout {
    /// Layout selected by a TSS descriptor type
    pub const fn for_type(ty: SystemType) -> Self {
        if ty.is_32bit() {
            TSS32
        } else {
            TSS16
        }
    }

    /// Read every field of a snapshot from the TSS at `base`
    pub fn read_snapshot<B: Bus + ?Sized>(&self, bus: &B, base: u32) -> TaskSnapshot {
        let mut snap = TaskSnapshot {
            eip: bus.read_linear(base.wrapping_add(self.eip), self.width),
            eflags: bus.read_linear(base.wrapping_add(self.eflags), self.width),
            ldt: bus.read_linear(base.wrapping_add(self.ldt), OperandSize::Word) as u16,
            ..TaskSnapshot::default()
        };
        for (slot, offset) in snap.gpr.iter_mut().zip(self.gpr) {
            *slot = bus.read_linear(base.wrapping_add(offset), self.width);
        }
        for (slot, offset) in snap.segments.iter_mut().zip(self.segments) {
            if let Some(offset) = offset {
                *slot = bus.read_linear(base.wrapping_add(offset), OperandSize::Word) as u16;
            }
        }
        snap
    }

    /// Write the dynamic fields (everything but the LDT selector)
    pub fn write_snapshot<B: Bus + ?Sized>(&self, bus: &mut B, base: u32, snap: &TaskSnapshot) {
        bus.write_linear(base.wrapping_add(self.eip), snap.eip, self.width);
        bus.write_linear(base.wrapping_add(self.eflags), snap.eflags, self.width);
        for (value, offset) in snap.gpr.iter().zip(self.gpr) {
            bus.write_linear(base.wrapping_add(offset), *value, self.width);
        }
        for (value, offset) in snap.segments.iter().zip(self.segments) {
            if let Some(offset) = offset {
                bus.write_linear(base.wrapping_add(offset), *value as u32, OperandSize::Word);
            }
        }
    }

    pub fn read_link<B: Bus + ?Sized>(&self, bus: &B, base: u32) -> u16 {
        bus.read_linear(base.wrapping_add(self.link), OperandSize::Word) as u16
    }

    pub fn write_link<B: Bus + ?Sized>(&self, bus: &mut B, base: u32, link: u16) {
        bus.write_linear(base.wrapping_add(self.link), link as u32, OperandSize::Word);
    }
}
