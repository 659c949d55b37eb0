//! Decoded operand model
//!
//! An [`Operand`] is a decoded instruction argument that has already been
//! resolved to a concrete location: a register, an effective address in a
//! segment, or an immediate. The engine never re-derives addressing modes;
//! it only reads and writes through these values, always masked to the
//! operand's own width.

use serde::{Deserialize, Serialize};

/// Width of an operand in bytes (1, 2 or 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandSize {
    /// 8-bit
    Byte,
    /// 16-bit
    Word,
    /// 32-bit
    Dword,
}

impl OperandSize {
    /// Size in bytes
    #[inline]
    pub const fn bytes(self) -> u32 {
        match self {
            OperandSize::Byte => 1,
            OperandSize::Word => 2,
            OperandSize::Dword => 4,
        }
    }

    /// Size in bits
    #[inline]
    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }

    /// `2^(bits) - 1`
    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            OperandSize::Byte => 0xFF,
            OperandSize::Word => 0xFFFF,
            OperandSize::Dword => 0xFFFF_FFFF,
        }
    }

    /// The most significant bit for this width
    #[inline]
    pub const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Build a size from a byte count
    pub const fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            1 => Some(OperandSize::Byte),
            2 => Some(OperandSize::Word),
            4 => Some(OperandSize::Dword),
            _ => None,
        }
    }

    /// Word or dword depending on an effective 32-bit size attribute
    #[inline]
    pub const fn word_or_dword(is_32: bool) -> Self {
        if is_32 {
            OperandSize::Dword
        } else {
            OperandSize::Word
        }
    }

    /// Double width, used by the multiply/divide register pairs
    pub const fn widened(self) -> Option<Self> {
        match self {
            OperandSize::Byte => Some(OperandSize::Word),
            OperandSize::Word => Some(OperandSize::Dword),
            OperandSize::Dword => None,
        }
    }

    /// Sign-extend `value` (interpreted at this width) to 32 bits
    #[inline]
    pub const fn sign_extend(self, value: u32) -> u32 {
        match self {
            OperandSize::Byte => value as u8 as i8 as i32 as u32,
            OperandSize::Word => value as u16 as i16 as i32 as u32,
            OperandSize::Dword => value,
        }
    }

    /// Interpret `value` at this width as a signed integer
    #[inline]
    pub const fn signed(self, value: u32) -> i64 {
        self.sign_extend(value) as i32 as i64
    }
}

/// Segment register identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentId {
    ES,
    CS,
    SS,
    DS,
    FS,
    GS,
}

impl SegmentId {
    /// All segment registers in encoding order
    pub const ALL: [SegmentId; 6] = [
        SegmentId::ES,
        SegmentId::CS,
        SegmentId::SS,
        SegmentId::DS,
        SegmentId::FS,
        SegmentId::GS,
    ];

    /// Index into the register file's segment array
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Register operands
///
/// General registers come in three views that alias the same 32-bit
/// backing store; segment and control registers are separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegId {
    AL,
    CL,
    DL,
    BL,
    AH,
    CH,
    DH,
    BH,
    AX,
    CX,
    DX,
    BX,
    SP,
    BP,
    SI,
    DI,
    EAX,
    ECX,
    EDX,
    EBX,
    ESP,
    EBP,
    ESI,
    EDI,
    Seg(SegmentId),
    CR0,
    CR2,
    CR3,
}

impl RegId {
    /// Natural width of the register
    pub const fn size(self) -> OperandSize {
        match self {
            RegId::AL
            | RegId::CL
            | RegId::DL
            | RegId::BL
            | RegId::AH
            | RegId::CH
            | RegId::DH
            | RegId::BH => OperandSize::Byte,
            RegId::AX
            | RegId::CX
            | RegId::DX
            | RegId::BX
            | RegId::SP
            | RegId::BP
            | RegId::SI
            | RegId::DI
            | RegId::Seg(_) => OperandSize::Word,
            _ => OperandSize::Dword,
        }
    }

    /// General register by encoding index (0=AX .. 7=DI) at a given width
    pub const fn gpr(index: u8, size: OperandSize) -> RegId {
        const BYTES: [RegId; 8] = [
            RegId::AL,
            RegId::CL,
            RegId::DL,
            RegId::BL,
            RegId::AH,
            RegId::CH,
            RegId::DH,
            RegId::BH,
        ];
        const WORDS: [RegId; 8] = [
            RegId::AX,
            RegId::CX,
            RegId::DX,
            RegId::BX,
            RegId::SP,
            RegId::BP,
            RegId::SI,
            RegId::DI,
        ];
        const DWORDS: [RegId; 8] = [
            RegId::EAX,
            RegId::ECX,
            RegId::EDX,
            RegId::EBX,
            RegId::ESP,
            RegId::EBP,
            RegId::ESI,
            RegId::EDI,
        ];
        let i = (index & 7) as usize;
        match size {
            OperandSize::Byte => BYTES[i],
            OperandSize::Word => WORDS[i],
            OperandSize::Dword => DWORDS[i],
        }
    }
}

/// An effective address inside a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub segment: SegmentId,
    pub offset: u32,
}

impl Address {
    pub const fn new(segment: SegmentId, offset: u32) -> Self {
        Self { segment, offset }
    }

    /// Same segment, offset moved by `delta` bytes
    #[inline]
    pub const fn offset_by(self, delta: u32) -> Self {
        Self {
            segment: self.segment,
            offset: self.offset.wrapping_add(delta),
        }
    }
}

/// Where an operand lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperandKind {
    Register(RegId),
    Memory(Address),
    Immediate(u32),
}

/// A resolved operand with a fixed size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    pub size: OperandSize,
}

impl Operand {
    /// Register operand, sized by the register
    pub const fn reg(reg: RegId) -> Self {
        Self {
            kind: OperandKind::Register(reg),
            size: reg.size(),
        }
    }

    /// Memory operand at `segment:offset`
    pub const fn mem(segment: SegmentId, offset: u32, size: OperandSize) -> Self {
        Self {
            kind: OperandKind::Memory(Address::new(segment, offset)),
            size,
        }
    }

    /// Immediate operand; the raw value is stored masked to `size`
    pub const fn imm(value: u32, size: OperandSize) -> Self {
        Self {
            kind: OperandKind::Immediate(value & size.mask()),
            size,
        }
    }

    #[inline]
    pub const fn mask(&self) -> u32 {
        self.size.mask()
    }

    /// Sign-extend a raw value read from this operand according to the
    /// operand's own size (not the destination's)
    #[inline]
    pub const fn sign_extend(&self, raw: u32) -> u32 {
        self.size.sign_extend(raw)
    }

    pub const fn is_memory(&self) -> bool {
        matches!(self.kind, OperandKind::Memory(_))
    }

    pub const fn is_immediate(&self) -> bool {
        matches!(self.kind, OperandKind::Immediate(_))
    }
}
