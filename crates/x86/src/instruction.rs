//! Decoded instruction model
//!
//! The host's decoder turns raw bytes into an [`Instruction`]: a mnemonic,
//! its resolved operands and the prefix state that changes its meaning.
//! Instructions are immutable and consumed once per execution.

use serde::{Deserialize, Serialize};

use crate::config::CpuModel;
use crate::operand::{Operand, OperandSize, SegmentId};

/// Condition codes shared by Jcc and SETcc, in encoding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    /// Overflow
    O,
    /// Not overflow
    NO,
    /// Below / carry
    B,
    /// Not below / no carry
    NB,
    /// Equal / zero
    E,
    /// Not equal / not zero
    NE,
    /// Below or equal
    BE,
    /// Above
    NBE,
    /// Sign
    S,
    /// Not sign
    NS,
    /// Parity even
    P,
    /// Parity odd
    NP,
    /// Less
    L,
    /// Greater or equal
    NL,
    /// Less or equal
    LE,
    /// Greater
    NLE,
}

impl Condition {
    /// Condition from the low nibble of a Jcc/SETcc opcode
    pub const fn from_code(code: u8) -> Self {
        match code & 0x0F {
            0x0 => Condition::O,
            0x1 => Condition::NO,
            0x2 => Condition::B,
            0x3 => Condition::NB,
            0x4 => Condition::E,
            0x5 => Condition::NE,
            0x6 => Condition::BE,
            0x7 => Condition::NBE,
            0x8 => Condition::S,
            0x9 => Condition::NS,
            0xA => Condition::P,
            0xB => Condition::NP,
            0xC => Condition::L,
            0xD => Condition::NL,
            0xE => Condition::LE,
            _ => Condition::NLE,
        }
    }
}

/// Every instruction the engine knows how to execute (or explicitly refuses)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mnemonic {
    // Arithmetic and logic
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    And,
    Or,
    Xor,
    Test,
    Neg,
    Not,
    Inc,
    Dec,
    // Multiply / divide
    Mul,
    Imul,
    Div,
    Idiv,
    // Shifts and rotates
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shld,
    Shrd,
    // Decimal adjust
    Daa,
    Das,
    Aaa,
    Aas,
    Aam,
    Aad,
    // Bit operations
    Bt,
    Bts,
    Btr,
    Btc,
    Bsf,
    Bsr,
    // Data movement
    Mov,
    Movsx,
    Movzx,
    Xchg,
    Xadd,
    Cmpxchg,
    Bswap,
    Lea,
    Lds,
    Les,
    Lfs,
    Lgs,
    Lss,
    Xlat,
    Cbw,
    Cwd,
    Lahf,
    Sahf,
    Salc,
    Setcc(Condition),
    // Stack
    Push,
    Pop,
    Pusha,
    Popa,
    Pushf,
    Popf,
    Enter,
    Leave,
    // Strings
    Movs,
    Cmps,
    Scas,
    Lods,
    Stos,
    Ins,
    Outs,
    // Control transfer
    Calln,
    Callf,
    Retn,
    Retf,
    Jmpn,
    Jmpf,
    Jcc(Condition),
    Loop,
    Loope,
    Loopne,
    Jcxz,
    Int,
    Int3,
    Into,
    Iret,
    Bound,
    // Flag control
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Cli,
    Sti,
    // Port I/O
    In,
    Out,
    // System
    Hlt,
    Nop,
    Wait,
    Cpuid,
    Lgdt,
    Sgdt,
    Lidt,
    Sidt,
    Lldt,
    Sldt,
    Ltr,
    Str,
    Lmsw,
    Smsw,
    Clts,
    Arpl,
    Lar,
    Lsl,
    Verr,
    Verw,
    Invd,
    Wbinvd,
    Invlpg,
    /// x87 escape (D8-DF)
    Esc,
    /// Opcode the decoder could not map
    Invalid,
}

impl Mnemonic {
    /// Earliest CPU model that implements this instruction
    pub fn min_model(self) -> CpuModel {
        use Mnemonic::*;
        match self {
            Pusha | Popa | Enter | Leave | Bound | Ins | Outs => CpuModel::Intel80186,
            Lgdt | Sgdt | Lidt | Sidt | Lldt | Sldt | Ltr | Str | Lmsw | Smsw | Clts
            | Arpl | Lar | Lsl | Verr | Verw => CpuModel::Intel80286,
            Movsx | Movzx | Shld | Shrd | Bt | Bts | Btr | Btc | Bsf | Bsr | Lfs | Lgs
            | Lss | Setcc(_) => CpuModel::Intel80386,
            Xadd | Cmpxchg | Bswap | Invd | Wbinvd | Invlpg | Cpuid => CpuModel::Intel80486,
            _ => CpuModel::Intel8086,
        }
    }

    /// True for the string family driven by the repeat iterator
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            Mnemonic::Movs
                | Mnemonic::Cmps
                | Mnemonic::Scas
                | Mnemonic::Lods
                | Mnemonic::Stos
                | Mnemonic::Ins
                | Mnemonic::Outs
        )
    }
}

/// Operand arity, checked by each semantic function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Operands {
    #[default]
    None,
    Unary(Operand),
    Binary(Operand, Operand),
    Ternary(Operand, Operand, Operand),
}

impl Operands {
    /// Number of operands present
    pub const fn arity(&self) -> usize {
        match self {
            Operands::None => 0,
            Operands::Unary(_) => 1,
            Operands::Binary(_, _) => 2,
            Operands::Ternary(_, _, _) => 3,
        }
    }

    /// First operand, if any
    pub const fn first(&self) -> Option<Operand> {
        match *self {
            Operands::None => None,
            Operands::Unary(a) | Operands::Binary(a, _) | Operands::Ternary(a, _, _) => Some(a),
        }
    }
}

/// REP-family prefix state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepeatPrefix {
    #[default]
    None,
    /// F3: REP for MOVS/STOS/LODS/INS/OUTS, REPE for CMPS/SCAS
    RepE,
    /// F2: REPNE, only meaningful for CMPS/SCAS
    RepNE,
}

/// A decoded instruction ready for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    pub operands: Operands,
    /// Effective operand size is 32-bit
    pub operand_size_32: bool,
    /// Effective address size is 32-bit
    pub address_size_32: bool,
    pub repeat: RepeatPrefix,
    pub segment_override: Option<SegmentId>,
    /// Encoded length in bytes; (E)IP is advanced by this before execution
    pub length: u8,
}

impl Instruction {
    /// A 16-bit instruction with no prefixes
    pub const fn new(mnemonic: Mnemonic, operands: Operands) -> Self {
        Self {
            mnemonic,
            operands,
            operand_size_32: false,
            address_size_32: false,
            repeat: RepeatPrefix::None,
            segment_override: None,
            length: 0,
        }
    }

    pub const fn bare(mnemonic: Mnemonic) -> Self {
        Self::new(mnemonic, Operands::None)
    }

    pub const fn unary(mnemonic: Mnemonic, a: Operand) -> Self {
        Self::new(mnemonic, Operands::Unary(a))
    }

    pub const fn binary(mnemonic: Mnemonic, a: Operand, b: Operand) -> Self {
        Self::new(mnemonic, Operands::Binary(a, b))
    }

    pub const fn ternary(mnemonic: Mnemonic, a: Operand, b: Operand, c: Operand) -> Self {
        Self::new(mnemonic, Operands::Ternary(a, b, c))
    }

    pub const fn with_operand_size_32(mut self, is_32: bool) -> Self {
        self.operand_size_32 = is_32;
        self
    }

    pub const fn with_address_size_32(mut self, is_32: bool) -> Self {
        self.address_size_32 = is_32;
        self
    }

    pub const fn with_repeat(mut self, repeat: RepeatPrefix) -> Self {
        self.repeat = repeat;
        self
    }

    pub const fn with_segment_override(mut self, segment: SegmentId) -> Self {
        self.segment_override = Some(segment);
        self
    }

    pub const fn with_length(mut self, length: u8) -> Self {
        self.length = length;
        self
    }

    /// Word or dword, from the operand-size attribute
    #[inline]
    pub const fn op_size(&self) -> OperandSize {
        OperandSize::word_or_dword(self.operand_size_32)
    }

    /// Word or dword, from the address-size attribute
    #[inline]
    pub const fn addr_size(&self) -> OperandSize {
        OperandSize::word_or_dword(self.address_size_32)
    }
}
