//! Engine configuration
//!
//! The host picks a CPU model and decides who delivers architectural faults.
//! Configurations are plain serde structs so they can be stored alongside the
//! host's own settings and loaded from JSON.

use serde::{Deserialize, Serialize};

/// CPU model/variant selection
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, Serialize, Deserialize,
)]
pub enum CpuModel {
    /// Intel 8086 (1978) - Original 16-bit x86 processor
    Intel8086,
    /// Intel 8088 (1979) - 8-bit external bus variant of 8086
    Intel8088,
    /// Intel 80186 (1982) - Enhanced 8086 with additional instructions
    Intel80186,
    /// Intel 80188 (1982) - 8-bit external bus variant of 80186
    Intel80188,
    /// Intel 80286 (1982) - Protected mode support, 24-bit addressing
    Intel80286,
    /// Intel 80386 (1985) - 32-bit processor with 32-bit registers and addressing
    #[default]
    Intel80386,
    /// Intel 80486 (1989) - XADD, CMPXCHG, BSWAP, CPUID (late steppings)
    Intel80486,
}

impl CpuModel {
    /// Generation rank; bus-width variants share their sibling's rank
    const fn generation(self) -> u8 {
        match self {
            CpuModel::Intel8086 | CpuModel::Intel8088 => 0,
            CpuModel::Intel80186 | CpuModel::Intel80188 => 1,
            CpuModel::Intel80286 => 2,
            CpuModel::Intel80386 => 3,
            CpuModel::Intel80486 => 4,
        }
    }

    /// Returns true if this model executes everything `required` does
    pub const fn supports(self, required: CpuModel) -> bool {
        self.generation() >= required.generation()
    }

    /// Returns true if this CPU model supports 80286+ instructions
    pub const fn supports_80286_instructions(self) -> bool {
        self.supports(CpuModel::Intel80286)
    }

    /// Returns true if this CPU model supports 80386+ instructions
    pub const fn supports_80386_instructions(self) -> bool {
        self.supports(CpuModel::Intel80386)
    }

    /// Bits of EFLAGS that POPF/IRET may change on this model
    pub const fn writable_flags(self) -> u32 {
        match self.generation() {
            0 | 1 => 0x0FD5,
            2 => 0x7FD5,
            3 => 0x0003_7FD5,
            _ => 0x0027_7FD5,
        }
    }

    /// Returns the name of the CPU model as a string
    pub fn name(&self) -> &'static str {
        match self {
            CpuModel::Intel8086 => "Intel 8086",
            CpuModel::Intel8088 => "Intel 8088",
            CpuModel::Intel80186 => "Intel 80186",
            CpuModel::Intel80188 => "Intel 80188",
            CpuModel::Intel80286 => "Intel 80286",
            CpuModel::Intel80386 => "Intel 80386",
            CpuModel::Intel80486 => "Intel 80486",
        }
    }
}

/// Who turns an architectural fault into interrupt delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FaultDelivery {
    /// The engine vectors the fault through the IVT/IDT before returning
    #[default]
    Dispatch,
    /// The engine only reports the fault; the host calls `Cpu::exception`
    Host,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub model: CpuModel,
    pub fault_delivery: FaultDelivery,
    /// Upper bound on string iterations per `execute` call
    pub rep_iteration_limit: Option<u32>,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            model: CpuModel::default(),
            fault_delivery: FaultDelivery::Dispatch,
            rep_iteration_limit: None,
        }
    }
}

impl CpuConfig {
    /// Configuration for a given model with default policies
    pub fn for_model(model: CpuModel) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    /// Parse a configuration; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
