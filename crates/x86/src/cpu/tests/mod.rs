//! Tests for the execution engine
//!
//! Tests are organized by instruction family:
//! - `tests_arith`: ALU masking, data movement, conversions, model gating
//! - `tests_flags`: lazy flags, carry chains, flag transfer, SETcc
//! - `tests_muldiv`: multiply and divide, including #DE
//! - `tests_shifts`: shifts and rotates through the CPU
//! - `tests_string`: string instructions and the repeat iterator
//! - `tests_stack`: push/pop, PUSHA/POPA, PUSHF/POPF, ENTER/LEAVE
//! - `tests_control`: jumps, calls, returns, loops, BOUND/INTO
//! - `tests_interrupts`: IVT/IDT delivery, host injection, escalation
//! - `tests_system`: segment loads and system registers
//! - `tests_task`: hardware task switches
//! - `tests_state`: save states and configuration

mod tests_arith;
mod tests_system;

use crate::bus::ArrayBus;
use crate::config::{CpuConfig, CpuModel, FaultDelivery};
use crate::cpu::{Cpu, StepOutcome};
use crate::instruction::Instruction;
use crate::operand::{Operand, OperandSize, RegId, SegmentId};
use crate::protected::{SegmentDescriptor, TaskSnapshot, TSS32};
use crate::registers::{
    DescriptorCache, SegmentRegister, TableRegister, CR0_PE, ESP,
};

pub(super) const CODE_SEGMENT: u16 = 0x1000;
pub(super) const STACK_SEGMENT: u16 = 0x2000;
pub(super) const DATA_SEGMENT: u16 = 0x3000;
pub(super) const EXTRA_SEGMENT: u16 = 0x4000;
pub(super) const START_IP: u32 = 0x0100;
pub(super) const STACK_TOP: u32 = 0xFFFE;

pub(super) const GDT_BASE: u32 = 0x1000;
pub(super) const IDT_BASE: u32 = 0x2000;
pub(super) const CODE_SEL: u16 = 0x08;
pub(super) const DATA_SEL: u16 = 0x10;
pub(super) const TSS_A_SEL: u16 = 0x18;
pub(super) const TSS_B_SEL: u16 = 0x20;
pub(super) const TSS_A_BASE: u32 = 0x3000;
pub(super) const TSS_B_BASE: u32 = 0x3100;
pub(super) const PM_START: u32 = 0x0001_0000;
pub(super) const PM_STACK: u32 = 0x0009_0000;

pub(super) fn reg(r: RegId) -> Operand {
    Operand::reg(r)
}

pub(super) fn imm8(value: u32) -> Operand {
    Operand::imm(value, OperandSize::Byte)
}

pub(super) fn imm16(value: u32) -> Operand {
    Operand::imm(value, OperandSize::Word)
}

pub(super) fn imm32(value: u32) -> Operand {
    Operand::imm(value, OperandSize::Dword)
}

pub(super) fn mem(segment: SegmentId, offset: u32, size: OperandSize) -> Operand {
    Operand::mem(segment, offset, size)
}

/// Execute and unwrap the engine-level result
pub(super) fn run(cpu: &mut Cpu<ArrayBus>, insn: Instruction) -> StepOutcome {
    cpu.execute(&insn).expect("execute failed")
}

/// Real-mode CPU at 1000:0100 with SS:SP = 2000:FFFE, DS = 3000, ES = 4000
pub(super) fn real_mode_cpu_for(model: CpuModel) -> Cpu<ArrayBus> {
    let mut cpu = Cpu::with_model(ArrayBus::new(), model);
    cpu.regs.set_segment_real(SegmentId::CS, CODE_SEGMENT);
    cpu.regs.eip = START_IP;
    cpu.regs.set_segment_real(SegmentId::SS, STACK_SEGMENT);
    cpu.regs.set_gpr32(ESP, STACK_TOP);
    cpu.regs.set_segment_real(SegmentId::DS, DATA_SEGMENT);
    cpu.regs.set_segment_real(SegmentId::ES, EXTRA_SEGMENT);
    cpu
}

pub(super) fn real_mode_cpu() -> Cpu<ArrayBus> {
    real_mode_cpu_for(CpuModel::Intel80386)
}

/// Report faults to the caller instead of vectoring them
pub(super) fn host_delivery(cpu: &mut Cpu<ArrayBus>) {
    let config = CpuConfig {
        fault_delivery: FaultDelivery::Host,
        ..cpu.config().clone()
    };
    cpu.set_config(config);
}

pub(super) fn linear(segment: u16, offset: u32) -> u32 {
    ((segment as u32) << 4) + offset
}

/// Word at SS:offset of the real-mode stack
pub(super) fn stack_word(cpu: &Cpu<ArrayBus>, offset: u32) -> u16 {
    cpu.bus.read_u16(linear(STACK_SEGMENT, offset))
}

/// Point a real-mode IVT entry at `segment:offset`
pub(super) fn set_vector(cpu: &mut Cpu<ArrayBus>, vector: u8, segment: u16, offset: u16) {
    let entry = vector as u32 * 4;
    cpu.bus.write_u16(entry, offset);
    cpu.bus.write_u16(entry + 2, segment);
}

pub(super) fn write_descriptor(bus: &mut ArrayBus, table: u32, sel: u16, desc: SegmentDescriptor) {
    bus.load(table + (sel as u32 & !7), &desc.to_bytes());
}

/// Install a 32-bit gate in the IDT
pub(super) fn write_gate(bus: &mut ArrayBus, vector: u8, sel: u16, offset: u32, access: u8) {
    let bytes = [
        offset as u8,
        (offset >> 8) as u8,
        sel as u8,
        (sel >> 8) as u8,
        0,
        access,
        (offset >> 16) as u8,
        (offset >> 24) as u8,
    ];
    bus.load(IDT_BASE + vector as u32 * 8, &bytes);
}

pub(super) fn flat_code() -> SegmentDescriptor {
    SegmentDescriptor {
        base: 0,
        limit: 0xF_FFFF,
        access: 0x9A,
        flags: 0x0C,
    }
}

pub(super) fn flat_data() -> SegmentDescriptor {
    SegmentDescriptor {
        base: 0,
        limit: 0xF_FFFF,
        access: 0x92,
        flags: 0x0C,
    }
}

pub(super) fn tss_descriptor(base: u32, access: u8) -> SegmentDescriptor {
    SegmentDescriptor {
        base,
        limit: 0x67,
        access,
        flags: 0,
    }
}

/// Access byte of a GDT entry, for busy-bit checks
pub(super) fn gdt_access(cpu: &Cpu<ArrayBus>, sel: u16) -> u8 {
    cpu.bus.read_u8(GDT_BASE + (sel as u32 & !7) + 5)
}

/// Flat 32-bit protected mode at CPL 0 running task A
///
/// GDT: null, flat code (08), flat data (10), TSS A (18, busy), TSS B (20).
/// The IDT is empty but has a full-size limit.
pub(super) fn protected_mode_cpu() -> Cpu<ArrayBus> {
    let mut bus = ArrayBus::new();
    write_descriptor(&mut bus, GDT_BASE, CODE_SEL, flat_code());
    write_descriptor(&mut bus, GDT_BASE, DATA_SEL, flat_data());
    write_descriptor(&mut bus, GDT_BASE, TSS_A_SEL, tss_descriptor(TSS_A_BASE, 0x8B));
    write_descriptor(&mut bus, GDT_BASE, TSS_B_SEL, tss_descriptor(TSS_B_BASE, 0x89));

    let mut cpu = Cpu::with_model(bus, CpuModel::Intel80386);
    cpu.regs.gdtr = TableRegister {
        base: GDT_BASE,
        limit: 0x27,
    };
    cpu.regs.idtr = TableRegister {
        base: IDT_BASE,
        limit: 0x07FF,
    };
    cpu.regs.cr0 |= CR0_PE;

    let code = DescriptorCache::from_descriptor(&flat_code());
    let data = DescriptorCache::from_descriptor(&flat_data());
    cpu.regs.set_segment_cached(SegmentId::CS, CODE_SEL, code);
    for seg in [
        SegmentId::ES,
        SegmentId::SS,
        SegmentId::DS,
        SegmentId::FS,
        SegmentId::GS,
    ] {
        cpu.regs.set_segment_cached(seg, DATA_SEL, data);
    }
    cpu.regs.tr = SegmentRegister {
        selector: TSS_A_SEL,
        cache: DescriptorCache::from_descriptor(&tss_descriptor(TSS_A_BASE, 0x8B)),
    };
    cpu.regs.eip = PM_START;
    cpu.regs.set_gpr32(ESP, PM_STACK);
    cpu
}

/// Register image for a task running flat code at `eip`
pub(super) fn task_image(eip: u32, eax: u32) -> TaskSnapshot {
    TaskSnapshot {
        gpr: [eax, 0, 0, 0, 0x0008_0000, 0, 0, 0],
        eip,
        eflags: 0x0002,
        segments: [DATA_SEL, CODE_SEL, DATA_SEL, DATA_SEL, DATA_SEL, DATA_SEL],
        ldt: 0,
    }
}

pub(super) fn write_task_image(cpu: &mut Cpu<ArrayBus>, base: u32, image: &TaskSnapshot) {
    TSS32.write_snapshot(&mut cpu.bus, base, image);
}
