//! Segment loads and system registers

use super::*;
use crate::config::CpuModel;
use crate::error::{ExecError, Fault};
use crate::instruction::{Instruction, Mnemonic};
use crate::operand::{OperandSize, RegId, SegmentId};
use crate::protected::SegmentDescriptor;
use crate::registers::{CR0_EM, CR0_MP, CR0_PE, CR0_TS, EAX, EBX, ECX, EDX, ESP};

fn mov_seg(seg: SegmentId, sel: u16) -> Instruction {
    Instruction::binary(Mnemonic::Mov, reg(RegId::Seg(seg)), imm16(sel as u32)).with_length(2)
}

#[test]
fn test_real_mode_segment_load() {
    let mut cpu = real_mode_cpu();
    run(&mut cpu, mov_seg(SegmentId::FS, 0xB800));
    assert_eq!(cpu.regs.selector(SegmentId::FS), 0xB800);
    assert_eq!(cpu.regs.segment_base(SegmentId::FS), 0xB_8000);
}

#[test]
fn test_mov_to_cs_is_undefined() {
    let mut cpu = real_mode_cpu();
    host_delivery(&mut cpu);

    let outcome = run(&mut cpu, mov_seg(SegmentId::CS, 0x2000));
    assert_eq!(outcome, StepOutcome::Faulted(Fault::InvalidOpcode));
    assert_eq!(cpu.regs.selector(SegmentId::CS), CODE_SEGMENT);
}

#[test]
fn test_protected_mode_data_segment_load() {
    let mut cpu = protected_mode_cpu();
    let window = SegmentDescriptor {
        base: 0x0012_0000,
        limit: 0x0FFF,
        access: 0x92,
        flags: 0x04,
    };
    write_descriptor(&mut cpu.bus, GDT_BASE, 0x28, window);
    cpu.regs.gdtr.limit = 0x2F;

    run(&mut cpu, mov_seg(SegmentId::ES, 0x28));
    let es = cpu.regs.segment(SegmentId::ES);
    assert_eq!(es.selector, 0x28);
    assert_eq!(es.cache.base, 0x0012_0000);
    assert_eq!(es.cache.limit, 0x0FFF);
}

#[test]
fn test_null_selector_in_data_register() {
    let mut cpu = protected_mode_cpu();

    run(&mut cpu, mov_seg(SegmentId::GS, 0));
    assert_eq!(cpu.regs.selector(SegmentId::GS), 0);
    assert_eq!(cpu.regs.segment(SegmentId::GS).cache.access, 0);
}

#[test]
fn test_null_selector_in_ss_faults() {
    let mut cpu = protected_mode_cpu();
    host_delivery(&mut cpu);

    let outcome = run(&mut cpu, mov_seg(SegmentId::SS, 0));
    assert_eq!(outcome, StepOutcome::Faulted(Fault::GeneralProtection(0)));
    assert_eq!(cpu.regs.selector(SegmentId::SS), DATA_SEL);
}

#[test]
fn test_code_segment_into_ss_faults() {
    let mut cpu = protected_mode_cpu();
    host_delivery(&mut cpu);

    let outcome = run(&mut cpu, mov_seg(SegmentId::SS, CODE_SEL));
    assert_eq!(
        outcome,
        StepOutcome::Faulted(Fault::GeneralProtection(CODE_SEL))
    );
}

#[test]
fn test_not_present_segment() {
    let mut cpu = protected_mode_cpu();
    host_delivery(&mut cpu);
    let absent = SegmentDescriptor {
        access: 0x12,
        ..flat_data()
    };
    write_descriptor(&mut cpu.bus, GDT_BASE, 0x28, absent);
    cpu.regs.gdtr.limit = 0x2F;

    let outcome = run(&mut cpu, mov_seg(SegmentId::DS, 0x28));
    assert_eq!(outcome, StepOutcome::Faulted(Fault::SegmentNotPresent(0x28)));

    let outcome = run(&mut cpu, mov_seg(SegmentId::SS, 0x28));
    assert_eq!(outcome, StepOutcome::Faulted(Fault::StackFault(0x28)));
}

#[test]
fn test_privileged_data_segment_from_rpl3() {
    let mut cpu = protected_mode_cpu();
    host_delivery(&mut cpu);

    // DPL 0 data with RPL 3 fails the max(CPL, RPL) check
    let outcome = run(&mut cpu, mov_seg(SegmentId::DS, DATA_SEL | 3));
    assert_eq!(
        outcome,
        StepOutcome::Faulted(Fault::GeneralProtection(DATA_SEL))
    );
}

#[test]
fn test_lds_with_bad_selector_keeps_register() {
    let mut cpu = protected_mode_cpu();
    host_delivery(&mut cpu);
    cpu.bus.write_u16(0x0005_0000, 0x1234);
    cpu.bus.write_u16(0x0005_0002, 0x0040);
    cpu.regs.set_gpr32(EBX, 0x7777);

    let insn = Instruction::binary(
        Mnemonic::Lds,
        reg(RegId::BX),
        mem(SegmentId::DS, 0x0005_0000, OperandSize::Dword),
    )
    .with_length(3);
    let outcome = run(&mut cpu, insn);
    assert_eq!(
        outcome,
        StepOutcome::Faulted(Fault::GeneralProtection(0x40))
    );
    assert_eq!(cpu.regs.gpr32(EBX), 0x7777);
}

#[test]
fn test_far_jump_to_code_segment_in_protected_mode() {
    let mut cpu = protected_mode_cpu();

    let insn = Instruction::binary(Mnemonic::Jmpf, imm16(CODE_SEL as u32), imm32(0x0006_0000))
        .with_operand_size_32(true)
        .with_length(7);
    run(&mut cpu, insn);
    assert_eq!(cpu.regs.selector(SegmentId::CS), CODE_SEL);
    assert_eq!(cpu.regs.eip, 0x0006_0000);
}

#[test]
fn test_far_jump_to_data_segment_faults() {
    let mut cpu = protected_mode_cpu();
    host_delivery(&mut cpu);

    let insn = Instruction::binary(Mnemonic::Jmpf, imm16(DATA_SEL as u32), imm32(0))
        .with_operand_size_32(true)
        .with_length(7);
    assert_eq!(
        run(&mut cpu, insn),
        StepOutcome::Faulted(Fault::GeneralProtection(DATA_SEL))
    );
    assert_eq!(cpu.regs.eip, PM_START);
}

#[test]
fn test_call_gate_enters_target() {
    let mut cpu = protected_mode_cpu();
    // 32-bit call gate at 0x28 -> CODE_SEL:0x00070000
    let gate = [0x00, 0x00, CODE_SEL as u8, 0, 0, 0x8C, 0x07, 0x00];
    cpu.bus.load(GDT_BASE + 0x28, &gate);
    cpu.regs.gdtr.limit = 0x2F;

    let insn = Instruction::binary(Mnemonic::Callf, imm16(0x28), imm32(0))
        .with_operand_size_32(true)
        .with_length(7);
    run(&mut cpu, insn);

    assert_eq!(cpu.regs.eip, 0x0007_0000);
    assert_eq!(cpu.regs.selector(SegmentId::CS), CODE_SEL);
    assert_eq!(cpu.bus.read_u32(PM_STACK - 4), CODE_SEL as u32);
    assert_eq!(cpu.bus.read_u32(PM_STACK - 8), PM_START + 7);

    run(
        &mut cpu,
        Instruction::bare(Mnemonic::Retf)
            .with_operand_size_32(true)
            .with_length(1),
    );
    assert_eq!(cpu.regs.eip, PM_START + 7);
    assert_eq!(cpu.regs.gpr32(ESP), PM_STACK);
}

#[test]
fn test_lgdt_sgdt() {
    let mut cpu = real_mode_cpu();
    let src = linear(DATA_SEGMENT, 0x0500);
    cpu.bus.write_u16(src, 0x0027);
    cpu.bus.write_u32(src + 2, 0x1234_5678);

    run(
        &mut cpu,
        Instruction::unary(Mnemonic::Lgdt, mem(SegmentId::DS, 0x0500, OperandSize::Dword))
            .with_length(5),
    );
    assert_eq!(cpu.regs.gdtr.limit, 0x0027);
    // 16-bit operand size keeps 24 bits of base
    assert_eq!(cpu.regs.gdtr.base, 0x0034_5678);

    run(
        &mut cpu,
        Instruction::unary(Mnemonic::Sgdt, mem(SegmentId::DS, 0x0600, OperandSize::Dword))
            .with_operand_size_32(true)
            .with_length(6),
    );
    let dst = linear(DATA_SEGMENT, 0x0600);
    assert_eq!(cpu.bus.read_u16(dst), 0x0027);
    assert_eq!(cpu.bus.read_u32(dst + 2), 0x0034_5678);
}

#[test]
fn test_80286_sidt_sets_high_byte() {
    let mut cpu = real_mode_cpu_for(CpuModel::Intel80286);

    run(
        &mut cpu,
        Instruction::unary(Mnemonic::Sidt, mem(SegmentId::DS, 0x0010, OperandSize::Dword))
            .with_length(5),
    );
    let dst = linear(DATA_SEGMENT, 0x0010);
    assert_eq!(cpu.bus.read_u16(dst), 0x03FF);
    assert_eq!(cpu.bus.read_u32(dst + 2), 0xFF00_0000);
}

#[test]
fn test_lgdt_register_operand_is_rejected() {
    let mut cpu = real_mode_cpu();
    let insn = Instruction::unary(Mnemonic::Lgdt, reg(RegId::AX)).with_length(3);
    assert!(matches!(
        cpu.execute(&insn),
        Err(ExecError::OperandMismatch { .. })
    ));
}

#[test]
fn test_lmsw_cannot_clear_pe() {
    let mut cpu = real_mode_cpu();

    run(&mut cpu, Instruction::unary(Mnemonic::Lmsw, imm16(0x0003)).with_length(3));
    assert_eq!(cpu.regs.cr0 & 0x0F, CR0_PE | CR0_MP);

    run(&mut cpu, Instruction::unary(Mnemonic::Lmsw, imm16(0x0000)).with_length(3));
    assert_eq!(cpu.regs.cr0 & 0x0F, CR0_PE);
}

#[test]
fn test_smsw_and_clts() {
    let mut cpu = real_mode_cpu();
    cpu.regs.cr0 = CR0_TS | CR0_EM;

    run(&mut cpu, Instruction::unary(Mnemonic::Smsw, reg(RegId::AX)).with_length(3));
    assert_eq!(cpu.regs.read(RegId::AX), CR0_TS | CR0_EM);

    run(&mut cpu, Instruction::bare(Mnemonic::Clts).with_length(2));
    assert_eq!(cpu.regs.cr0, CR0_EM);
}

#[test]
fn test_wait_and_escape_with_task_switched() {
    let mut cpu = real_mode_cpu();
    host_delivery(&mut cpu);

    run(&mut cpu, Instruction::bare(Mnemonic::Wait).with_length(1));

    cpu.regs.cr0 = CR0_MP | CR0_TS;
    assert_eq!(
        run(&mut cpu, Instruction::bare(Mnemonic::Wait).with_length(1)),
        StepOutcome::Faulted(Fault::DeviceNotAvailable)
    );
    assert_eq!(
        run(&mut cpu, Instruction::bare(Mnemonic::Esc).with_length(2)),
        StepOutcome::Faulted(Fault::DeviceNotAvailable)
    );

    cpu.regs.cr0 = 0;
    assert_eq!(
        cpu.execute(&Instruction::bare(Mnemonic::Esc).with_length(2)),
        Err(ExecError::Unsupported {
            mnemonic: Mnemonic::Esc
        })
    );
}

#[test]
fn test_cpuid() {
    let mut cpu = real_mode_cpu_for(CpuModel::Intel80486);
    cpu.regs.set_gpr32(EAX, 0);

    run(&mut cpu, Instruction::bare(Mnemonic::Cpuid).with_length(2));
    assert_eq!(cpu.regs.gpr32(EAX), 1);
    let mut vendor = Vec::new();
    for index in [EBX, EDX, ECX] {
        vendor.extend_from_slice(&cpu.regs.gpr32(index).to_le_bytes());
    }
    assert_eq!(vendor, b"GenuineIntel");

    cpu.regs.set_gpr32(EAX, 1);
    run(&mut cpu, Instruction::bare(Mnemonic::Cpuid).with_length(2));
    assert_eq!(cpu.regs.gpr32(EAX), 0x0410);
}

#[test]
fn test_ldt_and_task_register_need_protected_mode() {
    let mut cpu = real_mode_cpu();
    host_delivery(&mut cpu);

    let outcome = run(
        &mut cpu,
        Instruction::unary(Mnemonic::Sldt, reg(RegId::AX)).with_length(3),
    );
    assert_eq!(outcome, StepOutcome::Faulted(Fault::InvalidOpcode));
}

#[test]
fn test_lldt_and_ldt_segments() {
    let mut cpu = protected_mode_cpu();
    // LDT at 0x4000 with one data descriptor at index 1
    let ldt = SegmentDescriptor {
        base: 0x4000,
        limit: 0x0F,
        access: 0x82,
        flags: 0,
    };
    write_descriptor(&mut cpu.bus, GDT_BASE, 0x28, ldt);
    cpu.regs.gdtr.limit = 0x2F;
    let local = SegmentDescriptor {
        base: 0x0020_0000,
        ..flat_data()
    };
    write_descriptor(&mut cpu.bus, 0x4000, 0x08, local);

    run(&mut cpu, Instruction::unary(Mnemonic::Lldt, imm16(0x28)).with_length(3));
    assert_eq!(cpu.regs.ldtr.selector, 0x28);
    assert_eq!(cpu.regs.ldtr.cache.base, 0x4000);

    // Selector 0x0C: index 1, TI set
    run(&mut cpu, mov_seg(SegmentId::FS, 0x0C));
    assert_eq!(cpu.regs.segment_base(SegmentId::FS), 0x0020_0000);

    run(&mut cpu, Instruction::unary(Mnemonic::Sldt, reg(RegId::CX)).with_length(3));
    assert_eq!(cpu.regs.read(RegId::CX), 0x28);
}

#[test]
fn test_ltr_marks_tss_busy() {
    let mut cpu = protected_mode_cpu();

    run(
        &mut cpu,
        Instruction::unary(Mnemonic::Ltr, imm16(TSS_B_SEL as u32)).with_length(3),
    );
    assert_eq!(cpu.regs.tr.selector, TSS_B_SEL);
    assert_eq!(gdt_access(&cpu, TSS_B_SEL), 0x8B);

    run(&mut cpu, Instruction::unary(Mnemonic::Str, reg(RegId::AX)).with_length(3));
    assert_eq!(cpu.regs.read(RegId::AX), TSS_B_SEL as u32);
}

#[test]
fn test_ltr_on_busy_tss_faults() {
    let mut cpu = protected_mode_cpu();
    host_delivery(&mut cpu);

    let outcome = run(
        &mut cpu,
        Instruction::unary(Mnemonic::Ltr, imm16(TSS_A_SEL as u32)).with_length(3),
    );
    assert_eq!(
        outcome,
        StepOutcome::Faulted(Fault::GeneralProtection(TSS_A_SEL))
    );
}
