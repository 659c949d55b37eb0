//! ALU width masking, data movement, decimal adjust, bit operations and
//! model gating

use super::*;
use crate::config::CpuModel;
use crate::error::{ExecError, Fault};
use crate::flags::{FLAG_CF, FLAG_ZF};
use crate::instruction::{Instruction, Mnemonic};
use crate::operand::{OperandSize, RegId, SegmentId};
use crate::registers::{EAX, EBX, ECX, EDX};

#[test]
fn test_add_byte_leaves_upper_bits() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EAX, 0x1234_5601);

    let insn = Instruction::binary(Mnemonic::Add, reg(RegId::AL), imm8(0xFF)).with_length(2);
    assert_eq!(run(&mut cpu, insn), StepOutcome::Retired);

    assert_eq!(cpu.regs.gpr32(EAX), 0x1234_5600);
    assert!(cpu.regs.flags.get(FLAG_CF));
    assert!(cpu.regs.flags.get(FLAG_ZF));
    assert_eq!(cpu.regs.eip, START_IP + 2);
}

#[test]
fn test_add_high_byte_register() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EBX, 0xAAAA_10FF);

    let insn = Instruction::binary(Mnemonic::Add, reg(RegId::BH), imm8(0x01)).with_length(3);
    run(&mut cpu, insn);

    assert_eq!(cpu.regs.gpr32(EBX), 0xAAAA_11FF);
}

#[test]
fn test_add_word_leaves_upper_half() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(ECX, 0xDEAD_FFFF);

    let insn = Instruction::binary(Mnemonic::Add, reg(RegId::CX), imm8(0x02)).with_length(3);
    run(&mut cpu, insn);

    assert_eq!(cpu.regs.gpr32(ECX), 0xDEAD_0001);
    assert!(cpu.regs.flags.get(FLAG_CF));
}

#[test]
fn test_add_dword_with_sign_extended_immediate() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EDX, 10);

    // ADD EDX, -1 encoded as imm8
    let insn = Instruction::binary(Mnemonic::Add, reg(RegId::EDX), imm8(0xFF))
        .with_operand_size_32(true)
        .with_length(4);
    run(&mut cpu, insn);

    assert_eq!(cpu.regs.gpr32(EDX), 9);
    assert!(cpu.regs.flags.get(FLAG_CF));
}

#[test]
fn test_logical_immediate_is_not_sign_extended() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EAX, 0x1234);

    let insn = Instruction::binary(Mnemonic::And, reg(RegId::AX), imm8(0xFE)).with_length(3);
    run(&mut cpu, insn);

    assert_eq!(cpu.regs.read(RegId::AX), 0x0034);
    assert!(!cpu.regs.flags.get(FLAG_CF));
}

#[test]
fn test_cmp_and_test_do_not_write() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EAX, 0x42);

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Cmp, reg(RegId::AL), imm8(0x42)).with_length(2),
    );
    assert_eq!(cpu.regs.read(RegId::AL), 0x42);
    assert!(cpu.regs.flags.get(FLAG_ZF));

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Test, reg(RegId::AL), imm8(0x01)).with_length(2),
    );
    assert_eq!(cpu.regs.read(RegId::AL), 0x42);
    assert!(cpu.regs.flags.get(FLAG_ZF));
}

#[test]
fn test_memory_destination() {
    let mut cpu = real_mode_cpu();
    let addr = linear(DATA_SEGMENT, 0x0010);
    cpu.bus.write_u16(addr, 0x00FF);

    let dst = mem(SegmentId::DS, 0x0010, OperandSize::Word);
    run(
        &mut cpu,
        Instruction::unary(Mnemonic::Inc, dst).with_length(4),
    );
    assert_eq!(cpu.bus.read_u16(addr), 0x0100);

    run(
        &mut cpu,
        Instruction::unary(Mnemonic::Neg, dst).with_length(4),
    );
    assert_eq!(cpu.bus.read_u16(addr), 0xFF00);
    assert!(cpu.regs.flags.get(FLAG_CF));

    run(
        &mut cpu,
        Instruction::unary(Mnemonic::Not, dst).with_length(4),
    );
    assert_eq!(cpu.bus.read_u16(addr), 0x00FF);
}

#[test]
fn test_movsx_movzx() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EBX, 0x80);

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Movsx, reg(RegId::EAX), reg(RegId::BL))
            .with_operand_size_32(true)
            .with_length(4),
    );
    assert_eq!(cpu.regs.gpr32(EAX), 0xFFFF_FF80);

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Movzx, reg(RegId::ECX), reg(RegId::BL))
            .with_operand_size_32(true)
            .with_length(4),
    );
    assert_eq!(cpu.regs.gpr32(ECX), 0x80);
}

#[test]
fn test_xchg_xadd_cmpxchg() {
    let mut cpu = real_mode_cpu_for(CpuModel::Intel80486);
    cpu.regs.set_gpr32(EAX, 1);
    cpu.regs.set_gpr32(EBX, 2);

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Xchg, reg(RegId::AX), reg(RegId::BX)).with_length(1),
    );
    assert_eq!(cpu.regs.gpr32(EAX), 2);
    assert_eq!(cpu.regs.gpr32(EBX), 1);

    // XADD AX, BX: BX <- 2, AX <- 3
    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Xadd, reg(RegId::AX), reg(RegId::BX)).with_length(3),
    );
    assert_eq!(cpu.regs.gpr32(EAX), 3);
    assert_eq!(cpu.regs.gpr32(EBX), 2);

    // CMPXCHG CX, BX with AX == CX stores BX
    cpu.regs.set_gpr32(ECX, 3);
    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Cmpxchg, reg(RegId::CX), reg(RegId::BX)).with_length(3),
    );
    assert_eq!(cpu.regs.gpr32(ECX), 2);
    assert!(cpu.regs.flags.get(FLAG_ZF));

    // Mismatch loads the accumulator instead
    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Cmpxchg, reg(RegId::CX), reg(RegId::BX)).with_length(3),
    );
    assert_eq!(cpu.regs.gpr32(EAX), 2);
    assert!(!cpu.regs.flags.get(FLAG_ZF));
}

#[test]
fn test_cbw_cwd() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EAX, 0x0080);

    run(&mut cpu, Instruction::bare(Mnemonic::Cbw).with_length(1));
    assert_eq!(cpu.regs.read(RegId::AX), 0xFF80);

    run(&mut cpu, Instruction::bare(Mnemonic::Cwd).with_length(1));
    assert_eq!(cpu.regs.read(RegId::DX), 0xFFFF);

    cpu.regs.set_gpr32(EAX, 0x8000);
    run(
        &mut cpu,
        Instruction::bare(Mnemonic::Cbw)
            .with_operand_size_32(true)
            .with_length(2),
    );
    assert_eq!(cpu.regs.gpr32(EAX), 0xFFFF_8000);
}

#[test]
fn test_lea_stores_offset() {
    let mut cpu = real_mode_cpu();
    run(
        &mut cpu,
        Instruction::binary(
            Mnemonic::Lea,
            reg(RegId::SI),
            mem(SegmentId::DS, 0x1234, OperandSize::Word),
        )
        .with_length(4),
    );
    assert_eq!(cpu.regs.read(RegId::SI), 0x1234);
}

#[test]
fn test_les_loads_pointer() {
    let mut cpu = real_mode_cpu();
    let addr = linear(DATA_SEGMENT, 0x0020);
    cpu.bus.write_u16(addr, 0x5678);
    cpu.bus.write_u16(addr + 2, 0x9000);

    run(
        &mut cpu,
        Instruction::binary(
            Mnemonic::Les,
            reg(RegId::DI),
            mem(SegmentId::DS, 0x0020, OperandSize::Dword),
        )
        .with_length(4),
    );
    assert_eq!(cpu.regs.read(RegId::DI), 0x5678);
    assert_eq!(cpu.regs.selector(SegmentId::ES), 0x9000);
    assert_eq!(cpu.regs.segment_base(SegmentId::ES), 0x9_0000);
}

#[test]
fn test_xlat() {
    let mut cpu = real_mode_cpu();
    cpu.bus.write_u8(linear(DATA_SEGMENT, 0x0205), 0x77);
    cpu.regs.set_gpr32(EBX, 0x0200);
    cpu.regs.set_gpr32(EAX, 0x05);

    run(&mut cpu, Instruction::bare(Mnemonic::Xlat).with_length(1));
    assert_eq!(cpu.regs.read(RegId::AL), 0x77);
}

#[test]
fn test_in_out() {
    let mut cpu = real_mode_cpu();
    cpu.bus.set_port(0x60, 0x1C);

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::In, reg(RegId::AL), imm8(0x60)).with_length(2),
    );
    assert_eq!(cpu.regs.read(RegId::AL), 0x1C);

    cpu.regs.set_gpr32(EDX, 0x03F8);
    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Out, reg(RegId::DX), reg(RegId::AL)).with_length(1),
    );
    assert_eq!(
        cpu.bus.port_writes(),
        &[(0x03F8, 0x1C, OperandSize::Byte)]
    );
}

#[test]
fn test_daa_after_add() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EAX, 0x79);

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Add, reg(RegId::AL), imm8(0x35)).with_length(2),
    );
    run(&mut cpu, Instruction::bare(Mnemonic::Daa).with_length(1));

    // 79 + 35 = 114 in BCD
    assert_eq!(cpu.regs.read(RegId::AL), 0x14);
    assert!(cpu.regs.flags.get(FLAG_CF));
}

#[test]
fn test_aaa_carries_into_ah() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EAX, 0x00FF);
    cpu.regs.flags.set(crate::flags::FLAG_AF, true);

    run(&mut cpu, Instruction::bare(Mnemonic::Aaa).with_length(1));
    // 80286+ adds 0x106 to AX
    assert_eq!(cpu.regs.read(RegId::AX), 0x0205);
    assert!(cpu.regs.flags.get(FLAG_CF));
}

#[test]
fn test_aaa_8086_adjusts_bytes_separately() {
    let mut cpu = real_mode_cpu_for(CpuModel::Intel8086);
    cpu.regs.set_gpr32(EAX, 0x00FF);
    cpu.regs.flags.set(crate::flags::FLAG_AF, true);

    run(&mut cpu, Instruction::bare(Mnemonic::Aaa).with_length(1));
    assert_eq!(cpu.regs.read(RegId::AX), 0x0105);
}

#[test]
fn test_aam_and_aad() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EAX, 63);

    run(&mut cpu, Instruction::bare(Mnemonic::Aam).with_length(2));
    assert_eq!(cpu.regs.read(RegId::AX), 0x0603);

    run(&mut cpu, Instruction::bare(Mnemonic::Aad).with_length(2));
    assert_eq!(cpu.regs.read(RegId::AX), 63);
}

#[test]
fn test_aam_zero_base_faults() {
    let mut cpu = real_mode_cpu();
    host_delivery(&mut cpu);
    cpu.regs.set_gpr32(EAX, 63);

    let outcome = run(
        &mut cpu,
        Instruction::unary(Mnemonic::Aam, imm8(0)).with_length(2),
    );
    assert_eq!(outcome, StepOutcome::Faulted(Fault::DivideError));
    assert_eq!(cpu.regs.read(RegId::AX), 63);
    assert_eq!(cpu.regs.eip, START_IP);
}

#[test]
fn test_bit_test_family() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EAX, 0b1000);

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Bt, reg(RegId::AX), imm8(3)).with_length(4),
    );
    assert!(cpu.regs.flags.get(FLAG_CF));

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Bts, reg(RegId::AX), imm8(0)).with_length(4),
    );
    assert!(!cpu.regs.flags.get(FLAG_CF));
    assert_eq!(cpu.regs.read(RegId::AX), 0b1001);

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Btr, reg(RegId::AX), imm8(3)).with_length(4),
    );
    assert_eq!(cpu.regs.read(RegId::AX), 0b0001);

    // Offset 17 wraps to bit 1 in a 16-bit register
    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Btc, reg(RegId::AX), imm8(17)).with_length(4),
    );
    assert_eq!(cpu.regs.read(RegId::AX), 0b0011);
}

#[test]
fn test_bit_test_register_offset_reaches_next_word() {
    let mut cpu = real_mode_cpu();
    let addr = linear(DATA_SEGMENT, 0x0040);
    cpu.bus.write_u16(addr + 2, 0x0004);
    cpu.regs.set_gpr32(ECX, 18);

    run(
        &mut cpu,
        Instruction::binary(
            Mnemonic::Bt,
            mem(SegmentId::DS, 0x0040, OperandSize::Word),
            reg(RegId::CX),
        )
        .with_length(4),
    );
    assert!(cpu.regs.flags.get(FLAG_CF));
}

#[test]
fn test_bit_scan() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EBX, 0x0001_0100);
    cpu.regs.set_gpr32(EAX, 0xAAAA);

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Bsf, reg(RegId::EAX), reg(RegId::EBX))
            .with_operand_size_32(true)
            .with_length(4),
    );
    assert_eq!(cpu.regs.gpr32(EAX), 8);
    assert!(!cpu.regs.flags.get(FLAG_ZF));

    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Bsr, reg(RegId::EAX), reg(RegId::EBX))
            .with_operand_size_32(true)
            .with_length(4),
    );
    assert_eq!(cpu.regs.gpr32(EAX), 16);

    // Zero source: ZF set, destination untouched
    cpu.regs.set_gpr32(EBX, 0);
    run(
        &mut cpu,
        Instruction::binary(Mnemonic::Bsf, reg(RegId::EAX), reg(RegId::EBX))
            .with_operand_size_32(true)
            .with_length(4),
    );
    assert_eq!(cpu.regs.gpr32(EAX), 16);
    assert!(cpu.regs.flags.get(FLAG_ZF));
}

#[test]
fn test_bswap_requires_486() {
    let mut cpu = real_mode_cpu();
    host_delivery(&mut cpu);
    cpu.regs.set_gpr32(EAX, 0x1122_3344);

    let insn = Instruction::unary(Mnemonic::Bswap, reg(RegId::EAX))
        .with_operand_size_32(true)
        .with_length(2);
    assert_eq!(
        run(&mut cpu, insn),
        StepOutcome::Faulted(Fault::InvalidOpcode)
    );
    assert_eq!(cpu.regs.gpr32(EAX), 0x1122_3344);

    let mut cpu = real_mode_cpu_for(CpuModel::Intel80486);
    cpu.regs.set_gpr32(EAX, 0x1122_3344);
    run(&mut cpu, insn);
    assert_eq!(cpu.regs.gpr32(EAX), 0x4433_2211);
}

#[test]
fn test_bswap_word_register_is_rejected() {
    let mut cpu = real_mode_cpu_for(CpuModel::Intel80486);
    let insn = Instruction::unary(Mnemonic::Bswap, reg(RegId::AX)).with_length(3);

    assert!(matches!(
        cpu.execute(&insn),
        Err(ExecError::OperandMismatch {
            mnemonic: Mnemonic::Bswap,
            ..
        })
    ));
    assert_eq!(cpu.regs.eip, START_IP);
}

#[test]
fn test_80186_instruction_on_8086() {
    let mut cpu = real_mode_cpu_for(CpuModel::Intel8086);
    host_delivery(&mut cpu);

    let outcome = run(&mut cpu, Instruction::bare(Mnemonic::Pusha).with_length(1));
    assert_eq!(outcome, StepOutcome::Faulted(Fault::InvalidOpcode));
    assert_eq!(cpu.regs.gpr32(crate::registers::ESP), STACK_TOP);
}

#[test]
fn test_unsupported_instruction_reports_to_host() {
    let mut cpu = real_mode_cpu();
    let insn = Instruction::binary(Mnemonic::Lar, reg(RegId::AX), reg(RegId::BX)).with_length(3);

    assert_eq!(
        cpu.execute(&insn),
        Err(ExecError::Unsupported {
            mnemonic: Mnemonic::Lar
        })
    );
    assert_eq!(cpu.regs.eip, START_IP);
    assert_eq!(cpu.instructions_retired(), 0);
}

#[test]
fn test_operand_arity_mismatch() {
    let mut cpu = real_mode_cpu();
    let insn = Instruction::unary(Mnemonic::Add, reg(RegId::AX)).with_length(2);

    assert!(matches!(
        cpu.execute(&insn),
        Err(ExecError::OperandMismatch { .. })
    ));
}

#[test]
fn test_immediate_destination_names_instruction() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set_gpr32(EAX, 0x5555);

    let mov = Instruction::binary(Mnemonic::Mov, imm16(0x1234), reg(RegId::AX)).with_length(3);
    assert_eq!(
        cpu.execute(&mov),
        Err(ExecError::OperandMismatch {
            mnemonic: Mnemonic::Mov,
            detail: "immediate destination",
        })
    );
    assert_eq!(cpu.regs.eip, START_IP);

    let not = Instruction::unary(Mnemonic::Not, imm8(0x0F)).with_length(2);
    assert_eq!(
        cpu.execute(&not),
        Err(ExecError::OperandMismatch {
            mnemonic: Mnemonic::Not,
            detail: "immediate destination",
        })
    );
    assert_eq!(cpu.regs.gpr32(EAX), 0x5555);
    assert_eq!(cpu.instructions_retired(), 0);
}

#[test]
fn test_invalid_opcode_vectors_through_ivt() {
    let mut cpu = real_mode_cpu();
    set_vector(&mut cpu, 6, 0x0050, 0x0000);

    let outcome = run(&mut cpu, Instruction::bare(Mnemonic::Invalid).with_length(2));
    assert_eq!(outcome, StepOutcome::Faulted(Fault::InvalidOpcode));
    assert_eq!(cpu.regs.selector(SegmentId::CS), 0x0050);
    assert_eq!(cpu.regs.eip, 0);
    // Return address is the faulting instruction
    assert_eq!(stack_word(&cpu, STACK_TOP - 6), START_IP as u16);
}
