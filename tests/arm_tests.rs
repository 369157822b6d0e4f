use em3ds::memory::ConsoleModel;
use em3ds::processor::{PsrMode, REG_LR, REG_PC, REG_SP};
use em3ds::{Configuration, Emulator};

fn make_emulator() -> Emulator {
    let config = Configuration {
        model: ConsoleModel::Old3ds,
        boot9: vec![0; 64 * 1024],
        boot11: vec![0; 64 * 1024],
        otp: None,
    };
    Emulator::new(config).expect("emulator setup")
}

fn write_fcram32(emulator: &mut Emulator, addr: u32, value: u32) {
    let mut bus = emulator.bus.borrow_mut();
    let at = (addr - 0x2000_0000) as usize;
    bus.fcram[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_fcram32(emulator: &mut Emulator, addr: u32) -> u32 {
    let bus = emulator.bus.borrow();
    let at = (addr - 0x2000_0000) as usize;
    u32::from_le_bytes([bus.fcram[at], bus.fcram[at + 1], bus.fcram[at + 2], bus.fcram[at + 3]])
}

fn write_boot11_16(emulator: &mut Emulator, addr: u32, value: u16) {
    let mut bus = emulator.bus.borrow_mut();
    let at = addr as usize;
    bus.boot11_free[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

#[test]
fn adds_sets_overflow_and_negative() {
    let mut emulator = make_emulator();
    write_fcram32(&mut emulator, 0x2000_0000, 0xE090_2001); // adds r2, r0, r1

    let cpu = emulator.arm11(0);
    cpu.gpr[0] = 0x7FFF_FFFF;
    cpu.gpr[1] = 0x0000_0001;
    cpu.jump(0x2000_0000, false);
    cpu.run(1).expect("run");

    assert_eq!(cpu.gpr[2], 0x8000_0000);
    assert!(cpu.cpsr.negative);
    assert!(!cpu.cpsr.zero);
    assert!(!cpu.cpsr.carry);
    assert!(cpu.cpsr.overflow);
}

#[test]
fn thumb_long_branch_pair() {
    let mut emulator = make_emulator();
    write_boot11_16(&mut emulator, 0x1000, 0xF000); // bl prep, offset 0
    write_boot11_16(&mut emulator, 0x1002, 0xF800); // bl, offset 0

    let cpu = emulator.arm11(0);
    cpu.jump(0x1001, true);
    assert!(cpu.cpsr.thumb);
    cpu.run(2).expect("run");

    assert_eq!(cpu.gpr[REG_LR], 0x1005);
    // the visible PC is two ahead of the next fetch in Thumb state
    assert_eq!(cpu.gpr[REG_PC], 0x1006);
}

#[test]
fn unaligned_word_load_rotates() {
    let mut emulator = make_emulator();
    write_fcram32(&mut emulator, 0x2000_1000, 0xDEAD_BEEF);
    write_fcram32(&mut emulator, 0x2000_1004, 0x1234_5678);
    write_fcram32(&mut emulator, 0x2000_0000, 0xE591_0000); // ldr r0, [r1]

    let cpu = emulator.arm11(0);
    cpu.gpr[1] = 0x2000_1002;
    cpu.jump(0x2000_0000, false);
    cpu.run(1).expect("run");

    assert_eq!(cpu.gpr[0], 0xBEEF_DEAD);
}

#[test]
fn exclusive_store_fails_after_foreign_store() {
    let mut emulator = make_emulator();
    write_fcram32(&mut emulator, 0x2000_0000, 0xAAAA_AAAA);
    // core 0 at 0x20000100: ldrex r0, [r1] then strex r3, r4, [r1]
    write_fcram32(&mut emulator, 0x2000_0100, 0xE191_0F9F);
    write_fcram32(&mut emulator, 0x2000_0104, 0xE181_3F94);
    // core 1 at 0x20000200: str r2, [r1]
    write_fcram32(&mut emulator, 0x2000_0200, 0xE581_2000);

    {
        let cpu = emulator.arm11(0);
        cpu.gpr[1] = 0x2000_0000;
        cpu.gpr[4] = 0x5555_5555;
        cpu.jump(0x2000_0100, false);
        cpu.run(1).expect("ldrex");
        assert_eq!(cpu.gpr[0], 0xAAAA_AAAA);
    }
    {
        let cpu = emulator.arm11(1);
        cpu.unhalt();
        cpu.gpr[1] = 0x2000_0000;
        cpu.gpr[2] = 0x1111_1111;
        cpu.jump(0x2000_0200, false);
        cpu.run(1).expect("str");
    }
    {
        let cpu = emulator.arm11(0);
        cpu.run(1).expect("strex");
        assert_eq!(cpu.gpr[3], 1);
    }
    assert_eq!(read_fcram32(&mut emulator, 0x2000_0000), 0x1111_1111);
}

#[test]
fn exclusive_store_succeeds_when_undisturbed() {
    let mut emulator = make_emulator();
    write_fcram32(&mut emulator, 0x2000_0100, 0xE191_0F9F); // ldrex r0, [r1]
    write_fcram32(&mut emulator, 0x2000_0104, 0xE181_3F94); // strex r3, r4, [r1]

    let cpu = emulator.arm11(0);
    cpu.gpr[1] = 0x2000_0000;
    cpu.gpr[4] = 0x5555_5555;
    cpu.jump(0x2000_0100, false);
    cpu.run(2).expect("run");
    assert_eq!(cpu.gpr[3], 0);
    assert_eq!(read_fcram32(&mut emulator, 0x2000_0000), 0x5555_5555);
}

#[test]
fn flags_untouched_without_s_bit() {
    let mut emulator = make_emulator();
    write_fcram32(&mut emulator, 0x2000_0000, 0xE090_2001); // adds r2, r0, r1
    write_fcram32(&mut emulator, 0x2000_0004, 0xE080_5001); // add r5, r0, r1

    let cpu = emulator.arm11(0);
    cpu.gpr[0] = 0x7FFF_FFFF;
    cpu.gpr[1] = 1;
    cpu.jump(0x2000_0000, false);
    cpu.run(1).expect("adds");
    let flags_after_s = cpu.cpsr.get() & 0xF800_0000;

    cpu.run(1).expect("add");
    assert_eq!(cpu.cpsr.get() & 0xF800_0000, flags_after_s);
    assert_eq!(cpu.gpr[5], 0x8000_0000);
}

#[test]
fn mode_swap_round_trip() {
    let mut emulator = make_emulator();
    let cpu = emulator.arm11(0);

    cpu.gpr[REG_SP] = 0x1000;
    cpu.gpr[REG_LR] = 0x2000;

    cpu.update_reg_mode(PsrMode::Irq);
    cpu.cpsr.mode = PsrMode::Irq;
    cpu.gpr[REG_SP] = 0xBEEF;

    cpu.update_reg_mode(PsrMode::Supervisor);
    cpu.cpsr.mode = PsrMode::Supervisor;
    assert_eq!(cpu.gpr[REG_SP], 0x1000);
    assert_eq!(cpu.gpr[REG_LR], 0x2000);

    cpu.update_reg_mode(PsrMode::Irq);
    cpu.cpsr.mode = PsrMode::Irq;
    assert_eq!(cpu.gpr[REG_SP], 0xBEEF);
}

#[test]
fn fiq_bank_covers_r8_to_r12() {
    let mut emulator = make_emulator();
    let cpu = emulator.arm11(0);

    for i in 8..13 {
        cpu.gpr[i] = i as u32;
    }
    cpu.update_reg_mode(PsrMode::Fiq);
    cpu.cpsr.mode = PsrMode::Fiq;
    for i in 8..13 {
        cpu.gpr[i] = 0xF00 + i as u32;
    }
    cpu.update_reg_mode(PsrMode::System);
    cpu.cpsr.mode = PsrMode::System;
    for i in 8..13 {
        assert_eq!(cpu.gpr[i], i as u32);
    }
}

#[test]
fn clz_counts_leading_zeros() {
    let mut emulator = make_emulator();
    write_fcram32(&mut emulator, 0x2000_0000, 0xE16F_1F12); // clz r1, r2

    let cpu = emulator.arm11(0);
    cpu.gpr[2] = 0x0001_0000;
    cpu.jump(0x2000_0000, false);
    cpu.run(1).expect("run");
    assert_eq!(cpu.gpr[1], 15);

    write_fcram32(&mut emulator, 0x2000_0004, 0xE16F_1F12);
    let cpu = emulator.arm11(0);
    cpu.gpr[2] = 0;
    cpu.run(1).expect("run");
    assert_eq!(cpu.gpr[1], 32);
}

#[test]
fn multiply_long_signed() {
    let mut emulator = make_emulator();
    // smull r2, r3, r0, r1
    write_fcram32(&mut emulator, 0x2000_0000, 0xE0C3_2190);

    let cpu = emulator.arm11(0);
    cpu.gpr[0] = (-2i32) as u32;
    cpu.gpr[1] = 3;
    cpu.jump(0x2000_0000, false);
    cpu.run(1).expect("run");

    let result = ((cpu.gpr[3] as u64) << 32) | cpu.gpr[2] as u64;
    assert_eq!(result as i64, -6);
}

#[test]
fn block_transfer_round_trip() {
    let mut emulator = make_emulator();
    // stmdb r0!, {r1-r3} / ldmia r0!, {r4-r6}
    write_fcram32(&mut emulator, 0x2000_0000, 0xE920_000E);
    write_fcram32(&mut emulator, 0x2000_0004, 0xE8B0_0070);

    let cpu = emulator.arm11(0);
    cpu.gpr[0] = 0x2000_1000;
    cpu.gpr[1] = 0x11;
    cpu.gpr[2] = 0x22;
    cpu.gpr[3] = 0x33;
    cpu.jump(0x2000_0000, false);
    cpu.run(2).expect("run");

    assert_eq!(cpu.gpr[0], 0x2000_1000);
    assert_eq!(cpu.gpr[4], 0x11);
    assert_eq!(cpu.gpr[5], 0x22);
    assert_eq!(cpu.gpr[6], 0x33);
}

#[test]
fn msr_cannot_set_thumb_bit() {
    let mut emulator = make_emulator();
    write_fcram32(&mut emulator, 0x2000_0000, 0xE129_F000); // msr cpsr_fc, r0

    let cpu = emulator.arm11(0);
    cpu.gpr[0] = 0xF000_0033; // NZCV, the T bit, supervisor mode bits
    cpu.jump(0x2000_0000, false);
    cpu.run(1).expect("run");

    assert!(cpu.cpsr.negative && cpu.cpsr.zero && cpu.cpsr.carry && cpu.cpsr.overflow);
    assert_eq!(cpu.cpsr.mode, PsrMode::Supervisor);
    assert!(!cpu.cpsr.thumb);
}

#[test]
fn swi_enters_supervisor_with_irqs_masked() {
    let mut emulator = make_emulator();
    write_fcram32(&mut emulator, 0x2000_0000, 0xEF00_0032); // swi 0x32

    let cpu = emulator.arm11(0);
    cpu.update_reg_mode(PsrMode::System);
    cpu.cpsr.mode = PsrMode::System;
    cpu.cpsr.irq_disable = false;
    cpu.jump(0x2000_0000, false);
    cpu.run(1).expect("run");

    assert_eq!(cpu.cpsr.mode, PsrMode::Supervisor);
    assert!(cpu.cpsr.irq_disable);
    // LR points back at the instruction after the SWI
    assert_eq!(cpu.gpr[REG_LR], 0x2000_0004);
    // vectored to the low exception base, PC one fetch ahead
    assert_eq!(cpu.gpr[REG_PC], 0x08 + 4);
}

#[test]
fn thumb_alu_and_hi_reg_ops() {
    let mut emulator = make_emulator();
    write_boot11_16(&mut emulator, 0x2000, 0x2005); // movs r0, #5
    write_boot11_16(&mut emulator, 0x2002, 0x3003); // adds r0, #3
    write_boot11_16(&mut emulator, 0x2004, 0x4641); // mov r1, r8
    write_boot11_16(&mut emulator, 0x2006, 0x1840); // adds r0, r0, r1

    let cpu = emulator.arm11(0);
    cpu.gpr[8] = 100;
    cpu.jump(0x2001, true);
    cpu.run(4).expect("run");

    assert_eq!(cpu.gpr[1], 100);
    assert_eq!(cpu.gpr[0], 108);
    assert!(!cpu.cpsr.negative);
}

#[test]
fn wfi_halts_until_interrupt_signal() {
    let mut emulator = make_emulator();
    write_fcram32(&mut emulator, 0x2000_0000, 0xE320_F003); // wfi

    let cpu = emulator.arm11(0);
    cpu.jump(0x2000_0000, false);
    cpu.run(4).expect("run");
    assert!(cpu.halted);

    cpu.set_int_signal(true);
    assert!(!cpu.halted);
}
