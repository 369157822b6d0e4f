use em3ds::memory::{Bus, ConsoleModel, CpuId, FastPage, PagePerms};
use em3ds::{Configuration, EmuError, Emulator};

fn make_emulator() -> Emulator {
    let mut boot9 = vec![0; 64 * 1024];
    let mut boot11 = vec![0; 64 * 1024];
    // recognizable content in the upper (lockable) halves
    for b in boot9[0x8000..].iter_mut() {
        *b = 0x99;
    }
    for b in boot11[0x8000..].iter_mut() {
        *b = 0xBB;
    }
    let config = Configuration {
        model: ConsoleModel::Old3ds,
        boot9,
        boot11,
        otp: Some(vec![0x5A; 256]),
    };
    Emulator::new(config).expect("emulator setup")
}

#[test]
fn protection_unit_rebuild_is_idempotent() {
    let mut emulator = make_emulator();
    let bus = emulator.bus.clone();

    let cpu = emulator.arm9();
    {
        let mut bus = bus.borrow_mut();
        // region 0: 128 MB from 0x00000000, region 1: 4 KB at 0x08000000
        cpu.cp15.mcr(6, 0, 0, 0x0000_0000 | (26 << 1) | 1, &mut bus);
        cpu.cp15.mcr(6, 1, 0, 0x0800_0000 | (11 << 1) | 1, &mut bus);
        cpu.cp15.mcr(5, 0, 2, 0x0000_0031, &mut bus); // data perms
        cpu.cp15.mcr(5, 0, 3, 0x0000_0021, &mut bus); // instr perms
    }

    let privileged = cpu.cp15.mmu.privileged.clone();
    let user = cpu.cp15.mmu.user.clone();

    {
        let mut bus = bus.borrow_mut();
        cpu.cp15.mcr(6, 0, 0, 0x0000_0000 | (26 << 1) | 1, &mut bus);
        cpu.cp15.mcr(6, 1, 0, 0x0800_0000 | (11 << 1) | 1, &mut bus);
        cpu.cp15.mcr(5, 0, 2, 0x0000_0031, &mut bus);
        cpu.cp15.mcr(5, 0, 3, 0x0000_0021, &mut bus);
    }

    assert_eq!(cpu.cp15.mmu.privileged, privileged);
    assert_eq!(cpu.cp15.mmu.user, user);
}

#[test]
fn protection_unit_higher_region_wins() {
    let mut emulator = make_emulator();
    let bus = emulator.bus.clone();
    let cpu = emulator.arm9();

    {
        let mut bus = bus.borrow_mut();
        // region 0: 64 KB rw at 0x08000000; region 7: 4 KB no-access carved
        // out of the middle
        cpu.cp15.mcr(6, 0, 0, 0x0800_0000 | (15 << 1) | 1, &mut bus);
        cpu.cp15.mcr(6, 7, 0, 0x0800_4000 | (11 << 1) | 1, &mut bus);
        cpu.cp15.mcr(5, 0, 2, 0x0000_0001, &mut bus); // region 0 data rw, region 7 none
        cpu.cp15.mcr(5, 0, 3, 0x0000_0001, &mut bus);
    }

    let page = |addr: u32| cpu.cp15.mmu.privileged[(addr >> 12) as usize];
    let perms_of = |page: FastPage| match page {
        FastPage::Ram { perms, .. } => perms,
        other => panic!("expected a RAM page, got {:?}", other),
    };
    assert!(perms_of(page(0x0800_0000)).contains(PagePerms::RW));
    // the carved-out page keeps region 7's (empty) permissions
    assert!(perms_of(page(0x0800_4000)).is_empty());
    assert!(perms_of(page(0x0800_5000)).contains(PagePerms::RW));
}

#[test]
fn mmu_section_walk_maps_fcram() {
    let mut emulator = make_emulator();
    let bus = emulator.bus.clone();

    {
        let mut bus = bus.borrow_mut();
        // L1 table at physical 0x20010000; entry 0 is a 1 MB section to the
        // start of FCRAM, AP = 3 (full access)
        let entry: u32 = 0x2000_0000 | (3 << 10) | 2;
        bus.fcram[0x10000..0x10004].copy_from_slice(&entry.to_le_bytes());
        bus.fcram[0..4].copy_from_slice(&0xCAFE_BABEu32.to_le_bytes());
    }

    let cpu = emulator.arm11(0);
    {
        let mut bus = bus.borrow_mut();
        cpu.cp15.mcr(2, 0, 1, 0x2001_0000, &mut bus); // translation table base 1
        cpu.cp15.mcr(1, 0, 0, 1, &mut bus); // enable
    }
    assert!(cpu.cp15.mmu_enabled);

    let value = cpu.read32(0).expect("translated read");
    assert_eq!(value, 0xCAFE_BABE);

    // writes land in FCRAM through the same mapping
    cpu.write32(4, 0x1122_3344).expect("translated write");
    let written = {
        let bus = bus.borrow();
        u32::from_le_bytes([bus.fcram[4], bus.fcram[5], bus.fcram[6], bus.fcram[7]])
    };
    assert_eq!(written, 0x1122_3344);
}

#[test]
fn pxi_words_arrive_in_fifo_order() {
    let mut emulator = make_emulator();
    let mut bus = emulator.bus.borrow_mut();
    let Bus { pxi, pmr, int9, .. } = &mut *bus;

    pxi.send_to_9(0x111, int9);
    pxi.send_to_9(0x222, int9);
    pxi.send_to_9(0x333, int9);

    let cnt = pxi.read_cnt9();
    assert_eq!(cnt & 0x100, 0); // receive FIFO not empty

    assert_eq!(pxi.read_msg9(pmr), 0x111);
    assert_eq!(pxi.read_msg9(pmr), 0x222);
    assert_eq!(pxi.read_msg9(pmr), 0x333);
    assert_eq!(pxi.read_cnt9() & 0x100, 0x100);
}

#[test]
fn pxi_clear_send_drops_pending_words() {
    let mut emulator = make_emulator();
    let mut bus = emulator.bus.borrow_mut();
    let Bus { pxi, pmr, int9, .. } = &mut *bus;

    pxi.send_to_9(0x111, int9);
    pxi.send_to_9(0x222, int9);
    // the ARM11 clears its own send FIFO
    pxi.write_cnt11(1 << 3, pmr);

    assert_eq!(pxi.read_cnt9() & 0x100, 0x100);
    // a drained FIFO replays the last value rather than blocking
    let stale = pxi.read_msg9(pmr);
    assert_eq!(stale, 0);
}

#[test]
fn pxi_sync_bytes_cross_sides() {
    let mut emulator = make_emulator();
    let mut bus = emulator.bus.borrow_mut();
    let Bus { pxi, pmr, int9, .. } = &mut *bus;

    pxi.write_sync9(0x47 << 8, pmr);
    assert_eq!(pxi.read_sync11() & 0xFF, 0x47);

    pxi.write_sync11(0x74 << 8, int9);
    assert_eq!(pxi.read_sync9() & 0xFF, 0x74);
}

#[test]
fn irq_priority_orders_acknowledge() {
    let mut emulator = make_emulator();
    let mut bus = emulator.bus.borrow_mut();
    let pmr = &mut bus.pmr;

    pmr.write32(0, 0x17E01000, 1); // distributor on
    pmr.write32(0, 0x17E00100, 1); // cpu interface on
    pmr.write32(0, 0x17E00104, 0xFF); // priority mask wide open
    pmr.write32(0, 0x17E01108, 0x3); // enable irqs 64 and 65
    pmr.write8(0, 0x17E01800 + 64, 1);
    pmr.write8(0, 0x17E01800 + 65, 1);
    pmr.write8(0, 0x17E01400 + 64, 0x20);
    pmr.write8(0, 0x17E01400 + 65, 0x10);

    pmr.assert_hw_irq(64);
    pmr.assert_hw_irq(65);
    assert!(pmr.int_signal(0));

    // 65 carries the lower priority value, so it comes out first; 64 waits
    // behind the running priority until end-of-interrupt
    assert_eq!(pmr.read_ack(0), 65);
    assert!(!pmr.int_signal(0));
    pmr.write_eoi(0, 65);
    assert_eq!(pmr.read_ack(0), 64);
    pmr.write_eoi(0, 64);
    assert!(!pmr.int_signal(0));
}

#[test]
fn irq_priority_ties_break_to_lower_id() {
    let mut emulator = make_emulator();
    let mut bus = emulator.bus.borrow_mut();
    let pmr = &mut bus.pmr;

    pmr.write32(0, 0x17E01000, 1);
    pmr.write32(0, 0x17E00100, 1);
    pmr.write32(0, 0x17E00104, 0xFF);
    pmr.write32(0, 0x17E01108, 0x3);
    pmr.write8(0, 0x17E01800 + 64, 1);
    pmr.write8(0, 0x17E01800 + 65, 1);

    pmr.assert_hw_irq(65);
    pmr.assert_hw_irq(64);
    assert_eq!(pmr.read_ack(0), 64);
}

#[test]
fn software_interrupts_carry_the_requester() {
    let mut emulator = make_emulator();
    let mut bus = emulator.bus.borrow_mut();
    let pmr = &mut bus.pmr;

    pmr.write32(0, 0x17E01000, 1);
    pmr.write32(1, 0x17E00100, 1);
    pmr.write32(1, 0x17E00104, 0xFF);
    pmr.write32(0, 0x17E01100, 1 << 5);

    // core 0 pokes interrupt 5 at core 1
    pmr.write32(0, 0x17E01F00, (1 << 17) | 5);
    assert!(pmr.int_signal(1));
    let ack = pmr.read_ack(1);
    assert_eq!(ack & 0x3FF, 5);
    assert_eq!((ack >> 10) & 0x7, 0);
}

#[test]
fn mcu_reboot_write_surfaces_as_reboot_error() {
    let mut emulator = make_emulator();
    let mut bus = emulator.bus.borrow_mut();

    // select device 0x4A on bus 1
    bus.i2c.write8(0x10144000, 0x4A);
    assert!(bus.i2c.write8(0x10144001, 0x82).is_some());
    {
        let Bus { i2c, pmr, .. } = &mut *bus;
        i2c.do_transfer(1, pmr).expect("device select");
    }
    // select register 0x20
    bus.i2c.write8(0x10144000, 0x20);
    assert!(bus.i2c.write8(0x10144001, 0x80).is_some());
    {
        let Bus { i2c, pmr, .. } = &mut *bus;
        i2c.do_transfer(1, pmr).expect("register select");
    }
    // write the reboot bit
    bus.i2c.write8(0x10144000, 0x04);
    assert!(bus.i2c.write8(0x10144001, 0x81).is_some());
    let result = {
        let Bus { i2c, pmr, .. } = &mut *bus;
        i2c.do_transfer(1, pmr)
    };
    assert!(matches!(result, Err(EmuError::Reboot)));
}

#[test]
fn mcu_clock_reads_back_in_bcd() {
    let mut emulator = make_emulator();
    let mut bus = emulator.bus.borrow_mut();
    bus.i2c.update_time();

    // walk the transaction machinery up to a time read
    bus.i2c.write8(0x10144000, 0x4A);
    bus.i2c.write8(0x10144001, 0x82);
    {
        let Bus { i2c, pmr, .. } = &mut *bus;
        i2c.do_transfer(1, pmr).expect("select");
    }
    bus.i2c.write8(0x10144000, 0x32); // hours register
    bus.i2c.write8(0x10144001, 0x80);
    {
        let Bus { i2c, pmr, .. } = &mut *bus;
        i2c.do_transfer(1, pmr).expect("register");
    }
    bus.i2c.write8(0x10144001, 0xA1); // read with stop
    {
        let Bus { i2c, pmr, .. } = &mut *bus;
        i2c.do_transfer(1, pmr).expect("read");
    }
    let hours = bus.i2c.read8(0x10144000);
    assert!(hours >> 4 <= 2);
    assert!(hours & 0xF <= 9);
}

#[test]
fn sysprot_swaps_in_locked_boot_rom() {
    let mut emulator = make_emulator();
    let mut bus = emulator.bus.borrow_mut();

    // upper halves visible before the lock
    assert_eq!(bus.phys_read32(CpuId::Arm9, 0xFFFF_8000), Some(0x9999_9999));
    bus.io_write8(CpuId::Arm9, 0x1000_0000, 0x3).expect("sysprot9");
    assert_eq!(bus.phys_read32(CpuId::Arm9, 0xFFFF_8000), Some(0));
    // lower half still intact
    assert_eq!(bus.phys_read32(CpuId::Arm9, 0xFFFF_0000), Some(0));

    // OTP reads all-ones once locked
    assert_eq!(bus.otp.read8(0x1001_2000), 0xFF);

    bus.io_write8(CpuId::Arm9, 0x1000_0001, 0x1).expect("sysprot11");
    assert_eq!(bus.phys_read32(CpuId::Arm11(0), 0x8000), Some(0));
    assert_eq!(bus.phys_read32(CpuId::Arm11(0), 0x18000), Some(0));
}

#[test]
fn hid_pad_reads_pressed_buttons_as_zero() {
    let mut emulator = make_emulator();
    emulator.set_pad((1 << 0) | (1 << 3)); // A and START held
    let bus = emulator.bus.borrow();
    assert_eq!(bus.hid.read(), 0xFFF & !0x9);
}

#[test]
fn boot_control_releases_a_parked_core() {
    let mut emulator = make_emulator();
    {
        let mut bus = emulator.bus.borrow_mut();
        bus.io_write32(CpuId::Arm11(0), 0x1014_0424, 0x2000_0000).expect("overlay");
        bus.io_write8(CpuId::Arm11(0), 0x1014_1311, 0x3).expect("boot ctrl");
        assert!(bus.cfg11.core_release[1]);
        assert_eq!(bus.io_read8(CpuId::Arm11(0), 0x1014_1311).unwrap(), 0x30);
    }
    assert!(emulator.arm11(1).halted);
}

#[test]
fn fast_map_mirrors_share_identity() {
    let emulator = make_emulator();
    let bus = emulator.bus.borrow();
    // the two boot11 mirrors alias the same backing page
    let first = bus.direct_map(CpuId::Arm11(0))[0x0];
    let mirror = bus.direct_map(CpuId::Arm11(0))[0x10];
    match (first, mirror) {
        (FastPage::Ram { region: r1, offset: o1, .. }, FastPage::Ram { region: r2, offset: o2, .. }) => {
            assert_eq!(r1, r2);
            assert_eq!(o1, o2);
        }
        other => panic!("boot mirrors not RAM-backed: {:?}", other),
    }
    assert_eq!(first.host_id(0x123), mirror.host_id(0x10123));
}
