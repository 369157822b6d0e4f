// Heterogeneous 3DS system emulation: an ARMv5 security core, up to four
// ARMv6K application cores, the Teak audio DSP and the fabric between them.
// The Emulator here owns every backing buffer and drives the whole machine
// one frame at a time; the components live in their own modules and borrow
// the bus.

use log::{info, warn};
use std::cell::RefCell;
use std::rc::Rc;
use termion::{color, style};
use thiserror::Error;

pub mod cp15;
pub mod devices;
pub mod i2c;
pub mod instructions;
pub mod interrupts;
pub mod memory;
pub mod mmu;
pub mod parser;
pub mod processor;
pub mod pxi;
pub mod scheduler;
pub mod teak;
pub mod teak_instructions;
pub mod teak_parser;
pub mod vfp;

use cp15::Cp15;
use memory::{Bus, BusPtr, ConsoleModel, CpuId, Region, KB, MB};
use processor::{ArmCpu, ExclusiveMonitor, MonitorPtr};
use scheduler::{ClockDomain, EventKind, Scheduler, ARM11_CLOCKRATE};
use vfp::Vfp;

// Guest faults unwind to the CPU run loop; Reboot unwinds all the way out
// here; Fatal stops the machine with a state dump.
#[derive(Debug, Error)]
pub enum EmuError {
    #[error("data abort at {vaddr:08x} (write: {is_write})")]
    DataAbort { vaddr: u32, is_write: bool },
    #[error("prefetch abort at {vaddr:08x}")]
    PrefetchAbort { vaddr: u32 },
    #[error("reboot requested")]
    Reboot,
    #[error("{0}")]
    Fatal(String),
}

impl EmuError {
    pub fn fatal(message: String) -> EmuError {
        EmuError::Fatal(message)
    }
}

pub struct Configuration {
    pub model: ConsoleModel,
    pub boot9: Vec<u8>,
    pub boot11: Vec<u8>,
    // OTP dump out of the NAND essentials partition
    pub otp: Option<Vec<u8>>,
}

const VBLANK_START_CYCLES: i64 = 4_000_000;
const VBLANK_END_CYCLES: i64 = 4_400_000;

pub struct Emulator {
    pub bus: BusPtr,
    scheduler: Scheduler,
    arm9: ArmCpu,
    arm11: Vec<ArmCpu>,
    monitor: MonitorPtr,
    frames: u64,
}

impl Emulator {
    pub fn new(config: Configuration) -> Result<Emulator, EmuError> {
        if config.boot9.len() < 64 * KB || config.boot11.len() < 64 * KB {
            return Err(EmuError::fatal("boot ROMs must be 64 KB".to_string()));
        }

        let mut bus = Bus::new(config.model);
        bus.load_boot_roms(&config.boot9, &config.boot11);
        if let Some(otp) = &config.otp {
            if otp.len() < 256 {
                return Err(EmuError::fatal("OTP dump must be 256 bytes".to_string()));
            }
            bus.otp.load(otp);
        }
        let core_count = bus.core_count();
        let bus: BusPtr = Rc::new(RefCell::new(bus));
        let monitor = ExclusiveMonitor::new();

        let arm9 = ArmCpu::new(
            CpuId::Arm9,
            Cp15::new(9, CpuId::Arm9),
            None,
            Rc::clone(&bus),
            Rc::clone(&monitor),
        );

        let mut arm11 = Vec::new();
        for core in 0..core_count {
            arm11.push(ArmCpu::new(
                CpuId::Arm11(core),
                Cp15::new(core as u32, CpuId::Arm11(core)),
                Some(Vfp::new()),
                Rc::clone(&bus),
                Rc::clone(&monitor),
            ));
        }

        let mut emulator = Emulator {
            bus,
            scheduler: Scheduler::new(),
            arm9,
            arm11,
            monitor,
            frames: 0,
        };
        emulator.reset(true);
        Ok(emulator)
    }

    pub fn reset(&mut self, cold: bool) {
        info!("[Emulator] {} reset", if cold { "cold" } else { "warm" });
        {
            let mut bus = self.bus.borrow_mut();
            let fcram_size = bus.fcram.len();
            let arm9_ram_size = bus.arm9_ram.len();
            let qtm_size = bus.qtm_ram.len();
            bus.reset(cold);

            // ARM9 physical layout
            bus.map_region(CpuId::Arm9, Region::Arm9Ram, 0x0800_0000, arm9_ram_size);
            bus.map_region(CpuId::Arm9, Region::Vram, 0x1800_0000, 6 * MB);
            bus.map_region(CpuId::Arm9, Region::DspRam, 0x1FF0_0000, 512 * KB);
            bus.map_region(CpuId::Arm9, Region::AxiRam, 0x1FF8_0000, 512 * KB);
            bus.map_region(CpuId::Arm9, Region::Fcram, 0x2000_0000, fcram_size);
            bus.map_region(CpuId::Arm9, Region::Boot9Free, 0xFFFF_0000, 64 * KB);
            bus.map_mmio(CpuId::Arm9, 0x1000_0000, 0x20_0000);

            // ARM11 physical layout; one map serves all cores
            bus.map_region(CpuId::Arm11(0), Region::Boot11Free, 0, 64 * KB);
            bus.map_region(CpuId::Arm11(0), Region::Boot11Free, 0x1_0000, 64 * KB);
            bus.map_region(CpuId::Arm11(0), Region::Vram, 0x1800_0000, 6 * MB);
            if qtm_size != 0 {
                bus.map_region(CpuId::Arm11(0), Region::QtmRam, 0x1F00_0000, qtm_size);
            }
            bus.map_region(CpuId::Arm11(0), Region::DspRam, 0x1FF0_0000, 512 * KB);
            bus.map_region(CpuId::Arm11(0), Region::AxiRam, 0x1FF8_0000, 512 * KB);
            bus.map_region(CpuId::Arm11(0), Region::Fcram, 0x2000_0000, fcram_size);
            bus.map_mmio(CpuId::Arm11(0), 0x1010_0000, 0x50_0000);
            bus.map_mmio(CpuId::Arm11(0), 0x17E0_0000, 0x1_1000);
        }

        {
            let mut monitor = self.monitor.borrow_mut();
            monitor.start = [0; 4];
            monitor.end = [0; 4];
        }

        {
            let bus = Rc::clone(&self.bus);
            let mut bus = bus.borrow_mut();
            self.arm9.cp15.reset(&mut bus);
            for cpu in self.arm11.iter_mut() {
                cpu.cp15.reset(&mut bus);
            }
        }

        // The MMUs must be initialized before the cores fetch their reset
        // vectors.
        self.arm9.reset();
        for (core, cpu) in self.arm11.iter_mut().enumerate() {
            cpu.reset();
            // Secondary cores sleep until the boot ROM releases them through
            // the boot-control register.
            if core != 0 {
                cpu.halted = true;
            }
        }

        self.scheduler.reset();
    }

    // One video frame of emulation. Reboot requests from the MCU surface
    // here and turn into a warm reset.
    pub fn run_frame(&mut self) -> Result<(), EmuError> {
        match self.frame_loop() {
            Err(EmuError::Reboot) => {
                info!("[Emulator] reboot requested");
                self.reset(false);
                Ok(())
            }
            other => other,
        }
    }

    fn frame_loop(&mut self) -> Result<(), EmuError> {
        self.bus.borrow_mut().i2c.update_time();

        self.scheduler.add_event(EventKind::VBlankStart, VBLANK_START_CYCLES, ClockDomain::Arm11, 0);
        self.scheduler.add_event(EventKind::VBlankEnd, VBLANK_END_CYCLES, ClockDomain::Arm11, 0);

        let mut frame_ended = false;
        while !frame_ended {
            self.scheduler.calculate_cycles_to_run();
            let cycles11 = self.scheduler.arm11_cycles_to_run();
            let cycles9 = self.scheduler.arm9_cycles_to_run();

            for core in 0..self.arm11.len() {
                self.sync_core(core);
                self.arm11[core].run(cycles11)?;
                self.broadcast_events(core);
            }

            let int9_signal = self.bus.borrow().int9.int_signal();
            self.arm9.set_int_signal(int9_signal);
            self.arm9.run(cycles9)?;

            self.bus.borrow_mut().run_teak(cycles9)?;

            self.drain_bus_events();
            for (kind, param) in self.scheduler.process_events() {
                self.dispatch_event(kind, param, &mut frame_ended)?;
            }
        }
        self.frames += 1;
        Ok(())
    }

    // Run-boundary synchronization: IRQ lines and boot-control releases
    // become visible to the core here.
    fn sync_core(&mut self, core: usize) {
        let (signal, release, overlay) = {
            let mut bus = self.bus.borrow_mut();
            let release = bus.cfg11.core_release[core];
            bus.cfg11.core_release[core] = false;
            (bus.pmr.int_signal(core), release, bus.cfg11.boot_overlay_addr)
        };
        if release {
            info!("[Emulator] releasing ARM11 core {} to {:08x}", core, overlay);
            self.arm11[core].unhalt();
            self.arm11[core].jump(overlay, true);
        }
        self.arm11[core].set_int_signal(signal);
    }

    fn broadcast_events(&mut self, from: usize) {
        if !self.arm11[from].pending_sev {
            return;
        }
        self.arm11[from].pending_sev = false;
        let from_id = CpuId::Arm11(from);
        for cpu in self.arm11.iter_mut() {
            cpu.send_event(from_id);
        }
    }

    fn drain_bus_events(&mut self) {
        let pending: Vec<_> = self.bus.borrow_mut().pending_events.drain(..).collect();
        for event in pending {
            self.scheduler.add_event(event.kind, event.cycles, event.domain, event.param);
        }
    }

    fn dispatch_event(&mut self, kind: EventKind, param: u64, frame_ended: &mut bool) -> Result<(), EmuError> {
        match kind {
            EventKind::VBlankStart => {
                self.bus.borrow_mut().pmr.assert_hw_irq(0x2A);
            }
            EventKind::VBlankEnd => {
                self.bus.borrow_mut().pmr.assert_hw_irq(0x2B);
                *frame_ended = true;
            }
            EventKind::I2cTransfer => {
                let mut bus = self.bus.borrow_mut();
                let memory::Bus { i2c, pmr, .. } = &mut *bus;
                i2c.do_transfer(param as usize, pmr)?;
            }
            EventKind::ClockChange => {
                let rate = match param & 0x7 {
                    0x1 => ARM11_CLOCKRATE,
                    0x3 => ARM11_CLOCKRATE * 2,
                    0x5 => ARM11_CLOCKRATE * 3,
                    other => {
                        return Err(EmuError::fatal(format!(
                            "invalid clock multiplier {:02x}",
                            other
                        )))
                    }
                };
                info!("[Emulator] ARM11 clockrate set to {}", rate);
                self.scheduler.set_arm11_clockrate(rate);
                self.bus.borrow_mut().pmr.assert_hw_irq(0x58);
            }
        }
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn set_pad(&mut self, pressed: u16) {
        self.bus.borrow_mut().hid.set_pad(pressed);
    }

    pub fn arm9(&mut self) -> &mut ArmCpu {
        &mut self.arm9
    }

    pub fn arm11(&mut self, core: usize) -> &mut ArmCpu {
        &mut self.arm11[core]
    }

    pub fn print_state(&self) {
        println!(
            "{}{}-- machine state --{}",
            style::Bold,
            color::Fg(color::Red),
            style::Reset
        );
        print!("{}", self.arm9);
        for cpu in self.arm11.iter() {
            print!("{}", cpu);
        }
        if let Err(e) = std::io::Write::flush(&mut std::io::stdout()) {
            warn!("state dump flush failed: {}", e);
        }
    }
}
