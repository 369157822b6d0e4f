// The ARM cores: banked register file, PSRs, exception entry, the
// fetch/dispatch loop and the flag-setting ALU helpers the instruction
// implementations lean on. One struct serves both the ARMv5 ARM9 and the
// ARMv6K ARM11 cores; the differences (alignment contract, MMU flavour,
// exclusive monitor, VFP) hang off the id.

use crate::cp15::Cp15;
use crate::memory::{BusPtr, CpuId, FastPage, PagePerms};
use crate::vfp::Vfp;
use crate::{instructions, EmuError};
use log::{debug, trace, warn};
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

pub const REG_SP: usize = 13;
pub const REG_LR: usize = 14;
pub const REG_PC: usize = 15;

fn page_allows(entry: FastPage, needed: PagePerms) -> bool {
    match entry {
        FastPage::Ram { perms, .. } => perms.contains(needed),
        FastPage::Mmio { perms, .. } => perms.contains(needed),
        FastPage::Unmapped => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsrMode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1B,
    System = 0x1F,
}

impl PsrMode {
    pub fn from_bits(bits: u32) -> PsrMode {
        match bits & 0x1F {
            0x10 => PsrMode::User,
            0x11 => PsrMode::Fiq,
            0x12 => PsrMode::Irq,
            0x13 => PsrMode::Supervisor,
            0x17 => PsrMode::Abort,
            0x1B => PsrMode::Undefined,
            0x1F => PsrMode::System,
            other => {
                warn!("unpredictable PSR mode {:02x}, treating as system", other);
                PsrMode::System
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Psr {
    pub mode: PsrMode,
    pub thumb: bool,
    pub fiq_disable: bool,
    pub irq_disable: bool,

    pub negative: bool,
    pub zero: bool,
    pub carry: bool,
    pub overflow: bool,
    pub q_overflow: bool,
    pub ge: [bool; 4],
}

impl Psr {
    pub fn new() -> Psr {
        Psr {
            mode: PsrMode::Supervisor,
            thumb: false,
            fiq_disable: false,
            irq_disable: false,
            negative: false,
            zero: false,
            carry: false,
            overflow: false,
            q_overflow: false,
            ge: [false; 4],
        }
    }

    pub fn get(&self) -> u32 {
        let mut reg = 0;
        reg |= (self.negative as u32) << 31;
        reg |= (self.zero as u32) << 30;
        reg |= (self.carry as u32) << 29;
        reg |= (self.overflow as u32) << 28;
        reg |= (self.q_overflow as u32) << 27;
        reg |= (self.irq_disable as u32) << 7;
        reg |= (self.fiq_disable as u32) << 6;
        reg |= (self.thumb as u32) << 5;
        reg |= self.mode as u32;
        reg
    }

    pub fn set(&mut self, value: u32) {
        self.negative = value & (1 << 31) != 0;
        self.zero = value & (1 << 30) != 0;
        self.carry = value & (1 << 29) != 0;
        self.overflow = value & (1 << 28) != 0;
        self.q_overflow = value & (1 << 27) != 0;
        self.irq_disable = value & (1 << 7) != 0;
        self.fiq_disable = value & (1 << 6) != 0;
        self.thumb = value & (1 << 5) != 0;
        self.mode = PsrMode::from_bits(value);
    }
}

// Load-linked/store-conditional reservations, physical-identity based and
// shared by all ARM11 cores. Single host thread, so a plain shared cell does.
pub struct ExclusiveMonitor {
    pub start: [u64; 4],
    pub end: [u64; 4],
}

pub type MonitorPtr = Rc<RefCell<ExclusiveMonitor>>;

impl ExclusiveMonitor {
    pub fn new() -> MonitorPtr {
        Rc::new(RefCell::new(ExclusiveMonitor { start: [0; 4], end: [0; 4] }))
    }
}

pub struct ArmCpu {
    pub id: CpuId,
    pub gpr: [u32; 16],
    pub cpsr: Psr,
    pub spsr: [Psr; 32],

    fiq_regs: [u32; 5],
    sp_irq: u32,
    sp_svc: u32,
    sp_fiq: u32,
    sp_abt: u32,
    sp_und: u32,
    lr_irq: u32,
    lr_svc: u32,
    lr_fiq: u32,
    lr_abt: u32,
    lr_und: u32,

    pub cp15: Cp15,
    pub vfp: Option<Vfp>,
    pub bus: BusPtr,
    pub monitor: MonitorPtr,

    pub halted: bool,
    waiting_for_event: bool,
    event_pending: bool,
    int_pending: bool,
    pub pending_sev: bool,

    local_exclusive_start: u64,
    local_exclusive_end: u64,
}

impl ArmCpu {
    pub fn new(id: CpuId, cp15: Cp15, vfp: Option<Vfp>, bus: BusPtr, monitor: MonitorPtr) -> Self {
        ArmCpu {
            id,
            gpr: [0; 16],
            cpsr: Psr::new(),
            spsr: [Psr::new(); 32],
            fiq_regs: [0; 5],
            sp_irq: 0,
            sp_svc: 0,
            sp_fiq: 0,
            sp_abt: 0,
            sp_und: 0,
            lr_irq: 0,
            lr_svc: 0,
            lr_fiq: 0,
            lr_abt: 0,
            lr_und: 0,
            cp15,
            vfp,
            bus,
            monitor,
            halted: false,
            waiting_for_event: false,
            event_pending: false,
            int_pending: false,
            pending_sev: false,
            local_exclusive_start: 0,
            local_exclusive_end: 0,
        }
    }

    pub fn reset(&mut self) {
        self.gpr = [0; 16];
        self.cpsr = Psr::new();
        self.cpsr.mode = PsrMode::Supervisor;
        self.cpsr.fiq_disable = true;
        self.cpsr.irq_disable = true;

        self.halted = false;
        self.waiting_for_event = false;
        self.event_pending = false;
        self.int_pending = false;
        self.pending_sev = false;
        self.local_exclusive_start = 0;
        self.local_exclusive_end = 0;

        if self.id == CpuId::Arm9 {
            self.jump(0xFFFF_0000, true);
        } else {
            self.jump(0, true);
        }
    }

    // ---- run loop ----

    pub fn run(&mut self, cycles: i64) -> Result<(), EmuError> {
        if !self.halted {
            match self.run_slice(cycles) {
                Ok(()) => {}
                Err(EmuError::DataAbort { vaddr, is_write }) => self.data_abort(vaddr, is_write)?,
                Err(EmuError::PrefetchAbort { vaddr }) => self.prefetch_abort(vaddr)?,
                Err(e) => return Err(e),
            }
        }
        if self.int_pending {
            self.int_check();
        }
        Ok(())
    }

    fn run_slice(&mut self, cycles: i64) -> Result<(), EmuError> {
        let mut left = cycles;
        while !self.halted && left > 0 {
            if self.cpsr.thumb {
                let instr = self.fetch16(self.gpr[REG_PC].wrapping_sub(2))?;
                self.gpr[REG_PC] = self.gpr[REG_PC].wrapping_add(2);
                instructions::execute_thumb(self, instr)?;
            } else {
                let instr = self.fetch32(self.gpr[REG_PC].wrapping_sub(4))?;
                self.gpr[REG_PC] = self.gpr[REG_PC].wrapping_add(4);
                instructions::execute_arm(self, instr)?;
            }
            left -= 1;
        }
        Ok(())
    }

    // ---- memory ----

    fn page_lookup(&self, vaddr: u32) -> FastPage {
        let idx = (vaddr >> 12) as usize;
        if !self.cp15.mmu_enabled {
            self.bus.borrow().direct_map(self.id)[idx]
        } else if self.cpsr.mode == PsrMode::User {
            self.cp15.mmu.user[idx]
        } else {
            self.cp15.mmu.privileged[idx]
        }
    }

    fn data_page(&mut self, vaddr: u32, write: bool) -> Result<FastPage, EmuError> {
        let needed = if write { PagePerms::W } else { PagePerms::R };
        let entry = self.page_lookup(vaddr);
        if page_allows(entry, needed) {
            return Ok(entry);
        }
        // Not in the map yet - walk the tables again and retry once.
        if self.cp15.mmu_enabled && self.id != CpuId::Arm9 {
            let bus = self.bus.clone();
            self.cp15.mmu.reload_tlb(&bus.borrow());
            let entry = self.page_lookup(vaddr);
            if page_allows(entry, needed) {
                return Ok(entry);
            }
        }
        Err(EmuError::DataAbort { vaddr, is_write: write })
    }

    fn fetch_page(&mut self, vaddr: u32) -> Result<FastPage, EmuError> {
        let entry = self.page_lookup(vaddr);
        if page_allows(entry, PagePerms::X) {
            return Ok(entry);
        }
        if self.cp15.mmu_enabled && self.id != CpuId::Arm9 {
            let bus = self.bus.clone();
            self.cp15.mmu.reload_tlb(&bus.borrow());
            let entry = self.page_lookup(vaddr);
            if page_allows(entry, PagePerms::X) {
                return Ok(entry);
            }
        }
        Err(EmuError::PrefetchAbort { vaddr })
    }

    fn fetch16(&mut self, addr: u32) -> Result<u16, EmuError> {
        match self.fetch_page(addr)? {
            FastPage::Ram { region, offset, .. } => Ok(self.bus.borrow().ram_read16(region, offset, addr)),
            _ => Err(EmuError::fatal(format!("[{}] PC points to MMIO {:08x}", self.id, addr))),
        }
    }

    fn fetch32(&mut self, addr: u32) -> Result<u32, EmuError> {
        match self.fetch_page(addr)? {
            FastPage::Ram { region, offset, .. } => Ok(self.bus.borrow().ram_read32(region, offset, addr)),
            _ => Err(EmuError::fatal(format!("[{}] PC points to MMIO {:08x}", self.id, addr))),
        }
    }

    pub fn read8(&mut self, addr: u32) -> Result<u8, EmuError> {
        match self.data_page(addr, false)? {
            FastPage::Ram { region, offset, .. } => Ok(self.bus.borrow().ram_read8(region, offset, addr)),
            FastPage::Mmio { paddr, .. } => {
                let paddr = (paddr & !0xFFF) + (addr & 0xFFF);
                self.bus.borrow_mut().io_read8(self.id, paddr)
            }
            FastPage::Unmapped => Err(EmuError::DataAbort { vaddr: addr, is_write: false }),
        }
    }

    pub fn read16(&mut self, addr: u32) -> Result<u16, EmuError> {
        if self.id == CpuId::Arm9 && addr & 0x1 != 0 {
            return Err(EmuError::fatal(format!("[ARM9] unaligned read16 {:08x}", addr)));
        }
        if addr & 0xFFF > 0xFFE {
            return Err(EmuError::fatal(format!("[{}] read16 across page boundary {:08x}", self.id, addr)));
        }
        match self.data_page(addr, false)? {
            FastPage::Ram { region, offset, .. } => Ok(self.bus.borrow().ram_read16(region, offset, addr)),
            FastPage::Mmio { paddr, .. } => {
                let paddr = (paddr & !0xFFF) + (addr & 0xFFF);
                self.bus.borrow_mut().io_read16(self.id, paddr)
            }
            FastPage::Unmapped => Err(EmuError::DataAbort { vaddr: addr, is_write: false }),
        }
    }

    pub fn read32(&mut self, addr: u32) -> Result<u32, EmuError> {
        if self.id == CpuId::Arm9 && addr & 0x3 != 0 {
            return Err(EmuError::fatal(format!("[ARM9] unaligned read32 {:08x}", addr)));
        }
        if addr & 0xFFF > 0xFFC {
            return Err(EmuError::fatal(format!("[{}] read32 across page boundary {:08x}", self.id, addr)));
        }
        match self.data_page(addr, false)? {
            FastPage::Ram { region, offset, .. } => Ok(self.bus.borrow().ram_read32(region, offset, addr)),
            FastPage::Mmio { paddr, .. } => {
                let paddr = (paddr & !0xFFF) + (addr & 0xFFF);
                self.bus.borrow_mut().io_read32(self.id, paddr)
            }
            FastPage::Unmapped => Err(EmuError::DataAbort { vaddr: addr, is_write: false }),
        }
    }

    pub fn read64(&mut self, addr: u32) -> Result<u64, EmuError> {
        let lo = self.read32(addr)? as u64;
        let hi = self.read32(addr.wrapping_add(4))? as u64;
        Ok((hi << 32) | lo)
    }

    pub fn write8(&mut self, addr: u32, value: u8) -> Result<(), EmuError> {
        self.clear_global_exclusives(addr);
        match self.data_page(addr, true)? {
            FastPage::Ram { region, offset, .. } => {
                self.bus.borrow_mut().ram_write8(region, offset, addr, value);
                Ok(())
            }
            FastPage::Mmio { paddr, .. } => {
                let paddr = (paddr & !0xFFF) + (addr & 0xFFF);
                self.bus.borrow_mut().io_write8(self.id, paddr, value)
            }
            FastPage::Unmapped => Err(EmuError::DataAbort { vaddr: addr, is_write: true }),
        }
    }

    pub fn write16(&mut self, addr: u32, value: u16) -> Result<(), EmuError> {
        if self.id == CpuId::Arm9 && addr & 0x1 != 0 {
            return Err(EmuError::fatal(format!("[ARM9] unaligned write16 {:08x}: {:04x}", addr, value)));
        }
        if addr & 0xFFF > 0xFFE {
            return Err(EmuError::fatal(format!("[{}] write16 across page boundary {:08x}", self.id, addr)));
        }
        self.clear_global_exclusives(addr);
        match self.data_page(addr, true)? {
            FastPage::Ram { region, offset, .. } => {
                self.bus.borrow_mut().ram_write16(region, offset, addr, value);
                Ok(())
            }
            FastPage::Mmio { paddr, .. } => {
                let paddr = (paddr & !0xFFF) + (addr & 0xFFF);
                self.bus.borrow_mut().io_write16(self.id, paddr, value)
            }
            FastPage::Unmapped => Err(EmuError::DataAbort { vaddr: addr, is_write: true }),
        }
    }

    pub fn write32(&mut self, addr: u32, value: u32) -> Result<(), EmuError> {
        if self.id == CpuId::Arm9 && addr & 0x3 != 0 {
            return Err(EmuError::fatal(format!("[ARM9] unaligned write32 {:08x}: {:08x}", addr, value)));
        }
        if addr & 0xFFF > 0xFFC {
            return Err(EmuError::fatal(format!("[{}] write32 across page boundary {:08x}", self.id, addr)));
        }
        self.clear_global_exclusives(addr);
        match self.data_page(addr, true)? {
            FastPage::Ram { region, offset, .. } => {
                self.bus.borrow_mut().ram_write32(region, offset, addr, value);
                Ok(())
            }
            FastPage::Mmio { paddr, .. } => {
                let paddr = (paddr & !0xFFF) + (addr & 0xFFF);
                self.bus.borrow_mut().io_write32(self.id, paddr, value)
            }
            FastPage::Unmapped => Err(EmuError::DataAbort { vaddr: addr, is_write: true }),
        }
    }

    pub fn write64(&mut self, addr: u32, value: u64) -> Result<(), EmuError> {
        self.write32(addr, value as u32)?;
        self.write32(addr.wrapping_add(4), (value >> 32) as u32)
    }

    // ---- exclusive monitor ----

    fn host_id(&self, vaddr: u32) -> u64 {
        let entry = self.page_lookup(vaddr);
        if entry.present() {
            entry.host_id(vaddr)
        } else {
            vaddr as u64
        }
    }

    pub fn set_exclusive(&mut self, vaddr: u32, size: u32) {
        let id = self.host_id(vaddr);
        self.local_exclusive_start = id;
        self.local_exclusive_end = id + size as u64;
        if let CpuId::Arm11(core) = self.id {
            let mut monitor = self.monitor.borrow_mut();
            monitor.start[core] = id;
            monitor.end[core] = id + size as u64;
        }
    }

    pub fn has_exclusive(&self, vaddr: u32) -> bool {
        let id = self.host_id(vaddr);
        if id < self.local_exclusive_start || id > self.local_exclusive_end {
            return false;
        }
        if let CpuId::Arm11(core) = self.id {
            let monitor = self.monitor.borrow();
            if id < monitor.start[core] || id > monitor.end[core] {
                return false;
            }
        }
        true
    }

    pub fn clear_exclusive(&mut self) {
        self.local_exclusive_start = 0;
        self.local_exclusive_end = 0;
        if let CpuId::Arm11(core) = self.id {
            let mut monitor = self.monitor.borrow_mut();
            monitor.start[core] = 0;
            monitor.end[core] = 0;
        }
    }

    // Any ordinary store knocks out every reservation covering the address.
    fn clear_global_exclusives(&mut self, vaddr: u32) {
        let id = self.host_id(vaddr);
        let mut monitor = self.monitor.borrow_mut();
        for core in 0..4 {
            if monitor.start[core] <= id && id < monitor.end[core] {
                monitor.start[core] = 0;
                monitor.end[core] = 0;
            }
        }
    }

    // ---- branching and mode changes ----

    pub fn jump(&mut self, addr: u32, change_thumb_state: bool) {
        self.gpr[REG_PC] = addr;
        if change_thumb_state {
            self.cpsr.thumb = addr & 0x1 != 0;
        }
        if self.cpsr.thumb {
            self.gpr[REG_PC] &= !0x1;
            self.gpr[REG_PC] = self.gpr[REG_PC].wrapping_add(2);
        } else {
            self.gpr[REG_PC] &= !0x3;
            self.gpr[REG_PC] = self.gpr[REG_PC].wrapping_add(4);
        }
    }

    pub fn update_reg_mode(&mut self, mode: PsrMode) {
        if mode == self.cpsr.mode {
            return;
        }
        self.bank_swap(self.cpsr.mode);
        self.bank_swap(mode);
    }

    fn bank_swap(&mut self, mode: PsrMode) {
        match mode {
            PsrMode::User | PsrMode::System => {}
            PsrMode::Irq => {
                mem::swap(&mut self.gpr[13], &mut self.sp_irq);
                mem::swap(&mut self.gpr[14], &mut self.lr_irq);
            }
            PsrMode::Fiq => {
                for i in 0..5 {
                    mem::swap(&mut self.gpr[8 + i], &mut self.fiq_regs[i]);
                }
                mem::swap(&mut self.gpr[13], &mut self.sp_fiq);
                mem::swap(&mut self.gpr[14], &mut self.lr_fiq);
            }
            PsrMode::Supervisor => {
                mem::swap(&mut self.gpr[13], &mut self.sp_svc);
                mem::swap(&mut self.gpr[14], &mut self.lr_svc);
            }
            PsrMode::Abort => {
                mem::swap(&mut self.gpr[13], &mut self.sp_abt);
                mem::swap(&mut self.gpr[14], &mut self.lr_abt);
            }
            PsrMode::Undefined => {
                mem::swap(&mut self.gpr[13], &mut self.sp_und);
                mem::swap(&mut self.gpr[14], &mut self.lr_und);
            }
        }
    }

    pub fn spsr_to_cpsr(&mut self) {
        let new_cpsr = self.spsr[self.cpsr.mode as usize].get();
        self.update_reg_mode(PsrMode::from_bits(new_cpsr));
        self.cpsr.set(new_cpsr);
    }

    fn vector_base(&self) -> u32 {
        if self.cp15.high_vectors {
            0xFFFF_0000
        } else {
            0
        }
    }

    // ---- exceptions ----

    pub fn data_abort(&mut self, vaddr: u32, is_write: bool) -> Result<(), EmuError> {
        if self.id == CpuId::Arm9 {
            return Err(EmuError::fatal(format!("[ARM9] data abort at {:08x}", vaddr)));
        }
        debug!("[{}] data abort at {:08x}", self.id, vaddr);

        self.cp15.set_data_abort_regs(vaddr, is_write);

        let value = self.cpsr.get();
        self.spsr[PsrMode::Abort as usize].set(value);
        self.lr_abt = self.gpr[REG_PC];

        self.update_reg_mode(PsrMode::Abort);
        self.cpsr.mode = PsrMode::Abort;
        self.cpsr.irq_disable = true;

        let base = self.vector_base();
        self.jump(base + 0x10, true);
        Ok(())
    }

    pub fn prefetch_abort(&mut self, vaddr: u32) -> Result<(), EmuError> {
        if self.id == CpuId::Arm9 {
            return Err(EmuError::fatal(format!("[ARM9] prefetch abort at {:08x}", vaddr)));
        }
        debug!("[{}] prefetch abort at {:08x}", self.id, vaddr);

        self.cp15.set_prefetch_abort_regs(vaddr);

        let value = self.cpsr.get();
        self.spsr[PsrMode::Abort as usize].set(value);
        self.lr_abt = vaddr.wrapping_add(if self.cpsr.thumb { 2 } else { 4 });

        self.update_reg_mode(PsrMode::Abort);
        self.cpsr.mode = PsrMode::Abort;
        self.cpsr.irq_disable = true;

        let base = self.vector_base();
        self.jump(base + 0x0C, true);
        Ok(())
    }

    pub fn swi(&mut self) {
        trace!("[{}] swi", self.id);
        let value = self.cpsr.get();
        self.spsr[PsrMode::Supervisor as usize].set(value);

        self.lr_svc = self.gpr[REG_PC].wrapping_sub(if self.cpsr.thumb { 2 } else { 4 });

        self.update_reg_mode(PsrMode::Supervisor);
        self.cpsr.mode = PsrMode::Supervisor;
        self.cpsr.irq_disable = true;

        let base = self.vector_base();
        self.jump(base + 0x08, true);
    }

    pub fn und(&mut self) {
        let value = self.cpsr.get();
        self.spsr[PsrMode::Undefined as usize].set(value);

        self.lr_und = self.gpr[REG_PC].wrapping_sub(4);
        self.update_reg_mode(PsrMode::Undefined);
        self.cpsr.mode = PsrMode::Undefined;
        self.cpsr.irq_disable = true;

        let base = self.vector_base();
        self.jump(base + 0x04, true);
    }

    pub fn int_check(&mut self) {
        if !self.cpsr.irq_disable {
            trace!("[{}] interrupt taken", self.id);
            let value = self.cpsr.get();
            self.spsr[PsrMode::Irq as usize].set(value);

            self.lr_irq = self.gpr[REG_PC].wrapping_add(if self.cpsr.thumb { 2 } else { 0 });
            self.update_reg_mode(PsrMode::Irq);
            self.cpsr.mode = PsrMode::Irq;
            self.cpsr.irq_disable = true;

            let base = self.vector_base();
            self.jump(base + 0x18, true);
        }
    }

    pub fn set_int_signal(&mut self, pending: bool) {
        if !self.int_pending && pending {
            self.unhalt();
            self.int_check();
        }
        self.int_pending = pending;
    }

    pub fn halt(&mut self) {
        if !self.int_pending {
            self.halted = true;
        }
    }

    pub fn unhalt(&mut self) {
        self.halted = false;
    }

    pub fn wfe(&mut self) {
        if !self.event_pending {
            self.waiting_for_event = true;
            self.halted = true;
        } else {
            self.event_pending = false;
        }
    }

    pub fn sev(&mut self) {
        // Broadcast happens at the run boundary; the orchestrator fans it
        // out to the other cores.
        self.pending_sev = true;
    }

    pub fn send_event(&mut self, from: CpuId) {
        if self.id == from {
            return;
        }
        if self.waiting_for_event {
            self.halted = false;
            self.waiting_for_event = false;
        } else {
            self.event_pending = true;
        }
    }

    // ---- coprocessor interface ----

    pub fn mrc(&mut self, cp_num: u32, _opc1: u32, crn: u32, crm: u32, opc2: u32) -> u32 {
        match cp_num {
            15 => self.cp15.mrc(crn, crm, opc2),
            _ => 0,
        }
    }

    pub fn mcr(&mut self, cp_num: u32, _opc1: u32, crn: u32, crm: u32, opc2: u32, value: u32) {
        if cp_num == 15 {
            let bus = self.bus.clone();
            self.cp15.mcr(crn, crm, opc2, value, &mut bus.borrow_mut());
            if self.cp15.halt_requested {
                self.cp15.halt_requested = false;
                self.halt();
            }
        }
    }

    // ---- condition codes ----

    pub fn meets_condition(&self, cond: u32) -> bool {
        match cond {
            0x0 => self.cpsr.zero,
            0x1 => !self.cpsr.zero,
            0x2 => self.cpsr.carry,
            0x3 => !self.cpsr.carry,
            0x4 => self.cpsr.negative,
            0x5 => !self.cpsr.negative,
            0x6 => self.cpsr.overflow,
            0x7 => !self.cpsr.overflow,
            0x8 => self.cpsr.carry && !self.cpsr.zero,
            0x9 => !self.cpsr.carry || self.cpsr.zero,
            0xA => self.cpsr.negative == self.cpsr.overflow,
            0xB => self.cpsr.negative != self.cpsr.overflow,
            0xC => !self.cpsr.zero && (self.cpsr.negative == self.cpsr.overflow),
            0xD => self.cpsr.zero || (self.cpsr.negative != self.cpsr.overflow),
            // A few encodings carry the reserved condition; let them pass.
            _ => true,
        }
    }

    // ---- flag helpers and ALU ----

    pub fn set_zero_neg_flags(&mut self, value: u32) {
        self.cpsr.negative = value & (1 << 31) != 0;
        self.cpsr.zero = value == 0;
    }

    fn set_cv_add_flags(&mut self, a: u32, b: u32, result: u32) {
        self.cpsr.carry = (0xFFFF_FFFF - a) < b;
        self.cpsr.overflow = add_overflow(a, b, result);
    }

    fn set_cv_sub_flags(&mut self, a: u32, b: u32, result: u32) {
        self.cpsr.carry = a >= b;
        self.cpsr.overflow = sub_overflow(a, b, result);
    }

    pub fn andd(&mut self, destination: usize, source: u32, operand: u32, set_flags: bool) {
        let result = source & operand;
        self.gpr[destination] = result;
        if set_flags {
            self.set_zero_neg_flags(result);
        }
    }

    pub fn orr(&mut self, destination: usize, source: u32, operand: u32, set_flags: bool) {
        let result = source | operand;
        self.gpr[destination] = result;
        if set_flags {
            self.set_zero_neg_flags(result);
        }
    }

    pub fn eor(&mut self, destination: usize, source: u32, operand: u32, set_flags: bool) {
        let result = source ^ operand;
        self.gpr[destination] = result;
        if set_flags {
            self.set_zero_neg_flags(result);
        }
    }

    pub fn add(&mut self, destination: usize, source: u32, operand: u32, set_flags: bool) -> Result<(), EmuError> {
        let result = source.wrapping_add(operand);
        if destination == REG_PC {
            if set_flags {
                return Err(EmuError::fatal("adds pc, operand unsupported".to_string()));
            }
            self.jump(result, true);
        } else {
            self.gpr[destination] = result;
            if set_flags {
                self.cmn(source, operand);
            }
        }
        Ok(())
    }

    pub fn sub(&mut self, destination: usize, source: u32, operand: u32, set_flags: bool) {
        let result = source.wrapping_sub(operand);
        if destination == REG_PC {
            if set_flags {
                let index = self.cpsr.mode as usize;
                let spsr = self.spsr[index];
                self.update_reg_mode(spsr.mode);
                self.cpsr = spsr;
                self.jump(result, false);
            } else {
                self.jump(result, true);
            }
        } else {
            self.gpr[destination] = result;
            if set_flags {
                self.cmp(source, operand);
            }
        }
    }

    pub fn adc(&mut self, destination: usize, source: u32, operand: u32, set_flags: bool) -> Result<(), EmuError> {
        let carry = self.cpsr.carry as u32;
        self.add(destination, source.wrapping_add(carry), operand, set_flags)?;
        if set_flags {
            let temp = source.wrapping_add(operand);
            let res = temp.wrapping_add(carry);
            self.cpsr.carry = ((0xFFFF_FFFF - source) < operand) | ((0xFFFF_FFFF - temp) < carry);
            self.cpsr.overflow = add_overflow(source, operand, temp) | add_overflow(temp, carry, res);
        }
        Ok(())
    }

    pub fn sbc(&mut self, destination: usize, source: u32, operand: u32, set_flags: bool) {
        let borrow = !self.cpsr.carry as u32;
        self.sub(destination, source, operand.wrapping_add(borrow), set_flags);
        if set_flags {
            let temp = source.wrapping_sub(operand);
            let res = temp.wrapping_sub(borrow);
            self.cpsr.carry = (source >= operand) & (temp >= borrow);
            self.cpsr.overflow = sub_overflow(source, operand, temp) | sub_overflow(temp, borrow, res);
        }
    }

    pub fn tst(&mut self, x: u32, y: u32) {
        self.set_zero_neg_flags(x & y);
    }

    pub fn teq(&mut self, x: u32, y: u32) {
        self.set_zero_neg_flags(x ^ y);
    }

    pub fn cmn(&mut self, x: u32, y: u32) {
        let result = x.wrapping_add(y);
        self.set_zero_neg_flags(result);
        self.set_cv_add_flags(x, y, result);
    }

    pub fn cmp(&mut self, x: u32, y: u32) {
        let result = x.wrapping_sub(y);
        self.set_zero_neg_flags(result);
        self.set_cv_sub_flags(x, y, result);
    }

    pub fn mov(&mut self, destination: usize, operand: u32, set_flags: bool) {
        if destination == REG_PC {
            if set_flags {
                let index = self.cpsr.mode as usize;
                let spsr = self.spsr[index];
                self.update_reg_mode(spsr.mode);
                self.cpsr = spsr;
                self.jump(operand, false);
            } else {
                self.jump(operand, true);
            }
        } else {
            self.gpr[destination] = operand;
            if set_flags {
                self.set_zero_neg_flags(operand);
            }
        }
    }

    pub fn mul(&mut self, destination: usize, source: u32, operand: u32, set_flags: bool) {
        let result = source.wrapping_mul(operand);
        self.gpr[destination] = result;
        if set_flags {
            self.set_zero_neg_flags(result);
        }
    }

    pub fn bic(&mut self, destination: usize, source: u32, operand: u32, set_flags: bool) {
        let result = source & !operand;
        self.gpr[destination] = result;
        if set_flags {
            self.set_zero_neg_flags(result);
        }
    }

    pub fn mvn(&mut self, destination: usize, operand: u32, set_flags: bool) {
        self.gpr[destination] = !operand;
        if set_flags {
            self.set_zero_neg_flags(!operand);
        }
    }

    // ---- barrel shifter ----

    pub fn lsl(&mut self, value: u32, shift: u32, alter_flags: bool) -> u32 {
        if shift == 0 {
            if alter_flags {
                self.set_zero_neg_flags(value);
            }
            return value;
        }
        if shift > 32 {
            if alter_flags {
                self.set_zero_neg_flags(0);
                self.cpsr.carry = false;
            }
            return 0;
        }
        if shift > 31 {
            if alter_flags {
                self.set_zero_neg_flags(0);
                self.cpsr.carry = value & 0x1 != 0;
            }
            return 0;
        }
        let result = value << shift;
        if alter_flags {
            self.set_zero_neg_flags(result);
            self.cpsr.carry = value & (1 << (32 - shift)) != 0;
        }
        result
    }

    pub fn lsr(&mut self, value: u32, shift: u32, alter_flags: bool) -> u32 {
        if shift > 32 {
            if alter_flags {
                self.set_zero_neg_flags(0);
                self.cpsr.carry = false;
            }
            return 0;
        }
        if shift > 31 {
            return self.lsr_32(value, alter_flags);
        }
        let result = if shift == 0 { value } else { value >> shift };
        if alter_flags {
            self.set_zero_neg_flags(result);
            if shift != 0 {
                self.cpsr.carry = value & (1 << (shift - 1)) != 0;
            }
        }
        result
    }

    pub fn lsr_32(&mut self, value: u32, alter_flags: bool) -> u32 {
        if alter_flags {
            self.set_zero_neg_flags(0);
            self.cpsr.carry = value & (1 << 31) != 0;
        }
        0
    }

    pub fn asr(&mut self, value: u32, shift: u32, alter_flags: bool) -> u32 {
        if shift > 31 {
            return self.asr_32(value, alter_flags);
        }
        let result = ((value as i32) >> shift) as u32;
        if alter_flags {
            self.set_zero_neg_flags(result);
            if shift != 0 {
                self.cpsr.carry = value & (1 << (shift - 1)) != 0;
            }
        }
        result
    }

    pub fn asr_32(&mut self, value: u32, alter_flags: bool) -> u32 {
        let result = ((value as i32) >> 31) as u32;
        if alter_flags {
            self.set_zero_neg_flags(result);
            self.cpsr.carry = value & (1 << 31) != 0;
        }
        result
    }

    pub fn rrx(&mut self, value: u32, alter_flags: bool) -> u32 {
        let mut result = value >> 1;
        if self.cpsr.carry {
            result |= 1 << 31;
        }
        if alter_flags {
            self.set_zero_neg_flags(result);
            self.cpsr.carry = value & 0x1 != 0;
        }
        result
    }

    pub fn rotr32(&mut self, value: u32, amount: u32, alter_flags: bool) -> u32 {
        if alter_flags && amount != 0 {
            if amount & 0x1F != 0 {
                self.cpsr.carry = value & (1 << ((amount - 1) & 0x1F)) != 0;
            } else {
                self.cpsr.carry = value & (1 << 31) != 0;
            }
        }
        let result = value.rotate_right(amount & 0x1F);
        if alter_flags {
            self.set_zero_neg_flags(result);
        }
        result
    }

    // ---- status-register instructions ----

    pub fn mrs(&mut self, instr: u32) {
        let using_cpsr = instr & (1 << 22) == 0;
        let destination = ((instr >> 12) & 0xF) as usize;

        if using_cpsr {
            self.gpr[destination] = self.cpsr.get();
        } else {
            self.gpr[destination] = self.spsr[self.cpsr.mode as usize].get();
        }
    }

    pub fn msr(&mut self, instr: u32) {
        let is_imm = instr & (1 << 25) != 0;
        let using_cpsr = instr & (1 << 22) == 0;

        let source = if is_imm {
            let imm = instr & 0xFF;
            let shift = (instr & 0xF00) >> 7;
            self.rotr32(imm, shift, false)
        } else {
            self.gpr[(instr & 0xF) as usize]
        };

        let mut bitmask = 0u32;
        if instr & (1 << 19) != 0 {
            bitmask |= 0xFF00_0000;
        }
        if instr & (1 << 16) != 0 {
            bitmask |= 0xFF;
        }
        if self.cpsr.mode == PsrMode::User {
            bitmask &= 0xFFFF_FF00; // user mode cannot touch the control field
        }
        if using_cpsr {
            bitmask &= 0xFFFF_FFDF; // the T bit is immune to MSR
        }

        let old = if using_cpsr {
            self.cpsr.get()
        } else {
            self.spsr[self.cpsr.mode as usize].get()
        };
        let value = (old & !bitmask) | (source & bitmask);

        if using_cpsr {
            let new_mode = PsrMode::from_bits(value);
            self.update_reg_mode(new_mode);
            self.cpsr.set(value);
        } else {
            self.spsr[self.cpsr.mode as usize].set(value);
        }
    }

    pub fn cps(&mut self, instr: u32) {
        if self.cpsr.mode == PsrMode::User {
            return;
        }
        let mode = PsrMode::from_bits(instr);
        let f = instr & (1 << 6) != 0;
        let i = instr & (1 << 7) != 0;
        let mmod = instr & (1 << 17) != 0;
        let imod = (instr >> 18) & 0x3;

        if mmod {
            self.update_reg_mode(mode);
            self.cpsr.mode = mode;
        }
        if imod == 2 {
            self.cpsr.fiq_disable &= !f;
            self.cpsr.irq_disable &= !i;
        } else if imod == 3 {
            self.cpsr.fiq_disable |= f;
            self.cpsr.irq_disable |= i;
        }
    }

    pub fn srs(&mut self, instr: u32) -> Result<(), EmuError> {
        let writeback = instr & (1 << 21) != 0;
        let adding = instr & (1 << 23) != 0;
        let preindex = instr & (1 << 24) != 0;
        let mode = PsrMode::from_bits(instr);

        let saved_lr = self.gpr[REG_LR];
        let saved_psr = self.spsr[self.cpsr.mode as usize].get();

        let old_mode = self.cpsr.mode;
        self.update_reg_mode(mode);
        self.cpsr.mode = mode;

        let banked_sp = self.gpr[REG_SP];
        let offset: i32 = if adding { 4 } else { -4 };
        let result = (|| -> Result<(), EmuError> {
            if adding {
                if preindex {
                    self.write32(banked_sp.wrapping_add(4), saved_lr)?;
                    self.write32(banked_sp.wrapping_add(8), saved_psr)?;
                } else {
                    self.write32(banked_sp, saved_lr)?;
                    self.write32(banked_sp.wrapping_add(4), saved_psr)?;
                }
            } else if preindex {
                self.write32(banked_sp.wrapping_sub(4), saved_psr)?;
                self.write32(banked_sp.wrapping_sub(8), saved_lr)?;
            } else {
                self.write32(banked_sp, saved_psr)?;
                self.write32(banked_sp.wrapping_sub(4), saved_lr)?;
            }
            Ok(())
        })();

        if writeback {
            self.gpr[REG_SP] = (banked_sp as i64 + (offset * 2) as i64) as u32;
        }

        self.update_reg_mode(old_mode);
        self.cpsr.mode = old_mode;
        result
    }

    pub fn rfe(&mut self, instr: u32) -> Result<(), EmuError> {
        let writeback = instr & (1 << 21) != 0;
        let adding = instr & (1 << 23) != 0;
        let preindex = instr & (1 << 24) != 0;
        let base = ((instr >> 16) & 0xF) as usize;

        let addr = self.gpr[base];
        let offset: i32 = if adding { 4 } else { -4 };
        let (pc, psr) = if adding {
            if preindex {
                (self.read32(addr.wrapping_add(4))?, self.read32(addr.wrapping_add(8))?)
            } else {
                (self.read32(addr)?, self.read32(addr.wrapping_add(4))?)
            }
        } else if preindex {
            let psr = self.read32(addr.wrapping_sub(4))?;
            (self.read32(addr.wrapping_sub(8))?, psr)
        } else {
            let psr = self.read32(addr)?;
            (self.read32(addr.wrapping_sub(4))?, psr)
        };

        if writeback {
            self.gpr[base] = (addr as i64 + (offset * 2) as i64) as u32;
        }

        self.update_reg_mode(PsrMode::from_bits(psr));
        self.cpsr.set(psr);
        self.jump(pc, false);
        Ok(())
    }
}

pub fn add_overflow(a: u32, b: u32, result: u32) -> bool {
    (a ^ b) & 0x8000_0000 == 0 && (a ^ result) & 0x8000_0000 != 0
}

pub fn sub_overflow(a: u32, b: u32, result: u32) -> bool {
    ((a ^ b) & 0x8000_0000) != 0 && ((a ^ result) & 0x8000_0000) != 0
}

pub fn reg_name(id: usize) -> &'static str {
    match id {
        0 => "r0",
        1 => "r1",
        2 => "r2",
        3 => "r3",
        4 => "r4",
        5 => "r5",
        6 => "r6",
        7 => "r7",
        8 => "r8",
        9 => "r9",
        10 => "sl",
        11 => "fp",
        12 => "ip",
        13 => "sp",
        14 => "lr",
        15 => "pc",
        _ => "??",
    }
}

impl fmt::Display for ArmCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] CPU state", self.id)?;
        for i in 0..16 {
            write!(f, "{}:{:08x}", reg_name(i), self.gpr[i])?;
            if i % 4 == 3 {
                writeln!(f)?;
            } else {
                write!(f, "\t")?;
            }
        }
        writeln!(f, "CPSR:{:08x}", self.cpsr.get())
    }
}
