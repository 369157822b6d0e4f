// The Teak audio DSP core: 40-bit accumulator datapath, dual multiplier,
// stepped/modulo address registers, block-repeat hardware, its interrupt
// controller, and both halves of the host interface (the ARM-visible PDATA
// block and the DSP-visible data-space MMIO window). The word size is 16
// bits everywhere; the program counter is 18 bits over the shared memory
// image the orchestrator owns.

use crate::interrupts::MpcorePmr;
use crate::EmuError;
use log::{debug, trace};
use std::collections::VecDeque;

pub const DSP_ARM_IRQ: usize = 0x4A;

// Everything the core touches outside its own registers during one
// instruction: the shared memory image and the ARM-side interrupt fabric.
pub struct TeakIo<'a> {
    pub mem: &'a mut [u8],
    pub pmr: &'a mut MpcorePmr,
}

pub fn sign_extend(value: u64, bits: u32) -> u64 {
    (((value << (64 - bits)) as i64) >> (64 - bits)) as u64
}

pub fn sign_extend16(value: u16, bits: u32) -> u16 {
    (((value << (16 - bits)) as i16) >> (16 - bits)) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeakReg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    Y0,
    A0,
    A0l,
    A0h,
    A0e,
    A1,
    A1l,
    A1h,
    A1e,
    B0,
    B0l,
    B0h,
    B0e,
    B1,
    B1l,
    B1h,
    B1e,
    P,
    Pc,
    Sp,
    CfgI,
    CfgJ,
    Ar0,
    Ar1,
    Arp0,
    Arp1,
    Arp2,
    Arp3,
    St0,
    St1,
    St2,
    Stt0,
    Stt1,
    Stt2,
    Mod0,
    Mod1,
    Mod2,
    Mod3,
    Lc,
    Sv,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakSt0 {
    pub fr: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakSt1 {
    pub page: u8,
    pub ps: u8,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakSt2 {
    // shift mode: false = arithmetic, true = logic
    pub s: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakStt0 {
    pub flm: bool,
    pub fvl: bool,
    pub fe: bool,
    pub fc: bool,
    pub fv: bool,
    pub fn_: bool,
    pub fm: bool,
    pub fz: bool,
    pub fc1: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakStt2 {
    pub int_pending: [bool; 3],
    pub vectored_int_pending: bool,
    pub pcmhi: u8,
    pub bcn: u8,
    pub lp: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakMod0 {
    pub sat: bool,
    pub sata: bool,
    pub hwm: u8,
    pub ps1: u8,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakMod1 {
    pub stp16: bool,
    pub cmd: bool,
    pub epi: bool,
    pub epj: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakMod2 {
    pub m: [bool; 8],
    pub br: [bool; 8],
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakMod3 {
    pub nmi_ctx_switch: bool,
    pub int_ctx_switch: [bool; 3],
    pub master_int_enable: bool,
    pub int_enable: [bool; 3],
    pub vectored_int_enable: bool,
    pub ccnta: bool,
    pub reverse_stack_order: bool,
    pub crep: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakAr {
    pub step: [u8; 2],
    pub offset: [u8; 2],
    pub rn: [u8; 2],
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BkrepElement {
    pub lc: u16,
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakTimer {
    pub restart_value: u32,
    pub counter: u32,
    pub prescalar: u8,
    pub countup_mode: u8,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TeakMiu {
    pub mmio_base: u16,
    pub xpage: u8,
    pub ypage: u8,
    pub zpage: u8,
    pub x_size: [u16; 2],
    pub y_size: [u16; 2],
    pub zsp: bool,
    pub page_mode: bool,
}

impl Default for TeakMiu {
    fn default() -> Self {
        TeakMiu {
            mmio_base: 0x8000,
            xpage: 0,
            ypage: 0,
            zpage: 0,
            x_size: [0; 2],
            y_size: [0; 2],
            zsp: false,
            page_mode: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakApbp {
    pub cmd: [u16; 3],
    pub reply: [u16; 3],
    pub cmd_ready: [bool; 3],
    pub reply_ready: [bool; 3],
    pub reply_int_enable: [bool; 3],
    pub dsp_sema_recv: u16,
    pub cpu_sema_recv: u16,
    pub dsp_sema_mask: u16,
    pub cpu_sema_mask: u16,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakDma {
    pub arm_addr: u32,
    pub fifo_len: u8,
    pub cur_fifo_len: u8,
    pub fifo_started: bool,
    pub auto_inc: bool,
    pub mem_type: u8,

    pub chan_enable: u16,
    pub channel: usize,
    pub src_addr: [u32; 8],
    pub dest_addr: [u32; 8],
    pub size: [[u16; 8]; 3],
    pub src_step: [[u16; 8]; 3],
    pub dest_step: [[u16; 8]; 3],
    pub src_space: [u8; 8],
    pub dest_space: [u8; 8],
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakIcu {
    pub int_pending: u16,
    pub int_connection: [u16; 3],
    pub vectored_int_connection: u16,
    pub int_mode: u16,
    pub int_polarity: u16,
    pub vector_ctx_switch: [bool; 16],
    pub vector_addr: [u32; 16],
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeakAhbm {
    pub burst: [u8; 4],
    pub data_type: [u8; 4],
    pub transfer_dir: [u8; 4],
    pub chan_connection: [u16; 4],
}

#[derive(Debug, Default)]
pub struct TeakBtdmp {
    pub cycles_per_transmit: u16,
    pub transmit_cycles_left: u16,
    pub transmit_enabled: bool,
    pub irq_on_empty_transmit: bool,
    pub transmit_queue: VecDeque<u16>,
}

pub struct Teak {
    pub halted: bool,
    pub running: bool,
    reset_signal: bool,

    pub pc: u32,
    pub sp: u16,

    pub a0: u64,
    pub a1: u64,
    pub b0: u64,
    pub b1: u64,
    a1s: u64,
    b1s: u64,

    pub repc: u16,
    repcs: u16,
    pub rep: bool,
    rep_new_pc: u32,

    pub x: [u16; 2],
    pub y: [u16; 2],
    pub p: [u32; 2],
    pub pe: [u16; 2],

    pub r: [u16; 8],
    pub stepi: u16,
    pub stepj: u16,
    pub modi: u16,
    pub modj: u16,
    pub stepi0: u16,
    pub stepj0: u16,

    r0b: u16,
    r1b: u16,
    r4b: u16,
    r7b: u16,
    stepib: u16,
    stepjb: u16,
    modib: u16,
    modjb: u16,
    stepi0b: u16,
    stepj0b: u16,

    pub ar: [TeakAr; 2],
    ars: [TeakAr; 2],
    pub arp: [TeakAr; 4],
    arps: [TeakAr; 4],

    pub mixp: u16,
    pub sv: u16,

    pub st0: TeakSt0,
    st0s: TeakSt0,
    pub st1: TeakSt1,
    st1s: TeakSt1,
    pub st2: TeakSt2,
    st2s: TeakSt2,
    pub stt0: TeakStt0,
    stt0s: TeakStt0,
    pub stt2: TeakStt2,
    stt2s: TeakStt2,
    pub mod0: TeakMod0,
    mod0s: TeakMod0,
    pub mod1: TeakMod1,
    mod1s: TeakMod1,
    pub mod2: TeakMod2,
    mod2s: TeakMod2,
    pub mod3: TeakMod3,
    mod3s: TeakMod3,

    // 3 live levels; the extra slot absorbs the store/restore sequence.
    pub bkrep_stack: [BkrepElement; 4],

    pub timers: [TeakTimer; 2],
    pub miu: TeakMiu,
    pub apbp: TeakApbp,
    pub dma: TeakDma,
    pub icu: TeakIcu,
    pub ahbm: TeakAhbm,
    pub btdmp: TeakBtdmp,
}

impl Teak {
    pub fn new() -> Self {
        Teak {
            halted: false,
            running: false,
            reset_signal: false,
            pc: 0,
            sp: 0,
            a0: 0,
            a1: 0,
            b0: 0,
            b1: 0,
            a1s: 0,
            b1s: 0,
            repc: 0,
            repcs: 0,
            rep: false,
            rep_new_pc: 0,
            x: [0; 2],
            y: [0; 2],
            p: [0; 2],
            pe: [0; 2],
            r: [0; 8],
            stepi: 0,
            stepj: 0,
            modi: 0,
            modj: 0,
            stepi0: 0,
            stepj0: 0,
            r0b: 0,
            r1b: 0,
            r4b: 0,
            r7b: 0,
            stepib: 0,
            stepjb: 0,
            modib: 0,
            modjb: 0,
            stepi0b: 0,
            stepj0b: 0,
            ar: [TeakAr::default(); 2],
            ars: [TeakAr::default(); 2],
            arp: [TeakAr::default(); 4],
            arps: [TeakAr::default(); 4],
            mixp: 0,
            sv: 0,
            st0: TeakSt0::default(),
            st0s: TeakSt0::default(),
            st1: TeakSt1::default(),
            st1s: TeakSt1::default(),
            st2: TeakSt2::default(),
            st2s: TeakSt2::default(),
            stt0: TeakStt0::default(),
            stt0s: TeakStt0::default(),
            stt2: TeakStt2::default(),
            stt2s: TeakStt2::default(),
            mod0: TeakMod0::default(),
            mod0s: TeakMod0::default(),
            mod1: TeakMod1::default(),
            mod1s: TeakMod1::default(),
            mod2: TeakMod2::default(),
            mod2s: TeakMod2::default(),
            mod3: TeakMod3::default(),
            mod3s: TeakMod3::default(),
            bkrep_stack: [BkrepElement::default(); 4],
            timers: [TeakTimer::default(); 2],
            miu: TeakMiu::default(),
            apbp: TeakApbp::default(),
            dma: TeakDma::default(),
            icu: TeakIcu::default(),
            ahbm: TeakAhbm::default(),
            btdmp: TeakBtdmp::default(),
        }
    }

    pub fn reset(&mut self) {
        self.reset_core();
        self.apbp.cpu_sema_recv = 0;
        self.apbp.cpu_sema_mask = 0;
        self.reset_signal = false;
        self.running = false;
    }

    fn reset_core(&mut self) {
        self.halted = false;
        self.pc = 0;
        self.timers = [TeakTimer::default(); 2];
        self.miu = TeakMiu::default();
        self.apbp.cmd_ready = [false; 3];
        self.apbp.reply_ready = [false; 3];
        self.apbp.dsp_sema_recv = 0;
        self.apbp.dsp_sema_mask = 0;
        self.ahbm = TeakAhbm::default();
        self.dma.arm_addr = 0;
        self.dma.fifo_started = false;
        self.icu = TeakIcu::default();
        self.btdmp = TeakBtdmp::default();
        self.stt2 = TeakStt2::default();
        self.rep_new_pc = 0;
        self.rep = false;
        self.repc = 0;
    }

    // ---- run loop ----

    pub fn run(&mut self, cycles: i64, mem: &mut [u8], pmr: &mut MpcorePmr) -> Result<(), EmuError> {
        if !self.running {
            return Ok(());
        }
        let mut io = TeakIo { mem, pmr };
        let mut cycles = cycles;
        while cycles > 0 {
            for i in 0..2 {
                if self.timers[i].enabled {
                    self.timers[i].counter = self.timers[i].counter.wrapping_sub(1);
                    if self.timers[i].counter == 0 {
                        self.timer_overflow(i)?;
                    }
                }
            }

            if self.btdmp.transmit_enabled {
                self.btdmp.transmit_cycles_left = self.btdmp.transmit_cycles_left.wrapping_sub(1);
                if self.btdmp.transmit_cycles_left == 0 {
                    self.btdmp.transmit_cycles_left = self.btdmp.cycles_per_transmit;
                    if self.btdmp.transmit_queue.pop_front().is_some()
                        && self.btdmp.transmit_queue.is_empty()
                        && self.btdmp.irq_on_empty_transmit
                    {
                        self.assert_dsp_irq(0xB);
                    }
                }
            }

            if self.halted {
                self.int_check(&mut io)?;
                if self.halted {
                    return Ok(());
                }
            }

            if self.rep {
                if self.repc == 0 {
                    self.rep = false;
                } else {
                    self.rep_new_pc = self.pc;
                    self.repc -= 1;
                }
            }

            let instr = self.fetch_code_word(io.mem);
            crate::teak_instructions::interpret(self, &mut io, instr)?;

            // Hitting the end of the innermost block loops back to its start
            // until the count runs dry.
            if self.stt2.lp {
                let level = &mut self.bkrep_stack[(self.stt2.bcn - 1) as usize];
                if level.end + 1 == self.pc {
                    if level.lc == 0 {
                        self.stt2.bcn -= 1;
                        self.stt2.lp = self.stt2.bcn > 0;
                    } else {
                        self.pc = level.start;
                        level.lc -= 1;
                    }
                }
            }

            if self.rep_new_pc != 0 {
                self.pc = self.rep_new_pc;
                self.rep_new_pc = 0;
            }

            self.int_check(&mut io)?;
            cycles -= 1;
        }
        Ok(())
    }

    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn unhalt(&mut self) {
        self.halted = false;
    }

    // ---- memory ----

    fn convert_addr(&self, addr: u16) -> usize {
        // Data space begins halfway through the image; the MIU pages select
        // the bank beyond 64K words.
        let bank_size: usize = 0x10000;
        let mut real_addr = 0x20000 + addr as usize;

        if !self.miu.page_mode {
            real_addr += self.miu.zpage as usize * bank_size;
        } else if addr as usize <= self.miu.x_size[0] as usize * 0x400 {
            real_addr += self.miu.xpage as usize * bank_size;
        } else {
            real_addr += self.miu.ypage as usize * bank_size;
        }

        real_addr << 1
    }

    pub fn fetch_code_word(&mut self, mem: &[u8]) -> u16 {
        let at = (self.pc as usize) << 1;
        let word = u16::from_le_bytes([mem[at], mem[at + 1]]);
        self.pc = (self.pc + 1) & 0x3FFFF;
        word
    }

    pub fn read_program_word(&self, mem: &[u8], addr: u32) -> u16 {
        let at = (addr as usize & 0x3FFFF) << 1;
        u16::from_le_bytes([mem[at], mem[at + 1]])
    }

    pub fn read_data_word(&mut self, addr: u16, io: &mut TeakIo) -> Result<u16, EmuError> {
        if addr >= self.miu.mmio_base && addr < self.miu.mmio_base + 0x800 {
            return self.mmio_read(addr & 0x7FF);
        }
        let at = self.convert_addr(addr);
        Ok(u16::from_le_bytes([io.mem[at], io.mem[at + 1]]))
    }

    pub fn write_data_word(&mut self, addr: u16, value: u16, io: &mut TeakIo) -> Result<(), EmuError> {
        if addr >= self.miu.mmio_base && addr < self.miu.mmio_base + 0x800 {
            return self.mmio_write(addr & 0x7FF, value, io);
        }
        let at = self.convert_addr(addr);
        io.mem[at..at + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_from_page(&mut self, imm: u8, io: &mut TeakIo) -> Result<u16, EmuError> {
        self.read_data_word(((self.st1.page as u16) << 8).wrapping_add(imm as u16), io)
    }

    pub fn write_to_page(&mut self, imm: u8, value: u16, io: &mut TeakIo) -> Result<(), EmuError> {
        self.write_data_word(((self.st1.page as u16) << 8).wrapping_add(imm as u16), value, io)
    }

    pub fn read_data_r7s(&mut self, imm: i16, io: &mut TeakIo) -> Result<u16, EmuError> {
        self.read_data_word(self.r[7].wrapping_add(imm as u16), io)
    }

    pub fn write_data_r7s(&mut self, imm: i16, value: u16, io: &mut TeakIo) -> Result<(), EmuError> {
        self.write_data_word(self.r[7].wrapping_add(imm as u16), value, io)
    }

    // ---- DSP-visible MMIO in data space ----

    fn mmio_read(&mut self, addr: u16) -> Result<u16, EmuError> {
        if (0x0E2..0x0E2 + 4 * 6).contains(&addr) {
            let index = ((addr - 0x0E2) / 6) as usize;
            let reg = (addr - 0x0E2) % 6;
            return match reg {
                0 => Ok(((self.ahbm.burst[index] as u16) << 1) | ((self.ahbm.data_type[index] as u16) << 4)),
                2 => Ok((self.ahbm.transfer_dir[index] as u16) << 8),
                4 => Ok(self.ahbm.chan_connection[index]),
                _ => Err(EmuError::fatal(format!("[Teak] AHBM read reg {}", reg))),
            };
        }
        if (0x212..0x212 + 16 * 4).contains(&addr) {
            let id = ((addr - 0x212) / 4) as usize;
            let reg = (addr - 0x212) % 4;
            return match reg {
                0 => Ok((((self.icu.vector_ctx_switch[id] as u16) << 15)
                    | ((self.icu.vector_addr[id] >> 16) as u16 & 0x3)) as u16),
                2 => Ok(self.icu.vector_addr[id] as u16),
                _ => Ok(0),
            };
        }
        match addr {
            0x01A => Ok(0xC902), // chip id
            0x028 => Ok(self.timers[0].counter as u16),
            0x02A => Ok((self.timers[0].counter >> 16) as u16),
            0x038 => Ok(self.timers[1].counter as u16),
            0x03A => Ok((self.timers[1].counter >> 16) as u16),
            0x0C2 => {
                self.apbp.cmd_ready[0] = false;
                Ok(self.apbp.cmd[0])
            }
            0x0C6 => {
                self.apbp.cmd_ready[1] = false;
                Ok(self.apbp.cmd[1])
            }
            0x0CA => {
                self.apbp.cmd_ready[2] = false;
                Ok(self.apbp.cmd[2])
            }
            0x0D2 => Ok(self.apbp.dsp_sema_recv),
            0x0D6 => {
                let mut reg = 0u16;
                reg |= (self.apbp.reply_ready[0] as u16) << 5;
                reg |= (self.apbp.reply_ready[1] as u16) << 6;
                reg |= (self.apbp.reply_ready[2] as u16) << 7;
                reg |= (self.apbp.cmd_ready[0] as u16) << 8;
                reg |= ((self.apbp.dsp_sema_recv & !self.apbp.dsp_sema_mask != 0) as u16) << 9;
                reg |= (self.apbp.cmd_ready[1] as u16) << 12;
                reg |= (self.apbp.cmd_ready[2] as u16) << 13;
                Ok(reg)
            }
            0x0E0 => Ok(0),
            0x10E => Ok(self.miu.xpage as u16),
            0x110 => Ok(self.miu.ypage as u16),
            0x112 => Ok(self.miu.zpage as u16),
            0x114 => Ok(self.miu.x_size[0] | (self.miu.y_size[0] << 8)),
            0x11A => Ok(((self.miu.zsp as u16) << 4) | ((self.miu.page_mode as u16) << 6)),
            0x11E => Ok(self.miu.mmio_base),
            0x182 => Ok(0),
            0x184 => Ok(self.dma.chan_enable),
            0x186 => Ok(self.dma.arm_addr as u16),
            0x18C => Ok(0xFFFF), // end-of-transfer flags
            0x1BE => Ok(self.dma.channel as u16),
            0x1DA => Ok((self.dma.src_space[self.dma.channel] as u16)
                | ((self.dma.dest_space[self.dma.channel] as u16) << 4)),
            0x1DC => Ok(0),
            0x200 => Ok(self.icu.int_pending),
            0x202 => Ok(0),
            0x204 => Ok(0),
            0x206 => Ok(self.icu.int_connection[0]),
            0x208 => Ok(self.icu.int_connection[1]),
            0x20A => Ok(self.icu.int_connection[2]),
            0x20C => Ok(self.icu.vectored_int_connection),
            0x20E => Ok(self.icu.int_mode),
            0x210 => Ok(self.icu.int_polarity),
            0x280 => Ok(0),
            0x2A0 => Ok((self.btdmp.irq_on_empty_transmit as u16) << 8),
            0x2C2 => {
                let mut value = 0u16;
                value |= ((self.btdmp.transmit_queue.len() == 16) as u16) << 3;
                value |= (self.btdmp.transmit_queue.is_empty() as u16) << 4;
                Ok(value)
            }
            0x2CA => Ok(0),
            _ => Err(EmuError::fatal(format!("[Teak] unrecognized MMIO read {:04x}", addr))),
        }
    }

    fn mmio_write(&mut self, addr: u16, value: u16, io: &mut TeakIo) -> Result<(), EmuError> {
        if (0x0E2..0x0E2 + 4 * 6).contains(&addr) {
            let index = ((addr - 0x0E2) / 6) as usize;
            let reg = (addr - 0x0E2) % 6;
            match reg {
                0 => {
                    self.ahbm.burst[index] = ((value >> 1) & 0x3) as u8;
                    self.ahbm.data_type[index] = ((value >> 4) & 0x3) as u8;
                }
                2 => self.ahbm.transfer_dir[index] = ((value >> 8) & 0x1) as u8,
                4 => self.ahbm.chan_connection[index] = value & 0xFF,
                _ => return Err(EmuError::fatal(format!("[Teak] AHBM write reg {}", reg))),
            }
            return Ok(());
        }
        if (0x212..0x212 + 16 * 4).contains(&addr) {
            let id = ((addr - 0x212) / 4) as usize;
            let reg = (addr - 0x212) % 4;
            match reg {
                0 => {
                    self.icu.vector_ctx_switch[id] = value & (1 << 15) != 0;
                    self.icu.vector_addr[id] &= 0xFFFF;
                    self.icu.vector_addr[id] |= ((value & 0x3) as u32) << 16;
                }
                2 => {
                    self.icu.vector_addr[id] &= !0xFFFF;
                    self.icu.vector_addr[id] |= value as u32;
                }
                _ => {}
            }
            return Ok(());
        }
        match addr {
            0x020 | 0x030 => {
                let index = ((addr - 0x20) / 0x10) as usize;
                self.timers[index].prescalar = (value & 0x3) as u8;
                self.timers[index].countup_mode = ((value >> 2) & 0x7) as u8;
                self.timers[index].enabled = value & (1 << 9) != 0;
                if value & (1 << 10) != 0 {
                    self.timers[index].counter = self.timers[index].restart_value;
                }
            }
            0x024 => {
                self.timers[0].restart_value = (self.timers[0].restart_value & !0xFFFF) | value as u32;
            }
            0x026 => {
                self.timers[0].restart_value =
                    (self.timers[0].restart_value & 0xFFFF) | ((value as u32) << 16);
            }
            0x034 => {
                self.timers[1].restart_value = (self.timers[1].restart_value & !0xFFFF) | value as u32;
            }
            0x036 => {
                self.timers[1].restart_value =
                    (self.timers[1].restart_value & 0xFFFF) | ((value as u32) << 16);
            }
            0x0C0 | 0x0C4 | 0x0C8 => {
                let index = ((addr - 0x0C0) / 4) as usize;
                debug!("[Teak] reply{}: {:04x}", index, value);
                self.apbp.reply[index] = value;
                self.apbp.reply_ready[index] = true;
                if self.apbp.reply_int_enable[index] {
                    io.pmr.assert_hw_irq(DSP_ARM_IRQ);
                }
            }
            0x0CC => {
                let old_sema = self.apbp.cpu_sema_recv;
                let mask = !self.apbp.cpu_sema_mask;
                if old_sema & mask == 0 && (old_sema | value) & mask != 0 {
                    io.pmr.assert_hw_irq(DSP_ARM_IRQ);
                }
                self.apbp.cpu_sema_recv = value;
            }
            0x0D0 => self.apbp.dsp_sema_recv &= !value,
            0x10E => {
                self.miu.xpage = (value & 0xFF) as u8;
                if self.miu.xpage >= 2 {
                    return Err(EmuError::fatal(format!("[Teak] MIU xpage {} out of range", self.miu.xpage)));
                }
            }
            0x110 => {
                self.miu.ypage = (value & 0x0F) as u8;
                if self.miu.ypage >= 2 {
                    return Err(EmuError::fatal(format!("[Teak] MIU ypage {} out of range", self.miu.ypage)));
                }
            }
            0x114 => {
                self.miu.x_size[0] = value & 0x3F;
                self.miu.y_size[0] = (value >> 8) & 0x7F;
            }
            0x11A => {
                self.miu.zsp = value & (1 << 4) != 0;
                self.miu.page_mode = value & (1 << 6) != 0;
            }
            0x11E => self.miu.mmio_base = value & !0x1FF,
            0x184 => self.dma.chan_enable = value & 0xFF,
            0x1BE => self.dma.channel = (value & 0x7) as usize,
            0x1C0 => {
                self.dma.src_addr[self.dma.channel] =
                    (self.dma.src_addr[self.dma.channel] & !0xFFFF) | value as u32;
            }
            0x1C2 => {
                self.dma.src_addr[self.dma.channel] =
                    (self.dma.src_addr[self.dma.channel] & 0xFFFF) | ((value as u32) << 16);
            }
            0x1C4 => {
                self.dma.dest_addr[self.dma.channel] =
                    (self.dma.dest_addr[self.dma.channel] & !0xFFFF) | value as u32;
            }
            0x1C6 => {
                self.dma.dest_addr[self.dma.channel] =
                    (self.dma.dest_addr[self.dma.channel] & 0xFFFF) | ((value as u32) << 16);
            }
            0x1C8 => self.dma.size[0][self.dma.channel] = value,
            0x1CA => self.dma.size[1][self.dma.channel] = value,
            0x1CC => self.dma.size[2][self.dma.channel] = value,
            0x1CE => self.dma.src_step[0][self.dma.channel] = value,
            0x1D0 => self.dma.dest_step[0][self.dma.channel] = value,
            0x1D2 => self.dma.src_step[1][self.dma.channel] = value,
            0x1D4 => self.dma.dest_step[1][self.dma.channel] = value,
            0x1D6 => self.dma.src_step[2][self.dma.channel] = value,
            0x1D8 => self.dma.dest_step[2][self.dma.channel] = value,
            0x1DA => {
                self.dma.src_space[self.dma.channel] = (value & 0xF) as u8;
                self.dma.dest_space[self.dma.channel] = ((value >> 4) & 0xF) as u8;
            }
            0x1DC => {}
            0x202 => {
                // acknowledge: drop the pending bits and their STT2 mirrors
                self.icu.int_pending &= !value;
                for i in 0..16 {
                    if value & (1 << i) == 0 {
                        continue;
                    }
                    for j in 0..3 {
                        if self.icu.int_connection[j] & (1 << i) != 0 {
                            self.stt2.int_pending[j] = false;
                        }
                    }
                    if self.icu.vectored_int_connection & (1 << i) != 0 {
                        self.stt2.vectored_int_pending = false;
                    }
                }
            }
            0x204 => {
                for i in 0..16 {
                    if value & (1 << i) != 0 {
                        self.assert_dsp_irq(i);
                    }
                }
            }
            0x206 => self.icu.int_connection[0] = value,
            0x208 => self.icu.int_connection[1] = value,
            0x20A => self.icu.int_connection[2] = value,
            0x20C => self.icu.vectored_int_connection = value,
            0x20E => self.icu.int_mode = value,
            0x210 => self.icu.int_polarity = value,
            0x280 | 0x282 | 0x284 | 0x286 | 0x288 | 0x28A | 0x28C | 0x29E => {}
            0x2A0 => self.btdmp.irq_on_empty_transmit = value & (1 << 8) != 0,
            0x2A2 => self.btdmp.cycles_per_transmit = value,
            0x2A4 | 0x2A6 | 0x2A8 | 0x2AA | 0x2AC => {}
            0x2BE => {
                self.btdmp.transmit_enabled = value >> 15 != 0;
                if self.btdmp.transmit_enabled {
                    self.btdmp.transmit_cycles_left = self.btdmp.cycles_per_transmit;
                }
            }
            0x2C6 => self.btdmp.transmit_queue.push_back(value),
            0x2CA => {}
            _ => {
                return Err(EmuError::fatal(format!(
                    "[Teak] unrecognized MMIO write {:04x}: {:04x}",
                    addr, value
                )))
            }
        }
        Ok(())
    }

    // ---- ARM-visible host interface ----

    pub fn host_read16(&mut self, addr: u32, mem: &mut [u8]) -> Result<u16, EmuError> {
        match addr {
            0x10203000 => {
                if self.dma.mem_type != 0 {
                    return Err(EmuError::fatal(format!(
                        "[Teak] host FIFO read with memtype {}",
                        self.dma.mem_type
                    )));
                }
                if self.dma.arm_addr > 0xFFFF {
                    return Err(EmuError::fatal("[Teak] host FIFO read beyond data bank".to_string()));
                }
                let at = self.convert_addr(self.dma.arm_addr as u16);
                let value = u16::from_le_bytes([mem[at], mem[at + 1]]);
                self.host_fifo_step();
                Ok(value)
            }
            0x10203008 => {
                let mut reg = 0u16;
                reg |= (self.dma.auto_inc as u16) << 1;
                reg |= (self.dma.fifo_len as u16) << 2;
                reg |= (self.dma.fifo_started as u16) << 4;
                for i in 0..3 {
                    reg |= (self.apbp.reply_int_enable[i] as u16) << (i + 9);
                }
                reg |= (self.dma.mem_type as u16) << 12;
                Ok(reg)
            }
            0x1020300C => {
                let mut reg = 0u16;
                reg |= (self.dma.fifo_started as u16) << 6; // read FIFO not empty
                reg |= 1 << 8; // write FIFO empty
                reg |= ((self.apbp.cpu_sema_recv & !self.apbp.cpu_sema_mask != 0) as u16) << 9;
                for i in 0..3 {
                    reg |= (self.apbp.reply_ready[i] as u16) << (i + 10);
                    reg |= (self.apbp.cmd_ready[i] as u16) << (i + 13);
                }
                Ok(reg)
            }
            0x10203010 => Ok(0),
            0x10203014 => Ok(self.apbp.cpu_sema_mask),
            0x1020301C => Ok(self.apbp.cpu_sema_recv),
            0x10203024 => {
                self.apbp.reply_ready[0] = false;
                Ok(self.apbp.reply[0])
            }
            0x1020302C => {
                self.apbp.reply_ready[1] = false;
                Ok(self.apbp.reply[1])
            }
            0x10203034 => {
                self.apbp.reply_ready[2] = false;
                Ok(self.apbp.reply[2])
            }
            _ => Err(EmuError::fatal(format!("[Teak] unrecognized host read16 {:08x}", addr))),
        }
    }

    pub fn host_write16(
        &mut self,
        addr: u32,
        value: u16,
        mem: &mut [u8],
        pmr: &mut MpcorePmr,
    ) -> Result<(), EmuError> {
        match addr {
            0x10203000 => {
                if self.dma.mem_type != 0 {
                    return Err(EmuError::fatal(format!(
                        "[Teak] host FIFO write with memtype {}",
                        self.dma.mem_type
                    )));
                }
                if self.dma.arm_addr > 0xFFFF {
                    return Err(EmuError::fatal("[Teak] host FIFO write beyond data bank".to_string()));
                }
                let at = self.convert_addr(self.dma.arm_addr as u16);
                mem[at..at + 2].copy_from_slice(&value.to_le_bytes());
                self.host_fifo_step();
                Ok(())
            }
            0x10203004 => {
                self.dma.arm_addr = (self.dma.arm_addr & !0xFFFF) | value as u32;
                Ok(())
            }
            0x10203008 => {
                debug!("[Teak] host PCFG: {:04x}", value);
                let old_start = self.dma.fifo_started;
                // Dropping the reset bit lets the core out of reset and
                // starts execution at word 0.
                if value & 0x1 == 0 && self.reset_signal {
                    self.running = true;
                }
                self.reset_signal = value & 0x1 != 0;
                if self.reset_signal {
                    self.reset_core();
                }
                self.dma.auto_inc = value & (1 << 1) != 0;
                self.dma.fifo_len = ((value >> 2) & 0x3) as u8;
                self.dma.fifo_started = value & (1 << 4) != 0;
                for i in 0..3 {
                    self.apbp.reply_int_enable[i] = value & (1 << (9 + i)) != 0;
                }
                self.dma.mem_type = ((value >> 12) & 0xF) as u8;

                for i in 0..3 {
                    if self.apbp.reply_int_enable[i] && self.apbp.reply_ready[i] {
                        pmr.assert_hw_irq(DSP_ARM_IRQ);
                    }
                }

                if !old_start && self.dma.fifo_started {
                    self.dma.cur_fifo_len = match self.dma.fifo_len {
                        0 => 1,
                        1 => 8,
                        2 => 16,
                        _ => 0xFF,
                    };
                }
                Ok(())
            }
            0x10203010 => {
                let mask = self.apbp.dsp_sema_mask;
                let old_sema = self.apbp.dsp_sema_recv;
                if old_sema & !mask == 0 && value & !mask != 0 {
                    self.assert_dsp_irq(0xE);
                }
                self.apbp.dsp_sema_recv |= value;
                Ok(())
            }
            0x10203014 => {
                self.apbp.cpu_sema_mask = value;
                Ok(())
            }
            0x10203018 => {
                self.apbp.cpu_sema_recv &= !value;
                Ok(())
            }
            0x10203020 => {
                self.apbp_send_cmd(0, value);
                Ok(())
            }
            0x10203028 => {
                self.apbp_send_cmd(1, value);
                Ok(())
            }
            0x10203030 => {
                self.apbp_send_cmd(2, value);
                Ok(())
            }
            _ => Err(EmuError::fatal(format!(
                "[Teak] unrecognized host write16 {:08x}: {:04x}",
                addr, value
            ))),
        }
    }

    fn host_fifo_step(&mut self) {
        if self.dma.cur_fifo_len != 0xFF {
            self.dma.cur_fifo_len = self.dma.cur_fifo_len.wrapping_sub(1);
            if self.dma.cur_fifo_len == 0 {
                self.dma.fifo_started = false;
            }
        }
        if self.dma.auto_inc {
            self.dma.arm_addr += 1;
        }
    }

    fn apbp_send_cmd(&mut self, index: usize, value: u16) {
        trace!("[Teak] cmd{}: {:04x}", index, value);
        self.apbp.cmd[index] = value;
        self.apbp.cmd_ready[index] = true;
        self.assert_dsp_irq(0xE);
    }

    // ---- interrupts ----

    pub fn assert_dsp_irq(&mut self, id: usize) {
        trace!("[Teak] assert irq {:x}", id);
        self.icu.int_pending |= 1 << id;
    }

    fn int_check(&mut self, io: &mut TeakIo) -> Result<(), EmuError> {
        if !self.mod3.master_int_enable {
            return Ok(());
        }
        for id in 0..16 {
            if self.icu.int_pending & (1 << id) == 0 {
                continue;
            }
            for level in 0..3 {
                if self.mod3.int_enable[level] && self.icu.int_connection[level] & (1 << id) != 0 {
                    self.do_irq(0x0006 + (level as u32) * 8, level as u8, io)?;
                    return Ok(());
                }
            }
            if self.mod3.vectored_int_enable && self.icu.vectored_int_connection & (1 << id) != 0 {
                self.do_irq(self.icu.vector_addr[id], 3 + id as u8, io)?;
                return Ok(());
            }
        }
        Ok(())
    }

    fn do_irq(&mut self, addr: u32, kind: u8, io: &mut TeakIo) -> Result<(), EmuError> {
        debug!("[Teak] interrupt to {:05x}", addr);
        self.mod3.master_int_enable = false;
        self.unhalt();
        self.push_pc(io)?;
        self.pc = addr & 0x3FFFF;

        if kind > 2 {
            self.stt2.vectored_int_pending = true;
            if self.icu.vector_ctx_switch[(kind - 3) as usize] {
                self.save_context();
            }
        } else {
            self.stt2.int_pending[kind as usize] = true;
            if self.mod3.int_ctx_switch[kind as usize] {
                self.save_context();
            }
        }
        Ok(())
    }

    fn timer_overflow(&mut self, index: usize) -> Result<(), EmuError> {
        self.assert_dsp_irq(0xA - index);
        match self.timers[index].countup_mode {
            0 => self.timers[index].enabled = false,
            1 => self.timers[index].counter = self.timers[index].restart_value,
            2 => {}
            mode => {
                return Err(EmuError::fatal(format!("[Teak] timer{} countup mode {}", index, mode)))
            }
        }
        Ok(())
    }

    // ---- conditions and flags ----

    pub fn meets_condition(&self, cond: u8) -> Result<bool, EmuError> {
        match cond {
            0x00 => Ok(true),
            0x01 => Ok(self.stt0.fz),
            0x02 => Ok(!self.stt0.fz),
            0x03 => Ok(!self.stt0.fz && !self.stt0.fm),
            0x04 => Ok(!self.stt0.fm),
            0x05 => Ok(self.stt0.fm),
            0x06 => Ok(self.stt0.fm || self.stt0.fz),
            0x0C => Ok(!self.st0.fr),
            _ => Err(EmuError::fatal(format!("[Teak] unrecognized condition {:02x}", cond))),
        }
    }

    pub fn check_fr(&mut self, rn: usize) {
        self.st0.fr = self.r[rn] == 0;
    }

    // ---- accumulators and products ----

    pub fn get_acc(&self, acc: TeakReg) -> Result<u64, EmuError> {
        match acc {
            TeakReg::A0 | TeakReg::A0l | TeakReg::A0h | TeakReg::A0e => Ok(self.a0),
            TeakReg::A1 | TeakReg::A1l | TeakReg::A1h | TeakReg::A1e => Ok(self.a1),
            TeakReg::B0 | TeakReg::B0l | TeakReg::B0h | TeakReg::B0e => Ok(self.b0),
            TeakReg::B1 | TeakReg::B1l | TeakReg::B1h | TeakReg::B1e => Ok(self.b1),
            _ => Err(EmuError::fatal(format!("[Teak] {:?} is not an accumulator", acc))),
        }
    }

    pub fn set_acc(&mut self, acc: TeakReg, value: u64) -> Result<(), EmuError> {
        match acc {
            TeakReg::A0 | TeakReg::A0l | TeakReg::A0h | TeakReg::A0e => self.a0 = value,
            TeakReg::A1 | TeakReg::A1l | TeakReg::A1h | TeakReg::A1e => self.a1 = value,
            TeakReg::B0 | TeakReg::B0l | TeakReg::B0h | TeakReg::B0e => self.b0 = value,
            TeakReg::B1 | TeakReg::B1l | TeakReg::B1h | TeakReg::B1e => self.b1 = value,
            _ => return Err(EmuError::fatal(format!("[Teak] {:?} is not an accumulator", acc))),
        }
        Ok(())
    }

    pub fn trunc_to_40(value: u64) -> u64 {
        value & 0xFF_FFFF_FFFF
    }

    pub fn saturate(&mut self, value: u64) -> u64 {
        if value != sign_extend(value, 32) {
            self.stt0.flm = true;
            if (value >> 39) & 0x1 != 0 {
                return 0xFFFF_FFFF_8000_0000;
            }
            return 0x7FFF_FFFF;
        }
        value
    }

    pub fn get_saturated_acc(&mut self, acc: TeakReg) -> Result<u64, EmuError> {
        let value = self.get_acc(acc)?;
        if !self.mod0.sat {
            return Ok(self.saturate(value));
        }
        Ok(value)
    }

    pub fn set_acc_flags(&mut self, value: u64) {
        self.stt0.fz = value == 0;
        self.stt0.fm = (value >> 39) & 0x1 != 0;
        self.stt0.fe = value != sign_extend(value, 32);

        let bit31 = (value >> 31) & 0x1 != 0;
        let bit30 = (value >> 30) & 0x1 != 0;
        self.stt0.fn_ = self.stt0.fz || (!self.stt0.fe && (bit31 ^ bit30));
    }

    pub fn set_acc_and_flag(&mut self, acc: TeakReg, value: u64) -> Result<(), EmuError> {
        self.set_acc_flags(value);
        self.set_acc(acc, value)
    }

    pub fn saturate_acc_with_flag(&mut self, acc: TeakReg, value: u64) -> Result<(), EmuError> {
        self.set_acc_flags(value);
        let value = if !self.mod0.sata { self.saturate(value) } else { value };
        self.set_acc(acc, value)
    }

    pub fn set_acc_lo(&mut self, acc: TeakReg, value: u16) -> Result<(), EmuError> {
        let old = Self::trunc_to_40(self.get_acc(acc)?);
        self.set_acc(acc, (old & !0xFFFF) | value as u64)
    }

    pub fn set_acc_hi(&mut self, acc: TeakReg, value: u16) -> Result<(), EmuError> {
        let old = Self::trunc_to_40(self.get_acc(acc)?);
        self.set_acc(acc, (old & !0xFFFF_0000) | ((value as u64) << 16))
    }

    pub fn get_add_sub_result(&mut self, a: u64, b: u64, is_sub: bool) -> u64 {
        let a = Self::trunc_to_40(a);
        let mut b = Self::trunc_to_40(b);

        let result;
        if is_sub {
            result = a.wrapping_sub(b);
            b = !b;
        } else {
            result = a.wrapping_add(b);
        }

        self.stt0.fc = (result >> 40) & 0x1 != 0;
        self.stt0.fv = ((!(a ^ b) & (a ^ result)) >> 39) & 1 != 0;
        if self.stt0.fv {
            self.stt0.fvl = true;
        }
        sign_extend(result, 40)
    }

    pub fn get_product_no_shift(&self, index: usize) -> u32 {
        self.p[index]
    }

    pub fn get_product(&self, index: usize) -> u64 {
        let value = self.p[index] as u64 | ((self.pe[index] as u64) << 32);
        let ps = if index == 0 { self.st1.ps } else { self.mod0.ps1 };
        match ps {
            0 => sign_extend(value, 33),
            1 => sign_extend(value >> 1, 32),
            2 => sign_extend(value << 1, 34),
            _ => sign_extend(value << 2, 35),
        }
    }

    pub fn set_product(&mut self, index: usize, value: u32) {
        self.p[index] = value;
        self.pe[index] = (value >> 31) as u16;
    }

    pub fn multiply(&mut self, unit: usize, x_sign: bool, y_sign: bool) {
        let mut a = self.x[unit] as u32;
        let mut b = self.y[unit] as u32;

        match self.mod0.hwm {
            0 => {}
            1 => b >>= 8,
            2 => b &= 0xFF,
            _ => {
                if unit != 0 {
                    b &= 0xFF;
                } else {
                    b >>= 8;
                }
            }
        }

        if x_sign {
            a = a as u16 as i16 as i32 as u32;
        }
        if y_sign {
            b = b as u16 as i16 as i32 as u32;
        }

        self.p[unit] = a.wrapping_mul(b);
        if x_sign || y_sign {
            self.pe[unit] = (self.p[unit] >> 31) as u16;
        } else {
            self.pe[unit] = 0;
        }
    }

    // Leading redundant sign bits relative to a 32-bit frame.
    pub fn exp(value: u64) -> u16 {
        let sign = (value >> 39) & 0x1;
        let mut bit = 38i32;
        let mut count: u16 = 0;
        loop {
            if (value >> bit) & 1 != sign {
                break;
            }
            count += 1;
            if bit == 0 {
                break;
            }
            bit -= 1;
        }
        count.wrapping_sub(8)
    }

    pub fn shift_reg_40(&mut self, value: u64, dest: TeakReg, shift: u16) -> Result<(), EmuError> {
        let mut value = Self::trunc_to_40(value);
        let original_sign = value >> 39;

        if shift >> 15 == 0 {
            // left shift
            if shift >= 40 {
                if !self.st2.s {
                    self.stt0.fv = value != 0;
                    if self.stt0.fv {
                        self.stt0.fvl = true;
                    }
                }
                value = 0;
                self.stt0.fc = false;
            } else {
                if !self.st2.s {
                    self.stt0.fv = sign_extend(value, 40) != sign_extend(value, 40 - shift as u32);
                    if self.stt0.fv {
                        self.stt0.fvl = true;
                    }
                }
                value <<= shift;
                self.stt0.fc = value & (1 << 40) != 0;
            }
        } else {
            // right shift by the negated amount
            let nshift = (!shift).wrapping_add(1);
            if nshift >= 40 {
                if !self.st2.s {
                    self.stt0.fc = (value >> 39) & 1 != 0;
                    value = if self.stt0.fc { 0xFF_FFFF_FFFF } else { 0 };
                } else {
                    value = 0;
                    self.stt0.fc = false;
                }
            } else {
                self.stt0.fc = value & (1 << (nshift - 1)) != 0;
                value >>= nshift;
                if !self.st2.s {
                    value = sign_extend(value, 40 - nshift as u32);
                }
            }
            if !self.st2.s {
                self.stt0.fv = false;
            }
        }

        value = sign_extend(value, 40);
        self.set_acc_flags(value);
        if !self.st2.s && !self.mod0.sata && (self.stt0.fv || sign_extend(value, 32) != value) {
            self.stt0.flm = true;
            value = if original_sign == 1 { 0xFFFF_FFFF_8000_0000 } else { 0x7FFF_FFFF };
        }
        self.set_acc(dest, value)
    }

    // ---- 16-bit register file view ----

    pub fn get_reg16(&mut self, reg: TeakReg, mov_saturate: bool) -> Result<u16, EmuError> {
        match reg {
            TeakReg::R0 => Ok(self.r[0]),
            TeakReg::R1 => Ok(self.r[1]),
            TeakReg::R2 => Ok(self.r[2]),
            TeakReg::R3 => Ok(self.r[3]),
            TeakReg::R4 => Ok(self.r[4]),
            TeakReg::R5 => Ok(self.r[5]),
            TeakReg::R6 => Ok(self.r[6]),
            TeakReg::R7 => Ok(self.r[7]),
            TeakReg::Y0 => Ok(self.y[0]),
            TeakReg::P => Ok((self.get_product(0) >> 16) as u16),
            TeakReg::A0l | TeakReg::A1l | TeakReg::B0l | TeakReg::B1l => {
                if mov_saturate {
                    Ok(self.get_saturated_acc(reg)? as u16)
                } else {
                    Ok(self.get_acc(reg)? as u16)
                }
            }
            TeakReg::A0h | TeakReg::A1h | TeakReg::B0h | TeakReg::B1h => {
                if mov_saturate {
                    Ok((self.get_saturated_acc(reg)? >> 16) as u16)
                } else {
                    Ok((self.get_acc(reg)? >> 16) as u16)
                }
            }
            TeakReg::Sp => Ok(self.sp),
            TeakReg::CfgI => Ok(self.stepi | (self.modi << 7)),
            TeakReg::CfgJ => Ok(self.stepj | (self.modj << 7)),
            TeakReg::Ar0 => Ok(self.get_ar(0)),
            TeakReg::Ar1 => Ok(self.get_ar(1)),
            TeakReg::Arp0 => Ok(self.get_arp(0)),
            TeakReg::Arp1 => Ok(self.get_arp(1)),
            TeakReg::Arp2 => Ok(self.get_arp(2)),
            TeakReg::Arp3 => Ok(self.get_arp(3)),
            TeakReg::St0 => {
                let mut value = 0u16;
                value |= self.mod0.sat as u16;
                value |= (self.mod3.master_int_enable as u16) << 1;
                value |= (self.mod3.int_enable[0] as u16) << 2;
                value |= (self.mod3.int_enable[1] as u16) << 3;
                value |= (self.st0.fr as u16) << 4;
                value |= (self.stt0.flm as u16) << 5;
                value |= (self.stt0.fe as u16) << 6;
                value |= (self.stt0.fc as u16) << 7;
                value |= (self.stt0.fv as u16) << 8;
                value |= (self.stt0.fn_ as u16) << 9;
                value |= (self.stt0.fm as u16) << 10;
                value |= (self.stt0.fz as u16) << 11;
                value |= (((self.a0 >> 32) & 0xF) as u16) << 12;
                Ok(value)
            }
            TeakReg::St1 => {
                let mut value = self.st1.page as u16;
                value |= (self.st1.ps as u16) << 10;
                value |= (((self.a1 >> 32) & 0xF) as u16) << 12;
                Ok(value)
            }
            TeakReg::St2 => Ok((self.st2.s as u16) << 7),
            TeakReg::Stt0 => {
                let mut value = 0u16;
                value |= self.stt0.flm as u16;
                value |= (self.stt0.fvl as u16) << 1;
                value |= (self.stt0.fe as u16) << 2;
                value |= (self.stt0.fc as u16) << 3;
                value |= (self.stt0.fv as u16) << 4;
                value |= (self.stt0.fn_ as u16) << 5;
                value |= (self.stt0.fm as u16) << 6;
                value |= (self.stt0.fz as u16) << 7;
                value |= (self.stt0.fc1 as u16) << 11;
                Ok(value)
            }
            TeakReg::Stt1 => {
                let mut value = 0u16;
                value |= (self.st0.fr as u16) << 4;
                value |= (self.pe[0] & 0x1) << 14;
                value |= (self.pe[1] & 0x1) << 15;
                Ok(value)
            }
            TeakReg::Stt2 => {
                let mut value = 0u16;
                value |= self.stt2.int_pending[0] as u16;
                value |= (self.stt2.int_pending[1] as u16) << 1;
                value |= (self.stt2.int_pending[2] as u16) << 2;
                value |= (self.stt2.vectored_int_pending as u16) << 3;
                value |= (self.stt2.pcmhi as u16) << 6;
                value |= (self.stt2.bcn as u16) << 12;
                value |= (self.stt2.lp as u16) << 15;
                Ok(value)
            }
            TeakReg::Mod0 => {
                let mut value = 0u16;
                value |= self.mod0.sat as u16;
                value |= (self.mod0.sata as u16) << 1;
                value |= 1 << 2;
                value |= (self.mod0.hwm as u16) << 5;
                value |= (self.st2.s as u16) << 7;
                value |= (self.st1.ps as u16) << 10;
                value |= (self.mod0.ps1 as u16) << 13;
                Ok(value)
            }
            TeakReg::Mod1 => {
                let mut value = self.st1.page as u16;
                value |= (self.mod1.stp16 as u16) << 12;
                value |= (self.mod1.cmd as u16) << 13;
                Ok(value)
            }
            TeakReg::Mod2 => {
                let mut value = 0u16;
                for i in 0..8 {
                    value |= (self.mod2.m[i] as u16) << i;
                    value |= (self.mod2.br[i] as u16) << (i + 8);
                }
                Ok(value)
            }
            TeakReg::Mod3 => {
                let mut value = 0u16;
                value |= self.mod3.nmi_ctx_switch as u16;
                value |= (self.mod3.int_ctx_switch[0] as u16) << 1;
                value |= (self.mod3.int_ctx_switch[1] as u16) << 2;
                value |= (self.mod3.int_ctx_switch[2] as u16) << 3;
                value |= (self.mod3.master_int_enable as u16) << 7;
                value |= (self.mod3.int_enable[0] as u16) << 8;
                value |= (self.mod3.int_enable[1] as u16) << 9;
                value |= (self.mod3.int_enable[2] as u16) << 10;
                value |= (self.mod3.vectored_int_enable as u16) << 11;
                value |= (self.mod3.ccnta as u16) << 13;
                value |= (self.mod3.reverse_stack_order as u16) << 14;
                value |= (self.mod3.crep as u16) << 15;
                Ok(value)
            }
            TeakReg::Lc => {
                if self.stt2.lp {
                    Ok(self.bkrep_stack[(self.stt2.bcn - 1) as usize].lc)
                } else {
                    Ok(self.bkrep_stack[0].lc)
                }
            }
            TeakReg::Sv => Ok(self.sv),
            _ => Err(EmuError::fatal(format!("[Teak] {:?} unreadable as 16 bits", reg))),
        }
    }

    pub fn set_reg16(&mut self, reg: TeakReg, value: u16) -> Result<(), EmuError> {
        match reg {
            TeakReg::R0 => self.r[0] = value,
            TeakReg::R1 => self.r[1] = value,
            TeakReg::R2 => self.r[2] = value,
            TeakReg::R3 => self.r[3] = value,
            TeakReg::R4 => self.r[4] = value,
            TeakReg::R5 => self.r[5] = value,
            TeakReg::R6 => self.r[6] = value,
            TeakReg::R7 => self.r[7] = value,
            TeakReg::Y0 => self.y[0] = value,
            TeakReg::P => {
                self.pe[0] = (value > 0x7FFF) as u16;
                self.p[0] = (self.p[0] & 0xFFFF) | ((value as u32) << 16);
            }
            TeakReg::A0 | TeakReg::A1 | TeakReg::B0 | TeakReg::B1 => {
                self.saturate_acc_with_flag(reg, sign_extend(value as u64, 16))?;
            }
            TeakReg::A0l | TeakReg::A1l | TeakReg::B0l | TeakReg::B1l => {
                self.saturate_acc_with_flag(reg, value as u64)?;
            }
            TeakReg::A0h | TeakReg::A1h | TeakReg::B0h | TeakReg::B1h => {
                self.saturate_acc_with_flag(reg, sign_extend((value as u64) << 16, 32))?;
            }
            TeakReg::Sp => self.sp = value,
            TeakReg::CfgI => {
                self.stepi = value & 0x7F;
                self.modi = value >> 7;
            }
            TeakReg::CfgJ => {
                self.stepj = value & 0x7F;
                self.modj = value >> 7;
            }
            TeakReg::Ar0 => self.set_ar(0, value),
            TeakReg::Ar1 => self.set_ar(1, value),
            TeakReg::Arp0 => self.set_arp(0, value),
            TeakReg::Arp1 => self.set_arp(1, value),
            TeakReg::Arp2 => self.set_arp(2, value),
            TeakReg::Arp3 => self.set_arp(3, value),
            TeakReg::St0 => {
                self.mod0.sat = value & 0x1 != 0;
                self.mod3.master_int_enable = value & (1 << 1) != 0;
                self.mod3.int_enable[0] = value & (1 << 2) != 0;
                self.mod3.int_enable[1] = value & (1 << 3) != 0;
                self.st0.fr = value & (1 << 4) != 0;
                self.stt0.flm = value & (1 << 5) != 0;
                self.stt0.fvl = value & (1 << 5) != 0;
                self.stt0.fe = value & (1 << 6) != 0;
                self.stt0.fc = value & (1 << 7) != 0;
                self.stt0.fv = value & (1 << 8) != 0;
                self.stt0.fn_ = value & (1 << 9) != 0;
                self.stt0.fm = value & (1 << 10) != 0;
                self.stt0.fz = value & (1 << 11) != 0;
                self.a0 = (self.a0 & 0xFFFF_FFFF) | ((((value >> 12) & 0xF) as u64) << 32);
            }
            TeakReg::St1 => {
                self.st1.page = value as u8;
                self.st1.ps = ((value >> 10) & 0x3) as u8;
                self.a1 = (self.a1 & 0xFFFF_FFFF) | ((((value >> 12) & 0xF) as u64) << 32);
            }
            TeakReg::St2 => self.st2.s = value & (1 << 7) != 0,
            TeakReg::Stt0 => {
                self.stt0.flm = value & 0x1 != 0;
                self.stt0.fvl = value & (1 << 1) != 0;
                self.stt0.fe = value & (1 << 2) != 0;
                self.stt0.fc = value & (1 << 3) != 0;
                self.stt0.fv = value & (1 << 4) != 0;
                self.stt0.fn_ = value & (1 << 5) != 0;
                self.stt0.fm = value & (1 << 6) != 0;
                self.stt0.fz = value & (1 << 7) != 0;
                self.stt0.fc1 = value & (1 << 11) != 0;
            }
            TeakReg::Stt1 => {
                self.st0.fr = value & (1 << 4) != 0;
            }
            TeakReg::Stt2 => {
                self.stt2.pcmhi = ((value >> 6) & 0x3) as u8;
            }
            TeakReg::Mod0 => {
                self.mod0.sat = value & 0x1 != 0;
                self.mod0.sata = value & (1 << 1) != 0;
                self.mod0.hwm = ((value >> 5) & 0x3) as u8;
                self.st2.s = value & (1 << 7) != 0;
                self.st1.ps = ((value >> 10) & 0x3) as u8;
                self.mod0.ps1 = ((value >> 13) & 0x3) as u8;
            }
            TeakReg::Mod1 => {
                self.st1.page = value as u8;
                self.mod1.stp16 = value & (1 << 12) != 0;
                self.mod1.cmd = value & (1 << 13) != 0;
                self.mod1.epi = value & (1 << 14) != 0;
                self.mod1.epj = value & (1 << 15) != 0;
            }
            TeakReg::Mod2 => {
                for i in 0..8 {
                    self.mod2.m[i] = value & (1 << i) != 0;
                    self.mod2.br[i] = value & (1 << (i + 8)) != 0;
                }
            }
            TeakReg::Mod3 => {
                self.mod3.nmi_ctx_switch = value & 0x1 != 0;
                self.mod3.int_ctx_switch[0] = value & (1 << 1) != 0;
                self.mod3.int_ctx_switch[1] = value & (1 << 2) != 0;
                self.mod3.int_ctx_switch[2] = value & (1 << 3) != 0;
                self.mod3.master_int_enable = value & (1 << 7) != 0;
                self.mod3.int_enable[0] = value & (1 << 8) != 0;
                self.mod3.int_enable[1] = value & (1 << 9) != 0;
                self.mod3.int_enable[2] = value & (1 << 10) != 0;
                self.mod3.vectored_int_enable = value & (1 << 11) != 0;
                self.mod3.ccnta = value & (1 << 13) != 0;
                self.mod3.reverse_stack_order = value & (1 << 14) != 0;
                self.mod3.crep = value & (1 << 15) != 0;
            }
            TeakReg::Lc => {
                if self.stt2.lp {
                    self.bkrep_stack[(self.stt2.bcn - 1) as usize].lc = value;
                }
                self.bkrep_stack[0].lc = value;
            }
            TeakReg::Sv => self.sv = value,
            _ => {
                return Err(EmuError::fatal(format!(
                    "[Teak] {:?} unwritable as 16 bits ({:04x})",
                    reg, value
                )))
            }
        }
        Ok(())
    }

    // ---- stack ----

    pub fn push16(&mut self, value: u16, io: &mut TeakIo) -> Result<(), EmuError> {
        self.sp = self.sp.wrapping_sub(1);
        self.write_data_word(self.sp, value, io)
    }

    pub fn pop16(&mut self, io: &mut TeakIo) -> Result<u16, EmuError> {
        let value = self.read_data_word(self.sp, io)?;
        self.sp = self.sp.wrapping_add(1);
        Ok(value)
    }

    pub fn push_pc(&mut self, io: &mut TeakIo) -> Result<(), EmuError> {
        let low = self.pc as u16;
        let hi = (self.pc >> 16) as u16;

        if self.mod3.reverse_stack_order {
            self.write_data_word(self.sp.wrapping_sub(1), hi, io)?;
            self.write_data_word(self.sp.wrapping_sub(2), low, io)?;
        } else {
            self.write_data_word(self.sp.wrapping_sub(1), low, io)?;
            self.write_data_word(self.sp.wrapping_sub(2), hi, io)?;
        }
        self.sp = self.sp.wrapping_sub(2);
        Ok(())
    }

    pub fn pop_pc(&mut self, io: &mut TeakIo) -> Result<(), EmuError> {
        let (low, hi) = if self.mod3.reverse_stack_order {
            let low = self.read_data_word(self.sp, io)?;
            let hi = self.read_data_word(self.sp.wrapping_add(1), io)?;
            (low, hi)
        } else {
            let hi = self.read_data_word(self.sp, io)?;
            let low = self.read_data_word(self.sp.wrapping_add(1), io)?;
            (low, hi)
        };
        self.sp = self.sp.wrapping_add(2);
        self.pc = (low as u32 | ((hi as u32) << 16)) & 0x3FFFF;
        Ok(())
    }

    // ---- shadows, context, banked exchange ----

    fn save_shadows(&mut self) {
        self.stt0s = self.stt0;
        self.st0s = self.st0;
    }

    fn restore_shadows(&mut self) {
        self.stt0 = self.stt0s;
        self.st0 = self.st0s;
    }

    fn swap_shadows(&mut self) {
        std::mem::swap(&mut self.st0, &mut self.st0s);
        std::mem::swap(&mut self.st1, &mut self.st1s);
        std::mem::swap(&mut self.st2, &mut self.st2s);
        std::mem::swap(&mut self.stt0, &mut self.stt0s);
        std::mem::swap(&mut self.stt2.pcmhi, &mut self.stt2s.pcmhi);
        std::mem::swap(&mut self.mod0, &mut self.mod0s);
        std::mem::swap(&mut self.mod1, &mut self.mod1s);
        std::mem::swap(&mut self.mod2, &mut self.mod2s);

        // Only the interrupt-enable slice of MOD3 is shadowed.
        std::mem::swap(&mut self.mod3.int_enable[0], &mut self.mod3s.int_enable[0]);
        std::mem::swap(&mut self.mod3.int_enable[1], &mut self.mod3s.int_enable[1]);
        std::mem::swap(&mut self.mod3.int_enable[2], &mut self.mod3s.int_enable[2]);
        std::mem::swap(&mut self.mod3.vectored_int_enable, &mut self.mod3s.vectored_int_enable);

        std::mem::swap(&mut self.ar, &mut self.ars);
        std::mem::swap(&mut self.arp, &mut self.arps);
    }

    pub fn save_context(&mut self) {
        self.save_shadows();
        self.swap_shadows();
        if !self.mod3.crep {
            self.repcs = self.repc;
        }

        if !self.mod3.ccnta {
            self.a1s = self.a1;
            self.b1s = self.b1;
        } else {
            // Manual swap; moving b1 into a1 sets flags.
            let a = self.a1;
            let b = self.b1;
            self.b1 = a;
            self.set_acc_flags(b);
            self.a1 = b;
        }
    }

    pub fn restore_context(&mut self) {
        self.restore_shadows();
        self.swap_shadows();

        if !self.mod3.crep {
            self.repc = self.repcs;
        }

        if !self.mod3.ccnta {
            self.a1 = self.a1s;
            self.b1 = self.b1s;
        } else {
            std::mem::swap(&mut self.a1, &mut self.b1);
        }
    }

    pub fn banke(&mut self, flags: u8) {
        if flags & 0x01 != 0 {
            std::mem::swap(&mut self.stepi, &mut self.stepib);
            std::mem::swap(&mut self.modi, &mut self.modib);
            if self.mod1.stp16 {
                std::mem::swap(&mut self.stepi0, &mut self.stepi0b);
            }
        }
        if flags & 0x02 != 0 {
            std::mem::swap(&mut self.r[4], &mut self.r4b);
        }
        if flags & 0x04 != 0 {
            std::mem::swap(&mut self.r[1], &mut self.r1b);
        }
        if flags & 0x08 != 0 {
            std::mem::swap(&mut self.r[0], &mut self.r0b);
        }
        if flags & 0x10 != 0 {
            std::mem::swap(&mut self.r[7], &mut self.r7b);
        }
        if flags & 0x20 != 0 {
            std::mem::swap(&mut self.stepj, &mut self.stepjb);
            std::mem::swap(&mut self.modj, &mut self.modjb);
            if self.mod1.stp16 {
                std::mem::swap(&mut self.stepj0, &mut self.stepj0b);
            }
        }
    }

    // ---- repeats ----

    pub fn repeat(&mut self, lc: u16) {
        self.repc = lc;
        self.rep = true;
    }

    pub fn block_repeat(&mut self, lc: u16, end_addr: u32) -> Result<(), EmuError> {
        if self.stt2.bcn > 3 {
            return Err(EmuError::fatal("[Teak] block repeat deeper than 3 levels".to_string()));
        }
        self.bkrep_stack[self.stt2.bcn as usize] = BkrepElement { lc, start: self.pc, end: end_addr };
        self.stt2.bcn += 1;
        self.stt2.lp = true;
        Ok(())
    }

    pub fn break_loop(&mut self) -> Result<(), EmuError> {
        if !self.stt2.lp {
            return Err(EmuError::fatal("[Teak] break outside of a block repeat".to_string()));
        }
        self.stt2.bcn -= 1;
        self.stt2.lp = self.stt2.bcn > 0;
        Ok(())
    }

    pub fn restore_block_repeat(&mut self, addr: u16, io: &mut TeakIo) -> Result<u16, EmuError> {
        if self.stt2.lp {
            for i in (0..self.stt2.bcn as usize).rev() {
                self.bkrep_stack[i + 1] = self.bkrep_stack[i];
            }
            self.stt2.bcn += 1;
        }

        let flag = self.read_data_word(addr, io)?;
        if !self.stt2.lp && flag >> 15 != 0 {
            self.stt2.lp = true;
            self.stt2.bcn = 1;
        }

        let end = self.read_data_word(addr.wrapping_add(1), io)? as u32 | ((((flag >> 8) & 0x3) as u32) << 16);
        let start = self.read_data_word(addr.wrapping_add(2), io)? as u32 | (((flag & 0x3) as u32) << 16);
        let lc = self.read_data_word(addr.wrapping_add(3), io)?;
        self.bkrep_stack[0] = BkrepElement { lc, start, end };

        Ok(addr.wrapping_add(4))
    }

    pub fn store_block_repeat(&mut self, addr: u16, io: &mut TeakIo) -> Result<u16, EmuError> {
        self.write_data_word(addr.wrapping_sub(1), self.bkrep_stack[0].lc, io)?;
        self.write_data_word(addr.wrapping_sub(2), self.bkrep_stack[0].start as u16, io)?;
        self.write_data_word(addr.wrapping_sub(3), self.bkrep_stack[0].end as u16, io)?;

        let mut flag = (self.stt2.lp as u16) << 15;
        flag |= (self.bkrep_stack[0].start >> 16) as u16;
        flag |= ((self.bkrep_stack[0].end >> 16) as u16) << 8;
        self.write_data_word(addr.wrapping_sub(4), flag, io)?;

        if self.stt2.lp {
            for i in 0..(self.stt2.bcn - 1) as usize {
                self.bkrep_stack[i] = self.bkrep_stack[i + 1];
            }
            self.stt2.bcn -= 1;
            if self.stt2.bcn == 0 {
                self.stt2.lp = false;
            }
        }

        Ok(addr.wrapping_sub(4))
    }

    // ---- address-register arithmetic ----

    pub fn get_ar(&self, index: usize) -> u16 {
        let ar = &self.ar[index];
        let mut value = 0u16;
        value |= ar.step[1] as u16;
        value |= (ar.offset[1] as u16) << 3;
        value |= (ar.step[0] as u16) << 5;
        value |= (ar.offset[0] as u16) << 8;
        value |= (ar.rn[1] as u16) << 10;
        value |= (ar.rn[0] as u16) << 13;
        value
    }

    pub fn set_ar(&mut self, index: usize, value: u16) {
        let ar = &mut self.ar[index];
        ar.step[1] = (value & 0x7) as u8;
        ar.offset[1] = ((value >> 3) & 0x3) as u8;
        ar.step[0] = ((value >> 5) & 0x7) as u8;
        ar.offset[0] = ((value >> 8) & 0x3) as u8;
        ar.rn[1] = ((value >> 10) & 0x7) as u8;
        ar.rn[0] = ((value >> 13) & 0x7) as u8;
    }

    pub fn get_arp(&self, index: usize) -> u16 {
        let arp = &self.arp[index];
        let mut value = 0u16;
        value |= arp.step[0] as u16;
        value |= (arp.offset[0] as u16) << 3;
        value |= (arp.step[1] as u16) << 5;
        value |= (arp.offset[1] as u16) << 8;
        value |= (arp.rn[0] as u16) << 10;
        value |= (arp.rn[1] as u16) << 13;
        value
    }

    pub fn set_arp(&mut self, index: usize, value: u16) {
        let arp = &mut self.arp[index];
        arp.step[0] = (value & 0x7) as u8;
        arp.offset[0] = ((value >> 3) & 0x3) as u8;
        arp.step[1] = ((value >> 5) & 0x7) as u8;
        arp.offset[1] = ((value >> 8) & 0x3) as u8;
        arp.rn[0] = ((value >> 10) & 0x3) as u8;
        arp.rn[1] = ((value >> 13) & 0x3) as u8;
    }

    pub fn get_arrn_unit(&self, value: u8) -> u8 {
        match value {
            0x0 => self.ar[0].rn[0],
            0x1 => self.ar[0].rn[1],
            0x2 => self.ar[1].rn[0],
            _ => self.ar[1].rn[1],
        }
    }

    pub fn get_arstep(&self, value: u8) -> u8 {
        match value {
            0x0 => self.ar[0].step[0],
            0x1 => self.ar[0].step[1],
            0x2 => self.ar[1].step[0],
            _ => self.ar[1].step[1],
        }
    }

    pub fn get_aroffset(&self, value: u8) -> u8 {
        match value {
            0x0 => self.ar[0].offset[0],
            0x1 => self.ar[0].offset[1],
            0x2 => self.ar[1].offset[0],
            _ => self.ar[1].offset[1],
        }
    }

    pub fn rn_addr(&self, rn: usize, value: u16) -> Result<u16, EmuError> {
        if self.mod2.br[rn] && !self.mod2.m[rn] {
            return Err(EmuError::fatal("[Teak] bit-reversed addressing".to_string()));
        }
        Ok(value)
    }

    pub fn rn_and_modify(&mut self, rn: usize, step: u8, dmod: bool) -> Result<u16, EmuError> {
        let value = self.r[rn];
        if (rn == 3 && self.mod1.epi) || (rn == 7 && self.mod1.epj) {
            return Err(EmuError::fatal("[Teak] end-pointer modify unimplemented".to_string()));
        }
        self.r[rn] = self.step_addr(rn, value, step, dmod)?;
        Ok(value)
    }

    pub fn rn_addr_and_modify(&mut self, rn: usize, step: u8, dmod: bool) -> Result<u16, EmuError> {
        let value = self.rn_and_modify(rn, step, dmod)?;
        self.rn_addr(rn, value)
    }

    fn std20_log2p1(value: u32) -> u32 {
        if value == 0 {
            return 0;
        }
        32 - value.leading_zeros()
    }

    pub fn step_addr(&mut self, rn: usize, value: u16, step: u8, dmod: bool) -> Result<u16, EmuError> {
        let mut delta: u16;
        let mut step2_mode1 = false;
        let step2_mode2 = false;

        match step {
            0 => return Ok(value),
            1 => delta = 0x1,
            2 => delta = 0xFFFF,
            3 => {
                if self.mod2.br[rn] && !self.mod2.m[rn] {
                    delta = if rn < 4 { self.stepi0 } else { self.stepj0 };
                } else {
                    delta = if rn < 4 { self.stepi } else { self.stepj };
                    delta = sign_extend16(delta, 7);
                }
                if self.mod1.stp16 && !self.mod1.cmd {
                    delta = if rn < 4 { self.stepi0 } else { self.stepj0 };
                    if self.mod2.m[rn] {
                        delta = sign_extend16(delta, 9);
                    }
                }
            }
            4 => {
                delta = 0x2;
                step2_mode1 = !self.mod1.cmd;
            }
            5 => {
                delta = 0xFFFE;
                step2_mode1 = !self.mod1.cmd;
            }
            _ => return Err(EmuError::fatal(format!("[Teak] unrecognized step {}", step))),
        }

        let mut value = value;
        if !dmod && !self.mod2.br[rn] && self.mod2.m[rn] {
            let modulo = if rn < 4 { self.modi } else { self.modj };
            if modulo == 0 || (modulo == 1 && step2_mode2) {
                return Ok(value);
            }

            let mut iterations = 1;
            if step2_mode1 {
                iterations = 2;
                delta = sign_extend16(delta >> 1, 15);
            }

            for _ in 0..iterations {
                if self.mod1.cmd || step2_mode2 {
                    // masked variant
                    let neg = delta >> 15 != 0;
                    let m = if neg { modulo | !delta } else { modulo | delta };
                    let mask = ((1u32 << Self::std20_log2p1(m as u32)) - 1) as u16;
                    let next;
                    if !neg {
                        if value & mask == modulo && (!step2_mode2 || modulo != mask) {
                            next = 0;
                        } else {
                            next = value.wrapping_add(delta) & mask;
                        }
                    } else if value & mask == 0 && (!step2_mode2 || modulo != mask) {
                        next = 0;
                    } else {
                        next = value.wrapping_add(delta) & mask;
                    }
                    value = (value & !mask) | next;
                } else {
                    let mask = ((1u32 << Self::std20_log2p1(modulo as u32)) - 1) as u16;
                    let mut next;
                    if delta < 0x8000 {
                        next = value.wrapping_add(delta) & mask;
                        if next == modulo.wrapping_add(1) & mask {
                            next = 0;
                        }
                    } else {
                        next = value & mask;
                        if next == 0 {
                            next = modulo.wrapping_add(1);
                        }
                        next = next.wrapping_add(delta) & mask;
                    }
                    value = (value & !mask) | next;
                }
            }
        } else {
            value = value.wrapping_add(delta);
        }
        Ok(value)
    }

    pub fn offset_addr(&mut self, rn: usize, addr: u16, offset: u8, dmod: bool) -> Result<u16, EmuError> {
        if offset == 0 {
            return Ok(addr);
        }
        if offset == 3 {
            return Ok(addr.wrapping_sub(1));
        }

        let emod = !dmod && !self.mod2.br[rn] && self.mod2.m[rn];
        let modulo = if rn < 4 { self.modi } else { self.modj };
        let mut mask = 1u16;
        for i in 0..9 {
            mask |= modulo >> i;
        }

        if offset == 1 {
            if emod && addr & mask == modulo {
                return Ok(addr & !mask);
            }
            return Ok(addr.wrapping_add(1));
        }
        Err(EmuError::fatal("[Teak] minus-one offset addressing".to_string()))
    }

    pub fn product_sum(
        &mut self,
        base: u8,
        acc: TeakReg,
        sub_p0: bool,
        p0_align: bool,
        sub_p1: bool,
        p1_align: bool,
    ) -> Result<(), EmuError> {
        let mut pa = self.get_product(0);
        let mut pb = self.get_product(1);

        if p0_align {
            pa = sign_extend(pa >> 16, 24);
        }
        if p1_align {
            pb = sign_extend(pb >> 16, 24);
        }

        let sum = match base {
            0 => 0,
            1 => self.get_acc(acc)?,
            2 => sign_extend((self.sv as u64) << 16, 32),
            _ => sign_extend((self.sv as u64) << 16, 32) | 0x8000,
        };

        let result = self.get_add_sub_result(sum, pa, sub_p0);
        let fc = self.stt0.fc;
        let fv = self.stt0.fv;
        let result = self.get_add_sub_result(result, pb, sub_p1);

        if sub_p0 == sub_p1 {
            self.stt0.fc |= fc;
            self.stt0.fv |= fv;
        } else {
            self.stt0.fc ^= fc;
            self.stt0.fv ^= fv;
        }

        self.saturate_acc_with_flag(acc, result)
    }
}
