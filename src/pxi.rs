// The ARM9<->ARM11 mailbox: two 16-deep word FIFOs plus a sync byte per
// side. IRQs are edge-triggered on the empty/not-empty transitions, which is
// why every push/pop takes the receiving side's interrupt controller.

use crate::interrupts::{Interrupt9, MpcorePmr};
use log::{debug, trace};
use std::collections::VecDeque;

pub const FIFO_DEPTH: usize = 16;

const IRQ11_SYNC: usize = 0x50;
const IRQ11_SEND_EMPTY: usize = 0x52;
const IRQ11_RECV_NOT_EMPTY: usize = 0x53;

const IRQ9_SYNC: usize = 12;
const IRQ9_SEND_EMPTY: usize = 13;
const IRQ9_RECV_NOT_EMPTY: usize = 14;

#[derive(Debug, Default, Clone, Copy)]
struct SyncReg {
    recv_data: u8,
    local_irq: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct CntReg {
    send_empty_irq: bool,
    recv_not_empty_irq: bool,
    error: bool,
    enable: bool,
}

pub struct Pxi {
    sync9: SyncReg,
    sync11: SyncReg,
    cnt9: CntReg,
    cnt11: CntReg,

    // recv9 carries words travelling ARM11 -> ARM9, recv11 the reverse.
    recv9: VecDeque<u32>,
    recv11: VecDeque<u32>,
    last_recv9: u32,
    last_recv11: u32,

    pub ready_for_hle: bool,
}

impl Pxi {
    pub fn new() -> Self {
        Pxi {
            sync9: SyncReg::default(),
            sync11: SyncReg::default(),
            cnt9: CntReg::default(),
            cnt11: CntReg::default(),
            recv9: VecDeque::new(),
            recv11: VecDeque::new(),
            last_recv9: 0,
            last_recv11: 0,
            ready_for_hle: false,
        }
    }

    pub fn reset(&mut self) {
        self.sync9 = SyncReg::default();
        self.sync11 = SyncReg::default();
        self.cnt9 = CntReg::default();
        self.cnt11 = CntReg::default();
        self.recv9.clear();
        self.recv11.clear();
        self.last_recv9 = 0;
        self.last_recv11 = 0;
        self.ready_for_hle = false;
    }

    pub fn read_sync9(&self) -> u32 {
        let mut reg = self.sync9.recv_data as u32;
        reg |= (self.sync11.recv_data as u32) << 8;
        reg |= (self.sync9.local_irq as u32) << 31;
        reg
    }

    pub fn read_sync11(&self) -> u32 {
        let mut reg = self.sync11.recv_data as u32;
        reg |= (self.sync9.recv_data as u32) << 8;
        reg |= (self.sync11.local_irq as u32) << 31;
        reg
    }

    pub fn write_sync9(&mut self, value: u32, pmr: &mut MpcorePmr) {
        debug!("[PXI] write sync9: {:08x}", value);
        self.sync11.recv_data = (value >> 8) as u8;
        self.sync9.local_irq = value & (1 << 31) != 0;

        if value & (1 << 29) != 0 && self.sync11.local_irq {
            pmr.assert_hw_irq(IRQ11_SYNC);
        }
    }

    pub fn write_sync11(&mut self, value: u32, int9: &mut Interrupt9) {
        debug!("[PXI] write sync11: {:08x}", value);
        self.sync9.recv_data = (value >> 8) as u8;
        self.sync11.local_irq = value & (1 << 31) != 0;

        if value & (1 << 30) != 0 && self.sync9.local_irq {
            // The first cross-side sync IRQ marks the other end's process
            // server as up and ready for requests.
            self.ready_for_hle = true;
            int9.assert_irq(IRQ9_SYNC);
        }
    }

    pub fn read_cnt9(&self) -> u16 {
        let mut reg = 0u16;
        reg |= (self.recv11.is_empty()) as u16;
        reg |= ((self.recv11.len() == FIFO_DEPTH) as u16) << 1;
        reg |= (self.cnt9.send_empty_irq as u16) << 2;
        reg |= ((self.recv9.is_empty()) as u16) << 8;
        reg |= ((self.recv9.len() == FIFO_DEPTH) as u16) << 9;
        reg |= (self.cnt9.recv_not_empty_irq as u16) << 10;
        reg |= (self.cnt9.error as u16) << 14;
        reg |= (self.cnt9.enable as u16) << 15;
        reg
    }

    pub fn read_cnt11(&self) -> u16 {
        let mut reg = 0u16;
        reg |= (self.recv9.is_empty()) as u16;
        reg |= ((self.recv9.len() == FIFO_DEPTH) as u16) << 1;
        reg |= (self.cnt11.send_empty_irq as u16) << 2;
        reg |= ((self.recv11.is_empty()) as u16) << 8;
        reg |= ((self.recv11.len() == FIFO_DEPTH) as u16) << 9;
        reg |= (self.cnt11.recv_not_empty_irq as u16) << 10;
        reg |= (self.cnt11.error as u16) << 14;
        reg |= (self.cnt11.enable as u16) << 15;
        reg
    }

    pub fn write_cnt9(&mut self, value: u16, int9: &mut Interrupt9) {
        debug!("[PXI] write cnt9: {:04x}", value);

        if !self.cnt9.recv_not_empty_irq && value & (1 << 10) != 0 && !self.recv9.is_empty() {
            int9.assert_irq(IRQ9_RECV_NOT_EMPTY);
        }
        if !self.cnt9.send_empty_irq && value & (1 << 2) != 0 && self.recv11.is_empty() {
            int9.assert_irq(IRQ9_SEND_EMPTY);
        }

        self.cnt9.send_empty_irq = value & (1 << 2) != 0;
        self.cnt9.recv_not_empty_irq = value & (1 << 10) != 0;
        if value & (1 << 14) != 0 {
            self.cnt9.error = false;
        }
        self.cnt9.enable = value & (1 << 15) != 0;

        // Clearing the send FIFO throws away whatever the other side has
        // not picked up yet.
        if value & (1 << 3) != 0 {
            self.recv11.clear();
        }
    }

    pub fn write_cnt11(&mut self, value: u16, pmr: &mut MpcorePmr) {
        debug!("[PXI] write cnt11: {:04x}", value);

        if !self.cnt11.recv_not_empty_irq && value & (1 << 10) != 0 && !self.recv11.is_empty() {
            pmr.assert_hw_irq(IRQ11_RECV_NOT_EMPTY);
        }
        if !self.cnt11.send_empty_irq && value & (1 << 2) != 0 && self.recv9.is_empty() {
            pmr.assert_hw_irq(IRQ11_SEND_EMPTY);
        }

        self.cnt11.send_empty_irq = value & (1 << 2) != 0;
        self.cnt11.recv_not_empty_irq = value & (1 << 10) != 0;
        if value & (1 << 14) != 0 {
            self.cnt11.error = false;
        }
        self.cnt11.enable = value & (1 << 15) != 0;

        if value & (1 << 3) != 0 {
            self.recv9.clear();
        }
    }

    pub fn read_msg9(&mut self, pmr: &mut MpcorePmr) -> u32 {
        if let Some(value) = self.recv9.pop_front() {
            self.last_recv9 = value;
            if self.recv9.is_empty() && self.cnt11.send_empty_irq {
                pmr.assert_hw_irq(IRQ11_SEND_EMPTY);
            }
        }
        trace!("[PXI] recv9 {:08x}", self.last_recv9);
        self.last_recv9
    }

    pub fn read_msg11(&mut self, int9: &mut Interrupt9) -> u32 {
        if let Some(value) = self.recv11.pop_front() {
            self.last_recv11 = value;
            if self.recv11.is_empty() && self.cnt9.send_empty_irq {
                int9.assert_irq(IRQ9_SEND_EMPTY);
            }
        }
        trace!("[PXI] recv11 {:08x}", self.last_recv11);
        self.last_recv11
    }

    pub fn send_to_9(&mut self, value: u32, int9: &mut Interrupt9) {
        trace!("[PXI] send to 9: {:08x} ({})", value, self.recv9.len());
        if self.recv9.len() == FIFO_DEPTH {
            self.cnt11.error = true;
            return;
        }
        self.recv9.push_back(value);
        if self.recv9.len() == 1 && self.cnt9.recv_not_empty_irq {
            int9.assert_irq(IRQ9_RECV_NOT_EMPTY);
        }
    }

    pub fn send_to_11(&mut self, value: u32, pmr: &mut MpcorePmr) {
        trace!("[PXI] send to 11: {:08x} ({})", value, self.recv11.len());
        if self.recv11.len() == FIFO_DEPTH {
            self.cnt9.error = true;
            return;
        }
        self.recv11.push_back(value);
        if self.recv11.len() == 1 && self.cnt11.recv_not_empty_irq {
            pmr.assert_hw_irq(IRQ11_RECV_NOT_EMPTY);
        }
    }
}
