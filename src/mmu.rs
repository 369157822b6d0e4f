// Virtual address translation for both ARM flavours. The ARM11 walks real
// two-level page tables; the ARM9 has a fixed-region protection unit. Either
// way the result is the same thing: a pair of page-granular fast maps
// (privileged and user) derived from the shared direct map.

use crate::memory::{Bus, CpuId, FastMap, FastPage, PagePerms, unmapped_map, PAGE_SIZE};
use log::{debug, trace};

// Data-permission nibble decode for the protection unit.
const PU_DATA_PRIV: [PagePerms; 16] = [
    PagePerms::empty(),
    PagePerms::RW,
    PagePerms::RW,
    PagePerms::RW,
    PagePerms::empty(),
    PagePerms::R,
    PagePerms::R,
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
];

const PU_DATA_USER: [PagePerms; 16] = [
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::R,
    PagePerms::RW,
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::R,
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::empty(),
];

// APX (access permission + extension bit) decode for page-table entries.
const APX_PRIV: [PagePerms; 8] = [
    PagePerms::empty(),
    PagePerms::RWX,
    PagePerms::RWX,
    PagePerms::RWX,
    PagePerms::empty(),
    PagePerms::RX,
    PagePerms::RX,
    PagePerms::RX,
];

const APX_USER: [PagePerms; 8] = [
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::RX,
    PagePerms::RWX,
    PagePerms::empty(),
    PagePerms::empty(),
    PagePerms::RX,
    PagePerms::RX,
];

#[derive(Debug, Clone, Copy, Default)]
pub struct PuRegion {
    pub base: u32,
    pub size: u64,
    pub data_priv: PagePerms,
    pub data_user: PagePerms,
    pub instr_priv: bool,
    pub instr_user: bool,
    pub enabled: bool,
}

pub struct Mmu {
    cpu: CpuId,
    pub privileged: FastMap,
    pub user: FastMap,
    pub l1_table_base: [u32; 2],
    pub domain_control: u32,
    pub pu_regions: [PuRegion; 8],
}

impl Mmu {
    pub fn new(cpu: CpuId) -> Self {
        Mmu {
            cpu,
            privileged: unmapped_map(),
            user: unmapped_map(),
            l1_table_base: [0; 2],
            domain_control: 0,
            pu_regions: [PuRegion::default(); 8],
        }
    }

    pub fn reset(&mut self) {
        for page in self.privileged.iter_mut() {
            *page = FastPage::Unmapped;
        }
        for page in self.user.iter_mut() {
            *page = FastPage::Unmapped;
        }
        self.l1_table_base = [0; 2];
        self.domain_control = 0;
        self.pu_regions = [PuRegion::default(); 8];
    }

    pub fn set_l1_table_base(&mut self, index: usize, value: u32) {
        debug!("[MMU] translation table{} base: {:08x}", index, value);
        self.l1_table_base[index] = value;
    }

    fn map_window(&mut self, bus: &Bus, vpage: usize, paddr: u32, pages: usize, perms: PagePerms) {
        let direct = bus.direct_map(self.cpu);
        for j in 0..pages {
            let entry = match direct[(paddr as usize / PAGE_SIZE) + j] {
                FastPage::Ram { region, offset, .. } => FastPage::Ram { region, offset, perms },
                FastPage::Mmio { paddr, .. } => FastPage::Mmio { paddr, perms },
                FastPage::Unmapped => FastPage::Unmapped,
            };
            self.privileged[vpage + j] = entry;
        }
    }

    fn map_window_user(&mut self, bus: &Bus, vpage: usize, paddr: u32, pages: usize, perms: PagePerms) {
        let direct = bus.direct_map(self.cpu);
        for j in 0..pages {
            let entry = match direct[(paddr as usize / PAGE_SIZE) + j] {
                FastPage::Ram { region, offset, .. } => FastPage::Ram { region, offset, perms },
                FastPage::Mmio { paddr, .. } => FastPage::Mmio { paddr, perms },
                FastPage::Unmapped => FastPage::Unmapped,
            };
            self.user[vpage + j] = entry;
        }
    }

    // Full re-walk of the unified first-level table (table 1; the boot code
    // never splits the address space between the two bases).
    pub fn reload_tlb(&mut self, bus: &Bus) {
        let base = self.l1_table_base[1];
        debug!("[MMU] table walk from {:08x}", base);

        let mut vaddr: u64 = 0;
        let mut addr = base;
        while addr < base + 16 * 1024 {
            let entry = bus.phys_read32(self.cpu, addr).unwrap_or(0);
            let vpage = (vaddr / PAGE_SIZE as u64) as usize;

            match entry & 0x3 {
                0 | 3 => {
                    for j in 0..256 {
                        self.privileged[vpage + j] = FastPage::Unmapped;
                        self.user[vpage + j] = FastPage::Unmapped;
                    }
                    vaddr += 1 << 20;
                }
                2 => {
                    let exec_never = entry & (1 << 4) != 0;
                    let mut apx = (entry >> 10) & 0x3;
                    if entry & (1 << 18) != 0 {
                        // 16 MB supersection, aligned on 16 L1 entries
                        let paddr = entry & 0xFF00_0000;
                        trace!("[MMU] [{:08x}] supersection {:08x}", vaddr, paddr);
                        let (priv_p, user_p) = apx_perms(apx as usize, exec_never);
                        self.map_window(bus, vpage, paddr, 256 * 16, priv_p);
                        self.map_window_user(bus, vpage, paddr, 256 * 16, user_p);
                        vaddr += 16 << 20;
                        addr += 64 - 4;
                    } else {
                        if entry & (1 << 15) != 0 {
                            apx |= 1 << 2;
                        }
                        let paddr = entry & 0xFFF0_0000;
                        trace!("[MMU] [{:08x}] section {:08x} apx={}", vaddr, paddr, apx);
                        let (priv_p, user_p) = apx_perms(apx as usize, exec_never);
                        self.map_window(bus, vpage, paddr, 256, priv_p);
                        self.map_window_user(bus, vpage, paddr, 256, user_p);
                        vaddr += 1 << 20;
                    }
                }
                _ => {
                    let l2_base = entry & !0x3FF;
                    let mut i = 0;
                    while i < 1024 {
                        let l2_entry = bus.phys_read32(self.cpu, l2_base + i).unwrap_or(0);
                        let vpage = (vaddr / PAGE_SIZE as u64) as usize;
                        let mut apx = ((l2_entry >> 4) & 0x3) as usize;
                        if l2_entry & (1 << 9) != 0 {
                            apx |= 1 << 2;
                        }
                        match l2_entry & 0x3 {
                            0 => {
                                self.privileged[vpage] = FastPage::Unmapped;
                                self.user[vpage] = FastPage::Unmapped;
                                vaddr += 4 << 10;
                            }
                            1 => {
                                let paddr = l2_entry & 0xFFFF_0000;
                                trace!("[MMU] [{:08x}] 64K page {:08x}", vaddr, paddr);
                                let (priv_p, user_p) = apx_perms(apx, false);
                                self.map_window(bus, vpage, paddr, 16, priv_p);
                                self.map_window_user(bus, vpage, paddr, 16, user_p);
                                vaddr += 64 << 10;
                                i += 60;
                            }
                            _ => {
                                let paddr = l2_entry & !0xFFF;
                                let exec_never = l2_entry & 0x1 != 0;
                                trace!("[MMU] [{:08x}] 4K page {:08x}", vaddr, paddr);
                                let (priv_p, user_p) = apx_perms(apx, exec_never);
                                self.map_window(bus, vpage, paddr, 1, priv_p);
                                self.map_window_user(bus, vpage, paddr, 1, user_p);
                                vaddr += 4 << 10;
                            }
                        }
                        i += 4;
                    }
                }
            }
            addr += 4;
        }
    }

    // ---- Protection unit (ARM9) ----

    pub fn set_pu_permissions(&mut self, is_data: bool, value: u32, bus: &Bus) {
        debug!("[PU] permissions (data={}): {:08x}", is_data, value);
        for i in 0..8 {
            let code = ((value >> (i * 4)) & 0xF) as usize;
            if is_data {
                self.pu_regions[i].data_priv = PU_DATA_PRIV[code];
                self.pu_regions[i].data_user = PU_DATA_USER[code];
            } else {
                self.pu_regions[i].instr_priv = matches!(code, 1 | 2 | 3 | 5 | 6);
                self.pu_regions[i].instr_user = matches!(code, 2 | 3 | 6);
            }
            if self.pu_regions[i].enabled {
                self.unmap_pu_region(i);
                self.remap_pu_region(i, bus);
            }
        }
    }

    pub fn set_pu_region(&mut self, index: usize, value: u32, bus: &Bus) {
        debug!("[PU] region {}: {:08x}", index, value);
        self.pu_regions[index].enabled = value & 0x1 != 0;
        self.pu_regions[index].size = 2u64 << ((value >> 1) & 0x1F);
        self.pu_regions[index].base = (value >> 12) << 12;

        self.unmap_pu_region(index);
        if self.pu_regions[index].enabled {
            self.remap_pu_region(index, bus);
        }
    }

    // Higher-numbered regions take priority on overlap: the lower region's
    // range is clipped to whatever the higher ones leave visible.
    fn clipped_range(&self, index: usize) -> (u64, u64) {
        let mut start = self.pu_regions[index].base as u64;
        let mut end = start + self.pu_regions[index].size;

        for i in index + 1..8 {
            if !self.pu_regions[i].enabled {
                continue;
            }
            let other_start = self.pu_regions[i].base as u64;
            let other_end = other_start + self.pu_regions[i].size;

            if start >= other_start && start < other_end {
                start = other_end;
            }
            if start < other_start && end >= other_start {
                end = other_start;
            }
        }
        (start, end)
    }

    fn unmap_pu_region(&mut self, index: usize) {
        let (start, end) = self.clipped_range(index);
        let mut page = (start / PAGE_SIZE as u64) as usize;
        let end = (end / PAGE_SIZE as u64) as usize;
        while page < end {
            self.privileged[page] = FastPage::Unmapped;
            self.user[page] = FastPage::Unmapped;
            page += 1;
        }
    }

    fn remap_pu_region(&mut self, index: usize, bus: &Bus) {
        let (start, end) = self.clipped_range(index);
        let region = self.pu_regions[index];

        let mut priv_perms = region.data_priv;
        if region.instr_priv {
            priv_perms |= PagePerms::X;
        }
        let mut user_perms = region.data_user;
        if region.instr_user {
            user_perms |= PagePerms::X;
        }

        let direct = bus.direct_map(self.cpu);
        let mut page = (start / PAGE_SIZE as u64) as usize;
        let end = (end / PAGE_SIZE as u64) as usize;
        while page < end {
            let (priv_entry, user_entry) = match direct[page] {
                FastPage::Ram { region, offset, .. } => (
                    FastPage::Ram { region, offset, perms: priv_perms },
                    FastPage::Ram { region, offset, perms: user_perms },
                ),
                FastPage::Mmio { paddr, .. } => (
                    FastPage::Mmio { paddr, perms: priv_perms },
                    FastPage::Mmio { paddr, perms: user_perms },
                ),
                FastPage::Unmapped => (FastPage::Unmapped, FastPage::Unmapped),
            };
            self.privileged[page] = priv_entry;
            self.user[page] = user_entry;
            page += 1;
        }
    }
}

fn apx_perms(apx: usize, exec_never: bool) -> (PagePerms, PagePerms) {
    let mut priv_p = APX_PRIV[apx & 0x7];
    let mut user_p = APX_USER[apx & 0x7];
    if exec_never {
        priv_p &= !PagePerms::X;
        user_p &= !PagePerms::X;
    }
    (priv_p, user_p)
}
