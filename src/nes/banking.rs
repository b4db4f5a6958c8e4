use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};

use super::cartridge::Cartridge;
use super::mapper::Mirroring;

const CPU_ROM_START: u16 = 0x8000;
const CPU_ROM_WINDOW: usize = 0x8000;
const PPU_PATTERN_WINDOW: usize = 0x2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrgMemoryKind {
    SaveRam,
    WorkRam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryAccess {
    Read,
    ReadWrite,
}

/// Page sizes a board exposes to the banking layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankLayout {
    pub prg_page_size: usize,
    pub chr_page_size: usize,
    pub save_ram_size: usize,
}

/// Page-selection primitives a mapper drives. Implementors own physical
/// translation and wrap out-of-range pages.
pub trait MemoryBanking {
    fn select_prg_page(&mut self, slot: usize, page: u16);
    fn select_chr_page(&mut self, slot: usize, page: u16);
    fn set_cpu_window(&mut self, start: u16, end: u16, kind: PrgMemoryKind, access: MemoryAccess);
    fn remove_cpu_window(&mut self, start: u16, end: u16);
    fn set_mirroring(&mut self, mirroring: Mirroring);
    fn prg_page_count(&self) -> usize;
    fn has_battery(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuWindow {
    start: u16,
    end: u16,
    kind: PrgMemoryKind,
    access: MemoryAccess,
}

impl CpuWindow {
    fn contains(&self, addr: u16) -> bool {
        (self.start..=self.end).contains(&addr)
    }
}

/// RAM contents and mirroring; page tables are re-derived by the mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub mirroring: Mirroring,
    pub save_ram: String,
    pub work_ram: String,
    pub chr_ram: Option<String>,
}

/// Decoded and length-checked RAM image, ready to apply.
pub struct MemoryImage {
    mirroring: Mirroring,
    save_ram: Vec<u8>,
    work_ram: Vec<u8>,
    chr_ram: Option<Vec<u8>>,
}

pub struct BankedMemory {
    prg_rom: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    save_ram: Vec<u8>,
    work_ram: Vec<u8>,
    has_battery: bool,
    layout: BankLayout,
    prg_pages: Vec<usize>,
    chr_pages: Vec<usize>,
    window: Option<CpuWindow>,
    mirroring: Mirroring,
    four_screen: bool,
}

impl BankedMemory {
    pub fn new(cart: Cartridge, layout: BankLayout) -> Self {
        let prg_slots = (CPU_ROM_WINDOW / layout.prg_page_size.max(1)).max(1);
        let chr_slots = (PPU_PATTERN_WINDOW / layout.chr_page_size.max(1)).max(1);
        // The header can ask for more RAM than the board's window shows.
        let ram_size = cart.prg_ram_size.max(layout.save_ram_size);
        let (save_ram, work_ram) = if cart.has_battery_backed_ram {
            (vec![0; ram_size], Vec::new())
        } else {
            (Vec::new(), vec![0; ram_size])
        };

        Self {
            prg_rom: cart.prg_rom,
            chr: cart.chr_data,
            chr_is_ram: cart.chr_is_ram,
            save_ram,
            work_ram,
            has_battery: cart.has_battery_backed_ram,
            layout,
            prg_pages: vec![0; prg_slots],
            chr_pages: vec![0; chr_slots],
            window: None,
            mirroring: cart.mirroring,
            four_screen: cart.four_screen,
        }
    }

    pub fn layout(&self) -> BankLayout {
        self.layout
    }

    pub fn mirroring(&self) -> Mirroring {
        if self.four_screen {
            Mirroring::FourScreen
        } else {
            self.mirroring
        }
    }

    pub fn prg_page(&self, slot: usize) -> Option<usize> {
        self.prg_pages.get(slot).copied()
    }

    pub fn chr_page(&self, slot: usize) -> Option<usize> {
        self.chr_pages.get(slot).copied()
    }

    pub fn cpu_window(&self) -> Option<(PrgMemoryKind, MemoryAccess)> {
        self.window.map(|w| (w.kind, w.access))
    }

    fn chr_page_count(&self) -> usize {
        (self.chr.len() / self.layout.chr_page_size).max(1)
    }

    fn window_ram(&self, kind: PrgMemoryKind) -> &[u8] {
        match kind {
            PrgMemoryKind::SaveRam => &self.save_ram,
            PrgMemoryKind::WorkRam => &self.work_ram,
        }
    }

    /// `None` means open bus: nothing is mapped at `addr`.
    pub fn cpu_read(&self, addr: u16) -> Option<u8> {
        if addr >= CPU_ROM_START {
            let rel = (addr - CPU_ROM_START) as usize;
            let slot = rel / self.layout.prg_page_size;
            let page = *self.prg_pages.get(slot)?;
            let idx = page * self.layout.prg_page_size + rel % self.layout.prg_page_size;
            return self.prg_rom.get(idx % self.prg_rom.len().max(1)).copied();
        }

        let window = self.window.filter(|w| w.contains(addr))?;
        let ram = self.window_ram(window.kind);
        if ram.is_empty() {
            return None;
        }
        Some(ram[(addr - window.start) as usize % ram.len()])
    }

    /// Returns false when the write hit nothing writable.
    pub fn cpu_write(&mut self, addr: u16, value: u8) -> bool {
        let Some(window) = self.window.filter(|w| w.contains(addr)) else {
            return false;
        };
        if window.access != MemoryAccess::ReadWrite {
            return false;
        }
        let ram = match window.kind {
            PrgMemoryKind::SaveRam => &mut self.save_ram,
            PrgMemoryKind::WorkRam => &mut self.work_ram,
        };
        if ram.is_empty() {
            return false;
        }
        let idx = (addr - window.start) as usize % ram.len();
        ram[idx] = value;
        true
    }

    fn map_chr_addr(&self, addr: u16) -> usize {
        let addr = addr as usize & (PPU_PATTERN_WINDOW - 1);
        let slot = addr / self.layout.chr_page_size;
        let page = self.chr_pages.get(slot).copied().unwrap_or(0);
        page * self.layout.chr_page_size + addr % self.layout.chr_page_size
    }

    pub fn ppu_read(&self, addr: u16) -> u8 {
        if self.chr.is_empty() {
            return 0;
        }
        self.chr[self.map_chr_addr(addr) % self.chr.len()]
    }

    pub fn ppu_write(&mut self, addr: u16, value: u8) {
        if self.chr_is_ram && !self.chr.is_empty() {
            let mapped = self.map_chr_addr(addr) % self.chr.len();
            self.chr[mapped] = value;
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            mirroring: self.mirroring,
            save_ram: BASE64_STANDARD.encode(&self.save_ram),
            work_ram: BASE64_STANDARD.encode(&self.work_ram),
            chr_ram: self
                .chr_is_ram
                .then(|| BASE64_STANDARD.encode(&self.chr)),
        }
    }

    /// Decodes a snapshot and checks it against this cartridge's RAM sizes
    /// without touching live state.
    pub fn decode_snapshot(&self, snapshot: &MemorySnapshot) -> Result<MemoryImage> {
        let save_ram = BASE64_STANDARD
            .decode(&snapshot.save_ram)
            .context("save RAM image is not valid base64")?;
        let work_ram = BASE64_STANDARD
            .decode(&snapshot.work_ram)
            .context("work RAM image is not valid base64")?;

        if save_ram.len() != self.save_ram.len() {
            bail!(
                "save RAM size mismatch: state has {} bytes, cartridge has {}",
                save_ram.len(),
                self.save_ram.len()
            );
        }
        if work_ram.len() != self.work_ram.len() {
            bail!(
                "work RAM size mismatch: state has {} bytes, cartridge has {}",
                work_ram.len(),
                self.work_ram.len()
            );
        }

        let chr_ram = match (&snapshot.chr_ram, self.chr_is_ram) {
            (Some(encoded), true) => {
                let chr = BASE64_STANDARD
                    .decode(encoded)
                    .context("CHR RAM image is not valid base64")?;
                if chr.len() != self.chr.len() {
                    bail!(
                        "CHR RAM size mismatch: state has {} bytes, cartridge has {}",
                        chr.len(),
                        self.chr.len()
                    );
                }
                Some(chr)
            }
            (None, false) => None,
            (Some(_), false) => bail!("state carries CHR RAM but cartridge uses CHR ROM"),
            (None, true) => bail!("state is missing the CHR RAM image"),
        };

        Ok(MemoryImage {
            mirroring: snapshot.mirroring,
            save_ram,
            work_ram,
            chr_ram,
        })
    }

    pub fn apply_image(&mut self, image: MemoryImage) {
        self.mirroring = image.mirroring;
        self.save_ram = image.save_ram;
        self.work_ram = image.work_ram;
        if let Some(chr) = image.chr_ram {
            self.chr = chr;
        }
    }
}

impl MemoryBanking for BankedMemory {
    fn select_prg_page(&mut self, slot: usize, page: u16) {
        let count = self.prg_page_count();
        if let Some(entry) = self.prg_pages.get_mut(slot) {
            *entry = page as usize % count;
        }
    }

    fn select_chr_page(&mut self, slot: usize, page: u16) {
        let count = self.chr_page_count();
        if let Some(entry) = self.chr_pages.get_mut(slot) {
            *entry = page as usize % count;
        }
    }

    fn set_cpu_window(&mut self, start: u16, end: u16, kind: PrgMemoryKind, access: MemoryAccess) {
        self.window = Some(CpuWindow {
            start,
            end,
            kind,
            access,
        });
    }

    fn remove_cpu_window(&mut self, start: u16, end: u16) {
        if self
            .window
            .is_some_and(|w| w.start >= start && w.end <= end)
        {
            self.window = None;
        }
    }

    fn set_mirroring(&mut self, mirroring: Mirroring) {
        self.mirroring = mirroring;
    }

    fn prg_page_count(&self) -> usize {
        (self.prg_rom.len() / self.layout.prg_page_size).max(1)
    }

    fn has_battery(&self) -> bool {
        self.has_battery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT_8K: BankLayout = BankLayout {
        prg_page_size: 0x2000,
        chr_page_size: 0x0400,
        save_ram_size: 0x2000,
    };

    #[test]
    fn prg_pages_wrap_modulo_page_count() {
        let cart = Cartridge::synthetic(4, 0, 4 * 0x2000, 8 * 0x0400);
        let mut memory = BankedMemory::new(cart, LAYOUT_8K);

        memory.select_prg_page(0, 6);
        assert_eq!(memory.prg_page(0), Some(2));
        assert_eq!(memory.cpu_read(0x8000), Some(3));

        memory.select_prg_page(3, 3);
        assert_eq!(memory.cpu_read(0xFFFF), Some(4));
    }

    #[test]
    fn chr_pages_select_one_kilobyte_windows() {
        let cart = Cartridge::synthetic(4, 0, 4 * 0x2000, 8 * 0x0400);
        let mut memory = BankedMemory::new(cart, LAYOUT_8K);

        memory.select_chr_page(7, 5);
        assert_eq!(memory.ppu_read(0x1C00), 6);
        assert_eq!(memory.ppu_read(0x0000), 1);
    }

    #[test]
    fn cpu_window_honours_access_mode() {
        let cart = Cartridge::synthetic(4, 0, 4 * 0x2000, 8 * 0x0400);
        let mut memory = BankedMemory::new(cart, LAYOUT_8K);

        assert_eq!(memory.cpu_read(0x6000), None);
        assert!(!memory.cpu_write(0x6000, 0x11));

        memory.set_cpu_window(0x6000, 0x7FFF, PrgMemoryKind::WorkRam, MemoryAccess::ReadWrite);
        assert!(memory.cpu_write(0x6000, 0x11));
        assert_eq!(memory.cpu_read(0x6000), Some(0x11));

        memory.set_cpu_window(0x6000, 0x7FFF, PrgMemoryKind::WorkRam, MemoryAccess::Read);
        assert!(!memory.cpu_write(0x6000, 0x22));
        assert_eq!(memory.cpu_read(0x6000), Some(0x11));

        memory.remove_cpu_window(0x6000, 0x7FFF);
        assert_eq!(memory.cpu_read(0x6000), None);
    }

    #[test]
    fn snapshot_rejects_wrong_ram_size() {
        let cart = Cartridge::synthetic(4, 0, 4 * 0x2000, 8 * 0x0400);
        let memory = BankedMemory::new(cart, LAYOUT_8K);
        let mut snap = memory.snapshot();
        snap.work_ram = BASE64_STANDARD.encode([0u8; 16]);

        assert!(memory.decode_snapshot(&snap).is_err());
    }

    #[test]
    fn ram_is_sized_from_header_when_larger_than_board_window() {
        let mut cart = Cartridge::synthetic(4, 0, 4 * 0x2000, 8 * 0x0400);
        cart.prg_ram_size = 0x8000;
        let memory = BankedMemory::new(cart, LAYOUT_8K);
        let work_ram = BASE64_STANDARD
            .decode(memory.snapshot().work_ram)
            .expect("valid base64");
        assert_eq!(work_ram.len(), 0x8000);

        let mut small = Cartridge::synthetic(4, 0, 4 * 0x2000, 8 * 0x0400);
        small.prg_ram_size = 0;
        let memory = BankedMemory::new(small, LAYOUT_8K);
        let work_ram = BASE64_STANDARD
            .decode(memory.snapshot().work_ram)
            .expect("valid base64");
        assert_eq!(work_ram.len(), 0x2000);
    }
}
