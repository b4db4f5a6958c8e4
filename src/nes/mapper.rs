use anyhow::{Result, bail, ensure};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::a12::{A12Edge, A12Snapshot, A12Watcher};
use super::banking::{BankLayout, MemoryAccess, MemoryBanking, PrgMemoryKind};
use super::cartridge::Cartridge;
use super::irq::{ClockEdge, FiringPolicy, InterruptLine, IrqSnapshot, ScanlineIrq};

pub const MAPPER_MMC3: u16 = 4;
pub const MAPPER_NFROM: u16 = 404;

const WRAM_START: u16 = 0x6000;
const WRAM_END: u16 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    FourScreen,
}

/// One of the eight CPU-visible register slots shared by the MMC3 family.
///
/// Boards decode `addr & 0xE001`; every write in `$8000-$FFFF` lands on
/// exactly one slot regardless of the other address bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterSlot {
    Reg8000,
    Reg8001,
    RegA000,
    RegA001,
    RegC000,
    RegC001,
    RegE000,
    RegE001,
}

impl RegisterSlot {
    pub const MASK: u16 = 0xE001;

    pub const ALL: [RegisterSlot; 8] = [
        RegisterSlot::Reg8000,
        RegisterSlot::Reg8001,
        RegisterSlot::RegA000,
        RegisterSlot::RegA001,
        RegisterSlot::RegC000,
        RegisterSlot::RegC001,
        RegisterSlot::RegE000,
        RegisterSlot::RegE001,
    ];

    /// `None` below `$8000`, where the register file is not mapped.
    pub fn decode(addr: u16) -> Option<Self> {
        match addr & Self::MASK {
            0x8000 => Some(RegisterSlot::Reg8000),
            0x8001 => Some(RegisterSlot::Reg8001),
            0xA000 => Some(RegisterSlot::RegA000),
            0xA001 => Some(RegisterSlot::RegA001),
            0xC000 => Some(RegisterSlot::RegC000),
            0xC001 => Some(RegisterSlot::RegC001),
            0xE000 => Some(RegisterSlot::RegE000),
            0xE001 => Some(RegisterSlot::RegE001),
            _ => None,
        }
    }

    pub fn base_address(self) -> u16 {
        match self {
            RegisterSlot::Reg8000 => 0x8000,
            RegisterSlot::Reg8001 => 0x8001,
            RegisterSlot::RegA000 => 0xA000,
            RegisterSlot::RegA001 => 0xA001,
            RegisterSlot::RegC000 => 0xC000,
            RegisterSlot::RegC001 => 0xC001,
            RegisterSlot::RegE000 => 0xE000,
            RegisterSlot::RegE001 => 0xE001,
        }
    }
}

/// Seeded source for the undefined register contents a board powers up with.
pub struct PowerOnRng(StdRng);

impl PowerOnRng {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    pub fn next_byte(&mut self) -> u8 {
        self.0.random()
    }

    fn next_flag(&mut self) -> bool {
        self.next_byte() & 1 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mmc3Revision {
    /// MMC3B/C (Sharp), the common case.
    Sharp,
    /// MMC3A (NEC), NES 2.0 submapper 4.
    Nec,
    /// Acclaim MC-ACC, NES 2.0 submapper 3; counts on A12 falling edges.
    McAcc,
}

impl Mmc3Revision {
    pub fn from_submapper(submapper_id: u8) -> Self {
        match submapper_id {
            3 => Mmc3Revision::McAcc,
            4 => Mmc3Revision::Nec,
            _ => Mmc3Revision::Sharp,
        }
    }

    fn policy(self) -> FiringPolicy {
        match self {
            Mmc3Revision::Nec => FiringPolicy::AlternateRevision,
            Mmc3Revision::Sharp | Mmc3Revision::McAcc => FiringPolicy::Default,
        }
    }

    fn clock_edge(self) -> ClockEdge {
        match self {
            Mmc3Revision::McAcc => ClockEdge::Fall,
            Mmc3Revision::Sharp | Mmc3Revision::Nec => ClockEdge::Rise,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapperKind {
    Mmc3(Mmc3Revision),
    Nfrom,
}

impl MapperKind {
    fn register_count(self) -> usize {
        match self {
            MapperKind::Mmc3(_) => MMC3_REGISTER_COUNT,
            MapperKind::Nfrom => NFROM_REGISTER_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperSnapshot {
    pub kind: MapperKind,
    pub registers: Vec<u8>,
    pub wram_enabled: bool,
    pub wram_write_protected: bool,
    pub irq: IrqSnapshot,
    pub a12: A12Snapshot,
}

/// Collaborators a register write may reconfigure.
pub struct CartBus<'a> {
    pub banking: &'a mut dyn MemoryBanking,
    pub irq: &'a mut dyn InterruptLine,
}

pub trait Mapper {
    fn kind(&self) -> MapperKind;
    fn layout(&self) -> BankLayout;
    /// Fills registers with power-on garbage and derives the bank mapping.
    fn power_on(&mut self, rng: &mut PowerOnRng, banking: &mut dyn MemoryBanking);
    fn write_register(&mut self, addr: u16, value: u8, bus: &mut CartBus<'_>);
    fn notify_ppu_addr(
        &mut self,
        addr: u16,
        frame_cycle: u32,
        irq: &mut dyn InterruptLine,
    ) -> A12Edge;
    /// PPU cycles per frame, used by the A12 watcher to measure low time
    /// across the frame wrap.
    fn set_frame_length(&mut self, frame_len: u32);
    /// Re-derives every bank selection and the RAM window from register state.
    fn sync_banks(&mut self, banking: &mut dyn MemoryBanking);
    fn irq_counter(&self) -> &ScanlineIrq;
    fn snapshot(&self) -> MapperSnapshot;
    /// Structural check only; never mutates.
    fn validate_snapshot(&self, snapshot: &MapperSnapshot) -> Result<()> {
        check_snapshot_shape(self.kind(), snapshot)
    }
    fn restore(&mut self, snapshot: &MapperSnapshot) -> Result<()>;
    fn debug_state(&self) -> String;
}

fn check_snapshot_shape(kind: MapperKind, snapshot: &MapperSnapshot) -> Result<()> {
    if snapshot.kind != kind {
        bail!(
            "state was saved from a {:?} board, cartridge is {:?}",
            snapshot.kind,
            kind
        );
    }
    ensure!(
        snapshot.registers.len() == kind.register_count(),
        "{:?} state carries {} register bytes, expected {}",
        kind,
        snapshot.registers.len(),
        kind.register_count()
    );
    Ok(())
}

pub fn mapper_name(mapper_id: u16, submapper_id: u8) -> &'static str {
    match (mapper_id, submapper_id) {
        (MAPPER_MMC3, 3) => "MMC3 (MC-ACC)",
        (MAPPER_MMC3, 4) => "MMC3A",
        (MAPPER_MMC3, _) => "MMC3",
        (MAPPER_NFROM, _) => "NFROM",
        _ => "Unsupported",
    }
}

/// Picks the board for a cartridge. This is the only place boards are
/// distinguished; everything downstream talks to `dyn Mapper`.
pub fn create_mapper(cart: &Cartridge, watcher: A12Watcher) -> Result<Box<dyn Mapper>> {
    let mapper: Box<dyn Mapper> = match cart.mapper_id {
        MAPPER_MMC3 => Box::new(Mapper4::new(
            Mmc3Revision::from_submapper(cart.submapper_id),
            cart.four_screen,
            watcher,
        )),
        MAPPER_NFROM => Box::new(Mapper404::new(watcher)),
        id => bail!("mapper {id} is not an MMC3-family board"),
    };
    Ok(mapper)
}

fn update_ram_map(banking: &mut dyn MemoryBanking, enabled: bool, write_protected: bool) {
    if enabled {
        let kind = if banking.has_battery() {
            PrgMemoryKind::SaveRam
        } else {
            PrgMemoryKind::WorkRam
        };
        let access = if write_protected {
            MemoryAccess::Read
        } else {
            MemoryAccess::ReadWrite
        };
        banking.set_cpu_window(WRAM_START, WRAM_END, kind, access);
    } else {
        banking.remove_cpu_window(WRAM_START, WRAM_END);
    }
}

const NFROM_REGISTER_COUNT: usize = 3;

/// NFROM board: one 32 KiB PRG window addressed by a 10-bit composite index,
/// one 8 KiB CHR window, and the MMC3 scanline IRQ.
pub struct Mapper404 {
    prg_low: u8,
    prg_high: u8,
    chr_bank: u8,
    wram_enabled: bool,
    wram_write_protected: bool,
    irq: ScanlineIrq,
    a12: A12Watcher,
}

impl Mapper404 {
    pub fn new(a12: A12Watcher) -> Self {
        Self {
            prg_low: 0,
            prg_high: 0,
            chr_bank: 0,
            wram_enabled: false,
            wram_write_protected: false,
            irq: ScanlineIrq::new(FiringPolicy::Default, ClockEdge::Rise),
            a12,
        }
    }

    pub fn prg_page(&self) -> u16 {
        self.prg_low as u16 | (self.prg_high as u16) << 8
    }

    fn select_prg_bank(&self, banking: &mut dyn MemoryBanking) {
        banking.select_prg_page(0, self.prg_page());
    }

    fn select_chr_bank(&self, banking: &mut dyn MemoryBanking) {
        banking.select_chr_page(0, self.chr_bank as u16);
    }

    pub fn write_prg_low(&mut self, value: u8, banking: &mut dyn MemoryBanking) {
        self.prg_low = value;
        self.select_prg_bank(banking);
    }

    pub fn write_prg_high(&mut self, value: u8, banking: &mut dyn MemoryBanking) {
        self.prg_high = value & 0x03;
        self.select_prg_bank(banking);
    }

    pub fn write_chr_select(&mut self, value: u8, banking: &mut dyn MemoryBanking) {
        self.chr_bank = value;
        self.select_chr_bank(banking);
    }

    /// bit 0: 0 vertical / 1 horizontal, bit 6: write-protect, bit 7: enable.
    pub fn write_ram_control(&mut self, value: u8, banking: &mut dyn MemoryBanking) {
        self.wram_enabled = value & 0x80 != 0;
        self.wram_write_protected = value & 0x40 != 0;
        banking.set_mirroring(if value & 0x01 != 0 {
            Mirroring::Horizontal
        } else {
            Mirroring::Vertical
        });
        update_ram_map(banking, self.wram_enabled, self.wram_write_protected);
    }
}

impl Mapper for Mapper404 {
    fn kind(&self) -> MapperKind {
        MapperKind::Nfrom
    }

    fn layout(&self) -> BankLayout {
        BankLayout {
            prg_page_size: 0x8000,
            chr_page_size: 0x2000,
            save_ram_size: 0x2000,
        }
    }

    fn power_on(&mut self, rng: &mut PowerOnRng, banking: &mut dyn MemoryBanking) {
        self.prg_low = rng.next_byte();
        self.prg_high = rng.next_byte() & 0x03;
        self.chr_bank = rng.next_byte();
        let reload_value = rng.next_byte();
        let counter = rng.next_byte();
        let enabled = rng.next_flag();
        self.wram_enabled = rng.next_flag();
        self.wram_write_protected = rng.next_flag();
        let reload_pending = rng.next_flag();
        self.irq.restore(&IrqSnapshot {
            reload_value,
            counter,
            reload_pending,
            enabled,
        });
        self.sync_banks(banking);
    }

    fn write_register(&mut self, addr: u16, value: u8, bus: &mut CartBus<'_>) {
        let Some(slot) = RegisterSlot::decode(addr) else {
            return;
        };
        match slot {
            RegisterSlot::Reg8000 => self.write_prg_low(value, bus.banking),
            RegisterSlot::Reg8001 => self.write_prg_high(value, bus.banking),
            RegisterSlot::RegA000 => self.write_chr_select(value, bus.banking),
            RegisterSlot::RegA001 => self.write_ram_control(value, bus.banking),
            RegisterSlot::RegC000 => self.irq.write_latch(value),
            RegisterSlot::RegC001 => self.irq.write_reload(),
            RegisterSlot::RegE000 => self.irq.disable(bus.irq),
            RegisterSlot::RegE001 => self.irq.enable(),
        }
    }

    fn notify_ppu_addr(
        &mut self,
        addr: u16,
        frame_cycle: u32,
        irq: &mut dyn InterruptLine,
    ) -> A12Edge {
        let edge = self.a12.observe(addr, frame_cycle);
        self.irq.clock(edge, irq);
        edge
    }

    fn set_frame_length(&mut self, frame_len: u32) {
        self.a12.set_frame_len(frame_len);
    }

    fn sync_banks(&mut self, banking: &mut dyn MemoryBanking) {
        self.select_chr_bank(banking);
        self.select_prg_bank(banking);
        update_ram_map(banking, self.wram_enabled, self.wram_write_protected);
    }

    fn irq_counter(&self) -> &ScanlineIrq {
        &self.irq
    }

    fn snapshot(&self) -> MapperSnapshot {
        MapperSnapshot {
            kind: self.kind(),
            registers: vec![self.prg_low, self.prg_high, self.chr_bank],
            wram_enabled: self.wram_enabled,
            wram_write_protected: self.wram_write_protected,
            irq: self.irq.snapshot(),
            a12: self.a12.snapshot(),
        }
    }

    fn validate_snapshot(&self, snapshot: &MapperSnapshot) -> Result<()> {
        check_snapshot_shape(self.kind(), snapshot)?;
        ensure!(
            snapshot.registers[1] <= 0x03,
            "NFROM high bank bits out of range: ${:02X}",
            snapshot.registers[1]
        );
        Ok(())
    }

    fn restore(&mut self, snapshot: &MapperSnapshot) -> Result<()> {
        self.validate_snapshot(snapshot)?;
        self.prg_low = snapshot.registers[0];
        self.prg_high = snapshot.registers[1];
        self.chr_bank = snapshot.registers[2];
        self.wram_enabled = snapshot.wram_enabled;
        self.wram_write_protected = snapshot.wram_write_protected;
        self.irq.restore(&snapshot.irq);
        self.a12.restore(&snapshot.a12);
        Ok(())
    }

    fn debug_state(&self) -> String {
        format!(
            "NFROM prg=${:03X} chr=${:02X} wram_en={} wram_wp={} irq_latch=${:02X} irq_counter=${:02X} reload={} en={}",
            self.prg_page(),
            self.chr_bank,
            self.wram_enabled,
            self.wram_write_protected,
            self.irq.reload_value(),
            self.irq.counter(),
            self.irq.reload_pending(),
            self.irq.enabled()
        )
    }
}

const MMC3_REGISTER_COUNT: usize = 10;

/// MMC3: 8 KiB PRG and 1 KiB CHR granularity selected through the
/// `$8000/$8001` index/data pair.
pub struct Mapper4 {
    revision: Mmc3Revision,
    four_screen: bool,
    bank_select: u8,
    bank_regs: [u8; 8],
    mirroring_reg: u8,
    wram_enabled: bool,
    wram_write_protected: bool,
    irq: ScanlineIrq,
    a12: A12Watcher,
}

impl Mapper4 {
    pub fn new(revision: Mmc3Revision, four_screen: bool, a12: A12Watcher) -> Self {
        Self {
            revision,
            four_screen,
            bank_select: 0,
            bank_regs: [0; 8],
            mirroring_reg: 0,
            wram_enabled: false,
            wram_write_protected: false,
            irq: ScanlineIrq::new(revision.policy(), revision.clock_edge()),
            a12,
        }
    }

    pub fn revision(&self) -> Mmc3Revision {
        self.revision
    }

    fn select_prg_banks(&self, banking: &mut dyn MemoryBanking) {
        let count = banking.prg_page_count();
        let second_last = count.saturating_sub(2) as u16;
        let last = count.saturating_sub(1) as u16;
        let r6 = self.bank_regs[6] as u16;
        let r7 = self.bank_regs[7] as u16;

        let pages = if self.bank_select & 0x40 == 0 {
            [r6, r7, second_last, last]
        } else {
            [second_last, r7, r6, last]
        };
        for (slot, page) in pages.into_iter().enumerate() {
            banking.select_prg_page(slot, page);
        }
    }

    fn select_chr_banks(&self, banking: &mut dyn MemoryBanking) {
        let r0 = self.bank_regs[0] & 0xFE;
        let r1 = self.bank_regs[1] & 0xFE;
        let [_, _, r2, r3, r4, r5, _, _] = self.bank_regs;

        let pages = if self.bank_select & 0x80 == 0 {
            [r0, r0 | 1, r1, r1 | 1, r2, r3, r4, r5]
        } else {
            [r2, r3, r4, r5, r0, r0 | 1, r1, r1 | 1]
        };
        for (slot, page) in pages.into_iter().enumerate() {
            banking.select_chr_page(slot, page as u16);
        }
    }

    fn apply_mirroring(&self, banking: &mut dyn MemoryBanking) {
        if !self.four_screen {
            banking.set_mirroring(if self.mirroring_reg & 0x01 != 0 {
                Mirroring::Horizontal
            } else {
                Mirroring::Vertical
            });
        }
    }

    pub fn write_bank_select(&mut self, value: u8, banking: &mut dyn MemoryBanking) {
        self.bank_select = value;
        self.select_prg_banks(banking);
        self.select_chr_banks(banking);
    }

    pub fn write_bank_data(&mut self, value: u8, banking: &mut dyn MemoryBanking) {
        let target = (self.bank_select & 0x07) as usize;
        self.bank_regs[target] = value;
        if target >= 6 {
            self.select_prg_banks(banking);
        } else {
            self.select_chr_banks(banking);
        }
    }

    pub fn write_mirroring(&mut self, value: u8, banking: &mut dyn MemoryBanking) {
        self.mirroring_reg = value;
        self.apply_mirroring(banking);
    }

    pub fn write_prg_ram_protect(&mut self, value: u8, banking: &mut dyn MemoryBanking) {
        self.wram_enabled = value & 0x80 != 0;
        self.wram_write_protected = value & 0x40 != 0;
        update_ram_map(banking, self.wram_enabled, self.wram_write_protected);
    }
}

impl Mapper for Mapper4 {
    fn kind(&self) -> MapperKind {
        MapperKind::Mmc3(self.revision)
    }

    fn layout(&self) -> BankLayout {
        BankLayout {
            prg_page_size: 0x2000,
            chr_page_size: 0x0400,
            save_ram_size: 0x2000,
        }
    }

    fn power_on(&mut self, rng: &mut PowerOnRng, banking: &mut dyn MemoryBanking) {
        self.bank_select = rng.next_byte();
        for reg in &mut self.bank_regs {
            *reg = rng.next_byte();
        }
        self.mirroring_reg = rng.next_byte() & 0x01;
        let reload_value = rng.next_byte();
        let counter = rng.next_byte();
        let enabled = rng.next_flag();
        self.wram_enabled = rng.next_flag();
        self.wram_write_protected = rng.next_flag();
        let reload_pending = rng.next_flag();
        self.irq.restore(&IrqSnapshot {
            reload_value,
            counter,
            reload_pending,
            enabled,
        });
        self.sync_banks(banking);
    }

    fn write_register(&mut self, addr: u16, value: u8, bus: &mut CartBus<'_>) {
        let Some(slot) = RegisterSlot::decode(addr) else {
            return;
        };
        match slot {
            RegisterSlot::Reg8000 => self.write_bank_select(value, bus.banking),
            RegisterSlot::Reg8001 => self.write_bank_data(value, bus.banking),
            RegisterSlot::RegA000 => self.write_mirroring(value, bus.banking),
            RegisterSlot::RegA001 => self.write_prg_ram_protect(value, bus.banking),
            RegisterSlot::RegC000 => self.irq.write_latch(value),
            RegisterSlot::RegC001 => self.irq.write_reload(),
            RegisterSlot::RegE000 => self.irq.disable(bus.irq),
            RegisterSlot::RegE001 => self.irq.enable(),
        }
    }

    fn notify_ppu_addr(
        &mut self,
        addr: u16,
        frame_cycle: u32,
        irq: &mut dyn InterruptLine,
    ) -> A12Edge {
        let edge = self.a12.observe(addr, frame_cycle);
        self.irq.clock(edge, irq);
        edge
    }

    fn set_frame_length(&mut self, frame_len: u32) {
        self.a12.set_frame_len(frame_len);
    }

    fn sync_banks(&mut self, banking: &mut dyn MemoryBanking) {
        self.select_chr_banks(banking);
        self.select_prg_banks(banking);
        self.apply_mirroring(banking);
        update_ram_map(banking, self.wram_enabled, self.wram_write_protected);
    }

    fn irq_counter(&self) -> &ScanlineIrq {
        &self.irq
    }

    fn snapshot(&self) -> MapperSnapshot {
        let mut registers = Vec::with_capacity(MMC3_REGISTER_COUNT);
        registers.push(self.bank_select);
        registers.extend_from_slice(&self.bank_regs);
        registers.push(self.mirroring_reg);
        MapperSnapshot {
            kind: self.kind(),
            registers,
            wram_enabled: self.wram_enabled,
            wram_write_protected: self.wram_write_protected,
            irq: self.irq.snapshot(),
            a12: self.a12.snapshot(),
        }
    }

    fn restore(&mut self, snapshot: &MapperSnapshot) -> Result<()> {
        self.validate_snapshot(snapshot)?;
        self.bank_select = snapshot.registers[0];
        self.bank_regs.copy_from_slice(&snapshot.registers[1..9]);
        self.mirroring_reg = snapshot.registers[9];
        self.wram_enabled = snapshot.wram_enabled;
        self.wram_write_protected = snapshot.wram_write_protected;
        self.irq.restore(&snapshot.irq);
        self.a12.restore(&snapshot.a12);
        Ok(())
    }

    fn debug_state(&self) -> String {
        format!(
            "{:?} bank_select=${:02X} prg=[{:02X},{:02X}] chr=[{:02X},{:02X},{:02X},{:02X},{:02X},{:02X}] irq_latch=${:02X} irq_counter=${:02X} reload={} en={}",
            self.revision,
            self.bank_select,
            self.bank_regs[6],
            self.bank_regs[7],
            self.bank_regs[0],
            self.bank_regs[1],
            self.bank_regs[2],
            self.bank_regs[3],
            self.bank_regs[4],
            self.bank_regs[5],
            self.irq.reload_value(),
            self.irq.counter(),
            self.irq.reload_pending(),
            self.irq.enabled()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::banking::BankedMemory;
    use crate::nes::irq::CpuIrqLine;

    struct Rig {
        mapper: Box<dyn Mapper>,
        memory: BankedMemory,
        line: CpuIrqLine,
    }

    impl Rig {
        fn new(cart: Cartridge) -> Self {
            let mut mapper = create_mapper(&cart, A12Watcher::default()).expect("supported board");
            let mut memory = BankedMemory::new(cart, mapper.layout());
            mapper.power_on(&mut PowerOnRng::new(7), &mut memory);
            Self {
                mapper,
                memory,
                line: CpuIrqLine::new(),
            }
        }

        fn write(&mut self, addr: u16, value: u8) {
            let mut bus = CartBus {
                banking: &mut self.memory,
                irq: &mut self.line,
            };
            self.mapper.write_register(addr, value, &mut bus);
        }

        // One scanline's worth of A12: low long enough, then a rise.
        fn scanline(&mut self, line: u32) -> A12Edge {
            let base = line * 341;
            self.mapper.notify_ppu_addr(0x0000, base, &mut self.line);
            self.mapper.notify_ppu_addr(0x1000, base + 260, &mut self.line)
        }
    }

    fn nfrom() -> Rig {
        Rig::new(Cartridge::synthetic(MAPPER_NFROM, 0, 8 * 0x8000, 4 * 0x2000))
    }

    #[test]
    fn decode_folds_aliases_onto_canonical_slots() {
        assert_eq!(RegisterSlot::decode(0x8000), Some(RegisterSlot::Reg8000));
        assert_eq!(RegisterSlot::decode(0x9FFE), Some(RegisterSlot::Reg8000));
        assert_eq!(RegisterSlot::decode(0x9FFF), Some(RegisterSlot::Reg8001));
        assert_eq!(RegisterSlot::decode(0xBF13), Some(RegisterSlot::RegA001));
        assert_eq!(RegisterSlot::decode(0xC7F2), Some(RegisterSlot::RegC000));
        assert_eq!(RegisterSlot::decode(0xFFFF), Some(RegisterSlot::RegE001));
        assert_eq!(RegisterSlot::decode(0x7FFF), None);

        for slot in RegisterSlot::ALL {
            assert_eq!(RegisterSlot::decode(slot.base_address()), Some(slot));
        }
    }

    #[test]
    fn power_on_is_reproducible_for_a_seed() {
        let a = nfrom();
        let b = nfrom();
        assert_eq!(a.mapper.snapshot(), b.mapper.snapshot());
        assert_eq!(a.memory.prg_page(0), b.memory.prg_page(0));

        let mut rng = PowerOnRng::new(8);
        let mut c = nfrom();
        c.mapper.power_on(&mut rng, &mut c.memory);
        assert_ne!(a.mapper.snapshot().registers, c.mapper.snapshot().registers);
    }

    #[test]
    fn nfrom_composes_prg_page_from_low_and_high() {
        let mut rig = nfrom();
        rig.write(0x8000, 0x05);
        rig.write(0x8001, 0xFE);

        let snap = rig.mapper.snapshot();
        assert_eq!(snap.registers[..2], [0x05, 0x02]);
        // Page $205 wraps onto the eight 32 KiB pages of this cart; the
        // synthetic image tags every 8 KiB chunk, so page 5 starts at chunk 20.
        assert_eq!(rig.memory.prg_page(0), Some(0x205 % 8));
        assert_eq!(rig.memory.cpu_read(0x8000), Some(21));
    }

    #[test]
    fn nfrom_chr_select_switches_eight_kilobyte_page() {
        let mut rig = nfrom();
        rig.write(0xA000, 0x02);
        assert_eq!(rig.memory.chr_page(0), Some(2));
        assert_eq!(rig.memory.ppu_read(0x0000), 17);
        assert_eq!(rig.memory.ppu_read(0x1FFF), 24);
    }

    #[test]
    fn nfrom_ram_control_maps_window_and_mirroring() {
        let mut rig = nfrom();

        rig.write(0xA001, 0x80);
        assert_eq!(
            rig.memory.cpu_window(),
            Some((PrgMemoryKind::WorkRam, MemoryAccess::ReadWrite))
        );
        assert_eq!(rig.memory.mirroring(), Mirroring::Vertical);
        assert!(rig.memory.cpu_write(0x6123, 0x42));

        rig.write(0xA001, 0xC1);
        assert_eq!(
            rig.memory.cpu_window(),
            Some((PrgMemoryKind::WorkRam, MemoryAccess::Read))
        );
        assert_eq!(rig.memory.mirroring(), Mirroring::Horizontal);
        assert!(!rig.memory.cpu_write(0x6123, 0x00));
        assert_eq!(rig.memory.cpu_read(0x6123), Some(0x42));

        rig.write(0xA001, 0x00);
        assert_eq!(rig.memory.cpu_window(), None);
    }

    #[test]
    fn battery_carts_map_save_ram() {
        let mut cart = Cartridge::synthetic(MAPPER_NFROM, 0, 0x8000, 0x2000);
        cart.has_battery_backed_ram = true;
        let mut rig = Rig::new(cart);
        rig.write(0xA001, 0x80);
        assert_eq!(
            rig.memory.cpu_window(),
            Some((PrgMemoryKind::SaveRam, MemoryAccess::ReadWrite))
        );
    }

    #[test]
    fn rewriting_the_same_value_is_idempotent() {
        let mut rig = nfrom();
        rig.write(0x8000, 0x03);
        rig.write(0xA000, 0x01);
        let before = (rig.mapper.snapshot(), rig.memory.prg_page(0), rig.memory.chr_page(0));

        rig.write(0x8000, 0x03);
        rig.write(0xA000, 0x01);
        let after = (rig.mapper.snapshot(), rig.memory.prg_page(0), rig.memory.chr_page(0));
        assert_eq!(before, after);
    }

    #[test]
    fn irq_slots_drive_counter_and_line() {
        let mut rig = nfrom();
        rig.write(0xE000, 0x00);
        rig.write(0xC000, 0x02);
        rig.write(0xC001, 0x00);
        assert_eq!(rig.mapper.irq_counter().counter(), 0);
        assert!(rig.mapper.irq_counter().reload_pending());
        rig.write(0xE001, 0x00);

        assert_eq!(rig.scanline(0), A12Edge::Rise);
        assert_eq!(rig.mapper.irq_counter().counter(), 2);
        rig.scanline(1);
        assert!(!rig.line.asserted());
        rig.scanline(2);
        assert!(rig.line.asserted());

        rig.write(0xE000, 0x00);
        assert!(!rig.line.asserted());
        assert!(!rig.mapper.irq_counter().enabled());
    }

    #[test]
    fn mmc3_prg_modes_swap_fixed_window() {
        let mut rig = Rig::new(Cartridge::synthetic(MAPPER_MMC3, 0, 16 * 0x2000, 8 * 0x0400));
        rig.write(0x8000, 0x06);
        rig.write(0x8001, 0x03);
        rig.write(0x8000, 0x07);
        rig.write(0x8001, 0x04);

        assert_eq!(rig.memory.cpu_read(0x8000), Some(4));
        assert_eq!(rig.memory.cpu_read(0xA000), Some(5));
        assert_eq!(rig.memory.cpu_read(0xC000), Some(15));
        assert_eq!(rig.memory.cpu_read(0xE000), Some(16));

        rig.write(0x8000, 0x46);
        assert_eq!(rig.memory.cpu_read(0x8000), Some(15));
        assert_eq!(rig.memory.cpu_read(0xC000), Some(4));
    }

    #[test]
    fn mmc3_chr_inversion_moves_two_kilobyte_banks() {
        let mut rig = Rig::new(Cartridge::synthetic(MAPPER_MMC3, 0, 4 * 0x2000, 16 * 0x0400));
        rig.write(0x8000, 0x00);
        rig.write(0x8001, 0x05);
        rig.write(0x8000, 0x02);
        rig.write(0x8001, 0x09);

        assert_eq!(rig.memory.ppu_read(0x0000), 5);
        assert_eq!(rig.memory.ppu_read(0x0400), 6);
        assert_eq!(rig.memory.ppu_read(0x1000), 10);

        rig.write(0x8000, 0x80);
        assert_eq!(rig.memory.ppu_read(0x1000), 5);
        assert_eq!(rig.memory.ppu_read(0x0000), 10);
    }

    #[test]
    fn mmc3_four_screen_ignores_mirroring_writes() {
        let mut cart = Cartridge::synthetic(MAPPER_MMC3, 0, 4 * 0x2000, 8 * 0x0400);
        cart.four_screen = true;
        let mut rig = Rig::new(cart);
        rig.write(0xA000, 0x01);
        assert_eq!(rig.memory.mirroring(), Mirroring::FourScreen);
    }

    #[test]
    fn submapper_selects_revision_behaviour() {
        let mut cart = Cartridge::synthetic(MAPPER_MMC3, 4, 4 * 0x2000, 8 * 0x0400);
        let rig = Rig::new(cart.clone());
        assert_eq!(rig.mapper.kind(), MapperKind::Mmc3(Mmc3Revision::Nec));
        assert_eq!(
            rig.mapper.irq_counter().policy(),
            FiringPolicy::AlternateRevision
        );

        cart.submapper_id = 3;
        let rig = Rig::new(cart);
        assert_eq!(rig.mapper.irq_counter().clock_edge(), ClockEdge::Fall);
    }

    #[test]
    fn restore_rejects_foreign_board_state() {
        let nfrom_rig = nfrom();
        let mut mmc3 = Rig::new(Cartridge::synthetic(MAPPER_MMC3, 0, 4 * 0x2000, 8 * 0x0400));
        let before = mmc3.mapper.snapshot();

        assert!(mmc3.mapper.restore(&nfrom_rig.mapper.snapshot()).is_err());
        assert_eq!(mmc3.mapper.snapshot(), before);

        let mut short = before.clone();
        short.registers.pop();
        assert!(mmc3.mapper.restore(&short).is_err());
    }

    #[test]
    fn unsupported_mapper_is_an_error() {
        let cart = Cartridge::synthetic(1, 0, 0x8000, 0x2000);
        assert!(create_mapper(&cart, A12Watcher::default()).is_err());
    }
}
