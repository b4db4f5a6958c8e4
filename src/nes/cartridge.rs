use anyhow::{Context, Result, bail, ensure};
use std::{fs, path::Path};

use super::mapper::Mirroring;

const HEADER_LEN: usize = 16;
const TRAINER_LEN: usize = 512;
const PRG_UNIT: usize = 16 * 1024;
const CHR_UNIT: usize = 8 * 1024;
const RAM_UNIT: usize = 8 * 1024;

const SYNTHETIC_PRG_CHUNK: usize = 0x2000;
const SYNTHETIC_CHR_CHUNK: usize = 0x0400;

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u16,
    pub submapper_id: u8,
    pub mirroring: Mirroring,
    pub four_screen: bool,
    pub has_battery_backed_ram: bool,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
    pub prg_ram_size: usize,
}

/// Fields decoded from the 16-byte iNES / NES 2.0 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    mapper_id: u16,
    submapper_id: u8,
    mirroring: Mirroring,
    four_screen: bool,
    battery: bool,
    trainer: bool,
    prg_rom_size: usize,
    chr_rom_size: usize,
    prg_ram_size: usize,
}

impl Header {
    fn parse(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= HEADER_LEN,
            "ROM is too small to contain an iNES header"
        );
        ensure!(
            &bytes[0..4] == b"NES\x1A",
            "invalid iNES header magic, expected NES<EOF>"
        );

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let nes2 = flags7 & 0x0C == 0x08;

        let mapper_low = (flags6 as u16) >> 4 | (flags7 as u16) & 0xF0;
        let (mapper_id, submapper_id) = if nes2 {
            (mapper_low | ((bytes[8] as u16) & 0x0F) << 8, bytes[8] >> 4)
        } else {
            (mapper_low, 0)
        };

        let four_screen = flags6 & 0x08 != 0;
        let mirroring = match (four_screen, flags6 & 0x01 != 0) {
            (true, _) => Mirroring::FourScreen,
            (false, true) => Mirroring::Vertical,
            (false, false) => Mirroring::Horizontal,
        };

        let (prg_rom_size, chr_rom_size, prg_ram_size) = if nes2 {
            Self::nes2_sizes(bytes)?
        } else {
            let prg_ram_units = bytes[8].max(1) as usize;
            (
                (bytes[4] as usize).max(1) * PRG_UNIT,
                bytes[5] as usize * CHR_UNIT,
                prg_ram_units * RAM_UNIT,
            )
        };

        Ok(Self {
            mapper_id,
            submapper_id,
            mirroring,
            four_screen,
            battery: flags6 & 0x02 != 0,
            trainer: flags6 & 0x04 != 0,
            prg_rom_size,
            chr_rom_size,
            prg_ram_size,
        })
    }

    fn nes2_sizes(bytes: &[u8]) -> Result<(usize, usize, usize)> {
        let prg_msb = (bytes[9] & 0x0F) as usize;
        let chr_msb = (bytes[9] >> 4) as usize;
        if prg_msb == 0x0F || chr_msb == 0x0F {
            bail!("NES 2.0 exponent-multiplier ROM sizes are not supported");
        }

        let prg_units = (prg_msb << 8 | bytes[4] as usize).max(1);
        let chr_units = chr_msb << 8 | bytes[5] as usize;
        let ram_shift = bytes[10] & 0x0F;
        let prg_ram = if ram_shift == 0 {
            RAM_UNIT
        } else {
            64usize << ram_shift
        };
        Ok((prg_units * PRG_UNIT, chr_units * CHR_UNIT, prg_ram))
    }
}

fn take<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize, what: &str) -> Result<&'a [u8]> {
    let end = *cursor + len;
    let Some(slice) = bytes.get(*cursor..end) else {
        bail!("ROM truncated: expected {len} {what} bytes but file ended early");
    };
    *cursor = end;
    Ok(slice)
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("failed to parse ROM: {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = Header::parse(bytes)?;

        let mut cursor = HEADER_LEN;
        if header.trainer {
            take(bytes, &mut cursor, TRAINER_LEN, "trainer")?;
        }
        let prg_rom = take(bytes, &mut cursor, header.prg_rom_size, "PRG")?.to_vec();
        let (chr_data, chr_is_ram) = if header.chr_rom_size == 0 {
            (vec![0; CHR_UNIT], true)
        } else {
            (
                take(bytes, &mut cursor, header.chr_rom_size, "CHR")?.to_vec(),
                false,
            )
        };

        Ok(Self {
            mapper_id: header.mapper_id,
            submapper_id: header.submapper_id,
            mirroring: header.mirroring,
            four_screen: header.four_screen,
            has_battery_backed_ram: header.battery,
            prg_rom,
            chr_data,
            chr_is_ram,
            prg_ram_size: header.prg_ram_size,
        })
    }

    /// Builds a header-less cartridge whose ROM contents identify their own
    /// location: every 8 KiB PRG chunk and every 1 KiB CHR chunk is filled
    /// with its chunk index plus one. Used by trace scripts and tests.
    pub fn synthetic(mapper_id: u16, submapper_id: u8, prg_size: usize, chr_size: usize) -> Self {
        let tag = |size: usize, chunk: usize| -> Vec<u8> {
            (0..size.max(chunk))
                .map(|i| (i / chunk + 1) as u8)
                .collect()
        };
        Self {
            mapper_id,
            submapper_id,
            mirroring: Mirroring::Horizontal,
            four_screen: false,
            has_battery_backed_ram: false,
            prg_rom: tag(prg_size, SYNTHETIC_PRG_CHUNK),
            chr_data: tag(chr_size, SYNTHETIC_CHR_CHUNK),
            chr_is_ram: false,
            prg_ram_size: RAM_UNIT,
        }
    }
}
