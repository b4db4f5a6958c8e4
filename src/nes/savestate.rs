//! Save-state container.
//!
//! A state holds everything the cartridge and mixer need to resume exactly:
//! mapper registers and IRQ counter, A12 watcher, cartridge RAM, the CPU
//! interrupt line and the full audio pipeline. ROM contents are not included
//! and must be loaded separately.
//!
//! States are JSON (`serde_json`) with a magic string and a format version;
//! binary RAM images are base64 strings inside the memory section.

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use super::banking::MemorySnapshot;
use super::irq::CpuIrqLine;
use super::mapper::MapperSnapshot;
use super::mixer::MixerSnapshot;

pub const SAVESTATE_MAGIC: &str = "CARTMIX-STATE";

/// Bump on any incompatible layout change.
pub const SAVESTATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveState {
    pub magic: String,
    pub version: u32,
    pub mapper: MapperSnapshot,
    pub memory: MemorySnapshot,
    pub irq_line: CpuIrqLine,
    pub mixer: MixerSnapshot,
}

impl SaveState {
    pub fn new(
        mapper: MapperSnapshot,
        memory: MemorySnapshot,
        irq_line: CpuIrqLine,
        mixer: MixerSnapshot,
    ) -> Self {
        Self {
            magic: SAVESTATE_MAGIC.to_string(),
            version: SAVESTATE_VERSION,
            mapper,
            memory,
            irq_line,
            mixer,
        }
    }

    pub fn check_header(&self) -> Result<()> {
        ensure!(
            self.magic == SAVESTATE_MAGIC,
            "not a save state (magic {:?})",
            self.magic
        );
        ensure!(
            self.version == SAVESTATE_VERSION,
            "unsupported save state version {} (expected {})",
            self.version,
            SAVESTATE_VERSION
        );
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to serialize save state")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let state: Self = serde_json::from_slice(bytes).context("failed to parse save state")?;
        state.check_header()?;
        Ok(state)
    }
}
