use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::nes::a12::DEFAULT_DEGLITCH_CYCLES;
use crate::nes::filters::FilterConfig;
use crate::nes::mixer::{ExpansionAudio, MAX_CHANNEL_COUNT, NesModel};

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Mixer configuration. Changing it on a live mixer takes effect at the next
/// cycle boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub model: NesModel,
    pub sample_rate: u32,
    /// Square1, Square2, Triangle, Noise, DMC, expansion.
    pub volumes: [f64; MAX_CHANNEL_COUNT],
    pub expansion: ExpansionAudio,
    pub filters: FilterConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            model: NesModel::Ntsc,
            sample_rate: DEFAULT_SAMPLE_RATE,
            volumes: [1.0; MAX_CHANNEL_COUNT],
            expansion: ExpansionAudio::None,
            filters: FilterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub power_on_seed: u64,
    pub a12_deglitch_cycles: u32,
    pub audio: AudioConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            power_on_seed: 0,
            a12_deglitch_cycles: DEFAULT_DEGLITCH_CYCLES,
            audio: AudioConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("failed to parse config: {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("config is not valid JSON for CoreConfig")
    }
}
