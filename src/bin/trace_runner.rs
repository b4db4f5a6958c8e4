use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use cartmix::audio::{AudioContext, CaptureDevice};
use cartmix::config::CoreConfig;
use cartmix::nes::Console;
use cartmix::nes::cartridge::Cartridge;
use cartmix::nes::irq::IrqPhase;
use cartmix::nes::mixer::{AudioChannel, CYCLE_LENGTH};
use cartmix::nes::savestate::SaveState;
use serde::Deserialize;
use sha1::{Digest, Sha1};

const SCANLINE_CYCLES: u32 = 341;
// Sprite pattern fetches start at dot 257; A12 goes high a few dots later.
const SPRITE_FETCH_DOT: u32 = 260;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Script {
    rom: Option<PathBuf>,
    #[serde(default = "default_mapper")]
    mapper: u16,
    #[serde(default)]
    submapper: u8,
    #[serde(default = "default_prg_size")]
    prg_size: usize,
    #[serde(default = "default_chr_size")]
    chr_size: usize,
    config: Option<CoreConfig>,
    ops: Vec<Op>,
}

fn default_mapper() -> u16 {
    404
}

fn default_prg_size() -> usize {
    8 * 0x8000
}

fn default_chr_size() -> usize {
    4 * 0x2000
}

fn default_boundary() -> u32 {
    CYCLE_LENGTH
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op {
    CpuWrite {
        addr: u16,
        value: u8,
    },
    Ppu {
        addr: u16,
        cycle: u32,
    },
    /// Emits one background-low / sprite-high A12 pattern per line.
    Scanlines {
        count: u32,
    },
    Delta {
        channel: AudioChannel,
        time: u32,
        delta: i16,
    },
    EndCycle {
        #[serde(default = "default_boundary")]
        boundary: u32,
    },
    SampleRate {
        rate: u32,
    },
    Flush,
    ResetAudio,
    Save {
        slot: String,
    },
    Load {
        slot: String,
    },
}

#[derive(Debug, Clone, Default)]
struct Config {
    script: Option<PathBuf>,
    config: Option<PathBuf>,
    state_out: bool,
    events: usize,
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--script" => {
                let value = args
                    .next()
                    .context("--script requires a path, e.g. --script traces/nfrom_irq.json")?;
                cfg.script = Some(PathBuf::from(value));
            }
            "--config" => {
                let value = args
                    .next()
                    .context("--config requires a path, e.g. --config cartmix.json")?;
                cfg.config = Some(PathBuf::from(value));
            }
            "--events" => {
                let value = args
                    .next()
                    .context("--events requires an integer, e.g. --events 20")?;
                cfg.events = value
                    .parse()
                    .with_context(|| format!("invalid --events value: {value}"))?;
            }
            "--state-out" => cfg.state_out = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
        }
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "Cartridge/mixer trace runner\n\n\
Usage:\n\
  cargo run --bin trace_runner -- --script <path> [options]\n\n\
Options:\n\
  --script <path>                JSON trace script to replay\n\
  --config <path>                CoreConfig JSON (overrides the script's config)\n\
  --events <n>                   Print the last n console debug events\n\
  --state-out                    Print the final save state as base64\n\
  -h, --help                     Show this help\n"
    );
}

fn hash_pcm(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    BASE64_STANDARD.encode(Sha1::digest(&bytes))
}

fn phase_label(phase: IrqPhase) -> &'static str {
    match phase {
        IrqPhase::Idle => "idle",
        IrqPhase::Armed => "armed",
        IrqPhase::Asserted => "asserted",
    }
}

struct Runner {
    console: Console,
    audio: AudioContext,
    slots: HashMap<String, SaveState>,
    frame_len: u32,
    next_line: u32,
    last_trace: (u8, bool),
}

impl Runner {
    fn trace_irq(&mut self, index: usize) {
        let counter = self.console.irq_counter().counter();
        let asserted = self.console.irq_asserted();
        if (counter, asserted) != self.last_trace {
            println!(
                "op {index:>4}: irq counter={counter:>3} {}",
                phase_label(self.console.irq_phase())
            );
            self.last_trace = (counter, asserted);
        }
    }

    fn run(&mut self, index: usize, op: &Op) -> Result<()> {
        match op {
            Op::CpuWrite { addr, value } => self.console.cpu_write(*addr, *value),
            Op::Ppu { addr, cycle } => {
                self.console.ppu_bus_address(*addr, *cycle % self.frame_len);
            }
            Op::Scanlines { count } => {
                for _ in 0..*count {
                    let base = (self.next_line * SCANLINE_CYCLES) % self.frame_len;
                    self.console.ppu_bus_address(0x0000, base);
                    self.console
                        .ppu_bus_address(0x1000, (base + SPRITE_FETCH_DOT) % self.frame_len);
                    self.next_line = (self.next_line + 1) % (self.frame_len / SCANLINE_CYCLES);
                    self.trace_irq(index);
                }
            }
            Op::Delta {
                channel,
                time,
                delta,
            } => self.console.add_audio_delta(*channel, *time, *delta),
            Op::EndCycle { boundary } => self.console.end_audio_cycle(*boundary),
            Op::SampleRate { rate } => self.console.mixer_mut().set_sample_rate(*rate),
            Op::Flush => self.console.flush_audio(&mut self.audio),
            Op::ResetAudio => self.console.reset_audio(),
            Op::Save { slot } => {
                self.slots.insert(slot.clone(), self.console.save_state());
            }
            Op::Load { slot } => {
                let state = self
                    .slots
                    .get(slot)
                    .with_context(|| format!("op {index}: no state saved in slot {slot:?}"))?;
                self.console
                    .load_state(state)
                    .with_context(|| format!("op {index}: load from slot {slot:?} failed"))?;
            }
        }
        self.trace_irq(index);
        Ok(())
    }
}

fn main() -> Result<()> {
    let cfg = parse_args()?;
    let Some(script_path) = cfg.script.as_ref() else {
        print_help();
        bail!("--script is required");
    };

    let text = fs::read_to_string(script_path)
        .with_context(|| format!("failed to read script: {}", script_path.display()))?;
    let script: Script = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse script: {}", script_path.display()))?;

    let core = match &cfg.config {
        Some(path) => CoreConfig::from_file(path)?,
        None => script.config.clone().unwrap_or_default(),
    };
    let cart = match &script.rom {
        Some(path) => Cartridge::from_file(path)?,
        None => Cartridge::synthetic(
            script.mapper,
            script.submapper,
            script.prg_size,
            script.chr_size,
        ),
    };

    let console = Console::new(cart, &core)?;
    println!("Running {} op(s) on {}", script.ops.len(), console.mapper_name());

    let (device, capture) = CaptureDevice::new();
    let mut audio = AudioContext::new();
    audio.register_device(Box::new(device));

    let mut runner = Runner {
        last_trace: (
            console.irq_counter().counter(),
            console.irq_asserted(),
        ),
        console,
        audio,
        slots: HashMap::new(),
        frame_len: core.audio.model.ppu_frame_cycles(),
        next_line: 0,
    };

    for (index, op) in script.ops.iter().enumerate() {
        runner.run(index, op)?;
    }
    runner.console.flush_audio(&mut runner.audio);

    let pcm = capture.samples();
    println!("mapper: {}", runner.console.debug_mapper_state());
    println!(
        "pcm: {} frame(s) @ {} Hz, sha1 {}",
        pcm.len() / 2,
        runner.console.mixer().sample_rate(),
        hash_pcm(&pcm)
    );

    if cfg.events > 0 {
        for event in runner.console.debug_recent_events(cfg.events).iter().rev() {
            println!("event: {event}");
        }
    }
    if cfg.state_out {
        let bytes = runner.console.save_state_bytes()?;
        println!("state: {}", BASE64_STANDARD.encode(bytes));
    }

    runner.audio.teardown();
    Ok(())
}
