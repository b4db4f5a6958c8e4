pub mod a12;
pub mod banking;
pub mod blip;
pub mod cartridge;
pub mod filters;
pub mod irq;
pub mod mapper;
pub mod mixer;
pub mod savestate;

use anyhow::{Context, Result};
use std::{collections::VecDeque, path::Path};

use crate::audio::AudioContext;
use crate::config::CoreConfig;
use a12::{A12Edge, A12Watcher};
use banking::BankedMemory;
use cartridge::Cartridge;
use irq::{CpuIrqLine, IrqPhase, ScanlineIrq};
use mapper::{CartBus, Mapper, Mirroring, PowerOnRng, create_mapper, mapper_name};
use mixer::{AudioChannel, SoundMixer};
use savestate::SaveState;

const MAX_DEBUG_EVENTS: usize = 512;

/// Cartridge side of the console plus the audio mixer, driven by the host's
/// CPU/PPU/APU loop.
pub struct Console {
    mapper: Box<dyn Mapper>,
    memory: BankedMemory,
    irq_line: CpuIrqLine,
    mixer: SoundMixer,
    mapper_name: String,
    debug_events: VecDeque<String>,
}

impl Console {
    pub fn new(cart: Cartridge, config: &CoreConfig) -> Result<Self> {
        let mapper_id = cart.mapper_id;
        let submapper_id = cart.submapper_id;
        let supported_name = mapper_name(mapper_id, submapper_id);
        let name = if submapper_id != 0 {
            format!("{supported_name} (mapper {mapper_id}, submapper {submapper_id})")
        } else {
            format!("{supported_name} (mapper {mapper_id})")
        };

        let watcher = A12Watcher::new(
            config.audio.model.ppu_frame_cycles(),
            config.a12_deglitch_cycles,
        );
        let mut mapper = create_mapper(&cart, watcher)?;
        let mut memory = BankedMemory::new(cart, mapper.layout());
        mapper.power_on(&mut PowerOnRng::new(config.power_on_seed), &mut memory);

        let mut console = Self {
            mapper,
            memory,
            irq_line: CpuIrqLine::new(),
            mixer: SoundMixer::new(&config.audio),
            mapper_name: name,
            debug_events: VecDeque::with_capacity(MAX_DEBUG_EVENTS),
        };
        console.push_debug_event(format!(
            "Cartridge loaded: {} (seed {})",
            console.mapper_name, config.power_on_seed
        ));
        Ok(console)
    }

    pub fn from_file(path: &Path, config: &CoreConfig) -> Result<Self> {
        let cart = Cartridge::from_file(path)?;
        Self::new(cart, config).with_context(|| format!("failed to load {}", path.display()))
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn mapper(&self) -> &dyn Mapper {
        self.mapper.as_ref()
    }

    pub fn memory(&self) -> &BankedMemory {
        &self.memory
    }

    /// `None` is open bus.
    pub fn cpu_read(&self, addr: u16) -> Option<u8> {
        self.memory.cpu_read(addr)
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8) {
        if addr >= 0x8000 {
            let mut bus = CartBus {
                banking: &mut self.memory,
                irq: &mut self.irq_line,
            };
            self.mapper.write_register(addr, value, &mut bus);
        } else {
            self.memory.cpu_write(addr, value);
        }
    }

    pub fn ppu_read(&self, addr: u16) -> u8 {
        self.memory.ppu_read(addr)
    }

    pub fn ppu_write(&mut self, addr: u16, value: u8) {
        self.memory.ppu_write(addr, value);
    }

    /// Reports a PPU bus address so the board can watch A12.
    pub fn ppu_bus_address(&mut self, addr: u16, frame_cycle: u32) -> A12Edge {
        let was_asserted = self.irq_line.asserted();
        let edge = self
            .mapper
            .notify_ppu_addr(addr, frame_cycle, &mut self.irq_line);
        if !was_asserted && self.irq_line.asserted() {
            self.push_debug_event(format!(
                "Mapper IRQ asserted at cycle {frame_cycle} (latch ${:02X})",
                self.mapper.irq_counter().reload_value()
            ));
        }
        edge
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq_line.asserted()
    }

    pub fn irq_phase(&self) -> IrqPhase {
        self.mapper.irq_counter().phase(self.irq_line.asserted())
    }

    pub fn irq_counter(&self) -> &ScanlineIrq {
        self.mapper.irq_counter()
    }

    pub fn mirroring(&self) -> Mirroring {
        self.memory.mirroring()
    }

    pub fn mixer(&self) -> &SoundMixer {
        &self.mixer
    }

    pub fn mixer_mut(&mut self) -> &mut SoundMixer {
        &mut self.mixer
    }

    pub fn add_audio_delta(&mut self, channel: AudioChannel, time: u32, delta: i16) {
        self.mixer.add_delta(channel, time, delta);
    }

    /// Closes the audio cycle. A model change queued on the mixer takes
    /// effect here for the A12 watcher's frame length as well.
    pub fn end_audio_cycle(&mut self, boundary: u32) {
        let rate_before = self.mixer.sample_rate();
        let model_before = self.mixer.model();
        self.mixer.end_cycle(boundary);
        if self.mixer.sample_rate() != rate_before {
            self.push_debug_event(format!(
                "Audio rate {} Hz -> {} Hz",
                rate_before,
                self.mixer.sample_rate()
            ));
        }
        if self.mixer.model() != model_before {
            self.sync_frame_length();
            self.push_debug_event(format!(
                "Console model {:?} -> {:?}",
                model_before,
                self.mixer.model()
            ));
        }
    }

    fn sync_frame_length(&mut self) {
        self.mapper
            .set_frame_length(self.mixer.model().ppu_frame_cycles());
    }

    pub fn flush_audio(&mut self, ctx: &mut AudioContext) {
        self.mixer.flush_frame(ctx);
    }

    /// Drops all audio history and undelivered samples; cartridge state is
    /// untouched.
    pub fn reset_audio(&mut self) {
        self.mixer.reset();
        self.push_debug_event("Audio reset");
    }

    pub fn save_state(&self) -> SaveState {
        SaveState::new(
            self.mapper.snapshot(),
            self.memory.snapshot(),
            self.irq_line,
            self.mixer.snapshot(),
        )
    }

    /// Every section is checked before anything is touched; on error the
    /// console is unchanged.
    pub fn load_state(&mut self, state: &SaveState) -> Result<()> {
        state.check_header()?;
        self.mapper
            .validate_snapshot(&state.mapper)
            .context("mapper state rejected")?;
        let image = self
            .memory
            .decode_snapshot(&state.memory)
            .context("memory state rejected")?;
        SoundMixer::validate_snapshot(&state.mixer).context("mixer state rejected")?;

        self.mapper.restore(&state.mapper)?;
        self.memory.apply_image(image);
        self.mapper.sync_banks(&mut self.memory);
        self.irq_line = state.irq_line;
        self.mixer.restore(state.mixer.clone());
        self.sync_frame_length();
        self.push_debug_event("State loaded");
        Ok(())
    }

    pub fn save_state_bytes(&self) -> Result<Vec<u8>> {
        self.save_state().to_bytes()
    }

    pub fn load_state_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let state = SaveState::from_bytes(bytes)?;
        self.load_state(&state)
    }

    pub fn debug_mapper_state(&self) -> String {
        let state = self.mapper.debug_state();
        if state.is_empty() {
            self.mapper_name.clone()
        } else {
            state
        }
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        if self.debug_events.len() >= MAX_DEBUG_EVENTS {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event.into());
    }
}
