use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use super::a12::{NTSC_FRAME_CYCLES, PAL_FRAME_CYCLES};
use super::blip::BlipBuffer;
use super::filters::{FilterChain, FilterConfig};
use crate::audio::AudioContext;
use crate::config::AudioConfig;

/// Master clocks per audio cycle; event timestamps are relative to its start.
pub const CYCLE_LENGTH: u32 = 10_000;
pub const MAX_CHANNEL_COUNT: usize = 6;
pub const EXPANSION_AUDIO_INDEX: usize = 5;
pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 96_000;

const OUTPUT_SCALE: f64 = 5_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioChannel {
    Square1,
    Square2,
    Triangle,
    Noise,
    Dmc,
    Expansion,
}

impl AudioChannel {
    pub const ALL: [AudioChannel; MAX_CHANNEL_COUNT] = [
        AudioChannel::Square1,
        AudioChannel::Square2,
        AudioChannel::Triangle,
        AudioChannel::Noise,
        AudioChannel::Dmc,
        AudioChannel::Expansion,
    ];

    pub fn index(self) -> usize {
        match self {
            AudioChannel::Square1 => 0,
            AudioChannel::Square2 => 1,
            AudioChannel::Triangle => 2,
            AudioChannel::Noise => 3,
            AudioChannel::Dmc => 4,
            AudioChannel::Expansion => EXPANSION_AUDIO_INDEX,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpansionAudio {
    #[default]
    None,
    Fds,
    Mmc5,
    Vrc6,
    Vrc7,
    Namco163,
    Sunsoft5B,
}

impl ExpansionAudio {
    /// Linear gain applied to the expansion channel level.
    pub fn gain(self) -> f64 {
        match self {
            ExpansionAudio::None => 0.0,
            ExpansionAudio::Fds => 20.0,
            ExpansionAudio::Mmc5 => 40.0,
            ExpansionAudio::Vrc6 => 75.0,
            ExpansionAudio::Vrc7 => 12.0,
            ExpansionAudio::Namco163 => 20.0,
            ExpansionAudio::Sunsoft5B => 15.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NesModel {
    #[default]
    Ntsc,
    Pal,
    Dendy,
}

impl NesModel {
    pub fn cpu_clock_hz(self) -> u64 {
        match self {
            NesModel::Ntsc => 1_789_773,
            NesModel::Pal => 1_662_607,
            NesModel::Dendy => 1_773_448,
        }
    }

    pub fn ppu_frame_cycles(self) -> u32 {
        match self {
            NesModel::Ntsc => NTSC_FRAME_CYCLES,
            NesModel::Pal | NesModel::Dendy => PAL_FRAME_CYCLES,
        }
    }
}

/// Per-channel delta events for the current cycle, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEventBuffer {
    events: Vec<(u32, i16)>,
}

impl ChannelEventBuffer {
    /// Timestamps never run backwards within a buffer and never leave the cycle.
    pub fn push(&mut self, time: u32, delta: i16) {
        let mut time = time.min(CYCLE_LENGTH - 1);
        if let Some(&(last, _)) = self.events.last() {
            time = time.max(last);
        }
        self.events.push((time, delta));
    }

    pub fn events(&self) -> &[(u32, i16)] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn clear(&mut self) {
        self.events.clear();
    }
}

fn clamp_rate(sample_rate: u32) -> u32 {
    sample_rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE)
}

/// Filtered stereo frames waiting for `flush_frame`, tagged with the rate
/// they were resampled at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBlock {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixerSnapshot {
    pub settings: AudioConfig,
    pub levels: [i32; MAX_CHANNEL_COUNT],
    pub previous_output: i16,
    pub buffers: Vec<ChannelEventBuffer>,
    pub pending: Option<AudioConfig>,
    pub resampler: BlipBuffer,
    pub filters: FilterChain,
    pub ready: Vec<RateBlock>,
    pub clock: u64,
}

pub struct SoundMixer {
    settings: AudioConfig,
    levels: [i32; MAX_CHANNEL_COUNT],
    previous_output: i16,
    buffers: Vec<ChannelEventBuffer>,
    pending: Option<AudioConfig>,
    resampler: BlipBuffer,
    filters: FilterChain,
    ready: Vec<RateBlock>,
    clock: u64,
}

impl SoundMixer {
    pub fn new(settings: &AudioConfig) -> Self {
        let mut settings = settings.clone();
        settings.sample_rate = clamp_rate(settings.sample_rate);
        Self {
            levels: [0; MAX_CHANNEL_COUNT],
            previous_output: 0,
            buffers: vec![ChannelEventBuffer::default(); MAX_CHANNEL_COUNT],
            pending: None,
            resampler: BlipBuffer::new(settings.model.cpu_clock_hz(), settings.sample_rate),
            filters: FilterChain::new(settings.filters.clone(), settings.sample_rate),
            ready: Vec::new(),
            clock: 0,
            settings,
        }
    }

    pub fn settings(&self) -> &AudioConfig {
        &self.settings
    }

    pub fn sample_rate(&self) -> u32 {
        self.settings.sample_rate
    }

    pub fn model(&self) -> NesModel {
        self.settings.model
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn previous_output(&self) -> i16 {
        self.previous_output
    }

    pub fn level(&self, channel: AudioChannel) -> i32 {
        self.levels[channel.index()]
    }

    pub fn buffer(&self, channel: AudioChannel) -> &ChannelEventBuffer {
        &self.buffers[channel.index()]
    }

    pub fn pending_events(&self) -> usize {
        self.buffers.iter().map(|b| b.events().len()).sum()
    }

    pub fn has_pending_settings(&self) -> bool {
        self.pending.is_some()
    }

    fn pending_mut(&mut self) -> &mut AudioConfig {
        self.pending.get_or_insert_with(|| self.settings.clone())
    }

    /// Replaces the whole configuration at the next cycle boundary.
    pub fn configure(&mut self, settings: AudioConfig) {
        self.pending = Some(settings);
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.pending_mut().sample_rate = sample_rate;
    }

    pub fn set_model(&mut self, model: NesModel) {
        self.pending_mut().model = model;
    }

    pub fn set_volume(&mut self, channel: AudioChannel, volume: f64) {
        self.pending_mut().volumes[channel.index()] = volume;
    }

    pub fn set_expansion(&mut self, expansion: ExpansionAudio) {
        self.pending_mut().expansion = expansion;
    }

    pub fn set_filters(&mut self, filters: FilterConfig) {
        self.pending_mut().filters = filters;
    }

    pub fn add_delta(&mut self, channel: AudioChannel, time: u32, delta: i16) {
        self.buffers[channel.index()].push(time, delta);
    }

    fn output_volume(&self) -> i16 {
        let level = |channel: AudioChannel| {
            self.levels[channel.index()] as f64 * self.settings.volumes[channel.index()]
        };

        let square = level(AudioChannel::Square1) + level(AudioChannel::Square2);
        let pulse_out = if square > 0.0 {
            95.88 / ((8128.0 / square) + 100.0)
        } else {
            0.0
        };

        let tnd_in = level(AudioChannel::Triangle) / 8227.0
            + level(AudioChannel::Noise) / 12241.0
            + level(AudioChannel::Dmc) / 22638.0;
        let tnd_out = if tnd_in > 0.0 {
            159.79 / ((1.0 / tnd_in) + 100.0)
        } else {
            0.0
        };

        let expansion = level(AudioChannel::Expansion) * self.settings.expansion.gain();
        let total = (pulse_out + tnd_out) * OUTPUT_SCALE + expansion;
        total.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }

    /// Replays the cycle's events into the resampler and closes the frame.
    pub fn end_cycle(&mut self, boundary: u32) {
        let mut events: Vec<(u32, usize, i16)> = self
            .buffers
            .iter()
            .enumerate()
            .flat_map(|(channel, buffer)| {
                buffer
                    .events()
                    .iter()
                    .map(move |&(time, delta)| (time, channel, delta))
            })
            .collect();
        events.sort_by_key(|&(time, channel, _)| (time, channel));

        let mut iter = events.into_iter().peekable();
        while let Some((time, channel, delta)) = iter.next() {
            self.levels[channel] = self.levels[channel].saturating_add(delta as i32);
            if iter.peek().is_some_and(|&(next, _, _)| next == time) {
                continue;
            }
            let out = self.output_volume();
            let change = out as i32 - self.previous_output as i32;
            if change != 0 {
                self.resampler.add_delta(time, change);
            }
            self.previous_output = out;
        }

        for buffer in &mut self.buffers {
            buffer.clear();
        }
        self.resampler.end_frame(boundary);
        self.clock += boundary as u64;

        if let Some(settings) = self.pending.take() {
            self.apply_settings(settings);
        }
    }

    fn drain_filtered(&mut self) {
        let mono = self.resampler.read_all();
        if mono.is_empty() {
            return;
        }
        let stereo = self.filters.process(&mono);
        let sample_rate = self.filters.sample_rate();
        match self.ready.last_mut() {
            Some(block) if block.sample_rate == sample_rate => block.samples.extend(stereo),
            _ => self.ready.push(RateBlock {
                sample_rate,
                samples: stereo,
            }),
        }
    }

    fn apply_settings(&mut self, mut settings: AudioConfig) {
        settings.sample_rate = clamp_rate(settings.sample_rate);
        let rate_changed = settings.sample_rate != self.settings.sample_rate
            || settings.model != self.settings.model;

        if rate_changed {
            // Committed samples belong to the old rate; filter them with it.
            self.drain_filtered();
            self.resampler
                .set_rates(settings.model.cpu_clock_hz(), settings.sample_rate);
        }
        if settings.filters != self.settings.filters {
            self.filters = FilterChain::new(settings.filters.clone(), settings.sample_rate);
        } else if rate_changed {
            self.filters.retune(settings.sample_rate);
        }
        self.settings = settings;
        // Volume or chip changes shift the mix without any event; the next
        // event's delta carries the jump.
    }

    /// Hands every completed sample to the registered device, one block per
    /// output rate in the order they were produced.
    pub fn flush_frame(&mut self, ctx: &mut AudioContext) {
        self.drain_filtered();
        for block in std::mem::take(&mut self.ready) {
            let frames = block.samples.len() / 2;
            ctx.deliver(block.samples, frames, block.sample_rate);
        }
    }

    /// Silences the mixer: channel levels, buffered events, undelivered
    /// samples and all resampler and filter history are dropped. Settings,
    /// including any change still queued, are kept.
    pub fn reset(&mut self) {
        self.levels = [0; MAX_CHANNEL_COUNT];
        self.previous_output = 0;
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        self.resampler.clear();
        self.filters = FilterChain::new(self.settings.filters.clone(), self.settings.sample_rate);
        self.ready.clear();
        self.clock = 0;
    }

    pub fn snapshot(&self) -> MixerSnapshot {
        MixerSnapshot {
            settings: self.settings.clone(),
            levels: self.levels,
            previous_output: self.previous_output,
            buffers: self.buffers.clone(),
            pending: self.pending.clone(),
            resampler: self.resampler.clone(),
            filters: self.filters.clone(),
            ready: self.ready.clone(),
            clock: self.clock,
        }
    }

    pub fn validate_snapshot(snapshot: &MixerSnapshot) -> Result<()> {
        ensure!(
            snapshot.buffers.len() == MAX_CHANNEL_COUNT,
            "mixer state has {} channel buffers, expected {}",
            snapshot.buffers.len(),
            MAX_CHANNEL_COUNT
        );
        for buffer in &snapshot.buffers {
            let ordered = buffer.events().windows(2).all(|w| w[0].0 <= w[1].0);
            let in_cycle = buffer.events().iter().all(|&(t, _)| t < CYCLE_LENGTH);
            ensure!(ordered && in_cycle, "mixer channel buffer is out of order");
        }
        let rate = snapshot.settings.sample_rate;
        ensure!(
            (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate),
            "mixer sample rate {rate} Hz out of range"
        );
        ensure!(
            snapshot.resampler.sample_rate() == rate
                && snapshot.resampler.clock_rate() == snapshot.settings.model.cpu_clock_hz(),
            "resampler rates do not match mixer settings"
        );
        ensure!(
            snapshot.filters.sample_rate() == rate,
            "filter chain runs at {} Hz, mixer at {rate} Hz",
            snapshot.filters.sample_rate()
        );
        for block in &snapshot.ready {
            ensure!(
                block.samples.len() % 2 == 0,
                "pending stereo block has an odd sample count"
            );
            ensure!(
                (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&block.sample_rate),
                "pending block rate {} Hz out of range",
                block.sample_rate
            );
        }
        snapshot.resampler.validate()?;
        snapshot.filters.validate()?;
        Ok(())
    }

    /// Callers validate first; this only copies.
    pub fn restore(&mut self, snapshot: MixerSnapshot) {
        self.settings = snapshot.settings;
        self.levels = snapshot.levels;
        self.previous_output = snapshot.previous_output;
        self.buffers = snapshot.buffers;
        self.pending = snapshot.pending;
        self.resampler = snapshot.resampler;
        self.filters = snapshot.filters;
        self.ready = snapshot.ready;
        self.clock = snapshot.clock;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{CaptureDevice, CaptureHandle};
    use crate::nes::filters::ReverbConfig;

    fn plain_settings() -> AudioConfig {
        AudioConfig {
            filters: FilterConfig::bypass(),
            ..AudioConfig::default()
        }
    }

    #[test]
    fn event_times_are_clamped_not_reordered() {
        let mut buffer = ChannelEventBuffer::default();
        buffer.push(100, 1);
        buffer.push(50, 2);
        buffer.push(20_000, 3);
        assert_eq!(buffer.events(), &[(100, 1), (100, 2), (CYCLE_LENGTH - 1, 3)]);
    }

    #[test]
    fn end_cycle_clears_buffers_and_advances_clock() {
        let mut mixer = SoundMixer::new(&plain_settings());
        mixer.add_delta(AudioChannel::Square1, 10, 8);
        mixer.add_delta(AudioChannel::Noise, 20, 4);
        assert_eq!(mixer.pending_events(), 2);

        mixer.end_cycle(CYCLE_LENGTH);
        assert_eq!(mixer.pending_events(), 0);
        assert_eq!(mixer.level(AudioChannel::Square1), 8);
        assert_eq!(mixer.level(AudioChannel::Noise), 4);
        assert_eq!(mixer.clock(), CYCLE_LENGTH as u64);
    }

    #[test]
    fn mix_follows_nonlinear_pulse_curve() {
        let mut mixer = SoundMixer::new(&plain_settings());
        mixer.add_delta(AudioChannel::Square1, 0, 15);
        mixer.end_cycle(CYCLE_LENGTH);
        // 95.88 / (8128 / 15 + 100) * 5000
        assert_eq!(mixer.previous_output(), 747);
    }

    #[test]
    fn expansion_channel_is_linear_with_chip_gain() {
        let mut settings = plain_settings();
        settings.expansion = ExpansionAudio::Vrc6;
        let mut mixer = SoundMixer::new(&settings);
        mixer.add_delta(AudioChannel::Expansion, 0, 10);
        mixer.end_cycle(CYCLE_LENGTH);
        assert_eq!(mixer.previous_output(), 750);

        mixer.add_delta(AudioChannel::Expansion, 0, 1_000);
        mixer.end_cycle(CYCLE_LENGTH);
        assert_eq!(mixer.previous_output(), i16::MAX);
    }

    fn capture_context() -> (AudioContext, CaptureHandle) {
        let (device, capture) = CaptureDevice::new();
        let mut ctx = AudioContext::new();
        ctx.register_device(Box::new(device));
        (ctx, capture)
    }

    #[test]
    fn silent_cycle_continues_previous_level() {
        let mut mixer = SoundMixer::new(&plain_settings());
        let (device, capture) = CaptureDevice::new();
        let mut ctx = AudioContext::new();
        ctx.register_device(Box::new(device));

        mixer.add_delta(AudioChannel::Square1, 0, 15);
        mixer.end_cycle(CYCLE_LENGTH);
        mixer.end_cycle(CYCLE_LENGTH);
        mixer.flush_frame(&mut ctx);
        let settled = *capture.samples().last().expect("samples delivered");
        assert_eq!(settled, 747);

        capture.clear();
        mixer.end_cycle(CYCLE_LENGTH);
        mixer.flush_frame(&mut ctx);
        let block = capture.samples();
        assert!(!block.is_empty());
        assert!(block.iter().all(|&s| s == settled));
    }

    #[test]
    fn reconfiguration_waits_for_cycle_boundary() {
        let mut mixer = SoundMixer::new(&plain_settings());
        mixer.set_sample_rate(44_100);
        mixer.set_volume(AudioChannel::Triangle, 0.5);
        assert_eq!(mixer.sample_rate(), 48_000);
        assert_eq!(mixer.settings().volumes[2], 1.0);
        assert!(mixer.has_pending_settings());

        mixer.end_cycle(CYCLE_LENGTH);
        assert_eq!(mixer.sample_rate(), 44_100);
        assert_eq!(mixer.settings().volumes[2], 0.5);
        assert!(!mixer.has_pending_settings());
    }

    #[test]
    fn rate_change_keeps_samples_committed_at_old_rate() {
        let mut mixer = SoundMixer::new(&plain_settings());
        let (mut ctx, capture) = capture_context();

        mixer.set_sample_rate(8_000);
        mixer.end_cycle(CYCLE_LENGTH);
        mixer.flush_frame(&mut ctx);

        // One 48 kHz cycle (~268 frames) plus nothing at the new rate yet.
        let frames = capture.samples().len() / 2;
        assert!((260..=275).contains(&frames), "{frames}");
        assert_eq!(capture.block_rates(), vec![48_000]);
    }

    #[test]
    fn blocks_from_both_sides_of_a_rate_change_keep_their_own_rate() {
        let mut mixer = SoundMixer::new(&plain_settings());
        let (mut ctx, capture) = capture_context();

        mixer.end_cycle(CYCLE_LENGTH);
        mixer.set_sample_rate(8_000);
        mixer.end_cycle(CYCLE_LENGTH);
        mixer.end_cycle(CYCLE_LENGTH);
        mixer.flush_frame(&mut ctx);

        assert_eq!(capture.blocks(), 2);
        assert_eq!(capture.block_rates(), vec![48_000, 8_000]);
        assert_eq!(capture.sample_rate(), 8_000);
        // Two cycles at 48 kHz (~536 frames) then one at 8 kHz (~44).
        let frames = capture.samples().len() / 2;
        assert!((570..=585).contains(&frames), "{frames}");
        assert!(mixer.snapshot().ready.is_empty());
    }

    #[test]
    fn rate_change_does_not_disturb_a_steady_tone() {
        let mut mixer = SoundMixer::new(&AudioConfig::default());
        let (mut ctx, capture) = capture_context();

        mixer.add_delta(AudioChannel::Square1, 0, 15);
        for _ in 0..4 {
            mixer.end_cycle(CYCLE_LENGTH);
        }
        mixer.flush_frame(&mut ctx);
        assert_eq!(capture.samples().last(), Some(&747));
        capture.clear();

        mixer.set_sample_rate(44_100);
        mixer.end_cycle(CYCLE_LENGTH);
        mixer.end_cycle(CYCLE_LENGTH);
        mixer.flush_frame(&mut ctx);

        let samples = capture.samples();
        assert!(samples.len() > 500);
        assert!(samples.iter().all(|&s| s == 747), "{samples:?}");
        assert_eq!(capture.block_rates(), vec![48_000, 44_100]);
    }

    #[test]
    fn reset_returns_to_power_on_silence() {
        let settings = AudioConfig::default();
        let mut mixer = SoundMixer::new(&settings);
        let (mut ctx, capture) = capture_context();

        mixer.add_delta(AudioChannel::Triangle, 40, 12);
        mixer.add_delta(AudioChannel::Noise, 90, 5);
        mixer.end_cycle(CYCLE_LENGTH);
        mixer.add_delta(AudioChannel::Square2, 10, 3);
        mixer.reset();

        assert_eq!(mixer.snapshot(), SoundMixer::new(&settings).snapshot());
        mixer.flush_frame(&mut ctx);
        assert_eq!(capture.blocks(), 0);

        mixer.end_cycle(CYCLE_LENGTH);
        mixer.flush_frame(&mut ctx);
        assert!(capture.samples().iter().all(|&s| s == 0));
    }

    #[test]
    fn reset_keeps_queued_settings() {
        let mut mixer = SoundMixer::new(&plain_settings());
        mixer.set_sample_rate(22_050);
        mixer.reset();
        assert!(mixer.has_pending_settings());
        mixer.end_cycle(CYCLE_LENGTH);
        assert_eq!(mixer.sample_rate(), 22_050);
    }

    fn filtered_settings() -> AudioConfig {
        AudioConfig {
            filters: FilterConfig {
                stereo_delay_ms: Some(2),
                reverb: Some(ReverbConfig {
                    strength: 0.3,
                    delay_ms: 2,
                }),
                ..FilterConfig::default()
            },
            ..AudioConfig::default()
        }
    }

    fn stereo_frames(samples: &[i16]) -> Vec<(i16, i16)> {
        samples.chunks_exact(2).map(|f| (f[0], f[1])).collect()
    }

    #[test]
    fn silent_cycle_through_filters_continues_without_overshoot() {
        let run = || {
            let mut mixer = SoundMixer::new(&filtered_settings());
            let (mut ctx, capture) = capture_context();
            mixer.add_delta(AudioChannel::Square1, 0, 15);
            for _ in 0..20 {
                mixer.end_cycle(CYCLE_LENGTH);
            }
            mixer.flush_frame(&mut ctx);
            let settled = capture.samples();
            capture.clear();

            mixer.end_cycle(CYCLE_LENGTH);
            mixer.flush_frame(&mut ctx);
            (settled, capture.samples())
        };

        let (settled, silent) = run();
        let &(left, right) = stereo_frames(&settled).last().expect("settled frames");
        assert!(left > 747 && right > 747, "reverb adds to the dry level");
        assert!(!silent.is_empty());
        for (l, r) in stereo_frames(&silent) {
            assert!((l - left).abs() <= 1 && (r - right).abs() <= 1, "{l} {r}");
        }

        assert_eq!(run(), (settled, silent));
    }

    #[test]
    fn silent_cycles_after_key_off_decay_within_prior_peak() {
        let run = || {
            let mut mixer = SoundMixer::new(&filtered_settings());
            let (mut ctx, capture) = capture_context();
            mixer.add_delta(AudioChannel::Square1, 0, 15);
            for _ in 0..20 {
                mixer.end_cycle(CYCLE_LENGTH);
            }
            mixer.add_delta(AudioChannel::Square1, 0, -15);
            mixer.end_cycle(CYCLE_LENGTH);
            mixer.flush_frame(&mut ctx);
            let peak = capture.samples().iter().map(|s| s.abs()).max().unwrap_or(0);
            capture.clear();

            for _ in 0..8 {
                mixer.end_cycle(CYCLE_LENGTH);
            }
            mixer.flush_frame(&mut ctx);
            (peak, capture.samples())
        };

        let (peak, tail) = run();
        assert!(tail.iter().all(|s| s.abs() <= peak));
        assert!(tail.iter().rev().take(16).all(|s| s.abs() <= 1));
        assert_eq!(run(), (peak, tail));
    }

    #[test]
    fn sample_rate_is_clamped_to_supported_range() {
        let mut mixer = SoundMixer::new(&plain_settings());
        mixer.set_sample_rate(1_000_000);
        mixer.end_cycle(CYCLE_LENGTH);
        assert_eq!(mixer.sample_rate(), MAX_SAMPLE_RATE);
    }

    #[test]
    fn flush_without_device_discards_block() {
        let mut mixer = SoundMixer::new(&plain_settings());
        let mut ctx = AudioContext::new();
        mixer.add_delta(AudioChannel::Dmc, 0, 64);
        mixer.end_cycle(CYCLE_LENGTH);
        mixer.flush_frame(&mut ctx);

        assert!(ctx.discarded_frames() > 0);
        assert_eq!(ctx.delivered_frames(), 0);
        assert!(mixer.snapshot().ready.is_empty());
    }

    #[test]
    fn snapshot_validation_rejects_mismatched_resampler() {
        let mixer = SoundMixer::new(&plain_settings());
        let mut snap = mixer.snapshot();
        assert!(SoundMixer::validate_snapshot(&snap).is_ok());

        snap.settings.sample_rate = 44_100;
        assert!(SoundMixer::validate_snapshot(&snap).is_err());

        let mut snap = mixer.snapshot();
        snap.buffers.pop();
        assert!(SoundMixer::validate_snapshot(&snap).is_err());
    }
}
