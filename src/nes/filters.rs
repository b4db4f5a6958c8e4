use std::collections::VecDeque;
use std::f32::consts::PI;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

const PAN_GAIN: f32 = std::f32::consts::FRAC_1_SQRT_2;
const COMB_RATIOS: [f32; 4] = [1.0, 1.13, 1.27, 1.41];
const COMB_FEEDBACK: f32 = 0.5;
// Right-channel comb lines are detuned so the tail decorrelates.
const RIGHT_COMB_SPREAD: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReverbConfig {
    pub strength: f32,
    pub delay_ms: u32,
}

/// Each stage is skipped when its field is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub low_pass_cutoff_hz: Option<f32>,
    pub panning_angle_deg: Option<f32>,
    pub stereo_delay_ms: Option<u32>,
    pub reverb: Option<ReverbConfig>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            low_pass_cutoff_hz: Some(14_000.0),
            panning_angle_deg: None,
            stereo_delay_ms: None,
            reverb: None,
        }
    }
}

impl FilterConfig {
    pub fn bypass() -> Self {
        Self {
            low_pass_cutoff_hz: None,
            ..Self::default()
        }
    }
}

fn low_pass_alpha(cutoff_hz: f32, dt: f32) -> f32 {
    let rc = 1.0 / (2.0 * PI * cutoff_hz);
    dt / (rc + dt)
}

fn ms_to_samples(ms: u32, sample_rate: u32) -> usize {
    (sample_rate as u64 * ms as u64 / 1000) as usize
}

/// `history` runs oldest to newest.
fn resize_history<T: Copy + Default>(history: &mut Vec<T>, len: usize) {
    if history.len() > len {
        history.drain(..history.len() - len);
    } else {
        let pad = len - history.len();
        history.splice(0..0, std::iter::repeat_n(T::default(), pad));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LowPass {
    alpha: f32,
    prev_out: f32,
}

impl LowPass {
    fn process(&mut self, sample: f32) -> f32 {
        self.prev_out += self.alpha * (sample - self.prev_out);
        self.prev_out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Panning {
    left: f32,
    right: f32,
}

impl Panning {
    fn new(angle_deg: f32) -> Self {
        let (sin, cos) = angle_deg.to_radians().sin_cos();
        Self {
            left: PAN_GAIN * (cos - sin),
            right: PAN_GAIN * (cos + sin),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CombLine {
    line: Vec<f32>,
    pos: usize,
}

impl CombLine {
    fn new(len: usize) -> Self {
        Self {
            line: vec![0.0; len.max(1)],
            pos: 0,
        }
    }

    /// Keeps the most recent `len` samples, zero-padding the oldest end.
    fn resize(&mut self, len: usize) {
        self.line.rotate_left(self.pos);
        self.pos = 0;
        resize_history(&mut self.line, len.max(1));
    }

    fn process(&mut self, input: f32) -> f32 {
        let out = self.line[self.pos];
        self.line[self.pos] = input + out * COMB_FEEDBACK;
        self.pos = (self.pos + 1) % self.line.len();
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reverb {
    strength: f32,
    left: Vec<CombLine>,
    right: Vec<CombLine>,
}

fn comb_lengths(delay_ms: u32, sample_rate: u32, spread: usize) -> [usize; 4] {
    let base = ms_to_samples(delay_ms, sample_rate).max(1);
    COMB_RATIOS.map(|ratio| (base as f32 * ratio) as usize + spread)
}

impl Reverb {
    fn new(config: ReverbConfig, sample_rate: u32) -> Self {
        let lines = |spread: usize| -> Vec<CombLine> {
            comb_lengths(config.delay_ms, sample_rate, spread)
                .into_iter()
                .map(CombLine::new)
                .collect()
        };
        Self {
            strength: config.strength,
            left: lines(0),
            right: lines(RIGHT_COMB_SPREAD),
        }
    }

    fn retune(&mut self, config: ReverbConfig, sample_rate: u32) {
        for (lines, spread) in [(&mut self.left, 0), (&mut self.right, RIGHT_COMB_SPREAD)] {
            let lengths = comb_lengths(config.delay_ms, sample_rate, spread);
            for (line, len) in lines.iter_mut().zip(lengths) {
                line.resize(len);
            }
        }
    }

    fn wet(lines: &mut [CombLine], input: f32) -> f32 {
        let sum: f32 = lines.iter_mut().map(|line| line.process(input)).sum();
        sum / lines.len().max(1) as f32
    }

    fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        (
            left + self.strength * Self::wet(&mut self.left, left),
            right + self.strength * Self::wet(&mut self.right, right),
        )
    }
}

/// Mono PCM in, interleaved stereo out: low-pass, panning, right-channel
/// delay, then reverb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterChain {
    config: FilterConfig,
    sample_rate: u32,
    low_pass: Option<LowPass>,
    panning: Option<Panning>,
    delay: Option<VecDeque<f32>>,
    reverb: Option<Reverb>,
}

impl FilterChain {
    pub fn new(config: FilterConfig, sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        let dt = 1.0 / sample_rate as f32;
        Self {
            low_pass: config
                .low_pass_cutoff_hz
                .filter(|hz| *hz > 0.0)
                .map(|hz| LowPass {
                    alpha: low_pass_alpha(hz, dt),
                    prev_out: 0.0,
                }),
            panning: config.panning_angle_deg.map(Panning::new),
            delay: config
                .stereo_delay_ms
                .map(|ms| VecDeque::from(vec![0.0; ms_to_samples(ms, sample_rate)])),
            reverb: config.reverb.map(|r| Reverb::new(r, sample_rate)),
            config,
            sample_rate,
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Moves the chain to a new output rate without dropping its state.
    ///
    /// Coefficients are recomputed; the low-pass output and the delay and
    /// comb histories carry over, truncated or zero-padded at the oldest end.
    pub fn retune(&mut self, sample_rate: u32) {
        let sample_rate = sample_rate.max(1);
        if sample_rate == self.sample_rate {
            return;
        }
        let dt = 1.0 / sample_rate as f32;
        if let (Some(lp), Some(hz)) = (&mut self.low_pass, self.config.low_pass_cutoff_hz) {
            lp.alpha = low_pass_alpha(hz, dt);
        }
        if let (Some(line), Some(ms)) = (&mut self.delay, self.config.stereo_delay_ms) {
            let mut history: Vec<f32> = line.drain(..).collect();
            resize_history(&mut history, ms_to_samples(ms, sample_rate));
            line.extend(history);
        }
        if let (Some(reverb), Some(config)) = (&mut self.reverb, self.config.reverb) {
            reverb.retune(config, sample_rate);
        }
        self.sample_rate = sample_rate;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn process(&mut self, mono: &[i16]) -> Vec<i16> {
        let mut out = Vec::with_capacity(mono.len() * 2);
        for &sample in mono {
            let mut x = sample as f32;
            if let Some(lp) = &mut self.low_pass {
                x = lp.process(x);
            }

            let (mut left, mut right) = match self.panning {
                Some(pan) => (x * pan.left, x * pan.right),
                None => (x, x),
            };

            if let Some(line) = &mut self.delay {
                line.push_back(right);
                right = line.pop_front().unwrap_or(0.0);
            }

            if let Some(reverb) = &mut self.reverb {
                (left, right) = reverb.process(left, right);
            }

            out.push(saturate(left));
            out.push(saturate(right));
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.sample_rate > 0, "filter sample rate must be non-zero");
        if let Some(line) = &self.delay {
            let expected = self
                .config
                .stereo_delay_ms
                .map(|ms| ms_to_samples(ms, self.sample_rate));
            ensure!(
                Some(line.len()) == expected,
                "stereo delay line holds {} samples, expected {:?}",
                line.len(),
                expected
            );
        }
        if let Some(reverb) = &self.reverb {
            for comb in reverb.left.iter().chain(&reverb.right) {
                ensure!(
                    !comb.line.is_empty() && comb.pos < comb.line.len(),
                    "reverb comb position {} outside line of {}",
                    comb.pos,
                    comb.line.len()
                );
            }
        }
        Ok(())
    }
}

fn saturate(sample: f32) -> i16 {
    sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
