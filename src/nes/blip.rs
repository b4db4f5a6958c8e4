//! Band-limited step resampler.
//!
//! Amplitude changes arrive as deltas at clock-rate timestamps. Each delta is
//! spread over `KERNEL_WIDTH` output samples using one of `PHASE_COUNT`
//! pre-computed windowed-sinc impulses, and reading integrates the buffer back
//! into a band-limited step. Output lags input by `KERNEL_WIDTH / 2` samples.

use std::f64::consts::PI;
use std::sync::OnceLock;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

pub const FRAC_BITS: u32 = 20;
const PHASE_BITS: u32 = 5;
const PHASE_COUNT: usize = 1 << PHASE_BITS;
pub const KERNEL_WIDTH: usize = 16;
const DELTA_BITS: u32 = 15;
const DELTA_UNIT: i64 = 1 << DELTA_BITS;
const CUTOFF: f64 = 0.9;

type Kernel = [[i64; KERNEL_WIDTH]; PHASE_COUNT];

fn kernel() -> &'static Kernel {
    static KERNEL: OnceLock<Kernel> = OnceLock::new();
    KERNEL.get_or_init(build_kernel)
}

fn build_kernel() -> Kernel {
    let half = (KERNEL_WIDTH / 2) as f64;
    let mut table = [[0i64; KERNEL_WIDTH]; PHASE_COUNT];

    for (phase, row) in table.iter_mut().enumerate() {
        let frac = phase as f64 / PHASE_COUNT as f64;
        let mut taps = [0f64; KERNEL_WIDTH];
        for (i, tap) in taps.iter_mut().enumerate() {
            let d = i as f64 - half - frac + 1.0;
            if d.abs() >= half {
                continue;
            }
            let x = PI * CUTOFF * d;
            let sinc = if x == 0.0 { 1.0 } else { x.sin() / x };
            let w = 0.42 + 0.5 * (PI * d / half).cos() + 0.08 * (2.0 * PI * d / half).cos();
            *tap = sinc * w;
        }

        let sum: f64 = taps.iter().sum();
        let mut total = 0i64;
        for (out, tap) in row.iter_mut().zip(taps) {
            *out = (tap / sum * DELTA_UNIT as f64).round() as i64;
            total += *out;
        }
        // Every phase must integrate to exactly one unit step.
        let peak = (0..KERNEL_WIDTH).max_by_key(|&i| row[i]).unwrap_or(0);
        row[peak] += DELTA_UNIT - total;
    }
    table
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlipBuffer {
    clock_rate: u64,
    sample_rate: u32,
    factor: u64,
    offset: u64,
    integrator: i64,
    buf: Vec<i64>,
}

impl BlipBuffer {
    pub fn new(clock_rate: u64, sample_rate: u32) -> Self {
        let mut blip = Self {
            clock_rate: 1,
            sample_rate: 1,
            factor: 1,
            offset: 0,
            integrator: 0,
            buf: vec![0; KERNEL_WIDTH],
        };
        blip.set_rates(clock_rate, sample_rate);
        blip
    }

    fn factor_for(clock_rate: u64, sample_rate: u32) -> u64 {
        ((sample_rate as u64) << FRAC_BITS).div_ceil(clock_rate.max(1))
    }

    /// Takes effect for deltas added after the call; samples already
    /// committed keep their position.
    pub fn set_rates(&mut self, clock_rate: u64, sample_rate: u32) {
        self.clock_rate = clock_rate.max(1);
        self.sample_rate = sample_rate.max(1);
        self.factor = Self::factor_for(self.clock_rate, self.sample_rate);
    }

    pub fn clock_rate(&self) -> u64 {
        self.clock_rate
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn clear(&mut self) {
        self.offset = 0;
        self.integrator = 0;
        self.buf.clear();
        self.buf.resize(KERNEL_WIDTH, 0);
    }

    fn reserve_through(&mut self, index: usize) {
        let needed = index + KERNEL_WIDTH;
        if self.buf.len() < needed {
            self.buf.resize(needed, 0);
        }
    }

    /// `time` is in clocks relative to the start of the current frame.
    pub fn add_delta(&mut self, time: u32, delta: i32) {
        if delta == 0 {
            return;
        }
        let fixed = self.offset + time as u64 * self.factor;
        let index = (fixed >> FRAC_BITS) as usize;
        let phase = ((fixed >> (FRAC_BITS - PHASE_BITS)) as usize) & (PHASE_COUNT - 1);

        self.reserve_through(index);
        let delta = delta as i64;
        for (slot, tap) in self.buf[index..index + KERNEL_WIDTH]
            .iter_mut()
            .zip(kernel()[phase])
        {
            *slot += delta * tap;
        }
    }

    /// Closes the frame `time` clocks after its start.
    pub fn end_frame(&mut self, time: u32) {
        self.offset += time as u64 * self.factor;
        self.reserve_through(self.samples_avail());
    }

    pub fn samples_avail(&self) -> usize {
        (self.offset >> FRAC_BITS) as usize
    }

    /// Returns the number of samples written.
    pub fn read_samples(&mut self, out: &mut [i16]) -> usize {
        let count = out.len().min(self.samples_avail());
        for (dst, &src) in out.iter_mut().zip(&self.buf[..count]) {
            self.integrator += src;
            *dst = (self.integrator >> DELTA_BITS).clamp(i16::MIN as i64, i16::MAX as i64) as i16;
        }
        self.buf.drain(..count);
        self.reserve_through(0);
        self.offset -= (count as u64) << FRAC_BITS;
        count
    }

    pub fn read_all(&mut self) -> Vec<i16> {
        let mut out = vec![0; self.samples_avail()];
        let count = self.read_samples(&mut out);
        out.truncate(count);
        out
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.clock_rate > 0 && self.sample_rate > 0,
            "resampler rates must be non-zero"
        );
        ensure!(
            self.factor == Self::factor_for(self.clock_rate, self.sample_rate),
            "resampler step factor {} does not match {} Hz -> {} Hz",
            self.factor,
            self.clock_rate,
            self.sample_rate
        );
        ensure!(
            self.buf.len() >= self.samples_avail() + KERNEL_WIDTH,
            "resampler buffer holds {} slots but {} samples are pending",
            self.buf.len(),
            self.samples_avail()
        );
        Ok(())
    }
}
