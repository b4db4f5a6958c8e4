use std::cell::RefCell;
#[cfg(feature = "host-audio")]
use std::collections::VecDeque;
use std::rc::Rc;
#[cfg(feature = "host-audio")]
use std::sync::{Arc, Mutex};

#[cfg(feature = "host-audio")]
use anyhow::{Context, Result, anyhow};
#[cfg(feature = "host-audio")]
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

/// Sink for finished interleaved stereo PCM.
///
/// `play` receives ownership of the block; `sample_count` is in stereo frames.
pub trait AudioDevice {
    fn play(&mut self, buffer: Vec<i16>, sample_count: usize, sample_rate: u32);
    fn stop(&mut self, clear_buffer: bool);
}

/// Owns the currently registered output device, if any.
#[derive(Default)]
pub struct AudioContext {
    device: Option<Box<dyn AudioDevice>>,
    delivered_frames: u64,
    discarded_frames: u64,
}

impl AudioContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `device` and hands back the one it replaces.
    pub fn register_device(
        &mut self,
        device: Box<dyn AudioDevice>,
    ) -> Option<Box<dyn AudioDevice>> {
        self.device.replace(device)
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn delivered_frames(&self) -> u64 {
        self.delivered_frames
    }

    pub fn discarded_frames(&self) -> u64 {
        self.discarded_frames
    }

    pub fn deliver(&mut self, buffer: Vec<i16>, sample_count: usize, sample_rate: u32) {
        match &mut self.device {
            Some(device) => {
                self.delivered_frames += sample_count as u64;
                device.play(buffer, sample_count, sample_rate);
            }
            None => self.discarded_frames += sample_count as u64,
        }
    }

    pub fn stop_audio(&mut self, clear_buffer: bool) {
        if let Some(device) = &mut self.device {
            device.stop(clear_buffer);
        }
    }

    /// Stops and releases the device.
    pub fn teardown(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop(true);
        }
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// In-memory device that keeps every delivered sample.
pub struct CaptureDevice {
    shared: Rc<RefCell<CaptureState>>,
}

#[derive(Default)]
struct CaptureState {
    samples: Vec<i16>,
    block_rates: Vec<u32>,
    sample_rate: u32,
    stopped: bool,
}

/// Read side of a [`CaptureDevice`] that stays with the caller.
#[derive(Clone)]
pub struct CaptureHandle {
    shared: Rc<RefCell<CaptureState>>,
}

impl CaptureDevice {
    pub fn new() -> (Self, CaptureHandle) {
        let shared = Rc::new(RefCell::new(CaptureState::default()));
        (
            Self {
                shared: Rc::clone(&shared),
            },
            CaptureHandle { shared },
        )
    }
}

impl AudioDevice for CaptureDevice {
    fn play(&mut self, buffer: Vec<i16>, _sample_count: usize, sample_rate: u32) {
        let mut state = self.shared.borrow_mut();
        state.samples.extend(buffer);
        state.block_rates.push(sample_rate);
        state.sample_rate = sample_rate;
        state.stopped = false;
    }

    fn stop(&mut self, clear_buffer: bool) {
        let mut state = self.shared.borrow_mut();
        state.stopped = true;
        if clear_buffer {
            state.samples.clear();
        }
    }
}

impl CaptureHandle {
    pub fn samples(&self) -> Vec<i16> {
        self.shared.borrow().samples.clone()
    }

    pub fn blocks(&self) -> usize {
        self.shared.borrow().block_rates.len()
    }

    /// Rate each delivered block was labelled with, in delivery order.
    pub fn block_rates(&self) -> Vec<u32> {
        self.shared.borrow().block_rates.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.borrow().sample_rate
    }

    pub fn stopped(&self) -> bool {
        self.shared.borrow().stopped
    }

    pub fn clear(&self) {
        let mut state = self.shared.borrow_mut();
        state.samples.clear();
        state.block_rates.clear();
    }
}

#[cfg(feature = "host-audio")]
/// Default host output through cpal. Frames are queued for the callback
/// thread; the oldest are dropped once the queue exceeds ~96 ms.
pub struct CpalDevice {
    queue: Arc<Mutex<VecDeque<[i16; 2]>>>,
    stream: cpal::Stream,
    sample_rate: u32,
    max_queue_frames: usize,
    playing: bool,
    warned_rate: Option<u32>,
}

#[cfg(feature = "host-audio")]
impl CpalDevice {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default audio output device"))?;
        let supported = device
            .default_output_config()
            .context("failed to query default audio config")?;

        let stream_config: cpal::StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        let max_queue_frames = ((sample_rate as usize) * 96) / 1000;
        let queue = Arc::new(Mutex::new(VecDeque::<[i16; 2]>::with_capacity(
            max_queue_frames,
        )));

        let err_fn = |err| {
            eprintln!("audio stream error: {err}");
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _| {
                        fill_output(data, channels, &queue, |s| s as f32 / i16::MAX as f32)
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::I16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _| fill_output(data, channels, &queue, |s| s),
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::U16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [u16], _| {
                        fill_output(data, channels, &queue, |s| (s as i32 + 0x8000) as u16)
                    },
                    err_fn,
                    None,
                )?
            }
            other => {
                return Err(anyhow!("unsupported audio sample format: {other:?}"));
            }
        };

        stream
            .play()
            .context("failed to start audio output stream")?;

        Ok(Self {
            queue,
            stream,
            sample_rate,
            max_queue_frames,
            playing: true,
            warned_rate: None,
        })
    }

    /// Rate the host runs at; configure the mixer to match.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[cfg(feature = "host-audio")]
impl AudioDevice for CpalDevice {
    fn play(&mut self, buffer: Vec<i16>, sample_count: usize, sample_rate: u32) {
        if sample_rate != self.sample_rate && self.warned_rate != Some(sample_rate) {
            eprintln!(
                "audio: mixer produces {sample_rate} Hz but device runs at {} Hz",
                self.sample_rate
            );
            self.warned_rate = Some(sample_rate);
        }
        if !self.playing {
            match self.stream.play() {
                Ok(()) => self.playing = true,
                Err(err) => eprintln!("audio: failed to resume stream: {err}"),
            }
        }
        if sample_count == 0 {
            return;
        }

        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        let future_len = queue.len().saturating_add(sample_count);
        if future_len > self.max_queue_frames {
            let drop_count = future_len - self.max_queue_frames;
            queue.drain(..drop_count.min(queue.len()));
        }
        queue.extend(buffer.chunks_exact(2).map(|frame| [frame[0], frame[1]]));
    }

    fn stop(&mut self, clear_buffer: bool) {
        if clear_buffer {
            if let Ok(mut queue) = self.queue.lock() {
                queue.clear();
            }
        }
        if self.playing {
            if let Err(err) = self.stream.pause() {
                eprintln!("audio: failed to pause stream: {err}");
            }
            self.playing = false;
        }
    }
}

#[cfg(feature = "host-audio")]
fn next_frame(queue: &Arc<Mutex<VecDeque<[i16; 2]>>>) -> [i16; 2] {
    if let Ok(mut q) = queue.lock() {
        q.pop_front().unwrap_or([0, 0])
    } else {
        [0, 0]
    }
}

#[cfg(feature = "host-audio")]
fn fill_output<T: Copy>(
    data: &mut [T],
    channels: usize,
    queue: &Arc<Mutex<VecDeque<[i16; 2]>>>,
    convert: impl Fn(i16) -> T,
) {
    for frame in data.chunks_mut(channels.max(1)) {
        let [left, right] = next_frame(queue);
        let mid = ((left as i32 + right as i32) / 2) as i16;
        for (ch, out) in frame.iter_mut().enumerate() {
            *out = convert(match (channels, ch) {
                (1, _) => mid,
                (_, 0) => left,
                (_, 1) => right,
                _ => mid,
            });
        }
    }
}
