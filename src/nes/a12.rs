//! PPU A12 edge detection for scanline-counting cartridges.
//!
//! MMC3-family boards clock their IRQ counter off bit 12 of the PPU address
//! bus. Sprite pattern fetches pulse the line in quick succession, so a rise
//! only counts once the line has been held low for a minimum time.

use serde::{Deserialize, Serialize};

/// Minimum low time, in PPU cycles, before a rise is reported.
pub const DEFAULT_DEGLITCH_CYCLES: u32 = 8;
/// PPU cycles per NTSC frame (341 dots x 262 lines).
pub const NTSC_FRAME_CYCLES: u32 = 341 * 262;
/// PPU cycles per PAL/Dendy frame (341 dots x 312 lines).
pub const PAL_FRAME_CYCLES: u32 = 341 * 312;

const A12_MASK: u16 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum A12Edge {
    None,
    Rise,
    Fall,
}

/// Serialized watcher state. Threshold and frame length are board config and
/// are not part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct A12Snapshot {
    pub last_addr: u16,
    pub last_cycle: u32,
    pub cycles_down: u32,
}

#[derive(Debug, Clone)]
pub struct A12Watcher {
    last_addr: u16,
    last_cycle: u32,
    // 0 while the line is high; otherwise 1 + PPU cycles spent low.
    cycles_down: u32,
    frame_len: u32,
    deglitch: u32,
}

impl Default for A12Watcher {
    fn default() -> Self {
        Self::new(NTSC_FRAME_CYCLES, DEFAULT_DEGLITCH_CYCLES)
    }
}

impl A12Watcher {
    pub fn new(frame_len: u32, deglitch: u32) -> Self {
        Self {
            last_addr: 0,
            last_cycle: 0,
            cycles_down: 0,
            frame_len: frame_len.max(1),
            deglitch,
        }
    }

    pub fn deglitch_cycles(&self) -> u32 {
        self.deglitch
    }

    pub fn frame_len(&self) -> u32 {
        self.frame_len
    }

    pub fn set_frame_len(&mut self, frame_len: u32) {
        self.frame_len = frame_len.max(1);
    }

    /// Samples the PPU bus and classifies the A12 transition.
    ///
    /// `frame_cycle` counts PPU cycles within the current frame and wraps to 0
    /// at the next one; low time spanning the wrap is still accumulated.
    pub fn observe(&mut self, addr: u16, frame_cycle: u32) -> A12Edge {
        if self.cycles_down > 0 {
            let elapsed = if frame_cycle < self.last_cycle {
                self.frame_len.saturating_sub(self.last_cycle) + frame_cycle
            } else {
                frame_cycle - self.last_cycle
            };
            self.cycles_down = self.cycles_down.saturating_add(elapsed);
        }

        let edge = if addr & A12_MASK == 0 {
            if self.cycles_down == 0 {
                self.cycles_down = 1;
                A12Edge::Fall
            } else {
                A12Edge::None
            }
        } else {
            let edge = if self.cycles_down > self.deglitch {
                A12Edge::Rise
            } else {
                A12Edge::None
            };
            self.cycles_down = 0;
            edge
        };

        self.last_addr = addr;
        self.last_cycle = frame_cycle;
        edge
    }

    pub fn line_high(&self) -> bool {
        self.cycles_down == 0
    }

    pub fn snapshot(&self) -> A12Snapshot {
        A12Snapshot {
            last_addr: self.last_addr,
            last_cycle: self.last_cycle,
            cycles_down: self.cycles_down,
        }
    }

    pub fn restore(&mut self, snapshot: &A12Snapshot) {
        self.last_addr = snapshot.last_addr;
        self.last_cycle = snapshot.last_cycle;
        self.cycles_down = snapshot.cycles_down;
    }
}
