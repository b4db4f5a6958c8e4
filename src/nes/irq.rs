use serde::{Deserialize, Serialize};

use super::a12::A12Edge;

/// CPU-side interrupt input driven by the cartridge.
pub trait InterruptLine {
    fn set_external(&mut self);
    fn clear_external(&mut self);
}

/// Cartridge IRQ input as seen by the CPU core, which polls `asserted()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuIrqLine {
    external: bool,
}

impl CpuIrqLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asserted(&self) -> bool {
        self.external
    }
}

impl InterruptLine for CpuIrqLine {
    fn set_external(&mut self) {
        self.external = true;
    }

    fn clear_external(&mut self) {
        self.external = false;
    }
}

/// When a counter that just reached zero raises the IRQ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FiringPolicy {
    /// MMC3C/Sharp: fire whenever the post-step counter is zero.
    #[default]
    Default,
    /// MMC3A/NEC: a counter reloaded to zero from zero stays silent unless
    /// the reload was forced through $C001.
    AlternateRevision,
}

/// A12 transition that clocks the counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockEdge {
    #[default]
    Rise,
    Fall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqPhase {
    Idle,
    Armed,
    Asserted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrqSnapshot {
    pub reload_value: u8,
    pub counter: u8,
    pub reload_pending: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ScanlineIrq {
    reload_value: u8,
    counter: u8,
    reload_pending: bool,
    enabled: bool,
    policy: FiringPolicy,
    edge: ClockEdge,
}

impl ScanlineIrq {
    pub fn new(policy: FiringPolicy, edge: ClockEdge) -> Self {
        Self {
            reload_value: 0,
            counter: 0,
            reload_pending: false,
            enabled: false,
            policy,
            edge,
        }
    }

    pub fn policy(&self) -> FiringPolicy {
        self.policy
    }

    pub fn clock_edge(&self) -> ClockEdge {
        self.edge
    }

    pub fn reload_value(&self) -> u8 {
        self.reload_value
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }

    pub fn reload_pending(&self) -> bool {
        self.reload_pending
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// $C000: the live counter is untouched until the next reload.
    pub fn write_latch(&mut self, value: u8) {
        self.reload_value = value;
    }

    /// $C001
    pub fn write_reload(&mut self) {
        self.counter = 0;
        self.reload_pending = true;
    }

    /// $E000: also acknowledges an IRQ that is already asserted.
    pub fn disable(&mut self, line: &mut dyn InterruptLine) {
        self.enabled = false;
        line.clear_external();
    }

    /// $E001
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Feeds one watcher result into the counter. Returns true when this
    /// edge asserted the interrupt line.
    pub fn clock(&mut self, edge: A12Edge, line: &mut dyn InterruptLine) -> bool {
        let qualifies = matches!(
            (self.edge, edge),
            (ClockEdge::Rise, A12Edge::Rise) | (ClockEdge::Fall, A12Edge::Fall)
        );
        if qualifies { self.step(line) } else { false }
    }

    fn step(&mut self, line: &mut dyn InterruptLine) -> bool {
        let before = self.counter;
        let forced = self.reload_pending;

        if self.counter == 0 || self.reload_pending {
            self.counter = self.reload_value;
        } else {
            self.counter -= 1;
        }
        self.reload_pending = false;

        let fire = self.enabled
            && self.counter == 0
            && match self.policy {
                FiringPolicy::Default => true,
                FiringPolicy::AlternateRevision => before > 0 || forced,
            };
        if fire {
            line.set_external();
        }
        fire
    }

    pub fn phase(&self, line_asserted: bool) -> IrqPhase {
        if line_asserted {
            IrqPhase::Asserted
        } else if self.enabled {
            IrqPhase::Armed
        } else {
            IrqPhase::Idle
        }
    }

    pub fn snapshot(&self) -> IrqSnapshot {
        IrqSnapshot {
            reload_value: self.reload_value,
            counter: self.counter,
            reload_pending: self.reload_pending,
            enabled: self.enabled,
        }
    }

    pub fn restore(&mut self, snapshot: &IrqSnapshot) {
        self.reload_value = snapshot.reload_value;
        self.counter = snapshot.counter;
        self.reload_pending = snapshot.reload_pending;
        self.enabled = snapshot.enabled;
    }
}
