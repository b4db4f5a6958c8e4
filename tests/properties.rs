//! Property-based tests for register decoding, the scanline counter and the
//! mixer's event buffers.

use cartmix::nes::a12::{A12Edge, A12Watcher};
use cartmix::nes::irq::{ClockEdge, CpuIrqLine, FiringPolicy, ScanlineIrq};
use cartmix::nes::mapper::{PowerOnRng, RegisterSlot};
use cartmix::nes::mixer::{CYCLE_LENGTH, ChannelEventBuffer};
use proptest::prelude::*;

fn policy() -> impl Strategy<Value = FiringPolicy> {
    prop_oneof![
        Just(FiringPolicy::Default),
        Just(FiringPolicy::AlternateRevision)
    ]
}

proptest! {
    #[test]
    fn every_rom_address_decodes_to_its_masked_slot(addr in 0x8000u16..=0xFFFF) {
        let slot = RegisterSlot::decode(addr);
        prop_assert!(slot.is_some());
        let slot = slot.unwrap();
        prop_assert_eq!(slot.base_address(), addr & RegisterSlot::MASK);
        prop_assert_eq!(RegisterSlot::decode(addr & RegisterSlot::MASK), Some(slot));
    }

    #[test]
    fn addresses_below_rom_never_decode(addr in 0u16..0x8000) {
        prop_assert_eq!(RegisterSlot::decode(addr), None);
    }

    #[test]
    fn disabled_counter_never_asserts(
        policy in policy(),
        latch in any::<u8>(),
        reloads in proptest::collection::vec(any::<bool>(), 0..600),
    ) {
        let mut irq = ScanlineIrq::new(policy, ClockEdge::Rise);
        let mut line = CpuIrqLine::new();
        irq.write_latch(latch);
        for reload in reloads {
            if reload {
                irq.write_reload();
            }
            prop_assert!(!irq.clock(A12Edge::Rise, &mut line));
        }
        prop_assert!(!line.asserted());
    }

    #[test]
    fn reload_edge_loads_latch(
        policy in policy(),
        latch in any::<u8>(),
        warmup in 0usize..20,
    ) {
        let mut irq = ScanlineIrq::new(policy, ClockEdge::Rise);
        let mut line = CpuIrqLine::new();
        irq.write_latch(latch.wrapping_add(3));
        irq.write_reload();
        for _ in 0..warmup {
            irq.clock(A12Edge::Rise, &mut line);
        }

        irq.write_latch(latch);
        irq.write_reload();
        irq.clock(A12Edge::Rise, &mut line);
        prop_assert_eq!(irq.counter(), latch);
        prop_assert!(!irq.reload_pending());
    }

    #[test]
    fn counter_at_zero_reloads_on_next_edge(latch in 1u8..=255) {
        let mut irq = ScanlineIrq::new(FiringPolicy::Default, ClockEdge::Rise);
        let mut line = CpuIrqLine::new();
        irq.write_latch(latch);
        irq.write_reload();
        for _ in 0..=latch {
            irq.clock(A12Edge::Rise, &mut line);
        }
        prop_assert_eq!(irq.counter(), 0);
        irq.clock(A12Edge::Rise, &mut line);
        prop_assert_eq!(irq.counter(), latch);
    }

    #[test]
    fn short_low_pulses_never_rise(gaps in proptest::collection::vec(1u32..8, 1..64)) {
        let mut watcher = A12Watcher::default();
        let mut cycle = 1_000;
        watcher.observe(0x1000, cycle);
        for gap in gaps {
            prop_assert_ne!(watcher.observe(0x0000, cycle), A12Edge::Rise);
            cycle += gap;
            prop_assert_eq!(watcher.observe(0x1000, cycle), A12Edge::None);
            cycle += 1;
        }
    }

    #[test]
    fn buffered_timestamps_stay_ordered_and_in_cycle(
        times in proptest::collection::vec(0u32..30_000, 0..200),
    ) {
        let mut buffer = ChannelEventBuffer::default();
        for (i, time) in times.iter().enumerate() {
            buffer.push(*time, i as i16);
        }
        let events = buffer.events();
        prop_assert_eq!(events.len(), times.len());
        prop_assert!(events.windows(2).all(|w| w[0].0 <= w[1].0));
        prop_assert!(events.iter().all(|&(t, _)| t < CYCLE_LENGTH));
        prop_assert!(events.iter().enumerate().all(|(i, &(_, d))| d == i as i16));
    }

    #[test]
    fn power_on_bytes_depend_only_on_seed(seed in any::<u64>()) {
        let mut a = PowerOnRng::new(seed);
        let mut b = PowerOnRng::new(seed);
        let left: Vec<u8> = (0..16).map(|_| a.next_byte()).collect();
        let right: Vec<u8> = (0..16).map(|_| b.next_byte()).collect();
        prop_assert_eq!(left, right);
    }
}
