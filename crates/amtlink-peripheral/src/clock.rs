use core::time::Duration;

use amtlink_common::time::{Clock, TimeDiff};
use stm32f4xx_hal::pac::{DCB, DWT};
use stm32f4xx_hal::rcc::Clocks;

/// Monotonic clock backed by the Cortex-M cycle counter. The counter is
/// 32 bits wide and wraps within seconds at full speed, which is fine
/// here: every wait in the driver is microseconds long, and the wrap is
/// handled by the signed difference in [`diff`](Clock::diff).
#[derive(Clone)]
pub struct DwtClock {
    clock_freq: u32,
}

#[derive(Clone, Copy)]
pub struct DwtInstant {
    cycles: u32,
}

impl DwtClock {
    pub fn new(clocks: &Clocks, dcb: &mut DCB, dwt: &mut DWT) -> Self {
        dcb.enable_trace();
        dwt.enable_cycle_counter();

        Self {
            clock_freq: clocks.sysclk().raw(),
        }
    }

    fn cycles_to_nanos(&self, cycles: u32) -> u64 {
        cycles as u64 * 1_000_000_000u64 / self.clock_freq as u64
    }
}

impl Clock for DwtClock {
    type TInstant = DwtInstant;

    fn current_instant(&self) -> Self::TInstant {
        DwtInstant {
            cycles: DWT::cycle_count(),
        }
    }

    fn diff(&self, newer: Self::TInstant, older: Self::TInstant) -> TimeDiff {
        let d = newer.cycles.wrapping_sub(older.cycles) as i32;
        if d >= 0 {
            TimeDiff::Forward(Duration::from_nanos(self.cycles_to_nanos(d as u32)))
        } else {
            TimeDiff::Backward(Duration::from_nanos(self.cycles_to_nanos(d.unsigned_abs())))
        }
    }
}
