//! PIT channel 0 at 100 Hz. The tick counter feeds get_ticks/sleep and the
//! scheduler's time slicing.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::Port;

pub const TIMER_HZ: u32 = 100;

const PIT_BASE_HZ: u32 = 1_193_182;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    let divisor = (PIT_BASE_HZ / TIMER_HZ) as u16;
    let mut command = Port::new(PIT_COMMAND);
    let mut channel0 = Port::new(PIT_CHANNEL0);
    // Channel 0, lobyte/hibyte, rate generator.
    command.write(0x36);
    channel0.write((divisor & 0xFF) as u8);
    channel0.write((divisor >> 8) as u8);
    crate::log_info!("PIT programmed to {} Hz.", TIMER_HZ);
}

/// Called once per timer interrupt; returns the new tick count.
pub fn increment() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Ticks since boot.
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}
