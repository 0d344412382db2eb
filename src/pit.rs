// Programmable Interval Timer: channel 0 drives the scheduler tick.

use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::instructions::port::Port;

const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// The PIT's input clock in Hz.
const PIT_BASE_FREQUENCY: u32 = 1_193_182;

/// Scheduler tick rate.
pub const TIMER_HZ: u32 = 100;

/// Ticks since boot, incremented once per timer interrupt.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Divisor for the requested frequency, rounded to nearest.
fn divisor_for(frequency: u32) -> u16 {
    let mut divisor = PIT_BASE_FREQUENCY / frequency;
    if PIT_BASE_FREQUENCY % frequency > frequency / 2 {
        divisor += 1;
    }
    divisor as u16
}

/// Program channel 0 as a rate generator at `frequency` Hz.
pub fn init(frequency: u32) {
    let divisor = divisor_for(frequency);

    unsafe {
        // 0x36: channel 0, lobyte/hibyte access, mode 2 (rate generator),
        // 16-bit binary.
        Port::<u8>::new(PIT_COMMAND).write(0x36);

        let mut data = Port::<u8>::new(PIT_CHANNEL0_DATA);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }

    crate::log!("PIT programmed at {} Hz (divisor {})", frequency, divisor);
}

/// Called from the scheduler on every timer interrupt.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_rounds_to_nearest() {
        // 1193182 / 100 = 11931.82 -> 11932
        assert_eq!(divisor_for(100), 11932);
        // Exact division stays put.
        assert_eq!(divisor_for(PIT_BASE_FREQUENCY), 1);
        // 1193182 / 1000 = 1193.182 -> rounds down
        assert_eq!(divisor_for(1000), 1193);
    }

    #[test]
    fn tick_counter_is_monotonic() {
        let before = ticks();
        tick();
        tick();
        assert!(ticks() >= before + 2);
    }
}
