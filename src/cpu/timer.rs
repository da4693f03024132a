//! Periodic timer (C9): drives preemption and sleep wake-ups off the PIT's
//! IRQ line. Generalizes the teacher crate's printing-only timer handler
//! into one that actually drives the scheduler.

use core::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use x86_64::instructions::port::Port;

use super::{
    idt::{IrqResult, IRQ_BASE},
    scheduler,
};
use crate::config::TIMER_FREQUENCY_HZ;

/// IRQ line (relative to [`IRQ_BASE`]) the legacy PIT is wired to.
pub const TIMER_IRQ_LINE: u8 = 0;

const PIT_FREQUENCY_HZ: u32 = 1_193_182;
const PIT_COMMAND_PORT: u16 = 0x43;
const PIT_CHANNEL_0_PORT: u16 = 0x40;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program the PIT to fire at [`TIMER_FREQUENCY_HZ`] and install the tick
/// handler on the timer's IRQ line.
pub fn init() {
    let divisor = (PIT_FREQUENCY_HZ / TIMER_FREQUENCY_HZ).max(1);
    // SAFETY: 0x43/0x40 are the standard PIT command/channel-0 ports; this
    // sequence (mode command, then low byte, then high byte) matches the
    // PIT's documented programming sequence.
    unsafe {
        let mut command: Port<u8> = Port::new(PIT_COMMAND_PORT);
        let mut channel0: Port<u8> = Port::new(PIT_CHANNEL_0_PORT);
        command.write(0x36_u8);
        #[expect(clippy::cast_possible_truncation, reason = "intentional 16->8 bit split")]
        channel0.write((divisor & 0xff) as u8);
        #[expect(clippy::cast_possible_truncation, reason = "intentional 16->8 bit split")]
        channel0.write(((divisor >> 8) & 0xff) as u8);
    }
    super::idt::install_irq_handler(IRQ_BASE + TIMER_IRQ_LINE, 0, "pit-timer", on_tick);
}

fn on_tick(_line: u8) -> IrqResult {
    let tick = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    let preempted = scheduler::on_timer_tick(tick);
    if preempted {
        trace!(target: "timer", "quantum expired at tick {tick}");
    }
    IrqResult::Handled
}

/// Ticks elapsed since [`init`].
#[must_use]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Block the calling thread until at least `ms` milliseconds have passed.
pub fn sleep(ms: u64) {
    let ticks_to_wait = ms.saturating_mul(u64::from(TIMER_FREQUENCY_HZ)) / 1000;
    let wake_tick = ticks().saturating_add(ticks_to_wait.max(1));
    scheduler::sleep_running_thread(wake_tick);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ticks_start_at_some_baseline_and_are_monotonic() {
        let before = ticks();
        TICKS.fetch_add(1, Ordering::Relaxed);
        assert!(ticks() > before);
    }
}
