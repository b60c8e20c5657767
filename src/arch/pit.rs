//! Programmable Interval Timer: the system tick source (`spec.md` §4's
//! component N, "100 Hz scheduler tick").
//!
//! Grounded on the teacher's `arch::x86_64::pit`, which programs channel 0
//! in mode 3 (square wave) via the same 8253/8254 port layout; this module
//! keeps the divisor arithmetic and port sequence identical, since the PIT
//! itself is unchanged between 32- and 64-bit PCs.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::cpu::outb;

const PIT_BASE_FREQUENCY: u32 = 1_193_182;
const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_MODE3_SQUARE_WAVE: u8 = 0x36;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Programs channel 0 for `hz` interrupts per second and registers the tick
/// handler on [`crate::arch::idt::VECTOR_TIMER`].
///
/// # Safety
/// Must run after the IDT and APIC are initialized.
pub unsafe fn init(hz: u32) {
    let divisor = (PIT_BASE_FREQUENCY / hz).clamp(1, 0xFFFF) as u16;
    outb(PIT_COMMAND, PIT_MODE3_SQUARE_WAVE);
    outb(PIT_CHANNEL0_DATA, (divisor & 0xFF) as u8);
    outb(PIT_CHANNEL0_DATA, (divisor >> 8) as u8);
    crate::arch::idt::set_irq_handler(crate::arch::idt::VECTOR_TIMER, on_tick);
}

fn on_tick(_frame: &mut crate::arch::TrapFrame) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::scheduler::on_timer_tick();
}

/// Number of ticks since boot, the kernel's monotonic clock (`spec.md` §3:
/// "Tick Counter"; used by the sleep list and `sys_sleep`).
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_at_100hz_matches_classic_value() {
        let divisor = PIT_BASE_FREQUENCY / 100;
        assert_eq!(divisor, 11931);
    }
}
