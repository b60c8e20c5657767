//! COM1 serial console, the kernel's only output device before (and after)
//! any storage driver comes up.
//!
//! Grounded on the teacher's `arch::x86_64::serial`, a thin `spin::Mutex`
//! wrapper around `uart_16550::SerialPort` — kept as-is since the UART is
//! identical hardware regardless of CPU mode.

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

const COM1_BASE: u16 = 0x3F8;

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(COM1_BASE) };
        port.init();
        Mutex::new(port)
    };
}

/// Writes `args` to COM1 with interrupts held off for the duration, so a
/// timer tick can't interleave a partial log line from another context.
pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    let restore = crate::arch::interrupt_disable();
    let _ = SERIAL1.lock().write_fmt(args);
    crate::arch::set_interrupt_state(restore);
}

/// Prints a line to the serial console, matching the teacher's `serial_println!`.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::arch::serial::write_fmt(format_args!("\n")));
    ($($arg:tt)*) => ($crate::arch::serial::write_fmt(format_args!("{}\n", format_args!($($arg)*))));
}
