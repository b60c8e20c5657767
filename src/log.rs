//! Serial-backed `log` implementation and boot banner.
//!
//! Grounded on the teacher's `log` module, which implements `log::Log` over
//! its serial port and prints a banner embedding `build.rs`-generated
//! version metadata; kept nearly verbatim since logging infrastructure is
//! architecture-independent.

use core::fmt::Write;
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::arch::serial::SERIAL1;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level_tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let restore = crate::arch::interrupt_disable();
        let mut port = SERIAL1.lock();
        let _ = writeln!(port, "[{:>9}] {} {}", crate::arch::pit::ticks(), level_tag, record.args());
        drop(port);
        crate::arch::set_interrupt_state(restore);
    }

    fn flush(&self) {}
}

/// Installs the serial logger at the given level filter. Must run once,
/// very early in `boot::start`, before any `log::info!` et al. call.
pub fn init(level: LevelFilter) {
    log::set_logger(&LOGGER).expect("logger already initialized");
    log::set_max_level(level);
}

/// Prints the one-time boot banner, pulling commit/dirty/timestamp metadata
/// embedded by `build.rs` via `option_env!` (absent outside a git checkout,
/// e.g. a tarball build — falls back to placeholders rather than failing).
pub fn boot_banner() {
    let commit = option_env!("GIT_COMMIT").unwrap_or("unknown");
    let dirty = option_env!("GIT_DIRTY").unwrap_or("0") != "0";
    let built = option_env!("BUILD_TIMESTAMP").unwrap_or("0");
    log::info!(
        "talon-kernel {} ({}{}) built @{}",
        env!("CARGO_PKG_VERSION"),
        commit,
        if dirty { "-dirty" } else { "" },
        built
    );
}

/// Writes one byte to the console for `sys_write`'s stdout/stderr path
/// (`spec.md` §6). The teaching kernel's "console" is the same serial port
/// logging uses; a dedicated VGA text-mode console is out of scope
/// (`spec.md` §1 Deliberately out of scope: "Console text rendering").
pub fn console_putc(byte: u8) {
    let restore = crate::arch::interrupt_disable();
    let mut port = SERIAL1.lock();
    port.send(byte);
    drop(port);
    crate::arch::set_interrupt_state(restore);
}
